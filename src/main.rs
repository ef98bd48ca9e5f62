/*
 * Copyright (C) 2024 The Edgetask Authors
 *
 * Licensed under the Apache License, Version 2.0 (the "License");
 * you may not use this file except in compliance with the License.
 * You may obtain a copy of the License at
 *
 * http://www.apache.org/licenses/LICENSE-2.0
 *
 * Unless required by applicable law or agreed to in writing, software
 * distributed under the License is distributed on an "AS IS" BASIS,
 * WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 * See the License for the specific language governing permissions and
 * limitations under the License.
 */

use clap::{Args, Parser, Subcommand};
use edgetask::edgetask::config::TaskManagerConfig;
use edgetask::edgetask::k8s::seed::Seed;
use edgetask::edgetask::k8s::store::InMemoryStore;
use edgetask::edgetask::logger::{
    log_error, log_info, set_log_format, set_min_level, LogFormat, LogLevel,
};
use edgetask::edgetask::messaging::downstream::log_cloud_hub;
use edgetask::edgetask::observability;
use edgetask::edgetask::taskmanager::TaskManager;
use edgetask::edgetask::util::error::with_context;
use std::error::Error;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Node-task orchestrator for edge fleets.
#[derive(Parser)]
#[command(name = env!("CARGO_PKG_NAME"))]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = env!("CARGO_PKG_DESCRIPTION"))]
struct EdgeTask {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the task manager over an in-memory store
    Serve(ServeArgs),
}

#[derive(Args)]
struct ServeArgs {
    /// Address for the status ingress (e.g. 0.0.0.0:10002)
    #[arg(long)]
    listen: Option<SocketAddr>,

    /// Log output format: text or json
    #[arg(long, value_parser = parse_format)]
    log_format: Option<LogFormat>,

    /// Minimum log level: debug, info, warn or error
    #[arg(long, value_parser = parse_level)]
    log_level: Option<LogLevel>,

    /// Workers draining agent status reports
    #[arg(long)]
    upstream_workers: Option<usize>,

    /// JSON file of nodes and jobs to load into the store at startup
    #[arg(long)]
    seed: Option<PathBuf>,

    /// Do not log cloud hub commands; another consumer drains the topic
    #[arg(long)]
    no_hub_log: bool,
}

fn parse_format(value: &str) -> Result<LogFormat, String> {
    LogFormat::parse(value).ok_or_else(|| format!("unknown log format '{}'", value))
}

fn parse_level(value: &str) -> Result<LogLevel, String> {
    LogLevel::parse(value).ok_or_else(|| format!("unknown log level '{}'", value))
}

fn resolve_config(args: &ServeArgs) -> TaskManagerConfig {
    let mut config = TaskManagerConfig::from_env();
    if let Some(listen) = args.listen {
        config.listen = listen;
    }
    if let Some(format) = args.log_format {
        config.log_format = format;
    }
    if let Some(level) = args.log_level {
        config.log_level = level;
    }
    if let Some(workers) = args.upstream_workers.filter(|workers| *workers > 0) {
        config.upstream_workers = workers;
    }
    config
}

fn load_seed(path: &Path, store: &InMemoryStore) -> Result<usize, Box<dyn Error + Send + Sync>> {
    let context = format!("failed to load seed {}", path.display());
    let raw = std::fs::read_to_string(path).map_err(|err| with_context(err, context.clone()))?;
    let seed = Seed::parse(&raw).map_err(|err| with_context(err, context.clone()))?;
    seed.apply(store).map_err(|err| with_context(err, context))
}

async fn serve(args: ServeArgs) -> ExitCode {
    let config = resolve_config(&args);
    set_log_format(config.log_format);
    set_min_level(config.log_level);
    observability::tracing::init();

    let listen = config.listen.to_string();
    log_info("main", "Starting edgetask", &[("listen", listen.as_str())]);

    let store = Arc::new(InMemoryStore::default());
    if let Some(path) = &args.seed {
        match load_seed(path, &store) {
            Ok(jobs) => {
                let jobs_text = jobs.to_string();
                log_info("main", "Seed loaded", &[("jobs", jobs_text.as_str())]);
            }
            Err(err) => {
                let error_text = err.to_string();
                log_error("main", "edgetask failed", &[("error", error_text.as_str())]);
                return ExitCode::FAILURE;
            }
        }
    }
    let manager = TaskManager::new(config, store.clone(), store);
    let shutdown = CancellationToken::new();
    if !args.no_hub_log {
        tokio::spawn(log_cloud_hub(manager.bus(), shutdown.clone()));
    }
    let signal = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            log_info("main", "Interrupt received; shutting down", &[]);
        }
        signal.cancel();
    });

    match manager.run(shutdown).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            let error_text = err.to_string();
            log_error("main", "edgetask failed", &[("error", error_text.as_str())]);
            ExitCode::FAILURE
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = EdgeTask::parse();
    match cli.command {
        Commands::Serve(args) => serve(args).await,
    }
}
