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

//! Wires the controllers, executor machine, message plumbing and ingress
//! into one runnable service.

use crate::edgetask::config::TaskManagerConfig;
use crate::edgetask::controller::configupdate::ConfigUpdateController;
use crate::edgetask::controller::prepull::PrePullController;
use crate::edgetask::controller::registry::ControllerRegistry;
use crate::edgetask::controller::upgrade::UpgradeController;
use crate::edgetask::controller::TaskMessage;
use crate::edgetask::executor::ExecutorMachine;
use crate::edgetask::k8s::store::{NodeLister, ObjectStore};
use crate::edgetask::logger::{log_error, log_info};
use crate::edgetask::messaging::downstream::DownstreamSender;
use crate::edgetask::messaging::upstream::UpstreamRouter;
use crate::edgetask::messaging::{Message, MessageBus};
use crate::edgetask::observability::tracing::with_span;
use crate::edgetask::server;
use crate::edgetask::util::error::with_context;
use std::error::Error;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

pub struct TaskManager {
    config: TaskManagerConfig,
    bus: Arc<MessageBus>,
    registry: Arc<ControllerRegistry>,
    machine: Arc<ExecutorMachine>,
    router: Arc<UpstreamRouter>,
    messages: mpsc::Receiver<TaskMessage>,
    commands: mpsc::Receiver<Message>,
}

/// Handles to a started task manager.
pub struct RunningTaskManager {
    pub bus: Arc<MessageBus>,
    pub registry: Arc<ControllerRegistry>,
    pub machine: Arc<ExecutorMachine>,
    tasks: JoinSet<()>,
}

impl RunningTaskManager {
    /// Waits for every background loop to exit.
    pub async fn wait(mut self) {
        while let Some(result) = self.tasks.join_next().await {
            if let Err(err) = result {
                let error_text = err.to_string();
                log_error(
                    "taskmanager",
                    "Background task failed",
                    &[("error", error_text.as_str())],
                );
            }
        }
    }
}

impl TaskManager {
    pub fn new(
        config: TaskManagerConfig,
        store: Arc<dyn ObjectStore>,
        nodes: Arc<dyn NodeLister>,
    ) -> Self {
        let bus = Arc::new(MessageBus::new(config.bus_buffer));
        let (message_tx, messages) = mpsc::channel(config.message_buffer.max(1));
        let (command_tx, commands) = mpsc::channel(config.message_buffer.max(1));

        let registry = Arc::new(ControllerRegistry::new());
        registry.register(Arc::new(UpgradeController::new(
            Arc::clone(&store),
            Arc::clone(&nodes),
            message_tx.clone(),
            config.cache_buffer,
        )));
        registry.register(Arc::new(PrePullController::new(
            Arc::clone(&store),
            Arc::clone(&nodes),
            message_tx.clone(),
            config.cache_buffer,
        )));
        registry.register(Arc::new(ConfigUpdateController::new(
            store,
            nodes,
            message_tx,
            config.cache_buffer,
        )));

        let machine = Arc::new(ExecutorMachine::new(Arc::clone(&registry), command_tx));
        let router = Arc::new(UpstreamRouter::new(
            Arc::clone(&bus),
            Arc::clone(&registry),
            config.upstream_workers,
        ));
        Self {
            config,
            bus,
            registry,
            machine,
            router,
            messages,
            commands,
        }
    }

    pub fn bus(&self) -> Arc<MessageBus> {
        Arc::clone(&self.bus)
    }

    /// Starts the controllers, failing fast, then the background loops.
    /// The HTTP ingress is not started; see [`TaskManager::run`].
    pub async fn start(
        self,
        shutdown: CancellationToken,
    ) -> Result<RunningTaskManager, Box<dyn Error + Send + Sync>> {
        let names = self.registry.names().join(",");
        log_info(
            "taskmanager",
            "Starting controllers",
            &[("controllers", names.as_str())],
        );
        self.registry
            .start_all(&shutdown)
            .await
            .map_err(|err| with_context(err, "failed to start controllers"))?;

        let mut tasks = JoinSet::new();
        tasks.spawn(with_span(
            "taskmanager",
            "executor-machine",
            Arc::clone(&self.machine).run(self.messages, shutdown.clone()),
        ));
        tasks.spawn(with_span(
            "taskmanager",
            "downstream",
            DownstreamSender::new(Arc::clone(&self.bus)).run(self.commands, shutdown.clone()),
        ));
        tasks.spawn(Arc::clone(&self.router).run(shutdown.clone()));

        Ok(RunningTaskManager {
            bus: self.bus,
            registry: self.registry,
            machine: self.machine,
            tasks,
        })
    }

    /// Runs everything, including the status ingress, until `shutdown`.
    pub async fn run(self, shutdown: CancellationToken) -> Result<(), Box<dyn Error + Send + Sync>> {
        let listener = server::bind(self.config.listen).await?;
        let router = server::build_router(self.bus());
        let running = self.start(shutdown.clone()).await?;
        let served = server::serve(listener, router, shutdown.clone()).await;
        shutdown.cancel();
        running.wait().await;
        log_info("taskmanager", "Task manager stopped", &[]);
        served
    }
}
