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

use crate::edgetask::logger::{log_warn, LogFormat, LogLevel};
use std::env;
use std::net::SocketAddr;

/// Enum for supported configuration parameters
#[derive(Debug, Clone, Copy)]
pub enum Config {
    Listen,
    UpstreamWorkers,
    CacheBuffer,
    MessageBuffer,
    BusBuffer,
    LogFormat,
    LogLevel,
}

impl Config {
    /// Returns the associated environment variable for the config parameter.
    pub fn env_var(&self) -> &'static str {
        match self {
            Config::Listen => "EDGETASK_LISTEN",
            Config::UpstreamWorkers => "EDGETASK_UPSTREAM_WORKERS",
            Config::CacheBuffer => "EDGETASK_CACHE_BUFFER",
            Config::MessageBuffer => "EDGETASK_MESSAGE_BUFFER",
            Config::BusBuffer => "EDGETASK_BUS_BUFFER",
            Config::LogFormat => "EDGETASK_LOG_FORMAT",
            Config::LogLevel => "EDGETASK_LOG_LEVEL",
        }
    }

    pub fn default_value(&self) -> &'static str {
        match self {
            Config::Listen => "0.0.0.0:10002",
            Config::UpstreamWorkers => "4",
            Config::CacheBuffer => "100",
            Config::MessageBuffer => "1024",
            Config::BusBuffer => "1024",
            Config::LogFormat => "text",
            Config::LogLevel => "info",
        }
    }

    /// Returns the raw value, either from environment or default.
    pub fn get(&self) -> String {
        env::var(self.env_var())
            .ok()
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
            .unwrap_or_else(|| self.default_value().to_string())
    }

    /// Parses the effective value, falling back to the default (with a
    /// warning) when the environment carries something unparseable.
    pub fn parse_or_default<T>(&self, parse: impl Fn(&str) -> Option<T>) -> T
    where
        T: Clone,
    {
        let raw = self.get();
        if let Some(value) = parse(&raw) {
            return value;
        }
        log_warn(
            "config",
            "Invalid configuration value; using default",
            &[
                ("variable", self.env_var()),
                ("value", raw.as_str()),
                ("default", self.default_value()),
            ],
        );
        // Defaults are constants above and always parse.
        match parse(self.default_value()) {
            Some(value) => value,
            None => unreachable!("default for {} must parse", self.env_var()),
        }
    }
}

fn positive_usize(raw: &str) -> Option<usize> {
    raw.parse::<usize>().ok().filter(|value| *value > 0)
}

/// Runtime knobs for the task manager process.
#[derive(Debug, Clone)]
pub struct TaskManagerConfig {
    pub listen: SocketAddr,
    pub upstream_workers: usize,
    pub cache_buffer: usize,
    pub message_buffer: usize,
    pub bus_buffer: usize,
    pub log_format: LogFormat,
    pub log_level: LogLevel,
}

impl Default for TaskManagerConfig {
    fn default() -> Self {
        Self {
            listen: SocketAddr::from(([0, 0, 0, 0], 10002)),
            upstream_workers: 4,
            cache_buffer: 100,
            message_buffer: 1024,
            bus_buffer: 1024,
            log_format: LogFormat::Text,
            log_level: LogLevel::Info,
        }
    }
}

impl TaskManagerConfig {
    pub fn from_env() -> Self {
        Self {
            listen: Config::Listen.parse_or_default(|raw| raw.parse::<SocketAddr>().ok()),
            upstream_workers: Config::UpstreamWorkers.parse_or_default(positive_usize),
            cache_buffer: Config::CacheBuffer.parse_or_default(positive_usize),
            message_buffer: Config::MessageBuffer.parse_or_default(positive_usize),
            bus_buffer: Config::BusBuffer.parse_or_default(positive_usize),
            log_format: Config::LogFormat.parse_or_default(LogFormat::parse),
            log_level: Config::LogLevel.parse_or_default(LogLevel::parse),
        }
    }
}
