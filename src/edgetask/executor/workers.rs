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

//! Bounded worker set of one executor plus the per-worker timeout watcher.

use crate::edgetask::controller::Controller;
use crate::edgetask::fsm::{effective_state, Event, TaskState};
use crate::edgetask::k8s::job::TaskStatus;
use crate::edgetask::logger::{log_debug, log_info, log_warn};
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::time::{interval_at, Instant};
use tokio_util::sync::CancellationToken;

pub const DEFAULT_TIMEOUT_SECONDS: u64 = 300;
const POLL_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AdmitError {
    ShuttingDown,
    Full { running: usize, capacity: usize },
}

impl fmt::Display for AdmitError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AdmitError::ShuttingDown => write!(f, "workers are shutting down"),
            AdmitError::Full { running, capacity } => {
                write!(f, "workers are all running, {}/{}", running, capacity)
            }
        }
    }
}

impl std::error::Error for AdmitError {}

/// In-flight nodes of one executor, keyed by node name.
#[derive(Debug)]
pub struct WorkerPool {
    capacity: usize,
    jobs: HashMap<String, usize>,
    shutting_down: bool,
}

impl WorkerPool {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            jobs: HashMap::new(),
            shutting_down: false,
        }
    }

    pub fn try_admit(&mut self, node: &str, index: usize) -> Result<(), AdmitError> {
        if self.shutting_down {
            return Err(AdmitError::ShuttingDown);
        }
        if self.jobs.len() >= self.capacity {
            return Err(AdmitError::Full {
                running: self.jobs.len(),
                capacity: self.capacity,
            });
        }
        self.jobs.insert(node.to_string(), index);
        Ok(())
    }

    /// Releases `node`, returning the index it was admitted with.
    pub fn end(&mut self, node: &str) -> Option<usize> {
        self.jobs.remove(node)
    }

    pub fn in_flight(&self) -> usize {
        self.jobs.len()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn shut_down(&mut self) {
        self.shutting_down = true;
    }
}

/// Node vector shared between the driver and its watchers. Only the driver
/// writes to it.
pub type SharedNodes = Arc<RwLock<Vec<TaskStatus>>>;

pub fn node_at(nodes: &SharedNodes, index: usize) -> Option<TaskStatus> {
    nodes
        .read()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
        .get(index)
        .cloned()
}

pub fn timeout_for(timeout_seconds: Option<u64>) -> Duration {
    match timeout_seconds {
        Some(seconds) if seconds > 0 => Duration::from_secs(seconds),
        _ => Duration::from_secs(DEFAULT_TIMEOUT_SECONDS),
    }
}

/// Watches one admitted node and injects a `TimeOut/Failure` event if its
/// state does not move before the deadline.
pub struct TimeoutWatcher {
    pub job: String,
    pub index: usize,
    pub timeout: Duration,
    pub nodes: SharedNodes,
    pub controller: Arc<dyn Controller>,
    pub cancel: CancellationToken,
}

impl TimeoutWatcher {
    pub async fn run(self) {
        let Some(admitted) = node_at(&self.nodes, self.index) else {
            return;
        };
        let last_state = admitted.state;
        let deadline = Instant::now() + self.timeout;
        let mut ticker = interval_at(Instant::now() + POLL_INTERVAL, POLL_INTERVAL);
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => return,
                _ = ticker.tick() => {}
            }
            let current = node_at(&self.nodes, self.index).and_then(|node| node.state);
            if current != last_state || current.map(|state| state.is_terminal()).unwrap_or(false) {
                return;
            }
            log_debug(
                "executor",
                "Node stage not completed yet",
                &[("job", self.job.as_str()), ("node", admitted.node_name.as_str())],
            );
            if Instant::now() >= deadline {
                break;
            }
        }

        let state = effective_state(last_state);
        let reason = format!("node task {} execution timeout", state);
        log_info(
            "executor",
            "Node timed out",
            &[
                ("job", self.job.as_str()),
                ("node", admitted.node_name.as_str()),
                ("state", state.as_str()),
            ],
        );
        if let Err(err) = self
            .controller
            .report_node_status(&self.job, &admitted.node_name, Event::timeout(reason))
            .await
        {
            let error_text = err.to_string();
            log_warn(
                "executor",
                "Failed to report node timeout",
                &[
                    ("job", self.job.as_str()),
                    ("node", admitted.node_name.as_str()),
                    ("error", error_text.as_str()),
                ],
            );
        }
    }
}

/// True when the node ended in `Failed`.
pub fn is_failed(status: &TaskStatus) -> bool {
    status.state == Some(TaskState::Failed)
}
