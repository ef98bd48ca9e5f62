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

//! Per-job driver: admits nodes stage by stage and advances the job FSM.

use super::workers::{is_failed, node_at, timeout_for, SharedNodes, TimeoutWatcher, WorkerPool};
use crate::edgetask::controller::{Controller, ControllerError, TaskMessage};
use crate::edgetask::fsm::{effective_state, Action, Event, TaskState};
use crate::edgetask::k8s::job::TaskStatus;
use crate::edgetask::logger::{log_debug, log_error, log_info, log_warn};
use crate::edgetask::messaging::Message;
use std::collections::HashSet;
use std::sync::{Arc, RwLock};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Flow {
    Continue,
    Finished,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StageOutcome {
    Advanced,
    Finished,
    Stalled,
}

pub struct Executor {
    task: TaskMessage,
    controller: Arc<dyn Controller>,
    nodes: SharedNodes,
    workers: WorkerPool,
    failed: HashSet<String>,
    max_failed: usize,
    index: usize,
    downstream: mpsc::Sender<Message>,
    cancel: CancellationToken,
}

impl Executor {
    pub fn new(
        task: TaskMessage,
        controller: Arc<dyn Controller>,
        nodes: Vec<TaskStatus>,
        downstream: mpsc::Sender<Message>,
        cancel: CancellationToken,
    ) -> Self {
        let max_failed = (nodes.len() as f64 * task.failure_tolerate).ceil().max(0.0) as usize;
        let workers = WorkerPool::new(task.concurrency);
        Self {
            task,
            controller,
            nodes: Arc::new(RwLock::new(nodes)),
            workers,
            failed: HashSet::new(),
            max_failed,
            index: 0,
            downstream,
            cancel,
        }
    }

    fn job(&self) -> &str {
        &self.task.name
    }

    fn len(&self) -> usize {
        self.nodes
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }

    fn snapshot(&self) -> Vec<TaskStatus> {
        self.nodes
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// Drives the job until it finishes or the executor is cancelled.
    pub async fn run(mut self, mut inbox: mpsc::Receiver<TaskStatus>) {
        let total = self.len().to_string();
        let concurrency = self.workers.capacity().to_string();
        let max_failed = self.max_failed.to_string();
        log_info(
            "executor",
            "Executor started",
            &[
                ("kind", self.task.kind.as_str()),
                ("job", self.job()),
                ("nodes", total.as_str()),
                ("concurrency", concurrency.as_str()),
                ("max_failed", max_failed.as_str()),
            ],
        );

        if self.drive().await == Flow::Continue {
            loop {
                let status = tokio::select! {
                    _ = self.cancel.cancelled() => {
                        log_info("executor", "Executor cancelled", &[("job", self.job())]);
                        break;
                    }
                    status = inbox.recv() => match status {
                        Some(status) => status,
                        None => break,
                    },
                };
                if status.is_empty() {
                    continue;
                }
                if self.on_status(status).await == Flow::Finished {
                    break;
                }
            }
        }
        self.cancel.cancel();
    }

    async fn on_status(&mut self, status: TaskStatus) -> Flow {
        match self.controller.stage_completed(self.job(), status.state).await {
            Ok(true) => {}
            Ok(false) => return Flow::Continue,
            Err(err) => {
                let error_text = err.to_string();
                log_warn(
                    "executor",
                    "Failed to evaluate stage",
                    &[("job", self.job()), ("error", error_text.as_str())],
                );
                return Flow::Continue;
            }
        }
        let Some(index) = self.workers.end(&status.node_name) else {
            log_warn(
                "executor",
                "Status for node that is not running",
                &[("job", self.job()), ("node", status.node_name.as_str())],
            );
            return Flow::Continue;
        };
        {
            let mut nodes = self
                .nodes
                .write()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            if let Some(slot) = nodes.get_mut(index) {
                *slot = status.clone();
            }
        }
        if self.deal_failed_node(&status).await == Flow::Finished {
            return Flow::Finished;
        }
        self.drive().await
    }

    /// Fills the worker pool and advances the job whenever a stage has
    /// completed for every node.
    async fn drive(&mut self) -> Flow {
        loop {
            if self.init_workers().await == Flow::Finished {
                return Flow::Finished;
            }
            if self.index < self.len() || self.workers.in_flight() > 0 {
                return Flow::Continue;
            }
            match self.completed_task_stage().await {
                StageOutcome::Finished => {
                    log_info("executor", "Job finished", &[("job", self.job())]);
                    return Flow::Finished;
                }
                StageOutcome::Stalled => return Flow::Continue,
                StageOutcome::Advanced => self.index = 0,
            }
        }
    }

    async fn init_workers(&mut self) -> Flow {
        while self.index < self.len() {
            let Some(node) = node_at(&self.nodes, self.index) else {
                break;
            };
            let completed = match self.controller.stage_completed(self.job(), node.state).await {
                Ok(completed) => completed,
                Err(err) => {
                    let error_text = err.to_string();
                    log_warn(
                        "executor",
                        "Failed to evaluate stage",
                        &[("job", self.job()), ("error", error_text.as_str())],
                    );
                    false
                }
            };
            if completed {
                if self.deal_failed_node(&node).await == Flow::Finished {
                    return Flow::Finished;
                }
                self.index += 1;
                continue;
            }
            if !self.add_job(&node).await {
                break;
            }
            self.index += 1;
        }
        Flow::Continue
    }

    async fn add_job(&mut self, node: &TaskStatus) -> bool {
        if let Err(err) = self.workers.try_admit(&node.node_name, self.index) {
            let error_text = err.to_string();
            log_debug(
                "executor",
                "Node not admitted",
                &[
                    ("job", self.job()),
                    ("node", node.node_name.as_str()),
                    ("reason", error_text.as_str()),
                ],
            );
            return false;
        }
        let command = self.controller.command_for(&self.task, node).await;
        let watcher = TimeoutWatcher {
            job: self.task.name.clone(),
            index: self.index,
            timeout: timeout_for(self.task.timeout_seconds),
            nodes: Arc::clone(&self.nodes),
            controller: Arc::clone(&self.controller),
            cancel: self.cancel.child_token(),
        };
        tokio::spawn(watcher.run());

        let state = effective_state(node.state);
        log_info(
            "executor",
            "Dispatching node task",
            &[
                ("job", self.job()),
                ("node", node.node_name.as_str()),
                ("state", state.as_str()),
            ],
        );
        if self.downstream.send(command).await.is_err() {
            log_error(
                "executor",
                "Downstream channel closed",
                &[("job", self.job()), ("node", node.node_name.as_str())],
            );
        }
        true
    }

    async fn deal_failed_node(&mut self, node: &TaskStatus) -> Flow {
        if is_failed(node) {
            self.failed.insert(node.node_name.clone());
        }
        let failed = self.failed.len();
        if failed == 0 || failed < self.max_failed {
            return Flow::Continue;
        }
        self.workers.shut_down();
        if self.workers.in_flight() > 0 {
            let running = self.workers.in_flight().to_string();
            log_warn(
                "executor",
                "Failure tolerance exceeded; waiting for running workers",
                &[("job", self.job()), ("running", running.as_str())],
            );
            return Flow::Continue;
        }
        let reason = format!(
            "the number of failed nodes is {}/{}, which exceeds the failure tolerance threshold.",
            failed,
            self.len()
        );
        self.report_job_failure(node, reason).await;
        Flow::Finished
    }

    /// Applies exactly one job-level failure event. The failed node's event
    /// is tried first; `TimeOut/Failure` is the fallback.
    async fn report_job_failure(&self, node: &TaskStatus, reason: String) {
        let failed_event = if is_failed(node) && !node.event.is_empty() {
            Some(node.event.clone())
        } else {
            self.snapshot()
                .into_iter()
                .find(|entry| is_failed(entry) && !entry.event.is_empty())
                .map(|entry| entry.event)
        };
        let mut attempts = Vec::with_capacity(2);
        if let Some(event_type) = failed_event {
            attempts.push(Event::new(event_type, Action::Failure).with_reason(reason.clone()));
        }
        attempts.push(Event::timeout(reason.clone()));

        for event in attempts {
            match self.controller.report_task_status(self.job(), event).await {
                Ok(state) => {
                    let state_text = state.to_string();
                    log_warn(
                        "executor",
                        "Job failed",
                        &[
                            ("job", self.job()),
                            ("state", state_text.as_str()),
                            ("reason", reason.as_str()),
                        ],
                    );
                    return;
                }
                Err(err) if err.is_rejected_transition() => continue,
                Err(err) => {
                    let error_text = err.to_string();
                    log_error(
                        "executor",
                        "Failed to report job failure",
                        &[("job", self.job()), ("error", error_text.as_str())],
                    );
                    return;
                }
            }
        }
        log_error(
            "executor",
            "Job rejected every failure event",
            &[("job", self.job()), ("reason", reason.as_str())],
        );
    }

    /// Advances the job one stage by replaying a representative node's
    /// event. Non-terminal nodes are preferred, then nodes that did not fail.
    /// When every node failed only their own actions are replayed.
    async fn completed_task_stage(&self) -> StageOutcome {
        let mut candidates = self.snapshot();
        candidates.sort_by_key(|node| {
            let state = effective_state(node.state);
            if !state.is_terminal() {
                0
            } else if state != TaskState::Failed {
                1
            } else {
                2
            }
        });

        let all_failed = !candidates.is_empty() && candidates.iter().all(is_failed);

        let mut tried = HashSet::new();
        for node in candidates.iter().filter(|node| !node.event.is_empty()) {
            let mut actions = Vec::with_capacity(2);
            if !all_failed {
                actions.push(Action::Success);
            }
            if let Some(action) = node.action {
                actions.push(action);
            }
            for action in actions {
                if !tried.insert((node.event.clone(), action)) {
                    continue;
                }
                let event = Event::new(node.event.clone(), action);
                match self.controller.report_task_status(self.job(), event).await {
                    Ok(state) if state.is_terminal() => return StageOutcome::Finished,
                    Ok(_) => return StageOutcome::Advanced,
                    Err(err) if err.is_rejected_transition() => continue,
                    Err(err) if err.is_terminal_state() => return StageOutcome::Finished,
                    Err(err) => {
                        self.abort_stage(err).await;
                        return StageOutcome::Finished;
                    }
                }
            }
        }
        if all_failed {
            if let Some(node) = candidates.first() {
                let reason = format!("all {} nodes failed", candidates.len());
                self.report_job_failure(node, reason).await;
                return StageOutcome::Finished;
            }
        }
        log_error(
            "executor",
            "No node event advances the job",
            &[("job", self.job())],
        );
        StageOutcome::Stalled
    }

    async fn abort_stage(&self, err: ControllerError) {
        let reason = format!("failed to advance job: {}", err);
        log_error(
            "executor",
            "Failed to advance job",
            &[("job", self.job()), ("reason", reason.as_str())],
        );
        if let Err(err) = self
            .controller
            .report_task_status(self.job(), Event::timeout(reason))
            .await
        {
            let error_text = err.to_string();
            log_error(
                "executor",
                "Failed to record job failure",
                &[("job", self.job()), ("error", error_text.as_str())],
            );
        }
    }
}
