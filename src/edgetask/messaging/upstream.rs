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

//! Status reports flowing from edge agents back into the controllers.

use super::{Message, MessageBus, RouteError, TaskResource, TASK_MANAGER_TOPIC};
use crate::edgetask::api::types::NodeTaskResponse;
use crate::edgetask::controller::registry::ControllerRegistry;
use crate::edgetask::fsm::{Action, Event, TaskState};
use crate::edgetask::logger::{log_debug, log_info, log_warn};
use crate::edgetask::observability::tracing::with_span;
use crate::edgetask::util::error::with_context;
use std::error::Error;
use std::sync::Arc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

/// Parsed form of an agent report.
#[derive(Debug, Clone, PartialEq)]
pub struct NodeReport {
    pub task_type: String,
    pub job: String,
    pub node: String,
    pub event: Event,
}

/// Decodes a message from the task manager topic into a node report.
///
/// The task type is taken from the route operation; job and node come from
/// the resource path.
pub fn parse_report(message: &Message) -> Result<NodeReport, RouteError> {
    let resource = TaskResource::parse(&message.route.resource)?;
    let response: NodeTaskResponse = serde_json::from_slice(&message.body)
        .map_err(|err| RouteError::InvalidBody(err.to_string()))?;
    let action = Action::parse(&response.action)
        .ok_or_else(|| RouteError::InvalidAction(response.action.clone()))?;
    let mut event = Event::new(response.event, action);
    if !response.reason.is_empty() {
        event = event.with_reason(response.reason);
    }
    if !response.external_message.is_empty() {
        event = event.with_external(response.external_message);
    }
    Ok(NodeReport {
        task_type: message.route.operation.clone(),
        job: resource.job,
        node: resource.node,
        event,
    })
}

/// Drains the task manager topic with a fixed pool of workers.
pub struct UpstreamRouter {
    bus: Arc<MessageBus>,
    registry: Arc<ControllerRegistry>,
    workers: usize,
}

impl UpstreamRouter {
    pub fn new(bus: Arc<MessageBus>, registry: Arc<ControllerRegistry>, workers: usize) -> Self {
        Self {
            bus,
            registry,
            workers: workers.max(1),
        }
    }

    /// Runs until `shutdown` fires. Each worker handles one report at a time.
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        let workers_text = self.workers.to_string();
        log_info(
            "upstream",
            "Upstream router started",
            &[("workers", workers_text.as_str())],
        );
        let mut workers = JoinSet::new();
        for _ in 0..self.workers {
            let router = Arc::clone(&self);
            let shutdown = shutdown.clone();
            workers.spawn(async move { router.worker(shutdown).await });
        }
        while workers.join_next().await.is_some() {}
        log_info("upstream", "Upstream router stopped", &[]);
    }

    async fn worker(&self, shutdown: CancellationToken) {
        loop {
            let message = tokio::select! {
                _ = shutdown.cancelled() => return,
                message = self.bus.receive(TASK_MANAGER_TOPIC) => match message {
                    Some(message) => message,
                    None => return,
                },
            };
            let resource = message.route.resource.clone();
            if let Err(err) = with_span("upstream", "report", self.dispatch(&message)).await {
                let error_text = err.to_string();
                log_warn(
                    "upstream",
                    "Dropping status report",
                    &[("resource", resource.as_str()), ("error", error_text.as_str())],
                );
            }
        }
    }

    /// Applies one report to its controller and returns the node's new state.
    pub async fn dispatch(
        &self,
        message: &Message,
    ) -> Result<TaskState, Box<dyn Error + Send + Sync>> {
        let report = parse_report(message)?;
        let controller = self.registry.get(&report.task_type)?;
        let next = controller
            .report_node_status(&report.job, &report.node, report.event.clone())
            .await
            .map_err(|err| {
                with_context(
                    err,
                    format!("failed to apply report for {}/{}", report.job, report.node),
                )
            })?;
        let next_text = next.to_string();
        log_debug(
            "upstream",
            "Status report applied",
            &[
                ("job", report.job.as_str()),
                ("node", report.node.as_str()),
                ("state", next_text.as_str()),
            ],
        );
        Ok(next)
    }
}
