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

//! Commands flowing from executors towards edge agents.

use super::{
    build_task_resource, Message, MessageBus, MessageRoute, CLOUD_HUB_TOPIC, TASK_MANAGER_GROUP,
    TASK_MANAGER_MODULE,
};
use crate::edgetask::api::types::{NodePreCheckRequest, NodeTaskRequest};
use crate::edgetask::controller::TaskMessage;
use crate::edgetask::fsm::{effective_state, TaskState};
use crate::edgetask::k8s::job::TaskStatus;
use crate::edgetask::logger::{log_debug, log_error, log_info};
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Builds the generic node-task command for `node`.
///
/// Nodes in `Checking` receive the job's pre-check items instead of the
/// kind-specific request.
pub fn build_task_command(task: &TaskMessage, node: &TaskStatus) -> Message {
    let state = effective_state(node.state);
    let item = if state == TaskState::Checking {
        serde_json::to_value(NodePreCheckRequest {
            check_item: task.check_items.clone(),
        })
        .unwrap_or_default()
    } else {
        task.payload.clone()
    };
    let request = NodeTaskRequest {
        task_id: task.name.clone(),
        task_type: task.kind.clone(),
        state: state.as_str().to_string(),
        item,
    };
    let route = MessageRoute {
        source: TASK_MANAGER_MODULE.to_string(),
        group: TASK_MANAGER_GROUP.to_string(),
        resource: build_task_resource(&task.kind, &task.name, &node.node_name),
        operation: task.kind.clone(),
    };
    match Message::json(route.clone(), &request) {
        Ok(message) => message,
        Err(err) => {
            let error_text = err.to_string();
            log_error(
                "downstream",
                "Failed to encode task command",
                &[("resource", route.resource.as_str()), ("error", error_text.as_str())],
            );
            Message::new(route, Vec::new())
        }
    }
}

/// Forwards executor commands onto the cloud hub topic.
pub struct DownstreamSender {
    bus: Arc<MessageBus>,
}

impl DownstreamSender {
    pub fn new(bus: Arc<MessageBus>) -> Self {
        Self { bus }
    }

    pub async fn run(self, mut commands: mpsc::Receiver<Message>, shutdown: CancellationToken) {
        log_info("downstream", "Downstream sender started", &[]);
        loop {
            let message = tokio::select! {
                _ = shutdown.cancelled() => break,
                message = commands.recv() => match message {
                    Some(message) => message,
                    None => break,
                },
            };
            let resource = message.route.resource.clone();
            match self.bus.send(CLOUD_HUB_TOPIC, message).await {
                Ok(()) => log_debug("downstream", "Command sent", &[("resource", resource.as_str())]),
                Err(err) => {
                    let error_text = err.to_string();
                    log_error(
                        "downstream",
                        "Failed to send command",
                        &[("resource", resource.as_str()), ("error", error_text.as_str())],
                    );
                }
            }
        }
        log_info("downstream", "Downstream sender stopped", &[]);
    }
}

/// Drains the cloud hub topic and logs each command. Used when no edge hub
/// is attached, so that [`DownstreamSender`] never blocks on a full topic.
pub async fn log_cloud_hub(bus: Arc<MessageBus>, shutdown: CancellationToken) {
    log_info("cloudhub", "Logging cloud hub commands", &[]);
    loop {
        let message = tokio::select! {
            _ = shutdown.cancelled() => break,
            message = bus.receive(CLOUD_HUB_TOPIC) => match message {
                Some(message) => message,
                None => break,
            },
        };
        let state = serde_json::from_slice::<Value>(&message.body)
            .ok()
            .and_then(|body| body.get("State").and_then(Value::as_str).map(str::to_string))
            .unwrap_or_default();
        log_info(
            "cloudhub",
            "Command for edge node",
            &[
                ("resource", message.route.resource.as_str()),
                ("operation", message.route.operation.as_str()),
                ("state", state.as_str()),
            ],
        );
    }
}
