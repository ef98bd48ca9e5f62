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

//! Fixtures shared by unit and integration tests: node and job builders, a
//! polling helper and a scripted edge agent that answers commands on the
//! cloud hub topic.

use crate::edgetask::api::types::NodeTaskResponse;
use crate::edgetask::fsm::{
    Action, EVENT_BACKUP, EVENT_CHECK, EVENT_CONFIG_UPDATE, EVENT_INIT, EVENT_PULL, EVENT_ROLLBACK,
    EVENT_UPGRADE,
};
use crate::edgetask::k8s::job::{JobStatus, API_VERSION};
use crate::edgetask::k8s::meta::ObjectMeta;
use crate::edgetask::k8s::node::{
    Node, NodeCondition, NodeStatus, NodeSystemInfo, EDGE_ROLE_LABEL,
};
use crate::edgetask::k8s::store::ObjectStore;
use crate::edgetask::messaging::{
    Message, MessageBus, MessageRoute, TaskResource, CLOUD_HUB_TOPIC, TASK_MANAGER_GROUP,
    TASK_MANAGER_TOPIC,
};
use serde_json::{json, Value};
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// A Ready edge node reporting `kubelet_version`.
pub fn edge_node(name: &str, kubelet_version: &str) -> Node {
    let mut metadata = ObjectMeta::named(name);
    metadata
        .labels
        .insert(EDGE_ROLE_LABEL.to_string(), String::new());
    Node {
        metadata,
        status: NodeStatus {
            conditions: vec![NodeCondition {
                condition_type: "Ready".to_string(),
                status: "True".to_string(),
            }],
            node_info: NodeSystemInfo {
                kubelet_version: kubelet_version.to_string(),
            },
        },
    }
}

fn job_object(kind: &str, name: &str, nodes: &[&str], spec: Value) -> Value {
    let mut spec = spec;
    spec["nodeNames"] = json!(nodes);
    json!({
        "apiVersion": API_VERSION,
        "kind": kind,
        "metadata": {"name": name},
        "spec": spec,
    })
}

pub fn upgrade_job(name: &str, nodes: &[&str], version: &str) -> Value {
    job_object("NodeUpgradeJob", name, nodes, json!({"version": version}))
}

pub fn prepull_job(name: &str, nodes: &[&str], images: &[&str]) -> Value {
    job_object("ImagePrePullJob", name, nodes, json!({"images": images}))
}

pub fn config_update_job(name: &str, nodes: &[&str], fields: &[(&str, &str)]) -> Value {
    let fields: serde_json::Map<String, Value> = fields
        .iter()
        .map(|(key, value)| (key.to_string(), Value::String(value.to_string())))
        .collect();
    job_object(
        "ConfigUpdateJob",
        name,
        nodes,
        json!({"updateFields": fields}),
    )
}

/// Reads the typed status of a job straight from the store.
pub async fn job_status(store: &dyn ObjectStore, kind: &str, name: &str) -> Option<JobStatus> {
    let object = store.get(kind, name).await.ok()?;
    serde_json::from_value(object.get("status").cloned().unwrap_or(Value::Null)).ok()
}

/// Polls `check` every 10ms until it holds or `limit` elapses.
pub async fn wait_for<F, Fut>(limit: Duration, mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + limit;
    loop {
        if check().await {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Event an agent reports after finishing the stage it was asked to run.
pub fn stage_event(state: &str) -> Option<&'static str> {
    match state {
        "Init" => Some(EVENT_INIT),
        "Checking" => Some(EVENT_CHECK),
        "BackingUp" => Some(EVENT_BACKUP),
        "Upgrading" => Some(EVENT_UPGRADE),
        "Pulling" => Some(EVENT_PULL),
        "Updating" => Some(EVENT_CONFIG_UPDATE),
        "RollingBack" => Some(EVENT_ROLLBACK),
        _ => None,
    }
}

/// A command as seen by the fake agent.
#[derive(Debug, Clone)]
pub struct AgentCommand {
    pub route: MessageRoute,
    pub job: String,
    pub node: String,
    /// `State` of a node-task request; empty for legacy upgrade requests.
    pub state: String,
    pub body: Value,
}

impl AgentCommand {
    fn decode(message: &Message) -> Option<Self> {
        let resource = TaskResource::parse(&message.route.resource).ok()?;
        let body: Value = serde_json::from_slice(&message.body).unwrap_or(Value::Null);
        let state = body
            .get("State")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        Some(Self {
            route: message.route.clone(),
            job: resource.job,
            node: resource.node,
            state,
            body,
        })
    }
}

#[derive(Debug, Clone)]
pub enum AgentReply {
    Respond {
        event: String,
        action: Action,
        reason: String,
        external: String,
    },
    Ignore,
}

impl AgentReply {
    pub fn respond(event: &str, action: Action) -> Self {
        AgentReply::Respond {
            event: event.to_string(),
            action,
            reason: String::new(),
            external: String::new(),
        }
    }
}

pub type AgentScript = Arc<dyn Fn(&AgentCommand) -> AgentReply + Send + Sync>;

/// Answers every command with the stage event of its state and `Success`.
pub fn succeed_every_stage() -> AgentScript {
    Arc::new(|command: &AgentCommand| match stage_event(&command.state) {
        Some(event) => AgentReply::respond(event, Action::Success),
        None => AgentReply::Ignore,
    })
}

/// Sends a node report for `command` on the task manager topic.
pub async fn send_report(bus: &MessageBus, command: &AgentCommand, reply: &AgentReply) {
    let AgentReply::Respond {
        event,
        action,
        reason,
        external,
    } = reply
    else {
        return;
    };
    let response = NodeTaskResponse {
        node_name: command.node.clone(),
        event: event.clone(),
        action: action.as_str().to_string(),
        reason: reason.clone(),
        external_message: external.clone(),
        ..NodeTaskResponse::default()
    };
    let route = MessageRoute {
        source: "edgehub".to_string(),
        group: TASK_MANAGER_GROUP.to_string(),
        resource: command.route.resource.clone(),
        operation: command.route.operation.clone(),
    };
    let message = Message::json(route, &response).expect("encode agent report");
    bus.send(TASK_MANAGER_TOPIC, message)
        .await
        .expect("deliver agent report");
}

/// Scripted stand-in for the edge agents behind the cloud hub.
pub struct FakeEdgeAgent {
    commands: Arc<Mutex<Vec<AgentCommand>>>,
    handle: JoinHandle<()>,
}

impl FakeEdgeAgent {
    pub fn spawn(bus: Arc<MessageBus>, script: AgentScript, shutdown: CancellationToken) -> Self {
        let commands = Arc::new(Mutex::new(Vec::new()));
        let recorded = Arc::clone(&commands);
        let handle = tokio::spawn(async move {
            loop {
                let message = tokio::select! {
                    _ = shutdown.cancelled() => return,
                    message = bus.receive(CLOUD_HUB_TOPIC) => match message {
                        Some(message) => message,
                        None => return,
                    },
                };
                let Some(command) = AgentCommand::decode(&message) else {
                    continue;
                };
                recorded
                    .lock()
                    .unwrap_or_else(|poisoned| poisoned.into_inner())
                    .push(command.clone());
                let reply = script(&command);
                send_report(&bus, &command, &reply).await;
            }
        });
        Self { commands, handle }
    }

    pub fn commands(&self) -> Vec<AgentCommand> {
        self.commands
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    pub fn commands_for(&self, node: &str) -> Vec<AgentCommand> {
        self.commands()
            .into_iter()
            .filter(|command| command.node == node)
            .collect()
    }

    pub fn abort(&self) {
        self.handle.abort();
    }
}

impl Drop for FakeEdgeAgent {
    fn drop(&mut self) {
        self.handle.abort();
    }
}
