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

//! Per-kind job controllers and the pieces they share.

pub mod cache;
pub mod configupdate;
pub mod prepull;
pub mod registry;
pub mod task;
pub mod upgrade;

use crate::edgetask::fsm::{Event, FsmError, TaskState};
use crate::edgetask::k8s::job::TaskStatus;
use crate::edgetask::k8s::meta::LabelSelector;
use crate::edgetask::k8s::node::Node;
use crate::edgetask::k8s::store::StoreError;
use crate::edgetask::messaging::Message;
use serde_json::Value;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

pub const DEFAULT_CONCURRENCY: usize = 1;
pub const DEFAULT_FAILURE_TOLERANCE: f64 = 0.1;

#[derive(Debug)]
pub enum ControllerError {
    Store(StoreError),
    Fsm(FsmError),
    Decode(String),
    InvalidSpec(String),
    NodeNotFound(String),
    UnknownKind(String),
    NoNodes(String),
}

impl fmt::Display for ControllerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ControllerError::Store(err) => write!(f, "store error: {}", err),
            ControllerError::Fsm(err) => write!(f, "{}", err),
            ControllerError::Decode(msg) => write!(f, "failed to decode job: {}", msg),
            ControllerError::InvalidSpec(msg) => write!(f, "invalid job spec: {}", msg),
            ControllerError::NodeNotFound(name) => {
                write!(f, "node {} is not part of the job", name)
            }
            ControllerError::UnknownKind(kind) => {
                write!(f, "no controller registered for task type {}", kind)
            }
            ControllerError::NoNodes(job) => write!(f, "no nodes to process for job {}", job),
        }
    }
}

impl std::error::Error for ControllerError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ControllerError::Store(err) => Some(err),
            ControllerError::Fsm(err) => Some(err),
            _ => None,
        }
    }
}

impl From<StoreError> for ControllerError {
    fn from(err: StoreError) -> Self {
        ControllerError::Store(err)
    }
}

impl From<FsmError> for ControllerError {
    fn from(err: FsmError) -> Self {
        ControllerError::Fsm(err)
    }
}

impl ControllerError {
    /// True when the FSM refused the event: no rule matches, or the state
    /// moved on before the transition could be stored.
    pub fn is_rejected_transition(&self) -> bool {
        matches!(
            self,
            ControllerError::Fsm(FsmError::NoTransition { .. } | FsmError::Stale { .. })
        )
    }

    pub fn is_terminal_state(&self) -> bool {
        matches!(self, ControllerError::Fsm(FsmError::TerminalState { .. }))
    }
}

/// Envelope from controllers to the executor machine.
///
/// A message either carries the frozen execution spec of a job (optionally
/// with one changed node entry in `status`), or asks for the job's executor
/// to be torn down when `shutdown` is set.
#[derive(Debug, Clone, Default)]
pub struct TaskMessage {
    pub kind: String,
    pub name: String,
    pub timeout_seconds: Option<u64>,
    pub concurrency: usize,
    pub failure_tolerate: f64,
    pub node_names: Vec<String>,
    pub label_selector: Option<LabelSelector>,
    pub check_items: Vec<String>,
    pub status: TaskStatus,
    /// Kind-specific request item sent to agents.
    pub payload: Value,
    pub shutdown: bool,
}

impl TaskMessage {
    pub fn shutdown(kind: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            name: name.into(),
            shutdown: true,
            ..Self::default()
        }
    }

    pub fn key(&self) -> (String, String) {
        (self.kind.clone(), self.name.clone())
    }
}

pub type ControllerFuture<'a, T> =
    Pin<Box<dyn Future<Output = Result<T, ControllerError>> + Send + 'a>>;
pub type CommandFuture<'a> = Pin<Box<dyn Future<Output = Message> + Send + 'a>>;

/// Capability set the executor machine and upstream router rely on.
pub trait Controller: Send + Sync {
    /// Task type handled by this controller, e.g. `upgrade`.
    fn name(&self) -> &'static str;

    /// Seeds from the store and spawns the event loop. Returns once the
    /// initial list has been processed.
    fn start(self: Arc<Self>, shutdown: CancellationToken) -> ControllerFuture<'static, ()>;

    /// Resolves the job's target nodes, keeping only eligible ones.
    fn validate_nodes<'a>(&'a self, task: &'a TaskMessage) -> ControllerFuture<'a, Vec<Node>>;

    /// Applies a node-level event and returns the node's new state.
    fn report_node_status<'a>(
        &'a self,
        job: &'a str,
        node: &'a str,
        event: Event,
    ) -> ControllerFuture<'a, TaskState>;

    /// Applies a job-level event and returns the job's new state.
    fn report_task_status<'a>(&'a self, job: &'a str, event: Event)
        -> ControllerFuture<'a, TaskState>;

    /// True when `state` lies past the job's current stage.
    fn stage_completed<'a>(
        &'a self,
        job: &'a str,
        state: Option<TaskState>,
    ) -> ControllerFuture<'a, bool>;

    fn get_node_status<'a>(&'a self, job: &'a str) -> ControllerFuture<'a, Vec<TaskStatus>>;

    fn update_node_status<'a>(
        &'a self,
        job: &'a str,
        statuses: Vec<TaskStatus>,
    ) -> ControllerFuture<'a, ()>;

    /// Builds the downstream command for `node`.
    fn command_for<'a>(&'a self, task: &'a TaskMessage, node: &'a TaskStatus) -> CommandFuture<'a>;
}
