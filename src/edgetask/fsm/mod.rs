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

//! Table-driven state machine shared by job-level and node-level progress.
//!
//! A [`FsmSpec`] is a static transition table plus the ordered stage
//! sequence of one job kind. An [`Fsm`] binds a spec to a [`StateAccess`]
//! implementation that loads and persists the current state, so the same
//! engine drives a whole job or a single node within it.

pub mod tables;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize};
use std::fmt;
use std::future::Future;
use std::pin::Pin;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TaskState {
    Init,
    Checking,
    BackingUp,
    Upgrading,
    RollingBack,
    Pulling,
    Updating,
    Successful,
    Failed,
}

impl TaskState {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskState::Init => "Init",
            TaskState::Checking => "Checking",
            TaskState::BackingUp => "BackingUp",
            TaskState::Upgrading => "Upgrading",
            TaskState::RollingBack => "RollingBack",
            TaskState::Pulling => "Pulling",
            TaskState::Updating => "Updating",
            TaskState::Successful => "Successful",
            TaskState::Failed => "Failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskState::Successful | TaskState::Failed)
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Treats a missing state as `Init`.
pub fn effective_state(state: Option<TaskState>) -> TaskState {
    state.unwrap_or(TaskState::Init)
}

/// True when `state` is Successful or Failed. A missing state is `Init`.
pub fn task_finished(state: Option<TaskState>) -> bool {
    state.map(|s| s.is_terminal()).unwrap_or(false)
}

/// Deserializes an optional enum field, mapping `""` to `None`. Status
/// objects written by other clients use the empty string for "unset".
pub fn empty_as_none<'de, D, T>(deserializer: D) -> Result<Option<T>, D::Error>
where
    D: Deserializer<'de>,
    T: DeserializeOwned,
{
    let raw: Option<String> = Option::deserialize(deserializer)?;
    match raw.as_deref() {
        None | Some("") => Ok(None),
        Some(value) => serde_json::from_value(serde_json::Value::String(value.to_string()))
            .map(Some)
            .map_err(serde::de::Error::custom),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Action {
    Success,
    Failure,
    Confirmation,
    TimeOut,
}

impl Action {
    pub fn as_str(&self) -> &'static str {
        match self {
            Action::Success => "Success",
            Action::Failure => "Failure",
            Action::Confirmation => "Confirmation",
            Action::TimeOut => "TimeOut",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "Success" => Some(Action::Success),
            "Failure" => Some(Action::Failure),
            "Confirmation" => Some(Action::Confirmation),
            "TimeOut" => Some(Action::TimeOut),
            _ => None,
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

pub const EVENT_INIT: &str = "Init";
pub const EVENT_CHECK: &str = "Check";
pub const EVENT_BACKUP: &str = "Backup";
pub const EVENT_UPGRADE: &str = "Upgrade";
pub const EVENT_ROLLBACK: &str = "Rollback";
pub const EVENT_PULL: &str = "Pull";
pub const EVENT_CONFIG_UPDATE: &str = "ConfigUpdate";
pub const EVENT_TIMEOUT: &str = "TimeOut";

/// Input to a transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Event {
    pub event_type: String,
    pub action: Action,
    pub reason: Option<String>,
    /// Opaque kind-specific payload, e.g. per-image pull results.
    pub external: Option<String>,
}

impl Event {
    pub fn new(event_type: impl Into<String>, action: Action) -> Self {
        Self {
            event_type: event_type.into(),
            action,
            reason: None,
            external: None,
        }
    }

    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }

    pub fn with_external(mut self, external: impl Into<String>) -> Self {
        self.external = Some(external.into());
        self
    }

    pub fn timeout(reason: impl Into<String>) -> Self {
        Self::new(EVENT_TIMEOUT, Action::Failure).with_reason(reason)
    }
}

/// One row of a transition table. `from: None` matches any non-terminal state.
#[derive(Debug, Clone, Copy)]
pub struct Rule {
    pub from: Option<TaskState>,
    pub event: &'static str,
    pub action: Action,
    pub to: TaskState,
}

#[derive(Debug)]
pub struct FsmSpec {
    pub kind: &'static str,
    pub rules: &'static [Rule],
    /// Ordered `(stage, next stage)` pairs.
    pub stages: &'static [(TaskState, TaskState)],
}

impl FsmSpec {
    pub fn next_state(&self, current: TaskState, event: &Event) -> Result<TaskState, FsmError> {
        if current.is_terminal() {
            return Err(FsmError::TerminalState { state: current });
        }
        let matches = |rule: &&Rule| rule.event == event.event_type && rule.action == event.action;
        self.rules
            .iter()
            .filter(matches)
            .find(|rule| rule.from == Some(current))
            .or_else(|| {
                self.rules
                    .iter()
                    .filter(matches)
                    .find(|rule| rule.from.is_none())
            })
            .map(|rule| rule.to)
            .ok_or_else(|| FsmError::NoTransition {
                key: transition_key(current, event),
            })
    }

    /// True when `target` is the stage that follows `current`, or terminal.
    pub fn stage_completed(&self, current: TaskState, target: TaskState) -> bool {
        if target.is_terminal() {
            return true;
        }
        self.stages
            .iter()
            .any(|(stage, next)| *stage == current && *next == target)
    }
}

pub fn transition_key(current: TaskState, event: &Event) -> String {
    format!("{}/{}/{}", current, event.event_type, event.action)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FsmError {
    NoTransition { key: String },
    TerminalState { state: TaskState },
    /// The stored state moved on between resolving and persisting a transition.
    Stale { expected: TaskState, found: TaskState },
    Load(String),
    Store(String),
}

impl fmt::Display for FsmError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FsmError::NoTransition { key } => write!(f, "no transition defined for {}", key),
            FsmError::TerminalState { state } => {
                write!(f, "state {} is terminal and accepts no events", state)
            }
            FsmError::Stale { expected, found } => write!(
                f,
                "state changed from {} to {} before the transition was stored",
                expected, found
            ),
            FsmError::Load(message) => write!(f, "failed to load current state: {}", message),
            FsmError::Store(message) => write!(f, "failed to store next state: {}", message),
        }
    }
}

impl std::error::Error for FsmError {}

pub type StateFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, FsmError>> + Send + 'a>>;

/// Loads and persists the state the machine operates on.
pub trait StateAccess: Send + Sync {
    /// Returns the current state; `None` is treated as `Init`.
    fn load(&self) -> StateFuture<'_, Option<TaskState>>;

    /// Persists `next`. Implementations must fail with [`FsmError::Stale`]
    /// when the stored state is no longer `from`.
    fn store<'a>(&'a self, from: TaskState, next: TaskState, event: &'a Event)
        -> StateFuture<'a, ()>;
}

pub struct Fsm<A> {
    spec: &'static FsmSpec,
    access: A,
}

impl<A: StateAccess> Fsm<A> {
    pub fn new(spec: &'static FsmSpec, access: A) -> Self {
        Self { spec, access }
    }

    pub fn spec(&self) -> &'static FsmSpec {
        self.spec
    }

    pub async fn current_state(&self) -> Result<TaskState, FsmError> {
        Ok(effective_state(self.access.load().await?))
    }

    /// Checks the event against the table without persisting anything.
    pub async fn allow_transit(&self, event: &Event) -> Result<TaskState, FsmError> {
        let current = self.current_state().await?;
        self.spec.next_state(current, event)
    }

    /// Resolves and persists the next state, returning it.
    pub async fn transit(&self, event: &Event) -> Result<TaskState, FsmError> {
        let current = self.current_state().await?;
        let next = self.spec.next_state(current, event)?;
        self.access.store(current, next, event).await?;
        Ok(next)
    }

    pub async fn stage_completed(&self, target: TaskState) -> Result<bool, FsmError> {
        let current = self.current_state().await?;
        Ok(self.spec.stage_completed(current, target))
    }
}
