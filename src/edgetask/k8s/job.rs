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

//! Typed views of the job objects held in the declarative store.

use super::meta::{LabelSelector, ObjectMeta};
use crate::edgetask::fsm::{empty_as_none, task_finished, Action, Event, TaskState};
use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

pub const API_VERSION: &str = "operations.kubeedge.io/v1alpha1";

pub const NODE_UPGRADE_JOBS: &str = "nodeupgradejobs";
pub const IMAGE_PREPULL_JOBS: &str = "imageprepulljobs";
pub const CONFIG_UPDATE_JOBS: &str = "configupdatejobs";

/// Target selection and execution knobs shared by every job kind.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskTemplate {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub node_names: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label_selector: Option<LabelSelector>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_seconds: Option<u64>,
    #[serde(default)]
    pub concurrency: i32,
    /// Decimal fraction in `[0, 1]`, kept as a string on the wire.
    #[serde(default)]
    pub failure_tolerate: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub check_items: Vec<String>,
}

/// Per-node progress entry stored in `status.nodeStatus`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskStatus {
    pub node_name: String,
    #[serde(
        default,
        deserialize_with = "empty_as_none",
        skip_serializing_if = "Option::is_none"
    )]
    pub state: Option<TaskState>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub event: String,
    #[serde(
        default,
        deserialize_with = "empty_as_none",
        skip_serializing_if = "Option::is_none"
    )]
    pub action: Option<Action>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub time: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub reason: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extension: Option<Value>,
}

impl TaskStatus {
    pub fn pending(node_name: impl Into<String>) -> Self {
        Self {
            node_name: node_name.into(),
            ..Self::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        *self == TaskStatus::default()
    }

    /// Stamps the outcome of a transition onto this entry.
    pub fn record(&mut self, state: TaskState, event: &Event) {
        self.state = Some(state);
        self.event = event.event_type.clone();
        self.action = Some(event.action);
        self.reason = event.reason.clone().unwrap_or_default();
        self.time = timestamp();
    }
}

fn timestamp() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true)
}

/// True when `new` reports a different, non-empty state for the same node.
pub fn node_updated(old: &TaskStatus, new: &TaskStatus) -> bool {
    old.node_name == new.node_name && new.state.is_some() && old.state != new.state
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobStatus {
    #[serde(
        default,
        deserialize_with = "empty_as_none",
        skip_serializing_if = "Option::is_none"
    )]
    pub state: Option<TaskState>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub event: String,
    #[serde(
        default,
        deserialize_with = "empty_as_none",
        skip_serializing_if = "Option::is_none"
    )]
    pub action: Option<Action>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub reason: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub time: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub node_status: Vec<TaskStatus>,
}

impl JobStatus {
    pub fn record(&mut self, state: TaskState, event: &Event) {
        self.state = Some(state);
        self.event = event.event_type.clone();
        self.action = Some(event.action);
        self.reason = event.reason.clone().unwrap_or_default();
        self.time = timestamp();
    }
}

/// Gives generic code access to the shared template of a kind's spec.
pub trait JobSpec {
    fn template(&self) -> &TaskTemplate;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskJob<S> {
    #[serde(default)]
    pub api_version: String,
    #[serde(default)]
    pub kind: String,
    pub metadata: ObjectMeta,
    pub spec: S,
    #[serde(default)]
    pub status: JobStatus,
}

impl<S> TaskJob<S> {
    pub fn name(&self) -> &str {
        self.metadata.name()
    }

    pub fn is_finished(&self) -> bool {
        task_finished(self.status.state)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeUpgradeJobSpec {
    #[serde(flatten)]
    pub template: TaskTemplate,
    pub version: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub image: String,
    #[serde(default)]
    pub require_confirmation: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_digest: Option<String>,
}

impl JobSpec for NodeUpgradeJobSpec {
    fn template(&self) -> &TaskTemplate {
        &self.template
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImagePrePullJobSpec {
    #[serde(flatten)]
    pub template: TaskTemplate,
    #[serde(default)]
    pub images: Vec<String>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub image_secrets: String,
    #[serde(default)]
    pub retry_times: i32,
}

impl JobSpec for ImagePrePullJobSpec {
    fn template(&self) -> &TaskTemplate {
        &self.template
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfigUpdateJobSpec {
    #[serde(flatten)]
    pub template: TaskTemplate,
    #[serde(default)]
    pub update_fields: BTreeMap<String, String>,
}

impl JobSpec for ConfigUpdateJobSpec {
    fn template(&self) -> &TaskTemplate {
        &self.template
    }
}

pub type NodeUpgradeJob = TaskJob<NodeUpgradeJobSpec>;
pub type ImagePrePullJob = TaskJob<ImagePrePullJobSpec>;
pub type ConfigUpdateJob = TaskJob<ConfigUpdateJobSpec>;
