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

//! Wire payloads exchanged with edge agents.
//!
//! Field names are PascalCase to stay compatible with deployed agents.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// Command sent to an agent for one node of one job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct NodeTaskRequest {
    #[serde(rename = "TaskID")]
    pub task_id: String,
    #[serde(rename = "Type")]
    pub task_type: String,
    pub state: String,
    #[serde(default)]
    pub item: Value,
}

/// Outcome reported by an agent, either over the bus or the ingress.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct NodeTaskResponse {
    pub node_name: String,
    pub state: String,
    pub event: String,
    pub action: String,
    pub reason: String,
    pub time: String,
    pub external_message: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct NodePreCheckRequest {
    #[serde(default)]
    pub check_item: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct NodeUpgradeJobRequest {
    #[serde(rename = "UpgradeID")]
    pub upgrade_id: String,
    #[serde(rename = "HistoryID")]
    pub history_id: String,
    pub version: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub upgrade_tool: String,
    pub image: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub image_digest: String,
    #[serde(default)]
    pub require_confirmation: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ImagePrePullJobRequest {
    pub images: Vec<String>,
    #[serde(default)]
    pub secret: String,
    #[serde(default)]
    pub retry_times: i32,
    #[serde(default)]
    pub check_items: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ConfigUpdateJobRequest {
    pub update_fields: BTreeMap<String, String>,
}

pub const UPGRADE_SUCCESS: &str = "upgrade_success";
pub const UPGRADE_FAILED_ROLLBACK_SUCCESS: &str = "upgrade_failed_rollback_success";
pub const UPGRADE_FAILED_ROLLBACK_FAILED: &str = "upgrade_failed_rollback_failed";

/// Status report posted by agents that predate the generic task protocol.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct NodeUpgradeJobResponse {
    #[serde(rename = "UpgradeID")]
    pub upgrade_id: String,
    #[serde(rename = "HistoryID")]
    pub history_id: String,
    pub node_name: String,
    pub from_version: String,
    pub to_version: String,
    pub status: String,
    pub reason: String,
}

/// Per-image pull result carried in a prepull response's `ExternalMessage`
/// and stored as the node status extension.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageStatus {
    #[serde(default)]
    pub image: String,
    #[serde(default)]
    pub status: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub reason: String,
}
