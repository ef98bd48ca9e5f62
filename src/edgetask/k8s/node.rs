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

use super::meta::ObjectMeta;
use serde::{Deserialize, Serialize};

pub const EDGE_ROLE_LABEL: &str = "node-role.kubernetes.io/edge";
pub const NODE_UPGRADE_STATUS_LABEL: &str = "nodeupgradejob.operations.kubeedge.io/status";
const EDGE_VERSION_INFIX: &str = "-kubeedge-";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NodeCondition {
    #[serde(rename = "type")]
    pub condition_type: String,
    pub status: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NodeSystemInfo {
    #[serde(rename = "kubeletVersion", default)]
    pub kubelet_version: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NodeStatus {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<NodeCondition>,
    #[serde(rename = "nodeInfo", default)]
    pub node_info: NodeSystemInfo,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Node {
    pub metadata: ObjectMeta,
    #[serde(default)]
    pub status: NodeStatus,
}

impl Node {
    pub fn name(&self) -> &str {
        self.metadata.name()
    }

    pub fn is_edge_node(&self) -> bool {
        self.metadata.labels.contains_key(EDGE_ROLE_LABEL)
    }

    pub fn is_ready(&self) -> bool {
        self.status
            .conditions
            .iter()
            .any(|condition| condition.condition_type == "Ready" && condition.status == "True")
    }

    pub fn kubelet_version(&self) -> &str {
        &self.status.node_info.kubelet_version
    }

    /// The edge component version embedded in the kubelet version, e.g.
    /// `v1.12.1` for `v1.26.3-kubeedge-v1.12.1`.
    pub fn edge_version(&self) -> Option<&str> {
        self.kubelet_version()
            .split_once(EDGE_VERSION_INFIX)
            .map(|(_, edge)| edge)
            .filter(|edge| !edge.is_empty())
    }
}
