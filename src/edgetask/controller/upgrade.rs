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

//! Node upgrade jobs.

use super::task::{TaskController, TaskKind};
use super::{ControllerError, TaskMessage};
use crate::edgetask::api::types::NodeUpgradeJobRequest;
use crate::edgetask::fsm::tables::UPGRADE_FSM;
use crate::edgetask::fsm::FsmSpec;
use crate::edgetask::k8s::job::{NodeUpgradeJob, NodeUpgradeJobSpec, NODE_UPGRADE_JOBS};
use crate::edgetask::k8s::node::{Node, NODE_UPGRADE_STATUS_LABEL};
use crate::edgetask::logger::{log_error, log_warn};
use crate::edgetask::messaging::{
    build_task_resource, Message, MessageRoute, NODE_UPGRADE_GROUP, NODE_UPGRADE_MODULE,
};
use crate::edgetask::util::version::{filter_version, get_image_repo, version_less};
use serde_json::Value;
use uuid::Uuid;

pub const DEFAULT_UPGRADE_REPO: &str = "kubeedge/installation-package";
pub const UPGRADE_TOOL: &str = "keadm";
/// Edge nodes older than this only understand the dedicated upgrade message.
pub const LEGACY_EDGE_VERSION: &str = "v1.16.0";

pub struct UpgradeKind;

pub type UpgradeController = TaskController<UpgradeKind>;

fn decode_request(task: &TaskMessage) -> Option<NodeUpgradeJobRequest> {
    serde_json::from_value(task.payload.clone()).ok()
}

impl TaskKind for UpgradeKind {
    type Spec = NodeUpgradeJobSpec;

    const NAME: &'static str = "upgrade";
    const RESOURCE: &'static str = NODE_UPGRADE_JOBS;

    fn fsm() -> &'static FsmSpec {
        &UPGRADE_FSM
    }

    /// The image tag always follows the job version, even when the
    /// configured image carries its own tag.
    fn request(job: &NodeUpgradeJob) -> Result<Value, ControllerError> {
        let repo = if job.spec.image.is_empty() {
            DEFAULT_UPGRADE_REPO.to_string()
        } else {
            get_image_repo(&job.spec.image)
                .map_err(|err| ControllerError::InvalidSpec(err.to_string()))?
        };
        let request = NodeUpgradeJobRequest {
            upgrade_id: job.name().to_string(),
            history_id: Uuid::new_v4().to_string(),
            version: job.spec.version.clone(),
            upgrade_tool: String::new(),
            image: format!("{}:{}", repo, job.spec.version),
            image_digest: job.spec.image_digest.clone().unwrap_or_default(),
            require_confirmation: job.spec.require_confirmation,
        };
        serde_json::to_value(request).map_err(|err| ControllerError::Decode(err.to_string()))
    }

    fn node_eligible(task: &TaskMessage, node: &Node) -> bool {
        let Some(request) = decode_request(task) else {
            log_error(
                UpgradeKind::NAME,
                "Task carries no upgrade request",
                &[("job", task.name.as_str())],
            );
            return false;
        };
        if filter_version(node.kubelet_version(), &request.version) {
            log_warn(
                UpgradeKind::NAME,
                "Node already on the expected version",
                &[
                    ("node", node.name()),
                    ("version", node.kubelet_version()),
                    ("expected", request.version.as_str()),
                ],
            );
            return false;
        }
        if node.metadata.labels.contains_key(NODE_UPGRADE_STATUS_LABEL) {
            log_warn(
                UpgradeKind::NAME,
                "Node is already being upgraded",
                &[("node", node.name())],
            );
            return false;
        }
        true
    }

    fn legacy_command(task: &TaskMessage, node: &Node) -> Option<Message> {
        let edge_version = node.edge_version()?;
        match version_less(edge_version, LEGACY_EDGE_VERSION) {
            Ok(true) => {}
            Ok(false) => return None,
            Err(err) => {
                let error_text = err.to_string();
                log_warn(
                    UpgradeKind::NAME,
                    "Cannot compare edge version",
                    &[("node", node.name()), ("error", error_text.as_str())],
                );
                return None;
            }
        }
        let request = decode_request(task)?;
        log_warn(
            UpgradeKind::NAME,
            "Edge node predates node tasks; sending legacy upgrade",
            &[
                ("node", node.name()),
                ("version", edge_version),
                ("threshold", LEGACY_EDGE_VERSION),
            ],
        );
        let legacy = NodeUpgradeJobRequest {
            upgrade_id: task.name.clone(),
            history_id: Uuid::new_v4().to_string(),
            version: request.version,
            upgrade_tool: UPGRADE_TOOL.to_string(),
            image: request.image,
            ..NodeUpgradeJobRequest::default()
        };
        let route = MessageRoute {
            source: NODE_UPGRADE_MODULE.to_string(),
            group: NODE_UPGRADE_GROUP.to_string(),
            resource: build_task_resource(UpgradeKind::NAME, &task.name, node.name()),
            operation: UpgradeKind::NAME.to_string(),
        };
        Message::json(route, &legacy).ok()
    }
}
