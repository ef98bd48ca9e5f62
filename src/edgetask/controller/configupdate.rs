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

//! Edge configuration update jobs.

use super::task::{TaskController, TaskKind};
use super::ControllerError;
use crate::edgetask::api::types::ConfigUpdateJobRequest;
use crate::edgetask::fsm::tables::CONFIG_UPDATE_FSM;
use crate::edgetask::fsm::FsmSpec;
use crate::edgetask::k8s::job::{ConfigUpdateJob, ConfigUpdateJobSpec, CONFIG_UPDATE_JOBS};
use serde_json::Value;

pub struct ConfigUpdateKind;

pub type ConfigUpdateController = TaskController<ConfigUpdateKind>;

impl TaskKind for ConfigUpdateKind {
    type Spec = ConfigUpdateJobSpec;

    const NAME: &'static str = "configupdate";
    const RESOURCE: &'static str = CONFIG_UPDATE_JOBS;

    fn fsm() -> &'static FsmSpec {
        &CONFIG_UPDATE_FSM
    }

    fn request(job: &ConfigUpdateJob) -> Result<Value, ControllerError> {
        if job.spec.update_fields.is_empty() {
            return Err(ControllerError::InvalidSpec(format!(
                "config update job {} has no fields to update",
                job.name()
            )));
        }
        let request = ConfigUpdateJobRequest {
            update_fields: job.spec.update_fields.clone(),
        };
        serde_json::to_value(request).map_err(|err| ControllerError::Decode(err.to_string()))
    }
}
