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

//! Image pre-pull jobs.

use super::task::{TaskController, TaskKind};
use super::ControllerError;
use crate::edgetask::api::types::{ImagePrePullJobRequest, ImageStatus};
use crate::edgetask::fsm::tables::PREPULL_FSM;
use crate::edgetask::fsm::{Event, FsmSpec};
use crate::edgetask::k8s::job::{ImagePrePullJob, ImagePrePullJobSpec, IMAGE_PREPULL_JOBS};
use crate::edgetask::logger::log_warn;
use serde_json::Value;

pub struct PrePullKind;

pub type PrePullController = TaskController<PrePullKind>;

impl TaskKind for PrePullKind {
    type Spec = ImagePrePullJobSpec;

    const NAME: &'static str = "prepull";
    const RESOURCE: &'static str = IMAGE_PREPULL_JOBS;

    fn fsm() -> &'static FsmSpec {
        &PREPULL_FSM
    }

    fn request(job: &ImagePrePullJob) -> Result<Value, ControllerError> {
        if job.spec.images.is_empty() {
            return Err(ControllerError::InvalidSpec(format!(
                "image prepull job {} lists no images",
                job.name()
            )));
        }
        let request = ImagePrePullJobRequest {
            images: job.spec.images.clone(),
            secret: job.spec.image_secrets.clone(),
            retry_times: job.spec.retry_times,
            check_items: job.spec.template.check_items.clone(),
        };
        serde_json::to_value(request).map_err(|err| ControllerError::Decode(err.to_string()))
    }

    /// Per-image pull results reported by the agent.
    fn extension(event: &Event) -> Option<Value> {
        let external = event.external.as_deref()?;
        match serde_json::from_str::<Vec<ImageStatus>>(external) {
            Ok(images) => serde_json::to_value(images).ok(),
            Err(err) => {
                let error_text = err.to_string();
                log_warn(
                    PrePullKind::NAME,
                    "Ignoring malformed image status",
                    &[("error", error_text.as_str())],
                );
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::edgetask::fsm::Action;
    use crate::edgetask::test_support::prepull_job;
    use serde_json::json;

    #[test]
    fn request_carries_images_secret_and_checks() {
        let mut raw = prepull_job("pull-1", &["edge-1"], &["nginx:1.25", "redis:7"]);
        raw["spec"]["imageSecrets"] = json!("default/regcred");
        raw["spec"]["retryTimes"] = json!(2);
        raw["spec"]["checkItems"] = json!(["disk"]);
        let job: ImagePrePullJob = serde_json::from_value(raw).expect("job");
        assert_eq!(
            PrePullKind::request(&job).expect("request"),
            json!({
                "Images": ["nginx:1.25", "redis:7"],
                "Secret": "default/regcred",
                "RetryTimes": 2,
                "CheckItems": ["disk"]
            })
        );
    }

    #[test]
    fn job_without_images_is_rejected() {
        let job: ImagePrePullJob =
            serde_json::from_value(prepull_job("pull-2", &["edge-1"], &[])).expect("job");
        assert!(matches!(
            PrePullKind::request(&job),
            Err(ControllerError::InvalidSpec(_))
        ));
    }

    #[test]
    fn image_results_become_status_extension() {
        let event = Event::new("Pull", Action::Success).with_external(
            r#"[{"image":"nginx:1.25","status":"True"},{"image":"redis:7","status":"False","reason":"not found"}]"#,
        );
        let extension = PrePullKind::extension(&event).expect("extension");
        assert_eq!(extension[1]["reason"], "not found");
        assert_eq!(extension[0]["status"], "True");

        let garbage = Event::new("Pull", Action::Success).with_external("{oops");
        assert_eq!(PrePullKind::extension(&garbage), None);
        assert_eq!(
            PrePullKind::extension(&Event::new("Pull", Action::Success)),
            None
        );
    }
}
