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

//! Status ingress handlers. Every accepted report becomes a message on the
//! task manager topic, the same path agent replies take over the hub.

use super::error::ApiError;
use super::IngressState;
use crate::edgetask::api::types::{
    NodeTaskResponse, NodeUpgradeJobResponse, UPGRADE_FAILED_ROLLBACK_FAILED,
    UPGRADE_FAILED_ROLLBACK_SUCCESS, UPGRADE_SUCCESS,
};
use crate::edgetask::controller::task::TaskKind;
use crate::edgetask::controller::upgrade::UpgradeKind;
use crate::edgetask::fsm::{Action, EVENT_ROLLBACK, EVENT_UPGRADE};
use crate::edgetask::logger::{log_info, log_warn};
use crate::edgetask::messaging::{
    build_task_resource, Message, MessageRoute, TASK_MANAGER_GROUP, TASK_MANAGER_TOPIC,
};
use axum::body::{Body, Bytes};
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use futures_util::StreamExt;
use serde::de::DeserializeOwned;

/// Largest accepted body.
pub const MAX_BODY_BYTES: usize = 3 * 1024 * 1024;
pub const INGRESS_SOURCE: &str = "taskingress";

/// Reads at most [`MAX_BODY_BYTES`], failing as soon as the limit is crossed.
async fn read_limited(body: Body) -> Result<Bytes, ApiError> {
    let mut stream = body.into_data_stream();
    let mut collected = Vec::new();
    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(|err| ApiError::bad_request(err.to_string()))?;
        if collected.len() + chunk.len() > MAX_BODY_BYTES {
            return Err(ApiError::payload_too_large(MAX_BODY_BYTES));
        }
        collected.extend_from_slice(&chunk);
    }
    Ok(Bytes::from(collected))
}

async fn decode<T: DeserializeOwned>(body: Body) -> Result<T, ApiError> {
    let bytes = read_limited(body).await?;
    serde_json::from_slice(&bytes).map_err(|err| ApiError::bad_request(err.to_string()))
}

/// Maps a legacy upgrade status onto an event. The two rollback outcomes
/// are deliberately crossed; older agents depend on it.
pub fn legacy_event(status: &str) -> Option<(&'static str, Action)> {
    match status {
        UPGRADE_SUCCESS => Some((EVENT_UPGRADE, Action::Success)),
        UPGRADE_FAILED_ROLLBACK_SUCCESS => Some((EVENT_ROLLBACK, Action::Failure)),
        UPGRADE_FAILED_ROLLBACK_FAILED => Some((EVENT_ROLLBACK, Action::Success)),
        _ => None,
    }
}

async fn publish(
    state: &IngressState,
    task_type: &str,
    task_id: &str,
    node_id: &str,
    response: &NodeTaskResponse,
) -> Result<(), ApiError> {
    let route = MessageRoute {
        source: INGRESS_SOURCE.to_string(),
        group: TASK_MANAGER_GROUP.to_string(),
        resource: build_task_resource(task_type, task_id, node_id),
        operation: task_type.to_string(),
    };
    let message = Message::json(route, response)
        .map_err(|err| ApiError::internal_message(err.to_string()))?;
    state
        .bus
        .send(TASK_MANAGER_TOPIC, message)
        .await
        .map_err(|err| ApiError::internal_message(err.to_string()))?;
    log_info(
        "ingress",
        "Status report accepted",
        &[
            ("type", task_type),
            ("job", task_id),
            ("node", node_id),
            ("event", response.event.as_str()),
            ("action", response.action.as_str()),
        ],
    );
    Ok(())
}

pub async fn report_status(
    State(state): State<IngressState>,
    Path((task_type, task_id, node_id)): Path<(String, String, String)>,
    body: Body,
) -> Result<impl IntoResponse, ApiError> {
    let response: NodeTaskResponse = decode(body).await.inspect_err(|err| {
        log_warn(
            "ingress",
            "Rejected status report",
            &[("job", task_id.as_str()), ("status", err.status().as_str())],
        )
    })?;
    publish(&state, &task_type, &task_id, &node_id, &response).await?;
    Ok((StatusCode::OK, "ok"))
}

pub async fn report_upgrade_status(
    State(state): State<IngressState>,
    Path((task_id, node_id)): Path<(String, String)>,
    body: Body,
) -> Result<impl IntoResponse, ApiError> {
    let legacy: NodeUpgradeJobResponse = decode(body).await.inspect_err(|err| {
        log_warn(
            "ingress",
            "Rejected upgrade report",
            &[("job", task_id.as_str()), ("status", err.status().as_str())],
        )
    })?;
    let (event, action) = legacy_event(&legacy.status).ok_or_else(|| {
        ApiError::bad_request(format!("unknown upgrade status '{}'", legacy.status))
    })?;
    let response = NodeTaskResponse {
        node_name: node_id.clone(),
        event: event.to_string(),
        action: action.as_str().to_string(),
        reason: legacy.reason,
        ..NodeTaskResponse::default()
    };
    publish(&state, UpgradeKind::NAME, &task_id, &node_id, &response).await?;
    Ok((StatusCode::OK, "ok"))
}

pub async fn healthz() -> impl IntoResponse {
    (StatusCode::OK, "ok")
}
