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

use std::sync::Arc;
use std::time::Duration;

use axum::body::{to_bytes, Body};
use axum::http::{Request, StatusCode};
use serde_json::json;
use tower::ServiceExt;

use edgetask::edgetask::fsm::{Action, EVENT_CHECK, EVENT_ROLLBACK, EVENT_UPGRADE};
use edgetask::edgetask::messaging::upstream::parse_report;
use edgetask::edgetask::messaging::{Message, MessageBus, TASK_MANAGER_TOPIC};
use edgetask::edgetask::server::build_router;
use edgetask::edgetask::server::handlers::{INGRESS_SOURCE, MAX_BODY_BYTES};

fn post(uri: &str, body: impl Into<Body>) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/json")
        .body(body.into())
        .expect("request")
}

async fn next_report(bus: &MessageBus) -> Option<Message> {
    tokio::time::timeout(Duration::from_millis(200), bus.receive(TASK_MANAGER_TOPIC))
        .await
        .ok()
        .flatten()
}

async fn body_text(response: axum::response::Response) -> String {
    let bytes = to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("body");
    String::from_utf8_lossy(&bytes).into_owned()
}

#[tokio::test]
async fn legacy_upgrade_status_is_translated() {
    let bus = Arc::new(MessageBus::new(16));
    let router = build_router(bus.clone());

    let body = json!({
        "UpgradeID": "upg-1",
        "HistoryID": "h-1",
        "NodeName": "edge-1",
        "FromVersion": "v1.17.0",
        "ToVersion": "v1.18.0",
        "Status": "upgrade_failed_rollback_success",
        "Reason": "keadm exited 1"
    });
    let response = router
        .oneshot(post(
            "/task/upgrade/name/upg-1/node/edge-1/status",
            body.to_string(),
        ))
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_text(response).await, "ok");

    let message = next_report(&bus).await.expect("published report");
    assert_eq!(message.route.source, INGRESS_SOURCE);
    assert_eq!(message.route.operation, "upgrade");
    assert_eq!(message.route.resource, "upgrade/upg-1/node/edge-1");
    let report = parse_report(&message).expect("report");
    assert_eq!(report.task_type, "upgrade");
    assert_eq!(report.job, "upg-1");
    assert_eq!(report.node, "edge-1");
    assert_eq!(report.event.event_type, EVENT_ROLLBACK);
    assert_eq!(report.event.action, Action::Failure);
    assert_eq!(report.event.reason.as_deref(), Some("keadm exited 1"));
}

#[tokio::test]
async fn legacy_success_maps_to_upgrade_success() {
    let bus = Arc::new(MessageBus::new(16));
    let response = build_router(bus.clone())
        .oneshot(post(
            "/task/upgrade/name/upg-2/node/edge-2/status",
            json!({"Status": "upgrade_success"}).to_string(),
        ))
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::OK);
    let report = parse_report(&next_report(&bus).await.expect("report")).expect("parse");
    assert_eq!(report.event.event_type, EVENT_UPGRADE);
    assert_eq!(report.event.action, Action::Success);
}

#[tokio::test]
async fn unknown_legacy_status_is_rejected() {
    let bus = Arc::new(MessageBus::new(16));
    let response = build_router(bus.clone())
        .oneshot(post(
            "/task/upgrade/name/upg-3/node/edge-3/status",
            json!({"Status": "upgrade_maybe"}).to_string(),
        ))
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert!(body_text(response).await.contains("upgrade_maybe"));
    assert!(next_report(&bus).await.is_none());
}

#[tokio::test]
async fn generic_status_is_forwarded_verbatim() {
    let bus = Arc::new(MessageBus::new(16));
    let body = json!({
        "NodeName": "edge-4",
        "Event": "Check",
        "Action": "Success",
        "ExternalMessage": "[]"
    });
    let response = build_router(bus.clone())
        .oneshot(post(
            "/task/prepull/name/pp-1/node/edge-4/status",
            body.to_string(),
        ))
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::OK);

    let message = next_report(&bus).await.expect("report");
    assert_eq!(message.route.operation, "prepull");
    let report = parse_report(&message).expect("parse");
    assert_eq!(report.job, "pp-1");
    assert_eq!(report.node, "edge-4");
    assert_eq!(report.event.event_type, EVENT_CHECK);
    assert_eq!(report.event.action, Action::Success);
    assert_eq!(report.event.external.as_deref(), Some("[]"));
}

#[tokio::test]
async fn malformed_body_is_a_bad_request() {
    let bus = Arc::new(MessageBus::new(16));
    let response = build_router(bus.clone())
        .oneshot(post(
            "/task/configupdate/name/cfg-1/node/edge-1/status",
            "{not json",
        ))
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert!(next_report(&bus).await.is_none());
}

#[tokio::test]
async fn oversize_body_is_rejected_before_decoding() {
    let bus = Arc::new(MessageBus::new(16));
    let body = vec![b' '; 4 * 1024 * 1024];
    let response = build_router(bus.clone())
        .oneshot(post("/task/upgrade/name/upg-4/node/edge-1/status", body))
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
    assert!(next_report(&bus).await.is_none());
}

#[tokio::test]
async fn body_at_the_limit_is_accepted() {
    let bus = Arc::new(MessageBus::new(16));
    let mut body = json!({"NodeName": "edge-5", "Event": "Init", "Action": "Success"})
        .to_string()
        .into_bytes();
    body.resize(MAX_BODY_BYTES, b' ');
    let response = build_router(bus.clone())
        .oneshot(post("/task/configupdate/name/cfg-2/node/edge-5/status", body))
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::OK);
    let report = parse_report(&next_report(&bus).await.expect("report")).expect("parse");
    assert_eq!(report.node, "edge-5");
}

#[tokio::test]
async fn healthz_reports_ok() {
    let bus = Arc::new(MessageBus::new(16));
    let response = build_router(bus)
        .oneshot(
            Request::builder()
                .uri("/healthz")
                .body(Body::empty())
                .expect("request"),
        )
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_text(response).await, "ok");
}
