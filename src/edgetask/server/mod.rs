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

//! Status ingress for agents that report over HTTP instead of the hub.

pub mod error;
pub mod handlers;

use crate::edgetask::logger::{log_error, log_info};
use crate::edgetask::messaging::MessageBus;
use crate::edgetask::util::error::with_context;
use axum::extract::DefaultBodyLimit;
use axum::routing::{get, post};
use axum::Router;
use std::error::Error;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

#[derive(Clone)]
pub struct IngressState {
    pub bus: Arc<MessageBus>,
}

pub fn build_router(bus: Arc<MessageBus>) -> Router {
    Router::new()
        .route(
            "/task/upgrade/name/{task_id}/node/{node_id}/status",
            post(handlers::report_upgrade_status),
        )
        .route(
            "/task/{task_type}/name/{task_id}/node/{node_id}/status",
            post(handlers::report_status),
        )
        .route("/healthz", get(handlers::healthz))
        // Handlers enforce their own limit so oversize bodies get a plain 413.
        .layer(DefaultBodyLimit::disable())
        .with_state(IngressState { bus })
}

pub async fn bind(listen: SocketAddr) -> Result<TcpListener, Box<dyn Error + Send + Sync>> {
    TcpListener::bind(listen)
        .await
        .map_err(|err| with_context(err, format!("failed to bind status ingress on {}", listen)))
}

/// Serves the ingress until `shutdown` fires.
pub async fn serve(
    listener: TcpListener,
    router: Router,
    shutdown: CancellationToken,
) -> Result<(), Box<dyn Error + Send + Sync>> {
    let local = listener
        .local_addr()
        .map(|addr| addr.to_string())
        .unwrap_or_default();
    log_info("ingress", "Status ingress listening", &[("addr", local.as_str())]);
    axum::serve(listener, router)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
        .map_err(|err| {
            let error_text = err.to_string();
            log_error("ingress", "Status ingress failed", &[("error", error_text.as_str())]);
            with_context(err, "status ingress terminated")
        })
}
