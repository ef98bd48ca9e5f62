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

//! In-process message bus between the task manager and the edge-facing hub.
//!
//! Each topic is a bounded work queue: every message is delivered to exactly
//! one receiver, so several workers can drain a topic concurrently.

pub mod downstream;
pub mod upstream;

use chrono::Utc;
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, Mutex as AsyncMutex};
use uuid::Uuid;

/// Topic drained by the upstream router.
pub const TASK_MANAGER_TOPIC: &str = "taskmanager";
/// Topic carrying commands towards edge agents.
pub const CLOUD_HUB_TOPIC: &str = "cloudhub";

pub const TASK_MANAGER_MODULE: &str = "taskmanager";
pub const TASK_MANAGER_GROUP: &str = "taskmanager";
pub const NODE_UPGRADE_MODULE: &str = "nodeupgradejobcontroller";
pub const NODE_UPGRADE_GROUP: &str = "nodeupgradejobcontroller";

const RESOURCE_SEPARATOR: char = '/';

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageRoute {
    pub source: String,
    pub group: String,
    pub resource: String,
    pub operation: String,
}

#[derive(Debug, Clone)]
pub struct Message {
    pub id: String,
    pub route: MessageRoute,
    pub body: Vec<u8>,
    /// Milliseconds since the Unix epoch.
    pub timestamp: i64,
}

impl Message {
    pub fn new(route: MessageRoute, body: Vec<u8>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            route,
            body,
            timestamp: Utc::now().timestamp_millis(),
        }
    }

    pub fn json<T: Serialize>(route: MessageRoute, body: &T) -> Result<Self, serde_json::Error> {
        Ok(Self::new(route, serde_json::to_vec(body)?))
    }
}

/// Builds `{kind}/{job}/node/{node}`.
pub fn build_task_resource(kind: &str, job: &str, node: &str) -> String {
    [kind, job, "node", node].join("/")
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskResource {
    pub kind: String,
    pub job: String,
    pub node: String,
}

impl TaskResource {
    /// Parses a task resource. Extra trailing segments are ignored.
    pub fn parse(resource: &str) -> Result<Self, RouteError> {
        let segments: Vec<&str> = resource.split(RESOURCE_SEPARATOR).collect();
        if segments.len() < 4 {
            return Err(RouteError::InvalidResource(resource.to_string()));
        }
        let (kind, job, node) = (segments[0], segments[1], segments[3]);
        if job.is_empty() || node.is_empty() {
            return Err(RouteError::InvalidResource(resource.to_string()));
        }
        Ok(Self {
            kind: kind.to_string(),
            job: job.to_string(),
            node: node.to_string(),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouteError {
    InvalidResource(String),
    InvalidBody(String),
    InvalidAction(String),
}

impl fmt::Display for RouteError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RouteError::InvalidResource(resource) => {
                write!(f, "resource '{}' is not a task resource", resource)
            }
            RouteError::InvalidBody(err) => write!(f, "failed to decode message body: {}", err),
            RouteError::InvalidAction(action) => write!(f, "unknown action '{}'", action),
        }
    }
}

impl std::error::Error for RouteError {}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BusError {
    Closed(String),
}

impl fmt::Display for BusError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BusError::Closed(topic) => write!(f, "message topic '{}' is closed", topic),
        }
    }
}

impl std::error::Error for BusError {}

/// Bounded multi-consumer queue.
pub struct WorkQueue<T> {
    inner: Arc<WorkQueueInner<T>>,
}

struct WorkQueueInner<T> {
    sender: mpsc::Sender<T>,
    receiver: AsyncMutex<mpsc::Receiver<T>>,
}

impl<T> Clone for WorkQueue<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> WorkQueue<T>
where
    T: Send + 'static,
{
    pub fn new(capacity: usize) -> Self {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        Self {
            inner: Arc::new(WorkQueueInner {
                sender,
                receiver: AsyncMutex::new(receiver),
            }),
        }
    }

    pub async fn enqueue(&self, item: T) -> Result<(), mpsc::error::SendError<T>> {
        self.inner.sender.send(item).await
    }

    pub async fn next(&self) -> Option<T> {
        let mut guard = self.inner.receiver.lock().await;
        guard.recv().await
    }
}

pub struct MessageBus {
    topics: Mutex<HashMap<String, WorkQueue<Message>>>,
    capacity: usize,
}

impl MessageBus {
    pub fn new(capacity: usize) -> Self {
        Self {
            topics: Mutex::new(HashMap::new()),
            capacity,
        }
    }

    fn queue_for(&self, topic: &str) -> WorkQueue<Message> {
        let mut topics = self
            .topics
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        topics
            .entry(topic.to_string())
            .or_insert_with(|| WorkQueue::new(self.capacity))
            .clone()
    }

    pub async fn send(&self, topic: &str, message: Message) -> Result<(), BusError> {
        self.queue_for(topic)
            .enqueue(message)
            .await
            .map_err(|_| BusError::Closed(topic.to_string()))
    }

    /// Waits for the next message on `topic`.
    pub async fn receive(&self, topic: &str) -> Option<Message> {
        self.queue_for(topic).next().await
    }
}
