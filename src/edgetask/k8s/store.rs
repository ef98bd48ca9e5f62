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

//! Declarative store interfaces consumed by the controllers, plus an
//! in-memory implementation used by the binary and the tests.
//!
//! Objects travel as `serde_json::Value` so callers decide how strictly to
//! type them. Writes follow Kubernetes conventions: every mutation bumps a
//! store-wide resource version, and a patch carrying
//! `metadata.resourceVersion` only applies if that version is current.

use super::meta::LabelSelector;
use super::node::Node;
use crate::edgetask::util::merge_patch::apply_merge_patch;
use chrono::{SecondsFormat, Utc};
use futures_util::stream::BoxStream;
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, RwLock};
use tokio::sync::broadcast;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::StreamExt;

pub const STATUS_SUBRESOURCE: &str = "status";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    NotFound(String),
    AlreadyExists(String),
    Conflict(String),
    Invalid(String),
    Decode(String),
    WatchLagged(u64),
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoreError::NotFound(msg)
            | StoreError::AlreadyExists(msg)
            | StoreError::Conflict(msg)
            | StoreError::Invalid(msg) => f.write_str(msg),
            StoreError::Decode(msg) => write!(f, "failed to decode object: {}", msg),
            StoreError::WatchLagged(count) => write!(f, "watch lagged by {} events", count),
        }
    }
}

impl std::error::Error for StoreError {}

impl StoreError {
    pub fn is_conflict(&self) -> bool {
        matches!(self, StoreError::Conflict(_))
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound(_))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchEventType {
    Added,
    Modified,
    Deleted,
}

#[derive(Debug, Clone)]
pub struct WatchEvent {
    pub event_type: WatchEventType,
    pub object: Value,
}

pub type StoreFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, StoreError>> + Send + 'a>>;
pub type WatchStream = BoxStream<'static, Result<WatchEvent, StoreError>>;

pub trait ObjectStore: Send + Sync {
    fn list<'a>(&'a self, kind: &'a str) -> StoreFuture<'a, Vec<Value>>;

    fn get<'a>(&'a self, kind: &'a str, name: &'a str) -> StoreFuture<'a, Value>;

    /// Applies a JSON merge patch. With `subresource == Some("status")` only
    /// the patch's `status` member is applied.
    fn patch<'a>(
        &'a self,
        kind: &'a str,
        name: &'a str,
        subresource: Option<&'a str>,
        patch: &'a Value,
    ) -> StoreFuture<'a, Value>;

    /// Subscribes to changes of `kind`. Events published before the call are
    /// not replayed.
    fn watch(&self, kind: &str) -> Result<WatchStream, StoreError>;
}

pub trait NodeLister: Send + Sync {
    fn get_node<'a>(&'a self, name: &'a str) -> StoreFuture<'a, Node>;

    fn list_nodes<'a>(&'a self, selector: Option<&'a LabelSelector>)
        -> StoreFuture<'a, Vec<Node>>;
}

pub fn object_name(object: &Value) -> Option<&str> {
    object
        .get("metadata")
        .and_then(|meta| meta.get("name"))
        .and_then(Value::as_str)
        .filter(|name| !name.is_empty())
}

pub fn resource_version(object: &Value) -> Option<&str> {
    object
        .get("metadata")
        .and_then(|meta| meta.get("resourceVersion"))
        .and_then(Value::as_str)
}

fn metadata_mut(object: &mut Value) -> Result<&mut Map<String, Value>, StoreError> {
    let members = object
        .as_object_mut()
        .ok_or_else(|| StoreError::Invalid("object must be a JSON object".to_string()))?;
    let metadata = members
        .entry("metadata")
        .or_insert_with(|| Value::Object(Map::new()));
    metadata
        .as_object_mut()
        .ok_or_else(|| StoreError::Invalid("metadata must be a JSON object".to_string()))
}

#[derive(Default)]
struct StoreState {
    objects: HashMap<String, BTreeMap<String, Value>>,
    nodes: BTreeMap<String, Node>,
}

pub struct InMemoryStore {
    state: RwLock<StoreState>,
    version: AtomicU64,
    watchers: Mutex<HashMap<String, broadcast::Sender<WatchEvent>>>,
    capacity: usize,
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new(1024)
    }
}

impl InMemoryStore {
    pub fn new(watch_capacity: usize) -> Self {
        Self {
            state: RwLock::new(StoreState::default()),
            version: AtomicU64::new(0),
            watchers: Mutex::new(HashMap::new()),
            capacity: watch_capacity.max(1),
        }
    }

    fn next_version(&self) -> String {
        (self.version.fetch_add(1, Ordering::SeqCst) + 1).to_string()
    }

    fn sender_for(&self, kind: &str) -> broadcast::Sender<WatchEvent> {
        let mut watchers = self
            .watchers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        watchers
            .entry(kind.to_string())
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .clone()
    }

    fn notify(&self, kind: &str, event_type: WatchEventType, object: Value) {
        // No subscribers is not an error.
        let _ = self.sender_for(kind).send(WatchEvent { event_type, object });
    }

    fn read_state(&self) -> std::sync::RwLockReadGuard<'_, StoreState> {
        self.state
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write_state(&self) -> std::sync::RwLockWriteGuard<'_, StoreState> {
        self.state
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn create(&self, kind: &str, mut object: Value) -> Result<Value, StoreError> {
        let name = object_name(&object)
            .ok_or_else(|| StoreError::Invalid("metadata.name is required".to_string()))?
            .to_string();
        let stored = {
            let mut state = self.write_state();
            let objects = state.objects.entry(kind.to_string()).or_default();
            if objects.contains_key(&name) {
                return Err(StoreError::AlreadyExists(format!(
                    "{} '{}' already exists",
                    kind, name
                )));
            }
            let version = self.next_version();
            let metadata = metadata_mut(&mut object)?;
            metadata.insert("resourceVersion".into(), Value::String(version));
            metadata
                .entry("creationTimestamp")
                .or_insert_with(|| {
                    Value::String(Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true))
                });
            objects.insert(name, object.clone());
            self.notify(kind, WatchEventType::Added, object.clone());
            object
        };
        Ok(stored)
    }

    /// Replaces a whole object. A resource version on `object` must match.
    pub fn update(&self, kind: &str, mut object: Value) -> Result<Value, StoreError> {
        let name = object_name(&object)
            .ok_or_else(|| StoreError::Invalid("metadata.name is required".to_string()))?
            .to_string();
        let stored = {
            let mut state = self.write_state();
            let existing = state
                .objects
                .get_mut(kind)
                .and_then(|objects| objects.get_mut(&name))
                .ok_or_else(|| StoreError::NotFound(format!("{} '{}' not found", kind, name)))?;
            if let Some(expected) = resource_version(&object) {
                if Some(expected) != resource_version(existing) {
                    return Err(StoreError::Conflict(format!(
                        "{} '{}' was modified; resourceVersion {} is stale",
                        kind, name, expected
                    )));
                }
            }
            let version = self.next_version();
            metadata_mut(&mut object)?.insert("resourceVersion".into(), Value::String(version));
            *existing = object.clone();
            self.notify(kind, WatchEventType::Modified, object.clone());
            object
        };
        Ok(stored)
    }

    pub fn delete(&self, kind: &str, name: &str) -> Result<Value, StoreError> {
        let mut state = self.write_state();
        let removed = state
            .objects
            .get_mut(kind)
            .and_then(|objects| objects.remove(name))
            .ok_or_else(|| StoreError::NotFound(format!("{} '{}' not found", kind, name)))?;
        self.notify(kind, WatchEventType::Deleted, removed.clone());
        Ok(removed)
    }

    pub fn put_node(&self, node: Node) {
        let name = node.name().to_string();
        self.write_state().nodes.insert(name, node);
    }

    fn apply_patch(
        &self,
        kind: &str,
        name: &str,
        subresource: Option<&str>,
        patch: &Value,
    ) -> Result<Value, StoreError> {
        if !patch.is_object() {
            return Err(StoreError::Invalid(
                "merge patch must be a JSON object".to_string(),
            ));
        }
        let mut state = self.write_state();
        let existing = state
            .objects
            .get_mut(kind)
            .and_then(|objects| objects.get_mut(name))
            .ok_or_else(|| StoreError::NotFound(format!("{} '{}' not found", kind, name)))?;

        if let Some(expected) = resource_version(patch) {
            if Some(expected) != resource_version(existing) {
                return Err(StoreError::Conflict(format!(
                    "Operation cannot be fulfilled on {} '{}': the object has been modified",
                    kind, name
                )));
            }
        }

        let mut updated = existing.clone();
        match subresource {
            None => apply_merge_patch(&mut updated, patch),
            Some(STATUS_SUBRESOURCE) => {
                if let (Some(status_patch), Some(members)) =
                    (patch.get(STATUS_SUBRESOURCE), updated.as_object_mut())
                {
                    let status = members
                        .entry(STATUS_SUBRESOURCE)
                        .or_insert_with(|| Value::Object(Map::new()));
                    apply_merge_patch(status, status_patch);
                }
            }
            Some(other) => {
                return Err(StoreError::Invalid(format!(
                    "unsupported subresource '{}'",
                    other
                )))
            }
        }

        // Keep identity and version under store control.
        let current_version = resource_version(existing).map(str::to_string);
        let metadata = metadata_mut(&mut updated)?;
        metadata.insert("name".into(), Value::String(name.to_string()));
        match current_version {
            Some(version) => {
                metadata.insert("resourceVersion".into(), Value::String(version));
            }
            None => {
                metadata.remove("resourceVersion");
            }
        }

        if updated == *existing {
            return Ok(updated);
        }
        let version = self.next_version();
        metadata_mut(&mut updated)?.insert("resourceVersion".into(), Value::String(version));
        *existing = updated.clone();
        // Published under the write lock so watchers see versions in order.
        self.notify(kind, WatchEventType::Modified, updated.clone());
        Ok(updated)
    }
}

impl ObjectStore for InMemoryStore {
    fn list<'a>(&'a self, kind: &'a str) -> StoreFuture<'a, Vec<Value>> {
        let items = self
            .read_state()
            .objects
            .get(kind)
            .map(|objects| objects.values().cloned().collect())
            .unwrap_or_default();
        Box::pin(async move { Ok(items) })
    }

    fn get<'a>(&'a self, kind: &'a str, name: &'a str) -> StoreFuture<'a, Value> {
        let result = self
            .read_state()
            .objects
            .get(kind)
            .and_then(|objects| objects.get(name))
            .cloned()
            .ok_or_else(|| StoreError::NotFound(format!("{} '{}' not found", kind, name)));
        Box::pin(async move { result })
    }

    fn patch<'a>(
        &'a self,
        kind: &'a str,
        name: &'a str,
        subresource: Option<&'a str>,
        patch: &'a Value,
    ) -> StoreFuture<'a, Value> {
        let result = self.apply_patch(kind, name, subresource, patch);
        Box::pin(async move { result })
    }

    fn watch(&self, kind: &str) -> Result<WatchStream, StoreError> {
        let receiver = self.sender_for(kind).subscribe();
        let stream = BroadcastStream::new(receiver).map(|result| match result {
            Ok(event) => Ok(event),
            Err(BroadcastStreamRecvError::Lagged(skipped)) => Err(StoreError::WatchLagged(skipped)),
        });
        Ok(Box::pin(stream))
    }
}

impl NodeLister for InMemoryStore {
    fn get_node<'a>(&'a self, name: &'a str) -> StoreFuture<'a, Node> {
        let result = self
            .read_state()
            .nodes
            .get(name)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(format!("node '{}' not found", name)));
        Box::pin(async move { result })
    }

    fn list_nodes<'a>(
        &'a self,
        selector: Option<&'a LabelSelector>,
    ) -> StoreFuture<'a, Vec<Node>> {
        let nodes = self
            .read_state()
            .nodes
            .values()
            .filter(|node| {
                selector
                    .map(|selector| selector.matches(&node.metadata.labels))
                    .unwrap_or(true)
            })
            .cloned()
            .collect();
        Box::pin(async move { Ok(nodes) })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::time::Duration;
    use tokio::time::timeout;

    fn job(name: &str) -> Value {
        json!({
            "metadata": {"name": name},
            "spec": {"version": "v1.16.0"},
            "status": {}
        })
    }

    #[tokio::test]
    async fn create_assigns_versions_and_rejects_duplicates() {
        let store = InMemoryStore::default();
        let created = store.create("jobs", job("a")).expect("create");
        assert_eq!(resource_version(&created), Some("1"));
        assert!(created["metadata"]["creationTimestamp"].is_string());
        let err = store.create("jobs", job("a")).expect_err("duplicate");
        assert!(matches!(err, StoreError::AlreadyExists(_)));
        assert_eq!(store.list("jobs").await.expect("list").len(), 1);
        assert!(store.list("other").await.expect("list").is_empty());
    }

    #[tokio::test]
    async fn status_patch_only_touches_status_and_checks_version() {
        let store = InMemoryStore::default();
        store.create("jobs", job("a")).expect("create");

        let patch = json!({
            "metadata": {"resourceVersion": "1"},
            "spec": {"version": "evil"},
            "status": {"state": "Checking"}
        });
        let updated = store
            .patch("jobs", "a", Some(STATUS_SUBRESOURCE), &patch)
            .await
            .expect("patch");
        assert_eq!(updated["status"]["state"], "Checking");
        assert_eq!(updated["spec"]["version"], "v1.16.0");
        assert_eq!(resource_version(&updated), Some("2"));

        let stale = store
            .patch("jobs", "a", Some(STATUS_SUBRESOURCE), &patch)
            .await
            .expect_err("stale version");
        assert!(stale.is_conflict());
    }

    #[tokio::test]
    async fn repeated_patch_is_a_no_op() {
        let store = InMemoryStore::default();
        store.create("jobs", job("a")).expect("create");
        let patch = json!({"status": {"state": "Checking"}});
        let first = store
            .patch("jobs", "a", Some(STATUS_SUBRESOURCE), &patch)
            .await
            .expect("first");
        let second = store
            .patch("jobs", "a", Some(STATUS_SUBRESOURCE), &patch)
            .await
            .expect("second");
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn watch_sees_lifecycle_in_order() {
        let store = InMemoryStore::default();
        let mut watch = store.watch("jobs").expect("watch");
        store.create("jobs", job("a")).expect("create");
        store
            .patch("jobs", "a", None, &json!({"spec": {"version": "v1.17.0"}}))
            .await
            .expect("patch");
        store.delete("jobs", "a").expect("delete");

        let mut seen = Vec::new();
        for _ in 0..3 {
            let event = timeout(Duration::from_secs(1), watch.next())
                .await
                .expect("event in time")
                .expect("stream open")
                .expect("no lag");
            seen.push(event.event_type);
        }
        assert_eq!(
            seen,
            vec![
                WatchEventType::Added,
                WatchEventType::Modified,
                WatchEventType::Deleted
            ]
        );
    }

    #[tokio::test]
    async fn concurrent_writers_publish_versions_in_order() {
        let store = std::sync::Arc::new(InMemoryStore::default());
        let mut watch = store.watch("jobs").expect("watch");
        store.create("jobs", job("a")).expect("create");
        store.create("jobs", job("b")).expect("create");

        let writers: Vec<_> = ["a", "b"]
            .into_iter()
            .map(|name| {
                let store = std::sync::Arc::clone(&store);
                std::thread::spawn(move || {
                    for round in 0..200 {
                        let mut object = job(name);
                        object["spec"]["round"] = json!(round);
                        store.update("jobs", object).expect("update");
                    }
                })
            })
            .collect();
        for writer in writers {
            writer.join().expect("writer thread");
        }

        let mut last = 0u64;
        for _ in 0..402 {
            let event = timeout(Duration::from_secs(1), watch.next())
                .await
                .expect("event in time")
                .expect("stream open")
                .expect("no lag");
            let version: u64 = resource_version(&event.object)
                .expect("version")
                .parse()
                .expect("numeric version");
            assert!(version > last, "version {} after {}", version, last);
            last = version;
        }
    }

    #[tokio::test]
    async fn nodes_filter_by_selector() {
        let store = InMemoryStore::default();
        let mut edge: Node = serde_json::from_value(json!({
            "metadata": {"name": "edge-1", "labels": {"zone": "a"}}
        }))
        .expect("node");
        store.put_node(edge.clone());
        edge.metadata.name = Some("edge-2".into());
        edge.metadata.labels.insert("zone".into(), "b".into());
        store.put_node(edge);

        let selector: LabelSelector =
            serde_json::from_value(json!({"matchLabels": {"zone": "b"}})).expect("selector");
        let matched = store.list_nodes(Some(&selector)).await.expect("list");
        assert_eq!(matched.len(), 1);
        assert_eq!(matched[0].name(), "edge-2");
        assert_eq!(store.list_nodes(None).await.expect("all").len(), 2);
        assert!(store.get_node("missing").await.expect_err("missing").is_not_found());
    }
}
