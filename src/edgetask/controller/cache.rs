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

//! Name-keyed snapshot of one job kind, fed by the store's watch stream.

use crate::edgetask::k8s::store::{
    object_name, resource_version, ObjectStore, StoreError, WatchEvent, WatchEventType,
    WatchStream,
};
use crate::edgetask::logger::{log_debug, log_warn};
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use tokio::sync::mpsc;
use tokio_stream::StreamExt;
use tokio_util::sync::CancellationToken;

#[derive(Debug)]
pub enum CacheEvent<T> {
    Added(Arc<T>),
    Modified { old: Option<Arc<T>>, new: Arc<T> },
    Deleted(Arc<T>),
}

struct CacheEntry<T> {
    version: Option<String>,
    object: Arc<T>,
}

impl<T> Clone for CacheEntry<T> {
    fn clone(&self) -> Self {
        Self {
            version: self.version.clone(),
            object: Arc::clone(&self.object),
        }
    }
}

type Entries<T> = Arc<RwLock<HashMap<String, CacheEntry<T>>>>;

pub struct TaskCache<T> {
    kind: &'static str,
    entries: Entries<T>,
}

impl<T> TaskCache<T>
where
    T: DeserializeOwned + Send + Sync + 'static,
{
    pub fn new(kind: &'static str) -> Self {
        Self {
            kind,
            entries: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    pub fn get(&self, name: &str) -> Option<Arc<T>> {
        self.entries
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(name)
            .map(|entry| Arc::clone(&entry.object))
    }

    pub fn len(&self) -> usize {
        self.entries
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Seeds the cache with a List and spawns the watch forwarder.
    ///
    /// The watch is opened before listing so nothing written in between is
    /// lost. Returns the seeded objects and the event channel.
    pub async fn start(
        &self,
        store: Arc<dyn ObjectStore>,
        buffer: usize,
        shutdown: CancellationToken,
    ) -> Result<(Vec<Arc<T>>, mpsc::Receiver<CacheEvent<T>>), StoreError> {
        let watch = store.watch(self.kind)?;
        let listed = store.list(self.kind).await?;
        let seeded = {
            let mut entries = self
                .entries
                .write()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            entries.clear();
            let mut seeded = Vec::with_capacity(listed.len());
            for object in listed {
                if let Some((name, entry)) = decode_entry::<T>(self.kind, &object) {
                    seeded.push(Arc::clone(&entry.object));
                    entries.insert(name, entry);
                }
            }
            seeded
        };

        let (sender, receiver) = mpsc::channel(buffer.max(1));
        let forwarder = Forwarder {
            kind: self.kind,
            entries: Arc::clone(&self.entries),
            store,
            sender,
        };
        tokio::spawn(forwarder.run(watch, shutdown));
        Ok((seeded, receiver))
    }
}

fn decode_entry<T: DeserializeOwned>(kind: &str, object: &Value) -> Option<(String, CacheEntry<T>)> {
    let Some(name) = object_name(object) else {
        log_warn("cache", "Dropping object without a name", &[("kind", kind)]);
        return None;
    };
    match serde_json::from_value::<T>(object.clone()) {
        Ok(typed) => Some((
            name.to_string(),
            CacheEntry {
                version: resource_version(object).map(str::to_string),
                object: Arc::new(typed),
            },
        )),
        Err(err) => {
            let error_text = err.to_string();
            log_warn(
                "cache",
                "Dropping object of unsupported shape",
                &[("kind", kind), ("name", name), ("error", error_text.as_str())],
            );
            None
        }
    }
}

struct Forwarder<T> {
    kind: &'static str,
    entries: Entries<T>,
    store: Arc<dyn ObjectStore>,
    sender: mpsc::Sender<CacheEvent<T>>,
}

impl<T> Forwarder<T>
where
    T: DeserializeOwned + Send + Sync + 'static,
{
    async fn run(self, mut watch: WatchStream, shutdown: CancellationToken) {
        loop {
            let next = tokio::select! {
                _ = shutdown.cancelled() => return,
                next = watch.next() => next,
            };
            let events = match next {
                None => {
                    log_warn("cache", "Watch stream ended", &[("kind", self.kind)]);
                    return;
                }
                Some(Ok(event)) => self.apply(event).into_iter().collect::<Vec<_>>(),
                Some(Err(StoreError::WatchLagged(skipped))) => {
                    let skipped_text = skipped.to_string();
                    log_warn(
                        "cache",
                        "Watch lagged; resynchronising from list",
                        &[("kind", self.kind), ("skipped", skipped_text.as_str())],
                    );
                    self.resync().await
                }
                Some(Err(err)) => {
                    let error_text = err.to_string();
                    log_warn(
                        "cache",
                        "Watch error",
                        &[("kind", self.kind), ("error", error_text.as_str())],
                    );
                    continue;
                }
            };
            for event in events {
                if self.sender.send(event).await.is_err() {
                    log_debug("cache", "Event receiver dropped", &[("kind", self.kind)]);
                    return;
                }
            }
        }
    }

    fn write_entries(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<String, CacheEntry<T>>> {
        self.entries
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Updates the map and returns the event to forward, if any.
    fn apply(&self, event: WatchEvent) -> Option<CacheEvent<T>> {
        if event.event_type == WatchEventType::Deleted {
            let name = object_name(&event.object)?;
            let removed = self.write_entries().remove(name)?;
            return Some(CacheEvent::Deleted(removed.object));
        }

        let (name, entry) = decode_entry::<T>(self.kind, &event.object)?;
        let new = Arc::clone(&entry.object);
        let previous = self.write_entries().insert(name, entry.clone());
        match previous {
            // Already seen through the initial list.
            Some(old) if old.version.is_some() && old.version == entry.version => None,
            Some(old) => Some(CacheEvent::Modified {
                old: Some(old.object),
                new,
            }),
            None if event.event_type == WatchEventType::Added => Some(CacheEvent::Added(new)),
            None => Some(CacheEvent::Modified { old: None, new }),
        }
    }

    async fn resync(&self) -> Vec<CacheEvent<T>> {
        let listed = match self.store.list(self.kind).await {
            Ok(listed) => listed,
            Err(err) => {
                let error_text = err.to_string();
                log_warn(
                    "cache",
                    "Resync list failed",
                    &[("kind", self.kind), ("error", error_text.as_str())],
                );
                return Vec::new();
            }
        };
        let fresh: HashMap<String, CacheEntry<T>> = listed
            .iter()
            .filter_map(|object| decode_entry::<T>(self.kind, object))
            .collect();

        let mut entries = self.write_entries();
        let mut events = Vec::new();
        for (name, old) in entries.iter() {
            if !fresh.contains_key(name) {
                events.push(CacheEvent::Deleted(Arc::clone(&old.object)));
            }
        }
        for (name, entry) in &fresh {
            match entries.get(name) {
                Some(old) if old.version == entry.version => {}
                Some(old) => events.push(CacheEvent::Modified {
                    old: Some(Arc::clone(&old.object)),
                    new: Arc::clone(&entry.object),
                }),
                None => events.push(CacheEvent::Added(Arc::clone(&entry.object))),
            }
        }
        *entries = fresh;
        events
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::edgetask::k8s::job::NodeUpgradeJob;
    use crate::edgetask::k8s::store::{InMemoryStore, STATUS_SUBRESOURCE};
    use serde_json::json;
    use std::time::Duration;
    use tokio::time::timeout;

    fn upgrade(name: &str) -> Value {
        json!({
            "metadata": {"name": name},
            "spec": {"version": "v1.16.0", "nodeNames": ["n1"]}
        })
    }

    async fn next_event<T>(receiver: &mut mpsc::Receiver<CacheEvent<T>>) -> CacheEvent<T> {
        timeout(Duration::from_secs(1), receiver.recv())
            .await
            .expect("event in time")
            .expect("channel open")
    }

    #[tokio::test]
    async fn seeds_from_list_then_follows_watch() {
        let store = Arc::new(InMemoryStore::default());
        store.create("nodeupgradejobs", upgrade("seeded")).expect("create");
        store
            .create("nodeupgradejobs", json!({"metadata": {"name": "broken"}, "spec": 7}))
            .expect("create");

        let cache: TaskCache<NodeUpgradeJob> = TaskCache::new("nodeupgradejobs");
        let (seeded, mut events) = cache
            .start(store.clone(), 16, CancellationToken::new())
            .await
            .expect("start");
        assert_eq!(seeded.len(), 1);
        assert_eq!(cache.len(), 1);

        store.create("nodeupgradejobs", upgrade("fresh")).expect("create");
        match next_event(&mut events).await {
            CacheEvent::Added(job) => assert_eq!(job.name(), "fresh"),
            other => panic!("unexpected event {other:?}"),
        }

        store
            .patch(
                "nodeupgradejobs",
                "fresh",
                Some(STATUS_SUBRESOURCE),
                &json!({"status": {"state": "Checking"}}),
            )
            .await
            .expect("patch");
        match next_event(&mut events).await {
            CacheEvent::Modified { old, new } => {
                assert_eq!(old.expect("old").status.state, None);
                assert!(new.status.state.is_some());
            }
            other => panic!("unexpected event {other:?}"),
        }
        assert!(cache.get("fresh").expect("cached").status.state.is_some());

        store.delete("nodeupgradejobs", "fresh").expect("delete");
        match next_event(&mut events).await {
            CacheEvent::Deleted(job) => assert_eq!(job.name(), "fresh"),
            other => panic!("unexpected event {other:?}"),
        }
        assert!(cache.get("fresh").is_none());
    }

    #[tokio::test]
    async fn forwarder_stops_on_shutdown() {
        let store = Arc::new(InMemoryStore::default());
        let cache: TaskCache<NodeUpgradeJob> = TaskCache::new("nodeupgradejobs");
        let shutdown = CancellationToken::new();
        let (_, mut events) = cache
            .start(store.clone(), 4, shutdown.clone())
            .await
            .expect("start");
        shutdown.cancel();
        let closed = timeout(Duration::from_secs(1), events.recv())
            .await
            .expect("closed in time");
        assert!(closed.is_none());
    }
}
