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

//! Generic controller shared by every job kind.
//!
//! A [`TaskKind`] supplies what differs between kinds (store resource, FSM
//! table, request payload, eligibility); [`TaskController`] does the rest:
//! caching, event translation, FSM transit and status patching.

use super::cache::{CacheEvent, TaskCache};
use super::{
    CommandFuture, Controller, ControllerError, ControllerFuture, TaskMessage,
    DEFAULT_CONCURRENCY, DEFAULT_FAILURE_TOLERANCE,
};
use crate::edgetask::fsm::{
    effective_state, Event, Fsm, FsmError, FsmSpec, StateAccess, StateFuture, TaskState,
};
use crate::edgetask::k8s::job::{node_updated, JobSpec, JobStatus, TaskJob, TaskStatus};
use crate::edgetask::k8s::node::Node;
use crate::edgetask::k8s::store::{
    resource_version, NodeLister, ObjectStore, StoreError, STATUS_SUBRESOURCE,
};
use crate::edgetask::logger::{log_debug, log_error, log_info, log_warn};
use crate::edgetask::messaging::downstream::build_task_command;
use crate::edgetask::messaging::Message;
use crate::edgetask::observability::tracing::with_span;
use crate::edgetask::util::merge_patch::create_merge_patch;
use crate::edgetask::util::version::remove_duplicates;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;

const PATCH_ATTEMPTS: u32 = 3;
const PATCH_BACKOFF: Duration = Duration::from_millis(100);
const CHECK_INTERVAL: Duration = Duration::from_millis(100);
const CHECK_TIMEOUT: Duration = Duration::from_secs(1);

/// Kind-specific behaviour plugged into [`TaskController`].
pub trait TaskKind: Send + Sync + 'static {
    type Spec: JobSpec + Clone + Serialize + DeserializeOwned + Send + Sync + 'static;

    /// Task type on the wire, e.g. `upgrade`.
    const NAME: &'static str;
    /// Store resource holding jobs of this kind.
    const RESOURCE: &'static str;

    fn fsm() -> &'static FsmSpec;

    /// Builds the request item agents receive for this job.
    fn request(job: &TaskJob<Self::Spec>) -> Result<Value, ControllerError>;

    /// Extra eligibility beyond edge role and readiness.
    fn node_eligible(_task: &TaskMessage, _node: &Node) -> bool {
        true
    }

    /// Decodes the event's external payload into a status extension.
    fn extension(_event: &Event) -> Option<Value> {
        None
    }

    /// Replaces the generic command for nodes that need an older protocol.
    fn legacy_command(_task: &TaskMessage, _node: &Node) -> Option<Message> {
        None
    }
}

pub struct TaskController<K: TaskKind> {
    store: Arc<dyn ObjectStore>,
    nodes: Arc<dyn NodeLister>,
    cache: TaskCache<TaskJob<K::Spec>>,
    messages: mpsc::Sender<TaskMessage>,
    cache_buffer: usize,
    transit_lock: Mutex<()>,
    _kind: PhantomData<fn() -> K>,
}

impl<K: TaskKind> TaskController<K> {
    pub fn new(
        store: Arc<dyn ObjectStore>,
        nodes: Arc<dyn NodeLister>,
        messages: mpsc::Sender<TaskMessage>,
        cache_buffer: usize,
    ) -> Self {
        Self {
            store,
            nodes,
            cache: TaskCache::new(K::RESOURCE),
            messages,
            cache_buffer,
            transit_lock: Mutex::new(()),
            _kind: PhantomData,
        }
    }

    pub fn cache(&self) -> &TaskCache<TaskJob<K::Spec>> {
        &self.cache
    }

    async fn fetch(&self, name: &str) -> Result<(TaskJob<K::Spec>, Option<String>), ControllerError> {
        let raw = self.store.get(K::RESOURCE, name).await?;
        let version = resource_version(&raw).map(str::to_string);
        let job = serde_json::from_value(raw)
            .map_err(|err| ControllerError::Decode(format!("{}/{}: {}", K::RESOURCE, name, err)))?;
        Ok((job, version))
    }

    /// Read-modify-patch of the job status, retried on version conflicts.
    async fn patch_status<F>(&self, name: &str, mutate: F) -> Result<(), ControllerError>
    where
        F: Fn(&mut JobStatus) -> Result<(), ControllerError>,
    {
        let mut attempt = 0;
        loop {
            let (job, version) = self.fetch(name).await?;
            let old = serde_json::to_value(&job)
                .map_err(|err| ControllerError::Decode(err.to_string()))?;
            let mut updated = job;
            mutate(&mut updated.status)?;
            let new = serde_json::to_value(&updated)
                .map_err(|err| ControllerError::Decode(err.to_string()))?;

            let mut patch = create_merge_patch(&old, &new);
            if let (Some(version), Some(members)) = (version, patch.as_object_mut()) {
                members.insert(
                    "metadata".to_string(),
                    serde_json::json!({ "resourceVersion": version }),
                );
            }

            match self
                .store
                .patch(K::RESOURCE, name, Some(STATUS_SUBRESOURCE), &patch)
                .await
            {
                Ok(_) => return Ok(()),
                Err(StoreError::Conflict(message)) if attempt + 1 < PATCH_ATTEMPTS => {
                    let backoff = PATCH_BACKOFF * 2u32.pow(attempt);
                    let attempt_text = (attempt + 1).to_string();
                    log_debug(
                        K::NAME,
                        "Status patch conflicted; retrying",
                        &[
                            ("job", name),
                            ("attempt", attempt_text.as_str()),
                            ("reason", message.as_str()),
                        ],
                    );
                    tokio::time::sleep(backoff).await;
                    attempt += 1;
                }
                Err(err) => return Err(err.into()),
            }
        }
    }

    /// Polls the cache until `observe` reports something other than
    /// `previous`. Best effort: gives up quietly after a second.
    async fn wait_for_cache<F>(&self, job: &str, previous: TaskState, observe: F)
    where
        F: Fn(&TaskJob<K::Spec>) -> TaskState,
    {
        let deadline = tokio::time::Instant::now() + CHECK_TIMEOUT;
        loop {
            if let Some(cached) = self.cache.get(job) {
                if observe(&cached) != previous {
                    return;
                }
            }
            if tokio::time::Instant::now() >= deadline {
                log_debug(K::NAME, "Cache did not observe transition in time", &[("job", job)]);
                return;
            }
            tokio::time::sleep(CHECK_INTERVAL).await;
        }
    }

    fn task_message(&self, job: &TaskJob<K::Spec>) -> Result<TaskMessage, ControllerError> {
        let template = job.spec.template();
        let payload = K::request(job)?;
        let failure_tolerate = match parse_tolerance(&template.failure_tolerate) {
            Ok(value) => value,
            Err(error_text) => {
                log_warn(
                    K::NAME,
                    "Invalid failure tolerance; using default",
                    &[
                        ("job", job.name()),
                        ("value", template.failure_tolerate.as_str()),
                        ("error", error_text.as_str()),
                    ],
                );
                DEFAULT_FAILURE_TOLERANCE
            }
        };
        let concurrency = if template.concurrency <= 0 {
            DEFAULT_CONCURRENCY
        } else {
            template.concurrency as usize
        };
        Ok(TaskMessage {
            kind: K::NAME.to_string(),
            name: job.name().to_string(),
            timeout_seconds: template.timeout_seconds,
            concurrency,
            failure_tolerate,
            node_names: template.node_names.clone(),
            label_selector: template.label_selector.clone(),
            check_items: template.check_items.clone(),
            status: TaskStatus::default(),
            payload,
            shutdown: false,
        })
    }

    async fn emit(&self, message: TaskMessage) {
        if self.messages.send(message).await.is_err() {
            log_error(K::NAME, "Task message channel closed", &[]);
        }
    }

    async fn job_added(&self, job: &TaskJob<K::Spec>) {
        if job.is_finished() {
            log_debug(K::NAME, "Job already finished; ignoring", &[("job", job.name())]);
            return;
        }
        match self.task_message(job) {
            Ok(message) => {
                log_info(K::NAME, "Job admitted", &[("job", job.name())]);
                self.emit(message).await;
            }
            Err(err) => {
                let error_text = err.to_string();
                log_error(
                    K::NAME,
                    "Failed to build task message",
                    &[("job", job.name()), ("error", error_text.as_str())],
                );
            }
        }
    }

    async fn job_deleted(&self, job: &TaskJob<K::Spec>) {
        log_info(K::NAME, "Job deleted; stopping executor", &[("job", job.name())]);
        self.emit(TaskMessage::shutdown(K::NAME, job.name())).await;
    }

    async fn job_modified(&self, old: Option<&TaskJob<K::Spec>>, new: &TaskJob<K::Spec>) {
        let Some(old) = old else {
            self.job_added(new).await;
            return;
        };
        if new.is_finished() {
            if !old.is_finished() {
                log_info(K::NAME, "Job finished; stopping executor", &[("job", new.name())]);
                self.emit(TaskMessage::shutdown(K::NAME, new.name())).await;
            }
            return;
        }
        if old.status.node_status.is_empty() {
            return;
        }
        let changed: Vec<&TaskStatus> = new
            .status
            .node_status
            .iter()
            .enumerate()
            .filter(|(index, entry)| {
                old.status
                    .node_status
                    .get(*index)
                    .map(|previous| node_updated(previous, entry))
                    .unwrap_or(false)
            })
            .map(|(_, entry)| entry)
            .collect();
        if changed.is_empty() {
            return;
        }
        let base = match self.task_message(new) {
            Ok(message) => message,
            Err(err) => {
                let error_text = err.to_string();
                log_error(
                    K::NAME,
                    "Failed to build task message",
                    &[("job", new.name()), ("error", error_text.as_str())],
                );
                return;
            }
        };
        for entry in changed {
            let mut message = base.clone();
            message.status = entry.clone();
            self.emit(message).await;
        }
    }

    async fn run_events(
        self: Arc<Self>,
        mut events: mpsc::Receiver<CacheEvent<TaskJob<K::Spec>>>,
        shutdown: CancellationToken,
    ) {
        loop {
            let event = tokio::select! {
                _ = shutdown.cancelled() => {
                    log_info(K::NAME, "Stopping job sync", &[]);
                    return;
                }
                event = events.recv() => match event {
                    Some(event) => event,
                    None => return,
                },
            };
            match event {
                CacheEvent::Added(job) => self.job_added(&job).await,
                CacheEvent::Modified { old, new } => self.job_modified(old.as_deref(), &new).await,
                CacheEvent::Deleted(job) => self.job_deleted(&job).await,
            }
        }
    }

    /// Records a job-level `TimeOut/Failure` when a node status could not be
    /// persisted.
    async fn fail_job(&self, job: &str, node: &str, message: &str) {
        let reason = format!("failed to record status of node {}: {}", node, message);
        let fsm = Fsm::new(
            K::fsm(),
            JobState::<K> {
                controller: self,
                job,
            },
        );
        let _guard = self.transit_lock.lock().await;
        match fsm.transit(&Event::timeout(reason.clone())).await {
            Ok(state) => {
                let state_text = state.to_string();
                log_warn(
                    K::NAME,
                    "Job failed on node status write",
                    &[
                        ("job", job),
                        ("state", state_text.as_str()),
                        ("reason", reason.as_str()),
                    ],
                );
            }
            Err(err) => {
                let error_text = err.to_string();
                log_error(
                    K::NAME,
                    "Failed to record job failure",
                    &[("job", job), ("error", error_text.as_str())],
                );
            }
        }
    }

    async fn resolve_nodes(&self, task: &TaskMessage) -> Result<Vec<Node>, ControllerError> {
        if !task.node_names.is_empty() {
            let mut nodes = Vec::new();
            for name in remove_duplicates(&task.node_names) {
                match self.nodes.get_node(&name).await {
                    Ok(node) => nodes.push(node),
                    Err(err) if err.is_not_found() => {
                        log_warn(
                            K::NAME,
                            "Target node not found; skipping",
                            &[("job", task.name.as_str()), ("node", name.as_str())],
                        );
                    }
                    Err(err) => return Err(err.into()),
                }
            }
            return Ok(nodes);
        }
        match task.label_selector.as_ref() {
            Some(selector) => Ok(self.nodes.list_nodes(Some(selector)).await?),
            None => Ok(Vec::new()),
        }
    }
}

struct JobState<'a, K: TaskKind> {
    controller: &'a TaskController<K>,
    job: &'a str,
}

impl<K: TaskKind> StateAccess for JobState<'_, K> {
    fn load(&self) -> StateFuture<'_, Option<TaskState>> {
        Box::pin(async move {
            let (job, _) = self
                .controller
                .fetch(self.job)
                .await
                .map_err(|err| FsmError::Load(err.to_string()))?;
            Ok(job.status.state)
        })
    }

    fn store<'a>(
        &'a self,
        from: TaskState,
        next: TaskState,
        event: &'a Event,
    ) -> StateFuture<'a, ()> {
        Box::pin(async move {
            self.controller
                .patch_status(self.job, |status| {
                    ensure_state(from, status.state)?;
                    status.record(next, event);
                    Ok(())
                })
                .await
                .map_err(into_fsm_error)
        })
    }
}

struct NodeState<'a, K: TaskKind> {
    controller: &'a TaskController<K>,
    job: &'a str,
    node: &'a str,
}

impl<K: TaskKind> StateAccess for NodeState<'_, K> {
    fn load(&self) -> StateFuture<'_, Option<TaskState>> {
        Box::pin(async move {
            let (job, _) = self
                .controller
                .fetch(self.job)
                .await
                .map_err(|err| FsmError::Load(err.to_string()))?;
            job.status
                .node_status
                .iter()
                .find(|entry| entry.node_name == self.node)
                .map(|entry| entry.state)
                .ok_or_else(|| {
                    FsmError::Load(ControllerError::NodeNotFound(self.node.to_string()).to_string())
                })
        })
    }

    fn store<'a>(
        &'a self,
        from: TaskState,
        next: TaskState,
        event: &'a Event,
    ) -> StateFuture<'a, ()> {
        let extension = K::extension(event);
        Box::pin(async move {
            self.controller
                .patch_status(self.job, |status| {
                    let entry = status
                        .node_status
                        .iter_mut()
                        .find(|entry| entry.node_name == self.node)
                        .ok_or_else(|| ControllerError::NodeNotFound(self.node.to_string()))?;
                    ensure_state(from, entry.state)?;
                    entry.record(next, event);
                    if extension.is_some() {
                        entry.extension = extension.clone();
                    }
                    Ok(())
                })
                .await
                .map_err(into_fsm_error)
        })
    }
}

/// A failure tolerance is a ratio in `[0, 1]`.
fn parse_tolerance(raw: &str) -> Result<f64, String> {
    let value = raw.trim().parse::<f64>().map_err(|err| err.to_string())?;
    if (0.0..=1.0).contains(&value) {
        Ok(value)
    } else {
        Err(format!("{} is outside [0, 1]", value))
    }
}

/// Re-checked on every patch attempt against the freshly loaded object.
fn ensure_state(from: TaskState, stored: Option<TaskState>) -> Result<(), ControllerError> {
    let found = effective_state(stored);
    if found == from {
        Ok(())
    } else {
        Err(ControllerError::Fsm(FsmError::Stale {
            expected: from,
            found,
        }))
    }
}

fn into_fsm_error(err: ControllerError) -> FsmError {
    match err {
        ControllerError::Fsm(err) => err,
        other => FsmError::Store(other.to_string()),
    }
}

fn node_state_of<S>(job: &TaskJob<S>, node: &str) -> TaskState {
    effective_state(
        job.status
            .node_status
            .iter()
            .find(|entry| entry.node_name == node)
            .and_then(|entry| entry.state),
    )
}

impl<K: TaskKind> Controller for TaskController<K> {
    fn name(&self) -> &'static str {
        K::NAME
    }

    fn start(self: Arc<Self>, shutdown: CancellationToken) -> ControllerFuture<'static, ()> {
        Box::pin(async move {
            let (seeded, events) = self
                .cache
                .start(Arc::clone(&self.store), self.cache_buffer, shutdown.clone())
                .await?;
            let seeded_text = seeded.len().to_string();
            log_info(
                K::NAME,
                "Job cache synchronised",
                &[("resource", K::RESOURCE), ("jobs", seeded_text.as_str())],
            );
            for job in seeded {
                self.job_added(&job).await;
            }
            let controller = Arc::clone(&self);
            tokio::spawn(with_span(
                "controller",
                format!("{}-sync", K::NAME),
                controller.run_events(events, shutdown),
            ));
            Ok(())
        })
    }

    fn validate_nodes<'a>(&'a self, task: &'a TaskMessage) -> ControllerFuture<'a, Vec<Node>> {
        Box::pin(async move {
            let candidates = self.resolve_nodes(task).await?;
            let mut eligible = Vec::with_capacity(candidates.len());
            for node in candidates {
                let reason = if !node.is_edge_node() {
                    Some("not an edge node")
                } else if !node.is_ready() {
                    Some("node is not ready")
                } else if !K::node_eligible(task, &node) {
                    Some("node rejected by task type")
                } else {
                    None
                };
                match reason {
                    Some(reason) => log_warn(
                        K::NAME,
                        "Skipping node",
                        &[
                            ("job", task.name.as_str()),
                            ("node", node.name()),
                            ("reason", reason),
                        ],
                    ),
                    None => eligible.push(node),
                }
            }
            Ok(eligible)
        })
    }

    fn report_node_status<'a>(
        &'a self,
        job: &'a str,
        node: &'a str,
        event: Event,
    ) -> ControllerFuture<'a, TaskState> {
        Box::pin(async move {
            let fsm = Fsm::new(
                K::fsm(),
                NodeState::<K> {
                    controller: self,
                    job,
                    node,
                },
            );
            fsm.allow_transit(&event).await?;
            let previous = fsm.current_state().await?;
            let guard = self.transit_lock.lock().await;
            let next = match fsm.transit(&event).await {
                Ok(next) => next,
                Err(FsmError::Store(message)) => {
                    drop(guard);
                    self.fail_job(job, node, &message).await;
                    return Err(FsmError::Store(message).into());
                }
                Err(err) => return Err(err.into()),
            };
            let previous_text = previous.to_string();
            let next_text = next.to_string();
            log_info(
                K::NAME,
                "Node transitioned",
                &[
                    ("job", job),
                    ("node", node),
                    ("event", event.event_type.as_str()),
                    ("action", event.action.as_str()),
                    ("from", previous_text.as_str()),
                    ("to", next_text.as_str()),
                ],
            );
            self.wait_for_cache(job, previous, |cached| node_state_of(cached, node))
                .await;
            Ok(next)
        })
    }

    fn report_task_status<'a>(
        &'a self,
        job: &'a str,
        event: Event,
    ) -> ControllerFuture<'a, TaskState> {
        Box::pin(async move {
            let fsm = Fsm::new(
                K::fsm(),
                JobState::<K> {
                    controller: self,
                    job,
                },
            );
            let previous = fsm.current_state().await?;
            fsm.allow_transit(&event).await?;
            let _guard = self.transit_lock.lock().await;
            let next = fsm.transit(&event).await?;
            let previous_text = previous.to_string();
            let next_text = next.to_string();
            log_info(
                K::NAME,
                "Job transitioned",
                &[
                    ("job", job),
                    ("event", event.event_type.as_str()),
                    ("action", event.action.as_str()),
                    ("from", previous_text.as_str()),
                    ("to", next_text.as_str()),
                ],
            );
            self.wait_for_cache(job, previous, |cached| {
                effective_state(cached.status.state)
            })
            .await;
            Ok(next)
        })
    }

    fn stage_completed<'a>(
        &'a self,
        job: &'a str,
        state: Option<TaskState>,
    ) -> ControllerFuture<'a, bool> {
        Box::pin(async move {
            let fsm = Fsm::new(
                K::fsm(),
                JobState::<K> {
                    controller: self,
                    job,
                },
            );
            Ok(fsm.stage_completed(effective_state(state)).await?)
        })
    }

    fn get_node_status<'a>(&'a self, job: &'a str) -> ControllerFuture<'a, Vec<TaskStatus>> {
        Box::pin(async move {
            let (job, _) = self.fetch(job).await?;
            Ok(job.status.node_status)
        })
    }

    fn update_node_status<'a>(
        &'a self,
        job: &'a str,
        statuses: Vec<TaskStatus>,
    ) -> ControllerFuture<'a, ()> {
        Box::pin(async move {
            self.patch_status(job, |status| {
                status.node_status = statuses.clone();
                Ok(())
            })
            .await
        })
    }

    fn command_for<'a>(&'a self, task: &'a TaskMessage, node: &'a TaskStatus) -> CommandFuture<'a> {
        Box::pin(async move {
            match self.nodes.get_node(&node.node_name).await {
                Ok(found) => {
                    if let Some(message) = K::legacy_command(task, &found) {
                        return message;
                    }
                }
                Err(err) => {
                    let error_text = err.to_string();
                    log_debug(
                        K::NAME,
                        "Node lookup failed; sending generic command",
                        &[
                            ("node", node.node_name.as_str()),
                            ("error", error_text.as_str()),
                        ],
                    );
                }
            }
            build_task_command(task, node)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::edgetask::controller::configupdate::{ConfigUpdateController, ConfigUpdateKind};
    use crate::edgetask::fsm::{Action, EVENT_CONFIG_UPDATE, EVENT_INIT};
    use crate::edgetask::k8s::job::CONFIG_UPDATE_JOBS;
    use crate::edgetask::k8s::meta::LabelSelector;
    use crate::edgetask::k8s::node::NodeCondition;
    use crate::edgetask::k8s::store::{InMemoryStore, StoreFuture, WatchStream};
    use crate::edgetask::logger::captured_lines;
    use crate::edgetask::test_support::{config_update_job, edge_node, job_status};
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Answers the next `conflicts` patches with a conflict, optionally
    /// landing a concurrent write first.
    struct FlakyStore {
        inner: Arc<InMemoryStore>,
        conflicts: AtomicUsize,
        concurrent_write: std::sync::Mutex<Option<Value>>,
    }

    impl FlakyStore {
        fn new(inner: Arc<InMemoryStore>) -> Self {
            Self {
                inner,
                conflicts: AtomicUsize::new(0),
                concurrent_write: std::sync::Mutex::new(None),
            }
        }
    }

    impl ObjectStore for FlakyStore {
        fn list<'a>(&'a self, kind: &'a str) -> StoreFuture<'a, Vec<Value>> {
            self.inner.list(kind)
        }

        fn get<'a>(&'a self, kind: &'a str, name: &'a str) -> StoreFuture<'a, Value> {
            self.inner.get(kind, name)
        }

        fn patch<'a>(
            &'a self,
            kind: &'a str,
            name: &'a str,
            subresource: Option<&'a str>,
            patch: &'a Value,
        ) -> StoreFuture<'a, Value> {
            Box::pin(async move {
                let pending = self.conflicts.load(Ordering::SeqCst);
                if pending == 0 {
                    return self.inner.patch(kind, name, subresource, patch).await;
                }
                self.conflicts.store(pending - 1, Ordering::SeqCst);
                let write = self
                    .concurrent_write
                    .lock()
                    .unwrap_or_else(|poisoned| poisoned.into_inner())
                    .take();
                if let Some(write) = write {
                    self.inner
                        .patch(kind, name, Some(STATUS_SUBRESOURCE), &write)
                        .await?;
                }
                Err(StoreError::Conflict(format!("{} was modified", name)))
            })
        }

        fn watch(&self, kind: &str) -> Result<WatchStream, StoreError> {
            self.inner.watch(kind)
        }
    }

    fn flaky_fixture() -> (Arc<InMemoryStore>, Arc<FlakyStore>, ConfigUpdateController) {
        let inner = Arc::new(InMemoryStore::default());
        let flaky = Arc::new(FlakyStore::new(inner.clone()));
        let (tx, _rx) = mpsc::channel(16);
        let controller = ConfigUpdateController::new(flaky.clone(), inner.clone(), tx, 16);
        (inner, flaky, controller)
    }

    type Fixture = (
        Arc<InMemoryStore>,
        Arc<ConfigUpdateController>,
        mpsc::Receiver<TaskMessage>,
    );

    fn fixture() -> Fixture {
        let store = Arc::new(InMemoryStore::default());
        let (tx, rx) = mpsc::channel(16);
        let controller = Arc::new(ConfigUpdateController::new(
            store.clone(),
            store.clone(),
            tx,
            16,
        ));
        (store, controller, rx)
    }

    fn seed(store: &InMemoryStore, name: &str) {
        store
            .create(
                CONFIG_UPDATE_JOBS,
                config_update_job(name, &["edge-1", "edge-2"], &[("maxPods", "150")]),
            )
            .expect("create job");
    }

    #[tokio::test(start_paused = true)]
    async fn start_applies_defaults_and_skips_finished_jobs() {
        let (store, controller, mut rx) = fixture();
        let mut raw = config_update_job("cfg-1", &["edge-1"], &[("maxPods", "150")]);
        raw["spec"]["concurrency"] = json!(0);
        raw["spec"]["failureTolerate"] = json!("lots");
        raw["spec"]["timeoutSeconds"] = json!(30);
        store.create(CONFIG_UPDATE_JOBS, raw).expect("create");
        let mut done = config_update_job("cfg-done", &["edge-1"], &[("maxPods", "150")]);
        done["status"] = json!({"state": "Successful"});
        store.create(CONFIG_UPDATE_JOBS, done).expect("create");

        controller
            .clone()
            .start(CancellationToken::new())
            .await
            .expect("start");

        let message = rx.recv().await.expect("task message");
        assert_eq!(message.name, "cfg-1");
        assert_eq!(message.kind, "configupdate");
        assert_eq!(message.concurrency, DEFAULT_CONCURRENCY);
        assert_eq!(message.failure_tolerate, DEFAULT_FAILURE_TOLERANCE);
        assert_eq!(message.timeout_seconds, Some(30));
        assert_eq!(message.payload, json!({"UpdateFields": {"maxPods": "150"}}));
        assert!(message.status.is_empty());
        assert!(rx.try_recv().is_err());
        assert_eq!(controller.cache().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn node_reports_persist_transitions_and_emit_ticks() {
        let (store, controller, mut rx) = fixture();
        seed(&store, "cfg-2");
        controller
            .clone()
            .start(CancellationToken::new())
            .await
            .expect("start");
        rx.recv().await.expect("admission message");

        controller
            .update_node_status(
                "cfg-2",
                vec![TaskStatus::pending("edge-1"), TaskStatus::pending("edge-2")],
            )
            .await
            .expect("seed statuses");

        let next = controller
            .report_node_status(
                "cfg-2",
                "edge-1",
                Event::new(EVENT_INIT, Action::Success),
            )
            .await
            .expect("transit");
        assert_eq!(next, TaskState::Checking);

        let status = job_status(store.as_ref(), CONFIG_UPDATE_JOBS, "cfg-2")
            .await
            .expect("status");
        assert_eq!(status.node_status[0].state, Some(TaskState::Checking));
        assert_eq!(status.node_status[0].event, EVENT_INIT);
        assert_eq!(status.node_status[0].action, Some(Action::Success));
        assert_eq!(status.node_status[1].state, None);

        let tick = rx.recv().await.expect("tick");
        assert_eq!(tick.name, "cfg-2");
        assert_eq!(tick.status.node_name, "edge-1");
        assert_eq!(tick.status.state, Some(TaskState::Checking));
        assert_eq!(tick.payload, json!({"UpdateFields": {"maxPods": "150"}}));

        let err = controller
            .report_node_status(
                "cfg-2",
                "edge-1",
                Event::new(EVENT_CONFIG_UPDATE, Action::Success),
            )
            .await
            .expect_err("no rule from Checking");
        assert!(err.is_rejected_transition());

        let err = controller
            .report_node_status("cfg-2", "edge-9", Event::new(EVENT_INIT, Action::Success))
            .await
            .expect_err("unknown node");
        assert!(matches!(err, ControllerError::Fsm(FsmError::Load(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn job_reports_drive_stage_completion() {
        let (store, controller, _rx) = fixture();
        seed(&store, "cfg-3");

        assert!(controller
            .stage_completed("cfg-3", Some(TaskState::Checking))
            .await
            .expect("stage"));
        assert!(!controller
            .stage_completed("cfg-3", Some(TaskState::BackingUp))
            .await
            .expect("stage"));
        assert!(!controller.stage_completed("cfg-3", None).await.expect("stage"));
        assert!(controller
            .stage_completed("cfg-3", Some(TaskState::Failed))
            .await
            .expect("stage"));

        let next = controller
            .report_task_status("cfg-3", Event::new(EVENT_INIT, Action::Success))
            .await
            .expect("job transit");
        assert_eq!(next, TaskState::Checking);
        assert!(controller
            .stage_completed("cfg-3", Some(TaskState::BackingUp))
            .await
            .expect("stage"));

        let status = job_status(store.as_ref(), CONFIG_UPDATE_JOBS, "cfg-3")
            .await
            .expect("status");
        assert_eq!(status.state, Some(TaskState::Checking));
        assert_eq!(status.event, EVENT_INIT);
        assert!(!status.time.is_empty());
    }

    #[tokio::test]
    async fn validate_nodes_filters_targets() {
        let (store, controller, _rx) = fixture();
        store.put_node(edge_node("edge-1", "v1.26.3-kubeedge-v1.17.0"));
        let mut not_ready = edge_node("edge-2", "v1.26.3-kubeedge-v1.17.0");
        not_ready.status.conditions = vec![NodeCondition {
            condition_type: "Ready".into(),
            status: "False".into(),
        }];
        store.put_node(not_ready);
        let mut cloud = edge_node("cloud-1", "v1.26.3");
        cloud.metadata.labels.clear();
        store.put_node(cloud);
        let mut zoned = edge_node("edge-3", "v1.26.3-kubeedge-v1.17.0");
        zoned.metadata.labels.insert("zone".into(), "a".into());
        store.put_node(zoned);

        let explicit = TaskMessage {
            name: "cfg-4".into(),
            node_names: ["edge-1", "edge-1", "edge-2", "cloud-1", "ghost-cfg-4"]
                .iter()
                .map(|name| name.to_string())
                .collect(),
            ..TaskMessage::default()
        };
        let nodes = controller.validate_nodes(&explicit).await.expect("validate");
        let names: Vec<&str> = nodes.iter().map(|node| node.name()).collect();
        assert_eq!(names, vec!["edge-1"]);
        assert!(!captured_lines("ghost-cfg-4").is_empty());

        let selected = TaskMessage {
            name: "cfg-4".into(),
            label_selector: Some(
                serde_json::from_value::<LabelSelector>(json!({"matchLabels": {"zone": "a"}}))
                    .expect("selector"),
            ),
            ..TaskMessage::default()
        };
        let nodes = controller.validate_nodes(&selected).await.expect("validate");
        assert_eq!(nodes.len(), 1);
        assert_eq!(nodes[0].name(), "edge-3");

        let untargeted = TaskMessage {
            name: "cfg-4".into(),
            ..TaskMessage::default()
        };
        assert!(controller
            .validate_nodes(&untargeted)
            .await
            .expect("validate")
            .is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn deleting_a_job_requests_executor_shutdown() {
        let (store, controller, mut rx) = fixture();
        seed(&store, "cfg-5");
        controller
            .clone()
            .start(CancellationToken::new())
            .await
            .expect("start");
        rx.recv().await.expect("admission message");

        store.delete(CONFIG_UPDATE_JOBS, "cfg-5").expect("delete");
        let message = rx.recv().await.expect("shutdown message");
        assert!(message.shutdown);
        assert_eq!(message.key(), ("configupdate".to_string(), "cfg-5".to_string()));
    }

    #[tokio::test]
    async fn generic_command_is_built_without_node_lookup() {
        let (_store, controller, _rx) = fixture();
        let task = TaskMessage {
            kind: "configupdate".into(),
            name: "cfg-6".into(),
            payload: json!({"UpdateFields": {"maxPods": "150"}}),
            ..TaskMessage::default()
        };
        let message = controller
            .command_for(&task, &TaskStatus::pending("edge-7"))
            .await;
        assert_eq!(message.route.resource, "configupdate/cfg-6/node/edge-7");
        let body: Value = serde_json::from_slice(&message.body).expect("body");
        assert_eq!(body["State"], "Init");
    }

    #[test]
    fn failure_tolerance_outside_unit_range_uses_default() {
        let (_store, controller, _rx) = fixture();
        for raw in ["5", "-0.2", "NaN", "inf"] {
            let mut object = config_update_job("cfg-7", &["edge-1"], &[("maxPods", "150")]);
            object["spec"]["failureTolerate"] = json!(raw);
            let job: TaskJob<<ConfigUpdateKind as TaskKind>::Spec> =
                serde_json::from_value(object).expect("job");
            let message = controller.task_message(&job).expect("message");
            assert_eq!(message.failure_tolerate, DEFAULT_FAILURE_TOLERANCE, "{}", raw);
        }

        let mut object = config_update_job("cfg-7", &["edge-1"], &[("maxPods", "150")]);
        object["spec"]["failureTolerate"] = json!("1");
        let job: TaskJob<<ConfigUpdateKind as TaskKind>::Spec> =
            serde_json::from_value(object).expect("job");
        assert_eq!(controller.task_message(&job).expect("message").failure_tolerate, 1.0);
    }

    #[tokio::test(start_paused = true)]
    async fn status_retry_rechecks_state_after_concurrent_write() {
        let (inner, flaky, controller) = flaky_fixture();
        seed(&inner, "cfg-8");
        controller
            .update_node_status(
                "cfg-8",
                vec![TaskStatus::pending("edge-1"), TaskStatus::pending("edge-2")],
            )
            .await
            .expect("seed statuses");

        *flaky
            .concurrent_write
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(json!({
            "status": {"nodeStatus": [
                {"nodeName": "edge-1", "state": "Checking", "event": "Init", "action": "Success"},
                {"nodeName": "edge-2"}
            ]}
        }));
        flaky.conflicts.store(1, Ordering::SeqCst);

        let err = controller
            .report_node_status("cfg-8", "edge-1", Event::new(EVENT_INIT, Action::Failure))
            .await
            .expect_err("state moved underneath the retry");
        assert!(err.is_rejected_transition());
        assert!(matches!(err, ControllerError::Fsm(FsmError::Stale { .. })));

        let status = job_status(inner.as_ref(), CONFIG_UPDATE_JOBS, "cfg-8")
            .await
            .expect("status");
        assert_eq!(status.node_status[0].state, Some(TaskState::Checking));
        assert_eq!(status.node_status[0].action, Some(Action::Success));
        assert_eq!(status.state, None);
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_node_status_writes_fail_the_job() {
        let (inner, flaky, controller) = flaky_fixture();
        seed(&inner, "cfg-9");
        controller
            .update_node_status(
                "cfg-9",
                vec![TaskStatus::pending("edge-1"), TaskStatus::pending("edge-2")],
            )
            .await
            .expect("seed statuses");
        flaky.conflicts.store(PATCH_ATTEMPTS as usize, Ordering::SeqCst);

        let err = controller
            .report_node_status("cfg-9", "edge-1", Event::new(EVENT_INIT, Action::Success))
            .await
            .expect_err("writes exhausted");
        assert!(matches!(err, ControllerError::Fsm(FsmError::Store(_))));

        let status = job_status(inner.as_ref(), CONFIG_UPDATE_JOBS, "cfg-9")
            .await
            .expect("status");
        assert_eq!(status.state, Some(TaskState::Failed));
        assert_eq!(status.event, "TimeOut");
        assert_eq!(status.action, Some(Action::Failure));
        assert!(status.reason.contains("edge-1"));
        assert_eq!(status.node_status[0].state, None);
    }
}
