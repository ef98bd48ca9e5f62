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

//! Executor machine: one executor per `(kind, job)`, created on first sight
//! of a task message and torn down on shutdown messages or completion.

pub mod driver;
pub mod workers;

use crate::edgetask::controller::registry::ControllerRegistry;
use crate::edgetask::controller::{ControllerError, TaskMessage};
use crate::edgetask::k8s::job::TaskStatus;
use crate::edgetask::logger::{log_debug, log_error, log_info};
use crate::edgetask::messaging::Message;
use crate::edgetask::observability::tracing::with_span;
use driver::Executor;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

const INBOX_CAPACITY: usize = 10;

type ExecutorKey = (String, String);

struct ExecutorHandle {
    inbox: mpsc::Sender<TaskStatus>,
    cancel: CancellationToken,
    generation: u64,
}

type Executors = Arc<Mutex<HashMap<ExecutorKey, ExecutorHandle>>>;

pub struct ExecutorMachine {
    registry: Arc<ControllerRegistry>,
    executors: Executors,
    downstream: mpsc::Sender<Message>,
    generation: AtomicU64,
}

impl ExecutorMachine {
    pub fn new(registry: Arc<ControllerRegistry>, downstream: mpsc::Sender<Message>) -> Self {
        Self {
            registry,
            executors: Arc::new(Mutex::new(HashMap::new())),
            downstream,
            generation: AtomicU64::new(0),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<ExecutorKey, ExecutorHandle>> {
        self.executors
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn is_running(&self, kind: &str, name: &str) -> bool {
        self.lock()
            .get(&(kind.to_string(), name.to_string()))
            .map(|handle| !handle.inbox.is_closed())
            .unwrap_or(false)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Dispatches task messages until `shutdown` fires.
    pub async fn run(
        self: Arc<Self>,
        mut messages: mpsc::Receiver<TaskMessage>,
        shutdown: CancellationToken,
    ) {
        log_info("executor", "Executor machine started", &[]);
        loop {
            let message = tokio::select! {
                _ = shutdown.cancelled() => break,
                message = messages.recv() => match message {
                    Some(message) => message,
                    None => break,
                },
            };
            if let Err(err) = self.handle(message.clone(), &shutdown).await {
                let error_text = err.to_string();
                log_error(
                    "executor",
                    "Failed to handle task message",
                    &[
                        ("kind", message.kind.as_str()),
                        ("job", message.name.as_str()),
                        ("error", error_text.as_str()),
                    ],
                );
            }
        }
        for (_, handle) in self.lock().drain() {
            handle.cancel.cancel();
        }
        log_info("executor", "Executor machine stopped", &[]);
    }

    pub async fn handle(
        &self,
        message: TaskMessage,
        shutdown: &CancellationToken,
    ) -> Result<(), ControllerError> {
        if message.shutdown {
            if self.remove(&message.key()) {
                log_info(
                    "executor",
                    "Executor removed",
                    &[("kind", message.kind.as_str()), ("job", message.name.as_str())],
                );
            }
            return Ok(());
        }
        let inbox = self.get_or_init(&message, shutdown).await?;
        if message.status.is_empty() {
            return Ok(());
        }
        if inbox.send(message.status).await.is_err() {
            log_debug(
                "executor",
                "Executor exited before status delivery",
                &[("kind", message.kind.as_str()), ("job", message.name.as_str())],
            );
        }
        Ok(())
    }

    fn remove(&self, key: &ExecutorKey) -> bool {
        match self.lock().remove(key) {
            Some(handle) => {
                handle.cancel.cancel();
                true
            }
            None => false,
        }
    }

    async fn get_or_init(
        &self,
        message: &TaskMessage,
        shutdown: &CancellationToken,
    ) -> Result<mpsc::Sender<TaskStatus>, ControllerError> {
        if let Some(handle) = self.lock().get(&message.key()) {
            if !handle.inbox.is_closed() {
                return Ok(handle.inbox.clone());
            }
        }
        self.init(message, shutdown).await
    }

    async fn init(
        &self,
        message: &TaskMessage,
        shutdown: &CancellationToken,
    ) -> Result<mpsc::Sender<TaskStatus>, ControllerError> {
        let controller = self.registry.get(&message.kind)?;
        let mut nodes = controller.get_node_status(&message.name).await?;
        if nodes.is_empty() {
            let eligible = controller.validate_nodes(message).await?;
            if eligible.is_empty() {
                return Err(ControllerError::NoNodes(message.name.clone()));
            }
            nodes = eligible
                .iter()
                .map(|node| TaskStatus::pending(node.name()))
                .collect();
            controller
                .update_node_status(&message.name, nodes.clone())
                .await?;
        }

        let (inbox, receiver) = mpsc::channel(INBOX_CAPACITY);
        let cancel = shutdown.child_token();
        let generation = self.generation.fetch_add(1, Ordering::Relaxed);
        let key = message.key();
        let previous = self.lock().insert(
            key.clone(),
            ExecutorHandle {
                inbox: inbox.clone(),
                cancel: cancel.clone(),
                generation,
            },
        );
        if let Some(previous) = previous {
            previous.cancel.cancel();
        }

        let executor = Executor::new(
            message.clone(),
            controller,
            nodes,
            self.downstream.clone(),
            cancel,
        );
        let executors = Arc::clone(&self.executors);
        let span_name = format!("{}/{}", message.kind, message.name);
        tokio::spawn(with_span("executor", span_name, async move {
            executor.run(receiver).await;
            let mut executors = executors
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            if executors
                .get(&key)
                .map(|handle| handle.generation == generation)
                .unwrap_or(false)
            {
                executors.remove(&key);
            }
        }));
        Ok(inbox)
    }
}
