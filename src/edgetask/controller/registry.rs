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

use super::{Controller, ControllerError};
use crate::edgetask::logger::{log_info, log_warn};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use tokio_util::sync::CancellationToken;

/// Maps a task type to the controller that owns it.
#[derive(Default)]
pub struct ControllerRegistry {
    controllers: RwLock<HashMap<String, Arc<dyn Controller>>>,
}

impl ControllerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `controller` under its name. A second registration for the
    /// same name replaces the first.
    pub fn register(&self, controller: Arc<dyn Controller>) {
        let name = controller.name();
        let mut controllers = self
            .controllers
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if controllers.contains_key(name) {
            log_warn(
                "registry",
                "Controller already registered; replacing",
                &[("controller", name)],
            );
        }
        controllers.insert(name.to_string(), controller);
    }

    pub fn get(&self, name: &str) -> Result<Arc<dyn Controller>, ControllerError> {
        self.controllers
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(name)
            .cloned()
            .ok_or_else(|| ControllerError::UnknownKind(name.to_string()))
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .controllers
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .keys()
            .cloned()
            .collect();
        names.sort();
        names
    }

    /// Starts every controller, stopping at the first failure.
    pub async fn start_all(&self, shutdown: &CancellationToken) -> Result<(), ControllerError> {
        let controllers: Vec<Arc<dyn Controller>> = {
            let guard = self
                .controllers
                .read()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            let mut entries: Vec<_> = guard.iter().collect();
            entries.sort_by(|a, b| a.0.cmp(b.0));
            entries.into_iter().map(|(_, c)| Arc::clone(c)).collect()
        };
        for controller in controllers {
            let name = controller.name();
            controller.start(shutdown.child_token()).await?;
            log_info("registry", "Controller started", &[("controller", name)]);
        }
        Ok(())
    }
}
