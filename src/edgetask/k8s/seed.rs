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

//! Fixture of nodes and jobs created in an [`InMemoryStore`] before the
//! controllers start.

use super::job::{CONFIG_UPDATE_JOBS, IMAGE_PREPULL_JOBS, NODE_UPGRADE_JOBS};
use super::node::Node;
use super::store::{InMemoryStore, StoreError};
use serde::Deserialize;
use serde_json::Value;
use std::fmt;

#[derive(Debug)]
pub enum SeedError {
    Parse(String),
    Store(StoreError),
}

impl fmt::Display for SeedError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SeedError::Parse(msg) => write!(f, "invalid seed file: {}", msg),
            SeedError::Store(err) => write!(f, "failed to store seed object: {}", err),
        }
    }
}

impl std::error::Error for SeedError {}

/// Top-level keys are `nodes` and the job resource names.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Seed {
    #[serde(default)]
    pub nodes: Vec<Node>,
    #[serde(default, rename = "nodeupgradejobs")]
    pub upgrade_jobs: Vec<Value>,
    #[serde(default, rename = "imageprepulljobs")]
    pub prepull_jobs: Vec<Value>,
    #[serde(default, rename = "configupdatejobs")]
    pub config_update_jobs: Vec<Value>,
}

impl Seed {
    pub fn parse(raw: &str) -> Result<Self, SeedError> {
        serde_json::from_str(raw).map_err(|err| SeedError::Parse(err.to_string()))
    }

    /// Stores every node and job. Returns the number of jobs created.
    pub fn apply(self, store: &InMemoryStore) -> Result<usize, SeedError> {
        for node in self.nodes {
            store.put_node(node);
        }
        let mut created = 0;
        for (resource, jobs) in [
            (NODE_UPGRADE_JOBS, self.upgrade_jobs),
            (IMAGE_PREPULL_JOBS, self.prepull_jobs),
            (CONFIG_UPDATE_JOBS, self.config_update_jobs),
        ] {
            for job in jobs {
                store.create(resource, job).map_err(SeedError::Store)?;
                created += 1;
            }
        }
        Ok(created)
    }
}
