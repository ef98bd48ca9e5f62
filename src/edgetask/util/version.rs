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

//! Version and image-reference helpers used by node eligibility checks.

use std::collections::HashSet;
use std::fmt;

const DEFAULT_REGISTRY: &str = "docker.io";
const OFFICIAL_NAMESPACE: &str = "library";
const EDGE_VERSION_INFIX: &str = "-kubeedge-";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VersionError {
    Malformed(String),
    EmptyImage,
}

impl fmt::Display for VersionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VersionError::Malformed(version) => write!(f, "malformed version '{}'", version),
            VersionError::EmptyImage => write!(f, "image reference is empty"),
        }
    }
}

impl std::error::Error for VersionError {}

/// Returns the fully qualified repository of an image reference, without
/// tag or digest. `nginx:1.25` becomes `docker.io/library/nginx`.
pub fn get_image_repo(image: &str) -> Result<String, VersionError> {
    let image = image.trim();
    if image.is_empty() {
        return Err(VersionError::EmptyImage);
    }
    let without_digest = image.split('@').next().unwrap_or(image);
    let name = match without_digest.rfind(':') {
        Some(colon) if !without_digest[colon..].contains('/') => &without_digest[..colon],
        _ => without_digest,
    };
    if name.is_empty() {
        return Err(VersionError::EmptyImage);
    }

    let (first, rest) = match name.split_once('/') {
        Some((first, rest)) => (first, Some(rest)),
        None => (name, None),
    };
    let is_registry = |segment: &str| {
        segment.contains('.') || segment.contains(':') || segment == "localhost"
    };
    let repo = match rest {
        Some(_) if is_registry(first) => name.to_string(),
        Some(_) => format!("{}/{}", DEFAULT_REGISTRY, name),
        None => format!("{}/{}/{}", DEFAULT_REGISTRY, OFFICIAL_NAMESPACE, name),
    };
    Ok(repo)
}

/// Reports whether a node's kubelet version should be left alone for an
/// upgrade to `expected`.
///
/// Versions look like `v1.22.6-kubeedge-v1.10.0`. A version without the
/// edge infix is not a recognised edge build and is filtered; otherwise the
/// node is filtered when its edge version already starts with `expected`.
pub fn filter_version(version: &str, expected: &str) -> bool {
    match version.split_once(EDGE_VERSION_INFIX) {
        Some((_, edge_version)) => edge_version.starts_with(expected),
        None => true,
    }
}

fn parse_triplet(version: &str) -> Result<(u64, u64, u64), VersionError> {
    let malformed = || VersionError::Malformed(version.to_string());
    let trimmed = version.trim().trim_start_matches('v');
    let core = trimmed.split(['-', '+']).next().unwrap_or(trimmed);
    let mut parts = core.split('.');
    let mut next = || -> Result<u64, VersionError> {
        parts
            .next()
            .ok_or_else(malformed)?
            .parse::<u64>()
            .map_err(|_| malformed())
    };
    let triplet = (next()?, next()?, next()?);
    if parts.next().is_some() {
        return Err(malformed());
    }
    Ok(triplet)
}

/// Returns true when `left` is strictly older than `right`.
pub fn version_less(left: &str, right: &str) -> Result<bool, VersionError> {
    Ok(parse_triplet(left)? < parse_triplet(right)?)
}

/// De-duplicates `items`, keeping the first occurrence of each.
pub fn remove_duplicates(items: &[String]) -> Vec<String> {
    let mut seen = HashSet::new();
    items
        .iter()
        .filter(|item| seen.insert(item.as_str()))
        .cloned()
        .collect()
}
