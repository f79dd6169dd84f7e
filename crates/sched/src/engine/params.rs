// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Per-node parameter resolution: group overrides and upstream rewriting.
//!
//! A node's effective parameters are computed once per wave by copying
//! upstream return values into the target's parameter JSON at the target
//! handle's data key. Data keys are dotted paths into the JSON objects.

use std::collections::HashMap;

use serde_json::Value;
use uuid::Uuid;

use crate::error::SchedError;
use crate::graph::HandlePair;
use crate::store::Job;

/// Read a dotted data key out of a JSON value.
pub fn get_path<'a>(value: &'a Value, path: &str) -> Option<&'a Value> {
    if path.is_empty() {
        return None;
    }
    let mut current = value;
    for segment in path.split('.') {
        current = current.get(segment)?;
    }
    Some(current)
}

/// Write a dotted data key into a JSON value, creating intermediate objects
/// and replacing non-object intermediates along the way.
pub fn set_path(target: &mut Value, path: &str, new: Value) -> Result<(), SchedError> {
    if path.is_empty() {
        return Err(SchedError::ParameterRewriteFailed("empty data key".to_owned()));
    }
    if !target.is_object() {
        *target = Value::Object(serde_json::Map::new());
    }
    let mut current = target;
    let segments: Vec<&str> = path.split('.').collect();
    for (i, segment) in segments.iter().enumerate() {
        let map = match current.as_object_mut() {
            Some(map) => map,
            None => {
                return Err(SchedError::ParameterRewriteFailed(format!(
                    "segment {segment} of {path} is not an object"
                )))
            }
        };
        if i == segments.len() - 1 {
            map.insert((*segment).to_owned(), new);
            return Ok(());
        }
        let entry = map.entry((*segment).to_owned()).or_insert_with(|| Value::Object(serde_json::Map::new()));
        if !entry.is_object() {
            *entry = Value::Object(serde_json::Map::new());
        }
        current = entry;
    }
    Ok(())
}

/// Rewrite `param` from upstream job results along the node's incoming
/// handle pairs. Ready-signal edges are skipped; a missing parent job,
/// missing source value, or write failure each fail the node explicitly.
pub fn rewrite_from_upstream(
    mut param: Value,
    pairs: &[HandlePair],
    results: &HashMap<Uuid, Job>,
) -> Result<Value, SchedError> {
    for pair in pairs {
        if !pair.carries_data() {
            continue;
        }
        // An absent source means the parent was disabled at build time.
        let Some(source_node) = pair.source_node else { continue };

        let job = results.get(&source_node).ok_or_else(|| {
            SchedError::UpstreamJobMissing(format!("parent node {source_node}"))
        })?;
        let value = get_path(&job.return_info.return_value, &pair.source_handle.data_key)
            .ok_or_else(|| {
                SchedError::UpstreamValueMissing(format!(
                    "parent node {source_node} key {}",
                    pair.source_handle.data_key
                ))
            })?
            .clone();
        set_path(&mut param, &pair.target_handle.data_key, value)?;
    }
    Ok(param)
}
