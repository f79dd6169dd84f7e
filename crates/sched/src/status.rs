// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Per-task registry of pending query/callback waits.
//!
//! Engines create an entry before sending the corresponding message to the
//! edge; the session's inbound demux resolves it from `report_action_state`
//! and `job_status` frames. Both sides touch the map concurrently.

use std::collections::HashMap;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::Instant;
use uuid::Uuid;

use crate::proto::StatusKind;

/// Identity of one pending wait.
///
/// A pure value key: nothing that varies between equal waits (deadlines
/// live in the value).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ActionKey {
    pub kind: StatusKind,
    pub task_id: Uuid,
    pub job_id: Uuid,
    pub device_id: String,
    pub action_name: String,
}

#[derive(Debug, Clone, Copy)]
pub struct ActionValue {
    pub free: bool,
    pub deadline: Instant,
}

/// Concurrent map of pending waits, owned by one engine instance.
#[derive(Default)]
pub struct StatusRegistry {
    entries: Mutex<HashMap<ActionKey, ActionValue>>,
}

impl StatusRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert the wait, overwriting any stale entry for the same key.
    pub fn init(&self, key: ActionKey, deadline: Instant, free: bool) {
        self.entries.lock().insert(key, ActionValue { free, deadline });
    }

    /// Resolve the wait: set `free` and extend the deadline by `need_more`.
    /// An absent key means the wait was already torn down; the update is
    /// dropped and logged.
    pub fn set(&self, key: &ActionKey, free: bool, need_more: Duration) {
        let mut entries = self.entries.lock();
        match entries.get_mut(key) {
            Some(value) => {
                value.free = free;
                value.deadline += need_more;
            }
            None => {
                tracing::warn!(?key, "action status update for unknown key dropped");
            }
        }
    }

    pub fn get(&self, key: &ActionKey) -> Option<ActionValue> {
        self.entries.lock().get(key).copied()
    }

    pub fn del(&self, key: &ActionKey) {
        self.entries.lock().remove(key);
    }

    /// Number of live entries; every task must drain to zero before it
    /// reaches a terminal state.
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}
