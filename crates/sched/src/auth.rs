// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Edge authentication boundary.
//!
//! The edge presents its lab's access-key/secret pair in headers; the auth
//! collaborator resolves them to a lab identity. User/role logic is outside
//! the core.

use std::collections::HashMap;
use std::path::Path;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::SchedError;

/// Authenticated lab identity attached to an edge connection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LabIdentity {
    pub lab_id: Uuid,
    pub user_id: String,
    #[serde(default)]
    pub name: String,
}

/// Resolves an access-key/secret pair to a lab identity.
pub trait LabAuth: Send + Sync {
    fn authenticate(&self, access_key: &str, access_secret: &str)
        -> Result<LabIdentity, SchedError>;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct CredentialEntry {
    access_key: String,
    access_secret: String,
    #[serde(flatten)]
    identity: LabIdentity,
}

/// Credential table loaded at startup (file or seeded in tests).
#[derive(Default)]
pub struct StaticLabAuth {
    labs: RwLock<HashMap<String, CredentialEntry>>,
}

impl StaticLabAuth {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load a JSON array of `{access_key, access_secret, lab_id, user_id}`.
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let entries: Vec<CredentialEntry> = serde_json::from_str(&contents)?;
        let auth = Self::new();
        for entry in entries {
            auth.labs.write().insert(entry.access_key.clone(), entry);
        }
        Ok(auth)
    }

    pub fn insert(&self, access_key: &str, access_secret: &str, identity: LabIdentity) {
        self.labs.write().insert(
            access_key.to_owned(),
            CredentialEntry {
                access_key: access_key.to_owned(),
                access_secret: access_secret.to_owned(),
                identity,
            },
        );
    }
}

impl LabAuth for StaticLabAuth {
    fn authenticate(
        &self,
        access_key: &str,
        access_secret: &str,
    ) -> Result<LabIdentity, SchedError> {
        let labs = self.labs.read();
        match labs.get(access_key) {
            Some(entry) if entry.access_secret == access_secret => Ok(entry.identity.clone()),
            _ => Err(SchedError::Unauthenticated),
        }
    }
}
