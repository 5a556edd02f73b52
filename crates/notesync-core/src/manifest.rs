use std::collections::{BTreeMap, BTreeSet};
use std::sync::RwLock;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::StorageError;

/// Server-side record of what is on the sync root.
///
/// `revision` 0 is the empty, uninitialized root; the first commit produces
/// revision 1.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Manifest {
    pub revision: i64,
    pub server_id: String,
    /// Note id -> revision whose snapshot directory holds the latest blob.
    pub notes: BTreeMap<String, i64>,
    /// Note ids deleted by the latest revision.
    pub deleted: BTreeSet<String>,
}

impl Manifest {
    /// Manifest of a root that has never been committed to.
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn note_revision(&self, id: &str) -> Option<i64> {
        self.notes.get(id).copied()
    }

    /// Start the manifest of the next revision: same notes, no tombstones.
    pub fn next(&self) -> Self {
        let server_id = if self.server_id.is_empty() {
            uuid::Uuid::new_v4().to_string()
        } else {
            self.server_id.clone()
        };
        Self {
            revision: self.revision + 1,
            server_id,
            notes: self.notes.clone(),
            deleted: BTreeSet::new(),
        }
    }
}

/// What this client knew about a note at its last successful sync.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncedNote {
    pub server_revision: i64,
    pub local_revision: u64,
}

/// The last-synced baseline of one client.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientManifest {
    #[serde(default)]
    pub last_synchronized_revision: i64,
    #[serde(default)]
    pub server_id: Option<String>,
    #[serde(default)]
    pub last_sync_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub notes: BTreeMap<String, SyncedNote>,
}

impl ClientManifest {
    pub fn get(&self, id: &str) -> Option<SyncedNote> {
        self.notes.get(id).copied()
    }

    pub fn record(&mut self, id: &str, server_revision: i64, local_revision: u64) {
        self.notes.insert(
            id.to_string(),
            SyncedNote {
                server_revision,
                local_revision,
            },
        );
    }

    pub fn forget(&mut self, id: &str) {
        self.notes.remove(id);
    }

    /// Drop everything known about a previous sync root.
    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

/// Persistence of the client baseline.
#[async_trait]
pub trait SyncClient: Send + Sync {
    async fn load(&self) -> Result<ClientManifest, StorageError>;

    async fn save(&self, manifest: &ClientManifest) -> Result<(), StorageError>;
}

/// Baseline kept in memory only.
#[derive(Debug, Default)]
pub struct MemorySyncClient {
    manifest: RwLock<ClientManifest>,
}

impl MemorySyncClient {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SyncClient for MemorySyncClient {
    async fn load(&self) -> Result<ClientManifest, StorageError> {
        Ok(self.manifest.read().unwrap_or_else(|e| e.into_inner()).clone())
    }

    async fn save(&self, manifest: &ClientManifest) -> Result<(), StorageError> {
        *self.manifest.write().unwrap_or_else(|e| e.into_inner()) = manifest.clone();
        Ok(())
    }
}
