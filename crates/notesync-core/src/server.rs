use std::collections::BTreeSet;
use std::time::Duration;

use async_trait::async_trait;

use crate::error::StorageError;
use crate::manifest::Manifest;

/// Handle for a set of writes that become visible only on commit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitTransaction {
    /// Unique id, used in logs and temp file names.
    pub transaction_id: String,
    /// Manifest revision this transaction was started from.
    pub base_revision: i64,
    /// Revision the transaction will create.
    pub revision: i64,
    pub staged_notes: BTreeSet<String>,
    pub staged_deletions: BTreeSet<String>,
}

impl CommitTransaction {
    pub fn new(base_revision: i64) -> Self {
        Self {
            transaction_id: uuid::Uuid::new_v4().to_string(),
            base_revision,
            revision: base_revision + 1,
            staged_notes: BTreeSet::new(),
            staged_deletions: BTreeSet::new(),
        }
    }
}

/// Remote note storage, independent of the physical medium.
///
/// Nothing a method does is observable by another client until `commit`
/// succeeds. Callers must hold the lock before `begin_commit`.
#[async_trait]
pub trait SyncServer: Send + Sync {
    /// Returns the backend identifier (e.g., "filesystem").
    fn backend_name(&self) -> &'static str;

    // =========================================================================
    // Read side
    // =========================================================================

    /// Current server state; `None` for a root nobody has committed to.
    async fn get_manifest(&self) -> Result<Option<Manifest>, StorageError>;

    /// Ids of the note blobs written by revision `revision`.
    async fn list_note_ids_at_revision(
        &self,
        revision: i64,
    ) -> Result<BTreeSet<String>, StorageError>;

    /// Blob of note `id` as written by revision `revision`.
    ///
    /// Fails with [`StorageError::NotFound`] if that revision has no such note.
    async fn fetch_note(&self, id: &str, revision: i64) -> Result<Vec<u8>, StorageError>;

    // =========================================================================
    // Write side
    // =========================================================================

    async fn begin_commit(&self) -> Result<CommitTransaction, StorageError>;

    async fn stage_note(
        &self,
        tx: &mut CommitTransaction,
        id: &str,
        blob: &[u8],
    ) -> Result<(), StorageError>;

    async fn stage_deletion(
        &self,
        tx: &mut CommitTransaction,
        id: &str,
    ) -> Result<(), StorageError>;

    /// Publish the staged writes together with `manifest`.
    async fn commit(
        &self,
        tx: CommitTransaction,
        manifest: &Manifest,
    ) -> Result<(), StorageError>;

    /// Drop the staged writes; prior state stays unchanged.
    async fn abort(&self, tx: CommitTransaction) -> Result<(), StorageError>;

    // =========================================================================
    // Locking
    // =========================================================================

    /// Try to become the single writer of the root for `lifetime`.
    ///
    /// Returns `false` when another owner holds a lock that has not expired.
    async fn acquire_lock(&self, owner: &str, lifetime: Duration) -> Result<bool, StorageError>;

    /// Push the expiry of a lock we hold. Returns `false` if we lost it.
    async fn renew_lock(&self, owner: &str) -> Result<bool, StorageError>;

    /// Release a lock we hold. A no-op if someone else holds it.
    async fn release_lock(&self, owner: &str) -> Result<(), StorageError>;

    // =========================================================================
    // Maintenance
    // =========================================================================

    /// Verify that the root can be written, read back and cleaned.
    async fn self_test(&self) -> Result<(), StorageError>;
}
