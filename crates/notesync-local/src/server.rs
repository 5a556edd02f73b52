use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use notesync_core::codec::{decode_manifest, encode_manifest};
use notesync_core::{CommitTransaction, Manifest, StorageError, SyncServer};
use tokio::fs;
use tracing::{debug, info, instrument, warn};

use crate::lock::FileLock;

const MANIFEST_FILE: &str = "manifest.xml";
const NOTE_EXTENSION: &str = "note";
const PROBE_CONTENT: &str = "Testing write capabilities.";

/// Sync backend on a directory of the host filesystem.
///
/// Layout under the root:
/// - `manifest.xml`: the authoritative server state
/// - `<revision>/<note-id>.note`: blobs written by each revision
/// - `lock`: see [`FileLock`]
///
/// The manifest is written last, so an interrupted commit leaves an orphan
/// revision directory that the next `begin_commit` removes.
pub struct FileSystemSyncServer {
    root: PathBuf,
    lock: FileLock,
    /// Open transactions: transaction id -> revision directory
    transactions: DashMap<String, PathBuf>,
}

impl std::fmt::Debug for FileSystemSyncServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileSystemSyncServer")
            .field("root", &self.root)
            .field("transactions", &self.transactions.len())
            .finish_non_exhaustive()
    }
}

impl FileSystemSyncServer {
    pub fn new(root: impl AsRef<Path>) -> Self {
        let root = root.as_ref().to_path_buf();
        Self {
            lock: FileLock::new(&root),
            root,
            transactions: DashMap::new(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn manifest_path(&self) -> PathBuf {
        self.root.join(MANIFEST_FILE)
    }

    fn revision_dir(&self, revision: i64) -> PathBuf {
        self.root.join(revision.to_string())
    }

    fn note_path(&self, id: &str, revision: i64) -> PathBuf {
        self.revision_dir(revision)
            .join(format!("{}.{}", id, NOTE_EXTENSION))
    }

    fn validate_id(id: &str) -> Result<(), StorageError> {
        let valid = !id.is_empty()
            && !id.starts_with('.')
            && !id.contains(['/', '\\'])
            && !id.chars().any(char::is_control);
        if valid {
            Ok(())
        } else {
            Err(StorageError::InvalidArgument(format!("Invalid note id: {:?}", id)))
        }
    }

    /// Write a file atomically via a temp file in the same directory.
    async fn write_atomic(path: &Path, data: &[u8]) -> Result<(), StorageError> {
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let temp_path = path.with_file_name(format!(".{}.{}.tmp", file_name, uuid::Uuid::new_v4()));

        fs::write(&temp_path, data).await.map_err(|e| {
            StorageError::Io(format!("Failed to write temp file {}: {}", temp_path.display(), e))
        })?;

        if let Err(e) = fs::rename(&temp_path, path).await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(StorageError::Io(format!(
                "Failed to rename temp file to {}: {}",
                path.display(),
                e
            )));
        }
        Ok(())
    }

    async fn read_manifest(&self) -> Result<Option<Manifest>, StorageError> {
        let path = self.manifest_path();
        match fs::read_to_string(&path).await {
            Ok(xml) => decode_manifest(&xml).map(Some),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(StorageError::Io(format!(
                "Failed to read {}: {}",
                path.display(),
                e
            ))),
        }
    }

    async fn current_revision(&self) -> Result<i64, StorageError> {
        Ok(self.read_manifest().await?.map(|m| m.revision).unwrap_or(0))
    }

    /// Remove revision directories no manifest refers to.
    async fn collect_orphans(&self, revision: i64) -> Result<usize, StorageError> {
        let mut entries = fs::read_dir(&self.root).await.map_err(|e| {
            StorageError::Io(format!("Failed to list {}: {}", self.root.display(), e))
        })?;

        let mut removed = 0;
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| StorageError::Io(format!("Failed to list sync root: {}", e)))?
        {
            let Some(orphan) = entry
                .file_name()
                .to_str()
                .and_then(|n| n.parse::<i64>().ok())
                .filter(|r| *r > revision)
            else {
                continue;
            };
            match fs::remove_dir_all(entry.path()).await {
                Ok(()) => {
                    debug!("Removed orphan revision directory {}", orphan);
                    removed += 1;
                }
                Err(e) => warn!("Failed to remove orphan revision {}: {}", orphan, e),
            }
        }
        Ok(removed)
    }

    fn check_transaction(&self, tx: &CommitTransaction) -> Result<(), StorageError> {
        if self.transactions.contains_key(&tx.transaction_id) {
            Ok(())
        } else {
            Err(StorageError::InvalidArgument(format!(
                "Unknown transaction {}",
                tx.transaction_id
            )))
        }
    }
}

#[async_trait]
impl SyncServer for FileSystemSyncServer {
    fn backend_name(&self) -> &'static str {
        "filesystem"
    }

    #[instrument(skip(self), level = "debug")]
    async fn get_manifest(&self) -> Result<Option<Manifest>, StorageError> {
        self.read_manifest().await
    }

    #[instrument(skip(self), level = "debug")]
    async fn list_note_ids_at_revision(
        &self,
        revision: i64,
    ) -> Result<BTreeSet<String>, StorageError> {
        let dir = self.revision_dir(revision);
        let mut entries = match fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(BTreeSet::new()),
            Err(e) => {
                return Err(StorageError::Io(format!(
                    "Failed to list {}: {}",
                    dir.display(),
                    e
                )))
            }
        };

        let mut ids = BTreeSet::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| StorageError::Io(format!("Failed to list revision {}: {}", revision, e)))?
        {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some(NOTE_EXTENSION) {
                continue;
            }
            if let Some(id) = path.file_stem().and_then(|s| s.to_str()) {
                if !id.starts_with('.') {
                    ids.insert(id.to_string());
                }
            }
        }
        Ok(ids)
    }

    #[instrument(skip(self), level = "debug")]
    async fn fetch_note(&self, id: &str, revision: i64) -> Result<Vec<u8>, StorageError> {
        Self::validate_id(id)?;
        let path = self.note_path(id, revision);
        match fs::read(&path).await {
            Ok(blob) => Ok(blob),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(StorageError::NotFound(
                format!("Note {} at revision {}", id, revision),
            )),
            Err(e) => Err(StorageError::Io(format!(
                "Failed to read {}: {}",
                path.display(),
                e
            ))),
        }
    }

    #[instrument(skip(self), level = "debug")]
    async fn begin_commit(&self) -> Result<CommitTransaction, StorageError> {
        let base = self.current_revision().await?;
        self.collect_orphans(base).await?;

        let tx = CommitTransaction::new(base);
        let dir = self.revision_dir(tx.revision);
        fs::create_dir_all(&dir).await.map_err(|e| {
            StorageError::Io(format!("Failed to create {}: {}", dir.display(), e))
        })?;
        self.transactions.insert(tx.transaction_id.clone(), dir);

        debug!(
            "Started transaction {} for revision {}",
            tx.transaction_id, tx.revision
        );
        Ok(tx)
    }

    #[instrument(skip(self, tx, blob), level = "debug", fields(tx = %tx.transaction_id, len = blob.len()))]
    async fn stage_note(
        &self,
        tx: &mut CommitTransaction,
        id: &str,
        blob: &[u8],
    ) -> Result<(), StorageError> {
        self.check_transaction(tx)?;
        Self::validate_id(id)?;
        Self::write_atomic(&self.note_path(id, tx.revision), blob).await?;
        tx.staged_deletions.remove(id);
        tx.staged_notes.insert(id.to_string());
        Ok(())
    }

    #[instrument(skip(self, tx), level = "debug", fields(tx = %tx.transaction_id))]
    async fn stage_deletion(
        &self,
        tx: &mut CommitTransaction,
        id: &str,
    ) -> Result<(), StorageError> {
        self.check_transaction(tx)?;
        Self::validate_id(id)?;
        if tx.staged_notes.remove(id) {
            let _ = fs::remove_file(self.note_path(id, tx.revision)).await;
        }
        tx.staged_deletions.insert(id.to_string());
        Ok(())
    }

    #[instrument(skip(self, tx, manifest), level = "debug", fields(tx = %tx.transaction_id, revision = manifest.revision))]
    async fn commit(
        &self,
        tx: CommitTransaction,
        manifest: &Manifest,
    ) -> Result<(), StorageError> {
        self.check_transaction(&tx)?;

        if manifest.revision != tx.revision {
            return Err(StorageError::InvalidArgument(format!(
                "Manifest revision {} does not match transaction revision {}",
                manifest.revision, tx.revision
            )));
        }
        if let Some(id) = tx
            .staged_notes
            .iter()
            .find(|id| manifest.note_revision(id) != Some(tx.revision))
        {
            return Err(StorageError::InvalidArgument(format!(
                "Staged note {} is not recorded at revision {}",
                id, tx.revision
            )));
        }

        let on_disk = self.current_revision().await?;
        if on_disk != tx.base_revision {
            return Err(StorageError::Conflict(format!(
                "Manifest moved from revision {} to {} since the transaction began",
                tx.base_revision, on_disk
            )));
        }

        let xml = encode_manifest(manifest)?;
        Self::write_atomic(&self.manifest_path(), xml.as_bytes()).await?;
        self.transactions.remove(&tx.transaction_id);

        info!(
            "Committed revision {} ({} notes written, {} deleted)",
            manifest.revision,
            tx.staged_notes.len(),
            tx.staged_deletions.len()
        );
        Ok(())
    }

    #[instrument(skip(self, tx), level = "debug", fields(tx = %tx.transaction_id))]
    async fn abort(&self, tx: CommitTransaction) -> Result<(), StorageError> {
        let Some((_, dir)) = self.transactions.remove(&tx.transaction_id) else {
            return Ok(());
        };
        if self.current_revision().await? >= tx.revision {
            // Committed by someone after all; the directory is live
            return Ok(());
        }
        match fs::remove_dir_all(&dir).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                return Err(StorageError::Io(format!(
                    "Failed to remove {}: {}",
                    dir.display(),
                    e
                )))
            }
        }
        debug!("Aborted transaction {}", tx.transaction_id);
        Ok(())
    }

    async fn acquire_lock(&self, owner: &str, lifetime: Duration) -> Result<bool, StorageError> {
        self.lock.acquire(owner, lifetime).await
    }

    async fn renew_lock(&self, owner: &str) -> Result<bool, StorageError> {
        self.lock.renew(owner).await
    }

    async fn release_lock(&self, owner: &str) -> Result<(), StorageError> {
        self.lock.release(owner).await
    }

    #[instrument(skip(self), level = "debug", fields(root = %self.root.display()))]
    async fn self_test(&self) -> Result<(), StorageError> {
        let mut probe = self.root.join("test");
        let mut count = 0;
        while fs::try_exists(&probe).await.unwrap_or(false) {
            count += 1;
            probe = self.root.join(format!("test{}", count));
        }

        fs::write(&probe, PROBE_CONTENT).await.map_err(|e| {
            StorageError::Io(format!("Failed to write {}: {}", probe.display(), e))
        })?;
        let read_back = fs::read_to_string(&probe).await;
        let removed = fs::remove_file(&probe).await;

        let read_back = read_back.map_err(|e| {
            StorageError::Io(format!("Failed to read back {}: {}", probe.display(), e))
        })?;
        if read_back != PROBE_CONTENT {
            return Err(StorageError::Internal(format!(
                "Probe file {} read back different content",
                probe.display()
            )));
        }
        removed.map_err(|e| {
            StorageError::Io(format!("Failed to remove {}: {}", probe.display(), e))
        })?;

        debug!("Self-test passed on {}", self.root.display());
        Ok(())
    }
}
