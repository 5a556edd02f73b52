//! The synchronization session.
//!
//! A session locks the sync root, classifies every note against the last
//! synced baseline and the server manifest, resolves conflicts, transfers
//! note blobs, commits a new manifest revision and unlocks.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use tokio::sync::{watch, Mutex, MutexGuard};
use tracing::{debug, info, instrument, warn};

use crate::addin::SyncServiceAddin;
use crate::codec::{decode_note, encode_note};
use crate::conflict::{ConflictKind, ConflictResolution, ConflictResolver, SyncConflict};
use crate::error::{StorageError, SyncError};
use crate::manifest::{ClientManifest, Manifest, SyncClient, SyncedNote};
use crate::note::{Note, NoteStore};
use crate::server::{CommitTransaction, SyncServer};
use crate::tag::{Tag, TEMPLATE_TAG};

/// Lock and retry parameters of a session.
#[derive(Debug, Clone)]
pub struct SyncPolicy {
    /// How long a lock stays valid before other clients may take it over.
    pub lock_lifetime: Duration,
    /// Attempts to acquire the lock before giving up with "remote busy".
    pub lock_attempts: u32,
    /// Delay before the second attempt; doubles after each failure.
    pub backoff_base: Duration,
    pub backoff_max: Duration,
}

impl Default for SyncPolicy {
    fn default() -> Self {
        Self {
            lock_lifetime: Duration::from_secs(60),
            lock_attempts: 5,
            backoff_base: Duration::from_millis(500),
            backoff_max: Duration::from_secs(8),
        }
    }
}

impl SyncPolicy {
    /// Delay to wait before attempt number `attempt` (0-based).
    pub fn backoff(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        let factor = 1u32.checked_shl(attempt - 1).unwrap_or(u32::MAX);
        self.backoff_base
            .checked_mul(factor)
            .unwrap_or(self.backoff_max)
            .min(self.backoff_max)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncState {
    Idle,
    Locking,
    Negotiating,
    Transferring,
    Committing,
    Unlocking,
    Done,
    Error,
}

/// What to do with one note.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncAction {
    NoOp,
    Upload,
    Download,
    /// Deleted locally; remove it from the server.
    PropagateDeletion,
    /// Deleted on the server; remove the local copy.
    DeleteLocally,
    /// Gone on both sides; drop the baseline entry and any tombstone.
    Forget,
    Conflict(ConflictKind),
}

/// Classify one note from its local state, the baseline recorded at the last
/// sync and its revision in the server manifest.
pub fn classify(
    local: Option<&Note>,
    baseline: Option<SyncedNote>,
    remote_revision: Option<i64>,
) -> SyncAction {
    let live = local.filter(|n| !n.deleted);

    let Some(base) = baseline else {
        // Never synced by this client
        return match (local, live, remote_revision) {
            (None, _, None) => SyncAction::NoOp,
            (Some(_), None, None) => SyncAction::Forget,
            (Some(_), Some(_), None) => SyncAction::Upload,
            (None, _, Some(_)) => SyncAction::Download,
            // Deleted here while the baseline was lost; the user decides
            (Some(_), None, Some(_)) => SyncAction::Conflict(ConflictKind::DeletedLocally),
            (_, Some(_), Some(_)) => SyncAction::Conflict(ConflictKind::BothCreated),
        };
    };

    match (live, remote_revision) {
        (None, None) => SyncAction::Forget,
        (None, Some(rev)) if rev == base.server_revision => SyncAction::PropagateDeletion,
        (None, Some(_)) => SyncAction::Conflict(ConflictKind::DeletedLocally),
        (Some(note), None) => {
            if note.revision == base.local_revision {
                SyncAction::DeleteLocally
            } else {
                SyncAction::Conflict(ConflictKind::DeletedRemotely)
            }
        }
        (Some(note), Some(rev)) => {
            let local_changed = note.revision != base.local_revision;
            let remote_changed = rev != base.server_revision;
            match (local_changed, remote_changed) {
                (false, false) => SyncAction::NoOp,
                (true, false) => SyncAction::Upload,
                (false, true) => SyncAction::Download,
                (true, true) => SyncAction::Conflict(ConflictKind::BothModified),
            }
        }
    }
}

/// Outcome of a successful session.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SyncReport {
    /// Server revision after the session.
    pub revision: i64,
    /// Whether the session created a new revision.
    pub committed: bool,
    pub uploaded: Vec<String>,
    pub downloaded: Vec<String>,
    /// Local deletions propagated to the server.
    pub deleted_remotely: Vec<String>,
    /// Server deletions applied locally.
    pub deleted_locally: Vec<String>,
    pub conflicts: Vec<(String, ConflictResolution)>,
    /// Local copies created by keep-both resolutions.
    pub renamed_copies: Vec<String>,
}

impl SyncReport {
    pub fn is_noop(&self) -> bool {
        !self.committed
            && self.downloaded.is_empty()
            && self.deleted_locally.is_empty()
            && self.renamed_copies.is_empty()
    }
}

/// Work decided during negotiation.
#[derive(Debug, Default)]
struct SyncPlan {
    uploads: BTreeSet<String>,
    downloads: BTreeSet<String>,
    propagate_deletions: BTreeSet<String>,
    delete_locally: BTreeSet<String>,
    forget: BTreeSet<String>,
    /// Identical on both sides; only the baseline needs recording.
    adopt: BTreeSet<String>,
    /// Local versions to keep under a new id.
    copies: Vec<Note>,
    conflicts: Vec<(String, ConflictResolution)>,
}

/// Drives synchronization sessions for one local note store.
///
/// Only one session runs at a time; a second concurrent call fails with
/// [`SyncError::SessionInProgress`]. [`SyncManager::cancel`] stops a running
/// session at its next checkpoint before commit.
pub struct SyncManager {
    store: Arc<dyn NoteStore>,
    client: Arc<dyn SyncClient>,
    resolver: Arc<dyn ConflictResolver>,
    policy: SyncPolicy,
    client_id: String,
    state: watch::Sender<SyncState>,
    cancel: watch::Sender<bool>,
    session: Mutex<()>,
}

impl std::fmt::Debug for SyncManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncManager")
            .field("client_id", &self.client_id)
            .field("policy", &self.policy)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl SyncManager {
    pub fn new(
        store: Arc<dyn NoteStore>,
        client: Arc<dyn SyncClient>,
        resolver: Arc<dyn ConflictResolver>,
        policy: SyncPolicy,
    ) -> Self {
        let (state, _) = watch::channel(SyncState::Idle);
        let (cancel, _) = watch::channel(false);
        Self {
            store,
            client,
            resolver,
            policy,
            client_id: uuid::Uuid::new_v4().to_string(),
            state,
            cancel,
            session: Mutex::new(()),
        }
    }

    /// Use a fixed owner id for the sync lock.
    pub fn with_client_id(mut self, client_id: impl Into<String>) -> Self {
        self.client_id = client_id.into();
        self
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    pub fn state(&self) -> SyncState {
        *self.state.borrow()
    }

    /// Observe state transitions of the sessions run by this manager.
    pub fn subscribe(&self) -> watch::Receiver<SyncState> {
        self.state.subscribe()
    }

    /// Ask the running session to stop. Until the session starts committing
    /// it unwinds with [`SyncError::Cancelled`], releasing the lock and
    /// leaving the server untouched; a session already committing finishes.
    pub fn cancel(&self) {
        debug!("Cancellation requested");
        self.cancel.send_replace(true);
    }

    fn check_cancelled(&self) -> Result<(), SyncError> {
        if *self.cancel.borrow() {
            Err(SyncError::Cancelled)
        } else {
            Ok(())
        }
    }

    fn set_state(&self, state: SyncState) {
        debug!("Sync state -> {:?}", state);
        self.state.send_replace(state);
    }

    fn begin_session(&self) -> Result<MutexGuard<'_, ()>, SyncError> {
        self.session
            .try_lock()
            .map_err(|_| SyncError::SessionInProgress)
    }

    /// Run a session through a configured addin, tearing its resources down
    /// afterwards whatever the outcome.
    pub async fn perform_synchronization(
        &self,
        addin: &dyn SyncServiceAddin,
    ) -> Result<SyncReport, SyncError> {
        if !addin.is_configured() {
            return Err(SyncError::NotConfigured);
        }
        let _session = self.begin_session()?;

        let server = match addin.create_sync_server().await {
            Ok(server) => server,
            Err(e) => {
                self.set_state(SyncState::Error);
                addin.post_sync_cleanup().await;
                return Err(e);
            }
        };
        let result = self.run_session(server.as_ref()).await;
        addin.post_sync_cleanup().await;
        result
    }

    /// Run one session against `server`.
    pub async fn synchronize(&self, server: &dyn SyncServer) -> Result<SyncReport, SyncError> {
        let _session = self.begin_session()?;
        self.run_session(server).await
    }

    #[instrument(skip(self, server), fields(client_id = %self.client_id, backend = server.backend_name()))]
    async fn run_session(&self, server: &dyn SyncServer) -> Result<SyncReport, SyncError> {
        self.cancel.send_replace(false);
        self.set_state(SyncState::Locking);
        if let Err(e) = self.acquire_lock(server).await {
            warn!("Sync failed ({}): {}", e.reason(), e);
            self.set_state(SyncState::Error);
            return Err(e);
        }

        let outcome = self.negotiate_and_commit(server).await;

        self.set_state(SyncState::Unlocking);
        self.release_lock(server).await;

        match outcome {
            Ok(report) => {
                info!(
                    "Sync finished at revision {} ({} up, {} down, {} conflicts)",
                    report.revision,
                    report.uploaded.len(),
                    report.downloaded.len(),
                    report.conflicts.len()
                );
                self.set_state(SyncState::Done);
                Ok(report)
            }
            Err(e) => {
                warn!("Sync failed ({}): {}", e.reason(), e);
                self.set_state(SyncState::Error);
                Err(e)
            }
        }
    }

    async fn acquire_lock(&self, server: &dyn SyncServer) -> Result<(), SyncError> {
        let attempts = self.policy.lock_attempts.max(1);
        for attempt in 0..attempts {
            if attempt > 0 {
                let cancelled = async {
                    let mut requests = self.cancel.subscribe();
                    // Errors only once the manager is dropped
                    let _ = requests.wait_for(|c| *c).await;
                };
                tokio::select! {
                    _ = tokio::time::sleep(self.policy.backoff(attempt)) => {}
                    _ = cancelled => {}
                }
            }
            self.check_cancelled()?;
            let acquired = server
                .acquire_lock(&self.client_id, self.policy.lock_lifetime)
                .await
                .map_err(|e| SyncError::Configuration(format!("Failed to acquire lock: {}", e)))?;
            if acquired {
                debug!("Acquired sync lock on attempt {}", attempt + 1);
                return Ok(());
            }
            debug!("Sync root busy (attempt {}/{})", attempt + 1, attempts);
        }
        Err(SyncError::LockContention { attempts })
    }

    async fn release_lock(&self, server: &dyn SyncServer) {
        for attempt in 0..2 {
            match server.release_lock(&self.client_id).await {
                Ok(()) => return,
                Err(e) => warn!("Failed to release sync lock (attempt {}): {}", attempt + 1, e),
            }
        }
    }

    async fn negotiate_and_commit(&self, server: &dyn SyncServer) -> Result<SyncReport, SyncError> {
        self.check_cancelled()?;
        self.set_state(SyncState::Negotiating);

        let manifest = server
            .get_manifest()
            .await
            .map_err(|e| SyncError::Transfer(format!("Failed to read manifest: {}", e)))?
            .unwrap_or_else(Manifest::empty);
        let mut baseline = self.client.load().await.map_err(SyncError::Store)?;
        self.check_server_identity(&manifest, &mut baseline);

        let local: BTreeMap<String, Note> = self
            .store
            .list_notes()
            .await
            .map_err(SyncError::Store)?
            .into_iter()
            .map(|n| (n.id.clone(), n))
            .collect();

        let mut plan = SyncPlan::default();
        let mut remote_cache: BTreeMap<String, Note> = BTreeMap::new();
        let ids: BTreeSet<String> = local
            .keys()
            .chain(manifest.notes.keys())
            .chain(baseline.notes.keys())
            .cloned()
            .collect();

        for id in ids {
            let action = classify(local.get(&id), baseline.get(&id), manifest.note_revision(&id));
            match action {
                SyncAction::NoOp => {}
                SyncAction::Upload => {
                    plan.uploads.insert(id);
                }
                SyncAction::Download => {
                    plan.downloads.insert(id);
                }
                SyncAction::PropagateDeletion => {
                    plan.propagate_deletions.insert(id);
                }
                SyncAction::DeleteLocally => {
                    plan.delete_locally.insert(id);
                }
                SyncAction::Forget => {
                    plan.forget.insert(id);
                }
                SyncAction::Conflict(kind) => {
                    let remote = match manifest.note_revision(&id) {
                        Some(rev) => Some(self.fetch_remote(server, &id, rev).await?),
                        None => None,
                    };
                    let local_note = local.get(&id).filter(|n| !n.deleted).cloned();
                    if let Some(remote) = &remote {
                        remote_cache.insert(id.clone(), remote.clone());
                    }
                    self.resolve_conflict(
                        &mut plan,
                        SyncConflict {
                            note_id: id,
                            kind,
                            local: local_note,
                            remote,
                        },
                    )
                    .await?;
                }
            }
        }

        debug!(
            "Plan: {} up, {} down, {} remote deletions, {} local deletions, {} conflicts",
            plan.uploads.len(),
            plan.downloads.len(),
            plan.propagate_deletions.len(),
            plan.delete_locally.len(),
            plan.conflicts.len()
        );

        let mut report = SyncReport {
            revision: manifest.revision,
            conflicts: plan.conflicts.clone(),
            ..Default::default()
        };

        self.check_cancelled()?;
        self.set_state(SyncState::Transferring);
        self.apply_downloads(server, &manifest, &mut plan, &mut baseline, &mut remote_cache, &mut report)
            .await?;

        // Downloads reflect a committed server state; keep them even if the
        // commit below fails.
        self.client.save(&baseline).await.map_err(SyncError::Store)?;

        if plan.uploads.is_empty() && plan.propagate_deletions.is_empty() {
            baseline.last_synchronized_revision = manifest.revision;
            if !manifest.server_id.is_empty() {
                baseline.server_id = Some(manifest.server_id.clone());
            }
            baseline.last_sync_at = Some(Utc::now());
            self.client.save(&baseline).await.map_err(SyncError::Store)?;
            return Ok(report);
        }

        // Last point where stopping leaves the server as it was
        self.check_cancelled()?;
        self.set_state(SyncState::Committing);
        self.commit(server, &manifest, &plan, &mut baseline, &mut report)
            .await?;
        Ok(report)
    }

    /// A manifest from a different or rolled-back server invalidates the baseline.
    fn check_server_identity(&self, manifest: &Manifest, baseline: &mut ClientManifest) {
        let other_server = matches!(
            &baseline.server_id,
            Some(known) if !manifest.server_id.is_empty() && *known != manifest.server_id
        );
        let rolled_back = manifest.revision < baseline.last_synchronized_revision;
        if other_server || rolled_back {
            warn!(
                "Sync root changed identity (server id {:?} -> {:?}, revision {} -> {}), resyncing from scratch",
                baseline.server_id,
                manifest.server_id,
                baseline.last_synchronized_revision,
                manifest.revision
            );
            baseline.reset();
        }
    }

    async fn fetch_remote(&self, server: &dyn SyncServer, id: &str, revision: i64) -> Result<Note, SyncError> {
        let blob = server
            .fetch_note(id, revision)
            .await
            .map_err(|e| SyncError::Transfer(format!("Failed to fetch note {}: {}", id, e)))?;
        let note = decode_note(&blob)
            .map_err(|e| SyncError::Transfer(format!("Failed to decode note {}: {}", id, e)))?;
        if note.id != id {
            return Err(SyncError::Transfer(format!(
                "Blob for note {} at revision {} carries id {}",
                id, revision, note.id
            )));
        }
        Ok(note)
    }

    async fn resolve_conflict(&self, plan: &mut SyncPlan, conflict: SyncConflict) -> Result<(), SyncError> {
        let id = conflict.note_id.clone();

        if conflict.kind == ConflictKind::BothCreated {
            if let (Some(local), Some(remote)) = (&conflict.local, &conflict.remote) {
                if local.content_digest() == remote.content_digest() && local.tags == remote.tags {
                    debug!("Note {} is identical on both sides, adopting", id);
                    plan.adopt.insert(id);
                    return Ok(());
                }
            }
        }

        let decision = self
            .resolver
            .resolve(&conflict)
            .await
            .ok_or_else(|| SyncError::ConflictUnresolved {
                note_id: id.clone(),
            })?;
        info!("Conflict on note {} ({:?}) resolved: {}", id, conflict.kind, decision);

        match (conflict.kind, decision) {
            (ConflictKind::DeletedLocally, ConflictResolution::KeepLocal) => {
                plan.propagate_deletions.insert(id.clone());
            }
            (ConflictKind::DeletedLocally, _) => {
                plan.downloads.insert(id.clone());
            }
            (ConflictKind::DeletedRemotely, ConflictResolution::KeepRemote) => {
                plan.delete_locally.insert(id.clone());
            }
            (ConflictKind::DeletedRemotely, _) => {
                plan.uploads.insert(id.clone());
            }
            (_, ConflictResolution::KeepLocal) => {
                plan.uploads.insert(id.clone());
            }
            (_, ConflictResolution::KeepRemote) => {
                plan.downloads.insert(id.clone());
            }
            (_, ConflictResolution::KeepBothRenamed) => {
                if let Some(local) = conflict.local {
                    plan.copies.push(local);
                }
                plan.downloads.insert(id.clone());
            }
        }
        plan.conflicts.push((id, decision));
        Ok(())
    }

    async fn apply_downloads(
        &self,
        server: &dyn SyncServer,
        manifest: &Manifest,
        plan: &mut SyncPlan,
        baseline: &mut ClientManifest,
        remote_cache: &mut BTreeMap<String, Note>,
        report: &mut SyncReport,
    ) -> Result<(), SyncError> {
        // Copies first: the download below overwrites the original id
        for local in std::mem::take(&mut plan.copies) {
            let title = format!("{} (conflict {})", local.title, Utc::now().format("%Y-%m-%d %H:%M"));
            let copy = self
                .store
                .create_note(&title, &local.content)
                .await
                .map_err(SyncError::Store)?;
            let tags: BTreeSet<String> = local
                .tags
                .iter()
                .filter(|t| Tag::normalize(t) != TEMPLATE_TAG)
                .cloned()
                .collect();
            let copy = if tags.is_empty() {
                copy
            } else {
                self.store.set_tags(&copy.id, tags).await.map_err(SyncError::Store)?
            };
            debug!("Kept local version of {} as {}", local.id, copy.id);
            plan.uploads.insert(copy.id.clone());
            report.renamed_copies.push(copy.id);
        }

        for id in &plan.downloads {
            let revision = manifest.note_revision(id).ok_or_else(|| {
                SyncError::Transfer(format!("Note {} is not in the server manifest", id))
            })?;
            let remote = match remote_cache.remove(id) {
                Some(note) => note,
                None => self.fetch_remote(server, id, revision).await?,
            };
            let stored = self.store.apply_remote(remote).await.map_err(SyncError::Store)?;
            baseline.record(id, revision, stored.revision);
            report.downloaded.push(id.clone());
        }

        for id in &plan.adopt {
            if let (Some(revision), Some(local)) = (
                manifest.note_revision(id),
                self.store.get_note(id).await.map_err(SyncError::Store)?,
            ) {
                baseline.record(id, revision, local.revision);
            }
        }

        for id in &plan.delete_locally {
            self.store.purge_note(id).await.map_err(SyncError::Store)?;
            baseline.forget(id);
            report.deleted_locally.push(id.clone());
        }

        for id in &plan.forget {
            self.store.purge_note(id).await.map_err(SyncError::Store)?;
            baseline.forget(id);
        }

        Ok(())
    }

    async fn commit(
        &self,
        server: &dyn SyncServer,
        manifest: &Manifest,
        plan: &SyncPlan,
        baseline: &mut ClientManifest,
        report: &mut SyncReport,
    ) -> Result<(), SyncError> {
        let still_locked = server
            .renew_lock(&self.client_id)
            .await
            .map_err(|e| SyncError::Commit(format!("Failed to renew lock: {}", e)))?;
        if !still_locked {
            return Err(SyncError::Commit(
                "Lock on the sync root was lost before commit".to_string(),
            ));
        }

        let mut tx = server
            .begin_commit()
            .await
            .map_err(|e| SyncError::Transfer(format!("Failed to start commit: {}", e)))?;
        if tx.base_revision != manifest.revision {
            let moved_to = tx.base_revision;
            self.abort(server, tx).await;
            return Err(SyncError::Commit(format!(
                "Server moved from revision {} to {} during the session",
                manifest.revision, moved_to
            )));
        }

        let mut next = manifest.next();
        let mut uploaded: Vec<(String, u64)> = Vec::new();

        for id in &plan.uploads {
            let staged = match self.store.get_note(id).await {
                Ok(Some(note)) if !note.deleted => match encode_note(&note) {
                    Ok(blob) => server
                        .stage_note(&mut tx, id, &blob)
                        .await
                        .map(|_| note.revision),
                    Err(e) => Err(e),
                },
                Ok(_) => Err(StorageError::NotFound(format!("Note {} vanished", id))),
                Err(e) => Err(e),
            };
            match staged {
                Ok(local_revision) => {
                    next.notes.insert(id.clone(), tx.revision);
                    uploaded.push((id.clone(), local_revision));
                }
                Err(e) => {
                    self.abort(server, tx).await;
                    return Err(SyncError::Transfer(format!("Failed to upload note {}: {}", id, e)));
                }
            }
        }

        for id in &plan.propagate_deletions {
            if let Err(e) = server.stage_deletion(&mut tx, id).await {
                self.abort(server, tx).await;
                return Err(SyncError::Transfer(format!("Failed to delete note {}: {}", id, e)));
            }
            next.notes.remove(id);
            next.deleted.insert(id.clone());
        }

        server
            .commit(tx, &next)
            .await
            .map_err(|e| SyncError::Commit(e.to_string()))?;
        info!("Committed revision {}", next.revision);

        // The new revision is durable from here on; failures are only logged
        for (id, local_revision) in uploaded {
            baseline.record(&id, next.revision, local_revision);
            report.uploaded.push(id);
        }
        for id in &plan.propagate_deletions {
            baseline.forget(id);
            if let Err(e) = self.store.purge_note(id).await {
                warn!("Failed to purge tombstone of note {}: {}", id, e);
            }
            report.deleted_remotely.push(id.clone());
        }
        baseline.last_synchronized_revision = next.revision;
        baseline.server_id = Some(next.server_id.clone());
        baseline.last_sync_at = Some(Utc::now());
        if let Err(e) = self.client.save(baseline).await {
            warn!("Failed to save sync baseline after commit: {}", e);
        }

        report.revision = next.revision;
        report.committed = true;
        Ok(())
    }

    async fn abort(&self, server: &dyn SyncServer, tx: CommitTransaction) {
        let id = tx.transaction_id.clone();
        if let Err(e) = server.abort(tx).await {
            warn!("Failed to abort transaction {}: {}", id, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conflict::{DecliningResolver, FixedResolver};
    use crate::manifest::MemorySyncClient;
    use crate::note::MemoryNoteStore;

    fn base(server_revision: i64, local_revision: u64) -> Option<SyncedNote> {
        Some(SyncedNote {
            server_revision,
            local_revision,
        })
    }

    fn note(revision: u64, deleted: bool) -> Note {
        let mut n = Note::new("t", "c");
        n.revision = revision;
        n.deleted = deleted;
        n
    }

    #[test]
    fn test_classify_table() {
        let live = note(4, false);
        let changed = note(5, false);
        let gone = note(5, true);

        assert_eq!(classify(Some(&live), base(2, 4), Some(2)), SyncAction::NoOp);
        assert_eq!(classify(Some(&changed), base(2, 4), Some(2)), SyncAction::Upload);
        assert_eq!(classify(Some(&live), base(2, 4), Some(3)), SyncAction::Download);
        assert_eq!(
            classify(Some(&changed), base(2, 4), Some(3)),
            SyncAction::Conflict(ConflictKind::BothModified)
        );
        assert_eq!(classify(Some(&gone), base(2, 4), Some(2)), SyncAction::PropagateDeletion);
        assert_eq!(classify(None, base(2, 4), Some(2)), SyncAction::PropagateDeletion);
        assert_eq!(classify(Some(&live), base(2, 4), None), SyncAction::DeleteLocally);
        assert_eq!(
            classify(Some(&gone), base(2, 4), Some(3)),
            SyncAction::Conflict(ConflictKind::DeletedLocally)
        );
        assert_eq!(
            classify(Some(&changed), base(2, 4), None),
            SyncAction::Conflict(ConflictKind::DeletedRemotely)
        );
        assert_eq!(classify(Some(&gone), base(2, 4), None), SyncAction::Forget);
    }

    #[test]
    fn test_classify_without_baseline() {
        let live = note(1, false);
        let gone = note(2, true);
        assert_eq!(classify(Some(&live), None, None), SyncAction::Upload);
        assert_eq!(classify(None, None, Some(1)), SyncAction::Download);
        assert_eq!(classify(Some(&gone), None, None), SyncAction::Forget);
        assert_eq!(
            classify(Some(&gone), None, Some(1)),
            SyncAction::Conflict(ConflictKind::DeletedLocally)
        );
        assert_eq!(
            classify(Some(&live), None, Some(1)),
            SyncAction::Conflict(ConflictKind::BothCreated)
        );
        assert_eq!(classify(None, None, None), SyncAction::NoOp);
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let policy = SyncPolicy {
            backoff_base: Duration::from_millis(100),
            backoff_max: Duration::from_millis(500),
            ..Default::default()
        };
        assert_eq!(policy.backoff(0), Duration::ZERO);
        assert_eq!(policy.backoff(1), Duration::from_millis(100));
        assert_eq!(policy.backoff(2), Duration::from_millis(200));
        assert_eq!(policy.backoff(3), Duration::from_millis(400));
        assert_eq!(policy.backoff(4), Duration::from_millis(500));
        assert_eq!(policy.backoff(60), Duration::from_millis(500));
    }

    #[tokio::test]
    async fn test_conflict_declined() {
        let store = Arc::new(MemoryNoteStore::new());
        let manager = SyncManager::new(
            store,
            Arc::new(MemorySyncClient::new()),
            Arc::new(DecliningResolver),
            SyncPolicy::default(),
        );
        let mut plan = SyncPlan::default();
        let conflict = SyncConflict {
            note_id: "n".to_string(),
            kind: ConflictKind::BothModified,
            local: Some(Note::new("a", "1")),
            remote: Some(Note::new("a", "2")),
        };
        let err = manager.resolve_conflict(&mut plan, conflict).await.unwrap_err();
        assert!(matches!(err, SyncError::ConflictUnresolved { note_id } if note_id == "n"));
    }

    #[tokio::test]
    async fn test_resolution_mapping() {
        let manager = SyncManager::new(
            Arc::new(MemoryNoteStore::new()),
            Arc::new(MemorySyncClient::new()),
            Arc::new(FixedResolver::keep_both()),
            SyncPolicy::default(),
        );
        let local = Note::new("a", "1");
        let mut remote = local.clone();
        remote.content = "2".to_string();

        let mut plan = SyncPlan::default();
        manager
            .resolve_conflict(
                &mut plan,
                SyncConflict {
                    note_id: local.id.clone(),
                    kind: ConflictKind::BothModified,
                    local: Some(local.clone()),
                    remote: Some(remote.clone()),
                },
            )
            .await
            .unwrap();
        assert!(plan.downloads.contains(&local.id));
        assert_eq!(plan.copies.len(), 1);
        assert_eq!(plan.conflicts, vec![(local.id.clone(), ConflictResolution::KeepBothRenamed)]);

        // Identical content created on both sides is adopted without asking
        let mut plan = SyncPlan::default();
        manager
            .resolve_conflict(
                &mut plan,
                SyncConflict {
                    note_id: local.id.clone(),
                    kind: ConflictKind::BothCreated,
                    local: Some(local.clone()),
                    remote: Some(local.clone()),
                },
            )
            .await
            .unwrap();
        assert!(plan.adopt.contains(&local.id));
        assert!(plan.conflicts.is_empty());

        // Keep-both on a remotely deleted note keeps the local edit
        let mut plan = SyncPlan::default();
        manager
            .resolve_conflict(
                &mut plan,
                SyncConflict {
                    note_id: local.id.clone(),
                    kind: ConflictKind::DeletedRemotely,
                    local: Some(local.clone()),
                    remote: None,
                },
            )
            .await
            .unwrap();
        assert!(plan.uploads.contains(&local.id));
        assert!(plan.copies.is_empty());
    }
}
