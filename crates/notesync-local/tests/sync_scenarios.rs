use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use notesync_core::{
    ConflictResolution, ConflictResolver, DecliningResolver, FixedResolver, MemoryNoteStore, MemorySyncClient,
    NoteStore, NotebookManager, SyncClient, SyncConflict, SyncError, SyncManager, SyncPolicy,
    SyncServer, SyncServiceAddin, SyncState, TagRegistry,
};
use notesync_local::{
    FileSyncClient, FileSystemSyncServer, FolderSyncAddin, LocalNoteStore, LocalVolumeMonitor,
    MountManager, Preferences,
};
use tempfile::TempDir;
use tokio::sync::{oneshot, Mutex};

fn fast_policy() -> SyncPolicy {
    SyncPolicy {
        lock_lifetime: Duration::from_secs(60),
        lock_attempts: 5,
        backoff_base: Duration::from_millis(10),
        backoff_max: Duration::from_millis(50),
    }
}

/// One client instance: its own note store and baseline.
struct Client {
    store: Arc<MemoryNoteStore>,
    baseline: Arc<MemorySyncClient>,
    manager: SyncManager,
}

impl Client {
    fn new() -> Self {
        Self::with_resolver(Arc::new(FixedResolver::keep_remote()))
    }

    fn with_resolver(resolver: Arc<dyn ConflictResolver>) -> Self {
        let store = Arc::new(MemoryNoteStore::new());
        let baseline = Arc::new(MemorySyncClient::new());
        let manager = SyncManager::new(store.clone(), baseline.clone(), resolver, fast_policy());
        Self {
            store,
            baseline,
            manager,
        }
    }

    /// Same store and baseline, different conflict policy.
    fn resolving_with(&self, resolver: Arc<dyn ConflictResolver>) -> SyncManager {
        SyncManager::new(
            self.store.clone(),
            self.baseline.clone(),
            resolver,
            fast_policy(),
        )
    }

    async fn titles(&self) -> Vec<String> {
        let mut titles: Vec<String> = self
            .store
            .list_notes()
            .await
            .unwrap()
            .into_iter()
            .filter(|n| !n.deleted)
            .map(|n| n.title)
            .collect();
        titles.sort();
        titles
    }
}

fn note_files(dir: &Path) -> Vec<String> {
    let mut files: Vec<String> = std::fs::read_dir(dir)
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
        .filter(|n| n.ends_with(".note"))
        .collect();
    files.sort();
    files
}

#[tokio::test]
async fn test_three_notes_reach_a_second_client() {
    let root = TempDir::new().unwrap();
    let server = FileSystemSyncServer::new(root.path());
    let a = Client::new();
    let b = Client::new();

    let mut ids = Vec::new();
    for i in 1..=3 {
        let note = a
            .store
            .create_note(&format!("note{}", i), &format!("content {}", i))
            .await
            .unwrap();
        ids.push(note.id);
    }

    let report = a.manager.synchronize(&server).await.unwrap();
    assert!(report.committed);
    assert_eq!(report.revision, 1);
    assert_eq!(report.uploaded.len(), 3);

    let mut expected: Vec<String> = ids.iter().map(|id| format!("{}.note", id)).collect();
    expected.sort();
    assert_eq!(note_files(&root.path().join("1")), expected);

    let manifest = server.get_manifest().await.unwrap().unwrap();
    assert_eq!(manifest.revision, 1);
    assert_eq!(manifest.notes.len(), 3);

    let report = b.manager.synchronize(&server).await.unwrap();
    assert!(!report.committed);
    assert_eq!(report.downloaded.len(), 3);
    assert_eq!(b.titles().await, vec!["note1", "note2", "note3"]);

    let note2 = b.store.get_note(&ids[1]).await.unwrap().unwrap();
    assert_eq!(note2.content, "content 2");
}

#[tokio::test]
async fn test_second_sync_is_a_noop() {
    let root = TempDir::new().unwrap();
    let server = FileSystemSyncServer::new(root.path());
    let a = Client::new();
    a.store.create_note("note1", "x").await.unwrap();

    a.manager.synchronize(&server).await.unwrap();
    let report = a.manager.synchronize(&server).await.unwrap();

    assert!(report.is_noop());
    assert_eq!(report.revision, 1);
    assert!(!root.path().join("2").exists());
    assert_eq!(server.get_manifest().await.unwrap().unwrap().revision, 1);
    assert_eq!(a.manager.state(), SyncState::Done);
}

#[tokio::test]
async fn test_clients_converge() {
    let root = TempDir::new().unwrap();
    let server = FileSystemSyncServer::new(root.path());
    let a = Client::new();
    let b = Client::new();

    let n1 = a.store.create_note("n1", "from a").await.unwrap();
    a.manager.synchronize(&server).await.unwrap();
    b.manager.synchronize(&server).await.unwrap();

    b.store.update_content(&n1.id, "edited by b").await.unwrap();
    b.store.create_note("n2", "from b").await.unwrap();
    let report = b.manager.synchronize(&server).await.unwrap();
    assert_eq!(report.revision, 2);
    assert_eq!(report.uploaded.len(), 2);

    let report = a.manager.synchronize(&server).await.unwrap();
    assert_eq!(report.downloaded.len(), 2);
    assert!(!report.committed);
    assert_eq!(
        a.store.get_note(&n1.id).await.unwrap().unwrap().content,
        "edited by b"
    );
    assert_eq!(a.titles().await, b.titles().await);

    // Nothing left to exchange in either direction
    assert!(a.manager.synchronize(&server).await.unwrap().is_noop());
    assert!(b.manager.synchronize(&server).await.unwrap().is_noop());
    assert_eq!(server.get_manifest().await.unwrap().unwrap().revision, 2);
}

#[tokio::test]
async fn test_concurrent_edits_conflict() {
    let root = TempDir::new().unwrap();
    let server = FileSystemSyncServer::new(root.path());
    let a = Client::new();
    let b = Client::with_resolver(Arc::new(DecliningResolver));

    let n1 = a.store.create_note("n1", "base").await.unwrap();
    a.manager.synchronize(&server).await.unwrap();
    b.manager.synchronize(&server).await.unwrap();

    a.store.update_content(&n1.id, "a's edit").await.unwrap();
    b.store.update_content(&n1.id, "b's edit").await.unwrap();
    a.manager.synchronize(&server).await.unwrap();

    // Declined: nothing changes on either side
    let err = b.manager.synchronize(&server).await.unwrap_err();
    assert!(matches!(err, SyncError::ConflictUnresolved { ref note_id } if *note_id == n1.id));
    assert_eq!(b.manager.state(), SyncState::Error);
    assert_eq!(server.get_manifest().await.unwrap().unwrap().revision, 2);
    assert_eq!(
        b.store.get_note(&n1.id).await.unwrap().unwrap().content,
        "b's edit"
    );
    assert!(server.acquire_lock("probe", Duration::from_secs(1)).await.unwrap());
    server.release_lock("probe").await.unwrap();

    // Keep both: server version under the original id, b's as a renamed copy
    let keep_both = b.resolving_with(Arc::new(FixedResolver::keep_both()));
    let report = keep_both.synchronize(&server).await.unwrap();
    assert_eq!(report.conflicts.len(), 1);
    assert_eq!(report.renamed_copies.len(), 1);
    assert_eq!(report.revision, 3);

    assert_eq!(
        b.store.get_note(&n1.id).await.unwrap().unwrap().content,
        "a's edit"
    );
    let copy = b
        .store
        .get_note(&report.renamed_copies[0])
        .await
        .unwrap()
        .unwrap();
    assert_eq!(copy.content, "b's edit");
    assert!(copy.title.starts_with("n1 (conflict "));

    a.manager.synchronize(&server).await.unwrap();
    assert_eq!(a.titles().await, b.titles().await);
}

#[tokio::test]
async fn test_keep_local_overwrites_server() {
    let root = TempDir::new().unwrap();
    let server = FileSystemSyncServer::new(root.path());
    let a = Client::new();
    let b = Client::with_resolver(Arc::new(FixedResolver::keep_local()));

    let n1 = a.store.create_note("n1", "base").await.unwrap();
    a.manager.synchronize(&server).await.unwrap();
    b.manager.synchronize(&server).await.unwrap();

    a.store.update_content(&n1.id, "a's edit").await.unwrap();
    b.store.update_content(&n1.id, "b's edit").await.unwrap();
    a.manager.synchronize(&server).await.unwrap();
    let report = b.manager.synchronize(&server).await.unwrap();
    assert_eq!(report.uploaded, vec![n1.id.clone()]);

    a.manager.synchronize(&server).await.unwrap();
    assert_eq!(
        a.store.get_note(&n1.id).await.unwrap().unwrap().content,
        "b's edit"
    );
}

#[tokio::test]
async fn test_deletion_propagates() {
    let root = TempDir::new().unwrap();
    let server = FileSystemSyncServer::new(root.path());
    let a = Client::new();
    let b = Client::new();

    let n1 = a.store.create_note("n1", "x").await.unwrap();
    a.store.create_note("n2", "y").await.unwrap();
    a.manager.synchronize(&server).await.unwrap();
    b.manager.synchronize(&server).await.unwrap();

    a.store.delete_note(&n1.id).await.unwrap();
    let report = a.manager.synchronize(&server).await.unwrap();
    assert_eq!(report.deleted_remotely, vec![n1.id.clone()]);
    assert_eq!(report.revision, 2);
    // The tombstone is gone once the deletion is on the server
    assert!(a.store.get_note(&n1.id).await.unwrap().is_none());

    let manifest = server.get_manifest().await.unwrap().unwrap();
    assert!(!manifest.notes.contains_key(&n1.id));
    assert!(manifest.deleted.contains(&n1.id));

    let report = b.manager.synchronize(&server).await.unwrap();
    assert_eq!(report.deleted_locally, vec![n1.id.clone()]);
    assert_eq!(b.titles().await, vec!["n2"]);
}

#[tokio::test]
async fn test_delete_versus_edit_keeps_edit_by_default() {
    let root = TempDir::new().unwrap();
    let server = FileSystemSyncServer::new(root.path());
    let a = Client::new();
    let b = Client::new();

    let n1 = a.store.create_note("n1", "x").await.unwrap();
    a.manager.synchronize(&server).await.unwrap();
    b.manager.synchronize(&server).await.unwrap();

    b.store.update_content(&n1.id, "still wanted").await.unwrap();
    b.manager.synchronize(&server).await.unwrap();
    a.store.delete_note(&n1.id).await.unwrap();

    // Keep-remote resolves a local delete against a remote edit by restoring it
    let report = a.manager.synchronize(&server).await.unwrap();
    assert_eq!(report.conflicts.len(), 1);
    assert_eq!(
        a.store.get_note(&n1.id).await.unwrap().unwrap().content,
        "still wanted"
    );
    assert!(server
        .get_manifest()
        .await
        .unwrap()
        .unwrap()
        .notes
        .contains_key(&n1.id));
}

#[tokio::test]
async fn test_held_lock_reports_remote_busy() {
    let root = TempDir::new().unwrap();
    let server = FileSystemSyncServer::new(root.path());
    let a = Client::new();
    a.store.create_note("n1", "x").await.unwrap();

    assert!(server
        .acquire_lock("other-client", Duration::from_secs(60))
        .await
        .unwrap());

    let err = a.manager.synchronize(&server).await.unwrap_err();
    assert!(matches!(err, SyncError::LockContention { attempts: 5 }));
    assert_eq!(err.reason(), "remote_busy");
    assert!(server.get_manifest().await.unwrap().is_none());

    server.release_lock("other-client").await.unwrap();
    assert_eq!(a.manager.synchronize(&server).await.unwrap().revision, 1);
}

#[tokio::test]
async fn test_stale_lock_from_crashed_client_is_taken_over() {
    let root = TempDir::new().unwrap();
    let server = FileSystemSyncServer::new(root.path());
    assert!(server.acquire_lock("crashed", Duration::ZERO).await.unwrap());

    let a = Client::new();
    a.store.create_note("n1", "x").await.unwrap();
    assert_eq!(a.manager.synchronize(&server).await.unwrap().revision, 1);
    assert!(!root.path().join("lock").exists());
}

#[tokio::test]
async fn test_interrupted_commit_is_cleaned_up() {
    let root = TempDir::new().unwrap();
    let server = FileSystemSyncServer::new(root.path());
    let a = Client::new();
    a.store.create_note("n1", "x").await.unwrap();
    a.manager.synchronize(&server).await.unwrap();

    // A client died after writing blobs but before the manifest
    std::fs::create_dir_all(root.path().join("2")).unwrap();
    std::fs::write(root.path().join("2").join("ghost.note"), b"<note/>").unwrap();

    let b = Client::new();
    let report = b.manager.synchronize(&server).await.unwrap();
    assert_eq!(report.downloaded.len(), 1);
    assert_eq!(b.titles().await, vec!["n1"]);

    let n2 = b.store.create_note("n2", "y").await.unwrap();
    b.manager.synchronize(&server).await.unwrap();
    assert_eq!(
        note_files(&root.path().join("2")),
        vec![format!("{}.note", n2.id)]
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_sessions_serialize_on_the_lock() {
    use tokio::sync::Barrier;

    let root = TempDir::new().unwrap();
    let path = root.path().to_path_buf();

    const NUM_CLIENTS: usize = 6;
    let barrier = Arc::new(Barrier::new(NUM_CLIENTS));
    let mut handles = vec![];

    for i in 0..NUM_CLIENTS {
        let barrier = Arc::clone(&barrier);
        let path = path.clone();
        handles.push(tokio::spawn(async move {
            let server = FileSystemSyncServer::new(&path);
            let store = Arc::new(MemoryNoteStore::new());
            let policy = SyncPolicy {
                lock_attempts: 100,
                backoff_base: Duration::from_millis(5),
                backoff_max: Duration::from_millis(20),
                ..SyncPolicy::default()
            };
            let manager = SyncManager::new(
                store.clone(),
                Arc::new(MemorySyncClient::new()),
                Arc::new(FixedResolver::keep_remote()),
                policy,
            );
            store
                .create_note(&format!("client {}", i), "hello")
                .await
                .unwrap();

            barrier.wait().await;
            manager.synchronize(&server).await.expect("sync failed")
        }));
    }

    let mut revisions: Vec<i64> = futures::future::join_all(handles)
        .await
        .into_iter()
        .map(|joined| {
            let report = joined.expect("task panicked");
            assert!(report.committed);
            report.revision
        })
        .collect();
    revisions.sort();
    assert_eq!(revisions, (1..=NUM_CLIENTS as i64).collect::<Vec<_>>());

    let manifest = FileSystemSyncServer::new(&path)
        .get_manifest()
        .await
        .unwrap()
        .unwrap();
    assert_eq!(manifest.revision, NUM_CLIENTS as i64);
    assert_eq!(manifest.notes.len(), NUM_CLIENTS);
}

#[tokio::test]
async fn test_second_session_on_same_manager_is_refused() {
    let root = TempDir::new().unwrap();
    let server = Arc::new(FileSystemSyncServer::new(root.path()));
    server
        .acquire_lock("other-client", Duration::from_secs(60))
        .await
        .unwrap();

    let store = Arc::new(MemoryNoteStore::new());
    let manager = Arc::new(SyncManager::new(
        store,
        Arc::new(MemorySyncClient::new()),
        Arc::new(FixedResolver::keep_remote()),
        SyncPolicy {
            lock_attempts: 3,
            backoff_base: Duration::from_millis(200),
            backoff_max: Duration::from_millis(200),
            ..SyncPolicy::default()
        },
    ));
    let mut states = manager.subscribe();

    let first = {
        let manager = Arc::clone(&manager);
        let server = Arc::clone(&server);
        tokio::spawn(async move { manager.synchronize(server.as_ref()).await })
    };
    states.wait_for(|s| *s == SyncState::Locking).await.unwrap();

    let err = manager.synchronize(server.as_ref()).await.unwrap_err();
    assert!(matches!(err, SyncError::SessionInProgress));

    let first = first.await.unwrap();
    assert!(matches!(first, Err(SyncError::LockContention { attempts: 3 })));
}

#[tokio::test]
async fn test_fresh_sync_root_gets_everything_again() {
    let first_root = TempDir::new().unwrap();
    let second_root = TempDir::new().unwrap();
    let a = Client::new();
    a.store.create_note("n1", "x").await.unwrap();
    a.store.create_note("n2", "y").await.unwrap();

    a.manager
        .synchronize(&FileSystemSyncServer::new(first_root.path()))
        .await
        .unwrap();
    let report = a
        .manager
        .synchronize(&FileSystemSyncServer::new(second_root.path()))
        .await
        .unwrap();

    assert_eq!(report.revision, 1);
    assert_eq!(report.uploaded.len(), 2);
    assert_eq!(note_files(&second_root.path().join("1")).len(), 2);
}

#[tokio::test]
async fn test_notebooks_survive_a_fresh_store() {
    let root = TempDir::new().unwrap();
    let a_dir = TempDir::new().unwrap();
    let b_dir = TempDir::new().unwrap();
    let server = FileSystemSyncServer::new(root.path());

    let a_store = Arc::new(LocalNoteStore::open(a_dir.path().join("notes")).await.unwrap());
    let a_notebooks = NotebookManager::new(a_store.clone(), Arc::new(TagRegistry::new()));
    let note = a_store.create_note("groceries", "milk").await.unwrap();
    a_notebooks
        .move_note_to_notebook(&note.id, Some("Home"))
        .await
        .unwrap();
    a_notebooks.get_or_create_notebook("Empty").await.unwrap();

    let a = SyncManager::new(
        a_store.clone(),
        Arc::new(FileSyncClient::new(a_dir.path().join("sync.json"))),
        Arc::new(FixedResolver::keep_remote()),
        fast_policy(),
    );
    a.synchronize(&server).await.unwrap();

    let b_store = Arc::new(LocalNoteStore::open(b_dir.path().join("notes")).await.unwrap());
    let b = SyncManager::new(
        b_store,
        Arc::new(FileSyncClient::new(b_dir.path().join("sync.json"))),
        Arc::new(FixedResolver::keep_remote()),
        fast_policy(),
    );
    b.synchronize(&server).await.unwrap();

    // Reload from disk, as a restarted client would
    let b_store = Arc::new(LocalNoteStore::open(b_dir.path().join("notes")).await.unwrap());
    let b_notebooks = NotebookManager::new(b_store.clone(), Arc::new(TagRegistry::new()));
    assert_eq!(b_notebooks.load_notebooks().await.unwrap(), 2);

    let home = b_notebooks.get_notebook("home").unwrap().unwrap();
    assert_eq!(home.name(), "Home");
    let synced = b_store.get_note(&note.id).await.unwrap().unwrap();
    assert_eq!(b_notebooks.get_notebook_from_note(&synced), Some(home.clone()));

    // A notebook with no notes lives on through its template note alone
    let empty = b_notebooks.get_notebook("Empty").unwrap().unwrap();
    let template = b_notebooks.find_template_note(&empty).await.unwrap().unwrap();
    assert!(empty.is_template_note(&template));
}

#[tokio::test]
async fn test_addin_session_end_to_end() {
    let temp = TempDir::new().unwrap();
    let prefs = Arc::new(
        Preferences::load(temp.path().join("preferences.json"))
            .await
            .unwrap(),
    );
    let mounts = Arc::new(MountManager::new(
        Arc::new(LocalVolumeMonitor),
        Duration::from_secs(1),
    ));
    let addin = FolderSyncAddin::new(prefs, mounts);
    let a = Client::new();
    a.store.create_note("n1", "x").await.unwrap();

    let err = a.manager.perform_synchronization(&addin).await.unwrap_err();
    assert!(matches!(err, SyncError::NotConfigured));

    let target = temp.path().join("shared").join("notes");
    addin
        .save_configuration(target.to_str().unwrap())
        .await
        .unwrap();

    let report = a.manager.perform_synchronization(&addin).await.unwrap();
    assert_eq!(report.revision, 1);
    assert!(target.join("manifest.xml").exists());
    assert!(!target.join("lock").exists());
}

#[tokio::test]
async fn test_content_whitespace_survives_the_round_trip() {
    let root = TempDir::new().unwrap();
    let server = FileSystemSyncServer::new(root.path());
    let a = Client::new();
    let b = Client::new();

    let n1 = a.store.create_note("n1", "\n  body\n").await.unwrap();
    let n2 = a.store.create_note("n2", "  indented").await.unwrap();
    a.manager.synchronize(&server).await.unwrap();
    b.manager.synchronize(&server).await.unwrap();

    for original in [&n1, &n2] {
        let received = b.store.get_note(&original.id).await.unwrap().unwrap();
        assert_eq!(received.content, original.content);
        assert_eq!(received.content_digest(), original.content_digest());
    }

    // Same note created independently on a third client is adopted, not a conflict
    let c = Client::with_resolver(Arc::new(DecliningResolver));
    let mut copy = n1.clone();
    copy.revision = 0;
    c.store.apply_remote(copy).await.unwrap();
    c.store.create_note("n3", "").await.unwrap();
    let report = c.manager.synchronize(&server).await.unwrap();
    assert!(report.conflicts.is_empty());
    assert!(report.committed);
}

#[tokio::test]
async fn test_local_deletion_after_baseline_loss_asks_the_resolver() {
    let root = TempDir::new().unwrap();
    let server = FileSystemSyncServer::new(root.path());
    let a = Client::new();
    let n1 = a.store.create_note("n1", "x").await.unwrap();
    a.manager.synchronize(&server).await.unwrap();

    let b = Client::new();
    b.manager.synchronize(&server).await.unwrap();
    b.store.delete_note(&n1.id).await.unwrap();
    let mut baseline = b.baseline.load().await.unwrap();
    baseline.reset();
    b.baseline.save(&baseline).await.unwrap();

    let declining = b.resolving_with(Arc::new(DecliningResolver));
    let err = declining.synchronize(&server).await.unwrap_err();
    assert!(matches!(err, SyncError::ConflictUnresolved { ref note_id } if *note_id == n1.id));
    assert!(b.store.get_note(&n1.id).await.unwrap().unwrap().deleted);

    let keep_local = b.resolving_with(Arc::new(FixedResolver::keep_local()));
    let report = keep_local.synchronize(&server).await.unwrap();
    assert_eq!(report.deleted_remotely, vec![n1.id.clone()]);
    let manifest = server.get_manifest().await.unwrap().unwrap();
    assert_eq!(manifest.revision, 2);
    assert!(!manifest.notes.contains_key(&n1.id));
}

#[tokio::test]
async fn test_cancel_while_waiting_for_the_lock() {
    let root = TempDir::new().unwrap();
    let server = FileSystemSyncServer::new(root.path());
    assert!(server
        .acquire_lock("other-client", Duration::from_secs(60))
        .await
        .unwrap());

    let store = Arc::new(MemoryNoteStore::new());
    store.create_note("n1", "x").await.unwrap();
    let manager = SyncManager::new(
        store,
        Arc::new(MemorySyncClient::new()),
        Arc::new(FixedResolver::keep_remote()),
        SyncPolicy {
            backoff_base: Duration::from_secs(30),
            backoff_max: Duration::from_secs(30),
            ..SyncPolicy::default()
        },
    );
    let mut states = manager.subscribe();

    let (result, _) = tokio::time::timeout(Duration::from_secs(5), async {
        tokio::join!(manager.synchronize(&server), async {
            states.wait_for(|s| *s == SyncState::Locking).await.unwrap();
            manager.cancel();
        })
    })
    .await
    .expect("cancellation did not interrupt the backoff");

    assert!(matches!(result, Err(SyncError::Cancelled)));
    assert_eq!(manager.state(), SyncState::Error);
    assert!(server.get_manifest().await.unwrap().is_none());
    // The other client's lock is untouched
    assert!(!server
        .acquire_lock("third-client", Duration::from_secs(60))
        .await
        .unwrap());
}

/// Resolver that pauses on the first conflict until the test lets it go.
struct PausingResolver {
    paused: Mutex<Option<oneshot::Sender<()>>>,
    resume: Mutex<Option<oneshot::Receiver<()>>>,
}

#[async_trait]
impl ConflictResolver for PausingResolver {
    async fn resolve(&self, _conflict: &SyncConflict) -> Option<ConflictResolution> {
        if let Some(paused) = self.paused.lock().await.take() {
            let _ = paused.send(());
        }
        if let Some(resume) = self.resume.lock().await.take() {
            let _ = resume.await;
        }
        Some(ConflictResolution::KeepLocal)
    }
}

#[tokio::test]
async fn test_cancel_before_commit_leaves_the_server_untouched() {
    let root = TempDir::new().unwrap();
    let server = FileSystemSyncServer::new(root.path());
    let a = Client::new();
    let n1 = a.store.create_note("n1", "base").await.unwrap();
    a.manager.synchronize(&server).await.unwrap();

    let (paused_tx, paused_rx) = oneshot::channel();
    let (resume_tx, resume_rx) = oneshot::channel();
    let b = Client::with_resolver(Arc::new(PausingResolver {
        paused: Mutex::new(Some(paused_tx)),
        resume: Mutex::new(Some(resume_rx)),
    }));
    b.manager.synchronize(&server).await.unwrap();

    a.store.update_content(&n1.id, "a's edit").await.unwrap();
    a.manager.synchronize(&server).await.unwrap();
    b.store.update_content(&n1.id, "b's edit").await.unwrap();
    b.store.create_note("n2", "new on b").await.unwrap();

    let (result, _) = tokio::join!(b.manager.synchronize(&server), async {
        paused_rx.await.unwrap();
        assert_eq!(b.manager.state(), SyncState::Negotiating);
        b.manager.cancel();
        resume_tx.send(()).unwrap();
    });

    assert!(matches!(result, Err(SyncError::Cancelled)));
    assert_eq!(b.manager.state(), SyncState::Error);
    assert!(!root.path().join("lock").exists());
    assert!(!root.path().join("3").exists());
    assert_eq!(server.get_manifest().await.unwrap().unwrap().revision, 2);
    assert_eq!(
        b.store.get_note(&n1.id).await.unwrap().unwrap().content,
        "b's edit"
    );

    // Released right away: another client commits without waiting
    a.store.create_note("n3", "y").await.unwrap();
    assert_eq!(a.manager.synchronize(&server).await.unwrap().revision, 3);

    // The next session on b is not affected by the earlier request
    let report = b.manager.synchronize(&server).await.unwrap();
    assert!(report.committed);
    assert_eq!(report.revision, 4);
}
