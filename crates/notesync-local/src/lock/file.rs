use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use notesync_core::StorageError;
use serde::{Deserialize, Serialize};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, instrument, warn};

/// Lock files that cannot be parsed are treated as held until they are this old.
const UNREADABLE_LOCK_GRACE: Duration = Duration::from_secs(60);

/// Lock file guarding a sync root against concurrent writers.
///
/// The file lives at `{root}/lock` and contains JSON with the owner id and
/// expiry. It is created with `create_new`, so two clients racing on a free
/// root cannot both win. A lock past its expiry is taken over by the next
/// client that asks for it.
#[derive(Debug, Clone)]
pub struct FileLock {
    path: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockRecord {
    pub owner_id: String,
    pub acquired_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    #[serde(default)]
    pub renew_count: u32,
    /// Lifetime requested at acquisition; renewals extend by the same amount.
    pub lifetime_secs: u64,
}

impl LockRecord {
    fn new(owner_id: &str, lifetime: Duration) -> Self {
        let now = Utc::now();
        Self {
            owner_id: owner_id.to_string(),
            acquired_at: now,
            expires_at: now
                + chrono::Duration::from_std(lifetime).unwrap_or_else(|_| chrono::Duration::days(365)),
            renew_count: 0,
            lifetime_secs: lifetime.as_secs(),
        }
    }

    pub fn is_expired(&self) -> bool {
        self.expires_at <= Utc::now()
    }
}

/// What is currently on disk at the lock path.
enum Current {
    Free,
    Held(LockRecord),
    /// Expired or unreadable and old enough to take over.
    Stale,
}

impl FileLock {
    pub fn new(root: impl AsRef<Path>) -> Self {
        Self {
            path: root.as_ref().join("lock"),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Current holder, if a valid lock exists.
    pub async fn holder(&self) -> Result<Option<LockRecord>, StorageError> {
        match self.read_current().await? {
            Current::Held(record) => Ok(Some(record)),
            Current::Free | Current::Stale => Ok(None),
        }
    }

    async fn read_current(&self) -> Result<Current, StorageError> {
        let content = match fs::read_to_string(&self.path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Current::Free),
            Err(e) => {
                return Err(StorageError::Io(format!(
                    "Failed to read lock file {}: {}",
                    self.path.display(),
                    e
                )))
            }
        };

        match serde_json::from_str::<LockRecord>(&content) {
            Ok(record) if record.is_expired() => Ok(Current::Stale),
            Ok(record) => Ok(Current::Held(record)),
            Err(e) => {
                // Possibly a lock still being written by its creator
                let age = fs::metadata(&self.path)
                    .await
                    .and_then(|m| m.modified())
                    .ok()
                    .and_then(|t| t.elapsed().ok())
                    .unwrap_or_default();
                if age >= UNREADABLE_LOCK_GRACE {
                    warn!("Lock file {} is unreadable ({}), treating as stale", self.path.display(), e);
                    Ok(Current::Stale)
                } else {
                    Ok(Current::Held(LockRecord {
                        owner_id: String::from("<unknown>"),
                        acquired_at: Utc::now(),
                        expires_at: Utc::now(),
                        renew_count: 0,
                        lifetime_secs: 0,
                    }))
                }
            }
        }
    }

    /// Create the lock file; `Ok(false)` if one already exists.
    async fn create(&self, record: &LockRecord) -> Result<bool, StorageError> {
        let content = serde_json::to_vec(record)
            .map_err(|e| StorageError::Serialization(format!("Failed to serialize lock: {}", e)))?;

        let mut file = match fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&self.path)
            .await
        {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => return Ok(false),
            Err(e) => {
                return Err(StorageError::Io(format!(
                    "Failed to create lock file {}: {}",
                    self.path.display(),
                    e
                )))
            }
        };
        file.write_all(&content)
            .await
            .map_err(|e| StorageError::Io(format!("Failed to write lock file: {}", e)))?;
        file.sync_all()
            .await
            .map_err(|e| StorageError::Io(format!("Failed to flush lock file: {}", e)))?;
        Ok(true)
    }

    /// Overwrite a lock we own, atomically via temp file + rename.
    async fn rewrite(&self, record: &LockRecord) -> Result<(), StorageError> {
        let temp_path = self.path.with_extension(format!("{}.tmp", uuid::Uuid::new_v4()));
        let content = serde_json::to_vec(record)
            .map_err(|e| StorageError::Serialization(format!("Failed to serialize lock: {}", e)))?;

        fs::write(&temp_path, &content)
            .await
            .map_err(|e| StorageError::Io(format!("Failed to write lock file: {}", e)))?;
        fs::rename(&temp_path, &self.path)
            .await
            .map_err(|e| StorageError::Io(format!("Failed to rename lock file: {}", e)))?;
        Ok(())
    }

    /// Move a stale lock out of the way. Only one of several racing clients
    /// gets to rename it; the others see it gone.
    async fn break_stale(&self) -> Result<(), StorageError> {
        let aside = self.path.with_extension(format!("{}.stale", uuid::Uuid::new_v4()));
        match fs::rename(&self.path, &aside).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(StorageError::Io(format!("Failed to break stale lock: {}", e))),
        }

        // Someone may have re-created a fresh lock between our read and rename
        let moved = fs::read_to_string(&aside)
            .await
            .ok()
            .and_then(|c| serde_json::from_str::<LockRecord>(&c).ok());
        if let Some(record) = moved.filter(|r| !r.is_expired()) {
            debug!("Moved a live lock of {} by mistake, restoring it", record.owner_id);
            if fs::hard_link(&aside, &self.path).await.is_err() {
                let _ = self.create(&record).await;
            }
        } else {
            debug!("Broke stale lock {}", self.path.display());
        }
        let _ = fs::remove_file(&aside).await;
        Ok(())
    }

    #[instrument(skip(self), level = "debug")]
    pub async fn acquire(&self, owner_id: &str, lifetime: Duration) -> Result<bool, StorageError> {
        for _ in 0..2 {
            match self.read_current().await? {
                Current::Held(existing) if existing.owner_id == owner_id => {
                    let mut record = LockRecord::new(owner_id, lifetime);
                    record.acquired_at = existing.acquired_at;
                    record.renew_count = existing.renew_count + 1;
                    self.rewrite(&record).await?;
                    debug!("Refreshed lock for {}", owner_id);
                    return Ok(true);
                }
                Current::Held(existing) => {
                    debug!(
                        "Lock held by {} until {} (requested by {})",
                        existing.owner_id, existing.expires_at, owner_id
                    );
                    return Ok(false);
                }
                Current::Stale => {
                    self.break_stale().await?;
                    continue;
                }
                Current::Free => {}
            }

            let record = LockRecord::new(owner_id, lifetime);
            if self.create(&record).await? {
                debug!("Acquired lock for {} (expires at {})", owner_id, record.expires_at);
                return Ok(true);
            }
            // Lost the race to another client; look at what it wrote
        }
        Ok(false)
    }

    #[instrument(skip(self), level = "debug")]
    pub async fn renew(&self, owner_id: &str) -> Result<bool, StorageError> {
        match self.read_current().await? {
            Current::Held(existing) if existing.owner_id == owner_id => {
                let lifetime = Duration::from_secs(existing.lifetime_secs);
                let mut record = LockRecord::new(owner_id, lifetime);
                record.acquired_at = existing.acquired_at;
                record.renew_count = existing.renew_count + 1;
                self.rewrite(&record).await?;
                debug!("Renewed lock for {} until {}", owner_id, record.expires_at);
                Ok(true)
            }
            _ => {
                debug!("Lock no longer held by {}", owner_id);
                Ok(false)
            }
        }
    }

    #[instrument(skip(self), level = "debug")]
    pub async fn release(&self, owner_id: &str) -> Result<(), StorageError> {
        let content = match fs::read_to_string(&self.path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("No lock to release for {}", owner_id);
                return Ok(());
            }
            Err(e) => return Err(StorageError::Io(format!("Failed to read lock file: {}", e))),
        };

        match serde_json::from_str::<LockRecord>(&content) {
            Ok(record) if record.owner_id == owner_id => {
                fs::remove_file(&self.path).await.map_err(|e| {
                    StorageError::Io(format!("Failed to remove lock file: {}", e))
                })?;
                debug!("Released lock for {}", owner_id);
            }
            Ok(record) => {
                debug!(
                    "Cannot release lock: held by {} not {}",
                    record.owner_id, owner_id
                );
            }
            Err(e) => warn!("Not releasing unreadable lock file: {}", e),
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn setup() -> (FileLock, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let lock = FileLock::new(temp_dir.path());
        (lock, temp_dir)
    }

    #[tokio::test]
    async fn test_acquire_release() {
        let (lock, _temp) = setup();
        let lifetime = Duration::from_secs(60);

        assert!(lock.acquire("client-1", lifetime).await.unwrap());
        // Same owner re-acquires
        assert!(lock.acquire("client-1", lifetime).await.unwrap());
        assert!(!lock.acquire("client-2", lifetime).await.unwrap());

        let holder = lock.holder().await.unwrap().unwrap();
        assert_eq!(holder.owner_id, "client-1");
        assert_eq!(holder.renew_count, 1);

        lock.release("client-1").await.unwrap();
        assert!(!lock.path().exists());
        assert!(lock.acquire("client-2", lifetime).await.unwrap());
    }

    #[tokio::test]
    async fn test_release_not_owner() {
        let (lock, _temp) = setup();
        let lifetime = Duration::from_secs(60);

        lock.acquire("client-1", lifetime).await.unwrap();
        lock.release("client-2").await.unwrap();

        assert!(lock.path().exists());
        assert!(!lock.acquire("client-2", lifetime).await.unwrap());
    }

    #[tokio::test]
    async fn test_expired_lock_is_taken_over() {
        let (lock, _temp) = setup();

        assert!(lock.acquire("crashed", Duration::ZERO).await.unwrap());
        assert!(lock.holder().await.unwrap().is_none());

        assert!(lock.acquire("client-2", Duration::from_secs(60)).await.unwrap());
        assert_eq!(lock.holder().await.unwrap().unwrap().owner_id, "client-2");
        assert!(!lock.renew("crashed").await.unwrap());
    }

    #[tokio::test]
    async fn test_fresh_unreadable_lock_blocks() {
        let (lock, _temp) = setup();
        std::fs::write(lock.path(), b"").unwrap();

        assert!(!lock.acquire("client-1", Duration::from_secs(60)).await.unwrap());
        // Releasing never removes a lock it cannot attribute
        lock.release("client-1").await.unwrap();
        assert!(lock.path().exists());
    }

    #[tokio::test]
    async fn test_renew_extends_expiry() {
        let (lock, _temp) = setup();
        lock.acquire("client-1", Duration::from_secs(30)).await.unwrap();
        let before = lock.holder().await.unwrap().unwrap();

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(lock.renew("client-1").await.unwrap());
        let after = lock.holder().await.unwrap().unwrap();
        assert!(after.expires_at > before.expires_at);
        assert_eq!(after.acquired_at, before.acquired_at);
        assert_eq!(after.renew_count, 1);

        assert!(!lock.renew("client-2").await.unwrap());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_locking() {
        use std::sync::atomic::{AtomicUsize, Ordering};
        use std::sync::Arc;
        use tokio::sync::Barrier;

        let (lock, _temp) = setup();
        let lock = Arc::new(lock);
        let lifetime = Duration::from_secs(30);

        const NUM_TASKS: usize = 10;
        let barrier = Arc::new(Barrier::new(NUM_TASKS));
        let inside = Arc::new(AtomicUsize::new(0));
        let counter = Arc::new(AtomicUsize::new(0));
        let mut handles = vec![];

        for i in 0..NUM_TASKS {
            let lock = Arc::clone(&lock);
            let barrier = Arc::clone(&barrier);
            let inside = Arc::clone(&inside);
            let counter = Arc::clone(&counter);
            let owner = format!("client-{}", i);

            handles.push(tokio::spawn(async move {
                barrier.wait().await;

                let mut acquired = false;
                for attempt in 0..200 {
                    if attempt > 0 {
                        tokio::time::sleep(Duration::from_millis(5 + (attempt * 2) as u64)).await;
                    }
                    if lock.acquire(&owner, lifetime).await.expect("acquire failed") {
                        acquired = true;
                        break;
                    }
                }
                assert!(acquired, "Task {} failed to acquire lock", i);

                // Critical section
                assert_eq!(inside.fetch_add(1, Ordering::SeqCst), 0);
                counter.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(2)).await;
                inside.fetch_sub(1, Ordering::SeqCst);

                lock.release(&owner).await.expect("release failed");
            }));
        }

        for handle in handles {
            handle.await.expect("task panicked");
        }
        assert_eq!(counter.load(Ordering::SeqCst), NUM_TASKS);
    }
}
