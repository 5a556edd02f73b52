use std::sync::Arc;

use async_trait::async_trait;
use notesync_core::{SyncError, SyncServer, SyncServiceAddin};
use tokio::sync::Mutex;
use tracing::{debug, info, instrument, warn};

use crate::mount::{MountManager, MountedRoot};
use crate::preferences::Preferences;
use crate::server::FileSystemSyncServer;

/// Sync through a folder: a local directory or a location on a remote volume
/// that gets mounted for the duration of each session.
#[derive(Debug)]
pub struct FolderSyncAddin {
    preferences: Arc<Preferences>,
    mounts: Arc<MountManager>,
    /// Location made reachable by `create_sync_server`
    active: Mutex<Option<MountedRoot>>,
}

impl FolderSyncAddin {
    pub fn new(preferences: Arc<Preferences>, mounts: Arc<MountManager>) -> Self {
        Self {
            preferences,
            mounts,
            active: Mutex::new(None),
        }
    }

    pub fn sync_uri(&self) -> String {
        self.preferences.sync_uri()
    }

    async fn open(&self, uri: &str) -> Result<(MountedRoot, FileSystemSyncServer), SyncError> {
        let root = self.mounts.ensure_mounted(uri).await?;
        let server = FileSystemSyncServer::new(&root.path);
        if let Err(e) = server.self_test().await {
            self.mounts.release(&root).await;
            return Err(SyncError::Configuration(format!(
                "Sync location {} is not usable: {}",
                uri, e
            )));
        }
        Ok((root, server))
    }
}

#[async_trait]
impl SyncServiceAddin for FolderSyncAddin {
    fn id(&self) -> &'static str {
        "folder"
    }

    fn name(&self) -> &'static str {
        "Folder (local or remote volume)"
    }

    fn is_configured(&self) -> bool {
        !self.preferences.sync_uri().trim().is_empty()
    }

    #[instrument(skip(self), level = "debug")]
    async fn save_configuration(&self, uri: &str) -> Result<(), SyncError> {
        let uri = uri.trim();
        if uri.is_empty() {
            return Err(SyncError::Configuration(
                "Sync location is empty".to_string(),
            ));
        }

        let (root, _server) = self.open(uri).await?;
        self.mounts.release(&root).await;

        self.preferences
            .set_sync_uri(uri)
            .await
            .map_err(|e| SyncError::Configuration(format!("Failed to save preferences: {}", e)))?;
        info!("Sync location set to {}", uri);
        Ok(())
    }

    async fn reset_configuration(&self) -> Result<(), SyncError> {
        self.preferences
            .set_sync_uri("")
            .await
            .map_err(|e| SyncError::Configuration(format!("Failed to save preferences: {}", e)))?;
        info!("Sync location cleared");
        Ok(())
    }

    #[instrument(skip(self), level = "debug")]
    async fn create_sync_server(&self) -> Result<Arc<dyn SyncServer>, SyncError> {
        let uri = self.preferences.sync_uri();
        if uri.trim().is_empty() {
            return Err(SyncError::NotConfigured);
        }

        let mut active = self.active.lock().await;
        if let Some(previous) = active.take() {
            debug!("Releasing mount left over from a previous session");
            self.mounts.release(&previous).await;
        }

        let (root, server) = self.open(&uri).await?;
        debug!("Sync root {} at {}", root.uri, root.path.display());
        *active = Some(root);
        Ok(Arc::new(server))
    }

    async fn post_sync_cleanup(&self) {
        let Some(root) = self.active.lock().await.take() else {
            return;
        };
        if root.mounted_by_us {
            debug!("Unmounting {} after sync", root.uri);
        }
        self.mounts.release(&root).await;
        if !self.mounts.active_mounts().is_empty() {
            warn!("Volumes still mounted after cleanup: {:?}", self.mounts.active_mounts());
        }
    }
}
