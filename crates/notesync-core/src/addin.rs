use std::sync::Arc;

use async_trait::async_trait;

use crate::error::SyncError;
use crate::server::SyncServer;

/// A configurable sync service, as plugged into the host application.
///
/// The addin owns whatever makes its backend reachable (for example a
/// mounted remote volume) and tears it down in `post_sync_cleanup`.
#[async_trait]
pub trait SyncServiceAddin: Send + Sync {
    /// Stable identifier stored in preferences (e.g., "folder").
    fn id(&self) -> &'static str;

    /// Human-readable service name.
    fn name(&self) -> &'static str;

    fn is_supported(&self) -> bool {
        true
    }

    /// Whether a target location has been saved.
    fn is_configured(&self) -> bool;

    /// Validate `uri` against a live backend, then persist it.
    ///
    /// Failures are reported to the caller configuring the service; nothing
    /// is saved when validation fails.
    async fn save_configuration(&self, uri: &str) -> Result<(), SyncError>;

    /// Forget the saved target location.
    async fn reset_configuration(&self) -> Result<(), SyncError>;

    /// Make the configured location reachable and open a backend on it.
    async fn create_sync_server(&self) -> Result<Arc<dyn SyncServer>, SyncError>;

    /// Release whatever `create_sync_server` acquired. Best-effort.
    async fn post_sync_cleanup(&self);
}
