use thiserror::Error;

/// Errors raised by sync backends and note stores.
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("I/O error: {0}")]
    Io(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Lock error: {0}")]
    Lock(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Terminal error of a synchronization session or of addin configuration.
#[derive(Error, Debug)]
pub enum SyncError {
    /// The backend is unusable: not mounted, wrong permissions, self-test failed.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// The remote volume could not be attached or detached.
    #[error("Mount error: {0}")]
    Mount(String),

    /// Another client kept the sync root locked for the whole retry budget.
    #[error("Remote busy: sync root locked by another client after {attempts} attempts")]
    LockContention { attempts: u32 },

    /// The conflict resolver declined to choose a version.
    #[error("Conflict on note {note_id} was not resolved")]
    ConflictUnresolved { note_id: String },

    /// A note blob could not be read or written.
    #[error("Transfer error: {0}")]
    Transfer(String),

    /// The manifest write failed; the backend remains on the previous revision.
    #[error("Commit error: {0}")]
    Commit(String),

    /// A session is already running against this note store.
    #[error("A synchronization session is already in progress")]
    SessionInProgress,

    #[error("Sync service is not configured")]
    NotConfigured,

    /// Stopped on request before anything was committed.
    #[error("Synchronization cancelled before commit")]
    Cancelled,

    /// The local note store failed.
    #[error("Note store error: {0}")]
    Store(#[source] StorageError),
}

impl SyncError {
    /// Short machine-readable reason, used in status output and logs.
    pub fn reason(&self) -> &'static str {
        match self {
            SyncError::Configuration(_) => "configuration",
            SyncError::Mount(_) => "mount",
            SyncError::LockContention { .. } => "remote_busy",
            SyncError::ConflictUnresolved { .. } => "conflict_unresolved",
            SyncError::Transfer(_) => "transfer",
            SyncError::Commit(_) => "commit",
            SyncError::SessionInProgress => "session_in_progress",
            SyncError::NotConfigured => "not_configured",
            SyncError::Cancelled => "cancelled",
            SyncError::Store(_) => "store",
        }
    }
}
