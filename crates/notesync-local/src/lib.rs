//! Filesystem backend and host integration for notesync.
//!
//! [`FileSystemSyncServer`] stores revisions in a plain directory,
//! [`MountManager`] makes remote directories reachable, and
//! [`FolderSyncAddin`] ties both to the saved preferences.

pub mod addin;
pub mod config;
pub mod lock;
pub mod mount;
pub mod preferences;
pub mod server;
pub mod store;

pub use addin::FolderSyncAddin;
pub use lock::{FileLock, LockRecord};
pub use mount::{
    GioVolumeMonitor, LocalVolumeMonitor, MountError, MountManager, MountedRoot, VolumeMonitor,
};
pub use preferences::Preferences;
pub use server::FileSystemSyncServer;
pub use store::{FileSyncClient, LocalNoteStore};
