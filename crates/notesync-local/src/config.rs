use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, Subcommand};
use notesync_core::{ConflictResolution, SyncPolicy};

use crate::preferences::Preferences;

/// Configuration for the notesync command line client.
#[derive(Parser, Debug, Clone)]
#[command(name = "notesync")]
#[command(about = "Synchronize notes through a shared folder or mounted remote volume")]
pub struct Config {
    /// Directory holding the local note store and sync baseline
    #[arg(long, env = "NOTESYNC_DATA_DIR")]
    pub data_dir: Option<PathBuf>,

    /// Preferences file holding the configured sync location
    #[arg(long, env = "NOTESYNC_PREFERENCES")]
    pub preferences: Option<PathBuf>,

    /// How remote locations get mounted
    #[arg(long, default_value = "gio", env = "NOTESYNC_VOLUME_MONITOR")]
    pub volume_monitor: VolumeMonitorKind,

    /// Seconds to wait for a mount or unmount to complete
    #[arg(long, default_value = "30", env = "NOTESYNC_MOUNT_TIMEOUT_SECS")]
    pub mount_timeout_secs: u64,

    /// Seconds a sync lock stays valid before other clients may take it over
    #[arg(long, default_value = "60", env = "NOTESYNC_LOCK_LIFETIME_SECS")]
    pub lock_lifetime_secs: u64,

    /// Attempts to acquire the sync lock before reporting the remote busy
    #[arg(long, default_value = "5", env = "NOTESYNC_LOCK_ATTEMPTS")]
    pub lock_attempts: u32,

    /// Resolution applied to every conflict: keep-remote, keep-local or keep-both
    #[arg(long, default_value = "keep-remote", env = "NOTESYNC_ON_CONFLICT")]
    pub on_conflict: ConflictResolution,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Run one synchronization session
    Sync,
    /// Validate a sync location and save it
    Configure {
        /// Local path or URI (e.g. sftp://host/notes)
        uri: String,
    },
    /// Forget the configured sync location
    Reset,
    /// Show configuration and last sync state
    Status,
    /// Manage notes
    #[command(subcommand)]
    Note(NoteCommand),
    /// Manage notebooks
    #[command(subcommand)]
    Notebook(NotebookCommand),
}

#[derive(Subcommand, Debug, Clone)]
pub enum NoteCommand {
    List,
    Show {
        id: String,
    },
    Create {
        title: String,
        #[arg(long, default_value = "")]
        content: String,
        /// Notebook to file the note into
        #[arg(long)]
        notebook: Option<String>,
    },
    Edit {
        id: String,
        content: String,
    },
    Delete {
        id: String,
    },
}

#[derive(Subcommand, Debug, Clone)]
pub enum NotebookCommand {
    List,
    Create {
        name: String,
    },
    Delete {
        name: String,
    },
    /// Move a note into a notebook, or out of any with no --notebook
    Move {
        note_id: String,
        #[arg(long)]
        notebook: Option<String>,
    },
}

impl Config {
    /// Get the effective data directory.
    pub fn effective_data_dir(&self) -> PathBuf {
        self.data_dir.clone().unwrap_or_else(|| {
            dirs::data_local_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join("notesync")
        })
    }

    pub fn notes_dir(&self) -> PathBuf {
        self.effective_data_dir().join("notes")
    }

    pub fn sync_state_path(&self) -> PathBuf {
        self.effective_data_dir().join("sync-manifest.json")
    }

    pub fn effective_preferences(&self) -> PathBuf {
        self.preferences
            .clone()
            .unwrap_or_else(Preferences::default_path)
    }

    pub fn mount_timeout(&self) -> Duration {
        Duration::from_secs(self.mount_timeout_secs)
    }

    pub fn sync_policy(&self) -> SyncPolicy {
        SyncPolicy {
            lock_lifetime: Duration::from_secs(self.lock_lifetime_secs),
            lock_attempts: self.lock_attempts,
            ..SyncPolicy::default()
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum VolumeMonitorKind {
    /// GVfs through the `gio` tool
    Gio,
    /// Local paths only
    Local,
}

impl std::fmt::Display for VolumeMonitorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            VolumeMonitorKind::Gio => write!(f, "gio"),
            VolumeMonitorKind::Local => write!(f, "local"),
        }
    }
}
