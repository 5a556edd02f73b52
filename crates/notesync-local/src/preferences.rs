use std::path::{Path, PathBuf};
use std::sync::RwLock;

use notesync_core::StorageError;
use serde::{Deserialize, Serialize};

use crate::store::{read_json, write_json_atomic};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
struct PreferencesFile {
    /// Location of the shared sync folder, as typed by the user.
    #[serde(default)]
    sync_uri: String,
}

/// Host preferences relevant to sync, persisted as JSON.
#[derive(Debug)]
pub struct Preferences {
    path: PathBuf,
    values: RwLock<PreferencesFile>,
}

impl Preferences {
    /// Default location: `<config dir>/notesync/preferences.json`.
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("notesync")
            .join("preferences.json")
    }

    pub async fn load(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let path = path.as_ref().to_path_buf();
        let values = read_json(&path).await?.unwrap_or_default();
        Ok(Self {
            path,
            values: RwLock::new(values),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn sync_uri(&self) -> String {
        self.values
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .sync_uri
            .clone()
    }

    pub async fn set_sync_uri(&self, uri: &str) -> Result<(), StorageError> {
        let updated = PreferencesFile {
            sync_uri: uri.trim().to_string(),
        };
        write_json_atomic(&self.path, &updated).await?;
        *self.values.write().unwrap_or_else(|e| e.into_inner()) = updated;
        Ok(())
    }
}
