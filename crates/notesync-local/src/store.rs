use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::Utc;
use notesync_core::{ClientManifest, Note, NoteStore, StorageError, SyncClient};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::fs;
use tokio::sync::Mutex;
use tracing::{debug, instrument, warn};

/// Serialize `value` as pretty JSON and write it atomically via a temp file.
pub(crate) async fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<(), StorageError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).await.map_err(|e| {
            StorageError::Io(format!("Failed to create {}: {}", parent.display(), e))
        })?;
    }

    let content = serde_json::to_vec_pretty(value)
        .map_err(|e| StorageError::Serialization(format!("Failed to serialize {}: {}", path.display(), e)))?;

    let temp_path = path.with_extension("json.tmp");
    fs::write(&temp_path, &content).await.map_err(|e| {
        StorageError::Io(format!("Failed to write temp file {}: {}", temp_path.display(), e))
    })?;
    fs::rename(&temp_path, path).await.map_err(|e| {
        StorageError::Io(format!("Failed to rename temp file to {}: {}", path.display(), e))
    })?;
    Ok(())
}

/// Read and parse a JSON file; `None` if it does not exist.
pub(crate) async fn read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>, StorageError> {
    let content = match fs::read(path).await {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => {
            return Err(StorageError::Io(format!(
                "Failed to read {}: {}",
                path.display(),
                e
            )))
        }
    };
    serde_json::from_slice(&content)
        .map(Some)
        .map_err(|e| StorageError::Serialization(format!("Failed to parse {}: {}", path.display(), e)))
}

/// Note store keeping one JSON file per note under `{dir}/<id>.json`.
///
/// All notes are cached in memory; the cache lock is held across the file
/// write so writes to the same note cannot reorder.
#[derive(Debug)]
pub struct LocalNoteStore {
    dir: PathBuf,
    notes: Mutex<BTreeMap<String, Note>>,
}

impl LocalNoteStore {
    /// Open the store in `dir`, creating it if needed.
    pub async fn open(dir: impl AsRef<Path>) -> Result<Self, StorageError> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir).await.map_err(|e| {
            StorageError::Io(format!("Failed to create note dir {}: {}", dir.display(), e))
        })?;

        let mut notes = BTreeMap::new();
        let mut entries = fs::read_dir(&dir)
            .await
            .map_err(|e| StorageError::Io(format!("Failed to list {}: {}", dir.display(), e)))?;
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| StorageError::Io(format!("Failed to list {}: {}", dir.display(), e)))?
        {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            match read_json::<Note>(&path).await {
                Ok(Some(note)) => {
                    notes.insert(note.id.clone(), note);
                }
                Ok(None) => {}
                Err(e) => warn!("Skipping unreadable note file {}: {}", path.display(), e),
            }
        }

        debug!("Loaded {} notes from {}", notes.len(), dir.display());
        Ok(Self {
            dir,
            notes: Mutex::new(notes),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn note_path(&self, id: &str) -> PathBuf {
        self.dir.join(format!("{}.json", id))
    }

    async fn mutate<F>(&self, id: &str, f: F) -> Result<Note, StorageError>
    where
        F: FnOnce(&mut Note) + Send,
    {
        let mut notes = self.notes.lock().await;
        let mut note = notes
            .get(id)
            .filter(|n| !n.deleted)
            .cloned()
            .ok_or_else(|| StorageError::NotFound(format!("Note {}", id)))?;
        f(&mut note);
        note.revision += 1;
        note.modified_at = Utc::now();

        write_json_atomic(&self.note_path(id), &note).await?;
        notes.insert(id.to_string(), note.clone());
        Ok(note)
    }
}

#[async_trait]
impl NoteStore for LocalNoteStore {
    async fn list_notes(&self) -> Result<Vec<Note>, StorageError> {
        Ok(self.notes.lock().await.values().cloned().collect())
    }

    async fn get_note(&self, id: &str) -> Result<Option<Note>, StorageError> {
        Ok(self.notes.lock().await.get(id).cloned())
    }

    #[instrument(skip(self, content), level = "debug")]
    async fn create_note(&self, title: &str, content: &str) -> Result<Note, StorageError> {
        let note = Note::new(title, content);
        let mut notes = self.notes.lock().await;
        write_json_atomic(&self.note_path(&note.id), &note).await?;
        notes.insert(note.id.clone(), note.clone());
        debug!("Created note {}", note.id);
        Ok(note)
    }

    #[instrument(skip(self, content), level = "debug")]
    async fn update_content(&self, id: &str, content: &str) -> Result<Note, StorageError> {
        let content = content.to_string();
        self.mutate(id, move |n| n.content = content).await
    }

    #[instrument(skip(self), level = "debug")]
    async fn set_tags(&self, id: &str, tags: BTreeSet<String>) -> Result<Note, StorageError> {
        self.mutate(id, move |n| n.tags = tags).await
    }

    #[instrument(skip(self), level = "debug")]
    async fn delete_note(&self, id: &str) -> Result<bool, StorageError> {
        let mut notes = self.notes.lock().await;
        let Some(mut note) = notes.get(id).filter(|n| !n.deleted).cloned() else {
            return Ok(false);
        };
        note.deleted = true;
        note.revision += 1;
        write_json_atomic(&self.note_path(id), &note).await?;
        notes.insert(id.to_string(), note);
        Ok(true)
    }

    #[instrument(skip(self), level = "debug")]
    async fn purge_note(&self, id: &str) -> Result<(), StorageError> {
        let mut notes = self.notes.lock().await;
        match fs::remove_file(self.note_path(id)).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(StorageError::Io(format!("Failed to remove note {}: {}", id, e))),
        }
        notes.remove(id);
        Ok(())
    }

    #[instrument(skip(self, note), level = "debug", fields(id = %note.id))]
    async fn apply_remote(&self, mut note: Note) -> Result<Note, StorageError> {
        let mut notes = self.notes.lock().await;
        note.revision = notes.get(&note.id).map(|n| n.revision + 1).unwrap_or(1);
        note.deleted = false;
        write_json_atomic(&self.note_path(&note.id), &note).await?;
        notes.insert(note.id.clone(), note.clone());
        Ok(note)
    }
}

/// Sync baseline persisted as a JSON file.
#[derive(Debug, Clone)]
pub struct FileSyncClient {
    path: PathBuf,
}

impl FileSyncClient {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }
}

#[async_trait]
impl SyncClient for FileSyncClient {
    async fn load(&self) -> Result<ClientManifest, StorageError> {
        Ok(read_json(&self.path).await?.unwrap_or_default())
    }

    async fn save(&self, manifest: &ClientManifest) -> Result<(), StorageError> {
        write_json_atomic(&self.path, manifest).await
    }
}
