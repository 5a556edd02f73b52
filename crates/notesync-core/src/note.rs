use std::collections::{BTreeMap, BTreeSet};
use std::sync::RwLock;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::StorageError;
use crate::tag::Tag;

/// URI scheme prefix for note identities.
pub const NOTE_URI_PREFIX: &str = "note://notesync/";

/// A note as held by the local note store.
///
/// The sync engine treats `content` as opaque; only `revision` and `deleted`
/// drive replication decisions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Note {
    pub id: String,
    pub title: String,
    pub content: String,
    pub modified_at: DateTime<Utc>,
    /// Local revision counter, bumped on every local mutation.
    pub revision: u64,
    #[serde(default)]
    pub tags: BTreeSet<String>,
    /// Tombstone: the note was deleted locally and the deletion is not synced yet.
    #[serde(default)]
    pub deleted: bool,
}

impl Note {
    /// Create a fresh note with a new id.
    pub fn new(title: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            title: title.into(),
            content: content.into(),
            modified_at: Utc::now(),
            revision: 1,
            tags: BTreeSet::new(),
            deleted: false,
        }
    }

    pub fn uri(&self) -> String {
        format!("{}{}", NOTE_URI_PREFIX, self.id)
    }

    /// Extract the note id from a note URI.
    pub fn id_from_uri(uri: &str) -> Option<&str> {
        uri.strip_prefix(NOTE_URI_PREFIX).filter(|id| !id.is_empty())
    }

    pub fn has_tag(&self, name: &str) -> bool {
        let wanted = Tag::normalize(name);
        self.tags.iter().any(|t| Tag::normalize(t) == wanted)
    }

    /// Add a tag unless an equivalent one is already present.
    pub fn add_tag(&mut self, name: &str) -> bool {
        if self.has_tag(name) {
            return false;
        }
        self.tags.insert(name.trim().to_string())
    }

    pub fn remove_tag(&mut self, name: &str) -> bool {
        let wanted = Tag::normalize(name);
        let before = self.tags.len();
        self.tags.retain(|t| Tag::normalize(t) != wanted);
        before != self.tags.len()
    }

    /// SHA-256 over title and content, used to recognise identical versions.
    pub fn content_digest(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.title.as_bytes());
        hasher.update([0u8]);
        hasher.update(self.content.as_bytes());
        hex::encode(hasher.finalize())
    }
}

/// Local note store consumed by the sync engine and the notebook manager.
///
/// Every mutating call bumps the note's local revision and returns the note
/// as stored.
#[async_trait]
pub trait NoteStore: Send + Sync {
    /// All notes, including tombstones of locally deleted notes.
    async fn list_notes(&self) -> Result<Vec<Note>, StorageError>;

    async fn get_note(&self, id: &str) -> Result<Option<Note>, StorageError>;

    async fn find_by_uri(&self, uri: &str) -> Result<Option<Note>, StorageError> {
        match Note::id_from_uri(uri) {
            Some(id) => self.get_note(id).await,
            None => Ok(None),
        }
    }

    async fn create_note(&self, title: &str, content: &str) -> Result<Note, StorageError>;

    async fn update_content(&self, id: &str, content: &str) -> Result<Note, StorageError>;

    async fn set_tags(&self, id: &str, tags: BTreeSet<String>) -> Result<Note, StorageError>;

    async fn add_tag(&self, id: &str, tag: &str) -> Result<Note, StorageError> {
        let mut note = self.require_note(id).await?;
        if !note.add_tag(tag) {
            return Ok(note);
        }
        self.set_tags(id, note.tags).await
    }

    async fn remove_tag(&self, id: &str, tag: &str) -> Result<Note, StorageError> {
        let mut note = self.require_note(id).await?;
        if !note.remove_tag(tag) {
            return Ok(note);
        }
        self.set_tags(id, note.tags).await
    }

    /// Mark a note deleted. The tombstone stays until a sync propagates it.
    async fn delete_note(&self, id: &str) -> Result<bool, StorageError>;

    /// Drop a note (or its tombstone) for good.
    async fn purge_note(&self, id: &str) -> Result<(), StorageError>;

    /// Write a version received from the sync root, replacing any local one.
    async fn apply_remote(&self, note: Note) -> Result<Note, StorageError>;

    async fn require_note(&self, id: &str) -> Result<Note, StorageError> {
        self.get_note(id)
            .await?
            .filter(|n| !n.deleted)
            .ok_or_else(|| StorageError::NotFound(format!("Note {}", id)))
    }
}

/// In-memory note store for headless use and tests.
#[derive(Debug, Default)]
pub struct MemoryNoteStore {
    notes: RwLock<BTreeMap<String, Note>>,
}

impl MemoryNoteStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn mutate<F>(&self, id: &str, f: F) -> Result<Note, StorageError>
    where
        F: FnOnce(&mut Note),
    {
        let mut notes = self.notes.write().unwrap_or_else(|e| e.into_inner());
        let note = notes
            .get_mut(id)
            .filter(|n| !n.deleted)
            .ok_or_else(|| StorageError::NotFound(format!("Note {}", id)))?;
        f(note);
        note.revision += 1;
        note.modified_at = Utc::now();
        Ok(note.clone())
    }
}

#[async_trait]
impl NoteStore for MemoryNoteStore {
    async fn list_notes(&self) -> Result<Vec<Note>, StorageError> {
        let notes = self.notes.read().unwrap_or_else(|e| e.into_inner());
        Ok(notes.values().cloned().collect())
    }

    async fn get_note(&self, id: &str) -> Result<Option<Note>, StorageError> {
        let notes = self.notes.read().unwrap_or_else(|e| e.into_inner());
        Ok(notes.get(id).cloned())
    }

    async fn create_note(&self, title: &str, content: &str) -> Result<Note, StorageError> {
        let note = Note::new(title, content);
        let mut notes = self.notes.write().unwrap_or_else(|e| e.into_inner());
        notes.insert(note.id.clone(), note.clone());
        Ok(note)
    }

    async fn update_content(&self, id: &str, content: &str) -> Result<Note, StorageError> {
        self.mutate(id, |n| n.content = content.to_string())
    }

    async fn set_tags(&self, id: &str, tags: BTreeSet<String>) -> Result<Note, StorageError> {
        self.mutate(id, |n| n.tags = tags)
    }

    async fn delete_note(&self, id: &str) -> Result<bool, StorageError> {
        let mut notes = self.notes.write().unwrap_or_else(|e| e.into_inner());
        match notes.get_mut(id) {
            Some(note) if !note.deleted => {
                note.deleted = true;
                note.revision += 1;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn purge_note(&self, id: &str) -> Result<(), StorageError> {
        let mut notes = self.notes.write().unwrap_or_else(|e| e.into_inner());
        notes.remove(id);
        Ok(())
    }

    async fn apply_remote(&self, mut note: Note) -> Result<Note, StorageError> {
        let mut notes = self.notes.write().unwrap_or_else(|e| e.into_inner());
        note.revision = notes.get(&note.id).map(|n| n.revision + 1).unwrap_or(1);
        note.deleted = false;
        notes.insert(note.id.clone(), note.clone());
        Ok(note)
    }
}
