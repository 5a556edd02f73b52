//! Notebooks as a view over tags.
//!
//! A notebook has no storage of its own: membership is the presence of a
//! `system:notebook:<name>` tag on a note, and each notebook keeps one
//! template note carrying that tag so the notebook survives a sync even when
//! no user note is in it.

use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, RwLock};

use tracing::{debug, info};

use crate::error::StorageError;
use crate::note::{Note, NoteStore};
use crate::tag::{Tag, TagRegistry, PINNED_TAG, SYSTEM_TAG_PREFIX, TEMPLATE_TAG};

/// Prefix following [`SYSTEM_TAG_PREFIX`] on notebook tags.
pub const NOTEBOOK_TAG_PREFIX: &str = "notebook:";

/// A user notebook, identified by its tag.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notebook {
    name: String,
    normalized_name: String,
    tag: Tag,
}

impl Notebook {
    pub fn new(name: &str) -> Self {
        let name = name.trim().to_string();
        let tag = Tag::new(format!(
            "{}{}{}",
            SYSTEM_TAG_PREFIX, NOTEBOOK_TAG_PREFIX, name
        ));
        Self {
            normalized_name: Self::normalize(&name),
            name,
            tag,
        }
    }

    /// Build the notebook a tag stands for, if it is a notebook tag.
    pub fn from_tag(tag: &Tag) -> Option<Self> {
        if !is_notebook_tag(tag.name()) {
            return None;
        }
        let prefix_len = SYSTEM_TAG_PREFIX.len() + NOTEBOOK_TAG_PREFIX.len();
        let name = tag.name().get(prefix_len..)?.trim();
        if name.is_empty() {
            return None;
        }
        Some(Self::new(name))
    }

    /// Lookup key: trimmed and case-folded.
    pub fn normalize(name: &str) -> String {
        name.trim().to_lowercase()
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn normalized_name(&self) -> &str {
        &self.normalized_name
    }

    pub fn tag(&self) -> &Tag {
        &self.tag
    }

    pub fn template_title(&self) -> String {
        format!("{} Notebook Template", self.name)
    }

    pub fn is_template_note(&self, note: &Note) -> bool {
        note.has_tag(self.tag.name()) && note.has_tag(TEMPLATE_TAG)
    }

    /// Whether `note` belongs to this notebook. The template note only counts
    /// when `include_system` is set.
    pub fn contains_note(&self, note: &Note, include_system: bool) -> bool {
        if note.deleted || !note.has_tag(self.tag.name()) {
            return false;
        }
        include_system || !note.has_tag(TEMPLATE_TAG)
    }
}

pub fn is_notebook_tag(name: &str) -> bool {
    Tag::normalize(name).starts_with(&format!("{}{}", SYSTEM_TAG_PREFIX, NOTEBOOK_TAG_PREFIX))
}

/// Everything a notebook list can show.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NotebookView {
    AllNotes,
    Unfiled,
    Pinned,
    /// Notes currently open in the host application.
    Active(BTreeSet<String>),
    User(Notebook),
}

impl NotebookView {
    pub fn is_special(&self) -> bool {
        !matches!(self, NotebookView::User(_))
    }

    pub fn name(&self) -> &str {
        match self {
            NotebookView::AllNotes => "All Notes",
            NotebookView::Unfiled => "Unfiled Notes",
            NotebookView::Pinned => "Pinned Notes",
            NotebookView::Active(_) => "Active Notes",
            NotebookView::User(nb) => nb.name(),
        }
    }

    fn rank(&self) -> u8 {
        match self {
            NotebookView::AllNotes => 0,
            NotebookView::Unfiled => 1,
            NotebookView::Pinned => 2,
            NotebookView::Active(_) => 3,
            NotebookView::User(_) => 4,
        }
    }

    /// Special views first in fixed order, then user notebooks by lowercase name.
    pub fn compare(&self, other: &Self) -> Ordering {
        match (self, other) {
            (NotebookView::User(a), NotebookView::User(b)) => {
                a.name().to_lowercase().cmp(&b.name().to_lowercase())
            }
            _ => self.rank().cmp(&other.rank()),
        }
    }

    pub fn contains_note(&self, note: &Note) -> bool {
        if note.deleted {
            return false;
        }
        match self {
            NotebookView::AllNotes => !note.has_tag(TEMPLATE_TAG),
            NotebookView::Unfiled => {
                !note.has_tag(TEMPLATE_TAG) && !note.tags.iter().any(|t| is_notebook_tag(t))
            }
            NotebookView::Pinned => note.has_tag(PINNED_TAG),
            NotebookView::Active(ids) => ids.contains(&note.id),
            NotebookView::User(nb) => nb.contains_note(note, false),
        }
    }
}

/// Creates, finds and deletes notebooks through the note store.
pub struct NotebookManager {
    store: Arc<dyn NoteStore>,
    tags: Arc<TagRegistry>,
    notebooks: RwLock<BTreeMap<String, Notebook>>,
}

impl std::fmt::Debug for NotebookManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NotebookManager")
            .field("notebooks", &self.notebooks)
            .finish_non_exhaustive()
    }
}

impl NotebookManager {
    pub fn new(store: Arc<dyn NoteStore>, tags: Arc<TagRegistry>) -> Self {
        Self {
            store,
            tags,
            notebooks: RwLock::new(BTreeMap::new()),
        }
    }

    /// Rebuild the tag registry and the notebook list from the store.
    pub async fn load_notebooks(&self) -> Result<usize, StorageError> {
        let notes = self.store.list_notes().await?;
        let live: Vec<&Note> = notes.iter().filter(|n| !n.deleted).collect();
        self.tags
            .rebuild(live.iter().flat_map(|n| n.tags.iter().map(String::as_str)));

        let mut notebooks = self.notebooks.write().unwrap_or_else(|e| e.into_inner());
        notebooks.clear();
        for tag in self.tags.all_tags() {
            if !tag.is_system() {
                continue;
            }
            if let Some(nb) = Notebook::from_tag(&tag) {
                notebooks.insert(nb.normalized_name().to_string(), nb);
            }
        }
        debug!("Loaded {} notebooks", notebooks.len());
        Ok(notebooks.len())
    }

    pub fn get_notebook(&self, name: &str) -> Result<Option<Notebook>, StorageError> {
        let normalized = Notebook::normalize(name);
        if normalized.is_empty() {
            return Err(StorageError::InvalidArgument(
                "Notebook name is empty".to_string(),
            ));
        }
        let notebooks = self.notebooks.read().unwrap_or_else(|e| e.into_inner());
        Ok(notebooks.get(&normalized).cloned())
    }

    pub fn notebook_exists(&self, name: &str) -> bool {
        let notebooks = self.notebooks.read().unwrap_or_else(|e| e.into_inner());
        notebooks.contains_key(&Notebook::normalize(name))
    }

    /// User notebooks sorted by name.
    pub fn notebooks(&self) -> Vec<Notebook> {
        let notebooks = self.notebooks.read().unwrap_or_else(|e| e.into_inner());
        let mut list: Vec<Notebook> = notebooks.values().cloned().collect();
        list.sort_by_key(|nb| nb.name().to_lowercase());
        list
    }

    /// Every view to display, in display order. The active view is hidden
    /// while no note is open.
    pub fn views(&self, active: BTreeSet<String>) -> Vec<NotebookView> {
        let mut views = vec![
            NotebookView::AllNotes,
            NotebookView::Unfiled,
            NotebookView::Pinned,
        ];
        if !active.is_empty() {
            views.push(NotebookView::Active(active));
        }
        views.extend(self.notebooks().into_iter().map(NotebookView::User));
        views.sort_by(|a, b| a.compare(b));
        views
    }

    pub async fn get_or_create_notebook(&self, name: &str) -> Result<Notebook, StorageError> {
        if let Some(existing) = self.get_notebook(name)? {
            return Ok(existing);
        }

        let notebook = Notebook::new(name);
        // Reuse the registered tag if some note already carries it
        self.tags.get_or_create(notebook.tag().name());

        // The template note is what persists the tag through a sync
        self.get_template_note(&notebook).await?;

        let mut notebooks = self.notebooks.write().unwrap_or_else(|e| e.into_inner());
        let entry = notebooks
            .entry(notebook.normalized_name().to_string())
            .or_insert(notebook);
        info!("Created notebook {}", entry.name());
        Ok(entry.clone())
    }

    pub async fn find_template_note(&self, notebook: &Notebook) -> Result<Option<Note>, StorageError> {
        let notes = self.store.list_notes().await?;
        Ok(notes
            .into_iter()
            .find(|n| !n.deleted && notebook.is_template_note(n)))
    }

    /// Return the notebook's template note, creating it if missing.
    pub async fn get_template_note(&self, notebook: &Notebook) -> Result<Note, StorageError> {
        if let Some(note) = self.find_template_note(notebook).await? {
            return Ok(note);
        }
        let note = self
            .store
            .create_note(&notebook.template_title(), "")
            .await?;
        let tags: BTreeSet<String> = [notebook.tag().name().to_string(), TEMPLATE_TAG.to_string()]
            .into_iter()
            .collect();
        self.tags.get_or_create(TEMPLATE_TAG);
        let note = self.store.set_tags(&note.id, tags).await?;
        debug!("Created template note {} for {}", note.id, notebook.name());
        Ok(note)
    }

    /// Strip the notebook tag from all notes, then delete the template note.
    pub async fn delete_notebook(&self, name: &str) -> Result<bool, StorageError> {
        let Some(notebook) = self.get_notebook(name)? else {
            return Ok(false);
        };

        let template = self.find_template_note(&notebook).await?;

        {
            let mut notebooks = self.notebooks.write().unwrap_or_else(|e| e.into_inner());
            notebooks.remove(notebook.normalized_name());
        }

        for note in self.store.list_notes().await? {
            if !note.deleted && note.has_tag(notebook.tag().name()) {
                self.store.remove_tag(&note.id, notebook.tag().name()).await?;
            }
        }

        if let Some(template) = template {
            self.store.delete_note(&template.id).await?;
        }
        self.tags.remove(notebook.tag().name());

        info!("Deleted notebook {}", notebook.name());
        Ok(true)
    }

    pub fn get_notebook_from_tag(&self, tag: &str) -> Option<Notebook> {
        let nb = Notebook::from_tag(&Tag::new(tag))?;
        self.get_notebook(nb.name()).ok().flatten()
    }

    pub fn get_notebook_from_note(&self, note: &Note) -> Option<Notebook> {
        note.tags.iter().find_map(|t| self.get_notebook_from_tag(t))
    }

    /// Put a note into `notebook`, or into no notebook when `None`.
    ///
    /// Any notebook tag already on the note is removed first so a note is
    /// never in two notebooks.
    pub async fn move_note_to_notebook(
        &self,
        note_id: &str,
        notebook: Option<&str>,
    ) -> Result<Note, StorageError> {
        let target = match notebook {
            Some(name) => Some(self.get_or_create_notebook(name).await?),
            None => None,
        };
        let note = self.store.require_note(note_id).await?;

        let mut tags = note.tags.clone();
        tags.retain(|t| !is_notebook_tag(t));
        if let Some(nb) = &target {
            tags.insert(nb.tag().name().to_string());
        }

        if tags == note.tags {
            return Ok(note);
        }
        self.store.set_tags(note_id, tags).await
    }
}
