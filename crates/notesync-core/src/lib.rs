//! Core of the notesync engine.
//!
//! Holds the note and notebook model, the backend traits ([`SyncServer`],
//! [`SyncServiceAddin`]), the on-root XML formats and the [`SyncManager`]
//! that runs synchronization sessions. Concrete backends live in other crates.

pub mod addin;
pub mod codec;
pub mod conflict;
pub mod error;
pub mod manifest;
pub mod note;
pub mod notebook;
pub mod server;
pub mod sync;
pub mod tag;

pub use addin::SyncServiceAddin;
pub use conflict::{
    ConflictKind, ConflictResolution, ConflictResolver, DecliningResolver, FixedResolver,
    SyncConflict,
};
pub use error::{StorageError, SyncError};
pub use manifest::{ClientManifest, Manifest, MemorySyncClient, SyncClient, SyncedNote};
pub use note::{MemoryNoteStore, Note, NoteStore};
pub use notebook::{Notebook, NotebookManager, NotebookView};
pub use server::{CommitTransaction, SyncServer};
pub use sync::{classify, SyncAction, SyncManager, SyncPolicy, SyncReport, SyncState};
pub use tag::{Tag, TagRegistry};
