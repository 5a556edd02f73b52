use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::note::Note;

/// How the two sides of a conflict diverged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictKind {
    /// Edited locally and on the server since the last sync.
    BothModified,
    /// Deleted locally, edited on the server.
    DeletedLocally,
    /// Edited locally, deleted on the server.
    DeletedRemotely,
    /// Created on both sides under the same id with different content.
    BothCreated,
}

/// Both versions of a conflicting note, as presented to a resolver.
#[derive(Debug, Clone)]
pub struct SyncConflict {
    pub note_id: String,
    pub kind: ConflictKind,
    /// `None` when the note is deleted locally.
    pub local: Option<Note>,
    /// `None` when the note is deleted on the server.
    pub remote: Option<Note>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictResolution {
    KeepLocal,
    KeepRemote,
    /// Keep the server version under the original id and the local version
    /// as a renamed copy.
    KeepBothRenamed,
}

impl std::fmt::Display for ConflictResolution {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConflictResolution::KeepLocal => write!(f, "keep-local"),
            ConflictResolution::KeepRemote => write!(f, "keep-remote"),
            ConflictResolution::KeepBothRenamed => write!(f, "keep-both"),
        }
    }
}

impl std::str::FromStr for ConflictResolution {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "keep-local" | "local" => Ok(Self::KeepLocal),
            "keep-remote" | "remote" => Ok(Self::KeepRemote),
            "keep-both" | "both" => Ok(Self::KeepBothRenamed),
            other => Err(format!("Unknown conflict resolution: {}", other)),
        }
    }
}

/// Decides conflicts on behalf of the user.
///
/// Returning `None` declines the decision and fails the session.
#[async_trait]
pub trait ConflictResolver: Send + Sync {
    async fn resolve(&self, conflict: &SyncConflict) -> Option<ConflictResolution>;
}

/// Non-interactive resolver that always makes the same choice.
#[derive(Debug, Clone, Copy)]
pub struct FixedResolver {
    choice: ConflictResolution,
}

impl FixedResolver {
    pub fn new(choice: ConflictResolution) -> Self {
        Self { choice }
    }

    /// Headless default.
    pub fn keep_remote() -> Self {
        Self::new(ConflictResolution::KeepRemote)
    }

    pub fn keep_local() -> Self {
        Self::new(ConflictResolution::KeepLocal)
    }

    pub fn keep_both() -> Self {
        Self::new(ConflictResolution::KeepBothRenamed)
    }
}

impl Default for FixedResolver {
    fn default() -> Self {
        Self::keep_remote()
    }
}

#[async_trait]
impl ConflictResolver for FixedResolver {
    async fn resolve(&self, _conflict: &SyncConflict) -> Option<ConflictResolution> {
        Some(self.choice)
    }
}

/// Resolver that never decides.
#[derive(Debug, Clone, Copy, Default)]
pub struct DecliningResolver;

#[async_trait]
impl ConflictResolver for DecliningResolver {
    async fn resolve(&self, _conflict: &SyncConflict) -> Option<ConflictResolution> {
        None
    }
}
