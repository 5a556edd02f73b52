use std::collections::BTreeMap;
use std::sync::RwLock;

use serde::{Deserialize, Serialize};

/// Prefix shared by all tags that are not created by the user.
pub const SYSTEM_TAG_PREFIX: &str = "system:";

/// Marker tag carried by notebook template notes.
pub const TEMPLATE_TAG: &str = "system:template";

/// Marker tag carried by pinned notes.
pub const PINNED_TAG: &str = "system:pinned";

/// A tag attached to notes.
///
/// Tags are compared by their normalized name; the display name keeps the
/// casing the tag was first created with.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tag {
    name: String,
    normalized_name: String,
}

impl Tag {
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into().trim().to_string();
        let normalized_name = Self::normalize(&name);
        Self {
            name,
            normalized_name,
        }
    }

    /// Fold case and surrounding whitespace.
    pub fn normalize(name: &str) -> String {
        name.trim().to_lowercase()
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn normalized_name(&self) -> &str {
        &self.normalized_name
    }

    pub fn is_system(&self) -> bool {
        self.normalized_name.starts_with(SYSTEM_TAG_PREFIX)
    }
}

/// Registry of every tag known to the local store.
///
/// Passed explicitly to whoever needs it; rebuilt from the notes on load
/// because tags have no storage of their own.
#[derive(Debug, Default)]
pub struct TagRegistry {
    tags: RwLock<BTreeMap<String, Tag>>,
}

impl TagRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the registered tag with this name, registering it if needed.
    pub fn get_or_create(&self, name: &str) -> Tag {
        let key = Tag::normalize(name);
        let mut tags = self.tags.write().unwrap_or_else(|e| e.into_inner());
        tags.entry(key).or_insert_with(|| Tag::new(name)).clone()
    }

    pub fn get(&self, name: &str) -> Option<Tag> {
        let tags = self.tags.read().unwrap_or_else(|e| e.into_inner());
        tags.get(&Tag::normalize(name)).cloned()
    }

    pub fn remove(&self, name: &str) -> Option<Tag> {
        let mut tags = self.tags.write().unwrap_or_else(|e| e.into_inner());
        tags.remove(&Tag::normalize(name))
    }

    pub fn all_tags(&self) -> Vec<Tag> {
        let tags = self.tags.read().unwrap_or_else(|e| e.into_inner());
        tags.values().cloned().collect()
    }

    /// Replace the registry contents with the tags found on `names`.
    pub fn rebuild<'a>(&self, names: impl IntoIterator<Item = &'a str>) {
        let mut tags = self.tags.write().unwrap_or_else(|e| e.into_inner());
        tags.clear();
        for name in names {
            tags.entry(Tag::normalize(name))
                .or_insert_with(|| Tag::new(name));
        }
    }
}
