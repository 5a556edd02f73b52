//! XML formats persisted on the sync root.
//!
//! `manifest.xml`:
//! ```xml
//! <sync revision="3" server-id="...">
//!   <note id="..." rev="2"/>
//!   <deleted id="..."/>
//! </sync>
//! ```
//!
//! `<revision>/<id>.note`:
//! ```xml
//! <note id="..." title="..." modified="2024-01-01T00:00:00Z">
//!   <tag>system:notebook:Work</tag>
//!   <content>...</content>
//! </note>
//! ```

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;
use serde::{Deserialize, Serialize};

use crate::error::StorageError;
use crate::manifest::Manifest;
use crate::note::Note;

#[derive(Debug, Serialize, Deserialize)]
struct ManifestXml {
    #[serde(rename = "@revision")]
    revision: i64,
    #[serde(rename = "@server-id", default)]
    server_id: String,
    #[serde(rename = "note", default)]
    notes: Vec<NoteRevisionXml>,
    #[serde(rename = "deleted", default)]
    deleted: Vec<DeletedXml>,
}

#[derive(Debug, Serialize, Deserialize)]
struct NoteRevisionXml {
    #[serde(rename = "@id")]
    id: String,
    #[serde(rename = "@rev")]
    rev: i64,
}

#[derive(Debug, Serialize, Deserialize)]
struct DeletedXml {
    #[serde(rename = "@id")]
    id: String,
}

#[derive(Debug, Serialize)]
struct NoteXml {
    #[serde(rename = "@id")]
    id: String,
    #[serde(rename = "@title", default)]
    title: String,
    #[serde(rename = "@modified")]
    modified: DateTime<Utc>,
    #[serde(rename = "tag", default)]
    tags: Vec<String>,
    content: String,
}

pub fn encode_manifest(manifest: &Manifest) -> Result<String, StorageError> {
    let xml = ManifestXml {
        revision: manifest.revision,
        server_id: manifest.server_id.clone(),
        notes: manifest
            .notes
            .iter()
            .map(|(id, rev)| NoteRevisionXml {
                id: id.clone(),
                rev: *rev,
            })
            .collect(),
        deleted: manifest
            .deleted
            .iter()
            .map(|id| DeletedXml { id: id.clone() })
            .collect(),
    };
    quick_xml::se::to_string_with_root("sync", &xml)
        .map_err(|e| StorageError::Serialization(format!("Failed to serialize manifest: {}", e)))
}

pub fn decode_manifest(xml: &str) -> Result<Manifest, StorageError> {
    let parsed: ManifestXml = quick_xml::de::from_str(xml)
        .map_err(|e| StorageError::Serialization(format!("Failed to parse manifest: {}", e)))?;
    if parsed.revision < 0 {
        return Err(StorageError::Serialization(format!(
            "Manifest has negative revision {}",
            parsed.revision
        )));
    }
    Ok(Manifest {
        revision: parsed.revision,
        server_id: parsed.server_id,
        notes: parsed.notes.into_iter().map(|n| (n.id, n.rev)).collect(),
        deleted: parsed.deleted.into_iter().map(|d| d.id).collect(),
    })
}

/// Encode a note for upload. Local bookkeeping (revision, tombstone) is not
/// part of the blob.
pub fn encode_note(note: &Note) -> Result<Vec<u8>, StorageError> {
    let xml = NoteXml {
        id: note.id.clone(),
        title: note.title.clone(),
        modified: note.modified_at,
        tags: note.tags.iter().cloned().collect(),
        content: note.content.clone(),
    };
    quick_xml::se::to_string_with_root("note", &xml)
        .map(String::into_bytes)
        .map_err(|e| StorageError::Serialization(format!("Failed to serialize note {}: {}", note.id, e)))
}

/// Element whose text is being collected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum NoteField {
    Tag,
    Content,
}

/// Decode a note blob. Text is read verbatim: leading and trailing
/// whitespace of the content is part of the note.
pub fn decode_note(blob: &[u8]) -> Result<Note, StorageError> {
    let text = std::str::from_utf8(blob)
        .map_err(|e| StorageError::Serialization(format!("Note blob is not UTF-8: {}", e)))?;
    let mut reader = Reader::from_str(text);

    let mut note: Option<Note> = None;
    let mut current: Option<NoteField> = None;
    let mut buffer = String::new();

    loop {
        let event = reader.read_event().map_err(|e| {
            StorageError::Serialization(format!(
                "Failed to parse note at byte {}: {}",
                reader.buffer_position(),
                e
            ))
        })?;
        match event {
            Event::Start(e) => match e.name().as_ref() {
                b"note" => note = Some(note_header(&e)?),
                b"tag" => current = Some(NoteField::Tag),
                b"content" => current = Some(NoteField::Content),
                _ => {}
            },
            // A note without tags or content
            Event::Empty(e) if e.name().as_ref() == b"note" => note = Some(note_header(&e)?),
            Event::Text(e) if current.is_some() => {
                let unescaped = e
                    .unescape()
                    .map_err(|e| StorageError::Serialization(format!("Bad note text: {}", e)))?;
                buffer.push_str(&unescaped);
            }
            Event::CData(e) if current.is_some() => {
                buffer.push_str(&String::from_utf8_lossy(&e));
            }
            Event::End(e) => {
                let Some(target) = note.as_mut() else {
                    continue;
                };
                match (current, e.name().as_ref()) {
                    (Some(NoteField::Tag), b"tag") => {
                        let tag = std::mem::take(&mut buffer);
                        if !tag.trim().is_empty() {
                            target.tags.insert(tag);
                        }
                        current = None;
                    }
                    (Some(NoteField::Content), b"content") => {
                        target.content = std::mem::take(&mut buffer);
                        current = None;
                    }
                    _ => {}
                }
            }
            Event::Eof => break,
            _ => {}
        }
    }

    note.ok_or_else(|| StorageError::Serialization("Note blob has no <note> element".to_string()))
}

/// Note skeleton from the attributes of `<note>`.
fn note_header(start: &BytesStart<'_>) -> Result<Note, StorageError> {
    let mut id = None;
    let mut title = String::new();
    let mut modified = None;

    for attr in start.attributes() {
        let attr =
            attr.map_err(|e| StorageError::Serialization(format!("Bad note attribute: {}", e)))?;
        let value = attr
            .unescape_value()
            .map_err(|e| StorageError::Serialization(format!("Bad note attribute: {}", e)))?
            .into_owned();
        match attr.key.as_ref() {
            b"id" => id = Some(value),
            b"title" => title = value,
            b"modified" => {
                let parsed = DateTime::parse_from_rfc3339(&value).map_err(|e| {
                    StorageError::Serialization(format!("Bad modification time {}: {}", value, e))
                })?;
                modified = Some(parsed.with_timezone(&Utc));
            }
            _ => {}
        }
    }

    let id = id.ok_or_else(|| StorageError::Serialization("Note has no id".to_string()))?;
    let modified_at = modified
        .ok_or_else(|| StorageError::Serialization(format!("Note {} has no modification time", id)))?;
    Ok(Note {
        id,
        title,
        content: String::new(),
        modified_at,
        revision: 0,
        tags: BTreeSet::new(),
        deleted: false,
    })
}
