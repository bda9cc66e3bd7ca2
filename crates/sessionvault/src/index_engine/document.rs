//! Searchable projection of a record.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::records::{Note, SessionMetadata, Task};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntityKind {
    #[default]
    Session,
    Note,
    Task,
}

impl EntityKind {
    pub const ALL: [EntityKind; 3] = [EntityKind::Session, EntityKind::Note, EntityKind::Task];

    /// Collection name used in index keys.
    pub fn collection(&self) -> &'static str {
        match self {
            EntityKind::Session => "sessions",
            EntityKind::Note => "notes",
            EntityKind::Task => "tasks",
        }
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.collection())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EntityRef {
    pub kind: EntityKind,
    pub id: String,
}

impl EntityRef {
    pub fn new(kind: EntityKind, id: impl Into<String>) -> Self {
        Self { kind, id: id.into() }
    }
}

impl fmt::Display for EntityRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.kind, self.id)
    }
}

/// Everything the indexes and the in-memory filters need from one record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexDoc {
    pub id: String,
    pub kind: EntityKind,
    pub title: String,
    pub date: Option<DateTime<Utc>>,
    pub status: Option<String>,
    pub category: Option<String>,
    pub sub_category: Option<String>,
    pub tags: Vec<String>,
    pub topic_ids: Vec<String>,
    pub company_ids: Vec<String>,
    pub contact_ids: Vec<String>,
    pub text: String,
    pub links: Vec<EntityRef>,
}

impl IndexDoc {
    pub fn new(kind: EntityKind, id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            kind,
            title: String::new(),
            date: None,
            status: None,
            category: None,
            sub_category: None,
            tags: Vec::new(),
            topic_ids: Vec::new(),
            company_ids: Vec::new(),
            contact_ids: Vec::new(),
            text: String::new(),
            links: Vec::new(),
        }
    }

    pub fn entity_ref(&self) -> EntityRef {
        EntityRef::new(self.kind, self.id.clone())
    }
}

/// Normalized form of a bucket key: trimmed and lowercased.
pub fn normalize_key(raw: &str) -> String {
    raw.trim().to_lowercase()
}

pub trait Indexable {
    const KIND: EntityKind;

    fn index_doc(&self) -> IndexDoc;
}

impl Indexable for SessionMetadata {
    const KIND: EntityKind = EntityKind::Session;

    fn index_doc(&self) -> IndexDoc {
        let info = &self.info;
        let mut text = format!("{} {}", info.name, info.description);
        for extra in info.category.iter().chain(info.sub_category.iter()).chain(info.tags.iter()) {
            text.push(' ');
            text.push_str(extra);
        }
        IndexDoc {
            title: info.name.clone(),
            date: Some(info.start_time),
            status: Some(info.status.as_str().to_string()),
            category: info.category.clone(),
            sub_category: info.sub_category.clone(),
            tags: info.tags.clone(),
            topic_ids: info.topic_ids.clone(),
            company_ids: info.company_ids.clone(),
            contact_ids: info.contact_ids.clone(),
            text,
            ..IndexDoc::new(Self::KIND, info.id.clone())
        }
    }
}

impl Indexable for Note {
    const KIND: EntityKind = EntityKind::Note;

    fn index_doc(&self) -> IndexDoc {
        IndexDoc {
            title: self.title.clone(),
            date: Some(self.created_at),
            category: self.category.clone(),
            tags: self.tags.clone(),
            topic_ids: self.topic_ids.clone(),
            company_ids: self.company_ids.clone(),
            contact_ids: self.contact_ids.clone(),
            text: format!("{} {}", self.title, self.content),
            links: self
                .source_session_id
                .iter()
                .map(|s| EntityRef::new(EntityKind::Session, s.clone()))
                .collect(),
            ..IndexDoc::new(Self::KIND, self.id.clone())
        }
    }
}

impl Indexable for Task {
    const KIND: EntityKind = EntityKind::Task;

    fn index_doc(&self) -> IndexDoc {
        let mut links = Vec::new();
        if let Some(note) = &self.note_id {
            links.push(EntityRef::new(EntityKind::Note, note.clone()));
        }
        if let Some(session) = &self.source_session_id {
            links.push(EntityRef::new(EntityKind::Session, session.clone()));
        }
        IndexDoc {
            title: self.title.clone(),
            date: Some(self.due_date.unwrap_or(self.created_at)),
            status: Some(self.status.as_str().to_string()),
            tags: self.tags.clone(),
            text: format!("{} {}", self.title, self.description),
            links,
            ..IndexDoc::new(Self::KIND, self.id.clone())
        }
    }
}
