//! Inverted index manager for one record collection.
//!
//! Holds the date, tag, topic, company, contact, status, category and full-text
//! indexes of a collection. Updates remove the id everywhere before re-deriving its
//! memberships, so a changed record never leaves stale buckets behind. Persistence
//! goes through the queue at low priority under `indexes/<collection>/<index>`.

use chrono::{NaiveDate, Utc};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::{debug, info, warn};

use super::document::{normalize_key, EntityKind, IndexDoc};
use super::inverted_index::{DateIndex, IndexMetadata, InvertedIndex};
use super::tokenizer::tokenize;
use crate::error::Result;
use crate::persistence_queue::{PersistenceQueue, Priority};
use crate::storage_backend::BlobIo;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IndexName {
    Date,
    Tags,
    Topics,
    Companies,
    Contacts,
    Status,
    Category,
    Fulltext,
}

impl IndexName {
    pub const KEYED: [IndexName; 7] = [
        IndexName::Tags,
        IndexName::Topics,
        IndexName::Companies,
        IndexName::Contacts,
        IndexName::Status,
        IndexName::Category,
        IndexName::Fulltext,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            IndexName::Date => "date",
            IndexName::Tags => "tags",
            IndexName::Topics => "topics",
            IndexName::Companies => "companies",
            IndexName::Contacts => "contacts",
            IndexName::Status => "status",
            IndexName::Category => "category",
            IndexName::Fulltext => "fulltext",
        }
    }
}

pub fn index_key(kind: EntityKind, name: &str) -> String {
    format!("indexes/{}/{}", kind.collection(), name)
}

/// Composite bucket key for a category/sub-category pair.
pub fn sub_category_key(category: &str, sub_category: &str) -> String {
    format!("{}::{}", normalize_key(category), normalize_key(sub_category))
}

/// Buckets one document belongs in.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Memberships {
    pub date: Option<NaiveDate>,
    pub keyed: Vec<(IndexName, String)>,
}

impl Memberships {
    pub fn derive(doc: &IndexDoc) -> Self {
        let mut keyed = Vec::new();
        let mut push_all = |name: IndexName, values: &[String]| {
            for v in values {
                let key = normalize_key(v);
                if !key.is_empty() {
                    keyed.push((name, key));
                }
            }
        };
        push_all(IndexName::Tags, &doc.tags);
        push_all(IndexName::Topics, &doc.topic_ids);
        push_all(IndexName::Companies, &doc.company_ids);
        push_all(IndexName::Contacts, &doc.contact_ids);

        if let Some(status) = doc.status.as_deref().map(normalize_key).filter(|s| !s.is_empty()) {
            keyed.push((IndexName::Status, status));
        }
        if let Some(category) = doc.category.as_deref().filter(|c| !c.trim().is_empty()) {
            keyed.push((IndexName::Category, normalize_key(category)));
            if let Some(sub) = doc.sub_category.as_deref().filter(|s| !s.trim().is_empty()) {
                keyed.push((IndexName::Category, sub_category_key(category, sub)));
            }
        }
        for token in tokenize(&doc.text) {
            keyed.push((IndexName::Fulltext, token));
        }
        keyed.sort();
        keyed.dedup();

        Self {
            date: doc.date.map(|d| d.date_naive()),
            keyed,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CollectionIndexes {
    pub members: BTreeSet<String>,
    pub date: DateIndex,
    pub tags: InvertedIndex,
    pub topics: InvertedIndex,
    pub companies: InvertedIndex,
    pub contacts: InvertedIndex,
    pub status: InvertedIndex,
    pub category: InvertedIndex,
    pub fulltext: InvertedIndex,
}

impl CollectionIndexes {
    pub fn keyed(&self, name: IndexName) -> Option<&InvertedIndex> {
        match name {
            IndexName::Date => None,
            IndexName::Tags => Some(&self.tags),
            IndexName::Topics => Some(&self.topics),
            IndexName::Companies => Some(&self.companies),
            IndexName::Contacts => Some(&self.contacts),
            IndexName::Status => Some(&self.status),
            IndexName::Category => Some(&self.category),
            IndexName::Fulltext => Some(&self.fulltext),
        }
    }

    fn keyed_mut(&mut self, name: IndexName) -> Option<&mut InvertedIndex> {
        match name {
            IndexName::Date => None,
            IndexName::Tags => Some(&mut self.tags),
            IndexName::Topics => Some(&mut self.topics),
            IndexName::Companies => Some(&mut self.companies),
            IndexName::Contacts => Some(&mut self.contacts),
            IndexName::Status => Some(&mut self.status),
            IndexName::Category => Some(&mut self.category),
            IndexName::Fulltext => Some(&mut self.fulltext),
        }
    }

    fn insert(&mut self, id: &str, memberships: &Memberships) {
        self.members.insert(id.to_string());
        if let Some(date) = memberships.date {
            self.date.insert(date, id);
        }
        for (name, key) in &memberships.keyed {
            if let Some(index) = self.keyed_mut(*name) {
                index.insert(key.clone(), id);
            }
        }
    }

    fn remove(&mut self, id: &str) -> bool {
        let known = self.members.remove(id);
        self.date.remove_id(id);
        for name in IndexName::KEYED {
            if let Some(index) = self.keyed_mut(name) {
                index.remove_id(id);
            }
        }
        known
    }

    fn refresh_metadata(&mut self) {
        let metadata = IndexMetadata {
            last_built: Utc::now(),
            entity_count: self.members.len(),
            token_count: None,
        };
        self.date.metadata = metadata.clone();
        for name in IndexName::KEYED {
            if let Some(index) = self.keyed_mut(name) {
                index.metadata = metadata.clone();
            }
        }
        self.fulltext.metadata.token_count = Some(self.fulltext.key_count());
    }
}

pub struct IndexManager {
    kind: EntityKind,
    indexes: RwLock<CollectionIndexes>,
}

impl IndexManager {
    pub fn new(kind: EntityKind) -> Self {
        Self {
            kind,
            indexes: RwLock::new(CollectionIndexes::default()),
        }
    }

    pub fn kind(&self) -> EntityKind {
        self.kind
    }

    pub fn read(&self) -> RwLockReadGuard<'_, CollectionIndexes> {
        self.indexes.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, CollectionIndexes> {
        self.indexes.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Replace every index with one built from `docs` in a single pass.
    pub fn build(&self, docs: &[IndexDoc]) {
        let derived: Vec<(&str, Memberships)> = docs
            .par_iter()
            .filter(|d| d.kind == self.kind)
            .map(|d| (d.id.as_str(), Memberships::derive(d)))
            .collect();

        let mut fresh = CollectionIndexes::default();
        for (id, memberships) in &derived {
            fresh.insert(id, memberships);
        }
        fresh.refresh_metadata();

        info!(
            "Built {} indexes: {} entities, {} tokens",
            self.kind,
            fresh.members.len(),
            fresh.fulltext.key_count()
        );
        *self.write() = fresh;
    }

    /// Remove `doc.id` from every bucket, then re-insert it under its current memberships.
    pub fn upsert(&self, doc: &IndexDoc) {
        let memberships = Memberships::derive(doc);
        let mut indexes = self.write();
        indexes.remove(&doc.id);
        indexes.insert(&doc.id, &memberships);
        indexes.refresh_metadata();
        debug!("Indexed {}/{} ({} keys)", self.kind, doc.id, memberships.keyed.len());
    }

    pub fn remove(&self, id: &str) -> bool {
        let mut indexes = self.write();
        let known = indexes.remove(id);
        indexes.refresh_metadata();
        known
    }

    pub fn len(&self) -> usize {
        self.read().members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, id: &str) -> bool {
        self.read().members.contains(id)
    }

    pub fn all_ids(&self) -> BTreeSet<String> {
        self.read().members.clone()
    }

    pub fn bucket(&self, name: IndexName, key: &str) -> BTreeSet<String> {
        self.read()
            .keyed(name)
            .and_then(|index| index.get(&normalize_key(key)).cloned())
            .unwrap_or_default()
    }

    pub fn bucket_len(&self, name: IndexName, key: &str) -> usize {
        self.read()
            .keyed(name)
            .map_or(0, |index| index.bucket_len(&normalize_key(key)))
    }

    pub fn date_range(&self, start: Option<NaiveDate>, end: Option<NaiveDate>) -> BTreeSet<String> {
        self.read().date.range(start, end)
    }

    pub fn snapshot(&self) -> CollectionIndexes {
        self.read().clone()
    }

    /// Queue every index of this collection for a low-priority write.
    pub fn persist(&self, io: &BlobIo, queue: &PersistenceQueue) -> Result<()> {
        let snapshot = self.snapshot();
        let mut ops = vec![
            io.put_bytes(index_key(self.kind, "members"), &bincode::serialize(&snapshot.members)?),
            io.put_bytes(
                index_key(self.kind, IndexName::Date.as_str()),
                &bincode::serialize(&snapshot.date)?,
            ),
        ];
        for name in IndexName::KEYED {
            if let Some(index) = snapshot.keyed(name) {
                ops.push(io.put_bytes(index_key(self.kind, name.as_str()), &bincode::serialize(index)?));
            }
        }
        queue.enqueue(Priority::Low, ops)?;
        Ok(())
    }

    /// Load persisted indexes. Returns false, leaving the manager untouched, when any
    /// index is missing or unreadable.
    pub async fn restore(&self, io: &BlobIo) -> Result<bool> {
        let mut loaded = CollectionIndexes::default();

        let Some(members) = self.load_part::<BTreeSet<String>>(io, "members").await? else {
            return Ok(false);
        };
        loaded.members = members;
        let Some(date) = self.load_part::<DateIndex>(io, IndexName::Date.as_str()).await? else {
            return Ok(false);
        };
        loaded.date = date;
        for name in IndexName::KEYED {
            let Some(index) = self.load_part::<InvertedIndex>(io, name.as_str()).await? else {
                return Ok(false);
            };
            if let Some(slot) = loaded.keyed_mut(name) {
                *slot = index;
            }
        }

        info!("Restored {} indexes ({} entities)", self.kind, loaded.members.len());
        *self.write() = loaded;
        Ok(true)
    }

    async fn load_part<T: serde::de::DeserializeOwned>(&self, io: &BlobIo, name: &str) -> Result<Option<T>> {
        let key = index_key(self.kind, name);
        let bytes = match io.read_bytes(&key).await {
            Ok(Some(bytes)) => bytes,
            Ok(None) => return Ok(None),
            Err(e) => {
                warn!("Index {} unreadable: {}", key, e);
                return Ok(None);
            }
        };
        match bincode::deserialize(&bytes) {
            Ok(value) => Ok(Some(value)),
            Err(e) => {
                warn!("Index {} failed to deserialize: {}", key, e);
                Ok(None)
            }
        }
    }
}

/// Shared handle used by the unified index and the query engine.
pub type SharedIndexManager = Arc<IndexManager>;

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn doc(id: &str, tags: &[&str], text: &str) -> IndexDoc {
        IndexDoc {
            tags: tags.iter().map(|t| t.to_string()).collect(),
            text: text.to_string(),
            status: Some("active".into()),
            category: Some("Coding".into()),
            sub_category: Some("Rust".into()),
            date: Some(Utc.with_ymd_and_hms(2024, 6, 1, 9, 0, 0).unwrap()),
            ..IndexDoc::new(EntityKind::Session, id)
        }
    }

    #[test]
    fn test_build_and_lookup() {
        let manager = IndexManager::new(EntityKind::Session);
        manager.build(&[
            doc("a", &["Work"], "storage engine design"),
            doc("b", &["work", "home"], "garden planning"),
            IndexDoc::new(EntityKind::Note, "skipped"),
        ]);

        assert_eq!(manager.len(), 2);
        assert_eq!(manager.bucket(IndexName::Tags, "WORK").len(), 2);
        assert_eq!(manager.bucket(IndexName::Fulltext, "storage").len(), 1);
        assert_eq!(manager.bucket(IndexName::Category, "coding::rust").len(), 2);
        let snapshot = manager.snapshot();
        assert_eq!(snapshot.fulltext.metadata.entity_count, 2);
        assert_eq!(snapshot.fulltext.metadata.token_count, Some(snapshot.fulltext.key_count()));
    }

    #[test]
    fn test_upsert_drops_old_memberships() {
        let manager = IndexManager::new(EntityKind::Session);
        manager.upsert(&doc("a", &["old"], "first draft"));
        manager.upsert(&doc("a", &["new"], "second version"));

        assert!(manager.bucket(IndexName::Tags, "old").is_empty());
        assert!(manager.bucket(IndexName::Fulltext, "draft").is_empty());
        assert_eq!(manager.bucket(IndexName::Tags, "new").len(), 1);
        assert_eq!(manager.len(), 1);
    }

    #[test]
    fn test_remove_leaves_no_trace() {
        let manager = IndexManager::new(EntityKind::Session);
        manager.upsert(&doc("a", &["x"], "gone soon"));
        assert!(manager.remove("a"));
        assert!(!manager.remove("a"));

        let snapshot = manager.snapshot();
        assert!(snapshot.members.is_empty());
        assert!(snapshot.date.all_ids().is_empty());
        assert!(IndexName::KEYED
            .iter()
            .all(|n| snapshot.keyed(*n).map_or(true, |i| i.key_count() == 0)));
    }
}
