//! Read-only consistency check of a collection's indexes against its records.

use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};

use super::document::{EntityKind, IndexDoc};
use super::manager::{CollectionIndexes, IndexName, Memberships};

#[derive(Debug, Clone, Default, Serialize)]
pub struct IntegrityReport {
    pub collection: String,
    pub checked: usize,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

impl IntegrityReport {
    pub fn is_healthy(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn merge(&mut self, other: IntegrityReport) {
        self.checked += other.checked;
        self.errors.extend(other.errors);
        self.warnings.extend(other.warnings);
    }
}

/// Compare `indexes` with the authoritative `docs`. Missing memberships and orphan
/// ids are errors; metadata drift is a warning.
pub fn check_collection(kind: EntityKind, indexes: &CollectionIndexes, docs: &[IndexDoc]) -> IntegrityReport {
    let mut report = IntegrityReport {
        collection: kind.collection().to_string(),
        checked: docs.len(),
        ..IntegrityReport::default()
    };

    let mut expected: BTreeMap<(IndexName, String), BTreeSet<&str>> = BTreeMap::new();
    let mut expected_dates: BTreeMap<chrono::NaiveDate, BTreeSet<&str>> = BTreeMap::new();
    let known: BTreeSet<&str> = docs.iter().map(|d| d.id.as_str()).collect();

    for doc in docs {
        if !indexes.members.contains(&doc.id) {
            report.errors.push(format!("{} is not indexed", doc.entity_ref()));
        }
        let memberships = Memberships::derive(doc);
        if let Some(date) = memberships.date {
            expected_dates.entry(date).or_default().insert(doc.id.as_str());
            if !indexes.date.contains(date, &doc.id) {
                report
                    .errors
                    .push(format!("{} missing from date bucket {}", doc.entity_ref(), date));
            }
        }
        for (name, key) in memberships.keyed {
            let present = indexes.keyed(name).is_some_and(|i| i.contains(&key, &doc.id));
            if !present {
                report.errors.push(format!(
                    "{} missing from {} bucket '{}'",
                    doc.entity_ref(),
                    name.as_str(),
                    key
                ));
            }
            expected.entry((name, key)).or_default().insert(doc.id.as_str());
        }
    }

    for id in &indexes.members {
        if !known.contains(id.as_str()) {
            report.errors.push(format!("orphan id {}/{} in member list", kind, id));
        }
    }
    for (date, ids) in indexes.date.entries() {
        for id in ids {
            let wanted = expected_dates.get(&date).is_some_and(|s| s.contains(id.as_str()));
            if !wanted {
                report.errors.push(format!("orphan id {}/{} in date bucket {}", kind, id, date));
            }
        }
    }
    for name in IndexName::KEYED {
        let Some(index) = indexes.keyed(name) else { continue };
        for (key, ids) in index.buckets() {
            for id in ids {
                let wanted = expected
                    .get(&(name, key.clone()))
                    .is_some_and(|s| s.contains(id.as_str()));
                if !wanted {
                    report.errors.push(format!(
                        "orphan id {}/{} in {} bucket '{}'",
                        kind,
                        id,
                        name.as_str(),
                        key
                    ));
                }
            }
        }

        if index.metadata.entity_count != docs.len() {
            report.warnings.push(format!(
                "{} {} index reports {} entities, found {}",
                kind,
                name.as_str(),
                index.metadata.entity_count,
                docs.len()
            ));
        }
    }
    if let Some(tokens) = indexes.fulltext.metadata.token_count {
        if tokens != indexes.fulltext.key_count() {
            report.warnings.push(format!(
                "{} fulltext index reports {} tokens, holds {}",
                kind,
                tokens,
                indexes.fulltext.key_count()
            ));
        }
    }

    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index_engine::manager::IndexManager;

    fn doc(id: &str, tag: &str) -> IndexDoc {
        IndexDoc {
            tags: vec![tag.to_string()],
            text: format!("notes about {}", tag),
            ..IndexDoc::new(EntityKind::Note, id)
        }
    }

    #[test]
    fn test_healthy_after_build() {
        let docs = vec![doc("n1", "rust"), doc("n2", "cache")];
        let manager = IndexManager::new(EntityKind::Note);
        manager.build(&docs);

        let report = check_collection(EntityKind::Note, &manager.snapshot(), &docs);
        assert!(report.is_healthy(), "{:?}", report.errors);
        assert!(report.warnings.is_empty());
    }

    #[test]
    fn test_reports_missing_and_orphans() {
        let docs = vec![doc("n1", "rust"), doc("n2", "cache")];
        let manager = IndexManager::new(EntityKind::Note);
        manager.build(&docs);

        // n2 was deleted without touching the index; n3 was never indexed.
        let current = vec![doc("n1", "rust"), doc("n3", "queue")];
        let report = check_collection(EntityKind::Note, &manager.snapshot(), &current);

        assert!(report.errors.iter().any(|e| e.contains("notes/n3 is not indexed")));
        assert!(report.errors.iter().any(|e| e.contains("orphan id notes/n2")));
        // The check never mutates.
        assert!(manager.contains("n2"));
    }

    #[test]
    fn test_stale_metadata_is_a_warning() {
        let docs = vec![doc("n1", "rust")];
        let manager = IndexManager::new(EntityKind::Note);
        manager.build(&docs);

        let mut snapshot = manager.snapshot();
        snapshot.tags.metadata.entity_count = 7;
        let report = check_collection(EntityKind::Note, &snapshot, &docs);
        assert!(report.is_healthy());
        assert_eq!(report.warnings.len(), 1);
    }
}
