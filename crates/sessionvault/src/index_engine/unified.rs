//! Cross-collection index over sessions, notes and tasks.
//!
//! Each collection keeps its own [`IndexManager`]. On top of them the unified index
//! tracks relationships: explicit links (a note's source session, a task's note)
//! in both directions, and implicit ones through shared topic, company or contact ids.

use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::sync::{Arc, RwLock};
use tracing::{debug, warn};

use super::document::{normalize_key, EntityKind, EntityRef, IndexDoc};
use super::manager::{IndexManager, IndexName};
use super::tokenizer::tokenize;
use crate::error::Result;
use crate::persistence_queue::PersistenceQueue;
use crate::storage_backend::BlobIo;

#[derive(Debug, Clone, Default)]
struct Relations {
    links: Vec<EntityRef>,
    facets: Vec<(IndexName, String)>,
}

#[derive(Default)]
struct Graph {
    relations: HashMap<EntityRef, Relations>,
    incoming: HashMap<EntityRef, BTreeSet<EntityRef>>,
}

impl Graph {
    fn remove(&mut self, node: &EntityRef) {
        if let Some(old) = self.relations.remove(node) {
            for target in &old.links {
                if let Some(set) = self.incoming.get_mut(target) {
                    set.remove(node);
                    if set.is_empty() {
                        self.incoming.remove(target);
                    }
                }
            }
        }
    }

    fn insert(&mut self, doc: &IndexDoc) {
        let node = doc.entity_ref();
        self.remove(&node);

        let mut facets = Vec::new();
        for (name, values) in [
            (IndexName::Topics, &doc.topic_ids),
            (IndexName::Companies, &doc.company_ids),
            (IndexName::Contacts, &doc.contact_ids),
        ] {
            facets.extend(values.iter().map(|v| normalize_key(v)).filter(|k| !k.is_empty()).map(|k| (name, k)));
        }
        for target in &doc.links {
            self.incoming.entry(target.clone()).or_default().insert(node.clone());
        }
        self.relations.insert(
            node,
            Relations {
                links: doc.links.clone(),
                facets,
            },
        );
    }
}

pub struct UnifiedIndex {
    managers: BTreeMap<EntityKind, Arc<IndexManager>>,
    graph: RwLock<Graph>,
}

impl Default for UnifiedIndex {
    fn default() -> Self {
        Self::new()
    }
}

impl UnifiedIndex {
    pub fn new() -> Self {
        Self {
            managers: EntityKind::ALL
                .iter()
                .map(|k| (*k, Arc::new(IndexManager::new(*k))))
                .collect(),
            graph: RwLock::new(Graph::default()),
        }
    }

    pub fn manager(&self, kind: EntityKind) -> Arc<IndexManager> {
        match self.managers.get(&kind) {
            Some(manager) => Arc::clone(manager),
            None => Arc::new(IndexManager::new(kind)),
        }
    }

    /// Rebuild one collection from its records.
    pub fn build(&self, kind: EntityKind, docs: &[IndexDoc]) {
        self.manager(kind).build(docs);
        self.relink(kind, docs);
    }

    /// Replace the relationships of one collection, leaving its indexes alone.
    pub fn relink(&self, kind: EntityKind, docs: &[IndexDoc]) {
        let mut graph = self.graph.write().unwrap_or_else(|p| p.into_inner());
        let stale: Vec<EntityRef> = graph.relations.keys().filter(|r| r.kind == kind).cloned().collect();
        for node in &stale {
            graph.remove(node);
        }
        for doc in docs.iter().filter(|d| d.kind == kind) {
            graph.insert(doc);
        }
    }

    pub fn upsert(&self, doc: &IndexDoc) {
        self.manager(doc.kind).upsert(doc);
        self.graph.write().unwrap_or_else(|p| p.into_inner()).insert(doc);
    }

    pub fn remove(&self, kind: EntityKind, id: &str) -> bool {
        let removed = self.manager(kind).remove(id);
        self.graph
            .write()
            .unwrap_or_else(|p| p.into_inner())
            .remove(&EntityRef::new(kind, id));
        removed
    }

    pub fn counts(&self) -> BTreeMap<EntityKind, usize> {
        self.managers.iter().map(|(k, m)| (*k, m.len())).collect()
    }

    /// Records of any kind containing every token of `text`.
    pub fn search_text(&self, text: &str) -> Vec<EntityRef> {
        let tokens = tokenize(text);
        if tokens.is_empty() {
            return Vec::new();
        }
        let mut hits = Vec::new();
        for (kind, manager) in &self.managers {
            let mut matched: Option<BTreeSet<String>> = None;
            for token in &tokens {
                let bucket = manager.bucket(IndexName::Fulltext, token);
                matched = Some(match matched {
                    None => bucket,
                    Some(acc) => acc.intersection(&bucket).cloned().collect(),
                });
            }
            hits.extend(matched.unwrap_or_default().into_iter().map(|id| EntityRef::new(*kind, id)));
        }
        hits
    }

    fn neighbors(&self, node: &EntityRef) -> BTreeSet<EntityRef> {
        let graph = self.graph.read().unwrap_or_else(|p| p.into_inner());
        let mut out = BTreeSet::new();
        if let Some(relations) = graph.relations.get(node) {
            out.extend(relations.links.iter().cloned());
            for (name, key) in &relations.facets {
                for (kind, manager) in &self.managers {
                    out.extend(manager.bucket(*name, key).into_iter().map(|id| EntityRef::new(*kind, id)));
                }
            }
        }
        if let Some(incoming) = graph.incoming.get(node) {
            out.extend(incoming.iter().cloned());
        }
        drop(graph);
        out.remove(node);
        // Links may name records that were deleted since.
        out.retain(|r| self.manager(r.kind).contains(&r.id));
        out
    }

    /// Breadth-first walk from `start`, up to `max_depth` hops. Returns each reachable
    /// record with its distance, nearest first.
    pub fn related(&self, start: &EntityRef, max_depth: usize) -> Vec<(EntityRef, usize)> {
        if !self.manager(start.kind).contains(&start.id) {
            warn!("Relationship walk from unindexed {}", start);
            return Vec::new();
        }
        let mut seen: BTreeSet<EntityRef> = BTreeSet::from([start.clone()]);
        let mut queue = VecDeque::from([(start.clone(), 0usize)]);
        let mut out = Vec::new();

        while let Some((node, depth)) = queue.pop_front() {
            if depth == max_depth {
                continue;
            }
            for next in self.neighbors(&node) {
                if seen.insert(next.clone()) {
                    out.push((next.clone(), depth + 1));
                    queue.push_back((next, depth + 1));
                }
            }
        }
        debug!("{} related records within {} hops of {}", out.len(), max_depth, start);
        out
    }

    pub fn persist(&self, io: &BlobIo, queue: &PersistenceQueue) -> Result<()> {
        for manager in self.managers.values() {
            manager.persist(io, queue)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session(id: &str, topics: &[&str]) -> IndexDoc {
        IndexDoc {
            topic_ids: topics.iter().map(|t| t.to_string()).collect(),
            text: format!("session {}", id),
            ..IndexDoc::new(EntityKind::Session, id)
        }
    }

    fn note(id: &str, session: &str, text: &str) -> IndexDoc {
        IndexDoc {
            text: text.to_string(),
            links: vec![EntityRef::new(EntityKind::Session, session)],
            ..IndexDoc::new(EntityKind::Note, id)
        }
    }

    #[test]
    fn test_related_follows_links_both_ways() {
        let index = UnifiedIndex::new();
        index.build(EntityKind::Session, &[session("s1", &[]), session("s2", &[])]);
        index.upsert(&note("n1", "s1", "meeting recap"));
        index.upsert(&IndexDoc {
            links: vec![EntityRef::new(EntityKind::Note, "n1")],
            ..IndexDoc::new(EntityKind::Task, "t1")
        });

        let from_session = index.related(&EntityRef::new(EntityKind::Session, "s1"), 2);
        assert_eq!(
            from_session,
            vec![
                (EntityRef::new(EntityKind::Note, "n1"), 1),
                (EntityRef::new(EntityKind::Task, "t1"), 2),
            ]
        );
        assert!(index.related(&EntityRef::new(EntityKind::Session, "s2"), 3).is_empty());
    }

    #[test]
    fn test_shared_topics_relate_records() {
        let index = UnifiedIndex::new();
        index.build(
            EntityKind::Session,
            &[session("s1", &["topic-a"]), session("s2", &["TOPIC-A"]), session("s3", &["b"])],
        );
        let related = index.related(&EntityRef::new(EntityKind::Session, "s1"), 1);
        assert_eq!(related, vec![(EntityRef::new(EntityKind::Session, "s2"), 1)]);
    }

    #[test]
    fn test_remove_drops_links_and_memberships() {
        let index = UnifiedIndex::new();
        index.upsert(&session("s1", &[]));
        index.upsert(&note("n1", "s1", "recap of storage work"));
        assert_eq!(index.search_text("storage recap").len(), 1);

        assert!(index.remove(EntityKind::Note, "n1"));
        assert!(index.search_text("storage").is_empty());
        assert!(index.related(&EntityRef::new(EntityKind::Session, "s1"), 2).is_empty());
        assert_eq!(index.counts()[&EntityKind::Note], 0);
    }
}
