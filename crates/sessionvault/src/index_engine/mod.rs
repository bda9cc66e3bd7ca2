//! Inverted indexes, relationship traversal, and the query engine

pub mod document;
pub mod integrity;
pub mod inverted_index;
pub mod manager;
pub mod query;
pub mod tokenizer;
pub mod unified;

pub use document::{EntityKind, EntityRef, IndexDoc, Indexable};
pub use integrity::{check_collection, IntegrityReport};
pub use inverted_index::{DateIndex, IndexMetadata, InvertedIndex};
pub use manager::{CollectionIndexes, IndexManager, IndexName};
pub use query::{
    DateRange, PlanStrategy, Query, QueryEngine, QueryOperator, QueryPlan, QueryResult, RecordSource,
    SessionQueryFilters, SortOrder,
};
pub use tokenizer::tokenize;
pub use unified::UnifiedIndex;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Result;
    use async_trait::async_trait;
    use chrono::{TimeZone, Utc};
    use std::collections::{BTreeSet, HashMap};
    use std::sync::Arc;

    struct Docs(HashMap<String, IndexDoc>);

    #[async_trait]
    impl RecordSource for Docs {
        async fn load_docs(&self, _kind: EntityKind, ids: &[String]) -> Result<Vec<IndexDoc>> {
            Ok(ids.iter().filter_map(|id| self.0.get(id).cloned()).collect())
        }
    }

    fn session(id: &str, day: u32, status: &str, tags: &[&str], text: &str) -> IndexDoc {
        IndexDoc {
            title: format!("Session {}", id),
            date: Some(Utc.with_ymd_and_hms(2024, 3, day, 10, 0, 0).unwrap()),
            status: Some(status.to_string()),
            category: Some("coding".to_string()),
            tags: tags.iter().map(|t| t.to_string()).collect(),
            text: text.to_string(),
            ..IndexDoc::new(EntityKind::Session, id)
        }
    }

    fn fixture() -> (QueryEngine, Docs) {
        let docs = vec![
            session("s1", 1, "completed", &["rust", "work"], "storage engine refactor"),
            session("s2", 2, "active", &["rust"], "query planner tuning"),
            session("s3", 3, "completed", &["home"], "garden planner"),
            session("s4", 4, "paused", &["work"], "storage budget review"),
        ];
        let index = Arc::new(UnifiedIndex::new());
        index.build(EntityKind::Session, &docs);
        let source = Docs(docs.into_iter().map(|d| (d.id.clone(), d)).collect());
        (QueryEngine::new(index), source)
    }

    fn ids(result: &QueryResult) -> BTreeSet<String> {
        result.ids.iter().cloned().collect()
    }

    #[test]
    fn test_planner_priority() {
        let (engine, _) = fixture();
        let mut query = Query {
            status: Some("completed".into()),
            tags: vec!["rust".into()],
            text: Some("storage".into()),
            ..Query::default()
        };
        assert_eq!(engine.plan(&query).strategy, PlanStrategy::StatusIndex);

        query.date_range = Some(DateRange {
            start: Some(Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap()),
            end: None,
        });
        let plan = engine.plan(&query);
        assert_eq!(plan.strategy, PlanStrategy::DateIndex);
        assert_eq!(plan.estimated_cost, 4);
        assert!(plan.justification.contains("date index"));

        let topic_only = Query {
            topic_ids: vec!["t1".into()],
            ..Query::default()
        };
        assert_eq!(engine.plan(&topic_only).strategy, PlanStrategy::FullScan);
    }

    #[tokio::test]
    async fn test_and_is_intersection_or_is_union() {
        let (engine, source) = fixture();
        let and = Query {
            tags: vec!["work".into()],
            text: Some("storage".into()),
            ..Query::default()
        };
        let result = engine.execute(&and, &source).await.unwrap();
        assert_eq!(ids(&result), ["s1", "s4"].iter().map(|s| s.to_string()).collect());

        let narrowed = Query {
            status: Some("completed".into()),
            ..and.clone()
        };
        let result = engine.execute(&narrowed, &source).await.unwrap();
        assert_eq!(result.ids, vec!["s1"]);

        let or = Query {
            status: Some("active".into()),
            tags: vec!["home".into()],
            operator: QueryOperator::Or,
            ..Query::default()
        };
        let result = engine.execute(&or, &source).await.unwrap();
        assert_eq!(result.plan.strategy, PlanStrategy::IndexUnion);
        assert_eq!(ids(&result), ["s2", "s3"].iter().map(|s| s.to_string()).collect());
    }

    #[tokio::test]
    async fn test_multi_token_text_defaults_to_and() {
        let (engine, source) = fixture();
        let query = Query {
            text: Some("planner garden".into()),
            ..Query::default()
        };
        let result = engine.execute(&query, &source).await.unwrap();
        assert_eq!(result.ids, vec!["s3"]);

        let any = Query {
            operator: QueryOperator::Or,
            ..query
        };
        let result = engine.execute(&any, &source).await.unwrap();
        assert_eq!(result.total, 2);
    }

    #[tokio::test]
    async fn test_sort_and_pagination() {
        let (engine, source) = fixture();
        let query = Query {
            sort: SortOrder::DateDesc,
            offset: 1,
            limit: Some(2),
            ..Query::default()
        };
        let result = engine.execute(&query, &source).await.unwrap();
        assert_eq!(result.plan.strategy, PlanStrategy::FullScan);
        assert_eq!(result.total, 4);
        assert_eq!(result.ids, vec!["s3", "s2"]);

        let ascending = Query {
            sort: SortOrder::DateAsc,
            ..Query::default()
        };
        let result = engine.execute(&ascending, &source).await.unwrap();
        assert_eq!(result.ids, vec!["s1", "s2", "s3", "s4"]);
    }

    #[tokio::test]
    async fn test_date_range_is_exact_within_day() {
        let (engine, source) = fixture();
        let query = Query {
            date_range: Some(DateRange {
                start: Some(Utc.with_ymd_and_hms(2024, 3, 2, 11, 0, 0).unwrap()),
                end: Some(Utc.with_ymd_and_hms(2024, 3, 4, 9, 0, 0).unwrap()),
            }),
            ..Query::default()
        };
        let result = engine.execute(&query, &source).await.unwrap();
        // s2 starts before 11:00 on the 2nd and s4 after 09:00 on the 4th.
        assert_eq!(result.ids, vec!["s3"]);
        assert_eq!(result.candidates_examined, 3);
    }

    #[tokio::test]
    async fn test_session_filters_map_to_query() {
        let (engine, source) = fixture();
        let filters: SessionQueryFilters = serde_json::from_value(serde_json::json!({
            "activity": ["Coding"],
            "keywords": ["storage"],
            "startDate": "2024-03-02",
            "endDate": "2024-03-04",
            "limit": 5
        }))
        .unwrap();
        let query = filters.into_query().unwrap();
        let result = engine.execute(&query, &source).await.unwrap();
        assert_eq!(result.ids, vec!["s4"]);

        let bad = SessionQueryFilters {
            start_date: Some("yesterday".into()),
            ..SessionQueryFilters::default()
        };
        assert!(matches!(
            bad.into_query(),
            Err(crate::error::StorageError::InvalidQuery(_))
        ));
    }
}
