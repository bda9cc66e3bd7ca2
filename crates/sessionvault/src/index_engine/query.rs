//! Index-first query execution.
//!
//! A query is a set of filters joined by one operator. Under `And` the planner picks
//! a single driving index by fixed priority (date, status, tag, full-text), loads
//! only those candidates and checks every other filter in memory. Under `Or` the
//! candidate set is the union of every filter's index lookup. With nothing to drive
//! from, the engine scans the whole collection and says so.

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, NaiveTime, Utc};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

use super::document::{normalize_key, EntityKind, IndexDoc};
use super::manager::{sub_category_key, IndexManager, IndexName};
use super::tokenizer::tokenize;
use super::unified::UnifiedIndex;
use crate::error::{Result, StorageError};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum QueryOperator {
    #[default]
    And,
    Or,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SortOrder {
    #[default]
    DateDesc,
    DateAsc,
    TitleAsc,
}

/// Inclusive on both ends; an absent bound is open.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DateRange {
    pub start: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
}

impl DateRange {
    pub fn contains(&self, at: DateTime<Utc>) -> bool {
        self.start.map_or(true, |s| at >= s) && self.end.map_or(true, |e| at <= e)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Query {
    pub collection: EntityKind,
    pub text: Option<String>,
    pub topic_ids: Vec<String>,
    pub tags: Vec<String>,
    pub date_range: Option<DateRange>,
    pub status: Option<String>,
    /// Matches when the record's category (or `category::sub_category`) is any of these.
    pub categories: Vec<String>,
    pub operator: QueryOperator,
    pub sort: SortOrder,
    pub offset: usize,
    pub limit: Option<usize>,
}

impl Query {
    pub fn new(collection: EntityKind) -> Self {
        Self {
            collection,
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanStrategy {
    DateIndex,
    StatusIndex,
    TagIndex,
    FulltextIndex,
    IndexUnion,
    FullScan,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QueryPlan {
    pub strategy: PlanStrategy,
    /// Records the plan expects to load.
    pub estimated_cost: usize,
    pub justification: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct QueryResult {
    pub ids: Vec<String>,
    pub docs: Vec<IndexDoc>,
    /// Matches before offset/limit.
    pub total: usize,
    pub candidates_examined: usize,
    pub elapsed_ms: u64,
    pub plan: QueryPlan,
}

/// Loads the authoritative records behind index candidates.
#[async_trait]
pub trait RecordSource: Send + Sync {
    async fn load_docs(&self, kind: EntityKind, ids: &[String]) -> Result<Vec<IndexDoc>>;
}

#[derive(Debug, Clone)]
enum Filter {
    Date(DateRange),
    Status(String),
    Tags(Vec<String>),
    Text(Vec<String>),
    Topics(Vec<String>),
    Categories(Vec<String>),
}

impl Filter {
    fn from_query(query: &Query) -> Vec<Filter> {
        let mut filters = Vec::new();
        if let Some(range) = query.date_range {
            filters.push(Filter::Date(range));
        }
        if let Some(status) = query.status.as_deref().map(normalize_key).filter(|s| !s.is_empty()) {
            filters.push(Filter::Status(status));
        }
        let tags = normalized(&query.tags);
        if !tags.is_empty() {
            filters.push(Filter::Tags(tags));
        }
        if let Some(text) = &query.text {
            let tokens = tokenize(text);
            if !tokens.is_empty() {
                filters.push(Filter::Text(tokens));
            }
        }
        let topics = normalized(&query.topic_ids);
        if !topics.is_empty() {
            filters.push(Filter::Topics(topics));
        }
        let categories = normalized(&query.categories);
        if !categories.is_empty() {
            filters.push(Filter::Categories(categories));
        }
        filters
    }

    /// Position in the driving-index priority, if this filter can drive an `And` plan.
    fn drive_rank(&self) -> Option<(u8, PlanStrategy, &'static str)> {
        match self {
            Filter::Date(_) => Some((0, PlanStrategy::DateIndex, "date")),
            Filter::Status(_) => Some((1, PlanStrategy::StatusIndex, "status")),
            Filter::Tags(_) => Some((2, PlanStrategy::TagIndex, "tag")),
            Filter::Text(_) => Some((3, PlanStrategy::FulltextIndex, "full-text")),
            Filter::Topics(_) | Filter::Categories(_) => None,
        }
    }

    fn lookup(&self, manager: &IndexManager, op: QueryOperator) -> BTreeSet<String> {
        let combine = |name: IndexName, keys: &[String]| combine_buckets(manager, name, keys, op);
        match self {
            Filter::Date(range) => manager.date_range(
                range.start.map(|d| d.date_naive()),
                range.end.map(|d| d.date_naive()),
            ),
            Filter::Status(status) => manager.bucket(IndexName::Status, status),
            Filter::Tags(tags) => combine(IndexName::Tags, tags),
            Filter::Text(tokens) => combine(IndexName::Fulltext, tokens),
            Filter::Topics(topics) => combine(IndexName::Topics, topics),
            Filter::Categories(categories) => combine_buckets(manager, IndexName::Category, categories, QueryOperator::Or),
        }
    }

    fn matches(&self, doc: &IndexDoc, op: QueryOperator) -> bool {
        match self {
            Filter::Date(range) => doc.date.is_some_and(|d| range.contains(d)),
            Filter::Status(status) => doc.status.as_deref().map(normalize_key).as_deref() == Some(status.as_str()),
            Filter::Tags(tags) => set_matches(&normalized(&doc.tags).into_iter().collect(), tags, op),
            Filter::Text(tokens) => {
                let doc_tokens: BTreeSet<String> = tokenize(&doc.text).into_iter().collect();
                set_matches(&doc_tokens, tokens, op)
            }
            Filter::Topics(topics) => set_matches(&normalized(&doc.topic_ids).into_iter().collect(), topics, op),
            Filter::Categories(categories) => {
                let Some(category) = doc.category.as_deref() else {
                    return false;
                };
                let own = normalize_key(category);
                let composite = doc.sub_category.as_deref().map(|sub| sub_category_key(category, sub));
                categories
                    .iter()
                    .any(|c| *c == own || composite.as_deref() == Some(c.as_str()))
            }
        }
    }
}

fn normalized(values: &[String]) -> Vec<String> {
    let set: BTreeSet<String> = values
        .iter()
        .map(|v| normalize_key(v))
        .filter(|v| !v.is_empty())
        .collect();
    set.into_iter().collect()
}

fn set_matches(have: &BTreeSet<String>, wanted: &[String], op: QueryOperator) -> bool {
    match op {
        QueryOperator::And => wanted.iter().all(|w| have.contains(w)),
        QueryOperator::Or => wanted.iter().any(|w| have.contains(w)),
    }
}

fn combine_buckets(manager: &IndexManager, name: IndexName, keys: &[String], op: QueryOperator) -> BTreeSet<String> {
    let mut acc: Option<BTreeSet<String>> = None;
    for key in keys {
        let bucket = manager.bucket(name, key);
        acc = Some(match (acc, op) {
            (None, _) => bucket,
            (Some(a), QueryOperator::And) => a.intersection(&bucket).cloned().collect(),
            (Some(mut a), QueryOperator::Or) => {
                a.extend(bucket);
                a
            }
        });
    }
    acc.unwrap_or_default()
}

pub struct QueryEngine {
    index: Arc<UnifiedIndex>,
}

impl QueryEngine {
    pub fn new(index: Arc<UnifiedIndex>) -> Self {
        Self { index }
    }

    pub fn plan(&self, query: &Query) -> QueryPlan {
        let manager = self.index.manager(query.collection);
        self.plan_candidates(query, &manager, &Filter::from_query(query)).0
    }

    fn plan_candidates(
        &self,
        query: &Query,
        manager: &IndexManager,
        filters: &[Filter],
    ) -> (QueryPlan, BTreeSet<String>) {
        let collection = query.collection.collection();
        let total = manager.len();

        match query.operator {
            QueryOperator::And => {
                let driver = filters
                    .iter()
                    .filter_map(|f| f.drive_rank().map(|rank| (rank, f)))
                    .min_by_key(|((priority, _, _), _)| *priority);
                if let Some(((_, strategy, label), filter)) = driver {
                    let candidates = filter.lookup(manager, query.operator);
                    let plan = QueryPlan {
                        strategy,
                        estimated_cost: candidates.len(),
                        justification: format!(
                            "{} index narrows {} {} to {} candidates; {} other filter(s) checked in memory",
                            label,
                            total,
                            collection,
                            candidates.len(),
                            filters.len() - 1
                        ),
                    };
                    return (plan, candidates);
                }
            }
            QueryOperator::Or if !filters.is_empty() => {
                let mut candidates = BTreeSet::new();
                for filter in filters {
                    candidates.extend(filter.lookup(manager, query.operator));
                }
                let plan = QueryPlan {
                    strategy: PlanStrategy::IndexUnion,
                    estimated_cost: candidates.len(),
                    justification: format!(
                        "union of {} index lookups gives {} of {} {}",
                        filters.len(),
                        candidates.len(),
                        total,
                        collection
                    ),
                };
                return (plan, candidates);
            }
            QueryOperator::Or => {}
        }

        let plan = QueryPlan {
            strategy: PlanStrategy::FullScan,
            estimated_cost: total,
            justification: format!("no date, status, tag or text filter; scanning all {} {}", total, collection),
        };
        (plan, manager.all_ids())
    }

    pub async fn execute(&self, query: &Query, source: &dyn RecordSource) -> Result<QueryResult> {
        let started = Instant::now();
        if let Some(range) = query.date_range {
            if let (Some(start), Some(end)) = (range.start, range.end) {
                if start > end {
                    return Err(StorageError::InvalidQuery(format!(
                        "date range starts {} after it ends {}",
                        start, end
                    )));
                }
            }
        }

        let manager = self.index.manager(query.collection);
        let filters = Filter::from_query(query);
        let (plan, candidates) = self.plan_candidates(query, &manager, &filters);
        if plan.strategy == PlanStrategy::FullScan {
            warn!("Query falls back to full scan: {}", plan.justification);
        } else {
            debug!("Query plan {:?}: {}", plan.strategy, plan.justification);
        }

        let candidate_ids: Vec<String> = candidates.into_iter().collect();
        let loaded = source.load_docs(query.collection, &candidate_ids).await?;
        let candidates_examined = loaded.len();
        if candidates_examined < candidate_ids.len() {
            warn!(
                "{} indexed {} could not be loaded",
                candidate_ids.len() - candidates_examined,
                query.collection
            );
        }

        let mut matched: Vec<IndexDoc> = loaded
            .into_iter()
            .filter(|doc| match query.operator {
                _ if filters.is_empty() => true,
                QueryOperator::And => filters.iter().all(|f| f.matches(doc, query.operator)),
                QueryOperator::Or => filters.iter().any(|f| f.matches(doc, query.operator)),
            })
            .collect();
        sort_docs(&mut matched, query.sort);

        let total = matched.len();
        let page: Vec<IndexDoc> = matched
            .into_iter()
            .skip(query.offset)
            .take(query.limit.unwrap_or(usize::MAX))
            .collect();

        let elapsed_ms = started.elapsed().as_millis() as u64;
        info!(
            "Query on {} matched {} (returned {}) in {} ms via {:?}",
            query.collection,
            total,
            page.len(),
            elapsed_ms,
            plan.strategy
        );
        Ok(QueryResult {
            ids: page.iter().map(|d| d.id.clone()).collect(),
            docs: page,
            total,
            candidates_examined,
            elapsed_ms,
            plan,
        })
    }
}

fn sort_docs(docs: &mut [IndexDoc], order: SortOrder) {
    let by_date = |a: &IndexDoc, b: &IndexDoc| match (a.date, b.date) {
        (Some(x), Some(y)) => x.cmp(&y),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    };
    match order {
        SortOrder::DateAsc => docs.sort_by(|a, b| by_date(a, b).then_with(|| a.id.cmp(&b.id))),
        SortOrder::DateDesc => docs.sort_by(|a, b| match (a.date, b.date) {
            (Some(x), Some(y)) => y.cmp(&x).then_with(|| a.id.cmp(&b.id)),
            _ => by_date(a, b).then_with(|| a.id.cmp(&b.id)),
        }),
        SortOrder::TitleAsc => docs.sort_by(|a, b| {
            a.title
                .to_lowercase()
                .cmp(&b.title.to_lowercase())
                .then_with(|| a.id.cmp(&b.id))
        }),
    }
}

/// Filters accepted from external tools querying sessions.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SessionQueryFilters {
    /// Activity types, matched against the session category.
    pub activity: Option<Vec<String>>,
    pub keywords: Option<Vec<String>>,
    /// RFC 3339 timestamp or `YYYY-MM-DD`.
    pub start_date: Option<String>,
    pub end_date: Option<String>,
    pub limit: Option<usize>,
    pub status: Option<String>,
}

impl SessionQueryFilters {
    /// Translate into a session [`Query`]. An empty filter set lists the most recent
    /// sessions.
    pub fn into_query(self) -> Result<Query> {
        let start = self.start_date.as_deref().map(|s| parse_date(s, false)).transpose()?;
        let end = self.end_date.as_deref().map(|s| parse_date(s, true)).transpose()?;
        let date_range = (start.is_some() || end.is_some()).then_some(DateRange { start, end });

        Ok(Query {
            collection: EntityKind::Session,
            text: self.keywords.map(|k| k.join(" ")).filter(|t| !t.trim().is_empty()),
            date_range,
            status: self.status,
            categories: self.activity.unwrap_or_default(),
            sort: SortOrder::DateDesc,
            limit: Some(self.limit.unwrap_or(20)),
            ..Query::default()
        })
    }
}

fn parse_date(raw: &str, end_of_day: bool) -> Result<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw.trim()) {
        return Ok(dt.with_timezone(&Utc));
    }
    let day = NaiveDate::parse_from_str(raw.trim(), "%Y-%m-%d")
        .map_err(|e| StorageError::InvalidQuery(format!("invalid date '{}': {}", raw, e)))?;
    let time = if end_of_day {
        NaiveTime::from_hms_milli_opt(23, 59, 59, 999)
    } else {
        NaiveTime::from_hms_opt(0, 0, 0)
    }
    .ok_or_else(|| StorageError::InvalidQuery(format!("invalid time of day for '{}'", raw)))?;
    Ok(day.and_time(time).and_utc())
}
