//! Key → id-set indexes.

use chrono::{DateTime, Datelike, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexMetadata {
    pub last_built: DateTime<Utc>,
    pub entity_count: usize,
    pub token_count: Option<usize>,
}

impl Default for IndexMetadata {
    fn default() -> Self {
        Self {
            last_built: Utc::now(),
            entity_count: 0,
            token_count: None,
        }
    }
}

/// Buckets never hold an empty id set; removing the last id drops the bucket.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvertedIndex {
    buckets: BTreeMap<String, BTreeSet<String>>,
    pub metadata: IndexMetadata,
}

impl InvertedIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, key: impl Into<String>, id: &str) {
        self.buckets.entry(key.into()).or_default().insert(id.to_string());
    }

    /// Remove `id` from every bucket. Returns the number of buckets touched.
    pub fn remove_id(&mut self, id: &str) -> usize {
        let mut touched = 0;
        self.buckets.retain(|_, ids| {
            if ids.remove(id) {
                touched += 1;
            }
            !ids.is_empty()
        });
        touched
    }

    pub fn get(&self, key: &str) -> Option<&BTreeSet<String>> {
        self.buckets.get(key)
    }

    pub fn bucket_len(&self, key: &str) -> usize {
        self.buckets.get(key).map_or(0, BTreeSet::len)
    }

    pub fn contains(&self, key: &str, id: &str) -> bool {
        self.buckets.get(key).is_some_and(|ids| ids.contains(id))
    }

    pub fn buckets(&self) -> impl Iterator<Item = (&String, &BTreeSet<String>)> {
        self.buckets.iter()
    }

    pub fn key_count(&self) -> usize {
        self.buckets.len()
    }

    pub fn all_ids(&self) -> BTreeSet<String> {
        self.buckets.values().flatten().cloned().collect()
    }

    pub fn clear(&mut self) {
        self.buckets.clear();
    }
}

type Days = BTreeMap<u32, BTreeSet<String>>;
type Months = BTreeMap<u32, Days>;

/// year → month → day → ids. Every level that exists is non-empty.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DateIndex {
    years: BTreeMap<i32, Months>,
    pub metadata: IndexMetadata,
}

impl DateIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, date: NaiveDate, id: &str) {
        self.years
            .entry(date.year())
            .or_default()
            .entry(date.month())
            .or_default()
            .entry(date.day())
            .or_default()
            .insert(id.to_string());
    }

    pub fn remove_id(&mut self, id: &str) -> usize {
        let mut touched = 0;
        self.years.retain(|_, months| {
            months.retain(|_, days| {
                days.retain(|_, ids| {
                    if ids.remove(id) {
                        touched += 1;
                    }
                    !ids.is_empty()
                });
                !days.is_empty()
            });
            !months.is_empty()
        });
        touched
    }

    pub fn on(&self, date: NaiveDate) -> Option<&BTreeSet<String>> {
        self.years.get(&date.year())?.get(&date.month())?.get(&date.day())
    }

    pub fn contains(&self, date: NaiveDate, id: &str) -> bool {
        self.on(date).is_some_and(|ids| ids.contains(id))
    }

    /// Ids filed on any day in `[start, end]`, both bounds optional and inclusive.
    pub fn range(&self, start: Option<NaiveDate>, end: Option<NaiveDate>) -> BTreeSet<String> {
        self.entries()
            .filter(|(date, _)| start.map_or(true, |s| *date >= s) && end.map_or(true, |e| *date <= e))
            .flat_map(|(_, ids)| ids.iter().cloned())
            .collect()
    }

    /// Every (day, ids) pair in calendar order.
    pub fn entries(&self) -> impl Iterator<Item = (NaiveDate, &BTreeSet<String>)> {
        self.years.iter().flat_map(|(year, months)| {
            months.iter().flat_map(move |(month, days)| {
                days.iter().filter_map(move |(day, ids)| {
                    NaiveDate::from_ymd_opt(*year, *month, *day).map(|d| (d, ids))
                })
            })
        })
    }

    pub fn all_ids(&self) -> BTreeSet<String> {
        self.entries().flat_map(|(_, ids)| ids.iter().cloned()).collect()
    }

    pub fn clear(&mut self) {
        self.years.clear();
    }
}
