// src/cache_management/mod.rs

//! In-memory caching for decoded records and attachments

pub mod lru_cache;

pub use lru_cache::{CacheStats, FillTicket, LruCache};
