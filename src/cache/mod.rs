//! Result Cache
//!
//! Bounded LRU memo of `intent signature -> executed result`. Every entry is
//! stamped with the catalog version it was built against; publishing a new
//! catalog bumps the cache's version and drops everything, and an entry
//! stamped with any other version is never returned or stored.

pub mod inflight;
pub mod snapshot;

pub use inflight::{Flight, FlightGuard, InFlight};
pub use snapshot::CacheSnapshot;

use crate::db::QueryRows;
use chrono::{DateTime, Utc};
use lru::LruCache;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

/// One cached execution. Entries are complete or absent, never partial.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    /// Question that first produced the entry.
    #[serde(default)]
    pub question: String,
    pub sql: String,
    pub rows: QueryRows,
    pub created_at: DateTime<Utc>,
    pub catalog_version: u64,
}

impl CacheEntry {
    pub fn new(sql: String, rows: QueryRows, catalog_version: u64) -> Self {
        Self {
            question: String::new(),
            sql,
            rows,
            created_at: Utc::now(),
            catalog_version,
        }
    }

    pub fn with_question(mut self, question: impl Into<String>) -> Self {
        self.question = question.into();
        self
    }

    fn expires_at(&self, ttl: Option<Duration>) -> Option<DateTime<Utc>> {
        let ttl = chrono::Duration::from_std(ttl?).ok()?;
        self.created_at.checked_add_signed(ttl)
    }

    fn is_expired(&self, ttl: Option<Duration>, now: DateTime<Utc>) -> bool {
        match ttl {
            None => false,
            Some(ttl) => now
                .signed_duration_since(self.created_at)
                .to_std()
                .map_or(false, |age| age >= ttl),
        }
    }
}

/// History line for one cached result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecentQuery {
    pub question: String,
    pub signature: String,
    pub sql: String,
    pub row_count: usize,
    pub created_at: DateTime<Utc>,
    /// `None` when entries never expire.
    pub expires_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CacheStats {
    pub lookups: u64,
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub invalidations: u64,
    pub expired: u64,
    pub size: usize,
    pub capacity: usize,
    pub catalog_version: u64,
    pub hit_rate: f64,
}

#[derive(Debug, Default)]
struct Counters {
    lookups: u64,
    hits: u64,
    misses: u64,
    evictions: u64,
    invalidations: u64,
    expired: u64,
}

struct Inner {
    entries: LruCache<String, Arc<CacheEntry>>,
    catalog_version: u64,
    counters: Counters,
}

pub struct ResultCache {
    inner: Mutex<Inner>,
    ttl: Option<Duration>,
    inflight: InFlight,
}

impl ResultCache {
    pub fn new(capacity: usize, ttl: Option<Duration>) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            inner: Mutex::new(Inner {
                entries: LruCache::new(capacity),
                catalog_version: 0,
                counters: Counters::default(),
            }),
            ttl,
            inflight: InFlight::default(),
        }
    }

    pub fn inflight(&self) -> &InFlight {
        &self.inflight
    }

    pub fn catalog_version(&self) -> u64 {
        self.inner.lock().catalog_version
    }

    /// Fresh entry for `signature`, promoting it to most recently used.
    /// Expired entries and entries from another catalog version are dropped.
    pub fn get(&self, signature: &str) -> Option<Arc<CacheEntry>> {
        self.lookup(signature, true)
    }

    /// Like [`ResultCache::get`] but leaves the hit/miss counters alone.
    /// Used to re-check the cache after winning an in-flight race.
    pub fn peek(&self, signature: &str) -> Option<Arc<CacheEntry>> {
        self.lookup(signature, false)
    }

    fn lookup(&self, signature: &str, record: bool) -> Option<Arc<CacheEntry>> {
        let now = Utc::now();
        let mut inner = self.inner.lock();
        if record {
            inner.counters.lookups += 1;
        }

        let version = inner.catalog_version;
        let found = inner.entries.get(signature).map(|entry| {
            let expired = entry.is_expired(self.ttl, now);
            let usable = entry.catalog_version == version && !expired;
            (usable, expired, Arc::clone(entry))
        });

        let entry = match found {
            Some((true, _, entry)) => Some(entry),
            Some((false, expired, _)) => {
                inner.entries.pop(signature);
                if expired {
                    inner.counters.expired += 1;
                }
                debug!("Dropped stale cache entry {}", signature);
                None
            }
            None => None,
        };
        if record {
            if entry.is_some() {
                inner.counters.hits += 1;
            } else {
                inner.counters.misses += 1;
            }
        }
        entry
    }

    /// Store an entry. Returns `false` when the entry was built against a
    /// catalog version other than the current one.
    pub fn put(&self, signature: String, entry: CacheEntry) -> bool {
        let mut inner = self.inner.lock();
        if entry.catalog_version != inner.catalog_version {
            debug!(
                "Refusing cache entry built against catalog v{} (current v{})",
                entry.catalog_version, inner.catalog_version
            );
            return false;
        }
        if let Some((evicted, _)) = inner.entries.push(signature.clone(), Arc::new(entry)) {
            if evicted != signature {
                inner.counters.evictions += 1;
            }
        }
        true
    }

    pub fn invalidate(&self, signature: &str) -> bool {
        let mut inner = self.inner.lock();
        let removed = inner.entries.pop(signature).is_some();
        if removed {
            inner.counters.invalidations += 1;
        }
        removed
    }

    /// Drop every entry and adopt `catalog_version` as the current version.
    /// Called synchronously whenever a catalog is published.
    pub fn invalidate_all(&self, catalog_version: u64) -> usize {
        let mut inner = self.inner.lock();
        let dropped = inner.entries.len();
        inner.entries.clear();
        inner.catalog_version = catalog_version;
        inner.counters.invalidations += dropped as u64;
        info!(
            "🧹 Cache invalidated: {} entries dropped, now at catalog v{}",
            dropped, catalog_version
        );
        dropped
    }

    pub fn stats(&self) -> CacheStats {
        let inner = self.inner.lock();
        let c = &inner.counters;
        CacheStats {
            lookups: c.lookups,
            hits: c.hits,
            misses: c.misses,
            evictions: c.evictions,
            invalidations: c.invalidations,
            expired: c.expired,
            size: inner.entries.len(),
            capacity: inner.entries.cap().get(),
            catalog_version: inner.catalog_version,
            hit_rate: if c.lookups == 0 {
                0.0
            } else {
                c.hits as f64 / c.lookups as f64
            },
        }
    }

    /// Drop every expired entry. Returns how many were dropped.
    pub fn purge_expired(&self) -> usize {
        let Some(ttl) = self.ttl else {
            return 0;
        };
        let now = Utc::now();
        let mut inner = self.inner.lock();
        let stale: Vec<String> = inner
            .entries
            .iter()
            .filter(|(_, entry)| entry.is_expired(Some(ttl), now))
            .map(|(signature, _)| signature.clone())
            .collect();
        for signature in &stale {
            inner.entries.pop(signature);
        }
        inner.counters.expired += stale.len() as u64;
        if !stale.is_empty() {
            debug!("Purged {} expired cache entries", stale.len());
        }
        stale.len()
    }

    /// Newest cached results first, at most `limit` of them. Expired entries
    /// are not listed.
    pub fn recent(&self, limit: usize) -> Vec<RecentQuery> {
        let now = Utc::now();
        let inner = self.inner.lock();
        let mut recent: Vec<RecentQuery> = inner
            .entries
            .iter()
            .filter(|(_, entry)| !entry.is_expired(self.ttl, now))
            .map(|(signature, entry)| RecentQuery {
                question: entry.question.clone(),
                signature: signature.clone(),
                sql: entry.sql.clone(),
                row_count: entry.rows.len(),
                created_at: entry.created_at,
                expires_at: entry.expires_at(self.ttl),
            })
            .collect();
        recent.sort_by(|a, b| b.created_at.cmp(&a.created_at).then_with(|| a.signature.cmp(&b.signature)));
        recent.truncate(limit);
        recent
    }

    /// Entries from least to most recently used.
    fn entries_lru_first(&self) -> (u64, Vec<(String, CacheEntry)>) {
        let inner = self.inner.lock();
        let entries = inner
            .entries
            .iter()
            .rev()
            .map(|(k, v)| (k.clone(), v.as_ref().clone()))
            .collect();
        (inner.catalog_version, entries)
    }
}
