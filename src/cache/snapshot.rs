//! Cache snapshots for warm restarts
//!
//! A snapshot records the fingerprint of the catalog its entries were built
//! against. Restoring into an engine whose live catalog has a different
//! fingerprint discards the snapshot wholesale.

use super::{CacheEntry, ResultCache};
use crate::error::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::{info, warn};

const SNAPSHOT_FORMAT: u32 = 1;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotEntry {
    pub signature: String,
    pub entry: CacheEntry,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheSnapshot {
    pub format: u32,
    pub catalog_fingerprint: String,
    pub catalog_version: u64,
    pub saved_at: DateTime<Utc>,
    /// Least recently used first.
    pub entries: Vec<SnapshotEntry>,
}

impl CacheSnapshot {
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path.as_ref(), json)?;
        Ok(())
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path.as_ref())?;
        Ok(serde_json::from_str(&raw)?)
    }
}

impl ResultCache {
    pub fn export_snapshot(&self, catalog_fingerprint: &str) -> CacheSnapshot {
        let (catalog_version, entries) = self.entries_lru_first();
        CacheSnapshot {
            format: SNAPSHOT_FORMAT,
            catalog_fingerprint: catalog_fingerprint.to_string(),
            catalog_version,
            saved_at: Utc::now(),
            entries: entries
                .into_iter()
                .map(|(signature, entry)| SnapshotEntry { signature, entry })
                .collect(),
        }
    }

    /// Load entries from a snapshot taken against a catalog with the same
    /// fingerprint. Entries are re-stamped with the current catalog version.
    /// Returns how many entries were restored.
    pub fn restore_snapshot(&self, snapshot: CacheSnapshot, catalog_fingerprint: &str) -> usize {
        if snapshot.format != SNAPSHOT_FORMAT {
            warn!(
                "Ignoring cache snapshot with unknown format {}",
                snapshot.format
            );
            return 0;
        }
        if snapshot.catalog_fingerprint != catalog_fingerprint {
            warn!(
                "Ignoring cache snapshot built against a different schema ({} != {})",
                snapshot.catalog_fingerprint, catalog_fingerprint
            );
            return 0;
        }

        let version = self.catalog_version();
        let now = Utc::now();
        let mut restored = 0;
        for SnapshotEntry { signature, mut entry } in snapshot.entries {
            if entry.is_expired(self.ttl, now) {
                continue;
            }
            entry.catalog_version = version;
            if self.put(signature, entry) {
                restored += 1;
            }
        }
        info!("♻️  Restored {} cache entries from snapshot", restored);
        restored
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::QueryRows;

    fn warm_cache() -> ResultCache {
        let cache = ResultCache::new(8, None);
        cache.invalidate_all(3);
        cache.put("a".into(), CacheEntry::new("SELECT a".into(), QueryRows::default(), 3));
        cache.put("b".into(), CacheEntry::new("SELECT b".into(), QueryRows::default(), 3));
        cache
    }

    #[test]
    fn test_restore_with_matching_fingerprint() {
        let snapshot = warm_cache().export_snapshot("abc");
        assert_eq!(snapshot.entries.len(), 2);
        assert_eq!(snapshot.entries[0].signature, "a");

        let fresh = ResultCache::new(8, None);
        fresh.invalidate_all(1);
        assert_eq!(fresh.restore_snapshot(snapshot, "abc"), 2);
        let entry = fresh.get("b").unwrap();
        assert_eq!(entry.sql, "SELECT b");
        assert_eq!(entry.catalog_version, 1);
    }

    #[test]
    fn test_fingerprint_mismatch_discards_snapshot() {
        let snapshot = warm_cache().export_snapshot("abc");
        let fresh = ResultCache::new(8, None);
        fresh.invalidate_all(1);
        assert_eq!(fresh.restore_snapshot(snapshot, "def"), 0);
        assert!(fresh.get("a").is_none());
    }

    #[test]
    fn test_save_and_load_file() {
        let path = std::env::temp_dir().join(format!("nlq-cache-{}.json", std::process::id()));
        let snapshot = warm_cache().export_snapshot("abc");
        snapshot.save(&path).unwrap();
        let loaded = CacheSnapshot::load(&path).unwrap();
        assert_eq!(loaded, snapshot);
        std::fs::remove_file(&path).ok();
    }
}
