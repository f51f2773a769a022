//! TTL cache for query results, keyed by the plan's canonical hash.
//! Write-through and idempotent: recomputing and overwriting an expired key
//! is always safe, so no manual invalidation is needed for correctness.

use crate::config::RESULT_CACHE_TTL;
use crate::plan::QueryResult;
use dashmap::DashMap;
use std::time::{Duration, Instant};

struct CacheEntry {
    stored_at: Instant,
    result: QueryResult,
}

pub struct ResultCache {
    entries: DashMap<String, CacheEntry>,
    ttl: Duration,
}

impl ResultCache {
    pub fn new() -> Self {
        Self::with_ttl(RESULT_CACHE_TTL)
    }

    pub fn with_ttl(ttl: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            ttl,
        }
    }

    pub fn get(&self, key: &str) -> Option<QueryResult> {
        // The shard read guard from the lookup must be released before
        // remove() touches the same shard.
        let fresh = {
            let entry = self.entries.get(key)?;
            if entry.stored_at.elapsed() <= self.ttl {
                Some(entry.result.clone())
            } else {
                None
            }
        };
        if fresh.is_none() {
            self.entries.remove(key);
        }
        fresh
    }

    pub fn put(&self, key: String, result: QueryResult) {
        self.entries.insert(
            key,
            CacheEntry {
                stored_at: Instant::now(),
                result,
            },
        );
    }
}

impl Default for ResultCache {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plan::DataSourceKind;

    fn result() -> QueryResult {
        QueryResult {
            table_id: "t_test".to_string(),
            columns: vec!["n".to_string()],
            rows: vec![vec![serde_json::json!(1)]],
            row_count_returned: 1,
            row_count_before_limit: 1,
            rows_truncated: false,
            data_source: DataSourceKind::LocalCsv,
            execution_time_ms: 1.0,
            cache_hit: false,
        }
    }

    #[test]
    fn test_put_get() {
        let cache = ResultCache::new();
        cache.put("k".to_string(), result());
        assert!(cache.get("k").is_some());
        assert!(cache.get("other").is_none());
    }

    #[test]
    fn test_expired_entry_is_dropped() {
        let cache = ResultCache::with_ttl(Duration::from_millis(0));
        cache.put("k".to_string(), result());
        std::thread::sleep(Duration::from_millis(5));
        assert!(cache.get("k").is_none());
        // the expired key was removed, a second lookup misses cleanly
        assert!(cache.get("k").is_none());
    }

    #[test]
    fn test_expired_entry_can_be_rewritten() {
        let cache = ResultCache::with_ttl(Duration::from_millis(0));
        cache.put("k".to_string(), result());
        std::thread::sleep(Duration::from_millis(5));
        assert!(cache.get("k").is_none());
        cache.put("k".to_string(), result());
        std::thread::sleep(Duration::from_millis(5));
        assert!(cache.get("k").is_none());
    }

    #[test]
    fn test_overwrite_is_idempotent() {
        let cache = ResultCache::new();
        cache.put("k".to_string(), result());
        cache.put("k".to_string(), result());
        assert_eq!(cache.get("k").unwrap().row_count_returned, 1);
    }
}
