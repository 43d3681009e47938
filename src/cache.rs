use std::collections::HashMap;
use std::time::{SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;

use crate::types::CacheEntry;

pub const DEFAULT_TTL_SECS: f64 = 5.0;

fn now_secs() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs_f64()
}

#[derive(Debug, Serialize)]
pub struct CacheStats {
    pub total: usize,
    pub valid: usize,
    pub expired: usize,
}

#[derive(Debug, Serialize)]
pub struct SnapshotEntry {
    pub data: Value,
    pub age_seconds: f64,
    pub ttl: f64,
}

/// TTL-keyed in-memory store unifying REST and WS derived account state.
///
/// All operations take the single internal mutex; there is no per-key
/// locking because the working set is small and every write is already
/// serialized through one connector per account.
pub struct Cache {
    entries: Mutex<HashMap<String, CacheEntry>>,
}

impl Cache {
    pub fn new() -> Self {
        Cache {
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn get(&self, key: &str) -> Option<Value> {
        let now = now_secs();
        let mut entries = self.entries.lock();
        match entries.get(key) {
            Some(entry) if entry.is_expired(now) => {
                entries.remove(key);
                None
            }
            Some(entry) => Some(entry.data.clone()),
            None => None,
        }
    }

    pub fn set(&self, key: impl Into<String>, data: Value, ttl_seconds: Option<f64>) {
        let entry = CacheEntry {
            data,
            inserted_at: now_secs(),
            ttl_seconds: ttl_seconds.unwrap_or(DEFAULT_TTL_SECS),
        };
        self.entries.lock().insert(key.into(), entry);
    }

    /// Consistent view of every non-expired entry; opportunistically sweeps
    /// expired ones while holding the lock.
    pub fn snapshot(&self) -> HashMap<String, SnapshotEntry> {
        let now = now_secs();
        let mut entries = self.entries.lock();
        entries.retain(|_, entry| !entry.is_expired(now));
        entries
            .iter()
            .map(|(k, entry)| {
                (
                    k.clone(),
                    SnapshotEntry {
                        data: entry.data.clone(),
                        age_seconds: entry.age(now),
                        ttl: entry.ttl_seconds,
                    },
                )
            })
            .collect()
    }

    pub fn stats(&self) -> CacheStats {
        let now = now_secs();
        let entries = self.entries.lock();
        let total = entries.len();
        let expired = entries.values().filter(|e| e.is_expired(now)).count();
        CacheStats {
            total,
            valid: total - expired,
            expired,
        }
    }

    pub fn clear(&self) {
        self.entries.lock().clear();
    }
}

impl Default for Cache {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn set_then_get_returns_value() {
        let cache = Cache::new();
        cache.set("k", json!("v"), None);
        assert_eq!(cache.get("k"), Some(json!("v")));
    }

    #[test]
    fn missing_key_returns_none() {
        let cache = Cache::new();
        assert_eq!(cache.get("missing"), None);
    }

    #[test]
    fn expired_entry_is_absent_and_removed() {
        let cache = Cache::new();
        cache.entries.lock().insert(
            "k".to_string(),
            CacheEntry {
                data: json!(1),
                inserted_at: now_secs() - 10.0,
                ttl_seconds: 1.0,
            },
        );
        assert_eq!(cache.get("k"), None);
        assert_eq!(cache.stats().total, 0);
    }

    #[test]
    fn snapshot_excludes_expired_and_sweeps() {
        let cache = Cache::new();
        cache.set("fresh", json!(1), Some(60.0));
        cache.entries.lock().insert(
            "stale".to_string(),
            CacheEntry {
                data: json!(2),
                inserted_at: now_secs() - 100.0,
                ttl_seconds: 1.0,
            },
        );
        let snap = cache.snapshot();
        assert!(snap.contains_key("fresh"));
        assert!(!snap.contains_key("stale"));
        assert_eq!(cache.stats().total, 1);
    }

    #[test]
    fn stats_counts_valid_and_expired() {
        let cache = Cache::new();
        cache.set("a", json!(1), Some(60.0));
        cache.entries.lock().insert(
            "b".to_string(),
            CacheEntry {
                data: json!(2),
                inserted_at: now_secs() - 100.0,
                ttl_seconds: 1.0,
            },
        );
        let stats = cache.stats();
        assert_eq!(stats.total, 2);
        assert_eq!(stats.valid, 1);
        assert_eq!(stats.expired, 1);
    }

    #[test]
    fn clear_empties_the_cache() {
        let cache = Cache::new();
        cache.set("a", json!(1), None);
        cache.clear();
        assert_eq!(cache.stats().total, 0);
    }

    #[test]
    fn default_ttl_is_five_seconds() {
        let cache = Cache::new();
        cache.set("k", json!(1), None);
        let entries = cache.entries.lock();
        assert_eq!(entries.get("k").unwrap().ttl_seconds, DEFAULT_TTL_SECS);
    }
}
