//! Session Usage Cache (§3, §5): an LRU-bounded map from session id to the
//! last observed token-usage counters, written by a side-channel task that
//! tees the outer SSE stream and parses `message_delta` events purely to
//! extract usage (§5). Bounded with the `lru` crate — the same dependency
//! `goose`'s own workspace already pulls in for its caches — rather than an
//! unbounded `HashMap`, so a long-lived server can't grow this without
//! limit across many distinct sessions.

use std::num::NonZeroUsize;
use std::sync::Mutex;

use lru::LruCache;
use serde::{Deserialize, Serialize};

const DEFAULT_CAPACITY: usize = 10_000;

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct UsageSnapshot {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cache_creation_input_tokens: u64,
    pub cache_read_input_tokens: u64,
}

impl UsageSnapshot {
    pub fn from_usage_value(value: &serde_json::Value) -> Self {
        let get = |key: &str| value.get(key).and_then(|v| v.as_u64()).unwrap_or(0);
        Self {
            input_tokens: get("input_tokens"),
            output_tokens: get("output_tokens"),
            cache_creation_input_tokens: get("cache_creation_input_tokens"),
            cache_read_input_tokens: get("cache_read_input_tokens"),
        }
    }
}

/// Concurrent readers, serialized writers (§5): a single `Mutex` around the
/// `LruCache` satisfies this directly since `LruCache` itself has no
/// internal synchronization; contention here is expected to be brief since
/// writes only happen on the side-channel usage-parsing task, not the hot
/// forwarding path.
pub struct UsageCache {
    inner: Mutex<LruCache<String, UsageSnapshot>>,
}

impl UsageCache {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity.max(1)).expect("capacity must be nonzero");
        Self {
            inner: Mutex::new(LruCache::new(capacity)),
        }
    }

    /// Failures (a poisoned mutex) are dropped silently per §7 "session
    /// usage-cache failures: drop silently" rather than propagated.
    pub fn record(&self, session_id: &str, usage: UsageSnapshot) {
        match self.inner.lock() {
            Ok(mut cache) => {
                cache.put(session_id.to_string(), usage);
            }
            Err(_) => {
                tracing::warn!(session_id, "usage cache mutex poisoned, dropping write");
            }
        }
    }

    pub fn get(&self, session_id: &str) -> Option<UsageSnapshot> {
        self.inner.lock().ok().and_then(|mut c| c.get(session_id).copied())
    }

    pub fn len(&self) -> usize {
        self.inner.lock().map(|c| c.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for UsageCache {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn records_and_reads_back() {
        let cache = UsageCache::new();
        cache.record(
            "sess-1",
            UsageSnapshot {
                input_tokens: 10,
                output_tokens: 20,
                ..Default::default()
            },
        );
        let snapshot = cache.get("sess-1").unwrap();
        assert_eq!(snapshot.output_tokens, 20);
    }

    #[test]
    fn missing_session_returns_none() {
        let cache = UsageCache::new();
        assert!(cache.get("nope").is_none());
    }

    #[test]
    fn evicts_least_recently_used_beyond_capacity() {
        let cache = UsageCache::with_capacity(2);
        cache.record("a", UsageSnapshot::default());
        cache.record("b", UsageSnapshot::default());
        cache.record("c", UsageSnapshot::default());
        assert!(cache.get("a").is_none());
        assert!(cache.get("b").is_some());
        assert!(cache.get("c").is_some());
    }

    #[test]
    fn parses_usage_value_with_defaults_for_missing_fields() {
        let value = json!({"input_tokens": 5, "output_tokens": 7});
        let snapshot = UsageSnapshot::from_usage_value(&value);
        assert_eq!(snapshot.input_tokens, 5);
        assert_eq!(snapshot.output_tokens, 7);
        assert_eq!(snapshot.cache_read_input_tokens, 0);
    }
}
