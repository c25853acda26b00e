// ABOUTME: Time- and capacity-bounded idempotency cache for side-effecting RPCs.
// ABOUTME: Stores terminal outcomes keyed by "<method>:<idempotencyKey>" so retries replay safely.

use chrono::{DateTime, Duration, Utc};
use serde_json::Value;
use std::collections::HashMap;

use crate::protocol::ErrorShape;

/// Default retention before an entry is eligible for eviction. Generous on
/// purpose: clients retry over flaky links on the order of minutes.
pub const DEFAULT_TTL_SECS: i64 = 300;

/// Default capacity bound. Oldest entries go first when exceeded.
pub const DEFAULT_CAPACITY: usize = 1024;

/// A cached terminal outcome. Never mutated after insertion: a given
/// idempotency key yields the same outcome on every replay.
#[derive(Debug, Clone)]
pub struct CachedOutcome {
    pub at: DateTime<Utc>,
    pub ok: bool,
    pub payload: Option<Value>,
    pub error: Option<ErrorShape>,
}

impl CachedOutcome {
    pub fn success(payload: Value) -> Self {
        Self {
            at: Utc::now(),
            ok: true,
            payload: Some(payload),
            error: None,
        }
    }

    pub fn failure(error: ErrorShape) -> Self {
        Self {
            at: Utc::now(),
            ok: false,
            payload: None,
            error: Some(error),
        }
    }
}

/// Idempotency cache for retried requests. Only terminal outcomes live here;
/// in-flight runs are tracked by the run registry.
pub struct DedupeCache {
    entries: HashMap<String, CachedOutcome>,
    ttl: Duration,
    capacity: usize,
}

impl DedupeCache {
    pub fn new() -> Self {
        Self::with_bounds(Duration::seconds(DEFAULT_TTL_SECS), DEFAULT_CAPACITY)
    }

    pub fn with_bounds(ttl: Duration, capacity: usize) -> Self {
        Self {
            entries: HashMap::new(),
            ttl,
            capacity,
        }
    }

    fn full_key(method: &str, key: &str) -> String {
        format!("{}:{}", method, key)
    }

    /// O(1) lookup of a previously recorded outcome.
    pub fn get(&self, method: &str, key: &str) -> Option<&CachedOutcome> {
        self.entries.get(&Self::full_key(method, key))
    }

    /// Record a terminal outcome. First write wins: replays must observe the
    /// originally cached result even if a racing duplicate settles later.
    pub fn record(&mut self, method: &str, key: &str, outcome: CachedOutcome) {
        let full = Self::full_key(method, key);
        if self.entries.contains_key(&full) {
            return;
        }
        if self.entries.len() >= self.capacity {
            self.evict_oldest();
        }
        self.entries.insert(full, outcome);
    }

    /// Drop entries older than the TTL. Called by the maintenance sweep.
    pub fn evict_expired(&mut self, now: DateTime<Utc>) -> usize {
        let cutoff = now - self.ttl;
        let before = self.entries.len();
        self.entries.retain(|_, e| e.at >= cutoff);
        before - self.entries.len()
    }

    fn evict_oldest(&mut self) {
        if let Some(oldest) = self
            .entries
            .iter()
            .min_by_key(|(_, e)| e.at)
            .map(|(k, _)| k.clone())
        {
            self.entries.remove(&oldest);
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Default for DedupeCache {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::ErrorCode;
    use serde_json::json;

    #[test]
    fn test_get_miss() {
        let cache = DedupeCache::new();
        assert!(cache.get("chat.send", "k1").is_none());
    }

    #[test]
    fn test_record_and_replay() {
        let mut cache = DedupeCache::new();
        cache.record("chat.send", "k1", CachedOutcome::success(json!({"runId": "k1"})));

        let hit = cache.get("chat.send", "k1").unwrap();
        assert!(hit.ok);
        assert_eq!(hit.payload.as_ref().unwrap()["runId"], "k1");
    }

    #[test]
    fn test_method_scopes_key() {
        let mut cache = DedupeCache::new();
        cache.record("chat.send", "k1", CachedOutcome::success(json!({})));
        assert!(cache.get("send", "k1").is_none());
    }

    #[test]
    fn test_first_write_wins() {
        let mut cache = DedupeCache::new();
        cache.record("chat.send", "k1", CachedOutcome::success(json!({"v": 1})));
        cache.record("chat.send", "k1", CachedOutcome::success(json!({"v": 2})));

        let hit = cache.get("chat.send", "k1").unwrap();
        assert_eq!(hit.payload.as_ref().unwrap()["v"], 1);
    }

    #[test]
    fn test_failure_outcomes_are_cached_too() {
        let mut cache = DedupeCache::new();
        cache.record(
            "send",
            "k2",
            CachedOutcome::failure(ErrorShape {
                code: ErrorCode::Unavailable,
                message: "provider down".to_string(),
            }),
        );
        let hit = cache.get("send", "k2").unwrap();
        assert!(!hit.ok);
        assert_eq!(hit.error.as_ref().unwrap().code, ErrorCode::Unavailable);
    }

    #[test]
    fn test_ttl_eviction() {
        let mut cache = DedupeCache::with_bounds(Duration::seconds(60), 16);
        let mut old = CachedOutcome::success(json!({}));
        old.at = Utc::now() - Duration::seconds(120);
        cache.record("chat.send", "stale", old);
        cache.record("chat.send", "fresh", CachedOutcome::success(json!({})));

        let evicted = cache.evict_expired(Utc::now());
        assert_eq!(evicted, 1);
        assert!(cache.get("chat.send", "stale").is_none());
        assert!(cache.get("chat.send", "fresh").is_some());
    }

    #[test]
    fn test_capacity_evicts_oldest() {
        let mut cache = DedupeCache::with_bounds(Duration::seconds(300), 2);
        let mut first = CachedOutcome::success(json!({}));
        first.at = Utc::now() - Duration::seconds(30);
        let mut second = CachedOutcome::success(json!({}));
        second.at = Utc::now() - Duration::seconds(10);
        cache.record("chat.send", "a", first);
        cache.record("chat.send", "b", second);
        cache.record("chat.send", "c", CachedOutcome::success(json!({})));

        assert_eq!(cache.len(), 2);
        assert!(cache.get("chat.send", "a").is_none());
        assert!(cache.get("chat.send", "b").is_some());
        assert!(cache.get("chat.send", "c").is_some());
    }
}
