//! Fast-read summary cache with TTL expiry.
//!
//! Best-effort by contract: a miss is always safely resolved by re-reading
//! the durable store, so cache writes never gate persistence and a failed
//! or expired entry costs only latency. Entries expire `ttl` after the
//! write (session timeout + grace, see config).

use std::collections::HashMap;

use crate::summary::SessionSummary;

/// Cache hit/miss statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub insertions: u64,
    pub expirations: u64,
}

#[derive(Debug, Clone)]
struct Entry {
    summary: SessionSummary,
    expires_at_ms: u64,
}

/// TTL-keyed summary cache over an injected millisecond clock.
#[derive(Debug, Default)]
pub struct SummaryCache {
    entries: HashMap<String, Entry>,
    stats: CacheStats,
}

impl SummaryCache {
    /// Create an empty cache.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of resident entries, including not-yet-purged expired ones.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the cache holds no entries.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Insert or replace the entry for a session.
    pub fn put(&mut self, summary: SessionSummary, ttl_ms: u64, now_ms: u64) {
        self.stats.insertions += 1;
        self.entries.insert(
            summary.session_id.clone(),
            Entry {
                summary,
                expires_at_ms: now_ms.saturating_add(ttl_ms),
            },
        );
    }

    /// Look up a session summary. Expired entries are removed lazily.
    pub fn get(&mut self, session_id: &str, now_ms: u64) -> Option<&SessionSummary> {
        let expired = match self.entries.get(session_id) {
            Some(entry) => now_ms >= entry.expires_at_ms,
            None => {
                self.stats.misses += 1;
                return None;
            }
        };
        if expired {
            self.entries.remove(session_id);
            self.stats.expirations += 1;
            self.stats.misses += 1;
            return None;
        }
        self.stats.hits += 1;
        self.entries.get(session_id).map(|e| &e.summary)
    }

    /// Remove all expired entries. Returns how many were dropped.
    pub fn purge_expired(&mut self, now_ms: u64) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, e| now_ms < e.expires_at_ms);
        let dropped = before - self.entries.len();
        self.stats.expirations += dropped as u64;
        dropped
    }

    /// Hit/miss statistics.
    #[must_use]
    pub fn stats(&self) -> CacheStats {
        self.stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::test_support::event;
    use crate::event::EventType;
    use crate::session::{FinalizeCause, SessionState};

    const T0: u64 = 1_700_000_000_000;

    fn summary(session_id: &str) -> SessionSummary {
        let start = event("e1", session_id, EventType::SessionStart, T0);
        let mut state = SessionState::new(&start, 8);
        state.apply(&start);
        state.finalize(FinalizeCause::Timeout).unwrap();
        SessionSummary::build(&state, None, T0)
    }

    #[test]
    fn put_then_get_within_ttl() {
        let mut cache = SummaryCache::new();
        cache.put(summary("s1"), 1000, T0);
        assert!(cache.get("s1", T0 + 999).is_some());
        assert_eq!(cache.stats().hits, 1);
    }

    #[test]
    fn entry_expires_after_ttl() {
        let mut cache = SummaryCache::new();
        cache.put(summary("s1"), 1000, T0);
        assert!(cache.get("s1", T0 + 1000).is_none());
        assert_eq!(cache.stats().expirations, 1);
        assert!(cache.is_empty());
    }

    #[test]
    fn missing_key_is_a_miss() {
        let mut cache = SummaryCache::new();
        assert!(cache.get("nope", T0).is_none());
        assert_eq!(cache.stats().misses, 1);
    }

    #[test]
    fn put_replaces_and_extends() {
        let mut cache = SummaryCache::new();
        cache.put(summary("s1"), 1000, T0);
        cache.put(summary("s1"), 1000, T0 + 900);
        assert!(cache.get("s1", T0 + 1500).is_some());
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn purge_drops_only_expired() {
        let mut cache = SummaryCache::new();
        cache.put(summary("s1"), 1000, T0);
        cache.put(summary("s2"), 5000, T0);
        assert_eq!(cache.purge_expired(T0 + 2000), 1);
        assert_eq!(cache.len(), 1);
        assert!(cache.get("s2", T0 + 2000).is_some());
    }
}
