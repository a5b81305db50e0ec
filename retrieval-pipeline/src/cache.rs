use std::{
    collections::HashMap,
    sync::Mutex,
    time::{Duration, Instant},
};

use md5::{Digest, Md5};
use tracing::{debug, info};

const DEFAULT_TTL: Duration = Duration::from_secs(3600);
const DEFAULT_CAPACITY: usize = 1000;

#[derive(Debug, Clone)]
struct CachedResponse {
    response: String,
    cached_at: Instant,
    ttl: Duration,
}

impl CachedResponse {
    fn is_expired(&self) -> bool {
        self.cached_at.elapsed() > self.ttl
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CacheStats {
    pub size: usize,
    pub hits: u64,
    pub misses: u64,
}

struct CacheInner {
    entries: HashMap<String, CachedResponse>,
    hits: u64,
    misses: u64,
}

/// In-process response cache for final user-facing answers. Keyed by the
/// MD5 of the normalized query; only first-turn responses are stored so a
/// context-dependent answer is never replayed into a different session.
pub struct ResponseCache {
    inner: Mutex<CacheInner>,
    capacity: usize,
    default_ttl: Duration,
}

impl Default for ResponseCache {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY, DEFAULT_TTL)
    }
}

impl ResponseCache {
    pub fn new(capacity: usize, default_ttl: Duration) -> Self {
        Self {
            inner: Mutex::new(CacheInner {
                entries: HashMap::new(),
                hits: 0,
                misses: 0,
            }),
            capacity: capacity.max(1),
            default_ttl,
        }
    }

    /// MD5 over the lowercased, whitespace-collapsed query.
    fn key_for(query: &str) -> String {
        let normalized = query
            .to_lowercase()
            .split_whitespace()
            .collect::<Vec<_>>()
            .join(" ");
        let digest = Md5::digest(normalized.as_bytes());
        format!("{digest:x}")
    }

    /// Returns the cached answer unless it is absent or expired. Expired
    /// entries are removed and count as misses.
    pub fn get(&self, query: &str) -> Option<String> {
        let key = Self::key_for(query);
        let mut inner = self.inner.lock().ok()?;

        match inner.entries.get(&key) {
            Some(cached) if !cached.is_expired() => {
                let response = cached.response.clone();
                inner.hits += 1;
                debug!("Response cache hit");
                Some(response)
            }
            Some(_) => {
                inner.entries.remove(&key);
                inner.misses += 1;
                debug!("Response cache entry expired");
                None
            }
            None => {
                inner.misses += 1;
                None
            }
        }
    }

    pub fn set(&self, query: &str, response: String) {
        self.set_with_ttl(query, response, self.default_ttl);
    }

    pub fn set_with_ttl(&self, query: &str, response: String, ttl: Duration) {
        let key = Self::key_for(query);
        let Ok(mut inner) = self.inner.lock() else {
            return;
        };

        if inner.entries.len() >= self.capacity {
            if let Some(oldest) = inner
                .entries
                .iter()
                .min_by_key(|(_, cached)| cached.cached_at)
                .map(|(k, _)| k.clone())
            {
                inner.entries.remove(&oldest);
            }
        }

        inner.entries.insert(
            key,
            CachedResponse {
                response,
                cached_at: Instant::now(),
                ttl,
            },
        );
    }

    /// Drops expired entries; returns how many were removed.
    pub fn cleanup_expired(&self) -> usize {
        let Ok(mut inner) = self.inner.lock() else {
            return 0;
        };
        let before = inner.entries.len();
        inner.entries.retain(|_, cached| !cached.is_expired());
        let removed = before - inner.entries.len();
        if removed > 0 {
            info!(removed, "Response cache cleanup");
        }
        removed
    }

    pub fn stats(&self) -> CacheStats {
        self.inner
            .lock()
            .map(|inner| CacheStats {
                size: inner.entries.len(),
                hits: inner.hits,
                misses: inner.misses,
            })
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hit_after_set() {
        let cache = ResponseCache::default();
        cache.set("¿Qué es el GDPR?", "respuesta".into());

        assert_eq!(cache.get("¿Qué es el GDPR?"), Some("respuesta".into()));
        let stats = cache.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 0);
    }

    #[test]
    fn normalization_collapses_case_and_whitespace() {
        let cache = ResponseCache::default();
        cache.set("Qué   es el  GDPR", "respuesta".into());
        assert_eq!(cache.get("qué es el gdpr"), Some("respuesta".into()));
    }

    #[test]
    fn expired_entries_count_as_misses() {
        let cache = ResponseCache::new(10, Duration::from_millis(0));
        cache.set("consulta", "respuesta".into());
        std::thread::sleep(Duration::from_millis(5));

        assert_eq!(cache.get("consulta"), None);
        let stats = cache.stats();
        assert_eq!(stats.hits, 0);
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.size, 0);
    }

    #[test]
    fn capacity_evicts_oldest_entry() {
        let cache = ResponseCache::new(2, DEFAULT_TTL);
        cache.set("a", "1".into());
        std::thread::sleep(Duration::from_millis(2));
        cache.set("b", "2".into());
        std::thread::sleep(Duration::from_millis(2));
        cache.set("c", "3".into());

        assert_eq!(cache.get("a"), None);
        assert_eq!(cache.get("b"), Some("2".into()));
        assert_eq!(cache.get("c"), Some("3".into()));
    }

    #[test]
    fn cleanup_removes_expired() {
        let cache = ResponseCache::new(10, Duration::from_millis(0));
        cache.set("a", "1".into());
        cache.set("b", "2".into());
        std::thread::sleep(Duration::from_millis(5));

        assert_eq!(cache.cleanup_expired(), 2);
        assert_eq!(cache.stats().size, 0);
    }
}
