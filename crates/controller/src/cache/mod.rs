use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use serde::Serialize;

/// Memoizes (normalized request + context) → final answer with TTL and
/// hit counting. FIFO eviction at capacity; expired entries are evicted
/// the moment a read observes them.
pub struct ResponseCache {
    /// Single lock around all cache state. Never held across await points.
    inner: Mutex<CacheInner>,
    ttl: Duration,
    max_entries: usize,
}

struct CacheInner {
    entries: HashMap<String, CacheEntry>,
    hits: u64,
    misses: u64,
    evictions: u64,
    saved_calls: u64,
}

struct CacheEntry {
    answer: String,
    inserted_at: Instant,
    hit_count: u64,
    query_preview: String,
}

/// Cache observability snapshot.
#[derive(Clone, Debug, Serialize)]
pub struct CacheStats {
    pub total_entries: usize,
    pub max_entries: usize,
    pub hits: u64,
    pub misses: u64,
    pub hit_rate: f64,
    pub evictions: u64,
    pub saved_calls: u64,
    pub ttl_seconds: u64,
}

/// A frequently reused entry, for the stats endpoint.
#[derive(Clone, Debug, Serialize)]
pub struct PopularQuery {
    pub query: String,
    pub hits: u64,
    pub age_seconds: u64,
}

impl ResponseCache {
    pub fn new(ttl: Duration, max_entries: usize) -> Self {
        Self {
            inner: Mutex::new(CacheInner {
                entries: HashMap::new(),
                hits: 0,
                misses: 0,
                evictions: 0,
                saved_calls: 0,
            }),
            ttl,
            max_entries,
        }
    }

    /// Key: md5 over the case-folded, whitespace-trimmed message and
    /// (if present) context.
    fn hash_key(message: &str, context: Option<&str>) -> String {
        let mut normalized = message.trim().to_lowercase();
        if let Some(ctx) = context {
            normalized.push_str(&ctx.trim().to_lowercase());
        }
        format!("{:x}", md5::compute(normalized.as_bytes()))
    }

    /// Get a cached answer if present and not expired. An expired entry is
    /// removed on observation and reported as a miss.
    pub fn get(&self, message: &str, context: Option<&str>) -> Option<String> {
        let key = Self::hash_key(message, context);
        let mut guard = self.inner.lock().unwrap();
        let inner = &mut *guard;

        let expired = match inner.entries.get(&key) {
            Some(entry) => entry.inserted_at.elapsed() >= self.ttl,
            None => {
                inner.misses += 1;
                metrics::counter!("cache.miss").increment(1);
                return None;
            }
        };

        if expired {
            inner.entries.remove(&key);
            inner.evictions += 1;
            inner.misses += 1;
            metrics::counter!("cache.miss").increment(1);
            tracing::debug!("Cache miss (expired)");
            return None;
        }

        inner.hits += 1;
        inner.saved_calls += 1;
        metrics::counter!("cache.hit").increment(1);
        inner.entries.get_mut(&key).map(|entry| {
            entry.hit_count += 1;
            entry.answer.clone()
        })
    }

    /// Store an answer. At capacity, the entry with the oldest insert
    /// timestamp is evicted (FIFO, not LRU).
    pub fn set(&self, message: &str, answer: &str, context: Option<&str>) {
        let key = Self::hash_key(message, context);
        let mut inner = self.inner.lock().unwrap();

        if inner.entries.len() >= self.max_entries && !inner.entries.contains_key(&key) {
            let oldest = inner
                .entries
                .iter()
                .min_by_key(|(_, entry)| entry.inserted_at)
                .map(|(k, _)| k.clone());
            if let Some(oldest_key) = oldest {
                inner.entries.remove(&oldest_key);
                inner.evictions += 1;
                metrics::counter!("cache.evictions").increment(1);
                tracing::debug!("Cache full, evicted oldest entry");
            }
        }

        let preview = if message.len() > 50 {
            let cut = message
                .char_indices()
                .take_while(|(i, _)| *i < 50)
                .last()
                .map(|(i, c)| i + c.len_utf8())
                .unwrap_or(0);
            format!("{}...", &message[..cut])
        } else {
            message.to_string()
        };

        inner.entries.insert(
            key,
            CacheEntry {
                answer: answer.to_string(),
                inserted_at: Instant::now(),
                hit_count: 0,
                query_preview: preview,
            },
        );
        metrics::gauge!("cache.entries").set(inner.entries.len() as f64);
    }

    /// Remove all expired entries. Returns how many were dropped.
    pub fn clear_expired(&self) -> usize {
        let mut inner = self.inner.lock().unwrap();
        let before = inner.entries.len();
        let ttl = self.ttl;
        inner.entries.retain(|_, entry| entry.inserted_at.elapsed() < ttl);
        let dropped = before - inner.entries.len();
        inner.evictions += dropped as u64;
        dropped
    }

    pub fn stats(&self) -> CacheStats {
        let inner = self.inner.lock().unwrap();
        let total = inner.hits + inner.misses;
        CacheStats {
            total_entries: inner.entries.len(),
            max_entries: self.max_entries,
            hits: inner.hits,
            misses: inner.misses,
            hit_rate: if total > 0 {
                inner.hits as f64 / total as f64 * 100.0
            } else {
                0.0
            },
            evictions: inner.evictions,
            saved_calls: inner.saved_calls,
            ttl_seconds: self.ttl.as_secs(),
        }
    }

    /// Most frequently reused entries, for observability.
    pub fn popular_queries(&self, top_n: usize) -> Vec<PopularQuery> {
        let inner = self.inner.lock().unwrap();
        let mut queries: Vec<PopularQuery> = inner
            .entries
            .values()
            .map(|entry| PopularQuery {
                query: entry.query_preview.clone(),
                hits: entry.hit_count,
                age_seconds: entry.inserted_at.elapsed().as_secs(),
            })
            .collect();
        queries.sort_by(|a, b| b.hits.cmp(&a.hits));
        queries.truncate(top_n);
        queries
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cache() -> ResponseCache {
        ResponseCache::new(Duration::from_secs(3600), 1000)
    }

    #[test]
    fn test_cache_hit_miss() {
        let cache = cache();
        assert!(cache.get("Explain TLS", None).is_none());

        cache.set("Explain TLS", "TLS is a transport security protocol.", None);
        assert_eq!(
            cache.get("Explain TLS", None).as_deref(),
            Some("TLS is a transport security protocol.")
        );

        let stats = cache.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.saved_calls, 1);
    }

    #[test]
    fn test_key_normalization_folds_case_and_whitespace() {
        let cache = cache();
        cache.set("  Explain TLS  ", "answer", None);
        assert_eq!(cache.get("explain tls", None).as_deref(), Some("answer"));
    }

    #[test]
    fn test_context_distinguishes_entries() {
        let cache = cache();
        cache.set("summarize", "about apples", Some("apples"));
        assert!(cache.get("summarize", Some("oranges")).is_none());
        assert!(cache.get("summarize", None).is_none());
        assert_eq!(
            cache.get("summarize", Some("apples")).as_deref(),
            Some("about apples")
        );
    }

    #[test]
    fn test_expired_entry_is_removed_on_read() {
        let cache = ResponseCache::new(Duration::from_millis(1), 1000);
        cache.set("q", "old", None);

        std::thread::sleep(Duration::from_millis(10));
        assert!(cache.get("q", None).is_none());

        let stats = cache.stats();
        assert_eq!(stats.total_entries, 0);
        assert_eq!(stats.evictions, 1);
    }

    #[test]
    fn test_set_overwrites_within_ttl() {
        let cache = cache();
        cache.set("q", "v1", None);
        cache.set("q", "v2", None);
        assert_eq!(cache.get("q", None).as_deref(), Some("v2"));
        assert_eq!(cache.stats().total_entries, 1);
    }

    #[test]
    fn test_capacity_evicts_exactly_the_oldest() {
        let cache = ResponseCache::new(Duration::from_secs(3600), 2);
        cache.set("first", "1", None);
        std::thread::sleep(Duration::from_millis(5));
        cache.set("second", "2", None);
        std::thread::sleep(Duration::from_millis(5));
        cache.set("third", "3", None);

        assert!(cache.get("first", None).is_none());
        assert_eq!(cache.get("second", None).as_deref(), Some("2"));
        assert_eq!(cache.get("third", None).as_deref(), Some("3"));
        assert_eq!(cache.stats().evictions, 1);
    }

    #[test]
    fn test_clear_expired_sweep() {
        let cache = ResponseCache::new(Duration::from_millis(1), 1000);
        cache.set("a", "1", None);
        cache.set("b", "2", None);
        std::thread::sleep(Duration::from_millis(10));
        assert_eq!(cache.clear_expired(), 2);
        assert_eq!(cache.stats().total_entries, 0);
    }

    #[test]
    fn test_popular_queries_ranked_by_hits() {
        let cache = cache();
        cache.set("rare", "r", None);
        cache.set("popular", "p", None);
        for _ in 0..3 {
            cache.get("popular", None);
        }

        let popular = cache.popular_queries(1);
        assert_eq!(popular.len(), 1);
        assert_eq!(popular[0].query, "popular");
        assert_eq!(popular[0].hits, 3);
    }
}
