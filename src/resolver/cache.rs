//! Resolution response caching.
//!
//! Only resolution (read) responses are cached. A lookup key is the
//! cache-normalized handle plus the exact type/index filters of the
//! request; a "handle not found" answer is cached as its own sentinel with
//! an independent TTL so repeated misses stay off the network. Mutating
//! operations remove every entry for their handle before the operation
//! reaches the wire.

use std::num::NonZeroUsize;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use lru::LruCache;
use tracing::trace;

use crate::types::{handle::normalize_for_cache, HandleValue};

/// A cache hit: either values or a remembered not-found.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CachedResult {
    Values(Vec<HandleValue>),
    /// The handle was authoritatively absent. Distinct from a cache miss.
    NotFound,
}

/// The cache collaborator interface the resolution engine works against.
pub trait HandleCache: Send + Sync {
    /// Cached values for an exact (handle, types, indexes) query, or the
    /// not-found sentinel, or `None` on a miss.
    fn get(&self, handle: &str, types: &[Vec<u8>], indexes: &[u32]) -> Option<CachedResult>;
    fn put(
        &self,
        handle: &str,
        types: &[Vec<u8>],
        indexes: &[u32],
        values: Vec<HandleValue>,
        ttl: Duration,
    );
    fn put_not_found(&self, handle: &str, ttl: Duration);
    /// Drop every entry for a handle, regardless of filters.
    fn remove_handle(&self, handle: &str);
    fn clear(&self);
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct CacheKey {
    handle: String,
    types: Vec<Vec<u8>>,
    indexes: Vec<u32>,
}

impl CacheKey {
    fn new(handle: &str, types: &[Vec<u8>], indexes: &[u32]) -> Self {
        Self {
            handle: normalize_for_cache(handle),
            types: types.to_vec(),
            indexes: indexes.to_vec(),
        }
    }

    /// Key under which the handle-level not-found sentinel lives.
    fn not_found(handle: &str) -> Self {
        Self::new(handle, &[], &[])
    }
}

#[derive(Debug, Clone)]
struct CacheEntry {
    result: CachedResult,
    expires_at: Instant,
}

impl CacheEntry {
    fn is_expired(&self) -> bool {
        Instant::now() >= self.expires_at
    }
}

/// Bounded in-memory [`HandleCache`] with per-entry TTLs.
pub struct MemoryCache {
    entries: Mutex<LruCache<CacheKey, CacheEntry>>,
}

impl MemoryCache {
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity.max(1)).unwrap_or(NonZeroUsize::MIN);
        Self {
            entries: Mutex::new(LruCache::new(capacity)),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, LruCache<CacheKey, CacheEntry>> {
        // Lock poisoning only happens if a holder panicked; the cache holds
        // no invariants a panic could break, so keep serving.
        match self.entries.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl HandleCache for MemoryCache {
    fn get(&self, handle: &str, types: &[Vec<u8>], indexes: &[u32]) -> Option<CachedResult> {
        let mut entries = self.lock();
        // A remembered not-found answers every filter combination.
        let nf_key = CacheKey::not_found(handle);
        if let Some(entry) = entries.get(&nf_key) {
            if entry.is_expired() {
                entries.pop(&nf_key);
            } else if entry.result == CachedResult::NotFound {
                trace!(handle, "negative cache hit");
                return Some(CachedResult::NotFound);
            }
        }
        let key = CacheKey::new(handle, types, indexes);
        match entries.get(&key) {
            Some(entry) if entry.is_expired() => {
                entries.pop(&key);
                None
            }
            Some(entry) => Some(entry.result.clone()),
            None => None,
        }
    }

    fn put(
        &self,
        handle: &str,
        types: &[Vec<u8>],
        indexes: &[u32],
        values: Vec<HandleValue>,
        ttl: Duration,
    ) {
        if ttl.is_zero() {
            return;
        }
        let mut entries = self.lock();
        entries.put(
            CacheKey::new(handle, types, indexes),
            CacheEntry {
                result: CachedResult::Values(values),
                expires_at: Instant::now() + ttl,
            },
        );
    }

    fn put_not_found(&self, handle: &str, ttl: Duration) {
        if ttl.is_zero() {
            return;
        }
        let mut entries = self.lock();
        entries.put(
            CacheKey::not_found(handle),
            CacheEntry {
                result: CachedResult::NotFound,
                expires_at: Instant::now() + ttl,
            },
        );
    }

    fn remove_handle(&self, handle: &str) {
        let normalized = normalize_for_cache(handle);
        let mut entries = self.lock();
        let stale: Vec<CacheKey> = entries
            .iter()
            .filter(|(key, _)| key.handle == normalized)
            .map(|(key, _)| key.clone())
            .collect();
        for key in stale {
            entries.pop(&key);
        }
    }

    fn clear(&self) {
        self.lock().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn value(index: u32) -> HandleValue {
        HandleValue::new(index, b"URL".to_vec(), b"https://example.org".to_vec())
    }

    #[test]
    fn hit_requires_matching_filters() {
        let cache = MemoryCache::new(16);
        cache.put(
            "100/test",
            &[b"URL".to_vec()],
            &[],
            vec![value(1)],
            Duration::from_secs(60),
        );
        assert!(matches!(
            cache.get("100/test", &[b"URL".to_vec()], &[]),
            Some(CachedResult::Values(v)) if v.len() == 1
        ));
        assert_eq!(cache.get("100/test", &[b"EMAIL".to_vec()], &[]), None);
    }

    #[test]
    fn prefix_is_case_insensitive_suffix_is_not() {
        let cache = MemoryCache::new(16);
        cache.put("abc/Thing", &[], &[], vec![value(1)], Duration::from_secs(60));
        assert!(cache.get("ABC/Thing", &[], &[]).is_some());
        assert!(cache.get("abc/thing", &[], &[]).is_none());
    }

    #[test]
    fn negative_entry_answers_any_filter() {
        let cache = MemoryCache::new(16);
        cache.put_not_found("100/missing", Duration::from_secs(60));
        assert_eq!(
            cache.get("100/missing", &[b"URL".to_vec()], &[5]),
            Some(CachedResult::NotFound)
        );
    }

    #[test]
    fn zero_ttl_is_not_stored() {
        let cache = MemoryCache::new(16);
        cache.put_not_found("100/missing", Duration::ZERO);
        assert_eq!(cache.get("100/missing", &[], &[]), None);
    }

    #[test]
    fn expired_entries_miss() {
        let cache = MemoryCache::new(16);
        cache.put("100/test", &[], &[], vec![value(1)], Duration::from_nanos(1));
        std::thread::sleep(Duration::from_millis(2));
        assert_eq!(cache.get("100/test", &[], &[]), None);
    }

    #[test]
    fn remove_handle_drops_all_filter_variants() {
        let cache = MemoryCache::new(16);
        cache.put("100/test", &[], &[], vec![value(1)], Duration::from_secs(60));
        cache.put(
            "100/test",
            &[b"URL".to_vec()],
            &[],
            vec![value(1)],
            Duration::from_secs(60),
        );
        cache.put("100/other", &[], &[], vec![value(2)], Duration::from_secs(60));
        cache.remove_handle("100/test");
        assert_eq!(cache.get("100/test", &[], &[]), None);
        assert_eq!(cache.get("100/test", &[b"URL".to_vec()], &[]), None);
        assert!(cache.get("100/other", &[], &[]).is_some());
    }

    #[test]
    fn capacity_is_bounded() {
        let cache = MemoryCache::new(2);
        cache.put("1/a", &[], &[], vec![value(1)], Duration::from_secs(60));
        cache.put("1/b", &[], &[], vec![value(1)], Duration::from_secs(60));
        cache.put("1/c", &[], &[], vec![value(1)], Duration::from_secs(60));
        let live = ["1/a", "1/b", "1/c"]
            .iter()
            .filter(|h| cache.get(h, &[], &[]).is_some())
            .count();
        assert_eq!(live, 2);
    }
}
