//! Process-scoped resolver context.
//!
//! Shared mutable state for all concurrent resolutions: the request-id
//! counter, the per-address response-time history used to bias site
//! ordering, and the preferred-primary table. Created once, shared by
//! handle, torn down on shutdown. Nothing here is global.

use std::net::IpAddr;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use lru::LruCache;
use rand::Rng;

const RESPONSE_TIME_CAPACITY: usize = 1024;
const PREFERRED_PRIMARY_CAPACITY: usize = 256;

/// Jitter added to remembered response times when ordering candidates, to
/// avoid herding every resolution onto one server on near-ties.
const ORDERING_JITTER_MS: u64 = 10;

pub struct ResolverContext {
    request_ids: AtomicU32,
    response_times: Mutex<LruCache<IpAddr, Duration>>,
    preferred_primaries: Mutex<LruCache<String, IpAddr>>,
}

impl Default for ResolverContext {
    fn default() -> Self {
        Self::new()
    }
}

impl ResolverContext {
    pub fn new() -> Self {
        Self {
            // Start from a random id so concurrent processes against the
            // same server do not collide on low ids.
            request_ids: AtomicU32::new(rand::rng().random_range(1..=0x00FF_FFFF)),
            response_times: Mutex::new(LruCache::new(
                NonZeroUsize::new(RESPONSE_TIME_CAPACITY).unwrap_or(NonZeroUsize::MIN),
            )),
            preferred_primaries: Mutex::new(LruCache::new(
                NonZeroUsize::new(PREFERRED_PRIMARY_CAPACITY).unwrap_or(NonZeroUsize::MIN),
            )),
        }
    }

    /// Fresh request id, unique within this context.
    pub fn next_request_id(&self) -> u32 {
        let id = self.request_ids.fetch_add(1, Ordering::Relaxed);
        if id == 0 {
            self.request_ids.fetch_add(1, Ordering::Relaxed)
        } else {
            id
        }
    }

    /// Remember how long a server took to answer.
    pub fn record_response_time(&self, address: IpAddr, elapsed: Duration) {
        if let Ok(mut times) = self.response_times.lock() {
            times.put(address, elapsed);
        }
    }

    pub fn response_time(&self, address: &IpAddr) -> Option<Duration> {
        match self.response_times.lock() {
            Ok(mut times) => times.get(address).copied(),
            Err(_) => None,
        }
    }

    /// Sort addresses fastest-remembered-first, with jitter on the
    /// comparison so historically tied servers share load. Addresses with
    /// no history sort after those with history, in their given order.
    pub fn order_by_response_time(&self, addresses: &mut [IpAddr]) {
        let mut rng = rand::rng();
        let mut keyed: Vec<(Duration, usize)> = addresses
            .iter()
            .enumerate()
            .map(|(position, addr)| {
                let base = self
                    .response_time(addr)
                    .unwrap_or(Duration::from_secs(3600));
                let jitter = Duration::from_millis(rng.random_range(0..=ORDERING_JITTER_MS));
                (base + jitter, position)
            })
            .collect();
        keyed.sort_by_key(|(cost, position)| (*cost, *position));
        let reordered: Vec<IpAddr> = keyed.iter().map(|(_, p)| addresses[*p]).collect();
        addresses.copy_from_slice(&reordered);
    }

    /// Remember which primary answered fastest for a prefix.
    pub fn set_preferred_primary(&self, prefix: impl Into<String>, address: IpAddr) {
        if let Ok(mut preferred) = self.preferred_primaries.lock() {
            preferred.put(prefix.into(), address);
        }
    }

    pub fn preferred_primary(&self, prefix: &str) -> Option<IpAddr> {
        match self.preferred_primaries.lock() {
            Ok(mut preferred) => preferred.get(prefix).copied(),
            Err(_) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_ids_are_unique_and_nonzero() {
        let ctx = ResolverContext::new();
        let mut seen = std::collections::HashSet::new();
        for _ in 0..1000 {
            let id = ctx.next_request_id();
            assert_ne!(id, 0);
            assert!(seen.insert(id));
        }
    }

    #[test]
    fn response_time_ordering_prefers_fast_servers() {
        let ctx = ResolverContext::new();
        let fast: IpAddr = "192.0.2.1".parse().unwrap();
        let slow: IpAddr = "192.0.2.2".parse().unwrap();
        ctx.record_response_time(fast, Duration::from_millis(5));
        ctx.record_response_time(slow, Duration::from_secs(2));

        let mut addresses = vec![slow, fast];
        ctx.order_by_response_time(&mut addresses);
        assert_eq!(addresses, vec![fast, slow]);
    }

    #[test]
    fn unknown_addresses_sort_after_known() {
        let ctx = ResolverContext::new();
        let known: IpAddr = "192.0.2.1".parse().unwrap();
        let unknown: IpAddr = "192.0.2.9".parse().unwrap();
        ctx.record_response_time(known, Duration::from_millis(20));
        let mut addresses = vec![unknown, known];
        ctx.order_by_response_time(&mut addresses);
        assert_eq!(addresses[0], known);
    }

    #[test]
    fn preferred_primary_roundtrip() {
        let ctx = ResolverContext::new();
        let addr: IpAddr = "2001:db8::7".parse().unwrap();
        ctx.set_preferred_primary("0.NA/10", addr);
        assert_eq!(ctx.preferred_primary("0.NA/10"), Some(addr));
        assert_eq!(ctx.preferred_primary("0.NA/11"), None);
    }
}
