use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde::Serialize;

/// Hooks the coordinator calls as requests move through the cache. Every
/// method has a no-op default so implementors only override what they need.
pub trait CacheObserver: Send + Sync {
    fn cache_hit(&self, _key: &str) {}
    fn cache_miss(&self, _key: &str) {}
    fn coalesced(&self, _key: &str) {}
    fn download_started(&self, _key: &str) {}
    fn download_finished(&self, _key: &str, _elapsed: Duration, _bytes: u64) {}
    fn download_ended(&self, _key: &str) {}
    fn error(&self, _kind: &'static str) {}
    fn evicted(&self, _count: usize, _bytes: u64) {}
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoopObserver;

impl CacheObserver for NoopObserver {}

#[derive(Debug, Default, Clone, Serialize, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub coalesced: u64,
    pub downloads_completed: u64,
    pub downloads_inflight: u64,
    pub bytes_downloaded: u64,
    pub errors: u64,
    pub evictions: u64,
}

/// Publishes through the `metrics` facade and keeps local counters for the
/// stats endpoint.
#[derive(Debug, Default)]
pub struct MetricsObserver {
    hits: AtomicU64,
    misses: AtomicU64,
    coalesced: AtomicU64,
    completed: AtomicU64,
    inflight: AtomicU64,
    bytes: AtomicU64,
    errors: AtomicU64,
    evictions: AtomicU64,
}

impl MetricsObserver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            coalesced: self.coalesced.load(Ordering::Relaxed),
            downloads_completed: self.completed.load(Ordering::Relaxed),
            downloads_inflight: self.inflight.load(Ordering::Relaxed),
            bytes_downloaded: self.bytes.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
        }
    }
}

impl CacheObserver for MetricsObserver {
    fn cache_hit(&self, _key: &str) {
        self.hits.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("clipcache.cache.hit").increment(1);
    }

    fn cache_miss(&self, _key: &str) {
        self.misses.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("clipcache.cache.miss").increment(1);
    }

    fn coalesced(&self, _key: &str) {
        self.coalesced.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("clipcache.cache.coalesced").increment(1);
    }

    fn download_started(&self, _key: &str) {
        let now = self.inflight.fetch_add(1, Ordering::Relaxed) + 1;
        metrics::gauge!("clipcache.downloads.inflight").set(now as f64);
    }

    fn download_finished(&self, _key: &str, elapsed: Duration, bytes: u64) {
        self.completed.fetch_add(1, Ordering::Relaxed);
        self.bytes.fetch_add(bytes, Ordering::Relaxed);
        metrics::histogram!("clipcache.download.duration_ms").record(elapsed.as_millis() as f64);
        metrics::counter!("clipcache.download.bytes").increment(bytes);
    }

    fn download_ended(&self, _key: &str) {
        let now = self
            .inflight
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| Some(n.saturating_sub(1)))
            .map(|prev| prev.saturating_sub(1))
            .unwrap_or(0);
        metrics::gauge!("clipcache.downloads.inflight").set(now as f64);
    }

    fn error(&self, kind: &'static str) {
        self.errors.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("clipcache.errors", "kind" => kind).increment(1);
    }

    fn evicted(&self, count: usize, bytes: u64) {
        if count == 0 {
            return;
        }
        self.evictions.fetch_add(count as u64, Ordering::Relaxed);
        metrics::counter!("clipcache.evictions").increment(count as u64);
        metrics::counter!("clipcache.evictions.bytes").increment(bytes);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_track_events() {
        let observer = MetricsObserver::new();
        observer.cache_hit("a");
        observer.cache_miss("b");
        observer.coalesced("b");
        observer.download_started("b");
        assert_eq!(observer.stats().downloads_inflight, 1);
        observer.download_finished("b", Duration::from_millis(5), 42);
        observer.download_ended("b");
        observer.error("timeout");
        observer.evicted(0, 0);
        observer.evicted(2, 10);

        let stats = observer.stats();
        assert_eq!(
            stats,
            CacheStats {
                hits: 1,
                misses: 1,
                coalesced: 1,
                downloads_completed: 1,
                downloads_inflight: 0,
                bytes_downloaded: 42,
                errors: 1,
                evictions: 2,
            }
        );
    }

    #[test]
    fn inflight_never_underflows() {
        let observer = MetricsObserver::new();
        observer.download_ended("x");
        assert_eq!(observer.stats().downloads_inflight, 0);
    }
}
