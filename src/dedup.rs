//! # Dedup & Cache Layer
//! Content-addressed suppression of duplicate work.
//!
//! Two records with different lifetimes:
//! - publish fingerprints (long TTL): an unexpired fingerprint means the
//!   corresponding listings were already published downstream, so the
//!   normalizer and sink are skipped entirely;
//! - seen-target marks (short TTL): a `(source_id, target)` fetched very
//!   recently is not fetched again, bounding request volume during retry
//!   storms independent of content hash.
//!
//! Both are optimizations, not correctness: a duplicate slipping through is
//! absorbed by the sink's idempotence.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use metrics::counter;
use sha2::{Digest, Sha256};
use tokio::time::Instant;

/// Stable fingerprint over `(source_id, target, content_hash)`. Field
/// delimiters keep distinct tuples from colliding on concatenation.
pub fn fingerprint(source_id: &str, target_key: &str, content_hash: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(source_id.as_bytes());
    hasher.update([0u8]);
    hasher.update(target_key.as_bytes());
    hasher.update([0u8]);
    hasher.update(content_hash.as_bytes());
    hex::encode(hasher.finalize())
}

/// Dedup store capability: key-value with TTL, queried/written by
/// fingerprint. The shipped implementation is in-memory; an external cache
/// store plugs in behind this trait.
pub trait DedupCache: Send + Sync {
    /// True when no unexpired fingerprint record exists — i.e. the payload
    /// has not been published yet and must flow through the pipeline.
    fn should_publish_at(&self, fp: &str, now: Instant) -> bool;

    fn record_published_at(&self, fp: &str, now: Instant);

    /// True when the same `(source_id, target)` was fetched within the
    /// short TTL window.
    fn recently_fetched_at(&self, source_id: &str, target_key: &str, now: Instant) -> bool;

    fn record_fetch_at(&self, source_id: &str, target_key: &str, now: Instant);

    fn should_publish(&self, fp: &str) -> bool {
        self.should_publish_at(fp, Instant::now())
    }

    fn record_published(&self, fp: &str) {
        self.record_published_at(fp, Instant::now())
    }

    fn recently_fetched(&self, source_id: &str, target_key: &str) -> bool {
        self.recently_fetched_at(source_id, target_key, Instant::now())
    }

    fn record_fetch(&self, source_id: &str, target_key: &str) {
        self.record_fetch_at(source_id, target_key, Instant::now())
    }
}

#[derive(Debug, Clone)]
struct FingerprintRecord {
    #[allow(dead_code)]
    first_seen: Instant,
    last_seen: Instant,
    ttl: Duration,
}

#[derive(Debug, Default)]
struct Inner {
    published: HashMap<String, FingerprintRecord>,
    fetched: HashMap<String, Instant>,
}

#[derive(Debug)]
pub struct InMemoryDedup {
    inner: Mutex<Inner>,
    publish_ttl: Duration,
    fetch_ttl: Duration,
}

impl InMemoryDedup {
    pub fn new(publish_ttl: Duration, fetch_ttl: Duration) -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            publish_ttl,
            fetch_ttl,
        }
    }

    /// Drop expired records. Called opportunistically; correctness never
    /// depends on it because reads check expiry themselves.
    pub fn purge_expired(&self) {
        self.purge_expired_at(Instant::now())
    }

    pub fn purge_expired_at(&self, now: Instant) {
        let mut inner = self.lock();
        inner
            .published
            .retain(|_, rec| rec.last_seen + rec.ttl > now);
        inner.fetched.retain(|_, expires| *expires > now);
    }

    pub fn published_count(&self) -> usize {
        self.lock().published.len()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().expect("dedup store mutex poisoned")
    }

    fn fetch_key(source_id: &str, target_key: &str) -> String {
        format!("{source_id}\u{0}{target_key}")
    }
}

impl DedupCache for InMemoryDedup {
    fn should_publish_at(&self, fp: &str, now: Instant) -> bool {
        let inner = self.lock();
        match inner.published.get(fp) {
            Some(rec) if rec.last_seen + rec.ttl > now => {
                counter!("harvester_dedup_hits_total", "kind" => "fingerprint").increment(1);
                false
            }
            _ => true,
        }
    }

    fn record_published_at(&self, fp: &str, now: Instant) {
        let mut inner = self.lock();
        let ttl = self.publish_ttl;
        inner
            .published
            .entry(fp.to_string())
            .and_modify(|rec| rec.last_seen = now)
            .or_insert(FingerprintRecord {
                first_seen: now,
                last_seen: now,
                ttl,
            });
    }

    fn recently_fetched_at(&self, source_id: &str, target_key: &str, now: Instant) -> bool {
        let inner = self.lock();
        let hit = matches!(
            inner.fetched.get(&Self::fetch_key(source_id, target_key)),
            Some(expires) if *expires > now
        );
        if hit {
            counter!("harvester_dedup_hits_total", "kind" => "seen_target").increment(1);
        }
        hit
    }

    fn record_fetch_at(&self, source_id: &str, target_key: &str, now: Instant) {
        let mut inner = self.lock();
        let expires = now + self.fetch_ttl;
        inner
            .fetched
            .insert(Self::fetch_key(source_id, target_key), expires);
    }
}
