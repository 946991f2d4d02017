//! # Rate Governor
//! Per-source token buckets enforcing safe request cadence.
//!
//! `acquire` is a non-blocking check: denied means "do not fetch now" and the
//! dispatcher turns that into a short re-queue, keeping backpressure in the
//! queue rather than in blocked worker threads.
//!
//! Synchronization is scoped per source: the bucket map is behind a
//! read-mostly lock and each bucket has its own mutex, so workers hammering
//! different sources never serialize on each other.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};

use metrics::counter;
use tokio::time::Instant;

/// Capacity and refill cadence of one bucket.
#[derive(Debug, Clone, Copy, serde::Deserialize)]
pub struct BucketConfig {
    pub capacity: f64,
    pub refill_per_sec: f64,
}

impl Default for BucketConfig {
    fn default() -> Self {
        Self {
            capacity: 5.0,
            refill_per_sec: 1.0,
        }
    }
}

#[derive(Debug)]
struct RateBucket {
    capacity: f64,
    tokens: f64,
    refill_per_sec: f64,
    last_refill: Instant,
}

impl RateBucket {
    fn new(cfg: BucketConfig, now: Instant) -> Self {
        Self {
            capacity: cfg.capacity,
            tokens: cfg.capacity,
            refill_per_sec: cfg.refill_per_sec,
            last_refill: now,
        }
    }

    fn try_take(&mut self, now: Instant) -> bool {
        let elapsed = now.saturating_duration_since(self.last_refill);
        self.tokens =
            (self.tokens + elapsed.as_secs_f64() * self.refill_per_sec).min(self.capacity);
        self.last_refill = now;
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }
}

#[derive(Debug)]
pub struct RateGovernor {
    buckets: RwLock<HashMap<String, Arc<Mutex<RateBucket>>>>,
    default_cfg: BucketConfig,
    overrides: HashMap<String, BucketConfig>,
}

impl RateGovernor {
    pub fn new(default_cfg: BucketConfig) -> Self {
        Self {
            buckets: RwLock::new(HashMap::new()),
            default_cfg,
            overrides: HashMap::new(),
        }
    }

    /// Per-source limits on top of the default (from config).
    pub fn with_overrides(default_cfg: BucketConfig, overrides: HashMap<String, BucketConfig>) -> Self {
        Self {
            buckets: RwLock::new(HashMap::new()),
            default_cfg,
            overrides,
        }
    }

    pub fn acquire(&self, source_id: &str) -> bool {
        self.acquire_at(source_id, Instant::now())
    }

    /// Take one token for `source_id`, refilling by elapsed time first.
    pub fn acquire_at(&self, source_id: &str, now: Instant) -> bool {
        let bucket = self.bucket_for(source_id, now);
        let granted = bucket.lock().expect("rate bucket mutex poisoned").try_take(now);
        if !granted {
            counter!("harvester_rate_denied_total", "source" => source_id.to_string()).increment(1);
        }
        granted
    }

    fn bucket_for(&self, source_id: &str, now: Instant) -> Arc<Mutex<RateBucket>> {
        if let Some(b) = self
            .buckets
            .read()
            .expect("rate map lock poisoned")
            .get(source_id)
        {
            return b.clone();
        }
        let cfg = self
            .overrides
            .get(source_id)
            .copied()
            .unwrap_or(self.default_cfg);
        let mut map = self.buckets.write().expect("rate map lock poisoned");
        map.entry(source_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(RateBucket::new(cfg, now))))
            .clone()
    }
}
