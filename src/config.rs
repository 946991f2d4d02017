//! # Engine Configuration
//! TOML-backed settings for the whole pipeline, with env-var overrides for
//! deployment knobs. Durations are plain seconds in the file; conversion
//! into the typed per-component configs happens here.

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;
use std::{env, fs};

use serde::Deserialize;

use crate::dispatch::DispatcherConfig;
use crate::proxy::{HeaderProfile, PoolConfig, ProxyPool};
use crate::queue::QueueConfig;
use crate::rate::BucketConfig;
use crate::retry::RetryPolicy;
use crate::scheduler::SeedSpec;
use crate::types::{SourceFamily, Target, TaskPriority};

fn default_workers() -> usize {
    4
}
fn default_visibility_secs() -> u64 {
    60
}
fn default_max_attempts() -> u32 {
    5
}
fn default_backoff_base_ms() -> u64 {
    2_000
}
fn default_backoff_cap_secs() -> u64 {
    300
}
fn default_capacity() -> f64 {
    5.0
}
fn default_refill_per_sec() -> f64 {
    1.0
}
fn default_cooldown_base_secs() -> u64 {
    30
}
fn default_cooldown_cap_secs() -> u64 {
    600
}
fn default_direct_identities() -> usize {
    2
}
fn default_publish_ttl_secs() -> u64 {
    7 * 24 * 3600
}
fn default_fetch_ttl_secs() -> u64 {
    600
}
fn default_fetch_timeout_secs() -> u64 {
    30
}
fn default_recrawl_secs() -> u64 {
    900
}
fn default_priority() -> TaskPriority {
    TaskPriority::Normal
}

#[derive(Debug, Clone, Deserialize)]
pub struct EngineConfig {
    #[serde(default = "default_workers")]
    pub workers: usize,
    #[serde(default)]
    pub queue: QueueSettings,
    #[serde(default)]
    pub rate: RateSettings,
    #[serde(default)]
    pub proxy: ProxySettings,
    #[serde(default)]
    pub dedup: DedupSettings,
    #[serde(default)]
    pub dispatch: DispatchSettings,
    #[serde(default)]
    pub sources: Vec<SourceConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct QueueSettings {
    #[serde(default = "default_visibility_secs")]
    pub visibility_timeout_secs: u64,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,
    #[serde(default = "default_backoff_cap_secs")]
    pub backoff_cap_secs: u64,
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            visibility_timeout_secs: default_visibility_secs(),
            max_attempts: default_max_attempts(),
            backoff_base_ms: default_backoff_base_ms(),
            backoff_cap_secs: default_backoff_cap_secs(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RateSettings {
    #[serde(default = "default_capacity")]
    pub capacity: f64,
    #[serde(default = "default_refill_per_sec")]
    pub refill_per_sec: f64,
}

impl Default for RateSettings {
    fn default() -> Self {
        Self {
            capacity: default_capacity(),
            refill_per_sec: default_refill_per_sec(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProxySettings {
    /// Number of direct (no-proxy) identities when no endpoints are listed.
    #[serde(default = "default_direct_identities")]
    pub direct_identities: usize,
    #[serde(default)]
    pub endpoints: Vec<String>,
    #[serde(default = "default_cooldown_base_secs")]
    pub cooldown_base_secs: u64,
    #[serde(default = "default_cooldown_cap_secs")]
    pub cooldown_cap_secs: u64,
}

impl Default for ProxySettings {
    fn default() -> Self {
        Self {
            direct_identities: default_direct_identities(),
            endpoints: Vec::new(),
            cooldown_base_secs: default_cooldown_base_secs(),
            cooldown_cap_secs: default_cooldown_cap_secs(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct DedupSettings {
    #[serde(default = "default_publish_ttl_secs")]
    pub publish_ttl_secs: u64,
    #[serde(default = "default_fetch_ttl_secs")]
    pub fetch_ttl_secs: u64,
}

impl Default for DedupSettings {
    fn default() -> Self {
        Self {
            publish_ttl_secs: default_publish_ttl_secs(),
            fetch_ttl_secs: default_fetch_ttl_secs(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct DispatchSettings {
    #[serde(default = "default_fetch_timeout_secs")]
    pub fetch_timeout_secs: u64,
}

impl Default for DispatchSettings {
    fn default() -> Self {
        Self {
            fetch_timeout_secs: default_fetch_timeout_secs(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SourceConfig {
    pub id: String,
    pub family: SourceFamily,
    /// Seed URL for the periodic re-crawl.
    pub url: String,
    /// Base for query-descriptor targets, where the source supports search.
    #[serde(default)]
    pub search_base: Option<String>,
    #[serde(default = "default_recrawl_secs")]
    pub recrawl_secs: u64,
    #[serde(default = "default_priority")]
    pub priority: TaskPriority,
    /// Per-source rate override; the global default applies otherwise.
    #[serde(default)]
    pub rate: Option<BucketConfig>,
}

impl EngineConfig {
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let data = fs::read_to_string(path.as_ref()).map_err(|e| {
            anyhow::anyhow!("cannot read config {}: {e}", path.as_ref().display())
        })?;
        let mut cfg: EngineConfig = toml::from_str(&data)?;
        cfg.apply_env();
        cfg.sanitize();
        Ok(cfg)
    }

    /// Config path from `HARVESTER_CONFIG`, falling back to the given
    /// default; a missing file yields the built-in defaults.
    pub fn load_or_default(fallback: &str) -> anyhow::Result<Self> {
        let path = env::var("HARVESTER_CONFIG").unwrap_or_else(|_| fallback.to_string());
        if Path::new(&path).exists() {
            Self::load_from_file(&path)
        } else {
            tracing::warn!(path = %path, "config file not found, using defaults");
            let mut cfg = Self::default();
            cfg.apply_env();
            cfg.sanitize();
            Ok(cfg)
        }
    }

    fn apply_env(&mut self) {
        if let Some(workers) = env_parse::<usize>("HARVESTER_WORKERS") {
            self.workers = workers;
        }
        if let Some(attempts) = env_parse::<u32>("HARVESTER_MAX_ATTEMPTS") {
            self.queue.max_attempts = attempts;
        }
    }

    fn sanitize(&mut self) {
        self.workers = self.workers.max(1);
        self.queue.max_attempts = self.queue.max_attempts.max(1);
        if self.rate.capacity <= 0.0 {
            self.rate.capacity = default_capacity();
        }
        if self.rate.refill_per_sec <= 0.0 {
            self.rate.refill_per_sec = default_refill_per_sec();
        }
        if self.proxy.endpoints.is_empty() && self.proxy.direct_identities == 0 {
            self.proxy.direct_identities = 1;
        }
    }

    pub fn queue_config(&self) -> QueueConfig {
        QueueConfig {
            visibility_timeout: Duration::from_secs(self.queue.visibility_timeout_secs),
            retry: RetryPolicy {
                base: Duration::from_millis(self.queue.backoff_base_ms),
                cap: Duration::from_secs(self.queue.backoff_cap_secs),
                max_attempts: self.queue.max_attempts,
                jitter: true,
            },
        }
    }

    pub fn rate_default(&self) -> BucketConfig {
        BucketConfig {
            capacity: self.rate.capacity,
            refill_per_sec: self.rate.refill_per_sec,
        }
    }

    pub fn rate_overrides(&self) -> HashMap<String, BucketConfig> {
        self.sources
            .iter()
            .filter_map(|s| s.rate.clone().map(|r| (s.id.clone(), r)))
            .collect()
    }

    pub fn pool_config(&self) -> PoolConfig {
        PoolConfig {
            cooldown_base: Duration::from_secs(self.proxy.cooldown_base_secs),
            cooldown_cap: Duration::from_secs(self.proxy.cooldown_cap_secs),
        }
    }

    /// Build the identity pool: one identity per proxy endpoint, or the
    /// configured number of direct identities when none are listed.
    pub fn build_pool(&self) -> ProxyPool {
        let pool_cfg = self.pool_config();
        if self.proxy.endpoints.is_empty() {
            return ProxyPool::direct(self.proxy.direct_identities, pool_cfg);
        }
        let pool = ProxyPool::new(pool_cfg);
        for endpoint in &self.proxy.endpoints {
            pool.add_identity(Some(endpoint.clone()), HeaderProfile::rotated());
        }
        pool
    }

    pub fn publish_ttl(&self) -> Duration {
        Duration::from_secs(self.dedup.publish_ttl_secs)
    }

    pub fn fetch_ttl(&self) -> Duration {
        Duration::from_secs(self.dedup.fetch_ttl_secs)
    }

    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_secs(self.dispatch.fetch_timeout_secs)
    }

    pub fn dispatcher_config(&self) -> DispatcherConfig {
        DispatcherConfig {
            fetch_timeout: self.fetch_timeout(),
            ..DispatcherConfig::default()
        }
    }

    pub fn seeds(&self) -> Vec<SeedSpec> {
        self.sources
            .iter()
            .map(|s| SeedSpec {
                source_id: s.id.clone(),
                target: Target::Url(s.url.clone()),
                priority: s.priority,
                every: Duration::from_secs(s.recrawl_secs.max(1)),
            })
            .collect()
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            queue: QueueSettings::default(),
            rate: RateSettings::default(),
            proxy: ProxySettings::default(),
            dedup: DedupSettings::default(),
            dispatch: DispatchSettings::default(),
            sources: Vec::new(),
        }
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    env::var(key).ok().and_then(|v| v.parse().ok())
}
