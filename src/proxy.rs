//! # Proxy / Identity Pool
//! Rotating egress identities (proxy endpoint + request headers) with health
//! scoring and cooldown.
//!
//! Checkout prefers the healthiest identity not in cooldown, round-robin on
//! ties so load spreads. A failure release (block/ban signal) drops health
//! sharply and starts a cooldown whose penalty grows with consecutive
//! failures; success restores health toward the maximum. When nothing is
//! eligible, checkout returns `None` — the caller re-queues with a delay
//! instead of busy-waiting.

use std::sync::Mutex;
use std::time::Duration;

use metrics::counter;
use rand::Rng;
use tokio::time::Instant;

const HEALTH_MAX: f64 = 1.0;
const HEALTH_FAILURE_DROP: f64 = 0.4;
const HEALTH_SUCCESS_GAIN: f64 = 0.2;
/// Floor applied when a cooldown lapses, so a penalized identity re-enters
/// rotation instead of being starved forever by healthier peers.
const HEALTH_REVIVE_FLOOR: f64 = 0.25;

/// Signal the dispatcher reports back on release.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdentityOutcome {
    /// The fetch went through (or failed for reasons unrelated to the
    /// identity, e.g. a 404).
    Healthy,
    /// Block/ban/throttle signal attributable to this identity.
    Blocked,
}

/// Request-header profile rotated across identities.
#[derive(Debug, Clone, serde::Deserialize)]
pub struct HeaderProfile {
    pub user_agent: String,
    #[serde(default = "default_accept_language")]
    pub accept_language: String,
}

fn default_accept_language() -> String {
    "en-US,en;q=0.9".to_string()
}

/// Browser user agents cycled across identities so repeated fetches do not
/// present a single fingerprint.
const USER_AGENTS: &[&str] = &[
    "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0 Safari/537.36",
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/121.0 Safari/537.36",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/17.2 Safari/605.1.15",
    "Mozilla/5.0 (X11; Linux x86_64; rv:122.0) Gecko/20100101 Firefox/122.0",
];

impl HeaderProfile {
    /// Profile with a user agent drawn from the rotation list.
    pub fn rotated() -> Self {
        let idx = rand::rng().random_range(0..USER_AGENTS.len());
        Self {
            user_agent: USER_AGENTS[idx].to_string(),
            accept_language: default_accept_language(),
        }
    }
}

impl Default for HeaderProfile {
    fn default() -> Self {
        Self {
            user_agent: USER_AGENTS[0].to_string(),
            accept_language: default_accept_language(),
        }
    }
}

/// An egress identity handed to adapters for one fetch.
#[derive(Debug, Clone)]
pub struct Identity {
    pub id: usize,
    pub proxy_endpoint: Option<String>,
    pub header_profile: HeaderProfile,
}

#[derive(Debug)]
struct IdentityState {
    identity: Identity,
    health: f64,
    cooldown_until: Option<Instant>,
    consecutive_failures: u32,
    /// Checkout counter value at last use; smallest wins ties (round-robin).
    last_used_seq: u64,
}

#[derive(Debug, Clone, Copy)]
pub struct PoolConfig {
    /// Cooldown for the first failure; doubles per consecutive failure.
    pub cooldown_base: Duration,
    pub cooldown_cap: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            cooldown_base: Duration::from_secs(30),
            cooldown_cap: Duration::from_secs(600),
        }
    }
}

#[derive(Debug, Default)]
struct Inner {
    identities: Vec<IdentityState>,
    checkout_seq: u64,
}

#[derive(Debug)]
pub struct ProxyPool {
    inner: Mutex<Inner>,
    cfg: PoolConfig,
}

impl ProxyPool {
    pub fn new(cfg: PoolConfig) -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            cfg,
        }
    }

    /// Pool with `n` direct (proxyless) identities cycling default headers.
    /// Useful for tests and proxy-free deployments.
    pub fn direct(n: usize, cfg: PoolConfig) -> Self {
        let pool = Self::new(cfg);
        for _ in 0..n {
            pool.add_identity(None, HeaderProfile::default());
        }
        pool
    }

    pub fn add_identity(&self, proxy_endpoint: Option<String>, header_profile: HeaderProfile) {
        let mut inner = self.lock();
        let id = inner.identities.len();
        inner.identities.push(IdentityState {
            identity: Identity {
                id,
                proxy_endpoint,
                header_profile,
            },
            health: HEALTH_MAX,
            cooldown_until: None,
            consecutive_failures: 0,
            last_used_seq: 0,
        });
    }

    pub fn checkout(&self, source_id: &str) -> Option<Identity> {
        self.checkout_at(source_id, Instant::now())
    }

    /// Select the healthiest identity not in cooldown; round-robin on ties.
    /// `None` is the pool's backpressure signal.
    pub fn checkout_at(&self, source_id: &str, now: Instant) -> Option<Identity> {
        let mut inner = self.lock();
        inner.checkout_seq += 1;
        let seq = inner.checkout_seq;

        // Lapsed cooldowns re-enter rotation with a health floor.
        for st in inner.identities.iter_mut() {
            if matches!(st.cooldown_until, Some(until) if until <= now) {
                st.cooldown_until = None;
                st.consecutive_failures = 0;
                st.health = st.health.max(HEALTH_REVIVE_FLOOR);
            }
        }

        let best = inner
            .identities
            .iter_mut()
            .filter(|st| st.cooldown_until.is_none())
            .min_by(|a, b| {
                b.health
                    .partial_cmp(&a.health)
                    .unwrap_or(std::cmp::Ordering::Equal)
                    .then(a.last_used_seq.cmp(&b.last_used_seq))
            });

        match best {
            Some(st) => {
                st.last_used_seq = seq;
                Some(st.identity.clone())
            }
            None => {
                counter!("harvester_proxy_unavailable_total", "source" => source_id.to_string())
                    .increment(1);
                None
            }
        }
    }

    pub fn release(&self, identity: &Identity, outcome: IdentityOutcome) {
        self.release_at(identity, outcome, Instant::now())
    }

    pub fn release_at(&self, identity: &Identity, outcome: IdentityOutcome, now: Instant) {
        let mut inner = self.lock();
        let Some(st) = inner.identities.get_mut(identity.id) else {
            return;
        };
        match outcome {
            IdentityOutcome::Healthy => {
                st.consecutive_failures = 0;
                st.health = (st.health + HEALTH_SUCCESS_GAIN).min(HEALTH_MAX);
            }
            IdentityOutcome::Blocked => {
                st.consecutive_failures += 1;
                st.health = (st.health - HEALTH_FAILURE_DROP).max(0.0);
                let penalty = self.penalty_for(st.consecutive_failures);
                st.cooldown_until = Some(now + penalty);
                tracing::warn!(
                    identity = identity.id,
                    consecutive_failures = st.consecutive_failures,
                    penalty_secs = penalty.as_secs(),
                    "identity entered cooldown"
                );
                counter!("harvester_identity_cooldowns_total").increment(1);
            }
        }
    }

    /// Number of identities currently eligible for checkout.
    pub fn available_at(&self, now: Instant) -> usize {
        self.lock()
            .identities
            .iter()
            .filter(|st| !matches!(st.cooldown_until, Some(until) if until > now))
            .count()
    }

    pub fn len(&self) -> usize {
        self.lock().identities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn penalty_for(&self, consecutive_failures: u32) -> Duration {
        let factor = 2u32.saturating_pow(consecutive_failures.saturating_sub(1).min(10));
        (self.cfg.cooldown_base * factor).min(self.cfg.cooldown_cap)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().expect("proxy pool mutex poisoned")
    }
}
