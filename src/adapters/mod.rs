//! # Source Adapters
//! One adapter per source family (RSS pull, HTML scrape, JSON API), all
//! behind the `SourceAdapter` capability. Adapters fetch and report a raw
//! `ErrorClass` from the fixed vocabulary — retry policy is decided by the
//! dispatcher, never here.

pub mod api;
pub mod html;
pub mod rss;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::proxy::Identity;
use crate::types::{ErrorClass, RawPayload, SourceFamily, Target};

/// Polymorphic fetch capability; one implementation per source family.
#[async_trait]
pub trait SourceAdapter: Send + Sync {
    fn source_id(&self) -> &str;
    fn family(&self) -> SourceFamily;
    async fn fetch(&self, target: &Target, identity: &Identity) -> Result<RawPayload, ErrorClass>;
}

/// Mapping from source id to adapter, built at startup.
#[derive(Default)]
pub struct AdapterRegistry {
    map: HashMap<String, Arc<dyn SourceAdapter>>,
}

impl AdapterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, adapter: Arc<dyn SourceAdapter>) {
        self.map.insert(adapter.source_id().to_string(), adapter);
    }

    pub fn get(&self, source_id: &str) -> Option<Arc<dyn SourceAdapter>> {
        self.map.get(source_id).cloned()
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}

/// Where an adapter's bytes come from: embedded fixture (tests, offline
/// runs) or live HTTP.
#[derive(Debug, Clone)]
pub enum FetchMode {
    Fixture(String),
    Http { timeout: Duration },
}

/// Map an HTTP status to the error vocabulary. `Ok(())` means proceed with
/// the body. Non-retryable 4xx fold into `NotFound` — the terminal bucket.
pub fn classify_status(status: u16, retry_after: Option<Duration>) -> Result<(), ErrorClass> {
    match status {
        200..=299 => Ok(()),
        429 => Err(ErrorClass::RateLimited { retry_after }),
        401 | 403 | 407 | 451 => Err(ErrorClass::Blocked),
        500..=599 => Err(ErrorClass::ServerError),
        _ => Err(ErrorClass::NotFound),
    }
}

/// Resolve a target to a URL. Query descriptors need a configured search
/// base; a query against an adapter without one is a malformed target
/// (terminal).
pub(crate) fn target_url(base_url: Option<&str>, target: &Target) -> Result<String, ErrorClass> {
    match target {
        Target::Url(u) => Ok(u.clone()),
        Target::Query {
            terms,
            location,
            page,
        } => {
            let base = base_url.ok_or(ErrorClass::NotFound)?;
            Ok(format!(
                "{base}?q={}&l={}&page={page}",
                urlencode(terms),
                urlencode(location)
            ))
        }
    }
}

fn urlencode(s: &str) -> String {
    // Conservative form-encoding for query parameters.
    s.chars()
        .map(|c| match c {
            'a'..='z' | 'A'..='Z' | '0'..='9' | '-' | '_' | '.' | '~' => c.to_string(),
            ' ' => "+".to_string(),
            other => format!("%{:02X}", other as u32),
        })
        .collect()
}

/// Shared HTTP GET with the identity's egress configuration applied.
pub(crate) async fn http_get(
    url: &str,
    identity: &Identity,
    timeout: Duration,
) -> Result<Vec<u8>, ErrorClass> {
    let mut builder = reqwest::Client::builder().timeout(timeout);
    if let Some(endpoint) = &identity.proxy_endpoint {
        let proxy = reqwest::Proxy::all(endpoint).map_err(|_| ErrorClass::ServerError)?;
        builder = builder.proxy(proxy);
    }
    let client = builder.build().map_err(|_| ErrorClass::ServerError)?;

    let resp = client
        .get(url)
        .header(reqwest::header::USER_AGENT, &identity.header_profile.user_agent)
        .header(
            reqwest::header::ACCEPT_LANGUAGE,
            &identity.header_profile.accept_language,
        )
        .send()
        .await
        .map_err(|e| {
            if e.is_timeout() {
                ErrorClass::Timeout
            } else {
                ErrorClass::ServerError
            }
        })?;

    let retry_after = resp
        .headers()
        .get(reqwest::header::RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.parse::<u64>().ok())
        .map(Duration::from_secs);
    classify_status(resp.status().as_u16(), retry_after)?;

    resp.bytes()
        .await
        .map(|b| b.to_vec())
        .map_err(|_| ErrorClass::ServerError)
}

// --- Test helper ---

/// Adapter replaying a scripted sequence of results; used by the pipeline
/// tests to exercise retry and dedup paths without any network.
pub struct ScriptedAdapter {
    source_id: String,
    family: SourceFamily,
    script: std::sync::Mutex<std::collections::VecDeque<Result<Vec<u8>, ErrorClass>>>,
    fetch_times: std::sync::Mutex<Vec<tokio::time::Instant>>,
}

impl ScriptedAdapter {
    pub fn new(source_id: &str, family: SourceFamily) -> Self {
        Self {
            source_id: source_id.to_string(),
            family,
            script: std::sync::Mutex::new(std::collections::VecDeque::new()),
            fetch_times: std::sync::Mutex::new(Vec::new()),
        }
    }

    pub fn push(&self, step: Result<Vec<u8>, ErrorClass>) {
        self.script.lock().expect("script mutex poisoned").push_back(step);
    }

    pub fn fetch_count(&self) -> usize {
        self.fetch_times.lock().expect("script mutex poisoned").len()
    }

    /// Instants at which `fetch` was invoked, for delay assertions.
    pub fn fetch_times(&self) -> Vec<tokio::time::Instant> {
        self.fetch_times.lock().expect("script mutex poisoned").clone()
    }
}

#[async_trait]
impl SourceAdapter for ScriptedAdapter {
    fn source_id(&self) -> &str {
        &self.source_id
    }

    fn family(&self) -> SourceFamily {
        self.family
    }

    async fn fetch(&self, target: &Target, _identity: &Identity) -> Result<RawPayload, ErrorClass> {
        self.fetch_times
            .lock()
            .expect("script mutex poisoned")
            .push(tokio::time::Instant::now());
        let step = self
            .script
            .lock()
            .expect("script mutex poisoned")
            .pop_front()
            .unwrap_or(Err(ErrorClass::NotFound));
        step.map(|bytes| RawPayload::new(&self.source_id, target.clone(), bytes))
    }
}
