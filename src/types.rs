//! Core data model for the scrape pipeline.
//!
//! Everything here is plain data: tasks, payloads, outcomes and the fixed
//! error vocabulary adapters report from. Policy (retry decisions, health
//! scoring) lives in the components that own the state.

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use tokio::time::Instant;

/// Unique task identifier, assigned by the queue on enqueue.
pub type TaskId = u64;

/// Scheduling priority. Ordering matters: `High > Normal > Low`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskPriority {
    Low,
    Normal,
    High,
}

impl Default for TaskPriority {
    fn default() -> Self {
        TaskPriority::Normal
    }
}

/// Source family a task belongs to; selects the adapter and normalizer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceFamily {
    Rss,
    Html,
    Api,
}

/// What a task should fetch: either a concrete URL or a query descriptor
/// (search terms + location + page) the adapter turns into a request.
#[derive(Debug, Clone, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(untagged)]
pub enum Target {
    Url(String),
    Query {
        terms: String,
        location: String,
        page: u32,
    },
}

impl Target {
    /// Stable key for dedup/fingerprinting. Two tasks with the same key hit
    /// the same upstream resource.
    pub fn cache_key(&self) -> String {
        match self {
            Target::Url(u) => u.clone(),
            Target::Query {
                terms,
                location,
                page,
            } => format!("q:{terms}|l:{location}|p:{page}"),
        }
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.cache_key())
    }
}

/// Lifecycle state of a task. Transitions are owned by the queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    Pending,
    Leased,
    Succeeded,
    Failed,
}

/// A unit of scrape work.
#[derive(Debug, Clone)]
pub struct ScrapeTask {
    pub id: TaskId,
    pub source_id: String,
    pub target: Target,
    pub priority: TaskPriority,
    pub attempt_count: u32,
    /// Earliest instant the task may be dequeued again.
    pub not_before: Instant,
    pub state: TaskState,
}

/// Fixed error vocabulary adapters report from. Adapters never decide retry
/// policy; the dispatcher's classifier is the single authority.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ErrorClass {
    Timeout,
    Blocked,
    NotFound,
    /// Upstream 429. May carry a server-provided `Retry-After` hint.
    RateLimited { retry_after: Option<Duration> },
    ServerError,
    ParseUnavailable,
}

impl fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorClass::Timeout => write!(f, "timeout"),
            ErrorClass::Blocked => write!(f, "blocked"),
            ErrorClass::NotFound => write!(f, "not_found"),
            ErrorClass::RateLimited { .. } => write!(f, "rate_limited"),
            ErrorClass::ServerError => write!(f, "server_error"),
            ErrorClass::ParseUnavailable => write!(f, "parse_unavailable"),
        }
    }
}

/// Terminal classification of one processing attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Classification {
    Success,
    RetryableFailure,
    TerminalFailure,
}

impl fmt::Display for Classification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Classification::Success => write!(f, "success"),
            Classification::RetryableFailure => write!(f, "retryable_failure"),
            Classification::TerminalFailure => write!(f, "terminal_failure"),
        }
    }
}

/// Raw bytes pulled from a source, plus the content hash used for
/// fingerprinting. Transient: consumed by dedup and the normalizer.
#[derive(Debug, Clone)]
pub struct RawPayload {
    pub source_id: String,
    pub target: Target,
    pub fetched_at: DateTime<Utc>,
    pub content_bytes: Vec<u8>,
    pub content_hash: String,
}

impl RawPayload {
    pub fn new(source_id: &str, target: Target, content_bytes: Vec<u8>) -> Self {
        let content_hash = hex::encode(Sha256::digest(&content_bytes));
        Self {
            source_id: source_id.to_string(),
            target,
            fetched_at: Utc::now(),
            content_bytes,
            content_hash,
        }
    }

    pub fn content_str(&self) -> std::borrow::Cow<'_, str> {
        String::from_utf8_lossy(&self.content_bytes)
    }
}

/// A job listing in canonical form, ready for the sink.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct NormalizedListing {
    pub listing_id: String,
    pub title: String,
    pub company: String,
    pub location: String,
    pub description: String,
    pub posted_at: DateTime<Utc>,
    pub source_url: String,
    pub normalized_at: DateTime<Utc>,
    pub skills: Vec<String>,
}

impl NormalizedListing {
    /// Content equality ignoring `normalized_at`, used by the sink to decide
    /// between `AlreadyStored` and a conflict.
    pub fn content_eq(&self, other: &Self) -> bool {
        self.listing_id == other.listing_id
            && self.title == other.title
            && self.company == other.company
            && self.location == other.location
            && self.description == other.description
            && self.posted_at == other.posted_at
            && self.source_url == other.source_url
            && self.skills == other.skills
    }
}

/// Result of one dispatcher pass over a task, emitted for observability and
/// retained in the outcome log.
#[derive(Debug, Clone)]
pub struct TaskOutcome {
    pub task_id: TaskId,
    pub source_id: String,
    pub classification: Classification,
    pub error_detail: Option<String>,
    pub duration: Duration,
    pub timestamp: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn target_cache_key_distinguishes_queries() {
        let a = Target::Query {
            terms: "rust engineer".into(),
            location: "remote".into(),
            page: 1,
        };
        let b = Target::Query {
            terms: "rust engineer".into(),
            location: "remote".into(),
            page: 2,
        };
        assert_ne!(a.cache_key(), b.cache_key());
        assert_eq!(Target::Url("https://x/y".into()).cache_key(), "https://x/y");
    }

    #[test]
    fn payload_hash_is_stable_over_bytes() {
        let p1 = RawPayload::new("acme", Target::Url("https://a".into()), b"hello".to_vec());
        let p2 = RawPayload::new("acme", Target::Url("https://a".into()), b"hello".to_vec());
        let p3 = RawPayload::new("acme", Target::Url("https://a".into()), b"other".to_vec());
        assert_eq!(p1.content_hash, p2.content_hash);
        assert_ne!(p1.content_hash, p3.content_hash);
    }

    #[test]
    fn priority_orders_high_above_normal() {
        assert!(TaskPriority::High > TaskPriority::Normal);
        assert!(TaskPriority::Normal > TaskPriority::Low);
    }
}
