// src/lib.rs
// Public library surface for integration tests (and potential reuse).

pub mod adapters;
pub mod config;
pub mod dedup;
pub mod dispatch;
pub mod metrics;
pub mod normalize;
pub mod outcome;
pub mod proxy;
pub mod queue;
pub mod rate;
pub mod retry;
pub mod scheduler;
pub mod sink;
pub mod types;

// ---- Re-exports for stable public API ----
pub use crate::dispatch::{Dispatcher, DispatcherConfig, PollResult};
pub use crate::queue::{NackResult, QueueConfig, TaskQueue};
pub use crate::types::{
    Classification, ErrorClass, NormalizedListing, RawPayload, ScrapeTask, SourceFamily, Target,
    TaskOutcome, TaskPriority,
};
