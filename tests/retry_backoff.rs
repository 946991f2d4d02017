// tests/retry_backoff.rs
// Retry semantics through the dispatcher: attempt accounting, growing
// delays, Retry-After hints, and the attempt ceiling.

use std::sync::Arc;
use std::time::Duration;

use job_harvester::adapters::{AdapterRegistry, ScriptedAdapter};
use job_harvester::dedup::InMemoryDedup;
use job_harvester::dispatch::{Dispatcher, DispatcherConfig};
use job_harvester::outcome::OutcomeLog;
use job_harvester::proxy::{PoolConfig, ProxyPool};
use job_harvester::queue::{QueueConfig, TaskQueue};
use job_harvester::rate::{BucketConfig, RateGovernor};
use job_harvester::retry::RetryPolicy;
use job_harvester::sink::MemorySink;
use job_harvester::types::{Classification, ErrorClass, SourceFamily, Target, TaskPriority};

const FEED: &str = r#"<rss version="2.0"><channel><title>Acme Jobs</title>
  <item><title>Rust Engineer</title><author>Acme</author>
    <description>Location: Remote. Rust backend work.</description>
    <link>https://acme.example/jobs/1</link>
    <pubDate>Mon, 05 Jan 2026 09:00:00 +0000</pubDate></item>
</channel></rss>"#;

const BASE: Duration = Duration::from_secs(1);

fn build(adapter: Arc<ScriptedAdapter>, max_attempts: u32) -> (Arc<Dispatcher>, Arc<MemorySink>) {
    let queue = Arc::new(TaskQueue::new(QueueConfig {
        visibility_timeout: Duration::from_secs(300),
        retry: RetryPolicy {
            base: BASE,
            cap: Duration::from_secs(120),
            max_attempts,
            jitter: false,
        },
    }));
    let mut registry = AdapterRegistry::new();
    registry.register(adapter);
    let sink = Arc::new(MemorySink::new());
    let dispatcher = Arc::new(Dispatcher::new(
        queue,
        Arc::new(RateGovernor::new(BucketConfig {
            capacity: 100.0,
            refill_per_sec: 100.0,
        })),
        Arc::new(ProxyPool::direct(4, PoolConfig::default())),
        Arc::new(registry),
        Arc::new(InMemoryDedup::new(
            Duration::from_secs(24 * 3600),
            Duration::from_secs(600),
        )),
        sink.clone(),
        Arc::new(OutcomeLog::with_capacity(1000)),
        DispatcherConfig::default(),
    ));
    (dispatcher, sink)
}

fn enqueue(dispatcher: &Dispatcher) {
    dispatcher.queue().enqueue(
        "rss-acme",
        Target::Url("https://acme.example/feed".into()),
        TaskPriority::Normal,
    );
}

#[tokio::test(start_paused = true)]
async fn rate_limited_thrice_then_succeeds_with_growing_delays() {
    let adapter = Arc::new(ScriptedAdapter::new("rss-acme", SourceFamily::Rss));
    for _ in 0..3 {
        adapter.push(Err(ErrorClass::RateLimited { retry_after: None }));
    }
    adapter.push(Ok(FEED.as_bytes().to_vec()));
    let (dispatcher, sink) = build(adapter.clone(), 5);

    enqueue(&dispatcher);
    let completed = dispatcher.run_until_idle("w1", 1000).await;

    assert_eq!(completed, 1);
    assert_eq!(adapter.fetch_count(), 4, "three failures then the success");
    assert_eq!(sink.len(), 1);
    assert_eq!(dispatcher.queue().stats().acked, 1);
    assert_eq!(dispatcher.queue().stats().exhausted, 0);

    // Gaps between attempts follow the exponential schedule.
    let times = adapter.fetch_times();
    let gaps: Vec<Duration> = times.windows(2).map(|w| w[1] - w[0]).collect();
    assert_eq!(gaps.len(), 3);
    for (i, gap) in gaps.iter().enumerate() {
        let expected = BASE * 2u32.pow(i as u32 + 1);
        assert!(
            *gap >= expected,
            "gap {i} = {gap:?}, expected at least {expected:?}"
        );
    }
    assert!(gaps[0] < gaps[1] && gaps[1] < gaps[2], "delays grow: {gaps:?}");
}

#[tokio::test(start_paused = true)]
async fn retry_after_hint_stretches_the_next_attempt() {
    let adapter = Arc::new(ScriptedAdapter::new("rss-acme", SourceFamily::Rss));
    adapter.push(Err(ErrorClass::RateLimited {
        retry_after: Some(Duration::from_secs(30)),
    }));
    adapter.push(Ok(FEED.as_bytes().to_vec()));
    let (dispatcher, _) = build(adapter.clone(), 5);

    enqueue(&dispatcher);
    dispatcher.run_until_idle("w1", 1000).await;

    let times = adapter.fetch_times();
    assert_eq!(times.len(), 2);
    assert!(
        times[1] - times[0] >= Duration::from_secs(30),
        "the upstream hint is honored over the shorter backoff"
    );
}

#[tokio::test(start_paused = true)]
async fn server_errors_exhaust_to_terminal_at_the_ceiling() {
    let adapter = Arc::new(ScriptedAdapter::new("rss-acme", SourceFamily::Rss));
    for _ in 0..10 {
        adapter.push(Err(ErrorClass::ServerError));
    }
    let (dispatcher, sink) = build(adapter.clone(), 3);

    enqueue(&dispatcher);
    let completed = dispatcher.run_until_idle("w1", 1000).await;

    assert_eq!(completed, 1);
    assert_eq!(adapter.fetch_count(), 3, "the ceiling bounds total attempts");
    assert!(sink.is_empty());
    assert_eq!(dispatcher.queue().stats().exhausted, 1);
    let outcomes = dispatcher.outcomes().snapshot_last_n(1);
    assert_eq!(outcomes[0].classification, Classification::TerminalFailure);
}

#[tokio::test(start_paused = true)]
async fn not_found_is_terminal_on_the_first_attempt() {
    let adapter = Arc::new(ScriptedAdapter::new("rss-acme", SourceFamily::Rss));
    adapter.push(Err(ErrorClass::NotFound));
    adapter.push(Ok(FEED.as_bytes().to_vec())); // must never be reached
    let (dispatcher, sink) = build(adapter.clone(), 5);

    enqueue(&dispatcher);
    dispatcher.run_until_idle("w1", 1000).await;

    assert_eq!(adapter.fetch_count(), 1);
    assert!(sink.is_empty());
}
