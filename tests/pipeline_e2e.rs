// tests/pipeline_e2e.rs
// Full pipeline: queue -> rate -> identity -> fetch -> dedup -> normalize -> sink.

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
use job_harvester::types::{Classification, SourceFamily, Target, TaskPriority};

const FEED: &str = r#"<rss version="2.0"><channel><title>Acme Jobs</title>
  <item><title>Rust Engineer</title><author>Acme</author>
    <description>Location: Remote. Build data pipelines in rust and docker.</description>
    <link>https://acme.example/jobs/1</link>
    <pubDate>Mon, 05 Jan 2026 09:00:00 +0000</pubDate></item>
  <item><title>Platform Engineer</title><author>Acme</author>
    <description>Location: Berlin. Kubernetes and aws for the platform team.</description>
    <link>https://acme.example/jobs/2</link>
    <pubDate>Tue, 06 Jan 2026 10:00:00 +0000</pubDate></item>
</channel></rss>"#;

fn build(
    adapter: Arc<ScriptedAdapter>,
    fetch_ttl: Duration,
) -> (Arc<Dispatcher>, Arc<MemorySink>) {
    let queue = Arc::new(TaskQueue::new(QueueConfig {
        visibility_timeout: Duration::from_secs(300),
        retry: RetryPolicy {
            base: Duration::from_secs(1),
            cap: Duration::from_secs(60),
            max_attempts: 5,
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
        Arc::new(ProxyPool::direct(2, PoolConfig::default())),
        Arc::new(registry),
        Arc::new(InMemoryDedup::new(Duration::from_secs(24 * 3600), fetch_ttl)),
        sink.clone(),
        Arc::new(OutcomeLog::with_capacity(1000)),
        DispatcherConfig::default(),
    ));
    (dispatcher, sink)
}

fn feed_task(dispatcher: &Dispatcher) {
    dispatcher.queue().enqueue(
        "rss-acme",
        Target::Url("https://acme.example/feed".into()),
        TaskPriority::Normal,
    );
}

#[tokio::test(start_paused = true)]
async fn feed_publishes_all_listings_exactly_once() {
    let adapter = Arc::new(ScriptedAdapter::new("rss-acme", SourceFamily::Rss));
    adapter.push(Ok(FEED.as_bytes().to_vec()));
    let (dispatcher, sink) = build(adapter.clone(), Duration::from_secs(600));

    feed_task(&dispatcher);
    let completed = dispatcher.run_until_idle("w1", 100).await;

    assert_eq!(completed, 1);
    assert_eq!(adapter.fetch_count(), 1);
    assert_eq!(sink.len(), 2);
    assert_eq!(sink.publish_calls(), 2);
}

#[tokio::test(start_paused = true)]
async fn repeat_target_within_window_never_hits_the_network() {
    let adapter = Arc::new(ScriptedAdapter::new("rss-acme", SourceFamily::Rss));
    adapter.push(Ok(FEED.as_bytes().to_vec()));
    let (dispatcher, sink) = build(adapter.clone(), Duration::from_secs(600));

    feed_task(&dispatcher);
    feed_task(&dispatcher);
    let completed = dispatcher.run_until_idle("w1", 100).await;

    assert_eq!(completed, 2, "both tasks settle as success");
    assert_eq!(adapter.fetch_count(), 1, "second task short-circuits");
    assert_eq!(sink.publish_calls(), 2, "no re-publish for the repeat");

    let outcomes = dispatcher.outcomes().snapshot_last_n(10);
    assert!(outcomes
        .iter()
        .all(|o| o.classification == Classification::Success));
}

#[tokio::test(start_paused = true)]
async fn identical_content_after_window_is_fetched_but_not_republished() {
    let adapter = Arc::new(ScriptedAdapter::new("rss-acme", SourceFamily::Rss));
    adapter.push(Ok(FEED.as_bytes().to_vec()));
    adapter.push(Ok(FEED.as_bytes().to_vec()));
    // Short fetch window: the second crawl goes to the network again.
    let (dispatcher, sink) = build(adapter.clone(), Duration::from_secs(1));

    feed_task(&dispatcher);
    dispatcher.run_until_idle("w1", 100).await;
    assert_eq!(sink.publish_calls(), 2);

    tokio::time::sleep(Duration::from_secs(5)).await;
    feed_task(&dispatcher);
    dispatcher.run_until_idle("w1", 100).await;

    assert_eq!(adapter.fetch_count(), 2, "window lapsed, refetch happens");
    assert_eq!(
        sink.publish_calls(),
        2,
        "identical bytes are recognized and not normalized again"
    );
    assert_eq!(sink.len(), 2);
}

#[tokio::test(start_paused = true)]
async fn unparseable_payload_settles_terminal() {
    let adapter = Arc::new(ScriptedAdapter::new("rss-acme", SourceFamily::Rss));
    adapter.push(Ok(b"this is not xml".to_vec()));
    let (dispatcher, sink) = build(adapter.clone(), Duration::from_secs(600));

    feed_task(&dispatcher);
    dispatcher.run_until_idle("w1", 100).await;

    assert_eq!(adapter.fetch_count(), 1, "parse failures are not retried");
    assert!(sink.is_empty());
    let outcomes = dispatcher.outcomes().snapshot_last_n(1);
    assert_eq!(outcomes[0].classification, Classification::TerminalFailure);
}
