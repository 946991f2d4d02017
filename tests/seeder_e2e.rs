// tests/seeder_e2e.rs
// Re-crawl seeding feeding the live pipeline: first crawl publishes, the
// next seeded crawl inside the fetch window does no network work.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;

use job_harvester::adapters::{AdapterRegistry, ScriptedAdapter};
use job_harvester::dedup::InMemoryDedup;
use job_harvester::dispatch::{Dispatcher, DispatcherConfig};
use job_harvester::outcome::OutcomeLog;
use job_harvester::proxy::{PoolConfig, ProxyPool};
use job_harvester::queue::{QueueConfig, TaskQueue};
use job_harvester::rate::{BucketConfig, RateGovernor};
use job_harvester::scheduler::{SeedSpec, Seeder};
use job_harvester::sink::MemorySink;
use job_harvester::types::{SourceFamily, Target, TaskPriority};

const FEED: &str = r#"<rss version="2.0"><channel><title>Acme Jobs</title>
  <item><title>Rust Engineer</title><author>Acme</author>
    <description>Location: Remote. Rust backend work.</description>
    <link>https://acme.example/jobs/1</link>
    <pubDate>Mon, 05 Jan 2026 09:00:00 +0000</pubDate></item>
</channel></rss>"#;

#[tokio::test(start_paused = true)]
async fn seeded_recrawl_publishes_once_then_coasts_on_the_cache() {
    let adapter = Arc::new(ScriptedAdapter::new("rss-acme", SourceFamily::Rss));
    adapter.push(Ok(FEED.as_bytes().to_vec()));

    let queue = Arc::new(TaskQueue::new(QueueConfig::default()));
    let mut registry = AdapterRegistry::new();
    registry.register(adapter.clone());
    let sink = Arc::new(MemorySink::new());
    let dispatcher = Arc::new(Dispatcher::new(
        queue.clone(),
        Arc::new(RateGovernor::new(BucketConfig {
            capacity: 100.0,
            refill_per_sec: 100.0,
        })),
        Arc::new(ProxyPool::direct(2, PoolConfig::default())),
        Arc::new(registry),
        // Fetch window longer than the re-crawl interval.
        Arc::new(InMemoryDedup::new(
            Duration::from_secs(24 * 3600),
            Duration::from_secs(300),
        )),
        sink.clone(),
        Arc::new(OutcomeLog::with_capacity(1000)),
        DispatcherConfig::default(),
    ));

    let now = Instant::now();
    let mut seeder = Seeder::new(
        vec![SeedSpec {
            source_id: "rss-acme".to_string(),
            target: Target::Url("https://acme.example/feed".into()),
            priority: TaskPriority::Normal,
            every: Duration::from_secs(60),
        }],
        now,
    );

    // First seeded crawl does the real work.
    assert_eq!(seeder.tick_at(&queue, now), 1);
    dispatcher.run_until_idle("w1", 100).await;
    assert_eq!(sink.len(), 1);
    assert_eq!(adapter.fetch_count(), 1);

    // The next interval's crawl lands inside the fetch window.
    tokio::time::sleep(Duration::from_secs(60)).await;
    assert_eq!(seeder.tick_at(&queue, Instant::now()), 1);
    dispatcher.run_until_idle("w1", 100).await;

    assert_eq!(adapter.fetch_count(), 1, "cached target, no second fetch");
    assert_eq!(sink.len(), 1);
    assert!(queue.is_idle());
}
