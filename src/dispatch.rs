//! # Dispatcher
//! The pipeline driver: pulls tasks off the queue, pushes them through
//! rate limiting, identity checkout, fetch, dedup, normalization and the
//! sink, and settles every attempt with exactly one `ack`, `nack` or
//! `requeue`. Retry decisions live here and in `retry` — adapters only
//! report what happened.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use metrics::histogram;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::adapters::AdapterRegistry;
use crate::dedup::{fingerprint, DedupCache};
use crate::outcome::OutcomeLog;
use crate::proxy::{Identity, IdentityOutcome, ProxyPool};
use crate::queue::{NackResult, TaskQueue};
use crate::rate::RateGovernor;
use crate::retry::classify;
use crate::sink::{PublishResult, Sink};
use crate::types::{Classification, ErrorClass, RawPayload, ScrapeTask, SourceFamily, TaskOutcome};

#[derive(Debug, Clone, Copy)]
pub struct DispatcherConfig {
    /// Hard ceiling on a single fetch; overruns become `ErrorClass::Timeout`.
    pub fetch_timeout: Duration,
    /// Ceiling on a single sink publish call.
    pub publish_timeout: Duration,
    /// Requeue delay when the rate governor denies a token.
    pub rate_denied_delay: Duration,
    /// Requeue delay when no identity is available for checkout.
    pub proxy_unavailable_delay: Duration,
    /// Worker sleep when the queue hands out nothing.
    pub idle_poll: Duration,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            fetch_timeout: Duration::from_secs(30),
            publish_timeout: Duration::from_secs(10),
            rate_denied_delay: Duration::from_secs(1),
            proxy_unavailable_delay: Duration::from_secs(5),
            idle_poll: Duration::from_millis(250),
        }
    }
}

/// What a single poll step did, for loop control and tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollResult {
    /// The task reached a final classification this attempt.
    Completed(Classification),
    /// The task went back to the queue: backpressure or a retryable failure.
    Deferred,
}

pub struct Dispatcher {
    queue: Arc<TaskQueue>,
    governor: Arc<RateGovernor>,
    pool: Arc<ProxyPool>,
    adapters: Arc<AdapterRegistry>,
    dedup: Arc<dyn DedupCache>,
    sink: Arc<dyn Sink>,
    outcomes: Arc<OutcomeLog>,
    cfg: DispatcherConfig,
}

impl Dispatcher {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        queue: Arc<TaskQueue>,
        governor: Arc<RateGovernor>,
        pool: Arc<ProxyPool>,
        adapters: Arc<AdapterRegistry>,
        dedup: Arc<dyn DedupCache>,
        sink: Arc<dyn Sink>,
        outcomes: Arc<OutcomeLog>,
        cfg: DispatcherConfig,
    ) -> Self {
        Self {
            queue,
            governor,
            pool,
            adapters,
            dedup,
            sink,
            outcomes,
            cfg,
        }
    }

    pub fn queue(&self) -> &Arc<TaskQueue> {
        &self.queue
    }

    pub fn outcomes(&self) -> &Arc<OutcomeLog> {
        &self.outcomes
    }

    /// One full pipeline step: dequeue and settle a single task attempt.
    /// Returns `None` when the queue had nothing eligible.
    pub async fn poll_once(&self, worker_id: &str) -> Option<PollResult> {
        let task = self.queue.dequeue(worker_id)?;
        let started = Instant::now();
        let target_key = task.target.cache_key();

        // Request dedup: the same target fetched moments ago by another
        // task is not worth a second network round-trip.
        if self.dedup.recently_fetched(&task.source_id, &target_key) {
            self.queue.ack(task.id);
            self.settle(&task, started, Classification::Success, Some("recently fetched, skipped".into()));
            return Some(PollResult::Completed(Classification::Success));
        }

        // Adapter lookup before any resource is consumed.
        let Some(adapter) = self.adapters.get(&task.source_id) else {
            self.queue.ack(task.id);
            self.settle(
                &task,
                started,
                Classification::TerminalFailure,
                Some("no adapter registered for source".into()),
            );
            return Some(PollResult::Completed(Classification::TerminalFailure));
        };

        if !self.governor.acquire(&task.source_id) {
            tracing::debug!(task_id = task.id, source_id = %task.source_id, "rate token denied, requeueing");
            self.queue.requeue(task.id, self.cfg.rate_denied_delay);
            return Some(PollResult::Deferred);
        }

        let Some(identity) = self.pool.checkout(&task.source_id) else {
            tracing::debug!(task_id = task.id, source_id = %task.source_id, "no identity available, requeueing");
            self.queue.requeue(task.id, self.cfg.proxy_unavailable_delay);
            return Some(PollResult::Deferred);
        };

        let fetched = self.fetch(adapter.as_ref(), &task, &identity).await;
        self.pool.release(&identity, identity_outcome(&fetched));

        let result = match fetched {
            Err(class) => self.settle_error(&task, class, started),
            Ok(payload) => {
                self.finish_payload(&task, payload, adapter.family(), started)
                    .await
            }
        };
        Some(result)
    }

    async fn fetch(
        &self,
        adapter: &dyn crate::adapters::SourceAdapter,
        task: &ScrapeTask,
        identity: &Identity,
    ) -> Result<RawPayload, ErrorClass> {
        let start = Instant::now();
        let outcome =
            match tokio::time::timeout(self.cfg.fetch_timeout, adapter.fetch(&task.target, identity))
                .await
            {
                Ok(r) => r,
                Err(_) => Err(ErrorClass::Timeout),
            };
        histogram!("harvester_fetch_duration_ms", "source" => task.source_id.clone())
            .record(start.elapsed().as_millis() as f64);
        outcome
    }

    fn settle_error(&self, task: &ScrapeTask, class: ErrorClass, started: Instant) -> PollResult {
        match classify(&class) {
            Classification::TerminalFailure => {
                self.queue.ack(task.id);
                self.settle(
                    task,
                    started,
                    Classification::TerminalFailure,
                    Some(class.to_string()),
                );
                PollResult::Completed(Classification::TerminalFailure)
            }
            _ => {
                let hint = match &class {
                    ErrorClass::RateLimited { retry_after } => *retry_after,
                    _ => None,
                };
                self.fail_retryable(task, class.to_string(), hint, started)
            }
        }
    }

    /// Nack a retryable failure. The queue owns the attempt ceiling; when it
    /// reports exhaustion the failure is recorded as terminal here.
    fn fail_retryable(
        &self,
        task: &ScrapeTask,
        detail: String,
        hint: Option<Duration>,
        started: Instant,
    ) -> PollResult {
        match self.queue.nack(task.id, hint) {
            Some(NackResult::Requeued {
                attempt_count,
                delay,
            }) => {
                tracing::info!(
                    task_id = task.id,
                    source_id = %task.source_id,
                    attempt_count,
                    delay_ms = delay.as_millis() as u64,
                    detail = %detail,
                    "retryable failure, backing off"
                );
                self.settle(
                    task,
                    started,
                    Classification::RetryableFailure,
                    Some(detail),
                );
                PollResult::Deferred
            }
            Some(NackResult::Terminal { attempt_count }) => {
                self.settle(
                    task,
                    started,
                    Classification::TerminalFailure,
                    Some(format!("{detail} (gave up after {attempt_count} attempts)")),
                );
                PollResult::Completed(Classification::TerminalFailure)
            }
            None => {
                // Lease expired mid-flight; the queue already re-exposed the
                // task, so this attempt just goes unrecorded.
                tracing::warn!(task_id = task.id, "lease lost before nack");
                PollResult::Deferred
            }
        }
    }

    async fn finish_payload(
        &self,
        task: &ScrapeTask,
        payload: RawPayload,
        family: SourceFamily,
        started: Instant,
    ) -> PollResult {
        let target_key = task.target.cache_key();

        let fp = fingerprint(&task.source_id, &target_key, &payload.content_hash);
        if !self.dedup.should_publish(&fp) {
            self.dedup.record_fetch(&task.source_id, &target_key);
            self.queue.ack(task.id);
            self.settle(task, started, Classification::Success, Some("duplicate content".into()));
            return PollResult::Completed(Classification::Success);
        }

        let report = match crate::normalize::normalize(family, &payload, &fp, Utc::now()) {
            Ok(r) => r,
            Err(e) => {
                // The payload as a whole was unusable; the content may be
                // fine on the next crawl, but re-fetching identical bytes
                // will fail identically, so this is terminal.
                self.dedup.record_fetch(&task.source_id, &target_key);
                self.queue.ack(task.id);
                self.settle(
                    task,
                    started,
                    Classification::TerminalFailure,
                    Some(e.to_string()),
                );
                return PollResult::Completed(Classification::TerminalFailure);
            }
        };

        for listing in &report.listings {
            let published =
                match tokio::time::timeout(self.cfg.publish_timeout, self.sink.publish(listing))
                    .await
                {
                    Ok(r) => r,
                    Err(_) => {
                        return self.fail_retryable(
                            task,
                            "sink publish timed out".into(),
                            None,
                            started,
                        )
                    }
                };
            match published {
                Ok(PublishResult::Stored) => {}
                Ok(PublishResult::AlreadyStored) => {}
                Ok(PublishResult::Rejected(reason)) => {
                    // Bad record, not a bad task; the rest of the batch
                    // still goes through.
                    tracing::warn!(
                        task_id = task.id,
                        listing_id = %listing.listing_id,
                        reason = %reason,
                        "sink rejected listing"
                    );
                }
                Err(e) => {
                    return self.fail_retryable(
                        task,
                        format!("sink publish failed: {e:#}"),
                        None,
                        started,
                    )
                }
            }
        }

        // The seen-target mark lands only once the whole batch is settled;
        // a publish failure above retries with a real fetch instead of
        // short-circuiting on a half-done target.
        self.dedup.record_fetch(&task.source_id, &target_key);
        self.dedup.record_published(&fp);
        self.queue.ack(task.id);
        let detail = if report.listings.is_empty() {
            Some("payload yielded no listings".to_string())
        } else {
            None
        };
        self.settle(task, started, Classification::Success, detail);
        PollResult::Completed(Classification::Success)
    }

    fn settle(
        &self,
        task: &ScrapeTask,
        started: Instant,
        classification: Classification,
        detail: Option<String>,
    ) {
        self.outcomes.record(TaskOutcome {
            task_id: task.id,
            source_id: task.source_id.clone(),
            classification,
            error_detail: detail,
            duration: started.elapsed(),
            timestamp: Utc::now(),
        });
    }

    /// Worker loop: poll until shutdown flips. Idle workers sleep briefly
    /// instead of spinning on an empty queue.
    pub async fn run_worker(&self, worker_id: &str, mut shutdown: watch::Receiver<bool>) {
        tracing::info!(worker_id, "worker started");
        loop {
            if *shutdown.borrow() {
                break;
            }
            if self.poll_once(worker_id).await.is_some() {
                continue;
            }
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = tokio::time::sleep(self.cfg.idle_poll) => {}
            }
        }
        tracing::info!(worker_id, "worker stopped");
    }

    pub fn spawn_workers(
        self: &Arc<Self>,
        count: usize,
        shutdown: &watch::Receiver<bool>,
    ) -> Vec<JoinHandle<()>> {
        (0..count)
            .map(|i| {
                let dispatcher = Arc::clone(self);
                let rx = shutdown.clone();
                tokio::spawn(async move {
                    dispatcher.run_worker(&format!("worker-{i}"), rx).await;
                })
            })
            .collect()
    }

    /// Drive a single worker until the queue drains or `max_steps` polls
    /// elapse. Intended for tests running under a paused clock, where the
    /// idle sleeps auto-advance time across backoff windows.
    pub async fn run_until_idle(&self, worker_id: &str, max_steps: usize) -> usize {
        let mut completed = 0;
        for _ in 0..max_steps {
            if let Some(result) = self.poll_once(worker_id).await {
                if matches!(result, PollResult::Completed(_)) {
                    completed += 1;
                }
                continue;
            }
            if self.queue.is_idle() {
                break;
            }
            tokio::time::sleep(self.cfg.idle_poll).await;
        }
        completed
    }
}

fn identity_outcome(fetched: &Result<RawPayload, ErrorClass>) -> IdentityOutcome {
    match fetched {
        Err(ErrorClass::Blocked) | Err(ErrorClass::RateLimited { .. }) => IdentityOutcome::Blocked,
        _ => IdentityOutcome::Healthy,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::ScriptedAdapter;
    use crate::dedup::InMemoryDedup;
    use crate::proxy::PoolConfig;
    use crate::queue::QueueConfig;
    use crate::rate::BucketConfig;
    use crate::retry::RetryPolicy;
    use crate::sink::MemorySink;
    use crate::types::{Target, TaskPriority};

    fn dispatcher_with(
        adapter: Arc<ScriptedAdapter>,
        max_attempts: u32,
    ) -> (Arc<Dispatcher>, Arc<MemorySink>) {
        let queue = Arc::new(TaskQueue::new(QueueConfig {
            visibility_timeout: Duration::from_secs(300),
            retry: RetryPolicy {
                base: Duration::from_millis(100),
                cap: Duration::from_secs(60),
                max_attempts,
                jitter: false,
            },
        }));
        let governor = Arc::new(RateGovernor::new(BucketConfig {
            capacity: 1000.0,
            refill_per_sec: 1000.0,
        }));
        let pool = Arc::new(ProxyPool::direct(2, PoolConfig::default()));
        let mut registry = AdapterRegistry::new();
        registry.register(adapter);
        let sink = Arc::new(MemorySink::new());
        let dispatcher = Arc::new(Dispatcher::new(
            queue,
            governor,
            pool,
            Arc::new(registry),
            Arc::new(InMemoryDedup::new(
                Duration::from_secs(3600),
                Duration::from_secs(60),
            )),
            sink.clone(),
            Arc::new(OutcomeLog::with_capacity(100)),
            DispatcherConfig::default(),
        ));
        (dispatcher, sink)
    }

    const FEED: &str = r#"<rss version="2.0"><channel><title>Acme Jobs</title>
        <item><title>Rust Engineer</title><author>Acme</author>
        <description>Location: Remote. Build services in rust and tokio.</description>
        <link>https://acme.example/jobs/1</link>
        <pubDate>Mon, 05 Jan 2026 09:00:00 +0000</pubDate></item>
        </channel></rss>"#;

    #[tokio::test(start_paused = true)]
    async fn successful_fetch_publishes_and_acks() {
        let adapter = Arc::new(ScriptedAdapter::new("rss-acme", SourceFamily::Rss));
        adapter.push(Ok(FEED.as_bytes().to_vec()));
        let (dispatcher, sink) = dispatcher_with(adapter, 3);

        dispatcher
            .queue()
            .enqueue("rss-acme", Target::Url("https://acme.example/feed".into()), TaskPriority::Normal);

        let result = dispatcher.poll_once("w1").await;
        assert_eq!(result, Some(PollResult::Completed(Classification::Success)));
        assert_eq!(sink.len(), 1);
        assert!(dispatcher.queue().is_idle());
    }

    #[tokio::test(start_paused = true)]
    async fn unknown_source_is_terminal_without_consuming_resources() {
        let adapter = Arc::new(ScriptedAdapter::new("rss-acme", SourceFamily::Rss));
        let (dispatcher, _) = dispatcher_with(adapter.clone(), 3);

        dispatcher
            .queue()
            .enqueue("no-such-source", Target::Url("https://x.example/".into()), TaskPriority::Normal);

        let result = dispatcher.poll_once("w1").await;
        assert_eq!(
            result,
            Some(PollResult::Completed(Classification::TerminalFailure))
        );
        assert_eq!(adapter.fetch_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn terminal_error_never_refetches() {
        let adapter = Arc::new(ScriptedAdapter::new("rss-acme", SourceFamily::Rss));
        adapter.push(Err(ErrorClass::NotFound));
        let (dispatcher, sink) = dispatcher_with(adapter.clone(), 5);

        dispatcher
            .queue()
            .enqueue("rss-acme", Target::Url("https://acme.example/feed".into()), TaskPriority::Normal);

        let completed = dispatcher.run_until_idle("w1", 1000).await;
        assert_eq!(completed, 1);
        assert_eq!(adapter.fetch_count(), 1);
        assert!(sink.is_empty());
        let outcomes = dispatcher.outcomes().snapshot_last_n(1);
        assert_eq!(outcomes[0].classification, Classification::TerminalFailure);
    }
}
