//! # Task Queue
//! Priority-aware queue of scrape tasks with at-least-once delivery.
//!
//! A dequeued task is leased to a worker for the visibility timeout; if the
//! worker neither acks nor nacks within that window (crash, hang), the task
//! becomes re-eligible for other workers. Ordering: priority first, then
//! `not_before` ascending, then FIFO among equals.
//!
//! All time-sensitive operations have `_at(now)` variants so tests drive the
//! clock explicitly; the plain methods use the real clock.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use metrics::{counter, gauge};
use tokio::time::Instant;

use crate::retry::RetryPolicy;
use crate::types::{ScrapeTask, Target, TaskId, TaskPriority, TaskState};

#[derive(Debug, Clone, Copy)]
pub struct QueueConfig {
    /// How long a lease hides a task from other workers.
    pub visibility_timeout: Duration,
    pub retry: RetryPolicy,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            visibility_timeout: Duration::from_secs(60),
            retry: RetryPolicy::default(),
        }
    }
}

/// Result of a `nack`: either the task went back into rotation or it hit the
/// attempt ceiling and left it for good.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NackResult {
    Requeued { attempt_count: u32, delay: Duration },
    /// Max attempts exceeded; the caller must report the terminal failure.
    Terminal { attempt_count: u32 },
}

#[derive(Debug, Clone, Copy, Default)]
pub struct QueueStats {
    pub pending: usize,
    pub leased: usize,
    pub acked: u64,
    pub exhausted: u64,
    pub cancelled: u64,
}

#[derive(Debug)]
struct ReadyEntry {
    /// Monotonic sequence assigned on every (re)enqueue; FIFO tie-break.
    seq: u64,
    task: ScrapeTask,
}

#[derive(Debug)]
struct Lease {
    task: ScrapeTask,
    expires: Instant,
    #[allow(dead_code)]
    worker_id: String,
}

#[derive(Debug, Default)]
struct Inner {
    ready: Vec<ReadyEntry>,
    leased: HashMap<TaskId, Lease>,
    next_id: TaskId,
    next_seq: u64,
    acked: u64,
    exhausted: u64,
    cancelled: u64,
}

#[derive(Debug)]
pub struct TaskQueue {
    inner: Mutex<Inner>,
    cfg: QueueConfig,
}

impl TaskQueue {
    pub fn new(cfg: QueueConfig) -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            cfg,
        }
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.cfg.retry
    }

    pub fn enqueue(&self, source_id: &str, target: Target, priority: TaskPriority) -> TaskId {
        self.enqueue_at(source_id, target, priority, Instant::now())
    }

    pub fn enqueue_at(
        &self,
        source_id: &str,
        target: Target,
        priority: TaskPriority,
        now: Instant,
    ) -> TaskId {
        let mut inner = self.lock();
        inner.next_id += 1;
        let id = inner.next_id;
        let task = ScrapeTask {
            id,
            source_id: source_id.to_string(),
            target,
            priority,
            attempt_count: 0,
            not_before: now,
            state: TaskState::Pending,
        };
        Self::push_ready(&mut inner, task);
        counter!("harvester_tasks_enqueued_total", "source" => source_id.to_string()).increment(1);
        gauge!("harvester_queue_pending").set(inner.ready.len() as f64);
        id
    }

    pub fn dequeue(&self, worker_id: &str) -> Option<ScrapeTask> {
        self.dequeue_at(worker_id, Instant::now())
    }

    /// Hand out the best eligible task, leasing it to `worker_id`. Expired
    /// leases are reaped first so crashed workers never strand a task.
    pub fn dequeue_at(&self, worker_id: &str, now: Instant) -> Option<ScrapeTask> {
        let mut inner = self.lock();
        Self::reap_expired(&mut inner, now);

        let idx = inner
            .ready
            .iter()
            .enumerate()
            .filter(|(_, e)| e.task.not_before <= now)
            .min_by(|(_, a), (_, b)| {
                b.task
                    .priority
                    .cmp(&a.task.priority)
                    .then(a.task.not_before.cmp(&b.task.not_before))
                    .then(a.seq.cmp(&b.seq))
            })
            .map(|(i, _)| i)?;

        let mut task = inner.ready.swap_remove(idx).task;
        task.state = TaskState::Leased;
        inner.leased.insert(
            task.id,
            Lease {
                task: task.clone(),
                expires: now + self.cfg.visibility_timeout,
                worker_id: worker_id.to_string(),
            },
        );
        gauge!("harvester_queue_pending").set(inner.ready.len() as f64);
        Some(task)
    }

    /// Complete a leased task (success or dispatcher-reported terminal
    /// failure). Returns the task so the caller can record the outcome.
    pub fn ack(&self, task_id: TaskId) -> Option<ScrapeTask> {
        let mut inner = self.lock();
        let lease = inner.leased.remove(&task_id)?;
        inner.acked += 1;
        Some(lease.task)
    }

    pub fn nack(&self, task_id: TaskId, retry_after: Option<Duration>) -> Option<NackResult> {
        self.nack_at(task_id, retry_after, Instant::now())
    }

    /// Fail a leased attempt. Bumps `attempt_count` and re-queues with the
    /// given delay, or with the policy's exponential backoff when the caller
    /// has no better hint. Past the attempt ceiling the task is dropped from
    /// rotation and reported as terminal via the return value.
    pub fn nack_at(
        &self,
        task_id: TaskId,
        retry_after: Option<Duration>,
        now: Instant,
    ) -> Option<NackResult> {
        let mut inner = self.lock();
        let lease = inner.leased.remove(&task_id)?;
        let mut task = lease.task;
        task.attempt_count += 1;

        if task.attempt_count >= self.cfg.retry.max_attempts {
            inner.exhausted += 1;
            return Some(NackResult::Terminal {
                attempt_count: task.attempt_count,
            });
        }

        let backoff = self.cfg.retry.delay_for(task.attempt_count);
        // A Retry-After hint can ask for more patience than the backoff,
        // never less.
        let delay = match retry_after {
            Some(hint) => backoff.max(hint).min(self.cfg.retry.cap),
            None => backoff,
        };
        task.not_before = now + delay;
        task.state = TaskState::Pending;
        let attempt_count = task.attempt_count;
        Self::push_ready(&mut inner, task);
        gauge!("harvester_queue_pending").set(inner.ready.len() as f64);
        Some(NackResult::Requeued {
            attempt_count,
            delay,
        })
    }

    pub fn requeue(&self, task_id: TaskId, delay: Duration) -> bool {
        self.requeue_at(task_id, delay, Instant::now())
    }

    /// Backpressure path: put a leased task back without burning an attempt.
    /// Used when a resource (rate token, proxy identity) is unavailable —
    /// that is congestion, not a failure of the task itself.
    pub fn requeue_at(&self, task_id: TaskId, delay: Duration, now: Instant) -> bool {
        let mut inner = self.lock();
        let Some(lease) = inner.leased.remove(&task_id) else {
            return false;
        };
        let mut task = lease.task;
        task.not_before = now + delay;
        task.state = TaskState::Pending;
        Self::push_ready(&mut inner, task);
        gauge!("harvester_queue_pending").set(inner.ready.len() as f64);
        true
    }

    /// Cancel a pending task before dispatch. Leased tasks cannot be
    /// cancelled; in-flight fetches end via the timeout mechanism only.
    pub fn cancel(&self, task_id: TaskId) -> bool {
        let mut inner = self.lock();
        let before = inner.ready.len();
        inner.ready.retain(|e| e.task.id != task_id);
        let removed = inner.ready.len() < before;
        if removed {
            inner.cancelled += 1;
            gauge!("harvester_queue_pending").set(inner.ready.len() as f64);
        }
        removed
    }

    pub fn pending_count(&self) -> usize {
        self.lock().ready.len()
    }

    pub fn leased_count(&self) -> usize {
        self.lock().leased.len()
    }

    /// True when nothing is pending or in flight.
    pub fn is_idle(&self) -> bool {
        let inner = self.lock();
        inner.ready.is_empty() && inner.leased.is_empty()
    }

    /// Earliest `not_before` among pending tasks; `None` when empty. Lets a
    /// polling worker sleep until something can actually run.
    pub fn next_ready_at(&self) -> Option<Instant> {
        let inner = self.lock();
        inner.ready.iter().map(|e| e.task.not_before).min()
    }

    pub fn stats(&self) -> QueueStats {
        let inner = self.lock();
        QueueStats {
            pending: inner.ready.len(),
            leased: inner.leased.len(),
            acked: inner.acked,
            exhausted: inner.exhausted,
            cancelled: inner.cancelled,
        }
    }

    fn push_ready(inner: &mut Inner, task: ScrapeTask) {
        inner.next_seq += 1;
        let seq = inner.next_seq;
        inner.ready.push(ReadyEntry { seq, task });
    }

    fn reap_expired(inner: &mut Inner, now: Instant) {
        let expired: Vec<TaskId> = inner
            .leased
            .iter()
            .filter(|(_, l)| l.expires <= now)
            .map(|(id, _)| *id)
            .collect();
        for id in expired {
            if let Some(lease) = inner.leased.remove(&id) {
                let mut task = lease.task;
                task.state = TaskState::Pending;
                tracing::warn!(task_id = task.id, source_id = %task.source_id, "lease expired, re-exposing task");
                counter!("harvester_lease_expirations_total").increment(1);
                Self::push_ready(inner, task);
            }
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().expect("task queue mutex poisoned")
    }
}
