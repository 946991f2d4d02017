//! # Re-crawl Scheduler
//! Seeds the queue from configured sources on fixed intervals. Each seed
//! fires immediately at startup and then every `every`; the queue's dedup
//! and rate layers downstream decide whether a seeded fetch does real work.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::queue::TaskQueue;
use crate::types::{Target, TaskPriority};

#[derive(Debug, Clone)]
pub struct SeedSpec {
    pub source_id: String,
    pub target: Target,
    pub priority: TaskPriority,
    pub every: Duration,
}

#[derive(Debug)]
struct SeedState {
    spec: SeedSpec,
    next_due: Instant,
}

/// Owns the seed timetable. `tick_at` is the testable core; `run` wraps it
/// in a sleep loop.
#[derive(Debug)]
pub struct Seeder {
    seeds: Vec<SeedState>,
}

impl Seeder {
    pub fn new(seeds: Vec<SeedSpec>, now: Instant) -> Self {
        Self {
            seeds: seeds
                .into_iter()
                .map(|spec| SeedState {
                    spec,
                    next_due: now,
                })
                .collect(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.seeds.is_empty()
    }

    /// Enqueue every seed whose time has come and advance its schedule.
    /// Returns the number of tasks enqueued.
    pub fn tick_at(&mut self, queue: &TaskQueue, now: Instant) -> usize {
        let mut fired = 0;
        for seed in &mut self.seeds {
            if seed.next_due > now {
                continue;
            }
            queue.enqueue_at(
                &seed.spec.source_id,
                seed.spec.target.clone(),
                seed.spec.priority,
                now,
            );
            tracing::debug!(source_id = %seed.spec.source_id, "seeded re-crawl task");
            fired += 1;
            // Skip missed windows rather than burst-enqueueing them.
            while seed.next_due <= now {
                seed.next_due += seed.spec.every;
            }
        }
        fired
    }

    /// Earliest upcoming due time, for sleeping exactly as long as needed.
    pub fn next_due(&self) -> Option<Instant> {
        self.seeds.iter().map(|s| s.next_due).min()
    }

    pub async fn run(mut self, queue: Arc<TaskQueue>, mut shutdown: watch::Receiver<bool>) {
        if self.is_empty() {
            return;
        }
        loop {
            if *shutdown.borrow() {
                break;
            }
            self.tick_at(&queue, Instant::now());
            let Some(due) = self.next_due() else { break };
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = tokio::time::sleep_until(due) => {}
            }
        }
        tracing::info!("seeder stopped");
    }
}

pub fn spawn_seeder(
    seeds: Vec<SeedSpec>,
    queue: Arc<TaskQueue>,
    shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    let seeder = Seeder::new(seeds, Instant::now());
    tokio::spawn(seeder.run(queue, shutdown))
}
