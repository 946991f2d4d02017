//! # Outcome Log
//! Bounded in-memory record of task outcomes, the engine's observability
//! surface. Every record also lands in `tracing` and in the
//! `harvester_task_outcomes_total` counter, grouped by source so an
//! operator can tell one broken source apart from transient noise.

use std::collections::HashMap;
use std::sync::Mutex;

use metrics::counter;

use crate::types::{Classification, TaskOutcome};

#[derive(Debug)]
pub struct OutcomeLog {
    inner: Mutex<Vec<TaskOutcome>>,
    cap: usize,
}

impl OutcomeLog {
    pub fn with_capacity(cap: usize) -> Self {
        Self {
            inner: Mutex::new(Vec::new()),
            cap: cap.min(100_000),
        }
    }

    pub fn record(&self, outcome: TaskOutcome) {
        counter!(
            "harvester_task_outcomes_total",
            "source" => outcome.source_id.clone(),
            "classification" => outcome.classification.to_string(),
        )
        .increment(1);

        match outcome.classification {
            Classification::TerminalFailure => tracing::warn!(
                task_id = outcome.task_id,
                source_id = %outcome.source_id,
                detail = outcome.error_detail.as_deref().unwrap_or(""),
                duration_ms = outcome.duration.as_millis() as u64,
                "task failed terminally"
            ),
            _ => tracing::info!(
                task_id = outcome.task_id,
                source_id = %outcome.source_id,
                classification = %outcome.classification,
                duration_ms = outcome.duration.as_millis() as u64,
                "task outcome"
            ),
        }

        let mut v = self.inner.lock().expect("outcome log mutex poisoned");
        v.push(outcome);
        if v.len() > self.cap {
            let excess = v.len() - self.cap;
            v.drain(0..excess);
        }
    }

    pub fn snapshot_last_n(&self, n: usize) -> Vec<TaskOutcome> {
        let v = self.inner.lock().expect("outcome log mutex poisoned");
        let start = v.len().saturating_sub(n);
        v[start..].to_vec()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().expect("outcome log mutex poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Terminal-failure counts per source, for spotting a source gone bad.
    pub fn terminal_by_source(&self) -> HashMap<String, u64> {
        let v = self.inner.lock().expect("outcome log mutex poisoned");
        let mut map = HashMap::new();
        for o in v.iter() {
            if o.classification == Classification::TerminalFailure {
                *map.entry(o.source_id.clone()).or_insert(0u64) += 1;
            }
        }
        map
    }
}
