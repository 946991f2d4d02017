use axum::{routing::get, Router};
use metrics::{describe_counter, describe_gauge, describe_histogram, gauge};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

pub struct Metrics {
    pub handle: PrometheusHandle,
}

impl Metrics {
    /// Initialize the Prometheus recorder and register metric descriptions.
    pub fn init(worker_count: usize) -> Self {
        // Use default buckets to avoid API differences across crate versions.
        let builder = PrometheusBuilder::new();

        let handle = builder
            .install_recorder()
            .expect("prometheus: install recorder");

        describe_counter!(
            "harvester_tasks_enqueued_total",
            "Tasks accepted into the queue, by source."
        );
        describe_counter!(
            "harvester_task_outcomes_total",
            "Settled task attempts, by source and classification."
        );
        describe_counter!(
            "harvester_lease_expirations_total",
            "Leases that timed out and re-exposed their task."
        );
        describe_counter!(
            "harvester_rate_denied_total",
            "Token requests denied by the rate governor, by source."
        );
        describe_counter!(
            "harvester_proxy_unavailable_total",
            "Identity checkouts that found nothing eligible, by source."
        );
        describe_counter!(
            "harvester_identity_cooldowns_total",
            "Identities placed into cooldown after a block signal."
        );
        describe_counter!(
            "harvester_dedup_hits_total",
            "Work skipped by the dedup cache, by kind (fingerprint / seen_target)."
        );
        describe_counter!(
            "harvester_listings_rejected_total",
            "Listings dropped during normalization, by offending field."
        );
        describe_counter!(
            "harvester_publish_total",
            "Sink publish calls, by result (stored / already_stored / rejected)."
        );
        describe_gauge!("harvester_queue_pending", "Tasks waiting for dispatch.");
        describe_gauge!("harvester_workers", "Configured worker count.");
        describe_histogram!(
            "harvester_fetch_duration_ms",
            "Wall time of a single adapter fetch, by source."
        );

        gauge!("harvester_workers").set(worker_count as f64);

        Self { handle }
    }

    /// Returns a router exposing `/metrics` with the Prometheus exposition format.
    pub fn router(&self) -> Router {
        let handle = self.handle.clone();
        Router::new().route(
            "/metrics",
            get(move || {
                let h = handle.clone();
                async move { h.render() }
            }),
        )
    }
}
