//! Job Harvester — Binary Entrypoint
//! Boots the scrape pipeline: config, metrics endpoint, re-crawl seeder and
//! the worker pool, then runs until Ctrl-C.
//!
//! See `README.md` for quickstart.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use job_harvester::adapters::{api::ApiAdapter, html::HtmlAdapter, rss::RssAdapter, AdapterRegistry};
use job_harvester::config::EngineConfig;
use job_harvester::dedup::InMemoryDedup;
use job_harvester::dispatch::Dispatcher;
use job_harvester::metrics::Metrics;
use job_harvester::outcome::OutcomeLog;
use job_harvester::queue::TaskQueue;
use job_harvester::rate::RateGovernor;
use job_harvester::scheduler::spawn_seeder;
use job_harvester::sink::MemorySink;
use job_harvester::types::SourceFamily;

const DEFAULT_CONFIG_PATH: &str = "config/harvester.toml";

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("job_harvester=info,warn"));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().compact())
        .init();
}

fn build_adapters(cfg: &EngineConfig) -> AdapterRegistry {
    let timeout = cfg.fetch_timeout();
    let mut registry = AdapterRegistry::new();
    for source in &cfg.sources {
        match source.family {
            SourceFamily::Rss => {
                registry.register(Arc::new(RssAdapter::live(&source.id, timeout)));
            }
            SourceFamily::Html => {
                registry.register(Arc::new(HtmlAdapter::live(
                    &source.id,
                    source.search_base.clone(),
                    timeout,
                )));
            }
            SourceFamily::Api => {
                registry.register(Arc::new(ApiAdapter::live(
                    &source.id,
                    source.search_base.clone(),
                    timeout,
                )));
            }
        }
    }
    registry
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env in local/dev; no-op in prod environments.
    let _ = dotenvy::dotenv();
    init_tracing();

    let cfg = EngineConfig::load_or_default(DEFAULT_CONFIG_PATH)?;
    tracing::info!(
        workers = cfg.workers,
        sources = cfg.sources.len(),
        "starting job harvester"
    );

    let metrics = Metrics::init(cfg.workers);

    let queue = Arc::new(TaskQueue::new(cfg.queue_config()));
    let governor = Arc::new(RateGovernor::with_overrides(
        cfg.rate_default(),
        cfg.rate_overrides(),
    ));
    let pool = Arc::new(cfg.build_pool());
    let adapters = Arc::new(build_adapters(&cfg));
    let dedup = Arc::new(InMemoryDedup::new(cfg.publish_ttl(), cfg.fetch_ttl()));
    let sink = Arc::new(MemorySink::new());
    let outcomes = Arc::new(OutcomeLog::with_capacity(10_000));

    let dispatcher = Arc::new(Dispatcher::new(
        queue.clone(),
        governor,
        pool,
        adapters,
        dedup.clone(),
        sink,
        outcomes,
        cfg.dispatcher_config(),
    ));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let seeder = spawn_seeder(cfg.seeds(), queue.clone(), shutdown_rx.clone());

    // Background sweep of expired dedup records.
    {
        let dedup = dedup.clone();
        let mut rx = shutdown_rx.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = rx.changed() => break,
                    _ = tokio::time::sleep(Duration::from_secs(600)) => dedup.purge_expired(),
                }
            }
        });
    }
    let workers = dispatcher.spawn_workers(cfg.workers, &shutdown_rx);

    let addr = std::env::var("HARVESTER_METRICS_ADDR")
        .unwrap_or_else(|_| "127.0.0.1:9090".to_string());
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!(addr = %addr, "metrics endpoint up");

    let status_queue = queue.clone();
    let router = metrics.router().route(
        "/healthz",
        axum::routing::get(move || {
            let queue = status_queue.clone();
            async move {
                let stats = queue.stats();
                axum::Json(serde_json::json!({
                    "pending": stats.pending,
                    "leased": stats.leased,
                    "acked": stats.acked,
                    "exhausted": stats.exhausted,
                    "cancelled": stats.cancelled,
                }))
            }
        }),
    );
    tokio::select! {
        result = axum::serve(listener, router) => {
            result?;
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("shutdown signal received");
        }
    }

    shutdown_tx.send(true).ok();
    for handle in workers {
        handle.await.ok();
    }
    seeder.abort();

    let stats = queue.stats();
    tracing::info!(
        acked = stats.acked,
        exhausted = stats.exhausted,
        pending = stats.pending,
        "job harvester stopped"
    );
    Ok(())
}
