//! Upwatch daemon
//!
//! Loads monitors from SQLite and probes them until interrupted.

use std::sync::Arc;
use std::time::Duration;

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use upwatch::monitor::HttpTarget;
use upwatch::{EngineConfig, MonitorSpec, MonitorStore, NetworkProber, Scheduler, SqliteStore, Target, WebhookDispatcher};

const SUMMARY_INTERVAL: Duration = Duration::from_secs(60);
const WEBHOOK_TIMEOUT: Duration = Duration::from_secs(10);

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(tracing_subscriber::EnvFilter::from_default_env()
            .add_directive("upwatch=info".parse()?))
        .init();

    // Load configuration
    let cfg = EngineConfig::load();
    tracing::info!("Using database at {}", cfg.db_path);

    // Initialize database
    let store = Arc::new(SqliteStore::new(&cfg.db_path)?);
    tracing::info!("Database initialized successfully");

    // Add sample monitor if none exist
    if store.load_all().await?.is_empty() {
        tracing::info!("Adding sample monitor: Example");
        let spec = MonitorSpec::new(1, "Example", Target::Http(HttpTarget::new("https://example.com")));
        store.save(&spec).await?;
    }

    let scheduler = Arc::new(Scheduler::new(
        cfg,
        store,
        Arc::new(NetworkProber),
        Arc::new(WebhookDispatcher::new(WEBHOOK_TIMEOUT)?),
    ));
    let started = scheduler.start().await?;
    tracing::info!("Monitoring {} endpoints", started);

    let reporter = scheduler.clone();
    let summary_task = tokio::spawn(async move {
        let mut interval = tokio::time::interval(SUMMARY_INTERVAL);
        interval.tick().await;
        loop {
            interval.tick().await;
            let s = reporter.summary().await;
            tracing::info!(
                "Status: {} up, {} down, {} pending, average uptime {:.1}%",
                s.up,
                s.down,
                s.pending,
                s.average_uptime
            );
        }
    });

    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutting down");
    summary_task.abort();
    scheduler.shutdown().await;

    Ok(())
}
