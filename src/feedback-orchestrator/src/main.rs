//! Feedback Orchestrator: campaign dispatch and reward orchestration node.
//!
//! Main entry point that wires the store, WhatsApp transport, dispatcher and
//! scheduler, then drives ticks until shutdown.

use clap::Parser;
use feedback_campaigns::{DispatchScheduler, InProcessLocks, RateLimitedDispatcher, RecipientQueue};
use feedback_channels::{InstanceRegistry, WhatsAppProvider};
use feedback_core::clock::system_clock;
use feedback_core::config::AppConfig;
use feedback_core::event_bus::{EventSink, TracingSink};
use feedback_rewards::CouponIssuer;
use feedback_store::InMemoryStore;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "feedback-orchestrator")]
#[command(about = "Campaign dispatch and reward orchestrator for WhatsApp feedback campaigns")]
#[command(version)]
struct Cli {
    /// Path to a config file (TOML, YAML or JSON; extension optional)
    #[arg(long, short, env = "FEEDBACK_CONFIG")]
    config: Option<String>,

    /// Node identifier (overrides config)
    #[arg(long, env = "FEEDBACK__NODE_ID")]
    node_id: Option<String>,

    /// Scheduler tick interval in milliseconds (overrides config)
    #[arg(long, env = "FEEDBACK__DISPATCH__TICK_INTERVAL_MS")]
    tick_interval_ms: Option<u64>,

    /// Do not start the Prometheus exporter
    #[arg(long, default_value_t = false)]
    no_metrics: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                "feedback_orchestrator=info,feedback_campaigns=info,feedback_rewards=info".into()
            }),
        )
        .json()
        .init();

    let cli = Cli::parse();

    info!("Feedback Orchestrator starting up");

    let mut config = AppConfig::load(cli.config.as_deref()).unwrap_or_else(|e| {
        warn!(error = %e, "Failed to load config, using defaults");
        AppConfig::default()
    });

    if let Some(node_id) = cli.node_id {
        config.node_id = node_id;
    }
    if let Some(tick) = cli.tick_interval_ms {
        config.dispatch.tick_interval_ms = tick;
    }

    info!(
        node_id = %config.node_id,
        tick_interval_ms = config.dispatch.tick_interval_ms,
        max_attempts = config.dispatch.max_attempts,
        metrics_port = config.metrics.port,
        "Configuration loaded"
    );

    if !cli.no_metrics {
        if let Err(e) = start_metrics(&config) {
            error!(error = %e, "Failed to start metrics exporter");
        }
    }

    let sink: Arc<dyn EventSink> = Arc::new(TracingSink);
    let clock = system_clock();
    let store = Arc::new(InMemoryStore::new());
    let locks = Arc::new(InProcessLocks::new());
    let queue = Arc::new(RecipientQueue::new());
    let instances = Arc::new(InstanceRegistry::new());
    let transport = Arc::new(WhatsAppProvider::new(&config.whatsapp, instances.clone()));

    let dispatcher = Arc::new(
        RateLimitedDispatcher::new(
            store.clone(),
            queue,
            instances,
            transport,
            locks.clone(),
            &config.dispatch,
        )
        .with_event_sink(sink.clone()),
    );
    let scheduler = DispatchScheduler::new(
        store.clone(),
        dispatcher,
        locks,
        clock.clone(),
        Duration::from_millis(config.dispatch.tick_interval_ms.max(1)),
    )
    .with_event_sink(sink.clone());

    let issuer = Arc::new(
        CouponIssuer::new(store.clone(), clock.clone(), &config.rewards).with_event_sink(sink),
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // Coupon expiry sweep
    let sweep_every = Duration::from_secs(config.rewards.expiry_sweep_interval_secs.max(1));
    let mut sweep_shutdown = shutdown_rx.clone();
    let sweeper = tokio::spawn(async move {
        let mut interval = tokio::time::interval(sweep_every);
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    issuer.expire_overdue(clock.now());
                }
                _ = sweep_shutdown.changed() => break,
            }
        }
    });

    let scheduler_task = tokio::spawn(async move { scheduler.run(shutdown_rx).await });

    info!("Feedback Orchestrator is ready");

    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received");
    shutdown_tx.send(true)?;

    scheduler_task.await?;
    sweeper.await?;

    info!("Feedback Orchestrator stopped");
    Ok(())
}

fn start_metrics(config: &AppConfig) -> anyhow::Result<()> {
    let addr = SocketAddr::new(config.metrics.host.parse()?, config.metrics.port);
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()?;
    info!(port = config.metrics.port, "Metrics exporter started");
    Ok(())
}
