//! Research Queue Server - Main entry point

use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use research_queue_core::{
    api::{self, AppState},
    config::Config,
    health::HealthService,
    jobs::{EventDispatcher, QueueEngine, QueueScheduler, TracingEventSink},
    research::HttpResearchClient,
    store::{self, FallbackStore},
    telemetry,
};

#[derive(Debug, Parser)]
#[command(name = "research-queue-server", version, about = "Retry queue worker for research requests")]
struct Args {
    /// Config file (TOML, YAML or JSON); `RQ__*` variables override it
    #[arg(short, long, env = "RQ_CONFIG")]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let args = Args::parse();

    let config = match args.config {
        Some(ref path) => Config::from_file(&path.to_string_lossy())?,
        None => Config::load()?,
    };

    let telemetry = telemetry::init_telemetry(&config.telemetry)?;

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        tiers = ?config.store.tiers,
        "Starting research queue server"
    );

    // Store tiers, in fallback order
    let tiers = store::connect_tiers(&config).await;
    let store = Arc::new(FallbackStore::connect(tiers, &config.store).await);
    match store.active_tier() {
        Some(active) => tracing::info!(active, tiers = ?store.tier_names(), "Job store ready"),
        None => tracing::warn!("No job store tier is reachable; calls will fail until one recovers"),
    }

    let client = Arc::new(HttpResearchClient::new(&config.research)?);
    let (events, event_drain) =
        EventDispatcher::spawn(Arc::new(TracingEventSink), config.queue.event_buffer);

    let engine = Arc::new(QueueEngine::new(
        store.clone(),
        client,
        events,
        config.queue.clone(),
        config.retry.clone(),
    ));

    let scheduler = if config.scheduler.enabled {
        Some(QueueScheduler::new(engine.clone(), config.scheduler.clone()).start())
    } else {
        tracing::info!("Scheduler disabled; batches run only through the API");
        None
    };

    let state = AppState {
        engine,
        health: Arc::new(HealthService::new(store)),
        metrics: telemetry.metrics.clone(),
    };
    let app = api::build_router(state);

    let addr: SocketAddr = format!("{}:{}", config.server.host, config.server.port).parse()?;
    tracing::info!(address = %addr, "Starting HTTP server");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // Stop taking new batches, then flush what the running ones emitted
    if let Some(scheduler) = scheduler {
        scheduler.shutdown().await;
    }
    let recorded = event_drain.shutdown().await;
    tracing::info!(events_recorded = recorded, "Server shutdown complete");

    telemetry.shutdown();
    Ok(())
}

/// Wait for ctrl-c or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    tracing::info!("Shutdown signal received");
}
