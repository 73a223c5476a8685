//! ==============================================================================
//! main.rs - telemetry hub entry point
//! ==============================================================================
//!
//! purpose:
//!     receives signed environmental readings from field devices, rejects
//!     forged / stale / replayed / implausible uploads, buffers the rest and
//!     rolls them up into per-device statistics. the roll-ups can be handed to
//!     an external text model for a written report.
//!
//! responsibilities:
//!     - load configuration and install the tracing subscriber
//!     - open storage and provision configured devices
//!     - build the ingestion pipeline and the analyzer
//!     - run the replay-guard sweeper
//!     - serve the http api until ctrl-c, then cancel idle timers
//!
//! relationships:
//!     - uses: config.rs, store/*, pipeline.rs, analysis.rs, server.rs
//!
//! architecture:
//!
//!     ┌──────────────────────────────────────────────────────────────┐
//!     │                        hub (this file)                        │
//!     │  ┌──────────────┐  ┌──────────────┐  ┌────────────────────┐  │
//!     │  │ http server  │  │ replay sweep │  │ idle timers        │  │
//!     │  │ (server.rs)  │  │ (interval)   │  │ (one per device)   │  │
//!     │  └──────┬───────┘  └──────┬───────┘  └─────────┬──────────┘  │
//!     │         │                 │                    │             │
//!     │         └─────────────────┼────────────────────┘             │
//!     │                     ┌─────┴─────┐                            │
//!     │                     │ pipeline  │ <- pipeline.rs             │
//!     │                     └─────┬─────┘                            │
//!     └───────────────────────────┼──────────────────────────────────┘
//!                                 │
//!                   ┌─────────────┴─────────────┐
//!                   ▼                           ▼
//!            ┌─────────────┐             ┌─────────────┐
//!            │  registry   │             │  buffer +   │
//!            │  (devices)  │             │  summaries  │
//!            └─────────────┘             └─────────────┘
//!
//! ==============================================================================

mod aggregator;
mod analysis;
mod anomaly;
mod config;
mod domain;
mod error;
mod idle;
mod pipeline;
mod ranges;
mod replay;
mod server;
mod signature;
mod store;

use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

use crate::analysis::{Analyzer, ChatCompletionClient};
use crate::config::HostConfig;
use crate::pipeline::Pipeline;
use crate::ranges::RangeTable;
use crate::replay::ReplayGuard;
use crate::store::Storage;

#[tokio::main]
async fn main() -> Result<()> {
    // startup banner
    println!("===========================================================");
    println!("  Environmental Telemetry Hub");
    println!("  signed ingest / range checks / roll-ups");
    println!("===========================================================");

    // step 1: load configuration
    let config = HostConfig::load_or_default()?;
    init_tracing(&config.logging.level);
    config.print_summary();

    // step 2: range table
    let ranges = match &config.ranges.path {
        Some(path) => RangeTable::load(path)
            .with_context(|| format!("failed to load range table {}", path.display()))?,
        None => RangeTable::builtin(),
    };
    tracing::info!(envelopes = ranges.keys().len(), "range table ready");

    // step 3: storage + device provisioning
    let storage = Storage::from_config(&config.storage).context("failed to open storage")?;
    for device in &config.devices {
        storage
            .devices
            .provision(&device.device_id, &device.secret)
            .await
            .with_context(|| format!("failed to provision {}", device.device_id))?;
    }
    tracing::info!(
        backend = ?config.storage.backend,
        devices = config.devices.len(),
        "storage ready"
    );

    // step 4: pipeline, analyzer
    let pipeline = Arc::new(Pipeline::new(&config.ingest, storage.clone(), Arc::new(ranges)));
    if config.ai.api_key.is_empty() {
        tracing::warn!("ai.api_key not set - analysis requests will be refused upstream");
    }
    let generator = ChatCompletionClient::new(&config.ai).context("failed to build ai client")?;
    let analyzer = Arc::new(Analyzer::new(
        storage,
        Arc::new(generator),
        config.ai.default_model.clone(),
    ));

    // step 5: replay-guard sweeper
    let sweeper = tokio::spawn(sweep_replay_guard(
        pipeline.replay_guard(),
        Duration::from_secs(config.ingest.replay_sweep_seconds),
    ));

    // step 6: serve until ctrl-c
    let app = server::router(server::AppState {
        pipeline: pipeline.clone(),
        analyzer,
    });
    let listener = tokio::net::TcpListener::bind(&config.server.bind)
        .await
        .with_context(|| format!("failed to bind {}", config.server.bind))?;
    tracing::info!(addr = %config.server.bind, "http api listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("http server error")?;

    // step 7: teardown
    sweeper.abort();
    let idle = pipeline.idle_monitor();
    tracing::info!(pending_timers = idle.pending().await, "stopping idle monitor");
    idle.shutdown().await;
    tracing::info!("hub stopped");
    Ok(())
}

/// RUST_LOG wins; otherwise the configured level
fn init_tracing(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

async fn sweep_replay_guard(guard: Arc<ReplayGuard>, every: Duration) {
    let mut ticker = tokio::time::interval(every);
    loop {
        ticker.tick().await;
        let removed = guard.sweep();
        if removed > 0 {
            tracing::debug!(
                removed,
                remaining = guard.len(),
                ttl = ?guard.ttl(),
                "replay guard swept"
            );
        }
    }
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("failed to listen for ctrl-c: {}", e);
        std::future::pending::<()>().await;
    }
    tracing::info!("shutdown requested");
}
