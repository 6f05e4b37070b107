//! Engine binary for the Skirmish combat telemetry pipeline.
//!
//! This is the main entry point that wires the NATS feeds, the stream
//! processing pipeline, and the query API together. It runs until
//! `Ctrl-C`, then drains every partition and shuts down cleanly.
//!
//! # Startup Sequence
//!
//! 1. Load configuration from `skirmish-config.yaml` plus environment overrides
//! 2. Initialize structured logging (tracing)
//! 3. Build the topology and open the state stores
//! 4. Connect to NATS
//! 5. Start the pipeline
//! 6. Bridge NATS subjects to the pipeline channels
//! 7. Start the query server
//! 8. Wait for `Ctrl-C`, then drain and report

mod error;
mod nats_feed;

use std::path::Path;
use std::sync::Arc;

use skirmish_core::config::{LoggingConfig, SkirmishConfig};
use skirmish_core::runner::{Pipeline, PipelineFeeds};
use skirmish_query::server::ServerConfig;
use skirmish_query::startup::spawn_query_server;
use skirmish_query::state::AppState;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use crate::error::EngineError;
use crate::nats_feed::NatsFeed;

/// Config file looked up relative to the working directory.
const CONFIG_PATH: &str = "skirmish-config.yaml";

/// Application entry point for the engine.
///
/// # Errors
///
/// Returns an error if any startup step fails or the pipeline ends with
/// an error.
#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // 1. Load configuration.
    let mut config = SkirmishConfig::load_or_default(Path::new(CONFIG_PATH))?;
    config.apply_env_overrides()?;

    // 2. Initialize structured logging.
    init_tracing(&config.logging);
    info!(
        nats_url = config.transport.nats_url,
        partitions = config.pipeline.partitions,
        bucket_size_ms = config.stores.bucket_size_ms,
        bucket_count = config.stores.bucket_count,
        "skirmish-engine starting"
    );

    run(config).await?;
    Ok(())
}

async fn run(config: SkirmishConfig) -> Result<(), EngineError> {
    // 3. Build the topology and open stores.
    let transport = config.transport.clone();
    let server_config = ServerConfig::from(&config.query);
    let capacity = config.pipeline.channel_capacity;
    let pipeline = Pipeline::open(config)?;
    let app_state = Arc::new(AppState::new(
        pipeline.query_service(),
        pipeline.arena_reader(),
    ));

    // 4. Connect to NATS.
    let feed = NatsFeed::connect(&transport.nats_url).await?;

    // 5. Start the pipeline.
    let (handles, feeds) = PipelineFeeds::channels(capacity);
    let running = pipeline.start(feeds);
    info!("Pipeline running");

    // 6. Bridge NATS subjects.
    let arena_bridge = feed
        .bridge_inbound(
            transport.arena_subject,
            handles.arenas,
            running.shutdown_signal(),
        )
        .await?;
    let round_bridge = feed
        .bridge_inbound(
            transport.round_subject,
            handles.rounds,
            running.shutdown_signal(),
        )
        .await?;
    let publisher = feed.publish_results(transport.result_subject, handles.results);

    // 7. Start the query server.
    let server = spawn_query_server(&server_config, app_state, running.shutdown_signal())
        .await
        .map_err(|e| EngineError::Query {
            message: e.to_string(),
        })?;
    info!(port = server_config.port, "Query API server started");

    // 8. Wait for Ctrl-C, then drain.
    tokio::signal::ctrl_c()
        .await
        .map_err(|e| EngineError::Signal {
            message: e.to_string(),
        })?;
    info!("Ctrl-C received, draining");

    let report = running.shutdown().await;

    for (name, bridge) in [("arenas", arena_bridge), ("rounds", round_bridge)] {
        if let Err(e) = bridge.await {
            warn!(bridge = name, error = %e, "Inbound bridge ended abnormally");
        }
    }
    match publisher.await {
        Ok(Ok(tally)) => info!(
            published = tally.published,
            failed = tally.failed,
            "Results flushed"
        ),
        Ok(Err(e)) => warn!(error = %e, "Result publisher failed"),
        Err(e) => warn!(error = %e, "Result publisher ended abnormally"),
    }
    match server.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => warn!(error = %e, "Query server failed"),
        Err(e) => warn!(error = %e, "Query server ended abnormally"),
    }

    let totals = report?.totals();
    info!(
        processed = totals.processed,
        emitted = totals.emitted,
        restarts = totals.restarts,
        "skirmish-engine shutdown complete"
    );
    Ok(())
}

/// Install the global tracing subscriber. `RUST_LOG` wins over the
/// configured level.
fn init_tracing(logging: &LoggingConfig) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&logging.level));
    if logging.json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_target(true)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(true)
            .init();
    }
}
