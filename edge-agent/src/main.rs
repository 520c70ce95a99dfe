//! Edge Agent binary: wires the capture bridge, feeder, worker connection,
//! recording orchestrator, and ingester into one running process, and
//! drives the five-step graceful shutdown sequence on SIGINT/SIGTERM
//! (spec §5, last paragraph).

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tokio::sync::{mpsc, watch, Mutex};
use tracing::info;

use edge_agent::adapter::{self, AdapterConfig};
use edge_agent::child_process::{capture_spec, Supervisor};
use edge_agent::feeder::{Feeder, FeederConfig};
use edge_agent::frame_cache::FrameCache;
use edge_agent::frame_reader;
use edge_agent::ingester::Ingester;
use edge_agent::orchestrator::Timers;
use edge_agent::shutdown::{self, ShutdownHandles};
use edge_agent::store_client::StoreClient;
use edge_agent::tcp_client::{self, DetectionSinks};

/// Command-line entry point for the edge agent process, following the
/// `clap::Parser` derive style already in the workspace's dependency set.
#[derive(Parser, Debug)]
#[command(name = "edge-agent", about = "Edge video capture and ingestion agent")]
struct Args {
    /// Path to the pipeline TOML configuration file (§6.6).
    #[arg(long, env = "EDGE_AGENT_CONFIG")]
    config: std::path::PathBuf,
}

fn seed_log_level(level: pipeline_config::LogLevel) {
    if std::env::var_os("RUST_LOG").is_none() {
        std::env::set_var("RUST_LOG", level.as_filter_str());
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let config =
        pipeline_config::parse_config_file(&args.config).context("loading pipeline config")?;
    seed_log_level(config.log_level);
    let _log_guard = env_tracing_logger::init();

    info!(config = %args.config.display(), "edge agent starting");

    let cache = FrameCache::new(Duration::from_millis(config.cache.frame_cache_ttl_ms));

    let feeder_config = FeederConfig {
        model: config.inference.model_name.clone(),
        width: config.inference.width,
        height: config.inference.height,
        max_inflight: config.inference.max_inflight,
        classes_filter: config.inference.classes_filter.clone(),
        confidence_threshold: config.inference.confidence_threshold,
    };
    let feeder = Arc::new(Mutex::new(Feeder::new(feeder_config, cache.clone())));
    feeder.lock().await.start();

    let (orchestrator_tx, orchestrator_rx) = mpsc::unbounded_channel();
    let (ingest_tx, ingest_rx) = mpsc::unbounded_channel();
    let (tcp_shutdown_tx, tcp_shutdown_rx) = watch::channel(false);
    let (capture_shutdown_tx, capture_shutdown_rx) = watch::channel(false);

    let store = StoreClient::new(config.store.base_url.clone());

    let tcp_task = tokio::spawn(tcp_client::run(
        config.inference.worker_host.clone(),
        config.inference.worker_port,
        feeder.clone(),
        DetectionSinks {
            orchestrator_events: orchestrator_tx.clone(),
            ingest_items: ingest_tx,
        },
        tcp_shutdown_rx,
    ));

    let ingester = Ingester::new(config.store.base_url.clone(), cache.clone());
    tokio::spawn(ingester.run(ingest_rx));

    let capture = Supervisor::spawn(capture_spec(
        &config.source.uri,
        &config.source.socket_path.to_string_lossy(),
        config.source.width,
        config.source.height,
        config.source.fps_hub,
    ));
    let frame_reader_task = tokio::spawn(frame_reader::run(
        config.source.socket_path.clone(),
        feeder.clone(),
        capture_shutdown_rx,
    ));

    let timers = Timers::from(&config.fsm);
    let adapter_config = AdapterConfig {
        device_id: config.device_id.clone(),
        configured_classes: config.inference.classes_filter.clone(),
        publisher: config.publisher.clone(),
        socket_path: config.source.socket_path.to_string_lossy().into_owned(),
    };
    let orchestrator_task = tokio::spawn(adapter::run(
        orchestrator_rx,
        orchestrator_tx.clone(),
        timers,
        adapter_config,
        store,
        feeder.clone(),
    ));

    let (shutdown_signal_tx, mut shutdown_signal_rx) = mpsc::unbounded_channel::<()>();
    ctrlc::set_handler(move || {
        let _ = shutdown_signal_tx.send(());
    })
    .context("installing signal handler")?;
    shutdown_signal_rx
        .recv()
        .await
        .context("signal channel closed unexpectedly")?;

    info!("shutdown signal received");
    shutdown::run(ShutdownHandles {
        orchestrator_events_tx: orchestrator_tx,
        orchestrator_task,
        feeder,
        tcp_shutdown_tx,
        tcp_task,
        capture,
        frame_reader_shutdown_tx: capture_shutdown_tx,
        frame_reader_task,
    })
    .await;

    Ok(())
}
