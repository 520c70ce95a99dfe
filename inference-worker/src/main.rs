//! Inference worker binary: loads config, sweeps stale sessions left by a
//! prior crash, spawns the model pool, and serves connections until
//! SIGINT/SIGTERM (§5, "the worker mirrors this on its own termination:
//! close all per-connection session writers before exit").

use anyhow::Context;
use clap::Parser;
use tracing::info;

use inference_worker::connection::ConnectionConfig;
use inference_worker::model::{ModelPool, StubBackend};
use inference_worker::server;
use inference_worker::session_writer::sweep_stale_sessions;

#[derive(Parser, Debug)]
#[command(name = "inference-worker", about = "Video inference worker")]
struct Args {
    #[arg(long, env = "INFERENCE_WORKER_CONFIG")]
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

    info!(config = %args.config.display(), "inference worker starting");

    let swept = sweep_stale_sessions(&config.worker.out_dir)
        .context("sweeping stale sessions on startup")?;
    if swept > 0 {
        info!(swept, "closed stale sessions left open by a prior crash");
    }

    let pool = ModelPool::spawn(Box::new(StubBackend::default()));
    let conn_config = ConnectionConfig {
        out_dir: config.worker.out_dir.clone(),
        device_id: config.device_id.clone(),
        segment_duration_s: config.worker.segment_duration_s,
        max_frame_bytes: config.worker.max_frame_bytes as usize,
    };

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let serve = tokio::spawn(server::run(
        config.worker.listen_host.clone(),
        config.worker.listen_port,
        pool,
        conn_config,
        shutdown_rx,
    ));

    let (signal_tx, mut signal_rx) = tokio::sync::mpsc::unbounded_channel::<()>();
    ctrlc::set_handler(move || {
        let _ = signal_tx.send(());
    })
    .context("installing signal handler")?;

    signal_rx.recv().await;
    info!("shutdown signal received, draining connections");
    let _ = shutdown_tx.send(true);
    serve.await.context("server task panicked")??;
    Ok(())
}
