//! The five-step graceful shutdown sequence, §5 (last paragraph) of the
//! spec: close any active session, stop the feeder, gracefully close the
//! TCP connection, then tear down the publisher and capture children.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::info;

use crate::child_process::Supervisor;
use crate::feeder::Feeder;
use crate::orchestrator::Event;

const CAPTURE_GRACE: Duration = Duration::from_secs(5);

/// Everything the shutdown sequence needs a hold of. Built once during
/// startup and handed to [`run`] when a termination signal arrives.
pub struct ShutdownHandles {
    pub orchestrator_events_tx: mpsc::UnboundedSender<Event>,
    pub orchestrator_task: JoinHandle<()>,
    pub feeder: Arc<Mutex<Feeder>>,
    pub tcp_shutdown_tx: watch::Sender<bool>,
    pub tcp_task: JoinHandle<()>,
    pub capture: Supervisor,
    pub frame_reader_shutdown_tx: watch::Sender<bool>,
    pub frame_reader_task: JoinHandle<()>,
}

pub async fn run(handles: ShutdownHandles) {
    let ShutdownHandles {
        orchestrator_events_tx,
        orchestrator_task,
        feeder,
        tcp_shutdown_tx,
        tcp_task,
        mut capture,
        frame_reader_shutdown_tx,
        frame_reader_task,
    } = handles;

    // (1) Close any active recording session. Dropping the event channel
    // causes the orchestrator adapter's loop to exit, at which point it
    // closes the session and stops the publisher itself (the StopStream
    // and CloseSession commands for a closing session are always produced
    // together by the reducer).
    info!("shutdown: closing active session, if any");
    drop(orchestrator_events_tx);
    let _ = orchestrator_task.await;

    // (2) Stop the feeder and cancel its frame-cache sweep timer.
    info!("shutdown: stopping feeder");
    {
        let mut f = feeder.lock().await;
        f.stop();
        f.destroy();
    }

    // (3) Ask the TCP client to close gracefully (flushing End if a
    // session is still open on the wire) and wait for it to exit.
    info!("shutdown: closing worker connection");
    let _ = tcp_shutdown_tx.send(true);
    let _ = tcp_task.await;

    // (4) Publisher is already stopped as a side effect of step (1).

    // (5) Tear down the capture child and its frame-reader bridge.
    info!("shutdown: stopping capture process");
    let _ = frame_reader_shutdown_tx.send(true);
    capture.stop(CAPTURE_GRACE).await;
    let _ = frame_reader_task.await;

    info!("shutdown complete");
}
