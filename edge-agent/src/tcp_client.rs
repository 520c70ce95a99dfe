//! Owns the socket to the inference worker: framing, handshake, heartbeat,
//! and reconnection with backoff, §4.6 of the spec.

use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::{SinkExt, StreamExt};
use rand::Rng;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::time::timeout;
use tokio_util::codec::Framed;
use tracing::{debug, info, warn};

use protocol::{validate_envelope, Envelope, EnvelopeCodec, ErrorCode, MsgType, Payload};

use crate::feeder::Feeder;
use crate::ingester::IngestItem;
use crate::orchestrator::Event as OrchestratorEvent;

/// Channels the TCP client's dispatcher feeds as it observes Results: one
/// towards the orchestrator (relevance events), one towards the ingester
/// (frames worth uploading).
#[derive(Clone)]
pub struct DetectionSinks {
    pub orchestrator_events: mpsc::UnboundedSender<OrchestratorEvent>,
    pub ingest_items: mpsc::UnboundedSender<IngestItem>,
}

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(2);
const INACTIVITY_TIMEOUT: Duration = Duration::from_secs(10);
const BACKOFF_BASE: Duration = Duration::from_millis(500);
const BACKOFF_CAP: Duration = Duration::from_secs(30);

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("connect timed out")]
    ConnectTimeout,
    #[error("handshake timed out waiting for InitOk")]
    HandshakeTimeout,
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Protocol(#[from] protocol::Error),
    #[error("worker rejected handshake: {0:?}")]
    HandshakeRejected(ErrorCode),
    #[error("connection closed by peer")]
    Eof,
    #[error("no envelope received for {0:?}, connection considered dead")]
    Inactive(Duration),
    #[error("fatal protocol error from peer: {0:?}")]
    FatalError(ErrorCode),
}

/// Generates a per-connection stream_id, format `edge-<unix-ts>-<rand>`
/// per §3.1.
fn generate_stream_id() -> String {
    let ts = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs();
    let suffix: u32 = rand::rng().random();
    format!("edge-{ts}-{suffix:08x}")
}

fn backoff_delay(attempt: u32) -> Duration {
    let exp = BACKOFF_BASE.saturating_mul(1u32 << attempt.min(16));
    let capped = exp.min(BACKOFF_CAP);
    let jitter_frac = rand::rng().random_range(-0.2..=0.2);
    let millis = capped.as_millis() as f64 * (1.0 + jitter_frac);
    Duration::from_millis(millis.max(0.0) as u64)
}

/// Drives the connection until either the channel is closed for shutdown
/// or an unrecoverable error occurs, reconnecting with backoff in between.
pub async fn run(
    host: String,
    port: u16,
    feeder: Arc<Mutex<Feeder>>,
    sinks: DetectionSinks,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let mut attempt = 0u32;
    loop {
        if *shutdown_rx.borrow() {
            return;
        }
        match connect_and_serve(&host, port, &feeder, &sinks, &mut shutdown_rx).await {
            Ok(()) => {
                if *shutdown_rx.borrow() {
                    return;
                }
                attempt = 0;
            }
            Err(err) => {
                warn!(%err, "connection to worker ended, reconnecting");
                attempt += 1;
            }
        }
        if *shutdown_rx.borrow() {
            return;
        }
        let delay = backoff_delay(attempt);
        debug!(?delay, attempt, "backing off before reconnect");
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = shutdown_rx.changed() => {}
        }
    }
}

async fn connect_and_serve(
    host: &str,
    port: u16,
    feeder: &Arc<Mutex<Feeder>>,
    sinks: &DetectionSinks,
    shutdown_rx: &mut watch::Receiver<bool>,
) -> Result<(), Error> {
    let stream = timeout(CONNECT_TIMEOUT, TcpStream::connect((host, port)))
        .await
        .map_err(|_| Error::ConnectTimeout)??;

    let framed = Framed::new(stream, EnvelopeCodec::default());
    let (mut sink, mut incoming) = framed.split();

    let stream_id = generate_stream_id();
    let (tx, mut outgoing) = mpsc::unbounded_channel::<Envelope>();

    let init_envelope = {
        let mut f = feeder.lock().await;
        f.set_stream_id(stream_id.clone());
        f.set_send_fn(tx);
        f.build_init(false)
    };
    sink.send(init_envelope).await?;

    let init_ok = timeout(HANDSHAKE_TIMEOUT, await_init_ok(&mut incoming))
        .await
        .map_err(|_| Error::HandshakeTimeout)??;

    {
        let mut f = feeder.lock().await;
        f.handle_init_ok(&init_ok);
    }
    info!(stream_id, "handshake complete, connection ready");

    let mut last_activity = Instant::now();
    let mut last_sent_frame_id: Option<u64> = None;
    let mut heartbeat_tick = tokio::time::interval(HEARTBEAT_INTERVAL);
    heartbeat_tick.tick().await; // first tick fires immediately

    loop {
        tokio::select! {
            changed = shutdown_rx.changed() => {
                if changed.is_err() || *shutdown_rx.borrow() {
                    let session_id = feeder.lock().await.session_id().to_string();
                    if !session_id.is_empty() {
                        let _ = sink.send(Envelope::end(stream_id.clone(), session_id)).await;
                    }
                    return Ok(());
                }
            }
            _ = heartbeat_tick.tick() => {
                sink.send(Envelope::heartbeat(stream_id.clone(), last_sent_frame_id)).await?;
                if last_activity.elapsed() > INACTIVITY_TIMEOUT {
                    return Err(Error::Inactive(last_activity.elapsed()));
                }
            }
            maybe_out = outgoing.recv() => {
                match maybe_out {
                    Some(envelope) => {
                        if let Payload::Frame(frame) = &envelope.payload {
                            last_sent_frame_id = Some(frame.frame_id);
                        }
                        sink.send(envelope).await?;
                    }
                    None => {
                        // Feeder was replaced by a subsequent reconnect attempt's
                        // send_fn; nothing more will arrive on this channel.
                    }
                }
            }
            maybe_in = incoming.next() => {
                match maybe_in {
                    Some(Ok(envelope)) => {
                        last_activity = Instant::now();
                        validate_envelope(&envelope)?;
                        let outcome = dispatch(envelope, feeder, sinks).await?;
                        if let Some(fatal) = outcome.fatal {
                            return Err(Error::FatalError(fatal));
                        }
                        if let Some(resend_init) = outcome.resend_init {
                            sink.send(resend_init).await?;
                        }
                    }
                    Some(Err(err)) => return Err(err.into()),
                    None => return Err(Error::Eof),
                }
            }
        }
    }
}

async fn await_init_ok(
    incoming: &mut (impl futures::Stream<Item = Result<Envelope, protocol::Error>> + Unpin),
) -> Result<protocol::InitOk, Error> {
    loop {
        match incoming.next().await {
            Some(Ok(envelope)) => {
                validate_envelope(&envelope)?;
                match envelope.payload {
                    Payload::InitOk(init_ok) => return Ok(init_ok),
                    Payload::Error(err) => return Err(Error::HandshakeRejected(err.code)),
                    _ => continue,
                }
            }
            Some(Err(err)) => return Err(err.into()),
            None => return Err(Error::Eof),
        }
    }
}

#[derive(Default)]
struct DispatchOutcome {
    fatal: Option<ErrorCode>,
    resend_init: Option<Envelope>,
}

/// Routes one received envelope per §4.6.2.
async fn dispatch(
    envelope: Envelope,
    feeder: &Arc<Mutex<Feeder>>,
    sinks: &DetectionSinks,
) -> Result<DispatchOutcome, Error> {
    match envelope.payload {
        Payload::InitOk(_) => {
            // Only legal during handshake; if it arrives again post-handshake
            // it is out of sequence but non-fatal to tolerate here.
            debug!("ignoring unexpected InitOk outside handshake");
        }
        Payload::Result(result) => {
            let (relevant, session_id) = {
                let mut f = feeder.lock().await;
                f.handle_result(result.frame_id);
                (f.any_relevant(&result.detections), f.session_id().to_string())
            };
            let event = if result.detections.is_empty() {
                OrchestratorEvent::Keepalive
            } else {
                OrchestratorEvent::Detection { relevant }
            };
            let _ = sinks.orchestrator_events.send(event);
            if relevant && !session_id.is_empty() {
                for detection in &result.detections {
                    if feeder.lock().await.is_relevant(detection) {
                        let _ = sinks.ingest_items.send(IngestItem {
                            frame_id: result.frame_id,
                            session_id: session_id.clone(),
                            track_id: detection.detection.track_id,
                            class_name: detection.class_name.clone(),
                            confidence: detection.detection.confidence,
                            bbox_xyxy: detection.detection.bbox_xyxy,
                        });
                    }
                }
            }
        }
        Payload::WindowUpdate(update) => {
            feeder.lock().await.handle_window_update(update.new_size);
        }
        Payload::Heartbeat(_) => {
            // last_activity already bumped by the caller.
        }
        Payload::Error(err) => {
            if err.code.is_fatal() {
                return Ok(DispatchOutcome {
                    fatal: Some(err.code),
                    resend_init: None,
                });
            }
            let resend_init = feeder.lock().await.handle_error(&err);
            return Ok(DispatchOutcome {
                fatal: None,
                resend_init,
            });
        }
        Payload::End(_) => {
            feeder.lock().await.set_session_id(String::new());
        }
        Payload::Init(_) | Payload::Frame(_) => {
            debug!(msg_type = ?MsgType::Init, "ignoring edge-bound message type from worker");
        }
    }
    Ok(DispatchOutcome::default())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_never_exceeds_cap_plus_jitter() {
        for attempt in 0..20 {
            let d = backoff_delay(attempt);
            assert!(d <= BACKOFF_CAP + BACKOFF_CAP / 5);
        }
    }

    #[test]
    fn stream_ids_are_unique_and_well_formed() {
        let a = generate_stream_id();
        let b = generate_stream_id();
        assert_ne!(a, b);
        assert!(a.starts_with("edge-"));
    }
}
