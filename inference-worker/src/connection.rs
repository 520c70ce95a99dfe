//! Per-TCP-connection handler, §4.9.
//!
//! Mirrors `edge_agent::tcp_client`'s shape (`Framed` split into sink +
//! stream, `tokio::select!` over heartbeat/incoming/shutdown) but from the
//! server side: this is the worker's half of the same handshake.

use std::time::{Duration, Instant};

use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tokio_util::codec::Framed;
use tracing::{debug, info, warn};

use protocol::{validate_envelope, Codec, ConnState, Envelope, EnvelopeCodec, ErrorCode, Payload};

use crate::decode::decode_frame;
use crate::model::ModelPool;
use crate::postprocess::postprocess;
use crate::session_writer::SessionWriter;
use crate::tracker::Tracker;

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(2);
const INACTIVITY_TIMEOUT: Duration = Duration::from_secs(10);
const MODEL_LOAD_RETRY_AFTER_MS: u64 = 250;

#[derive(Clone)]
pub struct ConnectionConfig {
    pub out_dir: std::path::PathBuf,
    pub device_id: String,
    pub segment_duration_s: f64,
    pub max_frame_bytes: usize,
}

/// Runs one connection to completion: handshake, then streaming until the
/// socket closes. Never returns an `Err` the caller needs to act on beyond
/// logging — all protocol errors are reported to the peer and handled by
/// closing this connection.
pub async fn handle(
    socket: TcpStream,
    pool: ModelPool,
    config: ConnectionConfig,
    mut shutdown_rx: tokio::sync::watch::Receiver<bool>,
) {
    let peer = socket
        .peer_addr()
        .map(|a| a.to_string())
        .unwrap_or_else(|_| "unknown".to_string());
    let framed = Framed::new(socket, EnvelopeCodec::new(config.max_frame_bytes));
    let (mut sink, mut incoming) = framed.split();

    let (stream_id, init) = match await_init(&mut incoming).await {
        Ok(v) => v,
        Err(err) => {
            debug!(%peer, %err, "connection closed before handshake completed");
            return;
        }
    };

    info!(%peer, stream_id, model = %init.model, "handshake: Init received, loading model");

    let load_result = {
        let width = init.caps.max_width;
        let height = init.caps.max_height;
        let pool = pool.clone();
        let model = init.model.clone();
        tokio::spawn(async move { pool.acquire(model, width, height).await })
    };
    let handle = match run_model_load(load_result, &mut sink, &mut incoming, &stream_id).await {
        Some(h) => h,
        None => return,
    };

    let chosen = protocol::ChosenFormat {
        pixel_format: init
            .caps
            .accepted_pixel_formats
            .first()
            .copied()
            .unwrap_or(protocol::PixelFormat::Nv12),
        codec: init.caps.accepted_codecs.first().copied().unwrap_or(Codec::Raw),
        width: init.caps.max_width,
        height: init.caps.max_height,
        policy: protocol::WindowPolicy::LatestWins,
        initial_credits: init.caps.max_inflight.max(1),
    };
    let init_ok = protocol::InitOk {
        chosen,
        color_space: Some("bt601".to_string()),
        color_range: Some("limited".to_string()),
        max_frame_bytes: config.max_frame_bytes as u64,
    };
    if sink
        .send(Envelope::new(
            stream_id.clone(),
            Payload::InitOk(init_ok),
        ))
        .await
        .is_err()
    {
        return;
    }

    let mut state = ConnState::Streaming;
    let mut last_frame_id: Option<u64> = None;
    let mut last_seen_frame_id: Option<u64> = None;
    let mut tracker = Tracker::new();
    let mut writer: Option<SessionWriter> = None;
    let mut current_session_id = String::new();
    let mut last_activity = Instant::now();
    let mut heartbeat_tick = tokio::time::interval(HEARTBEAT_INTERVAL);
    heartbeat_tick.tick().await;

    loop {
        tokio::select! {
            changed = shutdown_rx.changed() => {
                if changed.is_err() || *shutdown_rx.borrow() {
                    debug!(stream_id, "shutting down, closing connection");
                    break;
                }
            }
            _ = heartbeat_tick.tick() => {
                if sink.send(Envelope::heartbeat(stream_id.clone(), last_seen_frame_id)).await.is_err() {
                    break;
                }
                if last_activity.elapsed() > INACTIVITY_TIMEOUT {
                    warn!(stream_id, "no envelope received within inactivity timeout, closing");
                    break;
                }
            }
            maybe_in = incoming.next() => {
                match maybe_in {
                    Some(Ok(envelope)) => {
                        last_activity = Instant::now();
                        if let Err(violation) = validate_envelope(&envelope) {
                            let _ = sink.send(Envelope::error(
                                stream_id.clone(),
                                ErrorCode::BadMessage,
                                violation.to_string(),
                                None,
                            )).await;
                            break;
                        }
                        state = match state.advance(envelope.msg_type) {
                            Ok(next) => next,
                            Err(violation) => {
                                let _ = sink.send(Envelope::error(
                                    stream_id.clone(),
                                    ErrorCode::BadSequence,
                                    violation.to_string(),
                                    None,
                                )).await;
                                break;
                            }
                        };

                        match envelope.payload {
                            Payload::Frame(frame) => {
                                if let Some(prev) = last_frame_id {
                                    if frame.frame_id <= prev {
                                        let _ = sink.send(Envelope::error(
                                            stream_id.clone(),
                                            ErrorCode::InvalidFrame,
                                            format!("frame_id {} is not greater than previous {}", frame.frame_id, prev),
                                            None,
                                        )).await;
                                        continue;
                                    }
                                }
                                last_frame_id = Some(frame.frame_id);
                                last_seen_frame_id = Some(frame.frame_id);

                                let reply = process_frame(
                                    &stream_id,
                                    &frame,
                                    &pool,
                                    &handle,
                                    &init,
                                    &mut tracker,
                                    &mut writer,
                                    &mut current_session_id,
                                    &config,
                                ).await;
                                if sink.send(reply).await.is_err() {
                                    break;
                                }
                            }
                            Payload::End(end) => {
                                debug!(stream_id, session_id = %end.session_id, "End received, closing session");
                                if let Some(w) = writer.take() {
                                    if let Err(err) = w.close(chrono::Utc::now().to_rfc3339()) {
                                        warn!(%err, "failed to close session writer on End");
                                    }
                                }
                                tracker.reset();
                                current_session_id.clear();
                                // Connection stays open for a possible next session (§4.9
                                // step 6); ConnState has no Closing -> Streaming edge, so
                                // reset by hand rather than teach the shared validator
                                // about this worker-only reuse.
                                state = ConnState::Streaming;
                            }
                            Payload::Heartbeat(_) => {}
                            Payload::Error(_) => {
                                break;
                            }
                            Payload::Init(_) | Payload::InitOk(_) | Payload::Result(_) | Payload::WindowUpdate(_) => {
                                debug!(stream_id, "ignoring worker-bound message type from edge");
                            }
                        }
                    }
                    Some(Err(err)) => {
                        warn!(stream_id, %err, "connection read error");
                        break;
                    }
                    None => {
                        debug!(stream_id, "peer closed socket");
                        break;
                    }
                }
            }
        }
    }

    if let Some(w) = writer.take() {
        if let Err(err) = w.close(chrono::Utc::now().to_rfc3339()) {
            warn!(%err, "failed to close session writer on connection teardown");
        }
    }
    info!(stream_id, "connection closed");
}

async fn await_init(
    incoming: &mut (impl futures::Stream<Item = Result<Envelope, protocol::Error>> + Unpin),
) -> anyhow::Result<(String, protocol::Init)> {
    match incoming.next().await {
        Some(Ok(envelope)) => {
            validate_envelope(&envelope)?;
            match envelope.payload {
                Payload::Init(init) => Ok((envelope.stream_id, init)),
                other => anyhow::bail!("expected Init, got {:?}", other.kind()),
            }
        }
        Some(Err(err)) => Err(err.into()),
        None => anyhow::bail!("connection closed before Init"),
    }
}

/// Awaits the spawned model-load job, answering any Frames that arrive
/// while it is in flight with MODEL_NOT_READY (§4.9 step 2), and keeping
/// heartbeats flowing so the peer doesn't hit its inactivity timeout while
/// the load is in progress. If a second Init arrives before loading
/// completes, the caller never gets here for that connection (handshake is
/// single-shot per connection), so no explicit cancellation handle is
/// needed here.
async fn run_model_load<S, I>(
    load: JoinHandle<crate::error::Result<crate::model::ModelHandle>>,
    sink: &mut S,
    incoming: &mut I,
    stream_id: &str,
) -> Option<crate::model::ModelHandle>
where
    S: futures::Sink<Envelope> + Unpin,
    I: futures::Stream<Item = Result<Envelope, protocol::Error>> + Unpin,
{
    tokio::pin!(load);
    let mut last_seen_frame_id: Option<u64> = None;
    let mut heartbeat_tick = tokio::time::interval(HEARTBEAT_INTERVAL);
    heartbeat_tick.tick().await; // first tick fires immediately
    loop {
        tokio::select! {
            result = &mut load => {
                return match result {
                    Ok(Ok(handle)) => Some(handle),
                    Ok(Err(err)) => {
                        let _ = sink.send(Envelope::error(
                            stream_id.to_string(),
                            ErrorCode::ModelNotReady,
                            err.to_string(),
                            None,
                        )).await;
                        None
                    }
                    Err(_) => None,
                };
            }
            _ = heartbeat_tick.tick() => {
                if sink.send(Envelope::heartbeat(stream_id.to_string(), last_seen_frame_id)).await.is_err() {
                    return None;
                }
            }
            maybe_in = incoming.next() => {
                match maybe_in {
                    Some(Ok(envelope)) if matches!(envelope.payload, Payload::Frame(_)) => {
                        if let Payload::Frame(frame) = &envelope.payload {
                            last_seen_frame_id = Some(frame.frame_id);
                        }
                        let _ = sink.send(Envelope::error(
                            stream_id.to_string(),
                            ErrorCode::ModelNotReady,
                            "model is still loading",
                            Some(MODEL_LOAD_RETRY_AFTER_MS),
                        )).await;
                    }
                    Some(Ok(_)) => {}
                    Some(Err(_)) | None => return None,
                }
            }
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn process_frame(
    stream_id: &str,
    frame: &protocol::Frame,
    pool: &ModelPool,
    handle: &crate::model::ModelHandle,
    init: &protocol::Init,
    tracker: &mut Tracker,
    writer: &mut Option<SessionWriter>,
    current_session_id: &mut String,
    config: &ConnectionConfig,
) -> Envelope {
    let t_start = Instant::now();

    let decoded = match decode_frame(frame) {
        Ok(d) => d,
        Err(err) => {
            return Envelope::error(stream_id, ErrorCode::InvalidFrame, err.to_string(), None);
        }
    };
    let t_decoded = Instant::now();

    let output = match pool.infer(handle, decoded).await {
        Ok(o) => o,
        Err(err) => {
            return Envelope::error(stream_id, ErrorCode::Internal, err.to_string(), None);
        }
    };
    let t_inferred = Instant::now();

    let detections = postprocess(
        output,
        handle.class_names(),
        init.classes_filter.as_deref(),
        init.confidence_threshold,
    );

    let is_session_active = !frame.session_id.is_empty();
    if frame.session_id != *current_session_id {
        if let Some(w) = writer.take() {
            if let Err(err) = w.close(chrono::Utc::now().to_rfc3339()) {
                warn!(%err, "failed to close previous session writer on session change");
            }
        }
        tracker.reset();
        *current_session_id = frame.session_id.clone();
        if is_session_active {
            match SessionWriter::create(
                &config.out_dir,
                &frame.session_id,
                &config.device_id,
                frame.width,
                frame.height,
                // fps isn't carried on the wire; meta.json records 0 until
                // something downstream backfills it from the source config.
                0.0,
                config.segment_duration_s,
                frame.ts_mono_ns,
                frame.ts_utc_ns,
            ) {
                Ok(w) => *writer = Some(w),
                Err(err) => warn!(%err, session_id = %frame.session_id, "failed to create session writer"),
            }
        }
    }

    let named: Vec<(protocol::DetectionNamed, [f32; 4], usize)> = detections
        .iter()
        .map(|(det, name)| {
            (
                protocol::DetectionNamed {
                    detection: protocol::Detection {
                        bbox_xyxy: det.bbox_xyxy,
                        confidence: det.confidence,
                        track_id: None,
                    },
                    class_name: name.clone(),
                },
                det.bbox_xyxy,
                det.class_id,
            )
        })
        .collect();

    let track_ids = if is_session_active {
        let raw: Vec<_> = detections.iter().map(|(d, _)| d.clone()).collect();
        tracker.update(&raw)
    } else {
        Vec::new()
    };

    let mut result_detections = Vec::with_capacity(named.len());
    let mut track_objs = Vec::with_capacity(named.len());
    for (i, (mut det, bbox, class_id)) in named.into_iter().enumerate() {
        let track_id = track_ids.get(i).copied();
        det.detection.track_id = track_id;
        if let Some(tid) = track_id {
            track_objs.push((tid, class_id, det.class_name.clone(), det.detection.confidence, bbox));
        }
        result_detections.push(det);
    }

    if is_session_active {
        if let Some(w) = writer {
            if let Err(err) = w.append(
                frame.frame_id,
                frame.ts_mono_ns,
                frame.ts_utc_ns,
                frame.width,
                frame.height,
                &track_objs,
            ) {
                warn!(%err, "failed to append tracks to session writer");
            }
        }
    }

    let t_done = Instant::now();
    Envelope::new(
        stream_id,
        Payload::Result(protocol::ResultPayload {
            frame_id: frame.frame_id,
            detections: result_detections,
            pre_ms: duration_ms(t_start, t_decoded),
            infer_ms: duration_ms(t_decoded, t_inferred),
            post_ms: duration_ms(t_inferred, t_done),
            total_ms: duration_ms(t_start, t_done),
        }),
    )
}

fn duration_ms(a: Instant, b: Instant) -> f32 {
    b.saturating_duration_since(a).as_secs_f32() * 1000.0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn duration_ms_is_never_negative() {
        let a = Instant::now();
        let b = a;
        assert_eq!(duration_ms(a, b), 0.0);
    }
}
