//! Bridges capture events to the worker connection, §4.5 of the spec.
//!
//! The feeder is the single place that decides, for each captured buffer,
//! whether to send it now, replace a pending frame (LATEST_WINS), or drop
//! it outright. It owns the window manager, the frame cache, and the
//! degradation manager, but not the socket itself — frames go out through
//! a channel handed to it by the TCP client via [`Feeder::set_send_fn`].

use std::collections::HashMap;
use std::time::{Duration, Instant};

use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, info, warn};

use protocol::{
    Capabilities, ChosenFormat, Codec, Envelope, ErrorCode, ErrorPayload, Frame, Init,
    PixelFormat, Plane, PreprocessingHints,
};

use crate::degradation::DegradationManager;
use crate::frame_cache::{CachedFrame, FrameCache};
use crate::window::WindowManager;

const JPEG_QUALITY: u8 = 85;

pub struct FeederConfig {
    pub model: String,
    pub width: u32,
    pub height: u32,
    pub max_inflight: u32,
    pub classes_filter: Option<Vec<String>>,
    pub confidence_threshold: Option<f32>,
}

/// A captured buffer plus its capture-time metadata, handed to the feeder
/// by the frame reader on every capture callback.
#[derive(Debug, Clone)]
pub struct CaptureFrame {
    pub data: Vec<u8>,
    pub pixel_format: PixelFormat,
    pub ts_mono_ns: u64,
    pub ts_utc_ns: u64,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct FeederMetrics {
    pub latest_wins_drops: u64,
}

pub struct Feeder {
    config: FeederConfig,
    stream_id: Option<String>,
    session_id: String,
    send: Option<UnboundedSender<Envelope>>,

    window: WindowManager,
    cache: FrameCache,
    degradation: DegradationManager,

    chosen: Option<ChosenFormat>,
    max_frame_bytes: u64,
    prefer_jpeg: bool,

    frame_id_counter: u64,
    send_ts: HashMap<u64, Instant>,
    pending: Option<CaptureFrame>,
    started: bool,

    metrics: FeederMetrics,
}

impl Feeder {
    pub fn new(config: FeederConfig, cache: FrameCache) -> Self {
        Self {
            config,
            stream_id: None,
            session_id: String::new(),
            send: None,
            window: WindowManager::new(),
            cache,
            degradation: DegradationManager::new(),
            chosen: None,
            max_frame_bytes: u64::MAX,
            prefer_jpeg: false,
            frame_id_counter: 0,
            send_ts: HashMap::new(),
            pending: None,
            started: false,
            metrics: FeederMetrics::default(),
        }
    }

    pub fn set_send_fn(&mut self, send: UnboundedSender<Envelope>) {
        self.send = Some(send);
    }

    pub fn set_stream_id(&mut self, stream_id: String) {
        self.stream_id = Some(stream_id);
    }

    pub fn set_session_id(&mut self, session_id: String) {
        self.session_id = session_id;
    }

    /// Sends an End envelope for the session currently tracked by the
    /// feeder, then clears it. Used by the orchestrator adapter when a
    /// session closes while the connection stays open (§4.6.2, §4.9.6).
    pub fn send_end(&mut self) {
        if self.session_id.is_empty() {
            return;
        }
        let envelope = Envelope::end(
            self.stream_id.clone().unwrap_or_default(),
            self.session_id.clone(),
        );
        self.send_envelope(envelope);
        self.session_id.clear();
    }

    pub fn metrics(&self) -> FeederMetrics {
        self.metrics
    }

    pub fn window(&self) -> &WindowManager {
        &self.window
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Relevance per §4.7.1: class is in the configured filter (or no
    /// filter was set, meaning all classes pass) and confidence clears the
    /// configured threshold (or no threshold was set).
    pub fn is_relevant(&self, detection: &protocol::DetectionNamed) -> bool {
        let class_ok = self
            .config
            .classes_filter
            .as_ref()
            .map(|classes| classes.iter().any(|c| c == &detection.class_name))
            .unwrap_or(true);
        let confidence_ok = self
            .config
            .confidence_threshold
            .map(|threshold| detection.detection.confidence >= threshold)
            .unwrap_or(true);
        class_ok && confidence_ok
    }

    pub fn any_relevant(&self, detections: &[protocol::DetectionNamed]) -> bool {
        detections.iter().any(|d| self.is_relevant(d))
    }

    fn desired_max_frame_bytes(&self) -> u64 {
        self.config.pixel_byte_len() as u64
    }

    /// Builds the Init envelope. `prefer_jpeg` reorders `accepted_codecs`
    /// to put JPEG first, used when entering degradation.
    pub fn build_init(&mut self, prefer_jpeg: bool) -> Envelope {
        self.prefer_jpeg = prefer_jpeg;
        let accepted_codecs = if prefer_jpeg {
            vec![Codec::Jpeg, Codec::Raw]
        } else {
            vec![Codec::Raw, Codec::Jpeg]
        };
        let init = Init {
            model: self.config.model.clone(),
            caps: Capabilities {
                accepted_pixel_formats: vec![PixelFormat::Nv12, PixelFormat::I420],
                accepted_codecs,
                max_width: self.config.width,
                max_height: self.config.height,
                max_inflight: self.config.max_inflight,
                desired_max_frame_bytes: self.desired_max_frame_bytes(),
                preprocessing: PreprocessingHints::default(),
            },
            classes_filter: self.config.classes_filter.clone(),
            confidence_threshold: self.config.confidence_threshold,
        };
        Envelope::new(
            self.stream_id.clone().unwrap_or_default(),
            protocol::Payload::Init(init),
        )
    }

    pub fn handle_init_ok(&mut self, init_ok: &protocol::InitOk) {
        self.chosen = Some(init_ok.chosen);
        self.max_frame_bytes = init_ok.max_frame_bytes;
        self.window.initialize(init_ok.chosen.initial_credits);
        // §4.6.1: stream_id is regenerated per reconnect, and frame_id is
        // only unique within one connection's lifetime, so a fresh
        // handshake starts the counter over too.
        self.frame_id_counter = 0;
        self.send_ts.clear();
        info!(
            codec = ?init_ok.chosen.codec,
            max_frame_bytes = init_ok.max_frame_bytes,
            "feeder ready"
        );
    }

    /// Idempotent: a second call is a no-op and returns `false`.
    pub fn start(&mut self) -> bool {
        if self.started {
            return false;
        }
        self.started = true;
        true
    }

    pub fn stop(&mut self) {
        self.started = false;
        self.pending = None;
    }

    pub fn destroy(&mut self) {
        self.stop();
        self.cache.destroy();
    }

    fn send_envelope(&self, envelope: Envelope) {
        if let Some(send) = &self.send {
            if send.send(envelope).is_err() {
                warn!("feeder tried to send after the connection channel closed");
            }
        }
    }

    /// Per-frame decision, §4.5.2. Called for every captured buffer.
    pub fn submit_frame(&mut self, frame: CaptureFrame) {
        if !self.started || self.chosen.is_none() {
            return;
        }

        let expected_len = self.config.pixel_byte_len();
        if frame.data.len() != expected_len {
            warn!(
                got = frame.data.len(),
                expected = expected_len,
                "captured frame has unexpected buffer length"
            );
            self.trigger_degradation(Instant::now());
            return;
        }
        if frame.data.len() as u64 > self.max_frame_bytes {
            warn!("captured frame exceeds max_frame_bytes, triggering degradation");
            self.trigger_degradation(Instant::now());
            return;
        }

        if self.window.has_credits() {
            self.send_frame(frame);
        } else {
            self.pending = Some(frame);
            self.metrics.latest_wins_drops += 1;
            debug!(
                drops = self.metrics.latest_wins_drops,
                "no credits available, LATEST_WINS replaced pending frame"
            );
        }
    }

    fn send_frame(&mut self, frame: CaptureFrame) {
        let chosen = match self.chosen {
            Some(c) => c,
            None => return,
        };
        let frame_id = self.frame_id_counter;
        self.frame_id_counter += 1;

        self.cache.insert(
            frame_id,
            CachedFrame {
                data: frame.data.clone(),
                width: chosen.width,
                height: chosen.height,
                ts_utc_ns: frame.ts_utc_ns,
            },
        );

        let (codec, data, planes) = match chosen.codec {
            Codec::Jpeg => match crate::jpeg::yuv420_to_jpeg(
                &frame.data,
                chosen.width,
                chosen.height,
                frame.pixel_format,
                JPEG_QUALITY,
            ) {
                Ok(jpeg) => (Codec::Jpeg, jpeg, Vec::new()),
                Err(err) => {
                    warn!(%err, "JPEG encode failed, falling back to RAW for this frame");
                    (Codec::Raw, frame.data.clone(), raw_planes(&frame))
                }
            },
            Codec::Raw => (Codec::Raw, frame.data.clone(), raw_planes(&frame)),
        };

        let envelope = Envelope::new(
            self.stream_id.clone().unwrap_or_default(),
            protocol::Payload::Frame(Frame {
                frame_id,
                ts_mono_ns: frame.ts_mono_ns,
                ts_utc_ns: frame.ts_utc_ns,
                session_id: self.session_id.clone(),
                width: chosen.width,
                height: chosen.height,
                pixel_format: frame.pixel_format,
                codec,
                planes,
                data,
            }),
        );

        self.send_envelope(envelope);
        self.window.on_frame_sent();
        self.send_ts.insert(frame_id, Instant::now());
    }

    fn try_flush_pending(&mut self) {
        if !self.window.has_credits() {
            return;
        }
        if let Some(frame) = self.pending.take() {
            self.send_frame(frame);
        }
    }

    pub fn handle_result(&mut self, frame_id: u64) {
        self.window.on_result_received();
        self.send_ts.remove(&frame_id);
        self.try_flush_pending();
    }

    pub fn handle_window_update(&mut self, new_size: u32) {
        self.window.on_window_update(new_size);
        self.try_flush_pending();
    }

    /// Handles a worker Error, §4.5.4 / §7. Returns the new Init envelope
    /// to send if this error should trigger degradation and the
    /// degradation budget/cooldown allow it.
    pub fn handle_error(&mut self, error: &ErrorPayload) -> Option<Envelope> {
        if error.code.triggers_degradation() {
            return self.trigger_degradation(Instant::now());
        }
        None
    }

    fn trigger_degradation(&mut self, now: Instant) -> Option<Envelope> {
        if self.prefer_jpeg {
            // Already degraded; no further attempt to make.
            return None;
        }
        if !self.degradation.try_trigger(now) {
            if self.degradation.exhausted() {
                warn!("degradation attempts exhausted, giving up");
            }
            return None;
        }
        Some(self.build_init(true))
    }
}

fn raw_planes(frame: &CaptureFrame) -> Vec<Plane> {
    match frame.pixel_format {
        PixelFormat::Nv12 => {
            // Caller validated the overall length; plane sizes are derived,
            // not independently measured.
            let total = frame.data.len() as u32;
            let y_size = total * 2 / 3;
            vec![
                Plane {
                    stride: 0,
                    offset: 0,
                    size: y_size,
                },
                Plane {
                    stride: 0,
                    offset: y_size,
                    size: total - y_size,
                },
            ]
        }
        PixelFormat::I420 => {
            let total = frame.data.len() as u32;
            let y_size = total * 2 / 3;
            let chroma_size = (total - y_size) / 2;
            vec![
                Plane {
                    stride: 0,
                    offset: 0,
                    size: y_size,
                },
                Plane {
                    stride: 0,
                    offset: y_size,
                    size: chroma_size,
                },
                Plane {
                    stride: 0,
                    offset: y_size + chroma_size,
                    size: chroma_size,
                },
            ]
        }
    }
}

impl FeederConfig {
    fn pixel_byte_len(&self) -> usize {
        PixelFormat::Nv12.byte_len(self.width, self.height)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use protocol::{Codec, InitOk, WindowPolicy};

    fn config() -> FeederConfig {
        FeederConfig {
            model: "yolo".into(),
            width: 4,
            height: 4,
            max_inflight: 4,
            classes_filter: None,
            confidence_threshold: None,
        }
    }

    fn sample_frame() -> CaptureFrame {
        CaptureFrame {
            data: vec![0u8; PixelFormat::Nv12.byte_len(4, 4)],
            pixel_format: PixelFormat::Nv12,
            ts_mono_ns: 0,
            ts_utc_ns: 0,
        }
    }

    fn ready_feeder(window: u32) -> (Feeder, tokio::sync::mpsc::UnboundedReceiver<Envelope>) {
        let cache = FrameCache::new(Duration::from_millis(2000));
        let mut feeder = Feeder::new(config(), cache);
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
        feeder.set_send_fn(tx);
        feeder.set_stream_id("s1".into());
        feeder.start();
        feeder.handle_init_ok(&InitOk {
            chosen: ChosenFormat {
                pixel_format: PixelFormat::Nv12,
                codec: Codec::Raw,
                width: 4,
                height: 4,
                policy: WindowPolicy::LatestWins,
                initial_credits: window,
            },
            color_space: None,
            color_range: None,
            max_frame_bytes: 1 << 20,
        });
        (feeder, rx)
    }

    #[test]
    fn build_init_prefers_jpeg_when_requested() {
        let cache = FrameCache::new(Duration::from_millis(2000));
        let mut feeder = Feeder::new(config(), cache.clone());
        feeder.set_stream_id("s1".into());
        let env = feeder.build_init(true);
        if let protocol::Payload::Init(init) = env.payload {
            assert_eq!(init.caps.accepted_codecs[0], Codec::Jpeg);
        } else {
            panic!("expected Init payload");
        }
        cache.destroy();
    }

    #[test]
    fn two_build_inits_are_identical_modulo_stream_id() {
        let cache = FrameCache::new(Duration::from_millis(2000));
        let mut a = Feeder::new(config(), cache.clone());
        let mut b = Feeder::new(config(), cache.clone());
        a.set_stream_id("s1".into());
        b.set_stream_id("s2".into());
        let ea = a.build_init(true);
        let eb = b.build_init(true);
        assert_eq!(ea.payload, eb.payload);
        assert_ne!(ea.stream_id, eb.stream_id);
        cache.destroy();
    }

    #[test]
    fn start_is_idempotent() {
        let cache = FrameCache::new(Duration::from_millis(2000));
        let mut feeder = Feeder::new(config(), cache.clone());
        assert!(feeder.start());
        assert!(!feeder.start());
        cache.destroy();
    }

    #[tokio::test]
    async fn sends_immediately_when_credits_available() {
        let (mut feeder, mut rx) = ready_feeder(2);
        feeder.submit_frame(sample_frame());
        assert_eq!(feeder.window().inflight(), 1);
        let envelope = rx.try_recv().expect("frame should have been sent");
        assert!(matches!(envelope.payload, protocol::Payload::Frame(_)));
        feeder.destroy();
    }

    #[tokio::test]
    async fn latest_wins_when_window_exhausted() {
        let (mut feeder, mut rx) = ready_feeder(1);
        feeder.submit_frame(sample_frame());
        rx.try_recv().unwrap();
        feeder.submit_frame(sample_frame());
        feeder.submit_frame(sample_frame());
        assert!(rx.try_recv().is_err());
        assert_eq!(feeder.metrics().latest_wins_drops, 2);
        feeder.destroy();
    }

    #[tokio::test]
    async fn result_then_window_update_flushes_pending() {
        let (mut feeder, mut rx) = ready_feeder(2);
        feeder.submit_frame(sample_frame());
        feeder.submit_frame(sample_frame());
        rx.try_recv().unwrap();
        rx.try_recv().unwrap();
        feeder.submit_frame(sample_frame());
        assert!(rx.try_recv().is_err());

        feeder.handle_result(0);
        feeder.handle_result(1);
        feeder.handle_window_update(3);

        let envelope = rx.try_recv().expect("pending frame should have flushed");
        assert!(matches!(envelope.payload, protocol::Payload::Frame(_)));
        assert_eq!(feeder.window().inflight(), 1);
        feeder.destroy();
    }
}
