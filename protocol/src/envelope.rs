//! Wire message types for Protocol v1, §3 of the spec.
//!
//! A connection exchanges a stream of [`Envelope`]s. Each envelope names a
//! [`MsgType`] tag and carries exactly one [`Payload`] variant; the two must
//! agree (checked in [`crate::validate`]) or the envelope is `BAD_MESSAGE`.

use serde::{Deserialize, Serialize};

pub const PROTOCOL_VERSION: u32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MsgType {
    Init,
    InitOk,
    Frame,
    Result,
    WindowUpdate,
    Heartbeat,
    Error,
    End,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PixelFormat {
    Nv12,
    I420,
}

impl PixelFormat {
    /// Number of bytes in a full-resolution 4:2:0 buffer of this format.
    pub fn byte_len(self, width: u32, height: u32) -> usize {
        // NV12 and I420 both pack 12 bits/pixel on average (one luma byte
        // per pixel, two chroma bytes per four pixels), just with the
        // chroma bytes arranged differently.
        (width as usize * height as usize * 3) / 2
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Codec {
    Raw,
    Jpeg,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WindowPolicy {
    LatestWins,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PreprocessingHints {
    #[serde(default)]
    pub letterbox: bool,
    #[serde(default)]
    pub normalize: bool,
    pub layout: Option<String>,
    pub dtype: Option<String>,
}

impl Default for PreprocessingHints {
    fn default() -> Self {
        Self {
            letterbox: false,
            normalize: false,
            layout: None,
            dtype: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Capabilities {
    pub accepted_pixel_formats: Vec<PixelFormat>,
    /// Order expresses preference; degradation reorders this to prefer JPEG.
    pub accepted_codecs: Vec<Codec>,
    pub max_width: u32,
    pub max_height: u32,
    pub max_inflight: u32,
    pub desired_max_frame_bytes: u64,
    #[serde(default)]
    pub preprocessing: PreprocessingHints,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Init {
    pub model: String,
    pub caps: Capabilities,
    pub classes_filter: Option<Vec<String>>,
    pub confidence_threshold: Option<f32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ChosenFormat {
    pub pixel_format: PixelFormat,
    pub codec: Codec,
    pub width: u32,
    pub height: u32,
    pub policy: WindowPolicy,
    pub initial_credits: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InitOk {
    pub chosen: ChosenFormat,
    pub color_space: Option<String>,
    pub color_range: Option<String>,
    pub max_frame_bytes: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Plane {
    pub stride: u32,
    pub offset: u32,
    pub size: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Frame {
    pub frame_id: u64,
    pub ts_mono_ns: u64,
    pub ts_utc_ns: u64,
    #[serde(default)]
    pub session_id: String,
    pub width: u32,
    pub height: u32,
    pub pixel_format: PixelFormat,
    pub codec: Codec,
    pub planes: Vec<Plane>,
    #[serde(with = "serde_bytes")]
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Detection {
    /// `[x1, y1, x2, y2]` in pixel coordinates of the sent frame.
    pub bbox_xyxy: [f32; 4],
    pub confidence: f32,
    pub track_id: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectionNamed {
    #[serde(flatten)]
    pub detection: Detection,
    pub class_name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultPayload {
    pub frame_id: u64,
    pub detections: Vec<DetectionNamed>,
    pub pre_ms: f32,
    pub infer_ms: f32,
    pub post_ms: f32,
    pub total_ms: f32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WindowUpdate {
    /// Authoritative absolute window size, not a delta.
    pub new_size: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Heartbeat {
    pub last_seen_frame_id: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorCode {
    VersionUnsupported,
    BadMessage,
    BadSequence,
    UnsupportedFormat,
    InvalidFrame,
    FrameTooLarge,
    ModelNotReady,
    Oom,
    BackpressureTimeout,
    Internal,
}

impl ErrorCode {
    /// Codes that trigger edge-side degradation rather than closing the
    /// connection, per §4.5.4 / §7.
    pub fn triggers_degradation(self) -> bool {
        matches!(
            self,
            ErrorCode::FrameTooLarge | ErrorCode::UnsupportedFormat
        )
    }

    /// Codes that are fatal for the connection, per §4.6.2.
    pub fn is_fatal(self) -> bool {
        matches!(
            self,
            ErrorCode::VersionUnsupported | ErrorCode::BadMessage | ErrorCode::BadSequence
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub code: ErrorCode,
    pub message: String,
    pub retry_after_ms: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct End {
    pub session_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Payload {
    Init(Init),
    InitOk(InitOk),
    Frame(Frame),
    Result(ResultPayload),
    WindowUpdate(WindowUpdate),
    Heartbeat(Heartbeat),
    Error(ErrorPayload),
    End(End),
}

impl Payload {
    pub fn kind(&self) -> MsgType {
        match self {
            Payload::Init(_) => MsgType::Init,
            Payload::InitOk(_) => MsgType::InitOk,
            Payload::Frame(_) => MsgType::Frame,
            Payload::Result(_) => MsgType::Result,
            Payload::WindowUpdate(_) => MsgType::WindowUpdate,
            Payload::Heartbeat(_) => MsgType::Heartbeat,
            Payload::Error(_) => MsgType::Error,
            Payload::End(_) => MsgType::End,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub protocol_version: u32,
    pub stream_id: String,
    pub msg_type: MsgType,
    pub payload: Payload,
}

impl Envelope {
    pub fn new(stream_id: impl Into<String>, payload: Payload) -> Self {
        Self {
            protocol_version: PROTOCOL_VERSION,
            stream_id: stream_id.into(),
            msg_type: payload.kind(),
            payload,
        }
    }

    pub fn heartbeat(stream_id: impl Into<String>, last_seen_frame_id: Option<u64>) -> Self {
        Self::new(stream_id, Payload::Heartbeat(Heartbeat { last_seen_frame_id }))
    }

    pub fn error(
        stream_id: impl Into<String>,
        code: ErrorCode,
        message: impl Into<String>,
        retry_after_ms: Option<u64>,
    ) -> Self {
        Self::new(
            stream_id,
            Payload::Error(ErrorPayload {
                code,
                message: message.into(),
                retry_after_ms,
            }),
        )
    }

    pub fn end(stream_id: impl Into<String>, session_id: impl Into<String>) -> Self {
        Self::new(
            stream_id,
            Payload::End(End {
                session_id: session_id.into(),
            }),
        )
    }
}
