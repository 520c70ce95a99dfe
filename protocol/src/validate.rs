//! Per-envelope structural checks, §4.2 of the spec.
//!
//! These are the checks the receiving side runs on every inbound envelope
//! before it is handed to application logic. They catch malformed traffic
//! regardless of which side (edge or worker) is receiving.

use crate::envelope::{Envelope, MsgType, Payload, PROTOCOL_VERSION};

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum Violation {
    #[error("unsupported protocol version {got}, expected {expected}")]
    VersionMismatch { got: u32, expected: u32 },

    #[error("msg_type {declared:?} does not match payload variant {actual:?}")]
    PayloadMismatch { declared: MsgType, actual: MsgType },

    #[error("empty stream_id")]
    EmptyStreamId,

    #[error("{what} out of order: {detail}")]
    BadSequence { what: &'static str, detail: String },

    #[error("frame has {planes} plane descriptor(s) but pixel format requires {expected}")]
    PlaneCountMismatch { planes: usize, expected: usize },
}

/// Checks that apply uniformly to every envelope, independent of connection
/// state: version match, msg_type/payload agreement, non-empty stream_id.
pub fn validate_envelope(env: &Envelope) -> Result<(), Violation> {
    if env.protocol_version != PROTOCOL_VERSION {
        return Err(Violation::VersionMismatch {
            got: env.protocol_version,
            expected: PROTOCOL_VERSION,
        });
    }
    if env.stream_id.is_empty() {
        return Err(Violation::EmptyStreamId);
    }
    let actual = env.payload.kind();
    if env.msg_type != actual {
        return Err(Violation::PayloadMismatch {
            declared: env.msg_type,
            actual,
        });
    }
    if let Payload::Frame(frame) = &env.payload {
        let expected_planes = match frame.pixel_format {
            crate::envelope::PixelFormat::Nv12 => 2,
            crate::envelope::PixelFormat::I420 => 3,
        };
        if frame.codec == crate::envelope::Codec::Raw && frame.planes.len() != expected_planes {
            return Err(Violation::PlaneCountMismatch {
                planes: frame.planes.len(),
                expected: expected_planes,
            });
        }
    }
    Ok(())
}

/// Connection-state-machine ordering checks, §4.6.1 / §4.9.1: which
/// message types are legal given what has already been exchanged on this
/// connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    AwaitingInit,
    AwaitingInitOk,
    Streaming,
    Closing,
}

impl ConnState {
    /// Returns the next state, or a [`Violation::BadSequence`] if `msg_type`
    /// is not legal in the current state.
    pub fn advance(self, msg_type: MsgType) -> Result<ConnState, Violation> {
        use ConnState::*;
        use MsgType::*;
        match (self, msg_type) {
            (AwaitingInit, Init) => Ok(AwaitingInitOk),
            (AwaitingInitOk, InitOk) => Ok(Streaming),
            (Streaming, Frame | Result | WindowUpdate | Heartbeat) => Ok(Streaming),
            (Streaming, End) => Ok(Closing),
            (_, Error) => Ok(Closing),
            (state, got) => Err(Violation::BadSequence {
                what: "message type",
                detail: format!("{:?} is not valid in state {:?}", got, state),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::*;

    fn sample_init() -> Envelope {
        Envelope::new(
            "s1",
            Payload::Init(Init {
                model: "yolo".into(),
                caps: Capabilities {
                    accepted_pixel_formats: vec![PixelFormat::Nv12],
                    accepted_codecs: vec![Codec::Raw],
                    max_width: 1920,
                    max_height: 1080,
                    max_inflight: 4,
                    desired_max_frame_bytes: 1 << 20,
                    preprocessing: PreprocessingHints::default(),
                },
                classes_filter: None,
                confidence_threshold: None,
            }),
        )
    }

    #[test]
    fn accepts_well_formed_envelope() {
        assert!(validate_envelope(&sample_init()).is_ok());
    }

    #[test]
    fn rejects_version_mismatch() {
        let mut env = sample_init();
        env.protocol_version = 99;
        assert_eq!(
            validate_envelope(&env),
            Err(Violation::VersionMismatch {
                got: 99,
                expected: PROTOCOL_VERSION
            })
        );
    }

    #[test]
    fn rejects_empty_stream_id() {
        let mut env = sample_init();
        env.stream_id = String::new();
        assert_eq!(validate_envelope(&env), Err(Violation::EmptyStreamId));
    }

    #[test]
    fn rejects_mismatched_msg_type() {
        let mut env = sample_init();
        env.msg_type = MsgType::Frame;
        assert!(matches!(
            validate_envelope(&env),
            Err(Violation::PayloadMismatch { .. })
        ));
    }

    #[test]
    fn state_machine_accepts_happy_path() {
        let s = ConnState::AwaitingInit;
        let s = s.advance(MsgType::Init).unwrap();
        assert_eq!(s, ConnState::AwaitingInitOk);
        let s = s.advance(MsgType::InitOk).unwrap();
        assert_eq!(s, ConnState::Streaming);
        let s = s.advance(MsgType::Frame).unwrap();
        assert_eq!(s, ConnState::Streaming);
        let s = s.advance(MsgType::End).unwrap();
        assert_eq!(s, ConnState::Closing);
    }

    #[test]
    fn state_machine_rejects_frame_before_init_ok() {
        let s = ConnState::AwaitingInitOk;
        assert!(s.advance(MsgType::Frame).is_err());
    }

    #[test]
    fn state_machine_rejects_double_init() {
        let s = ConnState::AwaitingInitOk;
        assert!(s.advance(MsgType::Init).is_err());
    }
}
