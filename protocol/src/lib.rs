//! Protocol v1: the wire contract between an edge agent and an inference
//! worker — message types, framing, and per-envelope validation.

mod codec;
mod envelope;
mod error;
mod validate;

pub use codec::EnvelopeCodec;
pub use envelope::{
    Capabilities, ChosenFormat, Codec, Detection, DetectionNamed, End, Envelope, ErrorCode,
    ErrorPayload, Frame, Heartbeat, Init, InitOk, MsgType, Payload, PixelFormat, Plane,
    PreprocessingHints, ResultPayload, WindowPolicy, WindowUpdate, PROTOCOL_VERSION,
};
pub use error::{Error, Result};
pub use validate::{validate_envelope, ConnState, Violation};
