//! Inference worker: per-connection decode/infer/track/persist pipeline,
//! §4.9-§4.11 of the spec.

pub mod connection;
pub mod decode;
pub mod error;
pub mod model;
pub mod postprocess;
pub mod server;
pub mod session_writer;
pub mod tracker;
