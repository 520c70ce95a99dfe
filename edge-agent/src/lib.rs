//! Edge Agent: capture ingestion, frame feeding, and recording orchestration
//! for the video inference pipeline (spec §4.5-§4.8, §6.1-§6.2).
//!
//! This crate is organized the way the pipeline's own diagram (§2) reads:
//! a [`frame_reader`] bridges the capture child process to the [`feeder`],
//! which enforces flow control and degradation over a connection owned by
//! [`tcp_client`]; detections drive the [`orchestrator`] (a pure reducer)
//! through its [`adapter`], which in turn drives the [`child_process`]
//! publisher and the [`store_client`]. The [`ingester`] uploads still
//! frames for relevant detections via the [`frame_cache`].

pub mod adapter;
pub mod child_process;
pub mod degradation;
pub mod feeder;
pub mod frame_cache;
pub mod frame_reader;
pub mod ingester;
pub mod jpeg;
pub mod orchestrator;
pub mod shutdown;
pub mod store_client;
pub mod tcp_client;
pub mod window;
