//! Bridges the capture child process's shared-memory socket to the feeder,
//! §6.2 and §9 ("Indefinite retries for capture reconnection") of the spec.
//!
//! The concrete shared-memory transport is an external collaborator per
//! §1; what this module owns is the behavior the spec does pin down: treat
//! the socket as cold until its file exists, poll for it with exponential
//! backoff from 1 s to a 30 s ceiling, and never give up. Once connected,
//! each record is forwarded to [`crate::feeder::Feeder::submit_frame`]
//! unconditionally — the feeder itself decides whether to send, cache, or
//! drop it.
//!
//! Wire shape of one record on the socket (an internal convention between
//! this reader and the capture child, not Protocol v1):
//! `[8 bytes ts_mono_ns][8 bytes ts_utc_ns][1 byte pixel_format][4 bytes
//! len][len bytes NV12/I420 data]`, all big-endian.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::AsyncReadExt;
use tokio::net::UnixStream;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use protocol::PixelFormat;

use crate::feeder::{CaptureFrame, Feeder};

const MIN_BACKOFF: Duration = Duration::from_secs(1);
const MAX_BACKOFF: Duration = Duration::from_secs(30);

fn pixel_format_from_tag(tag: u8) -> Option<PixelFormat> {
    match tag {
        0 => Some(PixelFormat::Nv12),
        1 => Some(PixelFormat::I420),
        _ => None,
    }
}

/// Waits for `path` to exist, polling with capped exponential backoff.
/// Never gives up; camera outages can last minutes, per §9.
pub async fn wait_for_socket(path: &std::path::Path) {
    let mut delay = MIN_BACKOFF;
    while !path.exists() {
        debug!(?path, ?delay, "capture socket not yet present, waiting");
        tokio::time::sleep(delay).await;
        delay = (delay * 2).min(MAX_BACKOFF);
    }
}

async fn read_one_frame(stream: &mut UnixStream) -> std::io::Result<CaptureFrame> {
    let ts_mono_ns = stream.read_u64().await?;
    let ts_utc_ns = stream.read_u64().await?;
    let format_tag = stream.read_u8().await?;
    let len = stream.read_u32().await? as usize;
    let mut data = vec![0u8; len];
    stream.read_exact(&mut data).await?;
    let pixel_format = pixel_format_from_tag(format_tag).unwrap_or(PixelFormat::Nv12);
    Ok(CaptureFrame {
        data,
        pixel_format,
        ts_mono_ns,
        ts_utc_ns,
    })
}

/// Runs the capture bridge until `shutdown` fires. Reconnects indefinitely
/// on EOF or I/O error, waiting for the socket file per [`wait_for_socket`]
/// before each attempt.
pub async fn run(
    socket_path: PathBuf,
    feeder: Arc<Mutex<Feeder>>,
    mut shutdown: tokio::sync::watch::Receiver<bool>,
) {
    loop {
        if *shutdown.borrow() {
            return;
        }
        tokio::select! {
            _ = wait_for_socket(&socket_path) => {}
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    return;
                }
            }
        }
        if *shutdown.borrow() {
            return;
        }

        let mut stream = match UnixStream::connect(&socket_path).await {
            Ok(s) => s,
            Err(err) => {
                warn!(%err, "failed to connect to capture socket, retrying");
                continue;
            }
        };
        info!(socket_path = %socket_path.display(), "connected to capture socket");

        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        return;
                    }
                }
                frame = read_one_frame(&mut stream) => {
                    match frame {
                        Ok(frame) => {
                            feeder.lock().await.submit_frame(frame);
                        }
                        Err(err) => {
                            warn!(%err, "capture socket read failed, reconnecting");
                            break;
                        }
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_format_tag_falls_back_to_nv12() {
        assert_eq!(pixel_format_from_tag(0), Some(PixelFormat::Nv12));
        assert_eq!(pixel_format_from_tag(1), Some(PixelFormat::I420));
        assert_eq!(pixel_format_from_tag(9), None);
    }
}
