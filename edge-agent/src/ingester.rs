//! Uploads a still frame plus detection metadata to the session store for
//! every detection the orchestrator considers worth recording, §4.8 of the
//! spec.

use std::time::Duration;

use bytes::Bytes;
use http_body_util::Full;
use hyper::Request;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use serde::Serialize;
use tokio::sync::mpsc::UnboundedReceiver;
use tracing::{debug, warn};

use crate::frame_cache::FrameCache;
use crate::jpeg;

const DEFAULT_MAX_RETRIES: u32 = 3;
const BASE_BACKOFF: Duration = Duration::from_millis(200);
const BOUNDARY: &str = "edge-agent-ingest-boundary";

#[derive(Debug, Clone)]
pub struct IngestItem {
    pub frame_id: u64,
    pub session_id: String,
    pub track_id: Option<u64>,
    pub class_name: String,
    pub confidence: f32,
    pub bbox_xyxy: [f32; 4],
}

#[derive(Debug, Serialize)]
struct IngestMeta<'a> {
    #[serde(rename = "sessionId")]
    session_id: &'a str,
    #[serde(rename = "trackId", skip_serializing_if = "Option::is_none")]
    track_id: Option<u64>,
    cls: &'a str,
    conf: f32,
    bbox: [f32; 4],
    #[serde(rename = "captureTs")]
    capture_ts: u64,
    #[serde(rename = "urlFrame")]
    url_frame: String,
}

pub struct Ingester {
    store_base_url: String,
    cache: FrameCache,
    client: Client<hyper_util::client::legacy::connect::HttpConnector, Full<Bytes>>,
    max_retries: u32,
}

impl Ingester {
    pub fn new(store_base_url: impl Into<String>, cache: FrameCache) -> Self {
        Self {
            store_base_url: store_base_url.into(),
            cache,
            client: Client::builder(TokioExecutor::new()).build_http(),
            max_retries: DEFAULT_MAX_RETRIES,
        }
    }

    /// Drains `items` until the channel closes, uploading each in turn.
    /// Runs as its own task; the feeder and cache outlive it only as long
    /// as needed since `cache` is a cheap cloneable handle.
    pub async fn run(mut self, mut items: UnboundedReceiver<IngestItem>) {
        while let Some(item) = items.recv().await {
            if let Err(err) = self.ingest_one(&item).await {
                warn!(frame_id = item.frame_id, %err, "dropping ingest item");
            }
        }
    }

    async fn ingest_one(&mut self, item: &IngestItem) -> Result<(), Error> {
        let cached = match self.cache.get(item.frame_id) {
            Some(frame) => frame,
            None => {
                debug!(frame_id = item.frame_id, "frame gone from cache, skipping ingestion");
                return Ok(());
            }
        };

        let jpeg_bytes = jpeg::yuv420_to_jpeg(
            &cached.data,
            cached.width,
            cached.height,
            protocol::PixelFormat::Nv12,
            85,
        )?;

        let meta = IngestMeta {
            session_id: &item.session_id,
            track_id: item.track_id,
            cls: &item.class_name,
            conf: item.confidence,
            bbox: item.bbox_xyxy,
            capture_ts: cached.ts_utc_ns,
            url_frame: format!("frame-{}.jpg", item.frame_id),
        };
        let meta_json = serde_json::to_vec(&meta)?;

        let body = build_multipart_body(&meta_json, &jpeg_bytes);
        self.post_with_retry(body).await
    }

    async fn post_with_retry(&self, body: Vec<u8>) -> Result<(), Error> {
        let uri: hyper::Uri = format!("{}/ingest", self.store_base_url)
            .parse()
            .expect("store base_url plus /ingest is a valid URI");

        let mut attempt = 0;
        loop {
            attempt += 1;
            let request = Request::post(uri.clone())
                .header(
                    hyper::header::CONTENT_TYPE,
                    format!("multipart/form-data; boundary={BOUNDARY}"),
                )
                .body(Full::new(Bytes::from(body.clone())))
                .expect("well-formed request");

            match self.client.request(request).await {
                Ok(response) if response.status().is_success() => return Ok(()),
                Ok(response) if response.status() == hyper::StatusCode::TOO_MANY_REQUESTS => {
                    let retry_after = response
                        .headers()
                        .get(hyper::header::RETRY_AFTER)
                        .and_then(|v| v.to_str().ok())
                        .and_then(|v| v.parse::<u64>().ok())
                        .map(Duration::from_secs)
                        .unwrap_or(BASE_BACKOFF);
                    if attempt > self.max_retries {
                        return Err(Error::RetriesExhausted);
                    }
                    tokio::time::sleep(retry_after).await;
                }
                Ok(response) if response.status().is_client_error() => {
                    return Err(Error::Status(response.status()));
                }
                Ok(response) => {
                    if attempt > self.max_retries {
                        return Err(Error::Status(response.status()));
                    }
                    tokio::time::sleep(BASE_BACKOFF * 2u32.saturating_pow(attempt - 1)).await;
                }
                Err(err) => {
                    if attempt > self.max_retries {
                        return Err(err.into());
                    }
                    tokio::time::sleep(BASE_BACKOFF * 2u32.saturating_pow(attempt - 1)).await;
                }
            }
        }
    }
}

fn build_multipart_body(meta_json: &[u8], jpeg_bytes: &[u8]) -> Vec<u8> {
    let mut body = Vec::with_capacity(meta_json.len() + jpeg_bytes.len() + 256);
    body.extend_from_slice(format!("--{BOUNDARY}\r\n").as_bytes());
    body.extend_from_slice(
        b"Content-Disposition: form-data; name=\"meta\"\r\nContent-Type: application/json\r\n\r\n",
    );
    body.extend_from_slice(meta_json);
    body.extend_from_slice(b"\r\n");

    body.extend_from_slice(format!("--{BOUNDARY}\r\n").as_bytes());
    body.extend_from_slice(
        b"Content-Disposition: form-data; name=\"frame\"; filename=\"frame.jpg\"\r\nContent-Type: image/jpeg\r\n\r\n",
    );
    body.extend_from_slice(jpeg_bytes);
    body.extend_from_slice(b"\r\n");

    body.extend_from_slice(format!("--{BOUNDARY}--\r\n").as_bytes());
    body
}

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error(transparent)]
    Jpeg(#[from] jpeg::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    #[error(transparent)]
    Http(#[from] hyper_util::client::legacy::Error),
    #[error("store returned status {0}")]
    Status(hyper::StatusCode),
    #[error("exhausted retries uploading to the store")]
    RetriesExhausted,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn multipart_body_contains_both_parts_and_closing_boundary() {
        let body = build_multipart_body(b"{\"a\":1}", b"\xff\xd8\xff");
        let text = String::from_utf8_lossy(&body);
        assert!(text.contains("name=\"meta\""));
        assert!(text.contains("name=\"frame\""));
        assert!(text.trim_end().ends_with(&format!("--{BOUNDARY}--")));
    }
}
