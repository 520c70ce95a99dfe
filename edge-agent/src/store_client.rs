//! HTTP client for the session store, §6.3 of the spec.
//!
//! Only `POST /sessions` and `POST /sessions/{id}/close` live here; the
//! multipart `/ingest` upload is large enough (and has its own retry/backoff
//! shape) to live in [`crate::ingester`].

use std::time::Duration;

use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::Request;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use serde::{Deserialize, Serialize};
use tracing::warn;

const MAX_ATTEMPTS: u32 = 5;
const BASE_BACKOFF: Duration = Duration::from_millis(200);

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error(transparent)]
    Http(#[from] hyper_util::client::legacy::Error),
    #[error(transparent)]
    Hyper(#[from] hyper::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    #[error("store returned status {0}")]
    Status(hyper::StatusCode),
    #[error("exhausted {0} retries against the store")]
    RetriesExhausted(u32),
}

#[derive(Debug, Serialize)]
struct OpenSessionRequest<'a> {
    #[serde(rename = "deviceId")]
    device_id: &'a str,
    #[serde(rename = "startTs")]
    start_ts: &'a str,
    #[serde(rename = "configuredClasses", skip_serializing_if = "Option::is_none")]
    configured_classes: Option<&'a [String]>,
}

#[derive(Debug, Deserialize)]
struct OpenSessionResponse {
    #[serde(rename = "sessionId")]
    session_id: String,
}

#[derive(Debug, Serialize)]
struct CloseSessionRequest<'a> {
    #[serde(rename = "endTs")]
    end_ts: &'a str,
    #[serde(rename = "detectedClasses", skip_serializing_if = "Option::is_none")]
    detected_classes: Option<&'a [String]>,
}

#[derive(Clone)]
pub struct StoreClient {
    base_url: String,
    client: Client<hyper_util::client::legacy::connect::HttpConnector, Full<Bytes>>,
}

impl StoreClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            client: Client::builder(TokioExecutor::new()).build_http(),
        }
    }

    async fn post_json_with_retry(&self, path: &str, body: Vec<u8>) -> Result<Bytes, Error> {
        let uri: hyper::Uri = format!("{}{}", self.base_url, path).parse().map_err(|_| {
            Error::Status(hyper::StatusCode::BAD_REQUEST)
        })?;

        let mut attempt = 0;
        loop {
            attempt += 1;
            let request = Request::post(uri.clone())
                .header(hyper::header::CONTENT_TYPE, "application/json")
                .body(Full::new(Bytes::from(body.clone())))
                .expect("well-formed request");

            match self.client.request(request).await {
                Ok(response) if response.status().is_success() => {
                    let body = response.into_body().collect().await?.to_bytes();
                    return Ok(body);
                }
                Ok(response) => {
                    let status = response.status();
                    if attempt >= MAX_ATTEMPTS || !status.is_server_error() {
                        return Err(Error::Status(status));
                    }
                    warn!(%status, attempt, "store request failed, retrying");
                }
                Err(err) => {
                    if attempt >= MAX_ATTEMPTS {
                        return Err(err.into());
                    }
                    warn!(%err, attempt, "store request transport error, retrying");
                }
            }
            tokio::time::sleep(BASE_BACKOFF * 2u32.saturating_pow(attempt - 1)).await;
        }
    }

    pub async fn open_session(
        &self,
        device_id: &str,
        start_ts: &str,
        configured_classes: Option<&[String]>,
    ) -> Result<String, Error> {
        let body = serde_json::to_vec(&OpenSessionRequest {
            device_id,
            start_ts,
            configured_classes,
        })?;
        let response = self.post_json_with_retry("/sessions", body).await?;
        let parsed: OpenSessionResponse = serde_json::from_slice(&response)?;
        Ok(parsed.session_id)
    }

    pub async fn close_session(
        &self,
        session_id: &str,
        end_ts: &str,
        detected_classes: Option<&[String]>,
    ) -> Result<(), Error> {
        let body = serde_json::to_vec(&CloseSessionRequest {
            end_ts,
            detected_classes,
        })?;
        self.post_json_with_retry(&format!("/sessions/{session_id}/close"), body)
            .await?;
        Ok(())
    }
}
