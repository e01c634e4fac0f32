//! Upstream Responses API client.
//!
//! Two call shapes: a buffered POST returning the complete response object,
//! and a streaming POST whose SSE body is decoded into typed events. The
//! stream is bridged through an mpsc channel; when the consumer drops the
//! receiver, the reader task's next send fails and the task exits, which
//! drops the upstream connection — that is the cancellation path.

use std::time::Duration;

use anyhow::{Context, Result};
use bytes::{Bytes, BytesMut};
use futures::{Stream, StreamExt};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

use crate::error::GatewayError;
use crate::protocol::openai::{ResponseObject, ResponsesRequest, StreamEvent};
use crate::util::preview;

/// Typed event stream handed to the session loop.
pub type EventStream = ReceiverStream<Result<StreamEvent, GatewayError>>;

#[derive(Clone)]
pub struct OpenAiClient {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
}

impl OpenAiClient {
    pub fn new(base_url: String, api_key: String) -> Result<Self> {
        // No overall timeout: streams outlive any sane fixed budget. The
        // per-request timeout, when configured, is enforced by the
        // coordinator.
        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(30))
            .pool_max_idle_per_host(10)
            // HTTP/1.1 avoids h2 connection resets seen with some proxies.
            .http1_only()
            .build()
            .context("failed to build upstream HTTP client")?;
        Ok(Self {
            http,
            base_url,
            api_key,
        })
    }

    /// Buffered call: send the request, return the complete response.
    pub async fn create_response(
        &self,
        request: &ResponsesRequest,
    ) -> Result<ResponseObject, GatewayError> {
        let response = self
            .http
            .post(format!("{}/responses", self.base_url))
            .bearer_auth(&self.api_key)
            .json(request)
            .send()
            .await
            .map_err(|e| GatewayError::Upstream {
                status: None,
                message: format!("upstream request failed: {}", e),
            })?;

        if !response.status().is_success() {
            return Err(Self::error_from(response).await);
        }

        response
            .json::<ResponseObject>()
            .await
            .map_err(|e| GatewayError::Upstream {
                status: None,
                message: format!("unparseable upstream response: {}", e),
            })
    }

    /// Streaming call: send the request with `stream: true` and decode the
    /// SSE body into typed events.
    pub async fn stream_response(
        &self,
        mut request: ResponsesRequest,
    ) -> Result<EventStream, GatewayError> {
        request.stream = Some(true);
        let response = self
            .http
            .post(format!("{}/responses", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&request)
            .send()
            .await
            .map_err(|e| GatewayError::Upstream {
                status: None,
                message: format!("upstream request failed: {}", e),
            })?;

        if !response.status().is_success() {
            return Err(Self::error_from(response).await);
        }

        let (tx, rx) = mpsc::channel(64);
        tokio::spawn(read_events(response.bytes_stream(), tx));
        Ok(ReceiverStream::new(rx))
    }

    async fn error_from(response: reqwest::Response) -> GatewayError {
        let status = response.status().as_u16();
        let body = response.text().await.unwrap_or_default();
        let message = serde_json::from_str::<serde_json::Value>(&body)
            .ok()
            .and_then(|v| {
                v.get("error")
                    .and_then(|e| e.get("message"))
                    .and_then(|m| m.as_str())
                    .map(String::from)
            })
            .unwrap_or_else(|| {
                if body.is_empty() {
                    "upstream error".to_string()
                } else {
                    preview(&body, 500).to_string()
                }
            });
        GatewayError::Upstream {
            status: Some(status),
            message,
        }
    }
}

/// Read the SSE byte stream line by line, parse `data:` payloads, and push
/// typed events into the channel. SSE frames can split anywhere across TCP
/// chunks, so lines accumulate in a buffer until a newline lands.
async fn read_events<S>(mut bytes: S, tx: mpsc::Sender<Result<StreamEvent, GatewayError>>)
where
    S: Stream<Item = Result<Bytes, reqwest::Error>> + Unpin,
{
    let mut buffer = BytesMut::new();
    while let Some(chunk) = bytes.next().await {
        match chunk {
            Ok(chunk) => {
                buffer.extend_from_slice(&chunk);
                while let Some(pos) = buffer.iter().position(|&b| b == b'\n') {
                    let line = buffer.split_to(pos + 1);
                    let Ok(line) = std::str::from_utf8(&line) else {
                        continue;
                    };
                    let Some(event) = parse_sse_line(line.trim()) else {
                        continue;
                    };
                    if tx.send(Ok(event)).await.is_err() {
                        // Consumer cancelled; dropping the byte stream
                        // closes the upstream connection.
                        return;
                    }
                }
            }
            Err(e) => {
                let _ = tx
                    .send(Err(GatewayError::Upstream {
                        status: None,
                        message: format!("upstream stream error: {}", e),
                    }))
                    .await;
                return;
            }
        }
    }
}

/// Parse one SSE line into an event.
///
/// Returns None for non-data lines (`event:`, comments, blanks), the
/// `[DONE]` terminator, and payloads that fail to parse — a malformed event
/// is logged and skipped, never fatal.
fn parse_sse_line(line: &str) -> Option<StreamEvent> {
    let data = line.strip_prefix("data:")?.trim();
    if data.is_empty() || data == "[DONE]" {
        return None;
    }
    match serde_json::from_str::<StreamEvent>(data) {
        Ok(event) => Some(event),
        Err(e) => {
            tracing::warn!(
                "skipping unparseable stream event: {} ({})",
                preview(data, 200),
                e
            );
            None
        }
    }
}
