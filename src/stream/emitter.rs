//! SSE frame serialization and transport ownership.
//!
//! The emitter is the only writer to the client socket. Frames flow through
//! an mpsc channel that the HTTP layer wraps into the response body stream;
//! channel sends give every frame a total order even when the ping timer and
//! the main loop race. Once the client goes away (the channel closes) every
//! further write is a silent no-op.

use std::convert::Infallible;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::mpsc;

use crate::protocol::anthropic::{
    Delta, ErrorBody, Message, MessageDeltaBody, OutputBlock, StopReason, StreamEvent, Usage,
};

/// Frames the HTTP layer reads out of the channel.
pub type Frame = Result<Bytes, Infallible>;

pub struct SseEmitter {
    tx: mpsc::Sender<Frame>,
    closed: AtomicBool,
}

impl SseEmitter {
    /// Create an emitter and the receiving end for the response body.
    pub fn new(buffer: usize) -> (Arc<Self>, mpsc::Receiver<Frame>) {
        let (tx, rx) = mpsc::channel(buffer);
        (
            Arc::new(Self {
                tx,
                closed: AtomicBool::new(false),
            }),
            rx,
        )
    }

    /// Whether the transport is still writable.
    pub fn closed(&self) -> bool {
        self.closed.load(Ordering::Relaxed) || self.tx.is_closed()
    }

    /// Resolve when the client side of the transport goes away.
    pub async fn wait_closed(&self) {
        self.tx.closed().await;
    }

    async fn write(&self, frame: Bytes) {
        if self.closed.load(Ordering::Relaxed) {
            return;
        }
        if self.tx.send(Ok(frame)).await.is_err() {
            self.closed.store(true, Ordering::Relaxed);
            tracing::debug!("client disconnected, suppressing further frames");
        }
    }

    /// Serialize and write one typed event frame.
    pub async fn emit(&self, event: &StreamEvent) {
        let data = match serde_json::to_string(event) {
            Ok(json) => json,
            Err(e) => {
                tracing::error!("failed to serialize stream event: {}", e);
                return;
            }
        };
        let frame = format!("event: {}\ndata: {}\n\n", event.name(), data);
        self.write(Bytes::from(frame)).await;
    }

    /// The keep-alive frame: a single empty `data:` line, no event name.
    pub async fn ping(&self) {
        self.write(Bytes::from_static(b"data:\n\n")).await;
    }

    pub async fn message_start(&self, message: Message) {
        self.emit(&StreamEvent::MessageStart { message }).await;
    }

    pub async fn content_block_start(&self, index: u32, content_block: OutputBlock) {
        self.emit(&StreamEvent::ContentBlockStart {
            index,
            content_block,
        })
        .await;
    }

    pub async fn content_block_delta(&self, index: u32, delta: Delta) {
        self.emit(&StreamEvent::ContentBlockDelta { index, delta })
            .await;
    }

    pub async fn content_block_stop(&self, index: u32) {
        self.emit(&StreamEvent::ContentBlockStop { index }).await;
    }

    pub async fn message_delta(&self, stop_reason: StopReason, usage: Usage) {
        self.emit(&StreamEvent::MessageDelta {
            delta: MessageDeltaBody {
                stop_reason,
                stop_sequence: None,
            },
            usage,
        })
        .await;
    }

    pub async fn message_stop(&self) {
        self.emit(&StreamEvent::MessageStop).await;
    }

    pub async fn error(&self, kind: &str, message: String) {
        self.emit(&StreamEvent::Error {
            error: ErrorBody {
                kind: kind.to_string(),
                message,
            },
        })
        .await;
    }
}
