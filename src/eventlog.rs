//! Optional JSONL event logging.
//!
//! One JSON object per line, one file per gateway run, so the log can be
//! tailed or fed to jq while the gateway is serving. Events flow through an
//! mpsc channel to a dedicated writer task; a full or closed channel drops
//! the event rather than stalling a request.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::mpsc;

/// Correlate a request with its response record.
pub fn next_request_id() -> String {
    static COUNTER: AtomicU64 = AtomicU64::new(0);
    let count = COUNTER.fetch_add(1, Ordering::Relaxed);
    format!("{}-{}", Utc::now().timestamp_millis(), count)
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum GatewayEvent {
    Request {
        id: String,
        timestamp: DateTime<Utc>,
        conversation_id: String,
        model: String,
        streaming: bool,
        message_count: usize,
    },
    Response {
        id: String,
        timestamp: DateTime<Utc>,
        stop_reason: Option<String>,
        input_tokens: u32,
        output_tokens: u32,
        duration_ms: u64,
    },
    StreamAborted {
        id: String,
        timestamp: DateTime<Utc>,
        reason: String,
    },
}

/// Handle held by request handlers. Cloning is cheap; a disabled log is a
/// no-op sender.
#[derive(Clone)]
pub struct EventLog {
    tx: Option<mpsc::Sender<GatewayEvent>>,
}

impl EventLog {
    pub fn disabled() -> Self {
        Self { tx: None }
    }

    /// Create the log directory and spawn the writer task.
    pub fn to_dir(log_dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(log_dir).context("failed to create log directory")?;
        let path = log_dir.join(format!(
            "claude-bridge-{}.jsonl",
            Utc::now().format("%Y%m%d-%H%M%S")
        ));
        tracing::info!("event log: {:?}", path);

        let (tx, rx) = mpsc::channel(256);
        tokio::spawn(run_writer(rx, path));
        Ok(Self { tx: Some(tx) })
    }

    pub async fn record(&self, event: GatewayEvent) {
        if let Some(tx) = &self.tx {
            // A lagging writer must not back-pressure request handling.
            let _ = tx.try_send(event);
        }
    }
}

async fn run_writer(mut rx: mpsc::Receiver<GatewayEvent>, path: PathBuf) {
    while let Some(event) = rx.recv().await {
        if let Err(e) = append_line(&path, &event) {
            tracing::error!("failed to write event log line: {:?}", e);
        }
    }
    tracing::debug!("event log writer shutting down");
}

fn append_line(path: &Path, event: &GatewayEvent) -> Result<()> {
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .context("failed to open event log file")?;
    let json = serde_json::to_string(event).context("failed to serialize event")?;
    writeln!(file, "{}", json).context("failed to write event")?;
    // Flush per line so the log is greppable even if the process dies.
    file.flush().context("failed to flush event log")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_ids_are_unique_and_ordered() {
        let a = next_request_id();
        let b = next_request_id();
        assert_ne!(a, b);
    }

    #[test]
    fn events_serialize_with_tag() {
        let event = GatewayEvent::Request {
            id: "1".to_string(),
            timestamp: Utc::now(),
            conversation_id: "conv".to_string(),
            model: "m".to_string(),
            streaming: true,
            message_count: 2,
        };
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["event"], "request");
        assert_eq!(value["streaming"], true);
    }

    #[tokio::test]
    async fn writer_appends_one_line_per_event() {
        let dir = std::env::temp_dir().join(format!("claude-bridge-test-{}", next_request_id()));
        let log = EventLog::to_dir(&dir).unwrap();
        log.record(GatewayEvent::StreamAborted {
            id: "1".to_string(),
            timestamp: Utc::now(),
            reason: "test".to_string(),
        })
        .await;
        log.record(GatewayEvent::StreamAborted {
            id: "2".to_string(),
            timestamp: Utc::now(),
            reason: "test".to_string(),
        })
        .await;

        // Give the writer task a moment to drain the channel.
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;

        let entries: Vec<_> = std::fs::read_dir(&dir).unwrap().collect();
        assert_eq!(entries.len(), 1);
        let content = std::fs::read_to_string(entries[0].as_ref().unwrap().path()).unwrap();
        assert_eq!(content.lines().count(), 2);
        let first: serde_json::Value = serde_json::from_str(content.lines().next().unwrap()).unwrap();
        assert_eq!(first["event"], "stream_aborted");

        let _ = std::fs::remove_dir_all(&dir);
    }
}
