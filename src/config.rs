//! Configuration for the gateway.
//!
//! Everything is driven by environment variables; there is no config file.
//! The upstream credential is the only required value and its absence is
//! fatal at startup.

use anyhow::{bail, Context, Result};
use std::path::PathBuf;
use std::time::Duration;

/// Version info
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default upstream model when `OPENAI_MODEL` is unset.
const DEFAULT_MODEL: &str = "gpt-4.1";

/// Default upstream base URL.
const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";

/// Default listen port.
const DEFAULT_PORT: u16 = 8082;

#[derive(Debug, Clone)]
pub struct Config {
    /// Bearer credential for the upstream API.
    pub api_key: String,

    /// Upstream model that replaces every downstream model name.
    pub model: String,

    /// Upstream base URL (no trailing slash).
    pub base_url: String,

    /// Port the gateway listens on.
    pub port: u16,

    /// Whether to write JSONL event logs.
    pub log_events: bool,

    /// Directory for event logs.
    pub log_dir: PathBuf,

    /// Per-request hard timeout; None disables it.
    pub request_timeout: Option<Duration>,
}

impl Config {
    /// Load configuration from the environment.
    ///
    /// A missing `OPENAI_API_KEY` is a startup failure; everything else
    /// falls back to a default.
    pub fn from_env() -> Result<Self> {
        let api_key = match std::env::var("OPENAI_API_KEY") {
            Ok(key) if !key.trim().is_empty() => key,
            _ => bail!("OPENAI_API_KEY is required"),
        };

        let model =
            std::env::var("OPENAI_MODEL").unwrap_or_else(|_| DEFAULT_MODEL.to_string());

        let base_url = std::env::var("OPENAI_BASE_URL")
            .unwrap_or_else(|_| DEFAULT_BASE_URL.to_string())
            .trim_end_matches('/')
            .to_string();

        let port = match std::env::var("PORT") {
            Ok(raw) => raw
                .parse::<u16>()
                .with_context(|| format!("invalid PORT value: {}", raw))?,
            Err(_) => DEFAULT_PORT,
        };

        let log_events = std::env::var("LOG_EVENTS")
            .map(|v| v.eq_ignore_ascii_case("true"))
            .unwrap_or(false);

        let log_dir = std::env::var("LOG_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("./logs"));

        let request_timeout = parse_timeout_ms(std::env::var("REQUEST_TIMEOUT_MS").ok());

        Ok(Self {
            api_key,
            model,
            base_url,
            port,
            log_events,
            log_dir,
            request_timeout,
        })
    }
}

/// Parse `REQUEST_TIMEOUT_MS`; zero, negative, or garbage disables the
/// timeout.
fn parse_timeout_ms(raw: Option<String>) -> Option<Duration> {
    let raw = raw?;
    match raw.trim().parse::<i64>() {
        Ok(ms) if ms > 0 => Some(Duration::from_millis(ms as u64)),
        Ok(_) => None,
        Err(_) => {
            tracing::warn!("ignoring invalid REQUEST_TIMEOUT_MS value: {}", raw);
            None
        }
    }
}
