//! Shared state handed to every request handler.

use std::sync::Arc;

use anyhow::Result;

use crate::config::Config;
use crate::conversations::ConversationStore;
use crate::eventlog::EventLog;
use crate::upstream::OpenAiClient;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub upstream: OpenAiClient,
    pub store: Arc<ConversationStore>,
    pub events: EventLog,
}

impl AppState {
    pub fn new(config: Config) -> Result<Self> {
        let upstream = OpenAiClient::new(config.base_url.clone(), config.api_key.clone())?;
        let events = if config.log_events {
            EventLog::to_dir(&config.log_dir)?
        } else {
            EventLog::disabled()
        };
        Ok(Self {
            config: Arc::new(config),
            upstream,
            store: ConversationStore::new(),
            events,
        })
    }
}
