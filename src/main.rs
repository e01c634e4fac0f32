// claude-bridge - Anthropic Messages API gateway backed by the OpenAI
// Responses API.
//
// Clients built against the Messages API point their base URL here and keep
// working unmodified; the gateway translates requests, responses, and SSE
// streams in both directions and carries tool-call identities across turns.
//
// Architecture:
// - server (axum): routes, CORS, health and connection-test endpoints
// - translate: request/response converters plus strict-mode schema fixes
// - stream: the SSE emitter and the upstream-event state machine
// - conversations: tool-id correlation with TTL eviction
// - upstream: Responses API client and SSE decoding
// - eventlog: optional JSONL record of request/response traffic

mod config;
mod conversations;
mod error;
mod eventlog;
mod handlers;
mod protocol;
mod server;
mod startup;
mod state;
mod stream;
mod tokens;
mod translate;
mod upstream;
mod util;

use anyhow::Result;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use config::Config;
use state::AppState;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "claude_bridge=info,tower_http=info,axum=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Missing OPENAI_API_KEY is fatal here, before anything binds.
    let config = Config::from_env()?;
    startup::print_startup(&config);

    let state = AppState::new(config)?;
    server::serve(state).await
}
