//! HTTP server: router assembly, CORS, health/test endpoints, serving.

use std::net::SocketAddr;

use anyhow::{Context, Result};
use axum::{
    http::{header, HeaderName, Method},
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;
use serde_json::json;
use tokio::net::TcpListener;
use tower_http::cors::{Any, CorsLayer};

use crate::config::VERSION;
use crate::error::GatewayError;
use crate::handlers;
use crate::protocol::openai::{InputItem, ResponsesRequest};
use crate::state::AppState;

pub fn router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([
            Method::GET,
            Method::POST,
            Method::PUT,
            Method::DELETE,
            Method::OPTIONS,
        ])
        .allow_headers([
            header::CONTENT_TYPE,
            header::AUTHORIZATION,
            HeaderName::from_static("x-requested-with"),
        ]);

    Router::new()
        .route("/", get(root))
        .route("/health", get(health))
        .route("/test-connection", get(test_connection))
        .route("/v1/messages", post(handlers::create_message))
        .route("/v1/messages/count_tokens", post(handlers::count_tokens))
        .layer(cors)
        .with_state(state)
}

/// Bind and serve until ctrl-c.
pub async fn serve(state: AppState) -> Result<()> {
    let sweeper = state.store.clone().spawn_sweeper();
    let port = state.config.port;
    let app = router(state);

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {}", addr))?;
    tracing::info!("gateway listening on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("shutting down");
        })
        .await
        .context("server error")?;

    sweeper.abort();
    Ok(())
}

async fn root() -> String {
    format!(
        "claude-bridge v{} - Anthropic Messages API gateway backed by the OpenAI Responses API\n",
        VERSION
    )
}

async fn health() -> Json<serde_json::Value> {
    Json(json!({
        "status": "ok",
        "timestamp": Utc::now().to_rfc3339(),
    }))
}

/// One tiny upstream round-trip to prove the credential and base URL work.
async fn test_connection(
    axum::extract::State(state): axum::extract::State<AppState>,
) -> Result<Json<serde_json::Value>, GatewayError> {
    let probe = ResponsesRequest {
        model: state.config.model.clone(),
        input: vec![InputItem::text_message("user", "ping".to_string())],
        instructions: None,
        tools: Vec::new(),
        tool_choice: None,
        max_output_tokens: Some(16),
        temperature: None,
        top_p: None,
        previous_response_id: None,
        stream: None,
    };

    let response = state
        .upstream
        .create_response(&probe)
        .await
        .map_err(|e| GatewayError::Internal(format!("upstream connection test failed: {}", e)))?;

    Ok(Json(json!({
        "status": "ok",
        "model": state.config.model,
        "response_id": response.id,
    })))
}
