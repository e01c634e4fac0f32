// Request coordination for the messages endpoints.
//
// One handler invocation owns one logical task: parse, resolve the
// conversation, translate, then branch. The buffered path awaits the whole
// upstream response; the streaming path hands an emitter-backed body to the
// client immediately and drives the session in a spawned task. Conversation
// state persists only when the upstream response actually completed.

use std::time::Instant;

use axum::{
    body::{Body, Bytes},
    extract::State,
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use chrono::Utc;
use futures::StreamExt;
use serde_json::json;
use tokio_stream::wrappers::ReceiverStream;

use crate::conversations::ToolBinding;
use crate::error::GatewayError;
use crate::eventlog::{next_request_id, GatewayEvent};
use crate::protocol::anthropic::MessageCreateParams;
use crate::protocol::openai::ResponsesRequest;
use crate::state::AppState;
use crate::stream::{spawn_ping, SseEmitter, StreamSession, PING_INTERVAL};
use crate::tokens;
use crate::translate::request::build_request;
use crate::translate::response::translate_response;
use crate::util::preview;

/// `POST /v1/messages`
pub async fn create_message(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, GatewayError> {
    let started = Instant::now();
    let params = parse_params(&body)?;

    let request_id = next_request_id();
    let conversation_id = conversation_id_from(&headers);
    let streaming = wants_stream(&headers);

    let snapshot = state.store.get_or_create(&conversation_id);
    let translated = build_request(&params, &snapshot, &state.config.model)?;

    state
        .events
        .record(GatewayEvent::Request {
            id: request_id.clone(),
            timestamp: Utc::now(),
            conversation_id: conversation_id.clone(),
            model: params.model.clone(),
            streaming,
            message_count: params.messages.len(),
        })
        .await;

    tracing::debug!(
        conversation = %conversation_id,
        model = %params.model,
        streaming,
        input_items = translated.request.input.len(),
        "translated messages request"
    );

    if streaming {
        Ok(stream_message(
            state,
            translated.request,
            translated.minted,
            conversation_id,
            params.model,
            request_id,
            started,
        ))
    } else {
        buffered_message(
            state,
            translated.request,
            translated.minted,
            conversation_id,
            params.model,
            request_id,
            started,
        )
        .await
        .map(IntoResponse::into_response)
    }
}

/// `POST /v1/messages/count_tokens`
pub async fn count_tokens(body: Bytes) -> Result<Json<serde_json::Value>, GatewayError> {
    let params = parse_params(&body)?;
    let input_tokens = tokens::estimate_request(&params);
    Ok(Json(json!({ "input_tokens": input_tokens })))
}

fn parse_params(body: &Bytes) -> Result<MessageCreateParams, GatewayError> {
    serde_json::from_slice(body).map_err(|e| {
        let lossy = String::from_utf8_lossy(body);
        tracing::debug!("unparseable request body: {}", preview(&lossy, 300));
        GatewayError::InvalidRequest(format!("invalid request body: {}", e))
    })
}

/// Conversation id: `x-conversation-id`, then `x-session-id`, then a
/// per-request id (no correlation across turns).
fn conversation_id_from(headers: &HeaderMap) -> String {
    for name in ["x-conversation-id", "x-session-id"] {
        if let Some(value) = headers.get(name).and_then(|v| v.to_str().ok()) {
            let value = value.trim();
            if !value.is_empty() {
                return value.to_string();
            }
        }
    }
    format!("req-{}", uuid::Uuid::new_v4())
}

fn wants_stream(headers: &HeaderMap) -> bool {
    headers
        .get("x-stainless-helper-method")
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        == Some("stream")
}

// ============================================================================
// Buffered path
// ============================================================================

async fn buffered_message(
    state: AppState,
    request: ResponsesRequest,
    minted: Vec<ToolBinding>,
    conversation_id: String,
    downstream_model: String,
    request_id: String,
    started: Instant,
) -> Result<Json<crate::protocol::anthropic::Message>, GatewayError> {
    let call = state.upstream.create_response(&request);
    let response = match state.config.request_timeout {
        Some(limit) => tokio::time::timeout(limit, call)
            .await
            .map_err(|_| GatewayError::Timeout)??,
        None => call.await?,
    };

    let translated = translate_response(&response, &downstream_model);
    // The upstream completed: request-minted bindings and response
    // bindings persist together.
    let mut bindings = minted;
    bindings.extend(translated.bindings);
    state
        .store
        .update(&conversation_id, Some(response.id), bindings);

    state
        .events
        .record(GatewayEvent::Response {
            id: request_id,
            timestamp: Utc::now(),
            stop_reason: translated
                .message
                .stop_reason
                .map(|r| r.as_str().to_string()),
            input_tokens: translated.message.usage.input_tokens,
            output_tokens: translated.message.usage.output_tokens,
            duration_ms: started.elapsed().as_millis() as u64,
        })
        .await;

    Ok(Json(translated.message))
}

// ============================================================================
// Streaming path
// ============================================================================

fn stream_message(
    state: AppState,
    request: ResponsesRequest,
    minted: Vec<ToolBinding>,
    conversation_id: String,
    downstream_model: String,
    request_id: String,
    started: Instant,
) -> Response {
    let (emitter, rx) = SseEmitter::new(64);

    tokio::spawn(run_stream(
        state,
        emitter,
        request,
        minted,
        conversation_id,
        downstream_model,
        request_id,
        started,
    ));

    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "text/event-stream")
        .header(header::CACHE_CONTROL, "no-cache")
        .body(Body::from_stream(ReceiverStream::new(rx)))
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}

async fn run_stream(
    state: AppState,
    emitter: std::sync::Arc<SseEmitter>,
    request: ResponsesRequest,
    minted: Vec<ToolBinding>,
    conversation_id: String,
    downstream_model: String,
    request_id: String,
    started: Instant,
) {
    let mut session = StreamSession::new(emitter.clone(), downstream_model);
    session.begin().await;
    let ping = spawn_ping(emitter.clone(), PING_INTERVAL);

    let deadline = state
        .config
        .request_timeout
        .map(|limit| tokio::time::Instant::now() + limit);

    let mut events = match state.upstream.stream_response(request).await {
        Ok(stream) => stream,
        Err(e) => {
            session.fail(e.to_string()).await;
            ping.abort();
            state
                .events
                .record(GatewayEvent::StreamAborted {
                    id: request_id,
                    timestamp: Utc::now(),
                    reason: e.to_string(),
                })
                .await;
            return;
        }
    };

    loop {
        let next = async {
            match deadline {
                Some(deadline) => match tokio::time::timeout_at(deadline, events.next()).await {
                    Ok(item) => item.map(TimedEvent::Event),
                    Err(_) => Some(TimedEvent::Deadline),
                },
                None => events.next().await.map(TimedEvent::Event),
            }
        };
        tokio::select! {
            // Client gone: stop reading, skip all writes, drop the stream
            // (which cancels the upstream call).
            _ = emitter.wait_closed() => {
                tracing::debug!("client disconnected mid-stream, cancelling upstream");
                break;
            }
            event = next => match event {
                Some(TimedEvent::Event(Ok(event))) => {
                    session.handle(event).await;
                    if session.is_completed() {
                        break;
                    }
                }
                Some(TimedEvent::Event(Err(e))) => {
                    session.fail(e.to_string()).await;
                    break;
                }
                Some(TimedEvent::Deadline) => {
                    tracing::warn!("request timeout expired mid-stream, cancelling");
                    break;
                }
                None => break,
            },
        }
    }
    ping.abort();

    let outcome = session.into_outcome();
    if outcome.completed {
        let mut bindings = minted;
        bindings.extend(outcome.bindings);
        state
            .store
            .update(&conversation_id, outcome.response_id, bindings);
        state
            .events
            .record(GatewayEvent::Response {
                id: request_id,
                timestamp: Utc::now(),
                stop_reason: outcome.stop_reason.map(|r| r.as_str().to_string()),
                input_tokens: outcome.usage.input_tokens,
                output_tokens: outcome.usage.output_tokens,
                duration_ms: started.elapsed().as_millis() as u64,
            })
            .await;
    } else {
        // Nothing persists from an unfinished turn, but the conversation
        // was in active use the whole time the stream ran; refresh its
        // idle clock so the sweep does not evict it mid-conversation.
        state.store.touch(&conversation_id);
        state
            .events
            .record(GatewayEvent::StreamAborted {
                id: request_id,
                timestamp: Utc::now(),
                reason: "stream ended before completion".to_string(),
            })
            .await;
    }
}

enum TimedEvent {
    Event(Result<crate::protocol::openai::StreamEvent, GatewayError>),
    Deadline,
}
