//! The streaming state machine: upstream `response.*` events in, downstream
//! Messages events out.
//!
//! Content blocks live in an append-only arena keyed by their downstream
//! index, with a side map from upstream item id to arena slot for tool
//! blocks. Allocation and `content_block_start` happen together, so a block
//! in the arena is by definition started; `completed` marks the matching
//! `content_block_stop`. Indices are dense from 0 in allocation order.
//!
//! Lifecycle: `begin` emits `message_start` plus one ping, events stream
//! through `handle`, and whichever terminal condition fires first
//! (`response.completed`, an upstream failure, transport close, coordinator
//! cancel) latches `completed`. Everything after the latch is dropped with a
//! warning. `into_outcome` hands the collected bindings and upstream
//! response id back to the coordinator for persistence.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;

use crate::conversations::ToolBinding;
use crate::protocol::anthropic::{Delta, Message, OutputBlock, StopReason, Usage};
use crate::protocol::openai::{OutputItem, ResponseObject, StreamEvent};
use crate::stream::emitter::SseEmitter;
use crate::util::mint_id;

/// Keep-alive cadence while a session is open.
pub const PING_INTERVAL: Duration = Duration::from_secs(15);

/// What the coordinator persists once the session is over.
#[derive(Debug)]
pub struct SessionOutcome {
    /// True only if `response.completed` was observed.
    pub completed: bool,
    pub response_id: Option<String>,
    pub bindings: Vec<ToolBinding>,
    pub usage: Usage,
    pub stop_reason: Option<StopReason>,
}

struct Block {
    kind: BlockKind,
    completed: bool,
}

enum BlockKind {
    Text { text: String },
    Tool { name: String, arguments: String },
}

impl Block {
    fn is_open_text(&self) -> bool {
        !self.completed && matches!(self.kind, BlockKind::Text { .. })
    }
}

pub struct StreamSession {
    emitter: Arc<SseEmitter>,
    model: String,
    message_id: String,
    blocks: Vec<Block>,
    /// Upstream item id -> arena slot, for argument deltas and item.done.
    tool_slots: HashMap<String, usize>,
    current_text: Option<usize>,
    bindings: Vec<ToolBinding>,
    usage: Usage,
    response_id: Option<String>,
    stop_reason: Option<StopReason>,
    started: bool,
    completed: bool,
    opened_tool_block: bool,
    search_sequence: u64,
}

impl StreamSession {
    pub fn new(emitter: Arc<SseEmitter>, model: String) -> Self {
        Self {
            emitter,
            model,
            message_id: mint_id("msg"),
            blocks: Vec::new(),
            tool_slots: HashMap::new(),
            current_text: None,
            bindings: Vec::new(),
            usage: Usage::default(),
            response_id: None,
            stop_reason: None,
            started: false,
            completed: false,
            opened_tool_block: false,
            search_sequence: 0,
        }
    }

    /// Emit `message_start` plus one ping. Idempotent.
    pub async fn begin(&mut self) {
        if self.started {
            return;
        }
        self.started = true;
        let shell = Message::shell(self.message_id.clone(), self.model.clone());
        self.emitter.message_start(shell).await;
        self.emitter.ping().await;
    }

    pub fn is_completed(&self) -> bool {
        self.completed
    }

    /// Terminal error injected by the coordinator (transport-level failure
    /// while reading the upstream).
    pub async fn fail(&mut self, message: String) {
        if self.completed {
            return;
        }
        self.emitter.error("api_error", message).await;
        self.completed = true;
    }

    pub fn into_outcome(self) -> SessionOutcome {
        SessionOutcome {
            completed: self.stop_reason.is_some(),
            response_id: self.response_id,
            bindings: self.bindings,
            usage: self.usage,
            stop_reason: self.stop_reason,
        }
    }

    pub async fn handle(&mut self, event: StreamEvent) {
        if self.completed {
            tracing::warn!("dropping upstream event after stream completion");
            return;
        }
        match event {
            StreamEvent::Created { response } => {
                self.response_id = Some(response.id);
                self.open_text_block().await;
            }
            StreamEvent::InProgress => self.emitter.ping().await,
            StreamEvent::OutputTextDelta { delta, .. } => self.text_delta(delta).await,
            StreamEvent::OutputTextDone { .. } => self.close_text_block().await,
            StreamEvent::OutputItemAdded { item } => self.item_added(item).await,
            StreamEvent::OutputItemDone { item } => self.item_done(item).await,
            StreamEvent::FunctionCallArgumentsDelta { item_id, delta } => {
                self.arguments_delta(&item_id, delta).await;
            }
            StreamEvent::FunctionCallArgumentsDone { .. } => {}
            StreamEvent::ContentPartAdded { part } => {
                if self.current_text.is_none() {
                    self.open_text_block().await;
                }
                if let Some(text) = part.as_ref().and_then(|p| p.text()) {
                    self.text_delta(text.to_string()).await;
                }
            }
            StreamEvent::ContentPartDone { part } => {
                if let Some(slot) = self.current_text {
                    let accumulated_empty = match &self.blocks[slot].kind {
                        BlockKind::Text { text } => text.is_empty(),
                        _ => false,
                    };
                    if accumulated_empty {
                        if let Some(text) = part.as_ref().and_then(|p| p.text()) {
                            self.text_delta(text.to_string()).await;
                        }
                    }
                    self.close_text_block().await;
                }
            }
            StreamEvent::WebSearchInProgress { item_id } => self.search_started(item_id).await,
            StreamEvent::WebSearchSearching { item_id } => self.search_progress(item_id).await,
            StreamEvent::WebSearchCompleted { item_id } => self.search_finished(item_id).await,
            StreamEvent::Completed { response } => self.finish(response).await,
            StreamEvent::Failed { response } => {
                let message = response
                    .and_then(|r| r.error.and_then(|e| e.message))
                    .unwrap_or_else(|| "upstream response failed".to_string());
                self.fail(message).await;
            }
            StreamEvent::Incomplete { response } => {
                let message = response
                    .and_then(|r| r.error.and_then(|e| e.message))
                    .unwrap_or_else(|| "upstream response incomplete".to_string());
                self.fail(message).await;
            }
            StreamEvent::Error { message } => {
                let message = message.unwrap_or_else(|| "upstream stream error".to_string());
                self.fail(message).await;
            }
            StreamEvent::Unknown => {
                tracing::warn!("unknown upstream event type, dropping");
            }
        }
    }

    // ------------------------------------------------------------------
    // Text blocks
    // ------------------------------------------------------------------

    async fn open_text_block(&mut self) {
        let index = self.blocks.len() as u32;
        self.emitter
            .content_block_start(
                index,
                OutputBlock::Text {
                    text: String::new(),
                },
            )
            .await;
        self.blocks.push(Block {
            kind: BlockKind::Text {
                text: String::new(),
            },
            completed: false,
        });
        self.current_text = Some(self.blocks.len() - 1);
    }

    /// The current text block, falling back to the last unfinished one.
    fn text_slot(&self) -> Option<usize> {
        self.current_text
            .filter(|&slot| !self.blocks[slot].completed)
            .or_else(|| self.blocks.iter().rposition(Block::is_open_text))
    }

    async fn text_delta(&mut self, fragment: String) {
        let slot = match self.text_slot() {
            Some(slot) => slot,
            None => {
                tracing::debug!("text delta with no open text block, opening one");
                self.open_text_block().await;
                match self.text_slot() {
                    Some(slot) => slot,
                    None => return,
                }
            }
        };
        self.emitter
            .content_block_delta(
                slot as u32,
                Delta::TextDelta {
                    text: fragment.clone(),
                },
            )
            .await;
        if let BlockKind::Text { text } = &mut self.blocks[slot].kind {
            text.push_str(&fragment);
        }
    }

    async fn close_text_block(&mut self) {
        if let Some(slot) = self.text_slot() {
            self.emitter.content_block_stop(slot as u32).await;
            self.blocks[slot].completed = true;
        }
        self.current_text = None;
    }

    // ------------------------------------------------------------------
    // Tool blocks
    // ------------------------------------------------------------------

    async fn item_added(&mut self, item: OutputItem) {
        let OutputItem::FunctionCall {
            id, call_id, name, ..
        } = item
        else {
            return;
        };
        // The upstream item id doubles as the downstream tool_use id: it is
        // unique within the response and the client round-trips it through
        // the binding either way.
        let tool_use_id = match id.filter(|s| !s.is_empty()) {
            Some(id) => id,
            None => mint_id("toolu"),
        };
        let slot = self
            .open_tool_block(tool_use_id.clone(), name.clone(), json!({}))
            .await;
        self.tool_slots.insert(tool_use_id.clone(), slot);
        self.bindings.push(ToolBinding {
            call_id,
            tool_use_id,
            name,
        });
    }

    async fn open_tool_block(
        &mut self,
        tool_use_id: String,
        name: String,
        input: serde_json::Value,
    ) -> usize {
        let index = self.blocks.len() as u32;
        self.emitter
            .content_block_start(
                index,
                OutputBlock::ToolUse {
                    id: tool_use_id,
                    name: name.clone(),
                    input,
                },
            )
            .await;
        self.blocks.push(Block {
            kind: BlockKind::Tool {
                name,
                arguments: String::new(),
            },
            completed: false,
        });
        self.opened_tool_block = true;
        self.blocks.len() - 1
    }

    async fn arguments_delta(&mut self, item_id: &str, fragment: String) {
        let Some(&slot) = self.tool_slots.get(item_id) else {
            tracing::warn!(item_id, "argument delta for unknown tool block, skipping");
            return;
        };
        self.emitter
            .content_block_delta(
                slot as u32,
                Delta::InputJsonDelta {
                    partial_json: fragment.clone(),
                },
            )
            .await;
        if let BlockKind::Tool { arguments, .. } = &mut self.blocks[slot].kind {
            arguments.push_str(&fragment);
        }
    }

    async fn item_done(&mut self, item: OutputItem) {
        let OutputItem::FunctionCall { id, .. } = item else {
            return;
        };
        let slot = id
            .and_then(|item_id| self.tool_slots.get(&item_id).copied())
            .or_else(|| self.last_open_tool_slot(None));
        let Some(slot) = slot else {
            tracing::warn!("output_item.done for unknown tool block, skipping");
            return;
        };
        if !self.blocks[slot].completed {
            self.emitter.content_block_stop(slot as u32).await;
            self.blocks[slot].completed = true;
        }
    }

    fn last_open_tool_slot(&self, name: Option<&str>) -> Option<usize> {
        self.blocks.iter().rposition(|block| {
            !block.completed
                && match &block.kind {
                    BlockKind::Tool { name: n, .. } => name.map_or(true, |want| n == want),
                    _ => false,
                }
        })
    }

    // ------------------------------------------------------------------
    // Web search pseudo-tool
    // ------------------------------------------------------------------

    async fn search_started(&mut self, item_id: Option<String>) {
        let tool_use_id = mint_id("toolu");
        let slot = self
            .open_tool_block(
                tool_use_id.clone(),
                "web_search".to_string(),
                json!({"status": "in_progress"}),
            )
            .await;
        self.tool_slots
            .insert(item_id.unwrap_or(tool_use_id), slot);
    }

    async fn search_progress(&mut self, item_id: Option<String>) {
        let slot = item_id
            .as_deref()
            .and_then(|id| self.tool_slots.get(id).copied())
            .or_else(|| self.last_open_tool_slot(Some("web_search")));
        let Some(slot) = slot else {
            tracing::warn!("web_search progress without an open search block, skipping");
            return;
        };
        self.search_sequence += 1;
        let fragment = json!({
            "status": "searching",
            "sequence": self.search_sequence
        })
        .to_string();
        self.emitter
            .content_block_delta(
                slot as u32,
                Delta::InputJsonDelta {
                    partial_json: fragment.clone(),
                },
            )
            .await;
        if let BlockKind::Tool { arguments, .. } = &mut self.blocks[slot].kind {
            arguments.push_str(&fragment);
        }
    }

    async fn search_finished(&mut self, item_id: Option<String>) {
        let slot = item_id
            .as_deref()
            .and_then(|id| self.tool_slots.get(id).copied())
            .or_else(|| self.last_open_tool_slot(Some("web_search")));
        if let Some(slot) = slot {
            if !self.blocks[slot].completed {
                self.emitter.content_block_stop(slot as u32).await;
                self.blocks[slot].completed = true;
            }
        }
    }

    // ------------------------------------------------------------------
    // Completion
    // ------------------------------------------------------------------

    async fn finish(&mut self, response: ResponseObject) {
        // Close every block the upstream left open, in allocation order.
        for slot in 0..self.blocks.len() {
            if !self.blocks[slot].completed {
                self.emitter.content_block_stop(slot as u32).await;
                self.blocks[slot].completed = true;
            }
        }
        self.current_text = None;

        let stop_reason = if response.hit_output_limit() {
            StopReason::MaxTokens
        } else if self.opened_tool_block {
            StopReason::ToolUse
        } else {
            StopReason::EndTurn
        };

        if let Some(usage) = response.usage {
            self.usage = Usage {
                input_tokens: usage.input_tokens,
                output_tokens: usage.output_tokens,
            };
        }

        self.response_id = Some(response.id);
        self.stop_reason = Some(stop_reason);
        self.emitter.message_delta(stop_reason, self.usage).await;
        self.emitter.message_stop().await;
        self.completed = true;
    }
}

/// Keep-alive task: pings through the same emitter as the session so frames
/// stay totally ordered. The coordinator aborts the handle on session end.
pub fn spawn_ping(emitter: Arc<SseEmitter>, period: Duration) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        // interval fires immediately; the session already sent its greeting
        // ping, so skip the first tick.
        ticker.tick().await;
        loop {
            ticker.tick().await;
            if emitter.closed() {
                break;
            }
            emitter.ping().await;
        }
    })
}
