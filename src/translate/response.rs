//! Upstream response → downstream message translation (buffered path).
//!
//! Output items are walked in order: all text from `message` items folds
//! into a single leading text block, and each `function_call` becomes a
//! tool_use block with a freshly minted downstream id. The returned
//! bindings let the next turn's tool_result find its way back to the
//! upstream `call_id`.

use serde_json::{json, Value};

use crate::conversations::ToolBinding;
use crate::protocol::{
    anthropic::{Message, OutputBlock, StopReason, Usage},
    openai::{OutputContent, OutputItem, ResponseObject},
};
use crate::util::mint_id;

pub struct TranslatedResponse {
    pub message: Message,
    /// `call_id -> tool_use_id` pairs to register with the conversation.
    pub bindings: Vec<ToolBinding>,
}

/// Translate a complete upstream response into a downstream message.
pub fn translate_response(response: &ResponseObject, model: &str) -> TranslatedResponse {
    let mut text = String::new();
    let mut tool_blocks: Vec<OutputBlock> = Vec::new();
    let mut bindings: Vec<ToolBinding> = Vec::new();

    for item in &response.output {
        match item {
            OutputItem::Message { content } => {
                for part in content {
                    if let OutputContent::Text { text: fragment } = part {
                        text.push_str(fragment);
                    }
                }
            }
            OutputItem::FunctionCall {
                call_id,
                name,
                arguments,
                ..
            } => {
                let tool_use_id = mint_id("toolu");
                let input = parse_arguments(arguments);
                bindings.push(ToolBinding {
                    call_id: call_id.clone(),
                    tool_use_id: tool_use_id.clone(),
                    name: name.clone(),
                });
                tool_blocks.push(OutputBlock::ToolUse {
                    id: tool_use_id,
                    name: name.clone(),
                    input,
                });
            }
            OutputItem::WebSearchCall { .. } | OutputItem::Unknown => {}
        }
    }

    let mut content: Vec<OutputBlock> = Vec::new();
    if !text.is_empty() {
        content.push(OutputBlock::Text { text });
    }
    let has_tool_use = !tool_blocks.is_empty();
    content.extend(tool_blocks);

    let stop_reason = if response.hit_output_limit() {
        StopReason::MaxTokens
    } else if has_tool_use {
        StopReason::ToolUse
    } else {
        StopReason::EndTurn
    };

    let usage = response
        .usage
        .map(|u| Usage {
            input_tokens: u.input_tokens,
            output_tokens: u.output_tokens,
        })
        .unwrap_or_default();

    let message = Message {
        id: mint_id("msg"),
        kind: "message",
        role: "assistant",
        content,
        model: model.to_string(),
        stop_reason: Some(stop_reason),
        stop_sequence: None,
        usage,
    };

    TranslatedResponse { message, bindings }
}

/// Parse a function-call argument string; invalid JSON becomes an empty
/// object rather than an error.
fn parse_arguments(arguments: &str) -> Value {
    if arguments.is_empty() {
        return json!({});
    }
    serde_json::from_str(arguments).unwrap_or_else(|e| {
        tracing::warn!("unparseable function_call arguments: {}", e);
        json!({})
    })
}
