//! Token estimation for the `count_tokens` endpoint.
//!
//! A heuristic, not a tokenizer: Latin text runs about four characters per
//! token, non-ASCII scripts closer to one token per character, and word
//! boundaries add a little. Counts feed client-side budgeting only; exact
//! numbers always come from the upstream's usage accounting.

use crate::protocol::anthropic::{ContentBlock, MessageContent, MessageCreateParams};

/// Flat charge for an image block, roughly a mid-size image at default
/// detail.
const IMAGE_TOKENS: u32 = 1600;

/// Per-message framing overhead (role markers and separators).
const MESSAGE_OVERHEAD: u32 = 4;

/// Estimate the input token count for a downstream request.
pub fn estimate_request(params: &MessageCreateParams) -> u32 {
    let mut total: u32 = 0;

    if let Some(system) = &params.system {
        total += estimate_text(&system.joined());
    }

    for message in &params.messages {
        total += MESSAGE_OVERHEAD;
        match &message.content {
            MessageContent::Text(text) => total += estimate_text(text),
            MessageContent::Blocks(blocks) => {
                for block in blocks {
                    total += match block {
                        ContentBlock::Text { text } => estimate_text(text),
                        ContentBlock::ToolUse { name, input, .. } => {
                            estimate_text(name) + estimate_text(&input.to_string())
                        }
                        ContentBlock::ToolResult { content, .. } => content
                            .as_ref()
                            .map(|c| match c {
                                serde_json::Value::String(s) => estimate_text(s),
                                other => estimate_text(&other.to_string()),
                            })
                            .unwrap_or(0),
                        ContentBlock::Image { .. } => IMAGE_TOKENS,
                        ContentBlock::Thinking { thinking } => estimate_text(thinking),
                    };
                }
            }
        }
    }

    for tool in params.tools.as_deref().unwrap_or_default() {
        total += estimate_text(&tool.name);
        if let Some(description) = &tool.description {
            total += estimate_text(description);
        }
        if let Some(schema) = &tool.input_schema {
            total += estimate_text(&schema.to_string());
        }
    }

    total.max(1)
}

/// Estimate tokens for a text span.
pub fn estimate_text(text: &str) -> u32 {
    if text.is_empty() {
        return 0;
    }
    let chars = text.chars().count();
    let non_ascii = text.chars().filter(|c| !c.is_ascii()).count();
    let words = text.split_whitespace().count();

    let estimate = (chars - non_ascii) as f64 / 4.0 + non_ascii as f64 + words as f64 * 0.1;
    (estimate.ceil() as u32).max(1)
}
