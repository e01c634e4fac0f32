//! Downstream protocol: Anthropic Messages API request, response, and
//! stream event shapes.
//!
//! Request content is either a plain string or a list of typed blocks, so
//! the content types are untagged unions over both forms. Stream events are
//! serialized exactly as the Messages API emits them; the SSE `event:` name
//! for each frame comes from [`StreamEvent::name`].

use serde::{Deserialize, Serialize};
use serde_json::Value;

// ============================================================================
// Request Types
// ============================================================================

/// Body of `POST /v1/messages`.
#[derive(Debug, Clone, Deserialize)]
pub struct MessageCreateParams {
    pub model: String,
    pub messages: Vec<MessageParam>,
    #[serde(default)]
    pub system: Option<SystemPrompt>,
    #[serde(default)]
    pub max_tokens: Option<u32>,
    #[serde(default)]
    pub temperature: Option<f32>,
    #[serde(default)]
    pub top_p: Option<f32>,
    #[serde(default)]
    pub tools: Option<Vec<ToolDefinition>>,
    #[serde(default)]
    pub tool_choice: Option<ToolChoice>,
    // Streaming is selected by the x-stainless-helper-method header; the
    // body flag is accepted but not consulted.
    #[serde(default)]
    #[allow(dead_code)]
    pub stream: Option<bool>,
    #[serde(default)]
    #[allow(dead_code)]
    pub stop_sequences: Option<Vec<String>>,
    #[serde(default)]
    #[allow(dead_code)]
    pub metadata: Option<Value>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum SystemPrompt {
    Text(String),
    Blocks(Vec<SystemBlock>),
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type")]
pub enum SystemBlock {
    #[serde(rename = "text")]
    Text { text: String },
}

impl SystemPrompt {
    /// Flatten to a single instruction string, blank-line separated.
    pub fn joined(&self) -> String {
        match self {
            SystemPrompt::Text(text) => text.clone(),
            SystemPrompt::Blocks(blocks) => blocks
                .iter()
                .map(|SystemBlock::Text { text }| text.as_str())
                .collect::<Vec<_>>()
                .join("\n\n"),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct MessageParam {
    pub role: String,
    pub content: MessageContent,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum MessageContent {
    Text(String),
    Blocks(Vec<ContentBlock>),
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type")]
pub enum ContentBlock {
    #[serde(rename = "text")]
    Text { text: String },
    #[serde(rename = "image")]
    Image { source: ImageSource },
    #[serde(rename = "tool_use")]
    ToolUse {
        id: String,
        name: String,
        input: Value,
    },
    #[serde(rename = "tool_result")]
    ToolResult {
        tool_use_id: String,
        #[serde(default)]
        content: Option<Value>,
    },
    // Extended thinking blocks are dropped on the way upstream.
    #[serde(rename = "thinking")]
    Thinking {
        #[allow(dead_code)]
        thinking: String,
    },
}

/// Image source. The `kind` discriminator stays a plain string so that an
/// unsupported source produces a translation error, not a body parse error.
#[derive(Debug, Clone, Deserialize)]
pub struct ImageSource {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub media_type: Option<String>,
    #[serde(default)]
    pub data: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
}

/// A tool entry in the request. Client tools carry `input_schema`; built-in
/// server tools carry a versioned `type` and no schema.
#[derive(Debug, Clone, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub input_schema: Option<Value>,
    #[serde(rename = "type", default)]
    pub kind: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type")]
pub enum ToolChoice {
    #[serde(rename = "auto")]
    Auto,
    #[serde(rename = "any")]
    Any,
    #[serde(rename = "tool")]
    Tool { name: String },
    // Anything else (e.g. "none") degrades to auto.
    #[serde(other)]
    Other,
}

// ============================================================================
// Response Types
// ============================================================================

/// A complete assistant message, as returned by the non-streaming path and
/// embedded in `message_start`.
#[derive(Debug, Clone, Serialize)]
pub struct Message {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub role: &'static str,
    pub content: Vec<OutputBlock>,
    pub model: String,
    pub stop_reason: Option<StopReason>,
    pub stop_sequence: Option<String>,
    pub usage: Usage,
}

impl Message {
    /// Empty assistant shell used by `message_start`.
    pub fn shell(id: String, model: String) -> Self {
        Self {
            id,
            kind: "message",
            role: "assistant",
            content: Vec::new(),
            model,
            stop_reason: None,
            stop_sequence: None,
            usage: Usage::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type")]
pub enum OutputBlock {
    #[serde(rename = "text")]
    Text { text: String },
    #[serde(rename = "tool_use")]
    ToolUse {
        id: String,
        name: String,
        input: Value,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    EndTurn,
    MaxTokens,
    ToolUse,
}

impl StopReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            StopReason::EndTurn => "end_turn",
            StopReason::MaxTokens => "max_tokens",
            StopReason::ToolUse => "tool_use",
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct Usage {
    pub input_tokens: u32,
    pub output_tokens: u32,
}

// ============================================================================
// Stream Events
// ============================================================================

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type")]
pub enum StreamEvent {
    #[serde(rename = "message_start")]
    MessageStart { message: Message },
    #[serde(rename = "content_block_start")]
    ContentBlockStart { index: u32, content_block: OutputBlock },
    #[serde(rename = "content_block_delta")]
    ContentBlockDelta { index: u32, delta: Delta },
    #[serde(rename = "content_block_stop")]
    ContentBlockStop { index: u32 },
    #[serde(rename = "message_delta")]
    MessageDelta { delta: MessageDeltaBody, usage: Usage },
    #[serde(rename = "message_stop")]
    MessageStop,
    #[serde(rename = "error")]
    Error { error: ErrorBody },
}

impl StreamEvent {
    /// The SSE `event:` name for this frame.
    pub fn name(&self) -> &'static str {
        match self {
            StreamEvent::MessageStart { .. } => "message_start",
            StreamEvent::ContentBlockStart { .. } => "content_block_start",
            StreamEvent::ContentBlockDelta { .. } => "content_block_delta",
            StreamEvent::ContentBlockStop { .. } => "content_block_stop",
            StreamEvent::MessageDelta { .. } => "message_delta",
            StreamEvent::MessageStop => "message_stop",
            StreamEvent::Error { .. } => "error",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type")]
pub enum Delta {
    #[serde(rename = "text_delta")]
    TextDelta { text: String },
    #[serde(rename = "input_json_delta")]
    InputJsonDelta { partial_json: String },
}

#[derive(Debug, Clone, Serialize)]
pub struct MessageDeltaBody {
    pub stop_reason: StopReason,
    pub stop_sequence: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ErrorBody {
    #[serde(rename = "type")]
    pub kind: String,
    pub message: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn string_and_block_content_both_parse() {
        let body = json!({
            "model": "claude-sonnet-4-20250514",
            "max_tokens": 512,
            "messages": [
                {"role": "user", "content": "Hello"},
                {"role": "assistant", "content": [{"type": "text", "text": "Hi"}]}
            ]
        });
        let params: MessageCreateParams = serde_json::from_value(body).unwrap();
        assert!(matches!(params.messages[0].content, MessageContent::Text(_)));
        assert!(matches!(
            params.messages[1].content,
            MessageContent::Blocks(_)
        ));
    }

    #[test]
    fn system_blocks_join_with_blank_line() {
        let system: SystemPrompt = serde_json::from_value(json!([
            {"type": "text", "text": "You are terse."},
            {"type": "text", "text": "Answer in English."}
        ]))
        .unwrap();
        assert_eq!(system.joined(), "You are terse.\n\nAnswer in English.");
    }

    #[test]
    fn unknown_image_source_kind_still_parses() {
        // The discriminator is a plain string so translation, not body
        // parsing, decides whether the source is supported.
        let block: ContentBlock = serde_json::from_value(json!({
            "type": "image",
            "source": {"type": "file", "file_id": "f_123"}
        }))
        .unwrap();
        match block {
            ContentBlock::Image { source } => assert_eq!(source.kind, "file"),
            other => panic!("unexpected block: {:?}", other),
        }
    }

    #[test]
    fn stream_event_payload_matches_wire_shape() {
        let event = StreamEvent::ContentBlockDelta {
            index: 2,
            delta: Delta::TextDelta {
                text: "chunk".to_string(),
            },
        };
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["type"], "content_block_delta");
        assert_eq!(value["index"], 2);
        assert_eq!(value["delta"]["type"], "text_delta");
        assert_eq!(value["delta"]["text"], "chunk");
        assert_eq!(event.name(), "content_block_delta");
    }

    #[test]
    fn stop_reason_serializes_snake_case() {
        assert_eq!(
            serde_json::to_value(StopReason::EndTurn).unwrap(),
            json!("end_turn")
        );
        assert_eq!(
            serde_json::to_value(StopReason::MaxTokens).unwrap(),
            json!("max_tokens")
        );
    }
}
