//! Upstream protocol: OpenAI Responses API request, response, and stream
//! event shapes.
//!
//! The request side serializes an ordered list of input items; the response
//! side deserializes the response object and the `response.*` event stream.
//! Unrecognized event types and output item kinds collapse into `Unknown`
//! variants so a protocol addition upstream never aborts a session.

use serde::{Deserialize, Serialize};
use serde_json::Value;

// ============================================================================
// Request Types
// ============================================================================

#[derive(Debug, Clone, Serialize)]
pub struct ResponsesRequest {
    pub model: String,
    pub input: Vec<InputItem>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub instructions: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub tools: Vec<Tool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_choice: Option<ToolChoice>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_output_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub previous_response_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stream: Option<bool>,
}

/// A positional element of the upstream request.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type")]
pub enum InputItem {
    #[serde(rename = "message")]
    Message { role: String, content: InputContent },
    #[serde(rename = "function_call")]
    FunctionCall {
        call_id: String,
        name: String,
        arguments: String,
    },
    #[serde(rename = "function_call_output")]
    FunctionCallOutput { call_id: String, output: String },
}

impl InputItem {
    pub fn text_message(role: &str, text: String) -> Self {
        InputItem::Message {
            role: role.to_string(),
            content: InputContent::Text(text),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum InputContent {
    Text(String),
    Parts(Vec<InputPart>),
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type")]
pub enum InputPart {
    #[serde(rename = "input_text")]
    Text { text: String },
    #[serde(rename = "input_image")]
    Image { image_url: String },
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type")]
pub enum Tool {
    #[serde(rename = "function")]
    Function {
        name: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        description: Option<String>,
        parameters: Value,
        strict: bool,
    },
    #[serde(rename = "web_search")]
    WebSearch,
}

#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum ToolChoice {
    Mode(String),
    Function {
        #[serde(rename = "type")]
        kind: String,
        name: String,
    },
}

impl ToolChoice {
    pub fn function(name: String) -> Self {
        ToolChoice::Function {
            kind: "function".to_string(),
            name,
        }
    }
}

// ============================================================================
// Response Types
// ============================================================================

#[derive(Debug, Clone, Deserialize)]
pub struct ResponseObject {
    pub id: String,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub incomplete_details: Option<IncompleteDetails>,
    #[serde(default)]
    pub output: Vec<OutputItem>,
    #[serde(default)]
    pub usage: Option<ResponseUsage>,
    #[serde(default)]
    pub error: Option<ResponseError>,
}

impl ResponseObject {
    /// True when the response ran out of output-token budget.
    pub fn hit_output_limit(&self) -> bool {
        self.status.as_deref() == Some("incomplete")
            && self
                .incomplete_details
                .as_ref()
                .is_some_and(|d| d.reason.as_deref() == Some("max_output_tokens"))
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct IncompleteDetails {
    #[serde(default)]
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, Deserialize)]
pub struct ResponseUsage {
    #[serde(default)]
    pub input_tokens: u32,
    #[serde(default)]
    pub output_tokens: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ResponseError {
    #[serde(default)]
    pub message: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type")]
pub enum OutputItem {
    #[serde(rename = "message")]
    Message {
        #[serde(default)]
        content: Vec<OutputContent>,
    },
    #[serde(rename = "function_call")]
    FunctionCall {
        #[serde(default)]
        id: Option<String>,
        call_id: String,
        name: String,
        #[serde(default)]
        arguments: String,
    },
    #[serde(rename = "web_search_call")]
    WebSearchCall {
        #[serde(default)]
        #[allow(dead_code)]
        id: Option<String>,
    },
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type")]
pub enum OutputContent {
    #[serde(rename = "output_text")]
    Text {
        #[serde(default)]
        text: String,
    },
    #[serde(other)]
    Unknown,
}

// ============================================================================
// Stream Events
// ============================================================================

/// The `response.*` event family, one variant per event type the gateway
/// reacts to. Anything else lands in `Unknown` and is dropped with a log
/// line by the stream translator.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type")]
pub enum StreamEvent {
    #[serde(rename = "response.created")]
    Created { response: ResponseObject },
    #[serde(rename = "response.in_progress")]
    InProgress,
    #[serde(rename = "response.output_text.delta")]
    OutputTextDelta {
        #[serde(default)]
        item_id: Option<String>,
        delta: String,
    },
    #[serde(rename = "response.output_text.done")]
    OutputTextDone {
        #[serde(default)]
        #[allow(dead_code)]
        item_id: Option<String>,
    },
    #[serde(rename = "response.output_item.added")]
    OutputItemAdded { item: OutputItem },
    #[serde(rename = "response.output_item.done")]
    OutputItemDone { item: OutputItem },
    #[serde(rename = "response.function_call_arguments.delta")]
    FunctionCallArgumentsDelta { item_id: String, delta: String },
    #[serde(rename = "response.function_call_arguments.done")]
    FunctionCallArgumentsDone {
        #[serde(default)]
        #[allow(dead_code)]
        item_id: Option<String>,
    },
    #[serde(rename = "response.content_part.added")]
    ContentPartAdded {
        #[serde(default)]
        part: Option<ContentPart>,
    },
    #[serde(rename = "response.content_part.done")]
    ContentPartDone {
        #[serde(default)]
        part: Option<ContentPart>,
    },
    #[serde(rename = "response.web_search_call.in_progress")]
    WebSearchInProgress {
        #[serde(default)]
        item_id: Option<String>,
    },
    #[serde(rename = "response.web_search_call.searching")]
    WebSearchSearching {
        #[serde(default)]
        item_id: Option<String>,
    },
    #[serde(rename = "response.web_search_call.completed")]
    WebSearchCompleted {
        #[serde(default)]
        item_id: Option<String>,
    },
    #[serde(rename = "response.completed")]
    Completed { response: ResponseObject },
    #[serde(rename = "response.failed")]
    Failed {
        #[serde(default)]
        response: Option<ResponseObject>,
    },
    #[serde(rename = "response.incomplete")]
    Incomplete {
        #[serde(default)]
        response: Option<ResponseObject>,
    },
    #[serde(rename = "error")]
    Error {
        #[serde(default)]
        message: Option<String>,
    },
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type")]
pub enum ContentPart {
    #[serde(rename = "output_text")]
    Text {
        #[serde(default)]
        text: String,
    },
    #[serde(other)]
    Unknown,
}

impl ContentPart {
    pub fn text(&self) -> Option<&str> {
        match self {
            ContentPart::Text { text } if !text.is_empty() => Some(text),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn request_serializes_tagged_input_items() {
        let request = ResponsesRequest {
            model: "gpt-4.1".to_string(),
            input: vec![
                InputItem::text_message("user", "Hello".to_string()),
                InputItem::FunctionCall {
                    call_id: "call_1".to_string(),
                    name: "calc".to_string(),
                    arguments: "{\"x\":1}".to_string(),
                },
                InputItem::FunctionCallOutput {
                    call_id: "call_1".to_string(),
                    output: "2".to_string(),
                },
            ],
            instructions: Some("Be brief".to_string()),
            tools: vec![Tool::WebSearch],
            tool_choice: Some(ToolChoice::Mode("auto".to_string())),
            max_output_tokens: Some(16384),
            temperature: None,
            top_p: None,
            previous_response_id: None,
            stream: None,
        };
        let value = serde_json::to_value(&request).unwrap();
        assert_eq!(value["input"][0]["type"], "message");
        assert_eq!(value["input"][1]["type"], "function_call");
        assert_eq!(value["input"][2]["type"], "function_call_output");
        assert_eq!(value["tools"][0]["type"], "web_search");
        assert_eq!(value["tool_choice"], "auto");
        // Unset options stay off the wire entirely.
        assert!(value.get("temperature").is_none());
        assert!(value.get("previous_response_id").is_none());
    }

    #[test]
    fn stream_events_parse_by_type_tag() {
        let event: StreamEvent = serde_json::from_value(json!({
            "type": "response.output_text.delta",
            "item_id": "msg_1",
            "delta": "Hi"
        }))
        .unwrap();
        assert!(matches!(
            event,
            StreamEvent::OutputTextDelta { delta, .. } if delta == "Hi"
        ));

        let event: StreamEvent = serde_json::from_value(json!({
            "type": "response.output_item.added",
            "output_index": 1,
            "item": {
                "type": "function_call",
                "id": "fc_1",
                "call_id": "call_9",
                "name": "calc",
                "arguments": ""
            }
        }))
        .unwrap();
        match event {
            StreamEvent::OutputItemAdded {
                item: OutputItem::FunctionCall { call_id, name, .. },
            } => {
                assert_eq!(call_id, "call_9");
                assert_eq!(name, "calc");
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[test]
    fn unknown_event_types_fall_through() {
        let event: StreamEvent = serde_json::from_value(json!({
            "type": "response.reasoning_summary.delta",
            "delta": "..."
        }))
        .unwrap();
        assert!(matches!(event, StreamEvent::Unknown));
    }

    #[test]
    fn output_limit_detection_requires_both_fields() {
        let response: ResponseObject = serde_json::from_value(json!({
            "id": "resp_1",
            "status": "incomplete",
            "incomplete_details": {"reason": "max_output_tokens"}
        }))
        .unwrap();
        assert!(response.hit_output_limit());

        let response: ResponseObject = serde_json::from_value(json!({
            "id": "resp_2",
            "status": "incomplete",
            "incomplete_details": {"reason": "content_filter"}
        }))
        .unwrap();
        assert!(!response.hit_output_limit());
    }
}
