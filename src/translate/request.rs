//! Downstream request → upstream request translation.
//!
//! A single downstream message can fan out into several input items: text
//! runs buffer up and flush as message items, while tool_use, tool_result,
//! and image blocks each emit their own item. Tool identities cross the
//! protocol boundary through the conversation's bindings; a tool_use the
//! store has never seen gets a freshly minted `call_id`, handed back to the
//! caller to persist once the turn completes.

use std::collections::HashSet;

use serde_json::{json, Value};

use crate::conversations::{ConversationSnapshot, ToolBinding};
use crate::error::GatewayError;
use crate::protocol::{anthropic, openai};
use crate::translate::schema;
use crate::util::mint_id;

/// `max_output_tokens` never goes below this; small downstream budgets
/// starve the upstream of room for reasoning before visible output.
const OUTPUT_TOKEN_FLOOR: u32 = 16384;

#[derive(Debug)]
pub struct TranslatedRequest {
    pub request: openai::ResponsesRequest,
    /// Bindings minted while resolving tool_use ids; the caller persists
    /// them to the conversation when the upstream response completes.
    pub minted: Vec<ToolBinding>,
}

/// Build the upstream request for one downstream call.
pub fn build_request(
    params: &anthropic::MessageCreateParams,
    conversation: &ConversationSnapshot,
    upstream_model: &str,
) -> Result<TranslatedRequest, GatewayError> {
    let mut builder = ItemBuilder::new(conversation);

    for message in &params.messages {
        builder.push_message(message)?;
    }
    builder.drop_unpaired_calls();

    let instructions = params
        .system
        .as_ref()
        .map(|s| s.joined())
        .filter(|s| !s.is_empty());

    let tools = convert_tools(params.tools.as_deref());
    let tool_choice = params.tool_choice.as_ref().map(convert_tool_choice);

    let request = openai::ResponsesRequest {
        model: upstream_model.to_string(),
        input: builder.items,
        instructions,
        tools,
        tool_choice,
        max_output_tokens: Some(
            params
                .max_tokens
                .unwrap_or(OUTPUT_TOKEN_FLOOR)
                .max(OUTPUT_TOKEN_FLOOR),
        ),
        temperature: params.temperature,
        top_p: params.top_p,
        previous_response_id: conversation.last_response_id.clone(),
        stream: None,
    };

    Ok(TranslatedRequest {
        request,
        minted: builder.minted,
    })
}

// ============================================================================
// Message Conversion
// ============================================================================

struct ItemBuilder<'a> {
    conversation: &'a ConversationSnapshot,
    items: Vec<openai::InputItem>,
    minted: Vec<ToolBinding>,
}

impl<'a> ItemBuilder<'a> {
    fn new(conversation: &'a ConversationSnapshot) -> Self {
        Self {
            conversation,
            items: Vec::new(),
            minted: Vec::new(),
        }
    }

    fn push_message(&mut self, message: &anthropic::MessageParam) -> Result<(), GatewayError> {
        let role = message.role.as_str();
        match &message.content {
            anthropic::MessageContent::Text(text) => {
                self.items
                    .push(openai::InputItem::text_message(role, text.clone()));
            }
            anthropic::MessageContent::Blocks(blocks) => {
                let mut buffer: Vec<String> = Vec::new();
                for block in blocks {
                    match block {
                        anthropic::ContentBlock::Text { text } => buffer.push(text.clone()),
                        anthropic::ContentBlock::ToolUse { id, name, input } => {
                            self.flush(role, &mut buffer);
                            let call_id = self.resolve_tool_use(id, name);
                            self.items.push(openai::InputItem::FunctionCall {
                                call_id,
                                name: name.clone(),
                                arguments: serde_json::to_string(input).unwrap_or_default(),
                            });
                        }
                        anthropic::ContentBlock::ToolResult {
                            tool_use_id,
                            content,
                        } => {
                            self.flush(role, &mut buffer);
                            let call_id = self.resolve_tool_result(tool_use_id);
                            self.items.push(openai::InputItem::FunctionCallOutput {
                                call_id,
                                output: result_output(content.as_ref()),
                            });
                        }
                        anthropic::ContentBlock::Image { source } => {
                            self.flush(role, &mut buffer);
                            let image_url = image_url(source)?;
                            self.items.push(openai::InputItem::Message {
                                role: "user".to_string(),
                                content: openai::InputContent::Parts(vec![
                                    openai::InputPart::Image { image_url },
                                ]),
                            });
                        }
                        anthropic::ContentBlock::Thinking { .. } => {}
                    }
                }
                self.flush(role, &mut buffer);
            }
        }
        Ok(())
    }

    /// Flush buffered text runs as one message item. Assistant buffers
    /// collapse to plain text; multi-part user buffers keep their parts.
    fn flush(&mut self, role: &str, buffer: &mut Vec<String>) {
        if buffer.is_empty() {
            return;
        }
        let parts = std::mem::take(buffer);
        if role == "assistant" || parts.len() == 1 {
            self.items
                .push(openai::InputItem::text_message(role, parts.concat()));
        } else {
            self.items.push(openai::InputItem::Message {
                role: role.to_string(),
                content: openai::InputContent::Parts(
                    parts
                        .into_iter()
                        .map(|text| openai::InputPart::Text { text })
                        .collect(),
                ),
            });
        }
    }

    /// Resolve the `call_id` for an outbound tool_use block, minting and
    /// recording one when the conversation has no binding for it.
    fn resolve_tool_use(&mut self, tool_use_id: &str, name: &str) -> String {
        if let Some(call_id) = self.lookup(tool_use_id) {
            return call_id;
        }
        let call_id = mint_id("call");
        tracing::debug!(
            tool_use_id,
            call_id = %call_id,
            "no binding for tool_use, minted call_id"
        );
        self.minted.push(ToolBinding {
            call_id: call_id.clone(),
            tool_use_id: tool_use_id.to_string(),
            name: name.to_string(),
        });
        call_id
    }

    /// Resolve the `call_id` for a tool_result. A missing binding is
    /// unexpected (the call originated upstream) but never fatal: the
    /// downstream id is reused verbatim.
    fn resolve_tool_result(&mut self, tool_use_id: &str) -> String {
        if let Some(call_id) = self.lookup(tool_use_id) {
            return call_id;
        }
        tracing::warn!(
            tool_use_id,
            "unexpected: no binding for tool_result, reusing downstream id as call_id"
        );
        tool_use_id.to_string()
    }

    fn lookup(&self, tool_use_id: &str) -> Option<String> {
        if let Some(call_id) = self.conversation.bindings.call_id_for(tool_use_id) {
            return Some(call_id.to_string());
        }
        self.minted
            .iter()
            .find(|b| b.tool_use_id == tool_use_id)
            .map(|b| b.call_id.clone())
    }

    /// Drop every `function_call` whose `call_id` has no matching
    /// `function_call_output` in the same list; the upstream rejects
    /// unpaired calls, and dropping lets the model re-issue them.
    fn drop_unpaired_calls(&mut self) {
        let outputs: HashSet<String> = self
            .items
            .iter()
            .filter_map(|item| match item {
                openai::InputItem::FunctionCallOutput { call_id, .. } => Some(call_id.clone()),
                _ => None,
            })
            .collect();

        self.items.retain(|item| match item {
            openai::InputItem::FunctionCall { call_id, name, .. } => {
                let paired = outputs.contains(call_id);
                if !paired {
                    tracing::warn!(
                        call_id = %call_id,
                        tool = %name,
                        "dropping function_call without matching output"
                    );
                }
                paired
            }
            _ => true,
        });
    }
}

fn result_output(content: Option<&Value>) -> String {
    match content {
        None => String::new(),
        Some(Value::String(text)) => text.clone(),
        Some(other) => other.to_string(),
    }
}

fn image_url(source: &anthropic::ImageSource) -> Result<String, GatewayError> {
    match source.kind.as_str() {
        "base64" => {
            let data = source.data.as_deref().ok_or_else(|| {
                GatewayError::UnsupportedImage("base64 image source without data".to_string())
            })?;
            let media_type = source.media_type.as_deref().unwrap_or("image/png");
            Ok(format!("data:{};base64,{}", media_type, data))
        }
        "url" => source.url.clone().ok_or_else(|| {
            GatewayError::UnsupportedImage("url image source without url".to_string())
        }),
        other => Err(GatewayError::UnsupportedImage(format!(
            "unsupported image source kind: {}",
            other
        ))),
    }
}

// ============================================================================
// Tool Conversion
// ============================================================================

fn convert_tools(defs: Option<&[anthropic::ToolDefinition]>) -> Vec<openai::Tool> {
    let mut tools: Vec<openai::Tool> = Vec::new();
    for def in defs.unwrap_or_default() {
        if let Some(input_schema) = &def.input_schema {
            tools.push(openai::Tool::Function {
                name: def.name.clone(),
                description: def.description.clone(),
                parameters: schema::normalize(input_schema),
                strict: true,
            });
        } else if def.name == "web_search" {
            // The upstream's native web-search tool is appended below.
            tracing::debug!("web_search handled by the upstream built-in");
        } else if let Some(tool) = builtin_tool(&def.name) {
            tools.push(tool);
        } else {
            tracing::warn!(tool = %def.name, kind = ?def.kind, "dropping unknown built-in tool");
        }
    }
    tools.push(openai::Tool::WebSearch);
    tools
}

/// Canonical function definitions for the downstream built-in tools the
/// upstream has no native counterpart for.
fn builtin_tool(name: &str) -> Option<openai::Tool> {
    let (description, parameters) = match name {
        "bash" => (
            "Run a command in a persistent bash session",
            json!({
                "type": "object",
                "properties": {
                    "command": {
                        "type": "string",
                        "description": "The shell command to execute"
                    },
                    "restart": {
                        "type": "boolean",
                        "description": "Discard the session and start a fresh shell"
                    }
                }
            }),
        ),
        "str_replace_editor" | "str_replace_based_edit_tool" => (
            "View and edit files",
            json!({
                "type": "object",
                "properties": {
                    "command": {
                        "type": "string",
                        "enum": ["view", "create", "str_replace", "insert"]
                    },
                    "path": {"type": "string"},
                    "file_text": {"type": "string"},
                    "old_str": {"type": "string"},
                    "new_str": {"type": "string"},
                    "insert_line": {"type": "integer"},
                    "view_range": {
                        "type": "array",
                        "items": {"type": "integer"}
                    }
                }
            }),
        ),
        _ => return None,
    };

    Some(openai::Tool::Function {
        name: name.to_string(),
        description: Some(description.to_string()),
        parameters: schema::normalize(&parameters),
        strict: true,
    })
}

fn convert_tool_choice(choice: &anthropic::ToolChoice) -> openai::ToolChoice {
    match choice {
        anthropic::ToolChoice::Tool { name } => openai::ToolChoice::function(name.clone()),
        anthropic::ToolChoice::Any => openai::ToolChoice::Mode("required".to_string()),
        anthropic::ToolChoice::Auto | anthropic::ToolChoice::Other => {
            openai::ToolChoice::Mode("auto".to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conversations::ToolBindings;
    use serde_json::json;

    fn params(body: Value) -> anthropic::MessageCreateParams {
        serde_json::from_value(body).unwrap()
    }

    fn empty_conversation() -> ConversationSnapshot {
        ConversationSnapshot::default()
    }

    fn conversation_with(call_id: &str, tool_use_id: &str) -> ConversationSnapshot {
        let mut bindings = ToolBindings::default();
        bindings.insert(ToolBinding {
            call_id: call_id.to_string(),
            tool_use_id: tool_use_id.to_string(),
            name: "calc".to_string(),
        });
        ConversationSnapshot {
            last_response_id: Some("resp_prev".to_string()),
            bindings,
        }
    }

    fn to_value(request: &openai::ResponsesRequest) -> Value {
        serde_json::to_value(request).unwrap()
    }

    #[test]
    fn plain_text_message_becomes_single_item() {
        let params = params(json!({
            "model": "claude-sonnet-4-20250514",
            "max_tokens": 1024,
            "messages": [{"role": "user", "content": "Hello"}]
        }));
        let out = build_request(&params, &empty_conversation(), "gpt-4.1").unwrap();
        let value = to_value(&out.request);

        assert_eq!(value["model"], "gpt-4.1");
        assert_eq!(value["input"].as_array().unwrap().len(), 1);
        assert_eq!(value["input"][0]["content"], "Hello");
        // Floor applies when the downstream budget is below it.
        assert_eq!(value["max_output_tokens"], 16384);
    }

    #[test]
    fn system_blocks_become_instructions() {
        let params = params(json!({
            "model": "m",
            "system": [
                {"type": "text", "text": "First."},
                {"type": "text", "text": "Second."}
            ],
            "messages": [{"role": "user", "content": "Hi"}]
        }));
        let out = build_request(&params, &empty_conversation(), "gpt-4.1").unwrap();
        assert_eq!(
            out.request.instructions.as_deref(),
            Some("First.\n\nSecond.")
        );
    }

    #[test]
    fn max_tokens_above_floor_passes_through() {
        let params = params(json!({
            "model": "m",
            "max_tokens": 32000,
            "messages": [{"role": "user", "content": "Hi"}]
        }));
        let out = build_request(&params, &empty_conversation(), "gpt-4.1").unwrap();
        assert_eq!(out.request.max_output_tokens, Some(32000));
    }

    #[test]
    fn tool_result_resolves_call_id_from_conversation() {
        // Scenario: the previous turn bound c1 -> f1; the client now submits
        // the result quoting f1.
        let params = params(json!({
            "model": "m",
            "messages": [{
                "role": "user",
                "content": [{"type": "tool_result", "tool_use_id": "f1", "content": "3"}]
            }]
        }));
        let out = build_request(&params, &conversation_with("c1", "f1"), "gpt-4.1").unwrap();
        let value = to_value(&out.request);

        let items = value["input"].as_array().unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0]["type"], "function_call_output");
        assert_eq!(items[0]["call_id"], "c1");
        assert_eq!(items[0]["output"], "3");
        assert_eq!(value["previous_response_id"], "resp_prev");
        assert!(out.minted.is_empty());
    }

    #[test]
    fn tool_result_without_binding_reuses_downstream_id() {
        let params = params(json!({
            "model": "m",
            "messages": [{
                "role": "user",
                "content": [{"type": "tool_result", "tool_use_id": "orphan", "content": "x"}]
            }]
        }));
        let out = build_request(&params, &empty_conversation(), "gpt-4.1").unwrap();
        let value = to_value(&out.request);
        assert_eq!(value["input"][0]["call_id"], "orphan");
    }

    #[test]
    fn unknown_tool_use_mints_and_records_call_id() {
        let params = params(json!({
            "model": "m",
            "messages": [
                {
                    "role": "assistant",
                    "content": [{"type": "tool_use", "id": "f9", "name": "calc", "input": {"x": 1}}]
                },
                {
                    "role": "user",
                    "content": [{"type": "tool_result", "tool_use_id": "f9", "content": "2"}]
                }
            ]
        }));
        let out = build_request(&params, &empty_conversation(), "gpt-4.1").unwrap();

        assert_eq!(out.minted.len(), 1);
        let binding = &out.minted[0];
        assert_eq!(binding.tool_use_id, "f9");
        assert!(binding.call_id.starts_with("call_"));

        // Both items reference the same minted call_id, so the pair
        // survives the post-filter.
        let value = to_value(&out.request);
        let items = value["input"].as_array().unwrap();
        assert_eq!(items[0]["type"], "function_call");
        assert_eq!(items[0]["call_id"], binding.call_id);
        assert_eq!(items[1]["type"], "function_call_output");
        assert_eq!(items[1]["call_id"], binding.call_id);
    }

    #[test]
    fn unpaired_function_call_is_dropped() {
        let params = params(json!({
            "model": "m",
            "messages": [{
                "role": "assistant",
                "content": [
                    {"type": "text", "text": "Using a tool"},
                    {"type": "tool_use", "id": "f1", "name": "calc", "input": {}}
                ]
            }]
        }));
        let out = build_request(&params, &conversation_with("c1", "f1"), "gpt-4.1").unwrap();
        let value = to_value(&out.request);

        let kinds: Vec<&str> = value["input"]
            .as_array()
            .unwrap()
            .iter()
            .map(|i| i["type"].as_str().unwrap())
            .collect();
        assert_eq!(kinds, vec!["message"]);
    }

    #[test]
    fn paired_function_call_survives_post_filter() {
        let params = params(json!({
            "model": "m",
            "messages": [
                {
                    "role": "assistant",
                    "content": [{"type": "tool_use", "id": "f1", "name": "calc", "input": {}}]
                },
                {
                    "role": "user",
                    "content": [{"type": "tool_result", "tool_use_id": "f1", "content": "ok"}]
                }
            ]
        }));
        let out = build_request(&params, &conversation_with("c1", "f1"), "gpt-4.1").unwrap();
        let value = to_value(&out.request);
        let kinds: Vec<&str> = value["input"]
            .as_array()
            .unwrap()
            .iter()
            .map(|i| i["type"].as_str().unwrap())
            .collect();
        assert_eq!(kinds, vec!["function_call", "function_call_output"]);
    }

    #[test]
    fn text_buffer_flushes_before_tool_use() {
        let params = params(json!({
            "model": "m",
            "messages": [{
                "role": "assistant",
                "content": [
                    {"type": "text", "text": "Let me "},
                    {"type": "text", "text": "check."},
                    {"type": "tool_use", "id": "f1", "name": "calc", "input": {}}
                ]
            }, {
                "role": "user",
                "content": [{"type": "tool_result", "tool_use_id": "f1", "content": "ok"}]
            }]
        }));
        let out = build_request(&params, &conversation_with("c1", "f1"), "gpt-4.1").unwrap();
        let value = to_value(&out.request);
        let items = value["input"].as_array().unwrap();

        // Assistant text collapses to one plain-text message ahead of the
        // function_call.
        assert_eq!(items[0]["type"], "message");
        assert_eq!(items[0]["content"], "Let me check.");
        assert_eq!(items[1]["type"], "function_call");
    }

    #[test]
    fn multi_part_user_text_keeps_parts() {
        let params = params(json!({
            "model": "m",
            "messages": [{
                "role": "user",
                "content": [
                    {"type": "text", "text": "Part one"},
                    {"type": "text", "text": "Part two"},
                    {"type": "image", "source": {"type": "base64", "media_type": "image/jpeg", "data": "AAAA"}}
                ]
            }]
        }));
        let out = build_request(&params, &empty_conversation(), "gpt-4.1").unwrap();
        let value = to_value(&out.request);
        let items = value["input"].as_array().unwrap();

        assert_eq!(items[0]["content"][0]["type"], "input_text");
        assert_eq!(items[0]["content"][1]["type"], "input_text");
        assert_eq!(
            items[1]["content"][0]["image_url"],
            "data:image/jpeg;base64,AAAA"
        );
    }

    #[test]
    fn url_image_passes_through_and_unknown_kind_fails() {
        let params_url = params(json!({
            "model": "m",
            "messages": [{
                "role": "user",
                "content": [{"type": "image", "source": {"type": "url", "url": "https://example.com/cat.png"}}]
            }]
        }));
        let out = build_request(&params_url, &empty_conversation(), "gpt-4.1").unwrap();
        let value = to_value(&out.request);
        assert_eq!(
            value["input"][0]["content"][0]["image_url"],
            "https://example.com/cat.png"
        );

        let params_bad = params(json!({
            "model": "m",
            "messages": [{
                "role": "user",
                "content": [{"type": "image", "source": {"type": "file", "file_id": "f_1"}}]
            }]
        }));
        let err = build_request(&params_bad, &empty_conversation(), "gpt-4.1").unwrap_err();
        assert!(matches!(err, GatewayError::UnsupportedImage(_)));
    }

    #[test]
    fn client_tools_are_normalized_and_web_search_appended() {
        let params = params(json!({
            "model": "m",
            "tools": [{
                "name": "lookup",
                "description": "Find things",
                "input_schema": {
                    "type": "object",
                    "properties": {"q": {"type": "string", "format": "uri"}}
                }
            }],
            "messages": [{"role": "user", "content": "Hi"}]
        }));
        let out = build_request(&params, &empty_conversation(), "gpt-4.1").unwrap();
        let value = to_value(&out.request);
        let tools = value["tools"].as_array().unwrap();

        assert_eq!(tools.len(), 2);
        assert_eq!(tools[0]["type"], "function");
        assert_eq!(tools[0]["strict"], true);
        assert_eq!(tools[0]["parameters"]["required"], json!(["q"]));
        assert!(tools[0]["parameters"]["properties"]["q"]
            .get("format")
            .is_none());
        assert_eq!(tools[1]["type"], "web_search");
    }

    #[test]
    fn builtin_tools_map_and_unknown_builtin_drops() {
        let params = params(json!({
            "model": "m",
            "tools": [
                {"name": "bash", "type": "bash_20250124"},
                {"name": "mystery_tool", "type": "mystery_20250101"}
            ],
            "messages": [{"role": "user", "content": "Hi"}]
        }));
        let out = build_request(&params, &empty_conversation(), "gpt-4.1").unwrap();
        let value = to_value(&out.request);
        let tools = value["tools"].as_array().unwrap();

        // bash maps to a canonical function tool, mystery drops, web_search
        // is appended.
        assert_eq!(tools.len(), 2);
        assert_eq!(tools[0]["name"], "bash");
        assert_eq!(tools[0]["parameters"]["additionalProperties"], false);
        assert_eq!(tools[1]["type"], "web_search");
    }

    #[test]
    fn tool_choice_mapping() {
        let cases = [
            (json!({"type": "auto"}), json!("auto")),
            (json!({"type": "any"}), json!("required")),
            (
                json!({"type": "tool", "name": "calc"}),
                json!({"type": "function", "name": "calc"}),
            ),
        ];
        for (choice, expected) in cases {
            let params = params(json!({
                "model": "m",
                "tool_choice": choice,
                "messages": [{"role": "user", "content": "Hi"}]
            }));
            let out = build_request(&params, &empty_conversation(), "gpt-4.1").unwrap();
            let value = to_value(&out.request);
            assert_eq!(value["tool_choice"], expected);
        }
    }
}
