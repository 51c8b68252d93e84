use super::{
    data_payload, split_system, Message, MessageRole, PreparedRequest, ProviderConfig, StreamEvent,
    ToolDefinition,
};
use serde_json::{json, Value};

pub const ANTHROPIC_VERSION: &str = "2023-06-01";
const MAX_TOKENS: u32 = 4096;

pub fn build_request(
    config: &ProviderConfig,
    messages: &[Message],
    tools: &[ToolDefinition],
) -> PreparedRequest {
    let (system, turns) = split_system(messages);

    let mut body = json!({
        "model": config.model_id,
        "max_tokens": MAX_TOKENS,
        "stream": true,
        "messages": turns.into_iter().map(convert_message).collect::<Vec<_>>(),
    });

    if let Some(system) = system.and_then(|m| m.content.as_deref()).filter(|c| !c.is_empty()) {
        body["system"] = Value::String(system.to_string());
    }

    if !tools.is_empty() {
        body["tools"] = tools
            .iter()
            .map(|t| {
                json!({
                    "name": t.name,
                    "description": t.description,
                    "input_schema": t.parameters
                })
            })
            .collect();
    }

    PreparedRequest {
        url: format!("{}/v1/messages", config.resolved_base_url()),
        headers: vec![
            ("Content-Type", "application/json".to_string()),
            ("x-api-key", config.api_key.clone()),
            ("anthropic-version", ANTHROPIC_VERSION.to_string()),
        ],
        body,
    }
}

fn convert_message(message: &Message) -> Value {
    match message.role {
        MessageRole::Assistant if !message.tool_calls().is_empty() => {
            let mut content = Vec::new();
            if let Some(text) = message.content.as_deref().filter(|c| !c.is_empty()) {
                content.push(json!({ "type": "text", "text": text }));
            }
            for tc in message.tool_calls() {
                content.push(json!({
                    "type": "tool_use",
                    "id": tc.id,
                    "name": tc.name,
                    "input": tc.parsed_arguments(),
                }));
            }
            json!({ "role": "assistant", "content": content })
        }
        MessageRole::Tool => json!({
            "role": "user",
            "content": [{
                "type": "tool_result",
                "tool_use_id": message.tool_call_id.as_deref().unwrap_or_default(),
                "content": message.content_str(),
            }]
        }),
        MessageRole::Assistant => json!({ "role": "assistant", "content": message.content_str() }),
        MessageRole::User | MessageRole::System => {
            json!({ "role": "user", "content": message.content_str() })
        }
    }
}

/// `event_type` is the most recent `event:` line; the payload's own `type`
/// is only consulted when no event line preceded it.
pub fn parse_line(line: &str, event_type: Option<&str>) -> Vec<StreamEvent> {
    let Some(data) = data_payload(line) else {
        return Vec::new();
    };
    let Ok(json) = serde_json::from_str::<Value>(data) else {
        return Vec::new();
    };

    let kind = event_type
        .filter(|t| !t.is_empty())
        .or_else(|| json.get("type").and_then(Value::as_str))
        .unwrap_or_default();

    match kind {
        "content_block_start" => {
            let block = &json["content_block"];
            if block["type"] == "tool_use" {
                let id = block["id"].as_str().unwrap_or_default();
                let name = block["name"].as_str().unwrap_or_default();
                return vec![StreamEvent::ToolCallStart {
                    id: id.to_string(),
                    name: name.to_string(),
                }];
            }
            Vec::new()
        }
        "content_block_delta" => {
            let delta = &json["delta"];
            match delta["type"].as_str() {
                Some("text_delta") => match delta["text"].as_str() {
                    Some(text) if !text.is_empty() => vec![StreamEvent::TextDelta(text.to_string())],
                    _ => Vec::new(),
                },
                Some("input_json_delta") => match delta["partial_json"].as_str() {
                    Some(partial) if !partial.is_empty() => vec![StreamEvent::ToolCallDelta {
                        id: String::new(),
                        arguments: partial.to_string(),
                    }],
                    _ => Vec::new(),
                },
                _ => Vec::new(),
            }
        }
        "message_stop" => vec![StreamEvent::Done],
        "error" => {
            let message = json
                .pointer("/error/message")
                .and_then(Value::as_str)
                .unwrap_or("Unknown error");
            vec![StreamEvent::Error(message.to_string())]
        }
        _ => Vec::new(),
    }
}
