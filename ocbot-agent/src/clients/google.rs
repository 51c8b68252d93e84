use super::{
    data_payload, split_system, Message, MessageRole, PreparedRequest, ProviderConfig, StreamEvent,
    ToolDefinition,
};
use serde_json::{json, Value};
use std::collections::HashMap;
use uuid::Uuid;

pub fn build_request(
    config: &ProviderConfig,
    messages: &[Message],
    tools: &[ToolDefinition],
) -> PreparedRequest {
    let (system, turns) = split_system(messages);

    // functionResponse parts are keyed by function name, not call id.
    let call_names: HashMap<&str, &str> = turns
        .iter()
        .flat_map(|m| m.tool_calls())
        .map(|tc| (tc.id.as_str(), tc.name.as_str()))
        .collect();

    let contents: Vec<Value> = turns
        .iter()
        .map(|m| convert_message(m, &call_names))
        .collect();

    let mut body = json!({ "contents": contents });

    if let Some(system) = system.and_then(|m| m.content.as_deref()).filter(|c| !c.is_empty()) {
        body["systemInstruction"] = json!({ "parts": [{ "text": system }] });
    }

    if !tools.is_empty() {
        let declarations: Vec<Value> = tools
            .iter()
            .map(|t| {
                json!({
                    "name": t.name,
                    "description": t.description,
                    "parameters": t.parameters
                })
            })
            .collect();
        body["tools"] = json!([{ "functionDeclarations": declarations }]);
    }

    PreparedRequest {
        url: format!(
            "{}/models/{}:streamGenerateContent?alt=sse&key={}",
            config.resolved_base_url(),
            config.model_id,
            config.api_key
        ),
        headers: vec![("Content-Type", "application/json".to_string())],
        body,
    }
}

fn convert_message(message: &Message, call_names: &HashMap<&str, &str>) -> Value {
    match message.role {
        MessageRole::Assistant if !message.tool_calls().is_empty() => {
            let mut parts = Vec::new();
            if let Some(text) = message.content.as_deref().filter(|c| !c.is_empty()) {
                parts.push(json!({ "text": text }));
            }
            for tc in message.tool_calls() {
                parts.push(json!({
                    "functionCall": { "name": tc.name, "args": tc.parsed_arguments() }
                }));
            }
            json!({ "role": "model", "parts": parts })
        }
        MessageRole::Tool => {
            let call_id = message.tool_call_id.as_deref().unwrap_or_default();
            let name = call_names
                .get(call_id)
                .copied()
                .or(Some(call_id).filter(|id| !id.is_empty()))
                .unwrap_or("unknown");
            json!({
                "role": "user",
                "parts": [{
                    "functionResponse": { "name": name, "response": response_object(message.content_str()) }
                }]
            })
        }
        MessageRole::Assistant => json!({ "role": "model", "parts": [{ "text": message.content_str() }] }),
        MessageRole::User | MessageRole::System => {
            json!({ "role": "user", "parts": [{ "text": message.content_str() }] })
        }
    }
}

/// Gemini only accepts an object as a function response.
fn response_object(content: &str) -> Value {
    match serde_json::from_str::<Value>(content) {
        Ok(value @ Value::Object(_)) => value,
        Ok(value) => json!({ "result": value }),
        Err(_) => json!({ "result": content }),
    }
}

fn synthesize_call_id() -> String {
    format!("google_{}", Uuid::new_v4().simple())
}

/// Gemini delivers each function call whole, so one line yields a start and
/// a complete delta under a locally generated id.
pub fn parse_line(line: &str) -> Vec<StreamEvent> {
    let Some(data) = data_payload(line) else {
        return Vec::new();
    };
    let Ok(json) = serde_json::from_str::<Value>(data) else {
        return Vec::new();
    };
    let Some(candidate) = json.pointer("/candidates/0") else {
        return Vec::new();
    };

    let mut events = Vec::new();

    if let Some(parts) = candidate.pointer("/content/parts").and_then(Value::as_array) {
        for part in parts {
            if let Some(text) = part.get("text").and_then(Value::as_str) {
                if !text.is_empty() {
                    events.push(StreamEvent::TextDelta(text.to_string()));
                }
            }
            if let Some(call) = part.get("functionCall") {
                let id = synthesize_call_id();
                let name = call.get("name").and_then(Value::as_str).unwrap_or_default();
                let args = call.get("args").cloned().unwrap_or_else(|| json!({}));
                events.push(StreamEvent::ToolCallStart {
                    id: id.clone(),
                    name: name.to_string(),
                });
                events.push(StreamEvent::ToolCallDelta {
                    id,
                    arguments: args.to_string(),
                });
            }
        }
    }

    if matches!(
        candidate.get("finishReason").and_then(Value::as_str),
        Some("STOP") | Some("MAX_TOKENS")
    ) {
        events.push(StreamEvent::Done);
    }

    events
}
