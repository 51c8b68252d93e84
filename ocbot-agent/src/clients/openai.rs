use super::{
    data_payload, split_system, Message, MessageRole, PreparedRequest, ProviderConfig, StreamEvent,
    ToolDefinition,
};
use serde_json::{json, Value};

pub fn build_request(
    config: &ProviderConfig,
    messages: &[Message],
    tools: &[ToolDefinition],
) -> PreparedRequest {
    let (system, turns) = split_system(messages);

    let mut messages_json = Vec::with_capacity(turns.len() + 1);
    if let Some(system) = system {
        messages_json.push(json!({ "role": "system", "content": system.content_str() }));
    }
    messages_json.extend(turns.into_iter().map(convert_message));

    let mut body = json!({
        "model": config.model_id,
        "messages": messages_json,
        "stream": true,
    });

    if !tools.is_empty() {
        let tools_json: Vec<Value> = tools
            .iter()
            .map(|t| {
                json!({
                    "type": "function",
                    "function": {
                        "name": t.name,
                        "description": t.description,
                        "parameters": t.parameters
                    }
                })
            })
            .collect();
        body["tools"] = Value::Array(tools_json);
    }

    let mut headers = vec![("Content-Type", "application/json".to_string())];
    if !config.api_key.is_empty() {
        headers.push(("Authorization", format!("Bearer {}", config.api_key)));
    }

    PreparedRequest {
        url: format!("{}/chat/completions", config.resolved_base_url()),
        headers,
        body,
    }
}

fn convert_message(message: &Message) -> Value {
    match message.role {
        MessageRole::Assistant if !message.tool_calls().is_empty() => {
            let tool_calls: Vec<Value> = message
                .tool_calls()
                .iter()
                .map(|tc| {
                    json!({
                        "id": tc.id,
                        "type": "function",
                        "function": { "name": tc.name, "arguments": tc.arguments }
                    })
                })
                .collect();
            json!({
                "role": "assistant",
                "content": message.content.as_deref().filter(|c| !c.is_empty()),
                "tool_calls": tool_calls,
            })
        }
        MessageRole::Tool => json!({
            "role": "tool",
            "tool_call_id": message.tool_call_id.as_deref().unwrap_or_default(),
            "content": message.content_str(),
        }),
        MessageRole::Assistant => json!({ "role": "assistant", "content": message.content_str() }),
        MessageRole::User => json!({ "role": "user", "content": message.content_str() }),
        MessageRole::System => json!({ "role": "system", "content": message.content_str() }),
    }
}

pub fn parse_line(line: &str) -> Vec<StreamEvent> {
    let Some(data) = data_payload(line) else {
        return Vec::new();
    };
    if data == "[DONE]" {
        return vec![StreamEvent::Done];
    }

    let Ok(json) = serde_json::from_str::<Value>(data) else {
        return Vec::new();
    };
    let Some(delta) = json.pointer("/choices/0/delta") else {
        return Vec::new();
    };

    let mut events = Vec::new();

    if let Some(tool_calls) = delta.get("tool_calls").and_then(Value::as_array) {
        for tc in tool_calls {
            // Continuation chunks usually omit the id.
            let id = tc.get("id").and_then(Value::as_str).unwrap_or_default();
            let function = tc.get("function");

            if let Some(name) = function.and_then(|f| f.get("name")).and_then(Value::as_str) {
                if !name.is_empty() {
                    events.push(StreamEvent::ToolCallStart {
                        id: id.to_string(),
                        name: name.to_string(),
                    });
                }
            }
            if let Some(args) = function.and_then(|f| f.get("arguments")).and_then(Value::as_str) {
                if !args.is_empty() {
                    events.push(StreamEvent::ToolCallDelta {
                        id: id.to_string(),
                        arguments: args.to_string(),
                    });
                }
            }
        }
    }

    if let Some(content) = delta.get("content").and_then(Value::as_str) {
        if !content.is_empty() {
            events.push(StreamEvent::TextDelta(content.to_string()));
        }
    }

    events
}
