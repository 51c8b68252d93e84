pub mod anthropic;
pub mod google;
pub mod openai;
pub mod transport;

use futures::Stream;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use serde_with::skip_serializing_none;
use std::collections::BTreeMap;
use std::fmt;
use std::pin::Pin;
use std::str::FromStr;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::warn;

pub use transport::{ProviderClient, SseDecoder};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ProviderType {
    #[serde(rename = "openai")]
    OpenAI,
    #[serde(rename = "anthropic")]
    Anthropic,
    #[serde(rename = "google")]
    Google,
    #[serde(rename = "openrouter")]
    OpenRouter,
    #[serde(rename = "deepseek")]
    DeepSeek,
    #[serde(rename = "qwen")]
    Qwen,
    #[serde(rename = "kimi")]
    Kimi,
    #[serde(rename = "glm")]
    Glm,
    #[serde(rename = "minimax")]
    Minimax,
    #[serde(rename = "openai-compatible")]
    OpenAICompatible,
}

impl ProviderType {
    pub const ALL: [ProviderType; 10] = [
        ProviderType::OpenAI,
        ProviderType::Anthropic,
        ProviderType::Google,
        ProviderType::OpenRouter,
        ProviderType::DeepSeek,
        ProviderType::Qwen,
        ProviderType::Kimi,
        ProviderType::Glm,
        ProviderType::Minimax,
        ProviderType::OpenAICompatible,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderType::OpenAI => "openai",
            ProviderType::Anthropic => "anthropic",
            ProviderType::Google => "google",
            ProviderType::OpenRouter => "openrouter",
            ProviderType::DeepSeek => "deepseek",
            ProviderType::Qwen => "qwen",
            ProviderType::Kimi => "kimi",
            ProviderType::Glm => "glm",
            ProviderType::Minimax => "minimax",
            ProviderType::OpenAICompatible => "openai-compatible",
        }
    }

    /// Wire-protocol family spoken by this provider. Anything that is not
    /// Anthropic or Google speaks the OpenAI chat-completions dialect.
    pub fn family(&self) -> ProviderFamily {
        match self {
            ProviderType::Anthropic => ProviderFamily::Anthropic,
            ProviderType::Google => ProviderFamily::Google,
            _ => ProviderFamily::OpenAI,
        }
    }

    pub fn default_base_url(&self) -> &'static str {
        match self {
            ProviderType::OpenAI => "https://api.openai.com/v1",
            ProviderType::Anthropic => "https://api.anthropic.com",
            ProviderType::Google => "https://generativelanguage.googleapis.com/v1beta",
            ProviderType::OpenRouter => "https://openrouter.ai/api/v1",
            ProviderType::DeepSeek => "https://api.deepseek.com/v1",
            ProviderType::Qwen => "https://dashscope.aliyuncs.com/compatible-mode/v1",
            ProviderType::Kimi => "https://api.moonshot.cn/v1",
            ProviderType::Glm => "https://open.bigmodel.cn/api/paas/v4",
            ProviderType::Minimax => "https://api.minimax.chat/v1",
            ProviderType::OpenAICompatible => "http://localhost:11434/v1",
        }
    }
}

impl fmt::Display for ProviderType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProviderType {
    type Err = LLMError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let needle = s.trim().to_ascii_lowercase();
        ProviderType::ALL
            .into_iter()
            .find(|t| t.as_str() == needle)
            .ok_or_else(|| LLMError::ConfigError(format!("Unknown provider: {}", s)))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderFamily {
    OpenAI,
    Anthropic,
    Google,
}

impl ProviderFamily {
    pub fn build_request(
        &self,
        config: &ProviderConfig,
        messages: &[Message],
        tools: &[ToolDefinition],
    ) -> PreparedRequest {
        match self {
            ProviderFamily::OpenAI => openai::build_request(config, messages, tools),
            ProviderFamily::Anthropic => anthropic::build_request(config, messages, tools),
            ProviderFamily::Google => google::build_request(config, messages, tools),
        }
    }

    /// Parses one `data:` line. Most lines produce nothing; malformed ones
    /// always produce nothing.
    pub fn parse_line(&self, line: &str, event_type: Option<&str>) -> Vec<StreamEvent> {
        match self {
            ProviderFamily::OpenAI => openai::parse_line(line),
            ProviderFamily::Anthropic => anthropic::parse_line(line, event_type),
            ProviderFamily::Google => google::parse_line(line),
        }
    }
}

#[skip_serializing_none]
#[derive(Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderConfig {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(rename = "type")]
    pub provider_type: ProviderType,
    #[serde(default)]
    pub api_key: String,
    #[serde(default)]
    pub base_url: Option<String>,
    pub model_id: String,
}

impl ProviderConfig {
    pub fn new(provider_type: ProviderType, api_key: impl Into<String>, model_id: impl Into<String>) -> Self {
        Self {
            id: provider_type.as_str().to_string(),
            name: provider_type.as_str().to_string(),
            provider_type,
            api_key: api_key.into(),
            base_url: None,
            model_id: model_id.into(),
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = Some(base_url.into());
        self
    }

    pub fn family(&self) -> ProviderFamily {
        self.provider_type.family()
    }

    /// Configured override, or the provider default, without trailing slashes.
    pub fn resolved_base_url(&self) -> String {
        let base = match self.base_url.as_deref() {
            Some(url) if !url.trim().is_empty() => url.trim(),
            _ => self.provider_type.default_base_url(),
        };
        base.trim_end_matches('/').to_string()
    }
}

impl fmt::Debug for ProviderConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProviderConfig")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("provider_type", &self.provider_type)
            .field("api_key", &if self.api_key.is_empty() { "" } else { "<redacted>" })
            .field("base_url", &self.base_url)
            .field("model_id", &self.model_id)
            .finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    System,
    User,
    Assistant,
    Tool,
}

#[skip_serializing_none]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: MessageRole,
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default)]
    pub tool_calls: Option<Vec<ToolCall>>,
    #[serde(default)]
    pub tool_call_id: Option<String>,
}

impl Message {
    pub fn system(content: impl Into<String>) -> Self {
        Self::text(MessageRole::System, content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::text(MessageRole::User, content)
    }

    /// Empty text is dropped; an empty call list is dropped.
    pub fn assistant(content: impl Into<String>, tool_calls: Vec<ToolCall>) -> Self {
        let content = content.into();
        Self {
            role: MessageRole::Assistant,
            content: (!content.is_empty()).then_some(content),
            tool_calls: (!tool_calls.is_empty()).then_some(tool_calls),
            tool_call_id: None,
        }
    }

    pub fn tool(tool_call_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::Tool,
            content: Some(content.into()),
            tool_calls: None,
            tool_call_id: Some(tool_call_id.into()),
        }
    }

    fn text(role: MessageRole, content: impl Into<String>) -> Self {
        Self {
            role,
            content: Some(content.into()),
            tool_calls: None,
            tool_call_id: None,
        }
    }

    pub fn content_str(&self) -> &str {
        self.content.as_deref().unwrap_or("")
    }

    pub fn tool_calls(&self) -> &[ToolCall] {
        self.tool_calls.as_deref().unwrap_or(&[])
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    /// Raw argument text as streamed; only parsed at execution time.
    pub arguments: String,
}

impl ToolCall {
    pub fn new(id: impl Into<String>, name: impl Into<String>, arguments: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            arguments: arguments.into(),
        }
    }

    /// Arguments as JSON, `{}` when the text is empty or not valid JSON.
    pub fn parsed_arguments(&self) -> Value {
        serde_json::from_str(&self.arguments).unwrap_or_else(|_| serde_json::json!({}))
    }
}

#[skip_serializing_none]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolParameter {
    #[serde(rename = "type")]
    pub param_type: String,
    pub description: Option<String>,
    #[serde(rename = "enum")]
    pub enum_values: Option<Vec<String>>,
}

impl ToolParameter {
    pub fn string(description: impl Into<String>) -> Self {
        Self {
            param_type: "string".to_string(),
            description: Some(description.into()),
            enum_values: None,
        }
    }

    pub fn with_enum(mut self, values: &[&str]) -> Self {
        self.enum_values = Some(values.iter().map(|v| v.to_string()).collect());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParameterSchema {
    #[serde(rename = "type")]
    pub schema_type: String,
    #[serde(default)]
    pub properties: BTreeMap<String, ToolParameter>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub required: Vec<String>,
}

impl Default for ParameterSchema {
    fn default() -> Self {
        Self {
            schema_type: "object".to_string(),
            properties: BTreeMap::new(),
            required: Vec::new(),
        }
    }
}

impl ParameterSchema {
    pub fn param(mut self, name: &str, parameter: ToolParameter, required: bool) -> Self {
        self.properties.insert(name.to_string(), parameter);
        if required {
            self.required.push(name.to_string());
        }
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    pub parameters: ParameterSchema,
}

#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    TextDelta(String),
    ToolCallStart { id: String, name: String },
    ToolCallDelta { id: String, arguments: String },
    Done,
    Error(String),
}

impl StreamEvent {
    pub fn is_terminal(&self) -> bool {
        matches!(self, StreamEvent::Done | StreamEvent::Error(_))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PreparedRequest {
    pub url: String,
    pub headers: Vec<(&'static str, String)>,
    pub body: Value,
}

#[derive(Debug, Error)]
pub enum LLMError {
    #[error("Request failed: {0}")]
    RequestFailed(String),
    #[error("HTTP {status}: {body}")]
    ApiError { status: u16, body: String },
    #[error("Stream read error: {0}")]
    StreamError(String),
    #[error("Configuration error: {0}")]
    ConfigError(String),
}

pub type EventStream = Pin<Box<dyn Stream<Item = StreamEvent> + Send>>;

/// A provider-bound chat endpoint. The returned stream is lazy: nothing is
/// sent until it is first polled, and dropping it releases the connection.
pub trait LLMClient: Send + Sync {
    fn stream_chat(
        &self,
        messages: &[Message],
        tools: &[ToolDefinition],
        cancel: CancellationToken,
    ) -> EventStream;

    fn model_name(&self) -> &str;
}

/// The first system message and the remaining turns. Extra system messages
/// are dropped.
pub(crate) fn split_system(messages: &[Message]) -> (Option<&Message>, Vec<&Message>) {
    let mut system = None;
    let mut rest = Vec::with_capacity(messages.len());
    for message in messages {
        if message.role == MessageRole::System {
            if system.is_none() {
                system = Some(message);
            } else {
                warn!("ignoring extra system message");
            }
        } else {
            rest.push(message);
        }
    }
    (system, rest)
}

/// Payload of an SSE `data:` line, with or without the space after the colon.
pub(crate) fn data_payload(line: &str) -> Option<&str> {
    let rest = line.trim().strip_prefix("data:")?;
    Some(rest.trim())
}

pub fn create_llm_client(config: ProviderConfig) -> Box<dyn LLMClient> {
    Box::new(ProviderClient::new(config))
}
