pub mod clients;
pub mod core;
pub mod memory;
pub mod prompts;
pub mod settings;
pub mod tools;

pub use clients::{
    create_llm_client, LLMClient, LLMError, Message, MessageRole, ProviderConfig, ProviderType,
    StreamEvent, ToolCall, ToolDefinition,
};
pub use crate::core::{AgentCallbacks, AgentError, AgentLoop, AgentOutcome, AgentState, MAX_ITERATIONS};
pub use memory::{Conversation, ConversationHistory, TranscriptError, TranscriptStore};
pub use prompts::build_system_prompt;
pub use settings::{load_settings, Settings, SettingsError};
pub use tools::{default_tools, BrowserPage, HttpPage, ToolManager, ToolTrait};
