use crate::clients::{LLMClient, Message, StreamEvent, ToolCall};
use crate::memory::ConversationHistory;
use crate::prompts::build_system_prompt;
use crate::tools::{BrowserPage, ToolManager};
use futures::StreamExt;
use std::sync::Arc;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub const MAX_ITERATIONS: usize = 20;

/// Progress hooks for one run. All methods default to no-ops.
pub trait AgentCallbacks: Send {
    fn on_text_delta(&mut self, _text: &str) {}
    fn on_tool_call_start(&mut self, _id: &str, _name: &str) {}
    fn on_tool_call_end(&mut self, _id: &str, _name: &str, _result: &str) {}
    fn on_assistant_message(&mut self, _content: &str, _tool_calls: &[ToolCall]) {}
    fn on_tool_message(&mut self, _tool_call_id: &str, _name: &str, _result: &str) {}
    fn on_error(&mut self, _error: &str) {}
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum AgentError {
    #[error("{0}")]
    Stream(String),
    #[error("Reached maximum iterations ({0}). Stopping.")]
    MaxIterations(usize),
}

#[derive(Debug, Clone, PartialEq)]
pub enum AgentState {
    Done,
    Errored(AgentError),
    Cancelled,
}

#[derive(Debug, Clone)]
pub struct AgentOutcome {
    pub state: AgentState,
    /// Full history including the synthesized system message.
    pub messages: Vec<Message>,
    /// Number of streaming phases started.
    pub iterations: usize,
}

impl AgentOutcome {
    /// Text of the closing assistant message of a finished run.
    pub fn final_text(&self) -> Option<&str> {
        if self.state != AgentState::Done {
            return None;
        }
        self.messages
            .last()
            .and_then(|m| m.content.as_deref())
    }
}

/// Tool calls of one streaming phase, in announcement order.
#[derive(Debug, Default)]
struct TurnAccumulator {
    text: String,
    calls: Vec<ToolCall>,
    started: usize,
}

impl TurnAccumulator {
    /// Registers a call and returns the id it is tracked under. Providers that
    /// omit ids get a local `tc_<n>` id.
    fn start(&mut self, id: String, name: String) -> String {
        let id = if id.is_empty() { format!("tc_{}", self.started) } else { id };
        self.started += 1;

        match self.calls.iter_mut().find(|c| c.id == id) {
            Some(existing) => {
                existing.name = name;
                existing.arguments.clear();
            }
            None => self.calls.push(ToolCall::new(id.clone(), name, String::new())),
        }
        id
    }

    /// Deltas for an unknown id belong to the most recently started call.
    fn append(&mut self, id: &str, arguments: &str) {
        let target = match self.calls.iter().position(|c| c.id == id) {
            Some(idx) => Some(idx),
            None => self.calls.len().checked_sub(1),
        };
        match target {
            Some(idx) => self.calls[idx].arguments.push_str(arguments),
            None => debug!(id, "dropping argument delta with no started call"),
        }
    }
}

pub struct AgentLoop {
    client: Arc<dyn LLMClient>,
    tools: ToolManager,
    page: Option<Arc<dyn BrowserPage>>,
    max_iterations: usize,
}

impl AgentLoop {
    pub fn new(client: Arc<dyn LLMClient>, tools: ToolManager) -> Self {
        Self {
            client,
            tools,
            page: None,
            max_iterations: MAX_ITERATIONS,
        }
    }

    /// Page whose URL and title go into the system message.
    pub fn with_page(mut self, page: Arc<dyn BrowserPage>) -> Self {
        self.page = Some(page);
        self
    }

    pub fn with_max_iterations(mut self, max_iterations: usize) -> Self {
        self.max_iterations = max_iterations;
        self
    }

    pub async fn run(
        &self,
        prior: &[Message],
        callbacks: &mut dyn AgentCallbacks,
        cancel: CancellationToken,
    ) -> AgentOutcome {
        let page_context = match &self.page {
            Some(page) => page.context().await,
            None => None,
        };
        let definitions = self.tools.get_definitions();
        let system = Message::system(build_system_prompt(&definitions, page_context.as_ref()));
        let mut history = ConversationHistory::with_system(system, prior);
        let mut iterations = 0;

        while iterations < self.max_iterations {
            if cancel.is_cancelled() {
                return finish(AgentState::Cancelled, history, iterations);
            }
            iterations += 1;
            info!(
                iteration = iterations,
                model = self.client.model_name(),
                messages = history.messages().len(),
                "starting streaming phase"
            );

            let mut turn = TurnAccumulator::default();
            let mut stream = self
                .client
                .stream_chat(history.messages(), &definitions, cancel.clone());

            loop {
                let event = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => {
                        return finish(AgentState::Cancelled, history, iterations);
                    }
                    event = stream.next() => event,
                };

                match event {
                    Some(StreamEvent::TextDelta(text)) => {
                        callbacks.on_text_delta(&text);
                        turn.text.push_str(&text);
                    }
                    Some(StreamEvent::ToolCallStart { id, name }) => {
                        let id = turn.start(id, name.clone());
                        callbacks.on_tool_call_start(&id, &name);
                    }
                    Some(StreamEvent::ToolCallDelta { id, arguments }) => turn.append(&id, &arguments),
                    Some(StreamEvent::Error(message)) => {
                        return fail(AgentError::Stream(message), history, iterations, callbacks);
                    }
                    Some(StreamEvent::Done) | None => break,
                }
            }
            drop(stream);

            // The transport ends quietly when cancelled mid-read.
            if cancel.is_cancelled() {
                return finish(AgentState::Cancelled, history, iterations);
            }

            let TurnAccumulator { text, calls, .. } = turn;
            callbacks.on_assistant_message(&text, &calls);
            history.push(Message::assistant(text, calls.clone()));

            if calls.is_empty() {
                return finish(AgentState::Done, history, iterations);
            }

            for call in calls {
                info!(tool = %call.name, id = %call.id, "executing tool");
                let result = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => {
                        return finish(AgentState::Cancelled, history, iterations);
                    }
                    result = self.tools.execute(&call.name, &call.arguments) => result,
                };

                callbacks.on_tool_call_end(&call.id, &call.name, &result);
                callbacks.on_tool_message(&call.id, &call.name, &result);
                history.push(Message::tool(call.id, result));
            }
        }

        fail(AgentError::MaxIterations(self.max_iterations), history, iterations, callbacks)
    }
}

fn finish(state: AgentState, history: ConversationHistory, iterations: usize) -> AgentOutcome {
    info!(?state, iterations, "agent run finished");
    AgentOutcome {
        state,
        messages: history.into_messages(),
        iterations,
    }
}

fn fail(
    error: AgentError,
    history: ConversationHistory,
    iterations: usize,
    callbacks: &mut dyn AgentCallbacks,
) -> AgentOutcome {
    warn!(error = %error, iterations, "agent run failed");
    callbacks.on_error(&error.to_string());
    finish(AgentState::Errored(error), history, iterations)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clients::{
        EventStream, MessageRole, ParameterSchema, ProviderConfig, ProviderType, SseDecoder, ToolDefinition,
    };
    use crate::tools::page::fake::FakePage;
    use crate::tools::{default_tools, ToolError, ToolTrait};
    use futures::future::BoxFuture;
    use rstest::rstest;
    use serde_json::{json, Value};
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use std::time::Duration;

    /// Replays canned turns; once the script runs out the last turn repeats.
    struct ScriptedClient {
        turns: Mutex<VecDeque<Vec<StreamEvent>>>,
        last: Mutex<Vec<StreamEvent>>,
        requests: Mutex<Vec<Vec<Message>>>,
    }

    impl ScriptedClient {
        fn new(turns: Vec<Vec<StreamEvent>>) -> Arc<Self> {
            Arc::new(Self {
                turns: Mutex::new(turns.into()),
                last: Mutex::new(Vec::new()),
                requests: Mutex::new(Vec::new()),
            })
        }

        fn request_count(&self) -> usize {
            self.requests.lock().unwrap().len()
        }
    }

    impl LLMClient for ScriptedClient {
        fn stream_chat(&self, messages: &[Message], _tools: &[ToolDefinition], _cancel: CancellationToken) -> EventStream {
            self.requests.lock().unwrap().push(messages.to_vec());
            let mut last = self.last.lock().unwrap();
            if let Some(turn) = self.turns.lock().unwrap().pop_front() {
                *last = turn;
            }
            Box::pin(futures::stream::iter(last.clone()))
        }

        fn model_name(&self) -> &str {
            "scripted"
        }
    }

    #[derive(Default)]
    struct Recorder {
        log: Vec<String>,
        cancel_on_text: Option<CancellationToken>,
    }

    impl Recorder {
        fn count(&self, prefix: &str) -> usize {
            self.log.iter().filter(|e| e.starts_with(prefix)).count()
        }
    }

    impl AgentCallbacks for Recorder {
        fn on_text_delta(&mut self, text: &str) {
            self.log.push(format!("text:{}", text));
            if let Some(token) = &self.cancel_on_text {
                token.cancel();
            }
        }

        fn on_tool_call_start(&mut self, id: &str, name: &str) {
            self.log.push(format!("start:{}:{}", id, name));
        }

        fn on_tool_call_end(&mut self, id: &str, name: &str, _result: &str) {
            self.log.push(format!("end:{}:{}", id, name));
        }

        fn on_assistant_message(&mut self, content: &str, tool_calls: &[ToolCall]) {
            self.log.push(format!("assistant:{}:{}", content, tool_calls.len()));
        }

        fn on_tool_message(&mut self, tool_call_id: &str, name: &str, _result: &str) {
            self.log.push(format!("tool:{}:{}", tool_call_id, name));
        }

        fn on_error(&mut self, error: &str) {
            self.log.push(format!("error:{}", error));
        }
    }

    fn text(t: &str) -> StreamEvent {
        StreamEvent::TextDelta(t.to_string())
    }

    fn start(id: &str, name: &str) -> StreamEvent {
        StreamEvent::ToolCallStart { id: id.to_string(), name: name.to_string() }
    }

    fn delta(id: &str, arguments: &str) -> StreamEvent {
        StreamEvent::ToolCallDelta { id: id.to_string(), arguments: arguments.to_string() }
    }

    fn agent(client: &Arc<ScriptedClient>, page: &Arc<FakePage>) -> AgentLoop {
        let shared = Arc::clone(page) as Arc<dyn BrowserPage>;
        AgentLoop::new(Arc::clone(client) as Arc<dyn LLMClient>, default_tools(Arc::clone(&shared))).with_page(shared)
    }

    #[tokio::test]
    async fn test_text_only_turn_finishes_in_one_phase() {
        let client = ScriptedClient::new(vec![vec![text("Hello"), text(" world"), StreamEvent::Done]]);
        let page = Arc::new(FakePage::new("https://start.test/", "Start"));
        let mut recorder = Recorder::default();

        let outcome = agent(&client, &page)
            .run(&[Message::user("hi")], &mut recorder, CancellationToken::new())
            .await;

        assert_eq!(outcome.state, AgentState::Done);
        assert_eq!(outcome.iterations, 1);
        assert_eq!(outcome.final_text(), Some("Hello world"));
        assert_eq!(outcome.messages.len(), 3);
        assert_eq!(recorder.log, vec!["text:Hello", "text: world", "assistant:Hello world:0"]);

        let sent = &client.requests.lock().unwrap()[0];
        assert_eq!(sent[0].role, MessageRole::System);
        assert!(sent[0].content_str().contains("## Current Page\n- URL: https://start.test/\n- Title: Start"));
        assert_eq!(sent[1], Message::user("hi"));
    }

    #[tokio::test]
    async fn test_navigate_tool_round_trip() {
        let client = ScriptedClient::new(vec![
            vec![
                start("call_1", "navigate"),
                delta("call_1", "{\"url\":"),
                delta("call_1", "\"example.com\"}"),
                StreamEvent::Done,
            ],
            vec![text("Opened example.com"), StreamEvent::Done],
        ]);
        let page = Arc::new(FakePage::new("", ""));
        let mut recorder = Recorder::default();

        let outcome = agent(&client, &page)
            .run(&[Message::user("open example.com")], &mut recorder, CancellationToken::new())
            .await;

        assert_eq!(outcome.state, AgentState::Done);
        assert_eq!(outcome.iterations, 2);
        assert_eq!(page.state.lock().unwrap().navigations, vec!["https://example.com"]);

        let assistant = &outcome.messages[2];
        assert_eq!(assistant.tool_calls(), &[ToolCall::new("call_1", "navigate", "{\"url\":\"example.com\"}")]);
        assert_eq!(assistant.content, None);

        let tool = &outcome.messages[3];
        assert_eq!(tool.role, MessageRole::Tool);
        assert_eq!(tool.tool_call_id.as_deref(), Some("call_1"));
        let result: Value = serde_json::from_str(tool.content_str()).unwrap();
        assert_eq!(result, json!({"url": "https://example.com", "title": "Title of https://example.com"}));

        assert_eq!(
            recorder.log,
            vec![
                "start:call_1:navigate",
                "assistant::1",
                "end:call_1:navigate",
                "tool:call_1:navigate",
                "text:Opened example.com",
                "assistant:Opened example.com:0",
            ]
        );
        assert!(!client.requests.lock().unwrap()[0][0].content_str().contains("## Current Page"));
    }

    #[tokio::test]
    async fn test_empty_ids_get_local_ids_and_deltas_follow_last_call() {
        let client = ScriptedClient::new(vec![
            vec![
                start("", "scroll"),
                delta("", "{\"direction\":"),
                delta("", "\"down\"}"),
                start("", "getText"),
                delta("unknown", "{}"),
                StreamEvent::Done,
            ],
            vec![text("done"), StreamEvent::Done],
        ]);
        let page = Arc::new(FakePage::new("https://a.test/", "A").with_text("body"));
        let mut recorder = Recorder::default();

        let outcome = agent(&client, &page)
            .run(&[Message::user("read it")], &mut recorder, CancellationToken::new())
            .await;

        assert_eq!(
            outcome.messages[2].tool_calls(),
            &[
                ToolCall::new("tc_0", "scroll", "{\"direction\":\"down\"}"),
                ToolCall::new("tc_1", "getText", "{}"),
            ]
        );
        assert_eq!(outcome.messages[3].tool_call_id.as_deref(), Some("tc_0"));
        assert_eq!(outcome.messages[3].content_str(), "Scrolled down by 500px. Current scroll position: 500px");
        assert_eq!(outcome.messages[4].tool_call_id.as_deref(), Some("tc_1"));
        assert_eq!(recorder.count("end:"), 2);
        assert_eq!(outcome.state, AgentState::Done);
    }

    #[tokio::test]
    async fn test_anonymous_deltas_land_on_started_call() {
        let client = ScriptedClient::new(vec![
            vec![
                start("X", "navigate"),
                delta("", "{\"url\":"),
                delta("", "\"example.com\"}"),
                StreamEvent::Done,
            ],
            vec![text("ok"), StreamEvent::Done],
        ]);
        let page = Arc::new(FakePage::new("", ""));
        let mut recorder = Recorder::default();

        let outcome = agent(&client, &page)
            .run(&[Message::user("open it")], &mut recorder, CancellationToken::new())
            .await;

        assert_eq!(outcome.state, AgentState::Done);
        assert_eq!(
            outcome.messages[2].tool_calls(),
            &[ToolCall::new("X", "navigate", "{\"url\":\"example.com\"}")]
        );
        assert_eq!(outcome.messages[3].tool_call_id.as_deref(), Some("X"));
        assert_eq!(page.state.lock().unwrap().navigations, vec!["https://example.com"]);
    }

    const OPENAI_STREAM: &str = r#"data: {"choices":[{"delta":{"role":"assistant","content":"Opening"}}]}

data: {"choices":[{"delta":{"tool_calls":[{"index":0,"id":"X","type":"function","function":{"name":"navigate","arguments":""}}]}}]}

data: {"choices":[{"delta":{"tool_calls":[{"index":0,"function":{"arguments":"{\"url\":"}}]}}]}

data: {"choices":[{"delta":{"tool_calls":[{"index":0,"function":{"arguments":"\"example.com\"}"}}]}}]}

data: {"choices":[{"delta":{},"finish_reason":"tool_calls"}]}

data: [DONE]

"#;

    const ANTHROPIC_STREAM: &str = r#"event: message_start
data: {"type":"message_start","message":{"id":"msg_1","role":"assistant","content":[]}}

event: content_block_start
data: {"type":"content_block_start","index":0,"content_block":{"type":"text","text":""}}

event: content_block_delta
data: {"type":"content_block_delta","index":0,"delta":{"type":"text_delta","text":"Opening"}}

event: content_block_stop
data: {"type":"content_block_stop","index":0}

event: content_block_start
data: {"type":"content_block_start","index":1,"content_block":{"type":"tool_use","id":"X","name":"navigate","input":{}}}

event: content_block_delta
data: {"type":"content_block_delta","index":1,"delta":{"type":"input_json_delta","partial_json":"{\"url\":"}}

event: content_block_delta
data: {"type":"content_block_delta","index":1,"delta":{"type":"input_json_delta","partial_json":"\"example.com\"}"}}

event: message_delta
data: {"type":"message_delta","delta":{"stop_reason":"tool_use"}}

event: message_stop
data: {"type":"message_stop"}

"#;

    const GOOGLE_STREAM: &str = r#"data: {"candidates":[{"content":{"role":"model","parts":[{"text":"Opening"}]}}]}

data: {"candidates":[{"content":{"role":"model","parts":[{"functionCall":{"name":"navigate","args":{"url":"example.com"}}}]},"finishReason":"STOP"}]}

"#;

    fn decode(config: &ProviderConfig, stream: &str) -> Vec<StreamEvent> {
        let mut decoder = SseDecoder::new(config.family());
        let mut events = Vec::new();
        for chunk in stream.as_bytes().chunks(7) {
            events.extend(decoder.feed(chunk));
        }
        events.extend(decoder.finish());
        events
    }

    #[rstest]
    #[case(ProviderType::OpenAI, OPENAI_STREAM)]
    #[case(ProviderType::Anthropic, ANTHROPIC_STREAM)]
    #[case(ProviderType::Google, GOOGLE_STREAM)]
    #[tokio::test]
    async fn test_provider_stream_drives_tool_round_trip(#[case] provider_type: ProviderType, #[case] stream: &str) {
        let config = ProviderConfig::new(provider_type, "key", "model");
        let client = ScriptedClient::new(vec![decode(&config, stream), vec![text("Opened"), StreamEvent::Done]]);
        let page = Arc::new(FakePage::new("", ""));
        let mut recorder = Recorder::default();

        let outcome = agent(&client, &page)
            .run(&[Message::user("open example.com")], &mut recorder, CancellationToken::new())
            .await;

        assert_eq!(outcome.state, AgentState::Done);
        assert_eq!(outcome.final_text(), Some("Opened"));
        assert_eq!(page.state.lock().unwrap().navigations, vec!["https://example.com"]);

        let assistant = &outcome.messages[2];
        assert_eq!(assistant.content.as_deref(), Some("Opening"));
        let [call] = assistant.tool_calls() else {
            panic!("expected one tool call, got {:?}", assistant.tool_calls());
        };
        assert_eq!(call.name, "navigate");
        assert_eq!(call.arguments, "{\"url\":\"example.com\"}");
        match provider_type {
            ProviderType::Google => assert!(call.id.starts_with("google_")),
            _ => assert_eq!(call.id, "X"),
        }
        assert_eq!(outcome.messages[3].tool_call_id.as_deref(), Some(call.id.as_str()));

        // The finished history must encode back into the same provider's format.
        let body = config.family().build_request(&config, &outcome.messages, &[]).body;
        match provider_type {
            ProviderType::OpenAI => {
                assert_eq!(body.pointer("/messages/2/content"), Some(&json!("Opening")));
                assert_eq!(body.pointer("/messages/2/tool_calls/0/id"), Some(&json!("X")));
                assert_eq!(
                    body.pointer("/messages/2/tool_calls/0/function/arguments"),
                    Some(&json!("{\"url\":\"example.com\"}"))
                );
                assert_eq!(body.pointer("/messages/3/tool_call_id"), Some(&json!("X")));
            }
            ProviderType::Anthropic => {
                assert_eq!(body.pointer("/messages/1/content/0/text"), Some(&json!("Opening")));
                assert_eq!(body.pointer("/messages/1/content/1/id"), Some(&json!("X")));
                assert_eq!(body.pointer("/messages/1/content/1/input"), Some(&json!({"url": "example.com"})));
                assert_eq!(body.pointer("/messages/2/content/0/tool_use_id"), Some(&json!("X")));
            }
            _ => {
                assert_eq!(body.pointer("/contents/1/parts/0/text"), Some(&json!("Opening")));
                assert_eq!(
                    body.pointer("/contents/1/parts/1/functionCall/args"),
                    Some(&json!({"url": "example.com"}))
                );
                assert_eq!(body.pointer("/contents/2/parts/0/functionResponse/name"), Some(&json!("navigate")));
                assert_eq!(
                    body.pointer("/contents/2/parts/0/functionResponse/response/url"),
                    Some(&json!("https://example.com"))
                );
            }
        }
    }

    #[tokio::test]
    async fn test_stops_after_max_iterations() {
        let client = ScriptedClient::new(vec![vec![start("c", "scroll"), delta("c", "{}"), StreamEvent::Done]]);
        let page = Arc::new(FakePage::new("", ""));
        let mut recorder = Recorder::default();

        let outcome = agent(&client, &page)
            .run(&[Message::user("loop forever")], &mut recorder, CancellationToken::new())
            .await;

        assert_eq!(outcome.state, AgentState::Errored(AgentError::MaxIterations(MAX_ITERATIONS)));
        assert_eq!(outcome.iterations, 20);
        assert_eq!(client.request_count(), 20);
        assert_eq!(outcome.messages.len(), 2 + 20 * 2);
        assert_eq!(recorder.count("error:"), 1);
        assert_eq!(recorder.log.last().unwrap(), "error:Reached maximum iterations (20). Stopping.");
    }

    #[tokio::test]
    async fn test_custom_iteration_cap() {
        let client = ScriptedClient::new(vec![vec![start("c", "scroll"), delta("c", "{}"), StreamEvent::Done]]);
        let page = Arc::new(FakePage::new("", ""));
        let mut recorder = Recorder::default();

        let outcome = agent(&client, &page)
            .with_max_iterations(3)
            .run(&[Message::user("loop")], &mut recorder, CancellationToken::new())
            .await;

        assert_eq!(outcome.state, AgentState::Errored(AgentError::MaxIterations(3)));
        assert_eq!(client.request_count(), 3);
        assert_eq!(page.state.lock().unwrap().scroll_y, 1500);
    }

    #[tokio::test]
    async fn test_stream_error_ends_run() {
        let client = ScriptedClient::new(vec![vec![text("partial"), StreamEvent::Error("HTTP 500: boom".to_string())]]);
        let page = Arc::new(FakePage::new("", ""));
        let mut recorder = Recorder::default();

        let outcome = agent(&client, &page)
            .run(&[Message::user("hi")], &mut recorder, CancellationToken::new())
            .await;

        assert_eq!(outcome.state, AgentState::Errored(AgentError::Stream("HTTP 500: boom".to_string())));
        assert_eq!(outcome.messages.len(), 2);
        assert_eq!(recorder.log, vec!["text:partial", "error:HTTP 500: boom"]);
        assert_eq!(outcome.final_text(), None);
    }

    #[tokio::test]
    async fn test_cancel_mid_stream_stops_callbacks() {
        let client = ScriptedClient::new(vec![vec![
            text("Hel"),
            text("lo"),
            start("c1", "scroll"),
            delta("c1", "{}"),
            StreamEvent::Done,
        ]]);
        let page = Arc::new(FakePage::new("", ""));
        let cancel = CancellationToken::new();
        let mut recorder = Recorder {
            cancel_on_text: Some(cancel.clone()),
            ..Recorder::default()
        };

        let outcome = agent(&client, &page)
            .run(&[Message::user("hi")], &mut recorder, cancel)
            .await;

        assert_eq!(outcome.state, AgentState::Cancelled);
        assert_eq!(recorder.log, vec!["text:Hel"]);
        assert_eq!(page.state.lock().unwrap().scroll_y, 0);
    }

    #[tokio::test]
    async fn test_cancelled_before_start_sends_nothing() {
        let client = ScriptedClient::new(vec![vec![text("never"), StreamEvent::Done]]);
        let page = Arc::new(FakePage::new("", ""));
        let cancel = CancellationToken::new();
        cancel.cancel();
        let mut recorder = Recorder::default();

        let outcome = agent(&client, &page).run(&[Message::user("hi")], &mut recorder, cancel).await;

        assert_eq!(outcome.state, AgentState::Cancelled);
        assert_eq!(outcome.iterations, 0);
        assert_eq!(client.request_count(), 0);
        assert!(recorder.log.is_empty());
    }

    struct HangingTool;

    impl ToolTrait for HangingTool {
        fn definition(&self) -> ToolDefinition {
            ToolDefinition {
                name: "hang".to_string(),
                description: "Never finishes".to_string(),
                parameters: ParameterSchema::default(),
            }
        }

        fn execute(&self, _arguments: Value) -> BoxFuture<'static, Result<String, ToolError>> {
            Box::pin(futures::future::pending())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_during_tool_execution() {
        let client = ScriptedClient::new(vec![vec![start("h1", "hang"), StreamEvent::Done]]);
        let mut tools = ToolManager::new();
        tools.register(Box::new(HangingTool));
        let agent = AgentLoop::new(Arc::clone(&client) as Arc<dyn LLMClient>, tools);

        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            trigger.cancel();
        });

        let mut recorder = Recorder::default();
        let outcome = agent.run(&[Message::user("hang")], &mut recorder, cancel).await;

        assert_eq!(outcome.state, AgentState::Cancelled);
        assert_eq!(recorder.log, vec!["start:h1:hang", "assistant::1"]);
        assert_eq!(outcome.messages.len(), 3);
    }

    #[test]
    fn test_accumulator_restart_replaces_arguments() {
        let mut turn = TurnAccumulator::default();
        assert_eq!(turn.start("a".to_string(), "click".to_string()), "a");
        turn.append("a", "{\"selector\":\"#x\"}");
        turn.append("nobody", "");
        turn.start("a".to_string(), "type".to_string());
        turn.append("a", "{}");

        assert_eq!(turn.calls, vec![ToolCall::new("a", "type", "{}")]);

        let mut empty = TurnAccumulator::default();
        empty.append("x", "{}");
        assert!(empty.calls.is_empty());
    }
}
