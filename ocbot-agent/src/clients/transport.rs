use super::{
    EventStream, LLMClient, LLMError, Message, ProviderConfig, ProviderFamily, StreamEvent,
    ToolDefinition,
};
use futures::{Stream, StreamExt};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

const ERROR_BODY_LIMIT: usize = 200;
const REQUEST_TIMEOUT: Duration = Duration::from_secs(600);

/// Incremental SSE line decoder. Bytes are buffered until a full line is
/// available, so a line split across network chunks decodes the same as an
/// unsplit one.
#[derive(Debug)]
pub struct SseDecoder {
    family: ProviderFamily,
    buffer: Vec<u8>,
    event_type: Option<String>,
}

impl SseDecoder {
    pub fn new(family: ProviderFamily) -> Self {
        Self {
            family,
            buffer: Vec::new(),
            event_type: None,
        }
    }

    pub fn feed(&mut self, chunk: &[u8]) -> Vec<StreamEvent> {
        // The carried-over tail holds no newline, so only new bytes are scanned.
        let scan_from = self.buffer.len();
        let mut pending = std::mem::take(&mut self.buffer);
        pending.extend_from_slice(chunk);

        let mut events = Vec::new();
        let mut line_start = 0;
        for (idx, byte) in pending.iter().enumerate().skip(scan_from) {
            if *byte == b'\n' {
                self.process_line(&String::from_utf8_lossy(&pending[line_start..=idx]), &mut events);
                line_start = idx + 1;
            }
        }

        pending.drain(..line_start);
        self.buffer = pending;
        events
    }

    /// Flushes whatever is left once the body has ended.
    pub fn finish(&mut self) -> Vec<StreamEvent> {
        let rest = std::mem::take(&mut self.buffer);
        let mut events = Vec::new();
        let line = String::from_utf8_lossy(&rest);
        if !line.trim().is_empty() {
            self.process_line(&line, &mut events);
        }
        events
    }

    fn process_line(&mut self, line: &str, events: &mut Vec<StreamEvent>) {
        let line = line.trim();
        if line.is_empty() {
            self.event_type = None;
            return;
        }
        if let Some(event_type) = line.strip_prefix("event:") {
            self.event_type = Some(event_type.trim().to_string());
            return;
        }
        if line.starts_with("data:") {
            events.extend(self.family.parse_line(line, self.event_type.as_deref()));
        }
    }
}

pub struct ProviderClient {
    config: ProviderConfig,
    client: reqwest::Client,
}

impl ProviderClient {
    pub fn new(config: ProviderConfig) -> Self {
        Self::with_http_client(config, reqwest::Client::new())
    }

    pub fn with_http_client(config: ProviderConfig, client: reqwest::Client) -> Self {
        Self { config, client }
    }
}

impl LLMClient for ProviderClient {
    fn stream_chat(
        &self,
        messages: &[Message],
        tools: &[ToolDefinition],
        cancel: CancellationToken,
    ) -> EventStream {
        let family = self.config.family();
        let request = family.build_request(&self.config, messages, tools);

        debug!(
            provider = %self.config.provider_type,
            model = %self.config.model_id,
            messages = messages.len(),
            tools = tools.len(),
            "opening chat stream"
        );

        let mut builder = self
            .client
            .post(&request.url)
            .timeout(REQUEST_TIMEOUT)
            .header("Accept", "text/event-stream");
        for (name, value) in &request.headers {
            builder = builder.header(*name, value);
        }
        let builder = builder.json(&request.body);

        Box::pin(stream_events(builder, family, cancel))
    }

    fn model_name(&self) -> &str {
        &self.config.model_id
    }
}

/// Dropping the returned stream drops the response and closes the connection,
/// whichever exit path is taken.
fn stream_events(
    builder: reqwest::RequestBuilder,
    family: ProviderFamily,
    cancel: CancellationToken,
) -> impl Stream<Item = StreamEvent> + Send {
    async_stream::stream! {
        let sent = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                debug!("chat stream cancelled before response");
                return;
            }
            sent = builder.send() => sent,
        };

        let response = match sent {
            Ok(response) => response,
            Err(e) => {
                warn!(error = %e, "chat request failed");
                yield StreamEvent::Error(LLMError::RequestFailed(e.to_string()).to_string());
                return;
            }
        };

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            warn!(status = status.as_u16(), "provider returned error status");
            let error = LLMError::ApiError {
                status: status.as_u16(),
                body: body.chars().take(ERROR_BODY_LIMIT).collect(),
            };
            yield StreamEvent::Error(error.to_string());
            return;
        }

        let mut decoder = SseDecoder::new(family);
        let body = response.bytes_stream();
        tokio::pin!(body);

        loop {
            let chunk = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    debug!("chat stream cancelled");
                    return;
                }
                chunk = body.next() => chunk,
            };

            let (events, finished) = match chunk {
                Some(Ok(bytes)) => (decoder.feed(&bytes), false),
                Some(Err(e)) => {
                    warn!(error = %e, "chat stream read failed");
                    yield StreamEvent::Error(LLMError::StreamError(e.to_string()).to_string());
                    return;
                }
                None => (decoder.finish(), true),
            };

            for event in events {
                let terminal = event.is_terminal();
                yield event;
                if terminal {
                    return;
                }
            }

            if finished {
                debug!("chat stream ended without terminal event");
                break;
            }
        }
    }
}
