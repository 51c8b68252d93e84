pub mod http_page;
pub mod page;

use crate::clients::{ParameterSchema, ToolDefinition, ToolParameter};
use futures::future::BoxFuture;
use serde::Serialize;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

pub use http_page::HttpPage;
pub use page::{BrowserPage, ElementInfo, LoadState, PageContext, PageError};

pub const NAVIGATION_TIMEOUT: Duration = Duration::from_secs(10);
pub const PAGE_TEXT_LIMIT: usize = 5_000;
pub const ELEMENT_TEXT_LIMIT: usize = 100;
pub const DEFAULT_ELEMENT_LIMIT: usize = 10;
pub const DEFAULT_WAIT_MS: u64 = 5_000;
pub const SCROLL_STEP: i64 = 500;

const REPORTED_ATTRIBUTES: [&str; 10] = [
    "id",
    "class",
    "href",
    "src",
    "type",
    "name",
    "value",
    "placeholder",
    "aria-label",
    "role",
];

#[derive(Debug, Error)]
pub enum ToolError {
    #[error("{0}")]
    InvalidArguments(String),
    #[error(transparent)]
    Page(#[from] PageError),
}

pub trait ToolTrait: Send + Sync {
    fn definition(&self) -> ToolDefinition;
    fn execute(&self, arguments: Value) -> BoxFuture<'static, Result<String, ToolError>>;
}

fn required_str<'a>(arguments: &'a Value, key: &str) -> Result<&'a str, ToolError> {
    arguments
        .get(key)
        .and_then(Value::as_str)
        .ok_or_else(|| ToolError::InvalidArguments(format!("Missing '{}' argument", key)))
}

/// Accepts `true` or `"true"`; models are told flags are strings.
fn flag(arguments: &Value, key: &str) -> bool {
    match arguments.get(key) {
        Some(Value::Bool(b)) => *b,
        Some(Value::String(s)) => s.eq_ignore_ascii_case("true"),
        _ => false,
    }
}

/// A positive integer given as a number or numeric string.
fn positive_number(arguments: &Value, key: &str) -> Option<u64> {
    let n = match arguments.get(key)? {
        Value::Number(n) => n.as_u64().or_else(|| n.as_f64().map(|f| f as u64)),
        Value::String(s) => s.trim().parse::<u64>().ok(),
        _ => None,
    }?;
    (n > 0).then_some(n)
}

pub fn truncate_chars(text: &str, limit: usize) -> String {
    match text.char_indices().nth(limit) {
        Some((idx, _)) => text[..idx].to_string(),
        None => text.to_string(),
    }
}

/// Prefixes `https://` unless an http(s) scheme is already present.
pub fn normalize_url(url: &str) -> String {
    let url = url.trim();
    let lower = url.to_ascii_lowercase();
    if lower.starts_with("http://") || lower.starts_with("https://") {
        url.to_string()
    } else {
        format!("https://{}", url)
    }
}

fn not_found(selector: &str) -> String {
    format!("Error: No element found for selector \"{}\"", selector)
}

pub struct NavigateTool {
    page: Arc<dyn BrowserPage>,
}

impl NavigateTool {
    pub fn new(page: Arc<dyn BrowserPage>) -> Self {
        Self { page }
    }
}

impl ToolTrait for NavigateTool {
    fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: "navigate".to_string(),
            description: "Navigate the current tab to a URL".to_string(),
            parameters: ParameterSchema::default().param(
                "url",
                ToolParameter::string("The URL to navigate to"),
                true,
            ),
        }
    }

    fn execute(&self, arguments: Value) -> BoxFuture<'static, Result<String, ToolError>> {
        let page = Arc::clone(&self.page);
        Box::pin(async move {
            let url = normalize_url(required_str(&arguments, "url")?);
            page.navigate(&url).await?;

            if tokio::time::timeout(NAVIGATION_TIMEOUT, page.wait_for_load()).await.is_err() {
                debug!(url = %url, "navigation wait timed out");
            }

            let context = page.context().await.unwrap_or(PageContext {
                url,
                title: String::new(),
            });
            Ok(json!({ "url": context.url, "title": context.title }).to_string())
        })
    }
}

pub struct ClickTool {
    page: Arc<dyn BrowserPage>,
}

impl ClickTool {
    pub fn new(page: Arc<dyn BrowserPage>) -> Self {
        Self { page }
    }
}

impl ToolTrait for ClickTool {
    fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: "click".to_string(),
            description: "Click an element on the page by CSS selector".to_string(),
            parameters: ParameterSchema::default().param(
                "selector",
                ToolParameter::string("CSS selector of the element to click"),
                true,
            ),
        }
    }

    fn execute(&self, arguments: Value) -> BoxFuture<'static, Result<String, ToolError>> {
        let page = Arc::clone(&self.page);
        Box::pin(async move {
            let selector = required_str(&arguments, "selector")?;
            if page.click(selector).await? {
                Ok(format!("Clicked element: {}", selector))
            } else {
                Ok(not_found(selector))
            }
        })
    }
}

pub struct TypeTool {
    page: Arc<dyn BrowserPage>,
}

impl TypeTool {
    pub fn new(page: Arc<dyn BrowserPage>) -> Self {
        Self { page }
    }
}

impl ToolTrait for TypeTool {
    fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: "type".to_string(),
            description: "Type text into an input element".to_string(),
            parameters: ParameterSchema::default()
                .param("selector", ToolParameter::string("CSS selector of the input element"), true)
                .param("text", ToolParameter::string("The text to type"), true)
                .param(
                    "pressEnter",
                    ToolParameter::string("Whether to press Enter after typing (true/false)")
                        .with_enum(&["true", "false"]),
                    false,
                ),
        }
    }

    fn execute(&self, arguments: Value) -> BoxFuture<'static, Result<String, ToolError>> {
        let page = Arc::clone(&self.page);
        Box::pin(async move {
            let selector = required_str(&arguments, "selector")?;
            let text = required_str(&arguments, "text")?;
            let press_enter = flag(&arguments, "pressEnter");

            if !page.type_text(selector, text, press_enter).await? {
                return Ok(not_found(selector));
            }
            Ok(format!(
                "Typed \"{}\" into {}{}",
                text,
                selector,
                if press_enter { " and pressed Enter" } else { "" }
            ))
        })
    }
}

pub struct ScrollTool {
    page: Arc<dyn BrowserPage>,
}

impl ScrollTool {
    pub fn new(page: Arc<dyn BrowserPage>) -> Self {
        Self { page }
    }
}

impl ToolTrait for ScrollTool {
    fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: "scroll".to_string(),
            description: "Scroll the page up or down".to_string(),
            parameters: ParameterSchema::default().param(
                "direction",
                ToolParameter::string("Direction to scroll").with_enum(&["up", "down"]),
                true,
            ),
        }
    }

    fn execute(&self, arguments: Value) -> BoxFuture<'static, Result<String, ToolError>> {
        let page = Arc::clone(&self.page);
        Box::pin(async move {
            let direction = arguments
                .get("direction")
                .and_then(Value::as_str)
                .unwrap_or("down");
            let delta = if direction.eq_ignore_ascii_case("up") { -SCROLL_STEP } else { SCROLL_STEP };
            let position = page.scroll_by(delta).await?;
            Ok(format!(
                "Scrolled {} by {}px. Current scroll position: {}px",
                direction, SCROLL_STEP, position
            ))
        })
    }
}

pub struct GetTextTool {
    page: Arc<dyn BrowserPage>,
}

impl GetTextTool {
    pub fn new(page: Arc<dyn BrowserPage>) -> Self {
        Self { page }
    }
}

impl ToolTrait for GetTextTool {
    fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: "getText".to_string(),
            description: "Get the current page URL, title, and visible text content".to_string(),
            parameters: ParameterSchema::default(),
        }
    }

    fn execute(&self, _arguments: Value) -> BoxFuture<'static, Result<String, ToolError>> {
        let page = Arc::clone(&self.page);
        Box::pin(async move {
            let context = page.context().await.ok_or(PageError::NoActivePage)?;
            let text = page.inner_text().await?;
            Ok(json!({
                "url": context.url,
                "title": context.title,
                "text": truncate_chars(&text, PAGE_TEXT_LIMIT),
            })
            .to_string())
        })
    }
}

#[derive(Debug, Serialize)]
struct ElementSummary {
    index: usize,
    tag: String,
    text: String,
    attrs: BTreeMap<String, String>,
}

pub struct GetElementsTool {
    page: Arc<dyn BrowserPage>,
}

impl GetElementsTool {
    pub fn new(page: Arc<dyn BrowserPage>) -> Self {
        Self { page }
    }
}

impl ToolTrait for GetElementsTool {
    fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: "getElements".to_string(),
            description: "Query elements on the page and get their tag, text, and attributes".to_string(),
            parameters: ParameterSchema::default()
                .param("selector", ToolParameter::string("CSS selector to query elements"), true)
                .param(
                    "limit",
                    ToolParameter::string("Maximum number of elements to return (default 10)"),
                    false,
                ),
        }
    }

    fn execute(&self, arguments: Value) -> BoxFuture<'static, Result<String, ToolError>> {
        let page = Arc::clone(&self.page);
        Box::pin(async move {
            let selector = required_str(&arguments, "selector")?;
            let limit = positive_number(&arguments, "limit")
                .map(|n| n as usize)
                .unwrap_or(DEFAULT_ELEMENT_LIMIT);

            let summaries: Vec<ElementSummary> = page
                .query(selector, limit)
                .await?
                .into_iter()
                .take(limit)
                .enumerate()
                .map(|(index, element)| ElementSummary {
                    index,
                    tag: element.tag.to_ascii_lowercase(),
                    text: truncate_chars(&element.text, ELEMENT_TEXT_LIMIT),
                    attrs: element
                        .attributes
                        .into_iter()
                        .filter(|(name, _)| REPORTED_ATTRIBUTES.contains(&name.as_str()))
                        .collect(),
                })
                .collect();

            Ok(serde_json::to_string(&summaries).unwrap_or_else(|_| "[]".to_string()))
        })
    }
}

pub struct WaitForNavigationTool {
    page: Arc<dyn BrowserPage>,
}

impl WaitForNavigationTool {
    pub fn new(page: Arc<dyn BrowserPage>) -> Self {
        Self { page }
    }
}

impl ToolTrait for WaitForNavigationTool {
    fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: "waitForNavigation".to_string(),
            description: "Wait for the page to finish loading".to_string(),
            parameters: ParameterSchema::default().param(
                "timeout",
                ToolParameter::string("Maximum wait time in ms (default 5000)"),
                false,
            ),
        }
    }

    fn execute(&self, arguments: Value) -> BoxFuture<'static, Result<String, ToolError>> {
        let page = Arc::clone(&self.page);
        Box::pin(async move {
            let timeout_ms = positive_number(&arguments, "timeout").unwrap_or(DEFAULT_WAIT_MS);

            if page.load_state().await? == LoadState::Complete {
                let url = page.context().await.map(|c| c.url).unwrap_or_default();
                return Ok(json!({ "status": "already_loaded", "url": url }).to_string());
            }

            if tokio::time::timeout(Duration::from_millis(timeout_ms), page.wait_for_load())
                .await
                .is_err()
            {
                debug!(timeout_ms, "waitForNavigation timed out");
            }

            let context = page.context().await;
            Ok(json!({
                "status": "loaded",
                "url": context.as_ref().map(|c| c.url.as_str()).unwrap_or_default(),
                "title": context.as_ref().map(|c| c.title.as_str()).unwrap_or_default(),
            })
            .to_string())
        })
    }
}

/// Registry of callable tools, kept in registration order so requests are
/// deterministic.
pub struct ToolManager {
    tools: Vec<Box<dyn ToolTrait>>,
}

impl Default for ToolManager {
    fn default() -> Self {
        Self::new()
    }
}

impl ToolManager {
    pub fn new() -> Self {
        Self { tools: Vec::new() }
    }

    /// Registering a name twice replaces the earlier tool in place.
    pub fn register(&mut self, tool: Box<dyn ToolTrait>) {
        let name = tool.definition().name;
        match self.tools.iter().position(|t| t.definition().name == name) {
            Some(idx) => self.tools[idx] = tool,
            None => self.tools.push(tool),
        }
    }

    pub fn get(&self, name: &str) -> Option<&dyn ToolTrait> {
        self.tools
            .iter()
            .find(|t| t.definition().name == name)
            .map(|t| t.as_ref())
    }

    pub fn list(&self) -> Vec<String> {
        self.tools.iter().map(|t| t.definition().name).collect()
    }

    pub fn get_definitions(&self) -> Vec<ToolDefinition> {
        self.tools.iter().map(|t| t.definition()).collect()
    }

    /// Runs a tool and always returns text for the model. Unparseable
    /// arguments count as `{}`; failures come back as `Error ...` strings.
    pub async fn execute(&self, name: &str, raw_arguments: &str) -> String {
        let arguments = serde_json::from_str::<Value>(raw_arguments)
            .ok()
            .filter(Value::is_object)
            .unwrap_or_else(|| json!({}));

        let Some(tool) = self.get(name) else {
            warn!(tool = name, "unknown tool requested");
            return format!("Error: Unknown tool \"{}\"", name);
        };

        match tool.execute(arguments).await {
            Ok(result) => result,
            Err(e) => {
                warn!(tool = name, error = %e, "tool execution failed");
                format!("Error executing {}: {}", name, e)
            }
        }
    }
}

pub fn default_tools(page: Arc<dyn BrowserPage>) -> ToolManager {
    let mut manager = ToolManager::new();

    manager.register(Box::new(NavigateTool::new(Arc::clone(&page))));
    manager.register(Box::new(ClickTool::new(Arc::clone(&page))));
    manager.register(Box::new(TypeTool::new(Arc::clone(&page))));
    manager.register(Box::new(ScrollTool::new(Arc::clone(&page))));
    manager.register(Box::new(GetTextTool::new(Arc::clone(&page))));
    manager.register(Box::new(GetElementsTool::new(Arc::clone(&page))));
    manager.register(Box::new(WaitForNavigationTool::new(page)));

    manager
}
