use super::page::{BrowserPage, ElementInfo, LoadState, PageContext, PageError};
use async_trait::async_trait;
use reqwest::header::USER_AGENT;
use scraper::{ElementRef, Html, Selector};
use std::collections::HashMap;
use tokio::sync::Mutex;
use tracing::{debug, info};
use url::Url;

const USER_AGENT_VALUE: &str = "Mozilla/5.0 (compatible; ocbot/0.1)";
const HIDDEN_TEXT_PARENTS: [&str; 4] = ["script", "style", "noscript", "template"];

#[derive(Debug)]
struct Document {
    url: Url,
    title: String,
    html: String,
}

#[derive(Debug, Default)]
struct PageState {
    document: Option<Document>,
    scroll_y: i64,
    /// Values typed so far, keyed by the field's `name` attribute.
    fields: HashMap<String, String>,
}

#[derive(Debug, Clone, PartialEq)]
enum FormMethod {
    Get,
    Post,
}

#[derive(Debug, Clone, PartialEq)]
struct FormSubmission {
    method: FormMethod,
    action: Url,
    fields: Vec<(String, String)>,
}

#[derive(Debug)]
enum ClickAction {
    Missing,
    Inert,
    Follow(Url),
    Submit(FormSubmission),
}

/// A headless page: documents are fetched over HTTP and queried with CSS
/// selectors. There is no script execution; links and forms are the only
/// interactions that change the document.
pub struct HttpPage {
    client: reqwest::Client,
    state: Mutex<PageState>,
}

impl Default for HttpPage {
    fn default() -> Self {
        Self::new()
    }
}

impl HttpPage {
    pub fn new() -> Self {
        Self::with_client(reqwest::Client::new())
    }

    pub fn with_client(client: reqwest::Client) -> Self {
        Self {
            client,
            state: Mutex::new(PageState::default()),
        }
    }

    async fn load(&self, request: reqwest::RequestBuilder) -> Result<(), PageError> {
        let response = request
            .header(USER_AGENT, USER_AGENT_VALUE)
            .send()
            .await
            .map_err(|e| PageError::Navigation(e.to_string()))?;

        let url = response.url().clone();
        let status = response.status();
        let html = response
            .text()
            .await
            .map_err(|e| PageError::Navigation(e.to_string()))?;
        let title = document_title(&html);

        info!(url = %url, status = status.as_u16(), "page loaded");

        let mut state = self.state.lock().await;
        state.document = Some(Document { url, title, html });
        state.scroll_y = 0;
        state.fields.clear();
        Ok(())
    }

    async fn submit(&self, submission: FormSubmission) -> Result<(), PageError> {
        debug!(action = %submission.action, fields = submission.fields.len(), "submitting form");
        let request = match submission.method {
            FormMethod::Get => {
                let mut action = submission.action;
                action.query_pairs_mut().clear().extend_pairs(&submission.fields);
                self.client.get(action)
            }
            FormMethod::Post => self.client.post(submission.action).form(&submission.fields),
        };
        self.load(request).await
    }
}

#[async_trait]
impl BrowserPage for HttpPage {
    async fn context(&self) -> Option<PageContext> {
        let state = self.state.lock().await;
        state.document.as_ref().map(|doc| PageContext {
            url: doc.url.to_string(),
            title: doc.title.clone(),
        })
    }

    async fn navigate(&self, url: &str) -> Result<(), PageError> {
        let url = Url::parse(url).map_err(|e| PageError::Navigation(format!("{}: {}", url, e)))?;
        self.load(self.client.get(url)).await
    }

    async fn load_state(&self) -> Result<LoadState, PageError> {
        // Fetches finish inside `navigate`, so nothing is ever in flight here.
        Ok(LoadState::Complete)
    }

    async fn wait_for_load(&self) {}

    async fn click(&self, selector: &str) -> Result<bool, PageError> {
        let action = {
            let state = self.state.lock().await;
            let doc = state.document.as_ref().ok_or(PageError::NoActivePage)?;
            resolve_click(doc, selector, &state.fields)?
        };

        match action {
            ClickAction::Missing => Ok(false),
            ClickAction::Inert => Ok(true),
            ClickAction::Follow(url) => {
                self.load(self.client.get(url)).await?;
                Ok(true)
            }
            ClickAction::Submit(submission) => {
                self.submit(submission).await?;
                Ok(true)
            }
        }
    }

    async fn type_text(&self, selector: &str, text: &str, press_enter: bool) -> Result<bool, PageError> {
        let submission = {
            let mut state = self.state.lock().await;
            let state = &mut *state;
            let doc = state.document.as_ref().ok_or(PageError::NoActivePage)?;

            let parsed = parse_selector(selector)?;
            let html = Html::parse_document(&doc.html);
            let Some(element) = html.select(&parsed).next() else {
                return Ok(false);
            };

            if let Some(name) = element.value().attr("name") {
                state.fields.insert(name.to_string(), text.to_string());
            }

            if press_enter {
                enclosing_form(element).map(|form| form_submission(&doc.url, form, &state.fields, None))
            } else {
                None
            }
        };

        if let Some(submission) = submission {
            self.submit(submission).await?;
        }
        Ok(true)
    }

    async fn scroll_by(&self, delta_y: i64) -> Result<i64, PageError> {
        let mut state = self.state.lock().await;
        state.scroll_y = (state.scroll_y + delta_y).max(0);
        Ok(state.scroll_y)
    }

    async fn inner_text(&self) -> Result<String, PageError> {
        let state = self.state.lock().await;
        let doc = state.document.as_ref().ok_or(PageError::NoActivePage)?;
        Ok(visible_text(&doc.html))
    }

    async fn query(&self, selector: &str, limit: usize) -> Result<Vec<ElementInfo>, PageError> {
        let state = self.state.lock().await;
        let doc = state.document.as_ref().ok_or(PageError::NoActivePage)?;
        let parsed = parse_selector(selector)?;
        let html = Html::parse_document(&doc.html);
        Ok(html.select(&parsed).take(limit).map(element_info).collect())
    }
}

fn parse_selector(selector: &str) -> Result<Selector, PageError> {
    Selector::parse(selector).map_err(|_| PageError::InvalidSelector(selector.to_string()))
}

fn collapse_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn document_title(html: &str) -> String {
    let document = Html::parse_document(html);
    parse_selector("title")
        .ok()
        .and_then(|sel| document.select(&sel).next())
        .map(|el| collapse_whitespace(&el.text().collect::<String>()))
        .unwrap_or_default()
}

/// Text of `<body>` minus script-like content, one line per text run.
fn visible_text(html: &str) -> String {
    let document = Html::parse_document(html);
    let root = parse_selector("body")
        .ok()
        .and_then(|sel| document.select(&sel).next())
        .unwrap_or_else(|| document.root_element());

    root.descendants()
        .filter_map(|node| {
            let text = node.value().as_text()?;
            let hidden = node.ancestors().any(|ancestor| {
                ancestor
                    .value()
                    .as_element()
                    .is_some_and(|el| HIDDEN_TEXT_PARENTS.contains(&el.name()))
            });
            if hidden {
                return None;
            }
            let line = collapse_whitespace(text);
            (!line.is_empty()).then_some(line)
        })
        .collect::<Vec<_>>()
        .join("\n")
}

fn element_info(element: ElementRef<'_>) -> ElementInfo {
    ElementInfo {
        tag: element.value().name().to_string(),
        text: collapse_whitespace(&element.text().collect::<Vec<_>>().join(" ")),
        attributes: element
            .value()
            .attrs()
            .map(|(name, value)| (name.to_string(), value.to_string()))
            .collect(),
    }
}

fn enclosing_form(element: ElementRef<'_>) -> Option<ElementRef<'_>> {
    element
        .ancestors()
        .filter_map(ElementRef::wrap)
        .find(|ancestor| ancestor.value().name() == "form")
}

fn is_submit_control(element: ElementRef<'_>) -> bool {
    let kind = element.value().attr("type").unwrap_or_default().to_ascii_lowercase();
    match element.value().name() {
        "button" => kind.is_empty() || kind == "submit",
        "input" => kind == "submit" || kind == "image",
        _ => false,
    }
}

fn resolve_click(
    doc: &Document,
    selector: &str,
    fields: &HashMap<String, String>,
) -> Result<ClickAction, PageError> {
    let parsed = parse_selector(selector)?;
    let html = Html::parse_document(&doc.html);
    let Some(element) = html.select(&parsed).next() else {
        return Ok(ClickAction::Missing);
    };

    let link = std::iter::once(element)
        .chain(element.ancestors().filter_map(ElementRef::wrap))
        .find(|el| el.value().name() == "a" && el.value().attr("href").is_some());
    if let Some(href) = link.and_then(|a| a.value().attr("href")) {
        if !href.trim_start().starts_with('#') && !href.trim_start().starts_with("javascript:") {
            if let Ok(target) = doc.url.join(href) {
                return Ok(ClickAction::Follow(target));
            }
        }
        return Ok(ClickAction::Inert);
    }

    if is_submit_control(element) {
        if let Some(form) = enclosing_form(element) {
            let submitter = element
                .value()
                .attr("name")
                .map(|name| (name.to_string(), element.value().attr("value").unwrap_or_default().to_string()));
            return Ok(ClickAction::Submit(form_submission(&doc.url, form, fields, submitter)));
        }
    }

    Ok(ClickAction::Inert)
}

fn form_submission(
    base: &Url,
    form: ElementRef<'_>,
    typed: &HashMap<String, String>,
    submitter: Option<(String, String)>,
) -> FormSubmission {
    let method = match form.value().attr("method") {
        Some(m) if m.eq_ignore_ascii_case("post") => FormMethod::Post,
        _ => FormMethod::Get,
    };
    let action = form
        .value()
        .attr("action")
        .filter(|a| !a.trim().is_empty())
        .and_then(|a| base.join(a).ok())
        .unwrap_or_else(|| base.clone());

    let mut fields = Vec::new();
    if let Ok(controls) = Selector::parse("input[name], textarea[name]") {
        for control in form.select(&controls) {
            let element = control.value();
            let Some(name) = element.attr("name") else {
                continue;
            };
            let kind = element.attr("type").unwrap_or("text").to_ascii_lowercase();
            if matches!(kind.as_str(), "submit" | "button" | "image" | "reset" | "file") {
                continue;
            }
            if matches!(kind.as_str(), "checkbox" | "radio") && element.attr("checked").is_none() {
                continue;
            }

            let value = match typed.get(name) {
                Some(value) => value.clone(),
                None if element.name() == "textarea" => control.text().collect(),
                None => element.attr("value").unwrap_or_default().to_string(),
            };
            fields.push((name.to_string(), value));
        }
    }
    fields.extend(submitter);

    FormSubmission {
        method,
        action,
        fields,
    }
}
