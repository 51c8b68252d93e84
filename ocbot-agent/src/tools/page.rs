use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PageContext {
    pub url: String,
    pub title: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadState {
    Loading,
    Complete,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ElementInfo {
    pub tag: String,
    pub text: String,
    pub attributes: Vec<(String, String)>,
}

#[derive(Debug, Error)]
pub enum PageError {
    #[error("No active tab found")]
    NoActivePage,
    #[error("Invalid selector \"{0}\"")]
    InvalidSelector(String),
    #[error("Navigation failed: {0}")]
    Navigation(String),
}

/// The tab the tools drive. Implementations report missing elements as
/// `Ok(false)` and keep `Err` for failures of the page itself.
#[async_trait]
pub trait BrowserPage: Send + Sync {
    /// URL and title of the current document, if there is one.
    async fn context(&self) -> Option<PageContext>;

    /// Starts loading `url`. Completion is observed through `load_state`
    /// and `wait_for_load`.
    async fn navigate(&self, url: &str) -> Result<(), PageError>;

    async fn load_state(&self) -> Result<LoadState, PageError>;

    /// Resolves once the current load completes. May never resolve; callers
    /// bound it with a timeout.
    async fn wait_for_load(&self);

    async fn click(&self, selector: &str) -> Result<bool, PageError>;

    /// Sets the field value and fires input/change. With `press_enter` it
    /// also sends Enter and submits the owning form, if any.
    async fn type_text(&self, selector: &str, text: &str, press_enter: bool) -> Result<bool, PageError>;

    /// Scrolls vertically and returns the resulting offset in pixels.
    async fn scroll_by(&self, delta_y: i64) -> Result<i64, PageError>;

    async fn inner_text(&self) -> Result<String, PageError>;

    async fn query(&self, selector: &str, limit: usize) -> Result<Vec<ElementInfo>, PageError>;
}

#[cfg(test)]
pub(crate) mod fake {
    use super::*;
    use std::sync::Mutex;

    #[derive(Debug, Default)]
    pub(crate) struct FakeState {
        pub(crate) url: String,
        pub(crate) title: String,
        pub(crate) loaded: bool,
        pub(crate) text: String,
        pub(crate) elements: Vec<(String, ElementInfo)>,
        pub(crate) scroll_y: i64,
        pub(crate) navigations: Vec<String>,
        pub(crate) typed: Vec<(String, String, bool)>,
        pub(crate) clicks: Vec<String>,
        /// When false, navigation leaves the page loading forever.
        pub(crate) completes_loads: bool,
    }

    /// In-memory page keyed by exact selector strings.
    #[derive(Debug, Default)]
    pub(crate) struct FakePage {
        pub(crate) state: Mutex<FakeState>,
    }

    impl FakePage {
        pub(crate) fn new(url: &str, title: &str) -> Self {
            Self {
                state: Mutex::new(FakeState {
                    url: url.to_string(),
                    title: title.to_string(),
                    loaded: true,
                    completes_loads: true,
                    ..FakeState::default()
                }),
            }
        }

        pub(crate) fn with_element(self, selector: &str, tag: &str, text: &str, attributes: &[(&str, &str)]) -> Self {
            self.state.lock().unwrap().elements.push((
                selector.to_string(),
                ElementInfo {
                    tag: tag.to_string(),
                    text: text.to_string(),
                    attributes: attributes
                        .iter()
                        .map(|(k, v)| (k.to_string(), v.to_string()))
                        .collect(),
                },
            ));
            self
        }

        pub(crate) fn with_text(self, text: &str) -> Self {
            self.state.lock().unwrap().text = text.to_string();
            self
        }

        pub(crate) fn stalled(self) -> Self {
            {
                let mut state = self.state.lock().unwrap();
                state.completes_loads = false;
                state.loaded = false;
            }
            self
        }

        fn has(&self, selector: &str) -> bool {
            self.state.lock().unwrap().elements.iter().any(|(s, _)| s == selector)
        }
    }

    #[async_trait]
    impl BrowserPage for FakePage {
        async fn context(&self) -> Option<PageContext> {
            let state = self.state.lock().unwrap();
            (!state.url.is_empty()).then(|| PageContext {
                url: state.url.clone(),
                title: state.title.clone(),
            })
        }

        async fn navigate(&self, url: &str) -> Result<(), PageError> {
            let mut state = self.state.lock().unwrap();
            state.navigations.push(url.to_string());
            state.url = url.to_string();
            state.title = format!("Title of {}", url);
            state.loaded = state.completes_loads;
            Ok(())
        }

        async fn load_state(&self) -> Result<LoadState, PageError> {
            Ok(if self.state.lock().unwrap().loaded {
                LoadState::Complete
            } else {
                LoadState::Loading
            })
        }

        async fn wait_for_load(&self) {
            let loaded = self.state.lock().unwrap().loaded;
            if !loaded {
                std::future::pending::<()>().await;
            }
        }

        async fn click(&self, selector: &str) -> Result<bool, PageError> {
            if !self.has(selector) {
                return Ok(false);
            }
            self.state.lock().unwrap().clicks.push(selector.to_string());
            Ok(true)
        }

        async fn type_text(&self, selector: &str, text: &str, press_enter: bool) -> Result<bool, PageError> {
            if !self.has(selector) {
                return Ok(false);
            }
            self.state
                .lock()
                .unwrap()
                .typed
                .push((selector.to_string(), text.to_string(), press_enter));
            Ok(true)
        }

        async fn scroll_by(&self, delta_y: i64) -> Result<i64, PageError> {
            let mut state = self.state.lock().unwrap();
            state.scroll_y = (state.scroll_y + delta_y).max(0);
            Ok(state.scroll_y)
        }

        async fn inner_text(&self) -> Result<String, PageError> {
            Ok(self.state.lock().unwrap().text.clone())
        }

        async fn query(&self, selector: &str, limit: usize) -> Result<Vec<ElementInfo>, PageError> {
            if selector.contains("!!") {
                return Err(PageError::InvalidSelector(selector.to_string()));
            }
            Ok(self
                .state
                .lock()
                .unwrap()
                .elements
                .iter()
                .filter(|(s, _)| s == selector)
                .map(|(_, e)| e.clone())
                .take(limit)
                .collect())
        }
    }
}
