use std::path::PathBuf;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::error::PortalResult;

/// One cookie of an authenticated portal session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionCookie {
    pub name: String,
    pub value: String,
    pub domain: Option<String>,
    pub path: Option<String>,
    pub secure: bool,
    pub http_only: bool,
}

impl SessionCookie {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
            domain: None,
            path: None,
            secure: false,
            http_only: false,
        }
    }
}

/// Renders cookies as a `Cookie` request header value.
pub fn cookie_header(cookies: &[SessionCookie]) -> String {
    cookies
        .iter()
        .map(|cookie| format!("{}={}", cookie.name, cookie.value))
        .collect::<Vec<_>>()
        .join("; ")
}

/// Text content of one element matched by [`PortalSession::query_all`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RowSnapshot {
    pub index: usize,
    pub text: String,
    pub cells: Vec<String>,
    pub link: Option<String>,
}

impl RowSnapshot {
    pub fn cell(&self, column: usize) -> Option<&str> {
        self.cells.get(column).map(String::as_str)
    }
}

/// Remote UI capability set the harvester depends on.
///
/// Every method is a suspension point. Implementations are driven from a
/// single task, so they do not need to be `Send`.
#[async_trait(?Send)]
pub trait PortalSession {
    async fn goto(&mut self, url: &str) -> PortalResult<()>;
    /// Resolves once the page has no in-flight requests for a quiet window.
    async fn wait_for_idle(&mut self) -> PortalResult<()>;
    async fn wait_for(&mut self, selector: &str) -> PortalResult<()>;
    async fn click(&mut self, selector: &str) -> PortalResult<()>;
    async fn click_nth(&mut self, selector: &str, index: usize) -> PortalResult<()>;
    async fn type_text(&mut self, selector: &str, text: &str) -> PortalResult<()>;
    async fn read_text(&mut self, selector: &str) -> PortalResult<String>;
    async fn select_option(&mut self, selector: &str, value: &str) -> PortalResult<()>;
    async fn query_all(&mut self, selector: &str) -> PortalResult<Vec<RowSnapshot>>;
    async fn exists(&mut self, selector: &str) -> PortalResult<bool>;
    async fn scroll_to_bottom(&mut self) -> PortalResult<()>;
    async fn cookies(&mut self) -> PortalResult<Vec<SessionCookie>>;
    async fn set_cookies(&mut self, cookies: &[SessionCookie]) -> PortalResult<()>;
    /// Closes the browsing context. Calling it twice is a no-op.
    async fn close(&mut self) -> PortalResult<()>;
}

#[derive(Debug, Clone)]
pub struct SessionSpec {
    pub profile_dir: PathBuf,
    /// Directory the portal's file downloads land in.
    pub download_dir: Option<PathBuf>,
}

#[async_trait(?Send)]
pub trait SessionFactory {
    async fn open(&self, spec: &SessionSpec) -> PortalResult<Box<dyn PortalSession>>;
}
