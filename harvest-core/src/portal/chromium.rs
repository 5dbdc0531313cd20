use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chromiumoxide::browser::{Browser, BrowserConfig as ChromiumConfig};
use chromiumoxide::cdp::browser_protocol::browser::{
    SetDownloadBehaviorBehavior, SetDownloadBehaviorParams,
};
use chromiumoxide::cdp::browser_protocol::network::{CookieParam, SetUserAgentOverrideParams};
use chromiumoxide::cdp::browser_protocol::page::{
    AddScriptToEvaluateOnNewDocumentParams, NavigateParams,
};
use chromiumoxide::cdp::browser_protocol::target::CreateTargetParams;
use chromiumoxide::element::Element;
use chromiumoxide::handler::viewport::Viewport as ChromiumViewport;
use chromiumoxide::page::Page;
use futures::StreamExt;
use rand::seq::SliceRandom;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use tokio::task::JoinHandle;
use tokio::time::{sleep, Instant};
use tracing::{debug, info, warn};

use crate::config::{BrowserSection, HarvestConfig, TimingSection};

use super::error::{PortalError, PortalResult};
use super::session::{PortalSession, RowSnapshot, SessionCookie, SessionFactory, SessionSpec};

const IDLE_PROBE_INTERVAL: Duration = Duration::from_millis(100);

const NETWORK_HOOK: &str = r#"
(() => {
    if (Object.prototype.hasOwnProperty.call(window, '__harvestInflight')) {
        return;
    }
    let inflight = 0;
    Object.defineProperty(window, '__harvestInflight', {
        get: () => inflight,
        configurable: false,
    });

    const originalFetch = window.fetch;
    window.fetch = async (...args) => {
        inflight += 1;
        try {
            return await originalFetch(...args);
        } finally {
            inflight -= 1;
        }
    };

    const originalSend = XMLHttpRequest.prototype.send;
    XMLHttpRequest.prototype.send = function(...args) {
        inflight += 1;
        this.addEventListener('loadend', () => { inflight -= 1; }, { once: true });
        return originalSend.apply(this, args);
    };
})();
"#;

const IDLE_PROBE: &str = "({ ready: document.readyState === 'complete', inflight: window.__harvestInflight || 0 })";

#[derive(Debug, Deserialize)]
struct IdleProbe {
    ready: bool,
    inflight: u32,
}

/// Launches one Chromium process per session.
#[derive(Debug, Clone)]
pub struct ChromiumLauncher {
    browser: Arc<BrowserSection>,
    timing: Arc<TimingSection>,
}

impl ChromiumLauncher {
    pub fn new(browser: BrowserSection, timing: TimingSection) -> Self {
        Self {
            browser: Arc::new(browser),
            timing: Arc::new(timing),
        }
    }

    pub fn from_config(config: &HarvestConfig) -> Self {
        Self::new(config.browser.clone(), config.timing.clone())
    }

    pub async fn launch(&self, spec: &SessionSpec) -> PortalResult<ChromiumSession> {
        let user_agent = self.select_user_agent();
        let chromium_config = self.build_chromium_config(&spec.profile_dir, &user_agent)?;
        info!(
            profile = %spec.profile_dir.display(),
            headless = self.browser.headless,
            "Launching Chromium instance"
        );

        let (browser, mut handler) = Browser::launch(chromium_config)
            .await
            .map_err(|err| PortalError::Launch(err.to_string()))?;

        let handler_task = tokio::spawn(async move {
            while let Some(event) = handler.next().await {
                if let Err(err) = event {
                    debug!(error = %err, "Chromium handler reported error");
                }
            }
        });

        let page = browser.new_page(CreateTargetParams::new("about:blank")).await?;
        let mut session = ChromiumSession {
            browser,
            page,
            handler_task: Some(handler_task),
            idle_quiet: Duration::from_millis(self.timing.idle_quiet_ms),
            idle_timeout: Duration::from_millis(self.timing.idle_timeout_ms),
            closed: false,
        };
        if let Err(err) = session.configure(&user_agent, spec.download_dir.as_deref()).await {
            let _ = session.close().await;
            return Err(err);
        }
        Ok(session)
    }

    fn select_user_agent(&self) -> String {
        let mut rng = rand::thread_rng();
        self.browser
            .user_agents
            .choose(&mut rng)
            .cloned()
            .unwrap_or_default()
    }

    fn build_chromium_config(
        &self,
        profile_dir: &Path,
        user_agent: &str,
    ) -> PortalResult<ChromiumConfig> {
        let width = self.browser.window_width;
        let height = self.browser.window_height;
        let mut builder = ChromiumConfig::builder()
            .user_data_dir(profile_dir)
            .window_size(width, height)
            .viewport(ChromiumViewport {
                width,
                height,
                device_scale_factor: Some(1.0),
                emulating_mobile: false,
                is_landscape: width >= height,
                has_touch: false,
            });

        if let Some(executable) = &self.browser.executable_path {
            builder = builder.chrome_executable(executable);
        }
        if !self.browser.headless {
            builder = builder.with_head();
        }
        if !self.browser.sandbox {
            builder = builder.no_sandbox();
        }

        let mut args = vec![format!("--window-size={width},{height}")];
        if !user_agent.is_empty() {
            args.push(format!("--user-agent={user_agent}"));
        }
        args.push("--no-first-run".into());
        args.push("--password-store=basic".into());
        builder = builder.args(args);

        builder.build().map_err(PortalError::Configuration)
    }
}

#[async_trait(?Send)]
impl SessionFactory for ChromiumLauncher {
    async fn open(&self, spec: &SessionSpec) -> PortalResult<Box<dyn PortalSession>> {
        Ok(Box::new(self.launch(spec).await?))
    }
}

#[derive(Debug)]
pub struct ChromiumSession {
    browser: Browser,
    page: Page,
    handler_task: Option<JoinHandle<()>>,
    idle_quiet: Duration,
    idle_timeout: Duration,
    closed: bool,
}

impl ChromiumSession {
    async fn configure(&mut self, user_agent: &str, download_dir: Option<&Path>) -> PortalResult<()> {
        if !user_agent.is_empty() {
            let params = SetUserAgentOverrideParams::builder()
                .user_agent(user_agent)
                .build()
                .map_err(PortalError::Configuration)?;
            self.page.set_user_agent(params).await?;
        }

        self.page
            .evaluate_on_new_document(
                AddScriptToEvaluateOnNewDocumentParams::builder()
                    .source(NETWORK_HOOK)
                    .build()
                    .map_err(PortalError::Configuration)?,
            )
            .await?;

        if let Some(dir) = download_dir {
            self.browser.execute(download_behavior(dir)?).await?;
        }
        Ok(())
    }

    async fn element(&self, selector: &str) -> PortalResult<Element> {
        self.page
            .find_element(selector)
            .await
            .map_err(|err| PortalError::ElementNotFound(format!("{selector}: {err}")))
    }

    async fn eval<T: DeserializeOwned>(&self, script: &str) -> PortalResult<T> {
        self.page
            .evaluate(script)
            .await?
            .into_value()
            .map_err(|err| PortalError::UnexpectedShape(format!("script result: {err}")))
    }
}

/// Browser-wide: downloads from any page land in `dir`.
fn download_behavior(dir: &Path) -> PortalResult<SetDownloadBehaviorParams> {
    SetDownloadBehaviorParams::builder()
        .behavior(SetDownloadBehaviorBehavior::Allow)
        .download_path(dir.to_string_lossy().into_owned())
        .build()
        .map_err(PortalError::Configuration)
}

fn js_string(value: &str) -> String {
    serde_json::Value::String(value.to_string()).to_string()
}

#[async_trait(?Send)]
impl PortalSession for ChromiumSession {
    async fn goto(&mut self, url: &str) -> PortalResult<()> {
        let params = NavigateParams::builder()
            .url(url)
            .build()
            .map_err(PortalError::Configuration)?;
        self.page.goto(params).await?;
        self.page.wait_for_navigation().await?;
        Ok(())
    }

    async fn wait_for_idle(&mut self) -> PortalResult<()> {
        let deadline = Instant::now() + self.idle_timeout;
        let mut quiet_since: Option<Instant> = None;
        loop {
            let probe: IdleProbe = self.eval(IDLE_PROBE).await?;
            let now = Instant::now();
            if probe.ready && probe.inflight == 0 {
                let since = *quiet_since.get_or_insert(now);
                if now.duration_since(since) >= self.idle_quiet {
                    return Ok(());
                }
            } else {
                quiet_since = None;
            }
            if now >= deadline {
                return Err(PortalError::Timeout("network idle".into()));
            }
            sleep(IDLE_PROBE_INTERVAL).await;
        }
    }

    async fn wait_for(&mut self, selector: &str) -> PortalResult<()> {
        let deadline = Instant::now() + self.idle_timeout;
        loop {
            if self.exists(selector).await? {
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(PortalError::Timeout(selector.to_string()));
            }
            sleep(IDLE_PROBE_INTERVAL).await;
        }
    }

    async fn click(&mut self, selector: &str) -> PortalResult<()> {
        self.element(selector).await?.click().await?;
        Ok(())
    }

    async fn click_nth(&mut self, selector: &str, index: usize) -> PortalResult<()> {
        let elements = self.page.find_elements(selector).await?;
        let element = elements.get(index).ok_or_else(|| {
            PortalError::ElementNotFound(format!("{selector} [{index}] of {}", elements.len()))
        })?;
        element.click().await?;
        Ok(())
    }

    async fn type_text(&mut self, selector: &str, text: &str) -> PortalResult<()> {
        self.element(selector).await?.click().await?.type_str(text).await?;
        Ok(())
    }

    async fn read_text(&mut self, selector: &str) -> PortalResult<String> {
        let text = self.element(selector).await?.inner_text().await?;
        Ok(text.unwrap_or_default().trim().to_string())
    }

    async fn select_option(&mut self, selector: &str, value: &str) -> PortalResult<()> {
        let script = format!(
            "(() => {{
    const el = document.querySelector({selector});
    if (!el) return false;
    el.value = {value};
    el.dispatchEvent(new Event('change', {{ bubbles: true }}));
    return true;
}})()",
            selector = js_string(selector),
            value = js_string(value),
        );
        let found: bool = self.eval(&script).await?;
        if found {
            Ok(())
        } else {
            Err(PortalError::ElementNotFound(selector.to_string()))
        }
    }

    async fn query_all(&mut self, selector: &str) -> PortalResult<Vec<RowSnapshot>> {
        let script = format!(
            "Array.from(document.querySelectorAll({selector})).map((node, index) => {{
    const anchor = node.querySelector('a');
    return {{
        index,
        text: (node.innerText || '').trim(),
        cells: Array.from(node.querySelectorAll('td')).map(td => (td.innerText || '').trim()),
        link: anchor ? anchor.href : null,
    }};
}})",
            selector = js_string(selector),
        );
        self.eval(&script).await
    }

    async fn exists(&mut self, selector: &str) -> PortalResult<bool> {
        let script = format!("document.querySelector({}) !== null", js_string(selector));
        self.eval(&script).await
    }

    async fn scroll_to_bottom(&mut self) -> PortalResult<()> {
        self.page
            .evaluate("window.scrollTo(0, document.body.scrollHeight)")
            .await?;
        Ok(())
    }

    async fn cookies(&mut self) -> PortalResult<Vec<SessionCookie>> {
        let cookies = self.page.get_cookies().await?;
        Ok(cookies
            .into_iter()
            .map(|cookie| SessionCookie {
                name: cookie.name,
                value: cookie.value,
                domain: Some(cookie.domain),
                path: Some(cookie.path),
                secure: cookie.secure,
                http_only: cookie.http_only,
            })
            .collect())
    }

    async fn set_cookies(&mut self, cookies: &[SessionCookie]) -> PortalResult<()> {
        let mut params = Vec::with_capacity(cookies.len());
        for cookie in cookies {
            let mut builder = CookieParam::builder()
                .name(cookie.name.clone())
                .value(cookie.value.clone())
                .secure(cookie.secure)
                .http_only(cookie.http_only);
            if let Some(domain) = &cookie.domain {
                builder = builder.domain(domain.clone());
            }
            if let Some(path) = &cookie.path {
                builder = builder.path(path.clone());
            }
            params.push(builder.build().map_err(PortalError::Configuration)?);
        }
        self.page.set_cookies(params).await?;
        Ok(())
    }

    async fn close(&mut self) -> PortalResult<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        info!("Shutting down Chromium instance");
        if let Err(err) = self.browser.close().await {
            warn!(error = %err, "Failed to close browser gracefully");
        }
        match self.browser.wait().await {
            Ok(status) => debug!(?status, "Chromium process exited"),
            Err(err) => warn!(error = %err, "Failed to wait for Chromium process"),
        }
        if let Some(handle) = self.handler_task.take() {
            if let Err(err) = handle.await {
                warn!(error = %err, "Browser handler join error");
            }
        }
        Ok(())
    }
}

impl Drop for ChromiumSession {
    fn drop(&mut self) {
        if let Some(handle) = &self.handler_task {
            if !handle.is_finished() {
                warn!("ChromiumSession dropped without explicit close");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn downloads_are_allowed_into_the_license_dir() {
        let params = download_behavior(Path::new("/out/402R-00123")).unwrap();
        assert_eq!(params.behavior, SetDownloadBehaviorBehavior::Allow);
        assert_eq!(params.download_path.as_deref(), Some("/out/402R-00123"));
        assert!(params.browser_context_id.is_none());
    }

    #[test]
    fn selectors_are_quoted_for_scripts() {
        assert_eq!(js_string(r#"a[title="Next"]"#), r#""a[title=\"Next\"]""#);
    }
}
