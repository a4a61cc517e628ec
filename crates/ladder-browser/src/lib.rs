//! Headless browser session used to load and render source pages.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chromiumoxide::browser::{Browser, BrowserConfig};
use chromiumoxide::handler::viewport::Viewport;
use chromiumoxide::Page;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

pub const CRATE_NAME: &str = "ladder-browser";

pub const DEFAULT_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/121.0.0.0 Safari/537.36";

const SELECTOR_POLL: Duration = Duration::from_millis(250);

/// One load-completion condition. A site lists several to apply them in order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "step", rename_all = "snake_case")]
pub enum WaitStep {
    /// Satisfied once navigation itself has completed.
    DomContentLoaded,
    /// No new network resources for a quiet window, bounded by `timeout_ms`.
    NetworkIdle {
        #[serde(default = "default_idle_timeout_ms")]
        timeout_ms: u64,
    },
    /// Wait for `selector` to match; a timeout is logged, not raised.
    Selector {
        selector: String,
        #[serde(default = "default_selector_timeout_ms")]
        timeout_ms: u64,
    },
    /// Scroll once by `distance_px`, then sleep `delay_ms` for lazy content.
    Scroll { distance_px: u32, delay_ms: u64 },
}

impl WaitStep {
    /// Network-idle with the default bound.
    pub fn network_idle() -> Self {
        WaitStep::NetworkIdle {
            timeout_ms: default_idle_timeout_ms(),
        }
    }
}

fn default_idle_timeout_ms() -> u64 {
    15_000
}

fn default_selector_timeout_ms() -> u64 {
    10_000
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadedPage {
    pub url: String,
    pub html: String,
}

#[derive(Debug, Error)]
pub enum BrowserError {
    #[error("browser launch failed: {0}")]
    Launch(String),
    #[error("navigation to {url} failed: {message}")]
    Navigation { url: String, message: String },
    #[error("navigation to {url} timed out after {secs}s")]
    Timeout { url: String, secs: u64 },
    #[error("page script failed on {url}: {message}")]
    Script { url: String, message: String },
    #[error("browser session lost: {0}")]
    SessionLost(String),
}

impl BrowserError {
    /// Whether the error leaves the shared session unusable for later sites.
    pub fn is_session_fatal(&self) -> bool {
        matches!(self, BrowserError::Launch(_) | BrowserError::SessionLost(_))
    }
}

/// Supplies rendered pages. The live implementation drives a browser; tests
/// substitute [`StaticPageLoader`].
#[async_trait]
pub trait PageLoader: Send + Sync {
    async fn load(&self, url: &str, wait: &[WaitStep]) -> Result<LoadedPage, BrowserError>;
}

/// The page operations wait steps are built from.
#[async_trait]
trait PageProbe: Send + Sync {
    async fn present(&self, selector: &str) -> bool;

    /// `Ok(false)` when the network was still busy at `timeout`.
    async fn settle(&self, url: &str, timeout: Duration) -> Result<bool, BrowserError>;

    async fn scroll(&self, url: &str, distance_px: u32) -> Result<(), BrowserError>;
}

/// Applies `steps` in order. Selector and idle timeouts are logged, not raised.
async fn apply_wait_steps(probe: &dyn PageProbe, url: &str, steps: &[WaitStep]) -> Result<(), BrowserError> {
    for step in steps {
        match step {
            WaitStep::DomContentLoaded => {}
            WaitStep::NetworkIdle { timeout_ms } => {
                if !probe.settle(url, Duration::from_millis(*timeout_ms)).await? {
                    warn!(url, "network did not settle before timeout");
                }
            }
            WaitStep::Selector { selector, timeout_ms } => {
                wait_for_selector(probe, selector, Duration::from_millis(*timeout_ms)).await;
            }
            WaitStep::Scroll { distance_px, delay_ms } => {
                probe.scroll(url, *distance_px).await?;
                tokio::time::sleep(Duration::from_millis(*delay_ms)).await;
            }
        }
    }
    Ok(())
}

async fn wait_for_selector(probe: &dyn PageProbe, selector: &str, timeout: Duration) -> bool {
    let started = Instant::now();
    loop {
        if probe.present(selector).await {
            debug!(selector, waited_ms = started.elapsed().as_millis() as u64, "selector present");
            return true;
        }
        if started.elapsed() >= timeout {
            warn!(selector, timeout_ms = timeout.as_millis() as u64, "selector wait timed out; extracting anyway");
            return false;
        }
        tokio::time::sleep(SELECTOR_POLL.min(timeout)).await;
    }
}

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub headless: bool,
    pub user_agent: String,
    pub viewport_width: u32,
    pub viewport_height: u32,
    pub navigation_timeout: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            headless: true,
            user_agent: DEFAULT_USER_AGENT.to_string(),
            viewport_width: 1280,
            viewport_height: 800,
            navigation_timeout: Duration::from_secs(45),
        }
    }
}

/// A launched browser with one reusable tab.
///
/// Call [`BrowserSession::close`] when done; dropping the session only stops
/// the event handler task.
pub struct BrowserSession {
    browser: Browser,
    page: Page,
    handler: Option<JoinHandle<()>>,
    navigation_timeout: Duration,
}

impl BrowserSession {
    pub async fn open(config: &SessionConfig) -> Result<Self, BrowserError> {
        info!(headless = config.headless, "launching browser");

        let mut builder = BrowserConfig::builder()
            .window_size(config.viewport_width, config.viewport_height)
            .viewport(Viewport {
                width: config.viewport_width,
                height: config.viewport_height,
                ..Viewport::default()
            })
            .arg("--no-sandbox")
            .arg("--disable-setuid-sandbox")
            .arg("--disable-dev-shm-usage")
            .arg("--disable-gpu");
        if !config.headless {
            builder = builder.with_head();
        }
        let browser_config = builder.build().map_err(BrowserError::Launch)?;

        let (mut browser, mut handler) = Browser::launch(browser_config)
            .await
            .map_err(|e| BrowserError::Launch(e.to_string()))?;
        let handler = tokio::spawn(async move { while handler.next().await.is_some() {} });

        let page = match browser.new_page("about:blank").await {
            Ok(page) => page,
            Err(err) => {
                handler.abort();
                let _ = browser.close().await;
                return Err(BrowserError::Launch(err.to_string()));
            }
        };
        if let Err(err) = page.set_user_agent(config.user_agent.as_str()).await {
            warn!(error = %err, "could not override user agent");
        }

        Ok(Self {
            browser,
            page,
            handler: Some(handler),
            navigation_timeout: config.navigation_timeout,
        })
    }

    pub async fn close(mut self) {
        if let Err(err) = self.browser.close().await {
            warn!(error = %err, "browser close failed");
        }
        if let Err(err) = self.browser.wait().await {
            debug!(error = %err, "browser process wait failed");
        }
        if let Some(handler) = self.handler.take() {
            handler.abort();
        }
        info!("browser closed");
    }

    async fn navigate(&self, url: &str) -> Result<(), BrowserError> {
        let secs = self.navigation_timeout.as_secs();
        match tokio::time::timeout(self.navigation_timeout, self.page.goto(url)).await {
            Err(_) => Err(BrowserError::Timeout {
                url: url.to_string(),
                secs,
            }),
            Ok(Err(err)) => Err(classify_cdp_error(url, err, secs)),
            Ok(Ok(_)) => Ok(()),
        }
    }

    fn script_error(url: &str, err: impl std::fmt::Display) -> BrowserError {
        BrowserError::Script {
            url: url.to_string(),
            message: err.to_string(),
        }
    }
}

/// Counts resource-timing entries until the count stops growing for a second
/// while `document.readyState` is `complete`. The timing buffer is enlarged,
/// and entries are carried over when it fills, so heavy pages keep counting.
fn network_idle_script(timeout: Duration) -> String {
    format!(
        r#"(async () => {{
            const timeoutMs = {timeout_ms};
            const idleMs = 1000;
            const interval = 250;
            const start = Date.now();
            let overflow = 0;
            try {{
                performance.setResourceTimingBufferSize(10000);
                performance.addEventListener('resourcetimingbufferfull', () => {{
                    overflow += performance.getEntriesByType('resource').length;
                    performance.clearResourceTimings();
                }});
            }} catch (_) {{}}
            const count = () => {{
                try {{ return overflow + performance.getEntriesByType('resource').length; }} catch (_) {{ return overflow; }}
            }};
            let last = count();
            let stable = 0;
            while (Date.now() - start < timeoutMs) {{
                await new Promise(r => setTimeout(r, interval));
                const cur = count();
                if (document.readyState === 'complete' && cur === last) {{
                    stable += interval;
                    if (stable >= idleMs) return true;
                }} else {{
                    stable = 0;
                }}
                last = cur;
            }}
            return false;
        }})()"#,
        timeout_ms = timeout.as_millis() as u64
    )
}

#[async_trait]
impl PageProbe for BrowserSession {
    async fn present(&self, selector: &str) -> bool {
        self.page.find_element(selector).await.is_ok()
    }

    async fn settle(&self, url: &str, timeout: Duration) -> Result<bool, BrowserError> {
        Ok(self
            .page
            .evaluate(network_idle_script(timeout))
            .await
            .map_err(|e| Self::script_error(url, e))?
            .into_value::<bool>()
            .unwrap_or(false))
    }

    async fn scroll(&self, url: &str, distance_px: u32) -> Result<(), BrowserError> {
        self.page
            .evaluate(format!("window.scrollBy(0, {distance_px})"))
            .await
            .map_err(|e| Self::script_error(url, e))?;
        Ok(())
    }
}

impl Drop for BrowserSession {
    fn drop(&mut self) {
        if let Some(handler) = self.handler.take() {
            handler.abort();
        }
    }
}

fn classify_cdp_error(url: &str, err: chromiumoxide::error::CdpError, timeout_secs: u64) -> BrowserError {
    use chromiumoxide::error::CdpError;
    match err {
        CdpError::ChannelSendError(_) | CdpError::NoResponse | CdpError::Ws(_) => {
            BrowserError::SessionLost(err.to_string())
        }
        CdpError::Timeout => BrowserError::Timeout {
            url: url.to_string(),
            secs: timeout_secs,
        },
        other => BrowserError::Navigation {
            url: url.to_string(),
            message: other.to_string(),
        },
    }
}

#[async_trait]
impl PageLoader for BrowserSession {
    async fn load(&self, url: &str, wait: &[WaitStep]) -> Result<LoadedPage, BrowserError> {
        self.navigate(url).await?;
        apply_wait_steps(self, url, wait).await?;

        let secs = self.navigation_timeout.as_secs();
        let html = self
            .page
            .content()
            .await
            .map_err(|e| classify_cdp_error(url, e, secs))?;
        let final_url = self
            .page
            .url()
            .await
            .ok()
            .flatten()
            .unwrap_or_else(|| url.to_string());
        Ok(LoadedPage { url: final_url, html })
    }
}

#[derive(Debug, Clone)]
enum Canned {
    Page(String),
    Timeout,
    SessionLost,
}

/// Canned pages count as fully rendered, except for selectors marked absent.
struct CannedProbe<'a> {
    absent: &'a HashSet<String>,
}

#[async_trait]
impl PageProbe for CannedProbe<'_> {
    async fn present(&self, selector: &str) -> bool {
        !self.absent.contains(selector)
    }

    async fn settle(&self, _url: &str, _timeout: Duration) -> Result<bool, BrowserError> {
        Ok(true)
    }

    async fn scroll(&self, _url: &str, _distance_px: u32) -> Result<(), BrowserError> {
        Ok(())
    }
}

/// Serves canned HTML by URL. Unknown URLs fail navigation.
#[derive(Debug, Default)]
pub struct StaticPageLoader {
    pages: HashMap<String, Canned>,
    absent: HashSet<String>,
    loads: Mutex<Vec<(String, Vec<WaitStep>)>>,
}

impl StaticPageLoader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_page(mut self, url: impl Into<String>, html: impl Into<String>) -> Self {
        self.pages.insert(url.into(), Canned::Page(html.into()));
        self
    }

    pub fn with_timeout(mut self, url: impl Into<String>) -> Self {
        self.pages.insert(url.into(), Canned::Timeout);
        self
    }

    pub fn with_session_loss(mut self, url: impl Into<String>) -> Self {
        self.pages.insert(url.into(), Canned::SessionLost);
        self
    }

    /// `selector` never appears on any page, so waits for it time out.
    pub fn with_absent_selector(mut self, selector: impl Into<String>) -> Self {
        self.absent.insert(selector.into());
        self
    }

    pub fn visited(&self) -> Vec<String> {
        self.loads
            .lock()
            .map(|loads| loads.iter().map(|(url, _)| url.clone()).collect())
            .unwrap_or_default()
    }

    /// Wait steps passed with the most recent load of `url`.
    pub fn waits_for(&self, url: &str) -> Option<Vec<WaitStep>> {
        self.loads
            .lock()
            .ok()?
            .iter()
            .rev()
            .find(|(visited, _)| visited == url)
            .map(|(_, wait)| wait.clone())
    }
}

#[async_trait]
impl PageLoader for StaticPageLoader {
    async fn load(&self, url: &str, wait: &[WaitStep]) -> Result<LoadedPage, BrowserError> {
        if let Ok(mut loads) = self.loads.lock() {
            loads.push((url.to_string(), wait.to_vec()));
        }
        match self.pages.get(url) {
            Some(Canned::Page(html)) => {
                apply_wait_steps(&CannedProbe { absent: &self.absent }, url, wait).await?;
                Ok(LoadedPage {
                    url: url.to_string(),
                    html: html.clone(),
                })
            }
            Some(Canned::Timeout) => Err(BrowserError::Timeout {
                url: url.to_string(),
                secs: 45,
            }),
            Some(Canned::SessionLost) => Err(BrowserError::SessionLost("target crashed".into())),
            None => Err(BrowserError::Navigation {
                url: url.to_string(),
                message: "net::ERR_NAME_NOT_RESOLVED".into(),
            }),
        }
    }
}
