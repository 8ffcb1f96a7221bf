//! Rendered tiers over a locally launched Chromium.
//!
//! Every fetch launches its own browser and closes it before returning, so
//! no cookies or challenge state leak from one attempt into the next.

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use chromiumoxide::auth::Credentials;
use chromiumoxide::browser::{Browser, BrowserConfig};
use chromiumoxide::cdp::browser_protocol::page::{
    AddScriptToEvaluateOnNewDocumentParams, CaptureScreenshotFormat,
};
use chromiumoxide::layout::Point;
use chromiumoxide::page::{Page, ScreenshotParams};
use futures::StreamExt;
use pricewatch_core::{AppConfig, FetchTier, ProxySettings};
use serde::Deserialize;
use tokio::task::JoinHandle;

use super::{FetchRequest, FetchedPage, InPageSwitch, PageFetcher};
use crate::challenge::{ChallengeResolver, LivePage, PageSnapshot};
use crate::error::FetchError;
use crate::extract::pattern::contains_price;
use crate::rate_limit::{jitter_between, TokioSleeper};

const BASE_ARGS: &[&str] = &["--disable-dev-shm-usage", "--no-sandbox"];
const STEALTH_ARGS: &[&str] = &[
    "--disable-blink-features=AutomationControlled",
    "--disable-infobars",
    "--no-first-run",
    "--no-default-browser-check",
];

const VIEWPORTS: &[(u32, u32)] = &[(1366, 768), (1440, 900), (1536, 864), (1920, 1080)];

/// Locators of verification widgets, most specific first. Clicks land near
/// the widget's left edge where the checkbox sits.
const VERIFY_CANDIDATES: &[&str] = &[
    "iframe[src*='challenges.cloudflare']",
    "[data-turnstile-widget]",
    ".cf-turnstile",
    "#cf-turnstile-response",
    "input[type='checkbox']",
];

/// Attribute locators tried after an exact-text match when picking a region.
const REGION_OPTION_ATTRS: &[&str] = &["data-region", "data-value", "data-country"];

const BODY_TEXT_JS: &str = "document.body ? document.body.innerText : ''";

const SCROLL_TO_FRAGMENT_JS: &str = r"(() => {
  const hash = window.location.hash;
  if (hash && hash.length > 1) {
    const target = document.getElementById(decodeURIComponent(hash.slice(1)));
    if (target) { target.scrollIntoView(); }
  }
  window.scrollTo(0, document.body ? document.body.scrollHeight : 0);
  return true;
})()";

const SCROLL_TOP_JS: &str = "window.scrollTo(0, 0); true";

const PRICE_POLL: Duration = Duration::from_millis(500);

/// Find a Chromium binary: the configured path if it exists, else the
/// usual executable names on `PATH`.
#[must_use]
pub fn find_chromium(configured: Option<&Path>) -> Option<PathBuf> {
    if let Some(path) = configured {
        if path.exists() {
            return Some(path.to_path_buf());
        }
        tracing::warn!(path = %path.display(), "configured Chromium path does not exist");
    }

    ["google-chrome", "google-chrome-stable", "chromium", "chromium-browser"]
        .into_iter()
        .find_map(|name| which::which(name).ok())
}

#[derive(Debug, Clone)]
pub struct BrowserOptions {
    pub chrome_path: Option<PathBuf>,
    pub user_agent: String,
    /// Run with a visible window and click verification widgets.
    pub visible: bool,
    pub nav_timeout: Duration,
    pub price_wait: Duration,
    pub challenge_poll: Duration,
    pub challenge_max_wait: Duration,
    pub challenge_visible_max_wait: Duration,
    pub proxy: Option<ProxySettings>,
}

impl BrowserOptions {
    #[must_use]
    pub fn from_config(config: &AppConfig, visible: bool) -> Self {
        Self {
            chrome_path: config.chrome_path.clone(),
            user_agent: config.user_agent.clone(),
            visible,
            nav_timeout: Duration::from_secs(config.nav_timeout_secs),
            price_wait: Duration::from_secs(config.price_wait_secs),
            challenge_poll: Duration::from_millis(config.challenge_poll_ms),
            challenge_max_wait: Duration::from_secs(config.challenge_max_wait_secs),
            challenge_visible_max_wait: Duration::from_secs(config.challenge_visible_max_wait_secs),
            proxy: config.proxy.clone(),
        }
    }

    fn resolver(&self) -> ChallengeResolver {
        let max_wait = if self.visible {
            self.challenge_visible_max_wait
        } else {
            self.challenge_max_wait
        };
        ChallengeResolver::new(self.challenge_poll, max_wait).interactive(self.visible)
    }
}

/// Fetches the rendered, stealth and proxied tiers.
#[derive(Debug, Clone)]
pub struct BrowserFetcher {
    options: BrowserOptions,
    executable: PathBuf,
}

impl BrowserFetcher {
    /// # Errors
    ///
    /// Returns [`FetchError::Browser`] when no Chromium executable is found.
    pub fn new(options: BrowserOptions) -> Result<Self, FetchError> {
        let executable = find_chromium(options.chrome_path.as_deref()).ok_or_else(|| {
            FetchError::Browser(
                "no Chromium executable found; set PRICEWATCH_CHROME_PATH".to_string(),
            )
        })?;
        Ok(Self {
            options,
            executable,
        })
    }

    fn proxy_for(&self, request: &FetchRequest) -> Result<(String, Credentials), FetchError> {
        let proxy = self.options.proxy.as_ref().ok_or_else(|| {
            FetchError::ProxyUnavailable(
                "proxied tier requested but no proxy credentials are configured".to_string(),
            )
        })?;
        let username = request
            .geo_region
            .as_deref()
            .map_or_else(|| proxy.username.clone(), |region| proxy.username_for(region));
        Ok((
            proxy.server(),
            Credentials {
                username,
                password: proxy.password.clone(),
            },
        ))
    }

    async fn drive(
        &self,
        page: &Page,
        request: &FetchRequest,
        tier: FetchTier,
    ) -> Result<FetchedPage, FetchError> {
        navigate(page, &request.url, self.options.nav_timeout).await?;

        let mut live = BrowserLivePage { page: page.clone() };
        let settled = self
            .options
            .resolver()
            .resolve(&mut live, &TokioSleeper, &request.url)
            .await?;

        if let Some(switch) = &request.switch {
            select_region(page, switch).await?;
        }

        settle(page, self.options.price_wait).await;

        let html = page
            .content()
            .await
            .map_err(|e| FetchError::Browser(format!("failed to read page content: {e}")))?;

        let screenshot = if request.capture_screenshot {
            match capture_screenshot(page).await {
                Ok(bytes) => Some(bytes),
                Err(e) => {
                    tracing::debug!(url = %request.url, error = %e, "screenshot failed");
                    None
                }
            }
        } else {
            None
        };

        let url = page
            .url()
            .await
            .ok()
            .flatten()
            .unwrap_or_else(|| request.url.clone());

        Ok(FetchedPage {
            url,
            html,
            screenshot,
            tier,
            challenge_wait: settled.waited,
        })
    }
}

#[async_trait]
impl PageFetcher for BrowserFetcher {
    async fn fetch(
        &self,
        request: &FetchRequest,
        tier: FetchTier,
    ) -> Result<FetchedPage, FetchError> {
        let proxy = if tier == FetchTier::Proxied {
            Some(self.proxy_for(request)?)
        } else {
            None
        };

        let session = BrowserSession::launch(&self.executable, &self.options, tier, proxy).await?;
        let result = self.drive(&session.page, request, tier).await;
        session.shutdown().await;
        result
    }
}

struct BrowserSession {
    browser: Browser,
    handler: JoinHandle<()>,
    page: Page,
}

impl BrowserSession {
    async fn launch(
        executable: &Path,
        options: &BrowserOptions,
        tier: FetchTier,
        proxy: Option<(String, Credentials)>,
    ) -> Result<Self, FetchError> {
        let stealth = tier >= FetchTier::Stealth;

        let mut builder = BrowserConfig::builder()
            .chrome_executable(executable)
            .request_timeout(options.nav_timeout)
            .args(BASE_ARGS.iter().copied());
        if stealth {
            let (width, height) = VIEWPORTS[rand::random_range(0..VIEWPORTS.len())];
            builder = builder
                .args(STEALTH_ARGS.iter().copied())
                .window_size(width, height);
        }
        if options.visible {
            builder = builder.with_head();
        }
        let credentials = match proxy {
            Some((server, credentials)) => {
                builder = builder.arg(format!("--proxy-server={server}"));
                Some(credentials)
            }
            None => None,
        };
        let config = builder
            .build()
            .map_err(|e| FetchError::Browser(format!("failed to build browser config: {e}")))?;

        let (browser, mut handler) = Browser::launch(config)
            .await
            .map_err(|e| FetchError::Browser(format!("failed to launch Chromium: {e}")))?;
        let handler = tokio::spawn(async move { while handler.next().await.is_some() {} });

        let page = match Self::open_page(&browser, options, stealth, credentials).await {
            Ok(page) => page,
            Err(e) => {
                let mut browser = browser;
                if let Err(close_err) = browser.close().await {
                    tracing::debug!(error = %close_err, "browser close failed");
                }
                handler.abort();
                return Err(e);
            }
        };

        tracing::debug!(tier = %tier, visible = options.visible, "browser launched");
        Ok(Self {
            browser,
            handler,
            page,
        })
    }

    async fn open_page(
        browser: &Browser,
        options: &BrowserOptions,
        stealth: bool,
        credentials: Option<Credentials>,
    ) -> Result<Page, FetchError> {
        let page = browser
            .new_page("about:blank")
            .await
            .map_err(|e| FetchError::Browser(format!("failed to open page: {e}")))?;

        if let Some(credentials) = credentials {
            page.authenticate(credentials)
                .await
                .map_err(|e| FetchError::ProxyUnavailable(format!("proxy auth setup failed: {e}")))?;
        }

        if stealth {
            page.enable_stealth_mode_with_agent(&options.user_agent)
                .await
                .map_err(|e| FetchError::Browser(format!("failed to enable stealth: {e}")))?;
            page.execute(AddScriptToEvaluateOnNewDocumentParams::new(stealth_script()))
                .await
                .map_err(|e| FetchError::Browser(format!("failed to inject stealth script: {e}")))?;
        } else {
            page.set_user_agent(&options.user_agent)
                .await
                .map_err(|e| FetchError::Browser(format!("failed to set user agent: {e}")))?;
        }

        Ok(page)
    }

    async fn shutdown(mut self) {
        if let Err(e) = self.browser.close().await {
            tracing::debug!(error = %e, "browser close failed");
        }
        if let Err(e) = self.browser.wait().await {
            tracing::debug!(error = %e, "browser wait failed");
        }
        self.handler.abort();
    }
}

/// Extra fingerprint patches, randomized per launch.
fn stealth_script() -> String {
    let cores = [4, 8, 12, 16][rand::random_range(0..4usize)];
    format!(
        r"Object.defineProperty(navigator, 'webdriver', {{ get: () => undefined }});
Object.defineProperty(navigator, 'languages', {{ get: () => ['en-US', 'en'] }});
Object.defineProperty(navigator, 'plugins', {{ get: () => [1, 2, 3, 4, 5] }});
Object.defineProperty(navigator, 'hardwareConcurrency', {{ get: () => {cores} }});
window.chrome = window.chrome || {{ runtime: {{}} }};"
    )
}

async fn navigate(page: &Page, url: &str, timeout: Duration) -> Result<(), FetchError> {
    match tokio::time::timeout(timeout, page.goto(url)).await {
        Ok(Ok(_)) => {}
        Ok(Err(e)) => return Err(FetchError::Browser(format!("navigation to {url} failed: {e}"))),
        Err(_) => {
            return Err(FetchError::Browser(format!(
                "navigation to {url} timed out after {}s",
                timeout.as_secs()
            )))
        }
    }
    if tokio::time::timeout(timeout, page.wait_for_navigation())
        .await
        .is_err()
    {
        tracing::debug!(url, "page did not report load completion; continuing");
    }
    Ok(())
}

/// Scroll to trigger lazy content, wait (bounded) for price-shaped text,
/// then pause briefly.
async fn settle(page: &Page, price_wait: Duration) {
    if let Err(e) = page.evaluate(SCROLL_TO_FRAGMENT_JS).await {
        tracing::debug!(error = %e, "scroll failed");
    }
    tokio::time::sleep(Duration::from_millis(800)).await;
    if let Err(e) = page.evaluate(SCROLL_TOP_JS).await {
        tracing::debug!(error = %e, "scroll failed");
    }

    let deadline = tokio::time::Instant::now() + price_wait;
    loop {
        let text = body_text(page).await.unwrap_or_default();
        if contains_price(&text) {
            break;
        }
        if tokio::time::Instant::now() >= deadline {
            tracing::debug!(
                wait_secs = price_wait.as_secs(),
                "no price-shaped text appeared; extracting anyway"
            );
            break;
        }
        tokio::time::sleep(PRICE_POLL).await;
    }

    tokio::time::sleep(jitter_between(
        Duration::from_millis(500),
        Duration::from_millis(1500),
    ))
    .await;
}

async fn body_text(page: &Page) -> Result<String, FetchError> {
    page.evaluate(BODY_TEXT_JS)
        .await
        .map_err(|e| FetchError::Browser(e.to_string()))?
        .into_value::<String>()
        .map_err(|e| FetchError::Browser(e.to_string()))
}

/// Open the region picker and choose `switch.token`.
async fn select_region(page: &Page, switch: &InPageSwitch) -> Result<(), FetchError> {
    let switcher = page.find_element(switch.switcher.as_str()).await.map_err(|e| {
        FetchError::Browser(format!("region switcher '{}' not found: {e}", switch.switcher))
    })?;
    switcher
        .click()
        .await
        .map_err(|e| FetchError::Browser(format!("failed to open region switcher: {e}")))?;
    tokio::time::sleep(Duration::from_millis(1000)).await;

    let token = serde_json::to_string(&switch.token)
        .map_err(|e| FetchError::Browser(format!("bad region token: {e}")))?;
    let by_text = format!(
        r#"(() => {{
  const want = {token}.trim().toLowerCase();
  const nodes = document.querySelectorAll('option, [role="option"], li, a, button, span, div');
  for (const el of nodes) {{
    if ((el.textContent || '').trim().toLowerCase() !== want) {{ continue; }}
    if (el.tagName === 'OPTION' && el.parentElement) {{
      el.parentElement.value = el.value;
      el.parentElement.dispatchEvent(new Event('change', {{ bubbles: true }}));
    }} else {{
      el.click();
    }}
    return true;
  }}
  return false;
}})()"#
    );

    let clicked = page
        .evaluate(by_text.as_str())
        .await
        .ok()
        .and_then(|v| v.into_value::<bool>().ok())
        .unwrap_or(false);

    let clicked = if clicked {
        true
    } else {
        let mut found = false;
        for attr in REGION_OPTION_ATTRS {
            let selector = format!("[{attr}={token}]");
            if let Ok(option) = page.find_element(selector.as_str()).await {
                if option.click().await.is_ok() {
                    found = true;
                    break;
                }
            }
        }
        found
    };

    if !clicked {
        return Err(FetchError::Browser(format!(
            "no region option matching '{}'",
            switch.token
        )));
    }

    tracing::debug!(token = %switch.token, "region selected in page");
    tokio::time::sleep(Duration::from_millis(1500)).await;
    Ok(())
}

async fn capture_screenshot(page: &Page) -> Result<Vec<u8>, FetchError> {
    let params = ScreenshotParams::builder()
        .format(CaptureScreenshotFormat::Png)
        .full_page(false)
        .build();
    page.screenshot(params)
        .await
        .map_err(|e| FetchError::Browser(format!("screenshot failed: {e}")))
}

#[derive(Debug, Deserialize)]
struct ClickTarget {
    x: f64,
    y: f64,
}

struct BrowserLivePage {
    page: Page,
}

#[async_trait]
impl LivePage for BrowserLivePage {
    async fn snapshot(&mut self) -> Result<PageSnapshot, FetchError> {
        let title = self
            .page
            .get_title()
            .await
            .map_err(|e| FetchError::Browser(format!("failed to read title: {e}")))?
            .unwrap_or_default();
        let html = self
            .page
            .content()
            .await
            .map_err(|e| FetchError::Browser(format!("failed to read page content: {e}")))?;
        Ok(PageSnapshot { title, html })
    }

    async fn try_interactive(&mut self) -> Result<bool, FetchError> {
        for selector in VERIFY_CANDIDATES {
            let locator = serde_json::to_string(selector)
                .map_err(|e| FetchError::Browser(e.to_string()))?;
            let js = format!(
                r"(() => {{
  const el = document.querySelector({locator});
  if (!el) {{ return null; }}
  const r = el.getBoundingClientRect();
  if (r.width === 0 || r.height === 0) {{ return null; }}
  return {{ x: r.left + Math.min(30, r.width / 2), y: r.top + r.height / 2 }};
}})()"
            );
            let target = self
                .page
                .evaluate(js.as_str())
                .await
                .ok()
                .and_then(|v| v.into_value::<Option<ClickTarget>>().ok())
                .flatten();

            if let Some(target) = target {
                self.page
                    .click(Point {
                        x: target.x,
                        y: target.y,
                    })
                    .await
                    .map_err(|e| FetchError::Browser(format!("verification click failed: {e}")))?;
                tracing::debug!(selector, "clicked verification widget");
                return Ok(true);
            }
        }
        Ok(false)
    }
}
