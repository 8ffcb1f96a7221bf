//! Page fetching: the individual tiers and the escalation ladder over them.

pub mod browser;
pub mod ladder;
pub mod plain;

use std::time::Duration;

use async_trait::async_trait;
use pricewatch_core::FetchTier;

use crate::error::FetchError;

pub use browser::{find_chromium, BrowserFetcher, BrowserOptions};
pub use ladder::{
    CheckedFailure, CheckedSuccess, FetchLadder, LadderFailure, LadderPolicy, LadderSettings,
    LadderSuccess, PageCheck,
};
pub use plain::PlainFetcher;

/// Click-through region selection on a rendered page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InPageSwitch {
    /// Locator of the control that opens the region picker.
    pub switcher: String,
    /// Region token to pick.
    pub token: String,
}

/// What to fetch for one product × region pair.
#[derive(Debug, Clone, Default)]
pub struct FetchRequest {
    pub url: String,
    /// Canonical region code the proxied tier pins its exit node to.
    pub geo_region: Option<String>,
    pub switch: Option<InPageSwitch>,
    /// Capture a screenshot in rendered tiers (needed by the vision tier).
    pub capture_screenshot: bool,
}

impl FetchRequest {
    #[must_use]
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Self::default()
        }
    }
}

/// A page that loaded and settled in the normal state.
#[derive(Debug, Clone)]
pub struct FetchedPage {
    /// Final URL after redirects.
    pub url: String,
    pub html: String,
    /// PNG bytes, rendered tiers only.
    pub screenshot: Option<Vec<u8>>,
    pub tier: FetchTier,
    pub challenge_wait: Duration,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttemptOutcome {
    Succeeded,
    Failed(String),
}

/// Record of one ladder attempt.
#[derive(Debug, Clone)]
pub struct FetchAttempt {
    /// 0-based attempt index.
    pub attempt: u32,
    pub tier: FetchTier,
    pub url: String,
    pub region: Option<String>,
    pub outcome: AttemptOutcome,
    pub challenge_wait: Duration,
}

/// One fetch at a given tier.
///
/// Implementations own any browser session for the duration of the call and
/// tear it down before returning.
#[async_trait]
pub trait PageFetcher: Send + Sync {
    async fn fetch(&self, request: &FetchRequest, tier: FetchTier)
        -> Result<FetchedPage, FetchError>;
}

/// Dispatches the plain tier to HTTP and the rendered tiers to a browser.
pub struct TieredFetcher {
    plain: PlainFetcher,
    browser: Option<BrowserFetcher>,
}

impl TieredFetcher {
    #[must_use]
    pub fn new(plain: PlainFetcher, browser: Option<BrowserFetcher>) -> Self {
        Self { plain, browser }
    }
}

#[async_trait]
impl PageFetcher for TieredFetcher {
    async fn fetch(
        &self,
        request: &FetchRequest,
        tier: FetchTier,
    ) -> Result<FetchedPage, FetchError> {
        if tier == FetchTier::Plain && request.switch.is_none() {
            return self.plain.get(&request.url).await;
        }

        let Some(browser) = &self.browser else {
            return Err(FetchError::Browser(format!(
                "tier {tier} needs a browser but none is available"
            )));
        };

        // An in-page switch cannot run over plain HTTP.
        let tier = if tier == FetchTier::Plain {
            FetchTier::Rendered
        } else {
            tier
        };
        browser.fetch(request, tier).await
    }
}
