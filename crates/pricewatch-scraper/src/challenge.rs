//! Anti-bot interstitial detection and bounded waiting.
//!
//! [`classify`] inspects a page's title and markup. [`ChallengeResolver`]
//! polls a page through a [`LivePage`] until it settles, times out, or
//! turns out to be a hard block.

use std::sync::LazyLock;
use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;

use crate::error::FetchError;
use crate::rate_limit::Sleeper;

static TITLE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?is)<title[^>]*>(.*?)</title>").expect("valid regex"));

/// Title fragments of interstitials that clear on their own or with a click.
const CHALLENGE_TITLE_MARKERS: &[&str] = &[
    "just a moment",
    "checking your browser",
    "attention required",
    "verify you are human",
    "one more step",
];

/// Body fragments of hosted verification widgets and challenge scripts.
const CHALLENGE_BODY_MARKERS: &[&str] = &[
    "challenges.cloudflare.com",
    "/cdn-cgi/challenge-platform/",
    "cf-turnstile",
    "cf-chl-",
    "captcha-delivery.com",
    "px-captcha",
];

/// Title fragments of terminal block pages.
const BLOCKED_TITLE_MARKERS: &[&str] = &["access denied", "403 forbidden", "request blocked"];

/// Body fragments of terminal block pages.
const BLOCKED_BODY_MARKERS: &[&str] = &[
    "sorry, you have been blocked",
    "you have been blocked",
    "error code: 1020",
    "access to this page has been denied",
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PageState {
    Normal,
    Challenge,
    Blocked { marker: String },
}

/// Title and markup of a page at one point in time.
#[derive(Debug, Clone, Default)]
pub struct PageSnapshot {
    pub title: String,
    pub html: String,
}

impl PageSnapshot {
    /// Snapshot of a static response, with the title pulled from the markup.
    #[must_use]
    pub fn from_html(html: String) -> Self {
        Self {
            title: extract_title(&html).unwrap_or_default(),
            html,
        }
    }
}

/// Text of the first `<title>` element, whitespace-collapsed.
#[must_use]
pub fn extract_title(html: &str) -> Option<String> {
    TITLE_RE
        .captures(html)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().split_whitespace().collect::<Vec<_>>().join(" "))
}

/// Classify a page as normal, a challenge interstitial, or blocked.
///
/// Block markers are checked first: a block page often carries challenge
/// branding too, and must not be waited on.
#[must_use]
pub fn classify(title: &str, html: &str) -> PageState {
    let title = title.to_lowercase();
    let body = html.to_lowercase();

    if let Some(marker) = BLOCKED_TITLE_MARKERS
        .iter()
        .find(|m| title.contains(*m))
        .or_else(|| BLOCKED_BODY_MARKERS.iter().find(|m| body.contains(*m)))
    {
        return PageState::Blocked {
            marker: (*marker).to_string(),
        };
    }

    let challenged = CHALLENGE_TITLE_MARKERS.iter().any(|m| title.contains(m))
        || CHALLENGE_BODY_MARKERS.iter().any(|m| body.contains(m));
    if challenged {
        PageState::Challenge
    } else {
        PageState::Normal
    }
}

/// Live page the resolver can re-inspect and poke.
#[async_trait]
pub trait LivePage: Send {
    async fn snapshot(&mut self) -> Result<PageSnapshot, FetchError>;

    /// Try to click a verification control. Returns `true` if something
    /// was clicked.
    async fn try_interactive(&mut self) -> Result<bool, FetchError>;
}

/// Result of waiting out a page.
#[derive(Debug, Clone)]
pub struct Settled {
    pub snapshot: PageSnapshot,
    /// Time spent in the challenge state, counted in poll intervals.
    pub waited: Duration,
    pub polls: u32,
}

#[derive(Debug, Clone, Copy)]
pub struct ChallengeResolver {
    pub poll_interval: Duration,
    pub max_wait: Duration,
    pub interactive: bool,
}

impl ChallengeResolver {
    #[must_use]
    pub fn new(poll_interval: Duration, max_wait: Duration) -> Self {
        Self {
            poll_interval,
            max_wait,
            interactive: false,
        }
    }

    #[must_use]
    pub fn interactive(mut self, interactive: bool) -> Self {
        self.interactive = interactive;
        self
    }

    /// Poll `live` until the page is normal.
    ///
    /// # Errors
    ///
    /// - [`FetchError::Blocked`] as soon as a block page is seen.
    /// - [`FetchError::ChallengeTimeout`] once `max_wait` has elapsed while
    ///   the page is still a challenge.
    /// - Any error the page handle itself returns.
    pub async fn resolve(
        &self,
        live: &mut dyn LivePage,
        sleeper: &dyn Sleeper,
        url: &str,
    ) -> Result<Settled, FetchError> {
        let mut waited = Duration::ZERO;
        let mut polls = 0u32;

        loop {
            let snapshot = live.snapshot().await?;
            polls += 1;

            match classify(&snapshot.title, &snapshot.html) {
                PageState::Normal => {
                    if !waited.is_zero() {
                        tracing::info!(url, waited_secs = waited.as_secs(), "challenge cleared");
                    }
                    return Ok(Settled {
                        snapshot,
                        waited,
                        polls,
                    });
                }
                PageState::Blocked { marker } => {
                    tracing::warn!(url, marker = %marker, "page is blocked");
                    return Err(FetchError::Blocked {
                        url: url.to_string(),
                        marker,
                    });
                }
                PageState::Challenge => {
                    if waited >= self.max_wait {
                        tracing::warn!(
                            url,
                            waited_secs = waited.as_secs(),
                            "challenge did not clear in time"
                        );
                        return Err(FetchError::ChallengeTimeout {
                            url: url.to_string(),
                            waited_secs: waited.as_secs(),
                        });
                    }

                    if self.interactive {
                        match live.try_interactive().await {
                            Ok(true) => tracing::debug!(url, "clicked verification control"),
                            Ok(false) => tracing::debug!(url, "no verification control found"),
                            Err(e) => tracing::debug!(url, error = %e, "verification click failed"),
                        }
                    }

                    tracing::debug!(
                        url,
                        waited_secs = waited.as_secs(),
                        max_wait_secs = self.max_wait.as_secs(),
                        "challenge in progress"
                    );
                    sleeper.sleep(self.poll_interval).await;
                    waited += self.poll_interval;
                }
            }
        }
    }
}
