use std::time::Duration;

use pricewatch_core::FetchTier;
use reqwest::Client;

use super::FetchedPage;
use crate::challenge::{classify, PageSnapshot, PageState};
use crate::error::FetchError;

const ACCEPT_HTML: &str = "text/html,application/xhtml+xml,application/xml;q=0.9,*/*;q=0.8";
const ACCEPT_LANGUAGE: &str = "en-US,en;q=0.9";

/// Plain HTTP GET, no rendering.
///
/// A 2xx body is still classified: an interstitial becomes
/// [`FetchError::ChallengeServed`] and a block page [`FetchError::Blocked`],
/// since there is no browser here to wait either out.
#[derive(Debug, Clone)]
pub struct PlainFetcher {
    client: Client,
}

impl PlainFetcher {
    /// # Errors
    ///
    /// Returns [`FetchError::Http`] if the underlying `reqwest::Client`
    /// cannot be constructed.
    pub fn new(timeout_secs: u64, user_agent: &str) -> Result<Self, FetchError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .connect_timeout(Duration::from_secs(10))
            .user_agent(user_agent)
            .build()?;
        Ok(Self { client })
    }

    /// # Errors
    ///
    /// - [`FetchError::InvalidUrl`] when `url` does not parse.
    /// - [`FetchError::RateLimited`] on HTTP 429.
    /// - [`FetchError::ChallengeServed`] / [`FetchError::Blocked`] when the
    ///   body is an interstitial or block page, whatever the status.
    /// - [`FetchError::UnexpectedStatus`] for any other non-2xx status.
    /// - [`FetchError::Http`] on transport failure.
    pub async fn get(&self, url: &str) -> Result<FetchedPage, FetchError> {
        let parsed = reqwest::Url::parse(url).map_err(|e| FetchError::InvalidUrl {
            url: url.to_string(),
            reason: e.to_string(),
        })?;

        let response = self
            .client
            .get(parsed)
            .header(reqwest::header::ACCEPT, ACCEPT_HTML)
            .header(reqwest::header::ACCEPT_LANGUAGE, ACCEPT_LANGUAGE)
            .send()
            .await?;
        let status = response.status();
        let final_url = response.url().to_string();

        if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            let retry_after_secs = response
                .headers()
                .get(reqwest::header::RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(|s| s.trim().parse::<u64>().ok())
                .unwrap_or(60);
            return Err(FetchError::RateLimited {
                url: url.to_string(),
                retry_after_secs,
            });
        }

        let body = response.text().await?;
        let snapshot = PageSnapshot::from_html(body);

        match classify(&snapshot.title, &snapshot.html) {
            PageState::Blocked { marker } => {
                return Err(FetchError::Blocked {
                    url: url.to_string(),
                    marker,
                });
            }
            PageState::Challenge => {
                tracing::debug!(url, status = status.as_u16(), "plain fetch got a challenge page");
                return Err(FetchError::ChallengeServed {
                    url: url.to_string(),
                });
            }
            PageState::Normal => {}
        }

        if !status.is_success() {
            return Err(FetchError::UnexpectedStatus {
                status: status.as_u16(),
                url: url.to_string(),
            });
        }

        Ok(FetchedPage {
            url: final_url,
            html: snapshot.html,
            screenshot: None,
            tier: FetchTier::Plain,
            challenge_wait: Duration::ZERO,
        })
    }
}
