//! Escalating retry over fetch tiers.
//!
//! Attempt `n` (0-based) runs at `start` raised by `n` rungs, capped at
//! `top`. A failed attempt waits `backoff_base * 2^n` before the next one.
//! A page that loads but fails the caller's [`PageCheck`] counts as a failed
//! attempt too.

use std::convert::Infallible;
use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use pricewatch_core::{FetchTier, ProductConfig, Rendering, SwitchMechanism};
use thiserror::Error;

use super::{AttemptOutcome, FetchAttempt, FetchRequest, FetchedPage, PageFetcher};
use crate::error::FetchError;
use crate::rate_limit::{backoff_delay, Sleeper};

/// Run-wide inputs to [`LadderPolicy::for_product`].
#[derive(Debug, Clone, Copy)]
pub struct LadderSettings {
    /// Total attempts per pair.
    pub max_retries: u32,
    pub backoff_base: Duration,
    /// Operator override of the starting tier.
    pub tier_override: Option<FetchTier>,
    /// Proxy tier enabled for every product, not only proxy-switched ones.
    pub proxy_enabled: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LadderPolicy {
    pub start: FetchTier,
    pub top: FetchTier,
    pub max_attempts: u32,
    pub backoff_base: Duration,
}

impl LadderPolicy {
    /// `top` is raised to `start` if lower; `max_attempts` is at least 1.
    #[must_use]
    pub fn new(start: FetchTier, top: FetchTier, max_attempts: u32, backoff_base: Duration) -> Self {
        Self {
            start,
            top: top.max(start),
            max_attempts: max_attempts.max(1),
            backoff_base,
        }
    }

    /// Policy for one product.
    ///
    /// Dynamic pages and in-page region switches start at the rendered tier;
    /// everything else starts with plain HTTP. The proxied tier is the top
    /// only when the proxy is enabled or the product geo-targets through it.
    #[must_use]
    pub fn for_product(product: &ProductConfig, settings: &LadderSettings) -> Self {
        let needs_render =
            product.rendering == Rendering::Dynamic || product.mechanism().is_in_page();
        let default_start = if needs_render {
            FetchTier::Rendered
        } else {
            FetchTier::Plain
        };

        let mut start = settings.tier_override.unwrap_or(default_start);
        if product.mechanism().is_in_page() {
            start = start.max(FetchTier::Rendered);
        }

        let top = if settings.proxy_enabled || product.mechanism() == SwitchMechanism::Proxy {
            FetchTier::Proxied
        } else {
            FetchTier::Stealth
        };

        Self::new(start, top, settings.max_retries, settings.backoff_base)
    }

    #[must_use]
    pub fn tier_for(&self, attempt: u32) -> FetchTier {
        self.start.escalate(attempt, self.top)
    }

    /// Delay between a failed attempt `attempt` and the next one.
    #[must_use]
    pub fn backoff_after(&self, attempt: u32) -> Duration {
        backoff_delay(self.backoff_base, attempt)
    }

    /// Tier of every attempt, in order.
    #[must_use]
    pub fn plan(&self) -> Vec<FetchTier> {
        (0..self.max_attempts).map(|n| self.tier_for(n)).collect()
    }
}

#[derive(Debug)]
pub struct LadderSuccess {
    pub page: FetchedPage,
    pub attempts: Vec<FetchAttempt>,
}

/// Every attempt failed, or one failed in a way no retry can fix.
#[derive(Debug, Error)]
#[error("fetch failed after {} attempt(s): {last_error}", .attempts.len())]
pub struct LadderFailure {
    pub attempts: Vec<FetchAttempt>,
    #[source]
    pub last_error: FetchError,
}

impl LadderFailure {
    /// Highest tier reached before giving up.
    #[must_use]
    pub fn last_tier(&self) -> Option<FetchTier> {
        self.attempts.last().map(|a| a.tier)
    }
}

/// Decides whether a fetched page is usable.
#[async_trait]
pub trait PageCheck: Send + Sync {
    type Output: Send;
    type Rejection: fmt::Display + Send;

    async fn check(&self, page: &FetchedPage) -> Result<Self::Output, Self::Rejection>;
}

/// Accepts every page that loads.
struct AnyPage;

#[async_trait]
impl PageCheck for AnyPage {
    type Output = ();
    type Rejection = Infallible;

    async fn check(&self, _page: &FetchedPage) -> Result<(), Infallible> {
        Ok(())
    }
}

#[derive(Debug)]
pub struct CheckedSuccess<T> {
    pub page: FetchedPage,
    pub value: T,
    pub attempts: Vec<FetchAttempt>,
}

#[derive(Debug)]
pub enum CheckedFailure<R> {
    /// No attempt produced a page.
    Fetch(LadderFailure),
    /// At least one page loaded; the latest of them was rejected.
    Rejected {
        tier: FetchTier,
        rejection: R,
        attempts: Vec<FetchAttempt>,
    },
}

enum Miss<R> {
    Fetch(FetchError),
    Rejected(R),
}

/// Walks a [`LadderPolicy`] over a [`PageFetcher`].
pub struct FetchLadder<'a> {
    fetcher: &'a dyn PageFetcher,
    sleeper: &'a dyn Sleeper,
}

impl<'a> FetchLadder<'a> {
    #[must_use]
    pub fn new(fetcher: &'a dyn PageFetcher, sleeper: &'a dyn Sleeper) -> Self {
        Self { fetcher, sleeper }
    }

    /// Fetch `request`, escalating per `policy` until a tier succeeds.
    ///
    /// # Errors
    ///
    /// Returns [`LadderFailure`] carrying every attempt and the last error
    /// once the attempt budget is spent, or straight away on an error that
    /// retrying cannot fix.
    pub async fn fetch(
        &self,
        request: &FetchRequest,
        policy: &LadderPolicy,
    ) -> Result<LadderSuccess, LadderFailure> {
        match self.fetch_checked(request, policy, &AnyPage).await {
            Ok(done) => Ok(LadderSuccess {
                page: done.page,
                attempts: done.attempts,
            }),
            Err(CheckedFailure::Fetch(failure)) => Err(failure),
            Err(CheckedFailure::Rejected { rejection, .. }) => match rejection {},
        }
    }

    /// Like [`fetch`](Self::fetch), but a page only ends the ladder once
    /// `check` accepts it. Rejected pages cost an attempt and escalate.
    ///
    /// # Errors
    ///
    /// Returns [`CheckedFailure::Rejected`] when the budget runs out after
    /// any page loaded, else [`CheckedFailure::Fetch`].
    pub async fn fetch_checked<C: PageCheck>(
        &self,
        request: &FetchRequest,
        policy: &LadderPolicy,
        check: &C,
    ) -> Result<CheckedSuccess<C::Output>, CheckedFailure<C::Rejection>> {
        let mut attempts = Vec::new();
        let mut last_rejection: Option<(FetchTier, C::Rejection)> = None;
        let mut attempt = 0u32;

        loop {
            let tier = policy.tier_for(attempt);
            tracing::debug!(url = %request.url, attempt, tier = %tier, "fetch attempt");

            let miss = match self.fetcher.fetch(request, tier).await {
                Ok(page) => match check.check(&page).await {
                    Ok(value) => {
                        tracing::info!(
                            url = %request.url,
                            attempt,
                            tier = %tier,
                            waited_secs = page.challenge_wait.as_secs(),
                            "fetch succeeded"
                        );
                        attempts.push(record(
                            request,
                            attempt,
                            tier,
                            AttemptOutcome::Succeeded,
                            page.challenge_wait,
                        ));
                        return Ok(CheckedSuccess {
                            page,
                            value,
                            attempts,
                        });
                    }
                    Err(rejection) => {
                        attempts.push(record(
                            request,
                            attempt,
                            tier,
                            AttemptOutcome::Failed(format!("page rejected: {rejection}")),
                            page.challenge_wait,
                        ));
                        Miss::Rejected(rejection)
                    }
                },
                Err(err) => {
                    let challenge_wait = match &err {
                        FetchError::ChallengeTimeout { waited_secs, .. } => {
                            Duration::from_secs(*waited_secs)
                        }
                        _ => Duration::ZERO,
                    };
                    attempts.push(record(
                        request,
                        attempt,
                        tier,
                        AttemptOutcome::Failed(err.to_string()),
                        challenge_wait,
                    ));
                    Miss::Fetch(err)
                }
            };

            let reason = match &miss {
                Miss::Fetch(err) => err.to_string(),
                Miss::Rejected(rejection) => format!("page rejected: {rejection}"),
            };
            let fatal = matches!(&miss, Miss::Fetch(err) if !err.is_retriable());

            if fatal || attempt + 1 >= policy.max_attempts {
                tracing::warn!(
                    url = %request.url,
                    attempts = attempt + 1,
                    tier = %tier,
                    error = %reason,
                    "fetch ladder exhausted"
                );
                return Err(match (miss, last_rejection) {
                    (Miss::Rejected(rejection), _) => CheckedFailure::Rejected {
                        tier,
                        rejection,
                        attempts,
                    },
                    (Miss::Fetch(_), Some((tier, rejection))) => CheckedFailure::Rejected {
                        tier,
                        rejection,
                        attempts,
                    },
                    (Miss::Fetch(last_error), None) => CheckedFailure::Fetch(LadderFailure {
                        attempts,
                        last_error,
                    }),
                });
            }

            if let Miss::Rejected(rejection) = miss {
                last_rejection = Some((tier, rejection));
            }

            let delay = policy.backoff_after(attempt);
            tracing::warn!(
                url = %request.url,
                attempt,
                tier = %tier,
                next_tier = %policy.tier_for(attempt + 1),
                delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                error = %reason,
                "fetch attempt failed; backing off"
            );
            self.sleeper.sleep(delay).await;
            attempt += 1;
        }
    }
}

fn record(
    request: &FetchRequest,
    attempt: u32,
    tier: FetchTier,
    outcome: AttemptOutcome,
    challenge_wait: Duration,
) -> FetchAttempt {
    FetchAttempt {
        attempt,
        tier,
        url: request.url.clone(),
        region: request.geo_region.clone(),
        outcome,
        challenge_wait,
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use async_trait::async_trait;
    use pricewatch_core::{RegionSwitch, SelectorSet};

    use super::*;
    use crate::rate_limit::RecordingSleeper;

    /// Fails every tier below `succeed_at`; never succeeds when `None`.
    struct ScriptedFetcher {
        succeed_at: Option<FetchTier>,
        error: fn(&str) -> FetchError,
        calls: Mutex<Vec<FetchTier>>,
    }

    impl ScriptedFetcher {
        fn new(succeed_at: Option<FetchTier>) -> Self {
            Self {
                succeed_at,
                error: |url| FetchError::Blocked {
                    url: url.to_string(),
                    marker: "you have been blocked".to_string(),
                },
                calls: Mutex::new(Vec::new()),
            }
        }

        fn calls(&self) -> Vec<FetchTier> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl PageFetcher for ScriptedFetcher {
        async fn fetch(
            &self,
            request: &FetchRequest,
            tier: FetchTier,
        ) -> Result<FetchedPage, FetchError> {
            self.calls.lock().unwrap().push(tier);
            match self.succeed_at {
                Some(ok) if tier >= ok => Ok(FetchedPage {
                    url: request.url.clone(),
                    html: "<p>$1</p>".to_string(),
                    screenshot: None,
                    tier,
                    challenge_wait: Duration::ZERO,
                }),
                _ => Err((self.error)(&request.url)),
            }
        }
    }

    fn policy(start: FetchTier, top: FetchTier, attempts: u32) -> LadderPolicy {
        LadderPolicy::new(start, top, attempts, Duration::from_millis(1000))
    }

    fn settings() -> LadderSettings {
        LadderSettings {
            max_retries: 3,
            backoff_base: Duration::from_millis(1000),
            tier_override: None,
            proxy_enabled: false,
        }
    }

    fn product() -> ProductConfig {
        ProductConfig::new("Example", "https://example.test/pricing", SelectorSet::price_only("#p"))
    }

    #[test]
    fn plan_walks_up_and_stays_at_top() {
        let p = policy(FetchTier::Plain, FetchTier::Proxied, 5);
        assert_eq!(
            p.plan(),
            vec![
                FetchTier::Plain,
                FetchTier::Rendered,
                FetchTier::Stealth,
                FetchTier::Proxied,
                FetchTier::Proxied,
            ]
        );
    }

    #[test]
    fn backoff_doubles_from_base() {
        let p = policy(FetchTier::Plain, FetchTier::Proxied, 5);
        assert_eq!(p.backoff_after(0), Duration::from_millis(1000));
        assert_eq!(p.backoff_after(1), Duration::from_millis(2000));
        assert_eq!(p.backoff_after(2), Duration::from_millis(4000));
    }

    #[test]
    fn zero_attempts_means_one() {
        assert_eq!(policy(FetchTier::Plain, FetchTier::Stealth, 0).max_attempts, 1);
    }

    #[test]
    fn static_product_starts_plain_and_tops_at_stealth() {
        let p = LadderPolicy::for_product(&product(), &settings());
        assert_eq!(p.start, FetchTier::Plain);
        assert_eq!(p.top, FetchTier::Stealth);
    }

    #[test]
    fn dynamic_product_starts_rendered() {
        let mut prod = product();
        prod.rendering = Rendering::Dynamic;
        assert_eq!(
            LadderPolicy::for_product(&prod, &settings()).start,
            FetchTier::Rendered
        );
    }

    #[test]
    fn in_page_switch_never_starts_plain() {
        let mut prod = product();
        prod.region_switch = Some(RegionSwitch {
            mechanism: SwitchMechanism::Dropdown,
            selector: Some("#region".to_string()),
            regions: vec!["de".to_string()],
            url_template: None,
        });
        let s = LadderSettings {
            tier_override: Some(FetchTier::Plain),
            ..settings()
        };
        assert_eq!(LadderPolicy::for_product(&prod, &s).start, FetchTier::Rendered);
    }

    #[test]
    fn proxy_mechanism_or_flag_enables_top_tier() {
        let mut prod = product();
        prod.region_switch = Some(RegionSwitch {
            mechanism: SwitchMechanism::Proxy,
            ..RegionSwitch::default()
        });
        assert_eq!(
            LadderPolicy::for_product(&prod, &settings()).top,
            FetchTier::Proxied
        );

        let s = LadderSettings {
            proxy_enabled: true,
            ..settings()
        };
        assert_eq!(
            LadderPolicy::for_product(&product(), &s).top,
            FetchTier::Proxied
        );
    }

    #[test]
    fn tier_override_sets_start() {
        let s = LadderSettings {
            tier_override: Some(FetchTier::Stealth),
            ..settings()
        };
        assert_eq!(
            LadderPolicy::for_product(&product(), &s).start,
            FetchTier::Stealth
        );
    }

    #[tokio::test]
    async fn first_success_short_circuits() {
        let fetcher = ScriptedFetcher::new(Some(FetchTier::Plain));
        let sleeper = RecordingSleeper::new();
        let ladder = FetchLadder::new(&fetcher, &sleeper);
        let ok = ladder
            .fetch(
                &FetchRequest::new("https://example.test"),
                &policy(FetchTier::Plain, FetchTier::Proxied, 4),
            )
            .await
            .unwrap();
        assert_eq!(ok.page.tier, FetchTier::Plain);
        assert_eq!(fetcher.calls(), vec![FetchTier::Plain]);
        assert!(sleeper.calls().is_empty());
    }

    #[tokio::test]
    async fn escalates_until_a_tier_succeeds() {
        let fetcher = ScriptedFetcher::new(Some(FetchTier::Stealth));
        let sleeper = RecordingSleeper::new();
        let ladder = FetchLadder::new(&fetcher, &sleeper);
        let ok = ladder
            .fetch(
                &FetchRequest::new("https://example.test"),
                &policy(FetchTier::Plain, FetchTier::Proxied, 4),
            )
            .await
            .unwrap();
        assert_eq!(ok.page.tier, FetchTier::Stealth);
        assert_eq!(ok.attempts.len(), 3);
        assert_eq!(ok.attempts[2].outcome, AttemptOutcome::Succeeded);
        assert_eq!(
            sleeper.calls(),
            vec![Duration::from_millis(1000), Duration::from_millis(2000)]
        );
    }

    #[tokio::test]
    async fn exhausted_budget_reports_every_attempt() {
        let fetcher = ScriptedFetcher::new(None);
        let sleeper = RecordingSleeper::new();
        let ladder = FetchLadder::new(&fetcher, &sleeper);
        let err = ladder
            .fetch(
                &FetchRequest::new("https://example.test"),
                &policy(FetchTier::Plain, FetchTier::Proxied, 4),
            )
            .await
            .unwrap_err();
        assert_eq!(err.attempts.len(), 4);
        assert_eq!(err.last_tier(), Some(FetchTier::Proxied));
        assert!(matches!(err.last_error, FetchError::Blocked { .. }));
        assert_eq!(sleeper.calls().len(), 3);
        assert_eq!(
            fetcher.calls(),
            vec![
                FetchTier::Plain,
                FetchTier::Rendered,
                FetchTier::Stealth,
                FetchTier::Proxied
            ]
        );
    }

    #[tokio::test]
    async fn non_retriable_error_stops_immediately() {
        let mut fetcher = ScriptedFetcher::new(None);
        fetcher.error = |url| FetchError::InvalidUrl {
            url: url.to_string(),
            reason: "relative URL without a base".to_string(),
        };
        let sleeper = RecordingSleeper::new();
        let ladder = FetchLadder::new(&fetcher, &sleeper);
        let err = ladder
            .fetch(
                &FetchRequest::new("pricing"),
                &policy(FetchTier::Plain, FetchTier::Proxied, 4),
            )
            .await
            .unwrap_err();
        assert_eq!(err.attempts.len(), 1);
        assert!(sleeper.calls().is_empty());
    }

    /// Loads at every tier; only pages from `priced_from` upward carry a price.
    struct ShellFetcher {
        priced_from: FetchTier,
        fail_at: Option<FetchTier>,
        calls: Mutex<Vec<FetchTier>>,
    }

    impl ShellFetcher {
        fn new(priced_from: FetchTier) -> Self {
            Self {
                priced_from,
                fail_at: None,
                calls: Mutex::new(Vec::new()),
            }
        }

        fn calls(&self) -> Vec<FetchTier> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl PageFetcher for ShellFetcher {
        async fn fetch(
            &self,
            request: &FetchRequest,
            tier: FetchTier,
        ) -> Result<FetchedPage, FetchError> {
            self.calls.lock().unwrap().push(tier);
            if self.fail_at.is_some_and(|t| tier >= t) {
                return Err(FetchError::UnexpectedStatus {
                    url: request.url.clone(),
                    status: 503,
                });
            }
            let html = if tier >= self.priced_from {
                "<span class=\"price\">$12.99</span>"
            } else {
                "<div id=\"root\"></div><script src=\"/app.js\"></script>"
            };
            Ok(FetchedPage {
                url: request.url.clone(),
                html: html.to_string(),
                screenshot: None,
                tier,
                challenge_wait: Duration::ZERO,
            })
        }
    }

    struct HasPrice;

    #[async_trait]
    impl PageCheck for HasPrice {
        type Output = usize;
        type Rejection = String;

        async fn check(&self, page: &FetchedPage) -> Result<usize, String> {
            page.html
                .find('$')
                .ok_or_else(|| "no price on page".to_string())
        }
    }

    #[tokio::test]
    async fn rejected_page_backs_off_and_escalates() {
        let fetcher = ShellFetcher::new(FetchTier::Rendered);
        let sleeper = RecordingSleeper::new();
        let ladder = FetchLadder::new(&fetcher, &sleeper);
        let ok = ladder
            .fetch_checked(
                &FetchRequest::new("https://example.test"),
                &policy(FetchTier::Plain, FetchTier::Stealth, 3),
                &HasPrice,
            )
            .await
            .unwrap();
        assert_eq!(ok.page.tier, FetchTier::Rendered);
        assert_eq!(fetcher.calls(), vec![FetchTier::Plain, FetchTier::Rendered]);
        assert_eq!(sleeper.calls(), vec![Duration::from_millis(1000)]);
        assert_eq!(
            ok.attempts[0].outcome,
            AttemptOutcome::Failed("page rejected: no price on page".to_string())
        );
        assert_eq!(ok.attempts[1].outcome, AttemptOutcome::Succeeded);
    }

    #[tokio::test]
    async fn rejections_spend_the_whole_budget() {
        let fetcher = ShellFetcher::new(FetchTier::Proxied);
        let sleeper = RecordingSleeper::new();
        let ladder = FetchLadder::new(&fetcher, &sleeper);
        let err = ladder
            .fetch_checked(
                &FetchRequest::new("https://example.test"),
                &policy(FetchTier::Plain, FetchTier::Stealth, 3),
                &HasPrice,
            )
            .await
            .unwrap_err();
        let CheckedFailure::Rejected {
            tier,
            rejection,
            attempts,
        } = err
        else {
            panic!("expected a rejected page");
        };
        assert_eq!(tier, FetchTier::Stealth);
        assert_eq!(rejection, "no price on page");
        assert_eq!(attempts.len(), 3);
        assert_eq!(sleeper.calls().len(), 2);
    }

    #[tokio::test]
    async fn loaded_but_rejected_page_outranks_later_fetch_errors() {
        let mut fetcher = ShellFetcher::new(FetchTier::Proxied);
        fetcher.fail_at = Some(FetchTier::Rendered);
        let sleeper = RecordingSleeper::new();
        let ladder = FetchLadder::new(&fetcher, &sleeper);
        let err = ladder
            .fetch_checked(
                &FetchRequest::new("https://example.test"),
                &policy(FetchTier::Plain, FetchTier::Stealth, 3),
                &HasPrice,
            )
            .await
            .unwrap_err();
        let CheckedFailure::Rejected { tier, attempts, .. } = err else {
            panic!("expected the earlier rejection to be reported");
        };
        assert_eq!(tier, FetchTier::Plain);
        assert_eq!(attempts.len(), 3);
    }
}
