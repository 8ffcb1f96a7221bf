//! Expansion of a product into its product × region scrape targets.

use pricewatch_core::{ProductConfig, SwitchMechanism};
use reqwest::Url;

use crate::error::FetchError;
use crate::fetch::{FetchRequest, InPageSwitch};
use crate::region::RegionResolver;

/// One product × region pair, ready to hand to the fetch ladder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScrapeTarget {
    /// Raw token as configured; `None` for an ungeo-targeted scrape.
    pub region_token: Option<String>,
    /// Canonical code; `None` when the token did not resolve.
    pub region: Option<String>,
    pub url: String,
    pub switch: Option<InPageSwitch>,
}

impl ScrapeTarget {
    /// The request the ladder should make for this target.
    #[must_use]
    pub fn request(&self, capture_screenshot: bool) -> FetchRequest {
        FetchRequest {
            url: self.url.clone(),
            geo_region: self.region.clone(),
            switch: self.switch.clone(),
            capture_screenshot,
        }
    }

    /// Label used in log lines and debug file names.
    #[must_use]
    pub fn label(&self) -> &str {
        self.region_token.as_deref().unwrap_or("default")
    }
}

/// Targets for `product`, in configured region order.
///
/// A product without region tokens yields a single target at its base URL.
/// Resolution happens here so unresolved tokens are known before fetching;
/// they still produce a target.
///
/// # Errors
///
/// Returns [`FetchError::InvalidUrl`] when a `url-param` template cannot be
/// applied to the product URL.
pub fn plan_targets(
    product: &ProductConfig,
    resolver: &RegionResolver,
) -> Result<Vec<ScrapeTarget>, FetchError> {
    let tokens = product.region_tokens();
    if tokens.is_empty() {
        return Ok(vec![ScrapeTarget {
            region_token: None,
            region: None,
            url: product.url.clone(),
            switch: None,
        }]);
    }

    let switch = product.region_switch.as_ref();
    tokens
        .iter()
        .map(|token| {
            let region = resolver.resolve(token).into_code();
            let url = match (product.mechanism(), switch.and_then(|s| s.url_template.as_deref())) {
                (SwitchMechanism::UrlParam, Some(template)) => {
                    apply_template(&product.url, template, token)?
                }
                _ => product.url.clone(),
            };
            let in_page = switch
                .filter(|s| s.mechanism.is_in_page())
                .and_then(|s| s.selector.clone())
                .map(|switcher| InPageSwitch {
                    switcher,
                    token: token.clone(),
                });

            Ok(ScrapeTarget {
                region_token: Some(token.clone()),
                region,
                url,
                switch: in_page,
            })
        })
        .collect()
}

/// Substitute `token` into `template` and resolve it against `base_url`.
///
/// Both `{REGION}` and `{{REGION}}` are placeholders. A template starting
/// with `?` or `&` is appended to the base URL's query; an absolute URL is
/// used as-is; anything else is joined onto the base URL.
///
/// # Errors
///
/// Returns [`FetchError::InvalidUrl`] when the base URL does not parse or the
/// join fails.
pub fn apply_template(base_url: &str, template: &str, token: &str) -> Result<String, FetchError> {
    let filled = template
        .replace("{{REGION}}", token)
        .replace("{REGION}", token);

    if let Some(query) = filled.strip_prefix('?').or_else(|| filled.strip_prefix('&')) {
        let separator = if base_url.contains('?') { '&' } else { '?' };
        return Ok(format!("{base_url}{separator}{query}"));
    }

    if filled.starts_with("http://") || filled.starts_with("https://") {
        return Ok(filled);
    }

    let base = Url::parse(base_url).map_err(|e| FetchError::InvalidUrl {
        url: base_url.to_string(),
        reason: e.to_string(),
    })?;
    base.join(&filled)
        .map(String::from)
        .map_err(|e| FetchError::InvalidUrl {
            url: filled.clone(),
            reason: e.to_string(),
        })
}
