use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Rung of the fetch ladder, cheapest first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FetchTier {
    /// Plain HTTP request, no rendering.
    Plain,
    /// Headless browser without stealth patches.
    Rendered,
    /// Headless browser with fingerprint patches.
    Stealth,
    /// Stealth browser through a residential proxy pinned to the region.
    Proxied,
}

impl FetchTier {
    pub const ALL: [FetchTier; 4] = [
        FetchTier::Plain,
        FetchTier::Rendered,
        FetchTier::Stealth,
        FetchTier::Proxied,
    ];

    #[must_use]
    pub fn index(self) -> usize {
        match self {
            FetchTier::Plain => 0,
            FetchTier::Rendered => 1,
            FetchTier::Stealth => 2,
            FetchTier::Proxied => 3,
        }
    }

    /// The tier `steps` rungs above `self`, capped at `top`.
    #[must_use]
    pub fn escalate(self, steps: u32, top: FetchTier) -> FetchTier {
        let idx = usize::try_from(steps)
            .unwrap_or(usize::MAX)
            .saturating_add(self.index())
            .min(top.index());
        Self::ALL[idx]
    }

    #[must_use]
    pub fn renders(self) -> bool {
        self != FetchTier::Plain
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            FetchTier::Plain => "plain",
            FetchTier::Rendered => "rendered",
            FetchTier::Stealth => "stealth",
            FetchTier::Proxied => "proxied",
        }
    }
}

impl std::fmt::Display for FetchTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for FetchTier {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "plain" => Ok(FetchTier::Plain),
            "rendered" => Ok(FetchTier::Rendered),
            "stealth" => Ok(FetchTier::Stealth),
            "proxied" | "proxy" => Ok(FetchTier::Proxied),
            other => Err(format!(
                "unknown fetch tier '{other}'; expected plain, rendered, stealth, or proxied"
            )),
        }
    }
}

/// Extraction cascade stage that produced a price.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExtractionTier {
    Selector,
    Pattern,
    Vision,
}

impl ExtractionTier {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            ExtractionTier::Selector => "selector",
            ExtractionTier::Pattern => "pattern",
            ExtractionTier::Vision => "vision",
        }
    }
}

impl std::fmt::Display for ExtractionTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One emitted pricing data point for a product in a region.
///
/// Built through [`PriceObservation::succeeded`] or [`PriceObservation::failed`]
/// so that a successful observation always carries a positive amount and a
/// currency, and a failed one always carries `amount == 0.0` and a note.
///
/// Boundary note: `amount` is an `f64` at scrape time; persistence converts it
/// to `NUMERIC(12,2)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PriceObservation {
    pub id: Uuid,
    pub product_name: String,
    /// Raw token as configured for the product, if the scrape was geo-targeted.
    pub region_token: Option<String>,
    /// Canonical region code; `None` when the token could not be resolved.
    pub region: Option<String>,
    pub amount: f64,
    pub currency: String,
    pub period: String,
    pub plan_name: String,
    pub source_url: String,
    pub success: bool,
    pub notes: Option<String>,
    pub fetch_tier: Option<FetchTier>,
    pub extraction_tier: Option<ExtractionTier>,
    pub observed_at: DateTime<Utc>,
}

/// Fields shared by successful and failed observations.
#[derive(Debug, Clone)]
pub struct ObservationTarget {
    pub product_name: String,
    pub region_token: Option<String>,
    pub region: Option<String>,
    pub plan_name: String,
    pub source_url: String,
}

impl PriceObservation {
    /// A successful observation, with `amount` rounded to cents half away
    /// from zero, matching the stored `NUMERIC(12, 2)`.
    ///
    /// Returns `None` when `amount` is not finite, rounds below one cent, or
    /// `currency` is blank; the caller should emit a failure instead.
    #[must_use]
    pub fn succeeded(
        target: ObservationTarget,
        amount: f64,
        currency: &str,
        period: &str,
        fetch_tier: FetchTier,
        extraction_tier: ExtractionTier,
    ) -> Option<Self> {
        let currency = currency.trim();
        let amount = (amount * 100.0).round() / 100.0;
        if !(amount.is_finite() && amount >= 0.01) || currency.is_empty() {
            return None;
        }

        Some(Self {
            id: Uuid::new_v4(),
            product_name: target.product_name,
            region_token: target.region_token,
            region: target.region,
            amount,
            currency: currency.to_uppercase(),
            period: if period.trim().is_empty() {
                "Unknown".to_string()
            } else {
                period.trim().to_string()
            },
            plan_name: target.plan_name,
            source_url: target.source_url,
            success: true,
            notes: None,
            fetch_tier: Some(fetch_tier),
            extraction_tier: Some(extraction_tier),
            observed_at: Utc::now(),
        })
    }

    /// A failed observation with zero amount and an explanatory note.
    ///
    /// A blank note is replaced with a generic one so the record is never
    /// emitted without an explanation.
    #[must_use]
    pub fn failed(
        target: ObservationTarget,
        currency: &str,
        note: impl Into<String>,
        fetch_tier: Option<FetchTier>,
    ) -> Self {
        let note = note.into();
        let note = if note.trim().is_empty() {
            "scrape failed without a recorded reason".to_string()
        } else {
            note
        };

        Self {
            id: Uuid::new_v4(),
            product_name: target.product_name,
            region_token: target.region_token,
            region: target.region,
            amount: 0.0,
            currency: currency.trim().to_uppercase(),
            period: "Unknown".to_string(),
            plan_name: target.plan_name,
            source_url: target.source_url,
            success: false,
            notes: Some(note),
            fetch_tier,
            extraction_tier: None,
            observed_at: Utc::now(),
        }
    }
}
