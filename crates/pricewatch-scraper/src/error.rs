use thiserror::Error;

/// Failure of a single fetch attempt at one tier.
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("unexpected HTTP status {status} from {url}")]
    UnexpectedStatus { status: u16, url: String },

    #[error("rate limited by {url} (retry after {retry_after_secs}s)")]
    RateLimited { url: String, retry_after_secs: u64 },

    #[error("challenge page served for {url} without a browser to wait it out")]
    ChallengeServed { url: String },

    #[error("challenge on {url} did not clear after {waited_secs}s")]
    ChallengeTimeout { url: String, waited_secs: u64 },

    #[error("access blocked on {url} ({marker})")]
    Blocked { url: String, marker: String },

    #[error("browser error: {0}")]
    Browser(String),

    #[error("proxy unavailable: {0}")]
    ProxyUnavailable(String),

    #[error("invalid URL \"{url}\": {reason}")]
    InvalidUrl { url: String, reason: String },
}

impl FetchError {
    /// Short label used in run-log lines and failure notes.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            FetchError::Http(_) => "transport",
            FetchError::UnexpectedStatus { .. } => "status",
            FetchError::RateLimited { .. } => "rate-limited",
            FetchError::ChallengeServed { .. } => "challenge",
            FetchError::ChallengeTimeout { .. } => "challenge-timeout",
            FetchError::Blocked { .. } => "blocked",
            FetchError::Browser(_) => "browser",
            FetchError::ProxyUnavailable(_) => "proxy",
            FetchError::InvalidUrl { .. } => "invalid-url",
        }
    }

    /// Whether a later attempt (possibly at a higher tier) could succeed.
    #[must_use]
    pub fn is_retriable(&self) -> bool {
        !matches!(
            self,
            FetchError::InvalidUrl { .. } | FetchError::ProxyUnavailable(_)
        )
    }
}

/// Raw text was found but does not reduce to a number.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PriceParseError {
    #[error("price text is empty")]
    Empty,

    #[error("no digits in price text \"{raw}\"")]
    NoDigits { raw: String },

    #[error("price text \"{raw}\" does not parse as a number (cleaned: \"{cleaned}\")")]
    Invalid { raw: String, cleaned: String },
}

/// No extraction tier produced a validated price.
#[derive(Debug, Clone, Error)]
pub enum ExtractionError {
    #[error("no tier produced a valid price{}", raw_suffix(.raw_price))]
    NoValidatedPrice {
        /// Best raw price text seen along the way, if any tier found text.
        raw_price: Option<String>,
        /// Per-tier notes, e.g. a vision hint that the price needs scrolling.
        notes: Vec<String>,
    },
}

fn raw_suffix(raw: &Option<String>) -> String {
    raw.as_ref()
        .map(|r| format!(" (last raw text \"{r}\")"))
        .unwrap_or_default()
}

#[derive(Debug, Error)]
pub enum VisionError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("vision API returned status {status}: {body}")]
    Api { status: u16, body: String },

    #[error("vision API returned status {status}; its body could not be read: {source}")]
    ApiBodyUnreadable {
        status: u16,
        #[source]
        source: reqwest::Error,
    },

    #[error("JSON deserialization error for {context}: {source}")]
    Deserialize {
        context: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("vision API returned no content")]
    EmptyResponse,
}

/// A persistence collaborator rejected an observation.
#[derive(Debug, Clone, Error)]
#[error("persistence rejected observation: {message}")]
pub struct PersistenceError {
    pub message: String,
}

impl PersistenceError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}
