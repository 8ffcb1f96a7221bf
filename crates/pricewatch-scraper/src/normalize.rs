//! Price and billing-period normalization.
//!
//! Turns raw storefront text such as `"R$ 99,90"` or `"19,99 € / Monat"` into
//! a numeric amount plus a currency code, and collapses period wording into a
//! small fixed vocabulary.

use std::sync::LazyLock;

use regex::Regex;

use crate::error::PriceParseError;

/// ISO 4217 codes recognised when written next to an amount (`"ZAR 399"`).
const KNOWN_CODES: &[&str] = &[
    "AED", "ARS", "AUD", "BDT", "BGN", "BHD", "BOB", "BRL", "BYN", "CAD", "CHF", "CLP", "CNY",
    "COP", "CRC", "CZK", "DKK", "DOP", "DZD", "EGP", "EUR", "GBP", "GEL", "GHS", "GTQ", "HKD",
    "HRK", "HUF", "IDR", "ILS", "INR", "IQD", "ISK", "JOD", "JPY", "KES", "KRW", "KWD", "KZT",
    "LBP", "LKR", "MAD", "MXN", "MYR", "NGN", "NOK", "NPR", "NZD", "OMR", "PAB", "PEN", "PHP",
    "PKR", "PLN", "PYG", "QAR", "RON", "RSD", "RUB", "SAR", "SEK", "SGD", "THB", "TRY", "TWD",
    "TZS", "UAH", "UGX", "USD", "UYU", "UZS", "VND", "XAF", "XOF", "ZAR",
];

/// Currency symbols in match order. Longer marks that end in a shorter one
/// (`R$`, `US$`, `CA$` …) come before it so `R$ 99,90` is never read as dollars.
const SYMBOLS: &[(&str, &str)] = &[
    ("R$", "BRL"),
    ("US$", "USD"),
    ("CA$", "CAD"),
    ("AU$", "AUD"),
    ("A$", "AUD"),
    ("C$", "CAD"),
    ("MX$", "MXN"),
    ("NZ$", "NZD"),
    ("HK$", "HKD"),
    ("NT$", "TWD"),
    ("S$", "SGD"),
    ("€", "EUR"),
    ("£", "GBP"),
    ("₹", "INR"),
    ("¥", "JPY"),
    ("￥", "JPY"),
    ("₽", "RUB"),
    ("₺", "TRY"),
    ("₩", "KRW"),
    ("₱", "PHP"),
    ("₫", "VND"),
    ("฿", "THB"),
    ("₴", "UAH"),
    ("₦", "NGN"),
    ("₪", "ILS"),
    ("$", "USD"),
];

/// Alphabetic marks; only honoured when directly next to a digit.
const WORD_SYMBOLS: &[(&str, &str)] = &[
    ("zł", "PLN"),
    ("Kč", "CZK"),
    ("Rp", "IDR"),
    ("RM", "MYR"),
    ("Ft", "HUF"),
    ("lei", "RON"),
];

/// Marks stripped before reading the amount that name no single currency.
const AMBIGUOUS_MARKS: &[&str] = &["kr"];

/// Words that may sit next to an amount: billing periods, seat and tax
/// qualifiers. Any other word means the text is not a bare price.
const PRICE_WORDS: &[&str] = &[
    "a", "al", "an", "annual", "annually", "ano", "anual", "ans", "año", "billed", "day",
    "daily", "each", "excl", "gst", "incl", "jahr", "jährlich", "lifetime", "mensal",
    "mensual", "mes", "mo", "monat", "monatlich", "month", "monthly", "months", "mois", "mth",
    "mês", "one", "par", "per", "por", "pro", "seat", "seats", "tax", "time", "user", "users",
    "vat", "week", "weekly", "wk", "year", "yearly", "years", "yr", "mån", "år", "月", "年",
];

static CODE_BEFORE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b([A-Z]{3})\W{0,3}\d").expect("valid regex"));
static CODE_AFTER_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\d\W{0,3}([A-Z]{3})\b").expect("valid regex"));
static NUMBER_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\d{1,3}(?:[ \u{a0}\u{202f}']\d{3})+\b(?:[.,]\d{1,2}\b)?|\d+(?:[.,]\d+)*")
        .expect("valid regex")
});
static WORD_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\p{L}+").expect("valid regex"));
static EUROPEAN_DECIMAL_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r",\d{2}$").expect("valid regex"));

/// A parsed price.
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedPrice {
    pub amount: f64,
    pub currency: String,
    /// `false` when no code or symbol was found and the fallback was used.
    pub currency_detected: bool,
}

impl ParsedPrice {
    /// Finite and strictly positive.
    #[must_use]
    pub fn is_valid(&self) -> bool {
        self.amount.is_finite() && self.amount > 0.0
    }
}

/// Price parser bound to a fallback currency.
#[derive(Debug, Clone)]
pub struct PriceNormalizer {
    fallback_currency: String,
}

impl Default for PriceNormalizer {
    fn default() -> Self {
        Self::new("USD")
    }
}

impl PriceNormalizer {
    pub fn new(fallback_currency: impl Into<String>) -> Self {
        Self {
            fallback_currency: fallback_currency.into().to_uppercase(),
        }
    }

    #[must_use]
    pub fn fallback_currency(&self) -> &str {
        &self.fallback_currency
    }

    /// Parse `raw` into an amount and currency.
    ///
    /// # Errors
    ///
    /// Returns [`PriceParseError`] when `raw` is blank, has no digits, or its
    /// numeric part does not reduce to a number.
    pub fn parse(&self, raw: &str) -> Result<ParsedPrice, PriceParseError> {
        parse_price(raw, &self.fallback_currency)
    }

    /// Parse and keep the result only if the amount is finite and positive.
    #[must_use]
    pub fn validated(&self, raw: &str) -> Option<ParsedPrice> {
        self.parse(raw).ok().filter(ParsedPrice::is_valid)
    }
}

/// Parse a raw price string.
///
/// Currency is taken from an explicit 3-letter code next to the digits, then
/// from a known symbol, then `fallback_currency`. A trailing `,dd` group marks
/// a European decimal comma; otherwise commas are thousands separators.
///
/// # Errors
///
/// Returns [`PriceParseError`] when `raw` is blank, has no digits, or its
/// numeric part does not reduce to a number.
pub fn parse_price(raw: &str, fallback_currency: &str) -> Result<ParsedPrice, PriceParseError> {
    let text = raw.trim();
    if text.is_empty() {
        return Err(PriceParseError::Empty);
    }
    if !text.chars().any(|c| c.is_ascii_digit()) {
        return Err(PriceParseError::NoDigits {
            raw: raw.to_string(),
        });
    }

    let amount = parse_amount(text)?;
    let (currency, currency_detected) = match detect_currency(text) {
        Some(code) => (code.to_string(), true),
        None => (fallback_currency.to_uppercase(), false),
    };

    Ok(ParsedPrice {
        amount,
        currency,
        currency_detected,
    })
}

/// Currency code for the first code or symbol found in `text`.
#[must_use]
pub fn detect_currency(text: &str) -> Option<&'static str> {
    let code = CODE_BEFORE_RE
        .captures(text)
        .or_else(|| CODE_AFTER_RE.captures(text))
        .and_then(|caps| caps.get(1))
        .and_then(|m| KNOWN_CODES.iter().find(|c| **c == m.as_str()).copied());
    if code.is_some() {
        return code;
    }

    if let Some((_, code)) = SYMBOLS.iter().find(|(sym, _)| text.contains(sym)) {
        return Some(*code);
    }

    WORD_SYMBOLS
        .iter()
        .find(|(sym, _)| adjacent_to_digit(text, sym))
        .map(|(_, code)| *code)
}

/// Bare 3-letter code, e.g. the text of a dedicated currency element.
#[must_use]
pub fn as_currency_code(text: &str) -> Option<String> {
    let t = text.trim();
    (t.len() == 3 && t.chars().all(|c| c.is_ascii_alphabetic())).then(|| t.to_ascii_uppercase())
}

fn adjacent_to_digit(text: &str, sym: &str) -> bool {
    text.match_indices(sym).any(|(idx, _)| {
        let before = text[..idx].trim_end().chars().next_back();
        let after = text[idx + sym.len()..].trim_start().chars().next();
        let word_before = text[..idx]
            .chars()
            .next_back()
            .is_some_and(char::is_alphabetic);
        let word_after = text[idx + sym.len()..]
            .chars()
            .next()
            .is_some_and(char::is_alphabetic);
        let digit_near = before.is_some_and(|c| c.is_ascii_digit())
            || after.is_some_and(|c| c.is_ascii_digit());
        !word_before && !word_after && digit_near
    })
}

fn parse_amount(text: &str) -> Result<f64, PriceParseError> {
    let stripped = strip_symbols(text);
    let invalid = || PriceParseError::Invalid {
        raw: text.to_string(),
        cleaned: stripped.trim().to_string(),
    };

    if WORD_RE.find_iter(&stripped).any(|w| !is_price_word(w.as_str())) {
        return Err(invalid());
    }

    let mut numbers = NUMBER_RE.find_iter(&stripped);
    let (Some(m), None) = (numbers.next(), numbers.next()) else {
        return Err(invalid());
    };

    let compact: String = m
        .as_str()
        .chars()
        .filter(|c| !matches!(c, ' ' | '\u{a0}' | '\u{202f}' | '\''))
        .collect();

    let cleaned = if EUROPEAN_DECIMAL_RE.is_match(&compact) {
        compact.replace('.', "").replace(',', ".")
    } else {
        let without_commas = compact.replace(',', "");
        if without_commas.matches('.').count() > 1 {
            // "1.299.000": dots used as thousands separators
            without_commas.replace('.', "")
        } else {
            without_commas
        }
    };

    cleaned
        .parse::<f64>()
        .ok()
        .filter(|v| v.is_finite())
        .ok_or_else(|| PriceParseError::Invalid {
            raw: text.to_string(),
            cleaned,
        })
}

/// `text` with every currency symbol replaced by a space.
fn strip_symbols(text: &str) -> String {
    SYMBOLS
        .iter()
        .fold(text.to_string(), |acc, (sym, _)| acc.replace(sym, " "))
}

/// Currency codes, alphabetic currency marks and period or seat wording.
fn is_price_word(word: &str) -> bool {
    let lower = word.to_lowercase();
    KNOWN_CODES.contains(&word.to_uppercase().as_str())
        || WORD_SYMBOLS.iter().any(|(sym, _)| *sym == word)
        || AMBIGUOUS_MARKS.contains(&lower.as_str())
        || PRICE_WORDS.contains(&lower.as_str())
}

/// Collapse billing-period wording into `Monthly`, `Annual`, `Weekly`,
/// `Daily` or `One-time`; other text is kept (trimmed, commas removed) and
/// empty text becomes `Unknown`.
#[must_use]
pub fn normalize_period(raw: &str) -> String {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return "Unknown".to_string();
    }

    let lower = trimmed.to_lowercase();
    let has_any = |needles: &[&str]| needles.iter().any(|n| lower.contains(n));

    if has_any(&["month", "/mo", "monat", "mois", "/mes", "mensual", "mensal"]) {
        "Monthly".to_string()
    } else if has_any(&["year", "annual", "/yr", "jahr", "/año", "/an", "anual"]) {
        "Annual".to_string()
    } else if has_any(&["week"]) {
        "Weekly".to_string()
    } else if has_any(&["/day", "per day", "daily"]) {
        "Daily".to_string()
    } else if has_any(&["one-time", "one time", "lifetime"]) {
        "One-time".to_string()
    } else {
        trimmed.replace(',', "").trim().to_string()
    }
}

#[cfg(test)]
#[path = "normalize_test.rs"]
mod tests;
