use std::sync::LazyLock;

use async_trait::async_trait;
use pricewatch_core::ExtractionTier;
use regex::Regex;
use scraper::{ElementRef, Html, Selector};

use super::{collapse_ws, ExtractionInput, ExtractionResult, Extractor};
use crate::normalize::{normalize_period, PriceNormalizer};

const AMOUNT: &str = r"\d{1,3}(?:[.,\u{a0} ]\d{3})+(?:[.,]\d{1,2})?|\d+(?:[.,]\d{1,2})?";

/// Price shapes in priority order.
static PRICE_PATTERNS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    [
        format!(r"(?:R\$|[A-Z]{{1,2}}\$|\$|€|£|₹|¥|₽|₺|₩)\s?(?:{AMOUNT})"),
        format!(r"(?:{AMOUNT})\s?(?:€|£|₹|¥|₽|₺|zł|Kč|kr)"),
        format!(r"\b[A-Z]{{3}}\s?(?:{AMOUNT})"),
        format!(r"(?i)(?:{AMOUNT})\s*(?:/|per\s+)\s*(?:month|mo)\b"),
    ]
    .iter()
    .map(|p| Regex::new(p).expect("valid regex"))
    .collect()
});

const PERIOD_LOOKAHEAD_CHARS: usize = 30;
const SECTION_TAGS: &[&str] = &["div", "section", "article"];
const SKIPPED_TAGS: &[&str] = &["script", "style", "noscript", "template"];

/// Whether `text` contains anything shaped like a price.
#[must_use]
pub fn contains_price(text: &str) -> bool {
    PRICE_PATTERNS.iter().any(|re| re.is_match(text))
}

/// Tier 2: regular expressions over the best-guess pricing section's text.
#[derive(Debug, Clone, Default)]
pub struct PatternExtractor {
    normalizer: PriceNormalizer,
}

impl PatternExtractor {
    #[must_use]
    pub fn new(normalizer: PriceNormalizer) -> Self {
        Self { normalizer }
    }

    /// First pattern match in `text` that validates, else the first match.
    #[must_use]
    pub fn scan(&self, text: &str) -> ExtractionResult {
        let mut first_match: Option<String> = None;

        for re in PRICE_PATTERNS.iter() {
            for m in re.find_iter(text) {
                let raw = m.as_str().trim().to_string();
                if self.normalizer.validated(&raw).is_some() {
                    return ExtractionResult {
                        price_raw: Some(raw),
                        period_raw: trailing_period(&text[m.end()..]),
                        ..ExtractionResult::empty(ExtractionTier::Pattern)
                    };
                }
                if first_match.is_none() {
                    first_match = Some(raw);
                }
            }
        }

        ExtractionResult {
            price_raw: first_match,
            ..ExtractionResult::empty(ExtractionTier::Pattern)
        }
    }
}

#[async_trait]
impl Extractor for PatternExtractor {
    fn tier(&self) -> ExtractionTier {
        ExtractionTier::Pattern
    }

    async fn extract(&self, input: &ExtractionInput<'_>) -> Option<ExtractionResult> {
        let text = section_text(input.html, &input.selectors.section, input.plan_hint);
        Some(self.scan(&text))
    }
}

/// Period wording right after a price, e.g. `" / month"`.
fn trailing_period(rest: &str) -> Option<String> {
    let window: String = rest.chars().take(PERIOD_LOOKAHEAD_CHARS).collect();
    let window = window.trim();
    if window.is_empty() {
        return None;
    }
    let normalized = normalize_period(window);
    matches!(
        normalized.as_str(),
        "Monthly" | "Annual" | "Weekly" | "Daily" | "One-time"
    )
    .then(|| window.to_string())
}

/// Text of the pricing section: a configured section selector, else the
/// nearest container of the first heading naming the plan, else `<body>`.
#[must_use]
pub fn section_text(html: &str, section_selectors: &[String], plan_hint: Option<&str>) -> String {
    let doc = Html::parse_document(html);

    let configured = section_selectors
        .iter()
        .filter_map(|c| Selector::parse(c).ok())
        .find_map(|sel| {
            doc.select(&sel)
                .map(visible_text)
                .find(|t| !t.is_empty())
        });
    if let Some(text) = configured {
        return text;
    }

    if let Some(text) = plan_hint.and_then(|hint| plan_card_text(&doc, hint)) {
        return text;
    }

    Selector::parse("body")
        .ok()
        .and_then(|sel| doc.select(&sel).next().map(visible_text))
        .unwrap_or_else(|| visible_text(doc.root_element()))
}

fn plan_card_text(doc: &Html, hint: &str) -> Option<String> {
    let hint = hint.trim().to_lowercase();
    if hint.is_empty() {
        return None;
    }
    let headings = Selector::parse("h1, h2, h3, h4").ok()?;
    doc.select(&headings)
        .find(|h| visible_text(*h).to_lowercase().contains(&hint))
        .and_then(|h| {
            h.ancestors()
                .filter_map(ElementRef::wrap)
                .find(|a| SECTION_TAGS.contains(&a.value().name()))
        })
        .map(visible_text)
}

/// Text nodes under `el`, excluding script and style content.
fn visible_text(el: ElementRef<'_>) -> String {
    let parts: Vec<&str> = el
        .descendants()
        .filter(|node| {
            !node
                .parent()
                .and_then(|p| p.value().as_element().map(|e| SKIPPED_TAGS.contains(&e.name())))
                .unwrap_or(false)
        })
        .filter_map(|node| node.value().as_text().map(|t| &**t))
        .collect();
    collapse_ws(&parts.join(" "))
}
