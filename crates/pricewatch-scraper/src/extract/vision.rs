//! Tier 3: ask a vision model where the price is.
//!
//! The model receives a screenshot (when one was captured) and an HTML
//! excerpt, and answers with CSS selector guesses plus an optional note.
//! A suggested price selector is fed back through the selector tier, so the
//! model never supplies the price text itself.

use std::sync::{Arc, LazyLock};
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine as _;
use pricewatch_core::{ExtractionTier, SelectorSet};
use regex::Regex;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::json;

use super::selector::extract_with;
use super::{ExtractionInput, ExtractionResult, Extractor};
use crate::error::VisionError;

/// Maximum HTML characters sent alongside the screenshot.
const HTML_EXCERPT_CHARS: usize = 80_000;
const DEFAULT_PLAN_HINT: &str = "main paid plan";

static CODE_FENCE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"```(?:json)?\s*([\s\S]*?)\s*```").expect("valid regex"));

#[derive(Debug, Clone, Copy)]
pub struct VisionRequest<'a> {
    pub url: &'a str,
    pub plan_name: &'a str,
    pub html_excerpt: &'a str,
    pub screenshot: Option<&'a [u8]>,
}

/// Selector guesses; empty strings mean "not found".
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VisionResponse {
    #[serde(default)]
    pub price: String,
    #[serde(default)]
    pub currency: String,
    #[serde(default)]
    pub period: String,
    #[serde(default)]
    pub plan_name: String,
    #[serde(default)]
    pub note: Option<String>,
}

impl<'a> VisionRequest<'a> {
    /// Request for one page, with the HTML cut to the excerpt limit.
    #[must_use]
    pub fn for_page(
        url: &'a str,
        html: &'a str,
        plan_hint: Option<&'a str>,
        screenshot: Option<&'a [u8]>,
    ) -> Self {
        Self {
            url,
            plan_name: plan_hint.unwrap_or(DEFAULT_PLAN_HINT),
            html_excerpt: excerpt(html, HTML_EXCERPT_CHARS),
            screenshot,
        }
    }
}

impl VisionResponse {
    /// Only the selectors the model actually suggested.
    #[must_use]
    pub fn suggested(&self) -> SelectorSet {
        self.selectors(&SelectorSet::default())
    }

    /// Suggested selectors, falling back to `configured` for fields the
    /// model left empty.
    #[must_use]
    pub fn selectors(&self, configured: &SelectorSet) -> SelectorSet {
        let pick = |suggested: &str, fallback: &[String]| {
            let s = suggested.trim();
            if s.is_empty() {
                fallback.to_vec()
            } else {
                vec![s.to_string()]
            }
        };
        SelectorSet {
            price: pick(&self.price, &[]),
            currency: pick(&self.currency, &configured.currency),
            period: pick(&self.period, &configured.period),
            plan_name: pick(&self.plan_name, &configured.plan_name),
            section: configured.section.clone(),
        }
    }

    #[must_use]
    pub fn note(&self) -> Option<String> {
        self.note
            .as_deref()
            .map(str::trim)
            .filter(|n| !n.is_empty())
            .map(str::to_string)
    }
}

#[async_trait]
pub trait VisionModel: Send + Sync {
    async fn locate(&self, request: &VisionRequest<'_>) -> Result<VisionResponse, VisionError>;
}

pub struct VisionExtractor {
    model: Arc<dyn VisionModel>,
}

impl VisionExtractor {
    #[must_use]
    pub fn new(model: Arc<dyn VisionModel>) -> Self {
        Self { model }
    }
}

#[async_trait]
impl Extractor for VisionExtractor {
    fn tier(&self) -> ExtractionTier {
        ExtractionTier::Vision
    }

    async fn extract(&self, input: &ExtractionInput<'_>) -> Option<ExtractionResult> {
        let request =
            VisionRequest::for_page(input.url, input.html, input.plan_hint, input.screenshot);

        let response = match self.model.locate(&request).await {
            Ok(response) => response,
            Err(e) => {
                tracing::warn!(url = input.url, error = %e, "vision request failed");
                return Some(ExtractionResult {
                    note: Some(format!("vision request failed: {e}")),
                    ..ExtractionResult::empty(ExtractionTier::Vision)
                });
            }
        };

        let note = response.note();
        let suggested = response.selectors(input.selectors);
        if suggested.price.is_empty() {
            tracing::info!(url = input.url, note = ?note, "vision found no price selector");
            return Some(ExtractionResult {
                note,
                ..ExtractionResult::empty(ExtractionTier::Vision)
            });
        }

        tracing::info!(
            url = input.url,
            selector = %suggested.price[0],
            "retrying selectors suggested by vision"
        );
        let mut result = extract_with(input.html, &suggested, ExtractionTier::Vision);
        result.note = note;
        Some(result)
    }
}

/// Chat-completions client sending a base64 PNG data URI.
pub struct OpenAiVision {
    client: Client,
    api_key: String,
    model: String,
    url: String,
}

impl OpenAiVision {
    /// # Errors
    ///
    /// Returns [`VisionError::Http`] if the underlying `reqwest::Client`
    /// cannot be constructed.
    pub fn new(
        api_key: &str,
        model: &str,
        url: &str,
        timeout_secs: u64,
    ) -> Result<Self, VisionError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .connect_timeout(Duration::from_secs(10))
            .build()?;
        Ok(Self {
            client,
            api_key: api_key.to_owned(),
            model: model.to_owned(),
            url: url.to_owned(),
        })
    }
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

#[derive(Deserialize)]
struct ChatMessage {
    content: Option<String>,
}

#[async_trait]
impl VisionModel for OpenAiVision {
    async fn locate(&self, request: &VisionRequest<'_>) -> Result<VisionResponse, VisionError> {
        let mut content = vec![json!({ "type": "text", "text": prompt(request) })];
        if let Some(png) = request.screenshot {
            let encoded = base64::engine::general_purpose::STANDARD.encode(png);
            content.push(json!({
                "type": "image_url",
                "image_url": { "url": format!("data:image/png;base64,{encoded}") }
            }));
        }

        let body = json!({
            "model": self.model,
            "temperature": 0.1,
            "response_format": { "type": "json_object" },
            "messages": [{ "role": "user", "content": content }],
        });

        let response = self
            .client
            .post(&self.url)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            let status = status.as_u16();
            return Err(match response.text().await {
                Ok(body) => VisionError::Api { status, body },
                Err(source) => VisionError::ApiBodyUnreadable { status, source },
            });
        }

        let text = response.text().await?;
        let chat: ChatResponse =
            serde_json::from_str(&text).map_err(|e| VisionError::Deserialize {
                context: "chat completion envelope".to_string(),
                source: e,
            })?;
        let content = chat
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .filter(|c| !c.trim().is_empty())
            .ok_or(VisionError::EmptyResponse)?;

        parse_response(&content)
    }
}

/// Parse the model's JSON answer, tolerating a Markdown code fence.
///
/// # Errors
///
/// Returns [`VisionError::Deserialize`] when the content is not the expected
/// JSON object.
pub fn parse_response(content: &str) -> Result<VisionResponse, VisionError> {
    let json_text = CODE_FENCE_RE
        .captures(content)
        .and_then(|c| c.get(1))
        .map_or(content.trim(), |m| m.as_str());
    serde_json::from_str(json_text).map_err(|e| VisionError::Deserialize {
        context: "vision selector answer".to_string(),
        source: e,
    })
}

fn prompt(request: &VisionRequest<'_>) -> String {
    let plan = request.plan_name;
    format!(
        r#"You are looking at a pricing page screenshot and its HTML, to find CSS selectors for scraping.

Find a CSS selector for the element holding the numeric price (for example $20, 20, €19) of the "{plan}" plan.

1. In the screenshot, find where the {plan} price is shown and what it says.
2. Search the HTML for that value or nearby text such as "/month" or the plan name.
3. Note the element's tag, classes, data attributes and parents.
4. Give a CSS selector that selects that element.
5. If the price is not visible (placeholder, still loading), leave price empty and say so in note, e.g. "scroll to the {plan} card" or "price loads via JavaScript".

Answer with JSON only:
{{"price": "selector or empty", "currency": "selector or empty", "period": "selector or empty", "plan_name": "selector or empty", "note": "optional observation"}}

URL: {url}

HTML excerpt:
{html}"#,
        url = request.url,
        html = request.html_excerpt,
    )
}

/// First `max_chars` characters of `html`.
fn excerpt(html: &str, max_chars: usize) -> &str {
    html.char_indices()
        .nth(max_chars)
        .map_or(html, |(idx, _)| &html[..idx])
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;

    struct FakeModel {
        answer: Result<VisionResponse, ()>,
        seen_plan: Mutex<Option<String>>,
    }

    impl FakeModel {
        fn answering(answer: VisionResponse) -> Self {
            Self {
                answer: Ok(answer),
                seen_plan: Mutex::new(None),
            }
        }
    }

    #[async_trait]
    impl VisionModel for FakeModel {
        async fn locate(
            &self,
            request: &VisionRequest<'_>,
        ) -> Result<VisionResponse, VisionError> {
            *self.seen_plan.lock().unwrap() = Some(request.plan_name.to_string());
            self.answer.clone().map_err(|()| VisionError::EmptyResponse)
        }
    }

    const HTML: &str = r#"<div class="card"><h3>Plus</h3><span class="amt">$20</span><span class="per">/month</span></div>"#;

    fn input<'a>(selectors: &'a SelectorSet, plan: Option<&'a str>) -> ExtractionInput<'a> {
        ExtractionInput {
            html: HTML,
            selectors,
            plan_hint: plan,
            screenshot: Some(b"png"),
            url: "https://example.test/pricing",
        }
    }

    #[tokio::test]
    async fn suggested_selector_reruns_selector_tier() {
        let model = Arc::new(FakeModel::answering(VisionResponse {
            price: "span.amt".to_string(),
            note: Some("price under the Plus heading".to_string()),
            ..VisionResponse::default()
        }));
        let extractor = VisionExtractor::new(model.clone());
        let configured = SelectorSet {
            price: vec!["#gone".to_string()],
            period: vec![".per".to_string()],
            ..SelectorSet::default()
        };

        let result = extractor.extract(&input(&configured, Some("Plus"))).await.unwrap();
        assert_eq!(result.tier, ExtractionTier::Vision);
        assert_eq!(result.price_raw.as_deref(), Some("$20"));
        assert_eq!(result.period_raw.as_deref(), Some("/month"));
        assert_eq!(result.note.as_deref(), Some("price under the Plus heading"));
        assert_eq!(model.seen_plan.lock().unwrap().as_deref(), Some("Plus"));
    }

    #[tokio::test]
    async fn note_only_answer_yields_no_price() {
        let model = Arc::new(FakeModel::answering(VisionResponse {
            note: Some("price loads via JavaScript".to_string()),
            ..VisionResponse::default()
        }));
        let extractor = VisionExtractor::new(model.clone());
        let configured = SelectorSet::default();

        let result = extractor.extract(&input(&configured, None)).await.unwrap();
        assert_eq!(result.price_raw, None);
        assert_eq!(result.note.as_deref(), Some("price loads via JavaScript"));
        assert_eq!(
            model.seen_plan.lock().unwrap().as_deref(),
            Some(DEFAULT_PLAN_HINT)
        );
    }

    #[tokio::test]
    async fn model_failure_becomes_a_note() {
        let model = Arc::new(FakeModel {
            answer: Err(()),
            seen_plan: Mutex::new(None),
        });
        let extractor = VisionExtractor::new(model);
        let configured = SelectorSet::default();

        let result = extractor.extract(&input(&configured, None)).await.unwrap();
        assert_eq!(result.price_raw, None);
        assert!(result.note.unwrap().contains("vision request failed"));
    }

    #[test]
    fn suggested_keeps_only_model_fields() {
        let response = VisionResponse {
            price: " .amt ".to_string(),
            period: String::new(),
            ..VisionResponse::default()
        };
        let suggested = response.suggested();
        assert_eq!(suggested.price, vec![".amt".to_string()]);
        assert!(suggested.period.is_empty());
        assert!(suggested.section.is_empty());
    }

    #[test]
    fn parses_fenced_json() {
        let parsed = parse_response("```json\n{\"price\": \".p\", \"note\": \"ok\"}\n```").unwrap();
        assert_eq!(parsed.price, ".p");
        assert_eq!(parsed.currency, "");
        assert_eq!(parsed.note.as_deref(), Some("ok"));
    }

    #[test]
    fn parses_bare_json() {
        assert_eq!(parse_response(r#"{"price": ""}"#).unwrap().price, "");
    }

    #[test]
    fn rejects_prose() {
        assert!(matches!(
            parse_response("I could not find it"),
            Err(VisionError::Deserialize { .. })
        ));
    }

    #[test]
    fn excerpt_respects_char_boundaries() {
        assert_eq!(excerpt("€€€€", 2), "€€");
        assert_eq!(excerpt("abc", 10), "abc");
    }
}
