use std::time::Duration;

use async_trait::async_trait;
use mdp_core::ListingCandidate;
use mdp_storage::HttpFetcher;
use scraper::{Html, Node};
use serde::Deserialize;
use serde_json::{json, Value as JsonValue};
use tracing::{debug, info};

use crate::{ExtractionError, FetchedPage, ListingExtractor};

/// Page text beyond this many characters is not sent for extraction.
pub const MAX_PAGE_CHARS: usize = 20_000;

const ANTHROPIC_VERSION: &str = "2023-06-01";
const SKIPPED_ELEMENTS: [&str; 4] = ["script", "style", "noscript", "template"];

/// Visible text of an HTML page, whitespace-collapsed and capped at `max_chars`.
pub fn page_text(html: &str, max_chars: usize) -> String {
    let document = Html::parse_document(html);
    let mut words: Vec<&str> = Vec::new();
    for node in document.root_element().descendants() {
        let Node::Text(text) = node.value() else {
            continue;
        };
        let hidden = node.ancestors().any(|ancestor| {
            ancestor
                .value()
                .as_element()
                .is_some_and(|el| SKIPPED_ELEMENTS.contains(&el.name()))
        });
        if !hidden {
            words.extend(text.split_whitespace());
        }
    }
    words.join(" ").chars().take(max_chars).collect()
}

fn extraction_prompt(area: &str, text: &str) -> String {
    format!(
        "The text below comes from a real estate search results page for {area}.\n\
         \n\
         List every property on the page. For each one give:\n\
         - address: full street address\n\
         - price: number only, no currency symbol or separators\n\
         - lotSize: lot area in square feet, or null\n\
         - beds: number or null\n\
         - baths: number or null\n\
         - sqft: living area in square feet, or null\n\
         - propertyType: \"land\", \"single_family\", \"multifamily\" or \"unknown\"\n\
         - url: the listing URL if present, otherwise null\n\
         - status: \"for_sale\", \"pending\", \"sold\" or \"unknown\"\n\
         \n\
         Answer with a JSON array of objects and nothing else: no Markdown, no commentary.\n\
         If there are no properties, answer [].\n\
         \n\
         Page text:\n{text}"
    )
}

/// Pulls the candidate array out of a model reply. Code fences and prose around
/// the array are tolerated; elements that are not objects are dropped.
pub fn parse_extraction_reply(reply: &str) -> Result<Vec<ListingCandidate>, ExtractionError> {
    let cleaned = reply.replace("```json", "").replace("```", "");
    let (Some(start), Some(end)) = (cleaned.find('['), cleaned.rfind(']')) else {
        return Err(ExtractionError::Parse("no JSON array in reply".into()));
    };
    if end < start {
        return Err(ExtractionError::Parse("no JSON array in reply".into()));
    }

    let items: Vec<JsonValue> = serde_json::from_str(&cleaned[start..=end])
        .map_err(|e| ExtractionError::Parse(e.to_string()))?;
    let total = items.len();
    let candidates = items
        .into_iter()
        .filter_map(|item| match serde_json::from_value::<ListingCandidate>(item) {
            Ok(candidate) => Some(candidate),
            Err(err) => {
                debug!(error = %err, "dropping malformed listing element");
                None
            }
        })
        .collect::<Vec<_>>();
    if candidates.len() < total {
        debug!(kept = candidates.len(), total, "extraction reply had malformed elements");
    }
    Ok(candidates)
}

#[derive(Debug, Deserialize)]
struct MessagesResponse {
    #[serde(default)]
    content: Vec<ContentBlock>,
}

#[derive(Debug, Deserialize)]
struct ContentBlock {
    #[serde(default)]
    text: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ExtractionConfig {
    pub api_key: String,
    pub model: String,
    pub endpoint: String,
    pub max_tokens: u32,
    pub timeout: Duration,
    pub probe_timeout: Duration,
    pub max_page_chars: usize,
}

impl ExtractionConfig {
    pub fn new(api_key: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            model: model.into(),
            endpoint: "https://api.anthropic.com/v1/messages".to_string(),
            max_tokens: 4000,
            timeout: Duration::from_secs(30),
            probe_timeout: Duration::from_secs(15),
            max_page_chars: MAX_PAGE_CHARS,
        }
    }
}

/// Extraction through the Anthropic Messages API.
pub struct AnthropicExtractor {
    http: HttpFetcher,
    config: ExtractionConfig,
}

impl AnthropicExtractor {
    pub fn new(http: HttpFetcher, config: ExtractionConfig) -> Self {
        Self { http, config }
    }

    async fn send(
        &self,
        prompt: &str,
        max_tokens: u32,
        timeout: Duration,
    ) -> Result<String, ExtractionError> {
        let body = json!({
            "model": self.config.model,
            "max_tokens": max_tokens,
            "messages": [{"role": "user", "content": prompt}],
        });
        let headers = [
            ("x-api-key", self.config.api_key.as_str()),
            ("anthropic-version", ANTHROPIC_VERSION),
        ];
        let resp = self
            .http
            .post_json(&self.config.endpoint, &headers, &body, Some(timeout))
            .await?;

        let parsed: MessagesResponse = serde_json::from_str(&resp.body)
            .map_err(|e| ExtractionError::Parse(format!("messages response: {e}")))?;
        parsed
            .content
            .into_iter()
            .find_map(|block| block.text)
            .map(|text| text.trim().to_string())
            .ok_or_else(|| ExtractionError::Parse("reply had no text block".into()))
    }
}

#[async_trait]
impl ListingExtractor for AnthropicExtractor {
    fn name(&self) -> &'static str {
        "anthropic"
    }

    async fn validate_credentials(&self) -> Result<(), ExtractionError> {
        self.send("Say OK", 10, self.config.probe_timeout).await?;
        Ok(())
    }

    async fn extract(&self, page: &FetchedPage) -> Result<Vec<ListingCandidate>, ExtractionError> {
        let text = page_text(&page.html, self.config.max_page_chars);
        let prompt = extraction_prompt(&page.area, &text);
        let reply = self
            .send(&prompt, self.config.max_tokens, self.config.timeout)
            .await?;
        let candidates = parse_extraction_reply(&reply)?;
        info!(area = %page.area, listings = candidates.len(), "listings extracted");
        Ok(candidates)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn page_text_skips_scripts_and_styles() {
        let html = r#"<html><head><style>.x{color:red}</style>
            <script>window.__STATE__ = {"price": 1};</script></head>
            <body><div class="card">  123 Main St
            <span>$450,000</span></div><noscript>enable js</noscript></body></html>"#;
        let text = page_text(html, MAX_PAGE_CHARS);
        assert_eq!(text, "123 Main St $450,000");
    }

    #[test]
    fn page_text_is_capped_by_characters() {
        let html = "<p>ññññññññññ</p>";
        assert_eq!(page_text(html, 4), "ññññ");
    }

    #[test]
    fn reply_with_fences_and_prose_parses() {
        let reply = "Here you go:\n```json\n[{\"address\": \"1 Test St\", \"price\": 200000}]\n```";
        let candidates = parse_extraction_reply(reply).unwrap();
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].address.as_deref(), Some("1 Test St"));
        assert_eq!(candidates[0].price, Some(200_000.0));
    }

    #[test]
    fn non_object_elements_are_dropped() {
        let candidates =
            parse_extraction_reply(r#"[{"address": "2 Bay Rd"}, "oops", 17]"#).unwrap();
        assert_eq!(candidates.len(), 1);
    }

    #[test]
    fn empty_array_is_zero_candidates() {
        assert!(parse_extraction_reply("[]").unwrap().is_empty());
    }

    #[test]
    fn reply_without_array_is_a_parse_error() {
        let err = parse_extraction_reply("I could not find any listings.").unwrap_err();
        assert!(matches!(err, ExtractionError::Parse(_)));
        let err = parse_extraction_reply("] backwards [").unwrap_err();
        assert!(matches!(err, ExtractionError::Parse(_)));
    }

    #[test]
    fn prompt_names_the_area() {
        let prompt = extraction_prompt("Allapattah", "some text");
        assert!(prompt.contains("Allapattah"));
        assert!(prompt.ends_with("some text"));
    }
}
