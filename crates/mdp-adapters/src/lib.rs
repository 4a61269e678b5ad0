//! Listing source and extraction adapters.
//!
//! A [`ListingSource`] turns one search area into raw page content; a
//! [`ListingExtractor`] turns that page into [`ListingCandidate`]s. Both are
//! best-effort: callers decide what a failure means for the run.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use mdp_core::{ListingCandidate, PropertyType};
use mdp_storage::FetchError;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub mod extract;
pub mod source;

pub use extract::{
    page_text, parse_extraction_reply, AnthropicExtractor, ExtractionConfig, MAX_PAGE_CHARS,
};
pub use source::{build_search_url, ScraperApiConfig, ScraperApiSource};

pub const CRATE_NAME: &str = "mdp-adapters";

/// Filter criteria for one search area.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchQuery {
    pub area: String,
    pub max_price: u64,
    pub property_types: Vec<PropertyType>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FetchedPage {
    pub area: String,
    /// Listing-site URL that was rendered (never the proxy URL, which carries the key).
    pub url: String,
    pub html: String,
    pub fetched_at: DateTime<Utc>,
    pub credits_remaining: Option<String>,
}

#[derive(Debug, Error)]
pub enum ExtractionError {
    #[error(transparent)]
    Transport(#[from] FetchError),
    #[error("unparseable extraction reply: {0}")]
    Parse(String),
}

#[async_trait]
pub trait ListingSource: Send + Sync {
    fn name(&self) -> &'static str;

    async fn fetch_area(&self, query: &SearchQuery) -> Result<FetchedPage, FetchError>;
}

#[async_trait]
pub trait ListingExtractor: Send + Sync {
    fn name(&self) -> &'static str;

    /// Cheap upfront check that the configured credential is accepted.
    async fn validate_credentials(&self) -> Result<(), ExtractionError> {
        Ok(())
    }

    async fn extract(&self, page: &FetchedPage) -> Result<Vec<ListingCandidate>, ExtractionError>;
}
