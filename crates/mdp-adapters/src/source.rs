use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use mdp_core::PropertyType;
use mdp_storage::{FetchError, HttpFetcher};
use serde_json::json;
use tracing::info;
use url::Url;

use crate::{FetchedPage, ListingSource, SearchQuery};

const SEARCH_BASE_URL: &str = "https://www.zillow.com/homes/for_sale/";

fn zillow_property_type(property_type: PropertyType) -> Option<&'static str> {
    match property_type {
        PropertyType::SingleFamily => Some("house"),
        PropertyType::Multifamily => Some("multi_family"),
        PropertyType::Land => Some("lot"),
        PropertyType::Unknown => None,
    }
}

/// Search-results URL with the price ceiling and property types baked into
/// `searchQueryState`. Unmappable property types are dropped.
pub fn build_search_url(query: &SearchQuery) -> String {
    let types = query
        .property_types
        .iter()
        .copied()
        .filter_map(zillow_property_type)
        .collect::<Vec<_>>();
    let state = json!({
        "isMapVisible": true,
        "isListVisible": true,
        "filterState": {
            "price": {"max": query.max_price},
            "propertyType": {"value": types},
        },
        "usersSearchTerm": query.area,
        "pagination": {},
    });
    match Url::parse_with_params(SEARCH_BASE_URL, &[("searchQueryState", state.to_string())]) {
        Ok(url) => url.to_string(),
        Err(_) => SEARCH_BASE_URL.to_string(),
    }
}

#[derive(Debug, Clone)]
pub struct ScraperApiConfig {
    pub api_key: String,
    pub endpoint: String,
    pub timeout: Duration,
    pub country_code: String,
}

impl ScraperApiConfig {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            endpoint: "https://api.scraperapi.com/".to_string(),
            timeout: Duration::from_secs(45),
            country_code: "us".to_string(),
        }
    }
}

/// Fetches rendered search pages through the ScraperAPI proxy.
pub struct ScraperApiSource {
    http: HttpFetcher,
    config: ScraperApiConfig,
}

impl ScraperApiSource {
    pub fn new(http: HttpFetcher, config: ScraperApiConfig) -> Self {
        Self { http, config }
    }
}

#[async_trait]
impl ListingSource for ScraperApiSource {
    fn name(&self) -> &'static str {
        "scraperapi"
    }

    async fn fetch_area(&self, query: &SearchQuery) -> Result<FetchedPage, FetchError> {
        let target = build_search_url(query);
        let params = [
            ("api_key", self.config.api_key.as_str()),
            ("url", target.as_str()),
            ("render", "true"),
            ("country_code", self.config.country_code.as_str()),
        ];
        let resp = self
            .http
            .get_text(&self.config.endpoint, &params, Some(self.config.timeout))
            .await?;

        let credits_remaining = resp.header_str("sa-credit-remaining").map(ToString::to_string);
        info!(
            area = %query.area,
            status = resp.status.as_u16(),
            credits_remaining = credits_remaining.as_deref().unwrap_or("?"),
            bytes = resp.body.len(),
            "search page fetched"
        );

        Ok(FetchedPage {
            area: query.area.clone(),
            url: target,
            html: resp.body,
            fetched_at: Utc::now(),
            credits_remaining,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn query(types: Vec<PropertyType>) -> SearchQuery {
        SearchQuery {
            area: "Little Haiti, Miami, FL".into(),
            max_price: 650_000,
            property_types: types,
        }
    }

    fn decoded_state(url: &str) -> serde_json::Value {
        let parsed = Url::parse(url).unwrap();
        let (_, state) = parsed
            .query_pairs()
            .find(|(k, _)| k == "searchQueryState")
            .unwrap();
        serde_json::from_str(&state).unwrap()
    }

    #[test]
    fn search_url_carries_filters() {
        let url = build_search_url(&query(vec![
            PropertyType::Land,
            PropertyType::SingleFamily,
            PropertyType::Multifamily,
        ]));
        assert!(url.starts_with(SEARCH_BASE_URL));

        let state = decoded_state(&url);
        assert_eq!(state["filterState"]["price"]["max"], json!(650_000));
        assert_eq!(
            state["filterState"]["propertyType"]["value"],
            json!(["lot", "house", "multi_family"])
        );
        assert_eq!(state["usersSearchTerm"], json!("Little Haiti, Miami, FL"));
        assert_eq!(state["pagination"], json!({}));
    }

    #[test]
    fn unknown_property_types_are_dropped() {
        let state = decoded_state(&build_search_url(&query(vec![
            PropertyType::Unknown,
            PropertyType::Land,
        ])));
        assert_eq!(state["filterState"]["propertyType"]["value"], json!(["lot"]));
    }
}
