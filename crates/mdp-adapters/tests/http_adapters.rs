use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use axum::extract::{Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::Utc;
use mdp_adapters::{
    AnthropicExtractor, ExtractionConfig, ExtractionError, FetchedPage, ListingExtractor,
    ListingSource, ScraperApiConfig, ScraperApiSource, SearchQuery,
};
use mdp_core::PropertyType;
use mdp_storage::{FetchError, HttpClientConfig, HttpFetcher};
use serde_json::{json, Value};
use tokio::net::TcpListener;

type Seen = Arc<Mutex<Vec<Value>>>;

const REPLY_TEXT: &str =
    "```json\n[{\"address\": \"8120 NE 2nd Ave\", \"price\": \"$489,000\", \"propertyType\": \"house\"}]\n```";

async fn spawn_stub(router: Router) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    format!("http://{addr}")
}

fn http() -> HttpFetcher {
    HttpFetcher::new(HttpClientConfig::default()).unwrap()
}

fn query() -> SearchQuery {
    SearchQuery {
        area: "Little Haiti, Miami, FL".into(),
        max_price: 650_000,
        property_types: vec![PropertyType::Land],
    }
}

async fn proxy_ok(
    State(seen): State<Seen>,
    Query(params): Query<HashMap<String, String>>,
) -> impl IntoResponse {
    seen.lock().unwrap().push(json!(params));
    (
        [("sa-credit-remaining", "4321")],
        "<html><body><div>8120 NE 2nd Ave $489,000</div></body></html>",
    )
}

async fn proxy_down() -> impl IntoResponse {
    (StatusCode::INTERNAL_SERVER_ERROR, "upstream exploded")
}

async fn proxy_stub() -> (String, Seen) {
    let seen = Seen::default();
    let router = Router::new()
        .route("/ok", get(proxy_ok))
        .route("/down", get(proxy_down))
        .with_state(Arc::clone(&seen));
    (spawn_stub(router).await, seen)
}

async fn messages_ok(
    State(seen): State<Seen>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Json<Value> {
    let header = |name: &str| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(ToString::to_string)
    };
    seen.lock().unwrap().push(json!({
        "x-api-key": header("x-api-key"),
        "anthropic-version": header("anthropic-version"),
        "body": body,
    }));
    Json(json!({
        "id": "msg_01",
        "type": "message",
        "content": [{"type": "text", "text": REPLY_TEXT}]
    }))
}

async fn messages_unauthorized() -> impl IntoResponse {
    (
        StatusCode::UNAUTHORIZED,
        Json(json!({"type": "error", "error": {"type": "authentication_error", "message": "invalid x-api-key"}})),
    )
}

async fn messages_without_text() -> Json<Value> {
    Json(json!({"id": "msg_02", "content": []}))
}

async fn messages_stub() -> (String, Seen) {
    let seen = Seen::default();
    let router = Router::new()
        .route("/ok", post(messages_ok))
        .route("/unauthorized", post(messages_unauthorized))
        .route("/empty", post(messages_without_text))
        .with_state(Arc::clone(&seen));
    (spawn_stub(router).await, seen)
}

fn extractor(base: &str, path: &str) -> AnthropicExtractor {
    let mut config = ExtractionConfig::new("test-anthropic-key", "test-model");
    config.endpoint = format!("{base}{path}");
    AnthropicExtractor::new(http(), config)
}

fn page() -> FetchedPage {
    FetchedPage {
        area: "Little Haiti".into(),
        url: "https://listings.test/little-haiti".into(),
        html: "<html><body><p>8120 NE 2nd Ave</p><p>$489,000</p></body></html>".into(),
        fetched_at: Utc::now(),
        credits_remaining: None,
    }
}

#[tokio::test]
async fn proxy_fetch_sends_target_and_reads_credits() {
    let (base, seen) = proxy_stub().await;
    let mut config = ScraperApiConfig::new("test-proxy-key");
    config.endpoint = format!("{base}/ok");
    let source = ScraperApiSource::new(http(), config);

    let page = source.fetch_area(&query()).await.unwrap();
    assert_eq!(page.area, "Little Haiti, Miami, FL");
    assert_eq!(page.credits_remaining.as_deref(), Some("4321"));
    assert!(page.html.contains("8120 NE 2nd Ave"));
    assert!(page.url.starts_with("https://www.zillow.com/homes/for_sale/"));
    assert!(!page.url.contains("test-proxy-key"));

    let params = seen.lock().unwrap()[0].clone();
    assert_eq!(params["api_key"], json!("test-proxy-key"));
    assert_eq!(params["render"], json!("true"));
    assert_eq!(params["country_code"], json!("us"));
    assert_eq!(params["url"], json!(page.url));
}

#[tokio::test]
async fn proxy_error_status_is_typed_and_keyless() {
    let (base, _seen) = proxy_stub().await;
    let mut config = ScraperApiConfig::new("test-proxy-key");
    config.endpoint = format!("{base}/down");
    let source = ScraperApiSource::new(http(), config);

    let err = source.fetch_area(&query()).await.unwrap_err();
    match &err {
        FetchError::HttpStatus {
            status,
            endpoint,
            body,
        } => {
            assert_eq!(*status, 500);
            assert_eq!(endpoint, &format!("{base}/down"));
            assert_eq!(body, "upstream exploded");
        }
        other => panic!("unexpected error: {other:?}"),
    }
    assert!(!err.to_string().contains("test-proxy-key"));
}

#[tokio::test]
async fn extraction_posts_messages_request_and_parses_reply() {
    let (base, seen) = messages_stub().await;
    let candidates = extractor(&base, "/ok").extract(&page()).await.unwrap();

    assert_eq!(candidates.len(), 1);
    assert_eq!(candidates[0].address.as_deref(), Some("8120 NE 2nd Ave"));
    assert_eq!(candidates[0].price, Some(489_000.0));
    assert_eq!(candidates[0].property_type, PropertyType::SingleFamily);

    let request = seen.lock().unwrap()[0].clone();
    assert_eq!(request["x-api-key"], json!("test-anthropic-key"));
    assert_eq!(request["anthropic-version"], json!("2023-06-01"));
    assert_eq!(request["body"]["model"], json!("test-model"));
    assert_eq!(request["body"]["max_tokens"], json!(4000));
    let prompt = request["body"]["messages"][0]["content"].as_str().unwrap();
    assert!(prompt.contains("Little Haiti"));
    assert!(prompt.ends_with("8120 NE 2nd Ave $489,000"));
}

#[tokio::test]
async fn credential_check_is_a_tiny_request() {
    let (base, seen) = messages_stub().await;
    extractor(&base, "/ok").validate_credentials().await.unwrap();

    let request = seen.lock().unwrap()[0].clone();
    assert_eq!(request["body"]["max_tokens"], json!(10));
    assert_eq!(request["body"]["messages"][0]["content"], json!("Say OK"));
}

#[tokio::test]
async fn rejected_key_surfaces_status() {
    let (base, _seen) = messages_stub().await;
    let err = extractor(&base, "/unauthorized")
        .validate_credentials()
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        ExtractionError::Transport(FetchError::HttpStatus { status: 401, .. })
    ));
    assert!(err.to_string().contains("invalid x-api-key"));
    assert!(!err.to_string().contains("test-anthropic-key"));
}

#[tokio::test]
async fn reply_without_text_block_is_a_parse_error() {
    let (base, _seen) = messages_stub().await;
    let err = extractor(&base, "/empty").extract(&page()).await.unwrap_err();
    assert!(matches!(err, ExtractionError::Parse(_)));
}
