//! Dataset persistence, raw page archive, and the HTTP fetch layer.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use chrono::{DateTime, Utc};
use mdp_core::DealRecord;
use reqwest::header::HeaderMap;
use reqwest::StatusCode;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};
use uuid::Uuid;

pub const CRATE_NAME: &str = "mdp-storage";

const ERROR_BODY_SNIPPET_CHARS: usize = 300;

/// Writes `bytes` to a sibling temp file and renames it over `target`, so readers
/// only ever see the old or the new contents.
async fn write_atomically(target: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let parent = match target.parent() {
        Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
        _ => PathBuf::from("."),
    };
    fs::create_dir_all(&parent).await?;

    let temp_path = parent.join(format!(".{}.{}.tmp", Uuid::new_v4(), bytes.len()));
    let mut file = fs::OpenOptions::new()
        .create_new(true)
        .write(true)
        .open(&temp_path)
        .await?;
    let written = async {
        file.write_all(bytes).await?;
        file.flush().await
    }
    .await;
    drop(file);

    if let Err(err) = written {
        let _ = fs::remove_file(&temp_path).await;
        return Err(err);
    }
    if let Err(err) = fs::rename(&temp_path, target).await {
        let _ = fs::remove_file(&temp_path).await;
        return Err(err);
    }
    Ok(())
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("reading dataset {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("parsing dataset {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("serializing dataset: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("writing dataset {path}: {source}")]
    Write {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

/// The persisted deal dataset: one JSON array of [`DealRecord`]s, read and written whole.
#[derive(Debug, Clone)]
pub struct DatasetStore {
    path: PathBuf,
}

impl DatasetStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Loads the dataset in stored order. A missing or empty file is an empty dataset.
    pub async fn load(&self) -> Result<Vec<DealRecord>, StoreError> {
        let bytes = match fs::read(&self.path).await {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %self.path.display(), "no dataset on disk yet");
                return Ok(Vec::new());
            }
            Err(source) => {
                return Err(StoreError::Read {
                    path: self.path.display().to_string(),
                    source,
                })
            }
        };
        if bytes.iter().all(u8::is_ascii_whitespace) {
            return Ok(Vec::new());
        }
        serde_json::from_slice(&bytes).map_err(|source| StoreError::Parse {
            path: self.path.display().to_string(),
            source,
        })
    }

    pub async fn save(&self, deals: &[DealRecord]) -> Result<(), StoreError> {
        let bytes = serde_json::to_vec_pretty(deals)?;
        write_atomically(&self.path, &bytes)
            .await
            .map_err(|source| StoreError::Write {
                path: self.path.display().to_string(),
                source,
            })?;
        info!(path = %self.path.display(), deals = deals.len(), bytes = bytes.len(), "dataset saved");
        Ok(())
    }

    /// Raw document bytes, for serving without a parse round-trip.
    pub async fn read_raw(&self) -> Result<Vec<u8>, StoreError> {
        fs::read(&self.path).await.map_err(|source| StoreError::Read {
            path: self.path.display().to_string(),
            source,
        })
    }
}

pub fn slugify(input: &str) -> String {
    let slug = input
        .to_ascii_lowercase()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '-' })
        .collect::<String>()
        .split('-')
        .filter(|part| !part.is_empty())
        .collect::<Vec<_>>()
        .join("-");
    if slug.is_empty() {
        "area".to_string()
    } else {
        slug
    }
}

#[derive(Debug, Clone)]
pub struct StoredArtifact {
    pub content_hash: String,
    pub relative_path: PathBuf,
    pub absolute_path: PathBuf,
    pub byte_size: usize,
    pub deduplicated: bool,
}

/// Content-addressed archive of fetched search pages.
#[derive(Debug, Clone)]
pub struct ArtifactStore {
    root: PathBuf,
}

impl ArtifactStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn sha256_hex(bytes: &[u8]) -> String {
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        hex::encode(hasher.finalize())
    }

    pub fn artifact_relative_path(
        &self,
        fetched_at: DateTime<Utc>,
        area: &str,
        content_hash: &str,
    ) -> PathBuf {
        let stamp = fetched_at.format("%Y%m%d_%H%M%S").to_string();
        PathBuf::from(stamp)
            .join(slugify(area))
            .join(format!("{content_hash}.html"))
    }

    pub async fn store_page(
        &self,
        fetched_at: DateTime<Utc>,
        area: &str,
        html: &str,
    ) -> anyhow::Result<StoredArtifact> {
        let bytes = html.as_bytes();
        let content_hash = Self::sha256_hex(bytes);
        let relative_path = self.artifact_relative_path(fetched_at, area, &content_hash);
        let absolute_path = self.root.join(&relative_path);

        let deduplicated = fs::try_exists(&absolute_path)
            .await
            .with_context(|| format!("checking artifact path {}", absolute_path.display()))?;
        if !deduplicated {
            write_atomically(&absolute_path, bytes)
                .await
                .with_context(|| format!("writing artifact {}", absolute_path.display()))?;
        }

        Ok(StoredArtifact {
            content_hash,
            relative_path,
            absolute_path,
            byte_size: bytes.len(),
            deduplicated,
        })
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(45),
            user_agent: Some("mdp-bot/0.1".to_string()),
        }
    }
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: StatusCode,
    pub endpoint: String,
    pub headers: HeaderMap,
    pub body: String,
}

impl FetchedResponse {
    pub fn header_str(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }
}

/// Failure of a single outbound call. Endpoints are reported without their query
/// string, which may carry credentials.
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request to {endpoint} timed out")]
    Timeout { endpoint: String },
    #[error("request to {endpoint} failed: {source}")]
    Request {
        endpoint: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("http status {status} from {endpoint}: {body}")]
    HttpStatus {
        status: u16,
        endpoint: String,
        body: String,
    },
}

impl FetchError {
    fn from_reqwest(endpoint: &str, err: reqwest::Error) -> Self {
        if err.is_timeout() {
            FetchError::Timeout {
                endpoint: endpoint.to_string(),
            }
        } else {
            FetchError::Request {
                endpoint: endpoint.to_string(),
                source: err.without_url(),
            }
        }
    }
}

pub fn redact_endpoint(url: &str) -> String {
    match reqwest::Url::parse(url) {
        Ok(mut parsed) => {
            parsed.set_query(None);
            parsed.to_string()
        }
        Err(_) => url.split('?').next().unwrap_or(url).to_string(),
    }
}

fn snippet(body: &str) -> String {
    body.chars().take(ERROR_BODY_SNIPPET_CHARS).collect()
}

/// Thin wrapper over a pooled `reqwest::Client`: one attempt per call, fixed timeout,
/// non-success statuses surfaced as [`FetchError::HttpStatus`].
#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: reqwest::Client,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;
        Ok(Self { client })
    }

    pub async fn get_text(
        &self,
        url: &str,
        query: &[(&str, &str)],
        timeout: Option<Duration>,
    ) -> Result<FetchedResponse, FetchError> {
        let mut request = self.client.get(url).query(query);
        if let Some(timeout) = timeout {
            request = request.timeout(timeout);
        }
        self.finish(url, request).await
    }

    pub async fn post_json(
        &self,
        url: &str,
        headers: &[(&str, &str)],
        body: &serde_json::Value,
        timeout: Option<Duration>,
    ) -> Result<FetchedResponse, FetchError> {
        let mut request = self.client.post(url).json(body);
        for (name, value) in headers {
            request = request.header(*name, *value);
        }
        if let Some(timeout) = timeout {
            request = request.timeout(timeout);
        }
        self.finish(url, request).await
    }

    async fn finish(
        &self,
        url: &str,
        request: reqwest::RequestBuilder,
    ) -> Result<FetchedResponse, FetchError> {
        let endpoint = redact_endpoint(url);
        let resp = request
            .send()
            .await
            .map_err(|err| FetchError::from_reqwest(&endpoint, err))?;

        let status = resp.status();
        let headers = resp.headers().clone();
        let body = resp
            .text()
            .await
            .map_err(|err| FetchError::from_reqwest(&endpoint, err))?;
        debug!(%endpoint, status = status.as_u16(), bytes = body.len(), "http response");

        if !status.is_success() {
            return Err(FetchError::HttpStatus {
                status: status.as_u16(),
                endpoint,
                body: snippet(&body),
            });
        }

        Ok(FetchedResponse {
            status,
            endpoint,
            headers,
            body,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use mdp_core::ListingCandidate;
    use tempfile::tempdir;

    fn fetched_at() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 2, 24, 12, 0, 0).single().unwrap()
    }

    fn deal(address: &str, price: Option<f64>) -> DealRecord {
        DealRecord::from_candidate(
            ListingCandidate {
                address: Some(address.to_string()),
                price,
                ..Default::default()
            },
            fetched_at(),
        )
    }

    #[tokio::test]
    async fn missing_dataset_loads_empty() {
        let dir = tempdir().expect("tempdir");
        let store = DatasetStore::new(dir.path().join("deals.json"));
        assert!(store.load().await.expect("load").is_empty());
    }

    #[tokio::test]
    async fn save_then_load_preserves_order() {
        let dir = tempdir().expect("tempdir");
        let store = DatasetStore::new(dir.path().join("deals.json"));
        let deals = vec![deal("3 C St", Some(3.0)), deal("1 A St", None), deal("2 B St", Some(2.0))];

        store.save(&deals).await.expect("save");
        let loaded = store.load().await.expect("load");
        assert_eq!(loaded, deals);
    }

    #[tokio::test]
    async fn save_replaces_previous_document_without_leftovers() {
        let dir = tempdir().expect("tempdir");
        let store = DatasetStore::new(dir.path().join("deals.json"));
        store.save(&[deal("1 A St", None)]).await.expect("first save");
        store.save(&[]).await.expect("second save");

        assert!(store.load().await.expect("load").is_empty());
        let entries = std::fs::read_dir(dir.path())
            .expect("read_dir")
            .filter_map(|e| e.ok())
            .map(|e| e.file_name().to_string_lossy().to_string())
            .collect::<Vec<_>>();
        assert_eq!(entries, vec!["deals.json".to_string()]);
    }

    #[tokio::test]
    async fn corrupt_dataset_is_a_parse_error() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("deals.json");
        std::fs::write(&path, b"{not json").expect("write");
        let err = DatasetStore::new(&path).load().await.expect_err("should fail");
        assert!(matches!(err, StoreError::Parse { .. }));
    }

    #[test]
    fn artifact_hashing_is_stable() {
        let hash = ArtifactStore::sha256_hex(b"hello world");
        assert_eq!(
            hash,
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
    }

    #[tokio::test]
    async fn archived_pages_deduplicate_by_hash_path() {
        let dir = tempdir().expect("tempdir");
        let store = ArtifactStore::new(dir.path());

        let first = store
            .store_page(fetched_at(), "Little Havana", "<html>same</html>")
            .await
            .expect("first store");
        let second = store
            .store_page(fetched_at(), "Little Havana", "<html>same</html>")
            .await
            .expect("second store");

        assert!(!first.deduplicated);
        assert!(second.deduplicated);
        assert_eq!(first.relative_path, second.relative_path);
        assert!(first.relative_path.starts_with("20260224_120000/little-havana"));
        assert!(first.absolute_path.exists());
    }

    #[test]
    fn slugs_and_redaction() {
        assert_eq!(slugify("Coconut Grove, Miami"), "coconut-grove-miami");
        assert_eq!(slugify("***"), "area");
        assert_eq!(
            redact_endpoint("https://api.scraperapi.com/?api_key=secret&url=x"),
            "https://api.scraperapi.com/"
        );
    }
}
