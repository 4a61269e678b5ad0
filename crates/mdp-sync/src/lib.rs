//! Sync pipeline: search areas are fetched and extracted one at a time, then the
//! accumulated candidates are merged into the persisted deal dataset.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use mdp_adapters::{
    AnthropicExtractor, ExtractionConfig, ExtractionError, ListingExtractor, ListingSource,
    ScraperApiConfig, ScraperApiSource, SearchQuery,
};
use mdp_core::{ListingCandidate, PropertyType};
use mdp_storage::{ArtifactStore, DatasetStore, FetchError, HttpClientConfig, HttpFetcher};
use serde::{de, Deserialize, Deserializer, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;
use tokio::fs;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

pub mod merge;

pub use merge::{LastSeenPolicy, MergeConfig, MergeEngine, MergeOutcome};

pub const CRATE_NAME: &str = "mdp-sync";
pub const DEFAULT_EXTRACTION_MODEL: &str = "claude-haiku-4-5-20251001";
pub const DEFAULT_SYNC_CRON: &str = "0 11 * * *";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{0} is not set")]
    MissingCredential(&'static str),
    #[error("{var} has invalid value {value:?}")]
    Invalid { var: &'static str, value: String },
}

/// Process configuration, read once at startup and handed to the pipeline.
#[derive(Clone)]
pub struct SyncConfig {
    pub scraper_api_key: String,
    pub anthropic_api_key: String,
    pub config_path: PathBuf,
    pub deals_path: PathBuf,
    pub artifacts_dir: Option<PathBuf>,
    pub area_delay: Duration,
    pub extraction_model: String,
    pub user_agent: String,
    pub sync_cron: String,
    pub last_seen_policy: LastSeenPolicy,
}

impl fmt::Debug for SyncConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SyncConfig")
            .field("scraper_api_key", &mask_secret(&self.scraper_api_key))
            .field("anthropic_api_key", &mask_secret(&self.anthropic_api_key))
            .field("config_path", &self.config_path)
            .field("deals_path", &self.deals_path)
            .field("artifacts_dir", &self.artifacts_dir)
            .field("area_delay", &self.area_delay)
            .field("extraction_model", &self.extraction_model)
            .field("user_agent", &self.user_agent)
            .field("sync_cron", &self.sync_cron)
            .field("last_seen_policy", &self.last_seen_policy)
            .finish()
    }
}

impl SyncConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Blank values count as unset.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let var = |name: &str| {
            lookup(name)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };

        let scraper_api_key =
            var("SCRAPER_API_KEY").ok_or(ConfigError::MissingCredential("SCRAPER_API_KEY"))?;
        let anthropic_api_key =
            var("ANTHROPIC_API_KEY").ok_or(ConfigError::MissingCredential("ANTHROPIC_API_KEY"))?;

        let area_delay = match var("MDP_AREA_DELAY_SECS") {
            Some(raw) => Duration::from_secs(raw.parse().map_err(|_| ConfigError::Invalid {
                var: "MDP_AREA_DELAY_SECS",
                value: raw.clone(),
            })?),
            None => Duration::from_secs(2),
        };
        let last_seen_policy = match var("MDP_LAST_SEEN_POLICY") {
            Some(raw) => LastSeenPolicy::from_name(&raw).ok_or(ConfigError::Invalid {
                var: "MDP_LAST_SEEN_POLICY",
                value: raw.clone(),
            })?,
            None => LastSeenPolicy::default(),
        };

        Ok(Self {
            scraper_api_key,
            anthropic_api_key,
            config_path: var("MDP_CONFIG_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("config.json")),
            deals_path: var("MDP_DEALS_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("deals.json")),
            artifacts_dir: var("MDP_ARTIFACTS_DIR").map(PathBuf::from),
            area_delay,
            extraction_model: var("MDP_EXTRACTION_MODEL")
                .unwrap_or_else(|| DEFAULT_EXTRACTION_MODEL.to_string()),
            user_agent: var("MDP_USER_AGENT").unwrap_or_else(|| "mdp-bot/0.1".to_string()),
            sync_cron: var("MDP_SYNC_CRON").unwrap_or_else(|| DEFAULT_SYNC_CRON.to_string()),
            last_seen_policy,
        })
    }
}

/// `sk-ant-a...wxyz (len=108)`; short secrets are fully hidden.
pub fn mask_secret(secret: &str) -> String {
    let chars = secret.chars().collect::<Vec<_>>();
    if chars.len() <= 12 {
        return format!("*** (len={})", chars.len());
    }
    let head = chars[..8].iter().collect::<String>();
    let tail = chars[chars.len() - 4..].iter().collect::<String>();
    format!("{head}...{tail} (len={})", chars.len())
}

#[derive(Debug, Clone, Deserialize)]
struct SearchConfigFile {
    search: SearchConfig,
}

/// Which areas to search and with what filters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchConfig {
    pub neighborhoods: Vec<String>,
    #[serde(deserialize_with = "price_ceiling")]
    pub max_price: u64,
    #[serde(default)]
    pub property_types: Vec<PropertyType>,
}

/// Any non-negative number, including `750000.0` and `"$750,000"`, rounded to whole dollars.
fn price_ceiling<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u64, D::Error> {
    let raw = JsonValue::deserialize(deserializer)?;
    match mdp_core::lenient::number_from_json(&raw) {
        Some(n) if (0.0..=u64::MAX as f64).contains(&n) => Ok(n.round() as u64),
        _ => Err(de::Error::custom(format!("max_price must be a non-negative number, got {raw}"))),
    }
}

impl SearchConfig {
    pub fn queries(&self) -> Vec<SearchQuery> {
        self.neighborhoods
            .iter()
            .map(|area| SearchQuery {
                area: area.clone(),
                max_price: self.max_price,
                property_types: self.property_types.clone(),
            })
            .collect()
    }
}

pub async fn load_search_config(path: &Path) -> Result<SearchConfig> {
    let text = fs::read_to_string(path)
        .await
        .with_context(|| format!("reading {}", path.display()))?;
    let file: SearchConfigFile =
        serde_json::from_str(&text).with_context(|| format!("parsing {}", path.display()))?;
    Ok(file.search)
}

/// Why one area contributed nothing to a run.
#[derive(Debug, Error)]
pub enum AreaFailure {
    #[error("fetch failed: {0}")]
    Fetch(#[source] FetchError),
    #[error("extraction failed: {0}")]
    Extraction(#[source] ExtractionError),
}

#[derive(Debug, Clone, Serialize)]
pub struct SyncRunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub areas: usize,
    pub failed_areas: Vec<String>,
    pub raw_candidates: usize,
    pub new_deals: usize,
    pub price_updates: usize,
    pub updated_addresses: Vec<String>,
    pub total_deals: usize,
    pub dataset_path: String,
}

pub struct SyncPipeline {
    config: SyncConfig,
    store: DatasetStore,
    artifacts: Option<ArtifactStore>,
    source: Box<dyn ListingSource>,
    extractor: Box<dyn ListingExtractor>,
    merge: MergeEngine,
}

impl SyncPipeline {
    pub fn new(config: SyncConfig) -> Result<Self> {
        let http = HttpFetcher::new(HttpClientConfig {
            user_agent: Some(config.user_agent.clone()),
            ..Default::default()
        })?;
        let source = ScraperApiSource::new(
            http.clone(),
            ScraperApiConfig::new(config.scraper_api_key.clone()),
        );
        let extractor = AnthropicExtractor::new(
            http,
            ExtractionConfig::new(
                config.anthropic_api_key.clone(),
                config.extraction_model.clone(),
            ),
        );
        Ok(Self::with_adapters(
            config,
            Box::new(source),
            Box::new(extractor),
        ))
    }

    pub fn with_adapters(
        config: SyncConfig,
        source: Box<dyn ListingSource>,
        extractor: Box<dyn ListingExtractor>,
    ) -> Self {
        Self {
            store: DatasetStore::new(config.deals_path.clone()),
            artifacts: config.artifacts_dir.clone().map(ArtifactStore::new),
            merge: MergeEngine::new(MergeConfig {
                last_seen_policy: config.last_seen_policy,
            }),
            source,
            extractor,
            config,
        }
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub async fn run_once(&self) -> Result<SyncRunSummary> {
        let run_id = Uuid::new_v4();
        self.run(run_id)
            .instrument(info_span!("sync_run", %run_id))
            .await
    }

    async fn run(&self, run_id: Uuid) -> Result<SyncRunSummary> {
        let started_at = Utc::now();
        let search = load_search_config(&self.config.config_path).await?;

        info!(
            scraper_api_key = %mask_secret(&self.config.scraper_api_key),
            anthropic_api_key = %mask_secret(&self.config.anthropic_api_key),
            "credentials loaded"
        );
        self.extractor
            .validate_credentials()
            .await
            .with_context(|| format!("{} rejected the configured credential", self.extractor.name()))?;
        info!(extractor = self.extractor.name(), "extraction credential accepted");

        // Read before any area is fetched, so a corrupt dataset costs no credits.
        let existing = self.store.load().await.context("loading dataset")?;
        debug!(deals = existing.len(), "dataset loaded");

        let queries = search.queries();
        info!(
            areas = queries.len(),
            max_price = search.max_price,
            property_types = ?search.property_types,
            source = self.source.name(),
            "searching"
        );

        let mut candidates = Vec::new();
        let mut failed_areas = Vec::new();
        for (i, query) in queries.iter().enumerate() {
            info!(index = i + 1, total = queries.len(), area = %query.area, "processing area");
            match self.collect_area(query).await {
                Ok(found) => candidates.extend(found),
                Err(reason) => {
                    warn!(area = %query.area, %reason, "area contributes no candidates");
                    failed_areas.push(query.area.clone());
                }
            }
            if i + 1 < queries.len() && !self.config.area_delay.is_zero() {
                tokio::time::sleep(self.config.area_delay).await;
            }
        }
        let raw_candidates = candidates.len();
        info!(raw_candidates, "all areas processed");

        let outcome = self.merge.merge(candidates, existing, Utc::now());
        self.store
            .save(&outcome.dataset)
            .await
            .context("saving dataset")?;

        let summary = SyncRunSummary {
            run_id,
            started_at,
            finished_at: Utc::now(),
            areas: queries.len(),
            failed_areas,
            raw_candidates,
            new_deals: outcome.new_records.len(),
            price_updates: outcome.updated_addresses.len(),
            updated_addresses: outcome.updated_addresses,
            total_deals: outcome.dataset.len(),
            dataset_path: self.store.path().display().to_string(),
        };
        info!(
            new_deals = summary.new_deals,
            price_updates = summary.price_updates,
            total_deals = summary.total_deals,
            failed_areas = summary.failed_areas.len(),
            "sync finished"
        );
        Ok(summary)
    }

    async fn collect_area(&self, query: &SearchQuery) -> Result<Vec<ListingCandidate>, AreaFailure> {
        let page = self
            .source
            .fetch_area(query)
            .await
            .map_err(AreaFailure::Fetch)?;

        if let Some(artifacts) = &self.artifacts {
            match artifacts
                .store_page(page.fetched_at, &page.area, &page.html)
                .await
            {
                Ok(stored) => debug!(
                    path = %stored.relative_path.display(),
                    deduplicated = stored.deduplicated,
                    "page archived"
                ),
                Err(err) => warn!(error = %format!("{err:#}"), "page archive failed"),
            }
        }

        let mut found = self
            .extractor
            .extract(&page)
            .await
            .map_err(AreaFailure::Extraction)?;
        for candidate in &mut found {
            candidate.neighborhood = Some(query.area.clone());
        }
        Ok(found)
    }
}

pub async fn run_sync_once_from_env() -> Result<SyncRunSummary> {
    let config = SyncConfig::from_env()?;
    SyncPipeline::new(config)?.run_once().await
}

/// A scheduler that runs the pipeline on the configured cron expression. A failed
/// run is logged and the schedule continues.
pub async fn build_scheduler(pipeline: Arc<SyncPipeline>) -> Result<JobScheduler> {
    let cron = pipeline.config().sync_cron.clone();
    let sched = JobScheduler::new().await.context("creating scheduler")?;
    let job = Job::new_async(cron.as_str(), move |_uuid, _l| {
        let pipeline = Arc::clone(&pipeline);
        Box::pin(async move {
            match pipeline.run_once().await {
                Ok(summary) => info!(
                    run_id = %summary.run_id,
                    new_deals = summary.new_deals,
                    price_updates = summary.price_updates,
                    "scheduled sync finished"
                ),
                Err(err) => error!(error = %format!("{err:#}"), "scheduled sync failed"),
            }
        })
    })
    .with_context(|| format!("creating scheduler job for cron {cron}"))?;
    sched.add(job).await.context("adding scheduler job")?;
    Ok(sched)
}

/// Runs the schedule until ctrl-c.
pub async fn run_scheduled(pipeline: Arc<SyncPipeline>) -> Result<()> {
    let cron = pipeline.config().sync_cron.clone();
    let mut sched = build_scheduler(pipeline).await?;
    sched.start().await.context("starting scheduler")?;
    info!(%cron, "scheduler started");

    tokio::signal::ctrl_c()
        .await
        .context("waiting for shutdown signal")?;
    info!("shutting down scheduler");
    sched.shutdown().await.context("stopping scheduler")?;
    Ok(())
}
