use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::common::error::PipelineError;

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct EndpointSpec {
    pub url: String,
    #[serde(default = "default_method")]
    pub method: String,
    /// Query parameter carrying the pagination cursor.
    #[serde(default = "default_cursor_param")]
    pub cursor_param: String,
    #[serde(default)]
    pub page_size: Option<u32>,
    #[serde(default = "default_page_size_param")]
    pub page_size_param: String,
}

fn default_method() -> String {
    "GET".to_string()
}

fn default_cursor_param() -> String {
    "cursor".to_string()
}

fn default_page_size_param() -> String {
    "limit".to_string()
}

#[derive(Debug, Serialize, Deserialize, Clone, Default)]
pub struct RateLimitsSpec {
    pub requests_per_min: Option<u32>,
    /// Bucket capacity; defaults to a full minute of requests.
    pub burst: Option<u32>,
    pub concurrency: Option<u32>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct RetrySpec {
    pub max_attempts: u32,
    pub base_backoff_ms: u64,
    pub max_backoff_ms: u64,
    /// Overall wall-clock budget across attempts and backoff waits.
    pub total_budget_ms: u64,
    pub attempt_timeout_ms: u64,
}

impl Default for RetrySpec {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            base_backoff_ms: 500,
            max_backoff_ms: 30_000,
            total_budget_ms: 120_000,
            attempt_timeout_ms: 10_000,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct ValidationSpec {
    /// Plausibility ceiling for prices; values above it are rejected as
    /// upstream corruption.
    pub max_price: Decimal,
    /// Optional currency allow-list (case-insensitive three-letter codes).
    pub currencies: Option<Vec<String>>,
    /// When false, records without a stable identifier are admitted and
    /// deduplicate by content hash.
    pub require_identifier: bool,
}

impl Default for ValidationSpec {
    fn default() -> Self {
        Self {
            max_price: Decimal::new(1_000_000, 0),
            currencies: None,
            require_identifier: true,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, Default)]
#[serde(default)]
pub struct DedupSpec {
    /// Suppress records already seen by earlier runs of this source.
    pub cross_run: bool,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct CatalogSourceSpec {
    pub source_id: String,
    pub enabled: bool,
    pub endpoint: EndpointSpec,
    #[serde(default)]
    pub rate_limits: RateLimitsSpec,
    #[serde(default)]
    pub retry: RetrySpec,
    #[serde(default)]
    pub validation: ValidationSpec,
    #[serde(default)]
    pub dedup: DedupSpec,
    /// Minimum seconds between fetches of this source; absent disables
    /// cadence enforcement.
    #[serde(default)]
    pub min_fetch_interval_secs: Option<i64>,
    /// Pages buffered ahead of validation/dedup; absent or 0 runs strictly
    /// sequentially.
    #[serde(default)]
    pub prefetch_pages: Option<usize>,
    #[serde(default)]
    pub max_pages: Option<u64>,
}

impl CatalogSourceSpec {
    /// Reject broken configuration before any work begins.
    pub fn validate(&self) -> Result<(), PipelineError> {
        let config = |msg: String| Err(PipelineError::Config(msg));

        if self.source_id.trim().is_empty() {
            return config("source_id is empty".into());
        }
        match reqwest::Url::parse(&self.endpoint.url) {
            Ok(url) if url.scheme() == "http" || url.scheme() == "https" => {}
            Ok(url) => return config(format!("endpoint scheme '{}' is not http(s)", url.scheme())),
            Err(e) => return config(format!("endpoint url: {e}")),
        }
        if !self.endpoint.method.eq_ignore_ascii_case("GET") {
            return config(format!("endpoint method '{}' is not supported", self.endpoint.method));
        }
        if self.endpoint.page_size == Some(0) {
            return config("endpoint page_size must be positive".into());
        }
        if self.rate_limits.requests_per_min == Some(0) {
            return config("rate_limits.requests_per_min must be positive".into());
        }
        if self.rate_limits.burst == Some(0) {
            return config("rate_limits.burst must be positive".into());
        }
        if self.rate_limits.concurrency == Some(0) {
            return config("rate_limits.concurrency must be positive".into());
        }
        if self.retry.max_attempts == 0 {
            return config("retry.max_attempts must be at least 1".into());
        }
        if self.retry.base_backoff_ms == 0 {
            return config("retry.base_backoff_ms must be positive".into());
        }
        if self.retry.max_backoff_ms < self.retry.base_backoff_ms {
            return config("retry.max_backoff_ms is below retry.base_backoff_ms".into());
        }
        if self.retry.attempt_timeout_ms == 0 {
            return config("retry.attempt_timeout_ms must be positive".into());
        }
        if self.retry.total_budget_ms == 0 {
            return config("retry.total_budget_ms must be positive".into());
        }
        if self.validation.max_price <= Decimal::ZERO {
            return config("validation.max_price must be positive".into());
        }
        if let Some(secs) = self.min_fetch_interval_secs {
            if secs < 0 {
                return config("min_fetch_interval_secs must not be negative".into());
            }
        }
        Ok(())
    }
}

pub fn load_source_spec(path: &Path) -> anyhow::Result<CatalogSourceSpec> {
    let raw = fs::read_to_string(path)?;
    let spec: CatalogSourceSpec = serde_json::from_str(&raw)?;
    Ok(spec)
}

/// Directory of per-source spec files, `{dir}/{source_id}.json`.
#[derive(Debug, Clone)]
pub struct SourceRegistry {
    dir: PathBuf,
}

impl SourceRegistry {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Registry location from `CATALOG_REGISTRY_DIR`, defaulting to the
    /// conventional `registry/sources`.
    pub fn from_env() -> Self {
        let dir = std::env::var("CATALOG_REGISTRY_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("registry/sources"));
        Self::new(dir)
    }

    pub fn load(&self, source_id: &str) -> anyhow::Result<CatalogSourceSpec> {
        let path = self.dir.join(format!("{source_id}.json"));
        load_source_spec(&path)
            .map_err(|e| anyhow::anyhow!("failed to load registry spec for {source_id}: {e}"))
    }
}
