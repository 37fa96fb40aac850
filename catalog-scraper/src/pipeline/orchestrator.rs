use std::path::PathBuf;
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use catalog_core::{IngestSummary, Product};

use crate::app::ports::HttpClientPort;
use crate::common::error::PipelineError;
use crate::observability::metrics;
use crate::pipeline::ingestion::envelope::{Cursor, RawPage};
use crate::pipeline::ingestion::fetcher::{PageFetcher, RetryPolicy};
use crate::pipeline::ingestion::ingest_meta::IngestMeta;
use crate::pipeline::ingestion::paginator::Paginator;
use crate::pipeline::ingestion::rate_limiter::RateLimiter;
use crate::pipeline::processing::dedup::{Admission, Deduplicator};
use crate::pipeline::processing::validate::{RecordValidator, ValidationConfig};
use crate::registry::source_loader::CatalogSourceSpec;

/// Caller-side knobs for one run.
#[derive(Debug, Clone, Default)]
pub struct PipelineOptions {
    pub bypass_cadence: bool,
    /// Ignore any checkpointed cursor and start from the top of the listing.
    pub restart: bool,
    /// Stop after this many pages, keeping the checkpoint for resume.
    pub max_pages: Option<u64>,
    /// Root for the local metadata store; `None` disables cadence, resume
    /// and cross-run dedup (one-shot runs, tests).
    pub data_root: Option<PathBuf>,
}

/// How a run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStatus {
    Completed,
    Cancelled,
    Failed,
    /// Cadence said the source was fetched too recently.
    Skipped,
}

/// Everything a run produced. Accepted records and the summary are kept
/// even when the run failed or was cancelled; partial results are always
/// usable.
#[derive(Debug)]
pub struct PipelineResult {
    pub run_id: Uuid,
    pub status: RunStatus,
    pub accepted: Vec<Product>,
    pub summary: IngestSummary,
    pub error: Option<PipelineError>,
}

/// Orchestrates paginate → validate → dedupe for one catalog source.
pub struct IngestionPipeline {
    spec: CatalogSourceSpec,
    http: Arc<dyn HttpClientPort>,
    options: PipelineOptions,
    cancel: CancellationToken,
}

impl std::fmt::Debug for IngestionPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IngestionPipeline")
            .field("spec", &self.spec)
            .field("options", &self.options)
            .field("cancel", &self.cancel)
            .finish_non_exhaustive()
    }
}

impl IngestionPipeline {
    /// Validates the source spec up front; broken configuration is the only
    /// error that can precede any work.
    pub fn new(
        spec: CatalogSourceSpec,
        http: Arc<dyn HttpClientPort>,
        options: PipelineOptions,
        cancel: CancellationToken,
    ) -> Result<Self, PipelineError> {
        spec.validate()?;
        if !spec.enabled {
            return Err(PipelineError::Config(format!(
                "source {} is disabled in the registry",
                spec.source_id
            )));
        }
        if spec.dedup.cross_run && options.data_root.is_none() {
            return Err(PipelineError::Config(
                "cross-run dedup requires a data root".to_string(),
            ));
        }
        Ok(Self { spec, http, options, cancel })
    }

    pub async fn run(&self) -> PipelineResult {
        let run_id = Uuid::new_v4();
        let mut result = PipelineResult {
            run_id,
            status: RunStatus::Completed,
            accepted: Vec::new(),
            summary: IngestSummary::default(),
            error: None,
        };
        info!("🚀 run {} starting for source {}", run_id, self.spec.source_id);

        match self.cadence_allows() {
            Ok(true) => {}
            Ok(false) => {
                info!(
                    "⏭️ source {} was fetched within its cadence interval; skipping",
                    self.spec.source_id
                );
                result.status = RunStatus::Skipped;
                return result;
            }
            Err(e) => {
                set_failure(&mut result, e);
                return result;
            }
        }

        let initial = match self.initial_cursor() {
            Ok(cursor) => cursor,
            Err(e) => {
                set_failure(&mut result, e);
                return result;
            }
        };
        if !initial.is_start() {
            info!("⏯️ resuming source {} from checkpointed cursor {}", self.spec.source_id, initial);
        }

        let limiter = Arc::new(RateLimiter::new(&self.spec.rate_limits));
        let fetcher = match PageFetcher::new(
            self.http.clone(),
            limiter,
            self.spec.endpoint.clone(),
            RetryPolicy::from(&self.spec.retry),
            self.cancel.clone(),
        ) {
            Ok(fetcher) => fetcher,
            Err(e) => {
                set_failure(&mut result, e);
                return result;
            }
        };
        let paginator = Paginator::new(fetcher, initial);
        let validator = RecordValidator::new(ValidationConfig::from(&self.spec.validation));
        let dedup = match self.build_deduplicator() {
            Ok(dedup) => dedup,
            Err(e) => {
                set_failure(&mut result, e);
                return result;
            }
        };

        match self.spec.prefetch_pages {
            Some(lookahead) if lookahead > 0 => {
                self.consume_prefetched(paginator, &validator, &dedup, &mut result, lookahead)
                    .await
            }
            _ => self.consume_sequential(paginator, &validator, &dedup, &mut result).await,
        }

        self.finish(&dedup, &mut result);
        result
    }

    /// Default mode: one page in flight at a time.
    async fn consume_sequential(
        &self,
        mut paginator: Paginator,
        validator: &RecordValidator,
        dedup: &Deduplicator,
        result: &mut PipelineResult,
    ) {
        let max_pages = self.options.max_pages.or(self.spec.max_pages);
        let mut pages_done: u64 = 0;
        let mut limit_reached = false;

        loop {
            if self.cancel.is_cancelled() {
                result.status = RunStatus::Cancelled;
                break;
            }
            if let Some(max) = max_pages {
                if pages_done >= max {
                    info!("⏸️ page limit {} reached; checkpoint kept for resume", max);
                    limit_reached = true;
                    break;
                }
            }
            match paginator.next_page().await {
                Ok(Some(page)) => {
                    if let Err(e) = self.consume_page(&page, validator, dedup, result) {
                        set_failure(result, e);
                        break;
                    }
                    pages_done += 1;
                }
                Ok(None) => break,
                Err(PipelineError::Cancelled) => {
                    result.status = RunStatus::Cancelled;
                    break;
                }
                Err(e) => {
                    set_failure(result, e);
                    break;
                }
            }
        }

        result.summary.pages_fetched = paginator.pages_fetched();
        if result.status == RunStatus::Completed && !limit_reached {
            if let Err(e) = self.clear_checkpoint() {
                set_failure(result, e);
            }
        }
    }

    /// Bounded prefetch: the paginator runs in a producer task feeding a
    /// channel of capacity `lookahead`. The channel is FIFO, so pages are
    /// consumed in fetch order and the accepted output keeps first-seen
    /// order.
    async fn consume_prefetched(
        &self,
        mut paginator: Paginator,
        validator: &RecordValidator,
        dedup: &Deduplicator,
        result: &mut PipelineResult,
        lookahead: usize,
    ) {
        let (tx, mut rx) = mpsc::channel::<Result<RawPage, PipelineError>>(lookahead);
        let producer = tokio::spawn(async move {
            loop {
                match paginator.next_page().await {
                    Ok(Some(page)) => {
                        if tx.send(Ok(page)).await.is_err() {
                            break;
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        let _ = tx.send(Err(e)).await;
                        break;
                    }
                }
            }
            paginator.pages_fetched()
        });

        let max_pages = self.options.max_pages.or(self.spec.max_pages);
        let mut pages_done: u64 = 0;
        let mut limit_reached = false;

        while let Some(item) = rx.recv().await {
            if self.cancel.is_cancelled() {
                result.status = RunStatus::Cancelled;
                break;
            }
            if let Some(max) = max_pages {
                if pages_done >= max {
                    info!("⏸️ page limit {} reached; checkpoint kept for resume", max);
                    limit_reached = true;
                    break;
                }
            }
            match item {
                Ok(page) => {
                    if let Err(e) = self.consume_page(&page, validator, dedup, result) {
                        set_failure(result, e);
                        break;
                    }
                    pages_done += 1;
                }
                Err(PipelineError::Cancelled) => {
                    result.status = RunStatus::Cancelled;
                    break;
                }
                Err(e) => {
                    set_failure(result, e);
                    break;
                }
            }
        }
        drop(rx);

        result.summary.pages_fetched = match producer.await {
            Ok(fetched) => fetched,
            Err(_) => pages_done,
        };
        if result.status == RunStatus::Completed && !limit_reached {
            if let Err(e) = self.clear_checkpoint() {
                set_failure(result, e);
            }
        }
    }

    /// Validate and admit one page's records in page order, then move the
    /// resume checkpoint past it.
    fn consume_page(
        &self,
        page: &RawPage,
        validator: &RecordValidator,
        dedup: &Deduplicator,
        result: &mut PipelineResult,
    ) -> Result<(), PipelineError> {
        for raw in &page.records {
            result.summary.records_seen += 1;
            match validator.validate(raw, page.fetched_at) {
                Ok(product) => match dedup.admit(&product) {
                    Admission::Accepted => {
                        result.summary.accepted += 1;
                        metrics::pipeline::record_accepted();
                        result.accepted.push(product);
                    }
                    Admission::Duplicate => {
                        result.summary.duplicates += 1;
                        metrics::pipeline::record_duplicate();
                        debug!("♻️ duplicate suppressed: {}", product.identity());
                    }
                },
                Err(rejection) => {
                    result.summary.rejects.bump(rejection.reason);
                    metrics::pipeline::record_rejected(rejection.reason.as_str());
                    debug!("🚫 record rejected: {}", rejection);
                }
            }
        }
        metrics::pipeline::page_consumed();
        debug!("📄 page at cursor {} consumed: {} records", page.cursor, page.records.len());
        self.checkpoint(page)
    }

    fn cadence_allows(&self) -> Result<bool, PipelineError> {
        if self.options.bypass_cadence {
            return Ok(true);
        }
        let (Some(min_interval), Some(root)) =
            (self.spec.min_fetch_interval_secs, self.options.data_root.as_ref())
        else {
            return Ok(true);
        };
        let meta = IngestMeta::open_at_root(root).map_err(meta_err)?;
        let now = Utc::now().timestamp();
        match meta.get_last_fetched_at(&self.spec.source_id).map_err(meta_err)? {
            Some(last) if now - last < min_interval => Ok(false),
            _ => Ok(true),
        }
    }

    fn initial_cursor(&self) -> Result<Cursor, PipelineError> {
        if self.options.restart {
            return Ok(Cursor::start());
        }
        let Some(root) = &self.options.data_root else {
            return Ok(Cursor::start());
        };
        let meta = IngestMeta::open_at_root(root).map_err(meta_err)?;
        Ok(meta
            .get_resume_cursor(&self.spec.source_id)
            .map_err(meta_err)?
            .unwrap_or_else(Cursor::start))
    }

    fn build_deduplicator(&self) -> Result<Deduplicator, PipelineError> {
        if !self.spec.dedup.cross_run {
            return Ok(Deduplicator::new());
        }
        let root = self.options.data_root.as_ref().ok_or_else(|| {
            PipelineError::Config("cross-run dedup requires a data root".to_string())
        })?;
        let meta = IngestMeta::open_at_root(root).map_err(meta_err)?;
        let identities = meta.load_identities(&self.spec.source_id).map_err(meta_err)?;
        if !identities.is_empty() {
            info!("🧠 preloaded {} identities for cross-run dedup", identities.len());
        }
        Ok(Deduplicator::preseeded(identities))
    }

    fn checkpoint(&self, page: &RawPage) -> Result<(), PipelineError> {
        let Some(root) = &self.options.data_root else {
            return Ok(());
        };
        let meta = IngestMeta::open_at_root(root).map_err(meta_err)?;
        match &page.next_cursor {
            Some(next) => meta.set_resume_cursor(&self.spec.source_id, next, Utc::now().timestamp()),
            None => meta.clear_resume_cursor(&self.spec.source_id),
        }
        .map_err(meta_err)
    }

    fn clear_checkpoint(&self) -> Result<(), PipelineError> {
        let Some(root) = &self.options.data_root else {
            return Ok(());
        };
        let meta = IngestMeta::open_at_root(root).map_err(meta_err)?;
        meta.clear_resume_cursor(&self.spec.source_id).map_err(meta_err)
    }

    /// Persist cross-run identities, update cadence, and report the run.
    fn finish(&self, dedup: &Deduplicator, result: &mut PipelineResult) {
        if self.spec.dedup.cross_run {
            if let Some(root) = &self.options.data_root {
                let admitted = dedup.admitted_this_run();
                let persisted = IngestMeta::open_at_root(root).and_then(|mut meta| {
                    meta.record_identities(&self.spec.source_id, &admitted, Utc::now().timestamp())
                });
                if let Err(e) = persisted {
                    warn!("⚠️ failed to persist {} identities for cross-run dedup: {}", admitted.len(), e);
                }
            }
        }

        if result.summary.pages_fetched > 0 {
            if let Some(root) = &self.options.data_root {
                let marked = IngestMeta::open_at_root(root).and_then(|meta| {
                    meta.set_last_fetched_at(&self.spec.source_id, Utc::now().timestamp())
                });
                if let Err(e) = marked {
                    warn!("⚠️ failed to update fetch cadence: {e}");
                }
            }
        }

        debug_assert!(result.summary.is_balanced(), "record accounting out of balance");
        info!(
            "✅ run {} {:?}: {} pages, {} records seen, {} accepted, {} duplicates, {} rejected",
            result.run_id,
            result.status,
            result.summary.pages_fetched,
            result.summary.records_seen,
            result.summary.accepted,
            result.summary.duplicates,
            result.summary.rejects.total()
        );
    }
}

fn set_failure(result: &mut PipelineResult, error: PipelineError) {
    error!("❌ run aborted: {error}");
    result.status = RunStatus::Failed;
    result.error = Some(error);
}

fn meta_err(e: anyhow::Error) -> PipelineError {
    PipelineError::Meta(e.to_string())
}
