//! Ingestion run orchestration: listing -> novelty filter -> per-item detail -> store.

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, FixedOffset, Utc};
use promowatch_adapters::{ExtractionError, SiteAdapter, SiteSelectors};
use promowatch_core::{CandidateReference, IngestedAnnouncement};
use promowatch_storage::{
    AnnouncementStore, FetchError, HttpClientConfig, HttpFetcher, PageSource,
    SqliteAnnouncementStore, StoreError,
};
use serde::Serialize;
use sqlx::SqlitePool;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "promowatch-sync";

#[derive(Debug, Clone)]
pub struct IngestConfig {
    pub database_url: String,
    pub listing_url: String,
    pub detail_prefix: String,
    pub user_agent: String,
    pub http_timeout_secs: u64,
    pub source_utc_offset_hours: i32,
    pub selectors_file: Option<PathBuf>,
    pub schedule_cron: String,
    pub web_port: u16,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            database_url: "sqlite://database.db".to_string(),
            listing_url: "https://www.starbucks.com.tw/stores/allevent.jspx?type=all".to_string(),
            detail_prefix: "https://www.starbucks.com.tw/stores/".to_string(),
            user_agent: "promowatch-bot/0.1".to_string(),
            http_timeout_secs: 20,
            source_utc_offset_hours: 8,
            selectors_file: None,
            schedule_cron: "0 0 6,18 * * *".to_string(),
            web_port: 8000,
        }
    }
}

impl IngestConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            database_url: std::env::var("DATABASE_URL").unwrap_or(defaults.database_url),
            listing_url: std::env::var("PROMOWATCH_LISTING_URL").unwrap_or(defaults.listing_url),
            detail_prefix: std::env::var("PROMOWATCH_DETAIL_PREFIX")
                .unwrap_or(defaults.detail_prefix),
            user_agent: std::env::var("PROMOWATCH_USER_AGENT").unwrap_or(defaults.user_agent),
            http_timeout_secs: std::env::var("PROMOWATCH_HTTP_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .filter(|secs| *secs > 0)
                .unwrap_or(defaults.http_timeout_secs),
            source_utc_offset_hours: std::env::var("PROMOWATCH_SOURCE_UTC_OFFSET_HOURS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.source_utc_offset_hours),
            selectors_file: std::env::var("PROMOWATCH_SELECTORS_FILE")
                .ok()
                .filter(|v| !v.trim().is_empty())
                .map(PathBuf::from),
            schedule_cron: std::env::var("PROMOWATCH_SCHEDULE_CRON")
                .unwrap_or(defaults.schedule_cron),
            web_port: std::env::var("PROMOWATCH_WEB_PORT")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.web_port),
        }
    }

    pub fn utc_offset(&self) -> Result<FixedOffset> {
        self.source_utc_offset_hours
            .checked_mul(3600)
            .and_then(FixedOffset::east_opt)
            .with_context(|| {
                format!(
                    "source utc offset {}h is out of range",
                    self.source_utc_offset_hours
                )
            })
    }

    pub fn selectors(&self) -> Result<SiteSelectors> {
        match &self.selectors_file {
            Some(path) => SiteSelectors::from_yaml_file(path),
            None => Ok(SiteSelectors::default()),
        }
    }

    pub fn site_adapter(&self) -> Result<SiteAdapter> {
        SiteAdapter::new(&self.selectors()?, self.detail_prefix.clone(), self.utc_offset()?)
            .context("compiling site selectors")
    }

    pub fn http_fetcher(&self) -> Result<HttpFetcher> {
        HttpFetcher::new(HttpClientConfig {
            timeout: Duration::from_secs(self.http_timeout_secs),
            user_agent: Some(self.user_agent.clone()),
        })
    }
}

/// Keep candidates strictly newer than `cursor`, in input order, first occurrence wins.
pub fn select_novel(
    candidates: impl IntoIterator<Item = CandidateReference>,
    cursor: i64,
) -> Vec<CandidateReference> {
    let mut seen = HashSet::new();
    candidates
        .into_iter()
        .filter(|c| c.identifier > cursor)
        .filter(|c| seen.insert(c.identifier))
        .collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    /// Every novel candidate was attempted.
    Completed,
    /// Listing parsed but held no usable entries.
    NoCandidates,
    ListingUnavailable,
    ListingUnparseable,
    CursorUnavailable,
    /// Another run held the run guard.
    Overlapping,
}

impl RunStatus {
    pub fn is_failure(self) -> bool {
        matches!(
            self,
            Self::ListingUnavailable | Self::ListingUnparseable | Self::CursorUnavailable
        )
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SkipCounts {
    pub fetch: usize,
    pub extraction: usize,
    pub store: usize,
}

impl SkipCounts {
    pub fn total(&self) -> usize {
        self.fetch + self.extraction + self.store
    }

    fn record(&mut self, err: &ItemError) {
        match err {
            ItemError::Fetch(_) => self.fetch += 1,
            ItemError::Extraction(_) => self.extraction += 1,
            ItemError::Store(_) => self.store += 1,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct IngestRunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub status: RunStatus,
    pub cursor: Option<i64>,
    pub candidates: usize,
    pub novel: usize,
    pub persisted: usize,
    pub skipped: SkipCounts,
}

impl IngestRunSummary {
    fn start(run_id: Uuid) -> Self {
        let now = Utc::now();
        Self {
            run_id,
            started_at: now,
            finished_at: now,
            status: RunStatus::Completed,
            cursor: None,
            candidates: 0,
            novel: 0,
            persisted: 0,
            skipped: SkipCounts::default(),
        }
    }

    fn finish(mut self, status: RunStatus) -> Self {
        self.status = status;
        self.finished_at = Utc::now();
        self
    }
}

/// Per-item failure. Caught at the item boundary; the run moves on.
#[derive(Debug, Error)]
enum ItemError {
    #[error("detail fetch failed: {0}")]
    Fetch(#[from] FetchError),
    #[error("detail extraction failed: {0}")]
    Extraction(#[from] ExtractionError),
    #[error("append failed: {0}")]
    Store(#[from] StoreError),
}

pub struct IngestPipeline<P, S> {
    listing_url: String,
    adapter: SiteAdapter,
    pages: P,
    store: S,
    run_guard: Mutex<()>,
}

impl<P, S> IngestPipeline<P, S>
where
    P: PageSource,
    S: AnnouncementStore,
{
    pub fn new(listing_url: impl Into<String>, adapter: SiteAdapter, pages: P, store: S) -> Self {
        Self {
            listing_url: listing_url.into(),
            adapter,
            pages,
            store,
            run_guard: Mutex::new(()),
        }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// One traversal of the pipeline. Never fails as a whole on item-level errors;
    /// run-level problems are reported through [`RunStatus`].
    pub async fn run_once(&self) -> IngestRunSummary {
        let run_id = Uuid::new_v4();
        let span = info_span!("ingest_run", %run_id);
        self.run_guarded(run_id).instrument(span).await
    }

    async fn run_guarded(&self, run_id: Uuid) -> IngestRunSummary {
        let mut summary = IngestRunSummary::start(run_id);
        let Ok(_guard) = self.run_guard.try_lock() else {
            warn!("previous ingest run still in progress; skipping this one");
            return summary.finish(RunStatus::Overlapping);
        };

        let listing = match self.pages.fetch(&self.listing_url).await {
            Ok(markup) => markup,
            Err(err) => {
                error!(url = %self.listing_url, error = %err, "listing fetch failed; run aborted");
                return summary.finish(RunStatus::ListingUnavailable);
            }
        };

        let candidates = match self.adapter.extract_candidates(&listing) {
            Ok(candidates) => candidates,
            Err(err) => {
                error!(url = %self.listing_url, error = %err, "listing could not be parsed; run aborted");
                return summary.finish(RunStatus::ListingUnparseable);
            }
        };
        summary.candidates = candidates.len();
        if candidates.is_empty() {
            info!(url = %self.listing_url, "listing has no candidates; nothing to do");
            return summary.finish(RunStatus::NoCandidates);
        }

        let cursor = match self.store.max_identifier().await {
            Ok(cursor) => cursor,
            Err(err) => {
                error!(error = %err, "could not read ingestion cursor; run aborted");
                return summary.finish(RunStatus::CursorUnavailable);
            }
        };
        summary.cursor = Some(cursor);

        let novel = select_novel(candidates, cursor);
        summary.novel = novel.len();
        info!(cursor, candidates = summary.candidates, novel = summary.novel, "selected novel candidates");

        for candidate in &novel {
            match self.ingest_candidate(candidate).await {
                Ok(()) => summary.persisted += 1,
                Err(err) => {
                    warn!(identifier = candidate.identifier, link = %candidate.link, error = %err, "skipping candidate");
                    summary.skipped.record(&err);
                }
            }
        }

        info!(
            persisted = summary.persisted,
            skipped = summary.skipped.total(),
            "ingest run finished"
        );
        summary.finish(RunStatus::Completed)
    }

    async fn ingest_candidate(&self, candidate: &CandidateReference) -> Result<(), ItemError> {
        let url = self.adapter.detail_url(candidate);
        let markup = self.pages.fetch(&url).await?;
        let record = self.adapter.extract_record(&markup)?;
        let item = IngestedAnnouncement {
            identifier: candidate.identifier,
            source_url: url,
            fetched_at: Utc::now(),
            record,
        };
        self.store.append(&item).await?;
        info!(identifier = item.identifier, title = %item.record.title, "persisted announcement");
        Ok(())
    }
}

pub type SitePipeline = IngestPipeline<HttpFetcher, SqliteAnnouncementStore>;

/// Wire the production pipeline around an already opened pool.
pub fn build_pipeline(config: &IngestConfig, pool: SqlitePool) -> Result<SitePipeline> {
    Ok(IngestPipeline::new(
        config.listing_url.clone(),
        config.site_adapter()?,
        config.http_fetcher()?,
        SqliteAnnouncementStore::new(pool),
    ))
}

/// Open the store, run once, and release the store on every path.
pub async fn run_ingest_once_from_env() -> Result<IngestRunSummary> {
    let config = IngestConfig::from_env();
    let pool = promowatch_storage::connect(&config.database_url).await?;
    let result = async {
        promowatch_storage::migrate(&pool).await?;
        let pipeline = build_pipeline(&config, pool.clone())?;
        Ok::<_, anyhow::Error>(pipeline.run_once().await)
    }
    .await;
    pool.close().await;
    result
}

/// Cron-driven runs. Ticks that land on a still-running ingest are skipped by the run guard.
pub async fn build_scheduler<P, S>(
    pipeline: Arc<IngestPipeline<P, S>>,
    cron: &str,
) -> Result<JobScheduler>
where
    P: PageSource + 'static,
    S: AnnouncementStore + 'static,
{
    let sched = JobScheduler::new().await.context("creating scheduler")?;
    let job = Job::new_async(cron, move |_uuid, _l| {
        let pipeline = Arc::clone(&pipeline);
        Box::pin(async move {
            let summary = pipeline.run_once().await;
            info!(
                run_id = %summary.run_id,
                status = ?summary.status,
                persisted = summary.persisted,
                "scheduled ingest run done"
            );
        })
    })
    .with_context(|| format!("creating scheduler job for cron {cron}"))?;
    sched.add(job).await.context("adding scheduler job")?;
    Ok(sched)
}
