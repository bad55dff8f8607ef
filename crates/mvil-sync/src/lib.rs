//! Ingestion, duplicate resolution, role aggregation and refresh orchestration.

mod aggregate;
mod config;
mod dedup;
mod export;
mod ingest;
mod refresh;
mod signature;

use std::sync::Arc;

use anyhow::Context;
use chrono::Utc;
use mvil_core::RawPosting;
use mvil_normalize::Taxonomy;
use mvil_storage::{BaselineStore, CorpusStore, MemoryStore};
use tokio_cron_scheduler::{Job, JobScheduler};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

pub use aggregate::{family_samples, is_qualifying, BaselineComputer, FamilySample, RoleAggregator};
pub use config::MvilConfig;
pub use dedup::{
    DedupConfig, DuplicateResolver, ResolveError, COMPANY_FIELD_WEIGHT, LOCATION_FIELD_WEIGHT,
    TITLE_FIELD_WEIGHT,
};
pub use export::{export_baseline_snapshots, ExportError, SnapshotFile, SnapshotManifest};
pub use ingest::{IngestError, IngestFailure, IngestOutcome, IngestPipeline, IngestSummary};
pub use refresh::{AggregationError, RefreshManager, RefreshMode, RefreshOutcome};
pub use signature::{content_signature, signature_similarity};

pub const CRATE_NAME: &str = "mvil-sync";

/// Everything a host process needs, wired from one config and one pair of stores.
#[derive(Clone)]
pub struct InsightsService {
    pub config: MvilConfig,
    pub taxonomy: Arc<Taxonomy>,
    pub corpus: Arc<dyn CorpusStore>,
    pub baselines: Arc<dyn BaselineStore>,
    pub ingest: IngestPipeline,
    pub refresh: Arc<RefreshManager>,
}

impl InsightsService {
    pub fn new(
        config: MvilConfig,
        taxonomy: Taxonomy,
        corpus: Arc<dyn CorpusStore>,
        baselines: Arc<dyn BaselineStore>,
    ) -> Self {
        let taxonomy = Arc::new(taxonomy);
        let resolver = Arc::new(DuplicateResolver::new(config.dedup, taxonomy.clone()));
        let ingest = IngestPipeline::new(
            taxonomy.clone(),
            resolver,
            corpus.clone(),
            config.ingest_concurrency,
        );
        let refresh = Arc::new(RefreshManager::new(
            corpus.clone(),
            baselines.clone(),
            config.quality_floor,
            config.refresh_cooldown,
        ));
        Self {
            config,
            taxonomy,
            corpus,
            baselines,
            ingest,
            refresh,
        }
    }

    pub fn in_memory(config: MvilConfig, taxonomy: Taxonomy) -> Self {
        let store = Arc::new(MemoryStore::new());
        Self::new(config, taxonomy, store.clone(), store)
    }

    /// Ingests a batch and, if asked, fires the opportunistic refresh that the
    /// "batch complete" signal allows. Refresh problems are logged, not returned.
    pub async fn ingest_batch(
        &self,
        raws: Vec<RawPosting>,
        refresh_after: bool,
    ) -> (IngestSummary, Option<RefreshOutcome>) {
        let summary = self.ingest.ingest_batch(raws, Utc::now()).await;
        if !refresh_after {
            return (summary, None);
        }
        match self
            .refresh
            .refresh(RefreshMode::Opportunistic, &CancellationToken::new())
            .await
        {
            Ok(outcome) => (summary, Some(outcome)),
            Err(err) => {
                warn!(error = %err, "post-ingest refresh did not complete");
                (summary, None)
            }
        }
    }

    /// Cron-driven opportunistic refresh, when enabled in config.
    pub async fn maybe_build_scheduler(
        &self,
        shutdown: CancellationToken,
    ) -> anyhow::Result<Option<JobScheduler>> {
        if !self.config.scheduler_enabled {
            return Ok(None);
        }

        let sched = JobScheduler::new().await.context("creating scheduler")?;
        let cron = self.config.refresh_cron.clone();
        let manager = self.refresh.clone();
        let job = Job::new_async(cron.as_str(), move |_uuid, _l| {
            let manager = manager.clone();
            let cancel = shutdown.child_token();
            Box::pin(async move {
                match manager.refresh(RefreshMode::Opportunistic, &cancel).await {
                    Ok(RefreshOutcome::Completed(summary)) => info!(
                        run_id = %summary.run_id,
                        rows_written = summary.rows_written,
                        "scheduled refresh committed"
                    ),
                    Ok(RefreshOutcome::Skipped { last_run_at }) => {
                        info!(%last_run_at, "scheduled refresh skipped")
                    }
                    Err(err) => warn!(error = %err, "scheduled refresh failed"),
                }
            })
        })
        .with_context(|| format!("creating scheduler job for cron {cron}"))?;
        sched.add(job).await.context("adding scheduler job")?;
        Ok(Some(sched))
    }
}
