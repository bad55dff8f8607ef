use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Duration, Utc};
use mvil_core::{BaselineKind, BaselineSet, RefreshRun, RefreshSummary};
use mvil_storage::{BaselineStore, CorpusStore, StoreError};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::aggregate::{family_samples, BaselineComputer, FamilySample, RoleAggregator};

#[derive(Debug, Error)]
pub enum AggregationError {
    #[error("{stage} baseline failed for {role_family}: {message}")]
    Stage {
        role_family: String,
        stage: String,
        message: String,
    },
    #[error("refresh cancelled after {families_done} of {families_total} families")]
    Cancelled {
        families_done: usize,
        families_total: usize,
    },
    #[error("last refresh at {last_run_at} is within the cooldown")]
    Throttled { last_run_at: DateTime<Utc> },
    #[error("a refresh is already running")]
    AlreadyRunning,
    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshMode {
    /// Skips when the last successful run is within the cooldown.
    Opportunistic,
    /// Admin-triggered; ignores the cooldown.
    Forced,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum RefreshOutcome {
    Completed(RefreshSummary),
    Skipped { last_run_at: DateTime<Utc> },
}

/// Runs the role aggregator and swaps its output in atomically. At most one
/// refresh runs at a time: per manager through a local mutex, and across
/// processes through the store's refresh lease.
pub struct RefreshManager {
    corpus: Arc<dyn CorpusStore>,
    baselines: Arc<dyn BaselineStore>,
    computer: Arc<dyn BaselineComputer>,
    quality_floor: f64,
    cooldown: Duration,
    running: Mutex<()>,
}

impl RefreshManager {
    pub fn new(
        corpus: Arc<dyn CorpusStore>,
        baselines: Arc<dyn BaselineStore>,
        quality_floor: f64,
        cooldown: Duration,
    ) -> Self {
        Self {
            corpus,
            baselines,
            computer: Arc::new(RoleAggregator),
            quality_floor,
            cooldown,
            running: Mutex::new(()),
        }
    }

    pub fn with_computer(mut self, computer: Arc<dyn BaselineComputer>) -> Self {
        self.computer = computer;
        self
    }

    pub fn is_running(&self) -> bool {
        self.running.try_lock().is_err()
    }

    /// Cooldown-aware wrapper for opportunistic triggers such as "ingest batch
    /// complete": a throttled run is reported as skipped rather than failed.
    pub async fn refresh(
        &self,
        mode: RefreshMode,
        cancel: &CancellationToken,
    ) -> Result<RefreshOutcome, AggregationError> {
        match self.refresh_all(mode, cancel).await {
            Ok(summary) => Ok(RefreshOutcome::Completed(summary)),
            Err(AggregationError::Throttled { last_run_at }) => {
                info!(%last_run_at, "refresh skipped, within cooldown");
                Ok(RefreshOutcome::Skipped { last_run_at })
            }
            Err(err) => Err(err),
        }
    }

    /// Stages every family's baselines in memory, then commits them in one
    /// insert-then-delete transaction. Nothing is written unless every stage of
    /// every family succeeded and the run was not cancelled.
    pub async fn refresh_all(
        &self,
        mode: RefreshMode,
        cancel: &CancellationToken,
    ) -> Result<RefreshSummary, AggregationError> {
        let _guard = self
            .running
            .try_lock()
            .map_err(|_| AggregationError::AlreadyRunning)?;
        let Some(lease) = self.baselines.try_acquire_refresh_lease().await? else {
            info!("another process holds the refresh lease");
            return Err(AggregationError::AlreadyRunning);
        };
        let result = self.refresh_leased(mode, cancel).await;
        if let Err(err) = lease.release().await {
            warn!(error = %err, "releasing the refresh lease failed");
        }
        result
    }

    /// Cooldown check and run, under the refresh lease so the check cannot
    /// race another process.
    async fn refresh_leased(
        &self,
        mode: RefreshMode,
        cancel: &CancellationToken,
    ) -> Result<RefreshSummary, AggregationError> {
        if mode == RefreshMode::Opportunistic {
            if let Some(last) = self.baselines.last_successful_run().await? {
                if Utc::now() - last.computed_at < self.cooldown {
                    return Err(AggregationError::Throttled {
                        last_run_at: last.computed_at,
                    });
                }
            }
        }

        let run_id = Uuid::new_v4();
        let span = info_span!("refresh", %run_id, ?mode);
        self.run(run_id, cancel).instrument(span).await
    }

    async fn run(&self, run_id: Uuid, cancel: &CancellationToken) -> Result<RefreshSummary, AggregationError> {
        let started = Instant::now();
        let computed_at = Utc::now();

        let postings = self.corpus.canonical_postings().await?;
        let families = family_samples(postings, self.quality_floor, computed_at);
        let families_total = families.len();
        info!(families = families_total, "computing baselines");

        let mut staged = BaselineSet::default();
        for (done, family) in families.iter().enumerate() {
            if cancel.is_cancelled() {
                warn!(families_done = done, families_total, "refresh cancelled, nothing committed");
                return Err(AggregationError::Cancelled {
                    families_done: done,
                    families_total,
                });
            }
            staged.extend(self.compute_family(family).map_err(|err| {
                error!(role_family = %family.role_family, error = %err, "aggregation aborted");
                err
            })?);
        }

        for family in staged.low_confidence_families() {
            warn!(role_family = %family, "baseline computed from fewer than 10 postings");
        }

        let rows_written = staged.rows_written();
        let run = RefreshRun {
            run_id,
            computed_at,
            rows_written: rows_written as u64,
            families_processed: families_total as u64,
            duration_ms: started.elapsed().as_millis() as u64,
        };
        self.baselines.replace_baselines(&run, &staged).await?;

        let summary = RefreshSummary {
            run_id,
            rows_written,
            families_processed: families_total,
            low_confidence_families: staged.low_confidence_families().into_iter().collect(),
            computed_at,
            duration_ms: started.elapsed().as_millis() as u64,
        };
        info!(
            rows_written,
            families_processed = families_total,
            duration_ms = summary.duration_ms,
            "refresh committed"
        );
        Ok(summary)
    }

    fn compute_family(&self, family: &FamilySample) -> Result<BaselineSet, AggregationError> {
        let mut set = BaselineSet::default();
        for stage in BaselineKind::ALL {
            set.extend(self.computer.compute_stage(stage, family)?);
        }
        Ok(set)
    }
}
