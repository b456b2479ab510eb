//! Run ledger state machine: `running` -> `completed` | `failed`.

use std::sync::Arc;
use std::time::Instant;

use beacon_core::{RunCompletion, RunStatus};
use beacon_storage::{DigestStore, StoreError};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::Serialize;
use tracing::{error, info};

use crate::error::DigestError;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RunTotals {
    pub total_records: i64,
    pub sent_count: i64,
}

#[derive(Debug, Clone)]
pub struct ActiveRun {
    pub id: i64,
    pub started_at: DateTime<Utc>,
    clock: Instant,
}

impl ActiveRun {
    pub fn elapsed_ms(&self) -> i64 {
        i64::try_from(self.clock.elapsed().as_millis()).unwrap_or(i64::MAX)
    }
}

#[derive(Clone)]
pub struct RunRecorder {
    store: Arc<dyn DigestStore>,
    job: String,
    stale_after: ChronoDuration,
}

impl RunRecorder {
    pub fn new(
        store: Arc<dyn DigestStore>,
        job: impl Into<String>,
        stale_after: ChronoDuration,
    ) -> Self {
        Self {
            store,
            job: job.into(),
            stale_after,
        }
    }

    pub fn job(&self) -> &str {
        &self.job
    }

    /// Opens the ledger row. Refused while a non-stale run of the same job
    /// is still `running`.
    pub async fn start(&self) -> Result<ActiveRun, DigestError> {
        let started_at = Utc::now();
        let active_since = started_at
            .checked_sub_signed(self.stale_after)
            .unwrap_or(DateTime::<Utc>::MIN_UTC);
        let id = self
            .store
            .begin_run(&self.job, started_at, active_since)
            .await?
            .ok_or(DigestError::RunInProgress)?;
        info!(run_id = id, job = %self.job, "run started");
        Ok(ActiveRun {
            id,
            started_at,
            clock: Instant::now(),
        })
    }

    pub async fn complete(
        &self,
        run: &ActiveRun,
        totals: RunTotals,
        notes: Option<String>,
    ) -> Result<RunCompletion, StoreError> {
        let completion = RunCompletion {
            status: RunStatus::Completed,
            finished_at: Utc::now(),
            duration_ms: run.elapsed_ms(),
            total_records: totals.total_records,
            sent_count: totals.sent_count,
            err_code: None,
            notes,
        };
        self.store.finish_run(run.id, &completion).await?;
        info!(
            run_id = run.id,
            duration_ms = completion.duration_ms,
            total_records = totals.total_records,
            sent = totals.sent_count,
            "run completed"
        );
        Ok(completion)
    }

    /// Records the failure; the caller still owns and re-raises `err`.
    pub async fn fail(
        &self,
        run: &ActiveRun,
        totals: RunTotals,
        err: &DigestError,
    ) -> Result<RunCompletion, StoreError> {
        let completion = RunCompletion {
            status: RunStatus::Failed,
            finished_at: Utc::now(),
            duration_ms: run.elapsed_ms(),
            total_records: totals.total_records,
            sent_count: totals.sent_count,
            err_code: Some(err.code().to_string()),
            notes: Some(err.to_string()),
        };
        self.store.finish_run(run.id, &completion).await?;
        error!(run_id = run.id, code = err.code(), error = %err, "run failed");
        Ok(completion)
    }
}
