//! Periodic maintenance sweep.
//!
//! Advances restores whose ETA has passed, fails jobs that outlived their
//! timeout, reclaims abandoned chunked uploads, reconciles cached storage
//! counters and, when configured, purges old soft-deleted rows. Each step
//! runs even if an earlier one failed.

use crate::{
    config::EngineConfig,
    errors::EngineResult,
    models::lifecycle_job::JobStatus,
    services::{
        file_registry::FileRegistry, lifecycle_jobs::LifecycleManager, quota_gate::QuotaLedger,
        storage_tracking::StorageTracker, upload_orchestrator::UploadOrchestrator,
    },
};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::{sync::Arc, time::Duration};
use tokio::{task::JoinHandle, time::interval};
use tracing::{debug, info, warn};

#[derive(Debug, Default, Clone, Serialize)]
pub struct SweepReport {
    pub restores_completed: usize,
    pub restores_pending: usize,
    pub restores_failed: usize,
    pub jobs_timed_out: usize,
    pub uploads_reclaimed: usize,
    pub users_reconciled: usize,
    /// Sum of absolute differences between cached and live usage.
    pub drift_bytes: i64,
    pub records_purged: u64,
    pub errors: usize,
}

#[derive(Clone)]
pub struct Sweeper {
    lifecycle: LifecycleManager,
    uploads: UploadOrchestrator,
    registry: FileRegistry,
    quota: QuotaLedger,
    tracker: StorageTracker,
    config: Arc<EngineConfig>,
}

impl Sweeper {
    pub fn new(
        lifecycle: LifecycleManager,
        uploads: UploadOrchestrator,
        registry: FileRegistry,
        quota: QuotaLedger,
        tracker: StorageTracker,
        config: Arc<EngineConfig>,
    ) -> Self {
        Self {
            lifecycle,
            uploads,
            registry,
            quota,
            tracker,
            config,
        }
    }

    pub async fn run_once(&self, now: DateTime<Utc>) -> SweepReport {
        let mut report = SweepReport::default();

        if let Err(err) = self.advance_due_restores(now, &mut report).await {
            warn!(error = %err, "failed to advance due restores");
            report.errors += 1;
        }

        match self.lifecycle.fail_stuck_jobs(now).await {
            Ok(count) => report.jobs_timed_out = count,
            Err(err) => {
                warn!(error = %err, "failed to sweep stuck jobs");
                report.errors += 1;
            }
        }

        match self.uploads.reclaim_abandoned(now).await {
            Ok(count) => report.uploads_reclaimed = count,
            Err(err) => {
                warn!(error = %err, "failed to reclaim abandoned uploads");
                report.errors += 1;
            }
        }

        if self.config.reconcile_quota {
            if let Err(err) = self.reconcile(&mut report).await {
                warn!(error = %err, "failed to reconcile storage counters");
                report.errors += 1;
            }
        }

        if let Some(retention) = self.config.purge_deleted_after {
            match self.registry.purge_deleted_before(now - retention).await {
                Ok(count) => report.records_purged = count,
                Err(err) => {
                    warn!(error = %err, "failed to purge deleted records");
                    report.errors += 1;
                }
            }
        }

        info!(
            restores_completed = report.restores_completed,
            restores_pending = report.restores_pending,
            restores_failed = report.restores_failed,
            jobs_timed_out = report.jobs_timed_out,
            uploads_reclaimed = report.uploads_reclaimed,
            users_reconciled = report.users_reconciled,
            drift_bytes = report.drift_bytes,
            records_purged = report.records_purged,
            errors = report.errors,
            "sweep finished"
        );
        report
    }

    async fn advance_due_restores(
        &self,
        now: DateTime<Utc>,
        report: &mut SweepReport,
    ) -> EngineResult<()> {
        for job in self.lifecycle.due_restores(now).await? {
            match self.lifecycle.poll_restore_status(job.id).await {
                Ok(job) => match job.status {
                    JobStatus::Completed => report.restores_completed += 1,
                    JobStatus::Failed | JobStatus::Cancelled => report.restores_failed += 1,
                    JobStatus::Pending | JobStatus::InProgress => report.restores_pending += 1,
                },
                Err(err) => {
                    warn!(job_id = %job.id, error = %err, "failed to poll restore");
                    report.errors += 1;
                }
            }
        }
        Ok(())
    }

    async fn reconcile(&self, report: &mut SweepReport) -> EngineResult<()> {
        for user_id in self.registry.active_owners().await? {
            let (live, drift) = self.quota.reconcile(user_id).await?;
            if let Some(drift) = drift.filter(|d| *d != 0) {
                debug!(%user_id, live, drift, "corrected cached storage usage");
                report.drift_bytes += drift.abs();
            }
            if let Err(err) = self.tracker.resync(user_id, live).await {
                warn!(%user_id, error = %err, "failed to resync storage record");
            }
            report.users_reconciled += 1;
        }
        Ok(())
    }

    /// Run the sweep on a fixed interval until the runtime shuts down.
    pub fn spawn_periodic(self, every: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = interval(every);
            // The first tick fires immediately; skip it so startup stays quiet.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                debug!("running lifecycle sweep");
                self.run_once(Utc::now()).await;
            }
        })
    }
}
