//! Integration tests for archive and restore jobs and the maintenance sweep.

mod common;

use chrono::{Duration as ChronoDuration, Utc};
use coldvault::{
    errors::{EngineError, QuotaKind},
    models::{
        file_record::FileStatus,
        lifecycle_job::{JobKind, JobStatus, RestoreTier},
    },
    services::lifecycle_jobs::TIMED_OUT,
};
use common::{GIB, TestEnv, test_config};
use std::sync::atomic::Ordering;
use uuid::Uuid;

const FILE_SIZE: i64 = 1_200_000_000;

async fn subscribed(env: &TestEnv, plan_id: &str) -> Uuid {
    let user = Uuid::new_v4();
    env.engine
        .quota
        .on_plan_changed(user, plan_id, None)
        .await
        .expect("plan change failed");
    user
}

async fn archived_file(env: &TestEnv, user: Uuid) -> Uuid {
    let file = env.seed_file(user, "raw-footage.mov", FILE_SIZE).await;
    let job = env.engine.lifecycle.archive(user, file.id).await.unwrap();
    assert_eq!(job.status, JobStatus::Completed);
    file.id
}

#[tokio::test]
async fn archive_moves_file_to_cold_tier() {
    let env = TestEnv::new().await;
    let user = subscribed(&env, "standard").await;
    let file = env.seed_file(user, "raw-footage.mov", FILE_SIZE).await;
    let warm_key = file.object_key.clone().unwrap();
    let before = env.version(user).await;

    let job = env.engine.lifecycle.archive(user, file.id).await.unwrap();
    assert_eq!(job.kind, JobKind::Archive);
    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.progress, 100);
    assert!(job.completed_at.is_some());

    let record = env.record(file.id).await;
    assert_eq!(record.status, FileStatus::Archived);
    assert!(record.object_key.is_none());
    assert!(record.archived_at.is_some());
    let archive_ref = record.archive_ref.clone().unwrap();
    assert!(env.archive.archives.contains_key(&archive_ref));
    assert!(!env.objects.contains(&warm_key));
    assert!(record.storage_cost < file.storage_cost);

    assert_eq!(env.version(user).await, before + 1);
}

#[tokio::test]
async fn lifecycle_actions_require_matching_status() {
    let env = TestEnv::new().await;
    let user = Uuid::new_v4();
    let warm = env.seed_file(user, "notes.txt", 100).await;

    let err = env
        .engine
        .lifecycle
        .restore(user, warm.id, RestoreTier::Standard)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        EngineError::StateConflict {
            status: FileStatus::Uploaded,
            ..
        }
    ));

    let cold = archived_file(&env, user).await;
    let err = env.engine.lifecycle.archive(user, cold).await.unwrap_err();
    assert_eq!(err.error_type(), "state_conflict");
    assert!(env.engine.access.download_url(user, cold).await.is_err());

    // Nothing but the original archive job was recorded.
    let jobs = env.engine.lifecycle.jobs_for_file(user, cold).await.unwrap();
    assert_eq!(jobs.len(), 1);
    assert!(env.engine.lifecycle.jobs_for_file(user, warm.id).await.unwrap().is_empty());

    let stranger = Uuid::new_v4();
    let err = env.engine.lifecycle.archive(stranger, warm.id).await.unwrap_err();
    assert!(matches!(err, EngineError::NotFound(_)));
}

#[tokio::test]
async fn restore_completes_once_eta_passes() {
    let env = TestEnv::new().await;
    let user = subscribed(&env, "standard").await;
    let file_id = archived_file(&env, user).await;

    let requested_at = Utc::now();
    let job = env
        .engine
        .lifecycle
        .restore(user, file_id, RestoreTier::Standard)
        .await
        .unwrap();
    assert_eq!(job.kind, JobKind::Restore);
    assert_eq!(job.status, JobStatus::InProgress);
    assert_eq!(job.restore_tier, Some(RestoreTier::Standard));
    assert!(job.backend_job_ref.is_some());
    assert!(job.progress >= 10);

    let eta = job.estimated_completion.unwrap();
    let expected = requested_at + ChronoDuration::hours(4);
    assert!((eta - expected).num_seconds().abs() < 60);
    let record = env.record(file_id).await;
    assert_eq!(record.status, FileStatus::Restoring);
    assert_eq!(record.restore_eta, Some(eta));

    let report = env.engine.sweeper.run_once(Utc::now()).await;
    assert_eq!(report.restores_completed, 0);
    assert_eq!(env.record(file_id).await.status, FileStatus::Restoring);

    let report = env
        .engine
        .sweeper
        .run_once(eta + ChronoDuration::minutes(1))
        .await;
    assert_eq!(report.restores_completed, 1);
    assert_eq!(report.jobs_timed_out, 0);

    let record = env.record(file_id).await;
    assert_eq!(record.status, FileStatus::Restored);
    assert!(record.restore_eta.is_none());
    let key = record.object_key.clone().unwrap();
    assert!(env.objects.contains(&key));

    let job = env.engine.lifecycle.get_job(user, job.id).await.unwrap();
    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.progress, 100);

    let link = env.engine.access.download_url(user, file_id).await.unwrap();
    assert!(link.url.contains(&key));

    let kinds: Vec<JobKind> = env
        .engine
        .lifecycle
        .jobs_for_file(user, file_id)
        .await
        .unwrap()
        .iter()
        .map(|job| job.kind)
        .collect();
    assert_eq!(kinds, vec![JobKind::Archive, JobKind::Restore]);
}

#[tokio::test]
async fn rearchive_reuses_existing_cold_copy() {
    let env = TestEnv::new().await;
    let user = subscribed(&env, "standard").await;
    let file_id = archived_file(&env, user).await;
    let first_ref = env.record(file_id).await.archive_ref.unwrap();

    let job = env
        .engine
        .lifecycle
        .restore(user, file_id, RestoreTier::Expedited)
        .await
        .unwrap();
    let job = env.engine.lifecycle.poll_restore(user, job.id).await.unwrap();
    assert_eq!(job.status, JobStatus::Completed);
    let restored = env.record(file_id).await;
    assert_eq!(restored.status, FileStatus::Restored);
    assert_eq!(restored.archive_ref.as_deref(), Some(first_ref.as_str()));
    let warm_key = restored.object_key.unwrap();

    let job = env.engine.lifecycle.archive(user, file_id).await.unwrap();
    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.retry_count, 0);

    let record = env.record(file_id).await;
    assert_eq!(record.status, FileStatus::Archived);
    assert_eq!(record.archive_ref, Some(first_ref.clone()));
    assert_eq!(env.archive.archives.len(), 1);
    assert!(env.archive.archives.contains_key(&first_ref));
    assert!(!env.objects.contains(&warm_key));

    // Deleting the file leaves nothing behind in either tier.
    let summary = env.engine.bulk.bulk_delete(user, &[file_id]).await.unwrap();
    assert_eq!(summary.succeeded, vec![file_id]);
    assert!(env.archive.archives.is_empty());
    assert!(env.objects.objects.is_empty());
}

#[tokio::test]
async fn second_restore_is_a_conflict() {
    let env = TestEnv::new().await;
    let user = Uuid::new_v4();
    let file_id = archived_file(&env, user).await;
    env.archive.ready.store(false, Ordering::SeqCst);

    env.engine
        .lifecycle
        .restore(user, file_id, RestoreTier::Bulk)
        .await
        .unwrap();
    let err = env
        .engine
        .lifecycle
        .restore(user, file_id, RestoreTier::Expedited)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        EngineError::StateConflict {
            status: FileStatus::Restoring,
            ..
        }
    ));
}

#[tokio::test]
async fn explicit_poll_reports_progress() {
    let env = TestEnv::new().await;
    let user = Uuid::new_v4();
    let file_id = archived_file(&env, user).await;
    env.archive.ready.store(false, Ordering::SeqCst);

    let job = env
        .engine
        .lifecycle
        .restore(user, file_id, RestoreTier::Standard)
        .await
        .unwrap();
    let polled = env.engine.lifecycle.poll_restore(user, job.id).await.unwrap();
    assert_eq!(polled.status, JobStatus::InProgress);
    assert!((10..=95).contains(&polled.progress));

    env.archive.ready.store(true, Ordering::SeqCst);
    let polled = env.engine.lifecycle.poll_restore(user, job.id).await.unwrap();
    assert_eq!(polled.status, JobStatus::Completed);
    assert_eq!(env.record(file_id).await.status, FileStatus::Restored);
    assert!(env.archive.retrievals.is_empty());

    // Polling a finished job is a no-op.
    let again = env.engine.lifecycle.poll_restore(user, job.id).await.unwrap();
    assert_eq!(again.status, JobStatus::Completed);

    let err = env
        .engine
        .lifecycle
        .poll_restore(Uuid::new_v4(), job.id)
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::NotFound(_)));
}

#[tokio::test]
async fn transient_poll_errors_keep_job_running() {
    let env = TestEnv::new().await;
    let user = Uuid::new_v4();
    let file_id = archived_file(&env, user).await;
    let job = env
        .engine
        .lifecycle
        .restore(user, file_id, RestoreTier::Expedited)
        .await
        .unwrap();
    env.archive.transient_polls.store(3, Ordering::SeqCst);

    let polled = env.engine.lifecycle.poll_restore(user, job.id).await.unwrap();
    assert_eq!(polled.status, JobStatus::InProgress);
    assert_eq!(polled.retry_count, 3);
    assert_eq!(env.record(file_id).await.status, FileStatus::Restoring);
}

#[tokio::test]
async fn archive_failure_parks_file_until_recovered() {
    let env = TestEnv::new().await;
    let user = Uuid::new_v4();
    let file = env.seed_file(user, "thesis.pdf", 4096).await;
    env.archive.fail_submit.store(true, Ordering::SeqCst);

    let job = env.engine.lifecycle.archive(user, file.id).await.unwrap();
    assert_eq!(job.status, JobStatus::Failed);
    assert!(job.error_message.is_some());

    let record = env.record(file.id).await;
    assert_eq!(record.status, FileStatus::Failed);
    assert!(record.last_error.is_some());
    assert!(env.objects.contains(file.object_key.as_deref().unwrap()));

    env.archive.fail_submit.store(false, Ordering::SeqCst);
    let recovered = env.engine.lifecycle.recover(user, file.id).await.unwrap();
    assert_eq!(recovered.status, FileStatus::Uploaded);
    assert!(recovered.last_error.is_none());

    let job = env.engine.lifecycle.archive(user, file.id).await.unwrap();
    assert_eq!(job.status, JobStatus::Completed);

    let err = env.engine.lifecycle.recover(user, file.id).await.unwrap_err();
    assert_eq!(err.error_type(), "state_conflict");
}

#[tokio::test]
async fn transient_archive_errors_are_retried_and_counted() {
    let env = TestEnv::new().await;
    let user = Uuid::new_v4();
    let file = env.seed_file(user, "backup.tar", 4096).await;
    env.archive.transient_submits.store(2, Ordering::SeqCst);

    let job = env.engine.lifecycle.archive(user, file.id).await.unwrap();
    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.retry_count, 2);
    assert_eq!(env.record(file.id).await.status, FileStatus::Archived);
}

#[tokio::test]
async fn cancelled_restore_returns_file_to_archive() {
    let env = TestEnv::new().await;
    let user = Uuid::new_v4();
    let file_id = archived_file(&env, user).await;
    env.archive.ready.store(false, Ordering::SeqCst);
    let job = env
        .engine
        .lifecycle
        .restore(user, file_id, RestoreTier::Standard)
        .await
        .unwrap();

    let cancelled = env.engine.lifecycle.cancel(user, job.id).await.unwrap();
    assert_eq!(cancelled.status, JobStatus::Cancelled);
    assert!(env.archive.retrievals.is_empty());
    let record = env.record(file_id).await;
    assert_eq!(record.status, FileStatus::Archived);
    assert!(record.restore_eta.is_none());

    // Cancelling twice is harmless.
    let again = env.engine.lifecycle.cancel(user, job.id).await.unwrap();
    assert_eq!(again.status, JobStatus::Cancelled);

    // A fresh restore can start once the old job is gone.
    env.engine
        .lifecycle
        .restore(user, file_id, RestoreTier::Standard)
        .await
        .unwrap();

    let archive_job = env.engine.lifecycle.jobs_for_file(user, file_id).await.unwrap()[0].clone();
    let err = env.engine.lifecycle.cancel(user, archive_job.id).await.unwrap_err();
    assert!(matches!(err, EngineError::InvalidInput(_)));
}

#[tokio::test]
async fn stuck_restore_times_out_and_recovers_to_archive() {
    let env = TestEnv::new().await;
    let user = Uuid::new_v4();
    let file_id = archived_file(&env, user).await;
    env.archive.ready.store(false, Ordering::SeqCst);
    let job = env
        .engine
        .lifecycle
        .restore(user, file_id, RestoreTier::Standard)
        .await
        .unwrap();

    let report = env
        .engine
        .sweeper
        .run_once(Utc::now() + ChronoDuration::hours(29))
        .await;
    assert_eq!(report.restores_pending, 1);
    assert_eq!(report.jobs_timed_out, 1);

    let job = env.engine.lifecycle.get_job(user, job.id).await.unwrap();
    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(job.error_message.as_deref(), Some(TIMED_OUT));
    assert_eq!(env.record(file_id).await.status, FileStatus::Failed);

    let record = env.engine.lifecycle.recover(user, file_id).await.unwrap();
    assert_eq!(record.status, FileStatus::Archived);
    assert!(record.object_key.is_none());
}

#[tokio::test]
async fn plan_changes_adjust_limits_and_bump_cache() {
    let env = TestEnv::new().await;
    let user = Uuid::new_v4();

    let limits = env.engine.on_plan_changed(user, "starter", None).await.unwrap();
    assert_eq!(limits.plan_id.as_deref(), Some("starter"));
    assert_eq!(limits.max_file_size_bytes, Some(2 * GIB));
    assert_eq!(env.version(user).await, 1);

    let err = env
        .engine
        .quota
        .check_upload_allowed(user, 3 * GIB)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        EngineError::QuotaExceeded(ref d) if d.kind == QuotaKind::FileSize
    ));

    let limits = env.engine.on_plan_expired(user).await.unwrap();
    assert_eq!(limits.plan_id, None);
    assert_eq!(limits.storage_limit_bytes, test_config().free_tier_limit_bytes);
    assert_eq!(env.version(user).await, 2);

    let err = env
        .engine
        .on_plan_changed(user, "platinum", None)
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::NotFound(_)));
}

#[tokio::test]
async fn downloads_are_tracked_against_monthly_allowance() {
    let config = coldvault::config::EngineConfig {
        monthly_download_limit_bytes: 1000,
        ..test_config()
    };
    let env = TestEnv::with_config(config).await;
    let user = Uuid::new_v4();
    let file = env.seed_file(user, "song.flac", 600).await;

    let link = env.engine.access.download_url(user, file.id).await.unwrap();
    assert!(link.expires_at > Utc::now());
    assert!(env.record(file.id).await.last_accessed_at.is_some());

    let err = env.engine.access.download_url(user, file.id).await.unwrap_err();
    assert!(matches!(
        err,
        EngineError::QuotaExceeded(ref d) if d.kind == QuotaKind::MonthlyDownload
    ));
    let period = env.engine.tracker.current_period(user).await.unwrap().unwrap();
    assert_eq!(period.downloaded_bytes, 600);
}
