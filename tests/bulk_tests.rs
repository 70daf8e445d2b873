//! Integration tests for bulk delete, archive and restore.

mod common;

use chrono::Utc;
use coldvault::{
    errors::EngineError,
    models::{file_record::FileStatus, lifecycle_job::RestoreTier},
    services::{bulk_processor::BulkOperation, upload_orchestrator::OpenOutcome},
};
use common::{TestEnv, open_request, test_config};
use std::{collections::HashSet, sync::atomic::Ordering, time::Duration};
use uuid::Uuid;

#[tokio::test]
async fn batch_failure_falls_back_to_single_deletes() {
    let env = TestEnv::new().await;
    let user = Uuid::new_v4();
    let mut ids = Vec::with_capacity(500);
    let mut keys = Vec::with_capacity(500);
    for i in 0..500 {
        let record = env.seed_file(user, &format!("frame-{i:04}.png"), 1000).await;
        keys.push(record.object_key.clone().unwrap());
        ids.push(record.id);
    }
    env.objects.fail_batch_delete.store(true, Ordering::SeqCst);
    for key in [&keys[7], &keys[250], &keys[499]] {
        env.objects.failing_keys.insert(key.clone());
    }

    let summary = env.engine.bulk.bulk_delete(user, &ids).await.unwrap();
    assert_eq!(summary.operation, BulkOperation::Delete);
    assert_eq!(summary.requested, 500);
    assert_eq!(summary.attempted, 500);
    assert_eq!(summary.succeeded.len(), 497);
    assert_eq!(summary.failed.len(), 3);
    assert!(summary.skipped.is_empty());
    assert!((summary.success_rate - 0.994).abs() < 1e-9);
    assert_eq!(summary.cache_version, Some(1));

    assert_eq!(env.objects.batch_delete_calls.load(Ordering::SeqCst), 1);
    assert_eq!(env.objects.single_delete_calls.load(Ordering::SeqCst), 500);

    let failed: Vec<Uuid> = summary.failed.iter().map(|f| f.file_id).collect();
    assert_eq!(failed, vec![ids[7], ids[250], ids[499]]);
    for failure in &summary.failed {
        assert_eq!(failure.error_type, "backend_permanent");
        assert!(!failure.retryable);
        let record = env.record(failure.file_id).await;
        assert!(!record.is_deleted);
    }
    assert!(env.record(ids[0]).await.is_deleted);
    assert_eq!(env.engine.usage(user).await.unwrap().used_bytes, 3000);
    assert_eq!(env.objects.objects.len(), 3);

    let lifetime = env.engine.tracker.lifetime(user).await.unwrap().unwrap();
    assert_eq!(lifetime.delete_count, 497);
    assert_eq!(lifetime.total_deleted_bytes, 497_000);

    // Seeded files were never tracked as uploads, so churn saturates but
    // stays under the abuse threshold on its own.
    let report = env.engine.tracker.usage_report(user).await.unwrap();
    let period = report.period.unwrap();
    assert_eq!(period.deleted_bytes, 497_000);
    assert!((period.abuse_score - 0.4).abs() < 1e-9);
    assert!(!report.abuse_flagged);
}

#[tokio::test]
async fn deletes_leave_storage_record_until_resync() {
    let env = TestEnv::new().await;
    let user = Uuid::new_v4();
    let kept = env.seed_file(user, "kept.txt", 10).await;
    let uploaded = env.upload_file(user, "draft.bin", 500).await;

    let period = env.engine.tracker.current_period(user).await.unwrap().unwrap();
    assert_eq!(period.current_storage_bytes, 500);

    env.engine.bulk.bulk_delete(user, &[uploaded.id]).await.unwrap();
    let period = env.engine.tracker.current_period(user).await.unwrap().unwrap();
    assert_eq!(period.deleted_bytes, 500);
    assert_eq!(period.current_storage_bytes, 500);
    assert_eq!(period.peak_storage_bytes, 500);

    // Only the sweep's resync corrects the figure, down to the live total.
    let report = env.engine.sweeper.run_once(Utc::now()).await;
    assert_eq!(report.errors, 0);
    let period = env.engine.tracker.current_period(user).await.unwrap().unwrap();
    assert_eq!(period.current_storage_bytes, kept.size_bytes);
    assert_eq!(period.peak_storage_bytes, 500);
}

#[tokio::test]
async fn batch_delete_reports_per_key_failures() {
    let env = TestEnv::new().await;
    let user = Uuid::new_v4();
    let kept = env.seed_file(user, "keep.txt", 10).await;
    let gone = env.seed_file(user, "gone.txt", 10).await;
    env.objects
        .failing_keys
        .insert(kept.object_key.clone().unwrap());

    let summary = env
        .engine
        .bulk
        .bulk_delete(user, &[kept.id, gone.id])
        .await
        .unwrap();
    assert_eq!(summary.succeeded, vec![gone.id]);
    assert_eq!(summary.failed.len(), 1);
    assert_eq!(summary.failed[0].file_id, kept.id);
    assert_eq!(env.objects.batch_delete_calls.load(Ordering::SeqCst), 1);
    assert_eq!(env.objects.single_delete_calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn unknown_foreign_and_deleted_ids_are_skipped() {
    let env = TestEnv::new().await;
    let user = Uuid::new_v4();
    let other = Uuid::new_v4();
    let mine = env.seed_file(user, "mine.txt", 10).await;
    let deleted = env.seed_file(user, "old.txt", 10).await;
    let theirs = env.seed_file(other, "theirs.txt", 10).await;
    env.engine.bulk.bulk_delete(user, &[deleted.id]).await.unwrap();
    let missing = Uuid::new_v4();

    let summary = env
        .engine
        .bulk
        .bulk_delete(user, &[mine.id, theirs.id, deleted.id, missing, mine.id])
        .await
        .unwrap();
    assert_eq!(summary.requested, 4);
    assert_eq!(summary.attempted, 1);
    assert_eq!(summary.succeeded, vec![mine.id]);
    assert_eq!(summary.skipped, vec![theirs.id, deleted.id, missing]);
    assert!(!env.record(theirs.id).await.is_deleted);
    assert_eq!(summary.success_rate, 1.0);
}

#[tokio::test]
async fn nothing_attempted_has_zero_success_rate() {
    let env = TestEnv::new().await;
    let summary = env
        .engine
        .bulk
        .bulk_archive(Uuid::new_v4(), &[Uuid::new_v4()])
        .await
        .unwrap();
    assert_eq!(summary.attempted, 0);
    assert_eq!(summary.skipped.len(), 1);
    assert_eq!(summary.success_rate, 0.0);
}

#[tokio::test]
async fn request_size_is_bounded() {
    let config = coldvault::config::EngineConfig {
        max_bulk_batch: 3,
        ..test_config()
    };
    let env = TestEnv::with_config(config).await;
    let user = Uuid::new_v4();

    let err = env.engine.bulk.bulk_delete(user, &[]).await.unwrap_err();
    assert!(matches!(err, EngineError::InvalidInput(_)));

    let ids: Vec<Uuid> = (0..4).map(|_| Uuid::new_v4()).collect();
    let err = env.engine.bulk.bulk_archive(user, &ids).await.unwrap_err();
    assert!(matches!(err, EngineError::InvalidInput(_)));

    // Duplicates collapse before the limit applies.
    let repeated = vec![ids[0]; 5];
    let summary = env.engine.bulk.bulk_delete(user, &repeated).await.unwrap();
    assert_eq!(summary.requested, 1);
}

#[tokio::test]
async fn uploading_files_cannot_be_bulk_deleted() {
    let env = TestEnv::new().await;
    let user = Uuid::new_v4();
    let OpenOutcome::Opened(opened) = env
        .engine
        .uploads
        .open_session(user, open_request("partial.bin", 10))
        .await
        .unwrap()
    else {
        panic!("expected a new upload");
    };

    let summary = env
        .engine
        .bulk
        .bulk_delete(user, &[opened.file_id])
        .await
        .unwrap();
    assert!(summary.succeeded.is_empty());
    assert_eq!(summary.failed[0].error_type, "state_conflict");
    assert_eq!(env.record(opened.file_id).await.status, FileStatus::Uploading);
}

#[tokio::test]
async fn deleting_archived_files_removes_archive_copies() {
    let env = TestEnv::new().await;
    let user = Uuid::new_v4();
    let file = env.seed_file(user, "cold.bin", 10).await;
    env.engine.lifecycle.archive(user, file.id).await.unwrap();
    let archive_ref = env.record(file.id).await.archive_ref.unwrap();
    assert!(env.archive.archives.contains_key(&archive_ref));

    let summary = env.engine.bulk.bulk_delete(user, &[file.id]).await.unwrap();
    assert_eq!(summary.succeeded, vec![file.id]);
    assert!(!env.archive.archives.contains_key(&archive_ref));
    // No warm keys, so the warm tier was never called.
    assert_eq!(env.objects.batch_delete_calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn archive_delete_failure_keeps_record() {
    let env = TestEnv::new().await;
    let user = Uuid::new_v4();
    let cold = env.seed_file(user, "cold.bin", 10).await;
    env.engine.lifecycle.archive(user, cold.id).await.unwrap();
    let warm = env.seed_file(user, "warm.bin", 10).await;
    env.archive.fail_delete.store(true, Ordering::SeqCst);

    let summary = env
        .engine
        .bulk
        .bulk_delete(user, &[cold.id, warm.id])
        .await
        .unwrap();
    assert_eq!(summary.succeeded, vec![warm.id]);
    assert_eq!(summary.failed[0].file_id, cold.id);
    assert!(!env.record(cold.id).await.is_deleted);
}

#[tokio::test]
async fn restored_file_keeps_warm_copy_when_archive_delete_fails() {
    let env = TestEnv::new().await;
    let user = Uuid::new_v4();
    let file = env.seed_file(user, "thawed.bin", 10).await;
    env.engine.lifecycle.archive(user, file.id).await.unwrap();
    let job = env
        .engine
        .lifecycle
        .restore(user, file.id, RestoreTier::Expedited)
        .await
        .unwrap();
    env.engine.lifecycle.poll_restore(user, job.id).await.unwrap();
    let restored = env.record(file.id).await;
    assert_eq!(restored.status, FileStatus::Restored);
    let warm_key = restored.object_key.clone().unwrap();
    env.archive.fail_delete.store(true, Ordering::SeqCst);

    let summary = env.engine.bulk.bulk_delete(user, &[file.id]).await.unwrap();
    assert!(summary.succeeded.is_empty());
    assert_eq!(summary.failed[0].file_id, file.id);

    let record = env.record(file.id).await;
    assert!(!record.is_deleted);
    assert_eq!(record.status, FileStatus::Restored);
    assert_eq!(record.object_key.as_deref(), Some(warm_key.as_str()));
    assert!(env.objects.objects.contains_key(&warm_key));
    assert_eq!(env.objects.batch_delete_calls.load(Ordering::SeqCst), 0);
    assert!(env.engine.access.download_url(user, file.id).await.is_ok());
}

#[tokio::test]
async fn delete_during_archive_is_rejected() {
    let env = TestEnv::new().await;
    let user = Uuid::new_v4();
    let file = env.seed_file(user, "moving.bin", 10).await;
    env.archive.submit_delay_ms.store(200, Ordering::SeqCst);

    let ids = [file.id];
    let (archived, deleted) = tokio::join!(
        env.engine.bulk.bulk_archive(user, &ids),
        async {
            tokio::time::sleep(Duration::from_millis(20)).await;
            env.engine.bulk.bulk_delete(user, &[file.id]).await
        }
    );
    let (archived, deleted) = (archived.unwrap(), deleted.unwrap());

    assert!(deleted.succeeded.is_empty());
    assert_eq!(deleted.failed[0].error_type, "state_conflict");
    assert_eq!(archived.succeeded, vec![file.id]);
    let record = env.record(file.id).await;
    assert!(!record.is_deleted);
    assert_eq!(record.status, FileStatus::Archived);
    assert!(env.archive.archives.contains_key(&record.archive_ref.unwrap()));
    assert!(env.objects.objects.is_empty());
}

#[tokio::test]
async fn archive_copy_is_discarded_when_its_job_times_out_midway() {
    let env = TestEnv::new().await;
    let user = Uuid::new_v4();
    let file = env.seed_file(user, "slow.bin", 10).await;
    env.archive.submit_delay_ms.store(200, Ordering::SeqCst);

    let ids = [file.id];
    let (archived, swept) = tokio::join!(
        env.engine.bulk.bulk_archive(user, &ids),
        async {
            tokio::time::sleep(Duration::from_millis(20)).await;
            env.engine
                .lifecycle
                .fail_stuck_jobs(Utc::now() + chrono::Duration::days(30))
                .await
        }
    );
    assert_eq!(swept.unwrap(), 1);
    let archived = archived.unwrap();
    assert!(archived.succeeded.is_empty());
    assert_eq!(archived.failed[0].error_type, "job_failed");

    let record = env.record(file.id).await;
    assert_eq!(record.status, FileStatus::Failed);
    assert!(record.archive_ref.is_none());
    assert!(env.archive.archives.is_empty());
    // The warm copy was never touched, so the file can still be deleted cleanly.
    let summary = env.engine.bulk.bulk_delete(user, &[file.id]).await.unwrap();
    assert_eq!(summary.succeeded, vec![file.id]);
    assert!(env.objects.objects.is_empty());
}

#[tokio::test]
async fn concurrent_archive_and_delete_leave_no_orphans() {
    let env = TestEnv::new().await;
    let user = Uuid::new_v4();
    let mut ids = Vec::new();
    for name in ["a.raw", "b.raw", "c.raw", "d.raw"] {
        ids.push(env.seed_file(user, name, 100).await.id);
    }
    env.archive.submit_delay_ms.store(5, Ordering::SeqCst);

    let (archived, deleted) = tokio::join!(
        env.engine.bulk.bulk_archive(user, &ids),
        env.engine.bulk.bulk_delete(user, &ids)
    );
    let (archived, deleted) = (archived.unwrap(), deleted.unwrap());

    for id in &ids {
        assert!(
            !(archived.succeeded.contains(id) && deleted.succeeded.contains(id)),
            "{id} reported by both operations"
        );
    }
    for failure in &deleted.failed {
        assert_eq!(failure.error_type, "state_conflict", "{}", failure.reason);
    }

    let mut live_archives = HashSet::new();
    let mut live_objects = HashSet::new();
    for id in &ids {
        let record = env.record(*id).await;
        assert_eq!(record.is_deleted, deleted.succeeded.contains(id));
        if record.is_deleted {
            continue;
        }
        if record.status == FileStatus::Archived {
            assert!(record.object_key.is_none());
        }
        live_archives.extend(record.archive_ref.clone());
        live_objects.extend(record.object_key.clone());
    }
    for entry in env.archive.archives.iter() {
        assert!(live_archives.contains(entry.key()), "orphaned archive {}", entry.key());
    }
    for entry in env.objects.objects.iter() {
        assert!(live_objects.contains(entry.key()), "orphaned object {}", entry.key());
    }
    for id in &archived.succeeded {
        let archive_ref = env.record(*id).await.archive_ref.unwrap();
        assert!(env.archive.archives.contains_key(&archive_ref));
    }
}

#[tokio::test]
async fn bulk_archive_reports_each_file_and_bumps_once() {
    let env = TestEnv::new().await;
    let user = Uuid::new_v4();
    let a = env.seed_file(user, "a.raw", 100).await;
    let b = env.seed_file(user, "b.raw", 100).await;
    let cold = env.seed_file(user, "c.raw", 100).await;
    env.engine.lifecycle.archive(user, cold.id).await.unwrap();
    let before = env.version(user).await;

    let summary = env
        .engine
        .bulk
        .bulk_archive(user, &[a.id, cold.id, b.id])
        .await
        .unwrap();
    assert_eq!(summary.operation, BulkOperation::Archive);
    assert_eq!(summary.succeeded, vec![a.id, b.id]);
    assert_eq!(summary.failed.len(), 1);
    assert_eq!(summary.failed[0].file_id, cold.id);
    assert_eq!(summary.failed[0].error_type, "state_conflict");
    assert_eq!(summary.cache_version, Some(before + 1));
    assert_eq!(env.version(user).await, before + 1);

    assert_eq!(env.record(a.id).await.status, FileStatus::Archived);
    assert_eq!(env.record(b.id).await.status, FileStatus::Archived);
}

#[tokio::test]
async fn bulk_archive_counts_failed_jobs_as_failures() {
    let env = TestEnv::new().await;
    let user = Uuid::new_v4();
    let file = env.seed_file(user, "a.raw", 100).await;
    env.archive.fail_submit.store(true, Ordering::SeqCst);

    let summary = env.engine.bulk.bulk_archive(user, &[file.id]).await.unwrap();
    assert!(summary.succeeded.is_empty());
    assert_eq!(summary.failed[0].error_type, "job_failed");
    assert_eq!(env.record(file.id).await.status, FileStatus::Failed);
}

#[tokio::test]
async fn bulk_restore_starts_every_retrieval() {
    let env = TestEnv::new().await;
    let user = Uuid::new_v4();
    let mut ids = Vec::new();
    for name in ["x.raw", "y.raw"] {
        let file = env.seed_file(user, name, 100).await;
        env.engine.lifecycle.archive(user, file.id).await.unwrap();
        ids.push(file.id);
    }
    let warm = env.seed_file(user, "z.raw", 100).await;
    ids.push(warm.id);

    let summary = env
        .engine
        .bulk
        .bulk_restore(user, &ids, RestoreTier::Bulk)
        .await
        .unwrap();
    assert_eq!(summary.operation, BulkOperation::Restore);
    assert_eq!(summary.succeeded, vec![ids[0], ids[1]]);
    assert_eq!(summary.failed[0].file_id, warm.id);
    for id in &ids[..2] {
        let record = env.record(*id).await;
        assert_eq!(record.status, FileStatus::Restoring);
        assert!(record.restore_eta.is_some());
    }
}
