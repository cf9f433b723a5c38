mod test_helpers;

use ostoredb::catalogue::TapeState;
use ostoredb::objects::{
    Agent, ArchiveJobStatus, DriveState, DriveStatus, JobQueueType, RepackInfo, RepackStatus, RetrieveJobStatus,
};
use ostoredb::scheduler_db::{OStoreDb, SchedulerDbError};

use test_helpers::*;

async fn owned_by_db(db: &OStoreDb) -> Vec<String> {
    Agent::fetch_no_lock(db.backend().as_ref(), db.agent_reference().address())
        .await
        .unwrap()
        .ownership_list()
        .to_vec()
}

#[ostoredb::test]
async fn archive_request_is_queued_written_reported_and_deleted() {
    with_timeout!(20_000, {
        let backend = memory_backend();
        let (db, catalogue) = open_db(backend.clone()).await;

        let address = db
            .queue_archive(archive_submission(1, 4096, &[(1, TAPE_POOL)]))
            .await
            .expect("queue archive");
        db.wait_for_idle().await;
        assert_eq!(db.outstanding_enqueues(), 0);
        assert!(owned_by_db(&db).await.is_empty());

        let summaries = db.archive_queue_summaries(JobQueueType::JobsToTransferForUser).await.unwrap();
        assert_eq!(summaries.len(), 1);
        assert_eq!(summaries[0].container, TAPE_POOL);
        assert_eq!(summaries[0].summary.jobs, 1);
        assert_eq!(summaries[0].summary.bytes, 4096);

        let batch = db.get_next_archive_jobs(TAPE_POOL, 10, u64::MAX).await.unwrap();
        assert_eq!(batch.elements.len(), 1);
        let job = &batch.elements[0];
        assert_eq!(job.job.address, address);
        assert_eq!(job.request.archive_file.archive_file_id, 1);
        assert_eq!(owned_by_db(&db).await, vec![address.clone()]);

        db.report_archive_success(job, "V1", 42).await.unwrap();
        let written = catalogue.written_files();
        assert_eq!(written.len(), 1);
        assert_eq!(written[0].vid, "V1");
        assert_eq!(written[0].fseq, 42);
        assert!(owned_by_db(&db).await.is_empty());

        let to_report = db.get_next_archive_jobs_to_report(10).await.unwrap();
        assert_eq!(to_report.len(), 1);
        assert!(to_report[0]
            .request
            .job_statuses
            .contains(&(1, ArchiveJobStatus::ToReportToUserForTransfer)));
        db.report_archive_job_reported(&to_report[0]).await.unwrap();

        assert!(!backend.exists(&address).await.unwrap());
        assert!(owned_by_db(&db).await.is_empty());
        db.shutdown().await.unwrap();
        assert!(!backend.exists(db.agent_reference().address()).await.unwrap());
    });
}

#[ostoredb::test]
async fn only_the_last_copy_reports_success() {
    with_timeout!(20_000, {
        let backend = memory_backend();
        let (db, _catalogue) = open_db(backend.clone()).await;
        let address = db
            .queue_archive(archive_submission(2, 100, &[(1, "PoolA"), (2, "PoolB")]))
            .await
            .unwrap();
        db.wait_for_idle().await;
        assert_eq!(
            db.archive_queue_summaries(JobQueueType::JobsToTransferForUser)
                .await
                .unwrap()
                .len(),
            2
        );

        let first = db.get_next_archive_jobs("PoolA", 10, u64::MAX).await.unwrap();
        db.report_archive_success(&first.elements[0], "V1", 1).await.unwrap();
        assert!(db.get_next_archive_jobs_to_report(10).await.unwrap().is_empty());
        assert!(owned_by_db(&db).await.is_empty());

        let second = db.get_next_archive_jobs("PoolB", 10, u64::MAX).await.unwrap();
        db.report_archive_success(&second.elements[0], "V2", 1).await.unwrap();
        let to_report = db.get_next_archive_jobs_to_report(10).await.unwrap();
        assert_eq!(to_report.len(), 1);
        assert_eq!(to_report[0].job.copy_nb, 2);
        db.report_archive_job_reported(&to_report[0]).await.unwrap();
        assert!(!backend.exists(&address).await.unwrap());
    });
}

#[ostoredb::test]
async fn copies_to_the_same_pool_are_written_one_at_a_time() {
    with_timeout!(20_000, {
        let backend = memory_backend();
        let (db, _catalogue) = open_db(backend.clone()).await;
        let address = db
            .queue_archive(archive_submission(6, 100, &[(1, TAPE_POOL), (2, TAPE_POOL)]))
            .await
            .unwrap();
        db.wait_for_idle().await;
        let summaries = db.archive_queue_summaries(JobQueueType::JobsToTransferForUser).await.unwrap();
        assert_eq!(summaries.len(), 1);
        assert_eq!(summaries[0].summary.jobs, 2);
        assert!(owned_by_db(&db).await.is_empty());

        let first = db.get_next_archive_jobs(TAPE_POOL, 1, u64::MAX).await.unwrap();
        assert_eq!(first.elements.len(), 1);
        let summaries = db.archive_queue_summaries(JobQueueType::JobsToTransferForUser).await.unwrap();
        assert_eq!(summaries.len(), 1);
        assert_eq!(summaries[0].summary.jobs, 1);
        db.report_archive_success(&first.elements[0], "V1", 1).await.unwrap();
        assert!(db.get_next_archive_jobs_to_report(10).await.unwrap().is_empty());
        assert!(owned_by_db(&db).await.is_empty());

        let second = db.get_next_archive_jobs(TAPE_POOL, 10, u64::MAX).await.unwrap();
        assert_eq!(second.elements.len(), 1);
        assert_ne!(second.elements[0].job.copy_nb, first.elements[0].job.copy_nb);
        assert!(db
            .archive_queue_summaries(JobQueueType::JobsToTransferForUser)
            .await
            .unwrap()
            .is_empty());
        db.report_archive_success(&second.elements[0], "V2", 1).await.unwrap();
        let to_report = db.get_next_archive_jobs_to_report(10).await.unwrap();
        assert_eq!(to_report.len(), 1);
        db.report_archive_job_reported(&to_report[0]).await.unwrap();
        assert!(!backend.exists(&address).await.unwrap());
        assert!(owned_by_db(&db).await.is_empty());
    });
}

#[ostoredb::test]
async fn malformed_archive_submissions_are_refused() {
    with_timeout!(10_000, {
        let (db, _catalogue) = open_db(memory_backend()).await;
        let no_copy = db.queue_archive(archive_submission(3, 100, &[])).await;
        assert!(matches!(no_copy, Err(SchedulerDbError::InvalidRequest(_))));
        let twice = db
            .queue_archive(archive_submission(3, 100, &[(1, "PoolA"), (1, "PoolB")]))
            .await;
        assert!(matches!(twice, Err(SchedulerDbError::InvalidRequest(_))));
        assert!(owned_by_db(&db).await.is_empty());
    });
}

#[ostoredb::test]
async fn archive_failures_end_in_the_failed_queue() {
    with_timeout!(20_000, {
        let backend = memory_backend();
        let (db, _catalogue) = open_db(backend.clone()).await;
        db.queue_archive(archive_submission(4, 100, &[(1, TAPE_POOL)]))
            .await
            .unwrap();
        db.wait_for_idle().await;

        let batch = db.get_next_archive_jobs(TAPE_POOL, 10, u64::MAX).await.unwrap();
        let status = db.report_archive_failure(&batch.elements[0], 1, "write error").await.unwrap();
        assert_eq!(status, ArchiveJobStatus::ToTransferForUser);

        let batch = db.get_next_archive_jobs(TAPE_POOL, 10, u64::MAX).await.unwrap();
        assert_eq!(batch.elements.len(), 1);
        let status = db.report_archive_failure(&batch.elements[0], 2, "write error").await.unwrap();
        assert_eq!(status, ArchiveJobStatus::ToReportToUserForFailure);
        assert!(db.get_next_archive_jobs(TAPE_POOL, 10, u64::MAX).await.unwrap().elements.is_empty());

        let to_report = db.get_next_archive_jobs_to_report(10).await.unwrap();
        assert_eq!(to_report.len(), 1);
        assert_eq!(to_report[0].request.archive_error_report_url, "eosQuery://failed/4");
        db.report_archive_job_reported(&to_report[0]).await.unwrap();

        let failed = db.archive_queue_summaries(JobQueueType::FailedJobs).await.unwrap();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].container, TAPE_POOL);
        assert_eq!(failed[0].summary.jobs, 1);
        assert!(owned_by_db(&db).await.is_empty());
    });
}

#[ostoredb::test]
async fn report_failures_retry_then_fail() {
    with_timeout!(20_000, {
        let (db, _catalogue) = open_db(memory_backend()).await;
        db.queue_archive(archive_submission(5, 100, &[(1, TAPE_POOL)]))
            .await
            .unwrap();
        db.wait_for_idle().await;
        let batch = db.get_next_archive_jobs(TAPE_POOL, 10, u64::MAX).await.unwrap();
        db.report_archive_success(&batch.elements[0], "V1", 3).await.unwrap();

        let to_report = db.get_next_archive_jobs_to_report(10).await.unwrap();
        let status = db.report_archive_report_failure(&to_report[0], "eos down").await.unwrap();
        assert_eq!(status, ArchiveJobStatus::ToReportToUserForTransfer);
        let to_report = db.get_next_archive_jobs_to_report(10).await.unwrap();
        let status = db.report_archive_report_failure(&to_report[0], "eos down").await.unwrap();
        assert_eq!(status, ArchiveJobStatus::Failed);
        assert!(db.get_next_archive_jobs_to_report(10).await.unwrap().is_empty());
        let failed = db.archive_queue_summaries(JobQueueType::FailedJobs).await.unwrap();
        assert_eq!(failed[0].summary.jobs, 1);
    });
}

#[ostoredb::test]
async fn retrieve_request_is_served_and_deleted() {
    with_timeout!(20_000, {
        let backend = memory_backend();
        let (db, _catalogue) = open_db(backend.clone()).await;
        let address = db
            .queue_retrieve(retrieve_submission(10, 2048, &[(1, "V1", 5)]))
            .await
            .expect("queue retrieve");
        db.wait_for_idle().await;
        assert!(owned_by_db(&db).await.is_empty());

        let summaries = db.retrieve_queue_summaries(JobQueueType::JobsToTransferForUser).await.unwrap();
        assert_eq!(summaries.len(), 1);
        assert_eq!(summaries[0].container, "V1");
        assert_eq!(summaries[0].summary.bytes, 2048);

        let batch = db.get_next_retrieve_jobs("V1", 10, u64::MAX).await.unwrap();
        assert_eq!(batch.elements.len(), 1);
        assert_eq!(batch.elements[0].job.fseq, 5);
        assert_eq!(batch.elements[0].request.dst_url, "root://eos/restore-10");
        db.report_retrieve_success(&batch.elements[0]).await.unwrap();
        assert!(!backend.exists(&address).await.unwrap());
        assert!(owned_by_db(&db).await.is_empty());
    });
}

#[ostoredb::test]
async fn retrieve_avoids_broken_tapes() {
    with_timeout!(20_000, {
        let (db, catalogue) = open_db(memory_backend()).await;
        catalogue.set_tape_state("V2", TapeState::Broken);
        db.queue_retrieve(retrieve_submission(11, 10, &[(1, "V2", 1), (2, "V3", 9)]))
            .await
            .unwrap();
        db.wait_for_idle().await;
        let summaries = db.retrieve_queue_summaries(JobQueueType::JobsToTransferForUser).await.unwrap();
        assert_eq!(summaries.len(), 1);
        assert_eq!(summaries[0].container, "V3");

        catalogue.set_tape_state("V3", TapeState::Broken);
        catalogue.set_tape_state("V1", TapeState::Broken);
        let refused = db.queue_retrieve(retrieve_submission(12, 10, &[(1, "V1", 1)])).await;
        assert!(matches!(refused, Err(SchedulerDbError::QueueSelection(_))));
        let no_copy = db.queue_retrieve(retrieve_submission(13, 10, &[])).await;
        assert!(matches!(no_copy, Err(SchedulerDbError::InvalidRequest(_))));
    });
}

#[ostoredb::test]
async fn exhausted_retrieve_is_reported_then_failed() {
    with_timeout!(20_000, {
        let (db, _catalogue) = open_db(memory_backend()).await;
        db.queue_retrieve(retrieve_submission(14, 10, &[(1, "V1", 2)]))
            .await
            .unwrap();
        db.wait_for_idle().await;

        let batch = db.get_next_retrieve_jobs("V1", 10, u64::MAX).await.unwrap();
        let status = db.report_retrieve_failure(&batch.elements[0], 1, "read error").await.unwrap();
        assert_eq!(status, RetrieveJobStatus::ToTransfer);
        let batch = db.get_next_retrieve_jobs("V1", 10, u64::MAX).await.unwrap();
        assert_eq!(batch.elements.len(), 1);
        let status = db.report_retrieve_failure(&batch.elements[0], 2, "read error").await.unwrap();
        assert_eq!(status, RetrieveJobStatus::ToReportToUserForFailure);

        let to_report = db
            .pop_retrieve_requests(
                JobQueueType::JobsToReportToUser,
                "V1",
                ostoredb::algorithms::PopCriteria::new(10, u64::MAX),
            )
            .await
            .unwrap();
        assert_eq!(to_report.elements.len(), 1);
        db.report_retrieve_job_reported(&to_report.elements[0]).await.unwrap();
        let failed = db.retrieve_queue_summaries(JobQueueType::FailedJobs).await.unwrap();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].container, "V1");
        assert!(owned_by_db(&db).await.is_empty());
    });
}

#[ostoredb::test]
async fn verify_only_retrieve_fails_on_first_error() {
    with_timeout!(20_000, {
        let (db, _catalogue) = open_db(memory_backend()).await;
        let mut submission = retrieve_submission(15, 10, &[(1, "V1", 2)]);
        submission.is_verify_only = true;
        db.queue_retrieve(submission).await.unwrap();
        db.wait_for_idle().await;
        let batch = db.get_next_retrieve_jobs("V1", 10, u64::MAX).await.unwrap();
        assert!(batch.elements[0].request.is_verify_only);
        let status = db.report_retrieve_failure(&batch.elements[0], 1, "checksum").await.unwrap();
        assert_eq!(status, RetrieveJobStatus::ToReportToUserForFailure);
    });
}

#[ostoredb::test]
async fn repack_retrieve_success_waits_for_the_repack() {
    with_timeout!(20_000, {
        let backend = memory_backend();
        let (db, catalogue) = open_db(backend.clone()).await;
        catalogue.set_tape_state("V2", TapeState::Repacking);
        let repack = db.queue_repack("V2", "file://buffer").await.unwrap();

        let mut submission = retrieve_submission(16, 10, &[(1, "V2", 8)]);
        submission.repack = RepackInfo {
            is_repack: true,
            repack_request_address: repack.clone(),
            file_buffer_url: "file://buffer/16".to_string(),
            fseq: 8,
            ..Default::default()
        };
        let address = db.queue_retrieve(submission).await.unwrap();
        db.wait_for_idle().await;

        let batch = db.get_next_retrieve_jobs("V2", 10, u64::MAX).await.unwrap();
        db.report_retrieve_success(&batch.elements[0]).await.unwrap();
        assert!(backend.exists(&address).await.unwrap());

        let reports = db
            .pop_retrieve_requests(
                JobQueueType::JobsToReportToRepackForSuccess,
                &repack,
                ostoredb::algorithms::PopCriteria::new(10, u64::MAX),
            )
            .await
            .unwrap();
        assert_eq!(reports.elements.len(), 1);
        assert_eq!(
            reports.elements[0].request.job_status,
            Some(RetrieveJobStatus::ToReportToRepackForSuccess)
        );
        db.report_retrieve_job_reported(&reports.elements[0]).await.unwrap();
        assert!(!backend.exists(&address).await.unwrap());
    });
}

#[ostoredb::test]
async fn repack_request_moves_through_its_queues() {
    with_timeout!(20_000, {
        let backend = memory_backend();
        let (db, _catalogue) = open_db(backend.clone()).await;
        assert!(matches!(
            db.queue_repack("", "file://buffer").await,
            Err(SchedulerDbError::InvalidRequest(_))
        ));
        let address = db.queue_repack("V3", "file://buffer").await.unwrap();
        assert!(owned_by_db(&db).await.is_empty());

        assert!(db.get_next_repack_request_to_expand().await.unwrap().is_none());
        let promoted = db.promote_repack_requests_to_expand(5).await.unwrap();
        assert_eq!(promoted, vec![address.clone()]);
        assert!(db.promote_repack_requests_to_expand(5).await.unwrap().is_empty());

        let popped = db
            .get_next_repack_request_to_expand()
            .await
            .unwrap()
            .expect("a request to expand");
        assert_eq!(popped.address, address);
        assert_eq!(popped.request.vid, "V3");
        assert_eq!(popped.request.status, RepackStatus::ToExpand);

        let status = db.start_repack_expansion(&address, 2, 2).await.unwrap();
        assert_eq!(status, RepackStatus::Starting);
        let status = db.report_repack_progress(&address, (1, 0), (0, 0)).await.unwrap();
        assert_eq!(status, RepackStatus::Running);
        assert_eq!(owned_by_db(&db).await, vec![address.clone()]);
        let status = db.report_repack_progress(&address, (1, 0), (2, 0)).await.unwrap();
        assert_eq!(status, RepackStatus::Complete);
        assert!(owned_by_db(&db).await.is_empty());
    });
}

#[ostoredb::test]
async fn drive_states_are_upserted_and_removed() {
    with_timeout!(10_000, {
        let (db, _catalogue) = open_db(memory_backend()).await;
        db.report_drive_state(DriveState::new("drive0", "tpsrv01", "lib0")).await.unwrap();
        let mut up = DriveState::new("drive0", "tpsrv01", "lib0");
        up.status = DriveStatus::Up;
        db.report_drive_state(up).await.unwrap();
        db.report_drive_state(DriveState::new("drive1", "tpsrv02", "lib0")).await.unwrap();

        let states = db.drive_states().await.unwrap();
        assert_eq!(states.len(), 2);
        let drive0 = states.iter().find(|s| s.drive_name == "drive0").unwrap();
        assert_eq!(drive0.status, DriveStatus::Up);
        assert!(drive0.last_update_time > 0);

        assert!(db.remove_drive("drive0").await.unwrap());
        assert!(!db.remove_drive("drive0").await.unwrap());
        assert_eq!(db.drive_states().await.unwrap().len(), 1);
    });
}

#[ostoredb::test]
async fn shutdown_keeps_an_agent_that_still_owns_jobs() {
    with_timeout!(20_000, {
        let backend = memory_backend();
        let (db, _catalogue) = open_db(backend.clone()).await;
        db.queue_archive(archive_submission(20, 100, &[(1, TAPE_POOL)]))
            .await
            .unwrap();
        db.wait_for_idle().await;
        let batch = db.get_next_archive_jobs(TAPE_POOL, 10, u64::MAX).await.unwrap();
        assert_eq!(batch.elements.len(), 1);

        db.shutdown().await.unwrap();
        assert!(backend.exists(db.agent_reference().address()).await.unwrap());
    });
}

#[ostoredb::test(flavor = "multi_thread", worker_threads = 4)]
async fn many_archives_on_a_slate_backend() {
    with_timeout!(60_000, {
        let (_tmp, backend) = open_temp_backend().await;
        let (db, _catalogue) = open_db(backend.clone()).await;
        for id in 0..20 {
            db.queue_archive(archive_submission(100 + id, 10, &[(1, TAPE_POOL)]))
                .await
                .unwrap();
        }
        db.wait_for_idle().await;
        let summaries = db.archive_queue_summaries(JobQueueType::JobsToTransferForUser).await.unwrap();
        assert_eq!(summaries[0].summary.jobs, 20);

        let batch = db.get_next_archive_jobs(TAPE_POOL, 15, u64::MAX).await.unwrap();
        assert_eq!(batch.elements.len(), 15);
        let batch = db.get_next_archive_jobs(TAPE_POOL, 15, u64::MAX).await.unwrap();
        assert_eq!(batch.elements.len(), 5);
        assert_eq!(owned_by_db(&db).await.len(), 20);
    });
}

#[ostoredb::test]
async fn cancelled_archive_leaves_no_queued_job() {
    with_timeout!(20_000, {
        let backend = memory_backend();
        let (db, _catalogue) = open_db(backend.clone()).await;
        let address = db
            .queue_archive(archive_submission(30, 100, &[(1, "PoolA"), (2, "PoolB")]))
            .await
            .unwrap();
        db.wait_for_idle().await;
        // one job in a tape server's hands, one still queued
        let popped = db.get_next_archive_jobs("PoolA", 10, u64::MAX).await.unwrap();
        assert_eq!(popped.elements.len(), 1);

        assert!(matches!(
            db.cancel_archive(&address, 31).await,
            Err(SchedulerDbError::InvalidRequest(_))
        ));
        assert!(backend.exists(&address).await.unwrap());

        assert!(db.cancel_archive(&address, 30).await.unwrap());
        assert!(!backend.exists(&address).await.unwrap());
        assert!(db
            .archive_queue_summaries(JobQueueType::JobsToTransferForUser)
            .await
            .unwrap()
            .is_empty());
        assert!(owned_by_db(&db).await.is_empty());
        assert!(db.report_archive_success(&popped.elements[0], "V1", 1).await.is_err());
        assert!(!db.cancel_archive(&address, 30).await.unwrap());
    });
}

#[ostoredb::test]
async fn cancelled_retrieve_is_dereferenced_and_deleted() {
    with_timeout!(20_000, {
        let backend = memory_backend();
        let (db, _catalogue) = open_db(backend.clone()).await;
        let kept = db
            .queue_retrieve(retrieve_submission(40, 100, &[(1, "V1", 1)]))
            .await
            .unwrap();
        let cancelled = db
            .queue_retrieve(retrieve_submission(41, 100, &[(1, "V1", 2)]))
            .await
            .unwrap();
        db.wait_for_idle().await;

        assert!(db.cancel_retrieve(&cancelled, 41).await.unwrap());
        assert!(!backend.exists(&cancelled).await.unwrap());
        assert!(owned_by_db(&db).await.is_empty());
        let summaries = db.retrieve_queue_summaries(JobQueueType::JobsToTransferForUser).await.unwrap();
        assert_eq!(summaries.len(), 1);
        assert_eq!(summaries[0].summary.jobs, 1);

        let batch = db.get_next_retrieve_jobs("V1", 10, u64::MAX).await.unwrap();
        assert_eq!(batch.elements.len(), 1);
        assert_eq!(batch.elements[0].job.address, kept);
        assert!(!db.cancel_retrieve(&cancelled, 41).await.unwrap());
    });
}

#[ostoredb::test]
async fn cancelled_repack_leaves_its_queue_or_agent() {
    with_timeout!(20_000, {
        let backend = memory_backend();
        let (db, _catalogue) = open_db(backend.clone()).await;
        let first = db.queue_repack("V1", "file://buffer").await.unwrap();
        let second = db.queue_repack("V2", "file://buffer").await.unwrap();
        let promoted = db.promote_repack_requests_to_expand(5).await.unwrap();
        assert_eq!(promoted.len(), 2);
        let third = db.queue_repack("V3", "file://buffer").await.unwrap();
        let other = db.queue_repack("V1", "file://other").await.unwrap();
        assert!(db.cancel_repack(&other, "V1").await.unwrap());

        assert!(matches!(
            db.cancel_repack(&first, "V2").await,
            Err(SchedulerDbError::InvalidRequest(_))
        ));
        assert!(db.cancel_repack(&second, "V2").await.unwrap());
        assert!(!backend.exists(&second).await.unwrap());
        let next = db
            .get_next_repack_request_to_expand()
            .await
            .unwrap()
            .expect("the other request to expand");
        assert_eq!(next.address, first);

        let popped = db.get_next_repack_requests(5).await.unwrap();
        assert_eq!(popped.len(), 1);
        assert_eq!(popped[0].address, third);
        assert!(db.cancel_repack(&third, "V3").await.unwrap());
        assert!(!backend.exists(&third).await.unwrap());
        assert_eq!(owned_by_db(&db).await, vec![first.clone()]);
        assert!(db.get_next_repack_requests(5).await.unwrap().is_empty());
    });
}
