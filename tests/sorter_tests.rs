mod test_helpers;

use ostoredb::algorithms::retrieve::RetrieveRequestToQueue;
use ostoredb::keys::ROOT_ENTRY_ADDRESS;
use ostoredb::objects::{ArchiveQueue, ArchiveRequest, JobQueueType, QueueKind, RetrieveQueue, RootEntry};
use ostoredb::sorter::{SortOutcome, Sorter};

use test_helpers::*;

#[ostoredb::test]
async fn sorted_jobs_land_in_their_queues() {
    with_timeout!(20_000, {
        let backend = memory_backend();
        let agent_ref = registered_agent(backend.as_ref(), "sorter", 30_000).await;
        let mut sorter = Sorter::new(backend.clone(), agent_ref.clone());

        let mut promises = Vec::new();
        for (id, pool) in [(1, "PoolA"), (2, "PoolB"), (3, "PoolA")] {
            let element = insert_archive_request(backend.as_ref(), &agent_ref, id, 10, pool).await;
            promises.push((
                pool,
                sorter.insert_archive_job(pool, JobQueueType::JobsToTransferForUser, agent_ref.address(), element),
            ));
        }
        let retrieve = insert_retrieve_request(backend.as_ref(), &agent_ref, 4, 10, "V1", 7).await;
        let retrieve_promise = sorter.insert_retrieve_request(
            "V1",
            JobQueueType::JobsToTransferForUser,
            agent_ref.address(),
            RetrieveRequestToQueue {
                job: retrieve.queue_job_ref(1),
                new_status: None,
            },
        );
        assert!(!sorter.is_empty());
        sorter.flush_all().await;
        assert!(sorter.is_empty());

        let root = RootEntry::fetch_no_lock(backend.as_ref(), ROOT_ENTRY_ADDRESS).await.unwrap();
        let kind = QueueKind::Archive(JobQueueType::JobsToTransferForUser);
        for (pool, promise) in promises {
            let outcome = Sorter::wait(promise).await.unwrap();
            let expected = root.queue_address(kind, pool).unwrap();
            assert_eq!(outcome, SortOutcome::Queued { queue_address: expected });
        }
        let pool_a = root.queue_address(kind, "PoolA").unwrap();
        let queue = ArchiveQueue::fetch_no_lock(backend.as_ref(), &pool_a).await.unwrap();
        assert_eq!(queue.summary().jobs, 2);

        let SortOutcome::Queued { queue_address } = Sorter::wait(retrieve_promise).await.unwrap() else {
            panic!("retrieve request was not queued");
        };
        let queue = RetrieveQueue::fetch_no_lock(backend.as_ref(), &queue_address).await.unwrap();
        assert_eq!(queue.summary().jobs, 1);
    });
}

#[ostoredb::test]
async fn vanished_requests_resolve_without_error() {
    with_timeout!(20_000, {
        let backend = memory_backend();
        let agent_ref = registered_agent(backend.as_ref(), "sorter", 30_000).await;
        let mut sorter = Sorter::new(backend.clone(), agent_ref.clone());

        let kept = insert_archive_request(backend.as_ref(), &agent_ref, 1, 10, TAPE_POOL).await;
        let gone = insert_archive_request(backend.as_ref(), &agent_ref, 2, 10, TAPE_POOL).await;
        let gone_address = gone.job.address.clone();
        let kept_promise =
            sorter.insert_archive_job(TAPE_POOL, JobQueueType::JobsToTransferForUser, agent_ref.address(), kept);
        let gone_promise =
            sorter.insert_archive_job(TAPE_POOL, JobQueueType::JobsToTransferForUser, agent_ref.address(), gone);
        ArchiveRequest::lock_and_fetch(backend.as_ref(), &gone_address)
            .await
            .unwrap()
            .remove(backend.as_ref())
            .await
            .unwrap();

        sorter.flush_all().await;
        assert!(matches!(
            Sorter::wait(kept_promise).await,
            Ok(SortOutcome::Queued { .. })
        ));
        assert_eq!(Sorter::wait(gone_promise).await, Ok(SortOutcome::Vanished));
    });
}
