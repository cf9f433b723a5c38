mod test_helpers;

use std::collections::HashSet;
use std::sync::Arc;

use bytes::Bytes;
use futures::future::join_all;
use ostoredb::algorithms::archive::ArchiveQueueTraits;
use ostoredb::algorithms::retrieve::{RetrieveQueueTraits, RetrieveRequestToQueue};
use ostoredb::algorithms::{AlgorithmError, ContainerAlgorithms, JobKey, PopCriteria};
use ostoredb::backend::Backend;
use ostoredb::keys::ROOT_ENTRY_ADDRESS;
use ostoredb::objects::{
    Agent, ArchiveQueue, ArchiveRequest, JobQueueType, ObjectError, QueueKind, RetrieveQueue, RetrieveRequest,
    RootEntry,
};

use test_helpers::*;

fn archive_algorithms(
    backend: &Arc<dyn Backend>,
    agent_ref: &Arc<ostoredb::agent_reference::AgentReference>,
) -> ContainerAlgorithms<ArchiveQueueTraits> {
    ContainerAlgorithms::new(
        backend.clone(),
        agent_ref.clone(),
        ArchiveQueueTraits::new(JobQueueType::JobsToTransferForUser),
    )
}

async fn agent_ownership(backend: &dyn Backend, address: &str) -> Vec<String> {
    Agent::fetch_no_lock(backend, address)
        .await
        .unwrap()
        .ownership_list()
        .to_vec()
}

async fn queue_address(backend: &dyn Backend, kind: QueueKind, key: &str) -> Option<String> {
    RootEntry::fetch_no_lock(backend, ROOT_ENTRY_ADDRESS)
        .await
        .unwrap()
        .queue_address(kind, key)
}

#[ostoredb::test]
async fn archive_jobs_pop_by_bytes_then_queue_is_trimmed() {
    with_timeout!(20_000, {
        let backend = memory_backend();
        let agent_ref = registered_agent(backend.as_ref(), "algo", 30_000).await;
        let algorithms = archive_algorithms(&backend, &agent_ref);

        let mut elements = Vec::new();
        for id in 0..10 {
            elements.push(insert_archive_request(backend.as_ref(), &agent_ref, id, 1000, TAPE_POOL).await);
        }
        assert_eq!(agent_ownership(backend.as_ref(), agent_ref.address()).await.len(), 10);

        let queue = algorithms
            .reference_and_switch_ownership(TAPE_POOL, agent_ref.address(), elements.clone())
            .await
            .expect("reference jobs");
        assert!(agent_ownership(backend.as_ref(), agent_ref.address()).await.is_empty());
        let fetched = ArchiveQueue::fetch_no_lock(backend.as_ref(), &queue).await.unwrap();
        assert_eq!(fetched.summary().jobs, 10);
        assert_eq!(fetched.summary().bytes, 10_000);
        for element in &elements {
            let request = ArchiveRequest::fetch_no_lock(backend.as_ref(), &element.job.address)
                .await
                .unwrap();
            assert_eq!(request.job_owner(1).unwrap(), queue);
        }

        // the seventh job crosses the byte bound
        let first = algorithms
            .pop_next_batch(TAPE_POOL, PopCriteria::new(100, 6670))
            .await
            .expect("first pop");
        assert_eq!(first.elements.len(), 7);
        assert_eq!(first.summary.bytes, 7000);
        assert!(first.unexpected_failures.is_empty());
        assert_eq!(agent_ownership(backend.as_ref(), agent_ref.address()).await.len(), 7);
        for popped in &first.elements {
            let request = ArchiveRequest::fetch_no_lock(backend.as_ref(), &popped.job.address)
                .await
                .unwrap();
            assert_eq!(request.job_owner(1).unwrap(), agent_ref.address());
        }

        let second = algorithms
            .pop_next_batch(TAPE_POOL, PopCriteria::new(100, u64::MAX))
            .await
            .expect("second pop");
        assert_eq!(second.elements.len(), 3);
        let kind = QueueKind::Archive(JobQueueType::JobsToTransferForUser);
        assert_eq!(queue_address(backend.as_ref(), kind, TAPE_POOL).await, None);
        assert!(!backend.exists(&queue).await.unwrap());
    });
}

#[ostoredb::test]
async fn zero_criteria_pop_nothing() {
    with_timeout!(10_000, {
        let backend = memory_backend();
        let agent_ref = registered_agent(backend.as_ref(), "algo", 30_000).await;
        let algorithms = archive_algorithms(&backend, &agent_ref);
        let element = insert_archive_request(backend.as_ref(), &agent_ref, 1, 500, TAPE_POOL).await;
        let queue = algorithms
            .reference_and_switch_ownership(TAPE_POOL, agent_ref.address(), vec![element])
            .await
            .unwrap();

        let batch = algorithms
            .pop_next_batch(TAPE_POOL, PopCriteria::new(0, 0))
            .await
            .unwrap();
        assert!(batch.elements.is_empty());
        let fetched = ArchiveQueue::fetch_no_lock(backend.as_ref(), &queue).await.unwrap();
        assert_eq!(fetched.summary().jobs, 1);
    });
}

#[ostoredb::test]
async fn popping_a_missing_queue_returns_an_empty_batch() {
    with_timeout!(10_000, {
        let backend = memory_backend();
        let agent_ref = registered_agent(backend.as_ref(), "algo", 30_000).await;
        let batch = archive_algorithms(&backend, &agent_ref)
            .pop_next_batch("NoSuchPool", PopCriteria::new(10, u64::MAX))
            .await
            .unwrap();
        assert!(batch.elements.is_empty());
        assert_eq!(batch.summary.files, 0);
    });
}

#[ostoredb::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_references_create_a_single_queue() {
    with_timeout!(20_000, {
        let backend = memory_backend();
        let agent_ref = registered_agent(backend.as_ref(), "algo", 30_000).await;
        let mut elements = Vec::new();
        for id in 0..5 {
            elements.push(insert_archive_request(backend.as_ref(), &agent_ref, id, 100, "NewPool").await);
        }

        let results = join_all(elements.into_iter().map(|element| {
            let algorithms = archive_algorithms(&backend, &agent_ref);
            let previous_owner = agent_ref.address().to_string();
            async move {
                algorithms
                    .reference_and_switch_ownership("NewPool", &previous_owner, vec![element])
                    .await
            }
        }))
        .await;
        let addresses: Vec<String> = results.into_iter().map(|r| r.unwrap()).collect();
        assert!(addresses.iter().all(|a| a == &addresses[0]));

        let root = RootEntry::fetch_no_lock(backend.as_ref(), ROOT_ENTRY_ADDRESS).await.unwrap();
        let queues = root.queues_of_kind(QueueKind::Archive(JobQueueType::JobsToTransferForUser));
        assert_eq!(queues.len(), 1);
        let queue = ArchiveQueue::fetch_no_lock(backend.as_ref(), &addresses[0]).await.unwrap();
        assert_eq!(queue.summary().jobs, 5);
    });
}

#[ostoredb::test]
async fn vanished_elements_are_dereferenced_while_popping() {
    with_timeout!(20_000, {
        let backend = memory_backend();
        let agent_ref = registered_agent(backend.as_ref(), "algo", 30_000).await;
        let algorithms = archive_algorithms(&backend, &agent_ref);
        let mut elements = Vec::new();
        for id in 0..5 {
            elements.push(insert_archive_request(backend.as_ref(), &agent_ref, id, 100, TAPE_POOL).await);
        }
        algorithms
            .reference_and_switch_ownership(TAPE_POOL, agent_ref.address(), elements.clone())
            .await
            .unwrap();

        let gone = ArchiveRequest::lock_and_fetch(backend.as_ref(), &elements[2].job.address)
            .await
            .unwrap();
        gone.remove(backend.as_ref()).await.unwrap();

        let batch = algorithms
            .pop_next_batch(TAPE_POOL, PopCriteria::new(10, u64::MAX))
            .await
            .unwrap();
        assert_eq!(batch.elements.len(), 4);
        assert!(batch.unexpected_failures.is_empty());
        assert!(batch.elements.iter().all(|e| e.job.address != elements[2].job.address));
        let owned = agent_ownership(backend.as_ref(), agent_ref.address()).await;
        assert_eq!(owned.len(), 4);
        assert!(!owned.contains(&elements[2].job.address));
        let kind = QueueKind::Archive(JobQueueType::JobsToTransferForUser);
        assert_eq!(queue_address(backend.as_ref(), kind, TAPE_POOL).await, None);
    });
}

#[ostoredb::test]
async fn failed_switches_are_dereferenced_and_reported() {
    with_timeout!(20_000, {
        let backend = memory_backend();
        let agent_ref = registered_agent(backend.as_ref(), "algo", 30_000).await;
        let other = registered_agent(backend.as_ref(), "other", 30_000).await;
        let algorithms = archive_algorithms(&backend, &agent_ref);
        let ours = insert_archive_request(backend.as_ref(), &agent_ref, 1, 100, TAPE_POOL).await;
        let theirs = insert_archive_request(backend.as_ref(), &other, 2, 100, TAPE_POOL).await;

        let err = algorithms
            .reference_and_switch_ownership(TAPE_POOL, agent_ref.address(), vec![ours.clone(), theirs.clone()])
            .await
            .unwrap_err();
        let AlgorithmError::OwnershipSwitch(failure) = err else {
            panic!("expected an ownership switch failure, got {err:?}");
        };
        assert_eq!(failure.failed.len(), 1);
        assert_eq!(failure.failed[0].address, theirs.job.address);
        assert!(failure.failed[0].error.is_wrong_previous_owner());

        let queue = ArchiveQueue::fetch_no_lock(backend.as_ref(), &failure.queue_address)
            .await
            .unwrap();
        assert_eq!(queue.summary().jobs, 1);
        let request = ArchiveRequest::fetch_no_lock(backend.as_ref(), &theirs.job.address)
            .await
            .unwrap();
        assert_eq!(request.job_owner(1).unwrap(), other.address());
        assert!(agent_ownership(backend.as_ref(), agent_ref.address()).await.is_empty());
    });
}

#[ostoredb::test]
async fn retrieve_requests_pop_in_fseq_order() {
    with_timeout!(20_000, {
        let backend = memory_backend();
        let agent_ref = registered_agent(backend.as_ref(), "algo", 30_000).await;
        let algorithms = ContainerAlgorithms::new(
            backend.clone(),
            agent_ref.clone(),
            RetrieveQueueTraits::new(JobQueueType::JobsToTransferForUser),
        );
        let mut elements = Vec::new();
        for (id, fseq) in [(1, 30), (2, 10), (3, 20)] {
            let request = insert_retrieve_request(backend.as_ref(), &agent_ref, id, 100, "V1", fseq).await;
            elements.push(RetrieveRequestToQueue {
                job: request.queue_job_ref(1),
                new_status: None,
            });
        }
        let queue = algorithms
            .reference_and_switch_ownership("V1", agent_ref.address(), elements)
            .await
            .unwrap();
        let fetched = RetrieveQueue::fetch_no_lock(backend.as_ref(), &queue).await.unwrap();
        assert_eq!(fetched.summary().jobs, 3);

        let batch = algorithms
            .pop_next_batch("V1", PopCriteria::new(2, u64::MAX))
            .await
            .unwrap();
        let fseqs: Vec<u64> = batch.elements.iter().map(|e| e.job.fseq).collect();
        assert_eq!(fseqs, vec![10, 20]);
        let request = RetrieveRequest::fetch_no_lock(backend.as_ref(), &batch.elements[0].job.address)
            .await
            .unwrap();
        assert_eq!(request.owner(), agent_ref.address());
    });
}

#[ostoredb::test]
async fn copies_of_one_request_in_one_queue_pop_separately() {
    with_timeout!(20_000, {
        let backend = memory_backend();
        let agent_ref = registered_agent(backend.as_ref(), "algo", 30_000).await;
        let algorithms = archive_algorithms(&backend, &agent_ref);
        let elements =
            insert_archive_request_copies(backend.as_ref(), &agent_ref, 1, 100, &[(1, TAPE_POOL), (2, TAPE_POOL)]).await;
        let address = elements[0].job.address.clone();

        let queue = algorithms
            .reference_and_switch_ownership(TAPE_POOL, agent_ref.address(), elements)
            .await
            .unwrap();
        assert!(agent_ownership(backend.as_ref(), agent_ref.address()).await.is_empty());
        let fetched = ArchiveQueue::fetch_no_lock(backend.as_ref(), &queue).await.unwrap();
        assert_eq!(fetched.summary().jobs, 2);

        let first = algorithms
            .pop_next_batch(TAPE_POOL, PopCriteria::new(1, u64::MAX))
            .await
            .unwrap();
        assert_eq!(first.elements.len(), 1);
        let popped_copy = first.elements[0].job.copy_nb;
        let other_copy = if popped_copy == 1 { 2 } else { 1 };

        // the sibling job is still queued and still owned by the queue
        let fetched = ArchiveQueue::fetch_no_lock(backend.as_ref(), &queue).await.unwrap();
        assert_eq!(fetched.summary().jobs, 1);
        let remaining: Vec<JobKey> = fetched
            .dump_jobs(backend.as_ref())
            .await
            .unwrap()
            .iter()
            .map(|j| j.key())
            .collect();
        assert_eq!(remaining, vec![JobKey::new(&address, other_copy)]);
        let request = ArchiveRequest::fetch_no_lock(backend.as_ref(), &address).await.unwrap();
        assert_eq!(request.job_owner(popped_copy).unwrap(), agent_ref.address());
        assert_eq!(request.job_owner(other_copy).unwrap(), queue);
        assert_eq!(agent_ownership(backend.as_ref(), agent_ref.address()).await, vec![address.clone()]);

        let second = algorithms
            .pop_next_batch(TAPE_POOL, PopCriteria::new(10, u64::MAX))
            .await
            .unwrap();
        assert_eq!(second.elements.len(), 1);
        assert_eq!(second.elements[0].job.copy_nb, other_copy);
        let kind = QueueKind::Archive(JobQueueType::JobsToTransferForUser);
        assert_eq!(queue_address(backend.as_ref(), kind, TAPE_POOL).await, None);
        let request = ArchiveRequest::fetch_no_lock(backend.as_ref(), &address).await.unwrap();
        assert_eq!(request.job_owner(1).unwrap(), agent_ref.address());
        assert_eq!(request.job_owner(2).unwrap(), agent_ref.address());
    });
}

#[ostoredb::test]
async fn undecodable_element_stays_queued_and_ends_the_pop() {
    with_timeout!(20_000, {
        let backend = memory_backend();
        let agent_ref = registered_agent(backend.as_ref(), "algo", 30_000).await;
        let algorithms = archive_algorithms(&backend, &agent_ref);
        let mut elements = Vec::new();
        for id in 0..3 {
            elements.push(insert_archive_request(backend.as_ref(), &agent_ref, id, 100, TAPE_POOL).await);
        }
        let queue = algorithms
            .reference_and_switch_ownership(TAPE_POOL, agent_ref.address(), elements.clone())
            .await
            .unwrap();
        let broken = elements[1].job.address.clone();
        backend
            .overwrite(&broken, Bytes::from_static(b"not an object"))
            .await
            .unwrap();

        let batch = algorithms
            .pop_next_batch(TAPE_POOL, PopCriteria::new(10, u64::MAX))
            .await
            .unwrap();
        assert_eq!(batch.elements.len(), 2);
        assert_eq!(batch.summary.files, 2);
        assert_eq!(batch.unexpected_failures.len(), 1);
        assert_eq!(batch.unexpected_failures[0].address, broken);
        assert_eq!(batch.unexpected_failures[0].copy_nb, 1);
        assert!(matches!(batch.unexpected_failures[0].error, ObjectError::Inconsistent { .. }));

        let fetched = ArchiveQueue::fetch_no_lock(backend.as_ref(), &queue).await.unwrap();
        assert_eq!(fetched.summary().jobs, 1);
        let left = fetched.dump_jobs(backend.as_ref()).await.unwrap();
        assert_eq!(left[0].address, broken);
        let owned: HashSet<String> = agent_ownership(backend.as_ref(), agent_ref.address())
            .await
            .into_iter()
            .collect();
        assert_eq!(owned.len(), 2);
        assert!(!owned.contains(&broken));
    });
}

#[ostoredb::test]
async fn non_empty_queue_is_not_removed_from_the_root_entry() {
    with_timeout!(10_000, {
        let backend = memory_backend();
        let agent_ref = registered_agent(backend.as_ref(), "algo", 30_000).await;
        let algorithms = archive_algorithms(&backend, &agent_ref);
        let element = insert_archive_request(backend.as_ref(), &agent_ref, 1, 100, TAPE_POOL).await;
        let queue = algorithms
            .reference_and_switch_ownership(TAPE_POOL, agent_ref.address(), vec![element])
            .await
            .unwrap();

        let kind = QueueKind::Archive(JobQueueType::JobsToTransferForUser);
        let mut root = RootEntry::lock_and_fetch(backend.as_ref(), ROOT_ENTRY_ADDRESS).await.unwrap();
        let err = root
            .remove_queue_and_commit(kind, TAPE_POOL, backend.as_ref())
            .await
            .unwrap_err();
        assert_eq!(err, ObjectError::QueueNotEmpty(queue.clone()));
        root.release();

        assert_eq!(queue_address(backend.as_ref(), kind, TAPE_POOL).await, Some(queue.clone()));
        let fetched = ArchiveQueue::fetch_no_lock(backend.as_ref(), &queue).await.unwrap();
        assert_eq!(fetched.summary().jobs, 1);
    });
}

#[ostoredb::test]
async fn corrupted_queue_aggregates_are_rebuilt_from_shards() {
    with_timeout!(10_000, {
        let backend = memory_backend();
        let agent_ref = registered_agent(backend.as_ref(), "algo", 30_000).await;
        let algorithms = archive_algorithms(&backend, &agent_ref);
        let mut elements = Vec::new();
        for id in 0..3 {
            elements.push(insert_archive_request(backend.as_ref(), &agent_ref, id, 100, TAPE_POOL).await);
        }
        let queue = algorithms
            .reference_and_switch_ownership(TAPE_POOL, agent_ref.address(), elements)
            .await
            .unwrap();

        let mut locked = ArchiveQueue::lock_and_fetch(backend.as_ref(), &queue).await.unwrap();
        locked.payload_mut().queue.jobs_count = 42;
        locked.payload_mut().queue.bytes = 7;
        assert!(locked.rebuild(backend.as_ref()).await.unwrap());
        assert_eq!(locked.summary().jobs, 3);
        assert_eq!(locked.summary().bytes, 300);
        assert_eq!(locked.maps_rebuild_count(), 1);
        // nothing left to fix
        assert!(!locked.rebuild(backend.as_ref()).await.unwrap());

        // stored corruption is repaired by the next queue update
        locked.payload_mut().queue.jobs_count = 42;
        locked.commit(backend.as_ref()).await.unwrap();
        locked.release();
        let element = insert_archive_request(backend.as_ref(), &agent_ref, 9, 100, TAPE_POOL).await;
        algorithms
            .reference_and_switch_ownership(TAPE_POOL, agent_ref.address(), vec![element])
            .await
            .unwrap();
        let fetched = ArchiveQueue::fetch_no_lock(backend.as_ref(), &queue).await.unwrap();
        assert_eq!(fetched.summary().jobs, 4);
        assert_eq!(fetched.summary().bytes, 400);
        assert_eq!(fetched.maps_rebuild_count(), 3);
    });
}
