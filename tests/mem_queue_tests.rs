mod test_helpers;

use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use ostoredb::backend::Backend;
use ostoredb::mem_queue::MemQueue;
use ostoredb::objects::job_queue::QueueJobRef;
use ostoredb::objects::{JobQueueType, QueueKind, RetrieveQueue, RetrieveQueueData};

use test_helpers::*;

fn job(n: u64) -> QueueJobRef {
    QueueJobRef {
        address: format!("RetrieveRequest-memq-{n}"),
        copy_nb: 1,
        size: 100 + n,
        fseq: n,
        priority: 1,
        min_request_age: 0,
        mount_policy: "default".to_string(),
        start_time: 0,
    }
}

#[ostoredb::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_enqueues_share_one_queue() {
    with_timeout!(20_000, {
        let instrumented = InstrumentedBackend::new();
        let backend: Arc<dyn Backend> = instrumented.clone();
        let agent_ref = registered_agent(backend.as_ref(), "memq", 30_000).await;
        let mem_queue: MemQueue<RetrieveQueueData> = MemQueue::new(Some(4));
        let kind = QueueKind::Retrieve(JobQueueType::JobsToTransferForUser);
        // queue writes yield, so callers arriving meanwhile form the next batch
        instrumented.slow_down(&kind.address_prefix(), Duration::from_millis(20));

        let results = join_all((0..10).map(|n| {
            let mem_queue = &mem_queue;
            let agent_ref = &agent_ref;
            let backend = &backend;
            async move {
                // the handle keeps the queue locked, drop it before returning
                let queue = mem_queue
                    .share_lock_and_queue(kind, "V1", job(n), agent_ref, backend.as_ref())
                    .await?;
                Ok::<_, ostoredb::objects::ObjectError>(queue.address().to_string())
            }
        }))
        .await;
        let addresses: Vec<String> = results.into_iter().map(|r| r.expect("enqueue")).collect();
        assert!(addresses.iter().all(|a| a == &addresses[0]));
        assert_eq!(mem_queue.active_keys(), 0);
        let commits = instrumented.overwrites_of(&addresses[0]);
        assert!(commits >= 1);
        assert!(commits < 10, "{commits} queue commits for 10 enqueues");

        let queue = RetrieveQueue::fetch_no_lock(backend.as_ref(), &addresses[0]).await.unwrap();
        let summary = queue.summary();
        assert_eq!(summary.jobs, 10);
        assert_eq!(summary.bytes, (0..10).map(|n| 100 + n).sum::<u64>());
        // four jobs per shard at most
        assert!(queue.shard_count() >= 3);
        let mut fseqs: Vec<u64> = queue
            .dump_jobs(backend.as_ref())
            .await
            .unwrap()
            .iter()
            .map(|j| j.fseq)
            .collect();
        fseqs.sort_unstable();
        assert_eq!(fseqs, (0..10).collect::<Vec<u64>>());
    });
}

#[ostoredb::test]
async fn handle_reports_the_committed_summary() {
    with_timeout!(10_000, {
        let backend = memory_backend();
        let agent_ref = registered_agent(backend.as_ref(), "memq", 30_000).await;
        let mem_queue: MemQueue<RetrieveQueueData> = MemQueue::default();
        let kind = QueueKind::Retrieve(JobQueueType::JobsToTransferForUser);

        let first = mem_queue
            .share_lock_and_queue(kind, "V2", job(1), &agent_ref, backend.as_ref())
            .await
            .unwrap();
        assert_eq!(first.summary().jobs, 1);
        drop(first);
        let second = mem_queue
            .share_lock_and_queue(kind, "V2", job(2), &agent_ref, backend.as_ref())
            .await
            .unwrap();
        assert_eq!(second.summary().jobs, 2);
        assert_eq!(second.summary().bytes, 101 + 102);
    });
}
