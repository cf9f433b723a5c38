//! Coalesced enqueueing of single jobs into sharded queues.
//!
//! Producers enqueueing to the same (kind, key) concurrently share one queue
//! lock/fetch/commit. Every producer receives a handle on the still locked
//! queue; the lock is released once the last handle is dropped, after each
//! producer has switched its request to the queue.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use futures::future::{FutureExt, Shared};
use tokio::sync::oneshot;
use tracing::debug;

use crate::agent_reference::AgentReference;
use crate::backend::Backend;
use crate::helpers::get_locked_and_fetched_queue;
use crate::objects::job_queue::{JobsSummary, QueueJobRef, QueuePayload};
use crate::objects::{Object, ObjectError, QueueKind};

/// A queue locked on behalf of every producer of one batch.
pub struct SharedQueueLock<P: QueuePayload> {
    queue: Object<P>,
}

impl<P: QueuePayload> SharedQueueLock<P> {
    pub fn address(&self) -> &str {
        self.queue.address()
    }

    /// Summary as committed by the batch.
    pub fn summary(&self) -> JobsSummary {
        self.queue.summary()
    }
}

type BatchResult<P> = Result<Arc<SharedQueueLock<P>>, ObjectError>;

struct PendingJob<P: QueuePayload> {
    job: QueueJobRef,
    reply: oneshot::Sender<BatchResult<P>>,
}

struct KeyState<P: QueuePayload> {
    forming: Option<Vec<PendingJob<P>>>,
    previous_done: Option<Shared<oneshot::Receiver<()>>>,
}

pub struct MemQueue<P: QueuePayload> {
    queues: Mutex<HashMap<(QueueKind, String), KeyState<P>>>,
    max_shard_size: Option<u64>,
}

impl<P: QueuePayload> Default for MemQueue<P> {
    fn default() -> Self {
        Self::new(None)
    }
}

impl<P: QueuePayload> MemQueue<P> {
    pub fn new(max_shard_size: Option<u64>) -> Self {
        Self {
            queues: Mutex::new(HashMap::new()),
            max_shard_size,
        }
    }

    /// Keys with a batch forming or a round in flight.
    pub fn active_keys(&self) -> usize {
        self.queues.lock().unwrap().len()
    }

    /// Add `job` to the queue for (kind, key), batching with concurrent
    /// callers for the same key, and return the locked queue.
    pub async fn share_lock_and_queue(
        &self,
        kind: QueueKind,
        key: &str,
        job: QueueJobRef,
        agent_ref: &AgentReference,
        backend: &dyn Backend,
    ) -> BatchResult<P> {
        let map_key = (kind, key.to_string());
        let (reply, result) = oneshot::channel();
        let pending = PendingJob { job, reply };
        let service = {
            let mut queues = self.queues.lock().unwrap();
            let state = queues.entry(map_key.clone()).or_insert_with(|| KeyState {
                forming: None,
                previous_done: None,
            });
            match state.forming.as_mut() {
                Some(batch) => {
                    batch.push(pending);
                    None
                }
                None => {
                    state.forming = Some(vec![pending]);
                    let (done_tx, done_rx) = oneshot::channel();
                    let done = done_rx.shared();
                    let previous = state.previous_done.replace(done.clone());
                    Some((previous, done_tx, done))
                }
            }
        };

        if let Some((previous, done_tx, done)) = service {
            if let Some(previous) = previous {
                let _ = previous.await;
            }
            let batch = {
                let mut queues = self.queues.lock().unwrap();
                queues
                    .get_mut(&map_key)
                    .and_then(|state| state.forming.take())
                    .unwrap_or_default()
            };
            let jobs: Vec<QueueJobRef> = batch.iter().map(|p| p.job.clone()).collect();
            let size = jobs.len();
            let outcome = self.insert_batch(kind, key, jobs, agent_ref, backend).await;
            debug!(%kind, key, jobs = size, ok = outcome.is_ok(), "serviced enqueue batch");
            for pending in batch {
                let _ = pending.reply.send(outcome.clone());
            }
            let _ = done_tx.send(());
            self.prune(&map_key, &done);
        }

        result.await.unwrap_or_else(|_| {
            Err(ObjectError::Inconsistent {
                address: key.to_string(),
                reason: "enqueue batch abandoned".to_string(),
            })
        })
    }

    async fn insert_batch(
        &self,
        kind: QueueKind,
        key: &str,
        jobs: Vec<QueueJobRef>,
        agent_ref: &AgentReference,
        backend: &dyn Backend,
    ) -> BatchResult<P> {
        let mut queue = get_locked_and_fetched_queue::<P>(kind, key, agent_ref, backend).await?;
        if let Some(size) = self.max_shard_size {
            queue.set_max_shard_size(size);
        }
        queue.add_jobs_and_commit(jobs, agent_ref, backend).await?;
        Ok(Arc::new(SharedQueueLock { queue }))
    }

    /// Forget the key once no batch is forming and no later round started.
    fn prune(&self, map_key: &(QueueKind, String), done: &Shared<oneshot::Receiver<()>>) {
        let mut queues = self.queues.lock().unwrap();
        let idle = queues.get(map_key).is_some_and(|state| {
            state.forming.is_none()
                && state
                    .previous_done
                    .as_ref()
                    .is_some_and(|previous| previous.ptr_eq(done))
        });
        if idle {
            queues.remove(map_key);
        }
    }
}
