//! Scheduler database facade over the object store.
//!
//! `OStoreDb` owns the process agent, the enqueue batching registries and the
//! enqueue worker pool, and drives request lifecycles through the container
//! algorithms:
//!
//! - `archive`: queueing, popping, reporting and cancelling archive jobs
//! - `retrieve`: queueing, popping, reporting and cancelling retrieve requests
//! - `repack`: repack request queues and cancellation
//! - `worker_pool`: bounded pool running enqueue bottom halves

mod archive;
mod repack;
mod retrieve;
pub mod worker_pool;

pub use archive::ArchiveSubmission;
pub use retrieve::RetrieveSubmission;

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tracing::{debug, info, warn};

use crate::agent_reference::AgentReference;
use crate::algorithms::{AlgorithmError, JobKey};
use crate::backend::Backend;
use crate::catalogue::{Catalogue, CatalogueError};
use crate::garbage_collector::GcContext;
use crate::helpers::{trim_queue_if_needed, QueueSelectionError, RetrieveQueueStatsCache};
use crate::keys::ROOT_ENTRY_ADDRESS;
use crate::mem_queue::MemQueue;
use crate::objects::job_queue::{JobsSummary, QueuePayload};
use crate::objects::{
    ArchiveQueue, ArchiveQueueData, DriveRegister, DriveState, JobQueueType, Object, ObjectError, QueueKind,
    RetrieveQueue, RetrieveQueueData, RootEntry,
};
use crate::settings::{AgentConfig, SchedulerConfig};
use worker_pool::EnqueueWorkerPool;

#[derive(Debug, Error)]
pub enum SchedulerDbError {
    #[error(transparent)]
    Object(#[from] ObjectError),
    #[error(transparent)]
    Algorithm(#[from] AlgorithmError),
    #[error(transparent)]
    Catalogue(#[from] CatalogueError),
    #[error(transparent)]
    QueueSelection(#[from] QueueSelectionError),
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error("enqueue worker pool is shut down")]
    PoolClosed,
}

/// Counters of one queue, as listed for mount decisions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueSummary {
    /// Tape pool, VID or repack request address.
    pub container: String,
    pub address: String,
    pub summary: JobsSummary,
}

pub struct OStoreDb {
    backend: Arc<dyn Backend>,
    catalogue: Arc<dyn Catalogue>,
    agent_ref: Arc<AgentReference>,
    config: SchedulerConfig,
    archive_mem_queue: Arc<MemQueue<ArchiveQueueData>>,
    retrieve_mem_queue: Arc<MemQueue<RetrieveQueueData>>,
    stats_cache: Arc<RetrieveQueueStatsCache>,
    workers: EnqueueWorkerPool,
}

impl OStoreDb {
    /// Register `agent_ref` (creating the root entry on first use) and start
    /// the enqueue workers.
    pub async fn new(
        backend: Arc<dyn Backend>,
        catalogue: Arc<dyn Catalogue>,
        agent_ref: Arc<AgentReference>,
        config: SchedulerConfig,
        agent_config: &AgentConfig,
    ) -> Result<Self, SchedulerDbError> {
        agent_ref
            .register(backend.as_ref(), "scheduler database", agent_config.timeout_ms)
            .await?;
        info!(
            agent = %agent_ref.address(),
            workers = config.enqueue_workers,
            max_outstanding = config.max_outstanding_enqueues,
            "scheduler database ready"
        );
        Ok(Self {
            archive_mem_queue: Arc::new(MemQueue::new(Some(config.archive_shard_size as u64))),
            retrieve_mem_queue: Arc::new(MemQueue::new(Some(config.retrieve_shard_size as u64))),
            stats_cache: Arc::new(RetrieveQueueStatsCache::new(Duration::from_millis(
                config.retrieve_stats_max_age_ms,
            ))),
            workers: EnqueueWorkerPool::new(&config),
            backend,
            catalogue,
            agent_ref,
            config,
        })
    }

    pub fn agent_reference(&self) -> &Arc<AgentReference> {
        &self.agent_ref
    }

    pub fn backend(&self) -> &Arc<dyn Backend> {
        &self.backend
    }

    /// What a garbage collector running in this process needs.
    pub fn gc_context(&self) -> GcContext {
        GcContext {
            agent_ref: self.agent_ref.clone(),
            backend: self.backend.clone(),
            catalogue: self.catalogue.clone(),
            stats_cache: self.stats_cache.clone(),
        }
    }

    pub fn outstanding_enqueues(&self) -> usize {
        self.workers.outstanding()
    }

    /// Wait for every enqueue bottom half submitted so far.
    pub async fn wait_for_idle(&self) {
        self.workers.wait_for_idle().await;
    }

    /// Drain the enqueue workers and unregister the agent. An agent still
    /// owning objects stays registered for the garbage collector.
    pub async fn shutdown(&self) -> Result<(), SchedulerDbError> {
        self.workers.wait_for_idle().await;
        self.workers.shutdown().await;
        match self.agent_ref.unregister(self.backend.as_ref()).await {
            Ok(()) => {
                info!(agent = %self.agent_ref.address(), "scheduler database shut down");
                Ok(())
            }
            Err(ObjectError::Inconsistent { reason, .. }) => {
                warn!(agent = %self.agent_ref.address(), reason = %reason, "agent kept for garbage collection");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Drop `keys` from the sharded queue at `owner` and trim the queue if
    /// that empties it. An owner that is not such a queue is left alone.
    /// Returns whether the queue was found.
    async fn dereference_from_job_queue<P: QueuePayload>(
        &self,
        owner: &str,
        keys: &[JobKey],
    ) -> Result<bool, ObjectError> {
        let backend = self.backend.as_ref();
        let mut queue = match Object::<P>::lock_and_fetch(backend, owner).await {
            Ok(queue) => queue,
            Err(e) if e.is_no_such_object() || matches!(e, ObjectError::WrongType { .. }) => {
                debug!(owner, "owner is not a queue, no reference to remove");
                return Ok(false);
            }
            Err(e) => return Err(e),
        };
        queue.remove_jobs_and_commit(keys, backend).await?;
        let kind = queue.queue_kind();
        let container = queue.container_id().to_string();
        let now_empty = queue.is_empty();
        queue.release();
        if now_empty {
            trim_queue_if_needed(kind, &container, backend).await?;
        }
        Ok(true)
    }

    async fn queues_of_kind(&self, kind: QueueKind) -> Result<Vec<(String, String)>, ObjectError> {
        let root = RootEntry::fetch_no_lock(self.backend.as_ref(), ROOT_ENTRY_ADDRESS).await?;
        Ok(root.queues_of_kind(kind))
    }

    /// Summaries of the archive queues of `queue_type`, one per tape pool.
    pub async fn archive_queue_summaries(
        &self,
        queue_type: JobQueueType,
    ) -> Result<Vec<QueueSummary>, SchedulerDbError> {
        let mut summaries = Vec::new();
        for (container, address) in self.queues_of_kind(QueueKind::Archive(queue_type)).await? {
            match ArchiveQueue::fetch_no_lock(self.backend.as_ref(), &address).await {
                Ok(queue) => summaries.push(QueueSummary {
                    container,
                    address,
                    summary: queue.summary(),
                }),
                Err(e) if e.is_no_such_object() => {
                    warn!(queue = %address, tape_pool = %container, "referenced archive queue does not exist");
                }
                Err(e) => return Err(e.into()),
            }
        }
        Ok(summaries)
    }

    /// Summaries of the retrieve queues of `queue_type`, one per VID. The
    /// transfer queue statistics feed the retrieve queue selection cache.
    pub async fn retrieve_queue_summaries(
        &self,
        queue_type: JobQueueType,
    ) -> Result<Vec<QueueSummary>, SchedulerDbError> {
        let mut summaries = Vec::new();
        for (container, address) in self.queues_of_kind(QueueKind::Retrieve(queue_type)).await? {
            match RetrieveQueue::fetch_no_lock(self.backend.as_ref(), &address).await {
                Ok(queue) => {
                    let summary = queue.summary();
                    if queue_type == JobQueueType::JobsToTransferForUser {
                        self.stats_cache
                            .update(&container, summary.jobs, summary.bytes, summary.priority);
                    }
                    summaries.push(QueueSummary {
                        container,
                        address,
                        summary,
                    });
                }
                Err(e) if e.is_no_such_object() => {
                    warn!(queue = %address, vid = %container, "referenced retrieve queue does not exist");
                }
                Err(e) => return Err(e.into()),
            }
        }
        Ok(summaries)
    }

    async fn drive_register_address(&self) -> Result<String, ObjectError> {
        let root = RootEntry::fetch_no_lock(self.backend.as_ref(), ROOT_ENTRY_ADDRESS).await?;
        Ok(root.drive_register_address().to_string())
    }

    /// Insert or replace the state of one drive.
    pub async fn report_drive_state(&self, mut state: DriveState) -> Result<(), SchedulerDbError> {
        let address = self.drive_register_address().await?;
        state.last_update_time = chrono::Utc::now().timestamp();
        let drive = state.drive_name.clone();
        DriveRegister::update(self.backend.as_ref(), &address, |register| {
            register.set_drive_state(state);
            Ok(())
        })
        .await?;
        info!(drive = %drive, "drive state updated");
        Ok(())
    }

    pub async fn drive_states(&self) -> Result<Vec<DriveState>, SchedulerDbError> {
        let address = self.drive_register_address().await?;
        let register = DriveRegister::fetch_no_lock(self.backend.as_ref(), &address).await?;
        Ok(register.drive_states().to_vec())
    }

    /// Returns false when the drive was not registered.
    pub async fn remove_drive(&self, drive_name: &str) -> Result<bool, SchedulerDbError> {
        let address = self.drive_register_address().await?;
        let removed = DriveRegister::update(self.backend.as_ref(), &address, |register| {
            Ok(register.remove_drive(drive_name))
        })
        .await?;
        if !removed {
            warn!(drive = %drive_name, "drive to remove is not registered");
        }
        Ok(removed)
    }
}
