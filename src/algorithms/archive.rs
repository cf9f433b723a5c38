use std::collections::HashSet;

use async_trait::async_trait;
use futures::future::join_all;

use super::{ContainerSummary, ContainerTraits, JobKey, OwnershipSwitch, PopCriteria, PoppedSummary};
use crate::agent_reference::AgentReference;
use crate::backend::Backend;
use crate::objects::archive_request::ArchiveJobOwnerUpdate;
use crate::objects::job_queue::QueueJobRef;
use crate::objects::{
    ArchiveJobStatus, ArchiveQueue, ArchiveQueueData, ArchiveRequest, JobQueueType, ObjectError, QueueKind,
};

/// One archive job to reference from a queue keyed by tape pool (or repack
/// request address for repack reports).
#[derive(Debug, Clone)]
pub struct ArchiveJobToQueue {
    pub job: QueueJobRef,
    /// Status the job takes when its ownership switches to the queue.
    pub new_status: Option<ArchiveJobStatus>,
}

/// An archive job now owned by the popping agent.
#[derive(Debug, Clone)]
pub struct PoppedArchiveJob {
    pub job: QueueJobRef,
    pub request: ArchiveJobOwnerUpdate,
}

pub struct ArchiveQueueTraits {
    queue_type: JobQueueType,
    max_shard_size: Option<u64>,
}

impl ArchiveQueueTraits {
    pub fn new(queue_type: JobQueueType) -> Self {
        Self {
            queue_type,
            max_shard_size: None,
        }
    }

    /// Shard size applied to the queue whenever references are added.
    pub fn with_max_shard_size(mut self, max_shard_size: u64) -> Self {
        self.max_shard_size = Some(max_shard_size);
        self
    }

    fn prepare(&self, container: &mut ArchiveQueue) {
        if let Some(size) = self.max_shard_size {
            container.set_max_shard_size(size);
        }
    }
}

#[async_trait]
impl ContainerTraits for ArchiveQueueTraits {
    type Container = ArchiveQueueData;
    type InsertedElement = ArchiveJobToQueue;
    type Candidate = QueueJobRef;
    type PoppedElement = PoppedArchiveJob;

    fn queue_kind(&self) -> QueueKind {
        QueueKind::Archive(self.queue_type)
    }

    fn container_summary(&self, container: &ArchiveQueue) -> ContainerSummary {
        let summary = container.summary();
        ContainerSummary {
            files: summary.jobs,
            bytes: summary.bytes,
        }
    }

    fn inserted_key(element: &ArchiveJobToQueue) -> JobKey {
        element.job.key()
    }

    fn candidate_key(candidate: &QueueJobRef) -> JobKey {
        candidate.key()
    }

    fn element_summary(element: &PoppedArchiveJob) -> PoppedSummary {
        PoppedSummary {
            files: 1,
            bytes: element.job.size,
        }
    }

    async fn add_references(
        &self,
        container: &mut ArchiveQueue,
        elements: &[ArchiveJobToQueue],
        agent_ref: &AgentReference,
        backend: &dyn Backend,
    ) -> Result<(), ObjectError> {
        self.prepare(container);
        let jobs = elements.iter().map(|e| e.job.clone()).collect();
        container.add_jobs_and_commit(jobs, agent_ref, backend).await
    }

    async fn add_references_if_necessary(
        &self,
        container: &mut ArchiveQueue,
        elements: &[ArchiveJobToQueue],
        agent_ref: &AgentReference,
        backend: &dyn Backend,
    ) -> Result<(), ObjectError> {
        self.prepare(container);
        let jobs = elements.iter().map(|e| e.job.clone()).collect();
        container
            .add_jobs_if_necessary_and_commit(jobs, agent_ref, backend)
            .await
    }

    async fn remove_references(
        &self,
        container: &mut ArchiveQueue,
        keys: &[JobKey],
        backend: &dyn Backend,
    ) -> Result<(), ObjectError> {
        container.remove_jobs_and_commit(keys, backend).await
    }

    async fn candidates(
        &self,
        container: &ArchiveQueue,
        remaining: &PopCriteria,
        skip: &HashSet<JobKey>,
        backend: &dyn Backend,
    ) -> Result<Vec<QueueJobRef>, ObjectError> {
        let list = container
            .candidate_list(remaining.bytes, remaining.files, skip, backend)
            .await?;
        Ok(list.candidates)
    }

    async fn switch_inserted_ownership(
        &self,
        elements: &[ArchiveJobToQueue],
        queue_address: &str,
        previous_owner: &str,
        backend: &dyn Backend,
    ) -> Vec<Result<OwnershipSwitch, ObjectError>> {
        join_all(elements.iter().map(|e| async move {
            let update = ArchiveRequest::update_job_owner(
                backend,
                &e.job.address,
                e.job.copy_nb,
                queue_address,
                previous_owner,
                e.new_status,
            )
            .await?;
            Ok(OwnershipSwitch {
                still_owned_by_previous: update.other_jobs_owned_by_previous,
            })
        }))
        .await
    }

    async fn switch_popped_ownership(
        &self,
        candidates: &[QueueJobRef],
        queue_address: &str,
        agent_address: &str,
        backend: &dyn Backend,
    ) -> Vec<Result<PoppedArchiveJob, ObjectError>> {
        join_all(candidates.iter().map(|job| async move {
            let request = ArchiveRequest::update_job_owner(
                backend,
                &job.address,
                job.copy_nb,
                agent_address,
                queue_address,
                None,
            )
            .await?;
            Ok(PoppedArchiveJob {
                job: job.clone(),
                request,
            })
        }))
        .await
    }
}
