use std::collections::HashSet;

use async_trait::async_trait;
use futures::future::join_all;

use super::{ContainerSummary, ContainerTraits, JobKey, OwnershipSwitch, PopCriteria, PoppedSummary};
use crate::agent_reference::AgentReference;
use crate::backend::Backend;
use crate::objects::job_queue::QueueJobRef;
use crate::objects::retrieve_request::RetrieveOwnerUpdate;
use crate::objects::{
    JobQueueType, ObjectError, QueueKind, RetrieveJobStatus, RetrieveQueue, RetrieveQueueData, RetrieveRequest,
};

/// A retrieve request to reference from the queue of one VID, through the
/// job of copy `job.copy_nb`.
#[derive(Debug, Clone)]
pub struct RetrieveRequestToQueue {
    pub job: QueueJobRef,
    pub new_status: Option<RetrieveJobStatus>,
}

#[derive(Debug, Clone)]
pub struct PoppedRetrieveRequest {
    pub job: QueueJobRef,
    pub request: RetrieveOwnerUpdate,
}

pub struct RetrieveQueueTraits {
    queue_type: JobQueueType,
    max_shard_size: Option<u64>,
}

impl RetrieveQueueTraits {
    pub fn new(queue_type: JobQueueType) -> Self {
        Self {
            queue_type,
            max_shard_size: None,
        }
    }

    pub fn with_max_shard_size(mut self, max_shard_size: u64) -> Self {
        self.max_shard_size = Some(max_shard_size);
        self
    }
}

#[async_trait]
impl ContainerTraits for RetrieveQueueTraits {
    type Container = RetrieveQueueData;
    type InsertedElement = RetrieveRequestToQueue;
    type Candidate = QueueJobRef;
    type PoppedElement = PoppedRetrieveRequest;

    fn queue_kind(&self) -> QueueKind {
        QueueKind::Retrieve(self.queue_type)
    }

    fn container_summary(&self, container: &RetrieveQueue) -> ContainerSummary {
        let summary = container.summary();
        ContainerSummary {
            files: summary.jobs,
            bytes: summary.bytes,
        }
    }

    fn inserted_key(element: &RetrieveRequestToQueue) -> JobKey {
        element.job.key()
    }

    fn candidate_key(candidate: &QueueJobRef) -> JobKey {
        candidate.key()
    }

    fn element_summary(element: &PoppedRetrieveRequest) -> PoppedSummary {
        PoppedSummary {
            files: 1,
            bytes: element.job.size,
        }
    }

    async fn add_references(
        &self,
        container: &mut RetrieveQueue,
        elements: &[RetrieveRequestToQueue],
        agent_ref: &AgentReference,
        backend: &dyn Backend,
    ) -> Result<(), ObjectError> {
        if let Some(size) = self.max_shard_size {
            container.set_max_shard_size(size);
        }
        let jobs = elements.iter().map(|e| e.job.clone()).collect();
        container.add_jobs_and_commit(jobs, agent_ref, backend).await
    }

    async fn add_references_if_necessary(
        &self,
        container: &mut RetrieveQueue,
        elements: &[RetrieveRequestToQueue],
        agent_ref: &AgentReference,
        backend: &dyn Backend,
    ) -> Result<(), ObjectError> {
        if let Some(size) = self.max_shard_size {
            container.set_max_shard_size(size);
        }
        let jobs = elements.iter().map(|e| e.job.clone()).collect();
        container
            .add_jobs_if_necessary_and_commit(jobs, agent_ref, backend)
            .await
    }

    async fn remove_references(
        &self,
        container: &mut RetrieveQueue,
        keys: &[JobKey],
        backend: &dyn Backend,
    ) -> Result<(), ObjectError> {
        container.remove_jobs_and_commit(keys, backend).await
    }

    async fn candidates(
        &self,
        container: &RetrieveQueue,
        remaining: &PopCriteria,
        skip: &HashSet<JobKey>,
        backend: &dyn Backend,
    ) -> Result<Vec<QueueJobRef>, ObjectError> {
        Ok(container
            .candidate_list(remaining.bytes, remaining.files, skip, backend)
            .await?
            .candidates)
    }

    async fn switch_inserted_ownership(
        &self,
        elements: &[RetrieveRequestToQueue],
        queue_address: &str,
        previous_owner: &str,
        backend: &dyn Backend,
    ) -> Vec<Result<OwnershipSwitch, ObjectError>> {
        join_all(elements.iter().map(|e| async move {
            RetrieveRequest::update_owner(
                backend,
                &e.job.address,
                queue_address,
                previous_owner,
                e.job.copy_nb,
                e.new_status,
            )
            .await?;
            Ok(OwnershipSwitch {
                still_owned_by_previous: false,
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
    ) -> Vec<Result<PoppedRetrieveRequest, ObjectError>> {
        join_all(candidates.iter().map(|job| async move {
            let request = RetrieveRequest::update_owner(
                backend,
                &job.address,
                agent_address,
                queue_address,
                job.copy_nb,
                None,
            )
            .await?;
            Ok(PoppedRetrieveRequest {
                job: job.clone(),
                request,
            })
        }))
        .await
    }
}
