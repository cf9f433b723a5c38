use std::collections::HashSet;

use async_trait::async_trait;
use futures::future::join_all;

use super::{ContainerSummary, ContainerTraits, JobKey, OwnershipSwitch, PopCriteria, PoppedSummary};
use crate::agent_reference::AgentReference;
use crate::backend::Backend;
use crate::objects::repack_request::RepackOwnerUpdate;
use crate::objects::{ObjectError, QueueKind, RepackQueue, RepackQueueData, RepackQueueType, RepackRequest};

#[derive(Debug, Clone)]
pub struct PoppedRepackRequest {
    pub address: String,
    pub request: RepackOwnerUpdate,
}

/// Repack queues are singletons per type: the container id is always empty
/// and pops are bounded by request count.
pub struct RepackQueueTraits {
    queue_type: RepackQueueType,
}

impl RepackQueueTraits {
    pub fn new(queue_type: RepackQueueType) -> Self {
        Self { queue_type }
    }
}

#[async_trait]
impl ContainerTraits for RepackQueueTraits {
    type Container = RepackQueueData;
    type InsertedElement = String;
    type Candidate = String;
    type PoppedElement = PoppedRepackRequest;

    fn queue_kind(&self) -> QueueKind {
        QueueKind::Repack(self.queue_type)
    }

    fn container_summary(&self, container: &RepackQueue) -> ContainerSummary {
        ContainerSummary {
            files: container.requests().len() as u64,
            bytes: 0,
        }
    }

    fn inserted_key(element: &String) -> JobKey {
        JobKey::new(element, 0)
    }

    fn candidate_key(candidate: &String) -> JobKey {
        JobKey::new(candidate, 0)
    }

    fn element_summary(_element: &PoppedRepackRequest) -> PoppedSummary {
        PoppedSummary { files: 1, bytes: 0 }
    }

    fn under_criteria(&self, popped: &PoppedSummary, criteria: &PopCriteria) -> bool {
        popped.files < criteria.files
    }

    async fn add_references(
        &self,
        container: &mut RepackQueue,
        elements: &[String],
        _agent_ref: &AgentReference,
        backend: &dyn Backend,
    ) -> Result<(), ObjectError> {
        container.add_requests_and_commit(elements, backend).await
    }

    async fn add_references_if_necessary(
        &self,
        container: &mut RepackQueue,
        elements: &[String],
        _agent_ref: &AgentReference,
        backend: &dyn Backend,
    ) -> Result<(), ObjectError> {
        container
            .add_requests_if_necessary_and_commit(elements, backend)
            .await
    }

    async fn remove_references(
        &self,
        container: &mut RepackQueue,
        keys: &[JobKey],
        backend: &dyn Backend,
    ) -> Result<(), ObjectError> {
        let addresses: Vec<String> = keys.iter().map(|k| k.address.clone()).collect();
        container.remove_requests_and_commit(&addresses, backend).await
    }

    async fn candidates(
        &self,
        container: &RepackQueue,
        remaining: &PopCriteria,
        skip: &HashSet<JobKey>,
        _backend: &dyn Backend,
    ) -> Result<Vec<String>, ObjectError> {
        let skip: HashSet<String> = skip.iter().map(|k| k.address.clone()).collect();
        Ok(container.candidate_list(remaining.files, &skip))
    }

    async fn switch_inserted_ownership(
        &self,
        elements: &[String],
        queue_address: &str,
        previous_owner: &str,
        backend: &dyn Backend,
    ) -> Vec<Result<OwnershipSwitch, ObjectError>> {
        join_all(elements.iter().map(|address| async move {
            RepackRequest::update_owner_and_status(backend, address, queue_address, previous_owner, None).await?;
            Ok(OwnershipSwitch {
                still_owned_by_previous: false,
            })
        }))
        .await
    }

    async fn switch_popped_ownership(
        &self,
        candidates: &[String],
        queue_address: &str,
        agent_address: &str,
        backend: &dyn Backend,
    ) -> Vec<Result<PoppedRepackRequest, ObjectError>> {
        join_all(candidates.iter().map(|address| async move {
            let request =
                RepackRequest::update_owner_and_status(backend, address, agent_address, queue_address, None).await?;
            Ok(PoppedRepackRequest {
                address: address.clone(),
                request,
            })
        }))
        .await
    }
}
