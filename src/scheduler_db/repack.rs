//! Repack request queues.

use tracing::{debug, info, warn};

use super::{OStoreDb, SchedulerDbError};
use crate::algorithms::repack::{PoppedRepackRequest, RepackQueueTraits};
use crate::algorithms::{ContainerAlgorithms, PopCriteria};
use crate::helpers::trim_queue_if_needed;
use crate::objects::{
    Agent, ObjectError, QueueKind, RepackQueue, RepackQueueType, RepackRequest, RepackRequestData, RepackStatus,
};

impl OStoreDb {
    fn repack_algorithms(&self, queue_type: RepackQueueType) -> ContainerAlgorithms<RepackQueueTraits> {
        ContainerAlgorithms::new(
            self.backend.clone(),
            self.agent_ref.clone(),
            RepackQueueTraits::new(queue_type),
        )
    }

    /// Create a repack request for `vid` and reference it from the pending
    /// repack queue. Returns the request address.
    pub async fn queue_repack(&self, vid: &str, buffer_url: &str) -> Result<String, SchedulerDbError> {
        if vid.is_empty() {
            return Err(SchedulerDbError::InvalidRequest("repack of an empty VID".to_string()));
        }
        let backend = self.backend.as_ref();
        let address = self.agent_ref.next_id("RepackRequest");
        let mut request = RepackRequest::new(
            address.clone(),
            RepackRequestData::new(vid, buffer_url, chrono::Utc::now().timestamp()),
        );
        request.set_owner(self.agent_ref.address());
        self.agent_ref.add_to_ownership(&address, backend).await?;
        request.insert(backend).await?;
        let queue = self
            .repack_algorithms(RepackQueueType::Pending)
            .reference_and_switch_ownership("", self.agent_ref.address(), vec![address.clone()])
            .await?;
        info!(request = %address, vid, queue = %queue, "repack request queued");
        Ok(address)
    }

    /// Pop up to `count` pending repack requests into this agent's ownership.
    pub async fn get_next_repack_requests(&self, count: u64) -> Result<Vec<PoppedRepackRequest>, SchedulerDbError> {
        let batch = self
            .repack_algorithms(RepackQueueType::Pending)
            .pop_next_batch("", PopCriteria::new(count, 0))
            .await?;
        for failure in &batch.unexpected_failures {
            warn!(request = %failure.address, error = %failure.error, "pending repack request could not be popped");
        }
        Ok(batch.elements)
    }

    /// Move up to `count` pending repack requests to the queue of requests to
    /// expand. Returns the promoted request addresses.
    pub async fn promote_repack_requests_to_expand(&self, count: u64) -> Result<Vec<String>, SchedulerDbError> {
        let backend = self.backend.as_ref();
        let popped = self.get_next_repack_requests(count).await?;
        if popped.is_empty() {
            return Ok(Vec::new());
        }
        let mut promoted = Vec::with_capacity(popped.len());
        for request in popped {
            RepackRequest::update(backend, &request.address, |r| {
                r.set_status(RepackStatus::ToExpand);
                Ok(())
            })
            .await?;
            promoted.push(request.address);
        }
        let queue = self
            .repack_algorithms(RepackQueueType::ToExpand)
            .reference_and_switch_ownership("", self.agent_ref.address(), promoted.clone())
            .await?;
        info!(requests = promoted.len(), queue = %queue, "promoted repack requests to expand");
        Ok(promoted)
    }

    /// Pop the next repack request waiting for expansion, if any.
    pub async fn get_next_repack_request_to_expand(&self) -> Result<Option<PoppedRepackRequest>, SchedulerDbError> {
        let batch = self
            .repack_algorithms(RepackQueueType::ToExpand)
            .pop_next_batch("", PopCriteria::new(1, 0))
            .await?;
        Ok(batch.elements.into_iter().next())
    }

    /// Record the size of an expanded repack owned by this agent.
    pub async fn start_repack_expansion(
        &self,
        address: &str,
        files_to_retrieve: u64,
        files_to_archive: u64,
    ) -> Result<RepackStatus, SchedulerDbError> {
        let agent = self.agent_ref.address();
        let status = RepackRequest::update(self.backend.as_ref(), address, |request| {
            if request.owner() != agent {
                return Err(ObjectError::WrongPreviousOwner {
                    address: address.to_string(),
                    expected: agent.to_string(),
                    found: request.owner().to_string(),
                });
            }
            request.start_expansion(files_to_retrieve, files_to_archive);
            request.finish_expansion();
            Ok(request.status())
        })
        .await?;
        info!(request = %address, files_to_retrieve, files_to_archive, ?status, "repack expanded");
        Ok(status)
    }

    /// Account retrieve and archive results of an expanded repack. A repack
    /// reaching a final status leaves the agent ownership.
    pub async fn report_repack_progress(
        &self,
        address: &str,
        retrieved: (u64, u64),
        archived: (u64, u64),
    ) -> Result<RepackStatus, SchedulerDbError> {
        let backend = self.backend.as_ref();
        let status = RepackRequest::update(backend, address, |request| {
            request.report_retrieve_results(retrieved.0, retrieved.1);
            Ok(request.report_archive_results(archived.0, archived.1))
        })
        .await?;
        if matches!(status, RepackStatus::Complete | RepackStatus::Failed) {
            self.agent_ref.remove_from_ownership(address, backend).await?;
            info!(request = %address, ?status, "repack finished");
        }
        Ok(status)
    }

    /// Cancel the repack of `vid` requested at `address`. The request leaves
    /// whichever repack queue or agent holds it and is deleted. Returns false
    /// when there was no such request.
    pub async fn cancel_repack(&self, address: &str, vid: &str) -> Result<bool, SchedulerDbError> {
        let backend = self.backend.as_ref();
        let mut request = match RepackRequest::lock_and_fetch(backend, address).await {
            Ok(request) => request,
            Err(e) if e.is_no_such_object() => {
                warn!(request = %address, vid, "no such repack request to cancel");
                return Ok(false);
            }
            Err(e) => return Err(e.into()),
        };
        if request.vid() != vid {
            return Err(SchedulerDbError::InvalidRequest(format!(
                "repack request {address} is for {}, not {vid}",
                request.vid()
            )));
        }
        self.agent_ref.add_to_ownership(address, backend).await?;
        let previous_owner = request.owner().to_string();
        let previous_status = request.status();
        request.set_status(RepackStatus::Cancelled);
        request.set_owner(self.agent_ref.address());
        request.commit(backend).await?;
        request.release();

        if !previous_owner.is_empty() && previous_owner != self.agent_ref.address() {
            match RepackQueue::lock_and_fetch(backend, &previous_owner).await {
                Ok(mut queue) => {
                    queue
                        .remove_requests_and_commit(&[address.to_string()], backend)
                        .await?;
                    let now_empty = queue.is_empty();
                    queue.release();
                    if let (true, Some(queue_type)) = (now_empty, previous_status.queue_type()) {
                        trim_queue_if_needed(QueueKind::Repack(queue_type), "", backend).await?;
                    }
                    info!(request = %address, queue = %previous_owner, "dereferenced cancelled repack request");
                }
                Err(ObjectError::WrongType { .. }) => {
                    // held by an agent, expanding or reporting it
                    let result = Agent::update(backend, &previous_owner, |agent| {
                        agent.remove_from_ownership(address);
                        Ok(())
                    })
                    .await;
                    match result {
                        Err(e) if !e.is_no_such_object() && !matches!(e, ObjectError::WrongType { .. }) => {
                            return Err(e.into())
                        }
                        _ => {}
                    }
                }
                Err(e) if e.is_no_such_object() => {
                    debug!(request = %address, owner = %previous_owner, "previous owner is gone");
                }
                Err(e) => return Err(e.into()),
            }
        }
        match RepackRequest::lock_and_fetch(backend, address).await {
            Ok(request) => request.remove(backend).await?,
            Err(e) if e.is_no_such_object() => {}
            Err(e) => return Err(e.into()),
        }
        self.agent_ref.remove_from_ownership(address, backend).await?;
        info!(request = %address, vid, "repack request cancelled");
        Ok(true)
    }
}
