//! Retrieve request lifecycle.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Instant;

use tracing::{error, info, info_span, warn, Instrument};

use super::{OStoreDb, SchedulerDbError};
use crate::agent_reference::AgentReference;
use crate::algorithms::retrieve::{PoppedRetrieveRequest, RetrieveQueueTraits, RetrieveRequestToQueue};
use crate::algorithms::{ContainerAlgorithms, JobKey, PopCriteria, PoppedElementsBatch};
use crate::backend::Backend;
use crate::helpers::{select_best_retrieve_queue, QueueSelectionError, RetrieveQueueStatsCache};
use crate::mem_queue::MemQueue;
use crate::objects::job_queue::QueueJobRef;
use crate::objects::{
    ArchiveFile, JobQueueType, MountPolicy, ObjectError, QueueKind, RepackInfo, Requester, RetrieveJobStatus,
    RetrieveQueueData, RetrieveRequest, RetrieveRequestData,
};

/// Everything needed to create a retrieve request. The archive file lists
/// the tape copies the file can be read from.
#[derive(Debug, Clone, Default)]
pub struct RetrieveSubmission {
    pub archive_file: ArchiveFile,
    pub requester: Requester,
    pub mount_policy: MountPolicy,
    pub dst_url: String,
    pub error_report_url: String,
    pub is_verify_only: bool,
    pub repack: RepackInfo,
}

impl OStoreDb {
    fn retrieve_algorithms(&self, queue_type: JobQueueType) -> ContainerAlgorithms<RetrieveQueueTraits> {
        ContainerAlgorithms::new(
            self.backend.clone(),
            self.agent_ref.clone(),
            RetrieveQueueTraits::new(queue_type).with_max_shard_size(self.config.retrieve_shard_size as u64),
        )
    }

    /// Insert a retrieve request served from the best available tape and
    /// hand its queueing to the enqueue workers. Returns the request address.
    pub async fn queue_retrieve(&self, submission: RetrieveSubmission) -> Result<String, SchedulerDbError> {
        let archive_file_id = submission.archive_file.archive_file_id;
        if submission.archive_file.tape_files.is_empty() {
            return Err(SchedulerDbError::InvalidRequest(format!(
                "file {archive_file_id} has no copy on tape"
            )));
        }
        let started = Instant::now();
        let backend = self.backend.as_ref();
        let candidates: BTreeSet<String> = submission
            .archive_file
            .tape_files
            .iter()
            .map(|tf| tf.vid.clone())
            .collect();
        let vid = select_best_retrieve_queue(
            &candidates,
            self.catalogue.as_ref(),
            &self.stats_cache,
            backend,
            submission.repack.is_repack,
        )
        .await?;
        let copy_nb = submission
            .archive_file
            .tape_files
            .iter()
            .find(|tf| tf.vid == vid)
            .map(|tf| tf.copy_nb)
            .ok_or_else(|| SchedulerDbError::InvalidRequest(format!("no copy of file {archive_file_id} on {vid}")))?;
        let copies: Vec<u32> = submission.archive_file.tape_files.iter().map(|tf| tf.copy_nb).collect();

        let address = self.agent_ref.next_id("RetrieveRequest");
        let mut data = RetrieveRequestData::new(
            submission.archive_file,
            submission.requester,
            submission.mount_policy,
            &submission.dst_url,
            chrono::Utc::now().timestamp(),
        );
        data.error_report_url = submission.error_report_url;
        data.is_verify_only = submission.is_verify_only;
        let mut request = RetrieveRequest::new(address.clone(), data);
        request.set_repack_info(submission.repack);
        for copy in copies {
            request.add_job(copy, self.config.retry_limits);
        }
        request.set_active_copy_nb(copy_nb);
        request.set_owner(self.agent_ref.address());
        let job = request.queue_job_ref(copy_nb);

        self.agent_ref.add_to_ownership(&address, backend).await?;
        request.insert(backend).await?;
        let inserted_ms = started.elapsed().as_millis() as u64;

        let span = info_span!("retrieve_bottom_half", request = %address, vid = %vid);
        let task = retrieve_bottom_half(
            self.backend.clone(),
            self.agent_ref.clone(),
            self.retrieve_mem_queue.clone(),
            self.stats_cache.clone(),
            address.clone(),
            vid.clone(),
            job,
        )
        .instrument(span);
        if !self.workers.submit(task).await {
            error!(request = %address, "enqueue workers are shut down, request left in agent ownership");
            return Err(SchedulerDbError::PoolClosed);
        }
        info!(
            request = %address,
            archive_file_id,
            vid = %vid,
            copy_nb,
            inserted_ms,
            submitted_ms = started.elapsed().as_millis() as u64,
            "retrieve request inserted"
        );
        Ok(address)
    }

    /// Pop requests of `queue_type` for `container` into this agent's ownership.
    pub async fn pop_retrieve_requests(
        &self,
        queue_type: JobQueueType,
        container: &str,
        criteria: PopCriteria,
    ) -> Result<PoppedElementsBatch<PoppedRetrieveRequest>, SchedulerDbError> {
        let batch = self
            .retrieve_algorithms(queue_type)
            .pop_next_batch(container, criteria)
            .await?;
        for failure in &batch.unexpected_failures {
            error!(
                container,
                queue_type = queue_type.name(),
                request = %failure.address,
                error = %failure.error,
                "retrieve request could not be popped and stays queued"
            );
        }
        if queue_type == JobQueueType::JobsToTransferForUser && !batch.elements.is_empty() {
            self.stats_cache.invalidate(container);
        }
        info!(
            container,
            queue_type = queue_type.name(),
            files = batch.summary.files,
            bytes = batch.summary.bytes,
            "popped retrieve requests"
        );
        Ok(batch)
    }

    /// Next requests to read from tape `vid`.
    pub async fn get_next_retrieve_jobs(
        &self,
        vid: &str,
        max_files: u64,
        max_bytes: u64,
    ) -> Result<PoppedElementsBatch<PoppedRetrieveRequest>, SchedulerDbError> {
        self.pop_retrieve_requests(
            JobQueueType::JobsToTransferForUser,
            vid,
            PopCriteria::new(max_files, max_bytes),
        )
        .await
    }

    fn ensure_retrieve_request_owned(&self, request: &RetrieveRequest) -> Result<(), ObjectError> {
        if request.owner() != self.agent_ref.address() {
            return Err(ObjectError::WrongPreviousOwner {
                address: request.address().to_string(),
                expected: self.agent_ref.address().to_string(),
                found: request.owner().to_string(),
            });
        }
        Ok(())
    }

    /// Queue type, container and serving copy for a request about to be
    /// requeued. Transfers go to the best tape still holding a copy to read;
    /// with no usable tape the request stays on its active copy's tape.
    async fn retrieve_destination(
        &self,
        request: &RetrieveRequest,
    ) -> Result<(JobQueueType, String, u32), SchedulerDbError> {
        if request.queue_type() == JobQueueType::JobsToTransferForUser {
            let candidates: BTreeSet<String> = request
                .jobs()
                .iter()
                .filter(|j| j.status == RetrieveJobStatus::ToTransfer)
                .filter_map(|j| request.archive_file().tape_file(j.copy_nb).map(|tf| tf.vid.clone()))
                .collect();
            match select_best_retrieve_queue(
                &candidates,
                self.catalogue.as_ref(),
                &self.stats_cache,
                self.backend.as_ref(),
                request.repack_info().is_repack,
            )
            .await
            {
                Ok(vid) => {
                    if let Some(tf) = request.archive_file().tape_files.iter().find(|tf| tf.vid == vid) {
                        return Ok((JobQueueType::JobsToTransferForUser, vid, tf.copy_nb));
                    }
                }
                Err(QueueSelectionError::NoTapeAvailable(vids)) => {
                    warn!(request = %request.address(), ?vids, "no tape available, keeping the active copy");
                }
                Err(e) => return Err(e.into()),
            }
        }
        let (queue_type, container) = request.queue_type_and_vid()?;
        Ok((queue_type, container, request.active_copy_nb()))
    }

    /// Commit the locked `request` and reference it from `destination`, or
    /// from the queue its job statuses imply. Returns the queue address.
    async fn requeue_retrieve_request(
        &self,
        mut request: RetrieveRequest,
        destination: Option<(JobQueueType, String, u32)>,
    ) -> Result<String, SchedulerDbError> {
        let address = request.address().to_string();
        request.commit(self.backend.as_ref()).await?;
        // queues are locked before requests
        request.release();
        let (queue_type, container, copy_nb) = match destination {
            Some(destination) => destination,
            None => self.retrieve_destination(&request).await?,
        };
        let element = RetrieveRequestToQueue {
            job: request.queue_job_ref(copy_nb),
            new_status: None,
        };
        let queue = self
            .retrieve_algorithms(queue_type)
            .reference_and_switch_ownership(&container, self.agent_ref.address(), vec![element])
            .await?;
        info!(request = %address, copy_nb, queue = %queue, queue_type = queue_type.name(), "requeued retrieve request");
        Ok(queue)
    }

    /// The file was read. User requests are done and deleted; repack
    /// requests wait for the repack to account them.
    pub async fn report_retrieve_success(&self, job: &PoppedRetrieveRequest) -> Result<(), SchedulerDbError> {
        let backend = self.backend.as_ref();
        let address = job.job.address.as_str();
        let mut request = RetrieveRequest::lock_and_fetch(backend, address).await?;
        self.ensure_retrieve_request_owned(&request)?;
        if request.repack_info().is_repack {
            request.set_job_status(job.job.copy_nb, RetrieveJobStatus::ToReportToRepackForSuccess)?;
            let destination = (
                JobQueueType::JobsToReportToRepackForSuccess,
                request.repack_info().repack_request_address.clone(),
                job.job.copy_nb,
            );
            self.requeue_retrieve_request(request, Some(destination)).await?;
            return Ok(());
        }
        request.remove(backend).await?;
        self.agent_ref.remove_from_ownership(address, backend).await?;
        info!(request = %address, copy_nb = job.job.copy_nb, "retrieve request complete, deleted");
        Ok(())
    }

    /// Account a failed read and requeue the request, possibly on another
    /// tape. Returns the new status of the failed copy.
    pub async fn report_retrieve_failure(
        &self,
        job: &PoppedRetrieveRequest,
        mount_id: u64,
        reason: &str,
    ) -> Result<RetrieveJobStatus, SchedulerDbError> {
        let copy_nb = job.job.copy_nb;
        let mut request = RetrieveRequest::lock_and_fetch(self.backend.as_ref(), &job.job.address).await?;
        self.ensure_retrieve_request_owned(&request)?;
        let step = request.add_transfer_failure(copy_nb, mount_id, reason)?;
        request.set_job_status(copy_nb, step.next_status)?;
        warn!(
            request = %job.job.address,
            copy_nb,
            mount_id,
            reason,
            next_status = ?step.next_status,
            next_step = ?step.next_step,
            "retrieve transfer failed"
        );
        self.requeue_retrieve_request(request, None).await?;
        Ok(step.next_status)
    }

    /// The report of a request popped from a report queue was delivered.
    /// User failure reports end in the failed queue, repack reports delete
    /// the request.
    pub async fn report_retrieve_job_reported(&self, job: &PoppedRetrieveRequest) -> Result<(), SchedulerDbError> {
        let backend = self.backend.as_ref();
        let address = job.job.address.as_str();
        let copy_nb = job.job.copy_nb;
        let mut request = RetrieveRequest::lock_and_fetch(backend, address).await?;
        self.ensure_retrieve_request_owned(&request)?;
        let status = request
            .job(copy_nb)
            .map(|j| j.status)
            .ok_or_else(|| ObjectError::NoSuchJob {
                address: address.to_string(),
                copy_nb,
            })?;
        match status {
            RetrieveJobStatus::ToReportToUserForFailure => {
                request.set_job_status(copy_nb, RetrieveJobStatus::Failed)?;
                self.requeue_retrieve_request(request, None).await?;
            }
            RetrieveJobStatus::ToReportToRepackForSuccess | RetrieveJobStatus::ToReportToRepackForFailure => {
                request.remove(backend).await?;
                self.agent_ref.remove_from_ownership(address, backend).await?;
                info!(request = %address, copy_nb, "repack retrieve reported, deleted");
            }
            other => {
                return Err(SchedulerDbError::InvalidRequest(format!(
                    "copy {copy_nb} of {address} is not waiting for a report ({other:?})"
                )))
            }
        }
        Ok(())
    }

    /// Cancel the retrieve of file `archive_file_id` requested at `address`:
    /// dereference it from its queue and delete it. Returns false when there
    /// was no such request.
    pub async fn cancel_retrieve(&self, address: &str, archive_file_id: u64) -> Result<bool, SchedulerDbError> {
        let backend = self.backend.as_ref();
        let mut request = match RetrieveRequest::lock_and_fetch(backend, address).await {
            Ok(request) => request,
            Err(e) if e.is_no_such_object() => {
                warn!(request = %address, archive_file_id, "no such retrieve request to cancel");
                return Ok(false);
            }
            Err(e) => return Err(e.into()),
        };
        if request.archive_file().archive_file_id != archive_file_id {
            return Err(SchedulerDbError::InvalidRequest(format!(
                "retrieve request {address} is for file {}, not {archive_file_id}",
                request.archive_file().archive_file_id
            )));
        }
        self.agent_ref.add_to_ownership(address, backend).await?;
        let previous_owner = request.owner().to_string();
        // the queue may hold any copy of the request
        let keys: Vec<JobKey> = request
            .jobs()
            .iter()
            .map(|j| JobKey::new(address, j.copy_nb))
            .collect();
        request.set_cancelled();
        request.set_owner(self.agent_ref.address());
        request.commit(backend).await?;
        request.release();

        if !previous_owner.is_empty()
            && previous_owner != self.agent_ref.address()
            && self
                .dereference_from_job_queue::<RetrieveQueueData>(&previous_owner, &keys)
                .await?
        {
            info!(request = %address, queue = %previous_owner, "dereferenced cancelled retrieve request");
        }
        match RetrieveRequest::lock_and_fetch(backend, address).await {
            Ok(request) => request.remove(backend).await?,
            Err(e) if e.is_no_such_object() => {}
            Err(e) => return Err(e.into()),
        }
        self.agent_ref.remove_from_ownership(address, backend).await?;
        info!(request = %address, archive_file_id, "retrieve request cancelled");
        Ok(true)
    }
}

/// Queue a freshly inserted request on `vid`, then release it from the
/// agent. On failure the request stays owned by the agent.
async fn retrieve_bottom_half(
    backend: Arc<dyn Backend>,
    agent_ref: Arc<AgentReference>,
    mem_queue: Arc<MemQueue<RetrieveQueueData>>,
    stats_cache: Arc<RetrieveQueueStatsCache>,
    address: String,
    vid: String,
    job: QueueJobRef,
) {
    let started = Instant::now();
    let copy_nb = job.copy_nb;
    let queued = async {
        let queue = mem_queue
            .share_lock_and_queue(
                QueueKind::Retrieve(JobQueueType::JobsToTransferForUser),
                &vid,
                job,
                &agent_ref,
                backend.as_ref(),
            )
            .await?;
        RetrieveRequest::update_owner(
            backend.as_ref(),
            &address,
            queue.address(),
            agent_ref.address(),
            copy_nb,
            None,
        )
        .await?;
        let summary = queue.summary();
        stats_cache.update(&vid, summary.jobs, summary.bytes, summary.priority);
        Ok::<_, ObjectError>(queue.address().to_string())
    }
    .await;
    match queued {
        Ok(queue) => info!(request = %address, vid = %vid, copy_nb, queue = %queue, "retrieve request queued"),
        Err(e) => {
            error!(request = %address, vid = %vid, error = %e, "failed to queue retrieve request, request left in agent ownership");
            return;
        }
    }
    if let Err(e) = agent_ref.remove_from_ownership(&address, backend.as_ref()).await {
        error!(request = %address, error = %e, "failed to remove queued retrieve request from agent ownership");
        return;
    }
    info!(request = %address, elapsed_ms = started.elapsed().as_millis() as u64, "retrieve request done queueing");
}
