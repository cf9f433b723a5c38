//! Archive request lifecycle.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::Instant;

use tracing::{error, info, info_span, warn, Instrument};

use super::{OStoreDb, SchedulerDbError};
use crate::agent_reference::AgentReference;
use crate::algorithms::archive::{ArchiveJobToQueue, ArchiveQueueTraits, PoppedArchiveJob};
use crate::algorithms::{ContainerAlgorithms, JobKey, PopCriteria, PoppedElementsBatch};
use crate::backend::Backend;
use crate::catalogue::TapeFileWritten;
use crate::mem_queue::MemQueue;
use crate::objects::job_queue::QueueJobRef;
use crate::objects::{
    ArchiveFile, ArchiveJobStatus, ArchiveQueueData, ArchiveRequest, ArchiveRequestData, JobQueueType, MountPolicy,
    ObjectError, QueueKind, RepackInfo, Requester,
};

/// Everything needed to create an archive request.
#[derive(Debug, Clone, Default)]
pub struct ArchiveSubmission {
    pub archive_file: ArchiveFile,
    pub requester: Requester,
    pub mount_policy: MountPolicy,
    pub src_url: String,
    pub report_url: String,
    pub error_report_url: String,
    /// (copy number, tape pool) of every copy to write.
    pub copies: Vec<(u32, String)>,
    pub repack: RepackInfo,
}

/// Every job is done and nothing references the request any more.
fn fully_done(request: &ArchiveRequest) -> bool {
    request
        .jobs()
        .iter()
        .all(|j| matches!(j.status, ArchiveJobStatus::Complete | ArchiveJobStatus::Abandoned))
}

impl OStoreDb {
    fn archive_algorithms(&self, queue_type: JobQueueType) -> ContainerAlgorithms<ArchiveQueueTraits> {
        ContainerAlgorithms::new(
            self.backend.clone(),
            self.agent_ref.clone(),
            ArchiveQueueTraits::new(queue_type).with_max_shard_size(self.config.archive_shard_size as u64),
        )
    }

    /// Insert a new archive request owned by this agent and hand its queueing
    /// to the enqueue workers. Returns the request address once the request
    /// is durable; the jobs show up in their queues later.
    pub async fn queue_archive(&self, submission: ArchiveSubmission) -> Result<String, SchedulerDbError> {
        if submission.copies.is_empty() {
            return Err(SchedulerDbError::InvalidRequest(format!(
                "archive of file {} requests no copy",
                submission.archive_file.archive_file_id
            )));
        }
        let mut copy_numbers = HashSet::new();
        if let Some((copy_nb, _)) = submission.copies.iter().find(|(c, _)| !copy_numbers.insert(*c)) {
            return Err(SchedulerDbError::InvalidRequest(format!(
                "copy {copy_nb} requested twice for file {}",
                submission.archive_file.archive_file_id
            )));
        }

        let started = Instant::now();
        let backend = self.backend.as_ref();
        let address = self.agent_ref.next_id("ArchiveRequest");
        let archive_file_id = submission.archive_file.archive_file_id;
        let mut request = ArchiveRequest::new(
            address.clone(),
            ArchiveRequestData::new(
                submission.archive_file,
                submission.requester,
                submission.mount_policy,
                &submission.src_url,
                chrono::Utc::now().timestamp(),
            ),
        );
        request.set_report_urls(&submission.report_url, &submission.error_report_url);
        request.set_repack_info(submission.repack);
        for (copy_nb, tape_pool) in &submission.copies {
            request.add_job(*copy_nb, tape_pool, self.agent_ref.address(), self.config.retry_limits);
        }
        request.set_owner(self.agent_ref.address());
        let mut jobs = Vec::with_capacity(submission.copies.len());
        for (copy_nb, _) in &submission.copies {
            if let Some((container, queue_type)) = request.queue_target(*copy_nb)? {
                jobs.push((container, queue_type, request.queue_job_ref(*copy_nb)));
            }
        }

        self.agent_ref.add_to_ownership(&address, backend).await?;
        request.insert(backend).await?;
        let inserted_ms = started.elapsed().as_millis() as u64;

        let span = info_span!("archive_bottom_half", request = %address);
        let task = archive_bottom_half(
            self.backend.clone(),
            self.agent_ref.clone(),
            self.archive_mem_queue.clone(),
            address.clone(),
            jobs,
        )
        .instrument(span);
        if !self.workers.submit(task).await {
            error!(request = %address, "enqueue workers are shut down, request left in agent ownership");
            return Err(SchedulerDbError::PoolClosed);
        }
        info!(
            request = %address,
            archive_file_id,
            copies = submission.copies.len(),
            inserted_ms,
            submitted_ms = started.elapsed().as_millis() as u64,
            "archive request inserted"
        );
        Ok(address)
    }

    /// Pop jobs of `queue_type` for `container` into this agent's ownership.
    pub async fn pop_archive_jobs(
        &self,
        queue_type: JobQueueType,
        container: &str,
        criteria: PopCriteria,
    ) -> Result<PoppedElementsBatch<PoppedArchiveJob>, SchedulerDbError> {
        let batch = self
            .archive_algorithms(queue_type)
            .pop_next_batch(container, criteria)
            .await?;
        for failure in &batch.unexpected_failures {
            error!(
                container,
                queue_type = queue_type.name(),
                job = %failure.address,
                error = %failure.error,
                "archive job could not be popped and stays queued"
            );
        }
        info!(
            container,
            queue_type = queue_type.name(),
            files = batch.summary.files,
            bytes = batch.summary.bytes,
            "popped archive jobs"
        );
        Ok(batch)
    }

    /// Next jobs to write to a tape of `tape_pool`.
    pub async fn get_next_archive_jobs(
        &self,
        tape_pool: &str,
        max_files: u64,
        max_bytes: u64,
    ) -> Result<PoppedElementsBatch<PoppedArchiveJob>, SchedulerDbError> {
        self.pop_archive_jobs(
            JobQueueType::JobsToTransferForUser,
            tape_pool,
            PopCriteria::new(max_files, max_bytes),
        )
        .await
    }

    /// Up to `max_jobs` jobs waiting for a user report, across tape pools.
    pub async fn get_next_archive_jobs_to_report(
        &self,
        max_jobs: u64,
    ) -> Result<Vec<PoppedArchiveJob>, SchedulerDbError> {
        let mut jobs = Vec::new();
        let kind = QueueKind::Archive(JobQueueType::JobsToReportToUser);
        for (tape_pool, _) in self.queues_of_kind(kind).await? {
            let remaining = max_jobs.saturating_sub(jobs.len() as u64);
            if remaining == 0 {
                break;
            }
            let batch = self
                .pop_archive_jobs(
                    JobQueueType::JobsToReportToUser,
                    &tape_pool,
                    PopCriteria::new(remaining, u64::MAX),
                )
                .await?;
            jobs.extend(batch.elements);
        }
        Ok(jobs)
    }

    fn ensure_archive_job_owned(&self, request: &ArchiveRequest, copy_nb: u32) -> Result<(), ObjectError> {
        let owner = request.job_owner(copy_nb)?;
        if owner != self.agent_ref.address() {
            return Err(ObjectError::WrongPreviousOwner {
                address: request.address().to_string(),
                expected: self.agent_ref.address().to_string(),
                found: owner.to_string(),
            });
        }
        Ok(())
    }

    /// Commit the locked `request` and move job `copy_nb` to the queue its
    /// status implies. A job with a terminal status leaves the agent instead.
    /// Returns the queue address, if any.
    async fn requeue_archive_job(
        &self,
        mut request: ArchiveRequest,
        copy_nb: u32,
    ) -> Result<Option<String>, SchedulerDbError> {
        let backend = self.backend.as_ref();
        let address = request.address().to_string();
        match request.queue_target(copy_nb)? {
            None => {
                request.set_job_owner(copy_nb, "")?;
                let still_owned = request.jobs().iter().any(|j| j.owner == self.agent_ref.address());
                request.commit(backend).await?;
                request.release();
                if !still_owned {
                    self.agent_ref.remove_from_ownership(&address, backend).await?;
                }
                Ok(None)
            }
            Some((container, queue_type)) => {
                let element = ArchiveJobToQueue {
                    job: request.queue_job_ref(copy_nb),
                    new_status: None,
                };
                request.commit(backend).await?;
                // queues are locked before requests
                request.release();
                let queue = self
                    .archive_algorithms(queue_type)
                    .reference_and_switch_ownership(&container, self.agent_ref.address(), vec![element])
                    .await?;
                info!(request = %address, copy_nb, queue = %queue, queue_type = queue_type.name(), "requeued archive job");
                Ok(Some(queue))
            }
        }
    }

    /// Record a copy written at `fseq` on `vid`. The job then waits for its
    /// success report, or the request is deleted once every copy is done.
    pub async fn report_archive_success(
        &self,
        job: &PoppedArchiveJob,
        vid: &str,
        fseq: u64,
    ) -> Result<(), SchedulerDbError> {
        let backend = self.backend.as_ref();
        let address = job.job.address.as_str();
        let copy_nb = job.job.copy_nb;
        self.catalogue
            .file_written_to_tape(TapeFileWritten {
                archive_file_id: job.request.archive_file.archive_file_id,
                copy_nb,
                vid: vid.to_string(),
                fseq,
                size: job.request.archive_file.size,
            })
            .await?;

        let mut request = ArchiveRequest::lock_and_fetch(backend, address).await?;
        self.ensure_archive_job_owned(&request, copy_nb)?;
        let reports_success = request.transfer_successful(copy_nb, vid)?;
        if fully_done(&request) {
            request.remove(backend).await?;
            self.agent_ref.remove_from_ownership(address, backend).await?;
            info!(request = %address, copy_nb, vid, "archive request complete, deleted");
            return Ok(());
        }
        info!(request = %address, copy_nb, vid, fseq, reports_success, "archive copy written");
        self.requeue_archive_job(request, copy_nb).await?;
        Ok(())
    }

    /// Account a failed transfer and requeue the job for retry, report or
    /// the failed container. Returns the job's new status.
    pub async fn report_archive_failure(
        &self,
        job: &PoppedArchiveJob,
        mount_id: u64,
        reason: &str,
    ) -> Result<ArchiveJobStatus, SchedulerDbError> {
        let copy_nb = job.job.copy_nb;
        let mut request = ArchiveRequest::lock_and_fetch(self.backend.as_ref(), &job.job.address).await?;
        self.ensure_archive_job_owned(&request, copy_nb)?;
        let step = request.add_transfer_failure(copy_nb, mount_id, reason)?;
        request.set_job_status(copy_nb, step.next_status)?;
        warn!(
            request = %job.job.address,
            copy_nb,
            mount_id,
            reason,
            next_status = ?step.next_status,
            next_step = ?step.next_step,
            "archive transfer failed"
        );
        self.requeue_archive_job(request, copy_nb).await?;
        Ok(step.next_status)
    }

    /// The report of a job popped from a report queue was delivered.
    pub async fn report_archive_job_reported(&self, job: &PoppedArchiveJob) -> Result<(), SchedulerDbError> {
        let backend = self.backend.as_ref();
        let address = job.job.address.as_str();
        let copy_nb = job.job.copy_nb;
        let mut request = ArchiveRequest::lock_and_fetch(backend, address).await?;
        self.ensure_archive_job_owned(&request, copy_nb)?;
        let status = request
            .job(copy_nb)
            .map(|j| j.status)
            .ok_or_else(|| ObjectError::NoSuchJob {
                address: address.to_string(),
                copy_nb,
            })?;
        let next_status = match status {
            ArchiveJobStatus::ToReportToUserForTransfer => ArchiveJobStatus::Complete,
            ArchiveJobStatus::ToReportToUserForFailure => ArchiveJobStatus::Failed,
            other => {
                return Err(SchedulerDbError::InvalidRequest(format!(
                    "job {copy_nb} of {address} is not waiting for a report ({other:?})"
                )))
            }
        };
        request.set_job_status(copy_nb, next_status)?;
        if fully_done(&request) {
            request.remove(backend).await?;
            self.agent_ref.remove_from_ownership(address, backend).await?;
            info!(request = %address, copy_nb, "archive request reported, deleted");
            return Ok(());
        }
        self.requeue_archive_job(request, copy_nb).await?;
        Ok(())
    }

    /// Account a failed report and requeue the job for another attempt or
    /// the failed container.
    pub async fn report_archive_report_failure(
        &self,
        job: &PoppedArchiveJob,
        reason: &str,
    ) -> Result<ArchiveJobStatus, SchedulerDbError> {
        let copy_nb = job.job.copy_nb;
        let mut request = ArchiveRequest::lock_and_fetch(self.backend.as_ref(), &job.job.address).await?;
        self.ensure_archive_job_owned(&request, copy_nb)?;
        let step = request.add_report_failure(copy_nb, reason)?;
        request.set_job_status(copy_nb, step.next_status)?;
        warn!(request = %job.job.address, copy_nb, reason, next_status = ?step.next_status, "archive report failed");
        self.requeue_archive_job(request, copy_nb).await?;
        Ok(step.next_status)
    }

    /// Cancel the archive of file `archive_file_id` requested at `address`.
    /// Every job is abandoned and dereferenced from its queue, then the
    /// request is deleted. Returns false when there was no such request.
    pub async fn cancel_archive(&self, address: &str, archive_file_id: u64) -> Result<bool, SchedulerDbError> {
        let backend = self.backend.as_ref();
        let mut request = match ArchiveRequest::lock_and_fetch(backend, address).await {
            Ok(request) => request,
            Err(e) if e.is_no_such_object() => {
                warn!(request = %address, archive_file_id, "no such archive request to cancel");
                return Ok(false);
            }
            Err(e) => return Err(e.into()),
        };
        if request.archive_file().archive_file_id != archive_file_id {
            return Err(SchedulerDbError::InvalidRequest(format!(
                "archive request {address} is for file {}, not {archive_file_id}",
                request.archive_file().archive_file_id
            )));
        }
        // from here a crash leaves the request to our garbage collection
        self.agent_ref.add_to_ownership(address, backend).await?;
        let mut by_owner: BTreeMap<String, Vec<JobKey>> = BTreeMap::new();
        let copies: Vec<u32> = request.jobs().iter().map(|j| j.copy_nb).collect();
        for copy_nb in copies {
            let owner = request.job_owner(copy_nb)?.to_string();
            if !owner.is_empty() && owner != self.agent_ref.address() {
                by_owner.entry(owner).or_default().push(JobKey::new(address, copy_nb));
            }
            request.set_job_status(copy_nb, ArchiveJobStatus::Abandoned)?;
            request.set_job_owner(copy_nb, self.agent_ref.address())?;
        }
        request.commit(backend).await?;
        request.release();

        for (owner, keys) in &by_owner {
            if self
                .dereference_from_job_queue::<ArchiveQueueData>(owner, keys)
                .await?
            {
                info!(request = %address, queue = %owner, jobs = keys.len(), "dereferenced cancelled archive jobs");
            }
        }
        match ArchiveRequest::lock_and_fetch(backend, address).await {
            Ok(request) => request.remove(backend).await?,
            Err(e) if e.is_no_such_object() => {}
            Err(e) => return Err(e.into()),
        }
        self.agent_ref.remove_from_ownership(address, backend).await?;
        info!(request = %address, archive_file_id, "archive request cancelled");
        Ok(true)
    }
}

/// Queue every job of a freshly inserted request, then release it from the
/// agent. On failure the request stays owned by the agent.
async fn archive_bottom_half(
    backend: Arc<dyn Backend>,
    agent_ref: Arc<AgentReference>,
    mem_queue: Arc<MemQueue<ArchiveQueueData>>,
    address: String,
    jobs: Vec<(String, JobQueueType, QueueJobRef)>,
) {
    let started = Instant::now();
    for (tape_pool, queue_type, job) in jobs {
        let copy_nb = job.copy_nb;
        let queued = async {
            let queue = mem_queue
                .share_lock_and_queue(QueueKind::Archive(queue_type), &tape_pool, job, &agent_ref, backend.as_ref())
                .await?;
            ArchiveRequest::update_job_owner(
                backend.as_ref(),
                &address,
                copy_nb,
                queue.address(),
                agent_ref.address(),
                None,
            )
            .await?;
            Ok::<_, ObjectError>(queue.address().to_string())
        }
        .await;
        match queued {
            Ok(queue) => info!(request = %address, copy_nb, tape_pool = %tape_pool, queue = %queue, "archive job queued"),
            Err(e) => {
                error!(request = %address, copy_nb, tape_pool = %tape_pool, error = %e, "failed to queue archive job, request left in agent ownership");
                return;
            }
        }
    }
    if let Err(e) = agent_ref.remove_from_ownership(&address, backend.as_ref()).await {
        error!(request = %address, error = %e, "failed to remove queued archive request from agent ownership");
        return;
    }
    info!(request = %address, elapsed_ms = started.elapsed().as_millis() as u64, "archive request queued");
}
