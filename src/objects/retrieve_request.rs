use std::collections::BTreeSet;

use rkyv::{Archive, Deserialize as RkyvDeserialize, Serialize as RkyvSerialize};
use tracing::{error, info, warn};

use super::archive_request::{EnqueueingNextStep, JobEvent, NextStep};
use super::job_queue::QueueJobRef;
use super::request_info::{ArchiveFile, MountPolicy, RepackInfo, Requester};
use super::{JobQueueType, Object, ObjectError, ObjectType};
use crate::algorithms::retrieve::RetrieveRequestToQueue;
use crate::backend::Backend;
use crate::garbage_collector::{GcContext, GcError};
use crate::helpers::{select_best_retrieve_queue, QueueSelectionError};
use crate::retry::{ReportRetry, RetryCounters, RetryLimits, TransferRetry};
use crate::sorter::{SortOutcome, Sorter};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Archive, RkyvSerialize, RkyvDeserialize)]
#[archive(check_bytes)]
pub enum RetrieveJobStatus {
    ToTransfer,
    ToReportToUserForFailure,
    ToReportToRepackForSuccess,
    ToReportToRepackForFailure,
    Failed,
}

impl RetrieveJobStatus {
    pub fn queue_type(&self) -> JobQueueType {
        match self {
            RetrieveJobStatus::ToTransfer => JobQueueType::JobsToTransferForUser,
            RetrieveJobStatus::ToReportToUserForFailure => JobQueueType::JobsToReportToUser,
            RetrieveJobStatus::ToReportToRepackForSuccess => JobQueueType::JobsToReportToRepackForSuccess,
            RetrieveJobStatus::ToReportToRepackForFailure => JobQueueType::JobsToReportToRepackForFailure,
            RetrieveJobStatus::Failed => JobQueueType::FailedJobs,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Archive, RkyvSerialize, RkyvDeserialize)]
#[archive(check_bytes)]
pub struct RetrieveJob {
    pub copy_nb: u32,
    pub status: RetrieveJobStatus,
    pub retry: RetryCounters,
}

#[derive(Debug, Clone, PartialEq, Eq, Archive, RkyvSerialize, RkyvDeserialize)]
#[archive(check_bytes)]
pub struct RetrieveRequestData {
    /// Carries the tape files the request can be served from.
    pub archive_file: ArchiveFile,
    pub requester: Requester,
    pub mount_policy: MountPolicy,
    pub dst_url: String,
    pub error_report_url: String,
    pub creation_time: i64,
    /// Copy whose tape the request is currently queued on.
    pub active_copy_nb: u32,
    pub is_verify_only: bool,
    pub repack: RepackInfo,
    pub jobs: Vec<RetrieveJob>,
    /// Set by a cancellation about to delete the request.
    pub cancelled: bool,
}

object_payload!(RetrieveRequestData, ObjectType::RetrieveRequest);

pub type RetrieveRequest = Object<RetrieveRequestData>;

impl RetrieveRequestData {
    pub fn new(
        archive_file: ArchiveFile,
        requester: Requester,
        mount_policy: MountPolicy,
        dst_url: &str,
        creation_time: i64,
    ) -> Self {
        Self {
            archive_file,
            requester,
            mount_policy,
            dst_url: dst_url.to_string(),
            error_report_url: String::new(),
            creation_time,
            active_copy_nb: 0,
            is_verify_only: false,
            repack: RepackInfo::default(),
            jobs: Vec::new(),
            cancelled: false,
        }
    }

    fn job_mut(&mut self, copy_nb: u32, address: &str) -> Result<&mut RetrieveJob, ObjectError> {
        self.jobs
            .iter_mut()
            .find(|j| j.copy_nb == copy_nb)
            .ok_or_else(|| ObjectError::NoSuchJob {
                address: address.to_string(),
                copy_nb,
            })
    }
}

/// What a popper learns about a request while taking ownership of it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetrieveOwnerUpdate {
    pub archive_file: ArchiveFile,
    pub mount_policy: MountPolicy,
    pub dst_url: String,
    pub error_report_url: String,
    pub is_verify_only: bool,
    pub repack: RepackInfo,
    pub active_copy_nb: u32,
    pub job_status: Option<RetrieveJobStatus>,
}

impl Object<RetrieveRequestData> {
    pub fn archive_file(&self) -> &ArchiveFile {
        &self.payload().archive_file
    }

    pub fn repack_info(&self) -> &RepackInfo {
        &self.payload().repack
    }

    pub fn set_repack_info(&mut self, repack: RepackInfo) {
        self.payload_mut().repack = repack;
    }

    pub fn add_job(&mut self, copy_nb: u32, limits: RetryLimits) {
        self.payload_mut().jobs.push(RetrieveJob {
            copy_nb,
            status: RetrieveJobStatus::ToTransfer,
            retry: RetryCounters::new(limits),
        });
    }

    pub fn jobs(&self) -> &[RetrieveJob] {
        &self.payload().jobs
    }

    pub fn job(&self, copy_nb: u32) -> Option<&RetrieveJob> {
        self.payload().jobs.iter().find(|j| j.copy_nb == copy_nb)
    }

    pub fn set_job_status(&mut self, copy_nb: u32, status: RetrieveJobStatus) -> Result<(), ObjectError> {
        let address = self.address().to_string();
        self.payload_mut().job_mut(copy_nb, &address)?.status = status;
        Ok(())
    }

    pub fn is_cancelled(&self) -> bool {
        self.payload().cancelled
    }

    pub fn set_cancelled(&mut self) {
        self.payload_mut().cancelled = true;
    }

    pub fn active_copy_nb(&self) -> u32 {
        self.payload().active_copy_nb
    }

    pub fn set_active_copy_nb(&mut self, copy_nb: u32) {
        self.payload_mut().active_copy_nb = copy_nb;
    }

    /// Queue type for the request as a whole: any job to transfer wins, then
    /// repack reports, then user reports, else failed.
    pub fn queue_type(&self) -> JobQueueType {
        let mut has_to_report = false;
        for job in &self.payload().jobs {
            match job.status {
                RetrieveJobStatus::ToTransfer => return JobQueueType::JobsToTransferForUser,
                RetrieveJobStatus::ToReportToRepackForSuccess => {
                    return JobQueueType::JobsToReportToRepackForSuccess
                }
                RetrieveJobStatus::ToReportToRepackForFailure => {
                    return JobQueueType::JobsToReportToRepackForFailure
                }
                RetrieveJobStatus::ToReportToUserForFailure => has_to_report = true,
                RetrieveJobStatus::Failed => {}
            }
        }
        if has_to_report {
            JobQueueType::JobsToReportToUser
        } else {
            JobQueueType::FailedJobs
        }
    }

    /// Queue type and container key (VID, or repack request address for
    /// repack reports) for the active copy.
    pub fn queue_type_and_vid(&self) -> Result<(JobQueueType, String), ObjectError> {
        let queue_type = self.queue_type();
        let container = match queue_type {
            JobQueueType::JobsToReportToRepackForSuccess | JobQueueType::JobsToReportToRepackForFailure => {
                self.payload().repack.repack_request_address.clone()
            }
            _ => self.active_tape_vid()?,
        };
        Ok((queue_type, container))
    }

    fn active_tape_vid(&self) -> Result<String, ObjectError> {
        let copy_nb = self.active_copy_nb();
        self.archive_file()
            .tape_file(copy_nb)
            .map(|tf| tf.vid.clone())
            .ok_or_else(|| ObjectError::Inconsistent {
                address: self.address().to_string(),
                reason: format!("no tape file for copy {copy_nb}"),
            })
    }

    /// The reference a queue keeps for this request, served from `copy_nb`.
    pub fn queue_job_ref(&self, copy_nb: u32) -> QueueJobRef {
        let payload = self.payload();
        QueueJobRef {
            address: self.address().to_string(),
            copy_nb,
            size: payload.archive_file.size,
            fseq: payload.archive_file.tape_file(copy_nb).map(|tf| tf.fseq).unwrap_or(0),
            priority: payload.mount_policy.priority,
            min_request_age: payload.mount_policy.min_request_age,
            mount_policy: payload.mount_policy.name.clone(),
            start_time: payload.creation_time,
        }
    }

    pub fn add_transfer_failure(
        &mut self,
        copy_nb: u32,
        mount_id: u64,
        reason: &str,
    ) -> Result<EnqueueingNextStep<RetrieveJobStatus>, ObjectError> {
        let address = self.address().to_string();
        let verify_only = self.payload().is_verify_only;
        let job = self.payload_mut().job_mut(copy_nb, &address)?;
        let outcome = job.retry.record_transfer_failure(mount_id, reason);
        if verify_only {
            return self.determine_next_step(copy_nb, JobEvent::TransferFailed);
        }
        match outcome {
            TransferRetry::Exhausted => self.determine_next_step(copy_nb, JobEvent::TransferFailed),
            TransferRetry::NextMount => Ok(EnqueueingNextStep {
                next_status: RetrieveJobStatus::ToTransfer,
                next_step: NextStep::Nothing,
            }),
            TransferRetry::WithinMount => Ok(EnqueueingNextStep {
                next_status: RetrieveJobStatus::ToTransfer,
                next_step: NextStep::EnqueueForTransferForUser,
            }),
        }
    }

    pub fn add_report_failure(
        &mut self,
        copy_nb: u32,
        reason: &str,
    ) -> Result<EnqueueingNextStep<RetrieveJobStatus>, ObjectError> {
        let address = self.address().to_string();
        let job = self.payload_mut().job_mut(copy_nb, &address)?;
        let status = job.status;
        match job.retry.record_report_failure(reason) {
            ReportRetry::Exhausted => self.determine_next_step(copy_nb, JobEvent::ReportFailed),
            ReportRetry::Retry => Ok(EnqueueingNextStep {
                next_status: status,
                next_step: NextStep::EnqueueForReportForUser,
            }),
        }
    }

    pub fn determine_next_step(
        &mut self,
        copy_nb: u32,
        event: JobEvent,
    ) -> Result<EnqueueingNextStep<RetrieveJobStatus>, ObjectError> {
        let address = self.address().to_string();
        let status = self.payload_mut().job_mut(copy_nb, &address)?.status;
        match event {
            JobEvent::TransferFailed if status != RetrieveJobStatus::ToTransfer => {
                warn!(request = %address, copy_nb, ?status, "unexpected status for a transfer failure, assuming ToTransfer");
            }
            JobEvent::ReportFailed if status != RetrieveJobStatus::ToReportToUserForFailure => {
                warn!(request = %address, copy_nb, ?status, "unexpected status for a report failure, failing the job");
            }
            _ => {}
        }
        Ok(match event {
            JobEvent::TransferFailed if self.payload().repack.is_repack => EnqueueingNextStep {
                next_status: RetrieveJobStatus::ToReportToRepackForFailure,
                next_step: NextStep::EnqueueForReportForRepack,
            },
            JobEvent::TransferFailed => EnqueueingNextStep {
                next_status: RetrieveJobStatus::ToReportToUserForFailure,
                next_step: NextStep::EnqueueForReportForUser,
            },
            JobEvent::ReportFailed => EnqueueingNextStep {
                next_status: RetrieveJobStatus::Failed,
                next_step: NextStep::StoreInFailedJobsContainer,
            },
        })
    }

    /// Owner-checked switch of the whole request. Serving copy `copy_nb`
    /// becomes the active one; `new_status`, if any, applies to that copy.
    pub async fn update_owner(
        backend: &dyn Backend,
        address: &str,
        new_owner: &str,
        expected_previous: &str,
        copy_nb: u32,
        new_status: Option<RetrieveJobStatus>,
    ) -> Result<RetrieveOwnerUpdate, ObjectError> {
        Self::update(backend, address, |req| {
            if req.owner() != new_owner {
                if req.owner() != expected_previous {
                    return Err(ObjectError::WrongPreviousOwner {
                        address: address.to_string(),
                        expected: expected_previous.to_string(),
                        found: req.owner().to_string(),
                    });
                }
                req.set_owner(new_owner);
                if req.job(copy_nb).is_some() {
                    req.set_active_copy_nb(copy_nb);
                    if let Some(status) = new_status {
                        req.set_job_status(copy_nb, status)?;
                    }
                }
            }
            let payload = req.payload();
            Ok(RetrieveOwnerUpdate {
                archive_file: payload.archive_file.clone(),
                mount_policy: payload.mount_policy.clone(),
                dst_url: payload.dst_url.clone(),
                error_report_url: payload.error_report_url.clone(),
                is_verify_only: payload.is_verify_only,
                repack: payload.repack.clone(),
                active_copy_nb: payload.active_copy_nb,
                job_status: req.job(copy_nb).map(|j| j.status),
            })
        })
        .await
    }

    /// Requeue a request left by a dead agent: repack reports to the repack
    /// request's queue, otherwise to the best tape holding a copy still to
    /// transfer. With no usable tape the remaining jobs fail and the request
    /// lands in the failed queue of its active copy.
    pub async fn garbage_collect(mut self, presumed_owner: &str, ctx: &GcContext) -> Result<(), GcError> {
        let address = self.address().to_string();
        if self.owner() != presumed_owner {
            info!(request = %address, presumed_owner, owner = %self.owner(), "no garbage collection needed");
            return Ok(());
        }
        if self.is_cancelled() {
            self.remove(ctx.backend.as_ref()).await?;
            info!(request = %address, presumed_owner, "deleted cancelled retrieve request");
            return Ok(());
        }

        let repack_report = self
            .jobs()
            .iter()
            .find(|j| {
                matches!(
                    j.status,
                    RetrieveJobStatus::ToReportToRepackForSuccess | RetrieveJobStatus::ToReportToRepackForFailure
                )
            })
            .map(|j| (j.copy_nb, j.status));
        let (container, queue_type, copy_nb) = if let Some((copy_nb, status)) = repack_report {
            (
                self.payload().repack.repack_request_address.clone(),
                status.queue_type(),
                copy_nb,
            )
        } else {
            let candidates: BTreeSet<String> = self
                .jobs()
                .iter()
                .filter(|j| j.status == RetrieveJobStatus::ToTransfer)
                .filter_map(|j| self.archive_file().tape_file(j.copy_nb).map(|tf| tf.vid.clone()))
                .collect();
            let best = if candidates.is_empty() {
                None
            } else {
                match select_best_retrieve_queue(
                    &candidates,
                    ctx.catalogue.as_ref(),
                    &ctx.stats_cache,
                    ctx.backend.as_ref(),
                    self.payload().repack.is_repack,
                )
                .await
                {
                    Ok(vid) => Some(vid),
                    Err(QueueSelectionError::NoTapeAvailable(_)) => None,
                    Err(QueueSelectionError::Catalogue(e)) => return Err(e.into()),
                    Err(QueueSelectionError::Object(e)) => return Err(e.into()),
                }
            };
            match best.and_then(|vid| {
                self.archive_file()
                    .tape_files
                    .iter()
                    .find(|tf| tf.vid == vid)
                    .map(|tf| (vid.clone(), tf.copy_nb))
            }) {
                Some((vid, copy_nb)) => (vid, JobQueueType::JobsToTransferForUser, copy_nb),
                None => {
                    let to_fail: Vec<u32> = self
                        .jobs()
                        .iter()
                        .filter(|j| j.status == RetrieveJobStatus::ToTransfer)
                        .map(|j| j.copy_nb)
                        .collect();
                    for copy_nb in to_fail {
                        let job = self.payload_mut().job_mut(copy_nb, &address)?;
                        job.status = RetrieveJobStatus::Failed;
                        job.retry
                            .failure_log
                            .push("no tape available to requeue the request, failing it".to_string());
                        error!(request = %address, copy_nb, "no tape available to requeue the request, failing the job");
                    }
                    self.commit(ctx.backend.as_ref()).await?;
                    let (queue_type, container) = self.queue_type_and_vid()?;
                    (container, queue_type, self.active_copy_nb())
                }
            }
        };

        let mut sorter = Sorter::new(ctx.backend.clone(), ctx.agent_ref.clone());
        let promise = sorter.insert_retrieve_request(
            &container,
            queue_type,
            presumed_owner,
            RetrieveRequestToQueue {
                job: self.queue_job_ref(copy_nb),
                new_status: None,
            },
        );
        // the queue side locks queues before requests
        self.release();
        sorter.flush_all().await;
        match Sorter::wait(promise).await {
            Ok(SortOutcome::Queued { queue_address }) => {
                if queue_type == JobQueueType::JobsToTransferForUser {
                    ctx.stats_cache.invalidate(&container);
                }
                info!(request = %address, copy_nb, queue = %queue_address, presumed_owner, "requeued request");
                Ok(())
            }
            Ok(SortOutcome::Vanished) => {
                warn!(request = %address, "request disappeared while being requeued");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }
}
