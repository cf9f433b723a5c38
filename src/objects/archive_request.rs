use rkyv::{Archive, Deserialize as RkyvDeserialize, Serialize as RkyvSerialize};
use tracing::{error, info, warn};

use super::job_queue::QueueJobRef;
use super::request_info::{ArchiveFile, MountPolicy, RepackInfo, Requester};
use super::{JobQueueType, Object, ObjectError, ObjectType};
use crate::algorithms::archive::ArchiveJobToQueue;
use crate::backend::Backend;
use crate::garbage_collector::{GcContext, GcError};
use crate::retry::{ReportRetry, RetryCounters, RetryLimits, TransferRetry};
use crate::sorter::{SortOutcome, Sorter};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Archive, RkyvSerialize, RkyvDeserialize)]
#[archive(check_bytes)]
pub enum ArchiveJobStatus {
    ToTransferForUser,
    ToTransferForRepack,
    ToReportToUserForTransfer,
    ToReportToUserForFailure,
    ToReportToRepackForSuccess,
    ToReportToRepackForFailure,
    Complete,
    Failed,
    Abandoned,
}

impl ArchiveJobStatus {
    /// Queue a job with this status waits in; `None` for terminal statuses.
    pub fn queue_type(&self) -> Option<JobQueueType> {
        match self {
            ArchiveJobStatus::ToTransferForUser => Some(JobQueueType::JobsToTransferForUser),
            ArchiveJobStatus::ToTransferForRepack => Some(JobQueueType::JobsToTransferForRepack),
            ArchiveJobStatus::ToReportToUserForTransfer | ArchiveJobStatus::ToReportToUserForFailure => {
                Some(JobQueueType::JobsToReportToUser)
            }
            ArchiveJobStatus::ToReportToRepackForSuccess => Some(JobQueueType::JobsToReportToRepackForSuccess),
            ArchiveJobStatus::ToReportToRepackForFailure => Some(JobQueueType::JobsToReportToRepackForFailure),
            ArchiveJobStatus::Failed => Some(JobQueueType::FailedJobs),
            ArchiveJobStatus::Complete | ArchiveJobStatus::Abandoned => None,
        }
    }

    /// Repack report queues are keyed by the repack request, everything else by tape pool.
    pub fn queued_by_repack_request(&self) -> bool {
        matches!(
            self,
            ArchiveJobStatus::ToReportToRepackForSuccess | ArchiveJobStatus::ToReportToRepackForFailure
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ArchiveJobStatus::Complete | ArchiveJobStatus::Failed | ArchiveJobStatus::Abandoned
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Archive, RkyvSerialize, RkyvDeserialize)]
#[archive(check_bytes)]
pub struct ArchiveJob {
    pub copy_nb: u32,
    pub tape_pool: String,
    pub owner: String,
    pub status: ArchiveJobStatus,
    pub retry: RetryCounters,
}

#[derive(Debug, Clone, PartialEq, Eq, Archive, RkyvSerialize, RkyvDeserialize)]
#[archive(check_bytes)]
pub struct ArchiveRequestData {
    pub archive_file: ArchiveFile,
    pub requester: Requester,
    pub mount_policy: MountPolicy,
    pub src_url: String,
    pub archive_report_url: String,
    pub archive_error_report_url: String,
    pub creation_time: i64,
    pub repack: RepackInfo,
    /// Set once one job took charge of the failure report for the whole request.
    pub report_decided: bool,
    pub jobs: Vec<ArchiveJob>,
}

object_payload!(ArchiveRequestData, ObjectType::ArchiveRequest);

pub type ArchiveRequest = Object<ArchiveRequestData>;

impl ArchiveRequestData {
    pub fn new(
        archive_file: ArchiveFile,
        requester: Requester,
        mount_policy: MountPolicy,
        src_url: &str,
        creation_time: i64,
    ) -> Self {
        Self {
            archive_file,
            requester,
            mount_policy,
            src_url: src_url.to_string(),
            archive_report_url: String::new(),
            archive_error_report_url: String::new(),
            creation_time,
            repack: RepackInfo::default(),
            report_decided: false,
            jobs: Vec::new(),
        }
    }

    fn job_mut(&mut self, copy_nb: u32, address: &str) -> Result<&mut ArchiveJob, ObjectError> {
        self.jobs
            .iter_mut()
            .find(|j| j.copy_nb == copy_nb)
            .ok_or_else(|| ObjectError::NoSuchJob {
                address: address.to_string(),
                copy_nb,
            })
    }
}

/// What to do with a job after a failure was accounted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NextStep {
    /// Retry on a later mount: same queue family, no report.
    Nothing,
    EnqueueForTransferForUser,
    EnqueueForTransferForRepack,
    EnqueueForReportForUser,
    EnqueueForReportForRepack,
    StoreInFailedJobsContainer,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EnqueueingNextStep<S> {
    pub next_status: S,
    pub next_step: NextStep,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobEvent {
    TransferFailed,
    ReportFailed,
}

/// What a popper learns about a request while taking ownership of one job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveJobOwnerUpdate {
    pub archive_file: ArchiveFile,
    pub mount_policy: MountPolicy,
    pub src_url: String,
    pub archive_report_url: String,
    pub archive_error_report_url: String,
    pub repack: RepackInfo,
    pub job_statuses: Vec<(u32, ArchiveJobStatus)>,
    /// Another job of the request is still owned by the expected previous owner.
    pub other_jobs_owned_by_previous: bool,
}

impl Object<ArchiveRequestData> {
    pub fn archive_file(&self) -> &ArchiveFile {
        &self.payload().archive_file
    }

    pub fn mount_policy(&self) -> &MountPolicy {
        &self.payload().mount_policy
    }

    pub fn repack_info(&self) -> &RepackInfo {
        &self.payload().repack
    }

    pub fn set_repack_info(&mut self, repack: RepackInfo) {
        self.payload_mut().repack = repack;
    }

    pub fn set_report_urls(&mut self, report_url: &str, error_report_url: &str) {
        let payload = self.payload_mut();
        payload.archive_report_url = report_url.to_string();
        payload.archive_error_report_url = error_report_url.to_string();
    }

    /// New job, owned by `owner`, waiting for transfer.
    pub fn add_job(&mut self, copy_nb: u32, tape_pool: &str, owner: &str, limits: RetryLimits) {
        let status = if self.payload().repack.is_repack {
            ArchiveJobStatus::ToTransferForRepack
        } else {
            ArchiveJobStatus::ToTransferForUser
        };
        self.payload_mut().jobs.push(ArchiveJob {
            copy_nb,
            tape_pool: tape_pool.to_string(),
            owner: owner.to_string(),
            status,
            retry: RetryCounters::new(limits),
        });
    }

    pub fn jobs(&self) -> &[ArchiveJob] {
        &self.payload().jobs
    }

    pub fn job(&self, copy_nb: u32) -> Option<&ArchiveJob> {
        self.payload().jobs.iter().find(|j| j.copy_nb == copy_nb)
    }

    pub fn job_owner(&self, copy_nb: u32) -> Result<&str, ObjectError> {
        self.job(copy_nb)
            .map(|j| j.owner.as_str())
            .ok_or_else(|| ObjectError::NoSuchJob {
                address: self.address().to_string(),
                copy_nb,
            })
    }

    pub fn set_job_owner(&mut self, copy_nb: u32, owner: &str) -> Result<(), ObjectError> {
        let address = self.address().to_string();
        self.payload_mut().job_mut(copy_nb, &address)?.owner = owner.to_string();
        Ok(())
    }

    pub fn set_job_status(&mut self, copy_nb: u32, status: ArchiveJobStatus) -> Result<(), ObjectError> {
        let address = self.address().to_string();
        self.payload_mut().job_mut(copy_nb, &address)?.status = status;
        Ok(())
    }

    /// Every job reached a terminal status: the request can be deleted.
    pub fn is_complete(&self) -> bool {
        self.payload().jobs.iter().all(|j| j.status.is_terminal())
    }

    /// Every job was abandoned by a cancellation.
    pub fn is_cancelled(&self) -> bool {
        let jobs = &self.payload().jobs;
        !jobs.is_empty() && jobs.iter().all(|j| j.status == ArchiveJobStatus::Abandoned)
    }

    /// Container and queue type the job belongs in, `None` if its status is not queueable.
    pub fn queue_target(&self, copy_nb: u32) -> Result<Option<(String, JobQueueType)>, ObjectError> {
        let job = self.job(copy_nb).ok_or_else(|| ObjectError::NoSuchJob {
            address: self.address().to_string(),
            copy_nb,
        })?;
        Ok(job.status.queue_type().map(|queue_type| {
            let container = if job.status.queued_by_repack_request() {
                self.payload().repack.repack_request_address.clone()
            } else {
                job.tape_pool.clone()
            };
            (container, queue_type)
        }))
    }

    /// The reference a queue keeps for one job of this request.
    pub fn queue_job_ref(&self, copy_nb: u32) -> QueueJobRef {
        let payload = self.payload();
        QueueJobRef {
            address: self.address().to_string(),
            copy_nb,
            size: payload.archive_file.size,
            fseq: 0,
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
    ) -> Result<EnqueueingNextStep<ArchiveJobStatus>, ObjectError> {
        let address = self.address().to_string();
        let is_repack = self.payload().repack.is_repack;
        let job = self.payload_mut().job_mut(copy_nb, &address)?;
        let outcome = job.retry.record_transfer_failure(mount_id, reason);
        let next_status = if is_repack {
            ArchiveJobStatus::ToTransferForRepack
        } else {
            ArchiveJobStatus::ToTransferForUser
        };
        match outcome {
            TransferRetry::Exhausted => self.determine_next_step(copy_nb, JobEvent::TransferFailed),
            TransferRetry::NextMount => Ok(EnqueueingNextStep {
                next_status,
                next_step: NextStep::Nothing,
            }),
            TransferRetry::WithinMount => Ok(EnqueueingNextStep {
                next_status,
                next_step: if is_repack {
                    NextStep::EnqueueForTransferForRepack
                } else {
                    NextStep::EnqueueForTransferForUser
                },
            }),
        }
    }

    pub fn add_report_failure(
        &mut self,
        copy_nb: u32,
        reason: &str,
    ) -> Result<EnqueueingNextStep<ArchiveJobStatus>, ObjectError> {
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

    /// Destination of a job whose retries are exhausted. Only the first failed
    /// job of a user request carries the failure report; later ones go
    /// straight to the failed container.
    pub fn determine_next_step(
        &mut self,
        copy_nb: u32,
        event: JobEvent,
    ) -> Result<EnqueueingNextStep<ArchiveJobStatus>, ObjectError> {
        let address = self.address().to_string();
        let status = self.payload_mut().job_mut(copy_nb, &address)?.status;
        match event {
            JobEvent::TransferFailed
                if !matches!(
                    status,
                    ArchiveJobStatus::ToTransferForUser | ArchiveJobStatus::ToTransferForRepack
                ) =>
            {
                warn!(request = %address, copy_nb, ?status, "unexpected status for a transfer failure, assuming ToTransfer");
            }
            JobEvent::ReportFailed
                if !matches!(
                    status,
                    ArchiveJobStatus::ToReportToUserForFailure | ArchiveJobStatus::ToReportToUserForTransfer
                ) =>
            {
                warn!(request = %address, copy_nb, ?status, "unexpected status for a report failure, failing the job");
            }
            _ => {}
        }
        let payload = self.payload_mut();
        Ok(match event {
            JobEvent::TransferFailed if payload.repack.is_repack => {
                payload.report_decided = true;
                EnqueueingNextStep {
                    next_status: ArchiveJobStatus::ToReportToRepackForFailure,
                    next_step: NextStep::EnqueueForReportForRepack,
                }
            }
            JobEvent::TransferFailed if !payload.report_decided => {
                payload.report_decided = true;
                EnqueueingNextStep {
                    next_status: ArchiveJobStatus::ToReportToUserForFailure,
                    next_step: NextStep::EnqueueForReportForUser,
                }
            }
            JobEvent::TransferFailed | JobEvent::ReportFailed => EnqueueingNextStep {
                next_status: ArchiveJobStatus::Failed,
                next_step: NextStep::StoreInFailedJobsContainer,
            },
        })
    }

    /// Owner-checked switch of one job. Already owned by `new_owner` is a
    /// success (an interrupted switch being replayed); any other owner than
    /// `expected_previous` is `WrongPreviousOwner`.
    pub async fn update_job_owner(
        backend: &dyn Backend,
        address: &str,
        copy_nb: u32,
        new_owner: &str,
        expected_previous: &str,
        new_status: Option<ArchiveJobStatus>,
    ) -> Result<ArchiveJobOwnerUpdate, ObjectError> {
        Self::update(backend, address, |req| {
            let job = req.payload_mut().job_mut(copy_nb, address)?;
            if job.owner != new_owner {
                if job.owner != expected_previous {
                    return Err(ObjectError::WrongPreviousOwner {
                        address: address.to_string(),
                        expected: expected_previous.to_string(),
                        found: job.owner.clone(),
                    });
                }
                job.owner = new_owner.to_string();
                if let Some(status) = new_status {
                    job.status = status;
                }
            }
            let payload = req.payload();
            Ok(ArchiveJobOwnerUpdate {
                archive_file: payload.archive_file.clone(),
                mount_policy: payload.mount_policy.clone(),
                src_url: payload.src_url.clone(),
                archive_report_url: payload.archive_report_url.clone(),
                archive_error_report_url: payload.archive_error_report_url.clone(),
                repack: payload.repack.clone(),
                job_statuses: payload.jobs.iter().map(|j| (j.copy_nb, j.status)).collect(),
                other_jobs_owned_by_previous: payload
                    .jobs
                    .iter()
                    .any(|j| j.copy_nb != copy_nb && j.owner == expected_previous),
            })
        })
        .await
    }

    /// Record a copy safely on tape. Returns true when this job carries the
    /// success report for the request.
    pub fn transfer_successful(&mut self, copy_nb: u32, destination_vid: &str) -> Result<bool, ObjectError> {
        let address = self.address().to_string();
        let payload = self.payload_mut();
        if payload.repack.is_repack {
            payload
                .repack
                .jobs_destination
                .retain(|(c, _)| *c != copy_nb);
            payload
                .repack
                .jobs_destination
                .push((copy_nb, destination_vid.to_string()));
            payload.job_mut(copy_nb, &address)?.status = ArchiveJobStatus::ToReportToRepackForSuccess;
            return Ok(false);
        }
        let others_to_transfer = payload
            .jobs
            .iter()
            .any(|j| j.copy_nb != copy_nb && j.status == ArchiveJobStatus::ToTransferForUser);
        let report_decided = payload.report_decided;
        let job = payload.job_mut(copy_nb, &address)?;
        if others_to_transfer || report_decided {
            job.status = ArchiveJobStatus::Complete;
            job.owner = String::new();
            Ok(false)
        } else {
            job.status = ArchiveJobStatus::ToReportToUserForTransfer;
            Ok(true)
        }
    }

    /// Requeue every job still owned by the dead `presumed_owner`, each to the
    /// queue its status implies. Jobs that cannot be requeued are failed.
    pub async fn garbage_collect(mut self, presumed_owner: &str, ctx: &GcContext) -> Result<(), GcError> {
        let address = self.address().to_string();
        if self.is_cancelled() && self.jobs().iter().any(|j| j.owner == presumed_owner) {
            // the cancelling agent died before deleting it
            self.remove(ctx.backend.as_ref()).await?;
            info!(request = %address, presumed_owner, "deleted cancelled archive request");
            return Ok(());
        }
        let mut sorter = Sorter::new(ctx.backend.clone(), ctx.agent_ref.clone());
        let mut promises = Vec::new();
        for job in self.jobs().iter().filter(|j| j.owner == presumed_owner) {
            match self.queue_target(job.copy_nb)? {
                Some((container, queue_type)) => {
                    let promise = sorter.insert_archive_job(
                        &container,
                        queue_type,
                        presumed_owner,
                        ArchiveJobToQueue {
                            job: self.queue_job_ref(job.copy_nb),
                            new_status: None,
                        },
                    );
                    promises.push((job.copy_nb, container, promise));
                }
                None => {
                    warn!(request = %address, copy_nb = job.copy_nb, status = ?job.status, "job garbage collected with a status not queueable, nothing to do");
                }
            }
        }
        if promises.is_empty() {
            info!(request = %address, presumed_owner, "nothing to garbage collect");
            return Ok(());
        }
        // the queue side locks queues before requests
        self.release();
        sorter.flush_all().await;

        let mut failed = Vec::new();
        for (copy_nb, container, promise) in promises {
            match Sorter::wait(promise).await {
                Ok(SortOutcome::Queued { queue_address }) => {
                    info!(request = %address, copy_nb, queue = %queue_address, presumed_owner, "requeued job");
                }
                Ok(SortOutcome::Vanished) => {
                    warn!(request = %address, copy_nb, "request disappeared while being requeued");
                    return Ok(());
                }
                Err(e) => {
                    error!(request = %address, copy_nb, container = %container, error = %e, "failed to requeue the job, failing it");
                    failed.push(copy_nb);
                }
            }
        }
        if !failed.is_empty() {
            let result = ArchiveRequest::update(ctx.backend.as_ref(), &address, |req| {
                for copy_nb in &failed {
                    if req.job_owner(*copy_nb)? == presumed_owner {
                        req.set_job_status(*copy_nb, ArchiveJobStatus::Failed)?;
                    }
                }
                Ok(())
            })
            .await;
            match result {
                Err(e) if !e.is_no_such_object() => return Err(e.into()),
                _ => {}
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(is_repack: bool) -> ArchiveRequest {
        let mut req = ArchiveRequest::new(
            "ArchiveRequest-test-0",
            ArchiveRequestData::new(
                ArchiveFile {
                    archive_file_id: 42,
                    size: 1000,
                    ..Default::default()
                },
                Requester::default(),
                MountPolicy {
                    name: "policy".to_string(),
                    priority: 3,
                    min_request_age: 60,
                },
                "root://eos/file",
                1_000,
            ),
        );
        if is_repack {
            req.set_repack_info(RepackInfo {
                is_repack: true,
                repack_request_address: "RepackRequest-x".to_string(),
                ..Default::default()
            });
        }
        req.add_job(1, "pool1", "agentA", RetryLimits::default());
        req.add_job(2, "pool2", "agentA", RetryLimits::default());
        req
    }

    #[test]
    fn status_to_queue_type() {
        assert_eq!(
            ArchiveJobStatus::ToReportToUserForFailure.queue_type(),
            Some(JobQueueType::JobsToReportToUser)
        );
        assert_eq!(ArchiveJobStatus::Complete.queue_type(), None);
        assert_eq!(ArchiveJobStatus::Abandoned.queue_type(), None);
        assert_eq!(ArchiveJobStatus::Failed.queue_type(), Some(JobQueueType::FailedJobs));
    }

    #[test]
    fn repack_report_queues_are_keyed_by_repack_request() {
        let mut req = request(true);
        req.set_job_status(1, ArchiveJobStatus::ToReportToRepackForSuccess).unwrap();
        assert_eq!(
            req.queue_target(1).unwrap(),
            Some((
                "RepackRequest-x".to_string(),
                JobQueueType::JobsToReportToRepackForSuccess
            ))
        );
        assert_eq!(
            req.queue_target(2).unwrap(),
            Some(("pool2".to_string(), JobQueueType::JobsToTransferForRepack))
        );
    }

    #[test]
    fn only_first_exhausted_job_reports_failure() {
        let mut req = request(false);
        let first = req.add_transfer_failure(1, 5, "write error").unwrap();
        assert_eq!(first.next_step, NextStep::EnqueueForTransferForUser);
        let first = req.add_transfer_failure(1, 6, "write error").unwrap();
        assert_eq!(first.next_status, ArchiveJobStatus::ToReportToUserForFailure);
        assert_eq!(first.next_step, NextStep::EnqueueForReportForUser);

        req.add_transfer_failure(2, 5, "write error").unwrap();
        let second = req.add_transfer_failure(2, 6, "write error").unwrap();
        assert_eq!(second.next_status, ArchiveJobStatus::Failed);
        assert_eq!(second.next_step, NextStep::StoreInFailedJobsContainer);
    }

    #[test]
    fn report_failures_end_in_failed() {
        let mut req = request(false);
        req.set_job_status(1, ArchiveJobStatus::ToReportToUserForTransfer).unwrap();
        let step = req.add_report_failure(1, "eos down").unwrap();
        assert_eq!(step.next_status, ArchiveJobStatus::ToReportToUserForTransfer);
        assert_eq!(step.next_step, NextStep::EnqueueForReportForUser);
        let step = req.add_report_failure(1, "eos down").unwrap();
        assert_eq!(step.next_status, ArchiveJobStatus::Failed);
    }

    #[test]
    fn last_transferred_copy_reports_success() {
        let mut req = request(false);
        assert!(!req.transfer_successful(1, "V00001").unwrap());
        assert_eq!(req.job(1).unwrap().status, ArchiveJobStatus::Complete);
        req.set_job_status(1, ArchiveJobStatus::Complete).unwrap();
        assert!(req.transfer_successful(2, "V00002").unwrap());
        assert_eq!(req.job(2).unwrap().status, ArchiveJobStatus::ToReportToUserForTransfer);
        assert!(!req.is_complete());
        req.set_job_status(2, ArchiveJobStatus::Complete).unwrap();
        assert!(req.is_complete());
    }

    #[test]
    fn missing_copy_is_reported() {
        let mut req = request(false);
        assert!(matches!(
            req.set_job_status(9, ArchiveJobStatus::Failed),
            Err(ObjectError::NoSuchJob { copy_nb: 9, .. })
        ));
    }
}
