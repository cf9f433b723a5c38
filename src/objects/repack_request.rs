use rkyv::{Archive, Deserialize as RkyvDeserialize, Serialize as RkyvSerialize};
use tracing::{info, warn};

use super::{Object, ObjectError, ObjectType, RepackQueueType};
use crate::algorithms::repack::RepackQueueTraits;
use crate::algorithms::ContainerAlgorithms;
use crate::backend::Backend;
use crate::garbage_collector::{GcContext, GcError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Archive, RkyvSerialize, RkyvDeserialize)]
#[archive(check_bytes)]
pub enum RepackStatus {
    Pending,
    ToExpand,
    Starting,
    Running,
    Complete,
    Failed,
    /// Being deleted by a cancellation.
    Cancelled,
}

impl RepackStatus {
    /// Repack queue a request with this status waits in, if any.
    pub fn queue_type(&self) -> Option<RepackQueueType> {
        match self {
            RepackStatus::Pending => Some(RepackQueueType::Pending),
            RepackStatus::ToExpand => Some(RepackQueueType::ToExpand),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Archive, RkyvSerialize, RkyvDeserialize)]
#[archive(check_bytes)]
pub struct RepackRequestData {
    pub vid: String,
    pub buffer_url: String,
    pub status: RepackStatus,
    pub creation_time: i64,
    pub finished_time: i64,
    pub is_expand_started: bool,
    pub is_expand_finished: bool,
    pub total_files_to_retrieve: u64,
    pub retrieved_files: u64,
    pub failed_to_retrieve_files: u64,
    pub total_files_to_archive: u64,
    pub archived_files: u64,
    pub failed_to_archive_files: u64,
}

object_payload!(RepackRequestData, ObjectType::RepackRequest);

pub type RepackRequest = Object<RepackRequestData>;

impl RepackRequestData {
    pub fn new(vid: &str, buffer_url: &str, creation_time: i64) -> Self {
        Self {
            vid: vid.to_string(),
            buffer_url: buffer_url.to_string(),
            status: RepackStatus::Pending,
            creation_time,
            finished_time: 0,
            is_expand_started: false,
            is_expand_finished: false,
            total_files_to_retrieve: 0,
            retrieved_files: 0,
            failed_to_retrieve_files: 0,
            total_files_to_archive: 0,
            archived_files: 0,
            failed_to_archive_files: 0,
        }
    }

    /// Derive the status from the counters once expansion has started.
    fn refresh_status(&mut self) {
        if !self.is_expand_started {
            return;
        }
        let retrieve_done = self.retrieved_files + self.failed_to_retrieve_files >= self.total_files_to_retrieve;
        let archive_done = self.archived_files + self.failed_to_archive_files >= self.total_files_to_archive;
        if self.is_expand_finished && retrieve_done && archive_done {
            self.finished_time = chrono::Utc::now().timestamp();
            self.status = if self.failed_to_retrieve_files > 0 || self.failed_to_archive_files > 0 {
                RepackStatus::Failed
            } else {
                RepackStatus::Complete
            };
            return;
        }
        let any_progress = self.retrieved_files > 0
            || self.failed_to_retrieve_files > 0
            || self.archived_files > 0
            || self.failed_to_archive_files > 0;
        self.status = if any_progress {
            RepackStatus::Running
        } else {
            RepackStatus::Starting
        };
    }
}

/// Snapshot returned by an owner switch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepackOwnerUpdate {
    pub vid: String,
    pub buffer_url: String,
    pub status: RepackStatus,
}

impl Object<RepackRequestData> {
    pub fn vid(&self) -> &str {
        &self.payload().vid
    }

    pub fn status(&self) -> RepackStatus {
        self.payload().status
    }

    pub fn set_status(&mut self, status: RepackStatus) {
        self.payload_mut().status = status;
    }

    pub fn start_expansion(&mut self, total_files_to_retrieve: u64, total_files_to_archive: u64) {
        let payload = self.payload_mut();
        payload.is_expand_started = true;
        payload.total_files_to_retrieve = total_files_to_retrieve;
        payload.total_files_to_archive = total_files_to_archive;
        payload.refresh_status();
    }

    pub fn finish_expansion(&mut self) {
        let payload = self.payload_mut();
        payload.is_expand_finished = true;
        payload.refresh_status();
    }

    pub fn report_retrieve_results(&mut self, successes: u64, failures: u64) -> RepackStatus {
        let payload = self.payload_mut();
        payload.retrieved_files += successes;
        payload.failed_to_retrieve_files += failures;
        payload.refresh_status();
        payload.status
    }

    pub fn report_archive_results(&mut self, successes: u64, failures: u64) -> RepackStatus {
        let payload = self.payload_mut();
        payload.archived_files += successes;
        payload.failed_to_archive_files += failures;
        payload.refresh_status();
        payload.status
    }

    /// Owner-checked switch of the request, optionally moving it to `new_status`.
    pub async fn update_owner_and_status(
        backend: &dyn Backend,
        address: &str,
        new_owner: &str,
        expected_previous: &str,
        new_status: Option<RepackStatus>,
    ) -> Result<RepackOwnerUpdate, ObjectError> {
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
                if let Some(status) = new_status {
                    req.set_status(status);
                }
            }
            Ok(RepackOwnerUpdate {
                vid: req.payload().vid.clone(),
                buffer_url: req.payload().buffer_url.clone(),
                status: req.status(),
            })
        })
        .await
    }

    /// Requeue to the Pending or ToExpand queue according to the status. A
    /// request in any other phase is left in place.
    pub async fn garbage_collect(mut self, presumed_owner: &str, ctx: &GcContext) -> Result<(), GcError> {
        let address = self.address().to_string();
        if self.owner() != presumed_owner {
            info!(request = %address, presumed_owner, owner = %self.owner(), "no garbage collection needed");
            return Ok(());
        }
        if self.status() == RepackStatus::Cancelled {
            self.remove(ctx.backend.as_ref()).await?;
            info!(request = %address, presumed_owner, "deleted cancelled repack request");
            return Ok(());
        }
        let Some(queue_type) = self.status().queue_type() else {
            warn!(request = %address, status = ?self.status(), "repack request in a non queueable status, leaving it as it is");
            return Ok(());
        };
        self.release();
        let algorithms = ContainerAlgorithms::new(ctx.backend.clone(), ctx.agent_ref.clone(), RepackQueueTraits::new(queue_type));
        let queue = algorithms
            .reference_and_switch_ownership_if_necessary("", presumed_owner, vec![address.clone()])
            .await?;
        info!(request = %address, queue = %queue, "requeued repack request");
        Ok(())
    }
}
