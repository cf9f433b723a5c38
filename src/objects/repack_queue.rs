use std::collections::HashSet;

use rkyv::{Archive, Deserialize as RkyvDeserialize, Serialize as RkyvSerialize};
use tracing::{debug, info, warn};

use super::{Object, ObjectError, ObjectType, QueueKind, RootEntry};
use crate::backend::Backend;
use crate::keys::ROOT_ENTRY_ADDRESS;

/// Repack requests waiting for a phase, oldest first. Not sharded: repack
/// requests are few.
#[derive(Debug, Clone, PartialEq, Eq, Archive, RkyvSerialize, RkyvDeserialize)]
#[archive(check_bytes)]
pub struct RepackQueueData {
    pub kind: QueueKind,
    pub requests: Vec<String>,
}

object_payload!(RepackQueueData, ObjectType::RepackQueue);

pub type RepackQueue = Object<RepackQueueData>;

impl RepackQueueData {
    pub fn new_queue(_key: &str, kind: QueueKind) -> Self {
        Self {
            kind,
            requests: Vec::new(),
        }
    }
}

impl Object<RepackQueueData> {
    pub fn queue_kind(&self) -> QueueKind {
        self.payload().kind
    }

    pub fn is_empty(&self) -> bool {
        self.payload().requests.is_empty()
    }

    pub fn requests(&self) -> &[String] {
        &self.payload().requests
    }

    pub async fn add_requests_and_commit(
        &mut self,
        addresses: &[String],
        backend: &dyn Backend,
    ) -> Result<(), ObjectError> {
        self.payload_mut().requests.extend(addresses.iter().cloned());
        self.commit(backend).await
    }

    pub async fn add_requests_if_necessary_and_commit(
        &mut self,
        addresses: &[String],
        backend: &dyn Backend,
    ) -> Result<(), ObjectError> {
        let present: HashSet<String> = self.payload().requests.iter().cloned().collect();
        let missing: Vec<String> = addresses
            .iter()
            .filter(|a| !present.contains(*a))
            .cloned()
            .collect();
        if missing.is_empty() {
            return Ok(());
        }
        self.add_requests_and_commit(&missing, backend).await
    }

    pub async fn remove_requests_and_commit(
        &mut self,
        addresses: &[String],
        backend: &dyn Backend,
    ) -> Result<(), ObjectError> {
        let remove: HashSet<&str> = addresses.iter().map(|a| a.as_str()).collect();
        self.payload_mut()
            .requests
            .retain(|r| !remove.contains(r.as_str()));
        self.commit(backend).await
    }

    /// Up to `max_requests` requests from the front, ignoring `skip`.
    pub fn candidate_list(&self, max_requests: u64, skip: &HashSet<String>) -> Vec<String> {
        self.payload()
            .requests
            .iter()
            .filter(|r| !skip.contains(*r))
            .take(max_requests as usize)
            .cloned()
            .collect()
    }

    /// Same contract as the sharded queues: re-own to the root entry when
    /// still referenced, delete when orphaned and empty.
    pub async fn garbage_collect_queue(
        mut self,
        presumed_owner: &str,
        backend: &dyn Backend,
    ) -> Result<(), ObjectError> {
        if self.owner() != presumed_owner {
            debug!(queue = %self.address(), owner = %self.owner(), "queue no longer owned, nothing to collect");
            return Ok(());
        }
        let root = RootEntry::fetch_no_lock(backend, ROOT_ENTRY_ADDRESS).await?;
        if root.queue_address(self.queue_kind(), "").as_deref() == Some(self.address()) {
            self.set_owner(ROOT_ENTRY_ADDRESS);
            self.commit(backend).await?;
            info!(queue = %self.address(), "re-owned queue to the root entry");
        } else if self.is_empty() {
            let address = self.address().to_string();
            self.remove(backend).await?;
            info!(queue = %address, "deleted unreferenced empty queue");
        } else {
            warn!(queue = %self.address(), "unreferenced queue still holds requests, leaving it in place");
        }
        Ok(())
    }
}
