//! The queueing engine: reference elements into a queue and hand their
//! ownership to it, or pop elements out of a queue into the agent's
//! ownership. Written once, specialized per queue family by [`ContainerTraits`].

pub mod archive;
pub mod repack;
pub mod retrieve;

use std::collections::HashSet;
use std::ops::AddAssign;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::agent_reference::AgentReference;
use crate::backend::Backend;
use crate::helpers::{get_locked_and_fetched_queue, get_locked_and_fetched_queue_no_create, trim_queue_if_needed};
use crate::objects::{Object, ObjectError, ObjectPayload, QueueKind};

pub use crate::objects::job_queue::JobKey;

/// Bounds of one pop. Repack queues only look at `files`, counting requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PopCriteria {
    pub files: u64,
    pub bytes: u64,
}

impl PopCriteria {
    pub fn new(files: u64, bytes: u64) -> Self {
        Self { files, bytes }
    }

    /// What is left to pop once `popped` has been taken.
    pub fn remaining_after(&self, popped: &PoppedSummary) -> PopCriteria {
        PopCriteria {
            files: self.files.saturating_sub(popped.files),
            bytes: self.bytes.saturating_sub(popped.bytes),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoppedSummary {
    pub files: u64,
    pub bytes: u64,
}

impl AddAssign for PoppedSummary {
    fn add_assign(&mut self, other: Self) {
        self.files += other.files;
        self.bytes += other.bytes;
    }
}

/// Size of a queue as seen by the engine.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ContainerSummary {
    pub files: u64,
    pub bytes: u64,
}

#[derive(Debug)]
pub struct PoppedElementsBatch<E> {
    pub elements: Vec<E>,
    pub summary: PoppedSummary,
    /// Elements whose switch failed for an unexpected reason. They are still
    /// referenced by the queue.
    pub unexpected_failures: Vec<OpFailure>,
}

impl<E> Default for PoppedElementsBatch<E> {
    fn default() -> Self {
        Self {
            elements: Vec::new(),
            summary: PoppedSummary::default(),
            unexpected_failures: Vec::new(),
        }
    }
}

/// Result of switching one inserted element to the queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OwnershipSwitch {
    /// Part of the element's object (another job of the same request) is
    /// still owned by the previous owner, which must keep tracking it.
    pub still_owned_by_previous: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpFailure {
    pub address: String,
    pub copy_nb: u32,
    pub error: ObjectError,
}

impl OpFailure {
    fn new(key: JobKey, error: ObjectError) -> Self {
        Self {
            address: key.address,
            copy_nb: key.copy_nb,
            error,
        }
    }

    pub fn key(&self) -> JobKey {
        JobKey::new(&self.address, self.copy_nb)
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("ownership switch to {queue_address} failed for {} element(s)", .failed.len())]
pub struct OwnershipSwitchFailure {
    pub queue_address: String,
    pub failed: Vec<OpFailure>,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AlgorithmError {
    #[error(transparent)]
    Object(#[from] ObjectError),
    #[error(transparent)]
    OwnershipSwitch(#[from] OwnershipSwitchFailure),
}

/// Per queue family hooks used by [`ContainerAlgorithms`].
#[async_trait]
pub trait ContainerTraits: Send + Sync {
    type Container: ObjectPayload;
    type InsertedElement: Clone + Send + Sync;
    type Candidate: Clone + Send + Sync;
    type PoppedElement: Send + Sync;

    fn queue_kind(&self) -> QueueKind;

    fn container_summary(&self, container: &Object<Self::Container>) -> ContainerSummary;

    /// Queue reference of an element. Queues holding whole requests use
    /// copy number 0.
    fn inserted_key(element: &Self::InsertedElement) -> JobKey;

    fn candidate_key(candidate: &Self::Candidate) -> JobKey;

    fn element_summary(element: &Self::PoppedElement) -> PoppedSummary;

    /// Whether more elements should be popped.
    fn under_criteria(&self, popped: &PoppedSummary, criteria: &PopCriteria) -> bool {
        popped.bytes < criteria.bytes && popped.files < criteria.files
    }

    async fn add_references(
        &self,
        container: &mut Object<Self::Container>,
        elements: &[Self::InsertedElement],
        agent_ref: &AgentReference,
        backend: &dyn Backend,
    ) -> Result<(), ObjectError>;

    async fn add_references_if_necessary(
        &self,
        container: &mut Object<Self::Container>,
        elements: &[Self::InsertedElement],
        agent_ref: &AgentReference,
        backend: &dyn Backend,
    ) -> Result<(), ObjectError>;

    async fn remove_references(
        &self,
        container: &mut Object<Self::Container>,
        keys: &[JobKey],
        backend: &dyn Backend,
    ) -> Result<(), ObjectError>;

    async fn candidates(
        &self,
        container: &Object<Self::Container>,
        remaining: &PopCriteria,
        skip: &HashSet<JobKey>,
        backend: &dyn Backend,
    ) -> Result<Vec<Self::Candidate>, ObjectError>;

    /// Switch each element from `previous_owner` to the queue. One result per
    /// element, in order.
    async fn switch_inserted_ownership(
        &self,
        elements: &[Self::InsertedElement],
        queue_address: &str,
        previous_owner: &str,
        backend: &dyn Backend,
    ) -> Vec<Result<OwnershipSwitch, ObjectError>>;

    /// Switch each candidate from the queue to the popping agent. One result
    /// per candidate, in order.
    async fn switch_popped_ownership(
        &self,
        candidates: &[Self::Candidate],
        queue_address: &str,
        agent_address: &str,
        backend: &dyn Backend,
    ) -> Vec<Result<Self::PoppedElement, ObjectError>>;
}

pub struct ContainerAlgorithms<T> {
    backend: Arc<dyn Backend>,
    agent_ref: Arc<AgentReference>,
    traits: T,
}

impl<T: ContainerTraits> ContainerAlgorithms<T> {
    pub fn new(backend: Arc<dyn Backend>, agent_ref: Arc<AgentReference>, traits: T) -> Self {
        Self {
            backend,
            agent_ref,
            traits,
        }
    }

    pub fn traits(&self) -> &T {
        &self.traits
    }

    /// Reference `elements` from the queue for `container_id` and switch their
    /// owner from `previous_owner` to it. Returns the queue address.
    ///
    /// Successfully switched elements leave the agent ownership when the agent
    /// was the previous owner. Elements whose switch failed are dereferenced
    /// again and reported in [`AlgorithmError::OwnershipSwitch`]; they stay
    /// with their previous owner.
    pub async fn reference_and_switch_ownership(
        &self,
        container_id: &str,
        previous_owner: &str,
        elements: Vec<T::InsertedElement>,
    ) -> Result<String, AlgorithmError> {
        self.reference_and_switch(container_id, previous_owner, elements, false)
            .await
    }

    /// Idempotent variant for garbage collection: elements already referenced
    /// by the queue are not added twice.
    pub async fn reference_and_switch_ownership_if_necessary(
        &self,
        container_id: &str,
        previous_owner: &str,
        elements: Vec<T::InsertedElement>,
    ) -> Result<String, AlgorithmError> {
        self.reference_and_switch(container_id, previous_owner, elements, true)
            .await
    }

    async fn reference_and_switch(
        &self,
        container_id: &str,
        previous_owner: &str,
        elements: Vec<T::InsertedElement>,
        if_necessary: bool,
    ) -> Result<String, AlgorithmError> {
        let backend = self.backend.as_ref();
        let kind = self.traits.queue_kind();
        let mut queue =
            get_locked_and_fetched_queue::<T::Container>(kind, container_id, &self.agent_ref, backend).await?;
        let queue_address = queue.address().to_string();
        if if_necessary {
            self.traits
                .add_references_if_necessary(&mut queue, &elements, &self.agent_ref, backend)
                .await?;
        } else {
            self.traits
                .add_references(&mut queue, &elements, &self.agent_ref, backend)
                .await?;
        }
        // the elements are poppable from here on
        queue.release();

        let results = self
            .traits
            .switch_inserted_ownership(&elements, &queue_address, previous_owner, backend)
            .await;
        let mut switched = Vec::new();
        let mut failed = Vec::new();
        for (element, result) in elements.iter().zip(results) {
            let key = T::inserted_key(element);
            match result {
                Ok(switch) => {
                    if !switch.still_owned_by_previous && !switched.contains(&key.address) {
                        switched.push(key.address);
                    }
                }
                Err(error) => {
                    warn!(queue = %queue_address, element = %key, error = %error, "could not switch element ownership to the queue");
                    failed.push(OpFailure::new(key, error));
                }
            }
        }

        if !failed.is_empty() {
            let keys: Vec<JobKey> = failed.iter().map(OpFailure::key).collect();
            match get_locked_and_fetched_queue_no_create::<T::Container>(kind, container_id, backend).await {
                Ok(mut queue) if queue.address() == queue_address => {
                    self.traits
                        .remove_references(&mut queue, &keys, backend)
                        .await?;
                }
                Ok(_) | Err(ObjectError::NoSuchQueue { .. }) => {
                    debug!(queue = %queue_address, "queue replaced or gone, no failed references to remove");
                }
                Err(e) => return Err(e.into()),
            }
        }
        if previous_owner == self.agent_ref.address() {
            self.agent_ref
                .remove_batch_from_ownership(&switched, backend)
                .await?;
        }
        info!(
            %kind,
            container = container_id,
            queue = %queue_address,
            switched = elements.len() - failed.len(),
            failed = failed.len(),
            "referenced elements and switched ownership"
        );
        if failed.is_empty() {
            Ok(queue_address)
        } else {
            Err(OwnershipSwitchFailure {
                queue_address,
                failed,
            }
            .into())
        }
    }

    /// Pop elements from the queue for `container_id` into the agent ownership
    /// until `criteria` is met or the queue is exhausted.
    ///
    /// Elements gone or already taken by someone else are dereferenced and
    /// skipped. Any other switch failure leaves the element referenced,
    /// reports it in `unexpected_failures` and ends the pop.
    pub async fn pop_next_batch(
        &self,
        container_id: &str,
        criteria: PopCriteria,
    ) -> Result<PoppedElementsBatch<T::PoppedElement>, AlgorithmError> {
        let backend = self.backend.as_ref();
        let kind = self.traits.queue_kind();
        let mut batch = PoppedElementsBatch::default();
        let mut skip = HashSet::new();
        let mut unexpected = false;
        let mut did_trim = false;

        while !unexpected && !did_trim && self.traits.under_criteria(&batch.summary, &criteria) {
            let mut queue = match get_locked_and_fetched_queue_no_create::<T::Container>(kind, container_id, backend).await {
                Ok(queue) => queue,
                Err(ObjectError::NoSuchQueue { .. }) => break,
                Err(e) => return Err(e.into()),
            };
            let queue_address = queue.address().to_string();
            let remaining = criteria.remaining_after(&batch.summary);
            let candidates = self
                .traits
                .candidates(&queue, &remaining, &skip, backend)
                .await?;
            if candidates.is_empty() {
                queue.release();
                trim_queue_if_needed(kind, container_id, backend).await?;
                break;
            }

            let keys: Vec<JobKey> = candidates.iter().map(T::candidate_key).collect();
            let mut addresses: Vec<String> = Vec::with_capacity(keys.len());
            for key in &keys {
                if !addresses.contains(&key.address) {
                    addresses.push(key.address.clone());
                }
            }
            self.agent_ref
                .add_batch_to_ownership(&addresses, backend)
                .await?;
            let results = self
                .traits
                .switch_popped_ownership(&candidates, &queue_address, self.agent_ref.address(), backend)
                .await;

            let mut dereference = Vec::new();
            let mut kept: HashSet<String> = HashSet::new();
            let mut disown = Vec::new();
            for (key, result) in keys.into_iter().zip(results) {
                match result {
                    Ok(element) => {
                        batch.summary += T::element_summary(&element);
                        batch.elements.push(element);
                        kept.insert(key.address.clone());
                        dereference.push(key);
                    }
                    Err(e) if e.is_no_such_object() || e.is_wrong_previous_owner() => {
                        debug!(queue = %queue_address, element = %key, error = %e, "element already gone from the queue");
                        disown.push(key.address.clone());
                        dereference.push(key);
                    }
                    Err(error) => {
                        error!(queue = %queue_address, element = %key, error = %error, "unexpected failure popping element, leaving it queued");
                        skip.insert(key.clone());
                        disown.push(key.address.clone());
                        batch.unexpected_failures.push(OpFailure::new(key, error));
                        unexpected = true;
                    }
                }
            }
            // another job of the same request may have been popped this round
            disown.retain(|address| !kept.contains(address));
            disown.sort_unstable();
            disown.dedup();
            self.traits
                .remove_references(&mut queue, &dereference, backend)
                .await?;
            let now_empty = self.traits.container_summary(&queue).files == 0;
            queue.release();
            self.agent_ref
                .remove_batch_from_ownership(&disown, backend)
                .await?;
            if now_empty {
                trim_queue_if_needed(kind, container_id, backend).await?;
                if !unexpected {
                    did_trim = true;
                }
            }
        }
        info!(
            %kind,
            container = container_id,
            files = batch.summary.files,
            bytes = batch.summary.bytes,
            unexpected_failures = batch.unexpected_failures.len(),
            "popped batch"
        );
        Ok(batch)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn criteria_are_met_once_either_bound_is_reached() {
        let traits = repack::RepackQueueTraits::new(crate::objects::RepackQueueType::Pending);
        let sharded = archive::ArchiveQueueTraits::new(crate::objects::JobQueueType::JobsToTransferForUser);
        let criteria = PopCriteria::new(10, 1000);
        let popped = PoppedSummary { files: 3, bytes: 1000 };
        assert!(!sharded.under_criteria(&popped, &criteria));
        // repack queues count requests only
        assert!(traits.under_criteria(&popped, &criteria));
        assert!(!sharded.under_criteria(&PoppedSummary::default(), &PopCriteria::new(0, 0)));
    }

    #[test]
    fn remaining_criteria_saturate() {
        let criteria = PopCriteria::new(2, 100);
        let left = criteria.remaining_after(&PoppedSummary { files: 3, bytes: 40 });
        assert_eq!(left, PopCriteria::new(0, 60));
    }
}
