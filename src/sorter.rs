//! Groups jobs to requeue by destination so each queue is locked once.
//!
//! Callers insert jobs, get a [`SortPromise`] per job, flush, then wait on
//! the promises. Jobs whose request vanished meanwhile resolve to
//! [`SortOutcome::Vanished`] instead of an error.

use std::collections::BTreeMap;
use std::sync::Arc;

use tokio::sync::oneshot;
use tracing::{debug, warn};

use crate::agent_reference::AgentReference;
use crate::algorithms::archive::{ArchiveJobToQueue, ArchiveQueueTraits};
use crate::algorithms::retrieve::{RetrieveQueueTraits, RetrieveRequestToQueue};
use crate::algorithms::{AlgorithmError, ContainerAlgorithms, ContainerTraits, JobKey};
use crate::backend::Backend;
use crate::objects::{JobQueueType, ObjectError};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SortOutcome {
    Queued { queue_address: String },
    /// The request no longer exists.
    Vanished,
}

type SortResult = Result<SortOutcome, ObjectError>;

pub struct SortPromise(oneshot::Receiver<SortResult>);

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
struct GroupKey {
    container: String,
    queue_type: JobQueueType,
    previous_owner: String,
}

struct Sorted<E> {
    element: E,
    reply: oneshot::Sender<SortResult>,
}

pub struct Sorter {
    backend: Arc<dyn Backend>,
    agent_ref: Arc<AgentReference>,
    archive: BTreeMap<GroupKey, Vec<Sorted<ArchiveJobToQueue>>>,
    retrieve: BTreeMap<GroupKey, Vec<Sorted<RetrieveRequestToQueue>>>,
}

impl Sorter {
    pub fn new(backend: Arc<dyn Backend>, agent_ref: Arc<AgentReference>) -> Self {
        Self {
            backend,
            agent_ref,
            archive: BTreeMap::new(),
            retrieve: BTreeMap::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.archive.is_empty() && self.retrieve.is_empty()
    }

    pub fn insert_archive_job(
        &mut self,
        container: &str,
        queue_type: JobQueueType,
        previous_owner: &str,
        element: ArchiveJobToQueue,
    ) -> SortPromise {
        let (reply, promise) = oneshot::channel();
        self.archive
            .entry(GroupKey {
                container: container.to_string(),
                queue_type,
                previous_owner: previous_owner.to_string(),
            })
            .or_default()
            .push(Sorted { element, reply });
        SortPromise(promise)
    }

    pub fn insert_retrieve_request(
        &mut self,
        container: &str,
        queue_type: JobQueueType,
        previous_owner: &str,
        element: RetrieveRequestToQueue,
    ) -> SortPromise {
        let (reply, promise) = oneshot::channel();
        self.retrieve
            .entry(GroupKey {
                container: container.to_string(),
                queue_type,
                previous_owner: previous_owner.to_string(),
            })
            .or_default()
            .push(Sorted { element, reply });
        SortPromise(promise)
    }

    /// Queue one group. Returns false when there was nothing left to flush.
    pub async fn flush_one(&mut self) -> bool {
        if let Some((key, group)) = self.archive.pop_first() {
            let algorithms = ContainerAlgorithms::new(
                self.backend.clone(),
                self.agent_ref.clone(),
                ArchiveQueueTraits::new(key.queue_type),
            );
            self.flush_group(&algorithms, key, group).await;
            return true;
        }
        if let Some((key, group)) = self.retrieve.pop_first() {
            let algorithms = ContainerAlgorithms::new(
                self.backend.clone(),
                self.agent_ref.clone(),
                RetrieveQueueTraits::new(key.queue_type),
            );
            self.flush_group(&algorithms, key, group).await;
            return true;
        }
        false
    }

    pub async fn flush_all(&mut self) {
        while self.flush_one().await {}
    }

    pub async fn wait(promise: SortPromise) -> SortResult {
        promise.0.await.unwrap_or_else(|_| {
            Err(ObjectError::Inconsistent {
                address: String::new(),
                reason: "sorter dropped before flushing".to_string(),
            })
        })
    }

    async fn flush_group<T>(&self, algorithms: &ContainerAlgorithms<T>, key: GroupKey, group: Vec<Sorted<T::InsertedElement>>)
    where
        T: ContainerTraits,
    {
        let (elements, replies): (Vec<_>, Vec<_>) = group.into_iter().map(|s| (s.element, s.reply)).unzip();
        let keys: Vec<JobKey> = elements.iter().map(T::inserted_key).collect();
        let result = if key.previous_owner == self.agent_ref.address() {
            algorithms
                .reference_and_switch_ownership(&key.container, &key.previous_owner, elements)
                .await
        } else {
            algorithms
                .reference_and_switch_ownership_if_necessary(&key.container, &key.previous_owner, elements)
                .await
        };
        debug!(container = %key.container, queue_type = ?key.queue_type, jobs = keys.len(), ok = result.is_ok(), "flushed sorter group");
        match result {
            Ok(queue_address) => {
                for reply in replies {
                    let _ = reply.send(Ok(SortOutcome::Queued {
                        queue_address: queue_address.clone(),
                    }));
                }
            }
            Err(AlgorithmError::OwnershipSwitch(failure)) => {
                for (key, reply) in keys.iter().zip(replies) {
                    let outcome = match failure.failed.iter().find(|f| &f.key() == key) {
                        None => Ok(SortOutcome::Queued {
                            queue_address: failure.queue_address.clone(),
                        }),
                        Some(f) if f.error.is_no_such_object() => {
                            warn!(element = %key, "request vanished while being queued");
                            Ok(SortOutcome::Vanished)
                        }
                        Some(f) => Err(f.error.clone()),
                    };
                    let _ = reply.send(outcome);
                }
            }
            Err(AlgorithmError::Object(e)) => {
                for reply in replies {
                    let _ = reply.send(Err(e.clone()));
                }
            }
        }
    }
}
