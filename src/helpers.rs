//! Queue lookup, creation and trimming shared by the algorithms and the
//! scheduler database, plus retrieve destination selection.

use std::collections::{BTreeSet, HashMap};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use thiserror::Error;
use tracing::{debug, info, warn};

use crate::agent_reference::AgentReference;
use crate::backend::Backend;
use crate::catalogue::{Catalogue, CatalogueError, TapeState};
use crate::keys::ROOT_ENTRY_ADDRESS;
use crate::objects::{
    JobQueueType, Object, ObjectError, ObjectPayload, QueueKind, RetrieveQueue, RootEntry,
};

/// Attempts at locking a queue that keeps disappearing under us.
const MAX_QUEUE_LOCK_ATTEMPTS: usize = 5;

/// Lock and fetch the queue for (kind, key), creating it if needed.
///
/// The root entry is read without a lock first; it is only locked when the
/// queue has to be created. A queue deleted between lookup and lock is
/// dereferenced and the lookup retried.
pub async fn get_locked_and_fetched_queue<P: ObjectPayload>(
    kind: QueueKind,
    key: &str,
    agent_ref: &AgentReference,
    backend: &dyn Backend,
) -> Result<Object<P>, ObjectError> {
    let mut attempt = 0;
    loop {
        attempt += 1;
        let root = RootEntry::fetch_no_lock(backend, ROOT_ENTRY_ADDRESS).await?;
        let address = match root.queue_address(kind, key) {
            Some(address) => address,
            None => {
                let mut root = RootEntry::lock_and_fetch(backend, ROOT_ENTRY_ADDRESS).await?;
                let address = root
                    .add_or_get_queue_and_commit(kind, key, agent_ref, backend)
                    .await?;
                root.release();
                address
            }
        };
        match Object::<P>::lock_and_fetch(backend, &address).await {
            Ok(queue) => return Ok(queue),
            Err(e) if e.is_no_such_object() && attempt < MAX_QUEUE_LOCK_ATTEMPTS => {
                warn!(%kind, key, queue = %address, attempt, "queue vanished before it could be locked, retrying");
                let mut root = RootEntry::lock_and_fetch(backend, ROOT_ENTRY_ADDRESS).await?;
                root.dereference_missing_queue_and_commit(kind, key, &address, backend)
                    .await?;
            }
            Err(e) => return Err(e),
        }
    }
}

/// Like [`get_locked_and_fetched_queue`] but never creates the queue: a
/// missing queue yields [`ObjectError::NoSuchQueue`].
pub async fn get_locked_and_fetched_queue_no_create<P: ObjectPayload>(
    kind: QueueKind,
    key: &str,
    backend: &dyn Backend,
) -> Result<Object<P>, ObjectError> {
    let no_such_queue = || ObjectError::NoSuchQueue {
        kind,
        key: key.to_string(),
    };
    let mut attempt = 0;
    loop {
        attempt += 1;
        let root = RootEntry::fetch_no_lock(backend, ROOT_ENTRY_ADDRESS).await?;
        let Some(address) = root.queue_address(kind, key) else {
            return Err(no_such_queue());
        };
        match Object::<P>::lock_and_fetch(backend, &address).await {
            Ok(queue) => return Ok(queue),
            Err(e) if e.is_no_such_object() => {
                debug!(%kind, key, queue = %address, "queue referenced but missing, dereferencing it");
                let mut root = RootEntry::lock_and_fetch(backend, ROOT_ENTRY_ADDRESS).await?;
                root.dereference_missing_queue_and_commit(kind, key, &address, backend)
                    .await?;
                if attempt >= MAX_QUEUE_LOCK_ATTEMPTS {
                    return Err(no_such_queue());
                }
            }
            Err(e) => return Err(e),
        }
    }
}

/// Delete the queue for (kind, key) if it is empty. The emptiness is checked
/// again under the root entry lock, so a queue refilled meanwhile survives.
/// Returns true when the queue was removed.
pub async fn trim_queue_if_needed(
    kind: QueueKind,
    key: &str,
    backend: &dyn Backend,
) -> Result<bool, ObjectError> {
    if !kind.is_trimmable() {
        return Ok(false);
    }
    let mut root = RootEntry::lock_and_fetch(backend, ROOT_ENTRY_ADDRESS).await?;
    match root.remove_queue_and_commit(kind, key, backend).await {
        Ok(()) => {
            info!(%kind, key, "trimmed empty queue");
            Ok(true)
        }
        Err(ObjectError::QueueNotEmpty(address)) => {
            debug!(%kind, key, queue = %address, "queue refilled, not trimming");
            Ok(false)
        }
        Err(ObjectError::NoSuchQueue { .. }) => Ok(false),
        Err(e) => Err(e),
    }
}

#[derive(Debug, Error)]
pub enum QueueSelectionError {
    #[error("no tape available to retrieve from among {0:?}")]
    NoTapeAvailable(Vec<String>),
    #[error(transparent)]
    Catalogue(#[from] CatalogueError),
    #[error(transparent)]
    Object(#[from] ObjectError),
}

/// Load of the user transfer queue of one VID.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RetrieveQueueStatistics {
    pub vid: String,
    pub files_queued: u64,
    pub bytes_queued: u64,
    pub current_priority: u64,
}

impl RetrieveQueueStatistics {
    /// Higher priority first, then the fuller queue (its mount is better amortized).
    fn rank(&self) -> (u64, u64, u64) {
        (self.current_priority, self.files_queued, self.bytes_queued)
    }
}

#[derive(Debug, Clone)]
struct CachedStatistics {
    stats: RetrieveQueueStatistics,
    tape_state: TapeState,
    updated_at: Instant,
}

/// Per-VID queue statistics and tape state, refreshed once older than `max_age`.
pub struct RetrieveQueueStatsCache {
    max_age: Duration,
    entries: Mutex<HashMap<String, CachedStatistics>>,
}

impl RetrieveQueueStatsCache {
    pub fn new(max_age: Duration) -> Self {
        Self {
            max_age,
            entries: Mutex::new(HashMap::new()),
        }
    }

    fn fresh(&self, vid: &str) -> Option<CachedStatistics> {
        let entries = self.entries.lock().unwrap();
        entries
            .get(vid)
            .filter(|e| e.updated_at.elapsed() <= self.max_age)
            .cloned()
    }

    /// Record new counters for a VID after enqueueing to it. Only VIDs whose
    /// tape state is already cached are updated; the refresh time is kept.
    pub fn update(&self, vid: &str, files_queued: u64, bytes_queued: u64, current_priority: u64) {
        let mut entries = self.entries.lock().unwrap();
        if let Some(entry) = entries.get_mut(vid) {
            entry.stats = RetrieveQueueStatistics {
                vid: vid.to_string(),
                files_queued,
                bytes_queued,
                current_priority,
            };
        }
    }

    pub fn invalidate(&self, vid: &str) {
        self.entries.lock().unwrap().remove(vid);
    }

    pub fn clear(&self) {
        self.entries.lock().unwrap().clear();
    }

    async fn refresh(
        &self,
        vids: &[String],
        catalogue: &dyn Catalogue,
        backend: &dyn Backend,
    ) -> Result<(), QueueSelectionError> {
        let states = catalogue.tape_states(vids).await?;
        let root = RootEntry::fetch_no_lock(backend, ROOT_ENTRY_ADDRESS).await?;
        for vid in vids {
            let Some(tape_state) = states.get(vid).copied() else {
                warn!(vid = %vid, "tape unknown to the catalogue, not a retrieve candidate");
                continue;
            };
            let stats = queue_statistics(&root, vid, backend).await?;
            debug!(vid = %vid, ?tape_state, files = stats.files_queued, "refreshed retrieve queue statistics");
            self.entries.lock().unwrap().insert(
                vid.clone(),
                CachedStatistics {
                    stats,
                    tape_state,
                    updated_at: Instant::now(),
                },
            );
        }
        Ok(())
    }
}

async fn queue_statistics(
    root: &RootEntry,
    vid: &str,
    backend: &dyn Backend,
) -> Result<RetrieveQueueStatistics, ObjectError> {
    let mut stats = RetrieveQueueStatistics {
        vid: vid.to_string(),
        ..Default::default()
    };
    let kind = QueueKind::Retrieve(JobQueueType::JobsToTransferForUser);
    let Some(address) = root.queue_address(kind, vid) else {
        return Ok(stats);
    };
    match RetrieveQueue::fetch_no_lock(backend, &address).await {
        Ok(queue) => {
            let summary = queue.summary();
            stats.files_queued = summary.jobs;
            stats.bytes_queued = summary.bytes;
            stats.current_priority = summary.priority;
            Ok(stats)
        }
        Err(e) if e.is_no_such_object() => Ok(stats),
        Err(e) => Err(e),
    }
}

/// Pick the VID to retrieve from among `candidates`.
///
/// Active tapes are preferred and disabled ones used only when no active tape
/// is left; repack retrieves only read tapes being repacked. Among the best
/// ranked tapes the choice rotates daily so equivalent tapes share the load.
pub async fn select_best_retrieve_queue(
    candidates: &BTreeSet<String>,
    catalogue: &dyn Catalogue,
    cache: &RetrieveQueueStatsCache,
    backend: &dyn Backend,
    is_repack: bool,
) -> Result<String, QueueSelectionError> {
    let stale: Vec<String> = candidates
        .iter()
        .filter(|vid| cache.fresh(vid).is_none())
        .cloned()
        .collect();
    if !stale.is_empty() {
        cache.refresh(&stale, catalogue, backend).await?;
    }

    let mut preferred = Vec::new();
    let mut fallback = Vec::new();
    for vid in candidates {
        let Some(entry) = cache.fresh(vid) else {
            continue;
        };
        match (entry.tape_state, is_repack) {
            (TapeState::Active, false) | (TapeState::Repacking, true) => preferred.push(entry.stats),
            (TapeState::Disabled, false) => fallback.push(entry.stats),
            _ => {}
        }
    }
    if preferred.is_empty() {
        preferred = fallback;
    }
    let Some(best_rank) = preferred.iter().map(|s| s.rank()).max() else {
        return Err(QueueSelectionError::NoTapeAvailable(
            candidates.iter().cloned().collect(),
        ));
    };
    let mut best: Vec<String> = preferred
        .into_iter()
        .filter(|s| s.rank() == best_rank)
        .map(|s| s.vid)
        .collect();
    best.sort();
    let days_since_epoch = chrono::Utc::now().timestamp().max(0) as usize / 86_400;
    Ok(best.swap_remove(days_since_epoch % best.len()))
}
