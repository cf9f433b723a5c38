//! Sharded job queue shared by archive and retrieve queues.
//!
//! A queue object carries the aggregate counters and an ordered list of shard
//! pointers; the job references themselves live in shard objects owned by the
//! queue and written under the queue's lock. Aggregates are checked against
//! the shard pointers before every commit and rebuilt from the shards when
//! they disagree.

use std::collections::HashSet;

use rkyv::{Archive, Deserialize as RkyvDeserialize, Serialize as RkyvSerialize};
use tracing::{debug, info, warn};

use super::value_count_map::{ValueCountMapString, ValueCountMapU64};
use super::{Object, ObjectError, ObjectPayload, QueueKind, RootEntry};
use crate::agent_reference::AgentReference;
use crate::backend::Backend;
use crate::keys::ROOT_ENTRY_ADDRESS;

pub const DEFAULT_MAX_SHARD_SIZE: u64 = 25_000;

/// Lightweight reference to one job waiting in a queue.
#[derive(Debug, Clone, PartialEq, Eq, Archive, RkyvSerialize, RkyvDeserialize)]
#[archive(check_bytes)]
pub struct QueueJobRef {
    pub address: String,
    pub copy_nb: u32,
    pub size: u64,
    /// Position on tape; zero for archive jobs.
    pub fseq: u64,
    pub priority: u64,
    pub min_request_age: u64,
    pub mount_policy: String,
    pub start_time: i64,
}

impl QueueJobRef {
    pub fn key(&self) -> JobKey {
        JobKey::new(&self.address, self.copy_nb)
    }
}

/// Identity of one queued element: the request and the job of it that is
/// queued. Two copies of one request may sit in the same queue.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct JobKey {
    pub address: String,
    pub copy_nb: u32,
}

impl JobKey {
    pub fn new(address: &str, copy_nb: u32) -> Self {
        Self {
            address: address.to_string(),
            copy_nb,
        }
    }
}

impl std::fmt::Display for JobKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}#{}", self.address, self.copy_nb)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Archive, RkyvSerialize, RkyvDeserialize)]
#[archive(check_bytes)]
pub struct ShardPointer {
    pub address: String,
    pub jobs_count: u64,
    pub bytes: u64,
    pub min_fseq: u64,
    pub max_fseq: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Archive, RkyvSerialize, RkyvDeserialize)]
#[archive(check_bytes)]
pub struct QueueData {
    /// Tape pool, VID or repack request address, depending on the queue kind.
    pub container_id: String,
    pub kind: QueueKind,
    pub shards: Vec<ShardPointer>,
    pub jobs_count: u64,
    pub bytes: u64,
    pub oldest_job_start_time: i64,
    pub youngest_job_start_time: i64,
    pub priority_map: ValueCountMapU64,
    pub min_request_age_map: ValueCountMapU64,
    pub mount_policy_map: ValueCountMapString,
    pub maps_rebuild_count: u64,
    pub max_shard_size: u64,
    /// Keep jobs sorted by fseq (retrieve) rather than in arrival order (archive).
    pub ordered_by_fseq: bool,
}

impl QueueData {
    pub fn new(container_id: &str, kind: QueueKind, ordered_by_fseq: bool) -> Self {
        Self {
            container_id: container_id.to_string(),
            kind,
            shards: Vec::new(),
            jobs_count: 0,
            bytes: 0,
            oldest_job_start_time: 0,
            youngest_job_start_time: 0,
            priority_map: ValueCountMapU64::default(),
            min_request_age_map: ValueCountMapU64::default(),
            mount_policy_map: ValueCountMapString::default(),
            maps_rebuild_count: 0,
            max_shard_size: DEFAULT_MAX_SHARD_SIZE,
            ordered_by_fseq,
        }
    }

    fn account_added(&mut self, job: &QueueJobRef) {
        if self.jobs_count == 0 || job.start_time < self.oldest_job_start_time {
            self.oldest_job_start_time = job.start_time;
        }
        if self.jobs_count == 0 || job.start_time > self.youngest_job_start_time {
            self.youngest_job_start_time = job.start_time;
        }
        self.jobs_count += 1;
        self.bytes += job.size;
        self.priority_map.inc(job.priority);
        self.min_request_age_map.inc(job.min_request_age);
        self.mount_policy_map.inc(&job.mount_policy);
    }

    fn account_removed(&mut self, job: &QueueJobRef) {
        self.jobs_count = self.jobs_count.saturating_sub(1);
        self.bytes = self.bytes.saturating_sub(job.size);
        self.priority_map.dec(job.priority);
        self.min_request_age_map.dec(job.min_request_age);
        self.mount_policy_map.dec(&job.mount_policy);
        if self.jobs_count == 0 {
            self.oldest_job_start_time = 0;
            self.youngest_job_start_time = 0;
        }
    }

    /// Aggregates agree with the shard pointers and with each other.
    pub fn is_coherent(&self) -> bool {
        let pointer_jobs: u64 = self.shards.iter().map(|s| s.jobs_count).sum();
        let pointer_bytes: u64 = self.shards.iter().map(|s| s.bytes).sum();
        pointer_jobs == self.jobs_count
            && pointer_bytes == self.bytes
            && self.priority_map.total() == self.jobs_count
            && self.min_request_age_map.total() == self.jobs_count
            && self.mount_policy_map.total() == self.jobs_count
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Archive, RkyvSerialize, RkyvDeserialize)]
#[archive(check_bytes)]
pub struct ShardData {
    pub jobs: Vec<QueueJobRef>,
}

impl ShardData {
    fn pointer_for(&self, address: &str) -> ShardPointer {
        ShardPointer {
            address: address.to_string(),
            jobs_count: self.jobs.len() as u64,
            bytes: self.jobs.iter().map(|j| j.size).sum(),
            min_fseq: self.jobs.iter().map(|j| j.fseq).min().unwrap_or(0),
            max_fseq: self.jobs.iter().map(|j| j.fseq).max().unwrap_or(0),
        }
    }

    fn insert(&mut self, job: QueueJobRef, ordered_by_fseq: bool) {
        if ordered_by_fseq {
            let pos = self.jobs.partition_point(|j| j.fseq <= job.fseq);
            self.jobs.insert(pos, job);
        } else {
            self.jobs.push(job);
        }
    }
}

/// Counters describing a queue, as used by mount decisions and logs.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct JobsSummary {
    pub jobs: u64,
    pub bytes: u64,
    pub oldest_job_start_time: i64,
    pub youngest_job_start_time: i64,
    /// Highest priority among queued jobs.
    pub priority: u64,
    /// Smallest minimum request age among queued jobs.
    pub min_request_age: u64,
    pub mount_policy_counts: Vec<(String, u64)>,
}

#[derive(Debug, Clone, Default)]
pub struct CandidateJobList {
    pub candidates: Vec<QueueJobRef>,
    pub candidate_files: u64,
    pub candidate_bytes: u64,
    pub remaining_files_after_candidates: u64,
    pub remaining_bytes_after_candidates: u64,
}

/// Payload of a sharded queue object.
pub trait QueuePayload: ObjectPayload {
    type Shard: ShardPayload;

    fn new_queue(container_id: &str, kind: QueueKind) -> Self;

    fn queue(&self) -> &QueueData;

    fn queue_mut(&mut self) -> &mut QueueData;

    fn shard_prefix(container_id: &str) -> String;
}

/// Payload of one shard of a sharded queue.
pub trait ShardPayload: ObjectPayload {
    fn new_shard() -> Self;

    fn shard(&self) -> &ShardData;

    fn shard_mut(&mut self) -> &mut ShardData;
}

impl<P: QueuePayload> Object<P> {
    pub fn container_id(&self) -> &str {
        &self.payload().queue().container_id
    }

    pub fn queue_kind(&self) -> QueueKind {
        self.payload().queue().kind
    }

    pub fn is_empty(&self) -> bool {
        let q = self.payload().queue();
        q.shards.is_empty() && q.jobs_count == 0
    }

    pub fn set_max_shard_size(&mut self, max_shard_size: u64) {
        self.payload_mut().queue_mut().max_shard_size = max_shard_size.max(1);
    }

    pub fn shard_count(&self) -> usize {
        self.payload().queue().shards.len()
    }

    pub fn maps_rebuild_count(&self) -> u64 {
        self.payload().queue().maps_rebuild_count
    }

    pub fn summary(&self) -> JobsSummary {
        let q = self.payload().queue();
        JobsSummary {
            jobs: q.jobs_count,
            bytes: q.bytes,
            oldest_job_start_time: q.oldest_job_start_time,
            youngest_job_start_time: q.youngest_job_start_time,
            priority: q.priority_map.max_value().unwrap_or(0),
            min_request_age: q.min_request_age_map.min_value().unwrap_or(0),
            mount_policy_counts: q.mount_policy_map.counts(),
        }
    }

    async fn load_shard(
        &self,
        backend: &dyn Backend,
        address: &str,
    ) -> Result<Option<Object<P::Shard>>, ObjectError> {
        match Object::<P::Shard>::fetch_no_lock(backend, address).await {
            Ok(shard) => Ok(Some(shard)),
            Err(e) if e.is_no_such_object() => {
                warn!(queue = %self.address(), shard = %address, "queue shard is missing");
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    /// Where a new job goes: index of an existing shard with room, or the index
    /// at which a new shard has to be created.
    fn plan_slot(&self, shards: &[ShardPointer], job: &QueueJobRef) -> (usize, bool) {
        let q = self.payload().queue();
        if shards.is_empty() {
            return (0, true);
        }
        let target = if q.ordered_by_fseq {
            shards
                .iter()
                .position(|s| job.fseq <= s.max_fseq)
                .unwrap_or(shards.len() - 1)
        } else {
            shards.len() - 1
        };
        if shards[target].jobs_count < q.max_shard_size {
            (target, false)
        } else if q.ordered_by_fseq && job.fseq < shards[target].min_fseq {
            (target, true)
        } else {
            (target + 1, true)
        }
    }

    /// Reference `jobs` from this queue, creating shards as needed, then commit.
    pub async fn add_jobs_and_commit(
        &mut self,
        jobs: Vec<QueueJobRef>,
        agent_ref: &AgentReference,
        backend: &dyn Backend,
    ) -> Result<(), ObjectError> {
        self.ensure_exclusive()?;
        if jobs.is_empty() {
            return Ok(());
        }
        let ordered = self.payload().queue().ordered_by_fseq;
        let mut pointers = self.payload().queue().shards.clone();
        let mut loaded: Vec<Option<Object<P::Shard>>> = pointers.iter().map(|_| None).collect();
        let mut created: Vec<bool> = vec![false; pointers.len()];

        for job in jobs {
            let (index, new_shard) = self.plan_slot(&pointers, &job);
            if new_shard {
                let address = agent_ref.next_id(&P::shard_prefix(self.container_id()));
                let mut shard = Object::new(address.clone(), P::Shard::new_shard());
                shard.set_owner(self.address());
                pointers.insert(
                    index,
                    ShardPointer {
                        address,
                        jobs_count: 0,
                        bytes: 0,
                        min_fseq: job.fseq,
                        max_fseq: job.fseq,
                    },
                );
                loaded.insert(index, Some(shard));
                created.insert(index, true);
            } else if loaded[index].is_none() {
                let address = pointers[index].address.clone();
                match self.load_shard(backend, &address).await? {
                    Some(shard) => loaded[index] = Some(shard),
                    None => {
                        // recreate the lost shard in place, rebuild will reconcile the counters
                        let mut shard = Object::new(address, P::Shard::new_shard());
                        shard.set_owner(self.address());
                        loaded[index] = Some(shard);
                        created[index] = true;
                    }
                }
            }
            let Some(shard) = loaded[index].as_mut() else {
                return Err(ObjectError::Inconsistent {
                    address: self.address().to_string(),
                    reason: "shard planned but not loaded".to_string(),
                });
            };
            self.payload_mut().queue_mut().account_added(&job);
            shard.payload_mut().shard_mut().insert(job, ordered);
            pointers[index] = shard.payload().shard().pointer_for(shard.address());
        }

        for (shard, is_new) in loaded.iter().zip(created.iter()) {
            match (shard, is_new) {
                (Some(shard), true) => shard.insert(backend).await?,
                (Some(shard), false) => shard.commit_as_sub_object(backend).await?,
                (None, _) => {}
            }
        }
        self.payload_mut().queue_mut().shards = pointers;
        self.check_and_commit(backend).await
    }

    /// Like [`add_jobs_and_commit`](Self::add_jobs_and_commit) but skips jobs already referenced.
    pub async fn add_jobs_if_necessary_and_commit(
        &mut self,
        jobs: Vec<QueueJobRef>,
        agent_ref: &AgentReference,
        backend: &dyn Backend,
    ) -> Result<(), ObjectError> {
        let present: HashSet<JobKey> = self
            .dump_jobs(backend)
            .await?
            .iter()
            .map(QueueJobRef::key)
            .collect();
        let missing: Vec<QueueJobRef> = jobs
            .into_iter()
            .filter(|j| !present.contains(&j.key()))
            .collect();
        if missing.is_empty() {
            return Ok(());
        }
        self.add_jobs_and_commit(missing, agent_ref, backend).await
    }

    /// Drop the references to the jobs in `keys`, leaving other jobs of the
    /// same requests queued. Shards left empty are deleted after the queue
    /// commit so the queue never points at a missing shard.
    pub async fn remove_jobs_and_commit(
        &mut self,
        keys: &[JobKey],
        backend: &dyn Backend,
    ) -> Result<(), ObjectError> {
        self.ensure_exclusive()?;
        let mut to_remove: HashSet<JobKey> = keys.iter().cloned().collect();
        let mut pointers = self.payload().queue().shards.clone();
        let mut emptied: Vec<Object<P::Shard>> = Vec::new();
        let mut index = 0;
        while index < pointers.len() && !to_remove.is_empty() {
            let address = pointers[index].address.clone();
            let Some(mut shard) = self.load_shard(backend, &address).await? else {
                index += 1;
                continue;
            };
            let mut removed = Vec::new();
            shard.payload_mut().shard_mut().jobs.retain(|j| {
                if to_remove.contains(&j.key()) {
                    removed.push(j.clone());
                    false
                } else {
                    true
                }
            });
            if removed.is_empty() {
                index += 1;
                continue;
            }
            for job in &removed {
                to_remove.remove(&job.key());
                self.payload_mut().queue_mut().account_removed(job);
            }
            if shard.payload().shard().jobs.is_empty() {
                pointers.remove(index);
                emptied.push(shard);
            } else {
                shard.commit_as_sub_object(backend).await?;
                pointers[index] = shard.payload().shard().pointer_for(&address);
                index += 1;
            }
        }
        self.payload_mut().queue_mut().shards = pointers;
        self.check_and_commit(backend).await?;
        for shard in emptied {
            let address = shard.address().to_string();
            if let Err(e) = shard.remove_as_sub_object(backend).await {
                warn!(queue = %self.address(), shard = %address, error = %e, "could not delete emptied shard");
            }
        }
        Ok(())
    }

    /// Every job referenced by the queue, shard by shard.
    pub async fn dump_jobs(&self, backend: &dyn Backend) -> Result<Vec<QueueJobRef>, ObjectError> {
        let mut jobs = Vec::new();
        for pointer in &self.payload().queue().shards {
            if let Some(shard) = self.load_shard(backend, &pointer.address).await? {
                jobs.extend(shard.payload().shard().jobs.iter().cloned());
            }
        }
        Ok(jobs)
    }

    /// Front-to-back scan for up to `max_files` / `max_bytes` jobs, ignoring `skip`.
    pub async fn candidate_list(
        &self,
        max_bytes: u64,
        max_files: u64,
        skip: &HashSet<JobKey>,
        backend: &dyn Backend,
    ) -> Result<CandidateJobList, ObjectError> {
        let mut ret = CandidateJobList::default();
        for pointer in &self.payload().queue().shards {
            if !(ret.candidate_bytes < max_bytes && ret.candidate_files < max_files) {
                ret.remaining_files_after_candidates += pointer.jobs_count;
                ret.remaining_bytes_after_candidates += pointer.bytes;
                continue;
            }
            let Some(shard) = self.load_shard(backend, &pointer.address).await? else {
                continue;
            };
            for job in &shard.payload().shard().jobs {
                let full = !(ret.candidate_bytes < max_bytes && ret.candidate_files < max_files);
                if full || skip.contains(&job.key()) {
                    ret.remaining_files_after_candidates += 1;
                    ret.remaining_bytes_after_candidates += job.size;
                    continue;
                }
                ret.candidate_files += 1;
                ret.candidate_bytes += job.size;
                ret.candidates.push(job.clone());
            }
        }
        Ok(ret)
    }

    /// Recompute pointers and aggregates from the shard contents. Returns true
    /// when the stored aggregates were wrong.
    pub async fn rebuild(&mut self, backend: &dyn Backend) -> Result<bool, ObjectError> {
        let pointers = self.payload().queue().shards.clone();
        let mut rebuilt = QueueData {
            shards: Vec::with_capacity(pointers.len()),
            jobs_count: 0,
            bytes: 0,
            oldest_job_start_time: 0,
            youngest_job_start_time: 0,
            priority_map: ValueCountMapU64::default(),
            min_request_age_map: ValueCountMapU64::default(),
            mount_policy_map: ValueCountMapString::default(),
            ..self.payload().queue().clone()
        };
        for pointer in &pointers {
            let Some(shard) = self.load_shard(backend, &pointer.address).await? else {
                continue;
            };
            let data = shard.payload().shard();
            if data.jobs.is_empty() {
                continue;
            }
            for job in &data.jobs {
                rebuilt.account_added(job);
            }
            rebuilt.shards.push(data.pointer_for(&pointer.address));
        }
        rebuilt.maps_rebuild_count += 1;
        let current = self.payload().queue();
        let changed = current.jobs_count != rebuilt.jobs_count
            || current.bytes != rebuilt.bytes
            || current.shards != rebuilt.shards;
        *self.payload_mut().queue_mut() = rebuilt;
        Ok(changed)
    }

    async fn check_and_commit(&mut self, backend: &dyn Backend) -> Result<(), ObjectError> {
        if !self.payload().queue().is_coherent() {
            let changed = self.rebuild(backend).await?;
            warn!(
                queue = %self.address(),
                changed,
                "queue aggregates disagreed with shards, rebuilt"
            );
        }
        self.commit(backend).await
    }

    /// Garbage collection of a queue left owned by a dead agent (it was being
    /// created when the agent died): hand it to the root entry if referenced,
    /// otherwise delete it when empty.
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
        let referenced = root.queue_address(self.queue_kind(), self.container_id()).as_deref()
            == Some(self.address());
        if referenced {
            self.set_owner(ROOT_ENTRY_ADDRESS);
            self.commit(backend).await?;
            info!(queue = %self.address(), "re-owned queue to the root entry");
        } else if self.is_empty() {
            let address = self.address().to_string();
            self.remove(backend).await?;
            info!(queue = %address, "deleted unreferenced empty queue");
        } else {
            warn!(queue = %self.address(), "unreferenced queue still holds jobs, leaving it in place");
        }
        Ok(())
    }
}
