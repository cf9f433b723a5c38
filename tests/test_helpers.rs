#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use ostoredb::agent_reference::AgentReference;
use ostoredb::algorithms::archive::ArchiveJobToQueue;
use ostoredb::backend::{self, Backend, BackendError, MemoryBackend, ObjectLock};
use ostoredb::catalogue::{InMemoryCatalogue, TapeState};
use ostoredb::garbage_collector::GcContext;
use ostoredb::helpers::RetrieveQueueStatsCache;
use ostoredb::objects::{
    ArchiveFile, ArchiveRequest, ArchiveRequestData, MountPolicy, Requester, RetrieveRequest, RetrieveRequestData,
    TapeFile,
};
use ostoredb::retry::RetryLimits;
use ostoredb::scheduler_db::{ArchiveSubmission, OStoreDb, RetrieveSubmission};
use ostoredb::settings::{AgentConfig, BackendConfig, BackendKind, SchedulerConfig};

// Helper: enforce a tight timeout for async tests likely to hang
#[macro_export]
macro_rules! with_timeout {
    ($ms:expr, $body:block) => {{
        tokio::time::timeout(std::time::Duration::from_millis($ms), async move { $body })
            .await
            .expect("test timed out")
    }};
}

pub const TAPE_POOL: &str = "TapePool0";

pub fn memory_backend() -> Arc<dyn Backend> {
    MemoryBackend::new()
}

/// Memory backend that counts overwrites per address and can slow down or
/// fail the overwrites of one address.
pub struct InstrumentedBackend {
    inner: Arc<dyn Backend>,
    overwrites: Mutex<HashMap<String, usize>>,
    slow: Mutex<Option<(String, Duration)>>,
    failing: Mutex<Option<String>>,
}

impl InstrumentedBackend {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: MemoryBackend::new(),
            overwrites: Mutex::new(HashMap::new()),
            slow: Mutex::new(None),
            failing: Mutex::new(None),
        })
    }

    pub fn overwrites_of(&self, address: &str) -> usize {
        self.overwrites.lock().unwrap().get(address).copied().unwrap_or(0)
    }

    /// Delay every overwrite of an address starting with `prefix`.
    pub fn slow_down(&self, prefix: &str, delay: Duration) {
        *self.slow.lock().unwrap() = Some((prefix.to_string(), delay));
    }

    pub fn fail_overwrites_of(&self, address: Option<&str>) {
        *self.failing.lock().unwrap() = address.map(str::to_string);
    }
}

#[async_trait]
impl Backend for InstrumentedBackend {
    async fn create(&self, address: &str, content: Bytes) -> Result<(), BackendError> {
        self.inner.create(address, content).await
    }

    async fn read(&self, address: &str) -> Result<Bytes, BackendError> {
        self.inner.read(address).await
    }

    async fn overwrite(&self, address: &str, content: Bytes) -> Result<(), BackendError> {
        *self.overwrites.lock().unwrap().entry(address.to_string()).or_default() += 1;
        let delay = match self.slow.lock().unwrap().as_ref() {
            Some((prefix, delay)) if address.starts_with(prefix.as_str()) => Some(*delay),
            _ => None,
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if self.failing.lock().unwrap().as_deref() == Some(address) {
            return Err(BackendError::Storage(format!("injected failure writing {address}")));
        }
        self.inner.overwrite(address, content).await
    }

    async fn remove(&self, address: &str) -> Result<(), BackendError> {
        self.inner.remove(address).await
    }

    async fn exists(&self, address: &str) -> Result<bool, BackendError> {
        self.inner.exists(address).await
    }

    async fn list(&self) -> Result<Vec<String>, BackendError> {
        self.inner.list().await
    }

    async fn lock_exclusive(&self, address: &str) -> Result<ObjectLock, BackendError> {
        self.inner.lock_exclusive(address).await
    }

    async fn lock_shared(&self, address: &str) -> Result<ObjectLock, BackendError> {
        self.inner.lock_shared(address).await
    }

    fn describe(&self) -> String {
        format!("instrumented {}", self.inner.describe())
    }
}

/// SlateDB backend on a fresh local directory, flushed often.
pub async fn open_temp_backend() -> (tempfile::TempDir, Arc<dyn Backend>) {
    let tmp = tempfile::tempdir().unwrap();
    let cfg = BackendConfig {
        kind: BackendKind::Fs,
        path: tmp.path().to_string_lossy().to_string(),
        lock_timeout_ms: Some(5_000),
        flush_interval_ms: Some(10),
    };
    let backend = backend::open(&cfg).await.expect("open backend");
    (tmp, backend)
}

/// A registered agent, as a process would have one.
pub async fn registered_agent(backend: &dyn Backend, name: &str, timeout_ms: u64) -> Arc<AgentReference> {
    let agent_ref = Arc::new(AgentReference::new(name, "testhost"));
    agent_ref
        .register(backend, "test agent", timeout_ms)
        .await
        .expect("register agent");
    agent_ref
}

pub fn gc_context(
    backend: Arc<dyn Backend>,
    agent_ref: Arc<AgentReference>,
    catalogue: Arc<InMemoryCatalogue>,
) -> GcContext {
    GcContext {
        agent_ref,
        backend,
        catalogue,
        stats_cache: Arc::new(RetrieveQueueStatsCache::new(std::time::Duration::from_secs(10))),
    }
}

/// Catalogue knowing tapes V1, V2 and V3, all active.
pub fn catalogue() -> Arc<InMemoryCatalogue> {
    let catalogue = Arc::new(InMemoryCatalogue::new());
    for vid in ["V1", "V2", "V3"] {
        catalogue.set_tape_state(vid, TapeState::Active);
    }
    catalogue
}

pub fn test_scheduler_config() -> SchedulerConfig {
    SchedulerConfig {
        enqueue_workers: 2,
        ..SchedulerConfig::default()
    }
}

pub async fn open_db(backend: Arc<dyn Backend>) -> (OStoreDb, Arc<InMemoryCatalogue>) {
    let catalogue = catalogue();
    let agent_ref = Arc::new(AgentReference::new("ostoredb-test", "testhost"));
    let db = OStoreDb::new(
        backend,
        catalogue.clone(),
        agent_ref,
        test_scheduler_config(),
        &AgentConfig::default(),
    )
    .await
    .expect("open scheduler db");
    (db, catalogue)
}

pub fn archive_file(id: u64, size: u64) -> ArchiveFile {
    ArchiveFile {
        archive_file_id: id,
        disk_instance: "eosdev".to_string(),
        disk_file_id: format!("disk-{id}"),
        size,
        checksum: format!("adler32:{id:08x}"),
        storage_class: "single".to_string(),
        tape_files: Vec::new(),
    }
}

pub fn mount_policy() -> MountPolicy {
    MountPolicy {
        name: "default".to_string(),
        priority: 10,
        min_request_age: 60,
    }
}

pub fn requester() -> Requester {
    Requester {
        name: "user".to_string(),
        group: "group".to_string(),
    }
}

pub fn archive_submission(id: u64, size: u64, copies: &[(u32, &str)]) -> ArchiveSubmission {
    ArchiveSubmission {
        archive_file: archive_file(id, size),
        requester: requester(),
        mount_policy: mount_policy(),
        src_url: format!("root://eos/file-{id}"),
        report_url: format!("eosQuery://archived/{id}"),
        error_report_url: format!("eosQuery://failed/{id}"),
        copies: copies.iter().map(|(c, p)| (*c, p.to_string())).collect(),
        ..Default::default()
    }
}

/// A retrieve of file `id` stored as (copy number, VID, fseq) copies.
pub fn retrieve_submission(id: u64, size: u64, copies: &[(u32, &str, u64)]) -> RetrieveSubmission {
    let mut file = archive_file(id, size);
    file.tape_files = copies
        .iter()
        .map(|(copy_nb, vid, fseq)| TapeFile {
            copy_nb: *copy_nb,
            vid: vid.to_string(),
            fseq: *fseq,
            block_id: fseq * 10,
        })
        .collect();
    RetrieveSubmission {
        archive_file: file,
        requester: requester(),
        mount_policy: mount_policy(),
        dst_url: format!("root://eos/restore-{id}"),
        error_report_url: format!("eosQuery://retrieve-failed/{id}"),
        ..Default::default()
    }
}

/// Insert a single-copy archive request owned by `agent_ref` (object and
/// job), listed in its ownership, and return it ready to be queued.
pub async fn insert_archive_request(
    backend: &dyn Backend,
    agent_ref: &AgentReference,
    id: u64,
    size: u64,
    tape_pool: &str,
) -> ArchiveJobToQueue {
    insert_archive_request_copies(backend, agent_ref, id, size, &[(1, tape_pool)])
        .await
        .remove(0)
}

/// Same with one job per (copy number, tape pool). One element per job.
pub async fn insert_archive_request_copies(
    backend: &dyn Backend,
    agent_ref: &AgentReference,
    id: u64,
    size: u64,
    copies: &[(u32, &str)],
) -> Vec<ArchiveJobToQueue> {
    let address = agent_ref.next_id("ArchiveRequest");
    let mut request = ArchiveRequest::new(
        address.clone(),
        ArchiveRequestData::new(archive_file(id, size), requester(), mount_policy(), "root://eos/src", 0),
    );
    for (copy_nb, tape_pool) in copies {
        request.add_job(*copy_nb, tape_pool, agent_ref.address(), RetryLimits::default());
    }
    request.set_owner(agent_ref.address());
    agent_ref.add_to_ownership(&address, backend).await.unwrap();
    request.insert(backend).await.unwrap();
    copies
        .iter()
        .map(|(copy_nb, _)| ArchiveJobToQueue {
            job: request.queue_job_ref(*copy_nb),
            new_status: None,
        })
        .collect()
}

/// Insert a retrieve request for one copy on `vid`, owned by `agent_ref`.
pub async fn insert_retrieve_request(
    backend: &dyn Backend,
    agent_ref: &AgentReference,
    id: u64,
    size: u64,
    vid: &str,
    fseq: u64,
) -> RetrieveRequest {
    let address = agent_ref.next_id("RetrieveRequest");
    let mut file = archive_file(id, size);
    file.tape_files.push(TapeFile {
        copy_nb: 1,
        vid: vid.to_string(),
        fseq,
        block_id: fseq * 10,
    });
    let mut request = RetrieveRequest::new(
        address.clone(),
        RetrieveRequestData::new(file, requester(), mount_policy(), "root://eos/dst", 0),
    );
    request.add_job(1, RetryLimits::default());
    request.set_active_copy_nb(1);
    request.set_owner(agent_ref.address());
    agent_ref.add_to_ownership(&address, backend).await.unwrap();
    request.insert(backend).await.unwrap();
    request
}
