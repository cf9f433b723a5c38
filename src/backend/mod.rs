//! Key-value object store with per-object advisory locks.
//!
//! - `memory`: process-local map, for tests and throwaway deployments
//! - `slate`: durable store on SlateDB
//!
//! Objects are opaque byte blobs addressed by string. Locks are advisory:
//! callers take them around read-modify-write sequences, the store itself
//! never checks them. Locks are not re-entrant.

mod memory;
mod slate;

pub use memory::MemoryBackend;
pub use slate::SlateBackend;

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;
use tokio::sync::{OwnedRwLockReadGuard, OwnedRwLockWriteGuard, RwLock};

use crate::settings::{BackendConfig, BackendKind};
use crate::storage::StorageError;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum BackendError {
    #[error("no such object: {0}")]
    NoSuchObject(String),
    #[error("object already exists: {0}")]
    ObjectExists(String),
    #[error("could not lock {0}: timed out")]
    CouldNotLock(String),
    #[error("storage error: {0}")]
    Storage(String),
}

impl From<StorageError> for BackendError {
    fn from(e: StorageError) -> Self {
        BackendError::Storage(e.to_string())
    }
}

impl From<slatedb::Error> for BackendError {
    fn from(e: slatedb::Error) -> Self {
        BackendError::Storage(e.to_string())
    }
}

#[async_trait]
pub trait Backend: Send + Sync + 'static {
    /// Store a new object. Fails with `ObjectExists` if the address is taken.
    async fn create(&self, address: &str, content: Bytes) -> Result<(), BackendError>;

    async fn read(&self, address: &str) -> Result<Bytes, BackendError>;

    /// Replace the content of an existing object.
    async fn overwrite(&self, address: &str, content: Bytes) -> Result<(), BackendError>;

    async fn remove(&self, address: &str) -> Result<(), BackendError>;

    async fn exists(&self, address: &str) -> Result<bool, BackendError>;

    /// Every object address, in lexicographic order.
    async fn list(&self) -> Result<Vec<String>, BackendError>;

    /// Exclusive lock on an existing object; `NoSuchObject` otherwise.
    async fn lock_exclusive(&self, address: &str) -> Result<ObjectLock, BackendError>;

    async fn lock_shared(&self, address: &str) -> Result<ObjectLock, BackendError>;

    /// Human readable description, for logs.
    fn describe(&self) -> String;
}

/// Open the backend described by the configuration.
pub async fn open(cfg: &BackendConfig) -> Result<Arc<dyn Backend>, BackendError> {
    let lock_timeout = cfg.lock_timeout_ms.map(Duration::from_millis);
    match cfg.kind {
        BackendKind::Memory => {
            let backend: Arc<dyn Backend> = MemoryBackend::with_lock_timeout(lock_timeout);
            Ok(backend)
        }
        BackendKind::Fs | BackendKind::Url => {
            let backend: Arc<dyn Backend> = SlateBackend::open(cfg).await?;
            Ok(backend)
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockKind {
    Exclusive,
    Shared,
}

enum LockGuard {
    Exclusive(#[allow(dead_code)] OwnedRwLockWriteGuard<()>),
    Shared(#[allow(dead_code)] OwnedRwLockReadGuard<()>),
}

/// An advisory lock on one object, released when dropped.
pub struct ObjectLock {
    address: String,
    guard: LockGuard,
}

impl ObjectLock {
    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn kind(&self) -> LockKind {
        match self.guard {
            LockGuard::Exclusive(_) => LockKind::Exclusive,
            LockGuard::Shared(_) => LockKind::Shared,
        }
    }

    pub fn release(self) {}
}

impl std::fmt::Debug for ObjectLock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObjectLock")
            .field("address", &self.address)
            .field("kind", &self.kind())
            .finish()
    }
}

/// Entries are pruned once the table grows past this size.
const LOCK_TABLE_PRUNE_THRESHOLD: usize = 4096;

/// Per-address reader/writer locks shared by the backends.
pub(crate) struct LockTable {
    locks: Mutex<HashMap<String, Arc<RwLock<()>>>>,
    timeout: Option<Duration>,
}

impl LockTable {
    pub(crate) fn new(timeout: Option<Duration>) -> Self {
        Self {
            locks: Mutex::new(HashMap::new()),
            timeout,
        }
    }

    fn entry(&self, address: &str) -> Arc<RwLock<()>> {
        let mut locks = self.locks.lock().unwrap();
        if locks.len() > LOCK_TABLE_PRUNE_THRESHOLD {
            // nobody holds or waits on an entry referenced only by the table
            locks.retain(|_, l| Arc::strong_count(l) > 1);
        }
        locks.entry(address.to_string()).or_default().clone()
    }

    pub(crate) async fn lock(&self, address: &str, kind: LockKind) -> Result<ObjectLock, BackendError> {
        let lock = self.entry(address);
        let acquire = async move {
            match kind {
                LockKind::Exclusive => LockGuard::Exclusive(lock.write_owned().await),
                LockKind::Shared => LockGuard::Shared(lock.read_owned().await),
            }
        };
        let guard = match self.timeout {
            Some(timeout) => tokio::time::timeout(timeout, acquire)
                .await
                .map_err(|_| BackendError::CouldNotLock(address.to_string()))?,
            None => acquire.await,
        };
        Ok(ObjectLock {
            address: address.to_string(),
            guard,
        })
    }
}
