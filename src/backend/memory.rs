use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;

use super::{Backend, BackendError, LockKind, LockTable, ObjectLock};

/// Objects kept in a process-local ordered map.
pub struct MemoryBackend {
    objects: Mutex<BTreeMap<String, Bytes>>,
    locks: LockTable,
}

impl MemoryBackend {
    pub fn new() -> Arc<Self> {
        Self::with_lock_timeout(None)
    }

    pub fn with_lock_timeout(timeout: Option<Duration>) -> Arc<Self> {
        Arc::new(Self {
            objects: Mutex::new(BTreeMap::new()),
            locks: LockTable::new(timeout),
        })
    }

    pub fn len(&self) -> usize {
        self.objects.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    async fn lock(&self, address: &str, kind: LockKind) -> Result<ObjectLock, BackendError> {
        let lock = self.locks.lock(address, kind).await?;
        if !self.objects.lock().unwrap().contains_key(address) {
            return Err(BackendError::NoSuchObject(address.to_string()));
        }
        Ok(lock)
    }
}

#[async_trait]
impl Backend for MemoryBackend {
    async fn create(&self, address: &str, content: Bytes) -> Result<(), BackendError> {
        let mut objects = self.objects.lock().unwrap();
        if objects.contains_key(address) {
            return Err(BackendError::ObjectExists(address.to_string()));
        }
        objects.insert(address.to_string(), content);
        Ok(())
    }

    async fn read(&self, address: &str) -> Result<Bytes, BackendError> {
        self.objects
            .lock()
            .unwrap()
            .get(address)
            .cloned()
            .ok_or_else(|| BackendError::NoSuchObject(address.to_string()))
    }

    async fn overwrite(&self, address: &str, content: Bytes) -> Result<(), BackendError> {
        let mut objects = self.objects.lock().unwrap();
        match objects.get_mut(address) {
            Some(existing) => {
                *existing = content;
                Ok(())
            }
            None => Err(BackendError::NoSuchObject(address.to_string())),
        }
    }

    async fn remove(&self, address: &str) -> Result<(), BackendError> {
        self.objects
            .lock()
            .unwrap()
            .remove(address)
            .map(|_| ())
            .ok_or_else(|| BackendError::NoSuchObject(address.to_string()))
    }

    async fn exists(&self, address: &str) -> Result<bool, BackendError> {
        Ok(self.objects.lock().unwrap().contains_key(address))
    }

    async fn list(&self) -> Result<Vec<String>, BackendError> {
        Ok(self.objects.lock().unwrap().keys().cloned().collect())
    }

    async fn lock_exclusive(&self, address: &str) -> Result<ObjectLock, BackendError> {
        self.lock(address, LockKind::Exclusive).await
    }

    async fn lock_shared(&self, address: &str) -> Result<ObjectLock, BackendError> {
        self.lock(address, LockKind::Shared).await
    }

    fn describe(&self) -> String {
        "memory".to_string()
    }
}
