use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use slatedb::{Db, WriteBatch};
use tokio::sync::Mutex as AsyncMutex;

use super::{Backend, BackendError, LockKind, LockTable, ObjectLock};
use crate::settings::BackendConfig;
use crate::storage::resolve_object_store;

/// Objects stored as SlateDB keys. Advisory locks are process-local.
pub struct SlateBackend {
    path: String,
    db: Arc<Db>,
    locks: LockTable,
    /// Serializes existence-checked writes so create/overwrite/remove stay atomic.
    write_gate: AsyncMutex<()>,
}

impl SlateBackend {
    pub async fn open(cfg: &BackendConfig) -> Result<Arc<Self>, BackendError> {
        let resolved = resolve_object_store(cfg.kind, &cfg.path)?;
        let mut db_builder =
            slatedb::DbBuilder::new(resolved.canonical_path.as_str(), resolved.store);
        if let Some(flush_ms) = cfg.flush_interval_ms {
            let settings = slatedb::config::Settings {
                flush_interval: Some(Duration::from_millis(flush_ms)),
                ..Default::default()
            };
            db_builder = db_builder.with_settings(settings);
        }
        let db = db_builder.build().await?;
        tracing::info!(path = %resolved.canonical_path, "opened slatedb object store");
        Ok(Arc::new(Self {
            path: resolved.canonical_path,
            db: Arc::new(db),
            locks: LockTable::new(cfg.lock_timeout_ms.map(Duration::from_millis)),
            write_gate: AsyncMutex::new(()),
        }))
    }

    pub async fn close(&self) -> Result<(), BackendError> {
        self.db.close().await?;
        tracing::info!(path = %self.path, "closed slatedb object store");
        Ok(())
    }

    async fn put(&self, address: &str, content: &Bytes) -> Result<(), BackendError> {
        let mut batch = WriteBatch::new();
        batch.put(address.as_bytes(), content.as_ref());
        self.db.write(batch).await?;
        Ok(())
    }

    async fn lock(&self, address: &str, kind: LockKind) -> Result<ObjectLock, BackendError> {
        let lock = self.locks.lock(address, kind).await?;
        if self.db.get(address.as_bytes()).await?.is_none() {
            return Err(BackendError::NoSuchObject(address.to_string()));
        }
        Ok(lock)
    }
}

#[async_trait]
impl Backend for SlateBackend {
    async fn create(&self, address: &str, content: Bytes) -> Result<(), BackendError> {
        let _gate = self.write_gate.lock().await;
        if self.db.get(address.as_bytes()).await?.is_some() {
            return Err(BackendError::ObjectExists(address.to_string()));
        }
        self.put(address, &content).await
    }

    async fn read(&self, address: &str) -> Result<Bytes, BackendError> {
        self.db
            .get(address.as_bytes())
            .await?
            .ok_or_else(|| BackendError::NoSuchObject(address.to_string()))
    }

    async fn overwrite(&self, address: &str, content: Bytes) -> Result<(), BackendError> {
        let _gate = self.write_gate.lock().await;
        if self.db.get(address.as_bytes()).await?.is_none() {
            return Err(BackendError::NoSuchObject(address.to_string()));
        }
        self.put(address, &content).await
    }

    async fn remove(&self, address: &str) -> Result<(), BackendError> {
        let _gate = self.write_gate.lock().await;
        if self.db.get(address.as_bytes()).await?.is_none() {
            return Err(BackendError::NoSuchObject(address.to_string()));
        }
        let mut batch = WriteBatch::new();
        batch.delete(address.as_bytes());
        self.db.write(batch).await?;
        Ok(())
    }

    async fn exists(&self, address: &str) -> Result<bool, BackendError> {
        Ok(self.db.get(address.as_bytes()).await?.is_some())
    }

    async fn list(&self) -> Result<Vec<String>, BackendError> {
        let start: Vec<u8> = Vec::new();
        let end: Vec<u8> = vec![0xFF];
        let mut iter = self.db.scan::<Vec<u8>, _>(start..=end).await?;
        let mut addresses = Vec::new();
        while let Some(kv) = iter.next().await? {
            match std::str::from_utf8(&kv.key) {
                Ok(address) => addresses.push(address.to_string()),
                Err(_) => tracing::warn!(key = ?kv.key, "skipping non utf-8 key"),
            }
        }
        Ok(addresses)
    }

    async fn lock_exclusive(&self, address: &str) -> Result<ObjectLock, BackendError> {
        self.lock(address, LockKind::Exclusive).await
    }

    async fn lock_shared(&self, address: &str) -> Result<ObjectLock, BackendError> {
        self.lock(address, LockKind::Shared).await
    }

    fn describe(&self) -> String {
        format!("slatedb:{}", self.path)
    }
}
