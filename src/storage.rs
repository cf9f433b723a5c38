use std::fs;
use std::path::Path;
use std::sync::Arc;

use slatedb::object_store::ObjectStore;
use slatedb::{Db, Error as SlateError};
use thiserror::Error;

use crate::settings::BackendKind;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("slatedb error: {0}")]
    Slate(#[from] SlateError),
    #[error("invalid object store location: {0}")]
    InvalidLocation(String),
}

/// Object store plus the canonical path SlateDB should be opened at.
pub struct ResolvedStore {
    pub store: Arc<dyn ObjectStore>,
    pub canonical_path: String,
}

pub fn resolve_object_store(kind: BackendKind, path: &str) -> Result<ResolvedStore, StorageError> {
    match kind {
        BackendKind::Fs => {
            let root = Path::new(path);
            if !root.exists() {
                fs::create_dir_all(root).map_err(|e| {
                    StorageError::InvalidLocation(format!("failed to create fs root {}: {}", path, e))
                })?;
            }
            // relative paths otherwise get percent-encoded differently by object_store
            let canonical_path = root.canonicalize().map_err(|e| {
                StorageError::InvalidLocation(format!("failed to canonicalize path {}: {}", path, e))
            })?;
            let canonical_str = canonical_path.to_string_lossy().to_string();
            let fs = slatedb::object_store::local::LocalFileSystem::new_with_prefix(&canonical_str)
                .map_err(|e| StorageError::InvalidLocation(e.to_string()))?;
            Ok(ResolvedStore {
                store: Arc::new(fs),
                canonical_path: canonical_str,
            })
        }
        BackendKind::Memory => Ok(ResolvedStore {
            store: Arc::new(slatedb::object_store::memory::InMemory::new()),
            canonical_path: path.to_string(),
        }),
        BackendKind::Url => {
            let store = Db::resolve_object_store(path)?;
            Ok(ResolvedStore {
                store,
                canonical_path: path.to_string(),
            })
        }
    }
}
