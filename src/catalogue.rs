//! Tape metadata lookups needed to pick a retrieve destination, and the
//! narrow write path recording files written to tape.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TapeState {
    Active,
    Disabled,
    Broken,
    Repacking,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CatalogueError {
    #[error("unknown tape {0}")]
    UnknownTape(String),
    #[error("catalogue unavailable: {0}")]
    Unavailable(String),
}

/// A file copy that reached tape.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TapeFileWritten {
    pub archive_file_id: u64,
    pub copy_nb: u32,
    pub vid: String,
    pub fseq: u64,
    pub size: u64,
}

#[async_trait]
pub trait Catalogue: Send + Sync {
    /// State of each known VID in `vids`. Unknown VIDs are absent from the result.
    async fn tape_states(&self, vids: &[String]) -> Result<HashMap<String, TapeState>, CatalogueError>;

    async fn file_written_to_tape(&self, event: TapeFileWritten) -> Result<(), CatalogueError>;
}

/// Catalogue held in process memory; the daemon and the tests use it.
#[derive(Default)]
pub struct InMemoryCatalogue {
    tapes: Mutex<HashMap<String, TapeState>>,
    written: Mutex<Vec<TapeFileWritten>>,
}

impl InMemoryCatalogue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_tape_state(&self, vid: &str, state: TapeState) {
        self.tapes.lock().unwrap().insert(vid.to_string(), state);
    }

    pub fn written_files(&self) -> Vec<TapeFileWritten> {
        self.written.lock().unwrap().clone()
    }
}

#[async_trait]
impl Catalogue for InMemoryCatalogue {
    async fn tape_states(&self, vids: &[String]) -> Result<HashMap<String, TapeState>, CatalogueError> {
        let tapes = self.tapes.lock().unwrap();
        Ok(vids
            .iter()
            .filter_map(|vid| tapes.get(vid).map(|state| (vid.clone(), *state)))
            .collect())
    }

    async fn file_written_to_tape(&self, event: TapeFileWritten) -> Result<(), CatalogueError> {
        if !self.tapes.lock().unwrap().contains_key(&event.vid) {
            return Err(CatalogueError::UnknownTape(event.vid));
        }
        self.written.lock().unwrap().push(event);
        Ok(())
    }
}
