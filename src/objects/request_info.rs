//! Records embedded in several request types.

use rkyv::{Archive, Deserialize as RkyvDeserialize, Serialize as RkyvSerialize};

#[derive(Debug, Clone, PartialEq, Eq, Archive, RkyvSerialize, RkyvDeserialize)]
#[archive(check_bytes)]
pub struct TapeFile {
    pub copy_nb: u32,
    pub vid: String,
    pub fseq: u64,
    pub block_id: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Archive, RkyvSerialize, RkyvDeserialize)]
#[archive(check_bytes)]
pub struct ArchiveFile {
    pub archive_file_id: u64,
    pub disk_instance: String,
    pub disk_file_id: String,
    pub size: u64,
    pub checksum: String,
    pub storage_class: String,
    /// Copies already on tape; empty until the file is written.
    pub tape_files: Vec<TapeFile>,
}

impl ArchiveFile {
    pub fn tape_file(&self, copy_nb: u32) -> Option<&TapeFile> {
        self.tape_files.iter().find(|tf| tf.copy_nb == copy_nb)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Archive, RkyvSerialize, RkyvDeserialize)]
#[archive(check_bytes)]
pub struct MountPolicy {
    pub name: String,
    pub priority: u64,
    /// Seconds a request may wait before it alone justifies a mount.
    pub min_request_age: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Archive, RkyvSerialize, RkyvDeserialize)]
#[archive(check_bytes)]
pub struct Requester {
    pub name: String,
    pub group: String,
}

/// Set on requests created by a repack: reports go to the repack request
/// instead of the user.
#[derive(Debug, Clone, Default, PartialEq, Eq, Archive, RkyvSerialize, RkyvDeserialize)]
#[archive(check_bytes)]
pub struct RepackInfo {
    pub is_repack: bool,
    pub repack_request_address: String,
    pub file_buffer_url: String,
    pub fseq: u64,
    pub force_disabled_tape: bool,
    /// Destination VID per copy number, filled as copies land on tape.
    pub jobs_destination: Vec<(u32, String)>,
}
