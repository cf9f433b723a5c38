/// Well-known address of the root entry; every lookup starts here.
pub const ROOT_ENTRY_ADDRESS: &str = "root";

/// Address of a child object created by an agent: `<type>-<agent>-<sequence>`.
pub fn child_address(child_type: &str, agent_address: &str, sequence: u64) -> String {
    format!("{}-{}-{}", child_type, agent_address, sequence)
}

/// Agent address for a process: `<program>-<host>-<pid>-<time>-<suffix>`.
///
/// The random suffix keeps two processes started in the same second with a
/// recycled pid apart.
pub fn agent_address(program: &str, host: &str, pid: u32, epoch_secs: i64, suffix: &str) -> String {
    format!(
        "Agent-{}-{}-{}-{}-{}",
        program, host, pid, epoch_secs, suffix
    )
}

/// Type-name prefix for archive queue objects of one queue type.
pub fn archive_queue_prefix(queue_type_name: &str) -> String {
    format!("ArchiveQueue{}", queue_type_name)
}

/// Type-name prefix for the shards of the archive queue for `container_id`.
pub fn archive_queue_shard_prefix(container_id: &str) -> String {
    format!("ArchiveQueueShard-{}", container_id)
}

pub fn retrieve_queue_prefix(queue_type_name: &str) -> String {
    format!("RetrieveQueue{}", queue_type_name)
}

pub fn retrieve_queue_shard_prefix(vid: &str) -> String {
    format!("RetrieveQueueShard-{}", vid)
}

pub fn repack_queue_prefix(queue_type_name: &str) -> String {
    format!("RepackQueue{}", queue_type_name)
}
