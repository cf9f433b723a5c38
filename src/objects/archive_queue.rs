use rkyv::{Archive, Deserialize as RkyvDeserialize, Serialize as RkyvSerialize};

use super::job_queue::{QueueData, QueuePayload, ShardData, ShardPayload};
use super::{Object, ObjectType, QueueKind};
use crate::keys::archive_queue_shard_prefix;

/// Archive jobs for one tape pool (or one repack request), in arrival order.
#[derive(Debug, Clone, PartialEq, Eq, Archive, RkyvSerialize, RkyvDeserialize)]
#[archive(check_bytes)]
pub struct ArchiveQueueData {
    pub queue: QueueData,
}

object_payload!(ArchiveQueueData, ObjectType::ArchiveQueue);

pub type ArchiveQueue = Object<ArchiveQueueData>;

impl QueuePayload for ArchiveQueueData {
    type Shard = ArchiveQueueShardData;

    fn new_queue(container_id: &str, kind: QueueKind) -> Self {
        Self {
            queue: QueueData::new(container_id, kind, false),
        }
    }

    fn queue(&self) -> &QueueData {
        &self.queue
    }

    fn queue_mut(&mut self) -> &mut QueueData {
        &mut self.queue
    }

    fn shard_prefix(container_id: &str) -> String {
        archive_queue_shard_prefix(container_id)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Archive, RkyvSerialize, RkyvDeserialize)]
#[archive(check_bytes)]
pub struct ArchiveQueueShardData {
    pub shard: ShardData,
}

object_payload!(ArchiveQueueShardData, ObjectType::ArchiveQueueShard);

pub type ArchiveQueueShard = Object<ArchiveQueueShardData>;

impl ShardPayload for ArchiveQueueShardData {
    fn new_shard() -> Self {
        Self::default()
    }

    fn shard(&self) -> &ShardData {
        &self.shard
    }

    fn shard_mut(&mut self) -> &mut ShardData {
        &mut self.shard
    }
}
