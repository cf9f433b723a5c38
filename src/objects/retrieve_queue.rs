use rkyv::{Archive, Deserialize as RkyvDeserialize, Serialize as RkyvSerialize};

use super::job_queue::{QueueData, QueuePayload, ShardData, ShardPayload};
use super::{Object, ObjectType, QueueKind};
use crate::keys::retrieve_queue_shard_prefix;

/// Retrieve jobs for one tape, sorted by position on tape.
#[derive(Debug, Clone, PartialEq, Eq, Archive, RkyvSerialize, RkyvDeserialize)]
#[archive(check_bytes)]
pub struct RetrieveQueueData {
    pub queue: QueueData,
}

object_payload!(RetrieveQueueData, ObjectType::RetrieveQueue);

pub type RetrieveQueue = Object<RetrieveQueueData>;

impl QueuePayload for RetrieveQueueData {
    type Shard = RetrieveQueueShardData;

    fn new_queue(container_id: &str, kind: QueueKind) -> Self {
        Self {
            queue: QueueData::new(container_id, kind, true),
        }
    }

    fn queue(&self) -> &QueueData {
        &self.queue
    }

    fn queue_mut(&mut self) -> &mut QueueData {
        &mut self.queue
    }

    fn shard_prefix(container_id: &str) -> String {
        retrieve_queue_shard_prefix(container_id)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Archive, RkyvSerialize, RkyvDeserialize)]
#[archive(check_bytes)]
pub struct RetrieveQueueShardData {
    pub shard: ShardData,
}

object_payload!(RetrieveQueueShardData, ObjectType::RetrieveQueueShard);

pub type RetrieveQueueShard = Object<RetrieveQueueShardData>;

impl ShardPayload for RetrieveQueueShardData {
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
