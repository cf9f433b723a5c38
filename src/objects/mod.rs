//! Typed views over backend objects.
//!
//! Every stored object is an envelope (type tag, owner, backup owner, payload).
//! [`Object<P>`] pairs a decoded payload with the envelope fields and,
//! optionally, the advisory lock it was fetched under. Commits require an
//! exclusive lock; sub-objects (queue shards) are written under their parent's
//! lock instead.
//!
//! - `agent`, `agent_register`: process identities and what they own
//! - `root_entry`: name to queue address map, entry point of every lookup
//! - `archive_request`, `retrieve_request`, `repack_request`: requests and their job state machines
//! - `job_queue`: sharded queue machinery shared by archive and retrieve queues
//! - `archive_queue`, `retrieve_queue`, `repack_queue`: the containers
//! - `drive_register`: per-drive status records
//! - `request_info`: file, policy and repack records embedded in requests
//! - `value_count_map`: value histograms kept in queue summaries

macro_rules! object_payload {
    ($payload:ty, $object_type:expr) => {
        impl $crate::objects::ObjectPayload for $payload {
            const TYPE: $crate::objects::ObjectType = $object_type;

            fn encode_payload(&self) -> Result<Vec<u8>, $crate::codec::CodecError> {
                $crate::codec::encode($crate::codec::PAYLOAD_VERSION, self)
            }

            fn decode_payload(bytes: &[u8]) -> Result<Self, $crate::codec::CodecError> {
                $crate::codec::decode($crate::codec::PAYLOAD_VERSION, bytes)
            }
        }
    };
}

pub mod agent;
pub mod agent_register;
pub mod archive_queue;
pub mod archive_request;
pub mod drive_register;
pub mod job_queue;
pub mod repack_queue;
pub mod repack_request;
pub mod request_info;
pub mod retrieve_queue;
pub mod retrieve_request;
pub mod root_entry;
pub mod value_count_map;

pub use agent::{Agent, AgentData};
pub use agent_register::{AgentRegister, AgentRegisterData};
pub use archive_queue::{ArchiveQueue, ArchiveQueueData, ArchiveQueueShard, ArchiveQueueShardData};
pub use archive_request::{ArchiveJobStatus, ArchiveRequest, ArchiveRequestData};
pub use drive_register::{DriveRegister, DriveRegisterData, DriveState, DriveStatus, MountType};
pub use repack_queue::{RepackQueue, RepackQueueData};
pub use repack_request::{RepackRequest, RepackRequestData, RepackStatus};
pub use request_info::{ArchiveFile, MountPolicy, RepackInfo, Requester, TapeFile};
pub use retrieve_queue::{
    RetrieveQueue, RetrieveQueueData, RetrieveQueueShard, RetrieveQueueShardData,
};
pub use retrieve_request::{RetrieveJobStatus, RetrieveRequest, RetrieveRequestData};
pub use root_entry::{RootEntry, RootEntryData};

use bytes::Bytes;
use rkyv::{Archive, Deserialize as RkyvDeserialize, Serialize as RkyvSerialize};
use thiserror::Error;

use crate::backend::{Backend, BackendError, LockKind, ObjectLock};
use crate::codec::{self, CodecError, ENVELOPE_VERSION};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Archive, RkyvSerialize, RkyvDeserialize)]
#[archive(check_bytes)]
pub enum ObjectType {
    RootEntry,
    AgentRegister,
    Agent,
    DriveRegister,
    ArchiveRequest,
    RetrieveRequest,
    RepackRequest,
    ArchiveQueue,
    ArchiveQueueShard,
    RetrieveQueue,
    RetrieveQueueShard,
    RepackQueue,
}

/// Which queue a job belongs in, by lifecycle phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Archive, RkyvSerialize, RkyvDeserialize)]
#[archive(check_bytes)]
pub enum JobQueueType {
    JobsToTransferForUser,
    JobsToTransferForRepack,
    JobsToReportToUser,
    JobsToReportToRepackForSuccess,
    JobsToReportToRepackForFailure,
    FailedJobs,
}

impl JobQueueType {
    pub fn name(&self) -> &'static str {
        match self {
            JobQueueType::JobsToTransferForUser => "ToTransferForUser",
            JobQueueType::JobsToTransferForRepack => "ToTransferForRepack",
            JobQueueType::JobsToReportToUser => "ToReportToUser",
            JobQueueType::JobsToReportToRepackForSuccess => "ToReportToRepackForSuccess",
            JobQueueType::JobsToReportToRepackForFailure => "ToReportToRepackForFailure",
            JobQueueType::FailedJobs => "Failed",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Archive, RkyvSerialize, RkyvDeserialize)]
#[archive(check_bytes)]
pub enum RepackQueueType {
    Pending,
    ToExpand,
}

impl RepackQueueType {
    pub fn name(&self) -> &'static str {
        match self {
            RepackQueueType::Pending => "Pending",
            RepackQueueType::ToExpand => "ToExpand",
        }
    }
}

/// Family and phase of a queue referenced from the root entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Archive, RkyvSerialize, RkyvDeserialize)]
#[archive(check_bytes)]
pub enum QueueKind {
    Archive(JobQueueType),
    Retrieve(JobQueueType),
    Repack(RepackQueueType),
}

impl QueueKind {
    /// Type-name prefix used for the addresses of queues of this kind.
    pub fn address_prefix(&self) -> String {
        match self {
            QueueKind::Archive(t) => crate::keys::archive_queue_prefix(t.name()),
            QueueKind::Retrieve(t) => crate::keys::retrieve_queue_prefix(t.name()),
            QueueKind::Repack(t) => crate::keys::repack_queue_prefix(t.name()),
        }
    }

    /// The pending repack queue is a singleton that lives forever.
    pub fn is_trimmable(&self) -> bool {
        !matches!(self, QueueKind::Repack(RepackQueueType::Pending))
    }
}

impl std::fmt::Display for QueueKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            QueueKind::Archive(t) => write!(f, "ArchiveQueue{}", t.name()),
            QueueKind::Retrieve(t) => write!(f, "RetrieveQueue{}", t.name()),
            QueueKind::Repack(t) => write!(f, "RepackQueue{}", t.name()),
        }
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ObjectError {
    #[error(transparent)]
    Backend(#[from] BackendError),
    #[error("codec error: {0}")]
    Codec(#[from] CodecError),
    #[error("object {address} has type {found:?}, expected {expected:?}")]
    WrongType {
        address: String,
        expected: ObjectType,
        found: ObjectType,
    },
    #[error("wrong previous owner for {address}: expected {expected}, found {found}")]
    WrongPreviousOwner {
        address: String,
        expected: String,
        found: String,
    },
    #[error("object {0} is not locked exclusively")]
    NotLocked(String),
    #[error("no job with copy number {copy_nb} in {address}")]
    NoSuchJob { address: String, copy_nb: u32 },
    #[error("queue {0} is not empty")]
    QueueNotEmpty(String),
    #[error("no {kind} queue for {key}")]
    NoSuchQueue { kind: QueueKind, key: String },
    #[error("object {address} is inconsistent: {reason}")]
    Inconsistent { address: String, reason: String },
}

impl ObjectError {
    pub fn is_no_such_object(&self) -> bool {
        matches!(self, ObjectError::Backend(BackendError::NoSuchObject(_)))
    }

    pub fn is_wrong_previous_owner(&self) -> bool {
        matches!(self, ObjectError::WrongPreviousOwner { .. })
    }
}

/// A typed payload stored inside an object envelope.
pub trait ObjectPayload: Sized + Clone + Send + Sync + 'static {
    const TYPE: ObjectType;

    fn encode_payload(&self) -> Result<Vec<u8>, CodecError>;

    fn decode_payload(bytes: &[u8]) -> Result<Self, CodecError>;
}

#[derive(Debug, Archive, RkyvSerialize, RkyvDeserialize)]
#[archive(check_bytes)]
struct Envelope {
    object_type: ObjectType,
    owner: String,
    backup_owner: String,
    payload: Vec<u8>,
}

fn decode_envelope(address: &str, raw: &[u8]) -> Result<Envelope, ObjectError> {
    codec::decode::<Envelope>(ENVELOPE_VERSION, raw).map_err(|e| ObjectError::Inconsistent {
        address: address.to_string(),
        reason: e.to_string(),
    })
}

/// A decoded object, possibly holding its lock.
pub struct Object<P> {
    address: String,
    owner: String,
    backup_owner: String,
    payload: P,
    lock: Option<ObjectLock>,
}

impl<P: std::fmt::Debug> std::fmt::Debug for Object<P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Object")
            .field("address", &self.address)
            .field("owner", &self.owner)
            .field("locked", &self.lock.as_ref().map(|l| l.kind()))
            .field("payload", &self.payload)
            .finish()
    }
}

impl<P: ObjectPayload> Object<P> {
    /// A fresh in-memory object, not yet inserted.
    pub fn new(address: impl Into<String>, payload: P) -> Self {
        Self {
            address: address.into(),
            owner: String::new(),
            backup_owner: String::new(),
            payload,
            lock: None,
        }
    }

    fn from_envelope(address: &str, envelope: Envelope, lock: Option<ObjectLock>) -> Result<Self, ObjectError> {
        if envelope.object_type != P::TYPE {
            return Err(ObjectError::WrongType {
                address: address.to_string(),
                expected: P::TYPE,
                found: envelope.object_type,
            });
        }
        Ok(Self {
            address: address.to_string(),
            owner: envelope.owner,
            backup_owner: envelope.backup_owner,
            payload: P::decode_payload(&envelope.payload)?,
            lock,
        })
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn owner(&self) -> &str {
        &self.owner
    }

    pub fn set_owner(&mut self, owner: impl Into<String>) {
        self.owner = owner.into();
    }

    pub fn backup_owner(&self) -> &str {
        &self.backup_owner
    }

    pub fn set_backup_owner(&mut self, owner: impl Into<String>) {
        self.backup_owner = owner.into();
    }

    pub fn payload(&self) -> &P {
        &self.payload
    }

    pub fn payload_mut(&mut self) -> &mut P {
        &mut self.payload
    }

    pub fn into_payload(self) -> P {
        self.payload
    }

    pub fn is_locked_exclusively(&self) -> bool {
        matches!(self.lock.as_ref().map(|l| l.kind()), Some(LockKind::Exclusive))
    }

    fn encode(&self) -> Result<Bytes, ObjectError> {
        let envelope = Envelope {
            object_type: P::TYPE,
            owner: self.owner.clone(),
            backup_owner: self.backup_owner.clone(),
            payload: self.payload.encode_payload()?,
        };
        Ok(Bytes::from(codec::encode(ENVELOPE_VERSION, &envelope)?))
    }

    fn ensure_exclusive(&self) -> Result<(), ObjectError> {
        if self.is_locked_exclusively() {
            Ok(())
        } else {
            Err(ObjectError::NotLocked(self.address.clone()))
        }
    }

    pub async fn insert(&self, backend: &dyn Backend) -> Result<(), ObjectError> {
        backend.create(&self.address, self.encode()?).await?;
        Ok(())
    }

    pub async fn fetch_no_lock(backend: &dyn Backend, address: &str) -> Result<Self, ObjectError> {
        let raw = backend.read(address).await?;
        Self::from_envelope(address, decode_envelope(address, &raw)?, None)
    }

    pub async fn lock_and_fetch(backend: &dyn Backend, address: &str) -> Result<Self, ObjectError> {
        let lock = backend.lock_exclusive(address).await?;
        let raw = backend.read(address).await?;
        Self::from_envelope(address, decode_envelope(address, &raw)?, Some(lock))
    }

    pub async fn lock_shared_and_fetch(backend: &dyn Backend, address: &str) -> Result<Self, ObjectError> {
        let lock = backend.lock_shared(address).await?;
        let raw = backend.read(address).await?;
        Self::from_envelope(address, decode_envelope(address, &raw)?, Some(lock))
    }

    /// Write the in-memory state back. Requires the exclusive lock.
    pub async fn commit(&self, backend: &dyn Backend) -> Result<(), ObjectError> {
        self.ensure_exclusive()?;
        backend.overwrite(&self.address, self.encode()?).await?;
        Ok(())
    }

    /// Write an object protected by its parent's lock (queue shards).
    pub(crate) async fn commit_as_sub_object(&self, backend: &dyn Backend) -> Result<(), ObjectError> {
        backend.overwrite(&self.address, self.encode()?).await?;
        Ok(())
    }

    /// Delete the object. Requires the exclusive lock, which is released afterwards.
    pub async fn remove(mut self, backend: &dyn Backend) -> Result<(), ObjectError> {
        self.ensure_exclusive()?;
        backend.remove(&self.address).await?;
        self.lock.take();
        Ok(())
    }

    pub(crate) async fn remove_as_sub_object(self, backend: &dyn Backend) -> Result<(), ObjectError> {
        backend.remove(&self.address).await?;
        Ok(())
    }

    pub fn release(&mut self) {
        self.lock.take();
    }

    /// Lock, fetch, mutate and commit in one go. Nothing is written when `f` fails.
    pub async fn update<T, F>(backend: &dyn Backend, address: &str, f: F) -> Result<T, ObjectError>
    where
        F: FnOnce(&mut Self) -> Result<T, ObjectError> + Send,
        T: Send,
    {
        let mut object = Self::lock_and_fetch(backend, address).await?;
        let out = f(&mut object)?;
        object.commit(backend).await?;
        object.release();
        Ok(out)
    }
}

/// An object of not yet known type.
pub struct GenericObject {
    address: String,
    envelope: Envelope,
    lock: Option<ObjectLock>,
}

impl GenericObject {
    pub async fn fetch_no_lock(backend: &dyn Backend, address: &str) -> Result<Self, ObjectError> {
        let raw = backend.read(address).await?;
        Ok(Self {
            address: address.to_string(),
            envelope: decode_envelope(address, &raw)?,
            lock: None,
        })
    }

    pub async fn lock_and_fetch(backend: &dyn Backend, address: &str) -> Result<Self, ObjectError> {
        let lock = backend.lock_exclusive(address).await?;
        let raw = backend.read(address).await?;
        Ok(Self {
            address: address.to_string(),
            envelope: decode_envelope(address, &raw)?,
            lock: Some(lock),
        })
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn object_type(&self) -> ObjectType {
        self.envelope.object_type
    }

    pub fn owner(&self) -> &str {
        &self.envelope.owner
    }

    /// Interpret the payload according to the type tag. The lock, if any, moves along.
    pub fn into_typed(self) -> Result<AnyObject, ObjectError> {
        let GenericObject {
            address,
            envelope,
            lock,
        } = self;
        Ok(match envelope.object_type {
            ObjectType::RootEntry => AnyObject::RootEntry(Object::from_envelope(&address, envelope, lock)?),
            ObjectType::AgentRegister => {
                AnyObject::AgentRegister(Object::from_envelope(&address, envelope, lock)?)
            }
            ObjectType::Agent => AnyObject::Agent(Object::from_envelope(&address, envelope, lock)?),
            ObjectType::DriveRegister => {
                AnyObject::DriveRegister(Object::from_envelope(&address, envelope, lock)?)
            }
            ObjectType::ArchiveRequest => {
                AnyObject::ArchiveRequest(Object::from_envelope(&address, envelope, lock)?)
            }
            ObjectType::RetrieveRequest => {
                AnyObject::RetrieveRequest(Object::from_envelope(&address, envelope, lock)?)
            }
            ObjectType::RepackRequest => {
                AnyObject::RepackRequest(Object::from_envelope(&address, envelope, lock)?)
            }
            ObjectType::ArchiveQueue => {
                AnyObject::ArchiveQueue(Object::from_envelope(&address, envelope, lock)?)
            }
            ObjectType::ArchiveQueueShard => {
                AnyObject::ArchiveQueueShard(Object::from_envelope(&address, envelope, lock)?)
            }
            ObjectType::RetrieveQueue => {
                AnyObject::RetrieveQueue(Object::from_envelope(&address, envelope, lock)?)
            }
            ObjectType::RetrieveQueueShard => {
                AnyObject::RetrieveQueueShard(Object::from_envelope(&address, envelope, lock)?)
            }
            ObjectType::RepackQueue => {
                AnyObject::RepackQueue(Object::from_envelope(&address, envelope, lock)?)
            }
        })
    }
}

/// Every object kind the store knows about.
pub enum AnyObject {
    RootEntry(RootEntry),
    AgentRegister(AgentRegister),
    Agent(Agent),
    DriveRegister(DriveRegister),
    ArchiveRequest(ArchiveRequest),
    RetrieveRequest(RetrieveRequest),
    RepackRequest(RepackRequest),
    ArchiveQueue(ArchiveQueue),
    ArchiveQueueShard(ArchiveQueueShard),
    RetrieveQueue(RetrieveQueue),
    RetrieveQueueShard(RetrieveQueueShard),
    RepackQueue(RepackQueue),
}

impl AnyObject {
    pub fn kind_name(&self) -> &'static str {
        match self {
            AnyObject::RootEntry(_) => "RootEntry",
            AnyObject::AgentRegister(_) => "AgentRegister",
            AnyObject::Agent(_) => "Agent",
            AnyObject::DriveRegister(_) => "DriveRegister",
            AnyObject::ArchiveRequest(_) => "ArchiveRequest",
            AnyObject::RetrieveRequest(_) => "RetrieveRequest",
            AnyObject::RepackRequest(_) => "RepackRequest",
            AnyObject::ArchiveQueue(_) => "ArchiveQueue",
            AnyObject::ArchiveQueueShard(_) => "ArchiveQueueShard",
            AnyObject::RetrieveQueue(_) => "RetrieveQueue",
            AnyObject::RetrieveQueueShard(_) => "RetrieveQueueShard",
            AnyObject::RepackQueue(_) => "RepackQueue",
        }
    }
}
