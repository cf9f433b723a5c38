use rkyv::{Archive, Deserialize as RkyvDeserialize, Serialize as RkyvSerialize};
use tracing::info;

use super::job_queue::QueuePayload;
use super::{
    AgentRegister, AgentRegisterData, ArchiveQueueData, DriveRegister, DriveRegisterData, Object,
    ObjectError, ObjectType, QueueKind, RepackQueueData, RetrieveQueueData,
};
use crate::agent_reference::AgentReference;
use crate::backend::{Backend, BackendError};
use crate::keys::ROOT_ENTRY_ADDRESS;

#[derive(Debug, Clone, PartialEq, Eq, Archive, RkyvSerialize, RkyvDeserialize)]
#[archive(check_bytes)]
pub struct QueuePointer {
    pub kind: QueueKind,
    /// Tape pool, VID or repack request address; empty for repack queues.
    pub key: String,
    pub address: String,
}

/// Entry point of the store: where every queue and register lives.
#[derive(Debug, Clone, Default, PartialEq, Eq, Archive, RkyvSerialize, RkyvDeserialize)]
#[archive(check_bytes)]
pub struct RootEntryData {
    pub queues: Vec<QueuePointer>,
    pub agent_register: String,
    pub drive_register: String,
}

object_payload!(RootEntryData, ObjectType::RootEntry);

pub type RootEntry = Object<RootEntryData>;

impl Object<RootEntryData> {
    /// Create the root entry and its registers in an empty store. Idempotent:
    /// an existing root entry is left untouched.
    pub async fn initialize(backend: &dyn Backend) -> Result<(), ObjectError> {
        let agent_register_address = format!("{ROOT_ENTRY_ADDRESS}-AgentRegister");
        let drive_register_address = format!("{ROOT_ENTRY_ADDRESS}-DriveRegister");
        let mut root = RootEntry::new(
            ROOT_ENTRY_ADDRESS,
            RootEntryData {
                queues: Vec::new(),
                agent_register: agent_register_address.clone(),
                drive_register: drive_register_address.clone(),
            },
        );
        root.set_owner("");
        match root.insert(backend).await {
            Ok(()) => {}
            Err(ObjectError::Backend(BackendError::ObjectExists(_))) => return Ok(()),
            Err(e) => return Err(e),
        }
        let mut agent_register = AgentRegister::new(agent_register_address, AgentRegisterData::default());
        agent_register.set_owner(ROOT_ENTRY_ADDRESS);
        insert_if_absent(&agent_register, backend).await?;
        let mut drive_register = DriveRegister::new(drive_register_address, DriveRegisterData::default());
        drive_register.set_owner(ROOT_ENTRY_ADDRESS);
        insert_if_absent(&drive_register, backend).await?;
        info!("initialized object store root entry");
        Ok(())
    }

    pub fn agent_register_address(&self) -> &str {
        &self.payload().agent_register
    }

    pub fn drive_register_address(&self) -> &str {
        &self.payload().drive_register
    }

    pub fn queue_address(&self, kind: QueueKind, key: &str) -> Option<String> {
        self.payload()
            .queues
            .iter()
            .find(|q| q.kind == kind && q.key == key)
            .map(|q| q.address.clone())
    }

    /// Every queue of a family, as (key, address) pairs.
    pub fn queues_of_kind(&self, kind: QueueKind) -> Vec<(String, String)> {
        self.payload()
            .queues
            .iter()
            .filter(|q| q.kind == kind)
            .map(|q| (q.key.clone(), q.address.clone()))
            .collect()
    }

    /// Address of the queue for (kind, key), creating the queue object and
    /// committing the root entry if it does not exist yet.
    pub async fn add_or_get_queue_and_commit(
        &mut self,
        kind: QueueKind,
        key: &str,
        agent_ref: &AgentReference,
        backend: &dyn Backend,
    ) -> Result<String, ObjectError> {
        self.ensure_exclusive()?;
        if let Some(address) = self.queue_address(kind, key) {
            return Ok(address);
        }
        let address = agent_ref.next_id(&kind.address_prefix());
        match kind {
            QueueKind::Archive(_) => {
                insert_queue(&address, ArchiveQueueData::new_queue(key, kind), backend).await?
            }
            QueueKind::Retrieve(_) => {
                insert_queue(&address, RetrieveQueueData::new_queue(key, kind), backend).await?
            }
            QueueKind::Repack(_) => {
                insert_queue(&address, RepackQueueData::new_queue(key, kind), backend).await?
            }
        }
        self.payload_mut().queues.push(QueuePointer {
            kind,
            key: key.to_string(),
            address: address.clone(),
        });
        self.commit(backend).await?;
        info!(%kind, key, queue = %address, "created queue");
        Ok(address)
    }

    /// Delete the queue for (kind, key) if it is empty, dropping its pointer.
    pub async fn remove_queue_and_commit(
        &mut self,
        kind: QueueKind,
        key: &str,
        backend: &dyn Backend,
    ) -> Result<(), ObjectError> {
        self.ensure_exclusive()?;
        let Some(address) = self.queue_address(kind, key) else {
            return Err(ObjectError::NoSuchQueue {
                kind,
                key: key.to_string(),
            });
        };
        let empty = match kind {
            QueueKind::Archive(_) => remove_sharded_queue_if_empty::<ArchiveQueueData>(&address, backend).await?,
            QueueKind::Retrieve(_) => remove_sharded_queue_if_empty::<RetrieveQueueData>(&address, backend).await?,
            QueueKind::Repack(_) => match Object::<RepackQueueData>::lock_and_fetch(backend, &address).await {
                Ok(queue) => {
                    let empty = queue.is_empty();
                    if empty {
                        queue.remove(backend).await?;
                    }
                    Some(empty)
                }
                Err(e) if e.is_no_such_object() => None,
                Err(e) => return Err(e),
            },
        };
        if empty == Some(false) {
            return Err(ObjectError::QueueNotEmpty(address));
        }
        self.payload_mut()
            .queues
            .retain(|q| !(q.kind == kind && q.key == key));
        self.commit(backend).await?;
        info!(%kind, key, queue = %address, "removed queue");
        Ok(())
    }

    /// Drop the pointer for (kind, key) if it still names `address`, which was
    /// found missing from the store.
    pub async fn dereference_missing_queue_and_commit(
        &mut self,
        kind: QueueKind,
        key: &str,
        address: &str,
        backend: &dyn Backend,
    ) -> Result<(), ObjectError> {
        self.ensure_exclusive()?;
        if self.queue_address(kind, key).as_deref() != Some(address) {
            return Ok(());
        }
        self.payload_mut()
            .queues
            .retain(|q| !(q.kind == kind && q.key == key));
        self.commit(backend).await?;
        info!(%kind, key, queue = %address, "dereferenced missing queue");
        Ok(())
    }
}

async fn insert_if_absent<P: super::ObjectPayload>(
    object: &Object<P>,
    backend: &dyn Backend,
) -> Result<(), ObjectError> {
    match object.insert(backend).await {
        Ok(()) | Err(ObjectError::Backend(BackendError::ObjectExists(_))) => Ok(()),
        Err(e) => Err(e),
    }
}

async fn insert_queue<P: super::ObjectPayload>(
    address: &str,
    payload: P,
    backend: &dyn Backend,
) -> Result<(), ObjectError> {
    let mut queue = Object::new(address, payload);
    queue.set_owner(ROOT_ENTRY_ADDRESS);
    queue.insert(backend).await
}

/// Some(true) once the empty queue has been deleted, None when it was
/// already gone.
async fn remove_sharded_queue_if_empty<P: QueuePayload>(
    address: &str,
    backend: &dyn Backend,
) -> Result<Option<bool>, ObjectError> {
    match Object::<P>::lock_and_fetch(backend, address).await {
        Ok(queue) => {
            let empty = queue.is_empty();
            if empty {
                queue.remove(backend).await?;
            }
            Ok(Some(empty))
        }
        Err(e) if e.is_no_such_object() => Ok(None),
        Err(e) => Err(e),
    }
}
