//! Process identity and batched updates of its Agent object.
//!
//! Concurrent ownership changes are coalesced: the first caller of a round
//! becomes its servicer and applies every action that joined before it
//! started, in one lock/fetch/commit of the Agent. Rounds are chained so
//! successive commits never reorder.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use futures::future::{FutureExt, Shared};
use tokio::sync::oneshot;
use tracing::{debug, info};

use crate::backend::Backend;
use crate::keys::{agent_address, child_address, ROOT_ENTRY_ADDRESS};
use crate::objects::{Agent, AgentData, AgentRegister, ObjectError, RootEntry};

#[derive(Debug, Clone)]
enum AgentAction {
    Add(String),
    Remove(String),
    AddBatch(Vec<String>),
    RemoveBatch(Vec<String>),
    Heartbeat,
}

struct PendingAction {
    action: AgentAction,
    reply: oneshot::Sender<Result<(), ObjectError>>,
}

#[derive(Default)]
struct Batching {
    forming: Option<Vec<PendingAction>>,
    previous_done: Option<Shared<oneshot::Receiver<()>>>,
}

pub struct AgentReference {
    address: String,
    next_sequence: AtomicU64,
    batching: Mutex<Batching>,
}

impl AgentReference {
    /// Identity for this process: program, host, pid, start time and a random suffix.
    pub fn new(program: &str, host: &str) -> Self {
        let suffix = uuid::Uuid::new_v4().simple().to_string();
        let address = agent_address(
            program,
            host,
            std::process::id(),
            chrono::Utc::now().timestamp(),
            &suffix[..8],
        );
        Self::with_address(address)
    }

    pub fn with_address(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            next_sequence: AtomicU64::new(0),
            batching: Mutex::new(Batching::default()),
        }
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    /// A fresh address for an object created by this agent. Never blocks.
    pub fn next_id(&self, child_type: &str) -> String {
        let sequence = self.next_sequence.fetch_add(1, Ordering::Relaxed);
        child_address(child_type, &self.address, sequence)
    }

    /// Create the Agent object and list it in the agent register.
    pub async fn register(&self, backend: &dyn Backend, description: &str, timeout_ms: u64) -> Result<(), ObjectError> {
        RootEntry::initialize(backend).await?;
        let root = RootEntry::fetch_no_lock(backend, ROOT_ENTRY_ADDRESS).await?;
        let register_address = root.agent_register_address().to_string();
        let mut agent = Agent::new(
            self.address.clone(),
            AgentData {
                description: description.to_string(),
                timeout_ms,
                ..Default::default()
            },
        );
        agent.set_owner(register_address.clone());
        agent.insert(backend).await?;
        let address = self.address.clone();
        AgentRegister::update(backend, &register_address, |register| {
            register.add_agent(&address);
            Ok(())
        })
        .await?;
        info!(agent = %self.address, "registered agent");
        Ok(())
    }

    /// Delete the Agent object, which must own nothing, and drop it from the register.
    pub async fn unregister(&self, backend: &dyn Backend) -> Result<(), ObjectError> {
        let agent = Agent::lock_and_fetch(backend, &self.address).await?;
        if !agent.is_empty() {
            return Err(ObjectError::Inconsistent {
                address: self.address.clone(),
                reason: format!("agent still owns {} objects", agent.ownership_list().len()),
            });
        }
        let register_address = agent.owner().to_string();
        agent.remove(backend).await?;
        let address = self.address.clone();
        AgentRegister::update(backend, &register_address, |register| {
            register.remove_agent(&address);
            Ok(())
        })
        .await?;
        info!(agent = %self.address, "unregistered agent");
        Ok(())
    }

    pub async fn add_to_ownership(&self, address: &str, backend: &dyn Backend) -> Result<(), ObjectError> {
        self.queue_and_execute(AgentAction::Add(address.to_string()), backend)
            .await
    }

    pub async fn remove_from_ownership(&self, address: &str, backend: &dyn Backend) -> Result<(), ObjectError> {
        self.queue_and_execute(AgentAction::Remove(address.to_string()), backend)
            .await
    }

    pub async fn add_batch_to_ownership(&self, addresses: &[String], backend: &dyn Backend) -> Result<(), ObjectError> {
        if addresses.is_empty() {
            return Ok(());
        }
        self.queue_and_execute(AgentAction::AddBatch(addresses.to_vec()), backend)
            .await
    }

    pub async fn remove_batch_from_ownership(
        &self,
        addresses: &[String],
        backend: &dyn Backend,
    ) -> Result<(), ObjectError> {
        if addresses.is_empty() {
            return Ok(());
        }
        self.queue_and_execute(AgentAction::RemoveBatch(addresses.to_vec()), backend)
            .await
    }

    pub async fn bump_heartbeat(&self, backend: &dyn Backend) -> Result<(), ObjectError> {
        self.queue_and_execute(AgentAction::Heartbeat, backend).await
    }

    async fn queue_and_execute(&self, action: AgentAction, backend: &dyn Backend) -> Result<(), ObjectError> {
        let (reply, result) = oneshot::channel();
        let pending = PendingAction { action, reply };
        let service = {
            let mut batching = self.batching.lock().unwrap();
            match batching.forming.as_mut() {
                Some(batch) => {
                    batch.push(pending);
                    None
                }
                None => {
                    batching.forming = Some(vec![pending]);
                    let (done_tx, done_rx) = oneshot::channel();
                    let previous = batching.previous_done.replace(done_rx.shared());
                    Some((previous, done_tx))
                }
            }
        };

        if let Some((previous, done_tx)) = service {
            if let Some(previous) = previous {
                // a dropped sender also means the previous round is over
                let _ = previous.await;
            }
            let batch = self.batching.lock().unwrap().forming.take().unwrap_or_default();
            self.apply_batch(batch, backend).await;
            let _ = done_tx.send(());
        }

        result.await.unwrap_or_else(|_| {
            Err(ObjectError::Inconsistent {
                address: self.address.clone(),
                reason: "ownership batch abandoned".to_string(),
            })
        })
    }

    async fn apply_batch(&self, batch: Vec<PendingAction>, backend: &dyn Backend) {
        let actions: Vec<AgentAction> = batch.iter().map(|p| p.action.clone()).collect();
        let size = actions.len();
        let result = Agent::update(backend, &self.address, |agent| {
            for action in actions {
                match action {
                    AgentAction::Add(address) => agent.add_to_ownership(&address),
                    AgentAction::Remove(address) => agent.remove_from_ownership(&address),
                    AgentAction::AddBatch(addresses) => {
                        for address in addresses {
                            agent.add_to_ownership(&address);
                        }
                    }
                    AgentAction::RemoveBatch(addresses) => {
                        for address in addresses {
                            agent.remove_from_ownership(&address);
                        }
                    }
                    AgentAction::Heartbeat => agent.bump_heartbeat(),
                }
            }
            Ok(())
        })
        .await;
        debug!(agent = %self.address, actions = size, ok = result.is_ok(), "applied agent ownership batch");
        for pending in batch {
            let _ = pending.reply.send(result.clone());
        }
    }
}
