//! Recovery of objects left owned by dead agents.
//!
//! The collector watches the heartbeat counter of every registered agent. An
//! agent whose counter has not moved for longer than its timeout is declared
//! dead: each object it owns is handed back to a queue (or the root entry)
//! and the empty agent is deleted and unregistered.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::agent_reference::AgentReference;
use crate::algorithms::AlgorithmError;
use crate::backend::Backend;
use crate::catalogue::{Catalogue, CatalogueError};
use crate::helpers::RetrieveQueueStatsCache;
use crate::keys::ROOT_ENTRY_ADDRESS;
use crate::objects::{Agent, AgentRegister, AnyObject, GenericObject, ObjectError, RootEntry};

#[derive(Debug, Error)]
pub enum GcError {
    #[error(transparent)]
    Object(#[from] ObjectError),
    #[error(transparent)]
    Catalogue(#[from] CatalogueError),
    #[error(transparent)]
    Algorithm(#[from] AlgorithmError),
}

/// What garbage collection of one object needs.
#[derive(Clone)]
pub struct GcContext {
    /// The collecting process, owner of anything it takes over.
    pub agent_ref: Arc<AgentReference>,
    pub backend: Arc<dyn Backend>,
    pub catalogue: Arc<dyn Catalogue>,
    pub stats_cache: Arc<RetrieveQueueStatsCache>,
}

struct WatchedAgent {
    heartbeat_count: u64,
    last_change: Instant,
    timeout: Duration,
}

pub struct GarbageCollector {
    ctx: GcContext,
    watched: HashMap<String, WatchedAgent>,
}

impl GarbageCollector {
    pub fn new(ctx: GcContext) -> Self {
        Self {
            ctx,
            watched: HashMap::new(),
        }
    }

    pub fn context(&self) -> &GcContext {
        &self.ctx
    }

    /// One pass over the agent register. Returns the agents collected.
    pub async fn run_once(&mut self) -> Result<Vec<String>, GcError> {
        let backend = self.ctx.backend.clone();
        let root = RootEntry::fetch_no_lock(backend.as_ref(), ROOT_ENTRY_ADDRESS).await?;
        let register_address = root.agent_register_address().to_string();
        let register = AgentRegister::fetch_no_lock(backend.as_ref(), &register_address).await?;
        let registered: HashSet<String> = register.agents().iter().cloned().collect();
        self.watched.retain(|address, _| registered.contains(address));

        let mut newly_tracked = Vec::new();
        let mut dead = Vec::new();
        for address in register.agents() {
            if address == self.ctx.agent_ref.address() {
                continue;
            }
            let agent = match Agent::fetch_no_lock(backend.as_ref(), address).await {
                Ok(agent) => agent,
                Err(e) if e.is_no_such_object() => {
                    warn!(agent = %address, "registered agent does not exist, unregistering it");
                    AgentRegister::update(backend.as_ref(), &register_address, |r| {
                        r.remove_agent(address);
                        Ok(())
                    })
                    .await?;
                    self.watched.remove(address);
                    continue;
                }
                Err(e) => return Err(e.into()),
            };
            let count = agent.heartbeat_count();
            let timeout = Duration::from_millis(agent.timeout_ms());
            match self.watched.get_mut(address) {
                None => {
                    debug!(agent = %address, heartbeat = count, "watching new agent");
                    self.watched.insert(
                        address.clone(),
                        WatchedAgent {
                            heartbeat_count: count,
                            last_change: Instant::now(),
                            timeout,
                        },
                    );
                    newly_tracked.push(address.clone());
                    if agent.needs_gc() {
                        dead.push(address.clone());
                    }
                }
                Some(watched) if watched.heartbeat_count != count => {
                    watched.heartbeat_count = count;
                    watched.last_change = Instant::now();
                    watched.timeout = timeout;
                }
                Some(watched) => {
                    if agent.needs_gc() || watched.last_change.elapsed() > watched.timeout {
                        info!(agent = %address, heartbeat = count, "agent heartbeat stalled, declaring it dead");
                        dead.push(address.clone());
                    }
                }
            }
        }
        if !newly_tracked.is_empty() {
            AgentRegister::update(backend.as_ref(), &register_address, |r| {
                for address in &newly_tracked {
                    r.track_agent(address);
                }
                Ok(())
            })
            .await?;
        }

        let mut collected = Vec::new();
        for address in dead {
            match self.collect_agent(&address).await {
                Ok(true) => {
                    self.watched.remove(&address);
                    collected.push(address);
                }
                Ok(false) => {}
                Err(e) => error!(agent = %address, error = %e, "garbage collection of agent failed"),
            }
        }
        Ok(collected)
    }

    /// Requeue everything owned by the dead agent at `agent_address`, then
    /// delete and unregister it. Returns false when some objects could not be
    /// collected and the agent was kept.
    pub async fn collect_agent(&self, agent_address: &str) -> Result<bool, GcError> {
        let backend = self.ctx.backend.as_ref();
        let ownership = Agent::update(backend, agent_address, |agent| {
            agent.set_needs_gc(true);
            Ok(agent.ownership_list().to_vec())
        })
        .await?;
        info!(agent = %agent_address, objects = ownership.len(), "garbage collecting agent");

        let mut failures = 0;
        for address in ownership {
            match self.collect_object(&address, agent_address).await {
                Ok(()) => {
                    Agent::update(backend, agent_address, |agent| {
                        agent.remove_from_ownership(&address);
                        Ok(())
                    })
                    .await?;
                }
                Err(e) => {
                    failures += 1;
                    error!(agent = %agent_address, object = %address, error = %e, "could not garbage collect object");
                }
            }
        }
        if failures > 0 {
            warn!(agent = %agent_address, failures, "agent keeps objects that could not be collected");
            return Ok(false);
        }

        let agent = Agent::lock_and_fetch(backend, agent_address).await?;
        if !agent.is_empty() {
            warn!(agent = %agent_address, "agent gained objects while being collected, keeping it");
            return Ok(false);
        }
        let register_address = agent.owner().to_string();
        agent.remove(backend).await?;
        AgentRegister::update(backend, &register_address, |r| {
            r.remove_agent(agent_address);
            Ok(())
        })
        .await?;
        info!(agent = %agent_address, "removed garbage collected agent");
        Ok(true)
    }

    /// Garbage collect one object presumed owned by `presumed_owner`.
    pub async fn collect_object(&self, address: &str, presumed_owner: &str) -> Result<(), GcError> {
        let backend = self.ctx.backend.as_ref();
        let object = match GenericObject::lock_and_fetch(backend, address).await {
            Ok(object) => object,
            Err(e) if e.is_no_such_object() => {
                debug!(object = %address, "owned object no longer exists");
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        };
        match object.into_typed()? {
            AnyObject::ArchiveRequest(request) => request.garbage_collect(presumed_owner, &self.ctx).await,
            AnyObject::RetrieveRequest(request) => request.garbage_collect(presumed_owner, &self.ctx).await,
            AnyObject::RepackRequest(request) => request.garbage_collect(presumed_owner, &self.ctx).await,
            AnyObject::ArchiveQueue(queue) => Ok(queue.garbage_collect_queue(presumed_owner, backend).await?),
            AnyObject::RetrieveQueue(queue) => Ok(queue.garbage_collect_queue(presumed_owner, backend).await?),
            AnyObject::RepackQueue(queue) => Ok(queue.garbage_collect_queue(presumed_owner, backend).await?),
            other => {
                warn!(object = %address, kind = other.kind_name(), "object type is not garbage collected, leaving it in place");
                Ok(())
            }
        }
    }
}
