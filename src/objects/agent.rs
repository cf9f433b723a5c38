use rkyv::{Archive, Deserialize as RkyvDeserialize, Serialize as RkyvSerialize};

use super::{Object, ObjectType};

/// Durable record of one live process: what it owns and whether it is alive.
#[derive(Debug, Clone, Default, PartialEq, Eq, Archive, RkyvSerialize, RkyvDeserialize)]
#[archive(check_bytes)]
pub struct AgentData {
    pub description: String,
    /// Bumped by the heartbeat task; the garbage collector watches it move.
    pub heartbeat_count: u64,
    pub timeout_ms: u64,
    pub ownership: Vec<String>,
    /// Set by the garbage collector once the agent is declared dead.
    pub needs_gc: bool,
}

object_payload!(AgentData, ObjectType::Agent);

pub type Agent = Object<AgentData>;

impl Object<AgentData> {
    pub fn add_to_ownership(&mut self, address: &str) {
        if !self.payload().ownership.iter().any(|a| a == address) {
            self.payload_mut().ownership.push(address.to_string());
        }
    }

    pub fn remove_from_ownership(&mut self, address: &str) {
        self.payload_mut().ownership.retain(|a| a != address);
    }

    pub fn owns(&self, address: &str) -> bool {
        self.payload().ownership.iter().any(|a| a == address)
    }

    pub fn ownership_list(&self) -> &[String] {
        &self.payload().ownership
    }

    pub fn is_empty(&self) -> bool {
        self.payload().ownership.is_empty()
    }

    pub fn bump_heartbeat(&mut self) {
        self.payload_mut().heartbeat_count += 1;
    }

    pub fn heartbeat_count(&self) -> u64 {
        self.payload().heartbeat_count
    }

    pub fn timeout_ms(&self) -> u64 {
        self.payload().timeout_ms
    }

    pub fn needs_gc(&self) -> bool {
        self.payload().needs_gc
    }

    pub fn set_needs_gc(&mut self, needs_gc: bool) {
        self.payload_mut().needs_gc = needs_gc;
    }
}
