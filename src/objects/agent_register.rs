use rkyv::{Archive, Deserialize as RkyvDeserialize, Serialize as RkyvSerialize};

use super::{Object, ObjectType};

/// Every agent the garbage collector should watch.
#[derive(Debug, Clone, Default, PartialEq, Eq, Archive, RkyvSerialize, RkyvDeserialize)]
#[archive(check_bytes)]
pub struct AgentRegisterData {
    pub agents: Vec<String>,
    /// Agents registered but not yet watched by any collector.
    pub untracked_agents: Vec<String>,
}

object_payload!(AgentRegisterData, ObjectType::AgentRegister);

pub type AgentRegister = Object<AgentRegisterData>;

impl Object<AgentRegisterData> {
    pub fn add_agent(&mut self, address: &str) {
        let payload = self.payload_mut();
        if !payload.agents.iter().any(|a| a == address) {
            payload.agents.push(address.to_string());
            payload.untracked_agents.push(address.to_string());
        }
    }

    pub fn remove_agent(&mut self, address: &str) {
        let payload = self.payload_mut();
        payload.agents.retain(|a| a != address);
        payload.untracked_agents.retain(|a| a != address);
    }

    pub fn track_agent(&mut self, address: &str) {
        self.payload_mut().untracked_agents.retain(|a| a != address);
    }

    pub fn agents(&self) -> &[String] {
        &self.payload().agents
    }

    pub fn untracked_agents(&self) -> &[String] {
        &self.payload().untracked_agents
    }
}
