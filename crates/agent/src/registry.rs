//! Capability and agent registry.
//!
//! Wants declare `requires: [tag]`; capabilities declare the tags they
//! `gives`; agents declare the capabilities they provide. Resolution walks
//! tag → capabilities → agents.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::debug;

use crate::agent::Agent;
use crate::capability::Capability;

/// Allowed state keys for one agent, unioned over its capabilities.
/// Empty sets mean "no declared access" and disable the warning check.
#[derive(Debug, Clone, Default)]
pub struct AgentSpec {
    pub allowed_state: HashSet<String>,
    pub allowed_parent_state: HashSet<String>,
}

#[derive(Default)]
pub struct AgentRegistry {
    capabilities: RwLock<HashMap<String, Capability>>,
    agents: RwLock<HashMap<String, Arc<dyn Agent>>>,
}

impl AgentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_capability(&self, capability: Capability) {
        debug!(capability = %capability.name, gives = ?capability.gives, "registered capability");
        self.capabilities
            .write()
            .insert(capability.name.clone(), capability);
    }

    pub fn register_capabilities(&self, capabilities: Vec<Capability>) {
        for cap in capabilities {
            self.register_capability(cap);
        }
    }

    pub fn register_agent(&self, agent: Arc<dyn Agent>) {
        debug!(agent = agent.name(), kind = %agent.kind(), "registered agent");
        self.agents.write().insert(agent.name().to_string(), agent);
    }

    pub fn capability(&self, name: &str) -> Option<Capability> {
        self.capabilities.read().get(name).cloned()
    }

    pub fn agent(&self, name: &str) -> Option<Arc<dyn Agent>> {
        self.agents.read().get(name).cloned()
    }

    /// Agents able to satisfy a required tag: any agent providing a
    /// capability whose `gives` contains the tag. A capability name itself
    /// also matches, so `requires` can name either.
    pub fn agents_for_requirement(&self, tag: &str) -> Vec<Arc<dyn Agent>> {
        let capabilities = self.capabilities.read();
        let matching: HashSet<&str> = capabilities
            .values()
            .filter(|c| c.name == tag || c.gives.iter().any(|g| g == tag))
            .map(|c| c.name.as_str())
            .collect();

        let agents = self.agents.read();
        let mut out: Vec<Arc<dyn Agent>> = agents
            .values()
            .filter(|a| a.capabilities().iter().any(|c| matching.contains(c.as_str())))
            .cloned()
            .collect();
        out.sort_by(|a, b| a.name().cmp(b.name()));
        out
    }

    /// Build the allowed-key sets for an agent from its capabilities.
    pub fn agent_spec(&self, agent_name: &str) -> AgentSpec {
        let agents = self.agents.read();
        let Some(agent) = agents.get(agent_name) else {
            return AgentSpec::default();
        };
        let capabilities = self.capabilities.read();
        let mut spec = AgentSpec::default();
        for cap_name in agent.capabilities() {
            if let Some(cap) = capabilities.get(&cap_name) {
                for access in &cap.state_access {
                    if access.access_type.allows_write() {
                        spec.allowed_state.insert(access.name.clone());
                    }
                }
                for access in &cap.parent_state_access {
                    if access.access_type.allows_write() {
                        spec.allowed_parent_state.insert(access.name.clone());
                    }
                }
            }
        }
        spec
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::{AgentHost, AgentKind};
    use crate::capability::{AccessType, StateAccess};
    use crate::error::AgentError;
    use async_trait::async_trait;

    struct StubAgent {
        name: &'static str,
        caps: Vec<String>,
    }

    #[async_trait]
    impl Agent for StubAgent {
        fn name(&self) -> &str {
            self.name
        }

        fn kind(&self) -> AgentKind {
            AgentKind::Do
        }

        fn capabilities(&self) -> Vec<String> {
            self.caps.clone()
        }

        async fn run(&self, _host: Arc<dyn AgentHost>) -> Result<(), AgentError> {
            Ok(())
        }
    }

    fn cost_capability() -> Capability {
        Capability {
            name: "cost_tracking".into(),
            gives: vec!["track_costs".into()],
            state_access: vec![StateAccess {
                name: "total_cost".into(),
                type_name: "number".into(),
                description: String::new(),
                access_type: AccessType::ReadUpdate,
            }],
            parent_state_access: vec![StateAccess {
                name: "costs".into(),
                type_name: "object".into(),
                description: String::new(),
                access_type: AccessType::Update,
            }],
        }
    }

    #[test]
    fn resolves_agents_by_gives_tag_and_capability_name() {
        let registry = AgentRegistry::new();
        registry.register_capability(cost_capability());
        registry.register_agent(Arc::new(StubAgent {
            name: "coster",
            caps: vec!["cost_tracking".into()],
        }));
        registry.register_agent(Arc::new(StubAgent {
            name: "unrelated",
            caps: vec!["other".into()],
        }));

        let by_tag = registry.agents_for_requirement("track_costs");
        assert_eq!(by_tag.len(), 1);
        assert_eq!(by_tag[0].name(), "coster");

        let by_name = registry.agents_for_requirement("cost_tracking");
        assert_eq!(by_name.len(), 1);

        assert!(registry.agents_for_requirement("missing").is_empty());
    }

    #[test]
    fn agent_spec_unions_writable_keys() {
        let registry = AgentRegistry::new();
        registry.register_capability(cost_capability());
        registry.register_agent(Arc::new(StubAgent {
            name: "coster",
            caps: vec!["cost_tracking".into()],
        }));

        let spec = registry.agent_spec("coster");
        assert!(spec.allowed_state.contains("total_cost"));
        assert!(spec.allowed_parent_state.contains("costs"));

        // unknown agent gets an empty (permissive) spec
        assert!(registry.agent_spec("ghost").allowed_state.is_empty());
    }
}
