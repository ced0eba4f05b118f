//! The availability tree: the remote's eventually-consistent view of which
//! agents, classes and instances are reachable, rebuilt from retained
//! `__info__` messages. Mutated only on the inbound-message path; observers
//! take snapshots.

use crate::wire::{signature_base, AgentInfo, ClassInfo, Status};
use std::collections::BTreeMap;

/// Emitted to observers whenever a retained `__info__` message changes the
/// tree.
#[derive(Debug, Clone)]
pub enum DiscoveryEvent {
    Agent {
        domain: String,
        agent: String,
        status: Status,
        hostname: String,
    },
    Class {
        domain: String,
        agent: String,
        class_info: ClassInfo,
    },
}

#[derive(Debug, Clone)]
pub struct AgentEntry {
    pub status: Status,
    pub hostname: String,
    pub classes: BTreeMap<String, ClassInfo>,
}

/// Snapshot of the whole tree: `domain → agent → entry`.
#[derive(Debug, Clone, Default)]
pub struct Availability {
    domains: BTreeMap<String, BTreeMap<String, AgentEntry>>,
}

impl Availability {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn clear(&mut self) {
        self.domains.clear();
    }

    pub(crate) fn apply_agent_info(
        &mut self,
        domain: &str,
        agent: &str,
        info: AgentInfo,
    ) -> DiscoveryEvent {
        let entry = self.entry(domain, agent);
        entry.status = info.status;
        entry.hostname = info.hostname.clone();
        DiscoveryEvent::Agent {
            domain: domain.to_owned(),
            agent: agent.to_owned(),
            status: info.status,
            hostname: info.hostname,
        }
    }

    pub(crate) fn apply_class_info(
        &mut self,
        domain: &str,
        agent: &str,
        info: ClassInfo,
    ) -> DiscoveryEvent {
        let entry = self.entry(domain, agent);
        entry.classes.insert(info.class_name.clone(), info.clone());
        DiscoveryEvent::Class {
            domain: domain.to_owned(),
            agent: agent.to_owned(),
            class_info: info,
        }
    }

    // Retained class info doubles as a liveness hint: an entry created by
    // it starts online until the will says otherwise.
    fn entry(&mut self, domain: &str, agent: &str) -> &mut AgentEntry {
        self.domains
            .entry(domain.to_owned())
            .or_default()
            .entry(agent.to_owned())
            .or_insert_with(|| AgentEntry {
                status: Status::Online,
                hostname: String::new(),
                classes: BTreeMap::new(),
            })
    }

    pub fn domains(&self) -> Vec<String> {
        self.domains.keys().cloned().collect()
    }

    /// Agents currently online in `domain`. Offline entries stay in the
    /// tree (see [`Availability::agent`]) but are not selectable.
    pub fn agents(&self, domain: &str) -> Vec<String> {
        self.domains
            .get(domain)
            .map(|agents| {
                agents
                    .iter()
                    .filter(|(_, e)| e.status == Status::Online)
                    .map(|(name, _)| name.clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn agent(&self, domain: &str, agent: &str) -> Option<&AgentEntry> {
        self.domains.get(domain)?.get(agent)
    }

    pub fn classes(&self, domain: &str, agent: &str) -> Vec<String> {
        self.agent(domain, agent)
            .map(|e| e.classes.keys().cloned().collect())
            .unwrap_or_default()
    }

    pub fn instances(&self, domain: &str, agent: &str, class: &str) -> Vec<String> {
        self.class_info(domain, agent, class)
            .map(|c| c.instances.clone())
            .unwrap_or_default()
    }

    /// Member-function names with overload tags stripped and duplicates
    /// removed.
    pub fn member_functions(&self, domain: &str, agent: &str, class: &str) -> Vec<String> {
        self.class_info(domain, agent, class)
            .map(|c| strip_signatures(&c.member_functions))
            .unwrap_or_default()
    }

    pub fn static_functions(&self, domain: &str, agent: &str, class: &str) -> Vec<String> {
        self.class_info(domain, agent, class)
            .map(|c| strip_signatures(&c.static_functions))
            .unwrap_or_default()
    }

    pub fn class_info(&self, domain: &str, agent: &str, class: &str) -> Option<&ClassInfo> {
        self.agent(domain, agent)?.classes.get(class)
    }
}

fn strip_signatures(names: &[String]) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    for name in names {
        let base = signature_base(name).to_owned();
        if !out.contains(&base) {
            out.push(base);
        }
    }
    out
}
