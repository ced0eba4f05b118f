use std::fmt;

/// Target segment for class-level (static) dispatch.
pub const STATIC_TARGET: &str = "__static__";
/// Class token carrying agent-level presence.
pub const AGENT_CLASS: &str = "__agent__";
/// Method segment of retained discovery messages.
pub const INFO_METHOD: &str = "__info__";

pub const CREATE: &str = "__create__";
pub const CREATE_NAMED: &str = "__createNamed__";
pub const GET_NAMED: &str = "__getNamed__";
pub const DELETE: &str = "__delete__";

/// A fully qualified dispatch endpoint: exactly five slash-delimited
/// segments, `{domain}/{agent}/{class}/{target}/{method}`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Address {
    pub domain: String,
    pub agent: String,
    pub class: String,
    pub target: String,
    pub method: String,
}

impl Address {
    pub fn new(
        domain: impl Into<String>,
        agent: impl Into<String>,
        class: impl Into<String>,
        target: impl Into<String>,
        method: impl Into<String>,
    ) -> Self {
        Self {
            domain: domain.into(),
            agent: agent.into(),
            class: class.into(),
            target: target.into(),
            method: method.into(),
        }
    }

    /// Parses a dispatch topic. Returns `None` unless the topic has exactly
    /// five non-empty segments.
    pub fn parse(topic: &str) -> Option<Address> {
        let mut parts = topic.split('/');
        let addr = Address {
            domain: parts.next()?.to_owned(),
            agent: parts.next()?.to_owned(),
            class: parts.next()?.to_owned(),
            target: parts.next()?.to_owned(),
            method: parts.next()?.to_owned(),
        };
        if parts.next().is_some() {
            return None;
        }
        let all = [
            &addr.domain,
            &addr.agent,
            &addr.class,
            &addr.target,
            &addr.method,
        ];
        if all.iter().any(|s| s.is_empty()) {
            return None;
        }
        Some(addr)
    }

    pub fn is_static(&self) -> bool {
        self.target == STATIC_TARGET
    }

    pub fn is_info(&self) -> bool {
        self.is_static() && self.method == INFO_METHOD
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}/{}/{}/{}",
            self.domain, self.agent, self.class, self.target, self.method
        )
    }
}

/// Matches a subscription filter against a concrete topic, with `+` for a
/// single level and `#` for the remaining levels.
pub(crate) fn matches(filter: &str, topic: &str) -> bool {
    let mut f = filter.split('/');
    let mut t = topic.split('/');
    loop {
        match (f.next(), t.next()) {
            (Some("#"), _) => return true,
            (Some("+"), Some(_)) => {}
            (Some(a), Some(b)) if a == b => {}
            (None, None) => return true,
            _ => return false,
        }
    }
}

/// A usable topic segment: non-empty, no separators, no wildcards.
pub(crate) fn valid_segment(s: &str) -> bool {
    !s.is_empty() && !s.contains(['/', '+', '#']) && s != "*"
}
