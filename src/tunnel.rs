//! Callback tunneling: callable arguments become tunnel-id strings on the
//! wire, and a local sink table routes the agent's backward invocations to
//! the original closures.

use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

/// Prefix every tunnel id carries on the wire.
pub const TUNNEL_PREFIX: &str = "__f__";

/// A local delivery sink for a tunneled callable.
pub type Callback = Arc<dyn Fn(Vec<Value>) + Send + Sync>;

/// Anything that can fan an event out locally. Used for `{emitter, event}`
/// argument pairs: the agent's emissions arrive as `emit(event, args)`.
pub trait EventEmitter: Send + Sync {
    fn emit(&self, event: &str, args: Vec<Value>);
}

/// One argument of a remote call.
pub enum Arg {
    /// A plain value, sent as-is.
    Value(Value),
    /// A callable, replaced by a tunnel id.
    Callback(Callback),
    /// An emitter/event pair, replaced by a persistent tunnel id.
    Emitter {
        emitter: Arc<dyn EventEmitter>,
        event: String,
    },
}

impl Arg {
    pub fn callback<F>(f: F) -> Arg
    where
        F: Fn(Vec<Value>) + Send + Sync + 'static,
    {
        Arg::Callback(Arc::new(f))
    }

    pub fn emitter(emitter: Arc<dyn EventEmitter>, event: impl Into<String>) -> Arg {
        Arg::Emitter {
            emitter,
            event: event.into(),
        }
    }
}

impl From<Value> for Arg {
    fn from(v: Value) -> Self {
        Arg::Value(v)
    }
}

impl From<&str> for Arg {
    fn from(v: &str) -> Self {
        Arg::Value(Value::from(v))
    }
}

impl From<String> for Arg {
    fn from(v: String) -> Self {
        Arg::Value(Value::from(v))
    }
}

impl From<bool> for Arg {
    fn from(v: bool) -> Self {
        Arg::Value(Value::from(v))
    }
}

impl From<i32> for Arg {
    fn from(v: i32) -> Self {
        Arg::Value(Value::from(v))
    }
}

impl From<i64> for Arg {
    fn from(v: i64) -> Self {
        Arg::Value(Value::from(v))
    }
}

impl From<u32> for Arg {
    fn from(v: u32) -> Self {
        Arg::Value(Value::from(v))
    }
}

impl From<u64> for Arg {
    fn from(v: u64) -> Self {
        Arg::Value(Value::from(v))
    }
}

impl From<f64> for Arg {
    fn from(v: f64) -> Self {
        Arg::Value(Value::from(v))
    }
}

struct Sink {
    persistent: bool,
    deliver: Callback,
}

/// Table of live tunnels, keyed by tunnel id. One-shot entries vanish after
/// their first delivery; persistent entries live until their proxy scope is
/// torn down.
#[derive(Default)]
pub(crate) struct TunnelTable {
    sinks: Mutex<HashMap<String, Sink>>,
    counter: AtomicU64,
}

impl TunnelTable {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Registers a one-shot sink and returns its tunnel id
    /// `__f__{scope}-{method}-{index}-{counter}`.
    pub(crate) fn insert_one_shot(
        &self,
        scope: &str,
        method: &str,
        index: usize,
        deliver: Callback,
    ) -> String {
        let n = self.counter.fetch_add(1, Ordering::Relaxed);
        let id = format!("{TUNNEL_PREFIX}{scope}-{method}-{index}-{n}");
        self.insert(id.clone(), false, deliver);
        id
    }

    /// Registers a persistent sink under a caller-chosen suffix (the event
    /// name). Re-registration under the same suffix replaces the sink, which
    /// makes `on`-style registration idempotent.
    pub(crate) fn insert_persistent(
        &self,
        scope: &str,
        method: &str,
        index: usize,
        suffix: &str,
        deliver: Callback,
    ) -> String {
        let id = format!("{TUNNEL_PREFIX}{scope}-{method}-{index}-{suffix}");
        self.insert(id.clone(), true, deliver);
        id
    }

    fn insert(&self, id: String, persistent: bool, deliver: Callback) {
        if let Ok(mut sinks) = self.sinks.lock() {
            sinks.insert(id, Sink { persistent, deliver });
        }
    }

    /// Routes an inbound message to its sink. Returns `false` when `id` is
    /// not a known tunnel id.
    pub(crate) fn deliver(&self, id: &str, args: Vec<Value>) -> bool {
        if !id.starts_with(TUNNEL_PREFIX) {
            return false;
        }
        let deliver = {
            let Ok(mut sinks) = self.sinks.lock() else {
                return false;
            };
            let persistent = match sinks.get(id) {
                Some(sink) => sink.persistent,
                None => return false,
            };
            if persistent {
                sinks.get(id).map(|sink| sink.deliver.clone())
            } else {
                sinks.remove(id).map(|sink| sink.deliver)
            }
        };
        let Some(deliver) = deliver else {
            return false;
        };
        deliver(args);
        true
    }

    /// Removes every sink belonging to one proxy scope.
    pub(crate) fn remove_scope(&self, scope: &str) {
        let prefix = format!("{TUNNEL_PREFIX}{scope}-");
        if let Ok(mut sinks) = self.sinks.lock() {
            sinks.retain(|id, _| !id.starts_with(&prefix));
        }
    }

    pub(crate) fn clear(&self) {
        if let Ok(mut sinks) = self.sinks.lock() {
            sinks.clear();
        }
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.sinks.lock().map(|s| s.len()).unwrap_or(0)
    }
}
