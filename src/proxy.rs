//! A local handle for one remote instance. Methods are dispatched
//! dynamically by name; the set captured at creation time is advisory.

use crate::error::Error;
use crate::remote::Shared;
use crate::topic::Address;
use crate::tunnel::Arg;
use serde_json::{Map, Value};
use std::collections::BTreeSet;
use std::sync::Arc;

pub struct Proxy {
    shared: Arc<Shared>,
    domain: String,
    agent: String,
    class: String,
    target_id: String,
    proxy_id: String,
    methods: BTreeSet<String>,
}

impl Proxy {
    pub(crate) fn new(
        shared: Arc<Shared>,
        domain: String,
        agent: String,
        class: String,
        target_id: String,
        proxy_id: String,
        methods: Vec<String>,
    ) -> Self {
        Self {
            shared,
            domain,
            agent,
            class,
            target_id,
            proxy_id,
            methods: methods.into_iter().collect(),
        }
    }

    /// The remote instance id this proxy targets.
    pub fn target_id(&self) -> &str {
        &self.target_id
    }

    pub fn class_name(&self) -> &str {
        &self.class
    }

    /// Member functions known when the proxy was created, overload tags
    /// stripped and deduplicated.
    pub fn methods(&self) -> Vec<String> {
        self.methods.iter().cloned().collect()
    }

    pub fn has_method(&self, name: &str) -> bool {
        self.methods.contains(name)
    }

    /// Calls a member function. Callable arguments are tunneled; see
    /// [`Arg`].
    pub async fn call(&self, method: &str, args: Vec<Arg>) -> Result<Value, Error> {
        let topic = Address::new(
            &self.domain,
            &self.agent,
            &self.class,
            &self.target_id,
            method,
        )
        .to_string();
        let mut data = Map::new();
        self.shared
            .pack_args(&self.proxy_id, method, 0, args, &mut data);
        match self
            .shared
            .invoke(&topic, &self.target_id, method, data)
            .await
        {
            // Re-registering the same event handler is benign.
            Err(Error::Remote(e))
                if method == "on" && e.starts_with("Repeated event registration") =>
            {
                Ok(Value::Null)
            }
            Err(Error::Remote(e)) => Err(Error::Remote(format!(
                "remote function call '{method}' failed: {e}"
            ))),
            other => other,
        }
    }

    /// Registers `handler` for `event`. Registration is idempotent: the
    /// same tunnel id is reused for repeated calls with the same event.
    pub async fn on<F>(&self, event: &str, handler: F) -> Result<(), Error>
    where
        F: Fn(Vec<Value>) + Send + Sync + 'static,
    {
        self.call("on", vec![Arg::from(event), Arg::callback(handler)])
            .await
            .map(|_| ())
    }
}

impl Drop for Proxy {
    fn drop(&mut self) {
        self.shared.tunnels.remove_scope(&self.proxy_id);
    }
}
