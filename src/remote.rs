//! The client side: connects to the broker, maintains the availability
//! tree from retained `__info__` messages, issues requests and correlates
//! replies arriving on its private inbox, and projects local callables into
//! remote calls through the tunnel table.

use crate::correlator::Correlator;
use crate::discovery::{Availability, DiscoveryEvent};
use crate::error::{Error, TransportError};
use crate::ident::{self, CallIds};
use crate::proxy::Proxy;
use crate::topic::{
    self, Address, AGENT_CLASS, CREATE, CREATE_NAMED, DELETE, GET_NAMED, INFO_METHOD,
    STATIC_TARGET,
};
use crate::transport::{
    mqtt::{MqttConnector, DEFAULT_BROKER},
    ConnectOptions, Connection, Connector, Credentials, Inbound, Publication,
};
use crate::tunnel::{Arg, Callback, TunnelTable};
use crate::wire::{self, AgentInfo, ClassInfo, RpcMessage};
use serde_json::{Map, Value};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::sync::{broadcast, watch};
use tracing::{debug, warn};

/// Grace period after connect for retained discovery info to arrive.
const SETTLE: Duration = Duration::from_millis(200);

const DEFAULT_TIMEOUT: Duration = Duration::from_millis(5000);

#[derive(Debug, Clone)]
pub struct RemoteOptions {
    broker: String,
    domain: String,
    agent: String,
    token: Option<String>,
    username: Option<String>,
    password: Option<String>,
    timeout: Duration,
}

impl Default for RemoteOptions {
    fn default() -> Self {
        Self {
            broker: DEFAULT_BROKER.to_owned(),
            domain: "*".to_owned(),
            agent: "*".to_owned(),
            token: None,
            username: None,
            password: None,
            timeout: DEFAULT_TIMEOUT,
        }
    }
}

impl RemoteOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn broker(mut self, url: impl Into<String>) -> Self {
        self.broker = url.into();
        self
    }

    /// Default domain for all operations; `*` means "no default".
    pub fn domain(mut self, domain: impl Into<String>) -> Self {
        self.domain = domain.into();
        self
    }

    /// Default agent for all operations; `*` means "no default".
    pub fn agent(mut self, agent: impl Into<String>) -> Self {
        self.agent = agent.into();
        self
    }

    pub fn token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    pub fn username(mut self, username: impl Into<String>) -> Self {
        self.username = Some(username.into());
        self
    }

    pub fn password(mut self, password: impl Into<String>) -> Self {
        self.password = Some(password.into());
        self
    }

    /// Per-call reply deadline.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

/// Creates or looks up a remote instance.
pub struct CreateRequest {
    pub(crate) class_name: String,
    pub(crate) instance: Option<String>,
    pub(crate) args: Vec<Arg>,
    pub(crate) agent: Option<String>,
    pub(crate) domain: Option<String>,
}

impl CreateRequest {
    pub fn new(class_name: impl Into<String>) -> Self {
        Self {
            class_name: class_name.into(),
            instance: None,
            args: Vec::new(),
            agent: None,
            domain: None,
        }
    }

    /// Names the instance; named creation is shared and idempotent.
    pub fn instance(mut self, name: impl Into<String>) -> Self {
        self.instance = Some(name.into());
        self
    }

    pub fn args(mut self, args: Vec<Arg>) -> Self {
        self.args = args;
        self
    }

    pub fn agent(mut self, agent: impl Into<String>) -> Self {
        self.agent = Some(agent.into());
        self
    }

    pub fn domain(mut self, domain: impl Into<String>) -> Self {
        self.domain = Some(domain.into());
        self
    }
}

/// A class-level (static) function call.
pub struct StaticCall {
    pub(crate) class_name: String,
    pub(crate) function_name: String,
    pub(crate) args: Vec<Arg>,
    pub(crate) agent: Option<String>,
    pub(crate) domain: Option<String>,
}

impl StaticCall {
    pub fn new(class_name: impl Into<String>, function_name: impl Into<String>) -> Self {
        Self {
            class_name: class_name.into(),
            function_name: function_name.into(),
            args: Vec::new(),
            agent: None,
            domain: None,
        }
    }

    pub fn args(mut self, args: Vec<Arg>) -> Self {
        self.args = args;
        self
    }

    pub fn agent(mut self, agent: impl Into<String>) -> Self {
        self.agent = Some(agent.into());
        self
    }

    pub fn domain(mut self, domain: impl Into<String>) -> Self {
        self.domain = Some(domain.into());
        self
    }
}

/// Deletes a named remote instance.
pub struct DeleteRequest {
    pub(crate) class_name: String,
    pub(crate) instance: String,
    pub(crate) agent: Option<String>,
    pub(crate) domain: Option<String>,
}

impl DeleteRequest {
    pub fn new(class_name: impl Into<String>, instance: impl Into<String>) -> Self {
        Self {
            class_name: class_name.into(),
            instance: instance.into(),
            agent: None,
            domain: None,
        }
    }

    pub fn agent(mut self, agent: impl Into<String>) -> Self {
        self.agent = Some(agent.into());
        self
    }

    pub fn domain(mut self, domain: impl Into<String>) -> Self {
        self.domain = Some(domain.into());
        self
    }
}

pub struct Remote {
    shared: Arc<Shared>,
}

impl Remote {
    /// Connects to the configured MQTT broker.
    pub async fn connect(options: RemoteOptions) -> Result<Remote, Error> {
        let connector = MqttConnector::new(options.broker.clone());
        Self::connect_via(connector, options).await
    }

    /// Connects over the given connector (e.g. an in-process broker).
    pub async fn connect_via(
        connector: impl Connector + 'static,
        options: RemoteOptions,
    ) -> Result<Remote, Error> {
        let instance = ident::random_token();
        let hostname = ident::host_name();
        let inbox = format!("{}/{}/{}", options.domain, hostname, instance);
        let (ready_tx, _ready_rx) = watch::channel(false);
        let (events, _) = broadcast::channel(256);
        let shared = Arc::new(Shared {
            token: Mutex::new(options.token.clone()),
            options,
            connector: Box::new(connector),
            ids: CallIds::new(instance.clone()),
            instance,
            hostname,
            inbox,
            conn: Mutex::new(None),
            correlator: Correlator::new(),
            tunnels: TunnelTable::new(),
            availability: Mutex::new(Availability::new()),
            events,
            ready_tx,
        });
        open(&shared).await?;
        Ok(Remote { shared })
    }

    /// Resolves once the broker connection is up and the settle window has
    /// passed. No timeout; bound the wait on the caller side if needed.
    pub async fn connected(&self) {
        self.shared.settled().await;
    }

    /// Observer channel for availability changes.
    pub fn events(&self) -> broadcast::Receiver<DiscoveryEvent> {
        self.shared.events.subscribe()
    }

    /// Creates a remote instance and returns its proxy. With
    /// [`CreateRequest::instance`] the instance is named and shared.
    pub async fn create(&self, request: CreateRequest) -> Result<Proxy, Error> {
        self.shared.settled().await;
        let domain = self.shared.concrete(request.domain, "domain")?;
        let agent = self.shared.concrete_agent(request.agent)?;
        let proxy_id = ident::random_token();
        let mut data = Map::new();
        let (method, offset) = match &request.instance {
            Some(name) => {
                data.insert(wire::arg_key(0), Value::String(name.clone()));
                (CREATE_NAMED, 1)
            }
            None => (CREATE, 0),
        };
        self.shared
            .pack_args(&proxy_id, method, offset, request.args, &mut data);
        self.proxy_for(
            domain,
            agent,
            request.class_name,
            method,
            proxy_id,
            data,
        )
        .await
    }

    /// Attaches to an existing named instance without constructing it.
    pub async fn get_instance(&self, request: CreateRequest) -> Result<Proxy, Error> {
        self.shared.settled().await;
        let Some(name) = request.instance else {
            return Err(Error::Config(
                "get_instance requires an instance name".to_owned(),
            ));
        };
        let domain = self.shared.concrete(request.domain, "domain")?;
        let agent = self.shared.concrete_agent(request.agent)?;
        let proxy_id = ident::random_token();
        let mut data = Map::new();
        data.insert(wire::arg_key(0), Value::String(name));
        self.proxy_for(
            domain,
            agent,
            request.class_name,
            GET_NAMED,
            proxy_id,
            data,
        )
        .await
    }

    async fn proxy_for(
        &self,
        domain: String,
        agent: String,
        class: String,
        method: &str,
        proxy_id: String,
        data: Map<String, Value>,
    ) -> Result<Proxy, Error> {
        let topic = Address::new(&domain, &agent, &class, STATIC_TARGET, method).to_string();
        let reply = self.shared.invoke(&topic, &class, method, data).await?;
        let target_id = reply
            .as_str()
            .ok_or_else(|| Error::Protocol("creation reply carries no instance id".to_owned()))?
            .to_owned();
        // Method set captured now; later info updates do not change it.
        let methods = self.shared.with_tree(|t| t.member_functions(&domain, &agent, &class));
        Ok(Proxy::new(
            self.shared.clone(),
            domain,
            agent,
            class,
            target_id,
            proxy_id,
            methods,
        ))
    }

    /// Calls a static function of a remote class.
    pub async fn call_static(&self, request: StaticCall) -> Result<Value, Error> {
        self.shared.settled().await;
        let domain = self.shared.concrete(request.domain, "domain")?;
        let agent = self.shared.concrete_agent(request.agent)?;
        let topic = Address::new(
            &domain,
            &agent,
            &request.class_name,
            STATIC_TARGET,
            &request.function_name,
        )
        .to_string();
        let scope = self.shared.instance.clone();
        let mut data = Map::new();
        self.shared
            .pack_args(&scope, &request.function_name, 0, request.args, &mut data);
        self.shared
            .invoke(&topic, &request.class_name, &request.function_name, data)
            .await
    }

    /// Deletes a named remote instance.
    pub async fn delete_instance(&self, request: DeleteRequest) -> Result<Value, Error> {
        self.shared.settled().await;
        let domain = self.shared.concrete(request.domain, "domain")?;
        let agent = self.shared.concrete_agent(request.agent)?;
        let topic = Address::new(
            &domain,
            &agent,
            &request.class_name,
            STATIC_TARGET,
            DELETE,
        )
        .to_string();
        let mut data = Map::new();
        data.insert(wire::arg_key(0), Value::String(request.instance));
        self.shared
            .invoke(&topic, &request.class_name, DELETE, data)
            .await
    }

    pub async fn get_available_domains(&self) -> Vec<String> {
        self.shared.settled().await;
        self.shared.with_tree(|t| t.domains())
    }

    /// Agents currently online in `domain`.
    pub async fn get_available_agents(&self, domain: &str) -> Vec<String> {
        self.shared.settled().await;
        self.shared.with_tree(|t| t.agents(domain))
    }

    pub async fn get_available_classes(&self, domain: &str, agent: &str) -> Vec<String> {
        self.shared.settled().await;
        self.shared.with_tree(|t| t.classes(domain, agent))
    }

    pub async fn get_available_instances(
        &self,
        domain: &str,
        agent: &str,
        class: &str,
    ) -> Vec<String> {
        self.shared.settled().await;
        self.shared.with_tree(|t| t.instances(domain, agent, class))
    }

    pub async fn get_available_member_functions(
        &self,
        domain: &str,
        agent: &str,
        class: &str,
    ) -> Vec<String> {
        self.shared.settled().await;
        self.shared
            .with_tree(|t| t.member_functions(domain, agent, class))
    }

    pub async fn get_available_static_functions(
        &self,
        domain: &str,
        agent: &str,
        class: &str,
    ) -> Vec<String> {
        self.shared.settled().await;
        self.shared
            .with_tree(|t| t.static_functions(domain, agent, class))
    }

    /// Full availability snapshot, offline entries included.
    pub async fn availability(&self) -> Availability {
        self.shared.settled().await;
        self.shared.with_tree(|t| t.clone())
    }

    /// Swaps the access token: tears the connection down, fails in-flight
    /// calls with a transport error and reconnects. The availability tree
    /// is rebuilt from retained info after the reconnect.
    pub async fn reconnect_with_token(&self, token: &str) -> Result<(), Error> {
        self.shared
            .correlator
            .fail_all("reconnecting with fresh token");
        let _ = self.shared.ready_tx.send(false);
        if let Ok(mut current) = self.shared.token.lock() {
            *current = Some(token.to_owned());
        }
        let old = self
            .shared
            .conn
            .lock()
            .ok()
            .and_then(|mut guard| guard.take());
        if let Some(conn) = old {
            let _ = conn.disconnect().await;
        }
        self.shared.with_tree_mut(Availability::clear);
        open(&self.shared).await
    }

    /// Publishes the retained offline presence and closes the connection.
    /// In-flight calls fail with a transport error.
    pub async fn end(self) -> Result<(), Error> {
        self.shared.correlator.fail_all("connection ended");
        self.shared.tunnels.clear();
        let conn = self
            .shared
            .conn
            .lock()
            .ok()
            .and_then(|mut guard| guard.take());
        if let Some(conn) = conn {
            conn.publish(
                &self.shared.presence_topic(),
                serde_json::to_vec(&AgentInfo::offline(&self.shared.hostname))?,
                true,
            )
            .await
            .map_err(Error::Transport)?;
            conn.disconnect().await.map_err(Error::Transport)?;
        }
        Ok(())
    }
}

pub(crate) struct Shared {
    options: RemoteOptions,
    connector: Box<dyn Connector>,
    token: Mutex<Option<String>>,
    pub(crate) instance: String,
    hostname: String,
    pub(crate) inbox: String,
    conn: Mutex<Option<Arc<dyn Connection>>>,
    pub(crate) correlator: Correlator,
    pub(crate) tunnels: TunnelTable,
    availability: Mutex<Availability>,
    events: broadcast::Sender<DiscoveryEvent>,
    ready_tx: watch::Sender<bool>,
    ids: CallIds,
}

/// Connects, subscribes the inbox and discovery filter, publishes the
/// online presence and starts the inbound and settle tasks.
async fn open(shared: &Arc<Shared>) -> Result<(), Error> {
    let presence_topic = shared.presence_topic();
    let will = Publication {
        topic: presence_topic.clone(),
        payload: serde_json::to_vec(&AgentInfo::offline(&shared.hostname))?,
        retain: true,
    };
    let token = shared.token.lock().ok().and_then(|t| t.clone());
    let credentials = Credentials::resolve(
        token.as_deref(),
        shared.options.username.as_deref(),
        shared.options.password.as_deref(),
    );
    let (conn, inbound) = shared
        .connector
        .connect(ConnectOptions {
            client_id: ident::client_id(&shared.instance),
            credentials,
            will: Some(will),
            clean_session: true,
        })
        .await
        .map_err(Error::Transport)?;

    conn.subscribe(&shared.inbox)
        .await
        .map_err(Error::Transport)?;
    let discovery_filter = format!(
        "{}/{}/+/{}/{}",
        wildcard(&shared.options.domain),
        wildcard(&shared.options.agent),
        STATIC_TARGET,
        INFO_METHOD
    );
    conn.subscribe(&discovery_filter)
        .await
        .map_err(Error::Transport)?;
    conn.publish(
        &presence_topic,
        serde_json::to_vec(&AgentInfo::online(&shared.hostname))?,
        true,
    )
    .await
    .map_err(Error::Transport)?;
    if let Ok(mut guard) = shared.conn.lock() {
        *guard = Some(conn);
    }

    tokio::spawn(run_inbound(shared.clone(), inbound));
    let settle = shared.clone();
    tokio::spawn(async move {
        tokio::time::sleep(SETTLE).await;
        let _ = settle.ready_tx.send(true);
    });
    Ok(())
}

impl Shared {
    fn presence_topic(&self) -> String {
        format!("{}/{}", self.inbox, INFO_METHOD)
    }

    async fn settled(&self) {
        let mut ready = self.ready_tx.subscribe();
        loop {
            if *ready.borrow() {
                return;
            }
            if ready.changed().await.is_err() {
                return;
            }
        }
    }

    fn connection(&self) -> Result<Arc<dyn Connection>, Error> {
        self.conn
            .lock()
            .ok()
            .and_then(|guard| guard.clone())
            .ok_or_else(|| Error::Transport(TransportError::Closed("not connected".to_owned())))
    }

    /// Issues one request and awaits its reply under the per-call timeout.
    /// The pending entry is gone afterwards either way; a reply arriving
    /// later is dropped by the inbound loop.
    pub(crate) async fn invoke(
        &self,
        topic: &str,
        target_id: &str,
        method: &str,
        data: Map<String, Value>,
    ) -> Result<Value, Error> {
        let id = self.ids.next();
        let msg = RpcMessage {
            target_id: target_id.to_owned(),
            method: method.to_owned(),
            id: id.clone(),
            sender: self.inbox.clone(),
            data,
        };
        let payload = serde_json::to_vec(&msg)?;
        let reply = self.correlator.register(&id);
        let conn = self.connection()?;
        if let Err(e) = conn.publish(topic, payload, false).await {
            self.correlator.remove(&id);
            return Err(e.into());
        }
        let timeout = self.options.timeout;
        match tokio::time::timeout(timeout, reply).await {
            Err(_) => {
                self.correlator.remove(&id);
                Err(Error::Timeout(timeout.as_millis() as u64))
            }
            Ok(Err(_closed)) => Err(Error::Transport(TransportError::Closed(
                "connection closed".to_owned(),
            ))),
            Ok(Ok(Ok(value))) => Ok(value),
            Ok(Ok(Err(e))) => Err(Error::Remote(e)),
        }
    }

    /// Replaces callable arguments with tunnel ids and inserts everything
    /// into `data` as positional `_N` entries starting at `offset`.
    pub(crate) fn pack_args(
        &self,
        scope: &str,
        method: &str,
        offset: usize,
        args: Vec<Arg>,
        data: &mut Map<String, Value>,
    ) {
        for (i, arg) in args.into_iter().enumerate() {
            let index = i + offset;
            let value = match arg {
                Arg::Value(v) => v,
                Arg::Callback(sink) => {
                    // `on(event, handler)` registers persistently under the
                    // event name, so re-registration reuses the tunnel id.
                    let event = (method == "on" && index == 1)
                        .then(|| data.get("_1").and_then(Value::as_str).map(str::to_owned))
                        .flatten();
                    let id = match event {
                        Some(event) => self
                            .tunnels
                            .insert_persistent(scope, method, index, &event, sink),
                        None => self.tunnels.insert_one_shot(scope, method, index, sink),
                    };
                    Value::String(id)
                }
                Arg::Emitter { emitter, event } => {
                    let forward = event.clone();
                    let sink: Callback =
                        Arc::new(move |args| emitter.emit(&forward, args));
                    Value::String(
                        self.tunnels
                            .insert_persistent(scope, method, index, &event, sink),
                    )
                }
            };
            data.insert(wire::arg_key(index), value);
        }
    }

    fn concrete(&self, value: Option<String>, what: &str) -> Result<String, Error> {
        let value = value.unwrap_or_else(|| self.options.domain.clone());
        if !topic::valid_segment(&value) {
            return Err(Error::Config(format!(
                "{what} must be a concrete value, got '{value}'"
            )));
        }
        Ok(value)
    }

    fn concrete_agent(&self, value: Option<String>) -> Result<String, Error> {
        let value = value.unwrap_or_else(|| self.options.agent.clone());
        if !topic::valid_segment(&value) {
            return Err(Error::Config(format!(
                "agent must be a concrete value, got '{value}'"
            )));
        }
        Ok(value)
    }

    pub(crate) fn with_tree<R>(&self, f: impl FnOnce(&Availability) -> R) -> R {
        match self.availability.lock() {
            Ok(tree) => f(&tree),
            Err(poisoned) => f(&poisoned.into_inner()),
        }
    }

    fn with_tree_mut(&self, f: impl FnOnce(&mut Availability)) {
        match self.availability.lock() {
            Ok(mut tree) => f(&mut tree),
            Err(mut poisoned) => f(poisoned.get_mut()),
        }
    }

    fn route_reply(&self, msg: RpcMessage) {
        let args = wire::positional_args(&msg.data);
        if self.tunnels.deliver(&msg.id, args) {
            return;
        }
        if let Some(e) = wire::error_value(&msg.data) {
            if !self.correlator.complete(&msg.id, Err(e.to_owned())) {
                debug!(id = %msg.id, "late error reply dropped");
            }
            return;
        }
        let value = wire::return_value(&msg.data).cloned().unwrap_or(Value::Null);
        if let Some(token) = wire::promise_token(&value) {
            if !self.correlator.reassign(&msg.id, token) {
                debug!(id = %msg.id, "late promise reply dropped");
            }
        } else if !self.correlator.complete(&msg.id, Ok(value)) {
            debug!(id = %msg.id, "late reply dropped");
        }
    }

    fn apply_info(&self, addr: &Address, payload: &[u8]) {
        if payload.is_empty() {
            return;
        }
        let event = if addr.class == AGENT_CLASS {
            match serde_json::from_slice::<AgentInfo>(payload) {
                Ok(info) => self.with_tree_event(|t| {
                    t.apply_agent_info(&addr.domain, &addr.agent, info)
                }),
                Err(e) => {
                    warn!(topic = %addr, error = %e, "dropping malformed agent info");
                    return;
                }
            }
        } else {
            match serde_json::from_slice::<ClassInfo>(payload) {
                Ok(info) => self.with_tree_event(|t| {
                    t.apply_class_info(&addr.domain, &addr.agent, info)
                }),
                Err(e) => {
                    warn!(topic = %addr, error = %e, "dropping malformed class info");
                    return;
                }
            }
        };
        let _ = self.events.send(event);
    }

    fn with_tree_event(
        &self,
        f: impl FnOnce(&mut Availability) -> DiscoveryEvent,
    ) -> DiscoveryEvent {
        match self.availability.lock() {
            Ok(mut tree) => f(&mut tree),
            Err(mut poisoned) => f(poisoned.get_mut()),
        }
    }
}

fn wildcard(segment: &str) -> &str {
    if segment == "*" {
        "+"
    } else {
        segment
    }
}

async fn run_inbound(shared: Arc<Shared>, mut inbound: UnboundedReceiver<Inbound>) {
    while let Some(msg) = inbound.recv().await {
        if msg.topic == shared.inbox {
            match serde_json::from_slice::<RpcMessage>(&msg.payload) {
                Ok(reply) => shared.route_reply(reply),
                Err(e) => warn!(topic = %msg.topic, error = %e, "dropping malformed reply"),
            }
            continue;
        }
        match Address::parse(&msg.topic) {
            Some(addr) if addr.is_info() => shared.apply_info(&addr, &msg.payload),
            _ => debug!(topic = %msg.topic, "ignoring unroutable message"),
        }
    }
    debug!("inbound loop ended");
}
