//! The agent side: subscribes every callable topic, dispatches inbound
//! requests through its [`Adapter`], keeps the retained discovery channel
//! current and signals liveness through a broker last-will.

use crate::adapter::{Adapter, Outbox};
use crate::error::Error;
use crate::ident;
use crate::topic::{
    self, Address, AGENT_CLASS, CREATE, CREATE_NAMED, DELETE, GET_NAMED, INFO_METHOD,
    STATIC_TARGET,
};
use crate::transport::{
    mqtt::{MqttConnector, DEFAULT_BROKER},
    ConnectOptions, Connection, Connector, Credentials, Inbound, Publication,
};
use crate::wire::{self, AgentInfo, RpcMessage};
use std::sync::Arc;
use tokio::sync::Notify;
use tracing::{debug, info, warn};

#[derive(Debug, Clone)]
pub struct AgentOptions {
    domain: String,
    agent: String,
    broker: String,
    token: Option<String>,
    username: Option<String>,
    password: Option<String>,
}

impl AgentOptions {
    /// Options for an agent in `domain`, named after the host by default.
    pub fn new(domain: impl Into<String>) -> Self {
        Self {
            domain: domain.into(),
            agent: ident::host_name(),
            broker: DEFAULT_BROKER.to_owned(),
            token: None,
            username: None,
            password: None,
        }
    }

    pub fn agent(mut self, agent: impl Into<String>) -> Self {
        self.agent = agent.into();
        self
    }

    pub fn broker(mut self, url: impl Into<String>) -> Self {
        self.broker = url.into();
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
}

/// Requests a graceful shutdown of a serving [`Agent`].
#[derive(Clone)]
pub struct StopHandle {
    stop: Arc<Notify>,
}

impl StopHandle {
    pub fn stop(&self) {
        self.stop.notify_one();
    }
}

pub struct Agent {
    options: AgentOptions,
    adapter: Arc<dyn Adapter>,
    stop: Arc<Notify>,
}

impl Agent {
    pub fn new(options: AgentOptions, adapter: impl Adapter + 'static) -> Result<Self, Error> {
        if !topic::valid_segment(&options.domain) {
            return Err(Error::Config(format!(
                "agent domain must be a concrete topic segment, got '{}'",
                options.domain
            )));
        }
        if !topic::valid_segment(&options.agent) {
            return Err(Error::Config(format!(
                "agent name must be a concrete topic segment, got '{}'",
                options.agent
            )));
        }
        Ok(Self {
            options,
            adapter: Arc::new(adapter),
            stop: Arc::new(Notify::new()),
        })
    }

    pub fn stop_handle(&self) -> StopHandle {
        StopHandle {
            stop: self.stop.clone(),
        }
    }

    /// Connects to the configured broker and serves until stopped or the
    /// transport closes.
    pub async fn serve(self) -> Result<(), Error> {
        let connector = MqttConnector::new(self.options.broker.clone());
        self.serve_via(connector).await
    }

    /// Serves over the given connector. Used directly with the in-process
    /// broker; `serve` is the MQTT shorthand.
    pub async fn serve_via(self, connector: impl Connector) -> Result<(), Error> {
        let AgentOptions {
            domain,
            agent,
            token,
            username,
            password,
            ..
        } = &self.options;
        let hostname = ident::host_name();
        let presence_topic = Address::new(
            domain.clone(),
            agent.clone(),
            AGENT_CLASS,
            STATIC_TARGET,
            INFO_METHOD,
        )
        .to_string();
        let will = Publication {
            topic: presence_topic.clone(),
            payload: serde_json::to_vec(&AgentInfo::offline(&hostname))?,
            retain: true,
        };
        let (conn, mut inbound) = connector
            .connect(ConnectOptions {
                client_id: ident::client_id(&ident::random_token()),
                credentials: Credentials::resolve(
                    token.as_deref(),
                    username.as_deref(),
                    password.as_deref(),
                ),
                will: Some(will),
                clean_session: true,
            })
            .await
            .map_err(Error::Transport)?;

        for class in self.adapter.class_names() {
            self.subscribe_statics(&*conn, &class).await?;
            self.publish_class_info(&*conn, &class).await?;
        }
        conn.publish(
            &presence_topic,
            serde_json::to_vec(&AgentInfo::online(&hostname))?,
            true,
        )
        .await
        .map_err(Error::Transport)?;
        info!(%domain, %agent, "agent serving");

        let (outbox, mut outbox_rx) = Outbox::channel();
        loop {
            tokio::select! {
                _ = self.stop.notified() => {
                    conn.publish(
                        &presence_topic,
                        serde_json::to_vec(&AgentInfo::offline(&hostname))?,
                        true,
                    )
                    .await
                    .map_err(Error::Transport)?;
                    conn.disconnect().await.map_err(Error::Transport)?;
                    info!(%domain, %agent, "agent stopped");
                    return Ok(());
                }
                msg = inbound.recv() => {
                    let Some(msg) = msg else {
                        info!(%domain, %agent, "transport closed");
                        return Ok(());
                    };
                    self.handle(&*conn, &outbox, msg).await;
                }
                out = outbox_rx.recv() => {
                    if let Some((sender, msg)) = out {
                        self.publish_message(&*conn, &sender, &msg).await;
                    }
                }
            }
        }
    }

    async fn handle(&self, conn: &dyn Connection, outbox: &Outbox, inbound: Inbound) {
        let Some(addr) = Address::parse(&inbound.topic) else {
            warn!(topic = %inbound.topic, "dropping message with bad topic arity");
            return;
        };
        let mut msg: RpcMessage = match serde_json::from_slice(&inbound.payload) {
            Ok(msg) => msg,
            Err(e) => {
                warn!(topic = %inbound.topic, error = %e, "dropping malformed payload");
                return;
            }
        };
        msg.target_id = if addr.is_static() {
            addr.class.clone()
        } else {
            addr.target.clone()
        };
        msg.method = addr.method.clone();
        // The instance name a __delete__ refers to, before dispatch consumes it.
        let deleted = (msg.method == DELETE)
            .then(|| wire::positional_args(&msg.data).first().and_then(|v| v.as_str().map(str::to_owned)))
            .flatten();
        debug!(topic = %inbound.topic, id = %msg.id, "dispatching");

        self.adapter.dispatch(&addr.class, &mut msg, outbox).await;

        if wire::error_value(&msg.data).is_none() {
            match msg.method.as_str() {
                CREATE | CREATE_NAMED => {
                    if let Some(instance) =
                        wire::return_value(&msg.data).and_then(|v| v.as_str().map(str::to_owned))
                    {
                        self.subscribe_members(conn, &addr.class, &instance).await;
                        let _ = self.publish_class_info(conn, &addr.class).await;
                    }
                }
                DELETE => {
                    // Member subscriptions stay: a call to a deleted
                    // instance must answer with an error, not vanish.
                    if deleted.is_some() {
                        let _ = self.publish_class_info(conn, &addr.class).await;
                    }
                }
                _ => {}
            }
        }

        if msg.sender.is_empty() {
            debug!(id = %msg.id, "no reply channel, dropping response");
            return;
        }
        let sender = msg.sender.clone();
        self.publish_message(conn, &sender, &msg).await;
    }

    async fn publish_message(&self, conn: &dyn Connection, topic: &str, msg: &RpcMessage) {
        let payload = match serde_json::to_vec(msg) {
            Ok(p) => p,
            Err(e) => {
                warn!(id = %msg.id, error = %e, "unencodable response");
                return;
            }
        };
        if let Err(e) = conn.publish(topic, payload, false).await {
            warn!(%topic, error = %e, "publishing response failed");
        }
    }

    async fn subscribe_statics(&self, conn: &dyn Connection, class: &str) -> Result<(), Error> {
        let statics = self
            .adapter
            .class_info(class)
            .map(|info| info.static_functions)
            .unwrap_or_default();
        let reserved = [CREATE, CREATE_NAMED, GET_NAMED, DELETE];
        for method in statics.iter().map(String::as_str).chain(reserved) {
            let filter = self.dispatch_topic(class, STATIC_TARGET, method);
            conn.subscribe(&filter).await.map_err(Error::Transport)?;
        }
        Ok(())
    }

    async fn subscribe_members(&self, conn: &dyn Connection, class: &str, instance: &str) {
        for method in self.member_functions(class) {
            let filter = self.dispatch_topic(class, instance, &method);
            if let Err(e) = conn.subscribe(&filter).await {
                warn!(%filter, error = %e, "instance subscription failed");
            }
        }
    }

    fn member_functions(&self, class: &str) -> Vec<String> {
        self.adapter
            .class_info(class)
            .map(|info| info.member_functions)
            .unwrap_or_default()
    }

    async fn publish_class_info(&self, conn: &dyn Connection, class: &str) -> Result<(), Error> {
        let Some(info) = self.adapter.class_info(class) else {
            return Ok(());
        };
        let topic = self.dispatch_topic(class, STATIC_TARGET, INFO_METHOD);
        conn.publish(&topic, serde_json::to_vec(&info)?, true)
            .await
            .map_err(Error::Transport)
    }

    fn dispatch_topic(&self, class: &str, target: &str, method: &str) -> String {
        Address::new(
            self.options.domain.clone(),
            self.options.agent.clone(),
            class,
            target,
            method,
        )
        .to_string()
    }
}
