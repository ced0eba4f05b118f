//! Variadic RPC over an MQTT broker.
//!
//! An [`Agent`] hosts callable classes and their live instances; a
//! [`Remote`] discovers agents through retained info messages, creates
//! remote instances and calls static or member functions on them,
//! including functions taking callbacks or event emitters as arguments.
//! The broker is the only transport: requests, replies, backward callback
//! invocations and the availability tree all travel over topics.

mod adapter;
mod agent;
mod correlator;
mod discovery;
mod error;
mod ident;
mod macros;
mod proxy;
mod remote;
mod topic;
mod transport;
mod tunnel;
mod wire;

pub use futures::future::BoxFuture;

pub use adapter::{
    Adapter, CallContext, ClassBuilder, ClassRegistry, Outbox, PromiseResolver, RemoteCallback,
};
pub use agent::{Agent, AgentOptions, StopHandle};
pub use discovery::{AgentEntry, Availability, DiscoveryEvent};
pub use error::{Error, TransportError};
pub use proxy::Proxy;
pub use remote::{CreateRequest, DeleteRequest, Remote, RemoteOptions, StaticCall};
pub use topic::{
    Address, AGENT_CLASS, CREATE, CREATE_NAMED, DELETE, GET_NAMED, INFO_METHOD, STATIC_TARGET,
};
pub use transport::{
    memory::{MemoryBroker, MemoryConnector},
    mqtt::{MqttConnector, DEFAULT_BROKER},
    ConnectOptions, Connection, Connector, Credentials, Inbound, Publication,
};
pub use tunnel::{Arg, Callback, EventEmitter, TUNNEL_PREFIX};
pub use wire::{
    positional_args, signature_base, AgentInfo, ClassInfo, RpcMessage, Status, PROMISE_PREFIX,
};
