pub mod memory;
pub mod mqtt;

use crate::error::TransportError;
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::mpsc::UnboundedReceiver;

/// An inbound broker message.
#[derive(Debug, Clone)]
pub struct Inbound {
    pub topic: String,
    pub payload: Vec<u8>,
}

/// A message to publish; delivery is always at-least-once.
#[derive(Debug, Clone)]
pub struct Publication {
    pub topic: String,
    pub payload: Vec<u8>,
    pub retain: bool,
}

#[derive(Debug, Clone, Default)]
pub enum Credentials {
    #[default]
    None,
    UserPass {
        username: String,
        password: String,
    },
    /// Sent as the password under the fixed username `__token__`.
    Token(String),
}

impl Credentials {
    /// Token wins over username/password; a bare username counts for
    /// nothing.
    pub(crate) fn resolve(
        token: Option<&str>,
        username: Option<&str>,
        password: Option<&str>,
    ) -> Credentials {
        if let Some(token) = token {
            return Credentials::Token(token.to_owned());
        }
        match (username, password) {
            (Some(u), Some(p)) => Credentials::UserPass {
                username: u.to_owned(),
                password: p.to_owned(),
            },
            _ => Credentials::None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ConnectOptions {
    pub client_id: String,
    pub credentials: Credentials,
    pub will: Option<Publication>,
    pub clean_session: bool,
}

/// Builds broker connections. One connection per peer; peers do not pool.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(
        &self,
        options: ConnectOptions,
    ) -> Result<(Arc<dyn Connection>, UnboundedReceiver<Inbound>), TransportError>;
}

/// A live broker connection.
#[async_trait]
pub trait Connection: Send + Sync {
    async fn publish(
        &self,
        topic: &str,
        payload: Vec<u8>,
        retain: bool,
    ) -> Result<(), TransportError>;

    async fn subscribe(&self, filter: &str) -> Result<(), TransportError>;

    async fn unsubscribe(&self, filter: &str) -> Result<(), TransportError>;

    /// Clean close. Discards any configured will.
    async fn disconnect(&self) -> Result<(), TransportError>;
}
