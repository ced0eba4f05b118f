use thiserror::Error;

/// Errors surfaced by [`Remote`](crate::Remote), [`Agent`](crate::Agent) and
/// the proxies they hand out.
#[derive(Debug, Error)]
pub enum Error {
    /// A required parameter was absent, or a wildcard was passed where a
    /// concrete value is needed.
    #[error("configuration: {0}")]
    Config(String),

    /// No reply arrived within the configured per-call timeout.
    #[error("Function call timed out (> {0} ms)")]
    Timeout(u64),

    /// The peer answered with an error payload.
    #[error("{0}")]
    Remote(String),

    /// Publishing or subscribing failed, or the connection is gone.
    #[error("transport: {0}")]
    Transport(#[from] TransportError),

    /// A payload could not be encoded or decoded.
    #[error("protocol: {0}")]
    Protocol(String),
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Protocol(e.to_string())
    }
}

/// Errors raised by the broker seam.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("bad broker url: {0}")]
    BadUrl(String),

    #[error(transparent)]
    Mqtt(#[from] rumqttc::ClientError),

    #[error("{0}")]
    Closed(String),
}
