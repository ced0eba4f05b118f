//! rumqttc binding for real brokers. QoS 1 everywhere; TLS for `mqtts://`
//! endpoints.

use super::{ConnectOptions, Connection, Connector, Credentials, Inbound};
use crate::error::TransportError;
use async_trait::async_trait;
use rumqttc::{AsyncClient, Event, LastWill, MqttOptions, Outgoing, Packet, QoS, Transport};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::{self, UnboundedReceiver};
use tracing::warn;

const KEEP_ALIVE: Duration = Duration::from_secs(30);
const RETRY_DELAY: Duration = Duration::from_secs(1);

/// Default public endpoint.
pub const DEFAULT_BROKER: &str = "mqtts://vrpc.io:8883";

pub struct MqttConnector {
    url: String,
}

impl MqttConnector {
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }
}

fn parse_url(url: &str) -> Result<(String, u16, bool), TransportError> {
    let (tls, rest) = if let Some(rest) = url.strip_prefix("mqtts://") {
        (true, rest)
    } else if let Some(rest) = url.strip_prefix("mqtt://") {
        (false, rest)
    } else {
        return Err(TransportError::BadUrl(url.to_owned()));
    };
    let rest = rest.trim_end_matches('/');
    let (host, port) = match rest.rsplit_once(':') {
        Some((host, port)) => (
            host.to_owned(),
            port.parse::<u16>()
                .map_err(|_| TransportError::BadUrl(url.to_owned()))?,
        ),
        None => (rest.to_owned(), if tls { 8883 } else { 1883 }),
    };
    if host.is_empty() {
        return Err(TransportError::BadUrl(url.to_owned()));
    }
    Ok((host, port, tls))
}

#[async_trait]
impl Connector for MqttConnector {
    async fn connect(
        &self,
        options: ConnectOptions,
    ) -> Result<(Arc<dyn Connection>, UnboundedReceiver<Inbound>), TransportError> {
        let (host, port, tls) = parse_url(&self.url)?;
        let mut mqtt = MqttOptions::new(options.client_id.clone(), host, port);
        mqtt.set_keep_alive(KEEP_ALIVE);
        mqtt.set_clean_session(options.clean_session);
        if tls {
            mqtt.set_transport(Transport::tls_with_default_config());
        }
        match &options.credentials {
            Credentials::None => {}
            Credentials::UserPass { username, password } => {
                mqtt.set_credentials(username.clone(), password.clone());
            }
            Credentials::Token(token) => {
                mqtt.set_credentials("__token__", token.clone());
            }
        }
        if let Some(will) = &options.will {
            mqtt.set_last_will(LastWill::new(
                will.topic.clone(),
                will.payload.clone(),
                QoS::AtLeastOnce,
                will.retain,
            ));
        }

        let (client, mut event_loop) = AsyncClient::new(mqtt, 64);
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            loop {
                match event_loop.poll().await {
                    Ok(Event::Incoming(Packet::Publish(publish))) => {
                        let inbound = Inbound {
                            topic: publish.topic.clone(),
                            payload: publish.payload.to_vec(),
                        };
                        if tx.send(inbound).is_err() {
                            break;
                        }
                    }
                    Ok(Event::Outgoing(Outgoing::Disconnect)) => break,
                    Ok(_) => {}
                    Err(e) => {
                        if tx.is_closed() {
                            break;
                        }
                        warn!(error = %e, "mqtt connection error, retrying");
                        tokio::time::sleep(RETRY_DELAY).await;
                    }
                }
            }
        });

        Ok((Arc::new(MqttConnection { client }), rx))
    }
}

struct MqttConnection {
    client: AsyncClient,
}

#[async_trait]
impl Connection for MqttConnection {
    async fn publish(
        &self,
        topic: &str,
        payload: Vec<u8>,
        retain: bool,
    ) -> Result<(), TransportError> {
        self.client
            .publish(topic, QoS::AtLeastOnce, retain, payload)
            .await?;
        Ok(())
    }

    async fn subscribe(&self, filter: &str) -> Result<(), TransportError> {
        self.client.subscribe(filter, QoS::AtLeastOnce).await?;
        Ok(())
    }

    async fn unsubscribe(&self, filter: &str) -> Result<(), TransportError> {
        self.client.unsubscribe(filter).await?;
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), TransportError> {
        self.client.disconnect().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn url_parsing() {
        assert_eq!(
            parse_url("mqtts://vrpc.io:8883").unwrap(),
            ("vrpc.io".to_owned(), 8883, true)
        );
        assert_eq!(
            parse_url("mqtt://localhost").unwrap(),
            ("localhost".to_owned(), 1883, false)
        );
        assert_eq!(
            parse_url("mqtts://broker.example").unwrap(),
            ("broker.example".to_owned(), 8883, true)
        );
        assert!(parse_url("tcp://nope").is_err());
        assert!(parse_url("mqtt://").is_err());
    }
}
