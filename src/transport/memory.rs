//! In-process broker with the semantics the runtime relies on: retained
//! messages, `+`/`#` subscriptions and a last-will fired when a connection
//! is dropped without a clean disconnect. Backs the test suites and any
//! single-process deployment.

use super::{ConnectOptions, Connection, Connector, Inbound, Publication};
use crate::error::TransportError;
use crate::topic;
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};

#[derive(Default)]
struct BrokerState {
    next_id: u64,
    retained: BTreeMap<String, Vec<u8>>,
    clients: HashMap<u64, ClientState>,
}

struct ClientState {
    tx: UnboundedSender<Inbound>,
    filters: Vec<String>,
    will: Option<Publication>,
}

impl BrokerState {
    fn publish(&mut self, topic: &str, payload: &[u8], retain: bool) {
        if retain {
            if payload.is_empty() {
                self.retained.remove(topic);
            } else {
                self.retained.insert(topic.to_owned(), payload.to_vec());
            }
        }
        for client in self.clients.values() {
            if client.filters.iter().any(|f| topic::matches(f, topic)) {
                let _ = client.tx.send(Inbound {
                    topic: topic.to_owned(),
                    payload: payload.to_vec(),
                });
            }
        }
    }
}

/// The broker itself. Clone-free; hand out [`MemoryBroker::connector`]s.
#[derive(Default)]
pub struct MemoryBroker {
    state: Arc<Mutex<BrokerState>>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn connector(&self) -> MemoryConnector {
        MemoryConnector {
            state: self.state.clone(),
        }
    }
}

#[derive(Clone)]
pub struct MemoryConnector {
    state: Arc<Mutex<BrokerState>>,
}

#[async_trait]
impl Connector for MemoryConnector {
    async fn connect(
        &self,
        options: ConnectOptions,
    ) -> Result<(Arc<dyn Connection>, UnboundedReceiver<Inbound>), TransportError> {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = {
            let mut state = self
                .state
                .lock()
                .map_err(|_| TransportError::Closed("broker poisoned".into()))?;
            let id = state.next_id;
            state.next_id += 1;
            state.clients.insert(
                id,
                ClientState {
                    tx,
                    filters: Vec::new(),
                    will: options.will,
                },
            );
            id
        };
        let conn = Arc::new(MemoryConnection {
            id,
            state: self.state.clone(),
            closed: AtomicBool::new(false),
        });
        Ok((conn, rx))
    }
}

struct MemoryConnection {
    id: u64,
    state: Arc<Mutex<BrokerState>>,
    closed: AtomicBool,
}

impl MemoryConnection {
    fn lock(&self) -> Result<std::sync::MutexGuard<'_, BrokerState>, TransportError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(TransportError::Closed("connection closed".into()));
        }
        self.state
            .lock()
            .map_err(|_| TransportError::Closed("broker poisoned".into()))
    }
}

#[async_trait]
impl Connection for MemoryConnection {
    async fn publish(
        &self,
        topic: &str,
        payload: Vec<u8>,
        retain: bool,
    ) -> Result<(), TransportError> {
        self.lock()?.publish(topic, &payload, retain);
        Ok(())
    }

    async fn subscribe(&self, filter: &str) -> Result<(), TransportError> {
        let mut state = self.lock()?;
        // Replay retained messages matching the new filter, broker-style.
        let replay: Vec<(String, Vec<u8>)> = state
            .retained
            .iter()
            .filter(|(t, _)| topic::matches(filter, t))
            .map(|(t, p)| (t.clone(), p.clone()))
            .collect();
        if let Some(client) = state.clients.get_mut(&self.id) {
            if !client.filters.iter().any(|f| f == filter) {
                client.filters.push(filter.to_owned());
            }
            for (topic, payload) in replay {
                let _ = client.tx.send(Inbound { topic, payload });
            }
        }
        Ok(())
    }

    async fn unsubscribe(&self, filter: &str) -> Result<(), TransportError> {
        let mut state = self.lock()?;
        if let Some(client) = state.clients.get_mut(&self.id) {
            client.filters.retain(|f| f != filter);
        }
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), TransportError> {
        self.closed.store(true, Ordering::SeqCst);
        if let Ok(mut state) = self.state.lock() {
            state.clients.remove(&self.id);
        }
        Ok(())
    }
}

impl Drop for MemoryConnection {
    fn drop(&mut self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        // Ungraceful loss: the broker delivers the will.
        if let Ok(mut state) = self.state.lock() {
            if let Some(client) = state.clients.remove(&self.id) {
                if let Some(will) = client.will {
                    state.publish(&will.topic, &will.payload, will.retain);
                }
            }
        }
    }
}
