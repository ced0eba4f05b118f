//! Pending-call registry: ties replies arriving on the shared inbox back to
//! their originating requests by correlation id. Replies are routed only by
//! id, never by topic.

use serde_json::Value;
use std::collections::HashMap;
use std::sync::Mutex;
use tokio::sync::oneshot;

pub(crate) type Outcome = Result<Value, String>;

#[derive(Default)]
pub(crate) struct Correlator {
    pending: Mutex<HashMap<String, oneshot::Sender<Outcome>>>,
}

impl Correlator {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Registers a fresh one-shot completion for `id`.
    pub(crate) fn register(&self, id: &str) -> oneshot::Receiver<Outcome> {
        let (tx, rx) = oneshot::channel();
        if let Ok(mut pending) = self.pending.lock() {
            pending.insert(id.to_owned(), tx);
        }
        rx
    }

    /// Completes the entry for `id`. Returns `false` when no entry exists
    /// (late reply after a timeout, or an unknown id) so the caller can
    /// drop the message silently.
    pub(crate) fn complete(&self, id: &str, outcome: Outcome) -> bool {
        let Some(tx) = self.take(id) else {
            return false;
        };
        let _ = tx.send(outcome);
        true
    }

    /// Moves a pending completion under a promise token: the original
    /// one-shot keeps waiting, now for the message whose id equals the
    /// token, and the original per-call timeout keeps running.
    pub(crate) fn reassign(&self, id: &str, token: &str) -> bool {
        let Some(tx) = self.take(id) else {
            return false;
        };
        if let Ok(mut pending) = self.pending.lock() {
            pending.insert(token.to_owned(), tx);
        }
        true
    }

    /// Drops the entry for `id`; a reply arriving later is ignored.
    pub(crate) fn remove(&self, id: &str) {
        self.take(id);
    }

    /// Fails every outstanding call, e.g. on teardown or reconnect. The
    /// dropped completions surface at the await points as transport errors.
    pub(crate) fn fail_all(&self, reason: &str) {
        let drained: Vec<_> = match self.pending.lock() {
            Ok(mut pending) => pending.drain().collect(),
            Err(_) => return,
        };
        if !drained.is_empty() {
            tracing::debug!(reason, count = drained.len(), "abandoning in-flight calls");
        }
    }

    fn take(&self, id: &str) -> Option<oneshot::Sender<Outcome>> {
        self.pending.lock().ok()?.remove(id)
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.pending.lock().map(|p| p.len()).unwrap_or(0)
    }
}
