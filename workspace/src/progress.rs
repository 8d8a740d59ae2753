//! Fan-out for `$/progress` notifications arriving from runners.
//!
//! Every run registers its progress token here before dispatching; the
//! supervisor's `$/progress` feature publishes into the matching channel,
//! and the run (or the IDE façade) drains partial results as they land.

use std::collections::HashMap;
use std::sync::Mutex;

use serde_json::Value;
use tokio::sync::mpsc;

#[derive(Default)]
pub struct ProgressHub {
    subscribers: Mutex<HashMap<String, mpsc::UnboundedSender<Value>>>,
}

impl ProgressHub {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register interest in a progress token. Re-subscribing replaces the
    /// previous receiver.
    pub fn subscribe(&self, token: &str) -> mpsc::UnboundedReceiver<Value> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers
            .lock()
            .expect("subscriber map poisoned")
            .insert(token.to_string(), tx);
        rx
    }

    /// Deliver a progress value to whoever subscribed to `token`. Values
    /// for unknown or already-dropped tokens are discarded.
    pub fn publish(&self, token: &str, value: Value) {
        let subscribers = self.subscribers.lock().expect("subscriber map poisoned");
        match subscribers.get(token) {
            Some(tx) => {
                if tx.send(value).is_err() {
                    tracing::trace!(token, "progress receiver dropped");
                }
            }
            None => tracing::trace!(token, "progress for unknown token"),
        }
    }

    pub fn unsubscribe(&self, token: &str) {
        self.subscribers
            .lock()
            .expect("subscriber map poisoned")
            .remove(token);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn delivers_to_matching_token_only() {
        let hub = ProgressHub::new();
        let mut a = hub.subscribe("run-a");
        let mut b = hub.subscribe("run-b");

        hub.publish("run-a", json!({"n": 1}));
        hub.publish("run-b", json!({"n": 2}));
        hub.publish("run-c", json!({"n": 3}));

        assert_eq!(a.recv().await.unwrap(), json!({"n": 1}));
        assert_eq!(b.recv().await.unwrap(), json!({"n": 2}));
        assert!(a.try_recv().is_err());
    }

    #[tokio::test]
    async fn unsubscribe_discards_later_values() {
        let hub = ProgressHub::new();
        let mut rx = hub.subscribe("run-a");
        hub.unsubscribe("run-a");
        hub.publish("run-a", json!({"n": 1}));
        assert!(rx.try_recv().is_err());
    }
}
