//! Subscription registry: per-channel subscriber handles and broadcast.
//!
//! The registry does not own connections; it holds send capabilities keyed
//! by connection id. A failed send is logged and skipped — the failing
//! handle's own close path does the cleanup, broadcast never aborts
//! delivery to the remaining handles.

use dashmap::DashMap;
use serde_json::Value;
use std::collections::HashMap;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// A send capability for one client connection.
///
/// Cheap to clone; the transport layer owns the receiving half.
#[derive(Debug, Clone)]
pub struct ClientHandle {
    /// Connection id this handle belongs to.
    pub connection_id: String,
    sender: mpsc::UnboundedSender<String>,
}

impl ClientHandle {
    /// Create a handle around a transport send queue.
    #[must_use]
    pub fn new(connection_id: impl Into<String>, sender: mpsc::UnboundedSender<String>) -> Self {
        Self {
            connection_id: connection_id.into(),
            sender,
        }
    }

    /// Queue a serialized payload for delivery. Returns `false` if the
    /// transport side is gone.
    pub fn send(&self, payload: String) -> bool {
        self.sender.send(payload).is_ok()
    }
}

/// Per-(project, channel) subscriber registry.
#[derive(Debug, Default)]
pub struct SubscriptionRegistry {
    channels: DashMap<(String, String), HashMap<String, ClientHandle>>,
}

impl SubscriptionRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handle under a channel. Re-adding the same connection id
    /// replaces the handle. Returns `true` if this is the channel's first
    /// local subscriber.
    pub fn add(&self, project: &str, channel: &str, handle: ClientHandle) -> bool {
        let key = (project.to_string(), channel.to_string());
        let mut entry = self.channels.entry(key).or_default();
        let first = entry.is_empty();
        entry.insert(handle.connection_id.clone(), handle);
        first
    }

    /// Remove a connection from a channel. An emptied channel entry is
    /// removed entirely. Returns `true` if the channel has no local
    /// subscribers left.
    pub fn remove(&self, project: &str, channel: &str, connection_id: &str) -> bool {
        let key = (project.to_string(), channel.to_string());
        if let Some(mut entry) = self.channels.get_mut(&key) {
            entry.remove(connection_id);
            if entry.is_empty() {
                drop(entry);
                self.channels.remove(&key);
                debug!(channel = %channel, "Removed empty channel");
                return true;
            }
            return false;
        }
        true
    }

    /// Serialize a `{method, body}` push envelope once and send it to
    /// every registered handle. Returns the number of successful sends.
    pub fn broadcast(&self, project: &str, channel: &str, method: &str, body: Value) -> usize {
        let payload = vortex_protocol::push(method, body).to_string();
        self.broadcast_raw(project, channel, &payload)
    }

    /// Send a pre-serialized payload to every registered handle.
    pub fn broadcast_raw(&self, project: &str, channel: &str, payload: &str) -> usize {
        let key = (project.to_string(), channel.to_string());
        let Some(entry) = self.channels.get(&key) else {
            return 0;
        };

        let mut sent = 0;
        for handle in entry.values() {
            if handle.send(payload.to_string()) {
                sent += 1;
            } else {
                warn!(
                    channel = %channel,
                    connection = %handle.connection_id,
                    "Dropping broadcast to closed connection"
                );
            }
        }
        sent
    }

    /// Whether a channel has any local subscribers.
    #[must_use]
    pub fn has_channel(&self, project: &str, channel: &str) -> bool {
        self.channels
            .contains_key(&(project.to_string(), channel.to_string()))
    }

    /// Number of local subscribers on a channel.
    #[must_use]
    pub fn subscriber_count(&self, project: &str, channel: &str) -> usize {
        self.channels
            .get(&(project.to_string(), channel.to_string()))
            .map(|e| e.len())
            .unwrap_or(0)
    }

    /// Number of channels with at least one local subscriber.
    #[must_use]
    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }
}

/// Registry of admin connections receiving admin-channel broadcasts.
#[derive(Debug, Default)]
pub struct AdminHub {
    handles: DashMap<String, ClientHandle>,
}

impl AdminHub {
    /// Create an empty hub.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an admin connection.
    pub fn add(&self, handle: ClientHandle) {
        self.handles.insert(handle.connection_id.clone(), handle);
    }

    /// Deregister an admin connection.
    pub fn remove(&self, connection_id: &str) {
        self.handles.remove(connection_id);
    }

    /// Send a message to every admin connection.
    pub fn broadcast(&self, message: &Value) -> usize {
        let payload = message.to_string();
        let mut sent = 0;
        for handle in self.handles.iter() {
            if handle.send(payload.clone()) {
                sent += 1;
            }
        }
        sent
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn handle(id: &str) -> (ClientHandle, mpsc::UnboundedReceiver<String>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (ClientHandle::new(id, tx), rx)
    }

    #[test]
    fn test_add_remove_prunes_channel() {
        let registry = SubscriptionRegistry::new();
        let (h, _rx) = handle("c1");

        assert!(registry.add("p", "chat", h));
        assert!(registry.has_channel("p", "chat"));

        assert!(registry.remove("p", "chat", "c1"));
        // Absent from the channel set, not merely empty-but-present.
        assert!(!registry.has_channel("p", "chat"));
        assert_eq!(registry.channel_count(), 0);
    }

    #[test]
    fn test_readd_replaces_handle() {
        let registry = SubscriptionRegistry::new();
        let (h1, mut rx1) = handle("c1");
        let (h2, mut rx2) = handle("c1");

        registry.add("p", "chat", h1);
        assert!(!registry.add("p", "chat", h2));
        assert_eq!(registry.subscriber_count("p", "chat"), 1);

        registry.broadcast("p", "chat", "message", json!({"n": 1}));
        assert!(rx1.try_recv().is_err());
        assert!(rx2.try_recv().is_ok());
    }

    #[test]
    fn test_broadcast_exactly_once_per_handle() {
        let registry = SubscriptionRegistry::new();
        let (h1, mut rx1) = handle("c1");
        let (h2, mut rx2) = handle("c2");
        registry.add("p", "chat", h1);
        registry.add("p", "chat", h2);

        let sent = registry.broadcast("p", "chat", "message", json!({"text": "hi"}));
        assert_eq!(sent, 2);

        let payload = rx1.try_recv().unwrap();
        let envelope: Value = serde_json::from_str(&payload).unwrap();
        assert_eq!(envelope["method"], "message");
        assert_eq!(envelope["body"]["text"], "hi");
        assert!(envelope.get("uid").is_none());

        // Exactly one send attempt per handle per publish.
        assert!(rx1.try_recv().is_err());
        assert!(rx2.try_recv().is_ok());
        assert!(rx2.try_recv().is_err());
    }

    #[test]
    fn test_broadcast_survives_dead_handle() {
        let registry = SubscriptionRegistry::new();
        let (dead, rx_dead) = handle("c1");
        let (alive, mut rx_alive) = handle("c2");
        registry.add("p", "chat", dead);
        registry.add("p", "chat", alive);
        drop(rx_dead);

        let sent = registry.broadcast("p", "chat", "message", json!(1));
        assert_eq!(sent, 1);
        assert!(rx_alive.try_recv().is_ok());
    }

    #[test]
    fn test_broadcast_unknown_channel() {
        let registry = SubscriptionRegistry::new();
        assert_eq!(registry.broadcast("p", "nothing", "message", json!(1)), 0);
    }

    #[test]
    fn test_admin_hub() {
        let hub = AdminHub::new();
        let (h, mut rx) = handle("admin-1");
        hub.add(h);

        assert_eq!(hub.broadcast(&json!({"method": "ping"})), 1);
        assert!(rx.try_recv().is_ok());

        hub.remove("admin-1");
        assert_eq!(hub.broadcast(&json!({"method": "ping"})), 0);
    }
}
