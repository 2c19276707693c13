//! In-process engine: direct calls into the local stores.

use crate::engine::Engine;
use crate::error::EngineError;
use crate::history::HistoryStore;
use crate::message::{ControlMessage, Message};
use crate::presence::PresenceStore;
use crate::registry::{AdminHub, ClientHandle, SubscriptionRegistry};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::info;

/// Single-node engine. All operations are direct calls into the local
/// presence, history, and subscription components — no network hop.
pub struct MemoryEngine {
    registry: Arc<SubscriptionRegistry>,
    admin: Arc<AdminHub>,
    presence: PresenceStore,
    history: Arc<HistoryStore>,
    control_tx: mpsc::UnboundedSender<ControlMessage>,
}

impl MemoryEngine {
    /// Create an engine around shared registry/admin state and a control
    /// message sink (consumed by the node coordinator).
    #[must_use]
    pub fn new(
        registry: Arc<SubscriptionRegistry>,
        admin: Arc<AdminHub>,
        control_tx: mpsc::UnboundedSender<ControlMessage>,
    ) -> Self {
        Self {
            registry,
            admin,
            presence: PresenceStore::new(),
            history: Arc::new(HistoryStore::new()),
            control_tx,
        }
    }
}

#[async_trait]
impl Engine for MemoryEngine {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn initialize(&self) -> Result<(), EngineError> {
        let _ = self.history.start_sweeper(crate::history::SWEEP_INTERVAL);
        info!("Memory engine initialized");
        Ok(())
    }

    async fn publish_message(
        &self,
        project: &str,
        channel: &str,
        method: &str,
        body: Value,
    ) -> Result<(), EngineError> {
        self.registry.broadcast(project, channel, method, body);
        Ok(())
    }

    async fn publish_control(&self, message: ControlMessage) -> Result<(), EngineError> {
        self.control_tx
            .send(message)
            .map_err(|_| EngineError::Internal("control channel closed".into()))
    }

    async fn publish_admin(&self, message: Value) -> Result<(), EngineError> {
        self.admin.broadcast(&message);
        Ok(())
    }

    async fn add_subscription(
        &self,
        project: &str,
        channel: &str,
        handle: ClientHandle,
    ) -> Result<(), EngineError> {
        self.registry.add(project, channel, handle);
        Ok(())
    }

    async fn remove_subscription(
        &self,
        project: &str,
        channel: &str,
        connection_id: &str,
    ) -> Result<(), EngineError> {
        self.registry.remove(project, channel, connection_id);
        Ok(())
    }

    async fn add_presence(
        &self,
        project: &str,
        channel: &str,
        connection_id: &str,
        info: Value,
        ttl: u64,
    ) -> Result<(), EngineError> {
        self.presence.add(project, channel, connection_id, info, ttl);
        Ok(())
    }

    async fn remove_presence(
        &self,
        project: &str,
        channel: &str,
        connection_id: &str,
    ) -> Result<(), EngineError> {
        self.presence.remove(project, channel, connection_id);
        Ok(())
    }

    async fn presence(
        &self,
        project: &str,
        channel: &str,
    ) -> Result<HashMap<String, Value>, EngineError> {
        Ok(self.presence.get(project, channel))
    }

    async fn add_history_message(
        &self,
        project: &str,
        channel: &str,
        message: &Message,
        max_size: usize,
        expire_seconds: u64,
    ) -> Result<(), EngineError> {
        self.history
            .add_message(project, channel, message, max_size, expire_seconds);
        Ok(())
    }

    async fn history(&self, project: &str, channel: &str) -> Result<Vec<Message>, EngineError> {
        Ok(self.history.get(project, channel))
    }

    fn channel_count(&self) -> usize {
        self.registry.channel_count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn engine() -> (MemoryEngine, mpsc::UnboundedReceiver<ControlMessage>) {
        let (control_tx, control_rx) = mpsc::unbounded_channel();
        let engine = MemoryEngine::new(
            Arc::new(SubscriptionRegistry::new()),
            Arc::new(AdminHub::new()),
            control_tx,
        );
        (engine, control_rx)
    }

    #[tokio::test]
    async fn test_publish_reaches_local_subscriber() {
        let (engine, _control) = engine();
        let (tx, mut rx) = mpsc::unbounded_channel();

        engine
            .add_subscription("p", "chat", ClientHandle::new("c1", tx))
            .await
            .unwrap();
        engine
            .publish_message("p", "chat", "message", json!({"text": "hi"}))
            .await
            .unwrap();

        let payload = rx.try_recv().unwrap();
        let envelope: Value = serde_json::from_str(&payload).unwrap();
        assert_eq!(envelope["method"], "message");
        assert_eq!(envelope["body"]["text"], "hi");
    }

    #[tokio::test]
    async fn test_control_messages_loop_back() {
        let (engine, mut control) = engine();
        engine
            .publish_control(ControlMessage::new("node-1", "ping", json!({})))
            .await
            .unwrap();
        let msg = control.try_recv().unwrap();
        assert_eq!(msg.method, "ping");
    }

    #[tokio::test]
    async fn test_presence_and_history_pass_through() {
        let (engine, _control) = engine();

        engine
            .add_presence("p", "chat", "c1", json!({"user": "alice"}), 60)
            .await
            .unwrap();
        let presence = engine.presence("p", "chat").await.unwrap();
        assert_eq!(presence.len(), 1);

        let msg = Message::new("p", "chat", json!(1), None);
        engine
            .add_history_message("p", "chat", &msg, 10, 0)
            .await
            .unwrap();
        assert_eq!(engine.history("p", "chat").await.unwrap().len(), 1);
    }
}
