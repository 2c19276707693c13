//! Broker-backed engine for multi-node deployments.
//!
//! Publishes go to the shared broker only; local delivery happens when the
//! broker loops the message back over this node's subscriber connection.
//! The broker is the fan-out layer across nodes, the local subscription
//! registry is the fan-out layer within a node.

use crate::broker::{
    self, Broker, BrokerMessage, ADMIN_CHANNEL, CONTROL_CHANNEL,
};
use crate::engine::Engine;
use crate::error::EngineError;
use crate::message::{epoch_seconds, ControlMessage, Message};
use crate::registry::{AdminHub, ClientHandle, SubscriptionRegistry};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// Default broker liveness check cadence.
pub const DEFAULT_CHECK_INTERVAL: Duration = Duration::from_secs(10);

/// Default delay between reconnect attempts.
pub const DEFAULT_RECONNECT_DELAY: Duration = Duration::from_secs(1);

/// Multi-node engine backed by a shared [`Broker`].
pub struct BrokerEngine<B: Broker + 'static> {
    broker: Arc<B>,
    registry: Arc<SubscriptionRegistry>,
    admin: Arc<AdminHub>,
    control_tx: mpsc::UnboundedSender<ControlMessage>,
    /// Broker channels this node currently holds subscriptions for,
    /// re-issued wholesale after a reconnect.
    subscribed: Arc<Mutex<HashSet<String>>>,
    check_interval: Duration,
    reconnect_delay: Duration,
}

impl<B: Broker + 'static> BrokerEngine<B> {
    /// Create an engine with default check/reconnect intervals.
    #[must_use]
    pub fn new(
        broker: Arc<B>,
        registry: Arc<SubscriptionRegistry>,
        admin: Arc<AdminHub>,
        control_tx: mpsc::UnboundedSender<ControlMessage>,
    ) -> Self {
        Self::with_intervals(
            broker,
            registry,
            admin,
            control_tx,
            DEFAULT_CHECK_INTERVAL,
            DEFAULT_RECONNECT_DELAY,
        )
    }

    /// Create an engine with explicit check/reconnect intervals.
    #[must_use]
    pub fn with_intervals(
        broker: Arc<B>,
        registry: Arc<SubscriptionRegistry>,
        admin: Arc<AdminHub>,
        control_tx: mpsc::UnboundedSender<ControlMessage>,
        check_interval: Duration,
        reconnect_delay: Duration,
    ) -> Self {
        Self {
            broker,
            registry,
            admin,
            control_tx,
            subscribed: Arc::new(Mutex::new(HashSet::new())),
            check_interval,
            reconnect_delay,
        }
    }

    fn track(&self, channel: &str) {
        self.subscribed
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(channel.to_string());
    }

    fn untrack(&self, channel: &str) {
        self.subscribed
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(channel);
    }

    /// Dispatch one inbound broker message by channel name.
    fn dispatch(
        message: BrokerMessage,
        registry: &SubscriptionRegistry,
        admin: &AdminHub,
        control_tx: &mpsc::UnboundedSender<ControlMessage>,
    ) {
        match message.channel.as_str() {
            CONTROL_CHANNEL => match serde_json::from_str::<ControlMessage>(&message.payload) {
                Ok(control) => {
                    let _ = control_tx.send(control);
                }
                Err(e) => warn!(error = %e, "Dropping malformed control message"),
            },
            ADMIN_CHANNEL => match serde_json::from_str::<Value>(&message.payload) {
                Ok(value) => {
                    admin.broadcast(&value);
                }
                Err(e) => warn!(error = %e, "Dropping malformed admin message"),
            },
            name => match broker::parse_message_channel(name) {
                Some((project, channel)) => {
                    registry.broadcast_raw(project, channel, &message.payload);
                }
                None => warn!(channel = %name, "Message on unrecognized broker channel"),
            },
        }
    }

    /// Re-issue the control/admin subscriptions plus every tracked channel
    /// after a fresh connect.
    async fn resubscribe(
        broker: &B,
        subscribed: &Mutex<HashSet<String>>,
    ) -> Result<(), EngineError> {
        broker.subscribe(CONTROL_CHANNEL).await?;
        broker.subscribe(ADMIN_CHANNEL).await?;
        let channels: Vec<String> = {
            let tracked = subscribed.lock().unwrap_or_else(|e| e.into_inner());
            tracked.iter().cloned().collect()
        };
        for channel in channels {
            broker.subscribe(&channel).await?;
        }
        Ok(())
    }

    /// Supervisor loop: drain the subscriber stream, probe liveness, and
    /// on any sign of connection loss reconnect all three logical
    /// connections from scratch and re-issue every tracked subscription.
    async fn run(
        broker: Arc<B>,
        registry: Arc<SubscriptionRegistry>,
        admin: Arc<AdminHub>,
        control_tx: mpsc::UnboundedSender<ControlMessage>,
        subscribed: Arc<Mutex<HashSet<String>>>,
        check_interval: Duration,
        reconnect_delay: Duration,
    ) {
        loop {
            let mut stream = match broker.messages().await {
                Ok(stream) => stream,
                Err(e) => {
                    warn!(error = %e, "Broker subscriber stream unavailable");
                    Self::reconnect(&broker, &subscribed, reconnect_delay).await;
                    continue;
                }
            };

            let mut ticker = tokio::time::interval(check_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await;

            loop {
                tokio::select! {
                    message = stream.recv() => match message {
                        Some(message) => Self::dispatch(message, &registry, &admin, &control_tx),
                        None => {
                            warn!("Broker subscriber stream ended");
                            break;
                        }
                    },
                    _ = ticker.tick() => {
                        if let Err(e) = broker.check().await {
                            warn!(error = %e, "Broker liveness check failed");
                            break;
                        }
                    }
                }
            }

            Self::reconnect(&broker, &subscribed, reconnect_delay).await;
        }
    }

    async fn reconnect(
        broker: &B,
        subscribed: &Mutex<HashSet<String>>,
        reconnect_delay: Duration,
    ) {
        loop {
            tokio::time::sleep(reconnect_delay).await;
            if let Err(e) = broker.connect().await {
                debug!(error = %e, "Broker reconnect attempt failed");
                continue;
            }
            match Self::resubscribe(broker, subscribed).await {
                Ok(()) => {
                    info!("Broker reconnected, subscriptions restored");
                    return;
                }
                Err(e) => warn!(error = %e, "Resubscribe after reconnect failed"),
            }
        }
    }
}

#[async_trait]
impl<B: Broker + 'static> Engine for BrokerEngine<B> {
    fn name(&self) -> &'static str {
        "broker"
    }

    async fn initialize(&self) -> Result<(), EngineError> {
        self.broker.connect().await?;
        Self::resubscribe(&self.broker, &self.subscribed).await?;

        tokio::spawn(Self::run(
            Arc::clone(&self.broker),
            Arc::clone(&self.registry),
            Arc::clone(&self.admin),
            self.control_tx.clone(),
            Arc::clone(&self.subscribed),
            self.check_interval,
            self.reconnect_delay,
        ));

        info!("Broker engine initialized");
        Ok(())
    }

    async fn publish_message(
        &self,
        project: &str,
        channel: &str,
        method: &str,
        body: Value,
    ) -> Result<(), EngineError> {
        let payload = vortex_protocol::push(method, body).to_string();
        self.broker
            .publish(&broker::message_channel(project, channel), payload)
            .await
    }

    async fn publish_control(&self, message: ControlMessage) -> Result<(), EngineError> {
        let payload = serde_json::to_string(&message)?;
        self.broker.publish(CONTROL_CHANNEL, payload).await
    }

    async fn publish_admin(&self, message: Value) -> Result<(), EngineError> {
        self.broker
            .publish(ADMIN_CHANNEL, message.to_string())
            .await
    }

    async fn add_subscription(
        &self,
        project: &str,
        channel: &str,
        handle: ClientHandle,
    ) -> Result<(), EngineError> {
        let connection_id = handle.connection_id.clone();
        let first = self.registry.add(project, channel, handle);
        if !first {
            return Ok(());
        }

        let broker_channel = broker::message_channel(project, channel);
        if let Err(e) = self.broker.subscribe(&broker_channel).await {
            // Keep registry and broker interest consistent on failure.
            self.registry.remove(project, channel, &connection_id);
            error!(channel = %channel, error = %e, "Broker subscribe failed");
            return Err(e);
        }
        self.track(&broker_channel);
        Ok(())
    }

    async fn remove_subscription(
        &self,
        project: &str,
        channel: &str,
        connection_id: &str,
    ) -> Result<(), EngineError> {
        let last = self.registry.remove(project, channel, connection_id);
        if !last {
            return Ok(());
        }

        let broker_channel = broker::message_channel(project, channel);
        self.untrack(&broker_channel);
        self.broker.unsubscribe(&broker_channel).await
    }

    async fn add_presence(
        &self,
        project: &str,
        channel: &str,
        connection_id: &str,
        info: Value,
        ttl: u64,
    ) -> Result<(), EngineError> {
        self.broker
            .presence_set(
                &broker::presence_key(project, channel),
                connection_id,
                info,
                epoch_seconds() + ttl,
            )
            .await
    }

    async fn remove_presence(
        &self,
        project: &str,
        channel: &str,
        connection_id: &str,
    ) -> Result<(), EngineError> {
        self.broker
            .presence_remove(&broker::presence_key(project, channel), connection_id)
            .await
    }

    async fn presence(
        &self,
        project: &str,
        channel: &str,
    ) -> Result<HashMap<String, Value>, EngineError> {
        self.broker
            .presence_get(&broker::presence_key(project, channel))
            .await
    }

    async fn add_history_message(
        &self,
        project: &str,
        channel: &str,
        message: &Message,
        max_size: usize,
        expire_seconds: u64,
    ) -> Result<(), EngineError> {
        let entry = serde_json::to_value(message)?;
        self.broker
            .history_push(
                &broker::history_key(project, channel),
                entry,
                max_size,
                expire_seconds,
            )
            .await
    }

    async fn history(&self, project: &str, channel: &str) -> Result<Vec<Message>, EngineError> {
        let entries = self
            .broker
            .history_get(&broker::history_key(project, channel))
            .await?;
        entries
            .into_iter()
            .map(|entry| serde_json::from_value(entry).map_err(EngineError::from))
            .collect()
    }

    fn channel_count(&self) -> usize {
        self.registry.channel_count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::MemoryBroker;
    use serde_json::json;
    use std::time::Duration;
    use tokio::time::timeout;

    fn engine() -> (
        BrokerEngine<MemoryBroker>,
        Arc<MemoryBroker>,
        mpsc::UnboundedReceiver<ControlMessage>,
    ) {
        let broker = Arc::new(MemoryBroker::new());
        let (control_tx, control_rx) = mpsc::unbounded_channel();
        let engine = BrokerEngine::with_intervals(
            Arc::clone(&broker),
            Arc::new(SubscriptionRegistry::new()),
            Arc::new(AdminHub::new()),
            control_tx,
            Duration::from_millis(20),
            Duration::from_millis(10),
        );
        (engine, broker, control_rx)
    }

    #[tokio::test]
    async fn test_publish_delivered_via_broker_loopback() {
        let (engine, _broker, _control) = engine();
        engine.initialize().await.unwrap();

        let (tx, mut rx) = mpsc::unbounded_channel();
        engine
            .add_subscription("p", "chat", ClientHandle::new("c1", tx))
            .await
            .unwrap();
        engine
            .publish_message("p", "chat", "message", json!({"text": "hi"}))
            .await
            .unwrap();

        let payload = timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap();
        let envelope: Value = serde_json::from_str(&payload).unwrap();
        assert_eq!(envelope["method"], "message");
        assert_eq!(envelope["body"]["text"], "hi");
    }

    #[tokio::test]
    async fn test_first_and_last_subscriber_drive_broker_interest() {
        let (engine, broker, _control) = engine();
        engine.initialize().await.unwrap();

        let (tx1, _rx1) = mpsc::unbounded_channel();
        let (tx2, _rx2) = mpsc::unbounded_channel();
        let broker_channel = broker::message_channel("p", "chat");

        engine
            .add_subscription("p", "chat", ClientHandle::new("c1", tx1))
            .await
            .unwrap();
        assert!(broker.subscribed_channels().contains(&broker_channel));

        engine
            .add_subscription("p", "chat", ClientHandle::new("c2", tx2))
            .await
            .unwrap();

        engine.remove_subscription("p", "chat", "c1").await.unwrap();
        assert!(broker.subscribed_channels().contains(&broker_channel));

        engine.remove_subscription("p", "chat", "c2").await.unwrap();
        assert!(!broker.subscribed_channels().contains(&broker_channel));
    }

    #[tokio::test]
    async fn test_control_messages_dispatched_to_coordinator() {
        let (engine, _broker, mut control) = engine();
        engine.initialize().await.unwrap();

        engine
            .publish_control(ControlMessage::new("node-1", "ping", json!({"name": "n1"})))
            .await
            .unwrap();

        let msg = timeout(Duration::from_secs(1), control.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(msg.uid, "node-1");
        assert_eq!(msg.method, "ping");
    }

    #[tokio::test]
    async fn test_publish_fails_while_disconnected() {
        let (engine, broker, _control) = engine();
        engine.initialize().await.unwrap();

        broker.set_healthy(false);
        assert!(engine
            .publish_message("p", "chat", "message", json!(1))
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_reconnect_restores_subscriptions() {
        let (engine, broker, _control) = engine();
        engine.initialize().await.unwrap();

        let (tx, mut rx) = mpsc::unbounded_channel();
        engine
            .add_subscription("p", "chat", ClientHandle::new("c1", tx))
            .await
            .unwrap();

        // Connection loss: stream drops, reconnect attempts fail until the
        // broker is reachable again.
        broker.set_healthy(false);
        tokio::time::sleep(Duration::from_millis(50)).await;
        broker.set_healthy(true);

        // Wait for the supervisor to reconnect and restore interest.
        let broker_channel = broker::message_channel("p", "chat");
        let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
        while !broker.subscribed_channels().contains(&broker_channel) {
            assert!(tokio::time::Instant::now() < deadline, "reconnect timed out");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        engine
            .publish_message("p", "chat", "message", json!({"after": "reconnect"}))
            .await
            .unwrap();
        let payload = timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap();
        let envelope: Value = serde_json::from_str(&payload).unwrap();
        assert_eq!(envelope["body"]["after"], "reconnect");
    }

    #[tokio::test]
    async fn test_presence_and_history_are_remote_operations() {
        let (engine, _broker, _control) = engine();
        engine.initialize().await.unwrap();

        engine
            .add_presence("p", "chat", "c1", json!({"user": "alice"}), 60)
            .await
            .unwrap();
        let presence = engine.presence("p", "chat").await.unwrap();
        assert_eq!(presence["c1"]["user"], "alice");

        let msg = Message::new("p", "chat", json!({"n": 1}), None);
        engine
            .add_history_message("p", "chat", &msg, 2, 0)
            .await
            .unwrap();
        let history = engine.history("p", "chat").await.unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].data["n"], 1);
        assert_eq!(history[0].project, "p");
    }
}
