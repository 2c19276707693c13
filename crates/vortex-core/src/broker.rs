//! Broker abstraction for the multi-node engine.
//!
//! A broker provides three logical connections: a subscriber connection
//! delivering inbound messages for subscribed channels (plus the fixed
//! control and admin channels), a publisher connection, and a data
//! connection for presence/history operations against the broker's store.
//!
//! The [`MemoryBroker`] is an in-process loopback implementation used as
//! the correctness oracle for [`BrokerEngine`](crate::engine::BrokerEngine)
//! and by tests. A Redis binding would implement this trait with pub/sub
//! for messaging, a scored set for presence, and a capped list with TTL
//! for history.

use crate::error::EngineError;
use crate::message::epoch_seconds;
use async_trait::async_trait;
use serde_json::Value;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Mutex;
use tokio::sync::mpsc;
use tracing::debug;

/// Broker channel carrying inter-node control messages.
pub const CONTROL_CHANNEL: &str = "$vortex.control";

/// Broker channel carrying admin broadcasts.
pub const ADMIN_CHANNEL: &str = "$vortex.admin";

/// Broker channel name for a project channel.
///
/// Project ids must not contain `.`; channel names may.
#[must_use]
pub fn message_channel(project: &str, channel: &str) -> String {
    format!("vortex.message.{project}.{channel}")
}

/// Parse a broker message-channel name back into (project, channel).
#[must_use]
pub fn parse_message_channel(name: &str) -> Option<(&str, &str)> {
    let rest = name.strip_prefix("vortex.message.")?;
    rest.split_once('.')
}

/// Broker key for a channel's presence data.
#[must_use]
pub fn presence_key(project: &str, channel: &str) -> String {
    format!("vortex.presence.{project}.{channel}")
}

/// Broker key for a channel's history data.
#[must_use]
pub fn history_key(project: &str, channel: &str) -> String {
    format!("vortex.history.{project}.{channel}")
}

/// A message delivered over the broker's subscriber connection.
#[derive(Debug, Clone)]
pub struct BrokerMessage {
    /// Broker channel the message arrived on.
    pub channel: String,
    /// Serialized payload.
    pub payload: String,
}

/// The broker contract consumed by the broker-backed engine.
#[async_trait]
pub trait Broker: Send + Sync {
    /// (Re)establish all three logical connections from scratch. Previous
    /// subscriptions are gone after this; the caller re-issues them.
    async fn connect(&self) -> Result<(), EngineError>;

    /// Liveness probe for the connection set.
    async fn check(&self) -> Result<(), EngineError>;

    /// Take the inbound message stream of the current subscriber
    /// connection. The stream ends when the connection drops.
    async fn messages(&self) -> Result<mpsc::UnboundedReceiver<BrokerMessage>, EngineError>;

    /// Subscribe the subscriber connection to a broker channel.
    async fn subscribe(&self, channel: &str) -> Result<(), EngineError>;

    /// Unsubscribe the subscriber connection from a broker channel.
    async fn unsubscribe(&self, channel: &str) -> Result<(), EngineError>;

    /// Publish a payload to a broker channel.
    async fn publish(&self, channel: &str, payload: String) -> Result<(), EngineError>;

    /// Upsert a presence entry under `key`, scored by absolute expiry.
    async fn presence_set(
        &self,
        key: &str,
        connection_id: &str,
        info: Value,
        expire_at: u64,
    ) -> Result<(), EngineError>;

    /// Remove a presence entry. No error if absent.
    async fn presence_remove(&self, key: &str, connection_id: &str) -> Result<(), EngineError>;

    /// Read presence under `key`, dropping (and deleting) entries whose
    /// expiry has passed.
    async fn presence_get(&self, key: &str) -> Result<HashMap<String, Value>, EngineError>;

    /// Prepend an entry to the capped list under `key`. `expire_seconds`
    /// follows history-store semantics: `> 0` resets the list TTL, `0`
    /// clears it.
    async fn history_push(
        &self,
        key: &str,
        entry: Value,
        max_size: usize,
        expire_seconds: u64,
    ) -> Result<(), EngineError>;

    /// Read the list under `key`, most-recent-first; an expired list is
    /// deleted and an empty vec returned.
    async fn history_get(&self, key: &str) -> Result<Vec<Value>, EngineError>;
}

#[derive(Debug, Default)]
struct MemoryBrokerState {
    consumer: Option<mpsc::UnboundedSender<BrokerMessage>>,
    subscriptions: HashSet<String>,
    presence: HashMap<String, HashMap<String, (u64, Value)>>,
    history: HashMap<String, (VecDeque<Value>, Option<u64>)>,
    healthy: bool,
}

/// In-process loopback broker.
///
/// Published messages are delivered back to this broker's own subscriber
/// stream if the channel is subscribed, which is exactly the single-node
/// view of a shared broker. Tests flip `set_healthy` to exercise the
/// engine's reconnect path.
#[derive(Debug)]
pub struct MemoryBroker {
    state: Mutex<MemoryBrokerState>,
}

impl MemoryBroker {
    /// Create a reachable broker with no connections established yet.
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: Mutex::new(MemoryBrokerState {
                healthy: true,
                ..MemoryBrokerState::default()
            }),
        }
    }

    /// Simulate broker reachability. Marking the broker unhealthy drops
    /// the current subscriber stream, as a real connection loss would,
    /// and makes every operation (including `connect`) fail until the
    /// broker is marked healthy again.
    pub fn set_healthy(&self, healthy: bool) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.healthy = healthy;
        if !healthy {
            state.consumer = None;
        }
    }

    /// Channels the subscriber connection currently holds. Test helper.
    #[must_use]
    pub fn subscribed_channels(&self) -> HashSet<String> {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.subscriptions.clone()
    }

    fn ensure_healthy(state: &MemoryBrokerState) -> Result<(), EngineError> {
        if state.healthy {
            Ok(())
        } else {
            Err(EngineError::BrokerUnavailable("connection down".into()))
        }
    }
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn connect(&self) -> Result<(), EngineError> {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        Self::ensure_healthy(&state)?;
        state.subscriptions.clear();
        state.consumer = None;
        debug!("Memory broker connected");
        Ok(())
    }

    async fn check(&self) -> Result<(), EngineError> {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        Self::ensure_healthy(&state)
    }

    async fn messages(&self) -> Result<mpsc::UnboundedReceiver<BrokerMessage>, EngineError> {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        Self::ensure_healthy(&state)?;
        let (tx, rx) = mpsc::unbounded_channel();
        state.consumer = Some(tx);
        Ok(rx)
    }

    async fn subscribe(&self, channel: &str) -> Result<(), EngineError> {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        Self::ensure_healthy(&state)?;
        state.subscriptions.insert(channel.to_string());
        Ok(())
    }

    async fn unsubscribe(&self, channel: &str) -> Result<(), EngineError> {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        Self::ensure_healthy(&state)?;
        state.subscriptions.remove(channel);
        Ok(())
    }

    async fn publish(&self, channel: &str, payload: String) -> Result<(), EngineError> {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        Self::ensure_healthy(&state)?;
        if state.subscriptions.contains(channel) {
            if let Some(consumer) = &state.consumer {
                let _ = consumer.send(BrokerMessage {
                    channel: channel.to_string(),
                    payload,
                });
            }
        }
        Ok(())
    }

    async fn presence_set(
        &self,
        key: &str,
        connection_id: &str,
        info: Value,
        expire_at: u64,
    ) -> Result<(), EngineError> {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        Self::ensure_healthy(&state)?;
        state
            .presence
            .entry(key.to_string())
            .or_default()
            .insert(connection_id.to_string(), (expire_at, info));
        Ok(())
    }

    async fn presence_remove(&self, key: &str, connection_id: &str) -> Result<(), EngineError> {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        Self::ensure_healthy(&state)?;
        if let Some(entries) = state.presence.get_mut(key) {
            entries.remove(connection_id);
            if entries.is_empty() {
                state.presence.remove(key);
            }
        }
        Ok(())
    }

    async fn presence_get(&self, key: &str) -> Result<HashMap<String, Value>, EngineError> {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        Self::ensure_healthy(&state)?;
        let now = epoch_seconds();
        let Some(entries) = state.presence.get_mut(key) else {
            return Ok(HashMap::new());
        };
        entries.retain(|_, (expire_at, _)| *expire_at > now);
        let result = entries
            .iter()
            .map(|(id, (_, info))| (id.clone(), info.clone()))
            .collect();
        if entries.is_empty() {
            state.presence.remove(key);
        }
        Ok(result)
    }

    async fn history_push(
        &self,
        key: &str,
        entry: Value,
        max_size: usize,
        expire_seconds: u64,
    ) -> Result<(), EngineError> {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        Self::ensure_healthy(&state)?;
        let (list, expire) = state.history.entry(key.to_string()).or_default();
        list.push_front(entry);
        list.truncate(max_size);
        *expire = if expire_seconds > 0 {
            Some(epoch_seconds() + expire_seconds)
        } else {
            None
        };
        Ok(())
    }

    async fn history_get(&self, key: &str) -> Result<Vec<Value>, EngineError> {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        Self::ensure_healthy(&state)?;
        if let Some((_, Some(expire_at))) = state.history.get(key) {
            if *expire_at <= epoch_seconds() {
                state.history.remove(key);
                return Ok(Vec::new());
            }
        }
        Ok(state
            .history
            .get(key)
            .map(|(list, _)| list.iter().cloned().collect())
            .unwrap_or_default())
    }
}
