//! The pluggable engine: pub/sub fan-out, presence, and history behind a
//! uniform interface.
//!
//! Two implementations share this contract. [`MemoryEngine`] keeps all
//! state in-process and is the single-node correctness oracle.
//! [`BrokerEngine`] routes publishes and data operations through a shared
//! [`Broker`](crate::broker::Broker) so multiple nodes see identical
//! traffic; the local subscription registry remains the fan-out layer
//! within a node.

mod broker;
mod memory;

pub use broker::BrokerEngine;
pub use memory::MemoryEngine;

use crate::error::EngineError;
use crate::message::{ControlMessage, Message};
use crate::registry::ClientHandle;
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;

/// Uniform engine interface used identically by both implementations.
#[async_trait]
pub trait Engine: Send + Sync {
    /// Engine name for logging.
    fn name(&self) -> &'static str;

    /// Start background work (broker connections, history sweeper).
    async fn initialize(&self) -> Result<(), EngineError>;

    /// Publish a `{method, body}` envelope to a channel's subscribers on
    /// every node.
    async fn publish_message(
        &self,
        project: &str,
        channel: &str,
        method: &str,
        body: Value,
    ) -> Result<(), EngineError>;

    /// Publish an inter-node control message.
    async fn publish_control(&self, message: ControlMessage) -> Result<(), EngineError>;

    /// Publish a message to all admin connections on every node.
    async fn publish_admin(&self, message: Value) -> Result<(), EngineError>;

    /// Register a local subscriber handle for a channel.
    async fn add_subscription(
        &self,
        project: &str,
        channel: &str,
        handle: ClientHandle,
    ) -> Result<(), EngineError>;

    /// Remove a local subscriber from a channel.
    async fn remove_subscription(
        &self,
        project: &str,
        channel: &str,
        connection_id: &str,
    ) -> Result<(), EngineError>;

    /// Upsert a presence entry with a sliding TTL in seconds.
    async fn add_presence(
        &self,
        project: &str,
        channel: &str,
        connection_id: &str,
        info: Value,
        ttl: u64,
    ) -> Result<(), EngineError>;

    /// Remove a presence entry. No error if absent.
    async fn remove_presence(
        &self,
        project: &str,
        channel: &str,
        connection_id: &str,
    ) -> Result<(), EngineError>;

    /// Current presence for a channel, connection id → user info.
    async fn presence(
        &self,
        project: &str,
        channel: &str,
    ) -> Result<HashMap<String, Value>, EngineError>;

    /// Append a message to a channel's history with the namespace's
    /// size/expiry settings.
    async fn add_history_message(
        &self,
        project: &str,
        channel: &str,
        message: &Message,
        max_size: usize,
        expire_seconds: u64,
    ) -> Result<(), EngineError>;

    /// A channel's history, most-recent-first.
    async fn history(&self, project: &str, channel: &str) -> Result<Vec<Message>, EngineError>;

    /// Number of channels with at least one local subscriber.
    fn channel_count(&self) -> usize;
}
