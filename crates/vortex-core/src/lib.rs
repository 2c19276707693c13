//! # vortex-core
//!
//! Engine, presence, history, and subscription routing for the Vortex
//! realtime message-distribution engine.
//!
//! This crate provides the fundamental building blocks:
//!
//! - **Auth** - HMAC token and API signature verification
//! - **Channel** - namespaced channel-name parsing and validation
//! - **Presence** - per-channel membership with sliding expiry
//! - **History** - bounded, optionally time-expiring message cache
//! - **Registry** - per-channel subscriber handles and broadcast fan-out
//! - **Engine** - uniform pub/sub interface with in-process and
//!   broker-backed implementations
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐     ┌─────────────┐     ┌──────────────┐
//! │   Session   │────▶│   Engine    │────▶│   Registry   │
//! └─────────────┘     └─────────────┘     └──────────────┘
//!                            │
//!                  ┌─────────┴─────────┐
//!                  ▼                   ▼
//!           ┌─────────────┐     ┌─────────────┐
//!           │  Presence   │     │   History   │
//!           └─────────────┘     └─────────────┘
//! ```
//!
//! The in-process [`MemoryEngine`](engine::MemoryEngine) calls the three
//! stores directly and is the single-node correctness oracle. The
//! [`BrokerEngine`](engine::BrokerEngine) routes publishes through a shared
//! [`Broker`](broker::Broker) so multiple nodes see the same traffic, while
//! the local registry remains the within-node fan-out layer.

pub mod auth;
pub mod broker;
pub mod channel;
pub mod engine;
pub mod error;
pub mod history;
pub mod message;
pub mod presence;
pub mod registry;

pub use broker::{Broker, BrokerMessage, MemoryBroker};
pub use engine::{BrokerEngine, Engine, MemoryEngine};
pub use error::EngineError;
pub use history::HistoryStore;
pub use message::{ClientInfo, ControlMessage, Message};
pub use presence::PresenceStore;
pub use registry::{AdminHub, ClientHandle, SubscriptionRegistry};
