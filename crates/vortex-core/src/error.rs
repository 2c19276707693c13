//! Engine errors.

use thiserror::Error;

/// Errors surfaced by engine operations.
///
/// Presence and history are best-effort data: a failed store operation is
/// reported to the caller and mapped to an internal-error response, never
/// retried silently.
#[derive(Debug, Error)]
pub enum EngineError {
    /// The broker connection is down or a broker round-trip failed.
    #[error("Broker unavailable: {0}")]
    BrokerUnavailable(String),

    /// Payload could not be serialized or deserialized.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Internal engine failure.
    #[error("Internal error: {0}")]
    Internal(String),
}
