//! Message envelopes for regular, control, and admin traffic.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

/// Atomic counter for ensuring unique IDs even within the same nanosecond.
static ID_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Generate a unique message/connection id.
#[must_use]
pub fn generate_uid() -> String {
    let timestamp = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos() as u64;
    let counter = ID_COUNTER.fetch_add(1, Ordering::Relaxed);
    format!("{:x}", timestamp.wrapping_add(counter))
}

/// Wall-clock time in whole seconds since the UNIX epoch.
#[must_use]
pub fn epoch_seconds() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Info about the client that originated a message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientInfo {
    /// User id; empty for anonymous.
    pub user: String,
    /// Connection id.
    pub client: String,
    /// Default per-connection info set at connect time.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default_info: Option<Value>,
    /// Per-channel info set by the authorization callback.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub channel_info: Option<Value>,
}

/// A published message envelope. Immutable once published.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    /// Unique message id.
    pub uid: String,
    /// Owning project id. Stripped before the envelope reaches
    /// subscribers; only admin/history internals see it.
    pub project: String,
    /// Target channel.
    pub channel: String,
    /// Publish time, epoch seconds.
    pub timestamp: u64,
    /// Originating client info, if the publish came from a client.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub info: Option<ClientInfo>,
    /// Opaque JSON payload.
    pub data: Value,
}

impl Message {
    /// Create a new message envelope.
    #[must_use]
    pub fn new(
        project: impl Into<String>,
        channel: impl Into<String>,
        data: Value,
        info: Option<ClientInfo>,
    ) -> Self {
        Self {
            uid: generate_uid(),
            project: project.into(),
            channel: channel.into(),
            timestamp: epoch_seconds(),
            info,
            data,
        }
    }

    /// The client-facing body of this message. Subscribers must never see
    /// the project id.
    #[must_use]
    pub fn client_body(&self) -> Value {
        let mut body = serde_json::json!({
            "uid": self.uid,
            "channel": self.channel,
            "timestamp": self.timestamp,
            "data": self.data,
        });
        if let Some(info) = &self.info {
            body["info"] = serde_json::to_value(info).unwrap_or(Value::Null);
        }
        body
    }
}

/// An inter-node control message, distinct from regular channel traffic.
///
/// `uid` is the origin node id: a node receiving its own uid back is
/// seeing a loopback echo of its own publish and ignores it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControlMessage {
    /// Origin node id.
    pub uid: String,
    /// Control method: `ping`, `unsubscribe`, `disconnect`,
    /// `update_structure`.
    pub method: String,
    /// Method parameters.
    #[serde(default)]
    pub params: Value,
}

impl ControlMessage {
    /// Create a new control message originating from `node_uid`.
    #[must_use]
    pub fn new(node_uid: impl Into<String>, method: impl Into<String>, params: Value) -> Self {
        Self {
            uid: node_uid.into(),
            method: method.into(),
            params,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_unique_uids() {
        let a = generate_uid();
        let b = generate_uid();
        assert_ne!(a, b);
    }

    #[test]
    fn test_client_body_strips_project() {
        let msg = Message::new("proj", "news:sports", json!({"text": "hi"}), None);
        let body = msg.client_body();
        assert!(body.get("project").is_none());
        assert_eq!(body["channel"], "news:sports");
        assert_eq!(body["data"]["text"], "hi");
        assert!(body.get("info").is_none());
    }

    #[test]
    fn test_client_body_carries_info() {
        let info = ClientInfo {
            user: "alice".into(),
            client: "c1".into(),
            default_info: Some(json!({"name": "Alice"})),
            channel_info: None,
        };
        let msg = Message::new("proj", "chat:room", json!(1), Some(info));
        let body = msg.client_body();
        assert_eq!(body["info"]["user"], "alice");
        assert!(body["info"].get("channel_info").is_none());
    }

    #[test]
    fn test_control_message_roundtrip() {
        let msg = ControlMessage::new("node-1", "ping", json!({"name": "n1"}));
        let encoded = serde_json::to_string(&msg).unwrap();
        let decoded: ControlMessage = serde_json::from_str(&encoded).unwrap();
        assert_eq!(decoded.uid, "node-1");
        assert_eq!(decoded.method, "ping");
    }
}
