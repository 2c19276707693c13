//! Request, response, and push envelopes for the Vortex protocol.
//!
//! All envelopes are plain JSON. Requests carry an opaque `uid` echo token
//! the server copies into the matching response; pushes carry no `uid`.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ProtocolError;

/// Client-facing request methods.
///
/// The method set is closed: dispatch is an explicit match over this enum,
/// never a lookup by attribute or reflection, so "is this method known" is
/// answered before any handler runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
    Connect,
    Ping,
    Subscribe,
    Unsubscribe,
    Publish,
    Presence,
    History,
}

impl Method {
    /// Parse a wire method name. Returns `None` for unknown methods.
    #[must_use]
    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "connect" => Some(Method::Connect),
            "ping" => Some(Method::Ping),
            "subscribe" => Some(Method::Subscribe),
            "unsubscribe" => Some(Method::Unsubscribe),
            "publish" => Some(Method::Publish),
            "presence" => Some(Method::Presence),
            "history" => Some(Method::History),
            _ => None,
        }
    }

    /// The wire name of this method.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Method::Connect => "connect",
            Method::Ping => "ping",
            Method::Subscribe => "subscribe",
            Method::Unsubscribe => "unsubscribe",
            Method::Publish => "publish",
            Method::Presence => "presence",
            Method::History => "history",
        }
    }
}

/// A single inbound request.
#[derive(Debug, Clone, Deserialize)]
pub struct ClientRequest {
    /// Opaque echo token, copied into the response.
    #[serde(default)]
    pub uid: Option<String>,
    /// Raw method name. Kept as a string so unknown methods can be echoed
    /// back in the error response.
    pub method: String,
    /// Method parameters, validated per-method.
    #[serde(default)]
    pub params: Value,
}

impl ClientRequest {
    /// Resolve the method, if known.
    #[must_use]
    pub fn method(&self) -> Option<Method> {
        Method::parse(&self.method)
    }

    /// Deserialize `params` against the schema type for this method.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::InvalidParams`] on schema violation.
    pub fn parse_params<T: DeserializeOwned>(&self) -> Result<T, ProtocolError> {
        serde_json::from_value(self.params.clone()).map_err(|e| ProtocolError::InvalidParams {
            method: self.method.clone(),
            reason: e.to_string(),
        })
    }
}

/// A single outbound response. The server always sends responses wrapped
/// in a JSON array, even for a single request.
#[derive(Debug, Clone, Serialize)]
pub struct Response {
    /// Echoed request uid, if the request carried one.
    pub uid: Option<String>,
    /// Echoed method name.
    pub method: String,
    /// Error code string, or null on success.
    pub error: Option<String>,
    /// Result body, or null.
    pub body: Value,
}

impl Response {
    /// Build a success response.
    #[must_use]
    pub fn ok(uid: Option<String>, method: impl Into<String>, body: Value) -> Self {
        Self {
            uid,
            method: method.into(),
            error: None,
            body,
        }
    }

    /// Build an error response. `body` may still carry context (e.g. the
    /// channel a denied subscribe targeted).
    #[must_use]
    pub fn err(
        uid: Option<String>,
        method: impl Into<String>,
        error: impl Into<String>,
        body: Value,
    ) -> Self {
        Self {
            uid,
            method: method.into(),
            error: Some(error.into()),
            body,
        }
    }
}

/// Build a push envelope: `{"method": ..., "body": ...}`, no uid.
#[must_use]
pub fn push(method: &str, body: Value) -> Value {
    serde_json::json!({ "method": method, "body": body })
}

/// Decode an inbound frame into a batch of requests.
///
/// The frame may be a single request object or an array of request
/// objects. Array length is capped at `max_batch`.
///
/// # Errors
///
/// Returns a [`ProtocolError`] on malformed JSON, a non-object/array
/// frame, or a batch over the cap. All of these close the connection.
pub fn decode_batch(data: &str, max_batch: usize) -> Result<Vec<ClientRequest>, ProtocolError> {
    let value: Value = serde_json::from_str(data)?;

    match value {
        Value::Object(_) => {
            let req: ClientRequest = serde_json::from_value(value)?;
            Ok(vec![req])
        }
        Value::Array(items) => {
            if items.len() > max_batch {
                return Err(ProtocolError::BatchTooLarge(items.len(), max_batch));
            }
            items
                .into_iter()
                .map(|item| {
                    if !item.is_object() {
                        return Err(ProtocolError::InvalidFrame);
                    }
                    Ok(serde_json::from_value(item)?)
                })
                .collect()
        }
        _ => Err(ProtocolError::InvalidFrame),
    }
}

/// Parameters for `connect`.
///
/// `timestamp` stays a string: the token HMAC covers the exact bytes the
/// client signed, so re-formatting it would break verification.
#[derive(Debug, Clone, Deserialize)]
pub struct ConnectParams {
    /// HMAC token proving the triple below was issued by the project owner.
    pub token: String,
    /// User id; empty string means anonymous.
    #[serde(default)]
    pub user: String,
    /// Target project id.
    pub project: String,
    /// Epoch-seconds string the token was issued at.
    pub timestamp: String,
    /// Optional default user info, included in the token when present.
    #[serde(default)]
    pub info: Option<String>,
}

/// Parameters for `subscribe`, `unsubscribe`, `presence`, and `history`.
#[derive(Debug, Clone, Deserialize)]
pub struct ChannelParams {
    /// Target channel name.
    pub channel: String,
}

/// Parameters for `publish`.
#[derive(Debug, Clone, Deserialize)]
pub struct PublishParams {
    /// Target channel name.
    pub channel: String,
    /// Opaque JSON payload.
    pub data: Value,
}
