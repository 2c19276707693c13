//! # vortex-protocol
//!
//! Wire protocol definitions for the Vortex realtime engine.
//!
//! Vortex speaks JSON over the transport. An inbound frame carries either a
//! single request object or an array of request objects; the server always
//! answers with an array of response objects, even for a single request.
//! Server-initiated pushes (published messages, join/leave notices,
//! disconnect notices) use a two-field `{method, body}` envelope with no
//! `uid`, since they are not request/response correlated.
//!
//! ## Example
//!
//! ```rust
//! use vortex_protocol::{decode_batch, Method, Response};
//!
//! let reqs = decode_batch(r#"{"uid":"1","method":"ping","params":{}}"#, 100).unwrap();
//! assert_eq!(reqs[0].method(), Some(Method::Ping));
//!
//! let resp = Response::ok(reqs[0].uid.clone(), "ping", serde_json::json!({"data": "pong"}));
//! assert!(resp.error.is_none());
//! ```

pub mod envelope;
pub mod error;

pub use envelope::{
    decode_batch, push, ChannelParams, ClientRequest, ConnectParams, Method, PublishParams,
    Response,
};
pub use error::{ErrorCode, ProtocolError};
