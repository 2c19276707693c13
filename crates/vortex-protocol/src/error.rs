//! Protocol-level errors and client-facing error codes.
//!
//! Error codes are short machine-checkable strings carried in the `error`
//! field of a response. They are a stable wire contract: clients match on
//! them, so the strings never change.

use thiserror::Error;

/// Client-facing error codes.
///
/// A response with a non-null `error` still has the normal envelope shape;
/// only protocol violations (malformed JSON, schema failure, batch cap)
/// close the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    /// Supplied token did not match the expected HMAC.
    InvalidToken,
    /// Operation requires an authenticated session.
    Unauthorized,
    /// Authenticated but not entitled (namespace rules, private channel,
    /// user-restricted channel).
    PermissionDenied,
    /// Feature flag is off for the channel's namespace.
    NotAvailable,
    /// Project, namespace, or resource missing.
    NotFound,
    /// Collaborator or store failure.
    InternalServerError,
    /// Unknown request method.
    MethodNotFound,
    /// Batch size or channel-name-length cap exceeded.
    LimitExceeded,
}

impl ErrorCode {
    /// The wire string for this code.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::InvalidToken => "invalid token",
            ErrorCode::Unauthorized => "unauthorized",
            ErrorCode::PermissionDenied => "permission_denied",
            ErrorCode::NotAvailable => "not_available",
            ErrorCode::NotFound => "not_found",
            ErrorCode::InternalServerError => "internal_server_error",
            ErrorCode::MethodNotFound => "method_not_found",
            ErrorCode::LimitExceeded => "limit_exceeded",
        }
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors raised while decoding an inbound frame.
///
/// Any of these is a protocol violation: the batch is short-circuited and
/// the transport is closed after flushing the partial response.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Frame is not valid JSON.
    #[error("Malformed JSON: {0}")]
    MalformedJson(#[from] serde_json::Error),

    /// Frame is neither an object nor an array of objects.
    #[error("Frame must be an object or an array of objects")]
    InvalidFrame,

    /// Batch exceeds the per-connection request limit.
    #[error("Batch of {0} requests exceeds limit of {1}")]
    BatchTooLarge(usize, usize),

    /// Params failed schema validation for the method.
    #[error("Invalid params for {method}: {reason}")]
    InvalidParams {
        /// The method whose schema was violated.
        method: String,
        /// Human-readable validation failure.
        reason: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_code_strings() {
        assert_eq!(ErrorCode::PermissionDenied.as_str(), "permission_denied");
        assert_eq!(ErrorCode::NotAvailable.as_str(), "not_available");
        assert_eq!(ErrorCode::InvalidToken.as_str(), "invalid token");
        assert_eq!(ErrorCode::LimitExceeded.to_string(), "limit_exceeded");
    }
}
