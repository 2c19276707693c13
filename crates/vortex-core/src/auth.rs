//! HMAC token and API signature verification.
//!
//! Both directions of the wire boundary compute HMAC-SHA256 keyed by the
//! project secret over a byte-exact concatenation, hex-encoded lowercase.
//! The concatenation order is a hard compatibility contract: every
//! existing client library signs in this order, so it never changes.
//!
//! - Client token: `project ++ user ++ timestamp [++ info]`
//! - API signature: `project ++ encoded_payload`
//!
//! No separators are inserted between segments.

use hmac::{Hmac, Mac};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

/// Generate a client connection token.
///
/// `info` is included only when present; a signed empty string and an
/// absent info produce different tokens.
#[must_use]
pub fn generate_client_token(
    secret: &str,
    project: &str,
    user: &str,
    timestamp: &str,
    info: Option<&str>,
) -> String {
    let mut mac = new_mac(secret);
    mac.update(project.as_bytes());
    mac.update(user.as_bytes());
    mac.update(timestamp.as_bytes());
    if let Some(info) = info {
        mac.update(info.as_bytes());
    }
    hex::encode(mac.finalize().into_bytes())
}

/// Check a client connection token. Malformed input never panics; any
/// mismatch simply returns `false`.
#[must_use]
pub fn check_client_token(
    secret: &str,
    project: &str,
    user: &str,
    timestamp: &str,
    info: Option<&str>,
    token: &str,
) -> bool {
    generate_client_token(secret, project, user, timestamp, info) == token
}

/// Generate an API request signature over an encoded payload.
#[must_use]
pub fn generate_api_sign(secret: &str, project: &str, encoded_payload: &str) -> String {
    let mut mac = new_mac(secret);
    mac.update(project.as_bytes());
    mac.update(encoded_payload.as_bytes());
    hex::encode(mac.finalize().into_bytes())
}

/// Check an API request signature.
#[must_use]
pub fn check_api_sign(secret: &str, project: &str, encoded_payload: &str, sign: &str) -> bool {
    generate_api_sign(secret, project, encoded_payload) == sign
}

fn new_mac(secret: &str) -> HmacSha256 {
    // HMAC-SHA256 accepts keys of any length.
    HmacSha256::new_from_slice(secret.as_bytes()).expect("HMAC accepts any key length")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_token_roundtrip() {
        let token = generate_client_token("secret", "proj", "alice", "1700000000", None);
        assert!(check_client_token(
            "secret",
            "proj",
            "alice",
            "1700000000",
            None,
            &token
        ));
    }

    #[test]
    fn test_token_single_byte_changes() {
        let token = generate_client_token("secret", "proj", "alice", "1700000000", None);

        assert!(!check_client_token("Secret", "proj", "alice", "1700000000", None, &token));
        assert!(!check_client_token("secret", "proJ", "alice", "1700000000", None, &token));
        assert!(!check_client_token("secret", "proj", "alicE", "1700000000", None, &token));
        assert!(!check_client_token("secret", "proj", "alice", "1700000001", None, &token));
    }

    #[test]
    fn test_token_info_is_part_of_signature() {
        let with_info =
            generate_client_token("secret", "proj", "alice", "1700000000", Some(r#"{"a":1}"#));
        let without = generate_client_token("secret", "proj", "alice", "1700000000", None);
        assert_ne!(with_info, without);

        // An empty info string adds no bytes, so it matches the no-info token.
        let empty = generate_client_token("secret", "proj", "alice", "1700000000", Some(""));
        assert_eq!(empty, without);
    }

    #[test]
    fn test_api_sign_roundtrip() {
        let sign = generate_api_sign("secret", "proj", r#"{"method":"publish"}"#);
        assert!(check_api_sign("secret", "proj", r#"{"method":"publish"}"#, &sign));
        assert!(!check_api_sign("secret", "proj", r#"{"method":"publish "}"#, &sign));
    }

    #[test]
    fn test_digest_is_lowercase_hex() {
        let token = generate_client_token("s", "p", "u", "t", None);
        assert_eq!(token.len(), 64);
        assert!(token.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
    }
}
