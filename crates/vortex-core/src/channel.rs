//! Channel name parsing and validation.
//!
//! A channel is a plain string key, optionally namespaced with a single
//! `:` separator (`news:sports` resolves feature flags from the `news`
//! namespace) and optionally carrying a `#`-delimited user-restriction
//! suffix (`chat:room#alice,bob` restricts subscription to the listed
//! users). Both are parsed directly off the string, never stored.

/// Default maximum channel name length. Deployments may lower this via
/// configuration; the session enforces the configured cap.
pub const MAX_CHANNEL_NAME_LENGTH: usize = 255;

/// Namespace separator.
pub const NAMESPACE_SEPARATOR: char = ':';

/// User-restriction suffix separator.
pub const USER_SEPARATOR: char = '#';

/// Extract the namespace prefix of a channel, if it has one.
///
/// The namespace is everything before the first `:`, ignoring any
/// user-restriction suffix. A channel without `:` has no namespace and
/// falls back to project-default options.
#[must_use]
pub fn namespace_of(channel: &str) -> Option<&str> {
    let base = channel.split(USER_SEPARATOR).next().unwrap_or(channel);
    base.split_once(NAMESPACE_SEPARATOR).map(|(ns, _)| ns)
}

/// Extract the allowed-user list from a channel's `#` suffix, if present.
///
/// `chat:room#alice,bob` yields `["alice", "bob"]`. A channel without a
/// `#` is unrestricted.
#[must_use]
pub fn allowed_users(channel: &str) -> Option<Vec<&str>> {
    channel
        .split_once(USER_SEPARATOR)
        .map(|(_, users)| users.split(',').filter(|u| !u.is_empty()).collect())
}

/// Validate a channel name against a length cap.
///
/// # Errors
///
/// Returns an error message if the channel name is invalid.
pub fn validate_channel_name(name: &str, max_length: usize) -> Result<(), &'static str> {
    if name.is_empty() {
        return Err("Channel name cannot be empty");
    }
    if name.len() > max_length {
        return Err("Channel name too long");
    }
    if name.starts_with('$') {
        return Err("Channel names starting with '$' are reserved");
    }
    if !name.chars().all(|c| c.is_ascii() && !c.is_ascii_control()) {
        return Err("Channel name contains invalid characters");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_namespace_parsing() {
        assert_eq!(namespace_of("news:sports"), Some("news"));
        assert_eq!(namespace_of("news:sports:extra"), Some("news"));
        assert_eq!(namespace_of("plain"), None);
        assert_eq!(namespace_of("news:sports#alice"), Some("news"));
        assert_eq!(namespace_of("plain#alice"), None);
    }

    #[test]
    fn test_allowed_users() {
        assert_eq!(allowed_users("chat:room#alice,bob"), Some(vec!["alice", "bob"]));
        assert_eq!(allowed_users("chat:room#alice"), Some(vec!["alice"]));
        assert_eq!(allowed_users("chat:room"), None);
        // Trailing comma does not produce an empty user.
        assert_eq!(allowed_users("chat:room#alice,"), Some(vec!["alice"]));
    }

    #[test]
    fn test_channel_name_validation() {
        assert!(validate_channel_name("valid:channel", MAX_CHANNEL_NAME_LENGTH).is_ok());
        assert!(validate_channel_name("", MAX_CHANNEL_NAME_LENGTH).is_err());
        assert!(validate_channel_name("$control", MAX_CHANNEL_NAME_LENGTH).is_err());

        let long_name = "a".repeat(MAX_CHANNEL_NAME_LENGTH + 1);
        assert!(validate_channel_name(&long_name, MAX_CHANNEL_NAME_LENGTH).is_err());
    }
}
