//! Presence tracking with sliding expiry.
//!
//! Presence is ephemeral "who is currently in this channel" data. Entries
//! are refreshed on subscribe and on each presence-ping tick; an entry
//! whose `expire_at` has passed is never returned by a read and is
//! physically removed by the read that observes it.

use crate::message::epoch_seconds;
use dashmap::DashMap;
use serde_json::Value;
use std::collections::HashMap;
use tracing::debug;

/// A single presence entry.
#[derive(Debug, Clone)]
struct PresenceEntry {
    expire_at: u64,
    info: Value,
}

/// Per-(project, channel) presence store.
#[derive(Debug, Default)]
pub struct PresenceStore {
    channels: DashMap<(String, String), HashMap<String, PresenceEntry>>,
}

impl PresenceStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Upsert a presence entry with `expire_at = now + ttl`.
    pub fn add(&self, project: &str, channel: &str, connection_id: &str, info: Value, ttl: u64) {
        let mut entry = self
            .channels
            .entry((project.to_string(), channel.to_string()))
            .or_default();
        entry.insert(
            connection_id.to_string(),
            PresenceEntry {
                expire_at: epoch_seconds() + ttl,
                info,
            },
        );
    }

    /// Remove a presence entry. No error if absent.
    pub fn remove(&self, project: &str, channel: &str, connection_id: &str) {
        let key = (project.to_string(), channel.to_string());
        if let Some(mut entry) = self.channels.get_mut(&key) {
            entry.remove(connection_id);
            if entry.is_empty() {
                drop(entry);
                self.channels.remove(&key);
            }
        }
    }

    /// Get current presence for a channel, filtering out and physically
    /// deleting expired entries. Returns an empty map for unknown channels.
    #[must_use]
    pub fn get(&self, project: &str, channel: &str) -> HashMap<String, Value> {
        let key = (project.to_string(), channel.to_string());
        let now = epoch_seconds();

        let Some(mut entry) = self.channels.get_mut(&key) else {
            return HashMap::new();
        };

        let expired: Vec<String> = entry
            .iter()
            .filter(|(_, e)| e.expire_at <= now)
            .map(|(id, _)| id.clone())
            .collect();
        for id in &expired {
            entry.remove(id);
            debug!(channel = %channel, connection = %id, "Presence entry expired");
        }

        let result = entry
            .iter()
            .map(|(id, e)| (id.clone(), e.info.clone()))
            .collect();

        if entry.is_empty() {
            drop(entry);
            self.channels.remove(&key);
        }

        result
    }

    /// Whether an entry exists for a connection, expired or not. Test and
    /// introspection helper.
    #[must_use]
    pub fn contains(&self, project: &str, channel: &str, connection_id: &str) -> bool {
        self.channels
            .get(&(project.to_string(), channel.to_string()))
            .is_some_and(|e| e.contains_key(connection_id))
    }
}
