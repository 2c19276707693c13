//! Bounded, optionally time-expiring message history.
//!
//! History is a best-effort cache, not a log: each channel holds a
//! most-recent-first list truncated to a size cap, with a single optional
//! expiry timestamp for the whole list. A later write's expiry argument
//! overwrites the previous one, including overwriting a real expiry with
//! "no expiry". Expired lists are deleted lazily on read and swept
//! periodically by a background task.

use crate::message::{epoch_seconds, Message};
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::debug;

/// Sweep cadence for the background expiry task.
pub const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

type ChannelKey = (String, String);

#[derive(Debug, Default)]
struct HistoryInner {
    lists: HashMap<ChannelKey, VecDeque<Message>>,
    /// Authoritative expiry timestamps, keyed by channel.
    expires: HashMap<ChannelKey, u64>,
    /// Expiry schedule. Entries may be stale relative to `expires`; the
    /// sweep re-validates before deleting.
    schedule: BinaryHeap<Reverse<(u64, ChannelKey)>>,
}

/// Per-(project, channel) history store.
#[derive(Debug, Default)]
pub struct HistoryStore {
    inner: Mutex<HistoryInner>,
}

impl HistoryStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Prepend a message to a channel's history, truncating to `max_size`.
    ///
    /// `expire_seconds > 0` (re)sets the whole list's expiry to
    /// `now + expire_seconds`; `expire_seconds == 0` clears any previously
    /// set expiry, leaving the list subject to size eviction only.
    pub fn add_message(
        &self,
        project: &str,
        channel: &str,
        message: &Message,
        max_size: usize,
        expire_seconds: u64,
    ) {
        let key = (project.to_string(), channel.to_string());
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());

        let list = inner.lists.entry(key.clone()).or_default();
        list.push_front(message.clone());
        list.truncate(max_size);

        if expire_seconds > 0 {
            let expire_at = epoch_seconds() + expire_seconds;
            inner.expires.insert(key.clone(), expire_at);
            inner.schedule.push(Reverse((expire_at, key)));
        } else {
            inner.expires.remove(&key);
        }
    }

    /// Get a channel's history, most-recent-first. An expired list is
    /// deleted and an empty vec returned.
    #[must_use]
    pub fn get(&self, project: &str, channel: &str) -> Vec<Message> {
        let key = (project.to_string(), channel.to_string());
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());

        if let Some(&expire_at) = inner.expires.get(&key) {
            if expire_at <= epoch_seconds() {
                inner.lists.remove(&key);
                inner.expires.remove(&key);
                debug!(channel = %channel, "History list expired on read");
                return Vec::new();
            }
        }

        inner
            .lists
            .get(&key)
            .map(|l| l.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Delete lists whose scheduled expiry has passed.
    ///
    /// Heap entries are re-validated against the authoritative expiry map
    /// so a list refreshed after being scheduled is not deleted early.
    /// Stops at the first entry still in the future.
    pub fn sweep(&self) {
        let now = epoch_seconds();
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());

        while let Some(Reverse((expire_at, key))) = inner.schedule.peek().cloned() {
            if expire_at > now {
                break;
            }
            inner.schedule.pop();

            match inner.expires.get(&key) {
                Some(&current) if current <= now => {
                    inner.lists.remove(&key);
                    inner.expires.remove(&key);
                    debug!(channel = %key.1, "History list swept");
                }
                // Refreshed after scheduling, or expiry was cleared.
                _ => {}
            }
        }
    }

    /// Spawn the periodic sweep task.
    pub fn start_sweeper(self: &Arc<Self>, interval: Duration) -> tokio::task::JoinHandle<()> {
        let store = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await; // first tick fires immediately
            loop {
                ticker.tick().await;
                store.sweep();
            }
        })
    }

    /// Whether a list physically exists for a channel, expired or not.
    /// Test and introspection helper.
    #[must_use]
    pub fn contains(&self, project: &str, channel: &str) -> bool {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner
            .lists
            .contains_key(&(project.to_string(), channel.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn msg(n: u64) -> Message {
        Message::new("p", "c", json!({ "n": n }), None)
    }

    #[test]
    fn test_size_cap_most_recent_first() {
        let store = HistoryStore::new();
        for n in 1..=5 {
            store.add_message("p", "c", &msg(n), 2, 0);
        }
        let history = store.get("p", "c");
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].data["n"], 5);
        assert_eq!(history[1].data["n"], 4);
    }

    #[test]
    fn test_unknown_channel_is_empty() {
        let store = HistoryStore::new();
        assert!(store.get("p", "nothing").is_empty());
    }

    #[test]
    fn test_expired_list_deleted_on_read() {
        let store = HistoryStore::new();
        store.add_message("p", "c", &msg(1), 10, 1);

        // Force the expiry into the past.
        {
            let mut inner = store.inner.lock().unwrap();
            let key = ("p".to_string(), "c".to_string());
            inner.expires.insert(key, epoch_seconds() - 1);
        }

        assert!(store.get("p", "c").is_empty());
        assert!(!store.contains("p", "c"));
    }

    #[test]
    fn test_expiry_cleared_by_later_write() {
        let store = HistoryStore::new();
        store.add_message("p", "c", &msg(1), 10, 1);
        // Second write with no expiry clears the previous expiry.
        store.add_message("p", "c", &msg(2), 10, 0);

        // Even past the original deadline, the sweep must not delete: the
        // heap entry is stale relative to the authoritative map.
        {
            let mut inner = store.inner.lock().unwrap();
            // Make the scheduled entry due.
            let due: Vec<_> = inner.schedule.drain().collect();
            for Reverse((_, key)) in due {
                inner.schedule.push(Reverse((epoch_seconds() - 1, key)));
            }
        }
        store.sweep();

        let history = store.get("p", "c");
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].data["n"], 2);
    }

    #[test]
    fn test_sweep_respects_refreshed_expiry() {
        let store = HistoryStore::new();
        store.add_message("p", "c", &msg(1), 10, 1);
        // Refresh with a longer expiry; the first heap entry is now stale.
        store.add_message("p", "c", &msg(2), 10, 3600);

        {
            let mut inner = store.inner.lock().unwrap();
            let key = ("p".to_string(), "c".to_string());
            // Simulate the first scheduled deadline passing.
            inner.schedule.push(Reverse((epoch_seconds() - 1, key)));
        }
        store.sweep();

        assert_eq!(store.get("p", "c").len(), 2);
    }

    #[test]
    fn test_sweep_deletes_due_lists() {
        let store = HistoryStore::new();
        store.add_message("p", "c", &msg(1), 10, 1);

        {
            let mut inner = store.inner.lock().unwrap();
            let key = ("p".to_string(), "c".to_string());
            inner.expires.insert(key.clone(), epoch_seconds() - 1);
            inner.schedule.push(Reverse((epoch_seconds() - 1, key)));
        }
        store.sweep();

        assert!(!store.contains("p", "c"));
    }
}
