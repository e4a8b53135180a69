//! Server-side subscription bookkeeping
//!
//! Tracks which listeners hold a subscription on each channel and the
//! acknowledgement future for the `/meta/subscribe` that created it. The
//! server is only contacted on the 0→1 and 1→0 listener transitions.

use std::collections::HashMap;

use crate::dispatcher::Listener;
use crate::pending::PendingFuture;

#[derive(Debug, Default)]
struct Entry {
    listeners: Vec<Listener>,
    ack: Option<PendingFuture<bool>>,
    /// Listeners that stay deliverable until the unsubscribe is acknowledged
    draining: Vec<Listener>,
}

impl Entry {
    fn is_empty(&self) -> bool {
        self.listeners.is_empty() && self.draining.is_empty()
    }
}

/// Result of registering a listener
#[derive(Debug, Clone)]
pub struct Added {
    /// This listener is the first one: a `/meta/subscribe` must be sent
    pub first: bool,
    /// The listener was already registered; nothing changed
    pub duplicate: bool,
    /// Acknowledgement shared by every listener of the channel
    pub ack: PendingFuture<bool>,
}

/// Result of removing listeners
#[derive(Debug, Clone, Default)]
pub struct Removed {
    /// Listeners removed and no longer needed by the dispatcher right away
    pub detached: Vec<Listener>,
    /// No listeners remain: a `/meta/unsubscribe` must be sent
    pub last: bool,
}

/// Per-channel subscription registry
#[derive(Debug, Default)]
pub struct SubscriptionTable {
    entries: HashMap<String, Entry>,
}

impl SubscriptionTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a listener for a channel
    pub fn add(&mut self, channel: &str, listener: Listener) -> Added {
        let entry = self.entries.entry(channel.to_string()).or_default();

        if entry.listeners.contains(&listener) {
            let ack = entry
                .ack
                .clone()
                .unwrap_or_else(|| PendingFuture::resolved(true));
            return Added {
                first: false,
                duplicate: true,
                ack,
            };
        }

        let first = entry.listeners.is_empty();
        entry.draining.retain(|l| l != &listener);
        entry.listeners.push(listener);

        let ack = match (&entry.ack, first) {
            (Some(ack), false) => ack.clone(),
            _ => {
                let ack = PendingFuture::new();
                entry.ack = Some(ack.clone());
                ack
            }
        };

        Added {
            first,
            duplicate: false,
            ack,
        }
    }

    /// Remove one listener, or all of them when `listener` is `None`
    ///
    /// When the last listener goes, it keeps receiving messages until
    /// [`complete_unsubscribe`](Self::complete_unsubscribe) is called, and the
    /// still-pending subscribe acknowledgement is cancelled.
    pub fn remove(&mut self, channel: &str, listener: Option<&Listener>) -> Removed {
        let Some(entry) = self.entries.get_mut(channel) else {
            return Removed::default();
        };
        if entry.listeners.is_empty() {
            return Removed::default();
        }

        let taken: Vec<Listener> = match listener {
            Some(l) => {
                let Some(pos) = entry.listeners.iter().position(|x| x == l) else {
                    return Removed::default();
                };
                vec![entry.listeners.remove(pos)]
            }
            None => std::mem::take(&mut entry.listeners),
        };

        if !entry.listeners.is_empty() {
            return Removed {
                detached: taken,
                last: false,
            };
        }

        if let Some(ack) = entry.ack.take() {
            ack.cancel("unsubscribed");
        }
        entry.draining.extend(taken);
        Removed {
            detached: Vec::new(),
            last: true,
        }
    }

    /// Finish an unsubscribe, returning the listeners to detach from the dispatcher
    pub fn complete_unsubscribe(&mut self, channel: &str) -> Vec<Listener> {
        let Some(entry) = self.entries.get_mut(channel) else {
            return Vec::new();
        };
        let draining = std::mem::take(&mut entry.draining);
        if entry.is_empty() {
            self.entries.remove(channel);
        }
        draining
    }

    /// Settle the subscribe acknowledgement of a channel
    pub fn complete_subscribe(&mut self, channel: &str, result: std::result::Result<(), String>) {
        let Some(ack) = self.entries.get(channel).and_then(|e| e.ack.clone()) else {
            return;
        };
        match result {
            Ok(()) => {
                ack.resolve(true);
            }
            Err(reason) => {
                ack.reject(reason);
            }
        }
    }

    /// Acknowledgement of a channel, if any
    pub fn ack(&self, channel: &str) -> Option<PendingFuture<bool>> {
        self.entries.get(channel).and_then(|e| e.ack.clone())
    }

    pub fn contains(&self, channel: &str, listener: &Listener) -> bool {
        self.entries
            .get(channel)
            .is_some_and(|e| e.listeners.contains(listener))
    }

    pub fn listener_count(&self, channel: &str) -> usize {
        self.entries.get(channel).map_or(0, |e| e.listeners.len())
    }

    /// Channels that currently hold at least one listener
    pub fn channels(&self) -> Vec<String> {
        let mut channels: Vec<String> = self
            .entries
            .iter()
            .filter(|(_, e)| !e.listeners.is_empty())
            .map(|(c, _)| c.clone())
            .collect();
        channels.sort();
        channels
    }

    /// Prepare every subscription to be re-sent after a rehandshake
    ///
    /// Settled acknowledgements are replaced by fresh ones; pending ones are
    /// kept so existing waiters see the new answer.
    pub fn resubscribe_all(&mut self) -> Vec<String> {
        for entry in self.entries.values_mut() {
            if entry.listeners.is_empty() {
                continue;
            }
            let fresh = entry.ack.as_ref().map_or(true, |ack| !ack.is_pending());
            if fresh {
                entry.ack = Some(PendingFuture::new());
            }
        }
        self.channels()
    }

    /// Cancel every outstanding acknowledgement
    pub fn cancel_all(&mut self, reason: &str) {
        for entry in self.entries.values_mut() {
            if let Some(ack) = &entry.ack {
                ack.cancel(reason);
            }
        }
    }

    /// Drop everything, returning each channel with the listeners it held
    pub fn clear(&mut self) -> Vec<(String, Vec<Listener>)> {
        self.entries
            .drain()
            .map(|(channel, entry)| {
                let mut listeners = entry.listeners;
                listeners.extend(entry.draining);
                (channel, listeners)
            })
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn listener() -> Listener {
        Listener::new(|_| {})
    }

    #[test]
    fn test_first_listener_triggers_subscribe() {
        let mut table = SubscriptionTable::new();
        let a = listener();
        let b = listener();

        let first = table.add("/chat/room1", a.clone());
        assert!(first.first);
        let second = table.add("/chat/room1", b);
        assert!(!second.first);
        assert!(first.ack.same_as(&second.ack));
        assert_eq!(table.listener_count("/chat/room1"), 2);
    }

    #[test]
    fn test_duplicate_listener_is_noop() {
        let mut table = SubscriptionTable::new();
        let a = listener();

        let first = table.add("/a", a.clone());
        let again = table.add("/a", a.clone());
        assert!(again.duplicate);
        assert!(!again.first);
        assert!(first.ack.same_as(&again.ack));
        assert_eq!(table.listener_count("/a"), 1);
    }

    #[test]
    fn test_last_listener_drains_until_ack() {
        let mut table = SubscriptionTable::new();
        let a = listener();
        let b = listener();
        let added = table.add("/a", a.clone());
        table.add("/a", b.clone());

        let removed = table.remove("/a", Some(&a));
        assert!(!removed.last);
        assert_eq!(removed.detached, vec![a]);

        let removed = table.remove("/a", Some(&b));
        assert!(removed.last);
        assert!(removed.detached.is_empty());
        // The unacknowledged subscribe is cancelled
        assert!(!added.ack.is_pending());

        assert_eq!(table.complete_unsubscribe("/a"), vec![b]);
        assert!(table.is_empty());
    }

    #[test]
    fn test_remove_all() {
        let mut table = SubscriptionTable::new();
        table.add("/a", listener());
        table.add("/a", listener());

        let removed = table.remove("/a", None);
        assert!(removed.last);
        assert_eq!(table.listener_count("/a"), 0);
        assert_eq!(table.complete_unsubscribe("/a").len(), 2);
    }

    #[test]
    fn test_remove_unknown_is_noop() {
        let mut table = SubscriptionTable::new();
        let removed = table.remove("/nope", None);
        assert!(!removed.last);

        table.add("/a", listener());
        let removed = table.remove("/a", Some(&listener()));
        assert!(!removed.last);
        assert_eq!(table.listener_count("/a"), 1);
    }

    #[tokio::test]
    async fn test_complete_subscribe() {
        let mut table = SubscriptionTable::new();
        let ok = table.add("/ok", listener());
        let denied = table.add("/denied", listener());

        table.complete_subscribe("/ok", Ok(()));
        table.complete_subscribe("/denied", Err("403::forbidden".to_string()));

        assert!(ok.ack.wait().await.unwrap());
        assert!(denied.ack.wait().await.is_err());
    }

    #[test]
    fn test_resubscribe_refreshes_settled_acks() {
        let mut table = SubscriptionTable::new();
        let added = table.add("/a", listener());
        table.add("/b", listener());
        table.complete_subscribe("/a", Ok(()));

        let channels = table.resubscribe_all();
        assert_eq!(channels, vec!["/a".to_string(), "/b".to_string()]);
        let refreshed = table.ack("/a").unwrap();
        assert!(!refreshed.same_as(&added.ack));
        assert!(refreshed.is_pending());
    }

    #[test]
    fn test_cancel_all_and_clear() {
        let mut table = SubscriptionTable::new();
        let added = table.add("/a", listener());
        table.cancel_all("cancel");
        assert!(!added.ack.is_pending());

        let cleared = table.clear();
        assert_eq!(cleared.len(), 1);
        assert!(table.is_empty());
    }
}
