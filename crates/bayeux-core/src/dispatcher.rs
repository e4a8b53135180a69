//! In-process channel dispatch
//!
//! Listeners are stored in a trie keyed by channel segment. A node holds the
//! listeners for its exact channel, for `<node>/*` (direct children) and for
//! `<node>/**` (all descendants).
//!
//! Delivery order for a message on `/a/b/c`:
//! 1. listeners on `/a/b/c`
//! 2. `**` listeners of every ancestor, nearest first (`/a/b/**`, `/a/**`, `/**`)
//! 3. the `*` listeners of the immediate parent (`/a/b/*`)

use std::collections::HashMap;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use tracing::warn;

use crate::error::Result;
use crate::message::{validate_channel, Message};

/// A message listener
///
/// Identity is the allocation: clones of the same `Listener` are equal,
/// two listeners built from identical closures are not.
#[derive(Clone)]
pub struct Listener(Arc<dyn Fn(&Message) + Send + Sync>);

impl Listener {
    pub fn new<F>(f: F) -> Self
    where
        F: Fn(&Message) + Send + Sync + 'static,
    {
        Self(Arc::new(f))
    }

    /// Invoke the listener, containing any panic
    pub fn call(&self, message: &Message) -> bool {
        let f = &self.0;
        match catch_unwind(AssertUnwindSafe(|| f(message))) {
            Ok(()) => true,
            Err(_) => {
                warn!(channel = %message.channel, "Listener panicked during notification");
                false
            }
        }
    }
}

impl PartialEq for Listener {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl Eq for Listener {}

impl fmt::Debug for Listener {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Listener({:p})", Arc::as_ptr(&self.0) as *const ())
    }
}

/// How a channel pattern matches
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PatternKind {
    Exact,
    /// `/a/*`
    Children,
    /// `/a/**`
    Descendants,
}

fn parse_pattern(pattern: &str) -> Result<(Vec<&str>, PatternKind)> {
    validate_channel(pattern, true)?;
    let mut segments: Vec<&str> = pattern[1..].split('/').collect();
    let kind = match segments.last().copied() {
        Some("*") => PatternKind::Children,
        Some("**") => PatternKind::Descendants,
        _ => PatternKind::Exact,
    };
    if kind != PatternKind::Exact {
        segments.pop();
    }
    Ok((segments, kind))
}

#[derive(Default)]
struct Node {
    children: HashMap<String, Node>,
    exact: Vec<Listener>,
    wildcard: Vec<Listener>,
    recursive: Vec<Listener>,
}

impl Node {
    fn slot_mut(&mut self, kind: PatternKind) -> &mut Vec<Listener> {
        match kind {
            PatternKind::Exact => &mut self.exact,
            PatternKind::Children => &mut self.wildcard,
            PatternKind::Descendants => &mut self.recursive,
        }
    }

    fn is_empty(&self) -> bool {
        self.children.is_empty()
            && self.exact.is_empty()
            && self.wildcard.is_empty()
            && self.recursive.is_empty()
    }

    fn count(&self) -> usize {
        self.exact.len()
            + self.wildcard.len()
            + self.recursive.len()
            + self.children.values().map(Node::count).sum::<usize>()
    }

    /// Remove from the subtree at `segments`, pruning empty nodes
    fn remove(
        &mut self,
        segments: &[&str],
        kind: PatternKind,
        listener: Option<&Listener>,
    ) -> usize {
        let Some((head, tail)) = segments.split_first() else {
            let slot = self.slot_mut(kind);
            let before = slot.len();
            match listener {
                Some(l) => slot.retain(|x| x != l),
                None => slot.clear(),
            }
            return before - slot.len();
        };

        let Some(child) = self.children.get_mut(*head) else {
            return 0;
        };
        let removed = child.remove(tail, kind, listener);
        if child.is_empty() {
            self.children.remove(*head);
        }
        removed
    }
}

/// Per-client pub/sub dispatcher
#[derive(Default)]
pub struct ChannelDispatcher {
    root: Node,
}

impl fmt::Debug for ChannelDispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChannelDispatcher")
            .field("listeners", &self.len())
            .finish()
    }
}

impl ChannelDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a listener on a channel or wildcard pattern
    ///
    /// Returns `false` if this exact listener was already registered on the
    /// pattern.
    pub fn add(&mut self, pattern: &str, listener: Listener) -> Result<bool> {
        let (segments, kind) = parse_pattern(pattern)?;
        let mut node = &mut self.root;
        for segment in segments {
            node = node.children.entry(segment.to_string()).or_default();
        }
        let slot = node.slot_mut(kind);
        if slot.contains(&listener) {
            return Ok(false);
        }
        slot.push(listener);
        Ok(true)
    }

    /// Remove one listener from a pattern, returning whether it was present
    pub fn remove(&mut self, pattern: &str, listener: &Listener) -> bool {
        match parse_pattern(pattern) {
            Ok((segments, kind)) => self.root.remove(&segments, kind, Some(listener)) > 0,
            Err(_) => false,
        }
    }

    /// Remove every listener registered on a pattern
    pub fn remove_all(&mut self, pattern: &str) -> usize {
        match parse_pattern(pattern) {
            Ok((segments, kind)) => self.root.remove(&segments, kind, None),
            Err(_) => 0,
        }
    }

    /// Whether the listener is registered on the pattern
    pub fn contains(&self, pattern: &str, listener: &Listener) -> bool {
        let Ok((segments, kind)) = parse_pattern(pattern) else {
            return false;
        };
        let mut node = &self.root;
        for segment in segments {
            match node.children.get(segment) {
                Some(child) => node = child,
                None => return false,
            }
        }
        let slot = match kind {
            PatternKind::Exact => &node.exact,
            PatternKind::Children => &node.wildcard,
            PatternKind::Descendants => &node.recursive,
        };
        slot.contains(listener)
    }

    pub fn clear(&mut self) {
        self.root = Node::default();
    }

    /// Total number of registrations
    pub fn len(&self) -> usize {
        self.root.count()
    }

    pub fn is_empty(&self) -> bool {
        self.root.is_empty()
    }

    /// Listeners interested in `channel`, in delivery order
    pub fn listeners_for(&self, channel: &str) -> Vec<Listener> {
        let segments: Vec<&str> = channel
            .trim_start_matches('/')
            .split('/')
            .filter(|s| !s.is_empty())
            .collect();

        // Walk down, remembering every node on the path
        let mut path: Vec<&Node> = vec![&self.root];
        let mut node = &self.root;
        for segment in &segments {
            match node.children.get(*segment) {
                Some(child) => {
                    node = child;
                    path.push(child);
                }
                None => break,
            }
        }
        let reached_channel = path.len() == segments.len() + 1;

        let mut out = Vec::new();
        if reached_channel {
            if let Some(target) = path.last() {
                out.extend(target.exact.iter().cloned());
            }
        }

        // Ancestors are path[0..segments.len()], nearest first
        let ancestors = path.len().min(segments.len());
        for ancestor in path[..ancestors].iter().rev() {
            out.extend(ancestor.recursive.iter().cloned());
        }

        // Immediate parent's single-level wildcard
        if !segments.is_empty() && path.len() >= segments.len() {
            out.extend(path[segments.len() - 1].wildcard.iter().cloned());
        }

        out
    }

    /// Deliver a message to every interested listener, returning how many
    /// listeners ran
    pub fn deliver(&self, message: &Message) -> usize {
        self.deliver_on(&message.channel, message)
    }

    /// Deliver a message to the listeners of another channel
    pub fn deliver_on(&self, channel: &str, message: &Message) -> usize {
        let listeners = self.listeners_for(channel);
        for listener in &listeners {
            listener.call(message);
        }
        listeners.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Mutex;

    fn recorder(log: &Arc<Mutex<Vec<String>>>, tag: &str) -> Listener {
        let log = Arc::clone(log);
        let tag = tag.to_string();
        Listener::new(move |m| log.lock().unwrap().push(format!("{tag}:{}", m.channel)))
    }

    #[test]
    fn test_wildcard_dispatch() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut dispatcher = ChannelDispatcher::new();
        dispatcher.add("/a/**", recorder(&log, "deep")).unwrap();
        dispatcher.add("/a/*", recorder(&log, "one")).unwrap();
        dispatcher.add("/a/b", recorder(&log, "exact")).unwrap();

        dispatcher.deliver(&Message::publish("/a/b/c", json!(1)));
        assert_eq!(*log.lock().unwrap(), vec!["deep:/a/b/c"]);
        log.lock().unwrap().clear();

        dispatcher.deliver(&Message::publish("/a/b", json!(1)));
        assert_eq!(
            *log.lock().unwrap(),
            vec!["exact:/a/b", "deep:/a/b", "one:/a/b"]
        );
        log.lock().unwrap().clear();

        dispatcher.deliver(&Message::publish("/a/c", json!(1)));
        assert_eq!(*log.lock().unwrap(), vec!["deep:/a/c", "one:/a/c"]);
    }

    #[test]
    fn test_delivery_order_nearest_ancestor_first() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut dispatcher = ChannelDispatcher::new();
        dispatcher.add("/**", recorder(&log, "root")).unwrap();
        dispatcher.add("/a/**", recorder(&log, "a")).unwrap();
        dispatcher.add("/a/b/**", recorder(&log, "ab")).unwrap();
        dispatcher.add("/a/b/*", recorder(&log, "ab1")).unwrap();
        dispatcher.add("/a/b/c", recorder(&log, "exact")).unwrap();

        dispatcher.deliver(&Message::publish("/a/b/c", json!(1)));
        let tags: Vec<String> = log
            .lock()
            .unwrap()
            .iter()
            .map(|s| s.split(':').next().unwrap().to_string())
            .collect();
        assert_eq!(tags, vec!["exact", "ab", "a", "root", "ab1"]);
    }

    #[test]
    fn test_wildcards_match_unregistered_channels() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut dispatcher = ChannelDispatcher::new();
        dispatcher.add("/x/**", recorder(&log, "deep")).unwrap();

        dispatcher.deliver(&Message::publish("/x/never/seen/before", json!(1)));
        assert_eq!(log.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_duplicate_listener_is_noop() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut dispatcher = ChannelDispatcher::new();
        let listener = recorder(&log, "l");

        assert!(dispatcher.add("/a", listener.clone()).unwrap());
        assert!(!dispatcher.add("/a", listener.clone()).unwrap());
        assert_eq!(dispatcher.len(), 1);

        dispatcher.deliver(&Message::publish("/a", json!(1)));
        assert_eq!(log.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_remove_prunes_nodes() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut dispatcher = ChannelDispatcher::new();
        let listener = recorder(&log, "l");
        dispatcher.add("/a/b/c", listener.clone()).unwrap();

        assert!(dispatcher.contains("/a/b/c", &listener));
        assert!(dispatcher.remove("/a/b/c", &listener));
        assert!(!dispatcher.remove("/a/b/c", &listener));
        assert!(dispatcher.is_empty());
    }

    #[test]
    fn test_remove_all() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut dispatcher = ChannelDispatcher::new();
        dispatcher.add("/a/*", recorder(&log, "1")).unwrap();
        dispatcher.add("/a/*", recorder(&log, "2")).unwrap();
        dispatcher.add("/a", recorder(&log, "3")).unwrap();

        assert_eq!(dispatcher.remove_all("/a/*"), 2);
        assert_eq!(dispatcher.len(), 1);
    }

    #[test]
    fn test_invalid_pattern_rejected() {
        let mut dispatcher = ChannelDispatcher::new();
        assert!(dispatcher.add("/a/*/b", Listener::new(|_| {})).is_err());
        assert!(dispatcher.add("a", Listener::new(|_| {})).is_err());
    }

    #[test]
    fn test_panicking_listener_does_not_stop_delivery() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut dispatcher = ChannelDispatcher::new();
        dispatcher.add("/a", Listener::new(|_| panic!("boom"))).unwrap();
        dispatcher.add("/a", recorder(&log, "ok")).unwrap();

        assert_eq!(dispatcher.deliver(&Message::publish("/a", json!(1))), 2);
        assert_eq!(log.lock().unwrap().len(), 1);
    }
}
