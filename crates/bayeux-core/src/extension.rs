//! Message extensions
//!
//! Extensions are ordered hooks that see every incoming message (server to
//! client) and every outgoing message (client to server). A hook may return
//! the message unchanged, return a replacement, or return `None` to drop it.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use tracing::{debug, warn};

use crate::error::{BayeuxError, Result};
use crate::message::Message;

/// A message transform hook
pub type Hook = Arc<dyn Fn(Message) -> Option<Message> + Send + Sync>;

/// An extension with optional incoming and outgoing behavior
pub trait Extension: Send + Sync {
    fn incoming(&self, message: Message) -> Option<Message> {
        Some(message)
    }

    fn outgoing(&self, message: Message) -> Option<Message> {
        Some(message)
    }
}

struct Entry {
    name: Option<String>,
    extension: Option<Arc<dyn Extension>>,
    incoming: Option<Hook>,
    outgoing: Option<Hook>,
}

/// Ordered inbound/outbound transform pipeline
#[derive(Default)]
pub struct ExtensionPipeline {
    entries: Vec<Entry>,
    reverse_incoming: bool,
}

impl std::fmt::Debug for ExtensionPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExtensionPipeline")
            .field("len", &self.entries.len())
            .field("names", &self.names())
            .field("reverse_incoming", &self.reverse_incoming)
            .finish()
    }
}

impl ExtensionPipeline {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run incoming hooks in reverse registration order
    pub fn set_reverse_incoming(&mut self, reverse: bool) {
        self.reverse_incoming = reverse;
    }

    /// Append an anonymous incoming hook
    pub fn add_incoming<F>(&mut self, hook: F)
    where
        F: Fn(Message) -> Option<Message> + Send + Sync + 'static,
    {
        self.entries.push(Entry {
            name: None,
            extension: None,
            incoming: Some(Arc::new(hook)),
            outgoing: None,
        });
    }

    /// Append an anonymous outgoing hook
    pub fn add_outgoing<F>(&mut self, hook: F)
    where
        F: Fn(Message) -> Option<Message> + Send + Sync + 'static,
    {
        self.entries.push(Entry {
            name: None,
            extension: None,
            incoming: None,
            outgoing: Some(Arc::new(hook)),
        });
    }

    /// Register a named extension; names are unique
    pub fn register(&mut self, name: &str, extension: Arc<dyn Extension>) -> Result<()> {
        if self.entries.iter().any(|e| e.name.as_deref() == Some(name)) {
            return Err(BayeuxError::DuplicateExtension(name.to_string()));
        }

        let inbound = Arc::clone(&extension);
        let outbound = Arc::clone(&extension);
        self.entries.push(Entry {
            name: Some(name.to_string()),
            extension: Some(extension),
            incoming: Some(Arc::new(move |m| inbound.incoming(m))),
            outgoing: Some(Arc::new(move |m| outbound.outgoing(m))),
        });
        debug!(extension = name, "Registered extension");
        Ok(())
    }

    /// Remove a named extension, returning whether it was present
    pub fn unregister(&mut self, name: &str) -> bool {
        let before = self.entries.len();
        self.entries.retain(|e| e.name.as_deref() != Some(name));
        let removed = self.entries.len() != before;
        if removed {
            debug!(extension = name, "Unregistered extension");
        }
        removed
    }

    /// Names of registered extensions, in registration order
    pub fn names(&self) -> Vec<&str> {
        self.entries.iter().filter_map(|e| e.name.as_deref()).collect()
    }

    /// Look up a registered extension by name
    pub fn get(&self, name: &str) -> Option<Arc<dyn Extension>> {
        self.entries
            .iter()
            .find(|e| e.name.as_deref() == Some(name))
            .and_then(|e| e.extension.clone())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Fold a message received from the server through the incoming hooks
    pub fn run_incoming(&self, message: Message) -> Option<Message> {
        let hooks: Vec<&Hook> = self.entries.iter().filter_map(|e| e.incoming.as_ref()).collect();
        if self.reverse_incoming {
            fold(hooks.into_iter().rev(), message, "incoming")
        } else {
            fold(hooks.into_iter(), message, "incoming")
        }
    }

    /// Fold a message about to be sent through the outgoing hooks
    pub fn run_outgoing(&self, message: Message) -> Option<Message> {
        let hooks = self.entries.iter().filter_map(|e| e.outgoing.as_ref());
        fold(hooks, message, "outgoing")
    }
}

fn fold<'a>(
    hooks: impl Iterator<Item = &'a Hook>,
    message: Message,
    direction: &str,
) -> Option<Message> {
    let mut current = message;
    for hook in hooks {
        let backup = current.clone();
        match catch_unwind(AssertUnwindSafe(|| hook(current))) {
            Ok(Some(next)) => current = next,
            Ok(None) => {
                debug!(direction, channel = %backup.channel, "Extension dropped message");
                return None;
            }
            Err(_) => {
                // A panicking hook leaves the message as it was
                warn!(direction, channel = %backup.channel, "Extension panicked");
                current = backup;
            }
        }
    }
    Some(current)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct Tagger(&'static str);

    impl Extension for Tagger {
        fn incoming(&self, mut message: Message) -> Option<Message> {
            let mut tags = message.data.take().unwrap_or_else(|| json!([]));
            if let Some(list) = tags.as_array_mut() {
                list.push(json!(self.0));
            }
            message.data = Some(tags);
            Some(message)
        }

        fn outgoing(&self, mut message: Message) -> Option<Message> {
            message.ext = Some(json!({ "by": self.0 }));
            Some(message)
        }
    }

    #[test]
    fn test_runs_in_registration_order() {
        let mut pipeline = ExtensionPipeline::new();
        pipeline.register("a", Arc::new(Tagger("a"))).unwrap();
        pipeline.register("b", Arc::new(Tagger("b"))).unwrap();

        let out = pipeline.run_incoming(Message::new("/x")).unwrap();
        assert_eq!(out.data, Some(json!(["a", "b"])));

        pipeline.set_reverse_incoming(true);
        let out = pipeline.run_incoming(Message::new("/x")).unwrap();
        assert_eq!(out.data, Some(json!(["b", "a"])));
    }

    #[test]
    fn test_outgoing_replacement() {
        let mut pipeline = ExtensionPipeline::new();
        pipeline.register("a", Arc::new(Tagger("a"))).unwrap();
        pipeline.add_outgoing(|mut m| {
            m.channel = "/rewritten".to_string();
            Some(m)
        });

        let out = pipeline.run_outgoing(Message::new("/x")).unwrap();
        assert_eq!(out.channel, "/rewritten");
        assert_eq!(out.ext, Some(json!({"by": "a"})));
    }

    #[test]
    fn test_hook_can_drop_message() {
        let mut pipeline = ExtensionPipeline::new();
        pipeline.add_incoming(|m| if m.channel == "/secret" { None } else { Some(m) });

        assert!(pipeline.run_incoming(Message::new("/secret")).is_none());
        assert!(pipeline.run_incoming(Message::new("/public")).is_some());
    }

    #[test]
    fn test_panicking_hook_is_skipped() {
        let mut pipeline = ExtensionPipeline::new();
        pipeline.add_incoming(|_| panic!("boom"));
        pipeline.add_incoming(|mut m| {
            m.data = Some(json!("after"));
            Some(m)
        });

        let out = pipeline.run_incoming(Message::new("/x")).unwrap();
        assert_eq!(out.data, Some(json!("after")));
    }

    #[test]
    fn test_duplicate_names_rejected() {
        let mut pipeline = ExtensionPipeline::new();
        pipeline.register("ack", Arc::new(Tagger("a"))).unwrap();
        let err = pipeline.register("ack", Arc::new(Tagger("b"))).unwrap_err();
        assert!(matches!(err, BayeuxError::DuplicateExtension(_)));

        assert!(pipeline.unregister("ack"));
        assert!(!pipeline.unregister("ack"));
        assert!(pipeline.is_empty());
    }

    #[test]
    fn test_get_by_name() {
        let mut pipeline = ExtensionPipeline::new();
        pipeline.add_outgoing(Some);
        pipeline.register("tag", Arc::new(Tagger("t"))).unwrap();

        let found = pipeline.get("tag").unwrap();
        let out = found.outgoing(Message::new("/x")).unwrap();
        assert_eq!(out, pipeline.run_outgoing(Message::new("/x")).unwrap());
        assert!(pipeline.get("missing").is_none());
        assert_eq!(pipeline.names(), vec!["tag"]);
    }
}
