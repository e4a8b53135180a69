//! Transport negotiation
//!
//! Transports are registered in priority order. Negotiation walks the table
//! and picks the first entry whose predicate accepts one of the connection
//! types the server offered and which can run with the server's version and
//! the current cross-domain situation.

use std::sync::Arc;

use tracing::debug;

use super::long_poll::{LongPollTransport, LONG_POLLING};
use super::rest_poll::{RestPollTransport, REST_POLLING};
use super::{AnyTransport, TransportContext};
use crate::error::{BayeuxError, Result};

type Predicate = Box<dyn Fn(&str) -> bool + Send + Sync>;
type Acceptor = Box<dyn Fn(&str, bool) -> bool + Send + Sync>;
type Factory = Arc<dyn Fn(&TransportContext) -> AnyTransport + Send + Sync>;

struct Entry {
    name: String,
    predicate: Predicate,
    accept: Acceptor,
    factory: Factory,
}

/// Ordered table of transport factories
pub struct TransportRegistry {
    entries: Vec<Entry>,
}

impl std::fmt::Debug for TransportRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransportRegistry")
            .field("transports", &self.transport_types())
            .finish()
    }
}

impl Default for TransportRegistry {
    /// Long-polling first, then REST polling
    fn default() -> Self {
        let mut registry = Self::empty();
        registry.add_named(LONG_POLLING, LongPollTransport::accept, |ctx| {
            AnyTransport::LongPoll(LongPollTransport::new(ctx))
        });
        registry.add_named(REST_POLLING, RestPollTransport::accept, |ctx| {
            AnyTransport::RestPoll(RestPollTransport::new(ctx))
        });
        registry
    }
}

impl TransportRegistry {
    /// Registry with the built-in transports
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with no transports at all
    pub fn empty() -> Self {
        Self {
            entries: Vec::new(),
        }
    }

    /// Register a transport
    ///
    /// `predicate` decides which server connection type names the transport
    /// answers to. Inserts at `index` when given, otherwise appends. Returns
    /// `false` when the name is already registered.
    pub fn add<P, A, F>(
        &mut self,
        name: &str,
        predicate: P,
        accept: A,
        factory: F,
        index: Option<usize>,
    ) -> bool
    where
        P: Fn(&str) -> bool + Send + Sync + 'static,
        A: Fn(&str, bool) -> bool + Send + Sync + 'static,
        F: Fn(&TransportContext) -> AnyTransport + Send + Sync + 'static,
    {
        if self.entries.iter().any(|e| e.name == name) {
            return false;
        }
        let entry = Entry {
            name: name.to_string(),
            predicate: Box::new(predicate),
            accept: Box::new(accept),
            factory: Arc::new(factory),
        };
        match index {
            Some(i) if i <= self.entries.len() => self.entries.insert(i, entry),
            _ => self.entries.push(entry),
        }
        true
    }

    /// Register a transport that answers to exactly its own name
    pub fn add_named<A, F>(&mut self, name: &str, accept: A, factory: F) -> bool
    where
        A: Fn(&str, bool) -> bool + Send + Sync + 'static,
        F: Fn(&TransportContext) -> AnyTransport + Send + Sync + 'static,
    {
        let own = name.to_string();
        self.add(name, move |candidate| candidate == own, accept, factory, None)
    }

    /// Remove a transport by name
    pub fn remove(&mut self, name: &str) -> bool {
        let before = self.entries.len();
        self.entries.retain(|e| e.name != name);
        self.entries.len() != before
    }

    /// Names of every registered transport, in priority order
    pub fn transport_types(&self) -> Vec<String> {
        self.entries.iter().map(|e| e.name.clone()).collect()
    }

    /// Names of the transports usable with this version and domain situation
    pub fn find_transport_types(&self, version: &str, cross_domain: bool) -> Vec<String> {
        self.entries
            .iter()
            .filter(|e| (e.accept)(version, cross_domain))
            .map(|e| e.name.clone())
            .collect()
    }

    /// Pick the transport to use for the connection types the server offered
    pub fn negotiate(
        &self,
        candidates: &[String],
        version: &str,
        cross_domain: bool,
    ) -> Result<String> {
        let chosen = self.entries.iter().find(|e| {
            candidates.iter().any(|c| (e.predicate)(c)) && (e.accept)(version, cross_domain)
        });
        match chosen {
            Some(entry) => {
                debug!(transport = %entry.name, "Negotiated transport");
                Ok(entry.name.clone())
            }
            None => Err(BayeuxError::NoTransport {
                client: self.find_transport_types(version, cross_domain),
                server: candidates.to_vec(),
            }),
        }
    }

    /// Build a registered transport
    pub fn create(&self, name: &str, context: &TransportContext) -> Option<AnyTransport> {
        self.entries
            .iter()
            .find(|e| e.name == name)
            .map(|e| (e.factory)(context))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ClientConfig;
    use crate::testing::MockHttpClient;
    use crate::transport::Transport;

    fn names(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    fn context() -> TransportContext {
        TransportContext {
            config: Arc::new(ClientConfig::new("http://localhost/cometd")),
            http: Arc::new(MockHttpClient::new()),
        }
    }

    #[test]
    fn test_registration_order_is_priority() {
        let registry = TransportRegistry::new();
        let offered = names(&["rest-polling", "long-polling"]);
        assert_eq!(registry.negotiate(&offered, "1.0", false).unwrap(), "long-polling");

        let only_rest = names(&["rest-polling"]);
        assert_eq!(registry.negotiate(&only_rest, "1.0", false).unwrap(), "rest-polling");
    }

    #[test]
    fn test_cross_domain_excludes_rest() {
        let registry = TransportRegistry::new();
        let err = registry
            .negotiate(&names(&["rest-polling"]), "1.0", true)
            .unwrap_err();
        assert!(matches!(
            err,
            BayeuxError::NoTransport { ref client, .. } if client == &names(&["long-polling"])
        ));
        assert_eq!(registry.find_transport_types("1.0", true), names(&["long-polling"]));
        assert_eq!(registry.find_transport_types("1.0", false).len(), 2);
    }

    #[test]
    fn test_add_remove() {
        let mut registry = TransportRegistry::new();
        assert!(!registry.add_named("long-polling", |_, _| true, |ctx| {
            AnyTransport::LongPoll(LongPollTransport::new(ctx))
        }));

        assert!(registry.add(
            "callback-polling",
            |name| name.ends_with("polling"),
            |_, _| true,
            |ctx| AnyTransport::LongPoll(LongPollTransport::new(ctx)),
            Some(0),
        ));
        assert_eq!(registry.transport_types()[0], "callback-polling");
        assert_eq!(
            registry.negotiate(&names(&["rest-polling"]), "1.0", false).unwrap(),
            "callback-polling"
        );

        assert!(registry.remove("callback-polling"));
        assert!(!registry.remove("callback-polling"));
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn test_create() {
        let registry = TransportRegistry::new();
        let transport = registry.create("rest-polling", &context()).unwrap();
        assert_eq!(transport.name(), "rest-polling");
        assert!(registry.create("websocket", &context()).is_none());
    }
}
