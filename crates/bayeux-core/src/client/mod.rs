//! Bayeux session client
//!
//! [`SessionClient`] performs the handshake, negotiates a transport, keeps the
//! logical connection alive with a background driver task that polls
//! `/meta/connect`, and multiplexes publish/subscribe traffic over it.
//!
//! ```no_run
//! use bayeux_core::{ClientConfig, Listener, SessionClient};
//! use serde_json::json;
//!
//! # async fn run() -> bayeux_core::Result<()> {
//! let client = SessionClient::new(ClientConfig::new("http://localhost:8080/cometd"))?;
//! client.init(None).await?;
//!
//! let ack = client
//!     .subscribe("/chat/room1", Listener::new(|m| println!("{:?}", m.data)), None)
//!     .await?;
//! ack.wait().await?;
//!
//! client.publish("/chat/room1", json!({"text": "hello"}), None).await?;
//! client.disconnect().await;
//! # Ok(())
//! # }
//! ```

mod state;

pub use state::SessionStatus;

use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;

use futures::future::{BoxFuture, FutureExt};
use serde_json::{Map, Value};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::ClientConfig;
use crate::dispatcher::{ChannelDispatcher, Listener};
use crate::error::{BayeuxError, Result};
use crate::events::{EventSink, NoOpEventSink, SessionEvent, SessionEventKind};
use crate::extension::{Extension, ExtensionPipeline};
use crate::http::SharedHttpClient;
use crate::message::{is_meta_channel, meta, validate_channel, Advice, Message};
use crate::pending::PendingFuture;
use crate::transport::{Transport, TransportContext, TransportError, TransportRegistry};
use state::{Context, Effects, Next, SessionState};

/// Dispatcher plus the local listeners registered through `add_listener`
#[derive(Default)]
struct Listeners {
    dispatcher: ChannelDispatcher,
    local: Vec<(String, Listener)>,
}

struct Shared {
    config: Arc<ClientConfig>,
    http: SharedHttpClient,
    state: tokio::sync::Mutex<SessionState>,
    listeners: RwLock<Listeners>,
    extensions: RwLock<ExtensionPipeline>,
    registry: RwLock<TransportRegistry>,
    events: RwLock<Arc<dyn EventSink>>,
    driver: Mutex<Option<JoinHandle<()>>>,
}

/// A Bayeux client session
///
/// Cheap to clone; clones share the same session.
#[derive(Clone)]
pub struct SessionClient {
    shared: Arc<Shared>,
}

impl std::fmt::Debug for SessionClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionClient")
            .field("url", &self.shared.config.url)
            .finish()
    }
}

impl SessionClient {
    /// Create a session using the reqwest-backed HTTP client
    #[cfg(feature = "reqwest")]
    pub fn new(config: ClientConfig) -> Result<Self> {
        Self::with_http_client(config, Arc::new(crate::http::ReqwestHttpClient::new()))
    }

    /// Create a session on top of any [`HttpClient`](crate::http::HttpClient)
    ///
    /// Fails immediately when the configuration is invalid.
    pub fn with_http_client(config: ClientConfig, http: SharedHttpClient) -> Result<Self> {
        config.validate()?;

        let mut extensions = ExtensionPipeline::new();
        extensions.set_reverse_incoming(config.reverse_incoming_extensions);

        Ok(Self {
            shared: Arc::new(Shared {
                state: tokio::sync::Mutex::new(SessionState::new(&config)),
                config: Arc::new(config),
                http,
                listeners: RwLock::new(Listeners::default()),
                extensions: RwLock::new(extensions),
                registry: RwLock::new(TransportRegistry::new()),
                events: RwLock::new(Arc::new(NoOpEventSink)),
                driver: Mutex::new(None),
            }),
        })
    }

    /// Replace the sink receiving lifecycle events
    pub fn set_event_sink(&self, sink: Arc<dyn EventSink>) {
        *self
            .shared
            .events
            .write()
            .unwrap_or_else(PoisonError::into_inner) = sink;
    }

    /// Adjust the transport table before [`init`](Self::init)
    pub fn configure_transports(&self, f: impl FnOnce(&mut TransportRegistry)) {
        let mut registry = self
            .shared
            .registry
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        f(&mut registry);
    }

    /// Start the session: handshake, then keep connecting in the background
    ///
    /// `handshake_props` are merged into the handshake message (typically an
    /// `ext` object carrying credentials).
    pub async fn init(&self, handshake_props: Option<Map<String, Value>>) -> Result<()> {
        {
            let mut state = self.shared.state.lock().await;
            match state.status {
                SessionStatus::Unconnected => {}
                SessionStatus::Disconnected => return Err(BayeuxError::Disconnected),
                other => {
                    debug!(status = %other, "Session already initialised");
                    return Ok(());
                }
            }
            state.status = SessionStatus::Handshaking;
            state.handshake_props = handshake_props;
        }

        info!(url = %self.shared.config.url, "Starting Bayeux session");
        let shared = Arc::clone(&self.shared);
        let handle = tokio::spawn(async move { shared.drive(Next::Handshake(Duration::ZERO)).await });
        *self
            .shared
            .driver
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(handle);
        Ok(())
    }

    /// Publish `data` on a channel
    pub async fn publish(
        &self,
        channel: &str,
        data: Value,
        props: Option<Map<String, Value>>,
    ) -> Result<()> {
        validate_channel(channel, false)?;
        if is_meta_channel(channel) {
            return Err(BayeuxError::InvalidChannel(channel.to_string()));
        }
        self.ensure_live().await?;

        let message = Message::publish(channel, data).merge_props(props.as_ref());
        self.shared.queue(message).await;
        Ok(())
    }

    /// Subscribe a listener to a channel
    ///
    /// Only the first listener of a channel causes a `/meta/subscribe`; every
    /// listener of the channel shares the returned acknowledgement.
    pub async fn subscribe(
        &self,
        channel: &str,
        listener: Listener,
        props: Option<Map<String, Value>>,
    ) -> Result<PendingFuture<bool>> {
        validate_channel(channel, true)?;
        if is_meta_channel(channel) {
            return Err(BayeuxError::InvalidChannel(channel.to_string()));
        }

        let added = {
            let mut state = self.shared.state.lock().await;
            if state.status == SessionStatus::Disconnected {
                return Err(BayeuxError::Disconnected);
            }
            state.subscriptions.add(channel, listener.clone())
        };
        if added.duplicate {
            return Ok(added.ack);
        }

        self.shared.with_listeners(|l| l.dispatcher.add(channel, listener))?;

        if added.first {
            let message =
                Message::subscription_request(meta::SUBSCRIBE, channel).merge_props(props.as_ref());
            self.shared.queue(message).await;
        }
        Ok(added.ack)
    }

    /// Remove one listener (or every listener when `None`) from a channel
    ///
    /// `/meta/unsubscribe` is sent once no listener remains. The removed
    /// listeners keep receiving messages until the server acknowledges.
    pub async fn unsubscribe(&self, channel: &str, listener: Option<&Listener>) -> Result<()> {
        validate_channel(channel, true)?;

        let removed = {
            let mut state = self.shared.state.lock().await;
            if state.status == SessionStatus::Disconnected {
                return Err(BayeuxError::Disconnected);
            }
            state.subscriptions.remove(channel, listener)
        };

        self.shared.with_listeners(|l| {
            for detached in &removed.detached {
                l.dispatcher.remove(channel, detached);
            }
        });

        if removed.last {
            self.shared
                .queue(Message::subscription_request(meta::UNSUBSCRIBE, channel))
                .await;
        }
        Ok(())
    }

    /// Listen locally without contacting the server
    ///
    /// Meta channels and wildcards are allowed. Returns `false` when the
    /// listener was already registered on the channel.
    pub fn add_listener(&self, channel: &str, listener: Listener) -> Result<bool> {
        self.shared.with_listeners(|l| {
            let added = l.dispatcher.add(channel, listener.clone())?;
            if added {
                l.local.push((channel.to_string(), listener));
            }
            Ok(added)
        })
    }

    pub fn remove_listener(&self, channel: &str, listener: &Listener) -> bool {
        self.shared.with_listeners(|l| {
            let before = l.local.len();
            l.local.retain(|(c, x)| !(c == channel && x == listener));
            if l.local.len() == before {
                return false;
            }
            l.dispatcher.remove(channel, listener)
        })
    }

    /// Remove every listener added through [`add_listener`](Self::add_listener)
    pub fn clear_listeners(&self) {
        self.shared.with_listeners(|l| {
            for (channel, listener) in std::mem::take(&mut l.local) {
                l.dispatcher.remove(&channel, &listener);
            }
        });
    }

    pub fn register_extension(&self, name: &str, extension: Arc<dyn Extension>) -> Result<()> {
        self.shared.with_extensions(|e| e.register(name, extension))
    }

    pub fn unregister_extension(&self, name: &str) -> bool {
        self.shared.with_extensions(|e| e.unregister(name))
    }

    /// Look up a registered extension by name
    pub fn extension(&self, name: &str) -> Option<Arc<dyn Extension>> {
        self.shared.with_extensions(|e| e.get(name))
    }

    /// Names of registered extensions, in registration order
    pub fn extension_names(&self) -> Vec<String> {
        self.shared
            .with_extensions(|e| e.names().into_iter().map(str::to_string).collect())
    }

    pub fn add_incoming_extension<F>(&self, hook: F)
    where
        F: Fn(Message) -> Option<Message> + Send + Sync + 'static,
    {
        self.shared.with_extensions(|e| e.add_incoming(hook));
    }

    pub fn add_outgoing_extension<F>(&self, hook: F)
    where
        F: Fn(Message) -> Option<Message> + Send + Sync + 'static,
    {
        self.shared.with_extensions(|e| e.add_outgoing(hook));
    }

    /// Unsubscribe every channel subscribed through [`subscribe`](Self::subscribe)
    ///
    /// Local listeners are kept.
    pub async fn clear_subscriptions(&self) -> Result<()> {
        let channels = self.shared.state.lock().await.subscriptions.channels();
        for channel in channels {
            self.unsubscribe(&channel, None).await?;
        }
        Ok(())
    }

    /// Open a batch scope; messages queue until the matching `end_batch`
    pub async fn start_batch(&self) {
        self.shared.state.lock().await.batcher.begin();
    }

    /// Close a batch scope, sending the queued messages as one request when
    /// the outermost scope closes
    pub async fn end_batch(&self) -> Result<()> {
        let ready = self.shared.state.lock().await.batcher.end()?;
        if let Some(batch) = ready {
            self.shared.transmit(batch).await;
        }
        Ok(())
    }

    /// Run `f` inside a batch scope
    pub async fn batch<F, Fut, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        self.start_batch().await;
        let out = f().await;
        self.end_batch().await?;
        Ok(out)
    }

    /// End the session
    ///
    /// Cancels pending acknowledgements, drops subscriptions and queued
    /// messages, tells the server (best effort) and stops the transport.
    /// Calling it again is a no-op.
    pub async fn disconnect(&self) {
        let (transport, request, cleared) = {
            let mut state = self.shared.state.lock().await;
            if state.status == SessionStatus::Disconnected {
                return;
            }
            state.status = SessionStatus::Disconnected;
            state.subscriptions.cancel_all("cancel");
            let cleared = state.subscriptions.clear();
            state.batcher.clear();

            let request = state.client_id.clone().map(|_| {
                let message = Message::new(meta::DISCONNECT);
                state.prepare(message)
            });
            state.client_id = None;
            (state.transport.take(), request, cleared)
        };

        if let Some(handle) = self
            .shared
            .driver
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            handle.abort();
        }

        self.shared.with_listeners(|l| {
            for (channel, listeners) in &cleared {
                for listener in listeners {
                    l.dispatcher.remove(channel, listener);
                }
            }
        });

        if let Some(transport) = transport {
            transport.cancel_connect();
            let outgoing = request.and_then(|m| self.shared.run_outgoing(m));
            if let Some(message) = outgoing {
                match transport
                    .send_messages(vec![message], self.shared.config.request_timeout())
                    .await
                {
                    Ok(replies) => {
                        self.shared.handle_replies(replies).await;
                    }
                    Err(e) => debug!(error = %e, "Disconnect request failed"),
                }
            }
            transport.disconnect().await;
        }

        info!("Bayeux session disconnected");
        self.shared.emit(SessionEventKind::Disconnect).await;
    }

    pub async fn state(&self) -> SessionStatus {
        self.shared.state.lock().await.status
    }

    pub async fn client_id(&self) -> Option<String> {
        self.shared.state.lock().await.client_id.clone()
    }

    /// Current backoff interval in milliseconds
    pub async fn backoff_period(&self) -> u64 {
        self.shared.state.lock().await.backoff.interval_ms()
    }

    /// Change how much the backoff interval grows after each failure
    pub async fn set_backoff_increment(&self, increment_ms: u64) {
        self.shared
            .state
            .lock()
            .await
            .backoff
            .set_increment_ms(increment_ms);
    }

    pub async fn backoff_increment(&self) -> u64 {
        self.shared.state.lock().await.backoff.increment_ms()
    }

    pub async fn advice(&self) -> Advice {
        self.shared.state.lock().await.advice.clone()
    }

    /// Name of the negotiated transport
    pub async fn transport_name(&self) -> Option<String> {
        self.shared
            .state
            .lock()
            .await
            .transport
            .as_ref()
            .map(|t| t.name().to_string())
    }

    async fn ensure_live(&self) -> Result<()> {
        if self.shared.state.lock().await.status == SessionStatus::Disconnected {
            return Err(BayeuxError::Disconnected);
        }
        Ok(())
    }
}

impl Shared {
    fn with_listeners<T>(&self, f: impl FnOnce(&mut Listeners) -> T) -> T {
        let mut listeners = self
            .listeners
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        f(&mut listeners)
    }

    fn with_extensions<T>(&self, f: impl FnOnce(&mut ExtensionPipeline) -> T) -> T {
        let mut extensions = self
            .extensions
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        f(&mut extensions)
    }

    fn run_outgoing(&self, message: Message) -> Option<Message> {
        self.extensions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .run_outgoing(message)
    }

    fn run_incoming(&self, message: Message) -> Option<Message> {
        self.extensions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .run_incoming(message)
    }

    fn transport_context(&self) -> TransportContext {
        TransportContext {
            config: Arc::clone(&self.config),
            http: Arc::clone(&self.http),
        }
    }

    async fn emit(&self, kind: SessionEventKind) {
        let sink = Arc::clone(&*self.events.read().unwrap_or_else(PoisonError::into_inner));
        if let Err(e) = sink.emit(&SessionEvent::new(kind)).await {
            warn!(error = %e, "Failed to emit session event");
        }
    }

    /// Driver task: alternate handshakes and connects until told to stop
    async fn drive(self: Arc<Self>, mut next: Next) {
        loop {
            next = match next {
                Next::Handshake(delay) => {
                    tokio::time::sleep(delay).await;
                    self.handshake().await
                }
                Next::Connect(delay) => {
                    tokio::time::sleep(delay).await;
                    self.connect().await
                }
                Next::Stop => break,
            };
        }
        debug!("Session driver stopped");
    }

    async fn handshake(&self) -> Next {
        let cross_domain = self.config.is_cross_domain();
        let supported = self
            .registry
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .find_transport_types(&self.config.version, cross_domain);

        let prepared = {
            let mut state = self.state.lock().await;
            if state.status == SessionStatus::Disconnected {
                return Next::Stop;
            }
            state.status = SessionStatus::Handshaking;
            state.client_id = None;
            state.batcher.hold();

            if state.transport.is_none() {
                let registry = self.registry.read().unwrap_or_else(PoisonError::into_inner);
                state.transport = supported
                    .first()
                    .and_then(|name| registry.create(name, &self.transport_context()))
                    .map(Arc::new);
            }
            let advertised = (!cross_domain).then(|| supported.clone());
            let message = state.handshake_message(&self.config, advertised);
            match state.transport.clone() {
                Some(transport) => Ok((transport, message)),
                None => Err(message),
            }
        };

        let (transport, message) = match prepared {
            Ok(prepared) => prepared,
            Err(message) => {
                let error = BayeuxError::NoTransport {
                    client: supported,
                    server: Vec::new(),
                };
                warn!(error = %error, "No transport available for handshake");
                let failed = Message::failure(&message, &error.to_string(), Advice::none());
                return self.handle_replies(vec![failed]).await.unwrap_or(Next::Stop);
            }
        };

        let Some(outgoing) = self.run_outgoing(message.clone()) else {
            debug!("Handshake dropped by an extension");
            return self.fail(&message, TransportError::Cancelled).await;
        };

        debug!("Sending handshake");
        match transport
            .send_messages(vec![outgoing], self.config.request_timeout())
            .await
        {
            Ok(replies) => match self.handle_replies(replies).await {
                Some(next) => next,
                None => {
                    self.fail(
                        &message,
                        TransportError::InvalidResponse("no handshake reply".to_string()),
                    )
                    .await
                }
            },
            Err(e) => self.fail(&message, e).await,
        }
    }

    async fn connect(&self) -> Next {
        let (transport, message, timeout) = {
            let mut state = self.state.lock().await;
            match state.status {
                SessionStatus::Disconnected => return Next::Stop,
                SessionStatus::Handshaking => {
                    return Next::Handshake(Duration::from_millis(self.config.auto_reconnect_time_ms))
                }
                _ => {}
            }
            let Some(transport) = state.transport.clone() else {
                return Next::Handshake(Duration::ZERO);
            };
            let message = state.connect_message(transport.name());
            let timeout = self.config.poll_timeout(&state.advice);
            (transport, message, timeout)
        };

        let Some(outgoing) = self.run_outgoing(message.clone()) else {
            debug!("Connect dropped by an extension");
            return self.fail(&message, TransportError::Cancelled).await;
        };

        match transport.connect(outgoing, timeout).await {
            Ok(replies) => match self.handle_replies(replies).await {
                Some(next) => next,
                None => {
                    self.fail(
                        &message,
                        TransportError::InvalidResponse("no connect reply".to_string()),
                    )
                    .await
                }
            },
            Err(TransportError::Conflict) => {
                let fx = self.state.lock().await.on_conflict(&self.config);
                self.apply(fx).await.unwrap_or(Next::Stop)
            }
            Err(TransportError::Cancelled) => {
                let status = self.state.lock().await.status;
                match status {
                    SessionStatus::Disconnected => Next::Stop,
                    SessionStatus::Handshaking => {
                        Next::Handshake(Duration::from_millis(self.config.auto_reconnect_time_ms))
                    }
                    _ => self.fail(&message, TransportError::Cancelled).await,
                }
            }
            Err(e) => self.fail(&message, e).await,
        }
    }

    /// Treat a request without an answer as a failed reply
    async fn fail(&self, request: &Message, error: TransportError) -> Next {
        let (fx, failure) = self.state.lock().await.connection_failed(request, &error);
        self.apply(fx).await;
        self.handle_replies(vec![failure]).await.unwrap_or(Next::Stop)
    }

    /// Offer a message to the batcher and send whatever is ready
    async fn queue(&self, message: Message) {
        let ready = self.state.lock().await.batcher.push(message);
        if let Some(batch) = ready {
            self.transmit(batch).await;
        }
    }

    /// Send a batch of non-connect messages and process the replies
    fn transmit(&self, messages: Vec<Message>) -> BoxFuture<'_, ()> {
        async move {
            let (transport, prepared) = {
                let mut state = self.state.lock().await;
                if state.status == SessionStatus::Disconnected {
                    debug!(count = messages.len(), "Dropping messages after disconnect");
                    return;
                }
                let prepared: Vec<Message> = messages.into_iter().map(|m| state.prepare(m)).collect();
                (state.transport.clone(), prepared)
            };

            let outgoing: Vec<Message> = prepared
                .iter()
                .cloned()
                .filter_map(|m| self.run_outgoing(m))
                .collect();
            if outgoing.is_empty() {
                return;
            }

            let result = match &transport {
                Some(transport) => {
                    transport
                        .send_messages(outgoing, self.config.request_timeout())
                        .await
                }
                None => Err(TransportError::Http("no transport".to_string())),
            };

            match result {
                Ok(replies) => {
                    self.handle_replies(replies).await;
                }
                Err(TransportError::Conflict) => {
                    let fx = self.state.lock().await.on_conflict(&self.config);
                    if let Some(transport) = &transport {
                        // Wakes the driver, which then rehandshakes
                        transport.cancel_connect();
                    }
                    self.apply(Effects { next: None, ..fx }).await;
                }
                Err(e) => {
                    warn!(error = %e, count = prepared.len(), "Failed to send messages");
                    let failures = prepared
                        .iter()
                        .map(|m| Message::failure(m, &e.to_string(), Advice::none()))
                        .collect();
                    self.handle_replies(failures).await;
                }
            }
        }
        .boxed()
    }

    /// Process replies in order, returning the driver's next step if a
    /// handshake or connect reply was among them
    async fn handle_replies(&self, replies: Vec<Message>) -> Option<Next> {
        let incoming: Vec<Message> = replies
            .into_iter()
            .filter_map(|m| self.run_incoming(m))
            .collect();
        if incoming.is_empty() {
            return None;
        }

        let mut state = self.state.lock().await;
        let fx = {
            let registry = self.registry.read().unwrap_or_else(PoisonError::into_inner);
            let transport_context = self.transport_context();
            let ctx = Context {
                config: &self.config,
                registry: &registry,
                transport_context: &transport_context,
            };
            let mut fx = Effects::default();
            for message in incoming {
                fx.merge(state.receive(message, &ctx));
            }
            fx
        };
        drop(state);
        self.apply(fx).await
    }

    /// Perform effects computed under the lock
    async fn apply(&self, fx: Effects) -> Option<Next> {
        if !fx.detach.is_empty() {
            self.with_listeners(|l| {
                for (channel, listener) in &fx.detach {
                    l.dispatcher.remove(channel, listener);
                }
            });
        }

        for (channel, message) in &fx.deliveries {
            let targets = self
                .listeners
                .read()
                .unwrap_or_else(PoisonError::into_inner)
                .dispatcher
                .listeners_for(channel);
            for listener in targets {
                listener.call(message);
            }
        }

        for event in fx.events {
            self.emit(event).await;
        }

        for batch in fx.sends {
            self.transmit(batch).await;
        }

        fx.next
    }
}
