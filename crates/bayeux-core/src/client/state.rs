//! Session state machine
//!
//! Every transition is a synchronous method on [`SessionState`] that runs
//! under the session lock and returns the [`Effects`] to perform once the
//! lock is released: listener notifications, lifecycle events, follow-up
//! sends and what the driver task should do next.

use std::cmp::Ordering;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use serde_json::{Map, Value};
use tracing::{debug, info, warn};

use crate::backoff::Backoff;
use crate::batch::Batcher;
use crate::config::ClientConfig;
use crate::dispatcher::Listener;
use crate::events::SessionEventKind;
use crate::message::{compare_versions, meta, Advice, Message, Reconnect};
use crate::subscription::SubscriptionTable;
use crate::transport::{AnyTransport, Transport, TransportContext, TransportError, TransportRegistry};

/// Lifecycle state of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Unconnected,
    Handshaking,
    Connecting,
    Connected,
    Disconnected,
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionStatus::Unconnected => write!(f, "unconnected"),
            SessionStatus::Handshaking => write!(f, "handshaking"),
            SessionStatus::Connecting => write!(f, "connecting"),
            SessionStatus::Connected => write!(f, "connected"),
            SessionStatus::Disconnected => write!(f, "disconnected"),
        }
    }
}

/// What the driver task does next
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Next {
    Handshake(Duration),
    Connect(Duration),
    Stop,
}

/// Work to do after the session lock is released
#[derive(Default)]
pub(crate) struct Effects {
    /// (channel to notify, message), in order
    pub deliveries: Vec<(String, Message)>,
    pub events: Vec<SessionEventKind>,
    pub sends: Vec<Vec<Message>>,
    /// Listeners to remove from the dispatcher
    pub detach: Vec<(String, Listener)>,
    pub next: Option<Next>,
}

impl Effects {
    /// Notify listeners of a meta reply, and `/meta/unsuccessful` on failure
    fn notify(&mut self, message: &Message) {
        self.deliveries
            .push((message.channel.clone(), message.clone()));
        if !message.is_successful() {
            self.deliveries
                .push((meta::UNSUCCESSFUL.to_string(), message.clone()));
        }
    }

    pub fn merge(&mut self, other: Effects) {
        self.deliveries.extend(other.deliveries);
        self.events.extend(other.events);
        self.sends.extend(other.sends);
        self.detach.extend(other.detach);
        if other.next.is_some() {
            self.next = other.next;
        }
    }
}

/// Collaborators a transition may need besides the state itself
pub(crate) struct Context<'a> {
    pub config: &'a ClientConfig,
    pub registry: &'a TransportRegistry,
    pub transport_context: &'a TransportContext,
}

/// Whether a message was synthesised locally rather than sent by the server
pub(crate) fn is_local_failure(message: &Message) -> bool {
    message
        .extra
        .get("failure")
        .and_then(Value::as_bool)
        .unwrap_or(false)
}

/// Mutable session state, guarded by the session lock
pub(crate) struct SessionState {
    pub status: SessionStatus,
    pub client_id: Option<String>,
    pub advice: Advice,
    pub backoff: Backoff,
    pub batcher: Batcher,
    pub subscriptions: SubscriptionTable,
    pub transport: Option<Arc<AnyTransport>>,
    pub handshake_props: Option<Map<String, Value>>,
    pub server_version: Option<String>,
    next_id: u64,
    handshakes: u64,
    connection_lost: bool,
}

impl SessionState {
    pub fn new(config: &ClientConfig) -> Self {
        let mut batcher = Batcher::new();
        // Nothing goes out before the first successful connect
        batcher.hold();
        Self {
            status: SessionStatus::Unconnected,
            client_id: None,
            advice: Advice {
                reconnect: Some(Reconnect::Retry),
                interval: Some(0),
                timeout: None,
            },
            backoff: Backoff::new(config.backoff_increment_ms, config.max_backoff_ms),
            batcher,
            subscriptions: SubscriptionTable::new(),
            transport: None,
            handshake_props: None,
            server_version: None,
            next_id: 0,
            handshakes: 0,
            connection_lost: false,
        }
    }

    pub fn next_message_id(&mut self) -> String {
        self.next_id += 1;
        self.next_id.to_string()
    }

    /// Stamp an outgoing message with an id and the session's client id
    pub fn prepare(&mut self, mut message: Message) -> Message {
        if message.id.is_none() {
            message.id = Some(self.next_message_id());
        }
        if message.client_id.is_none() {
            message.client_id = self.client_id.clone();
        }
        message
    }

    pub fn handshake_message(
        &mut self,
        config: &ClientConfig,
        supported: Option<Vec<String>>,
    ) -> Message {
        let mut message = Message::new(meta::HANDSHAKE);
        message.version = Some(config.version.clone());
        message.minimum_version = Some(config.minimum_version.clone());
        message.supported_connection_types = supported;
        message.id = Some(self.next_message_id());
        message.merge_props(self.handshake_props.as_ref())
    }

    pub fn connect_message(&mut self, transport: &str) -> Message {
        let mut message = Message::new(meta::CONNECT);
        message.client_id = self.client_id.clone();
        message.connection_type = Some(transport.to_string());
        message.id = Some(self.next_message_id());
        if self.status == SessionStatus::Connecting {
            // Ask the server to answer the first connect right away
            message.advice = Some(Advice {
                timeout: Some(0),
                ..Default::default()
            });
        }
        message
    }

    fn merge_advice(&mut self, message: &Message) {
        if is_local_failure(message) {
            return;
        }
        if let Some(advice) = &message.advice {
            if advice.reconnect.is_some() {
                self.advice.reconnect = advice.reconnect;
            }
            if advice.interval.is_some() {
                self.advice.interval = advice.interval;
            }
            if advice.timeout.is_some() {
                self.advice.timeout = advice.timeout;
            }
        }
    }

    fn reconnect_advice(&self, message: &Message) -> Option<Reconnect> {
        message
            .advice
            .as_ref()
            .and_then(|a| a.reconnect)
            .or(self.advice.reconnect)
    }

    fn next_delay(&self) -> Duration {
        self.backoff.next_delay(&self.advice)
    }

    /// Enter the terminal state
    pub fn terminate(&mut self, mut fx: Effects) -> Effects {
        self.status = SessionStatus::Disconnected;
        self.advice.reconnect = Some(Reconnect::None);
        self.subscriptions.cancel_all("disconnected");
        for (channel, listeners) in self.subscriptions.clear() {
            fx.detach
                .extend(listeners.into_iter().map(|l| (channel.clone(), l)));
        }
        self.batcher.clear();
        fx.events.push(SessionEventKind::Disconnect);
        fx.next = Some(Next::Stop);
        fx
    }

    /// Route one incoming message to its handler
    pub fn receive(&mut self, message: Message, ctx: &Context<'_>) -> Effects {
        match message.channel.as_str() {
            meta::HANDSHAKE => self.on_handshake(message, ctx),
            meta::CONNECT => self.on_connect(message),
            meta::SUBSCRIBE => self.on_subscribe(message),
            meta::UNSUBSCRIBE => self.on_unsubscribe(message),
            meta::DISCONNECT => {
                let mut fx = Effects::default();
                fx.notify(&message);
                fx
            }
            _ => self.on_message(message),
        }
    }

    fn on_handshake(&mut self, reply: Message, ctx: &Context<'_>) -> Effects {
        let mut fx = Effects::default();
        self.merge_advice(&reply);

        if !reply.is_successful() {
            fx.notify(&reply);
            fx.events.push(SessionEventKind::Handshake {
                successful: false,
                client_id: None,
                reestablish: false,
            });
            if self.reconnect_advice(&reply) == Some(Reconnect::None) {
                info!("Server advised not to reconnect, giving up");
                return self.terminate(fx);
            }
            self.status = SessionStatus::Handshaking;
            self.backoff.on_failure();
            fx.next = Some(Next::Handshake(self.next_delay()));
            return fx;
        }

        let version = reply
            .version
            .clone()
            .unwrap_or_else(|| ctx.config.version.clone());
        if compare_versions(&version, &ctx.config.minimum_version) == Ordering::Less {
            warn!(
                server_version = %version,
                minimum_version = %ctx.config.minimum_version,
                "Server protocol version is too old"
            );
            return self.fail_handshake(
                fx,
                reply,
                format!(
                    "server version {version} is older than {}",
                    ctx.config.minimum_version
                ),
            );
        }

        let current = self.transport.as_ref().map(|t| t.name().to_string());
        let candidates = reply
            .supported_connection_types
            .clone()
            .or_else(|| current.clone().map(|name| vec![name]))
            .unwrap_or_default();
        let chosen = match ctx
            .registry
            .negotiate(&candidates, &version, ctx.config.is_cross_domain())
        {
            Ok(name) => name,
            Err(e) => {
                warn!(error = %e, "Transport negotiation failed");
                return self.fail_handshake(fx, reply, e.to_string());
            }
        };
        if current.as_deref() != Some(chosen.as_str()) {
            match ctx.registry.create(&chosen, ctx.transport_context) {
                Some(transport) => self.transport = Some(Arc::new(transport)),
                None => return self.fail_handshake(fx, reply, format!("unknown transport {chosen}")),
            }
        }
        if let Some(transport) = &self.transport {
            transport.startup(&reply);
        }

        self.client_id = reply.client_id.clone();
        self.server_version = Some(version);
        self.status = SessionStatus::Connecting;
        self.backoff.on_success();

        let reestablish = self.handshakes > 0;
        self.handshakes += 1;
        if reestablish {
            let listed = self.subscriptions.resubscribe_all();
            // A subscribe made while rehandshaking is already queued
            let channels: Vec<String> = listed
                .into_iter()
                .filter(|channel| {
                    !self.batcher.queued().any(|m| {
                        m.channel == meta::SUBSCRIBE && m.subscription.as_deref() == Some(channel)
                    })
                })
                .collect();
            if !channels.is_empty() {
                debug!(count = channels.len(), "Re-subscribing after rehandshake");
                fx.sends.push(
                    channels
                        .iter()
                        .map(|c| Message::subscription_request(meta::SUBSCRIBE, c))
                        .collect(),
                );
            }
        }

        info!(
            client_id = reply.client_id.as_deref().unwrap_or("-"),
            transport = %chosen,
            reestablish,
            "Handshake successful"
        );
        let mut delivered = reply;
        delivered.set_reestablish(reestablish);
        fx.notify(&delivered);
        fx.events.push(SessionEventKind::Handshake {
            successful: true,
            client_id: self.client_id.clone(),
            reestablish,
        });
        fx.next = Some(Next::Connect(self.next_delay()));
        fx
    }

    /// A successful handshake reply that cannot be used is fatal
    fn fail_handshake(&mut self, mut fx: Effects, mut reply: Message, reason: String) -> Effects {
        reply.successful = Some(false);
        reply.error = Some(reason);
        reply.advice = Some(Advice::none());
        fx.notify(&reply);
        fx.events.push(SessionEventKind::Handshake {
            successful: false,
            client_id: None,
            reestablish: false,
        });
        self.terminate(fx)
    }

    fn on_connect(&mut self, reply: Message) -> Effects {
        let mut fx = Effects::default();
        self.merge_advice(&reply);
        fx.notify(&reply);

        if reply.is_successful() {
            self.backoff.on_success();
            if self.status != SessionStatus::Connected {
                self.status = SessionStatus::Connected;
                fx.events.push(SessionEventKind::Connect { successful: true });
                if let Some(batch) = self.batcher.release() {
                    fx.sends.push(batch);
                }
            }
            if self.connection_lost {
                self.connection_lost = false;
                fx.events.push(SessionEventKind::ConnectionRestored);
            }
            fx.next = Some(Next::Connect(self.next_delay()));
            return fx;
        }

        fx.events.push(SessionEventKind::Connect { successful: false });
        match self.reconnect_advice(&reply) {
            Some(Reconnect::None) => {
                info!("Server advised not to reconnect, disconnecting");
                return self.terminate(fx);
            }
            Some(Reconnect::Handshake) => {
                self.status = SessionStatus::Handshaking;
                self.batcher.hold();
                self.backoff.on_failure();
                fx.next = Some(Next::Handshake(self.next_delay()));
            }
            _ => {
                self.backoff.on_failure();
                fx.next = Some(Next::Connect(self.next_delay()));
            }
        }
        fx
    }

    fn on_subscribe(&mut self, reply: Message) -> Effects {
        let mut fx = Effects::default();
        if let Some(channel) = reply.subscription.clone() {
            if reply.is_successful() {
                self.subscriptions.complete_subscribe(&channel, Ok(()));
                fx.events.push(SessionEventKind::Subscribed { channel });
            } else {
                let reason = reply
                    .error
                    .clone()
                    .unwrap_or_else(|| "subscribe failed".to_string());
                warn!(channel = %channel, reason = %reason, "Subscription rejected");
                self.subscriptions.complete_subscribe(&channel, Err(reason));
            }
        }
        fx.notify(&reply);
        fx
    }

    fn on_unsubscribe(&mut self, reply: Message) -> Effects {
        let mut fx = Effects::default();
        if let Some(channel) = reply.subscription.clone() {
            let drained = self.subscriptions.complete_unsubscribe(&channel);
            fx.detach
                .extend(drained.into_iter().map(|l| (channel.clone(), l)));
            if reply.is_successful() {
                fx.events.push(SessionEventKind::Unsubscribed { channel });
            }
        }
        fx.notify(&reply);
        fx
    }

    fn on_message(&mut self, message: Message) -> Effects {
        let mut fx = Effects::default();
        if message.data.is_some() {
            fx.deliveries.push((message.channel.clone(), message));
        } else if message.successful.is_some() {
            // Publish acknowledgement
            if !message.is_successful() {
                fx.deliveries
                    .push((meta::UNSUCCESSFUL.to_string(), message.clone()));
            }
            fx.deliveries.push((meta::PUBLISH.to_string(), message));
        } else {
            debug!(channel = %message.channel, "Ignoring message without data");
        }
        fx
    }

    /// A request never got an answer; build the failure reply to process
    pub fn connection_failed(&mut self, request: &Message, error: &TransportError) -> (Effects, Message) {
        let mut fx = Effects::default();
        if !self.connection_lost {
            self.connection_lost = true;
            fx.events.push(SessionEventKind::ConnectionLost {
                reason: error.to_string(),
            });
        }

        let advice = if self.advice.reconnect == Some(Reconnect::None) {
            Advice::none()
        } else if request.channel == meta::CONNECT {
            Advice {
                reconnect: Some(Reconnect::Handshake),
                interval: Some(self.backoff.interval_ms()),
                timeout: None,
            }
        } else {
            Advice::retry(self.backoff.interval_ms())
        };
        warn!(channel = %request.channel, error = %error, "Request failed");
        (fx, Message::failure(request, &error.to_string(), advice))
    }

    /// Another client superseded this one; rehandshake after a pause
    pub fn on_conflict(&mut self, config: &ClientConfig) -> Effects {
        let mut fx = Effects::default();
        info!("Connection superseded, rehandshaking");
        self.status = SessionStatus::Handshaking;
        self.batcher.hold();
        if let Some(transport) = &self.transport {
            transport.disconnected();
        }
        fx.events.push(SessionEventKind::ConnectionConflict);
        fx.next = Some(Next::Handshake(Duration::from_millis(
            config.auto_reconnect_time_ms,
        )));
        fx
    }
}
