//! Transports carrying Bayeux messages to the server
//!
//! A transport owns the request/response cycle for the session: the
//! recurring connect (poll) request and the one-shot requests for publish,
//! subscribe and the other meta exchanges.
//!
//! - [`LongPollTransport`] - POSTs Bayeux JSON arrays, one request held open per poll
//! - [`RestPollTransport`] - maps subscriptions onto plain HTTP resources with caching headers
//! - [`TransportRegistry`] - ordered table used to negotiate a transport with the server

pub mod long_poll;
pub mod registry;
pub mod rest_poll;

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Notify;

use crate::config::ClientConfig;
use crate::http::SharedHttpClient;
use crate::message::Message;

pub use long_poll::LongPollTransport;
pub use registry::TransportRegistry;
pub use rest_poll::RestPollTransport;

/// Errors that can occur inside a transport
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    #[error("HTTP error: {0}")]
    Http(String),

    #[error("Request timed out after {0} ms")]
    Timeout(u64),

    /// Another client superseded this one (HTTP 409)
    #[error("Subscription conflict")]
    Conflict,

    #[error("A poll request is already in flight")]
    ConcurrentPoll,

    #[error("Request cancelled")]
    Cancelled,

    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    #[error("Invalid URL: {0}")]
    InvalidUrl(String),
}

impl From<TransportError> for String {
    fn from(err: TransportError) -> String {
        err.to_string()
    }
}

/// Everything a transport factory needs to build a transport
#[derive(Clone)]
pub struct TransportContext {
    pub config: Arc<ClientConfig>,
    pub http: SharedHttpClient,
}

/// The request/response strategy used by a session
#[async_trait]
pub trait Transport: Send + Sync {
    /// Connection type name negotiated with the server
    fn name(&self) -> &'static str;

    /// Called with the successful handshake reply
    fn startup(&self, _handshake: &Message) {}

    /// Send a batch of messages and return the replies
    async fn send_messages(
        &self,
        messages: Vec<Message>,
        timeout: Duration,
    ) -> Result<Vec<Message>, TransportError>;

    /// Issue the poll request; only one may be in flight
    async fn connect(
        &self,
        message: Message,
        timeout: Duration,
    ) -> Result<Vec<Message>, TransportError>;

    /// Abort the in-flight poll, if any
    fn cancel_connect(&self);

    /// The connection was lost; drop per-connection state
    fn disconnected(&self) {}

    /// Stop the transport for good
    async fn disconnect(&self) {
        self.cancel_connect();
    }
}

/// Transport selected by the registry
///
/// An enum rather than a trait object so the two built-in transports can be
/// matched on directly; `Custom` admits anything else.
#[derive(Clone)]
pub enum AnyTransport {
    LongPoll(LongPollTransport),
    RestPoll(RestPollTransport),
    Custom(Arc<dyn Transport>),
}

impl std::fmt::Debug for AnyTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "AnyTransport({})", self.name())
    }
}

#[async_trait]
impl Transport for AnyTransport {
    fn name(&self) -> &'static str {
        match self {
            AnyTransport::LongPoll(t) => t.name(),
            AnyTransport::RestPoll(t) => t.name(),
            AnyTransport::Custom(t) => t.name(),
        }
    }

    fn startup(&self, handshake: &Message) {
        match self {
            AnyTransport::LongPoll(t) => t.startup(handshake),
            AnyTransport::RestPoll(t) => t.startup(handshake),
            AnyTransport::Custom(t) => t.startup(handshake),
        }
    }

    async fn send_messages(
        &self,
        messages: Vec<Message>,
        timeout: Duration,
    ) -> Result<Vec<Message>, TransportError> {
        match self {
            AnyTransport::LongPoll(t) => t.send_messages(messages, timeout).await,
            AnyTransport::RestPoll(t) => t.send_messages(messages, timeout).await,
            AnyTransport::Custom(t) => t.send_messages(messages, timeout).await,
        }
    }

    async fn connect(
        &self,
        message: Message,
        timeout: Duration,
    ) -> Result<Vec<Message>, TransportError> {
        match self {
            AnyTransport::LongPoll(t) => t.connect(message, timeout).await,
            AnyTransport::RestPoll(t) => t.connect(message, timeout).await,
            AnyTransport::Custom(t) => t.connect(message, timeout).await,
        }
    }

    fn cancel_connect(&self) {
        match self {
            AnyTransport::LongPoll(t) => t.cancel_connect(),
            AnyTransport::RestPoll(t) => t.cancel_connect(),
            AnyTransport::Custom(t) => t.cancel_connect(),
        }
    }

    fn disconnected(&self) {
        match self {
            AnyTransport::LongPoll(t) => t.disconnected(),
            AnyTransport::RestPoll(t) => t.disconnected(),
            AnyTransport::Custom(t) => t.disconnected(),
        }
    }

    async fn disconnect(&self) {
        match self {
            AnyTransport::LongPoll(t) => t.disconnect().await,
            AnyTransport::RestPoll(t) => t.disconnect().await,
            AnyTransport::Custom(t) => t.disconnect().await,
        }
    }
}

/// Single-slot guard for the poll request plus its cancellation signal
#[derive(Debug, Default)]
pub(crate) struct PollSlot {
    busy: AtomicBool,
    cancel: Notify,
}

struct PollPermit<'a>(&'a AtomicBool);

impl Drop for PollPermit<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl PollSlot {
    /// Run the poll future unless another one is in flight
    pub(crate) async fn run<T, F>(&self, timeout: Duration, request: F) -> Result<T, TransportError>
    where
        F: Future<Output = Result<T, TransportError>>,
    {
        if self
            .busy
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(TransportError::ConcurrentPoll);
        }
        let _permit = PollPermit(&self.busy);

        let cancelled = self.cancel.notified();
        tokio::pin!(cancelled);
        cancelled.as_mut().enable();

        tokio::select! {
            result = with_timeout(timeout, request) => result,
            _ = cancelled => Err(TransportError::Cancelled),
        }
    }

    pub(crate) fn cancel(&self) {
        self.cancel.notify_waiters();
    }

    pub(crate) fn is_busy(&self) -> bool {
        self.busy.load(Ordering::Acquire)
    }
}

/// Bound a request by a timeout, mapping expiry to [`TransportError::Timeout`]
pub(crate) async fn with_timeout<T, F>(timeout: Duration, request: F) -> Result<T, TransportError>
where
    F: Future<Output = Result<T, TransportError>>,
{
    match tokio::time::timeout(timeout, request).await {
        Ok(result) => result,
        Err(_) => Err(TransportError::Timeout(timeout.as_millis() as u64)),
    }
}

/// Extra path segment appended to the URL for a batch, if any
pub(crate) fn message_type_path(messages: &[Message]) -> Option<&'static str> {
    use crate::message::meta;

    match messages.first().map(|m| m.channel.as_str()) {
        Some(meta::HANDSHAKE) => Some("handshake"),
        Some(meta::CONNECT) => Some("connect"),
        Some(meta::DISCONNECT) => Some("disconnect"),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::meta;

    #[tokio::test]
    async fn test_poll_slot_refuses_concurrent_poll() {
        let slot = Arc::new(PollSlot::default());

        let held = Arc::clone(&slot);
        let first = tokio::spawn(async move {
            held.run(Duration::from_secs(5), async {
                tokio::time::sleep(Duration::from_millis(200)).await;
                Ok::<_, TransportError>(1)
            })
            .await
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(slot.is_busy());

        let second = slot
            .run(Duration::from_secs(5), async { Ok::<_, TransportError>(2) })
            .await;
        assert_eq!(second, Err(TransportError::ConcurrentPoll));

        assert_eq!(first.await.unwrap(), Ok(1));
        assert!(!slot.is_busy());
    }

    #[tokio::test]
    async fn test_poll_slot_cancel() {
        let slot = Arc::new(PollSlot::default());
        let running = Arc::clone(&slot);
        let poll = tokio::spawn(async move {
            running
                .run(Duration::from_secs(5), async {
                    tokio::time::sleep(Duration::from_secs(5)).await;
                    Ok::<_, TransportError>(())
                })
                .await
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        slot.cancel();
        assert_eq!(poll.await.unwrap(), Err(TransportError::Cancelled));
    }

    #[tokio::test]
    async fn test_timeout() {
        let result = with_timeout(Duration::from_millis(10), async {
            tokio::time::sleep(Duration::from_secs(1)).await;
            Ok::<_, TransportError>(())
        })
        .await;
        assert_eq!(result, Err(TransportError::Timeout(10)));
    }

    #[test]
    fn test_message_type_path() {
        assert_eq!(message_type_path(&[Message::new(meta::CONNECT)]), Some("connect"));
        assert_eq!(message_type_path(&[Message::new("/chat")]), None);
        assert_eq!(message_type_path(&[]), None);
    }
}
