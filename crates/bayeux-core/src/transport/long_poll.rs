//! Long-polling transport
//!
//! Every exchange is a POST of a JSON array of messages to the Bayeux URL.
//! The server holds the connect request open until it has messages or the
//! advised timeout elapses.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, warn};

use super::{message_type_path, with_timeout, PollSlot, Transport, TransportContext, TransportError};
use crate::config::ClientConfig;
use crate::http::{HttpRequest, SharedHttpClient};
use crate::message::{parse_messages, Message};

pub const LONG_POLLING: &str = "long-polling";

/// Bayeux long-polling over HTTP POST
#[derive(Clone)]
pub struct LongPollTransport {
    config: Arc<ClientConfig>,
    http: SharedHttpClient,
    poll: Arc<PollSlot>,
}

impl LongPollTransport {
    pub fn new(context: &TransportContext) -> Self {
        Self {
            config: Arc::clone(&context.config),
            http: Arc::clone(&context.http),
            poll: Arc::new(PollSlot::default()),
        }
    }

    /// Long-polling works for any version and across domains
    pub fn accept(_version: &str, _cross_domain: bool) -> bool {
        true
    }

    async fn exchange(&self, messages: Vec<Message>) -> Result<Vec<Message>, TransportError> {
        let url = self.config.request_url(message_type_path(&messages));
        let body = serde_json::to_string(&messages)
            .map_err(|e| TransportError::InvalidResponse(e.to_string()))?;

        let request = HttpRequest::post(url.clone(), body)
            .header("Content-Type", "application/json;charset=UTF-8")
            .headers(self.config.request_headers.iter());

        debug!(url = %url, count = messages.len(), "Sending long-poll request");
        let response = self.http.request(request).await?;

        if !response.is_success() {
            warn!(url = %url, status = response.status, "Long-poll request failed");
            return Err(TransportError::Http(format!("HTTP {}", response.status)));
        }

        parse_messages(&response.body).map_err(|e| {
            warn!(error = %e, "Unparseable long-poll response");
            TransportError::InvalidResponse(e.to_string())
        })
    }
}

#[async_trait]
impl Transport for LongPollTransport {
    fn name(&self) -> &'static str {
        LONG_POLLING
    }

    async fn send_messages(
        &self,
        messages: Vec<Message>,
        timeout: Duration,
    ) -> Result<Vec<Message>, TransportError> {
        with_timeout(timeout, self.exchange(messages)).await
    }

    async fn connect(
        &self,
        message: Message,
        timeout: Duration,
    ) -> Result<Vec<Message>, TransportError> {
        self.poll.run(timeout, self.exchange(vec![message])).await
    }

    fn cancel_connect(&self) {
        self.poll.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::{HttpResponse, Method};
    use crate::message::meta;
    use crate::testing::MockHttpClient;
    use serde_json::json;

    fn transport(mock: &Arc<MockHttpClient>, url: &str) -> LongPollTransport {
        LongPollTransport::new(&TransportContext {
            config: Arc::new(ClientConfig::new(url).with_request_header("X-Token", "t")),
            http: mock.clone(),
        })
    }

    #[tokio::test]
    async fn test_posts_json_array_to_typed_url() {
        let mock = Arc::new(MockHttpClient::new());
        mock.push_json(json!([{"channel": "/meta/connect", "successful": true}]));
        let transport = transport(&mock, "http://localhost/cometd");

        let replies = transport
            .connect(Message::new(meta::CONNECT), Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(replies.len(), 1);
        assert!(replies[0].is_successful());

        let sent = mock.requests();
        assert_eq!(sent[0].method, Method::Post);
        assert_eq!(sent[0].url, "http://localhost/cometd/connect");
        assert_eq!(sent[0].header_value("X-Token"), Some("t"));
        let body: serde_json::Value = serde_json::from_str(sent[0].body.as_deref().unwrap()).unwrap();
        assert_eq!(body[0]["channel"], "/meta/connect");
    }

    #[tokio::test]
    async fn test_publish_goes_to_base_url() {
        let mock = Arc::new(MockHttpClient::new());
        mock.push_json(json!([{"channel": "/chat", "successful": true}]));
        let transport = transport(&mock, "http://localhost/cometd");

        transport
            .send_messages(vec![Message::publish("/chat", json!("hi"))], Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(mock.requests()[0].url, "http://localhost/cometd");
    }

    #[tokio::test]
    async fn test_malformed_elements_are_skipped() {
        let mock = Arc::new(MockHttpClient::new());
        mock.push(HttpResponse::new(
            200,
            r#"[{"channel":"/a","data":1},42,{"channel":"/b","data":2}]"#,
        ));
        let transport = transport(&mock, "http://localhost/cometd");

        let replies = transport
            .send_messages(vec![Message::publish("/a", json!(1))], Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(replies.len(), 2);
    }

    #[tokio::test]
    async fn test_http_error_status() {
        let mock = Arc::new(MockHttpClient::new());
        mock.push(HttpResponse::new(500, "oops"));
        let transport = transport(&mock, "http://localhost/cometd");

        let err = transport
            .send_messages(vec![Message::new(meta::HANDSHAKE)], Duration::from_secs(1))
            .await
            .unwrap_err();
        assert_eq!(err, TransportError::Http("HTTP 500".to_string()));
    }

    #[tokio::test]
    async fn test_cancel_connect() {
        let mock = Arc::new(MockHttpClient::new());
        mock.push_hang();
        let transport = transport(&mock, "http://localhost/cometd");

        let polling = transport.clone();
        let poll = tokio::spawn(async move {
            polling
                .connect(Message::new(meta::CONNECT), Duration::from_secs(10))
                .await
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        transport.cancel_connect();
        assert_eq!(poll.await.unwrap(), Err(TransportError::Cancelled));
    }
}
