use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use url::Url;

use super::defaults;
use crate::error::{BayeuxError, Result};
use crate::message::Advice;

/// Session client configuration
///
/// Provides centralized configuration management with:
/// - Serde support for loading from files
/// - Builder methods for customization
/// - Defaults matching common CometD servers
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Bayeux server URL (required)
    pub url: String,

    /// Protocol version sent in the handshake
    pub version: String,

    /// Oldest server version this client accepts
    pub minimum_version: String,

    /// Latency budget added to request timeouts (milliseconds)
    pub expected_network_delay_ms: u64,

    /// Overrides the connect timeout when smaller and non-zero (milliseconds)
    pub connect_timeout_ms: u64,

    /// Delay before the REST transport re-subscribes after a lost channel (milliseconds)
    pub auto_reconnect_time_ms: u64,

    /// Re-fetch everything on reconnect instead of resuming from the cached token
    pub reload_data_on_reconnect: bool,

    /// Send REST publishes as JSON rather than plain text
    pub send_as_json: bool,

    /// Accept header used by the REST transport
    pub accept_type: String,

    /// Step added to the backoff after each failure (milliseconds)
    pub backoff_increment_ms: u64,

    /// Upper bound for the backoff (milliseconds)
    pub max_backoff_ms: u64,

    /// Append `/handshake`, `/connect`, `/disconnect` to the URL for meta requests
    pub append_message_type_to_url: bool,

    /// Run incoming extensions in reverse registration order
    pub reverse_incoming_extensions: bool,

    /// Origin the client runs on; a different server host makes the session cross-domain
    pub origin: Option<String>,

    /// Extra headers sent with every request
    pub request_headers: HashMap<String, String>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            version: defaults::DEFAULT_VERSION.to_string(),
            minimum_version: defaults::DEFAULT_MINIMUM_VERSION.to_string(),
            expected_network_delay_ms: defaults::DEFAULT_EXPECTED_NETWORK_DELAY_MS,
            connect_timeout_ms: 0,
            auto_reconnect_time_ms: defaults::DEFAULT_AUTO_RECONNECT_TIME_MS,
            reload_data_on_reconnect: false,
            send_as_json: true,
            accept_type: defaults::DEFAULT_ACCEPT_TYPE.to_string(),
            backoff_increment_ms: defaults::DEFAULT_BACKOFF_INCREMENT_MS,
            max_backoff_ms: defaults::DEFAULT_MAX_BACKOFF_MS,
            append_message_type_to_url: true,
            reverse_incoming_extensions: false,
            origin: None,
            request_headers: HashMap::new(),
        }
    }
}

impl ClientConfig {
    /// Create a configuration for the given server URL with defaults
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Self::default()
        }
    }

    pub fn with_origin(mut self, origin: impl Into<String>) -> Self {
        self.origin = Some(origin.into());
        self
    }

    pub fn with_connect_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.connect_timeout_ms = timeout_ms;
        self
    }

    pub fn with_backoff(mut self, increment_ms: u64, max_ms: u64) -> Self {
        self.backoff_increment_ms = increment_ms;
        self.max_backoff_ms = max_ms;
        self
    }

    pub fn with_auto_reconnect_time_ms(mut self, delay_ms: u64) -> Self {
        self.auto_reconnect_time_ms = delay_ms;
        self
    }

    pub fn with_reload_data_on_reconnect(mut self, reload: bool) -> Self {
        self.reload_data_on_reconnect = reload;
        self
    }

    pub fn with_append_message_type_to_url(mut self, append: bool) -> Self {
        self.append_message_type_to_url = append;
        self
    }

    pub fn with_request_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.request_headers.insert(name.into(), value.into());
        self
    }

    /// Check the configuration and return the parsed server URL
    pub fn validate(&self) -> Result<Url> {
        if self.url.trim().is_empty() {
            return Err(BayeuxError::InvalidConfig(
                "missing required parameter 'url' specifying the Bayeux server URL".to_string(),
            ));
        }
        let url = Url::parse(&self.url)
            .map_err(|e| BayeuxError::InvalidConfig(format!("invalid url '{}': {e}", self.url)))?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(BayeuxError::InvalidConfig(format!(
                "unsupported url scheme '{}'",
                url.scheme()
            )));
        }
        if self.max_backoff_ms < self.backoff_increment_ms {
            return Err(BayeuxError::InvalidConfig(
                "max_backoff_ms must not be smaller than backoff_increment_ms".to_string(),
            ));
        }
        Ok(url)
    }

    /// Whether the server lives on a different host than the configured origin
    pub fn is_cross_domain(&self) -> bool {
        let Some(origin) = self.origin.as_deref() else {
            return false;
        };
        let Ok(server) = Url::parse(&self.url) else {
            return false;
        };
        let origin_authority = match Url::parse(origin) {
            Ok(origin_url) => authority(&origin_url),
            // Bare "host:port" origins
            Err(_) => origin.to_string(),
        };
        authority(&server) != origin_authority
    }

    /// Whether meta requests get the message type appended to the URL
    ///
    /// Disabled when the URL carries a query string or when the last path
    /// segment looks like a file mapping (contains a `.`).
    pub fn appends_message_type(&self) -> bool {
        if !self.append_message_type_to_url {
            return false;
        }
        let Ok(url) = Url::parse(&self.url) else {
            return false;
        };
        if url.query().is_some() || url.fragment().is_some() {
            tracing::info!(url = %self.url, "Appending message type to URL with query is not supported");
            return false;
        }
        let last_segment = url
            .path_segments()
            .and_then(|segments| segments.filter(|s| !s.is_empty()).last())
            .unwrap_or("");
        if last_segment.contains('.') {
            tracing::info!(url = %self.url, "Appending message type to URL mapped to an extension is not supported");
            return false;
        }
        true
    }

    /// URL for a request, with the message type appended when enabled
    pub fn request_url(&self, extra_path: Option<&str>) -> String {
        let mut url = self.url.clone();
        if let (true, Some(extra)) = (self.appends_message_type(), extra_path) {
            if !url.ends_with('/') {
                url.push('/');
            }
            url.push_str(extra);
        }
        url
    }

    /// Timeout for a plain (non-poll) request
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.expected_network_delay_ms)
    }

    /// Timeout for a connect/poll request given the current advice
    pub fn poll_timeout(&self, advice: &Advice) -> Duration {
        let mut timeout_ms = advice
            .timeout
            .unwrap_or(0)
            .saturating_add(self.expected_network_delay_ms);
        if self.connect_timeout_ms > 0 && self.connect_timeout_ms < timeout_ms {
            timeout_ms = self.connect_timeout_ms;
        }
        Duration::from_millis(timeout_ms)
    }
}

fn authority(url: &Url) -> String {
    match (url.host_str(), url.port()) {
        (Some(host), Some(port)) => format!("{host}:{port}"),
        (Some(host), None) => host.to_string(),
        _ => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ClientConfig::new("http://localhost:8080/cometd");
        assert_eq!(config.version, "1.0");
        assert_eq!(config.minimum_version, "0.9");
        assert_eq!(config.backoff_increment_ms, 1000);
        assert_eq!(config.max_backoff_ms, 60_000);
        assert!(config.send_as_json);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_missing_url_is_rejected() {
        let err = ClientConfig::default().validate().unwrap_err();
        assert!(matches!(err, BayeuxError::InvalidConfig(_)));

        let err = ClientConfig::new("ftp://example.com").validate().unwrap_err();
        assert!(matches!(err, BayeuxError::InvalidConfig(_)));
    }

    #[test]
    fn test_cross_domain() {
        let config = ClientConfig::new("http://example.com/cometd");
        assert!(!config.is_cross_domain());

        let same = config.clone().with_origin("http://example.com");
        assert!(!same.is_cross_domain());

        let other = config.clone().with_origin("http://other.org:8080");
        assert!(other.is_cross_domain());

        let bare = config.with_origin("example.com");
        assert!(!bare.is_cross_domain());
    }

    #[test]
    fn test_request_url() {
        let config = ClientConfig::new("http://localhost/cometd");
        assert_eq!(config.request_url(Some("connect")), "http://localhost/cometd/connect");
        assert_eq!(config.request_url(None), "http://localhost/cometd");

        let mapped = ClientConfig::new("http://localhost/servlet.cometd");
        assert_eq!(mapped.request_url(Some("connect")), "http://localhost/servlet.cometd");

        let query = ClientConfig::new("http://localhost/cometd?x=1");
        assert_eq!(query.request_url(Some("handshake")), "http://localhost/cometd?x=1");

        let disabled = ClientConfig::new("http://localhost/cometd").with_append_message_type_to_url(false);
        assert_eq!(disabled.request_url(Some("connect")), "http://localhost/cometd");
    }

    #[test]
    fn test_poll_timeout() {
        let config = ClientConfig::new("http://localhost/cometd");
        let advice = Advice {
            timeout: Some(30_000),
            ..Default::default()
        };
        assert_eq!(config.poll_timeout(&advice), Duration::from_millis(40_000));

        let capped = config.clone().with_connect_timeout_ms(5_000);
        assert_eq!(capped.poll_timeout(&advice), Duration::from_millis(5_000));

        let larger = config.with_connect_timeout_ms(90_000);
        assert_eq!(larger.poll_timeout(&advice), Duration::from_millis(40_000));
    }

    #[test]
    fn test_poll_timeout_saturates_on_huge_advice() {
        let config = ClientConfig::new("http://localhost/cometd");
        let advice = Advice {
            timeout: Some(u64::MAX),
            ..Default::default()
        };
        assert_eq!(config.poll_timeout(&advice), Duration::from_millis(u64::MAX));

        let capped = config.with_connect_timeout_ms(5_000);
        assert_eq!(capped.poll_timeout(&advice), Duration::from_millis(5_000));
    }

    #[test]
    fn test_serde_defaults_fill_missing_fields() {
        let config: ClientConfig =
            serde_json::from_str(r#"{"url": "http://localhost/cometd", "send_as_json": false}"#)
                .unwrap();
        assert_eq!(config.url, "http://localhost/cometd");
        assert!(!config.send_as_json);
        assert_eq!(config.expected_network_delay_ms, 10_000);
    }
}
