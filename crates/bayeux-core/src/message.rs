//! Bayeux protocol types
//!
//! Wire representation of Bayeux messages, server advice and the reserved
//! meta channels, plus channel name validation.

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};
use std::cmp::Ordering;
use std::fmt;

use crate::error::{BayeuxError, Result};

/// Reserved meta channels
pub mod meta {
    pub const HANDSHAKE: &str = "/meta/handshake";
    pub const CONNECT: &str = "/meta/connect";
    pub const SUBSCRIBE: &str = "/meta/subscribe";
    pub const UNSUBSCRIBE: &str = "/meta/unsubscribe";
    pub const DISCONNECT: &str = "/meta/disconnect";
    /// Local notification channel for any failed meta exchange
    pub const UNSUCCESSFUL: &str = "/meta/unsuccessful";
    /// Local notification channel for publish acknowledgements
    pub const PUBLISH: &str = "/meta/publish";
}

/// What the server wants the client to do after the current exchange
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Reconnect {
    /// Reconnect with `/meta/connect`
    Retry,
    /// Start over with `/meta/handshake`
    Handshake,
    /// Do not reconnect at all
    None,
    /// Any value this client does not understand
    #[serde(other)]
    Unknown,
}

impl fmt::Display for Reconnect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Reconnect::Retry => write!(f, "retry"),
            Reconnect::Handshake => write!(f, "handshake"),
            Reconnect::None => write!(f, "none"),
            Reconnect::Unknown => write!(f, "unknown"),
        }
    }
}

/// Server-supplied hints guiding retry behavior
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Advice {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reconnect: Option<Reconnect>,
    /// Delay before the next request, in milliseconds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interval: Option<u64>,
    /// How long the server holds a connect request, in milliseconds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<u64>,
}

impl Advice {
    /// Advice attached to locally synthesised failures of retryable requests
    pub fn retry(interval: u64) -> Self {
        Self {
            reconnect: Some(Reconnect::Retry),
            interval: Some(interval),
            timeout: None,
        }
    }

    /// Advice attached to locally synthesised failures of one-shot requests
    pub fn none() -> Self {
        Self {
            reconnect: Some(Reconnect::None),
            interval: Some(0),
            timeout: None,
        }
    }
}

/// A Bayeux message
///
/// Fields the client does not model explicitly are kept in `extra` so
/// extensions and servers can round-trip them untouched.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub channel: String,
    #[serde(
        default,
        deserialize_with = "deserialize_id",
        skip_serializing_if = "Option::is_none"
    )]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subscription: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub successful: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub advice: Option<Advice>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub minimum_version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub supported_connection_types: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connection_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ext: Option<Value>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Message {
    /// Create an empty message on a channel
    pub fn new(channel: impl Into<String>) -> Self {
        Self {
            channel: channel.into(),
            ..Default::default()
        }
    }

    /// Create an application message carrying `data`
    pub fn publish(channel: impl Into<String>, data: Value) -> Self {
        Self {
            channel: channel.into(),
            data: Some(data),
            ..Default::default()
        }
    }

    /// Create a `/meta/subscribe` or `/meta/unsubscribe` request
    pub fn subscription_request(meta_channel: &str, subscription: &str) -> Self {
        Self {
            channel: meta_channel.to_string(),
            subscription: Some(subscription.to_string()),
            ..Default::default()
        }
    }

    /// Create a locally synthesised failure reply for a request that never
    /// got an answer from the server
    pub fn failure(request: &Message, reason: &str, advice: Advice) -> Self {
        let mut extra = Map::new();
        extra.insert("failure".to_string(), Value::Bool(true));
        if let Ok(value) = serde_json::to_value(request) {
            extra.insert("request".to_string(), value);
        }
        Self {
            channel: request.channel.clone(),
            id: request.id.clone(),
            subscription: request.subscription.clone(),
            successful: Some(false),
            error: Some(reason.to_string()),
            advice: Some(advice),
            extra,
            ..Default::default()
        }
    }

    /// Merge user-supplied properties into this message without
    /// overwriting the fields the protocol requires
    pub fn merge_props(self, props: Option<&Map<String, Value>>) -> Self {
        let Some(props) = props else {
            return self;
        };
        let Ok(Value::Object(mut own)) = serde_json::to_value(&self) else {
            return self;
        };
        for (key, value) in props {
            own.entry(key.clone()).or_insert_with(|| value.clone());
        }
        match serde_json::from_value(Value::Object(own)) {
            Ok(merged) => merged,
            Err(e) => {
                tracing::warn!(error = %e, "Ignoring message properties that do not fit the wire format");
                self
            }
        }
    }

    /// Whether this is a meta (protocol control) message
    pub fn is_meta(&self) -> bool {
        is_meta_channel(&self.channel)
    }

    /// Whether the server marked this reply as successful
    pub fn is_successful(&self) -> bool {
        self.successful == Some(true)
    }

    /// Flag a handshake delivery as a re-established session
    pub fn set_reestablish(&mut self, reestablish: bool) {
        self.extra
            .insert("reestablish".to_string(), Value::Bool(reestablish));
    }

    /// Whether a handshake delivery is a re-established session
    pub fn is_reestablish(&self) -> bool {
        self.extra
            .get("reestablish")
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }
}

/// Bayeux allows message ids to be strings or numbers
fn deserialize_id<'de, D>(deserializer: D) -> std::result::Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<Value>::deserialize(deserializer)?;
    Ok(match value {
        Some(Value::String(s)) => Some(s),
        Some(Value::Number(n)) => Some(n.to_string()),
        _ => None,
    })
}

/// Whether a channel name belongs to the reserved `/meta/` namespace
pub fn is_meta_channel(channel: &str) -> bool {
    channel.starts_with("/meta/")
}

/// Validate a channel name
///
/// Channels start with `/` and consist of non-empty segments. Wildcard
/// segments (`*`, `**`) are only accepted as the last segment and only when
/// `allow_wildcards` is set.
pub fn validate_channel(channel: &str, allow_wildcards: bool) -> Result<()> {
    let invalid = || BayeuxError::InvalidChannel(channel.to_string());

    let rest = channel.strip_prefix('/').ok_or_else(invalid)?;
    if rest.is_empty() {
        return Err(invalid());
    }

    let segments: Vec<&str> = rest.split('/').collect();
    let last = segments.len() - 1;
    for (i, segment) in segments.iter().enumerate() {
        if segment.is_empty() {
            return Err(invalid());
        }
        let wildcard = *segment == "*" || *segment == "**";
        if wildcard && (!allow_wildcards || i != last) {
            return Err(invalid());
        }
    }
    Ok(())
}

/// Compare dotted numeric protocol versions ("1.0" vs "0.9")
///
/// Missing segments compare as zero; non-numeric segments compare as zero.
pub fn compare_versions(a: &str, b: &str) -> Ordering {
    let parse = |v: &str| -> Vec<u64> {
        v.split('.')
            .map(|part| part.trim().parse::<u64>().unwrap_or(0))
            .collect()
    };
    let (a, b) = (parse(a), parse(b));
    let len = a.len().max(b.len());
    for i in 0..len {
        let x = a.get(i).copied().unwrap_or(0);
        let y = b.get(i).copied().unwrap_or(0);
        match x.cmp(&y) {
            Ordering::Equal => continue,
            other => return other,
        }
    }
    Ordering::Equal
}

/// Parse a response body into messages, skipping elements that do not
/// decode as a message
///
/// Accepts a JSON array of messages or a single message object.
pub fn parse_messages(body: &str) -> std::result::Result<Vec<Message>, serde_json::Error> {
    let value: Value = serde_json::from_str(body)?;
    let items = match value {
        Value::Array(items) => items,
        Value::Null => Vec::new(),
        other => vec![other],
    };

    let mut messages = Vec::with_capacity(items.len());
    for item in items {
        match serde_json::from_value::<Message>(item) {
            Ok(message) => messages.push(message),
            Err(e) => tracing::debug!(error = %e, "Skipping malformed message in batch"),
        }
    }
    Ok(messages)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_reconnect_serde() {
        let advice: Advice =
            serde_json::from_value(json!({"reconnect": "none", "interval": 0})).unwrap();
        assert_eq!(advice.reconnect, Some(Reconnect::None));
        assert_eq!(advice.interval, Some(0));

        let odd: Advice = serde_json::from_value(json!({"reconnect": "later"})).unwrap();
        assert_eq!(odd.reconnect, Some(Reconnect::Unknown));
    }

    #[test]
    fn test_message_wire_names() {
        let mut msg = Message::new(meta::HANDSHAKE);
        msg.minimum_version = Some("0.9".to_string());
        msg.supported_connection_types = Some(vec!["long-polling".to_string()]);
        msg.client_id = Some("abc".to_string());

        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["minimumVersion"], "0.9");
        assert_eq!(json["supportedConnectionTypes"][0], "long-polling");
        assert_eq!(json["clientId"], "abc");
        assert!(json.get("data").is_none());
    }

    #[test]
    fn test_numeric_id_and_extra_fields() {
        let msg: Message = serde_json::from_value(json!({
            "channel": "/chat/room1",
            "id": 7,
            "data": "hi",
            "custom": {"x": 1}
        }))
        .unwrap();
        assert_eq!(msg.id.as_deref(), Some("7"));
        assert_eq!(msg.data, Some(json!("hi")));
        assert_eq!(msg.extra["custom"]["x"], 1);
    }

    #[test]
    fn test_merge_props_keeps_protocol_fields() {
        let mut props = Map::new();
        props.insert("channel".to_string(), json!("/evil"));
        props.insert("ext".to_string(), json!({"auth": "token"}));

        let msg = Message::subscription_request(meta::SUBSCRIBE, "/a").merge_props(Some(&props));
        assert_eq!(msg.channel, meta::SUBSCRIBE);
        assert_eq!(msg.ext, Some(json!({"auth": "token"})));
    }

    #[test]
    fn test_failure_message() {
        let mut request = Message::subscription_request(meta::SUBSCRIBE, "/a");
        request.id = Some("3".to_string());
        let failure = Message::failure(&request, "timeout", Advice::none());
        assert_eq!(failure.channel, meta::SUBSCRIBE);
        assert_eq!(failure.subscription.as_deref(), Some("/a"));
        assert!(!failure.is_successful());
        assert_eq!(failure.extra["failure"], true);
    }

    #[test]
    fn test_validate_channel() {
        assert!(validate_channel("/chat/room1", false).is_ok());
        assert!(validate_channel("/meta/handshake", false).is_ok());
        assert!(validate_channel("/a/*", true).is_ok());
        assert!(validate_channel("/a/**", true).is_ok());

        assert!(validate_channel("", false).is_err());
        assert!(validate_channel("/", false).is_err());
        assert!(validate_channel("chat", false).is_err());
        assert!(validate_channel("/chat/", false).is_err());
        assert!(validate_channel("/a//b", false).is_err());
        assert!(validate_channel("/a/*", false).is_err());
        assert!(validate_channel("/a/*/b", true).is_err());
    }

    #[test]
    fn test_compare_versions() {
        assert_eq!(compare_versions("1.0", "0.9"), Ordering::Greater);
        assert_eq!(compare_versions("0.9", "1.0"), Ordering::Less);
        assert_eq!(compare_versions("1.0", "1"), Ordering::Equal);
        assert_eq!(compare_versions("1.10", "1.9"), Ordering::Greater);
    }

    #[test]
    fn test_parse_messages_skips_malformed() {
        let body = r#"[{"channel":"/a","data":1},{"data":"no channel"},{"channel":"/b","data":2}]"#;
        let messages = parse_messages(body).unwrap();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].channel, "/a");
        assert_eq!(messages[1].channel, "/b");
    }

    #[test]
    fn test_parse_single_object() {
        let messages = parse_messages(r#"{"channel":"/meta/connect","successful":true}"#).unwrap();
        assert_eq!(messages.len(), 1);
        assert!(messages[0].is_successful());
    }
}
