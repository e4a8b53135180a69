//! REST-style polling transport
//!
//! Channels are plain HTTP resources below the base URL. Subscribing is a
//! GET on the channel resource with `Subscribe` headers; the server answers
//! with the current state and, when it registers the subscription,
//! `Subscribed: OK` plus a `Last-Modified` token that later resumes the
//! subscription through `Subscribe-Since`. The poll is a GET on the base URL
//! identified by `Client-Id` and returns either `application/rest+json`
//! fragments or a sequence of embedded `application/http` responses.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use futures::future::{BoxFuture, FutureExt, Shared};
use serde_json::Value;
use tracing::{debug, info, warn};
use url::Url;

use super::{with_timeout, PollSlot, Transport, TransportContext, TransportError};
use crate::config::ClientConfig;
use crate::http::{HttpRequest, HttpResponse, SharedHttpClient};
use crate::message::{meta, parse_messages, Advice, Message};

pub const REST_POLLING: &str = "rest-polling";

type PendingRequest = Shared<BoxFuture<'static, Result<HttpResponse, TransportError>>>;

enum SubscribePlan {
    Send(Option<String>),
    Join(PendingRequest),
    Skip,
}

#[derive(Default)]
struct RestState {
    client_id: Option<String>,
    created_client_id: bool,
    /// Cached `Subscribe-Since` token per channel
    since: HashMap<String, Option<String>>,
    /// Channels the server currently has registered for this client
    active: HashSet<String>,
    /// In-flight subscribe requests keyed by channel, with the token they used
    pending: HashMap<String, (Option<String>, PendingRequest)>,
    /// Incomplete trailing `rest+json` element from the previous poll
    carry: String,
}

/// Subscriptions mapped onto HTTP resources
#[derive(Clone)]
pub struct RestPollTransport {
    config: Arc<ClientConfig>,
    http: SharedHttpClient,
    state: Arc<Mutex<RestState>>,
    poll: Arc<PollSlot>,
}

impl RestPollTransport {
    pub fn new(context: &TransportContext) -> Self {
        Self {
            config: Arc::clone(&context.config),
            http: Arc::clone(&context.http),
            state: Arc::new(Mutex::new(RestState::default())),
            poll: Arc::new(PollSlot::default()),
        }
    }

    /// Plain HTTP resources cannot be polled across domains
    pub fn accept(_version: &str, cross_domain: bool) -> bool {
        !cross_domain
    }

    fn state(&self) -> MutexGuard<'_, RestState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Cached `Subscribe-Since` token of a channel
    pub fn since(&self, channel: &str) -> Option<String> {
        self.state().since.get(channel).cloned().flatten()
    }

    /// Whether the server currently holds a subscription for the channel
    pub fn is_subscribed(&self, channel: &str) -> bool {
        self.state().active.contains(channel)
    }

    fn base_dir(&self) -> Result<Url, TransportError> {
        let mut base = Url::parse(&self.config.url)
            .map_err(|e| TransportError::InvalidUrl(format!("{}: {e}", self.config.url)))?;
        if !base.path().ends_with('/') {
            let path = format!("{}/", base.path());
            base.set_path(&path);
        }
        Ok(base)
    }

    /// Absolute URL of a channel resource
    pub fn channel_url(&self, channel: &str) -> Result<String, TransportError> {
        let base = self.base_dir()?;
        base.join(channel.trim_start_matches('/'))
            .map(String::from)
            .map_err(|e| TransportError::InvalidUrl(format!("{channel}: {e}")))
    }

    /// Channel name for a `Content-Location`/`source` relative to the base URL
    pub fn channel_for(&self, location: &str) -> String {
        let Ok(base) = self.base_dir() else {
            return normalize_channel(location);
        };
        let Ok(resolved) = base.join(location) else {
            return normalize_channel(location);
        };
        let base_path = base.path().trim_end_matches('/');
        let path = resolved.path();
        match path.strip_prefix(base_path) {
            Some(rest) if rest.starts_with('/') => rest.to_string(),
            _ => path.to_string(),
        }
    }

    fn base_headers(&self, request: HttpRequest) -> HttpRequest {
        let client_id = self.state().client_id.clone();
        let mut request = request.header("Accept", self.config.accept_type.clone());
        if let Some(id) = client_id {
            request = request.header("Client-Id", id);
        }
        request.headers(self.config.request_headers.iter())
    }

    fn start_request(&self, request: HttpRequest) -> PendingRequest {
        let http = Arc::clone(&self.http);
        async move { http.request(request).await }.boxed().shared()
    }

    fn plan_subscribe(
        &self,
        channel: &str,
        requested_since: Option<String>,
        unsubscribe: bool,
    ) -> SubscribePlan {
        let mut state = self.state();
        let cached = state.since.get(channel).cloned().flatten();
        if unsubscribe {
            return SubscribePlan::Send(cached);
        }

        let since = requested_since.clone().or(cached.clone());
        if let Some((pending_since, pending)) = state.pending.get(channel) {
            if *pending_since == since {
                return SubscribePlan::Join(pending.clone());
            }
        }
        if state.active.contains(channel) && (requested_since.is_none() || requested_since == cached) {
            return SubscribePlan::Skip;
        }
        state.since.entry(channel.to_string()).or_insert(None);
        SubscribePlan::Send(since)
    }

    /// Subscribe to (or unsubscribe from) a channel resource
    ///
    /// Returns `None` when the channel is already subscribed with the same
    /// token and no request was needed.
    async fn subscribe_request(
        &self,
        channel: &str,
        requested_since: Option<String>,
        unsubscribe: bool,
    ) -> Result<Option<HttpResponse>, TransportError> {
        let url = self.channel_url(channel)?;

        let since = match self.plan_subscribe(channel, requested_since, unsubscribe) {
            SubscribePlan::Send(since) => since,
            SubscribePlan::Join(pending) => {
                debug!(channel, "Reusing pending subscribe request");
                return pending.await.map(Some);
            }
            SubscribePlan::Skip => {
                debug!(channel, "Already subscribed");
                return Ok(None);
            }
        };

        let mut http_request = self
            .base_headers(HttpRequest::get(url))
            .header("Cache-Control", "max-age=0")
            .header("Subscribe", if unsubscribe { "none" } else { "*" });
        if let Some(token) = &since {
            http_request = http_request.header("Subscribe-Since", token.clone());
        }

        let pending = self.start_request(http_request);
        if !unsubscribe {
            self.state()
                .pending
                .insert(channel.to_string(), (since.clone(), pending.clone()));
        }

        let result = pending.await;

        let mut state = self.state();
        if state.pending.get(channel).is_some_and(|(s, _)| *s == since) {
            state.pending.remove(channel);
        }
        let response = result?;

        if response.status == 409 {
            warn!(channel, "Subscription superseded by another client");
            return Err(TransportError::Conflict);
        }

        if unsubscribe {
            state.since.remove(channel);
            state.active.remove(channel);
        } else if response.header("Subscribed") == Some("OK") {
            let token = response
                .header("Last-Modified")
                .map(str::to_string)
                .unwrap_or_else(http_date_now);
            state.since.insert(channel.to_string(), Some(token));
            state.active.insert(channel.to_string());
        } else if response.is_success() {
            // Server did not register a subscription
            state.since.remove(channel);
            state.active.remove(channel);
        }

        Ok(Some(response))
    }

    async fn post_bayeux(&self, messages: Vec<Message>, path: &str) -> Result<Vec<Message>, TransportError> {
        let url = self.config.request_url(Some(path));
        let body = serde_json::to_string(&messages)
            .map_err(|e| TransportError::InvalidResponse(e.to_string()))?;
        let request = HttpRequest::post(url, body)
            .header("Content-Type", "application/json;charset=UTF-8")
            .headers(self.config.request_headers.iter());
        let response = self.http.request(request).await?;
        if !response.is_success() {
            return Err(TransportError::Http(format!("HTTP {}", response.status)));
        }
        parse_messages(&response.body).map_err(|e| TransportError::InvalidResponse(e.to_string()))
    }

    async fn publish(&self, message: &Message) -> Result<Message, TransportError> {
        let url = self.channel_url(&message.channel)?;
        let data = message.data.clone().unwrap_or(Value::Null);
        let (body, content_type) = if self.config.send_as_json {
            (data.to_string(), "application/json")
        } else {
            let text = match data {
                Value::String(s) => s,
                other => other.to_string(),
            };
            (text, "text/plain")
        };

        let request = self
            .base_headers(HttpRequest::post(url, body))
            .header("Content-Type", content_type);
        let response = self.http.request(request).await?;

        let mut reply = ack(message, response.is_success());
        if !response.is_success() {
            reply.error = Some(format!("HTTP {}", response.status));
        }
        Ok(reply)
    }

    /// Handle each message in turn; once one fails, it and every later
    /// message get a failure reply while earlier replies are kept
    async fn exchange(&self, messages: Vec<Message>) -> Result<Vec<Message>, TransportError> {
        let mut replies = Vec::with_capacity(messages.len());
        let mut remaining = messages.into_iter();
        while let Some(message) = remaining.next() {
            let failed = match self.exchange_one(&message).await {
                Ok(out) => {
                    replies.extend(out);
                    continue;
                }
                Err(e) if replies.is_empty() => return Err(e),
                Err(e) => e,
            };
            warn!(channel = %message.channel, error = %failed, "REST request failed mid-batch");
            let reason = failed.to_string();
            replies.push(Message::failure(&message, &reason, Advice::none()));
            replies.extend(remaining.map(|m| Message::failure(&m, &reason, Advice::none())));
            break;
        }
        Ok(replies)
    }

    async fn exchange_one(&self, message: &Message) -> Result<Vec<Message>, TransportError> {
        match message.channel.as_str() {
            meta::HANDSHAKE => self.post_bayeux(vec![message.clone()], "handshake").await,
            meta::DISCONNECT => {
                self.reset();
                Ok(vec![ack(message, true)])
            }
            meta::SUBSCRIBE | meta::UNSUBSCRIBE => {
                let unsubscribe = message.channel == meta::UNSUBSCRIBE;
                let Some(subscription) = message.subscription.clone() else {
                    let mut reply = ack(message, false);
                    reply.error = Some("missing subscription".to_string());
                    return Ok(vec![reply]);
                };
                let since = message
                    .extra
                    .get("since")
                    .and_then(Value::as_str)
                    .map(str::to_string);

                let response = self.subscribe_request(&subscription, since, unsubscribe).await?;
                let mut reply = ack(message, true);
                let Some(response) = response else {
                    return Ok(vec![reply]);
                };
                if !response.is_success() {
                    reply.successful = Some(false);
                    reply.error = Some(format!("HTTP {}", response.status));
                }
                let mut out = vec![reply];
                if !unsubscribe && response.is_success() && !response.body.trim().is_empty() {
                    out.extend(self.process_body(&response, Some(&subscription)));
                }
                Ok(out)
            }
            other if other.starts_with("/meta/") => Ok(vec![ack(message, true)]),
            _ => Ok(vec![self.publish(message).await?]),
        }
    }

    async fn open(&self, message: Message) -> Result<Vec<Message>, TransportError> {
        let (header, client_id) = {
            let mut state = self.state();
            let client_id = state
                .client_id
                .get_or_insert_with(|| uuid::Uuid::new_v4().to_string())
                .clone();
            let header = if state.created_client_id {
                "Client-Id"
            } else {
                "Create-Client-Id"
            };
            state.created_client_id = true;
            (header, client_id)
        };

        let request = HttpRequest::get(self.config.url.clone())
            .header("Accept", self.config.accept_type.clone())
            .header(header, client_id.clone())
            .headers(self.config.request_headers.iter());

        let response = match self.http.request(request).await {
            Ok(response) => response,
            Err(e) => {
                self.state().created_client_id = false;
                self.disconnected();
                return Err(e);
            }
        };

        if response.status == 409 {
            info!("Multiple clients share this id, polling superseded");
            self.disconnected();
            return Err(TransportError::Conflict);
        }
        if !response.is_success() {
            self.state().created_client_id = false;
            self.disconnected();
            return Err(TransportError::Http(format!("HTTP {}", response.status)));
        }

        let mut connected = ack(&message, true);
        connected.client_id = Some(client_id);
        let mut replies = vec![connected];
        replies.extend(self.process_body(&response, None));
        Ok(replies)
    }

    /// Turn a response body into channel messages
    fn process_body(&self, response: &HttpResponse, default_channel: Option<&str>) -> Vec<Message> {
        let content_type = response
            .header("Content-Type")
            .unwrap_or("application/rest+json")
            .to_ascii_lowercase();

        if content_type.contains("application/http") {
            return parse_http_messages(&response.body)
                .into_iter()
                .filter_map(|part| {
                    let location = part
                        .header("Content-Location")
                        .map(str::to_string)
                        .or_else(|| default_channel.map(str::to_string))?;
                    let data = serde_json::from_str(&part.body)
                        .unwrap_or_else(|_| Value::String(part.body.clone()));
                    Some(self.process_message(
                        &location,
                        data,
                        part.header("Last-Modified").map(str::to_string),
                    ))
                })
                .collect();
        }

        if content_type.contains("json") {
            let values = {
                let mut state = self.state();
                let mut input = std::mem::take(&mut state.carry);
                input.push_str(&response.body);
                let (values, carry) = parse_json_fragments(&input);
                state.carry = carry;
                values
            };
            return values
                .into_iter()
                .filter_map(|value| self.rest_message(value, default_channel))
                .collect();
        }

        if !response.body.trim().is_empty() {
            warn!(content_type = %content_type, "No suitable content type in REST response");
        }
        Vec::new()
    }

    fn rest_message(&self, value: Value, default_channel: Option<&str>) -> Option<Message> {
        let location = value
            .get("channel")
            .or_else(|| value.get("source"))
            .and_then(Value::as_str)
            .map(str::to_string)
            .or_else(|| default_channel.map(str::to_string));
        let Some(location) = location else {
            debug!("Dropping REST message without a channel");
            return None;
        };

        let last_modified = value
            .get("lastModified")
            .and_then(Value::as_str)
            .map(str::to_string);
        let data = match value {
            Value::Object(mut map) => {
                if let Some(result) = map.remove("result") {
                    result
                } else if let Some(data) = map.remove("data") {
                    data
                } else {
                    Value::Object(map)
                }
            }
            other => other,
        };
        Some(self.process_message(&location, data, last_modified))
    }

    /// Resolve the channel of an inbound message and update its cached token
    fn process_message(&self, location: &str, data: Value, last_modified: Option<String>) -> Message {
        let channel = self.channel_for(location);
        {
            let mut state = self.state();
            if let Some(since) = state.since.get_mut(&channel) {
                *since = Some(last_modified.unwrap_or_else(http_date_now));
            }
        }
        Message::publish(channel, data)
    }

    fn reset(&self) {
        self.poll.cancel();
        let mut state = self.state();
        *state = RestState::default();
    }
}

#[async_trait]
impl Transport for RestPollTransport {
    fn name(&self) -> &'static str {
        REST_POLLING
    }

    fn startup(&self, handshake: &Message) {
        let mut state = self.state();
        if let Some(id) = &handshake.client_id {
            state.client_id = Some(id.clone());
        }
        state.created_client_id = false;
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
        self.poll.run(timeout, self.open(message)).await
    }

    fn cancel_connect(&self) {
        self.poll.cancel();
    }

    /// Forget which channels the server holds; cached tokens survive unless
    /// the configuration asks to reload everything on reconnect
    fn disconnected(&self) {
        let mut state = self.state();
        state.active.clear();
        state.pending.clear();
        state.carry.clear();
        if self.config.reload_data_on_reconnect {
            state.since.clear();
        }
    }

    async fn disconnect(&self) {
        self.reset();
    }
}

/// Successful (or failed) acknowledgement of a request handled locally
fn ack(request: &Message, successful: bool) -> Message {
    Message {
        channel: request.channel.clone(),
        id: request.id.clone(),
        subscription: request.subscription.clone(),
        successful: Some(successful),
        ..Default::default()
    }
}

fn normalize_channel(location: &str) -> String {
    if location.starts_with('/') {
        location.to_string()
    } else {
        format!("/{location}")
    }
}

fn http_date_now() -> String {
    chrono::Utc::now()
        .format("%a, %d %b %Y %H:%M:%S GMT")
        .to_string()
}

/// Parse a possibly truncated stream of `rest+json` elements
///
/// The stream may start with `[` or `,` and may lack the closing `]`.
/// Returns the complete elements and the incomplete tail, if any.
fn parse_json_fragments(input: &str) -> (Vec<Value>, String) {
    let mut values = Vec::new();
    let mut rest = input;
    loop {
        rest = rest.trim_start_matches(|c: char| c.is_whitespace() || matches!(c, '[' | ']' | ','));
        if rest.is_empty() {
            return (values, String::new());
        }

        let mut stream = serde_json::Deserializer::from_str(rest).into_iter::<Value>();
        match stream.next() {
            Some(Ok(value)) => {
                let offset = stream.byte_offset();
                values.push(value);
                rest = &rest[offset..];
            }
            Some(Err(e)) if e.is_eof() => return (values, rest.to_string()),
            Some(Err(e)) => {
                warn!(error = %e, "Skipping malformed rest+json element");
                match element_end(rest) {
                    Some(end) => rest = &rest[end..],
                    None => return (values, String::new()),
                }
            }
            None => return (values, String::new()),
        }
    }
}

/// Byte offset of the `,` or `]` closing the element at the start of `input`
fn element_end(input: &str) -> Option<usize> {
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;
    for (i, c) in input.char_indices() {
        if in_string {
            match c {
                _ if escaped => escaped = false,
                '\\' => escaped = true,
                '"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match c {
            '"' => in_string = true,
            '{' | '[' => depth += 1,
            '}' | ']' if depth > 0 => depth -= 1,
            ',' | ']' if depth == 0 => return Some(i),
            _ => {}
        }
    }
    None
}

/// One response embedded in an `application/http` body
#[derive(Debug, Clone, PartialEq, Eq)]
struct EmbeddedResponse {
    status: u16,
    headers: Vec<(String, String)>,
    body: String,
}

impl EmbeddedResponse {
    fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

fn split_line(input: &str) -> (&str, &str) {
    match input.find('\n') {
        Some(pos) => (input[..pos].trim_end_matches('\r'), &input[pos + 1..]),
        None => (input.trim_end_matches('\r'), ""),
    }
}

/// Parse a sequence of raw HTTP responses
fn parse_http_messages(body: &str) -> Vec<EmbeddedResponse> {
    let mut parts = Vec::new();
    let mut rest = body;
    loop {
        rest = rest.trim_start_matches(['\r', '\n', ' ']);
        if rest.is_empty() {
            break;
        }
        if !rest.starts_with("HTTP/") {
            warn!("Unexpected data in application/http body");
            break;
        }

        let (status_line, after) = split_line(rest);
        let status = status_line
            .split_whitespace()
            .nth(1)
            .and_then(|s| s.parse().ok())
            .unwrap_or(0);
        rest = after;

        let mut headers = Vec::new();
        loop {
            let (line, after) = split_line(rest);
            rest = after;
            if line.is_empty() {
                break;
            }
            if let Some((name, value)) = line.split_once(':') {
                headers.push((name.trim().to_string(), value.trim().to_string()));
            }
        }

        let length = headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case("Content-Length"))
            .and_then(|(_, v)| v.parse::<usize>().ok());
        let end = match length {
            Some(n) if rest.is_char_boundary(n.min(rest.len())) => n.min(rest.len()),
            _ => rest.find("\nHTTP/").map_or(rest.len(), |pos| pos + 1),
        };
        let part_body = rest[..end].trim_end_matches(['\r', '\n']).to_string();
        rest = &rest[end..];

        parts.push(EmbeddedResponse {
            status,
            headers,
            body: part_body,
        });
    }
    parts
}
