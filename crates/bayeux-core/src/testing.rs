//! Scripted HTTP client for transport and session tests

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use crate::http::{HttpClient, HttpRequest, HttpResponse};
use crate::transport::TransportError;

pub(crate) enum Reply {
    Response(HttpResponse),
    Delayed(HttpResponse, Duration),
    Error(TransportError),
    /// Never answers, like a held long-poll
    Hang,
}

type Responder = Box<dyn Fn(&HttpRequest) -> Option<Reply> + Send + Sync>;

/// Answers from a queue first, then from a responder; hangs otherwise
#[derive(Default)]
pub(crate) struct MockHttpClient {
    requests: Mutex<Vec<HttpRequest>>,
    script: Mutex<VecDeque<Reply>>,
    responder: Mutex<Option<Responder>>,
}

impl MockHttpClient {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn push(&self, response: HttpResponse) {
        self.script.lock().unwrap().push_back(Reply::Response(response));
    }

    pub(crate) fn push_json(&self, body: Value) {
        self.push(HttpResponse::new(200, body.to_string()).with_header("Content-Type", "application/json"));
    }

    pub(crate) fn push_delayed(&self, response: HttpResponse, delay: Duration) {
        self.script
            .lock()
            .unwrap()
            .push_back(Reply::Delayed(response, delay));
    }

    pub(crate) fn push_error(&self, error: TransportError) {
        self.script.lock().unwrap().push_back(Reply::Error(error));
    }

    pub(crate) fn push_hang(&self) {
        self.script.lock().unwrap().push_back(Reply::Hang);
    }

    pub(crate) fn respond_with<F>(&self, responder: F)
    where
        F: Fn(&HttpRequest) -> Option<Reply> + Send + Sync + 'static,
    {
        *self.responder.lock().unwrap() = Some(Box::new(responder));
    }

    pub(crate) fn requests(&self) -> Vec<HttpRequest> {
        self.requests.lock().unwrap().clone()
    }

    /// Bayeux channels of every message sent so far, in order
    pub(crate) fn sent_channels(&self) -> Vec<String> {
        self.requests()
            .iter()
            .filter_map(|r| r.body.as_deref())
            .filter_map(|body| serde_json::from_str::<Vec<Value>>(body).ok())
            .flatten()
            .filter_map(|m| m["channel"].as_str().map(str::to_string))
            .collect()
    }

    /// Wait until at least `count` requests were made
    pub(crate) async fn wait_for_requests(&self, count: usize) {
        for _ in 0..500 {
            if self.requests.lock().unwrap().len() >= count {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!(
            "expected {count} requests, got {}",
            self.requests.lock().unwrap().len()
        );
    }
}

#[async_trait]
impl HttpClient for MockHttpClient {
    async fn request(&self, request: HttpRequest) -> Result<HttpResponse, TransportError> {
        let scripted = self.script.lock().unwrap().pop_front();
        let reply = match scripted {
            Some(reply) => Some(reply),
            None => self
                .responder
                .lock()
                .unwrap()
                .as_ref()
                .and_then(|responder| responder(&request)),
        };
        self.requests.lock().unwrap().push(request);

        match reply {
            Some(Reply::Response(response)) => Ok(response),
            Some(Reply::Delayed(response, delay)) => {
                tokio::time::sleep(delay).await;
                Ok(response)
            }
            Some(Reply::Error(error)) => Err(error),
            Some(Reply::Hang) | None => std::future::pending().await,
        }
    }
}
