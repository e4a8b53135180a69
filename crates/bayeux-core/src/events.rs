//! Event Sink Trait
//!
//! Session lifecycle events (handshake, connect, disconnect, subscription
//! changes, connection loss) are emitted through an [`EventSink`] so the
//! session logic can work with different front ends: stdout for the CLI, a
//! broadcast channel for embedders and tests, or nothing at all.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::broadcast;

/// What happened to the session
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum SessionEventKind {
    Handshake {
        successful: bool,
        client_id: Option<String>,
        reestablish: bool,
    },
    Connect {
        successful: bool,
    },
    Disconnect,
    Subscribed {
        channel: String,
    },
    Unsubscribed {
        channel: String,
    },
    /// Transport failure; the session is retrying
    ConnectionLost {
        reason: String,
    },
    ConnectionRestored,
    /// Another client superseded this one
    ConnectionConflict,
}

/// A timestamped lifecycle event
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionEvent {
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub kind: SessionEventKind,
}

impl SessionEvent {
    pub fn new(kind: SessionEventKind) -> Self {
        Self {
            timestamp: Utc::now(),
            kind,
        }
    }
}

/// Event sink for emitting events to listeners
#[async_trait]
pub trait EventSink: Send + Sync {
    /// Emit a lifecycle event
    async fn emit(&self, event: &SessionEvent) -> Result<(), String>;
}

/// No-op event sink for testing or CLI mode without event emission
#[derive(Default, Clone)]
pub struct NoOpEventSink;

#[async_trait]
impl EventSink for NoOpEventSink {
    async fn emit(&self, _event: &SessionEvent) -> Result<(), String> {
        Ok(())
    }
}

/// Stdout event sink for CLI mode - prints events to console
#[derive(Default, Clone)]
pub struct StdoutEventSink {
    /// Whether to print in JSON format
    pub json_output: bool,
}

impl StdoutEventSink {
    pub fn new(json_output: bool) -> Self {
        Self { json_output }
    }

    fn format(&self, event: &SessionEvent) -> String {
        if self.json_output {
            return serde_json::to_string(event).unwrap_or_default();
        }
        let stamp = format_timestamp(&event.timestamp);
        match &event.kind {
            SessionEventKind::Handshake {
                successful: true,
                client_id,
                reestablish,
            } => {
                let id = client_id.as_deref().unwrap_or("-");
                if *reestablish {
                    format!("[{stamp}] Session re-established: {id}")
                } else {
                    format!("[{stamp}] Handshake complete: {id}")
                }
            }
            SessionEventKind::Handshake { .. } => format!("[{stamp}] Handshake failed"),
            SessionEventKind::Connect { successful } => {
                format!("[{stamp}] Connect {}", if *successful { "ok" } else { "failed" })
            }
            SessionEventKind::Disconnect => format!("[{stamp}] Disconnected"),
            SessionEventKind::Subscribed { channel } => format!("[{stamp}] Subscribed to {channel}"),
            SessionEventKind::Unsubscribed { channel } => {
                format!("[{stamp}] Unsubscribed from {channel}")
            }
            SessionEventKind::ConnectionLost { reason } => {
                format!("[{stamp}] Connection lost: {reason}")
            }
            SessionEventKind::ConnectionRestored => format!("[{stamp}] Connection restored"),
            SessionEventKind::ConnectionConflict => {
                format!("[{stamp}] Connection superseded by another client")
            }
        }
    }
}

#[async_trait]
impl EventSink for StdoutEventSink {
    async fn emit(&self, event: &SessionEvent) -> Result<(), String> {
        println!("{}", self.format(event));
        Ok(())
    }
}

/// Fans events out to any number of [`broadcast::Receiver`]s
#[derive(Clone)]
pub struct BroadcastEventSink {
    sender: broadcast::Sender<SessionEvent>,
}

impl BroadcastEventSink {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.sender.subscribe()
    }
}

impl Default for BroadcastEventSink {
    fn default() -> Self {
        Self::new(64)
    }
}

#[async_trait]
impl EventSink for BroadcastEventSink {
    async fn emit(&self, event: &SessionEvent) -> Result<(), String> {
        // No receivers is not an error
        let _ = self.sender.send(event.clone());
        Ok(())
    }
}

fn format_timestamp(timestamp: &DateTime<Utc>) -> String {
    timestamp.format("%H:%M:%S%.3f").to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(kind: SessionEventKind) -> SessionEvent {
        SessionEvent {
            timestamp: Utc.with_ymd_and_hms(2024, 1, 1, 1, 1, 1).unwrap(),
            kind,
        }
    }

    #[tokio::test]
    async fn test_noop_sink() {
        let sink = NoOpEventSink;
        assert!(sink
            .emit(&SessionEvent::new(SessionEventKind::Disconnect))
            .await
            .is_ok());
    }

    #[test]
    fn test_format_timestamp() {
        let event = at(SessionEventKind::Disconnect);
        assert_eq!(format_timestamp(&event.timestamp), "01:01:01.000");
    }

    #[test]
    fn test_text_format() {
        let sink = StdoutEventSink::new(false);
        let event = at(SessionEventKind::Subscribed {
            channel: "/chat/room1".to_string(),
        });
        assert_eq!(sink.format(&event), "[01:01:01.000] Subscribed to /chat/room1");
    }

    #[test]
    fn test_json_format() {
        let sink = StdoutEventSink::new(true);
        let event = at(SessionEventKind::Connect { successful: true });
        let value: serde_json::Value = serde_json::from_str(&sink.format(&event)).unwrap();
        assert_eq!(value["event"], "connect");
        assert_eq!(value["successful"], true);
        assert!(value["timestamp"].as_str().unwrap().starts_with("2024-01-01T01:01:01"));
    }

    #[tokio::test]
    async fn test_broadcast_sink() {
        let sink = BroadcastEventSink::default();
        let mut rx = sink.subscribe();
        sink.emit(&SessionEvent::new(SessionEventKind::ConnectionRestored))
            .await
            .unwrap();
        assert_eq!(rx.recv().await.unwrap().kind, SessionEventKind::ConnectionRestored);
    }
}
