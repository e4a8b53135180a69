//! Outgoing message batching
//!
//! Messages queue while a batch scope is open (or while the session holds
//! application traffic back during a handshake) and leave as one transport
//! call once the last scope closes.

use crate::error::{BayeuxError, Result};
use crate::message::Message;

/// Coalesces outgoing messages into batches
#[derive(Debug, Default)]
pub struct Batcher {
    depth: usize,
    held: bool,
    queue: Vec<Message>,
}

impl Batcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a batch scope
    pub fn begin(&mut self) {
        self.depth += 1;
    }

    /// Close a batch scope
    ///
    /// Returns the queued messages when the outermost scope closes and
    /// nothing else holds them back.
    pub fn end(&mut self) -> Result<Option<Vec<Message>>> {
        if self.depth == 0 {
            return Err(BayeuxError::UnpairedBatch);
        }
        self.depth -= 1;
        Ok(self.take_ready())
    }

    /// Offer a message for sending
    ///
    /// Returns it back (as a one-message batch) when it can go out now,
    /// otherwise queues it.
    pub fn push(&mut self, message: Message) -> Option<Vec<Message>> {
        if self.is_batching() {
            self.queue.push(message);
            None
        } else {
            Some(vec![message])
        }
    }

    /// Hold application messages back (while handshaking)
    pub fn hold(&mut self) {
        self.held = true;
    }

    /// Stop holding messages back, returning anything ready to flush
    pub fn release(&mut self) -> Option<Vec<Message>> {
        self.held = false;
        self.take_ready()
    }

    /// Whether messages are currently being queued
    pub fn is_batching(&self) -> bool {
        self.depth > 0 || self.held
    }

    pub fn is_held(&self) -> bool {
        self.held
    }

    pub fn depth(&self) -> usize {
        self.depth
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Messages waiting to be flushed, oldest first
    pub fn queued(&self) -> impl Iterator<Item = &Message> {
        self.queue.iter()
    }

    /// Drop queued messages and reset the scope depth
    pub fn clear(&mut self) -> Vec<Message> {
        self.depth = 0;
        std::mem::take(&mut self.queue)
    }

    fn take_ready(&mut self) -> Option<Vec<Message>> {
        if self.is_batching() || self.queue.is_empty() {
            return None;
        }
        Some(std::mem::take(&mut self.queue))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_outside_batch_sends_immediately() {
        let mut batcher = Batcher::new();
        let out = batcher.push(Message::publish("/a", json!(1))).unwrap();
        assert_eq!(out.len(), 1);
        assert!(batcher.is_empty());
    }

    #[test]
    fn test_nested_batch_flushes_fifo_once() {
        let mut batcher = Batcher::new();
        batcher.begin();
        assert!(batcher.push(Message::publish("/a", json!(1))).is_none());
        batcher.begin();
        assert!(batcher.push(Message::publish("/b", json!(2))).is_none());
        assert!(batcher.end().unwrap().is_none());
        assert!(batcher.push(Message::publish("/c", json!(3))).is_none());

        let flushed = batcher.end().unwrap().unwrap();
        let channels: Vec<&str> = flushed.iter().map(|m| m.channel.as_str()).collect();
        assert_eq!(channels, vec!["/a", "/b", "/c"]);
        assert!(batcher.is_empty());
    }

    #[test]
    fn test_unpaired_end() {
        let mut batcher = Batcher::new();
        assert!(matches!(batcher.end(), Err(BayeuxError::UnpairedBatch)));
    }

    #[test]
    fn test_hold_until_release() {
        let mut batcher = Batcher::new();
        batcher.hold();
        assert!(batcher.push(Message::publish("/a", json!(1))).is_none());

        // Closing a scope does not flush while held
        batcher.begin();
        assert!(batcher.end().unwrap().is_none());

        let flushed = batcher.release().unwrap();
        assert_eq!(flushed.len(), 1);
        assert!(batcher.release().is_none());
    }

    #[test]
    fn test_queued_in_order() {
        let mut batcher = Batcher::new();
        batcher.hold();
        batcher.push(Message::publish("/a", json!(1)));
        batcher.push(Message::publish("/b", json!(2)));
        let channels: Vec<&str> = batcher.queued().map(|m| m.channel.as_str()).collect();
        assert_eq!(channels, vec!["/a", "/b"]);
    }

    #[test]
    fn test_clear() {
        let mut batcher = Batcher::new();
        batcher.begin();
        batcher.push(Message::publish("/a", json!(1)));
        assert_eq!(batcher.clear().len(), 1);
        assert_eq!(batcher.depth(), 0);
    }
}
