//! Bounded FIFO for messages that could not be delivered
//!
//! When full, the arriving message is rejected and everything already buffered
//! is left untouched. There is no reordering operation.

use bytes::Bytes;
use rumqttc::v5::mqttbytes::QoS;
use std::collections::VecDeque;
use thiserror::Error;

/// One outbound message waiting for the broker
#[derive(Debug, Clone, PartialEq)]
pub struct OfflineMessage {
    pub topic: String,
    pub payload: Bytes,
    pub qos: QoS,
    /// Monotonic time of enqueue, in milliseconds
    pub enqueued_at_ms: u64,
}

/// Enqueue rejected; the message is handed back to the caller
#[derive(Debug, Error)]
#[error("offline buffer full ({capacity} messages)")]
pub struct BufferFull {
    pub capacity: usize,
    pub message: OfflineMessage,
}

#[derive(Debug)]
pub struct OfflineBuffer {
    messages: VecDeque<OfflineMessage>,
    capacity: usize,
}

impl OfflineBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            messages: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Append `message`, or reject it when the buffer is at capacity
    pub fn enqueue(&mut self, message: OfflineMessage) -> Result<(), BufferFull> {
        if self.messages.len() >= self.capacity {
            return Err(BufferFull {
                capacity: self.capacity,
                message,
            });
        }
        self.messages.push_back(message);
        Ok(())
    }

    /// Buffered messages, oldest first
    pub fn peek_all(&self) -> impl ExactSizeIterator<Item = &OfflineMessage> {
        self.messages.iter()
    }

    pub fn front(&self) -> Option<&OfflineMessage> {
        self.messages.front()
    }

    /// Drop the `n` oldest messages after they were replayed
    pub fn remove_prefix(&mut self, n: usize) {
        let n = n.min(self.messages.len());
        self.messages.drain(..n);
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.messages.len() >= self.capacity
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
