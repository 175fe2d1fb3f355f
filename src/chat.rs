//! Session-scoped append-only chat log.
//!
//! Ordering is the session's shared sequence space, assigned by the actor
//! before a message lands here. History is capped; the oldest entries are
//! evicted so long-lived sessions stay bounded.

use std::collections::VecDeque;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::protocol::ChatMessage;

/// Epoch milliseconds from the server clock.
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

pub struct ChatLog {
    messages: VecDeque<ChatMessage>,
    max_len: usize,
}

impl ChatLog {
    pub fn new(max_len: usize) -> Self {
        Self {
            messages: VecDeque::with_capacity(max_len.min(256)),
            max_len,
        }
    }

    /// Append a sequenced message, evicting the oldest past the cap.
    pub fn push(&mut self, message: ChatMessage) {
        if self.messages.len() >= self.max_len {
            self.messages.pop_front();
        }
        self.messages.push_back(message);
    }

    /// Clone of the retained history, oldest first, for `JoinAck`.
    pub fn history(&self) -> Vec<ChatMessage> {
        self.messages.iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }
}
