//! Directed FIFO channels between servers.
//!
//! HARD CONTRACT: each link delivers messages in the exact order they
//! were queued. The in-transit attribution logic in the server state
//! machine is only correct under strict per-link FIFO — a delayed head
//! blocks everything queued behind it, so a later send can never
//! overtake an earlier one even when it drew a shorter delay.

use crate::event::Message;
use crate::types::{ServerId, Tick};
use std::collections::VecDeque;

/// A message sitting on a link, waiting for its delivery tick.
#[derive(Debug, Clone)]
pub struct ScheduledMessage {
    pub src: ServerId,
    pub dest: ServerId,
    pub message: Message,
    pub deliver_at: Tick,
}

/// A unidirectional channel between two servers.
#[derive(Debug)]
pub struct Link {
    pub src: ServerId,
    pub dest: ServerId,
    queue: VecDeque<ScheduledMessage>,
}

impl Link {
    pub fn new(src: ServerId, dest: ServerId) -> Self {
        Self {
            src,
            dest,
            queue: VecDeque::new(),
        }
    }

    pub fn push(&mut self, message: ScheduledMessage) {
        self.queue.push_back(message);
    }

    /// Pop the head of the queue if its delivery tick has arrived.
    /// Only the head is ever examined — queue order alone decides
    /// delivery order.
    pub fn pop_due(&mut self, now: Tick) -> Option<ScheduledMessage> {
        if self.queue.front().is_some_and(|m| m.deliver_at <= now) {
            self.queue.pop_front()
        } else {
            None
        }
    }

    /// Messages still sitting on this link, in queue order.
    pub fn pending(&self) -> impl Iterator<Item = &ScheduledMessage> {
        self.queue.iter()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }
}
