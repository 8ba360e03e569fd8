//! Per-stream scrollback buffers
//!
//! Each region id (thoughts, speech, combat, ...) gets its own bounded buffer
//! of messages plus an unread counter. Buffers are created on first append and
//! live as long as the manager. Cloning the manager shares the same buffers.

use crate::data::Message;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};

pub const DEFAULT_CAPACITY: usize = 10_000;

#[derive(Debug, Default)]
struct ChannelBuffer {
    messages: VecDeque<Message>,
    unread: usize,
}

#[derive(Debug)]
struct Channels {
    capacity: usize,
    buffers: HashMap<String, ChannelBuffer>,
}

#[derive(Debug, Clone)]
pub struct StreamBufferManager {
    inner: Arc<Mutex<Channels>>,
}

impl StreamBufferManager {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Channels {
                capacity,
                buffers: HashMap::new(),
            })),
        }
    }

    // A panicking caller can't leave a buffer half-updated, so a poisoned
    // lock is still safe to use
    fn lock(&self) -> MutexGuard<'_, Channels> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Append to the tail of a channel, pruning the oldest entries past capacity
    pub fn append(&self, message: Message, channel: &str) {
        let mut channels = self.lock();
        let capacity = channels.capacity;
        let buffer = channels.buffers.entry(channel.to_string()).or_default();

        buffer.messages.push_back(message);
        buffer.unread += 1;

        let excess = buffer.messages.len().saturating_sub(capacity);
        if excess > 0 {
            buffer.messages.drain(..excess);
            tracing::trace!("Pruned {} message(s) from '{}'", excess, channel);
        }
    }

    /// Snapshot of a channel's messages, oldest first
    pub fn messages(&self, channel: &str) -> Vec<Message> {
        self.lock()
            .buffers
            .get(channel)
            .map(|buffer| buffer.messages.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Messages appended since the last `clear_unread_count`, including pruned ones
    pub fn unread_count(&self, channel: &str) -> usize {
        self.lock()
            .buffers
            .get(channel)
            .map_or(0, |buffer| buffer.unread)
    }

    pub fn clear_unread_count(&self, channel: &str) {
        if let Some(buffer) = self.lock().buffers.get_mut(channel) {
            buffer.unread = 0;
        }
    }

    /// Number of messages currently held for a channel
    pub fn len(&self, channel: &str) -> usize {
        self.lock()
            .buffers
            .get(channel)
            .map_or(0, |buffer| buffer.messages.len())
    }

    /// Drop a channel's content (the server sent `clearStream`). The channel
    /// itself stays known.
    pub fn clear(&self, channel: &str) {
        if let Some(buffer) = self.lock().buffers.get_mut(channel) {
            buffer.messages.clear();
            buffer.unread = 0;
        }
    }

    /// Known channel ids, sorted
    pub fn channels(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.lock().buffers.keys().cloned().collect();
        ids.sort();
        ids
    }
}

impl Default for StreamBufferManager {
    fn default() -> Self {
        Self::new()
    }
}
