//! Incremental message framer.
//!
//! Turns an append-only byte buffer into discrete protocol messages. The
//! framer never reads from a socket itself; callers append whatever bytes
//! arrived and call [`MessageFramer::offer`] until it reports that more data
//! is needed. Feeding the same bytes in arbitrary chunk sizes yields
//! identical messages.

use crate::error::ProtocolError;
use crate::frame::{Message, MessageHeader, MessageKind, MESSAGE_HEADER_SIZE};
use crate::DEFAULT_MAX_MESSAGE_SIZE;
use bytes::BytesMut;
use std::collections::HashSet;

/// Default initial capacity for a framer-fed read buffer (8 KiB).
pub const DEFAULT_INITIAL_CAPACITY: usize = 8 * 1024;

/// Framer tuning knobs.
#[derive(Debug, Clone)]
pub struct FramerConfig {
    /// Initial read-buffer capacity.
    pub initial_capacity: usize,
    /// Hard cap on header + body size. A declared length above this is a
    /// fatal framing error.
    pub max_message_size: usize,
}

impl Default for FramerConfig {
    fn default() -> Self {
        Self {
            initial_capacity: DEFAULT_INITIAL_CAPACITY,
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
        }
    }
}

/// Result of one [`MessageFramer::offer`] call.
#[derive(Debug)]
pub enum FramerOutcome {
    /// A complete message was sliced out; excess bytes stay in the buffer.
    Message(Message),
    /// Not enough bytes yet. `need` is the total buffered size required
    /// before the next call can make progress.
    MoreData { need: usize },
}

/// Incremental framer with fragment-chain tracking.
pub struct MessageFramer {
    config: FramerConfig,
    /// Request ids with an open fragment chain (a message arrived with the
    /// more-fragments flag and its final fragment has not been seen).
    pending_fragments: HashSet<u32>,
}

impl MessageFramer {
    pub fn new(config: FramerConfig) -> Self {
        Self {
            config,
            pending_fragments: HashSet::new(),
        }
    }

    pub fn config(&self) -> &FramerConfig {
        &self.config
    }

    /// Attempts to slice the next complete message out of `buf`.
    pub fn offer(&mut self, buf: &mut BytesMut) -> Result<FramerOutcome, ProtocolError> {
        if buf.len() < MESSAGE_HEADER_SIZE {
            return Ok(FramerOutcome::MoreData {
                need: MESSAGE_HEADER_SIZE,
            });
        }

        let header = MessageHeader::peek(buf)?;
        let total = MESSAGE_HEADER_SIZE + header.body_len as usize;
        if total > self.config.max_message_size {
            return Err(ProtocolError::MessageTooLarge {
                size: total,
                cap: self.config.max_message_size,
            });
        }

        if buf.len() < total {
            return Ok(FramerOutcome::MoreData { need: total });
        }

        let _ = buf.split_to(MESSAGE_HEADER_SIZE);
        let body = buf.split_to(header.body_len as usize).freeze();
        let message = Message { header, body };
        self.track_fragment_state(&message);
        Ok(FramerOutcome::Message(message))
    }

    /// Grows `buf` so it can hold at least `need` bytes, doubling capacity
    /// up to the configured cap. A `need` that can never fit is fatal.
    pub fn grow_for(&self, buf: &mut BytesMut, need: usize) -> Result<(), ProtocolError> {
        if need > self.config.max_message_size {
            return Err(ProtocolError::MessageTooLarge {
                size: need,
                cap: self.config.max_message_size,
            });
        }
        if buf.capacity() >= need {
            return Ok(());
        }
        let doubled = (buf.capacity().max(self.config.initial_capacity) * 2)
            .clamp(need, self.config.max_message_size);
        buf.reserve(doubled - buf.len());
        Ok(())
    }

    /// True while any fragment chain is open. The connection stays in
    /// "expecting more data" even if the buffer holds no partial message.
    pub fn is_expecting_fragments(&self) -> bool {
        !self.pending_fragments.is_empty()
    }

    /// True when either a partial message sits in the buffer or a fragment
    /// chain is open. Used to arm the mid-message progress timeout.
    pub fn expects_more_data(&self, buf: &BytesMut) -> bool {
        !buf.is_empty() || self.is_expecting_fragments()
    }

    /// Drops fragment-chain bookkeeping for a cancelled request.
    pub fn forget_request(&mut self, request_id: u32) {
        self.pending_fragments.remove(&request_id);
    }

    fn track_fragment_state(&mut self, message: &Message) {
        let Some(request_id) = message.peek_request_id() else {
            return;
        };
        if message.header.flags.has_more_fragments() {
            self.pending_fragments.insert(request_id);
        } else if message.kind() == MessageKind::Fragment {
            self.pending_fragments.remove(&request_id);
        }
    }
}

impl Default for MessageFramer {
    fn default() -> Self {
        Self::new(FramerConfig::default())
    }
}
