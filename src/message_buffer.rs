//! Receive-side framing between a connection's socket and the message bus.
//!
//! `MessageBuffer` turns the byte stream of one connection into validated messages. It
//! does not perform I/O itself: the connection lends the buffer's message to a `Recv`
//! operation and hands it back with the byte count once the kernel is done.
//!
//! # Design
//!
//! The buffer is a single [`MESSAGE_SIZE_MAX`] message from the pool. Received bytes are
//! validated frame by frame as they arrive:
//!
//! - **Sticky validation**: a header is checked once. While its body is still arriving,
//!   the decoded header is kept and not re-verified on every recv.
//! - **Zero copy**: when one recv read exactly one message, that message is handed out as
//!   is and the buffer takes a fresh one from the pool for the next recv.
//!
//! # Invariant
//!
//! ```text
//! process_size ≤ advance_size ≤ receive_size ≤ MESSAGE_SIZE_MAX
//! ```
//!
//! - `process_size`: bytes of messages already handed out
//! - `advance_size`: bytes of complete messages that passed every check
//! - `receive_size`: bytes written by the kernel
//!
//! # Usage
//!
//! 1. [`recv_lend()`](MessageBuffer::recv_lend) and submit a recv at the returned offset
//! 2. [`recv_advance()`](MessageBuffer::recv_advance) with the message and byte count
//! 3. [`peek()`](MessageBuffer::peek) and [`consume()`](MessageBuffer::consume) until
//!    `peek` returns `None`
//! 4. If [`invalid`](MessageBuffer::invalid) is set, terminate the connection
//!
//! [`MESSAGE_SIZE_MAX`]: crate::constants::MESSAGE_SIZE_MAX

use crate::constants::{ClusterId, HEADER_SIZE_USIZE, MESSAGE_SIZE_MAX_USIZE};
use crate::message_pool::{Message, MessagePool};
use crate::vsr::wire::{Header, HeaderDecodeError};

/// Reasons why a MessageBuffer may be marked invalid.
///
/// Once set, the buffer stops validating and the connection should be terminated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvalidReason {
    /// The message header checksum failed verification.
    HeaderChecksum,

    /// The header size is below [`Header::SIZE_MIN`] or above [`Header::SIZE_MAX`].
    HeaderSize,

    /// The message header names a different cluster.
    HeaderCluster,

    /// The header checksum is valid but the command byte names no known command.
    HeaderCommand,

    /// The header checksum is valid but the operation byte names no known operation.
    HeaderOperation,

    /// The message body checksum failed verification.
    BodyChecksum,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum IteratorState {
    /// Ready to lend the buffer or start iterating.
    Idle,
    /// `peek()` returned a message; `consume()` must follow.
    AfterPeek,
}

pub struct MessageBuffer {
    pool: MessagePool,
    cluster: ClusterId,

    /// `None` while lent to a recv, or after the last message was handed out zero-copy.
    message: Option<Message>,
    lent: bool,

    process_size: usize,
    advance_size: usize,
    receive_size: usize,

    /// Header at `advance_size` that passed its checks while its body is incomplete.
    pending_header: Option<Header>,

    /// If set, the stream is corrupt and the connection should be terminated.
    ///
    /// Messages validated before the corruption are still returned by `peek()`.
    pub invalid: Option<InvalidReason>,

    iterator_state: IteratorState,
}

impl MessageBuffer {
    pub fn init(pool: &MessagePool, cluster: ClusterId) -> Self {
        Self {
            message: Some(pool.get_message()),
            pool: pool.clone(),
            cluster,
            lent: false,
            process_size: 0,
            advance_size: 0,
            receive_size: 0,
            pending_header: None,
            invalid: None,
            iterator_state: IteratorState::Idle,
        }
    }

    /// Lends the buffer for a recv, returning it with the offset to receive at.
    ///
    /// Messages already handed out are discarded first, moving any partial message to the
    /// front of the buffer.
    ///
    /// # Panics
    ///
    /// Panics during iteration, on an invalid buffer, or if the buffer is already lent.
    pub fn recv_lend(&mut self) -> (Message, usize) {
        assert_eq!(self.iterator_state, IteratorState::Idle);
        assert!(self.invalid.is_none());
        assert!(!self.lent);

        let mut message = match self.message.take() {
            Some(message) => message,
            None => {
                assert_eq!(self.receive_size, 0);
                self.pool.get_message()
            }
        };

        if self.process_size > 0 {
            message
                .buffer_mut()
                .copy_within(self.process_size..self.receive_size, 0);
            self.advance_size -= self.process_size;
            self.receive_size -= self.process_size;
            self.process_size = 0;
        }
        assert!(self.receive_size < MESSAGE_SIZE_MAX_USIZE);

        self.lent = true;
        (message, self.receive_size)
    }

    /// Takes the buffer back after the kernel wrote `size` bytes, and validates them.
    ///
    /// # Panics
    ///
    /// Panics if the buffer is not lent or `size` is zero or overflows the buffer.
    pub fn recv_advance(&mut self, message: Message, size: usize) {
        assert!(self.lent);
        assert!(self.message.is_none());
        assert_eq!(self.process_size, 0);
        assert!(size > 0);

        self.lent = false;
        self.message = Some(message);
        self.receive_size += size;
        assert!(self.receive_size <= MESSAGE_SIZE_MAX_USIZE);

        self.advance();
    }

    /// Header of the next validated message, or `None` once all are handed out.
    pub fn peek(&mut self) -> Option<Header> {
        assert_eq!(self.iterator_state, IteratorState::Idle);
        assert!(!self.lent);

        if self.process_size == self.advance_size {
            return None;
        }
        let bytes = self.bytes();
        let header = Header::from_bytes(&bytes[self.process_size..self.advance_size])
            .expect("validated header decodes");
        self.iterator_state = IteratorState::AfterPeek;
        Some(header)
    }

    /// Hands out the message returned by the last `peek()`.
    pub fn consume(&mut self) -> Message {
        assert_eq!(self.iterator_state, IteratorState::AfterPeek);
        self.iterator_state = IteratorState::Idle;

        let start = self.process_size;
        let size = Header::from_bytes(&self.bytes()[start..self.advance_size])
            .expect("validated header decodes")
            .total_len();
        self.process_size += size;
        assert!(self.process_size <= self.advance_size);

        if start == 0 && size == self.receive_size {
            // The buffer holds exactly this message.
            self.process_size = 0;
            self.advance_size = 0;
            self.receive_size = 0;
            return self.message.take().expect("buffer present while iterating");
        }

        let message = self.message.as_ref().expect("buffer present while iterating");
        let mut copy = self.pool.get_message();
        copy.buffer_mut()[..size].copy_from_slice(&message.buffer()[start..start + size]);
        copy
    }

    fn bytes(&self) -> &[u8] {
        self.message
            .as_ref()
            .map_or(&[][..], |message| &message.buffer()[..self.receive_size])
    }

    /// Validates complete messages past `advance_size`. Stops at the first partial message
    /// or sets `invalid` at the first corrupt one.
    fn advance(&mut self) {
        while self.invalid.is_none() {
            let start = self.advance_size;
            let available = self.receive_size - start;
            if available < HEADER_SIZE_USIZE {
                return;
            }

            let header = match self.pending_header.take() {
                Some(header) => header,
                None => match Self::check_header(&self.bytes()[start..], self.cluster) {
                    Ok(header) => header,
                    Err(reason) => {
                        self.invalid = Some(reason);
                        return;
                    }
                },
            };

            let size = header.total_len();
            if available < size {
                self.pending_header = Some(header);
                return;
            }

            let body = &self.bytes()[start + HEADER_SIZE_USIZE..start + size];
            if !header.is_valid_checksum_body(body) {
                self.invalid = Some(InvalidReason::BodyChecksum);
                return;
            }
            self.advance_size += size;
        }
    }

    fn check_header(data: &[u8], cluster: ClusterId) -> Result<Header, InvalidReason> {
        let checksum = u128::from_le_bytes(data[..16].try_into().expect("16 bytes"));
        if checksum != Header::calculate_checksum_of(data) {
            return Err(InvalidReason::HeaderChecksum);
        }

        let header = Header::from_bytes(data).map_err(|e| match e {
            HeaderDecodeError::Command(_) => InvalidReason::HeaderCommand,
            HeaderDecodeError::Operation(_) => InvalidReason::HeaderOperation,
        })?;
        if header.size < Header::SIZE_MIN || header.size > Header::SIZE_MAX {
            return Err(InvalidReason::HeaderSize);
        }
        if header.cluster != cluster {
            return Err(InvalidReason::HeaderCluster);
        }
        Ok(header)
    }
}

impl std::fmt::Debug for MessageBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageBuffer")
            .field("process_size", &self.process_size)
            .field("advance_size", &self.advance_size)
            .field("receive_size", &self.receive_size)
            .field("invalid", &self.invalid)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message_pool::MessageKind;
    use crate::vsr::wire::Command;
    use crate::vsr::wire::header::offset;

    fn framed(cluster: u32, body: &[u8]) -> Vec<u8> {
        let mut header = Header::new(Command::Pong, cluster);
        header.size = (HEADER_SIZE_USIZE + body.len()) as i32;
        header.set_checksum_body(body);
        header.set_checksum();
        let mut bytes = header.to_bytes().to_vec();
        bytes.extend_from_slice(body);
        bytes
    }

    /// Recomputes the header checksum over whatever the header bytes now hold.
    fn reseal(bytes: &mut [u8]) {
        let checksum = Header::calculate_checksum_of(bytes);
        bytes[..16].copy_from_slice(&checksum.to_le_bytes());
    }

    /// Delivers `data` as one recv.
    fn receive(buffer: &mut MessageBuffer, data: &[u8]) {
        let (mut message, offset) = buffer.recv_lend();
        message.buffer_mut()[offset..offset + data.len()].copy_from_slice(data);
        buffer.recv_advance(message, data.len());
    }

    fn drain(buffer: &mut MessageBuffer) -> Vec<Message> {
        let mut messages = Vec::new();
        while buffer.peek().is_some() {
            messages.push(buffer.consume());
        }
        messages
    }

    #[test]
    fn waits_for_full_header_then_full_body() {
        let pool = MessagePool::new(4, 0);
        let mut buffer = MessageBuffer::init(&pool, 7);
        let bytes = framed(7, b"abcdefgh");

        receive(&mut buffer, &bytes[..100]);
        assert!(buffer.peek().is_none());
        assert!(buffer.pending_header.is_none());

        receive(&mut buffer, &bytes[100..130]);
        assert!(buffer.peek().is_none());
        assert!(buffer.pending_header.is_some(), "header checked while body is pending");

        receive(&mut buffer, &bytes[130..]);
        assert!(buffer.pending_header.is_none());
        let messages = drain(&mut buffer);
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].as_bytes(), &bytes[..]);
        assert!(buffer.invalid.is_none());
    }

    #[test]
    fn single_message_recv_is_handed_out_without_copy() {
        let pool = MessagePool::new(4, 0);
        let mut buffer = MessageBuffer::init(&pool, 1);
        let bytes = framed(1, b"body");

        let (mut message, offset) = buffer.recv_lend();
        assert_eq!(offset, 0);
        message.buffer_mut()[..bytes.len()].copy_from_slice(&bytes);
        let lent = message.clone();
        buffer.recv_advance(message, bytes.len());

        assert!(buffer.peek().is_some());
        let delivered = buffer.consume();
        assert!(delivered.same_buffer(&lent));
        assert!(buffer.peek().is_none());

        // The next recv starts on a fresh buffer.
        let (next, offset) = buffer.recv_lend();
        assert_eq!(offset, 0);
        assert!(!next.same_buffer(&lent));
    }

    #[test]
    fn partial_tail_moves_to_the_front() {
        let pool = MessagePool::new(4, 0);
        let mut buffer = MessageBuffer::init(&pool, 3);
        let first = framed(3, b"first");
        let second = framed(3, b"second message");

        let mut bytes = first.clone();
        bytes.extend_from_slice(&second[..40]);
        receive(&mut buffer, &bytes);

        let messages = drain(&mut buffer);
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].as_bytes(), &first[..]);

        let (message, offset) = buffer.recv_lend();
        assert_eq!(offset, 40);
        assert_eq!(&message.buffer()[..40], &second[..40]);
        let mut message = message;
        message.buffer_mut()[40..second.len()].copy_from_slice(&second[40..]);
        buffer.recv_advance(message, second.len() - 40);

        let messages = drain(&mut buffer);
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].as_bytes(), &second[..]);
    }

    #[test]
    fn rejects_corrupt_header_checksum() {
        let pool = MessagePool::new(2, 0);
        let mut buffer = MessageBuffer::init(&pool, 7);
        let mut bytes = framed(7, b"body");
        bytes[90] ^= 1;

        receive(&mut buffer, &bytes);
        assert!(buffer.peek().is_none());
        assert_eq!(buffer.invalid, Some(InvalidReason::HeaderChecksum));
    }

    #[test]
    fn rejects_foreign_cluster() {
        let pool = MessagePool::new(2, 0);
        let mut buffer = MessageBuffer::init(&pool, 7);

        receive(&mut buffer, &framed(8, b"body"));
        assert_eq!(buffer.invalid, Some(InvalidReason::HeaderCluster));
    }

    #[test]
    fn rejects_corrupt_body() {
        let pool = MessagePool::new(2, 0);
        let mut buffer = MessageBuffer::init(&pool, 7);
        let mut bytes = framed(7, b"body");
        let last = bytes.len() - 1;
        bytes[last] ^= 1;

        receive(&mut buffer, &bytes);
        assert_eq!(buffer.invalid, Some(InvalidReason::BodyChecksum));
    }

    #[test]
    fn rejects_size_out_of_bounds_behind_a_valid_checksum() {
        for size in [Header::SIZE_MIN - 1, Header::SIZE_MAX + 1, -1] {
            let pool = MessagePool::new(2, 0);
            let mut buffer = MessageBuffer::init(&pool, 7);
            let mut bytes = framed(7, &[]);
            bytes[offset::SIZE..offset::SIZE + 4].copy_from_slice(&size.to_le_bytes());
            reseal(&mut bytes);

            receive(&mut buffer, &bytes);
            assert!(buffer.peek().is_none());
            assert_eq!(buffer.invalid, Some(InvalidReason::HeaderSize), "size {size}");
        }
    }

    #[test]
    fn rejects_unknown_command_behind_a_valid_checksum() {
        let pool = MessagePool::new(2, 0);
        let mut buffer = MessageBuffer::init(&pool, 7);
        let mut bytes = framed(7, &[]);
        bytes[offset::COMMAND] = 200;
        reseal(&mut bytes);

        receive(&mut buffer, &bytes);
        assert!(buffer.peek().is_none());
        assert_eq!(buffer.invalid, Some(InvalidReason::HeaderCommand));
    }

    #[test]
    fn messages_before_corruption_are_still_delivered() {
        let pool = MessagePool::new(4, 0);
        let mut buffer = MessageBuffer::init(&pool, 5);
        let good = framed(5, b"good");
        let mut bytes = good.clone();
        bytes.extend_from_slice(&[0xAB; HEADER_SIZE_USIZE]);

        receive(&mut buffer, &bytes);
        assert_eq!(buffer.invalid, Some(InvalidReason::HeaderChecksum));
        let messages = drain(&mut buffer);
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].as_bytes(), &good[..]);
    }

    #[test]
    fn copied_messages_return_to_the_pool() {
        let pool = MessagePool::new(4, 0);
        let mut buffer = MessageBuffer::init(&pool, 2);
        let mut bytes = framed(2, b"a");
        bytes.extend(framed(2, b"bb"));

        receive(&mut buffer, &bytes);
        let messages = drain(&mut buffer);
        assert_eq!(messages.len(), 2);
        assert_eq!(pool.free_count(MessageKind::Full), 1);

        drop(messages);
        drop(buffer);
        assert_eq!(pool.free_count(MessageKind::Full), 4);
    }
}
