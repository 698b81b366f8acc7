//! Reference-counted message buffers drawn from a preallocated pool.
//!
//! # Design Decisions
//!
//! A [`Message`] is a handle to a pooled buffer. Cloning the handle takes a reference,
//! dropping it releases one; when the last handle goes away the buffer returns to the
//! free list of its kind (full or header-only). Buffers are allocated once and reused
//! without being cleared, so only the header is reset on acquire.
//!
//! Mutation goes through `Rc::get_mut`: a message can be written only while exactly one
//! handle exists, so a buffer sitting in a send queue can never change under the reader.
//!
//! When a free list is empty the pool hands out a transient buffer instead of failing.
//! The event is logged and the buffer is freed, not pooled, on release.

use std::{
    cell::{Cell, RefCell},
    ops::{Deref, DerefMut},
    rc::Rc,
};

use tracing::warn;

use crate::{
    constants::{self, HEADER_SIZE_USIZE, MESSAGE_SIZE_MAX_PADDED_USIZE},
    vsr::wire::{Command, Header},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    /// Large enough for any message plus one sector of padding.
    Full,
    /// Holds exactly one header; used for control traffic such as pings.
    HeaderOnly,
}

impl MessageKind {
    #[inline]
    pub const fn buffer_len(self) -> usize {
        match self {
            Self::Full => MESSAGE_SIZE_MAX_PADDED_USIZE,
            Self::HeaderOnly => HEADER_SIZE_USIZE,
        }
    }
}

struct Buffer {
    kind: MessageKind,
    pooled: bool,
    bytes: Box<[u8]>,
}

impl Buffer {
    fn allocate(kind: MessageKind, pooled: bool) -> Rc<Self> {
        Rc::new(Self {
            kind,
            pooled,
            bytes: vec![0u8; kind.buffer_len()].into_boxed_slice(),
        })
    }
}

struct MessagePoolInner {
    free_messages: RefCell<Vec<Rc<Buffer>>>,
    free_headers: RefCell<Vec<Rc<Buffer>>>,
    messages_max: usize,
    headers_max: usize,
    transient: Cell<u64>,
}

impl MessagePoolInner {
    fn free_list(&self, kind: MessageKind) -> &RefCell<Vec<Rc<Buffer>>> {
        match kind {
            MessageKind::Full => &self.free_messages,
            MessageKind::HeaderOnly => &self.free_headers,
        }
    }

    fn release(&self, buffer: Rc<Buffer>) {
        assert!(buffer.pooled);

        let mut free = self.free_list(buffer.kind).borrow_mut();
        let max = match buffer.kind {
            MessageKind::Full => self.messages_max,
            MessageKind::HeaderOnly => self.headers_max,
        };
        assert!(free.len() < max, "release of a message the pool never handed out");
        assert!(
            !free.iter().any(|b| Rc::ptr_eq(b, &buffer)),
            "message released twice"
        );
        free.push(buffer);
    }
}

/// Shared handle to the pool. Clones refer to the same free lists.
#[derive(Clone)]
pub struct MessagePool(Rc<MessagePoolInner>);

impl MessagePool {
    pub fn new(messages_max: usize, headers_max: usize) -> Self {
        let free_messages = (0..messages_max)
            .map(|_| Buffer::allocate(MessageKind::Full, true))
            .collect();
        let free_headers = (0..headers_max)
            .map(|_| Buffer::allocate(MessageKind::HeaderOnly, true))
            .collect();

        Self(Rc::new(MessagePoolInner {
            free_messages: RefCell::new(free_messages),
            free_headers: RefCell::new(free_headers),
            messages_max,
            headers_max,
            transient: Cell::new(0),
        }))
    }

    /// Pool sized for a client: the message bus plus one buffer per queued request.
    pub fn for_client() -> Self {
        Self::new(
            constants::MESSAGE_BUS_MESSAGES_MAX + constants::PIPELINING_MAX,
            constants::MESSAGE_BUS_HEADERS_MAX,
        )
    }

    /// Acquires a full-size message with a reset header and reference count 1.
    pub fn get_message(&self) -> Message {
        self.acquire(MessageKind::Full)
    }

    /// Acquires a header-only message with a reset header and reference count 1.
    pub fn get_header_only_message(&self) -> Message {
        self.acquire(MessageKind::HeaderOnly)
    }

    fn acquire(&self, kind: MessageKind) -> Message {
        let pooled = self.0.free_list(kind).borrow_mut().pop();
        let buffer = match pooled {
            Some(buffer) => buffer,
            None => {
                let transient = self.0.transient.get() + 1;
                self.0.transient.set(transient);
                warn!(?kind, transient, "message pool exhausted; allocating transient message");
                Buffer::allocate(kind, false)
            }
        };
        assert!(Rc::strong_count(&buffer) == 1);

        let mut message = Message {
            buffer,
            pool: Rc::clone(&self.0),
        };
        message.set_header(&Header::new(Command::Reserved, 0));
        assert!(message.is_unique());
        message
    }

    #[inline]
    pub fn free_count(&self, kind: MessageKind) -> usize {
        self.0.free_list(kind).borrow().len()
    }

    /// Number of transient messages allocated because a free list was empty.
    #[inline]
    pub fn transient_count(&self) -> u64 {
        self.0.transient.get()
    }
}

/// Counted reference to a pooled buffer.
pub struct Message {
    buffer: Rc<Buffer>,
    pool: Rc<MessagePoolInner>,
}

impl Clone for Message {
    fn clone(&self) -> Self {
        Self {
            buffer: Rc::clone(&self.buffer),
            pool: Rc::clone(&self.pool),
        }
    }
}

impl Drop for Message {
    fn drop(&mut self) {
        if Rc::strong_count(&self.buffer) == 1 && self.buffer.pooled {
            self.pool.release(Rc::clone(&self.buffer));
        }
    }
}

impl core::fmt::Debug for Message {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Message")
            .field("kind", &self.buffer.kind)
            .field("references", &self.references())
            .field("header", &Header::from_bytes(&self.buffer.bytes))
            .finish()
    }
}

impl Message {
    #[inline]
    pub fn kind(&self) -> MessageKind {
        self.buffer.kind
    }

    #[inline]
    pub fn references(&self) -> usize {
        Rc::strong_count(&self.buffer)
    }

    #[inline]
    pub fn is_unique(&self) -> bool {
        self.references() == 1
    }

    /// True if both handles refer to the same buffer.
    #[inline]
    pub fn same_buffer(&self, other: &Message) -> bool {
        Rc::ptr_eq(&self.buffer, &other.buffer)
    }

    /// Whole buffer, including bytes past `size`.
    #[inline]
    pub fn buffer(&self) -> &[u8] {
        &self.buffer.bytes
    }

    #[inline]
    pub fn try_buffer_mut(&mut self) -> Option<&mut [u8]> {
        Rc::get_mut(&mut self.buffer).map(|b| &mut b.bytes[..])
    }

    #[inline]
    pub fn buffer_mut(&mut self) -> &mut [u8] {
        self.try_buffer_mut()
            .expect("message is shared; cannot mutably borrow buffer")
    }

    /// Decodes the header at the front of the buffer.
    ///
    /// # Panics
    ///
    /// Panics if the header bytes do not decode. Every buffer handed out carries a header
    /// written by [`Self::set_header`] or one that was validated on receipt.
    pub fn header(&self) -> Header {
        Header::from_bytes(&self.buffer.bytes).expect("message header must decode")
    }

    pub fn set_header(&mut self, header: &Header) {
        let len = self.buffer.bytes.len();
        assert!(header.size >= Header::SIZE_MIN);
        assert!(header.size as usize <= len);
        header.write_to(self.buffer_mut());
    }

    /// Mutable view of the header, written back to the buffer when the guard drops.
    pub fn header_mut(&mut self) -> HeaderMut<'_> {
        assert!(self.is_unique(), "message is shared; cannot mutably borrow header");
        let header = self.header();
        HeaderMut {
            message: self,
            header,
        }
    }

    /// Bytes `[0, size)`: the wire image of the message.
    #[inline]
    pub fn as_bytes(&self) -> &[u8] {
        let size = self.header().total_len();
        &self.buffer.bytes[..size]
    }

    #[inline]
    pub fn body(&self) -> &[u8] {
        let size = self.header().total_len();
        &self.buffer.bytes[HEADER_SIZE_USIZE..size]
    }

    /// Copies raw body bytes after the header and updates `size`.
    ///
    /// # Panics
    ///
    /// Panics if the body does not fit this message kind or the message is shared.
    pub fn set_body(&mut self, body: &[u8]) {
        let size = HEADER_SIZE_USIZE + body.len();
        assert!(size <= constants::MESSAGE_SIZE_MAX_USIZE);
        assert!(size <= self.buffer.bytes.len(), "body does not fit message buffer");

        self.buffer_mut()[HEADER_SIZE_USIZE..size].copy_from_slice(body);
        self.header_mut().size = size as i32;
    }

    /// Sets the body checksum and then the header checksum.
    pub fn set_checksums(&mut self) {
        let mut header = self.header();
        header.set_checksum_body(self.body());
        header.set_checksum();
        self.set_header(&header);
    }
}

/// Write-back guard returned by [`Message::header_mut`].
pub struct HeaderMut<'a> {
    message: &'a mut Message,
    header: Header,
}

impl Deref for HeaderMut<'_> {
    type Target = Header;

    fn deref(&self) -> &Header {
        &self.header
    }
}

impl DerefMut for HeaderMut<'_> {
    fn deref_mut(&mut self) -> &mut Header {
        &mut self.header
    }
}

impl Drop for HeaderMut<'_> {
    fn drop(&mut self) {
        let header = self.header;
        self.message.set_header(&header);
    }
}

#[cfg(test)]
#[path = "message_pool_tests.rs"]
mod tests;
