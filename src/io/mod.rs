//! Completion-based socket I/O.
//!
//! Targets Linux `io_uring`, with a `poll(2)` readiness backend on macOS and on Linux
//! kernels where `io_uring` cannot be set up (too old, or blocked by a seccomp profile).
//!
//! The API is split into:
//! - [`IoBackend`]: push raw operations, flush them to the kernel, drain results
//! - [`Operation`]: timeout/connect/send/recv description that owns its buffer
//! - [`Completion`]: a finished operation handed back by [`IoCore::drain`]
//!
//! Callers submit an [`Operation`] tagged with a `user_data` word, advance the queue with
//! [`IoCore::tick`] or [`IoCore::run_for`], then drain finished completions. Every submitted
//! operation produces exactly one completion; nothing is cancelled in flight.
//!
//! # Ownership
//!
//! `Send` and `Recv` carry the [`Message`] they transfer. [`IoCore`] keeps the operation
//! until its completion is drained, so the buffer stays alive for as long as the kernel may
//! touch it. A `Recv` message must be uniquely held by the operation.

mod backend_poll;
mod io_core;
mod socket;

#[cfg(target_os = "linux")]
mod backend_linux;

#[cfg(not(any(target_os = "linux", target_os = "macos")))]
compile_error!("This I/O layer currently supports only Linux and macOS.");

use std::io;
use std::net::SocketAddr;
use std::os::unix::io::RawFd;
use std::ptr::NonNull;
use std::time::{Duration, Instant};

use crate::constants::MESSAGE_SIZE_MAX_USIZE;
use crate::message_pool::Message;

pub use backend_poll::PollBackend;
pub use io_core::IoCore;
pub use socket::{close, open_socket, shutdown};

#[cfg(target_os = "linux")]
pub use backend_linux::{SystemBackend, UringBackend};
#[cfg(target_os = "macos")]
pub type SystemBackend = PollBackend;

/// Platform-specific I/O instance. Use this type alias for portable code.
pub type Io = IoCore<SystemBackend>;

/// Backend abstraction for platform-specific async I/O.
///
/// Callers queue operations, flush them to the kernel, then drain completions.
pub trait IoBackend {
    /// Minimum supported entries for this backend.
    const ENTRIES_MIN: u32;
    /// Maximum supported entries for this backend (inclusive).
    const ENTRIES_MAX: u32;

    /// Initialize the backend with a fixed queue depth.
    fn new(entries: u32) -> io::Result<Self>
    where
        Self: Sized;

    /// Queue an operation for submission.
    ///
    /// # Safety
    ///
    /// - `op` must describe memory that stays valid until its completion is drained
    /// - `user_data` must be nonzero and unique among in-flight operations
    ///
    /// Returns `Err(())` if the submission queue is full; caller should flush and retry.
    unsafe fn try_push(&mut self, op: &RawOperation, user_data: u64) -> Result<(), ()>;

    /// Submit queued operations to the kernel, then wait up to `wait` for at least one
    /// completion. A zero `wait` never blocks.
    fn flush(&mut self, wait: Duration) -> io::Result<()>;

    /// Process all available completions without blocking.
    ///
    /// Invokes `f(user_data, result)` for each completion, where `result` is
    /// the byte count on success or a negated errno on failure.
    fn drain<F: FnMut(u64, i32)>(&mut self, f: F);
}

/// Lifecycle of a submitted operation.
/// State machine: `Queued -> Submitted -> (completion)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletionState {
    /// Accepted by [`IoCore::submit`], waiting for room in the backend.
    Queued,
    /// Pushed to the backend, awaiting completion.
    Submitted,
}

/// Describes an I/O operation.
#[derive(Debug)]
pub enum Operation {
    /// Completes with `Ok(0)` once `deadline` has passed.
    Timeout { deadline: Instant },
    /// Connects `fd` to `address`; completes with `Ok(0)` when established.
    Connect { fd: RawFd, address: SocketAddr },
    /// Sends `message.as_bytes()[offset..len]`; completes with the count written.
    Send {
        fd: RawFd,
        message: Message,
        offset: usize,
        len: usize,
    },
    /// Receives into `message.buffer_mut()[offset..MESSAGE_SIZE_MAX]`; completes with the
    /// count read, where zero means the peer closed the stream.
    Recv {
        fd: RawFd,
        message: Message,
        offset: usize,
    },
}

impl Operation {
    pub fn timeout(after: Duration) -> Self {
        Operation::Timeout {
            deadline: Instant::now() + after,
        }
    }

    /// Panics on a malformed operation.
    pub fn validate(&self) {
        match self {
            Operation::Timeout { .. } => {}
            Operation::Connect { fd, .. } => assert!(*fd >= 0),
            Operation::Send {
                fd,
                message,
                offset,
                len,
            } => {
                assert!(*fd >= 0);
                assert!(offset < len, "empty send");
                assert!(*len <= message.buffer().len());
            }
            Operation::Recv {
                fd,
                message,
                offset,
            } => {
                assert!(*fd >= 0);
                assert!(*offset < MESSAGE_SIZE_MAX_USIZE, "recv buffer is full");
                assert!(message.buffer().len() >= MESSAGE_SIZE_MAX_USIZE);
                assert!(message.is_unique(), "recv message must not be shared");
            }
        }
    }

    /// Kernel-facing view of this operation. The pointers stay valid for as long as
    /// `self` is neither moved out of nor dropped, since message buffers are heap owned.
    fn raw(&mut self) -> RawOperation {
        match self {
            Operation::Timeout { deadline } => RawOperation::Timeout {
                deadline: *deadline,
            },
            Operation::Connect { fd, address } => RawOperation::Connect {
                fd: *fd,
                address: *address,
            },
            Operation::Send {
                fd,
                message,
                offset,
                len,
            } => {
                let bytes = &message.buffer()[*offset..*len];
                RawOperation::Send {
                    fd: *fd,
                    buf: NonNull::from(bytes).cast(),
                    len: bytes.len() as u32,
                }
            }
            Operation::Recv {
                fd,
                message,
                offset,
            } => {
                let bytes = &mut message.buffer_mut()[*offset..MESSAGE_SIZE_MAX_USIZE];
                let len = bytes.len() as u32;
                RawOperation::Recv {
                    fd: *fd,
                    buf: NonNull::from(bytes).cast(),
                    len,
                }
            }
        }
    }
}

/// An [`Operation`] reduced to descriptors and raw pointers for a backend.
///
/// # Buffer Ownership
///
/// `Send` and `Recv` point into a message owned by the [`IoCore`] slot of the operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RawOperation {
    Timeout { deadline: Instant },
    Connect { fd: RawFd, address: SocketAddr },
    Send { fd: RawFd, buf: NonNull<u8>, len: u32 },
    Recv { fd: RawFd, buf: NonNull<u8>, len: u32 },
}

/// A finished operation, returned by [`IoCore::drain`].
#[derive(Debug)]
pub struct Completion {
    pub user_data: u64,
    pub operation: Operation,
    pub result: io::Result<usize>,
}
