//! Backend-independent completion queue.

use std::collections::VecDeque;
use std::io;
use std::mem;
use std::time::{Duration, Instant};

use tracing::{trace, warn};

use super::{Completion, CompletionState, IoBackend, Operation};
use crate::constants::IO_ENTRIES;

/// How long a dropped queue waits for socket operations to hand back their buffers.
const DROP_GRACE: Duration = Duration::from_millis(100);

struct Submission {
    user_data: u64,
    operation: Operation,
    state: CompletionState,
}

/// Manages I/O submission and completion.
///
/// Wraps a platform-specific [`IoBackend`] and queues locally when the backend is full.
/// Each operation lives in a slot until its completion is drained; the backend sees the
/// slot number (plus one) as its `user_data`.
///
/// # Invariants
///
/// - `inflight` counts slots in `Submitted`; `overflow` holds the `Queued` ones
/// - `inflight + overflow.len() + completed.len()` never exceeds `entries`
pub struct IoCore<B: IoBackend> {
    backend: B,
    slots: Vec<Option<Submission>>,
    free_slots: Vec<u32>,
    /// Slots waiting for backend capacity, in submission order.
    overflow: VecDeque<u32>,
    /// Count of operations submitted to the backend but not yet completed.
    inflight: u32,
    completed: VecDeque<Completion>,

    // Metrics.
    total_submitted: u64,
    total_completed: u64,
}

impl<B: IoBackend> IoCore<B> {
    /// Creates a new I/O core with the specified queue depth.
    ///
    /// # Panics
    ///
    /// Panics if `entries` is outside `[ENTRIES_MIN, ENTRIES_MAX]` or not a power of two.
    pub fn new(entries: u32) -> io::Result<Self> {
        assert!(entries >= B::ENTRIES_MIN);
        assert!(entries <= B::ENTRIES_MAX);
        assert!(entries.is_power_of_two());

        Ok(Self {
            backend: B::new(entries)?,
            slots: (0..entries).map(|_| None).collect(),
            free_slots: (0..entries).rev().collect(),
            overflow: VecDeque::new(),
            inflight: 0,
            completed: VecDeque::with_capacity(entries as usize),
            total_submitted: 0,
            total_completed: 0,
        })
    }

    pub fn for_client() -> io::Result<Self> {
        Self::new(IO_ENTRIES)
    }

    /// Operations submitted but not yet drained.
    #[inline]
    pub fn in_flight(&self) -> usize {
        self.slots.len() - self.free_slots.len() + self.completed.len()
    }

    /// Returns `true` if no operations are in flight, queued, or waiting to be drained.
    #[inline]
    pub fn is_idle(&self) -> bool {
        self.in_flight() == 0
    }

    /// Queues `operation`.
    ///
    /// # Panics
    ///
    /// Panics when all entries are in use or the operation is malformed.
    pub fn submit(&mut self, user_data: u64, operation: Operation) {
        assert!(self.in_flight() < self.slots.len(), "io entries exhausted");
        operation.validate();
        let slot = self.free_slots.pop().expect("free slot below the entry limit");
        let old = self.slots[slot as usize].replace(Submission {
            user_data,
            operation,
            state: CompletionState::Queued,
        });
        assert!(old.is_none());
        self.total_submitted += 1;

        if self.overflow.is_empty() && self.try_submit_one(slot).is_ok() {
            self.set_submitted(slot);
        } else {
            self.overflow.push_back(slot);
        }
    }

    /// Performs every operation that can make progress without blocking.
    pub fn tick(&mut self) -> io::Result<()> {
        self.flush(Duration::ZERO)
    }

    /// Waits up to `budget` for at least one operation to complete, then reaps everything
    /// that is ready.
    pub fn run_for(&mut self, budget: Duration) -> io::Result<()> {
        self.flush(budget)
    }

    /// Takes all finished operations in completion order.
    pub fn drain(&mut self) -> impl Iterator<Item = Completion> + '_ {
        self.completed.drain(..)
    }

    fn flush(&mut self, wait: Duration) -> io::Result<()> {
        let old_completed = self.total_completed;

        self.fill_from_overflow();
        let wait = if self.completed.is_empty() {
            wait
        } else {
            Duration::ZERO
        };
        self.backend.flush(wait)?;
        let reaped = self.drain_completions();

        assert!(self.total_completed == old_completed + reaped as u64);
        Ok(())
    }

    /// Pushes the operation in `slot` to the backend. Does not update state.
    fn try_submit_one(&mut self, slot: u32) -> Result<(), ()> {
        let submission = self.slots[slot as usize]
            .as_mut()
            .expect("submitted slot holds an operation");
        let raw = submission.operation.raw();
        // SAFETY: the operation, and with it any buffer `raw` points into, stays in its
        // slot until the backend reports the completion.
        unsafe { self.backend.try_push(&raw, slot as u64 + 1) }
    }

    fn set_submitted(&mut self, slot: u32) {
        let submission = self.slots[slot as usize]
            .as_mut()
            .expect("submitted slot holds an operation");
        assert!(submission.state == CompletionState::Queued);
        submission.state = CompletionState::Submitted;
        self.inflight += 1;
    }

    /// Submits overflowed operations until the backend is full or the queue is empty.
    fn fill_from_overflow(&mut self) {
        while let Some(&slot) = self.overflow.front() {
            if self.try_submit_one(slot).is_err() {
                // Backend is full; keep FIFO order and retry on the next flush.
                break;
            }
            self.overflow.pop_front();
            self.set_submitted(slot);
        }
    }

    /// Reaps all available completions from the backend and returns the count.
    fn drain_completions(&mut self) -> u32 {
        let mut reaped: u32 = 0;
        let slots = &mut self.slots;
        let free_slots = &mut self.free_slots;
        let completed = &mut self.completed;

        self.backend.drain(|user_data, result| {
            assert!(user_data != 0);
            let slot = (user_data - 1) as u32;
            let submission = slots[slot as usize]
                .take()
                .expect("completion for an empty slot");
            assert!(submission.state == CompletionState::Submitted);
            free_slots.push(slot);

            let result = match (&submission.operation, result) {
                // An expired io_uring timeout reports -ETIME.
                (Operation::Timeout { .. }, result) if result == -libc::ETIME => Ok(0),
                (_, result) if result < 0 => Err(io::Error::from_raw_os_error(-result)),
                (_, result) => Ok(result as usize),
            };
            trace!(
                user_data = submission.user_data,
                ok = result.is_ok(),
                "io completed"
            );
            completed.push_back(Completion {
                user_data: submission.user_data,
                operation: submission.operation,
                result,
            });
            reaped += 1;
        });

        assert!(reaped <= self.inflight);
        self.inflight -= reaped;
        self.total_completed += reaped as u64;
        reaped
    }
}

impl<B: IoBackend> IoCore<B> {
    /// Whether a submitted operation still points the kernel at a message buffer.
    fn holds_buffers(&self) -> bool {
        self.slots.iter().flatten().any(|submission| {
            submission.state == CompletionState::Submitted
                && matches!(
                    submission.operation,
                    Operation::Send { .. } | Operation::Recv { .. }
                )
        })
    }
}

impl<B: IoBackend> Drop for IoCore<B> {
    fn drop(&mut self) {
        // Queued operations never reached the backend.
        for slot in self.overflow.drain(..) {
            self.slots[slot as usize] = None;
            self.free_slots.push(slot);
        }
        self.completed.clear();

        // Sockets are shut down or closed by now, so their operations finish promptly.
        let deadline = Instant::now() + DROP_GRACE;
        while self.holds_buffers() {
            let now = Instant::now();
            if now >= deadline || self.flush(deadline - now).is_err() {
                break;
            }
            self.completed.clear();
        }

        if self.is_idle() {
            return;
        }
        warn!(inflight = self.inflight, "io dropped with operations in flight");
        // The kernel may still write into these buffers; leak them instead of freeing.
        for submission in self.slots.iter_mut().filter_map(Option::take) {
            mem::forget(submission.operation);
        }
    }
}

impl<B: IoBackend> std::fmt::Debug for IoCore<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IoCore")
            .field("entries", &self.slots.len())
            .field("inflight", &self.inflight)
            .field("overflow", &self.overflow.len())
            .field("completed", &self.completed.len())
            .field("total_submitted", &self.total_submitted)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::{PollBackend, close, open_socket};
    use crate::message_pool::MessagePool;
    use std::io::{Read, Write};
    use crate::io::shutdown;
    use crate::message_pool::MessageKind;
    use std::net::TcpListener;

    fn run_until_complete<B: IoBackend>(io: &mut IoCore<B>) -> Completion {
        for _ in 0..500 {
            io.run_for(Duration::from_millis(10)).expect("io");
            if let Some(completion) = io.drain().next() {
                return completion;
            }
        }
        panic!("operation did not complete");
    }

    fn timeout_completes_after_deadline<B: IoBackend>(mut io: IoCore<B>) {
        let start = Instant::now();
        io.submit(7, Operation::timeout(Duration::from_millis(20)));

        io.tick().expect("tick");
        assert_eq!(io.drain().count(), 0);

        let completion = run_until_complete(&mut io);
        assert_eq!(completion.user_data, 7);
        assert_eq!(completion.result.expect("timeout"), 0);
        assert!(start.elapsed() >= Duration::from_millis(20));
        assert!(io.is_idle());
    }

    fn connect_send_recv_over_loopback<B: IoBackend>(mut io: IoCore<B>) {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
        let address = listener.local_addr().expect("addr");
        let pool = MessagePool::new(3, 0);

        let fd = open_socket(&address).expect("socket");
        io.submit(1, Operation::Connect { fd, address });
        let completion = run_until_complete(&mut io);
        assert_eq!(completion.user_data, 1);
        completion.result.expect("connect");
        let (mut peer, _) = listener.accept().expect("accept");

        let mut message = pool.get_message();
        message.buffer_mut()[..5].copy_from_slice(b"hello");
        io.submit(
            2,
            Operation::Send {
                fd,
                message,
                offset: 0,
                len: 5,
            },
        );
        let completion = run_until_complete(&mut io);
        assert_eq!(completion.result.expect("send"), 5);
        let mut got = [0u8; 5];
        peer.read_exact(&mut got).expect("read");
        assert_eq!(&got, b"hello");

        peer.write_all(b"world").expect("write");
        io.submit(
            3,
            Operation::Recv {
                fd,
                message: pool.get_message(),
                offset: 0,
            },
        );
        let completion = run_until_complete(&mut io);
        let n = completion.result.as_ref().copied().expect("recv");
        assert_eq!(n, 5);
        match completion.operation {
            Operation::Recv { message, .. } => assert_eq!(&message.buffer()[..5], b"world"),
            other => panic!("unexpected operation {other:?}"),
        }

        drop(peer);
        io.submit(
            4,
            Operation::Recv {
                fd,
                message: pool.get_message(),
                offset: 0,
            },
        );
        let completion = run_until_complete(&mut io);
        assert_eq!(completion.result.expect("eof"), 0);
        assert!(io.is_idle());

        close(fd);
    }

    fn connect_refused_completes_with_error<B: IoBackend>(mut io: IoCore<B>) {
        // Bind then drop to find a port with nothing listening.
        let address = TcpListener::bind("127.0.0.1:0")
            .expect("bind")
            .local_addr()
            .expect("addr");
        let fd = open_socket(&address).expect("socket");
        io.submit(9, Operation::Connect { fd, address });

        let completion = run_until_complete(&mut io);
        assert_eq!(completion.user_data, 9);
        assert!(completion.result.is_err());
        close(fd);
    }

    fn drop_waits_for_recv_on_a_shut_down_socket<B: IoBackend>(mut io: IoCore<B>) {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
        let address = listener.local_addr().expect("addr");
        let pool = MessagePool::new(1, 0);

        let fd = open_socket(&address).expect("socket");
        io.submit(1, Operation::Connect { fd, address });
        run_until_complete(&mut io).result.expect("connect");
        let (_peer, _) = listener.accept().expect("accept");

        io.submit(
            2,
            Operation::Recv {
                fd,
                message: pool.get_message(),
                offset: 0,
            },
        );
        io.tick().expect("tick");
        assert_eq!(pool.free_count(MessageKind::Full), 0);

        shutdown(fd).expect("shutdown");
        drop(io);
        assert_eq!(pool.free_count(MessageKind::Full), 1, "recv buffer came back");
        close(fd);
    }

    fn poll(entries: u32) -> IoCore<PollBackend> {
        IoCore::new(entries).expect("poll backend")
    }

    #[test]
    fn poll_timeout_completes_after_deadline() {
        timeout_completes_after_deadline(poll(4));
    }

    #[test]
    fn poll_connect_send_recv_over_loopback() {
        connect_send_recv_over_loopback(poll(8));
    }

    #[test]
    fn poll_connect_refused_completes_with_error() {
        connect_refused_completes_with_error(poll(2));
    }

    #[test]
    fn poll_drop_waits_for_recv_on_a_shut_down_socket() {
        drop_waits_for_recv_on_a_shut_down_socket(poll(4));
    }

    #[test]
    #[should_panic(expected = "io entries exhausted")]
    fn submit_beyond_entries_panics() {
        let mut io = poll(1);
        io.submit(1, Operation::timeout(Duration::from_secs(1)));
        io.submit(2, Operation::timeout(Duration::from_secs(1)));
    }

    #[cfg(target_os = "linux")]
    mod uring {
        use super::*;
        use crate::io::UringBackend;

        /// `None` where the kernel or a seccomp profile refuses io_uring.
        fn uring(entries: u32) -> Option<IoCore<UringBackend>> {
            match IoCore::new(entries) {
                Ok(io) => Some(io),
                Err(error) => {
                    eprintln!("io_uring unavailable, skipping: {error}");
                    None
                }
            }
        }

        #[test]
        fn uring_timeout_completes_after_deadline() {
            if let Some(io) = uring(4) {
                timeout_completes_after_deadline(io);
            }
        }

        #[test]
        fn uring_connect_send_recv_over_loopback() {
            if let Some(io) = uring(8) {
                connect_send_recv_over_loopback(io);
            }
        }

        #[test]
        fn uring_connect_refused_completes_with_error() {
            if let Some(io) = uring(2) {
                connect_refused_completes_with_error(io);
            }
        }

        #[test]
        fn uring_drop_waits_for_recv_on_a_shut_down_socket() {
            if let Some(io) = uring(4) {
                drop_waits_for_recv_on_a_shut_down_socket(io);
            }
        }
    }
}
