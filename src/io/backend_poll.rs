//! Readiness backend over `poll(2)`.
//!
//! Operations wait in a pending list; each flush issues the `connect(2)` of new connects,
//! polls the descriptors of the rest, and performs whatever became ready. Results surface
//! through [`IoBackend::drain`] exactly as a completion ring would report them.

use std::collections::VecDeque;
use std::io;
use std::time::{Duration, Instant};

use super::socket;
use super::{IoBackend, RawOperation};

struct Pending {
    user_data: u64,
    op: RawOperation,
    /// The `connect(2)` of a connect operation has been issued.
    started: bool,
}

pub struct PollBackend {
    entries: usize,
    pending: Vec<Pending>,
    /// `(user_data, result)` pairs awaiting [`IoBackend::drain`].
    ready: VecDeque<(u64, i32)>,
}

impl IoBackend for PollBackend {
    const ENTRIES_MIN: u32 = 1;
    const ENTRIES_MAX: u32 = 4096;

    fn new(entries: u32) -> io::Result<Self> {
        Ok(Self {
            entries: entries as usize,
            pending: Vec::with_capacity(entries as usize),
            ready: VecDeque::with_capacity(entries as usize),
        })
    }

    unsafe fn try_push(&mut self, op: &RawOperation, user_data: u64) -> Result<(), ()> {
        assert!(user_data != 0);
        if self.pending.len() + self.ready.len() >= self.entries {
            return Err(());
        }
        self.pending.push(Pending {
            user_data,
            op: *op,
            started: false,
        });
        Ok(())
    }

    fn flush(&mut self, wait: Duration) -> io::Result<()> {
        self.start_connects();

        let now = Instant::now();
        let mut wait = if self.ready.is_empty() {
            wait
        } else {
            Duration::ZERO
        };

        let mut pollfds = Vec::with_capacity(self.pending.len());
        let mut slots = Vec::with_capacity(self.pending.len());
        for pending in &self.pending {
            if let RawOperation::Timeout { deadline } = pending.op {
                wait = wait.min(deadline.saturating_duration_since(now));
            }
            slots.push(poll_events(&pending.op).map(|(fd, events)| {
                pollfds.push(libc::pollfd {
                    fd,
                    events,
                    revents: 0,
                });
                pollfds.len() - 1
            }));
        }

        if pollfds.is_empty() {
            if !wait.is_zero() {
                std::thread::sleep(wait);
            }
        } else {
            // Round up so a sub-millisecond wait does not turn into a busy poll.
            let timeout_ms =
                wait.as_nanos().div_ceil(1_000_000).min(i32::MAX as u128) as libc::c_int;
            // SAFETY: `pollfds` is a live, correctly sized array of `pollfd`.
            let ready = unsafe {
                libc::poll(pollfds.as_mut_ptr(), pollfds.len() as libc::nfds_t, timeout_ms)
            };
            if ready < 0 {
                let error = io::Error::last_os_error();
                if error.kind() != io::ErrorKind::Interrupted {
                    return Err(error);
                }
                pollfds.iter_mut().for_each(|p| p.revents = 0);
            }
        }

        let now = Instant::now();
        let pending = std::mem::take(&mut self.pending);
        for (pending, slot) in pending.into_iter().zip(slots) {
            let revents = slot.map_or(0, |i| pollfds[i].revents);
            // SAFETY: the pointers in `pending.op` are valid until its result is drained.
            match unsafe { perform(&pending.op, revents, now) } {
                Some(result) => self.ready.push_back((pending.user_data, result)),
                None => self.pending.push(pending),
            }
        }
        Ok(())
    }

    fn drain<F: FnMut(u64, i32)>(&mut self, mut f: F) {
        while let Some((user_data, result)) = self.ready.pop_front() {
            f(user_data, result);
        }
    }
}

impl PollBackend {
    /// Issues the `connect(2)` of every new connect so poll can wait on writability.
    fn start_connects(&mut self) {
        let mut index = 0;
        while index < self.pending.len() {
            let pending = &mut self.pending[index];
            let RawOperation::Connect { fd, address } = pending.op else {
                index += 1;
                continue;
            };
            if pending.started {
                index += 1;
                continue;
            }

            let (storage, len) = socket::socket_addr_to_raw(&address);
            // SAFETY: `storage` holds a socket address of `len` bytes.
            let result =
                unsafe { libc::connect(fd, &storage as *const _ as *const libc::sockaddr, len) };
            match socket::cvt(result) {
                Err(e) if e.raw_os_error() == Some(libc::EINPROGRESS) => {
                    pending.started = true;
                    index += 1;
                }
                result => {
                    let user_data = pending.user_data;
                    self.pending.remove(index);
                    self.ready.push_back((user_data, to_result(result.map(|_| 0usize))));
                }
            }
        }
    }
}

fn poll_events(op: &RawOperation) -> Option<(libc::c_int, libc::c_short)> {
    match *op {
        RawOperation::Timeout { .. } => None,
        RawOperation::Connect { fd, .. } | RawOperation::Send { fd, .. } => {
            Some((fd, libc::POLLOUT))
        }
        RawOperation::Recv { fd, .. } => Some((fd, libc::POLLIN)),
    }
}

/// Runs `op` if it is ready, returning its completion result.
///
/// # Safety
///
/// The buffer `op` points into must be live.
unsafe fn perform(op: &RawOperation, revents: libc::c_short, now: Instant) -> Option<i32> {
    match *op {
        RawOperation::Timeout { deadline } => (now >= deadline).then_some(0),
        RawOperation::Connect { fd, .. } => (revents != 0).then(|| match socket::take_error(fd) {
            Ok(None) => 0,
            Ok(Some(e)) | Err(e) => to_result(Err(e)),
        }),
        RawOperation::Send { fd, buf, len } => {
            if revents == 0 {
                return None;
            }
            // SAFETY: the caller keeps `buf[..len]` live.
            let n = unsafe {
                libc::send(fd, buf.as_ptr() as *const libc::c_void, len as usize, socket::SEND_FLAGS)
            };
            would_block_to_none(socket::cvt_size(n))
        }
        RawOperation::Recv { fd, buf, len } => {
            if revents == 0 {
                return None;
            }
            // SAFETY: the caller keeps `buf[..len]` live and unaliased.
            let n = unsafe { libc::recv(fd, buf.as_ptr() as *mut libc::c_void, len as usize, 0) };
            would_block_to_none(socket::cvt_size(n))
        }
    }
}

fn would_block_to_none(result: io::Result<usize>) -> Option<i32> {
    match result {
        Err(e) if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted) => {
            None
        }
        other => Some(to_result(other)),
    }
}

/// Byte count, or the negated errno as a completion ring reports it.
fn to_result(result: io::Result<usize>) -> i32 {
    match result {
        Ok(n) => n as i32,
        Err(e) => -e.raw_os_error().unwrap_or(libc::EIO),
    }
}
