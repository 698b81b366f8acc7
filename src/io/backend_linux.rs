use std::io;
use std::mem;
use std::time::{Duration, Instant};

use io_uring::{IoUring, Probe, opcode, squeue, types};
use tracing::warn;

use super::backend_poll::PollBackend;
use super::socket;
use super::{IoBackend, RawOperation};

pub struct UringBackend {
    ring: IoUring,
    /// Per-slot storage the kernel reads after the push: timeout lengths and connect
    /// addresses. Indexed by `user_data - 1`, which the core keeps below `entries`.
    timespecs: Box<[types::Timespec]>,
    addresses: Box<[(libc::sockaddr_storage, libc::socklen_t)]>,
}

fn timespec(duration: Duration) -> types::Timespec {
    types::Timespec::new()
        .sec(duration.as_secs())
        .nsec(duration.subsec_nanos())
}

impl IoBackend for UringBackend {
    const ENTRIES_MIN: u32 = 1;
    const ENTRIES_MAX: u32 = 4096;

    fn new(entries: u32) -> io::Result<Self> {
        let ring = IoUring::new(entries)?;

        if !ring.params().is_feature_ext_arg() {
            return Err(io::Error::new(
                io::ErrorKind::Unsupported,
                "io_uring lacks timed waits (IORING_FEAT_EXT_ARG)",
            ));
        }
        let mut supported = Probe::new();
        ring.submitter().register_probe(&mut supported)?;
        for (code, name) in [
            (opcode::Timeout::CODE, "TIMEOUT"),
            (opcode::Connect::CODE, "CONNECT"),
            (opcode::Send::CODE, "SEND"),
            (opcode::Recv::CODE, "RECV"),
        ] {
            if !supported.is_supported(code) {
                return Err(io::Error::new(
                    io::ErrorKind::Unsupported,
                    format!("io_uring {name} not supported"),
                ));
            }
        }

        // SAFETY: all-zero is a valid `sockaddr_storage`.
        let empty_address: libc::sockaddr_storage = unsafe { mem::zeroed() };
        Ok(Self {
            ring,
            timespecs: vec![types::Timespec::new(); entries as usize].into_boxed_slice(),
            addresses: vec![(empty_address, 0); entries as usize].into_boxed_slice(),
        })
    }

    unsafe fn try_push(&mut self, op: &RawOperation, user_data: u64) -> Result<(), ()> {
        assert!(user_data != 0);
        let slot = (user_data - 1) as usize;

        let entry: squeue::Entry = match *op {
            RawOperation::Timeout { deadline } => {
                self.timespecs[slot] = timespec(deadline.saturating_duration_since(Instant::now()));
                opcode::Timeout::new(&self.timespecs[slot]).build()
            }
            RawOperation::Connect { fd, address } => {
                self.addresses[slot] = socket::socket_addr_to_raw(&address);
                let (storage, len) = &self.addresses[slot];
                opcode::Connect::new(
                    types::Fd(fd),
                    storage as *const libc::sockaddr_storage as *const libc::sockaddr,
                    *len,
                )
                .build()
            }
            RawOperation::Send { fd, buf, len } => {
                opcode::Send::new(types::Fd(fd), buf.as_ptr(), len)
                    .flags(socket::SEND_FLAGS)
                    .build()
            }
            RawOperation::Recv { fd, buf, len } => {
                opcode::Recv::new(types::Fd(fd), buf.as_ptr(), len).build()
            }
        };

        // SAFETY: the caller keeps buffers live until completion; the timespec and address
        // live in `self` at a slot no other in-flight operation uses.
        unsafe { self.ring.submission().push(&entry.user_data(user_data)) }.map_err(|_| ())
    }

    fn flush(&mut self, wait: Duration) -> io::Result<()> {
        let submitted = if wait.is_zero() {
            self.ring.submit()
        } else {
            let timeout = timespec(wait);
            let args = types::SubmitArgs::new().timespec(&timeout);
            self.ring.submitter().submit_with_args(1, &args)
        };
        match submitted {
            Ok(_) => Ok(()),
            // Timed out, interrupted, or the completion queue is full and must be drained.
            Err(e) if matches!(e.raw_os_error(), Some(libc::ETIME | libc::EINTR | libc::EBUSY)) => {
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    fn drain<F: FnMut(u64, i32)>(&mut self, mut f: F) {
        for cqe in self.ring.completion() {
            f(cqe.user_data(), cqe.result());
        }
    }
}

/// `io_uring` when the kernel provides it, `poll(2)` otherwise.
pub enum SystemBackend {
    Uring(UringBackend),
    Poll(PollBackend),
}

impl IoBackend for SystemBackend {
    const ENTRIES_MIN: u32 = 1;
    const ENTRIES_MAX: u32 = 4096;

    fn new(entries: u32) -> io::Result<Self> {
        match UringBackend::new(entries) {
            Ok(uring) => Ok(Self::Uring(uring)),
            Err(error) => {
                warn!(%error, "io_uring unavailable, falling back to poll");
                Ok(Self::Poll(PollBackend::new(entries)?))
            }
        }
    }

    unsafe fn try_push(&mut self, op: &RawOperation, user_data: u64) -> Result<(), ()> {
        // SAFETY: forwarded under the caller's guarantees.
        unsafe {
            match self {
                Self::Uring(backend) => backend.try_push(op, user_data),
                Self::Poll(backend) => backend.try_push(op, user_data),
            }
        }
    }

    fn flush(&mut self, wait: Duration) -> io::Result<()> {
        match self {
            Self::Uring(backend) => backend.flush(wait),
            Self::Poll(backend) => backend.flush(wait),
        }
    }

    fn drain<F: FnMut(u64, i32)>(&mut self, f: F) {
        match self {
            Self::Uring(backend) => backend.drain(f),
            Self::Poll(backend) => backend.drain(f),
        }
    }
}
