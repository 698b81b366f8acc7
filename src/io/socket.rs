//! Raw TCP socket plumbing for the completion queue.
//!
//! Sockets are plain non-blocking file descriptors owned by the connection that opened
//! them; the queue only borrows the descriptor while an operation is submitted.

use std::io;
use std::mem;
use std::net::SocketAddr;
use std::os::unix::io::RawFd;

use crate::constants::{TCP_KEEPALIVE, TCP_NODELAY, TCP_RCVBUF, TCP_SNDBUF};

#[cfg(target_os = "linux")]
pub(crate) const SEND_FLAGS: libc::c_int = libc::MSG_NOSIGNAL;
#[cfg(not(target_os = "linux"))]
pub(crate) const SEND_FLAGS: libc::c_int = 0;

#[inline]
pub(crate) fn cvt(result: libc::c_int) -> io::Result<libc::c_int> {
    if result == -1 {
        Err(io::Error::last_os_error())
    } else {
        Ok(result)
    }
}

#[inline]
pub(crate) fn cvt_size(result: libc::ssize_t) -> io::Result<usize> {
    if result < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(result as usize)
    }
}

fn set_option(fd: RawFd, level: libc::c_int, name: libc::c_int, value: libc::c_int) -> io::Result<()> {
    // SAFETY: `value` outlives the call and the length matches its type.
    cvt(unsafe {
        libc::setsockopt(
            fd,
            level,
            name,
            &value as *const libc::c_int as *const libc::c_void,
            mem::size_of::<libc::c_int>() as libc::socklen_t,
        )
    })?;
    Ok(())
}

/// Opens a non-blocking TCP socket for `address`'s family with the client socket options.
pub fn open_socket(address: &SocketAddr) -> io::Result<RawFd> {
    let domain = match address {
        SocketAddr::V4(_) => libc::AF_INET,
        SocketAddr::V6(_) => libc::AF_INET6,
    };

    // SAFETY: plain syscall, no pointers.
    let fd = cvt(unsafe { libc::socket(domain, libc::SOCK_STREAM, libc::IPPROTO_TCP) })?;

    if let Err(e) = configure(fd) {
        close(fd);
        return Err(e);
    }
    Ok(fd)
}

fn configure(fd: RawFd) -> io::Result<()> {
    // SAFETY: `fd` is a descriptor we just opened.
    unsafe {
        let flags = cvt(libc::fcntl(fd, libc::F_GETFL))?;
        cvt(libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK))?;
        cvt(libc::fcntl(fd, libc::F_SETFD, libc::FD_CLOEXEC))?;
    }

    if TCP_RCVBUF > 0 {
        set_option(fd, libc::SOL_SOCKET, libc::SO_RCVBUF, TCP_RCVBUF as libc::c_int)?;
    }
    if TCP_SNDBUF > 0 {
        set_option(fd, libc::SOL_SOCKET, libc::SO_SNDBUF, TCP_SNDBUF as libc::c_int)?;
    }
    if TCP_KEEPALIVE {
        set_option(fd, libc::SOL_SOCKET, libc::SO_KEEPALIVE, 1)?;
    }
    if TCP_NODELAY {
        set_option(fd, libc::IPPROTO_TCP, libc::TCP_NODELAY, 1)?;
    }
    #[cfg(target_os = "macos")]
    set_option(fd, libc::SOL_SOCKET, libc::SO_NOSIGPIPE, 1)?;

    Ok(())
}

/// Best-effort shutdown of both directions.
pub fn shutdown(fd: RawFd) -> io::Result<()> {
    // SAFETY: plain syscall, no pointers.
    cvt(unsafe { libc::shutdown(fd, libc::SHUT_RDWR) })?;
    Ok(())
}

pub fn close(fd: RawFd) {
    // SAFETY: the caller owns `fd` and never uses it again.
    let _ = unsafe { libc::close(fd) };
}

/// Reads and clears the pending error of a socket, as left by a non-blocking connect.
pub(crate) fn take_error(fd: RawFd) -> io::Result<Option<io::Error>> {
    let mut error: libc::c_int = 0;
    let mut len = mem::size_of::<libc::c_int>() as libc::socklen_t;
    // SAFETY: `error` and `len` are valid for writes of the advertised size.
    cvt(unsafe {
        libc::getsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_ERROR,
            &mut error as *mut libc::c_int as *mut libc::c_void,
            &mut len,
        )
    })?;
    Ok((error != 0).then(|| io::Error::from_raw_os_error(error)))
}

/// Encodes `address` as a C socket address.
pub(crate) fn socket_addr_to_raw(address: &SocketAddr) -> (libc::sockaddr_storage, libc::socklen_t) {
    // SAFETY: all-zero is a valid `sockaddr_storage`.
    let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };

    let len = match address {
        SocketAddr::V4(a) => {
            // SAFETY: `sockaddr_storage` is large enough and suitably aligned for any
            // socket address type.
            let sin = unsafe { &mut *(&mut storage as *mut _ as *mut libc::sockaddr_in) };
            sin.sin_family = libc::AF_INET as libc::sa_family_t;
            sin.sin_port = a.port().to_be();
            sin.sin_addr.s_addr = u32::from_ne_bytes(a.ip().octets());
            #[cfg(target_os = "macos")]
            {
                sin.sin_len = mem::size_of::<libc::sockaddr_in>() as u8;
            }
            mem::size_of::<libc::sockaddr_in>()
        }
        SocketAddr::V6(a) => {
            // SAFETY: as above.
            let sin6 = unsafe { &mut *(&mut storage as *mut _ as *mut libc::sockaddr_in6) };
            sin6.sin6_family = libc::AF_INET6 as libc::sa_family_t;
            sin6.sin6_port = a.port().to_be();
            sin6.sin6_flowinfo = a.flowinfo();
            sin6.sin6_addr.s6_addr = a.ip().octets();
            sin6.sin6_scope_id = a.scope_id();
            #[cfg(target_os = "macos")]
            {
                sin6.sin6_len = mem::size_of::<libc::sockaddr_in6>() as u8;
            }
            mem::size_of::<libc::sockaddr_in6>()
        }
    };

    (storage, len as libc::socklen_t)
}
