//! One TCP connection slot of the message bus.
//!
//! A slot cycles `Free -> Connecting -> Connected -> Terminating -> Free`. While a slot is
//! anything but `Free` it owns its socket and reserves the bus mapping for its replica.
//!
//! At most one receive-side operation (connect delay, connect, or recv) and one send are
//! in flight per connection, tracked by `recv_submitted` and `send_submitted`. A
//! terminating connection closes only once both have completed, so every buffer lent to
//! the I/O queue is back before the socket is released. [`Connection::force_close`] is the
//! exception, for a bus that is going away.

use std::collections::VecDeque;
use std::os::unix::io::RawFd;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::constants::{CONNECTION_DELAY_MAX_MS, CONNECTION_DELAY_MIN_MS, CONNECTION_SEND_QUEUE_MAX};
use crate::io::{self, Completion, Operation};
use crate::message_buffer::MessageBuffer;
use crate::message_pool::Message;
use crate::vsr::bus::BusState;
use crate::vsr::timeout::exponential_backoff_with_jitter;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Unused slot.
    Free,
    /// Inbound connection being accepted. Clients never accept.
    Accepting,
    /// Socket open, waiting out the connect delay or the handshake.
    Connecting,
    Connected,
    /// Shutting down; waiting for outstanding operations before closing.
    Terminating,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Peer {
    None,
    Unknown,
    Client(u128),
    Replica(u8),
}

/// Kind of operation a completion belongs to, packed into the low byte of `user_data`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub(crate) enum CompletionKind {
    ConnectDelay = 0,
    Connect = 1,
    Send = 2,
    Recv = 3,
}

impl CompletionKind {
    pub(crate) fn user_data(self, connection: usize) -> u64 {
        ((connection as u64) << 8) | self as u64
    }

    /// Splits `user_data` into the connection index and completion kind.
    pub(crate) fn decode(user_data: u64) -> (usize, Self) {
        let kind = match user_data & 0xff {
            0 => Self::ConnectDelay,
            1 => Self::Connect,
            2 => Self::Send,
            3 => Self::Recv,
            other => panic!("unknown completion kind {other}"),
        };
        ((user_data >> 8) as usize, kind)
    }
}

pub struct Connection {
    index: usize,
    state: ConnectionState,
    peer: Peer,
    fd: Option<RawFd>,

    /// Framing state of the inbound stream; present while connected.
    recv_buffer: Option<MessageBuffer>,
    recv_submitted: bool,

    send_queue: VecDeque<Message>,
    /// Bytes of the queue head already written.
    send_progress: usize,
    send_submitted: bool,
}

impl Connection {
    pub fn new(index: usize) -> Self {
        Self {
            index,
            state: ConnectionState::Free,
            peer: Peer::None,
            fd: None,
            recv_buffer: None,
            recv_submitted: false,
            send_queue: VecDeque::with_capacity(CONNECTION_SEND_QUEUE_MAX),
            send_progress: 0,
            send_submitted: false,
        }
    }

    #[inline]
    pub fn state(&self) -> ConnectionState {
        self.state
    }

    #[inline]
    pub fn peer(&self) -> Peer {
        self.peer
    }

    #[inline]
    pub fn send_queue_len(&self) -> usize {
        self.send_queue.len()
    }

    /// Opens a socket to `replica` and schedules the connect after a backoff delay.
    ///
    /// A socket that cannot be opened leaves the slot `Free` for the next bus tick.
    pub fn connect_to_replica(&mut self, bus: &mut BusState, replica: u8) {
        assert_eq!(self.state, ConnectionState::Free);
        assert_eq!(self.peer, Peer::None);
        assert!(self.fd.is_none());

        let address = bus.address(replica);
        let fd = match io::open_socket(&address) {
            Ok(fd) => fd,
            Err(error) => {
                warn!(replica, %address, %error, "failed to open socket");
                return;
            }
        };

        self.fd = Some(fd);
        self.peer = Peer::Replica(replica);
        self.state = ConnectionState::Connecting;
        bus.connections_used += 1;

        let slot = &mut bus.replicas[replica as usize];
        assert!(slot.is_none());
        *slot = Some(self.index);

        let attempts = bus.replicas_connect_attempts[replica as usize];
        let delay_ms = exponential_backoff_with_jitter(
            &mut bus.prng,
            CONNECTION_DELAY_MIN_MS,
            CONNECTION_DELAY_MAX_MS,
            attempts,
        );
        bus.replicas_connect_attempts[replica as usize] += 1;

        debug!(replica, %address, attempts, delay_ms, "connecting to replica");

        assert!(!self.recv_submitted);
        self.recv_submitted = true;
        bus.io.submit(
            CompletionKind::ConnectDelay.user_data(self.index),
            Operation::timeout(Duration::from_millis(delay_ms)),
        );
    }

    pub(crate) fn on_completion(
        &mut self,
        bus: &mut BusState,
        kind: CompletionKind,
        completion: Completion,
    ) {
        match kind {
            CompletionKind::ConnectDelay => self.on_connect_delay(bus),
            CompletionKind::Connect => self.on_connect(bus, completion.result.map(|_| ())),
            CompletionKind::Send => self.on_send(bus, completion.result),
            CompletionKind::Recv => {
                let Operation::Recv { message, .. } = completion.operation else {
                    panic!("recv completion without a recv operation");
                };
                self.on_recv(bus, message, completion.result);
            }
        }
    }

    fn on_connect_delay(&mut self, bus: &mut BusState) {
        assert!(self.recv_submitted);
        self.recv_submitted = false;

        if self.state == ConnectionState::Terminating {
            self.maybe_close(bus);
            return;
        }
        assert_eq!(self.state, ConnectionState::Connecting);

        let Peer::Replica(replica) = self.peer else {
            unreachable!("connecting connection without a replica peer");
        };
        let fd = self.fd.expect("connecting connection has a socket");

        self.recv_submitted = true;
        bus.io.submit(
            CompletionKind::Connect.user_data(self.index),
            Operation::Connect {
                fd,
                address: bus.address(replica),
            },
        );
    }

    fn on_connect(&mut self, bus: &mut BusState, result: std::io::Result<()>) {
        assert!(self.recv_submitted);
        self.recv_submitted = false;

        if self.state == ConnectionState::Terminating {
            self.maybe_close(bus);
            return;
        }
        assert_eq!(self.state, ConnectionState::Connecting);

        let Peer::Replica(replica) = self.peer else {
            unreachable!("connecting connection without a replica peer");
        };

        if let Err(error) = result {
            warn!(replica, %error, "error connecting to replica");
            self.terminate(bus, false);
            return;
        }

        info!(replica, address = %bus.address(replica), "connected to replica");
        self.state = ConnectionState::Connected;
        bus.replicas_connect_attempts[replica as usize] = 0;

        assert!(self.recv_buffer.is_none());
        assert!(!self.send_submitted);
        assert_eq!(self.send_progress, 0);

        self.recv_buffer = Some(MessageBuffer::init(&bus.pool, bus.cluster));
        self.recv(bus);
        // Messages queued while connecting go out now.
        if self.state == ConnectionState::Connected && !self.send_queue.is_empty() {
            self.send(bus);
        }
    }

    /// Queues `message` for sending. Dropped silently while terminating.
    ///
    /// # Panics
    ///
    /// Panics on a `Free` or `Accepting` connection.
    pub fn send_message(&mut self, bus: &mut BusState, message: Message) {
        assert!(self.peer != Peer::None);
        match self.state {
            ConnectionState::Connected | ConnectionState::Connecting => {}
            ConnectionState::Terminating => {
                debug!(peer = ?self.peer, "dropping message for terminating connection");
                return;
            }
            ConnectionState::Free | ConnectionState::Accepting => {
                unreachable!("send_message on a {:?} connection", self.state)
            }
        }

        if self.send_queue.len() >= CONNECTION_SEND_QUEUE_MAX {
            warn!(peer = ?self.peer, "send queue full, dropping message");
            return;
        }
        self.send_queue.push_back(message);

        if self.state == ConnectionState::Connecting {
            return;
        }
        if !self.send_submitted {
            self.send(bus);
        }
    }

    fn recv(&mut self, bus: &mut BusState) {
        assert_eq!(self.state, ConnectionState::Connected);
        assert!(!self.recv_submitted);

        let fd = self.fd.expect("connected connection has a socket");
        let (message, offset) = self
            .recv_buffer
            .as_mut()
            .expect("connected connection has a recv buffer")
            .recv_lend();

        self.recv_submitted = true;
        bus.io.submit(
            CompletionKind::Recv.user_data(self.index),
            Operation::Recv {
                fd,
                message,
                offset,
            },
        );
    }

    fn on_recv(&mut self, bus: &mut BusState, message: Message, result: std::io::Result<usize>) {
        assert!(self.recv_submitted);
        self.recv_submitted = false;

        if self.state == ConnectionState::Terminating {
            drop(message);
            self.maybe_close(bus);
            return;
        }
        assert_eq!(self.state, ConnectionState::Connected);

        match result {
            Err(error) => {
                warn!(peer = ?self.peer, %error, "error receiving from peer");
                self.terminate(bus, true);
            }
            Ok(0) => {
                info!(peer = ?self.peer, "peer closed the connection");
                self.terminate(bus, true);
            }
            Ok(bytes) => {
                self.recv_buffer
                    .as_mut()
                    .expect("connected connection has a recv buffer")
                    .recv_advance(message, bytes);
                self.parse_messages(bus);
            }
        }
    }

    /// Delivers every validated message to the inbox, then either terminates on a corrupt
    /// stream or receives more.
    fn parse_messages(&mut self, bus: &mut BusState) {
        let buffer = self
            .recv_buffer
            .as_mut()
            .expect("connected connection has a recv buffer");

        while let Some(header) = buffer.peek() {
            debug!(
                peer = ?self.peer,
                command = ?header.command,
                size = header.size,
                "message received"
            );
            bus.inbox.push_back(buffer.consume());
        }

        if let Some(reason) = buffer.invalid {
            warn!(peer = ?self.peer, ?reason, "invalid message from peer");
            self.terminate(bus, true);
            return;
        }
        self.recv(bus);
    }

    fn send(&mut self, bus: &mut BusState) {
        assert_eq!(self.state, ConnectionState::Connected);
        assert!(!self.send_submitted);

        let fd = self.fd.expect("connected connection has a socket");
        let message = self.send_queue.front().expect("send with an empty queue").clone();
        let len = message.header().total_len();
        assert!(self.send_progress < len);

        self.send_submitted = true;
        bus.io.submit(
            CompletionKind::Send.user_data(self.index),
            Operation::Send {
                fd,
                message,
                offset: self.send_progress,
                len,
            },
        );
    }

    fn on_send(&mut self, bus: &mut BusState, result: std::io::Result<usize>) {
        assert!(self.send_submitted);
        self.send_submitted = false;

        if self.state == ConnectionState::Terminating {
            self.maybe_close(bus);
            return;
        }
        assert_eq!(self.state, ConnectionState::Connected);

        let bytes = match result {
            Ok(bytes) => bytes,
            Err(error) => {
                warn!(peer = ?self.peer, %error, "error sending to peer");
                self.terminate(bus, true);
                return;
            }
        };

        let len = self
            .send_queue
            .front()
            .expect("send completed with an empty queue")
            .header()
            .total_len();
        self.send_progress += bytes;
        assert!(self.send_progress <= len);

        if self.send_progress == len {
            self.send_progress = 0;
            self.send_queue.pop_front();
        }
        if !self.send_queue.is_empty() {
            self.send(bus);
        }
    }

    /// Starts tearing the connection down. With `shutdown`, both directions of the socket
    /// are shut first so outstanding operations complete promptly.
    pub fn terminate(&mut self, bus: &mut BusState, shutdown: bool) {
        assert!(self.peer != Peer::None);
        assert!(self.state != ConnectionState::Free);
        let fd = self.fd.expect("terminating connection has a socket");

        if shutdown {
            // The peer may already be gone; closing follows either way.
            if let Err(error) = io::shutdown(fd) {
                debug!(peer = ?self.peer, %error, "shutdown failed");
            }
        }
        self.state = ConnectionState::Terminating;
        self.maybe_close(bus);
    }

    fn maybe_close(&mut self, bus: &mut BusState) {
        assert!(self.peer != Peer::None);
        assert_eq!(self.state, ConnectionState::Terminating);

        if self.recv_submitted || self.send_submitted {
            return;
        }

        self.send_queue.clear();
        self.recv_buffer = None;

        let fd = self.fd.take().expect("terminating connection has a socket");
        io::close(fd);

        assert!(bus.connections_used > 0);
        bus.connections_used -= 1;

        if let Peer::Replica(replica) = self.peer {
            let slot = &mut bus.replicas[replica as usize];
            if *slot == Some(self.index) {
                *slot = None;
            }
        }
        info!(peer = ?self.peer, "connection closed");

        self.state = ConnectionState::Free;
        self.peer = Peer::None;
        self.send_progress = 0;
    }

    /// Closes the socket now, without waiting for outstanding operations.
    ///
    /// The I/O queue keeps the buffers of those operations alive. Their completions must
    /// not reach this connection again, so only a bus that never reconnects may call this.
    pub(crate) fn force_close(&mut self, bus: &mut BusState) {
        assert!(self.peer != Peer::None);
        assert!(self.state != ConnectionState::Free);

        debug!(
            peer = ?self.peer,
            recv_submitted = self.recv_submitted,
            send_submitted = self.send_submitted,
            "closing connection with operations in flight"
        );
        self.recv_submitted = false;
        self.send_submitted = false;
        self.state = ConnectionState::Terminating;
        self.maybe_close(bus);
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("index", &self.index)
            .field("state", &self.state)
            .field("peer", &self.peer)
            .field("recv_buffer", &self.recv_buffer)
            .field("send_queue", &self.send_queue.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message_pool::MessagePool;
    use crate::vsr::wire::{Command, Header};
    use std::io::Read;
    use std::net::{SocketAddr, TcpListener, TcpStream};
    use std::os::unix::io::IntoRawFd;
    use std::time::Instant;

    fn dispatch(connection: &mut Connection, bus: &mut BusState) {
        bus.io.run_for(Duration::from_millis(10)).expect("io");
        let completions: Vec<_> = bus.io.drain().collect();
        for completion in completions {
            let (index, kind) = CompletionKind::decode(completion.user_data);
            assert_eq!(index, connection.index);
            connection.on_completion(bus, kind, completion);
        }
    }

    #[test]
    fn user_data_round_trips() {
        for kind in [
            CompletionKind::ConnectDelay,
            CompletionKind::Connect,
            CompletionKind::Send,
            CompletionKind::Recv,
        ] {
            assert_eq!(CompletionKind::decode(kind.user_data(5)), (5, kind));
        }
    }

    #[test]
    fn partial_send_resumes_from_progress() {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
        let address = listener.local_addr().expect("addr");
        let pool = MessagePool::new(4, 4);
        let mut bus = BusState::new(pool.clone(), 1, &[address], 0).expect("bus");

        let stream = TcpStream::connect(address).expect("connect");
        stream.set_nonblocking(true).expect("nonblocking");
        let (mut peer, _) = listener.accept().expect("accept");
        peer.set_read_timeout(Some(Duration::from_secs(5)))
            .expect("read timeout");

        let mut connection = Connection::new(0);
        connection.fd = Some(stream.into_raw_fd());
        connection.peer = Peer::Replica(0);
        connection.state = ConnectionState::Connected;
        bus.connections_used = 1;
        bus.replicas[0] = Some(0);

        let mut message = pool.get_message();
        message.set_header(&Header::new(Command::Pong, 1));
        message.set_body(&[0x5A; 200]);
        message.set_checksums();
        let expected = message.as_bytes().to_vec();
        connection.send_queue.push_back(message);

        // The kernel took only the first 100 bytes of an earlier send.
        connection.send_submitted = true;
        connection.on_send(&mut bus, Ok(100));
        assert_eq!(connection.send_progress, 100);
        assert!(connection.send_submitted, "the rest goes out in a new send");
        assert_eq!(connection.send_queue_len(), 1);

        let deadline = Instant::now() + Duration::from_secs(5);
        while connection.send_queue_len() > 0 {
            assert!(Instant::now() < deadline, "send did not finish");
            dispatch(&mut connection, &mut bus);
        }
        assert_eq!(connection.send_progress, 0);
        assert!(!connection.send_submitted);

        // The peer sees exactly the bytes after the first 100, once.
        let mut received = vec![0u8; expected.len() - 100];
        peer.read_exact(&mut received).expect("read rest");
        assert_eq!(received, &expected[100..]);

        connection.terminate(&mut bus, true);
        assert_eq!(connection.state(), ConnectionState::Free);
        assert_eq!(bus.connections_used, 0);
    }

    #[test]
    fn force_close_releases_a_connecting_slot() {
        let address: SocketAddr = "127.0.0.1:1".parse().expect("addr");
        let mut bus = BusState::new(MessagePool::new(2, 2), 1, &[address], 0).expect("bus");

        let mut connection = Connection::new(0);
        connection.connect_to_replica(&mut bus, 0);
        assert_eq!(connection.state(), ConnectionState::Connecting);
        assert!(connection.recv_submitted, "connect delay in flight");

        connection.force_close(&mut bus);
        assert_eq!(connection.state(), ConnectionState::Free);
        assert_eq!(connection.peer(), Peer::None);
        assert!(connection.fd.is_none());
        assert_eq!(bus.connections_used, 0);
        assert_eq!(bus.replicas[0], None);
    }
}
