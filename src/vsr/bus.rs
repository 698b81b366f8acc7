//! Client-side message bus: one outbound connection per replica over the I/O queue.

use std::collections::VecDeque;
use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use rand::{SeedableRng, rngs::StdRng};
use tracing::debug;

use crate::constants::{ClusterId, REPLICAS_MAX};
use crate::io::Io;
use crate::message_pool::{Message, MessagePool};
use crate::vsr::connection::{CompletionKind, Connection, ConnectionState};

/// What the session needs from the network.
pub trait Transport {
    /// Best-effort send. The transport takes its own reference to `message`; a replica
    /// without a live connection loses the message.
    fn send_to_replica(&mut self, replica: u8, message: &Message);

    /// Called once per session tick.
    fn tick(&mut self);
}

/// Bus-wide state shared by every connection.
pub struct BusState {
    pub(crate) io: Io,
    pub(crate) pool: MessagePool,
    pub(crate) cluster: ClusterId,
    addresses: Vec<SocketAddr>,
    /// Connection index currently serving each replica.
    pub(crate) replicas: Vec<Option<usize>>,
    pub(crate) replicas_connect_attempts: Vec<u64>,
    pub(crate) connections_used: usize,
    pub(crate) prng: StdRng,
    pub(crate) inbox: VecDeque<Message>,
}

impl BusState {
    pub(crate) fn new(
        pool: MessagePool,
        cluster: ClusterId,
        addresses: &[SocketAddr],
        seed: u64,
    ) -> io::Result<Self> {
        let replica_count = addresses.len();
        Ok(Self {
            io: Io::for_client()?,
            pool,
            cluster,
            addresses: addresses.to_vec(),
            replicas: vec![None; replica_count],
            replicas_connect_attempts: vec![0; replica_count],
            connections_used: 0,
            prng: StdRng::seed_from_u64(seed),
            inbox: VecDeque::new(),
        })
    }

    #[inline]
    pub(crate) fn address(&self, replica: u8) -> SocketAddr {
        self.addresses[replica as usize]
    }
}

pub struct MessageBus {
    connections: Vec<Connection>,
    state: BusState,
    /// Set by [`MessageBus::shutdown`]; a closed bus never connects again.
    closed: bool,
}

impl MessageBus {
    /// Creates a bus for the replicas at `addresses`, indexed by replica number.
    ///
    /// `seed` drives the reconnect jitter. Fails if the I/O queue cannot be set up.
    pub fn new(
        pool: MessagePool,
        cluster: ClusterId,
        addresses: &[SocketAddr],
        seed: u64,
    ) -> io::Result<Self> {
        assert!(!addresses.is_empty());
        assert!(addresses.len() <= REPLICAS_MAX);

        Ok(Self {
            // A client needs one connection per replica and never accepts.
            connections: (0..addresses.len()).map(Connection::new).collect(),
            state: BusState::new(pool, cluster, addresses, seed)?,
            closed: false,
        })
    }

    #[inline]
    pub fn replica_count(&self) -> u8 {
        self.state.addresses.len() as u8
    }

    #[inline]
    pub fn pool(&self) -> &MessagePool {
        &self.state.pool
    }

    #[inline]
    pub fn connections_used(&self) -> usize {
        self.state.connections_used
    }

    pub fn connection_state(&self, replica: u8) -> Option<ConnectionState> {
        self.state.replicas[replica as usize].map(|index| self.connections[index].state())
    }

    /// Starts a connection to every replica that has none.
    pub fn tick(&mut self) {
        if self.closed {
            return;
        }
        for replica in 0..self.replica_count() {
            self.maybe_connect_to_replica(replica);
        }
    }

    fn maybe_connect_to_replica(&mut self, replica: u8) {
        if self.state.replicas[replica as usize].is_some() {
            return;
        }

        let Some(connection) = self
            .connections
            .iter_mut()
            .find(|connection| connection.state() == ConnectionState::Free)
        else {
            // Slots free up as terminating connections close; try again next tick.
            debug!(replica, "no free connection slot");
            return;
        };
        connection.connect_to_replica(&mut self.state, replica);
    }

    pub fn send_to_replica(&mut self, replica: u8, message: &Message) {
        match self.state.replicas[replica as usize] {
            Some(index) => self.connections[index].send_message(&mut self.state, message.clone()),
            None => debug!(replica, "no active connection to replica, dropping message"),
        }
    }

    /// Performs all ready I/O without blocking.
    pub fn io_tick(&mut self) -> io::Result<()> {
        self.state.io.tick()?;
        self.dispatch_completions();
        Ok(())
    }

    /// Waits up to `budget` for I/O, then performs all ready I/O.
    pub fn run_for(&mut self, budget: Duration) -> io::Result<()> {
        self.state.io.run_for(budget)?;
        self.dispatch_completions();
        Ok(())
    }

    /// Messages received since the last call, in arrival order.
    pub fn take_inbox(&mut self) -> VecDeque<Message> {
        std::mem::take(&mut self.state.inbox)
    }

    fn dispatch_completions(&mut self) {
        let completions: Vec<_> = self.state.io.drain().collect();
        for completion in completions {
            let (index, kind) = CompletionKind::decode(completion.user_data);
            let connection = &mut self.connections[index];
            if connection.state() == ConnectionState::Free {
                // Outlived a forced close.
                assert!(self.closed);
                continue;
            }
            connection.on_completion(&mut self.state, kind, completion);
        }
    }

    /// Terminates every open connection and waits up to `budget` for them to close.
    /// Sockets still open after `budget` are closed without waiting for their operations.
    pub fn shutdown(&mut self, budget: Duration) {
        self.closed = true;
        for connection in &mut self.connections {
            if matches!(
                connection.state(),
                ConnectionState::Connecting | ConnectionState::Connected
            ) {
                connection.terminate(&mut self.state, true);
            }
        }

        let deadline = std::time::Instant::now() + budget;
        while self.state.connections_used > 0 {
            let now = std::time::Instant::now();
            if now >= deadline {
                debug!(
                    open = self.state.connections_used,
                    "connections still open after grace period"
                );
                break;
            }
            if self.run_for(deadline - now).is_err() {
                break;
            }
        }
        self.force_close_all();
    }

    fn force_close_all(&mut self) {
        for connection in &mut self.connections {
            if connection.state() != ConnectionState::Free {
                connection.force_close(&mut self.state);
            }
        }
        assert_eq!(self.state.connections_used, 0);
    }
}

impl Drop for MessageBus {
    fn drop(&mut self) {
        self.shutdown(Duration::ZERO);
    }
}

impl Transport for MessageBus {
    fn send_to_replica(&mut self, replica: u8, message: &Message) {
        MessageBus::send_to_replica(self, replica, message);
    }

    fn tick(&mut self) {
        MessageBus::tick(self);
    }
}
