//! Client session protocol engine.
//!
//! A [`Session`] registers with the cluster, then sends requests one at a time in the order
//! they were submitted. Each request names the checksum of the previous reply as its
//! `parent`, and each reply names the checksum of its request, so the exchange forms a hash
//! chain that a replica or the client can verify end to end.
//!
//! The session is driven entirely by [`Session::tick`] and [`Session::on_message`]; it never
//! blocks and performs no I/O of its own beyond handing messages to its [`Transport`].

use std::collections::VecDeque;

use rand::{SeedableRng, rngs::StdRng};
use tracing::{debug, error, info, warn};

use crate::constants::{
    ClusterId, MESSAGE_BODY_SIZE_MAX_USIZE, PING_TIMEOUT_TICKS, PIPELINING_MAX, REPLICAS_MAX,
    REQUEST_TIMEOUT_TICKS,
};
use crate::error::{Error, Result};
use crate::message_pool::{Message, MessagePool};
use crate::vsr::bus::Transport;
use crate::vsr::timeout::Timeout;
use crate::vsr::wire::{Command, Header, Operation};

/// Receives the reply body of a request, or the reason it will never get one.
pub type Callback = Box<dyn FnOnce(Result<&[u8]>)>;

struct Inflight {
    user_data: u64,
    /// `None` for the register request.
    callback: Option<Callback>,
    message: Message,
}

pub struct Session<T: Transport> {
    id: u128,
    cluster: ClusterId,
    replica_count: u8,
    pool: MessagePool,
    transport: T,

    /// Checksum of the latest reply, replaced by the checksum of each request as it is
    /// first sent.
    parent: u128,
    /// Commit number of the register reply; zero until registered.
    session: u64,
    /// Number to stamp on the next request. Zero means not yet registered.
    request_number: u32,
    /// Highest view seen in a reply or pong.
    view: u32,
    ticks: u64,

    /// Head is the only request in flight.
    queue: VecDeque<Inflight>,
    request_timeout: Timeout,
    ping_timeout: Timeout,
    prng: StdRng,
    evicted: bool,
}

impl<T: Transport> Session<T> {
    pub fn new(
        pool: MessagePool,
        transport: T,
        id: u128,
        cluster: ClusterId,
        replica_count: u8,
    ) -> Self {
        assert!(id != 0, "client id must be non-zero");
        assert!(replica_count > 0);
        assert!(replica_count as usize <= REPLICAS_MAX);

        let mut ping_timeout = Timeout::new("ping_timeout", id, PING_TIMEOUT_TICKS);
        ping_timeout.start();

        Self {
            id,
            cluster,
            replica_count,
            pool,
            transport,
            parent: 0,
            session: 0,
            request_number: 0,
            view: 0,
            ticks: 0,
            queue: VecDeque::with_capacity(PIPELINING_MAX),
            request_timeout: Timeout::new("request_timeout", id, REQUEST_TIMEOUT_TICKS),
            ping_timeout,
            prng: StdRng::seed_from_u64(id as u64),
            evicted: false,
        }
    }

    #[inline]
    pub fn id(&self) -> u128 {
        self.id
    }

    #[inline]
    pub fn session(&self) -> u64 {
        self.session
    }

    #[inline]
    pub fn view(&self) -> u32 {
        self.view
    }

    #[inline]
    pub fn parent(&self) -> u128 {
        self.parent
    }

    #[inline]
    pub fn request_number(&self) -> u32 {
        self.request_number
    }

    #[inline]
    pub fn ticks(&self) -> u64 {
        self.ticks
    }

    #[inline]
    pub fn is_evicted(&self) -> bool {
        self.evicted
    }

    /// Requests queued or in flight, including a pending register.
    #[inline]
    pub fn inflight(&self) -> usize {
        self.queue.len()
    }

    /// Whether [`Self::request`] can accept another request (and a register ahead of it).
    #[inline]
    pub fn has_capacity(&self) -> bool {
        self.queue.len() + 2 <= PIPELINING_MAX
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    /// Queues a request for `operation` carrying `body`.
    ///
    /// `callback` receives the reply body once the cluster has committed the request. An
    /// evicted session or an oversized body fails the callback immediately.
    ///
    /// # Panics
    ///
    /// Panics if `operation` is not client facing or the queue is full; check
    /// [`Self::has_capacity`] first.
    pub fn request(&mut self, user_data: u64, operation: Operation, body: &[u8], callback: Callback) {
        assert!(operation.is_client_facing(), "{operation:?} is not a client operation");

        if self.evicted {
            callback(Err(Error::Evicted));
            return;
        }
        if body.len() > MESSAGE_BODY_SIZE_MAX_USIZE {
            callback(Err(Error::BatchTooLarge {
                size: body.len(),
                max: MESSAGE_BODY_SIZE_MAX_USIZE,
            }));
            return;
        }

        self.register();
        assert!(self.queue.len() < PIPELINING_MAX, "too many outstanding requests");

        let mut header = Header::new(Command::Request, self.cluster);
        header.client = self.id;
        header.request = self.request_number;
        header.operation = operation;

        let mut message = self.pool.get_message();
        message.set_header(&header);
        message.set_body(body);
        message.set_checksums();

        debug!(
            client = self.id,
            request = self.request_number,
            ?operation,
            size = body.len(),
            "request queued"
        );
        self.request_number += 1;

        self.enqueue(Inflight {
            user_data,
            callback: Some(callback),
            message,
        });
    }

    /// Queues the register request ahead of the first request. No-op once queued.
    fn register(&mut self) {
        if self.request_number > 0 {
            return;
        }
        assert!(self.queue.is_empty());

        let mut header = Header::new(Command::Request, self.cluster);
        header.client = self.id;
        header.operation = Operation::Register;

        let mut message = self.pool.get_message();
        message.set_header(&header);
        message.set_checksums();

        info!(client = self.id, "registering session");
        self.request_number = 1;

        self.enqueue(Inflight {
            user_data: 0,
            callback: None,
            message,
        });
    }

    fn enqueue(&mut self, inflight: Inflight) {
        let was_empty = self.queue.is_empty();
        self.queue.push_back(inflight);
        if was_empty {
            self.send_request_for_the_first_time();
        }
    }

    /// Stamps the head with the hash chain and session, then sends it to the primary.
    fn send_request_for_the_first_time(&mut self) {
        let head = self
            .queue
            .front_mut()
            .expect("send_request_for_the_first_time with an empty queue");
        assert!(head.message.is_unique());

        {
            let mut header = head.message.header_mut();
            assert_eq!(header.view, 0);
            header.parent = self.parent;
            header.context = self.session as u128;
            header.view = self.view;
        }
        head.message.set_checksums();

        let header = head.message.header();
        assert_eq!(header.command, Command::Request);
        // The reply must name this request as its parent.
        self.parent = header.checksum;

        assert!(!self.request_timeout.ticking());
        self.request_timeout.start();

        let replica = (self.view % self.replica_count as u32) as u8;
        debug!(
            client = self.id,
            request = header.request,
            operation = ?header.operation,
            replica,
            "sending request"
        );
        self.transport.send_to_replica(replica, &head.message);
    }

    fn on_request_timeout(&mut self) {
        self.request_timeout.backoff(&mut self.prng);

        let head = self
            .queue
            .front()
            .expect("request timeout without an inflight request");
        let header = head.message.header();
        assert_eq!(header.checksum, self.parent);
        assert_eq!(header.context, self.session as u128);

        // Rotate through the replicas in case the primary is down.
        let replica = ((self.view as u64 + self.request_timeout.attempts() as u64)
            % self.replica_count as u64) as u8;
        warn!(
            client = self.id,
            request = header.request,
            attempts = self.request_timeout.attempts(),
            replica,
            "request timed out, resending"
        );
        self.transport.send_to_replica(replica, &head.message);
    }

    fn on_ping_timeout(&mut self) {
        self.ping_timeout.reset();

        let mut header = Header::new(Command::Ping, self.cluster);
        header.client = self.id;

        let mut ping = self.pool.get_header_only_message();
        ping.set_header(&header);
        ping.set_checksums();

        for replica in 0..self.replica_count {
            self.transport.send_to_replica(replica, &ping);
        }
    }

    /// Handles a message delivered by the transport.
    pub fn on_message(&mut self, message: &Message) {
        let header = message.header();

        if let Err(reason) = header.validate() {
            warn!(client = self.id, reason, "invalid message header");
            return;
        }
        if header.cluster != self.cluster {
            warn!(
                client = self.id,
                cluster = header.cluster,
                expected = self.cluster,
                "message from another cluster"
            );
            return;
        }

        match header.command {
            Command::Pong => self.on_pong(&header),
            Command::Reply => self.on_reply(message),
            Command::Eviction => self.on_eviction(&header),
            command => debug!(client = self.id, ?command, "ignoring message"),
        }
    }

    fn on_pong(&mut self, pong: &Header) {
        if pong.client != 0 {
            debug!(client = self.id, "ignoring pong addressed to a client");
            return;
        }
        if pong.view > self.view {
            debug!(client = self.id, from = self.view, to = pong.view, "newer view");
            self.view = pong.view;
        }
        if !self.evicted {
            // A replica is reachable: register early so the first request is not delayed.
            self.register();
        }
    }

    fn on_reply(&mut self, message: &Message) {
        let reply = message.header();
        assert_eq!(reply.command, Command::Reply);

        if reply.client != self.id {
            debug!(client = self.id, other = reply.client, "reply for another client");
            return;
        }
        let Some(head) = self.queue.front() else {
            debug!(client = self.id, request = reply.request, "reply without inflight request");
            return;
        };
        let request = head.message.header();
        if reply.request < request.request {
            debug!(
                client = self.id,
                request = reply.request,
                inflight = request.request,
                "duplicate reply"
            );
            return;
        }

        let inflight = self.queue.pop_front().expect("head checked above");

        assert_eq!(reply.parent, self.parent);
        assert_eq!(reply.client, request.client);
        assert_eq!(reply.context, 0);
        assert_eq!(reply.request, request.request);
        assert_eq!(reply.cluster, request.cluster);
        assert_eq!(reply.op, reply.commit);
        assert_eq!(reply.operation, request.operation);

        self.parent = reply.checksum;
        if reply.view > self.view {
            debug!(client = self.id, from = self.view, to = reply.view, "newer view");
            self.view = reply.view;
        }
        self.request_timeout.stop();

        if reply.operation == Operation::Register {
            assert_eq!(self.session, 0);
            assert!(reply.commit > 0);
            self.session = reply.commit;
            info!(client = self.id, session = self.session, "session registered");
        } else {
            debug!(
                client = self.id,
                request = reply.request,
                user_data = inflight.user_data,
                size = reply.size,
                "reply received"
            );
        }

        // Keep the pipe busy before running user code.
        if !self.queue.is_empty() {
            self.send_request_for_the_first_time();
        }

        if let Some(callback) = inflight.callback {
            callback(Ok(message.body()));
        }
    }

    fn on_eviction(&mut self, eviction: &Header) {
        if eviction.client != self.id {
            debug!(client = self.id, other = eviction.client, "eviction for another client");
            return;
        }
        if eviction.view < self.view {
            debug!(client = self.id, view = eviction.view, "stale eviction");
            return;
        }
        if self.evicted {
            return;
        }

        error!(
            client = self.id,
            session = self.session,
            "session evicted: too many concurrent client sessions"
        );
        self.evicted = true;
        self.request_timeout.stop();
        self.ping_timeout.stop();

        for inflight in self.queue.drain(..) {
            if let Some(callback) = inflight.callback {
                callback(Err(Error::Evicted));
            }
        }
    }

    /// Fails every queued request with `error` and forgets them.
    pub fn cancel_all(&mut self, error: impl Fn() -> Error) {
        self.request_timeout.stop();
        for inflight in self.queue.drain(..) {
            if let Some(callback) = inflight.callback {
                callback(Err(error()));
            }
        }
    }

    pub fn tick(&mut self) {
        self.ticks += 1;
        self.transport.tick();

        self.ping_timeout.tick();
        self.request_timeout.tick();

        if self.ping_timeout.fired() {
            self.on_ping_timeout();
        }
        if self.request_timeout.fired() {
            self.on_request_timeout();
        }
    }
}

#[cfg(test)]
#[path = "session_tests.rs"]
mod tests;
