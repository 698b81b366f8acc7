//! Thread-safe client handle.
//!
//! [`Client::new`] spawns one background thread that owns the message pool, the bus and
//! the [`Session`], and runs the tick loop. Application threads talk to it over a
//! submission channel: blocking calls wait on a reply channel, `_async` calls await a
//! oneshot. Requests are served one at a time in submission order.

use std::collections::VecDeque;
use std::io;
use std::slice;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, Sender, TryRecvError};
use tokio::sync::oneshot;
use tracing::{error, info};

use crate::config::Config;
use crate::constants::TICK_MS;
use crate::error::{Error, Result};
use crate::ledger::{
    Account, Commit, CommitTransferResult, CommitTransfersResult, CreateAccountResult,
    CreateAccountsResult, CreateTransferResult, CreateTransfersResult, Record,
    RecordDecodeError, Transfer, decode_batch, encode_batch,
};
use crate::message_pool::MessagePool;
use crate::vsr::bus::MessageBus;
use crate::vsr::session::Session;
use crate::vsr::wire::Operation;

/// How long a closing client waits for its connections to shut down.
const SHUTDOWN_GRACE: Duration = Duration::from_millis(100);

type Reply = Box<dyn FnOnce(Result<Vec<u8>>) + Send>;

struct Submission {
    operation: Operation,
    body: Vec<u8>,
    reply: Reply,
}

pub struct Client {
    id: u128,
    submissions: Option<Sender<Submission>>,
    thread: Option<JoinHandle<()>>,
}

impl Client {
    /// Starts a client for the cluster in `config` with a random client id.
    ///
    /// Fails with [`Error::Io`] if the client thread cannot set up its I/O queue.
    pub fn new(config: Config) -> Result<Self> {
        let id = loop {
            let id = rand::random::<u128>();
            if id != 0 {
                break id;
            }
        };

        let (sender, receiver) = crossbeam_channel::unbounded();
        let (started_sender, started) = crossbeam_channel::bounded(1);
        let thread = thread::Builder::new()
            .name(format!("ledger-client-{:x}", id as u32))
            .spawn(move || run(config, id, receiver, started_sender))?;

        let startup = started.recv();
        if !matches!(startup, Ok(Ok(()))) {
            if thread.join().is_err() {
                error!(client = id, "client thread panicked during startup");
            }
            return Err(match startup {
                Ok(Err(error)) => error.into(),
                _ => Error::Shutdown,
            });
        }

        Ok(Self {
            id,
            submissions: Some(sender),
            thread: Some(thread),
        })
    }

    #[inline]
    pub fn id(&self) -> u128 {
        self.id
    }

    /// Stops the tick thread. Requests still queued fail with [`Error::Shutdown`].
    pub fn shutdown(&mut self) {
        // Disconnecting the channel is the stop signal.
        self.submissions = None;
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                error!(client = self.id, "client thread panicked");
            }
        }
    }

    fn submit(&self, operation: Operation, body: Vec<u8>, reply: Reply) -> Result<()> {
        let submissions = self.submissions.as_ref().ok_or(Error::Shutdown)?;
        submissions
            .send(Submission {
                operation,
                body,
                reply,
            })
            .map_err(|_| Error::Shutdown)
    }

    fn call(&self, operation: Operation, body: Vec<u8>) -> Result<Vec<u8>> {
        let (sender, receiver) = crossbeam_channel::bounded(1);
        self.submit(
            operation,
            body,
            Box::new(move |result: Result<Vec<u8>>| {
                let _ = sender.send(result);
            }),
        )?;
        receiver.recv().map_err(|_| Error::Shutdown)?
    }

    async fn call_async(&self, operation: Operation, body: Vec<u8>) -> Result<Vec<u8>> {
        let (sender, receiver) = oneshot::channel();
        self.submit(
            operation,
            body,
            Box::new(move |result: Result<Vec<u8>>| {
                let _ = sender.send(result);
            }),
        )?;
        receiver.await.map_err(|_| Error::Shutdown)?
    }

    /// Creates `accounts`, returning the failures. An empty result means every account
    /// was created.
    pub fn create_accounts(&self, accounts: &[Account]) -> Result<Vec<CreateAccountsResult>> {
        decode_reply(&self.call(Operation::CreateAccounts, encode_batch(accounts))?)
    }

    pub async fn create_accounts_async(
        &self,
        accounts: &[Account],
    ) -> Result<Vec<CreateAccountsResult>> {
        let body = encode_batch(accounts);
        decode_reply(&self.call_async(Operation::CreateAccounts, body).await?)
    }

    pub fn create_account(&self, account: &Account) -> Result<CreateAccountResult> {
        let results = self.create_accounts(slice::from_ref(account))?;
        single_result(&results, CreateAccountResult::Ok, |r| r.result)
    }

    pub async fn create_account_async(&self, account: &Account) -> Result<CreateAccountResult> {
        let results = self.create_accounts_async(slice::from_ref(account)).await?;
        single_result(&results, CreateAccountResult::Ok, |r| r.result)
    }

    /// Creates `transfers`, returning the failures.
    pub fn create_transfers(&self, transfers: &[Transfer]) -> Result<Vec<CreateTransfersResult>> {
        decode_reply(&self.call(Operation::CreateTransfers, encode_batch(transfers))?)
    }

    pub async fn create_transfers_async(
        &self,
        transfers: &[Transfer],
    ) -> Result<Vec<CreateTransfersResult>> {
        let body = encode_batch(transfers);
        decode_reply(&self.call_async(Operation::CreateTransfers, body).await?)
    }

    pub fn create_transfer(&self, transfer: &Transfer) -> Result<CreateTransferResult> {
        let results = self.create_transfers(slice::from_ref(transfer))?;
        single_result(&results, CreateTransferResult::Ok, |r| r.result)
    }

    pub async fn create_transfer_async(&self, transfer: &Transfer) -> Result<CreateTransferResult> {
        let results = self.create_transfers_async(slice::from_ref(transfer)).await?;
        single_result(&results, CreateTransferResult::Ok, |r| r.result)
    }

    /// Accepts or rejects two-phase transfers, returning the failures.
    pub fn commit_transfers(&self, commits: &[Commit]) -> Result<Vec<CommitTransfersResult>> {
        decode_reply(&self.call(Operation::CommitTransfers, encode_batch(commits))?)
    }

    pub async fn commit_transfers_async(
        &self,
        commits: &[Commit],
    ) -> Result<Vec<CommitTransfersResult>> {
        let body = encode_batch(commits);
        decode_reply(&self.call_async(Operation::CommitTransfers, body).await?)
    }

    pub fn commit_transfer(&self, commit: &Commit) -> Result<CommitTransferResult> {
        let results = self.commit_transfers(slice::from_ref(commit))?;
        single_result(&results, CommitTransferResult::Ok, |r| r.result)
    }

    pub async fn commit_transfer_async(&self, commit: &Commit) -> Result<CommitTransferResult> {
        let results = self.commit_transfers_async(slice::from_ref(commit)).await?;
        single_result(&results, CommitTransferResult::Ok, |r| r.result)
    }

    /// Looks up accounts by id. Ids that do not exist are left out of the result.
    pub fn lookup_accounts(&self, ids: &[u128]) -> Result<Vec<Account>> {
        decode_reply(&self.call(Operation::LookupAccounts, encode_batch(ids))?)
    }

    pub async fn lookup_accounts_async(&self, ids: &[u128]) -> Result<Vec<Account>> {
        let body = encode_batch(ids);
        decode_reply(&self.call_async(Operation::LookupAccounts, body).await?)
    }

    pub fn lookup_account(&self, id: u128) -> Result<Option<Account>> {
        Ok(self.lookup_accounts(&[id])?.into_iter().next())
    }

    pub async fn lookup_account_async(&self, id: u128) -> Result<Option<Account>> {
        Ok(self.lookup_accounts_async(&[id]).await?.into_iter().next())
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("id", &format_args!("{:032x}", self.id))
            .field("running", &self.thread.is_some())
            .finish()
    }
}

fn decode_reply<R: Record>(body: &[u8]) -> Result<Vec<R>> {
    decode_batch(body).map_err(|e| match e {
        RecordDecodeError::TrailingBytes { .. } => {
            Error::InvalidReply("reply body is not a whole number of records")
        }
        RecordDecodeError::UnknownResult { .. } => Error::InvalidReply("unknown result code"),
    })
}

/// Result of a one-event batch: replies list failures only, so no entry means success.
fn single_result<R, C>(results: &[R], ok: C, result: impl Fn(&R) -> C) -> Result<C> {
    match results {
        [] => Ok(ok),
        [only] => Ok(result(only)),
        _ => Err(Error::InvalidReply("more than one result for a single event")),
    }
}

/// Tick loop of the client thread. Reports on `started` whether the bus came up, then
/// returns once the submission channel disconnects or the I/O layer fails.
fn run(
    config: Config,
    id: u128,
    submissions: Receiver<Submission>,
    started: Sender<io::Result<()>>,
) {
    info!(
        client = id,
        cluster = config.cluster,
        replicas = config.addresses.len(),
        "client started"
    );

    let pool = MessagePool::for_client();
    let bus = match MessageBus::new(pool.clone(), config.cluster, &config.addresses, id as u64) {
        Ok(bus) => bus,
        Err(e) => {
            error!(client = id, error = %e, "failed to set up io");
            let _ = started.send(Err(e));
            return;
        }
    };
    let _ = started.send(Ok(()));
    let mut session = Session::new(pool, bus, id, config.cluster, config.replica_count());

    let tick = Duration::from_millis(TICK_MS);
    let mut next_tick = Instant::now();
    let mut backlog = VecDeque::new();
    let mut user_data = 0u64;

    'run: loop {
        // Ticking first lets the bus start connecting before the first request is sent.
        let now = Instant::now();
        if now >= next_tick {
            session.tick();
            next_tick += tick;
            // Do not try to catch up after a stall.
            if next_tick < now {
                next_tick = now + tick;
            }
        }

        loop {
            match submissions.try_recv() {
                Ok(submission) => backlog.push_back(submission),
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => break 'run,
            }
        }
        while session.has_capacity() {
            let Some(Submission {
                operation,
                body,
                reply,
            }) = backlog.pop_front()
            else {
                break;
            };
            user_data += 1;
            session.request(
                user_data,
                operation,
                &body,
                Box::new(move |result: Result<&[u8]>| reply(result.map(<[u8]>::to_vec))),
            );
        }

        let io = match session.transport_mut().io_tick() {
            Ok(()) => session
                .transport_mut()
                .run_for(next_tick.saturating_duration_since(Instant::now())),
            Err(e) => Err(e),
        };
        if let Err(e) = io {
            error!(client = id, error = %e, "io failure, stopping client");
            break 'run;
        }

        for message in session.transport_mut().take_inbox() {
            session.on_message(&message);
        }
    }

    session.cancel_all(|| Error::Shutdown);
    for submission in backlog {
        (submission.reply)(Err(Error::Shutdown));
    }
    session.transport_mut().shutdown(SHUTDOWN_GRACE);
    info!(client = id, "client stopped");
}
