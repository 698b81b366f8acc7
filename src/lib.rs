//! Client library for a replicated ledger cluster.
//!
//! The client speaks the VSR request/reply protocol over TCP: it registers a session,
//! then sends account and transfer batches one request at a time, retrying against other
//! replicas when the primary does not answer.
//!
//! ```no_run
//! use ledger_client::{Account, Client, Config};
//!
//! let client = Client::new(Config::parse(0, "3001,3002,3003")?)?;
//! let failures = client.create_accounts(&[Account { id: 1, unit: 710, ..Account::default() }])?;
//! assert!(failures.is_empty());
//! # Ok::<(), ledger_client::Error>(())
//! ```

pub mod client;
pub mod config;
pub mod constants;
pub mod error;
pub mod io;
pub mod ledger;
pub mod message_buffer;
pub mod message_pool;
pub mod vsr;

#[cfg(test)]
mod test_utils;

pub use client::Client;
pub use config::Config;
pub use error::{Error, Result};
pub use ledger::{
    Account, AccountFlags, Commit, CommitFlags, CommitTransferResult, CommitTransfersResult,
    CreateAccountResult, CreateAccountsResult, CreateTransferResult, CreateTransfersResult,
    Transfer, TransferFlags,
};
