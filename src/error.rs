use thiserror::Error;

use crate::constants::REPLICAS_MAX;

#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid replica address: {0}")]
    InvalidAddress(String),

    #[error("{count} replica addresses exceed the maximum of {REPLICAS_MAX}")]
    AddressLimitExceeded { count: usize },

    #[error("no replica addresses given")]
    NoAddresses,

    #[error("session evicted: too many concurrent client sessions")]
    Evicted,

    #[error("client is shut down")]
    Shutdown,

    #[error("batch of {size} bytes exceeds the message body maximum of {max} bytes")]
    BatchTooLarge { size: usize, max: usize },

    #[error("invalid reply: {0}")]
    InvalidReply(&'static str),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
