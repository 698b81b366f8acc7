//! Fixed-layout ledger records carried in request and reply bodies.
//!
//! Every record has a constant wire size and is encoded field by field at little-endian
//! offsets. A body is a plain concatenation of records of a single type.

mod account;
mod commit;
mod results;
mod transfer;

pub use account::{Account, AccountFlags};
pub use commit::{Commit, CommitFlags};
pub use results::{
    CommitTransferResult, CommitTransfersResult, CreateAccountResult, CreateAccountsResult,
    CreateTransferResult, CreateTransfersResult,
};
pub use transfer::{Transfer, TransferFlags};

/// A record with a fixed wire size.
pub trait Record: Sized {
    const SIZE: usize;

    /// Writes the record into `out`, which is exactly [`Self::SIZE`] bytes.
    fn encode(&self, out: &mut [u8]);

    /// Reads a record from `bytes`, which is exactly [`Self::SIZE`] bytes.
    fn decode(bytes: &[u8]) -> Result<Self, RecordDecodeError>;
}

/// Why a reply body could not be turned into records.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordDecodeError {
    /// The body length is not a multiple of the record size.
    TrailingBytes { len: usize, record_size: usize },
    /// A result record carried a code this client does not know.
    UnknownResult { code: u32 },
}

impl core::fmt::Display for RecordDecodeError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::TrailingBytes { len, record_size } => write!(
                f,
                "body of {len} bytes is not a multiple of the {record_size}-byte record size"
            ),
            Self::UnknownResult { code } => write!(f, "unknown result code: {code}"),
        }
    }
}

impl std::error::Error for RecordDecodeError {}

/// Encodes `records` into a freshly allocated body.
pub fn encode_batch<R: Record>(records: &[R]) -> Vec<u8> {
    let mut body = vec![0u8; records.len() * R::SIZE];
    for (record, out) in records.iter().zip(body.chunks_exact_mut(R::SIZE)) {
        record.encode(out);
    }
    body
}

/// Decodes a body into records, preserving their order.
pub fn decode_batch<R: Record>(body: &[u8]) -> Result<Vec<R>, RecordDecodeError> {
    if body.len() % R::SIZE != 0 {
        return Err(RecordDecodeError::TrailingBytes {
            len: body.len(),
            record_size: R::SIZE,
        });
    }
    body.chunks_exact(R::SIZE).map(R::decode).collect()
}

/// Ids looked up by [`crate::vsr::wire::Operation::LookupAccounts`] are bare `u128`s.
impl Record for u128 {
    const SIZE: usize = 16;

    fn encode(&self, out: &mut [u8]) {
        out.copy_from_slice(&self.to_le_bytes());
    }

    fn decode(bytes: &[u8]) -> Result<Self, RecordDecodeError> {
        Ok(read_u128(bytes, 0))
    }
}

#[inline]
pub(crate) fn read_u128(bytes: &[u8], at: usize) -> u128 {
    let mut raw = [0u8; 16];
    raw.copy_from_slice(&bytes[at..at + 16]);
    u128::from_le_bytes(raw)
}

#[inline]
pub(crate) fn read_u64(bytes: &[u8], at: usize) -> u64 {
    let mut raw = [0u8; 8];
    raw.copy_from_slice(&bytes[at..at + 8]);
    u64::from_le_bytes(raw)
}

#[inline]
pub(crate) fn read_u32(bytes: &[u8], at: usize) -> u32 {
    let mut raw = [0u8; 4];
    raw.copy_from_slice(&bytes[at..at + 4]);
    u32::from_le_bytes(raw)
}

#[inline]
pub(crate) fn read_u16(bytes: &[u8], at: usize) -> u16 {
    u16::from_le_bytes([bytes[at], bytes[at + 1]])
}

#[inline]
pub(crate) fn write(out: &mut [u8], at: usize, value: &[u8]) {
    out[at..at + value.len()].copy_from_slice(value);
}
