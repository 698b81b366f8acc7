//! VSR wire protocol header.
//!
//! The [`Header`] is a fixed-size 128-byte structure prepended to every message.
//! It carries the two checksums, the hash-chain and session fields used by clients,
//! routing metadata (cluster, view, replica) and the protocol version.
//!
//! # Wire layout
//!
//! ```text
//! Bytes 0-15:    checksum (covers bytes 16-127)
//! Bytes 16-31:   checksum_body (covers the message body)
//! Bytes 32-47:   parent
//! Bytes 48-63:   client
//! Bytes 64-79:   context
//! Bytes 80-83:   request (u32)
//! Bytes 84-87:   cluster (u32)
//! Bytes 88-91:   epoch (u32)
//! Bytes 92-95:   view (u32)
//! Bytes 96-103:  op (u64)
//! Bytes 104-111: commit (u64)
//! Bytes 112-119: offset (u64)
//! Bytes 120-123: size (i32, header + body)
//! Byte 124:      replica
//! Byte 125:      command
//! Byte 126:      operation
//! Byte 127:      version
//! ```
//!
//! # Design Decisions
//!
//! The header is never overlaid on a buffer. [`Header::from_bytes`] decodes each field at
//! its fixed little-endian offset and rejects unknown `command`/`operation` bytes, and
//! [`Header::to_bytes`] writes it back. Checksums are always computed over the encoded
//! form, so they are independent of the in-memory representation.

use super::{Checksum128, Command, InvalidCommand, InvalidOperation, Operation, checksum};
use crate::constants::{ClusterId, HEADER_SIZE, HEADER_SIZE_USIZE, MESSAGE_SIZE_MAX, VSR_VERSION};

/// Byte offset where checksummed content begins (after the checksum field itself).
const CHECKSUM_SIZE: usize = 16;
const _: () = assert!(CHECKSUM_SIZE == size_of::<Checksum128>());
const _: () = assert!(HEADER_SIZE_USIZE > CHECKSUM_SIZE);

/// Byte offsets of the header fields in the wire form.
pub mod offset {
    pub const CHECKSUM: usize = 0;
    pub const CHECKSUM_BODY: usize = 16;
    pub const PARENT: usize = 32;
    pub const CLIENT: usize = 48;
    pub const CONTEXT: usize = 64;
    pub const REQUEST: usize = 80;
    pub const CLUSTER: usize = 84;
    pub const EPOCH: usize = 88;
    pub const VIEW: usize = 92;
    pub const OP: usize = 96;
    pub const COMMIT: usize = 104;
    pub const OFFSET: usize = 112;
    pub const SIZE: usize = 120;
    pub const REPLICA: usize = 124;
    pub const COMMAND: usize = 125;
    pub const OPERATION: usize = 126;
    pub const VERSION: usize = 127;

    const _: () = assert!(VERSION + 1 == crate::constants::HEADER_SIZE_USIZE);
}

/// Kind of remote endpoint, as far as it can be told from a header alone.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerType {
    Unknown,
    Replica,
    Client,
}

/// Error returned by [`Header::from_bytes`] for bytes that cannot name a command or
/// operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeaderDecodeError {
    Command(InvalidCommand),
    Operation(InvalidOperation),
}

impl core::fmt::Display for HeaderDecodeError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::Command(e) => e.fmt(f),
            Self::Operation(e) => e.fmt(f),
        }
    }
}

impl std::error::Error for HeaderDecodeError {}

/// Fixed-size 128-byte header prepended to every message.
///
/// # Checksum coverage
///
/// - `checksum`: Covers encoded header bytes 16-127 (everything after itself)
/// - `checksum_body`: Covers the message body only (not the header)
///
/// Always set `checksum_body` before `checksum` since the header checksum
/// covers the `checksum_body` field.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub checksum: Checksum128,
    pub checksum_body: Checksum128,
    /// Checksum of the message this one follows in the client hash chain.
    pub parent: Checksum128,
    /// Client id; zero for messages originated by replicas.
    pub client: u128,
    /// Session number for requests, zero otherwise.
    pub context: u128,
    /// Client request number.
    pub request: u32,
    pub cluster: ClusterId,
    /// Reconfiguration epoch; always zero.
    pub epoch: u32,
    pub view: u32,
    pub op: u64,
    pub commit: u64,
    pub offset: u64,
    /// Total message size in bytes (header + body).
    pub size: i32,
    pub replica: u8,
    pub command: Command,
    pub operation: Operation,
    /// Protocol version; must equal [`VSR_VERSION`].
    pub version: u8,
}

impl core::fmt::Debug for Header {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Header")
            .field("checksum", &format_args!("{:#x}", self.checksum))
            .field("checksum_body", &format_args!("{:#x}", self.checksum_body))
            .field("parent", &format_args!("{:#x}", self.parent))
            .field("client", &format_args!("{:#x}", self.client))
            .field("context", &self.context)
            .field("request", &self.request)
            .field("cluster", &self.cluster)
            .field("view", &self.view)
            .field("op", &self.op)
            .field("commit", &self.commit)
            .field("size", &self.size)
            .field("replica", &self.replica)
            .field("command", &self.command)
            .field("operation", &self.operation)
            .finish()
    }
}

impl Default for Header {
    fn default() -> Self {
        Self::new(Command::Reserved, 0)
    }
}

impl Header {
    /// Minimum valid message size (header only, no body).
    pub const SIZE_MIN: i32 = HEADER_SIZE as i32;
    /// Maximum valid message size (header + max body).
    pub const SIZE_MAX: i32 = MESSAGE_SIZE_MAX as i32;

    /// Creates a header-only message header with every other field zeroed.
    pub fn new(command: Command, cluster: ClusterId) -> Self {
        let header = Header {
            checksum: 0,
            checksum_body: 0,
            parent: 0,
            client: 0,
            context: 0,
            request: 0,
            cluster,
            epoch: 0,
            view: 0,
            op: 0,
            commit: 0,
            offset: 0,
            size: Self::SIZE_MIN,
            replica: 0,
            command,
            operation: Operation::Reserved,
            version: VSR_VERSION,
        };

        assert!(header.size == Self::SIZE_MIN);
        assert!(header.version == VSR_VERSION);

        header
    }

    /// Returns the body length (`size - SIZE_MIN`).
    ///
    /// # Panics
    ///
    /// Panics if `size` is outside `[SIZE_MIN, SIZE_MAX]`.
    #[inline]
    pub fn body_len(&self) -> usize {
        assert!(self.size >= Self::SIZE_MIN);
        assert!(self.size <= Self::SIZE_MAX);

        (self.size - Self::SIZE_MIN) as usize
    }

    /// Returns total message length (equal to `size`).
    ///
    /// # Panics
    ///
    /// Panics if `size` is outside `[SIZE_MIN, SIZE_MAX]`.
    #[inline]
    pub fn total_len(&self) -> usize {
        assert!(self.size >= Self::SIZE_MIN);
        assert!(self.size <= Self::SIZE_MAX);

        self.size as usize
    }

    /// Encodes the header into its 128-byte wire form.
    pub fn to_bytes(&self) -> [u8; HEADER_SIZE_USIZE] {
        let mut bytes = [0u8; HEADER_SIZE_USIZE];
        self.write_to(&mut bytes);
        bytes
    }

    /// Encodes the header into the first [`HEADER_SIZE_USIZE`] bytes of `buffer`.
    ///
    /// # Panics
    ///
    /// Panics if `buffer` is shorter than a header.
    pub fn write_to(&self, buffer: &mut [u8]) {
        assert!(buffer.len() >= HEADER_SIZE_USIZE);

        put(buffer, offset::CHECKSUM, &self.checksum.to_le_bytes());
        put(buffer, offset::CHECKSUM_BODY, &self.checksum_body.to_le_bytes());
        put(buffer, offset::PARENT, &self.parent.to_le_bytes());
        put(buffer, offset::CLIENT, &self.client.to_le_bytes());
        put(buffer, offset::CONTEXT, &self.context.to_le_bytes());
        put(buffer, offset::REQUEST, &self.request.to_le_bytes());
        put(buffer, offset::CLUSTER, &self.cluster.to_le_bytes());
        put(buffer, offset::EPOCH, &self.epoch.to_le_bytes());
        put(buffer, offset::VIEW, &self.view.to_le_bytes());
        put(buffer, offset::OP, &self.op.to_le_bytes());
        put(buffer, offset::COMMIT, &self.commit.to_le_bytes());
        put(buffer, offset::OFFSET, &self.offset.to_le_bytes());
        put(buffer, offset::SIZE, &self.size.to_le_bytes());
        buffer[offset::REPLICA] = self.replica;
        buffer[offset::COMMAND] = self.command.as_u8();
        buffer[offset::OPERATION] = self.operation.as_u8();
        buffer[offset::VERSION] = self.version;
    }

    /// Decodes a header from the first [`HEADER_SIZE_USIZE`] bytes of `bytes`.
    ///
    /// The resulting header may contain invalid data; call [`Self::is_valid_checksum()`]
    /// and [`Self::validate()`] before trusting the contents.
    ///
    /// # Panics
    ///
    /// Panics if `bytes` is shorter than a header.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, HeaderDecodeError> {
        assert!(bytes.len() >= HEADER_SIZE_USIZE);

        let command =
            Command::try_from(bytes[offset::COMMAND]).map_err(HeaderDecodeError::Command)?;
        let operation =
            Operation::try_from(bytes[offset::OPERATION]).map_err(HeaderDecodeError::Operation)?;

        Ok(Header {
            checksum: u128::from_le_bytes(take(bytes, offset::CHECKSUM)),
            checksum_body: u128::from_le_bytes(take(bytes, offset::CHECKSUM_BODY)),
            parent: u128::from_le_bytes(take(bytes, offset::PARENT)),
            client: u128::from_le_bytes(take(bytes, offset::CLIENT)),
            context: u128::from_le_bytes(take(bytes, offset::CONTEXT)),
            request: u32::from_le_bytes(take(bytes, offset::REQUEST)),
            cluster: u32::from_le_bytes(take(bytes, offset::CLUSTER)),
            epoch: u32::from_le_bytes(take(bytes, offset::EPOCH)),
            view: u32::from_le_bytes(take(bytes, offset::VIEW)),
            op: u64::from_le_bytes(take(bytes, offset::OP)),
            commit: u64::from_le_bytes(take(bytes, offset::COMMIT)),
            offset: u64::from_le_bytes(take(bytes, offset::OFFSET)),
            size: i32::from_le_bytes(take(bytes, offset::SIZE)),
            replica: bytes[offset::REPLICA],
            command,
            operation,
            version: bytes[offset::VERSION],
        })
    }

    /// Computes the checksum of a raw encoded header, skipping its checksum field.
    ///
    /// Lets a receiver verify a header before decoding it.
    pub fn calculate_checksum_of(bytes: &[u8]) -> Checksum128 {
        assert!(bytes.len() >= HEADER_SIZE_USIZE);
        checksum(&bytes[CHECKSUM_SIZE..HEADER_SIZE_USIZE])
    }

    /// Computes checksum over header bytes 16-127 (excludes `checksum` field).
    pub fn calculate_checksum(&self) -> Checksum128 {
        Self::calculate_checksum_of(&self.to_bytes())
    }

    /// Computes checksum over the message body.
    ///
    /// # Panics
    ///
    /// Panics if `body.len()` doesn't match [`Self::body_len()`].
    pub fn calculate_checksum_body(&self, body: &[u8]) -> Checksum128 {
        assert!(body.len() == self.body_len());
        checksum(body)
    }

    /// Returns `true` if `checksum` matches computed value.
    #[inline]
    pub fn is_valid_checksum(&self) -> bool {
        self.checksum == self.calculate_checksum()
    }

    /// Returns `true` if `checksum_body` matches computed value.
    #[inline]
    pub fn is_valid_checksum_body(&self, body: &[u8]) -> bool {
        self.checksum_body == self.calculate_checksum_body(body)
    }

    /// Computes and stores the header checksum.
    ///
    /// Call this *after* [`Self::set_checksum_body()`] since the header checksum
    /// covers the `checksum_body` field.
    pub fn set_checksum(&mut self) {
        self.checksum = self.calculate_checksum();
        assert!(self.is_valid_checksum());
    }

    /// Computes and stores the body checksum.
    pub fn set_checksum_body(&mut self, body: &[u8]) {
        self.checksum_body = self.calculate_checksum_body(body);
        assert!(self.is_valid_checksum_body(body));
    }

    /// Classifies the header for its command and operation.
    ///
    /// Returns the first violated rule. Does *not* verify checksums; callers check
    /// [`Self::is_valid_checksum()`] first.
    pub fn validate(&self) -> Result<(), &'static str> {
        if self.version != VSR_VERSION {
            return Err("version != VSR_VERSION");
        }
        if self.size < Self::SIZE_MIN {
            return Err("size < HEADER_SIZE");
        }
        if self.epoch != 0 {
            return Err("epoch != 0");
        }

        match self.command {
            Command::Reserved => self.validate_reserved(),
            Command::Request => self.validate_request(),
            Command::Prepare => self.validate_prepare(),
            Command::PrepareOk => {
                if self.size != Self::SIZE_MIN {
                    return Err("size != HEADER_SIZE");
                }
                self.validate_prepare()
            }
            _ => Ok(()),
        }
    }

    fn validate_reserved(&self) -> Result<(), &'static str> {
        if self.parent != 0 {
            return Err("parent != 0");
        }
        if self.client != 0 {
            return Err("client != 0");
        }
        if self.context != 0 {
            return Err("context != 0");
        }
        if self.request != 0 {
            return Err("request != 0");
        }
        if self.cluster != 0 {
            return Err("cluster != 0");
        }
        if self.view != 0 {
            return Err("view != 0");
        }
        if self.op != 0 {
            return Err("op != 0");
        }
        if self.commit != 0 {
            return Err("commit != 0");
        }
        if self.offset != 0 {
            return Err("offset != 0");
        }
        if self.replica != 0 {
            return Err("replica != 0");
        }
        if self.operation != Operation::Reserved {
            return Err("operation != reserved");
        }
        Ok(())
    }

    fn validate_request(&self) -> Result<(), &'static str> {
        if self.client == 0 {
            return Err("client == 0");
        }
        if self.op != 0 {
            return Err("op != 0");
        }
        if self.commit != 0 {
            return Err("commit != 0");
        }
        if self.offset != 0 {
            return Err("offset != 0");
        }
        if self.replica != 0 {
            return Err("replica != 0");
        }

        match self.operation {
            Operation::Reserved => Err("operation == reserved"),
            Operation::Init => Err("operation == init"),
            Operation::Register => {
                // The first request of a session carries no chain, session or payload.
                if self.parent != 0 {
                    return Err("parent != 0");
                }
                if self.context != 0 {
                    return Err("context != 0");
                }
                if self.request != 0 {
                    return Err("request != 0");
                }
                if self.size != Self::SIZE_MIN {
                    return Err("size != HEADER_SIZE");
                }
                Ok(())
            }
            _ => {
                if self.context == 0 {
                    return Err("context == 0");
                }
                if self.request == 0 {
                    return Err("request == 0");
                }
                Ok(())
            }
        }
    }

    fn validate_prepare(&self) -> Result<(), &'static str> {
        match self.operation {
            Operation::Reserved => Err("operation == reserved"),
            Operation::Init => {
                if self.parent != 0 {
                    return Err("init: parent != 0");
                }
                if self.client != 0 {
                    return Err("init: client != 0");
                }
                if self.context != 0 {
                    return Err("init: context != 0");
                }
                if self.request != 0 {
                    return Err("init: request != 0");
                }
                if self.view != 0 {
                    return Err("init: view != 0");
                }
                if self.op != 0 {
                    return Err("init: op != 0");
                }
                if self.commit != 0 {
                    return Err("init: commit != 0");
                }
                if self.offset != 0 {
                    return Err("init: offset != 0");
                }
                if self.size != Self::SIZE_MIN {
                    return Err("init: size != HEADER_SIZE");
                }
                if self.replica != 0 {
                    return Err("init: replica != 0");
                }
                Ok(())
            }
            operation => {
                if self.client == 0 {
                    return Err("client == 0");
                }
                if self.op == 0 {
                    return Err("op == 0");
                }
                if self.op <= self.commit {
                    return Err("op <= commit");
                }
                if operation == Operation::Register {
                    if self.request != 0 {
                        return Err("request != 0");
                    }
                } else if self.request == 0 {
                    return Err("request == 0");
                }
                Ok(())
            }
        }
    }

    /// Guesses the kind of peer that sent this header.
    ///
    /// Requests and prepares may be forwarded, so they only identify a client when they
    /// are the (never forwarded) register request.
    ///
    /// # Panics
    ///
    /// Panics on [`Command::Reserved`], which no peer sends.
    pub fn peer_type(&self) -> PeerType {
        match self.command {
            Command::Reserved => panic!("peer_type of a reserved header"),
            Command::Request => match self.operation {
                Operation::Register => PeerType::Client,
                _ => PeerType::Unknown,
            },
            Command::Prepare => PeerType::Unknown,
            Command::Ping | Command::Pong => {
                if self.client != 0 {
                    assert!(self.replica == 0);
                    PeerType::Client
                } else {
                    PeerType::Replica
                }
            }
            _ => PeerType::Replica,
        }
    }
}

#[inline]
fn put(buffer: &mut [u8], at: usize, value: &[u8]) {
    buffer[at..at + value.len()].copy_from_slice(value);
}

#[inline]
fn take<const N: usize>(bytes: &[u8], at: usize) -> [u8; N] {
    let mut out = [0u8; N];
    out.copy_from_slice(&bytes[at..at + N]);
    out
}
