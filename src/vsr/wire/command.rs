//! Wire-level VSR command identifiers.
//!
//! This enum is parsed from the on-the-wire `Header.command` byte.
//! Discriminants are stable protocol bytes and MUST NOT change.
//!
//! A client only produces `Ping` and `Request` and only consumes `Pong`, `Reply` and
//! `Eviction`; the remaining commands exist so that replica traffic decodes cleanly.

#[repr(u8)]
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum Command {
    Reserved = 0,

    Ping = 1,
    Pong = 2,

    Request = 3,
    Prepare = 4,
    PrepareOk = 5,
    Reply = 6,
    Commit = 7,

    StartViewChange = 8,
    DoViewChange = 9,
    StartView = 10,

    Recovery = 11,
    RecoveryResponse = 12,

    RequestStartView = 13,
    RequestHeaders = 14,
    RequestPrepare = 15,
    Headers = 16,
    NackPrepare = 17,

    Eviction = 18,
}

impl Command {
    pub const MIN: u8 = 0;
    pub const MAX: u8 = 18;
    pub const COUNT: u8 = Self::MAX - Self::MIN + 1;

    /// All command variants in discriminant order (0..=18).
    pub const ALL: [Self; Self::COUNT as usize] = [
        Self::Reserved,
        Self::Ping,
        Self::Pong,
        Self::Request,
        Self::Prepare,
        Self::PrepareOk,
        Self::Reply,
        Self::Commit,
        Self::StartViewChange,
        Self::DoViewChange,
        Self::StartView,
        Self::Recovery,
        Self::RecoveryResponse,
        Self::RequestStartView,
        Self::RequestHeaders,
        Self::RequestPrepare,
        Self::Headers,
        Self::NackPrepare,
        Self::Eviction,
    ];

    const _RESERVED: () = assert!(Self::Reserved as u8 == Self::MIN);
    const _EVICTION: () = assert!(Self::Eviction as u8 == Self::MAX);
    const _COUNT: () = assert!(Self::COUNT == 19);
    const _ALL_CONTIGUOUS: () = {
        let mut i = 0u8;
        while i < Self::COUNT {
            assert!(Self::ALL[i as usize] as u8 == i);
            i += 1;
        }
    };

    /// Raw on-the-wire byte for this command.
    #[inline]
    pub const fn as_u8(self) -> u8 {
        self as u8
    }

    /// Fast decoding from a wire byte.
    #[inline]
    pub fn try_from_u8(b: u8) -> Option<Self> {
        if b <= Self::MAX {
            Some(Self::ALL[b as usize])
        } else {
            None
        }
    }
}

/// Error returned when converting an invalid byte to a [`Command`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InvalidCommand(pub u8);

impl core::fmt::Display for InvalidCommand {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "invalid command byte: {}", self.0)
    }
}

impl std::error::Error for InvalidCommand {}

impl TryFrom<u8> for Command {
    type Error = InvalidCommand;

    #[inline]
    fn try_from(b: u8) -> Result<Self, Self::Error> {
        Self::try_from_u8(b).ok_or(InvalidCommand(b))
    }
}

impl From<Command> for u8 {
    #[inline]
    fn from(cmd: Command) -> Self {
        cmd.as_u8()
    }
}
