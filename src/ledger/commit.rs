use bitflags::bitflags;

use super::{Record, RecordDecodeError, read_u32, read_u64, read_u128, write};

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct CommitFlags: u32 {
        const LINKED = 1 << 0;
        const REJECT = 1 << 1;
        const PREIMAGE = 1 << 2;
    }
}

/// Second phase of a two-phase transfer: accepts (or with [`CommitFlags::REJECT`]
/// rejects) the reserved amount of transfer `id`.
///
/// ```text
/// Bytes 0-15:  id
/// Bytes 16-47: reserved
/// Bytes 48-51: code (u32)
/// Bytes 52-55: flags (u32)
/// Bytes 56-63: timestamp
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Commit {
    pub id: u128,
    pub reserved: [u8; 32],
    pub code: u32,
    pub flags: CommitFlags,
    pub timestamp: u64,
}

impl Record for Commit {
    const SIZE: usize = 64;

    fn encode(&self, out: &mut [u8]) {
        assert!(out.len() == Self::SIZE);
        write(out, 0, &self.id.to_le_bytes());
        write(out, 16, &self.reserved);
        write(out, 48, &self.code.to_le_bytes());
        write(out, 52, &self.flags.bits().to_le_bytes());
        write(out, 56, &self.timestamp.to_le_bytes());
    }

    fn decode(bytes: &[u8]) -> Result<Self, RecordDecodeError> {
        assert!(bytes.len() == Self::SIZE);
        let mut reserved = [0u8; 32];
        reserved.copy_from_slice(&bytes[16..48]);

        Ok(Self {
            id: read_u128(bytes, 0),
            reserved,
            code: read_u32(bytes, 48),
            flags: CommitFlags::from_bits_retain(read_u32(bytes, 52)),
            timestamp: read_u64(bytes, 56),
        })
    }
}
