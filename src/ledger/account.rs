use bitflags::bitflags;

use super::{Record, RecordDecodeError, read_u16, read_u32, read_u64, read_u128, write};

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct AccountFlags: u32 {
        /// The account succeeds or fails together with the next event in the batch.
        const LINKED = 1 << 0;
        const DEBITS_MUST_NOT_EXCEED_CREDITS = 1 << 1;
        const CREDITS_MUST_NOT_EXCEED_DEBITS = 1 << 2;
    }
}

/// Ledger account.
///
/// ```text
/// Bytes 0-15:    id
/// Bytes 16-31:   user_data
/// Bytes 32-79:   reserved
/// Bytes 80-81:   unit (u16)
/// Bytes 82-83:   code (u16)
/// Bytes 84-87:   flags (u32)
/// Bytes 88-95:   debits_reserved
/// Bytes 96-103:  debits_accepted
/// Bytes 104-111: credits_reserved
/// Bytes 112-119: credits_accepted
/// Bytes 120-127: timestamp
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Account {
    pub id: u128,
    pub user_data: u128,
    pub reserved: [u8; 48],
    pub unit: u16,
    pub code: u16,
    pub flags: AccountFlags,
    pub debits_reserved: u64,
    pub debits_accepted: u64,
    pub credits_reserved: u64,
    pub credits_accepted: u64,
    /// Assigned by the cluster; must be zero on create.
    pub timestamp: u64,
}

impl Default for Account {
    fn default() -> Self {
        Self {
            id: 0,
            user_data: 0,
            reserved: [0; 48],
            unit: 0,
            code: 0,
            flags: AccountFlags::empty(),
            debits_reserved: 0,
            debits_accepted: 0,
            credits_reserved: 0,
            credits_accepted: 0,
            timestamp: 0,
        }
    }
}

impl Record for Account {
    const SIZE: usize = 128;

    fn encode(&self, out: &mut [u8]) {
        assert!(out.len() == Self::SIZE);
        write(out, 0, &self.id.to_le_bytes());
        write(out, 16, &self.user_data.to_le_bytes());
        write(out, 32, &self.reserved);
        write(out, 80, &self.unit.to_le_bytes());
        write(out, 82, &self.code.to_le_bytes());
        write(out, 84, &self.flags.bits().to_le_bytes());
        write(out, 88, &self.debits_reserved.to_le_bytes());
        write(out, 96, &self.debits_accepted.to_le_bytes());
        write(out, 104, &self.credits_reserved.to_le_bytes());
        write(out, 112, &self.credits_accepted.to_le_bytes());
        write(out, 120, &self.timestamp.to_le_bytes());
    }

    fn decode(bytes: &[u8]) -> Result<Self, RecordDecodeError> {
        assert!(bytes.len() == Self::SIZE);
        let mut reserved = [0u8; 48];
        reserved.copy_from_slice(&bytes[32..80]);

        Ok(Self {
            id: read_u128(bytes, 0),
            user_data: read_u128(bytes, 16),
            reserved,
            unit: read_u16(bytes, 80),
            code: read_u16(bytes, 82),
            flags: AccountFlags::from_bits_retain(read_u32(bytes, 84)),
            debits_reserved: read_u64(bytes, 88),
            debits_accepted: read_u64(bytes, 96),
            credits_reserved: read_u64(bytes, 104),
            credits_accepted: read_u64(bytes, 112),
            timestamp: read_u64(bytes, 120),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn field_offsets() {
        let account = Account {
            id: 1,
            user_data: 2,
            unit: 0x0304,
            code: 0x0506,
            flags: AccountFlags::LINKED | AccountFlags::CREDITS_MUST_NOT_EXCEED_DEBITS,
            credits_accepted: 9,
            timestamp: 10,
            ..Account::default()
        };
        let mut out = [0u8; Account::SIZE];
        account.encode(&mut out);

        assert_eq!(out[0], 1);
        assert_eq!(out[16], 2);
        assert_eq!(&out[80..84], &[0x04, 0x03, 0x06, 0x05]);
        assert_eq!(out[84], 0b101);
        assert_eq!(out[112], 9);
        assert_eq!(out[120], 10);
        assert_eq!(Account::decode(&out), Ok(account));
    }

    #[test]
    fn unknown_flag_bits_survive_decode() {
        let mut out = [0u8; Account::SIZE];
        out[84] = 0x80;
        let account = Account::decode(&out).expect("decodes");
        assert_eq!(account.flags.bits(), 0x80);
    }
}
