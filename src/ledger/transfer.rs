use bitflags::bitflags;

use super::{Record, RecordDecodeError, read_u32, read_u64, read_u128, write};

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct TransferFlags: u32 {
        const LINKED = 1 << 0;
        /// Reserve the amount now and accept or reject it with a later [`super::Commit`].
        const TWO_PHASE_COMMIT = 1 << 1;
        const CONDITION = 1 << 2;
    }
}

/// Movement of `amount` from a debit account to a credit account.
///
/// ```text
/// Bytes 0-15:    id
/// Bytes 16-31:   debit_account_id
/// Bytes 32-47:   credit_account_id
/// Bytes 48-63:   user_data
/// Bytes 64-95:   reserved
/// Bytes 96-103:  timeout (u64)
/// Bytes 104-107: code (u32)
/// Bytes 108-111: flags (u32)
/// Bytes 112-119: amount (u64)
/// Bytes 120-127: timestamp
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Transfer {
    pub id: u128,
    pub debit_account_id: u128,
    pub credit_account_id: u128,
    pub user_data: u128,
    pub reserved: [u8; 32],
    /// Only meaningful for two-phase transfers.
    pub timeout: u64,
    pub code: u32,
    pub flags: TransferFlags,
    pub amount: u64,
    pub timestamp: u64,
}

impl Record for Transfer {
    const SIZE: usize = 128;

    fn encode(&self, out: &mut [u8]) {
        assert!(out.len() == Self::SIZE);
        write(out, 0, &self.id.to_le_bytes());
        write(out, 16, &self.debit_account_id.to_le_bytes());
        write(out, 32, &self.credit_account_id.to_le_bytes());
        write(out, 48, &self.user_data.to_le_bytes());
        write(out, 64, &self.reserved);
        write(out, 96, &self.timeout.to_le_bytes());
        write(out, 104, &self.code.to_le_bytes());
        write(out, 108, &self.flags.bits().to_le_bytes());
        write(out, 112, &self.amount.to_le_bytes());
        write(out, 120, &self.timestamp.to_le_bytes());
    }

    fn decode(bytes: &[u8]) -> Result<Self, RecordDecodeError> {
        assert!(bytes.len() == Self::SIZE);
        let mut reserved = [0u8; 32];
        reserved.copy_from_slice(&bytes[64..96]);

        Ok(Self {
            id: read_u128(bytes, 0),
            debit_account_id: read_u128(bytes, 16),
            credit_account_id: read_u128(bytes, 32),
            user_data: read_u128(bytes, 48),
            reserved,
            timeout: read_u64(bytes, 96),
            code: read_u32(bytes, 104),
            flags: TransferFlags::from_bits_retain(read_u32(bytes, 108)),
            amount: read_u64(bytes, 112),
            timestamp: read_u64(bytes, 120),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn field_offsets() {
        let transfer = Transfer {
            id: 1,
            debit_account_id: 2,
            credit_account_id: 3,
            timeout: 4,
            code: 5,
            flags: TransferFlags::TWO_PHASE_COMMIT,
            amount: 6,
            ..Transfer::default()
        };
        let mut out = [0u8; Transfer::SIZE];
        transfer.encode(&mut out);

        assert_eq!(out[16], 2);
        assert_eq!(out[32], 3);
        assert_eq!(out[96], 4);
        assert_eq!(out[104], 5);
        assert_eq!(out[108], 0b10);
        assert_eq!(out[112], 6);
        assert_eq!(Transfer::decode(&out), Ok(transfer));
    }
}
