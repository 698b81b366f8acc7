//! Per-event outcomes returned by the create and commit operations.
//!
//! Replies list only the events that did not succeed, as `{index, result}` pairs where
//! `index` is the event's position in the submitted batch. An empty reply means every
//! event was applied.

use super::{Record, RecordDecodeError, read_u32, write};

macro_rules! result_codes {
    (
        $(#[$meta:meta])*
        pub enum $name:ident { $($variant:ident = $code:literal,)+ }
    ) => {
        $(#[$meta])*
        #[repr(u32)]
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        pub enum $name {
            $($variant = $code,)+
        }

        impl $name {
            pub const ALL: &'static [Self] = &[$(Self::$variant,)+];

            #[inline]
            pub const fn as_u32(self) -> u32 {
                self as u32
            }

            #[inline]
            pub fn try_from_u32(code: u32) -> Option<Self> {
                match code {
                    $($code => Some(Self::$variant),)+
                    _ => None,
                }
            }
        }

        impl TryFrom<u32> for $name {
            type Error = RecordDecodeError;

            fn try_from(code: u32) -> Result<Self, Self::Error> {
                Self::try_from_u32(code).ok_or(RecordDecodeError::UnknownResult { code })
            }
        }
    };
}

result_codes! {
    pub enum CreateAccountResult {
        Ok = 0,
        LinkedEventFailed = 1,
        Exists = 2,
        ExistsWithDifferentUserData = 3,
        ExistsWithDifferentReservedField = 4,
        ExistsWithDifferentUnit = 5,
        ExistsWithDifferentCode = 6,
        ExistsWithDifferentFlags = 7,
        ExceedsCredits = 8,
        ExceedsDebits = 9,
        ReservedField = 10,
        ReservedFlagPadding = 11,
    }
}

result_codes! {
    pub enum CreateTransferResult {
        Ok = 0,
        LinkedEventFailed = 1,
        Exists = 2,
        ExistsWithDifferentDebitAccountId = 3,
        ExistsWithDifferentCreditAccountId = 4,
        ExistsWithDifferentUserData = 5,
        ExistsWithDifferentReservedField = 6,
        ExistsWithDifferentCode = 7,
        ExistsWithDifferentAmount = 8,
        ExistsWithDifferentTimeout = 9,
        ExistsWithDifferentFlags = 10,
        ExistsAndAlreadyCommittedAndAccepted = 11,
        ExistsAndAlreadyCommittedAndRejected = 12,
        ReservedField = 13,
        ReservedFlagPadding = 14,
        DebitAccountNotFound = 15,
        CreditAccountNotFound = 16,
        AccountsAreTheSame = 17,
        AccountsHaveDifferentUnits = 18,
        AmountIsZero = 19,
        ExceedsCredits = 20,
        ExceedsDebits = 21,
        TwoPhaseCommitMustTimeout = 22,
        TimeoutReservedForTwoPhaseCommit = 23,
    }
}

result_codes! {
    pub enum CommitTransferResult {
        Ok = 0,
        LinkedEventFailed = 1,
        ReservedField = 2,
        ReservedFlagPadding = 3,
        TransferNotFound = 4,
        TransferNotTwoPhaseCommit = 5,
        TransferExpired = 6,
        AlreadyCommitted = 7,
        AlreadyCommittedButAccepted = 8,
        AlreadyCommittedButRejected = 9,
        DebitAccountNotFound = 10,
        CreditAccountNotFound = 11,
        DebitAmountWasNotReserved = 12,
        CreditAmountWasNotReserved = 13,
        ExceedsCredits = 14,
        ExceedsDebits = 15,
        ConditionRequiresPreimage = 16,
        PreimageRequiresCondition = 17,
        PreimageInvalid = 18,
    }
}

macro_rules! indexed_result {
    ($(#[$meta:meta])* $name:ident, $code:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq)]
        pub struct $name {
            /// Position of the failed event in the submitted batch.
            pub index: u32,
            pub result: $code,
        }

        impl Record for $name {
            const SIZE: usize = 8;

            fn encode(&self, out: &mut [u8]) {
                assert!(out.len() == Self::SIZE);
                write(out, 0, &self.index.to_le_bytes());
                write(out, 4, &self.result.as_u32().to_le_bytes());
            }

            fn decode(bytes: &[u8]) -> Result<Self, RecordDecodeError> {
                assert!(bytes.len() == Self::SIZE);
                Ok(Self {
                    index: read_u32(bytes, 0),
                    result: $code::try_from(read_u32(bytes, 4))?,
                })
            }
        }
    };
}

indexed_result!(CreateAccountsResult, CreateAccountResult);
indexed_result!(CreateTransfersResult, CreateTransferResult);
indexed_result!(CommitTransfersResult, CommitTransferResult);

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::decode_batch;

    #[test]
    fn codes_are_contiguous_from_zero() {
        for (i, code) in CreateAccountResult::ALL.iter().enumerate() {
            assert_eq!(code.as_u32(), i as u32);
        }
        for (i, code) in CreateTransferResult::ALL.iter().enumerate() {
            assert_eq!(code.as_u32(), i as u32);
        }
        for (i, code) in CommitTransferResult::ALL.iter().enumerate() {
            assert_eq!(code.as_u32(), i as u32);
        }
        assert_eq!(CreateAccountResult::ALL.len(), 12);
        assert_eq!(CreateTransferResult::ALL.len(), 24);
        assert_eq!(CommitTransferResult::ALL.len(), 19);
    }

    #[test]
    fn indexed_result_decodes() {
        let mut body = Vec::new();
        body.extend_from_slice(&1u32.to_le_bytes());
        body.extend_from_slice(&CreateTransferResult::AmountIsZero.as_u32().to_le_bytes());

        let results = decode_batch::<CreateTransfersResult>(&body).expect("decodes");
        assert_eq!(
            results,
            vec![CreateTransfersResult {
                index: 1,
                result: CreateTransferResult::AmountIsZero,
            }]
        );
    }

    #[test]
    fn unknown_code_is_rejected() {
        let mut body = [0u8; 8];
        body[4..].copy_from_slice(&99u32.to_le_bytes());
        assert_eq!(
            CommitTransfersResult::decode(&body),
            Err(RecordDecodeError::UnknownResult { code: 99 })
        );
    }
}
