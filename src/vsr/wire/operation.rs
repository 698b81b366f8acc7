//! State machine operation carried in `Header.operation`.
//!
//! `Reserved`, `Init` and `Register` are protocol-internal; the rest are the ledger
//! operations a client may request.

#[repr(u8)]
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum Operation {
    Reserved = 0,
    Init = 1,
    Register = 2,

    CreateAccounts = 3,
    CreateTransfers = 4,
    CommitTransfers = 5,
    LookupAccounts = 6,
}

pub const OPERATION_MAX: u8 = 6;

const _: () = {
    assert!(Operation::Reserved as u8 == 0);
    assert!(Operation::LookupAccounts as u8 == OPERATION_MAX);
    assert!(core::mem::size_of::<Operation>() == 1);
};

impl Operation {
    pub const ALL: [Self; OPERATION_MAX as usize + 1] = [
        Self::Reserved,
        Self::Init,
        Self::Register,
        Self::CreateAccounts,
        Self::CreateTransfers,
        Self::CommitTransfers,
        Self::LookupAccounts,
    ];

    #[inline]
    pub const fn as_u8(self) -> u8 {
        self as u8
    }

    #[inline]
    pub fn try_from_u8(b: u8) -> Option<Self> {
        Self::ALL.get(b as usize).copied()
    }

    /// True for the operations an application may submit through a session.
    #[inline]
    pub const fn is_client_facing(self) -> bool {
        matches!(
            self,
            Self::CreateAccounts
                | Self::CreateTransfers
                | Self::CommitTransfers
                | Self::LookupAccounts
        )
    }
}

impl From<Operation> for u8 {
    #[inline]
    fn from(op: Operation) -> u8 {
        op.as_u8()
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct InvalidOperation(pub u8);

impl core::fmt::Display for InvalidOperation {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "invalid operation byte: {}", self.0)
    }
}

impl std::error::Error for InvalidOperation {}

impl TryFrom<u8> for Operation {
    type Error = InvalidOperation;

    #[inline]
    fn try_from(b: u8) -> Result<Self, Self::Error> {
        Self::try_from_u8(b).ok_or(InvalidOperation(b))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn discriminants_are_stable() {
        assert_eq!(Operation::Reserved.as_u8(), 0);
        assert_eq!(Operation::Init.as_u8(), 1);
        assert_eq!(Operation::Register.as_u8(), 2);
        assert_eq!(Operation::CreateAccounts.as_u8(), 3);
        assert_eq!(Operation::CreateTransfers.as_u8(), 4);
        assert_eq!(Operation::CommitTransfers.as_u8(), 5);
        assert_eq!(Operation::LookupAccounts.as_u8(), 6);
    }

    #[test]
    fn only_ledger_operations_are_client_facing() {
        let facing: Vec<_> = Operation::ALL
            .into_iter()
            .filter(|op| op.is_client_facing())
            .collect();
        assert_eq!(
            facing,
            vec![
                Operation::CreateAccounts,
                Operation::CreateTransfers,
                Operation::CommitTransfers,
                Operation::LookupAccounts,
            ]
        );
    }

    proptest! {
        #[test]
        fn try_from_roundtrips_or_rejects(byte: u8) {
            match Operation::try_from(byte) {
                Ok(op) => prop_assert_eq!(op.as_u8(), byte),
                Err(InvalidOperation(b)) => {
                    prop_assert_eq!(b, byte);
                    prop_assert!(byte > OPERATION_MAX);
                }
            }
        }
    }
}
