pub mod checksum;
pub mod command;
pub mod header;
pub mod operation;

pub use checksum::{Checksum128, checksum};
pub use command::{Command, InvalidCommand};
pub use header::{Header, HeaderDecodeError, PeerType};
pub use operation::{InvalidOperation, Operation};
