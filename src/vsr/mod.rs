//! Viewstamped Replication, client side: wire format, transport and session.

pub mod bus;
pub mod connection;
pub mod session;
pub mod timeout;
pub mod wire;

pub use bus::{MessageBus, Transport};
pub use connection::{Connection, ConnectionState, Peer};
pub use session::{Callback, Session};
pub use timeout::{Timeout, exponential_backoff_with_jitter};
