//! Protocol and system constants for the ledger client.
//!
//! # Design Decisions
//!
//! Size constants use `u32` instead of `usize` so the wire-facing values keep a fixed
//! width on every platform. Use the `_USIZE` variants for buffer lengths and indexing.
//!
//! Timing is expressed in ticks of [`TICK_MS`] milliseconds. All invariants are verified at
//! compile time via `const` assertions.

// =============================================================================
// Platform verification
// =============================================================================

const _: () = assert!(
    size_of::<usize>() >= size_of::<u32>(),
    "Platform must have at least 32-bit addressing"
);

// =============================================================================
// Wire format constants
// =============================================================================

/// Message header size. Every message starts with exactly one header.
pub const HEADER_SIZE: u32 = 128;

/// Sector size; full message buffers carry one sector of padding past [`MESSAGE_SIZE_MAX`].
pub const SECTOR_SIZE: u32 = 4096;

/// Maximum message size (header + body).
pub const MESSAGE_SIZE_MAX: u32 = 1 << 20; // 1 MiB

/// Maximum message body size. Derived as [`MESSAGE_SIZE_MAX`] - [`HEADER_SIZE`].
pub const MESSAGE_BODY_SIZE_MAX: u32 = MESSAGE_SIZE_MAX - HEADER_SIZE;

/// Allocation size of a full message buffer.
pub const MESSAGE_SIZE_MAX_PADDED: u32 = MESSAGE_SIZE_MAX + SECTOR_SIZE;

/// Protocol version. Peers must agree exactly.
pub const VSR_VERSION: u8 = 0;

pub const HEADER_SIZE_USIZE: usize = HEADER_SIZE as usize;
pub const MESSAGE_SIZE_MAX_USIZE: usize = MESSAGE_SIZE_MAX as usize;
pub const MESSAGE_BODY_SIZE_MAX_USIZE: usize = MESSAGE_BODY_SIZE_MAX as usize;
pub const MESSAGE_SIZE_MAX_PADDED_USIZE: usize = MESSAGE_SIZE_MAX_PADDED as usize;

/// Cluster identifier as carried in the header.
pub type ClusterId = u32;

// =============================================================================
// Cluster topology
// =============================================================================

/// Maximum number of replicas a client may be configured with.
pub const REPLICAS_MAX: usize = 6;

/// Maximum number of concurrent client sessions the cluster admits.
pub const CLIENTS_MAX: usize = 32;

/// Connection slots owned by the message bus. A client only dials replicas.
pub const CONNECTIONS_MAX: usize = REPLICAS_MAX;

/// Maximum messages queued for sending on a single connection.
pub const CONNECTION_SEND_QUEUE_MAX: usize = PIPELINING_MAX;

/// Requests the cluster will pipeline on behalf of all clients.
pub const PIPELINING_MAX: usize = CLIENTS_MAX;

/// Full-size messages preallocated by the message bus pool.
pub const MESSAGE_BUS_MESSAGES_MAX: usize = REPLICAS_MAX * 4;

/// Header-only messages preallocated by the message bus pool.
pub const MESSAGE_BUS_HEADERS_MAX: usize = REPLICAS_MAX * CONNECTION_SEND_QUEUE_MAX * 2;

// =============================================================================
// Socket options
// =============================================================================

pub const TCP_RCVBUF: u32 = 4 * 1024 * 1024;
pub const TCP_SNDBUF: u32 = 4 * 1024 * 1024;
pub const TCP_KEEPALIVE: bool = true;
pub const TCP_NODELAY: bool = true;

/// Bounds of the randomized delay before (re)connecting to a replica.
pub const CONNECTION_DELAY_MIN_MS: u64 = 50;
pub const CONNECTION_DELAY_MAX_MS: u64 = 1000;

// =============================================================================
// Timing
// =============================================================================

/// Duration of one protocol tick.
pub const TICK_MS: u64 = 10;

/// Estimated round trip, in ticks.
pub const RTT_TICKS: u64 = 300 / TICK_MS;

/// Multiple of [`RTT_TICKS`] waited before a request is considered lost.
pub const RTT_MULTIPLE: u8 = 2;

/// Bounds of the exponential backoff added to timeouts, in ticks.
pub const BACKOFF_MIN_TICKS: u64 = 10;
pub const BACKOFF_MAX_TICKS: u64 = 1000;

/// Ticks between keepalive pings broadcast to the cluster.
pub const PING_TIMEOUT_TICKS: u64 = 30_000 / TICK_MS;

/// Ticks before the first request resend.
pub const REQUEST_TIMEOUT_TICKS: u64 = RTT_TICKS * RTT_MULTIPLE as u64;

// =============================================================================
// I/O
// =============================================================================

/// Operation slots in the I/O completion queue.
///
/// Each connection holds at most one receive and one send (the connect timer and the
/// connect itself count as the receive), so the queue is never close to this bound.
pub const IO_ENTRIES: u32 = 128;

// =============================================================================
// Compile-time design integrity assertions
// =============================================================================

const _: () = assert!(HEADER_SIZE == 128, "Header must be exactly 128 bytes");
const _: () = assert!(HEADER_SIZE.is_multiple_of(16));

const _: () = assert!(SECTOR_SIZE.is_power_of_two());
const _: () = assert!(SECTOR_SIZE >= HEADER_SIZE);

const _: () = assert!(MESSAGE_SIZE_MAX > HEADER_SIZE);
const _: () = assert!(MESSAGE_SIZE_MAX.is_power_of_two());
const _: () = assert!(MESSAGE_SIZE_MAX >= SECTOR_SIZE);
const _: () = assert!(MESSAGE_SIZE_MAX <= i32::MAX as u32, "size is an i32 on the wire");
const _: () = assert!(MESSAGE_BODY_SIZE_MAX + HEADER_SIZE == MESSAGE_SIZE_MAX);

const _: () = assert!(REPLICAS_MAX > 0);
const _: () = assert!(REPLICAS_MAX <= u8::MAX as usize);
const _: () = assert!(CONNECTIONS_MAX >= REPLICAS_MAX);
const _: () = assert!(2 * CONNECTIONS_MAX <= IO_ENTRIES as usize);
const _: () = assert!(IO_ENTRIES.is_power_of_two());

const _: () = assert!(MESSAGE_BUS_MESSAGES_MAX > 1, "one message must stay free to recv");
const _: () = assert!(MESSAGE_BUS_HEADERS_MAX > 0);

const _: () = assert!(RTT_TICKS > 0);
const _: () = assert!(RTT_MULTIPLE > 0);
const _: () = assert!(BACKOFF_MAX_TICKS > BACKOFF_MIN_TICKS);
const _: () = assert!(CONNECTION_DELAY_MAX_MS > CONNECTION_DELAY_MIN_MS);
const _: () = assert!(PING_TIMEOUT_TICKS > REQUEST_TIMEOUT_TICKS);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn derived_values() {
        assert_eq!(RTT_TICKS, 30);
        assert_eq!(REQUEST_TIMEOUT_TICKS, 60);
        assert_eq!(PING_TIMEOUT_TICKS, 3000);
        assert_eq!(MESSAGE_BUS_MESSAGES_MAX, 24);
        assert_eq!(MESSAGE_BUS_HEADERS_MAX, 384);
        assert_eq!(MESSAGE_SIZE_MAX_PADDED, (1 << 20) + 4096);
    }

    #[test]
    fn usize_mirrors_match() {
        assert_eq!(HEADER_SIZE_USIZE, HEADER_SIZE as usize);
        assert_eq!(MESSAGE_SIZE_MAX_USIZE, MESSAGE_SIZE_MAX as usize);
        assert_eq!(MESSAGE_BODY_SIZE_MAX_USIZE, MESSAGE_BODY_SIZE_MAX as usize);
        assert_eq!(MESSAGE_SIZE_MAX_PADDED_USIZE, MESSAGE_SIZE_MAX_PADDED as usize);
    }
}
