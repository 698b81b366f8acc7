//! BLAKE3 digest truncated to 128 bits, used as the wire-format checksum.
//!
//! There is no key: the checksum detects corruption and anchors the request/reply hash
//! chain, it does not authenticate peers.

pub type Checksum128 = u128;

/// Computes the 128-bit checksum of `data`.
///
/// The first 16 bytes of the BLAKE3 digest are read as a little-endian `u128` to match
/// the wire format.
///
/// # Examples
/// ```
/// use ledger_client::vsr::wire::checksum;
///
/// let tag = checksum::checksum(b"message");
/// assert_eq!(tag, checksum::checksum(b"message"));
/// ```
pub fn checksum(data: &[u8]) -> Checksum128 {
    let digest = blake3::hash(data);
    let mut truncated = [0u8; 16];
    truncated.copy_from_slice(&digest.as_bytes()[..16]);
    u128::from_le_bytes(truncated)
}
