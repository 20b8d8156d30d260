//! Hashing shared by the sticky strategies.

use sha2::{Digest, Sha256};

/// Process-independent 64-bit hash of `input`.
///
/// Unlike `std`'s `DefaultHasher` the value never changes between runs or
/// builds, so ring positions and IP buckets stay put across restarts.
pub fn stable_hash(input: &str) -> u64 {
    let digest = Sha256::digest(input.as_bytes());
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&digest[..8]);
    u64::from_be_bytes(bytes)
}
