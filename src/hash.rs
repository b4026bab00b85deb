//! Deterministic digests for desync detection.
//!
//! Both peers must compute identical digests for identical state, on any platform and
//! in any process. `std`'s `DefaultHasher` is randomly seeded, so this module uses
//! FNV-1a with its fixed offset basis instead. FNV-1a is not cryptographically secure,
//! which is fine for catching accidental divergence.
//!
//! ```
//! use fortress_netplay::hash::state_digest;
//! use fortress_netplay::IndexedFrame;
//!
//! let at = IndexedFrame::new(300, 4);
//! let a = state_digest(at, &[1, 2, 3]);
//! assert_eq!(a, state_digest(at, &[1, 2, 3]));
//! assert_ne!(a, state_digest(at, &[1, 2, 4]));
//! ```

use std::hash::{Hash, Hasher};

use crate::frame_info::IndexedFrame;

/// FNV-1a 64-bit offset basis constant.
const FNV_OFFSET_BASIS: u64 = 0xcbf2_9ce4_8422_2325;

/// FNV-1a 64-bit prime constant.
const FNV_PRIME: u64 = 0x0100_0000_01b3;

/// A deterministic hasher using the FNV-1a algorithm.
///
/// ```
/// use fortress_netplay::hash::DeterministicHasher;
/// use std::hash::{Hash, Hasher};
///
/// let mut hasher = DeterministicHasher::new();
/// 42u32.hash(&mut hasher);
/// let hash = hasher.finish();
///
/// let mut hasher2 = DeterministicHasher::new();
/// 42u32.hash(&mut hasher2);
/// assert_eq!(hash, hasher2.finish());
/// ```
#[derive(Debug, Clone)]
pub struct DeterministicHasher {
    state: u64,
}

impl DeterministicHasher {
    /// Creates a new `DeterministicHasher` with the standard FNV-1a offset basis.
    #[inline]
    #[must_use]
    pub const fn new() -> Self {
        Self {
            state: FNV_OFFSET_BASIS,
        }
    }
}

impl Default for DeterministicHasher {
    fn default() -> Self {
        Self::new()
    }
}

impl Hasher for DeterministicHasher {
    #[inline]
    fn finish(&self) -> u64 {
        self.state
    }

    #[inline]
    fn write(&mut self, bytes: &[u8]) {
        for &byte in bytes {
            self.state ^= u64::from(byte);
            self.state = self.state.wrapping_mul(FNV_PRIME);
        }
    }
}

/// Computes a deterministic FNV-1a hash of the given value.
#[inline]
pub fn fnv1a_hash<T: Hash>(value: &T) -> u64 {
    let mut hasher = DeterministicHasher::new();
    value.hash(&mut hasher);
    hasher.finish()
}

/// Digest of the shared generator state at a checkpoint.
///
/// Fields are fed as little-endian bytes so the digest does not depend on how `Hash`
/// is implemented for the integer types.
#[must_use]
pub fn state_digest(at: IndexedFrame, rng_state: &[u8]) -> u64 {
    let mut hasher = DeterministicHasher::new();
    hasher.write(&at.index.to_le_bytes());
    hasher.write(&at.frame.to_le_bytes());
    hasher.write(rng_state);
    hasher.finish()
}

#[cfg(test)]
#[allow(
    clippy::panic,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing
)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_hasher_is_offset_basis() {
        let hasher = DeterministicHasher::new();
        assert_eq!(hasher.finish(), FNV_OFFSET_BASIS);
    }

    #[test]
    fn test_known_fnv1a_values() {
        let mut hasher = DeterministicHasher::new();
        hasher.write(b"a");
        assert_eq!(hasher.finish(), 0xaf63_dc4c_8601_ec8c);

        let mut hasher = DeterministicHasher::new();
        hasher.write(b"foobar");
        assert_eq!(hasher.finish(), 0x8594_4171_f739_67e8);
    }

    #[test]
    fn test_fnv1a_hash_consistency() {
        assert_eq!(fnv1a_hash(&42u32), fnv1a_hash(&42u32));
        assert_ne!(fnv1a_hash(&42u32), fnv1a_hash(&43u32));
    }

    #[test]
    fn test_state_digest_covers_frame_and_index() {
        let blob = [9_u8; 16];
        let base = state_digest(IndexedFrame::new(300, 4), &blob);
        assert_ne!(base, state_digest(IndexedFrame::new(301, 4), &blob));
        assert_ne!(base, state_digest(IndexedFrame::new(300, 5), &blob));
    }

    #[test]
    fn test_state_digest_covers_blob() {
        let at = IndexedFrame::new(600, 10);
        let mut blob = vec![0_u8; 32];
        let before = state_digest(at, &blob);
        blob[31] = 1;
        assert_ne!(before, state_digest(at, &blob));
    }
}
