use std::cmp::Ordering;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Input bitmask for one player on one frame: direction in the low byte, buttons in the high byte.
pub type InputBits = u16;

/// Composite tick counter.
///
/// `frame` counts simulation ticks within one match instance, `index` counts match
/// instances (every phase change starts a new one with `frame == 0`). Ordering compares
/// `index` first, then `frame`.
///
/// # Examples
///
/// ```
/// use fortress_netplay::IndexedFrame;
///
/// let earlier = IndexedFrame::new(500, 3);
/// let later = IndexedFrame::new(0, 4);
/// assert!(earlier < later);
/// assert_eq!(later.to_string(), "4:0");
/// ```
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct IndexedFrame {
    /// Tick within the current match instance.
    pub frame: u32,
    /// Match instance counter.
    pub index: u32,
}

impl IndexedFrame {
    /// Creates an indexed frame.
    #[must_use]
    pub const fn new(frame: u32, index: u32) -> Self {
        Self { frame, index }
    }

    /// The first frame of match instance `index`.
    #[must_use]
    pub const fn start_of(index: u32) -> Self {
        Self { frame: 0, index }
    }

    /// The following frame within the same index.
    #[must_use]
    pub const fn next(self) -> Self {
        Self {
            frame: self.frame.saturating_add(1),
            index: self.index,
        }
    }

    /// Packs the pair into one integer with the same ordering.
    #[must_use]
    pub const fn value(self) -> u64 {
        ((self.index as u64) << 32) | self.frame as u64
    }
}

impl Ord for IndexedFrame {
    fn cmp(&self, other: &Self) -> Ordering {
        self.index
            .cmp(&other.index)
            .then(self.frame.cmp(&other.frame))
    }
}

impl PartialOrd for IndexedFrame {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for IndexedFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.index, self.frame)
    }
}

/// Inputs sampled locally for one tick.
///
/// `primary` belongs to the local player. `secondary` is only read in local modes
/// (offline and broadcast), where both players sit at the same machine.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq)]
pub struct LocalInputs {
    /// Local player input.
    pub primary: InputBits,
    /// Second local player input (local modes only).
    pub secondary: InputBits,
}

impl LocalInputs {
    /// Inputs for both players of a local session.
    #[must_use]
    pub const fn both(primary: InputBits, secondary: InputBits) -> Self {
        Self { primary, secondary }
    }
}

impl From<InputBits> for LocalInputs {
    fn from(primary: InputBits) -> Self {
        Self {
            primary,
            secondary: 0,
        }
    }
}

// #########
// # TESTS #
// #########

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
    fn index_dominates_frame() {
        assert!(IndexedFrame::new(u32::MAX, 1) < IndexedFrame::new(0, 2));
        assert!(IndexedFrame::new(3, 2) < IndexedFrame::new(4, 2));
        assert_eq!(IndexedFrame::new(7, 7), IndexedFrame::new(7, 7));
    }

    #[test]
    fn packed_value_matches_ordering() {
        let a = IndexedFrame::new(900, 3);
        let b = IndexedFrame::new(1, 4);
        assert!(a.value() < b.value());
        assert_eq!(b.value(), (4_u64 << 32) | 1);
    }

    #[test]
    fn next_keeps_index() {
        let f = IndexedFrame::new(41, 9).next();
        assert_eq!(f, IndexedFrame::new(42, 9));
        assert_eq!(IndexedFrame::start_of(5), IndexedFrame::new(0, 5));
    }

    #[test]
    fn display_is_index_then_frame() {
        assert_eq!(IndexedFrame::new(120, 8).to_string(), "8:120");
    }

    #[test]
    fn local_inputs_from_bits() {
        let inputs = LocalInputs::from(0x0206);
        assert_eq!(inputs.primary, 0x0206);
        assert_eq!(inputs.secondary, 0);
        assert_eq!(LocalInputs::both(1, 2).secondary, 2);
    }
}
