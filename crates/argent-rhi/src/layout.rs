//! Placement of dynamic sub-binding frame indices inside the per-draw
//! dynamic-offsets word.
//!
//! Each draw may carry one 32-bit "dynamic offsets" word. Every dynamic
//! sub-binding of every bound uniform set owns 4 bits of it, holding that
//! binding's rotating frame index (0..=15). This layout records, per uniform
//! set, where the set's run of nibbles starts and how long it is.

/// Uniform-set indices run 0..16.
pub const MAX_UNIFORM_SETS: u32 = 16;

/// Nibbles addressable in the 32-bit dynamic-offsets word.
const MAX_DYNAMIC_NIBBLES: u32 = 8;

/// Per-set 4-bit start-shift and 4-bit count, packed into two 64-bit words
/// (16 sets x 4 bits each). The capacity limits (at most 16 sets, 4-bit
/// shift, 4-bit count, all shifts addressing a 32-bit word) are asserted on
/// every mutation.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DynamicOffsetLayout {
    starts: u64,
    counts: u64,
}

impl DynamicOffsetLayout {
    pub fn new() -> Self {
        Self::default()
    }

    fn nibble(word: u64, set: u32) -> u32 {
        ((word >> (set * 4)) & 0xF) as u32
    }

    fn set_nibble(word: &mut u64, set: u32, value: u32) {
        debug_assert!(value < 16);
        let shift = set * 4;
        *word = (*word & !(0xF << shift)) | ((value as u64) << shift);
    }

    /// Number of dynamic sub-bindings registered for `set`.
    pub fn count(&self, set: u32) -> u32 {
        assert!(set < MAX_UNIFORM_SETS, "uniform set index out of range");
        Self::nibble(self.counts, set)
    }

    /// First nibble index owned by `set`.
    pub fn start(&self, set: u32) -> u32 {
        assert!(set < MAX_UNIFORM_SETS, "uniform set index out of range");
        Self::nibble(self.starts, set)
    }

    /// Total nibbles claimed across all registered sets.
    pub fn total(&self) -> u32 {
        (0..MAX_UNIFORM_SETS).map(|s| Self::nibble(self.counts, s)).sum()
    }

    /// Claim `count` nibbles for `set`, starting after all prior claims.
    ///
    /// Contract violations (set out of range, set already registered,
    /// overflowing the 32-bit offsets word) panic.
    pub fn register(&mut self, set: u32, count: u32) {
        assert!(set < MAX_UNIFORM_SETS, "uniform set index out of range");
        assert!(count > 0 && count < 16, "dynamic sub-binding count must be 1..=15");
        assert_eq!(self.count(set), 0, "uniform set registered twice");

        let start = self.total();
        assert!(
            start + count <= MAX_DYNAMIC_NIBBLES,
            "dynamic sub-bindings overflow the 32-bit dynamic-offsets word"
        );

        Self::set_nibble(&mut self.starts, set, start);
        Self::set_nibble(&mut self.counts, set, count);
    }

    /// Bit position, inside the caller's 32-bit dynamic-offsets word, of the
    /// 4-bit frame index for sub-binding `k` of `set`.
    pub fn offset_index_shift(&self, set: u32, k: u32) -> u32 {
        let count = self.count(set);
        assert!(k < count, "dynamic sub-binding index out of range");
        (self.start(set) + k) * 4
    }

    /// Unpack sub-binding `k`'s rotating frame index from `word`.
    pub fn frame_index(&self, word: u32, set: u32, k: u32) -> u32 {
        (word >> self.offset_index_shift(set, k)) & 0xF
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shifts_are_strictly_increasing_and_non_overlapping() {
        let mut layout = DynamicOffsetLayout::new();
        layout.register(0, 2);
        layout.register(3, 1);
        layout.register(7, 3);

        let mut shifts = Vec::new();
        for (set, count) in [(0, 2), (3, 1), (7, 3)] {
            for k in 0..count {
                shifts.push(layout.offset_index_shift(set, k));
            }
        }

        for pair in shifts.windows(2) {
            assert!(pair[1] >= pair[0] + 4, "shifts overlap: {pair:?}");
        }
        assert!(shifts.iter().all(|s| s + 4 <= 32));
    }

    #[test]
    fn frame_index_unpacks_the_right_nibble() {
        let mut layout = DynamicOffsetLayout::new();
        layout.register(1, 2);

        // Sub-binding 0 occupies bits 0..4, sub-binding 1 bits 4..8.
        let word = (3 << 0) | (9 << 4);
        assert_eq!(layout.frame_index(word, 1, 0), 3);
        assert_eq!(layout.frame_index(word, 1, 1), 9);
    }

    #[test]
    fn registration_is_cumulative_across_sets() {
        let mut layout = DynamicOffsetLayout::new();
        layout.register(2, 4);
        layout.register(5, 2);

        assert_eq!(layout.start(2), 0);
        assert_eq!(layout.start(5), 4);
        assert_eq!(layout.total(), 6);
        assert_eq!(layout.offset_index_shift(5, 1), 20);
    }

    #[test]
    #[should_panic(expected = "overflow the 32-bit dynamic-offsets word")]
    fn word_capacity_is_a_hard_invariant() {
        let mut layout = DynamicOffsetLayout::new();
        layout.register(0, 6);
        layout.register(1, 3);
    }

    #[test]
    #[should_panic(expected = "registered twice")]
    fn double_registration_panics() {
        let mut layout = DynamicOffsetLayout::new();
        layout.register(4, 1);
        layout.register(4, 1);
    }

    #[test]
    #[should_panic(expected = "out of range")]
    fn set_index_is_bounded() {
        let mut layout = DynamicOffsetLayout::new();
        layout.register(16, 1);
    }
}
