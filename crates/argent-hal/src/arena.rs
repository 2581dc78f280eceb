/// Round `value` up to the nearest multiple of `alignment`.
///
/// `alignment` must be > 0.
pub fn align_up(value: u64, alignment: u64) -> u64 {
    debug_assert!(alignment > 0);

    // `value + alignment - 1` can overflow on pathological inputs; take a
    // checked path with saturating fallback.
    let add = alignment - 1;
    match value.checked_add(add) {
        Some(v) => v / alignment * alignment,
        None => u64::MAX / alignment * alignment,
    }
}

/// Bump allocator over a fixed byte capacity.
///
/// CPU-only bookkeeping: it tracks offsets, never actual GPU memory. One
/// arena fronts one backing segment of a ring allocator.
#[derive(Clone, Debug)]
pub struct LinearArena {
    capacity: u64,
    cursor: u64,
}

impl LinearArena {
    pub fn new(capacity: u64) -> Self {
        Self {
            capacity,
            cursor: 0,
        }
    }

    /// Rewind the write head. Previously returned offsets become reusable.
    pub fn reset(&mut self) {
        self.cursor = 0;
    }

    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    /// Bytes remaining until the arena is full.
    pub fn remaining(&self) -> u64 {
        self.capacity.saturating_sub(self.cursor)
    }

    pub fn cursor(&self) -> u64 {
        self.cursor
    }

    /// Allocate `size` bytes at `alignment`, returning the byte offset.
    pub fn alloc(&mut self, size: u64, alignment: u64) -> Option<u64> {
        let alignment = alignment.max(1);

        let aligned = align_up(self.cursor, alignment);
        let end = aligned.checked_add(size)?;
        if end > self.capacity {
            return None;
        }

        self.cursor = end;
        Some(aligned)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn align_up_rounds_to_multiple() {
        assert_eq!(align_up(0, 16), 0);
        assert_eq!(align_up(1, 16), 16);
        assert_eq!(align_up(16, 16), 16);
        assert_eq!(align_up(17, 16), 32);
        assert_eq!(align_up(255, 256), 256);
    }

    #[test]
    fn alloc_respects_alignment_and_capacity() {
        let mut arena = LinearArena::new(64);

        assert_eq!(arena.alloc(1, 1), Some(0));
        assert_eq!(arena.alloc(1, 16), Some(16));

        // Next 32-byte aligned slot is 32; 16 bytes fit.
        assert_eq!(arena.alloc(16, 32), Some(32));

        // 48..64 remain; 17 bytes do not fit.
        assert_eq!(arena.alloc(17, 1), None);
    }

    #[test]
    fn reset_reuses_space() {
        let mut arena = LinearArena::new(64);
        assert_eq!(arena.alloc(8, 4), Some(0));
        assert_eq!(arena.alloc(8, 4), Some(8));

        arena.reset();
        assert_eq!(arena.alloc(8, 4), Some(0));
    }

    #[test]
    fn oversized_request_fails_without_moving_cursor() {
        let mut arena = LinearArena::new(32);
        assert_eq!(arena.alloc(64, 16), None);
        assert_eq!(arena.cursor(), 0);
        assert_eq!(arena.alloc(32, 16), Some(0));
    }
}
