//! Transient ring-buffer allocator for per-bind GPU-resident data.
//!
//! Backs the argument-buffer patch path: every draw that binds a uniform set
//! with dynamic sub-bindings needs a small CPU-writable, GPU-addressable
//! block, far too often for a native allocation per bind. Segments are
//! fixed-capacity native buffers fronted by a [`LinearArena`] each; the
//! allocator grows by appending segments and never frees them. `reset()`
//! only rewinds write heads, and must only be called once the caller knows
//! the GPU has finished consuming the prior frame's allocations.

use std::sync::Arc;

use argent_hal::{align_up, DriverError, GpuDriver, LinearArena, NativeBuffer};
use tracing::debug;

#[derive(Clone, Copy, Debug)]
pub struct RingBufferConfig {
    /// Capacity of each backing segment.
    pub segment_size: u64,
    /// Alignment of every returned offset.
    pub alignment: u64,
    /// Requests below this are rounded up to it.
    pub min_block: u64,
}

impl Default for RingBufferConfig {
    fn default() -> Self {
        Self {
            segment_size: 512 * 1024,
            alignment: 16,
            min_block: 16,
        }
    }
}

/// One allocation. Valid until the allocator's next `reset()`.
pub struct ScratchAlloc<D: GpuDriver> {
    pub buffer: D::Buffer,
    pub segment: usize,
    pub offset: u64,
    pub size: u64,
    /// Direct GPU address of the block, where the platform supports it.
    pub gpu_address: Option<u64>,
    cpu: *mut u8,
}

impl<D: GpuDriver> ScratchAlloc<D> {
    /// Copy `bytes` into the block at `rel_offset`.
    pub fn write_bytes(&self, rel_offset: u64, bytes: &[u8]) {
        assert!(!self.cpu.is_null(), "scratch block has no CPU mapping");
        let end = rel_offset
            .checked_add(bytes.len() as u64)
            .expect("scratch write range overflows");
        assert!(end <= self.size, "scratch write out of bounds");
        unsafe {
            std::ptr::copy_nonoverlapping(
                bytes.as_ptr(),
                self.cpu.add(rel_offset as usize),
                bytes.len(),
            );
        }
    }

    /// Write one little-endian 64-bit word (an argument-buffer entry).
    pub fn write_u64(&self, rel_offset: u64, value: u64) {
        self.write_bytes(rel_offset, &value.to_le_bytes());
    }
}

struct Segment<D: GpuDriver> {
    buffer: D::Buffer,
    arena: LinearArena,
}

pub struct RingBufferAllocator<D: GpuDriver> {
    driver: Arc<D>,
    config: RingBufferConfig,
    segments: Vec<Segment<D>>,
    current: usize,
    changed: bool,
}

impl<D: GpuDriver> RingBufferAllocator<D> {
    pub fn new(driver: Arc<D>, config: RingBufferConfig) -> Self {
        assert!(config.alignment.is_power_of_two(), "alignment must be a power of two");
        Self {
            driver,
            config,
            segments: Vec::new(),
            current: 0,
            changed: false,
        }
    }

    /// Total bytes across all segments (never shrinks).
    pub fn capacity(&self) -> u64 {
        self.segments.iter().map(|s| s.arena.capacity()).sum()
    }

    pub fn segment_count(&self) -> usize {
        self.segments.len()
    }

    /// True once if the backing storage changed since the last call; used to
    /// trigger residency updates for the new segment.
    pub fn take_changed(&mut self) -> bool {
        std::mem::take(&mut self.changed)
    }

    /// Buffer handle of segment `index`.
    pub fn segment_buffer(&self, index: usize) -> &D::Buffer {
        &self.segments[index].buffer
    }

    fn rounded(&self, size: u64) -> u64 {
        align_up(size.max(self.config.min_block), self.config.alignment)
    }

    /// Allocate `size` bytes. Never fails for lack of space (the allocator
    /// grows); only a failed native segment allocation propagates.
    pub fn allocate(&mut self, size: u64) -> Result<ScratchAlloc<D>, DriverError> {
        let size = self.rounded(size);

        // Fast path: the segment the last allocation came from.
        if let Some(offset) = self
            .segments
            .get_mut(self.current)
            .and_then(|s| s.arena.alloc(size, self.config.alignment))
        {
            return Ok(self.make_alloc(self.current, offset, size));
        }

        // Favor reuse over growth: any segment with enough room.
        for index in 0..self.segments.len() {
            if index == self.current {
                continue;
            }
            if let Some(offset) = self.segments[index].arena.alloc(size, self.config.alignment) {
                self.current = index;
                return Ok(self.make_alloc(index, offset, size));
            }
        }

        // Grow. Oversized requests get a dedicated segment.
        let capacity = self.config.segment_size.max(size);
        let buffer = self.driver.new_scratch_buffer(capacity)?;
        let mut arena = LinearArena::new(capacity);
        let offset = arena
            .alloc(size, self.config.alignment)
            .expect("fresh segment cannot fail the allocation that sized it");

        self.segments.push(Segment { buffer, arena });
        self.current = self.segments.len() - 1;
        self.changed = true;
        debug!(
            segments = self.segments.len(),
            capacity = self.capacity(),
            "ring buffer grew"
        );

        Ok(self.make_alloc(self.current, offset, size))
    }

    fn make_alloc(&self, segment: usize, offset: u64, size: u64) -> ScratchAlloc<D> {
        let buffer = &self.segments[segment].buffer;
        let base = buffer.contents();
        let cpu = if base.is_null() {
            std::ptr::null_mut()
        } else {
            // Offsets are bounded by the arena capacity, which equals the
            // buffer length.
            unsafe { base.add(offset as usize) }
        };
        ScratchAlloc {
            buffer: buffer.clone(),
            segment,
            offset,
            size,
            gpu_address: buffer.gpu_address().map(|a| a + offset),
            cpu,
        }
    }

    /// Rewind every segment's write head without freeing storage.
    ///
    /// Caller contract: only call this after the GPU has finished consuming
    /// the prior frame's allocations. No check is performed here.
    pub fn reset(&mut self) {
        for segment in &mut self.segments {
            segment.arena.reset();
        }
        self.current = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use argent_hal::testing::FakeDriver;

    fn ring(segment_size: u64) -> RingBufferAllocator<FakeDriver> {
        RingBufferAllocator::new(
            Arc::new(FakeDriver::new()),
            RingBufferConfig {
                segment_size,
                ..RingBufferConfig::default()
            },
        )
    }

    #[test]
    fn offsets_are_aligned_and_within_capacity() {
        let mut ring = ring(256);
        for request in [1u64, 7, 16, 33, 100] {
            let alloc = ring.allocate(request).unwrap();
            assert_eq!(alloc.offset % 16, 0);
            assert!(alloc.size >= request);
            assert!(alloc.offset + alloc.size <= 256, "allocation exceeds its segment");
        }
    }

    #[test]
    fn small_requests_round_up_to_min_block() {
        let mut ring = ring(256);
        let alloc = ring.allocate(1).unwrap();
        assert_eq!(alloc.size, 16);
    }

    #[test]
    fn reset_rewinds_to_first_segment_offset_zero() {
        let mut ring = ring(128);
        // Force growth into a second segment.
        ring.allocate(100).unwrap();
        ring.allocate(100).unwrap();
        assert_eq!(ring.segment_count(), 2);

        ring.reset();
        let alloc = ring.allocate(100).unwrap();
        assert_eq!(alloc.segment, 0);
        assert_eq!(alloc.offset, 0);
        // Segments persist across reset.
        assert_eq!(ring.segment_count(), 2);
    }

    #[test]
    fn allocation_reuses_existing_segments_before_growing() {
        let mut ring = ring(128);
        ring.allocate(100).unwrap(); // segment 0: 112/128 used
        ring.allocate(128).unwrap(); // segment 1: full
        ring.take_changed();

        // Segment 1 (current) is full; the 16 free bytes of segment 0 serve
        // the request instead of a third segment.
        let alloc = ring.allocate(16).unwrap();
        assert_eq!(alloc.segment, 0);
        assert_eq!(ring.segment_count(), 2);
        assert!(!ring.take_changed());
    }

    #[test]
    fn changed_flag_reports_growth_once() {
        let mut ring = ring(64);
        assert!(!ring.take_changed());
        ring.allocate(32).unwrap();
        assert!(ring.take_changed());
        assert!(!ring.take_changed());

        ring.allocate(64).unwrap(); // second segment
        assert!(ring.take_changed());
    }

    #[test]
    fn oversized_request_gets_a_dedicated_segment() {
        let mut ring = ring(64);
        let alloc = ring.allocate(1000).unwrap();
        assert_eq!(alloc.offset, 0);
        assert!(alloc.size >= 1000);
    }

    #[test]
    fn gpu_address_tracks_segment_base_plus_offset() {
        let mut ring = ring(256);
        let a = ring.allocate(16).unwrap();
        let b = ring.allocate(16).unwrap();
        let base = a.buffer.gpu_address().unwrap();
        assert_eq!(a.gpu_address, Some(base));
        assert_eq!(b.gpu_address, Some(base + 16));
    }

    #[test]
    fn write_bytes_lands_in_backing_memory() {
        let mut ring = ring(256);
        let a = ring.allocate(16).unwrap();
        let b = ring.allocate(16).unwrap();
        a.write_bytes(0, &[0xAA; 16]);
        b.write_u64(0, 0x1122_3344_5566_7788);

        let mut out = [0u8; 8];
        b.buffer.read(b.offset, &mut out);
        assert_eq!(u64::from_le_bytes(out), 0x1122_3344_5566_7788);

        let mut first = [0u8; 1];
        a.buffer.read(a.offset, &mut first);
        assert_eq!(first[0], 0xAA);
    }
}
