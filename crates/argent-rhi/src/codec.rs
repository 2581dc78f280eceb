//! Uniform-set binding codec.
//!
//! Two strategies, chosen per shader at creation time. Direct binding sets
//! each slot individually through a de-duplicating cache, so rebinding an
//! identical set is free and a rotating-frame change degrades to an
//! offset-only rebind. Argument-buffer binding sets one buffer per set: the
//! pre-baked blob when nothing varies per draw, otherwise a ring-allocated
//! copy of the set's template with each dynamic address patched for the
//! draw's frame indices.

use std::collections::HashMap;

use argent_hal::{
    ComputeEncoder as _, GpuDriver, NativeResource, NativeSampler, RenderEncoder as _,
    RenderStage, Stage,
};
use smallvec::SmallVec;

use crate::error::RhiError;
use crate::reflection::{BindingStrategy, ShaderLayout, StageSlots};
use crate::ring::RingBufferAllocator;
use crate::uniform_set::{BoundResource, UniformSet};

/// The active encoder a bind is encoded into. Blit passes bind no uniforms.
pub(crate) enum PassEncoder<'a, D: GpuDriver> {
    Render(&'a mut D::RenderEncoder),
    Compute(&'a mut D::ComputeEncoder),
}

/// One of the native API's per-stage slot tables.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
enum SlotTable {
    Vertex,
    Fragment,
    Compute,
}

impl<'a, D: GpuDriver> PassEncoder<'a, D> {
    /// Slot tables this encoder exposes for a binding's per-stage slots.
    fn tables(&self, slots: StageSlots) -> SmallVec<[(SlotTable, u32); 2]> {
        let mut out = SmallVec::new();
        match self {
            PassEncoder::Render(_) => {
                if let Some(slot) = slots.vertex {
                    out.push((SlotTable::Vertex, slot));
                }
                if let Some(slot) = slots.fragment {
                    out.push((SlotTable::Fragment, slot));
                }
            }
            PassEncoder::Compute(_) => {
                if let Some(slot) = slots.compute {
                    out.push((SlotTable::Compute, slot));
                }
            }
        }
        out
    }

    fn set_buffer(&mut self, table: SlotTable, slot: u32, buffer: &D::Buffer, offset: u64) {
        match (self, table) {
            (PassEncoder::Render(e), SlotTable::Vertex) => {
                e.set_buffer(RenderStage::Vertex, slot, buffer, offset)
            }
            (PassEncoder::Render(e), SlotTable::Fragment) => {
                e.set_buffer(RenderStage::Fragment, slot, buffer, offset)
            }
            (PassEncoder::Compute(e), SlotTable::Compute) => e.set_buffer(slot, buffer, offset),
            _ => unreachable!("slot table does not belong to this encoder"),
        }
    }

    fn set_buffer_offset(&mut self, table: SlotTable, slot: u32, offset: u64) {
        match (self, table) {
            (PassEncoder::Render(e), SlotTable::Vertex) => {
                e.set_buffer_offset(RenderStage::Vertex, slot, offset)
            }
            (PassEncoder::Render(e), SlotTable::Fragment) => {
                e.set_buffer_offset(RenderStage::Fragment, slot, offset)
            }
            (PassEncoder::Compute(e), SlotTable::Compute) => e.set_buffer_offset(slot, offset),
            _ => unreachable!("slot table does not belong to this encoder"),
        }
    }

    fn set_texture(&mut self, table: SlotTable, slot: u32, texture: &D::Texture) {
        match (self, table) {
            (PassEncoder::Render(e), SlotTable::Vertex) => {
                e.set_texture(RenderStage::Vertex, slot, texture)
            }
            (PassEncoder::Render(e), SlotTable::Fragment) => {
                e.set_texture(RenderStage::Fragment, slot, texture)
            }
            (PassEncoder::Compute(e), SlotTable::Compute) => e.set_texture(slot, texture),
            _ => unreachable!("slot table does not belong to this encoder"),
        }
    }

    fn set_sampler(&mut self, table: SlotTable, slot: u32, sampler: &D::Sampler) {
        match (self, table) {
            (PassEncoder::Render(e), SlotTable::Vertex) => {
                e.set_sampler(RenderStage::Vertex, slot, sampler)
            }
            (PassEncoder::Render(e), SlotTable::Fragment) => {
                e.set_sampler(RenderStage::Fragment, slot, sampler)
            }
            (PassEncoder::Compute(e), SlotTable::Compute) => e.set_sampler(slot, sampler),
            _ => unreachable!("slot table does not belong to this encoder"),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
enum SlotKind {
    Buffer,
    Texture,
    Sampler,
}

#[derive(Clone, Copy, PartialEq, Eq)]
struct CachedSlot {
    resource: u64,
    offset: u64,
}

enum BindAction {
    Skip,
    OffsetOnly,
    Rebind,
}

/// Per-encoder de-duplicating slot cache. Cleared when the encoder ends;
/// native slot tables survive pipeline binds, so a pipeline change alone
/// does not invalidate it.
#[derive(Default)]
pub struct BindingCache {
    slots: HashMap<(SlotTable, SlotKind, u32), CachedSlot>,
}

impl BindingCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn clear(&mut self) {
        self.slots.clear();
    }

    fn update(
        &mut self,
        table: SlotTable,
        kind: SlotKind,
        slot: u32,
        resource: u64,
        offset: u64,
    ) -> BindAction {
        let next = CachedSlot { resource, offset };
        match self.slots.insert((table, kind, slot), next) {
            Some(prev) if prev == next => BindAction::Skip,
            Some(prev) if kind == SlotKind::Buffer && prev.resource == resource => {
                BindAction::OffsetOnly
            }
            _ => BindAction::Rebind,
        }
    }
}

/// Encode one uniform-set bind into the active encoder.
///
/// `dynamic_offsets` is the caller's per-draw word holding every dynamic
/// sub-binding's 4-bit rotating frame index, placed per the shader's
/// [`crate::DynamicOffsetLayout`].
pub(crate) fn bind_uniform_set<D: GpuDriver>(
    encoder: &mut PassEncoder<'_, D>,
    cache: &mut BindingCache,
    ring: &mut RingBufferAllocator<D>,
    shader: &ShaderLayout,
    set: &UniformSet<D>,
    dynamic_offsets: u32,
) -> Result<(), RhiError> {
    match shader.strategy {
        BindingStrategy::Direct => {
            bind_direct(encoder, cache, shader, set, dynamic_offsets);
            Ok(())
        }
        BindingStrategy::ArgumentBuffer => {
            bind_argument_buffer(encoder, ring, shader, set, dynamic_offsets)
        }
    }
}

fn bind_direct<D: GpuDriver>(
    encoder: &mut PassEncoder<'_, D>,
    cache: &mut BindingCache,
    shader: &ShaderLayout,
    set: &UniformSet<D>,
    dynamic_offsets: u32,
) {
    let layout = set.layout();
    let mut dynamic_ordinal = 0u32;

    for (slot, resource) in layout.bindings.iter().zip(set.resources()) {
        match resource {
            BoundResource::Buffer { buffer, offset } => {
                let mut effective = *offset;
                if let Some(dynamic) = slot.dynamic {
                    let frame = shader
                        .dynamic_offsets
                        .frame_index(dynamic_offsets, layout.index, dynamic_ordinal);
                    dynamic_ordinal += 1;
                    effective += frame as u64 * dynamic.per_frame_size;
                }
                for (table, index) in encoder.tables(slot.slots) {
                    match cache.update(table, SlotKind::Buffer, index, buffer.id().0, effective) {
                        BindAction::Skip => {}
                        BindAction::OffsetOnly => encoder.set_buffer_offset(table, index, effective),
                        BindAction::Rebind => encoder.set_buffer(table, index, buffer, effective),
                    }
                }
            }
            BoundResource::Texture(texture) => {
                for (table, index) in encoder.tables(slot.slots) {
                    match cache.update(table, SlotKind::Texture, index, texture.id().0, 0) {
                        BindAction::Skip => {}
                        _ => encoder.set_texture(table, index, texture),
                    }
                }
            }
            BoundResource::Sampler(sampler) => {
                for (table, index) in encoder.tables(slot.slots) {
                    match cache.update(table, SlotKind::Sampler, index, sampler.gpu_handle(), 0) {
                        BindAction::Skip => {}
                        _ => encoder.set_sampler(table, index, sampler),
                    }
                }
            }
        }
    }
}

/// Argument-buffer sets bind at buffer slot = set index, in every stage the
/// set's combined usage names.
fn bind_argument_buffer<D: GpuDriver>(
    encoder: &mut PassEncoder<'_, D>,
    ring: &mut RingBufferAllocator<D>,
    shader: &ShaderLayout,
    set: &UniformSet<D>,
    dynamic_offsets: u32,
) -> Result<(), RhiError> {
    let layout = set.layout();
    let tables = argument_tables(encoder, set);

    if let Some(blob) = set.baked_blob() {
        // Static set: the blob never changes, but variants of the bound
        // pipeline may disagree on slot layouts, so bind unconditionally.
        for (table, index) in tables {
            encoder.set_buffer(table, index, blob, 0);
        }
        return Ok(());
    }

    let (bytes, patches) = set
        .template()
        .expect("argument-buffer set is either baked or templated");
    let alloc = ring.allocate(bytes.len() as u64)?;
    alloc.write_bytes(0, bytes);
    for patch in patches {
        let frame = shader
            .dynamic_offsets
            .frame_index(dynamic_offsets, layout.index, patch.ordinal);
        alloc.write_u64(
            patch.blob_offset,
            patch.base_address + frame as u64 * patch.per_frame_size,
        );
    }
    for (table, index) in tables {
        encoder.set_buffer(table, index, &alloc.buffer, alloc.offset);
    }
    Ok(())
}

fn argument_tables<D: GpuDriver>(
    encoder: &PassEncoder<'_, D>,
    set: &UniformSet<D>,
) -> SmallVec<[(SlotTable, u32); 2]> {
    let index = set.index();
    let usage = set.layout().stage_usage();
    let mut out = SmallVec::new();
    match encoder {
        PassEncoder::Render(_) => {
            for stage in usage.stages() {
                match stage {
                    Stage::Vertex => out.push((SlotTable::Vertex, index)),
                    Stage::Fragment => out.push((SlotTable::Fragment, index)),
                    _ => {}
                }
            }
        }
        PassEncoder::Compute(_) => out.push((SlotTable::Compute, index)),
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use argent_hal::testing::{FakeDriver, FakeEvent};
    use argent_hal::{
        Access, NativeBuffer, NativeCommandBuffer as _, QueueStages, RenderPassDesc, StageUsage,
    };

    use crate::layout::DynamicOffsetLayout;
    use crate::reflection::{BindingKind, BindingSlot, DynamicBinding, SetLayout};
    use crate::ring::RingBufferConfig;

    fn shader(strategy: BindingStrategy, sets: Vec<SetLayout>, dyn_counts: &[(u32, u32)]) -> ShaderLayout {
        let mut dynamic_offsets = DynamicOffsetLayout::new();
        for &(set, count) in dyn_counts {
            dynamic_offsets.register(set, count);
        }
        ShaderLayout {
            strategy,
            sets,
            dynamic_offsets,
        }
    }

    fn buffer_slot(binding: u32, slots: StageSlots, dynamic: Option<DynamicBinding>) -> BindingSlot {
        BindingSlot {
            binding,
            kind: BindingKind::UniformBuffer,
            usage: StageUsage::single(Stage::Vertex, Access::Read),
            slots,
            arg_offset: binding as u64 * 8,
            dynamic,
        }
    }

    fn set_layout(index: u32, bindings: Vec<BindingSlot>) -> Arc<SetLayout> {
        let encoded_size = bindings.len() as u64 * 8;
        Arc::new(SetLayout {
            index,
            bindings,
            encoded_size,
        })
    }

    fn set_buffer_events(events: &[FakeEvent]) -> Vec<&FakeEvent> {
        events
            .iter()
            .filter(|e| {
                matches!(
                    e,
                    FakeEvent::SetBuffer { .. } | FakeEvent::SetBufferOffset { .. }
                )
            })
            .collect()
    }

    #[test]
    fn identical_direct_rebind_is_skipped() {
        let driver = Arc::new(FakeDriver::new());
        let buffer = driver.buffer(64);
        let layout = set_layout(
            0,
            vec![buffer_slot(
                0,
                StageSlots {
                    vertex: Some(3),
                    ..StageSlots::default()
                },
                None,
            )],
        );
        let set = UniformSet::new(
            driver.as_ref(),
            layout.clone(),
            vec![BoundResource::Buffer {
                buffer,
                offset: 32,
            }],
            BindingStrategy::Direct,
        )
        .unwrap();
        let shader = shader(BindingStrategy::Direct, vec![(*layout).clone()], &[]);

        let mut ring = RingBufferAllocator::new(Arc::clone(&driver), RingBufferConfig::default());
        let mut cache = BindingCache::new();
        let mut cmd = driver.new_command_buffer().unwrap();
        let mut enc = cmd.begin_render_encoder(&RenderPassDesc::default(), QueueStages::empty());
        driver.take_events();

        let mut pass = PassEncoder::Render(&mut enc);
        bind_uniform_set(&mut pass, &mut cache, &mut ring, &shader, &set, 0).unwrap();
        bind_uniform_set(&mut pass, &mut cache, &mut ring, &shader, &set, 0).unwrap();

        let events = driver.events();
        assert_eq!(set_buffer_events(&events).len(), 1);
    }

    #[test]
    fn frame_change_degrades_to_offset_only_rebind() {
        let driver = Arc::new(FakeDriver::new());
        let buffer = driver.buffer(4096);
        let layout = set_layout(
            0,
            vec![buffer_slot(
                0,
                StageSlots {
                    vertex: Some(0),
                    ..StageSlots::default()
                },
                Some(DynamicBinding { per_frame_size: 256 }),
            )],
        );
        let set = UniformSet::new(
            driver.as_ref(),
            layout.clone(),
            vec![BoundResource::Buffer { buffer, offset: 0 }],
            BindingStrategy::Direct,
        )
        .unwrap();
        let shader = shader(BindingStrategy::Direct, vec![(*layout).clone()], &[(0, 1)]);

        let mut ring = RingBufferAllocator::new(Arc::clone(&driver), RingBufferConfig::default());
        let mut cache = BindingCache::new();
        let mut cmd = driver.new_command_buffer().unwrap();
        let mut enc = cmd.begin_render_encoder(&RenderPassDesc::default(), QueueStages::empty());
        driver.take_events();

        let mut pass = PassEncoder::Render(&mut enc);
        bind_uniform_set(&mut pass, &mut cache, &mut ring, &shader, &set, 0).unwrap();
        bind_uniform_set(&mut pass, &mut cache, &mut ring, &shader, &set, 2).unwrap();

        let events = driver.events();
        let binds = set_buffer_events(&events);
        assert_eq!(binds.len(), 2);
        assert!(matches!(binds[0], FakeEvent::SetBuffer { offset: 0, .. }));
        assert!(matches!(
            binds[1],
            FakeEvent::SetBufferOffset { offset: 512, .. }
        ));
    }

    #[test]
    fn baked_blob_binds_unconditionally_at_offset_zero() {
        let driver = Arc::new(FakeDriver::new());
        let buffer = driver.buffer(64);
        let layout = set_layout(2, vec![buffer_slot(0, StageSlots::default(), None)]);
        let set = UniformSet::new(
            driver.as_ref(),
            layout.clone(),
            vec![BoundResource::Buffer { buffer, offset: 0 }],
            BindingStrategy::ArgumentBuffer,
        )
        .unwrap();
        let shader = shader(BindingStrategy::ArgumentBuffer, vec![(*layout).clone()], &[]);

        let mut ring = RingBufferAllocator::new(Arc::clone(&driver), RingBufferConfig::default());
        let mut cache = BindingCache::new();
        let mut cmd = driver.new_command_buffer().unwrap();
        let mut enc = cmd.begin_render_encoder(&RenderPassDesc::default(), QueueStages::empty());
        driver.take_events();

        let mut pass = PassEncoder::Render(&mut enc);
        bind_uniform_set(&mut pass, &mut cache, &mut ring, &shader, &set, 0).unwrap();
        bind_uniform_set(&mut pass, &mut cache, &mut ring, &shader, &set, 0).unwrap();

        let events = driver.events();
        let binds = set_buffer_events(&events);
        assert_eq!(binds.len(), 2);
        for bind in binds {
            assert!(matches!(
                bind,
                FakeEvent::SetBuffer {
                    stage: Some(RenderStage::Vertex),
                    slot: 2,
                    offset: 0,
                    ..
                }
            ));
        }
    }

    #[test]
    fn dynamic_argument_set_patches_frame_address_into_ring_copy() {
        let driver = Arc::new(FakeDriver::new());
        let stable = driver.buffer(64);
        let rotating = driver.buffer(4096);
        let base = rotating.gpu_address().unwrap();

        let layout = set_layout(
            1,
            vec![
                buffer_slot(0, StageSlots::default(), None),
                buffer_slot(1, StageSlots::default(), Some(DynamicBinding { per_frame_size: 256 })),
                buffer_slot(2, StageSlots::default(), Some(DynamicBinding { per_frame_size: 512 })),
            ],
        );
        let set = UniformSet::new(
            driver.as_ref(),
            layout.clone(),
            vec![
                BoundResource::Buffer { buffer: stable, offset: 0 },
                BoundResource::Buffer { buffer: rotating.clone(), offset: 0 },
                BoundResource::Buffer { buffer: rotating, offset: 0 },
            ],
            BindingStrategy::ArgumentBuffer,
        )
        .unwrap();
        let shader = shader(
            BindingStrategy::ArgumentBuffer,
            vec![(*layout).clone()],
            &[(1, 2)],
        );

        let mut ring = RingBufferAllocator::new(Arc::clone(&driver), RingBufferConfig::default());
        let mut cache = BindingCache::new();
        let mut cmd = driver.new_command_buffer().unwrap();
        let mut enc = cmd.begin_render_encoder(&RenderPassDesc::default(), QueueStages::empty());

        // Sub-binding 0 of set 1 reads frame 3, sub-binding 1 frame 5.
        let dynamic_offsets =
            (3 << shader.dynamic_offsets.offset_index_shift(1, 0))
                | (5 << shader.dynamic_offsets.offset_index_shift(1, 1));

        let mut pass = PassEncoder::Render(&mut enc);
        bind_uniform_set(&mut pass, &mut cache, &mut ring, &shader, &set, dynamic_offsets)
            .unwrap();

        // The patched copy lives at the bound offset in ring segment 0.
        let events = driver.events();
        let bound = events
            .iter()
            .rev()
            .find_map(|e| match e {
                FakeEvent::SetBuffer { offset, .. } => Some(*offset),
                _ => None,
            })
            .expect("blob bind recorded");

        let segment = ring.segment_buffer(0);
        let mut word = [0u8; 8];
        segment.read(bound + 8, &mut word);
        assert_eq!(u64::from_le_bytes(word), base + 3 * 256);
        segment.read(bound + 16, &mut word);
        assert_eq!(u64::from_le_bytes(word), base + 5 * 512);
    }
}
