//! The command-buffer state machine.
//!
//! One [`CommandBuffer`] owns at most one native command buffer and at most
//! one native encoder at a time. All pass changes go through a single
//! [`CommandBuffer::transition`] that finalizes whatever encoder is live
//! before creating the next one, consuming any barriers owed to the new
//! encoder's class on the way in. Render and compute state is recorded into
//! dirty-flagged shadow state and flushed to the encoder immediately before
//! each draw/dispatch.

use std::collections::HashSet;
use std::ops::Range;
use std::sync::Arc;

use argent_hal::{
    BlitEncoder as _, ComputeEncoder as _, GpuDriver, IndexFormat, NativeCommandBuffer as _,
    NativeResource, PipelineStages, QueueStages, RenderEncoder as _, RenderPassDesc,
    ResidencySet as _, ResourceId, ResourceRef, ScissorRect, Viewport,
};
use bitflags::bitflags;
use smallvec::SmallVec;
use tracing::debug;

use crate::barrier::PendingBarriers;
use crate::codec::{self, BindingCache, PassEncoder};
use crate::error::RhiError;
use crate::layout::MAX_UNIFORM_SETS;
use crate::reflection::{ComputePipeline, RenderPipeline};
use crate::ring::{RingBufferAllocator, RingBufferConfig};
use crate::tracker::ResourceTracker;
use crate::uniform_set::UniformSet;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PassKind {
    None,
    Render,
    Compute,
    Blit,
}

#[derive(Clone, Debug, Default)]
pub struct CommandBufferDescriptor {
    pub label: Option<String>,
    /// Collect every argument-buffer resource touched this frame into a
    /// native residency set, committed with the command buffer. Used when
    /// per-draw `use_resources` declarations alone are not enough to keep
    /// long-lived heaps resident.
    pub frame_residency: bool,
    pub ring: RingBufferConfig,
}

enum ActiveEncoder<D: GpuDriver> {
    None,
    Render(D::RenderEncoder),
    Compute(D::ComputeEncoder),
    Blit(D::BlitEncoder),
}

bitflags! {
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    struct RenderDirty: u32 {
        const PIPELINE = 1 << 0;
        const VIEWPORTS = 1 << 1;
        const SCISSORS = 1 << 2;
        const BLEND = 1 << 3;
        const VERTEX_BUFFERS = 1 << 4;
        const INDEX_BUFFER = 1 << 5;
    }
}

/// Uniform-set shadow state shared by the render and compute passes.
struct BindState<D: GpuDriver> {
    sets: Vec<Option<UniformSet<D>>>,
    dirty_sets: u16,
    dynamic_offsets: u32,
    tracker: ResourceTracker<D>,
}

impl<D: GpuDriver> BindState<D> {
    fn new() -> Self {
        Self {
            sets: (0..MAX_UNIFORM_SETS).map(|_| None).collect(),
            dirty_sets: 0,
            dynamic_offsets: 0,
            tracker: ResourceTracker::new(),
        }
    }

    fn clear(&mut self) {
        for set in &mut self.sets {
            *set = None;
        }
        self.dirty_sets = 0;
        self.dynamic_offsets = 0;
    }
}

struct RenderState<D: GpuDriver> {
    pipeline: Option<RenderPipeline<D>>,
    pass_desc: Option<RenderPassDesc<D>>,
    dirty: RenderDirty,
    viewports: SmallVec<[Viewport; 4]>,
    scissors: SmallVec<[ScissorRect; 4]>,
    blend_constants: [f32; 4],
    vertex_buffers: SmallVec<[(u32, D::Buffer, u64); 4]>,
    index_buffer: Option<(D::Buffer, IndexFormat, u64)>,
    bind: BindState<D>,
}

impl<D: GpuDriver> RenderState<D> {
    fn new() -> Self {
        Self {
            pipeline: None,
            pass_desc: None,
            dirty: RenderDirty::empty(),
            viewports: SmallVec::new(),
            scissors: SmallVec::new(),
            blend_constants: [0.0; 4],
            vertex_buffers: SmallVec::new(),
            index_buffer: None,
            bind: BindState::new(),
        }
    }

    fn clear(&mut self) {
        self.pipeline = None;
        self.pass_desc = None;
        self.dirty = RenderDirty::empty();
        self.viewports.clear();
        self.scissors.clear();
        self.blend_constants = [0.0; 4];
        self.vertex_buffers.clear();
        self.index_buffer = None;
        self.bind.clear();
    }

    /// A fresh encoder has no state; everything recorded must re-flush.
    fn mark_all_dirty(&mut self) {
        self.dirty = RenderDirty::all();
        self.bind.dirty_sets = u16::MAX;
    }
}

struct ComputeState<D: GpuDriver> {
    pipeline: Option<ComputePipeline<D>>,
    pipeline_dirty: bool,
    bind: BindState<D>,
}

impl<D: GpuDriver> ComputeState<D> {
    fn new() -> Self {
        Self {
            pipeline: None,
            pipeline_dirty: false,
            bind: BindState::new(),
        }
    }

    fn clear(&mut self) {
        self.pipeline = None;
        self.pipeline_dirty = false;
        self.bind.clear();
    }
}

struct FrameResidency<D: GpuDriver> {
    native: D::ResidencySet,
    seen: HashSet<ResourceId>,
    dirty: bool,
}

pub struct CommandBuffer<D: GpuDriver> {
    driver: Arc<D>,
    desc: CommandBufferDescriptor,
    native: Option<D::CommandBuffer>,
    encoder: ActiveEncoder<D>,
    pass: PassKind,
    render: RenderState<D>,
    compute: ComputeState<D>,
    blit_recorded: bool,
    ring: RingBufferAllocator<D>,
    pending: PendingBarriers,
    cache: BindingCache,
    residency: Option<FrameResidency<D>>,
}

impl<D: GpuDriver> CommandBuffer<D> {
    pub fn new(driver: Arc<D>, desc: CommandBufferDescriptor) -> Result<Self, RhiError> {
        let residency = if desc.frame_residency {
            Some(FrameResidency {
                native: driver.new_residency_set()?,
                seen: HashSet::new(),
                dirty: false,
            })
        } else {
            None
        };
        let mut ring_config = desc.ring;
        ring_config.alignment = ring_config.alignment.max(driver.capabilities().min_alignment);
        let ring = RingBufferAllocator::new(Arc::clone(&driver), ring_config);
        Ok(Self {
            driver,
            desc,
            native: None,
            encoder: ActiveEncoder::None,
            pass: PassKind::None,
            render: RenderState::new(),
            compute: ComputeState::new(),
            blit_recorded: false,
            ring,
            pending: PendingBarriers::new(),
            cache: BindingCache::new(),
            residency,
        })
    }

    pub fn pass(&self) -> PassKind {
        self.pass
    }

    pub fn is_recording(&self) -> bool {
        self.native.is_some()
    }

    /// Start recording. Clears all per-buffer shadow state and rewinds the
    /// ring allocator's write heads; the caller guarantees the GPU is done
    /// with the previous recording's scratch before calling this.
    pub fn begin(&mut self) -> Result<(), RhiError> {
        assert!(
            self.native.is_none() && matches!(self.encoder, ActiveEncoder::None),
            "begin() while already recording"
        );
        self.cache.clear();
        self.pending.clear();
        self.ring.reset();
        self.render.clear();
        self.compute.clear();
        self.blit_recorded = false;
        self.native = Some(self.driver.new_command_buffer()?);
        debug!(label = self.desc.label.as_deref(), "command buffer begin");
        Ok(())
    }

    /// Finalize whatever encoder is live. No-op outside a pass.
    pub fn end(&mut self) {
        self.transition(PassKind::None);
    }

    /// End recording and hand the native command buffer to the queue.
    pub fn commit(&mut self) {
        self.transition(PassKind::None);
        let mut native = self.native.take().expect("commit() without begin()");
        if let Some(residency) = &mut self.residency {
            if residency.dirty {
                residency.native.commit();
                residency.dirty = false;
            }
            native.use_residency_set(&residency.native);
        }
        debug!(
            label = self.desc.label.as_deref(),
            blit = self.blit_recorded,
            "command buffer commit"
        );
        native.commit();
    }

    /// The one place encoders are created and destroyed. Finalizing a render
    /// or compute pass resets its tracker and the slot cache; entering a pass
    /// consumes the barrier mask owed to its class and marks all shadow state
    /// dirty for the fresh encoder.
    fn transition(&mut self, next: PassKind) {
        if self.pass == next {
            return;
        }
        match std::mem::replace(&mut self.encoder, ActiveEncoder::None) {
            ActiveEncoder::None => {}
            ActiveEncoder::Render(enc) => {
                enc.end();
                self.render.bind.tracker.reset();
                self.cache.clear();
            }
            ActiveEncoder::Compute(enc) => {
                enc.end();
                self.compute.bind.tracker.reset();
                self.cache.clear();
            }
            ActiveEncoder::Blit(enc) => {
                enc.end();
            }
        }
        self.pass = PassKind::None;
        if next == PassKind::None {
            return;
        }

        let native = self
            .native
            .as_mut()
            .expect("recording a pass without begin()");
        self.encoder = match next {
            PassKind::None => unreachable!(),
            PassKind::Render => {
                let wait = self.pending.take_for_render();
                let desc = self.render.pass_desc.take().unwrap_or_default();
                if !wait.is_empty() {
                    debug!(?wait, "render encoder waits on queue stages");
                }
                let enc = native.begin_render_encoder(&desc, wait);
                self.render.mark_all_dirty();
                ActiveEncoder::Render(enc)
            }
            PassKind::Compute => {
                let wait = self.pending.take_for_compute();
                if !wait.is_empty() {
                    debug!(?wait, "compute encoder waits on queue stages");
                }
                let enc = native.begin_compute_encoder(wait);
                self.compute.pipeline_dirty = self.compute.pipeline.is_some();
                self.compute.bind.dirty_sets = u16::MAX;
                ActiveEncoder::Compute(enc)
            }
            PassKind::Blit => {
                let wait = self.pending.take_for_blit();
                ActiveEncoder::Blit(native.begin_blit_encoder(wait))
            }
        };
        self.pass = next;
    }

    // ---- render pass ----

    /// Enter a render pass targeting `desc`'s attachments. Binding a render
    /// pipeline outside any pass also enters one, with default attachments.
    pub fn begin_render_pass(&mut self, desc: RenderPassDesc<D>) {
        self.transition(PassKind::None);
        self.render.pass_desc = Some(desc);
        self.transition(PassKind::Render);
    }

    pub fn end_render_pass(&mut self) {
        assert_eq!(self.pass, PassKind::Render, "end_render_pass outside a render pass");
        self.transition(PassKind::None);
    }

    pub fn bind_render_pipeline(&mut self, pipeline: &RenderPipeline<D>) {
        self.transition(PassKind::Render);
        let changed = self
            .render
            .pipeline
            .as_ref()
            .map_or(true, |current| current.id() != pipeline.id());
        if changed {
            self.render.pipeline = Some(pipeline.clone());
            self.render.dirty |= RenderDirty::PIPELINE;
            // Pipeline variants may lay their slots out differently; every
            // bound set must re-encode under the new pipeline.
            self.render.bind.dirty_sets = u16::MAX;
        }
    }

    pub fn set_viewports(&mut self, viewports: &[Viewport]) {
        self.render.viewports.clear();
        self.render.viewports.extend_from_slice(viewports);
        self.render.dirty |= RenderDirty::VIEWPORTS;
    }

    pub fn set_scissors(&mut self, scissors: &[ScissorRect]) {
        self.render.scissors.clear();
        self.render.scissors.extend_from_slice(scissors);
        self.render.dirty |= RenderDirty::SCISSORS;
    }

    pub fn set_blend_constants(&mut self, constants: [f32; 4]) {
        self.render.blend_constants = constants;
        self.render.dirty |= RenderDirty::BLEND;
    }

    pub fn bind_vertex_buffer(&mut self, slot: u32, buffer: &D::Buffer, offset: u64) {
        match self
            .render
            .vertex_buffers
            .iter_mut()
            .find(|(bound_slot, _, _)| *bound_slot == slot)
        {
            Some(entry) => {
                entry.1 = buffer.clone();
                entry.2 = offset;
            }
            None => self.render.vertex_buffers.push((slot, buffer.clone(), offset)),
        }
        self.render.dirty |= RenderDirty::VERTEX_BUFFERS;
    }

    pub fn bind_index_buffer(&mut self, buffer: &D::Buffer, format: IndexFormat, offset: u64) {
        self.render.index_buffer = Some((buffer.clone(), format, offset));
        self.render.dirty |= RenderDirty::INDEX_BUFFER;
    }

    // ---- compute pass ----

    pub fn bind_compute_pipeline(&mut self, pipeline: &ComputePipeline<D>) {
        self.transition(PassKind::Compute);
        let changed = self
            .compute
            .pipeline
            .as_ref()
            .map_or(true, |current| current.id() != pipeline.id());
        if changed {
            self.compute.pipeline = Some(pipeline.clone());
            self.compute.pipeline_dirty = true;
            self.compute.bind.dirty_sets = u16::MAX;
        }
    }

    // ---- uniform state (render or compute) ----

    fn bind_state(&mut self) -> &mut BindState<D> {
        match self.pass {
            PassKind::Render => &mut self.render.bind,
            PassKind::Compute => &mut self.compute.bind,
            _ => panic!("uniform state outside a render or compute pass"),
        }
    }

    pub fn bind_uniform_set(&mut self, set: &UniformSet<D>) {
        let index = set.index();
        assert!(index < MAX_UNIFORM_SETS, "uniform set index out of range");
        let bind = self.bind_state();
        bind.sets[index as usize] = Some(set.clone());
        bind.dirty_sets |= 1 << index;
    }

    /// Replace the per-draw dynamic-offsets word. Sets with dynamic
    /// sub-bindings are re-encoded on the next draw/dispatch; everything else
    /// is untouched.
    pub fn set_dynamic_offsets(&mut self, word: u32) {
        let bind = self.bind_state();
        if bind.dynamic_offsets == word {
            return;
        }
        bind.dynamic_offsets = word;
        for (index, set) in bind.sets.iter().enumerate() {
            if set
                .as_ref()
                .is_some_and(|s| s.layout().dynamic_count() > 0)
            {
                bind.dirty_sets |= 1 << index;
            }
        }
    }

    // ---- draw / dispatch ----

    pub fn draw(&mut self, vertices: Range<u32>, instances: Range<u32>) -> Result<(), RhiError> {
        self.flush_render()?;
        let ActiveEncoder::Render(enc) = &mut self.encoder else {
            unreachable!()
        };
        enc.draw(vertices, instances);
        Ok(())
    }

    pub fn draw_indexed(
        &mut self,
        indices: Range<u32>,
        base_vertex: i32,
        instances: Range<u32>,
    ) -> Result<(), RhiError> {
        assert!(
            self.render.index_buffer.is_some(),
            "draw_indexed with no index buffer bound"
        );
        self.flush_render()?;
        let ActiveEncoder::Render(enc) = &mut self.encoder else {
            unreachable!()
        };
        enc.draw_indexed(indices, base_vertex, instances);
        Ok(())
    }

    pub fn dispatch(&mut self, groups: [u32; 3]) -> Result<(), RhiError> {
        self.flush_compute()?;
        let ActiveEncoder::Compute(enc) = &mut self.encoder else {
            unreachable!()
        };
        enc.dispatch(groups);
        Ok(())
    }

    fn flush_render(&mut self) -> Result<(), RhiError> {
        assert_eq!(self.pass, PassKind::Render, "draw outside a render pass");
        let pipeline = self
            .render
            .pipeline
            .clone()
            .expect("draw with no pipeline bound");
        let ActiveEncoder::Render(enc) = &mut self.encoder else {
            unreachable!()
        };

        let dirty = self.render.dirty;
        if dirty.contains(RenderDirty::PIPELINE) {
            enc.bind_pipeline(&pipeline.native);
        }
        if dirty.contains(RenderDirty::VIEWPORTS) && !self.render.viewports.is_empty() {
            enc.set_viewports(&self.render.viewports);
        }
        if dirty.contains(RenderDirty::SCISSORS) && !self.render.scissors.is_empty() {
            enc.set_scissors(&self.render.scissors);
        }
        if dirty.contains(RenderDirty::BLEND) {
            enc.set_blend_constants(self.render.blend_constants);
        }
        if dirty.contains(RenderDirty::VERTEX_BUFFERS) {
            for (slot, buffer, offset) in &self.render.vertex_buffers {
                enc.set_vertex_buffer(*slot, buffer, *offset);
            }
        }
        if dirty.contains(RenderDirty::INDEX_BUFFER) {
            if let Some((buffer, format, offset)) = &self.render.index_buffer {
                enc.set_index_buffer(buffer, *format, *offset);
            }
        }
        self.render.dirty = RenderDirty::empty();

        let dynamic_offsets = self.render.bind.dynamic_offsets;
        let mut dirty_sets = std::mem::take(&mut self.render.bind.dirty_sets);
        while dirty_sets != 0 {
            let index = dirty_sets.trailing_zeros() as usize;
            let bit = 1u16 << index;
            dirty_sets &= !bit;

            let usage = {
                let Some(set) = self.render.bind.sets[index].as_ref() else {
                    continue;
                };
                let mut pass = PassEncoder::Render(&mut *enc);
                let bound = codec::bind_uniform_set(
                    &mut pass,
                    &mut self.cache,
                    &mut self.ring,
                    &pipeline.shader,
                    set,
                    dynamic_offsets,
                );
                if let Err(err) = bound {
                    // This set and any not yet visited stay dirty so a
                    // retried draw re-encodes them.
                    self.render.bind.dirty_sets |= dirty_sets | bit;
                    return Err(err);
                }
                if !set.is_encoded() {
                    continue;
                }
                Arc::clone(set.usage())
            };
            self.render.bind.tracker.merge_from(&usage);
            if let Some(residency) = &mut self.residency {
                for (_, bucket) in usage.buckets() {
                    for resource in bucket {
                        if residency.seen.insert(resource.id()) {
                            residency.native.add(resource);
                            residency.dirty = true;
                        }
                    }
                }
            }
        }

        if self.ring.take_changed() {
            if let Some(residency) = &mut self.residency {
                for segment in 0..self.ring.segment_count() {
                    let buffer = self.ring.segment_buffer(segment).clone();
                    if residency.seen.insert(buffer.id()) {
                        residency.native.add(&ResourceRef::Buffer(buffer));
                        residency.dirty = true;
                    }
                }
            }
        }

        self.render
            .bind
            .tracker
            .encode(|resources, stage, access| enc.use_resources(resources, stage, access));
        Ok(())
    }

    fn flush_compute(&mut self) -> Result<(), RhiError> {
        assert_eq!(self.pass, PassKind::Compute, "dispatch outside a compute pass");
        let pipeline = self
            .compute
            .pipeline
            .clone()
            .expect("dispatch with no pipeline bound");
        let ActiveEncoder::Compute(enc) = &mut self.encoder else {
            unreachable!()
        };

        if self.compute.pipeline_dirty {
            enc.bind_pipeline(&pipeline.native);
            self.compute.pipeline_dirty = false;
        }

        let dynamic_offsets = self.compute.bind.dynamic_offsets;
        let mut dirty_sets = std::mem::take(&mut self.compute.bind.dirty_sets);
        while dirty_sets != 0 {
            let index = dirty_sets.trailing_zeros() as usize;
            let bit = 1u16 << index;
            dirty_sets &= !bit;

            let usage = {
                let Some(set) = self.compute.bind.sets[index].as_ref() else {
                    continue;
                };
                let mut pass = PassEncoder::Compute(&mut *enc);
                let bound = codec::bind_uniform_set(
                    &mut pass,
                    &mut self.cache,
                    &mut self.ring,
                    &pipeline.shader,
                    set,
                    dynamic_offsets,
                );
                if let Err(err) = bound {
                    // This set and any not yet visited stay dirty so a
                    // retried dispatch re-encodes them.
                    self.compute.bind.dirty_sets |= dirty_sets | bit;
                    return Err(err);
                }
                if !set.is_encoded() {
                    continue;
                }
                Arc::clone(set.usage())
            };
            self.compute.bind.tracker.merge_from(&usage);
            if let Some(residency) = &mut self.residency {
                for (_, bucket) in usage.buckets() {
                    for resource in bucket {
                        if residency.seen.insert(resource.id()) {
                            residency.native.add(resource);
                            residency.dirty = true;
                        }
                    }
                }
            }
        }

        if self.ring.take_changed() {
            if let Some(residency) = &mut self.residency {
                for segment in 0..self.ring.segment_count() {
                    let buffer = self.ring.segment_buffer(segment).clone();
                    if residency.seen.insert(buffer.id()) {
                        residency.native.add(&ResourceRef::Buffer(buffer));
                        residency.dirty = true;
                    }
                }
            }
        }

        self.compute
            .bind
            .tracker
            .encode(|resources, _stage, access| enc.use_resources(resources, access));
        Ok(())
    }

    // ---- blit ----

    fn blit_encoder(&mut self) -> &mut D::BlitEncoder {
        self.transition(PassKind::Blit);
        self.blit_recorded = true;
        match &mut self.encoder {
            ActiveEncoder::Blit(enc) => enc,
            _ => unreachable!(),
        }
    }

    pub fn copy_buffer(
        &mut self,
        src: &D::Buffer,
        src_offset: u64,
        dst: &D::Buffer,
        dst_offset: u64,
        size: u64,
    ) {
        self.blit_encoder()
            .copy_buffer(src, src_offset, dst, dst_offset, size);
    }

    pub fn copy_buffer_to_texture(&mut self, src: &D::Buffer, src_offset: u64, dst: &D::Texture) {
        self.blit_encoder().copy_buffer_to_texture(src, src_offset, dst);
    }

    pub fn copy_texture_to_buffer(&mut self, src: &D::Texture, dst: &D::Buffer, dst_offset: u64) {
        self.blit_encoder().copy_texture_to_buffer(src, dst, dst_offset);
    }

    pub fn fill_buffer(&mut self, buffer: &D::Buffer, range: Range<u64>, value: u8) {
        self.blit_encoder().fill_buffer(buffer, range, value);
    }

    // ---- synchronization ----

    /// Make work in `dst` stages observe writes made by `src` stages.
    ///
    /// If an encoder of the source class is live, an intra-encoder barrier is
    /// emitted now. The request is also parked per destination class and
    /// consumed as a wait mask when the next matching encoder is created,
    /// since that encoder usually does not exist yet.
    pub fn pipeline_barrier(&mut self, src: PipelineStages, dst: PipelineStages) {
        let after = src.to_queue_stages();
        let before = dst.to_queue_stages();
        match &mut self.encoder {
            ActiveEncoder::Render(enc)
                if after.intersects(QueueStages::VERTEX | QueueStages::FRAGMENT) =>
            {
                enc.memory_barrier(after, before);
            }
            ActiveEncoder::Compute(enc) if after.contains(QueueStages::DISPATCH) => {
                enc.memory_barrier(after, before);
            }
            _ => {}
        }
        self.pending.record(after, before);
    }
}
