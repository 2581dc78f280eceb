//! The native-API trait family.
//!
//! Modelled on a Metal-class driver: one command buffer owns at most one
//! strongly-typed encoder at a time, encoders are single-purpose (render /
//! compute / blit) and consumed by `end`, and resources reached through
//! argument buffers must be declared resident per draw via `use_resources`.
//!
//! The RHI core is generic over [`GpuDriver`]; drivers and the recording
//! fake in `testing` implement it.

use std::fmt;
use std::ops::Range;

use crate::caps::DriverCapabilities;
use crate::types::{
    Access, IndexFormat, QueueStages, RenderStage, ResourceId, ScissorRect, Stage, Viewport,
};

#[derive(Debug, thiserror::Error)]
pub enum DriverError {
    #[error("native allocation of {size} bytes failed")]
    OutOfMemory { size: u64 },
    #[error("native backend error: {0}")]
    Backend(String),
}

pub trait NativeResource {
    fn id(&self) -> ResourceId;
}

/// A ref-counted handle to a native buffer. Cloning retains.
pub trait NativeBuffer: NativeResource + Clone {
    fn length(&self) -> u64;

    /// CPU-visible base pointer, or null for GPU-private buffers.
    fn contents(&self) -> *mut u8;

    /// Direct GPU virtual address, where the platform supports it.
    fn gpu_address(&self) -> Option<u64>;

    /// Copy `bytes` into the buffer at `offset`.
    ///
    /// Panics if the buffer is not CPU-visible or the range is out of
    /// bounds; those are caller bugs, not runtime conditions.
    fn write(&self, offset: u64, bytes: &[u8]) {
        let ptr = self.contents();
        assert!(!ptr.is_null(), "write to a buffer with no CPU mapping");
        let end = offset
            .checked_add(bytes.len() as u64)
            .expect("buffer write range overflows");
        assert!(end <= self.length(), "buffer write out of bounds");
        unsafe {
            std::ptr::copy_nonoverlapping(bytes.as_ptr(), ptr.add(offset as usize), bytes.len());
        }
    }

    /// Copy bytes out of the buffer at `offset`. Same contract as [`Self::write`].
    fn read(&self, offset: u64, out: &mut [u8]) {
        let ptr = self.contents();
        assert!(!ptr.is_null(), "read from a buffer with no CPU mapping");
        let end = offset
            .checked_add(out.len() as u64)
            .expect("buffer read range overflows");
        assert!(end <= self.length(), "buffer read out of bounds");
        unsafe {
            std::ptr::copy_nonoverlapping(ptr.add(offset as usize), out.as_mut_ptr(), out.len());
        }
    }
}

/// A ref-counted handle to a native texture.
pub trait NativeTexture: NativeResource + Clone {
    /// The word written into argument buffers to reference this texture.
    fn gpu_handle(&self) -> u64;
}

/// A ref-counted handle to a native sampler.
///
/// Samplers are not memory resources; they have no [`ResourceId`] and are
/// never residency-tracked.
pub trait NativeSampler: Clone {
    fn gpu_handle(&self) -> u64;
}

/// A buffer or texture as seen by the residency tracker.
pub enum ResourceRef<D: GpuDriver> {
    Buffer(D::Buffer),
    Texture(D::Texture),
}

impl<D: GpuDriver> ResourceRef<D> {
    pub fn id(&self) -> ResourceId {
        match self {
            ResourceRef::Buffer(b) => b.id(),
            ResourceRef::Texture(t) => t.id(),
        }
    }
}

impl<D: GpuDriver> Clone for ResourceRef<D> {
    fn clone(&self) -> Self {
        match self {
            ResourceRef::Buffer(b) => ResourceRef::Buffer(b.clone()),
            ResourceRef::Texture(t) => ResourceRef::Texture(t.clone()),
        }
    }
}

impl<D: GpuDriver> fmt::Debug for ResourceRef<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResourceRef::Buffer(b) => f.debug_tuple("Buffer").field(&b.id()).finish(),
            ResourceRef::Texture(t) => f.debug_tuple("Texture").field(&t.id()).finish(),
        }
    }
}

/// Attachments for a render encoder.
pub struct RenderPassDesc<D: GpuDriver> {
    pub label: Option<String>,
    pub color_targets: Vec<D::Texture>,
    pub depth_target: Option<D::Texture>,
}

impl<D: GpuDriver> Default for RenderPassDesc<D> {
    fn default() -> Self {
        Self {
            label: None,
            color_targets: Vec::new(),
            depth_target: None,
        }
    }
}

/// Entry point to a native driver.
pub trait GpuDriver: Sized {
    type Buffer: NativeBuffer;
    type Texture: NativeTexture;
    type Sampler: NativeSampler;
    type RenderPipeline: Clone;
    type ComputePipeline: Clone;
    type CommandBuffer: NativeCommandBuffer<Self>;
    type RenderEncoder: RenderEncoder<Self>;
    type ComputeEncoder: ComputeEncoder<Self>;
    type BlitEncoder: BlitEncoder<Self>;
    type ResidencySet: ResidencySet<Self>;

    fn capabilities(&self) -> DriverCapabilities;

    fn new_command_buffer(&self) -> Result<Self::CommandBuffer, DriverError>;

    /// Allocate a CPU-writable, GPU-addressable buffer for transient
    /// per-bind data (ring segments, baked argument blobs).
    fn new_scratch_buffer(&self, size: u64) -> Result<Self::Buffer, DriverError>;

    fn new_residency_set(&self) -> Result<Self::ResidencySet, DriverError>;
}

/// A native command buffer. At most one encoder may be live at a time; the
/// type system cannot express that across the three encoder types, so the
/// RHI state machine enforces it.
pub trait NativeCommandBuffer<D: GpuDriver> {
    /// Create a render encoder. `wait` is the queue-stage mask the encoder
    /// must wait on before executing (consumed pending barriers).
    fn begin_render_encoder(
        &mut self,
        desc: &RenderPassDesc<D>,
        wait: QueueStages,
    ) -> D::RenderEncoder;

    fn begin_compute_encoder(&mut self, wait: QueueStages) -> D::ComputeEncoder;

    fn begin_blit_encoder(&mut self, wait: QueueStages) -> D::BlitEncoder;

    fn use_residency_set(&mut self, set: &D::ResidencySet);

    /// Hand the recorded commands to the queue.
    fn commit(self);
}

pub trait RenderEncoder<D: GpuDriver> {
    fn bind_pipeline(&mut self, pipeline: &D::RenderPipeline);

    fn set_buffer(&mut self, stage: RenderStage, slot: u32, buffer: &D::Buffer, offset: u64);

    /// Rebind only the offset of an already-bound buffer slot. Cheaper than
    /// a full rebind on drivers that support it.
    fn set_buffer_offset(&mut self, stage: RenderStage, slot: u32, offset: u64);

    fn set_texture(&mut self, stage: RenderStage, slot: u32, texture: &D::Texture);

    fn set_sampler(&mut self, stage: RenderStage, slot: u32, sampler: &D::Sampler);

    fn set_viewports(&mut self, viewports: &[Viewport]);

    fn set_scissors(&mut self, scissors: &[ScissorRect]);

    fn set_blend_constants(&mut self, constants: [f32; 4]);

    fn set_vertex_buffer(&mut self, slot: u32, buffer: &D::Buffer, offset: u64);

    fn set_index_buffer(&mut self, buffer: &D::Buffer, format: IndexFormat, offset: u64);

    /// Declare that the following draws reach `resources` indirectly (through
    /// argument buffers) at `stage` with `access`, so the driver keeps them
    /// resident.
    fn use_resources(&mut self, resources: &[ResourceRef<D>], stage: Stage, access: Access);

    /// Intra-encoder memory barrier: work after this call observes writes
    /// made by `after` stages before `before` stages execute.
    fn memory_barrier(&mut self, after: QueueStages, before: QueueStages);

    fn draw(&mut self, vertices: Range<u32>, instances: Range<u32>);

    fn draw_indexed(&mut self, indices: Range<u32>, base_vertex: i32, instances: Range<u32>);

    fn end(self);
}

pub trait ComputeEncoder<D: GpuDriver> {
    fn bind_pipeline(&mut self, pipeline: &D::ComputePipeline);

    fn set_buffer(&mut self, slot: u32, buffer: &D::Buffer, offset: u64);

    fn set_buffer_offset(&mut self, slot: u32, offset: u64);

    fn set_texture(&mut self, slot: u32, texture: &D::Texture);

    fn set_sampler(&mut self, slot: u32, sampler: &D::Sampler);

    fn use_resources(&mut self, resources: &[ResourceRef<D>], access: Access);

    fn memory_barrier(&mut self, after: QueueStages, before: QueueStages);

    fn dispatch(&mut self, groups: [u32; 3]);

    fn end(self);
}

pub trait BlitEncoder<D: GpuDriver> {
    fn copy_buffer(
        &mut self,
        src: &D::Buffer,
        src_offset: u64,
        dst: &D::Buffer,
        dst_offset: u64,
        size: u64,
    );

    fn copy_buffer_to_texture(&mut self, src: &D::Buffer, src_offset: u64, dst: &D::Texture);

    fn copy_texture_to_buffer(&mut self, src: &D::Texture, dst: &D::Buffer, dst_offset: u64);

    fn fill_buffer(&mut self, buffer: &D::Buffer, range: Range<u64>, value: u8);

    fn end(self);
}

/// A native residency set: a durable collection of resources the driver must
/// keep GPU-resident while command buffers referencing the set execute.
pub trait ResidencySet<D: GpuDriver> {
    fn add(&mut self, resource: &ResourceRef<D>);

    /// Publish additions made since the last commit.
    fn commit(&mut self);
}
