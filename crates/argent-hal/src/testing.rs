//! Recording fake driver for tests.
//!
//! Every native call appends a [`FakeEvent`] to a shared log so scenario
//! tests can assert on exact call sequences (encoder lifecycles, consumed
//! barrier waits, residency declarations). Fake buffers own real CPU memory
//! so argument-buffer patch tests can read back the patched words.

use std::ops::Range;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use crate::caps::DriverCapabilities;
use crate::driver::{
    BlitEncoder, ComputeEncoder, DriverError, GpuDriver, NativeBuffer, NativeCommandBuffer,
    NativeResource, NativeSampler, NativeTexture, RenderEncoder, RenderPassDesc, ResidencySet,
    ResourceRef,
};
use crate::types::{
    Access, IndexFormat, QueueStages, RenderStage, ResourceId, ScissorRect, Stage, Viewport,
};

/// One recorded native call.
#[derive(Clone, Debug, PartialEq)]
pub enum FakeEvent {
    NewCommandBuffer,
    NewScratchBuffer { id: u64, size: u64 },
    NewResidencySet { id: u64 },

    BeginRenderEncoder { wait: QueueStages },
    BeginComputeEncoder { wait: QueueStages },
    BeginBlitEncoder { wait: QueueStages },
    EndRenderEncoder,
    EndComputeEncoder,
    EndBlitEncoder,

    BindRenderPipeline { pipeline: u64 },
    BindComputePipeline { pipeline: u64 },
    SetBuffer { stage: Option<RenderStage>, slot: u32, buffer: u64, offset: u64 },
    SetBufferOffset { stage: Option<RenderStage>, slot: u32, offset: u64 },
    SetTexture { stage: Option<RenderStage>, slot: u32, texture: u64 },
    SetSampler { stage: Option<RenderStage>, slot: u32, sampler: u64 },
    SetViewports { count: usize },
    SetScissors { count: usize },
    SetBlendConstants { constants: [f32; 4] },
    SetVertexBuffer { slot: u32, buffer: u64, offset: u64 },
    SetIndexBuffer { buffer: u64, format: IndexFormat, offset: u64 },

    UseResources { ids: Vec<u64>, stage: Stage, access: Access },
    MemoryBarrier { after: QueueStages, before: QueueStages },

    Draw { vertices: Range<u32>, instances: Range<u32> },
    DrawIndexed { indices: Range<u32>, base_vertex: i32, instances: Range<u32> },
    Dispatch { groups: [u32; 3] },

    CopyBuffer { src: u64, dst: u64, size: u64 },
    CopyBufferToTexture { src: u64, dst: u64 },
    CopyTextureToBuffer { src: u64, dst: u64 },
    FillBuffer { buffer: u64, range: Range<u64>, value: u8 },

    ResidencyAdd { set: u64, resource: u64 },
    ResidencyCommit { set: u64 },
    UseResidencySet { set: u64 },
    Commit,
}

type EventLog = Arc<Mutex<Vec<FakeEvent>>>;

fn push(log: &EventLog, event: FakeEvent) {
    log.lock().unwrap().push(event);
}

struct BufferStorage {
    bytes: std::cell::UnsafeCell<Box<[u8]>>,
}

// Tests drive one command buffer from one thread; the raw-pointer interface
// of `NativeBuffer::contents` is inherently unsynchronized anyway.
unsafe impl Send for BufferStorage {}
unsafe impl Sync for BufferStorage {}

#[derive(Clone)]
pub struct FakeBuffer {
    id: u64,
    storage: Arc<BufferStorage>,
}

impl FakeBuffer {
    fn new(id: u64, size: u64) -> Self {
        Self {
            id,
            storage: Arc::new(BufferStorage {
                bytes: std::cell::UnsafeCell::new(vec![0u8; size as usize].into_boxed_slice()),
            }),
        }
    }

    /// Synthetic GPU address: stable per buffer, disjoint between buffers.
    pub fn fake_gpu_address(id: u64) -> u64 {
        id << 32
    }
}

impl NativeResource for FakeBuffer {
    fn id(&self) -> ResourceId {
        ResourceId(self.id)
    }
}

impl NativeBuffer for FakeBuffer {
    fn length(&self) -> u64 {
        unsafe { (&*self.storage.bytes.get()).len() as u64 }
    }

    fn contents(&self) -> *mut u8 {
        unsafe { (&mut *self.storage.bytes.get()).as_mut_ptr() }
    }

    fn gpu_address(&self) -> Option<u64> {
        Some(Self::fake_gpu_address(self.id))
    }
}

#[derive(Clone)]
pub struct FakeTexture {
    pub id: u64,
}

impl NativeResource for FakeTexture {
    fn id(&self) -> ResourceId {
        ResourceId(self.id)
    }
}

impl NativeTexture for FakeTexture {
    fn gpu_handle(&self) -> u64 {
        self.id
    }
}

#[derive(Clone)]
pub struct FakeSampler {
    pub id: u64,
}

impl NativeSampler for FakeSampler {
    fn gpu_handle(&self) -> u64 {
        self.id
    }
}

#[derive(Clone)]
pub struct FakeRenderPipeline {
    pub id: u64,
}

#[derive(Clone)]
pub struct FakeComputePipeline {
    pub id: u64,
}

pub struct FakeDriver {
    log: EventLog,
    next_id: AtomicU64,
    caps: DriverCapabilities,
    scratch: Mutex<Vec<FakeBuffer>>,
    scratch_failures: AtomicU32,
}

impl Default for FakeDriver {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeDriver {
    pub fn new() -> Self {
        Self::with_capabilities(DriverCapabilities::default())
    }

    pub fn with_capabilities(caps: DriverCapabilities) -> Self {
        Self {
            log: Arc::new(Mutex::new(Vec::new())),
            next_id: AtomicU64::new(1),
            caps,
            scratch: Mutex::new(Vec::new()),
            scratch_failures: AtomicU32::new(0),
        }
    }

    /// Make the next `count` scratch-buffer allocations fail with
    /// [`DriverError::OutOfMemory`].
    pub fn fail_scratch_allocations(&self, count: u32) {
        self.scratch_failures.store(count, Ordering::Relaxed);
    }

    fn alloc_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Snapshot of the recorded call log.
    pub fn events(&self) -> Vec<FakeEvent> {
        self.log.lock().unwrap().clone()
    }

    /// Drain the recorded call log.
    pub fn take_events(&self) -> Vec<FakeEvent> {
        std::mem::take(&mut *self.log.lock().unwrap())
    }

    /// Create a fake device-resident buffer (not a native call; not logged).
    pub fn buffer(&self, size: u64) -> FakeBuffer {
        FakeBuffer::new(self.alloc_id(), size)
    }

    /// Handle to a scratch buffer previously returned by
    /// [`GpuDriver::new_scratch_buffer`], for reading encoded bytes back.
    pub fn scratch_buffer(&self, id: u64) -> Option<FakeBuffer> {
        self.scratch
            .lock()
            .unwrap()
            .iter()
            .find(|b| b.id == id)
            .cloned()
    }

    pub fn texture(&self) -> FakeTexture {
        FakeTexture { id: self.alloc_id() }
    }

    pub fn sampler(&self) -> FakeSampler {
        FakeSampler { id: self.alloc_id() }
    }

    pub fn render_pipeline(&self) -> FakeRenderPipeline {
        FakeRenderPipeline { id: self.alloc_id() }
    }

    pub fn compute_pipeline(&self) -> FakeComputePipeline {
        FakeComputePipeline { id: self.alloc_id() }
    }
}

impl GpuDriver for FakeDriver {
    type Buffer = FakeBuffer;
    type Texture = FakeTexture;
    type Sampler = FakeSampler;
    type RenderPipeline = FakeRenderPipeline;
    type ComputePipeline = FakeComputePipeline;
    type CommandBuffer = FakeCommandBuffer;
    type RenderEncoder = FakeRenderEncoder;
    type ComputeEncoder = FakeComputeEncoder;
    type BlitEncoder = FakeBlitEncoder;
    type ResidencySet = FakeResidencySet;

    fn capabilities(&self) -> DriverCapabilities {
        self.caps
    }

    fn new_command_buffer(&self) -> Result<FakeCommandBuffer, DriverError> {
        push(&self.log, FakeEvent::NewCommandBuffer);
        Ok(FakeCommandBuffer {
            log: Arc::clone(&self.log),
        })
    }

    fn new_scratch_buffer(&self, size: u64) -> Result<FakeBuffer, DriverError> {
        if self.scratch_failures.load(Ordering::Relaxed) > 0 {
            self.scratch_failures.fetch_sub(1, Ordering::Relaxed);
            return Err(DriverError::OutOfMemory { size });
        }
        let id = self.alloc_id();
        push(&self.log, FakeEvent::NewScratchBuffer { id, size });
        let buffer = FakeBuffer::new(id, size);
        self.scratch.lock().unwrap().push(buffer.clone());
        Ok(buffer)
    }

    fn new_residency_set(&self) -> Result<FakeResidencySet, DriverError> {
        let id = self.alloc_id();
        push(&self.log, FakeEvent::NewResidencySet { id });
        Ok(FakeResidencySet {
            id,
            log: Arc::clone(&self.log),
        })
    }
}

pub struct FakeCommandBuffer {
    log: EventLog,
}

impl NativeCommandBuffer<FakeDriver> for FakeCommandBuffer {
    fn begin_render_encoder(
        &mut self,
        _desc: &RenderPassDesc<FakeDriver>,
        wait: QueueStages,
    ) -> FakeRenderEncoder {
        push(&self.log, FakeEvent::BeginRenderEncoder { wait });
        FakeRenderEncoder {
            log: Arc::clone(&self.log),
        }
    }

    fn begin_compute_encoder(&mut self, wait: QueueStages) -> FakeComputeEncoder {
        push(&self.log, FakeEvent::BeginComputeEncoder { wait });
        FakeComputeEncoder {
            log: Arc::clone(&self.log),
        }
    }

    fn begin_blit_encoder(&mut self, wait: QueueStages) -> FakeBlitEncoder {
        push(&self.log, FakeEvent::BeginBlitEncoder { wait });
        FakeBlitEncoder {
            log: Arc::clone(&self.log),
        }
    }

    fn use_residency_set(&mut self, set: &FakeResidencySet) {
        push(&self.log, FakeEvent::UseResidencySet { set: set.id });
    }

    fn commit(self) {
        push(&self.log, FakeEvent::Commit);
    }
}

pub struct FakeRenderEncoder {
    log: EventLog,
}

impl RenderEncoder<FakeDriver> for FakeRenderEncoder {
    fn bind_pipeline(&mut self, pipeline: &FakeRenderPipeline) {
        push(&self.log, FakeEvent::BindRenderPipeline { pipeline: pipeline.id });
    }

    fn set_buffer(&mut self, stage: RenderStage, slot: u32, buffer: &FakeBuffer, offset: u64) {
        push(
            &self.log,
            FakeEvent::SetBuffer {
                stage: Some(stage),
                slot,
                buffer: buffer.id,
                offset,
            },
        );
    }

    fn set_buffer_offset(&mut self, stage: RenderStage, slot: u32, offset: u64) {
        push(
            &self.log,
            FakeEvent::SetBufferOffset {
                stage: Some(stage),
                slot,
                offset,
            },
        );
    }

    fn set_texture(&mut self, stage: RenderStage, slot: u32, texture: &FakeTexture) {
        push(
            &self.log,
            FakeEvent::SetTexture {
                stage: Some(stage),
                slot,
                texture: texture.id,
            },
        );
    }

    fn set_sampler(&mut self, stage: RenderStage, slot: u32, sampler: &FakeSampler) {
        push(
            &self.log,
            FakeEvent::SetSampler {
                stage: Some(stage),
                slot,
                sampler: sampler.id,
            },
        );
    }

    fn set_viewports(&mut self, viewports: &[Viewport]) {
        push(&self.log, FakeEvent::SetViewports { count: viewports.len() });
    }

    fn set_scissors(&mut self, scissors: &[ScissorRect]) {
        push(&self.log, FakeEvent::SetScissors { count: scissors.len() });
    }

    fn set_blend_constants(&mut self, constants: [f32; 4]) {
        push(&self.log, FakeEvent::SetBlendConstants { constants });
    }

    fn set_vertex_buffer(&mut self, slot: u32, buffer: &FakeBuffer, offset: u64) {
        push(
            &self.log,
            FakeEvent::SetVertexBuffer {
                slot,
                buffer: buffer.id,
                offset,
            },
        );
    }

    fn set_index_buffer(&mut self, buffer: &FakeBuffer, format: IndexFormat, offset: u64) {
        push(
            &self.log,
            FakeEvent::SetIndexBuffer {
                buffer: buffer.id,
                format,
                offset,
            },
        );
    }

    fn use_resources(&mut self, resources: &[ResourceRef<FakeDriver>], stage: Stage, access: Access) {
        push(
            &self.log,
            FakeEvent::UseResources {
                ids: resources.iter().map(|r| r.id().0).collect(),
                stage,
                access,
            },
        );
    }

    fn memory_barrier(&mut self, after: QueueStages, before: QueueStages) {
        push(&self.log, FakeEvent::MemoryBarrier { after, before });
    }

    fn draw(&mut self, vertices: Range<u32>, instances: Range<u32>) {
        push(&self.log, FakeEvent::Draw { vertices, instances });
    }

    fn draw_indexed(&mut self, indices: Range<u32>, base_vertex: i32, instances: Range<u32>) {
        push(
            &self.log,
            FakeEvent::DrawIndexed {
                indices,
                base_vertex,
                instances,
            },
        );
    }

    fn end(self) {
        push(&self.log, FakeEvent::EndRenderEncoder);
    }
}

pub struct FakeComputeEncoder {
    log: EventLog,
}

impl ComputeEncoder<FakeDriver> for FakeComputeEncoder {
    fn bind_pipeline(&mut self, pipeline: &FakeComputePipeline) {
        push(&self.log, FakeEvent::BindComputePipeline { pipeline: pipeline.id });
    }

    fn set_buffer(&mut self, slot: u32, buffer: &FakeBuffer, offset: u64) {
        push(
            &self.log,
            FakeEvent::SetBuffer {
                stage: None,
                slot,
                buffer: buffer.id,
                offset,
            },
        );
    }

    fn set_buffer_offset(&mut self, slot: u32, offset: u64) {
        push(
            &self.log,
            FakeEvent::SetBufferOffset {
                stage: None,
                slot,
                offset,
            },
        );
    }

    fn set_texture(&mut self, slot: u32, texture: &FakeTexture) {
        push(
            &self.log,
            FakeEvent::SetTexture {
                stage: None,
                slot,
                texture: texture.id,
            },
        );
    }

    fn set_sampler(&mut self, slot: u32, sampler: &FakeSampler) {
        push(
            &self.log,
            FakeEvent::SetSampler {
                stage: None,
                slot,
                sampler: sampler.id,
            },
        );
    }

    fn use_resources(&mut self, resources: &[ResourceRef<FakeDriver>], access: Access) {
        push(
            &self.log,
            FakeEvent::UseResources {
                ids: resources.iter().map(|r| r.id().0).collect(),
                stage: Stage::Compute,
                access,
            },
        );
    }

    fn memory_barrier(&mut self, after: QueueStages, before: QueueStages) {
        push(&self.log, FakeEvent::MemoryBarrier { after, before });
    }

    fn dispatch(&mut self, groups: [u32; 3]) {
        push(&self.log, FakeEvent::Dispatch { groups });
    }

    fn end(self) {
        push(&self.log, FakeEvent::EndComputeEncoder);
    }
}

pub struct FakeBlitEncoder {
    log: EventLog,
}

impl BlitEncoder<FakeDriver> for FakeBlitEncoder {
    fn copy_buffer(
        &mut self,
        src: &FakeBuffer,
        _src_offset: u64,
        dst: &FakeBuffer,
        _dst_offset: u64,
        size: u64,
    ) {
        push(
            &self.log,
            FakeEvent::CopyBuffer {
                src: src.id,
                dst: dst.id,
                size,
            },
        );
    }

    fn copy_buffer_to_texture(&mut self, src: &FakeBuffer, _src_offset: u64, dst: &FakeTexture) {
        push(&self.log, FakeEvent::CopyBufferToTexture { src: src.id, dst: dst.id });
    }

    fn copy_texture_to_buffer(&mut self, src: &FakeTexture, dst: &FakeBuffer, _dst_offset: u64) {
        push(&self.log, FakeEvent::CopyTextureToBuffer { src: src.id, dst: dst.id });
    }

    fn fill_buffer(&mut self, buffer: &FakeBuffer, range: Range<u64>, value: u8) {
        push(
            &self.log,
            FakeEvent::FillBuffer {
                buffer: buffer.id,
                range,
                value,
            },
        );
    }

    fn end(self) {
        push(&self.log, FakeEvent::EndBlitEncoder);
    }
}

pub struct FakeResidencySet {
    id: u64,
    log: EventLog,
}

impl ResidencySet<FakeDriver> for FakeResidencySet {
    fn add(&mut self, resource: &ResourceRef<FakeDriver>) {
        push(
            &self.log,
            FakeEvent::ResidencyAdd {
                set: self.id,
                resource: resource.id().0,
            },
        );
    }

    fn commit(&mut self) {
        push(&self.log, FakeEvent::ResidencyCommit { set: self.id });
    }
}
