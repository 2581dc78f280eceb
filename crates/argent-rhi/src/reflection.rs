//! Shader-reflection inputs.
//!
//! These types are produced by pipeline/shader creation (out of scope here)
//! and consumed read-only: per-set binding layouts, native slot indices,
//! argument-buffer byte offsets, and the binding strategy chosen per shader
//! at creation time.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use argent_hal::{GpuDriver, StageUsage};

use crate::layout::DynamicOffsetLayout;

/// How a shader's uniform sets are bound.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BindingStrategy {
    /// Each binding slot is set individually on the encoder.
    Direct,
    /// Each set is one packed GPU-resident blob bound at a single buffer slot.
    ArgumentBuffer,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BindingKind {
    UniformBuffer,
    StorageBuffer,
    Texture,
    Sampler,
}

/// Native slot index per stage for direct binding. A binding visible to both
/// vertex and fragment stages may use different slots in each table.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct StageSlots {
    pub vertex: Option<u32>,
    pub fragment: Option<u32>,
    pub compute: Option<u32>,
}

/// Dynamic sub-binding info: the bound buffer rotates through frame slices
/// of `per_frame_size` bytes each.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DynamicBinding {
    pub per_frame_size: u64,
}

#[derive(Clone, Debug)]
pub struct BindingSlot {
    pub binding: u32,
    pub kind: BindingKind,
    /// Which stages touch the binding, and how. Copied into the tracker's
    /// usage buckets for argument-buffer shaders.
    pub usage: StageUsage,
    pub slots: StageSlots,
    /// Byte offset of this binding's word inside the set's argument buffer.
    pub arg_offset: u64,
    pub dynamic: Option<DynamicBinding>,
}

#[derive(Clone, Debug)]
pub struct SetLayout {
    pub index: u32,
    pub bindings: Vec<BindingSlot>,
    /// Size of the set's argument-buffer blob.
    pub encoded_size: u64,
}

impl SetLayout {
    pub fn dynamic_count(&self) -> u32 {
        self.bindings.iter().filter(|b| b.dynamic.is_some()).count() as u32
    }

    /// Union of all bindings' stage usage.
    pub fn stage_usage(&self) -> StageUsage {
        self.bindings
            .iter()
            .fold(StageUsage::empty(), |acc, b| acc.merge(b.usage))
    }
}

#[derive(Clone, Debug)]
pub struct ShaderLayout {
    pub strategy: BindingStrategy,
    pub sets: Vec<SetLayout>,
    pub dynamic_offsets: DynamicOffsetLayout,
}

impl ShaderLayout {
    pub fn set(&self, index: u32) -> Option<&SetLayout> {
        self.sets.iter().find(|s| s.index == index)
    }
}

static NEXT_PIPELINE_ID: AtomicU64 = AtomicU64::new(1);

fn next_pipeline_id() -> u64 {
    NEXT_PIPELINE_ID.fetch_add(1, Ordering::Relaxed)
}

/// A native render pipeline plus its reflection, with a process-unique id
/// used for pipeline-change detection.
pub struct RenderPipeline<D: GpuDriver> {
    pub native: D::RenderPipeline,
    pub shader: Arc<ShaderLayout>,
    id: u64,
}

impl<D: GpuDriver> RenderPipeline<D> {
    pub fn new(native: D::RenderPipeline, shader: Arc<ShaderLayout>) -> Self {
        Self {
            native,
            shader,
            id: next_pipeline_id(),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }
}

impl<D: GpuDriver> Clone for RenderPipeline<D> {
    fn clone(&self) -> Self {
        Self {
            native: self.native.clone(),
            shader: Arc::clone(&self.shader),
            id: self.id,
        }
    }
}

pub struct ComputePipeline<D: GpuDriver> {
    pub native: D::ComputePipeline,
    pub shader: Arc<ShaderLayout>,
    id: u64,
}

impl<D: GpuDriver> ComputePipeline<D> {
    pub fn new(native: D::ComputePipeline, shader: Arc<ShaderLayout>) -> Self {
        Self {
            native,
            shader,
            id: next_pipeline_id(),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }
}

impl<D: GpuDriver> Clone for ComputePipeline<D> {
    fn clone(&self) -> Self {
        Self {
            native: self.native.clone(),
            shader: Arc::clone(&self.shader),
            id: self.id,
        }
    }
}
