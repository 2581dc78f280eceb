//! `argent-rhi` is the command-encoding core of the Argent RHI.
//!
//! It records driver-agnostic rendering commands into a Metal-class native
//! API (see `argent-hal`). The pieces:
//! - [`CommandBuffer`]: the pass state machine (None / Render / Compute /
//!   Blit), dirty-state flush, and cross-pass barrier synthesis.
//! - [`ResourceTracker`]: per-pass aggregation of argument-buffer resource
//!   usage, declared to the active encoder before each draw/dispatch.
//! - [`RingBufferAllocator`]: transient, segment-based scratch allocator for
//!   per-bind GPU-resident data.
//! - [`DynamicOffsetLayout`]: bit-packed placement of dynamic sub-binding
//!   frame indices inside a per-draw 32-bit dynamic-offsets word.
//! - [`UniformSet`] + the binding codec: direct per-slot binding with a
//!   de-duplicating cache, or argument-buffer binding with patched blobs.

mod barrier;
mod codec;
mod command_buffer;
mod error;
mod layout;
mod reflection;
mod ring;
mod tracker;
mod uniform_set;

pub use barrier::PendingBarriers;
pub use command_buffer::{CommandBuffer, CommandBufferDescriptor, PassKind};
pub use error::RhiError;
pub use layout::{DynamicOffsetLayout, MAX_UNIFORM_SETS};
pub use reflection::{
    BindingKind, BindingSlot, BindingStrategy, ComputePipeline, DynamicBinding, RenderPipeline,
    SetLayout, ShaderLayout, StageSlots,
};
pub use ring::{RingBufferAllocator, RingBufferConfig, ScratchAlloc};
pub use tracker::{ResourceTracker, EVICTION_THRESHOLD};
pub use uniform_set::{BoundResource, PatchSite, UniformSet, UsageTable};
