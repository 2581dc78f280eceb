//! `argent-hal` defines the native-API surface the Argent RHI records into.
//!
//! The native API is Metal-class: strongly-typed single-purpose encoders
//! (render / compute / blit), no cross-pass memory barriers by default, and
//! explicit residency declarations for resources reached through argument
//! buffers. This crate provides:
//! - The [`GpuDriver`] trait family modelling that API (see [`driver`]).
//! - Shared value types: stage masks, queue-stage classes, per-stage usage
//!   packing, resource identities (see [`types`]).
//! - A linear sub-allocation arena used by the transient allocators upstream
//!   (see [`LinearArena`]).
//! - A recording fake driver behind the `test-utils` feature.

mod arena;
mod caps;

pub mod driver;
pub mod types;

#[cfg(feature = "test-utils")]
pub mod testing;

pub use arena::{align_up, LinearArena};
pub use caps::DriverCapabilities;
pub use driver::{
    BlitEncoder, ComputeEncoder, DriverError, GpuDriver, NativeBuffer, NativeCommandBuffer,
    NativeResource, NativeSampler, NativeTexture, RenderEncoder, RenderPassDesc, ResidencySet,
    ResourceRef,
};
pub use types::{
    Access, IndexFormat, PassClass, PipelineStages, QueueStages, RenderStage, ResourceId,
    ScissorRect, Stage, StageUsage, Viewport,
};
