//! Value types shared between the RHI core and native drivers.

use bitflags::bitflags;

/// Stable identity of a native GPU resource.
///
/// Drivers must guarantee ids are unique per live resource; the tracker keys
/// its tables on them.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ResourceId(pub u64);

bitflags! {
    /// Fine-grained pipeline stage mask used by RHI barrier calls.
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
    pub struct PipelineStages: u32 {
        const DRAW_INDIRECT = 1 << 0;
        const VERTEX_INPUT = 1 << 1;
        const VERTEX_SHADER = 1 << 2;
        const FRAGMENT_SHADER = 1 << 3;
        const EARLY_FRAGMENT_TESTS = 1 << 4;
        const LATE_FRAGMENT_TESTS = 1 << 5;
        const COLOR_OUTPUT = 1 << 6;
        const COMPUTE_SHADER = 1 << 7;
        const TRANSFER = 1 << 8;

        const ALL_GRAPHICS = Self::DRAW_INDIRECT.bits()
            | Self::VERTEX_INPUT.bits()
            | Self::VERTEX_SHADER.bits()
            | Self::FRAGMENT_SHADER.bits()
            | Self::EARLY_FRAGMENT_TESTS.bits()
            | Self::LATE_FRAGMENT_TESTS.bits()
            | Self::COLOR_OUTPUT.bits();
        const ALL_COMMANDS = Self::ALL_GRAPHICS.bits()
            | Self::COMPUTE_SHADER.bits()
            | Self::TRANSFER.bits();
    }
}

bitflags! {
    /// Coarse queue-stage classes the native API synchronizes on.
    ///
    /// A pending barrier records the *after* side as one of these masks; an
    /// encoder created later waits on the accumulated mask for its class.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
    pub struct QueueStages: u32 {
        const VERTEX = 1 << 0;
        const FRAGMENT = 1 << 1;
        const DISPATCH = 1 << 2;
        const BLIT = 1 << 3;
    }
}

impl PipelineStages {
    /// Collapse a fine-grained stage mask to the native queue-stage classes.
    pub fn to_queue_stages(self) -> QueueStages {
        let mut out = QueueStages::empty();
        if self.intersects(
            Self::DRAW_INDIRECT | Self::VERTEX_INPUT | Self::VERTEX_SHADER,
        ) {
            out |= QueueStages::VERTEX;
        }
        if self.intersects(
            Self::FRAGMENT_SHADER
                | Self::EARLY_FRAGMENT_TESTS
                | Self::LATE_FRAGMENT_TESTS
                | Self::COLOR_OUTPUT,
        ) {
            out |= QueueStages::FRAGMENT;
        }
        if self.contains(Self::COMPUTE_SHADER) {
            out |= QueueStages::DISPATCH;
        }
        if self.contains(Self::TRANSFER) {
            out |= QueueStages::BLIT;
        }
        out
    }
}

/// Destination-class key for the pending-barrier table.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum PassClass {
    Vertex,
    Fragment,
    Dispatch,
    Blit,
}

impl PassClass {
    pub const ALL: [PassClass; 4] = [
        PassClass::Vertex,
        PassClass::Fragment,
        PassClass::Dispatch,
        PassClass::Blit,
    ];

    pub const fn index(self) -> usize {
        match self {
            PassClass::Vertex => 0,
            PassClass::Fragment => 1,
            PassClass::Dispatch => 2,
            PassClass::Blit => 3,
        }
    }

    pub const fn queue_stage(self) -> QueueStages {
        match self {
            PassClass::Vertex => QueueStages::VERTEX,
            PassClass::Fragment => QueueStages::FRAGMENT,
            PassClass::Dispatch => QueueStages::DISPATCH,
            PassClass::Blit => QueueStages::BLIT,
        }
    }
}

/// Shader stage a resource usage is attributed to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Stage {
    Vertex,
    Fragment,
    Compute,
    Transfer,
}

impl Stage {
    pub const ALL: [Stage; 4] = [Stage::Vertex, Stage::Fragment, Stage::Compute, Stage::Transfer];

    const fn shift(self) -> u32 {
        match self {
            Stage::Vertex => 0,
            Stage::Fragment => 2,
            Stage::Compute => 4,
            Stage::Transfer => 6,
        }
    }
}

/// Stage bound in a render encoder's per-slot binding tables.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum RenderStage {
    Vertex,
    Fragment,
}

/// How a stage accesses a resource.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Access {
    None,
    Read,
    Write,
    ReadWrite,
}

impl Access {
    const fn bits(self) -> u32 {
        match self {
            Access::None => 0b00,
            Access::Read => 0b01,
            Access::Write => 0b10,
            Access::ReadWrite => 0b11,
        }
    }

    const fn from_bits(bits: u32) -> Access {
        match bits & 0b11 {
            0b01 => Access::Read,
            0b10 => Access::Write,
            0b11 => Access::ReadWrite,
            _ => Access::None,
        }
    }

    pub fn union(self, other: Access) -> Access {
        Access::from_bits(self.bits() | other.bits())
    }
}

/// Per-stage access packing: two bits per stage.
///
/// The packing has room for 16 stages; four are defined. All reads and
/// writes of the word go through the named accessors below.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct StageUsage(u32);

impl StageUsage {
    pub const fn empty() -> Self {
        Self(0)
    }

    pub fn single(stage: Stage, access: Access) -> Self {
        Self::empty().with_access(stage, access)
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub fn access_for(self, stage: Stage) -> Access {
        Access::from_bits(self.0 >> stage.shift())
    }

    /// Returns a copy with `stage`'s access replaced by `access`.
    #[must_use]
    pub fn with_access(self, stage: Stage, access: Access) -> Self {
        let shift = stage.shift();
        Self((self.0 & !(0b11 << shift)) | (access.bits() << shift))
    }

    /// Per-stage union of two usage words.
    #[must_use]
    pub fn merge(self, other: Self) -> Self {
        // Access bits are a lattice under bitwise-or (Read|Write = ReadWrite).
        Self(self.0 | other.0)
    }

    /// Stages with a non-`None` access, in declaration order.
    pub fn stages(self) -> impl Iterator<Item = Stage> {
        Stage::ALL
            .into_iter()
            .filter(move |s| self.access_for(*s) != Access::None)
    }

    /// True when more than one stage carries a non-`None` access.
    pub fn is_multi_stage(self) -> bool {
        self.stages().count() > 1
    }
}

/// Index element width for indexed draws.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum IndexFormat {
    Uint16,
    Uint32,
}

/// POD so drivers can copy viewport arrays straight into native structs.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, bytemuck::Pod, bytemuck::Zeroable)]
pub struct Viewport {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
    pub min_depth: f32,
    pub max_depth: f32,
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, bytemuck::Pod, bytemuck::Zeroable)]
pub struct ScissorRect {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stage_usage_roundtrips_every_stage_and_access() {
        for stage in Stage::ALL {
            for access in [Access::None, Access::Read, Access::Write, Access::ReadWrite] {
                let usage = StageUsage::empty().with_access(stage, access);
                assert_eq!(usage.access_for(stage), access);
                for other in Stage::ALL {
                    if other != stage {
                        assert_eq!(usage.access_for(other), Access::None);
                    }
                }
            }
        }
    }

    #[test]
    fn stage_usage_merge_is_per_stage_union() {
        let a = StageUsage::single(Stage::Vertex, Access::Read);
        let b = StageUsage::single(Stage::Vertex, Access::Write)
            .with_access(Stage::Fragment, Access::Read);

        let merged = a.merge(b);
        assert_eq!(merged.access_for(Stage::Vertex), Access::ReadWrite);
        assert_eq!(merged.access_for(Stage::Fragment), Access::Read);
        assert_eq!(merged.access_for(Stage::Compute), Access::None);
        assert!(merged.is_multi_stage());
    }

    #[test]
    fn stage_usage_with_access_replaces_rather_than_accumulates() {
        let usage = StageUsage::single(Stage::Compute, Access::ReadWrite)
            .with_access(Stage::Compute, Access::Read);
        assert_eq!(usage.access_for(Stage::Compute), Access::Read);
    }

    #[test]
    fn fine_stages_collapse_to_queue_classes() {
        assert_eq!(
            PipelineStages::VERTEX_SHADER.to_queue_stages(),
            QueueStages::VERTEX
        );
        assert_eq!(
            (PipelineStages::COLOR_OUTPUT | PipelineStages::LATE_FRAGMENT_TESTS)
                .to_queue_stages(),
            QueueStages::FRAGMENT
        );
        assert_eq!(
            PipelineStages::COMPUTE_SHADER.to_queue_stages(),
            QueueStages::DISPATCH
        );
        assert_eq!(
            PipelineStages::TRANSFER.to_queue_stages(),
            QueueStages::BLIT
        );
        assert_eq!(
            PipelineStages::ALL_COMMANDS.to_queue_stages(),
            QueueStages::all()
        );
    }
}
