//! Bound uniform sets.
//!
//! A [`UniformSet`] is built once from a set layout plus the resources bound
//! at each slot, and is read-only afterwards, so one set may be bound from
//! many command buffers concurrently. For argument-buffer shaders the set
//! also carries its encoded form: a baked GPU-resident blob when nothing in
//! the set varies per frame, or template bytes plus patch sites when dynamic
//! sub-bindings need per-draw address fixup.

use std::collections::BTreeMap;
use std::sync::Arc;

use argent_hal::{
    GpuDriver, NativeBuffer, NativeSampler, NativeTexture, ResourceRef, StageUsage,
};
use tracing::warn;

use crate::error::RhiError;
use crate::reflection::{BindingKind, BindingStrategy, SetLayout};

/// A resource bound at one slot of a uniform set.
pub enum BoundResource<D: GpuDriver> {
    Buffer { buffer: D::Buffer, offset: u64 },
    Texture(D::Texture),
    Sampler(D::Sampler),
}

impl<D: GpuDriver> Clone for BoundResource<D> {
    fn clone(&self) -> Self {
        match self {
            BoundResource::Buffer { buffer, offset } => BoundResource::Buffer {
                buffer: buffer.clone(),
                offset: *offset,
            },
            BoundResource::Texture(t) => BoundResource::Texture(t.clone()),
            BoundResource::Sampler(s) => BoundResource::Sampler(s.clone()),
        }
    }
}

/// Resources grouped by their stage-usage word, each bucket sorted by
/// [`argent_hal::ResourceId`] and deduplicated.
///
/// Samplers never appear here; they are not memory resources.
pub struct UsageTable<D: GpuDriver> {
    buckets: BTreeMap<StageUsage, Vec<ResourceRef<D>>>,
}

impl<D: GpuDriver> Default for UsageTable<D> {
    fn default() -> Self {
        Self {
            buckets: BTreeMap::new(),
        }
    }
}

impl<D: GpuDriver> UsageTable<D> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert `resource` into the bucket for `usage`, keeping the bucket
    /// sorted and unique.
    pub fn insert(&mut self, usage: StageUsage, resource: ResourceRef<D>) {
        if usage.is_empty() {
            return;
        }
        let bucket = self.buckets.entry(usage).or_default();
        match bucket.binary_search_by_key(&resource.id(), |r| r.id()) {
            Ok(_) => {}
            Err(pos) => bucket.insert(pos, resource),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.buckets.values().all(|b| b.is_empty())
    }

    pub fn buckets(&self) -> impl Iterator<Item = (StageUsage, &[ResourceRef<D>])> {
        self.buckets.iter().map(|(u, b)| (*u, b.as_slice()))
    }
}

/// One dynamic sub-binding's fixup inside an argument-buffer template.
#[derive(Clone, Copy, Debug)]
pub struct PatchSite {
    /// Ordinal among the set's dynamic sub-bindings, in binding order. Selects
    /// the sub-binding's nibble in the per-draw dynamic-offsets word.
    pub ordinal: u32,
    /// Byte offset of the 64-bit address word inside the blob.
    pub blob_offset: u64,
    /// GPU address of frame slice 0.
    pub base_address: u64,
    pub per_frame_size: u64,
}

enum SetData<D: GpuDriver> {
    /// Direct-binding shader: slots are set individually, nothing encoded.
    Direct,
    /// Static argument-buffer set: one pre-baked GPU-resident blob.
    Baked { blob: D::Buffer },
    /// Dynamic argument-buffer set: template bytes copied into ring scratch
    /// and patched per bind.
    Template {
        bytes: Vec<u8>,
        patches: Vec<PatchSite>,
    },
}

pub struct UniformSet<D: GpuDriver> {
    layout: Arc<SetLayout>,
    resources: Vec<BoundResource<D>>,
    data: SetData<D>,
    usage: Arc<UsageTable<D>>,
}

impl<D: GpuDriver> UniformSet<D> {
    /// Build a set from `layout` and the resources bound at its slots, in
    /// binding order (`resources[i]` fills `layout.bindings[i]`).
    ///
    /// For [`BindingStrategy::ArgumentBuffer`] this encodes the set: every
    /// slot's GPU address or handle is written into a byte blob at the
    /// layout's argument offsets. A set with no dynamic sub-bindings is baked
    /// into a GPU-resident buffer here, once; a set with dynamic sub-bindings
    /// keeps the blob as template bytes plus patch sites.
    pub fn new(
        driver: &D,
        layout: Arc<SetLayout>,
        resources: Vec<BoundResource<D>>,
        strategy: BindingStrategy,
    ) -> Result<Self, RhiError> {
        assert_eq!(
            resources.len(),
            layout.bindings.len(),
            "uniform set resources must match the layout's binding count"
        );

        let data = match strategy {
            BindingStrategy::Direct => SetData::Direct,
            BindingStrategy::ArgumentBuffer => {
                let caps = driver.capabilities();
                if !caps.argument_buffers || !caps.gpu_addresses {
                    warn!(
                        set = layout.index,
                        "driver lacks argument-buffer support; set cannot be encoded"
                    );
                    return Err(RhiError::UnsupportedBinding {
                        set: layout.index,
                        binding: 0,
                        reason: "driver does not support argument buffers",
                    });
                }
                Self::encode(driver, &layout, &resources)?
            }
        };

        let mut usage = UsageTable::new();
        if !matches!(data, SetData::Direct) {
            for (slot, resource) in layout.bindings.iter().zip(&resources) {
                match resource {
                    BoundResource::Buffer { buffer, .. } => {
                        usage.insert(slot.usage, ResourceRef::Buffer(buffer.clone()));
                    }
                    BoundResource::Texture(t) => {
                        usage.insert(slot.usage, ResourceRef::Texture(t.clone()));
                    }
                    BoundResource::Sampler(_) => {}
                }
            }
        }

        Ok(Self {
            layout,
            resources,
            data,
            usage: Arc::new(usage),
        })
    }

    fn encode(
        driver: &D,
        layout: &SetLayout,
        resources: &[BoundResource<D>],
    ) -> Result<SetData<D>, RhiError> {
        let mut bytes = vec![0u8; layout.encoded_size as usize];
        let mut patches = Vec::new();

        for (slot, resource) in layout.bindings.iter().zip(resources) {
            let word = match (slot.kind, resource) {
                (
                    BindingKind::UniformBuffer | BindingKind::StorageBuffer,
                    BoundResource::Buffer { buffer, offset },
                ) => {
                    let base = buffer.gpu_address().ok_or_else(|| {
                        warn!(
                            set = layout.index,
                            binding = slot.binding,
                            "buffer exposes no GPU address; cannot encode argument buffer"
                        );
                        RhiError::UnsupportedBinding {
                            set: layout.index,
                            binding: slot.binding,
                            reason: "buffer has no GPU address for argument-buffer encoding",
                        }
                    })? + offset;
                    if let Some(dynamic) = slot.dynamic {
                        patches.push(PatchSite {
                            ordinal: patches.len() as u32,
                            blob_offset: slot.arg_offset,
                            base_address: base,
                            per_frame_size: dynamic.per_frame_size,
                        });
                    }
                    base
                }
                (BindingKind::Texture, BoundResource::Texture(t)) => t.gpu_handle(),
                (BindingKind::Sampler, BoundResource::Sampler(s)) => s.gpu_handle(),
                _ => panic!(
                    "bound resource does not match binding {} of set {}",
                    slot.binding, layout.index
                ),
            };

            let at = slot.arg_offset as usize;
            bytes[at..at + 8].copy_from_slice(&word.to_le_bytes());
        }

        if patches.is_empty() {
            let blob = driver.new_scratch_buffer(layout.encoded_size)?;
            blob.write(0, &bytes);
            Ok(SetData::Baked { blob })
        } else {
            Ok(SetData::Template { bytes, patches })
        }
    }

    pub fn layout(&self) -> &Arc<SetLayout> {
        &self.layout
    }

    pub fn index(&self) -> u32 {
        self.layout.index
    }

    /// Bound resources in binding order.
    pub fn resources(&self) -> &[BoundResource<D>] {
        &self.resources
    }

    /// The read-only usage table copied into a tracker on bind. Empty for
    /// direct-binding sets (direct binds imply residency on their own).
    pub fn usage(&self) -> &Arc<UsageTable<D>> {
        &self.usage
    }

    pub fn is_encoded(&self) -> bool {
        !matches!(self.data, SetData::Direct)
    }

    /// The baked blob, when the set has no dynamic sub-bindings.
    pub fn baked_blob(&self) -> Option<&D::Buffer> {
        match &self.data {
            SetData::Baked { blob } => Some(blob),
            _ => None,
        }
    }

    /// Template bytes + patch sites, when the set has dynamic sub-bindings.
    pub fn template(&self) -> Option<(&[u8], &[PatchSite])> {
        match &self.data {
            SetData::Template { bytes, patches } => Some((bytes, patches)),
            _ => None,
        }
    }
}

impl<D: GpuDriver> Clone for UniformSet<D> {
    fn clone(&self) -> Self {
        Self {
            layout: Arc::clone(&self.layout),
            resources: self.resources.clone(),
            data: match &self.data {
                SetData::Direct => SetData::Direct,
                SetData::Baked { blob } => SetData::Baked { blob: blob.clone() },
                SetData::Template { bytes, patches } => SetData::Template {
                    bytes: bytes.clone(),
                    patches: patches.clone(),
                },
            },
            usage: Arc::clone(&self.usage),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use argent_hal::testing::FakeDriver;
    use argent_hal::{Access, NativeResource, Stage};

    use crate::reflection::{BindingSlot, DynamicBinding, StageSlots};

    fn layout(bindings: Vec<BindingSlot>) -> Arc<SetLayout> {
        let encoded_size = bindings.len() as u64 * 8;
        Arc::new(SetLayout {
            index: 0,
            bindings,
            encoded_size,
        })
    }

    fn buffer_slot(binding: u32, dynamic: Option<DynamicBinding>) -> BindingSlot {
        BindingSlot {
            binding,
            kind: BindingKind::UniformBuffer,
            usage: StageUsage::single(Stage::Vertex, Access::Read),
            slots: StageSlots::default(),
            arg_offset: binding as u64 * 8,
            dynamic,
        }
    }

    #[test]
    fn static_argument_set_bakes_addresses_once() {
        let driver = FakeDriver::new();
        let buffer = driver.buffer(64);
        let base = buffer.gpu_address().unwrap();

        let set = UniformSet::new(
            &driver,
            layout(vec![buffer_slot(0, None)]),
            vec![BoundResource::Buffer { buffer, offset: 16 }],
            BindingStrategy::ArgumentBuffer,
        )
        .unwrap();

        let blob = set.baked_blob().expect("static set should be baked");
        let mut word = [0u8; 8];
        blob.read(0, &mut word);
        assert_eq!(u64::from_le_bytes(word), base + 16);
        assert!(set.template().is_none());
    }

    #[test]
    fn dynamic_argument_set_keeps_template_and_patch_sites() {
        let driver = FakeDriver::new();
        let buffer = driver.buffer(64);
        let base = buffer.gpu_address().unwrap();

        let set = UniformSet::new(
            &driver,
            layout(vec![
                buffer_slot(0, None),
                buffer_slot(1, Some(DynamicBinding { per_frame_size: 256 })),
            ]),
            vec![
                BoundResource::Buffer {
                    buffer: buffer.clone(),
                    offset: 0,
                },
                BoundResource::Buffer { buffer, offset: 0 },
            ],
            BindingStrategy::ArgumentBuffer,
        )
        .unwrap();

        assert!(set.baked_blob().is_none());
        let (bytes, patches) = set.template().expect("dynamic set keeps its template");
        assert_eq!(bytes.len(), 16);
        assert_eq!(patches.len(), 1);
        assert_eq!(patches[0].ordinal, 0);
        assert_eq!(patches[0].blob_offset, 8);
        assert_eq!(patches[0].base_address, base);
        assert_eq!(patches[0].per_frame_size, 256);
        // Template holds the frame-0 address.
        assert_eq!(u64::from_le_bytes(bytes[8..16].try_into().unwrap()), base);
    }

    #[test]
    fn usage_table_buckets_are_sorted_and_unique() {
        let driver = FakeDriver::new();
        let a = driver.buffer(16);
        let b = driver.buffer(16);
        let usage = StageUsage::single(Stage::Fragment, Access::Read);

        let mut table: UsageTable<FakeDriver> = UsageTable::new();
        table.insert(usage, ResourceRef::Buffer(b.clone()));
        table.insert(usage, ResourceRef::Buffer(a.clone()));
        table.insert(usage, ResourceRef::Buffer(b.clone()));

        let (bucket_usage, bucket) = table.buckets().next().unwrap();
        assert_eq!(bucket_usage, usage);
        let ids: Vec<_> = bucket.iter().map(|r| r.id()).collect();
        assert_eq!(ids, vec![a.id(), b.id()]);
    }

    #[test]
    fn argument_encoding_requires_driver_support() {
        let driver = FakeDriver::with_capabilities(argent_hal::DriverCapabilities {
            argument_buffers: false,
            ..argent_hal::DriverCapabilities::default()
        });
        let buffer = driver.buffer(64);
        let result = UniformSet::new(
            &driver,
            layout(vec![buffer_slot(0, None)]),
            vec![BoundResource::Buffer { buffer, offset: 0 }],
            BindingStrategy::ArgumentBuffer,
        );
        assert!(matches!(
            result,
            Err(RhiError::UnsupportedBinding { set: 0, .. })
        ));
    }

    #[test]
    fn direct_sets_carry_no_usage_table() {
        let driver = FakeDriver::new();
        let buffer = driver.buffer(64);
        let set = UniformSet::new(
            &driver,
            layout(vec![buffer_slot(0, None)]),
            vec![BoundResource::Buffer { buffer, offset: 0 }],
            BindingStrategy::Direct,
        )
        .unwrap();
        assert!(!set.is_encoded());
        assert!(set.usage().is_empty());
    }
}
