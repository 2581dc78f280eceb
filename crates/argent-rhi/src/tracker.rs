//! Per-pass resource-usage tracking and residency declaration.
//!
//! Resources reached through argument buffers are invisible to the native
//! API's automatic residency, so before every draw/dispatch the command
//! buffer declares exactly which resources the pass touches and how. The
//! tracker aggregates the usage tables of every bound set into per-usage
//! buckets, skips resources already declared with identical usage this pass,
//! and ages out entries for resources no pass has touched in a long time.

use std::collections::BTreeMap;

use argent_hal::{Access, GpuDriver, ResourceId, ResourceRef, Stage, StageUsage};
use smallvec::SmallVec;
use tracing::debug;

use crate::uniform_set::UsageTable;

/// Consecutive untouched passes after which a tracked resource is dropped.
pub const EVICTION_THRESHOLD: u32 = 256;

struct TrackedEntry {
    /// Combined usage accumulated this pass.
    accumulated: StageUsage,
    /// Usage most recently declared to the active encoder this pass. A
    /// resource is pending while this differs from `accumulated`.
    declared: StageUsage,
    unused_passes: u32,
    touched: bool,
}

impl TrackedEntry {
    fn new() -> Self {
        Self {
            accumulated: StageUsage::empty(),
            declared: StageUsage::empty(),
            unused_passes: 0,
            touched: false,
        }
    }
}

pub struct ResourceTracker<D: GpuDriver> {
    entries: BTreeMap<ResourceId, TrackedEntry>,
    /// Pending declarations grouped by combined stage usage. Bucket lists are
    /// sorted by resource id and unique; keys are retained across `encode`.
    buckets: BTreeMap<StageUsage, Vec<ResourceRef<D>>>,
    threshold: u32,
}

impl<D: GpuDriver> Default for ResourceTracker<D> {
    fn default() -> Self {
        Self::with_threshold(EVICTION_THRESHOLD)
    }
}

impl<D: GpuDriver> ResourceTracker<D> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_threshold(threshold: u32) -> Self {
        assert!(threshold > 0, "eviction threshold must be positive");
        Self {
            entries: BTreeMap::new(),
            buckets: BTreeMap::new(),
            threshold,
        }
    }

    /// Merge a bound set's usage table into this pass.
    ///
    /// Each incoming bucket is folded into the matching pending bucket with a
    /// two-pointer merge of the two sorted lists. A resource already declared
    /// this pass with identical combined usage is skipped; one whose combined
    /// usage just widened goes pending again under the widened key and will
    /// be re-declared in full.
    pub fn merge_from(&mut self, table: &UsageTable<D>) {
        for (usage, incoming) in table.buckets() {
            let mut unchanged: SmallVec<[ResourceRef<D>; 8]> = SmallVec::new();
            for resource in incoming {
                let entry = self
                    .entries
                    .entry(resource.id())
                    .or_insert_with(TrackedEntry::new);
                entry.touched = true;
                entry.unused_passes = 0;
                entry.accumulated = entry.accumulated.merge(usage);
                let accumulated = entry.accumulated;
                let declared = entry.declared;

                if accumulated == declared {
                    continue;
                }
                if accumulated == usage {
                    unchanged.push(resource.clone());
                } else {
                    let bucket = self.buckets.entry(accumulated).or_default();
                    insert_sorted(bucket, resource.clone());
                }
            }
            if !unchanged.is_empty() {
                let bucket = self.buckets.entry(usage).or_default();
                merge_sorted(bucket, &unchanged);
            }
        }
    }

    /// Declare all pending resources through `declare`, once per stage that
    /// uses them. Called immediately before each draw/dispatch. Bucket lists
    /// are cleared; keys persist to avoid re-allocating across many draws.
    pub fn encode<F>(&mut self, mut declare: F)
    where
        F: FnMut(&[ResourceRef<D>], Stage, Access),
    {
        let entries = &mut self.entries;
        for (usage, bucket) in self.buckets.iter_mut() {
            if bucket.is_empty() {
                continue;
            }
            let mut pending: SmallVec<[ResourceRef<D>; 8]> = SmallVec::new();
            for resource in bucket.iter() {
                if let Some(entry) = entries.get_mut(&resource.id()) {
                    // A stale membership from before the usage widened keys a
                    // bucket that no longer matches; the widened bucket owns
                    // the declaration.
                    if entry.accumulated == *usage && entry.declared != entry.accumulated {
                        entry.declared = entry.accumulated;
                        pending.push(resource.clone());
                    }
                }
            }
            bucket.clear();
            if pending.is_empty() {
                continue;
            }
            for stage in usage.stages() {
                declare(&pending, stage, usage.access_for(stage));
            }
        }
    }

    /// End-of-pass bookkeeping: touched entries start the next pass fresh,
    /// untouched entries age and are evicted past the threshold.
    pub fn reset(&mut self) {
        let threshold = self.threshold;
        let before = self.entries.len();
        self.entries.retain(|_, entry| {
            if entry.touched {
                entry.touched = false;
                entry.accumulated = StageUsage::empty();
                entry.declared = StageUsage::empty();
                entry.unused_passes = 0;
                true
            } else {
                entry.unused_passes += 1;
                entry.unused_passes < threshold
            }
        });
        let evicted = before - self.entries.len();
        if evicted > 0 {
            debug!(evicted, remaining = self.entries.len(), "evicted stale tracker entries");
        }
        for bucket in self.buckets.values_mut() {
            bucket.clear();
        }
    }

    pub fn tracked_count(&self) -> usize {
        self.entries.len()
    }

    pub fn is_tracked(&self, id: ResourceId) -> bool {
        self.entries.contains_key(&id)
    }

    /// The pending declaration list for one usage key.
    pub fn pending_bucket(&self, usage: StageUsage) -> &[ResourceRef<D>] {
        self.buckets.get(&usage).map(|b| b.as_slice()).unwrap_or(&[])
    }
}

fn insert_sorted<D: GpuDriver>(bucket: &mut Vec<ResourceRef<D>>, resource: ResourceRef<D>) {
    match bucket.binary_search_by_key(&resource.id(), |r| r.id()) {
        Ok(_) => {}
        Err(pos) => bucket.insert(pos, resource),
    }
}

/// Two-pointer merge of sorted, unique `src` into sorted, unique `dst`.
fn merge_sorted<D: GpuDriver>(dst: &mut Vec<ResourceRef<D>>, src: &[ResourceRef<D>]) {
    if src.is_empty() {
        return;
    }
    if dst.is_empty() {
        dst.extend(src.iter().cloned());
        return;
    }
    let mut merged = Vec::with_capacity(dst.len() + src.len());
    let mut i = 0;
    let mut j = 0;
    while i < dst.len() && j < src.len() {
        match dst[i].id().cmp(&src[j].id()) {
            std::cmp::Ordering::Less => {
                merged.push(dst[i].clone());
                i += 1;
            }
            std::cmp::Ordering::Greater => {
                merged.push(src[j].clone());
                j += 1;
            }
            std::cmp::Ordering::Equal => {
                merged.push(dst[i].clone());
                i += 1;
                j += 1;
            }
        }
    }
    merged.extend(dst[i..].iter().cloned());
    merged.extend(src[j..].iter().cloned());
    *dst = merged;
}

#[cfg(test)]
mod tests {
    use super::*;
    use argent_hal::testing::FakeDriver;
    use argent_hal::NativeResource;

    fn table(
        usage: StageUsage,
        resources: &[&<FakeDriver as GpuDriver>::Buffer],
    ) -> UsageTable<FakeDriver> {
        let mut table = UsageTable::new();
        for r in resources {
            table.insert(usage, ResourceRef::Buffer((*r).clone()));
        }
        table
    }

    fn declared(tracker: &mut ResourceTracker<FakeDriver>) -> Vec<(Vec<ResourceId>, Stage, Access)> {
        let mut out = Vec::new();
        tracker.encode(|resources, stage, access| {
            out.push((resources.iter().map(|r| r.id()).collect(), stage, access));
        });
        out
    }

    #[test]
    fn bucket_lists_stay_sorted_and_unique_across_merges() {
        let driver = FakeDriver::new();
        let a = driver.buffer(4);
        let b = driver.buffer(4);
        let c = driver.buffer(4);
        let usage = StageUsage::single(Stage::Vertex, Access::Read);

        let mut tracker = ResourceTracker::new();
        tracker.merge_from(&table(usage, &[&b, &c]));
        tracker.merge_from(&table(usage, &[&a, &b]));
        tracker.merge_from(&table(usage, &[&c]));

        let ids: Vec<_> = tracker.pending_bucket(usage).iter().map(|r| r.id()).collect();
        assert_eq!(ids, vec![a.id(), b.id(), c.id()]);
    }

    #[test]
    fn unchanged_usage_is_not_redeclared() {
        let driver = FakeDriver::new();
        let a = driver.buffer(4);
        let usage = StageUsage::single(Stage::Fragment, Access::Read);

        let mut tracker = ResourceTracker::new();
        tracker.merge_from(&table(usage, &[&a]));
        assert_eq!(declared(&mut tracker).len(), 1);

        // Same set bound again mid-pass: nothing new to declare.
        tracker.merge_from(&table(usage, &[&a]));
        assert!(declared(&mut tracker).is_empty());
    }

    #[test]
    fn widened_usage_is_redeclared_in_full() {
        let driver = FakeDriver::new();
        let a = driver.buffer(4);
        let read = StageUsage::single(Stage::Compute, Access::Read);
        let write = StageUsage::single(Stage::Compute, Access::Write);

        let mut tracker = ResourceTracker::new();
        tracker.merge_from(&table(read, &[&a]));
        assert_eq!(
            declared(&mut tracker),
            vec![(vec![a.id()], Stage::Compute, Access::Read)]
        );

        tracker.merge_from(&table(write, &[&a]));
        assert_eq!(
            declared(&mut tracker),
            vec![(vec![a.id()], Stage::Compute, Access::ReadWrite)]
        );
    }

    #[test]
    fn multi_stage_usage_splits_into_one_declaration_per_stage() {
        let driver = FakeDriver::new();
        let a = driver.buffer(4);
        let usage = StageUsage::single(Stage::Vertex, Access::Read)
            .with_access(Stage::Fragment, Access::Write);

        let mut tracker = ResourceTracker::new();
        tracker.merge_from(&table(usage, &[&a]));
        assert_eq!(
            declared(&mut tracker),
            vec![
                (vec![a.id()], Stage::Vertex, Access::Read),
                (vec![a.id()], Stage::Fragment, Access::Write),
            ]
        );
    }

    #[test]
    fn eviction_happens_exactly_at_the_threshold() {
        let driver = FakeDriver::new();
        let a = driver.buffer(4);
        let usage = StageUsage::single(Stage::Vertex, Access::Read);

        let mut tracker = ResourceTracker::with_threshold(3);
        tracker.merge_from(&table(usage, &[&a]));
        tracker.reset();

        tracker.reset();
        tracker.reset();
        assert!(tracker.is_tracked(a.id()), "one reset short of the threshold retains");
        tracker.reset();
        assert!(!tracker.is_tracked(a.id()), "threshold-th unused reset evicts");
    }

    #[test]
    fn retouching_rewinds_the_unused_counter() {
        let driver = FakeDriver::new();
        let a = driver.buffer(4);
        let usage = StageUsage::single(Stage::Vertex, Access::Read);

        let mut tracker = ResourceTracker::with_threshold(2);
        tracker.merge_from(&table(usage, &[&a]));
        tracker.reset();
        tracker.reset();

        tracker.merge_from(&table(usage, &[&a]));
        tracker.reset();
        tracker.reset();
        assert!(tracker.is_tracked(a.id()));
        tracker.reset();
        assert!(!tracker.is_tracked(a.id()));
    }

    #[test]
    fn declarations_resume_after_a_pass_reset() {
        let driver = FakeDriver::new();
        let a = driver.buffer(4);
        let usage = StageUsage::single(Stage::Vertex, Access::Read);

        let mut tracker = ResourceTracker::new();
        tracker.merge_from(&table(usage, &[&a]));
        assert_eq!(declared(&mut tracker).len(), 1);
        tracker.reset();

        // New pass, new encoder: the same usage must be declared again.
        tracker.merge_from(&table(usage, &[&a]));
        assert_eq!(declared(&mut tracker).len(), 1);
    }

    #[test]
    fn default_threshold_is_256() {
        assert_eq!(EVICTION_THRESHOLD, 256);
    }
}
