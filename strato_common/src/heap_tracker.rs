//! Residency tracking for separate-heap mappings.
//!
//! Separate-heap ranges are recorded here without host pages and
//! materialized on first access: the fault path looks up the region
//! containing the faulting offset and installs it into the backing buffer.
//! A cap bounds how many distinct mappings may be resident at once; when
//! it is exceeded, the coldest mapping (smallest residency tick) is
//! unmapped wholesale and its regions are coalesced back together.
//!
//! # Indices
//!
//! - `mappings`: regions by virtual offset. Regions are pairwise disjoint;
//!   the region containing an address is the nearest entry at or below it.
//! - `resident`: `(tick, vaddr)` keys of resident regions, i.e. an LRU
//!   index with the coldest region first.
//! - `resident_counts`: per-`map_id` count of resident regions. A mapping
//!   occupies one slot against the cap while this count is non-zero.
//!
//! # Locking
//!
//! `state` (the bookkeeping lock) protects all three indices. `rebuild` is
//! held exclusively across unmap and eviction, and shared across protect,
//! so a protect walk never observes a half-rebuilt index. When both are
//! taken, `rebuild` comes first; the fault path therefore drops the
//! bookkeeping lock before escalating to an eviction pass and revalidates
//! after reacquiring.

use parking_lot::{Mutex, RwLock};
use rustc_hash::FxHashMap;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use crate::config::TrackerConfig;
use crate::host_memory::{HostMemory, HostMemoryError};
use crate::perm::MemoryPermission;
use crate::stats::TrackerStats;

/// One tracked separate-heap region.
///
/// Regions sharing a `map_id` originate from a single `map` call; splits
/// preserve the id and eviction coalesces the pieces again.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SeparateHeapMap {
    /// Guest virtual offset of the region.
    pub vaddr: u64,
    /// Host backing offset the region reads from.
    pub paddr: u64,
    /// Region length in bytes.
    pub size: u64,
    /// Identity of the original map call.
    pub map_id: u64,
    /// Logical time of the last residency promotion; the LRU key.
    pub tick: u64,
    /// Permission the guest sees.
    pub perm: MemoryPermission,
    /// Whether host pages currently back the region.
    pub is_resident: bool,
}

struct TrackerState {
    mappings: BTreeMap<u64, SeparateHeapMap>,
    resident: BTreeSet<(u64, u64)>,
    resident_counts: FxHashMap<u64, usize>,
    next_map_id: u64,
    next_tick: u64,
}

/// Residency tracker over a [`HostMemory`] backing buffer.
pub struct HeapTracker {
    buffer: Arc<HostMemory>,
    config: TrackerConfig,
    stats: TrackerStats,
    /// Held exclusively across unmap/eviction, shared across protect.
    rebuild: RwLock<()>,
    /// The bookkeeping lock.
    state: Mutex<TrackerState>,
}

impl HeapTracker {
    /// Create a tracker with the default configuration.
    pub fn new(buffer: Arc<HostMemory>) -> Self {
        Self::with_config(buffer, TrackerConfig::default())
    }

    /// Create a tracker with an explicit configuration.
    pub fn with_config(buffer: Arc<HostMemory>, config: TrackerConfig) -> Self {
        config.validate().expect("invalid tracker configuration");
        Self {
            buffer,
            config,
            stats: TrackerStats::new(),
            rebuild: RwLock::new(()),
            state: Mutex::new(TrackerState {
                mappings: BTreeMap::new(),
                resident: BTreeSet::new(),
                resident_counts: FxHashMap::default(),
                next_map_id: 0,
                next_tick: 0,
            }),
        }
    }

    /// Map a guest range.
    ///
    /// Ordinary mappings are installed into the backing buffer
    /// immediately. Separate-heap mappings are only recorded; host pages
    /// arrive through the fault path, which is attempted once right away
    /// (and may evict colder mappings to make room).
    pub fn map(
        &self,
        virtual_offset: u64,
        host_offset: u64,
        length: u64,
        perm: MemoryPermission,
        separate_heap: bool,
    ) -> Result<(), HostMemoryError> {
        if !separate_heap {
            return self.buffer.map(virtual_offset, host_offset, length, perm, false);
        }

        {
            let mut state = self.state.lock();
            let map_id = state.next_map_id;
            state.next_map_id += 1;
            let tick = state.next_tick;
            state.next_tick += 1;
            state.mappings.insert(
                virtual_offset,
                SeparateHeapMap {
                    vaddr: virtual_offset,
                    paddr: host_offset,
                    size: length,
                    map_id,
                    tick,
                    perm,
                    is_resident: false,
                },
            );
        }

        self.fault_in(virtual_offset);
        Ok(())
    }

    /// Unmap a guest range.
    ///
    /// For separate heaps this erases every region inside the range
    /// (splitting at the boundaries first) and releases residency
    /// bookkeeping. The backing buffer is unmapped unconditionally either
    /// way.
    pub fn unmap(
        &self,
        virtual_offset: u64,
        size: u64,
        separate_heap: bool,
    ) -> Result<(), HostMemoryError> {
        if separate_heap {
            let _rebuild = self.rebuild.write();
            let mut state = self.state.lock();

            self.split_at(&mut state, virtual_offset);
            self.split_at(&mut state, virtual_offset + size);

            let covered: Vec<u64> = state
                .mappings
                .range(virtual_offset..virtual_offset + size)
                .map(|(&vaddr, _)| vaddr)
                .collect();
            for vaddr in covered {
                let region = state
                    .mappings
                    .remove(&vaddr)
                    .expect("region disappeared during unmap");
                if region.is_resident {
                    state.resident.remove(&(region.tick, vaddr));
                    Self::remove_reference(&mut state, region.map_id);
                }
            }
        }

        self.buffer.unmap(virtual_offset, size, false)
    }

    /// Change the guest-visible permission of a range.
    ///
    /// Covered regions have their stored permission updated. Host
    /// protection is applied to sub-ranges that are resident or that lie
    /// outside any region; non-resident regions pick the new permission up
    /// when they are next faulted in.
    pub fn protect(
        &self,
        virtual_offset: u64,
        size: u64,
        perm: MemoryPermission,
    ) -> Result<(), HostMemoryError> {
        // Hold off rebuilds while reprotecting.
        let _rebuild = self.rebuild.read();

        {
            let mut state = self.state.lock();
            self.split_at(&mut state, virtual_offset);
            self.split_at(&mut state, virtual_offset + size);
        }

        let end = virtual_offset + size;
        let mut cursor = virtual_offset;

        while cursor < end {
            let (mut next, should_protect) = {
                let mut state = self.state.lock();
                match state.mappings.range_mut(cursor..).next() {
                    // No separate-heap regions remain in the range.
                    None => (end, true),
                    // The cursor sits on a region; after the boundary
                    // splits above it cannot extend past `end`.
                    Some((&vaddr, region)) if vaddr == cursor => {
                        region.perm = perm;
                        (cursor + region.size, region.is_resident)
                    }
                    // A gap, then a region further up.
                    Some((&vaddr, _)) => (vaddr, true),
                }
            };
            next = next.min(end);

            if should_protect {
                self.buffer.protect(cursor, next - cursor, perm)?;
            }
            cursor = next;
        }

        Ok(())
    }

    /// Route a host fault into the tracker.
    ///
    /// Returns true iff `fault_address` lies in the backing buffer's
    /// virtual span and named a tracked non-resident region that is now
    /// installed. A false return means the fault belongs to someone else.
    pub fn handle_fault(&self, fault_address: *const u8) -> bool {
        if !self.buffer.is_in_virtual_range(fault_address) {
            return false;
        }
        let offset = fault_address as usize - self.buffer.virtual_base_pointer() as usize;
        self.fault_in(offset as u64)
    }

    /// Materialize the region containing `virtual_offset`.
    ///
    /// Runs evictions first if the resident-mapping cap is exceeded.
    /// Returns true iff a non-resident region was found and installed.
    pub fn fault_in(&self, virtual_offset: u64) -> bool {
        let mut state = self.state.lock();

        while state.resident_counts.len() > self.config.max_resident_maps {
            // Eviction takes the rebuild lock; release bookkeeping first to
            // keep the lock order, then revalidate after reacquiring.
            drop(state);

            let mut evicted = 0;
            while evicted < self.config.evict_batch {
                evicted += usize::from(self.evict_single());
            }

            state = self.state.lock();
        }

        let Some(vaddr) = Self::containing_region(&state, virtual_offset) else {
            self.stats.record_fault_rejected();
            return false;
        };
        let region = *state.mappings.get(&vaddr).expect("lookup returned stale key");
        if region.is_resident {
            // Already materialized; the fault is not ours to satisfy.
            self.stats.record_fault_rejected();
            return false;
        }

        self.buffer
            .map(region.vaddr, region.paddr, region.size, region.perm, false)
            .expect("failed to install separate heap pages");

        *state.resident_counts.entry(region.map_id).or_insert(0) += 1;
        let tick = state.next_tick;
        state.next_tick += 1;
        {
            let region = state.mappings.get_mut(&vaddr).expect("lookup returned stale key");
            region.is_resident = true;
            region.tick = tick;
        }
        state.resident.insert((tick, vaddr));

        self.stats.record_fault_claimed();
        true
    }

    /// Evict the coldest resident mapping.
    ///
    /// The whole mapping is taken out at once: starting from the region
    /// with the smallest tick, the sweep finds the left edge of its
    /// `map_id` run, clears residency across it, coalesces adjacent
    /// regions, and unmaps the swept interval. Returns true iff the
    /// mapping's resident count reached zero.
    fn evict_single(&self) -> bool {
        let _rebuild = self.rebuild.write();
        let mut state = self.state.lock();

        assert!(
            !state.resident.is_empty(),
            "evicting with no resident separate heap mappings"
        );

        // Coldest region, then the left edge of its mapping.
        let &(_, coldest_vaddr) = state.resident.iter().next().expect("resident set empty");
        let map_id = state
            .mappings
            .get(&coldest_vaddr)
            .expect("resident index points at missing region")
            .map_id;

        let mut begin = coldest_vaddr;
        while let Some((&prev_vaddr, prev)) = state.mappings.range(..begin).next_back() {
            if prev.map_id != map_id {
                break;
            }
            begin = prev_vaddr;
        }

        // Sweep forward across the mapping: unmark, count down, coalesce.
        let mut end = begin;
        let mut was_erased = false;
        let mut cursor = Some(begin);
        while let Some(vaddr) = cursor {
            let region = match state.mappings.get(&vaddr) {
                Some(region) if region.map_id == map_id => *region,
                _ => break,
            };

            if region.is_resident {
                state.resident.remove(&(region.tick, vaddr));
                state
                    .mappings
                    .get_mut(&vaddr)
                    .expect("region disappeared during eviction")
                    .is_resident = false;
                was_erased |= Self::remove_reference(&mut state, map_id);
            }

            end = vaddr + region.size;

            // The next region to visit, captured before the merge below
            // removes the current one.
            cursor = state
                .mappings
                .range(vaddr + 1..)
                .next()
                .map(|(&next_vaddr, _)| next_vaddr);

            self.merge_for_evict(&mut state, vaddr);
        }

        assert!(end >= begin);
        self.buffer
            .unmap(begin, end - begin, false)
            .expect("failed to unmap evicted separate heap range");

        self.stats.record_eviction();
        was_erased
    }

    /// Split the region strictly containing `offset` into two at it.
    ///
    /// Both halves inherit identity, tick, permission, and residency; a
    /// resident split adds a resident reference for the new half. No-op
    /// when `offset` is a region boundary or outside every region.
    fn split_at(&self, state: &mut TrackerState, offset: u64) {
        let Some(vaddr) = Self::containing_region(state, offset) else {
            return;
        };
        if vaddr == offset {
            return;
        }

        let left = state.mappings.get_mut(&vaddr).expect("lookup returned stale key");
        let left_size = offset - vaddr;
        let right = SeparateHeapMap {
            vaddr: offset,
            paddr: left.paddr + left_size,
            size: left.size - left_size,
            ..*left
        };
        left.size = left_size;
        state.mappings.insert(offset, right);

        if right.is_resident {
            *state
                .resident_counts
                .get_mut(&right.map_id)
                .expect("resident region with no reference count") += 1;
            state.resident.insert((right.tick, offset));
        }

        self.stats.record_split();
    }

    /// Merge the region at `vaddr` into its left neighbour if the two are
    /// virtually and physically contiguous with equal permission and
    /// identity.
    fn merge_for_evict(&self, state: &mut TrackerState, vaddr: u64) {
        let Some((&left_vaddr, left)) = state.mappings.range(..vaddr).next_back() else {
            return;
        };
        let left = *left;
        let right = *state.mappings.get(&vaddr).expect("merge target missing");

        if left.vaddr + left.size != right.vaddr {
            return;
        }
        if left.paddr + left.size != right.paddr {
            return;
        }
        if left.perm != right.perm {
            return;
        }
        if left.map_id != right.map_id {
            return;
        }

        state.mappings.remove(&vaddr);
        state
            .mappings
            .get_mut(&left_vaddr)
            .expect("merge left neighbour missing")
            .size += right.size;

        self.stats.record_merge();
    }

    /// Decrement a mapping's resident count, dropping the entry at zero.
    /// Returns true iff the entry was dropped.
    fn remove_reference(state: &mut TrackerState, map_id: u64) -> bool {
        let count = state
            .resident_counts
            .get_mut(&map_id)
            .expect("resident reference count missing");
        assert!(*count > 0, "resident reference count underflow");
        *count -= 1;
        if *count == 0 {
            state.resident_counts.remove(&map_id);
            true
        } else {
            false
        }
    }

    /// Key of the region containing `offset`, if any.
    fn containing_region(state: &TrackerState, offset: u64) -> Option<u64> {
        let (&vaddr, region) = state.mappings.range(..=offset).next_back()?;
        (offset < vaddr + region.size).then_some(vaddr)
    }

    // =========================================================================
    // Introspection
    // =========================================================================

    /// Snapshot of the region containing `offset`.
    pub fn query(&self, offset: u64) -> Option<SeparateHeapMap> {
        let state = self.state.lock();
        let vaddr = Self::containing_region(&state, offset)?;
        state.mappings.get(&vaddr).copied()
    }

    /// Snapshot of all tracked regions in address order.
    pub fn mappings(&self) -> Vec<SeparateHeapMap> {
        let state = self.state.lock();
        state.mappings.values().copied().collect()
    }

    /// Number of tracked regions.
    pub fn mapping_count(&self) -> usize {
        self.state.lock().mappings.len()
    }

    /// Number of resident regions.
    pub fn resident_region_count(&self) -> usize {
        self.state.lock().resident.len()
    }

    /// Number of distinct mappings with at least one resident region; the
    /// quantity compared against the resident cap.
    pub fn resident_mapping_count(&self) -> usize {
        self.state.lock().resident_counts.len()
    }

    /// Tracker statistics.
    pub fn stats(&self) -> &TrackerStats {
        &self.stats
    }

    /// The backing buffer this tracker installs pages into.
    pub fn buffer(&self) -> &Arc<HostMemory> {
        &self.buffer
    }
}
