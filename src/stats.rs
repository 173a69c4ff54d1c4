//! Statistics Snapshots
//!
//! Read-only views of the calling thread's heap and the process-wide
//! mapping counter. The integration tests lean on these to assert the
//! bookkeeping invariants without reaching into internals.

use std::sync::atomic::Ordering;

use crate::heap::region::RegionKind;
use crate::heap::{self, GLOBAL_MAPCNT};

/// Snapshot of one thread's heap.
#[derive(Debug, Clone)]
pub struct HeapStats {
    pub heap_id: u32,
    /// Times this thread's heap has been speculatively deleted.
    pub delcnt: u32,
    pub buddy_regions: u32,
    pub slab_regions: u32,
    pub mmap_regions: u32,
    pub committed_classes: u16,
    pub tentative_classes: u16,
}

/// Stats for the calling thread, or `None` when it has no live heap.
pub fn thread_stats() -> Option<HeapStats> {
    heap::with_live_heap(|h| {
        let (buddy, slab, mmap) = h.region_counts();
        HeapStats {
            heap_id: h.id,
            delcnt: h.delcnt,
            buddy_regions: buddy,
            slab_regions: slab,
            mmap_regions: mmap,
            committed_classes: h.class_count(),
            tentative_classes: h.tclass_count(),
        }
    })
}

/// Live OS mappings held by regions, process-wide (user and metadata
/// mappings count separately).
pub fn global_map_count() -> u32 {
    GLOBAL_MAPCNT.load(Ordering::Relaxed)
}

/// Kind and bounds of the region owning `ptr` in the calling thread's
/// heap: `(kind, user_base, user_len)`.
pub fn owning_region(ptr: *const u8) -> Option<(RegionKind, usize, usize)> {
    heap::with_live_heap(|h| h.region_of(ptr as usize)).flatten()
}

/// Slab regions currently serving the class of `len`-byte requests.
pub fn class_regions(len: usize) -> u32 {
    heap::with_live_heap(|h| h.class_regions(len)).unwrap_or(0)
}

/// Verify the per-region bookkeeping invariants of the calling thread's
/// heap.
pub fn check_invariants() -> Result<(), String> {
    heap::with_live_heap(|h| h.check_invariants()).unwrap_or(Ok(()))
}
