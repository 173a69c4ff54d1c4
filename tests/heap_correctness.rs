//! Correctness Scenarios - Recycling, Churn, Realloc, Alignment
//!
//! End-to-end sequences with exact expected outcomes: bin hits must
//! return the same pointer, sustained churn must collapse back to a
//! single region with the mapping count restored, realloc must preserve
//! prefixes, and aligned allocations must satisfy and survive free.
//!
//! Several tests assert on the process-wide mapping counter, so the
//! whole suite is serialized.

mod common;

use common::{assert_invariants, exhaust_arena};
use fmalloc::config::BIN;
use fmalloc::stats;
use std::sync::Mutex;

static SERIAL: Mutex<()> = Mutex::new(());

/// Freed then reallocated pointer of the same class comes back from the
/// recycle bin.
#[test]
fn test_bin_hit_returns_same_pointer() {
    let _g = SERIAL.lock().unwrap();
    exhaust_arena();

    let p = fmalloc::malloc(24);
    assert!(stats::owning_region(p).is_some());
    unsafe { fmalloc::free(p) };
    let q = fmalloc::malloc(24);
    assert_eq!(q, p, "MRU bin entry not reused");
    unsafe { fmalloc::free(q) };
    assert_invariants();
}

/// 10k allocate / 10k free of one class collapses back to a single
/// slab region and restores the process mapping count.
#[test]
fn test_churn_collapses_to_single_region() {
    let _g = SERIAL.lock().unwrap();
    exhaust_arena();

    // Establish the class and its first region.
    let mut warm = Vec::new();
    for _ in 0..20 {
        warm.push(fmalloc::malloc(48));
    }
    for p in warm {
        unsafe { fmalloc::free(p) };
    }
    assert_eq!(stats::class_regions(48), 1);
    let mapcnt0 = stats::global_map_count();

    let mut ptrs = Vec::with_capacity(10_000);
    for _ in 0..10_000 {
        let p = fmalloc::malloc(48);
        assert!(!p.is_null());
        ptrs.push(p);
    }
    assert!(stats::class_regions(48) >= 1);
    for p in ptrs {
        unsafe { fmalloc::free(p) };
    }

    assert_eq!(
        stats::class_regions(48),
        1,
        "class did not collapse to a single region"
    );
    assert_eq!(
        stats::global_map_count(),
        mapcnt0,
        "mapping count not restored after churn"
    );
    assert_invariants();
}

/// After BIN + 1 sequential frees at least one pointer has genuinely
/// returned to the slab; re-allocating hands the same cell set back.
#[test]
fn test_bin_eviction_genuinely_frees() {
    let _g = SERIAL.lock().unwrap();
    exhaust_arena();

    // Commit the class.
    let p = fmalloc::malloc(80);
    unsafe { fmalloc::free(p) };

    let count = BIN + 1;
    let mut ptrs = Vec::new();
    for _ in 0..count {
        ptrs.push(fmalloc::malloc(80) as usize);
    }
    for &p in &ptrs {
        unsafe { fmalloc::free(p as *mut u8) };
    }
    assert_invariants();

    // Every original cell is reusable: the binned ones and the evicted
    // one that went back to the slab.
    let mut again: Vec<usize> = (0..count).map(|_| fmalloc::malloc(80) as usize).collect();
    let mut want = ptrs.clone();
    again.sort_unstable();
    want.sort_unstable();
    assert_eq!(again, want);
    for p in again {
        unsafe { fmalloc::free(p as *mut u8) };
    }
}

/// realloc preserves min(old, new) bytes and invalidates the old
/// pointer on move.
#[test]
fn test_realloc_preserves_prefix() {
    let _g = SERIAL.lock().unwrap();
    exhaust_arena();

    let p = fmalloc::malloc(100);
    unsafe {
        common::fill_pattern(p, 100);
        // Shrinking keeps the pointer.
        let q = fmalloc::realloc(p, 60);
        assert_eq!(q, p);

        // Growing past the class moves the block.
        let r = fmalloc::realloc(q, 3000);
        assert!(!r.is_null());
        assert!(common::check_pattern(r, 100), "realloc lost the prefix");

        // And far past the buddy block as well.
        let s = fmalloc::realloc(r, 1 << 18);
        assert!(!s.is_null());
        assert!(common::check_pattern(s, 100));
        fmalloc::free(s);
    }
    assert_invariants();
}

/// Directly mapped blocks grow through the OS remap and keep their
/// contents (32 MiB to 64 MiB).
#[test]
fn test_mmap_realloc_grows_in_place_or_moves() {
    let _g = SERIAL.lock().unwrap();
    let mapcnt0 = stats::global_map_count();

    let len = 1usize << 25;
    let p = fmalloc::malloc(len);
    assert!(!p.is_null());
    unsafe {
        std::ptr::write_bytes(p, 0xa5, len);
        let q = fmalloc::realloc(p, 1 << 26);
        assert!(!q.is_null());
        let bytes = std::slice::from_raw_parts(q, len);
        assert!(bytes.iter().all(|&b| b == 0xa5), "remap lost contents");
        // The grown block is tracked under its (possibly new) address.
        let (_, base, rlen) = stats::owning_region(q).expect("remapped block untracked");
        assert_eq!(base, q as usize);
        assert!(rlen >= 1 << 26);
        fmalloc::free(q);
    }
    assert_eq!(stats::global_map_count(), mapcnt0);
}

/// aligned_alloc round-trip across the alignment sweep: pointer
/// satisfies the alignment, free releases it without residue.
#[test]
fn test_aligned_alloc_roundtrip() {
    let _g = SERIAL.lock().unwrap();
    exhaust_arena();
    let mapcnt0 = stats::global_map_count();

    for shift in 4..=14 {
        let align = 1usize << shift;
        let p = fmalloc::aligned_alloc(align, 100);
        assert!(!p.is_null(), "aligned_alloc({}, 100) failed", align);
        assert_eq!(p as usize % align, 0, "alignment {} violated", align);
        unsafe {
            common::fill_pattern(p, 100);
            assert!(common::check_pattern(p, 100));
            fmalloc::free(p);
        }
    }
    assert_invariants();
    assert_eq!(
        stats::global_map_count(),
        mapcnt0,
        "aligned round-trips leaked mappings"
    );
}

/// posix_memalign writes the pointer and reports 0.
#[test]
fn test_posix_memalign() {
    let _g = SERIAL.lock().unwrap();
    let mut out: *mut u8 = std::ptr::null_mut();
    let rc = fmalloc::posix_memalign(&mut out, 256, 1000);
    assert_eq!(rc, 0);
    assert!(!out.is_null());
    assert_eq!(out as usize % 256, 0);
    unsafe { fmalloc::free(out) };
}

/// A double free is diagnosed, does not corrupt the heap, and the next
/// allocation still works.
#[test]
fn test_double_free_diagnosed_and_harmless() {
    let _g = SERIAL.lock().unwrap();
    exhaust_arena();

    let p = fmalloc::malloc(32);
    unsafe { fmalloc::free(p) };
    let before = fmalloc::diagnostic_count();
    unsafe { fmalloc::free(p) };
    assert!(
        fmalloc::diagnostic_count() > before,
        "second free was not diagnosed"
    );
    assert_invariants();

    let q = fmalloc::malloc(32);
    assert!(!q.is_null());
    unsafe { fmalloc::free(q) };
}

/// Free of a pointer that was never allocated is diagnosed and the
/// allocator keeps working.
#[test]
fn test_unallocated_free_diagnosed() {
    let _g = SERIAL.lock().unwrap();
    // Make sure the thread has a heap so the lookup itself runs.
    let warm = fmalloc::malloc(16);

    let before = fmalloc::diagnostic_count();
    unsafe { fmalloc::free(0x1234 as *mut u8) };
    assert!(
        fmalloc::diagnostic_count() > before,
        "unallocated free was not diagnosed"
    );

    let p = fmalloc::malloc(64);
    assert!(!p.is_null());
    unsafe {
        fmalloc::free(p);
        fmalloc::free(warm);
    }
    assert_invariants();
}
