//! Shared fixtures for the heap test suites.
#![allow(dead_code)]

use fmalloc::stats;

/// Minimum alignment every non-tiny allocation must satisfy.
pub const DEFAULT_ALIGNMENT: usize = 8;

/// Alignment guaranteed for a request of `size` bytes (weak alignment
/// below 8 bytes).
pub fn expected_align(size: usize) -> usize {
    match size {
        0 => 1,
        1 | 2 => 2,
        3 | 4 => 4,
        _ => DEFAULT_ALIGNMENT,
    }
}

/// Allocate small blocks until allocations leave the startup bump
/// arena. Arena blocks have no owning region, so the first pointer the
/// directory resolves marks the switch; it is freed again.
///
/// The arena blocks themselves are never recycled and are intentionally
/// leaked (they also pin the heap, keeping later stats stable).
pub fn exhaust_arena() {
    for _ in 0..1024 {
        let p = fmalloc::malloc(24);
        assert!(!p.is_null(), "arena exhaustion allocation failed");
        if stats::owning_region(p).is_some() {
            unsafe { fmalloc::free(p) };
            return;
        }
    }
    panic!("startup arena never exhausted");
}

/// Assert the heap's per-region bookkeeping invariants.
pub fn assert_invariants() {
    if let Err(msg) = stats::check_invariants() {
        panic!("heap invariant violated: {}", msg);
    }
}

/// Fill a block with a recognizable pattern derived from its size.
pub unsafe fn fill_pattern(p: *mut u8, len: usize) {
    std::ptr::write_bytes(p, (len & 0xff) as u8 | 1, len);
}

/// Check the pattern written by [`fill_pattern`].
pub unsafe fn check_pattern(p: *const u8, len: usize) -> bool {
    let want = (len & 0xff) as u8 | 1;
    std::slice::from_raw_parts(p, len).iter().all(|&b| b == want)
}
