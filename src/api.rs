//! C-Style Allocation API and Global-Allocator Adapter
//!
//! The drop-in heap interface: every function here is total. Bad input
//! is diagnosed through [`crate::diag`] and answered with a sentinel
//! (null, `ENOMEM`), never a panic or abort.
//!
//! Reentrancy: the entries count nesting in a process-wide relaxed
//! atomic. Past a small depth (diagnostics or a signal handler calling
//! back into the allocator) the entry hands out a thread-local degraded
//! buffer instead of allocating; the pointer stays valid until the
//! reentry unwinds and freeing it is a silent no-op.
//!
//! `malloc(0)` returns the address of one process-wide zero word; a
//! write to it is detected when it is freed.

use std::alloc::{GlobalAlloc, Layout};
use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use crate::config::{BASE_ALIGN, DEGRADED_LEN, MAX_ALLOC, NESTED_LIMIT};
use crate::diag::diag;
use crate::heap::{maybe_delete_heap, with_heap, with_heap_if_live};

/// errno value reported by [`posix_memalign`] on allocation failure.
pub const ENOMEM: i32 = 12;

struct ZeroBlock(UnsafeCell<usize>);
// A single word handed out read-only by contract; writes are user bugs
// that free() detects.
unsafe impl Sync for ZeroBlock {}

static ZERO_BLOCK: ZeroBlock = ZeroBlock(UnsafeCell::new(0));

static NESTED: AtomicU32 = AtomicU32::new(0);
static REENTRY_DIAGNOSED: AtomicBool = AtomicBool::new(false);

thread_local! {
    static DEGRADED: UnsafeCell<[u8; DEGRADED_LEN]> = const { UnsafeCell::new([0; DEGRADED_LEN]) };
}

#[inline]
fn zero_block_ptr() -> *mut u8 {
    ZERO_BLOCK.0.get() as *mut u8
}

#[inline]
fn degraded_range() -> (usize, usize) {
    let base = DEGRADED.with(|b| b.get() as usize);
    (base, base + DEGRADED_LEN)
}

fn degraded_ptr() -> *mut u8 {
    if !REENTRY_DIAGNOSED.swap(true, Ordering::Relaxed) {
        diag!("reentry depth exceeded; serving the degraded buffer");
    }
    DEGRADED.with(|b| b.get() as *mut u8)
}

/// Scope guard for the process-wide nesting counter.
struct NestGuard;

impl NestGuard {
    fn enter() -> Option<Self> {
        if NESTED.fetch_add(1, Ordering::Relaxed) > NESTED_LIMIT {
            NESTED.fetch_sub(1, Ordering::Relaxed);
            return None;
        }
        Some(Self)
    }
}

impl Drop for NestGuard {
    fn drop(&mut self) {
        NESTED.fetch_sub(1, Ordering::Relaxed);
    }
}

fn alloc_entry(len: usize, clear: bool) -> *mut u8 {
    let _guard = match NestGuard::enter() {
        Some(g) => g,
        None => return degraded_ptr(),
    };
    match with_heap(|heap| heap.alloc(len, clear)) {
        Some(Some(ptr)) => ptr as *mut u8,
        _ => std::ptr::null_mut(),
    }
}

/// Allocate `n` bytes aligned to at least [`BASE_ALIGN`] (tiny requests
/// follow weak alignment). `n == 0` returns the shared zero block.
pub fn malloc(n: usize) -> *mut u8 {
    if n == 0 {
        return zero_block_ptr();
    }
    if n > MAX_ALLOC {
        diag!("malloc({}): request above the VM cap", n);
        return std::ptr::null_mut();
    }
    alloc_entry(n, false)
}

/// Allocate a zero-filled array, refusing on `count * size` overflow.
pub fn calloc(count: usize, size: usize) -> *mut u8 {
    if count == 0 || size == 0 {
        return malloc(0);
    }
    let n = match count.checked_mul(size) {
        Some(n) if n <= MAX_ALLOC => n,
        _ => {
            diag!("calloc({}, {}): request overflows", count, size);
            return std::ptr::null_mut();
        }
    };
    alloc_entry(n, true)
}

/// Allocate `n` bytes aligned to `a`.
///
/// `a` is expected to be a power of two; a non-power is rounded up
/// rather than rejected (the C contract leaves it undefined).
pub fn aligned_alloc(a: usize, n: usize) -> *mut u8 {
    if n == 0 {
        return malloc(0);
    }
    let a = a.max(1).next_power_of_two();
    if n > MAX_ALLOC / 2 || a > MAX_ALLOC / 4 {
        diag!("aligned_alloc({}, {}): request above the VM cap", a, n);
        return std::ptr::null_mut();
    }
    let _guard = match NestGuard::enter() {
        Some(g) => g,
        None => return degraded_ptr(),
    };
    match with_heap(|heap| heap.aligned_alloc(a, n)) {
        Some(Some(ptr)) => ptr as *mut u8,
        _ => std::ptr::null_mut(),
    }
}

/// POSIX-style aligned allocation: writes the pointer through `out` and
/// returns 0 or `ENOMEM`.
pub fn posix_memalign(out: &mut *mut u8, a: usize, n: usize) -> i32 {
    let ptr = aligned_alloc(a, n);
    *out = ptr;
    if ptr.is_null() {
        ENOMEM
    } else {
        0
    }
}

fn free_entry(ip: usize, sized: usize) {
    let (dbase, dend) = degraded_range();
    if ip >= dbase && ip < dend {
        // Degraded reentry pointer: nothing was allocated.
        return;
    }
    let _guard = match NestGuard::enter() {
        Some(g) => g,
        None => return,
    };
    if with_heap_if_live(|heap| heap.free(ip, sized)).is_none() {
        diag!("free({:#x}): thread has no heap, pointer was never allocated", ip);
        return;
    }
    maybe_delete_heap();
}

/// Release a block. Tolerates null; every other invalid input is
/// diagnosed and ignored.
///
/// # Safety
/// `p` must be null, the zero block, or a pointer returned by this
/// allocator on this thread that has not been freed since; no reference
/// into the block may be used afterwards.
pub unsafe fn free(p: *mut u8) {
    if p.is_null() {
        return;
    }
    if p == zero_block_ptr() {
        if *ZERO_BLOCK.0.get() != 0 {
            diag!("free: zero-length block at {:p} was written to", p);
        }
        return;
    }
    free_entry(p as usize, 0);
}

/// [`free`] with the caller-declared block length; a length larger than
/// the recorded one is diagnosed and the recorded length is used.
///
/// # Safety
/// Same contract as [`free`].
pub unsafe fn free_sized(p: *mut u8, n: usize) {
    if p.is_null() {
        return;
    }
    if p == zero_block_ptr() {
        if *ZERO_BLOCK.0.get() != 0 {
            diag!("free_sized: zero-length block at {:p} was written to", p);
        }
        return;
    }
    free_entry(p as usize, n);
}

/// Resize a block. `p == null` allocates, `n == 0` frees and returns
/// null; otherwise the first `min(old, n)` bytes are preserved and on
/// success the old pointer is invalid.
///
/// # Safety
/// Same contract as [`free`] for `p`; on success the old pointer must
/// not be used again.
pub unsafe fn realloc(p: *mut u8, n: usize) -> *mut u8 {
    if p.is_null() {
        return malloc(n);
    }
    if n == 0 {
        free(p);
        return std::ptr::null_mut();
    }
    if p == zero_block_ptr() {
        return malloc(n);
    }
    if n > MAX_ALLOC {
        diag!("realloc({:p}, {}): request above the VM cap", p, n);
        return std::ptr::null_mut();
    }
    let (dbase, dend) = degraded_range();
    let ip = p as usize;
    if ip >= dbase && ip < dend {
        return malloc(n);
    }

    let _guard = match NestGuard::enter() {
        Some(g) => g,
        None => return degraded_ptr(),
    };
    match with_heap_if_live(|heap| heap.realloc(ip, n)) {
        Some(Some(np)) => np as *mut u8,
        Some(None) => std::ptr::null_mut(),
        None => {
            diag!("realloc({:#x}, {}): thread has no heap", ip, n);
            std::ptr::null_mut()
        }
    }
}

/// Flush the calling thread's recycle bins back to their slabs,
/// releasing any region that becomes entirely free, and speculatively
/// delete the heap if that empties it.
pub fn trim() {
    let flushed = with_heap_if_live(|heap| heap.trim());
    if flushed.is_some() {
        maybe_delete_heap();
    }
}

/// Zero-sized handle implementing [`GlobalAlloc`] on top of the C-style
/// entries, for use as `#[global_allocator]`.
///
/// ```ignore
/// #[global_allocator]
/// static ALLOC: fmalloc::Fmalloc = fmalloc::Fmalloc;
/// ```
///
/// The allocator itself never calls back into the process allocator; a
/// `log` backend that allocates will, which the reentry guard bounds.
pub struct Fmalloc;

unsafe impl GlobalAlloc for Fmalloc {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        let size = layout.size().max(1);
        if layout.align() <= BASE_ALIGN {
            malloc(size)
        } else {
            aligned_alloc(layout.align(), size)
        }
    }

    unsafe fn dealloc(&self, ptr: *mut u8, _layout: Layout) {
        free(ptr);
    }

    unsafe fn alloc_zeroed(&self, layout: Layout) -> *mut u8 {
        let size = layout.size().max(1);
        if layout.align() <= BASE_ALIGN {
            calloc(size, 1)
        } else {
            let ptr = aligned_alloc(layout.align(), size);
            if !ptr.is_null() {
                std::ptr::write_bytes(ptr, 0, size);
            }
            ptr
        }
    }

    unsafe fn realloc(&self, ptr: *mut u8, layout: Layout, new_size: usize) -> *mut u8 {
        let new_size = new_size.max(1);
        if layout.align() <= BASE_ALIGN {
            realloc(ptr, new_size)
        } else {
            // Realloc does not preserve wide alignment; move by hand.
            let np = aligned_alloc(layout.align(), new_size);
            if !np.is_null() {
                std::ptr::copy_nonoverlapping(ptr, np, layout.size().min(new_size));
                free(ptr);
            }
            np
        }
    }
}
