//! Slab Engine - Fixed-Size Cell Allocation
//!
//! A slab region hosts `cell_count` equally sized cells of one committed
//! class. The metadata mapping holds an `avail` bitmap (1 = free), a
//! parallel `ever_freed` bitmap, and the summary accelerators over
//! `avail`:
//!
//! ```text
//! meta: [ avail words | ever_freed words | accel level 0..2 ]
//! ```
//!
//! The hot path never searches: the region caches the bitmap word it
//! last drew from (`lin_ofs`) and that word's value (`lin_mask`), so the
//! next free cell is one `trailing_zeros` away. The accelerators are
//! consulted only when the cached word saturates.
//!
//! `ever_freed` pulls double duty: it tells a double free apart from an
//! invalid one, and it lets a zeroing allocation skip the memset for
//! cells that were never handed out (fresh OS pages are already zero).

use crate::allocator::accel::{summary_words, words_for_bits, AccelView};
use crate::heap::region::Region;

/// Verdict of the pre-free validation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlabCheck {
    Ok,
    /// Pointer outside the cell array.
    OutOfBounds,
    /// Pointer not at a cell start.
    Misaligned,
    /// Cell is free and was never allocated.
    Invalid,
    /// Cell is free and has been freed before.
    Double,
}

/// Metadata length for a slab of `cell_count` cells.
pub fn meta_len(cell_count: usize) -> usize {
    let words = words_for_bits(cell_count);
    (2 * words + summary_words(words)) * 8
}

/// Bitmap views over a slab region's metadata mapping.
///
/// # Safety
/// `reg` must be a live slab region whose meta mapping is intact.
unsafe fn views(reg: &Region) -> (AccelView, *mut u64) {
    let base = reg.meta_base as *mut u64;
    let words = words_for_bits(reg.cell_count as usize);
    let avail = AccelView::new(base, words, base.add(2 * words));
    (avail, base.add(words))
}

/// Initialize a freshly mapped slab region: every cell free, fast-path
/// cache primed on word 0.
///
/// # Safety
/// `reg.meta_base` must point at a fresh (zeroed) mapping of at least
/// [`meta_len`] bytes.
pub unsafe fn init(reg: &mut Region) {
    let (avail, _) = views(reg);
    avail.init_range(reg.cell_count as usize);
    reg.free_count = reg.cell_count;
    reg.lin_ofs = 0;
    reg.lin_mask = avail.word(0);
}

#[inline]
fn cell_ptr(reg: &Region, cell: usize) -> usize {
    if reg.cell_ord != 0 {
        reg.user_base + (cell << reg.cell_ord)
    } else {
        reg.user_base + cell * reg.cell_len as usize
    }
}

/// Cell index of `ip`, or the check verdict that rules it out.
fn cell_of(reg: &Region, ip: usize) -> Result<usize, SlabCheck> {
    if !reg.contains(ip) {
        return Err(SlabCheck::OutOfBounds);
    }
    let ofs = ip - reg.user_base;
    let cell = if reg.cell_ord != 0 {
        if ofs & ((1 << reg.cell_ord) - 1) != 0 {
            return Err(SlabCheck::Misaligned);
        }
        ofs >> reg.cell_ord
    } else {
        let len = reg.cell_len as usize;
        if ofs % len != 0 {
            return Err(SlabCheck::Misaligned);
        }
        ofs / len
    };
    if cell >= reg.cell_count as usize {
        return Err(SlabCheck::OutOfBounds);
    }
    Ok(cell)
}

/// Draw one cell. Returns the user pointer, or `None` when the region
/// is full (the caller rotates the class ring before retrying).
///
/// # Safety
/// `reg` must be a live slab region.
pub unsafe fn alloc(reg: &mut Region, clear: bool) -> Option<usize> {
    if reg.free_count == 0 {
        return None;
    }
    let (avail, ever_freed) = views(reg);

    let mut wi = reg.lin_ofs as usize;
    let mut mask = reg.lin_mask;
    if mask == 0 {
        // Cached word saturated: three trailing_zeros through the
        // accelerators find the next word with a free cell.
        wi = avail.find_first_word()?;
        mask = avail.word(wi);
        reg.lin_ofs = wi as u32;
    }

    let bit = mask.trailing_zeros() as usize;
    let cell = (wi << 6) + bit;
    mask &= !(1u64 << bit);
    if mask != 0 {
        avail.store_word(wi, mask);
    } else {
        avail.set_word(wi, 0);
    }
    reg.lin_mask = mask;
    reg.free_count -= 1;

    let ptr = cell_ptr(reg, cell);
    if clear && *ever_freed.add(wi) & (1u64 << bit) != 0 {
        std::ptr::write_bytes(ptr as *mut u8, 0, reg.cell_len as usize);
    }
    Some(ptr)
}

/// Validate a pointer for free without changing any state.
///
/// # Safety
/// `reg` must be a live slab region.
pub unsafe fn check_free(reg: &Region, ip: usize) -> SlabCheck {
    let cell = match cell_of(reg, ip) {
        Ok(c) => c,
        Err(v) => return v,
    };
    let (avail, ever_freed) = views(reg);
    if avail.test(cell) {
        // Already free: freed before means double free.
        if *ever_freed.add(cell >> 6) & (1u64 << (cell & 63)) != 0 {
            return SlabCheck::Double;
        }
        return SlabCheck::Invalid;
    }
    SlabCheck::Ok
}

/// Genuinely return a cell to the slab. Returns true when the region is
/// now fully free.
///
/// The caller must have validated the pointer ([`check_free`]) and is
/// responsible for the full-to-nonfull ring relink.
///
/// # Safety
/// `reg` must be a live slab region owning `ip`.
pub unsafe fn free_cell(reg: &mut Region, ip: usize) -> bool {
    let cell = match cell_of(reg, ip) {
        Ok(c) => c,
        Err(_) => {
            debug_assert!(false, "free_cell after failed check");
            return false;
        }
    };
    let (avail, ever_freed) = views(reg);
    let wi = cell >> 6;
    avail.set(cell);
    *ever_freed.add(wi) |= 1u64 << (cell & 63);
    if wi == reg.lin_ofs as usize {
        reg.lin_mask = avail.word(wi);
    }
    reg.free_count += 1;
    reg.free_count == reg.cell_count
}

/// Free-cell count recomputed from the bitmap; test and invariant use.
///
/// # Safety
/// `reg` must be a live slab region.
pub unsafe fn count_free(reg: &Region) -> usize {
    let (avail, _) = views(reg);
    avail.count()
}
