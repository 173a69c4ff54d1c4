//! Per-Thread Heap - Top-Level Routing and Lifecycle
//!
//! Every thread owns a private heap reached through thread-local
//! storage; no operation on a heap blocks or takes a lock. The heap
//! composes the region directory, the descriptor pool, the size-class
//! tables with their slab rings and recycle bins, the per-order buddy
//! region pointers, and a small startup bump arena.
//!
//! Allocation routing:
//!
//! ```text
//! len >= MMAP_THRESHOLD ──► direct OS mapping, wrapped in a region
//! len <  MAX_CLASS_LEN  ──► bump arena, else size-class policy:
//!                           recycle bin ► slab ring ► buddy fallback
//! otherwise             ──► buddy
//! ```
//!
//! Free reverses it: resolve the region in the directory and dispatch
//! on its kind. A heap that becomes fully empty is speculatively
//! deleted; the thread-local slot keeps a deletion counter so a
//! create/destroy oscillation settles after a few rounds.
//!
//! Process-wide shared state is exactly three relaxed atomics: the heap
//! id counter, the live OS mapping count, and the bump index into the
//! static pool holding the first heap descriptors. None of them publish
//! pointers, so relaxed ordering suffices.

pub mod directory;
pub mod region;

use std::cell::{Cell, UnsafeCell};
use std::mem::MaybeUninit;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU32, Ordering};

use crate::allocator::bin::{BinEntry, RecycleBin};
use crate::allocator::sizeclass::{self, ClassDecision, ClassTable};
use crate::allocator::{buddy, slab};
use crate::config::{
    BASE_ALIGN, BUDDY_ORDERS, HEAP_DEL_THRESHOLD, HEAP_POOL, INI_MEM, MAP_SHIFTS, MAX_CLASS,
    MAX_CLASS_LEN, MAX_VM, MIN_ORDER, MIN_REGION, MMAP_THRESHOLD, PAGE,
};
use crate::diag::diag;
use crate::error::{AllocError, Result};
use crate::os;
use crate::util::align::{align_up, is_aligned, order_of};
use directory::Directory;
use region::{RegionId, RegionKind, RegionPool, NO_REGION};

/// Monotonic heap ids, process-wide.
static HEAP_GID: AtomicU32 = AtomicU32::new(0);

/// Live OS mappings held by regions (user and metadata mappings count
/// separately). Read by [`new_region_order`] to grow fresh regions with
/// program footprint.
pub(crate) static GLOBAL_MAPCNT: AtomicU32 = AtomicU32::new(1);

/// Bump index into the static pool placing the first heap descriptors.
static HEAPMEM_POS: AtomicU32 = AtomicU32::new(0);

struct HeapMem {
    slots: UnsafeCell<[MaybeUninit<Heap>; HEAP_POOL]>,
}

// The pool is only handed out once per slot via the atomic bump index.
unsafe impl Sync for HeapMem {}

static HEAP_MEM: HeapMem = HeapMem {
    slots: UnsafeCell::new([const { MaybeUninit::uninit() }; HEAP_POOL]),
};

/// Thread-local heap slot. `Deleted` carries the deletion count forward
/// so recreation after speculative deletion can be throttled.
#[derive(Clone, Copy)]
enum Slot {
    Empty,
    Deleted(u32),
    Live(NonNull<Heap>),
}

thread_local! {
    static HEAP_SLOT: Cell<Slot> = const { Cell::new(Slot::Empty) };
}

/// Order for a freshly created region: grows logarithmically with the
/// number of live OS mappings, bounded by the largest buddy order.
pub(crate) fn new_region_order() -> u32 {
    let mapcnt = GLOBAL_MAPCNT.load(Ordering::Relaxed);
    let width = (u32::BITS - mapcnt.leading_zeros()) as usize;
    let ord = MIN_REGION + MAP_SHIFTS[width.min(31)];
    ord.min(crate::config::MAX_ORDER)
}

/// Per-thread heap root.
pub struct Heap {
    pub id: u32,
    /// Times this thread's heap has been speculatively deleted.
    pub delcnt: u32,
    /// Placed in the static startup pool (never deleted).
    ini_heap: bool,
    /// Length of the dedicated OS mapping holding this heap, 0 when in
    /// the static pool.
    base_len: usize,

    regions: RegionPool,
    dir: Directory,
    classes: ClassTable,
    /// Head of the intra-class slab ring per committed class.
    clasreg: [RegionId; MAX_CLASS],
    bins: [RecycleBin; MAX_CLASS],
    /// Cache: a buddy region that recently had free blocks at an order.
    buddies: [RegionId; BUDDY_ORDERS],
    /// Most recently created mmap region, for the aligned path.
    last_mmap: RegionId,

    /// Startup bump arena; blocks carry a 4-byte length header and are
    /// never reused. Backed by words so headers stay aligned.
    ini_mem: [u64; INI_MEM / 8],
    ini_pos: u32,
    ini_live: u32,
}

impl Heap {
    fn new(id: u32, delcnt: u32, ini_heap: bool, base_len: usize) -> Self {
        Self {
            id,
            delcnt,
            ini_heap,
            base_len,
            regions: RegionPool::new(),
            dir: Directory::new(),
            classes: ClassTable::new(),
            clasreg: [NO_REGION; MAX_CLASS],
            bins: [RecycleBin::new(); MAX_CLASS],
            buddies: [NO_REGION; BUDDY_ORDERS],
            last_mmap: NO_REGION,
            ini_mem: [0; INI_MEM / 8],
            ini_pos: 0,
            ini_live: 0,
        }
    }

    /// Whether nothing is live: no regions and no outstanding arena
    /// blocks. Gates speculative deletion.
    pub fn is_empty(&self) -> bool {
        self.regions.live() == 0 && self.ini_live == 0
    }

    // ------------------------------------------------------------------
    // OS memory with trim-and-retry
    // ------------------------------------------------------------------

    /// Map fresh pages; on failure flush the recycle bins once and
    /// retry before reporting out of memory.
    fn os_mem(&mut self, len: usize, what: &str) -> Option<NonNull<u8>> {
        if let Some(p) = os::map(len) {
            return Some(p);
        }
        self.trim();
        match os::map(len) {
            Some(p) => Some(p),
            None => {
                diag!("heap {}: out of memory mapping {} bytes for {}", self.id, len, what);
                None
            }
        }
    }

    // ------------------------------------------------------------------
    // Region creation and deletion
    // ------------------------------------------------------------------

    /// Map and register a region of `user_len` user bytes plus
    /// `meta_len` metadata bytes (0 for mmap regions).
    fn new_region(&mut self, user_len: usize, meta_len: usize, kind: RegionKind) -> Result<RegionId> {
        let user = self
            .os_mem(user_len, "region user data")
            .ok_or(AllocError::OutOfMemory { requested: user_len })?;

        let rid = match self.regions.alloc() {
            Ok(rid) => rid,
            Err(e) => {
                unsafe { os::unmap(user, user_len) };
                return Err(e);
            }
        };

        let mut mapcnt = 1;
        let mut meta_base = 0usize;
        if meta_len > 0 {
            match self.os_mem(meta_len, "region metadata") {
                Some(m) => {
                    meta_base = m.as_ptr() as usize;
                    mapcnt += 1;
                }
                None => {
                    unsafe { os::unmap(user, user_len) };
                    self.regions.release(rid);
                    return Err(AllocError::OutOfMemory { requested: meta_len });
                }
            }
        }

        let user_base = user.as_ptr() as usize;
        {
            let reg = self.regions.get_mut(rid);
            reg.kind = kind;
            reg.user_base = user_base;
            reg.user_len = user_len;
            reg.meta_base = meta_base;
            reg.meta_len = meta_len;
            reg.order = if user_len.is_power_of_two() {
                user_len.trailing_zeros()
            } else {
                0
            };
        }

        if let Err(e) = self.dir.insert(rid, user_base, user_len) {
            self.dir.erase(user_base, user_len);
            unsafe {
                os::unmap(user, user_len);
                if let Some(m) = NonNull::new(meta_base as *mut u8) {
                    os::unmap(m, meta_len);
                }
            }
            self.regions.release(rid);
            return Err(e);
        }

        GLOBAL_MAPCNT.fetch_add(mapcnt, Ordering::Relaxed);
        log::debug!(
            "heap {} new region {} kind {:?} base {:#x} len {} meta {}",
            self.id,
            self.regions.get(rid).id,
            kind,
            user_base,
            user_len,
            meta_len
        );
        Ok(rid)
    }

    /// Unregister a region, release its mappings, and recycle the
    /// descriptor.
    fn del_region(&mut self, rid: RegionId) {
        let (kind, clas, user_base, user_len, meta_base, meta_len, id) = {
            let reg = self.regions.get(rid);
            (
                reg.kind,
                reg.clas,
                reg.user_base,
                reg.user_len,
                reg.meta_base,
                reg.meta_len,
                reg.id,
            )
        };
        log::debug!("heap {} delete region {} kind {:?}", self.id, id, kind);

        if kind == RegionKind::Slab {
            self.ring_unlink(clas, rid);
            // Binned cells keep a region from ever becoming fully
            // free; no stale entry may survive the descriptor's reuse.
            self.bins[clas as usize].purge_region(rid);
        }
        for slot in self.buddies.iter_mut() {
            if *slot == rid {
                *slot = NO_REGION;
            }
        }
        if self.last_mmap == rid {
            self.last_mmap = NO_REGION;
        }

        self.dir.erase(user_base, user_len);
        let mut mapcnt = 1;
        unsafe {
            os::unmap(NonNull::new_unchecked(user_base as *mut u8), user_len);
            if let Some(m) = NonNull::new(meta_base as *mut u8) {
                os::unmap(m, meta_len);
                mapcnt += 1;
            }
        }
        GLOBAL_MAPCNT.fetch_sub(mapcnt, Ordering::Relaxed);
        self.regions.release(rid);
    }

    // ------------------------------------------------------------------
    // Slab rings
    // ------------------------------------------------------------------

    fn ring_insert_head(&mut self, clas: u16, rid: RegionId) {
        let head = self.clasreg[clas as usize];
        if head == NO_REGION {
            let reg = self.regions.get_mut(rid);
            reg.next = rid;
            reg.prev = rid;
        } else {
            let prev = self.regions.get(head).prev;
            {
                let reg = self.regions.get_mut(rid);
                reg.next = head;
                reg.prev = prev;
            }
            self.regions.get_mut(prev).next = rid;
            self.regions.get_mut(head).prev = rid;
        }
        self.clasreg[clas as usize] = rid;
    }

    fn ring_unlink(&mut self, clas: u16, rid: RegionId) {
        let (next, prev) = {
            let reg = self.regions.get(rid);
            (reg.next, reg.prev)
        };
        if next == rid {
            self.clasreg[clas as usize] = NO_REGION;
            return;
        }
        self.regions.get_mut(prev).next = next;
        self.regions.get_mut(next).prev = prev;
        if self.clasreg[clas as usize] == rid {
            self.clasreg[clas as usize] = next;
        }
    }

    /// Create the first or an additional slab region for a class.
    fn new_slab(&mut self, clas: u16) -> Option<RegionId> {
        let cell_len = self.classes.class_len(clas);
        let order = new_region_order();
        let user_len = 1usize << order;
        let cell_count = user_len / cell_len;
        let meta_len = slab::meta_len(cell_count);

        let rid = match self.new_region(user_len, meta_len, RegionKind::Slab) {
            Ok(rid) => rid,
            Err(e) => {
                log::warn!("heap {}: slab region for class {} failed: {}", self.id, clas, e);
                return None;
            }
        };
        {
            let reg = self.regions.get_mut(rid);
            reg.clas = clas;
            reg.cell_len = cell_len as u32;
            reg.cell_ord = if cell_len.is_power_of_two() {
                cell_len.trailing_zeros()
            } else {
                0
            };
            reg.cell_count = cell_count as u32;
            unsafe { slab::init(reg) };
        }
        self.ring_insert_head(clas, rid);
        Some(rid)
    }

    /// Serve one cell from a committed class's slab ring.
    fn slab_alloc(&mut self, clas: u16, clear: bool) -> Option<usize> {
        let mut head = self.clasreg[clas as usize];
        if head == NO_REGION || self.regions.get(head).free_count == 0 {
            head = self.new_slab(clas)?;
        }
        let ptr = {
            let reg = self.regions.get_mut(head);
            unsafe { slab::alloc(reg, clear) }?
        };
        if self.regions.get(head).free_count == 0 {
            // Head filled up: rotate it out so the next allocation
            // starts on a region with room.
            self.clasreg[clas as usize] = self.regions.get(head).next;
        }
        Some(ptr)
    }

    /// Genuinely return a cell to its slab, relinking the ring on a
    /// full-to-nonfull transition and destroying the region when it
    /// becomes entirely free.
    fn slab_free_cell(&mut self, rid: RegionId, ip: usize) {
        let (was_full, fully, clas) = {
            let reg = self.regions.get_mut(rid);
            let was_full = reg.free_count == 0;
            let fully = unsafe { slab::free_cell(reg, ip) };
            (was_full, fully, reg.clas)
        };
        if fully {
            self.del_region(rid);
            return;
        }
        if was_full {
            // Future allocations prefer the region that just gained room.
            self.clasreg[clas as usize] = rid;
        }
    }

    // ------------------------------------------------------------------
    // Buddy routing
    // ------------------------------------------------------------------

    /// Serve `len` bytes from a buddy region, creating one as needed.
    /// When `want_anchor` is set the chosen region must have a free
    /// alignment-anchor slot.
    fn buddy_alloc(&mut self, len: usize, clear: bool, want_anchor: bool) -> Option<(usize, RegionId)> {
        let len = len.max(1usize << MIN_ORDER);
        let ord = order_of(len, MIN_ORDER);

        let rid = self
            .buddy_candidate(ord, want_anchor)
            .or_else(|| self.new_buddy(ord))?;

        let ptr = {
            let reg = self.regions.get_mut(rid);
            unsafe { buddy::alloc(reg, len, ord, clear) }?
        };
        self.buddies[(ord - MIN_ORDER) as usize] = rid;
        Some((ptr, rid))
    }

    /// A live buddy region able to serve order `ord`: the per-order
    /// cache first, then a scan of the live descriptors.
    fn buddy_candidate(&self, ord: u32, want_anchor: bool) -> Option<RegionId> {
        let usable = |rid: RegionId| {
            let reg = self.regions.get(rid);
            reg.kind == RegionKind::Buddy
                && reg.order >= ord
                && buddy::can_alloc(reg, ord)
                && (!want_anchor || reg.align_anchor == 0)
        };
        for k in (ord - MIN_ORDER) as usize..BUDDY_ORDERS {
            let rid = self.buddies[k];
            if rid != NO_REGION && usable(rid) {
                return Some(rid);
            }
        }
        self.regions.iter_live().find(|&rid| usable(rid))
    }

    fn new_buddy(&mut self, ord: u32) -> Option<RegionId> {
        let order = new_region_order().max(ord).min(crate::config::MAX_ORDER);
        let rid = match self.new_region(1usize << order, buddy::meta_len(order), RegionKind::Buddy) {
            Ok(rid) => rid,
            Err(e) => {
                log::warn!("heap {}: buddy region order {} failed: {}", self.id, order, e);
                return None;
            }
        };
        unsafe { buddy::init(self.regions.get_mut(rid)) };
        Some(rid)
    }

    // ------------------------------------------------------------------
    // Large (direct-map) path
    // ------------------------------------------------------------------

    fn mmap_alloc(&mut self, len: usize) -> Option<usize> {
        let n = os::page_align(len);
        let rid = match self.new_region(n, 0, RegionKind::Mmap) {
            Ok(rid) => rid,
            Err(e) => {
                log::warn!("heap {}: mmap region of {} bytes failed: {}", self.id, n, e);
                return None;
            }
        };
        self.last_mmap = rid;
        // Fresh mappings are zero-filled by the OS; a clearing
        // allocation has nothing left to do.
        Some(self.regions.get(rid).user_base)
    }

    // ------------------------------------------------------------------
    // Entry: alloc
    // ------------------------------------------------------------------

    /// Main allocation entry. `len` is nonzero and below the request
    /// cap.
    pub fn alloc(&mut self, len: usize, clear: bool) -> Option<usize> {
        if len >= MMAP_THRESHOLD {
            return self.mmap_alloc(len);
        }

        if len < MAX_CLASS_LEN {
            // Startup bump arena: fast path for the first startup
            // traffic, blocks carry a length header and never recycle.
            let pos = self.ini_pos as usize;
            if pos + len + 2 * BASE_ALIGN <= INI_MEM {
                let base = self.ini_mem.as_ptr() as usize;
                unsafe { *((base + pos) as *mut u32) = len as u32 };
                let ptr = base + pos + BASE_ALIGN;
                self.ini_pos = (pos + align_up(len, BASE_ALIGN) + BASE_ALIGN) as u32;
                self.ini_live += 1;
                // Arena memory is zero until handed out.
                return Some(ptr);
            }

            let alen = sizeclass::rounded_len(len);
            match self.classes.classify(alen) {
                ClassDecision::Committed(clas) => {
                    if let Some(entry) = self.bins[clas as usize].pop() {
                        if clear {
                            unsafe { std::ptr::write_bytes(entry.ptr as *mut u8, 0, len) };
                        }
                        return Some(entry.ptr);
                    }
                    if let Some(ptr) = self.slab_alloc(clas, clear) {
                        return Some(ptr);
                    }
                    // Slab could not grow; fall through to buddy.
                }
                ClassDecision::Promote(clas) => {
                    // The promoting request itself is still served by
                    // buddy; the new slab serves from the next one.
                    let _ = self.new_slab(clas);
                }
                ClassDecision::Fallback => {}
            }
        }

        self.buddy_alloc(len, clear, false).map(|(ptr, _)| ptr)
    }

    // ------------------------------------------------------------------
    // Entry: aligned alloc
    // ------------------------------------------------------------------

    /// Aligned allocation. `align` is a power of two.
    pub fn aligned_alloc(&mut self, align: usize, len: usize) -> Option<usize> {
        if align <= BASE_ALIGN {
            // Every path already guarantees the base alignment. Wider
            // natural alignments cannot delegate: the startup arena
            // only aligns to BASE_ALIGN.
            return self.alloc(len, false);
        }

        let mut alen = len.max(align);
        if align > PAGE {
            // Over-allocate so an aligned pointer exists inside the
            // block regardless of where the mapping lands.
            alen = len + align;
        }

        if alen >= MMAP_THRESHOLD {
            let ptr = self.mmap_alloc(alen)?;
            let aligned = align_up(ptr, align);
            if aligned != ptr {
                let rid = self.last_mmap;
                self.regions.get_mut(rid).align_anchor = aligned;
            }
            return Some(aligned);
        }

        let want_anchor = align > PAGE;
        let (ptr, rid) = self.buddy_alloc(alen, false, want_anchor)?;
        let aligned = align_up(ptr, align);
        if aligned != ptr {
            let reg = self.regions.get_mut(rid);
            reg.align_anchor = aligned;
            reg.anchor_base = ptr;
        }
        Some(aligned)
    }

    // ------------------------------------------------------------------
    // Entry: free
    // ------------------------------------------------------------------

    /// Free entry. `sized` carries the caller-declared length from
    /// `free_sized`, 0 when unknown.
    pub fn free(&mut self, ip: usize, sized: usize) {
        let arena = self.ini_mem.as_ptr() as usize;
        if ip >= arena + BASE_ALIGN && ip < arena + INI_MEM {
            let hdr = (ip - 4) as *mut u32;
            unsafe {
                if *hdr == 0 {
                    diag!("free({:#x}): double free of startup arena block", ip);
                } else {
                    *hdr = 0;
                    self.ini_live -= 1;
                }
            }
            return;
        }

        if ip >= 1usize << MAX_VM {
            diag!("free({:#x}): pointer outside {}-bit VM space", ip, MAX_VM);
            return;
        }
        let rid = match self.dir.lookup(ip) {
            Some(rid) => rid,
            None => {
                diag!("free({:#x}): unallocated pointer", ip);
                return;
            }
        };

        match self.regions.get(rid).kind {
            RegionKind::Slab => self.free_slab(rid, ip, sized),
            RegionKind::Buddy => self.free_buddy(rid, ip, sized),
            RegionKind::Mmap => self.free_mmap(rid, ip, sized),
            RegionKind::Nil => {
                diag!("free({:#x}): pointer in dead region", ip);
            }
        }
    }

    fn free_slab(&mut self, rid: RegionId, ip: usize, sized: usize) {
        let clas = {
            let reg = self.regions.get(rid);
            match unsafe { slab::check_free(reg, ip) } {
                slab::SlabCheck::Ok => {}
                slab::SlabCheck::Double => {
                    diag!("free({:#x}): double free of {}-byte block", ip, reg.cell_len);
                    return;
                }
                slab::SlabCheck::OutOfBounds | slab::SlabCheck::Misaligned | slab::SlabCheck::Invalid => {
                    diag!("free({:#x}): invalid free in slab region {}", ip, reg.id);
                    return;
                }
            }
            if sized != 0 && sized > reg.cell_len as usize {
                diag!(
                    "free_sized({:#x}, {}): block length is {}",
                    ip,
                    sized,
                    reg.cell_len
                );
            }
            reg.clas
        };

        // Fresh frees park in the class recycle bin: MRU reuse,
        // duplicate detection, and amortized slab updates.
        if self.bins[clas as usize].contains(ip) {
            diag!("free({:#x}): pointer is already in the recycle bin", ip);
            return;
        }
        if let Some(evicted) = self.bins[clas as usize].push(BinEntry { ptr: ip, reg: rid }) {
            self.slab_free_cell(evicted.reg, evicted.ptr);
        }
    }

    fn free_buddy(&mut self, rid: RegionId, ip: usize, sized: usize) {
        let mut ip = ip;
        {
            let reg = self.regions.get_mut(rid);
            if reg.align_anchor == ip {
                // Over-aligned block: resolve the anchor back to the
                // carved block start.
                ip = reg.anchor_base;
                reg.align_anchor = 0;
                reg.anchor_base = 0;
            }
        }
        if sized != 0 {
            if let Some(blen) = unsafe { buddy::block_len(self.regions.get(rid), ip) } {
                if sized > blen {
                    diag!("free_sized({:#x}, {}): block length is {}", ip, sized, blen);
                }
            }
        }
        let verdict = {
            let reg = self.regions.get_mut(rid);
            unsafe { buddy::free(reg, ip) }
        };
        match verdict {
            buddy::BuddyFree::Ok => {}
            buddy::BuddyFree::FullyFree => self.del_region(rid),
            buddy::BuddyFree::Double => {
                diag!("free({:#x}): double free of buddy block", ip);
            }
            buddy::BuddyFree::Invalid => {
                diag!("free({:#x}): invalid free in buddy region", ip);
            }
        }
    }

    fn free_mmap(&mut self, rid: RegionId, ip: usize, sized: usize) {
        let (user_base, user_len, anchor) = {
            let reg = self.regions.get(rid);
            (reg.user_base, reg.user_len, reg.align_anchor)
        };
        if !is_aligned(ip, PAGE) {
            diag!("free({:#x}): misaligned pointer into mapped block", ip);
            return;
        }
        if user_len < MMAP_THRESHOLD {
            diag!("free({:#x}): block of {} bytes was not directly mapped", ip, user_len);
            return;
        }
        if anchor != 0 {
            if ip != anchor {
                diag!(
                    "free({:#x}): aligned mapped block was returned at {:#x}",
                    ip,
                    anchor
                );
                return;
            }
        } else if ip != user_base {
            diag!(
                "free({:#x}): interior pointer into mapped block at {:#x}",
                ip,
                user_base
            );
            return;
        }
        if sized != 0 && sized > user_len {
            diag!("free_sized({:#x}, {}): mapped length is {}", ip, sized, user_len);
        }
        self.del_region(rid);
    }

    // ------------------------------------------------------------------
    // Entry: realloc
    // ------------------------------------------------------------------

    /// Grow or shrink. Returns the new pointer, or `None` after a
    /// diagnostic (the original block is untouched unless the move
    /// succeeded).
    pub fn realloc(&mut self, ip: usize, new_len: usize) -> Option<usize> {
        let arena = self.ini_mem.as_ptr() as usize;
        if ip >= arena + BASE_ALIGN && ip < arena + INI_MEM {
            let hdr = (ip - 4) as *mut u32;
            let old = unsafe { *hdr } as usize;
            if old == 0 {
                diag!("realloc({:#x}): startup arena block already freed", ip);
                return None;
            }
            if new_len <= old {
                return Some(ip);
            }
            let np = self.alloc(new_len, false)?;
            unsafe {
                std::ptr::copy_nonoverlapping(ip as *const u8, np as *mut u8, old);
                *hdr = 0;
            }
            self.ini_live -= 1;
            return Some(np);
        }

        let rid = match self.dir.lookup(ip) {
            Some(rid) => rid,
            None => {
                diag!("realloc({:#x}, {}): pointer was not allocated", ip, new_len);
                return None;
            }
        };

        match self.regions.get(rid).kind {
            RegionKind::Slab => {
                let (clas, old) = {
                    let reg = self.regions.get(rid);
                    (reg.clas, reg.cell_len as usize)
                };
                if self.bins[clas as usize].contains(ip) {
                    diag!("realloc({:#x}): pointer is in the recycle bin", ip);
                    return None;
                }
                if new_len <= old {
                    return Some(ip);
                }
                self.move_block(ip, old, new_len)
            }
            RegionKind::Buddy => {
                let (anchor, anchor_base) = {
                    let reg = self.regions.get(rid);
                    (reg.align_anchor, reg.anchor_base)
                };
                let usable = if anchor == ip {
                    let blen = unsafe { buddy::block_len(self.regions.get(rid), anchor_base) }?;
                    anchor_base + blen - ip
                } else {
                    match unsafe { buddy::block_len(self.regions.get(rid), ip) } {
                        Some(blen) => blen,
                        None => {
                            diag!("realloc({:#x}, {}): invalid buddy pointer", ip, new_len);
                            return None;
                        }
                    }
                };
                if new_len <= usable {
                    return Some(ip);
                }
                self.move_block(ip, usable, new_len)
            }
            RegionKind::Mmap => self.mmap_realloc(rid, ip, new_len),
            RegionKind::Nil => {
                diag!("realloc({:#x}): pointer in dead region", ip);
                None
            }
        }
    }

    fn move_block(&mut self, ip: usize, old_len: usize, new_len: usize) -> Option<usize> {
        let np = self.alloc(new_len, false)?;
        unsafe {
            std::ptr::copy_nonoverlapping(ip as *const u8, np as *mut u8, old_len.min(new_len));
        }
        self.free(ip, 0);
        Some(np)
    }

    fn mmap_realloc(&mut self, rid: RegionId, ip: usize, new_len: usize) -> Option<usize> {
        if !is_aligned(ip, PAGE) {
            diag!("realloc({:#x}): misaligned pointer into mapped block", ip);
            return None;
        }
        let (user_base, old_len) = {
            let reg = self.regions.get(rid);
            (reg.user_base, reg.user_len)
        };
        if ip != user_base {
            diag!("realloc({:#x}): interior pointer into mapped block", ip);
            return None;
        }
        if new_len <= old_len {
            return Some(ip);
        }

        let n = os::page_align(new_len);
        let np = unsafe {
            os::remap(NonNull::new_unchecked(user_base as *mut u8), old_len, n)
        };
        let np = match np {
            Some(np) => np.as_ptr() as usize,
            None => {
                // The old mapping is intact; report out of memory.
                diag!("realloc({:#x}, {}): out of memory remapping", ip, new_len);
                return None;
            }
        };

        self.dir.erase(user_base, old_len);
        {
            let reg = self.regions.get_mut(rid);
            reg.user_base = np;
            reg.user_len = n;
        }
        if let Err(e) = self.dir.insert(rid, np, n) {
            // The block stays usable but untracked; freeing it later
            // will be diagnosed. Nothing better can be done here.
            log::error!("heap {}: directory insert after remap failed: {}", self.id, e);
        }
        Some(np)
    }

    // ------------------------------------------------------------------
    // Trim
    // ------------------------------------------------------------------

    /// Flush every recycle bin to its slab, releasing regions that
    /// become entirely free. Called on OOM retry and from the public
    /// trim entry.
    pub fn trim(&mut self) {
        for clas in 0..self.classes.class_count() {
            while let Some(entry) = self.bins[clas as usize].pop() {
                self.slab_free_cell(entry.reg, entry.ptr);
            }
        }
    }

    // ------------------------------------------------------------------
    // Introspection (stats and tests)
    // ------------------------------------------------------------------

    /// Live region count by kind: (buddy, slab, mmap).
    pub fn region_counts(&self) -> (u32, u32, u32) {
        let mut counts = (0, 0, 0);
        for rid in self.regions.iter_live() {
            match self.regions.get(rid).kind {
                RegionKind::Buddy => counts.0 += 1,
                RegionKind::Slab => counts.1 += 1,
                RegionKind::Mmap => counts.2 += 1,
                RegionKind::Nil => {}
            }
        }
        counts
    }

    pub fn class_count(&self) -> u16 {
        self.classes.class_count()
    }

    pub fn tclass_count(&self) -> u16 {
        self.classes.tclass_count()
    }

    /// Regions currently on the slab ring of the class serving `len`.
    pub fn class_regions(&self, len: usize) -> u32 {
        let alen = sizeclass::rounded_len(len);
        let mut count = 0;
        for rid in self.regions.iter_live() {
            let reg = self.regions.get(rid);
            if reg.kind == RegionKind::Slab && reg.cell_len as usize == alen {
                count += 1;
            }
        }
        count
    }

    /// Kind and bounds of the region owning `ip`, if any.
    pub fn region_of(&self, ip: usize) -> Option<(RegionKind, usize, usize)> {
        let rid = self.dir.lookup(ip)?;
        let reg = self.regions.get(rid);
        if !reg.contains(ip) {
            return None;
        }
        Some((reg.kind, reg.user_base, reg.user_len))
    }

    /// Verify the per-region bookkeeping invariants; test use.
    pub fn check_invariants(&self) -> std::result::Result<(), String> {
        for rid in self.regions.iter_live() {
            let reg = self.regions.get(rid);
            match reg.kind {
                RegionKind::Slab => {
                    let free = unsafe { slab::count_free(reg) };
                    if free != reg.free_count as usize {
                        return Err(format!(
                            "slab region {}: free_count {} != bitmap {}",
                            reg.id, reg.free_count, free
                        ));
                    }
                }
                RegionKind::Buddy => {
                    for ord in MIN_ORDER..=reg.order {
                        let n = unsafe { buddy::count_avail(reg, ord) };
                        if n != reg.order_sums[(ord - MIN_ORDER) as usize] as usize {
                            return Err(format!(
                                "buddy region {}: order {} sum {} != bitmap {}",
                                reg.id,
                                ord,
                                reg.order_sums[(ord - MIN_ORDER) as usize],
                                n
                            ));
                        }
                    }
                }
                _ => {}
            }
        }
        Ok(())
    }
}

// ----------------------------------------------------------------------
// Lifecycle
// ----------------------------------------------------------------------

fn create_heap(delcnt: u32) -> Option<NonNull<Heap>> {
    let id = HEAP_GID.fetch_add(1, Ordering::Relaxed);
    let pos = HEAPMEM_POS.fetch_add(1, Ordering::Relaxed);

    let (ptr, ini_heap, base_len) = if (pos as usize) < HEAP_POOL {
        let slots = HEAP_MEM.slots.get() as *mut MaybeUninit<Heap>;
        (unsafe { slots.add(pos as usize) as *mut Heap }, true, 0)
    } else {
        let len = os::page_align(std::mem::size_of::<Heap>());
        let mem = os::map(len)?;
        (mem.as_ptr() as *mut Heap, false, len)
    };

    unsafe { ptr.write(Heap::new(id, delcnt, ini_heap, base_len)) };
    log::debug!("new heap {} (delcnt {}, static pool: {})", id, delcnt, ini_heap);
    NonNull::new(ptr)
}

/// Tear a heap down: release the pools and the heap mapping itself.
///
/// # Safety
/// `hb` must be a live heap not in the static pool, with no outstanding
/// user pointers.
unsafe fn destroy_heap(hb: NonNull<Heap>) {
    let heap = &mut *hb.as_ptr();
    log::debug!("delete heap {} (delcnt {})", heap.id, heap.delcnt);
    heap.dir.teardown();
    heap.regions.teardown();
    let base_len = heap.base_len;
    debug_assert!(!heap.ini_heap);
    os::unmap(hb.cast(), base_len);
}

/// Run `f` on the calling thread's heap, creating it on first use (or
/// recreating it after a speculative deletion, carrying the deletion
/// count forward). `None` when a heap cannot be created.
pub(crate) fn with_heap<R>(f: impl FnOnce(&mut Heap) -> R) -> Option<R> {
    HEAP_SLOT.with(|slot| {
        let hb = match slot.get() {
            Slot::Live(hb) => hb,
            Slot::Empty => create_heap(0)?,
            Slot::Deleted(delcnt) => create_heap(delcnt)?,
        };
        slot.set(Slot::Live(hb));
        Some(f(unsafe { &mut *hb.as_ptr() }))
    })
}

/// Speculatively delete the calling thread's heap if it is fully empty.
/// Heaps in the static startup pool are retained, as is any heap that
/// has already cycled more than [`HEAP_DEL_THRESHOLD`] times.
pub(crate) fn maybe_delete_heap() {
    HEAP_SLOT.with(|slot| {
        if let Slot::Live(hb) = slot.get() {
            let heap = unsafe { &mut *hb.as_ptr() };
            if !heap.is_empty() || heap.ini_heap || heap.delcnt > HEAP_DEL_THRESHOLD {
                return;
            }
            let delcnt = heap.delcnt + 1;
            unsafe { destroy_heap(hb) };
            slot.set(Slot::Deleted(delcnt));
        }
    });
}

/// Read-only view of the calling thread's heap, if one is live.
pub(crate) fn with_live_heap<R>(f: impl FnOnce(&Heap) -> R) -> Option<R> {
    HEAP_SLOT.with(|slot| match slot.get() {
        Slot::Live(hb) => Some(f(unsafe { &*hb.as_ptr() })),
        _ => None,
    })
}

/// Run `f` on the calling thread's heap only if one is live; free and
/// realloc of a pointer on a heap-less thread is a diagnosable error,
/// not a reason to create a heap.
pub(crate) fn with_heap_if_live<R>(f: impl FnOnce(&mut Heap) -> R) -> Option<R> {
    HEAP_SLOT.with(|slot| match slot.get() {
        Slot::Live(hb) => Some(f(unsafe { &mut *hb.as_ptr() })),
        _ => None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_region_order_floor() {
        // With a near-idle process the order is the minimum region.
        assert!(new_region_order() >= MIN_REGION);
        assert!(new_region_order() <= crate::config::MAX_ORDER);
    }

    #[test]
    fn test_heap_alloc_routes_by_size() {
        let mut heap = Box::new(Heap::new(9000, 0, true, 0));

        // Arena first: tiny allocations come from ini_mem.
        let p = heap.alloc(24, false).unwrap();
        let arena = heap.ini_mem.as_ptr() as usize;
        assert!(p > arena && p < arena + INI_MEM);

        // Exhaust the arena.
        loop {
            let pos = heap.ini_pos as usize;
            if pos + 24 + 2 * BASE_ALIGN > INI_MEM {
                break;
            }
            heap.alloc(24, false).unwrap();
        }

        // Class traffic now reaches the slab (second sighting).
        heap.alloc(24, false).unwrap();
        let q = heap.alloc(24, false).unwrap();
        let (kind, _, _) = heap.region_of(q).unwrap();
        assert_eq!(kind, RegionKind::Slab);

        // Class-sized and larger traffic reaches buddy.
        let r = heap.alloc(MAX_CLASS_LEN, false).unwrap();
        let (kind, _, _) = heap.region_of(r).unwrap();
        assert_eq!(kind, RegionKind::Buddy);

        // Above the threshold: direct mapping.
        let big = heap.alloc(MMAP_THRESHOLD, false).unwrap();
        let (kind, _, _) = heap.region_of(big).unwrap();
        assert_eq!(kind, RegionKind::Mmap);

        heap.check_invariants().unwrap();

        // Cleanup.
        heap.free(big, 0);
        heap.free(r, 0);
        heap.free(q, 0);
        heap.trim();
    }
}
