//! # fmalloc - Drop-In Heap Allocator
//!
//! fmalloc is a general-purpose dynamic memory allocator serving the C
//! heap interface (allocate, free, reallocate, aligned allocate),
//! designed for multithreaded workloads with emphasis on low metadata
//! overhead, cache locality, and protection of bookkeeping data from
//! user writes.
//!
//! ## Overview
//!
//! - **Per-thread heaps**: every thread owns a private heap reached via
//!   thread-local storage; no locks exist anywhere on the allocation
//!   path. The only process-wide state is three relaxed counters.
//! - **Headerless blocks**: user blocks carry no header or trailer.
//!   Consecutively allocated blocks are adjacent, which helps cache and
//!   TLB behavior, and stray writes cannot corrupt the bookkeeping.
//! - **Region directory**: a multi-level sparse trie maps any address
//!   back to the region that owns it, the way page tables describe
//!   virtual memory.
//! - **Size-class slabs**: small sizes are observed per thread and hot
//!   sizes get committed slab regions of equal cells, with a per-class
//!   recycle bin serving MRU frees without touching the slab.
//! - **Buddy regions**: mid-size requests are served by power-of-two
//!   splitting with bitmap accelerators and buddy coalescing.
//! - **Direct mapping**: requests at or above 16 MiB map straight from
//!   the OS, wrapped in a region so free can find them.
//!
//! ## Allocation routing
//!
//! ```text
//!                 ┌──────────────────────────────────────────┐
//!                 │               heap (per thread)          │
//! malloc(n) ────► │  n >= 16 MiB ──────────► direct mapping  │
//!                 │  n < 4 KiB ──► bump arena / recycle bin  │
//!                 │                └─► slab (committed class)│
//!                 │  otherwise ───────────► buddy region     │
//!                 └──────────────────────────────────────────┘
//!                        every region registered in the
//!                        address directory, free() reverses
//! ```
//!
//! ## Quick Start
//!
//! ```rust
//! let p = fmalloc::malloc(100);
//! assert!(!p.is_null());
//! unsafe {
//!     std::ptr::write_bytes(p, 0x17, 100);
//!     fmalloc::free(p);
//! }
//! ```
//!
//! As the process allocator:
//!
//! ```ignore
//! #[global_allocator]
//! static ALLOC: fmalloc::Fmalloc = fmalloc::Fmalloc;
//! ```
//!
//! ## Error behavior
//!
//! All public entries are total: out of memory returns null, invalid
//! frees (unknown pointer, interior pointer, double free, write to the
//! zero-size block) write a line to the diagnostic descriptor (standard
//! error by default, see [`set_diag_fd`]) and return without freeing.
//! The process is never aborted by the allocator.
//!
//! ## Modules
//!
//! - [`api`]: the C-style entry points and the `GlobalAlloc` adapter
//! - [`heap`]: per-thread heap, region descriptors, address directory
//! - [`allocator`]: slab and buddy engines, size classes, recycle bins
//! - [`os`]: page-level mapping primitives
//! - [`diag`]: allocation-free diagnostics on a file descriptor
//! - [`stats`]: per-thread and process-wide snapshots
//!
//! ## Limitations
//!
//! - Pointers must be freed by the thread that allocated them; there
//!   are no cross-thread free queues.
//! - No transparent huge pages, NUMA placement, or page coloring.

pub mod allocator;
pub mod api;
pub mod config;
pub mod diag;
pub mod error;
pub mod heap;
pub mod os;
pub mod stats;
pub mod util;

pub use api::{
    aligned_alloc, calloc, free, free_sized, malloc, posix_memalign, realloc, trim, Fmalloc,
};
pub use diag::{diagnostic_count, set_diag_fd};
pub use error::{AllocError, Result};

/// Crate version from Cargo.toml.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
