//! OS Adapter - Page-Level Memory Mapping
//!
//! Thin wrappers over the platform mapping primitives. Everything above
//! this module deals in page-multiple lengths and raw addresses; the
//! wrappers only round lengths up to the page size and normalize the
//! failure convention to `Option`.
//!
//! Platform Support:
//! - Unix: `mmap`/`munmap` (`mremap` on Linux, map-copy-unmap elsewhere)
//! - Windows: `VirtualAlloc`/`VirtualFree` (remap is map-copy-free)
//!
//! Fresh mappings are anonymous, private, read/write and zero-filled.

use std::ptr::NonNull;

use lazy_static::lazy_static;

use crate::util::align::align_up;

lazy_static! {
    static ref PAGE_LEN: usize = page_size::get();
}

/// Runtime page size, cached after the first query.
#[inline]
pub fn page_len() -> usize {
    *PAGE_LEN
}

/// Round a length up to a whole number of pages.
#[inline]
pub fn page_align(len: usize) -> usize {
    align_up(len, page_len())
}

/// Map `len` bytes of fresh, zero-filled memory.
///
/// Returns `None` on OS failure; the caller decides whether to trim
/// caches and retry.
pub fn map(len: usize) -> Option<NonNull<u8>> {
    let len = page_align(len);
    let ptr = sys_map(len)?;
    log::trace!("os map {} bytes at {:#x}", len, ptr.as_ptr() as usize);
    Some(ptr)
}

/// Release one prior mapping (or a page-aligned tail of it).
///
/// # Safety
/// `ptr`/`len` must denote memory obtained from [`map`] or [`remap`] and
/// not yet released; no live reference into the range may remain.
pub unsafe fn unmap(ptr: NonNull<u8>, len: usize) {
    let len = page_align(len);
    log::trace!("os unmap {} bytes at {:#x}", len, ptr.as_ptr() as usize);
    sys_unmap(ptr, len);
}

/// Grow or shrink a mapping, possibly moving it.
///
/// On success the returned pointer replaces `ptr`; when it differs, the
/// old mapping is gone. On failure the old mapping is untouched.
///
/// # Safety
/// Same contract as [`unmap`] for `ptr`/`old_len`.
pub unsafe fn remap(ptr: NonNull<u8>, old_len: usize, new_len: usize) -> Option<NonNull<u8>> {
    let old_len = page_align(old_len);
    let new_len = page_align(new_len);
    sys_remap(ptr, old_len, new_len)
}

#[cfg(unix)]
fn sys_map(len: usize) -> Option<NonNull<u8>> {
    let ptr = unsafe {
        libc::mmap(
            std::ptr::null_mut(),
            len,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_PRIVATE | libc::MAP_ANON,
            -1,
            0,
        )
    };
    if ptr == libc::MAP_FAILED {
        return None;
    }
    NonNull::new(ptr.cast())
}

#[cfg(unix)]
fn sys_unmap(ptr: NonNull<u8>, len: usize) {
    unsafe {
        libc::munmap(ptr.as_ptr().cast(), len);
    }
}

#[cfg(target_os = "linux")]
unsafe fn sys_remap(ptr: NonNull<u8>, old_len: usize, new_len: usize) -> Option<NonNull<u8>> {
    let np = libc::mremap(
        ptr.as_ptr().cast(),
        old_len,
        new_len,
        libc::MREMAP_MAYMOVE,
    );
    if np == libc::MAP_FAILED {
        return None;
    }
    NonNull::new(np.cast())
}

#[cfg(all(unix, not(target_os = "linux")))]
unsafe fn sys_remap(ptr: NonNull<u8>, old_len: usize, new_len: usize) -> Option<NonNull<u8>> {
    let np = sys_map(new_len)?;
    std::ptr::copy_nonoverlapping(ptr.as_ptr(), np.as_ptr(), old_len.min(new_len));
    sys_unmap(ptr, old_len);
    Some(np)
}

#[cfg(windows)]
fn sys_map(len: usize) -> Option<NonNull<u8>> {
    use windows_sys::Win32::System::Memory::{
        VirtualAlloc, MEM_COMMIT, MEM_RESERVE, PAGE_READWRITE,
    };
    let ptr = unsafe {
        VirtualAlloc(
            std::ptr::null(),
            len,
            MEM_COMMIT | MEM_RESERVE,
            PAGE_READWRITE,
        )
    };
    NonNull::new(ptr.cast())
}

#[cfg(windows)]
fn sys_unmap(ptr: NonNull<u8>, _len: usize) {
    use windows_sys::Win32::System::Memory::{VirtualFree, MEM_RELEASE};
    unsafe {
        VirtualFree(ptr.as_ptr().cast(), 0, MEM_RELEASE);
    }
}

#[cfg(windows)]
unsafe fn sys_remap(ptr: NonNull<u8>, old_len: usize, new_len: usize) -> Option<NonNull<u8>> {
    let np = sys_map(new_len)?;
    std::ptr::copy_nonoverlapping(ptr.as_ptr(), np.as_ptr(), old_len.min(new_len));
    sys_unmap(ptr, old_len);
    Some(np)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_page_len_sane() {
        assert!(page_len() >= 4096);
        assert!(page_len().is_power_of_two());
    }

    #[test]
    fn test_map_zero_filled() {
        let ptr = map(8192).unwrap();
        let bytes = unsafe { std::slice::from_raw_parts(ptr.as_ptr(), 8192) };
        assert!(bytes.iter().all(|&b| b == 0));
        unsafe { unmap(ptr, 8192) };
    }

    #[test]
    fn test_map_page_rounded_write() {
        let ptr = map(100).unwrap();
        // The tail of the page is mapped and writable.
        unsafe {
            *ptr.as_ptr().add(page_len() - 1) = 0xa5;
            unmap(ptr, 100);
        }
    }

    #[test]
    fn test_remap_preserves_contents() {
        let ptr = map(4096).unwrap();
        unsafe {
            std::ptr::write_bytes(ptr.as_ptr(), 0x5a, 4096);
            let np = remap(ptr, 4096, 1 << 16).unwrap();
            let bytes = std::slice::from_raw_parts(np.as_ptr(), 4096);
            assert!(bytes.iter().all(|&b| b == 0x5a));
            unmap(np, 1 << 16);
        }
    }
}
