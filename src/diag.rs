//! Diagnostics - Line-Buffered Text on a File Descriptor
//!
//! User-facing diagnostics (invalid free, double free, size mismatch,
//! out of memory) are formatted into a fixed stack buffer and written
//! with a single `write(2)` call, so the facility never allocates and is
//! safe to use from inside the allocator itself, including when the
//! crate is installed as the global allocator.
//!
//! The descriptor defaults to the process's standard error and can be
//! selected once at startup with [`set_diag_fd`]. Lifecycle tracing
//! (region and heap create/delete, class promotion) goes through the
//! `log` facade instead and is only as allocation-free as the installed
//! logger.

use core::fmt::{self, Write};
use std::sync::atomic::{AtomicI32, AtomicU64, Ordering};

/// Upper bound of one diagnostic line, prefix and newline included.
const LINE_LEN: usize = 256;

static DIAG_FD: AtomicI32 = AtomicI32::new(2);

static DIAG_COUNT: AtomicU64 = AtomicU64::new(0);

/// Select the file descriptor diagnostics are written to.
///
/// Intended to be called once at startup; the allocator never closes or
/// otherwise manages the descriptor.
pub fn set_diag_fd(fd: i32) {
    DIAG_FD.store(fd, Ordering::Relaxed);
}

/// Number of diagnostics emitted so far, process-wide.
///
/// Tests use this to assert that an invalid operation was diagnosed
/// without parsing the text output.
pub fn diagnostic_count() -> u64 {
    DIAG_COUNT.load(Ordering::Relaxed)
}

/// Fixed-capacity line buffer; overlong diagnostics are truncated.
struct LineBuf {
    buf: [u8; LINE_LEN],
    len: usize,
}

impl LineBuf {
    fn new() -> Self {
        Self {
            buf: [0; LINE_LEN],
            len: 0,
        }
    }
}

impl fmt::Write for LineBuf {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        let room = LINE_LEN - 1 - self.len;
        let n = s.len().min(room);
        self.buf[self.len..self.len + n].copy_from_slice(&s.as_bytes()[..n]);
        self.len += n;
        Ok(())
    }
}

/// Emit one diagnostic line.
///
/// Not public API; use the `diag!` macro.
pub(crate) fn emit(args: fmt::Arguments<'_>) {
    let mut line = LineBuf::new();
    let _ = line.write_str("fmalloc: ");
    let _ = line.write_fmt(args);
    line.buf[line.len] = b'\n';
    line.len += 1;

    DIAG_COUNT.fetch_add(1, Ordering::Relaxed);
    write_fd(DIAG_FD.load(Ordering::Relaxed), &line.buf[..line.len]);
}

#[cfg(unix)]
fn write_fd(fd: i32, buf: &[u8]) {
    // Best effort; a failed write must not take the allocator down.
    unsafe {
        libc::write(fd, buf.as_ptr().cast(), buf.len());
    }
}

#[cfg(windows)]
fn write_fd(_fd: i32, buf: &[u8]) {
    use std::io::Write as _;
    let _ = std::io::stderr().write_all(buf);
}

/// Format and emit a diagnostic line to the configured descriptor.
macro_rules! diag {
    ($($arg:tt)*) => {
        $crate::diag::emit(format_args!($($arg)*))
    };
}
pub(crate) use diag;
