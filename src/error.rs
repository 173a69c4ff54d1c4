//! Error Module - Allocator Error Types
//!
//! Internal failures only: the paths that create regions, directory
//! nodes, and descriptors report through [`AllocError`]. User-facing
//! misuse (invalid free, double free, size mismatch) is not an error
//! value anywhere — the public entry points in [`crate::api`] diagnose
//! it through [`crate::diag`] and answer with a sentinel, per the C
//! heap contract.

use thiserror::Error;

/// Main error type for internal allocator operations
#[derive(Debug, Error)]
pub enum AllocError {
    #[error("out of memory: requested {requested} bytes")]
    OutOfMemory { requested: usize },

    #[error("region directory node pool exhausted")]
    DirectoryExhausted,

    #[error("region descriptor pool exhausted")]
    RegionPoolExhausted,
}

/// Result type alias for allocator operations
pub type Result<T> = std::result::Result<T, AllocError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_contains_context() {
        let msg = AllocError::OutOfMemory { requested: 4096 }.to_string();
        assert!(msg.contains("4096"));
    }

    #[test]
    fn test_display_names_the_pool() {
        assert!(AllocError::DirectoryExhausted.to_string().contains("directory"));
        assert!(AllocError::RegionPoolExhausted.to_string().contains("descriptor"));
    }
}
