//! # Memory Error Types
//!
//! Recoverable errors of the memory system.
//!
//! Almost everything in this crate fails fatally through [`crate::diag`].
//! The variants here cover the two edges where a caller can reasonably
//! recover: probing page allocation and loading configuration.

use thiserror::Error;

/// Errors that can occur in the memory system.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MemoryError {
    /// Alignment is not a power of two.
    #[error("alignment expected to be a power of two, got {0}")]
    InvalidAlignment(usize),

    /// The system allocator refused to provide a page.
    #[error("page allocation failed: {size} bytes aligned to {alignment}")]
    PageAllocation {
        /// Requested page size in bytes.
        size: usize,
        /// Requested alignment in bytes.
        alignment: usize,
    },

    /// Invalid configuration file.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

/// Result type for memory operations.
pub type MemoryResult<T> = Result<T, MemoryError>;
