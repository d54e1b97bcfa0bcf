//! # Aligned Allocation Bookkeeping
//!
//! Aligned blocks are carved out of an over-sized plain block:
//!
//! ```text
//!   raw                aligned                      aligned + size
//!   │◄── offset ──►│◄──────── size ────────►│◄ signature (8) ►│ slack
//!   └──────────────┴────────────────────────┴─────────────────┘
//!        total = size + alignment - 1 + SIGNATURE_SIZE
//! ```
//!
//! [`AlignedState`] is the per-allocator side table mapping each aligned
//! pointer back to its raw block. The trailing signature is only written and
//! checked when `debug_signatures` is enabled in the configuration.
//!
//! ## Safety Note
//!
//! Signature access reads and writes through raw pointers; callers pass
//! pointers obtained from the owning allocator.

#![allow(unsafe_code)]

use std::collections::HashMap;
use std::fmt;
use std::ptr::NonNull;

use parking_lot::{Mutex, RwLock};

use crate::config;

/// Bytes reserved after every aligned payload for the debug signature.
pub const SIGNATURE_SIZE: usize = std::mem::size_of::<u64>();

const SIGNATURE_SALT: u64 = 0x4F52_4F42_414C_4E44;

/// Where an aligned block came from.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AllocationInfo {
    /// Distance from the raw block start to the aligned pointer.
    pub offset: usize,
    /// Requested payload size.
    pub size: usize,
    /// Requested alignment.
    pub alignment: usize,
}

impl AllocationInfo {
    /// Raw block size needed for `size` bytes at `alignment`.
    #[inline]
    #[must_use]
    pub const fn raw_size(size: usize, alignment: usize) -> usize {
        size + alignment - 1 + SIGNATURE_SIZE
    }
}

/// Name and aligned-block side table every [`AlignedAllocator`] carries.
///
/// [`AlignedAllocator`]: super::AlignedAllocator
pub struct AlignedState {
    name: RwLock<String>,
    blocks: Mutex<HashMap<usize, AllocationInfo>>,
    debug_signatures: bool,
}

impl AlignedState {
    /// Creates an empty table. Signature checking follows the installed
    /// configuration at construction time.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_signatures(name, config::current().debug_signatures)
    }

    /// Creates an empty table with explicit signature checking.
    #[must_use]
    pub fn with_signatures(name: impl Into<String>, debug_signatures: bool) -> Self {
        Self {
            name: RwLock::new(name.into()),
            blocks: Mutex::new(HashMap::new()),
            debug_signatures,
        }
    }

    /// Current allocator name.
    #[must_use]
    pub fn name(&self) -> String {
        self.name.read().clone()
    }

    /// Renames the allocator.
    pub fn set_name(&self, name: &str) {
        *self.name.write() = name.to_owned();
    }

    /// Whether trailing signatures are written and checked.
    #[inline]
    #[must_use]
    pub fn debug_signatures(&self) -> bool {
        self.debug_signatures
    }

    pub(crate) fn register(&self, aligned: NonNull<u8>, info: AllocationInfo) {
        self.blocks.lock().insert(aligned.as_ptr() as usize, info);
    }

    pub(crate) fn lookup(&self, aligned: NonNull<u8>) -> Option<AllocationInfo> {
        self.blocks.lock().get(&(aligned.as_ptr() as usize)).copied()
    }

    pub(crate) fn unregister(&self, aligned: NonNull<u8>) -> Option<AllocationInfo> {
        self.blocks.lock().remove(&(aligned.as_ptr() as usize))
    }

    /// Number of live aligned blocks.
    #[must_use]
    pub fn live_blocks(&self) -> usize {
        self.blocks.lock().len()
    }
}

impl fmt::Debug for AlignedState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AlignedState")
            .field("name", &*self.name.read())
            .field("live_blocks", &self.live_blocks())
            .field("debug_signatures", &self.debug_signatures)
            .finish()
    }
}

fn signature_for(aligned: NonNull<u8>) -> u64 {
    (aligned.as_ptr() as usize as u64) ^ SIGNATURE_SALT
}

/// Writes the trailing signature of an aligned block.
///
/// # Safety
///
/// `aligned + size .. + SIGNATURE_SIZE` must be writable.
pub(crate) unsafe fn write_signature(aligned: NonNull<u8>, size: usize) {
    let at = aligned.as_ptr().add(size).cast::<u64>();
    at.write_unaligned(signature_for(aligned));
}

/// Checks the trailing signature of an aligned block.
///
/// # Safety
///
/// `aligned + size .. + SIGNATURE_SIZE` must be readable.
pub(crate) unsafe fn signature_intact(aligned: NonNull<u8>, size: usize) -> bool {
    let at = aligned.as_ptr().add(size).cast::<u64>();
    at.read_unaligned() == signature_for(aligned)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_raw_size_covers_worst_case() {
        assert_eq!(AllocationInfo::raw_size(4, 4), 4 + 3 + SIGNATURE_SIZE);
        assert_eq!(AllocationInfo::raw_size(1, 1), 1 + SIGNATURE_SIZE);
    }

    #[test]
    fn test_side_table() {
        let state = AlignedState::with_signatures("table", true);
        let mut storage = [0u8; 32];
        let ptr = NonNull::new(storage.as_mut_ptr()).unwrap();
        let info = AllocationInfo {
            offset: 3,
            size: 8,
            alignment: 16,
        };

        state.register(ptr, info);
        assert_eq!(state.lookup(ptr), Some(info));
        assert_eq!(state.live_blocks(), 1);
        assert_eq!(state.unregister(ptr), Some(info));
        assert_eq!(state.lookup(ptr), None);
    }

    #[test]
    fn test_signature_detects_overrun() {
        let mut storage = [0u8; 32];
        let ptr = NonNull::new(storage.as_mut_ptr()).unwrap();
        unsafe {
            write_signature(ptr, 8);
            assert!(signature_intact(ptr, 8));
            *ptr.as_ptr().add(8) ^= 0xFF;
            assert!(!signature_intact(ptr, 8));
        }
    }

    #[test]
    fn test_rename() {
        let state = AlignedState::with_signatures("before", false);
        state.set_name("after");
        assert_eq!(state.name(), "after");
        assert!(!state.debug_signatures());
    }
}
