//! # General and String Allocators
//!
//! Size-class dispatchers over the fixed-block singletons, with an array
//! allocator for anything larger than the biggest class.
//!
//! | Allocator | Fixed classes | Fallback |
//! |---|---|---|
//! | [`GeneralAllocator`] | 32, 64, 128, 256, 512, 1024 | `ArrayAllocator<16384>` |
//! | [`StringAllocator`] | 16, 32, 64, 128, 256 | `ArrayAllocator<4096>` |
//!
//! Every block starts with a 16-byte header naming the bucket that
//! produced it, so frees and resizes go back to the right allocator.
//!
//! ## Safety Note
//!
//! Headers are read and written unaligned in front of the payload.

#![allow(unsafe_code)]

use std::fmt;
use std::mem::size_of;
use std::ptr::{self, NonNull};

use bytemuck::{Pod, Zeroable};

use super::{
    AlignedAllocator, AlignedState, ArrayAllocator, FixedBlocksAllocator, MemAllocator,
};

/// Sub-allocator that produced a block.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Bucket {
    /// A fixed-block class of this block size.
    Fixed(usize),
    /// The array fallback.
    Array,
}

impl Bucket {
    const ARRAY_TAG: u64 = 0;

    fn tag(self) -> u64 {
        match self {
            Self::Fixed(size) => size as u64,
            Self::Array => Self::ARRAY_TAG,
        }
    }

    fn from_tag(tag: u64) -> Self {
        if tag == Self::ARRAY_TAG {
            Self::Array
        } else {
            Self::Fixed(tag as usize)
        }
    }
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Pod, Zeroable)]
struct BlockHeader {
    bucket: u64,
    size: u64,
}

const HEADER_SIZE: usize = size_of::<BlockHeader>();

unsafe fn read_header(payload: NonNull<u8>) -> BlockHeader {
    let at = payload.as_ptr().sub(HEADER_SIZE);
    bytemuck::pod_read_unaligned(std::slice::from_raw_parts(at, HEADER_SIZE))
}

unsafe fn write_header(block: NonNull<u8>, bucket: Bucket, size: usize) -> NonNull<u8> {
    let header = BlockHeader {
        bucket: bucket.tag(),
        size: size as u64,
    };
    std::slice::from_raw_parts_mut(block.as_ptr(), HEADER_SIZE)
        .copy_from_slice(bytemuck::bytes_of(&header));
    NonNull::new_unchecked(block.as_ptr().add(HEADER_SIZE))
}

/// Size classes plus fallback, shared by both dispatchers.
struct Buckets {
    fixed: Vec<(usize, &'static dyn AlignedAllocator)>,
    array: &'static dyn AlignedAllocator,
}

impl Buckets {
    /// Smallest class that fits `total` bytes.
    fn select(&self, total: usize) -> (Bucket, &'static dyn AlignedAllocator) {
        self.fixed
            .iter()
            .find(|(block, _)| total <= *block)
            .map_or((Bucket::Array, self.array), |&(block, allocator)| {
                (Bucket::Fixed(block), allocator)
            })
    }

    fn resolve(&self, bucket: Bucket) -> &'static dyn AlignedAllocator {
        match bucket {
            Bucket::Array => self.array,
            Bucket::Fixed(block) => match self.fixed.iter().find(|(b, _)| *b == block) {
                Some(&(_, allocator)) => allocator,
                None => crate::diag::raise_failure(
                    file!(),
                    line!(),
                    format_args!("block header names unknown bucket {block}"),
                ),
            },
        }
    }

    fn allocate(&self, size: usize) -> NonNull<u8> {
        let total = size + HEADER_SIZE;
        let (bucket, allocator) = self.select(total);
        let block = allocator.allocate(total);
        // SAFETY: `total` bytes were just allocated.
        unsafe { write_header(block, bucket, size) }
    }

    unsafe fn reallocate(&self, ptr: NonNull<u8>, size: usize) -> NonNull<u8> {
        let header = read_header(ptr);
        let current = Bucket::from_tag(header.bucket);
        let total = size + HEADER_SIZE;
        let (wanted, _) = self.select(total);

        if wanted == current {
            let allocator = self.resolve(current);
            let block = NonNull::new_unchecked(ptr.as_ptr().sub(HEADER_SIZE));
            let block = allocator.reallocate(block, total);
            return write_header(block, current, size);
        }

        let moved = self.allocate(size);
        ptr::copy_nonoverlapping(ptr.as_ptr(), moved.as_ptr(), (header.size as usize).min(size));
        self.deallocate(ptr);
        moved
    }

    unsafe fn deallocate(&self, ptr: NonNull<u8>) {
        let header = read_header(ptr);
        let allocator = self.resolve(Bucket::from_tag(header.bucket));
        allocator.deallocate(NonNull::new_unchecked(ptr.as_ptr().sub(HEADER_SIZE)));
    }

    unsafe fn validate(&self, ptr: NonNull<u8>) -> bool {
        let header = read_header(ptr);
        let allocator = self.resolve(Bucket::from_tag(header.bucket));
        allocator.is_valid(NonNull::new_unchecked(ptr.as_ptr().sub(HEADER_SIZE)))
    }
}

macro_rules! dispatcher {
    ($(#[$meta:meta])* $name:ident, [$($block:literal),+], $array:literal) => {
        $(#[$meta])*
        pub struct $name {
            buckets: Buckets,
            aligned: AlignedState,
        }

        impl $name {
            /// Creates a dispatcher over the process singletons.
            #[must_use]
            pub fn new() -> Self {
                Self {
                    buckets: Buckets {
                        fixed: vec![$(
                            ($block, FixedBlocksAllocator::<$block>::instance() as &'static dyn AlignedAllocator),
                        )+],
                        array: ArrayAllocator::<$array>::instance(),
                    },
                    aligned: AlignedState::new(stringify!($name)),
                }
            }

            /// Bucket a block size would be served from.
            #[must_use]
            pub fn bucket_for(&self, size: usize) -> Bucket {
                self.buckets.select(size + HEADER_SIZE).0
            }

            /// Bucket that produced the block at `ptr`.
            ///
            /// # Safety
            ///
            /// `ptr` must be a live block from this allocator.
            #[must_use]
            pub unsafe fn bucket_of(&self, ptr: NonNull<u8>) -> Bucket {
                Bucket::from_tag(read_header(ptr).bucket)
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl MemAllocator for $name {
            fn allocate(&self, size: usize) -> NonNull<u8> {
                self.buckets.allocate(size)
            }

            unsafe fn reallocate(&self, ptr: NonNull<u8>, size: usize) -> NonNull<u8> {
                self.buckets.reallocate(ptr, size)
            }

            unsafe fn deallocate(&self, ptr: NonNull<u8>) {
                self.buckets.deallocate(ptr);
            }

            unsafe fn allocation_size(&self, ptr: NonNull<u8>) -> usize {
                read_header(ptr).size as usize
            }
        }

        impl AlignedAllocator for $name {
            fn aligned_state(&self) -> &AlignedState {
                &self.aligned
            }

            unsafe fn validate_block(&self, ptr: NonNull<u8>) -> bool {
                self.buckets.validate(ptr)
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                let classes: Vec<usize> = self.buckets.fixed.iter().map(|(block, _)| *block).collect();
                f.debug_struct(stringify!($name))
                    .field("classes", &classes)
                    .field("array_minimum", &$array)
                    .finish_non_exhaustive()
            }
        }
    };
}

dispatcher!(
    /// General-purpose allocator dispatching by size.
    ///
    /// ```rust,ignore
    /// let general = GeneralAllocator::new();
    /// let ptr = general.allocate(40);                         // Fixed(64)
    /// let ptr = unsafe { general.reallocate(ptr, 2000) };     // moved to Array
    /// ```
    GeneralAllocator,
    [32, 64, 128, 256, 512, 1024],
    16384
);

dispatcher!(
    /// Allocator tuned for short strings.
    StringAllocator,
    [16, 32, 64, 128, 256],
    4096
);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bucket_selection() {
        let general = GeneralAllocator::new();
        assert_eq!(general.bucket_for(0), Bucket::Fixed(32));
        assert_eq!(general.bucket_for(16), Bucket::Fixed(32));
        assert_eq!(general.bucket_for(17), Bucket::Fixed(64));
        assert_eq!(general.bucket_for(1008), Bucket::Fixed(1024));
        assert_eq!(general.bucket_for(1009), Bucket::Array);

        let strings = StringAllocator::new();
        assert_eq!(strings.bucket_for(0), Bucket::Fixed(16));
        assert_eq!(strings.bucket_for(240), Bucket::Fixed(256));
        assert_eq!(strings.bucket_for(241), Bucket::Array);
    }

    #[test]
    fn test_move_from_fixed_to_array() {
        let general = GeneralAllocator::new();
        let ptr = general.allocate(40);
        unsafe {
            assert_eq!(general.bucket_of(ptr), Bucket::Fixed(64));
            for i in 0..40u8 {
                *ptr.as_ptr().add(usize::from(i)) = i;
            }

            let moved = general.reallocate(ptr, 2000);
            assert_eq!(general.bucket_of(moved), Bucket::Array);
            assert_eq!(general.allocation_size(moved), 2000);
            for i in 0..40u8 {
                assert_eq!(*moved.as_ptr().add(usize::from(i)), i);
            }
            assert!(general.is_valid(moved));
            general.deallocate(moved);
        }
    }

    #[test]
    fn test_resize_within_bucket_keeps_block() {
        let general = GeneralAllocator::new();
        let ptr = general.allocate(70);
        unsafe {
            assert_eq!(general.bucket_of(ptr), Bucket::Fixed(128));
            let same = general.reallocate(ptr, 100);
            assert_eq!(same, ptr);
            assert_eq!(general.allocation_size(same), 100);
            general.deallocate(same);
        }
    }

    #[test]
    fn test_array_bucket_grows() {
        let strings = StringAllocator::new();
        let ptr = strings.allocate(300);
        unsafe {
            ptr::write_bytes(ptr.as_ptr(), b'x', 300);
            let grown = strings.reallocate(ptr, 9000);
            assert_eq!(strings.bucket_of(grown), Bucket::Array);
            assert_eq!(*grown.as_ptr().add(299), b'x');
            assert_eq!(strings.allocation_size(grown), 9000);
            strings.deallocate(grown);
        }
    }

    #[test]
    fn test_string_payloads_are_independent() {
        let strings = StringAllocator::new();
        let text = b"test < 256 characters, long enough for the 64 byte class";
        let a = strings.allocate(text.len());
        let b = strings.allocate(text.len());
        assert_ne!(a, b);
        unsafe {
            ptr::copy_nonoverlapping(text.as_ptr(), a.as_ptr(), text.len());
            ptr::copy_nonoverlapping(text.as_ptr(), b.as_ptr(), text.len());
            let a_bytes = std::slice::from_raw_parts(a.as_ptr(), text.len());
            let b_bytes = std::slice::from_raw_parts(b.as_ptr(), text.len());
            assert_eq!(a_bytes, b_bytes);
            strings.deallocate(a);
            strings.deallocate(b);
        }
    }
}
