//! Alignment arithmetic shared by every allocator.

use std::ptr::NonNull;

use crate::mem_assert;

/// Returns `true` if `value` is a non-zero power of two.
#[inline]
#[must_use]
pub const fn is_power_of_two(value: usize) -> bool {
    value != 0 && (value & (value - 1)) == 0
}

/// Rounds `size` up to the next multiple of `alignment`.
///
/// Fails fatally if `alignment` is not a power of two.
#[inline]
#[must_use]
pub fn aligned_size(size: usize, alignment: usize) -> usize {
    mem_assert!(
        is_power_of_two(alignment),
        "alignment expected to be a power of two. Actual value: ({alignment})"
    );
    (size + alignment - 1) & !(alignment - 1)
}

/// Returns `true` if `ptr` is a multiple of `alignment`.
#[inline]
#[must_use]
pub fn is_aligned(ptr: NonNull<u8>, alignment: usize) -> bool {
    alignment != 0 && (ptr.as_ptr() as usize) % alignment == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_power_of_two() {
        assert!(is_power_of_two(1));
        assert!(is_power_of_two(4096));
        assert!(!is_power_of_two(0));
        assert!(!is_power_of_two(48));
    }

    #[test]
    fn test_aligned_size() {
        assert_eq!(aligned_size(0, 8), 0);
        assert_eq!(aligned_size(1, 8), 8);
        assert_eq!(aligned_size(16, 16), 16);
        assert_eq!(aligned_size(17, 16), 32);
    }

    #[test]
    #[should_panic(expected = "power of two")]
    fn test_aligned_size_rejects_bad_alignment() {
        let _ = aligned_size(10, 12);
    }
}
