//! Alignment and bit-search helpers

use core::ptr::NonNull;

/// Align a value up to the given alignment
#[inline]
pub const fn align_up(value: usize, align: usize) -> usize {
    debug_assert!(align.is_power_of_two());
    (value + align - 1) & !(align - 1)
}

/// Align a value up, or `None` when the result does not fit in a `usize`
#[inline]
pub const fn checked_align_up(value: usize, align: usize) -> Option<usize> {
    debug_assert!(align.is_power_of_two());
    match value.checked_add(align - 1) {
        Some(bumped) => Some(bumped & !(align - 1)),
        None => None,
    }
}

/// Align a value down to the given alignment
#[inline]
pub const fn align_down(value: usize, align: usize) -> usize {
    debug_assert!(align.is_power_of_two());
    value & !(align - 1)
}

/// Align a pointer up to the given alignment, keeping its provenance
#[inline]
pub fn align_ptr(ptr: NonNull<u8>, align: usize) -> NonNull<u8> {
    let addr = ptr.as_ptr() as usize;
    let offset = align_up(addr, align) - addr;
    // SAFETY: offset < align, callers only align within a block that has room
    unsafe { NonNull::new_unchecked(ptr.as_ptr().add(offset)) }
}

/// Check if a pointer is aligned
#[inline]
pub fn is_aligned(ptr: *const u8, align: usize) -> bool {
    (ptr as usize) & (align - 1) == 0
}

/// Index of the most significant set bit
#[inline]
pub const fn fls(word: usize) -> Option<u32> {
    if word == 0 {
        None
    } else {
        Some(usize::BITS - 1 - word.leading_zeros())
    }
}

/// Index of the least significant set bit
#[inline]
pub const fn ffs(word: u64) -> Option<u32> {
    if word == 0 {
        None
    } else {
        Some(word.trailing_zeros())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_align() {
        assert_eq!(align_up(0, 8), 0);
        assert_eq!(align_up(1, 8), 8);
        assert_eq!(align_up(8, 8), 8);
        assert_eq!(align_up(13, 16), 16);
        assert_eq!(align_down(15, 8), 8);
        assert_eq!(align_down(16, 16), 16);
    }

    #[test]
    fn test_checked_align_up() {
        assert_eq!(checked_align_up(13, 16), Some(16));
        assert_eq!(checked_align_up(usize::MAX - 7, 8), Some(usize::MAX - 7));
        assert_eq!(checked_align_up(usize::MAX - 6, 8), None);
        assert_eq!(checked_align_up(usize::MAX - 10, 4096), None);
    }

    #[test]
    fn test_bit_search() {
        assert_eq!(fls(0), None);
        assert_eq!(fls(1), Some(0));
        assert_eq!(fls(0x80), Some(7));
        assert_eq!(fls(0x8000_0000), Some(31));
        assert_eq!(fls(usize::MAX), Some(usize::BITS - 1));

        assert_eq!(ffs(0), None);
        assert_eq!(ffs(1), Some(0));
        assert_eq!(ffs(0x80), Some(7));
        assert_eq!(ffs(1 << 63), Some(63));
    }

    #[test]
    fn test_align_ptr() {
        let buf = [0u64; 4];
        let base = NonNull::new(buf.as_ptr() as *mut u8).unwrap();
        let odd = NonNull::new(unsafe { base.as_ptr().add(1) }).unwrap();

        assert_eq!(align_ptr(base, 8), base);
        assert_eq!(align_ptr(odd, 8).as_ptr() as usize, base.as_ptr() as usize + 8);
        assert!(is_aligned(align_ptr(odd, 8).as_ptr(), 8));
    }
}
