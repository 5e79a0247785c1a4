//! Byte-size literals
//!
//! ```
//! use frt_memory::literals::ByteSize;
//!
//! assert_eq!(4usize.kib(), 4096);
//! assert_eq!(1usize.mib(), 1 << 20);
//! ```

pub const KIB: usize = 1 << 10;
pub const MIB: usize = 1 << 20;
pub const GIB: usize = 1 << 30;

/// Extension methods for writing pool sizes
pub trait ByteSize {
    fn kib(self) -> usize;
    fn mib(self) -> usize;
    fn gib(self) -> usize;
}

impl ByteSize for usize {
    #[inline]
    fn kib(self) -> usize {
        self * KIB
    }

    #[inline]
    fn mib(self) -> usize {
        self * MIB
    }

    #[inline]
    fn gib(self) -> usize {
        self * GIB
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_literals() {
        assert_eq!(1usize.kib(), 1024);
        assert_eq!(16usize.mib(), 16 * 1024 * 1024);
        assert_eq!(2usize.gib(), 2 * 1024 * 1024 * 1024);
    }
}
