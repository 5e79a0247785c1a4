//! OS-backed memory regions
//!
//! Pools reserve their arena straight from the OS so the pages are committed
//! lazily and returned in one piece on drop. Platforms without `mmap` fall
//! back to a page-aligned heap allocation.

use std::alloc::{self, Layout};
use std::ptr::NonNull;

use crate::address::checked_align_up;
use crate::error::{MemoryError, Result};

/// Granularity used when the OS page size is not queried
pub const PAGE_SIZE: usize = 4096;

/// Where a region's bytes come from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Backing {
    /// Anonymous virtual-memory mapping
    #[default]
    Virtual,
    /// Global heap allocation
    Heap,
}

/// An owned, zero-initialized, page-aligned byte region
pub struct Region {
    ptr: NonNull<u8>,
    len: usize,
    backing: Backing,
}

// Safety: the region is plain owned memory; access is synchronized by its owner
unsafe impl Send for Region {}
unsafe impl Sync for Region {}

impl Region {
    /// Reserve and commit `size` bytes (rounded up to whole pages)
    pub fn reserve(size: usize, backing: Backing) -> Result<Self> {
        if size == 0 {
            return Err(MemoryError::InvalidSize(0));
        }
        let len = checked_align_up(size, PAGE_SIZE).ok_or(MemoryError::InvalidSize(size))?;
        let ptr = match backing {
            Backing::Virtual => os_map(len)?,
            Backing::Heap => heap_alloc(len)?,
        };
        log::debug!("Reserved {} bytes at {:p} ({:?})", len, ptr, backing);
        Ok(Self { ptr, len, backing })
    }

    #[inline]
    pub fn as_ptr(&self) -> NonNull<u8> {
        self.ptr
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[inline]
    pub fn backing(&self) -> Backing {
        self.backing
    }

    /// Whether `ptr` falls inside this region
    pub fn contains(&self, ptr: *const u8) -> bool {
        let start = self.ptr.as_ptr() as usize;
        let addr = ptr as usize;
        addr >= start && addr < start + self.len
    }
}

impl Drop for Region {
    fn drop(&mut self) {
        match self.backing {
            Backing::Virtual => os_unmap(self.ptr, self.len),
            Backing::Heap => {
                // SAFETY: allocated in heap_alloc with this exact layout
                unsafe {
                    alloc::dealloc(self.ptr.as_ptr(), heap_layout(self.len));
                }
            }
        }
        log::debug!("Released {} bytes at {:p}", self.len, self.ptr);
    }
}

fn heap_layout(len: usize) -> Layout {
    // len is a non-zero multiple of PAGE_SIZE, a valid power-of-two alignment
    unsafe { Layout::from_size_align_unchecked(len, PAGE_SIZE) }
}

fn heap_alloc(len: usize) -> Result<NonNull<u8>> {
    Layout::from_size_align(len, PAGE_SIZE).map_err(|_| MemoryError::InvalidSize(len))?;
    // SAFETY: layout validated above and non-zero sized
    let ptr = unsafe { alloc::alloc_zeroed(heap_layout(len)) };
    NonNull::new(ptr).ok_or(MemoryError::OutOfMemory { requested: len })
}

#[cfg(unix)]
fn os_map(len: usize) -> Result<NonNull<u8>> {
    // SAFETY: anonymous private mapping, no file descriptor involved
    let ptr = unsafe {
        libc::mmap(
            std::ptr::null_mut(),
            len,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
            -1,
            0,
        )
    };
    if ptr == libc::MAP_FAILED {
        return Err(MemoryError::Os(std::io::Error::last_os_error()));
    }
    NonNull::new(ptr as *mut u8).ok_or(MemoryError::OutOfMemory { requested: len })
}

#[cfg(unix)]
fn os_unmap(ptr: NonNull<u8>, len: usize) {
    // SAFETY: ptr/len describe a mapping created by os_map
    let rc = unsafe { libc::munmap(ptr.as_ptr().cast(), len) };
    if rc != 0 {
        log::warn!(
            "munmap of {} bytes at {:p} failed: {}",
            len,
            ptr,
            std::io::Error::last_os_error()
        );
    }
}

#[cfg(not(unix))]
fn os_map(len: usize) -> Result<NonNull<u8>> {
    heap_alloc(len)
}

#[cfg(not(unix))]
fn os_unmap(ptr: NonNull<u8>, len: usize) {
    // SAFETY: os_map falls back to heap_alloc on this platform
    unsafe { alloc::dealloc(ptr.as_ptr(), heap_layout(len)) }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_region_is_page_aligned_and_zeroed() {
        for backing in [Backing::Virtual, Backing::Heap] {
            let region = Region::reserve(100, backing).unwrap();
            assert_eq!(region.len(), PAGE_SIZE);
            assert_eq!(region.as_ptr().as_ptr() as usize % PAGE_SIZE, 0);

            let bytes =
                unsafe { std::slice::from_raw_parts(region.as_ptr().as_ptr(), region.len()) };
            assert!(bytes.iter().all(|&b| b == 0));
            assert!(region.contains(region.as_ptr().as_ptr()));
        }
    }

    #[test]
    fn test_oversized_region_rejected() {
        for backing in [Backing::Virtual, Backing::Heap] {
            assert!(matches!(
                Region::reserve(usize::MAX - 10, backing),
                Err(MemoryError::InvalidSize(_))
            ));
        }
    }

    #[test]
    fn test_zero_sized_region_rejected() {
        assert!(matches!(
            Region::reserve(0, Backing::Heap),
            Err(MemoryError::InvalidSize(0))
        ));
    }
}
