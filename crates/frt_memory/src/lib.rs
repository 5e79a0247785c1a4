//! # frt_memory - Engine Memory Subsystem
//!
//! Allocation services consumed by the rest of the engine:
//! - Tlsf: constant-time two-level segregated-fit allocator over raw pools
//! - MemoryPool: OS-backed arena managed by a Tlsf instance
//! - RefCountingAllocator: first-fit allocator tracking handle references
//!   per allocation instead of embedding counters
//! - MemoryHandle / RefShared / RefWeak / RefUnique: ownership wrappers
//!
//! Every allocator takes `&self` and synchronizes internally, so handles can
//! borrow the allocator that produced them for as long as they live.

use core::ptr::NonNull;

pub mod address;
pub mod config;
pub mod context;
pub mod error;
pub mod handle;
pub mod literals;
pub mod os;
pub mod pool;
pub mod ref_counting;
pub mod shared;
pub mod tlsf;

pub use address::{align_down, align_up, is_aligned};
pub use config::MemoryConfig;
pub use context::MemoryContext;
pub use error::{MemoryError, Result};
pub use handle::{ArrayHandle, MemoryHandle, MemoryRef, MemoryRefMut};
pub use pool::MemoryPool;
pub use ref_counting::{RefCountingAllocator, Release};
pub use shared::{RefShared, RefUnique, RefWeak};
pub use tlsf::Tlsf;

/// Common trait for all allocators
pub trait Allocator: Send + Sync {
    /// Allocate `size` bytes aligned to `align`
    fn allocate(&self, size: usize, align: usize) -> Result<NonNull<u8>>;

    /// Resize an allocation, preserving the first `min(old, new)` bytes
    ///
    /// The result is only guaranteed 8-byte alignment, whatever `align` the
    /// block was allocated with. Over-aligned data must be moved with a
    /// fresh `allocate` and a copy instead.
    ///
    /// # Safety
    /// `ptr` must have been allocated by this allocator and not yet freed
    unsafe fn reallocate(&self, ptr: NonNull<u8>, new_size: usize) -> Result<NonNull<u8>>;

    /// Deallocate memory
    ///
    /// # Safety
    /// The pointer must have been allocated by this allocator
    unsafe fn deallocate(&self, ptr: NonNull<u8>) -> Result<()>;

    /// Get the total capacity
    fn capacity(&self) -> usize;

    /// Get the currently used memory
    fn used(&self) -> usize;

    /// Get the available memory
    fn available(&self) -> usize {
        self.capacity().saturating_sub(self.used())
    }
}

pub mod prelude {
    pub use crate::literals::ByteSize;
    pub use crate::{align_down, align_up, is_aligned};
    pub use crate::{Allocator, MemoryError, MemoryPool, RefCountingAllocator};
    pub use crate::{ArrayHandle, MemoryHandle, RefShared, RefUnique, RefWeak};
}
