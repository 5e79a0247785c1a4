//! Memory pool - OS-backed arena managed by a TLSF allocator

use std::ptr::NonNull;
use std::sync::{Arc, Weak};

use parking_lot::{Mutex, RwLock};

use crate::config::MemoryConfig;
use crate::error::{MemoryError, Result};
use crate::os::{Backing, Region};
use crate::shared::{RefShared, RefUnique};
use crate::tlsf::{IntegrityError, PoolId, Tlsf, TlsfStats, ALIGN_SIZE};
use crate::Allocator;

/// Process-wide default pool, held weakly so a dropped pool reads back as `None`
static PRIMARY: RwLock<Option<Weak<MemoryPool>>> = parking_lot::const_rwlock(None);

/// General-purpose pool allocator
///
/// Reserves one contiguous region at construction and serves every
/// allocation from it through a [`Tlsf`] instance. Exhaustion is reported as
/// [`MemoryError::OutOfMemory`]; the pool never grows.
pub struct MemoryPool {
    tlsf: Mutex<Tlsf>,
    pool: PoolId,
    /// Declared last so the mapping outlives every use of the Tlsf above
    region: Region,
}

// Safety: the region is owned by the pool and all Tlsf access goes through the mutex
unsafe impl Send for MemoryPool {}
unsafe impl Sync for MemoryPool {}

impl MemoryPool {
    /// Create a pool of `size` bytes backed by virtual memory
    pub fn new(size: usize) -> Result<Self> {
        Self::with_backing(size, Backing::Virtual)
    }

    pub fn with_backing(size: usize, backing: Backing) -> Result<Self> {
        let region = Region::reserve(size, backing)?;
        let mut tlsf = Tlsf::new();
        // SAFETY: the region is exclusively owned and outlives the Tlsf
        let pool = unsafe { tlsf.add_pool(region.as_ptr(), region.len())? };

        log::debug!(
            "Created memory pool: {} bytes at {:p}",
            region.len(),
            region.as_ptr()
        );
        Ok(Self {
            tlsf: Mutex::new(tlsf),
            pool,
            region,
        })
    }

    /// Create a pool from configuration, registering it as primary if asked
    pub fn from_config(config: &MemoryConfig) -> Result<Arc<Self>> {
        config.validate()?;
        let pool = Arc::new(Self::with_backing(config.pool_size, config.backing)?);
        if config.make_primary {
            pool.make_primary();
        }
        Ok(pool)
    }

    /// Allocate `size` bytes aligned to 8
    pub fn allocate(&self, size: usize) -> Result<NonNull<u8>> {
        let ptr = self.tlsf.lock().malloc(size)?;
        log::trace!("Pool allocated {} bytes at {:p}", size, ptr);
        Ok(ptr)
    }

    /// Allocate `size` bytes aligned to `align`
    pub fn allocate_aligned(&self, size: usize, align: usize) -> Result<NonNull<u8>> {
        let ptr = self.tlsf.lock().memalign(align, size)?;
        log::trace!("Pool allocated {} bytes aligned to {} at {:p}", size, align, ptr);
        Ok(ptr)
    }

    /// Resize an allocation
    ///
    /// `None` allocates; a zero size frees and returns `None`.
    ///
    /// # Safety
    /// `ptr` must come from this pool and must not be used after a move.
    pub unsafe fn reallocate(
        &self,
        ptr: Option<NonNull<u8>>,
        size: usize,
    ) -> Result<Option<NonNull<u8>>> {
        self.tlsf.lock().realloc(ptr, size)
    }

    /// Free an allocation; `None` is a no-op
    ///
    /// # Safety
    /// `ptr` must come from this pool and must not be used afterwards.
    pub unsafe fn free(&self, ptr: Option<NonNull<u8>>) -> Result<()> {
        let Some(ptr) = ptr else {
            return Ok(());
        };
        self.tlsf.lock().free(ptr).map_err(|err| {
            log::warn!("Rejected free of {:p}: {}", ptr, err);
            err
        })
    }

    /// Usable bytes behind a live allocation
    ///
    /// # Safety
    /// `ptr` must come from this pool.
    pub unsafe fn block_size(&self, ptr: NonNull<u8>) -> Result<usize> {
        self.tlsf.lock().block_size(ptr)
    }

    /// Move `value` into a shared, reference-counted allocation in this pool
    pub fn new_shared<T>(&self, value: T) -> Result<RefShared<'_, T>> {
        RefShared::new_in(value, self)
    }

    /// Move `value` into a uniquely owned allocation in this pool
    pub fn new_unique<T>(&self, value: T) -> Result<RefUnique<'_, T>> {
        RefUnique::new_in(value, self)
    }

    /// Whether `ptr` points into this pool's region
    pub fn contains(&self, ptr: *const u8) -> bool {
        self.region.contains(ptr)
    }

    pub fn stats(&self) -> TlsfStats {
        self.tlsf.lock().stats()
    }

    /// Verify allocator invariants
    pub fn check(&self) -> core::result::Result<(), IntegrityError> {
        self.tlsf.lock().check()
    }

    /// Visit every block of the pool in address order
    pub fn walk(&self, visit: impl FnMut(crate::tlsf::BlockInfo)) {
        // The pool registered at construction is never removed
        let _ = self.tlsf.lock().walk_pool(self.pool, visit);
    }

    /// Register this pool as the process-wide default, replacing any other
    pub fn make_primary(self: &Arc<Self>) {
        *PRIMARY.write() = Some(Arc::downgrade(self));
        log::debug!("Memory pool at {:p} is now primary", self.region.as_ptr());
    }

    /// The current default pool, if one is registered and still alive
    pub fn primary() -> Option<Arc<MemoryPool>> {
        PRIMARY.read().as_ref().and_then(Weak::upgrade)
    }

    /// Unregister the process-wide default pool
    pub fn clear_primary() {
        *PRIMARY.write() = None;
    }

    /// Whether this pool is the current default
    pub fn is_primary(self: &Arc<Self>) -> bool {
        PRIMARY
            .read()
            .as_ref()
            .is_some_and(|primary| Weak::ptr_eq(primary, &Arc::downgrade(self)))
    }
}

impl Allocator for MemoryPool {
    fn allocate(&self, size: usize, align: usize) -> Result<NonNull<u8>> {
        if align <= ALIGN_SIZE {
            MemoryPool::allocate(self, size)
        } else {
            self.allocate_aligned(size, align)
        }
    }

    unsafe fn reallocate(&self, ptr: NonNull<u8>, new_size: usize) -> Result<NonNull<u8>> {
        if new_size == 0 {
            return Err(MemoryError::InvalidSize(0));
        }
        MemoryPool::reallocate(self, Some(ptr), new_size)?.ok_or(MemoryError::InvalidSize(new_size))
    }

    unsafe fn deallocate(&self, ptr: NonNull<u8>) -> Result<()> {
        self.free(Some(ptr))
    }

    fn capacity(&self) -> usize {
        self.stats().pool_bytes
    }

    fn used(&self) -> usize {
        self.stats().used_bytes
    }
}

impl Drop for MemoryPool {
    fn drop(&mut self) {
        let stats = self.tlsf.get_mut().stats();
        if stats.used_bytes != 0 {
            log::warn!(
                "Memory pool at {:p} dropped with {} bytes still allocated",
                self.region.as_ptr(),
                stats.used_bytes
            );
        }
        log::debug!("Destroying memory pool at {:p}", self.region.as_ptr());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::literals::ByteSize;

    #[test]
    fn test_pool_allocation() {
        let pool = MemoryPool::new(64usize.kib()).unwrap();

        let ptr1 = pool.allocate(64).unwrap();
        let ptr2 = pool.allocate(128).unwrap();
        assert_ne!(ptr1, ptr2);
        assert!(pool.contains(ptr1.as_ptr()));
        assert!(pool.used() >= 192);

        unsafe {
            pool.free(Some(ptr1)).unwrap();
            pool.free(Some(ptr2)).unwrap();
            pool.free(None).unwrap();
        }
        assert_eq!(pool.used(), 0);
        pool.check().unwrap();
    }

    #[test]
    fn test_heap_backing() {
        assert!(matches!(
            MemoryPool::with_backing(usize::MAX - 10, Backing::Heap),
            Err(MemoryError::InvalidSize(_))
        ));

        let pool = MemoryPool::with_backing(16usize.kib(), Backing::Heap).unwrap();
        let ptr = pool.allocate_aligned(100, 64).unwrap();
        assert_eq!(ptr.as_ptr() as usize % 64, 0);
        unsafe { pool.free(Some(ptr)).unwrap() };
        pool.check().unwrap();
    }

    #[test]
    fn test_reallocate_through_trait() {
        let pool = MemoryPool::new(16usize.kib()).unwrap();
        let alloc: &dyn Allocator = &pool;

        let ptr = alloc.allocate(32, 8).unwrap();
        unsafe {
            ptr.as_ptr().write_bytes(7, 32);
            let grown = alloc.reallocate(ptr, 512).unwrap();
            assert_eq!(*grown.as_ptr().add(31), 7);
            assert!(matches!(alloc.reallocate(grown, 0), Err(MemoryError::InvalidSize(0))));
            alloc.deallocate(grown).unwrap();
        }
        assert_eq!(alloc.used(), 0);
        assert_eq!(alloc.available(), alloc.capacity());
    }

    #[test]
    fn test_reallocate_over_aligned_block() {
        let pool = MemoryPool::new(16usize.kib()).unwrap();
        let counting = crate::RefCountingAllocator::new(16usize.kib()).unwrap();
        let allocators: [&dyn Allocator; 2] = [&pool, &counting];

        for alloc in allocators {
            let ptr = alloc.allocate(48, 256).unwrap();
            assert!(crate::is_aligned(ptr.as_ptr(), 256));
            // Pin the neighbour so growth has to move the block
            let fence = alloc.allocate(8, 8).unwrap();
            unsafe {
                ptr.as_ptr().write_bytes(0x5A, 48);
                let moved = alloc.reallocate(ptr, 4096).unwrap();
                assert!(crate::is_aligned(moved.as_ptr(), 8));
                assert!((0..48).all(|i| *moved.as_ptr().add(i) == 0x5A));
                alloc.deallocate(moved).unwrap();
                alloc.deallocate(fence).unwrap();
            }
            assert_eq!(alloc.used(), 0);
        }
    }

    #[test]
    fn test_rejected_free_is_reported() {
        let pool = MemoryPool::new(16usize.kib()).unwrap();
        let ptr = pool.allocate(16).unwrap();
        unsafe {
            pool.free(Some(ptr)).unwrap();
            assert!(matches!(pool.free(Some(ptr)), Err(MemoryError::DoubleFree(_))));
        }
    }

    #[test]
    fn test_primary_instance() {
        let first = Arc::new(MemoryPool::new(16usize.kib()).unwrap());
        let second = Arc::new(MemoryPool::new(16usize.kib()).unwrap());

        first.make_primary();
        second.make_primary();
        assert!(second.is_primary());
        assert!(!first.is_primary());
        assert!(Arc::ptr_eq(&MemoryPool::primary().unwrap(), &second));

        // Dropping the primary leaves nothing dangling behind
        drop(second);
        assert!(MemoryPool::primary().is_none());

        first.make_primary();
        MemoryPool::clear_primary();
        assert!(MemoryPool::primary().is_none());
    }
}
