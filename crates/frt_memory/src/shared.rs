//! Single-threaded owners that live inside an [`Allocator`]
//!
//! [`RefShared`] and [`RefWeak`] behave like `Rc`/`Weak`, and [`RefUnique`]
//! like `Box`, except that the counters and the value share one block taken
//! from a caller-chosen allocator. The block goes back to that allocator
//! once the last strong and weak owner is gone.

use core::cell::{Cell, UnsafeCell};
use core::fmt;
use core::marker::PhantomData;
use core::mem::{self, MaybeUninit};
use core::ops::{Deref, DerefMut};
use core::ptr::{self, NonNull};

use crate::error::Result;
use crate::Allocator;

struct ControlBlock<'a, T> {
    strong: Cell<usize>,
    /// Weak owners plus one held collectively by the strong owners
    weak: Cell<usize>,
    /// Set while a RefUnique owns the value; weak owners may not promote
    unique: Cell<bool>,
    allocator: &'a dyn Allocator,
    value: UnsafeCell<MaybeUninit<T>>,
}

impl<'a, T> ControlBlock<'a, T> {
    fn create(value: T, allocator: &'a dyn Allocator, unique: bool) -> Result<NonNull<Self>> {
        let raw = allocator.allocate(mem::size_of::<Self>(), mem::align_of::<Self>())?;
        let block = raw.cast::<Self>();
        // SAFETY: fresh allocation sized and aligned for Self
        unsafe {
            block.as_ptr().write(Self {
                strong: Cell::new(1),
                weak: Cell::new(1),
                unique: Cell::new(unique),
                allocator,
                value: UnsafeCell::new(MaybeUninit::new(value)),
            });
        }
        Ok(block)
    }

    fn value_ptr(&self) -> *mut T {
        // MaybeUninit<T> is layout-compatible with T
        self.value.get().cast::<T>()
    }

    /// Give up one strong reference, dropping the value on the last one
    ///
    /// # Safety
    /// `block` must be live and the caller must own a strong reference.
    unsafe fn release_strong(block: NonNull<Self>) {
        let strong = block.as_ref().strong.get() - 1;
        block.as_ref().strong.set(strong);
        if strong == 0 {
            ptr::drop_in_place(block.as_ref().value_ptr());
            Self::release_weak(block);
        }
    }

    /// Give up one weak reference, returning the block on the last one
    ///
    /// # Safety
    /// `block` must be live and the caller must own a weak reference.
    unsafe fn release_weak(block: NonNull<Self>) {
        let weak = block.as_ref().weak.get() - 1;
        block.as_ref().weak.set(weak);
        if weak == 0 {
            let allocator = block.as_ref().allocator;
            if let Err(err) = allocator.deallocate(block.cast()) {
                log::warn!("Failed to return shared block {:p}: {}", block, err);
            }
        }
    }
}

/// Shared owner of a `T` allocated from an [`Allocator`]
pub struct RefShared<'a, T> {
    block: NonNull<ControlBlock<'a, T>>,
    _owns: PhantomData<ControlBlock<'a, T>>,
}

impl<'a, T> RefShared<'a, T> {
    /// Move `value` into a new block from `allocator`
    pub fn new_in(value: T, allocator: &'a dyn Allocator) -> Result<Self> {
        Ok(Self::from_block(ControlBlock::create(value, allocator, false)?))
    }

    fn from_block(block: NonNull<ControlBlock<'a, T>>) -> Self {
        Self {
            block,
            _owns: PhantomData,
        }
    }

    fn inner(&self) -> &ControlBlock<'a, T> {
        // SAFETY: a strong owner keeps the block allocated
        unsafe { self.block.as_ref() }
    }

    /// Create a weak owner of the same value
    pub fn downgrade(this: &Self) -> RefWeak<'a, T> {
        let inner = this.inner();
        inner.weak.set(inner.weak.get() + 1);
        RefWeak::from_block(this.block)
    }

    pub fn strong_count(this: &Self) -> usize {
        this.inner().strong.get()
    }

    pub fn weak_count(this: &Self) -> usize {
        this.inner().weak.get() - 1
    }

    /// Whether both owners share one block
    pub fn ptr_eq(this: &Self, other: &Self) -> bool {
        this.block == other.block
    }

    /// Mutable access when no other strong or weak owner exists
    pub fn get_mut(this: &mut Self) -> Option<&mut T> {
        let inner = this.inner();
        if inner.strong.get() == 1 && inner.weak.get() == 1 {
            // SAFETY: sole owner, and the &mut borrow of `this` excludes aliasing
            Some(unsafe { &mut *inner.value_ptr() })
        } else {
            None
        }
    }

    pub fn allocator(this: &Self) -> &'a dyn Allocator {
        this.inner().allocator
    }
}

impl<T> Clone for RefShared<'_, T> {
    fn clone(&self) -> Self {
        let inner = self.inner();
        inner.strong.set(inner.strong.get() + 1);
        Self::from_block(self.block)
    }
}

impl<T> Deref for RefShared<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        // SAFETY: the value stays initialized while strong > 0
        unsafe { &*self.inner().value_ptr() }
    }
}

impl<T> Drop for RefShared<'_, T> {
    fn drop(&mut self) {
        // SAFETY: this owner holds one strong reference
        unsafe { ControlBlock::release_strong(self.block) }
    }
}

impl<T: fmt::Debug> fmt::Debug for RefShared<'_, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&**self, f)
    }
}

/// Non-owning observer of a [`RefShared`] value
pub struct RefWeak<'a, T> {
    block: NonNull<ControlBlock<'a, T>>,
    _owns: PhantomData<ControlBlock<'a, T>>,
}

impl<'a, T> RefWeak<'a, T> {
    fn from_block(block: NonNull<ControlBlock<'a, T>>) -> Self {
        Self {
            block,
            _owns: PhantomData,
        }
    }

    fn inner(&self) -> &ControlBlock<'a, T> {
        // SAFETY: a weak owner keeps the block allocated
        unsafe { self.block.as_ref() }
    }

    /// Promote to a strong owner
    ///
    /// Returns `None` once the value is gone, and while it is still held by
    /// a [`RefUnique`].
    pub fn lock(&self) -> Option<RefShared<'a, T>> {
        let inner = self.inner();
        let strong = inner.strong.get();
        if strong == 0 || inner.unique.get() {
            return None;
        }
        inner.strong.set(strong + 1);
        Some(RefShared::from_block(self.block))
    }

    /// Whether the value has been dropped
    pub fn expired(&self) -> bool {
        self.inner().strong.get() == 0
    }

    pub fn strong_count(&self) -> usize {
        self.inner().strong.get()
    }
}

impl<T> Clone for RefWeak<'_, T> {
    fn clone(&self) -> Self {
        let inner = self.inner();
        inner.weak.set(inner.weak.get() + 1);
        Self::from_block(self.block)
    }
}

impl<T> Drop for RefWeak<'_, T> {
    fn drop(&mut self) {
        // SAFETY: this owner holds one weak reference
        unsafe { ControlBlock::release_weak(self.block) }
    }
}

impl<T> fmt::Debug for RefWeak<'_, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("(RefWeak)")
    }
}

/// Sole owner of a `T` allocated from an [`Allocator`]
pub struct RefUnique<'a, T> {
    block: NonNull<ControlBlock<'a, T>>,
    _owns: PhantomData<ControlBlock<'a, T>>,
}

impl<'a, T> RefUnique<'a, T> {
    pub fn new_in(value: T, allocator: &'a dyn Allocator) -> Result<Self> {
        Ok(Self {
            block: ControlBlock::create(value, allocator, true)?,
            _owns: PhantomData,
        })
    }

    fn inner(&self) -> &ControlBlock<'a, T> {
        // SAFETY: the owner keeps the block allocated
        unsafe { self.block.as_ref() }
    }

    /// Observer that can be promoted once this owner is shared
    pub fn downgrade(this: &Self) -> RefWeak<'a, T> {
        let inner = this.inner();
        inner.weak.set(inner.weak.get() + 1);
        RefWeak::from_block(this.block)
    }

    /// Give up exclusivity, keeping the same allocation
    pub fn into_shared(this: Self) -> RefShared<'a, T> {
        this.inner().unique.set(false);
        let block = this.block;
        mem::forget(this);
        RefShared::from_block(block)
    }

    /// Move the value out, returning the block to its allocator
    pub fn into_inner(this: Self) -> T {
        let block = this.block;
        mem::forget(this);
        // SAFETY: sole strong owner; the value is read exactly once before
        // the count drops to zero without running its destructor
        unsafe {
            let inner = block.as_ref();
            let value = ptr::read(inner.value_ptr());
            inner.strong.set(0);
            ControlBlock::release_weak(block);
            value
        }
    }

    pub fn allocator(this: &Self) -> &'a dyn Allocator {
        this.inner().allocator
    }
}

impl<T> Deref for RefUnique<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        // SAFETY: initialized while the unique owner lives
        unsafe { &*self.inner().value_ptr() }
    }
}

impl<T> DerefMut for RefUnique<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        // SAFETY: weak owners cannot promote while unique is set
        unsafe { &mut *self.inner().value_ptr() }
    }
}

impl<T> Drop for RefUnique<'_, T> {
    fn drop(&mut self) {
        // SAFETY: the unique owner holds the only strong reference
        unsafe { ControlBlock::release_strong(self.block) }
    }
}

impl<T: fmt::Debug> fmt::Debug for RefUnique<'_, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&**self, f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::os::Backing;
    use crate::MemoryPool;
    use std::rc::Rc;

    struct Tally(Rc<Cell<usize>>);

    impl Drop for Tally {
        fn drop(&mut self) {
            self.0.set(self.0.get() + 1);
        }
    }

    fn pool() -> MemoryPool {
        MemoryPool::with_backing(16 * 1024, Backing::Heap).unwrap()
    }

    #[test]
    fn test_copies_destroy_once() {
        let pool = pool();
        let drops = Rc::new(Cell::new(0));

        let first = pool.new_shared(Tally(drops.clone())).unwrap();
        let copies: Vec<_> = (0..8).map(|_| first.clone()).collect();
        assert_eq!(RefShared::strong_count(&first), 9);

        drop(copies);
        assert_eq!(drops.get(), 0);
        drop(first);
        assert_eq!(drops.get(), 1);
        assert_eq!(pool.used(), 0);
    }

    #[test]
    fn test_weak_lock() {
        let pool = pool();
        let shared = pool.new_shared(String::from("engine")).unwrap();
        let weak = RefShared::downgrade(&shared);
        assert_eq!(RefShared::weak_count(&shared), 1);

        let promoted = weak.lock().unwrap();
        assert!(RefShared::ptr_eq(&shared, &promoted));
        assert_eq!(*promoted, "engine");

        drop(shared);
        drop(promoted);
        assert!(weak.expired());
        assert!(weak.lock().is_none());

        // The block outlives the value until the last weak owner goes
        assert!(pool.used() > 0);
        drop(weak);
        assert_eq!(pool.used(), 0);
    }

    #[test]
    fn test_get_mut_requires_sole_owner() {
        let pool = pool();
        let mut shared = pool.new_shared(1u32).unwrap();
        *RefShared::get_mut(&mut shared).unwrap() = 2;

        let weak = RefShared::downgrade(&shared);
        assert!(RefShared::get_mut(&mut shared).is_none());
        drop(weak);
        assert_eq!(*shared, 2);
    }

    #[test]
    fn test_unique_into_shared() {
        let pool = pool();
        let mut unique = pool.new_unique(vec![1, 2, 3]).unwrap();
        unique.push(4);

        let weak = RefUnique::downgrade(&unique);
        assert!(weak.lock().is_none());
        assert!(!weak.expired());

        let shared = RefUnique::into_shared(unique);
        assert_eq!(weak.lock().unwrap().len(), 4);
        assert_eq!(RefShared::strong_count(&shared), 1);
    }

    #[test]
    fn test_unique_into_inner() {
        let pool = pool();
        let unique = pool.new_unique(String::from("moved")).unwrap();
        let weak = RefUnique::downgrade(&unique);

        assert_eq!(RefUnique::into_inner(unique), "moved");
        assert!(weak.expired());
        drop(weak);
        assert_eq!(pool.used(), 0);
    }

    #[test]
    fn test_out_of_memory() {
        let pool = pool();
        let result = pool.new_shared([0u8; 64 * 1024]);
        assert!(matches!(result, Err(crate::MemoryError::OutOfMemory { .. })));
    }
}
