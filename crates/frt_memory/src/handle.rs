//! Allocator-cooperative memory handles
//!
//! Every copy of a [`MemoryHandle`] is registered with the
//! [`RefCountingAllocator`] that produced the memory. Dropping a handle gives
//! up its reference and frees the allocation once nobody is left;
//! [`MemoryHandle::release`] frees immediately and leaves every sibling
//! handle stale.
//!
//! Access goes through borrow guards checked at runtime, so a forced release
//! can never pull memory out from under a live reference.

use core::fmt;
use core::mem;
use core::ops::{Deref, DerefMut};
use core::ptr::{self, NonNull};

use frt_core::{Handle, HandleError};

use crate::error::{MemoryError, Result};
use crate::ref_counting::{DropFn, RefCountingAllocator, Release, Tracked};

unsafe fn drop_value<T>(ptr: NonNull<u8>, _len: usize) {
    ptr::drop_in_place(ptr.cast::<T>().as_ptr());
}

unsafe fn drop_slice<T>(ptr: NonNull<u8>, len: usize) {
    ptr::drop_in_place(ptr::slice_from_raw_parts_mut(ptr.cast::<T>().as_ptr(), len));
}

/// Shared handle to memory owned by a [`RefCountingAllocator`]
pub struct MemoryHandle<'a, T: ?Sized> {
    allocator: &'a RefCountingAllocator,
    slot: Handle<Tracked>,
    /// `None` for null and moved-from handles
    ptr: Option<NonNull<T>>,
}

/// Handle to a contiguous array of `T`
pub type ArrayHandle<'a, T> = MemoryHandle<'a, [T]>;

impl<'a, T> MemoryHandle<'a, T> {
    /// Move `value` into the allocator and return the first handle to it
    pub fn new_in(allocator: &'a RefCountingAllocator, value: T) -> Result<Self> {
        let raw = allocator.allocate(mem::size_of::<T>(), mem::align_of::<T>())?;
        let ptr = raw.cast::<T>();
        // SAFETY: freshly allocated with T's size and alignment
        unsafe { ptr.as_ptr().write(value) };

        let drop_fn = mem::needs_drop::<T>().then_some(drop_value::<T> as DropFn);
        // SAFETY: drop_fn matches the payload written above
        let slot = unsafe { allocator.track(raw, 1, drop_fn)? };
        Ok(Self {
            allocator,
            slot,
            ptr: Some(ptr),
        })
    }
}

impl<'a, T> MemoryHandle<'a, [T]> {
    /// Move the items of `iter` into one allocation
    pub fn from_iter_in<I>(allocator: &'a RefCountingAllocator, iter: I) -> Result<Self>
    where
        I: IntoIterator<Item = T>,
    {
        let mut items: Vec<T> = iter.into_iter().collect();
        let len = items.len();
        let bytes = mem::size_of::<T>()
            .checked_mul(len)
            .ok_or(MemoryError::InvalidSize(usize::MAX))?;
        let raw = allocator.allocate(bytes, mem::align_of::<T>())?;
        let elements = raw.cast::<T>();

        // SAFETY: the allocation holds `len` elements; ownership moves out of the Vec
        unsafe {
            ptr::copy_nonoverlapping(items.as_ptr(), elements.as_ptr(), len);
            items.set_len(0);
        }

        let drop_fn = mem::needs_drop::<T>().then_some(drop_slice::<T> as DropFn);
        // SAFETY: drop_fn matches the `len` elements moved in above
        let slot = unsafe { allocator.track(raw, len, drop_fn)? };
        Ok(Self {
            allocator,
            slot,
            ptr: Some(NonNull::slice_from_raw_parts(elements, len)),
        })
    }

    /// `len` clones of `value`
    pub fn filled_in(allocator: &'a RefCountingAllocator, len: usize, value: T) -> Result<Self>
    where
        T: Clone,
    {
        Self::from_iter_in(allocator, core::iter::repeat(value).take(len))
    }
}

impl<'a, T: ?Sized> MemoryHandle<'a, T> {
    /// A handle that refers to nothing
    pub fn null(allocator: &'a RefCountingAllocator) -> Self {
        Self {
            allocator,
            slot: Handle::null(),
            ptr: None,
        }
    }

    /// Whether the handle still refers to live memory
    pub fn is_valid(&self) -> bool {
        self.ptr.is_some() && self.allocator.is_live(self.slot)
    }

    #[inline]
    pub fn is_null(&self) -> bool {
        self.ptr.is_none()
    }

    fn typed_ptr(&self) -> Result<NonNull<T>> {
        self.ptr.ok_or(MemoryError::Handle(HandleError::Null))
    }

    /// Borrow the value
    pub fn get(&self) -> Result<MemoryRef<'_, T>> {
        let ptr = self.typed_ptr()?;
        self.allocator.begin_borrow(self.slot, false)?;
        Ok(MemoryRef {
            allocator: self.allocator,
            slot: self.slot,
            ptr,
        })
    }

    /// Borrow the value mutably; fails while any other guard is live
    pub fn get_mut(&mut self) -> Result<MemoryRefMut<'_, T>> {
        let ptr = self.typed_ptr()?;
        self.allocator.begin_borrow(self.slot, true)?;
        Ok(MemoryRefMut {
            allocator: self.allocator,
            slot: self.slot,
            ptr,
        })
    }

    /// Free the memory now, invalidating every sibling handle
    ///
    /// Releasing a null or already stale handle is a no-op. Fails with
    /// [`MemoryError::Borrowed`] while a guard on the memory is live.
    pub fn release(&mut self) -> Result<()> {
        if self.ptr.is_none() {
            return Ok(());
        }
        match self.allocator.remove_ref(self.slot, Release::Authority) {
            Ok(()) | Err(MemoryError::Handle(_)) => {
                self.clear();
                Ok(())
            }
            Err(err) => Err(err),
        }
    }

    /// Number of handles sharing the memory; zero once stale
    pub fn ref_count(&self) -> usize {
        if self.ptr.is_none() {
            return 0;
        }
        self.allocator.ref_count(self.slot).unwrap_or(0)
    }

    /// Move the reference out, leaving this handle null
    pub fn take(&mut self) -> Self {
        mem::replace(self, Self::null(self.allocator))
    }

    /// Whether both handles name the same allocation
    pub fn ptr_eq(&self, other: &Self) -> bool {
        self.ptr.is_some() && self.slot == other.slot
    }

    #[inline]
    pub fn allocator(&self) -> &'a RefCountingAllocator {
        self.allocator
    }

    fn clear(&mut self) {
        self.slot = Handle::null();
        self.ptr = None;
    }
}

impl<T: ?Sized> Clone for MemoryHandle<'_, T> {
    fn clone(&self) -> Self {
        if self.ptr.is_some() && self.allocator.add_ref(self.slot).is_ok() {
            return Self {
                allocator: self.allocator,
                slot: self.slot,
                ptr: self.ptr,
            };
        }
        Self::null(self.allocator)
    }
}

impl<T: ?Sized> Drop for MemoryHandle<'_, T> {
    fn drop(&mut self) {
        if self.ptr.is_none() {
            return;
        }
        // A stale slot means an authority release already freed the memory
        if let Err(err) = self.allocator.remove_ref(self.slot, Release::Scope) {
            if !matches!(err, MemoryError::Handle(_)) {
                log::warn!("Failed to release memory handle: {}", err);
            }
        }
    }
}

impl<T: ?Sized> fmt::Debug for MemoryHandle<'_, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryHandle")
            .field("slot", &self.slot)
            .field("valid", &self.is_valid())
            .field("refs", &self.ref_count())
            .finish()
    }
}

/// Shared borrow of a handle's memory
pub struct MemoryRef<'h, T: ?Sized> {
    allocator: &'h RefCountingAllocator,
    slot: Handle<Tracked>,
    ptr: NonNull<T>,
}

impl<T: ?Sized> Deref for MemoryRef<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        // SAFETY: the registered borrow keeps the allocation alive and unaliased by writers
        unsafe { self.ptr.as_ref() }
    }
}

impl<T: ?Sized> Drop for MemoryRef<'_, T> {
    fn drop(&mut self) {
        self.allocator.end_borrow(self.slot, false);
    }
}

/// Exclusive borrow of a handle's memory
pub struct MemoryRefMut<'h, T: ?Sized> {
    allocator: &'h RefCountingAllocator,
    slot: Handle<Tracked>,
    ptr: NonNull<T>,
}

impl<T: ?Sized> Deref for MemoryRefMut<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        // SAFETY: as for MemoryRef
        unsafe { self.ptr.as_ref() }
    }
}

impl<T: ?Sized> DerefMut for MemoryRefMut<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        // SAFETY: the exclusive borrow excludes every other guard
        unsafe { self.ptr.as_mut() }
    }
}

impl<T: ?Sized> Drop for MemoryRefMut<'_, T> {
    fn drop(&mut self) {
        self.allocator.end_borrow(self.slot, true);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;
    use std::rc::Rc;

    struct DropCounter(Rc<Cell<usize>>);

    impl Drop for DropCounter {
        fn drop(&mut self) {
            self.0.set(self.0.get() + 1);
        }
    }

    #[test]
    fn test_handle_copies_share_memory() {
        let alloc = RefCountingAllocator::new(4096).unwrap();
        let mut h1 = MemoryHandle::new_in(&alloc, 41u32).unwrap();
        let h2 = h1.clone();

        *h1.get_mut().unwrap() += 1;
        assert_eq!(*h2.get().unwrap(), 42);
        assert_eq!(h1.ref_count(), 2);
        assert!(h1.ptr_eq(&h2));
    }

    #[test]
    fn test_scope_release_frees_last() {
        let alloc = RefCountingAllocator::new(4096).unwrap();
        let drops = Rc::new(Cell::new(0));

        let h1 = MemoryHandle::new_in(&alloc, DropCounter(drops.clone())).unwrap();
        let h2 = h1.clone();
        drop(h1);
        assert_eq!(drops.get(), 0);
        assert!(h2.is_valid());

        drop(h2);
        assert_eq!(drops.get(), 1);
        assert_eq!(alloc.stats().used, 0);
    }

    #[test]
    fn test_release_nulls_siblings() {
        let alloc = RefCountingAllocator::new(4096).unwrap();
        let drops = Rc::new(Cell::new(0));

        let mut h1 = MemoryHandle::new_in(&alloc, DropCounter(drops.clone())).unwrap();
        let h2 = h1.clone();
        let h3 = h2.clone();

        h1.release().unwrap();
        assert_eq!(drops.get(), 1);
        assert!(h1.is_null());
        assert!(!h2.is_valid());
        assert!(matches!(
            h3.get(),
            Err(MemoryError::Handle(HandleError::Stale))
        ));

        // Dropping the stale siblings neither double-drops nor double-frees
        drop(h2);
        drop(h3);
        assert_eq!(drops.get(), 1);
        assert_eq!(alloc.stats().used, 0);
    }

    #[test]
    fn test_release_refused_while_borrowed() {
        let alloc = RefCountingAllocator::new(4096).unwrap();
        let mut h1 = MemoryHandle::new_in(&alloc, 5i64).unwrap();
        let h2 = h1.clone();

        {
            let value = h2.get().unwrap();
            assert!(matches!(h1.release(), Err(MemoryError::Borrowed)));
            assert_eq!(*value, 5);
        }
        h1.release().unwrap();
        assert!(!h2.is_valid());
    }

    #[test]
    fn test_take_leaves_null() {
        let alloc = RefCountingAllocator::new(4096).unwrap();
        let mut h1 = MemoryHandle::new_in(&alloc, 1u8).unwrap();
        let h2 = h1.take();

        assert!(h1.is_null());
        assert!(matches!(h1.get(), Err(MemoryError::Handle(HandleError::Null))));
        assert_eq!(h2.ref_count(), 1);

        let null_copy = h1.clone();
        assert!(null_copy.is_null());
    }

    #[test]
    fn test_array_handle() {
        let alloc = RefCountingAllocator::new(4096).unwrap();
        let mut arr: ArrayHandle<'_, u16> = MemoryHandle::from_iter_in(&alloc, 0..10u16).unwrap();

        assert_eq!(arr.get().unwrap().len(), 10);
        arr.get_mut().unwrap()[3] = 99;
        assert_eq!(arr.get().unwrap()[3], 99);

        let filled = ArrayHandle::filled_in(&alloc, 4, String::from("x")).unwrap();
        assert_eq!(filled.get().unwrap().concat(), "xxxx");
    }

    #[test]
    fn test_array_drops_every_element() {
        let alloc = RefCountingAllocator::new(4096).unwrap();
        let drops = Rc::new(Cell::new(0));

        let arr: ArrayHandle<'_, DropCounter> =
            MemoryHandle::from_iter_in(&alloc, (0..3).map(|_| DropCounter(drops.clone()))).unwrap();
        drop(arr);
        assert_eq!(drops.get(), 3);
    }
}
