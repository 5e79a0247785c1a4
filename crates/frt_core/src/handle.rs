//! Generational handles for slab-owned resources
//!
//! A [`Handle`] is an index into a slab plus the generation the slot had when
//! the handle was issued. Removing a value bumps the slot generation, so every
//! outstanding copy of the old handle turns stale at once instead of aliasing
//! whatever is stored there next.

use core::fmt;
use core::hash::{Hash, Hasher};
use core::marker::PhantomData;
use alloc::vec::Vec;

use crate::error::HandleError;

/// A type-safe generational index into a [`HandleMap<T>`]
#[repr(transparent)]
pub struct Handle<T> {
    /// Lower 32 bits: index, Upper 32 bits: generation
    bits: u64,
    _marker: PhantomData<*const T>,
}

impl<T> Handle<T> {
    /// Create a handle from index and generation
    #[inline]
    pub const fn new(index: u32, generation: u32) -> Self {
        Self {
            bits: (generation as u64) << 32 | index as u64,
            _marker: PhantomData,
        }
    }

    /// The null handle never resolves in any map
    #[inline]
    pub const fn null() -> Self {
        Self {
            bits: u64::MAX,
            _marker: PhantomData,
        }
    }

    #[inline]
    pub const fn is_null(&self) -> bool {
        self.bits == u64::MAX
    }

    #[inline]
    pub const fn index(&self) -> u32 {
        self.bits as u32
    }

    #[inline]
    pub const fn generation(&self) -> u32 {
        (self.bits >> 32) as u32
    }

    #[inline]
    pub const fn to_bits(&self) -> u64 {
        self.bits
    }
}

// Manual trait implementations to avoid T bounds
impl<T> Clone for Handle<T> {
    #[inline]
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for Handle<T> {}

impl<T> PartialEq for Handle<T> {
    #[inline]
    fn eq(&self, other: &Self) -> bool {
        self.bits == other.bits
    }
}

impl<T> Eq for Handle<T> {}

impl<T> Hash for Handle<T> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.bits.hash(state);
    }
}

impl<T> fmt::Debug for Handle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_null() {
            write!(f, "Handle<{}>(null)", core::any::type_name::<T>())
        } else {
            write!(
                f,
                "Handle<{}>({}v{})",
                core::any::type_name::<T>(),
                self.index(),
                self.generation()
            )
        }
    }
}

impl<T> Default for Handle<T> {
    fn default() -> Self {
        Self::null()
    }
}

struct Slot<T> {
    generation: u32,
    value: Option<T>,
}

/// Slab of values addressed by generational handles
pub struct HandleMap<T> {
    slots: Vec<Slot<T>>,
    /// Vacant slot indices, reused LIFO
    free_list: Vec<u32>,
    len: usize,
}

impl<T> HandleMap<T> {
    pub fn new() -> Self {
        Self::with_capacity(0)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            slots: Vec::with_capacity(capacity),
            free_list: Vec::new(),
            len: 0,
        }
    }

    /// Insert a value and get a handle to it
    pub fn insert(&mut self, value: T) -> Handle<T> {
        self.len += 1;
        if let Some(index) = self.free_list.pop() {
            let slot = &mut self.slots[index as usize];
            debug_assert!(slot.value.is_none());
            slot.value = Some(value);
            return Handle::new(index, slot.generation);
        }

        let index = u32::try_from(self.slots.len()).expect("handle map exhausted");
        self.slots.push(Slot {
            generation: 0,
            value: Some(value),
        });
        Handle::new(index, 0)
    }

    /// Classify a handle without touching the value
    pub fn validate(&self, handle: Handle<T>) -> Result<(), HandleError> {
        if handle.is_null() {
            return Err(HandleError::Null);
        }
        let slot = self
            .slots
            .get(handle.index() as usize)
            .ok_or(HandleError::OutOfBounds)?;
        if slot.generation != handle.generation() || slot.value.is_none() {
            return Err(HandleError::Stale);
        }
        Ok(())
    }

    /// Remove a value, invalidating every copy of `handle`
    pub fn remove(&mut self, handle: Handle<T>) -> Result<T, HandleError> {
        self.validate(handle)?;
        let slot = &mut self.slots[handle.index() as usize];
        let value = slot.value.take().ok_or(HandleError::Stale)?;
        slot.generation = slot.generation.wrapping_add(1);
        self.free_list.push(handle.index());
        self.len -= 1;
        Ok(value)
    }

    pub fn get(&self, handle: Handle<T>) -> Result<&T, HandleError> {
        self.validate(handle)?;
        self.slots[handle.index() as usize]
            .value
            .as_ref()
            .ok_or(HandleError::Stale)
    }

    pub fn get_mut(&mut self, handle: Handle<T>) -> Result<&mut T, HandleError> {
        self.validate(handle)?;
        self.slots[handle.index() as usize]
            .value
            .as_mut()
            .ok_or(HandleError::Stale)
    }

    #[inline]
    pub fn contains(&self, handle: Handle<T>) -> bool {
        self.validate(handle).is_ok()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Iterate over all live handles and values
    pub fn iter(&self) -> impl Iterator<Item = (Handle<T>, &T)> {
        self.slots.iter().enumerate().filter_map(|(i, slot)| {
            slot.value
                .as_ref()
                .map(|v| (Handle::new(i as u32, slot.generation), v))
        })
    }
}

impl<T> Default for HandleMap<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_removed_handle_goes_stale() {
        let mut map: HandleMap<u32> = HandleMap::new();
        let h1 = map.insert(7);
        let alias = h1;

        assert_eq!(map.remove(h1), Ok(7));
        assert_eq!(map.get(alias), Err(HandleError::Stale));
        assert!(map.is_empty());
    }

    #[test]
    fn test_slot_reuse_bumps_generation() {
        let mut map: HandleMap<&str> = HandleMap::new();
        let h1 = map.insert("hello");
        map.remove(h1).unwrap();

        let h2 = map.insert("world");
        assert_eq!(h2.index(), h1.index());
        assert_ne!(h2.generation(), h1.generation());
        assert_eq!(map.get(h2), Ok(&"world"));
        assert!(!map.contains(h1));
    }

    #[test]
    fn test_null_and_out_of_bounds() {
        let map: HandleMap<u8> = HandleMap::new();
        assert_eq!(map.validate(Handle::null()), Err(HandleError::Null));
        assert_eq!(map.validate(Handle::new(3, 0)), Err(HandleError::OutOfBounds));
    }

    #[test]
    fn test_iter_skips_vacant_slots() {
        let mut map = HandleMap::new();
        let a = map.insert(1);
        let _b = map.insert(2);
        map.remove(a).unwrap();

        let values: Vec<_> = map.iter().map(|(_, v)| *v).collect();
        assert_eq!(values, vec![2]);
        assert_eq!(map.len(), 1);
    }
}
