//! Reference-counting allocator - first-fit allocation with external handle tracking
//!
//! Allocations carry a small header recording the block they were carved
//! from; free space is kept as an ordered map of free intervals that is
//! coalesced on every reclaim. Reference counts do not live inside the
//! allocation: handles register with the allocator, which keeps one
//! generational slot per tracked allocation. Removing a slot stales every
//! handle that still names it.

use std::collections::{BTreeMap, BTreeSet};
use std::mem;
use std::ptr::{self, NonNull};

use frt_core::{Handle, HandleMap};
use parking_lot::Mutex;

use crate::address::{checked_align_up, is_aligned};
use crate::error::{MemoryError, Result};
use crate::os::{Backing, Region};
use crate::Allocator;

/// Granularity of blocks and minimum payload alignment
pub const ALIGNMENT_SIZE: usize = 8;

/// Precedes every payload
#[repr(C)]
#[derive(Clone, Copy, Debug)]
struct BlockHeader {
    /// Offset of the block start within the region
    block_start: usize,
    /// Bytes reserved for the block, header and padding included
    block_len: usize,
}

const HEADER_SIZE: usize = mem::size_of::<BlockHeader>();

/// How a handle gives up its reference
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Release {
    /// Explicit release: free now and stale every sibling handle
    Authority,
    /// Scope exit: free only when this was the last reference
    Scope,
}

/// Destroys the payload of a tracked allocation in place
pub type DropFn = unsafe fn(NonNull<u8>, usize);

/// Bookkeeping for one tracked allocation
pub struct Tracked {
    offset: usize,
    /// Element count handed back to `drop_fn`
    len: usize,
    refs: usize,
    /// Live borrow guards: positive for shared, -1 for exclusive
    borrow: isize,
    drop_fn: Option<DropFn>,
}

struct State {
    used: usize,
    /// Free intervals: offset -> length
    free: BTreeMap<usize, usize>,
    /// Payload offsets of live allocations
    live: BTreeSet<usize>,
    tracked: HandleMap<Tracked>,
    by_address: BTreeMap<usize, Handle<Tracked>>,
}

/// Allocation statistics
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RefCountingStats {
    pub capacity: usize,
    pub used: usize,
    pub live_allocations: usize,
    pub free_intervals: usize,
    pub largest_free_interval: usize,
    pub tracked: usize,
}

/// Allocator cooperating with [`MemoryHandle`](crate::MemoryHandle)
pub struct RefCountingAllocator {
    region: Region,
    state: Mutex<State>,
}

// Safety: all mutable state sits behind the mutex; the region is owned
unsafe impl Send for RefCountingAllocator {}
unsafe impl Sync for RefCountingAllocator {}

impl RefCountingAllocator {
    /// Create an allocator over `capacity` bytes of heap memory
    pub fn new(capacity: usize) -> Result<Self> {
        let region = Region::reserve(capacity, Backing::Heap)?;
        let mut free = BTreeMap::new();
        free.insert(0, region.len());

        log::debug!("Created ref-counting allocator: {} bytes", region.len());
        Ok(Self {
            region,
            state: Mutex::new(State {
                used: 0,
                free,
                live: BTreeSet::new(),
                tracked: HandleMap::new(),
                by_address: BTreeMap::new(),
            }),
        })
    }

    #[inline]
    fn base(&self) -> *mut u8 {
        self.region.as_ptr().as_ptr()
    }

    #[inline]
    fn payload_at(&self, offset: usize) -> NonNull<u8> {
        // SAFETY: offsets handed out by this allocator lie inside the region
        unsafe { NonNull::new_unchecked(self.base().add(offset)) }
    }

    fn offset_of(&self, ptr: NonNull<u8>) -> Result<usize> {
        let addr = ptr.as_ptr() as usize;
        if !self.region.contains(ptr.as_ptr()) || !is_aligned(ptr.as_ptr(), ALIGNMENT_SIZE) {
            return Err(MemoryError::ForeignPointer(addr));
        }
        Ok(addr - self.base() as usize)
    }

    /// Allocate `size` zeroed bytes aligned to `align` (at least 8)
    ///
    /// Scans the free intervals in address order and takes the first that
    /// fits header, padding and payload.
    pub fn allocate(&self, size: usize, align: usize) -> Result<NonNull<u8>> {
        if !align.is_power_of_two() {
            return Err(MemoryError::InvalidAlignment(align));
        }
        let align = align.max(ALIGNMENT_SIZE);
        let base = self.base() as usize;
        let mut state = self.state.lock();

        // Every step is checked: an overflowing request must not wrap into a fit
        let fit = state.free.iter().find_map(|(&start, &len)| {
            let payload = checked_align_up(base + start + HEADER_SIZE, align)? - base;
            let end = payload.checked_add(size)?;
            let block_len = checked_align_up(end - start, ALIGNMENT_SIZE)?;
            (block_len <= len).then_some((start, len, payload, block_len))
        });
        let (start, len, payload, block_len) =
            fit.ok_or(MemoryError::OutOfMemory { requested: size })?;

        state.free.remove(&start);
        if len > block_len {
            state.free.insert(start + block_len, len - block_len);
        }
        state.live.insert(payload);
        state.used += block_len;

        // SAFETY: [start, start + block_len) was a free interval of the region
        unsafe {
            ptr::write_bytes(self.base().add(start), 0, block_len);
            let header = self.base().add(payload - HEADER_SIZE).cast::<BlockHeader>();
            header.write(BlockHeader { block_start: start, block_len });
        }

        let ptr = self.payload_at(payload);
        log::trace!("Ref-counting allocator reserved {} bytes at {:p}", block_len, ptr);
        Ok(ptr)
    }

    /// Free an untracked allocation
    ///
    /// Allocations still owned by handles are refused with
    /// [`MemoryError::StillReferenced`]; release the handles instead.
    ///
    /// # Safety
    /// The payload must not be used afterwards.
    pub unsafe fn free(&self, ptr: NonNull<u8>) -> Result<()> {
        let offset = self.offset_of(ptr)?;
        let mut state = self.state.lock();
        self.check_untracked(&state, offset)?;
        self.reclaim(&mut state, offset)
    }

    /// Drop the `T` at `ptr` in place, then free it
    ///
    /// # Safety
    /// `ptr` must hold an initialized `T` allocated here and not used afterwards.
    pub unsafe fn free_typed<T>(&self, ptr: NonNull<T>) -> Result<()> {
        let raw = ptr.cast::<u8>();
        let offset = self.offset_of(raw)?;
        {
            let state = self.state.lock();
            self.check_untracked(&state, offset)?;
        }
        ptr::drop_in_place(ptr.as_ptr());
        let mut state = self.state.lock();
        self.reclaim(&mut state, offset)
    }

    /// Resize an untracked allocation, moving it to a fresh block
    ///
    /// # Safety
    /// `ptr` must come from this allocator and must not be used afterwards.
    pub unsafe fn reallocate(&self, ptr: NonNull<u8>, new_size: usize) -> Result<NonNull<u8>> {
        let offset = self.offset_of(ptr)?;
        let old_capacity = {
            let state = self.state.lock();
            self.check_untracked(&state, offset)?;
            let header = self.header(offset);
            header.block_start + header.block_len - offset
        };

        let fresh = self.allocate(new_size, ALIGNMENT_SIZE)?;
        ptr::copy_nonoverlapping(ptr.as_ptr(), fresh.as_ptr(), old_capacity.min(new_size));

        let mut state = self.state.lock();
        self.reclaim(&mut state, offset)?;
        Ok(fresh)
    }

    /// Start tracking an allocation on behalf of a first handle
    ///
    /// Tracking an already tracked allocation adds a reference to it.
    ///
    /// # Safety
    /// `drop_fn`, when given, must be valid for the payload and `len`.
    pub unsafe fn track(
        &self,
        ptr: NonNull<u8>,
        len: usize,
        drop_fn: Option<DropFn>,
    ) -> Result<Handle<Tracked>> {
        let offset = self.offset_of(ptr)?;
        let mut state = self.state.lock();
        if !state.live.contains(&offset) {
            return Err(MemoryError::ForeignPointer(ptr.as_ptr() as usize));
        }
        if let Some(&slot) = state.by_address.get(&offset) {
            state.tracked.get_mut(slot)?.refs += 1;
            return Ok(slot);
        }

        let slot = state.tracked.insert(Tracked {
            offset,
            len,
            refs: 1,
            borrow: 0,
            drop_fn,
        });
        state.by_address.insert(offset, slot);
        Ok(slot)
    }

    /// Register one more handle for a tracked allocation
    pub fn add_ref(&self, slot: Handle<Tracked>) -> Result<()> {
        self.state.lock().tracked.get_mut(slot)?.refs += 1;
        Ok(())
    }

    /// Give up one handle's reference
    ///
    /// `Release::Scope` frees only when no reference remains.
    /// `Release::Authority` frees immediately and every other handle on the
    /// allocation reads back as stale afterwards.
    pub fn remove_ref(&self, slot: Handle<Tracked>, release: Release) -> Result<()> {
        let entry = {
            let mut state = self.state.lock();
            let entry = state.tracked.get_mut(slot)?;
            match release {
                Release::Scope => {
                    entry.refs -= 1;
                    if entry.refs > 0 {
                        return Ok(());
                    }
                }
                Release::Authority => {
                    if entry.borrow != 0 {
                        return Err(MemoryError::Borrowed);
                    }
                    if entry.refs > 1 {
                        log::debug!(
                            "Authority release at offset {} invalidates {} sibling handle(s)",
                            entry.offset,
                            entry.refs - 1
                        );
                    }
                }
            }
            let entry = state.tracked.remove(slot)?;
            state.by_address.remove(&entry.offset);
            entry
        };

        // The payload destructor may re-enter the allocator, so the lock is released here
        if let Some(drop_fn) = entry.drop_fn {
            // SAFETY: registered by track() for exactly this payload
            unsafe { drop_fn(self.payload_at(entry.offset), entry.len) };
        }

        let mut state = self.state.lock();
        self.reclaim(&mut state, entry.offset)
    }

    /// Number of handles registered for a slot
    pub fn ref_count(&self, slot: Handle<Tracked>) -> Result<usize> {
        Ok(self.state.lock().tracked.get(slot)?.refs)
    }

    /// Whether the slot still names a live allocation
    pub fn is_live(&self, slot: Handle<Tracked>) -> bool {
        self.state.lock().tracked.contains(slot)
    }

    /// Payload of a tracked allocation, counted as a live borrow
    pub(crate) fn begin_borrow(
        &self,
        slot: Handle<Tracked>,
        exclusive: bool,
    ) -> Result<NonNull<u8>> {
        let mut state = self.state.lock();
        let entry = state.tracked.get_mut(slot)?;
        match (exclusive, entry.borrow) {
            (false, b) if b >= 0 => entry.borrow += 1,
            (true, 0) => entry.borrow = -1,
            _ => return Err(MemoryError::Borrowed),
        }
        let offset = entry.offset;
        drop(state);
        Ok(self.payload_at(offset))
    }

    pub(crate) fn end_borrow(&self, slot: Handle<Tracked>, exclusive: bool) {
        let mut state = self.state.lock();
        // Authority release refuses borrowed slots, so the entry is still here
        if let Ok(entry) = state.tracked.get_mut(slot) {
            if exclusive {
                entry.borrow = 0;
            } else {
                entry.borrow -= 1;
            }
        }
    }

    pub fn stats(&self) -> RefCountingStats {
        let state = self.state.lock();
        RefCountingStats {
            capacity: self.region.len(),
            used: state.used,
            live_allocations: state.live.len(),
            free_intervals: state.free.len(),
            largest_free_interval: state.free.values().copied().max().unwrap_or(0),
            tracked: state.tracked.len(),
        }
    }

    fn check_untracked(&self, state: &State, offset: usize) -> Result<()> {
        if !state.live.contains(&offset) {
            return Err(MemoryError::DoubleFree(self.base() as usize + offset));
        }
        if let Some(&slot) = state.by_address.get(&offset) {
            let refs = state.tracked.get(slot).map(|t| t.refs).unwrap_or(0);
            return Err(MemoryError::StillReferenced(self.base() as usize + offset, refs));
        }
        Ok(())
    }

    fn header(&self, offset: usize) -> BlockHeader {
        // SAFETY: live payloads are always preceded by their header
        unsafe {
            self.base()
                .add(offset - HEADER_SIZE)
                .cast::<BlockHeader>()
                .read()
        }
    }

    /// Return a live block to the free intervals, merging with its neighbours
    fn reclaim(&self, state: &mut State, offset: usize) -> Result<()> {
        if !state.live.remove(&offset) {
            return Err(MemoryError::DoubleFree(self.base() as usize + offset));
        }
        let BlockHeader {
            mut block_start,
            mut block_len,
        } = self.header(offset);
        state.used -= block_len;

        if let Some((&prev_start, &prev_len)) = state.free.range(..block_start).next_back() {
            if prev_start + prev_len == block_start {
                state.free.remove(&prev_start);
                block_start = prev_start;
                block_len += prev_len;
            }
        }
        if let Some(next_len) = state.free.remove(&(block_start + block_len)) {
            block_len += next_len;
        }
        state.free.insert(block_start, block_len);
        Ok(())
    }
}

impl Allocator for RefCountingAllocator {
    fn allocate(&self, size: usize, align: usize) -> Result<NonNull<u8>> {
        RefCountingAllocator::allocate(self, size, align)
    }

    unsafe fn reallocate(&self, ptr: NonNull<u8>, new_size: usize) -> Result<NonNull<u8>> {
        RefCountingAllocator::reallocate(self, ptr, new_size)
    }

    unsafe fn deallocate(&self, ptr: NonNull<u8>) -> Result<()> {
        self.free(ptr)
    }

    fn capacity(&self) -> usize {
        self.region.len()
    }

    fn used(&self) -> usize {
        self.state.lock().used
    }
}

impl Drop for RefCountingAllocator {
    fn drop(&mut self) {
        let state = self.state.get_mut();
        if !state.live.is_empty() {
            log::warn!(
                "Ref-counting allocator dropped with {} live allocation(s), {} bytes",
                state.live.len(),
                state.used
            );
        }
    }
}
