//! Two-Level Segregated Fit allocator
//!
//! Free blocks are binned by size into `FL_INDEX_COUNT` power-of-two classes,
//! each split into `SL_INDEX_COUNT` linear sub-classes. A first-level bitmap
//! marks non-empty classes and one second-level bitmap per class marks
//! non-empty sub-classes, so finding a good-fit block is two bit scans.
//!
//! Block layout (one machine word per field):
//!
//! ```text
//!   +-----------------+
//!   | prev_phys_block |  lives in the tail of the previous block's payload
//!   +-----------------+
//!   | size | flags    |  the only per-block overhead of a used block
//!   +-----------------+  <- payload pointer handed to callers
//!   | next_free       |  only meaningful while the block is free
//!   | prev_free       |
//!   +-----------------+
//! ```
//!
//! Sizes are multiples of `ALIGN_SIZE`, so the two low bits of `size` carry
//! the free flag of the block and of its physical predecessor. Every pool
//! ends in a zero-sized used sentinel block.

use core::mem;
use core::ptr::{self, NonNull};

use crate::address::{align_down, align_ptr, align_up, ffs, fls, is_aligned};
use crate::error::{MemoryError, Result};

const SL_INDEX_COUNT_LOG2: u32 = 5;
const ALIGN_SIZE_LOG2: u32 = 3;
const FL_INDEX_MAX: u32 = 48;

/// Alignment of every payload and every block size
pub const ALIGN_SIZE: usize = 1 << ALIGN_SIZE_LOG2;

const SL_INDEX_COUNT: usize = 1 << SL_INDEX_COUNT_LOG2;
const FL_INDEX_SHIFT: u32 = SL_INDEX_COUNT_LOG2 + ALIGN_SIZE_LOG2;
const FL_INDEX_COUNT: usize = (FL_INDEX_MAX - FL_INDEX_SHIFT + 1) as usize;

/// Sizes below this share first-level bucket 0
pub const SMALL_BLOCK_SIZE: usize = 1 << FL_INDEX_SHIFT;

const BLOCK_FREE_BIT: usize = 1 << 0;
const BLOCK_PREV_FREE_BIT: usize = 1 << 1;
const BLOCK_FLAGS: usize = BLOCK_FREE_BIT | BLOCK_PREV_FREE_BIT;

#[repr(C)]
struct BlockHeader {
    prev_phys_block: *mut BlockHeader,
    size: usize,
    next_free: Option<NonNull<BlockHeader>>,
    prev_free: Option<NonNull<BlockHeader>>,
}

const WORD: usize = mem::size_of::<usize>();
const HEADER_SIZE: usize = mem::size_of::<BlockHeader>();

/// Only the size word is overhead on a used block
pub const BLOCK_HEADER_OVERHEAD: usize = WORD;
/// Offset from the header to the payload
const BLOCK_START_OFFSET: usize = 2 * WORD;
/// A free block must hold its list links and the successor's back-link
pub const BLOCK_SIZE_MIN: usize = HEADER_SIZE - WORD;
pub const BLOCK_SIZE_MAX: usize = 1 << FL_INDEX_MAX;
/// Bytes of every pool consumed by the first header and the sentinel
pub const POOL_OVERHEAD: usize = BLOCK_START_OFFSET + BLOCK_HEADER_OVERHEAD;

const _: () = assert!(ALIGN_SIZE == WORD);
const _: () = assert!(SL_INDEX_COUNT <= u32::BITS as usize);
const _: () = assert!(FL_INDEX_COUNT <= u64::BITS as usize);
const _: () = assert!(SMALL_BLOCK_SIZE / SL_INDEX_COUNT == ALIGN_SIZE);

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
struct Block(NonNull<BlockHeader>);

impl Block {
    #[inline]
    unsafe fn at(addr: *mut u8) -> Self {
        Block(NonNull::new_unchecked(addr.cast()))
    }

    #[inline]
    fn raw(self) -> *mut BlockHeader {
        self.0.as_ptr()
    }

    #[inline]
    unsafe fn from_payload(ptr: NonNull<u8>) -> Self {
        Self::at(ptr.as_ptr().sub(BLOCK_START_OFFSET))
    }

    #[inline]
    unsafe fn payload(self) -> NonNull<u8> {
        NonNull::new_unchecked(self.raw().cast::<u8>().add(BLOCK_START_OFFSET))
    }

    #[inline]
    unsafe fn size(self) -> usize {
        (*self.raw()).size & !BLOCK_FLAGS
    }

    #[inline]
    unsafe fn set_size(self, size: usize) {
        let header = self.raw();
        (*header).size = size | ((*header).size & BLOCK_FLAGS);
    }

    #[inline]
    unsafe fn is_last(self) -> bool {
        self.size() == 0
    }

    #[inline]
    unsafe fn is_free(self) -> bool {
        (*self.raw()).size & BLOCK_FREE_BIT != 0
    }

    #[inline]
    unsafe fn set_free(self) {
        (*self.raw()).size |= BLOCK_FREE_BIT;
    }

    #[inline]
    unsafe fn set_used(self) {
        (*self.raw()).size &= !BLOCK_FREE_BIT;
    }

    #[inline]
    unsafe fn is_prev_free(self) -> bool {
        (*self.raw()).size & BLOCK_PREV_FREE_BIT != 0
    }

    #[inline]
    unsafe fn set_prev_free(self) {
        (*self.raw()).size |= BLOCK_PREV_FREE_BIT;
    }

    #[inline]
    unsafe fn set_prev_used(self) {
        (*self.raw()).size &= !BLOCK_PREV_FREE_BIT;
    }

    /// Physical predecessor; only valid while it is free
    #[inline]
    unsafe fn prev(self) -> Block {
        debug_assert!(self.is_prev_free());
        Block(NonNull::new_unchecked((*self.raw()).prev_phys_block))
    }

    /// Physical successor
    #[inline]
    unsafe fn next(self) -> Block {
        debug_assert!(!self.is_last());
        Self::at(
            self.payload()
                .as_ptr()
                .add(self.size())
                .sub(BLOCK_HEADER_OVERHEAD),
        )
    }

    /// Successor, with its back-link pointed at us
    #[inline]
    unsafe fn link_next(self) -> Block {
        let next = self.next();
        (*next.raw()).prev_phys_block = self.raw();
        next
    }

    unsafe fn mark_as_free(self) {
        let next = self.link_next();
        next.set_prev_free();
        self.set_free();
    }

    unsafe fn mark_as_used(self) {
        let next = self.next();
        next.set_prev_used();
        self.set_used();
    }

    #[inline]
    unsafe fn can_split(self, size: usize) -> bool {
        self.size() >= HEADER_SIZE + size
    }

    /// Cut `self` down to `size` payload bytes and return the free remainder
    unsafe fn split(self, size: usize) -> Block {
        let remaining = Self::at(
            self.payload()
                .as_ptr()
                .add(size)
                .sub(BLOCK_HEADER_OVERHEAD),
        );
        let remain_size = self.size() - (size + BLOCK_HEADER_OVERHEAD);
        debug_assert!(remain_size >= BLOCK_SIZE_MIN);
        debug_assert!(is_aligned(remaining.payload().as_ptr(), ALIGN_SIZE));

        (*remaining.raw()).size = remain_size;
        self.set_size(size);
        remaining.mark_as_free();
        remaining
    }

    /// Fold `block` into its physical predecessor `self`
    unsafe fn absorb(self, block: Block) -> Block {
        debug_assert!(!self.is_last());
        (*self.raw()).size += block.size() + BLOCK_HEADER_OVERHEAD;
        self.link_next();
        self
    }
}

/// Map a size to its free-list bucket
#[inline]
fn mapping_insert(size: usize) -> (usize, usize) {
    if size < SMALL_BLOCK_SIZE {
        (0, size / (SMALL_BLOCK_SIZE / SL_INDEX_COUNT))
    } else {
        // size >= SMALL_BLOCK_SIZE so fls is at least FL_INDEX_SHIFT
        let fl = fls(size).unwrap_or(0);
        let sl = (size >> (fl - SL_INDEX_COUNT_LOG2)) ^ SL_INDEX_COUNT;
        ((fl - (FL_INDEX_SHIFT - 1)) as usize, sl)
    }
}

/// Map a request to the first bucket whose every block satisfies it
#[inline]
fn mapping_search(size: usize) -> (usize, usize) {
    if size >= SMALL_BLOCK_SIZE {
        let fl = fls(size).unwrap_or(0);
        let round = (1usize << (fl - SL_INDEX_COUNT_LOG2)) - 1;
        mapping_insert(size + round)
    } else {
        mapping_insert(size)
    }
}

/// Round a request to a valid block size; `None` for zero or oversized requests
#[inline]
fn adjust_request_size(size: usize, align: usize) -> Option<usize> {
    if size == 0 || size >= BLOCK_SIZE_MAX {
        return None;
    }
    let aligned = align_up(size, align);
    (aligned < BLOCK_SIZE_MAX).then(|| aligned.max(BLOCK_SIZE_MIN))
}

/// Identifies a pool registered with [`Tlsf::add_pool`]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct PoolId(NonNull<u8>);

impl PoolId {
    #[inline]
    pub fn as_ptr(&self) -> NonNull<u8> {
        self.0
    }
}

#[derive(Clone, Copy, Debug)]
struct PoolRange {
    start: usize,
    end: usize,
}

/// A physical block as seen by [`Tlsf::walk_pool`]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BlockInfo {
    /// Payload address
    pub ptr: NonNull<u8>,
    /// Usable payload bytes
    pub size: usize,
    pub used: bool,
}

/// Allocator statistics
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TlsfStats {
    /// Usable bytes across all pools
    pub pool_bytes: usize,
    pub used_bytes: usize,
    pub free_bytes: usize,
    pub free_blocks: usize,
    pub largest_free_block: usize,
}

/// A violated allocator invariant
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum IntegrityError {
    #[error("first-level bit {fl} disagrees with second-level bitmap {sl_bitmap:#x}")]
    FirstLevelBitmap { fl: usize, sl_bitmap: u32 },
    #[error("second-level bit ({fl}, {sl}) disagrees with its free-list head")]
    SecondLevelBitmap { fl: usize, sl: usize },
    #[error("block {addr:#x} in list ({fl}, {sl}) is not marked free")]
    NotFree { addr: usize, fl: usize, sl: usize },
    #[error("free block {addr:#x} has a free neighbour")]
    AdjacentFree { addr: usize },
    #[error("block {addr:#x} of size {size} sits in list ({fl}, {sl})")]
    WrongBucket { addr: usize, size: usize, fl: usize, sl: usize },
    #[error("block {addr:#x} prev-free flag disagrees with its predecessor")]
    PrevFreeFlag { addr: usize },
    #[error("block {addr:#x} has size {size} below the minimum")]
    Undersized { addr: usize, size: usize },
    #[error("free block {addr:#x} is not linked into any free list")]
    Unlisted { addr: usize },
}

/// TLSF control structure
///
/// Not synchronized; `MemoryPool` wraps it in a mutex.
pub struct Tlsf {
    fl_bitmap: u64,
    sl_bitmap: [u32; FL_INDEX_COUNT],
    blocks: [[Option<NonNull<BlockHeader>>; SL_INDEX_COUNT]; FL_INDEX_COUNT],
    pools: Vec<PoolRange>,
    used_bytes: usize,
}

// Safety: Tlsf only points into pools its owner hands over exclusively
unsafe impl Send for Tlsf {}

impl Tlsf {
    pub const fn new() -> Self {
        Self {
            fl_bitmap: 0,
            sl_bitmap: [0; FL_INDEX_COUNT],
            blocks: [[None; SL_INDEX_COUNT]; FL_INDEX_COUNT],
            pools: Vec::new(),
            used_bytes: 0,
        }
    }

    /// Carve a pool out of `bytes` bytes at `memory`
    ///
    /// # Safety
    /// The range must be valid for reads and writes, must not overlap any
    /// other pool, and must outlive its registration.
    pub unsafe fn add_pool(&mut self, memory: NonNull<u8>, bytes: usize) -> Result<PoolId> {
        let addr = memory.as_ptr() as usize;
        if !is_aligned(memory.as_ptr(), ALIGN_SIZE) {
            return Err(MemoryError::Misaligned(addr, ALIGN_SIZE));
        }

        let pool_bytes = align_down(bytes.saturating_sub(POOL_OVERHEAD), ALIGN_SIZE);
        if pool_bytes < BLOCK_SIZE_MIN {
            return Err(MemoryError::PoolTooSmall {
                usable: pool_bytes,
                minimum: BLOCK_SIZE_MIN,
            });
        }
        if pool_bytes >= BLOCK_SIZE_MAX {
            return Err(MemoryError::PoolTooLarge {
                usable: pool_bytes,
                maximum: BLOCK_SIZE_MAX,
            });
        }

        // The first header's prev_phys_block word is never read: its
        // prev-free flag stays clear.
        let block = Block::at(memory.as_ptr());
        (*block.raw()).size = pool_bytes;
        block.set_free();
        block.set_prev_used();
        self.insert_block(block);

        let sentinel = block.link_next();
        (*sentinel.raw()).size = 0;
        sentinel.set_used();
        sentinel.set_prev_free();

        self.pools.push(PoolRange {
            start: addr,
            end: addr + BLOCK_START_OFFSET + pool_bytes,
        });
        log::trace!("Added TLSF pool of {} usable bytes at {:#x}", pool_bytes, addr);
        Ok(PoolId(memory))
    }

    /// Unregister a pool that has no live allocations
    pub fn remove_pool(&mut self, pool: PoolId) -> Result<()> {
        let addr = pool.0.as_ptr() as usize;
        let index = self
            .pools
            .iter()
            .position(|range| range.start == addr)
            .ok_or(MemoryError::UnknownPool(addr))?;

        // SAFETY: the pool is registered, so its first header is valid
        unsafe {
            let block = Block::at(pool.0.as_ptr());
            let next = block.next();
            if !block.is_free() || next.is_free() || !next.is_last() {
                return Err(MemoryError::PoolInUse(addr));
            }
            let (fl, sl) = mapping_insert(block.size());
            self.remove_free_block(block, fl, sl);
        }
        self.pools.swap_remove(index);
        Ok(())
    }

    /// Allocate `size` bytes aligned to `ALIGN_SIZE`
    pub fn malloc(&mut self, size: usize) -> Result<NonNull<u8>> {
        let adjust = adjust_request_size(size, ALIGN_SIZE).ok_or(MemoryError::InvalidSize(size))?;
        // SAFETY: every block reachable from the free lists lives in a registered pool
        unsafe {
            let block = self
                .locate_free(adjust)
                .ok_or(MemoryError::OutOfMemory { requested: size })?;
            Ok(self.prepare_used(block, adjust))
        }
    }

    /// Allocate `size` bytes aligned to `align`
    pub fn memalign(&mut self, align: usize, size: usize) -> Result<NonNull<u8>> {
        if !align.is_power_of_two() {
            return Err(MemoryError::InvalidAlignment(align));
        }
        if align <= ALIGN_SIZE {
            return self.malloc(size);
        }

        let adjust = adjust_request_size(size, ALIGN_SIZE).ok_or(MemoryError::InvalidSize(size))?;
        // A leading gap must be able to stand as a free block of its own
        let gap_minimum = HEADER_SIZE;
        let aligned_size = adjust
            .checked_add(align + gap_minimum)
            .and_then(|padded| adjust_request_size(padded, align))
            .ok_or(MemoryError::InvalidSize(size))?;

        // SAFETY: as in malloc; the padded request leaves room for the gap
        unsafe {
            let mut block = self
                .locate_free(aligned_size)
                .ok_or(MemoryError::OutOfMemory { requested: size })?;

            let ptr = block.payload();
            let mut aligned = align_ptr(ptr, align);
            let mut gap = aligned.as_ptr() as usize - ptr.as_ptr() as usize;

            if gap != 0 && gap < gap_minimum {
                let gap_remain = gap_minimum - gap;
                let offset = gap_remain.max(align);
                let next_aligned = NonNull::new_unchecked(aligned.as_ptr().add(offset));
                aligned = align_ptr(next_aligned, align);
                gap = aligned.as_ptr() as usize - ptr.as_ptr() as usize;
            }

            if gap != 0 {
                debug_assert!(gap >= gap_minimum);
                block = self.trim_free_leading(block, gap);
            }

            Ok(self.prepare_used(block, adjust))
        }
    }

    /// Return a block to the free lists, coalescing with free neighbours
    ///
    /// # Safety
    /// `ptr` must have come from this allocator; a pointer into the middle
    /// of a live block is not detected.
    pub unsafe fn free(&mut self, ptr: NonNull<u8>) -> Result<()> {
        let mut block = self.owned_block(ptr)?;
        self.used_bytes -= block.size();

        block.mark_as_free();
        block = self.merge_prev(block);
        block = self.merge_next(block);
        self.insert_block(block);
        Ok(())
    }

    /// Resize an allocation, in place when the block or its free successor allows
    ///
    /// `None` in behaves as `malloc`; a zero size frees and returns `None`.
    ///
    /// # Safety
    /// `ptr` must have come from this allocator.
    pub unsafe fn realloc(
        &mut self,
        ptr: Option<NonNull<u8>>,
        size: usize,
    ) -> Result<Option<NonNull<u8>>> {
        let ptr = match ptr {
            None => return self.malloc(size).map(Some),
            Some(ptr) => ptr,
        };
        if size == 0 {
            self.free(ptr)?;
            return Ok(None);
        }

        let block = self.owned_block(ptr)?;
        let adjust = adjust_request_size(size, ALIGN_SIZE).ok_or(MemoryError::InvalidSize(size))?;
        let cursize = block.size();
        let next = block.next();
        let combined = cursize + next.size() + BLOCK_HEADER_OVERHEAD;

        if adjust > cursize && (!next.is_free() || adjust > combined) {
            let fresh = self.malloc(size)?;
            let keep = cursize.min(size);
            ptr::copy_nonoverlapping(ptr.as_ptr(), fresh.as_ptr(), keep);
            ptr::write_bytes(fresh.as_ptr().add(keep), 0, size - keep);
            self.free(ptr)?;
            return Ok(Some(fresh));
        }

        if adjust > cursize {
            self.merge_next(block);
            block.mark_as_used();
        }
        self.trim_used(block, adjust);
        self.used_bytes = self.used_bytes - cursize + block.size();
        Ok(Some(ptr))
    }

    /// Usable bytes of a live allocation
    ///
    /// # Safety
    /// `ptr` must have come from this allocator.
    pub unsafe fn block_size(&self, ptr: NonNull<u8>) -> Result<usize> {
        Ok(self.owned_block(ptr)?.size())
    }

    /// Visit every physical block of a pool in address order
    pub fn walk_pool(&self, pool: PoolId, mut visit: impl FnMut(BlockInfo)) -> Result<()> {
        let addr = pool.0.as_ptr() as usize;
        if !self.pools.iter().any(|range| range.start == addr) {
            return Err(MemoryError::UnknownPool(addr));
        }
        // SAFETY: registered pools always end in a sentinel
        unsafe {
            let mut block = Block::at(pool.0.as_ptr());
            while !block.is_last() {
                visit(BlockInfo {
                    ptr: block.payload(),
                    size: block.size(),
                    used: !block.is_free(),
                });
                block = block.next();
            }
        }
        Ok(())
    }

    /// Registered pools, in registration order
    pub fn pools(&self) -> impl Iterator<Item = PoolId> + '_ {
        self.pools.iter().filter_map(|range| NonNull::new(range.start as *mut u8).map(PoolId))
    }

    pub fn stats(&self) -> TlsfStats {
        let mut stats = TlsfStats {
            pool_bytes: self
                .pools
                .iter()
                .map(|range| range.end - range.start - BLOCK_START_OFFSET)
                .sum(),
            used_bytes: self.used_bytes,
            ..TlsfStats::default()
        };
        for pool in self.pools() {
            let _ = self.walk_pool(pool, |info| {
                if !info.used {
                    stats.free_bytes += info.size;
                    stats.free_blocks += 1;
                    stats.largest_free_block = stats.largest_free_block.max(info.size);
                }
            });
        }
        stats
    }

    /// Verify bitmap, free-list and physical-chain invariants
    pub fn check(&self) -> core::result::Result<(), IntegrityError> {
        for fl in 0..FL_INDEX_COUNT {
            let fl_set = self.fl_bitmap & (1u64 << fl) != 0;
            let sl_map = self.sl_bitmap[fl];
            if fl_set != (sl_map != 0) {
                return Err(IntegrityError::FirstLevelBitmap { fl, sl_bitmap: sl_map });
            }

            for sl in 0..SL_INDEX_COUNT {
                let sl_set = sl_map & (1u32 << sl) != 0;
                let mut cursor = self.blocks[fl][sl];
                if sl_set != cursor.is_some() {
                    return Err(IntegrityError::SecondLevelBitmap { fl, sl });
                }

                // SAFETY: list members are headers inside registered pools
                unsafe {
                    while let Some(header) = cursor {
                        let block = Block(header);
                        let addr = header.as_ptr() as usize;
                        if !block.is_free() {
                            return Err(IntegrityError::NotFree { addr, fl, sl });
                        }
                        if block.is_prev_free() || block.next().is_free() {
                            return Err(IntegrityError::AdjacentFree { addr });
                        }
                        if block.size() < BLOCK_SIZE_MIN {
                            return Err(IntegrityError::Undersized { addr, size: block.size() });
                        }
                        if mapping_insert(block.size()) != (fl, sl) {
                            return Err(IntegrityError::WrongBucket {
                                addr,
                                size: block.size(),
                                fl,
                                sl,
                            });
                        }
                        cursor = (*header.as_ptr()).next_free;
                    }
                }
            }
        }

        for range in &self.pools {
            // SAFETY: registered pools always end in a sentinel
            unsafe {
                let mut block = Block::at(range.start as *mut u8);
                let mut prev_free = false;
                loop {
                    let addr = block.raw() as usize;
                    if block.is_prev_free() != prev_free {
                        return Err(IntegrityError::PrevFreeFlag { addr });
                    }
                    if block.is_last() {
                        break;
                    }
                    if block.is_free() {
                        if prev_free {
                            return Err(IntegrityError::AdjacentFree { addr });
                        }
                        if !self.is_listed(block) {
                            return Err(IntegrityError::Unlisted { addr });
                        }
                    }
                    prev_free = block.is_free();
                    block = block.next();
                }
            }
        }
        Ok(())
    }

    unsafe fn is_listed(&self, block: Block) -> bool {
        let (fl, sl) = mapping_insert(block.size());
        if fl >= FL_INDEX_COUNT {
            return false;
        }
        let mut cursor = self.blocks[fl][sl];
        while let Some(header) = cursor {
            if header == block.0 {
                return true;
            }
            cursor = (*header.as_ptr()).next_free;
        }
        false
    }

    /// Resolve a caller pointer to its used block header
    unsafe fn owned_block(&self, ptr: NonNull<u8>) -> Result<Block> {
        let addr = ptr.as_ptr() as usize;
        let inside = self
            .pools
            .iter()
            .any(|range| addr >= range.start + BLOCK_START_OFFSET && addr < range.end);
        if !inside || !is_aligned(ptr.as_ptr(), ALIGN_SIZE) {
            return Err(MemoryError::ForeignPointer(addr));
        }
        let block = Block::from_payload(ptr);
        if block.is_free() {
            return Err(MemoryError::DoubleFree(addr));
        }
        Ok(block)
    }

    fn search_suitable_block(&self, fl: usize, sl: usize) -> Option<(Block, usize, usize)> {
        let mut fl = fl;
        let mut sl_map = self.sl_bitmap[fl] & (u32::MAX << sl);
        if sl_map == 0 {
            // No block in this class; take the smallest larger class
            let fl_map = self.fl_bitmap & (u64::MAX << (fl + 1));
            fl = ffs(fl_map)? as usize;
            sl_map = self.sl_bitmap[fl];
        }
        debug_assert!(sl_map != 0, "second level bitmap is null");
        let sl = sl_map.trailing_zeros() as usize;
        self.blocks[fl][sl].map(|header| (Block(header), fl, sl))
    }

    unsafe fn remove_free_block(&mut self, block: Block, fl: usize, sl: usize) {
        let header = block.raw();
        let prev = (*header).prev_free;
        let next = (*header).next_free;
        if let Some(next) = next {
            (*next.as_ptr()).prev_free = prev;
        }
        if let Some(prev) = prev {
            (*prev.as_ptr()).next_free = next;
        }
        (*header).next_free = None;
        (*header).prev_free = None;

        if self.blocks[fl][sl] == Some(block.0) {
            self.blocks[fl][sl] = next;
            if next.is_none() {
                self.sl_bitmap[fl] &= !(1u32 << sl);
                if self.sl_bitmap[fl] == 0 {
                    self.fl_bitmap &= !(1u64 << fl);
                }
            }
        }
    }

    unsafe fn insert_free_block(&mut self, block: Block, fl: usize, sl: usize) {
        let current = self.blocks[fl][sl];
        let header = block.raw();
        (*header).next_free = current;
        (*header).prev_free = None;
        if let Some(current) = current {
            (*current.as_ptr()).prev_free = Some(block.0);
        }
        debug_assert!(is_aligned(block.payload().as_ptr(), ALIGN_SIZE));

        self.blocks[fl][sl] = Some(block.0);
        self.fl_bitmap |= 1u64 << fl;
        self.sl_bitmap[fl] |= 1u32 << sl;
    }

    unsafe fn remove_block(&mut self, block: Block) {
        let (fl, sl) = mapping_insert(block.size());
        self.remove_free_block(block, fl, sl);
    }

    unsafe fn insert_block(&mut self, block: Block) {
        let (fl, sl) = mapping_insert(block.size());
        self.insert_free_block(block, fl, sl);
    }

    unsafe fn merge_prev(&mut self, block: Block) -> Block {
        if !block.is_prev_free() {
            return block;
        }
        let prev = block.prev();
        debug_assert!(prev.is_free(), "prev block is not free though marked as such");
        self.remove_block(prev);
        prev.absorb(block)
    }

    unsafe fn merge_next(&mut self, block: Block) -> Block {
        let next = block.next();
        if !next.is_free() {
            return block;
        }
        debug_assert!(!block.is_last());
        self.remove_block(next);
        block.absorb(next)
    }

    /// Give the tail of a free block back to the free lists
    unsafe fn trim_free(&mut self, block: Block, size: usize) {
        debug_assert!(block.is_free());
        if block.can_split(size) {
            let remaining = block.split(size);
            block.link_next();
            remaining.set_prev_free();
            self.insert_block(remaining);
        }
    }

    /// Give the tail of a used block back, merging with a free successor
    unsafe fn trim_used(&mut self, block: Block, size: usize) {
        debug_assert!(!block.is_free());
        if block.can_split(size) {
            let remaining = block.split(size);
            remaining.set_prev_used();
            let remaining = self.merge_next(remaining);
            self.insert_block(remaining);
        }
    }

    /// Give the first `size` bytes of a free block back, returning the rest
    unsafe fn trim_free_leading(&mut self, block: Block, size: usize) -> Block {
        let mut remaining = block;
        if block.can_split(size) {
            remaining = block.split(size - BLOCK_HEADER_OVERHEAD);
            remaining.set_prev_free();
            block.link_next();
            self.insert_block(block);
        }
        remaining
    }

    unsafe fn locate_free(&mut self, size: usize) -> Option<Block> {
        let (fl, sl) = mapping_search(size);
        // Requests near BLOCK_SIZE_MAX round up past the last class
        if fl >= FL_INDEX_COUNT {
            return None;
        }
        let (block, fl, sl) = self.search_suitable_block(fl, sl)?;
        debug_assert!(block.size() >= size);
        self.remove_free_block(block, fl, sl);
        Some(block)
    }

    unsafe fn prepare_used(&mut self, block: Block, size: usize) -> NonNull<u8> {
        self.trim_free(block, size);
        block.mark_as_used();
        self.used_bytes += block.size();
        block.payload()
    }
}

impl Default for Tlsf {
    fn default() -> Self {
        Self::new()
    }
}
