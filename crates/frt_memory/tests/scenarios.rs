//! End-to-end behaviour of the pool and the handle allocator

use std::ptr::NonNull;

use frt_memory::prelude::*;
use frt_memory::{MemoryConfig, MemoryContext, MemoryHandle};

fn overlaps(a: NonNull<u8>, a_len: usize, b: NonNull<u8>, b_len: usize) -> bool {
    let (a, b) = (a.as_ptr() as usize, b.as_ptr() as usize);
    a < b + b_len && b < a + a_len
}

#[test]
fn pool_reuses_freed_block_and_collapses() {
    let pool = MemoryPool::new(1usize.mib()).unwrap();
    let initial = pool.stats();
    assert_eq!(initial.free_blocks, 1);

    let a = pool.allocate(16).unwrap();
    let b = pool.allocate(32).unwrap();
    let c = pool.allocate(64).unwrap();

    for ptr in [a, b, c] {
        assert!(is_aligned(ptr.as_ptr(), 8));
    }
    assert!(!overlaps(a, 16, b, 32));
    assert!(!overlaps(b, 32, c, 64));
    assert!(!overlaps(a, 16, c, 64));

    unsafe { pool.free(Some(b)).unwrap() };
    let d = pool.allocate(24).unwrap();
    let b_start = b.as_ptr() as usize;
    let d_start = d.as_ptr() as usize;
    assert!(d_start >= b_start && d_start + 24 <= b_start + 32);

    unsafe {
        pool.free(Some(c)).unwrap();
        pool.free(Some(a)).unwrap();
        pool.free(Some(d)).unwrap();
    }

    let stats = pool.stats();
    assert_eq!(stats.used_bytes, 0);
    assert_eq!(stats.free_blocks, 1);
    assert_eq!(stats.free_bytes, stats.pool_bytes);
    assert_eq!(stats, initial);
    pool.check().unwrap();

    let mut blocks = Vec::new();
    pool.walk(|info| blocks.push(info));
    assert_eq!(blocks.len(), 1);
    assert!(!blocks[0].used);
}

#[test]
fn pool_realloc_preserves_pattern() {
    let pool = MemoryPool::new(64usize.kib()).unwrap();
    let ptr = pool.allocate(100).unwrap();
    // Pin the neighbour so growth has to relocate
    let fence = pool.allocate(8).unwrap();

    unsafe {
        for i in 0..100 {
            ptr.as_ptr().add(i).write(i as u8);
        }
        let grown = pool.reallocate(Some(ptr), 200).unwrap().unwrap();
        for i in 0..100 {
            assert_eq!(*grown.as_ptr().add(i), i as u8);
        }
        grown.as_ptr().add(100).write_bytes(0xEE, 100);
        assert!(pool.block_size(grown).unwrap() >= 200);

        // Without the fence the block grows in place
        pool.free(Some(fence)).unwrap();
        let again = pool.reallocate(Some(grown), 400).unwrap().unwrap();
        assert_eq!(again, grown);
        assert_eq!(*again.as_ptr().add(99), 99);
        assert_eq!(*again.as_ptr().add(150), 0xEE);

        assert!(pool.reallocate(Some(again), 0).unwrap().is_none());
    }
    assert_eq!(pool.used(), 0);
    pool.check().unwrap();
}

#[test]
fn handles_free_after_last_scope_release() {
    let alloc = RefCountingAllocator::new(4usize.kib()).unwrap();

    let h1 = MemoryHandle::new_in(&alloc, [7u64; 4]).unwrap();
    let first_addr = {
        let value = h1.get().unwrap();
        &*value as *const [u64; 4]
    };
    let h2 = h1.clone();
    assert_eq!(h2.ref_count(), 2);

    drop(h1);
    assert!(h2.is_valid());
    assert_eq!(h2.get().unwrap()[3], 7);
    assert!(alloc.used() > 0);

    drop(h2);
    assert_eq!(alloc.used(), 0);
    assert_eq!(alloc.stats().free_intervals, 1);

    let h3 = MemoryHandle::new_in(&alloc, [0u64; 4]).unwrap();
    let reused = {
        let value = h3.get().unwrap();
        &*value as *const [u64; 4]
    };
    assert_eq!(reused, first_addr);
}

#[test]
fn authority_release_invalidates_every_copy() {
    let alloc = RefCountingAllocator::new(4usize.kib()).unwrap();
    let mut owner = MemoryHandle::new_in(&alloc, String::from("asset")).unwrap();
    let copies: Vec<_> = (0..4).map(|_| owner.clone()).collect();
    assert_eq!(owner.ref_count(), 5);

    owner.release().unwrap();
    assert!(copies.iter().all(|h| !h.is_valid() && h.ref_count() == 0));
    assert!(copies.iter().all(|h| h.get().is_err()));
    assert_eq!(alloc.stats().tracked, 0);

    drop(copies);
    assert_eq!(alloc.used(), 0);
}

#[test]
fn context_serves_both_allocators() {
    let config = MemoryConfig::minimal();
    let ctx = MemoryContext::from_config(&config).unwrap();

    let weak = {
        let shared = ctx.pool().new_shared(vec![1u32, 2, 3]).unwrap();
        let weak = RefShared::downgrade(&shared);
        assert_eq!(weak.lock().map(|s| s.len()), Some(3));
        weak
    };
    assert!(weak.lock().is_none());
    drop(weak);
    assert_eq!(ctx.pool().used(), 0);

    let array = ArrayHandle::filled_in(ctx.ref_counting(), 16, 9u32).unwrap();
    assert_eq!(array.get().unwrap().iter().sum::<u32>(), 144);
}
