use super::*;

fn check_counts(pool: &RawPool) {
    assert_eq!(pool._debug_walk_free_list(), pool.free_cell_count());
    assert_eq!(
        pool.free_cell_count() + pool.live_cell_count(),
        pool.total_cell_count()
    );
}

#[test]
fn raw_pool_lazy_first_block() {
    let pool = RawPool::new(1, 16, 4);
    assert_eq!(pool.block_count(), 0);
    assert_eq!(pool.free_cell_count(), 0);
    assert_eq!(pool.cell_count(), 4);
    check_counts(&pool);
}

#[test]
fn raw_pool_zero_cell_count_clamped() {
    let mut pool = RawPool::new(0, 64, 0);
    assert_eq!(pool.cell_count(), 1);
    let a = pool.alloc();
    let b = pool.alloc();
    assert_ne!(a, b);
    assert_eq!(pool.block_count(), 2);
    check_counts(&pool);
}

#[test]
fn raw_pool_grows_one_block_at_a_time() {
    let mut pool = RawPool::new(1, 16, 4);
    let mut ptrs = Vec::new();
    for _ in 0..4 {
        ptrs.push(pool.alloc());
    }
    assert_eq!(pool.block_count(), 1);
    assert_eq!(pool.free_cell_count(), 0);
    check_counts(&pool);

    ptrs.push(pool.alloc());
    assert_eq!(pool.block_count(), 2);
    assert_eq!(pool.free_cell_count(), 3);
    assert_eq!(pool.live_cell_count(), 5);
    check_counts(&pool);
}

#[test]
fn raw_pool_stack_order() {
    let mut pool = RawPool::new(1, 16, 4);
    let a = pool.alloc();
    let b = pool.alloc();
    let c = pool.alloc();
    let d = pool.alloc();
    println!("{:?} {:?} {:?} {:?}", a, b, c, d);

    // cells are pushed in address order, so they come back highest first
    assert_eq!(a.as_ptr() as usize - b.as_ptr() as usize, 16);
    assert_eq!(b.as_ptr() as usize - c.as_ptr() as usize, 16);
    assert_eq!(c.as_ptr() as usize - d.as_ptr() as usize, 16);

    // and the free list is LIFO
    unsafe {
        pool.free(b).unwrap();
        pool.free(c).unwrap();
    }
    assert_eq!(pool.alloc(), c);
    assert_eq!(pool.alloc(), b);
    check_counts(&pool);
}

#[test]
fn raw_pool_headers() {
    let mut pool = RawPool::new(7, 64, 8);
    let p = pool.alloc();
    let hdr = unsafe { RawCell::header_of(p) };
    assert_eq!(hdr.pool_index, 7);
    assert_eq!(hdr.block_slot, 0);
    assert!(hdr.is_used());
    assert_eq!(p.as_ptr() as usize % CELL_ALIGN, 0);

    unsafe { pool.free(p).unwrap() };
    let hdr = unsafe { RawCell::header_of(p) };
    assert!(!hdr.is_used());
}

#[test]
fn raw_pool_payload_zeroed() {
    let mut pool = RawPool::new(3, 32, 4);
    let p = pool.alloc();
    unsafe {
        for i in 0..24 {
            assert_eq!(*p.as_ptr().add(i), 0);
        }
        ptr::write_bytes(p.as_ptr(), 0xAB, 24);
        pool.free(p).unwrap();
    }
    let q = pool.alloc();
    assert_eq!(p, q);
    unsafe {
        for i in 0..24 {
            assert_eq!(*q.as_ptr().add(i), 0);
        }
    }
}

#[test]
fn raw_pool_free_refuses_bad_cells() {
    let mut pool_a = RawPool::new(1, 16, 4);
    let mut pool_b = RawPool::new(2, 24, 4);

    let a = pool_a.alloc();
    let b = pool_b.alloc();

    unsafe {
        assert_eq!(
            pool_a.free(b),
            Err(FreeError::ForeignPool {
                expected: 1,
                found: 2
            })
        );
        pool_a.free(a).unwrap();
        assert_eq!(pool_a.free(a), Err(FreeError::DoubleFree));
        pool_b.free(b).unwrap();
    }
    check_counts(&pool_a);
    check_counts(&pool_b);
}

#[test]
fn raw_pool_cleanup_releases_free_blocks() {
    let mut pool = RawPool::new(1, 16, 2);
    let a0 = pool.alloc();
    let a1 = pool.alloc();
    let b0 = pool.alloc();
    assert_eq!(pool.block_count(), 2);

    let flag_a = unsafe { pool.freed_flag(a0) }.unwrap();
    let flag_b = unsafe { pool.freed_flag(b0) }.unwrap();
    assert!(!flag_a.get());

    // nothing is completely free yet
    assert_eq!(pool.cleanup_free_blocks(), 0);
    assert_eq!(pool.block_count(), 2);

    unsafe {
        pool.free(a0).unwrap();
        pool.free(a1).unwrap();
    }
    check_counts(&pool);
    assert_eq!(pool.cleanup_free_blocks(), 1);
    assert!(flag_a.get());
    assert!(!flag_b.get());
    assert_eq!(pool.block_count(), 1);
    assert_eq!(pool.live_cell_count(), 1);
    check_counts(&pool);

    // the remaining free cell and the live cell still work
    let b1 = pool.alloc();
    assert_eq!(pool.block_count(), 1);
    unsafe {
        pool.free(b0).unwrap();
        pool.free(b1).unwrap();
    }
    assert_eq!(pool.cleanup_free_blocks(), 1);
    assert!(flag_b.get());
    assert_eq!(pool.block_count(), 0);
    assert_eq!(pool.free_cell_count(), 0);
    check_counts(&pool);
}

#[test]
fn raw_pool_cleanup_middle_block_then_reuse_slot() {
    let mut pool = RawPool::new(1, 16, 2);
    let mut ptrs = Vec::new();
    for _ in 0..6 {
        ptrs.push(pool.alloc());
    }
    assert_eq!(pool.block_count(), 3);

    // free the middle block, plus one cell of the last block so
    // the free list interleaves cells of different blocks
    unsafe {
        pool.free(ptrs[5]).unwrap();
        pool.free(ptrs[2]).unwrap();
        pool.free(ptrs[3]).unwrap();
    }
    let old_flag = unsafe { pool.freed_flag(ptrs[0]) }.unwrap();
    assert_eq!(pool.cleanup_free_blocks(), 1);
    assert_eq!(pool.block_count(), 2);
    assert_eq!(pool.free_cell_count(), 1);
    assert!(!old_flag.get());
    check_counts(&pool);

    // the hole gets reused, with a fresh flag
    let x = pool.alloc();
    assert_eq!(x, ptrs[5]);
    let y = pool.alloc();
    assert_eq!(pool.block_count(), 3);
    assert_eq!(unsafe { RawCell::header_of(y) }.block_slot, 1);
    let new_flag = unsafe { pool.freed_flag(y) }.unwrap();
    assert!(!new_flag.get());
    check_counts(&pool);
}

#[test]
fn raw_pool_for_each_used() {
    let mut pool = RawPool::new(1, 16, 4);
    let a = pool.alloc();
    let b = pool.alloc();
    let c = pool.alloc();
    unsafe { pool.free(b).unwrap() };

    let mut seen = Vec::new();
    pool.for_each_used(|p| seen.push(p));
    seen.sort();
    let mut expected = vec![a, c];
    expected.sort();
    assert_eq!(seen, expected);
}

#[test]
fn raw_pool_drop_sets_flags() {
    let mut pool = RawPool::new(1, 16, 4);
    let p = pool.alloc();
    let flag = unsafe { pool.freed_flag(p) }.unwrap();
    drop(pool);
    assert!(flag.get());
}

#[test]
#[should_panic]
fn raw_pool_rejects_tiny_cells() {
    RawPool::new(0, 8, 4);
}
