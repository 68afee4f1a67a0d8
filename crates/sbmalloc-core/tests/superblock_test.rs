//! Superblock lifecycle scenarios, driven through the public API.
//!
//! Each test uses a size class no other test in this binary touches, so the
//! per-class heaps stay observable while tests run in parallel.

use sbmalloc_core::size_class::{SIZE_CLASSES, class_index};
use sbmalloc_core::{allocate, deallocate, lookup, reallocate, usable_size};

/// Exhausting a class commits exactly one superblock; the overflow
/// allocation commits a second; draining the first returns it to the OS
/// exactly once.
#[test]
fn exhaust_and_drain_releases_superblock() {
    const BLOCK: usize = 32 * 1024; // largest class: 16 blocks per superblock
    let sc = &SIZE_CLASSES[class_index(BLOCK).unwrap()];
    assert_eq!(sc.blocks_per_sb, 16);

    let ptrs: Vec<_> = (0..sc.blocks_per_sb)
        .map(|_| allocate(BLOCK).expect("alloc"))
        .collect();

    // All distinct, all inside one superblock.
    let lo = ptrs.iter().map(|p| p.as_ptr() as usize).min().unwrap();
    let hi = ptrs.iter().map(|p| p.as_ptr() as usize).max().unwrap();
    assert!(hi - lo < sc.sb_size);
    for (i, p) in ptrs.iter().enumerate() {
        assert_eq!(lookup(p.as_ptr()), Some(BLOCK));
        for q in &ptrs[i + 1..] {
            assert_ne!(p, q);
        }
    }

    // The class is exhausted: the next allocation lands in a fresh
    // superblock.
    let overflow = allocate(BLOCK).expect("alloc");
    let o = overflow.as_ptr() as usize;
    assert!(o < lo || o >= lo + sc.sb_size);

    // Drain the first superblock; its pages leave the page map, which is
    // only possible if the region went back to the OS.
    for p in &ptrs {
        // SAFETY: each pointer is live and freed once.
        unsafe { deallocate(*p) };
    }
    assert_eq!(lookup(ptrs[0].as_ptr()), None);
    assert_eq!(lookup(ptrs[sc.blocks_per_sb - 1].as_ptr()), None);

    // The overflow superblock is untouched.
    assert_eq!(lookup(overflow.as_ptr()), Some(BLOCK));
    // SAFETY: live and freed once.
    unsafe { deallocate(overflow) };
}

/// A full superblock woken by a single free serves the next allocation from
/// the freed block, without committing a new superblock.
#[test]
fn full_superblock_wakes_on_free() {
    const BLOCK: usize = 24 * 1024; // 21 blocks per superblock
    let sc = &SIZE_CLASSES[class_index(BLOCK).unwrap()];
    assert_eq!(sc.blocks_per_sb, 21);

    let ptrs: Vec<_> = (0..sc.blocks_per_sb)
        .map(|_| allocate(BLOCK).expect("alloc"))
        .collect();

    let released = ptrs[7];
    // SAFETY: live and freed once.
    unsafe { deallocate(released) };

    // The only free block in the class is the one just released; getting it
    // back proves the FULL → PARTIAL wake-up ran through the partial stack.
    let woken = allocate(BLOCK).expect("alloc");
    assert_eq!(woken, released);

    for (i, p) in ptrs.iter().enumerate() {
        if i != 7 {
            // SAFETY: live and freed once.
            unsafe { deallocate(*p) };
        }
    }
    // SAFETY: live and freed once.
    unsafe { deallocate(woken) };
    assert_eq!(lookup(woken.as_ptr()), None);
}

/// Free then re-allocate of the same size reuses the freed block: the
/// superblock's free list is LIFO through the anchor.
#[test]
fn alloc_free_alloc_reuses_block() {
    const SIZE: usize = 90; // 96-byte class, private to this test
    let first = allocate(SIZE).expect("alloc");
    // SAFETY: live and freed once.
    unsafe { deallocate(first) };
    let second = allocate(SIZE).expect("alloc");
    assert_eq!(first, second);
    // SAFETY: live and freed once.
    unsafe { deallocate(second) };
}

/// Realloc moves the contents and releases the old block for reuse.
#[test]
fn realloc_moves_contents() {
    const OLD: usize = 100; // 112-byte class, private to this test
    const NEW: usize = 2000;

    let p1 = allocate(OLD).expect("alloc");
    // SAFETY: p1 is live with at least OLD bytes.
    unsafe {
        for i in 0..OLD {
            p1.as_ptr().add(i).write((i % 251) as u8);
        }
    }
    let old_usable = unsafe { usable_size(p1) };
    assert!(old_usable >= OLD);

    // SAFETY: p1 is consumed by the realloc.
    let p2 = unsafe { reallocate(Some(p1), NEW) }.expect("realloc");
    assert_ne!(p1, p2);
    // SAFETY: p2 is live with at least NEW bytes.
    unsafe {
        for i in 0..OLD {
            assert_eq!(*p2.as_ptr().add(i), (i % 251) as u8);
        }
    }

    // The old block went back to its class; the next same-class allocation
    // picks it up.
    let reused = allocate(OLD).expect("alloc");
    assert_eq!(reused, p1);

    // SAFETY: both live and freed once.
    unsafe {
        deallocate(reused);
        deallocate(p2);
    }
}
