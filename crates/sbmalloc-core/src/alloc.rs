//! Allocation and free pipelines.
//!
//! Allocation walks three sources in order: the heap's active superblock
//! (credit fast path), the partial stack, and finally a freshly committed
//! superblock. Free pushes the block back through the owning descriptor's
//! anchor and drives the FULL→PARTIAL and →EMPTY transitions. All mutation
//! is lock-free; the only blocking lives in the page provider.

use core::ptr::NonNull;
use core::sync::atomic::{AtomicU64, Ordering};

use crate::config::{CREDITS_MAX, MIN_ALIGN, PAGE, PAGE_MASK};
use crate::descriptor::{self, ANCHOR_IDX_MASK, Anchor, Descriptor, SuperblockState};
use crate::error::AllocError;
use crate::heap::{self, ActiveRef, ProcHeap};
use crate::pagemap;
use crate::pages;
use crate::size_class::SizeClass;

// ---------------------------------------------------------------------------
// Public entry points
// ---------------------------------------------------------------------------

/// Allocates `size` bytes with natural (16-byte) alignment.
///
/// Zero-size requests are served from the smallest class. Fails only when
/// the page provider fails.
pub fn allocate(size: usize) -> Result<NonNull<u8>, AllocError> {
    match heap::get_heap(size) {
        Some(h) => alloc_small(h),
        None => alloc_large(size),
    }
}

/// Allocates `size` bytes aligned to `alignment` (a power of two).
///
/// Alignments up to [`MIN_ALIGN`] come for free from the size classes.
/// Anything larger takes the large path with overallocation, and the page
/// containing the aligned pointer is patched into the page map so a later
/// free resolves.
pub fn allocate_aligned(alignment: usize, size: usize) -> Result<NonNull<u8>, AllocError> {
    if !alignment.is_power_of_two() {
        return Err(AllocError::InvalidAlignment);
    }
    if alignment <= MIN_ALIGN {
        return allocate(size);
    }

    let padded = alignment
        .max(size)
        .checked_mul(2)
        .ok_or(AllocError::SizeOverflow)?;
    let region_size = pages::page_ceil(padded);
    let (desc, region) = commit_large(region_size)?;

    let base = region.as_ptr() as usize;
    let user = base.next_multiple_of(alignment);
    debug_assert!(user + size.max(1) <= base + region_size);
    if (user & !PAGE_MASK) != (base & !PAGE_MASK) {
        if let Err(e) = pagemap::set(user, desc.as_ptr()) {
            release_large(desc, region, region_size);
            return Err(e);
        }
    }
    // SAFETY: user lies within the region, hence non-null.
    Ok(unsafe { NonNull::new_unchecked(user as *mut u8) })
}

/// Returns a block to its superblock, or a large region to the OS.
///
/// # Safety
///
/// `ptr` must have been returned by this allocator and not yet freed.
pub unsafe fn deallocate(ptr: NonNull<u8>) {
    let desc = pagemap::get(ptr.as_ptr() as usize);
    if desc.is_null() {
        // Foreign or already-freed pointer: undefined by contract.
        debug_assert!(false, "free of a pointer the allocator does not own");
        return;
    }
    // SAFETY: descriptor fields are stable while one of its blocks is live.
    let heap_ptr = unsafe { (*desc).heap };
    if heap_ptr.is_null() {
        // SAFETY: forwarded caller contract.
        unsafe { free_large(ptr, desc) };
    } else {
        // SAFETY: heap pointers reference the static heap table.
        let owner: &'static ProcHeap = unsafe { &*heap_ptr };
        // SAFETY: forwarded caller contract.
        unsafe { free_small(ptr, desc, owner) };
    }
}

/// Grows or shrinks an allocation by allocate-copy-free.
///
/// With no `ptr` this is plain allocation. On success the old pointer is
/// consumed; on failure it stays live.
///
/// # Safety
///
/// `ptr`, when present, must be live and from this allocator.
pub unsafe fn reallocate(
    ptr: Option<NonNull<u8>>,
    new_size: usize,
) -> Result<NonNull<u8>, AllocError> {
    let Some(old) = ptr else {
        return allocate(new_size);
    };
    let new = allocate(new_size)?;
    // SAFETY: old is live with at least usable_size(old) readable bytes and
    // new has at least new_size writable bytes.
    unsafe {
        let copy = usable_size(old).min(new_size);
        core::ptr::copy_nonoverlapping(old.as_ptr(), new.as_ptr(), copy);
        deallocate(old);
    }
    Ok(new)
}

/// Usable size of the allocation owning `ptr`, or `None` when the allocator
/// does not own its page. Only meaningful for live allocations: a stale
/// pointer may resolve to a recycled descriptor.
#[must_use]
pub fn lookup(ptr: *const u8) -> Option<usize> {
    let addr = ptr as usize;
    let desc = pagemap::get(addr);
    if desc.is_null() {
        return None;
    }
    // SAFETY: descriptor memory is never unmapped, so the reads are always
    // in-bounds; the values are meaningful per the contract above.
    let (heap_ptr, block_size, sb) =
        unsafe { ((*desc).heap, (*desc).block_size, (*desc).superblock) };
    if heap_ptr.is_null() {
        // Large region; an aligned handout may start inside it.
        Some(block_size - (addr - sb as usize))
    } else {
        Some(block_size)
    }
}

/// Usable size of a live allocation (at least the requested size).
///
/// # Safety
///
/// `ptr` must have been returned by this allocator and not yet freed.
pub unsafe fn usable_size(ptr: NonNull<u8>) -> usize {
    let n = lookup(ptr.as_ptr());
    debug_assert!(n.is_some(), "usable_size of a pointer the allocator does not own");
    n.unwrap_or(0)
}

// ---------------------------------------------------------------------------
// Small path
// ---------------------------------------------------------------------------

fn alloc_small(heap: &'static ProcHeap) -> Result<NonNull<u8>, AllocError> {
    loop {
        if let Some(p) = malloc_from_active(heap) {
            return Ok(p);
        }
        if let Some(p) = malloc_from_partial(heap) {
            return Ok(p);
        }
        if let Some(p) = malloc_from_new_sb(heap)? {
            return Ok(p);
        }
        // Lost the install race: another thread's superblock is active now,
        // so the fast paths serve the retry.
    }
}

/// Fast path: consume one credit from the active reference and pop the
/// corresponding block. Taking the last credit also refills credits from
/// the anchor's free count, or drives the superblock Full.
fn malloc_from_active(heap: &'static ProcHeap) -> Option<NonNull<u8>> {
    let mut old_active = ActiveRef::from_bits(heap.active.load(Ordering::Acquire));
    loop {
        if old_active.is_null() {
            return None;
        }
        let new_active = if old_active.credits() > 0 {
            ActiveRef::new(old_active.desc(), old_active.credits() - 1)
        } else {
            // Taking the last credit: the reference comes down until the
            // refill below (or a new superblock) reinstalls one.
            ActiveRef::NULL
        };
        match heap.active.compare_exchange_weak(
            old_active.into_bits(),
            new_active.into_bits(),
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(_) => break,
            Err(cur) => old_active = ActiveRef::from_bits(cur),
        }
    }
    let desc = old_active.desc();
    let old_credits = old_active.credits();

    // We now own one reservation against `desc`: the superblock cannot
    // reach Empty until this block is handed out, so its fields are stable.
    // SAFETY: see above.
    let (sb, block_size, max_count) =
        unsafe { ((*desc).superblock, (*desc).block_size, (*desc).max_count) };
    // SAFETY: the anchor is an atomic field of never-unmapped memory.
    let anchor = unsafe { &(*desc).anchor };

    let mut credits = 0u32;
    let mut old = Anchor::from_bits(anchor.load(Ordering::Acquire));
    let block = loop {
        // Frees never downgrade an active superblock, so avail stays valid
        // across retries.
        debug_assert!(old.avail() < max_count);
        // SAFETY: avail indexes a block inside the superblock.
        let block = unsafe { sb.add(old.avail() as usize * block_size) };
        // A stale read here is discarded when the tag CAS fails.
        let next = unsafe { block_link(block) }.load(Ordering::Relaxed);

        credits = 0;
        let mut new = old
            .with_avail(next as u32 & ANCHOR_IDX_MASK)
            .with_bumped_tag();
        if old_credits == 0 {
            if old.count() == 0 {
                // No credits left to hand out.
                new.set_state(SuperblockState::Full);
            } else {
                credits = old.count().min(CREDITS_MAX);
                new.set_count(old.count() - credits);
            }
        }
        match anchor.compare_exchange_weak(
            old.into_bits(),
            new.into_bits(),
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(_) => break block,
            Err(cur) => old = Anchor::from_bits(cur),
        }
    };

    if credits > 0 {
        update_active(heap, desc, credits);
    }
    NonNull::new(block)
}

/// Middle path: adopt a superblock from the partial stack, reserving one
/// block for the caller and up to [`CREDITS_MAX`] for the active reference.
fn malloc_from_partial(heap: &'static ProcHeap) -> Option<NonNull<u8>> {
    loop {
        let desc = heap.pop_partial()?;
        let d = desc.as_ptr();
        // SAFETY: the pop granted us this stack slot; the descriptor cannot
        // be retired before we either retire it below or hand out a block.
        let anchor = unsafe { &(*d).anchor };

        let mut credits = 0u32;
        let mut old = Anchor::from_bits(anchor.load(Ordering::Acquire));
        let reserved = loop {
            if old.state() == SuperblockState::Empty {
                // The superblock went home while the descriptor sat on the
                // stack; this pop is where it finally retires.
                descriptor::desc_retire(desc);
                break false;
            }
            // Not Empty; not Active or Full, because only partial
            // superblocks are pushed and we own the pop.
            debug_assert_eq!(old.state(), SuperblockState::Partial);
            debug_assert!(old.count() >= 1);
            credits = (old.count() - 1).min(CREDITS_MAX);
            let new = old.with_count(old.count() - 1 - credits).with_state(
                if credits > 0 {
                    SuperblockState::Active
                } else {
                    SuperblockState::Full
                },
            );
            match anchor.compare_exchange_weak(
                old.into_bits(),
                new.into_bits(),
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => break true,
                Err(cur) => old = Anchor::from_bits(cur),
            }
        };
        if !reserved {
            continue;
        }

        // SAFETY: we hold a reservation against the descriptor.
        let block = unsafe { pop_reserved_block(d) };
        if credits > 0 {
            update_active(heap, d, credits);
        }
        return NonNull::new(block);
    }
}

/// Slow path: commit a brand-new superblock and try to install it as the
/// heap's active one. `Ok(None)` means another thread won the install race;
/// the caller retries through the fast paths.
fn malloc_from_new_sb(heap: &'static ProcHeap) -> Result<Option<NonNull<u8>>, AllocError> {
    let sc = heap.size_class();
    let desc = descriptor::desc_alloc()?;
    let sb = match pages::page_alloc(sc.sb_size) {
        Ok(p) => p,
        Err(e) => {
            descriptor::desc_retire(desc);
            return Err(e);
        }
    };

    let d = desc.as_ptr();
    let max = sc.blocks_per_sb as u32;
    let credits = (max - 1).min(CREDITS_MAX);
    // SAFETY: descriptor and superblock are unpublished; stores are private.
    unsafe {
        (*d).superblock = sb.as_ptr();
        (*d).heap = heap;
        (*d).block_size = sc.block_size;
        (*d).max_count = max;
        // Block 0 is the immediate handout; blocks 1..max-1 form the
        // index-linked free list. The last block's link stays unwritten —
        // `count` guards it.
        for idx in 1..(max as usize - 1) {
            block_link(sb.as_ptr().add(idx * sc.block_size))
                .store(idx as u64 + 1, Ordering::Relaxed);
        }
        (*d).anchor.store(
            Anchor::new()
                .with_state(SuperblockState::Active)
                .with_avail(1)
                .with_count(max - 1 - credits)
                .into_bits(),
            Ordering::Release,
        );
    }

    // Every page must resolve in the page map before the superblock can
    // serve allocations.
    if let Err(e) = register_small(d, sb.as_ptr(), sc) {
        // SAFETY: still unpublished.
        unsafe { pages::page_free(sb, sc.sb_size) };
        descriptor::desc_retire(desc);
        return Err(e);
    }

    let new_active = ActiveRef::new(d, credits - 1);
    if heap
        .active
        .compare_exchange(
            ActiveRef::NULL.into_bits(),
            new_active.into_bits(),
            Ordering::AcqRel,
            Ordering::Acquire,
        )
        .is_ok()
    {
        log::trace!("class {}: committed a fresh superblock of {max} blocks", heap.class());
        Ok(Some(sb))
    } else {
        // Another thread installed an active superblock first. Undo and let
        // the fast paths serve the retry.
        unregister_small(sb.as_ptr(), sc);
        // SAFETY: no block was handed out; the region is unreachable again.
        unsafe { pages::page_free(sb, sc.sb_size) };
        descriptor::desc_retire(desc);
        Ok(None)
    }
}

/// Installs `desc` with `credits` reservations as the heap's active
/// superblock. If another superblock got there first, the credits go back
/// to the anchor and the descriptor parks on the partial stack.
fn update_active(heap: &'static ProcHeap, desc: *mut Descriptor, credits: u32) {
    debug_assert!(credits >= 1);
    let new_active = ActiveRef::new(desc, credits - 1);
    if heap
        .active
        .compare_exchange(
            ActiveRef::NULL.into_bits(),
            new_active.into_bits(),
            Ordering::AcqRel,
            Ordering::Acquire,
        )
        .is_ok()
    {
        return;
    }

    // SAFETY: we hold the credits, so the descriptor cannot be retired.
    let anchor = unsafe { &(*desc).anchor };
    let mut old = Anchor::from_bits(anchor.load(Ordering::Acquire));
    loop {
        let new = old
            .with_count(old.count() + credits)
            .with_state(SuperblockState::Partial);
        match anchor.compare_exchange_weak(
            old.into_bits(),
            new.into_bits(),
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(_) => break,
            Err(cur) => old = Anchor::from_bits(cur),
        }
    }
    // SAFETY: desc is non-null by construction.
    heap.push_partial(unsafe { NonNull::new_unchecked(desc) });
}

/// Pops one block from a superblock the caller holds a reservation against.
/// Concurrent frees may push onto `avail`; the tag rejects stale reads.
///
/// # Safety
///
/// The caller must own an unconsumed reservation against `desc`.
unsafe fn pop_reserved_block(desc: *mut Descriptor) -> *mut u8 {
    // SAFETY: the reservation pins the superblock.
    let (sb, block_size, max_count) =
        unsafe { ((*desc).superblock, (*desc).block_size, (*desc).max_count) };
    let anchor = unsafe { &(*desc).anchor };
    let mut old = Anchor::from_bits(anchor.load(Ordering::Acquire));
    loop {
        debug_assert!(old.avail() < max_count);
        // SAFETY: avail indexes a block inside the superblock.
        let block = unsafe { sb.add(old.avail() as usize * block_size) };
        let next = unsafe { block_link(block) }.load(Ordering::Relaxed);
        let new = old
            .with_avail(next as u32 & ANCHOR_IDX_MASK)
            .with_bumped_tag();
        match anchor.compare_exchange_weak(
            old.into_bits(),
            new.into_bits(),
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(_) => return block,
            Err(cur) => old = Anchor::from_bits(cur),
        }
    }
}

/// # Safety
///
/// Caller contract of [`deallocate`]; `desc` owns the block at `ptr`.
unsafe fn free_small(ptr: NonNull<u8>, desc: *mut Descriptor, heap: &'static ProcHeap) {
    // Copies taken before the CAS: past it, the descriptor may be popped,
    // retired, and recycled at any time.
    // SAFETY: the descriptor is stable while the block is live.
    let (sb, block_size, max_count) =
        unsafe { ((*desc).superblock, (*desc).block_size, (*desc).max_count) };
    let anchor = unsafe { &(*desc).anchor };

    let idx = (ptr.as_ptr() as usize - sb as usize) / block_size;
    debug_assert!(idx < max_count as usize);
    // Recompute the block base so an interior pointer pushes the block it
    // belongs to.
    // SAFETY: idx was derived from a pointer inside the superblock.
    let block = unsafe { sb.add(idx * block_size) };

    let mut old = Anchor::from_bits(anchor.load(Ordering::Acquire));
    let new = loop {
        // Intrusive push: the freed block records the old list head. The
        // block is private to us until the CAS publishes it.
        unsafe { block_link(block) }.store(u64::from(old.avail()), Ordering::Relaxed);
        let mut new = old.with_avail(idx as u32).with_bumped_tag();
        if old.state() == SuperblockState::Full {
            new.set_state(SuperblockState::Partial);
        }
        if old.count() == max_count - 1 {
            // Last outstanding block: the superblock can go home. This
            // cannot fire while the superblock is active, because credit
            // reservations are not counted in `count`.
            new.set_state(SuperblockState::Empty);
        } else {
            new.set_count(old.count() + 1);
        }
        match anchor.compare_exchange_weak(
            old.into_bits(),
            new.into_bits(),
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(_) => break new,
            Err(cur) => old = Anchor::from_bits(cur),
        }
    };

    if new.state() == SuperblockState::Empty {
        unregister_small(sb, heap.size_class());
        // SAFETY: every block is free; nothing can reach the region.
        unsafe { pages::page_free(NonNull::new_unchecked(sb), heap.size_class().sb_size) };
        log::trace!("class {}: released an empty superblock", heap.class());
        // The descriptor parks on the partial stack until a pop observes
        // Empty and retires it.
    } else if old.state() == SuperblockState::Full {
        // A formerly-full superblock is reachable again; this push is its
        // only wake-up signal.
        // SAFETY: desc came from the page map, hence non-null.
        heap.push_partial(unsafe { NonNull::new_unchecked(desc) });
    }
}

// ---------------------------------------------------------------------------
// Large path
// ---------------------------------------------------------------------------

fn alloc_large(size: usize) -> Result<NonNull<u8>, AllocError> {
    let region_size = pages::page_ceil(size);
    let (_, region) = commit_large(region_size)?;
    log::trace!("large allocation of {region_size} bytes");
    Ok(region)
}

/// Maps a region, binds it to a single-block Full descriptor, and registers
/// the first page.
fn commit_large(region_size: usize) -> Result<(NonNull<Descriptor>, NonNull<u8>), AllocError> {
    let desc = descriptor::desc_alloc()?;
    let region = match pages::page_alloc(region_size) {
        Ok(r) => r,
        Err(e) => {
            descriptor::desc_retire(desc);
            return Err(e);
        }
    };
    let d = desc.as_ptr();
    // SAFETY: the descriptor is unpublished.
    unsafe {
        (*d).superblock = region.as_ptr();
        (*d).heap = core::ptr::null();
        (*d).block_size = region_size;
        (*d).max_count = 1;
        (*d).anchor.store(
            Anchor::new().with_state(SuperblockState::Full).into_bits(),
            Ordering::Release,
        );
    }
    if let Err(e) = pagemap::set(region.as_ptr() as usize, d) {
        // SAFETY: unpublished region.
        unsafe { pages::page_free(region, region_size) };
        descriptor::desc_retire(desc);
        return Err(e);
    }
    Ok((desc, region))
}

/// Unwinds a [`commit_large`] that cannot be handed out.
fn release_large(desc: NonNull<Descriptor>, region: NonNull<u8>, region_size: usize) {
    pagemap::clear(region.as_ptr() as usize);
    // SAFETY: the region was never handed out.
    unsafe { pages::page_free(region, region_size) };
    descriptor::desc_retire(desc);
}

/// # Safety
///
/// Caller contract of [`deallocate`]; `desc` owns the region containing
/// `ptr` and has a null heap.
unsafe fn free_large(ptr: NonNull<u8>, desc: *mut Descriptor) {
    // SAFETY: stable while the allocation is live.
    let (sb, region_size) = unsafe { ((*desc).superblock, (*desc).block_size) };
    pagemap::clear(sb as usize);
    if ptr.as_ptr() != sb {
        // Aligned handout: its page was patched into the map separately.
        pagemap::clear(ptr.as_ptr() as usize);
    }
    // SAFETY: the region was page_alloc'd with exactly this size.
    unsafe { pages::page_free(NonNull::new_unchecked(sb), region_size) };
    // Large descriptors are never on any partial stack; recycle now.
    // SAFETY: desc came from the page map, hence non-null.
    descriptor::desc_retire(unsafe { NonNull::new_unchecked(desc) });
    log::trace!("released a large region of {region_size} bytes");
}

// ---------------------------------------------------------------------------
// Page map registration
// ---------------------------------------------------------------------------

/// Points every page of a small superblock at its descriptor.
fn register_small(desc: *mut Descriptor, sb: *mut u8, sc: &SizeClass) -> Result<(), AllocError> {
    let base = sb as usize;
    let mut off = 0;
    while off < sc.sb_size {
        if let Err(e) = pagemap::set(base + off, desc) {
            let mut undo = 0;
            while undo < off {
                pagemap::clear(base + undo);
                undo += PAGE;
            }
            return Err(e);
        }
        off += PAGE;
    }
    Ok(())
}

fn unregister_small(sb: *mut u8, sc: &SizeClass) {
    let base = sb as usize;
    let mut off = 0;
    while off < sc.sb_size {
        pagemap::clear(base + off);
        off += PAGE;
    }
}

// ---------------------------------------------------------------------------
// Intrusive free-list links
// ---------------------------------------------------------------------------

/// View of the next-index word at a block base.
///
/// Free blocks store the index of the next free block in their first eight
/// bytes; the word lives in "user" memory between free and reallocation,
/// which is load-bearing for the protocol. Accesses are atomic because a
/// stale `avail` may address a block a concurrent caller already owns; the
/// value read there is discarded when the anchor CAS rejects the tag.
///
/// # Safety
///
/// `block` must point at least eight bytes into valid superblock memory and
/// be 8-aligned.
#[inline]
unsafe fn block_link<'a>(block: *mut u8) -> &'a AtomicU64 {
    debug_assert_eq!(block as usize % align_of::<AtomicU64>(), 0);
    // SAFETY: per the function contract.
    unsafe { &*block.cast::<AtomicU64>() }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn small_roundtrip() {
        let p = allocate(24).expect("alloc");
        assert_eq!(p.as_ptr() as usize % MIN_ALIGN, 0);
        assert!(lookup(p.as_ptr()).unwrap() >= 24);
        // SAFETY: p is live and ours.
        unsafe {
            p.as_ptr().write_bytes(0xEE, 24);
            deallocate(p);
        }
    }

    #[test]
    fn zero_size_allocates() {
        let p = allocate(0).expect("alloc");
        assert!(lookup(p.as_ptr()).unwrap() >= 16);
        // SAFETY: p is live and ours.
        unsafe { deallocate(p) };
    }

    #[test]
    fn distinct_blocks_within_class() {
        let a = allocate(100).expect("alloc");
        let b = allocate(100).expect("alloc");
        assert_ne!(a, b);
        // SAFETY: both are live and ours.
        unsafe {
            deallocate(a);
            deallocate(b);
        }
    }

    #[test]
    fn usable_size_covers_request() {
        for size in [1usize, 16, 17, 128, 1000, 4096, 32768, 50_000] {
            let p = allocate(size).expect("alloc");
            // SAFETY: p is live and ours.
            unsafe {
                assert!(usable_size(p) >= size, "size {size}");
                deallocate(p);
            }
        }
    }

    #[test]
    fn large_region_resolves_and_releases() {
        let p = allocate(100_000).expect("alloc");
        assert!(lookup(p.as_ptr()).unwrap() >= 100_000);
        // SAFETY: p is live and ours.
        unsafe { deallocate(p) };
        assert_eq!(lookup(p.as_ptr()), None);
    }
}
