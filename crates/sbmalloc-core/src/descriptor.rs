//! Superblock descriptors and the global descriptor pool.
//!
//! A descriptor owns one superblock and carries its control word (the
//! anchor). Descriptor memory is carved out of dedicated page bundles and is
//! **never** returned to the OS: a thread holding a stale descriptor pointer
//! can always load its fields safely, and staleness is rejected by the
//! generation counters on every linked-stack CAS.

use core::fmt;
use core::ptr::null_mut;
use core::sync::atomic::{AtomicU64, Ordering};

use bitfield_struct::bitfield;
use portable_atomic::AtomicU128;

use crate::config::{CACHELINE, DESCRIPTOR_BLOCK_SZ};
use crate::error::AllocError;
use crate::heap::ProcHeap;
use crate::pages;

// ---------------------------------------------------------------------------
// Anchor
// ---------------------------------------------------------------------------

/// Lifecycle state of a superblock, stored in the two low anchor bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SuperblockState {
    /// Installed as some heap's active superblock.
    Active = 0,
    /// Every block is handed out or reserved by credits.
    Full = 1,
    /// On the partial stack with unreserved free blocks.
    Partial = 2,
    /// Every block is free; the superblock may go back to the OS.
    Empty = 3,
}

impl SuperblockState {
    pub const fn from_bits(bits: u8) -> Self {
        match bits {
            0 => Self::Active,
            1 => Self::Full,
            2 => Self::Partial,
            _ => Self::Empty,
        }
    }

    pub const fn into_bits(self) -> u8 {
        self as u8
    }
}

/// Mask of the 25-bit `avail`/`count` fields.
pub const ANCHOR_IDX_MASK: u32 = (1 << 25) - 1;

/// Mask of the 12-bit ABA tag.
pub const ANCHOR_TAG_MASK: u16 = (1 << 12) - 1;

/// The per-superblock atomic control word.
///
/// `avail` heads the intrusive free list, `count` is the number of free
/// blocks not reserved by credits, and `tag` wraps mod 4096 and is bumped on
/// every successful anchor CAS to defeat ABA on `avail`. When the state is
/// [`SuperblockState::Full`], `avail` carries no meaning.
#[bitfield(u64)]
pub struct Anchor {
    #[bits(2)]
    pub state: SuperblockState,
    #[bits(25)]
    pub avail: u32,
    #[bits(25)]
    pub count: u32,
    #[bits(12)]
    pub tag: u16,
}

impl Anchor {
    /// Copy with the ABA tag advanced by one (wrapping at 12 bits).
    #[inline]
    #[must_use]
    pub const fn with_bumped_tag(self) -> Self {
        self.with_tag(self.tag().wrapping_add(1) & ANCHOR_TAG_MASK)
    }
}

// ---------------------------------------------------------------------------
// Tagged descriptor links
// ---------------------------------------------------------------------------

/// 128-bit {pointer, generation} pair for ABA-safe stack links.
///
/// Packed for double-width compare-and-swap:
///
/// ```text
///   bits [127:64]  generation counter
///   bits [63:0]    descriptor pointer (full virtual address)
/// ```
///
/// Pushes advance the generation; pops carry the observed generation into
/// the comparand, so a node that was popped, recycled, and pushed back at
/// the same address no longer matches.
#[derive(Clone, Copy, PartialEq, Eq)]
#[repr(transparent)]
pub struct TaggedPtr(u128);

impl TaggedPtr {
    pub const NULL: Self = Self(0);

    #[inline]
    #[must_use]
    pub fn new(ptr: *mut Descriptor, generation: u64) -> Self {
        Self(u128::from(generation) << 64 | (ptr as usize as u128))
    }

    #[inline]
    #[must_use]
    pub fn ptr(self) -> *mut Descriptor {
        (self.0 as usize) as *mut Descriptor
    }

    #[inline]
    #[must_use]
    pub fn generation(self) -> u64 {
        (self.0 >> 64) as u64
    }

    #[inline]
    #[must_use]
    pub fn is_null(self) -> bool {
        self.ptr().is_null()
    }

    #[inline]
    #[must_use]
    pub const fn into_bits(self) -> u128 {
        self.0
    }

    #[inline]
    #[must_use]
    pub const fn from_bits(bits: u128) -> Self {
        Self(bits)
    }
}

impl fmt::Debug for TaggedPtr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TaggedPtr({:p}, gen={})", self.ptr(), self.generation())
    }
}

// ---------------------------------------------------------------------------
// Descriptor
// ---------------------------------------------------------------------------

/// Superblock metadata.
///
/// Cache-line aligned so the low six bits of a descriptor pointer are free
/// for the active-reference credit tag.
#[repr(C, align(64))]
pub struct Descriptor {
    /// Link in the free-descriptor pool.
    pub next_free: AtomicU128,
    /// Link in a heap's partial stack.
    pub next_partial: AtomicU128,
    /// Packed state/avail/count/tag word.
    pub anchor: AtomicU64,
    /// Base of the backing superblock.
    pub superblock: *mut u8,
    /// Owning heap, or null for a large allocation.
    pub heap: *const ProcHeap,
    /// Bytes per block. For large allocations, the whole region size.
    pub block_size: usize,
    /// Blocks in the superblock. 1 for large allocations.
    pub max_count: u32,
}

// Descriptors are shared freely across threads; every mutable field is
// either atomic or written only while the writer holds the superblock
// exclusively (between desc_alloc and publication).
unsafe impl Send for Descriptor {}
unsafe impl Sync for Descriptor {}

const _: () = assert!(align_of::<Descriptor>() >= CACHELINE);
const _: () = assert!(size_of::<Descriptor>() % CACHELINE == 0);
const _: () = assert!(DESCRIPTOR_BLOCK_SZ / size_of::<Descriptor>() >= 2);

// ---------------------------------------------------------------------------
// Descriptor pool
// ---------------------------------------------------------------------------

/// Head of the global free-descriptor stack.
static AVAIL_DESC: AtomicU128 = AtomicU128::new(TaggedPtr::NULL.into_bits());

/// Pops a descriptor from the pool, growing it from the page provider when
/// it runs dry. Returned descriptors carry stale field values; the caller
/// fully initializes them before publication.
pub fn desc_alloc() -> Result<core::ptr::NonNull<Descriptor>, AllocError> {
    let mut old = TaggedPtr::from_bits(AVAIL_DESC.load(Ordering::Acquire));
    loop {
        if old.is_null() {
            return grow_pool();
        }
        // SAFETY: descriptor memory is never unmapped. The head may be
        // concurrently recycled; a stale read of its link is rejected by
        // the generation comparison below.
        let next = TaggedPtr::from_bits(unsafe { (*old.ptr()).next_free.load(Ordering::Acquire) });
        let new = TaggedPtr::new(next.ptr(), old.generation());
        match AVAIL_DESC.compare_exchange_weak(
            old.into_bits(),
            new.into_bits(),
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            // SAFETY: a non-null head just won by CAS is ours alone.
            Ok(_) => return Ok(unsafe { core::ptr::NonNull::new_unchecked(old.ptr()) }),
            Err(cur) => old = TaggedPtr::from_bits(cur),
        }
    }
}

/// Pushes a descriptor back onto the pool.
pub fn desc_retire(desc: core::ptr::NonNull<Descriptor>) {
    let mut old = TaggedPtr::from_bits(AVAIL_DESC.load(Ordering::Acquire));
    loop {
        // SAFETY: desc is exclusively ours until the CAS publishes it.
        unsafe { desc.as_ref().next_free.store(old.into_bits(), Ordering::Relaxed) };
        let new = TaggedPtr::new(desc.as_ptr(), old.generation().wrapping_add(1));
        match AVAIL_DESC.compare_exchange_weak(
            old.into_bits(),
            new.into_bits(),
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(_) => return,
            Err(cur) => old = TaggedPtr::from_bits(cur),
        }
    }
}

/// Carves a fresh page bundle into descriptors. The first is handed to the
/// caller; the rest are chained through `next_free` and published in one
/// push.
#[cold]
fn grow_pool() -> Result<core::ptr::NonNull<Descriptor>, AllocError> {
    let region = pages::page_alloc(DESCRIPTOR_BLOCK_SZ)?;
    let base = region.as_ptr();
    let stride = size_of::<Descriptor>();
    let count = DESCRIPTOR_BLOCK_SZ / stride;
    log::debug!("descriptor pool: carving {count} descriptors from a fresh bundle");

    // The mapping is zero-filled, which is a valid Descriptor bit pattern;
    // only the chain links need initialization.
    let at = |i: usize| -> *mut Descriptor {
        debug_assert!(i < count);
        // SAFETY: i * stride stays within the freshly mapped region.
        unsafe { base.add(i * stride).cast() }
    };
    for i in 1..count {
        let next = if i + 1 < count { at(i + 1) } else { null_mut() };
        // SAFETY: the region is exclusively ours until the push below.
        unsafe {
            (*at(i))
                .next_free
                .store(TaggedPtr::new(next, 0).into_bits(), Ordering::Relaxed);
        }
    }

    let chain_head = at(1);
    let chain_tail = at(count - 1);
    let mut old = TaggedPtr::from_bits(AVAIL_DESC.load(Ordering::Acquire));
    loop {
        // SAFETY: the chain is unpublished; re-pointing the tail is private.
        unsafe { (*chain_tail).next_free.store(old.into_bits(), Ordering::Relaxed) };
        let new = TaggedPtr::new(chain_head, old.generation().wrapping_add(1));
        match AVAIL_DESC.compare_exchange_weak(
            old.into_bits(),
            new.into_bits(),
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(_) => break,
            Err(cur) => old = TaggedPtr::from_bits(cur),
        }
    }

    // SAFETY: base is the non-null start of the fresh region.
    Ok(unsafe { core::ptr::NonNull::new_unchecked(at(0)) })
}
