//! Process-wide page → descriptor lookup.
//!
//! Resolves `free(ptr)` and `usable_size(ptr)` to the descriptor owning the
//! page that contains `ptr`. The map is a two-level radix over the 48-bit
//! virtual address space: a statically allocated root of leaf pointers, with
//! 2MB leaf tables mapped on first touch and installed by CAS. Leaves are
//! never freed.
//!
//! Entry writes are single-word stores: a racing reader observes either the
//! old or the new descriptor pointer, never a torn value. A page's owning
//! descriptor is well-defined for as long as the page belongs to a live
//! superblock.

use core::ptr::null_mut;
use core::sync::atomic::{AtomicPtr, Ordering};

use crate::descriptor::Descriptor;
use crate::error::AllocError;
use crate::pages;

/// log2 of the page size.
const PAGE_SHIFT: usize = 12;
/// Virtual address bits covered by the map.
const VA_BITS: usize = 48;
/// Bits of page index resolved by the root level.
const ROOT_BITS: usize = 18;
/// Bits of page index resolved by a leaf.
const LEAF_BITS: usize = VA_BITS - PAGE_SHIFT - ROOT_BITS;

const ROOT_LEN: usize = 1 << ROOT_BITS;
const LEAF_LEN: usize = 1 << LEAF_BITS;

const _: () = assert!(crate::config::PAGE == 1 << PAGE_SHIFT);
// A leaf must be a page multiple so it can come from the page provider.
const _: () = assert!(size_of::<Leaf>() % crate::config::PAGE == 0);

/// One leaf table: descriptor pointers for a 1GB slice of address space.
#[repr(C)]
struct Leaf {
    entries: [AtomicPtr<Descriptor>; LEAF_LEN],
}

/// The root table. Lives in BSS; absent leaves are null.
struct PageMap {
    root: [AtomicPtr<Leaf>; ROOT_LEN],
}

static PAGE_MAP: PageMap = PageMap {
    root: [const { AtomicPtr::new(null_mut()) }; ROOT_LEN],
};

#[inline]
fn split(addr: usize) -> (usize, usize) {
    debug_assert!(addr < (1 << VA_BITS), "address beyond mapped VA range");
    let page = addr >> PAGE_SHIFT;
    ((page >> LEAF_BITS) & (ROOT_LEN - 1), page & (LEAF_LEN - 1))
}

/// Returns the leaf covering `root_idx`, mapping and installing it if asked.
fn leaf(root_idx: usize, create: bool) -> Result<Option<&'static Leaf>, AllocError> {
    let slot = &PAGE_MAP.root[root_idx];
    let mut cur = slot.load(Ordering::Acquire);
    if cur.is_null() {
        if !create {
            return Ok(None);
        }
        // Fresh mappings are zero-filled, which is exactly an all-null leaf.
        let fresh = pages::page_alloc(size_of::<Leaf>())?.as_ptr().cast::<Leaf>();
        match slot.compare_exchange(null_mut(), fresh, Ordering::AcqRel, Ordering::Acquire) {
            Ok(_) => cur = fresh,
            Err(winner) => {
                // Lost the install race; hand our leaf back.
                // SAFETY: fresh is a page_alloc region of exactly this size
                // that nobody else has seen.
                unsafe {
                    pages::page_free(core::ptr::NonNull::new_unchecked(fresh.cast()), size_of::<Leaf>());
                }
                cur = winner;
            }
        }
    }
    // SAFETY: installed leaves are 'static and never freed.
    Ok(Some(unsafe { &*cur }))
}

/// Records `desc` as the owner of the page containing `addr`.
pub fn set(addr: usize, desc: *mut Descriptor) -> Result<(), AllocError> {
    let (ri, li) = split(addr);
    let leaf = leaf(ri, true)?.expect("leaf was just created");
    leaf.entries[li].store(desc, Ordering::Release);
    Ok(())
}

/// Clears the owner of the page containing `addr`.
///
/// A miss on the leaf level means the page was never registered; that is a
/// caller bug, tolerated here because `clear` runs on teardown paths.
pub fn clear(addr: usize) {
    let (ri, li) = split(addr);
    if let Ok(Some(leaf)) = leaf(ri, false) {
        leaf.entries[li].store(null_mut(), Ordering::Release);
    } else {
        debug_assert!(false, "clearing a page that was never registered");
    }
}

/// Looks up the descriptor owning the page containing `addr`.
///
/// Null means the allocator does not own the page.
#[must_use]
pub fn get(addr: usize) -> *mut Descriptor {
    let (ri, li) = split(addr);
    match leaf(ri, false) {
        Ok(Some(leaf)) => leaf.entries[li].load(Ordering::Acquire),
        _ => null_mut(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // A quiet corner of the 48-bit space, far from anything mmap returns.
    const PROBE: usize = 0x5A5A_0000_0000;

    #[test]
    fn get_unregistered_is_null() {
        assert!(get(PROBE + 123).is_null());
    }

    #[test]
    fn set_get_clear_roundtrip() {
        let fake = 0x40 as *mut Descriptor;
        set(PROBE + crate::config::PAGE, fake).expect("leaf");

        // Any address within the page resolves to the same descriptor.
        assert_eq!(get(PROBE + crate::config::PAGE), fake);
        assert_eq!(get(PROBE + crate::config::PAGE + 4095), fake);
        // The neighbouring pages are untouched.
        assert!(get(PROBE).is_null());
        assert!(get(PROBE + 2 * crate::config::PAGE).is_null());

        clear(PROBE + crate::config::PAGE + 100);
        assert!(get(PROBE + crate::config::PAGE).is_null());
    }

    #[test]
    fn distant_addresses_use_distinct_leaves() {
        let a = 0x1111_0000_0000;
        let b = 0x2222_0000_0000;
        let fake_a = 0x80 as *mut Descriptor;
        let fake_b = 0xC0 as *mut Descriptor;
        set(a, fake_a).expect("leaf");
        set(b, fake_b).expect("leaf");
        assert_eq!(get(a), fake_a);
        assert_eq!(get(b), fake_b);
        clear(a);
        clear(b);
    }
}
