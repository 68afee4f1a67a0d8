//! `GlobalAlloc` adapter for Rust consumers.
//!
//! Lets a Rust program route its own heap through the lock-free engine:
//!
//! ```ignore
//! use sbmalloc_abi::SbMalloc;
//!
//! #[global_allocator]
//! static ALLOC: SbMalloc = SbMalloc;
//! ```

use core::alloc::{GlobalAlloc, Layout};
use core::ptr::{self, NonNull};

use sbmalloc_core::{self as sb, MIN_ALIGN};

/// Zero-sized handle over the process-wide allocator state.
pub struct SbMalloc;

#[inline]
fn raw(result: Result<NonNull<u8>, sb::AllocError>) -> *mut u8 {
    match result {
        Ok(p) => p.as_ptr(),
        Err(_) => ptr::null_mut(),
    }
}

#[inline]
fn alloc_layout(layout: Layout) -> *mut u8 {
    if layout.align() <= MIN_ALIGN {
        raw(sb::allocate(layout.size().max(1)))
    } else {
        raw(sb::allocate_aligned(layout.align(), layout.size().max(1)))
    }
}

unsafe impl GlobalAlloc for SbMalloc {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        alloc_layout(layout)
    }

    unsafe fn dealloc(&self, ptr: *mut u8, _layout: Layout) {
        if let Some(p) = NonNull::new(ptr) {
            // SAFETY: GlobalAlloc contract — ptr came from this allocator.
            unsafe { sb::deallocate(p) };
        }
    }

    unsafe fn alloc_zeroed(&self, layout: Layout) -> *mut u8 {
        let p = alloc_layout(layout);
        if !p.is_null() {
            // SAFETY: p is valid for layout.size() bytes.
            unsafe { ptr::write_bytes(p, 0, layout.size()) };
        }
        p
    }

    unsafe fn realloc(&self, ptr: *mut u8, layout: Layout, new_size: usize) -> *mut u8 {
        if layout.align() > MIN_ALIGN {
            // The core realloc only guarantees natural alignment; preserve
            // the stronger one by hand.
            let new = raw(sb::allocate_aligned(layout.align(), new_size.max(1)));
            if !new.is_null() {
                if let Some(old) = NonNull::new(ptr) {
                    // SAFETY: old is live per the GlobalAlloc contract; the
                    // copy stays within both allocations.
                    unsafe {
                        let copy = sb::usable_size(old).min(new_size).min(layout.size());
                        ptr::copy_nonoverlapping(old.as_ptr(), new, copy);
                        sb::deallocate(old);
                    }
                }
            }
            return new;
        }
        // SAFETY: GlobalAlloc contract — ptr is null or live from here.
        raw(unsafe { sb::reallocate(NonNull::new(ptr), new_size.max(1)) })
    }
}
