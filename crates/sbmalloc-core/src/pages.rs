//! OS page provider.
//!
//! Supplies and returns page-multiple regions through anonymous private
//! mappings. This is the only place the allocator talks to the operating
//! system, and the only place an operation may block.

use core::ptr::{self, NonNull};

use crate::config::PAGE;
use crate::error::AllocError;

/// Rounds `n` up to the next page multiple.
#[inline]
#[must_use]
pub const fn page_ceil(n: usize) -> usize {
    (n + PAGE - 1) & !(PAGE - 1)
}

/// Obtains a fresh zero-filled region of `len` bytes from the OS.
///
/// `len` must be a non-zero page multiple. The returned region is
/// page-aligned and readable/writable.
pub fn page_alloc(len: usize) -> Result<NonNull<u8>, AllocError> {
    debug_assert!(len > 0 && len % PAGE == 0);

    // SAFETY: anonymous private mapping with no fd; the kernel picks the
    // address and the length is validated above.
    let raw = unsafe {
        libc::mmap(
            ptr::null_mut(),
            len,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
            -1,
            0,
        )
    };
    if raw == libc::MAP_FAILED {
        log::error!("page provider: mmap of {len} bytes failed");
        return Err(AllocError::OutOfMemory);
    }
    NonNull::new(raw.cast::<u8>()).ok_or(AllocError::OutOfMemory)
}

/// Returns a region previously obtained from [`page_alloc`] to the OS.
///
/// # Safety
///
/// `ptr` must be the base of a live region obtained from [`page_alloc`] and
/// `len` must be the exact length it was mapped with. The region must not be
/// accessed afterwards.
pub unsafe fn page_free(ptr: NonNull<u8>, len: usize) {
    debug_assert!(len > 0 && len % PAGE == 0);

    // SAFETY: per the function contract this unmaps exactly one mapping
    // created by page_alloc.
    let rc = unsafe { libc::munmap(ptr.as_ptr().cast(), len) };
    debug_assert_eq!(rc, 0, "munmap of a page_alloc region failed");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn page_ceil_rounds_up() {
        assert_eq!(page_ceil(1), PAGE);
        assert_eq!(page_ceil(PAGE), PAGE);
        assert_eq!(page_ceil(PAGE + 1), 2 * PAGE);
        assert_eq!(page_ceil(10 * PAGE - 1), 10 * PAGE);
    }

    #[test]
    fn alloc_free_roundtrip() {
        let region = page_alloc(4 * PAGE).expect("mmap");
        assert_eq!(region.as_ptr() as usize % PAGE, 0);

        // Fresh mappings are zero-filled and writable.
        // SAFETY: region is 4 pages long and exclusively ours.
        unsafe {
            assert_eq!(*region.as_ptr(), 0);
            assert_eq!(*region.as_ptr().add(4 * PAGE - 1), 0);
            region.as_ptr().write(0xA5);
            page_free(region, 4 * PAGE);
        }
    }
}
