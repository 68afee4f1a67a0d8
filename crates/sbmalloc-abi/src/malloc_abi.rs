//! ABI layer for the memory allocation functions.
//!
//! Every symbol here is a drop-in replacement for its glibc counterpart.
//! The shims translate between raw C pointers plus errno and the typed core
//! API; they hold no state of their own and never allocate through any other
//! allocator, so they are safe to interpose process-wide (including from
//! constructors that run before `main`).

use core::ptr::{self, NonNull};
use std::ffi::{c_int, c_void};

use sbmalloc_core::{self as sb, AllocError};

#[inline]
fn set_errno(code: c_int) {
    // SAFETY: __errno_location returns this thread's errno slot.
    unsafe { *libc::__errno_location() = code };
}

#[inline]
fn errno_for(err: AllocError) -> c_int {
    match err {
        AllocError::OutOfMemory => libc::ENOMEM,
        AllocError::InvalidAlignment | AllocError::SizeOverflow => libc::EINVAL,
    }
}

// ---------------------------------------------------------------------------
// malloc
// ---------------------------------------------------------------------------

/// POSIX `malloc` -- allocates `size` bytes of uninitialized memory.
///
/// Returns a pointer aligned for any built-in type, or null with errno set
/// to `ENOMEM` if the page provider fails. `malloc(0)` returns a valid,
/// freeable pointer.
///
/// # Safety
///
/// Caller must eventually `free` the returned pointer exactly once.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn malloc(size: usize) -> *mut c_void {
    match sb::allocate(size.max(1)) {
        Ok(p) => p.as_ptr().cast(),
        Err(e) => {
            set_errno(errno_for(e));
            ptr::null_mut()
        }
    }
}

// ---------------------------------------------------------------------------
// free
// ---------------------------------------------------------------------------

/// POSIX `free` -- deallocates memory previously allocated by this
/// allocator. If `ptr` is null, no operation is performed.
///
/// # Safety
///
/// `ptr` must be null or a pointer returned by `malloc`, `calloc`,
/// `realloc`, or one of the aligned variants, and must not have been freed
/// already.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn free(ptr: *mut c_void) {
    let Some(p) = NonNull::new(ptr.cast::<u8>()) else {
        return;
    };
    // SAFETY: forwarded caller contract.
    unsafe { sb::deallocate(p) };
}

// ---------------------------------------------------------------------------
// calloc
// ---------------------------------------------------------------------------

/// POSIX `calloc` -- allocates zeroed memory for `nmemb` elements of `size`
/// bytes each.
///
/// Returns null (errno `ENOMEM`) if the multiplication overflows or the
/// allocation fails.
///
/// # Safety
///
/// Caller must eventually `free` the returned pointer exactly once.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn calloc(nmemb: usize, size: usize) -> *mut c_void {
    let Some(total) = nmemb.checked_mul(size) else {
        set_errno(libc::ENOMEM);
        return ptr::null_mut();
    };
    let total = total.max(1);
    match sb::allocate(total) {
        Ok(p) => {
            // Blocks are recycled without scrubbing, so zero explicitly.
            // SAFETY: p is valid for at least `total` bytes.
            unsafe { ptr::write_bytes(p.as_ptr(), 0, total) };
            p.as_ptr().cast()
        }
        Err(e) => {
            set_errno(errno_for(e));
            ptr::null_mut()
        }
    }
}

// ---------------------------------------------------------------------------
// realloc
// ---------------------------------------------------------------------------

/// POSIX `realloc` -- resizes a previously allocated block.
///
/// - `realloc(NULL, size)` behaves like `malloc(size)`.
/// - `realloc(ptr, 0)` frees `ptr` and returns null.
/// - Otherwise allocates anew, copies the common prefix, and frees the old
///   block. On failure the old block is left untouched and null is
///   returned.
///
/// # Safety
///
/// `ptr` must be null or a live pointer from this allocator.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn realloc(ptr: *mut c_void, size: usize) -> *mut c_void {
    if size == 0 && !ptr.is_null() {
        // SAFETY: forwarded caller contract.
        unsafe { free(ptr) };
        return ptr::null_mut();
    }
    // SAFETY: forwarded caller contract.
    match unsafe { sb::reallocate(NonNull::new(ptr.cast::<u8>()), size.max(1)) } {
        Ok(p) => p.as_ptr().cast(),
        Err(e) => {
            set_errno(errno_for(e));
            ptr::null_mut()
        }
    }
}

// ---------------------------------------------------------------------------
// malloc_usable_size
// ---------------------------------------------------------------------------

/// glibc `malloc_usable_size` -- number of usable bytes in the block at
/// `ptr`, which may exceed the requested size. Null yields 0.
///
/// # Safety
///
/// `ptr` must be null or a live pointer from this allocator.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn malloc_usable_size(ptr: *mut c_void) -> usize {
    match NonNull::new(ptr.cast::<u8>()) {
        // SAFETY: forwarded caller contract.
        Some(p) => unsafe { sb::usable_size(p) },
        None => 0,
    }
}

// ---------------------------------------------------------------------------
// posix_memalign
// ---------------------------------------------------------------------------

/// POSIX `posix_memalign` -- allocates `size` bytes aligned to `alignment`
/// and stores the pointer through `memptr`.
///
/// Returns 0 on success, `EINVAL` if `alignment` is not a power of two
/// multiple of `sizeof(void *)`, or `ENOMEM` on exhaustion. errno is left
/// untouched, per POSIX.
///
/// # Safety
///
/// `memptr` must point to writable storage for one pointer. The result must
/// eventually be passed to `free` exactly once.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn posix_memalign(
    memptr: *mut *mut c_void,
    alignment: usize,
    size: usize,
) -> c_int {
    if !alignment.is_power_of_two() || alignment % size_of::<*mut c_void>() != 0 {
        return libc::EINVAL;
    }
    match sb::allocate_aligned(alignment, size.max(1)) {
        Ok(p) => {
            // SAFETY: caller guarantees memptr is writable.
            unsafe { *memptr = p.as_ptr().cast() };
            0
        }
        Err(AllocError::OutOfMemory) => libc::ENOMEM,
        Err(_) => libc::EINVAL,
    }
}

// ---------------------------------------------------------------------------
// aligned_alloc and friends
// ---------------------------------------------------------------------------

#[inline]
unsafe fn aligned_or_null(alignment: usize, size: usize) -> *mut c_void {
    let mut out: *mut c_void = ptr::null_mut();
    // SAFETY: out is a local, trivially writable.
    let rc = unsafe { posix_memalign(&raw mut out, alignment, size) };
    if rc != 0 {
        set_errno(rc);
        return ptr::null_mut();
    }
    out
}

/// C11 `aligned_alloc` -- allocates `size` bytes aligned to `alignment`.
///
/// # Safety
///
/// Caller must eventually `free` the returned pointer exactly once.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn aligned_alloc(alignment: usize, size: usize) -> *mut c_void {
    if !alignment.is_power_of_two() {
        set_errno(libc::EINVAL);
        return ptr::null_mut();
    }
    // SAFETY: forwarded caller contract.
    unsafe { aligned_or_null(alignment.max(size_of::<*mut c_void>()), size) }
}

/// Legacy `memalign` -- allocates `size` bytes aligned to `alignment`.
///
/// # Safety
///
/// Caller must eventually `free` the returned pointer exactly once.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn memalign(alignment: usize, size: usize) -> *mut c_void {
    if !alignment.is_power_of_two() {
        set_errno(libc::EINVAL);
        return ptr::null_mut();
    }
    // SAFETY: forwarded caller contract.
    unsafe { aligned_or_null(alignment.max(size_of::<*mut c_void>()), size) }
}

/// Obsolete `valloc` -- allocates `size` bytes aligned to the page size.
///
/// # Safety
///
/// Caller must eventually `free` the returned pointer exactly once.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn valloc(size: usize) -> *mut c_void {
    // SAFETY: forwarded caller contract.
    unsafe { aligned_or_null(sb::PAGE, size) }
}

/// Obsolete `pvalloc` -- like `valloc`, with `size` rounded up to a page
/// multiple.
///
/// # Safety
///
/// Caller must eventually `free` the returned pointer exactly once.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn pvalloc(size: usize) -> *mut c_void {
    let Some(rounded) = size.checked_next_multiple_of(sb::PAGE) else {
        set_errno(libc::ENOMEM);
        return ptr::null_mut();
    };
    // SAFETY: forwarded caller contract.
    unsafe { aligned_or_null(sb::PAGE, rounded.max(sb::PAGE)) }
}
