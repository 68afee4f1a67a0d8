//! # sbmalloc-abi
//!
//! ABI-compatible `extern "C"` boundary layer for sbmalloc.
//!
//! Built as a `cdylib`, this crate exposes the standard C allocation
//! interface (`malloc`, `free`, `calloc`, `realloc`, `malloc_usable_size`,
//! `posix_memalign`, `aligned_alloc`, `memalign`, `valloc`, `pvalloc`) as
//! unmangled symbols, each a thin POSIX-semantics shim over the lock-free
//! engine in `sbmalloc-core`.
//!
//! # Architecture
//!
//! ```text
//! C caller -> ABI entry (this crate) -> sbmalloc-core pipelines -> return
//! ```
//!
//! Because the core is const-initialized, the symbols are valid from the
//! first call — including calls made before `main` by process startup code.

// Gated behind cfg(not(test)) because this module exports #[unsafe(no_mangle)]
// allocator symbols (malloc, free, ...) that would shadow the system
// allocator inside this crate's own unit-test binary.
#[cfg(not(test))]
pub mod malloc_abi;

pub mod global_alloc;

pub use global_alloc::SbMalloc;
