//! # sbmalloc-core
//!
//! Lock-free superblock allocator core, following the Michael non-blocking
//! allocator scheme. Many threads allocate and free fixed-size blocks from
//! size-segregated shared pools without mutual exclusion, using a packed
//! per-superblock anchor word, credit-based reservations on the per-class
//! active reference, and double-width CAS with generation counters on every
//! linked stack.
//!
//! # Architecture
//!
//! ```text
//! request ── size_class ──► heap (active ref + partial stack)
//!                             │ active → partial → new superblock
//!                             ▼
//!                         descriptor (anchor CAS) ──► block
//!
//! free(ptr) ── pagemap ──► descriptor ── anchor CAS ──► state machine
//! ```
//!
//! All allocator state is const-initialized: there is no init call and no
//! init ordering hazard. The only blocking operation is the page provider's
//! mmap. Slow paths emit `log` records; a consumer that installs this
//! allocator globally must pair it with a non-allocating logger.

pub mod alloc;
pub mod config;
pub mod descriptor;
pub mod error;
pub mod heap;
pub mod pagemap;
pub mod pages;
pub mod size_class;

pub use alloc::{allocate, allocate_aligned, deallocate, lookup, reallocate, usable_size};
pub use config::{MIN_ALIGN, PAGE};
pub use error::AllocError;
