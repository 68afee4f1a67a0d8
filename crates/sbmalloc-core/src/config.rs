//! Compile-time allocator configuration.
//!
//! Everything here is fixed at build time; there is no runtime configuration
//! surface and no persisted state.

/// Target page size in bytes.
pub const PAGE: usize = 4096;

/// Mask of the in-page offset bits.
pub const PAGE_MASK: usize = PAGE - 1;

/// Cache line size. Descriptors are aligned to this so the low bits of a
/// descriptor pointer are free for the active-reference credit tag.
pub const CACHELINE: usize = 64;

/// Number of credit bits packed into the low end of an active reference.
pub const CREDITS_BITS: u32 = 6;

/// Upper bound on credits reserved against an active superblock in one refill.
pub const CREDITS_MAX: u32 = 1 << CREDITS_BITS;

/// Mask selecting the credit bits of an active reference.
pub const CREDITS_MASK: u64 = (1 << CREDITS_BITS) - 1;

/// Size of the page bundle carved into descriptors when the pool runs dry.
pub const DESCRIPTOR_BLOCK_SZ: usize = 16 * PAGE;

/// Alignment guaranteed by `allocate` for every request (C "natural"
/// alignment). Requests needing more go through the aligned large path.
pub const MIN_ALIGN: usize = 16;

// ---------------------------------------------------------------------------
// Compile-time guards
// ---------------------------------------------------------------------------

const _: () = assert!(PAGE.is_power_of_two());
const _: () = assert!(CACHELINE.is_power_of_two() && CACHELINE >= 64);
const _: () = assert!(CREDITS_MAX as u64 == CREDITS_MASK + 1);
const _: () = assert!(DESCRIPTOR_BLOCK_SZ % PAGE == 0);
const _: () = assert!(MIN_ALIGN.is_power_of_two() && MIN_ALIGN >= 16);
