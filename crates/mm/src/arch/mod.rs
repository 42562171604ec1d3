//! Architecture-specific implementations for memory management.
//!
//! The translation format itself is fixed: two levels, 1024 32-bit entries per table and
//! 4 KiB pages. What differs per backend is how the control registers are reached:
//! - `x86_64`: the real CR0/CR2/CR3 registers.
//! - `software`: emulated registers and emulated physical memory, for tests and host tools.

#[cfg(all(target_arch = "x86_64", not(test), not(feature = "software-emulation")))]
mod x86_64;
#[cfg(all(target_arch = "x86_64", not(test), not(feature = "software-emulation")))]
pub use self::x86_64::*;

// Use software emulation ONLY when:
// - Running tests, OR
// - software-emulation feature is explicitly enabled
#[cfg(any(test, feature = "software-emulation"))]
mod software;
#[cfg(any(test, feature = "software-emulation"))]
pub use software::*;

/// Page and frame size in bytes (4 KiB).
pub const PAGE_SIZE: usize = 4096;

/// Number of entries in a page directory or leaf page table.
pub const ENTRIES_PER_TABLE: usize = 1024;

/// Number of bits in a physical address.
pub const MAX_PHYSICAL_BITS: u32 = 32;

/// Number of bits in a virtual address.
pub const MAX_VIRTUAL_BITS: u32 = 32;

/// Shift of the leaf-table index (bits 12-21).
const TABLE_SHIFT: usize = 12;

/// Shift of the directory index (bits 22-31).
const DIRECTORY_SHIFT: usize = 22;

const INDEX_MASK: usize = ENTRIES_PER_TABLE - 1;

/// Returns the page-directory index (top 10 bits) of a virtual address.
#[inline]
pub const fn directory_index(address: usize) -> usize {
    (address >> DIRECTORY_SHIFT) & INDEX_MASK
}

/// Returns the leaf-table index (next 10 bits) of a virtual address.
#[inline]
pub const fn table_index(address: usize) -> usize {
    (address >> TABLE_SHIFT) & INDEX_MASK
}

/// Validates a physical address: it must fit in [`MAX_PHYSICAL_BITS`].
#[inline]
pub const fn validate_physical(addr: usize) -> bool {
    (addr as u64) >> MAX_PHYSICAL_BITS == 0
}

/// Validates a virtual address: it must fit in [`MAX_VIRTUAL_BITS`].
#[inline]
pub const fn validate_virtual(addr: usize) -> bool {
    (addr as u64) >> MAX_VIRTUAL_BITS == 0
}
