#![cfg_attr(not(any(test, feature = "software-emulation")), no_std)]

//! # Memory Manager (MM)
//!
//! The memory manager is the physical- and virtual-memory core of the kernel. It provides:
//!
//! - [`FramePool`]: contiguous physical frame allocation backed by a 2-bit-per-frame bitmap
//!   that lives in physical memory the pool manages.
//! - [`PageTable`]: a two-level (directory + leaf table) translation structure with
//!   demand-paging fault handling.
//! - [`VmPool`]: bump allocation of virtual regions inside one address space, backed on
//!   demand by the page table's fault handler.
//!
//! Control flows downward (`VmPool` -> `PageTable` -> `FramePool`). The only upward entry point
//! is [`PageTable::handle_fault`], which the trap layer calls on a page fault.
//!
//! With the `software-emulation` feature (and always under test) the hardware is replaced by
//! emulated physical memory and control registers, so the whole stack runs on a host.

extern crate alloc;

mod address;
mod arch;
mod bitmap;
mod entry;
mod frame;
mod frame_pool;
mod global;
mod human_size;
mod numbers;
mod page_table;
mod vm_pool;

pub use address::{AddressTranslator, PhysicalAddress, VirtualAddress};
pub use entry::{PageEntry, PageFlags};
pub use frame::FrameState;
pub use frame_pool::{FrameError, FramePool, PoolId};
pub use human_size::HumanSize;
pub use numbers::{FrameNumber, PageNumber};
pub use page_table::{FaultContext, FaultError, FaultOutcome, PageTable, PagingError};
pub use vm_pool::{MAX_REGIONS, Region, VmError, VmPool};

pub use arch::{ENTRIES_PER_TABLE, PAGE_SIZE};

/// Control-register access for the trap layer and for host-side tests.
pub mod registers {
    #[cfg(any(test, feature = "software-emulation"))]
    pub use crate::arch::set_fault_address;
    pub use crate::arch::{is_paging_enabled, read_fault_address, read_page_table_base};
}
