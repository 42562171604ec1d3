//! Software emulation implementation for testing and development.
//!
//! This module provides an emulated machine that can run on any host:
//! - physical memory is a zeroed host buffer, addressed from physical address 0,
//! - the page-table base (CR3), fault address (CR2) and paging-enable bit (CR0.PG) are
//!   plain per-thread values.
//!
//! Every test thread gets its own registers, so tests never observe each other's machine.

use core::cell::Cell;
use core::ptr::NonNull;

use crate::{PhysicalAddress, VirtualAddress};

/// Emulated control registers.
#[derive(Clone, Copy)]
struct Registers {
    page_table_base: usize,
    fault_address: usize,
    paging: bool,
}

impl Registers {
    const fn new() -> Self {
        Self {
            page_table_base: 0,
            fault_address: 0,
            paging: false,
        }
    }
}

std::thread_local! {
    static REGISTERS: Cell<Registers> = const { Cell::new(Registers::new()) };
}

fn update(f: impl FnOnce(&mut Registers)) {
    REGISTERS.with(|registers| {
        let mut value = registers.get();
        f(&mut value);
        registers.set(value);
    });
}

/// Loads a page directory into the emulated page-table base register.
///
/// Real hardware flushes cached translations here; the emulated machine has none.
pub fn write_page_table_base(directory: PhysicalAddress) {
    update(|registers| registers.page_table_base = directory.as_usize());
}

/// Reads the emulated page-table base register.
pub fn read_page_table_base() -> PhysicalAddress {
    PhysicalAddress::new(REGISTERS.with(|registers| registers.get().page_table_base))
}

/// Reads the emulated fault-address register.
pub fn read_fault_address() -> VirtualAddress {
    VirtualAddress::new(REGISTERS.with(|registers| registers.get().fault_address))
}

/// Sets the emulated fault-address register, as the CPU would before raising a page fault.
pub fn set_fault_address(address: VirtualAddress) {
    update(|registers| registers.fault_address = address.as_usize());
}

/// Sets the emulated paging-enable bit.
pub fn enable_paging() {
    update(|registers| registers.paging = true);
}

/// Returns whether the emulated paging-enable bit is set.
pub fn is_paging_enabled() -> bool {
    REGISTERS.with(|registers| registers.get().paging)
}

/// Emulated physical memory.
///
/// A zeroed host buffer standing in for physical memory starting at address 0. The buffer is
/// made of `u64` words so that page-table entries and bitmap bytes placed in it are suitably
/// aligned.
pub struct EmulatedMemory {
    base: NonNull<u64>,
    words: usize,
}

impl EmulatedMemory {
    /// Creates a new emulated memory region of `size` bytes.
    pub fn new(size: usize) -> Self {
        let words = size.div_ceil(core::mem::size_of::<u64>());
        let buffer = alloc::vec![0u64; words].into_boxed_slice();
        // The buffer is only reached through `base` from here on, so every pointer handed out
        // by `translate` carries write permission.
        let base = NonNull::from(alloc::boxed::Box::leak(buffer)).cast::<u64>();
        Self { base, words }
    }

    /// Translates a physical address to a pointer into the buffer.
    pub fn translate(&self, phys: usize) -> *mut u8 {
        assert!(phys < self.size(), "physical address out of bounds");
        // SAFETY: `phys` is within the buffer, checked above.
        unsafe { self.base.cast::<u8>().as_ptr().add(phys) }
    }

    /// Returns the size of the emulated memory region in bytes.
    pub fn size(&self) -> usize {
        self.words * core::mem::size_of::<u64>()
    }
}

impl Drop for EmulatedMemory {
    fn drop(&mut self) {
        let slice = core::ptr::slice_from_raw_parts_mut(self.base.as_ptr(), self.words);
        // SAFETY: `base` came from `Box::leak` of a boxed slice of exactly `words` elements.
        drop(unsafe { alloc::boxed::Box::from_raw(slice) });
    }
}
