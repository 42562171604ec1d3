//! x86 hardware implementation.
//!
//! Control-register access for the two-level (non-PAE, 4 KiB page) translation format. The
//! CPU must already run with that paging mode selected; this module only loads the page
//! directory, reads the fault address and flips the paging-enable bit.

use x86_64::{
    PhysAddr,
    registers::control::{Cr0, Cr0Flags, Cr2, Cr3, Cr3Flags},
    structures::paging::PhysFrame,
};

use crate::{PhysicalAddress, VirtualAddress};

/// Loads a page directory into CR3, flushing all non-global cached translations.
pub fn write_page_table_base(directory: PhysicalAddress) {
    let frame = PhysFrame::containing_address(PhysAddr::new(directory.as_usize() as u64));
    // SAFETY: Page directories are only built by `PageTable::new`, which identity-maps the
    // shared kernel region, so the code performing this write stays mapped after it.
    unsafe {
        Cr3::write(frame, Cr3Flags::empty());
    }
}

/// Reads the physical address of the active page directory from CR3.
pub fn read_page_table_base() -> PhysicalAddress {
    let (frame, _) = Cr3::read();
    PhysicalAddress::new(frame.start_address().as_u64() as usize)
}

/// Reads the faulting linear address from CR2.
pub fn read_fault_address() -> VirtualAddress {
    // Linear addresses are 32 bits wide in this paging mode.
    VirtualAddress::new(Cr2::read_raw() as u32 as usize)
}

/// Sets CR0.PG. There is no way back.
pub fn enable_paging() {
    // SAFETY: A page directory has been loaded into CR3 before paging is enabled, and it maps
    // the running kernel one-to-one.
    unsafe {
        Cr0::update(|flags| flags.insert(Cr0Flags::PAGING));
    }
}

/// Returns whether CR0.PG is set.
pub fn is_paging_enabled() -> bool {
    Cr0::read().contains(Cr0Flags::PAGING)
}
