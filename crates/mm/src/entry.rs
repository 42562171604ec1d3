//! Page directory and page table entries.
//!
//! Both levels of the page table share one 32-bit entry format:
//!
//! ```text
//!  31                  12 11        3   2   1   0
//! [   frame number       |  unused   | U | W | P ]
//! ```

use core::fmt;

use crate::{FrameNumber, PhysicalAddress};

/// Permission and presence bits of a [`PageEntry`].
#[derive(Clone, Copy, PartialEq, Eq, Default)]
#[repr(transparent)]
pub struct PageFlags(u32);

impl PageFlags {
    /// Present bit (bit 0).
    const PRESENT: u32 = 1 << 0;

    /// Writable bit (bit 1).
    const WRITABLE: u32 = 1 << 1;

    /// User-accessible bit (bit 2).
    const USER: u32 = 1 << 2;

    const MASK: u32 = Self::PRESENT | Self::WRITABLE | Self::USER;

    /// Creates empty flags.
    pub const fn empty() -> Self {
        Self(0)
    }

    /// Flags for a present, writable, supervisor mapping.
    pub const fn kernel() -> Self {
        Self(Self::PRESENT | Self::WRITABLE)
    }

    /// Flags for a present, writable, user-accessible mapping.
    pub const fn user() -> Self {
        Self(Self::PRESENT | Self::WRITABLE | Self::USER)
    }

    /// Flags of an unused directory slot: writable once filled, not present.
    pub const fn absent_kernel() -> Self {
        Self(Self::WRITABLE)
    }

    /// Flags of an entry that is not present but is writable and user-accessible once filled.
    ///
    /// Freshly created leaf tables start out like this.
    pub const fn absent_user() -> Self {
        Self(Self::WRITABLE | Self::USER)
    }

    /// Creates flags from raw bits. Bits outside P/W/U are dropped.
    pub const fn from_raw(raw: u32) -> Self {
        Self(raw & Self::MASK)
    }

    /// Returns the raw bits.
    pub const fn to_raw(self) -> u32 {
        self.0
    }

    /// Returns whether the present bit is set.
    pub const fn is_present(self) -> bool {
        self.0 & Self::PRESENT != 0
    }

    /// Returns whether the writable bit is set.
    pub const fn is_writable(self) -> bool {
        self.0 & Self::WRITABLE != 0
    }

    /// Returns whether the user-accessible bit is set.
    pub const fn is_user(self) -> bool {
        self.0 & Self::USER != 0
    }
}

impl fmt::Debug for PageFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let bit = |set: bool, c: char| if set { c } else { '-' };
        write!(
            f,
            "PageFlags({}{}{})",
            bit(self.is_user(), 'U'),
            bit(self.is_writable(), 'W'),
            bit(self.is_present(), 'P')
        )
    }
}

/// A page directory or page table entry.
#[derive(Clone, Copy, PartialEq, Eq, Default)]
#[repr(transparent)]
pub struct PageEntry(u32);

impl PageEntry {
    /// Frame address bits (12-31).
    const ADDRESS_MASK: u32 = 0xFFFF_F000;

    /// Creates an entry pointing at the frame containing `address`.
    pub fn new(address: PhysicalAddress, flags: PageFlags) -> Self {
        debug_assert!(
            address.is_aligned(crate::PAGE_SIZE),
            "page entry address must be page-aligned"
        );
        Self((address.as_usize() as u32 & Self::ADDRESS_MASK) | flags.to_raw())
    }

    /// Creates an entry pointing at `frame`.
    pub fn for_frame(frame: FrameNumber, flags: PageFlags) -> Self {
        Self::new(frame.start(), flags)
    }

    /// Creates an entry with no frame and the given flags.
    pub const fn from_flags(flags: PageFlags) -> Self {
        Self(flags.to_raw())
    }

    /// Returns the physical address stored in this entry.
    ///
    /// Returns None if the entry is not present.
    pub fn address(self) -> Option<PhysicalAddress> {
        self.is_present()
            .then(|| PhysicalAddress::from(self.0 & Self::ADDRESS_MASK))
    }

    /// Returns the frame this entry points at, or None if the entry is not present.
    pub fn frame(self) -> Option<FrameNumber> {
        self.address().map(PhysicalAddress::frame_number)
    }

    /// Returns the flags for this entry.
    pub const fn flags(self) -> PageFlags {
        PageFlags::from_raw(self.0)
    }

    /// Returns whether this entry is present.
    pub const fn is_present(self) -> bool {
        self.flags().is_present()
    }

    /// Clears the present bit, keeping the frame and permission bits.
    pub fn clear(&mut self) {
        self.0 &= !PageFlags::PRESENT;
    }

    /// Returns the raw entry.
    pub const fn as_u32(self) -> u32 {
        self.0
    }
}

impl fmt::Debug for PageEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PageEntry")
            .field("address", &format_args!("{:#010x}", self.0 & Self::ADDRESS_MASK))
            .field("flags", &self.flags())
            .finish()
    }
}
