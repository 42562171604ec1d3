//! Address types for physical and virtual memory management.
//!
//! This module provides typed wrappers around physical and virtual addresses and the
//! translator the memory manager uses to touch physical memory (bitmaps, page directories
//! and leaf tables all live in frames).

use core::fmt;
use core::ops::{Add, Sub};

use crate::{FrameNumber, PageNumber, arch};

#[cfg(any(test, feature = "software-emulation"))]
use crate::arch::EmulatedMemory;

/// Address translator for reaching physical memory from kernel code.
///
/// This enum supports two modes:
/// - Hardware: physical memory is mapped at a fixed offset (0 for an identity-mapped kernel)
/// - Emulated: physical memory is an emulated host buffer (testing mode)
pub enum AddressTranslator {
    /// Hardware translation using a direct-map offset.
    Hardware { direct_map_offset: usize },
    /// Emulated translation using a simulated memory region.
    #[cfg(any(test, feature = "software-emulation"))]
    Emulated(EmulatedMemory),
}

impl AddressTranslator {
    /// Creates a new hardware translator with the given direct-map offset.
    pub const fn hardware(direct_map_offset: usize) -> Self {
        Self::Hardware { direct_map_offset }
    }

    /// Creates a hardware translator for a kernel that sees physical memory one-to-one.
    pub const fn identity() -> Self {
        Self::Hardware {
            direct_map_offset: 0,
        }
    }

    /// Creates a new emulated translator with `size` bytes of zeroed physical memory.
    #[cfg(any(test, feature = "software-emulation"))]
    pub fn emulated(size: usize) -> Self {
        Self::Emulated(EmulatedMemory::new(size))
    }

    /// Sets the global address translator.
    ///
    /// This function must be called exactly once during initialization, before any frame
    /// pool is created.
    ///
    /// # Panics
    ///
    /// Panics if the translator has already been set.
    pub fn set_current(translator: AddressTranslator) {
        #[cfg(not(any(test, feature = "software-emulation")))]
        {
            if ADDRESS_TRANSLATOR.get().is_some() {
                panic!("address translator already set");
            }
            ADDRESS_TRANSLATOR.call_once(|| translator);
        }

        #[cfg(any(test, feature = "software-emulation"))]
        {
            ADDRESS_TRANSLATOR.with(|t| {
                if t.get().is_some() {
                    panic!("address translator already set");
                }
                t.call_once(|| translator);
            });
        }
    }

    /// Returns a reference to the current global address translator.
    ///
    /// # Panics
    ///
    /// Panics if the translator has not been set yet.
    pub fn current() -> &'static AddressTranslator {
        #[cfg(not(any(test, feature = "software-emulation")))]
        {
            ADDRESS_TRANSLATOR.get().expect(
                "address translator not set; call AddressTranslator::set_current during initialization",
            )
        }

        #[cfg(any(test, feature = "software-emulation"))]
        {
            ADDRESS_TRANSLATOR.with(|t| {
                let translator = t.get().expect(
                    "address translator not set; call AddressTranslator::set_current during initialization",
                );
                // SAFETY: The thread-local outlives every caller on this thread and is never
                // replaced once set (spin::Once guarantees this).
                unsafe { &*(translator as *const AddressTranslator) }
            })
        }
    }

    /// Translates a physical address to the kernel-visible address of the same byte.
    pub fn phys_to_virt(&self, phys: usize) -> usize {
        match self {
            Self::Hardware { direct_map_offset } => phys.wrapping_add(*direct_map_offset),
            #[cfg(any(test, feature = "software-emulation"))]
            Self::Emulated(mem) => mem.translate(phys) as usize,
        }
    }

    /// Translates a physical address to a typed pointer.
    pub fn phys_to_ptr<T>(&self, phys: PhysicalAddress) -> *mut T {
        self.phys_to_virt(phys.as_usize()) as *mut T
    }
}

/// Global address translator.
///
/// This is initialized once during kernel initialization (with Hardware variant).
/// In test/software-emulation mode, this is thread-local to allow each test to have its own
/// emulated memory space.
#[cfg(not(any(test, feature = "software-emulation")))]
static ADDRESS_TRANSLATOR: spin::Once<AddressTranslator> = spin::Once::new();

#[cfg(any(test, feature = "software-emulation"))]
std::thread_local! {
    static ADDRESS_TRANSLATOR: spin::Once<AddressTranslator> = const { spin::Once::new() };
}

/// Macro to define common address type functionality.
macro_rules! impl_address_common {
    ($name:ident, $validate:path, $message:literal, $doc:expr) => {
        #[doc = $doc]
        #[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
        #[repr(transparent)]
        pub struct $name(usize);

        impl $name {
            /// Creates a new address.
            ///
            /// # Panics
            ///
            /// Panics if the address does not fit in the 32-bit address space.
            #[inline]
            pub const fn new(addr: usize) -> Self {
                assert!($validate(addr), $message);
                Self(addr)
            }

            /// Creates an address if it fits in the 32-bit address space.
            #[inline]
            pub const fn try_new(addr: usize) -> Option<Self> {
                if $validate(addr) { Some(Self(addr)) } else { None }
            }

            /// Returns the raw address value.
            #[inline]
            pub const fn as_usize(self) -> usize {
                self.0
            }

            /// Checks if the address is aligned to the given alignment.
            ///
            /// # Panics
            ///
            /// Panics if `align` is not a power of two.
            #[inline]
            pub const fn is_aligned(self, align: usize) -> bool {
                assert!(align.is_power_of_two(), "alignment must be a power of two");
                self.0 & (align - 1) == 0
            }

            /// Aligns the address down to the given alignment.
            ///
            /// # Panics
            ///
            /// Panics if `align` is not a power of two.
            #[inline]
            pub const fn align_down(self, align: usize) -> Self {
                assert!(align.is_power_of_two(), "alignment must be a power of two");
                Self(self.0 & !(align - 1))
            }

            /// Returns the offset of this address within its page.
            #[inline]
            pub const fn page_offset(self) -> usize {
                self.0 & (arch::PAGE_SIZE - 1)
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({:#010x})", stringify!($name), self.0)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{:#010x}", self.0)
            }
        }

        impl From<u32> for $name {
            #[inline]
            fn from(addr: u32) -> Self {
                Self(addr as usize)
            }
        }

        impl Add<usize> for $name {
            type Output = Self;

            #[inline]
            fn add(self, rhs: usize) -> Self::Output {
                Self::new(self.0 + rhs)
            }
        }

        impl Sub<usize> for $name {
            type Output = Self;

            #[inline]
            fn sub(self, rhs: usize) -> Self::Output {
                Self::new(self.0 - rhs)
            }
        }

        impl Sub<$name> for $name {
            type Output = usize;

            #[inline]
            fn sub(self, rhs: $name) -> Self::Output {
                self.0 - rhs.0
            }
        }
    };
}

impl_address_common!(
    PhysicalAddress,
    arch::validate_physical,
    "physical address exceeds maximum width",
    "A physical memory address.\n\n\
     Converts to and from [`FrameNumber`] without manual `* PAGE_SIZE` arithmetic."
);

impl PhysicalAddress {
    /// Returns the frame containing this physical address.
    #[inline]
    pub const fn frame_number(self) -> FrameNumber {
        FrameNumber::new(self.0 / arch::PAGE_SIZE)
    }
}

impl_address_common!(
    VirtualAddress,
    arch::validate_virtual,
    "virtual address exceeds maximum width",
    "A virtual memory address.\n\n\
     Besides alignment helpers, it splits into the directory and leaf-table indices used by\n\
     the two-level page table."
);

impl VirtualAddress {
    /// Returns the page containing this virtual address.
    #[inline]
    pub const fn page_number(self) -> PageNumber {
        PageNumber::new(self.0 / arch::PAGE_SIZE)
    }

    /// Returns the page-directory index (top 10 bits).
    #[inline]
    pub const fn directory_index(self) -> usize {
        arch::directory_index(self.0)
    }

    /// Returns the leaf-table index (bits 12-21).
    #[inline]
    pub const fn table_index(self) -> usize {
        arch::table_index(self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    mod physical_address {
        use super::*;

        #[test]
        fn new_valid_address() {
            let addr = PhysicalAddress::new(0x0010_0000);
            assert_eq!(addr.as_usize(), 0x0010_0000);
        }

        #[test]
        fn new_max_valid_address() {
            let addr = PhysicalAddress::new(0xFFFF_FFFF);
            assert_eq!(addr.as_usize(), 0xFFFF_FFFF);
        }

        #[test]
        #[should_panic(expected = "physical address exceeds maximum width")]
        fn new_exceeds_max() {
            PhysicalAddress::new(1usize << 32);
        }

        #[test]
        fn try_new_rejects_wide_address() {
            assert_eq!(PhysicalAddress::try_new(1usize << 32), None);
            assert!(PhysicalAddress::try_new(0x1000).is_some());
        }

        #[test]
        fn alignment() {
            let addr = PhysicalAddress::new(arch::PAGE_SIZE * 4);
            assert!(addr.is_aligned(arch::PAGE_SIZE));
            assert!(!addr.is_aligned(arch::PAGE_SIZE * 8));
            assert_eq!(
                PhysicalAddress::new(0x1234).align_down(arch::PAGE_SIZE),
                PhysicalAddress::new(0x1000)
            );
        }

        #[test]
        fn frame_number_truncates_offset() {
            let addr = PhysicalAddress::new(arch::PAGE_SIZE * 3 + 10);
            assert_eq!(addr.frame_number(), FrameNumber::new(3));
            assert_eq!(addr.page_offset(), 10);
        }

        #[test]
        fn debug_format() {
            let addr = PhysicalAddress::new(0x0100);
            assert_eq!(format!("{:?}", addr), "PhysicalAddress(0x00000100)");
            assert_eq!(format!("{}", addr), "0x00000100");
        }
    }

    mod virtual_address {
        use super::*;

        #[test]
        #[should_panic(expected = "virtual address exceeds maximum width")]
        fn new_exceeds_max() {
            VirtualAddress::new(0x1_0000_0000);
        }

        #[test]
        fn splits_into_indices() {
            // 0b0100000001 0000000011 000000000101
            let addr = VirtualAddress::new((0x101 << 22) | (0x3 << 12) | 0x5);
            assert_eq!(addr.directory_index(), 0x101);
            assert_eq!(addr.table_index(), 0x3);
            assert_eq!(addr.page_offset(), 0x5);
        }

        #[test]
        fn top_of_address_space() {
            let addr = VirtualAddress::new(0xFFFF_FFFF);
            assert_eq!(addr.directory_index(), 1023);
            assert_eq!(addr.table_index(), 1023);
            assert_eq!(addr.page_offset(), 0xFFF);
        }

        #[test]
        fn page_number() {
            let addr = VirtualAddress::new(0x4000_2123);
            assert_eq!(addr.page_number(), PageNumber::new(0x4_0002));
        }

        #[test]
        fn arithmetic() {
            let addr = VirtualAddress::new(0x4000_0000);
            assert_eq!((addr + 0x1000).as_usize(), 0x4000_1000);
            assert_eq!((addr - 0x1000).as_usize(), 0x3FFF_F000);
            assert_eq!((addr + 0x1000) - addr, 0x1000);
        }
    }

    mod translator {
        use super::*;

        #[test]
        fn emulated_addresses_are_buffer_offsets() {
            AddressTranslator::set_current(AddressTranslator::emulated(4 * arch::PAGE_SIZE));
            let translator = AddressTranslator::current();
            let start = translator.phys_to_virt(0);
            assert_eq!(translator.phys_to_virt(0x1010) - start, 0x1010);
            let ptr = translator.phys_to_ptr::<u32>(PhysicalAddress::new(0x2000));
            assert_eq!(ptr as usize - start, 0x2000);
        }

        #[test]
        fn hardware_offset() {
            let translator = AddressTranslator::hardware(0xC000_0000);
            assert_eq!(translator.phys_to_virt(0x1000), 0xC000_1000);
            assert_eq!(AddressTranslator::identity().phys_to_virt(0x1234), 0x1234);
        }

        #[test]
        #[should_panic(expected = "address translator already set")]
        fn panics_on_double_set() {
            AddressTranslator::set_current(AddressTranslator::identity());
            AddressTranslator::set_current(AddressTranslator::identity());
        }
    }
}
