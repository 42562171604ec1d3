//! Two-level page tables with demand paging.
//!
//! A [`PageTable`] owns a page directory frame and the leaf table that identity-maps the shared
//! region at the bottom of every address space. Everything else starts unmapped: the first
//! access to a page faults, and [`PageTable::handle_fault`] installs a leaf table (if the
//! directory slot is empty) and a data frame.
//!
//! Paging configuration, the loaded directory and the ranges of registered [`VmPool`]s are
//! process-wide.

use alloc::vec::Vec;

use crate::global::kernel_global;
use crate::{
    ENTRIES_PER_TABLE, FrameError, FrameNumber, FramePool, HumanSize, PAGE_SIZE, PageEntry,
    PageFlags, PageNumber, PhysicalAddress, PoolId, Region, VirtualAddress, VmPool, arch,
};

/// Largest shared region: everything one leaf table maps.
const MAX_SHARED_SIZE: usize = ENTRIES_PER_TABLE * PAGE_SIZE;

/// Errors reported while building or editing page tables.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PagingError {
    /// [`PageTable::init_paging`] has not been called.
    NotInitialized,
    /// The shared region is larger than one leaf table maps, or not page aligned.
    SharedRegionTooLarge,
    /// The kernel frame pool has no frame for a directory or table.
    OutOfFrames,
    /// The page lies in the identity-mapped shared region, which is never freed.
    SharedPage,
    /// A frame pool rejected an operation.
    Frame(FrameError),
}

impl From<FrameError> for PagingError {
    fn from(err: FrameError) -> Self {
        match err {
            FrameError::OutOfFrames => Self::OutOfFrames,
            err => Self::Frame(err),
        }
    }
}

/// Errors reported by the page fault handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultError {
    /// The fault was raised on a present page. Protection faults are not handled.
    ProtectionViolation,
    /// The address lies outside every virtual memory pool of the faulting address space.
    IllegitimateAddress,
    /// Paging has not been configured.
    NotInitialized,
    /// No frame was left for the leaf table or the page.
    OutOfFrames,
}

impl From<FrameError> for FaultError {
    fn from(err: FrameError) -> Self {
        // Single-frame requests fail only by exhaustion or against an unregistered pool.
        match err {
            FrameError::UnknownPool => Self::NotInitialized,
            _ => Self::OutOfFrames,
        }
    }
}

/// Processor state of a page fault, as handed over by the trap layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FaultContext {
    address: VirtualAddress,
    error_code: u32,
}

impl FaultContext {
    /// Error code bit set when the fault hit a present page.
    const PROTECTION: u32 = 1 << 0;

    /// Creates a fault context from its parts.
    pub const fn new(address: VirtualAddress, error_code: u32) -> Self {
        Self {
            address,
            error_code,
        }
    }

    /// Creates the context of the fault being handled, reading the faulting address from the
    /// fault address register.
    pub fn from_trap(error_code: u32) -> Self {
        Self::new(arch::read_fault_address(), error_code)
    }

    /// Returns the faulting virtual address.
    pub const fn address(&self) -> VirtualAddress {
        self.address
    }

    /// Returns the raw error code.
    pub const fn error_code(&self) -> u32 {
        self.error_code
    }

    /// Returns whether the fault hit a present page.
    pub const fn is_protection_violation(&self) -> bool {
        self.error_code & Self::PROTECTION != 0
    }
}

/// What [`PageTable::handle_fault`] did to resolve a fault.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultOutcome {
    /// A data frame was installed in an existing leaf table.
    Mapped { frame: FrameNumber },
    /// A leaf table was created, then a data frame installed in it.
    MappedWithNewTable {
        table: FrameNumber,
        frame: FrameNumber,
    },
    /// The page was already mapped; nothing was allocated.
    AlreadyPresent,
}

impl FaultOutcome {
    /// Returns the number of frames taken to resolve the fault.
    pub const fn frames_allocated(&self) -> usize {
        match self {
            Self::Mapped { .. } => 1,
            Self::MappedWithNewTable { .. } => 2,
            Self::AlreadyPresent => 0,
        }
    }
}

#[derive(Clone, Copy)]
struct PagingConfig {
    /// Frames for directories and leaf tables.
    kernel_pool: PoolId,
    /// Frames for pages outside any registered virtual memory pool.
    process_pool: PoolId,
    shared_size: usize,
}

/// A virtual memory pool's range, as registered with a page table.
struct RegisteredRange {
    directory: FrameNumber,
    region: Region,
    frame_pool: PoolId,
}

struct PagingState {
    config: Option<PagingConfig>,
    current: Option<FrameNumber>,
    enabled: bool,
    ranges: Vec<RegisteredRange>,
}

impl PagingState {
    const fn new() -> Self {
        Self {
            config: None,
            current: None,
            enabled: false,
            ranges: Vec::new(),
        }
    }
}

kernel_global! {
    static PAGING: PagingState = PagingState::new();
    fn with_paging;
}

type Table = [PageEntry; ENTRIES_PER_TABLE];

/// Returns the page directory or leaf table stored in `frame`.
///
/// # Safety
///
/// `frame` must hold a directory or table of this module, reachable through the current
/// address translator, with no other live reference to it.
unsafe fn table_mut<'a>(frame: FrameNumber) -> &'a mut Table {
    let ptr = crate::AddressTranslator::current().phys_to_ptr::<Table>(frame.start());
    // SAFETY: Guaranteed by the caller. Frames are page aligned, which satisfies `Table`.
    unsafe { &mut *ptr }
}

/// A two-level page table.
#[derive(Debug)]
pub struct PageTable {
    directory: FrameNumber,
}

impl PageTable {
    /// Configures paging: the pool for directory and table frames, the pool for data frames,
    /// and the size of the identity-mapped region shared by every address space.
    pub fn init_paging(kernel_pool: PoolId, process_pool: PoolId, shared_size: usize) {
        with_paging(|state| {
            state.config = Some(PagingConfig {
                kernel_pool,
                process_pool,
                shared_size,
            });
        });
        log::info!(
            "paging configured: kernel frames from {:?}, process frames from {:?}, {} shared",
            kernel_pool,
            process_pool,
            HumanSize(shared_size)
        );
    }

    fn config() -> Option<PagingConfig> {
        with_paging(|state| state.config)
    }

    /// Returns the size of the identity-mapped shared region, or `None` before
    /// [`init_paging`](Self::init_paging).
    pub fn shared_size() -> Option<usize> {
        Self::config().map(|config| config.shared_size)
    }

    /// Creates a page table mapping only the shared region.
    ///
    /// Takes two frames from the kernel pool: the directory and the leaf table that
    /// identity-maps the shared region through directory entry 0.
    pub fn new() -> Result<Self, PagingError> {
        let Some(config) = Self::config() else {
            log::error!("cannot create a page table before paging is configured");
            return Err(PagingError::NotInitialized);
        };
        if config.shared_size > MAX_SHARED_SIZE || config.shared_size % PAGE_SIZE != 0 {
            log::error!(
                "shared region of {} bytes is not page aligned or exceeds {}",
                config.shared_size,
                HumanSize(MAX_SHARED_SIZE)
            );
            return Err(PagingError::SharedRegionTooLarge);
        }

        let directory = config.kernel_pool.get_frames(1)?;
        let direct = match config.kernel_pool.get_frames(1) {
            Ok(frame) => frame,
            Err(err) => {
                if let Err(release_err) = FramePool::release_frames(directory) {
                    log::warn!(
                        "could not return directory frame {}: {:?}",
                        directory,
                        release_err
                    );
                }
                return Err(err.into());
            }
        };

        let shared_pages = config.shared_size / PAGE_SIZE;
        // SAFETY: Both frames were just allocated for this table.
        let (directory_table, direct_table) = unsafe { (table_mut(directory), table_mut(direct)) };

        for (index, entry) in direct_table.iter_mut().enumerate() {
            *entry = if index < shared_pages {
                PageEntry::new(PhysicalAddress::new(index * PAGE_SIZE), PageFlags::kernel())
            } else {
                PageEntry::default()
            };
        }

        directory_table[0] = PageEntry::for_frame(direct, PageFlags::kernel());
        directory_table[1..].fill(PageEntry::from_flags(PageFlags::absent_kernel()));

        log::info!(
            "page table created: directory at frame {}, {} shared pages mapped",
            directory,
            shared_pages
        );
        Ok(Self { directory })
    }

    /// Returns the frame holding the page directory.
    #[inline]
    pub fn directory(&self) -> FrameNumber {
        self.directory
    }

    /// Installs this page table in the page-table base register and records it as current.
    ///
    /// Cached translations are flushed as a side effect.
    pub fn load(&self) {
        arch::write_page_table_base(self.directory.start());
        with_paging(|state| state.current = Some(self.directory));
        log::debug!("loaded page table at frame {}", self.directory);
    }

    /// Turns paging on. There is no way to turn it off again.
    pub fn enable_paging() {
        with_paging(|state| state.enabled = true);
        arch::enable_paging();
        log::info!("paging enabled");
    }

    /// Returns whether [`enable_paging`](Self::enable_paging) has been called.
    pub fn paging_enabled() -> bool {
        with_paging(|state| state.enabled)
    }

    /// Returns the directory frame of the most recently loaded page table.
    pub fn current_directory() -> Option<FrameNumber> {
        with_paging(|state| state.current)
    }

    /// Records `pool`'s range against this page table.
    ///
    /// Once any pool is registered, faults in this address space are only resolved inside
    /// registered ranges or the shared region, and each pool's pages come from its own frame
    /// pool.
    pub fn register_pool(&self, pool: &VmPool<'_>) {
        let range = RegisteredRange {
            directory: self.directory,
            region: Region::new(pool.base(), pool.size()),
            frame_pool: pool.frame_pool(),
        };
        log::debug!(
            "page table at frame {}: registered pool {:?}",
            self.directory,
            range.region
        );
        with_paging(|state| state.ranges.push(range));
    }

    /// Forgets the pool registered at `base`. Faults in its range are no longer resolved.
    pub fn unregister_pool(&self, base: VirtualAddress) {
        let directory = self.directory;
        let removed = with_paging(|state| {
            let before = state.ranges.len();
            state
                .ranges
                .retain(|range| range.directory != directory || range.region.base() != base);
            before - state.ranges.len()
        });
        if removed == 0 {
            log::warn!(
                "page table at frame {}: no pool registered at {}",
                directory,
                base
            );
        } else {
            log::debug!("page table at frame {}: unregistered pool at {}", directory, base);
        }
    }

    /// Resolves a page fault in the address space loaded in the page-table base register.
    ///
    /// Only faults on absent pages are handled. A fault whose directory slot is empty costs two
    /// frames (a leaf table from the kernel pool plus the page); otherwise one.
    pub fn handle_fault(context: &FaultContext) -> Result<FaultOutcome, FaultError> {
        let address = context.address();
        if context.is_protection_violation() {
            log::error!(
                "protection fault at {} (error code {:#x}) is not handled",
                address,
                context.error_code()
            );
            return Err(FaultError::ProtectionViolation);
        }

        let directory = arch::read_page_table_base().frame_number();
        let (kernel_pool, page_pool) = with_paging(|state| {
            let Some(config) = state.config else {
                log::error!("page fault at {} before paging is configured", address);
                return Err(FaultError::NotInitialized);
            };

            let mut ranges = state
                .ranges
                .iter()
                .filter(|range| range.directory == directory)
                .peekable();
            if ranges.peek().is_none() {
                return Ok((config.kernel_pool, config.process_pool));
            }
            if let Some(range) = ranges.find(|range| range.region.contains(address)) {
                return Ok((config.kernel_pool, range.frame_pool));
            }
            if address.as_usize() < config.shared_size {
                return Ok((config.kernel_pool, config.process_pool));
            }

            log::error!("page fault at {} outside every virtual memory pool", address);
            Err(FaultError::IllegitimateAddress)
        })?;

        // SAFETY: The loaded directory was built by `PageTable::new`.
        let directory_table = unsafe { table_mut(directory) };
        let directory_entry = &mut directory_table[address.directory_index()];

        let (table_frame, new_table) = match directory_entry.frame() {
            Some(frame) => (frame, false),
            None => {
                let frame = kernel_pool.get_frames(1)?;
                // SAFETY: The frame was just allocated for this table.
                let table = unsafe { table_mut(frame) };
                table.fill(PageEntry::from_flags(PageFlags::absent_user()));
                *directory_entry = PageEntry::for_frame(frame, PageFlags::kernel());
                log::debug!(
                    "new page table at frame {} for directory slot {}",
                    frame,
                    address.directory_index()
                );
                (frame, true)
            }
        };

        // SAFETY: Present directory entries point at leaf tables of this module.
        let table = unsafe { table_mut(table_frame) };
        let entry = &mut table[address.table_index()];
        if entry.is_present() {
            log::warn!("page fault at {} on a page that is already mapped", address);
            return Ok(FaultOutcome::AlreadyPresent);
        }

        let frame = page_pool.get_frames(1)?;
        *entry = PageEntry::for_frame(frame, PageFlags::kernel());
        log::debug!("page fault at {}: mapped frame {}", address, frame);

        Ok(if new_table {
            FaultOutcome::MappedWithNewTable {
                table: table_frame,
                frame,
            }
        } else {
            FaultOutcome::Mapped { frame }
        })
    }

    /// Returns the directory entry covering `address`.
    pub fn directory_entry(&self, address: VirtualAddress) -> PageEntry {
        // SAFETY: The directory belongs to this table.
        let directory = unsafe { table_mut(self.directory) };
        directory[address.directory_index()]
    }

    /// Returns the leaf entry for `address`, or `None` if its directory slot is empty.
    pub fn table_entry(&self, address: VirtualAddress) -> Option<PageEntry> {
        let table = self.directory_entry(address).frame()?;
        // SAFETY: Present directory entries point at leaf tables of this module.
        Some(unsafe { table_mut(table) }[address.table_index()])
    }

    /// Translates `address` by walking this table in software.
    pub fn translate(&self, address: VirtualAddress) -> Option<PhysicalAddress> {
        let frame = self.table_entry(address)?.frame()?;
        Some(frame.start() + address.page_offset())
    }

    /// Unmaps `page` and returns its frame to the owning frame pool.
    ///
    /// Returns `false` if the page was not mapped. Pages of the shared region are refused. If
    /// the frame pool rejects the frame, the page stays unmapped and the error is returned.
    pub fn free_page(&self, page: PageNumber) -> Result<bool, PagingError> {
        let address = page.start();
        let shared_size = Self::shared_size().unwrap_or(0);
        if address.as_usize() < shared_size {
            log::error!("refusing to free page {} of the shared region", address);
            return Err(PagingError::SharedPage);
        }

        let Some(table) = self.directory_entry(address).frame() else {
            return Ok(false);
        };

        // SAFETY: Present directory entries point at leaf tables of this module.
        let entry = &mut unsafe { table_mut(table) }[address.table_index()];
        let Some(frame) = entry.frame() else {
            return Ok(false);
        };

        entry.clear();
        FramePool::release_frames(frame)?;
        log::debug!("freed page {} (frame {})", address, frame);
        Ok(true)
    }
}
