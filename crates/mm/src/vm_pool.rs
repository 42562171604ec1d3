//! Virtual memory pools.
//!
//! A [`VmPool`] hands out page-granular regions of one virtual range by bumping a cursor.
//! Nothing is mapped at allocation time: pages are backed by frames when first touched, through
//! [`PageTable::handle_fault`], and returned when their region is released.
//!
//! The leading page of every pool is reserved for the pool's region table. It is tracked as the
//! pool's metadata region and never appears among the client regions.

use core::fmt;

use crate::{HumanSize, PAGE_SIZE, PageNumber, PageTable, PagingError, PoolId, VirtualAddress};

/// Maximum number of client regions a pool tracks: as many descriptors as fit in one page.
pub const MAX_REGIONS: usize = PAGE_SIZE / core::mem::size_of::<Region>();

/// Errors reported by virtual memory pools.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmError {
    /// A request for zero bytes.
    ZeroSize,
    /// The pool already tracks [`MAX_REGIONS`] regions.
    RegionsFull,
    /// The region would run past the end of the pool.
    OutOfSpace,
    /// No region starts at the given address.
    UnknownRegion,
    /// The pool's base or size is unusable.
    InvalidLayout,
    /// The page table failed while unmapping a region.
    Paging(PagingError),
}

impl From<PagingError> for VmError {
    fn from(err: PagingError) -> Self {
        Self::Paging(err)
    }
}

/// A contiguous, page-aligned range of virtual memory.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Region {
    base: VirtualAddress,
    size: usize,
}

impl Region {
    /// Creates a new region.
    pub const fn new(base: VirtualAddress, size: usize) -> Self {
        Self { base, size }
    }

    /// Returns the first address of the region.
    #[inline]
    pub const fn base(&self) -> VirtualAddress {
        self.base
    }

    /// Returns the size of the region in bytes.
    #[inline]
    pub const fn size(&self) -> usize {
        self.size
    }

    /// Returns the raw address one past the end of the region.
    ///
    /// Raw, because a region may end exactly at the top of the address space.
    #[inline]
    pub const fn end(&self) -> usize {
        self.base.as_usize() + self.size
    }

    /// Returns true if the region contains `address`.
    #[inline]
    pub fn contains(&self, address: VirtualAddress) -> bool {
        address >= self.base && address - self.base < self.size
    }

    /// Returns true if this region overlaps with another region.
    pub const fn overlaps(&self, other: &Region) -> bool {
        self.base.as_usize() < other.end() && other.base.as_usize() < self.end()
    }

    /// Returns the pages making up the region.
    pub fn pages(&self) -> impl Iterator<Item = PageNumber> + use<> {
        let first = self.base.page_number().as_usize();
        (first..first + self.size.div_ceil(PAGE_SIZE)).map(PageNumber::new)
    }
}

impl fmt::Debug for Region {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Region({}..{:#010x})", self.base, self.end())
    }
}

/// Dense, insertion-ordered table of client regions.
struct RegionTable {
    regions: [Option<Region>; MAX_REGIONS],
    count: usize,
}

impl RegionTable {
    const fn new() -> Self {
        Self {
            regions: [None; MAX_REGIONS],
            count: 0,
        }
    }

    const fn len(&self) -> usize {
        self.count
    }

    const fn is_full(&self) -> bool {
        self.count >= MAX_REGIONS
    }

    fn iter(&self) -> impl Iterator<Item = &Region> {
        self.regions[..self.count].iter().filter_map(|r| r.as_ref())
    }

    /// Appends a region. The caller checks [`is_full`](Self::is_full) first.
    fn push(&mut self, region: Region) {
        debug_assert!(!self.is_full());
        self.regions[self.count] = Some(region);
        self.count += 1;
    }

    /// Removes the region at `index`, shifting later regions down.
    fn remove(&mut self, index: usize) -> Option<Region> {
        if index >= self.count {
            return None;
        }

        let region = self.regions[index];
        for i in index..self.count - 1 {
            self.regions[i] = self.regions[i + 1];
        }

        self.regions[self.count - 1] = None;
        self.count -= 1;
        region
    }

    /// Finds the region starting at `base`, with its index.
    fn find(&self, base: VirtualAddress) -> Option<(usize, Region)> {
        self.iter()
            .enumerate()
            .find(|(_, region)| region.base == base)
            .map(|(index, region)| (index, *region))
    }
}

/// A bump allocator for regions of one virtual address range.
///
/// Released ranges are unmapped but never handed out again: every allocation starts where the
/// previous one ended.
pub struct VmPool<'pt> {
    base: VirtualAddress,
    size: usize,
    frame_pool: PoolId,
    page_table: &'pt PageTable,
    /// The leading page, reserved by the first allocation.
    metadata: Option<Region>,
    /// Offset from `base` of the next allocation.
    cursor: usize,
    regions: RegionTable,
}

impl<'pt> VmPool<'pt> {
    /// Creates a pool over `size` bytes of virtual memory starting at `base`, backed by frames
    /// from `frame_pool`, and registers it with `page_table`.
    ///
    /// `base` must be page aligned and `size` a multiple of [`PAGE_SIZE`] leaving room for at
    /// least one page after the metadata page. The range must not wrap the address space and
    /// must stay clear of the page table's shared region.
    pub fn new(
        base: VirtualAddress,
        size: usize,
        frame_pool: PoolId,
        page_table: &'pt PageTable,
    ) -> Result<Self, VmError> {
        let fits = base
            .as_usize()
            .checked_add(size)
            .is_some_and(|end| VirtualAddress::try_new(end - 1).is_some());
        if !base.is_aligned(PAGE_SIZE) || size % PAGE_SIZE != 0 || size < 2 * PAGE_SIZE || !fits {
            log::error!(
                "invalid virtual memory pool layout: base {}, {} bytes",
                base,
                size
            );
            return Err(VmError::InvalidLayout);
        }

        let shared = Region::new(
            VirtualAddress::new(0),
            PageTable::shared_size().unwrap_or(0),
        );
        if Region::new(base, size).overlaps(&shared) {
            log::error!(
                "virtual memory pool at {} overlaps the shared region {:?}",
                base,
                shared
            );
            return Err(VmError::InvalidLayout);
        }

        let pool = Self {
            base,
            size,
            frame_pool,
            page_table,
            metadata: None,
            cursor: 0,
            regions: RegionTable::new(),
        };
        page_table.register_pool(&pool);

        log::info!(
            "virtual memory pool: {}..{:#010x} ({}), frames from {:?}",
            base,
            base.as_usize() + size,
            HumanSize(size),
            frame_pool
        );
        Ok(pool)
    }

    /// Returns the first address of the pool.
    #[inline]
    pub fn base(&self) -> VirtualAddress {
        self.base
    }

    /// Returns the size of the pool in bytes.
    #[inline]
    pub fn size(&self) -> usize {
        self.size
    }

    /// Returns the frame pool backing this pool's pages.
    #[inline]
    pub fn frame_pool(&self) -> PoolId {
        self.frame_pool
    }

    /// Returns the page holding the region table, once the first allocation has reserved it.
    #[inline]
    pub fn metadata_region(&self) -> Option<Region> {
        self.metadata
    }

    /// Returns the client regions in allocation order.
    pub fn regions(&self) -> impl Iterator<Item = &Region> {
        self.regions.iter()
    }

    /// Returns the number of client regions.
    #[inline]
    pub fn region_count(&self) -> usize {
        self.regions.len()
    }

    /// Allocates a region of at least `size` bytes, rounded up to whole pages.
    ///
    /// The first allocation also reserves the leading page for the region table. No frames are
    /// taken here; pages are backed on first access.
    pub fn allocate(&mut self, size: usize) -> Result<VirtualAddress, VmError> {
        if size == 0 {
            log::error!("pool at {}: request for zero bytes", self.base);
            return Err(VmError::ZeroSize);
        }
        if self.regions.is_full() {
            log::error!(
                "pool at {}: all {} region slots in use",
                self.base,
                MAX_REGIONS
            );
            return Err(VmError::RegionsFull);
        }

        let start = if self.metadata.is_none() {
            PAGE_SIZE
        } else {
            self.cursor
        };
        let size = size
            .checked_next_multiple_of(PAGE_SIZE)
            .filter(|size| *size <= self.size - start);
        let Some(size) = size else {
            log::error!(
                "pool at {}: no room for the request ({} left)",
                self.base,
                HumanSize(self.size - start)
            );
            return Err(VmError::OutOfSpace);
        };

        if self.metadata.is_none() {
            self.metadata = Some(Region::new(self.base, PAGE_SIZE));
        }

        let region = Region::new(self.base + start, size);
        self.regions.push(region);
        self.cursor = start + size;

        log::debug!("pool at {}: allocated {:?}", self.base, region);
        Ok(region.base())
    }

    /// Releases the region starting at `start`, unmapping and freeing every page of it, then
    /// reloads the page table.
    ///
    /// The address range is not reused by later allocations. A page the page table fails to
    /// free does not stop the release: every page is unmapped and the region is removed, then
    /// the first failure is returned.
    pub fn release(&mut self, start: VirtualAddress) -> Result<(), VmError> {
        let Some((index, region)) = self.regions.find(start) else {
            log::error!("pool at {}: no region starts at {}", self.base, start);
            return Err(VmError::UnknownRegion);
        };

        let mut freed = 0;
        let mut failure = None;
        for page in region.pages() {
            match self.page_table.free_page(page) {
                Ok(true) => freed += 1,
                Ok(false) => {}
                Err(err) => {
                    log::warn!(
                        "pool at {}: freeing page {} failed: {:?}",
                        self.base,
                        page,
                        err
                    );
                    failure.get_or_insert(err);
                }
            }
        }

        self.regions.remove(index);
        self.page_table.load();

        if let Some(err) = failure {
            return Err(err.into());
        }

        log::debug!(
            "pool at {}: released {:?} ({} pages were backed)",
            self.base,
            region,
            freed
        );
        Ok(())
    }

    /// Returns whether `address` lies inside this pool.
    pub fn is_legitimate(&self, address: VirtualAddress) -> bool {
        Region::new(self.base, self.size).contains(address)
    }
}

impl Drop for VmPool<'_> {
    fn drop(&mut self) {
        self.page_table.unregister_pool(self.base);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        AddressTranslator, FaultContext, FaultError, FaultOutcome, FrameError, FrameNumber,
        FramePool, registers,
    };

    const POOL_BASE: usize = 0x4000_0000;
    const POOL_SIZE: usize = 4 * 1024 * 1024;

    /// 8 MiB machine: kernel pool on frames 512..1024, process pool on 1024..2048 and a 4 MiB
    /// shared region.
    fn boot() -> (PageTable, PoolId) {
        AddressTranslator::set_current(AddressTranslator::emulated(2048 * PAGE_SIZE));
        let kernel = FramePool::new(FrameNumber::new(512), 512, None, 1)
            .unwrap()
            .register();
        let info = kernel.get_frames(1).unwrap();
        let process = FramePool::new(FrameNumber::new(1024), 1024, Some(info), 1)
            .unwrap()
            .register();
        PageTable::init_paging(kernel, process, 4 * 1024 * 1024);

        let table = PageTable::new().unwrap();
        table.load();
        (table, process)
    }

    fn pool(table: &PageTable, frames: PoolId) -> VmPool<'_> {
        VmPool::new(VirtualAddress::new(POOL_BASE), POOL_SIZE, frames, table).unwrap()
    }

    fn touch(address: VirtualAddress) -> Result<FaultOutcome, FaultError> {
        registers::set_fault_address(address);
        PageTable::handle_fault(&FaultContext::from_trap(0b10))
    }

    #[test]
    fn first_allocation_skips_metadata_page() {
        let (table, frames) = boot();
        let mut pool = pool(&table, frames);
        assert_eq!(pool.metadata_region(), None);

        let first = pool.allocate(100).unwrap();
        assert_eq!(first, VirtualAddress::new(POOL_BASE + PAGE_SIZE));
        assert_eq!(
            pool.metadata_region(),
            Some(Region::new(VirtualAddress::new(POOL_BASE), PAGE_SIZE))
        );
        assert_eq!(pool.region_count(), 1);
        assert_eq!(pool.regions().next().unwrap().size(), PAGE_SIZE);
    }

    #[test]
    fn allocations_follow_each_other() {
        let (table, frames) = boot();
        let mut pool = pool(&table, frames);

        let a = pool.allocate(PAGE_SIZE).unwrap();
        let b = pool.allocate(2 * PAGE_SIZE).unwrap();
        let c = pool.allocate(1).unwrap();
        assert_eq!(b, a + PAGE_SIZE);
        assert_eq!(c, b + 2 * PAGE_SIZE);
    }

    #[test]
    fn allocations_never_overlap() {
        let (table, frames) = boot();
        let mut pool = pool(&table, frames);
        pool.allocate(PAGE_SIZE).unwrap();
        let metadata = pool.metadata_region().unwrap();
        for size in [1, PAGE_SIZE + 1, 3 * PAGE_SIZE, 17, 8 * PAGE_SIZE] {
            let start = pool.allocate(size).unwrap();
            assert!(pool.is_legitimate(start));
        }

        let regions: Vec<Region> = pool.regions().copied().collect();
        for (i, a) in regions.iter().enumerate() {
            assert!(!a.overlaps(&metadata));
            for b in &regions[i + 1..] {
                assert!(!a.overlaps(b), "{:?} overlaps {:?}", a, b);
            }
        }
    }

    #[test]
    fn released_ranges_are_not_reused() {
        let (table, frames) = boot();
        let mut pool = pool(&table, frames);
        let a = pool.allocate(PAGE_SIZE).unwrap();
        let b = pool.allocate(PAGE_SIZE).unwrap();
        pool.release(a).unwrap();

        let c = pool.allocate(PAGE_SIZE).unwrap();
        assert_ne!(c, a);
        assert_eq!(c, b + PAGE_SIZE);
    }

    #[test]
    fn legitimacy_is_bounded_by_pool_range() {
        let (table, frames) = boot();
        let pool = pool(&table, frames);

        assert!(pool.is_legitimate(VirtualAddress::new(POOL_BASE)));
        assert!(pool.is_legitimate(VirtualAddress::new(POOL_BASE + POOL_SIZE - 1)));
        assert!(!pool.is_legitimate(VirtualAddress::new(POOL_BASE + POOL_SIZE)));
        assert!(!pool.is_legitimate(VirtualAddress::new(POOL_BASE - 1)));
        assert!(!pool.is_legitimate(VirtualAddress::new(0x1000)));
    }

    #[test]
    fn rejects_zero_size() {
        let (table, frames) = boot();
        let mut pool = pool(&table, frames);
        assert_eq!(pool.allocate(0), Err(VmError::ZeroSize));
        assert_eq!(pool.metadata_region(), None);
    }

    #[test]
    fn rejects_requests_past_the_end() {
        let (table, frames) = boot();
        let mut pool = pool(&table, frames);

        assert_eq!(pool.allocate(POOL_SIZE), Err(VmError::OutOfSpace));
        assert_eq!(pool.allocate(usize::MAX), Err(VmError::OutOfSpace));
        assert_eq!(pool.metadata_region(), None);

        pool.allocate(POOL_SIZE - PAGE_SIZE).unwrap();
        assert_eq!(pool.allocate(1), Err(VmError::OutOfSpace));
    }

    #[test]
    fn rejects_more_than_max_regions() {
        let (table, frames) = boot();
        let mut pool = pool(&table, frames);
        for _ in 0..MAX_REGIONS {
            pool.allocate(1).unwrap();
        }
        assert_eq!(pool.region_count(), MAX_REGIONS);
        assert_eq!(pool.allocate(1), Err(VmError::RegionsFull));
    }

    #[test]
    fn release_rejects_unknown_addresses() {
        let (table, frames) = boot();
        let mut pool = pool(&table, frames);
        let start = pool.allocate(2 * PAGE_SIZE).unwrap();

        assert_eq!(pool.release(start + PAGE_SIZE), Err(VmError::UnknownRegion));
        assert_eq!(
            pool.release(VirtualAddress::new(POOL_BASE)),
            Err(VmError::UnknownRegion)
        );
        assert_eq!(pool.region_count(), 1);

        pool.release(start).unwrap();
        assert_eq!(pool.release(start), Err(VmError::UnknownRegion));
    }

    #[test]
    fn release_keeps_remaining_regions_in_order() {
        let (table, frames) = boot();
        let mut pool = pool(&table, frames);
        let a = pool.allocate(PAGE_SIZE).unwrap();
        let b = pool.allocate(PAGE_SIZE).unwrap();
        let c = pool.allocate(PAGE_SIZE).unwrap();

        pool.release(b).unwrap();
        let bases: Vec<_> = pool.regions().map(Region::base).collect();
        assert_eq!(bases, [a, c]);
    }

    #[test]
    fn pages_are_backed_on_first_touch_and_freed_on_release() {
        let (table, frames) = boot();
        let mut pool = pool(&table, frames);
        let start = pool.allocate(3 * PAGE_SIZE).unwrap();
        assert_eq!(frames.free_frames(), Ok(1024));

        let outcome = touch(start + 0x10).unwrap();
        assert_eq!(outcome.frames_allocated(), 2);
        touch(start + 2 * PAGE_SIZE).unwrap();
        assert_eq!(frames.free_frames(), Ok(1022));
        assert!(table.translate(start).is_some());

        pool.release(start).unwrap();
        assert_eq!(frames.free_frames(), Ok(1024));
        assert_eq!(table.translate(start), None);
        assert_eq!(table.translate(start + 2 * PAGE_SIZE), None);
        assert_eq!(registers::read_page_table_base(), table.directory().start());
    }

    #[test]
    fn faults_outside_registered_pools_are_rejected() {
        let (table, frames) = boot();
        let mut pool = pool(&table, frames);
        let start = pool.allocate(PAGE_SIZE).unwrap();

        assert_eq!(
            touch(VirtualAddress::new(0x8000_0000)),
            Err(FaultError::IllegitimateAddress)
        );
        assert!(touch(start).is_ok());
        // The shared region stays reachable.
        assert_eq!(touch(VirtualAddress::new(0x1000)), Ok(FaultOutcome::AlreadyPresent));
    }

    #[test]
    fn pages_come_from_the_pool_frame_pool() {
        let (table, process) = boot();
        let kernel_info = FrameNumber::new(400);
        let own = FramePool::new(FrameNumber::new(256), 128, Some(kernel_info), 1)
            .unwrap()
            .register();

        let mut pool = pool(&table, own);
        let start = pool.allocate(PAGE_SIZE).unwrap();
        touch(start).unwrap();

        assert_eq!(own.free_frames(), Ok(127));
        assert_eq!(process.free_frames(), Ok(1024));
        let frame = table.table_entry(start).unwrap().frame().unwrap();
        assert_eq!(own.contains(frame), Ok(true));
    }

    #[test]
    fn rejects_invalid_layouts() {
        let (table, frames) = boot();
        let layouts = [
            (POOL_BASE + 1, POOL_SIZE),
            (POOL_BASE, 0),
            (POOL_BASE, PAGE_SIZE),
            (POOL_BASE, POOL_SIZE + 1),
            (0xFFFF_F000, 2 * PAGE_SIZE),
        ];
        for (base, size) in layouts {
            assert!(matches!(
                VmPool::new(VirtualAddress::new(base), size, frames, &table),
                Err(VmError::InvalidLayout)
            ));
        }

        // A pool may end exactly at the top of the address space.
        let top = VmPool::new(VirtualAddress::new(0xFFFF_E000), 2 * PAGE_SIZE, frames, &table);
        assert!(top.is_ok());
    }

    #[test]
    fn rejects_pools_overlapping_the_shared_region() {
        let (table, frames) = boot();
        let shared = 4 * 1024 * 1024;
        let layouts = [
            (0, POOL_SIZE),
            (514 * PAGE_SIZE, 8 * PAGE_SIZE),
            (shared - PAGE_SIZE, 2 * PAGE_SIZE),
        ];
        for (base, size) in layouts {
            assert!(matches!(
                VmPool::new(VirtualAddress::new(base), size, frames, &table),
                Err(VmError::InvalidLayout)
            ));
        }

        let directory = table.directory().start();
        assert_eq!(
            table.translate(VirtualAddress::new(directory.as_usize())),
            Some(directory)
        );

        let adjacent = VmPool::new(VirtualAddress::new(shared), 2 * PAGE_SIZE, frames, &table);
        assert!(adjacent.is_ok());
    }

    #[test]
    fn release_finishes_when_a_page_fails() {
        let (table, frames) = boot();
        let mut pool = pool(&table, frames);
        let start = pool.allocate(3 * PAGE_SIZE).unwrap();
        for i in 0..3 {
            touch(start + i * PAGE_SIZE).unwrap();
        }
        assert_eq!(frames.free_frames(), Ok(1021));

        // Hand the middle page's frame back behind the page table's back.
        let middle = table.table_entry(start + PAGE_SIZE).unwrap().frame().unwrap();
        FramePool::release_frames(middle).unwrap();

        assert_eq!(
            pool.release(start),
            Err(VmError::Paging(PagingError::Frame(
                FrameError::NotHeadOfSequence
            )))
        );
        assert_eq!(pool.region_count(), 0);
        for i in 0..3 {
            assert_eq!(table.translate(start + i * PAGE_SIZE), None);
        }
        assert_eq!(frames.free_frames(), Ok(1024));
        assert_eq!(pool.release(start), Err(VmError::UnknownRegion));
        assert_eq!(registers::read_page_table_base(), table.directory().start());
    }

    #[test]
    fn dropped_pool_range_is_illegitimate() {
        let (table, frames) = boot();
        let mut keeper = VmPool::new(VirtualAddress::new(0x8000_0000), POOL_SIZE, frames, &table)
            .unwrap();
        let kept = keeper.allocate(PAGE_SIZE).unwrap();

        let mut dropped = pool(&table, frames);
        let start = dropped.allocate(PAGE_SIZE).unwrap();
        drop(dropped);

        assert_eq!(touch(start), Err(FaultError::IllegitimateAddress));
        assert_eq!(frames.free_frames(), Ok(1024));
        assert!(touch(kept).is_ok());
    }

    #[test]
    fn region_geometry() {
        let region = Region::new(VirtualAddress::new(0x4000_1000), 2 * PAGE_SIZE);
        assert_eq!(region.end(), 0x4000_3000);
        assert!(region.contains(VirtualAddress::new(0x4000_2FFF)));
        assert!(!region.contains(VirtualAddress::new(0x4000_3000)));
        let pages: Vec<_> = region.pages().collect();
        assert_eq!(pages, [PageNumber::new(0x4_0001), PageNumber::new(0x4_0002)]);
        assert_eq!(MAX_REGIONS, PAGE_SIZE / core::mem::size_of::<Region>());
    }
}
