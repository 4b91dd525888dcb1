//! Four-level page table construction.
//!
//! Tables are reached through the higher-half direct map, so an address space
//! can be edited without being active.

use x86_64::{
    structures::paging::{
        page_table::PageTableEntry, FrameAllocator, FrameDeallocator, PageSize, PageTable,
        PageTableFlags, PhysFrame, Size4KiB,
    },
    PhysAddr, VirtAddr,
};

use crate::constants::memory::TABLE_FLAGS;
use crate::memory::{
    error::MemoryError, frame_allocator::with_frame_allocator, tlb, KERNEL_ADDRESS_SPACE,
};

/// A PML4-rooted address space.
///
/// The root frame, and every table reachable from it, was allocated for this
/// address space; [`release_tables`](Self::release_tables) hands them back.
#[derive(Debug)]
pub struct AddressSpace {
    root: PhysFrame,
    hhdm_offset: VirtAddr,
}

impl AddressSpace {
    /// Allocates and zeroes a fresh root table.
    pub fn new(
        frame_allocator: &mut impl FrameAllocator<Size4KiB>,
        hhdm_offset: VirtAddr,
    ) -> Result<Self, MemoryError> {
        let root = frame_allocator
            .allocate_frame()
            .ok_or(MemoryError::OutOfMemory)?;
        let mut space = Self { root, hhdm_offset };
        space.root_table_mut().zero();
        Ok(space)
    }

    /// Wraps an existing root table.
    ///
    /// # Safety
    ///
    /// `root` must hold a valid PML4 reachable through `hhdm_offset`, and no
    /// other `AddressSpace` may edit it.
    pub unsafe fn from_root(root: PhysFrame, hhdm_offset: VirtAddr) -> Self {
        Self { root, hhdm_offset }
    }

    pub fn root(&self) -> PhysFrame {
        self.root
    }

    /// Maps the 4 KiB page containing `virt` to `phys`.
    ///
    /// Missing intermediate tables are allocated and zeroed on the way down.
    /// An existing leaf is overwritten as is.
    pub fn map_page(
        &mut self,
        virt: VirtAddr,
        phys: PhysAddr,
        flags: PageTableFlags,
        frame_allocator: &mut impl FrameAllocator<Size4KiB>,
    ) -> Result<(), MemoryError> {
        let table_flags = TABLE_FLAGS | (flags & PageTableFlags::USER_ACCESSIBLE);
        let hhdm_offset = self.hhdm_offset;

        let pml4 = self.root_table_mut();
        let pdpt = next_table_or_create(hhdm_offset, &mut pml4[virt.p4_index()], virt, table_flags, frame_allocator)?;
        let pd = next_table_or_create(hhdm_offset, &mut pdpt[virt.p3_index()], virt, table_flags, frame_allocator)?;
        let pt = next_table_or_create(hhdm_offset, &mut pd[virt.p2_index()], virt, table_flags, frame_allocator)?;

        pt[virt.p1_index()].set_addr(phys.align_down(Size4KiB::SIZE), flags);
        tlb::flush(virt);

        Ok(())
    }

    /// Clears the present bit of the leaf for `virt`.
    ///
    /// Nothing happens if the walk hits a missing table.
    pub fn unmap_page(&mut self, virt: VirtAddr) {
        let Some(entry) = self.leaf_mut(virt) else {
            return;
        };

        let flags = entry.flags();
        if flags.contains(PageTableFlags::PRESENT) {
            entry.set_flags(flags - PageTableFlags::PRESENT);
            tlb::flush(virt);
        }
    }

    /// Leaf entry for `virt`, present or not, if its page table exists.
    pub fn leaf_entry(&self, virt: VirtAddr) -> Option<PageTableEntry> {
        let pml4 = self.root_table();
        let pdpt = next_table(self.hhdm_offset, &pml4[virt.p4_index()])?;
        let pd = next_table(self.hhdm_offset, &pdpt[virt.p3_index()])?;
        let pt = next_table(self.hhdm_offset, &pd[virt.p2_index()])?;
        Some(pt[virt.p1_index()].clone())
    }

    /// Physical address `virt` resolves to, page offset included.
    pub fn translate(&self, virt: VirtAddr) -> Option<PhysAddr> {
        let entry = self.leaf_entry(virt)?;
        if !entry.flags().contains(PageTableFlags::PRESENT) {
            return None;
        }
        Some(entry.addr() + (virt.as_u64() & (Size4KiB::SIZE - 1)))
    }

    /// Makes this the current address space.
    ///
    /// # Safety
    ///
    /// See [`switch_address_space`].
    pub unsafe fn activate(&self) {
        unsafe { switch_address_space(self.root) }
    }

    /// Frees every table of this address space, root included.
    ///
    /// Leaf frames are not touched, they belong to whoever mapped them.
    pub fn release_tables(self, frame_deallocator: &mut impl FrameDeallocator<Size4KiB>) {
        self.release_level(self.root, 4, frame_deallocator);
    }

    fn release_level(
        &self,
        frame: PhysFrame,
        level: u8,
        frame_deallocator: &mut impl FrameDeallocator<Size4KiB>,
    ) {
        if level > 1 {
            let table = unsafe { table_at(self.hhdm_offset, frame.start_address()) };
            for entry in table.iter() {
                let flags = entry.flags();
                if flags.contains(PageTableFlags::PRESENT) && !flags.contains(PageTableFlags::HUGE_PAGE) {
                    let child = PhysFrame::containing_address(entry.addr());
                    self.release_level(child, level - 1, frame_deallocator);
                }
            }
        }
        unsafe { frame_deallocator.deallocate_frame(frame) };
    }

    fn leaf_mut(&mut self, virt: VirtAddr) -> Option<&mut PageTableEntry> {
        let hhdm_offset = self.hhdm_offset;
        let pml4 = self.root_table_mut();
        let pdpt = next_table_mut(hhdm_offset, &mut pml4[virt.p4_index()])?;
        let pd = next_table_mut(hhdm_offset, &mut pdpt[virt.p3_index()])?;
        let pt = next_table_mut(hhdm_offset, &mut pd[virt.p2_index()])?;
        Some(&mut pt[virt.p1_index()])
    }

    fn root_table(&self) -> &PageTable {
        unsafe { table_at(self.hhdm_offset, self.root.start_address()) }
    }

    fn root_table_mut(&mut self) -> &mut PageTable {
        unsafe { table_at_mut(self.hhdm_offset, self.root.start_address()) }
    }
}

/// Table an entry points to, if present and not a huge leaf.
fn next_table(hhdm_offset: VirtAddr, entry: &PageTableEntry) -> Option<&PageTable> {
    let flags = entry.flags();
    if !flags.contains(PageTableFlags::PRESENT) || flags.contains(PageTableFlags::HUGE_PAGE) {
        return None;
    }
    Some(unsafe { table_at(hhdm_offset, entry.addr()) })
}

fn next_table_mut(hhdm_offset: VirtAddr, entry: &mut PageTableEntry) -> Option<&mut PageTable> {
    let flags = entry.flags();
    if !flags.contains(PageTableFlags::PRESENT) || flags.contains(PageTableFlags::HUGE_PAGE) {
        return None;
    }
    Some(unsafe { table_at_mut(hhdm_offset, entry.addr()) })
}

fn next_table_or_create<'a>(
    hhdm_offset: VirtAddr,
    entry: &'a mut PageTableEntry,
    virt: VirtAddr,
    table_flags: PageTableFlags,
    frame_allocator: &mut impl FrameAllocator<Size4KiB>,
) -> Result<&'a mut PageTable, MemoryError> {
    let flags = entry.flags();
    if flags.contains(PageTableFlags::PRESENT) {
        if flags.contains(PageTableFlags::HUGE_PAGE) {
            return Err(MemoryError::HugePageInPath(virt));
        }
        if !flags.contains(table_flags) {
            entry.set_flags(flags | table_flags);
        }
        return Ok(unsafe { table_at_mut(hhdm_offset, entry.addr()) });
    }

    let frame = frame_allocator
        .allocate_frame()
        .ok_or(MemoryError::OutOfMemory)?;
    entry.set_addr(frame.start_address(), table_flags);
    let table = unsafe { table_at_mut(hhdm_offset, frame.start_address()) };
    table.zero();

    Ok(table)
}

/// # Safety
///
/// `phys` must be the start of a page table frame that nothing is writing to
/// for `'a`.
unsafe fn table_at<'a>(hhdm_offset: VirtAddr, phys: PhysAddr) -> &'a PageTable {
    let virt = hhdm_offset + phys.as_u64();
    unsafe { &*virt.as_ptr::<PageTable>() }
}

/// # Safety
///
/// `phys` must be the start of a page table frame that nothing else
/// references for `'a`. Callers tie `'a` to a borrow of the parent entry.
unsafe fn table_at_mut<'a>(hhdm_offset: VirtAddr, phys: PhysAddr) -> &'a mut PageTable {
    let virt = hhdm_offset + phys.as_u64();
    unsafe { &mut *virt.as_mut_ptr::<PageTable>() }
}

/// Loads `root` into CR3.
///
/// # Safety
///
/// Everything the caller touches afterwards, its own code and stack included,
/// must be mapped the same way under `root`.
pub unsafe fn switch_address_space(root: PhysFrame) {
    log::debug!("switching address space to {:?}", root.start_address());
    unsafe { tlb::load_root(root) }
}

/// Maps a page in the kernel address space with frames from the global allocator.
pub fn map_kernel_page(
    virt: VirtAddr,
    phys: PhysAddr,
    flags: PageTableFlags,
) -> Result<(), MemoryError> {
    let mut space = KERNEL_ADDRESS_SPACE.lock();
    let space = space.as_mut().expect("Kernel address space not initialized");
    with_frame_allocator(|allocator| space.map_page(virt, phys, flags, allocator))
}

pub fn unmap_kernel_page(virt: VirtAddr) {
    if let Some(space) = KERNEL_ADDRESS_SPACE.lock().as_mut() {
        space.unmap_page(virt);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{
        bitmap_frame_allocator::BitmapFrameAllocator,
        region::{MemoryRegion, RegionKind},
        test_support::PhysicalMemory,
    };

    fn setup(memory: &PhysicalMemory) -> (BitmapFrameAllocator, AddressSpace) {
        let regions = [MemoryRegion::new(0x10_0000, 0x30_0000, RegionKind::Usable)];
        let mut allocator =
            unsafe { BitmapFrameAllocator::init(regions.iter().copied(), memory.hhdm_offset()) }
                .expect("allocator init failed");
        let space = AddressSpace::new(&mut allocator, memory.hhdm_offset()).expect("no root");
        (allocator, space)
    }

    fn entry_flags(memory: &PhysicalMemory, entry: u64) -> PageTableFlags {
        PageTableFlags::from_bits_truncate(memory.read_u64(entry))
    }

    /// Physical address an entry points to.
    fn entry_target(memory: &PhysicalMemory, entry: u64) -> u64 {
        memory.read_u64(entry) & 0x000f_ffff_ffff_f000
    }

    const VIRT: u64 = 0xffff_8000_1234_5000;
    const PHYS: u64 = 0x20_0000;

    #[test]
    fn map_then_walk_finds_leaf() {
        let memory = PhysicalMemory::new(0x40_0000);
        let (mut allocator, mut space) = setup(&memory);
        let flags = PageTableFlags::PRESENT | PageTableFlags::WRITABLE;

        space
            .map_page(VirtAddr::new(VIRT), PhysAddr::new(PHYS), flags, &mut allocator)
            .unwrap();

        let leaf = space.leaf_entry(VirtAddr::new(VIRT)).unwrap();
        assert_eq!(leaf.addr().as_u64() | leaf.flags().bits(), PHYS | flags.bits());
        assert_eq!(
            space.translate(VirtAddr::new(VIRT + 0x123)),
            Some(PhysAddr::new(PHYS + 0x123))
        );
    }

    #[test]
    fn unmap_clears_present_bit() {
        let memory = PhysicalMemory::new(0x40_0000);
        let (mut allocator, mut space) = setup(&memory);
        let virt = VirtAddr::new(VIRT);

        space
            .map_page(virt, PhysAddr::new(PHYS), PageTableFlags::PRESENT | PageTableFlags::WRITABLE, &mut allocator)
            .unwrap();
        space.unmap_page(virt);

        let leaf = space.leaf_entry(virt).unwrap();
        assert!(!leaf.flags().contains(PageTableFlags::PRESENT));
        assert_eq!(space.translate(virt), None);
    }

    #[test]
    fn unmap_of_unmapped_address_is_a_no_op() {
        let memory = PhysicalMemory::new(0x40_0000);
        let (allocator, mut space) = setup(&memory);
        let free = allocator.free_page_count();
        tlb::take_flushed();

        space.unmap_page(VirtAddr::new(VIRT));

        assert!(space.leaf_entry(VirtAddr::new(VIRT)).is_none());
        assert!(tlb::take_flushed().is_empty());
        assert_eq!(allocator.free_page_count(), free);
    }

    #[test]
    fn sibling_pages_share_intermediate_tables() {
        let memory = PhysicalMemory::new(0x40_0000);
        let (mut allocator, mut space) = setup(&memory);
        let flags = PageTableFlags::PRESENT | PageTableFlags::WRITABLE;

        let before = allocator.free_page_count();
        space
            .map_page(VirtAddr::new(VIRT), PhysAddr::new(PHYS), flags, &mut allocator)
            .unwrap();
        // PDPT, PD and PT
        assert_eq!(allocator.free_page_count(), before - 3);

        space
            .map_page(VirtAddr::new(VIRT + 0x1000), PhysAddr::new(PHYS + 0x1000), flags, &mut allocator)
            .unwrap();
        assert_eq!(allocator.free_page_count(), before - 3);

        assert_eq!(
            space.translate(VirtAddr::new(VIRT + 0x1000)),
            Some(PhysAddr::new(PHYS + 0x1000))
        );
    }

    #[test]
    fn map_invalidates_the_translation() {
        let memory = PhysicalMemory::new(0x40_0000);
        let (mut allocator, mut space) = setup(&memory);
        let virt = VirtAddr::new(VIRT);
        tlb::take_flushed();

        space
            .map_page(virt, PhysAddr::new(PHYS), PageTableFlags::PRESENT, &mut allocator)
            .unwrap();
        space.unmap_page(virt);

        assert_eq!(tlb::take_flushed(), [virt, virt]);
    }

    #[test]
    fn remapping_overwrites_the_leaf() {
        let memory = PhysicalMemory::new(0x40_0000);
        let (mut allocator, mut space) = setup(&memory);
        let virt = VirtAddr::new(VIRT);

        space
            .map_page(virt, PhysAddr::new(PHYS), PageTableFlags::PRESENT | PageTableFlags::WRITABLE, &mut allocator)
            .unwrap();
        space
            .map_page(virt, PhysAddr::new(PHYS + 0x5000), PageTableFlags::PRESENT, &mut allocator)
            .unwrap();

        let leaf = space.leaf_entry(virt).unwrap();
        assert_eq!(leaf.addr(), PhysAddr::new(PHYS + 0x5000));
        assert_eq!(leaf.flags(), PageTableFlags::PRESENT);
    }

    #[test]
    fn user_pages_get_user_intermediate_tables() {
        let memory = PhysicalMemory::new(0x40_0000);
        let (mut allocator, mut space) = setup(&memory);
        let kernel_virt = VirtAddr::new(0x40_0000);
        let user_virt = VirtAddr::new(0x40_1000);

        space
            .map_page(kernel_virt, PhysAddr::new(PHYS), PageTableFlags::PRESENT, &mut allocator)
            .unwrap();
        let root = space.root().start_address().as_u64();
        assert!(!entry_flags(&memory, root).contains(PageTableFlags::USER_ACCESSIBLE));

        space
            .map_page(
                user_virt,
                PhysAddr::new(PHYS + 0x1000),
                PageTableFlags::PRESENT | PageTableFlags::USER_ACCESSIBLE,
                &mut allocator,
            )
            .unwrap();
        let pml4_entry = entry_flags(&memory, root);
        assert!(pml4_entry.contains(PageTableFlags::USER_ACCESSIBLE));
        assert!(pml4_entry.contains(PageTableFlags::WRITABLE));
    }

    #[test]
    fn huge_page_in_path_is_reported() {
        let memory = PhysicalMemory::new(0x40_0000);
        let (mut allocator, mut space) = setup(&memory);
        let virt = VirtAddr::new(VIRT);

        space
            .map_page(virt, PhysAddr::new(PHYS), PageTableFlags::PRESENT, &mut allocator)
            .unwrap();

        // turn the PD entry into a 2 MiB leaf
        let root = space.root().start_address().as_u64();
        let pdpt = entry_target(&memory, root + u64::from(virt.p4_index()) * 8);
        let pd = entry_target(&memory, pdpt + u64::from(virt.p3_index()) * 8);
        let huge = (PageTableFlags::PRESENT | PageTableFlags::HUGE_PAGE).bits();
        memory.write_u64(pd + u64::from(virt.p2_index()) * 8, 0x20_0000 | huge);

        let result = space.map_page(virt, PhysAddr::new(PHYS), PageTableFlags::PRESENT, &mut allocator);
        assert_eq!(result, Err(MemoryError::HugePageInPath(virt)));
        assert!(space.leaf_entry(virt).is_none());
    }

    #[test]
    fn mapping_without_frames_fails() {
        let memory = PhysicalMemory::new(0x40_0000);
        let (mut allocator, mut space) = setup(&memory);
        while allocator.alloc_page().is_some() {}

        let result = space.map_page(
            VirtAddr::new(VIRT),
            PhysAddr::new(PHYS),
            PageTableFlags::PRESENT,
            &mut allocator,
        );
        assert_eq!(result, Err(MemoryError::OutOfMemory));
    }

    #[test]
    fn releasing_tables_returns_every_frame() {
        let memory = PhysicalMemory::new(0x40_0000);
        let regions = [MemoryRegion::new(0x10_0000, 0x30_0000, RegionKind::Usable)];
        let mut allocator =
            unsafe { BitmapFrameAllocator::init(regions.iter().copied(), memory.hhdm_offset()) }
                .unwrap();
        let initial = allocator.free_page_count();

        let mut space = AddressSpace::new(&mut allocator, memory.hhdm_offset()).unwrap();
        for page in 0..4u64 {
            let virt = VirtAddr::new(VIRT + page * 0x4000_0000);
            space
                .map_page(virt, PhysAddr::new(PHYS), PageTableFlags::PRESENT, &mut allocator)
                .unwrap();
        }
        assert!(allocator.free_page_count() < initial);

        space.release_tables(&mut allocator);
        assert_eq!(allocator.free_page_count(), initial);
    }

    #[test]
    fn activate_loads_the_root() {
        let memory = PhysicalMemory::new(0x40_0000);
        let (_allocator, space) = setup(&memory);

        unsafe { space.activate() };
        assert_eq!(tlb::loaded_roots().last(), Some(&space.root()));
    }

    #[test]
    fn kernel_space_wrappers_use_the_globals() {
        use crate::memory::frame_allocator::FRAME_ALLOCATOR;

        let _globals = crate::memory::test_support::lock_globals();
        let memory = PhysicalMemory::new(0x40_0000);
        let (allocator, space) = setup(&memory);
        let root = space.root();
        *FRAME_ALLOCATOR.lock() = Some(allocator);
        *KERNEL_ADDRESS_SPACE.lock() = Some(space);

        let virt = VirtAddr::new(VIRT);
        let flags = PageTableFlags::PRESENT | PageTableFlags::WRITABLE;
        let free = crate::memory::frame_allocator::free_page_count();
        map_kernel_page(virt, PhysAddr::new(PHYS), flags).unwrap();
        assert_eq!(crate::memory::frame_allocator::free_page_count(), free - 3);

        let space = unsafe { AddressSpace::from_root(root, memory.hhdm_offset()) };
        assert_eq!(space.translate(virt), Some(PhysAddr::new(PHYS)));

        unmap_kernel_page(virt);
        assert_eq!(space.translate(virt), None);

        // drop before the backing memory goes away
        KERNEL_ADDRESS_SPACE.lock().take();
        FRAME_ALLOCATOR.lock().take();
    }
}
