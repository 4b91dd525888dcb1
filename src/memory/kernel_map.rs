//! The kernel's own address space.
//!
//! Built once at boot: a higher-half direct map of every region the kernel
//! may touch, plus the kernel image at its linked addresses.

use core::ops::Range;

use x86_64::{
    structures::paging::{FrameAllocator, PageTableFlags, Size4KiB},
    PhysAddr, VirtAddr,
};

use crate::constants::memory::{
    FRAME_SIZE, HHDM_FLAGS, KERNEL_DATA_FLAGS, KERNEL_RODATA_FLAGS, KERNEL_TEXT_FLAGS, PAGE_SIZE,
};
use crate::memory::{error::MemoryError, paging::AddressSpace, region::MemoryRegion};

/// Virtual bounds of the kernel image sections, as placed by the linker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KernelLayout {
    pub text: Range<u64>,
    pub rodata: Range<u64>,
    /// `.data` and `.bss`.
    pub data: Range<u64>,
}

impl KernelLayout {
    pub fn new(text: Range<u64>, rodata: Range<u64>, data: Range<u64>) -> Result<Self, MemoryError> {
        if text.end <= text.start {
            return Err(MemoryError::LinkerLayout(".text is empty"));
        }
        if rodata.end < rodata.start {
            return Err(MemoryError::LinkerLayout(".rodata ends before it starts"));
        }
        if data.end < data.start {
            return Err(MemoryError::LinkerLayout(".data ends before it starts"));
        }
        Ok(Self { text, rodata, data })
    }

    /// Reads the section symbols exported by the linker script.
    #[cfg(not(test))]
    pub fn from_linker() -> Result<Self, MemoryError> {
        use core::ptr::addr_of;

        extern "C" {
            static __text_start: u8;
            static __text_end: u8;
            static __rodata_start: u8;
            static __rodata_end: u8;
            static __data_start: u8;
            static __data_end: u8;
        }

        let (text, rodata, data) = unsafe {
            (
                addr_of!(__text_start) as u64..addr_of!(__text_end) as u64,
                addr_of!(__rodata_start) as u64..addr_of!(__rodata_end) as u64,
                addr_of!(__data_start) as u64..addr_of!(__data_end) as u64,
            )
        };
        Self::new(text, rodata, data)
    }
}

/// Where the bootloader put the kernel image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KernelLoad {
    pub physical_base: u64,
    pub virtual_base: u64,
}

impl KernelLoad {
    /// Physical address backing a kernel image address, if it lies in the image.
    pub fn phys_for(&self, virt: u64) -> Option<PhysAddr> {
        let offset = virt.checked_sub(self.virtual_base)?;
        Some(PhysAddr::new(self.physical_base + offset))
    }
}

/// Creates the kernel address space without activating it.
pub fn build_kernel_address_space<I>(
    regions: I,
    hhdm_offset: VirtAddr,
    layout: &KernelLayout,
    load: KernelLoad,
    frame_allocator: &mut impl FrameAllocator<Size4KiB>,
) -> Result<AddressSpace, MemoryError>
where
    I: Iterator<Item = MemoryRegion>,
{
    let mut space = AddressSpace::new(frame_allocator, hhdm_offset)?;
    log::debug!("kernel root table at {:?}", space.root().start_address());

    map_direct_regions(&mut space, regions, hhdm_offset, frame_allocator)?;
    map_kernel_sections(&mut space, layout, load, frame_allocator)?;

    Ok(space)
}

/// Maps every frame of the direct-mapped regions at `phys + hhdm_offset`.
pub fn map_direct_regions<I>(
    space: &mut AddressSpace,
    regions: I,
    hhdm_offset: VirtAddr,
    frame_allocator: &mut impl FrameAllocator<Size4KiB>,
) -> Result<(), MemoryError>
where
    I: Iterator<Item = MemoryRegion>,
{
    for region in regions.filter(|region| region.kind.is_direct_mapped()) {
        let start = PhysAddr::new(region.base).align_down(PAGE_SIZE);
        let end = PhysAddr::new(region.end()).align_up(PAGE_SIZE);
        log::debug!("direct map {:?}..{:?} ({:?})", start, end, region.kind);

        for phys in (start.as_u64()..end.as_u64()).step_by(FRAME_SIZE) {
            space.map_page(hhdm_offset + phys, PhysAddr::new(phys), HHDM_FLAGS, frame_allocator)?;
        }
    }
    Ok(())
}

/// Maps `.text`, `.rodata` and `.data` at their linked addresses.
pub fn map_kernel_sections(
    space: &mut AddressSpace,
    layout: &KernelLayout,
    load: KernelLoad,
    frame_allocator: &mut impl FrameAllocator<Size4KiB>,
) -> Result<(), MemoryError> {
    // .text is mapped from one page below its start
    let text_start = align_down(layout.text.start).saturating_sub(PAGE_SIZE);
    map_section(space, text_start..layout.text.end, load, KERNEL_TEXT_FLAGS, frame_allocator)?;
    map_section(space, layout.rodata.clone(), load, KERNEL_RODATA_FLAGS, frame_allocator)?;
    map_section(space, layout.data.clone(), load, KERNEL_DATA_FLAGS, frame_allocator)
}

fn map_section(
    space: &mut AddressSpace,
    range: Range<u64>,
    load: KernelLoad,
    flags: PageTableFlags,
    frame_allocator: &mut impl FrameAllocator<Size4KiB>,
) -> Result<(), MemoryError> {
    let start = align_down(range.start);
    let end = align_up(range.end);
    log::debug!("kernel section {:#x}..{:#x} {:?}", start, end, flags);

    for virt in (start..end).step_by(FRAME_SIZE) {
        let Some(phys) = load.phys_for(virt) else {
            log::warn!("{:#x} lies below the kernel image, not mapped", virt);
            continue;
        };
        space.map_page(VirtAddr::new(virt), phys, flags, frame_allocator)?;
    }
    Ok(())
}

fn align_down(addr: u64) -> u64 {
    addr & !(PAGE_SIZE - 1)
}

fn align_up(addr: u64) -> u64 {
    align_down(addr + PAGE_SIZE - 1)
}
