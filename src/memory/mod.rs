//! Boot-time memory management: the physical frame allocator and the
//! kernel's page tables.
//!
//! [`init`] runs once on the bootstrap core, before interrupts are enabled:
//! it builds the frame bitmap from the Limine memory map, constructs the
//! kernel address space on top of it and switches CR3 to it.

pub mod bitmap_frame_allocator;
pub mod error;
pub mod frame_allocator;
pub mod kernel_map;
pub mod paging;
pub mod region;
pub mod tlb;

#[cfg(test)]
pub(crate) mod test_support;

use lazy_static::lazy_static;
use limine::request::{HhdmRequest, KernelAddressRequest, MemoryMapRequest};
use spin::Mutex;
use x86_64::{PhysAddr, VirtAddr};

pub use error::MemoryError;
use paging::AddressSpace;

#[used]
#[link_section = ".requests"]
pub static HHDM_REQUEST: HhdmRequest = HhdmRequest::new();

#[used]
#[link_section = ".requests"]
pub static MEMORY_MAP_REQUEST: MemoryMapRequest = MemoryMapRequest::new();

#[used]
#[link_section = ".requests"]
static KERNEL_ADDRESS_REQUEST: KernelAddressRequest = KernelAddressRequest::new();

/// The address space built by [`init`], current from then on.
pub static KERNEL_ADDRESS_SPACE: Mutex<Option<AddressSpace>> = Mutex::new(None);

lazy_static! {
    pub static ref HHDM_OFFSET: VirtAddr = VirtAddr::new(
        HHDM_REQUEST
            .get_response()
            .expect("HHDM request failed")
            .offset()
    );
}

/// Virtual alias of a physical address in the higher-half direct map.
pub fn phys_to_virt(phys: PhysAddr) -> VirtAddr {
    *HHDM_OFFSET + phys.as_u64()
}

/// Sets up physical and virtual memory. Halts the boot on failure, there is
/// nothing to fall back to this early.
#[cfg(not(test))]
pub fn init() {
    try_init().expect("Memory initialization failed");
}

#[cfg(not(test))]
fn try_init() -> Result<(), MemoryError> {
    use crate::memory::{
        bitmap_frame_allocator::BitmapFrameAllocator,
        frame_allocator::{with_frame_allocator, FRAME_ALLOCATOR},
        kernel_map::{build_kernel_address_space, KernelLayout, KernelLoad},
        region::MemoryRegion,
    };

    let memory_map = MEMORY_MAP_REQUEST
        .get_response()
        .ok_or(MemoryError::BootProtocol("a memory map"))?;
    let hhdm_offset = VirtAddr::new(
        HHDM_REQUEST
            .get_response()
            .ok_or(MemoryError::BootProtocol("an HHDM offset"))?
            .offset(),
    );
    let regions = memory_map
        .entries()
        .iter()
        .map(|entry| MemoryRegion::from(*entry));

    let allocator = unsafe { BitmapFrameAllocator::init(regions.clone(), hhdm_offset)? };
    *FRAME_ALLOCATOR.lock() = Some(allocator);

    let layout = KernelLayout::from_linker()?;
    let kernel_address = KERNEL_ADDRESS_REQUEST
        .get_response()
        .ok_or(MemoryError::BootProtocol("the kernel load address"))?;
    let load = KernelLoad {
        physical_base: kernel_address.physical_base(),
        virtual_base: kernel_address.virtual_base(),
    };
    log::debug!("kernel loaded at {:#x} -> {:#x}", load.virtual_base, load.physical_base);

    let space = with_frame_allocator(|allocator| {
        build_kernel_address_space(regions, hhdm_offset, &layout, load, allocator)
    })?;

    #[cfg(feature = "nx")]
    unsafe {
        use x86_64::registers::model_specific::{Efer, EferFlags};

        // NX bits fault as reserved unless this is on
        Efer::update(|flags| {
            flags.insert(EferFlags::NO_EXECUTE_ENABLE);
        });
    }

    unsafe { space.activate() };
    *KERNEL_ADDRESS_SPACE.lock() = Some(space);

    log::info!(
        "memory initialized, {} frames free",
        frame_allocator::free_page_count()
    );
    Ok(())
}
