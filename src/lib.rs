//! Boot-time memory core of an x86-64 Limine kernel.
//!
//! The kernel entry point calls [`logging::init`] and then [`memory::init`];
//! afterwards the frame allocator and the kernel address space are available
//! through [`memory::frame_allocator`] and [`memory::paging`].

#![cfg_attr(not(test), no_std)]

pub mod constants;
mod devices;
pub mod logging;
pub mod memory;

pub mod prelude {
    pub use crate::memory::frame_allocator::{alloc_page, free_page, free_page_count};
    pub use crate::memory::paging::{map_kernel_page, unmap_kernel_page, AddressSpace};
    pub use crate::memory::MemoryError;
    pub use x86_64::structures::paging::PageTableFlags;
}
