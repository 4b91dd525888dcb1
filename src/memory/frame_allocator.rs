use crate::memory::{bitmap_frame_allocator::BitmapFrameAllocator, error::MemoryError};
use spin::Mutex;

use x86_64::PhysAddr;

/// The kernel's one frame allocator, installed by [`crate::memory::init`].
///
/// Boot runs on a single core before interrupts are enabled; the lock is
/// there for whatever runs after.
pub static FRAME_ALLOCATOR: Mutex<Option<BitmapFrameAllocator>> = Mutex::new(None);

/// Allocate one physical frame, `None` when memory is exhausted.
pub fn alloc_page() -> Option<PhysAddr> {
    with_frame_allocator(|allocator| allocator.alloc_page())
}

/// Return a frame obtained from [`alloc_page`].
pub fn free_page(phys: PhysAddr) -> Result<(), MemoryError> {
    with_frame_allocator(|allocator| allocator.free_page(phys)).inspect_err(|err| {
        log::error!("{}", err);
    })
}

pub fn free_page_count() -> usize {
    with_frame_allocator(|allocator| allocator.free_page_count())
}

pub fn with_frame_allocator<F, R>(f: F) -> R
where
    F: FnOnce(&mut BitmapFrameAllocator) -> R,
{
    let mut guard = FRAME_ALLOCATOR.lock();
    if let Some(ref mut allocator) = *guard {
        f(allocator)
    } else {
        panic!("Frame allocator does not exist.");
    }
}
