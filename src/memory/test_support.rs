//! Simulated physical memory for host tests.

use std::alloc::{alloc_zeroed, dealloc, Layout};
use std::sync::{Mutex, MutexGuard};

use x86_64::VirtAddr;

use crate::constants::memory::FRAME_SIZE;

/// A zeroed, frame-aligned host buffer standing in for physical RAM.
///
/// Physical address `p` lives at host address `base + p`, so the buffer's
/// base doubles as the HHDM offset.
pub struct PhysicalMemory {
    base: *mut u8,
    layout: Layout,
}

impl PhysicalMemory {
    /// Backs physical addresses `[0, size)`.
    pub fn new(size: usize) -> Self {
        let layout = Layout::from_size_align(size, FRAME_SIZE).expect("bad test memory layout");
        let base = unsafe { alloc_zeroed(layout) };
        assert!(!base.is_null(), "test memory allocation failed");
        Self { base, layout }
    }

    pub fn hhdm_offset(&self) -> VirtAddr {
        VirtAddr::new(self.base as u64)
    }

    pub fn read_u8(&self, phys: u64) -> u8 {
        assert!((phys as usize) < self.layout.size());
        unsafe { *self.base.add(phys as usize) }
    }

    pub fn read_u64(&self, phys: u64) -> u64 {
        assert!(phys % 8 == 0 && (phys as usize + 8) <= self.layout.size());
        unsafe { *self.base.add(phys as usize).cast::<u64>() }
    }

    pub fn write_u64(&self, phys: u64, value: u64) {
        assert!(phys % 8 == 0 && (phys as usize + 8) <= self.layout.size());
        unsafe { *self.base.add(phys as usize).cast::<u64>() = value }
    }
}

impl Drop for PhysicalMemory {
    fn drop(&mut self) {
        unsafe { dealloc(self.base, self.layout) }
    }
}

static GLOBALS: Mutex<()> = Mutex::new(());

/// Serializes tests that install the kernel-wide allocator or address space.
pub fn lock_globals() -> MutexGuard<'static, ()> {
    GLOBALS.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
