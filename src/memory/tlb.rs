//! Translation cache maintenance and root table switching.
//!
//! Host test builds record these operations per thread instead of executing
//! the privileged instructions.

use x86_64::{structures::paging::PhysFrame, VirtAddr};

/// Drop any cached translation for `vaddr` on the current core.
#[cfg(not(test))]
pub fn flush(vaddr: VirtAddr) {
    use core::arch::asm;

    unsafe {
        asm!("invlpg [{}]", in(reg) vaddr.as_u64(), options(nostack, preserves_flags));
    }
}

/// Load `root` into CR3.
///
/// # Safety
///
/// The code, stack and data in use must be mapped identically under `root`.
#[cfg(not(test))]
pub unsafe fn load_root(root: PhysFrame) {
    use x86_64::registers::control::{Cr3, Cr3Flags};

    unsafe { Cr3::write(root, Cr3Flags::empty()) };
}

#[cfg(test)]
pub use recording::{flush, load_root, loaded_roots, take_flushed};
