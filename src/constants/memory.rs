use x86_64::structures::paging::PageTableFlags;

pub const PAGE_SIZE: u64 = 4096;
pub const FRAME_SIZE: usize = 4096;

/// Frames tracked by one bitmap byte.
pub const BITMAP_ENTRY_SIZE: usize = 8;
pub const FULL_BITMAP_ENTRY: u8 = 0xFF;

/// No-execute bit, or nothing at all when built without the `nx` feature.
#[cfg(feature = "nx")]
pub const NO_EXECUTE: PageTableFlags = PageTableFlags::NO_EXECUTE;
#[cfg(not(feature = "nx"))]
pub const NO_EXECUTE: PageTableFlags = PageTableFlags::empty();

/// Flags for non-leaf entries created while building a walk.
pub const TABLE_FLAGS: PageTableFlags = PageTableFlags::PRESENT.union(PageTableFlags::WRITABLE);

/// Higher-half direct map of physical memory.
pub const HHDM_FLAGS: PageTableFlags = TABLE_FLAGS.union(NO_EXECUTE);

/// Kernel `.text`: read-only, executable.
pub const KERNEL_TEXT_FLAGS: PageTableFlags = PageTableFlags::PRESENT;

// Rodata is left writable, same as data.
pub const KERNEL_RODATA_FLAGS: PageTableFlags = HHDM_FLAGS;
pub const KERNEL_DATA_FLAGS: PageTableFlags = HHDM_FLAGS;
