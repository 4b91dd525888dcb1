use x86_64::{PhysAddr, VirtAddr};

/// Failures of the physical frame allocator and the page table builder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum MemoryError {
    /// A Limine response the memory core depends on is absent.
    #[error("boot protocol did not provide {0}")]
    BootProtocol(&'static str),
    #[error("out of physical memory")]
    OutOfMemory,
    /// Freeing a frame that is not currently allocated.
    #[error("invalid free of physical frame {0:?}")]
    InvalidFree(PhysAddr),
    #[error("broken kernel linker layout: {0}")]
    LinkerLayout(&'static str),
    /// A 2 MiB / 1 GiB leaf sits where a lower table was expected.
    #[error("walk for {0:?} runs into a huge page")]
    HugePageInPath(VirtAddr),
}
