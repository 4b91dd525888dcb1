//! Physical memory regions as reported by the bootloader.

use limine::memory_map::{Entry, EntryType};

/// What a region of physical memory is used for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegionKind {
    Usable,
    Reserved,
    AcpiReclaimable,
    AcpiNvs,
    BadMemory,
    BootloaderReclaimable,
    ExecutableAndModules,
    Framebuffer,
}

impl RegionKind {
    /// Whether the region gets an alias in the higher-half direct map.
    ///
    /// Bootloader-reclaimable memory holds the boot stack and the Limine
    /// responses, so it has to stay reachable after the switch.
    pub fn is_direct_mapped(self) -> bool {
        matches!(
            self,
            RegionKind::Usable
                | RegionKind::BootloaderReclaimable
                | RegionKind::ExecutableAndModules
                | RegionKind::Framebuffer
        )
    }
}

impl From<EntryType> for RegionKind {
    fn from(entry_type: EntryType) -> Self {
        if entry_type == EntryType::USABLE {
            RegionKind::Usable
        } else if entry_type == EntryType::ACPI_RECLAIMABLE {
            RegionKind::AcpiReclaimable
        } else if entry_type == EntryType::ACPI_NVS {
            RegionKind::AcpiNvs
        } else if entry_type == EntryType::BAD_MEMORY {
            RegionKind::BadMemory
        } else if entry_type == EntryType::BOOTLOADER_RECLAIMABLE {
            RegionKind::BootloaderReclaimable
        } else if entry_type == EntryType::KERNEL_AND_MODULES {
            RegionKind::ExecutableAndModules
        } else if entry_type == EntryType::FRAMEBUFFER {
            RegionKind::Framebuffer
        } else {
            RegionKind::Reserved
        }
    }
}

/// One entry of the physical memory map, `[base, base + length)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryRegion {
    pub base: u64,
    pub length: u64,
    pub kind: RegionKind,
}

impl MemoryRegion {
    pub const fn new(base: u64, length: u64, kind: RegionKind) -> Self {
        Self { base, length, kind }
    }

    /// Exclusive end address.
    pub fn end(&self) -> u64 {
        self.base + self.length
    }
}

impl From<&Entry> for MemoryRegion {
    fn from(entry: &Entry) -> Self {
        Self::new(entry.base, entry.length, entry.entry_type.into())
    }
}

/// Highest physical address covered by any region, whatever its kind.
pub fn highest_address(regions: impl Iterator<Item = MemoryRegion>) -> u64 {
    regions.map(|region| region.end()).max().unwrap_or(0)
}

/// First region of the given kind, e.g. to locate the framebuffer.
pub fn find_region(
    mut regions: impl Iterator<Item = MemoryRegion>,
    kind: RegionKind,
) -> Option<MemoryRegion> {
    regions.find(|region| region.kind == kind)
}
