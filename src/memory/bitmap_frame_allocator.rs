use core::ops::Range;

use crate::constants::memory::{BITMAP_ENTRY_SIZE, FRAME_SIZE, FULL_BITMAP_ENTRY, PAGE_SIZE};
use crate::memory::{
    error::MemoryError,
    region::{highest_address, MemoryRegion, RegionKind},
};
use x86_64::{
    structures::paging::{
        frame::PhysFrameRange, FrameAllocator, FrameDeallocator, PhysFrame, Size4KiB,
    },
    PhysAddr, VirtAddr,
};

/// Physical frame allocator backed by a bitmap, one bit per 4 KiB frame.
///
/// A set bit means the frame is in use or lies outside every usable region.
/// A second bitmap of the same size, right behind the first, records which
/// frames were usable at init so that frees of anything else are refused.
/// Both live in the first usable region large enough to hold them and are
/// written through their HHDM alias; their own frames stay marked used.
pub struct BitmapFrameAllocator {
    bitmap: &'static mut [u8],
    usable: &'static [u8],
    bitmap_base: PhysAddr,
    total_frames: usize,
    free_frames: usize,
    /// Byte index of the last successful allocation.
    cursor: usize,
}

impl BitmapFrameAllocator {
    /// Builds the allocator from the bootloader memory map.
    ///
    /// # Errors
    ///
    /// [`MemoryError::OutOfMemory`] if no usable region can hold the bitmaps.
    ///
    /// # Safety
    ///
    /// `hhdm_offset` must map all of physical memory, and the usable regions
    /// in `regions` must really be unused: the bitmap is written into the
    /// first one that fits, and every usable frame is handed out later.
    pub unsafe fn init<I>(regions: I, hhdm_offset: VirtAddr) -> Result<Self, MemoryError>
    where
        I: Iterator<Item = MemoryRegion> + Clone,
    {
        let highest = highest_address(regions.clone());
        let total_frames = (highest as usize).div_ceil(FRAME_SIZE);
        let bitmap_size = total_frames.div_ceil(BITMAP_ENTRY_SIZE);

        log::info!(
            "top of physical memory is {:#x}, {} frames, bitmap takes {} bytes",
            highest,
            total_frames,
            bitmap_size
        );

        if bitmap_size == 0 {
            return Err(MemoryError::OutOfMemory);
        }

        let bitmap_base = regions
            .clone()
            .filter(|region| region.kind == RegionKind::Usable)
            .map(|region| (PhysAddr::new(region.base).align_up(PAGE_SIZE), region.end()))
            .find(|(base, end)| base.as_u64() + 2 * bitmap_size as u64 <= *end)
            .map(|(base, _)| base)
            .ok_or(MemoryError::OutOfMemory)?;

        log::info!("placing frame bitmap at {:?}", bitmap_base);

        let bitmap_ptr: *mut u8 = (hhdm_offset + bitmap_base.as_u64()).as_mut_ptr();
        let bitmap = unsafe { core::slice::from_raw_parts_mut(bitmap_ptr, bitmap_size) };
        let usable = unsafe {
            core::slice::from_raw_parts_mut(bitmap_ptr.add(bitmap_size), bitmap_size)
        };

        // everything starts out used; reserved and unknown ranges stay that way
        bitmap.fill(FULL_BITMAP_ENTRY);
        usable.fill(0);
        for region in regions.clone().filter(|region| region.kind == RegionKind::Usable) {
            for frame_index in whole_frames(region.base, region.length, total_frames) {
                usable[frame_index / BITMAP_ENTRY_SIZE] |= 1 << (frame_index % BITMAP_ENTRY_SIZE);
            }
        }

        let mut allocator = Self {
            bitmap,
            usable,
            bitmap_base,
            total_frames,
            free_frames: 0,
            cursor: 0,
        };

        for region in regions.filter(|region| region.kind == RegionKind::Usable) {
            allocator.free_region(region.base, region.length);
        }

        // The bitmaps sit in a usable region, so they were just released above.
        for frame_index in allocator.bitmap_frame_indices() {
            allocator.set_bit(frame_index);
        }

        log::info!("{} frames free after init", allocator.free_frames);

        Ok(allocator)
    }

    /// Allocates one frame, resuming the scan where the last one succeeded.
    ///
    /// Returns `None` only when no frame is free anywhere.
    pub fn alloc_page(&mut self) -> Option<PhysAddr> {
        let start = self.cursor;
        let byte_index = (start..self.bitmap.len())
            .chain(0..start)
            .find(|&index| self.bitmap[index] != FULL_BITMAP_ENTRY)?;

        let bit_index = self.bitmap[byte_index].trailing_ones() as usize;
        let frame_index = byte_index * BITMAP_ENTRY_SIZE + bit_index;
        debug_assert!(frame_index < self.total_frames);

        self.set_bit(frame_index);
        self.cursor = byte_index;

        Some(PhysAddr::new((frame_index * FRAME_SIZE) as u64))
    }

    /// Returns a frame previously handed out by [`alloc_page`](Self::alloc_page).
    ///
    /// # Errors
    ///
    /// [`MemoryError::InvalidFree`] if `phys` is unaligned, beyond the end of
    /// physical memory, outside every usable region, part of the bitmaps, or
    /// already free. The allocator is left untouched in that case.
    pub fn free_page(&mut self, phys: PhysAddr) -> Result<(), MemoryError> {
        if phys.as_u64() % PAGE_SIZE != 0 {
            return Err(MemoryError::InvalidFree(phys));
        }

        let frame_index = (phys.as_u64() / PAGE_SIZE) as usize;
        if frame_index >= self.total_frames
            || !self.was_usable(frame_index)
            || self.bitmap_frame_indices().contains(&frame_index)
            || !self.is_bit_set(frame_index)
        {
            return Err(MemoryError::InvalidFree(phys));
        }

        self.clear_bit(frame_index);
        Ok(())
    }

    pub fn free_page_count(&self) -> usize {
        self.free_frames
    }

    pub fn total_frames(&self) -> usize {
        self.total_frames
    }

    /// Check if frame is used. Frames past the end of memory count as used.
    pub fn is_frame_used(&self, frame: PhysFrame) -> bool {
        let frame_index = (frame.start_address().as_u64() / PAGE_SIZE) as usize;
        frame_index >= self.total_frames || self.is_bit_set(frame_index)
    }

    /// Frames occupied by the bitmaps themselves.
    pub fn bitmap_frames(&self) -> PhysFrameRange {
        let Range { start, end } = self.bitmap_frame_indices();
        PhysFrame::range(
            PhysFrame::containing_address(PhysAddr::new((start * FRAME_SIZE) as u64)),
            PhysFrame::containing_address(PhysAddr::new((end * FRAME_SIZE) as u64)),
        )
    }

    fn bitmap_frame_indices(&self) -> Range<usize> {
        let start = self.bitmap_base.as_u64() as usize / FRAME_SIZE;
        let end = (self.bitmap_base.as_u64() as usize + self.bitmap.len() + self.usable.len())
            .div_ceil(FRAME_SIZE);
        start..end
    }

    /// Mark the frames fully inside [base, base + length) as free.
    fn free_region(&mut self, base: u64, length: u64) {
        for frame_index in whole_frames(base, length, self.total_frames) {
            self.clear_bit(frame_index);
        }
    }

    /// set a particular bit (1), keeping the free count in step
    fn set_bit(&mut self, frame_index: usize) {
        assert!(frame_index < self.total_frames);

        let mask = 1 << (frame_index % BITMAP_ENTRY_SIZE);
        let entry = &mut self.bitmap[frame_index / BITMAP_ENTRY_SIZE];
        if *entry & mask == 0 {
            *entry |= mask;
            self.free_frames -= 1;
        }
    }

    /// clear a particular bit (0), keeping the free count in step
    fn clear_bit(&mut self, frame_index: usize) {
        assert!(frame_index < self.total_frames);

        let mask = 1 << (frame_index % BITMAP_ENTRY_SIZE);
        let entry = &mut self.bitmap[frame_index / BITMAP_ENTRY_SIZE];
        if *entry & mask != 0 {
            *entry &= !mask;
            self.free_frames += 1;
        }
    }

    fn is_bit_set(&self, frame_index: usize) -> bool {
        let mask = 1 << (frame_index % BITMAP_ENTRY_SIZE);
        self.bitmap[frame_index / BITMAP_ENTRY_SIZE] & mask != 0
    }

    fn was_usable(&self, frame_index: usize) -> bool {
        let mask = 1 << (frame_index % BITMAP_ENTRY_SIZE);
        self.usable[frame_index / BITMAP_ENTRY_SIZE] & mask != 0
    }
}

/// Indices of the frames lying entirely inside [base, base + length).
fn whole_frames(base: u64, length: u64, total_frames: usize) -> Range<usize> {
    let start_frame = (base as usize).div_ceil(FRAME_SIZE);
    let end_frame = ((base + length) as usize / FRAME_SIZE).min(total_frames);
    start_frame..end_frame.max(start_frame)
}

unsafe impl FrameAllocator<Size4KiB> for BitmapFrameAllocator {
    fn allocate_frame(&mut self) -> Option<PhysFrame> {
        self.alloc_page().map(PhysFrame::containing_address)
    }
}

impl FrameDeallocator<Size4KiB> for BitmapFrameAllocator {
    unsafe fn deallocate_frame(&mut self, frame: PhysFrame<Size4KiB>) {
        if let Err(err) = self.free_page(frame.start_address()) {
            log::error!("{}", err);
        }
    }
}
