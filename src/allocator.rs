//! Kernel heap, backing the `alloc` collections used throughout (scheduler
//! thread lists, the virtual-range allocator's `BTreeMap`, message queues).
//!
//! A single fixed-size region is carved out of kernel virtual address space
//! at boot and handed to `linked_list_allocator`; this is plain ambient
//! infrastructure none of `spec.md`'s modules describe directly, but every
//! one of them depends on `alloc` being available.

use linked_list_allocator::LockedHeap;
use x86_64::structures::paging::mapper::MapToError;
use x86_64::structures::paging::{FrameAllocator, Mapper, OffsetPageTable, Page, PageTableFlags, PhysFrame, Size2MiB, Size4KiB};
use x86_64::{PhysAddr, VirtAddr};

use crate::memory::PHYSICAL_FRAMES;

pub const HEAP_START: u64 = 0xFFFF_FE00_0000_0000;
pub const HEAP_SIZE: usize = 8 * 1024 * 1024;

#[global_allocator]
static ALLOCATOR: LockedHeap = LockedHeap::empty();

/// Hands out frames from the single global bitmap (`memory::physical`) to
/// the `x86_64` crate's page-table walker. Page-table frames are always
/// 4 KiB even when the leaf mapping is 2 MiB, so this implements both sizes
/// over the same 2 MiB-granularity bitmap, using only the low 4 KiB of each
/// frame handed out for `Size4KiB` requests - wasteful, but the bitmap never
/// hands out anything smaller (`spec.md` §4.1) and intermediate table pages
/// are rare compared to heap leaf pages.
struct BitmapFrameAllocator;

unsafe impl FrameAllocator<Size4KiB> for BitmapFrameAllocator {
    fn allocate_frame(&mut self) -> Option<PhysFrame<Size4KiB>> {
        let addr = PHYSICAL_FRAMES.lock().allocate(1).ok()?;
        Some(PhysFrame::containing_address(PhysAddr::new(addr)))
    }
}

unsafe impl FrameAllocator<Size2MiB> for BitmapFrameAllocator {
    fn allocate_frame(&mut self) -> Option<PhysFrame<Size2MiB>> {
        let addr = PHYSICAL_FRAMES.lock().allocate(1).ok()?;
        Some(PhysFrame::containing_address(PhysAddr::new(addr)))
    }
}

/// Map `[HEAP_START, HEAP_START + HEAP_SIZE)` as 2 MiB pages backed by fresh
/// frames from the physical bitmap, then hand that range to
/// `linked_list_allocator`.
///
/// # Safety
/// Must be called exactly once, after `memory::init` has populated
/// `PHYSICAL_FRAMES`, and before any `alloc`-using code runs.
pub unsafe fn init_heap(mapper: &mut OffsetPageTable) -> Result<(), MapToError<Size2MiB>> {
    let mut frame_alloc = BitmapFrameAllocator;
    let heap_start = VirtAddr::new(HEAP_START);
    let heap_end = heap_start + (HEAP_SIZE as u64 - 1);
    let start_page = Page::<Size2MiB>::containing_address(heap_start);
    let end_page = Page::<Size2MiB>::containing_address(heap_end);

    for page in Page::range_inclusive(start_page, end_page) {
        let frame = frame_alloc.allocate_frame().ok_or(MapToError::FrameAllocationFailed)?;
        let flags = PageTableFlags::PRESENT | PageTableFlags::WRITABLE;
        mapper.map_to(page, frame, flags, &mut frame_alloc)?.flush();
    }

    ALLOCATOR.lock().init(HEAP_START as *mut u8, HEAP_SIZE);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn heap_region_is_page_aligned() {
        assert_eq!(HEAP_START % 4096, 0);
        assert_eq!(HEAP_SIZE % 4096, 0);
    }
}
