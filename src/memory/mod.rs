//! Virtual/physical memory management (`spec.md` §4.1-§4.3).

pub mod engine;
pub mod paging;
pub mod physical;
pub mod pml4;
pub mod vrange;

use crate::boot::E820Entry;
use crate::config::ENGINEER_WINDOW_VADDR;
use physical::FrameBitmap;
use pml4::PML4_REGISTRY;
use spin::Mutex;
use vrange::VRangeAllocator;
use x86_64::PhysAddr;

/// Global physical frame bitmap, guarded by a single spinlock per `spec.md`
/// §4.1 ("single global lock guards the whole bitmap").
pub static PHYSICAL_FRAMES: Mutex<FrameBitmap> = Mutex::new(FrameBitmap::empty());

/// Kernel-half virtual range allocator, shared by every process's address
/// space via PML4 synchronization.
pub static KERNEL_VRANGE: Mutex<VRangeAllocator> = Mutex::new(VRangeAllocator::empty());

/// Kernel half base and size. Anchored at the fixed engineer-window address
/// so that address falls inside the managed range as its very first page.
const KERNEL_HALF_BASE: u64 = ENGINEER_WINDOW_VADDR;
const KERNEL_HALF_PAGES: u64 = 1 << 20;

/// Bring up the physical allocator and kernel virtual address space. Must
/// run once, early, before scheduling or interrupts are live. `pid0_pml4_phys`
/// is whatever PML4 the bootloader left active; it becomes the first entry
/// in the kernel-half synchronization registry.
pub fn init(e820_entries: &[E820Entry], pid0_pml4_phys: u64) {
    PHYSICAL_FRAMES.lock().init(e820_entries);
    crate::log_info!("Physical frame bitmap initialized: {} frames free", PHYSICAL_FRAMES.lock().free_frame_count());

    let mut vr = KERNEL_VRANGE.lock();
    vr.init(KERNEL_HALF_BASE, KERNEL_HALF_PAGES);
    // Reserve the fixed engineer-window slot so the general allocator never
    // hands it out for anything else.
    let window_pages = 1;
    let _ = vr.allocate_specific(ENGINEER_WINDOW_VADDR, window_pages);
    drop(vr);
    crate::log_info!("Kernel virtual range allocator initialized");

    PML4_REGISTRY.lock().register(PhysAddr::new(pid0_pml4_phys));
}
