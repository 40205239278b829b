//! Page-table engine: `map`/`unmap`/`phys_of` over a process's PML4
//! (`spec.md` §4.2).
//!
//! Assembles the PTE codec and engineer window from `paging` with the
//! kernel-half registry from `pml4` into the three operations the rest of
//! the kernel actually calls. Grounded on
//! `original_source/mem/x64/mem-x64.cpp`'s `mem_map_range`, `mem_unmap_range`
//! and `mem_get_phys_addr`, which walk the same PML4/PDPT/PD tree (2 MiB
//! leaves only) through the single working-table window and take the
//! kernel-half lock only when the touched entry falls in the upper half.
//!
//! The walk itself (`map_impl`/`unmap_impl`/`phys_of_impl`) is written
//! against the `TableWindow` trait rather than raw pointers, so it runs
//! unmodified against real physical memory in the kernel and against a
//! simulated address space in tests.

use crate::config::{FRAME_SIZE, PAGE_TABLE_PAGE_SIZE};
use crate::error::{KResult, KernelError};
use crate::memory::paging::{self, vaddr_indices, CacheType};
use crate::memory::pml4::{self, PML4_REGISTRY};
#[cfg(not(test))]
use crate::memory::PHYSICAL_FRAMES;
use spin::Mutex;
use x86_64::PhysAddr;

/// Gives the walk below read/write access to one page-table page's 512 raw
/// entries at a time, plus a way to invalidate a mapped address once it's
/// been changed. Real hardware reaches a page through the engineer window;
/// tests reach it through a simulated physical address space.
trait TableWindow {
    fn view(&mut self, table_phys: u64) -> &mut [u64; 512];
    fn invalidate(&mut self, vaddr: u64);
}

/// Bump-allocates 4 KiB intermediate table pages out of 2 MiB frames drawn
/// from the physical bitmap (`spec.md` §4.2: "a simple bump allocator").
/// Never frees a sub-page individually; table pages live as long as the
/// mapping that needed them.
struct TableBumpAllocator {
    current_frame: Option<u64>,
    next_offset: u64,
}

impl TableBumpAllocator {
    const fn empty() -> Self {
        TableBumpAllocator { current_frame: None, next_offset: FRAME_SIZE }
    }

    fn alloc_page(&mut self, alloc_frame: &mut dyn FnMut() -> KResult<u64>) -> KResult<u64> {
        if self.next_offset >= FRAME_SIZE {
            self.current_frame = Some(alloc_frame()?);
            self.next_offset = 0;
        }
        let base = self.current_frame.ok_or(KernelError::OutOfResource)?;
        let addr = base + self.next_offset;
        self.next_offset += PAGE_TABLE_PAGE_SIZE;
        Ok(addr)
    }
}

/// Global table-page bump allocator shared by every `map` call.
static TABLE_BUMP: Mutex<TableBumpAllocator> = Mutex::new(TableBumpAllocator::empty());

fn encode_nonleaf(target_addr: u64, user_mode: bool) -> KResult<u64> {
    paging::encode_pte(paging::PageTableEntryInfo {
        target_addr,
        present: true,
        writable: true,
        user_mode,
        leaf: false,
        cache_type: CacheType::WriteBack,
    })
}

fn encode_leaf(target_addr: u64, user_mode: bool, cache_type: CacheType) -> KResult<u64> {
    paging::encode_pte(paging::PageTableEntryInfo {
        target_addr,
        present: true,
        writable: true,
        user_mode,
        leaf: true,
        cache_type,
    })
}

/// Find (or, for `map`, create) the PDPT/PD entry that `vaddr` falls under
/// within `pml4_phys`, returning the physical address of the next table
/// down. When an entry is created in the kernel half, the caller is told so
/// it can run the PML4-wide synchronization step.
fn walk_or_create(
    window: &mut dyn TableWindow,
    table_bump: &mut TableBumpAllocator,
    alloc_frame: &mut dyn FnMut() -> KResult<u64>,
    table_phys: u64,
    index: usize,
    user_mode: bool,
    create: bool,
) -> KResult<(u64, bool)> {
    let raw = window.view(table_phys)[index];
    if raw != 0 {
        let decoded = paging::decode_pte(raw)?;
        if !decoded.present {
            return Err(KernelError::NotFound);
        }
        return Ok((decoded.target_addr, false));
    }
    if !create {
        return Err(KernelError::NotFound);
    }
    let new_table = table_bump.alloc_page(alloc_frame)?;
    for entry in window.view(new_table).iter_mut() {
        *entry = 0;
    }
    let pte = encode_nonleaf(new_table, user_mode)?;
    window.view(table_phys)[index] = pte;
    Ok((new_table, true))
}

fn map_impl(
    window: &mut dyn TableWindow,
    alloc_frame: &mut dyn FnMut() -> KResult<u64>,
    vaddr: u64,
    paddr: u64,
    pml4_phys: u64,
    cache: CacheType,
) -> KResult<()> {
    if !pml4::is_canonical_vaddr(vaddr) {
        return Err(KernelError::InvalidParam);
    }
    let (pml4_idx, pdpt_idx, pd_idx, _) = vaddr_indices(vaddr);
    let user_mode = !pml4::is_kernel_half(pml4_idx);

    // Kernel-half edits are serialized and propagated under the single
    // global PML4-edit lock (`spec.md` §4.2); user-half edits only ever
    // touch this process's own tables and need no such coordination.
    let mut registry_guard = pml4::is_kernel_half(pml4_idx).then(|| PML4_REGISTRY.lock());

    let mut table_bump = TABLE_BUMP.lock();

    let (pdpt_phys, pml4_created) = walk_or_create(
        window,
        &mut table_bump,
        alloc_frame,
        pml4_phys,
        pml4_idx,
        user_mode,
        true,
    )?;
    let (pd_phys, _) =
        walk_or_create(window, &mut table_bump, alloc_frame, pdpt_phys, pdpt_idx, user_mode, true)?;

    let existing = window.view(pd_phys)[pd_idx];
    if existing != 0 {
        let decoded = paging::decode_pte(existing)?;
        if decoded.present {
            return Err(KernelError::AlreadyExists);
        }
    }

    let leaf = encode_leaf(paddr, user_mode, cache)?;
    window.view(pd_phys)[pd_idx] = leaf;
    window.invalidate(vaddr);

    if pml4_created {
        if let Some(registry) = registry_guard.as_deref_mut() {
            synchronize_kernel_half(registry, window, pml4_phys);
        }
    }
    drop(registry_guard);
    Ok(())
}

fn unmap_impl(window: &mut dyn TableWindow, vaddr: u64, pml4_phys: u64) -> KResult<()> {
    if !pml4::is_canonical_vaddr(vaddr) {
        return Err(KernelError::InvalidParam);
    }
    let (pml4_idx, pdpt_idx, pd_idx, _) = vaddr_indices(vaddr);
    let mut no_alloc = || -> KResult<u64> { Err(KernelError::NotFound) };
    let mut table_bump = TableBumpAllocator::empty();

    let (pdpt_phys, _) =
        walk_or_create(window, &mut table_bump, &mut no_alloc, pml4_phys, pml4_idx, false, false)?;
    let (pd_phys, _) =
        walk_or_create(window, &mut table_bump, &mut no_alloc, pdpt_phys, pdpt_idx, false, false)?;

    window.view(pd_phys)[pd_idx] = 0;
    window.invalidate(vaddr);
    Ok(())
}

fn phys_of_impl(window: &mut dyn TableWindow, vaddr: u64, pml4_phys: u64) -> Option<u64> {
    if !pml4::is_canonical_vaddr(vaddr) {
        return None;
    }
    let (pml4_idx, pdpt_idx, pd_idx, _) = vaddr_indices(vaddr);
    let mut no_alloc = || -> KResult<u64> { Err(KernelError::NotFound) };
    let mut table_bump = TableBumpAllocator::empty();

    let (pdpt_phys, _) =
        walk_or_create(window, &mut table_bump, &mut no_alloc, pml4_phys, pml4_idx, false, false)
            .ok()?;
    let (pd_phys, _) =
        walk_or_create(window, &mut table_bump, &mut no_alloc, pdpt_phys, pdpt_idx, false, false)
            .ok()?;

    let raw = window.view(pd_phys)[pd_idx];
    if raw == 0 {
        return None;
    }
    let decoded = paging::decode_pte(raw).ok()?;
    if !decoded.present {
        return None;
    }
    Some(decoded.target_addr)
}

/// Copy the kernel half of `updated_pml4` into every other live PML4.
/// `window` is reached through a raw pointer inside the closures below:
/// `Pml4Registry::synchronize` takes two separate `FnMut`s, and both need
/// the same window, so they can't each hold a safe `&mut` to it - the
/// window type itself guarantees only one table page is ever in view at a
/// time, so there is no real aliasing, just two closures sharing one value.
fn synchronize_kernel_half(registry: &mut pml4::Pml4Registry, window: &mut dyn TableWindow, updated_pml4: u64) {
    let window_ptr: *mut dyn TableWindow = window;
    unsafe {
        registry.synchronize(
            PhysAddr::new(updated_pml4),
            |phys| {
                let entries = (*window_ptr).view(phys.as_u64());
                let mut out = [0u64; pml4::PML4_ENTRY_COUNT - pml4::KERNEL_HALF_START];
                out.copy_from_slice(&entries[pml4::KERNEL_HALF_START..]);
                out
            },
            |phys, scratch| {
                let entries = (*window_ptr).view(phys.as_u64());
                entries[pml4::KERNEL_HALF_START..].copy_from_slice(scratch);
            },
        );
    }
}

#[cfg(not(test))]
mod hardware {
    use super::TableWindow;
    use crate::memory::paging::EngineerWindow;
    use x86_64::VirtAddr;

    /// Reaches page-table pages through the engineer window, backed by the
    /// fixed virtual address `spec.md` §4.2/§9 reserves for it. The window's
    /// own backing PTE lives in the kernel's permanent, offset-mapped
    /// identity region, so repointing it is just a volatile write there.
    pub struct HardwareWindow {
        window: EngineerWindow,
        backing_pte_vaddr: u64,
    }

    impl HardwareWindow {
        pub const fn new(backing_pte_vaddr: u64) -> Self {
            HardwareWindow { window: EngineerWindow::new(), backing_pte_vaddr }
        }
    }

    impl TableWindow for HardwareWindow {
        fn view(&mut self, table_phys: u64) -> &mut [u64; 512] {
            let backing_pte_vaddr = self.backing_pte_vaddr;
            unsafe {
                self.window
                    .point_at(
                        table_phys,
                        |pte| core::ptr::write_volatile(backing_pte_vaddr as *mut u64, pte),
                        || x86_64::instructions::tlb::flush(VirtAddr::new(crate::config::ENGINEER_WINDOW_VADDR)),
                    )
                    .expect("engineer window repoint failed");
                &mut *(crate::config::ENGINEER_WINDOW_VADDR as *mut [u64; 512])
            }
        }

        fn invalidate(&mut self, vaddr: u64) {
            x86_64::instructions::tlb::flush(VirtAddr::new(vaddr));
        }
    }
}

#[cfg(not(test))]
use hardware::HardwareWindow;

#[cfg(not(test))]
static HARDWARE_WINDOW: Mutex<Option<HardwareWindow>> = Mutex::new(None);

/// Must be called once, early, after `bootstrap_window` has located the
/// engineer window's own backing PTE.
#[cfg(not(test))]
pub fn init_hardware_window(backing_pte_vaddr: u64) {
    *HARDWARE_WINDOW.lock() = Some(HardwareWindow::new(backing_pte_vaddr));
}

#[cfg(not(test))]
fn phys_table(physical_memory_offset: u64, table_phys: u64) -> &'static mut [u64; 512] {
    unsafe { &mut *((physical_memory_offset + table_phys) as *mut [u64; 512]) }
}

#[cfg(not(test))]
fn ensure_child(
    physical_memory_offset: u64,
    table_phys: u64,
    index: usize,
    alloc_frame: &mut dyn FnMut() -> KResult<u64>,
) -> KResult<u64> {
    let raw = phys_table(physical_memory_offset, table_phys)[index];
    if raw != 0 {
        return Ok(paging::decode_pte(raw)?.target_addr);
    }
    let child_phys = alloc_frame()?;
    for entry in phys_table(physical_memory_offset, child_phys).iter_mut() {
        *entry = 0;
    }
    phys_table(physical_memory_offset, table_phys)[index] = encode_nonleaf(child_phys, false)?;
    Ok(child_phys)
}

/// Builds the one true 4-level translation chain in an otherwise 2 MiB-only
/// address space: the engineer window's own backing leaf needs 4 KiB
/// granularity, so its PD entry points at a real PT instead of being a leaf
/// itself. Walks the active table directly through the bootloader's
/// physical-memory offset, since the window can't bootstrap itself. Returns
/// the virtual address of the window's own backing PTE, for
/// `init_hardware_window`.
#[cfg(not(test))]
pub fn bootstrap_window(physical_memory_offset: u64, pid0_pml4_phys: u64) -> KResult<u64> {
    let window_vaddr = crate::config::ENGINEER_WINDOW_VADDR;
    let (pml4_idx, pdpt_idx, pd_idx, _) = vaddr_indices(window_vaddr);
    let pt_idx = ((window_vaddr >> 12) & 0x1FF) as usize;

    let mut alloc_frame = || -> KResult<u64> { PHYSICAL_FRAMES.lock().allocate(1) };

    let pdpt_phys = ensure_child(physical_memory_offset, pid0_pml4_phys, pml4_idx, &mut alloc_frame)?;
    let pd_phys = ensure_child(physical_memory_offset, pdpt_phys, pdpt_idx, &mut alloc_frame)?;
    let pt_phys = ensure_child(physical_memory_offset, pd_phys, pd_idx, &mut alloc_frame)?;

    Ok(physical_memory_offset + pt_phys + (pt_idx as u64) * 8)
}

#[cfg(not(test))]
pub fn map(vaddr: u64, paddr: u64, pml4_phys: u64, cache: CacheType) -> KResult<()> {
    let mut guard = HARDWARE_WINDOW.lock();
    let window = guard.as_mut().expect("hardware window not initialized");
    map_impl(window, &mut || PHYSICAL_FRAMES.lock().allocate(1), vaddr, paddr, pml4_phys, cache)
}

#[cfg(not(test))]
pub fn unmap(vaddr: u64, pml4_phys: u64) -> KResult<()> {
    let mut guard = HARDWARE_WINDOW.lock();
    let window = guard.as_mut().expect("hardware window not initialized");
    unmap_impl(window, vaddr, pml4_phys)
}

#[cfg(not(test))]
pub fn phys_of(vaddr: u64, pml4_phys: u64) -> Option<u64> {
    let mut guard = HARDWARE_WINDOW.lock();
    let window = guard.as_mut().expect("hardware window not initialized");
    phys_of_impl(window, vaddr, pml4_phys)
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::collections::BTreeMap;

    /// Simulated physical address space: every "table page" is just a slot
    /// in a map, keyed by the fake physical address the bump allocator below
    /// hands out. Exercises the exact same walk logic as real hardware.
    struct TestWindow {
        pages: BTreeMap<u64, [u64; 512]>,
        invalidated: Vec<u64>,
    }

    impl TestWindow {
        fn new() -> Self {
            TestWindow { pages: BTreeMap::new(), invalidated: Vec::new() }
        }
    }

    impl TableWindow for TestWindow {
        fn view(&mut self, table_phys: u64) -> &mut [u64; 512] {
            self.pages.entry(table_phys).or_insert([0u64; 512])
        }

        fn invalidate(&mut self, vaddr: u64) {
            self.invalidated.push(vaddr);
        }
    }

    use alloc::vec::Vec;

    struct TestFrames {
        next: u64,
    }

    impl TestFrames {
        fn new(base: u64) -> Self {
            TestFrames { next: base }
        }

        fn alloc(&mut self) -> KResult<u64> {
            let addr = self.next;
            self.next += FRAME_SIZE;
            Ok(addr)
        }
    }

    const ROOT_PML4: u64 = 0x1000_0000;
    const FRAME_BASE: u64 = 0x2000_0000;

    #[test]
    fn map_then_phys_of_then_unmap_round_trips() {
        let mut window = TestWindow::new();
        let mut frames = TestFrames::new(FRAME_BASE);
        let vaddr = 0x0000_0000_4000_0000u64;
        let paddr = 0x0000_0000_0040_0000u64;

        map_impl(&mut window, &mut || frames.alloc(), vaddr, paddr, ROOT_PML4, CacheType::WriteBack).unwrap();
        assert_eq!(phys_of_impl(&mut window, vaddr, ROOT_PML4), Some(paddr));

        unmap_impl(&mut window, vaddr, ROOT_PML4).unwrap();
        assert_eq!(phys_of_impl(&mut window, vaddr, ROOT_PML4), None);
    }

    #[test]
    fn map_rejects_already_present_leaf() {
        let mut window = TestWindow::new();
        let mut frames = TestFrames::new(FRAME_BASE);
        let vaddr = 0x0000_0000_4000_0000u64;

        map_impl(&mut window, &mut || frames.alloc(), vaddr, 0x40_0000, ROOT_PML4, CacheType::WriteBack).unwrap();
        let result = map_impl(&mut window, &mut || frames.alloc(), vaddr, 0x60_0000, ROOT_PML4, CacheType::WriteBack);
        assert_eq!(result, Err(KernelError::AlreadyExists));
    }

    #[test]
    fn phys_of_unmapped_address_is_none() {
        let mut window = TestWindow::new();
        assert_eq!(phys_of_impl(&mut window, 0x0000_0000_7000_0000, ROOT_PML4), None);
    }

    #[test]
    fn unmap_invalidates_the_target_address() {
        let mut window = TestWindow::new();
        let mut frames = TestFrames::new(FRAME_BASE);
        let vaddr = 0x0000_0000_4000_0000u64;

        map_impl(&mut window, &mut || frames.alloc(), vaddr, 0x40_0000, ROOT_PML4, CacheType::WriteBack).unwrap();
        unmap_impl(&mut window, vaddr, ROOT_PML4).unwrap();
        assert!(window.invalidated.contains(&vaddr));
    }

    #[test]
    fn kernel_half_map_propagates_to_other_known_pml4s() {
        let mut window = TestWindow::new();
        let mut frames = TestFrames::new(FRAME_BASE);
        let kernel_vaddr = 0xFFFF_FF00_0000_0000u64;
        let paddr = 0x0080_0000u64;

        let other_pml4 = 0x3000_0000u64;
        PML4_REGISTRY.lock().register(PhysAddr::new(ROOT_PML4));
        PML4_REGISTRY.lock().register(PhysAddr::new(other_pml4));

        map_impl(&mut window, &mut || frames.alloc(), kernel_vaddr, paddr, ROOT_PML4, CacheType::WriteBack).unwrap();

        assert_eq!(phys_of_impl(&mut window, kernel_vaddr, other_pml4), Some(paddr));

        PML4_REGISTRY.lock().unregister(PhysAddr::new(ROOT_PML4));
        PML4_REGISTRY.lock().unregister(PhysAddr::new(other_pml4));
    }

    #[test]
    fn rejects_non_canonical_vaddr() {
        let mut window = TestWindow::new();
        let mut frames = TestFrames::new(FRAME_BASE);
        let bad_vaddr = 0x0001_0000_0000_0000u64;
        assert_eq!(
            map_impl(&mut window, &mut || frames.alloc(), bad_vaddr, 0x40_0000, ROOT_PML4, CacheType::WriteBack),
            Err(KernelError::InvalidParam)
        );
        assert_eq!(phys_of_impl(&mut window, bad_vaddr, ROOT_PML4), None);
    }
}
