//! Page-table entry encoding and the engineer window (`spec.md` §4.2).
//!
//! Grounded on `original_source/mem/x64/mem-x64.cpp::mem_encode_page_table_entry`
//! / `mem_decode_page_table_entry` for the bit layout, and on
//! `original_source/mem/x64/mem_pat_x64.cpp` for the PAT index table. Real
//! memory is always mapped in 2 MiB leaf pages (`spec.md` §3), so the PAT bit
//! always lives at bit 12 rather than bit 7 - the original takes the same
//! shortcut, noting it "can get away with assuming the PAT to be in bit 12,
//! because we never allocate pages less than 2MB".

use crate::error::KernelError;
use x86_64::registers::control::Cr3;
use x86_64::structures::paging::{OffsetPageTable, PageTable as HwPageTable};
use x86_64::VirtAddr;

/// Build an `OffsetPageTable` over the CPU's currently active PML4, using
/// the bootloader's permanent physical-memory mapping at
/// `physical_memory_offset`. This is how the kernel edits its *own* tables
/// (e.g. to back the heap) and is deliberately separate from the engineer
/// window below, which only ever views one *foreign* page table at a time.
///
/// # Safety
/// `physical_memory_offset` must be the real offset the bootloader mapped
/// all physical memory at, and this must be called at most once before any
/// other code walks the returned table concurrently.
#[cfg(not(test))]
pub unsafe fn active_mapper(physical_memory_offset: u64) -> OffsetPageTable<'static> {
    let phys_offset = VirtAddr::new(physical_memory_offset);
    let level_4_table = active_level_4_table(phys_offset);
    OffsetPageTable::new(level_4_table, phys_offset)
}

#[cfg(not(test))]
unsafe fn active_level_4_table(physical_memory_offset: VirtAddr) -> &'static mut HwPageTable {
    let (level_4_table_frame, _) = Cr3::read();
    let phys = level_4_table_frame.start_address();
    let virt = physical_memory_offset + phys.as_u64();
    let page_table_ptr: *mut HwPageTable = virt.as_mut_ptr();
    &mut *page_table_ptr
}

/// MSR value written to `IA32_PAT` at boot, assigning PAT slots 0-7 to the
/// cache types below (`original_source/mem/x64/mem_pat_x64.cpp`).
pub const PAT_REGISTER_VAL: u64 = 0x0005_0406_0001_0406;

/// Cache behaviour for a mapping, per `spec.md` §4.2.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheType {
    WriteBack,
    WriteThrough,
    WriteCombining,
    Uncacheable,
    WriteProtected,
}

/// PAT index for `cache` when used on a leaf (`non_leaf = false`) or a
/// non-leaf, tree-walking entry (`non_leaf = true`). Non-leaf entries are
/// restricted to PAT indices 0-3 because they have no PAT bit (bit 12) of
/// their own to select slots 4-7.
pub fn pat_index(cache: CacheType, non_leaf: bool) -> Result<u8, KernelError> {
    let idx = match cache {
        CacheType::WriteBack => 0,
        CacheType::WriteThrough => 1,
        CacheType::WriteCombining => 2,
        CacheType::Uncacheable => 3,
        CacheType::WriteProtected => 6,
    };
    if non_leaf && idx >= 4 {
        return Err(KernelError::InvalidParam);
    }
    Ok(idx)
}

/// Inverse of `pat_index`: recover the cache type from a decoded PAT index.
pub fn pat_decode(pat_idx: u8) -> Result<CacheType, KernelError> {
    match pat_idx {
        0 | 4 => Ok(CacheType::WriteBack),
        1 | 5 => Ok(CacheType::WriteThrough),
        2 => Ok(CacheType::WriteCombining),
        3 | 7 => Ok(CacheType::Uncacheable),
        6 => Ok(CacheType::WriteProtected),
        _ => Err(KernelError::InvalidParam),
    }
}

/// User-friendly view of a page-table entry, before/after hardware encoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageTableEntryInfo {
    pub target_addr: u64,
    pub present: bool,
    pub writable: bool,
    pub user_mode: bool,
    /// True for a leaf entry that translates to a physical frame; false for
    /// an entry that points at the next level of the tree.
    pub leaf: bool,
    pub cache_type: CacheType,
}

const ADDR_MASK_NONLEAF: u64 = 0x0007_FFFF_FFFF_F000;
const ADDR_MASK_LEAF: u64 = 0x0007_FFFF_FFF0_0000;

/// Encode an entry into the raw 64-bit value a CPU understands.
pub fn encode_pte(pte: PageTableEntryInfo) -> Result<u64, KernelError> {
    let pat_value = pat_index(pte.cache_type, !pte.leaf)?;
    if pte.leaf && (pte.target_addr & 0x1F_FFFF) != 0 {
        return Err(KernelError::InvalidParam);
    }

    let mask = if pte.leaf { ADDR_MASK_LEAF } else { ADDR_MASK_NONLEAF };
    let mut result = pte.target_addr & mask;
    if pte.leaf {
        result |= 0x80;
    }
    if pte.present {
        result |= 0x01;
    }
    if pte.writable {
        result |= 0x02;
    }
    if pte.user_mode {
        result |= 0x04;
    }

    // PCD/PWT at bits 4:3, plus the PAT bit at bit 12 for leaf entries.
    result |= u64::from(pat_value & 0x03) << 3;
    if pte.leaf && (pat_value & 0x04) != 0 {
        result |= 0x1000;
    }

    Ok(result)
}

/// Decode a raw entry back into `PageTableEntryInfo`.
pub fn decode_pte(encoded: u64) -> Result<PageTableEntryInfo, KernelError> {
    let leaf = (encoded & 0x80) != 0;
    let present = (encoded & 0x01) != 0;
    let writable = (encoded & 0x02) != 0;
    let user_mode = (encoded & 0x04) != 0;

    let mut pat_val = ((encoded & 0x18) >> 3) as u8;
    if leaf && (encoded & 0x1000) != 0 {
        pat_val |= 0x04;
    }
    let cache_type = pat_decode(pat_val)?;

    let target_addr = encoded & if leaf { ADDR_MASK_LEAF } else { ADDR_MASK_NONLEAF };

    Ok(PageTableEntryInfo { target_addr, present, writable, user_mode, leaf, cache_type })
}

/// Split a canonical virtual address into PML4/PDPT/PD indices, per
/// `original_source/mem/x64/mem-x64.cpp::mem_get_phys_addr`.
pub fn vaddr_indices(vaddr: u64) -> (usize, usize, usize, u64) {
    let offset = vaddr & 0x1F_FFFF;
    let aligned = vaddr - offset;
    let pd_idx = ((aligned >> 21) & 0x1FF) as usize;
    let pdpt_idx = ((aligned >> 30) & 0x1FF) as usize;
    let pml4_idx = ((aligned >> 39) & 0x1FF) as usize;
    (pml4_idx, pdpt_idx, pd_idx, offset)
}

/// The "engineer window": a single fixed virtual address used to view one
/// foreign 4 KiB page-table page at a time, by repointing its backing PTE
/// (`spec.md` §4.2, §9). Non-reentrant: only one page-table page can be
/// visible through it at once, mirroring
/// `original_source/mem/x64/mem-x64.cpp::mem_set_working_page_dir`'s single
/// `working_table_va_entry_addr` slot.
pub struct EngineerWindow {
    mapped_phys: Option<u64>,
}

impl EngineerWindow {
    pub const fn new() -> Self {
        EngineerWindow { mapped_phys: None }
    }

    /// Repoint the window at `table_phys` (a 4 KiB-aligned page-table page),
    /// via `set_pte`, which installs the raw encoded entry into the fixed
    /// backing PTE slot, and `invalidate`, which flushes that single TLB
    /// entry.
    ///
    /// # Safety
    /// Caller must ensure no other code is concurrently relying on the
    /// window pointing at a different table - this type provides no
    /// internal locking, matching the original's single global window.
    pub unsafe fn point_at(
        &mut self,
        table_phys: u64,
        mut set_pte: impl FnMut(u64),
        mut invalidate: impl FnMut(),
    ) -> Result<(), KernelError> {
        if table_phys % 4096 != 0 {
            return Err(KernelError::InvalidParam);
        }
        if self.mapped_phys == Some(table_phys) {
            return Ok(());
        }
        // The window's own backing entry is a true 4 KiB PT-level leaf, not
        // one of the 2 MiB PD-level leaves `encode_pte` models - a PT entry
        // has no PS bit and puts its PAT bit at position 7, not 12, so it
        // can't reuse that codec. Every table page is plain write-back, so
        // PCD/PWT/PAT are all left clear.
        let pte = (table_phys & 0x000F_FFFF_FFFF_F000) | 0x3;
        set_pte(pte);
        invalidate();
        self.mapped_phys = Some(table_phys);
        Ok(())
    }

    pub fn is_mapped(&self) -> bool {
        self.mapped_phys.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pat_table_matches_hardware_layout() {
        assert_eq!(pat_index(CacheType::WriteBack, false).unwrap(), 0);
        assert_eq!(pat_index(CacheType::WriteThrough, false).unwrap(), 1);
        assert_eq!(pat_index(CacheType::WriteCombining, false).unwrap(), 2);
        assert_eq!(pat_index(CacheType::Uncacheable, false).unwrap(), 3);
        assert_eq!(pat_index(CacheType::WriteProtected, false).unwrap(), 6);
    }

    #[test]
    fn write_protected_rejected_on_non_leaf() {
        assert!(pat_index(CacheType::WriteProtected, true).is_err());
    }

    #[test]
    fn encode_decode_round_trip_leaf() {
        let pte = PageTableEntryInfo {
            target_addr: 0x40_0000,
            present: true,
            writable: true,
            user_mode: false,
            leaf: true,
            cache_type: CacheType::WriteCombining,
        };
        let encoded = encode_pte(pte).unwrap();
        let decoded = decode_pte(encoded).unwrap();
        assert_eq!(decoded, pte);
    }

    #[test]
    fn encode_decode_round_trip_nonleaf() {
        let pte = PageTableEntryInfo {
            target_addr: 0x3000,
            present: true,
            writable: true,
            user_mode: true,
            leaf: false,
            cache_type: CacheType::WriteThrough,
        };
        let encoded = encode_pte(pte).unwrap();
        let decoded = decode_pte(encoded).unwrap();
        assert_eq!(decoded, pte);
    }

    #[test]
    fn leaf_entry_rejects_unaligned_target() {
        let pte = PageTableEntryInfo {
            target_addr: 0x40_1000,
            present: true,
            writable: true,
            user_mode: false,
            leaf: true,
            cache_type: CacheType::WriteBack,
        };
        assert!(encode_pte(pte).is_err());
    }

    #[test]
    fn vaddr_indices_split_correctly() {
        let (pml4, pdpt, pd, offset) = vaddr_indices(0xFFFF_FF00_0040_1234);
        assert_eq!(offset, 0x1234);
        assert!(pml4 < 512 && pdpt < 512 && pd < 512);
    }

    #[test]
    fn engineer_window_is_idempotent_for_same_table() {
        let mut window = EngineerWindow::new();
        let mut set_calls = 0;
        let mut inval_calls = 0;
        unsafe {
            window.point_at(0x10_0000, |_| set_calls += 1, || inval_calls += 1).unwrap();
            window.point_at(0x10_0000, |_| set_calls += 1, || inval_calls += 1).unwrap();
        }
        assert_eq!(set_calls, 1);
        assert_eq!(inval_calls, 1);
    }

    #[test]
    fn engineer_window_rejects_unaligned_table() {
        let mut window = EngineerWindow::new();
        let result = unsafe { window.point_at(0x10_0001, |_| {}, || {}) };
        assert!(result.is_err());
    }
}
