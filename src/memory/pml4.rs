//! PML4 registry and kernel-half synchronization (`spec.md` §4.2, §9).
//!
//! Address bit 63 splits the address space: entries 0..256 are per-process
//! user space, entries 256..512 are the shared kernel half. Whenever a
//! kernel-half mapping changes in one process's PML4, every other live
//! PML4's upper half must be updated to match, under a single global lock -
//! grounded on `original_source/mem/x64/mem_pml4-x64.cpp::mem_x64_pml4_synchronize`,
//! which takes exactly this "edit one, memcpy into the rest" approach (the
//! alternative noted in `spec.md` §9 - sharing a second-level kernel PML4 by
//! physical address - is recorded as a viable future redesign in
//! DESIGN.md, not implemented here, to stay grounded in what the original
//! does).

use alloc::collections::BTreeMap;
use spin::Mutex;
use x86_64::structures::paging::PageTable;
use x86_64::PhysAddr;

/// Number of entries in a PML4 (and PDPT/PD/PT) page.
pub const PML4_ENTRY_COUNT: usize = 512;
/// Entries `0..KERNEL_HALF_START` are user space; the rest is kernel space.
pub const KERNEL_HALF_START: usize = 256;

/// True if `addr`'s top 16 bits are either all-zero or all-one, i.e. it is
/// a canonical x86-64 address (`spec.md` §4.2).
pub fn is_canonical_vaddr(addr: u64) -> bool {
    let top16 = addr >> 48;
    top16 == 0 || top16 == 0xFFFF
}

/// Tracks every live PML4's physical address so the kernel half can be kept
/// in sync across all of them.
pub struct Pml4Registry {
    /// Physical address of each live PML4, keyed by an opaque process
    /// handle (here: the PML4's own physical address is also its key,
    /// since that's unique per process).
    known: BTreeMap<u64, ()>,
    /// Scratch buffer for the entries being propagated, mirroring the
    /// original's `pml4_copy_buffer`.
    scratch: [u64; PML4_ENTRY_COUNT - KERNEL_HALF_START],
}

impl Pml4Registry {
    pub const fn empty() -> Self {
        Pml4Registry {
            known: BTreeMap::new(),
            scratch: [0; PML4_ENTRY_COUNT - KERNEL_HALF_START],
        }
    }

    pub fn register(&mut self, pml4_phys: PhysAddr) {
        self.known.insert(pml4_phys.as_u64(), ());
    }

    pub fn unregister(&mut self, pml4_phys: PhysAddr) {
        self.known.remove(&pml4_phys.as_u64());
    }

    pub fn known_count(&self) -> usize {
        self.known.len()
    }

    /// Copy the kernel half of `updated` into every other known PML4.
    /// `updated` must already be correct; `read_table`/`write_table` are the
    /// caller's way of getting a `&PageTable`/`&mut PageTable` for a given
    /// physical address (through the engineer window, since most of these
    /// tables are not the currently active one).
    ///
    /// # Safety
    /// The caller must already hold the global PML4-edit lock and must not
    /// allow any other kernel-half edit to race with this call.
    pub unsafe fn synchronize(
        &mut self,
        updated: PhysAddr,
        mut read_table: impl FnMut(PhysAddr) -> [u64; PML4_ENTRY_COUNT - KERNEL_HALF_START],
        mut write_table: impl FnMut(PhysAddr, &[u64; PML4_ENTRY_COUNT - KERNEL_HALF_START]),
    ) {
        self.scratch = read_table(updated);
        for (&phys, _) in self.known.iter() {
            if phys == updated.as_u64() {
                continue;
            }
            write_table(PhysAddr::new(phys), &self.scratch);
        }
    }
}

/// Global PML4 edit lock and registry, serializing all kernel-half edits
/// across every process (`spec.md` §4.2: "a single global 'PML4 edit' lock").
pub static PML4_REGISTRY: Mutex<Pml4Registry> = Mutex::new(Pml4Registry::empty());

/// Index of the PML4 entry that a virtual address falls under.
#[inline]
pub const fn pml4_index(vaddr: u64) -> usize {
    ((vaddr >> 39) & 0x1FF) as usize
}

/// Is `index` within the kernel half of the PML4?
#[inline]
pub const fn is_kernel_half(index: usize) -> bool {
    index >= KERNEL_HALF_START
}

/// Zero an entire PML4 page. Used right after allocating a fresh one.
pub fn zero_table(table: &mut PageTable) {
    for entry in table.iter_mut() {
        entry.set_unused();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn canonical_addresses() {
        assert!(is_canonical_vaddr(0x0000_0000_0040_0000));
        assert!(is_canonical_vaddr(0xFFFF_FF00_0000_0000));
        assert!(!is_canonical_vaddr(0x0001_0000_0000_0000));
    }

    #[test]
    fn kernel_half_split() {
        assert!(!is_kernel_half(pml4_index(0x0000_0000_0040_0000)));
        assert!(is_kernel_half(pml4_index(0xFFFF_FF00_0000_0000)));
    }

    #[test]
    fn registry_tracks_live_pml4s() {
        let mut reg = Pml4Registry::empty();
        reg.register(PhysAddr::new(0x1000));
        reg.register(PhysAddr::new(0x2000));
        assert_eq!(reg.known_count(), 2);
        reg.unregister(PhysAddr::new(0x1000));
        assert_eq!(reg.known_count(), 1);
    }
}
