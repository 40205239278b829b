//! Boot-time memory map contract (`spec.md` §6).
//!
//! The physical allocator's public contract is the BIOS-style e820 record
//! array `spec.md` specifies, not whatever format a particular bootloader
//! happens to hand back. `from_bootloader_memory_map` bridges the gap so the
//! kernel can keep booting through the `bootloader` crate's existing entry
//! point while `memory::physical` never needs to know that crate exists.

use bootloader::bootinfo::{MemoryMap, MemoryRegionType};

/// One BIOS-style e820 memory map entry.
#[derive(Debug, Clone, Copy)]
#[repr(C)]
pub struct E820Entry {
    pub start: u64,
    pub length: u64,
    pub kind: u32,
    pub reserved: u32,
}

/// Region type `1` ("usable RAM") in the e820 table.
pub const E820_USABLE: u32 = 1;
/// Catch-all for anything not usable RAM.
pub const E820_RESERVED: u32 = 2;

const FRAME_SIZE: u64 = 4096;

/// Convert the `bootloader` crate's own memory map into e820-style records.
/// `out` must be at least as long as `map.iter().count()`; returns the
/// number of entries written.
pub fn from_bootloader_memory_map(map: &MemoryMap, out: &mut [E820Entry]) -> usize {
    let mut count = 0;
    for region in map.iter() {
        if count >= out.len() {
            break;
        }
        let kind = match region.region_type {
            MemoryRegionType::Usable => E820_USABLE,
            _ => E820_RESERVED,
        };
        let start = region.range.start_frame_number * FRAME_SIZE;
        let end = region.range.end_frame_number * FRAME_SIZE;
        out[count] = E820Entry { start, length: end - start, kind, reserved: 0 };
        count += 1;
    }
    count
}
