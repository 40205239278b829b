//! Physical frame bitmap allocator (`spec.md` §4.1).
//!
//! A bit set means the corresponding 2 MiB frame is free. Allocation is a
//! linear scan for the first free bit; only single-frame allocation is
//! supported, matching the original kernel's `mem_allocate_physical_pages`
//! (`original_source/mem/physical.cpp`), which never grew beyond one frame
//! at a time either.

use crate::boot::{E820Entry, E820_USABLE};
use crate::config::{FRAME_SIZE, MAX_FRAMES};
use crate::error::KernelError;

const BITS_PER_WORD: usize = 64;
const WORD_COUNT: usize = MAX_FRAMES / BITS_PER_WORD;

/// Bitmap of 2 MiB physical frames. Bit `i` set means frame `i` is free.
pub struct FrameBitmap {
    words: [u64; WORD_COUNT],
    free_frames: usize,
    frame_limit: usize,
}

impl FrameBitmap {
    /// An empty bitmap with every frame marked allocated. Call `init` before
    /// using it for real allocation.
    pub const fn empty() -> Self {
        FrameBitmap {
            words: [0; WORD_COUNT],
            free_frames: 0,
            frame_limit: 0,
        }
    }

    /// Populate the bitmap from an e820-style memory map. Frames wholly
    /// contained within a `E820_USABLE` region become free; everything else
    /// (including the zero frame, unconditionally) stays allocated.
    pub fn init(&mut self, entries: &[E820Entry]) {
        *self = Self::empty();
        self.frame_limit = MAX_FRAMES;

        for entry in entries {
            if entry.kind != E820_USABLE {
                continue;
            }
            let first_frame = ceil_div(entry.start, FRAME_SIZE);
            let region_end = entry.start.saturating_add(entry.length);
            let last_frame = region_end / FRAME_SIZE; // frames wholly contained
            let mut frame = first_frame;
            while frame < last_frame && (frame as usize) < MAX_FRAMES {
                self.mark_free(frame * FRAME_SIZE);
                frame += 1;
            }
        }

        // The zero frame is always treated as allocated, even if a usable
        // region happened to claim it.
        self.mark_allocated(0);
    }

    /// Allocate a single frame. Only `count == 1` is supported.
    pub fn allocate(&mut self, count: usize) -> Result<u64, KernelError> {
        if count != 1 {
            return Err(KernelError::InvalidParam);
        }

        for word_idx in 0..WORD_COUNT {
            let word = self.words[word_idx];
            if word == 0 {
                continue;
            }
            let bit = word.trailing_zeros() as usize;
            let frame = word_idx * BITS_PER_WORD + bit;
            self.words[word_idx] &= !(1u64 << bit);
            self.free_frames -= 1;
            return Ok(frame as u64 * FRAME_SIZE);
        }

        Err(KernelError::OutOfResource)
    }

    /// Free a single previously-allocated, 2 MiB-aligned frame.
    pub fn free(&mut self, physical_addr: u64, count: usize) -> Result<(), KernelError> {
        if count != 1 || physical_addr % FRAME_SIZE != 0 {
            return Err(KernelError::InvalidParam);
        }
        if self.is_free(physical_addr) {
            return Err(KernelError::InvalidOp);
        }
        self.mark_free(physical_addr);
        Ok(())
    }

    pub fn is_free(&self, physical_addr: u64) -> bool {
        let (word, bit) = self.locate(physical_addr);
        (self.words[word] & (1u64 << bit)) != 0
    }

    pub fn mark_allocated(&mut self, physical_addr: u64) {
        let (word, bit) = self.locate(physical_addr);
        if self.words[word] & (1u64 << bit) != 0 {
            self.free_frames -= 1;
        }
        self.words[word] &= !(1u64 << bit);
    }

    pub fn mark_free(&mut self, physical_addr: u64) {
        let (word, bit) = self.locate(physical_addr);
        if self.words[word] & (1u64 << bit) == 0 {
            self.free_frames += 1;
        }
        self.words[word] |= 1u64 << bit;
    }

    pub fn free_frame_count(&self) -> usize {
        self.free_frames
    }

    fn locate(&self, physical_addr: u64) -> (usize, usize) {
        let frame = (physical_addr / FRAME_SIZE) as usize;
        assert!(frame < self.frame_limit.max(MAX_FRAMES), "frame index out of range");
        (frame / BITS_PER_WORD, frame % BITS_PER_WORD)
    }
}

fn ceil_div(a: u64, b: u64) -> u64 {
    (a + b - 1) / b
}

#[cfg(test)]
mod tests {
    use super::*;

    fn single_region(len: u64) -> [E820Entry; 1] {
        [E820Entry { start: 0, length: len, kind: E820_USABLE, reserved: 0 }]
    }

    #[test]
    fn zero_frame_always_allocated() {
        let mut bmp = FrameBitmap::empty();
        bmp.init(&single_region(FRAME_SIZE * 8));
        assert!(!bmp.is_free(0));
    }

    #[test]
    fn allocate_then_free_then_allocate_same_address() {
        let mut bmp = FrameBitmap::empty();
        bmp.init(&single_region(FRAME_SIZE * 8));
        let a = bmp.allocate(1).unwrap();
        bmp.free(a, 1).unwrap();
        let b = bmp.allocate(1).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn allocate_scans_in_order_skipping_zero_frame() {
        let mut bmp = FrameBitmap::empty();
        bmp.init(&single_region(FRAME_SIZE * 8));
        let a = bmp.allocate(1).unwrap();
        assert_eq!(a, FRAME_SIZE);
    }

    #[test]
    fn out_of_memory_when_exhausted() {
        let mut bmp = FrameBitmap::empty();
        bmp.init(&single_region(FRAME_SIZE * 2));
        let _ = bmp.allocate(1).unwrap();
        assert_eq!(bmp.allocate(1), Err(KernelError::OutOfResource));
    }

    #[test]
    fn free_unallocated_frame_rejected() {
        let mut bmp = FrameBitmap::empty();
        bmp.init(&single_region(FRAME_SIZE * 4));
        assert_eq!(bmp.free(FRAME_SIZE, 1), Err(KernelError::InvalidOp));
    }

    #[test]
    fn free_unaligned_address_rejected() {
        let mut bmp = FrameBitmap::empty();
        bmp.init(&single_region(FRAME_SIZE * 4));
        assert_eq!(bmp.free(FRAME_SIZE + 1, 1), Err(KernelError::InvalidParam));
    }

    #[test]
    fn reserved_regions_stay_allocated() {
        let entries = [E820Entry { start: 0, length: FRAME_SIZE * 4, kind: 2, reserved: 0 }];
        let mut bmp = FrameBitmap::empty();
        bmp.init(&entries);
        assert_eq!(bmp.free_frame_count(), 0);
    }
}
