//! Centralized tunables shared across subsystems.
//!
//! The original kernel scattered these as file-local `const`s; gathering them
//! here means the memory manager, scheduler and interrupt code can't drift
//! out of agreement about frame size, CPU count, or tick period.

/// Size of a physical frame / page-table leaf mapping, per `spec.md` §3.
pub const FRAME_SIZE: u64 = 2 * 1024 * 1024;

/// Size of one 4 KiB page-table page (PML4/PDPT/PD/PT node).
pub const PAGE_TABLE_PAGE_SIZE: u64 = 4096;

/// Maximum number of physical frames the bitmap allocator can track.
/// 1M frames * 2 MiB = 2 TiB of physical memory, comfortably above any
/// machine this kernel is likely to run on.
pub const MAX_FRAMES: usize = 1024 * 1024;

/// Maximum number of CPUs supported by the scheduler and IPI subsystem.
pub const MAX_CPUS: usize = 64;

/// Scheduler tick period, per `spec.md` §4.4 ("fixed at ~1 ms").
pub const TICK_PERIOD_NS: u64 = 1_000_000;

/// Size of each kernel task's stack.
pub const KERNEL_STACK_SIZE: usize = 4096 * 4;

/// Number of thread-local storage slots per thread (`spec.md` §3, `Thread`).
pub const TLS_SLOT_COUNT: usize = 16;

/// Number of bootstrap virtual-range records available before the heap
/// exists (`spec.md` §4.3).
pub const VRANGE_BOOTSTRAP_POOL_SIZE: usize = 64;

/// Size of a process's file/handle table.
pub const HANDLE_TABLE_SIZE: usize = 64;

/// Fixed virtual address of the "engineer window" used to edit foreign page
/// tables (`spec.md` §4.2, §9).
pub const ENGINEER_WINDOW_VADDR: u64 = 0xFFFF_FF00_0000_0000;

/// Maximum IRQ block size returned by `request_interrupt_block` (`spec.md` §4.6).
pub const MAX_IRQ_BLOCK_SIZE: usize = 32;

/// First vector reserved for legacy IRQs (PIC remap offset).
pub const IRQ_VECTOR_BASE: usize = 32;

/// One past the last vector reserved for legacy IRQs.
pub const IRQ_VECTOR_END: usize = 48;

/// Total size of the interrupt vector table.
pub const INTERRUPT_TABLE_SIZE: usize = 256;

/// How long to wait between the INIT IPI and the STARTUP IPI during AP
/// bring-up, in nanoseconds (`spec.md` §4.7).
pub const AP_INIT_STARTUP_DELAY_NS: u64 = 10_000_000;

/// Maximum time to wait for an AP to come up, in nanoseconds.
pub const AP_BRINGUP_TIMEOUT_NS: u64 = 1_000_000_000;
