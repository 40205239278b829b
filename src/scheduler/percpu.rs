//! Per-CPU scheduler state (`spec.md` §3, §4.4).
//!
//! Grounded on `original_source/kernel/processor/task_manager.cpp`'s private
//! `current_threads`/`continue_this_thread`/`idle_threads` arrays, indexed
//! by `proc_mp_this_proc_id()` - rendered here as a fixed-size array of
//! per-CPU blocks instead of three parallel arrays, since Rust structs make
//! that grouping free.

use alloc::vec::Vec;
use core::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use lazy_static::lazy_static;
use spin::Mutex;

use super::task::ThreadId;
use crate::config::MAX_CPUS;

pub struct PerCpu {
    pub cpu_id: u32,
    pub lapic_id: AtomicU32,
    pub online: AtomicBool,
    pub current_thread: Mutex<Option<ThreadId>>,
    /// Mirrors `task_continue_this_thread`/`task_resume_scheduling`.
    pub continue_current: AtomicBool,
    pub idle_thread: Mutex<Option<ThreadId>>,
}

impl PerCpu {
    fn new(cpu_id: u32) -> Self {
        PerCpu {
            cpu_id,
            lapic_id: AtomicU32::new(0),
            online: AtomicBool::new(false),
            current_thread: Mutex::new(None),
            continue_current: AtomicBool::new(false),
            idle_thread: Mutex::new(None),
        }
    }
}

lazy_static! {
    /// One block per possible CPU, indexed by `proc_id`. CPUs not yet brought
    /// up simply have `online == false`.
    pub static ref PERCPU: Vec<PerCpu> = (0..MAX_CPUS as u32).map(PerCpu::new).collect();
}

static CURRENT_CPU_ID: core::sync::atomic::AtomicU32 = core::sync::atomic::AtomicU32::new(0);

/// The currently executing CPU's index. On real hardware this reads back
/// the LAPIC id programmed during bring-up; it defaults to the BSP (0)
/// until AP bring-up or a test calls `set_this_cpu_id`.
pub fn this_cpu_id() -> usize {
    CURRENT_CPU_ID.load(Ordering::Acquire) as usize
}

pub fn set_this_cpu_id(id: u32) {
    CURRENT_CPU_ID.store(id, Ordering::Release);
}
