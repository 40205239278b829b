//! Process and thread objects (`spec.md` §3).

use alloc::boxed::Box;
use alloc::collections::VecDeque;
use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use spin::Mutex;

use super::context::Context;
use super::message::MessageQueue;
use crate::config::{HANDLE_TABLE_SIZE, TLS_SLOT_COUNT};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ProcessId(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ThreadId(pub u64);

/// An open handle slot in a process's handle table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Handle {
    Empty,
    Process(ProcessId),
    Thread(ThreadId),
}

/// A process: an address space, shared by one or more threads.
pub struct Process {
    pub pid: ProcessId,
    pub parent_pid: Option<ProcessId>,
    pub name: String,
    /// Physical address of this process's own PML4 (`spec.md` §4.2).
    pub pml4_phys: u64,
    pub threads: Mutex<Vec<Arc<Thread>>>,
    pub children: Mutex<Vec<ProcessId>>,
    pub handle_table: Mutex<[Handle; HANDLE_TABLE_SIZE]>,
    pub messages: MessageQueue,
    pub being_destroyed: AtomicBool,
}

impl Process {
    pub fn new(pid: ProcessId, parent_pid: Option<ProcessId>, name: &str, pml4_phys: u64) -> Self {
        Process {
            pid,
            parent_pid,
            name: String::from(name),
            pml4_phys,
            threads: Mutex::new(Vec::new()),
            children: Mutex::new(Vec::new()),
            handle_table: Mutex::new([Handle::Empty; HANDLE_TABLE_SIZE]),
            messages: MessageQueue::new(),
            being_destroyed: AtomicBool::new(false),
        }
    }
}

/// A single thread of execution, linked into the global scheduling cycle via
/// `next_thread` (`spec.md` §3, grounded on
/// `original_source/kernel/processor/task_manager.cpp`'s `task_thread`).
pub struct Thread {
    pub id: ThreadId,
    pub process: ProcessId,
    /// The next thread in the circular scheduling cycle.
    pub next_thread: Mutex<Option<ThreadId>>,
    /// Locked (1) while some CPU is running, or about to run, this thread.
    pub cycle_lock: AtomicBool,
    /// False means the scheduler must never select this thread.
    pub permit_running: AtomicBool,
    /// Never selected by the normal round-robin search; only run when no
    /// other thread is runnable on that CPU.
    pub is_idle_thread: bool,
    /// Worker threads may not call blocking waits that would let them be
    /// skipped during `WaitObject::wait_for_signal`-alike methods.
    pub is_worker_thread: bool,
    /// System timer tick at which this thread should be woken automatically,
    /// or `u64::MAX` for "no timed wake".
    pub wake_thread_after: AtomicU64,
    pub tls: Mutex<[u64; TLS_SLOT_COUNT]>,
    pub context: Mutex<Context>,
    pub kernel_stack: Mutex<Box<[u8]>>,
    pub being_destroyed: AtomicBool,
    pub on_dead_list: AtomicBool,
}

pub const NO_WAKE: u64 = u64::MAX;

impl Thread {
    pub fn new(
        id: ThreadId,
        process: ProcessId,
        context: Context,
        kernel_stack: Box<[u8]>,
        is_idle_thread: bool,
        is_worker_thread: bool,
    ) -> Self {
        Thread {
            id,
            process,
            next_thread: Mutex::new(None),
            cycle_lock: AtomicBool::new(false),
            permit_running: AtomicBool::new(true),
            is_idle_thread,
            is_worker_thread,
            wake_thread_after: AtomicU64::new(NO_WAKE),
            tls: Mutex::new([0; TLS_SLOT_COUNT]),
            context: Mutex::new(context),
            kernel_stack: Mutex::new(kernel_stack),
            being_destroyed: AtomicBool::new(false),
            on_dead_list: AtomicBool::new(false),
        }
    }

    /// Attempt to acquire this thread's cycle lock without blocking.
    pub fn try_lock_cycle(&self) -> bool {
        self.cycle_lock
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
    }

    pub fn unlock_cycle(&self) {
        self.cycle_lock.store(false, Ordering::Release);
    }

    /// Stop this thread from being scheduled (`spec.md` §3: "stop_thread").
    pub fn stop_thread(&self) {
        self.permit_running.store(false, Ordering::Release);
    }

    /// Permit this thread to be scheduled again (`spec.md` §3: "start_thread").
    pub fn start_thread(&self) {
        self.permit_running.store(true, Ordering::Release);
    }

    pub fn is_runnable(&self) -> bool {
        self.permit_running.load(Ordering::Acquire)
    }
}

/// The dead-object lists the tidy-up worker thread drains (`spec.md` §4.4).
pub struct DeadLists {
    pub dead_threads: Mutex<VecDeque<Arc<Thread>>>,
    pub dead_processes: Mutex<VecDeque<Arc<Process>>>,
}

impl DeadLists {
    pub const fn new() -> Self {
        DeadLists {
            dead_threads: Mutex::new(VecDeque::new()),
            dead_processes: Mutex::new(VecDeque::new()),
        }
    }
}
