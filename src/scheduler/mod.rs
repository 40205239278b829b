//! Preemptive multi-CPU scheduler (`spec.md` §3, §4.4).
//!
//! Threads move around a circular list (`cycle`, here a `BTreeMap<ThreadId,
//! Arc<Thread>>` registry plus `next_thread` links rather than raw pointers)
//! and CPUs pick the next runnable, unlocked thread as they go round it.
//! Grounded throughout on
//! `original_source/kernel/processor/task_manager.cpp::task_get_next_thread`
//! and `task_thread_cycle_add`/`task_thread_cycle_remove`.

pub mod context;
pub mod message;
pub mod percpu;
pub mod task;

use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use core::sync::atomic::Ordering;
use spin::Mutex;

use context::Context;
use percpu::PERCPU;
use task::{DeadLists, Process, ProcessId, Thread, ThreadId};

use crate::config::KERNEL_STACK_SIZE;

/// Registry of live processes, keyed by pid. Threads hold a bare `ProcessId`
/// rather than an `Arc<Process>` so the cycle itself never needs this lock.
static PROCESSES: Mutex<BTreeMap<ProcessId, Arc<Process>>> = Mutex::new(BTreeMap::new());

static NEXT_PROCESS_ID: core::sync::atomic::AtomicU64 = core::sync::atomic::AtomicU64::new(1);

/// Create PID 0 (the kernel process, owning `pid0_pml4_phys`) and an idle
/// thread for the boot CPU, then seed the scheduling cycle with it - the
/// first thing `get_next_thread` ever falls back to.
pub fn init(pid0_pml4_phys: u64) {
    let pid0 = Arc::new(Process::new(ProcessId(0), None, "kernel", pid0_pml4_phys));
    PROCESSES.lock().insert(pid0.pid, pid0.clone());

    let idle_id = alloc_thread_id();
    let idle_stack = alloc::vec![0u8; KERNEL_STACK_SIZE].into_boxed_slice();
    let idle = Arc::new(Thread::new(idle_id, pid0.pid, Context::empty(), idle_stack, true, false));
    pid0.threads.lock().push(idle.clone());

    cycle_add(idle.clone());
    *PERCPU[0].idle_thread.lock() = Some(idle_id);
    *PERCPU[0].current_thread.lock() = Some(idle_id);
}

pub fn alloc_process_id() -> ProcessId {
    ProcessId(NEXT_PROCESS_ID.fetch_add(1, Ordering::Relaxed))
}

pub fn process_by_id(id: ProcessId) -> Option<Arc<Process>> {
    PROCESSES.lock().get(&id).cloned()
}

pub fn register_process(process: Arc<Process>) {
    PROCESSES.lock().insert(process.pid, process);
}

/// All live threads, keyed by id. Owns the only strong reference; the cycle
/// links and per-CPU `current_thread` slots refer to threads by id.
static THREADS: Mutex<BTreeMap<ThreadId, Arc<Thread>>> = Mutex::new(BTreeMap::new());

/// An arbitrary thread within the cycle - doesn't matter which, CPUs just
/// walk around it (`original_source`'s `start_of_thread_cycle`).
static START_OF_CYCLE: Mutex<Option<ThreadId>> = Mutex::new(None);

/// Protects edits to the cycle's links (not needed by the scheduler's own
/// read-only traversal, only by `cycle_add`/`cycle_remove`).
static CYCLE_EDIT_LOCK: Mutex<()> = Mutex::new(());

static DEAD_LISTS: DeadLists = DeadLists::new();

static NEXT_THREAD_ID: core::sync::atomic::AtomicU64 = core::sync::atomic::AtomicU64::new(1);

pub fn alloc_thread_id() -> ThreadId {
    ThreadId(NEXT_THREAD_ID.fetch_add(1, Ordering::Relaxed))
}

/// Register a newly created thread and splice it into the cycle
/// (`task_thread_cycle_add`).
pub fn cycle_add(thread: Arc<Thread>) {
    let id = thread.id;
    let _guard = CYCLE_EDIT_LOCK.lock();
    let mut start = START_OF_CYCLE.lock();

    match *start {
        None => {
            *thread.next_thread.lock() = Some(id);
            *start = Some(id);
        }
        Some(start_id) => {
            let threads = THREADS.lock();
            let start_thread = threads.get(&start_id).expect("start-of-cycle thread missing");
            let mut start_next = start_thread.next_thread.lock();
            *thread.next_thread.lock() = *start_next;
            *start_next = Some(id);
        }
    }

    THREADS.lock().insert(id, thread);
}

/// Unsplice `id` from the cycle (`task_thread_cycle_remove`). The caller is
/// responsible for removing the thread's entry from `THREADS` once no CPU
/// can still be referencing it.
pub fn cycle_remove(id: ThreadId) {
    let _guard = CYCLE_EDIT_LOCK.lock();
    let mut start = START_OF_CYCLE.lock();
    let threads = THREADS.lock();

    let Some(target) = threads.get(&id) else { return };
    let target_next = *target.next_thread.lock();

    if target_next == Some(id) {
        // Last thread in the cycle.
        *start = None;
        return;
    }

    if *start == Some(id) {
        *start = target_next;
    }

    // Walk the cycle looking for the thread whose `next_thread` points at
    // `id`, then splice it out.
    let mut search_id = start.expect("non-empty cycle must have a start");
    loop {
        let search_thread = threads.get(&search_id).expect("cycle member missing from registry");
        let mut search_next = search_thread.next_thread.lock();
        if *search_next == Some(id) {
            *search_next = target_next;
            break;
        }
        search_id = search_next.expect("cycle must be circular");
    }
}

/// Core scheduling decision (`task_get_next_thread`). `abandon_this_thread`
/// mirrors a thread requesting its own destruction: the CPU forgets it was
/// ever running anything and must pick afresh.
pub fn get_next_thread(proc_id: usize, abandon_this_thread: bool) -> ThreadId {
    let cpu = &PERCPU[proc_id];
    let threads = THREADS.lock();

    if abandon_this_thread {
        *cpu.current_thread.lock() = None;
        cpu.continue_current.store(false, Ordering::Release);
    }

    if cpu.continue_current.load(Ordering::Acquire) {
        return cpu.current_thread.lock().expect("continue requested with no current thread");
    }

    let current = *cpu.current_thread.lock();
    let idle = *cpu.idle_thread.lock();

    let start_candidate = match current {
        Some(cur) if Some(cur) == idle => START_OF_CYCLE.lock().or(idle),
        None => START_OF_CYCLE.lock().or(idle),
        Some(cur) => threads.get(&cur).and_then(|t| *t.next_thread.lock()).or(idle),
    };

    let mut found = None;
    if let Some(start) = start_candidate {
        let mut next = start;
        loop {
            if let Some(t) = threads.get(&next) {
                if t.is_runnable() && t.try_lock_cycle() {
                    if t.is_runnable() {
                        found = Some(next);
                        break;
                    }
                    t.unlock_cycle();
                }
            }
            let advance = threads.get(&next).and_then(|t| *t.next_thread.lock());
            match advance {
                Some(n) if n != start => next = n,
                _ => break,
            }
        }
    }

    let chosen = match found {
        Some(id) => {
            if let Some(cur_id) = current {
                if id != cur_id {
                    if let Some(cur_thread) = threads.get(&cur_id) {
                        cur_thread.unlock_cycle();
                    }
                }
            }
            id
        }
        None => {
            if let Some(cur_id) = current {
                if threads.get(&cur_id).map(|t| t.is_runnable()).unwrap_or(false) {
                    cur_id
                } else {
                    if let Some(cur_thread) = threads.get(&cur_id) {
                        cur_thread.unlock_cycle();
                    }
                    idle.expect("every CPU must have an idle thread")
                }
            } else {
                idle.expect("every CPU must have an idle thread")
            }
        }
    };

    *cpu.current_thread.lock() = Some(chosen);
    chosen
}

/// Force this CPU to keep re-selecting its current thread
/// (`task_continue_this_thread`): used by the sync primitives so they can't
/// be preempted mid-update of their own wait list.
pub fn continue_this_thread(proc_id: usize) {
    PERCPU[proc_id].continue_current.store(true, Ordering::Release);
}

/// Undo `continue_this_thread` (`task_resume_scheduling`).
pub fn resume_scheduling(proc_id: usize) {
    PERCPU[proc_id].continue_current.store(false, Ordering::Release);
}

pub fn current_thread_id(proc_id: usize) -> Option<ThreadId> {
    *PERCPU[proc_id].current_thread.lock()
}

pub fn thread_by_id(id: ThreadId) -> Option<Arc<Thread>> {
    THREADS.lock().get(&id).cloned()
}

pub fn move_to_dead_threads(thread: Arc<Thread>) {
    thread.on_dead_list.store(true, Ordering::Release);
    DEAD_LISTS.dead_threads.lock().push_back(thread);
}

pub fn move_to_dead_processes(process: Arc<task::Process>) {
    DEAD_LISTS.dead_processes.lock().push_back(process);
}

/// The tidy-up worker thread's body: drains the dead-object lists and
/// permanently removes those threads/processes.
pub fn tidy_up_drain_once() -> usize {
    let mut drained = 0;
    while let Some(thread) = DEAD_LISTS.dead_threads.lock().pop_front() {
        cycle_remove(thread.id);
        THREADS.lock().remove(&thread.id);
        drained += 1;
    }
    while DEAD_LISTS.dead_processes.lock().pop_front().is_some() {
        drained += 1;
    }
    drained
}

/// Switch execution away from the current thread on this CPU and into
/// whatever `get_next_thread` selects next. Architecture-specific context
/// switching lives in `context::switch_context`.
#[cfg(not(test))]
pub fn yield_now(proc_id: usize) {
    let from_id = current_thread_id(proc_id);
    let to_id = get_next_thread(proc_id, false);
    if Some(to_id) == from_id {
        return;
    }
    let (Some(from), Some(to)) = (from_id.and_then(thread_by_id), thread_by_id(to_id)) else { return };
    unsafe {
        let mut from_ctx = from.context.lock();
        let to_ctx = to.context.lock();
        context::switch_context(&mut *from_ctx as *mut Context, &*to_ctx as *const Context);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use task::Process;

    fn make_thread(id: u64, proc: task::ProcessId) -> Arc<Thread> {
        Arc::new(Thread::new(
            ThreadId(id),
            proc,
            Context::empty(),
            alloc::vec![0u8; 16].into_boxed_slice(),
            false,
            false,
        ))
    }

    fn reset() {
        *THREADS.lock() = BTreeMap::new();
        *START_OF_CYCLE.lock() = None;
        DEAD_LISTS.dead_threads.lock().clear();
    }

    #[test]
    fn cycle_add_single_thread_points_to_itself() {
        reset();
        let t = make_thread(1, task::ProcessId(0));
        cycle_add(t.clone());
        assert_eq!(*t.next_thread.lock(), Some(ThreadId(1)));
    }

    #[test]
    fn cycle_add_multiple_forms_a_ring() {
        reset();
        let t1 = make_thread(1, task::ProcessId(0));
        let t2 = make_thread(2, task::ProcessId(0));
        let t3 = make_thread(3, task::ProcessId(0));
        cycle_add(t1.clone());
        cycle_add(t2.clone());
        cycle_add(t3.clone());

        let mut cur = ThreadId(1);
        for _ in 0..3 {
            let threads = THREADS.lock();
            cur = threads.get(&cur).unwrap().next_thread.lock().unwrap();
        }
        assert_eq!(cur, ThreadId(1));
    }

    #[test]
    fn cycle_remove_splices_out_middle_thread() {
        reset();
        let t1 = make_thread(1, task::ProcessId(0));
        let t2 = make_thread(2, task::ProcessId(0));
        let t3 = make_thread(3, task::ProcessId(0));
        cycle_add(t1.clone());
        cycle_add(t2.clone());
        cycle_add(t3.clone());

        cycle_remove(ThreadId(2));

        let threads = THREADS.lock();
        let mut cur = ThreadId(1);
        let mut seen = alloc::vec::Vec::new();
        loop {
            seen.push(cur);
            cur = threads.get(&cur).unwrap().next_thread.lock().unwrap();
            if cur == ThreadId(1) {
                break;
            }
        }
        assert!(!seen.contains(&ThreadId(2)));
        assert_eq!(seen.len(), 2);
    }

    #[test]
    fn single_thread_cycle_is_selected_repeatedly() {
        reset();
        PERCPU[0].current_thread.lock().take();
        PERCPU[0].continue_current.store(false, Ordering::Relaxed);
        let idle = make_thread(99, task::ProcessId(0));
        *idle.next_thread.lock() = Some(ThreadId(99));
        THREADS.lock().insert(ThreadId(99), idle.clone());
        *PERCPU[0].idle_thread.lock() = Some(ThreadId(99));

        let t1 = make_thread(1, task::ProcessId(0));
        cycle_add(t1.clone());

        let picked = get_next_thread(0, false);
        assert_eq!(picked, ThreadId(1));
    }

    #[test]
    fn falls_back_to_idle_thread_when_nothing_runnable() {
        reset();
        PERCPU[0].current_thread.lock().take();
        PERCPU[0].continue_current.store(false, Ordering::Relaxed);
        let idle = make_thread(100, task::ProcessId(0));
        *idle.next_thread.lock() = Some(ThreadId(100));
        THREADS.lock().insert(ThreadId(100), idle.clone());
        *PERCPU[0].idle_thread.lock() = Some(ThreadId(100));

        let t1 = make_thread(2, task::ProcessId(0));
        t1.stop_thread();
        cycle_add(t1.clone());

        let picked = get_next_thread(0, false);
        assert_eq!(picked, ThreadId(100));
    }

    #[test]
    fn continue_this_thread_keeps_same_selection() {
        reset();
        let idle = make_thread(200, task::ProcessId(0));
        *idle.next_thread.lock() = Some(ThreadId(200));
        THREADS.lock().insert(ThreadId(200), idle.clone());
        *PERCPU[0].idle_thread.lock() = Some(ThreadId(200));
        *PERCPU[0].current_thread.lock() = Some(ThreadId(200));

        continue_this_thread(0);
        assert_eq!(get_next_thread(0, false), ThreadId(200));
        resume_scheduling(0);
    }

    #[test]
    fn dead_lists_drain_removes_thread_from_cycle() {
        reset();
        let t1 = make_thread(5, task::ProcessId(0));
        cycle_add(t1.clone());
        move_to_dead_threads(t1.clone());
        assert!(t1.on_dead_list.load(Ordering::Acquire));
        let drained = tidy_up_drain_once();
        assert_eq!(drained, 1);
        assert!(!THREADS.lock().contains_key(&ThreadId(5)));
    }

    #[allow(dead_code)]
    fn uses_process_type(_p: &Process) {}
}
