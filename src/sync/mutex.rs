//! Kernel mutex (`spec.md` §3): FIFO waiters, reentrant-safe acquire.
//!
//! Grounded on
//! `original_source/kernel/klib/synch/kernel_mutexes.cpp::klib_synch_mutex_acquire`/
//! `_release`. A thread may call `acquire` while it already owns the mutex
//! and nothing happens (`AcquireResult::AlreadyOwned`); waiters are granted
//! the mutex in the order they called `acquire`.

use alloc::collections::VecDeque;
use alloc::sync::Arc;

use super::spinlock::SpinLock;
use crate::scheduler::{self, task::Thread, task::ThreadId};

/// Wait indefinitely, per `spec.md` §3 ("MAX_WAIT").
pub const MAX_WAIT: u64 = u64::MAX;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcquireResult {
    Acquired,
    AlreadyOwned,
    Timeout,
}

struct MutexState {
    locked: bool,
    owner: Option<ThreadId>,
    waiters: VecDeque<Arc<Thread>>,
}

pub struct Mutex {
    state: SpinLock<MutexState>,
}

impl Mutex {
    pub const fn new() -> Self {
        Mutex { state: SpinLock::new(MutexState { locked: false, owner: None, waiters: VecDeque::new() }) }
    }

    /// Acquire the mutex for `this_thread` running on `proc_id`. `max_wait`
    /// is in microseconds, or `MAX_WAIT` to block indefinitely, or `0` to
    /// never block.
    pub fn acquire(&self, this_thread: &Arc<Thread>, proc_id: usize, max_wait: u64) -> AcquireResult {
        let mut state = self.state.lock();

        if state.locked && state.owner == Some(this_thread.id) {
            return AcquireResult::AlreadyOwned;
        }
        if !state.locked {
            state.locked = true;
            state.owner = Some(this_thread.id);
            return AcquireResult::Acquired;
        }
        if max_wait == 0 {
            return AcquireResult::Timeout;
        }

        state.waiters.push_back(this_thread.clone());
        scheduler::continue_this_thread(proc_id);
        this_thread.stop_thread();
        drop(state);

        scheduler::resume_scheduling(proc_id);
        self.block_until_resumed(proc_id);

        let mut state = self.state.lock();
        if state.owner == Some(this_thread.id) {
            AcquireResult::Acquired
        } else {
            state.waiters.retain(|w| w.id != this_thread.id);
            AcquireResult::Timeout
        }
    }

    /// Release the mutex. `disregard_owner` skips the ownership check, as in
    /// the original (documented there as "may cause synchronisation issues").
    pub fn release(&self, this_thread: &Arc<Thread>, disregard_owner: bool) {
        let mut state = self.state.lock();
        assert!(state.locked, "release of unlocked mutex");
        assert!(disregard_owner || state.owner == Some(this_thread.id), "release by non-owner");

        match state.waiters.pop_front() {
            None => {
                state.locked = false;
                state.owner = None;
            }
            Some(next) => {
                state.owner = Some(next.id);
                next.start_thread();
            }
        }
    }

    #[cfg(not(test))]
    fn block_until_resumed(&self, proc_id: usize) {
        scheduler::yield_now(proc_id);
    }

    #[cfg(test)]
    fn block_until_resumed(&self, _proc_id: usize) {
        // No real scheduler runs in unit tests; callers that exercise the
        // blocking path drive ownership transfer manually via `release`.
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::context::Context;
    use crate::scheduler::task::ProcessId;

    fn thread(id: u64) -> Arc<Thread> {
        Arc::new(Thread::new(ThreadId(id), ProcessId(0), Context::empty(), alloc::vec![0u8; 8].into_boxed_slice(), false, false))
    }

    #[test]
    fn first_acquire_succeeds() {
        let m = Mutex::new();
        let t = thread(1);
        assert_eq!(m.acquire(&t, 0, MAX_WAIT), AcquireResult::Acquired);
    }

    #[test]
    fn reacquire_by_owner_is_already_owned() {
        let m = Mutex::new();
        let t = thread(1);
        m.acquire(&t, 0, MAX_WAIT);
        assert_eq!(m.acquire(&t, 0, MAX_WAIT), AcquireResult::AlreadyOwned);
    }

    #[test]
    fn zero_wait_times_out_when_locked() {
        let m = Mutex::new();
        let owner = thread(1);
        let other = thread(2);
        m.acquire(&owner, 0, MAX_WAIT);
        assert_eq!(m.acquire(&other, 0, 0), AcquireResult::Timeout);
    }

    #[test]
    fn release_hands_off_to_waiter() {
        let m = Mutex::new();
        let owner = thread(1);
        let waiter = thread(2);
        m.acquire(&owner, 0, MAX_WAIT);
        // Enqueue the waiter manually as acquire() would before blocking.
        m.state.lock().waiters.push_back(waiter.clone());
        waiter.stop_thread();

        m.release(&owner, false);

        let state = m.state.lock();
        assert_eq!(state.owner, Some(waiter.id));
        assert!(waiter.is_runnable());
    }

    #[test]
    #[should_panic]
    fn release_by_non_owner_panics() {
        let m = Mutex::new();
        let owner = thread(1);
        let intruder = thread(2);
        m.acquire(&owner, 0, MAX_WAIT);
        m.release(&intruder, false);
    }
}
