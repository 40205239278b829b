//! Kernel counting semaphore (`spec.md` §3).
//!
//! Grounded on
//! `original_source/kernel/klib/synch/kernel_semaphores.cpp::klib_synch_semaphore_wait`/
//! `_clear`. Unlike the mutex, a thread calling `wait` while it already holds
//! a slot is not special-cased - the original documents this as "not
//! permissible", so callers must track their own ownership.

use alloc::collections::VecDeque;
use alloc::sync::Arc;

use super::mutex::{AcquireResult, MAX_WAIT};
use super::spinlock::SpinLock;
use crate::scheduler::{self, task::Thread};

struct SemaphoreState {
    cur_users: u64,
    max_users: u64,
    waiters: VecDeque<Arc<Thread>>,
}

pub struct Semaphore {
    state: SpinLock<SemaphoreState>,
}

impl Semaphore {
    pub fn new(max_users: u64, start_users: u64) -> Self {
        assert!(max_users != 0);
        Semaphore {
            state: SpinLock::new(SemaphoreState { cur_users: start_users, max_users, waiters: VecDeque::new() }),
        }
    }

    /// `max_wait` must be `0` (don't block) or `MAX_WAIT` (block indefinitely)
    /// - the original notes timed waits other than these two are unsupported.
    pub fn wait(&self, this_thread: &Arc<Thread>, proc_id: usize, max_wait: u64) -> AcquireResult {
        assert!(max_wait == 0 || max_wait == MAX_WAIT);
        let mut state = self.state.lock();

        if state.cur_users < state.max_users {
            state.cur_users += 1;
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
        let was_waiting = state.waiters.iter().any(|w| w.id == this_thread.id);
        if was_waiting {
            state.waiters.retain(|w| w.id != this_thread.id);
            AcquireResult::Timeout
        } else {
            AcquireResult::Acquired
        }
    }

    pub fn clear(&self) {
        let mut state = self.state.lock();
        match state.waiters.pop_front() {
            None => {
                assert!(state.cur_users > 0);
                state.cur_users -= 1;
            }
            Some(next) => {
                next.start_thread();
            }
        }
    }

    #[cfg(not(test))]
    fn block_until_resumed(&self, proc_id: usize) {
        scheduler::yield_now(proc_id);
    }

    #[cfg(test)]
    fn block_until_resumed(&self, _proc_id: usize) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::context::Context;
    use crate::scheduler::task::{ProcessId, ThreadId};

    fn thread(id: u64) -> Arc<Thread> {
        Arc::new(Thread::new(ThreadId(id), ProcessId(0), Context::empty(), alloc::vec![0u8; 8].into_boxed_slice(), false, false))
    }

    #[test]
    fn acquires_up_to_max_users() {
        let s = Semaphore::new(2, 0);
        let t1 = thread(1);
        let t2 = thread(2);
        assert_eq!(s.wait(&t1, 0, MAX_WAIT), AcquireResult::Acquired);
        assert_eq!(s.wait(&t2, 0, MAX_WAIT), AcquireResult::Acquired);
    }

    #[test]
    fn zero_wait_times_out_when_full() {
        let s = Semaphore::new(1, 0);
        let t1 = thread(1);
        let t2 = thread(2);
        s.wait(&t1, 0, MAX_WAIT);
        assert_eq!(s.wait(&t2, 0, 0), AcquireResult::Timeout);
    }

    #[test]
    fn clear_wakes_next_waiter_without_changing_user_count() {
        let s = Semaphore::new(1, 1);
        let waiter = thread(2);
        s.state.lock().waiters.push_back(waiter.clone());
        waiter.stop_thread();

        s.clear();

        assert!(waiter.is_runnable());
        assert_eq!(s.state.lock().cur_users, 1);
    }
}
