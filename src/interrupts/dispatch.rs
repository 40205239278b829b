//! Two-phase interrupt dispatch (`spec.md` §4.6).
//!
//! Grounded on `original_source/kernel/processor/processor.cpp`'s
//! `proc_interrupt_data_table` (a fixed-size, per-vector list of
//! `IInterruptReceiver`s with `reserved`/`is_irq` flags and a per-vector
//! spinlock) and its `slow_path_reqd` flag on each registered handler. Fast
//! handlers run inline from the architectural stub and may not block or
//! take a lock that a fast handler elsewhere might also need; anything a
//! handler needs to do with locks is deferred by returning `true`, which
//! queues it for the slow-path worker thread.

use alloc::sync::Arc;
use alloc::vec::Vec;

use crate::config::{INTERRUPT_TABLE_SIZE, IRQ_VECTOR_BASE, IRQ_VECTOR_END, MAX_IRQ_BLOCK_SIZE};
use crate::error::{KResult, KernelError};
use crate::sync::{SpinLock, WaitObject};

/// Implemented by anything that wants to receive interrupts.
pub trait IInterruptReceiver: Send + Sync {
    /// Runs inline from the interrupt stub. Return `true` to request a
    /// slow-path follow-up call. Must not block or allocate.
    fn handle_interrupt_fast(&self, vector: u8) -> bool;

    /// Runs on the dedicated slow-path worker thread. May hold locks.
    fn handle_interrupt_slow(&self, vector: u8);
}

struct HandlerEntry {
    receiver: Arc<dyn IInterruptReceiver>,
    slow_path_requested: bool,
}

struct VectorSlot {
    reserved: bool,
    is_irq: bool,
    handlers: Vec<HandlerEntry>,
}

impl VectorSlot {
    const fn empty() -> Self {
        VectorSlot { reserved: false, is_irq: false, handlers: Vec::new() }
    }
}

/// Fixed-size table over the full architectural vector space, one entry per
/// vector, each independently spinlock-protected.
pub struct InterruptTable {
    slots: [SpinLock<VectorSlot>; INTERRUPT_TABLE_SIZE],
    /// Wakes the slow-path worker whenever a fast handler requests follow-up.
    slow_path_pending: WaitObject,
}

/// `VectorSlot` isn't `Copy`/`Clone`, so the array literal is built by hand;
/// this macro just repeats the initializer `N` times at compile time.
macro_rules! repeat_256 {
    ($e:expr) => {
        [
            $e, $e, $e, $e, $e, $e, $e, $e, $e, $e, $e, $e, $e, $e, $e, $e, $e, $e, $e, $e, $e, $e,
            $e, $e, $e, $e, $e, $e, $e, $e, $e, $e, $e, $e, $e, $e, $e, $e, $e, $e, $e, $e, $e, $e,
            $e, $e, $e, $e, $e, $e, $e, $e, $e, $e, $e, $e, $e, $e, $e, $e, $e, $e, $e, $e, $e, $e,
            $e, $e, $e, $e, $e, $e, $e, $e, $e, $e, $e, $e, $e, $e, $e, $e, $e, $e, $e, $e, $e, $e,
            $e, $e, $e, $e, $e, $e, $e, $e, $e, $e, $e, $e, $e, $e, $e, $e, $e, $e, $e, $e, $e, $e,
            $e, $e, $e, $e, $e, $e, $e, $e, $e, $e, $e, $e, $e, $e, $e, $e, $e, $e, $e, $e, $e, $e,
            $e, $e, $e, $e, $e, $e, $e, $e, $e, $e, $e, $e, $e, $e, $e, $e, $e, $e, $e, $e, $e, $e,
            $e, $e, $e, $e, $e, $e, $e, $e, $e, $e, $e, $e, $e, $e, $e, $e, $e, $e, $e, $e, $e, $e,
            $e, $e, $e, $e, $e, $e, $e, $e, $e, $e, $e, $e, $e, $e, $e, $e, $e, $e, $e, $e, $e, $e,
            $e, $e, $e, $e, $e, $e, $e, $e, $e, $e, $e, $e, $e, $e, $e, $e, $e, $e, $e, $e, $e, $e,
            $e, $e, $e, $e, $e, $e, $e, $e, $e, $e, $e, $e, $e, $e, $e, $e,
        ]
    };
}

impl InterruptTable {
    pub fn new() -> Self {
        let table = InterruptTable {
            slots: repeat_256!(SpinLock::new(VectorSlot::empty())),
            slow_path_pending: WaitObject::new(),
        };
        for v in IRQ_VECTOR_BASE..IRQ_VECTOR_END {
            let mut slot = table.slots[v].lock();
            slot.reserved = true;
            slot.is_irq = true;
        }
        table
    }

    pub fn register(&self, vector: u8, receiver: Arc<dyn IInterruptReceiver>) {
        let mut slot = self.slots[vector as usize].lock();
        slot.handlers.push(HandlerEntry { receiver, slow_path_requested: false });
    }

    pub fn unregister(&self, vector: u8, receiver: &Arc<dyn IInterruptReceiver>) {
        let mut slot = self.slots[vector as usize].lock();
        slot.handlers.retain(|h| !Arc::ptr_eq(&h.receiver, receiver));
    }

    /// Called from the architectural entry stub. Runs every registered fast
    /// handler on `vector` in registration order; any that asks for a
    /// slow-path follow-up is flagged and the worker thread is woken.
    pub fn dispatch(&self, vector: u8) {
        let mut slot = self.slots[vector as usize].lock();
        let mut any_slow = false;
        for handler in slot.handlers.iter_mut() {
            if handler.receiver.handle_interrupt_fast(vector) {
                handler.slow_path_requested = true;
                any_slow = true;
            }
        }
        drop(slot);
        if any_slow {
            self.slow_path_pending.trigger_next_thread();
        }
    }

    /// Runs once per iteration of the slow-path worker thread's loop: walks
    /// the whole table, clearing and servicing every flagged handler. Unlike
    /// `dispatch`, this may block and take locks.
    pub fn drain_slow_path_once(&self) {
        for (vector, slot_lock) in self.slots.iter().enumerate() {
            let mut pending = Vec::new();
            {
                let mut slot = slot_lock.lock();
                for handler in slot.handlers.iter_mut() {
                    if handler.slow_path_requested {
                        handler.slow_path_requested = false;
                        pending.push(handler.receiver.clone());
                    }
                }
            }
            for receiver in pending {
                receiver.handle_interrupt_slow(vector as u8);
            }
        }
    }

    pub fn slow_path_wait_object(&self) -> &WaitObject {
        &self.slow_path_pending
    }

    /// Rounds `n` up to the next power of two (capped at
    /// `MAX_IRQ_BLOCK_SIZE`) and returns the first vector of a contiguous,
    /// naturally aligned free run above the IRQ window.
    pub fn request_interrupt_block(&self, n: usize) -> KResult<u8> {
        if n == 0 || n > MAX_IRQ_BLOCK_SIZE {
            return Err(KernelError::InvalidParam);
        }
        let block = n.next_power_of_two();
        let mut start = IRQ_VECTOR_END;
        // Round up to the next multiple of `block` so the block is
        // naturally aligned.
        start = (start + block - 1) / block * block;

        while start + block <= INTERRUPT_TABLE_SIZE {
            let free = (start..start + block).all(|v| !self.slots[v].lock().reserved);
            if free {
                for v in start..start + block {
                    self.slots[v].lock().reserved = true;
                }
                return Ok(start as u8);
            }
            start += block;
        }
        Err(KernelError::OutOfResource)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::sync::atomic::{AtomicBool, AtomicU8, Ordering};

    struct Recorder {
        fast_called: AtomicBool,
        slow_called: AtomicBool,
        request_slow: bool,
        last_vector: AtomicU8,
        last_slow_vector: AtomicU8,
    }

    impl IInterruptReceiver for Recorder {
        fn handle_interrupt_fast(&self, vector: u8) -> bool {
            self.fast_called.store(true, Ordering::SeqCst);
            self.last_vector.store(vector, Ordering::SeqCst);
            self.request_slow
        }
        fn handle_interrupt_slow(&self, vector: u8) {
            self.slow_called.store(true, Ordering::SeqCst);
            self.last_slow_vector.store(vector, Ordering::SeqCst);
        }
    }

    #[test]
    fn irq_window_is_preallocated() {
        let t = InterruptTable::new();
        for v in IRQ_VECTOR_BASE..IRQ_VECTOR_END {
            assert!(t.slots[v].lock().reserved);
        }
    }

    #[test]
    fn dispatch_calls_fast_handler() {
        let t = InterruptTable::new();
        let r = Arc::new(Recorder {
            fast_called: AtomicBool::new(false),
            slow_called: AtomicBool::new(false),
            request_slow: false,
            last_vector: AtomicU8::new(0),
            last_slow_vector: AtomicU8::new(0),
        });
        t.register(200, r.clone());
        t.dispatch(200);
        assert!(r.fast_called.load(Ordering::SeqCst));
        assert_eq!(r.last_vector.load(Ordering::SeqCst), 200);
        assert!(!r.slow_called.load(Ordering::SeqCst));
    }

    #[test]
    fn slow_path_runs_only_when_requested() {
        let t = InterruptTable::new();
        let r = Arc::new(Recorder {
            fast_called: AtomicBool::new(false),
            slow_called: AtomicBool::new(false),
            request_slow: true,
            last_vector: AtomicU8::new(0),
            last_slow_vector: AtomicU8::new(0),
        });
        t.register(201, r.clone());
        t.dispatch(201);
        assert!(t.slots[201].lock().handlers[0].slow_path_requested);

        t.drain_slow_path_once();
        assert!(r.slow_called.load(Ordering::SeqCst));
        assert_eq!(r.last_slow_vector.load(Ordering::SeqCst), 201);
        assert!(!t.slots[201].lock().handlers[0].slow_path_requested);
    }

    #[test]
    fn request_interrupt_block_is_aligned_and_above_irq_window() {
        let t = InterruptTable::new();
        let start = t.request_interrupt_block(3).unwrap();
        assert!(start as usize >= IRQ_VECTOR_END);
        assert_eq!(start as usize % 4, 0);
    }

    #[test]
    fn request_interrupt_block_rejects_oversized() {
        let t = InterruptTable::new();
        assert_eq!(t.request_interrupt_block(33), Err(KernelError::InvalidParam));
    }

    #[test]
    fn request_interrupt_block_does_not_reuse_allocated_vectors() {
        let t = InterruptTable::new();
        let first = t.request_interrupt_block(8).unwrap();
        let second = t.request_interrupt_block(8).unwrap();
        assert_ne!(first, second);
    }

    #[test]
    fn unregister_removes_handler() {
        let t = InterruptTable::new();
        let r: Arc<dyn IInterruptReceiver> = Arc::new(Recorder {
            fast_called: AtomicBool::new(false),
            slow_called: AtomicBool::new(false),
            request_slow: false,
            last_vector: AtomicU8::new(0),
            last_slow_vector: AtomicU8::new(0),
        });
        t.register(210, r.clone());
        assert_eq!(t.slots[210].lock().handlers.len(), 1);
        t.unregister(210, &r);
        assert_eq!(t.slots[210].lock().handlers.len(), 0);
    }
}
