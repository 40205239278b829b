//! Inter-process message queue (`spec.md` §4.4 ambient messaging note).
//!
//! Not present in the original kernel's task manager, which instead relied
//! on the object manager for cross-process signalling; added so processes
//! have a direct, ordered channel to pass small payloads without going
//! through a named system-tree object, matching the "lightweight IPC queue"
//! pattern used by several other kernels in the reference pack (e.g.
//! `other_examples/fbacd87b_ulnasheyn-Chilena-microkernel__src-sys-process.rs.rs`).

use alloc::collections::VecDeque;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU64, Ordering};
use spin::Mutex;

use super::task::ProcessId;
use crate::error::KernelError;

pub struct Message {
    pub id: u64,
    pub sender: ProcessId,
    pub payload: Vec<u8>,
}

pub struct MessageQueue {
    queue: Mutex<VecDeque<Message>>,
    next_id: AtomicU64,
}

const MAX_QUEUE_DEPTH: usize = 256;
const MAX_PAYLOAD_BYTES: usize = 4096;

impl MessageQueue {
    pub const fn new() -> Self {
        MessageQueue { queue: Mutex::new(VecDeque::new()), next_id: AtomicU64::new(1) }
    }

    pub fn send(&self, sender: ProcessId, payload: Vec<u8>) -> Result<(), KernelError> {
        if payload.len() > MAX_PAYLOAD_BYTES {
            return Err(KernelError::TransferTooLarge);
        }
        let mut q = self.queue.lock();
        if q.len() >= MAX_QUEUE_DEPTH {
            return Err(KernelError::SyncMsgNotAccepted);
        }
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        q.push_back(Message { id, sender, payload });
        Ok(())
    }

    pub fn receive(&self) -> Result<Message, KernelError> {
        self.queue.lock().pop_front().ok_or(KernelError::SyncMsgQueueEmpty)
    }

    pub fn len(&self) -> usize {
        self.queue.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::vec;

    #[test]
    fn fifo_ordering_is_preserved() {
        let q = MessageQueue::new();
        q.send(ProcessId(1), vec![1]).unwrap();
        q.send(ProcessId(2), vec![2]).unwrap();
        assert_eq!(q.receive().unwrap().payload, vec![1]);
        assert_eq!(q.receive().unwrap().payload, vec![2]);
    }

    #[test]
    fn first_message_gets_id_one() {
        let q = MessageQueue::new();
        q.send(ProcessId(1), vec![1]).unwrap();
        let msg = q.receive().unwrap();
        assert_eq!(msg.id, 1);
    }

    #[test]
    fn message_ids_are_monotonic() {
        let q = MessageQueue::new();
        q.send(ProcessId(1), vec![1]).unwrap();
        q.send(ProcessId(1), vec![2]).unwrap();
        let first = q.receive().unwrap();
        let second = q.receive().unwrap();
        assert!(second.id > first.id);
    }

    #[test]
    fn receive_on_empty_queue_errors() {
        let q = MessageQueue::new();
        assert_eq!(q.receive().unwrap_err(), KernelError::SyncMsgQueueEmpty);
    }

    #[test]
    fn oversized_payload_rejected() {
        let q = MessageQueue::new();
        let big = vec![0u8; MAX_PAYLOAD_BYTES + 1];
        assert_eq!(q.send(ProcessId(1), big).unwrap_err(), KernelError::TransferTooLarge);
    }
}
