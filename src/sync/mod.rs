//! Synchronization primitives (`spec.md` §3), layered directly on the
//! scheduler: `Mutex`/`Semaphore`/`WaitObject` suspend threads rather than
//! spin, while `SpinLock` never yields to the scheduler at all.

pub mod mutex;
pub mod semaphore;
pub mod spinlock;
pub mod wait_object;

pub use mutex::{AcquireResult, Mutex};
pub use semaphore::Semaphore;
pub use spinlock::SpinLock;
pub use wait_object::{WaitForFirstTriggerObject, WaitObject};
