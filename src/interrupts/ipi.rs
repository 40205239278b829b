//! Inter-processor signaling (`spec.md` §4.7).
//!
//! Grounded on
//! `original_source/kernel/arch/x64/processor/multi_processor-x64.cpp`'s
//! `PROC_MP_X64_MSG_STATE`/`proc_mp_x64_signal_proc`. One `IpiState` per
//! target CPU; the sender spins on `state` after sending the NMI, the target
//! CPU's NMI handler (`handle_nmi`) does the actual work and reports back by
//! advancing `state`.

use core::sync::atomic::{AtomicU8, Ordering};

use crate::config::MAX_CPUS;
use crate::interrupts::apic::LocalApic;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum IpiMessage {
    Resume = 0,
    Suspend = 1,
    TlbShootdown = 2,
    ReloadIdt = 3,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
enum IpiPhase {
    NoMsg = 0,
    MsgWaiting = 1,
    Acknowledged = 2,
    Completed = 3,
}

impl IpiPhase {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => IpiPhase::NoMsg,
            1 => IpiPhase::MsgWaiting,
            2 => IpiPhase::Acknowledged,
            _ => IpiPhase::Completed,
        }
    }
}

/// Per-CPU signaling state. `msg` is only meaningful while `phase !=
/// NoMsg`; `signal_lock` serializes senders so only one message is ever in
/// flight to a given target at a time.
pub struct IpiState {
    phase: AtomicU8,
    msg: AtomicU8,
    signal_lock: crate::sync::SpinLock<()>,
}

impl IpiState {
    pub const fn new() -> Self {
        IpiState {
            phase: AtomicU8::new(IpiPhase::NoMsg as u8),
            msg: AtomicU8::new(IpiMessage::Resume as u8),
            signal_lock: crate::sync::SpinLock::new(()),
        }
    }
}

pub struct IpiTable {
    states: [IpiState; MAX_CPUS],
}

impl IpiTable {
    pub fn new() -> Self {
        const INIT: IpiState = IpiState::new();
        IpiTable { states: [INIT; MAX_CPUS] }
    }

    /// Send `msg` to `target_cpu` via `bsp`'s LAPIC, addressed to
    /// `target_apic_id`. Blocks until the target has at least acknowledged
    /// receipt, and until full completion if `must_complete`.
    pub fn signal(
        &self,
        bsp: &LocalApic,
        target_cpu: usize,
        target_apic_id: u32,
        msg: IpiMessage,
        must_complete: bool,
    ) {
        let state = &self.states[target_cpu];
        let _guard = state.signal_lock.lock();

        assert_eq!(state.phase.load(Ordering::Acquire), IpiPhase::NoMsg as u8);
        state.msg.store(msg as u8, Ordering::Relaxed);
        state.phase.store(IpiPhase::MsgWaiting as u8, Ordering::Release);

        bsp.send_nmi(target_apic_id);

        loop {
            let phase = IpiPhase::from_u8(state.phase.load(Ordering::Acquire));
            match phase {
                IpiPhase::Acknowledged if !must_complete => break,
                IpiPhase::Completed => break,
                _ => core::hint::spin_loop(),
            }
        }

        state.phase.store(IpiPhase::NoMsg as u8, Ordering::Release);
    }

    /// Called from the target CPU's NMI handler. Requires a message to be
    /// pending, dispatches on its kind, and reports completion.
    pub fn handle_nmi(&self, this_cpu: usize, dispatch: impl FnOnce(IpiMessage)) {
        let state = &self.states[this_cpu];
        let phase = state.phase.load(Ordering::Acquire);
        assert_eq!(phase, IpiPhase::MsgWaiting as u8);

        let msg = match state.msg.load(Ordering::Relaxed) {
            0 => IpiMessage::Resume,
            1 => IpiMessage::Suspend,
            2 => IpiMessage::TlbShootdown,
            _ => IpiMessage::ReloadIdt,
        };
        state.phase.store(IpiPhase::Acknowledged as u8, Ordering::Release);

        dispatch(msg);

        state.phase.store(IpiPhase::Completed as u8, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::cell::RefCell;

    #[test]
    fn handle_nmi_requires_pending_message() {
        let table = IpiTable::new();
        let state = &table.states[0];
        state.phase.store(IpiPhase::MsgWaiting as u8, Ordering::Release);
        state.msg.store(IpiMessage::Suspend as u8, Ordering::Relaxed);

        let seen = RefCell::new(None);
        table.handle_nmi(0, |m| *seen.borrow_mut() = Some(m));

        assert_eq!(*seen.borrow(), Some(IpiMessage::Suspend));
        assert_eq!(state.phase.load(Ordering::Acquire), IpiPhase::Completed as u8);
    }

    #[test]
    #[should_panic]
    fn handle_nmi_panics_without_pending_message() {
        let table = IpiTable::new();
        table.handle_nmi(1, |_| {});
    }

    #[test]
    fn phase_round_trips_through_u8() {
        for p in [IpiPhase::NoMsg, IpiPhase::MsgWaiting, IpiPhase::Acknowledged, IpiPhase::Completed] {
            assert_eq!(IpiPhase::from_u8(p as u8), p);
        }
    }
}
