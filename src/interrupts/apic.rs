//! Local APIC MMIO access and AP bring-up (`spec.md` §4.7).
//!
//! Grounded on
//! `original_source/kernel/arch/x64/processor/multi_processor-x64.cpp`'s
//! `proc_mp_x64_start_aps` for the INIT/STARTUP IPI sequence. Register
//! offsets are the standard xAPIC MMIO layout (Intel SDM vol. 3A, ch. 10).
//! LAPIC access goes through `volatile::Volatile`, the same crate the
//! teacher already depends on.

use volatile::Volatile;

use crate::config::{AP_BRINGUP_TIMEOUT_NS, AP_INIT_STARTUP_DELAY_NS, MAX_CPUS};

const REG_ID: usize = 0x020;
const REG_EOI: usize = 0x0B0;
const REG_ICR_LOW: usize = 0x300;
const REG_ICR_HIGH: usize = 0x310;

const ICR_DELIVERY_INIT: u32 = 0b101 << 8;
const ICR_DELIVERY_STARTUP: u32 = 0b110 << 8;
const ICR_LEVEL_ASSERT: u32 = 1 << 14;
const ICR_TRIGGER_LEVEL: u32 = 1 << 15;
const ICR_DELIVERY_PENDING: u32 = 1 << 12;

/// A handle onto one CPU's local APIC, mapped at a fixed MMIO base.
pub struct LocalApic {
    base: *mut u8,
}

unsafe impl Send for LocalApic {}
unsafe impl Sync for LocalApic {}

impl LocalApic {
    /// `base` must be the physical (identity- or fixed-mapped) address of
    /// this CPU's LAPIC register page, 4 KiB aligned.
    pub unsafe fn new(base: u64) -> Self {
        LocalApic { base: base as *mut u8 }
    }

    unsafe fn reg(&self, offset: usize) -> *mut Volatile<u32> {
        self.base.add(offset) as *mut Volatile<u32>
    }

    pub fn id(&self) -> u32 {
        unsafe { (*self.reg(REG_ID)).read() >> 24 }
    }

    /// Signal end-of-interrupt to the local APIC.
    pub fn end_of_interrupt(&self) {
        unsafe {
            (*self.reg(REG_EOI)).write(0);
        }
    }

    fn write_icr(&self, high: u32, low: u32) {
        unsafe {
            (*self.reg(REG_ICR_HIGH)).write(high);
            (*self.reg(REG_ICR_LOW)).write(low);
        }
    }

    fn icr_pending(&self) -> bool {
        unsafe { (*self.reg(REG_ICR_LOW)).read() & ICR_DELIVERY_PENDING != 0 }
    }

    fn wait_for_icr_idle(&self) {
        while self.icr_pending() {
            core::hint::spin_loop();
        }
    }

    /// Send an NMI to `target_apic_id`. Used by `ipi::signal` to deliver a
    /// message; the target's NMI handler inspects its own `IpiState`.
    pub fn send_nmi(&self, target_apic_id: u32) {
        self.wait_for_icr_idle();
        let delivery_nmi = 0b100 << 8;
        self.write_icr((target_apic_id << 24) as u32, delivery_nmi | ICR_LEVEL_ASSERT);
        self.wait_for_icr_idle();
    }

    fn send_init_ipi(&self, target_apic_id: u32) {
        self.wait_for_icr_idle();
        self.write_icr(
            (target_apic_id << 24) as u32,
            ICR_DELIVERY_INIT | ICR_LEVEL_ASSERT | ICR_TRIGGER_LEVEL,
        );
        self.wait_for_icr_idle();
    }

    fn send_startup_ipi(&self, target_apic_id: u32, trampoline_page: u8) {
        self.wait_for_icr_idle();
        self.write_icr((target_apic_id << 24) as u32, ICR_DELIVERY_STARTUP | trampoline_page as u32);
        self.wait_for_icr_idle();
    }
}

/// The BSP's own LAPIC handle, set up once during `interrupts::init` and
/// reused by the panic handler to broadcast a suspend IPI (`spec.md` §7).
pub static BSP_APIC: crate::sync::SpinLock<Option<LocalApic>> = crate::sync::SpinLock::new(None);

/// Send a `Suspend` IPI to every other CPU this kernel has brought online.
/// `must_complete = false`, so each signal only waits for the target to
/// acknowledge receipt, not to finish suspending.
pub fn broadcast_suspend(ipi: &super::ipi::IpiTable) {
    let apic_guard = BSP_APIC.lock();
    let Some(apic) = apic_guard.as_ref() else { return };
    let this_cpu = crate::scheduler::percpu::this_cpu_id();
    for cpu in crate::scheduler::percpu::PERCPU.iter() {
        let cpu_id = cpu.cpu_id as usize;
        if cpu_id == this_cpu || !cpu.online.load(core::sync::atomic::Ordering::Acquire) {
            continue;
        }
        let target_apic_id = cpu.lapic_id.load(core::sync::atomic::Ordering::Acquire);
        ipi.signal(apic, cpu_id, target_apic_id, super::ipi::IpiMessage::Suspend, false);
    }
}

/// Per-AP bring-up status, flipped by the AP's trampoline once it reaches
/// Rust code on its own stack.
pub struct ApStatus {
    running: [core::sync::atomic::AtomicBool; MAX_CPUS],
}

impl ApStatus {
    pub const fn new() -> Self {
        const FALSE: core::sync::atomic::AtomicBool = core::sync::atomic::AtomicBool::new(false);
        ApStatus { running: [FALSE; MAX_CPUS] }
    }

    pub fn mark_running(&self, cpu_id: usize) {
        self.running[cpu_id].store(true, core::sync::atomic::Ordering::Release);
    }

    pub fn is_running(&self, cpu_id: usize) -> bool {
        self.running[cpu_id].load(core::sync::atomic::Ordering::Acquire)
    }
}

/// INIT IPI, a 10ms stall, then a STARTUP IPI pointing at `trampoline_page`
/// (the physical page number of the real-mode AP entry trampoline), for
/// every AP in `apic_ids`. Spins up to `AP_BRINGUP_TIMEOUT_NS` per AP waiting
/// for `status` to observe it come up; `stall` is the time source's
/// busy-wait, since no separate timer is available this early in boot.
pub fn start_application_processors(
    bsp: &LocalApic,
    apic_ids: &[u32],
    trampoline_page: u8,
    status: &ApStatus,
    stall: impl Fn(u64),
) -> usize {
    let mut brought_up = 0;
    for (cpu_id, &apic_id) in apic_ids.iter().enumerate() {
        bsp.send_init_ipi(apic_id);
        stall(AP_INIT_STARTUP_DELAY_NS);
        bsp.send_startup_ipi(apic_id, trampoline_page);

        let mut waited = 0u64;
        const POLL_STEP_NS: u64 = 1_000_000;
        while !status.is_running(cpu_id) && waited < AP_BRINGUP_TIMEOUT_NS {
            stall(POLL_STEP_NS);
            waited += POLL_STEP_NS;
        }
        if status.is_running(cpu_id) {
            brought_up += 1;
        }
    }
    brought_up
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ap_status_starts_not_running() {
        let status = ApStatus::new();
        assert!(!status.is_running(0));
        status.mark_running(0);
        assert!(status.is_running(0));
    }

    #[test]
    fn start_application_processors_counts_only_ready_aps() {
        let status = ApStatus::new();
        status.mark_running(0);
        // cpu 1 never marks itself running, simulating a dead/absent AP.
        let calls = core::cell::RefCell::new(0u32);
        let stall = |_ns: u64| {
            *calls.borrow_mut() += 1;
        };
        // We can't construct a real LocalApic without MMIO in a unit test,
        // so this only exercises the status/timeout bookkeeping directly.
        let mut waited = 0u64;
        while !status.is_running(1) && waited < 10 {
            stall(1);
            waited += 1;
        }
        assert!(*calls.borrow() > 0);
        assert!(status.is_running(0));
    }
}
