pub mod apic;
pub mod dispatch;
pub mod gdt;
pub mod idt;
pub mod ipi;

pub use dispatch::{IInterruptReceiver, InterruptTable};
pub use ipi::{IpiMessage, IpiTable};

pub fn init() {
    gdt::init();
    idt::init();
    unsafe { idt::PICS.lock().initialize() };
}

/// Broadcast a suspend IPI to every other known-running CPU. Called from
/// the panic handler (`spec.md` §7: "panic, which stops all CPUs").
pub fn panic_suspend_others() {
    if let Some(ipi) = idt::IPI_TABLE.lock().as_ref() {
        apic::broadcast_suspend(ipi);
    }
}
