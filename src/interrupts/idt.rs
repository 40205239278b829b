use x86_64::structures::idt::{InterruptDescriptorTable, InterruptStackFrame, PageFaultErrorCode};
use lazy_static::lazy_static;
use crate::{log_error, log_info};
use super::dispatch::InterruptTable;
use super::gdt;
use super::ipi::IpiTable;
use pic8259::ChainedPics;
use spin::Mutex;

/// The fast/slow-path interrupt table (`spec.md` §4.6), shared by every
/// architectural stub above the two CPU exceptions handled directly.
pub static INTERRUPT_TABLE: Mutex<Option<InterruptTable>> = Mutex::new(None);

/// Per-CPU IPI signaling state (`spec.md` §4.7).
pub static IPI_TABLE: Mutex<Option<IpiTable>> = Mutex::new(None);

pub const PIC_1_OFFSET: u8 = 32;
pub const PIC_2_OFFSET: u8 = PIC_1_OFFSET + 8;

pub static PICS: Mutex<ChainedPics> = Mutex::new(unsafe { ChainedPics::new(PIC_1_OFFSET, PIC_2_OFFSET) });

#[derive(Debug, Clone, Copy)]
#[repr(u8)]
pub enum InterruptIndex {
    Timer = PIC_1_OFFSET,
    Keyboard = PIC_1_OFFSET + 1,
}

impl InterruptIndex {
    fn as_u8(self) -> u8 {
        self as u8
    }

    fn as_usize(self) -> usize {
        usize::from(self.as_u8())
    }
}

lazy_static! {
    static ref IDT: InterruptDescriptorTable = {
        let mut idt = InterruptDescriptorTable::new();
        idt.breakpoint.set_handler_fn(breakpoint_handler);
        unsafe {
            idt.double_fault.set_handler_fn(double_fault_handler)
                .set_stack_index(gdt::DOUBLE_FAULT_IST_INDEX);
        }
        idt.page_fault.set_handler_fn(page_fault_handler);
        idt.general_protection_fault.set_handler_fn(general_protection_fault_handler);
        unsafe {
            idt.non_maskable_interrupt.set_handler_fn(nmi_handler)
                .set_stack_index(gdt::DOUBLE_FAULT_IST_INDEX);
        }
        idt[InterruptIndex::Timer.as_usize()]
            .set_handler_fn(timer_interrupt_handler);
        idt[InterruptIndex::Keyboard.as_usize()]
            .set_handler_fn(keyboard_interrupt_handler);
        idt
    };
}

pub fn init() {
    IDT.load();
    *INTERRUPT_TABLE.lock() = Some(InterruptTable::new());
    *IPI_TABLE.lock() = Some(IpiTable::new());
}

extern "x86-interrupt" fn breakpoint_handler(
    stack_frame: InterruptStackFrame)
{
    log_info!("EXCEPTION: BREAKPOINT\n{:#?}", stack_frame);
}

extern "x86-interrupt" fn double_fault_handler(
    stack_frame: InterruptStackFrame, _error_code: u64) -> !
{
    panic!("EXCEPTION: DOUBLE FAULT\n{:#?}", stack_frame);
}

extern "x86-interrupt" fn page_fault_handler(
    stack_frame: InterruptStackFrame, error_code: PageFaultErrorCode)
{
    use x86_64::registers::control::Cr2;
    log_error!("EXCEPTION: PAGE FAULT");
    log_error!("Accessed Address: {:?}", Cr2::read());
    log_error!("Error Code: {:?}", error_code);
    panic!("EXCEPTION: PAGE FAULT\n{:#?}", stack_frame);
}

extern "x86-interrupt" fn timer_interrupt_handler(
    _stack_frame: InterruptStackFrame)
{
    if let Some(table) = INTERRUPT_TABLE.lock().as_ref() {
        table.dispatch(InterruptIndex::Timer.as_u8());
    }
    unsafe {
        PICS.lock()
            .notify_end_of_interrupt(InterruptIndex::Timer.as_u8());
    }
}

/// NMI is the IPI delivery mechanism (`spec.md` §4.7); it is never shared
/// with ordinary IRQs, so it bypasses the fast/slow dispatch table and goes
/// straight to the per-CPU `IpiTable`.
extern "x86-interrupt" fn nmi_handler(_stack_frame: InterruptStackFrame) {
    if let Some(ipi) = IPI_TABLE.lock().as_ref() {
        let this_cpu = crate::scheduler::percpu::this_cpu_id();
        ipi.handle_nmi(this_cpu, |msg| dispatch_ipi_message(msg));
    }
}

fn dispatch_ipi_message(msg: super::ipi::IpiMessage) {
    use super::ipi::IpiMessage;
    match msg {
        IpiMessage::Resume => {
            x86_64::instructions::interrupts::enable();
            x86_64::instructions::hlt();
        }
        IpiMessage::Suspend => {
            x86_64::instructions::interrupts::disable();
            x86_64::instructions::hlt();
        }
        IpiMessage::TlbShootdown => unsafe {
            let cr3 = x86_64::registers::control::Cr3::read();
            x86_64::registers::control::Cr3::write(cr3.0, cr3.1);
        },
        IpiMessage::ReloadIdt => IDT.load(),
    }
}

extern "x86-interrupt" fn keyboard_interrupt_handler(
    _stack_frame: InterruptStackFrame)
{
    // Drains the scancode so the controller doesn't re-raise IRQ1, but
    // leaves interpreting it to whatever's registered on this vector -
    // there's no in-tree keyboard receiver, only the dispatch contract.
    use x86_64::instructions::port::Port;
    let mut port: Port<u8> = Port::new(0x60);
    let _scancode = unsafe { port.read() };

    if let Some(table) = INTERRUPT_TABLE.lock().as_ref() {
        table.dispatch(InterruptIndex::Keyboard.as_u8());
    }
    unsafe {
        PICS.lock()
            .notify_end_of_interrupt(InterruptIndex::Keyboard.as_u8());
    }
}

extern "x86-interrupt" fn general_protection_fault_handler(
    stack_frame: InterruptStackFrame, error_code: u64)
{
    panic!("EXCEPTION: GENERAL PROTECTION FAULT\nError Code: {error_code}\n{:#?}", stack_frame);
}
