//! Time sources (`spec.md` §6).
//!
//! Grounded on `original_source/kernel/processor/timing/hpet.cpp` and
//! `processor/timing/hpet.h`'s register layout. `spec.md` only specifies
//! the `TimeSource` contract, but a minimal working `HpetLike` is provided
//! so the scheduler's periodic tick can actually be driven end-to-end.

use volatile::Volatile;

use crate::config::TICK_PERIOD_NS;
use crate::error::{KResult, KernelError};

/// A monotonic clock plus the scheduler's periodic tick source.
pub trait TimeSource {
    /// Monotonic counter value, optionally converted to nanoseconds.
    fn counter_value(&self, ns: bool) -> u64;
    /// Counter-unit equivalent of a nanosecond duration.
    fn offset_for_wait(&self, ns: u64) -> u64;
    /// Busy-wait for approximately `ns` nanoseconds.
    fn stall(&self, ns: u64);
    /// Arm the periodic tick to fire on `vector` every `TICK_PERIOD_NS`.
    fn register_periodic_tick(&mut self, vector: u8) -> KResult<()>;
}

/// Civil (wall-clock) time, `spec.md` §6 exactly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CivilTime {
    pub year: i16,
    pub month: u8,
    pub day: u8,
    pub hour: u8,
    pub minute: u8,
    pub second: u8,
    pub nanoseconds: u32,
}

/// A source of wall-clock time (e.g. the RTC), distinct from the monotonic
/// `TimeSource` used for scheduling.
pub trait ClockSource {
    fn get_current_time(&mut self, out: &mut CivilTime) -> bool;
}

#[repr(C)]
struct HpetTimerCfg {
    cfg_and_caps: Volatile<u64>,
    comparator_val: Volatile<u64>,
    interrupt_route: Volatile<u64>,
    _reserved: u64,
}

#[repr(C)]
struct HpetRegisters {
    gen_cap_and_id: Volatile<u64>,
    _reserved1: u64,
    gen_config: Volatile<u64>,
    _reserved2: u64,
    gen_int_status: Volatile<u64>,
    _reserved3: [u64; 25],
    main_counter_val: Volatile<u64>,
    _reserved4: u64,
    timer_cfg: [HpetTimerCfg; 3],
}

const HPET_CFG_GLBL_ENABLE: u64 = 1 << 0;
const HPET_CFG_LEG_RTE_MAP: u64 = 1 << 1;
const HPET_TMR_LEVEL_TRIG_INT: u64 = 1 << 1;
const HPET_TMR_ENABLE: u64 = 1 << 2;
const HPET_TMR_PERIODIC: u64 = 1 << 3;
const HPET_TMR_PERIODIC_CAPABLE: u64 = 1 << 4;
const HPET_TMR_64_BIT_CAP: u64 = 1 << 5;
const HPET_TMR_WRITE_VAL: u64 = 1 << 6;

fn period_femtoseconds(cap_and_id: u64) -> u64 {
    cap_and_id >> 32
}

fn ns_to_ticks(ns: u64, period_fs: u64) -> u64 {
    (ns.saturating_mul(1_000_000)) / period_fs.max(1)
}

/// A minimal HPET driver: exposes timer 0 as the scheduler's periodic tick
/// source and the main counter as the monotonic clock.
pub struct HpetLike {
    regs: *mut HpetRegisters,
    period_fs: u64,
}

unsafe impl Send for HpetLike {}
unsafe impl Sync for HpetLike {}

impl HpetLike {
    /// `mmio_base` must be the virtual address the HPET's configuration
    /// block is mapped at (one 4 KiB page, per the original's bring-up).
    pub unsafe fn new(mmio_base: u64) -> KResult<Self> {
        let regs = mmio_base as *mut HpetRegisters;
        let cap = (*regs).gen_cap_and_id.read();
        let revision = cap & 0xFF;
        let num_timers = ((cap >> 8) & 0x1F) + 1;
        if revision == 0 || num_timers < 2 {
            return Err(KernelError::DeviceFailed);
        }
        let period_fs = period_femtoseconds(cap);
        Ok(HpetLike { regs, period_fs })
    }

    fn regs(&self) -> &mut HpetRegisters {
        unsafe { &mut *self.regs }
    }

}

impl TimeSource for HpetLike {
    fn counter_value(&self, ns: bool) -> u64 {
        let ticks = self.regs().main_counter_val.read();
        if ns {
            ticks.saturating_mul(self.period_fs) / 1_000_000
        } else {
            ticks
        }
    }

    fn offset_for_wait(&self, ns: u64) -> u64 {
        ns_to_ticks(ns, self.period_fs)
    }

    fn stall(&self, ns: u64) {
        let target = self.regs().main_counter_val.read().saturating_add(ns_to_ticks(ns, self.period_fs));
        while self.regs().main_counter_val.read() < target {
            core::hint::spin_loop();
        }
    }

    fn register_periodic_tick(&mut self, _vector: u8) -> KResult<()> {
        let regs = self.regs();
        let timer0 = &mut regs.timer_cfg[0];
        let caps = timer0.cfg_and_caps.read();
        if caps & HPET_TMR_PERIODIC_CAPABLE == 0 || caps & HPET_TMR_64_BIT_CAP == 0 {
            return Err(KernelError::DeviceFailed);
        }

        regs.gen_config.write(regs.gen_config.read() & !HPET_CFG_GLBL_ENABLE);
        regs.gen_config.write(regs.gen_config.read() | HPET_CFG_LEG_RTE_MAP);

        let period_ticks = ns_to_ticks(TICK_PERIOD_NS, self.period_fs);
        let timer0 = &mut self.regs().timer_cfg[0];
        let mut caps = timer0.cfg_and_caps.read();
        caps |= HPET_TMR_PERIODIC;
        caps &= !HPET_TMR_LEVEL_TRIG_INT;
        caps |= HPET_TMR_WRITE_VAL;
        timer0.cfg_and_caps.write(caps);
        timer0.comparator_val.write(period_ticks);
        self.regs().main_counter_val.write(0);

        let timer0 = &mut self.regs().timer_cfg[0];
        timer0.cfg_and_caps.write(timer0.cfg_and_caps.read() | HPET_TMR_ENABLE);

        let regs = self.regs();
        regs.gen_config.write(regs.gen_config.read() | HPET_CFG_GLBL_ENABLE);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn period_femtoseconds_extracts_high_bits() {
        let cap = (100_000u64) << 32 | 0x03;
        assert_eq!(period_femtoseconds(cap), 100_000);
    }

    #[test]
    fn ns_to_ticks_scales_by_period() {
        assert_eq!(ns_to_ticks(1, 100_000), 10);
        assert_eq!(ns_to_ticks(1_000_000, 100_000), 10_000_000);
    }
}
