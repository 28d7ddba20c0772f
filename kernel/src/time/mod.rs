//! Timekeeping: the global tick counter and the alarm subsystem.

pub mod timer;

use core::sync::atomic::{AtomicU64, Ordering};

use crate::syscall::{ReservedCall, SyscallContext, SyscallTable};

/// Timer IRQ rate; one tick is 10 ms.
pub const TIMER_FREQUENCY: u64 = 100;

/// Monotonic tick counter, advanced by the bootstrap CPU's timer interrupt.
static TICKS: AtomicU64 = AtomicU64::new(0);

pub fn get_ticks() -> u64 {
    TICKS.load(Ordering::Relaxed)
}

pub fn get_time_ms() -> u64 {
    get_ticks() * 1000 / TIMER_FREQUENCY
}

/// Timer interrupt body: advance time, fire due alarms on this CPU's event
/// list, then hand the CPU to the next task of the same priority.
/// Interrupts are off for the duration.
pub fn tick() {
    TICKS.fetch_add(1, Ordering::Relaxed);
    timer::current_timer_list().handle_tick();
    crate::task::scheduler::schedule();
}

pub fn init(table: &SyscallTable) {
    table.register_reserved(ReservedCall::SetAlarm, set_alarm_call, 0);
    table.register_reserved(ReservedCall::GetTime, get_time_call, 0);
    log::info!("timer initialised at {} Hz", TIMER_FREQUENCY);
}

fn set_alarm_call(ctx: &mut SyscallContext) {
    let milliseconds = ctx.arguments[0] as u64 | ((ctx.arguments[1] as u64) << 32);
    let periodic = ctx.arguments[2] != 0;
    ctx.returns[0] = timer::set_alarm(milliseconds, periodic);
}

fn get_time_call(ctx: &mut SyscallContext) {
    let now = get_time_ms();
    ctx.returns[0] = now as u32 as usize;
    ctx.returns[1] = (now >> 32) as usize;
}
