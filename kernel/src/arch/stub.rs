//! Inert architecture layer for non-i686 builds (host unit tests).
//!
//! Interrupt state and CR3 are modelled just enough for the assertions in
//! the portable code to hold; TLB and IPI operations are no-ops because a
//! host process has no TLB to shoot down.

use core::sync::atomic::{AtomicU32, Ordering};

#[cfg(test)]
std::thread_local! {
    static INTERRUPTS_ENABLED: core::cell::Cell<bool> = const { core::cell::Cell::new(true) };
}

#[cfg(not(test))]
static INTERRUPTS_ENABLED: core::sync::atomic::AtomicBool =
    core::sync::atomic::AtomicBool::new(true);

pub fn interrupts_enabled() -> bool {
    #[cfg(test)]
    {
        INTERRUPTS_ENABLED.with(|f| f.get())
    }
    #[cfg(not(test))]
    {
        INTERRUPTS_ENABLED.load(Ordering::Relaxed)
    }
}

pub unsafe fn disable_interrupts() {
    #[cfg(test)]
    INTERRUPTS_ENABLED.with(|f| f.set(false));
    #[cfg(not(test))]
    INTERRUPTS_ENABLED.store(false, Ordering::Relaxed);
}

pub unsafe fn enable_interrupts() {
    #[cfg(test)]
    INTERRUPTS_ENABLED.with(|f| f.set(true));
    #[cfg(not(test))]
    INTERRUPTS_ENABLED.store(true, Ordering::Relaxed);
}

pub fn halt() {
    core::hint::spin_loop();
}

static CR3: AtomicU32 = AtomicU32::new(0);

pub fn read_cr3() -> u32 {
    CR3.load(Ordering::Relaxed)
}

pub unsafe fn write_cr3(cr3: u32) {
    CR3.store(cr3, Ordering::Relaxed);
}

pub fn invalidate_local(_vaddr: u32, _size: usize) {}

pub fn set_lapic_base(_base: u32) {}

pub fn send_ipi_all_excluding_self(_vector: u8) {}

pub fn end_of_interrupt() {}

pub unsafe fn context_switch(_old_esp_slot: *mut u32, _new_esp: u32, _new_cr3: u32) {
    unreachable!("context switch is only possible on the i686 target");
}

pub unsafe fn build_initial_switch_frame(stack_top: u32) -> u32 {
    stack_top
}
