//! Thin architecture layer.
//!
//! Everything that touches rings, control registers, the TLB, or the local
//! APIC lives behind this module. The i686 implementation is the real one;
//! the stub keeps the rest of the kernel buildable and unit-testable on a
//! development host, where these operations have no meaning.

#[cfg(target_arch = "x86")]
mod x86;
#[cfg(target_arch = "x86")]
pub use x86::*;

#[cfg(not(target_arch = "x86"))]
mod stub;
#[cfg(not(target_arch = "x86"))]
pub use stub::*;

/// Run `f` with interrupts disabled, restoring the previous state afterwards.
pub fn without_interrupts<F, R>(f: F) -> R
where
    F: FnOnce() -> R,
{
    let was_enabled = interrupts_enabled();
    if was_enabled {
        unsafe { disable_interrupts() };
    }
    let r = f();
    if was_enabled {
        unsafe { enable_interrupts() };
    }
    r
}
