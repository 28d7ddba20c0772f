//! Multiprocessor TLB invalidation.
//!
//! A single global packet describes the range being invalidated. The issuer
//! serialises on the shootdown lock, broadcasts the INVLPG IPI to every
//! other CPU, invalidates locally, then waits at the barrier until all CPUs
//! have acknowledged. Any unmap that returns therefore implies every CPU
//! has observed the invalidation.

use core::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};

use crate::arch;
use crate::per_cpu;
use crate::spinlock::{Barrier, RawSpinLock};

/// IDT slot of the shootdown IPI.
pub const INVLPG_IPI_VECTOR: u8 = 0xFD;

static LOCK: RawSpinLock = RawSpinLock::new();
static PACKET_CR3: AtomicU32 = AtomicU32::new(0);
static PACKET_VADDR: AtomicU32 = AtomicU32::new(0);
static PACKET_SIZE: AtomicUsize = AtomicUsize::new(0);
static PACKET_GLOBAL: AtomicBool = AtomicBool::new(false);
static BARRIER: Barrier = Barrier::new();

/// Invalidate `vaddr..vaddr + size` on every CPU that may have it cached.
///
/// `kernel_global` marks kernel-window ranges, which every address space
/// maps; other CPUs then invalidate regardless of their current CR3.
///
/// Interrupts must be enabled on the caller: with them off, this CPU could
/// never acknowledge a concurrent issuer's IPI and both would spin forever.
pub fn shootdown(cr3: u32, vaddr: crate::memory::VirtAddr, size: usize, kernel_global: bool) {
    let cpus = per_cpu::online_count();
    if cpus <= 1 {
        arch::invalidate_local(vaddr.as_u32(), size);
        return;
    }
    assert!(
        arch::interrupts_enabled(),
        "TLB shootdown issued with interrupts disabled"
    );
    LOCK.acquire();
    PACKET_CR3.store(cr3, Ordering::Relaxed);
    PACKET_VADDR.store(vaddr.as_u32(), Ordering::Relaxed);
    PACKET_SIZE.store(size, Ordering::Relaxed);
    PACKET_GLOBAL.store(kernel_global, Ordering::Relaxed);
    BARRIER.reset();
    arch::send_ipi_all_excluding_self(INVLPG_IPI_VECTOR);
    arch::invalidate_local(vaddr.as_u32(), size);
    BARRIER.arrive_and_wait(cpus);
    LOCK.release();
}

/// IPI handler body. Runs with interrupts disabled on the interrupted CPU;
/// acknowledges through the barrier, never by replying.
pub fn handle_invlpg_ipi() {
    if PACKET_GLOBAL.load(Ordering::Relaxed) || PACKET_CR3.load(Ordering::Relaxed) == arch::read_cr3()
    {
        arch::invalidate_local(
            PACKET_VADDR.load(Ordering::Relaxed),
            PACKET_SIZE.load(Ordering::Relaxed),
        );
    }
    arch::end_of_interrupt();
    // do not wait here: only the issuer needs the rendezvous
    BARRIER.arrive();
    unsafe { arch::enable_interrupts() };
}
