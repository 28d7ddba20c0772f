//! Test-and-set spin primitives.
//!
//! These sit below the scheduler: they never block, so they are the only
//! synchronisation available to code that runs with interrupts disabled or
//! before task switching exists. Everything queue-shaped above this layer
//! (semaphores, the ready queues, IO lists) is built on them.

use core::cell::UnsafeCell;
use core::hint::spin_loop;
use core::ops::{Deref, DerefMut};
use core::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use crate::arch;

/// A bare test-and-set lock without an associated value.
///
/// Used where the critical section must straddle a stack switch and an RAII
/// guard therefore cannot work (the ready-queue lock is released by the
/// post-switch trampoline, not by the code that acquired it).
pub struct RawSpinLock {
    locked: AtomicBool,
}

impl RawSpinLock {
    pub const fn new() -> Self {
        Self {
            locked: AtomicBool::new(false),
        }
    }

    pub fn acquire(&self) {
        while self
            .locked
            .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            spin_loop();
        }
    }

    pub fn try_acquire(&self) -> bool {
        self.locked
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
    }

    pub fn release(&self) {
        self.locked.store(false, Ordering::Release);
    }

    pub fn is_locked(&self) -> bool {
        self.locked.load(Ordering::Relaxed)
    }
}

impl Default for RawSpinLock {
    fn default() -> Self {
        Self::new()
    }
}

/// A value protected by a [`RawSpinLock`].
pub struct SpinLock<T: ?Sized> {
    raw: RawSpinLock,
    data: UnsafeCell<T>,
}

// SAFETY: access to the inner value is serialised by the lock.
unsafe impl<T: ?Sized + Send> Send for SpinLock<T> {}
unsafe impl<T: ?Sized + Send> Sync for SpinLock<T> {}

impl<T> SpinLock<T> {
    pub const fn new(data: T) -> Self {
        Self {
            raw: RawSpinLock::new(),
            data: UnsafeCell::new(data),
        }
    }
}

impl<T: ?Sized> SpinLock<T> {
    pub fn lock(&self) -> SpinLockGuard<'_, T> {
        self.raw.acquire();
        SpinLockGuard { lock: self }
    }

    pub fn try_lock(&self) -> Option<SpinLockGuard<'_, T>> {
        if self.raw.try_acquire() {
            Some(SpinLockGuard { lock: self })
        } else {
            None
        }
    }

    /// Acquire with interrupts disabled for the guard's lifetime.
    ///
    /// Required for any lock that an interrupt handler may also take on the
    /// same CPU; the previous interrupt state is restored on drop.
    pub fn lock_irq(&self) -> IrqSpinLockGuard<'_, T> {
        let was_enabled = arch::interrupts_enabled();
        unsafe { arch::disable_interrupts() };
        self.raw.acquire();
        IrqSpinLockGuard {
            lock: self,
            was_enabled,
        }
    }

    pub fn is_locked(&self) -> bool {
        self.raw.is_locked()
    }

    /// The underlying raw lock, for sections that must release it on a
    /// different stack than the one that acquired it.
    pub fn raw(&self) -> &RawSpinLock {
        &self.raw
    }

    /// # Safety
    ///
    /// The caller must hold the raw lock.
    pub unsafe fn data_unchecked(&self) -> &mut T {
        &mut *self.data.get()
    }
}

pub struct SpinLockGuard<'a, T: ?Sized> {
    lock: &'a SpinLock<T>,
}

impl<T: ?Sized> Deref for SpinLockGuard<'_, T> {
    type Target = T;
    fn deref(&self) -> &T {
        unsafe { &*self.lock.data.get() }
    }
}

impl<T: ?Sized> DerefMut for SpinLockGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut *self.lock.data.get() }
    }
}

impl<T: ?Sized> Drop for SpinLockGuard<'_, T> {
    fn drop(&mut self) {
        self.lock.raw.release();
    }
}

pub struct IrqSpinLockGuard<'a, T: ?Sized> {
    lock: &'a SpinLock<T>,
    was_enabled: bool,
}

impl<T: ?Sized> Deref for IrqSpinLockGuard<'_, T> {
    type Target = T;
    fn deref(&self) -> &T {
        unsafe { &*self.lock.data.get() }
    }
}

impl<T: ?Sized> DerefMut for IrqSpinLockGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut *self.lock.data.get() }
    }
}

impl<T: ?Sized> Drop for IrqSpinLockGuard<'_, T> {
    fn drop(&mut self) {
        self.lock.raw.release();
        if self.was_enabled {
            unsafe { arch::enable_interrupts() };
        }
    }
}

/// A counting barrier for rendezvous between CPUs.
///
/// The TLB shootdown issuer resets the barrier, sends the IPI, then waits for
/// every CPU (itself included) to arrive. IPI handlers arrive without
/// waiting.
pub struct Barrier {
    count: AtomicU32,
}

impl Barrier {
    pub const fn new() -> Self {
        Self {
            count: AtomicU32::new(0),
        }
    }

    pub fn reset(&self) {
        self.count.store(0, Ordering::Release);
    }

    /// Arrive without waiting for the others.
    pub fn arrive(&self) {
        self.count.fetch_add(1, Ordering::AcqRel);
    }

    /// Arrive, then spin until `expected` CPUs have arrived in total.
    pub fn arrive_and_wait(&self, expected: u32) {
        self.count.fetch_add(1, Ordering::AcqRel);
        while self.count.load(Ordering::Acquire) < expected {
            spin_loop();
        }
    }

    pub fn arrived(&self) -> u32 {
        self.count.load(Ordering::Acquire)
    }
}

impl Default for Barrier {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn raw_lock_is_exclusive() {
        let lock = RawSpinLock::new();
        lock.acquire();
        assert!(!lock.try_acquire());
        lock.release();
        assert!(lock.try_acquire());
        lock.release();
    }

    #[test]
    fn guard_releases_on_drop() {
        let lock = SpinLock::new(7u32);
        {
            let mut guard = lock.lock();
            *guard += 1;
            assert!(lock.is_locked());
        }
        assert!(!lock.is_locked());
        assert_eq!(*lock.lock(), 8);
    }

    #[test]
    fn barrier_counts_arrivals() {
        let barrier = Barrier::new();
        barrier.arrive();
        barrier.arrive();
        assert_eq!(barrier.arrived(), 2);
        barrier.arrive_and_wait(3);
        assert_eq!(barrier.arrived(), 3);
        barrier.reset();
        assert_eq!(barrier.arrived(), 0);
    }
}
