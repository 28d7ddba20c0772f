//! Blocking synchronisation: counting semaphore and reader-writer lock.
//!
//! Both are fronted by the same exclusive-lock helper. Acquisition takes
//! the primitive's spinlock with interrupts off, evaluates a predicate, and
//! either succeeds or arms a post-switch continuation that parks the task
//! on the primitive's wait queue and only then drops the spinlock. Parking
//! after the switch commits closes the race where another CPU pops and
//! resumes the task before it has reached the wait list.

use core::cell::{Cell, UnsafeCell};

use super::{scheduler, TaskId, TaskQueue};
use crate::arch;
use crate::spinlock::RawSpinLock;

type PushFn = unsafe fn(usize, TaskId);

/// The acquire/park protocol shared by every blocking primitive.
///
/// `instance` is the address of the owning primitive, passed back into the
/// predicate and queue callbacks; the indirection keeps the continuation a
/// plain function pointer that survives the stack switch.
struct ExclusiveLock {
    lock: RawSpinLock,
    /// Armed while a suspension is in flight: where to park the task, and
    /// on which instance.
    pending_park: Cell<Option<(PushFn, usize)>>,
}

// SAFETY: `pending_park` is only touched while `lock` is held.
unsafe impl Send for ExclusiveLock {}
unsafe impl Sync for ExclusiveLock {}

impl ExclusiveLock {
    const fn new() -> Self {
        Self {
            lock: RawSpinLock::new(),
            pending_park: Cell::new(None),
        }
    }

    /// Run `try_acquire` under the lock; on failure either give up
    /// (`block == false`) or suspend until a release hands the slot over.
    /// Returns whether the primitive was acquired.
    fn acquire(
        &self,
        instance: usize,
        try_acquire: unsafe fn(usize) -> bool,
        park: PushFn,
        block: bool,
    ) -> bool {
        // blocking with interrupts off could never be woken
        assert!(arch::interrupts_enabled(), "cannot block in an interrupt-free section");
        unsafe { arch::disable_interrupts() };
        self.lock.acquire();
        debug_assert!(self.pending_park.get().is_none());
        let acquired = if unsafe { try_acquire(instance) } {
            self.lock.release();
            true
        } else if !block {
            self.lock.release();
            false
        } else {
            self.pending_park.set(Some((park, instance)));
            // the lock travels across the switch and is released by the
            // continuation, after the task is on the wait queue
            scheduler::task_switch(Some((Self::park_suspended, self as *const Self as usize)));
            true
        };
        unsafe { arch::enable_interrupts() };
        acquired
    }

    /// Post-switch continuation: runs on the resumed side while the
    /// primitive's lock is still held from before the switch.
    fn park_suspended(old: TaskId, argument: usize) {
        let ex = unsafe { &*(argument as *const ExclusiveLock) };
        let (park, instance) = ex
            .pending_park
            .take()
            .expect("suspension committed without a park target");
        unsafe { park(instance, old) };
        ex.lock.release();
    }

    /// Run `release` under the lock, then resume whatever it queued.
    fn release(&self, instance: usize, release: unsafe fn(usize, &mut TaskQueue)) {
        let mut wake = TaskQueue::new();
        self.lock.acquire();
        unsafe { release(instance, &mut wake) };
        self.lock.release();
        while let Some(id) = wake.pop() {
            scheduler::resume(id);
        }
    }

    fn with_lock<R>(&self, f: impl FnOnce() -> R) -> R {
        self.lock.acquire();
        let result = f();
        self.lock.release();
        result
    }
}

// ---------------------------------------------------------------------------
// Semaphore
// ---------------------------------------------------------------------------

/// Counting semaphore with FIFO wake order: the k-th acquire to block is
/// the k-th to be released.
pub struct Semaphore {
    ex: ExclusiveLock,
    quota: Cell<i32>,
    waiters: UnsafeCell<TaskQueue>,
}

// SAFETY: quota and waiters are guarded by the exclusive lock.
unsafe impl Send for Semaphore {}
unsafe impl Sync for Semaphore {}

impl Semaphore {
    pub const fn new(initial: i32) -> Self {
        Self {
            ex: ExclusiveLock::new(),
            quota: Cell::new(initial),
            waiters: UnsafeCell::new(TaskQueue::new()),
        }
    }

    unsafe fn try_take(instance: usize) -> bool {
        let semaphore = &*(instance as *const Semaphore);
        if semaphore.quota.get() >= 1 {
            semaphore.quota.set(semaphore.quota.get() - 1);
            true
        } else {
            false
        }
    }

    unsafe fn park(instance: usize, id: TaskId) {
        let semaphore = &*(instance as *const Semaphore);
        (*semaphore.waiters.get()).push(id);
    }

    unsafe fn hand_over(instance: usize, wake: &mut TaskQueue) {
        let semaphore = &*(instance as *const Semaphore);
        match (*semaphore.waiters.get()).pop() {
            // the released slot goes straight to the oldest waiter
            Some(id) => wake.push(id),
            None => {
                let quota = semaphore.quota.get();
                assert!(quota < i32::MAX);
                semaphore.quota.set(quota + 1);
            }
        }
    }

    pub fn acquire(&self) {
        self.ex
            .acquire(self as *const Self as usize, Self::try_take, Self::park, true);
    }

    /// Never blocks.
    pub fn try_acquire(&self) -> bool {
        self.ex
            .acquire(self as *const Self as usize, Self::try_take, Self::park, false)
    }

    /// Drain the remaining quota without blocking; returns how much was
    /// taken.
    pub fn try_acquire_all(&self) -> u32 {
        let mut taken = 0;
        while self.try_acquire() {
            taken += 1;
        }
        taken
    }

    /// Block for the first unit, then drain the rest greedily.
    pub fn acquire_all(&self) -> u32 {
        self.acquire();
        1 + self.try_acquire_all()
    }

    pub fn release(&self) {
        self.ex.release(self as *const Self as usize, Self::hand_over);
    }

    pub fn value(&self) -> i32 {
        self.ex.with_lock(|| self.quota.get())
    }
}

// ---------------------------------------------------------------------------
// Reader-writer lock
// ---------------------------------------------------------------------------

/// Reader-writer lock over the same suspension protocol, with a
/// configurable preference. Writer-first never starves an arriving writer:
/// once one is queued, new readers park behind it.
pub struct RwLock {
    ex: ExclusiveLock,
    writer_first: bool,
    writer_count: Cell<u32>,
    reader_count: Cell<u32>,
    reader_queue: UnsafeCell<TaskQueue>,
    writer_queue: UnsafeCell<TaskQueue>,
}

// SAFETY: all counts and queues are guarded by the exclusive lock.
unsafe impl Send for RwLock {}
unsafe impl Sync for RwLock {}

impl RwLock {
    pub const fn new(writer_first: bool) -> Self {
        Self {
            ex: ExclusiveLock::new(),
            writer_first,
            writer_count: Cell::new(0),
            reader_count: Cell::new(0),
            reader_queue: UnsafeCell::new(TaskQueue::new()),
            writer_queue: UnsafeCell::new(TaskQueue::new()),
        }
    }

    unsafe fn try_read(instance: usize) -> bool {
        let lock = &*(instance as *const RwLock);
        if lock.writer_count.get() == 0
            && (!lock.writer_first || (*lock.writer_queue.get()).is_empty())
        {
            lock.reader_count.set(lock.reader_count.get() + 1);
            true
        } else {
            false
        }
    }

    unsafe fn try_write(instance: usize) -> bool {
        let lock = &*(instance as *const RwLock);
        if lock.writer_count.get() == 0 && lock.reader_count.get() == 0 {
            lock.writer_count.set(1);
            true
        } else {
            false
        }
    }

    unsafe fn park_reader(instance: usize, id: TaskId) {
        let lock = &*(instance as *const RwLock);
        (*lock.reader_queue.get()).push(id);
    }

    unsafe fn park_writer(instance: usize, id: TaskId) {
        let lock = &*(instance as *const RwLock);
        (*lock.writer_queue.get()).push(id);
    }

    unsafe fn hand_over(instance: usize, wake: &mut TaskQueue) {
        let lock = &*(instance as *const RwLock);
        if lock.writer_count.get() != 0 {
            lock.writer_count.set(lock.writer_count.get() - 1);
        } else {
            lock.reader_count.set(lock.reader_count.get() - 1);
        }
        let writer_queue = &mut *lock.writer_queue.get();
        let reader_queue = &mut *lock.reader_queue.get();
        let prefer_writer =
            (lock.writer_first && !writer_queue.is_empty()) || reader_queue.is_empty();
        if prefer_writer {
            if let Some(id) = writer_queue.pop() {
                lock.writer_count.set(lock.writer_count.get() + 1);
                wake.push(id);
            }
        } else {
            while let Some(id) = reader_queue.pop() {
                lock.reader_count.set(lock.reader_count.get() + 1);
                wake.push(id);
            }
        }
    }

    pub fn acquire_reader(&self) {
        self.ex.acquire(
            self as *const Self as usize,
            Self::try_read,
            Self::park_reader,
            true,
        );
    }

    pub fn try_acquire_reader(&self) -> bool {
        self.ex.acquire(
            self as *const Self as usize,
            Self::try_read,
            Self::park_reader,
            false,
        )
    }

    pub fn acquire_writer(&self) {
        self.ex.acquire(
            self as *const Self as usize,
            Self::try_write,
            Self::park_writer,
            true,
        );
    }

    pub fn try_acquire_writer(&self) -> bool {
        self.ex.acquire(
            self as *const Self as usize,
            Self::try_write,
            Self::park_writer,
            false,
        )
    }

    /// Release whichever side the caller held.
    pub fn release(&self) {
        self.ex.release(self as *const Self as usize, Self::hand_over);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn semaphore_quota_bookkeeping() {
        scheduler::ensure_bootstrap_task();
        let semaphore = Semaphore::new(2);
        assert_eq!(semaphore.value(), 2);
        assert!(semaphore.try_acquire());
        assert!(semaphore.try_acquire());
        assert!(!semaphore.try_acquire());
        semaphore.release();
        assert_eq!(semaphore.value(), 1);
        assert_eq!(semaphore.try_acquire_all(), 1);
        assert_eq!(semaphore.value(), 0);
    }

    #[test]
    fn semaphore_release_accumulates_without_waiters() {
        scheduler::ensure_bootstrap_task();
        let semaphore = Semaphore::new(0);
        semaphore.release();
        semaphore.release();
        semaphore.release();
        assert_eq!(semaphore.value(), 3);
        assert_eq!(semaphore.try_acquire_all(), 3);
    }

    #[test]
    fn rwlock_readers_share_writers_exclude() {
        scheduler::ensure_bootstrap_task();
        let lock = RwLock::new(true);
        assert!(lock.try_acquire_reader());
        assert!(lock.try_acquire_reader());
        assert!(!lock.try_acquire_writer());
        lock.release();
        lock.release();
        assert!(lock.try_acquire_writer());
        assert!(!lock.try_acquire_reader());
        assert!(!lock.try_acquire_writer());
        lock.release();
        assert!(lock.try_acquire_reader());
        lock.release();
    }
}
