//! The unified IO-request model.
//!
//! Every asynchronous operation — disk transfer, alarm, network frame, file
//! verb, resource enumeration — is one `IoObject` bound to the task that
//! issued it. The object lives on that task's pending list until the driver
//! completes it, then on the completed list until the task accepts it
//! through `wait`. A counting semaphore mirrors the completed list's length,
//! so waiting tasks sleep on ordinary scheduler suspension.
//!
//! Cancellability protocol: a request is cancellable when first pended,
//! drivers clear the flag around their internal critical sections (while
//! the request sits in hardware queues), and completion sets it again so a
//! request parked on the completed list can still be thrown away. All flag
//! traffic goes through the owning task's IO lock.

use alloc::sync::Arc;
use alloc::vec::Vec;
use core::cell::Cell;

use crate::syscall::SyscallContext;
use crate::task::{self, scheduler, Task, TaskId};

/// Opaque request handle handed to user code; the address of the request
/// record. Zero is never a valid handle.
pub type IoHandle = usize;

pub const IO_REQUEST_FAILURE: IoHandle = 0;

/// How many values `accept` may report alongside the handle.
pub const MAX_IO_RETURNS: usize = 5;

/// The common part of every asynchronous operation, embedded in the
/// driver-specific record.
pub struct IoRequest {
    task: TaskId,
    /// Guarded by the owning task's IO lock.
    cancellable: Cell<bool>,
}

// SAFETY: `cancellable` is only accessed under the owning task's IO lock.
unsafe impl Send for IoRequest {}
unsafe impl Sync for IoRequest {}

impl IoRequest {
    /// Bind a fresh request to the calling task, initially cancellable.
    pub fn new() -> Self {
        Self {
            task: scheduler::current_task_id(),
            cancellable: Cell::new(true),
        }
    }

    pub fn task(&self) -> TaskId {
        self.task
    }
}

impl Default for IoRequest {
    fn default() -> Self {
        Self::new()
    }
}

/// A driver-specific asynchronous operation.
pub trait IoObject: Send + Sync {
    fn request(&self) -> &IoRequest;

    /// Dispose of a request that has been removed from the task lists.
    /// Runs outside the IO lock.
    fn cancel(self: Arc<Self>);

    /// Report the outcome to the accepting task; fills `returns` and
    /// reports how many values are meaningful. Consumes the request unless
    /// the driver re-arms it (periodic alarms do).
    fn accept(self: Arc<Self>, returns: &mut [usize; MAX_IO_RETURNS]) -> usize;
}

pub fn handle_of(object: &Arc<dyn IoObject>) -> IoHandle {
    Arc::as_ptr(object) as *const () as usize
}

/// A task's two request lists.
pub struct IoLists {
    pending: Vec<Arc<dyn IoObject>>,
    completed: Vec<Arc<dyn IoObject>>,
}

impl IoLists {
    pub const fn new() -> Self {
        Self {
            pending: Vec::new(),
            completed: Vec::new(),
        }
    }

    fn position(list: &[Arc<dyn IoObject>], handle: IoHandle) -> Option<usize> {
        list.iter().position(|object| handle_of(object) == handle)
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    pub fn completed_count(&self) -> usize {
        self.completed.len()
    }
}

impl Default for IoLists {
    fn default() -> Self {
        Self::new()
    }
}

fn owner_of(object: &Arc<dyn IoObject>) -> Arc<Task> {
    task::get(object.request().task()).expect("IO request bound to a dead task")
}

/// Queue a freshly created request on its task's pending list.
pub fn pend(object: Arc<dyn IoObject>) -> IoHandle {
    let handle = handle_of(&object);
    let owner = owner_of(&object);
    let mut io = owner.io.lock_irq();
    debug_assert!(IoLists::position(&io.pending, handle).is_none());
    io.pending.push(object);
    handle
}

/// Move a request from pending to completed, make it cancellable again, and
/// wake one waiter. Any task (or interrupt) may call this.
pub fn complete(object: &Arc<dyn IoObject>) {
    let owner = owner_of(object);
    {
        let mut io = owner.io.lock_irq();
        let handle = handle_of(object);
        let index = IoLists::position(&io.pending, handle)
            .expect("completing a request that was never pended");
        let object = io.pending.remove(index);
        object.request().cancellable.set(true);
        io.completed.push(object);
    }
    owner.io_semaphore.release();
}

/// Toggle the cancellable flag under the owner's IO lock.
pub fn set_cancellable(object: &Arc<dyn IoObject>, value: bool) {
    let owner = owner_of(object);
    let _io = owner.io.lock_irq();
    object.request().cancellable.set(value);
}

/// Atomically claim the request for completion: clears the flag and reports
/// whether it was still cancellable (i.e. no cancel has raced ahead).
pub fn claim_not_cancellable(object: &Arc<dyn IoObject>) -> bool {
    let owner = owner_of(object);
    let _io = owner.io.lock_irq();
    let was = object.request().cancellable.get();
    object.request().cancellable.set(false);
    was
}

/// Whether `handle` denotes a live request of `task`.
pub fn search(task: &Task, handle: IoHandle) -> bool {
    let io = task.io.lock_irq();
    IoLists::position(&io.pending, handle).is_some()
        || IoLists::position(&io.completed, handle).is_some()
}

/// Block until the expected request — or, with `None`, any request — has
/// completed, and remove it from the completed list. The caller must invoke
/// `accept` on the result.
pub fn wait(task: &Task, expected: Option<IoHandle>) -> Arc<dyn IoObject> {
    // drain stale posts so the semaphore cannot run ahead of the list
    let mut value = task.io_semaphore.value();
    while value > 0 {
        task.io_semaphore.acquire();
        value -= 1;
    }
    loop {
        {
            let mut io = task.io.lock_irq();
            let found = match expected {
                Some(handle) => IoLists::position(&io.completed, handle),
                None => (!io.completed.is_empty()).then_some(0),
            };
            if let Some(index) = found {
                return io.completed.remove(index);
            }
        }
        task.io_semaphore.acquire();
    }
}

/// Cancel `handle` if it is in the cancellable state at the moment the IO
/// lock is taken. False means the caller must accept the completion instead
/// (or retry after `wait`).
pub fn try_cancel(task: &Task, handle: IoHandle) -> bool {
    let object = {
        let mut io = task.io.lock_irq();
        let from_pending = IoLists::position(&io.pending, handle);
        let from_completed = IoLists::position(&io.completed, handle);
        let object = match (from_pending, from_completed) {
            (Some(index), _) => {
                if !io.pending[index].request().cancellable.get() {
                    return false;
                }
                io.pending.remove(index)
            }
            (None, Some(index)) => {
                if !io.completed[index].request().cancellable.get() {
                    return false;
                }
                io.completed.remove(index)
            }
            (None, None) => return false,
        };
        object
    };
    object.cancel();
    true
}

/// Terminating tasks drain both lists: cancel what is cancellable, wait out
/// what is not, then dispose of it. On return the pending list is empty.
pub fn cancel_all_for_current() {
    let task = scheduler::current_task();
    loop {
        let handle = {
            let io = task.io.lock_irq();
            io.pending
                .first()
                .or_else(|| io.completed.first())
                .map(handle_of)
        };
        let handle = match handle {
            Some(handle) => handle,
            None => break,
        };
        if try_cancel(&task, handle) {
            continue;
        }
        // mid-dispatch: it must complete eventually, then it is ours
        let object = wait(&task, Some(handle));
        object.cancel();
    }
    debug_assert_eq!(task.io.lock_irq().pending_count(), 0);
}

// ---------------------------------------------------------------------------
// System-call surface
// ---------------------------------------------------------------------------

/// `wait_io(handle)`: block until the request completes and report its
/// return values; `handle == 0` waits for any request.
pub fn wait_io_call(ctx: &mut SyscallContext) {
    let handle = ctx.arguments[0];
    let task = scheduler::current_task();
    let expected = if handle == IO_REQUEST_FAILURE {
        None
    } else {
        if !search(&task, handle) {
            ctx.returns[0] = IO_REQUEST_FAILURE;
            return;
        }
        Some(handle)
    };
    let object = wait(&task, expected);
    let completed_handle = handle_of(&object);
    let mut values = [0usize; MAX_IO_RETURNS];
    let count = object.accept(&mut values);
    debug_assert!(count <= MAX_IO_RETURNS);
    ctx.returns[0] = completed_handle;
    ctx.returns[1..1 + count].copy_from_slice(&values[..count]);
}

/// `cancel_io(handle)`: true iff the request was observed cancellable.
pub fn cancel_io_call(ctx: &mut SyscallContext) {
    let handle = ctx.arguments[0];
    let task = scheduler::current_task();
    ctx.returns[0] = (search(&task, handle) && try_cancel(&task, handle)) as usize;
}

/// Kernel-side synchronous wait: returns the accepted values, or `None` if
/// the handle is not a live request of the calling task.
pub fn wait_io(handle: IoHandle) -> Option<([usize; MAX_IO_RETURNS], usize)> {
    let task = scheduler::current_task();
    if !search(&task, handle) {
        return None;
    }
    let object = wait(&task, Some(handle));
    let mut values = [0usize; MAX_IO_RETURNS];
    let count = object.accept(&mut values);
    Some((values, count))
}

/// Kernel-side cancel.
pub fn cancel_io(handle: IoHandle) -> bool {
    let task = scheduler::current_task();
    search(&task, handle) && try_cancel(&task, handle)
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::sync::atomic::{AtomicBool, Ordering};

    struct MockIo {
        request: IoRequest,
        result: usize,
        cancelled: AtomicBool,
    }

    impl MockIo {
        fn spawn(result: usize) -> Arc<MockIo> {
            Arc::new(MockIo {
                request: IoRequest::new(),
                result,
                cancelled: AtomicBool::new(false),
            })
        }
    }

    impl IoObject for MockIo {
        fn request(&self) -> &IoRequest {
            &self.request
        }

        fn cancel(self: Arc<Self>) {
            self.cancelled.store(true, Ordering::SeqCst);
        }

        fn accept(self: Arc<Self>, returns: &mut [usize; MAX_IO_RETURNS]) -> usize {
            returns[0] = self.result;
            1
        }
    }

    #[test]
    fn complete_then_wait_reports_the_result() {
        scheduler::ensure_bootstrap_task();
        let task = scheduler::current_task();
        let mock = MockIo::spawn(42);
        let object: Arc<dyn IoObject> = mock.clone();
        let handle = pend(object.clone());
        assert!(search(&task, handle));
        complete(&object);
        assert_eq!(task.io_semaphore.value(), 1);

        let (values, count) = wait_io(handle).unwrap();
        assert_eq!(count, 1);
        assert_eq!(values[0], 42);
        assert!(!search(&task, handle));
        // the handle is dead now
        assert!(wait_io(handle).is_none());
    }

    #[test]
    fn cancel_follows_the_cancellable_state() {
        scheduler::ensure_bootstrap_task();
        let task = scheduler::current_task();
        let mock = MockIo::spawn(0);
        let object: Arc<dyn IoObject> = mock.clone();
        let handle = pend(object.clone());

        // driver enters its critical section: cancel must fail
        assert!(claim_not_cancellable(&object));
        assert!(!try_cancel(&task, handle));
        assert!(!mock.cancelled.load(Ordering::SeqCst));

        // completion re-arms cancellability, a late cancel now succeeds
        complete(&object);
        assert!(try_cancel(&task, handle));
        assert!(mock.cancelled.load(Ordering::SeqCst));
        assert!(!search(&task, handle));
    }

    #[test]
    fn cancel_before_dispatch_removes_the_request() {
        scheduler::ensure_bootstrap_task();
        let task = scheduler::current_task();
        let mock = MockIo::spawn(0);
        let object: Arc<dyn IoObject> = mock.clone();
        let handle = pend(object);
        assert!(try_cancel(&task, handle));
        assert!(mock.cancelled.load(Ordering::SeqCst));
        assert_eq!(task.io.lock().pending_count(), 0);
        // cancelling twice reports the race
        assert!(!try_cancel(&task, handle));
    }

    #[test]
    fn wait_for_any_drains_completions_in_order() {
        scheduler::ensure_bootstrap_task();
        let task = scheduler::current_task();
        let first: Arc<dyn IoObject> = MockIo::spawn(1);
        let second: Arc<dyn IoObject> = MockIo::spawn(2);
        pend(first.clone());
        pend(second.clone());
        complete(&first);
        complete(&second);

        let a = wait(&task, None);
        let b = wait(&task, None);
        let mut returns = [0usize; MAX_IO_RETURNS];
        assert_eq!(a.accept(&mut returns), 1);
        assert_eq!(returns[0], 1);
        assert_eq!(b.accept(&mut returns), 1);
        assert_eq!(returns[0], 2);
    }

    #[test]
    fn termination_drains_every_request() {
        scheduler::ensure_bootstrap_task();
        let task = scheduler::current_task();
        let pending: Arc<dyn IoObject> = MockIo::spawn(0);
        let completed: Arc<dyn IoObject> = MockIo::spawn(0);
        pend(pending.clone());
        pend(completed.clone());
        complete(&completed);

        cancel_all_for_current();
        let io = task.io.lock();
        assert_eq!(io.pending_count(), 0);
        assert_eq!(io.completed_count(), 0);
    }
}
