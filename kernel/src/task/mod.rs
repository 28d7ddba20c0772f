//! Tasks and their pool.
//!
//! Task records are pooled and addressed by index. The intrusive circular
//! queues of the original design survive as index links inside each record:
//! a task is on at most one queue at a time (a ready queue while READY, one
//! wait queue or the terminate queue while SUSPENDED), and "is it queued?"
//! is an explicit flag, not a dangling-pointer convention.

pub mod scheduler;
pub mod sync;

use alloc::sync::Arc;
use alloc::vec::Vec;
use conquer_once::spin::OnceCell;
use core::sync::atomic::{AtomicBool, AtomicU32, AtomicU8, Ordering};

use self::sync::Semaphore;
use crate::io::IoLists;
use crate::memory::address_space::TaskMemory;
use crate::spinlock::SpinLock;
use crate::syscall::SyscallContext;

pub const PRIORITY_COUNT: usize = 4;
pub const KERNEL_STACK_SIZE: usize = 8192;

#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct TaskId(u32);

impl TaskId {
    pub(crate) const NONE_RAW: u32 = u32::MAX;

    pub(crate) fn from_raw(raw: u32) -> Option<TaskId> {
        if raw == Self::NONE_RAW {
            None
        } else {
            Some(TaskId(raw))
        }
    }

    pub(crate) fn as_raw(self) -> u32 {
        self.0
    }

    fn index(self) -> usize {
        self.0 as usize
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[repr(u8)]
pub enum TaskState {
    Ready = 0,
    Suspended = 1,
}

pub type SyscallHook = fn(&mut SyscallContext);

pub struct Task {
    id: TaskId,
    /// Saved kernel stack pointer; the context switch reads and writes it.
    pub(crate) saved_esp: AtomicU32,
    /// Stack pointer the CPU loads on a ring transition into this task.
    pub(crate) esp_interrupt: u32,
    /// Base of the kernel stack, reclaimed after the task's final switch.
    stack_bottom: usize,
    task_memory: SpinLock<Arc<TaskMemory>>,
    state: AtomicU8,
    pub priority: u8,
    /// Task-defined system-call hook and its argument.
    syscall_hook: SpinLock<Option<(SyscallHook, usize)>>,
    /// Intrusive queue links; valid only while `in_queue` is set, guarded
    /// by whichever queue the task is on.
    link_next: AtomicU32,
    link_prev: AtomicU32,
    in_queue: AtomicBool,
    /// Pending and completed asynchronous operations.
    pub(crate) io: SpinLock<IoLists>,
    /// Counts the completed list; `wait_io` blocks on it.
    pub(crate) io_semaphore: Semaphore,
    /// Entry point run by the first switch into this task.
    entry: Option<fn(usize)>,
    entry_arg: usize,
}

impl Task {
    pub fn id(&self) -> TaskId {
        self.id
    }

    pub fn state(&self) -> TaskState {
        match self.state.load(Ordering::Acquire) {
            0 => TaskState::Ready,
            _ => TaskState::Suspended,
        }
    }

    pub(crate) fn set_state(&self, state: TaskState) {
        self.state.store(state as u8, Ordering::Release);
    }

    pub fn task_memory(&self) -> Arc<TaskMemory> {
        self.task_memory.lock().clone()
    }

    /// Swap in the kernel task memory during termination, so this task can
    /// keep running after its own space goes away.
    pub(crate) fn replace_task_memory(&self, memory: Arc<TaskMemory>) -> Arc<TaskMemory> {
        core::mem::replace(&mut *self.task_memory.lock(), memory)
    }

    pub fn set_syscall_hook(&self, hook: SyscallHook, argument: usize) {
        *self.syscall_hook.lock() = Some((hook, argument));
    }

    pub fn syscall_hook(&self) -> Option<(SyscallHook, usize)> {
        *self.syscall_hook.lock()
    }

    pub(crate) fn entry(&self) -> (Option<fn(usize)>, usize) {
        (self.entry, self.entry_arg)
    }

    pub(crate) fn stack_bottom(&self) -> usize {
        self.stack_bottom
    }
}

// ---------------------------------------------------------------------------
// Pool
// ---------------------------------------------------------------------------

static POOL: OnceCell<spin::RwLock<Vec<Option<Arc<Task>>>>> = OnceCell::uninit();

fn pool() -> &'static spin::RwLock<Vec<Option<Arc<Task>>>> {
    POOL.get_or_init(|| spin::RwLock::new(Vec::new()))
}

pub fn get(id: TaskId) -> Option<Arc<Task>> {
    pool().read().get(id.index())?.clone()
}

fn insert(mut build: impl FnMut(TaskId) -> Task) -> TaskId {
    // writers keep interrupts off so an interrupt handler's read on the
    // same CPU cannot deadlock against them
    crate::arch::without_interrupts(|| {
        let mut slots = pool().write();
        let index = slots.iter().position(Option::is_none).unwrap_or_else(|| {
            slots.push(None);
            slots.len() - 1
        });
        let id = TaskId(index as u32);
        slots[index] = Some(Arc::new(build(id)));
        id
    })
}

fn remove(id: TaskId) -> Option<Arc<Task>> {
    crate::arch::without_interrupts(|| pool().write().get_mut(id.index())?.take())
}

#[allow(clippy::too_many_arguments)]
pub(crate) fn new_task(
    id: TaskId,
    saved_esp: u32,
    esp_interrupt: u32,
    stack_bottom: usize,
    task_memory: Arc<TaskMemory>,
    priority: u8,
    entry: Option<fn(usize)>,
    entry_arg: usize,
) -> Task {
    assert!((priority as usize) < PRIORITY_COUNT);
    task_memory.add_reference();
    Task {
        id,
        saved_esp: AtomicU32::new(saved_esp),
        esp_interrupt,
        stack_bottom,
        task_memory: SpinLock::new(task_memory),
        state: AtomicU8::new(TaskState::Suspended as u8),
        priority,
        syscall_hook: SpinLock::new(None),
        link_next: AtomicU32::new(TaskId::NONE_RAW),
        link_prev: AtomicU32::new(TaskId::NONE_RAW),
        in_queue: AtomicBool::new(false),
        io: SpinLock::new(IoLists::new()),
        io_semaphore: Semaphore::new(0),
        entry,
        entry_arg,
    }
}

// ---------------------------------------------------------------------------
// Intrusive circular FIFO of tasks
// ---------------------------------------------------------------------------

/// Head index of a circular doubly-linked queue threaded through the task
/// records. The caller's lock guards the whole structure, links included.
pub struct TaskQueue {
    head: u32,
}

impl TaskQueue {
    pub const fn new() -> Self {
        Self {
            head: TaskId::NONE_RAW,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.head == TaskId::NONE_RAW
    }

    fn links(id: TaskId) -> Arc<Task> {
        get(id).expect("queued task disappeared from the pool")
    }

    /// Append at the tail (the head's predecessor).
    pub fn push(&mut self, id: TaskId) {
        let task = Self::links(id);
        assert!(
            !task.in_queue.swap(true, Ordering::Relaxed),
            "task is already on a queue"
        );
        match TaskId::from_raw(self.head) {
            None => {
                task.link_next.store(id.as_raw(), Ordering::Relaxed);
                task.link_prev.store(id.as_raw(), Ordering::Relaxed);
                self.head = id.as_raw();
            }
            Some(head_id) => {
                let head = Self::links(head_id);
                let tail_raw = head.link_prev.load(Ordering::Relaxed);
                let tail = Self::links(TaskId(tail_raw));
                task.link_next.store(head_id.as_raw(), Ordering::Relaxed);
                task.link_prev.store(tail_raw, Ordering::Relaxed);
                tail.link_next.store(id.as_raw(), Ordering::Relaxed);
                head.link_prev.store(id.as_raw(), Ordering::Relaxed);
            }
        }
    }

    pub fn pop(&mut self) -> Option<TaskId> {
        let head_id = TaskId::from_raw(self.head)?;
        let head = Self::links(head_id);
        let next_raw = head.link_next.load(Ordering::Relaxed);
        if next_raw == head_id.as_raw() {
            self.head = TaskId::NONE_RAW;
        } else {
            let prev_raw = head.link_prev.load(Ordering::Relaxed);
            let next = Self::links(TaskId(next_raw));
            let prev = Self::links(TaskId(prev_raw));
            next.link_prev.store(prev_raw, Ordering::Relaxed);
            prev.link_next.store(next_raw, Ordering::Relaxed);
            self.head = next_raw;
        }
        head.link_next.store(TaskId::NONE_RAW, Ordering::Relaxed);
        head.link_prev.store(TaskId::NONE_RAW, Ordering::Relaxed);
        head.in_queue.store(false, Ordering::Relaxed);
        Some(head_id)
    }
}

impl Default for TaskQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::scheduler;
    use super::*;

    #[test]
    fn queue_preserves_fifo_order() {
        scheduler::ensure_bootstrap_task();
        let ids: Vec<TaskId> = (0..4)
            .map(|_| scheduler::create_kernel_task(idle_entry, &[], 1).unwrap())
            .collect();
        let mut queue = TaskQueue::new();
        for &id in &ids {
            queue.push(id);
        }
        for &id in &ids {
            assert_eq!(queue.pop(), Some(id));
        }
        assert!(queue.pop().is_none());
    }

    #[test]
    fn queue_survives_interleaved_push_pop() {
        scheduler::ensure_bootstrap_task();
        let ids: Vec<TaskId> = (0..3)
            .map(|_| scheduler::create_kernel_task(idle_entry, &[], 1).unwrap())
            .collect();
        let mut queue = TaskQueue::new();
        queue.push(ids[0]);
        queue.push(ids[1]);
        assert_eq!(queue.pop(), Some(ids[0]));
        queue.push(ids[2]);
        queue.push(ids[0]);
        assert_eq!(queue.pop(), Some(ids[1]));
        assert_eq!(queue.pop(), Some(ids[2]));
        assert_eq!(queue.pop(), Some(ids[0]));
        assert!(queue.is_empty());
    }

    fn idle_entry(_arg: usize) {}
}
