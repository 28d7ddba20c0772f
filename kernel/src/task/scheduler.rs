//! Priority scheduler and the task-switch protocol.
//!
//! Strict priority with round-robin inside a level: `pop` scans the queues
//! from priority 0 down and asserts non-empty, which the per-CPU idle tasks
//! guarantee. A switch may carry a continuation; it runs on the resumed
//! stack, before interrupts are re-enabled and before anything else on that
//! CPU can observe the new task. Arming a continuation is the only safe way
//! for a task to publish itself onto a wait list, because until the switch
//! has committed another CPU could pop and resume it mid-suspend.

use alloc::sync::Arc;
use conquer_once::spin::OnceCell;
use crossbeam_queue::ArrayQueue;

use super::{new_task, TaskId, TaskQueue, TaskState, PRIORITY_COUNT, KERNEL_STACK_SIZE};
use crate::arch;
use crate::io;
use crate::memory::address_space::TaskMemory;
use crate::per_cpu;
use crate::spinlock::SpinLock;
use crate::syscall::{ReservedCall, SyscallContext, SyscallTable};

static READY: SpinLock<ReadyQueues> = SpinLock::new(ReadyQueues::new());

struct ReadyQueues {
    queues: [TaskQueue; PRIORITY_COUNT],
}

impl ReadyQueues {
    const fn new() -> Self {
        Self {
            queues: [const { TaskQueue::new() }; PRIORITY_COUNT],
        }
    }

    fn push(&mut self, priority: u8, id: TaskId) {
        self.queues[priority as usize].push(id);
    }

    fn pop(&mut self) -> TaskId {
        for queue in self.queues.iter_mut() {
            if let Some(id) = queue.pop() {
                return id;
            }
        }
        panic!("ready queues empty; the idle task is gone");
    }
}

pub fn current_task_id() -> TaskId {
    per_cpu::current()
        .current_task()
        .expect("no current task on this CPU")
}

pub fn current_task() -> Arc<super::Task> {
    super::get(current_task_id()).expect("current task missing from the pool")
}

/// Make `task` runnable again.
pub fn resume(id: TaskId) {
    let task = super::get(id).expect("resuming an unknown task");
    assert_eq!(task.state(), TaskState::Suspended);
    task.set_state(TaskState::Ready);
    let mut ready = READY.lock_irq();
    ready.push(task.priority, id);
}

/// Give up the CPU; round-robin within this priority. Interrupts must be
/// disabled (the timer interrupt calls this directly).
pub fn schedule() {
    task_switch(None);
}

/// Switch to the next ready task.
///
/// With a continuation, the current task is marked SUSPENDED and the
/// continuation runs on the resumed side, still under the disabled-interrupt
/// window, receiving the suspended task's id. Without one, the current task
/// goes back to its ready queue.
pub fn task_switch(continuation: Option<(fn(TaskId, usize), usize)>) {
    debug_assert!(!arch::interrupts_enabled());
    let cpu = per_cpu::current();
    let old_id = cpu.current_task().expect("switching before scheduler init");
    let old = super::get(old_id).expect("current task missing from the pool");

    cpu.arm_after_switch(continuation);
    cpu.set_old_task(old_id);

    // released by the post-switch trampoline, possibly on another stack
    READY.raw().acquire();
    let next_id = {
        // SAFETY: the raw ready lock is held
        let ready = unsafe { READY.data_unchecked() };
        if continuation.is_none() {
            ready.push(old.priority, old_id);
        } else {
            old.set_state(TaskState::Suspended);
        }
        ready.pop()
    };
    cpu.set_current_task(next_id);

    if next_id != old_id {
        let next = super::get(next_id).expect("ready task missing from the pool");
        #[cfg(target_arch = "x86")]
        crate::gdt::set_interrupt_stack(next.esp_interrupt);
        let new_esp = next.saved_esp.load(core::sync::atomic::Ordering::Acquire);
        let new_cr3 = next.task_memory().cr3();
        unsafe {
            arch::context_switch(old.saved_esp.as_ptr(), new_esp, new_cr3);
        }
        // we are back on `old`'s stack, resumed by some other switch
    }
    finish_task_switch();
}

/// Complete the switch protocol on the resumed stack: drop the ready-queue
/// lock, then run the suspended side's continuation.
pub(crate) fn finish_task_switch() {
    READY.raw().release();
    let cpu = per_cpu::current();
    if let Some((continuation, argument)) = cpu.take_after_switch() {
        let old = cpu.old_task().expect("continuation without a suspended task");
        continuation(old, argument);
    }
    cpu.clear_old_task();
}

/// Entry glue for brand-new tasks: the first switch into one returns here
/// instead of into `task_switch`.
#[no_mangle]
extern "C" fn first_switch_return() -> ! {
    finish_task_switch();
    let task = current_task();
    unsafe { arch::enable_interrupts() };
    let (entry, argument) = task.entry();
    drop(task);
    if let Some(entry) = entry {
        entry(argument);
    }
    terminate_current();
}

// ---------------------------------------------------------------------------
// Creation
// ---------------------------------------------------------------------------

fn allocate_stack() -> Option<usize> {
    #[cfg(target_arch = "x86")]
    {
        let vaddr = crate::memory::allocate_kernel_pages(
            KERNEL_STACK_SIZE,
            crate::memory::paging::KERNEL_PAGE,
        )?;
        Some(vaddr.as_u32() as usize)
    }
    #[cfg(not(target_arch = "x86"))]
    {
        let layout =
            core::alloc::Layout::from_size_align(KERNEL_STACK_SIZE, crate::memory::PAGE_SIZE)
                .unwrap();
        let ptr = unsafe { alloc::alloc::alloc_zeroed(layout) };
        if ptr.is_null() {
            None
        } else {
            Some(ptr as usize)
        }
    }
}

fn release_stack(stack_bottom: usize) {
    #[cfg(target_arch = "x86")]
    {
        let released = crate::memory::check_and_release_kernel_pages(crate::memory::VirtAddr::new(
            stack_bottom as u32,
        ));
        assert!(released, "task stack was not releasable");
    }
    #[cfg(not(target_arch = "x86"))]
    {
        let layout =
            core::alloc::Layout::from_size_align(KERNEL_STACK_SIZE, crate::memory::PAGE_SIZE)
                .unwrap();
        unsafe { alloc::alloc::dealloc(stack_bottom as *mut u8, layout) };
    }
}

/// Create a suspended task running `entry` on a fresh kernel stack, with
/// `argument` copied onto the top of that stack; the entry function receives
/// the copy's address (zero when empty).
pub fn create_task(
    entry: fn(usize),
    argument: &[u8],
    priority: u8,
    memory: Arc<TaskMemory>,
) -> Option<TaskId> {
    if argument.len() > KERNEL_STACK_SIZE / 2 {
        return None;
    }
    let stack_bottom = allocate_stack()?;
    let stack_top = stack_bottom + KERNEL_STACK_SIZE;

    let arg_len = (argument.len() + 3) & !3;
    let arg_base = stack_top - arg_len;
    if !argument.is_empty() {
        unsafe {
            core::ptr::copy_nonoverlapping(argument.as_ptr(), arg_base as *mut u8, argument.len());
        }
    }
    let entry_arg = if argument.is_empty() { 0 } else { arg_base };

    let frame_top = arg_base & !0xF;
    let saved_esp = unsafe { arch::build_initial_switch_frame(frame_top as u32) };
    let esp_interrupt = (stack_top - 4) as u32;

    let id = super::insert(|id| {
        new_task(
            id,
            saved_esp,
            esp_interrupt,
            stack_bottom,
            memory.clone(),
            priority,
            Some(entry),
            entry_arg,
        )
    });
    Some(id)
}

/// A task in the shared kernel address space.
pub fn create_kernel_task(entry: fn(usize), argument: &[u8], priority: u8) -> Option<TaskId> {
    create_task(entry, argument, priority, TaskMemory::kernel())
}

/// A task owning a fresh user address space.
pub fn create_user_task(entry: fn(usize), argument: &[u8], priority: u8) -> Option<TaskId> {
    let memory = TaskMemory::new_user(crate::memory::kernel_space())?;
    create_task(entry, argument, priority, memory)
}

/// A second thread of the current task: same address space, same priority.
pub fn create_thread(entry: fn(usize)) -> Option<TaskId> {
    let current = current_task();
    let id = create_task(entry, &[], current.priority, current.task_memory())?;
    resume(id);
    Some(id)
}

// ---------------------------------------------------------------------------
// Termination
// ---------------------------------------------------------------------------

static TERMINATED: OnceCell<ArrayQueue<u32>> = OnceCell::uninit();

fn terminated_queue() -> &'static ArrayQueue<u32> {
    TERMINATED.get_or_init(|| ArrayQueue::new(super::PRIORITY_COUNT * 64))
}

/// Free tasks parked by previous terminations. Their stacks are dead by
/// now: the parking happened via the post-switch continuation, so the next
/// switch had already committed.
pub fn reclaim_terminated() {
    while let Some(raw) = terminated_queue().pop() {
        let id = TaskId::from_raw(raw).expect("terminate queue holds a null id");
        let task = super::remove(id).expect("terminated task missing from the pool");
        debug_assert_eq!(task.state(), TaskState::Suspended);
        release_stack(task.stack_bottom());
        debug_assert_eq!(Arc::strong_count(&task), 1, "terminated task still referenced");
        drop(task);
    }
}

fn park_terminated(old: TaskId, _argument: usize) {
    if terminated_queue().push(old.as_raw()).is_err() {
        // no room; the record leaks rather than corrupting the queue
        log::warn!("terminate queue full, leaking task {:?}", old);
    }
}

/// End the current task: cancel or drain all of its IO, drop its address
/// space, then switch away for good. The record itself is reclaimed later,
/// after this stack can no longer be in use.
pub fn terminate_current() -> ! {
    reclaim_terminated();
    io::cancel_all_for_current();

    let task = current_task();
    let memory = task.replace_task_memory(TaskMemory::kernel());
    if !memory.is_kernel() {
        let last = memory.remove_reference();
        arch::without_interrupts(|| unsafe {
            // leave the dying space before its tables go away
            arch::write_cr3(crate::memory::kernel_space().page().cr3());
        });
        if last {
            memory.release_tables();
        }
        drop(memory);
    }

    drop(task);
    unsafe { arch::disable_interrupts() };
    task_switch(Some((park_terminated, 0)));
    unreachable!("terminated task was switched back in");
}

// ---------------------------------------------------------------------------
// Initialisation and system calls
// ---------------------------------------------------------------------------

/// Adopt the running bootstrap thread of this CPU as a task. It runs at the
/// lowest priority and never blocks, which keeps the ready queues non-empty.
fn adopt_bootstrap_task() -> TaskId {
    let id = super::insert(|id| {
        new_task(
            id,
            0,
            0,
            0,
            TaskMemory::kernel(),
            (PRIORITY_COUNT - 1) as u8,
            None,
            0,
        )
    });
    let task = super::get(id).unwrap();
    task.set_state(TaskState::Ready);
    per_cpu::current().set_current_task(id);
    id
}

/// Install the scheduler on the bootstrap CPU and register the task-side
/// system calls.
pub fn init(table: &SyscallTable) {
    adopt_bootstrap_task();

    table.register_reserved(ReservedCall::TaskDefined, task_defined_call, 0);
    table.register_reserved(ReservedCall::WaitIo, io::wait_io_call, 0);
    table.register_reserved(ReservedCall::CancelIo, io::cancel_io_call, 0);
    table.register_reserved(ReservedCall::AllocateHeap, allocate_heap_call, 0);
    table.register_reserved(ReservedCall::ReleaseHeap, release_heap_call, 0);
    table.register_reserved(ReservedCall::TranslatePage, translate_page_call, 0);
    table.register_reserved(ReservedCall::CreateThread, create_thread_call, 0);
    table.register_reserved(ReservedCall::Terminate, terminate_call, 0);
    log::info!("scheduler initialised, bootstrap task adopted");
}

/// Adopt an application processor's bootstrap thread as its idle task.
pub fn init_application_processor() {
    adopt_bootstrap_task();
}

/// Lazily set up the pool and a current task. Tests call this instead of
/// the boot path; each test thread becomes its own bootstrap CPU.
#[cfg(test)]
pub(crate) fn ensure_bootstrap_task() -> TaskId {
    match per_cpu::current().current_task() {
        Some(id) => id,
        None => adopt_bootstrap_task(),
    }
}

fn task_defined_call(ctx: &mut SyscallContext) {
    let task = current_task();
    match task.syscall_hook() {
        Some((hook, argument)) => {
            let saved = ctx.argument;
            ctx.argument = argument;
            hook(ctx);
            ctx.argument = saved;
        }
        None => panic!("undefined task system call"),
    }
}

fn allocate_heap_call(ctx: &mut SyscallContext) {
    use crate::memory::paging::PageAttr;
    let size = ctx.arguments[0];
    let attr = PageAttr::from_bits_truncate(ctx.arguments[1] as u32);
    let space_memory = current_task().task_memory();
    let result = space_memory
        .space()
        .allocate_pages(size, attr)
        .map_or(0, |vaddr| vaddr.as_u32() as usize);
    ctx.returns[0] = result;
}

fn release_heap_call(ctx: &mut SyscallContext) {
    let vaddr = crate::memory::VirtAddr::new(ctx.arguments[0] as u32);
    let space_memory = current_task().task_memory();
    ctx.returns[0] = space_memory.space().check_and_unmap_pages(vaddr) as usize;
}

fn translate_page_call(ctx: &mut SyscallContext) {
    let vaddr = crate::memory::VirtAddr::new(ctx.arguments[0] as u32);
    let space_memory = current_task().task_memory();
    ctx.returns[0] = space_memory
        .space()
        .translate(vaddr)
        .map_or(0, |paddr| paddr.as_u32() as usize);
}

fn create_thread_call(ctx: &mut SyscallContext) {
    let entry: fn(usize) = unsafe { core::mem::transmute(ctx.arguments[0]) };
    ctx.returns[0] = match create_thread(entry) {
        Some(id) => id.as_raw() as usize + 1,
        None => 0,
    };
}

fn terminate_call(_ctx: &mut SyscallContext) {
    terminate_current();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ready_queues_scan_priorities_in_order() {
        ensure_bootstrap_task();
        let high = create_kernel_task(noop_entry, &[], 0).unwrap();
        let mid = create_kernel_task(noop_entry, &[], 1).unwrap();
        let mid2 = create_kernel_task(noop_entry, &[], 1).unwrap();
        let low = create_kernel_task(noop_entry, &[], 3).unwrap();

        // resume in scrambled order; pop must honour priority then FIFO
        resume(mid);
        resume(low);
        resume(high);
        resume(mid2);

        let mut ready = READY.lock();
        assert_eq!(ready.pop(), high);
        assert_eq!(ready.pop(), mid);
        assert_eq!(ready.pop(), mid2);
        assert_eq!(ready.pop(), low);
    }

    #[test]
    fn created_tasks_start_suspended_with_a_memory_reference() {
        ensure_bootstrap_task();
        let id = create_kernel_task(noop_entry, b"payload", 2).unwrap();
        let task = super::super::get(id).unwrap();
        assert_eq!(task.state(), TaskState::Suspended);
        assert!(task.task_memory().is_kernel());
        // the argument block was copied onto the new stack
        let (entry, arg) = task.entry();
        assert!(entry.is_some());
        let copied = unsafe { core::slice::from_raw_parts(arg as *const u8, 7) };
        assert_eq!(copied, b"payload");
    }

    #[test]
    fn oversized_arguments_are_rejected() {
        ensure_bootstrap_task();
        let big = alloc::vec![0u8; KERNEL_STACK_SIZE];
        assert!(create_kernel_task(noop_entry, &big, 1).is_none());
    }

    fn noop_entry(_arg: usize) {}
}
