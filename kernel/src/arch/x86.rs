//! i686 implementation of the architecture layer.

use core::arch::{asm, global_asm};
use core::sync::atomic::{AtomicU32, Ordering};

pub fn interrupts_enabled() -> bool {
    let eflags: u32;
    unsafe {
        asm!("pushfd", "pop {}", out(reg) eflags, options(preserves_flags));
    }
    eflags & (1 << 9) != 0
}

/// # Safety
///
/// Re-enabling must only happen once the CPU is back in a state where the
/// pending interrupt handlers may run.
pub unsafe fn disable_interrupts() {
    x86::irq::disable();
}

/// # Safety
///
/// See [`disable_interrupts`].
pub unsafe fn enable_interrupts() {
    x86::irq::enable();
}

pub fn halt() {
    // SAFETY: hlt with interrupts enabled just waits for the next one.
    unsafe { x86::halt() };
}

pub fn read_cr3() -> u32 {
    unsafe { x86::controlregs::cr3() as u32 }
}

/// # Safety
///
/// `cr3` must be the physical address of a valid page directory whose kernel
/// window matches the running kernel.
pub unsafe fn write_cr3(cr3: u32) {
    x86::controlregs::cr3_write(cr3 as u64);
}

/// Invalidate the local TLB for `vaddr..vaddr + size`.
///
/// Past 512 pages a full CR3 reload is cheaper than per-page `invlpg`.
pub fn invalidate_local(vaddr: u32, size: usize) {
    const FULL_FLUSH_THRESHOLD: usize = 512 * 4096;
    if size >= FULL_FLUSH_THRESHOLD {
        unsafe { x86::controlregs::cr3_write(x86::controlregs::cr3()) };
    } else {
        let mut offset = 0;
        while offset < size {
            unsafe { x86::tlb::flush((vaddr as usize) + offset) };
            offset += 4096;
        }
    }
}

// ---------------------------------------------------------------------------
// Local APIC access for IPI broadcast and EOI
// ---------------------------------------------------------------------------

/// Kernel-window address of the local APIC registers, set once the APIC has
/// been mapped. Zero means "single CPU, APIC not mapped yet".
static LAPIC_BASE: AtomicU32 = AtomicU32::new(0);

const LAPIC_EOI: u32 = 0xB0;
const LAPIC_ICR_LOW: u32 = 0x300;
const ICR_ALL_EXCLUDING_SELF: u32 = 0b11 << 18;
const ICR_FIXED_DELIVERY: u32 = 0;

pub fn set_lapic_base(base: u32) {
    LAPIC_BASE.store(base, Ordering::Release);
}

fn lapic_reg(offset: u32) -> Option<*mut u32> {
    let base = LAPIC_BASE.load(Ordering::Acquire);
    if base == 0 {
        None
    } else {
        Some((base + offset) as *mut u32)
    }
}

/// Broadcast an IPI to every CPU except the caller via the "all excluding
/// self" shorthand.
pub fn send_ipi_all_excluding_self(vector: u8) {
    if let Some(icr) = lapic_reg(LAPIC_ICR_LOW) {
        unsafe {
            core::ptr::write_volatile(
                icr,
                ICR_ALL_EXCLUDING_SELF | ICR_FIXED_DELIVERY | vector as u32,
            );
        }
    }
}

pub fn end_of_interrupt() {
    if let Some(eoi) = lapic_reg(LAPIC_EOI) {
        unsafe { core::ptr::write_volatile(eoi, 0) };
    }
}

// ---------------------------------------------------------------------------
// Context switch
// ---------------------------------------------------------------------------

global_asm!(
    r#"
.global context_switch_inner
// context_switch_inner(old_esp_slot: *mut u32, new_esp: u32, new_cr3: u32)
//
// Saves the callee-saved state of the outgoing task on its own stack, parks
// its stack pointer in *old_esp_slot, then adopts the incoming task's stack
// and address space. Returns on the incoming task's stack.
context_switch_inner:
    push ebp
    push ebx
    push esi
    push edi
    pushfd
    mov eax, [esp + 24]
    mov [eax], esp
    mov ecx, [esp + 32]
    mov eax, [esp + 28]
    mov cr3, ecx
    mov esp, eax
    popfd
    pop edi
    pop esi
    pop ebx
    pop ebp
    ret

.global task_startup
// First instructions of every freshly created task: complete the switch
// protocol (release the ready-queue lock, run the continuation), then enter
// the task body.
task_startup:
    call first_switch_return
"#
);

extern "C" {
    fn context_switch_inner(old_esp_slot: *mut u32, new_esp: u32, new_cr3: u32);
    pub fn task_startup();
}

/// # Safety
///
/// Interrupts must be disabled and the incoming stack/cr3 must describe a
/// task prepared by the scheduler.
pub unsafe fn context_switch(old_esp_slot: *mut u32, new_esp: u32, new_cr3: u32) {
    context_switch_inner(old_esp_slot, new_esp, new_cr3);
}

/// The initial saved-register frame expected by `context_switch_inner`,
/// written to the top of a fresh kernel stack.
///
/// Returns the initial saved stack pointer. The frame re-enters at
/// `task_startup` with interrupts still disabled (the saved eflags have
/// IF clear).
pub unsafe fn build_initial_switch_frame(stack_top: u32) -> u32 {
    let mut esp = stack_top;
    let mut push = |value: u32| {
        esp -= 4;
        core::ptr::write(esp as *mut u32, value);
    };
    push(task_startup as usize as u32); // return target of the first switch
    push(0); // ebp
    push(0); // ebx
    push(0); // esi
    push(0); // edi
    push(0x0002); // eflags: reserved bit set, IF clear
    esp
}
