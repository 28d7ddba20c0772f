//! IDT setup and the interrupt entry paths: the timer IRQ, the TLB
//! shootdown IPI, and the ring-3 system-call gate.

use core::arch::{asm, global_asm};
use core::mem::size_of;

use x86::dtables::{lidt, DescriptorTablePointer};

use crate::memory::tlb;
use crate::syscall::{self, SyscallContext, MAX_ARGUMENTS, MAX_RETURNS, SYSCALL_VECTOR};

const IDT_LEN: usize = 256;

pub const TIMER_VECTOR: u8 = 0x20;
const SPURIOUS_VECTOR: u8 = 0xFF;

const PIC1_COMMAND: u16 = 0x20;
const PIC1_DATA: u16 = 0x21;
const PIC2_COMMAND: u16 = 0xA0;
const PIC2_DATA: u16 = 0xA1;
const PIC_EOI: u8 = 0x20;

/// One 32-bit gate descriptor.
#[derive(Clone, Copy)]
#[repr(C)]
struct Gate {
    offset_low: u16,
    selector: u16,
    flags: u16,
    offset_high: u16,
}

impl Gate {
    const EMPTY: Gate = Gate {
        offset_low: 0,
        selector: 0,
        flags: 0,
        offset_high: 0,
    };

    fn interrupt(handler: usize, ring3: bool) -> Gate {
        // present, 32-bit interrupt gate; DPL 3 makes it int-able from
        // user mode
        let flags = 0x8E00 | if ring3 { 0x6000 } else { 0 };
        Gate {
            offset_low: handler as u16,
            selector: crate::gdt::KERNEL_CODE_SELECTOR,
            flags,
            offset_high: (handler >> 16) as u16,
        }
    }
}

static mut IDT: [Gate; IDT_LEN] = [Gate::EMPTY; IDT_LEN];

global_asm!(
    r#"
.global timer_interrupt_entry
timer_interrupt_entry:
    pusha
    call timer_interrupt_body
    popa
    iretd

.global invlpg_interrupt_entry
invlpg_interrupt_entry:
    pusha
    call invlpg_interrupt_body
    popa
    iretd

.global spurious_interrupt_entry
spurious_interrupt_entry:
    iretd

.global syscall_interrupt_entry
// Ring-3 callable gate: eax carries the call number, edx/ecx/ebx/esi/edi
// the arguments. The register image is passed by address so the handler
// can rewrite all six return slots.
syscall_interrupt_entry:
    push edi
    push esi
    push ebx
    push ecx
    push edx
    push eax
    push esp
    call syscall_interrupt_body
    add esp, 4
    pop eax
    pop edx
    pop ecx
    pop ebx
    pop esi
    pop edi
    iretd
"#
);

extern "C" {
    fn timer_interrupt_entry();
    fn invlpg_interrupt_entry();
    fn spurious_interrupt_entry();
    fn syscall_interrupt_entry();
}

#[no_mangle]
extern "C" fn timer_interrupt_body() {
    end_of_timer_interrupt();
    crate::time::tick();
}

#[no_mangle]
extern "C" fn invlpg_interrupt_body() {
    tlb::handle_invlpg_ipi();
}

/// Saved register image of a system call, in push order.
#[repr(C)]
struct SyscallRegisters {
    eax: u32,
    edx: u32,
    ecx: u32,
    ebx: u32,
    esi: u32,
    edi: u32,
}

#[no_mangle]
extern "C" fn syscall_interrupt_body(registers: &mut SyscallRegisters) {
    let arguments: [usize; MAX_ARGUMENTS] = [
        registers.edx as usize,
        registers.ecx as usize,
        registers.ebx as usize,
        registers.esi as usize,
        registers.edi as usize,
    ];
    let mut ctx = SyscallContext::new(registers.eax, arguments);
    syscall::table().dispatch(&mut ctx);
    let returns: [&mut u32; MAX_RETURNS] = [
        &mut registers.eax,
        &mut registers.edx,
        &mut registers.ecx,
        &mut registers.ebx,
        &mut registers.esi,
        &mut registers.edi,
    ];
    for (slot, value) in returns.into_iter().zip(ctx.returns) {
        *slot = value as u32;
    }
}

fn remap_pic() {
    unsafe {
        // ICW1: initialise, expect ICW4
        x86::io::outb(PIC1_COMMAND, 0x11);
        x86::io::outb(PIC2_COMMAND, 0x11);
        // vector offsets 0x20 and 0x28
        x86::io::outb(PIC1_DATA, TIMER_VECTOR);
        x86::io::outb(PIC2_DATA, TIMER_VECTOR + 8);
        // wiring: slave on IRQ2
        x86::io::outb(PIC1_DATA, 0x04);
        x86::io::outb(PIC2_DATA, 0x02);
        // 8086 mode
        x86::io::outb(PIC1_DATA, 0x01);
        x86::io::outb(PIC2_DATA, 0x01);
        // mask everything except the timer
        x86::io::outb(PIC1_DATA, !0x01);
        x86::io::outb(PIC2_DATA, 0xFF);
    }
}

fn end_of_timer_interrupt() {
    unsafe { x86::io::outb(PIC1_COMMAND, PIC_EOI) };
}

fn program_timer() {
    // 8254 channel 0, rate generator at TIMER_FREQUENCY
    const PIT_INPUT_HZ: u32 = 1_193_182;
    let divisor = (PIT_INPUT_HZ / crate::time::TIMER_FREQUENCY as u32) as u16;
    unsafe {
        x86::io::outb(0x43, 0x34);
        x86::io::outb(0x40, divisor as u8);
        x86::io::outb(0x40, (divisor >> 8) as u8);
    }
}

/// Build the IDT once and load it on the bootstrap CPU.
pub fn init() {
    unsafe {
        IDT[TIMER_VECTOR as usize] = Gate::interrupt(timer_interrupt_entry as usize, false);
        IDT[tlb::INVLPG_IPI_VECTOR as usize] =
            Gate::interrupt(invlpg_interrupt_entry as usize, false);
        IDT[SPURIOUS_VECTOR as usize] = Gate::interrupt(spurious_interrupt_entry as usize, false);
        IDT[SYSCALL_VECTOR as usize] = Gate::interrupt(syscall_interrupt_entry as usize, true);
    }
    remap_pic();
    program_timer();
    load_on_this_cpu();
    log::info!("interrupts initialised, system calls on vector {}", SYSCALL_VECTOR);
}

/// Load the shared IDT; application processors call this during bring-up.
pub fn load_on_this_cpu() {
    let pointer = DescriptorTablePointer {
        limit: (IDT_LEN * size_of::<Gate>() - 1) as u16,
        base: core::ptr::addr_of!(IDT) as *const Gate,
    };
    unsafe { lidt(&pointer) };
}

/// Invoke a system call from kernel mode through the same gate user code
/// uses.
#[allow(dead_code)]
pub fn kernel_int_call(number: u32, arguments: [usize; MAX_ARGUMENTS]) -> usize {
    let result: usize;
    unsafe {
        // ebx is reserved by the compiler on i686; shuffle it by hand
        asm!(
            "push ebx",
            "mov ebx, {arg2}",
            "int 0x7F",
            "pop ebx",
            arg2 = in(reg) arguments[2],
            inout("eax") number as usize => result,
            in("edx") arguments[0],
            in("ecx") arguments[1],
            in("esi") arguments[3],
            in("edi") arguments[4],
        );
    }
    result
}
