#![cfg_attr(target_arch = "x86", no_std)]
#![cfg_attr(target_arch = "x86", no_main)]

#[cfg(target_arch = "x86")]
mod boot {
    use kernel::task::scheduler;
    use kernel::{fs, hlt_loop, interrupts, logger, memory, per_cpu, resource, syscall, time};

    /// Entry point reached from the assembly bootstrap with paging off,
    /// a provisional stack, and the BIOS memory map already copied to a
    /// fixed low-memory buffer.
    #[no_mangle]
    pub extern "C" fn kernel_entry() -> ! {
        logger::init();
        log::info!("kernel starting on bootstrap CPU");

        memory::init();
        kernel::gdt::init_bootstrap();
        per_cpu::init_bootstrap();

        let syscall_table = syscall::init();
        scheduler::init(syscall_table);
        time::init(syscall_table);
        fs::init(syscall_table);
        fs::fifo::init();
        resource::init();
        resource::register_syscalls(syscall_table);

        interrupts::init();
        log::info!("kernel core initialised, enabling interrupts");
        unsafe { kernel::arch::enable_interrupts() };

        // The bootstrap task becomes the idle task of CPU 0.
        hlt_loop();
    }

    #[no_mangle]
    pub extern "C" fn application_processor_entry() -> ! {
        kernel::gdt::init_application_processor();
        per_cpu::init_application_processor();
        interrupts::load_on_this_cpu();
        unsafe { kernel::arch::enable_interrupts() };
        hlt_loop();
    }
}

#[cfg(not(target_arch = "x86"))]
fn main() {
    // The kernel image is an i686 target; there is nothing to run here.
}
