//! The kernel `GlobalAlloc`.
//!
//! Runs in two phases. Before the memory managers exist, allocations come
//! from a small static region handed to a linked-list heap. Once
//! `memory::init` has the slab running, everything new routes there; the
//! bootstrap region is told apart by address on release, so allocations
//! made early can still be freed late.

#[cfg(target_arch = "x86")]
mod kernel_heap {
    use core::alloc::{GlobalAlloc, Layout};
    use core::ptr;
    use core::sync::atomic::{AtomicBool, Ordering};

    use linked_list_allocator::LockedHeap;

    const BOOTSTRAP_HEAP_SIZE: usize = 256 * 1024;

    #[repr(align(4096))]
    struct BootstrapRegion([u8; BOOTSTRAP_HEAP_SIZE]);

    static mut BOOTSTRAP_REGION: BootstrapRegion = BootstrapRegion([0; BOOTSTRAP_HEAP_SIZE]);
    static BOOTSTRAP_HEAP: LockedHeap = LockedHeap::empty();
    static SLAB_READY: AtomicBool = AtomicBool::new(false);

    /// Largest alignment the slab path serves; see `slab::SlabHeader`.
    const SLAB_ALIGN: usize = 16;

    pub fn init_bootstrap() {
        unsafe {
            BOOTSTRAP_HEAP
                .lock()
                .init(ptr::addr_of_mut!(BOOTSTRAP_REGION.0) as *mut u8, BOOTSTRAP_HEAP_SIZE);
        }
    }

    pub fn switch_to_slab() {
        SLAB_READY.store(true, Ordering::Release);
    }

    fn in_bootstrap_region(ptr: *mut u8) -> bool {
        let base = unsafe { ptr::addr_of!(BOOTSTRAP_REGION) as usize };
        let addr = ptr as usize;
        addr >= base && addr < base + BOOTSTRAP_HEAP_SIZE
    }

    struct KernelAllocator;

    unsafe impl GlobalAlloc for KernelAllocator {
        unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
            if !SLAB_READY.load(Ordering::Acquire) {
                return BOOTSTRAP_HEAP.alloc(layout);
            }
            let result = if layout.align() <= SLAB_ALIGN {
                crate::memory::allocate_kernel_memory(layout.size())
            } else if layout.align() <= crate::memory::PAGE_SIZE {
                // rare over-aligned request: page granularity satisfies it
                crate::memory::kernel_slab()
                    .allocate(layout.size().max(crate::memory::PAGE_SIZE))
            } else {
                None
            };
            result.map_or(ptr::null_mut(), |p| p.as_ptr())
        }

        unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
            if in_bootstrap_region(ptr) {
                BOOTSTRAP_HEAP.dealloc(ptr, layout);
                return;
            }
            if let Some(ptr) = ptr::NonNull::new(ptr) {
                crate::memory::release_kernel_memory(ptr);
            }
        }
    }

    #[cfg(not(test))]
    #[global_allocator]
    static ALLOCATOR: KernelAllocator = KernelAllocator;

    #[cfg(not(test))]
    #[alloc_error_handler]
    fn alloc_error(layout: Layout) -> ! {
        panic!("kernel heap exhausted allocating {:?}", layout);
    }
}

#[cfg(target_arch = "x86")]
pub use kernel_heap::{init_bootstrap, switch_to_slab};

#[cfg(not(target_arch = "x86"))]
pub fn init_bootstrap() {}

#[cfg(not(target_arch = "x86"))]
pub fn switch_to_slab() {}
