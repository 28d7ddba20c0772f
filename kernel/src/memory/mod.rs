//! Kernel memory management.
//!
//! Two buddy instances account for physical frames and kernel virtual
//! ranges, a page manager owns the two-level tables, and a slab allocator
//! cuts small objects out of order-0 pages. The layering is strict:
//! `buddy` knows nothing about paging, `physical`/`linear` know nothing
//! about tasks, and only `address_space` ties the three together.

pub mod address_space;
pub mod buddy;
pub mod heap;
pub mod linear;
pub mod paging;
pub mod physical;
pub mod slab;
pub mod tlb;

use core::fmt;

pub const PAGE_SIZE: usize = 4096;

/// Blocks range from one page to 1 GiB.
pub const MIN_BLOCK_ORDER: u32 = 12;
pub const MAX_BLOCK_ORDER: u32 = 30;
pub const MIN_BLOCK_SIZE: usize = 1 << MIN_BLOCK_ORDER;
pub const MAX_BLOCK_SIZE: usize = 1 << MAX_BLOCK_ORDER;

/// The kernel-linear window, mapped identically into every address space.
pub const KERNEL_LINEAR_BEGIN: u32 = 0xC000_0000;
pub const KERNEL_LINEAR_END: u32 = 0xFFC0_0000;

/// Everything below the kernel window belongs to the owning task.
pub const USER_LINEAR_BEGIN: u32 = 0;
pub const USER_LINEAR_END: u32 = KERNEL_LINEAR_BEGIN;

/// A 32-bit physical address.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct PhysAddr(u32);

/// A 32-bit virtual address.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct VirtAddr(u32);

impl PhysAddr {
    pub const fn new(value: u32) -> Self {
        Self(value)
    }

    pub const fn as_u32(self) -> u32 {
        self.0
    }

    pub const fn is_page_aligned(self) -> bool {
        self.0 % PAGE_SIZE as u32 == 0
    }

    pub const fn offset(self, bytes: u32) -> Self {
        Self(self.0 + bytes)
    }
}

impl VirtAddr {
    pub const fn new(value: u32) -> Self {
        Self(value)
    }

    pub const fn as_u32(self) -> u32 {
        self.0
    }

    pub fn as_ptr<T>(self) -> *mut T {
        self.0 as usize as *mut T
    }

    pub fn from_ptr<T>(ptr: *const T) -> Self {
        Self(ptr as usize as u32)
    }

    pub const fn is_page_aligned(self) -> bool {
        self.0 % PAGE_SIZE as u32 == 0
    }

    pub const fn offset(self, bytes: u32) -> Self {
        Self(self.0 + bytes)
    }

    pub const fn align_up(self, align: u32) -> Self {
        Self((self.0 + align - 1) & !(align - 1))
    }
}

impl fmt::Debug for PhysAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PhysAddr({:#010x})", self.0)
    }
}

impl fmt::Debug for VirtAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "VirtAddr({:#010x})", self.0)
    }
}

pub fn is_kernel_address(vaddr: VirtAddr) -> bool {
    vaddr.as_u32() >= KERNEL_LINEAR_BEGIN && vaddr.as_u32() < KERNEL_LINEAR_END
}

pub const fn page_round_up(size: usize) -> usize {
    (size + PAGE_SIZE - 1) & !(PAGE_SIZE - 1)
}

// ---------------------------------------------------------------------------
// Kernel-wide instances
// ---------------------------------------------------------------------------

use address_space::AddressSpace;
use conquer_once::spin::OnceCell;
use core::ptr::NonNull;
use slab::SlabManager;

static KERNEL_SPACE: OnceCell<&'static AddressSpace> = OnceCell::uninit();
static KERNEL_SLAB: OnceCell<SlabManager> = OnceCell::uninit();

pub fn kernel_space() -> &'static AddressSpace {
    KERNEL_SPACE.get().expect("kernel memory not initialised")
}

pub fn kernel_slab() -> &'static SlabManager {
    KERNEL_SLAB.get().expect("kernel slab not initialised")
}

/// Small-object allocation for kernel records; the slab falls through to the
/// page allocator for requests at or beyond its largest class.
pub fn allocate_kernel_memory(size: usize) -> Option<NonNull<u8>> {
    KERNEL_SLAB.get()?.allocate(size)
}

/// # Safety
///
/// `ptr` must come from [`allocate_kernel_memory`] and not be used again.
pub unsafe fn release_kernel_memory(ptr: NonNull<u8>) {
    kernel_slab().release(ptr);
}

pub fn allocate_kernel_pages(size: usize, attr: paging::PageAttr) -> Option<VirtAddr> {
    kernel_space().allocate_pages(size, attr)
}

pub fn check_and_release_kernel_pages(vaddr: VirtAddr) -> bool {
    kernel_space().check_and_unmap_pages(vaddr)
}

/// Install pre-built kernel managers. Called once on the bootstrap CPU,
/// before any other CPU is released and before the first heap allocation
/// that is not served by the bootstrap heap.
pub fn install_kernel_space(space: &'static AddressSpace) {
    KERNEL_SPACE
        .try_init_once(|| space)
        .expect("kernel space initialised twice");
    KERNEL_SLAB
        .try_init_once(|| SlabManager::new(slab::SpacePageSource::new(space)))
        .expect("kernel slab initialised twice");
}

/// Build the kernel managers inside the reserved boot region and enable
/// paging. i686 only; unit tests build their managers from host memory
/// instead.
#[cfg(target_arch = "x86")]
pub fn init() {
    boot_init::init();
}

#[cfg(target_arch = "x86")]
mod boot_init {
    use super::address_space::AddressSpace;
    use super::buddy::Header;
    use super::linear::{LinearBlock, LinearBlockManager};
    use super::paging::PageManager;
    use super::physical::{PhysBlock, PhysicalBlockManager};
    use super::*;

    /// One BIOS e820 range, copied to low memory by the bootstrap.
    #[repr(C)]
    pub struct AddressRange {
        pub base: u64,
        pub size: u64,
        pub kind: u32,
        pub extra: u32,
    }

    pub const ADDRESS_RANGE_USABLE: u32 = 1;

    extern "C" {
        static address_range_count: u32;
        static address_ranges: [AddressRange; 64];
    }

    fn bios_ranges() -> &'static [AddressRange] {
        unsafe { &address_ranges[..address_range_count as usize] }
    }

    /// Reserved window carved for the managers' own metadata: the second
    /// through sixteenth megabyte of the kernel window, identity-offset
    /// mapped by the bootstrap.
    const RESERVED_BASE: u32 = KERNEL_LINEAR_BEGIN;
    const RESERVED_BEGIN: u32 = KERNEL_LINEAR_BEGIN + (1 << 20);
    const RESERVED_END: u32 = KERNEL_LINEAR_BEGIN + (16 << 20);

    /// Frames past this bound are left to firmware; their headers would not
    /// fit in the reserved window.
    const MAX_SUPPORTED_PHYSICAL: u64 = 512 << 20;

    fn find_max_physical() -> u32 {
        let mut max: u64 = 0;
        for range in bios_ranges() {
            if range.kind == ADDRESS_RANGE_USABLE && range.size != 0 {
                max = max.max(range.base + range.size);
            }
        }
        if max > MAX_SUPPORTED_PHYSICAL {
            log::warn!(
                "ignoring physical memory past {} MiB",
                MAX_SUPPORTED_PHYSICAL >> 20
            );
            max = MAX_SUPPORTED_PHYSICAL;
        }
        (max & !(MIN_BLOCK_SIZE as u64 - 1)) as u32
    }

    /// A 4 KiB frame is usable iff it is fully inside a usable BIOS range,
    /// overlaps no reserved range, and does not back the managers
    /// themselves.
    fn frame_is_usable(addr: u32) -> bool {
        let begin = addr as u64;
        let end = begin + MIN_BLOCK_SIZE as u64;
        // the reserved metadata window, in physical terms
        let meta_begin = (RESERVED_BASE - KERNEL_LINEAR_BEGIN) as u64;
        let meta_end = (RESERVED_END - KERNEL_LINEAR_BEGIN) as u64;
        if begin < meta_end && end > meta_begin {
            return false;
        }
        let mut usable = false;
        for range in bios_ranges() {
            let rb = range.base;
            let re = range.base + range.size;
            if range.kind == ADDRESS_RANGE_USABLE {
                if rb <= begin && re >= end {
                    usable = true;
                }
            } else if rb < end && re > begin {
                return false;
            }
        }
        usable
    }

    pub fn init() {
        heap::init_bootstrap();
        let max_physical = find_max_physical();
        let mut cursor = RESERVED_BEGIN;

        // 1. physical frame accounting
        let phys_block_count = (max_physical / MIN_BLOCK_SIZE as u32) as usize;
        let phys_headers = cursor as *mut Header<PhysBlock>;
        cursor += (phys_block_count * core::mem::size_of::<Header<PhysBlock>>()) as u32;
        assert!(cursor < RESERVED_END, "physical manager exceeds reserved window");
        let physical = unsafe { PhysicalBlockManager::new(phys_headers, 0, max_physical) };
        for index in 0..phys_block_count {
            let addr = (index * MIN_BLOCK_SIZE) as u32;
            if frame_is_usable(addr) {
                physical.release(PhysAddr::new(addr));
            }
        }

        // 2. kernel linear range accounting
        cursor = VirtAddr::new(cursor).align_up(64).as_u32();
        let linear_block_count =
            ((KERNEL_LINEAR_END - KERNEL_LINEAR_BEGIN) / MIN_BLOCK_SIZE as u32) as usize;
        let linear_headers = cursor as *mut Header<LinearBlock>;
        cursor += (linear_block_count * core::mem::size_of::<Header<LinearBlock>>()) as u32;
        assert!(cursor < RESERVED_END, "linear manager exceeds reserved window");
        let linear = unsafe {
            LinearBlockManager::new(
                linear_headers,
                KERNEL_LINEAR_BEGIN,
                KERNEL_LINEAR_END,
                KERNEL_LINEAR_END,
            )
        };
        // the reserved metadata window stays allocated forever
        linear.release_boot_range(VirtAddr::new(RESERVED_END), VirtAddr::new(KERNEL_LINEAR_END));

        // 3. kernel page tables
        cursor = VirtAddr::new(cursor).align_up(PAGE_SIZE as u32).as_u32();
        let page = unsafe {
            PageManager::new_kernel_at(cursor, RESERVED_END, &physical, |vaddr| {
                PhysAddr::new(vaddr - KERNEL_LINEAR_BEGIN)
            })
        };

        static SPACE: OnceCell<AddressSpaceHolder> = OnceCell::uninit();
        struct AddressSpaceHolder {
            physical: PhysicalBlockManager,
            space: OnceCell<AddressSpace>,
        }
        SPACE.init_once(|| AddressSpaceHolder {
            physical,
            space: OnceCell::uninit(),
        });
        let holder = SPACE.get().unwrap();
        holder
            .space
            .init_once(|| AddressSpace::new(&holder.physical, page, linear));
        let space = holder.space.get().unwrap();

        unsafe { crate::arch::write_cr3(space.page().cr3()) };
        install_kernel_space(space);
        heap::switch_to_slab();
        log::info!(
            "kernel memory initialised: {} MiB physical, {} KiB kernel linear free",
            space.physical().free_size() / (1024 * 1024),
            space.linear_free_size() / 1024,
        );
    }
}
