//! Slab sub-allocator for small kernel objects.
//!
//! A slab is one order-0 (4 KiB) page: its header at offset 0, the rest cut
//! into fixed-size units chained through an in-place free list. Each size
//! class keeps two lists, slabs with free units and full slabs. Requests at
//! or beyond the largest class bypass the slabs and go straight to the page
//! allocator, so `release` can route by alignment alone: page-aligned
//! pointers were never slab units.

use core::mem::size_of;
use core::ptr::{self, NonNull};

use super::address_space::AddressSpace;
use super::{page_round_up, PAGE_SIZE};
use crate::spinlock::SpinLock;

#[cfg(target_arch = "x86")]
use super::address_space::AddressSpace;
#[cfg(target_arch = "x86")]
use super::paging::KERNEL_PAGE;
#[cfg(target_arch = "x86")]
use super::VirtAddr;

const SLAB_SIZE: usize = PAGE_SIZE;

/// Lives at offset 0 of every slab page. The 16-byte alignment makes every
/// unit offset a multiple of 16, which is the strongest alignment the slab
/// path serves.
#[repr(C, align(16))]
struct SlabHeader {
    next: *mut SlabHeader,
    prev: *mut SlabHeader,
    class: usize,
    used_count: usize,
    free_list: *mut FreeUnit,
}

#[repr(C)]
struct FreeUnit {
    next: *mut FreeUnit,
}

const HEADER_SIZE: usize = size_of::<SlabHeader>();
pub const CLASS_COUNT: usize = 8;

/// Unit sizes; the subtracted header keeps the larger classes packing
/// cleanly into one page.
pub const CLASS_SIZES: [usize; CLASS_COUNT] = [
    16,
    32,
    64,
    128 - HEADER_SIZE,
    256 - HEADER_SIZE,
    512 - HEADER_SIZE,
    1024 - HEADER_SIZE,
    2048 - HEADER_SIZE,
];

/// Largest request the slab serves; anything at or above goes to the page
/// allocator.
pub const LARGEST_CLASS: usize = CLASS_SIZES[CLASS_COUNT - 1];

/// Page-granular backing for the slab: the kernel address space on the
/// target, the host heap in unit tests.
pub struct SpacePageSource {
    #[cfg(target_arch = "x86")]
    space: &'static AddressSpace,
    /// Host allocations with their layouts, so release can rebuild them.
    #[cfg(not(target_arch = "x86"))]
    allocations: SpinLock<alloc::vec::Vec<(usize, usize)>>,
}

impl SpacePageSource {
    #[cfg(target_arch = "x86")]
    pub fn new(space: &'static AddressSpace) -> Self {
        Self { space }
    }

    #[cfg(not(target_arch = "x86"))]
    pub fn new(_space: &'static AddressSpace) -> Self {
        Self::new_host()
    }

    #[cfg(not(target_arch = "x86"))]
    pub fn new_host() -> Self {
        Self {
            allocations: SpinLock::new(alloc::vec::Vec::new()),
        }
    }

    fn allocate_pages(&self, size: usize) -> Option<NonNull<u8>> {
        let size = page_round_up(size);
        #[cfg(target_arch = "x86")]
        {
            let vaddr = self.space.allocate_pages(size, KERNEL_PAGE)?;
            NonNull::new(vaddr.as_ptr())
        }
        #[cfg(not(target_arch = "x86"))]
        {
            let layout = core::alloc::Layout::from_size_align(size, PAGE_SIZE).unwrap();
            let ptr = unsafe { alloc::alloc::alloc_zeroed(layout) };
            let ptr = NonNull::new(ptr)?;
            self.allocations.lock().push((ptr.as_ptr() as usize, size));
            Some(ptr)
        }
    }

    fn release_pages(&self, ptr: NonNull<u8>) {
        #[cfg(target_arch = "x86")]
        {
            let released = self
                .space
                .check_and_unmap_pages(VirtAddr::new(ptr.as_ptr() as u32));
            assert!(released, "slab released pages it does not own");
        }
        #[cfg(not(target_arch = "x86"))]
        {
            let mut allocations = self.allocations.lock();
            let index = allocations
                .iter()
                .position(|&(addr, _)| addr == ptr.as_ptr() as usize)
                .expect("slab released pages it does not own");
            let (_, size) = allocations.swap_remove(index);
            drop(allocations);
            let layout = core::alloc::Layout::from_size_align(size, PAGE_SIZE).unwrap();
            unsafe { alloc::alloc::dealloc(ptr.as_ptr(), layout) };
        }
    }
}

struct ClassLists {
    usable: [*mut SlabHeader; CLASS_COUNT],
    full: [*mut SlabHeader; CLASS_COUNT],
}

// SAFETY: the raw slab links are only touched under the manager's lock.
unsafe impl Send for ClassLists {}

pub struct SlabManager {
    lists: SpinLock<ClassLists>,
    source: SpacePageSource,
}

impl SlabManager {
    pub fn new(source: SpacePageSource) -> Self {
        Self {
            lists: SpinLock::new(ClassLists {
                usable: [ptr::null_mut(); CLASS_COUNT],
                full: [ptr::null_mut(); CLASS_COUNT],
            }),
            source,
        }
    }

    pub fn allocate(&self, size: usize) -> Option<NonNull<u8>> {
        if size >= LARGEST_CLASS {
            return self.source.allocate_pages(size);
        }
        let class = CLASS_SIZES
            .iter()
            .position(|&unit| unit >= size)
            .expect("class table covers all sub-page sizes");

        let mut lists = self.lists.lock();
        let mut slab = lists.usable[class];
        if slab.is_null() {
            slab = match self.create_slab(class) {
                Some(slab) => slab,
                None => return None,
            };
            push_slab(&mut lists.usable[class], slab);
        }
        let unit = unsafe {
            let header = &mut *slab;
            let unit = header.free_list;
            debug_assert!(!unit.is_null());
            header.free_list = (*unit).next;
            header.used_count += 1;
            if header.free_list.is_null() {
                remove_slab(&mut lists.usable[class], slab);
                push_slab(&mut lists.full[class], slab);
            }
            unit as *mut u8
        };
        debug_assert!(unit as usize % SLAB_SIZE != 0);
        NonNull::new(unit)
    }

    /// # Safety
    ///
    /// `ptr` must come from [`allocate`](Self::allocate) on this manager and
    /// not be used afterwards.
    pub unsafe fn release(&self, ptr: NonNull<u8>) {
        let addr = ptr.as_ptr() as usize;
        if addr % SLAB_SIZE == 0 {
            // large allocation, never a unit
            self.source.release_pages(ptr);
            return;
        }
        let slab = (addr & !(SLAB_SIZE - 1)) as *mut SlabHeader;
        let mut lists = self.lists.lock();
        let header = &mut *slab;
        let class = header.class;
        let was_full = header.free_list.is_null();
        let unit = ptr.as_ptr() as *mut FreeUnit;
        (*unit).next = header.free_list;
        header.free_list = unit;
        header.used_count -= 1;
        if was_full {
            remove_slab(&mut lists.full[class], slab);
            push_slab(&mut lists.usable[class], slab);
        }
        if header.used_count == 0 {
            remove_slab(&mut lists.usable[class], slab);
            drop(lists);
            self.source
                .release_pages(NonNull::new_unchecked(slab as *mut u8));
        }
    }

    fn create_slab(&self, class: usize) -> Option<*mut SlabHeader> {
        let page = self.source.allocate_pages(SLAB_SIZE)?.as_ptr();
        let slab = page as *mut SlabHeader;
        let unit_size = CLASS_SIZES[class];
        unsafe {
            (*slab).next = ptr::null_mut();
            (*slab).prev = ptr::null_mut();
            (*slab).class = class;
            (*slab).used_count = 0;
            let mut free_list: *mut FreeUnit = ptr::null_mut();
            let mut offset = HEADER_SIZE;
            while offset + unit_size <= SLAB_SIZE {
                let unit = page.add(offset) as *mut FreeUnit;
                (*unit).next = free_list;
                free_list = unit;
                offset += unit_size;
            }
            (*slab).free_list = free_list;
        }
        Some(slab)
    }
}

fn push_slab(head: &mut *mut SlabHeader, slab: *mut SlabHeader) {
    unsafe {
        (*slab).prev = ptr::null_mut();
        (*slab).next = *head;
        if !head.is_null() {
            (**head).prev = slab;
        }
        *head = slab;
    }
}

fn remove_slab(head: &mut *mut SlabHeader, slab: *mut SlabHeader) {
    unsafe {
        let prev = (*slab).prev;
        let next = (*slab).next;
        if prev.is_null() {
            debug_assert_eq!(*head, slab);
            *head = next;
        } else {
            (*prev).next = next;
        }
        if !next.is_null() {
            (*next).prev = prev;
        }
        (*slab).prev = ptr::null_mut();
        (*slab).next = ptr::null_mut();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn new_manager() -> SlabManager {
        SlabManager::new(SpacePageSource::new_host())
    }

    #[test]
    fn units_come_from_the_same_page_until_full() {
        let manager = new_manager();
        let a = manager.allocate(24).unwrap();
        let b = manager.allocate(24).unwrap();
        // same slab page, distinct units
        assert_eq!(
            a.as_ptr() as usize & !(SLAB_SIZE - 1),
            b.as_ptr() as usize & !(SLAB_SIZE - 1)
        );
        assert_ne!(a, b);
        unsafe {
            manager.release(a);
            manager.release(b);
        }
    }

    #[test]
    fn unit_alignment_is_sixteen() {
        let manager = new_manager();
        for size in [1usize, 16, 33, 100, 500, 1000] {
            let ptr = manager.allocate(size).unwrap();
            assert_eq!(ptr.as_ptr() as usize % 16, 0, "size {}", size);
            unsafe { manager.release(ptr) };
        }
    }

    #[test]
    fn large_requests_bypass_the_classes() {
        let manager = new_manager();
        let ptr = manager.allocate(LARGEST_CLASS).unwrap();
        assert_eq!(ptr.as_ptr() as usize % PAGE_SIZE, 0);
        unsafe { manager.release(ptr) };

        let ptr = manager.allocate(3 * PAGE_SIZE).unwrap();
        assert_eq!(ptr.as_ptr() as usize % PAGE_SIZE, 0);
        unsafe { manager.release(ptr) };
    }

    #[test]
    fn drained_slabs_are_recycled() {
        let manager = new_manager();
        // fill one slab of the 16-byte class completely
        let capacity = (SLAB_SIZE - HEADER_SIZE) / 16;
        let mut units = alloc::vec::Vec::new();
        for _ in 0..capacity {
            units.push(manager.allocate(16).unwrap());
        }
        let base = units[0].as_ptr() as usize & !(SLAB_SIZE - 1);
        assert!(units
            .iter()
            .all(|u| u.as_ptr() as usize & !(SLAB_SIZE - 1) == base));
        // one more forces a second slab
        let extra = manager.allocate(16).unwrap();
        assert_ne!(extra.as_ptr() as usize & !(SLAB_SIZE - 1), base);
        for unit in units {
            unsafe { manager.release(unit) };
        }
        unsafe { manager.release(extra) };
    }
}
