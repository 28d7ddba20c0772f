//! An address space: one page manager and one linear manager over the
//! shared physical manager, and the reference-counted task-memory record
//! that hands a space to tasks.

use alloc::sync::Arc;

use super::linear::{ExtendContext, LinearBlockManager};
use super::paging::{PageAttr, PageManager};
use super::physical::PhysicalBlockManager;
use super::{page_round_up, PhysAddr, VirtAddr, PAGE_SIZE};
use crate::arch;
use crate::spinlock::SpinLock;

pub struct AddressSpace {
    physical: &'static PhysicalBlockManager,
    page: PageManager,
    linear: LinearBlockManager,
}

impl AddressSpace {
    pub fn new(
        physical: &'static PhysicalBlockManager,
        page: PageManager,
        linear: LinearBlockManager,
    ) -> Self {
        Self {
            physical,
            page,
            linear,
        }
    }

    pub fn physical(&self) -> &'static PhysicalBlockManager {
        self.physical
    }

    pub fn page(&self) -> &PageManager {
        &self.page
    }

    fn ctx(&self) -> ExtendContext<'_> {
        ExtendContext {
            page: &self.page,
            physical: self.physical,
        }
    }

    /// Reserve a linear range and back it with fresh frames.
    pub fn allocate_pages(&self, size: usize, attr: PageAttr) -> Option<VirtAddr> {
        let size = page_round_up(size);
        let vaddr = self.linear.allocate_or_extend(size, self.ctx())?;
        match self.page.map(self.physical, vaddr, size, attr) {
            Ok(()) => Some(vaddr),
            Err(_) => {
                self.linear.release(vaddr);
                None
            }
        }
    }

    /// Reserve a linear range and map it onto the given physical range
    /// (device registers, firmware tables).
    pub fn map_pages(&self, paddr: PhysAddr, size: usize, attr: PageAttr) -> Option<VirtAddr> {
        let size = page_round_up(size);
        let vaddr = self.linear.allocate_or_extend(size, self.ctx())?;
        match self.page.map_to(self.physical, vaddr, paddr, size, attr) {
            Ok(()) => Some(vaddr),
            Err(_) => {
                self.linear.release(vaddr);
                None
            }
        }
    }

    /// Reserve a linear range here and share the frames that back
    /// `src_vaddr..+size` in `src`.
    pub fn map_existing_pages(
        &self,
        src: &PageManager,
        src_vaddr: VirtAddr,
        size: usize,
        attr: PageAttr,
    ) -> Option<VirtAddr> {
        let size = page_round_up(size);
        let vaddr = self.linear.allocate_or_extend(size, self.ctx())?;
        match self
            .page
            .map_existing(self.physical, src, vaddr, src_vaddr, size, attr)
        {
            Ok(()) => Some(vaddr),
            Err(_) => {
                self.linear.release(vaddr);
                None
            }
        }
    }

    /// Release a known-valid allocation. Panics on addresses this space
    /// does not own; use [`check_and_unmap_pages`](Self::check_and_unmap_pages)
    /// for caller-supplied handles.
    pub fn unmap_pages(&self, vaddr: VirtAddr) {
        let size = self.linear.allocated_size(vaddr);
        self.page.unmap(self.physical, vaddr, size);
        self.linear.release(vaddr);
    }

    /// Validated release: false for addresses that are not an allocated
    /// block of this space (including double releases).
    pub fn check_and_unmap_pages(&self, vaddr: VirtAddr) -> bool {
        self.linear.check_and_unmap(vaddr, self.ctx())
    }

    /// Physical frame behind `vaddr`, provided the address lies in a live
    /// allocation of this space.
    pub fn translate(&self, vaddr: VirtAddr) -> Option<PhysAddr> {
        if !self.linear.is_using(vaddr) {
            return None;
        }
        let aligned = VirtAddr::new(vaddr.as_u32() & !(PAGE_SIZE as u32 - 1));
        self.page.translate(aligned, PageAttr::PRESENT)
    }

    pub fn linear_free_size(&self) -> usize {
        self.linear.free_size()
    }

    /// Tear down every allocation. Single-threaded; the space must still be
    /// the active one so its own metadata stays reachable.
    pub fn release_all(&self) {
        self.linear.release_all(self.ctx());
    }
}

// ---------------------------------------------------------------------------
// User-space layout
// ---------------------------------------------------------------------------

#[cfg(target_arch = "x86")]
mod user_layout {
    use super::super::buddy::Header;
    use super::super::linear::LinearBlock;
    use super::super::{page_round_up, MIN_BLOCK_SIZE, PAGE_SIZE, USER_LINEAR_END};

    /// Worst-case header array for a heap spanning the whole user window.
    pub const MANAGER_BYTES: usize = page_round_up(
        (USER_LINEAR_END as usize / MIN_BLOCK_SIZE) * core::mem::size_of::<Header<LinearBlock>>(),
    );

    /// The header array sits at the top of the user window, growing a
    /// backing page at a time as the heap below it grows.
    pub const MANAGER_ADDRESS: u32 = (USER_LINEAR_END as usize - MANAGER_BYTES) as u32;

    /// User heap: everything between the guard page and the header array.
    pub const HEAP_BEGIN: u32 = PAGE_SIZE as u32;
    pub const HEAP_END: u32 = MANAGER_ADDRESS;
}

/// A fresh user address space: kernel window shared by directory-entry
/// copy, empty user window, self-extending heap accounting whose headers
/// live at the top of the user window.
///
/// The linear manager starts with zero blocks, so nothing touches user
/// memory until the first allocation — which the owning task itself makes,
/// with its own tables loaded.
pub fn new_user_space(kernel_space: &'static AddressSpace) -> Option<AddressSpace> {
    #[cfg(target_arch = "x86")]
    {
        use super::linear::HeaderBacking;
        let page = PageManager::new_user(kernel_space, VirtAddr::new(user_layout::MANAGER_ADDRESS))?;
        let linear = unsafe {
            LinearBlockManager::with_backing(
                user_layout::MANAGER_ADDRESS as usize as *mut _,
                user_layout::HEAP_BEGIN,
                user_layout::HEAP_BEGIN,
                user_layout::HEAP_END,
                HeaderBacking::Mapped {
                    mapped_end: user_layout::MANAGER_ADDRESS,
                },
            )
        };
        Some(AddressSpace::new(kernel_space.physical, page, linear))
    }
    #[cfg(not(target_arch = "x86"))]
    {
        // host rendition: a modest resident heap window
        use super::buddy::host::alloc_header_array;
        const HEAP_PAGES: usize = 1024;
        let page = PageManager::new_user(kernel_space, VirtAddr::new(0xBF00_0000))?;
        let headers = alloc_header_array(HEAP_PAGES);
        let begin = PAGE_SIZE as u32;
        let end = begin + (HEAP_PAGES * PAGE_SIZE) as u32;
        let linear = unsafe { LinearBlockManager::new(headers, begin, begin, end) };
        Some(AddressSpace::new(kernel_space.physical, page, linear))
    }
}

// ---------------------------------------------------------------------------
// Task memory
// ---------------------------------------------------------------------------

enum SpaceKind {
    /// The kernel space, shared by every kernel-only task.
    Kernel,
    User(AddressSpace),
}

/// Reference-counted ownership of an address space by tasks.
///
/// The count tracks tasks, not clones: creation and every share increment,
/// task exit decrements, and the transition to zero tears the user space
/// down in two steps — linear blocks first, then (with the caller already
/// off this CR3) the user leaf tables and directory.
pub struct TaskMemory {
    references: SpinLock<u32>,
    kind: SpaceKind,
}

impl TaskMemory {
    pub fn kernel() -> Arc<TaskMemory> {
        static KERNEL: conquer_once::spin::OnceCell<Arc<TaskMemory>> =
            conquer_once::spin::OnceCell::uninit();
        KERNEL
            .get_or_init(|| {
                Arc::new(TaskMemory {
                    references: SpinLock::new(0),
                    kind: SpaceKind::Kernel,
                })
            })
            .clone()
    }

    pub fn new_user(kernel_space: &'static AddressSpace) -> Option<Arc<TaskMemory>> {
        Some(Arc::new(TaskMemory {
            references: SpinLock::new(0),
            kind: SpaceKind::User(new_user_space(kernel_space)?),
        }))
    }

    pub fn space(&self) -> &AddressSpace {
        match &self.kind {
            SpaceKind::Kernel => crate::memory::kernel_space(),
            SpaceKind::User(space) => space,
        }
    }

    pub fn is_kernel(&self) -> bool {
        matches!(self.kind, SpaceKind::Kernel)
    }

    pub fn cr3(&self) -> u32 {
        self.space().page().cr3()
    }

    pub fn add_reference(&self) {
        *self.references.lock() += 1;
    }

    /// Drop one task's reference. On the last one, release every user
    /// allocation — this must run while the space is still loaded, so its
    /// user-window metadata is reachable — then report that the caller has
    /// to leave the space and finish with [`release_tables`].
    #[must_use]
    pub fn remove_reference(&self) -> bool {
        let remaining = {
            let mut references = self.references.lock();
            assert!(*references > 0);
            *references -= 1;
            *references
        };
        if remaining > 0 {
            return false;
        }
        match &self.kind {
            SpaceKind::Kernel => false,
            SpaceKind::User(space) => {
                space.release_all();
                true
            }
        }
    }

    /// Final teardown step, after the last-reference holder switched to the
    /// kernel tables: free the user leaf tables and the directory.
    pub fn release_tables(&self) {
        let space = match &self.kind {
            SpaceKind::Kernel => panic!("kernel task memory is never torn down"),
            SpaceKind::User(space) => space,
        };
        debug_assert!(
            arch::read_cr3() != space.page().cr3(),
            "tearing down the loaded address space"
        );
        space.page().release_user_tables();
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::super::buddy::host::alloc_header_array;
    use super::super::physical;
    use super::super::{KERNEL_LINEAR_BEGIN, MIN_BLOCK_SIZE};
    use super::*;
    use alloc::boxed::Box;

    /// A leaked kernel-style space over host arenas: 16 MiB of fake frames,
    /// 16 MiB of kernel-window linear range.
    pub(crate) fn new_test_space() -> &'static AddressSpace {
        const ARENA_PAGES: usize = 4096;
        let physical = Box::leak(Box::new(physical::tests::new_manager(0, ARENA_PAGES)));
        let page = PageManager::new_kernel_for_test(physical);
        let headers = alloc_header_array(ARENA_PAGES);
        let begin = KERNEL_LINEAR_BEGIN;
        let end = begin + (ARENA_PAGES * MIN_BLOCK_SIZE) as u32;
        let linear = unsafe { LinearBlockManager::new(headers, begin, end, end) };
        linear.release_boot_range(VirtAddr::new(begin), VirtAddr::new(end));
        Box::leak(Box::new(AddressSpace::new(physical, page, linear)))
    }

    #[test]
    fn allocate_release_restores_free_sizes() {
        let space = new_test_space();
        let phys_before = space.physical().free_size();
        let linear_before = space.linear_free_size();

        let mut blocks = alloc::vec::Vec::new();
        for i in 0..50 {
            let size = (1 + i % 4) * PAGE_SIZE;
            blocks.push((space.allocate_pages(size, super::super::paging::KERNEL_PAGE).unwrap(), size));
        }
        for (vaddr, _) in blocks.iter().rev() {
            assert!(space.check_and_unmap_pages(*vaddr));
        }
        assert_eq!(space.physical().free_size(), phys_before);
        assert_eq!(space.linear_free_size(), linear_before);
    }

    #[test]
    fn translate_follows_the_block_lifecycle() {
        let space = new_test_space();
        let vaddr = space
            .allocate_pages(4 * PAGE_SIZE, super::super::paging::KERNEL_PAGE)
            .unwrap();
        for page_offset in 0..4u32 {
            assert!(space.translate(vaddr.offset(page_offset * PAGE_SIZE as u32)).is_some());
        }
        // interior, unaligned addresses translate through their page
        assert!(space.translate(vaddr.offset(PAGE_SIZE as u32 + 123)).is_some());
        assert!(space.check_and_unmap_pages(vaddr));
        assert!(space.translate(vaddr).is_none());
        // released blocks cannot be released twice
        assert!(!space.check_and_unmap_pages(vaddr));
    }

    #[test]
    fn user_space_lifecycle_returns_every_frame() {
        let kernel = new_test_space();
        let task_memory = TaskMemory::new_user(kernel).unwrap();
        task_memory.add_reference();
        let phys_before = kernel.physical().free_size();

        let space = task_memory.space();
        let a = space
            .allocate_pages(8 * PAGE_SIZE, super::super::paging::USER_WRITABLE_PAGE)
            .unwrap();
        let b = space
            .allocate_pages(PAGE_SIZE, super::super::paging::USER_WRITABLE_PAGE)
            .unwrap();
        assert_ne!(a, b);
        assert!(space.translate(a).is_some());

        let last = task_memory.remove_reference();
        assert!(last);
        task_memory.release_tables();
        // every data frame plus the table frames came back; the directory
        // frame too
        assert!(kernel.physical().free_size() >= phys_before);
    }
}
