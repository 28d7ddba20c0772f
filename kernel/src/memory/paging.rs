//! Two-level i686 page tables.
//!
//! Every address space owns a `PageManager`: the physical address of its
//! page directory plus kernel-view pointers to the directory and its leaf
//! tables. Kernel-window directory entries are created once at boot and
//! copied by reference into every new address space, so kernel mappings are
//! identical everywhere at every instant. User-window leaf tables are
//! allocated lazily on the first mapping that lands in their range and are
//! owned by their manager.
//!
//! Entry installs run under hash-sharded directory locks; the entries
//! themselves are written volatile and never locked, because the linear
//! manager already serialises ownership of every mapped range.

use bitflags::bitflags;
use core::array;
use core::ptr;
use core::sync::atomic::{AtomicPtr, Ordering};

use super::address_space::AddressSpace;
use super::physical::PhysicalBlockManager;
use super::{is_kernel_address, tlb, PhysAddr, VirtAddr, KERNEL_LINEAR_BEGIN, KERNEL_LINEAR_END, PAGE_SIZE};
use crate::spinlock::RawSpinLock;

pub const PAGE_TABLE_LEN: usize = 1024;

const PD_LOCK_COUNT: usize = 8;

bitflags! {
    #[derive(Clone, Copy, PartialEq, Eq, Debug)]
    pub struct PageAttr: u32 {
        const PRESENT = 1 << 0;
        const WRITABLE = 1 << 1;
        const USER = 1 << 2;
        const WRITE_THROUGH = 1 << 3;
        const NO_CACHE = 1 << 4;
        const ACCESSED = 1 << 5;
        const DIRTY = 1 << 6;
        const GLOBAL = 1 << 8;
    }
}

pub const KERNEL_PAGE: PageAttr = PageAttr::PRESENT.union(PageAttr::WRITABLE);
pub const KERNEL_NON_CACHED_PAGE: PageAttr = KERNEL_PAGE.union(PageAttr::NO_CACHE);
pub const USER_READ_ONLY_PAGE: PageAttr = PageAttr::PRESENT.union(PageAttr::USER);
pub const USER_WRITABLE_PAGE: PageAttr = USER_READ_ONLY_PAGE.union(PageAttr::WRITABLE);

#[derive(Clone, Copy, PartialEq, Eq)]
#[repr(transparent)]
struct Entry(u32);

impl Entry {
    const fn empty() -> Self {
        Self(0)
    }

    fn new(address: PhysAddr, attr: PageAttr) -> Self {
        debug_assert!(address.is_page_aligned());
        Self(address.as_u32() | (attr.bits() & 0xFFF))
    }

    fn address(self) -> PhysAddr {
        PhysAddr::new(self.0 & !0xFFF)
    }

    fn attr(self) -> PageAttr {
        PageAttr::from_bits_truncate(self.0 & 0xFFF)
    }

    fn present(self) -> bool {
        self.attr().contains(PageAttr::PRESENT)
    }

    fn cleared_present(self) -> Self {
        // keep the frame address; phase 2 of unmap still needs it
        Self(self.0 & !PageAttr::PRESENT.bits())
    }
}

#[repr(C, align(4096))]
pub struct PageTable {
    entries: [Entry; PAGE_TABLE_LEN],
}

impl PageTable {
    fn zero(table: *mut PageTable) {
        unsafe { ptr::write_bytes(table as *mut u8, 0, PAGE_SIZE) };
    }
}

fn entry_ptr(table: *mut PageTable, index: usize) -> *mut Entry {
    debug_assert!(index < PAGE_TABLE_LEN);
    unsafe { (table as *mut Entry).add(index) }
}

fn read_entry(table: *mut PageTable, index: usize) -> Entry {
    unsafe { ptr::read_volatile(entry_ptr(table, index)) }
}

fn write_entry(table: *mut PageTable, index: usize, entry: Entry) {
    unsafe { ptr::write_volatile(entry_ptr(table, index), entry) };
}

pub fn pd_index(vaddr: VirtAddr) -> usize {
    (vaddr.as_u32() >> 22) as usize
}

pub fn pt_index(vaddr: VirtAddr) -> usize {
    ((vaddr.as_u32() >> 12) & (PAGE_TABLE_LEN as u32 - 1)) as usize
}

/// Where a manager's leaf tables come from.
pub enum PtSource {
    /// Kernel manager: the full kernel-window table set is built at boot in
    /// reserved memory and never grows.
    Static,
    /// User managers: leaf tables are kernel pages taken from this space.
    KernelPages(&'static AddressSpace),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MapError {
    OutOfFrames,
    NotMapped,
    ShareLimit,
}

pub struct PageManager {
    physical_pd: PhysAddr,
    pd: *mut PageTable,
    /// Kernel-view pointer of each leaf table, null while the directory
    /// entry is not present.
    pts: [AtomicPtr<PageTable>; PAGE_TABLE_LEN],
    pd_locks: [RawSpinLock; PD_LOCK_COUNT],
    pt_source: PtSource,
    /// The manager owning the kernel window's tables; `None` for the kernel
    /// manager itself.
    kernel: Option<&'static PageManager>,
    /// Where this address space expects its table set to be visible from
    /// user mode. Bookkeeping for the user-space runtime; the kernel never
    /// reads entries through it.
    user_view: Option<VirtAddr>,
}

// SAFETY: shared mutation is confined to volatile entry writes under the
// shard locks and atomic view pointers.
unsafe impl Send for PageManager {}
unsafe impl Sync for PageManager {}

impl PageManager {
    /// Build the kernel manager inside the reserved boot window.
    ///
    /// `virt_to_phys` is the boot-time identity-offset translation of the
    /// reserved region. The directory and one leaf table per kernel-window
    /// slot are laid out contiguously at `table_base`.
    ///
    /// # Safety
    ///
    /// `table_base..region_end` must be mapped, page-aligned, unused
    /// memory inside the reserved window.
    #[cfg(target_arch = "x86")]
    pub unsafe fn new_kernel_at(
        table_base: u32,
        region_end: u32,
        physical: &PhysicalBlockManager,
        virt_to_phys: impl Fn(u32) -> PhysAddr,
    ) -> Self {
        let kernel_slots = pd_index(VirtAddr::new(KERNEL_LINEAR_END - 1))
            - pd_index(VirtAddr::new(KERNEL_LINEAR_BEGIN))
            + 1;
        assert!(table_base % PAGE_SIZE as u32 == 0);
        assert!(table_base + ((1 + kernel_slots) * PAGE_SIZE) as u32 <= region_end);

        let pd = table_base as *mut PageTable;
        PageTable::zero(pd);
        let manager = Self {
            physical_pd: virt_to_phys(table_base),
            pd,
            pts: array::from_fn(|_| AtomicPtr::new(ptr::null_mut())),
            pd_locks: array::from_fn(|_| RawSpinLock::new()),
            pt_source: PtSource::Static,
            kernel: None,
            user_view: None,
        };

        let first_slot = pd_index(VirtAddr::new(KERNEL_LINEAR_BEGIN));
        for slot in 0..kernel_slots {
            let table = (table_base + ((1 + slot) * PAGE_SIZE) as u32) as *mut PageTable;
            PageTable::zero(table);
            let table_phys = virt_to_phys(table as u32);
            write_entry(pd, first_slot + slot, Entry::new(table_phys, KERNEL_PAGE));
            manager.pts[first_slot + slot].store(table, Ordering::Release);
        }

        // identity-offset map the kernel image and the reserved window, and
        // account a reference for every frame now reachable through it
        let mut vaddr = KERNEL_LINEAR_BEGIN;
        while vaddr < region_end {
            let frame = virt_to_phys(vaddr);
            let _ = physical.add_reference(frame);
            assert!(manager.install(VirtAddr::new(vaddr), frame, KERNEL_PAGE));
            vaddr += PAGE_SIZE as u32;
        }
        manager
    }

    /// Host-side kernel manager for unit tests: directory and kernel-window
    /// tables come from host memory, frame numbers from `physical`.
    #[cfg(not(target_arch = "x86"))]
    pub fn new_kernel_for_test(physical: &PhysicalBlockManager) -> Self {
        let pd = alloc_table_storage();
        let pd_phys = physical
            .allocate(PAGE_SIZE)
            .expect("test arena exhausted building kernel tables");
        let manager = Self {
            physical_pd: pd_phys,
            pd,
            pts: array::from_fn(|_| AtomicPtr::new(ptr::null_mut())),
            pd_locks: array::from_fn(|_| RawSpinLock::new()),
            pt_source: PtSource::Static,
            kernel: None,
            user_view: None,
        };
        let first_slot = pd_index(VirtAddr::new(KERNEL_LINEAR_BEGIN));
        let last_slot = pd_index(VirtAddr::new(KERNEL_LINEAR_END - 1));
        for slot in first_slot..=last_slot {
            let table = alloc_table_storage();
            let table_phys = physical
                .allocate(PAGE_SIZE)
                .expect("test arena exhausted building kernel tables");
            write_entry(manager.pd, slot, Entry::new(table_phys, KERNEL_PAGE));
            manager.pts[slot].store(table, Ordering::Release);
        }
        manager
    }

    /// A fresh user address space: one directory page with the kernel
    /// window's entries copied by reference from the kernel manager.
    pub fn new_user(kernel_space: &'static AddressSpace, user_view: VirtAddr) -> Option<Self> {
        let (pd, pd_phys) = allocate_table(kernel_space)?;
        let kernel_manager = kernel_space.page();
        let first_slot = pd_index(VirtAddr::new(KERNEL_LINEAR_BEGIN));
        let last_slot = pd_index(VirtAddr::new(KERNEL_LINEAR_END - 1));
        for slot in first_slot..=last_slot {
            let entry = read_entry(kernel_manager.pd, slot);
            debug_assert!(entry.present());
            write_entry(pd, slot, entry);
        }
        Some(Self {
            physical_pd: pd_phys,
            pd,
            pts: array::from_fn(|_| AtomicPtr::new(ptr::null_mut())),
            pd_locks: array::from_fn(|_| RawSpinLock::new()),
            pt_source: PtSource::KernelPages(kernel_space),
            kernel: Some(kernel_manager),
            user_view: Some(user_view),
        })
    }

    /// The value this address space loads into CR3.
    pub fn cr3(&self) -> u32 {
        self.physical_pd.as_u32()
    }

    pub fn user_view(&self) -> Option<VirtAddr> {
        self.user_view
    }

    fn shard_lock(&self, vaddr: VirtAddr) -> &RawSpinLock {
        &self.pd_locks[pd_index(vaddr) % PD_LOCK_COUNT]
    }

    fn leaf_table(&self, vaddr: VirtAddr) -> *mut PageTable {
        if is_kernel_address(vaddr) {
            if let Some(kernel) = self.kernel {
                return kernel.leaf_table(vaddr);
            }
        }
        self.pts[pd_index(vaddr)].load(Ordering::Acquire)
    }

    /// Install one present entry, creating the leaf table on demand.
    ///
    /// Returns false if the table could not be allocated; the caller rolls
    /// the surrounding range back.
    fn install(&self, vaddr: VirtAddr, frame: PhysAddr, attr: PageAttr) -> bool {
        debug_assert!(vaddr.is_page_aligned() && frame.is_page_aligned());
        if is_kernel_address(vaddr) {
            if let Some(kernel) = self.kernel {
                return kernel.install(vaddr, frame, attr);
            }
        }
        let slot = pd_index(vaddr);
        let lock = self.shard_lock(vaddr);
        lock.acquire();
        let mut table = self.pts[slot].load(Ordering::Acquire);
        if table.is_null() {
            let space = match self.pt_source {
                PtSource::KernelPages(space) => space,
                PtSource::Static => {
                    // kernel-window tables all exist since boot
                    unreachable!("missing leaf table in the static kernel set")
                }
            };
            match allocate_table(space) {
                Some((new_table, table_phys)) => {
                    // user and writable at every level; the leaf entry is
                    // what actually restricts the access
                    write_entry(self.pd, slot, Entry::new(table_phys, USER_WRITABLE_PAGE));
                    self.pts[slot].store(new_table, Ordering::Release);
                    table = new_table;
                }
                None => {
                    lock.release();
                    return false;
                }
            }
        }
        lock.release();
        write_entry(table, pt_index(vaddr), Entry::new(frame, attr | PageAttr::PRESENT));
        true
    }

    /// Map `size` bytes at `vaddr` onto freshly allocated frames, each with
    /// reference count 1. Rolls back everything installed by this call on
    /// failure.
    pub fn map(
        &self,
        physical: &PhysicalBlockManager,
        vaddr: VirtAddr,
        size: usize,
        attr: PageAttr,
    ) -> Result<(), MapError> {
        debug_assert_eq!(size % PAGE_SIZE, 0);
        let mut offset = 0;
        while offset < size {
            let frame = match physical.allocate(PAGE_SIZE) {
                Some(frame) => frame,
                None => break,
            };
            if !self.install(vaddr.offset(offset as u32), frame, attr) {
                physical.release(frame);
                break;
            }
            offset += PAGE_SIZE;
        }
        if offset >= size {
            Ok(())
        } else {
            self.unmap(physical, vaddr, offset);
            Err(MapError::OutOfFrames)
        }
    }

    /// Map `size` bytes at `vaddr` onto the given physical range, taking a
    /// reference on every in-range frame.
    pub fn map_to(
        &self,
        physical: &PhysicalBlockManager,
        vaddr: VirtAddr,
        paddr: PhysAddr,
        size: usize,
        attr: PageAttr,
    ) -> Result<(), MapError> {
        debug_assert_eq!(size % PAGE_SIZE, 0);
        let mut offset = 0;
        while offset < size {
            let frame = paddr.offset(offset as u32);
            if physical.add_reference(frame).is_err() {
                break;
            }
            if !self.install(vaddr.offset(offset as u32), frame, attr) {
                physical.release(frame);
                break;
            }
            offset += PAGE_SIZE;
        }
        if offset >= size {
            Ok(())
        } else {
            self.unmap(physical, vaddr, offset);
            Err(MapError::OutOfFrames)
        }
    }

    /// Copy `src`'s mappings of `src_vaddr..+size` into this manager at
    /// `dst_vaddr`, sharing the underlying frames. A partial install is
    /// rolled back.
    pub fn map_existing(
        &self,
        physical: &PhysicalBlockManager,
        src: &PageManager,
        dst_vaddr: VirtAddr,
        src_vaddr: VirtAddr,
        size: usize,
        attr: PageAttr,
    ) -> Result<(), MapError> {
        debug_assert_eq!(size % PAGE_SIZE, 0);
        let mut offset = 0;
        let mut error = MapError::OutOfFrames;
        while offset < size {
            let frame = match src.translate(src_vaddr.offset(offset as u32), PageAttr::PRESENT) {
                Some(frame) => frame,
                None => {
                    error = MapError::NotMapped;
                    break;
                }
            };
            if physical.add_reference(frame).is_err() {
                error = MapError::ShareLimit;
                break;
            }
            if !self.install(dst_vaddr.offset(offset as u32), frame, attr) {
                physical.release(frame);
                break;
            }
            offset += PAGE_SIZE;
        }
        if offset >= size {
            Ok(())
        } else {
            self.unmap(physical, dst_vaddr, offset);
            Err(error)
        }
    }

    /// Two-pass unmap: clear every present bit, shoot the range out of all
    /// TLBs, then release the frames still recorded in the invalidated
    /// entries.
    pub fn unmap(&self, physical: &PhysicalBlockManager, vaddr: VirtAddr, size: usize) {
        debug_assert_eq!(size % PAGE_SIZE, 0);
        if size == 0 {
            return;
        }
        let mut offset = size;
        while offset > 0 {
            offset -= PAGE_SIZE;
            let page = vaddr.offset(offset as u32);
            let table = self.leaf_table(page);
            assert!(!table.is_null(), "unmapping without a leaf table");
            let index = pt_index(page);
            let entry = read_entry(table, index);
            assert!(entry.present(), "unmapping a non-present page");
            write_entry(table, index, entry.cleared_present());
        }

        tlb::shootdown(self.cr3(), vaddr, size, is_kernel_address(vaddr));

        let mut offset = size;
        while offset > 0 {
            offset -= PAGE_SIZE;
            let page = vaddr.offset(offset as u32);
            let table = self.leaf_table(page);
            let entry = read_entry(table, pt_index(page));
            debug_assert!(!entry.present());
            physical.release(entry.address());
        }
    }

    /// Physical address behind `vaddr` when it is mapped with at least the
    /// given attributes.
    pub fn translate(&self, vaddr: VirtAddr, required: PageAttr) -> Option<PhysAddr> {
        let required = required | PageAttr::PRESENT;
        let table = self.leaf_table(vaddr);
        if table.is_null() {
            return None;
        }
        let entry = read_entry(table, pt_index(vaddr));
        if entry.attr().contains(required) {
            Some(entry.address())
        } else {
            None
        }
    }

    /// Tear down a user manager: release every user-window leaf table and
    /// the directory itself. The caller has already emptied the user
    /// mappings (release-all on the linear manager) and switched CR3 away.
    pub fn release_user_tables(&self) {
        let space = match self.pt_source {
            PtSource::KernelPages(space) => space,
            PtSource::Static => panic!("the kernel page manager is never torn down"),
        };
        let user_end_slot = pd_index(VirtAddr::new(KERNEL_LINEAR_BEGIN));
        for slot in 0..user_end_slot {
            let table = self.pts[slot].swap(ptr::null_mut(), Ordering::AcqRel);
            if table.is_null() {
                continue;
            }
            let entry = read_entry(self.pd, slot);
            debug_assert!(entry.present());
            write_entry(self.pd, slot, Entry::empty());
            release_table(space, table, entry.address());
        }
        release_table(space, self.pd, self.physical_pd);
    }
}

/// One zeroed, kernel-visible page table page plus its frame.
fn allocate_table(space: &AddressSpace) -> Option<(*mut PageTable, PhysAddr)> {
    #[cfg(target_arch = "x86")]
    {
        let view = space.allocate_pages(PAGE_SIZE, KERNEL_PAGE)?;
        let table = view.as_ptr::<PageTable>();
        PageTable::zero(table);
        let phys = space.translate(view)?;
        Some((table, phys))
    }
    #[cfg(not(target_arch = "x86"))]
    {
        // host tests: storage from the host heap, frame numbers from the
        // test arena
        let table = alloc_table_storage();
        let phys = space.physical().allocate(PAGE_SIZE)?;
        Some((table, phys))
    }
}

fn release_table(space: &AddressSpace, table: *mut PageTable, phys: PhysAddr) {
    #[cfg(target_arch = "x86")]
    {
        let _ = phys;
        let released = space.check_and_unmap_pages(VirtAddr::new(table as u32));
        assert!(released, "leaf table page was not releasable");
    }
    #[cfg(not(target_arch = "x86"))]
    {
        space.physical().release(phys);
        unsafe {
            alloc::alloc::dealloc(
                table as *mut u8,
                core::alloc::Layout::from_size_align(PAGE_SIZE, PAGE_SIZE).unwrap(),
            );
        }
    }
}

#[cfg(not(target_arch = "x86"))]
fn alloc_table_storage() -> *mut PageTable {
    let layout = core::alloc::Layout::from_size_align(PAGE_SIZE, PAGE_SIZE).unwrap();
    let ptr = unsafe { alloc::alloc::alloc_zeroed(layout) };
    assert!(!ptr.is_null());
    ptr as *mut PageTable
}

#[cfg(test)]
mod tests {
    use super::super::address_space::tests::new_test_space;
    use super::*;

    #[test]
    fn map_then_translate_round_trip() {
        let space = new_test_space();
        let page = space.page();
        let physical = space.physical();
        let vaddr = VirtAddr::new(KERNEL_LINEAR_BEGIN + 0x40_0000);
        page.map(physical, vaddr, 2 * PAGE_SIZE, KERNEL_PAGE).unwrap();
        let first = page.translate(vaddr, KERNEL_PAGE).unwrap();
        assert_eq!(physical.reference_count(first), Some(1));
        assert!(page
            .translate(vaddr.offset(PAGE_SIZE as u32), KERNEL_PAGE)
            .is_some());
        // attribute check is a conjunction: asking for USER on a
        // kernel-only page fails
        assert!(page.translate(vaddr, PageAttr::USER).is_none());
        page.unmap(physical, vaddr, 2 * PAGE_SIZE);
        assert!(page.translate(vaddr, PageAttr::PRESENT).is_none());
        assert_eq!(physical.reference_count(first), Some(0));
    }

    #[test]
    fn map_existing_shares_frames_and_rolls_back_cleanly() {
        let space = new_test_space();
        let page = space.page();
        let physical = space.physical();
        let src = VirtAddr::new(KERNEL_LINEAR_BEGIN + 0x50_0000);
        page.map(physical, src, 2 * PAGE_SIZE, KERNEL_PAGE).unwrap();
        let frame = page.translate(src, KERNEL_PAGE).unwrap();

        let dst = VirtAddr::new(KERNEL_LINEAR_BEGIN + 0x60_0000);
        page.map_existing(physical, page, dst, src, 2 * PAGE_SIZE, KERNEL_PAGE)
            .unwrap();
        assert_eq!(physical.reference_count(frame), Some(2));
        assert_eq!(page.translate(dst, KERNEL_PAGE), Some(frame));

        // unmapping the copy preserves the source mapping and its count
        page.unmap(physical, dst, 2 * PAGE_SIZE);
        assert_eq!(physical.reference_count(frame), Some(1));
        assert_eq!(page.translate(src, KERNEL_PAGE), Some(frame));

        // copying an unmapped source range fails without side effects
        let bad_src = VirtAddr::new(KERNEL_LINEAR_BEGIN + 0x70_0000);
        let err = page
            .map_existing(physical, page, dst, bad_src, PAGE_SIZE, KERNEL_PAGE)
            .unwrap_err();
        assert_eq!(err, MapError::NotMapped);
        assert!(page.translate(dst, PageAttr::PRESENT).is_none());

        page.unmap(physical, src, 2 * PAGE_SIZE);
    }

    #[test]
    fn user_manager_shares_kernel_window_tables() {
        let space = new_test_space();
        let user = PageManager::new_user(space, VirtAddr::new(0xBF00_0000)).unwrap();
        let physical = space.physical();

        // a kernel mapping made through the kernel manager is visible from
        // the user manager immediately
        let kaddr = VirtAddr::new(KERNEL_LINEAR_BEGIN + 0x80_0000);
        space
            .page()
            .map(physical, kaddr, PAGE_SIZE, KERNEL_PAGE)
            .unwrap();
        assert_eq!(
            user.translate(kaddr, KERNEL_PAGE),
            space.page().translate(kaddr, KERNEL_PAGE)
        );

        // a user mapping allocates a leaf table lazily and is private
        let uaddr = VirtAddr::new(0x0040_0000);
        user.map(physical, uaddr, PAGE_SIZE, USER_WRITABLE_PAGE).unwrap();
        let frame = user.translate(uaddr, USER_WRITABLE_PAGE).unwrap();
        assert_eq!(physical.reference_count(frame), Some(1));
        assert!(space.page().translate(uaddr, PageAttr::PRESENT).is_none());

        let free_before_teardown = physical.free_size();
        user.unmap(physical, uaddr, PAGE_SIZE);
        user.release_user_tables();
        // the user frame, the leaf table frame, and the directory frame all
        // came back
        assert_eq!(physical.free_size(), free_before_teardown + 3 * PAGE_SIZE);

        space.page().unmap(physical, kaddr, PAGE_SIZE);
    }
}
