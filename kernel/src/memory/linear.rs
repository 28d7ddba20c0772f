//! Virtual address-range accounting: the buddy allocator specialised with a
//! requested ("mapped") size and a release state per block.
//!
//! The manager is self-extending. When an allocation fails but more headers
//! would fit under the configured maximum, it grows its own header array —
//! one backing page per step, through the page-table manager — and retries.
//! A failed step leaves the manager consistent: the blocks added so far stay
//! usable and the allocation simply retries at whatever now fits.

use core::mem::size_of;

use super::buddy::{ceil_order, BlockPayload, BuddyAllocator, Header};
use super::paging::PageManager;
use super::physical::PhysicalBlockManager;
use super::{VirtAddr, MIN_BLOCK_ORDER, MIN_BLOCK_SIZE, PAGE_SIZE};
use crate::spinlock::SpinLock;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum BlockStatus {
    /// Free, or covered by a larger block that owns its range.
    FreeOrCovered,
    InUse,
    /// Being unmapped; not releasable a second time.
    Releasing,
}

pub struct LinearBlock {
    /// Bytes requested for this block; may be smaller than the buddy order.
    mapped_size: u32,
    status: BlockStatus,
}

impl BlockPayload for LinearBlock {
    fn new() -> Self {
        Self {
            mapped_size: 0,
            status: BlockStatus::InUse,
        }
    }
}

/// How the header array gets its backing memory.
pub enum HeaderBacking {
    /// Fully resident up to the maximum block count (the kernel manager's
    /// reserved window, or a test arena).
    Resident,
    /// Backed page by page out of a kernel virtual reservation.
    #[cfg(target_arch = "x86")]
    Mapped { mapped_end: u32 },
    /// Resident storage that refuses growth after a set number of headers,
    /// for exercising the partial-extension path.
    #[cfg(test)]
    TestLimit { headers_left: usize },
}

struct Inner {
    buddy: BuddyAllocator<LinearBlock>,
    backing: HeaderBacking,
    initial_block_count: usize,
    max_block_count: usize,
}

pub struct LinearBlockManager {
    inner: SpinLock<Inner>,
}

/// Page-map context for the self-extension path.
#[derive(Clone, Copy)]
pub struct ExtendContext<'a> {
    pub page: &'a PageManager,
    pub physical: &'a PhysicalBlockManager,
}

impl LinearBlockManager {
    /// # Safety
    ///
    /// `headers` must point to storage for `(max_end - begin) /
    /// MIN_BLOCK_SIZE` headers when the backing is `Resident`, or to the
    /// start of a kernel reservation of that capacity otherwise. Headers up
    /// to `(init_end - begin) / MIN_BLOCK_SIZE` must be writable
    /// immediately.
    pub unsafe fn new(
        headers: *mut Header<LinearBlock>,
        begin: u32,
        init_end: u32,
        max_end: u32,
    ) -> Self {
        Self::with_backing(headers, begin, init_end, max_end, HeaderBacking::Resident)
    }

    /// # Safety
    ///
    /// See [`new`](Self::new).
    pub unsafe fn with_backing(
        headers: *mut Header<LinearBlock>,
        begin: u32,
        init_end: u32,
        max_end: u32,
        backing: HeaderBacking,
    ) -> Self {
        assert!(begin <= init_end && init_end <= max_end);
        let buddy = BuddyAllocator::new(headers, begin, init_end);
        let initial_block_count = buddy.block_count();
        let max_block_count = ((max_end - begin) / MIN_BLOCK_SIZE as u32) as usize;
        Self {
            inner: SpinLock::new(Inner {
                buddy,
                backing,
                initial_block_count,
                max_block_count,
            }),
        }
    }

    /// Boot-time marking of an address range as allocatable. Blocks start
    /// in-use; this releases those inside `begin..end`.
    pub fn release_boot_range(&self, begin: VirtAddr, end: VirtAddr) {
        let mut inner = self.inner.lock();
        let mut addr = begin.as_u32();
        while addr < end.as_u32() {
            if let Some(index) = inner.buddy.address_to_index(addr) {
                debug_assert_eq!(inner.buddy.payload(index).status, BlockStatus::InUse);
                inner.buddy.payload_mut(index).status = BlockStatus::FreeOrCovered;
                inner.buddy.release(index);
            }
            addr += MIN_BLOCK_SIZE as u32;
        }
    }

    /// Reserve a range of at least `size` bytes, growing the header array
    /// if the buddy has no room but the configured maximum allows more.
    pub fn allocate_or_extend(&self, size: usize, ctx: ExtendContext<'_>) -> Option<VirtAddr> {
        debug_assert!(size % PAGE_SIZE == 0 && size > 0);
        let mut inner = self.inner.lock();
        let mut index = inner.buddy.allocate(size, size);
        if index.is_none() {
            let grow_by = inner.extend_block_count(size);
            if grow_by == 0 {
                return None;
            }
            // a partial extension is fine: retry with whatever was added
            let _ = inner.extend(grow_by, ctx);
            index = inner.buddy.allocate(size, size);
        }
        let index = index?;
        let payload = inner.buddy.payload_mut(index);
        debug_assert_eq!(payload.status, BlockStatus::FreeOrCovered);
        payload.status = BlockStatus::InUse;
        payload.mapped_size = size as u32;
        Some(VirtAddr::new(inner.buddy.index_to_address(index)))
    }

    /// Release a reservation without touching page tables. Rollback path
    /// for callers whose mapping step failed.
    pub fn release(&self, vaddr: VirtAddr) {
        let mut inner = self.inner.lock();
        let index = inner
            .buddy
            .address_to_index(vaddr.as_u32())
            .expect("releasing an address outside the managed range");
        let payload = inner.buddy.payload_mut(index);
        assert!(
            matches!(payload.status, BlockStatus::InUse | BlockStatus::Releasing),
            "releasing a block that is not allocated"
        );
        payload.status = BlockStatus::FreeOrCovered;
        payload.mapped_size = 0;
        inner.buddy.release(index);
    }

    /// Unmap and release one allocated block. Refuses (returns false) for
    /// addresses that are out of range, covered, free, or already being
    /// released — including a repeated release of the same block.
    pub fn check_and_unmap(&self, vaddr: VirtAddr, ctx: ExtendContext<'_>) -> bool {
        let mut inner = self.inner.lock();
        let index = match inner.buddy.address_to_index(vaddr.as_u32()) {
            Some(index) => index,
            None => return false,
        };
        if inner.buddy.payload(index).status != BlockStatus::InUse {
            return false;
        }
        let size = inner.buddy.payload(index).mapped_size as usize;
        assert!(size > 0 && size % PAGE_SIZE == 0, "linear block must align to pages");
        inner.buddy.payload_mut(index).status = BlockStatus::Releasing;
        drop(inner);

        // never hold the buddy lock across a page-table mutation
        ctx.page.unmap(ctx.physical, vaddr, size);

        let mut inner = self.inner.lock();
        debug_assert_eq!(inner.buddy.payload(index).status, BlockStatus::Releasing);
        let payload = inner.buddy.payload_mut(index);
        payload.status = BlockStatus::FreeOrCovered;
        payload.mapped_size = 0;
        inner.buddy.release(index);
        true
    }

    /// Requested size of the allocated block at `vaddr`.
    pub fn allocated_size(&self, vaddr: VirtAddr) -> usize {
        let inner = self.inner.lock();
        let index = inner
            .buddy
            .address_to_index(vaddr.as_u32())
            .expect("address outside the managed range");
        let size = inner.buddy.payload(index).mapped_size as usize;
        debug_assert!(size != 0 && size % PAGE_SIZE == 0);
        size
    }

    /// Whether `vaddr` lies inside a block that is currently in use,
    /// resolving covered headers to their covering block.
    pub fn is_using(&self, vaddr: VirtAddr) -> bool {
        let inner = self.inner.lock();
        let aligned = vaddr.as_u32() & !(MIN_BLOCK_SIZE as u32 - 1);
        match inner.buddy.address_to_index(aligned) {
            Some(index) => {
                let representative = inner.buddy.representative_of(index);
                inner.buddy.payload(representative).status == BlockStatus::InUse
            }
            None => false,
        }
    }

    /// Tear down every block and shrink back to the initial header count.
    /// Runs single-threaded, on the last reference to an address space.
    pub fn release_all(&self, ctx: ExtendContext<'_>) {
        let mut index = 0;
        loop {
            let (addr, step) = {
                let inner = self.inner.lock();
                if index >= inner.buddy.block_count() {
                    assert_eq!(index, inner.buddy.block_count());
                    break;
                }
                (
                    inner.buddy.index_to_address(index),
                    inner.buddy.block_size(index) / MIN_BLOCK_SIZE,
                )
            };
            // free and covered blocks refuse harmlessly; stale orders never
            // step over an in-use block
            let _ = self.check_and_unmap(VirtAddr::new(addr), ctx);
            index += step;
        }

        #[cfg(target_arch = "x86")]
        let growth = {
            let inner = self.inner.lock();
            match inner.backing {
                HeaderBacking::Mapped { mapped_end } => {
                    let initial_end = initial_headers_end(&inner);
                    (initial_end < mapped_end).then_some((initial_end, mapped_end))
                }
                _ => None,
            }
        };
        #[cfg(target_arch = "x86")]
        if let Some((begin, end)) = growth {
            ctx.page.unmap(ctx.physical, VirtAddr::new(begin), (end - begin) as usize);
        }

        let mut inner = self.inner.lock();
        let initial = inner.initial_block_count;
        inner.buddy.reset(initial);
        #[cfg(target_arch = "x86")]
        if let HeaderBacking::Mapped { ref mut mapped_end } = inner.backing {
            *mapped_end = initial_headers_end_raw(&inner.buddy, initial);
        }
    }

    pub fn free_size(&self) -> usize {
        self.inner.lock().buddy.free_size()
    }

    pub fn block_count(&self) -> usize {
        self.inner.lock().buddy.block_count()
    }

    pub fn max_block_count(&self) -> usize {
        self.inner.lock().max_block_count
    }
}

#[cfg(target_arch = "x86")]
fn initial_headers_end(inner: &Inner) -> u32 {
    initial_headers_end_raw(&inner.buddy, inner.initial_block_count)
}

#[cfg(target_arch = "x86")]
fn initial_headers_end_raw(buddy: &BuddyAllocator<LinearBlock>, initial: usize) -> u32 {
    let headers_begin = buddy.headers_end() as usize
        - buddy.block_count() * size_of::<Header<LinearBlock>>();
    let end = headers_begin + initial * size_of::<Header<LinearBlock>>();
    VirtAddr::new(end as u32).align_up(PAGE_SIZE as u32).as_u32()
}

impl Inner {
    /// How many headers to add so that a block of `size` fits, aligned so
    /// the new range merges into one buddy block. Zero when the request is
    /// oversized or the maximum is reached.
    fn extend_block_count(&self, size: usize) -> usize {
        let order = match ceil_order(size) {
            Some(order) => order,
            None => return 0,
        };
        let add = 1usize << (order - MIN_BLOCK_ORDER);
        let new_count = add + self.buddy.block_count().div_ceil(add) * add;
        if new_count > self.max_block_count {
            return 0;
        }
        new_count - self.buddy.block_count()
    }

    /// Grow by up to `count` headers, mapping backing pages as the array
    /// crosses page boundaries. Stops early if a mapping fails; everything
    /// added so far stays allocatable.
    fn extend(&mut self, count: usize, ctx: ExtendContext<'_>) -> bool {
        let _ = ctx;
        let target = self.buddy.block_count() + count;
        debug_assert!(target <= self.max_block_count);
        while self.buddy.block_count() < target {
            let needed_end = self.buddy.headers_end() as usize + size_of::<Header<LinearBlock>>();
            match self.backing {
                HeaderBacking::Resident => {}
                #[cfg(target_arch = "x86")]
                HeaderBacking::Mapped { ref mut mapped_end } => {
                    if needed_end > *mapped_end as usize {
                        // one page per step keeps failure rollback-free
                        if ctx
                            .page
                            .map(ctx.physical, VirtAddr::new(*mapped_end), PAGE_SIZE, super::paging::KERNEL_PAGE)
                            .is_err()
                        {
                            break;
                        }
                        *mapped_end += PAGE_SIZE as u32;
                    }
                }
                #[cfg(test)]
                HeaderBacking::TestLimit { ref mut headers_left } => {
                    let _ = needed_end;
                    if *headers_left == 0 {
                        break;
                    }
                    *headers_left -= 1;
                }
            }
            let index = self.buddy.push_block();
            let payload = self.buddy.payload_mut(index);
            payload.status = BlockStatus::FreeOrCovered;
            payload.mapped_size = 0;
            self.buddy.release(index);
        }
        self.buddy.block_count() >= target
    }
}

#[cfg(test)]
mod tests {
    use super::super::buddy::host::alloc_header_array;
    use super::super::physical;
    use super::*;

    fn test_ctx() -> (
        &'static PhysicalBlockManager,
        &'static PageManager,
    ) {
        use alloc::boxed::Box;
        // the kernel-window tables alone consume a few hundred frames
        let physical = Box::leak(Box::new(physical::tests::new_manager(0, 1024)));
        let page = Box::leak(Box::new(PageManager::new_kernel_for_test(physical)));
        (physical, page)
    }

    fn new_manager(begin: u32, init_pages: usize, max_pages: usize) -> LinearBlockManager {
        let headers = alloc_header_array::<LinearBlock>(max_pages);
        let init_end = begin + (init_pages * MIN_BLOCK_SIZE) as u32;
        let max_end = begin + (max_pages * MIN_BLOCK_SIZE) as u32;
        let manager = unsafe { LinearBlockManager::new(headers, begin, init_end, max_end) };
        manager.release_boot_range(VirtAddr::new(begin), VirtAddr::new(init_end));
        manager
    }

    #[test]
    fn reservations_are_page_aligned_and_in_range() {
        let begin = 0x1000_0000;
        let manager = new_manager(begin, 32, 32);
        let (physical, page) = test_ctx();
        let ctx = ExtendContext { page, physical };
        let addr = manager.allocate_or_extend(3 * PAGE_SIZE, ctx).unwrap();
        assert!(addr.is_page_aligned());
        assert!(addr.as_u32() >= begin);
        assert!(addr.as_u32() + 3 * PAGE_SIZE as u32 <= begin + 32 * PAGE_SIZE as u32);
        assert_eq!(manager.allocated_size(addr), 3 * PAGE_SIZE);
        assert!(manager.is_using(addr));
        assert!(manager.is_using(addr.offset(2 * PAGE_SIZE as u32)));
        manager.release(addr);
        assert!(!manager.is_using(addr));
    }

    #[test]
    fn extension_grows_to_the_configured_maximum_and_no_further() {
        let begin = 0x2000_0000;
        // starts empty, like a user heap
        let manager = new_manager(begin, 0, 16);
        let (physical, page) = test_ctx();
        let ctx = ExtendContext { page, physical };
        assert_eq!(manager.block_count(), 0);

        let first = manager.allocate_or_extend(4 * PAGE_SIZE, ctx).unwrap();
        assert_eq!(first.as_u32(), begin);
        assert_eq!(manager.block_count(), 4);

        // growing exactly to the configured maximum succeeds
        let _second = manager.allocate_or_extend(4 * PAGE_SIZE, ctx).unwrap();
        let third = manager.allocate_or_extend(8 * PAGE_SIZE, ctx).unwrap();
        assert_eq!(manager.block_count(), 16);
        // one more page does not fit
        assert!(manager.allocate_or_extend(PAGE_SIZE, ctx).is_none());

        manager.release(third);
        assert!(manager.allocate_or_extend(PAGE_SIZE, ctx).is_some());
    }

    #[test]
    fn partial_extension_still_serves_smaller_requests() {
        let begin = 0x3000_0000;
        let headers = alloc_header_array::<LinearBlock>(64);
        let manager = unsafe {
            LinearBlockManager::with_backing(
                headers,
                begin,
                begin,
                begin + 64 * PAGE_SIZE as u32,
                HeaderBacking::TestLimit { headers_left: 8 },
            )
        };
        let (physical, page) = test_ctx();
        let ctx = ExtendContext { page, physical };
        // wants 16 headers, only 8 can be added
        assert!(manager.allocate_or_extend(16 * PAGE_SIZE, ctx).is_none());
        // the partial growth is not lost
        let addr = manager.allocate_or_extend(8 * PAGE_SIZE, ctx).unwrap();
        assert_eq!(addr.as_u32(), begin);
    }

    #[test]
    fn covered_and_free_blocks_are_not_releasable() {
        let begin = 0x4000_0000;
        let manager = new_manager(begin, 16, 16);
        let (physical, page) = test_ctx();
        let ctx = ExtendContext { page, physical };
        let addr = manager.allocate_or_extend(4 * PAGE_SIZE, ctx).unwrap();
        // interior page of an allocation: covered, refused
        assert!(!manager.check_and_unmap(addr.offset(PAGE_SIZE as u32), ctx));
        // misaligned and out of range: refused
        assert!(!manager.check_and_unmap(VirtAddr::new(addr.as_u32() + 5), ctx));
        assert!(!manager.check_and_unmap(VirtAddr::new(0x5000_0000), ctx));
        manager.release(addr);
        // already free: refused
        assert!(!manager.check_and_unmap(addr, ctx));
    }
}
