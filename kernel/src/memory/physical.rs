//! Physical frame accounting: the buddy allocator specialised with a
//! per-frame reference count.
//!
//! `count == 0` iff the frame is free. A fresh allocation starts every
//! frame it covers at 1; shared mappings increment; release decrements and
//! returns the frame to the buddy on the transition to 0. Addresses outside
//! the managed range (BIOS-fixed regions, memory-mapped devices) are
//! accepted and ignored so device mappings flow through the same paths.

use super::buddy::{BlockPayload, BuddyAllocator, Header};
use super::{PhysAddr, PAGE_SIZE};
use crate::spinlock::SpinLock;

const MAX_REFERENCE_COUNT: u32 = u32::MAX;

pub struct PhysBlock {
    reference_count: u32,
}

impl BlockPayload for PhysBlock {
    fn new() -> Self {
        // starts referenced; the boot code releases the usable ranges
        Self { reference_count: 1 }
    }
}

/// "cannot share": the frame already carries the maximum reference count.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShareLimitExceeded;

pub struct PhysicalBlockManager {
    inner: SpinLock<BuddyAllocator<PhysBlock>>,
}

impl PhysicalBlockManager {
    /// # Safety
    ///
    /// See [`BuddyAllocator::new`]; every block starts in-use with count 1
    /// and must be made usable via [`release`](Self::release).
    pub unsafe fn new(headers: *mut Header<PhysBlock>, begin: u32, end: u32) -> Self {
        Self {
            inner: SpinLock::new(BuddyAllocator::new(headers, begin, end)),
        }
    }

    /// Allocate `size` bytes of physically contiguous frames. Every 4 KiB
    /// frame in the range is tracked separately with its count pre-set to 1,
    /// so each one can be shared and released independently.
    pub fn allocate(&self, size: usize) -> Option<PhysAddr> {
        let mut buddy = self.inner.lock();
        let first = buddy.allocate(size, PAGE_SIZE)?;
        let chunk_count = size.div_ceil(PAGE_SIZE);
        for chunk in 0..chunk_count {
            let payload = buddy.payload_mut(first + chunk);
            debug_assert_eq!(payload.reference_count, 0);
            payload.reference_count = 1;
        }
        Some(PhysAddr::new(buddy.index_to_address(first)))
    }

    /// Take one more reference to a mapped frame.
    ///
    /// Out-of-range addresses succeed: they denote firmware or device
    /// memory that the manager does not account for.
    pub fn add_reference(&self, address: PhysAddr) -> Result<(), ShareLimitExceeded> {
        let mut buddy = self.inner.lock();
        let index = match buddy.address_to_index(address.as_u32()) {
            Some(index) => index,
            None => return Ok(()),
        };
        let payload = buddy.payload_mut(index);
        assert!(payload.reference_count > 0, "sharing an unreferenced frame");
        if payload.reference_count == MAX_REFERENCE_COUNT {
            return Err(ShareLimitExceeded);
        }
        payload.reference_count += 1;
        Ok(())
    }

    /// Drop one reference; the frame returns to the buddy at zero.
    pub fn release(&self, address: PhysAddr) {
        let mut buddy = self.inner.lock();
        let index = match buddy.address_to_index(address.as_u32()) {
            Some(index) => index,
            None => return,
        };
        let payload = buddy.payload_mut(index);
        assert!(payload.reference_count > 0, "releasing an unreferenced frame");
        payload.reference_count -= 1;
        if payload.reference_count == 0 {
            buddy.release(index);
        }
    }

    pub fn free_size(&self) -> usize {
        self.inner.lock().free_size()
    }

    pub fn block_count(&self) -> usize {
        self.inner.lock().block_count()
    }

    pub fn begin_address(&self) -> PhysAddr {
        PhysAddr::new(self.inner.lock().begin_address())
    }

    /// Current reference count, `None` when out of range. Diagnostic only.
    pub fn reference_count(&self, address: PhysAddr) -> Option<u32> {
        let buddy = self.inner.lock();
        let index = buddy.address_to_index(address.as_u32())?;
        Some(buddy.payload(index).reference_count)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::super::buddy::host::alloc_header_array;
    use super::super::MIN_BLOCK_SIZE;
    use super::*;

    pub fn new_manager(begin: u32, pages: usize) -> PhysicalBlockManager {
        let headers = alloc_header_array::<PhysBlock>(pages);
        let end = begin + (pages * MIN_BLOCK_SIZE) as u32;
        let manager = unsafe { PhysicalBlockManager::new(headers, begin, end) };
        for page in 0..pages {
            manager.release(PhysAddr::new(begin + (page * MIN_BLOCK_SIZE) as u32));
        }
        manager
    }

    #[test]
    fn fresh_allocations_start_at_one() {
        let manager = new_manager(0x100000, 16);
        let addr = manager.allocate(PAGE_SIZE * 2).unwrap();
        assert_eq!(manager.reference_count(addr), Some(1));
        assert_eq!(
            manager.reference_count(addr.offset(PAGE_SIZE as u32)),
            Some(1)
        );
    }

    #[test]
    fn release_frees_only_at_zero() {
        let manager = new_manager(0x100000, 8);
        let before = manager.free_size();
        let addr = manager.allocate(PAGE_SIZE).unwrap();
        manager.add_reference(addr).unwrap();
        manager.release(addr);
        // still referenced by the second mapping
        assert_eq!(manager.reference_count(addr), Some(1));
        assert_eq!(manager.free_size(), before - PAGE_SIZE);
        manager.release(addr);
        assert_eq!(manager.reference_count(addr), Some(0));
        assert_eq!(manager.free_size(), before);
    }

    #[test]
    fn out_of_range_sharing_succeeds() {
        let manager = new_manager(0x100000, 8);
        // firmware-fixed address below the managed range
        assert!(manager.add_reference(PhysAddr::new(0xB8000)).is_ok());
        manager.release(PhysAddr::new(0xB8000));
    }

    #[test]
    fn share_limit_is_reported() {
        let manager = new_manager(0x100000, 8);
        let addr = manager.allocate(PAGE_SIZE).unwrap();
        // force the counter to the cap through the internal state
        {
            let mut buddy = manager.inner.lock();
            let index = buddy.address_to_index(addr.as_u32()).unwrap();
            buddy.payload_mut(index).reference_count = MAX_REFERENCE_COUNT;
        }
        assert_eq!(manager.add_reference(addr), Err(ShareLimitExceeded));
    }
}
