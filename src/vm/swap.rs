//! Swap transfer capability
//!
//! Anonymous pages that are not resident live in swap slots. The VM
//! layer only needs to move a page in or out and to account for slots;
//! the on-disk layout belongs to the swap device.

use core::fmt;

use crate::vm::pmap::PhysAddr;
use crate::vm::vm_object::PagerStatus;

/// A page-sized location on the swap device
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SwapSlot(pub u32);

impl fmt::Display for SwapSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "swslot#{}", self.0)
    }
}

/// Swap device interface
pub trait SwapPager: Send + Sync {
    /// Read `slot` into the page at `pa`
    fn get(&self, pa: PhysAddr, slot: SwapSlot, sync: bool) -> PagerStatus;

    /// Allocate a slot and write the page at `pa` to it; `None` when swap
    /// is full or the write failed.
    fn put(&self, pa: PhysAddr, sync: bool) -> Option<SwapSlot>;

    /// Never hand out `count` slots from `slot` again, and fail reads of them
    fn mark_bad(&self, slot: SwapSlot, count: u32);

    /// Return `count` slots from `slot` to the free pool
    fn free(&self, slot: SwapSlot, count: u32);

    /// Slots in use
    fn used(&self) -> u32;

    /// Total slots
    fn capacity(&self) -> u32;

    /// True when no slot can be allocated
    fn is_full(&self) -> bool {
        self.used() >= self.capacity()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vm::soft_pmap::SoftMmu;
    use crate::vm::testutil::MemSwap;

    #[test]
    fn test_put_get_roundtrip_and_full() {
        let mmu = SoftMmu::new();
        let swap = MemSwap::new(mmu.clone(), 1);
        mmu.write_phys(0x1000, b"swapped");

        let slot = swap.put(0x1000, true).unwrap();
        assert!(swap.is_full());
        assert!(swap.put(0x2000, true).is_none());

        assert_eq!(swap.get(0x3000, slot, true), PagerStatus::Ok);
        assert_eq!(&mmu.read_phys(0x3000)[..7], b"swapped");

        swap.free(slot, 1);
        assert!(!swap.is_full());
    }

    #[test]
    fn test_bad_slot_fails_reads() {
        let mmu = SoftMmu::new();
        let swap = MemSwap::new(mmu, 4);
        let slot = swap.put(0x1000, true).unwrap();
        swap.mark_bad(slot, 1);
        assert_eq!(swap.get(0x2000, slot, true), PagerStatus::Error);
        assert_eq!(alloc::format!("{}", slot), alloc::format!("swslot#{}", slot.0));
    }
}
