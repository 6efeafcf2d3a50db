//! Page Daemon (Pageout)
//!
//! Based on Mach4 vm/vm_pageout.h/c by Avadis Tevanian, Jr. (1986)
//!
//! The page daemon keeps free memory available so that a fault waiting
//! for memory can make progress:
//! - Moves unreferenced active pages to the inactive queue
//! - Frees clean inactive pages
//! - Writes dirty anonymous pages to swap before freeing them
//! - Zeroes free pages ahead of demand when there is nothing to reclaim
//!
//! The daemon uses a two-handed clock algorithm:
//! - Front hand clears reference bits on active pages
//! - Back hand reclaims inactive pages still unreferenced
//!
//! A page is taken busy when it leaves its queue, so every page the
//! daemon looks at is placed again with `unbusy` or freed. Owners are
//! locked with `try_lock` only: the normal order is anon before page, and
//! the daemon already holds the page.

use spin::Mutex;

use crate::counter;
use crate::kern::counters::MachCounter;
use crate::vm::pmap::PhysAddr;
use crate::vm::vm_anon::Anon;
use crate::vm::vm_map::VmProt;
use crate::vm::vm_page::{PageId, PageOwner, Placement};
use crate::vm::VmSystem;

// ============================================================================
// Pageout Statistics
// ============================================================================

/// Pageout statistics
#[derive(Debug)]
pub struct PageoutStats {
    /// Pages scanned
    pub scanned: MachCounter,
    /// Pages reclaimed (freed)
    pub reclaimed: MachCounter,
    /// Pages written to swap
    pub cleaned: MachCounter,
    /// Pages moved to inactive
    pub deactivated: MachCounter,
    /// Pages reactivated (referenced while inactive, or not reclaimable)
    pub reactivated: MachCounter,
    /// Pages skipped (owner locked or loaned)
    pub skipped: MachCounter,
    /// Daemon passes
    pub wakeups: MachCounter,
}

impl PageoutStats {
    pub const fn new() -> Self {
        Self {
            scanned: MachCounter::new("pageout_scanned"),
            reclaimed: MachCounter::new("pageout_reclaimed"),
            cleaned: MachCounter::new("pageout_cleaned"),
            deactivated: MachCounter::new("pageout_deactivated"),
            reactivated: MachCounter::new("pageout_reactivated"),
            skipped: MachCounter::new("pageout_skipped"),
            wakeups: MachCounter::new("pageout_wakeups"),
        }
    }
}

impl Default for PageoutStats {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// Pageout Daemon
// ============================================================================

/// The page daemon
#[derive(Debug)]
pub struct PageoutDaemon {
    /// Serializes passes
    pass: Mutex<()>,

    /// Statistics
    pub stats: PageoutStats,
}

/// What the back hand did with one page
enum Verdict {
    Freed,
    Cleaned,
    Reactivate,
    Skip,
}

impl PageoutDaemon {
    pub const fn new() -> Self {
        Self {
            pass: Mutex::new(()),
            stats: PageoutStats::new(),
        }
    }

    /// Check if we need to reclaim pages
    pub fn needs_pages(&self, vm: &VmSystem) -> bool {
        vm.pages.is_memory_low() || !vm.pages.can_alloc()
    }

    /// Run one pass of the page daemon. Without `force` the pass only
    /// reclaims when the registry is short of free or inactive pages; an
    /// idle pass zeroes up to `idle_zero_batch` free pages instead.
    ///
    /// Returns the number of pages reclaimed
    pub fn run_iteration(&self, vm: &VmSystem, force: bool) -> u32 {
        let _pass = self.pass.lock();
        vm.pages.take_daemon_wakeup();

        let free_short = vm.pages.free_shortage();
        let inactive_short = vm.pages.inactive_shortage();
        if !force && !self.needs_pages(vm) && inactive_short == 0 {
            vm.pages.zero_free_pages(vm.config.idle_zero_batch);
            return 0;
        }
        counter!(self.stats.wakeups);

        let burst = vm.config.pageout_burst;

        // PHASE 1: front hand over the active queue
        let to_deactivate = if force {
            burst
        } else {
            inactive_short.max(free_short).min(burst)
        };
        self.scan_active_pages(vm, to_deactivate);

        // PHASE 2: back hand over the inactive queue
        let to_scan = if force || vm.pages.is_memory_critical() {
            burst
        } else {
            free_short.max(1).min(burst)
        };
        let reclaimed = self.scan_inactive_pages(vm, to_scan);

        self.stats.reclaimed.add(u64::from(reclaimed));
        log::debug!(
            "vm_pageout: pass reclaimed {} (free {}, active {}, inactive {})",
            reclaimed,
            vm.pages.free_count(),
            vm.pages.active_count(),
            vm.pages.inactive_count()
        );
        reclaimed
    }

    /// Front hand: referenced pages get a second chance at the tail of
    /// the active queue; the rest are deactivated.
    fn scan_active_pages(&self, vm: &VmSystem, count: u32) -> u32 {
        let mut deactivated = 0;
        let limit = count.min(vm.pages.active_count());

        for _ in 0..limit {
            let Some(pg) = vm.pages.dequeue_active_busy() else {
                break;
            };
            counter!(self.stats.scanned);

            if vm.pages.phys().clear_reference(vm.pages.phys_addr(pg)) {
                vm.pages.unbusy(pg, Placement::Active);
            } else {
                vm.pages.unbusy(pg, Placement::Inactive);
                deactivated += 1;
                counter!(self.stats.deactivated);
            }
        }
        deactivated
    }

    /// Back hand: reclaim unreferenced inactive pages
    fn scan_inactive_pages(&self, vm: &VmSystem, count: u32) -> u32 {
        let mut reclaimed = 0;
        let limit = count.min(vm.pages.inactive_count());

        for _ in 0..limit {
            let Some(pg) = vm.pages.dequeue_inactive_busy() else {
                break;
            };
            counter!(self.stats.scanned);
            let pa = vm.pages.phys_addr(pg);

            if vm.pages.is_released(pg) {
                vm.pages.free(pg);
                reclaimed += 1;
                continue;
            }
            if vm.pages.phys().clear_reference(pa) {
                counter!(self.stats.reactivated);
                vm.pages.unbusy(pg, Placement::Active);
                continue;
            }

            let verdict = match vm.pages.page(pg).owner() {
                PageOwner::Anon(weak) => match weak.upgrade() {
                    Some(anon) => self.reclaim_anon_page(vm, &anon, pg, pa),
                    None => Verdict::Skip,
                },
                PageOwner::Object { loan: Some(_), .. } => Verdict::Skip,
                PageOwner::Object { .. } => Self::reclaim_object_page(vm, pg, pa),
                PageOwner::Free => Verdict::Skip,
            };

            match verdict {
                Verdict::Freed => reclaimed += 1,
                Verdict::Cleaned => {
                    counter!(self.stats.cleaned);
                    reclaimed += 1;
                }
                Verdict::Reactivate => {
                    counter!(self.stats.reactivated);
                    vm.pages.unbusy(pg, Placement::Active);
                }
                Verdict::Skip => {
                    counter!(self.stats.skipped);
                    vm.pages.unbusy(pg, Placement::Inactive);
                }
            }
        }
        reclaimed
    }

    /// Free or swap out a busy anon page
    fn reclaim_anon_page(&self, vm: &VmSystem, anon: &Anon, pg: PageId, pa: PhysAddr) -> Verdict {
        let Some(mut inner) = anon.try_lock() else {
            return Verdict::Skip;
        };
        if inner.page != Some(pg) {
            return Verdict::Skip;
        }

        if inner.swslot.is_some() && !vm.pages.is_dirty(pg) {
            vm.pages.phys().page_protect(pa, VmProt::NONE);
            if !vm.pages.is_dirty(pg) {
                inner.page = None;
                vm.pages.free(pg);
                return Verdict::Freed;
            }
        }

        let Some(swap) = vm.swap.as_ref().filter(|s| !s.is_full()) else {
            return Verdict::Reactivate;
        };
        vm.pages.phys().page_protect(pa, VmProt::NONE);
        if let Some(old) = inner.swslot.take() {
            swap.free(old, 1);
        }
        match swap.put(pa, true) {
            Some(slot) => {
                log::trace!("vm_pageout: anon {} page {:?} -> {}", anon.id(), pg, slot);
                inner.swslot = Some(slot);
                inner.page = None;
                vm.pages.free(pg);
                Verdict::Cleaned
            }
            None => {
                log::warn!("vm_pageout: swap write for anon {} failed", anon.id());
                Verdict::Reactivate
            }
        }
    }

    /// Free a busy object page if it still matches its backing store
    fn reclaim_object_page(vm: &VmSystem, pg: PageId, pa: PhysAddr) -> Verdict {
        if vm.pages.is_dirty(pg) {
            return Verdict::Reactivate;
        }
        vm.pages.phys().page_protect(pa, VmProt::NONE);
        // A write may have landed before the mappings went away.
        if vm.pages.is_dirty(pg) {
            return Verdict::Reactivate;
        }
        vm.pages.free(pg);
        Verdict::Freed
    }
}

impl Default for PageoutDaemon {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vm::pmap::{Pmap, PmapFlags};
    use crate::vm::testutil::{test_vm, test_vm_with_swap, MemObject, TEST_PHYS_BASE};
    use crate::vm::vm_anon::anon_alloc;
    use crate::vm::vm_object::BackingObject;
    use crate::vm::vm_page::{AllocFlags, PageQueueType};

    #[test]
    fn test_idle_pass_prezeroes_free_pages() {
        let (vm, mmu) = test_vm(64);
        let pa = TEST_PHYS_BASE;
        mmu.write_phys(pa, b"stale");

        assert_eq!(vm.pageout.run_iteration(&vm, false), 0);
        assert_eq!(vm.pageout.stats.wakeups.get(), 0);
        assert_eq!(vm.pages.zeroed_count(), vm.config.idle_zero_batch);
        assert_eq!(vm.pages.counters.prezeroed.get(), u64::from(vm.config.idle_zero_batch));
        assert_eq!(vm.pages.free_count(), 64);

        // The first free page was zeroed, and a zero-fill allocation takes it.
        let (_anon, pg) = anon_alloc(&vm, AllocFlags::ZERO).unwrap();
        assert_eq!(vm.pages.phys_addr(pg), pa);
        assert_eq!(&mmu.read_phys(pa)[..5], &[0u8; 5]);
        assert_eq!(vm.pages.counters.zero_hits.get(), 1);
        assert_eq!(vm.pages.counters.zero_misses.get(), 0);
        assert!(vm.pages.is_dirty(pg));
        vm.pages.unbusy(pg, Placement::Active);
        vm.pages.check_invariants().unwrap();
    }

    #[test]
    fn test_critical_memory_scans_full_burst() {
        let (vm, mmu) = test_vm(64);
        let obj = MemObject::new(mmu.clone(), 64);
        for i in 0..64 {
            let pg = obj.make_resident(&vm, i * 4096);
            vm.pages.deactivate(pg);
        }
        assert!(vm.pages.is_memory_critical());
        assert_eq!(vm.pages.free_shortage(), 3);

        assert_eq!(vm.pageout.run_iteration(&vm, false), vm.config.pageout_burst);
        assert_eq!(vm.pages.free_count(), vm.config.pageout_burst);
        vm.pages.check_invariants().unwrap();
    }

    #[test]
    fn test_clean_object_pages_reclaimed() {
        let (vm, mmu) = test_vm(16);
        let obj = MemObject::new(mmu.clone(), 4);
        let pages: alloc::vec::Vec<_> = (0..4).map(|i| obj.make_resident(&vm, i * 4096)).collect();

        // First pass deactivates, second frees.
        vm.pageout.run_iteration(&vm, true);
        assert_eq!(vm.pages.inactive_count(), 0);
        assert_eq!(vm.pageout.stats.deactivated.get(), 4);
        assert_eq!(vm.pageout.stats.reclaimed.get(), 4);
        for pg in pages {
            assert_eq!(vm.pages.page(pg).queue(), PageQueueType::Free);
        }
        assert!(vm.pages.lookup(obj.id(), 0).is_none());
        vm.pages.check_invariants().unwrap();
    }

    #[test]
    fn test_referenced_page_survives() {
        let (vm, mmu) = test_vm(16);
        let obj = MemObject::new(mmu.clone(), 1);
        let pg = obj.make_resident(&vm, 0);
        let pmap = mmu.create_pmap();
        pmap.enter(0x1000, vm.pages.phys_addr(pg), VmProt::READ, PmapFlags::empty())
            .unwrap();
        pmap.read(0x1000, 1).unwrap();

        vm.pageout.run_iteration(&vm, true);
        assert_eq!(vm.pages.page(pg).queue(), PageQueueType::Active);
        assert!(pmap.lookup(0x1000).is_some());
    }

    #[test]
    fn test_dirty_anon_page_swapped_out() {
        let (vm, mmu, swap) = test_vm_with_swap(16, 8);
        let (anon, pg) = anon_alloc(&vm, AllocFlags::ZERO).unwrap();
        mmu.write_phys(vm.pages.phys_addr(pg), b"anon data");
        vm.pages.unbusy(pg, Placement::Inactive);

        assert_eq!(vm.pageout.run_iteration(&vm, true), 1);
        assert_eq!(vm.pageout.stats.cleaned.get(), 1);
        assert!(anon.page().is_none());
        let slot = anon.swslot().unwrap();
        assert!(swap.is_allocated(slot));
        assert_eq!(vm.pages.free_count(), 16);
    }

    #[test]
    fn test_dirty_anon_page_kept_without_swap() {
        let (vm, mmu) = test_vm(16);
        let (anon, pg) = anon_alloc(&vm, AllocFlags::ZERO).unwrap();
        mmu.write_phys(vm.pages.phys_addr(pg), b"x");
        vm.pages.unbusy(pg, Placement::Inactive);

        assert_eq!(vm.pageout.run_iteration(&vm, true), 0);
        assert_eq!(anon.page(), Some(pg));
        assert_eq!(vm.pages.page(pg).queue(), PageQueueType::Active);
    }

    #[test]
    fn test_locked_anon_skipped() {
        let (vm, _mmu, _swap) = test_vm_with_swap(16, 8);
        let (anon, pg) = anon_alloc(&vm, AllocFlags::ZERO).unwrap();
        vm.pages.unbusy(pg, Placement::Inactive);

        let guard = anon.lock();
        assert_eq!(vm.pageout.run_iteration(&vm, true), 0);
        assert_eq!(vm.pageout.stats.skipped.get(), 1);
        drop(guard);
        assert_eq!(vm.pages.page(pg).queue(), PageQueueType::Inactive);
    }

    #[test]
    fn test_loaned_page_skipped() {
        let (vm, mmu) = test_vm(16);
        let obj = MemObject::new(mmu.clone(), 1);
        let pg = obj.make_resident(&vm, 0);
        let _anon = crate::vm::vm_anon::anon_loan(&vm, pg).unwrap();
        vm.pages.deactivate(pg);

        assert_eq!(vm.pageout.run_iteration(&vm, true), 0);
        assert_eq!(vm.pageout.stats.skipped.get(), 1);
        assert!(vm.pages.page(pg).owner().is_loaned());
    }

    #[test]
    fn test_dirty_object_page_not_freed() {
        let (vm, mmu) = test_vm(16);
        let obj = MemObject::new(mmu.clone(), 1);
        let pg = obj.make_resident(&vm, 0);
        vm.pages.mark_dirty(pg);
        vm.pages.deactivate(pg);
        assert_eq!(vm.pageout.run_iteration(&vm, true), 0);
        assert_eq!(vm.pages.lookup(obj.id(), 0), Some(pg));
        assert_eq!(vm.pages.page(pg).queue(), PageQueueType::Active);
    }
}
