//! Anonymous memory
//!
//! An anon owns (at most) one page of anonymous memory: the page is
//! either resident, or in swap, or both. Anons are shared between amaps
//! after a copy-on-write fork and carry a reference count; the last
//! reference frees the page (or ends its loan) and the swap slot.
//!
//! [`anon_get`] is the resolver the fault path uses to make an anon's
//! page resident.

use alloc::sync::Arc;
use core::sync::atomic::{AtomicU64, Ordering};
use spin::{Mutex, MutexGuard};

use crate::counter;
use crate::vm::error::{AllocError, LoanError};
use crate::vm::swap::SwapSlot;
use crate::vm::vm_amap::Amap;
use crate::vm::vm_fault_info::FaultInfo;
use crate::vm::vm_object::PagerStatus;
use crate::vm::vm_page::{AllocFlags, PageId, PageOwner, Placement};
use crate::vm::VmSystem;

static NEXT_ANON_ID: AtomicU64 = AtomicU64::new(1);

/// Anon state, under the anon lock
#[derive(Debug)]
pub struct AnonInner {
    /// References from amap slots
    pub refs: u32,
    /// Resident page (owned, or on loan from an object)
    pub page: Option<PageId>,
    /// Swap location of the data
    pub swslot: Option<SwapSlot>,
}

/// An anonymous page
#[derive(Debug)]
pub struct Anon {
    id: u64,
    inner: Mutex<AnonInner>,
}

impl Anon {
    /// A new anon with one reference and no data
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            id: NEXT_ANON_ID.fetch_add(1, Ordering::Relaxed),
            inner: Mutex::new(AnonInner {
                refs: 1,
                page: None,
                swslot: None,
            }),
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Lock the anon
    pub fn lock(&self) -> MutexGuard<'_, AnonInner> {
        self.inner.lock()
    }

    pub fn try_lock(&self) -> Option<MutexGuard<'_, AnonInner>> {
        self.inner.try_lock()
    }

    pub fn refs(&self) -> u32 {
        self.inner.lock().refs
    }

    pub fn page(&self) -> Option<PageId> {
        self.inner.lock().page
    }

    pub fn swslot(&self) -> Option<SwapSlot> {
        self.inner.lock().swslot
    }
}

/// Allocate an anon together with a busy page it owns
pub fn anon_alloc(vm: &VmSystem, flags: AllocFlags) -> Result<(Arc<Anon>, PageId), AllocError> {
    let anon = Anon::new();
    let pg = vm.pages.alloc(PageOwner::anon(&anon), flags)?;
    anon.lock().page = Some(pg);
    Ok((anon, pg))
}

/// Create an anon that borrows the resident object page `pg`
pub fn anon_loan(vm: &VmSystem, pg: PageId) -> Result<Arc<Anon>, LoanError> {
    let anon = Anon::new();
    let mut inner = anon.lock();
    vm.pages.loan(pg, &anon)?;
    inner.page = Some(pg);
    drop(inner);
    Ok(anon)
}

/// Take an extra reference
pub fn anon_reference(anon: &Anon) {
    anon.lock().refs += 1;
}

/// Drop a reference; the last one frees the anon's page and swap slot
pub fn anon_release(vm: &VmSystem, anon: &Arc<Anon>) {
    let mut inner = anon.lock();
    debug_assert!(inner.refs > 0, "anon reference underflow");
    inner.refs -= 1;
    if inner.refs == 0 {
        anon_free(vm, anon, &mut inner);
    }
}

/// Dispose of a dead anon's resources (anon locked)
fn anon_free(vm: &VmSystem, anon: &Anon, inner: &mut AnonInner) {
    if let Some(pg) = inner.page.take() {
        let owner = vm.pages.page(pg).owner();
        if owner.is_loaned_to(anon) {
            // The object keeps its page; only our mappings go.
            vm.pages.end_loan(pg);
        } else if owner.is_owned_by(anon) && !vm.pages.release(pg) {
            log::trace!("anon {}: page {:?} busy, released", anon.id, pg);
        }
    }
    if let Some(slot) = inner.swslot.take() {
        if let Some(swap) = &vm.swap {
            swap.free(slot, 1);
        }
    }
    counter!(vm.stats.anon_frees);
}

/// Drop the swap copy of a resident anon page (it is about to be wired
/// or otherwise diverge from swap).
pub fn anon_dropswap(vm: &VmSystem, inner: &mut AnonInner) {
    if let Some(slot) = inner.swslot.take() {
        if let Some(swap) = &vm.swap {
            swap.free(slot, 1);
        }
        if let Some(pg) = inner.page {
            vm.pages.mark_dirty(pg);
        }
    }
}

// ============================================================================
// Anon Resolver
// ============================================================================

/// Why `anon_get` could not return a resident page
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AnonGetError {
    /// State changed while unlocked; restart the fault
    Retry,
    /// Memory exhausted and nothing reclaimable
    OutOfMemory,
    /// Swap read failed
    IoError,
}

/// Make `anon`'s page resident.
///
/// Called with the map locked, `anon` found in `amap` at `slot`. On
/// `Ok` the map is still locked and the page was resident and idle when
/// last checked. On any error every lock has been released.
pub fn anon_get(
    vm: &VmSystem,
    ufi: &mut FaultInfo,
    amap: &Arc<Amap>,
    slot: usize,
    anon: &Arc<Anon>,
) -> Result<(), AnonGetError> {
    counter!(vm.stats.flt_anget);
    loop {
        // Page we allocated and read in while unlocked
        let mut fetched: Option<(PageId, PagerStatus, bool)> = None;

        {
            let mut inner = anon.lock();
            match inner.page {
                Some(pg) => {
                    if !vm.pages.is_busy(pg) {
                        return Ok(());
                    }
                    drop(inner);
                    counter!(vm.stats.flt_pgwait);
                    log::trace!("anon_get: anon {} page {:?} busy, waiting", anon.id, pg);
                    vm.pages.wait_busy(pg, &mut *ufi);
                }
                None => match vm.pages.alloc(PageOwner::anon(anon), AllocFlags::empty()) {
                    Ok(pg) => {
                        inner.page = Some(pg);
                        let swslot = inner.swslot;
                        drop(inner);
                        ufi.unlock();

                        let status = match (swslot, &vm.swap) {
                            (Some(slot), Some(swap)) => {
                                counter!(vm.stats.pageins);
                                swap.get(vm.pages.phys_addr(pg), slot, true)
                            }
                            (Some(_), None) => PagerStatus::Error,
                            (None, _) => {
                                // Never written out: the data is all zeroes.
                                vm.pages.zero(pg);
                                PagerStatus::Ok
                            }
                        };
                        fetched = Some((pg, status, swslot.is_some()));
                    }
                    Err(_) => {
                        drop(inner);
                        counter!(vm.stats.flt_noram);
                        vm.wait_for_memory(&mut *ufi)
                            .map_err(|_| AnonGetError::OutOfMemory)?;
                    }
                },
            }
        }

        let locked = ufi.relock().is_ok();

        if let Some((pg, status, from_swap)) = fetched {
            if status != PagerStatus::Ok {
                let mut inner = anon.lock();
                if inner.page == Some(pg) {
                    inner.page = None;
                }
                if let (Some(slot), Some(swap)) = (inner.swslot, &vm.swap) {
                    swap.mark_bad(slot, 1);
                }
                drop(inner);
                log::warn!("anon_get: swap read for anon {} failed ({:?})", anon.id, status);
                vm.pages.free(pg);
                ufi.unlock();
                return Err(AnonGetError::IoError);
            }

            if vm.pages.is_released(pg) {
                // The anon died while we were reading.
                counter!(vm.stats.flt_pgrele);
                vm.pages.free(pg);
                ufi.unlock();
                return Err(AnonGetError::Retry);
            }

            if from_swap {
                vm.pages.mark_clean(pg);
            }
            vm.pages.unbusy(pg, Placement::Active);
        }

        if !locked {
            return Err(AnonGetError::Retry);
        }

        let still_ours = amap.lookup(slot).is_some_and(|a| Arc::ptr_eq(&a, anon));
        if !still_ours {
            ufi.unlock();
            return Err(AnonGetError::Retry);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vm::testutil::{test_vm, MemSwap};

    #[test]
    fn test_anon_alloc_and_release() {
        let (vm, _mmu) = test_vm(8);
        let (anon, pg) = anon_alloc(&vm, AllocFlags::ZERO).unwrap();
        assert_eq!(anon.refs(), 1);
        assert_eq!(anon.page(), Some(pg));
        assert!(vm.pages.page(pg).owner().is_owned_by(&anon));
        vm.pages.unbusy(pg, Placement::Active);

        anon_reference(&anon);
        anon_release(&vm, &anon);
        assert_eq!(vm.pages.free_count(), 7);

        anon_release(&vm, &anon);
        assert_eq!(anon.page(), None);
        assert_eq!(vm.pages.free_count(), 8);
        assert_eq!(vm.stats.anon_frees.get(), 1);
    }

    #[test]
    fn test_release_of_busy_page_is_deferred() {
        let (vm, _mmu) = test_vm(8);
        let (anon, pg) = anon_alloc(&vm, AllocFlags::empty()).unwrap();
        anon_release(&vm, &anon);
        assert!(vm.pages.is_released(pg));
        assert_eq!(vm.pages.free_count(), 7);
        vm.pages.free(pg);
        assert_eq!(vm.pages.free_count(), 8);
    }

    #[test]
    fn test_loaned_anon_release_keeps_object_page() {
        use crate::vm::vm_object::ObjectId;

        let (vm, _mmu) = test_vm(8);
        let obj = ObjectId::allocate();
        let pg = vm.pages.alloc(PageOwner::object(obj, 0), AllocFlags::empty()).unwrap();
        vm.pages.unbusy(pg, Placement::Active);

        let anon = anon_loan(&vm, pg).unwrap();
        assert!(vm.pages.page(pg).owner().is_loaned_to(&anon));
        anon_release(&vm, &anon);
        assert!(!vm.pages.page(pg).owner().is_loaned());
        assert_eq!(vm.pages.lookup(obj, 0), Some(pg));
        assert_eq!(vm.pages.free_count(), 7);
    }

    #[test]
    fn test_release_frees_swap_slot() {
        let (vm, _mmu, swap) = crate::vm::testutil::test_vm_with_swap(8, 4);
        let anon = Anon::new();
        let slot = swap.alloc_slot().unwrap();
        anon.lock().swslot = Some(slot);
        anon_release(&vm, &anon);
        assert!(!MemSwap::is_allocated(&swap, slot));
    }
}
