//! VM Fault - Page Fault Handling
//!
//! Based on the two-layer (amap over object) fault routine of the UVM
//! design: turns a faulting address into a resident page mapped with the
//! right protection.
//!
//! ## States
//!
//! - **ReFault**: look the address up, check protection, resolve
//!   `NEEDS_COPY`, choose the read-ahead window and map resident
//!   neighbours. Every transient failure comes back here.
//! - **Anon**: an anon covers the page (case 1)
//!   - 1A: map the anon's page (breaking a loan on write)
//!   - 1B: write to a shared anon; copy it into a new anon
//! - **Object**: no anon; the backing object or zero fill (case 2)
//!   - 2A: map the object's page directly
//!   - 2B: promote the object page (or a zero page) into a new anon
//! - **Done** / **Failed**
//!
//! ## Locking
//!
//! The map is read-locked from lookup to the final `pmap` enter, except
//! around blocking operations (page-in, memory waits, busy waits), after
//! which `FaultInfo::relock` detects any change to the map. Case 1 holds
//! the amap lock and then the anon lock from the final check of the anon
//! to the hardware mapping.
//!
//! There is no bound on restarts: a fault that keeps losing races keeps
//! retrying.

use alloc::sync::Arc;

use crate::counter;
use crate::kern::counters::MachCounter;
use crate::kern::lock::cpu_relax;
use crate::vm::error::{AllocError, FaultError};
use crate::vm::pmap::{Pmap, PmapFlags};
use crate::vm::vm_advice::{FaultWindow, MAX_RANGE};
use crate::vm::vm_amap::{Amap, AnonWindow};
use crate::vm::vm_anon::{anon_alloc, anon_dropswap, anon_get, anon_release, Anon, AnonGetError};
use crate::vm::vm_fault_info::{FaultInfo, Unlock};
use crate::vm::vm_map::{Advice, EntryFlags, VmMap, VmMapEntry, VmProt};
use crate::vm::vm_object::{FaultRequest, FlushFlags, PageSlot, PagerStatus, PgoFlags};
use crate::vm::vm_page::{trunc_page, AllocFlags, PageId, PageOwner, Placement, PAGE_SHIFT, PAGE_SIZE};
use crate::vm::VmSystem;

// ============================================================================
// Fault Types
// ============================================================================

/// Why the fault was taken
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultType {
    /// No valid translation
    Invalid,
    /// Translation exists but forbids the access
    Protect,
    /// Wiring the page (`vm_fault_wire`)
    Wire,
}

/// Resolution arm taken for the faulting page
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultCase {
    /// Map the anon's own page
    Case1A,
    /// Copy a shared anon on write
    Case1B,
    /// Map the object's page
    Case2A,
    /// Promote an object page or a zero page into a new anon
    Case2B,
}

// ============================================================================
// Fault Statistics
// ============================================================================

/// Fault path event counters
#[derive(Debug)]
pub struct FaultStats {
    pub faults: MachCounter,
    /// Relocks attempted after an unlocked interval
    pub flt_relck: MachCounter,
    /// Relocks that found the map unchanged
    pub flt_relckok: MachCounter,
    pub flt_anget: MachCounter,
    pub flt_anretry: MachCounter,
    pub flt_amcopy: MachCounter,
    /// Neighbour anon pages mapped
    pub flt_namap: MachCounter,
    /// Neighbour object pages mapped
    pub flt_nomap: MachCounter,
    /// Non-blocking object gets
    pub flt_lget: MachCounter,
    /// Blocking object gets
    pub flt_get: MachCounter,
    pub flt_anon: MachCounter,
    pub flt_acow: MachCounter,
    pub flt_obj: MachCounter,
    pub flt_prcopy: MachCounter,
    pub flt_przero: MachCounter,
    pub flt_noram: MachCounter,
    pub flt_noanon: MachCounter,
    pub flt_pgwait: MachCounter,
    pub flt_pgrele: MachCounter,
    pub refaults: MachCounter,
    pub pmap_fail: MachCounter,
    pub pageins: MachCounter,
    pub anon_frees: MachCounter,
}

impl FaultStats {
    pub const fn new() -> Self {
        Self {
            faults: MachCounter::new("faults"),
            flt_relck: MachCounter::new("flt_relck"),
            flt_relckok: MachCounter::new("flt_relckok"),
            flt_anget: MachCounter::new("flt_anget"),
            flt_anretry: MachCounter::new("flt_anretry"),
            flt_amcopy: MachCounter::new("flt_amcopy"),
            flt_namap: MachCounter::new("flt_namap"),
            flt_nomap: MachCounter::new("flt_nomap"),
            flt_lget: MachCounter::new("flt_lget"),
            flt_get: MachCounter::new("flt_get"),
            flt_anon: MachCounter::new("flt_anon"),
            flt_acow: MachCounter::new("flt_acow"),
            flt_obj: MachCounter::new("flt_obj"),
            flt_prcopy: MachCounter::new("flt_prcopy"),
            flt_przero: MachCounter::new("flt_przero"),
            flt_noram: MachCounter::new("flt_noram"),
            flt_noanon: MachCounter::new("flt_noanon"),
            flt_pgwait: MachCounter::new("flt_pgwait"),
            flt_pgrele: MachCounter::new("flt_pgrele"),
            refaults: MachCounter::new("refaults"),
            pmap_fail: MachCounter::new("pmap_fail"),
            pageins: MachCounter::new("pageins"),
            anon_frees: MachCounter::new("anon_frees"),
        }
    }

    /// Every counter, for reporting
    pub fn all(&self) -> [&MachCounter; 23] {
        [
            &self.faults,
            &self.flt_relck,
            &self.flt_relckok,
            &self.flt_anget,
            &self.flt_anretry,
            &self.flt_amcopy,
            &self.flt_namap,
            &self.flt_nomap,
            &self.flt_lget,
            &self.flt_get,
            &self.flt_anon,
            &self.flt_acow,
            &self.flt_obj,
            &self.flt_prcopy,
            &self.flt_przero,
            &self.flt_noram,
            &self.flt_noanon,
            &self.flt_pgwait,
            &self.flt_pgrele,
            &self.refaults,
            &self.pmap_fail,
            &self.pageins,
            &self.anon_frees,
        ]
    }
}

impl Default for FaultStats {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// Fault State
// ============================================================================

/// Per-fault parameters fixed at lookup time
#[derive(Debug)]
pub struct FaultContext {
    /// Faulting page
    pub vaddr: u64,
    pub fault_type: FaultType,
    /// Access being resolved (the full entry protection when wiring)
    pub access: VmProt,
    /// Protection for the new translation
    pub enter_prot: VmProt,
    /// Wire the resolved page
    pub wired: bool,
    pub window: FaultWindow,
    /// Anons of the window, `None` where the amap has no anon
    pub anons: AnonWindow,
}

/// A fault in progress: context plus the locked lookup
struct Faulting {
    ctx: FaultContext,
    ufi: FaultInfo,
    entry: VmMapEntry,
    pmap: Arc<dyn Pmap>,
}

impl Faulting {
    fn pmap_flags(&self) -> PmapFlags {
        if self.ctx.wired {
            PmapFlags::WIRED | PmapFlags::CANFAIL
        } else {
            PmapFlags::CANFAIL
        }
    }

    fn placement(&self) -> Placement {
        if self.ctx.wired {
            Placement::Wired
        } else {
            Placement::Active
        }
    }
}

enum FaultState {
    ReFault,
    Anon {
        f: Faulting,
        amap: Arc<Amap>,
        slot: usize,
        anon: Arc<Anon>,
    },
    Object {
        f: Faulting,
        uobjpage: Option<PageId>,
    },
    Done,
    Failed(FaultError),
}

/// Why a fault went back to ReFault
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Restart {
    /// Entry needed a private amap
    AmapCopy,
    /// Map changed while unlocked
    Stale,
    /// `anon_get` lost a race
    AnonRetry,
    /// Something changed between unlocked checks
    Race,
    /// Waited for free memory
    NoMemory,
    /// Backing object asked to try later
    Again,
    /// Backing object asked for a restart
    ObjectRefault,
}

type Step = Result<FaultState, Restart>;

#[inline]
fn page_index(delta: u64) -> usize {
    (delta >> PAGE_SHIFT) as usize
}

/// Release `locks`, wait for free memory, then restart (or fail if memory
/// cannot be found).
fn wait_memory<L: Unlock>(vm: &VmSystem, locks: L) -> Step {
    match vm.wait_for_memory(locks) {
        Ok(()) => Err(Restart::NoMemory),
        Err(err) => Ok(FaultState::Failed(err)),
    }
}

/// Give back a page fetched for a fault that is restarting
fn discard(vm: &VmSystem, pg: PageId) {
    if vm.pages.is_released(pg) {
        vm.pages.free(pg);
    } else {
        vm.pages.unbusy(pg, Placement::Active);
    }
}

// ============================================================================
// Fault Entry Points
// ============================================================================

/// Resolve a fault at `vaddr` in `map` for `access`.
///
/// On success the page is resident and mapped in the map's pmap with at
/// least `access` (unless the entry is copy-on-write and the access is a
/// read, in which case writes are left to a later protection fault).
pub fn vm_fault(
    vm: &VmSystem,
    map: &Arc<VmMap>,
    vaddr: u64,
    fault_type: FaultType,
    access: VmProt,
) -> Result<(), FaultError> {
    counter!(vm.stats.faults);
    let vaddr = trunc_page(vaddr);
    log::trace!("vm_fault: {:#x} {:?} access {:?}", vaddr, fault_type, access);

    let mut state = FaultState::ReFault;
    loop {
        let step = match state {
            FaultState::ReFault => fault_lookup(vm, map, vaddr, fault_type, access),
            FaultState::Anon { f, amap, slot, anon } => fault_anon(vm, f, amap, slot, anon),
            FaultState::Object { f, uobjpage } => fault_object(vm, f, uobjpage),
            FaultState::Done => return Ok(()),
            FaultState::Failed(err) => {
                log::debug!("vm_fault: {:#x} failed: {}", vaddr, err);
                return Err(err);
            }
        };
        state = match step {
            Ok(next) => next,
            Err(why) => {
                counter!(vm.stats.refaults);
                log::trace!("vm_fault: {:#x} refault ({:?})", vaddr, why);
                FaultState::ReFault
            }
        };
    }
}

/// Wire `[start, end)`: fault every page in with the entry's full
/// protection and wire it.
pub fn vm_fault_wire(vm: &VmSystem, map: &Arc<VmMap>, start: u64, end: u64) -> Result<(), FaultError> {
    map.set_wired(start, end, true)
        .map_err(|_| FaultError::NoMapping)?;

    let mut va = start;
    while va < end {
        if let Err(err) = vm_fault(vm, map, va, FaultType::Wire, VmProt::READ) {
            log::warn!("vm_fault_wire: {:#x} failed: {}", va, err);
            map.unwire_pages(vm, start, va);
            // The range was validated above and is still wired by us.
            let _ = map.set_wired(start, end, false);
            return Err(err);
        }
        va += PAGE_SIZE as u64;
    }
    Ok(())
}

/// Undo `vm_fault_wire` over `[start, end)`
pub fn vm_fault_unwire(vm: &VmSystem, map: &Arc<VmMap>, start: u64, end: u64) -> Result<(), FaultError> {
    map.set_wired(start, end, false)
        .map_err(|_| FaultError::NoMapping)?;
    map.unwire_pages(vm, start, end);
    Ok(())
}

// ============================================================================
// ReFault: lookup, window, neighbours
// ============================================================================

fn fault_lookup(vm: &VmSystem, map: &Arc<VmMap>, vaddr: u64, fault_type: FaultType, access: VmProt) -> Step {
    let Some(ufi) = FaultInfo::lookup(map, vaddr, false) else {
        return Ok(FaultState::Failed(FaultError::NoMapping));
    };
    let entry = ufi.entry.clone();

    if !entry.protection.contains(access) {
        log::debug!(
            "vm_fault: {:#x} access {:?} exceeds protection {:?}",
            vaddr,
            access,
            entry.protection
        );
        return Ok(FaultState::Failed(FaultError::PermissionDenied));
    }

    let wired = entry.is_wired() || fault_type == FaultType::Wire;
    let access = if fault_type == FaultType::Wire { entry.protection } else { access };
    let mut enter_prot = entry.protection;

    if entry.flags.contains(EntryFlags::NEEDS_COPY) {
        if access.can_write() || entry.object.is_none() {
            let leaf = Arc::clone(&ufi.map);
            drop(ufi);
            counter!(vm.stats.flt_amcopy);
            leaf.amap_copy(vm, vaddr);
            return Err(Restart::AmapCopy);
        }
        enter_prot = enter_prot.without(VmProt::WRITE);
    }

    if entry.amap.is_none() && entry.object.is_none() {
        drop(ufi);
        panic!("vm_fault: entry [{:#x}, {:#x}) has neither amap nor object", entry.start, entry.end);
    }

    let advice = entry.advice;
    let mut window = if wired {
        FaultWindow::narrow(vaddr)
    } else {
        FaultWindow::around(vaddr, entry.start, entry.end, vm.config.readahead(advice))
    };
    let mut anons: AnonWindow = match &entry.amap {
        Some(r) => r
            .amap
            .lookups(r.slotoff + page_index(window.startva - entry.start), window.npages),
        None => (0..window.npages).map(|_| None).collect(),
    };

    if advice == Advice::Sequential && window.nback > 0 {
        // Pages behind a sequential reader will not be touched again soon.
        for anon in anons.iter().take(window.nback).flatten() {
            let inner = anon.lock();
            if let Some(pg) = inner.page {
                vm.pages.deactivate_unmapped(pg);
            }
        }
        if let Some(r) = &entry.object {
            let start = r.offset + (window.startva - entry.start);
            let end = start + (window.nback * PAGE_SIZE) as u64;
            r.object.flush(vm, start, end, FlushFlags::DEACTIVATE);
        }
        anons = anons.iter().skip(window.nback).cloned().collect();
        window.skip_behind();
    }

    let pmap = Arc::clone(ufi.orig_map.pmap());

    for (i, anon) in anons.iter().enumerate() {
        let Some(anon) = anon else { continue };
        let va = window.va(i);
        if i == window.centeridx || pmap.extract(va).is_some() {
            continue;
        }
        let inner = anon.lock();
        let Some(pg) = inner.page else { continue };
        if vm.pages.is_busy(pg) || vm.pages.is_released(pg) {
            continue;
        }
        let prot = if inner.refs > 1 || vm.pages.page(pg).owner().is_loaned_to(anon) {
            enter_prot.without(VmProt::WRITE)
        } else {
            enter_prot
        };
        vm.pages.activate(pg);
        counter!(vm.stats.flt_namap);
        // Neighbours are opportunistic; a shortage here is not an error.
        let _ = pmap.enter(va, vm.pages.phys_addr(pg), prot, PmapFlags::CANFAIL);
    }

    let center = anons[window.centeridx].clone();
    let mut f = Faulting {
        ctx: FaultContext {
            vaddr,
            fault_type,
            access,
            enter_prot,
            wired,
            window,
            anons,
        },
        ufi,
        entry,
        pmap,
    };

    if let (Some(anon), Some(r)) = (center, f.entry.amap.clone()) {
        pmap_update(&f);
        let slot = r.slotoff + page_index(vaddr - f.entry.start);
        return Ok(FaultState::Anon { f, amap: r.amap, slot, anon });
    }

    let Some(obj) = f.entry.object.clone() else {
        pmap_update(&f);
        return Ok(FaultState::Object { f, uobjpage: None });
    };

    let mut pages: heapless::Vec<PageSlot, MAX_RANGE> = f
        .ctx
        .anons
        .iter()
        .map(|a| if a.is_some() { PageSlot::DontCare } else { PageSlot::Empty })
        .collect();

    let handled = {
        let mut req = FaultRequest {
            map: &f.ufi.map,
            pmap: &*f.pmap,
            entry: &f.entry,
            window,
            pages: &mut pages[..],
            fault_type,
            access: f.ctx.access,
            enter_prot,
            wired,
        };
        obj.object.fault(vm, &mut req)
    };
    if let Some(status) = handled {
        f.ufi.unlock();
        return match status {
            PagerStatus::Ok => Ok(FaultState::Done),
            PagerStatus::Error => Ok(FaultState::Failed(FaultError::PermissionDenied)),
            PagerStatus::Again | PagerStatus::Pend => {
                cpu_relax();
                Err(Restart::Again)
            }
            PagerStatus::Refault => Err(Restart::ObjectRefault),
        };
    }

    counter!(vm.stats.flt_lget);
    let offset = obj.offset + (window.startva - f.entry.start);
    // Only what is resident comes back; the centre page may be missing.
    let _ = obj.object.get(
        vm,
        offset,
        &mut pages[..],
        window.centeridx,
        f.ctx.access,
        advice,
        PgoFlags::LOCKED,
    );

    let strip_write = f.entry.flags.contains(EntryFlags::COPY_ON_WRITE);
    let mut uobjpage = None;
    for (i, slot) in pages.iter().enumerate() {
        let Some(pg) = slot.page() else { continue };
        if i == window.centeridx {
            uobjpage = Some(pg);
            continue;
        }
        if vm.pages.is_released(pg) {
            vm.pages.free(pg);
            continue;
        }
        let prot = if strip_write || vm.pages.page(pg).owner().is_loaned() {
            enter_prot.without(VmProt::WRITE)
        } else {
            enter_prot
        };
        counter!(vm.stats.flt_nomap);
        let _ = f.pmap.enter(window.va(i), vm.pages.phys_addr(pg), prot, PmapFlags::CANFAIL);
        vm.pages.unbusy(pg, Placement::Active);
    }
    pmap_update(&f);

    Ok(FaultState::Object { f, uobjpage })
}

fn pmap_update(f: &Faulting) {
    f.pmap.update();
}

/// Enter the final translation and place the page. `busy` pages are
/// unbusied; idle ones are activated or wired. On a pmap shortage the
/// fault unwinds, waits for memory and restarts.
fn enter_and_place<L: Unlock>(
    vm: &VmSystem,
    f: &mut Faulting,
    pg: PageId,
    prot: VmProt,
    busy: bool,
    locks: L,
) -> Step {
    let pa = vm.pages.phys_addr(pg);
    if let Err(err) = f.pmap.enter(f.ctx.vaddr, pa, prot, f.pmap_flags()) {
        counter!(vm.stats.pmap_fail);
        log::debug!("vm_fault: {:#x} pmap enter failed: {}", f.ctx.vaddr, err);
        if busy {
            vm.pages.unbusy(pg, Placement::Active);
        }
        return wait_memory(vm, (locks, &mut f.ufi));
    }

    let placement = f.placement();
    if busy {
        vm.pages.unbusy(pg, placement);
    } else if placement == Placement::Wired {
        vm.pages.wire(pg);
    } else {
        vm.pages.activate(pg);
    }
    locks.unlock();
    f.pmap.update();
    f.ufi.unlock();
    Ok(FaultState::Done)
}

// ============================================================================
// Case 1: anon
// ============================================================================

fn fault_anon(vm: &VmSystem, mut f: Faulting, amap: Arc<Amap>, slot: usize, anon: Arc<Anon>) -> Step {
    match anon_get(vm, &mut f.ufi, &amap, slot, &anon) {
        Ok(()) => {}
        Err(AnonGetError::Retry) => {
            counter!(vm.stats.flt_anretry);
            return Err(Restart::AnonRetry);
        }
        Err(AnonGetError::OutOfMemory) => return Ok(FaultState::Failed(FaultError::OutOfMemory)),
        Err(AnonGetError::IoError) => return Ok(FaultState::Failed(FaultError::PermissionDenied)),
    }

    let mut amap_guard = amap.lock();
    let mut anon_guard = anon.lock();
    let current = amap_guard.lookup(slot).is_some_and(|a| Arc::ptr_eq(a, &anon));
    let Some(pg) = anon_guard.page.filter(|&pg| current && !vm.pages.is_busy(pg)) else {
        return Err(Restart::Race);
    };

    let write = f.ctx.access.can_write();
    let case = if write && anon_guard.refs > 1 {
        FaultCase::Case1B
    } else {
        FaultCase::Case1A
    };
    log::trace!("vm_fault: {:#x} {:?} anon {}", f.ctx.vaddr, case, anon.id());

    let mut prot = f.ctx.enter_prot;
    match case {
        FaultCase::Case1B => {
            counter!(vm.stats.flt_acow);
            let (nanon, npg) = match anon_alloc(vm, AllocFlags::empty()) {
                Ok(new) => new,
                Err(_) => {
                    counter!(vm.stats.flt_noanon);
                    return wait_memory(vm, (anon_guard, amap_guard, &mut f.ufi));
                }
            };
            vm.pages.copy(pg, npg);
            drop(anon_guard);
            if let Some(old) = amap_guard.replace(vm, slot, nanon) {
                anon_release(vm, &old);
            }
            enter_and_place(vm, &mut f, npg, prot, true, amap_guard)
        }
        _ => {
            counter!(vm.stats.flt_anon);
            if anon_guard.refs > 1 {
                prot = prot.without(VmProt::WRITE);
            }
            let mut target = pg;
            let mut fresh = false;
            if vm.pages.page(pg).owner().is_loaned_to(&anon) {
                if !write {
                    prot = prot.without(VmProt::WRITE);
                } else {
                    // Write to a borrowed object page: take a private copy.
                    let npg = match vm.pages.alloc(PageOwner::anon(&anon), AllocFlags::empty()) {
                        Ok(npg) => npg,
                        Err(_) => {
                            counter!(vm.stats.flt_noram);
                            return wait_memory(vm, (anon_guard, amap_guard, &mut f.ufi));
                        }
                    };
                    vm.pages.copy(pg, npg);
                    vm.pages.phys().page_protect(vm.pages.phys_addr(pg), VmProt::NONE);
                    anon_guard.page = Some(npg);
                    vm.pages.end_loan(pg);
                    log::trace!("vm_fault: anon {} loan of {:?} broken", anon.id(), pg);
                    target = npg;
                    fresh = true;
                }
            }
            if f.ctx.fault_type == FaultType::Wire {
                anon_dropswap(vm, &mut anon_guard);
            }
            enter_and_place(vm, &mut f, target, prot, fresh, (anon_guard, amap_guard))
        }
    }
}

// ============================================================================
// Case 2: object or zero fill
// ============================================================================

/// Give a loaned object page's loaning anon its own copy, so the object
/// page can be written. The object keeps `pg`.
fn break_object_loan(vm: &VmSystem, pg: PageId) -> Result<(), AllocError> {
    let Some(loaner) = vm.pages.loaner(pg) else {
        vm.pages.end_loan(pg);
        return Ok(());
    };
    let npg = vm.pages.alloc(PageOwner::anon(&loaner), AllocFlags::empty())?;
    vm.pages.copy(pg, npg);
    vm.pages.phys().page_protect(vm.pages.phys_addr(pg), VmProt::NONE);

    let mut inner = loaner.lock();
    if inner.page == Some(pg) {
        inner.page = Some(npg);
        vm.pages.end_loan(pg);
        drop(inner);
        vm.pages.unbusy(npg, Placement::Active);
    } else {
        drop(inner);
        vm.pages.end_loan(pg);
        vm.pages.free(npg);
    }
    log::trace!("vm_fault: object page {:?} taken back from anon {}", pg, loaner.id());
    Ok(())
}

fn fault_object(vm: &VmSystem, mut f: Faulting, uobjpage: Option<PageId>) -> Step {
    let va = f.ctx.vaddr;
    let write = f.ctx.access.can_write();
    let cow = f.entry.flags.contains(EntryFlags::COPY_ON_WRITE);
    let mut uobjpage = uobjpage;

    if let (Some(obj), None) = (f.entry.object.clone(), uobjpage) {
        f.ufi.unlock();
        counter!(vm.stats.flt_get);
        let offset = obj.offset + (va - f.entry.start);
        let mut slot = [PageSlot::Empty];
        let status = obj.object.get(
            vm,
            offset,
            &mut slot,
            0,
            f.ctx.access,
            f.entry.advice,
            PgoFlags::SYNCIO,
        );
        let got = match status {
            PagerStatus::Ok => slot[0].page(),
            PagerStatus::Again | PagerStatus::Pend => {
                cpu_relax();
                return Err(Restart::Again);
            }
            PagerStatus::Refault => return Err(Restart::ObjectRefault),
            PagerStatus::Error => None,
        };
        if got.is_none() {
            if !f.entry.flags.contains(EntryFlags::FAULT_TOLERANT) {
                log::warn!("vm_fault: {:#x} backing store read failed", va);
                return Ok(FaultState::Failed(FaultError::PermissionDenied));
            }
            log::warn!("vm_fault: {:#x} backing store read failed, zero-filling", va);
        }

        counter!(vm.stats.flt_relck);
        if f.ufi.relock().is_err() {
            if let Some(pg) = got {
                discard(vm, pg);
            }
            return Err(Restart::Stale);
        }
        counter!(vm.stats.flt_relckok);

        if let Some(pg) = got {
            if vm.pages.is_released(pg) {
                counter!(vm.stats.flt_pgrele);
                vm.pages.free(pg);
                return Err(Restart::Race);
            }
            // An anon may have appeared while we were unlocked.
            if let Some(r) = &f.entry.amap {
                if r.amap.lookup(r.slotoff + page_index(va - f.entry.start)).is_some() {
                    vm.pages.unbusy(pg, Placement::Active);
                    return Err(Restart::Race);
                }
            }
        }
        uobjpage = got;
    }

    let promote = match uobjpage {
        None => true,
        Some(_) => write && cow,
    };

    if let (false, Some(pg)) = (promote, uobjpage) {
        log::trace!("vm_fault: {:#x} {:?} page {:?}", va, FaultCase::Case2A, pg);
        counter!(vm.stats.flt_obj);
        let mut prot = f.ctx.enter_prot;
        if cow {
            prot = prot.without(VmProt::WRITE);
        }
        if vm.pages.page(pg).owner().is_loaned() {
            if !write {
                prot = prot.without(VmProt::WRITE);
            } else if break_object_loan(vm, pg).is_err() {
                counter!(vm.stats.flt_noram);
                vm.pages.unbusy(pg, Placement::Active);
                return wait_memory(vm, &mut f.ufi);
            }
        }
        return enter_and_place(vm, &mut f, pg, prot, true, ());
    }

    log::trace!("vm_fault: {:#x} {:?} from {:?}", va, FaultCase::Case2B, uobjpage);
    if f.entry.flags.contains(EntryFlags::NEEDS_COPY) {
        // Read fault on a copy-on-write entry: get a private amap first.
        if let Some(pg) = uobjpage {
            vm.pages.unbusy(pg, Placement::Active);
        }
        let leaf = Arc::clone(&f.ufi.map);
        drop(f);
        counter!(vm.stats.flt_amcopy);
        leaf.amap_copy(vm, va);
        return Err(Restart::AmapCopy);
    }
    let Some(r) = f.entry.amap.clone() else {
        // Nowhere to put a private page (shared mapping, failed read).
        if let Some(pg) = uobjpage {
            vm.pages.unbusy(pg, Placement::Active);
        }
        return Ok(FaultState::Failed(FaultError::PermissionDenied));
    };
    let slot = r.slotoff + page_index(va - f.entry.start);

    let flags = if uobjpage.is_none() { AllocFlags::ZERO } else { AllocFlags::empty() };
    let (anon, npg) = match anon_alloc(vm, flags) {
        Ok(new) => new,
        Err(_) => {
            if let Some(pg) = uobjpage {
                vm.pages.unbusy(pg, Placement::Active);
            }
            counter!(vm.stats.flt_noanon);
            return wait_memory(vm, &mut f.ufi);
        }
    };
    match uobjpage {
        Some(pg) => {
            counter!(vm.stats.flt_prcopy);
            vm.pages.copy(pg, npg);
            vm.pages.unbusy(pg, Placement::Active);
        }
        None => counter!(vm.stats.flt_przero),
    }

    let mut amap_guard = r.amap.lock();
    if amap_guard.lookup(slot).is_some() {
        // Another fault promoted this page first.
        drop(amap_guard);
        anon.lock().page = None;
        vm.pages.free(npg);
        anon_release(vm, &anon);
        return Err(Restart::Race);
    }
    amap_guard.add(slot, anon);
    let prot = f.ctx.enter_prot;
    enter_and_place(vm, &mut f, npg, prot, true, amap_guard)
}
