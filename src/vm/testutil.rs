//! Test doubles: a memory-backed swap device, a memory-backed object,
//! a device object with its own fault routine, and user access helpers
//! that retry through the fault path like a trap handler would.

use alloc::boxed::Box;
use alloc::collections::{BTreeMap, BTreeSet, VecDeque};
use alloc::sync::Arc;
use alloc::vec;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU32, Ordering};
use spin::Mutex;

use crate::vm::config::VmConfig;
use crate::vm::error::FaultError;
use crate::vm::pmap::{PhysAddr, Pmap, PmapFlags};
use crate::vm::soft_pmap::{SoftMmu, SoftPmap};
use crate::vm::swap::{SwapPager, SwapSlot};
use crate::vm::vm_fault::{vm_fault, FaultType};
use crate::vm::vm_map::{Advice, VmMap, VmProt};
use crate::vm::vm_object::{
    deactivate_range, get_resident, BackingObject, FaultRequest, FlushFlags, ObjectId, PageSlot, PagerStatus, PgoFlags,
};
use crate::vm::vm_page::{AllocFlags, PageId, PageOwner, Placement, PAGE_SIZE};
use crate::vm::VmSystem;

/// Physical base of test memory
pub const TEST_PHYS_BASE: PhysAddr = 0x10_0000;

/// A VM over `npages` frames with no reserves and no swap
pub fn test_vm(npages: u64) -> (Arc<VmSystem>, Arc<SoftMmu>) {
    let mmu = SoftMmu::new();
    let vm = build(&mmu, npages, None);
    (vm, mmu)
}

/// A VM over `npages` frames with an `nslots` swap device
pub fn test_vm_with_swap(npages: u64, nslots: u32) -> (Arc<VmSystem>, Arc<SoftMmu>, Arc<MemSwap>) {
    let mmu = SoftMmu::new();
    let swap = MemSwap::new(mmu.clone(), nslots);
    let vm = build(&mmu, npages, Some(swap.clone()));
    (vm, mmu, swap)
}

fn build(mmu: &Arc<SoftMmu>, npages: u64, swap: Option<Arc<dyn SwapPager>>) -> Arc<VmSystem> {
    let config = VmConfig::new().with_reserves(0, 0);
    let end = TEST_PHYS_BASE + npages * PAGE_SIZE as u64;
    VmSystem::new(config, mmu.clone(), &[(TEST_PHYS_BASE, end)], swap).unwrap()
}

fn fault_type(protection: bool) -> FaultType {
    if protection {
        FaultType::Protect
    } else {
        FaultType::Invalid
    }
}

/// User store through `pmap`, faulting as needed
pub fn user_write(vm: &VmSystem, map: &Arc<VmMap>, pmap: &SoftPmap, va: u64, data: &[u8]) -> Result<(), FaultError> {
    loop {
        match pmap.write(va, data) {
            Ok(()) => return Ok(()),
            Err(trap) => vm_fault(vm, map, trap.va, fault_type(trap.protection), VmProt::WRITE)?,
        }
    }
}

/// User load through `pmap`, faulting as needed
pub fn user_read(vm: &VmSystem, map: &Arc<VmMap>, pmap: &SoftPmap, va: u64, len: usize) -> Result<Vec<u8>, FaultError> {
    loop {
        match pmap.read(va, len) {
            Ok(data) => return Ok(data),
            Err(trap) => vm_fault(vm, map, trap.va, fault_type(trap.protection), VmProt::READ)?,
        }
    }
}

// ============================================================================
// Swap
// ============================================================================

/// Swap device backed by memory
pub struct MemSwap {
    mmu: Arc<SoftMmu>,
    slots: Mutex<Vec<Option<Vec<u8>>>>,
    bad: Mutex<BTreeSet<u32>>,
}

impl MemSwap {
    pub fn new(mmu: Arc<SoftMmu>, nslots: u32) -> Arc<Self> {
        Arc::new(Self {
            mmu,
            slots: Mutex::new(vec![None; nslots as usize]),
            bad: Mutex::new(BTreeSet::new()),
        })
    }

    /// Reserve a slot holding a zero page
    pub fn alloc_slot(&self) -> Option<SwapSlot> {
        let bad = self.bad.lock();
        let mut slots = self.slots.lock();
        let idx = (0..slots.len()).find(|&i| slots[i].is_none() && !bad.contains(&(i as u32)))?;
        slots[idx] = Some(vec![0; PAGE_SIZE]);
        Some(SwapSlot(idx as u32))
    }

    pub fn is_allocated(&self, slot: SwapSlot) -> bool {
        self.slots.lock().get(slot.0 as usize).is_some_and(Option::is_some)
    }
}

impl SwapPager for MemSwap {
    fn get(&self, pa: PhysAddr, slot: SwapSlot, _sync: bool) -> PagerStatus {
        if self.bad.lock().contains(&slot.0) {
            return PagerStatus::Error;
        }
        match self.slots.lock().get(slot.0 as usize) {
            Some(Some(data)) => {
                self.mmu.write_phys(pa, data);
                PagerStatus::Ok
            }
            _ => PagerStatus::Error,
        }
    }

    fn put(&self, pa: PhysAddr, _sync: bool) -> Option<SwapSlot> {
        let slot = self.alloc_slot()?;
        self.slots.lock()[slot.0 as usize] = Some(self.mmu.read_phys(pa));
        Some(slot)
    }

    fn mark_bad(&self, slot: SwapSlot, count: u32) {
        let mut bad = self.bad.lock();
        for s in slot.0..slot.0 + count {
            bad.insert(s);
        }
    }

    fn free(&self, slot: SwapSlot, count: u32) {
        let mut slots = self.slots.lock();
        for s in slot.0..slot.0 + count {
            if let Some(entry) = slots.get_mut(s as usize) {
                *entry = None;
            }
        }
    }

    fn used(&self) -> u32 {
        self.slots.lock().iter().filter(|s| s.is_some()).count() as u32
    }

    fn capacity(&self) -> u32 {
        self.slots.lock().len() as u32
    }
}

// ============================================================================
// Memory object
// ============================================================================

type GetHook = Box<dyn Fn() + Send + Sync>;

/// Object backed by a byte store; pages it never stored read as zeroes
pub struct MemObject {
    id: ObjectId,
    mmu: Arc<SoftMmu>,
    npages: u64,
    store: Mutex<BTreeMap<u64, Vec<u8>>>,
    /// Object lock
    lock: Mutex<()>,
    injected: Mutex<VecDeque<PagerStatus>>,
    hook: Mutex<Option<GetHook>>,
    sync_gets: AtomicU32,
    locked_gets: AtomicU32,
    flushes: AtomicU32,
    /// Write-backs to refuse before accepting again
    failed_writes: AtomicU32,
}

impl MemObject {
    pub fn new(mmu: Arc<SoftMmu>, npages: u64) -> Arc<Self> {
        Arc::new(Self {
            id: ObjectId::allocate(),
            mmu,
            npages,
            store: Mutex::new(BTreeMap::new()),
            lock: Mutex::new(()),
            injected: Mutex::new(VecDeque::new()),
            hook: Mutex::new(None),
            sync_gets: AtomicU32::new(0),
            locked_gets: AtomicU32::new(0),
            flushes: AtomicU32::new(0),
            failed_writes: AtomicU32::new(0),
        })
    }

    /// Backing data for the page at `offset`
    pub fn set_page(&self, offset: u64, data: &[u8]) {
        self.store.lock().insert(offset, data.to_vec());
    }

    /// Make the next blocking `get` return `status`
    pub fn inject(&self, status: PagerStatus) {
        self.injected.lock().push_back(status);
    }

    /// Run `hook` at the start of every blocking `get`
    pub fn set_get_hook<F: Fn() + Send + Sync + 'static>(&self, hook: F) {
        *self.hook.lock() = Some(Box::new(hook));
    }

    pub fn sync_gets(&self) -> u32 {
        self.sync_gets.load(Ordering::SeqCst)
    }

    pub fn locked_gets(&self) -> u32 {
        self.locked_gets.load(Ordering::SeqCst)
    }

    pub fn flushes(&self) -> u32 {
        self.flushes.load(Ordering::SeqCst)
    }

    /// Make the next `count` page write-backs fail
    pub fn fail_writes(&self, count: u32) {
        self.failed_writes.store(count, Ordering::SeqCst);
    }

    /// Stored data for the page at `offset`
    pub fn stored(&self, offset: u64) -> Option<Vec<u8>> {
        self.store.lock().get(&offset).cloned()
    }

    /// Write a busy page back to the store; false if the write failed
    fn write_back(&self, vm: &VmSystem, pg: PageId, offset: u64) -> bool {
        let refused = self
            .failed_writes
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if refused {
            return false;
        }
        let pa = vm.pages.phys_addr(pg);
        vm.pages.phys().page_protect(pa, VmProt::READ);
        self.store.lock().insert(offset, self.mmu.read_phys(pa));
        vm.pages.mark_clean(pg);
        true
    }

    /// Fill a freshly allocated page from the store
    fn fill(&self, vm: &VmSystem, pg: PageId, offset: u64) {
        vm.pages.zero(pg);
        if let Some(data) = self.store.lock().get(&offset) {
            self.mmu.write_phys(vm.pages.phys_addr(pg), data);
        }
        vm.pages.mark_clean(pg);
    }

    /// Bring the page at `offset` in, idle on the active queue
    pub fn make_resident(&self, vm: &VmSystem, offset: u64) -> PageId {
        let pg = vm
            .pages
            .alloc(PageOwner::object(self.id, offset), AllocFlags::empty())
            .unwrap();
        self.fill(vm, pg, offset);
        vm.pages.unbusy(pg, Placement::Active);
        pg
    }
}

impl BackingObject for MemObject {
    fn id(&self) -> ObjectId {
        self.id
    }

    fn get(
        &self,
        vm: &VmSystem,
        offset: u64,
        pages: &mut [PageSlot],
        center: usize,
        _access: VmProt,
        _advice: Advice,
        flags: PgoFlags,
    ) -> PagerStatus {
        if flags.contains(PgoFlags::LOCKED) {
            self.locked_gets.fetch_add(1, Ordering::SeqCst);
            return get_resident(vm, self.id, offset, pages, center);
        }

        self.sync_gets.fetch_add(1, Ordering::SeqCst);
        if let Some(hook) = self.hook.lock().as_ref() {
            hook();
        }
        if let Some(status) = self.injected.lock().pop_front() {
            return status;
        }

        let off = offset + (center * PAGE_SIZE) as u64;
        if off >= self.npages * PAGE_SIZE as u64 {
            return PagerStatus::Error;
        }
        loop {
            let guard = self.lock.lock();
            if let Some(pg) = vm.pages.lookup_busy(self.id, off) {
                pages[center] = PageSlot::Found(pg);
                return PagerStatus::Ok;
            }
            if let Some(pg) = vm.pages.lookup(self.id, off) {
                vm.pages.wait_busy(pg, guard);
                continue;
            }
            return match vm.pages.alloc(PageOwner::object(self.id, off), AllocFlags::empty()) {
                Ok(pg) => {
                    self.fill(vm, pg, off);
                    pages[center] = PageSlot::Found(pg);
                    PagerStatus::Ok
                }
                Err(_) => match vm.wait_for_memory(guard) {
                    Ok(()) => PagerStatus::Again,
                    Err(_) => PagerStatus::Error,
                },
            };
        }
    }

    fn flush(&self, vm: &VmSystem, start: u64, end: u64, flags: FlushFlags) -> bool {
        self.flushes.fetch_add(1, Ordering::SeqCst);
        let _guard = self.lock.lock();
        let mut ok = true;
        if flags.contains(FlushFlags::CLEANIT) {
            let mut off = start;
            while off < end {
                if let Some(pg) = vm.pages.lookup_busy(self.id, off) {
                    if vm.pages.is_dirty(pg) {
                        ok &= self.write_back(vm, pg, off);
                    }
                    vm.pages.unbusy(pg, Placement::Active);
                }
                off += PAGE_SIZE as u64;
            }
        }
        if flags.contains(FlushFlags::DEACTIVATE) {
            deactivate_range(vm, self.id, start, end);
        }
        if flags.contains(FlushFlags::FREE) {
            let mut off = start;
            while off < end {
                if let Some(pg) = vm.pages.lookup_busy(self.id, off) {
                    if vm.pages.is_dirty(pg) || vm.pages.page(pg).wire_count() > 0 {
                        vm.pages.unbusy(pg, Placement::Inactive);
                    } else {
                        vm.pages.free(pg);
                    }
                }
                off += PAGE_SIZE as u64;
            }
        }
        ok
    }
}

// ============================================================================
// Device object
// ============================================================================

/// Device memory at a fixed physical base; resolves its own faults
pub struct DeviceObject {
    id: ObjectId,
    base: PhysAddr,
    faults: AtomicU32,
}

impl DeviceObject {
    pub fn new(base: PhysAddr) -> Arc<Self> {
        Arc::new(Self {
            id: ObjectId::allocate(),
            base,
            faults: AtomicU32::new(0),
        })
    }

    pub fn faults(&self) -> u32 {
        self.faults.load(Ordering::SeqCst)
    }
}

impl BackingObject for DeviceObject {
    fn id(&self) -> ObjectId {
        self.id
    }

    fn get(
        &self,
        _vm: &VmSystem,
        _offset: u64,
        _pages: &mut [PageSlot],
        _center: usize,
        _access: VmProt,
        _advice: Advice,
        _flags: PgoFlags,
    ) -> PagerStatus {
        PagerStatus::Error
    }

    fn fault(&self, _vm: &VmSystem, req: &mut FaultRequest<'_>) -> Option<PagerStatus> {
        self.faults.fetch_add(1, Ordering::SeqCst);
        let va = req.window.va(req.window.centeridx);
        let Some(offset) = req.entry.object_offset(va) else {
            return Some(PagerStatus::Error);
        };
        let status = match req.pmap.enter(va, self.base + offset, req.enter_prot, PmapFlags::CANFAIL) {
            Ok(()) => PagerStatus::Ok,
            Err(_) => PagerStatus::Again,
        };
        Some(status)
    }

    fn flush(&self, _vm: &VmSystem, _start: u64, _end: u64, _flags: FlushFlags) -> bool {
        true
    }
}
