//! Software MMU
//!
//! A machine-independent implementation of [`Pmap`] and [`PhysMemory`]
//! that keeps translations in ordered maps and page contents in lazily
//! allocated buffers. It lets the VM subsystem run on a hosted target:
//! `SoftPmap::write`/`read` behave like user loads and stores, checking
//! the installed protection and setting the modify and reference bits,
//! and report when the access would trap.
//!
//! ## Structure
//!
//! - `SoftMmu` owns physical page contents, the per-page attribute bits
//!   and the pv table (every virtual mapping of each physical page).
//! - `SoftPmap` owns one address space's translations.
//!
//! Lock order: pmap translations before the pv table. `page_protect`
//! snapshots the pv list and drops the pv lock before visiting pmaps.

use alloc::boxed::Box;
use alloc::collections::BTreeMap;
use alloc::sync::{Arc, Weak};
use alloc::vec;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use spin::Mutex;

use crate::vm::error::PmapError;
use crate::vm::pmap::{PhysAddr, PhysMemory, Pmap, PmapFlags, PmapId, PmapStats, VirtAddr};
use crate::vm::vm_map::VmProt;
use crate::vm::vm_page::{trunc_page, PAGE_SIZE};

/// Page attribute: modified
const ATTR_MOD: u8 = 0x01;
/// Page attribute: referenced
const ATTR_REF: u8 = 0x02;

// ============================================================================
// Translation Entry
// ============================================================================

/// A software page table entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Pte {
    pub pa: PhysAddr,
    pub prot: VmProt,
    pub wired: bool,
}

/// A user access that would trap
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AccessFault {
    /// Faulting (page-aligned) address
    pub va: VirtAddr,
    /// Access that was attempted
    pub access: VmProt,
    /// True if a translation exists but lacks permission
    pub protection: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct PvEntry {
    pmap: PmapId,
    va: VirtAddr,
}

// ============================================================================
// Software MMU (machine-wide state)
// ============================================================================

/// Machine-wide physical memory and reverse-mapping state
pub struct SoftMmu {
    /// Page contents; a missing page reads as zeroes
    frames: Mutex<BTreeMap<PhysAddr, Box<[u8]>>>,
    /// Modify/reference bits per physical page
    attrs: Mutex<BTreeMap<PhysAddr, u8>>,
    /// Reverse mappings per physical page
    pv: Mutex<BTreeMap<PhysAddr, Vec<PvEntry>>>,
    /// Live address spaces
    pmaps: Mutex<BTreeMap<PmapId, Weak<SoftPmap>>>,
    next_pmap: AtomicU64,
}

impl SoftMmu {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            frames: Mutex::new(BTreeMap::new()),
            attrs: Mutex::new(BTreeMap::new()),
            pv: Mutex::new(BTreeMap::new()),
            pmaps: Mutex::new(BTreeMap::new()),
            next_pmap: AtomicU64::new(PmapId::KERNEL.0 + 1),
        })
    }

    /// Create an address space on this MMU
    pub fn create_pmap(self: &Arc<Self>) -> Arc<SoftPmap> {
        let id = PmapId(self.next_pmap.fetch_add(1, Ordering::Relaxed));
        let pmap = Arc::new(SoftPmap {
            id,
            mmu: Arc::clone(self),
            ptes: Mutex::new(BTreeMap::new()),
            stats: PmapStats::new(),
            fail_enters: AtomicU32::new(0),
        });
        self.pmaps.lock().insert(id, Arc::downgrade(&pmap));
        pmap
    }

    /// Copy of a physical page's contents
    pub fn read_phys(&self, pa: PhysAddr) -> Vec<u8> {
        match self.frames.lock().get(&trunc_page(pa)) {
            Some(bytes) => bytes.to_vec(),
            None => vec![0; PAGE_SIZE],
        }
    }

    /// Overwrite part of a physical page (device DMA; no attribute change)
    pub fn write_phys(&self, pa: PhysAddr, data: &[u8]) {
        let base = trunc_page(pa);
        let off = (pa - base) as usize;
        assert!(off + data.len() <= PAGE_SIZE, "write_phys crosses a page boundary");
        let mut frames = self.frames.lock();
        let frame = frames
            .entry(base)
            .or_insert_with(|| vec![0u8; PAGE_SIZE].into_boxed_slice());
        frame[off..off + data.len()].copy_from_slice(data);
    }

    /// Number of virtual mappings of a physical page
    pub fn mapping_count(&self, pa: PhysAddr) -> usize {
        self.pv.lock().get(&trunc_page(pa)).map_or(0, Vec::len)
    }

    fn set_attr(&self, pa: PhysAddr, bits: u8) {
        *self.attrs.lock().entry(pa).or_insert(0) |= bits;
    }

    fn test_attr(&self, pa: PhysAddr, bits: u8) -> bool {
        self.attrs.lock().get(&pa).is_some_and(|a| a & bits != 0)
    }

    fn clear_attr(&self, pa: PhysAddr, bits: u8) -> bool {
        let mut attrs = self.attrs.lock();
        match attrs.get_mut(&pa) {
            Some(a) => {
                let was = *a & bits != 0;
                *a &= !bits;
                was
            }
            None => false,
        }
    }

    fn pv_enter(&self, pa: PhysAddr, pmap: PmapId, va: VirtAddr) {
        self.pv.lock().entry(pa).or_default().push(PvEntry { pmap, va });
    }

    fn pv_remove(&self, pa: PhysAddr, pmap: PmapId, va: VirtAddr) {
        let mut pv = self.pv.lock();
        if let Some(list) = pv.get_mut(&pa) {
            list.retain(|e| !(e.pmap == pmap && e.va == va));
            if list.is_empty() {
                pv.remove(&pa);
            }
        }
    }
}

impl PhysMemory for SoftMmu {
    fn page_protect(&self, pa: PhysAddr, prot: VmProt) {
        let pa = trunc_page(pa);
        let entries = match self.pv.lock().get(&pa) {
            Some(list) => list.clone(),
            None => return,
        };
        for entry in entries {
            let pmap = self.pmaps.lock().get(&entry.pmap).and_then(Weak::upgrade);
            match pmap {
                Some(pmap) => pmap.protect_one(entry.va, pa, prot),
                None => self.pv_remove(pa, entry.pmap, entry.va),
            }
        }
    }

    fn clear_modify(&self, pa: PhysAddr) -> bool {
        self.clear_attr(trunc_page(pa), ATTR_MOD)
    }

    fn clear_reference(&self, pa: PhysAddr) -> bool {
        self.clear_attr(trunc_page(pa), ATTR_REF)
    }

    fn is_modified(&self, pa: PhysAddr) -> bool {
        self.test_attr(trunc_page(pa), ATTR_MOD)
    }

    fn is_referenced(&self, pa: PhysAddr) -> bool {
        self.test_attr(trunc_page(pa), ATTR_REF)
    }

    fn zero_page(&self, pa: PhysAddr) {
        self.frames.lock().remove(&trunc_page(pa));
    }

    fn copy_page(&self, src: PhysAddr, dst: PhysAddr) {
        let mut frames = self.frames.lock();
        match frames.get(&trunc_page(src)).cloned() {
            Some(bytes) => {
                frames.insert(trunc_page(dst), bytes);
            }
            None => {
                frames.remove(&trunc_page(dst));
            }
        }
    }
}

// ============================================================================
// Software Pmap (one address space)
// ============================================================================

/// Translations of one address space
pub struct SoftPmap {
    id: PmapId,
    mmu: Arc<SoftMmu>,
    ptes: Mutex<BTreeMap<VirtAddr, Pte>>,
    stats: PmapStats,
    /// Pending injected `enter` failures
    fail_enters: AtomicU32,
}

impl SoftPmap {
    pub fn id(&self) -> PmapId {
        self.id
    }

    pub fn stats(&self) -> &PmapStats {
        &self.stats
    }

    /// The translation at `va`, if any
    pub fn lookup(&self, va: VirtAddr) -> Option<Pte> {
        self.ptes.lock().get(&trunc_page(va)).copied()
    }

    /// Make the next `count` `CANFAIL` enters report a resource shortage
    pub fn inject_enter_failures(&self, count: u32) {
        self.fail_enters.store(count, Ordering::SeqCst);
    }

    /// Check a user access and set the page's reference/modify bits.
    pub fn access(&self, va: VirtAddr, access: VmProt) -> Result<PhysAddr, AccessFault> {
        let page = trunc_page(va);
        let ptes = self.ptes.lock();
        match ptes.get(&page) {
            Some(pte) if pte.prot.contains(access) => {
                let mut bits = ATTR_REF;
                if access.can_write() {
                    bits |= ATTR_MOD;
                }
                self.mmu.set_attr(pte.pa, bits);
                Ok(pte.pa + (va - page))
            }
            Some(_) => Err(AccessFault { va: page, access, protection: true }),
            None => Err(AccessFault { va: page, access, protection: false }),
        }
    }

    /// User store of `data` at `va` (must not cross a page)
    pub fn write(&self, va: VirtAddr, data: &[u8]) -> Result<(), AccessFault> {
        let pa = self.access(va, VmProt::WRITE)?;
        self.mmu.write_phys(pa, data);
        Ok(())
    }

    /// User load of `len` bytes at `va` (must not cross a page)
    pub fn read(&self, va: VirtAddr, len: usize) -> Result<Vec<u8>, AccessFault> {
        let pa = self.access(va, VmProt::READ)?;
        let off = (pa - trunc_page(pa)) as usize;
        let page = self.mmu.read_phys(pa);
        Ok(page[off..off + len].to_vec())
    }

    /// Apply a machine-wide protection change to the translation `va -> pa`
    fn protect_one(&self, va: VirtAddr, pa: PhysAddr, prot: VmProt) {
        let mut ptes = self.ptes.lock();
        let Some(pte) = ptes.get_mut(&va) else {
            return;
        };
        if pte.pa != pa {
            return;
        }
        if prot == VmProt::NONE {
            let removed = *pte;
            ptes.remove(&va);
            self.note_removed(&removed);
            self.mmu.pv_remove(pa, self.id, va);
        } else {
            pte.prot = pte.prot & prot;
        }
    }

    fn note_removed(&self, pte: &Pte) {
        self.stats.resident_count.fetch_sub(1, Ordering::Relaxed);
        if pte.wired {
            self.stats.wired_count.fetch_sub(1, Ordering::Relaxed);
        }
    }
}

impl Pmap for SoftPmap {
    fn enter(&self, va: VirtAddr, pa: PhysAddr, prot: VmProt, flags: PmapFlags) -> Result<(), PmapError> {
        if flags.contains(PmapFlags::CANFAIL)
            && self
                .fail_enters
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
        {
            return Err(PmapError::ResourceShortage);
        }

        let va = trunc_page(va);
        let pa = trunc_page(pa);
        let wired = flags.contains(PmapFlags::WIRED);
        let mut ptes = self.ptes.lock();
        match ptes.insert(va, Pte { pa, prot, wired }) {
            Some(old) => {
                if old.wired {
                    self.stats.wired_count.fetch_sub(1, Ordering::Relaxed);
                }
                if old.pa != pa {
                    self.mmu.pv_remove(old.pa, self.id, va);
                    self.mmu.pv_enter(pa, self.id, va);
                }
            }
            None => {
                self.stats.resident_count.fetch_add(1, Ordering::Relaxed);
                self.mmu.pv_enter(pa, self.id, va);
            }
        }
        if wired {
            self.stats.wired_count.fetch_add(1, Ordering::Relaxed);
        }
        Ok(())
    }

    fn extract(&self, va: VirtAddr) -> Option<PhysAddr> {
        self.lookup(va).map(|pte| pte.pa + (va - trunc_page(va)))
    }

    fn remove(&self, start: VirtAddr, end: VirtAddr) {
        let mut ptes = self.ptes.lock();
        let doomed: Vec<VirtAddr> = ptes.range(start..end).map(|(va, _)| *va).collect();
        for va in doomed {
            if let Some(pte) = ptes.remove(&va) {
                self.note_removed(&pte);
                self.mmu.pv_remove(pte.pa, self.id, va);
            }
        }
    }

    fn protect(&self, start: VirtAddr, end: VirtAddr, prot: VmProt) {
        if prot == VmProt::NONE {
            self.remove(start, end);
            return;
        }
        for (_, pte) in self.ptes.lock().range_mut(start..end) {
            pte.prot = pte.prot & prot;
        }
    }

    fn unwire(&self, va: VirtAddr) {
        if let Some(pte) = self.ptes.lock().get_mut(&trunc_page(va)) {
            if pte.wired {
                pte.wired = false;
                self.stats.wired_count.fetch_sub(1, Ordering::Relaxed);
            }
        }
    }

    fn resident_count(&self) -> u64 {
        u64::from(self.stats.resident())
    }
}

impl Drop for SoftPmap {
    fn drop(&mut self) {
        let ptes = core::mem::take(&mut *self.ptes.lock());
        for (va, pte) in ptes {
            self.mmu.pv_remove(pte.pa, self.id, va);
        }
        self.mmu.pmaps.lock().remove(&self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const RW: VmProt = VmProt::READ.union(VmProt::WRITE);

    #[test]
    fn test_enter_extract_remove() {
        let mmu = SoftMmu::new();
        let pmap = mmu.create_pmap();
        pmap.enter(0x4000, 0x10_000, RW, PmapFlags::empty()).unwrap();
        assert_eq!(pmap.extract(0x4010), Some(0x10_010));
        assert_eq!(pmap.resident_count(), 1);
        assert_eq!(mmu.mapping_count(0x10_000), 1);

        pmap.remove(0x4000, 0x5000);
        assert_eq!(pmap.extract(0x4000), None);
        assert_eq!(pmap.resident_count(), 0);
        assert_eq!(mmu.mapping_count(0x10_000), 0);
    }

    #[test]
    fn test_access_sets_attributes() {
        let mmu = SoftMmu::new();
        let pmap = mmu.create_pmap();
        pmap.enter(0x4000, 0x10_000, RW, PmapFlags::empty()).unwrap();

        assert_eq!(pmap.read(0x4000, 1).unwrap(), vec![0]);
        assert!(mmu.is_referenced(0x10_000));
        assert!(!mmu.is_modified(0x10_000));

        pmap.write(0x4008, b"mach").unwrap();
        assert!(mmu.is_modified(0x10_000));
        assert_eq!(pmap.read(0x4008, 4).unwrap(), b"mach".to_vec());

        assert!(mmu.clear_modify(0x10_000));
        assert!(!mmu.is_modified(0x10_000));
    }

    #[test]
    fn test_access_faults() {
        let mmu = SoftMmu::new();
        let pmap = mmu.create_pmap();
        pmap.enter(0x4000, 0x10_000, VmProt::READ, PmapFlags::empty()).unwrap();

        let err = pmap.write(0x4000, b"x").unwrap_err();
        assert!(err.protection);
        let err = pmap.read(0x8000, 1).unwrap_err();
        assert!(!err.protection);
        assert_eq!(err.va, 0x8000);
    }

    #[test]
    fn test_page_protect_reaches_every_pmap() {
        let mmu = SoftMmu::new();
        let a = mmu.create_pmap();
        let b = mmu.create_pmap();
        a.enter(0x1000, 0x20_000, RW, PmapFlags::empty()).unwrap();
        b.enter(0x7000, 0x20_000, RW, PmapFlags::empty()).unwrap();

        mmu.page_protect(0x20_000, VmProt::READ);
        assert_eq!(a.lookup(0x1000).unwrap().prot, VmProt::READ);
        assert_eq!(b.lookup(0x7000).unwrap().prot, VmProt::READ);

        mmu.page_protect(0x20_000, VmProt::NONE);
        assert!(a.lookup(0x1000).is_none());
        assert!(b.lookup(0x7000).is_none());
        assert_eq!(mmu.mapping_count(0x20_000), 0);
    }

    #[test]
    fn test_copy_and_zero() {
        let mmu = SoftMmu::new();
        mmu.write_phys(0x3000, b"data");
        mmu.copy_page(0x3000, 0x5000);
        assert_eq!(&mmu.read_phys(0x5000)[..4], b"data");
        mmu.zero_page(0x5000);
        assert!(mmu.read_phys(0x5000).iter().all(|&b| b == 0));
    }

    #[test]
    fn test_injected_enter_failure() {
        let mmu = SoftMmu::new();
        let pmap = mmu.create_pmap();
        pmap.inject_enter_failures(1);
        assert_eq!(
            pmap.enter(0x1000, 0x2000, RW, PmapFlags::CANFAIL),
            Err(PmapError::ResourceShortage)
        );
        assert!(pmap.enter(0x1000, 0x2000, RW, PmapFlags::CANFAIL).is_ok());
    }

    #[test]
    fn test_wired_accounting() {
        let mmu = SoftMmu::new();
        let pmap = mmu.create_pmap();
        pmap.enter(0x1000, 0x2000, RW, PmapFlags::WIRED).unwrap();
        assert_eq!(pmap.stats().wired(), 1);
        pmap.unwire(0x1000);
        assert_eq!(pmap.stats().wired(), 0);
        assert!(!pmap.lookup(0x1000).unwrap().wired);
    }
}
