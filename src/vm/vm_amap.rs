//! Anonymous memory maps
//!
//! An amap is the copy-on-write overlay of a map entry: one slot per page,
//! each slot empty or referencing an anon. Entries share an amap (counted
//! in `refs`) after fork until a write fault forces a private copy
//! (`VmMap::amap_copy`). An amap referenced by entries in different maps
//! through share inheritance is marked `shared`; replacing an anon in a
//! shared amap must also revoke the old page's mappings in the other maps.

use alloc::sync::Arc;
use alloc::vec::Vec;
use spin::{Mutex, MutexGuard};

use crate::vm::vm_advice::MAX_RANGE;
use crate::vm::vm_anon::{anon_reference, anon_release, Anon};
use crate::vm::vm_map::VmProt;
use crate::vm::VmSystem;

/// Anons of a fault window
pub type AnonWindow = heapless::Vec<Option<Arc<Anon>>, MAX_RANGE>;

/// Amap state, under the amap lock
#[derive(Debug)]
pub struct AmapInner {
    slots: Vec<Option<Arc<Anon>>>,
    refs: u32,
    shared: bool,
    nused: usize,
}

impl AmapInner {
    pub fn nslots(&self) -> usize {
        self.slots.len()
    }

    /// Occupied slots
    pub fn nused(&self) -> usize {
        self.nused
    }

    pub fn refs(&self) -> u32 {
        self.refs
    }

    pub fn is_shared(&self) -> bool {
        self.shared
    }

    pub fn lookup(&self, slot: usize) -> Option<&Arc<Anon>> {
        self.slots.get(slot).and_then(Option::as_ref)
    }

    /// Put `anon` in an empty slot
    pub fn add(&mut self, slot: usize, anon: Arc<Anon>) {
        let old = self.slots[slot].replace(anon);
        debug_assert!(old.is_none(), "amap add over an occupied slot");
        self.nused += 1;
    }

    /// Swap the anon in an occupied slot, returning the old one. If the
    /// amap is shared, the old anon's page loses every hardware mapping so
    /// that other maps refault onto the new anon.
    pub fn replace(&mut self, vm: &VmSystem, slot: usize, anon: Arc<Anon>) -> Option<Arc<Anon>> {
        let old = self.slots[slot].replace(anon);
        debug_assert!(old.is_some(), "amap replace of an empty slot");
        if old.is_none() {
            self.nused += 1;
        }
        if self.shared {
            if let Some(pg) = old.as_ref().and_then(|a| a.page()) {
                vm.pages.phys().page_protect(vm.pages.phys_addr(pg), VmProt::NONE);
            }
        }
        old
    }

    /// Empty a slot
    pub fn unadd(&mut self, slot: usize) -> Option<Arc<Anon>> {
        let old = self.slots[slot].take();
        if old.is_some() {
            self.nused -= 1;
        }
        old
    }
}

/// A copy-on-write overlay
#[derive(Debug)]
pub struct Amap {
    inner: Mutex<AmapInner>,
}

impl Amap {
    /// An empty amap of `nslots` pages with one reference
    pub fn new(nslots: usize) -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(AmapInner {
                slots: (0..nslots).map(|_| None).collect(),
                refs: 1,
                shared: false,
                nused: 0,
            }),
        })
    }

    /// Lock the amap
    pub fn lock(&self) -> MutexGuard<'_, AmapInner> {
        self.inner.lock()
    }

    pub fn nslots(&self) -> usize {
        self.inner.lock().nslots()
    }

    pub fn refs(&self) -> u32 {
        self.inner.lock().refs
    }

    pub fn is_shared(&self) -> bool {
        self.inner.lock().shared
    }

    /// Take a reference for another entry; `shared` for share inheritance
    pub fn reference(&self, shared: bool) {
        let mut inner = self.inner.lock();
        inner.refs += 1;
        if shared {
            inner.shared = true;
        }
    }

    /// The anon at `slot`
    pub fn lookup(&self, slot: usize) -> Option<Arc<Anon>> {
        self.inner.lock().lookup(slot).cloned()
    }

    /// The anons of `n` slots starting at `slot` (past the end reads empty)
    pub fn lookups(&self, slot: usize, n: usize) -> AnonWindow {
        let inner = self.inner.lock();
        (slot..slot + n.min(MAX_RANGE))
            .map(|s| inner.lookup(s).cloned())
            .collect()
    }

    /// Record `anon` at `slot`. With `replace`, the slot must be occupied
    /// (see [`AmapInner::replace`]).
    pub fn add(&self, vm: &VmSystem, slot: usize, anon: Arc<Anon>, replace: bool) -> Option<Arc<Anon>> {
        let mut inner = self.inner.lock();
        if !replace {
            inner.add(slot, anon);
            return None;
        }
        inner.replace(vm, slot, anon)
    }

    /// Empty `slot`
    pub fn unadd(&self, slot: usize) -> Option<Arc<Anon>> {
        self.inner.lock().unadd(slot)
    }

    /// A private amap holding `nslots` slots from `slotoff`; every anon
    /// copied gains a reference.
    pub fn copy(&self, slotoff: usize, nslots: usize) -> Arc<Amap> {
        let inner = self.inner.lock();
        let mut slots = Vec::with_capacity(nslots);
        let mut nused = 0;
        for s in slotoff..slotoff + nslots {
            let anon = inner.lookup(s).cloned();
            if let Some(a) = &anon {
                anon_reference(a);
                nused += 1;
            }
            slots.push(anon);
        }
        Arc::new(Self {
            inner: Mutex::new(AmapInner {
                slots,
                refs: 1,
                shared: false,
                nused,
            }),
        })
    }

    /// Drop an entry's reference; the last one releases every anon
    pub fn unref(&self, vm: &VmSystem) {
        let dead = {
            let mut inner = self.inner.lock();
            debug_assert!(inner.refs > 0, "amap reference underflow");
            inner.refs -= 1;
            if inner.refs == 1 {
                inner.shared = false;
            }
            if inner.refs > 0 {
                return;
            }
            inner.nused = 0;
            core::mem::take(&mut inner.slots)
        };
        for anon in dead.into_iter().flatten() {
            anon_release(vm, &anon);
        }
    }
}
