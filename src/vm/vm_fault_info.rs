//! Fault-time map lookup and the versioned map lock
//!
//! A fault looks up its address once, with the map read-locked, and then
//! repeatedly drops and retakes the lock around anything that can block.
//! [`FaultInfo`] carries what the lookup found together with the map's
//! timestamp at that moment; [`FaultInfo::relock`] retakes the lock and
//! reports [`Stale`] if the map changed in between, in which case the
//! entry snapshot may be wrong and the fault must start over.
//!
//! Blocking helpers take the locks they must release by value through
//! the [`Unlock`] trait, so a caller cannot keep using a lock it handed
//! over.

use alloc::sync::Arc;
use spin::MutexGuard;

use crate::vm::vm_map::{VmMap, VmMapEntry};

/// Something that holds locks and can give them all up
pub trait Unlock {
    /// Release every lock held
    fn unlock(self);
}

impl Unlock for () {
    fn unlock(self) {}
}

impl<T> Unlock for MutexGuard<'_, T> {
    fn unlock(self) {
        drop(self);
    }
}

impl<T: Unlock> Unlock for Option<T> {
    fn unlock(self) {
        if let Some(locks) = self {
            locks.unlock();
        }
    }
}

impl<A: Unlock, B: Unlock> Unlock for (A, B) {
    fn unlock(self) {
        self.0.unlock();
        self.1.unlock();
    }
}

impl<A: Unlock, B: Unlock, C: Unlock> Unlock for (A, B, C) {
    fn unlock(self) {
        self.0.unlock();
        self.1.unlock();
        self.2.unlock();
    }
}

/// Ownership of a map lock (read or write); released on drop
#[derive(Debug)]
pub struct MapLock {
    map: Arc<VmMap>,
}

impl MapLock {
    /// Take `map`'s lock for reading
    pub fn read(map: &Arc<VmMap>) -> Self {
        map.lock().read();
        Self { map: Arc::clone(map) }
    }

    /// Take `map`'s lock for writing
    pub fn write(map: &Arc<VmMap>) -> Self {
        map.lock().write();
        Self { map: Arc::clone(map) }
    }

    pub fn map(&self) -> &Arc<VmMap> {
        &self.map
    }
}

impl Drop for MapLock {
    fn drop(&mut self) {
        self.map.lock().done();
    }
}

impl Unlock for MapLock {
    fn unlock(self) {
        drop(self);
    }
}

/// The map changed while it was unlocked
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Stale;

/// What a fault learned from the map, and the lock it holds
#[derive(Debug)]
pub struct FaultInfo {
    /// Map the fault was taken in
    pub orig_map: Arc<VmMap>,
    /// Faulting address (page aligned)
    pub orig_rvaddr: u64,
    /// Bytes of the faulting range
    pub orig_size: u64,
    /// Leaf map holding the entry (differs from `orig_map` under sub-maps)
    pub map: Arc<VmMap>,
    /// Snapshot of the matching leaf entry
    pub entry: VmMapEntry,
    /// `map`'s timestamp when `entry` was taken
    pub mapv: u64,
    lock: Option<MapLock>,
}

impl FaultInfo {
    /// Find the entry mapping `vaddr`, descending through sub-maps. The
    /// leaf map stays locked (for writing if `write_lock`); every other
    /// map is unlocked. `None` if no entry maps `vaddr`.
    pub fn lookup(orig_map: &Arc<VmMap>, vaddr: u64, write_lock: bool) -> Option<FaultInfo> {
        let mut map = Arc::clone(orig_map);
        loop {
            let lock = if write_lock {
                MapLock::write(&map)
            } else {
                MapLock::read(&map)
            };
            let entry = map.lookup_entry(vaddr)?;
            if let Some(submap) = entry.submap.clone() {
                drop(lock);
                map = submap;
                continue;
            }
            let mapv = map.timestamp();
            return Some(FaultInfo {
                orig_map: Arc::clone(orig_map),
                orig_rvaddr: vaddr,
                orig_size: crate::vm::vm_page::PAGE_SIZE as u64,
                map,
                entry,
                mapv,
                lock: Some(lock),
            });
        }
    }

    /// Retake the leaf map's read lock. Fails, leaving the map unlocked,
    /// if the map changed since the lookup.
    pub fn relock(&mut self) -> Result<(), Stale> {
        debug_assert!(self.lock.is_none(), "relock of a locked map");
        let lock = MapLock::read(&self.map);
        if self.map.timestamp() != self.mapv {
            drop(lock);
            return Err(Stale);
        }
        self.lock = Some(lock);
        Ok(())
    }

    /// Release the map lock, recording the address space's resident set
    /// high-water mark first. A no-op if already unlocked.
    pub fn unlock(&mut self) {
        if let Some(lock) = self.lock.take() {
            let map = &self.orig_map;
            map.rss_max.update_max(map.pmap().resident_count());
            drop(lock);
        }
    }

    pub fn is_locked(&self) -> bool {
        self.lock.is_some()
    }
}

impl Drop for FaultInfo {
    fn drop(&mut self) {
        self.unlock();
    }
}

impl Unlock for &mut FaultInfo {
    fn unlock(self) {
        FaultInfo::unlock(self);
    }
}
