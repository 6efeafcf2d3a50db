//! VM Map - Address Space Management
//!
//! A map is the virtual address space of a task: non-overlapping entries,
//! ordered by start address, that describe the mappings.
//!
//! An entry's memory comes from up to two layers: an amap of anons
//! (private, copy-on-write data) on top of a backing object. An entry may
//! instead refer to a sub-map, in which case lookups descend into it.
//! Copy-on-write is lazy: an entry marked `NEEDS_COPY` gets its own amap
//! on the first write fault, and fork only shares or marks amaps.
//!
//! ## Locking
//!
//! The map lock is a reader/writer lock held explicitly across the fault
//! path. Structural changes take it for writing and bump the map
//! timestamp; a fault that dropped the lock compares timestamps to decide
//! whether what it looked up is still valid.

use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::fmt;
use core::sync::atomic::{AtomicU64, Ordering};
use spin::Mutex;

use crate::kern::counters::MachCounter;
use crate::kern::lock::{ReadLockGuard, RwLock, WriteLockGuard};
use crate::vm::error::MapError;
use crate::vm::pmap::{Pmap, VirtAddr};
use crate::vm::vm_amap::Amap;
use crate::vm::vm_anon::anon_release;
use crate::vm::vm_object::{BackingObject, FlushFlags};
use crate::vm::vm_page::{atop, round_page, trunc_page, PAGE_SHIFT, PAGE_SIZE};
use crate::vm::VmSystem;

// ============================================================================
// VM Map Types
// ============================================================================

/// Memory protection flags
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct VmProt(u32);

impl VmProt {
    /// No access
    pub const NONE: Self = Self(0);
    /// Read access
    pub const READ: Self = Self(1);
    /// Write access
    pub const WRITE: Self = Self(2);
    /// Execute access
    pub const EXECUTE: Self = Self(4);
    /// Default (read/write)
    pub const DEFAULT: Self = Self(3);
    /// All permissions
    pub const ALL: Self = Self(7);

    /// Empty (no permissions)
    pub const fn empty() -> Self {
        Self(0)
    }

    pub const fn new(bits: u32) -> Self {
        Self(bits & 0x7)
    }

    pub const fn bits(&self) -> u32 {
        self.0
    }

    pub const fn contains(&self, other: Self) -> bool {
        (self.0 & other.0) == other.0
    }

    pub const fn union(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }

    pub const fn intersection(self, other: Self) -> Self {
        Self(self.0 & other.0)
    }

    /// `self` with the bits of `other` removed
    pub const fn without(self, other: Self) -> Self {
        Self(self.0 & !other.0)
    }

    pub const fn is_empty(&self) -> bool {
        self.0 == 0
    }

    pub const fn can_read(&self) -> bool {
        self.contains(Self::READ)
    }

    pub const fn can_write(&self) -> bool {
        self.contains(Self::WRITE)
    }

    pub const fn can_execute(&self) -> bool {
        self.contains(Self::EXECUTE)
    }
}

impl core::ops::BitOr for VmProt {
    type Output = Self;
    fn bitor(self, rhs: Self) -> Self::Output {
        self.union(rhs)
    }
}

impl core::ops::BitOrAssign for VmProt {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

impl core::ops::BitAnd for VmProt {
    type Output = Self;
    fn bitand(self, rhs: Self) -> Self::Output {
        self.intersection(rhs)
    }
}

impl Default for VmProt {
    fn default() -> Self {
        Self::DEFAULT
    }
}

/// Expected access pattern of an entry; selects the read-ahead window
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum Advice {
    #[default]
    Normal = 0,
    Random = 1,
    Sequential = 2,
}

/// Inheritance on fork
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum VmInherit {
    /// Don't inherit
    None = 0,
    /// Share the mapping
    Share = 1,
    /// Copy the mapping (copy-on-write)
    #[default]
    Copy = 2,
}

// ============================================================================
// VM Map Entry Flags
// ============================================================================

/// Map entry flags
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct EntryFlags(u32);

impl EntryFlags {
    /// The amap is shared with another entry and must be copied before
    /// the first write (or, with no object, before the first fault)
    pub const NEEDS_COPY: Self = Self(0x0001);
    /// Private mapping: writes go to anons, never to the object
    pub const COPY_ON_WRITE: Self = Self(0x0002);
    /// Backing store errors zero-fill instead of failing the fault
    pub const FAULT_TOLERANT: Self = Self(0x0004);

    pub const fn empty() -> Self {
        Self(0)
    }

    pub const fn bits(&self) -> u32 {
        self.0
    }

    pub const fn contains(&self, other: Self) -> bool {
        (self.0 & other.0) == other.0
    }

    pub const fn union(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }

    pub fn insert(&mut self, other: Self) {
        self.0 |= other.0;
    }

    pub fn remove(&mut self, other: Self) {
        self.0 &= !other.0;
    }
}

impl core::ops::BitOr for EntryFlags {
    type Output = Self;
    fn bitor(self, rhs: Self) -> Self {
        self.union(rhs)
    }
}

impl core::ops::BitOrAssign for EntryFlags {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

// ============================================================================
// Entry Backing
// ============================================================================

/// An entry's reference to an amap
#[derive(Debug, Clone)]
pub struct AmapRef {
    pub amap: Arc<Amap>,
    /// Amap slot of the entry's first page
    pub slotoff: usize,
}

/// An entry's reference to a backing object
#[derive(Debug, Clone)]
pub struct ObjectRef {
    pub object: Arc<dyn BackingObject>,
    /// Object offset of the entry's first page
    pub offset: u64,
}

/// What a new entry maps
#[derive(Clone)]
pub enum MapBacking {
    /// Zero-fill anonymous memory; the amap is created on first fault
    Anonymous,
    /// A backing object starting at `offset`
    Object {
        object: Arc<dyn BackingObject>,
        offset: u64,
    },
    /// A nested map covering the same addresses
    Submap(Arc<VmMap>),
}

// ============================================================================
// VM Map Entry
// ============================================================================

/// VM Map Entry - describes a single mapping in the address space.
///
/// Cloning an entry gives a snapshot; it does not take an amap reference.
#[derive(Debug, Clone)]
pub struct VmMapEntry {
    /// Start address of this entry
    pub start: u64,
    /// End address of this entry
    pub end: u64,
    /// Protection (current)
    pub protection: VmProt,
    /// Maximum protection
    pub max_protection: VmProt,
    /// Inheritance behavior
    pub inheritance: VmInherit,
    pub advice: Advice,
    pub flags: EntryFlags,
    /// Wire count
    pub wired_count: u32,
    pub amap: Option<AmapRef>,
    pub object: Option<ObjectRef>,
    pub submap: Option<Arc<VmMap>>,
}

impl VmMapEntry {
    /// A new entry with no backing
    pub fn new(start: u64, end: u64) -> Self {
        Self {
            start,
            end,
            protection: VmProt::DEFAULT,
            max_protection: VmProt::ALL,
            inheritance: VmInherit::default(),
            advice: Advice::default(),
            flags: EntryFlags::empty(),
            wired_count: 0,
            amap: None,
            object: None,
            submap: None,
        }
    }

    /// Get entry size
    pub fn size(&self) -> u64 {
        self.end - self.start
    }

    pub fn npages(&self) -> usize {
        atop(self.size())
    }

    /// Check if address is in this entry
    pub fn contains(&self, addr: u64) -> bool {
        addr >= self.start && addr < self.end
    }

    /// Check if this entry overlaps with a range
    pub fn overlaps(&self, start: u64, end: u64) -> bool {
        self.start < end && start < self.end
    }

    /// Check if entry is wired
    pub fn is_wired(&self) -> bool {
        self.wired_count > 0
    }

    pub fn is_submap(&self) -> bool {
        self.submap.is_some()
    }

    /// Amap slot backing `va`
    pub fn amap_slot(&self, va: u64) -> Option<usize> {
        let r = self.amap.as_ref()?;
        Some(r.slotoff + ((va - self.start) >> PAGE_SHIFT) as usize)
    }

    /// Object offset backing `va`
    pub fn object_offset(&self, va: u64) -> Option<u64> {
        let r = self.object.as_ref()?;
        Some(r.offset + (va - self.start))
    }

    /// Split this entry at `at`, returning the upper portion. The amap
    /// gains a reference for the new entry.
    fn split(&mut self, at: u64) -> VmMapEntry {
        debug_assert!(at > self.start && at < self.end);
        let delta = at - self.start;
        let mut upper = self.clone();
        upper.start = at;
        if let Some(r) = upper.amap.as_mut() {
            r.slotoff += (delta >> PAGE_SHIFT) as usize;
            r.amap.reference(false);
        }
        if let Some(r) = upper.object.as_mut() {
            r.offset += delta;
        }
        self.end = at;
        upper
    }
}

// ============================================================================
// VM Map
// ============================================================================

/// VM Map - represents a task's address space
pub struct VmMap {
    /// The map lock
    lock: RwLock,

    /// Map entries (ordered by start address); changed only under the
    /// map write lock
    entries: Mutex<BTreeMap<u64, VmMapEntry>>,

    /// Bumped by every change made under the write lock
    timestamp: AtomicU64,

    /// Hardware map of this address space
    pmap: Arc<dyn Pmap>,

    /// Minimum address
    pub min_offset: u64,

    /// Maximum address
    pub max_offset: u64,

    /// Largest resident set seen when a fault released the map
    pub rss_max: MachCounter,
}

impl fmt::Debug for VmMap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VmMap")
            .field("min_offset", &self.min_offset)
            .field("max_offset", &self.max_offset)
            .field("timestamp", &self.timestamp())
            .field("entries", &self.entry_count())
            .finish()
    }
}

impl VmMap {
    /// Create a new VM map
    pub fn new(pmap: Arc<dyn Pmap>, min: u64, max: u64) -> Arc<Self> {
        Arc::new(Self {
            lock: RwLock::new(),
            entries: Mutex::new(BTreeMap::new()),
            timestamp: AtomicU64::new(0),
            pmap,
            min_offset: min,
            max_offset: max,
            rss_max: MachCounter::new("rss_max"),
        })
    }

    pub fn pmap(&self) -> &Arc<dyn Pmap> {
        &self.pmap
    }

    pub(crate) fn lock(&self) -> &RwLock {
        &self.lock
    }

    /// Version stamp; changes whenever the entries change
    pub fn timestamp(&self) -> u64 {
        self.timestamp.load(Ordering::Acquire)
    }

    fn bump(&self) {
        self.timestamp.fetch_add(1, Ordering::AcqRel);
    }

    /// Get entry count
    pub fn entry_count(&self) -> usize {
        self.entries.lock().len()
    }

    /// Snapshot of the entry containing `addr` (caller holds the map lock)
    pub fn lookup_entry(&self, addr: u64) -> Option<VmMapEntry> {
        let entries = self.entries.lock();
        entries
            .range(..=addr)
            .next_back()
            .map(|(_, e)| e)
            .filter(|e| e.contains(addr))
            .cloned()
    }

    /// Install `entry` as is, bypassing every check
    #[cfg(test)]
    pub(crate) fn insert_entry(&self, entry: VmMapEntry) {
        let _guard = WriteLockGuard::new(&self.lock);
        self.entries.lock().insert(entry.start, entry);
        self.bump();
    }

    /// Snapshot of every entry
    pub fn entries(&self) -> Vec<VmMapEntry> {
        let _guard = ReadLockGuard::new(&self.lock);
        self.entries.lock().values().cloned().collect()
    }

    fn check_range(&self, start: u64, end: u64) -> Result<(), MapError> {
        if start >= end
            || start < self.min_offset
            || end > self.max_offset
            || start != trunc_page(start)
            || end != trunc_page(end)
        {
            return Err(MapError::InvalidRange);
        }
        Ok(())
    }

    /// Split entries so that `start` and `end` fall on entry boundaries
    fn clip(entries: &mut BTreeMap<u64, VmMapEntry>, start: u64, end: u64) {
        for at in [start, end] {
            let upper = entries
                .range_mut(..at)
                .next_back()
                .filter(|(_, e)| e.contains(at) && e.start != at)
                .map(|(_, e)| e.split(at));
            if let Some(upper) = upper {
                entries.insert(upper.start, upper);
            }
        }
    }

    /// Enter a new mapping
    #[allow(clippy::too_many_arguments)]
    pub fn enter(
        &self,
        start: u64,
        end: u64,
        backing: MapBacking,
        protection: VmProt,
        max_protection: VmProt,
        advice: Advice,
        flags: EntryFlags,
    ) -> Result<(), MapError> {
        self.check_range(start, end)?;
        if !max_protection.contains(protection) {
            return Err(MapError::ProtectionFailure);
        }

        let _guard = WriteLockGuard::new(&self.lock);
        let mut entries = self.entries.lock();
        if entries.values().any(|e| e.overlaps(start, end)) {
            return Err(MapError::NoSpace);
        }
        let entry = Self::new_entry(start, end, backing, protection, max_protection, advice, flags);
        entries.insert(start, entry);
        drop(entries);
        self.bump();
        log::debug!("vm_map: enter [{:#x}, {:#x}) prot {:?}", start, end, protection);
        Ok(())
    }

    /// Map `size` bytes at the lowest free address at or above `hint` and
    /// return that address. The maximum protection is `VmProt::ALL`.
    pub fn map_anywhere(
        &self,
        hint: u64,
        size: u64,
        backing: MapBacking,
        protection: VmProt,
        flags: EntryFlags,
    ) -> Result<u64, MapError> {
        if size == 0 || size != trunc_page(size) {
            return Err(MapError::InvalidRange);
        }
        let _guard = WriteLockGuard::new(&self.lock);
        let mut entries = self.entries.lock();
        let start = self
            .find_space_locked(&entries, hint, size, false)
            .ok_or(MapError::NoSpace)?;
        let end = start + size;
        let entry = Self::new_entry(start, end, backing, protection, VmProt::ALL, Advice::Normal, flags);
        entries.insert(start, entry);
        drop(entries);
        self.bump();
        log::debug!("vm_map: enter [{:#x}, {:#x}) for hint {:#x}", start, end, hint);
        Ok(start)
    }

    fn new_entry(
        start: u64,
        end: u64,
        backing: MapBacking,
        protection: VmProt,
        max_protection: VmProt,
        advice: Advice,
        flags: EntryFlags,
    ) -> VmMapEntry {
        let mut entry = VmMapEntry::new(start, end);
        entry.protection = protection;
        entry.max_protection = max_protection;
        entry.advice = advice;
        entry.flags = flags;
        match backing {
            MapBacking::Anonymous => {
                entry.flags |= EntryFlags::NEEDS_COPY | EntryFlags::COPY_ON_WRITE;
            }
            MapBacking::Object { object, offset } => {
                if flags.contains(EntryFlags::COPY_ON_WRITE) {
                    entry.flags |= EntryFlags::NEEDS_COPY;
                }
                entry.object = Some(ObjectRef { object, offset });
            }
            MapBacking::Submap(map) => {
                entry.submap = Some(map);
            }
        }
        entry
    }

    /// Lowest address at or above `hint` where `length` bytes fit between
    /// the map's bounds and existing entries. With `fixed`, only `hint`
    /// itself will do.
    pub fn find_space(&self, hint: u64, length: u64, fixed: bool) -> Option<u64> {
        let _guard = ReadLockGuard::new(&self.lock);
        self.find_space_locked(&self.entries.lock(), hint, length, fixed)
    }

    fn find_space_locked(
        &self,
        entries: &BTreeMap<u64, VmMapEntry>,
        hint: u64,
        length: u64,
        fixed: bool,
    ) -> Option<u64> {
        if length == 0 || length != trunc_page(length) || (fixed && hint != trunc_page(hint)) {
            return None;
        }
        let mut start = hint;
        if start < self.min_offset {
            if fixed {
                return None;
            }
            start = self.min_offset;
        }
        if start > self.max_offset {
            return None;
        }
        start = round_page(start);

        for e in entries.values() {
            if e.end <= start {
                continue;
            }
            if start.checked_add(length)? <= e.start {
                break;
            }
            if fixed {
                return None;
            }
            start = e.end;
        }
        let end = start.checked_add(length)?;
        (end <= self.max_offset).then_some(start)
    }

    /// True if `[start, end)` is mapped without holes and every entry
    /// over it allows `prot`
    pub fn check_protection(&self, start: u64, end: u64, prot: VmProt) -> bool {
        let _guard = ReadLockGuard::new(&self.lock);
        Self::covers(&self.entries.lock(), start, end, prot)
    }

    fn covers(entries: &BTreeMap<u64, VmMapEntry>, start: u64, end: u64, prot: VmProt) -> bool {
        if start >= end {
            return false;
        }
        let mut next = start;
        for e in entries.range(..end).map(|(_, e)| e).filter(|e| e.end > start) {
            if e.start > next || !e.protection.contains(prot) {
                return false;
            }
            next = e.end;
        }
        next >= end
    }

    /// Push the pages of `[start, end)` towards their backing store.
    ///
    /// Resident anon pages are deactivated. With `FlushFlags::FREE` the
    /// anons of an amap no other entry references are dropped instead, so
    /// the next touch sees zeroes. Each backing object is flushed over its
    /// part of the range with `CLEANIT` added; object pages are only freed
    /// behind writable shared mappings. Wired, busy and loaned pages are
    /// left alone.
    ///
    /// The range must be fully mapped and must not contain a sub-map.
    pub fn clean(&self, vm: &VmSystem, start: u64, end: u64, flags: FlushFlags) -> Result<(), MapError> {
        self.check_range(start, end)?;
        let _guard = ReadLockGuard::new(&self.lock);
        let targets: Vec<VmMapEntry> = {
            let entries = self.entries.lock();
            if !Self::covers(&entries, start, end, VmProt::NONE) {
                return Err(MapError::NotFound);
            }
            entries
                .range(..end)
                .map(|(_, e)| e)
                .filter(|e| e.end > start)
                .cloned()
                .collect()
        };
        if targets.iter().any(VmMapEntry::is_submap) {
            return Err(MapError::InvalidArgument);
        }

        let mut failed = false;
        for entry in &targets {
            let lo = entry.start.max(start);
            let hi = entry.end.min(end);
            if let Some(r) = &entry.amap {
                if flags.contains(FlushFlags::DEACTIVATE) || flags.contains(FlushFlags::FREE) {
                    self.clean_amap(vm, entry, r, lo, hi, flags);
                }
            }
            let Some(r) = &entry.object else {
                continue;
            };
            let private = entry.flags.contains(EntryFlags::COPY_ON_WRITE) || !entry.max_protection.can_write();
            if flags.contains(FlushFlags::FREE) && private {
                continue;
            }
            let offset = r.offset + (lo - entry.start);
            if !r.object.flush(vm, offset, offset + (hi - lo), flags | FlushFlags::CLEANIT) {
                log::warn!("vm_map: flush of {} at {:#x} failed", r.object.id(), offset);
                failed = true;
            }
        }
        log::debug!("vm_map: cleaned [{:#x}, {:#x}) {:?}", start, end, flags);
        if failed {
            return Err(MapError::FlushFailed);
        }
        Ok(())
    }

    /// Deactivate or drop the anons of `entry` over `[lo, hi)`
    fn clean_amap(&self, vm: &VmSystem, entry: &VmMapEntry, r: &AmapRef, lo: u64, hi: u64, flags: FlushFlags) {
        let mut amap = r.amap.lock();
        let drop_anons = flags.contains(FlushFlags::FREE) && amap.refs() == 1;
        let mut va = lo;
        while va < hi {
            let slot = r.slotoff + ((va - entry.start) >> PAGE_SHIFT) as usize;
            let this = va;
            va += PAGE_SIZE as u64;
            let Some(anon) = amap.lookup(slot).cloned() else {
                continue;
            };
            let Some(pg) = anon.page() else {
                continue;
            };
            let page = vm.pages.page(pg);
            if !page.owner().is_owned_by(&anon) || page.wire_count() > 0 || page.is_busy() {
                continue;
            }
            if drop_anons {
                self.pmap.remove(this, va);
                amap.unadd(slot);
                anon_release(vm, &anon);
            } else {
                vm.pages.deactivate_unmapped(pg);
            }
        }
        if drop_anons {
            self.pmap.update();
        }
    }

    /// Map zero-fill private memory
    pub fn enter_anonymous(&self, start: u64, end: u64, protection: VmProt) -> Result<(), MapError> {
        self.enter(
            start,
            end,
            MapBacking::Anonymous,
            protection,
            VmProt::ALL,
            Advice::Normal,
            EntryFlags::empty(),
        )
    }

    /// Map a sub-map over `[start, end)`
    pub fn submap(&self, start: u64, end: u64, submap: Arc<VmMap>) -> Result<(), MapError> {
        self.enter(
            start,
            end,
            MapBacking::Submap(submap),
            VmProt::ALL,
            VmProt::ALL,
            Advice::Normal,
            EntryFlags::empty(),
        )
    }

    /// Remove mappings in `[start, end)`
    pub fn remove(&self, vm: &VmSystem, start: u64, end: u64) -> Result<(), MapError> {
        self.check_range(start, end)?;
        let _guard = WriteLockGuard::new(&self.lock);
        let doomed: Vec<VmMapEntry> = {
            let mut entries = self.entries.lock();
            Self::clip(&mut entries, start, end);
            let keys: Vec<u64> = entries.range(start..end).map(|(&k, _)| k).collect();
            keys.into_iter().filter_map(|k| entries.remove(&k)).collect()
        };
        if doomed.is_empty() {
            return Err(MapError::NotFound);
        }
        self.bump();

        for entry in doomed {
            if entry.is_wired() {
                self.unwire_pages(vm, entry.start, entry.end);
            }
            if !entry.is_submap() {
                self.pmap.remove(entry.start, entry.end);
            }
            if let Some(r) = &entry.amap {
                r.amap.unref(vm);
            }
            log::debug!("vm_map: removed [{:#x}, {:#x})", entry.start, entry.end);
        }
        self.pmap.update();
        Ok(())
    }

    /// Drop the wiring of every mapped page in `[start, end)`
    pub(crate) fn unwire_pages(&self, vm: &VmSystem, start: u64, end: u64) {
        let mut va = start;
        while va < end {
            if let Some(pg) = self.pmap.extract(va).and_then(|pa| vm.pages.phys_to_page(pa)) {
                self.pmap.unwire(va);
                if vm.pages.page(pg).wire_count() > 0 {
                    vm.pages.unwire(pg);
                }
            }
            va += PAGE_SIZE as u64;
        }
    }

    /// Change protection on a range
    pub fn protect(&self, start: u64, end: u64, new_prot: VmProt) -> Result<(), MapError> {
        self.check_range(start, end)?;
        let _guard = WriteLockGuard::new(&self.lock);
        let mut entries = self.entries.lock();
        if entries
            .values()
            .any(|e| e.overlaps(start, end) && !e.max_protection.contains(new_prot))
        {
            return Err(MapError::ProtectionFailure);
        }
        Self::clip(&mut entries, start, end);
        for entry in entries.range_mut(start..end).map(|(_, e)| e) {
            entry.protection = new_prot;
            if entry.submap.is_none() {
                self.pmap.protect(entry.start, entry.end, new_prot);
            }
        }
        drop(entries);
        self.bump();
        Ok(())
    }

    /// Set the access pattern hint on a range
    pub fn advise(&self, start: u64, end: u64, advice: Advice) -> Result<(), MapError> {
        self.check_range(start, end)?;
        let _guard = WriteLockGuard::new(&self.lock);
        let mut entries = self.entries.lock();
        Self::clip(&mut entries, start, end);
        for entry in entries.range_mut(start..end).map(|(_, e)| e) {
            entry.advice = advice;
        }
        drop(entries);
        self.bump();
        Ok(())
    }

    /// Set the inheritance of a range
    pub fn inherit(&self, start: u64, end: u64, inheritance: VmInherit) -> Result<(), MapError> {
        self.check_range(start, end)?;
        let _guard = WriteLockGuard::new(&self.lock);
        let mut entries = self.entries.lock();
        Self::clip(&mut entries, start, end);
        for entry in entries.range_mut(start..end).map(|(_, e)| e) {
            entry.inheritance = inheritance;
        }
        drop(entries);
        self.bump();
        Ok(())
    }

    /// Adjust the wire count of every entry in `[start, end)`; the range
    /// must be fully mapped.
    pub(crate) fn set_wired(&self, start: u64, end: u64, wire: bool) -> Result<(), MapError> {
        self.check_range(start, end)?;
        let _guard = WriteLockGuard::new(&self.lock);
        let mut entries = self.entries.lock();

        let mut next = start;
        for e in entries.values().filter(|e| e.overlaps(start, end)) {
            if e.start > next || e.is_submap() || (!wire && !e.is_wired()) {
                return Err(MapError::InvalidArgument);
            }
            next = e.end;
        }
        if next < end {
            return Err(MapError::InvalidArgument);
        }

        Self::clip(&mut entries, start, end);
        for entry in entries.range_mut(start..end).map(|(_, e)| e) {
            if wire {
                entry.wired_count += 1;
            } else {
                entry.wired_count -= 1;
            }
        }
        drop(entries);
        self.bump();
        Ok(())
    }

    /// Give `entry` an amap it can write to
    fn copy_entry_amap(vm: &VmSystem, entry: &mut VmMapEntry) {
        let npages = entry.npages();
        match entry.amap.take() {
            None => {
                entry.amap = Some(AmapRef { amap: Amap::new(npages), slotoff: 0 });
            }
            Some(r) if r.amap.refs() == 1 && !r.amap.is_shared() => {
                entry.amap = Some(r);
            }
            Some(r) => {
                let copy = r.amap.copy(r.slotoff, npages);
                r.amap.unref(vm);
                entry.amap = Some(AmapRef { amap: copy, slotoff: 0 });
            }
        }
        entry.flags.remove(EntryFlags::NEEDS_COPY);
    }

    /// Resolve `NEEDS_COPY` on the entry containing `va`. Returns false if
    /// there is no such entry.
    pub fn amap_copy(&self, vm: &VmSystem, va: VirtAddr) -> bool {
        let _guard = WriteLockGuard::new(&self.lock);
        let mut entries = self.entries.lock();
        let Some(entry) = entries
            .range_mut(..=va)
            .next_back()
            .map(|(_, e)| e)
            .filter(|e| e.contains(va))
        else {
            return false;
        };
        if entry.flags.contains(EntryFlags::NEEDS_COPY) {
            Self::copy_entry_amap(vm, entry);
            log::trace!("vm_map: amap copy for [{:#x}, {:#x})", entry.start, entry.end);
            drop(entries);
            self.bump();
        }
        true
    }

    /// Create a child address space on `pmap` following each entry's
    /// inheritance. Copied entries share the amap copy-on-write: both
    /// sides are marked `NEEDS_COPY` and the parent loses write access to
    /// the range until it faults.
    pub fn fork(&self, vm: &VmSystem, pmap: Arc<dyn Pmap>) -> Result<Arc<VmMap>, MapError> {
        let child = VmMap::new(pmap, self.min_offset, self.max_offset);

        let _guard = WriteLockGuard::new(&self.lock);
        let mut entries = self.entries.lock();
        if entries
            .values()
            .any(|e| e.inheritance == VmInherit::Copy && e.is_wired())
        {
            return Err(MapError::InvalidArgument);
        }

        let mut inherited = BTreeMap::new();
        for entry in entries.values_mut() {
            match entry.inheritance {
                VmInherit::None => continue,
                VmInherit::Share => {
                    if entry.flags.contains(EntryFlags::NEEDS_COPY) {
                        Self::copy_entry_amap(vm, entry);
                    }
                    if let Some(r) = &entry.amap {
                        r.amap.reference(true);
                    }
                    let mut shared = entry.clone();
                    shared.wired_count = 0;
                    inherited.insert(shared.start, shared);
                }
                VmInherit::Copy => {
                    let mut copy = entry.clone();
                    if let Some(r) = &entry.amap {
                        if r.amap.is_shared() {
                            // Other maps write into this amap in place; the
                            // child needs its own slots now.
                            copy.amap = Some(AmapRef {
                                amap: r.amap.copy(r.slotoff, entry.npages()),
                                slotoff: 0,
                            });
                        } else {
                            r.amap.reference(false);
                            copy.flags |= EntryFlags::NEEDS_COPY;
                            entry.flags |= EntryFlags::NEEDS_COPY;
                        }
                    } else if entry.object.is_some() || entry.submap.is_none() {
                        copy.flags |= EntryFlags::NEEDS_COPY;
                        entry.flags |= EntryFlags::NEEDS_COPY;
                    }
                    copy.flags |= EntryFlags::COPY_ON_WRITE;
                    entry.flags |= EntryFlags::COPY_ON_WRITE;
                    if entry.submap.is_none() {
                        self.pmap
                            .protect(entry.start, entry.end, entry.protection.without(VmProt::WRITE));
                    }
                    inherited.insert(copy.start, copy);
                }
            }
        }
        drop(entries);
        self.bump();
        self.pmap.update();

        *child.entries.lock() = inherited;
        log::debug!("vm_map: fork -> {} entries", child.entry_count());
        Ok(child)
    }
}
