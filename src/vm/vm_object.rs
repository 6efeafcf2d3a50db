//! Backing Object Bridge
//!
//! The lower of a mapping's two layers. Private copy-on-write data lives
//! in amaps and anons above; below them a backing object supplies the
//! pages of a file, a device or an anonymous-object pager. Objects keep
//! no shadow chains: a copy-on-write entry promotes object pages into
//! its amap, so an object only ever holds its own data.
//!
//! The fault path never looks inside an object; it only asks it to
//!
//! - `get` pages, either without blocking (`PgoFlags::LOCKED`, resident
//!   pages only) or synchronously (`PgoFlags::SYNCIO`, may do I/O),
//! - handle a whole fault itself (`fault`, for device-style objects), or
//! - `flush` a range (sequential read-ahead deactivates pages it has
//!   moved past; [`VmMap::clean`](crate::vm::vm_map::VmMap::clean) writes
//!   dirty pages back and frees them).
//!
//! Pages an object hands back are resident, owned by the object, hashed
//! under `(object, offset)` and busy; the caller unbusies them.
//! [`get_resident`] and [`deactivate_range`] implement the common
//! resident-page parts of that contract for object implementations.

use alloc::sync::Arc;
use core::fmt;
use core::sync::atomic::{AtomicU64, Ordering};

use crate::vm::pmap::Pmap;
use crate::vm::vm_advice::FaultWindow;
use crate::vm::vm_fault::FaultType;
use crate::vm::vm_map::{Advice, VmMap, VmMapEntry, VmProt};
use crate::vm::vm_page::{PageId, PAGE_SIZE};
use crate::vm::VmSystem;

// ============================================================================
// Object Identity
// ============================================================================

/// VM Object ID
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ObjectId(pub u64);

static NEXT_OBJECT_ID: AtomicU64 = AtomicU64::new(1);

impl ObjectId {
    /// Null object ID
    pub const NULL: Self = Self(0);

    /// Allocate a fresh, never reused object ID
    pub fn allocate() -> Self {
        Self(NEXT_OBJECT_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "obj#{}", self.0)
    }
}

// ============================================================================
// Pager Protocol
// ============================================================================

/// Pager operation status
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PagerStatus {
    /// Operation succeeded
    Ok,
    /// Transient failure; try again later
    Again,
    /// I/O error
    Error,
    /// Operation was started asynchronously
    Pend,
    /// The map may have changed; restart the fault
    Refault,
}

/// Flags for `BackingObject::get`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PgoFlags(u32);

impl PgoFlags {
    /// Caller holds the map lock: return resident pages only, never block
    pub const LOCKED: Self = Self(0x0001);
    /// Synchronous I/O; the caller holds no locks
    pub const SYNCIO: Self = Self(0x0002);

    pub const fn empty() -> Self {
        Self(0)
    }

    pub const fn contains(&self, other: Self) -> bool {
        (self.0 & other.0) == other.0
    }
}

/// Flags for `BackingObject::flush`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FlushFlags(u32);

impl FlushFlags {
    /// Move resident pages to the inactive queue
    pub const DEACTIVATE: Self = Self(0x0001);
    /// Write dirty pages back; they stay resident and clean
    pub const CLEANIT: Self = Self(0x0002);
    /// Free unwired pages; with `CLEANIT` dirty ones are written first,
    /// without it dirty ones stay
    pub const FREE: Self = Self(0x0004);

    pub const fn empty() -> Self {
        Self(0)
    }

    pub const fn contains(&self, other: Self) -> bool {
        (self.0 & other.0) == other.0
    }
}

impl core::ops::BitOr for FlushFlags {
    type Output = Self;
    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

/// One slot of a `get` request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageSlot {
    /// Wanted but not (yet) supplied
    Empty,
    /// Shadowed by an anon; the object must not fill it
    DontCare,
    /// Supplied page, busy on behalf of the caller
    Found(PageId),
}

impl PageSlot {
    pub fn page(&self) -> Option<PageId> {
        match *self {
            PageSlot::Found(pg) => Some(pg),
            _ => None,
        }
    }
}

/// Everything an object needs to resolve a fault on its own
pub struct FaultRequest<'a> {
    /// The map the fault happened in
    pub map: &'a Arc<VmMap>,
    /// Its hardware map
    pub pmap: &'a dyn Pmap,
    /// Snapshot of the matched entry
    pub entry: &'a VmMapEntry,
    /// Read-ahead window around the faulting page
    pub window: FaultWindow,
    /// Window slots; `DontCare` where an anon shadows the object
    pub pages: &'a mut [PageSlot],
    pub fault_type: FaultType,
    pub access: VmProt,
    pub enter_prot: VmProt,
    pub wired: bool,
}

/// A pager-backed memory object
pub trait BackingObject: Send + Sync {
    /// Identity used for the page hash
    fn id(&self) -> ObjectId;

    /// Fill `pages` (which start at object `offset`) with busy pages.
    ///
    /// With `PgoFlags::LOCKED` only resident pages are returned, `Empty`
    /// slots may stay empty and the call must not block. Otherwise the
    /// page at `center` must be produced (possibly by I/O) or an error
    /// returned.
    fn get(
        &self,
        vm: &VmSystem,
        offset: u64,
        pages: &mut [PageSlot],
        center: usize,
        access: VmProt,
        advice: Advice,
        flags: PgoFlags,
    ) -> PagerStatus;

    /// Handle the whole fault. `None` means the object has no fault
    /// routine and the generic `get` path is used.
    fn fault(&self, _vm: &VmSystem, _req: &mut FaultRequest<'_>) -> Option<PagerStatus> {
        None
    }

    /// Apply `flags` to resident pages in `[start, end)`. Returns false
    /// if writing a dirty page back failed.
    fn flush(&self, vm: &VmSystem, start: u64, end: u64, flags: FlushFlags) -> bool;
}

impl fmt::Debug for dyn BackingObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BackingObject({})", self.id())
    }
}

// ============================================================================
// Resident Page Helpers
// ============================================================================

/// Non-blocking `get`: busy and return every resident, idle page.
///
/// Returns `Ok` when the page at `center` was supplied, `Again` otherwise.
pub fn get_resident(
    vm: &VmSystem,
    object: ObjectId,
    offset: u64,
    pages: &mut [PageSlot],
    center: usize,
) -> PagerStatus {
    let mut got_center = false;
    for (i, slot) in pages.iter_mut().enumerate() {
        if *slot != PageSlot::Empty {
            continue;
        }
        let off = offset + (i * PAGE_SIZE) as u64;
        if let Some(pg) = vm.pages.lookup_busy(object, off) {
            *slot = PageSlot::Found(pg);
            got_center |= i == center;
        }
    }
    if got_center {
        PagerStatus::Ok
    } else {
        PagerStatus::Again
    }
}

/// `FlushFlags::DEACTIVATE` over resident pages of `object` in `[start, end)`
pub fn deactivate_range(vm: &VmSystem, object: ObjectId, start: u64, end: u64) -> usize {
    let mut count = 0;
    let mut off = start;
    while off < end {
        if let Some(pg) = vm.pages.lookup(object, off) {
            if vm.pages.deactivate_unmapped(pg) {
                count += 1;
            }
        }
        off += PAGE_SIZE as u64;
    }
    count
}
