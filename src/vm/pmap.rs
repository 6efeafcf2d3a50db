//! Physical Map (pmap) - Hardware Mapping Capability
//!
//! Based on Mach4 vm/pmap.h
//!
//! The machine-independent VM layer never touches page tables directly.
//! It talks to two capabilities:
//!
//! - [`Pmap`]: one per address space; installs and removes translations
//!   for virtual addresses.
//! - [`PhysMemory`]: machine-wide operations keyed by physical page
//!   (remove every mapping of a page, read or clear its modify and
//!   reference bits, zero or copy its contents).
//!
//! ## Key Operations
//!
//! - `enter`: install a mapping from virtual to physical. May fail with
//!   a resource shortage when called with `PmapFlags::CANFAIL`; the fault
//!   path treats that as transient and restarts.
//! - `remove`: remove mappings in a range
//! - `protect`: reduce protection on existing mappings
//! - `extract`: get the physical address for a virtual address
//!
//! `vm::soft_pmap` provides a software implementation of both traits.

use core::sync::atomic::{AtomicU32, Ordering};

use crate::vm::error::PmapError;
use crate::vm::vm_map::VmProt;

/// Physical address
pub type PhysAddr = u64;

/// Virtual address
pub type VirtAddr = u64;

// ============================================================================
// Pmap ID
// ============================================================================

/// Pmap identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PmapId(pub u64);

impl PmapId {
    pub const KERNEL: Self = Self(1);
    pub const NULL: Self = Self(0);
}

// ============================================================================
// Enter Flags
// ============================================================================

/// Flags for `Pmap::enter`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PmapFlags(u32);

impl PmapFlags {
    /// Mapping is wired (not subject to pmap-level reclaim)
    pub const WIRED: Self = Self(0x0001);
    /// Caller can handle a resource shortage
    pub const CANFAIL: Self = Self(0x0002);

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
}

impl core::ops::BitOr for PmapFlags {
    type Output = Self;
    fn bitor(self, rhs: Self) -> Self {
        self.union(rhs)
    }
}

// ============================================================================
// Pmap Statistics
// ============================================================================

/// Statistics for a pmap
#[derive(Debug, Default)]
pub struct PmapStats {
    /// Number of resident pages
    pub resident_count: AtomicU32,
    /// Number of wired pages
    pub wired_count: AtomicU32,
}

impl PmapStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn resident(&self) -> u32 {
        self.resident_count.load(Ordering::Relaxed)
    }

    pub fn wired(&self) -> u32 {
        self.wired_count.load(Ordering::Relaxed)
    }
}

// ============================================================================
// Capabilities
// ============================================================================

/// Per-address-space hardware mapping
pub trait Pmap: Send + Sync {
    /// Install a translation `va -> pa` with protection `prot`.
    fn enter(&self, va: VirtAddr, pa: PhysAddr, prot: VmProt, flags: PmapFlags) -> Result<(), PmapError>;

    /// Physical address currently mapped at `va`
    fn extract(&self, va: VirtAddr) -> Option<PhysAddr>;

    /// Remove all translations in `[start, end)`
    fn remove(&self, start: VirtAddr, end: VirtAddr);

    /// Restrict protection of translations in `[start, end)` to `prot`
    fn protect(&self, start: VirtAddr, end: VirtAddr, prot: VmProt);

    /// Clear the wired attribute of the translation at `va`
    fn unwire(&self, va: VirtAddr);

    /// Flush deferred operations (TLB shootdowns)
    fn update(&self) {}

    /// Number of resident translations
    fn resident_count(&self) -> u64;
}

/// Machine-wide operations on physical pages
pub trait PhysMemory: Send + Sync {
    /// Restrict every mapping of `pa` to `prot`; `VmProt::NONE` removes them.
    fn page_protect(&self, pa: PhysAddr, prot: VmProt);

    /// Clear the modify bit, returning its previous value
    fn clear_modify(&self, pa: PhysAddr) -> bool;

    /// Clear the reference bit, returning its previous value
    fn clear_reference(&self, pa: PhysAddr) -> bool;

    fn is_modified(&self, pa: PhysAddr) -> bool;

    fn is_referenced(&self, pa: PhysAddr) -> bool;

    /// Fill the page with zeroes
    fn zero_page(&self, pa: PhysAddr);

    /// Copy the contents of `src` to `dst`
    fn copy_page(&self, src: PhysAddr, dst: PhysAddr);
}
