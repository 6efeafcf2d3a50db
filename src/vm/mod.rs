//! Virtual Memory Subsystem
//!
//! Two-layer demand paging in the UVM style:
//! - vm_map: address space maps (entries, sub-maps, fork)
//! - vm_amap / vm_anon: the anonymous copy-on-write layer
//! - vm_object: backing objects (pagers) seen through their contract
//! - vm_page: the physical frame registry and its reclaim queues
//! - vm_fault: the fault resolver tying the layers together
//! - vm_pageout: the page daemon
//! - pmap / soft_pmap: the hardware mapping capability
//!
//! [`VmSystem`] bundles the machine-wide state (frame registry, swap
//! device, configuration, statistics, page daemon). A kernel installs one
//! with [`init`]; tests build as many independent systems as they like.

pub mod config;
pub mod error;
pub mod pmap;
pub mod soft_pmap;
pub mod swap;
pub mod vm_advice;
pub mod vm_amap;
pub mod vm_anon;
pub mod vm_fault;
pub mod vm_fault_info;
pub mod vm_map;
pub mod vm_object;
pub mod vm_page;
pub mod vm_page_hash;
pub mod vm_pageout;

#[cfg(test)]
pub(crate) mod testutil;

use alloc::sync::Arc;
use alloc::vec::Vec;
use spin::Once;

pub use config::VmConfig;
pub use error::{AllocError, ConfigError, FaultError, MapError, PmapError};
pub use pmap::{PhysAddr, PhysMemory, Pmap, PmapFlags, VirtAddr};
pub use swap::{SwapPager, SwapSlot};
pub use vm_fault::{vm_fault, vm_fault_unwire, vm_fault_wire, FaultStats, FaultType};
pub use vm_map::{Advice, EntryFlags, MapBacking, VmInherit, VmMap, VmMapEntry, VmProt};
pub use vm_object::{BackingObject, ObjectId, PageSlot, PagerStatus};
pub use vm_page::{PageId, PageManager, PageStats, PhysConstraint, PAGE_SIZE};
pub use vm_pageout::PageoutDaemon;

use crate::kern::lock::cpu_relax;
use crate::vm::vm_fault_info::Unlock;
use crate::vm::vm_page::{AllocFlags, PageOwner};

/// Machine-wide VM state
pub struct VmSystem {
    /// Frame registry
    pub pages: PageManager,
    /// Swap device, if any
    pub swap: Option<Arc<dyn SwapPager>>,
    pub config: VmConfig,
    /// Fault path statistics
    pub stats: FaultStats,
    pub pageout: PageoutDaemon,
}

impl core::fmt::Debug for VmSystem {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("VmSystem")
            .field("pages", &self.pages.stats())
            .field("swap", &self.swap.is_some())
            .field("config", &self.config)
            .finish()
    }
}

impl VmSystem {
    /// Bring up the VM over physical memory `ranges`
    pub fn new(
        config: VmConfig,
        phys: Arc<dyn PhysMemory>,
        ranges: &[(PhysAddr, PhysAddr)],
        swap: Option<Arc<dyn SwapPager>>,
    ) -> Result<Arc<Self>, ConfigError> {
        let pages = PageManager::new(&config, phys, ranges)?;
        if let Some(swap) = &swap {
            log::info!("vm: swap device with {} slots", swap.capacity());
        }
        Ok(Arc::new(Self {
            pages,
            swap,
            config,
            stats: FaultStats::new(),
            pageout: PageoutDaemon::new(),
        }))
    }

    /// Release `locks` and wait until an ordinary allocation can succeed,
    /// running the page daemon meanwhile. Gives up with `OutOfMemory`
    /// after `memory_wait_passes` passes in a row reclaim nothing.
    pub fn wait_for_memory<L: Unlock>(&self, locks: L) -> Result<(), FaultError> {
        locks.unlock();
        let mut fruitless = 0;
        while !self.pages.can_alloc() {
            if self.pageout.run_iteration(self, true) == 0 {
                fruitless += 1;
                if fruitless >= self.config.memory_wait_passes {
                    log::warn!(
                        "vm: out of memory ({} free, {} active, {} inactive, {} wired)",
                        self.pages.free_count(),
                        self.pages.active_count(),
                        self.pages.inactive_count(),
                        self.pages.wired_count()
                    );
                    return Err(FaultError::OutOfMemory);
                }
            } else {
                fruitless = 0;
            }
            cpu_relax();
        }
        Ok(())
    }

    /// Resolve a fault at `vaddr` in `map`
    pub fn fault(&self, map: &Arc<VmMap>, vaddr: VirtAddr, fault_type: FaultType, access: VmProt) -> Result<(), FaultError> {
        vm_fault(self, map, vaddr, fault_type, access)
    }

    /// Allocate a physically contiguous run under `constraint`, running
    /// the page daemon until one fits. Gives up with the allocator's error
    /// after `memory_wait_passes` passes in a row free nothing inside the
    /// constraint's address range.
    pub fn alloc_contig_wait<F>(
        &self,
        npages: usize,
        constraint: PhysConstraint,
        flags: AllocFlags,
        mut owner: F,
    ) -> Result<Vec<PageId>, AllocError>
    where
        F: FnMut(usize) -> PageOwner,
    {
        let mut fruitless = 0;
        loop {
            let err = match self.pages.alloc_contig(npages, constraint, flags, &mut owner) {
                Err(err @ (AllocError::Exhausted | AllocError::Reserved)) => err,
                done => return done,
            };
            let before = self.pages.free_in_range(&constraint);
            self.pageout.run_iteration(self, true);
            if self.pages.free_in_range(&constraint) > before {
                fruitless = 0;
            } else {
                fruitless += 1;
                if fruitless >= self.config.memory_wait_passes {
                    log::warn!(
                        "vm: no run of {} pages in [{:#x}, {:#x}) ({} free there)",
                        npages,
                        constraint.low,
                        constraint.high,
                        self.pages.free_in_range(&constraint)
                    );
                    return Err(err);
                }
            }
            cpu_relax();
        }
    }
}

static VM_SYSTEM: Once<Arc<VmSystem>> = Once::new();

/// Install the kernel's VM system. Only the first call has an effect.
pub fn init(
    config: VmConfig,
    phys: Arc<dyn PhysMemory>,
    ranges: &[(PhysAddr, PhysAddr)],
    swap: Option<Arc<dyn SwapPager>>,
) -> Result<&'static Arc<VmSystem>, ConfigError> {
    if let Some(vm) = VM_SYSTEM.get() {
        return Ok(vm);
    }
    let vm = VmSystem::new(config, phys, ranges, swap)?;
    Ok(VM_SYSTEM.call_once(|| vm))
}

/// The kernel's VM system, once installed
pub fn vm_system() -> Option<&'static Arc<VmSystem>> {
    VM_SYSTEM.get()
}
