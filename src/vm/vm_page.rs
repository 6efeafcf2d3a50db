//! VM Page Management - Frame Registry
//!
//! Based on Mach4 vm/vm_page.h/c
//!
//! Owns every physical page frame in the system. Frames live in an arena
//! indexed by [`PageId`]; nothing outside this module holds a reference
//! into the arena across a lock release, only ids.
//!
//! ## Frame lifecycle
//!
//! free → allocated (busy, owned by an anon or an object) → queued
//! (active / inactive) or wired → freed when the owner lets go.
//!
//! Freed pages land in the dirty pool. The page daemon zeroes free pages
//! when it has nothing to reclaim and moves them to the zeroed pool, so
//! that a later zero-fill allocation can skip the copy.
//!
//! ## Locks
//!
//! - free-list lock: the free pools (dirty and pre-zeroed)
//! - queue lock: active and inactive queues plus the object/offset hash
//! - per-page state lock: owner, flags, wire count, queue membership
//!
//! Order: queue lock before page state. The free-list lock is never held
//! together with either.
//!
//! ## Busy protocol
//!
//! `BUSY` is a cooperative exclusion marker for long operations (I/O,
//! copies). Busy pages are never on a reclaim queue: whoever clears
//! `BUSY` places the page (`unbusy` with a [`Placement`]). A thread that
//! needs a busy page sets `WANTED` and waits in [`PageManager::wait_busy`],
//! which consumes the caller's locks first.

use alloc::collections::VecDeque;
use alloc::sync::{Arc, Weak};
use alloc::vec::Vec;
use core::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use spin::Mutex;

use crate::kern::counters::MachCounter;
use crate::kern::lock::cpu_relax;
use crate::vm::config::VmConfig;
use crate::vm::error::{AllocError, ConfigError, LoanError};
use crate::vm::pmap::{PhysAddr, PhysMemory};
use crate::vm::vm_anon::Anon;
use crate::vm::vm_fault_info::Unlock;
use crate::vm::vm_map::VmProt;
use crate::vm::vm_object::ObjectId;
use crate::vm::vm_page_hash::PageHash;

// ============================================================================
// Constants
// ============================================================================

/// Page size (4KB on most platforms)
pub const PAGE_SIZE: usize = 4096;

/// Page shift (log2 of PAGE_SIZE)
pub const PAGE_SHIFT: usize = 12;

/// Round address down to page boundary
pub const fn trunc_page(addr: u64) -> u64 {
    addr & !(PAGE_SIZE as u64 - 1)
}

/// Round address up to page boundary
pub const fn round_page(addr: u64) -> u64 {
    (addr + PAGE_SIZE as u64 - 1) & !(PAGE_SIZE as u64 - 1)
}

/// Number of pages in `len` bytes (rounded down)
pub const fn atop(len: u64) -> usize {
    (len >> PAGE_SHIFT) as usize
}

// ============================================================================
// Page Identity
// ============================================================================

/// Index of a frame in the registry arena
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PageId(pub u32);

impl PageId {
    #[inline]
    pub const fn index(self) -> usize {
        self.0 as usize
    }
}

// ============================================================================
// Page Flags
// ============================================================================

/// Page state flags
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PageFlags(u32);

impl PageFlags {
    /// Page is busy (exclusively held, usually for I/O)
    pub const BUSY: Self = Self(0x0001);
    /// Someone is waiting for the page to become un-busy
    pub const WANTED: Self = Self(0x0002);
    /// Owner let go while the page was busy; the holder frees it
    pub const RELEASED: Self = Self(0x0004);
    /// Contents match backing store
    pub const CLEAN: Self = Self(0x0008);
    /// Contents not valid yet (freshly allocated, I/O pending)
    pub const FAKE: Self = Self(0x0020);

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

impl core::ops::BitOr for PageFlags {
    type Output = Self;
    fn bitor(self, rhs: Self) -> Self {
        self.union(rhs)
    }
}

/// Flags for `PageManager::alloc`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct AllocFlags(u32);

impl AllocFlags {
    /// Kernel allocation: may dip into the kernel reserve
    pub const USE_RESERVE: Self = Self(0x0001);
    /// Page daemon allocation: may dip into every reserve
    pub const PAGEDAEMON: Self = Self(0x0002);
    /// Zero the page
    pub const ZERO: Self = Self(0x0004);

    pub const fn empty() -> Self {
        Self(0)
    }

    pub const fn contains(&self, other: Self) -> bool {
        (self.0 & other.0) == other.0
    }
}

impl core::ops::BitOr for AllocFlags {
    type Output = Self;
    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

// ============================================================================
// Page Queue Type
// ============================================================================

/// Page queue type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PageQueueType {
    /// Not on any queue (allocated and busy, or wired)
    None = 0,
    /// Free page queue
    Free = 1,
    /// Active page queue
    Active = 2,
    /// Inactive page queue
    Inactive = 3,
}

/// Where `unbusy` puts a page
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Placement {
    Active,
    Inactive,
    /// Add a wiring
    Wired,
}

// ============================================================================
// Ownership
// ============================================================================

/// Who a frame belongs to.
///
/// A frame has exactly one owner. An object-owned frame may additionally
/// be on loan to one anon, which reads it without owning it.
#[derive(Debug, Clone)]
pub enum PageOwner {
    Free,
    Anon(Weak<Anon>),
    Object {
        object: ObjectId,
        offset: u64,
        loan: Option<Weak<Anon>>,
    },
}

impl PageOwner {
    pub const fn object(object: ObjectId, offset: u64) -> Self {
        PageOwner::Object { object, offset, loan: None }
    }

    pub fn anon(anon: &Arc<Anon>) -> Self {
        PageOwner::Anon(Arc::downgrade(anon))
    }

    pub fn is_free(&self) -> bool {
        matches!(self, PageOwner::Free)
    }

    /// `(object, offset)` for object-owned frames
    pub fn object_key(&self) -> Option<(ObjectId, u64)> {
        match self {
            PageOwner::Object { object, offset, .. } => Some((*object, *offset)),
            _ => None,
        }
    }

    /// True if `anon` owns the frame outright
    pub fn is_owned_by(&self, anon: &Anon) -> bool {
        matches!(self, PageOwner::Anon(w) if core::ptr::eq(w.as_ptr(), anon))
    }

    /// True if the frame is an object page on loan
    pub fn is_loaned(&self) -> bool {
        matches!(self, PageOwner::Object { loan: Some(_), .. })
    }

    /// True if the frame is an object page on loan to `anon`
    pub fn is_loaned_to(&self, anon: &Anon) -> bool {
        matches!(self, PageOwner::Object { loan: Some(w), .. } if core::ptr::eq(w.as_ptr(), anon))
    }
}

/// Mutable per-frame state
#[derive(Debug, Clone)]
pub struct PageState {
    pub owner: PageOwner,
    pub flags: PageFlags,
    pub wire_count: u32,
    pub queue: PageQueueType,
}

impl PageState {
    const fn free() -> Self {
        Self {
            owner: PageOwner::Free,
            flags: PageFlags::empty(),
            wire_count: 0,
            queue: PageQueueType::Free,
        }
    }
}

// ============================================================================
// VM Page Structure
// ============================================================================

/// A physical page frame
#[derive(Debug)]
pub struct VmPage {
    id: PageId,
    phys_addr: PhysAddr,
    state: Mutex<PageState>,
    /// Mirror of `PageFlags::BUSY` for lock-free polling by waiters
    busy: AtomicBool,
}

impl VmPage {
    fn new(id: PageId, phys_addr: PhysAddr) -> Self {
        Self {
            id,
            phys_addr,
            state: Mutex::new(PageState::free()),
            busy: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> PageId {
        self.id
    }

    pub fn phys_addr(&self) -> PhysAddr {
        self.phys_addr
    }

    /// Copy of the page state
    pub fn snapshot(&self) -> PageState {
        self.state.lock().clone()
    }

    pub fn owner(&self) -> PageOwner {
        self.state.lock().owner.clone()
    }

    pub fn flags(&self) -> PageFlags {
        self.state.lock().flags
    }

    pub fn queue(&self) -> PageQueueType {
        self.state.lock().queue
    }

    pub fn wire_count(&self) -> u32 {
        self.state.lock().wire_count
    }

    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::Acquire)
    }

    fn set_busy(&self, st: &mut PageState) {
        st.flags.insert(PageFlags::BUSY);
        self.busy.store(true, Ordering::Release);
    }

    fn clear_busy(&self, st: &mut PageState) {
        st.flags.remove(PageFlags::BUSY | PageFlags::WANTED);
        self.busy.store(false, Ordering::Release);
    }
}

// ============================================================================
// Page Queue
// ============================================================================

/// A queue of pages
#[derive(Debug)]
pub struct PageQueue {
    pages: VecDeque<PageId>,
    queue_type: PageQueueType,
}

impl PageQueue {
    pub fn new(queue_type: PageQueueType) -> Self {
        Self {
            pages: VecDeque::new(),
            queue_type,
        }
    }

    /// Add a page to the tail
    pub fn enqueue(&mut self, page: PageId) {
        self.pages.push_back(page);
    }

    /// Remove a page from the head
    pub fn dequeue(&mut self) -> Option<PageId> {
        self.pages.pop_front()
    }

    /// Remove a specific page
    pub fn remove(&mut self, page: PageId) -> bool {
        if let Some(pos) = self.pages.iter().position(|&p| p == page) {
            self.pages.remove(pos);
            true
        } else {
            false
        }
    }

    pub fn len(&self) -> usize {
        self.pages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pages.is_empty()
    }

    pub fn queue_type(&self) -> PageQueueType {
        self.queue_type
    }

    pub fn contains(&self, page: PageId) -> bool {
        self.pages.contains(&page)
    }
}

/// Which free pool a page sits in
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Pool {
    None,
    Dirty,
    Zeroed,
}

/// State under the free-list lock: free pages split by whether their
/// contents are known to be zero.
struct FreeList {
    dirty: PageQueue,
    zeroed: PageQueue,
    /// Indexed by `PageId`
    pool: Vec<Pool>,
}

impl FreeList {
    fn new(npages: usize) -> Self {
        Self {
            dirty: PageQueue::new(PageQueueType::Free),
            zeroed: PageQueue::new(PageQueueType::Free),
            pool: alloc::vec![Pool::None; npages],
        }
    }

    fn len(&self) -> usize {
        self.dirty.len() + self.zeroed.len()
    }

    fn contains(&self, id: PageId) -> bool {
        self.pool[id.index()] != Pool::None
    }

    fn push(&mut self, id: PageId, zeroed: bool) {
        debug_assert!(!self.contains(id), "{:?} freed twice", id);
        if zeroed {
            self.zeroed.enqueue(id);
            self.pool[id.index()] = Pool::Zeroed;
        } else {
            self.dirty.enqueue(id);
            self.pool[id.index()] = Pool::Dirty;
        }
    }

    /// Take any free page, from the zeroed pool first if `want_zero`.
    /// Returns the page and whether it is zero-filled.
    fn pop(&mut self, want_zero: bool) -> Option<(PageId, bool)> {
        let (first, second) = if want_zero {
            (&mut self.zeroed, &mut self.dirty)
        } else {
            (&mut self.dirty, &mut self.zeroed)
        };
        let (id, zeroed) = match first.dequeue() {
            Some(id) => (id, want_zero),
            None => (second.dequeue()?, !want_zero),
        };
        self.pool[id.index()] = Pool::None;
        Some((id, zeroed))
    }

    /// Take a specific free page; `Some(zeroed)` if it was free
    fn take(&mut self, id: PageId) -> Option<bool> {
        let zeroed = match self.pool[id.index()] {
            Pool::None => return None,
            Pool::Dirty => {
                self.dirty.remove(id);
                false
            }
            Pool::Zeroed => {
                self.zeroed.remove(id);
                true
            }
        };
        self.pool[id.index()] = Pool::None;
        Some(zeroed)
    }
}

/// Physical placement constraint for [`PageManager::alloc_contig`].
///
/// All addresses are byte addresses; `high` is exclusive and 0 means no
/// upper limit. The run starts on an `align` multiple and does not
/// cross a `boundary` multiple (0: no boundary).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PhysConstraint {
    pub low: PhysAddr,
    pub high: PhysAddr,
    pub align: u64,
    pub boundary: u64,
}

impl PhysConstraint {
    /// Anywhere in physical memory
    pub const ANY: Self = Self {
        low: 0,
        high: 0,
        align: PAGE_SIZE as u64,
        boundary: 0,
    };

    /// Within `[low, high)`
    pub const fn range(low: PhysAddr, high: PhysAddr) -> Self {
        Self { low, high, ..Self::ANY }
    }

    pub const fn aligned(mut self, align: u64) -> Self {
        self.align = align;
        self
    }

    pub const fn within_boundary(mut self, boundary: u64) -> Self {
        self.boundary = boundary;
        self
    }

    fn validate(&self, npages: usize) -> Result<(), AllocError> {
        let len = (npages as u64) << PAGE_SHIFT;
        let pow2 = |v: u64| v.is_power_of_two() && v >= PAGE_SIZE as u64;
        if npages == 0
            || !pow2(self.align)
            || (self.boundary != 0 && (!pow2(self.boundary) || self.boundary < len))
            || self.low != trunc_page(self.low)
            || self.high != trunc_page(self.high)
            || (self.high != 0 && self.high <= self.low)
        {
            return Err(AllocError::BadConstraint);
        }
        Ok(())
    }

    /// True if `[start, start + len)` satisfies the constraint
    fn admits(&self, start: PhysAddr, len: u64) -> bool {
        let last = start + len - 1;
        start >= self.low
            && (self.high == 0 || last < self.high)
            && start & (self.align - 1) == 0
            && (self.boundary == 0 || start / self.boundary == last / self.boundary)
    }

    fn contains(&self, pa: PhysAddr) -> bool {
        pa >= self.low && (self.high == 0 || pa < self.high)
    }
}

impl Default for PhysConstraint {
    fn default() -> Self {
        Self::ANY
    }
}

/// State under the queue lock
struct PageQueues {
    active: PageQueue,
    inactive: PageQueue,
    hash: PageHash,
}

/// A contiguous run of registered physical memory
#[derive(Debug, Clone, Copy)]
struct Segment {
    start: PhysAddr,
    npages: u32,
    first: u32,
}

/// Registry event counters
#[derive(Debug)]
pub struct PageCounters {
    pub allocs: MachCounter,
    pub frees: MachCounter,
    pub alloc_fail: MachCounter,
    pub reserve_refused: MachCounter,
    pub busy_waits: MachCounter,
    pub loans_ended: MachCounter,
    /// Zero-fill allocations served from the zeroed pool
    pub zero_hits: MachCounter,
    pub zero_misses: MachCounter,
    /// Free pages zeroed ahead of demand
    pub prezeroed: MachCounter,
}

impl PageCounters {
    const fn new() -> Self {
        Self {
            allocs: MachCounter::new("page_allocs"),
            frees: MachCounter::new("page_frees"),
            alloc_fail: MachCounter::new("page_alloc_fail"),
            reserve_refused: MachCounter::new("page_reserve_refused"),
            busy_waits: MachCounter::new("page_busy_waits"),
            loans_ended: MachCounter::new("page_loans_ended"),
            zero_hits: MachCounter::new("page_zero_hits"),
            zero_misses: MachCounter::new("page_zero_misses"),
            prezeroed: MachCounter::new("page_prezeroed"),
        }
    }
}

// ============================================================================
// Page Manager
// ============================================================================

/// The frame registry
pub struct PageManager {
    /// All pages in the system (indexed by PageId)
    pages: Vec<VmPage>,
    segments: Vec<Segment>,

    free: Mutex<FreeList>,
    queues: Mutex<PageQueues>,

    free_count: AtomicU32,
    active_count: AtomicU32,
    inactive_count: AtomicU32,
    wired_count: AtomicU32,

    phys: Arc<dyn PhysMemory>,

    reserve_pagedaemon: u32,
    reserve_kernel: u32,
    /// Low memory threshold (start reclaiming)
    pages_free_target: u32,
    /// Critical memory threshold
    pages_free_min: u32,
    inactive_target_ratio: u32,

    /// Page daemon wakeup request
    daemon_wanted: AtomicBool,

    pub counters: PageCounters,
}

impl PageManager {
    /// Register physical memory `[start, end)` ranges; every page starts free.
    pub fn new(
        config: &VmConfig,
        phys: Arc<dyn PhysMemory>,
        ranges: &[(PhysAddr, PhysAddr)],
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        if ranges.is_empty() {
            return Err(ConfigError::NoMemory);
        }

        let mut pages = Vec::new();
        let mut segments = Vec::new();
        for &(start, end) in ranges {
            if end <= start || start != trunc_page(start) || end != trunc_page(end) {
                return Err(ConfigError::BadRange { start, end });
            }
            let npages = ((end - start) >> PAGE_SHIFT) as u32;
            let first = pages.len() as u32;
            for i in 0..npages {
                pages.push(VmPage::new(PageId(first + i), start + (u64::from(i) << PAGE_SHIFT)));
            }
            segments.push(Segment { start, npages, first });
        }
        let mut free = FreeList::new(pages.len());
        for page in &pages {
            free.push(page.id, false);
        }

        let total = pages.len() as u32;
        let pages_free_target = total / config.free_target_ratio;
        let pages_free_min = total / config.free_min_ratio;
        log::info!(
            "vm_page: {} pages in {} segments, free target {}, free min {}",
            total,
            segments.len(),
            pages_free_target,
            pages_free_min
        );

        Ok(Self {
            pages,
            segments,
            free: Mutex::new(free),
            queues: Mutex::new(PageQueues {
                active: PageQueue::new(PageQueueType::Active),
                inactive: PageQueue::new(PageQueueType::Inactive),
                hash: PageHash::new(config.hash_min_buckets),
            }),
            free_count: AtomicU32::new(total),
            active_count: AtomicU32::new(0),
            inactive_count: AtomicU32::new(0),
            wired_count: AtomicU32::new(0),
            phys,
            reserve_pagedaemon: config.reserve_pagedaemon,
            reserve_kernel: config.reserve_kernel,
            pages_free_target,
            pages_free_min,
            inactive_target_ratio: config.inactive_target_ratio,
            daemon_wanted: AtomicBool::new(false),
            counters: PageCounters::new(),
        })
    }

    /// The frame with id `id`
    #[inline]
    pub fn page(&self, id: PageId) -> &VmPage {
        &self.pages[id.index()]
    }

    #[inline]
    pub fn phys_addr(&self, id: PageId) -> PhysAddr {
        self.page(id).phys_addr
    }

    /// Frame holding physical address `pa`
    pub fn phys_to_page(&self, pa: PhysAddr) -> Option<PageId> {
        let pa = trunc_page(pa);
        self.segments.iter().find_map(|seg| {
            let end = seg.start + (u64::from(seg.npages) << PAGE_SHIFT);
            (seg.start..end)
                .contains(&pa)
                .then(|| PageId(seg.first + ((pa - seg.start) >> PAGE_SHIFT) as u32))
        })
    }

    pub fn page_count(&self) -> usize {
        self.pages.len()
    }

    // ========================================================================
    // Allocation
    // ========================================================================

    /// Allocate a busy page for `owner`.
    ///
    /// Ordinary callers are refused once `reserve_kernel` or fewer pages
    /// remain; only the page daemon may take the last `reserve_pagedaemon`.
    pub fn alloc(&self, owner: PageOwner, flags: AllocFlags) -> Result<PageId, AllocError> {
        let taken = {
            let mut free = self.free.lock();
            self.check_reserve(free.len() as u32, 1, flags)
                .and_then(|()| free.pop(flags.contains(AllocFlags::ZERO)).ok_or(AllocError::Exhausted))
        };
        let (id, zeroed) = taken.map_err(|err| self.refuse(err))?;
        self.free_count.fetch_sub(1, Ordering::AcqRel);

        self.claim(id, owner, zeroed, flags);
        if self.free_count() < self.pages_free_target {
            self.wakeup_daemon();
        }
        Ok(id)
    }

    /// Allocate `npages` physically contiguous busy pages placed as
    /// `constraint` demands. Page `i` of the run goes to `owner(i)`.
    ///
    /// Reserves apply to the run as a whole. The first fitting run in
    /// address order is taken.
    pub fn alloc_contig<F>(
        &self,
        npages: usize,
        constraint: PhysConstraint,
        flags: AllocFlags,
        mut owner: F,
    ) -> Result<Vec<PageId>, AllocError>
    where
        F: FnMut(usize) -> PageOwner,
    {
        constraint.validate(npages)?;

        let taken = {
            let mut free = self.free.lock();
            self.check_reserve(free.len() as u32, npages as u32, flags)
                .and_then(|()| self.find_run(&free, npages, &constraint).ok_or(AllocError::Exhausted))
                .map(|first| {
                    (first.0..first.0 + npages as u32)
                        .map(PageId)
                        .filter_map(|id| free.take(id).map(|zeroed| (id, zeroed)))
                        .collect::<Vec<_>>()
                })
        };
        let run = taken.map_err(|err| self.refuse(err))?;
        debug_assert_eq!(run.len(), npages);
        self.free_count.fetch_sub(run.len() as u32, Ordering::AcqRel);

        let ids = run
            .into_iter()
            .enumerate()
            .map(|(i, (id, zeroed))| {
                self.claim(id, owner(i), zeroed, flags);
                id
            })
            .collect::<Vec<_>>();
        if self.free_count() < self.pages_free_target {
            self.wakeup_daemon();
        }
        log::debug!(
            "vm_page: contiguous run of {} at {:#x}",
            npages,
            ids.first().map_or(0, |&id| self.phys_addr(id))
        );
        Ok(ids)
    }

    /// First run of `npages` free frames admitted by `constraint`
    fn find_run(&self, free: &FreeList, npages: usize, constraint: &PhysConstraint) -> Option<PageId> {
        let len = (npages as u64) << PAGE_SHIFT;
        let align = constraint.align;
        self.segments.iter().find_map(|seg| {
            let seg_end = seg.start + (u64::from(seg.npages) << PAGE_SHIFT);
            let mut pa = (seg.start.max(constraint.low) + align - 1) & !(align - 1);
            while pa + len <= seg_end {
                if constraint.high != 0 && pa + len > constraint.high {
                    return None;
                }
                if constraint.admits(pa, len) {
                    let first = seg.first + ((pa - seg.start) >> PAGE_SHIFT) as u32;
                    if (first..first + npages as u32).all(|i| free.contains(PageId(i))) {
                        return Some(PageId(first));
                    }
                }
                pa += align;
            }
            None
        })
    }

    /// Refuse `npages` out of `nfree` if the caller may not dig that deep
    fn check_reserve(&self, nfree: u32, npages: u32, flags: AllocFlags) -> Result<(), AllocError> {
        let daemon = flags.contains(AllocFlags::PAGEDAEMON);
        let kernel = daemon || flags.contains(AllocFlags::USE_RESERVE);
        let Some(left) = nfree.checked_sub(npages) else {
            return Err(AllocError::Exhausted);
        };
        if (left < self.reserve_kernel && !kernel) || (left < self.reserve_pagedaemon && !daemon) {
            return Err(AllocError::Reserved);
        }
        Ok(())
    }

    fn refuse(&self, err: AllocError) -> AllocError {
        match err {
            AllocError::Exhausted => self.counters.alloc_fail.inc(),
            _ => self.counters.reserve_refused.inc(),
        }
        self.wakeup_daemon();
        err
    }

    /// Hand a frame just taken off the free list to `owner`, busy
    fn claim(&self, id: PageId, owner: PageOwner, zeroed: bool, flags: AllocFlags) {
        debug_assert!(!owner.is_free(), "allocating a page for no one");
        let page = self.page(id);
        let key = owner.object_key();
        {
            let mut queues = key.map(|_| self.queues.lock());
            let mut st = page.state.lock();
            debug_assert!(st.owner.is_free() && st.queue == PageQueueType::Free);
            st.owner = owner;
            st.flags = PageFlags::CLEAN | PageFlags::FAKE;
            st.wire_count = 0;
            st.queue = PageQueueType::None;
            page.set_busy(&mut st);
            if let (Some(queues), Some((object, offset))) = (queues.as_mut(), key) {
                queues.hash.insert(object, offset, id);
            }
        }

        if flags.contains(AllocFlags::ZERO) {
            if zeroed {
                self.counters.zero_hits.inc();
                page.state.lock().flags.remove(PageFlags::CLEAN);
            } else {
                self.counters.zero_misses.inc();
                self.zero(id);
            }
        }
        self.counters.allocs.inc();
        log::trace!("vm_page: alloc {:?} pa {:#x}", id, page.phys_addr);
    }

    /// Zero up to `max` free pages of the dirty pool and move them to the
    /// zeroed pool. Returns how many were zeroed.
    pub fn zero_free_pages(&self, max: u32) -> u32 {
        let mut done = 0;
        while done < max {
            let mut free = self.free.lock();
            let Some(id) = free.dirty.dequeue() else {
                break;
            };
            free.pool[id.index()] = Pool::None;
            self.phys.zero_page(self.page(id).phys_addr);
            free.push(id, true);
            done += 1;
        }
        self.counters.prezeroed.add(u64::from(done));
        done
    }

    /// Free pages known to be zero-filled
    pub fn zeroed_count(&self) -> u32 {
        self.free.lock().zeroed.len() as u32
    }

    /// Free pages whose frames satisfy `constraint`'s address range
    pub fn free_in_range(&self, constraint: &PhysConstraint) -> u32 {
        let free = self.free.lock();
        self.pages
            .iter()
            .filter(|page| constraint.contains(page.phys_addr) && free.contains(page.id))
            .count() as u32
    }

    /// Return a page to the free list.
    ///
    /// The caller holds the page busy or otherwise knows nobody else can
    /// reach it. All hardware mappings of the page are removed. An object
    /// page on loan is handed to its loaning anon instead of being freed.
    pub fn free(&self, id: PageId) {
        let page = self.page(id);
        self.phys.page_protect(page.phys_addr, VmProt::NONE);

        {
            let mut queues = self.queues.lock();
            let mut st = page.state.lock();
            debug_assert!(!st.owner.is_free(), "double free of {:?}", id);

            if let PageOwner::Object { object, offset, loan: Some(anon) } = &st.owner {
                let (object, offset, anon) = (*object, *offset, anon.clone());
                queues.hash.remove(object, offset, id);
                st.owner = PageOwner::Anon(anon);
                st.flags.remove(PageFlags::RELEASED);
                page.clear_busy(&mut st);
                log::trace!("vm_page: loaned {:?} handed to its anon", id);
                return;
            }

            if let Some((object, offset)) = st.owner.object_key() {
                queues.hash.remove(object, offset, id);
            }
            match st.queue {
                PageQueueType::Active => {
                    queues.active.remove(id);
                    self.active_count.fetch_sub(1, Ordering::AcqRel);
                }
                PageQueueType::Inactive => {
                    queues.inactive.remove(id);
                    self.inactive_count.fetch_sub(1, Ordering::AcqRel);
                }
                _ => {}
            }
            if st.wire_count > 0 {
                self.wired_count.fetch_sub(1, Ordering::AcqRel);
            }
            *st = PageState::free();
            page.busy.store(false, Ordering::Release);
        }

        self.free.lock().push(id, false);
        self.free_count.fetch_add(1, Ordering::AcqRel);
        self.counters.frees.inc();
    }

    /// Owner lets go of a page: free it now, or mark it released if busy
    /// so the holder frees it. Returns true if freed.
    pub fn release(&self, id: PageId) -> bool {
        {
            let mut st = self.page(id).state.lock();
            if st.flags.contains(PageFlags::BUSY) {
                st.flags.insert(PageFlags::RELEASED);
                return false;
            }
        }
        self.free(id);
        true
    }

    // ========================================================================
    // Contents
    // ========================================================================

    /// Zero a page; it no longer matches any backing store
    pub fn zero(&self, id: PageId) {
        let page = self.page(id);
        self.phys.zero_page(page.phys_addr);
        page.state.lock().flags.remove(PageFlags::CLEAN);
    }

    /// Copy `src` into `dst`; `dst` no longer matches any backing store
    pub fn copy(&self, src: PageId, dst: PageId) {
        let page = self.page(dst);
        self.phys.copy_page(self.page(src).phys_addr, page.phys_addr);
        page.state.lock().flags.remove(PageFlags::CLEAN | PageFlags::FAKE);
    }

    /// Mark a page's contents as matching backing store
    pub fn mark_clean(&self, id: PageId) {
        let page = self.page(id);
        self.phys.clear_modify(page.phys_addr);
        let mut st = page.state.lock();
        st.flags.insert(PageFlags::CLEAN);
        st.flags.remove(PageFlags::FAKE);
    }

    /// Mark a page's contents as newer than backing store
    pub fn mark_dirty(&self, id: PageId) {
        self.page(id).state.lock().flags.remove(PageFlags::CLEAN);
    }

    /// True if the page differs from backing store (clean flag or
    /// hardware modify bit)
    pub fn is_dirty(&self, id: PageId) -> bool {
        let page = self.page(id);
        !page.flags().contains(PageFlags::CLEAN) || self.phys.is_modified(page.phys_addr)
    }

    // ========================================================================
    // Busy Protocol
    // ========================================================================

    /// Try to take a page busy. Fails if it is free or already busy.
    /// A page taken busy leaves its reclaim queue.
    pub fn try_busy(&self, id: PageId) -> bool {
        let page = self.page(id);
        let mut queues = self.queues.lock();
        let mut st = page.state.lock();
        if st.owner.is_free() || st.flags.contains(PageFlags::BUSY) {
            return false;
        }
        self.dequeue_locked(&mut queues, id, &mut st);
        page.set_busy(&mut st);
        true
    }

    pub fn is_busy(&self, id: PageId) -> bool {
        self.page(id).is_busy()
    }

    pub fn is_released(&self, id: PageId) -> bool {
        self.page(id).flags().contains(PageFlags::RELEASED)
    }

    /// Clear `BUSY`, wake waiters and place the page
    pub fn unbusy(&self, id: PageId, placement: Placement) {
        let page = self.page(id);
        let mut queues = self.queues.lock();
        let mut st = page.state.lock();
        debug_assert!(st.flags.contains(PageFlags::BUSY), "unbusy of idle {:?}", id);
        st.flags.remove(PageFlags::FAKE);
        page.clear_busy(&mut st);
        self.place(&mut queues, id, &mut st, placement);
    }

    /// Wait for a busy page, releasing `locks` first.
    ///
    /// Returns once the page is no longer busy. The caller must relock
    /// and revalidate everything it knew about the page.
    pub fn wait_busy<L: Unlock>(&self, id: PageId, locks: L) {
        let page = self.page(id);
        {
            let mut st = page.state.lock();
            if !st.flags.contains(PageFlags::BUSY) {
                drop(st);
                locks.unlock();
                return;
            }
            st.flags.insert(PageFlags::WANTED);
        }
        locks.unlock();
        self.counters.busy_waits.inc();
        while page.is_busy() {
            cpu_relax();
        }
    }

    // ========================================================================
    // Queue Placement
    // ========================================================================

    fn place(&self, queues: &mut PageQueues, id: PageId, st: &mut PageState, placement: Placement) {
        match placement {
            Placement::Active => self.activate_locked(queues, id, st),
            Placement::Inactive => {
                self.deactivate_locked(queues, id, st);
            }
            Placement::Wired => self.wire_locked(queues, id, st),
        }
    }

    fn dequeue_locked(&self, queues: &mut PageQueues, id: PageId, st: &mut PageState) {
        match st.queue {
            PageQueueType::Active => {
                queues.active.remove(id);
                self.active_count.fetch_sub(1, Ordering::AcqRel);
            }
            PageQueueType::Inactive => {
                queues.inactive.remove(id);
                self.inactive_count.fetch_sub(1, Ordering::AcqRel);
            }
            _ => {}
        }
        st.queue = PageQueueType::None;
    }

    fn activate_locked(&self, queues: &mut PageQueues, id: PageId, st: &mut PageState) {
        if st.owner.is_free()
            || st.wire_count > 0
            || st.flags.contains(PageFlags::BUSY)
            || st.queue == PageQueueType::Active
        {
            return;
        }
        self.dequeue_locked(queues, id, st);
        queues.active.enqueue(id);
        self.active_count.fetch_add(1, Ordering::AcqRel);
        st.queue = PageQueueType::Active;
    }

    fn deactivate_locked(&self, queues: &mut PageQueues, id: PageId, st: &mut PageState) -> bool {
        if st.owner.is_free()
            || st.wire_count > 0
            || st.flags.contains(PageFlags::BUSY)
            || st.queue == PageQueueType::Inactive
        {
            return false;
        }
        self.dequeue_locked(queues, id, st);
        let pa = self.page(id).phys_addr;
        self.phys.clear_reference(pa);
        if self.phys.is_modified(pa) {
            st.flags.remove(PageFlags::CLEAN);
        }
        queues.inactive.enqueue(id);
        self.inactive_count.fetch_add(1, Ordering::AcqRel);
        st.queue = PageQueueType::Inactive;
        true
    }

    fn wire_locked(&self, queues: &mut PageQueues, id: PageId, st: &mut PageState) {
        if st.wire_count == 0 {
            self.dequeue_locked(queues, id, st);
            self.wired_count.fetch_add(1, Ordering::AcqRel);
        }
        st.wire_count += 1;
    }

    /// Move a page to the tail of the active queue (busy pages are skipped)
    pub fn activate(&self, id: PageId) {
        let mut queues = self.queues.lock();
        let mut st = self.page(id).state.lock();
        self.activate_locked(&mut queues, id, &mut st);
    }

    /// Move a page to the inactive queue, snapshotting its hardware bits.
    /// Returns false if the page is busy, wired or already inactive.
    pub fn deactivate(&self, id: PageId) -> bool {
        let mut queues = self.queues.lock();
        let mut st = self.page(id).state.lock();
        self.deactivate_locked(&mut queues, id, &mut st)
    }

    /// Unmap and deactivate an idle page (read-ahead flush hint)
    pub fn deactivate_unmapped(&self, id: PageId) -> bool {
        let page = self.page(id);
        {
            let st = page.state.lock();
            if st.owner.is_free()
                || st.owner.is_loaned()
                || st.wire_count > 0
                || st.flags.contains(PageFlags::BUSY)
                || st.queue == PageQueueType::Inactive
            {
                return false;
            }
        }
        self.phys.page_protect(page.phys_addr, VmProt::NONE);
        self.deactivate(id)
    }

    /// Add a wiring; the page leaves the reclaim queues
    pub fn wire(&self, id: PageId) {
        let mut queues = self.queues.lock();
        let mut st = self.page(id).state.lock();
        self.wire_locked(&mut queues, id, &mut st);
    }

    /// Drop a wiring; the last one puts the page back on the active queue
    pub fn unwire(&self, id: PageId) {
        let mut queues = self.queues.lock();
        let mut st = self.page(id).state.lock();
        debug_assert!(st.wire_count > 0, "unwire of unwired {:?}", id);
        st.wire_count = st.wire_count.saturating_sub(1);
        if st.wire_count == 0 {
            self.wired_count.fetch_sub(1, Ordering::AcqRel);
            self.activate_locked(&mut queues, id, &mut st);
        }
    }

    // ========================================================================
    // Object/offset index
    // ========================================================================

    /// Resident page of `object` at `offset`
    pub fn lookup(&self, object: ObjectId, offset: u64) -> Option<PageId> {
        self.queues.lock().hash.lookup(object, offset)
    }

    /// Resident page of `object` at `offset`, taken busy; `None` if absent
    /// or busy elsewhere.
    pub fn lookup_busy(&self, object: ObjectId, offset: u64) -> Option<PageId> {
        let mut queues = self.queues.lock();
        let id = queues.hash.lookup(object, offset)?;
        let page = self.page(id);
        let mut st = page.state.lock();
        if st.flags.contains(PageFlags::BUSY) {
            return None;
        }
        self.dequeue_locked(&mut queues, id, &mut st);
        page.set_busy(&mut st);
        Some(id)
    }

    // ========================================================================
    // Loans
    // ========================================================================

    /// Lend object page `id` to `anon`
    pub fn loan(&self, id: PageId, anon: &Arc<Anon>) -> Result<(), LoanError> {
        let mut st = self.page(id).state.lock();
        if st.flags.contains(PageFlags::BUSY) {
            return Err(LoanError::Busy);
        }
        match &mut st.owner {
            PageOwner::Object { loan: Some(_), .. } => Err(LoanError::AlreadyLoaned),
            PageOwner::Object { loan, .. } => {
                *loan = Some(Arc::downgrade(anon));
                Ok(())
            }
            _ => Err(LoanError::NotObjectPage),
        }
    }

    /// The anon an object page is on loan to, if it is still alive
    pub fn loaner(&self, id: PageId) -> Option<Arc<Anon>> {
        match &self.page(id).state.lock().owner {
            PageOwner::Object { loan: Some(w), .. } => w.upgrade(),
            _ => None,
        }
    }

    /// End a loan. Returns true if the page was on loan.
    pub fn end_loan(&self, id: PageId) -> bool {
        let mut st = self.page(id).state.lock();
        if let PageOwner::Object { loan, .. } = &mut st.owner {
            if loan.take().is_some() {
                self.counters.loans_ended.inc();
                return true;
            }
        }
        false
    }

    // ========================================================================
    // Page daemon support
    // ========================================================================

    /// Take the head of the inactive queue busy. Busy pages met on the
    /// way are dropped from the queue; their holder places them.
    pub fn dequeue_inactive_busy(&self) -> Option<PageId> {
        let mut queues = self.queues.lock();
        Self::dequeue_busy(&mut queues.inactive, &self.inactive_count, &self.pages)
    }

    /// Take the head of the active queue busy.
    pub fn dequeue_active_busy(&self) -> Option<PageId> {
        let mut queues = self.queues.lock();
        Self::dequeue_busy(&mut queues.active, &self.active_count, &self.pages)
    }

    fn dequeue_busy(queue: &mut PageQueue, count: &AtomicU32, pages: &[VmPage]) -> Option<PageId> {
        while let Some(id) = queue.dequeue() {
            count.fetch_sub(1, Ordering::AcqRel);
            let page = &pages[id.index()];
            let mut st = page.state.lock();
            st.queue = PageQueueType::None;
            if !st.flags.contains(PageFlags::BUSY) {
                page.set_busy(&mut st);
                return Some(id);
            }
        }
        None
    }

    /// Ask the page daemon to run
    pub fn wakeup_daemon(&self) {
        self.daemon_wanted.store(true, Ordering::Release);
    }

    /// Consume a pending page daemon wakeup
    pub fn take_daemon_wakeup(&self) -> bool {
        self.daemon_wanted.swap(false, Ordering::AcqRel)
    }

    /// Pages the daemon should reclaim to reach the free target
    pub fn free_shortage(&self) -> u32 {
        self.pages_free_target.saturating_sub(self.free_count())
    }

    /// Pages the daemon should move from active to inactive
    pub fn inactive_shortage(&self) -> u32 {
        let active = self.active_count();
        let inactive = self.inactive_count();
        ((active + inactive) / self.inactive_target_ratio).saturating_sub(inactive)
    }

    /// True if an ordinary caller could allocate right now
    pub fn can_alloc(&self) -> bool {
        self.free_count() > self.reserve_kernel
    }

    pub(crate) fn phys(&self) -> &Arc<dyn PhysMemory> {
        &self.phys
    }

    // ========================================================================
    // Statistics
    // ========================================================================

    pub fn free_count(&self) -> u32 {
        self.free_count.load(Ordering::Acquire)
    }

    pub fn active_count(&self) -> u32 {
        self.active_count.load(Ordering::Acquire)
    }

    pub fn inactive_count(&self) -> u32 {
        self.inactive_count.load(Ordering::Acquire)
    }

    pub fn wired_count(&self) -> u32 {
        self.wired_count.load(Ordering::Acquire)
    }

    /// Check if memory is low
    pub fn is_memory_low(&self) -> bool {
        self.free_count() < self.pages_free_target
    }

    /// Check if memory is critically low
    pub fn is_memory_critical(&self) -> bool {
        self.free_count() < self.pages_free_min
    }

    /// Get statistics
    pub fn stats(&self) -> PageStats {
        let queues = self.queues.lock();
        PageStats {
            total: self.pages.len() as u32,
            free: self.free_count(),
            active: self.active_count(),
            inactive: self.inactive_count(),
            wired: self.wired_count(),
            hashed: queues.hash.len() as u32,
            hash_buckets: queues.hash.bucket_count() as u32,
            free_target: self.pages_free_target,
            free_min: self.pages_free_min,
        }
    }

    /// Check queue and ownership invariants (tests and debugging)
    pub fn check_invariants(&self) -> Result<(), &'static str> {
        let queues = self.queues.lock();
        let free = self.free.lock();
        for page in &self.pages {
            let st = page.state.lock();
            let id = page.id;
            if st.flags.contains(PageFlags::BUSY) != page.busy.load(Ordering::Acquire) {
                return Err("busy mirror out of sync");
            }
            match st.queue {
                PageQueueType::Free => {
                    if !st.owner.is_free() || !free.contains(id) {
                        return Err("free-queue page not free");
                    }
                }
                PageQueueType::Active | PageQueueType::Inactive => {
                    if st.wire_count > 0 {
                        return Err("wired page on a reclaim queue");
                    }
                    if st.flags.contains(PageFlags::BUSY) {
                        return Err("busy page on a reclaim queue");
                    }
                    let q = if st.queue == PageQueueType::Active { &queues.active } else { &queues.inactive };
                    if !q.contains(id) {
                        return Err("queue membership out of sync");
                    }
                }
                PageQueueType::None => {
                    if st.owner.is_free() {
                        return Err("free page off the free queue");
                    }
                }
            }
            match &st.owner {
                PageOwner::Object { object, offset, .. } => {
                    if queues.hash.lookup(*object, *offset) != Some(id) {
                        return Err("object page missing from hash");
                    }
                }
                PageOwner::Free if st.wire_count > 0 => return Err("free page wired"),
                _ => {}
            }
        }
        if free.len() as u32 != self.free_count() {
            return Err("free count out of sync");
        }
        Ok(())
    }
}

/// Page statistics
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageStats {
    pub total: u32,
    pub free: u32,
    pub active: u32,
    pub inactive: u32,
    pub wired: u32,
    /// Object pages in the hash
    pub hashed: u32,
    pub hash_buckets: u32,
    pub free_target: u32,
    pub free_min: u32,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vm::soft_pmap::SoftMmu;
    use proptest::prelude::*;

    fn registry(npages: u64, config: VmConfig) -> (PageManager, Arc<SoftMmu>) {
        let mmu = SoftMmu::new();
        let pm = PageManager::new(&config, mmu.clone(), &[(0x10_0000, 0x10_0000 + npages * PAGE_SIZE as u64)])
            .unwrap();
        (pm, mmu)
    }

    fn no_reserves() -> VmConfig {
        VmConfig::default().with_reserves(0, 0)
    }

    fn obj_page(pm: &PageManager, obj: ObjectId, off: u64) -> PageId {
        pm.alloc(PageOwner::object(obj, off), AllocFlags::empty()).unwrap()
    }

    #[test]
    fn test_page_utils() {
        assert_eq!(trunc_page(0x5678), 0x5000);
        assert_eq!(round_page(0x5001), 0x6000);
        assert_eq!(atop(0x3000), 3);
    }

    #[test]
    fn test_page_queue() {
        let mut queue = PageQueue::new(PageQueueType::Active);
        assert!(queue.is_empty());
        queue.enqueue(PageId(1));
        queue.enqueue(PageId(2));
        queue.enqueue(PageId(3));
        assert_eq!(queue.len(), 3);
        assert_eq!(queue.dequeue(), Some(PageId(1)));
        assert!(queue.remove(PageId(3)));
        assert!(!queue.remove(PageId(3)));
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn test_bad_ranges_rejected() {
        let mmu = SoftMmu::new();
        let config = VmConfig::default();
        assert!(matches!(
            PageManager::new(&config, mmu.clone(), &[]),
            Err(ConfigError::NoMemory)
        ));
        assert!(matches!(
            PageManager::new(&config, mmu, &[(0x1001, 0x4000)]),
            Err(ConfigError::BadRange { .. })
        ));
    }

    #[test]
    fn test_alloc_free_cycle() {
        let (pm, _mmu) = registry(8, no_reserves());
        let obj = ObjectId::allocate();
        let pg = obj_page(&pm, obj, 0);
        assert!(pm.is_busy(pg));
        assert_eq!(pm.free_count(), 7);
        assert_eq!(pm.lookup(obj, 0), Some(pg));
        assert_eq!(pm.page(pg).queue(), PageQueueType::None);

        pm.unbusy(pg, Placement::Active);
        assert_eq!(pm.page(pg).queue(), PageQueueType::Active);
        assert_eq!(pm.active_count(), 1);
        pm.check_invariants().unwrap();

        pm.free(pg);
        assert_eq!(pm.free_count(), 8);
        assert_eq!(pm.active_count(), 0);
        assert_eq!(pm.lookup(obj, 0), None);
        assert!(pm.page(pg).owner().is_free());
        pm.check_invariants().unwrap();
    }

    #[test]
    fn test_phys_to_page_multiple_segments() {
        let mmu = SoftMmu::new();
        let pm = PageManager::new(
            &no_reserves(),
            mmu,
            &[(0x1000, 0x3000), (0x100_000, 0x102_000)],
        )
        .unwrap();
        assert_eq!(pm.page_count(), 4);
        assert_eq!(pm.phys_to_page(0x2004), Some(PageId(1)));
        assert_eq!(pm.phys_to_page(0x101_000), Some(PageId(3)));
        assert_eq!(pm.phys_to_page(0x3000), None);
        assert_eq!(pm.phys_addr(PageId(2)), 0x100_000);
    }

    #[test]
    fn test_reserves() {
        let (pm, _mmu) = registry(6, VmConfig::default().with_reserves(2, 4));
        let obj = ObjectId::allocate();
        // 6 free: two ordinary allocations leave the kernel reserve.
        obj_page(&pm, obj, 0);
        obj_page(&pm, obj, 4096);
        assert_eq!(
            pm.alloc(PageOwner::object(obj, 8192), AllocFlags::empty()),
            Err(AllocError::Reserved)
        );
        // Kernel callers dig into the kernel reserve but not the daemon's.
        pm.alloc(PageOwner::object(obj, 8192), AllocFlags::USE_RESERVE).unwrap();
        pm.alloc(PageOwner::object(obj, 12288), AllocFlags::USE_RESERVE).unwrap();
        assert_eq!(
            pm.alloc(PageOwner::object(obj, 16384), AllocFlags::USE_RESERVE),
            Err(AllocError::Reserved)
        );
        pm.alloc(PageOwner::object(obj, 16384), AllocFlags::PAGEDAEMON).unwrap();
        pm.alloc(PageOwner::object(obj, 20480), AllocFlags::PAGEDAEMON).unwrap();
        assert_eq!(
            pm.alloc(PageOwner::object(obj, 24576), AllocFlags::PAGEDAEMON),
            Err(AllocError::Exhausted)
        );
        assert!(pm.take_daemon_wakeup());
        assert_eq!(pm.counters.reserve_refused.get(), 2);
    }

    #[test]
    fn test_zero_alloc_is_dirty() {
        let (pm, mmu) = registry(4, no_reserves());
        let obj = ObjectId::allocate();
        let pg = obj_page(&pm, obj, 0);
        mmu.write_phys(pm.phys_addr(pg), b"junk");
        pm.free(pg);

        let pg = pm.alloc(PageOwner::object(obj, 0), AllocFlags::ZERO).unwrap();
        assert!(mmu.read_phys(pm.phys_addr(pg)).iter().all(|&b| b == 0));
        assert!(!pm.page(pg).flags().contains(PageFlags::CLEAN));
    }

    #[test]
    fn test_zeroed_pool() {
        let (pm, mmu) = registry(4, no_reserves());
        mmu.write_phys(0x10_0000, b"old");
        assert_eq!(pm.zero_free_pages(2), 2);
        assert_eq!(pm.zeroed_count(), 2);
        assert!(mmu.read_phys(0x10_0000).iter().all(|&b| b == 0));

        // Plain allocations leave the zeroed pages for zero-fill requests.
        let obj = ObjectId::allocate();
        let plain = obj_page(&pm, obj, 0);
        assert_eq!(plain, PageId(2));
        let zeroed = pm.alloc(PageOwner::object(obj, 4096), AllocFlags::ZERO).unwrap();
        assert_eq!(zeroed, PageId(0));
        assert_eq!(pm.counters.zero_hits.get(), 1);
        assert_eq!(pm.counters.zero_misses.get(), 0);
        assert!(!pm.page(zeroed).flags().contains(PageFlags::CLEAN));
        assert_eq!(pm.zeroed_count(), 1);

        // A freed page is dirty again.
        pm.free(zeroed);
        assert_eq!(pm.zeroed_count(), 1);
        assert_eq!(pm.zero_free_pages(8), 2);
        assert_eq!(pm.zeroed_count(), 3);
        pm.unbusy(plain, Placement::Active);
        pm.check_invariants().unwrap();
    }

    #[test]
    fn test_alloc_contig_alignment_and_range() {
        let (pm, _mmu) = registry(32, no_reserves());
        let obj = ObjectId::allocate();
        let blocker = obj_page(&pm, obj, 0x10_0000);
        assert_eq!(blocker, PageId(0));

        let window = PhysConstraint::range(0x10_0000, 0x11_0000).aligned(0x4000);
        assert_eq!(pm.free_in_range(&window), 15);
        let run = pm
            .alloc_contig(4, window, AllocFlags::empty(), |i| PageOwner::object(obj, i as u64 * 4096))
            .unwrap();
        assert_eq!(run, [PageId(4), PageId(5), PageId(6), PageId(7)]);
        for (i, &pg) in run.iter().enumerate() {
            assert!(pm.is_busy(pg));
            assert_eq!(pm.lookup(obj, i as u64 * 4096), Some(pg));
        }
        assert_eq!(pm.free_count(), 27);
        assert_eq!(pm.free_in_range(&window), 11);

        // Frames 3 and 4 would straddle the 16K line.
        let bounded = PhysConstraint::range(0x10_3000, 0).within_boundary(0x4000);
        let pair = pm
            .alloc_contig(2, bounded, AllocFlags::empty(), |i| PageOwner::object(obj, 0x10_000 + i as u64 * 4096))
            .unwrap();
        assert_eq!(pair, [PageId(8), PageId(9)]);

        for pg in run.into_iter().chain(pair).chain([blocker]) {
            pm.unbusy(pg, Placement::Active);
        }
        pm.check_invariants().unwrap();
    }

    #[test]
    fn test_alloc_contig_exhausts_range() {
        let (pm, _mmu) = registry(16, no_reserves());
        let obj = ObjectId::allocate();
        let low = PhysConstraint::range(0x10_0000, 0x10_3000);
        let run = pm
            .alloc_contig(2, low, AllocFlags::ZERO, |i| PageOwner::object(obj, i as u64 * 4096))
            .unwrap();
        assert_eq!(run, [PageId(0), PageId(1)]);
        assert_eq!(pm.counters.zero_misses.get(), 2);
        pm.take_daemon_wakeup();

        assert_eq!(
            pm.alloc_contig(2, low, AllocFlags::empty(), |i| PageOwner::object(obj, 0x8000 + i as u64 * 4096)),
            Err(AllocError::Exhausted)
        );
        assert_eq!(pm.counters.alloc_fail.get(), 1);
        assert!(pm.take_daemon_wakeup());
        assert_eq!(pm.free_count(), 14);
        assert_eq!(pm.free_in_range(&low), 1);
    }

    #[test]
    fn test_alloc_contig_reserves() {
        let (pm, _mmu) = registry(8, VmConfig::default().with_reserves(2, 4));
        let obj = ObjectId::allocate();
        let owner = |i: usize| PageOwner::object(obj, i as u64 * 4096);
        assert_eq!(
            pm.alloc_contig(5, PhysConstraint::ANY, AllocFlags::empty(), owner),
            Err(AllocError::Reserved)
        );
        let run = pm
            .alloc_contig(5, PhysConstraint::ANY, AllocFlags::USE_RESERVE, owner)
            .unwrap();
        assert_eq!(run.len(), 5);
        assert_eq!(pm.free_count(), 3);
        assert_eq!(pm.counters.reserve_refused.get(), 1);
    }

    #[test]
    fn test_alloc_contig_rejects_bad_constraints() {
        let (pm, _mmu) = registry(8, no_reserves());
        let obj = ObjectId::allocate();
        let owner = |i: usize| PageOwner::object(obj, i as u64 * 4096);
        for (npages, constraint) in [
            (0, PhysConstraint::ANY),
            (1, PhysConstraint::ANY.aligned(0x1800)),
            (1, PhysConstraint::ANY.aligned(0x800)),
            (4, PhysConstraint::ANY.within_boundary(0x2000)),
            (1, PhysConstraint::range(0x10_4000, 0x10_2000)),
            (1, PhysConstraint::range(0x10_0800, 0)),
        ] {
            assert_eq!(
                pm.alloc_contig(npages, constraint, AllocFlags::empty(), owner),
                Err(AllocError::BadConstraint)
            );
        }
        assert_eq!(pm.free_count(), 8);
        assert!(!pm.take_daemon_wakeup());
    }

    #[test]
    fn test_wire_removes_from_queues() {
        let (pm, _mmu) = registry(4, no_reserves());
        let pg = obj_page(&pm, ObjectId::allocate(), 0);
        pm.unbusy(pg, Placement::Active);

        pm.wire(pg);
        pm.wire(pg);
        assert_eq!(pm.page(pg).queue(), PageQueueType::None);
        assert_eq!(pm.wired_count(), 1);
        assert_eq!(pm.active_count(), 0);
        // Wired pages ignore queue moves.
        pm.activate(pg);
        assert!(!pm.deactivate(pg));
        assert_eq!(pm.page(pg).queue(), PageQueueType::None);

        pm.unwire(pg);
        assert_eq!(pm.wired_count(), 1);
        pm.unwire(pg);
        assert_eq!(pm.wired_count(), 0);
        assert_eq!(pm.page(pg).queue(), PageQueueType::Active);
        pm.check_invariants().unwrap();
    }

    #[test]
    fn test_deactivate_snapshots_bits() {
        let (pm, mmu) = registry(4, no_reserves());
        let pg = obj_page(&pm, ObjectId::allocate(), 0);
        pm.unbusy(pg, Placement::Active);
        pm.mark_clean(pg);

        let pmap = mmu.create_pmap();
        use crate::vm::pmap::{Pmap, PmapFlags};
        pmap.enter(0x4000, pm.phys_addr(pg), VmProt::READ | VmProt::WRITE, PmapFlags::empty())
            .unwrap();
        pmap.write(0x4000, b"x").unwrap();

        assert!(pm.deactivate(pg));
        assert_eq!(pm.page(pg).queue(), PageQueueType::Inactive);
        assert!(!mmu.is_referenced(pm.phys_addr(pg)));
        assert!(!pm.page(pg).flags().contains(PageFlags::CLEAN));
        assert!(pm.is_dirty(pg));
    }

    #[test]
    fn test_busy_pages_not_queued() {
        let (pm, _mmu) = registry(4, no_reserves());
        let pg = obj_page(&pm, ObjectId::allocate(), 0);
        pm.activate(pg);
        assert_eq!(pm.page(pg).queue(), PageQueueType::None);
        assert!(!pm.try_busy(pg));
        pm.unbusy(pg, Placement::Inactive);
        assert_eq!(pm.page(pg).queue(), PageQueueType::Inactive);
        pm.check_invariants().unwrap();
    }

    #[test]
    fn test_try_busy_takes_page_off_its_queue() {
        let (pm, _mmu) = registry(4, no_reserves());
        let pg = obj_page(&pm, ObjectId::allocate(), 0);
        pm.unbusy(pg, Placement::Active);
        assert_eq!(pm.active_count(), 1);

        assert!(pm.try_busy(pg));
        assert_eq!(pm.page(pg).queue(), PageQueueType::None);
        assert_eq!(pm.active_count(), 0);
        pm.check_invariants().unwrap();
        // The daemon never meets it.
        assert_eq!(pm.dequeue_active_busy(), None);

        pm.unbusy(pg, Placement::Inactive);
        assert_eq!(pm.page(pg).queue(), PageQueueType::Inactive);
        pm.check_invariants().unwrap();
    }

    #[test]
    fn test_release_busy_page_defers_free() {
        let (pm, _mmu) = registry(4, no_reserves());
        let pg = obj_page(&pm, ObjectId::allocate(), 0);
        assert!(!pm.release(pg));
        assert!(pm.is_released(pg));
        assert_eq!(pm.free_count(), 3);
        // The holder sees the release and frees.
        pm.free(pg);
        assert_eq!(pm.free_count(), 4);
        assert!(!pm.is_released(pg));
    }

    #[test]
    fn test_lookup_busy() {
        let (pm, _mmu) = registry(4, no_reserves());
        let obj = ObjectId::allocate();
        let pg = obj_page(&pm, obj, 0);
        assert_eq!(pm.lookup_busy(obj, 0), None);
        pm.unbusy(pg, Placement::Inactive);
        assert_eq!(pm.inactive_count(), 1);
        assert_eq!(pm.lookup_busy(obj, 0), Some(pg));
        assert!(pm.is_busy(pg));
        assert_eq!(pm.page(pg).queue(), PageQueueType::None);
        assert_eq!(pm.inactive_count(), 0);
        pm.check_invariants().unwrap();
    }

    #[test]
    fn test_loaned_page_goes_to_anon_on_free() {
        let (pm, _mmu) = registry(4, no_reserves());
        let obj = ObjectId::allocate();
        let pg = obj_page(&pm, obj, 0);
        pm.unbusy(pg, Placement::Active);

        let anon = Anon::new();
        pm.loan(pg, &anon).unwrap();
        assert_eq!(pm.loan(pg, &anon), Err(LoanError::AlreadyLoaned));
        assert!(pm.page(pg).owner().is_loaned_to(&anon));
        assert!(Arc::ptr_eq(&pm.loaner(pg).unwrap(), &anon));

        pm.free(pg);
        assert!(pm.page(pg).owner().is_owned_by(&anon));
        assert_eq!(pm.lookup(obj, 0), None);
        assert_eq!(pm.free_count(), 3);
        pm.check_invariants().unwrap();
    }

    #[test]
    fn test_end_loan() {
        let (pm, _mmu) = registry(4, no_reserves());
        let pg = obj_page(&pm, ObjectId::allocate(), 0);
        let anon = Anon::new();
        assert_eq!(pm.loan(pg, &anon), Err(LoanError::Busy));
        pm.unbusy(pg, Placement::Active);
        pm.loan(pg, &anon).unwrap();
        assert!(pm.end_loan(pg));
        assert!(!pm.end_loan(pg));
        assert!(!pm.page(pg).owner().is_loaned());
    }

    #[test]
    fn test_wait_busy_wakes() {
        extern crate std;
        let (pm, _mmu) = registry(4, no_reserves());
        let pm = Arc::new(pm);
        let pg = obj_page(&pm, ObjectId::allocate(), 0);

        let waiter = {
            let pm = Arc::clone(&pm);
            std::thread::spawn(move || {
                pm.wait_busy(pg, ());
                pm.is_busy(pg)
            })
        };
        while !pm.page(pg).flags().contains(PageFlags::WANTED) {
            cpu_relax();
        }
        pm.unbusy(pg, Placement::Active);
        assert!(!waiter.join().unwrap());
        assert_eq!(pm.counters.busy_waits.get(), 1);
    }

    #[test]
    fn test_daemon_dequeue_skips_busy() {
        let (pm, _mmu) = registry(4, no_reserves());
        let obj = ObjectId::allocate();
        let a = obj_page(&pm, obj, 0);
        let b = obj_page(&pm, obj, 4096);
        pm.unbusy(a, Placement::Inactive);
        pm.unbusy(b, Placement::Inactive);
        assert!(pm.try_busy(a));

        // `a` is busy elsewhere: dropped from the queue, `b` is returned.
        assert_eq!(pm.dequeue_inactive_busy(), Some(b));
        assert_eq!(pm.inactive_count(), 0);
        assert_eq!(pm.page(a).queue(), PageQueueType::None);
        pm.unbusy(a, Placement::Active);
        pm.unbusy(b, Placement::Inactive);
        pm.check_invariants().unwrap();
    }

    #[derive(Debug, Clone)]
    enum Op {
        Alloc(u8),
        Free(u8),
        Activate(u8),
        Deactivate(u8),
        Wire(u8),
        Unwire(u8),
        Busy(u8),
        Unbusy(u8),
    }

    fn op() -> impl Strategy<Value = Op> {
        prop_oneof![
            (0u8..16).prop_map(Op::Alloc),
            (0u8..16).prop_map(Op::Free),
            (0u8..16).prop_map(Op::Activate),
            (0u8..16).prop_map(Op::Deactivate),
            (0u8..16).prop_map(Op::Wire),
            (0u8..16).prop_map(Op::Unwire),
            (0u8..16).prop_map(Op::Busy),
            (0u8..16).prop_map(Op::Unbusy),
        ]
    }

    proptest! {
        #[test]
        fn prop_registry_invariants(ops in proptest::collection::vec(op(), 1..200)) {
            let (pm, _mmu) = registry(12, no_reserves());
            let obj = ObjectId::allocate();
            // Model: offset slot -> (page, busy, wires)
            let mut live: alloc::collections::BTreeMap<u8, (PageId, bool, u32)> = Default::default();

            for op in ops {
                match op {
                    Op::Alloc(k) => {
                        if live.contains_key(&k) {
                            continue;
                        }
                        if let Ok(pg) = pm.alloc(PageOwner::object(obj, u64::from(k) * 4096), AllocFlags::empty()) {
                            live.insert(k, (pg, true, 0));
                        }
                    }
                    Op::Free(k) => {
                        if let Some((pg, _, _)) = live.remove(&k) {
                            pm.free(pg);
                        }
                    }
                    Op::Activate(k) => {
                        if let Some(&(pg, _, _)) = live.get(&k) {
                            pm.activate(pg);
                        }
                    }
                    Op::Deactivate(k) => {
                        if let Some(&(pg, _, _)) = live.get(&k) {
                            pm.deactivate(pg);
                        }
                    }
                    Op::Wire(k) => {
                        if let Some(e) = live.get_mut(&k) {
                            pm.wire(e.0);
                            e.2 += 1;
                        }
                    }
                    Op::Unwire(k) => {
                        if let Some(e) = live.get_mut(&k) {
                            if e.2 > 0 {
                                pm.unwire(e.0);
                                e.2 -= 1;
                            }
                        }
                    }
                    Op::Busy(k) => {
                        if let Some(e) = live.get_mut(&k) {
                            let got = pm.try_busy(e.0);
                            prop_assert_eq!(got, !e.1);
                            e.1 = true;
                        }
                    }
                    Op::Unbusy(k) => {
                        if let Some(e) = live.get_mut(&k) {
                            if e.1 {
                                pm.unbusy(e.0, Placement::Active);
                                e.1 = false;
                            }
                        }
                    }
                }
                prop_assert_eq!(pm.check_invariants(), Ok(()));
            }

            let stats = pm.stats();
            prop_assert_eq!(stats.free as usize + live.len(), 12);
            prop_assert_eq!(stats.hashed as usize, live.len());
            let wired = live.values().filter(|e| e.2 > 0).count();
            prop_assert_eq!(stats.wired as usize, wired);
            for (k, (pg, _, _)) in &live {
                prop_assert_eq!(pm.lookup(obj, u64::from(*k) * 4096), Some(*pg));
            }
        }
    }
}
