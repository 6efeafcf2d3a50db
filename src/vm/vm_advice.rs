//! Read-ahead window selection
//!
//! On every fault the dispatcher looks at a small window of pages around
//! the faulting address and maps whatever is already resident, so that
//! the next few touches do not trap. The window size comes from the
//! entry's advice hint and is clamped to the entry.

use crate::vm::vm_page::PAGE_SHIFT;

/// Upper bound on pages in one fault window
pub const MAX_RANGE: usize = 16;

/// Pages looked at behind and ahead of the faulting page
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadAhead {
    pub nback: usize,
    pub nforw: usize,
}

impl ReadAhead {
    pub const fn new(nback: usize, nforw: usize) -> Self {
        Self { nback, nforw }
    }

    /// Window length including the faulting page
    pub const fn len(&self) -> usize {
        self.nback + self.nforw + 1
    }
}

/// The range of pages examined by one fault
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FaultWindow {
    /// First virtual address in the window
    pub startva: u64,
    /// Pages in the window
    pub npages: usize,
    /// Index of the faulting page
    pub centeridx: usize,
    /// Pages before the faulting page
    pub nback: usize,
}

impl FaultWindow {
    /// A window holding only the faulting page
    pub const fn narrow(va: u64) -> Self {
        Self { startva: va, npages: 1, centeridx: 0, nback: 0 }
    }

    /// Clamp `ra` around `va` to the entry `[start, end)`.
    pub fn around(va: u64, start: u64, end: u64, ra: ReadAhead) -> Self {
        debug_assert!(start <= va && va < end);
        let behind = ((va - start) >> PAGE_SHIFT) as usize;
        let ahead = (((end - va) >> PAGE_SHIFT) as usize).saturating_sub(1);
        let nback = ra.nback.min(behind);
        let nforw = ra.nforw.min(ahead);
        Self {
            startva: va - ((nback as u64) << PAGE_SHIFT),
            npages: nback + nforw + 1,
            centeridx: nback,
            nback,
        }
    }

    /// Virtual address of window slot `idx`
    pub const fn va(&self, idx: usize) -> u64 {
        self.startva + ((idx as u64) << PAGE_SHIFT)
    }

    /// Drop the look-behind pages, leaving the faulting page first
    pub fn skip_behind(&mut self) {
        self.startva = self.va(self.nback);
        self.npages -= self.nback;
        self.centeridx = 0;
        self.nback = 0;
    }
}
