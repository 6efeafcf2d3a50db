//! VM error types
//!
//! Errors that leave the VM subsystem. Conditions the fault path recovers
//! from by restarting never appear here; see `vm_fault::Restart`.

use thiserror::Error;

/// errno: bad address
pub const EFAULT: i32 = 14;
/// errno: permission denied
pub const EACCES: i32 = 13;
/// errno: out of memory
pub const ENOMEM: i32 = 12;

/// Outcome of a failed page fault, as seen by the trap handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum FaultError {
    /// No map entry covers the faulting address.
    #[error("no mapping at fault address")]
    NoMapping,
    /// The access exceeds the entry's protection, or backing store I/O failed.
    #[error("access denied by mapping protection")]
    PermissionDenied,
    /// Memory (or swap) is exhausted and nothing could be reclaimed.
    #[error("out of memory")]
    OutOfMemory,
}

impl FaultError {
    /// The errno reported to the faulting process.
    pub const fn errno(self) -> i32 {
        match self {
            FaultError::NoMapping => EFAULT,
            FaultError::PermissionDenied => EACCES,
            FaultError::OutOfMemory => ENOMEM,
        }
    }
}

/// Page allocation failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum AllocError {
    /// The free list is empty.
    #[error("no free pages")]
    Exhausted,
    /// Free pages exist but are held back for the kernel or the page daemon.
    #[error("free pages are reserved")]
    Reserved,
    /// The physical placement constraint is malformed.
    #[error("malformed physical placement constraint")]
    BadConstraint,
}

/// VM Map operation errors
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum MapError {
    /// Invalid address range
    #[error("invalid address range")]
    InvalidRange,
    /// Range overlaps an existing entry
    #[error("no space for mapping")]
    NoSpace,
    /// Entry not found
    #[error("no entry in range")]
    NotFound,
    /// Requested protection exceeds maximum protection
    #[error("protection exceeds maximum")]
    ProtectionFailure,
    /// Invalid argument
    #[error("invalid argument")]
    InvalidArgument,
    /// A backing object failed to flush part of the range
    #[error("backing object flush failed")]
    FlushFailed,
}

/// Hardware mapping failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum PmapError {
    /// Page table memory could not be allocated; retry after reclaim.
    #[error("pmap resource shortage")]
    ResourceShortage,
    /// Address is not mapped
    #[error("address not mapped")]
    NotMapped,
}

/// Configuration rejected at VM bring-up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("page daemon reserve ({pagedaemon}) exceeds kernel reserve ({kernel})")]
    ReserveOrder { pagedaemon: u32, kernel: u32 },
    #[error("read-ahead window {0} exceeds the fault range limit")]
    ReadAheadTooLarge(usize),
    #[error("no physical memory registered")]
    NoMemory,
    #[error("physical range {start:#x}..{end:#x} is empty or unaligned")]
    BadRange { start: u64, end: u64 },
    #[error("free target ratio must be nonzero")]
    ZeroRatio,
}

/// Loaning a page to an anon failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum LoanError {
    #[error("page is not owned by a backing object")]
    NotObjectPage,
    #[error("page is already on loan")]
    AlreadyLoaned,
    #[error("page is busy")]
    Busy,
}
