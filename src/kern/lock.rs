//! Locking Primitives
//!
//! Based on Mach4 kern/lock.h/c by Avadis Tevanian, Jr. and Michael Wayne Young
//!
//! Provides the read/write lock used as the address-space map lock.
//!
//! Unlike `spin::RwLock`, acquisition and release are explicit calls
//! (`read`/`write`/`done`) rather than borrowed guards. The fault path
//! keeps a map locked across several function frames and releases it
//! from an owning guard (see `vm::vm_fault_info::MapLock`), which a
//! borrowed guard cannot express without tying the guard to a stack
//! frame.

use core::sync::atomic::{AtomicU32, Ordering};

// ============================================================================
// CPU relax
// ============================================================================

/// Give up the CPU for a moment while spinning on a contended resource.
///
/// With the `std` feature (and in unit tests) this yields to the host
/// scheduler; in a bare kernel it is a pause hint.
#[inline]
pub fn cpu_relax() {
    #[cfg(any(test, feature = "std"))]
    {
        extern crate std;
        std::thread::yield_now();
    }
    #[cfg(not(any(test, feature = "std")))]
    core::hint::spin_loop();
}

// ============================================================================
// Read/Write Lock
// ============================================================================

/// Lock state constants
const LOCK_FREE: u32 = 0;
const LOCK_WRITE: u32 = 0x8000_0000;
const LOCK_READ_MASK: u32 = 0x7FFF_FFFF;

/// A read/write lock
///
/// Allows multiple concurrent readers or a single writer.
/// Writers have priority to prevent starvation: once a writer is waiting,
/// new readers back off.
#[derive(Debug)]
pub struct RwLock {
    /// Lock state: high bit = write lock, low 31 bits = reader count
    state: AtomicU32,

    /// Number of writers spinning for the lock
    want_write: AtomicU32,
}

impl RwLock {
    /// Create a new unlocked read/write lock
    pub const fn new() -> Self {
        Self {
            state: AtomicU32::new(LOCK_FREE),
            want_write: AtomicU32::new(0),
        }
    }

    /// Acquire the lock for writing (exclusive access)
    pub fn write(&self) {
        self.want_write.fetch_add(1, Ordering::AcqRel);
        while self
            .state
            .compare_exchange_weak(LOCK_FREE, LOCK_WRITE, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            cpu_relax();
        }
        self.want_write.fetch_sub(1, Ordering::AcqRel);
    }

    /// Acquire the lock for reading (shared access)
    pub fn read(&self) {
        loop {
            if self.try_read() {
                return;
            }
            cpu_relax();
        }
    }

    /// Try to acquire the lock for reading without blocking
    pub fn try_read(&self) -> bool {
        let state = self.state.load(Ordering::Relaxed);
        if state & LOCK_WRITE != 0 || self.want_write.load(Ordering::Acquire) != 0 {
            return false;
        }
        debug_assert!(state & LOCK_READ_MASK != LOCK_READ_MASK, "reader count overflow");
        self.state
            .compare_exchange(state, state + 1, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
    }

    /// Release the lock (works for both read and write)
    pub fn done(&self) {
        let state = self.state.load(Ordering::Relaxed);
        if state & LOCK_WRITE != 0 {
            self.state.store(LOCK_FREE, Ordering::Release);
        } else {
            assert!(state & LOCK_READ_MASK > 0, "RwLock::done on an unlocked lock");
            self.state.fetch_sub(1, Ordering::Release);
        }
    }

    /// Get the current reader count
    pub fn read_count(&self) -> u32 {
        self.state.load(Ordering::Relaxed) & LOCK_READ_MASK
    }

    /// Check if the lock is held for writing
    pub fn is_write_locked(&self) -> bool {
        self.state.load(Ordering::Relaxed) & LOCK_WRITE != 0
    }

    /// Check if the lock is held for reading
    pub fn is_read_locked(&self) -> bool {
        let state = self.state.load(Ordering::Relaxed);
        state != LOCK_FREE && (state & LOCK_WRITE) == 0
    }

    /// Check if the lock is held at all
    pub fn is_locked(&self) -> bool {
        self.state.load(Ordering::Relaxed) != LOCK_FREE
    }
}

impl Default for RwLock {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// Lock Guard Types
// ============================================================================

/// RAII guard for write lock
pub struct WriteLockGuard<'a> {
    lock: &'a RwLock,
}

impl<'a> WriteLockGuard<'a> {
    pub fn new(lock: &'a RwLock) -> Self {
        lock.write();
        Self { lock }
    }
}

impl Drop for WriteLockGuard<'_> {
    fn drop(&mut self) {
        self.lock.done();
    }
}

/// RAII guard for read lock
pub struct ReadLockGuard<'a> {
    lock: &'a RwLock,
}

impl<'a> ReadLockGuard<'a> {
    pub fn new(lock: &'a RwLock) -> Self {
        lock.read();
        Self { lock }
    }
}

impl Drop for ReadLockGuard<'_> {
    fn drop(&mut self) {
        self.lock.done();
    }
}
