//! Kernel Performance Counters
//!
//! Based on Mach4 kern/counters.h/c by CMU (1987-1991)
//!
//! Event counters for the VM fault path and the page daemon. Each
//! subsystem embeds its own set of counters in a stats struct rather than
//! sharing kernel-wide statics, so independent VM instances (one per test,
//! for example) do not pollute each other's numbers.

use core::sync::atomic::{AtomicU64, Ordering};

// ============================================================================
// Counter Type
// ============================================================================

/// Mach counter type (atomically updated)
#[derive(Debug)]
pub struct MachCounter {
    value: AtomicU64,
    name: &'static str,
}

impl MachCounter {
    /// Create a new counter
    pub const fn new(name: &'static str) -> Self {
        Self {
            value: AtomicU64::new(0),
            name,
        }
    }

    /// Increment counter by 1
    #[inline]
    pub fn inc(&self) {
        self.value.fetch_add(1, Ordering::Relaxed);
    }

    /// Increment counter by n
    #[inline]
    pub fn add(&self, n: u64) {
        self.value.fetch_add(n, Ordering::Relaxed);
    }

    /// Get current value
    #[inline]
    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }

    /// Reset to zero
    #[inline]
    pub fn reset(&self) {
        self.value.store(0, Ordering::Relaxed);
    }

    /// Get counter name
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Update max if current value is higher
    pub fn update_max(&self, current: u64) {
        self.value.fetch_max(current, Ordering::Relaxed);
    }
}

/// Whether counters are enabled
pub const VM_COUNTERS_ENABLED: bool = true;

/// Increment counter (only if counters enabled)
#[macro_export]
macro_rules! counter {
    ($counter:expr) => {
        if $crate::kern::counters::VM_COUNTERS_ENABLED {
            $counter.inc();
        }
    };
}
