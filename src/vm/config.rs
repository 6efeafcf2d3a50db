//! VM tunables
//!
//! Reserve thresholds, page daemon targets and the read-ahead table.
//! `VmConfig::default()` gives the stock kernel values; tests shrink the
//! reserves so that a few dozen pages behave like a real machine.

use crate::vm::error::ConfigError;
use crate::vm::vm_advice::{ReadAhead, MAX_RANGE};
use crate::vm::vm_map::Advice;

/// VM configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VmConfig {
    /// Free pages only the page daemon may allocate
    pub reserve_pagedaemon: u32,
    /// Free pages refused to ordinary (non-kernel) callers
    pub reserve_kernel: u32,
    /// Free target is total / ratio (5%)
    pub free_target_ratio: u32,
    /// Free minimum is total / ratio (2%)
    pub free_min_ratio: u32,
    /// Inactive target is active / ratio
    pub inactive_target_ratio: u32,
    /// Maximum pages scanned by one page daemon pass
    pub pageout_burst: u32,
    /// Daemon passes that reclaim nothing before a memory wait gives up
    pub memory_wait_passes: u32,
    /// Free pages an idle daemon pass zeroes ahead of demand
    pub idle_zero_batch: u32,
    /// Smallest bucket count of the object/offset hash
    pub hash_min_buckets: usize,
    /// Read-ahead windows for normal, random and sequential advice
    pub readahead: [ReadAhead; 3],
}

impl VmConfig {
    /// Stock configuration
    pub const fn new() -> Self {
        Self {
            reserve_pagedaemon: 4,
            reserve_kernel: 8,
            free_target_ratio: 20,
            free_min_ratio: 50,
            inactive_target_ratio: 3,
            pageout_burst: 32,
            memory_wait_passes: 4,
            idle_zero_batch: 16,
            hash_min_buckets: 16,
            readahead: [
                ReadAhead::new(3, 4),
                ReadAhead::new(0, 0),
                ReadAhead::new(8, 7),
            ],
        }
    }

    /// Set the reserve thresholds
    pub const fn with_reserves(mut self, pagedaemon: u32, kernel: u32) -> Self {
        self.reserve_pagedaemon = pagedaemon;
        self.reserve_kernel = kernel;
        self
    }

    /// Set the read-ahead window for one advice value
    pub const fn with_readahead(mut self, advice: Advice, window: ReadAhead) -> Self {
        self.readahead[advice as usize] = window;
        self
    }

    /// Set the page daemon scan burst
    pub const fn with_pageout_burst(mut self, burst: u32) -> Self {
        self.pageout_burst = burst;
        self
    }

    /// Set how many fruitless daemon passes a memory wait tolerates
    pub const fn with_memory_wait_passes(mut self, passes: u32) -> Self {
        self.memory_wait_passes = passes;
        self
    }

    /// Set how many free pages an idle daemon pass zeroes
    pub const fn with_idle_zero_batch(mut self, pages: u32) -> Self {
        self.idle_zero_batch = pages;
        self
    }

    /// Read-ahead window for an advice value
    pub const fn readahead(&self, advice: Advice) -> ReadAhead {
        self.readahead[advice as usize]
    }

    /// Check the configuration for internal consistency
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.reserve_pagedaemon > self.reserve_kernel {
            return Err(ConfigError::ReserveOrder {
                pagedaemon: self.reserve_pagedaemon,
                kernel: self.reserve_kernel,
            });
        }
        if self.free_target_ratio == 0 || self.free_min_ratio == 0 || self.inactive_target_ratio == 0 {
            return Err(ConfigError::ZeroRatio);
        }
        for window in &self.readahead {
            if window.len() > MAX_RANGE {
                return Err(ConfigError::ReadAheadTooLarge(window.len()));
            }
        }
        Ok(())
    }
}

impl Default for VmConfig {
    fn default() -> Self {
        Self::new()
    }
}
