//! Kernel support primitives used by the VM subsystem
//!
//! - lock: the map reader/writer lock and spin relaxation
//! - counters: event counters

pub mod counters;
pub mod lock;

pub use counters::MachCounter;
pub use lock::{cpu_relax, RwLock};
