//! UVM_R - Demand-paging fault resolver and physical page lifecycle manager
//!
//! This crate provides the machine-independent core of a two-layer
//! virtual memory system: address-space maps with an anonymous
//! copy-on-write layer over pager-backed objects, the page fault routine
//! that resolves a faulting address to a resident and correctly protected
//! page, and the registry that owns every physical frame.
//!
//! The MMU is reached only through the [`vm::Pmap`] and [`vm::PhysMemory`]
//! capabilities; [`vm::soft_pmap`] implements both in software so the crate
//! runs on a hosted target.

#![no_std]
// Kernel-appropriate clippy configuration
// Kernel code often needs explicit casts between address and index types
#![allow(clippy::unnecessary_cast)]
// Pager interfaces mirror their C ancestors' argument lists
#![allow(clippy::too_many_arguments)]

// Standard library replacement for no_std
extern crate alloc;

pub mod kern;
pub mod vm;

pub use vm::{vm_fault, FaultError, FaultType, VmConfig, VmMap, VmProt, VmSystem};
