//! Shared emulator infrastructure for Strato.
//!
//! This crate provides the memory subsystem the guest-facing layers build
//! on, plus the fiber primitive used by the GPU scheduler:
//!
//! - **HostMemory**: a large page-backed buffer with a reserved virtual
//!   span; guest ranges are installed, dropped, and reprotected with
//!   `map`/`unmap`/`protect`.
//! - **HeapTracker**: a residency overlay for "separate heap" mappings.
//!   Regions are recorded without host pages and materialized on first
//!   fault; a cap on distinct resident mappings drives cold-first eviction.
//! - **Fault dispatch**: the process SIGSEGV handler that routes access
//!   violations to the tracker and chains unclaimed faults to whatever
//!   handler was installed before.
//! - **Fiber**: stackful cooperative coroutines with exactly-once
//!   `yield_to` transfer.
//!
//! The memory subsystem is Unix-only; page installation and reprotection
//! are built on `mmap`/`mprotect`.

#![deny(unsafe_op_in_unsafe_fn)]

pub mod config;
pub mod fault;
pub mod fiber;
pub mod heap_tracker;
pub mod host_memory;
pub mod perm;

mod stats;

pub use config::TrackerConfig;
pub use fault::{FaultHandlerError, install_fault_handler, uninstall_fault_handler};
pub use fiber::Fiber;
pub use heap_tracker::{HeapTracker, SeparateHeapMap};
pub use host_memory::{HostMemory, HostMemoryError};
pub use perm::MemoryPermission;
pub use stats::TrackerStats;
