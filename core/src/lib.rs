//! # Ember Core
//!
//! The per-process layer of the Ember GPU submission engine.
//!
//! ## Components
//!
//! - **Context**: root object a process creates once and passes to every
//!   constructor
//! - **Memory**: the context's unified address space and IPC memory
//! - **Access**: peer-to-peer and capability checks for memory ranges
//! - **Images**: device images reachable only through copy commands
//! - **Kernels**: the opaque kernel contract and launch arguments
//! - **Wait**: timeouts, wait results and the lost-wakeup-free notifier

#![deny(unsafe_op_in_unsafe_fn)]
#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod access;
pub mod context;
pub mod image;
pub mod kernel;
pub mod memory;
pub mod wait;

// Re-exports
pub use access::AccessTier;
pub use context::{Context, DeviceActivity};
pub use image::{Image, ImageDesc, ImageRegion};
pub use kernel::{
    run_kernel, FnKernel, GroupCount, Kernel, KernelArg, KernelArgs, KernelHandle, LaunchContext,
    GROUP_COUNT_SIZE,
};
pub use memory::{AddressSpace, AllocationInfo, MemAdvice, MemoryKind, Region, PAGE_SIZE};
pub use wait::{Notifier, WaitResult, WaitTimeout};

pub use ember_hal as hal;
