//! # Ember Hardware Abstraction Layer
//!
//! The lowest layer of the Ember GPU submission engine. It owns everything
//! that is shared by every process talking to the same driver:
//!
//! - **Errors**: the one error type used by every Ember crate
//! - **Types**: GPU addresses and device identifiers
//! - **Devices**: per-device engine counts and memory access capabilities
//! - **Topology**: the symmetric peer-to-peer link table
//! - **Driver**: the simulated platform built from a [`DriverConfig`]
//! - **IPC**: fixed-size export tokens and the driver-wide export table
//!
//! ```text
//!   process A (Context)          process B (Context)
//!          │                              │
//!          └──────────┐      ┌────────────┘
//!                     ▼      ▼
//!                ┌──────────────────┐
//!                │      Driver      │
//!                │  devices, links  │
//!                │  IPC export map  │
//!                └──────────────────┘
//! ```

#![deny(unsafe_op_in_unsafe_fn)]
#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod device;
pub mod driver;
pub mod error;
pub mod ipc;
pub mod topology;
pub mod types;

// Re-exports
pub use device::{Device, DeviceConfig, MemoryAccessCapabilities, MemoryAccessProperties};
pub use driver::{ClosedAppendPolicy, Driver, DriverConfig};
pub use error::{Error, Result};
pub use ipc::{IpcHandle, IpcHandleKind, IpcRegistry, IPC_HANDLE_SIZE};
pub use topology::{P2pProperties, PeerLink, Topology};
pub use types::{DeviceId, GpuAddr};
