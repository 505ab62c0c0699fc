//! # Ember Synchronization
//!
//! Events and the pools they are carved from.
//!
//! An [`EventPool`] owns a fixed number of signal slots. Each [`Event`]
//! claims one slot and releases it when its last handle is dropped. A pool
//! can be exported to another context through an IPC token; events created
//! from the re-opened pool alias the same slots, so a signal made on one side
//! is observed on the other.
//!
//! ```text
//!   EventPool (origin)        EventPool (imported)
//!        │  slot claims            │  slot claims
//!        └──────────┐   ┌──────────┘
//!                   ▼   ▼
//!              EventStorage
//!        [ slot0 | slot1 | ... | slotN ]
//!          state + notifier per slot
//! ```

#![deny(unsafe_op_in_unsafe_fn)]
#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod event;
pub mod pool;

// Re-exports
pub use ember_core::wait::{Notifier, WaitResult, WaitTimeout};
pub use event::{Event, EventDesc, EventScope, EventStatus};
pub use pool::{EventPool, EventPoolDesc, EventPoolFlags};
