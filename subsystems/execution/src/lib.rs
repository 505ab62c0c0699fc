//! # Ember Execution
//!
//! Recording GPU work and running it in order.
//!
//! ## Components
//!
//! - **Command**: one closed enum for every recordable operation, each
//!   optionally carrying a completion event and start dependencies
//! - **CommandList**: deferred (record, close, submit) or immediate
//!   (dispatch on append)
//! - **CommandQueue**: FIFO of submissions drained by one worker thread
//! - **Fence**: completion signal for one submission
//!
//! ```text
//!   CommandList ──close──▶ execute_command_lists ──▶ CommandQueue
//!       │                                               │ worker
//!       │ append (immediate)                            ▼
//!       └──────────────▶ private CommandQueue ──▶ Engine ──▶ memory, events
//!                                                       │
//!                                      Fence ◀── submission complete
//! ```
//!
//! Every capability decision (P2P reachability, atomics, copy-only rules,
//! bounds) is made when a command is appended. What remains at execution
//! time is runtime state: an allocation freed after recording faults the
//! command, which is logged and recorded on the queue without stalling it.

#![deny(unsafe_op_in_unsafe_fn)]
#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod command;
mod engine;
pub mod fence;
pub mod list;
pub mod queue;
mod validate;

#[cfg(test)]
mod scenarios;

// Re-exports
pub use command::{
    Command, CommandKind, CopyRegion, ImageCopy, IndirectLaunch, PitchedRegion, MAX_FILL_PATTERN,
};
pub use fence::{Fence, FenceStatus};
pub use list::{CommandList, CommandListDesc, CommandListFlags, ListMode, ListState};
pub use queue::{
    CommandQueue, CommandQueueDesc, CommandQueueFlags, QueueFault, QueueMode, QueuePriority,
    QueueStats,
};
