//! # Command Lists
//!
//! One type for both execution modes. A deferred list records commands
//! until `close` and can be submitted any number of times; an immediate
//! list owns a private queue and dispatches every command as it is
//! appended.
//!
//! ```text
//!            append                 execute_command_lists
//!   ┌──────────────┐   close   ┌────────┐ ─────────────▶ (queue)
//!   │  Recording   │ ────────▶ │ Closed │
//!   └──────────────┘ ◀──────── └────────┘
//!                      reset
//! ```
//!
//! A submission captures the recorded sequence, so `reset` and new appends
//! never disturb work that is already queued.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use ember_core::wait::{WaitResult, WaitTimeout};
use ember_core::Context;
use ember_hal::{ClosedAppendPolicy, DeviceId, Error, Result};
use spin::Mutex;

use crate::command::Command;
use crate::queue::{check_ordinal, CommandQueue, CommandQueueDesc, CommandQueueFlags, QueueMode};
use crate::validate::Target;

// =============================================================================
// DESCRIPTOR
// =============================================================================

bitflags::bitflags! {
    /// Command list flags
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct CommandListFlags: u32 {
        /// Driver may reorder independent commands
        const RELAXED_ORDERING = 1 << 0;
        /// Optimize for throughput over latency
        const MAXIMIZE_THROUGHPUT = 1 << 1;
        /// Only explicit event dependencies order commands
        const EXPLICIT_ONLY = 1 << 2;
        /// Records only copy, fill, barrier and event commands
        const COPY_ONLY = 1 << 3;
    }
}

impl Default for CommandListFlags {
    fn default() -> Self {
        Self::empty()
    }
}

/// Execution mode
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListMode {
    /// Record, close, submit
    Deferred,
    /// Dispatch on append
    Immediate,
}

/// Lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListState {
    /// Accepting commands
    Recording,
    /// Frozen; submittable if deferred
    Closed,
}

/// Command list descriptor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CommandListDesc {
    /// Engine ordinal the list will be submitted to
    pub ordinal: u32,
    /// Flags
    pub flags: CommandListFlags,
}

impl CommandListDesc {
    /// Set engine ordinal
    pub fn with_ordinal(mut self, ordinal: u32) -> Self {
        self.ordinal = ordinal;
        self
    }

    /// Set flags
    pub fn with_flags(mut self, flags: CommandListFlags) -> Self {
        self.flags = flags;
        self
    }
}

// =============================================================================
// SUBMISSION BATCH
// =============================================================================

/// A list's command sequence captured for one submission
pub(crate) struct Batch {
    commands: Arc<Vec<Command>>,
    in_flight: Arc<AtomicUsize>,
}

impl Batch {
    fn new(commands: Arc<Vec<Command>>, in_flight: &Arc<AtomicUsize>) -> Self {
        in_flight.fetch_add(1, Ordering::AcqRel);
        Self {
            commands,
            in_flight: Arc::clone(in_flight),
        }
    }

    #[inline]
    pub(crate) fn commands(&self) -> &[Command] {
        &self.commands
    }
}

impl Drop for Batch {
    fn drop(&mut self) {
        self.in_flight.fetch_sub(1, Ordering::AcqRel);
    }
}

// =============================================================================
// COMMAND LIST
// =============================================================================

struct ListInner {
    state: ListState,
    commands: Arc<Vec<Command>>,
    destroyed: bool,
    /// Last submission of an immediate list
    last_seq: u64,
}

/// Command list
pub struct CommandList {
    id: u64,
    context: Arc<Context>,
    device: DeviceId,
    flags: CommandListFlags,
    mode: ListMode,
    policy: ClosedAppendPolicy,
    inner: Mutex<ListInner>,
    in_flight: Arc<AtomicUsize>,
    dropped_appends: AtomicU64,
    queue: Option<CommandQueue>,
}

impl CommandList {
    fn new(
        context: &Arc<Context>,
        device: DeviceId,
        flags: CommandListFlags,
        queue: Option<CommandQueue>,
    ) -> Self {
        let mode = if queue.is_some() {
            ListMode::Immediate
        } else {
            ListMode::Deferred
        };
        let id = context.driver().allocate_id();
        log::debug!("Creating {:?} command list {} on {}", mode, id, device);
        Self {
            id,
            context: Arc::clone(context),
            device,
            flags,
            mode,
            policy: context.driver().closed_append_policy(),
            inner: Mutex::new(ListInner {
                state: ListState::Recording,
                commands: Arc::new(Vec::new()),
                destroyed: false,
                last_seq: 0,
            }),
            in_flight: Arc::new(AtomicUsize::new(0)),
            dropped_appends: AtomicU64::new(0),
            queue,
        }
    }

    /// Create a deferred list
    pub fn create(context: &Arc<Context>, device: DeviceId, desc: CommandListDesc) -> Result<Self> {
        let copy = desc.flags.contains(CommandListFlags::COPY_ONLY);
        check_ordinal(context, device, desc.ordinal, copy)?;
        Ok(Self::new(context, device, desc.flags, None))
    }

    /// Create an immediate list backed by its own queue
    pub fn create_immediate(
        context: &Arc<Context>,
        device: DeviceId,
        desc: CommandQueueDesc,
    ) -> Result<Self> {
        let queue = CommandQueue::create(context, device, desc)?;
        let flags = if desc.is_copy_only() {
            CommandListFlags::COPY_ONLY
        } else {
            CommandListFlags::empty()
        };
        Ok(Self::new(context, device, flags, Some(queue)))
    }

    // =========================================================================
    // Recording
    // =========================================================================

    /// Record a command, or dispatch it on an immediate list
    ///
    /// On a closed deferred list the command is dropped under
    /// [`ClosedAppendPolicy::Drop`] and rejected with `InvalidState` under
    /// [`ClosedAppendPolicy::Reject`]. Either way it never executes.
    pub fn append(&self, command: Command) -> Result<()> {
        let mut inner = self.inner.lock();
        if inner.destroyed {
            return Err(Error::InvalidState);
        }
        if inner.state == ListState::Closed {
            return self.append_after_close(&command);
        }
        self.target().check(&command)?;

        let Some(queue) = &self.queue else {
            Arc::make_mut(&mut inner.commands).push(command);
            return Ok(());
        };

        let commands = Arc::new(vec![command]);
        let seq = queue.submit(vec![Batch::new(commands, &self.in_flight)], None)?;
        inner.last_seq = seq;
        drop(inner);
        if queue.mode() == QueueMode::Synchronous {
            queue.wait_for(seq, WaitTimeout::Infinite);
        }
        Ok(())
    }

    fn append_after_close(&self, command: &Command) -> Result<()> {
        if self.mode == ListMode::Immediate {
            return Err(Error::InvalidState);
        }
        match self.policy {
            ClosedAppendPolicy::Drop => {
                self.dropped_appends.fetch_add(1, Ordering::Relaxed);
                log::warn!(
                    "Dropping {} appended to closed command list {}",
                    command.kind().name(),
                    self.id
                );
                Ok(())
            }
            ClosedAppendPolicy::Reject => Err(Error::InvalidState),
        }
    }

    /// Freeze the list for submission
    pub fn close(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        if inner.destroyed || inner.state == ListState::Closed {
            return Err(Error::InvalidState);
        }
        inner.state = ListState::Closed;
        log::trace!(
            "Closed command list {} with {} command(s)",
            self.id,
            inner.commands.len()
        );
        Ok(())
    }

    /// Discard recorded commands and return to recording
    pub fn reset(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        if inner.destroyed {
            return Err(Error::InvalidState);
        }
        inner.commands = Arc::new(Vec::new());
        inner.state = ListState::Recording;
        log::trace!("Reset command list {}", self.id);
        Ok(())
    }

    /// Destroy the list; fails while a submission still references it
    pub fn destroy(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        if inner.destroyed {
            return Err(Error::InvalidState);
        }
        let in_flight = self.in_flight.load(Ordering::Acquire);
        if in_flight > 0 {
            log::warn!(
                "Command list {} destroyed with {} submission(s) in flight",
                self.id,
                in_flight
            );
            return Err(Error::InvalidState);
        }
        inner.destroyed = true;
        inner.commands = Arc::new(Vec::new());
        log::debug!("Destroying command list {}", self.id);
        Ok(())
    }

    /// Wait for every command dispatched so far; immediate lists only
    pub fn host_synchronize(&self, timeout: WaitTimeout) -> Result<WaitResult> {
        let queue = self.queue.as_ref().ok_or(Error::InvalidParameter)?;
        let seq = self.inner.lock().last_seq;
        Ok(queue.wait_for(seq, timeout))
    }

    // =========================================================================
    // Submission
    // =========================================================================

    /// Capture the recorded sequence for a submission to `queue`
    pub(crate) fn begin_submission(&self, queue: &CommandQueue) -> Result<Batch> {
        if self.mode == ListMode::Immediate {
            return Err(Error::InvalidParameter);
        }
        let queue_copy = queue.flags().contains(CommandQueueFlags::COPY_ONLY);
        if queue.context().id() != self.context.id()
            || queue.device() != self.device
            || queue_copy != self.is_copy_only()
        {
            log::warn!(
                "Command list {} does not match queue {}",
                self.id,
                queue.id()
            );
            return Err(Error::InvalidParameter);
        }
        let inner = self.inner.lock();
        if inner.destroyed || inner.state != ListState::Closed {
            return Err(Error::InvalidState);
        }
        Ok(Batch::new(Arc::clone(&inner.commands), &self.in_flight))
    }

    fn target(&self) -> Target<'_> {
        Target {
            context: &self.context,
            device: self.device,
            copy_only: self.is_copy_only(),
        }
    }

    // =========================================================================
    // Accessors
    // =========================================================================

    /// Get list ID
    #[inline]
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Get device
    #[inline]
    pub fn device(&self) -> DeviceId {
        self.device
    }

    /// Get flags
    #[inline]
    pub fn flags(&self) -> CommandListFlags {
        self.flags
    }

    /// Get mode
    #[inline]
    pub fn mode(&self) -> ListMode {
        self.mode
    }

    /// Check if copy-only
    #[inline]
    pub fn is_copy_only(&self) -> bool {
        self.flags.contains(CommandListFlags::COPY_ONLY)
    }

    /// Get lifecycle state
    pub fn state(&self) -> ListState {
        self.inner.lock().state
    }

    /// Number of recorded commands; always zero for immediate lists
    pub fn len(&self) -> usize {
        self.inner.lock().commands.len()
    }

    /// Check if no commands are recorded
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Submissions still referencing this list
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::Acquire)
    }

    /// Commands silently dropped after close
    pub fn dropped_appends(&self) -> u64 {
        self.dropped_appends.load(Ordering::Relaxed)
    }

    /// Check if destroyed
    pub fn is_destroyed(&self) -> bool {
        self.inner.lock().destroyed
    }

    /// Backing queue of an immediate list
    pub fn queue(&self) -> Option<&CommandQueue> {
        self.queue.as_ref()
    }
}

impl core::fmt::Debug for CommandList {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("CommandList")
            .field("id", &self.id)
            .field("device", &self.device)
            .field("mode", &self.mode)
            .field("flags", &self.flags)
            .field("state", &self.state())
            .finish()
    }
}

impl Drop for CommandList {
    fn drop(&mut self) {
        if !self.inner.get_mut().destroyed {
            log::debug!("Destroying command list {}", self.id);
        }
    }
}

static_assertions::assert_impl_all!(CommandList: Send, Sync);

#[cfg(test)]
mod tests {
    use super::*;
    use ember_hal::{Driver, DriverConfig};

    fn context() -> Arc<Context> {
        Context::new(Driver::new(DriverConfig::default()).unwrap())
    }

    fn list(ctx: &Arc<Context>) -> CommandList {
        CommandList::create(ctx, DeviceId(0), CommandListDesc::default()).unwrap()
    }

    #[test]
    fn test_lifecycle() {
        let ctx = context();
        let list = list(&ctx);
        assert_eq!(list.mode(), ListMode::Deferred);
        assert_eq!(list.state(), ListState::Recording);
        list.append(Command::barrier()).unwrap();
        list.close().unwrap();
        assert_eq!(list.state(), ListState::Closed);
        assert_eq!(list.close().unwrap_err(), Error::InvalidState);
        list.reset().unwrap();
        assert_eq!(list.state(), ListState::Recording);
        assert!(list.is_empty());
        list.reset().unwrap();
        list.destroy().unwrap();
        assert_eq!(list.append(Command::barrier()).unwrap_err(), Error::InvalidState);
        assert_eq!(list.destroy().unwrap_err(), Error::InvalidState);
    }

    #[test]
    fn test_append_after_close_dropped() {
        let ctx = context();
        let list = list(&ctx);
        list.append(Command::barrier()).unwrap();
        list.close().unwrap();
        list.append(Command::barrier()).unwrap();
        assert_eq!(list.len(), 1);
        assert_eq!(list.dropped_appends(), 1);
    }

    #[test]
    fn test_append_after_close_rejected() {
        let config = DriverConfig::default().with_closed_append_policy(ClosedAppendPolicy::Reject);
        let ctx = Context::new(Driver::new(config).unwrap());
        let list = list(&ctx);
        list.close().unwrap();
        assert_eq!(list.append(Command::barrier()).unwrap_err(), Error::InvalidState);
        assert_eq!(list.len(), 0);
        assert_eq!(list.dropped_appends(), 0);
    }

    #[test]
    fn test_failed_append_leaves_sequence_intact() {
        let ctx = context();
        let list = list(&ctx);
        let buf = ctx.alloc_host(16).unwrap();
        list.append(Command::memory_fill(buf, 1, 16)).unwrap();
        assert_eq!(
            list.append(Command::memory_fill(buf, 1, 32)).unwrap_err(),
            Error::OutOfBounds
        );
        assert_eq!(list.len(), 1);
        assert_eq!(list.state(), ListState::Recording);
    }

    #[test]
    fn test_submission_requires_closed() {
        let ctx = context();
        let queue = CommandQueue::create(&ctx, DeviceId(0), CommandQueueDesc::default()).unwrap();
        let list = list(&ctx);
        assert_eq!(list.begin_submission(&queue).err(), Some(Error::InvalidState));
        list.close().unwrap();
        let batch = list.begin_submission(&queue).unwrap();
        assert_eq!(list.in_flight(), 1);
        assert_eq!(list.destroy().unwrap_err(), Error::InvalidState);
        drop(batch);
        assert_eq!(list.in_flight(), 0);
        list.destroy().unwrap();
    }

    #[test]
    fn test_copy_only_pairing() {
        let ctx = context();
        let compute = CommandQueue::create(&ctx, DeviceId(0), CommandQueueDesc::default()).unwrap();
        let copy_queue = CommandQueue::create(
            &ctx,
            DeviceId(0),
            CommandQueueDesc::default().with_flags(CommandQueueFlags::COPY_ONLY),
        )
        .unwrap();
        let copy = CommandList::create(
            &ctx,
            DeviceId(0),
            CommandListDesc::default().with_flags(CommandListFlags::COPY_ONLY),
        )
        .unwrap();
        copy.close().unwrap();
        assert_eq!(copy.begin_submission(&compute).err(), Some(Error::InvalidParameter));
        assert!(copy.begin_submission(&copy_queue).is_ok());
    }

    #[test]
    fn test_immediate_list_rules() {
        let ctx = context();
        let list = CommandList::create_immediate(&ctx, DeviceId(0), CommandQueueDesc::default())
            .unwrap();
        assert_eq!(list.mode(), ListMode::Immediate);
        list.append(Command::barrier()).unwrap();
        assert!(list.host_synchronize(WaitTimeout::Infinite).unwrap().is_success());
        assert_eq!(list.len(), 0);

        let queue = CommandQueue::create(&ctx, DeviceId(0), CommandQueueDesc::default()).unwrap();
        assert_eq!(list.begin_submission(&queue).err(), Some(Error::InvalidParameter));

        list.close().unwrap();
        assert_eq!(list.append(Command::barrier()).unwrap_err(), Error::InvalidState);
        list.reset().unwrap();
        list.append(Command::barrier()).unwrap();

        let deferred = CommandList::create(&ctx, DeviceId(0), CommandListDesc::default()).unwrap();
        assert_eq!(
            deferred.host_synchronize(WaitTimeout::None).unwrap_err(),
            Error::InvalidParameter
        );
    }
}
