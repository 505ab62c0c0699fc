//! # Command Queues
//!
//! A queue owns one worker thread and a FIFO of submissions. Each
//! `execute_command_lists` call becomes one submission with a sequence
//! number; the worker runs submissions strictly in sequence order and every
//! command of a submission strictly in recorded order.
//!
//! ```text
//!   host threads                 queue lock                worker
//!   ────────────                 ──────────                ──────
//!   execute_command_lists ──▶ [ seq 4 | seq 5 | seq 6 ] ──▶ run seq 3
//!                                  ▲                          │
//!   synchronize ◀── progress ──────┴── completed = 3 ◀────────┘
//! ```

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::thread::JoinHandle;
use std::time::Instant;

use ember_core::wait::{WaitResult, WaitTimeout};
use ember_core::{Context, DeviceActivity};
use ember_hal::{DeviceId, Error, Result};
use parking_lot::{Condvar, Mutex};

use crate::engine::{Engine, Outcome};
use crate::fence::Fence;
use crate::list::{Batch, CommandList};

// =============================================================================
// DESCRIPTOR
// =============================================================================

bitflags::bitflags! {
    /// Command queue flags
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct CommandQueueFlags: u32 {
        /// Runs on a copy engine; only copy-only lists may be submitted
        const COPY_ONLY = 1 << 0;
        /// Logical queue multiplexed on a shared engine
        const LOGICAL_ONLY = 1 << 1;
        /// Restrict execution to one slice of the device
        const SINGLE_SLICE_ONLY = 1 << 2;
    }
}

impl Default for CommandQueueFlags {
    fn default() -> Self {
        Self::empty()
    }
}

/// Completion-reporting mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum QueueMode {
    /// Driver choice; behaves as `Asynchronous`
    #[default]
    Default,
    /// Submission calls return once the device has accepted the work
    Synchronous,
    /// Submission calls return once the work is enqueued
    Asynchronous,
}

/// Queue priority
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum QueuePriority {
    /// Normal
    #[default]
    Normal,
    /// Low
    Low,
    /// High
    High,
}

/// Command queue descriptor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CommandQueueDesc {
    /// Engine ordinal; indexes copy engines for copy-only queues
    pub ordinal: u32,
    /// Queue index within the engine
    pub index: u32,
    /// Flags
    pub flags: CommandQueueFlags,
    /// Completion-reporting mode
    pub mode: QueueMode,
    /// Priority
    pub priority: QueuePriority,
}

impl CommandQueueDesc {
    /// Set engine ordinal
    pub fn with_ordinal(mut self, ordinal: u32) -> Self {
        self.ordinal = ordinal;
        self
    }

    /// Set queue index
    pub fn with_index(mut self, index: u32) -> Self {
        self.index = index;
        self
    }

    /// Set flags
    pub fn with_flags(mut self, flags: CommandQueueFlags) -> Self {
        self.flags = flags;
        self
    }

    /// Set mode
    pub fn with_mode(mut self, mode: QueueMode) -> Self {
        self.mode = mode;
        self
    }

    /// Set priority
    pub fn with_priority(mut self, priority: QueuePriority) -> Self {
        self.priority = priority;
        self
    }

    /// Check if this describes a copy-engine queue
    #[inline]
    pub fn is_copy_only(&self) -> bool {
        self.flags.contains(CommandQueueFlags::COPY_ONLY)
    }
}

/// Check an engine ordinal against a device
pub(crate) fn check_ordinal(context: &Context, device: DeviceId, ordinal: u32, copy: bool) -> Result<()> {
    let dev = context.driver().device(device)?;
    let engines = if copy {
        dev.copy_engines()
    } else {
        dev.compute_engines()
    };
    if ordinal < engines {
        Ok(())
    } else {
        log::warn!(
            "{} has {} {} engine(s), ordinal {} requested",
            device,
            engines,
            if copy { "copy" } else { "compute" },
            ordinal
        );
        Err(Error::InvalidParameter)
    }
}

// =============================================================================
// STATISTICS
// =============================================================================

/// Queue statistics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueStats {
    /// Submissions accepted
    pub submissions: u64,
    /// Submissions fully executed
    pub completed: u64,
    /// Commands that completed
    pub commands_executed: u64,
    /// Commands that faulted
    pub faults: u64,
    /// Submissions discarded at shutdown
    pub discarded: u64,
}

/// A command that failed on the device
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueFault {
    /// Submission sequence number
    pub seq: u64,
    /// Name of the failing command
    pub command: &'static str,
    /// Error it hit
    pub error: Error,
}

// =============================================================================
// SHARED STATE
// =============================================================================

struct Submission {
    seq: u64,
    batches: Vec<Batch>,
    fence: Option<Fence>,
}

struct QueueState {
    pending: VecDeque<Submission>,
    /// Next sequence number to hand out
    next_seq: u64,
    /// Highest sequence number the worker has picked up
    accepted: u64,
    /// Highest sequence number fully executed
    completed: u64,
    shutdown: bool,
}

struct QueueShared {
    id: u64,
    device: DeviceId,
    context: Arc<Context>,
    desc: CommandQueueDesc,
    state: Mutex<QueueState>,
    /// Worker wake-ups
    work: Condvar,
    /// Accept and completion progress
    progress: Condvar,
    abort: AtomicBool,
    stats: spin::Mutex<QueueStats>,
    last_fault: spin::Mutex<Option<QueueFault>>,
}

impl QueueShared {
    fn wait_progress(
        &self,
        timeout: WaitTimeout,
        mut done: impl FnMut(&QueueState) -> bool,
    ) -> WaitResult {
        let deadline = timeout.deadline();
        let mut state = self.state.lock();
        while !done(&state) {
            match deadline {
                None => self.progress.wait(&mut state),
                Some(at) => {
                    if Instant::now() >= at || self.progress.wait_until(&mut state, at).timed_out()
                    {
                        return if done(&state) {
                            WaitResult::Success
                        } else {
                            WaitResult::Timeout
                        };
                    }
                }
            }
        }
        WaitResult::Success
    }

    fn wait_completed(&self, seq: u64, timeout: WaitTimeout) -> WaitResult {
        self.wait_progress(timeout, |s| s.completed >= seq)
    }

    /// Execute one submission; returns false if the queue is shutting down
    fn run_submission(&self, engine: &Engine<'_>, submission: &Submission) -> bool {
        for batch in &submission.batches {
            for command in batch.commands() {
                match engine.execute(command) {
                    Outcome::Completed => self.stats.lock().commands_executed += 1,
                    Outcome::Faulted(error) => {
                        let name = command.kind().name();
                        log::error!(
                            "Queue {} faulted in {} of submission {}: {}",
                            self.id,
                            name,
                            submission.seq,
                            error
                        );
                        self.stats.lock().faults += 1;
                        *self.last_fault.lock() = Some(QueueFault {
                            seq: submission.seq,
                            command: name,
                            error,
                        });
                    }
                    Outcome::Aborted => return false,
                }
            }
        }
        true
    }
}

impl DeviceActivity for QueueShared {
    fn device(&self) -> DeviceId {
        self.device
    }

    fn wait_idle(&self, timeout: WaitTimeout) -> WaitResult {
        let target = self.state.lock().next_seq - 1;
        self.wait_completed(target, timeout)
    }
}

fn worker(shared: Arc<QueueShared>) {
    let engine = Engine::new(&shared.context, &shared.abort);
    loop {
        let submission = {
            let mut state = shared.state.lock();
            loop {
                if state.shutdown {
                    let discarded = state.pending.len();
                    if discarded > 0 {
                        log::warn!(
                            "Queue {} discarding {} pending submission(s)",
                            shared.id,
                            discarded
                        );
                    }
                    state.pending.clear();
                    state.completed = state.next_seq - 1;
                    shared.stats.lock().discarded += discarded as u64;
                    shared.progress.notify_all();
                    return;
                }
                if let Some(submission) = state.pending.pop_front() {
                    state.accepted = submission.seq;
                    shared.progress.notify_all();
                    break submission;
                }
                shared.work.wait(&mut state);
            }
        };

        log::trace!("Queue {} running submission {}", shared.id, submission.seq);
        let finished = shared.run_submission(&engine, &submission);
        let Submission {
            seq,
            batches,
            fence,
        } = submission;
        // Lists must be free for destroy by the time anyone observes completion.
        drop(batches);
        if !finished {
            // The shutdown branch above settles the counters.
            continue;
        }
        if let Some(fence) = fence {
            fence.complete(seq);
        }
        shared.stats.lock().completed += 1;
        let mut state = shared.state.lock();
        state.completed = seq;
        shared.progress.notify_all();
    }
}

// =============================================================================
// QUEUE
// =============================================================================

/// Command queue
pub struct CommandQueue {
    shared: Arc<QueueShared>,
    worker: Option<JoinHandle<()>>,
}

impl CommandQueue {
    /// Create a queue on a device
    pub fn create(context: &Arc<Context>, device: DeviceId, desc: CommandQueueDesc) -> Result<Self> {
        check_ordinal(context, device, desc.ordinal, desc.is_copy_only())?;

        let id = context.driver().allocate_id();
        let shared = Arc::new(QueueShared {
            id,
            device,
            context: Arc::clone(context),
            desc,
            state: Mutex::new(QueueState {
                pending: VecDeque::new(),
                next_seq: 1,
                accepted: 0,
                completed: 0,
                shutdown: false,
            }),
            work: Condvar::new(),
            progress: Condvar::new(),
            abort: AtomicBool::new(false),
            stats: spin::Mutex::new(QueueStats::default()),
            last_fault: spin::Mutex::new(None),
        });

        let worker_shared = Arc::clone(&shared);
        let worker = std::thread::Builder::new()
            .name(format!("ember-queue-{}", id))
            .spawn(move || worker(worker_shared))
            .map_err(|err| {
                log::error!("Failed to spawn worker for queue {}: {}", id, err);
                Error::OutOfResources
            })?;

        let activity: Weak<QueueShared> = Arc::downgrade(&shared);
        context.register_activity(activity);

        log::debug!(
            "Creating command queue {} on {} (ordinal {}, {:?}, {:?})",
            id,
            device,
            desc.ordinal,
            desc.mode,
            desc.priority
        );
        Ok(Self {
            shared,
            worker: Some(worker),
        })
    }

    /// Submit closed command lists as one unit, optionally signaling `fence`
    /// once all of them have executed
    pub fn execute_command_lists(&self, lists: &[&CommandList], fence: Option<&Fence>) -> Result<()> {
        if lists.is_empty() {
            return Err(Error::InvalidParameter);
        }
        if let Some(fence) = fence {
            if fence.queue_id() != self.shared.id {
                return Err(Error::InvalidParameter);
            }
        }
        let batches = lists
            .iter()
            .map(|list| list.begin_submission(self))
            .collect::<Result<Vec<_>>>()?;

        let seq = self.submit(batches, fence.cloned())?;
        log::debug!(
            "Queue {} accepted submission {} ({} list(s))",
            self.shared.id,
            seq,
            lists.len()
        );
        if self.shared.desc.mode == QueueMode::Synchronous {
            self.shared
                .wait_progress(WaitTimeout::Infinite, |s| s.accepted >= seq);
        }
        Ok(())
    }

    /// Block until everything submitted so far has executed
    pub fn synchronize(&self, timeout: WaitTimeout) -> WaitResult {
        self.shared.wait_idle(timeout)
    }

    /// Enqueue batches as one submission and return its sequence number
    pub(crate) fn submit(&self, batches: Vec<Batch>, fence: Option<Fence>) -> Result<u64> {
        let mut state = self.shared.state.lock();
        if state.shutdown {
            return Err(Error::InvalidState);
        }
        let seq = state.next_seq;
        if let Some(fence) = &fence {
            fence.bind(seq)?;
        }
        state.next_seq += 1;
        state.pending.push_back(Submission {
            seq,
            batches,
            fence,
        });
        drop(state);

        self.shared.stats.lock().submissions += 1;
        self.shared.work.notify_one();
        Ok(seq)
    }

    /// Block until submission `seq` has executed
    pub(crate) fn wait_for(&self, seq: u64, timeout: WaitTimeout) -> WaitResult {
        self.shared.wait_completed(seq, timeout)
    }

    /// Get queue ID
    #[inline]
    pub fn id(&self) -> u64 {
        self.shared.id
    }

    /// Get device
    #[inline]
    pub fn device(&self) -> DeviceId {
        self.shared.device
    }

    /// Get owning context
    #[inline]
    pub fn context(&self) -> &Arc<Context> {
        &self.shared.context
    }

    /// Get descriptor
    #[inline]
    pub fn desc(&self) -> &CommandQueueDesc {
        &self.shared.desc
    }

    /// Get flags
    #[inline]
    pub fn flags(&self) -> CommandQueueFlags {
        self.shared.desc.flags
    }

    /// Get mode
    #[inline]
    pub fn mode(&self) -> QueueMode {
        self.shared.desc.mode
    }

    /// Get priority
    #[inline]
    pub fn priority(&self) -> QueuePriority {
        self.shared.desc.priority
    }

    /// Get statistics
    pub fn stats(&self) -> QueueStats {
        *self.shared.stats.lock()
    }

    /// Most recent device fault, if any
    pub fn last_fault(&self) -> Option<QueueFault> {
        *self.shared.last_fault.lock()
    }

    /// Submissions not yet picked up by the worker
    pub fn pending(&self) -> usize {
        self.shared.state.lock().pending.len()
    }
}

impl core::fmt::Debug for CommandQueue {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("CommandQueue")
            .field("id", &self.shared.id)
            .field("device", &self.shared.device)
            .field("desc", &self.shared.desc)
            .finish()
    }
}

impl Drop for CommandQueue {
    fn drop(&mut self) {
        log::debug!("Destroying command queue {}", self.shared.id);
        self.shared.abort.store(true, Ordering::Release);
        self.shared.state.lock().shutdown = true;
        self.shared.work.notify_all();
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                log::error!("Worker of queue {} panicked", self.shared.id);
            }
        }
    }
}

static_assertions::assert_impl_all!(CommandQueue: Send, Sync);
