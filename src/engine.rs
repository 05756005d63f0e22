//! Command dispatcher: the execution substrate behind every queue.
//!
//! # Architecture
//!
//! ```text
//!  enqueue_* ──► pending set ──► eligibility scan ──► run ──► event COMPLETE
//!  (any thread)   (engine lock)   (dispatcher thread)  (payload flips)
//! ```
//!
//! One dispatcher thread per context owns command execution. All queues in
//! the context share it: a queue is an ordering domain, not a thread. Every
//! state the scheduler reads while deciding eligibility — pending commands,
//! dependency event states, semaphore payloads — is read and committed under
//! one mutex, which is what makes the multi-semaphore wait conjunction
//! atomic with respect to concurrent signals.
//!
//! # Eligibility
//!
//! A pending command may run once all of the following hold:
//! - **ordering**: in an in-order queue, no earlier command of the same
//!   queue is still pending; out-of-order queues skip this check entirely,
//!   so an empty-wait-list signal never blocks on unrelated prior work;
//! - **dependencies**: every wait-list event is `Complete` (a failed
//!   dependency fails the command instead of running it);
//! - **payloads** (wait commands only): every target semaphore is signaled.
//!   The conjunction is re-checked and consumed under the same lock hold.
//!
//! The scan is a linear pass over the pending set in enqueue order. Pending
//! sets are small (bounded by outstanding work, not history) and the pass
//! preserves enqueue order as the tiebreak between equally eligible
//! commands.
//!
//! # Idle behavior
//!
//! The dispatcher parks when nothing is eligible and is unparked by every
//! enqueue and user-event transition. Waits on imported semaphores depend
//! on fd state no in-process actor will announce, so while any are pending
//! the dispatcher parks with a short timeout and re-polls.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam_utils::sync::{Parker, Unparker};

use crate::error::SemError;
use crate::event::{Event, EventState};
use crate::queue::CommandKind;
use crate::semaphore::SemaphoreInner;
use crate::trace::{self, TraceEvent};

/// Re-poll cadence while fd-backed waits are pending.
const IMPORT_POLL_INTERVAL: Duration = Duration::from_millis(1);

/// One enqueued command, immutable after submission.
pub(crate) struct Command {
    pub kind: CommandKind,
    pub queue: u64,
    /// Queue ordering mode, captured at enqueue.
    pub ordered: bool,
    /// Position within the owning queue, assigned under the engine lock so
    /// it always matches pending-set order.
    pub seq: u64,
    /// Target semaphores (signal/wait only).
    pub targets: Vec<Arc<SemaphoreInner>>,
    /// Explicit predecessor edges.
    pub wait_list: Vec<Event>,
    pub event: Event,
}

/// Mutable engine state, guarded by the [`EngineShared`] mutex.
pub(crate) struct EngineState {
    pending: VecDeque<Command>,
    pub shutdown: bool,
    pub trace: Option<Vec<TraceEvent>>,
}

/// Shared between queues, events, and the dispatcher thread.
pub(crate) struct EngineShared {
    state: Mutex<EngineState>,
    /// Wakes client-side blockers: `Event::wait`, `finish`.
    cv: Condvar,
    /// Wakes the dispatcher thread.
    unparker: Unparker,
}

impl EngineShared {
    pub(crate) fn lock_state(&self) -> MutexGuard<'_, EngineState> {
        self.state.lock().expect("engine state mutex poisoned")
    }

    /// Blocks on the engine condvar, releasing the state lock.
    pub(crate) fn wait_on<'a>(
        &self,
        guard: MutexGuard<'a, EngineState>,
    ) -> MutexGuard<'a, EngineState> {
        self.cv.wait(guard).expect("engine state mutex poisoned")
    }

    /// Wakes the dispatcher and every client-side blocker.
    pub(crate) fn wake_all(&self) {
        self.unparker.unpark();
        self.cv.notify_all();
    }

    /// Accepts a command into the pending set. Non-blocking.
    ///
    /// The command's queue sequence number is drawn from `seq_counter`
    /// under the state lock, so sequence order and pending-set order agree
    /// even under concurrent submitters.
    pub(crate) fn enqueue(&self, mut cmd: Command, seq_counter: &AtomicU64) -> Result<(), SemError> {
        {
            let mut st = self.lock_state();
            if st.shutdown {
                return Err(SemError::invalid_operation(
                    "enqueue on a torn-down context",
                ));
            }
            cmd.seq = seq_counter.fetch_add(1, Ordering::Relaxed);
            trace::record(
                &mut st.trace,
                TraceEvent::Enqueue {
                    queue: cmd.queue,
                    seq: cmd.seq,
                    kind: cmd.kind,
                    event: cmd.event.id(),
                },
            );
            st.pending.push_back(cmd);
        }
        self.unparker.unpark();
        Ok(())
    }

    /// Makes submitted work visible to the dispatcher without blocking.
    ///
    /// Commands are visible from enqueue already; this is a wakeup nudge
    /// kept for API parity with explicit-flush engines.
    pub(crate) fn flush(&self) -> Result<(), SemError> {
        if self.lock_state().shutdown {
            return Err(SemError::invalid_operation("flush on a torn-down context"));
        }
        self.unparker.unpark();
        Ok(())
    }

    /// Blocks until no command of `queue` remains pending.
    pub(crate) fn finish(&self, queue: u64) -> Result<(), SemError> {
        let mut st = self.lock_state();
        loop {
            if !st.pending.iter().any(|c| c.queue == queue) {
                return Ok(());
            }
            if st.shutdown {
                return Err(SemError::invalid_operation(
                    "context torn down with commands outstanding",
                ));
            }
            st = self.wait_on(st);
        }
    }
}

/// Owns the dispatcher thread; tears it down on drop.
pub(crate) struct Engine {
    shared: Arc<EngineShared>,
    dispatcher: Option<JoinHandle<()>>,
}

impl Engine {
    pub(crate) fn start() -> Self {
        let parker = Parker::new();
        let shared = Arc::new(EngineShared {
            state: Mutex::new(EngineState {
                pending: VecDeque::new(),
                shutdown: false,
                trace: None,
            }),
            cv: Condvar::new(),
            unparker: parker.unparker().clone(),
        });
        let thread_shared = Arc::clone(&shared);
        let dispatcher = std::thread::Builder::new()
            .name("semaq-dispatcher".to_string())
            .spawn(move || dispatcher_loop(&thread_shared, &parker))
            .expect("failed to spawn dispatcher thread");
        Self {
            shared,
            dispatcher: Some(dispatcher),
        }
    }

    pub(crate) fn shared(&self) -> &Arc<EngineShared> {
        &self.shared
    }

    /// Stops the dispatcher and fails whatever was still pending.
    pub(crate) fn shutdown(&mut self) {
        {
            let mut st = self.shared.lock_state();
            st.shutdown = true;
        }
        self.shared.wake_all();
        if let Some(handle) = self.dispatcher.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        self.shutdown();
    }
}

// ----------------------------------------------------------------------------
// Dispatcher loop
// ----------------------------------------------------------------------------

enum Step {
    /// Command at this index is eligible.
    Run(usize),
    /// Command at this index cannot ever run.
    Fail(usize, SemError),
}

fn dispatcher_loop(shared: &Arc<EngineShared>, parker: &Parker) {
    loop {
        let mut progressed = false;
        let mut poll_imports = false;
        {
            let mut st = shared.lock_state();
            if st.shutdown {
                fail_all_pending(&mut st);
                shared.cv.notify_all();
                return;
            }
            match next_step(&st) {
                Some(Step::Run(idx)) => {
                    if let Some(cmd) = st.pending.remove(idx) {
                        run_command(&mut st, &cmd);
                        progressed = true;
                    }
                }
                Some(Step::Fail(idx, err)) => {
                    if let Some(cmd) = st.pending.remove(idx) {
                        fail_command(&mut st, &cmd, err);
                        progressed = true;
                    }
                }
                None => {
                    poll_imports = st.pending.iter().any(|c| {
                        c.kind == CommandKind::Wait
                            && c.targets.iter().any(|t| t.has_import())
                    });
                }
            }
        }
        if progressed {
            shared.cv.notify_all();
        } else if poll_imports {
            parker.park_timeout(IMPORT_POLL_INTERVAL);
        } else {
            parker.park();
        }
    }
}

/// Finds the first actionable command in enqueue order.
fn next_step(st: &EngineState) -> Option<Step> {
    for (idx, cmd) in st.pending.iter().enumerate() {
        // In-order queues: an earlier pending command of the same queue
        // gates this one, whatever its explicit wait list says.
        if cmd.ordered
            && st
                .pending
                .iter()
                .take(idx)
                .any(|prior| prior.queue == cmd.queue)
        {
            continue;
        }

        let mut deps_ready = true;
        let mut dep_failed = false;
        for dep in &cmd.wait_list {
            match dep.state() {
                EventState::Complete => {}
                EventState::Error => {
                    dep_failed = true;
                    break;
                }
                _ => {
                    deps_ready = false;
                    break;
                }
            }
        }
        if dep_failed {
            return Some(Step::Fail(
                idx,
                SemError::invalid_operation("dependency event failed"),
            ));
        }
        if !deps_ready {
            continue;
        }

        if cmd.targets.iter().any(|t| t.is_destroyed()) {
            return Some(Step::Fail(idx, SemError::InvalidSemaphore));
        }

        match cmd.kind {
            CommandKind::Signal | CommandKind::Task => return Some(Step::Run(idx)),
            CommandKind::Wait => {
                // Conjunction over all targets, evaluated under the engine
                // lock; consumed under the same lock hold in run_command.
                if cmd.targets.iter().all(|t| t.is_signaled()) {
                    return Some(Step::Run(idx));
                }
            }
        }
    }
    None
}

fn run_command(st: &mut EngineState, cmd: &Command) {
    trace::record(
        &mut st.trace,
        TraceEvent::Dispatch {
            queue: cmd.queue,
            seq: cmd.seq,
            kind: cmd.kind,
            event: cmd.event.id(),
        },
    );
    cmd.event.mark_running();

    let result = match cmd.kind {
        CommandKind::Signal => cmd.targets.iter().try_for_each(|t| t.engine_signal()),
        CommandKind::Wait => cmd.targets.iter().try_for_each(|t| t.engine_consume()),
        CommandKind::Task => Ok(()),
    };

    match result {
        Ok(()) => {
            cmd.event.mark_complete();
            trace::record(&mut st.trace, TraceEvent::Complete { event: cmd.event.id() });
        }
        Err(err) => fail_command(st, cmd, err),
    }
}

fn fail_command(st: &mut EngineState, cmd: &Command, err: SemError) {
    trace::record(
        &mut st.trace,
        TraceEvent::Failed {
            event: cmd.event.id(),
            detail: err.to_string(),
        },
    );
    cmd.event.mark_error(err);
}

fn fail_all_pending(st: &mut EngineState) {
    while let Some(cmd) = st.pending.pop_front() {
        fail_command(
            st,
            &cmd,
            SemError::invalid_operation("context torn down with commands outstanding"),
        );
    }
}
