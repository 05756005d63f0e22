//! Command-completion events.
//!
//! An [`Event`] is a shared future for one command: a five-state machine
//! that only moves forward (`Queued -> Submitted -> Running -> Complete`),
//! except `Error`, which is terminal from any state. Any number of holders
//! may observe the same event; the underlying record lives as long as the
//! longest holder.
//!
//! Two flavors exist:
//! - **command events**, produced by every enqueue and driven by the
//!   dispatcher;
//! - **user events**, created in the `Submitted` state and completed (or
//!   failed) explicitly by the caller. They exist to gate enqueued work on
//!   triggers the engine does not control.
//!
//! State reads are lock-free atomic loads. Transitions and blocking waits go
//! through the owning engine's lock so waiters, `finish`, and the dispatcher
//! agree on one ordering.

use std::sync::atomic::{AtomicU8, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use crate::context::Context;
use crate::engine::EngineShared;
use crate::error::SemError;
use crate::trace::{self, TraceEvent};

static NEXT_EVENT_ID: AtomicU64 = AtomicU64::new(1);

/// Completion state. Monotonically increasing except `Error`, which is
/// terminal.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum EventState {
    Queued = 0,
    Submitted = 1,
    Running = 2,
    Complete = 3,
    Error = 4,
}

impl EventState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => Self::Queued,
            1 => Self::Submitted,
            2 => Self::Running,
            3 => Self::Complete,
            _ => Self::Error,
        }
    }

    /// True for `Complete` and `Error`: no further transitions happen.
    #[inline]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Complete | Self::Error)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum EventKind {
    Command,
    User,
}

struct EventCore {
    id: u64,
    kind: EventKind,
    state: AtomicU8,
    /// Set before the state is stored as `Error`; read by waiters afterward.
    error: Mutex<Option<SemError>>,
    engine: Arc<EngineShared>,
}

/// Shared handle to one command's completion state.
///
/// Cloning is an atomic increment; all clones observe the same record.
#[derive(Clone)]
pub struct Event {
    core: Arc<EventCore>,
}

impl Event {
    pub(crate) fn new_command(engine: Arc<EngineShared>) -> Self {
        Self::new(engine, EventKind::Command, EventState::Queued)
    }

    /// Creates a user event on `context`, in the `Submitted` state.
    ///
    /// The caller owns its completion: enqueued commands listing this event
    /// in their wait list stay pending until [`Event::set_complete`] (or
    /// [`Event::set_error`]) is called.
    pub fn user(context: &Context) -> Self {
        Self::new(
            Arc::clone(context.engine_shared()),
            EventKind::User,
            EventState::Submitted,
        )
    }

    fn new(engine: Arc<EngineShared>, kind: EventKind, state: EventState) -> Self {
        Self {
            core: Arc::new(EventCore {
                id: NEXT_EVENT_ID.fetch_add(1, Ordering::Relaxed),
                kind,
                state: AtomicU8::new(state as u8),
                error: Mutex::new(None),
                engine,
            }),
        }
    }

    /// Stable id, unique for the process lifetime. Appears in traces.
    #[inline]
    pub fn id(&self) -> u64 {
        self.core.id
    }

    /// Current state snapshot. Lock-free; may be stale by the time the
    /// caller acts on it, but never moves backward.
    #[inline]
    pub fn state(&self) -> EventState {
        EventState::from_u8(self.core.state.load(Ordering::Acquire))
    }

    /// Blocks the calling thread until this event reaches `Complete` or
    /// `Error`. Surfaces the stored command error on `Error`.
    ///
    /// There is no timeout; callers needing bounded waits poll
    /// [`Event::state`] instead.
    pub fn wait(&self) -> Result<(), SemError> {
        let mut st = self.core.engine.lock_state();
        loop {
            match self.state() {
                EventState::Complete => return Ok(()),
                EventState::Error => return Err(self.stored_error()),
                _ => {
                    if st.shutdown {
                        return Err(SemError::invalid_operation(
                            "context torn down while waiting on an event",
                        ));
                    }
                    st = self.core.engine.wait_on(st);
                }
            }
        }
    }

    /// Completes a user event. Fails with `InvalidOperation` on command
    /// events and on user events that already reached a terminal state.
    pub fn set_complete(&self) -> Result<(), SemError> {
        self.finish_user(None)
    }

    /// Fails a user event with `err`; waiters on dependent commands will
    /// observe their own events move to `Error`.
    pub fn set_error(&self, err: SemError) -> Result<(), SemError> {
        self.finish_user(Some(err))
    }

    fn finish_user(&self, err: Option<SemError>) -> Result<(), SemError> {
        if self.core.kind != EventKind::User {
            return Err(SemError::invalid_operation(
                "only user events can be completed by the caller",
            ));
        }
        {
            let mut st = self.core.engine.lock_state();
            if self.state().is_terminal() {
                return Err(SemError::invalid_operation(
                    "user event already reached a terminal state",
                ));
            }
            match err {
                None => {
                    self.core.state.store(EventState::Complete as u8, Ordering::Release);
                    trace::record(&mut st.trace, TraceEvent::UserComplete { event: self.id() });
                }
                Some(err) => {
                    self.store_error(err);
                    self.core.state.store(EventState::Error as u8, Ordering::Release);
                    trace::record(&mut st.trace, TraceEvent::UserError { event: self.id() });
                }
            }
        }
        // Dependent commands may have become eligible.
        self.core.engine.wake_all();
        Ok(())
    }

    // ---- dispatcher-side transitions (engine lock held) ----

    pub(crate) fn mark_running(&self) {
        self.core.state.store(EventState::Submitted as u8, Ordering::Release);
        self.core.state.store(EventState::Running as u8, Ordering::Release);
    }

    pub(crate) fn mark_complete(&self) {
        self.core.state.store(EventState::Complete as u8, Ordering::Release);
    }

    pub(crate) fn mark_error(&self, err: SemError) {
        self.store_error(err);
        self.core.state.store(EventState::Error as u8, Ordering::Release);
    }

    fn store_error(&self, err: SemError) {
        let mut slot = self
            .core
            .error
            .lock()
            .expect("event error mutex poisoned");
        slot.get_or_insert(err);
    }

    pub(crate) fn engine(&self) -> &Arc<EngineShared> {
        &self.core.engine
    }

    fn stored_error(&self) -> SemError {
        let slot = self
            .core
            .error
            .lock()
            .expect("event error mutex poisoned");
        slot.clone()
            .unwrap_or_else(|| SemError::invalid_operation("command failed"))
    }
}

impl std::fmt::Debug for Event {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Event")
            .field("id", &self.core.id)
            .field("kind", &self.core.kind)
            .field("state", &self.state())
            .finish()
    }
}

/// Waits for the events in order, returning the first `Error` observed.
/// Events after the failed one may still be in flight at that point.
pub fn wait_all(events: &[Event]) -> Result<(), SemError> {
    for ev in events {
        ev.wait()?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::Context;

    #[test]
    fn user_event_starts_submitted() {
        let ctx = Context::new(1);
        let ev = Event::user(&ctx);
        assert_eq!(ev.state(), EventState::Submitted);
        assert!(!ev.state().is_terminal());
    }

    #[test]
    fn user_event_completes_once() {
        let ctx = Context::new(1);
        let ev = Event::user(&ctx);
        ev.set_complete().unwrap();
        assert_eq!(ev.state(), EventState::Complete);
        assert!(ev.set_complete().is_err());
    }

    #[test]
    fn user_event_error_is_terminal_and_stored() {
        let ctx = Context::new(1);
        let ev = Event::user(&ctx);
        ev.set_error(SemError::invalid_operation("external failure"))
            .unwrap();
        assert_eq!(ev.state(), EventState::Error);
        assert_eq!(
            ev.wait().unwrap_err(),
            SemError::invalid_operation("external failure")
        );
    }

    #[test]
    fn wait_returns_after_external_completion() {
        let ctx = Context::new(1);
        let ev = Event::user(&ctx);
        let waiter = ev.clone();
        let handle = std::thread::spawn(move || waiter.wait());
        std::thread::sleep(std::time::Duration::from_millis(10));
        ev.set_complete().unwrap();
        handle.join().unwrap().unwrap();
    }

    #[test]
    fn clones_share_one_record() {
        let ctx = Context::new(1);
        let ev = Event::user(&ctx);
        let other = ev.clone();
        assert_eq!(ev.id(), other.id());
        ev.set_complete().unwrap();
        assert_eq!(other.state(), EventState::Complete);
    }

    #[test]
    fn wait_all_returns_first_error_without_blocking_on_the_rest() {
        let ctx = Context::new(1);
        let failed = Event::user(&ctx);
        failed
            .set_error(SemError::invalid_operation("external failure"))
            .unwrap();
        // Never completed; wait_all must not block on it.
        let pending = Event::user(&ctx);

        let err = wait_all(&[failed, pending.clone()]).unwrap_err();
        assert_eq!(err, SemError::invalid_operation("external failure"));
        assert!(!pending.state().is_terminal());
    }

    #[test]
    fn ids_are_unique() {
        let ctx = Context::new(1);
        let a = Event::user(&ctx);
        let b = Event::user(&ctx);
        assert_ne!(a.id(), b.id());
    }
}
