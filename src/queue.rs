//! Command queues: ordered and unordered sequencing domains.
//!
//! A queue is a submission surface, not a thread. All queues of a context
//! feed one dispatcher; what a queue contributes is identity (for `finish`)
//! and its ordering mode:
//!
//! - **in-order**: command *i+1* cannot start before command *i* completes,
//!   independent of explicit wait lists;
//! - **out-of-order**: only explicit wait-list edges and target-semaphore
//!   state constrain scheduling. Nothing here creates implicit edges — an
//!   empty-wait-list signal runs ahead of unrelated stalled work.
//!
//! Submission never blocks. Once enqueued a command runs to completion or
//! fails; there is no cancellation and no timeout.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

use crate::context::{Context, DeviceId};
use crate::engine::Command;
use crate::error::SemError;
use crate::event::Event;
use crate::semaphore::Semaphore;

static NEXT_QUEUE_ID: AtomicU64 = AtomicU64::new(1);

/// Queue sequencing mode.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum QueueMode {
    InOrder,
    OutOfOrder,
}

/// Command discriminant; also the vocabulary of trace events.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum CommandKind {
    Signal,
    Wait,
    Task,
}

/// One sequencing domain on a context device.
pub struct CommandQueue {
    context: Context,
    device: DeviceId,
    id: u64,
    mode: QueueMode,
    next_seq: AtomicU64,
}

impl CommandQueue {
    /// Creates a queue on `device`, which must belong to `context`.
    pub fn new(context: &Context, device: DeviceId, mode: QueueMode) -> Result<Self, SemError> {
        if !context.contains_device(device) {
            return Err(SemError::InvalidDevice);
        }
        Ok(Self {
            context: context.clone(),
            device,
            id: NEXT_QUEUE_ID.fetch_add(1, Ordering::Relaxed),
            mode,
            next_seq: AtomicU64::new(0),
        })
    }

    #[inline]
    pub fn mode(&self) -> QueueMode {
        self.mode
    }

    #[inline]
    pub fn device(&self) -> DeviceId {
        self.device
    }

    #[inline]
    pub fn context(&self) -> &Context {
        &self.context
    }

    /// Enqueues a signal command targeting `semaphores`.
    ///
    /// Eligible once every `wait_list` event completes (plus the in-order
    /// predecessor rule). Running sets every target's payload to 1 in one
    /// engine-lock hold, so a waiter observes all targets signaled or none.
    pub fn enqueue_signal(
        &self,
        semaphores: &[&Semaphore],
        wait_list: &[Event],
    ) -> Result<Event, SemError> {
        self.enqueue(CommandKind::Signal, semaphores, wait_list)
    }

    /// Enqueues a wait command targeting `semaphores`.
    ///
    /// Eligible once every target's payload is 1 — a conjunction over all
    /// targets, never per-semaphore partial completion — and the wait list
    /// and ordering allow it. Running consumes every target's signal.
    pub fn enqueue_wait(
        &self,
        semaphores: &[&Semaphore],
        wait_list: &[Event],
    ) -> Result<Event, SemError> {
        self.enqueue(CommandKind::Wait, semaphores, wait_list)
    }

    /// Enqueues a generic work command constrained only by `wait_list` and
    /// queue ordering. Stands in for kernel execution in dependency chains.
    pub fn enqueue_task(&self, wait_list: &[Event]) -> Result<Event, SemError> {
        self.submit(CommandKind::Task, Vec::new(), wait_list)
    }

    /// Makes submitted commands visible to the dispatcher without blocking
    /// for their completion.
    pub fn flush(&self) -> Result<(), SemError> {
        self.context.engine_shared().flush()
    }

    /// Blocks until every command enqueued on this queue has reached
    /// `Complete` or `Error`.
    pub fn finish(&self) -> Result<(), SemError> {
        self.context.engine_shared().finish(self.id)
    }

    fn enqueue(
        &self,
        kind: CommandKind,
        semaphores: &[&Semaphore],
        wait_list: &[Event],
    ) -> Result<Event, SemError> {
        if semaphores.is_empty() {
            return Err(SemError::invalid_operation(
                "signal/wait requires at least one target semaphore",
            ));
        }
        for sem in semaphores {
            if sem.inner().is_destroyed() {
                return Err(SemError::InvalidSemaphore);
            }
            if !sem.context().same_context(&self.context) {
                return Err(SemError::InvalidSemaphore);
            }
            // A device-restricted semaphore is only usable from queues on a
            // listed device.
            if !sem.devices().is_empty() && !sem.devices().contains(&self.device) {
                return Err(SemError::InvalidDevice);
            }
            // An imported semaphore's signal source is the external channel.
            if kind == CommandKind::Signal && sem.inner().has_import() {
                return Err(SemError::invalid_operation(
                    "imported semaphores are signaled by their exporter",
                ));
            }
        }
        let targets = semaphores
            .iter()
            .map(|s| std::sync::Arc::clone(s.inner()))
            .collect();
        self.submit(kind, targets, wait_list)
    }

    fn submit(
        &self,
        kind: CommandKind,
        targets: Vec<std::sync::Arc<crate::semaphore::SemaphoreInner>>,
        wait_list: &[Event],
    ) -> Result<Event, SemError> {
        let shared = self.context.engine_shared();
        // A dependency on a foreign context's event would never wake this
        // context's dispatcher when it completes.
        for dep in wait_list {
            if !std::sync::Arc::ptr_eq(dep.engine(), shared) {
                return Err(SemError::invalid_operation(
                    "wait-list event belongs to a different context",
                ));
            }
        }
        let event = Event::new_command(std::sync::Arc::clone(shared));
        shared.enqueue(
            Command {
                kind,
                queue: self.id,
                ordered: self.mode == QueueMode::InOrder,
                seq: 0, // assigned under the engine lock
                targets,
                wait_list: wait_list.to_vec(),
                event: event.clone(),
            },
            &self.next_seq,
        )?;
        Ok(event)
    }
}

impl std::fmt::Debug for CommandQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandQueue")
            .field("id", &self.id)
            .field("device", &self.device)
            .field("mode", &self.mode)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::EventState;
    use crate::properties::{PROP_LIST_END, PROP_TYPE, TYPE_BINARY};
    use std::time::Duration;

    fn binary_sem(ctx: &Context) -> Semaphore {
        Semaphore::create(ctx, &[PROP_TYPE, TYPE_BINARY, PROP_LIST_END]).unwrap()
    }

    fn queue(ctx: &Context, mode: QueueMode) -> CommandQueue {
        CommandQueue::new(ctx, ctx.devices()[0], mode).unwrap()
    }

    #[test]
    fn queue_device_must_belong_to_context() {
        let ctx = Context::new(1);
        let other = Context::new(1);
        assert_eq!(
            CommandQueue::new(&ctx, other.devices()[0], QueueMode::InOrder).unwrap_err(),
            SemError::InvalidDevice
        );
    }

    #[test]
    fn empty_target_list_is_rejected() {
        let ctx = Context::new(1);
        let q = queue(&ctx, QueueMode::OutOfOrder);
        assert!(q.enqueue_signal(&[], &[]).is_err());
        assert!(q.enqueue_wait(&[], &[]).is_err());
    }

    #[test]
    fn foreign_context_semaphore_is_rejected() {
        let ctx = Context::new(1);
        let other = Context::new(1);
        let q = queue(&ctx, QueueMode::OutOfOrder);
        let sem = binary_sem(&other);
        assert_eq!(
            q.enqueue_signal(&[&sem], &[]).unwrap_err(),
            SemError::InvalidSemaphore
        );
    }

    #[test]
    fn released_semaphore_is_rejected_at_enqueue() {
        let ctx = Context::new(1);
        let q = queue(&ctx, QueueMode::OutOfOrder);
        let sem = binary_sem(&ctx);
        sem.release().unwrap();
        assert_eq!(
            q.enqueue_signal(&[&sem], &[]).unwrap_err(),
            SemError::InvalidSemaphore
        );
    }

    #[test]
    fn in_order_queue_gates_on_prior_commands() {
        let ctx = Context::new(1);
        let q = queue(&ctx, QueueMode::InOrder);
        let sem = binary_sem(&ctx);

        let trigger = Event::user(&ctx);
        let task = q.enqueue_task(&[trigger.clone()]).unwrap();
        let signal = q.enqueue_signal(&[&sem], &[]).unwrap();
        q.flush().unwrap();

        // The signal has no explicit dependency, but the queue is in-order:
        // it must sit behind the gated task.
        std::thread::sleep(Duration::from_millis(20));
        assert!(!signal.state().is_terminal());
        assert!(!task.state().is_terminal());

        trigger.set_complete().unwrap();
        q.finish().unwrap();
        assert_eq!(task.state(), EventState::Complete);
        assert_eq!(signal.state(), EventState::Complete);
    }

    #[test]
    fn out_of_order_queue_runs_independent_commands_ahead() {
        let ctx = Context::new(1);
        let q = queue(&ctx, QueueMode::OutOfOrder);
        let sem = binary_sem(&ctx);

        let trigger = Event::user(&ctx);
        let task = q.enqueue_task(&[trigger.clone()]).unwrap();
        let signal = q.enqueue_signal(&[&sem], &[]).unwrap();

        signal.wait().unwrap();
        assert!(!task.state().is_terminal());

        trigger.set_complete().unwrap();
        task.wait().unwrap();
    }

    #[test]
    fn failed_dependency_fails_the_command() {
        let ctx = Context::new(1);
        let q = queue(&ctx, QueueMode::OutOfOrder);
        let sem = binary_sem(&ctx);

        let trigger = Event::user(&ctx);
        let signal = q
            .enqueue_signal(&[&sem], &[trigger.clone()])
            .unwrap();
        trigger
            .set_error(SemError::invalid_operation("external failure"))
            .unwrap();

        assert!(signal.wait().is_err());
        assert_eq!(signal.state(), EventState::Error);
        // The payload was never flipped.
        assert_eq!(sem.payload().unwrap(), 0);
    }

    #[test]
    fn semaphore_released_to_zero_fails_pending_commands() {
        let ctx = Context::new(1);
        let q = queue(&ctx, QueueMode::OutOfOrder);
        let sem = binary_sem(&ctx);

        let trigger = Event::user(&ctx);
        let signal = q
            .enqueue_signal(&[&sem], &[trigger.clone()])
            .unwrap();
        sem.release().unwrap();
        trigger.set_complete().unwrap();

        assert_eq!(signal.wait().unwrap_err(), SemError::InvalidSemaphore);
    }

    #[test]
    fn finish_drains_only_this_queue() {
        let ctx = Context::new(1);
        let q1 = queue(&ctx, QueueMode::OutOfOrder);
        let q2 = queue(&ctx, QueueMode::OutOfOrder);
        let sem = binary_sem(&ctx);

        let trigger = Event::user(&ctx);
        let stalled = q2.enqueue_task(&[trigger.clone()]).unwrap();
        let signal = q1.enqueue_signal(&[&sem], &[]).unwrap();

        // q1 drains even though q2 still holds a stalled task.
        q1.finish().unwrap();
        assert_eq!(signal.state(), EventState::Complete);
        assert!(!stalled.state().is_terminal());

        trigger.set_complete().unwrap();
        q2.finish().unwrap();
    }

    #[test]
    fn imported_semaphore_cannot_be_signaled_locally() {
        use crate::properties::{HandleType, HANDLE_TYPE_SYNC_FD, PROP_EXPORT_HANDLE_TYPES};
        let ctx = Context::new(1);
        let dev = ctx.devices()[0];
        let exporter = Semaphore::create(
            &ctx,
            &[
                PROP_TYPE,
                TYPE_BINARY,
                PROP_EXPORT_HANDLE_TYPES,
                HANDLE_TYPE_SYNC_FD,
                PROP_LIST_END,
                PROP_LIST_END,
            ],
        )
        .unwrap();
        let handle = exporter.export_handle(dev, HandleType::SyncFd).unwrap();
        let imported = Semaphore::import(&ctx, HandleType::SyncFd, handle).unwrap();

        let q = queue(&ctx, QueueMode::OutOfOrder);
        assert!(q.enqueue_signal(&[&imported], &[]).is_err());
        assert!(q.enqueue_wait(&[&imported], &[]).is_ok());

        q.enqueue_signal(&[&exporter], &[]).unwrap();
        q.finish().unwrap();
    }

    #[test]
    fn device_restricted_semaphore_rejects_other_queues() {
        use crate::properties::PROP_DEVICE_HANDLE_LIST;
        let ctx = Context::new(2);
        let dev_a = ctx.devices()[0];
        let dev_b = ctx.devices()[1];
        let words = [
            PROP_TYPE,
            TYPE_BINARY,
            PROP_DEVICE_HANDLE_LIST,
            dev_a.0,
            PROP_LIST_END,
            PROP_LIST_END,
        ];
        let sem = Semaphore::create(&ctx, &words).unwrap();

        let q_a = CommandQueue::new(&ctx, dev_a, QueueMode::OutOfOrder).unwrap();
        let q_b = CommandQueue::new(&ctx, dev_b, QueueMode::OutOfOrder).unwrap();

        assert!(q_a.enqueue_signal(&[&sem], &[]).is_ok());
        assert_eq!(
            q_b.enqueue_wait(&[&sem], &[]).unwrap_err(),
            SemError::InvalidDevice
        );
        q_a.finish().unwrap();
    }
}
