//! Binary semaphore synchronization for an asynchronous command engine.
//!
//! ## Scope
//! This crate implements a cross-queue synchronization primitive: a binary
//! (signaled/unsignaled) semaphore targeted by signal and wait commands
//! submitted to command queues, with explicit dependency edges between
//! commands, reference-counted object lifetime, byte-exact introspection,
//! and export/import of the signal channel through an OS-level sync fd.
//!
//! ## Key invariants
//! - A semaphore's payload flips only through command execution: signal
//!   sets 1, a consuming wait resets 0, both under the engine lock.
//! - Multi-target commands are atomic as observed by other commands: one
//!   signal leaves all its targets signaled together, one wait completes
//!   only when all its targets are signaled and consumes them together.
//! - In-order queues serialize their commands; out-of-order queues are
//!   constrained only by explicit wait-list edges and semaphore state. No
//!   implicit dependency is ever created on unnamed commands.
//! - The `Properties` query returns the creation words bit-for-bit.
//!
//! ## Command flow
//! ```text
//! Semaphore::create ─┐
//!                    ├─► CommandQueue::enqueue_{signal,wait,task} ─► Event
//! Context::new ──────┘                   │
//!                                        ▼
//!                        dispatcher (one thread per context)
//!                 ordering + wait-list + payload eligibility
//!                                        │
//!                                        ▼
//!                  payload flips, Event COMPLETE / ERROR,
//!                  exported sync fds receive signal tokens
//! ```
//!
//! ## Notable entry points
//! - [`Context`]: device identity, capability negotiation, the dispatcher.
//! - [`Semaphore`]: create/retain/release, queries, export/import.
//! - [`CommandQueue`]: signal/wait/task submission, flush/finish.
//! - [`Event`] / [`wait_all`]: completion futures and blocking waits.
//! - [`SyncFd`]: the exported handle; independent lifetime, one channel.
//!
//! ## Design trade-offs
//! One dispatcher thread per context keeps every eligibility decision and
//! payload flip under a single lock, which is what the multi-semaphore
//! wait conjunction requires anyway; queues are sequencing domains rather
//! than threads. Waits on imported semaphores poll the fd on a short
//! cadence because no in-process actor announces an external signal.

pub mod context;
pub mod error;
pub mod event;
pub mod properties;
pub mod queue;
pub mod semaphore;
pub mod sync_fd;
pub mod trace;

mod engine;

pub use context::{CapabilityRegistry, Context, DeviceId, CAP_SEMAPHORE, CAP_SYNC_FD};
pub use error::SemError;
pub use event::{wait_all, Event, EventState};
pub use properties::{
    HandleType, PropertyList, SemaphoreQuery, SemaphoreType, HANDLE_TYPE_SYNC_FD,
    PROP_DEVICE_HANDLE_LIST, PROP_EXPORT_HANDLE_TYPES, PROP_IMPORT_SYNC_FD, PROP_LIST_END,
    PROP_TYPE, TYPE_BINARY,
};
pub use queue::{CommandKind, CommandQueue, QueueMode};
pub use semaphore::Semaphore;
pub use sync_fd::{SyncFd, SYNC_FD_HANDLE_SIZE};
pub use trace::TraceEvent;
