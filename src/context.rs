//! Execution contexts and device identity.
//!
//! A [`Context`] is the ownership domain for semaphores and queues: it holds
//! the device set commands may target, the capability registry optional
//! features are negotiated against, and the dispatcher that executes
//! enqueued commands. Handles are cheap clones of one shared record; the
//! dispatcher thread is joined when the last handle drops.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::engine::{Engine, EngineShared};
use crate::trace::TraceEvent;

/// Capability name: the binary semaphore primitive itself.
pub const CAP_SEMAPHORE: &str = "semaphore";
/// Capability name: sync-fd export/import bridge.
pub const CAP_SYNC_FD: &str = "external-semaphore-sync-fd";

/// Devices get process-unique ids starting at 1; 0 would collide with the
/// property-list sentinel.
static NEXT_DEVICE_ID: AtomicU64 = AtomicU64::new(1);
static NEXT_CONTEXT_ID: AtomicU64 = AtomicU64::new(1);

/// Opaque device identity. Valid only within the context that issued it.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct DeviceId(pub u64);

/// Negotiated optional features.
///
/// Operations that depend on an optional feature check here first; an
/// absent capability yields a graceful error from the call, never a crash
/// deeper in.
#[derive(Clone, Debug, Default)]
pub struct CapabilityRegistry {
    names: BTreeSet<&'static str>,
}

impl CapabilityRegistry {
    /// Registers a capability by name. Idempotent.
    pub fn register(&mut self, name: &'static str) {
        self.names.insert(name);
    }

    /// True when `name` was negotiated.
    #[inline]
    pub fn has(&self, name: &str) -> bool {
        self.names.contains(name)
    }

    /// Negotiated names, in sorted order.
    pub fn names(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.names.iter().copied()
    }
}

struct ContextInner {
    id: u64,
    devices: Vec<DeviceId>,
    capabilities: CapabilityRegistry,
    /// Owns the dispatcher thread; dropping it fails whatever is still
    /// pending and joins the thread.
    _engine: Engine,
    engine_shared: Arc<EngineShared>,
}

/// Shared handle to one execution context.
#[derive(Clone)]
pub struct Context {
    inner: Arc<ContextInner>,
}

impl Context {
    /// Creates a context with `device_count` fresh devices and the full
    /// default capability set.
    pub fn new(device_count: usize) -> Self {
        let mut caps = CapabilityRegistry::default();
        caps.register(CAP_SEMAPHORE);
        caps.register(CAP_SYNC_FD);
        Self::with_capabilities(device_count, caps)
    }

    /// Creates a context with an explicit capability set. Used to model
    /// platforms where the semaphore primitive or the sync-fd bridge is
    /// absent.
    pub fn with_capabilities(device_count: usize, capabilities: CapabilityRegistry) -> Self {
        let devices = (0..device_count)
            .map(|_| DeviceId(NEXT_DEVICE_ID.fetch_add(1, Ordering::Relaxed)))
            .collect();
        let engine = Engine::start();
        let engine_shared = Arc::clone(engine.shared());
        Self {
            inner: Arc::new(ContextInner {
                id: NEXT_CONTEXT_ID.fetch_add(1, Ordering::Relaxed),
                devices,
                capabilities,
                _engine: engine,
                engine_shared,
            }),
        }
    }

    /// Process-unique context id. This is the value the `Context` query on
    /// a semaphore returns.
    #[inline]
    pub fn id(&self) -> u64 {
        self.inner.id
    }

    /// Devices owned by this context, in creation order.
    #[inline]
    pub fn devices(&self) -> &[DeviceId] {
        &self.inner.devices
    }

    /// True when `device` belongs to this context.
    #[inline]
    pub fn contains_device(&self, device: DeviceId) -> bool {
        self.inner.devices.contains(&device)
    }

    /// True when the named capability was negotiated at creation.
    #[inline]
    pub fn has_capability(&self, name: &str) -> bool {
        self.inner.capabilities.has(name)
    }

    /// Starts recording engine transitions. Idempotent; an existing trace
    /// buffer is kept.
    pub fn enable_trace(&self) {
        let mut st = self.inner.engine_shared.lock_state();
        if st.trace.is_none() {
            st.trace = Some(Vec::new());
        }
    }

    /// Takes the recorded trace, leaving recording enabled.
    pub fn take_trace(&self) -> Vec<TraceEvent> {
        let mut st = self.inner.engine_shared.lock_state();
        match st.trace.as_mut() {
            Some(buf) => std::mem::take(buf),
            None => Vec::new(),
        }
    }

    /// True when two handles refer to the same context.
    #[inline]
    pub fn same_context(&self, other: &Context) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    pub(crate) fn engine_shared(&self) -> &Arc<EngineShared> {
        &self.inner.engine_shared
    }
}

impl std::fmt::Debug for Context {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Context")
            .field("id", &self.inner.id)
            .field("devices", &self.inner.devices)
            .finish()
    }
}
