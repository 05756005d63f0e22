//! The semaphore object: typed state, refcounted lifetime, introspection.
//!
//! A [`Semaphore`] handle pairs the owning [`Context`] with a shared record.
//! The record's lifetime follows the explicit reference count, not the Rust
//! handle count: `release` to zero invalidates the object for every holder,
//! and later operations report `InvalidSemaphore`. Handles stay safe to
//! hold after that point; they just stop working.
//!
//! # Payload discipline
//!
//! `payload` is a single atomic word flipped only by the engine's command
//! execution (signal sets 1, a consuming wait resets 0), always under the
//! engine lock, so a multi-semaphore wait observes all-or-nothing. A
//! semaphore imported from a sync fd has no local signal source; its
//! signaled state is the fd's readability and a consuming wait drains one
//! token from the fd instead of flipping the word.
//!
//! Signaling an already-signaled binary semaphore is last-write-wins: the
//! payload stays 1 and no error is reported. Dependency chains that need
//! strict alternation must encode it with wait-list edges.

use std::os::fd::{AsRawFd, IntoRawFd, OwnedFd};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use crate::context::{Context, DeviceId, CAP_SEMAPHORE, CAP_SYNC_FD};
use crate::error::SemError;
use crate::properties::{
    self, HandleType, PropertyList, SemaphoreQuery, SemaphoreType, PROP_IMPORT_SYNC_FD,
    PROP_LIST_END, PROP_TYPE,
};
use crate::sync_fd::{self, SyncFd};

/// Shared semaphore record. Engine commands hold this directly so a pending
/// command never keeps the whole context alive.
pub(crate) struct SemaphoreInner {
    context_id: u64,
    sem_type: SemaphoreType,
    /// Resolved device restriction; empty means all devices in the context.
    devices: Vec<DeviceId>,
    export_types: Vec<HandleType>,
    /// Verbatim creation words for the `Properties` query.
    properties: PropertyList,
    /// 0 unsignaled, 1 signaled.
    payload: AtomicU64,
    /// Explicit reference count; 0 means released.
    refcount: AtomicU32,
    /// Write ends of exported bridge pipes; every signal writes a token to
    /// each.
    exports: Mutex<Vec<OwnedFd>>,
    /// Read end of an imported bridge pipe.
    import: Option<OwnedFd>,
}

impl SemaphoreInner {
    #[inline]
    pub(crate) fn is_destroyed(&self) -> bool {
        self.refcount.load(Ordering::Acquire) == 0
    }

    #[inline]
    pub(crate) fn has_import(&self) -> bool {
        self.import.is_some()
    }

    /// Signaled state as the wait conjunction sees it. Called under the
    /// engine lock.
    pub(crate) fn is_signaled(&self) -> bool {
        if self.payload.load(Ordering::Acquire) == 1 {
            return true;
        }
        match &self.import {
            Some(fd) => sync_fd::poll_readable(fd.as_raw_fd()),
            None => false,
        }
    }

    /// Commits a signal: payload to 1, one token into every exported
    /// channel. Called under the engine lock.
    pub(crate) fn engine_signal(&self) -> Result<(), SemError> {
        let exports = self.exports.lock().expect("semaphore exports mutex poisoned");
        self.payload.store(1, Ordering::Release);
        for fd in exports.iter() {
            sync_fd::write_token(fd.as_raw_fd())?;
        }
        Ok(())
    }

    /// Consumes one signal: local payload first, imported channel second.
    /// Called under the engine lock, after `is_signaled` held for every
    /// target of the wait.
    pub(crate) fn engine_consume(&self) -> Result<(), SemError> {
        if self.payload.swap(0, Ordering::AcqRel) == 1 {
            return Ok(());
        }
        match &self.import {
            Some(fd) => sync_fd::read_token(fd.as_raw_fd()),
            None => Err(SemError::invalid_operation(
                "wait consumed a semaphore that was never signaled",
            )),
        }
    }

    fn payload_value(&self) -> u64 {
        u64::from(self.is_signaled())
    }
}

/// Handle to a binary semaphore.
///
/// Cloning copies the handle, not the object: all clones share one payload,
/// one property snapshot, and one reference count.
#[derive(Clone)]
pub struct Semaphore {
    context: Context,
    inner: Arc<SemaphoreInner>,
}

impl Semaphore {
    /// Creates a semaphore from a zero-terminated property list.
    ///
    /// Validates the list (see [`crate::properties`]), resolves device
    /// restrictions against `context`, and snapshots the words bit-for-bit
    /// for the `Properties` query. The new object starts unsignaled with a
    /// reference count of 1.
    pub fn create(context: &Context, property_words: &[u64]) -> Result<Self, SemError> {
        if !context.has_capability(CAP_SEMAPHORE) {
            return Err(SemError::invalid_operation(
                "semaphore capability not negotiated on this context",
            ));
        }
        let config = properties::parse(property_words)?;

        let mut devices = Vec::with_capacity(config.device_words.len());
        for word in &config.device_words {
            let device = DeviceId(*word);
            if !context.contains_device(device) {
                return Err(SemError::InvalidDevice);
            }
            devices.push(device);
        }

        if (!config.export_types.is_empty() || config.import_fd.is_some())
            && !context.has_capability(CAP_SYNC_FD)
        {
            return Err(SemError::UnsupportedHandleType);
        }
        let import = match config.import_fd {
            Some(word) => Some(SyncFd::adopt_raw(word)?.into_owned()),
            None => None,
        };

        Ok(Self {
            context: context.clone(),
            inner: Arc::new(SemaphoreInner {
                context_id: context.id(),
                sem_type: config.sem_type,
                devices,
                export_types: config.export_types,
                properties: PropertyList::from_words(property_words),
                payload: AtomicU64::new(0),
                refcount: AtomicU32::new(1),
                exports: Mutex::new(Vec::new()),
                import,
            }),
        })
    }

    /// Constructs a semaphore coupled to a previously exported handle.
    ///
    /// Equivalent to [`Semaphore::create`] with an import property pair;
    /// the recorded property snapshot is exactly that list.
    pub fn import(
        context: &Context,
        handle_type: HandleType,
        handle: SyncFd,
    ) -> Result<Self, SemError> {
        let HandleType::SyncFd = handle_type;
        let words = [
            PROP_TYPE,
            SemaphoreType::Binary.as_word(),
            PROP_IMPORT_SYNC_FD,
            handle.raw() as u64,
            PROP_LIST_END,
        ];
        // `create` adopts the fd word; hand over ownership without closing.
        let _raw = handle.into_owned().into_raw_fd();
        Self::create(context, &words)
    }

    /// Increments the reference count.
    pub fn retain(&self) -> Result<(), SemError> {
        let mut current = self.inner.refcount.load(Ordering::Acquire);
        loop {
            if current == 0 {
                return Err(SemError::InvalidSemaphore);
            }
            match self.inner.refcount.compare_exchange_weak(
                current,
                current + 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return Ok(()),
                Err(observed) => current = observed,
            }
        }
    }

    /// Decrements the reference count; at zero the object is destroyed and
    /// every further use reports `InvalidSemaphore`.
    pub fn release(&self) -> Result<(), SemError> {
        let mut current = self.inner.refcount.load(Ordering::Acquire);
        loop {
            if current == 0 {
                return Err(SemError::InvalidSemaphore);
            }
            match self.inner.refcount.compare_exchange_weak(
                current,
                current - 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => break,
                Err(observed) => current = observed,
            }
        }
        if current == 1 {
            // Destroyed: close exported write ends so the bridge stops
            // coupling this object to handles that outlive it.
            self.inner
                .exports
                .lock()
                .expect("semaphore exports mutex poisoned")
                .clear();
        }
        Ok(())
    }

    /// Current reference count.
    pub fn reference_count(&self) -> u32 {
        self.inner.refcount.load(Ordering::Acquire)
    }

    /// Current payload: 1 when signaled, 0 otherwise.
    pub fn payload(&self) -> Result<u64, SemError> {
        self.check_alive()?;
        Ok(self.inner.payload_value())
    }

    /// Semaphore kind. Only [`SemaphoreType::Binary`] exists.
    pub fn semaphore_type(&self) -> SemaphoreType {
        self.inner.sem_type
    }

    /// Owning context handle.
    pub fn context(&self) -> &Context {
        &self.context
    }

    /// Device restriction list; empty means every device in the context.
    pub fn devices(&self) -> &[DeviceId] {
        &self.inner.devices
    }

    /// Verbatim creation properties.
    pub fn properties(&self) -> &PropertyList {
        &self.inner.properties
    }

    /// Natural byte size of a query parameter's value.
    pub fn query_size(&self, query: SemaphoreQuery) -> Result<usize, SemError> {
        self.check_alive()?;
        Ok(match query {
            SemaphoreQuery::Type | SemaphoreQuery::Context | SemaphoreQuery::Payload => 8,
            SemaphoreQuery::ReferenceCount => 4,
            SemaphoreQuery::DeviceHandleList => {
                self.inner.devices.len() * std::mem::size_of::<u64>()
            }
            SemaphoreQuery::Properties => self.inner.properties.byte_len(),
        })
    }

    /// Writes a query parameter's value into `buf`.
    ///
    /// `buf` must be exactly the parameter's natural size; anything else is
    /// a `SizeMismatch`. Array parameters (`DeviceHandleList`,
    /// `Properties`) come back byte-for-byte as supplied at creation.
    pub fn query_into(&self, query: SemaphoreQuery, buf: &mut [u8]) -> Result<usize, SemError> {
        let bytes = self.query_bytes(query)?;
        if buf.len() != bytes.len() {
            return Err(SemError::SizeMismatch {
                expected: bytes.len(),
                got: buf.len(),
            });
        }
        buf.copy_from_slice(&bytes);
        Ok(bytes.len())
    }

    fn query_bytes(&self, query: SemaphoreQuery) -> Result<Vec<u8>, SemError> {
        self.check_alive()?;
        Ok(match query {
            SemaphoreQuery::Type => self.inner.sem_type.as_word().to_le_bytes().to_vec(),
            SemaphoreQuery::Context => self.inner.context_id.to_le_bytes().to_vec(),
            SemaphoreQuery::ReferenceCount => self.reference_count().to_le_bytes().to_vec(),
            SemaphoreQuery::DeviceHandleList => {
                let mut out = Vec::with_capacity(self.inner.devices.len() * 8);
                for d in &self.inner.devices {
                    out.extend_from_slice(&d.0.to_le_bytes());
                }
                out
            }
            SemaphoreQuery::Properties => self.inner.properties.to_bytes(),
            SemaphoreQuery::Payload => self.inner.payload_value().to_le_bytes().to_vec(),
        })
    }

    /// Exports the signal channel as a sync fd.
    ///
    /// Valid only when the semaphore was created with the handle type in
    /// its export list and `device` is one the semaphore is valid on. The
    /// returned handle's lifetime is independent of this object. Its
    /// signaled state becomes true with the semaphore's next payload
    /// transition to 1 — or immediately, if the semaphore is already
    /// signaled at export.
    pub fn export_handle(
        &self,
        device: DeviceId,
        handle_type: HandleType,
    ) -> Result<SyncFd, SemError> {
        self.check_alive()?;
        if !self.inner.export_types.contains(&handle_type) {
            return Err(SemError::UnsupportedHandleType);
        }
        if !self.context.contains_device(device)
            || (!self.inner.devices.is_empty() && !self.inner.devices.contains(&device))
        {
            return Err(SemError::InvalidDevice);
        }

        let (read_end, write_end) = sync_fd::pipe_pair()?;
        // Registration and the already-signaled check are atomic with
        // respect to a concurrent signal, which takes the same exports lock.
        let mut exports = self
            .inner
            .exports
            .lock()
            .expect("semaphore exports mutex poisoned");
        if self.inner.payload.load(Ordering::Acquire) == 1 {
            sync_fd::write_token(write_end.as_raw_fd())?;
        }
        exports.push(write_end);
        Ok(SyncFd::from_owned(read_end))
    }

    pub(crate) fn inner(&self) -> &Arc<SemaphoreInner> {
        &self.inner
    }

    fn check_alive(&self) -> Result<(), SemError> {
        if self.inner.is_destroyed() {
            return Err(SemError::InvalidSemaphore);
        }
        Ok(())
    }
}

impl std::fmt::Debug for Semaphore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Semaphore")
            .field("type", &self.inner.sem_type)
            .field("context", &self.inner.context_id)
            .field("refcount", &self.reference_count())
            .field("signaled", &self.inner.is_signaled())
            .finish()
    }
}
