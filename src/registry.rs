//! Registry of per-thread callback event buffers
//!
//! The registry owns every thread's buffer. A thread reaches its buffer
//! through a thread-local [`ThreadBufferHandle`]; when the thread exits the
//! handle is dropped and the buffer moves to the deactivated list, so its
//! events can still be collected after the thread is gone.
//!
//! Lock order is registry state first, then an individual buffer. The
//! owning thread only ever takes its own buffer's lock while recording, so
//! that lock is uncontended except while a collection is swapping it out.

use crate::thread_buffer::{CallbackEventBuffer, EventLimits};
use fnv::FnvHashMap;
use std::cell::RefCell;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

/// A thread's buffer, shared between its owner and the registry
pub type SharedThreadBuffer = Arc<Mutex<CallbackEventBuffer>>;

static NEXT_REGISTRY_ID: AtomicU64 = AtomicU64::new(1);

thread_local! {
    static THREAD_HANDLES: RefCell<FnvHashMap<u64, ThreadBufferHandle>> =
        RefCell::new(FnvHashMap::default());
}

#[derive(Default)]
struct RegistryState {
    next_slot: u64,
    active: FnvHashMap<u64, SharedThreadBuffer>,
    deactivated: Vec<SharedThreadBuffer>,
}

struct RegistryInner {
    id: u64,
    limits: Arc<EventLimits>,
    state: Mutex<RegistryState>,
}

impl RegistryInner {
    fn lock_state(&self) -> MutexGuard<'_, RegistryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn deactivate_slot(&self, slot: u64) {
        let mut state = self.lock_state();
        if let Some(buffer) = state.active.remove(&slot) {
            state.deactivated.push(buffer);
        }
    }
}

/// Thread-side owner of one registered buffer.
///
/// Dropping the handle deactivates the buffer in its registry.
pub struct ThreadBufferHandle {
    slot: u64,
    buffer: SharedThreadBuffer,
    registry: Weak<RegistryInner>,
}

impl ThreadBufferHandle {
    pub fn buffer(&self) -> &SharedThreadBuffer {
        &self.buffer
    }

    fn belongs_to(&self, registry: &ThreadBufferRegistry) -> bool {
        std::ptr::eq(self.registry.as_ptr(), Arc::as_ptr(&registry.inner))
    }
}

impl Drop for ThreadBufferHandle {
    fn drop(&mut self) {
        if let Some(registry) = self.registry.upgrade() {
            registry.deactivate_slot(self.slot);
        }
    }
}

/// Process-wide table of per-thread buffers; cheap to clone.
#[derive(Clone)]
pub struct ThreadBufferRegistry {
    inner: Arc<RegistryInner>,
}

impl ThreadBufferRegistry {
    pub fn new(limits: Arc<EventLimits>) -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                id: NEXT_REGISTRY_ID.fetch_add(1, Ordering::Relaxed),
                limits,
                state: Mutex::new(RegistryState::default()),
            }),
        }
    }

    pub fn limits(&self) -> &Arc<EventLimits> {
        &self.inner.limits
    }

    /// Register a new empty buffer and return the handle that owns it
    pub fn create_new(&self) -> ThreadBufferHandle {
        let buffer = Arc::new(Mutex::new(CallbackEventBuffer::new(Arc::clone(
            &self.inner.limits,
        ))));
        let mut state = self.inner.lock_state();
        let slot = state.next_slot;
        state.next_slot += 1;
        state.active.insert(slot, Arc::clone(&buffer));
        ThreadBufferHandle {
            slot,
            buffer,
            registry: Arc::downgrade(&self.inner),
        }
    }

    /// Move a buffer from the active set to the deactivated list
    pub fn deactivate(&self, handle: ThreadBufferHandle) {
        if !handle.belongs_to(self) {
            tracing::warn!("ignoring deactivation of a buffer owned by another registry");
        }
        drop(handle);
    }

    /// Snapshot recorded data.
    ///
    /// Active buffers have their contents moved out and keep recording into
    /// a fresh buffer. Deactivated buffers are removed from the registry and
    /// handed over whole.
    pub fn collect_all(&self, use_active: bool, use_deactivated: bool) -> Vec<CallbackEventBuffer> {
        let mut state = self.inner.lock_state();
        let mut collected = Vec::new();

        if use_active {
            collected.extend(
                state
                    .active
                    .values()
                    .map(|buffer| lock_buffer(buffer).take()),
            );
        }

        if use_deactivated {
            for shared in state.deactivated.drain(..) {
                let buffer = match Arc::try_unwrap(shared) {
                    Ok(mutex) => mutex.into_inner().unwrap_or_else(PoisonError::into_inner),
                    Err(shared) => lock_buffer(&shared).take(),
                };
                collected.push(buffer);
            }
        }

        collected
    }

    pub fn num_active(&self) -> usize {
        self.inner.lock_state().active.len()
    }

    pub fn num_deactivated(&self) -> usize {
        self.inner.lock_state().deactivated.len()
    }

    /// Run `f` on the calling thread's buffer, registering one on first use.
    ///
    /// Returns `None` when the thread-local table is unavailable, which
    /// happens during thread teardown or on re-entrant use.
    pub fn with_thread_buffer<R>(&self, f: impl FnOnce(&mut CallbackEventBuffer) -> R) -> Option<R> {
        THREAD_HANDLES
            .try_with(|handles| {
                let mut handles = handles.try_borrow_mut().ok()?;
                if !handles.contains_key(&self.inner.id) {
                    handles.retain(|_, handle| handle.registry.strong_count() > 0);
                    handles.insert(self.inner.id, self.create_new());
                }
                let handle = handles.get(&self.inner.id)?;
                let mut buffer = lock_buffer(&handle.buffer);
                Some(f(&mut buffer))
            })
            .ok()
            .flatten()
    }

    /// Drop the calling thread's handle, deactivating its buffer
    pub fn release_thread_buffer(&self) {
        let handle = THREAD_HANDLES
            .try_with(|handles| {
                handles
                    .try_borrow_mut()
                    .ok()
                    .and_then(|mut handles| handles.remove(&self.inner.id))
            })
            .ok()
            .flatten();
        if let Some(handle) = handle {
            self.deactivate(handle);
        }
    }
}

fn lock_buffer(buffer: &SharedThreadBuffer) -> MutexGuard<'_, CallbackEventBuffer> {
    buffer.lock().unwrap_or_else(PoisonError::into_inner)
}
