//! Driver API hook
//!
//! The hook runs inside the enter and exit callbacks of every recorded
//! driver call. On enter it stashes a start timestamp in the call's scratch
//! slot; on exit it decodes the call and fills the event slot that the
//! tracer reserved in the calling thread's buffer.

use crate::decode::{decode_callback, DecodeInput};
use crate::driver::{CallbackData, CallbackDomain, CallbackId, ContextHandle, DriverApi, DriverInterface};
use crate::error::Result;
use crate::registry::ThreadBufferRegistry;
use crate::tracer::TracerOptions;
use std::cell::Cell;
use std::collections::BTreeSet;
use std::sync::{Arc, Mutex, PoisonError};

thread_local! {
    static INTERNAL_CALL_DEPTH: Cell<u32> = const { Cell::new(0) };
}

/// Marks driver calls made by the tracer itself so their callbacks are ignored
pub struct InternalCallGuard {
    _private: (),
}

impl InternalCallGuard {
    pub fn new() -> Self {
        INTERNAL_CALL_DEPTH.with(|depth| depth.set(depth.get() + 1));
        Self { _private: () }
    }

    /// True while the calling thread is inside a tracer-issued driver call
    pub fn active() -> bool {
        INTERNAL_CALL_DEPTH.with(|depth| depth.get() > 0)
    }
}

impl Default for InternalCallGuard {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for InternalCallGuard {
    fn drop(&mut self) {
        INTERNAL_CALL_DEPTH.with(|depth| depth.set(depth.get().saturating_sub(1)));
    }
}

/// Work performed around each recorded driver call.
pub trait DriverApiHook: Send + Sync {
    fn on_driver_api_enter(
        &self,
        device_id: u32,
        domain: CallbackDomain,
        cbid: CallbackId,
        data: &CallbackData<'_>,
    ) -> Result<()>;

    fn on_driver_api_exit(
        &self,
        device_id: u32,
        domain: CallbackDomain,
        cbid: CallbackId,
        data: &CallbackData<'_>,
    ) -> Result<()>;

    /// Wait for outstanding device work before tracing stops
    fn sync_and_flush(&self) -> Result<()>;
}

/// Hook that records callback events with start/end timestamps
pub struct ActivityApiHook {
    options: TracerOptions,
    driver: Arc<dyn DriverInterface>,
    registry: ThreadBufferRegistry,
    contexts: Mutex<BTreeSet<ContextHandle>>,
}

impl ActivityApiHook {
    pub fn new(options: TracerOptions, driver: Arc<dyn DriverInterface>, registry: ThreadBufferRegistry) -> Self {
        Self {
            options,
            driver,
            registry,
            contexts: Mutex::new(BTreeSet::new()),
        }
    }

    fn timestamp(&self) -> u64 {
        self.driver.timestamp().unwrap_or_else(|err| {
            tracing::error!(error = %err, "cannot read driver timestamp");
            0
        })
    }

    fn track_context(&self, cbid: CallbackId, context: Option<ContextHandle>) {
        if !self.options.sync_devices_before_stop {
            return;
        }
        let Some(context) = context else {
            return;
        };
        let mut contexts = self.contexts.lock().unwrap_or_else(PoisonError::into_inner);
        if DriverApi::from_id(cbid) == Some(DriverApi::CtxDestroy) {
            contexts.remove(&context);
        } else {
            contexts.insert(context);
        }
    }

    /// Contexts that will be synchronized before tracing stops
    pub fn tracked_contexts(&self) -> Vec<ContextHandle> {
        let contexts = self.contexts.lock().unwrap_or_else(PoisonError::into_inner);
        contexts.iter().copied().collect()
    }
}

impl DriverApiHook for ActivityApiHook {
    fn on_driver_api_enter(
        &self,
        _device_id: u32,
        _domain: CallbackDomain,
        _cbid: CallbackId,
        data: &CallbackData<'_>,
    ) -> Result<()> {
        let start = if self.options.required_callback_api_events {
            self.timestamp()
        } else {
            0
        };
        data.correlation_data.set(start);
        Ok(())
    }

    fn on_driver_api_exit(
        &self,
        device_id: u32,
        _domain: CallbackDomain,
        cbid: CallbackId,
        data: &CallbackData<'_>,
    ) -> Result<()> {
        if !self.options.required_callback_api_events {
            return Ok(());
        }
        let end = self.timestamp();
        let start = data.correlation_data.get();
        self.track_context(cbid, data.context);

        let event = decode_callback(&DecodeInput {
            driver: self.driver.as_ref(),
            device_id,
            cbid,
            data,
            start_ns: start,
            end_ns: end,
        });
        let filled = self
            .registry
            .with_thread_buffer(|buffer| buffer.fill_last(data.correlation_id, event))
            .unwrap_or(false);
        if !filled {
            tracing::trace!(correlation_id = data.correlation_id, "no reserved slot for callback event");
        }
        Ok(())
    }

    fn sync_and_flush(&self) -> Result<()> {
        if !self.options.sync_devices_before_stop {
            return Ok(());
        }
        let _guard = InternalCallGuard::new();
        let contexts = self.tracked_contexts();
        for context in contexts {
            if let Err(err) = self.driver.synchronize_context(context) {
                tracing::debug!(?context, error = %err, "context synchronization failed");
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collector::CollectorOptions;
    use crate::driver::sim::SimulatedDriver;
    use crate::driver::{CallbackSite, DriverCallArgs};
    use crate::event::TracerEventType;
    use crate::thread_buffer::EventLimits;

    fn setup(options: TracerOptions) -> (Arc<SimulatedDriver>, ThreadBufferRegistry, ActivityApiHook) {
        let driver = Arc::new(SimulatedDriver::default());
        let registry = ThreadBufferRegistry::new(Arc::new(EventLimits::new(&CollectorOptions::default())));
        let hook = ActivityApiHook::new(options, driver.clone(), registry.clone());
        (driver, registry, hook)
    }

    fn run_call(hook: &ActivityApiHook, registry: &ThreadBufferRegistry, api: DriverApi, context: ContextHandle) {
        let scratch = Cell::new(0);
        let args = DriverCallArgs::None;
        let mut data = CallbackData {
            site: CallbackSite::Enter,
            function_name: api.function_name(),
            symbol_name: Some("kern"),
            context: Some(context),
            context_uid: 3,
            correlation_id: 77,
            args: &args,
            correlation_data: &scratch,
        };
        hook.on_driver_api_enter(0, CallbackDomain::DriverApi, api.id(), &data).unwrap();
        data.site = CallbackSite::Exit;
        registry.with_thread_buffer(|b| b.add(0, 77, "", ""));
        hook.on_driver_api_exit(0, CallbackDomain::DriverApi, api.id(), &data).unwrap();
    }

    #[test]
    fn test_exit_fills_reserved_slot() {
        let (driver, registry, hook) = setup(TracerOptions::default());
        let ctx = driver.create_context(0).unwrap();
        run_call(&hook, &registry, DriverApi::LaunchKernel, ctx);

        let event = registry
            .with_thread_buffer(|b| b.last_event_mut().cloned())
            .flatten()
            .unwrap();
        assert_eq!(event.event_type, TracerEventType::Kernel);
        assert_eq!(event.name, "kern");
        assert!(event.end_time_ns >= event.start_time_ns);
        registry.release_thread_buffer();
    }

    #[test]
    fn test_disabled_callback_events_leave_slot_empty() {
        let options = TracerOptions {
            required_callback_api_events: false,
            ..Default::default()
        };
        let (driver, registry, hook) = setup(options);
        let ctx = driver.create_context(0).unwrap();
        run_call(&hook, &registry, DriverApi::LaunchKernel, ctx);

        let populated = registry
            .with_thread_buffer(|b| b.last_event_mut().map(|e| e.is_populated()))
            .flatten();
        assert_eq!(populated, Some(false));
        registry.release_thread_buffer();
    }

    #[test]
    fn test_contexts_tracked_only_when_syncing() {
        let (driver, registry, hook) = setup(TracerOptions::default());
        let ctx = driver.create_context(0).unwrap();
        run_call(&hook, &registry, DriverApi::LaunchKernel, ctx);
        assert!(hook.tracked_contexts().is_empty());
        registry.release_thread_buffer();

        let options = TracerOptions {
            sync_devices_before_stop: true,
            ..Default::default()
        };
        let (driver, registry, hook) = setup(options);
        let ctx = driver.create_context(0).unwrap();
        run_call(&hook, &registry, DriverApi::LaunchKernel, ctx);
        assert_eq!(hook.tracked_contexts(), vec![ctx]);

        run_call(&hook, &registry, DriverApi::CtxDestroy, ctx);
        assert!(hook.tracked_contexts().is_empty());
        registry.release_thread_buffer();
    }

    #[test]
    fn test_sync_and_flush_synchronizes_tracked_contexts() {
        let options = TracerOptions {
            sync_devices_before_stop: true,
            ..Default::default()
        };
        let (driver, registry, hook) = setup(options);
        let ctx = driver.create_context(0).unwrap();
        run_call(&hook, &registry, DriverApi::MemcpyHtoD, ctx);

        hook.sync_and_flush().unwrap();
        assert_eq!(driver.synchronized_contexts(), vec![ctx]);
        assert!(!InternalCallGuard::active());
        registry.release_thread_buffer();
    }

    #[test]
    fn test_internal_call_guard_nests() {
        assert!(!InternalCallGuard::active());
        {
            let _outer = InternalCallGuard::new();
            let _inner = InternalCallGuard::new();
            assert!(InternalCallGuard::active());
        }
        assert!(!InternalCallGuard::active());
    }
}
