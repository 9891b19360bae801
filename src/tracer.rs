//! Tracing session orchestration
//!
//! A [`Tracer`] owns one driver subscription at a time. Enabling it installs
//! the driver API hook and the activity buffer client; disabling it stops
//! both, then merges every thread's callback events and the queued activity
//! buffers into the collector.
//!
//! Lifecycle: `Disabled -> Enabling -> Enabled -> Disabling -> Disabled`.

use crate::activity::{ActivityPipeline, ActivityStats};
use crate::annotation::{AnnotationInfo, AnnotationMap, AnnotationStack, RangeTracker};
use crate::buffer_pool::{ActivityBuffer, BufferPoolConfig};
use crate::collector::{CollectorOptions, TraceCollector};
use crate::driver::records::{ActivityKind, UnifiedMemoryCounterConfig, UnifiedMemoryCounterKind};
use crate::driver::{
    CallbackData, CallbackDomain, CallbackId, CallbackSite, ContextHandle, DriverApi,
    DriverCallArgs, DriverInterface, DriverSubscriber, RangeApi, SubscriberHandle,
};
use crate::error::{check, Result, TracerError};
use crate::hook::{ActivityApiHook, DriverApiHook, InternalCallGuard};
use crate::registry::ThreadBufferRegistry;
use crate::thread_buffer::EventLimits;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};

/// What a tracing session records
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TracerOptions {
    /// Record timed callback events; when false only annotations are kept
    pub required_callback_api_events: bool,
    /// Driver calls to intercept; empty intercepts the whole driver domain
    pub cbids_selected: Vec<DriverApi>,
    /// Activity kinds to collect; empty disables activity collection
    pub activities_selected: Vec<ActivityKind>,
    /// Finalize the tracing layer when the session ends
    pub cupti_finalize: bool,
    /// Synchronize every seen context before the session ends
    pub sync_devices_before_stop: bool,
    pub enable_range_tracking: bool,
}

impl Default for TracerOptions {
    fn default() -> Self {
        Self {
            required_callback_api_events: true,
            cbids_selected: Vec::new(),
            activities_selected: Vec::new(),
            cupti_finalize: false,
            sync_devices_before_stop: false,
            enable_range_tracking: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum TracerState {
    Disabled,
    Enabling,
    Enabled,
    Disabling,
}

impl TracerState {
    pub fn name(self) -> &'static str {
        match self {
            TracerState::Disabled => "disabled",
            TracerState::Enabling => "enabling",
            TracerState::Enabled => "enabled",
            TracerState::Disabling => "disabling",
        }
    }
}

/// Counters of the current or last session
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TracerStats {
    pub state: TracerState,
    pub callback_events_recorded: usize,
    /// Known after the session ends
    pub callback_events_dropped: usize,
    pub activity_events_converted: usize,
    pub activity: ActivityStats,
}

struct Session {
    options: TracerOptions,
    collector: Arc<dyn TraceCollector>,
    hook: Arc<dyn DriverApiHook>,
}

struct TracerShared {
    driver: Arc<dyn DriverInterface>,
    num_gpus: u32,
    state: Mutex<TracerState>,
    api_enabled: AtomicBool,
    activity_enabled: AtomicBool,
    annotations_enabled: AtomicBool,
    need_root_access: AtomicBool,
    subscriber: Mutex<Option<SubscriberHandle>>,
    session: RwLock<Option<Arc<Session>>>,
    registry: ThreadBufferRegistry,
    pipeline: ActivityPipeline,
    callback_events_dropped: AtomicUsize,
    activity_events_converted: AtomicUsize,
}

/// Collects driver callbacks and device activity into a [`TraceCollector`].
pub struct Tracer {
    shared: Arc<TracerShared>,
}

impl Tracer {
    pub fn new(driver: Arc<dyn DriverInterface>) -> Self {
        Self::with_buffer_pool(driver, BufferPoolConfig::default())
    }

    pub fn with_buffer_pool(driver: Arc<dyn DriverInterface>, pool: BufferPoolConfig) -> Self {
        let num_gpus = Self::num_gpus(driver.as_ref());
        let limits = Arc::new(EventLimits::new(&CollectorOptions::default()));
        Self {
            shared: Arc::new(TracerShared {
                driver,
                num_gpus,
                state: Mutex::new(TracerState::Disabled),
                api_enabled: AtomicBool::new(false),
                activity_enabled: AtomicBool::new(false),
                annotations_enabled: AtomicBool::new(false),
                need_root_access: AtomicBool::new(false),
                subscriber: Mutex::new(None),
                session: RwLock::new(None),
                registry: ThreadBufferRegistry::new(limits),
                pipeline: ActivityPipeline::new(pool),
                callback_events_dropped: AtomicUsize::new(0),
                activity_events_converted: AtomicUsize::new(0),
            }),
        }
    }

    /// Start a session.
    ///
    /// On failure every step already taken is undone and the tracer is back
    /// in the disabled state.
    pub fn enable(&self, options: TracerOptions, collector: Arc<dyn TraceCollector>) -> Result<()> {
        self.shared
            .transition(TracerState::Disabled, TracerState::Enabling, "enable")?;
        match self.enable_inner(options, collector) {
            Ok(()) => {
                self.shared.set_state(TracerState::Enabled);
                tracing::info!(num_gpus = self.shared.num_gpus, "tracer enabled");
                Ok(())
            }
            Err(err) => {
                self.shared.rollback();
                self.shared.set_state(TracerState::Disabled);
                Err(err)
            }
        }
    }

    fn enable_inner(&self, options: TracerOptions, collector: Arc<dyn TraceCollector>) -> Result<()> {
        let shared = &self.shared;
        if shared.driver.disabled() {
            return Err(TracerError::Unavailable("driver interface disabled".to_string()));
        }

        shared.registry.limits().reset(collector.options());
        let stale = shared.registry.collect_all(true, true);
        if !stale.is_empty() {
            tracing::debug!(buffers = stale.len(), "discarding callback events of a previous session");
        }
        shared.pipeline.discard_queued();
        shared.callback_events_dropped.store(0, Ordering::Release);
        shared.activity_events_converted.store(0, Ordering::Release);

        let hook: Arc<dyn DriverApiHook> = Arc::new(ActivityApiHook::new(
            options.clone(),
            Arc::clone(&shared.driver),
            shared.registry.clone(),
        ));
        let max_activity_events = collector.options().max_activity_api_events;
        *write(&shared.session) = Some(Arc::new(Session {
            options: options.clone(),
            collector,
            hook,
        }));

        AnnotationStack::enable();
        shared.annotations_enabled.store(true, Ordering::Release);

        self.enable_api_tracing(&options)?;
        if !options.activities_selected.is_empty() {
            self.enable_activity_tracing(&options, max_activity_events)?;
        }
        Ok(())
    }

    fn enable_api_tracing(&self, options: &TracerOptions) -> Result<()> {
        let shared = &self.shared;
        let subscriber: Arc<dyn DriverSubscriber> = Arc::clone(shared) as Arc<dyn DriverSubscriber>;
        let handle = match check("subscribe", shared.driver.subscribe(subscriber)) {
            Ok(handle) => handle,
            Err(err) => {
                if err.is_permission_denied() {
                    shared.need_root_access.store(true, Ordering::Release);
                }
                return Err(err);
            }
        };
        *lock(&shared.subscriber) = Some(handle);

        if options.enable_range_tracking {
            for api in [RangeApi::Push, RangeApi::Pop] {
                check(
                    "enable_callback",
                    shared
                        .driver
                        .enable_callback(true, handle, CallbackDomain::Range, api as CallbackId),
                )?;
            }
        }

        if options.cbids_selected.is_empty() {
            check(
                "enable_domain",
                shared.driver.enable_domain(true, handle, CallbackDomain::DriverApi),
            )?;
        } else {
            for api in &options.cbids_selected {
                check(
                    "enable_callback",
                    shared
                        .driver
                        .enable_callback(true, handle, CallbackDomain::DriverApi, api.id()),
                )?;
            }
        }

        shared.api_enabled.store(true, Ordering::Release);
        Ok(())
    }

    fn enable_activity_tracing(&self, options: &TracerOptions, max_activity_events: usize) -> Result<()> {
        let shared = &self.shared;
        shared.pipeline.start(max_activity_events);
        shared.activity_enabled.store(true, Ordering::Release);

        let client: Arc<dyn DriverSubscriber> = Arc::clone(shared) as Arc<dyn DriverSubscriber>;
        check(
            "activity_register_callbacks",
            shared.driver.activity_register_callbacks(client),
        )?;
        for &kind in &options.activities_selected {
            if kind == ActivityKind::UnifiedMemoryCounter {
                shared.configure_unified_memory(true);
            }
            check("activity_enable", shared.driver.activity_enable(kind))?;
        }
        Ok(())
    }

    /// End the session and deliver everything recorded to the collector.
    ///
    /// Every teardown step runs even if an earlier one fails; the first
    /// failure is returned.
    pub fn disable(&self) -> Result<()> {
        self.shared
            .transition(TracerState::Enabled, TracerState::Disabling, "disable")?;
        let result = self.shared.disable_inner();
        self.shared.set_state(TracerState::Disabled);
        tracing::info!(ok = result.is_ok(), "tracer disabled");
        result
    }

    /// Entry point for one driver callback
    pub fn handle_callback(&self, domain: CallbackDomain, cbid: CallbackId, data: &CallbackData<'_>) -> Result<()> {
        self.shared.handle_callback(domain, cbid, data)
    }

    /// Buffer for the driver to fill with activity records
    pub fn request_activity_buffer(&self) -> ActivityBuffer {
        self.shared.pipeline.request_buffer()
    }

    /// Accept a filled activity buffer
    pub fn process_activity_buffer(
        &self,
        context: Option<ContextHandle>,
        stream_id: u32,
        buffer: ActivityBuffer,
        valid_size: usize,
    ) -> Result<()> {
        self.shared
            .pipeline
            .process_buffer(self.shared.driver.as_ref(), context, stream_id, buffer, valid_size)
    }

    pub fn state(&self) -> TracerState {
        *lock(&self.shared.state)
    }

    /// Options of the running session
    pub fn options(&self) -> Option<TracerOptions> {
        read(&self.shared.session)
            .as_ref()
            .map(|session| session.options.clone())
    }

    pub fn registry(&self) -> &ThreadBufferRegistry {
        &self.shared.registry
    }

    pub fn stats(&self) -> TracerStats {
        let shared = &self.shared;
        TracerStats {
            state: self.state(),
            callback_events_recorded: shared.registry.limits().recorded(),
            callback_events_dropped: shared.callback_events_dropped.load(Ordering::Acquire),
            activity_events_converted: shared.activity_events_converted.load(Ordering::Acquire),
            activity: shared.pipeline.stats(),
        }
    }

    /// True when GPUs exist and no session is running
    pub fn is_available(&self) -> bool {
        self.shared.num_gpus > 0
            && !self.shared.api_enabled.load(Ordering::Acquire)
            && !self.shared.activity_enabled.load(Ordering::Acquire)
    }

    /// Set once a subscription failed for lack of privileges
    pub fn need_root_access(&self) -> bool {
        self.shared.need_root_access.load(Ordering::Acquire)
    }

    /// Reason tracing cannot work on this host, if any
    pub fn error_if_any(&self) -> Option<String> {
        let message = if self.shared.num_gpus == 0 {
            "No GPU detected."
        } else if self.need_root_access() {
            "Insufficient privilege to run the tracing layer (you need root permission)."
        } else if Self::timestamp(self.shared.driver.as_ref()) == 0 {
            "Failed to load the tracing layer (is it installed and accessible?)"
        } else {
            return None;
        };
        Some(format!("{}: {}", crate::host::hostname(), message))
    }

    /// Driver timestamp in nanoseconds, or 0 when it cannot be read
    pub fn timestamp(driver: &dyn DriverInterface) -> u64 {
        driver.timestamp().unwrap_or_else(|err| {
            tracing::error!(error = %err, "cannot read driver timestamp");
            0
        })
    }

    /// Number of visible GPUs, or 0 when the driver cannot be queried
    pub fn num_gpus(driver: &dyn DriverInterface) -> u32 {
        driver.device_count().unwrap_or_else(|err| {
            tracing::error!(error = %err, "cannot query device count");
            0
        })
    }

    /// Device of `context`, or 0 when it cannot be resolved
    pub fn device_id(driver: &dyn DriverInterface, context: Option<ContextHandle>) -> u32 {
        let Some(context) = context else {
            return 0;
        };
        driver.device_id(context).unwrap_or_else(|err| {
            tracing::error!(?context, error = %err, "cannot resolve device of context");
            0
        })
    }
}

impl Drop for Tracer {
    fn drop(&mut self) {
        if self.state() == TracerState::Enabled {
            if let Err(err) = self.disable() {
                tracing::warn!(error = %err, "tracer teardown on drop failed");
            }
        }
    }
}

impl TracerShared {
    fn transition(&self, from: TracerState, to: TracerState, operation: &'static str) -> Result<()> {
        let mut state = lock(&self.state);
        if *state != from {
            return Err(TracerError::InvalidState {
                operation,
                state: state.name(),
            });
        }
        *state = to;
        Ok(())
    }

    fn set_state(&self, to: TracerState) {
        *lock(&self.state) = to;
    }

    fn current_session(&self) -> Option<Arc<Session>> {
        read(&self.session).clone()
    }

    fn handle_callback(&self, domain: CallbackDomain, cbid: CallbackId, data: &CallbackData<'_>) -> Result<()> {
        if InternalCallGuard::active() || !self.api_enabled.load(Ordering::Acquire) {
            return Ok(());
        }
        let Some(session) = self.current_session() else {
            return Ok(());
        };

        if domain == CallbackDomain::Range {
            if session.options.enable_range_tracking && data.site == CallbackSite::Enter {
                handle_range_callback(cbid, data);
            }
            return Ok(());
        }
        if domain != CallbackDomain::DriverApi {
            return Ok(());
        }

        let Some(context) = data.context else {
            return Err(TracerError::Internal(format!(
                "callback for {} without a context",
                data.function_name
            )));
        };
        let device_id = check("device_id", self.driver.device_id(context))?;
        if device_id >= self.num_gpus {
            return Err(TracerError::Internal(format!(
                "invalid device id {device_id} for {}",
                data.function_name
            )));
        }

        match data.site {
            CallbackSite::Enter => session.hook.on_driver_api_enter(device_id, domain, cbid, data),
            CallbackSite::Exit => {
                let keep_range = DriverApi::from_id(cbid) != Some(DriverApi::LaunchCooperativeKernelMultiDevice);
                let added = self
                    .registry
                    .with_thread_buffer(|buffer| {
                        AnnotationStack::with_current(|annotation| {
                            RangeTracker::with_current(|range| {
                                let range = if keep_range { range } else { "" };
                                buffer.add(device_id, data.correlation_id, annotation, range)
                            })
                        })
                    })
                    .unwrap_or(false);
                if added {
                    session.hook.on_driver_api_exit(device_id, domain, cbid, data)
                } else {
                    tracing::trace!(correlation_id = data.correlation_id, "callback event dropped");
                    Ok(())
                }
            }
        }
    }

    fn configure_unified_memory(&self, enable: bool) {
        let configs = [
            UnifiedMemoryCounterKind::BytesTransferHtoD,
            UnifiedMemoryCounterKind::BytesTransferDtoH,
        ]
        .map(|kind| UnifiedMemoryCounterConfig {
            kind,
            device_id: 0,
            enable,
        });
        if let Err(err) = self.driver.configure_unified_memory_counter(&configs) {
            tracing::warn!(enable, error = %err, "cannot configure unified memory counters");
        }
    }

    fn disable_api_tracing(&self, options: &TracerOptions) -> Result<()> {
        self.api_enabled.store(false, Ordering::Release);
        let Some(handle) = lock(&self.subscriber).take() else {
            return Ok(());
        };

        let mut errors = FirstError::default();
        if options.enable_range_tracking {
            for api in [RangeApi::Push, RangeApi::Pop] {
                errors.record(check(
                    "enable_callback",
                    self.driver
                        .enable_callback(false, handle, CallbackDomain::Range, api as CallbackId),
                ));
            }
        }
        if options.cbids_selected.is_empty() {
            errors.record(check(
                "enable_domain",
                self.driver.enable_domain(false, handle, CallbackDomain::DriverApi),
            ));
        } else {
            for api in &options.cbids_selected {
                errors.record(check(
                    "enable_callback",
                    self.driver
                        .enable_callback(false, handle, CallbackDomain::DriverApi, api.id()),
                ));
            }
        }
        errors.record(check("unsubscribe", self.driver.unsubscribe(handle)));
        errors.into_result()
    }

    fn disable_activity_tracing(&self, options: &TracerOptions) -> Result<()> {
        if !self.activity_enabled.swap(false, Ordering::AcqRel) {
            return Ok(());
        }
        let mut errors = FirstError::default();
        for &kind in &options.activities_selected {
            if kind == ActivityKind::UnifiedMemoryCounter {
                self.configure_unified_memory(false);
            }
            errors.record(check("activity_disable", self.driver.activity_disable(kind)));
        }
        errors.record(check("activity_flush_all", self.driver.activity_flush_all(true)));
        errors.record(
            self.pipeline
                .record_driver_drops(self.driver.as_ref(), None, 0)
                .map(|_| ()),
        );
        self.pipeline.stop();
        errors.into_result()
    }

    fn disable_inner(&self) -> Result<()> {
        let Some(session) = self.current_session() else {
            return Err(TracerError::Internal("enabled tracer without a session".to_string()));
        };
        let mut errors = FirstError::default();

        errors.record(self.disable_api_tracing(&session.options));
        if self.driver.disabled() {
            tracing::warn!("driver interface disabled during teardown");
        }
        errors.record(self.disable_activity_tracing(&session.options));
        self.driver.clean_up();
        if session.options.cupti_finalize {
            errors.record(check("finalize", self.driver.finalize()));
        }
        errors.record(session.hook.sync_and_flush());

        self.deliver_events(session.collector.as_ref());

        *write(&self.session) = None;
        self.disable_annotations();
        errors.into_result()
    }

    /// Merge all recorded data into the collector and flush it
    fn deliver_events(&self, collector: &dyn TraceCollector) {
        let buffers = self.registry.collect_all(true, true);
        let mut annotation_map = AnnotationMap::default();
        let mut callback_events = Vec::new();
        let mut dropped = 0;

        for buffer in buffers {
            dropped += buffer.num_dropped_events();
            for entry in buffer.into_entries() {
                if entry.annotation.is_some() || entry.range.is_some() {
                    annotation_map.insert(
                        entry.correlation_id,
                        AnnotationInfo {
                            annotation: entry.annotation.clone(),
                            range: entry.range.clone(),
                        },
                    );
                }
                if entry.event.is_populated() {
                    let mut event = entry.event;
                    event.annotation = entry.annotation.as_deref().unwrap_or("").to_string();
                    event.range = entry.range.as_deref().unwrap_or("").to_string();
                    callback_events.push(event);
                }
            }
        }

        tracing::debug!(
            callback_events = callback_events.len(),
            annotations = annotation_map.len(),
            "delivering callback events"
        );
        collector.set_annotation_map(annotation_map);
        for event in callback_events {
            collector.add_event(event);
        }

        let converted = self.pipeline.finalize(self.driver.as_ref(), collector);
        self.activity_events_converted.store(converted, Ordering::Release);
        self.callback_events_dropped.store(dropped, Ordering::Release);

        if dropped > 0 {
            collector.on_events_dropped("callback api events", dropped);
        }
        let activity = self.pipeline.stats();
        if activity.estimated_dropped > 0 {
            collector.on_events_dropped("activity api events (estimated)", activity.estimated_dropped);
        }
        if activity.driver_dropped > 0 {
            collector.on_events_dropped("activity records dropped by driver", activity.driver_dropped);
        }
        if activity.buffers_unavailable > 0 {
            tracing::warn!(
                requests = activity.buffers_unavailable,
                "activity buffer requests went unserved"
            );
        }
        collector.flush();
    }

    fn disable_annotations(&self) {
        if self.annotations_enabled.swap(false, Ordering::AcqRel) {
            AnnotationStack::disable();
        }
    }

    /// Undo a partially enabled session
    fn rollback(&self) {
        let options = self
            .current_session()
            .map(|session| session.options.clone())
            .unwrap_or_default();
        if let Err(err) = self.disable_api_tracing(&options) {
            tracing::debug!(error = %err, "api tracing rollback failed");
        }
        if let Err(err) = self.disable_activity_tracing(&options) {
            tracing::debug!(error = %err, "activity tracing rollback failed");
        }
        self.pipeline.stop();
        self.pipeline.discard_queued();
        self.registry.collect_all(true, true);
        *write(&self.session) = None;
        self.disable_annotations();
    }
}

impl DriverSubscriber for TracerShared {
    fn on_callback(&self, domain: CallbackDomain, cbid: CallbackId, data: &CallbackData<'_>) {
        if let Err(err) = self.handle_callback(domain, cbid, data) {
            tracing::error!(function = data.function_name, error = %err, "callback failed");
        }
    }

    fn request_buffer(&self) -> ActivityBuffer {
        self.pipeline.request_buffer()
    }

    fn buffer_completed(&self, context: Option<ContextHandle>, stream_id: u32, buffer: ActivityBuffer, valid_size: usize) {
        if let Err(err) = self
            .pipeline
            .process_buffer(self.driver.as_ref(), context, stream_id, buffer, valid_size)
        {
            tracing::error!(error = %err, "activity buffer processing failed");
        }
    }
}

fn handle_range_callback(cbid: CallbackId, data: &CallbackData<'_>) {
    match RangeApi::from_repr(cbid) {
        Some(RangeApi::Push) => {
            if let DriverCallArgs::RangePush { message } = data.args {
                RangeTracker::enter_range(message);
            }
        }
        Some(RangeApi::Pop) => RangeTracker::exit_range(),
        None => tracing::trace!(cbid, "ignoring range callback"),
    }
}

/// Keeps the first error of a sequence of steps that all have to run
#[derive(Default)]
struct FirstError(Option<TracerError>);

impl FirstError {
    fn record(&mut self, result: Result<()>) {
        if let Err(err) = result {
            self.0.get_or_insert(err);
        }
    }

    fn into_result(self) -> Result<()> {
        self.0.map_or(Ok(()), Err)
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn read<T>(lock: &RwLock<T>) -> std::sync::RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(PoisonError::into_inner)
}

fn write<T>(lock: &RwLock<T>) -> std::sync::RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(PoisonError::into_inner)
}
