//! Event sinks fed by the tracer at teardown

use crate::annotation::{AnnotationInfo, AnnotationMap};
use crate::event::TracerEvent;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

/// Caps applied to one tracing session. A value of 0 means unlimited.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CollectorOptions {
    /// Callback events recorded across all threads
    pub max_callback_api_events: usize,
    /// Activity events, estimated from buffer sizes
    pub max_activity_api_events: usize,
    /// Distinct annotation strings kept per thread
    pub max_annotation_strings: usize,
}

impl Default for CollectorOptions {
    fn default() -> Self {
        Self {
            max_callback_api_events: 2 * 1024 * 1024,
            max_activity_api_events: 2 * 1024 * 1024,
            max_annotation_strings: 1024 * 1024,
        }
    }
}

/// Receiver of the unified event stream.
///
/// The tracer installs the merged annotation map first, then adds every
/// callback and activity event, then calls [`flush`](TraceCollector::flush).
pub trait TraceCollector: Send + Sync {
    fn options(&self) -> &CollectorOptions;

    fn add_event(&self, event: TracerEvent);

    fn set_annotation_map(&self, map: AnnotationMap);

    /// Annotation recorded for a correlation id during the session
    fn lookup_annotation(&self, device_id: u32, correlation_id: u32) -> AnnotationInfo;

    /// Report events lost to a cap
    fn on_events_dropped(&self, reason: &str, count: usize) {
        tracing::warn!(reason, count, "events dropped");
    }

    fn flush(&self);
}

/// A drop report received through [`TraceCollector::on_events_dropped`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DropReport {
    pub reason: String,
    pub count: usize,
}

/// Collector that keeps every event in memory, sorted by start time on flush
#[derive(Debug, Default)]
pub struct InMemoryCollector {
    options: CollectorOptions,
    events: Mutex<Vec<TracerEvent>>,
    annotations: Mutex<AnnotationMap>,
    dropped: Mutex<Vec<DropReport>>,
    flushed: AtomicBool,
}

impl InMemoryCollector {
    pub fn new(options: CollectorOptions) -> Self {
        Self {
            options,
            ..Default::default()
        }
    }

    /// Snapshot of collected events
    pub fn events(&self) -> Vec<TracerEvent> {
        lock(&self.events).clone()
    }

    pub fn take_events(&self) -> Vec<TracerEvent> {
        std::mem::take(&mut *lock(&self.events))
    }

    pub fn num_events(&self) -> usize {
        lock(&self.events).len()
    }

    pub fn drop_reports(&self) -> Vec<DropReport> {
        lock(&self.dropped).clone()
    }

    /// Total events reported as dropped
    pub fn dropped_events(&self) -> usize {
        lock(&self.dropped).iter().map(|report| report.count).sum()
    }

    pub fn is_flushed(&self) -> bool {
        self.flushed.load(Ordering::Acquire)
    }
}

impl TraceCollector for InMemoryCollector {
    fn options(&self) -> &CollectorOptions {
        &self.options
    }

    fn add_event(&self, event: TracerEvent) {
        lock(&self.events).push(event);
    }

    fn set_annotation_map(&self, map: AnnotationMap) {
        *lock(&self.annotations) = map;
    }

    fn lookup_annotation(&self, _device_id: u32, correlation_id: u32) -> AnnotationInfo {
        lock(&self.annotations)
            .get(&correlation_id)
            .cloned()
            .unwrap_or_default()
    }

    fn on_events_dropped(&self, reason: &str, count: usize) {
        tracing::warn!(reason, count, "events dropped");
        lock(&self.dropped).push(DropReport {
            reason: reason.to_string(),
            count,
        });
    }

    fn flush(&self) {
        lock(&self.events).sort_by_key(|event| (event.start_time_ns, event.end_time_ns));
        self.flushed.store(true, Ordering::Release);
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
