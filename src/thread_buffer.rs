//! Per-thread callback event buffers
//!
//! Each thread that makes driver calls records its completed calls into its
//! own [`CallbackEventBuffer`]. A shared [`EventLimits`] caps the total number
//! of callback events across all threads of a tracing session.

use crate::append_buffer::AppendOnlyBuffer;
use crate::collector::CollectorOptions;
use crate::event::TracerEvent;
use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Session-wide caps and the shared callback event counter.
#[derive(Debug, Default)]
pub struct EventLimits {
    recorded: AtomicUsize,
    max_callback_api_events: AtomicUsize,
    max_annotation_strings: AtomicUsize,
}

impl EventLimits {
    pub fn new(options: &CollectorOptions) -> Self {
        let limits = Self::default();
        limits.reset(options);
        limits
    }

    /// Apply new caps and zero the shared counter
    pub fn reset(&self, options: &CollectorOptions) {
        self.max_callback_api_events
            .store(options.max_callback_api_events, Ordering::Release);
        self.max_annotation_strings
            .store(options.max_annotation_strings, Ordering::Release);
        self.recorded.store(0, Ordering::Release);
    }

    /// Reserve one event slot; fails once the cap is reached (0 = unlimited)
    pub fn try_reserve(&self) -> bool {
        let max = self.max_callback_api_events.load(Ordering::Acquire);
        self.recorded
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (max == 0 || n < max).then_some(n + 1)
            })
            .is_ok()
    }

    pub fn recorded(&self) -> usize {
        self.recorded.load(Ordering::Acquire)
    }

    pub fn max_callback_api_events(&self) -> usize {
        self.max_callback_api_events.load(Ordering::Acquire)
    }

    pub fn max_annotation_strings(&self) -> usize {
        self.max_annotation_strings.load(Ordering::Acquire)
    }
}

/// One recorded driver call with the annotation context it ran under
#[derive(Debug, Clone)]
pub struct EventWithAnnotation {
    pub device_id: u32,
    pub correlation_id: u32,
    pub annotation: Option<Arc<str>>,
    pub range: Option<Arc<str>>,
    pub event: TracerEvent,
}

/// Callback events and interned annotation strings recorded by one thread.
#[derive(Debug)]
pub struct CallbackEventBuffer {
    limits: Arc<EventLimits>,
    annotations: HashSet<Arc<str>>,
    ranges: HashSet<Arc<str>>,
    events: AppendOnlyBuffer<EventWithAnnotation>,
    num_dropped_events: usize,
}

impl CallbackEventBuffer {
    pub fn new(limits: Arc<EventLimits>) -> Self {
        Self {
            limits,
            annotations: HashSet::new(),
            ranges: HashSet::new(),
            events: AppendOnlyBuffer::new(),
            num_dropped_events: 0,
        }
    }

    /// Reserve a slot for a completed driver call.
    ///
    /// Returns false and counts a drop when the session cap is exhausted.
    /// Once the distinct-string cap is reached, strings not already interned
    /// are stored as empty but the event still takes a slot.
    pub fn add(&mut self, device_id: u32, correlation_id: u32, annotation: &str, range: &str) -> bool {
        if !self.limits.try_reserve() {
            self.num_dropped_events += 1;
            return false;
        }

        let max_strings = self.limits.max_annotation_strings();
        let annotation = intern(&mut self.annotations, annotation, max_strings);
        let range = intern(&mut self.ranges, range, max_strings);

        self.events.append(EventWithAnnotation {
            device_id,
            correlation_id,
            annotation,
            range,
            event: TracerEvent::default(),
        });
        true
    }

    /// The event slot reserved by the most recent successful [`add`](Self::add)
    pub fn last_event_mut(&mut self) -> Option<&mut TracerEvent> {
        self.events.last_mut().map(|entry| &mut entry.event)
    }

    /// Fill the most recent slot if it belongs to `correlation_id`
    pub fn fill_last(&mut self, correlation_id: u32, event: TracerEvent) -> bool {
        match self.events.last_mut() {
            Some(entry) if entry.correlation_id == correlation_id => {
                entry.event = event;
                true
            }
            _ => false,
        }
    }

    pub fn clear(&mut self) {
        self.annotations.clear();
        self.ranges.clear();
        self.events.clear();
        self.num_dropped_events = 0;
    }

    /// Move all recorded data out, leaving this buffer empty
    pub fn take(&mut self) -> Self {
        let fresh = Self::new(Arc::clone(&self.limits));
        std::mem::replace(self, fresh)
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn num_dropped_events(&self) -> usize {
        self.num_dropped_events
    }

    pub fn num_annotation_strings(&self) -> usize {
        self.annotations.len()
    }

    pub fn num_range_strings(&self) -> usize {
        self.ranges.len()
    }

    pub fn entries(&self) -> impl Iterator<Item = &EventWithAnnotation> {
        self.events.iter()
    }

    pub fn into_entries(self) -> impl Iterator<Item = EventWithAnnotation> {
        self.events.into_iter()
    }
}

fn intern(set: &mut HashSet<Arc<str>>, value: &str, max_strings: usize) -> Option<Arc<str>> {
    if value.is_empty() {
        return None;
    }
    if let Some(existing) = set.get(value) {
        return Some(Arc::clone(existing));
    }
    if max_strings > 0 && set.len() >= max_strings {
        return None;
    }
    let interned: Arc<str> = Arc::from(value);
    set.insert(Arc::clone(&interned));
    Some(interned)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{TracerEventSource, TracerEventType};

    fn limits(max_events: usize, max_strings: usize) -> Arc<EventLimits> {
        Arc::new(EventLimits::new(&CollectorOptions {
            max_callback_api_events: max_events,
            max_annotation_strings: max_strings,
            ..Default::default()
        }))
    }

    #[test]
    fn test_add_records_until_cap() {
        let mut buffer = CallbackEventBuffer::new(limits(2, 0));
        assert!(buffer.add(0, 1, "a", ""));
        assert!(buffer.add(0, 2, "a", ""));
        assert!(!buffer.add(0, 3, "a", ""));
        assert!(!buffer.add(0, 4, "a", ""));

        assert_eq!(buffer.len(), 2);
        assert_eq!(buffer.num_dropped_events(), 2);
    }

    #[test]
    fn test_zero_cap_means_unlimited() {
        let mut buffer = CallbackEventBuffer::new(limits(0, 0));
        for id in 0..5000 {
            assert!(buffer.add(0, id, "", ""));
        }
        assert_eq!(buffer.len(), 5000);
        assert_eq!(buffer.num_dropped_events(), 0);
    }

    #[test]
    fn test_cap_is_shared_between_buffers() {
        let shared = limits(3, 0);
        let mut first = CallbackEventBuffer::new(Arc::clone(&shared));
        let mut second = CallbackEventBuffer::new(Arc::clone(&shared));

        assert!(first.add(0, 1, "", ""));
        assert!(second.add(0, 2, "", ""));
        assert!(first.add(0, 3, "", ""));
        assert!(!second.add(0, 4, "", ""));
        assert_eq!(shared.recorded(), 3);
        assert_eq!(second.num_dropped_events(), 1);
    }

    #[test]
    fn test_strings_are_interned() {
        let mut buffer = CallbackEventBuffer::new(limits(0, 0));
        buffer.add(0, 1, "step", "fwd");
        buffer.add(0, 2, "step", "fwd");

        let entries: Vec<_> = buffer.entries().collect();
        let (a, b) = (&entries[0], &entries[1]);
        assert!(Arc::ptr_eq(a.annotation.as_ref().unwrap(), b.annotation.as_ref().unwrap()));
        assert_eq!(buffer.num_annotation_strings(), 1);
        assert_eq!(buffer.num_range_strings(), 1);
    }

    #[test]
    fn test_string_cap_keeps_event_but_drops_new_strings() {
        let mut buffer = CallbackEventBuffer::new(limits(0, 1));
        assert!(buffer.add(0, 1, "first", ""));
        assert!(buffer.add(0, 2, "second", ""));
        assert!(buffer.add(0, 3, "first", ""));

        let annotations: Vec<_> = buffer
            .entries()
            .map(|e| e.annotation.as_deref().unwrap_or("").to_string())
            .collect();
        assert_eq!(annotations, vec!["first", "", "first"]);
        assert_eq!(buffer.num_annotation_strings(), 1);
    }

    #[test]
    fn test_fill_last_checks_correlation() {
        let mut buffer = CallbackEventBuffer::new(limits(0, 0));
        buffer.add(0, 9, "", "");

        let event = TracerEvent {
            event_type: TracerEventType::Kernel,
            source: TracerEventSource::DriverCallback,
            correlation_id: 9,
            ..Default::default()
        };
        assert!(!buffer.fill_last(8, event.clone()));
        assert!(buffer.fill_last(9, event));
        assert_eq!(
            buffer.last_event_mut().map(|e| e.event_type),
            Some(TracerEventType::Kernel)
        );
    }

    #[test]
    fn test_take_and_clear() {
        let mut buffer = CallbackEventBuffer::new(limits(1, 0));
        buffer.add(0, 1, "x", "y");
        buffer.add(0, 2, "x", "y");

        let taken = buffer.take();
        assert_eq!(taken.len(), 1);
        assert_eq!(taken.num_dropped_events(), 1);
        assert!(buffer.is_empty());
        assert_eq!(buffer.num_annotation_strings(), 0);

        let mut taken = taken;
        taken.clear();
        assert!(taken.is_empty());
        assert_eq!(taken.num_dropped_events(), 0);
        assert!(taken.last_event_mut().is_none());
    }
}
