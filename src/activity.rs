//! Device activity buffers: intake, queueing and conversion to events
//!
//! Filled buffers arrive from the driver on arbitrary threads. They are
//! queued under a dedicated lock and only decoded at teardown, after the
//! annotation map has been handed to the collector.

use crate::buffer_pool::{ActivityBuffer, BufferPool, BufferPoolConfig, PoolStats};
use crate::collector::TraceCollector;
use crate::driver::records::{
    ActivityRecord, KernelRecord, MemcpyP2PRecord, MemcpyRecord, MemoryRecord, MemsetRecord,
    OverheadObject, OverheadRecord, SynchronizationRecord, UnifiedMemoryRecord,
};
use crate::driver::{ContextHandle, DriverInterface};
use crate::error::{check, DriverError, Result, TracerError};
use crate::event::{
    EventDetails, KernelDetails, MemcpyDetails, MemcpyKind, MemoryResidencyDetails, MemsetDetails,
    TracerEvent, TracerEventSource, TracerEventType, UNIFIED_MEMORY_STREAM_BASE,
};
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

/// Assumed average record size used to estimate events per buffer
pub const ESTIMATED_RECORD_SIZE: usize = 64;

struct CompletedBuffer {
    buffer: ActivityBuffer,
    valid_size: usize,
}

/// Activity counters for the current or last session
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ActivityStats {
    pub estimated_events: usize,
    pub estimated_dropped: usize,
    pub driver_dropped: usize,
    pub buffers_unavailable: usize,
    pub queued_buffers: usize,
    pub pool: PoolStats,
}

/// Intake queue for filled activity buffers
pub struct ActivityPipeline {
    pool: BufferPool,
    queue: Mutex<VecDeque<CompletedBuffer>>,
    enabled: AtomicBool,
    max_events: AtomicUsize,
    estimated_events: AtomicUsize,
    estimated_dropped: AtomicUsize,
    driver_dropped: AtomicUsize,
    buffers_unavailable: AtomicUsize,
}

impl ActivityPipeline {
    pub fn new(pool_config: BufferPoolConfig) -> Self {
        Self {
            pool: BufferPool::new(pool_config),
            queue: Mutex::new(VecDeque::new()),
            enabled: AtomicBool::new(false),
            max_events: AtomicUsize::new(0),
            estimated_events: AtomicUsize::new(0),
            estimated_dropped: AtomicUsize::new(0),
            driver_dropped: AtomicUsize::new(0),
            buffers_unavailable: AtomicUsize::new(0),
        }
    }

    /// Reset counters and accept buffers; `max_events` of 0 means unlimited
    pub fn start(&self, max_events: usize) {
        self.max_events.store(max_events, Ordering::Release);
        self.estimated_events.store(0, Ordering::Release);
        self.estimated_dropped.store(0, Ordering::Release);
        self.driver_dropped.store(0, Ordering::Release);
        self.buffers_unavailable.store(0, Ordering::Release);
        self.enabled.store(true, Ordering::Release);
    }

    pub fn stop(&self) {
        self.enabled.store(false, Ordering::Release);
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    pub fn pool(&self) -> &BufferPool {
        &self.pool
    }

    /// Buffer for the driver to fill; empty when the pool is exhausted
    pub fn request_buffer(&self) -> ActivityBuffer {
        match self.pool.get_or_create() {
            Some(buffer) => buffer,
            None => {
                self.buffers_unavailable.fetch_add(1, Ordering::Relaxed);
                tracing::warn!("activity buffer pool exhausted, driver will drop records");
                ActivityBuffer::empty()
            }
        }
    }

    /// Accept a filled buffer from the driver.
    ///
    /// The buffer is queued for decoding, or handed back to the pool when it
    /// is empty, arrives after tracing stopped, or would exceed the event cap.
    pub fn process_buffer(
        &self,
        driver: &dyn DriverInterface,
        context: Option<ContextHandle>,
        stream_id: u32,
        buffer: ActivityBuffer,
        valid_size: usize,
    ) -> Result<()> {
        if valid_size == 0 {
            self.pool.reclaim(buffer);
            return Ok(());
        }
        if !self.is_enabled() {
            tracing::warn!("activity buffer reclaimed after flush");
            self.pool.reclaim(buffer);
            return Ok(());
        }
        if driver.disabled() {
            self.pool.reclaim(buffer);
            return Err(TracerError::Unavailable("driver interface disabled".to_string()));
        }

        if let Err(err) = self.record_driver_drops(driver, context, stream_id) {
            self.pool.reclaim(buffer);
            return Err(err);
        }

        let estimate = valid_size.div_ceil(ESTIMATED_RECORD_SIZE);
        let max = self.max_events.load(Ordering::Acquire);
        let admitted = self
            .estimated_events
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (max == 0 || n < max).then_some(n + estimate)
            })
            .is_ok();
        if !admitted {
            tracing::warn!(max, "activity event cap reached, recycling buffer unread");
            self.estimated_dropped.fetch_add(estimate, Ordering::Relaxed);
            self.pool.reclaim(buffer);
            return Ok(());
        }

        let valid_size = valid_size.min(buffer.len());
        lock(&self.queue).push_back(CompletedBuffer { buffer, valid_size });
        Ok(())
    }

    /// Add the driver's pending dropped-record count to the session totals.
    ///
    /// Records lost while no buffer was available never arrive with a
    /// completed buffer, so this also runs once after the final flush.
    pub fn record_driver_drops(
        &self,
        driver: &dyn DriverInterface,
        context: Option<ContextHandle>,
        stream_id: u32,
    ) -> Result<usize> {
        let dropped = check(
            "activity_dropped_records",
            driver.activity_dropped_records(context, stream_id),
        )?;
        if dropped > 0 {
            tracing::info!(dropped, "activity records dropped by driver");
            self.driver_dropped.fetch_add(dropped, Ordering::Relaxed);
        }
        Ok(dropped)
    }

    /// Decode every queued buffer into the collector; returns events added
    pub fn finalize(&self, driver: &dyn DriverInterface, collector: &dyn TraceCollector) -> usize {
        let mut added = 0;
        loop {
            let next = lock(&self.queue).pop_front();
            let Some(completed) = next else {
                break;
            };
            let bytes = &completed.buffer.as_slice()[..completed.valid_size];
            if let Err(err) = decode_into(driver, collector, bytes, &mut added) {
                tracing::warn!(error = %err, "activity buffer decoding stopped early");
            }
            self.pool.reclaim(completed.buffer);
        }
        added
    }

    pub fn queued_buffers(&self) -> usize {
        lock(&self.queue).len()
    }

    /// Drop queued buffers without decoding them
    pub fn discard_queued(&self) {
        let drained: Vec<CompletedBuffer> = lock(&self.queue).drain(..).collect();
        for completed in drained {
            self.pool.reclaim(completed.buffer);
        }
    }

    pub fn stats(&self) -> ActivityStats {
        ActivityStats {
            estimated_events: self.estimated_events.load(Ordering::Relaxed),
            estimated_dropped: self.estimated_dropped.load(Ordering::Relaxed),
            driver_dropped: self.driver_dropped.load(Ordering::Relaxed),
            buffers_unavailable: self.buffers_unavailable.load(Ordering::Relaxed),
            queued_buffers: self.queued_buffers(),
            pool: self.pool.stats(),
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Decode all records in `bytes` and add the resulting events to `collector`.
///
/// Stops at the end of the buffer or at the first record that fails to
/// decode; in the latter case the events decoded so far are kept.
pub fn convert_buffer(
    driver: &dyn DriverInterface,
    collector: &dyn TraceCollector,
    bytes: &[u8],
) -> Result<usize> {
    let mut added = 0;
    decode_into(driver, collector, bytes, &mut added)?;
    Ok(added)
}

fn decode_into(
    driver: &dyn DriverInterface,
    collector: &dyn TraceCollector,
    bytes: &[u8],
    added: &mut usize,
) -> Result<()> {
    let mut cursor = 0;
    loop {
        match driver.activity_next_record(bytes, &mut cursor) {
            Ok(Some(record)) => {
                if let Some(event) = convert_record(&record, collector) {
                    collector.add_event(event);
                    *added += 1;
                }
            }
            Ok(None) | Err(DriverError::MaxLimitReached) => return Ok(()),
            Err(err) => {
                return Err(TracerError::Internal(format!(
                    "cannot decode activity record at offset {cursor}: {err}"
                )))
            }
        }
    }
}

/// Convert one activity record; `None` for records that are skipped
pub fn convert_record(record: &ActivityRecord, collector: &dyn TraceCollector) -> Option<TracerEvent> {
    match record {
        ActivityRecord::Kernel(r) | ActivityRecord::ConcurrentKernel(r) | ActivityRecord::CdpKernel(r) => {
            Some(kernel_event(r, collector))
        }
        ActivityRecord::Memcpy(r) => Some(memcpy_event(r, collector)),
        ActivityRecord::MemcpyP2P(r) => Some(memcpy_p2p_event(r, collector)),
        ActivityRecord::Overhead(r) => overhead_event(r),
        ActivityRecord::UnifiedMemoryCounter(r) => Some(unified_memory_event(r)),
        ActivityRecord::Memory(r) => Some(memory_event(r)),
        ActivityRecord::Memset(r) => Some(memset_event(r)),
        ActivityRecord::Synchronization(r) => Some(synchronization_event(r)),
        ActivityRecord::Other { kind } => {
            tracing::trace!(kind, "activity kind not supported");
            None
        }
    }
}

fn activity_event(event_type: TracerEventType, name: String, start: u64, end: u64) -> TracerEvent {
    TracerEvent {
        event_type,
        source: TracerEventSource::Activity,
        name,
        start_time_ns: start,
        end_time_ns: end,
        ..Default::default()
    }
}

fn attach_annotation(event: &mut TracerEvent, collector: &dyn TraceCollector) {
    let info = collector.lookup_annotation(event.device_id, event.correlation_id);
    event.annotation = info.annotation_str().to_string();
    event.range = info.range_str().to_string();
}

fn kernel_event(r: &KernelRecord, collector: &dyn TraceCollector) -> TracerEvent {
    let mut event = activity_event(TracerEventType::Kernel, r.name.clone(), r.start, r.end);
    event.device_id = r.device_id;
    event.context_id = r.context_id;
    event.stream_id = r.stream_id;
    event.correlation_id = r.correlation_id;
    attach_annotation(&mut event, collector);
    event.details = EventDetails::Kernel(KernelDetails {
        registers_per_thread: r.registers_per_thread,
        static_shared_memory_usage: r.static_shared_memory,
        dynamic_shared_memory_usage: r.dynamic_shared_memory,
        block_x: r.block[0],
        block_y: r.block[1],
        block_z: r.block[2],
        grid_x: r.grid[0],
        grid_y: r.grid[1],
        grid_z: r.grid[2],
    });
    event
}

fn memcpy_event(r: &MemcpyRecord, collector: &dyn TraceCollector) -> TracerEvent {
    let event_type = match r.copy_kind {
        MemcpyKind::HtoD => TracerEventType::MemcpyH2D,
        MemcpyKind::DtoH => TracerEventType::MemcpyD2H,
        MemcpyKind::DtoD => TracerEventType::MemcpyD2D,
        MemcpyKind::PtoP => TracerEventType::MemcpyP2P,
        _ => TracerEventType::MemcpyOther,
    };
    let mut event = activity_event(event_type, event_type.name().to_string(), r.start, r.end);
    event.device_id = r.device_id;
    event.context_id = r.context_id;
    event.stream_id = r.stream_id;
    event.correlation_id = r.correlation_id;
    attach_annotation(&mut event, collector);
    event.details = EventDetails::Memcpy(MemcpyDetails {
        num_bytes: r.bytes,
        destination: r.device_id,
        is_async: r.is_async,
        copy_kind: r.copy_kind,
        src_mem_kind: r.src_kind,
        dst_mem_kind: r.dst_kind,
    });
    event
}

fn memcpy_p2p_event(r: &MemcpyP2PRecord, collector: &dyn TraceCollector) -> TracerEvent {
    let event_type = TracerEventType::MemcpyP2P;
    let mut event = activity_event(event_type, event_type.name().to_string(), r.start, r.end);
    event.device_id = r.src_device_id;
    event.context_id = r.context_id;
    event.stream_id = r.stream_id;
    event.correlation_id = r.correlation_id;
    attach_annotation(&mut event, collector);
    event.details = EventDetails::Memcpy(MemcpyDetails {
        num_bytes: r.bytes,
        destination: r.dst_device_id,
        is_async: r.is_async,
        copy_kind: r.copy_kind,
        src_mem_kind: r.src_kind,
        dst_mem_kind: r.dst_kind,
    });
    event
}

fn overhead_event(r: &OverheadRecord) -> Option<TracerEvent> {
    let mut event = activity_event(
        TracerEventType::Overhead,
        r.overhead_kind.name().to_string(),
        r.start,
        r.end,
    );
    event.device_id = 0;
    match r.object {
        OverheadObject::Unknown => {
            tracing::trace!("overhead record without object, skipped");
            return None;
        }
        OverheadObject::Thread { thread_id } | OverheadObject::Process { thread_id } => {
            event.thread_id = thread_id;
        }
        OverheadObject::Stream { device_id, stream_id } => {
            event.device_id = device_id;
            event.stream_id = stream_id;
        }
        OverheadObject::Device { device_id } | OverheadObject::Context { device_id } => {
            event.device_id = device_id;
        }
        OverheadObject::Other { kind } => {
            tracing::error!(kind, "unexpected overhead object kind");
            return None;
        }
    }
    Some(event)
}

fn unified_memory_event(r: &UnifiedMemoryRecord) -> TracerEvent {
    let end = if r.counter_kind.is_instantaneous() || r.end <= r.start {
        r.start.saturating_add(1)
    } else {
        r.end
    };
    let mut event = activity_event(
        TracerEventType::UnifiedMemory,
        r.counter_kind.name().to_string(),
        r.start,
        end,
    );
    event.device_id = r.src_id;
    event.stream_id = UNIFIED_MEMORY_STREAM_BASE + r.counter_kind as u32;
    event.details = EventDetails::Memcpy(MemcpyDetails {
        num_bytes: if r.counter_kind.is_byte_transfer() { r.value } else { 0 },
        destination: r.dst_id,
        ..Default::default()
    });
    event
}

fn memory_event(r: &MemoryRecord) -> TracerEvent {
    let mut event = activity_event(
        TracerEventType::MemoryResidency,
        format!("Memory {}", r.memory_kind.name()),
        r.start,
        r.end.max(r.start.saturating_add(1)),
    );
    event.device_id = r.device_id;
    event.context_id = r.context_id;
    event.stream_id = 0;
    event.details = EventDetails::MemoryResidency(MemoryResidencyDetails {
        address: r.address,
        num_bytes: r.bytes,
        mem_kind: r.memory_kind,
    });
    event
}

fn memset_event(r: &MemsetRecord) -> TracerEvent {
    let mut event = activity_event(
        TracerEventType::Memset,
        format!("Memset {}", r.memory_kind.name()),
        r.start,
        r.end.max(r.start.saturating_add(1)),
    );
    event.device_id = r.device_id;
    event.context_id = r.context_id;
    event.stream_id = r.stream_id;
    event.correlation_id = r.correlation_id;
    event.details = EventDetails::Memset(MemsetDetails {
        num_bytes: r.bytes,
        mem_kind: r.memory_kind,
        is_async: r.is_async,
    });
    event
}

fn synchronization_event(r: &SynchronizationRecord) -> TracerEvent {
    let mut event = activity_event(
        TracerEventType::Generic,
        r.sync_type.name().to_string(),
        r.start,
        r.end.max(r.start.saturating_add(1)),
    );
    event.context_id = r.context_id;
    event.stream_id = r.stream_id;
    event.correlation_id = r.correlation_id;
    event
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::annotation::{AnnotationInfo, AnnotationMap};
    use crate::collector::InMemoryCollector;
    use crate::driver::codec;
    use crate::driver::records::{OverheadKind, SynchronizationType, UnifiedMemoryCounterKind};
    use crate::driver::sim::SimulatedDriver;
    use crate::event::{MemoryKind, INVALID_ID};
    use std::sync::Arc;

    fn annotated_collector(correlation_id: u32, annotation: &str) -> InMemoryCollector {
        let collector = InMemoryCollector::default();
        let mut map = AnnotationMap::default();
        map.insert(
            correlation_id,
            AnnotationInfo {
                annotation: Some(Arc::from(annotation)),
                range: Some(Arc::from("fwd")),
            },
        );
        collector.set_annotation_map(map);
        collector
    }

    fn filled_buffer(pipeline: &ActivityPipeline, records: &[ActivityRecord]) -> (ActivityBuffer, usize) {
        let mut buffer = pipeline.request_buffer();
        let bytes = codec::encode_records(records).unwrap();
        let end = codec::write_frame(buffer.as_mut_slice(), 0, &bytes).unwrap();
        (buffer, end)
    }

    #[test]
    fn test_kernel_record_gets_annotation() {
        let collector = annotated_collector(42, "train_step");
        let record = ActivityRecord::ConcurrentKernel(KernelRecord {
            name: "gemm".to_string(),
            correlation_id: 42,
            block: [128, 1, 1],
            grid: [64, 2, 1],
            start: 10,
            end: 20,
            ..Default::default()
        });
        let event = convert_record(&record, &collector).unwrap();
        assert_eq!(event.event_type, TracerEventType::Kernel);
        assert_eq!(event.annotation, "train_step");
        assert_eq!(event.range, "fwd");
        assert_eq!(event.source, TracerEventSource::Activity);
        match event.details {
            EventDetails::Kernel(k) => assert_eq!((k.block_x, k.grid_y), (128, 2)),
            other => panic!("unexpected details {other:?}"),
        }
    }

    #[test]
    fn test_memcpy_copy_kinds() {
        let collector = InMemoryCollector::default();
        let cases = [
            (MemcpyKind::HtoD, TracerEventType::MemcpyH2D),
            (MemcpyKind::DtoH, TracerEventType::MemcpyD2H),
            (MemcpyKind::DtoD, TracerEventType::MemcpyD2D),
            (MemcpyKind::PtoP, TracerEventType::MemcpyP2P),
            (MemcpyKind::HtoA, TracerEventType::MemcpyOther),
        ];
        for (copy_kind, expected) in cases {
            let record = ActivityRecord::Memcpy(MemcpyRecord {
                copy_kind,
                bytes: 8,
                device_id: 3,
                is_async: true,
                ..Default::default()
            });
            let event = convert_record(&record, &collector).unwrap();
            assert_eq!(event.event_type, expected);
            assert_eq!(event.name, expected.name());
            assert_eq!(event.num_bytes(), Some(8));
        }
    }

    #[test]
    fn test_p2p_uses_source_and_destination_devices() {
        let collector = InMemoryCollector::default();
        let record = ActivityRecord::MemcpyP2P(MemcpyP2PRecord {
            src_device_id: 1,
            dst_device_id: 2,
            bytes: 1 << 20,
            ..Default::default()
        });
        let event = convert_record(&record, &collector).unwrap();
        assert_eq!(event.device_id, 1);
        assert!(matches!(event.details, EventDetails::Memcpy(d) if d.destination == 2));
    }

    #[test]
    fn test_overhead_attribution() {
        let make = |object| ActivityRecord::Overhead(OverheadRecord {
            overhead_kind: OverheadKind::BufferFlush,
            object,
            start: 1,
            end: 5,
        });
        let collector = InMemoryCollector::default();

        let thread = convert_record(&make(OverheadObject::Thread { thread_id: 9 }), &collector).unwrap();
        assert_eq!(thread.name, "BUFFER_FLUSH");
        assert_eq!(thread.thread_id, 9);
        assert_eq!(thread.device_id, 0);

        let stream = convert_record(
            &make(OverheadObject::Stream { device_id: 2, stream_id: 7 }),
            &collector,
        )
        .unwrap();
        assert_eq!((stream.device_id, stream.stream_id), (2, 7));

        assert!(convert_record(&make(OverheadObject::Unknown), &collector).is_none());
        assert!(convert_record(&make(OverheadObject::Other { kind: 12 }), &collector).is_none());
    }

    #[test]
    fn test_unified_memory_rules() {
        let collector = InMemoryCollector::default();
        let fault = ActivityRecord::UnifiedMemoryCounter(UnifiedMemoryRecord {
            counter_kind: UnifiedMemoryCounterKind::CpuPageFaultCount,
            value: 17,
            start: 100,
            end: 500,
            src_id: 0,
            dst_id: 1,
        });
        let event = convert_record(&fault, &collector).unwrap();
        assert_eq!(event.end_time_ns, 101);
        assert_eq!(event.stream_id, UNIFIED_MEMORY_STREAM_BASE + 3);
        assert_eq!(event.num_bytes(), Some(0));

        let transfer = ActivityRecord::UnifiedMemoryCounter(UnifiedMemoryRecord {
            counter_kind: UnifiedMemoryCounterKind::BytesTransferHtoD,
            value: 4096,
            start: 100,
            end: 300,
            src_id: 0,
            dst_id: 1,
        });
        let event = convert_record(&transfer, &collector).unwrap();
        assert_eq!(event.name, "UM_BYTES_TRANSFER_HTOD");
        assert_eq!(event.end_time_ns, 300);
        assert_eq!(event.num_bytes(), Some(4096));
    }

    #[test]
    fn test_zero_length_records_get_minimum_duration() {
        let collector = InMemoryCollector::default();
        let memory = convert_record(
            &ActivityRecord::Memory(MemoryRecord {
                memory_kind: MemoryKind::Device,
                start: 50,
                end: 50,
                ..Default::default()
            }),
            &collector,
        )
        .unwrap();
        assert_eq!(memory.name, "Memory Device");
        assert_eq!(memory.event_type, TracerEventType::MemoryResidency);
        assert_eq!(memory.end_time_ns, 51);

        let sync = convert_record(
            &ActivityRecord::Synchronization(SynchronizationRecord {
                sync_type: SynchronizationType::StreamSynchronize,
                start: 7,
                end: 3,
                ..Default::default()
            }),
            &collector,
        )
        .unwrap();
        assert_eq!(sync.event_type, TracerEventType::Generic);
        assert_eq!(sync.name, "cuStreamSynchronize");
        assert_eq!(sync.end_time_ns, 8);
        assert_eq!(sync.thread_id, INVALID_ID);
    }

    #[test]
    fn test_process_then_finalize() {
        let driver = SimulatedDriver::default();
        let pipeline = ActivityPipeline::new(BufferPoolConfig::new(4096));
        pipeline.start(0);

        let records = vec![
            ActivityRecord::Kernel(KernelRecord::default()),
            ActivityRecord::Other { kind: 99 },
            ActivityRecord::Memset(MemsetRecord::default()),
        ];
        let (buffer, valid) = filled_buffer(&pipeline, &records);
        pipeline.process_buffer(&driver, None, 0, buffer, valid).unwrap();
        assert_eq!(pipeline.queued_buffers(), 1);
        assert_eq!(pipeline.stats().estimated_events, valid.div_ceil(ESTIMATED_RECORD_SIZE));

        let collector = InMemoryCollector::default();
        assert_eq!(pipeline.finalize(&driver, &collector), 2);
        assert_eq!(pipeline.queued_buffers(), 0);
        assert_eq!(pipeline.pool().available(), 1);
    }

    #[test]
    fn test_buffers_after_stop_are_reclaimed() {
        let driver = SimulatedDriver::default();
        let pipeline = ActivityPipeline::new(BufferPoolConfig::new(4096));
        let (buffer, valid) = filled_buffer(&pipeline, &[ActivityRecord::Kernel(KernelRecord::default())]);

        pipeline.process_buffer(&driver, None, 0, buffer, valid).unwrap();
        assert_eq!(pipeline.queued_buffers(), 0);
        assert_eq!(pipeline.pool().available(), 1);
    }

    #[test]
    fn test_cap_recycles_buffers_unread() {
        let driver = SimulatedDriver::default();
        let pipeline = ActivityPipeline::new(BufferPoolConfig::new(4096));
        pipeline.start(1);

        let records = [ActivityRecord::Kernel(KernelRecord::default())];
        let (first, first_len) = filled_buffer(&pipeline, &records);
        let (second, second_len) = filled_buffer(&pipeline, &records);
        pipeline.process_buffer(&driver, None, 0, first, first_len).unwrap();
        pipeline.process_buffer(&driver, None, 0, second, second_len).unwrap();

        let stats = pipeline.stats();
        assert_eq!(stats.queued_buffers, 1);
        assert_eq!(stats.estimated_dropped, second_len.div_ceil(ESTIMATED_RECORD_SIZE));
    }

    #[test]
    fn test_driver_dropped_records_are_counted() {
        let driver = SimulatedDriver::default();
        driver.inject_dropped_records(5);
        let pipeline = ActivityPipeline::new(BufferPoolConfig::new(4096));
        pipeline.start(0);

        let (buffer, valid) = filled_buffer(&pipeline, &[ActivityRecord::Kernel(KernelRecord::default())]);
        pipeline.process_buffer(&driver, None, 0, buffer, valid).unwrap();
        assert_eq!(pipeline.stats().driver_dropped, 5);
    }

    #[test]
    fn test_corrupt_record_keeps_earlier_events() {
        let driver = SimulatedDriver::default();
        let collector = InMemoryCollector::default();
        let mut bytes = codec::encode_record(&ActivityRecord::Kernel(KernelRecord::default())).unwrap();
        bytes.extend_from_slice(&[200, 0, 0, 0, 1, 2, 3]);

        let err = convert_buffer(&driver, &collector, &bytes).unwrap_err();
        assert!(matches!(err, TracerError::Internal(_)));
        assert_eq!(collector.num_events(), 1);
    }

    #[test]
    fn test_exhausted_pool_hands_out_empty_buffer() {
        let pipeline = ActivityPipeline::new(BufferPoolConfig::new(1024).with_max_buffers(1));
        let _held = pipeline.request_buffer();
        assert!(pipeline.request_buffer().is_empty());
    }
}
