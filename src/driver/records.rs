//! Typed device activity records
//!
//! Kind numbering follows the vendor's activity kind ids so that records
//! written by one side and read by the other agree on the meaning of a kind.

use crate::event::{MemcpyKind, MemoryKind};
use serde::{Deserialize, Serialize};
use strum::FromRepr;

/// Activity record categories that can be enabled for collection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, FromRepr, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(u32)]
pub enum ActivityKind {
    Memcpy = 1,
    Memset = 2,
    Kernel = 3,
    Driver = 4,
    Runtime = 5,
    ConcurrentKernel = 10,
    Overhead = 17,
    CdpKernel = 18,
    Memcpy2 = 22,
    UnifiedMemoryCounter = 25,
    Synchronization = 38,
    Memory = 45,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum OverheadKind {
    #[default]
    Unknown,
    DriverCompiler,
    BufferFlush,
    Instrumentation,
    Resource,
}

impl OverheadKind {
    pub fn name(self) -> &'static str {
        match self {
            OverheadKind::Unknown => "<UNKNOWN>",
            OverheadKind::DriverCompiler => "COMPILER",
            OverheadKind::BufferFlush => "BUFFER_FLUSH",
            OverheadKind::Instrumentation => "INSTRUMENTATION",
            OverheadKind::Resource => "RESOURCE",
        }
    }
}

/// Object an overhead record is attributed to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OverheadObject {
    Unknown,
    Process { thread_id: u32 },
    Thread { thread_id: u32 },
    Device { device_id: u32 },
    Context { device_id: u32 },
    Stream { device_id: u32, stream_id: u32 },
    /// Any object kind the tracer has no attribution rule for
    Other { kind: u32 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, FromRepr, Serialize, Deserialize)]
#[repr(u32)]
pub enum UnifiedMemoryCounterKind {
    Unknown = 0,
    BytesTransferHtoD = 1,
    BytesTransferDtoH = 2,
    CpuPageFaultCount = 3,
    GpuPageFault = 4,
    Thrashing = 5,
    Throttling = 6,
    RemoteMap = 7,
    BytesTransferDtoD = 8,
}

impl UnifiedMemoryCounterKind {
    pub fn name(self) -> &'static str {
        match self {
            UnifiedMemoryCounterKind::Unknown => "UM_UNKNOWN",
            UnifiedMemoryCounterKind::BytesTransferHtoD => "UM_BYTES_TRANSFER_HTOD",
            UnifiedMemoryCounterKind::BytesTransferDtoH => "UM_BYTES_TRANSFER_DTOH",
            UnifiedMemoryCounterKind::CpuPageFaultCount => "UM_CPU_PAGE_FAULT",
            UnifiedMemoryCounterKind::GpuPageFault => "UM_GPU_PAGE_FAULT",
            UnifiedMemoryCounterKind::Thrashing => "UM_THRASHING",
            UnifiedMemoryCounterKind::Throttling => "UM_THROTTLING",
            UnifiedMemoryCounterKind::RemoteMap => "UM_REMOTE_MAP",
            UnifiedMemoryCounterKind::BytesTransferDtoD => "UM_BYTES_TRANSFER_DTOD",
        }
    }

    /// Counters whose value is a byte count
    pub fn is_byte_transfer(self) -> bool {
        matches!(
            self,
            UnifiedMemoryCounterKind::BytesTransferHtoD
                | UnifiedMemoryCounterKind::BytesTransferDtoH
                | UnifiedMemoryCounterKind::BytesTransferDtoD
        )
    }

    /// Counters that describe an instant rather than an interval
    pub fn is_instantaneous(self) -> bool {
        matches!(
            self,
            UnifiedMemoryCounterKind::CpuPageFaultCount
                | UnifiedMemoryCounterKind::Thrashing
                | UnifiedMemoryCounterKind::RemoteMap
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum SynchronizationType {
    #[default]
    Unknown,
    EventSynchronize,
    StreamWaitEvent,
    StreamSynchronize,
    ContextSynchronize,
}

impl SynchronizationType {
    pub fn name(self) -> &'static str {
        match self {
            SynchronizationType::Unknown => "unknown synchronization event",
            SynchronizationType::EventSynchronize => "cuEventSynchronize",
            SynchronizationType::StreamWaitEvent => "cuStreamWaitEvent",
            SynchronizationType::StreamSynchronize => "cuStreamSynchronize",
            SynchronizationType::ContextSynchronize => "cuCtxSynchronize",
        }
    }
}

/// Per-counter enable switch for unified memory collection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UnifiedMemoryCounterConfig {
    pub kind: UnifiedMemoryCounterKind,
    pub device_id: u32,
    pub enable: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct KernelRecord {
    pub name: String,
    pub start: u64,
    pub end: u64,
    pub device_id: u32,
    pub context_id: u32,
    pub stream_id: u32,
    pub correlation_id: u32,
    pub registers_per_thread: u32,
    pub static_shared_memory: u32,
    pub dynamic_shared_memory: u32,
    pub block: [u32; 3],
    pub grid: [u32; 3],
    pub channel_id: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct MemcpyRecord {
    pub copy_kind: MemcpyKind,
    pub src_kind: MemoryKind,
    pub dst_kind: MemoryKind,
    pub bytes: u64,
    pub start: u64,
    pub end: u64,
    pub device_id: u32,
    pub context_id: u32,
    pub stream_id: u32,
    pub correlation_id: u32,
    pub is_async: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct MemcpyP2PRecord {
    pub copy_kind: MemcpyKind,
    pub src_kind: MemoryKind,
    pub dst_kind: MemoryKind,
    pub bytes: u64,
    pub start: u64,
    pub end: u64,
    pub src_device_id: u32,
    pub dst_device_id: u32,
    pub context_id: u32,
    pub stream_id: u32,
    pub correlation_id: u32,
    pub is_async: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OverheadRecord {
    pub overhead_kind: OverheadKind,
    pub object: OverheadObject,
    pub start: u64,
    pub end: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnifiedMemoryRecord {
    pub counter_kind: UnifiedMemoryCounterKind,
    pub value: u64,
    pub start: u64,
    pub end: u64,
    pub src_id: u32,
    pub dst_id: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct MemoryRecord {
    pub memory_kind: MemoryKind,
    pub address: u64,
    pub bytes: u64,
    pub start: u64,
    pub end: u64,
    pub device_id: u32,
    pub context_id: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct MemsetRecord {
    pub memory_kind: MemoryKind,
    pub bytes: u64,
    pub start: u64,
    pub end: u64,
    pub device_id: u32,
    pub context_id: u32,
    pub stream_id: u32,
    pub correlation_id: u32,
    pub is_async: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SynchronizationRecord {
    pub sync_type: SynchronizationType,
    pub start: u64,
    pub end: u64,
    pub correlation_id: u32,
    pub context_id: u32,
    pub stream_id: u32,
}

/// One device activity record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ActivityRecord {
    Kernel(KernelRecord),
    ConcurrentKernel(KernelRecord),
    CdpKernel(KernelRecord),
    Memcpy(MemcpyRecord),
    MemcpyP2P(MemcpyP2PRecord),
    Overhead(OverheadRecord),
    UnifiedMemoryCounter(UnifiedMemoryRecord),
    Memory(MemoryRecord),
    Memset(MemsetRecord),
    Synchronization(SynchronizationRecord),
    /// A record of a kind the tracer does not convert
    Other { kind: u32 },
}

impl ActivityRecord {
    /// Numeric activity kind of the record
    pub fn kind_id(&self) -> u32 {
        let kind = match self {
            ActivityRecord::Kernel(_) => ActivityKind::Kernel,
            ActivityRecord::ConcurrentKernel(_) => ActivityKind::ConcurrentKernel,
            ActivityRecord::CdpKernel(_) => ActivityKind::CdpKernel,
            ActivityRecord::Memcpy(_) => ActivityKind::Memcpy,
            ActivityRecord::MemcpyP2P(_) => ActivityKind::Memcpy2,
            ActivityRecord::Overhead(_) => ActivityKind::Overhead,
            ActivityRecord::UnifiedMemoryCounter(_) => ActivityKind::UnifiedMemoryCounter,
            ActivityRecord::Memory(_) => ActivityKind::Memory,
            ActivityRecord::Memset(_) => ActivityKind::Memset,
            ActivityRecord::Synchronization(_) => ActivityKind::Synchronization,
            ActivityRecord::Other { kind } => return *kind,
        };
        kind as u32
    }

    pub fn kind(&self) -> Option<ActivityKind> {
        ActivityKind::from_repr(self.kind_id())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_ids_match_vendor_numbering() {
        assert_eq!(ActivityKind::ConcurrentKernel as u32, 10);
        assert_eq!(ActivityKind::UnifiedMemoryCounter as u32, 25);
        assert_eq!(ActivityKind::from_repr(45), Some(ActivityKind::Memory));
    }

    #[test]
    fn test_record_kind() {
        let record = ActivityRecord::MemcpyP2P(MemcpyP2PRecord::default());
        assert_eq!(record.kind(), Some(ActivityKind::Memcpy2));

        let unknown = ActivityRecord::Other { kind: 99 };
        assert_eq!(unknown.kind_id(), 99);
        assert_eq!(unknown.kind(), None);
    }

    #[test]
    fn test_unified_memory_counter_classes() {
        assert!(UnifiedMemoryCounterKind::BytesTransferDtoD.is_byte_transfer());
        assert!(!UnifiedMemoryCounterKind::GpuPageFault.is_byte_transfer());
        assert!(UnifiedMemoryCounterKind::Thrashing.is_instantaneous());
        assert_eq!(UnifiedMemoryCounterKind::CpuPageFaultCount.name(), "UM_CPU_PAGE_FAULT");
    }

    #[test]
    fn test_activity_kind_config_names() {
        let kind: ActivityKind = serde_json::from_str("\"concurrent_kernel\"").unwrap();
        assert_eq!(kind, ActivityKind::ConcurrentKernel);
    }
}
