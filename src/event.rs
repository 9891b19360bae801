//! Normalized tracer events
//!
//! Both driver API callbacks and device activity records are converted into
//! [`TracerEvent`], the single event shape handed to a collector.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Id value for fields that are not known for an event
pub const INVALID_ID: u32 = u32::MAX;

/// Stream id base for unified memory counter events
pub const UNIFIED_MEMORY_STREAM_BASE: u32 = 0x1000_0000;

/// Category of a tracer event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TracerEventType {
    #[default]
    Unsupported,
    Kernel,
    MemcpyH2D,
    MemcpyD2H,
    MemcpyD2D,
    MemcpyP2P,
    MemcpyOther,
    MemoryAlloc,
    MemoryFree,
    Memset,
    Overhead,
    UnifiedMemory,
    Generic,
    MemoryResidency,
    HostRegister,
    HostUnregister,
}

impl TracerEventType {
    /// Display name used in trace output; kernels show up as "Compute"
    pub fn name(self) -> &'static str {
        match self {
            TracerEventType::Unsupported => "",
            TracerEventType::Kernel => "Compute",
            TracerEventType::MemcpyH2D => "MemcpyH2D",
            TracerEventType::MemcpyD2H => "MemcpyD2H",
            TracerEventType::MemcpyD2D => "MemcpyD2D",
            TracerEventType::MemcpyP2P => "MemcpyP2P",
            TracerEventType::MemcpyOther => "MemcpyOther",
            TracerEventType::MemoryAlloc => "MemoryAlloc",
            TracerEventType::MemoryFree => "MemoryFree",
            TracerEventType::Memset => "Memset",
            TracerEventType::Overhead => "Overhead",
            TracerEventType::UnifiedMemory => "UnifiedMemory",
            TracerEventType::Generic => "Generic",
            TracerEventType::MemoryResidency => "MemoryResidency",
            TracerEventType::HostRegister => "HostRegister",
            TracerEventType::HostUnregister => "HostUnregister",
        }
    }

    pub fn is_memcpy(self) -> bool {
        matches!(
            self,
            TracerEventType::MemcpyH2D
                | TracerEventType::MemcpyD2H
                | TracerEventType::MemcpyD2D
                | TracerEventType::MemcpyP2P
                | TracerEventType::MemcpyOther
        )
    }
}

impl fmt::Display for TracerEventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Where an event came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TracerEventSource {
    /// Reserved slot that was never filled in
    #[default]
    Invalid,
    DriverCallback,
    Activity,
}

/// Direction of a memory copy as reported by the device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemcpyKind {
    #[default]
    Unknown,
    HtoD,
    DtoH,
    HtoA,
    AtoH,
    AtoA,
    AtoD,
    DtoA,
    DtoD,
    HtoH,
    PtoP,
}

/// Kind of memory on either side of a transfer or allocation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemoryKind {
    #[default]
    Unknown,
    Pageable,
    Pinned,
    Device,
    Array,
    Managed,
    DeviceStatic,
    ManagedStatic,
}

impl MemoryKind {
    pub fn name(self) -> &'static str {
        match self {
            MemoryKind::Unknown => "Unknown",
            MemoryKind::Pageable => "Pageable",
            MemoryKind::Pinned => "Pinned",
            MemoryKind::Device => "Device",
            MemoryKind::Array => "Array",
            MemoryKind::Managed => "Managed",
            MemoryKind::DeviceStatic => "DeviceStatic",
            MemoryKind::ManagedStatic => "ManagedStatic",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct KernelDetails {
    pub registers_per_thread: u32,
    pub static_shared_memory_usage: u32,
    pub dynamic_shared_memory_usage: u32,
    pub block_x: u32,
    pub block_y: u32,
    pub block_z: u32,
    pub grid_x: u32,
    pub grid_y: u32,
    pub grid_z: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct MemcpyDetails {
    pub num_bytes: u64,
    /// Device on the receiving side of the copy
    pub destination: u32,
    pub is_async: bool,
    pub copy_kind: MemcpyKind,
    pub src_mem_kind: MemoryKind,
    pub dst_mem_kind: MemoryKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct MemsetDetails {
    pub num_bytes: u64,
    pub mem_kind: MemoryKind,
    pub is_async: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct MemAllocDetails {
    pub address: u64,
    pub num_bytes: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct MemFreeDetails {
    pub address: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct HostRegisterDetails {
    pub address: u64,
    pub num_bytes: u64,
    pub flags: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct HostUnregisterDetails {
    pub address: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct MemoryResidencyDetails {
    pub address: u64,
    pub num_bytes: u64,
    pub mem_kind: MemoryKind,
}

/// Kind-specific payload of a [`TracerEvent`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EventDetails {
    #[default]
    None,
    Kernel(KernelDetails),
    Memcpy(MemcpyDetails),
    Memset(MemsetDetails),
    MemAlloc(MemAllocDetails),
    MemFree(MemFreeDetails),
    HostRegister(HostRegisterDetails),
    HostUnregister(HostUnregisterDetails),
    MemoryResidency(MemoryResidencyDetails),
}

/// A single traced GPU operation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TracerEvent {
    pub event_type: TracerEventType,
    pub source: TracerEventSource,
    /// Kernel symbol or driver function name
    pub name: String,
    /// Annotation scope active when the call was made
    #[serde(skip_serializing_if = "String::is_empty", default)]
    pub annotation: String,
    /// Named range active when the call was made
    #[serde(skip_serializing_if = "String::is_empty", default)]
    pub range: String,
    pub start_time_ns: u64,
    pub end_time_ns: u64,
    pub device_id: u32,
    pub correlation_id: u32,
    pub thread_id: u32,
    pub context_id: u32,
    pub stream_id: u32,
    pub details: EventDetails,
}

impl Default for TracerEvent {
    fn default() -> Self {
        Self {
            event_type: TracerEventType::Unsupported,
            source: TracerEventSource::Invalid,
            name: String::new(),
            annotation: String::new(),
            range: String::new(),
            start_time_ns: 0,
            end_time_ns: 0,
            device_id: 0,
            correlation_id: INVALID_ID,
            thread_id: INVALID_ID,
            context_id: INVALID_ID,
            stream_id: INVALID_ID,
            details: EventDetails::None,
        }
    }
}

impl TracerEvent {
    pub fn duration_ns(&self) -> u64 {
        self.end_time_ns.saturating_sub(self.start_time_ns)
    }

    /// Bytes moved or touched by the event, when its kind carries a size
    pub fn num_bytes(&self) -> Option<u64> {
        match self.details {
            EventDetails::Memcpy(d) => Some(d.num_bytes),
            EventDetails::Memset(d) => Some(d.num_bytes),
            EventDetails::MemAlloc(d) => Some(d.num_bytes),
            EventDetails::HostRegister(d) => Some(d.num_bytes),
            EventDetails::MemoryResidency(d) => Some(d.num_bytes),
            _ => None,
        }
    }

    /// True once a decoder has populated the event
    pub fn is_populated(&self) -> bool {
        self.source != TracerEventSource::Invalid
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_type_names() {
        assert_eq!(TracerEventType::Kernel.name(), "Compute");
        assert_eq!(TracerEventType::MemcpyP2P.name(), "MemcpyP2P");
        assert_eq!(TracerEventType::MemoryResidency.name(), "MemoryResidency");
        assert_eq!(TracerEventType::Unsupported.name(), "");
        assert_eq!(TracerEventType::HostUnregister.to_string(), "HostUnregister");
    }

    #[test]
    fn test_default_event_is_unpopulated() {
        let event = TracerEvent::default();
        assert!(!event.is_populated());
        assert_eq!(event.correlation_id, INVALID_ID);
        assert_eq!(event.thread_id, INVALID_ID);
        assert_eq!(event.num_bytes(), None);
    }

    #[test]
    fn test_duration_saturates() {
        let event = TracerEvent {
            start_time_ns: 10,
            end_time_ns: 4,
            ..Default::default()
        };
        assert_eq!(event.duration_ns(), 0);
    }

    #[test]
    fn test_num_bytes_from_details() {
        let event = TracerEvent {
            event_type: TracerEventType::MemcpyH2D,
            details: EventDetails::Memcpy(MemcpyDetails {
                num_bytes: 4096,
                ..Default::default()
            }),
            ..Default::default()
        };
        assert_eq!(event.num_bytes(), Some(4096));
        assert!(event.event_type.is_memcpy());
    }

    #[test]
    fn test_json_shape() {
        let event = TracerEvent {
            event_type: TracerEventType::Kernel,
            source: TracerEventSource::Activity,
            name: "gemm".to_string(),
            details: EventDetails::Kernel(KernelDetails {
                grid_x: 8,
                ..Default::default()
            }),
            ..Default::default()
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event_type"], "kernel");
        assert_eq!(json["source"], "activity");
        assert_eq!(json["details"]["kind"], "kernel");
        assert_eq!(json["details"]["grid_x"], 8);
        assert!(json.get("annotation").is_none());
    }
}
