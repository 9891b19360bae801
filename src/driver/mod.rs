//! Typed boundary to the GPU driver and its tracing layer
//!
//! Everything the tracer needs from the vendor stack goes through
//! [`DriverInterface`]. Raw callback payloads are exposed as the typed
//! [`DriverCallArgs`] enum and activity records as [`records::ActivityRecord`],
//! so no decoder ever reinterprets untyped memory.

pub mod codec;
pub mod records;
pub mod sim;

use crate::buffer_pool::ActivityBuffer;
use crate::error::DriverResult;
use records::{ActivityKind, ActivityRecord, UnifiedMemoryCounterConfig};
use serde::{Deserialize, Serialize};
use std::cell::Cell;
use std::sync::Arc;
use strum::{EnumIter, FromRepr, IntoEnumIterator};

/// Numeric id of a callback within its domain
pub type CallbackId = u32;

/// Opaque handle of a device context
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ContextHandle(pub u64);

/// Handle returned by [`DriverInterface::subscribe`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriberHandle(pub u64);

/// Callback domains exposed by the tracing layer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CallbackDomain {
    DriverApi,
    RuntimeApi,
    Resource,
    /// Named range push/pop calls
    Range,
}

/// Whether a callback fires before or after the driver call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallbackSite {
    Enter,
    Exit,
}

/// Driver API calls the tracer understands, keyed by callback id.
///
/// Ids not listed here are still delivered and recorded as generic events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, FromRepr, EnumIter, Serialize, Deserialize)]
#[serde(try_from = "String", into = "&'static str")]
#[repr(u32)]
pub enum DriverApi {
    CtxCreate = 1,
    CtxDestroy,
    CtxSynchronize,
    ModuleLoad,
    StreamSynchronize,
    EventSynchronize,
    LaunchKernel,
    LaunchKernelEx,
    LaunchCooperativeKernel,
    LaunchCooperativeKernelMultiDevice,
    Memcpy,
    MemcpyAsync,
    MemcpyHtoD,
    MemcpyHtoDAsync,
    MemcpyDtoH,
    MemcpyDtoHAsync,
    MemcpyDtoD,
    MemcpyDtoDAsync,
    MemcpyAtoH,
    MemcpyAtoHAsync,
    MemcpyAtoD,
    MemcpyDtoA,
    MemcpyAtoA,
    MemcpyHtoA,
    MemcpyHtoAAsync,
    Memcpy2D,
    Memcpy2DUnaligned,
    Memcpy2DAsync,
    Memcpy3D,
    Memcpy3DAsync,
    MemcpyPeer,
    MemcpyPeerAsync,
    MemAlloc,
    MemAllocPitch,
    MemAllocManaged,
    MemAllocHost,
    MemHostAlloc,
    MemFree,
    MemFreeHost,
    MemHostRegister,
    MemHostUnregister,
    MemsetD8,
    MemsetD16,
    MemsetD32,
    MemsetD8Async,
    MemsetD16Async,
    MemsetD32Async,
    MemsetD2D8,
    MemsetD2D16,
    MemsetD2D32,
    MemsetD2D8Async,
    MemsetD2D16Async,
    MemsetD2D32Async,
}

impl DriverApi {
    pub fn from_id(id: CallbackId) -> Option<Self> {
        Self::from_repr(id)
    }

    pub fn id(self) -> CallbackId {
        self as CallbackId
    }

    /// Exported driver function name, also used in config files
    pub fn function_name(self) -> &'static str {
        match self {
            DriverApi::CtxCreate => "cuCtxCreate",
            DriverApi::CtxDestroy => "cuCtxDestroy",
            DriverApi::CtxSynchronize => "cuCtxSynchronize",
            DriverApi::ModuleLoad => "cuModuleLoad",
            DriverApi::StreamSynchronize => "cuStreamSynchronize",
            DriverApi::EventSynchronize => "cuEventSynchronize",
            DriverApi::LaunchKernel => "cuLaunchKernel",
            DriverApi::LaunchKernelEx => "cuLaunchKernelEx",
            DriverApi::LaunchCooperativeKernel => "cuLaunchCooperativeKernel",
            DriverApi::LaunchCooperativeKernelMultiDevice => "cuLaunchCooperativeKernelMultiDevice",
            DriverApi::Memcpy => "cuMemcpy",
            DriverApi::MemcpyAsync => "cuMemcpyAsync",
            DriverApi::MemcpyHtoD => "cuMemcpyHtoD",
            DriverApi::MemcpyHtoDAsync => "cuMemcpyHtoDAsync",
            DriverApi::MemcpyDtoH => "cuMemcpyDtoH",
            DriverApi::MemcpyDtoHAsync => "cuMemcpyDtoHAsync",
            DriverApi::MemcpyDtoD => "cuMemcpyDtoD",
            DriverApi::MemcpyDtoDAsync => "cuMemcpyDtoDAsync",
            DriverApi::MemcpyAtoH => "cuMemcpyAtoH",
            DriverApi::MemcpyAtoHAsync => "cuMemcpyAtoHAsync",
            DriverApi::MemcpyAtoD => "cuMemcpyAtoD",
            DriverApi::MemcpyDtoA => "cuMemcpyDtoA",
            DriverApi::MemcpyAtoA => "cuMemcpyAtoA",
            DriverApi::MemcpyHtoA => "cuMemcpyHtoA",
            DriverApi::MemcpyHtoAAsync => "cuMemcpyHtoAAsync",
            DriverApi::Memcpy2D => "cuMemcpy2D",
            DriverApi::Memcpy2DUnaligned => "cuMemcpy2DUnaligned",
            DriverApi::Memcpy2DAsync => "cuMemcpy2DAsync",
            DriverApi::Memcpy3D => "cuMemcpy3D",
            DriverApi::Memcpy3DAsync => "cuMemcpy3DAsync",
            DriverApi::MemcpyPeer => "cuMemcpyPeer",
            DriverApi::MemcpyPeerAsync => "cuMemcpyPeerAsync",
            DriverApi::MemAlloc => "cuMemAlloc",
            DriverApi::MemAllocPitch => "cuMemAllocPitch",
            DriverApi::MemAllocManaged => "cuMemAllocManaged",
            DriverApi::MemAllocHost => "cuMemAllocHost",
            DriverApi::MemHostAlloc => "cuMemHostAlloc",
            DriverApi::MemFree => "cuMemFree",
            DriverApi::MemFreeHost => "cuMemFreeHost",
            DriverApi::MemHostRegister => "cuMemHostRegister",
            DriverApi::MemHostUnregister => "cuMemHostUnregister",
            DriverApi::MemsetD8 => "cuMemsetD8",
            DriverApi::MemsetD16 => "cuMemsetD16",
            DriverApi::MemsetD32 => "cuMemsetD32",
            DriverApi::MemsetD8Async => "cuMemsetD8Async",
            DriverApi::MemsetD16Async => "cuMemsetD16Async",
            DriverApi::MemsetD32Async => "cuMemsetD32Async",
            DriverApi::MemsetD2D8 => "cuMemsetD2D8",
            DriverApi::MemsetD2D16 => "cuMemsetD2D16",
            DriverApi::MemsetD2D32 => "cuMemsetD2D32",
            DriverApi::MemsetD2D8Async => "cuMemsetD2D8Async",
            DriverApi::MemsetD2D16Async => "cuMemsetD2D16Async",
            DriverApi::MemsetD2D32Async => "cuMemsetD2D32Async",
        }
    }

    pub fn from_function_name(name: &str) -> Option<Self> {
        Self::iter().find(|api| api.function_name() == name)
    }
}

impl From<DriverApi> for &'static str {
    fn from(api: DriverApi) -> Self {
        api.function_name()
    }
}

impl TryFrom<String> for DriverApi {
    type Error = String;

    fn try_from(name: String) -> Result<Self, Self::Error> {
        Self::from_function_name(&name).ok_or_else(|| format!("unknown driver API '{name}'"))
    }
}

/// Callback ids in the [`CallbackDomain::Range`] domain
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, FromRepr)]
#[repr(u32)]
pub enum RangeApi {
    Push = 1,
    Pop = 2,
}

/// Memory type of a copy endpoint as described by the caller
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryType {
    Host,
    Device,
    Array,
    Unified,
}

/// Typed parameters of an intercepted driver call
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum DriverCallArgs {
    #[default]
    None,
    Memcpy {
        byte_count: u64,
    },
    Memcpy2D {
        width_in_bytes: u64,
        height: u64,
        src_memory_type: MemoryType,
        dst_memory_type: MemoryType,
    },
    Memcpy3D {
        width_in_bytes: u64,
        height: u64,
        depth: u64,
        src_memory_type: MemoryType,
        dst_memory_type: MemoryType,
    },
    MemcpyPeer {
        byte_count: u64,
        src_context: ContextHandle,
        dst_context: ContextHandle,
    },
    /// Element count for 1D memsets
    Memset {
        count: u64,
    },
    Memset2D {
        dst_pitch: u64,
        height: u64,
    },
    MemAlloc {
        address: u64,
        byte_size: u64,
    },
    MemAllocPitch {
        address: u64,
        pitch: u64,
        height: u64,
    },
    MemHostAlloc {
        address: u64,
        byte_size: u64,
        flags: u32,
    },
    MemFree {
        address: u64,
    },
    MemHostRegister {
        address: u64,
        byte_size: u64,
        flags: u32,
    },
    MemHostUnregister {
        address: u64,
    },
    RangePush {
        message: String,
    },
}

/// Payload delivered with every callback
#[derive(Debug)]
pub struct CallbackData<'a> {
    pub site: CallbackSite,
    pub function_name: &'a str,
    /// Kernel symbol for launch calls
    pub symbol_name: Option<&'a str>,
    pub context: Option<ContextHandle>,
    pub context_uid: u32,
    pub correlation_id: u32,
    pub args: &'a DriverCallArgs,
    /// Scratch slot carried from the enter callback to the exit callback
    pub correlation_data: &'a Cell<u64>,
}

/// Receiver of driver callbacks and activity buffer requests.
pub trait DriverSubscriber: Send + Sync {
    fn on_callback(&self, domain: CallbackDomain, cbid: CallbackId, data: &CallbackData<'_>);

    /// Hand the driver an empty buffer to fill; a zero-length buffer means none available
    fn request_buffer(&self) -> ActivityBuffer;

    /// Return a buffer filled with `valid_size` bytes of records
    fn buffer_completed(
        &self,
        context: Option<ContextHandle>,
        stream_id: u32,
        buffer: ActivityBuffer,
        valid_size: usize,
    );
}

/// Operations the tracer needs from the driver and its tracing layer.
pub trait DriverInterface: Send + Sync {
    fn subscribe(&self, subscriber: Arc<dyn DriverSubscriber>) -> DriverResult<SubscriberHandle>;
    fn unsubscribe(&self, handle: SubscriberHandle) -> DriverResult<()>;
    fn enable_callback(
        &self,
        enable: bool,
        handle: SubscriberHandle,
        domain: CallbackDomain,
        cbid: CallbackId,
    ) -> DriverResult<()>;
    fn enable_domain(&self, enable: bool, handle: SubscriberHandle, domain: CallbackDomain) -> DriverResult<()>;

    fn activity_register_callbacks(&self, client: Arc<dyn DriverSubscriber>) -> DriverResult<()>;
    fn activity_enable(&self, kind: ActivityKind) -> DriverResult<()>;
    fn activity_disable(&self, kind: ActivityKind) -> DriverResult<()>;
    fn activity_flush_all(&self, forced: bool) -> DriverResult<()>;
    /// Records the driver dropped for a context/stream since the last query
    fn activity_dropped_records(&self, context: Option<ContextHandle>, stream_id: u32) -> DriverResult<usize>;
    /// Decode the record at `cursor`, advancing it; `Ok(None)` marks the end of the buffer
    fn activity_next_record(&self, buffer: &[u8], cursor: &mut usize) -> DriverResult<Option<ActivityRecord>>;
    fn configure_unified_memory_counter(&self, configs: &[UnifiedMemoryCounterConfig]) -> DriverResult<()>;

    fn device_count(&self) -> DriverResult<u32>;
    fn device_id(&self, context: ContextHandle) -> DriverResult<u32>;
    fn timestamp(&self) -> DriverResult<u64>;
    /// Push the context, wait for its pending work, pop it again
    fn synchronize_context(&self, context: ContextHandle) -> DriverResult<()>;
    fn finalize(&self) -> DriverResult<()>;

    /// Driver-specific cleanup run during teardown
    fn clean_up(&self) {}

    /// True when the interface has been shut down and should not be used
    fn disabled(&self) -> bool {
        false
    }
}
