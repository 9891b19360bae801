//! Conversion of driver API callbacks into tracer events
//!
//! Each callback id maps to one decoder function. Ids without a dedicated
//! decoder produce a generic event named after the driver function.

use crate::driver::{
    CallbackData, CallbackId, DriverApi, DriverCallArgs, DriverInterface, MemoryType,
};
use crate::event::{
    EventDetails, HostRegisterDetails, HostUnregisterDetails, KernelDetails, MemAllocDetails,
    MemFreeDetails, MemcpyDetails, MemsetDetails, TracerEvent, TracerEventSource, TracerEventType,
};
use crate::host::current_thread_id;

/// Everything a decoder may look at for one completed call
pub struct DecodeInput<'a> {
    pub driver: &'a dyn DriverInterface,
    pub device_id: u32,
    pub cbid: CallbackId,
    pub data: &'a CallbackData<'a>,
    pub start_ns: u64,
    pub end_ns: u64,
}

impl DecodeInput<'_> {
    fn api(&self) -> Option<DriverApi> {
        DriverApi::from_id(self.cbid)
    }
}

pub type Decoder = fn(&DecodeInput<'_>) -> TracerEvent;

/// Decoder responsible for a callback id
pub fn decoder_for(cbid: CallbackId) -> Decoder {
    let Some(api) = DriverApi::from_id(cbid) else {
        return decode_generic;
    };
    match api {
        DriverApi::LaunchKernel
        | DriverApi::LaunchKernelEx
        | DriverApi::LaunchCooperativeKernel
        | DriverApi::LaunchCooperativeKernelMultiDevice => decode_kernel,
        DriverApi::MemcpyPeer | DriverApi::MemcpyPeerAsync => decode_memcpy_p2p,
        DriverApi::Memcpy
        | DriverApi::MemcpyAsync
        | DriverApi::MemcpyHtoD
        | DriverApi::MemcpyHtoDAsync
        | DriverApi::MemcpyDtoH
        | DriverApi::MemcpyDtoHAsync
        | DriverApi::MemcpyDtoD
        | DriverApi::MemcpyDtoDAsync
        | DriverApi::MemcpyAtoH
        | DriverApi::MemcpyAtoHAsync
        | DriverApi::MemcpyAtoD
        | DriverApi::MemcpyDtoA
        | DriverApi::MemcpyAtoA
        | DriverApi::MemcpyHtoA
        | DriverApi::MemcpyHtoAAsync
        | DriverApi::Memcpy2D
        | DriverApi::Memcpy2DUnaligned
        | DriverApi::Memcpy2DAsync
        | DriverApi::Memcpy3D
        | DriverApi::Memcpy3DAsync => decode_memcpy_event,
        DriverApi::MemAlloc
        | DriverApi::MemAllocPitch
        | DriverApi::MemAllocManaged
        | DriverApi::MemAllocHost
        | DriverApi::MemHostAlloc => decode_mem_alloc,
        DriverApi::MemFree | DriverApi::MemFreeHost => decode_mem_free,
        DriverApi::MemsetD8
        | DriverApi::MemsetD16
        | DriverApi::MemsetD32
        | DriverApi::MemsetD8Async
        | DriverApi::MemsetD16Async
        | DriverApi::MemsetD32Async
        | DriverApi::MemsetD2D8
        | DriverApi::MemsetD2D16
        | DriverApi::MemsetD2D32
        | DriverApi::MemsetD2D8Async
        | DriverApi::MemsetD2D16Async
        | DriverApi::MemsetD2D32Async => decode_memset_event,
        DriverApi::MemHostRegister => decode_host_register,
        DriverApi::MemHostUnregister => decode_host_unregister,
        DriverApi::CtxCreate
        | DriverApi::CtxDestroy
        | DriverApi::CtxSynchronize
        | DriverApi::ModuleLoad
        | DriverApi::StreamSynchronize
        | DriverApi::EventSynchronize => decode_generic,
    }
}

/// Decode a completed driver call into an event
pub fn decode_callback(input: &DecodeInput<'_>) -> TracerEvent {
    decoder_for(input.cbid)(input)
}

/// Size, direction and asynchrony of a memory copy call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemcpyDecode {
    pub num_bytes: u64,
    pub event_type: TracerEventType,
    pub is_async: bool,
}

impl MemcpyDecode {
    const UNSUPPORTED: MemcpyDecode = MemcpyDecode {
        num_bytes: 0,
        event_type: TracerEventType::Unsupported,
        is_async: false,
    };
}

fn copy_direction(src: MemoryType, dst: MemoryType) -> TracerEventType {
    match (src, dst) {
        (MemoryType::Host, MemoryType::Device) => TracerEventType::MemcpyH2D,
        (MemoryType::Device, MemoryType::Host) => TracerEventType::MemcpyD2H,
        (MemoryType::Device, MemoryType::Device) => TracerEventType::MemcpyD2D,
        _ => TracerEventType::Unsupported,
    }
}

/// Classify a memcpy-family call from its id and arguments.
///
/// Array copies and unaligned 2D copies are not classified and come back as
/// [`TracerEventType::Unsupported`] with a size of 0.
pub fn decode_memcpy(api: Option<DriverApi>, args: &DriverCallArgs) -> MemcpyDecode {
    let linear = |event_type, is_async| match args {
        DriverCallArgs::Memcpy { byte_count } => MemcpyDecode {
            num_bytes: *byte_count,
            event_type,
            is_async,
        },
        _ => MemcpyDecode::UNSUPPORTED,
    };

    let decoded = match api {
        Some(DriverApi::Memcpy) => linear(TracerEventType::MemcpyOther, false),
        Some(DriverApi::MemcpyAsync) => linear(TracerEventType::MemcpyOther, true),
        Some(DriverApi::MemcpyHtoD) => linear(TracerEventType::MemcpyH2D, false),
        Some(DriverApi::MemcpyHtoDAsync) => linear(TracerEventType::MemcpyH2D, true),
        Some(DriverApi::MemcpyDtoH) => linear(TracerEventType::MemcpyD2H, false),
        Some(DriverApi::MemcpyDtoHAsync) => linear(TracerEventType::MemcpyD2H, true),
        Some(DriverApi::MemcpyDtoD) => linear(TracerEventType::MemcpyD2D, false),
        Some(DriverApi::MemcpyDtoDAsync) => linear(TracerEventType::MemcpyD2D, true),
        Some(api @ (DriverApi::Memcpy2D | DriverApi::Memcpy2DAsync)) => match args {
            DriverCallArgs::Memcpy2D {
                width_in_bytes,
                height,
                src_memory_type,
                dst_memory_type,
            } => MemcpyDecode {
                num_bytes: height.saturating_mul(*width_in_bytes),
                event_type: copy_direction(*src_memory_type, *dst_memory_type),
                is_async: api == DriverApi::Memcpy2DAsync,
            },
            _ => MemcpyDecode::UNSUPPORTED,
        },
        Some(api @ (DriverApi::Memcpy3D | DriverApi::Memcpy3DAsync)) => match args {
            DriverCallArgs::Memcpy3D {
                width_in_bytes,
                height,
                depth,
                src_memory_type,
                dst_memory_type,
            } => MemcpyDecode {
                num_bytes: depth.saturating_mul(*height).saturating_mul(*width_in_bytes),
                event_type: copy_direction(*src_memory_type, *dst_memory_type),
                is_async: api == DriverApi::Memcpy3DAsync,
            },
            _ => MemcpyDecode::UNSUPPORTED,
        },
        Some(api @ (DriverApi::MemcpyPeer | DriverApi::MemcpyPeerAsync)) => match args {
            DriverCallArgs::MemcpyPeer { byte_count, .. } => MemcpyDecode {
                num_bytes: *byte_count,
                event_type: TracerEventType::MemcpyP2P,
                is_async: api == DriverApi::MemcpyPeerAsync,
            },
            _ => MemcpyDecode::UNSUPPORTED,
        },
        _ => MemcpyDecode::UNSUPPORTED,
    };

    if decoded.event_type == TracerEventType::Unsupported {
        tracing::error!(
            api = api.map_or("<unknown>", DriverApi::function_name),
            "unsupported memcpy call observed"
        );
    }
    decoded
}

/// Byte count and asynchrony of a memset-family call
pub fn decode_memset(api: Option<DriverApi>, args: &DriverCallArgs) -> (u64, bool) {
    let is_async = matches!(
        api,
        Some(
            DriverApi::MemsetD8Async
                | DriverApi::MemsetD16Async
                | DriverApi::MemsetD32Async
                | DriverApi::MemsetD2D8Async
                | DriverApi::MemsetD2D16Async
                | DriverApi::MemsetD2D32Async
        )
    );
    match args {
        DriverCallArgs::Memset { count } => (*count, is_async),
        DriverCallArgs::Memset2D { dst_pitch, height } => (dst_pitch.saturating_mul(*height), is_async),
        _ => {
            tracing::error!(
                api = api.map_or("<unknown>", DriverApi::function_name),
                "unsupported memset call observed"
            );
            (0, false)
        }
    }
}

fn base_event(input: &DecodeInput<'_>, event_type: TracerEventType) -> TracerEvent {
    TracerEvent {
        event_type,
        source: TracerEventSource::DriverCallback,
        name: input.data.function_name.to_string(),
        start_time_ns: input.start_ns,
        end_time_ns: input.end_ns,
        device_id: input.device_id,
        correlation_id: input.data.correlation_id,
        thread_id: current_thread_id(),
        context_id: input.data.context_uid,
        ..Default::default()
    }
}

fn decode_kernel(input: &DecodeInput<'_>) -> TracerEvent {
    let mut event = base_event(input, TracerEventType::Kernel);
    if let Some(symbol) = input.data.symbol_name {
        event.name = symbol.to_string();
    }
    event.details = EventDetails::Kernel(KernelDetails::default());
    event
}

fn decode_memcpy_event(input: &DecodeInput<'_>) -> TracerEvent {
    let decoded = decode_memcpy(input.api(), input.data.args);
    let mut event = base_event(input, decoded.event_type);
    event.details = EventDetails::Memcpy(MemcpyDetails {
        num_bytes: decoded.num_bytes,
        destination: input.device_id,
        is_async: decoded.is_async,
        ..Default::default()
    });
    event
}

fn decode_memcpy_p2p(input: &DecodeInput<'_>) -> TracerEvent {
    let decoded = decode_memcpy(input.api(), input.data.args);
    let mut event = base_event(input, decoded.event_type);
    let mut destination = input.device_id;

    if let DriverCallArgs::MemcpyPeer {
        src_context,
        dst_context,
        ..
    } = input.data.args
    {
        let resolve = |context| {
            input.driver.device_id(context).unwrap_or_else(|err| {
                tracing::warn!(error = %err, "cannot resolve peer copy device");
                input.device_id
            })
        };
        event.device_id = resolve(*src_context);
        destination = resolve(*dst_context);
    }

    event.details = EventDetails::Memcpy(MemcpyDetails {
        num_bytes: decoded.num_bytes,
        destination,
        is_async: decoded.is_async,
        ..Default::default()
    });
    event
}

fn decode_memset_event(input: &DecodeInput<'_>) -> TracerEvent {
    let (num_bytes, is_async) = decode_memset(input.api(), input.data.args);
    let mut event = base_event(input, TracerEventType::Memset);
    event.details = EventDetails::Memset(MemsetDetails {
        num_bytes,
        is_async,
        ..Default::default()
    });
    event
}

fn decode_mem_alloc(input: &DecodeInput<'_>) -> TracerEvent {
    let mut event = base_event(input, TracerEventType::MemoryAlloc);
    let details = match *input.data.args {
        DriverCallArgs::MemAlloc { address, byte_size }
        | DriverCallArgs::MemHostAlloc {
            address, byte_size, ..
        } => MemAllocDetails {
            address,
            num_bytes: byte_size,
        },
        DriverCallArgs::MemAllocPitch {
            address,
            pitch,
            height,
        } => MemAllocDetails {
            address,
            num_bytes: pitch.saturating_mul(height),
        },
        _ => MemAllocDetails::default(),
    };
    event.details = EventDetails::MemAlloc(details);
    event
}

fn decode_mem_free(input: &DecodeInput<'_>) -> TracerEvent {
    let mut event = base_event(input, TracerEventType::MemoryFree);
    let address = match *input.data.args {
        DriverCallArgs::MemFree { address } => address,
        _ => 0,
    };
    event.details = EventDetails::MemFree(MemFreeDetails { address });
    event
}

fn decode_host_register(input: &DecodeInput<'_>) -> TracerEvent {
    let mut event = base_event(input, TracerEventType::HostRegister);
    if let DriverCallArgs::MemHostRegister {
        address,
        byte_size,
        flags,
    } = *input.data.args
    {
        event.details = EventDetails::HostRegister(HostRegisterDetails {
            address,
            num_bytes: byte_size,
            flags,
        });
    }
    event
}

fn decode_host_unregister(input: &DecodeInput<'_>) -> TracerEvent {
    let mut event = base_event(input, TracerEventType::HostUnregister);
    if let DriverCallArgs::MemHostUnregister { address } = *input.data.args {
        event.details = EventDetails::HostUnregister(HostUnregisterDetails { address });
    }
    event
}

fn decode_generic(input: &DecodeInput<'_>) -> TracerEvent {
    base_event(input, TracerEventType::Generic)
}
