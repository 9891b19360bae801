//! In-process simulated driver
//!
//! Implements [`DriverInterface`] without any GPU. Workload methods such as
//! [`SimulatedDriver::launch_kernel`] behave like intercepted driver calls:
//! they fire enter/exit callbacks on the calling thread and queue activity
//! records that are delivered through the registered buffer client on flush.

use super::codec;
use super::records::{
    ActivityKind, ActivityRecord, KernelRecord, MemcpyP2PRecord, MemcpyRecord, MemoryRecord,
    MemsetRecord, UnifiedMemoryCounterConfig,
};
use super::{
    CallbackData, CallbackDomain, CallbackId, CallbackSite, ContextHandle, DriverApi,
    DriverCallArgs, DriverInterface, DriverSubscriber, MemoryType, RangeApi, SubscriberHandle,
};
use crate::error::{DriverError, DriverResult};
use crate::event::{MemcpyKind, MemoryKind};
use fnv::FnvHashMap;
use std::cell::Cell;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Instant;

/// Behaviour knobs for the simulated driver
#[derive(Debug, Clone)]
pub struct SimulatedDriverConfig {
    pub num_devices: u32,
    /// Refuse subscriptions as if the process lacked privileges
    pub require_privileges: bool,
    /// When false every call fails as if the tracing library were missing
    pub library_available: bool,
    /// Deliver a buffer as soon as this many records are pending (0 = only on flush)
    pub auto_flush_records: usize,
    /// Simulated device time of one operation
    pub op_duration_ns: u64,
}

impl Default for SimulatedDriverConfig {
    fn default() -> Self {
        Self {
            num_devices: 1,
            require_privileges: false,
            library_available: true,
            auto_flush_records: 0,
            op_duration_ns: 1_000,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct SimContext {
    device_id: u32,
    uid: u32,
}

#[derive(Default)]
struct CallbackState {
    subscriber: Option<(SubscriberHandle, Weak<dyn DriverSubscriber>)>,
    domains: HashSet<CallbackDomain>,
    callbacks: HashSet<(CallbackDomain, CallbackId)>,
}

#[derive(Default)]
struct ActivityState {
    client: Option<Weak<dyn DriverSubscriber>>,
    enabled: HashSet<ActivityKind>,
    pending: Vec<ActivityRecord>,
}

/// Driver stand-in used by tests, benches and the `simulate` command
pub struct SimulatedDriver {
    config: SimulatedDriverConfig,
    epoch: Instant,
    next_correlation_id: AtomicU32,
    next_context: AtomicU64,
    next_subscriber: AtomicU64,
    next_address: AtomicU64,
    contexts: Mutex<FnvHashMap<ContextHandle, SimContext>>,
    callbacks: Mutex<CallbackState>,
    activity: Mutex<ActivityState>,
    unified_memory_counters: Mutex<Vec<UnifiedMemoryCounterConfig>>,
    synchronized: Mutex<Vec<ContextHandle>>,
    dropped_records: AtomicUsize,
    finalized: AtomicBool,
}

impl Default for SimulatedDriver {
    fn default() -> Self {
        Self::new(SimulatedDriverConfig::default())
    }
}

impl SimulatedDriver {
    pub fn new(config: SimulatedDriverConfig) -> Self {
        Self {
            config,
            epoch: Instant::now(),
            next_correlation_id: AtomicU32::new(1),
            next_context: AtomicU64::new(1),
            next_subscriber: AtomicU64::new(1),
            next_address: AtomicU64::new(0x7f00_0000_0000),
            contexts: Mutex::new(FnvHashMap::default()),
            callbacks: Mutex::new(CallbackState::default()),
            activity: Mutex::new(ActivityState::default()),
            unified_memory_counters: Mutex::new(Vec::new()),
            synchronized: Mutex::new(Vec::new()),
            dropped_records: AtomicUsize::new(0),
            finalized: AtomicBool::new(false),
        }
    }

    pub fn config(&self) -> &SimulatedDriverConfig {
        &self.config
    }

    /// Force the correlation id handed to the next driver call
    pub fn set_next_correlation_id(&self, id: u32) {
        self.next_correlation_id.store(id, Ordering::Release);
    }

    fn ensure_available(&self) -> DriverResult<()> {
        if self.config.library_available {
            Ok(())
        } else {
            Err(DriverError::NotInitialized)
        }
    }

    fn now(&self) -> u64 {
        u64::try_from(self.epoch.elapsed().as_nanos()).unwrap_or(u64::MAX)
    }

    fn context(&self, handle: ContextHandle) -> DriverResult<SimContext> {
        lock(&self.contexts)
            .get(&handle)
            .copied()
            .ok_or(DriverError::InvalidContext)
    }

    // Workload

    pub fn create_context(&self, device_id: u32) -> DriverResult<ContextHandle> {
        if device_id >= self.config.num_devices {
            return Err(DriverError::InvalidDevice);
        }
        let id = self.next_context.fetch_add(1, Ordering::Relaxed);
        let handle = ContextHandle(id);
        let uid = u32::try_from(id).unwrap_or(u32::MAX);
        lock(&self.contexts).insert(handle, SimContext { device_id, uid });
        self.issue(Some(handle), DriverApi::CtxCreate, &DriverCallArgs::None, None, |_, _, _| None)?;
        Ok(handle)
    }

    pub fn destroy_context(&self, context: ContextHandle) -> DriverResult<()> {
        self.context(context)?;
        self.issue(Some(context), DriverApi::CtxDestroy, &DriverCallArgs::None, None, |_, _, _| None)?;
        lock(&self.contexts).remove(&context);
        Ok(())
    }

    /// Launch a kernel; returns the call's correlation id
    pub fn launch_kernel(
        &self,
        context: ContextHandle,
        name: &str,
        grid: [u32; 3],
        block: [u32; 3],
        stream_id: u32,
    ) -> DriverResult<u32> {
        let device = self.context(context)?;
        let concurrent = self.activity_kind_enabled(ActivityKind::ConcurrentKernel);
        self.issue(
            Some(context),
            DriverApi::LaunchKernel,
            &DriverCallArgs::None,
            Some(name),
            |correlation_id, start, end| {
                let record = KernelRecord {
                    name: name.to_string(),
                    start,
                    end,
                    device_id: device.device_id,
                    context_id: device.uid,
                    stream_id,
                    correlation_id,
                    registers_per_thread: 32,
                    static_shared_memory: 0,
                    dynamic_shared_memory: 0,
                    block,
                    grid,
                    channel_id: 0,
                };
                Some(if concurrent {
                    ActivityRecord::ConcurrentKernel(record)
                } else {
                    ActivityRecord::Kernel(record)
                })
            },
        )
    }

    /// Issue a memcpy-family call; peer copies produce peer-to-peer records
    pub fn memcpy(
        &self,
        context: ContextHandle,
        api: DriverApi,
        args: DriverCallArgs,
        stream_id: u32,
    ) -> DriverResult<u32> {
        let device = self.context(context)?;
        let (copy_kind, src_kind, dst_kind) = activity_copy_kinds(api, &args);
        let bytes = copy_bytes(&args);
        let is_async = api.function_name().ends_with("Async");
        let peer = match args {
            DriverCallArgs::MemcpyPeer {
                src_context,
                dst_context,
                ..
            } => Some((self.context(src_context)?, self.context(dst_context)?)),
            _ => None,
        };
        self.issue(Some(context), api, &args, None, |correlation_id, start, end| {
            Some(match peer {
                Some((src, dst)) => ActivityRecord::MemcpyP2P(MemcpyP2PRecord {
                    copy_kind: MemcpyKind::PtoP,
                    src_kind: MemoryKind::Device,
                    dst_kind: MemoryKind::Device,
                    bytes,
                    start,
                    end,
                    src_device_id: src.device_id,
                    dst_device_id: dst.device_id,
                    context_id: device.uid,
                    stream_id,
                    correlation_id,
                    is_async,
                }),
                None => ActivityRecord::Memcpy(MemcpyRecord {
                    copy_kind,
                    src_kind,
                    dst_kind,
                    bytes,
                    start,
                    end,
                    device_id: device.device_id,
                    context_id: device.uid,
                    stream_id,
                    correlation_id,
                    is_async,
                }),
            })
        })
    }

    pub fn memset(
        &self,
        context: ContextHandle,
        api: DriverApi,
        args: DriverCallArgs,
        stream_id: u32,
    ) -> DriverResult<u32> {
        let device = self.context(context)?;
        let bytes = match args {
            DriverCallArgs::Memset { count } => count,
            DriverCallArgs::Memset2D { dst_pitch, height } => dst_pitch * height,
            _ => 0,
        };
        let is_async = api.function_name().ends_with("Async");
        self.issue(Some(context), api, &args, None, |correlation_id, start, end| {
            Some(ActivityRecord::Memset(MemsetRecord {
                memory_kind: MemoryKind::Device,
                bytes,
                start,
                end,
                device_id: device.device_id,
                context_id: device.uid,
                stream_id,
                correlation_id,
                is_async,
            }))
        })
    }

    /// Allocate device memory; returns the correlation id and the address
    pub fn mem_alloc(&self, context: ContextHandle, byte_size: u64) -> DriverResult<(u32, u64)> {
        let device = self.context(context)?;
        let address = self.next_address.fetch_add(byte_size.max(256), Ordering::Relaxed);
        let args = DriverCallArgs::MemAlloc { address, byte_size };
        let correlation_id = self.issue(Some(context), DriverApi::MemAlloc, &args, None, |_, start, end| {
            Some(ActivityRecord::Memory(MemoryRecord {
                memory_kind: MemoryKind::Device,
                address,
                bytes: byte_size,
                start,
                end,
                device_id: device.device_id,
                context_id: device.uid,
            }))
        })?;
        Ok((correlation_id, address))
    }

    pub fn mem_free(&self, context: ContextHandle, address: u64) -> DriverResult<u32> {
        self.context(context)?;
        self.issue(
            Some(context),
            DriverApi::MemFree,
            &DriverCallArgs::MemFree { address },
            None,
            |_, _, _| None,
        )
    }

    /// Fire callbacks for an arbitrary callback id without producing activity
    pub fn call_raw(
        &self,
        context: Option<ContextHandle>,
        cbid: CallbackId,
        function_name: &str,
        args: &DriverCallArgs,
    ) -> DriverResult<u32> {
        self.ensure_available()?;
        Ok(self.dispatch_call(context, cbid, function_name, None, args).0)
    }

    pub fn push_range(&self, message: &str) {
        let args = DriverCallArgs::RangePush {
            message: message.to_string(),
        };
        self.fire_range(RangeApi::Push, "nvtxRangePushEx", &args);
    }

    pub fn pop_range(&self) {
        self.fire_range(RangeApi::Pop, "nvtxRangePop", &DriverCallArgs::None);
    }

    fn fire_range(&self, api: RangeApi, function_name: &str, args: &DriverCallArgs) {
        let Some(target) = self.callback_target(CallbackDomain::Range, api as CallbackId) else {
            return;
        };
        let scratch = Cell::new(0);
        let mut data = CallbackData {
            site: CallbackSite::Enter,
            function_name,
            symbol_name: None,
            context: None,
            context_uid: 0,
            correlation_id: 0,
            args,
            correlation_data: &scratch,
        };
        target.on_callback(CallbackDomain::Range, api as CallbackId, &data);
        data.site = CallbackSite::Exit;
        target.on_callback(CallbackDomain::Range, api as CallbackId, &data);
    }

    /// Queue an activity record as if the device had produced it
    pub fn emit_activity(&self, record: ActivityRecord) {
        let deliver = {
            let mut state = lock(&self.activity);
            let enabled = match record.kind() {
                Some(kind) => state.enabled.contains(&kind),
                None => !state.enabled.is_empty(),
            };
            if !enabled {
                return;
            }
            state.pending.push(record);
            self.config.auto_flush_records > 0 && state.pending.len() >= self.config.auto_flush_records
        };
        if deliver {
            self.deliver_pending();
        }
    }

    /// Count records as lost inside the driver
    pub fn inject_dropped_records(&self, count: usize) {
        self.dropped_records.fetch_add(count, Ordering::Relaxed);
    }

    // Inspection

    pub fn pending_records(&self) -> usize {
        lock(&self.activity).pending.len()
    }

    pub fn is_subscribed(&self) -> bool {
        lock(&self.callbacks).subscriber.is_some()
    }

    pub fn enabled_activity_kinds(&self) -> Vec<ActivityKind> {
        lock(&self.activity).enabled.iter().copied().collect()
    }

    pub fn synchronized_contexts(&self) -> Vec<ContextHandle> {
        lock(&self.synchronized).clone()
    }

    pub fn unified_memory_counters(&self) -> Vec<UnifiedMemoryCounterConfig> {
        lock(&self.unified_memory_counters).clone()
    }

    pub fn is_finalized(&self) -> bool {
        self.finalized.load(Ordering::Acquire)
    }

    fn activity_kind_enabled(&self, kind: ActivityKind) -> bool {
        lock(&self.activity).enabled.contains(&kind)
    }

    fn callback_target(&self, domain: CallbackDomain, cbid: CallbackId) -> Option<Arc<dyn DriverSubscriber>> {
        let state = lock(&self.callbacks);
        let (_, subscriber) = state.subscriber.as_ref()?;
        let wanted = state.domains.contains(&domain) || state.callbacks.contains(&(domain, cbid));
        if wanted {
            subscriber.upgrade()
        } else {
            None
        }
    }

    fn issue(
        &self,
        context: Option<ContextHandle>,
        api: DriverApi,
        args: &DriverCallArgs,
        symbol_name: Option<&str>,
        record: impl FnOnce(u32, u64, u64) -> Option<ActivityRecord>,
    ) -> DriverResult<u32> {
        self.ensure_available()?;
        let (correlation_id, start) =
            self.dispatch_call(context, api.id(), api.function_name(), symbol_name, args);
        if let Some(record) = record(correlation_id, start, start + self.config.op_duration_ns) {
            self.emit_activity(record);
        }
        Ok(correlation_id)
    }

    /// Fire enter and exit callbacks; returns the correlation id and the device start time
    fn dispatch_call(
        &self,
        context: Option<ContextHandle>,
        cbid: CallbackId,
        function_name: &str,
        symbol_name: Option<&str>,
        args: &DriverCallArgs,
    ) -> (u32, u64) {
        let correlation_id = self.next_correlation_id.fetch_add(1, Ordering::AcqRel);
        let context_uid = context
            .and_then(|handle| self.context(handle).ok())
            .map_or(0, |ctx| ctx.uid);
        let target = self.callback_target(CallbackDomain::DriverApi, cbid);
        let scratch = Cell::new(0);
        let mut data = CallbackData {
            site: CallbackSite::Enter,
            function_name,
            symbol_name,
            context,
            context_uid,
            correlation_id,
            args,
            correlation_data: &scratch,
        };

        if let Some(target) = &target {
            target.on_callback(CallbackDomain::DriverApi, cbid, &data);
        }
        let start = self.now();
        data.site = CallbackSite::Exit;
        if let Some(target) = &target {
            target.on_callback(CallbackDomain::DriverApi, cbid, &data);
        }
        (correlation_id, start)
    }

    fn deliver_pending(&self) {
        let (client, records) = {
            let mut state = lock(&self.activity);
            let client = state.client.as_ref().and_then(|client| client.upgrade());
            (client, std::mem::take(&mut state.pending))
        };
        let Some(client) = client else {
            self.dropped_records.fetch_add(records.len(), Ordering::Relaxed);
            return;
        };

        let mut records = records.into_iter().peekable();
        while records.peek().is_some() {
            let mut buffer = client.request_buffer();
            if buffer.is_empty() {
                let remaining = records.count();
                self.dropped_records.fetch_add(remaining, Ordering::Relaxed);
                tracing::debug!(remaining, "no activity buffer available, dropping records");
                return;
            }

            let mut offset = 0;
            while let Some(record) = records.peek() {
                let frame = match codec::encode_record(record) {
                    Ok(frame) => frame,
                    Err(err) => {
                        tracing::warn!(error = %err, "cannot encode activity record");
                        self.dropped_records.fetch_add(1, Ordering::Relaxed);
                        records.next();
                        continue;
                    }
                };
                match codec::write_frame(buffer.as_mut_slice(), offset, &frame) {
                    Some(next) => {
                        offset = next;
                        records.next();
                    }
                    None => break,
                }
            }
            if offset == 0 && records.next().is_some() {
                // Record larger than a whole buffer
                self.dropped_records.fetch_add(1, Ordering::Relaxed);
            }
            client.buffer_completed(None, 0, buffer, offset);
        }
    }
}

impl DriverInterface for SimulatedDriver {
    fn subscribe(&self, subscriber: Arc<dyn DriverSubscriber>) -> DriverResult<SubscriberHandle> {
        self.ensure_available()?;
        if self.config.require_privileges {
            return Err(DriverError::InsufficientPrivileges);
        }
        let mut state = lock(&self.callbacks);
        if state.subscriber.is_some() {
            return Err(DriverError::Unknown("multiple subscribers not supported".to_string()));
        }
        let handle = SubscriberHandle(self.next_subscriber.fetch_add(1, Ordering::Relaxed));
        state.subscriber = Some((handle, Arc::downgrade(&subscriber)));
        Ok(handle)
    }

    fn unsubscribe(&self, handle: SubscriberHandle) -> DriverResult<()> {
        let mut state = lock(&self.callbacks);
        check_handle(&state, handle)?;
        *state = CallbackState::default();
        Ok(())
    }

    fn enable_callback(
        &self,
        enable: bool,
        handle: SubscriberHandle,
        domain: CallbackDomain,
        cbid: CallbackId,
    ) -> DriverResult<()> {
        let mut state = lock(&self.callbacks);
        check_handle(&state, handle)?;
        if enable {
            state.callbacks.insert((domain, cbid));
        } else {
            state.callbacks.remove(&(domain, cbid));
        }
        Ok(())
    }

    fn enable_domain(&self, enable: bool, handle: SubscriberHandle, domain: CallbackDomain) -> DriverResult<()> {
        let mut state = lock(&self.callbacks);
        check_handle(&state, handle)?;
        if enable {
            state.domains.insert(domain);
        } else {
            state.domains.remove(&domain);
        }
        Ok(())
    }

    fn activity_register_callbacks(&self, client: Arc<dyn DriverSubscriber>) -> DriverResult<()> {
        self.ensure_available()?;
        lock(&self.activity).client = Some(Arc::downgrade(&client));
        Ok(())
    }

    fn activity_enable(&self, kind: ActivityKind) -> DriverResult<()> {
        self.ensure_available()?;
        lock(&self.activity).enabled.insert(kind);
        Ok(())
    }

    fn activity_disable(&self, kind: ActivityKind) -> DriverResult<()> {
        self.ensure_available()?;
        lock(&self.activity).enabled.remove(&kind);
        Ok(())
    }

    fn activity_flush_all(&self, _forced: bool) -> DriverResult<()> {
        self.ensure_available()?;
        self.deliver_pending();
        Ok(())
    }

    fn activity_dropped_records(&self, _context: Option<ContextHandle>, _stream_id: u32) -> DriverResult<usize> {
        Ok(self.dropped_records.swap(0, Ordering::AcqRel))
    }

    fn activity_next_record(&self, buffer: &[u8], cursor: &mut usize) -> DriverResult<Option<ActivityRecord>> {
        codec::next_record(buffer, cursor)
    }

    fn configure_unified_memory_counter(&self, configs: &[UnifiedMemoryCounterConfig]) -> DriverResult<()> {
        self.ensure_available()?;
        let mut counters = lock(&self.unified_memory_counters);
        for config in configs {
            counters.retain(|c| c.kind != config.kind || c.device_id != config.device_id);
            counters.push(*config);
        }
        Ok(())
    }

    fn device_count(&self) -> DriverResult<u32> {
        self.ensure_available()?;
        Ok(self.config.num_devices)
    }

    fn device_id(&self, context: ContextHandle) -> DriverResult<u32> {
        self.context(context).map(|ctx| ctx.device_id)
    }

    fn timestamp(&self) -> DriverResult<u64> {
        self.ensure_available()?;
        Ok(self.now())
    }

    fn synchronize_context(&self, context: ContextHandle) -> DriverResult<()> {
        self.context(context)?;
        lock(&self.synchronized).push(context);
        self.issue(Some(context), DriverApi::CtxSynchronize, &DriverCallArgs::None, None, |_, _, _| None)?;
        Ok(())
    }

    fn finalize(&self) -> DriverResult<()> {
        self.finalized.store(true, Ordering::Release);
        Ok(())
    }
}

fn check_handle(state: &CallbackState, handle: SubscriberHandle) -> DriverResult<()> {
    let current = state.subscriber.as_ref().map(|(current, _)| *current);
    if current == Some(handle) {
        Ok(())
    } else {
        Err(DriverError::Unknown("invalid subscriber handle".to_string()))
    }
}

fn memory_kind(memory_type: MemoryType) -> MemoryKind {
    match memory_type {
        MemoryType::Host => MemoryKind::Pageable,
        MemoryType::Device => MemoryKind::Device,
        MemoryType::Array => MemoryKind::Array,
        MemoryType::Unified => MemoryKind::Managed,
    }
}

fn activity_copy_kinds(api: DriverApi, args: &DriverCallArgs) -> (MemcpyKind, MemoryKind, MemoryKind) {
    match api {
        DriverApi::MemcpyHtoD | DriverApi::MemcpyHtoDAsync => {
            (MemcpyKind::HtoD, MemoryKind::Pageable, MemoryKind::Device)
        }
        DriverApi::MemcpyDtoH | DriverApi::MemcpyDtoHAsync => {
            (MemcpyKind::DtoH, MemoryKind::Device, MemoryKind::Pageable)
        }
        DriverApi::MemcpyDtoD | DriverApi::MemcpyDtoDAsync => {
            (MemcpyKind::DtoD, MemoryKind::Device, MemoryKind::Device)
        }
        _ => match *args {
            DriverCallArgs::Memcpy2D {
                src_memory_type,
                dst_memory_type,
                ..
            }
            | DriverCallArgs::Memcpy3D {
                src_memory_type,
                dst_memory_type,
                ..
            } => {
                let kind = match (src_memory_type, dst_memory_type) {
                    (MemoryType::Host, MemoryType::Device) => MemcpyKind::HtoD,
                    (MemoryType::Device, MemoryType::Host) => MemcpyKind::DtoH,
                    (MemoryType::Device, MemoryType::Device) => MemcpyKind::DtoD,
                    (MemoryType::Host, MemoryType::Host) => MemcpyKind::HtoH,
                    _ => MemcpyKind::Unknown,
                };
                (kind, memory_kind(src_memory_type), memory_kind(dst_memory_type))
            }
            _ => (MemcpyKind::Unknown, MemoryKind::Unknown, MemoryKind::Unknown),
        },
    }
}

fn copy_bytes(args: &DriverCallArgs) -> u64 {
    match *args {
        DriverCallArgs::Memcpy { byte_count } | DriverCallArgs::MemcpyPeer { byte_count, .. } => byte_count,
        DriverCallArgs::Memcpy2D {
            width_in_bytes,
            height,
            ..
        } => width_in_bytes * height,
        DriverCallArgs::Memcpy3D {
            width_in_bytes,
            height,
            depth,
            ..
        } => width_in_bytes * height * depth,
        _ => 0,
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
