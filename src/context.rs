//! The graphics context.
//!
//! [`GraphicsContext`] owns the device and everything scoped to it: the
//! queues, descriptor allocators, memory allocators, object cache, keep-alive
//! queue, and the registry of device-dependent resources. It drives the frame
//! loop (`frame_started`/`frame_complete`) and the device reset protocol that
//! recovers from device removal and display topology changes.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{MappedMutexGuard, Mutex, MutexGuard, RwLock};

use crate::backend::{create_backend, GpuBackend, NativeDevice};
use crate::descriptor::{
    DescriptorAllocator, DescriptorHeapType, GPU_SAMPLER_CAPACITY, GPU_VIEW_CAPACITY,
};
use crate::device_child::{
    DeviceChild, DeviceChildHandle, DeviceChildRegistry, RegisteredChild, ResetPriority,
};
use crate::error::GpuError;
use crate::fence::{Fence, FenceValue, FenceValues};
use crate::host::HostCallbacks;
use crate::keep_alive::KeepAlive;
use crate::memory::{
    HeapFlags, HeapUsage, MemAllocator, RingAllocator, BUFFER_POOL_MAX, BUFFER_POOL_MIN,
    RING_CAPACITY, TARGET_POOL_MAX, TARGET_POOL_MIN, TEXTURE_POOL_MAX, TEXTURE_POOL_MIN,
};
use crate::object_cache::ObjectCache;
use crate::queue::{CommandContext, Queues};
use crate::types::{AdapterInfo, DeviceOption, FeatureLevel, GpuEvent, VideoMemoryInfo};

/// Heap residency control needs this device interface revision.
const HEAP_RESIDENCY_INTERFACE: u32 = 8;
/// Explicit device removal needs this device interface revision.
const DEVICE_REMOVE_INTERFACE: u32 = 5;

/// Owner of the GPU device and all device-scoped services.
pub struct GraphicsContext {
    backend: Arc<dyn GpuBackend>,
    host: Arc<dyn HostCallbacks>,
    feature_level: FeatureLevel,

    device: RwLock<Arc<dyn NativeDevice>>,
    adapter: RwLock<AdapterInfo>,
    adapters_hash: AtomicU64,
    outputs_hash: AtomicU64,
    heap_not_resident: AtomicBool,
    video_memory: Mutex<VideoMemoryInfo>,

    queues: Queues,
    residency_fence: Arc<Fence>,

    cpu_descriptors: [DescriptorAllocator; 4],
    gpu_views: DescriptorAllocator,
    gpu_samplers: DescriptorAllocator,

    upload: RingAllocator,
    readback: RingAllocator,
    dynamic_buffers: RingAllocator,
    static_buffers: MemAllocator,
    textures: MemAllocator,
    targets: MemAllocator,

    object_cache: ObjectCache,
    children: DeviceChildRegistry,
    keep_alive: KeepAlive,

    frame: Mutex<Option<CommandContext>>,
    frame_count: AtomicU64,
    frame_listeners: Mutex<Vec<Box<dyn Fn(u64) + Send>>>,
    resetting: AtomicBool,
}

impl GraphicsContext {
    /// Create a context on the platform's default backend.
    ///
    /// # Errors
    ///
    /// [`GpuError::NoAdapter`] when no adapter can create a device, or the
    /// backend's initialization error.
    pub fn new(host: Arc<dyn HostCallbacks>) -> Result<Self, GpuError> {
        Self::with_backend(create_backend()?, host, FeatureLevel::default())
    }

    /// Create a context on an explicit backend.
    pub fn with_backend(
        backend: Arc<dyn GpuBackend>,
        host: Arc<dyn HostCallbacks>,
        feature_level: FeatureLevel,
    ) -> Result<Self, GpuError> {
        if !backend.is_current() {
            backend.refresh()?;
        }

        let (adapter, device) = Self::select_device(backend.as_ref(), feature_level, false)?;
        let heap_not_resident = probe_heap_not_resident(device.as_ref());
        let pool_flags = if heap_not_resident {
            HeapFlags::CREATE_NOT_RESIDENT
        } else {
            HeapFlags::empty()
        };

        let cpu_descriptor = |ty: DescriptorHeapType| {
            DescriptorAllocator::new(ty, ty.default_cpu_capacity(), false, device.clone())
        };
        let cpu_descriptors = [
            cpu_descriptor(DescriptorHeapType::CbvSrvUav)?,
            cpu_descriptor(DescriptorHeapType::Sampler)?,
            cpu_descriptor(DescriptorHeapType::RenderTarget)?,
            cpu_descriptor(DescriptorHeapType::DepthStencil)?,
        ];

        let context = Self {
            queues: Queues::new(device.clone()),
            residency_fence: Fence::new("memory residency fence", None),
            gpu_views: DescriptorAllocator::new(
                DescriptorHeapType::CbvSrvUav,
                GPU_VIEW_CAPACITY,
                true,
                device.clone(),
            )?,
            gpu_samplers: DescriptorAllocator::new(
                DescriptorHeapType::Sampler,
                GPU_SAMPLER_CAPACITY,
                true,
                device.clone(),
            )?,
            cpu_descriptors,
            upload: RingAllocator::new(
                HeapUsage::Upload,
                RING_CAPACITY,
                HeapFlags::DENY_TEXTURES,
                device.clone(),
            )?,
            readback: RingAllocator::new(
                HeapUsage::Readback,
                RING_CAPACITY,
                HeapFlags::DENY_TEXTURES,
                device.clone(),
            )?,
            dynamic_buffers: RingAllocator::new(
                HeapUsage::GpuBuffers,
                RING_CAPACITY,
                HeapFlags::DENY_TEXTURES,
                device.clone(),
            )?,
            static_buffers: MemAllocator::new(
                HeapUsage::GpuBuffers,
                BUFFER_POOL_MIN,
                BUFFER_POOL_MAX,
                HeapFlags::DENY_TEXTURES | pool_flags,
                device.clone(),
            ),
            textures: MemAllocator::new(
                HeapUsage::GpuTextures,
                TEXTURE_POOL_MIN,
                TEXTURE_POOL_MAX,
                HeapFlags::DENY_BUFFERS | pool_flags,
                device.clone(),
            ),
            targets: MemAllocator::new(
                HeapUsage::GpuTargets,
                TARGET_POOL_MIN,
                TARGET_POOL_MAX,
                HeapFlags::DENY_BUFFERS | pool_flags,
                device.clone(),
            ),
            object_cache: ObjectCache::new(device.clone()),
            children: DeviceChildRegistry::new(),
            keep_alive: KeepAlive::new(),
            frame: Mutex::new(None),
            frame_count: AtomicU64::new(0),
            frame_listeners: Mutex::new(Vec::new()),
            resetting: AtomicBool::new(false),
            adapters_hash: AtomicU64::new(backend.adapters_hash()),
            outputs_hash: AtomicU64::new(backend.outputs_hash(&adapter)),
            heap_not_resident: AtomicBool::new(heap_not_resident),
            video_memory: Mutex::new(device.video_memory_info()),
            adapter: RwLock::new(adapter),
            device: RwLock::new(device),
            backend,
            host,
            feature_level,
        };
        Ok(context)
    }

    /// Enumerate adapters and create a device on the first one that works,
    /// hardware adapters before software fallbacks.
    fn select_device(
        backend: &dyn GpuBackend,
        feature_level: FeatureLevel,
        for_reset: bool,
    ) -> Result<(AdapterInfo, Arc<dyn NativeDevice>), GpuError> {
        let adapters = backend.enumerate_adapters();
        if adapters.is_empty() {
            log::error!("no graphics adapters found");
            return Err(GpuError::NoAdapter);
        }

        for (i, adapter) in adapters.iter().enumerate() {
            log::info!(
                "Adapter[{i}] = {} ({:?}, {} outputs)",
                adapter.name,
                adapter.device_type,
                adapter.outputs
            );
        }

        // the debug layer slows device creation enough to skip during resets
        let debug_layer = cfg!(debug_assertions) && !for_reset;
        for adapter in &adapters {
            match backend.create_device(adapter, feature_level, debug_layer) {
                Ok(device) => {
                    log::info!(
                        "Created {:?} device on '{}'",
                        device.feature_level(),
                        adapter.name
                    );
                    return Ok((adapter.clone(), device));
                }
                Err(err) => {
                    log::warn!("device creation failed on '{}': {err}", adapter.name);
                }
            }
        }

        log::error!("no adapter was able to create a device");
        Err(GpuError::NoAdapter)
    }

    pub fn backend(&self) -> &Arc<dyn GpuBackend> {
        &self.backend
    }

    /// The current device. Clones the handle; the device may be replaced by
    /// a reset at any time, so do not cache it across frames.
    pub fn device(&self) -> Arc<dyn NativeDevice> {
        self.device.read().clone()
    }

    pub fn adapter(&self) -> AdapterInfo {
        self.adapter.read().clone()
    }

    pub fn feature_level(&self) -> FeatureLevel {
        self.feature_level
    }

    /// Is the current device still usable?
    pub fn device_valid(&self) -> bool {
        self.device.read().is_valid()
    }

    /// Heap residency control is available: the device interface is recent
    /// enough and the adapter reports the capability.
    pub fn supports_create_heap_not_resident(&self) -> bool {
        self.heap_not_resident.load(Ordering::Acquire)
    }

    pub fn queues(&self) -> &Queues {
        &self.queues
    }

    /// Standalone fence tracking residency transfers, not owned by a queue.
    pub fn residency_fence(&self) -> &Arc<Fence> {
        &self.residency_fence
    }

    /// CPU-visible staging descriptor allocator for `ty`.
    pub fn cpu_descriptors(&self, ty: DescriptorHeapType) -> &DescriptorAllocator {
        &self.cpu_descriptors[ty.index()]
    }

    /// Shader-visible view descriptor allocator.
    pub fn gpu_views(&self) -> &DescriptorAllocator {
        &self.gpu_views
    }

    /// Shader-visible sampler descriptor allocator.
    pub fn gpu_samplers(&self) -> &DescriptorAllocator {
        &self.gpu_samplers
    }

    pub fn upload(&self) -> &RingAllocator {
        &self.upload
    }

    pub fn readback(&self) -> &RingAllocator {
        &self.readback
    }

    pub fn dynamic_buffers(&self) -> &RingAllocator {
        &self.dynamic_buffers
    }

    pub fn static_buffers(&self) -> &MemAllocator {
        &self.static_buffers
    }

    pub fn textures(&self) -> &MemAllocator {
        &self.textures
    }

    pub fn targets(&self) -> &MemAllocator {
        &self.targets
    }

    pub fn object_cache(&self) -> &ObjectCache {
        &self.object_cache
    }

    pub fn children(&self) -> &DeviceChildRegistry {
        &self.children
    }

    pub fn keep_alive(&self) -> &KeepAlive {
        &self.keep_alive
    }

    /// Park a resource until the given fence values complete.
    pub fn keep_alive_resource<T: Send + 'static>(&self, resource: T, fences: FenceValues) {
        self.keep_alive.keep(resource, fences);
    }

    /// Last refreshed video memory snapshot.
    pub fn video_memory_info(&self) -> VideoMemoryInfo {
        *self.video_memory.lock()
    }

    /// Completed frames since context creation.
    pub fn frame_count(&self) -> u64 {
        self.frame_count.load(Ordering::Acquire)
    }

    /// Register a listener invoked with the frame number after each
    /// `frame_complete`. Listeners must not call frame APIs or register
    /// further listeners.
    pub fn add_frame_complete_listener(&self, listener: impl Fn(u64) + Send + 'static) {
        self.frame_listeners.lock().push(Box::new(listener));
    }

    /// Begin a new frame: flush retired resources, refresh the video memory
    /// budget if the adapter signaled a change, open the frame marker, and
    /// hand the frame's command context to the host and then the caller.
    ///
    /// The returned guard holds the frame slot; drop it before calling
    /// [`frame_complete`].
    ///
    /// # Errors
    ///
    /// [`GpuError::FrameAlreadyOpen`] when the previous frame was never
    /// completed.
    ///
    /// [`frame_complete`]: GraphicsContext::frame_complete
    pub fn frame_started(&self) -> Result<MappedMutexGuard<'_, CommandContext>, GpuError> {
        let mut frame = self.frame.lock();
        if frame.is_some() {
            log::error!("frame_started called with a frame already recording");
            return Err(GpuError::FrameAlreadyOpen);
        }

        self.keep_alive.flush();

        let device = self.device.read().clone();
        // without a budget event the snapshot is refreshed every frame
        if !device.has_budget_event() || device.take_budget_change() {
            let info = device.video_memory_info();
            log::trace!(
                "video memory: {} of {} budget in use",
                info.current_usage,
                info.budget
            );
            *self.video_memory.lock() = info;
        }

        let direct = self.queues.direct();
        direct.begin_event(GpuEvent::RenderFrame);
        let mut commands =
            direct.new_commands(format!("frame {}", self.frame_count() + 1));
        commands.begin_event(GpuEvent::RenderFrame);
        self.host.on_frame_started(&mut commands);

        *frame = Some(commands);
        Ok(MutexGuard::map(frame, |frame| {
            frame.as_mut().unwrap_or_else(|| unreachable!())
        }))
    }

    /// Submit the open frame's commands and notify listeners and the host.
    /// If the device turned out to be removed, a forced reset is kicked off
    /// before returning.
    ///
    /// # Errors
    ///
    /// [`GpuError::FrameNotOpen`] without a matching [`frame_started`].
    ///
    /// [`frame_started`]: GraphicsContext::frame_started
    pub fn frame_complete(&self) -> Result<FenceValue, GpuError> {
        let mut commands = self.frame.lock().take().ok_or(GpuError::FrameNotOpen)?;
        commands.end_event();

        let direct = self.queues.direct();
        let fence_value = direct.submit(commands);
        direct.end_event();

        let count = self.frame_count.fetch_add(1, Ordering::AcqRel) + 1;
        for listener in self.frame_listeners.lock().iter() {
            listener(count);
        }
        self.host.on_frame_complete();

        if !self.device_valid() {
            log::warn!("device lost during frame {count}; resetting");
            self.reset_device(true);
        }
        Ok(fence_value)
    }

    /// Flag a fatal GPU error. When the device interface supports explicit
    /// removal the device is removed so captures show `reason`; otherwise
    /// the error is only logged.
    pub fn device_fatal_error(&self, reason: &str) {
        let device = self.device.read().clone();
        if device.is_valid() && device.interface_version() >= DEVICE_REMOVE_INTERFACE {
            log::error!("fatal GPU error, removing device: {reason}");
            device.remove(reason);
        } else {
            log::error!("fatal GPU error: {reason}");
        }
    }

    /// Block until every queue drains, then drop retired resources.
    pub fn wait_for_idle(&self) {
        self.queues.wait_for_idle();
        self.keep_alive.flush();
    }

    /// Release as much memory as possible while keeping the device alive.
    /// Called when the application is minimized or suspended.
    pub fn trim(&self) {
        self.wait_for_idle();
        let info = self.video_memory_info();
        log::info!(
            "trimmed GPU memory: {} of {} budget in use",
            info.current_usage,
            info.budget
        );
    }

    /// Check the device and recreate it if needed.
    ///
    /// The device is recreated when `force` is set, when it reports itself
    /// removed, or when the adapter/output topology changed since the last
    /// (re)creation. Once the fresh device is in place, registered device
    /// children are walked in three phases: `before_reset` in descending
    /// priority, then `reset` and `after_reset` in ascending priority. A
    /// child whose handle stops being valid mid-reset receives no further
    /// callbacks.
    ///
    /// Returns true when a usable device is in place afterwards. Re-entrant
    /// calls return false immediately.
    pub fn reset_device(&self, force: bool) -> bool {
        let mut force = force;

        if !self.backend.is_current() {
            if let Err(err) = self.backend.refresh() {
                log::error!("backend refresh failed: {err}");
                return false;
            }
        }
        if !force {
            let adapters = self.backend.adapters_hash();
            let outputs = self.backend.outputs_hash(&self.adapter.read());
            if adapters != self.adapters_hash.load(Ordering::Acquire)
                || outputs != self.outputs_hash.load(Ordering::Acquire)
            {
                log::info!("display topology changed; resetting device");
                force = true;
            }
        }
        if !force && self.device_valid() {
            return true;
        }

        if self.resetting.swap(true, Ordering::AcqRel) {
            log::error!("reset_device called re-entrantly");
            return false;
        }
        let _guard = ResetGuard(&self.resetting);

        if let Some(reason) = self.device.read().removal_reason() {
            log::warn!("resetting removed device: {reason}");
        } else {
            log::info!("resetting device");
        }

        let mut status = true;

        debug_assert!(
            self.frame.lock().is_none(),
            "device reset with a frame still recording"
        );

        // tear down everything scoped to the old device
        self.wait_for_idle();
        for allocator in &self.cpu_descriptors {
            allocator.on_device_lost();
        }
        self.gpu_views.on_device_lost();
        self.gpu_samplers.on_device_lost();
        self.upload.on_device_lost();
        self.readback.on_device_lost();
        self.dynamic_buffers.on_device_lost();
        self.static_buffers.on_device_lost();
        self.textures.on_device_lost();
        self.targets.on_device_lost();
        self.object_cache.on_device_lost();
        *self.video_memory.lock() = VideoMemoryInfo::default();

        let device = match Self::select_device(self.backend.as_ref(), self.feature_level, true) {
            Ok((adapter, device)) => {
                self.adapters_hash
                    .store(self.backend.adapters_hash(), Ordering::Release);
                self.outputs_hash
                    .store(self.backend.outputs_hash(&adapter), Ordering::Release);
                *self.adapter.write() = adapter;
                device
            }
            Err(err) => {
                log::error!("device reset failed: {err}");
                return false;
            }
        };

        self.heap_not_resident
            .store(probe_heap_not_resident(device.as_ref()), Ordering::Release);
        self.queues.attach_device(device.clone());
        if let Err(err) = self.restore_allocators(&device) {
            log::error!("failed to restore allocators after reset: {err}");
            return false;
        }
        self.object_cache.on_device_restored(device.clone());
        *self.video_memory.lock() = device.video_memory_info();
        *self.device.write() = device;

        // the child walk runs entirely against the fresh device: save state
        // highest priority first, then rebuild lowest priority first
        let snapshot = self.children.snapshot();
        let mut saved: Vec<Option<Box<dyn std::any::Any + Send>>> =
            (0..snapshot.len()).map(|_| None).collect();
        for (i, row) in snapshot.iter().enumerate().rev() {
            if let Some(child) = self.live_child(row) {
                saved[i] = child.before_reset();
            }
        }
        for (i, row) in snapshot.iter().enumerate() {
            if let Some(child) = self.live_child(row) {
                if !child.reset(self, saved[i].take()) {
                    log::warn!("a device child failed to reset; unregistering it");
                    self.children.unregister(row.handle);
                    status = false;
                }
            }
        }
        for row in &snapshot {
            if let Some(child) = self.live_child(row) {
                if !child.after_reset(self) {
                    log::warn!("a device child failed its post-reset fixup; unregistering it");
                    self.children.unregister(row.handle);
                    status = false;
                }
            }
        }

        log::info!("device reset finished (status: {status})");
        status
    }

    fn restore_allocators(&self, device: &Arc<dyn NativeDevice>) -> Result<(), GpuError> {
        for allocator in &self.cpu_descriptors {
            allocator.on_device_restored(device.clone())?;
        }
        self.gpu_views.on_device_restored(device.clone())?;
        self.gpu_samplers.on_device_restored(device.clone())?;
        self.upload.on_device_restored(device.clone())?;
        self.readback.on_device_restored(device.clone())?;
        self.dynamic_buffers.on_device_restored(device.clone())?;
        self.static_buffers.on_device_restored(device.clone());
        self.textures.on_device_restored(device.clone());
        self.targets.on_device_restored(device.clone());
        Ok(())
    }

    /// Register `child` for device reset notifications.
    pub fn register_child(
        &self,
        child: &Arc<dyn DeviceChild>,
        priority: ResetPriority,
    ) -> DeviceChildHandle {
        self.children.register(child, priority)
    }

    fn live_child(&self, row: &RegisteredChild) -> Option<Arc<dyn DeviceChild>> {
        if !self.children.contains(row.handle) {
            return None;
        }
        row.child.upgrade()
    }
}

struct ResetGuard<'a>(&'a AtomicBool);

impl Drop for ResetGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

fn probe_heap_not_resident(device: &dyn NativeDevice) -> bool {
    device.interface_version() >= HEAP_RESIDENCY_INTERFACE
        && device.supports_option(DeviceOption::CreateHeapNotResident)
}

impl Drop for GraphicsContext {
    fn drop(&mut self) {
        debug_assert!(
            self.frame.get_mut().is_none(),
            "graphics context dropped with a frame still recording"
        );
        self.wait_for_idle();
        log::info!(
            "graphics context shut down after {} frames",
            self.frame_count()
        );
    }
}

impl std::fmt::Debug for GraphicsContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GraphicsContext")
            .field("adapter", &self.adapter.read().name)
            .field("feature_level", &self.feature_level)
            .field("device_valid", &self.device_valid())
            .field("frame_count", &self.frame_count())
            .field("children", &self.children.len())
            .finish()
    }
}

static_assertions::assert_impl_all!(GraphicsContext: Send, Sync);

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::dummy::DummyBackend;
    use crate::host::NullHost;

    fn context(backend: Arc<DummyBackend>) -> GraphicsContext {
        GraphicsContext::with_backend(backend, Arc::new(NullHost), FeatureLevel::default())
            .unwrap()
    }

    #[test]
    fn test_creation_picks_hardware_adapter() {
        let backend = Arc::new(DummyBackend::new());
        let context = context(backend);
        assert_eq!(context.adapter().name, "Dummy Discrete Adapter");
        assert!(context.device_valid());
    }

    #[test]
    fn test_software_fallback() {
        let backend = Arc::new(DummyBackend::new());
        backend.fail_hardware_device_creation(true);
        let context = context(backend);
        assert_eq!(context.adapter().name, "Dummy Software Adapter");
    }

    #[test]
    fn test_no_adapters_fails() {
        let backend = Arc::new(DummyBackend::with_no_adapters());
        let result =
            GraphicsContext::with_backend(backend, Arc::new(NullHost), FeatureLevel::default());
        assert!(matches!(result, Err(GpuError::NoAdapter)));
    }

    #[test]
    fn test_frame_cycle() {
        let backend = Arc::new(DummyBackend::new());
        let context = context(backend);

        assert_eq!(context.frame_count(), 0);
        {
            let mut frame = context.frame_started().unwrap();
            frame.begin_event(GpuEvent::DrawBatch);
            frame.end_event();
        }
        let fence = context.frame_complete().unwrap();
        assert!(fence.is_complete());
        assert_eq!(context.frame_count(), 1);
    }

    #[test]
    fn test_frame_misuse_errors() {
        let backend = Arc::new(DummyBackend::new());
        let context = context(backend);

        assert!(matches!(
            context.frame_complete(),
            Err(GpuError::FrameNotOpen)
        ));

        let frame = context.frame_started().unwrap();
        drop(frame);
        assert!(matches!(
            context.frame_started(),
            Err(GpuError::FrameAlreadyOpen)
        ));
        context.frame_complete().unwrap();
    }

    #[test]
    fn test_heap_residency_probe_needs_both_conditions() {
        let backend = Arc::new(DummyBackend::new());
        let context = context(backend.clone());
        assert!(context.supports_create_heap_not_resident());

        let device = backend.current_device().unwrap();
        // a recent interface without the capability is not enough
        device.set_heap_not_resident_option(false);
        assert!(!probe_heap_not_resident(device.as_ref()));
        // nor is the capability on an interface too old for it
        device.set_heap_not_resident_option(true);
        device.set_interface_version(7);
        assert!(!probe_heap_not_resident(device.as_ref()));
        device.set_interface_version(8);
        assert!(probe_heap_not_resident(device.as_ref()));
    }

    #[test]
    fn test_heap_residency_recomputed_on_reset() {
        let backend = Arc::new(DummyBackend::new());
        let context = context(backend.clone());

        let device = backend.current_device().unwrap();
        device.set_heap_not_resident_option(false);
        device.invalidate("simulated removal");
        assert!(context.reset_device(true));
        // the probe ran against the fresh device, not the removed one
        assert!(context.supports_create_heap_not_resident());
    }
}
