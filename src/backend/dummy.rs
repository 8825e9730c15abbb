//! Dummy (software) GPU backend.
//!
//! This backend performs no real GPU work but implements the full backend
//! contract, including the failure paths the lifecycle layer has to recover
//! from. Tests drive it to simulate device removal, display topology changes,
//! adapters that cannot create devices, and a GPU that lags behind the CPU
//! (manual completion mode).

use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::descriptor::DescriptorHeapType;
use crate::error::GpuError;
use crate::fence::Fence;
use crate::memory::{HeapFlags, HeapUsage};
use crate::object_cache::{PipelineDesc, RootSignatureDesc};
use crate::queue::{CommandList, QueueKind};
use crate::types::{AdapterInfo, AdapterType, DeviceOption, FeatureLevel, GpuEvent, VideoMemoryInfo};

use super::{
    GpuBackend, NativeDescriptorHeap, NativeDevice, NativeHeap, NativePipeline,
    NativeRootSignature,
};

/// Default simulated video memory budget (256 MiB).
const DEFAULT_BUDGET: u64 = 256 << 20;

fn hash_one<T: Hash>(value: &T) -> u64 {
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    value.hash(&mut hasher);
    hasher.finish()
}

/// Software backend, always available.
pub struct DummyBackend {
    adapters: Mutex<Vec<AdapterInfo>>,
    current: AtomicBool,
    fail_all_devices: AtomicBool,
    fail_hardware_devices: AtomicBool,
    manual_gpu: AtomicBool,
    devices: Mutex<Vec<Arc<DummyDevice>>>,
}

impl DummyBackend {
    /// Create a backend exposing one discrete adapter and one software
    /// fallback adapter.
    pub fn new() -> Self {
        Self::with_adapters(vec![
            AdapterInfo {
                name: "Dummy Discrete Adapter".to_string(),
                vendor: "Ember".to_string(),
                device_type: AdapterType::Discrete,
                outputs: 1,
            },
            AdapterInfo {
                name: "Dummy Software Adapter".to_string(),
                vendor: "Ember".to_string(),
                device_type: AdapterType::Software,
                outputs: 0,
            },
        ])
    }

    /// Create a backend with an explicit adapter list.
    pub fn with_adapters(adapters: Vec<AdapterInfo>) -> Self {
        Self {
            adapters: Mutex::new(adapters),
            current: AtomicBool::new(true),
            fail_all_devices: AtomicBool::new(false),
            fail_hardware_devices: AtomicBool::new(false),
            manual_gpu: AtomicBool::new(false),
            devices: Mutex::new(Vec::new()),
        }
    }

    /// Create a backend that enumerates no adapters at all.
    pub fn with_no_adapters() -> Self {
        Self::with_adapters(Vec::new())
    }

    /// Replace the adapter list and mark the enumeration state stale, as if
    /// the display topology changed.
    pub fn set_adapters(&self, adapters: Vec<AdapterInfo>) {
        *self.adapters.lock() = adapters;
        self.current.store(false, Ordering::Release);
    }

    /// Mark the enumeration state stale without changing the adapter list.
    pub fn invalidate_factory(&self) {
        self.current.store(false, Ordering::Release);
    }

    /// Make every `create_device` call fail.
    pub fn fail_device_creation(&self, fail: bool) {
        self.fail_all_devices.store(fail, Ordering::Release);
    }

    /// Make `create_device` fail for hardware adapters only, forcing the
    /// software fallback path.
    pub fn fail_hardware_device_creation(&self, fail: bool) {
        self.fail_hardware_devices.store(fail, Ordering::Release);
    }

    /// When true, devices created from now on hold submissions in flight
    /// until [`DummyDevice::complete_gpu_work`] is called.
    pub fn set_manual_gpu(&self, manual: bool) {
        self.manual_gpu.store(manual, Ordering::Release);
    }

    /// The most recently created device, if any.
    pub fn current_device(&self) -> Option<Arc<DummyDevice>> {
        self.devices.lock().last().cloned()
    }

    /// How many devices this backend has created over its lifetime.
    pub fn device_count(&self) -> usize {
        self.devices.lock().len()
    }
}

impl Default for DummyBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl GpuBackend for DummyBackend {
    fn name(&self) -> &'static str {
        "Dummy"
    }

    fn is_current(&self) -> bool {
        self.current.load(Ordering::Acquire)
    }

    fn refresh(&self) -> Result<(), GpuError> {
        self.current.store(true, Ordering::Release);
        log::debug!("DummyBackend: enumeration state refreshed");
        Ok(())
    }

    fn enumerate_adapters(&self) -> Vec<AdapterInfo> {
        let mut adapters = self.adapters.lock().clone();
        // hardware adapters first, software fallback last
        adapters.sort_by_key(|a| a.device_type == AdapterType::Software);
        adapters
    }

    fn adapters_hash(&self) -> u64 {
        hash_one(&self.enumerate_adapters())
    }

    fn outputs_hash(&self, adapter: &AdapterInfo) -> u64 {
        hash_one(&(&adapter.name, adapter.outputs))
    }

    fn create_device(
        &self,
        adapter: &AdapterInfo,
        feature_level: FeatureLevel,
        enable_debug_layer: bool,
    ) -> Result<Arc<dyn NativeDevice>, GpuError> {
        if self.fail_all_devices.load(Ordering::Acquire)
            || (self.fail_hardware_devices.load(Ordering::Acquire)
                && adapter.device_type != AdapterType::Software)
        {
            return Err(GpuError::InitializationFailed(format!(
                "device creation refused on '{}'",
                adapter.name
            )));
        }

        let device = Arc::new(DummyDevice::new(
            adapter.clone(),
            feature_level,
            enable_debug_layer,
            !self.manual_gpu.load(Ordering::Acquire),
        ));
        self.devices.lock().push(device.clone());
        log::debug!(
            "DummyBackend: created device on '{}' ({:?})",
            adapter.name,
            feature_level
        );
        Ok(device)
    }
}

struct PendingSignal {
    queue: QueueKind,
    fence: Arc<Fence>,
    value: u64,
    label: String,
}

/// Software logical device with test controls.
pub struct DummyDevice {
    adapter: AdapterInfo,
    feature_level: FeatureLevel,
    debug_layer: bool,

    valid: AtomicBool,
    removal_reason: Mutex<Option<String>>,
    interface_version: AtomicU32,
    option_heap_not_resident: AtomicBool,

    budget: AtomicU64,
    heap_bytes: AtomicU64,
    has_budget_event: AtomicBool,
    budget_changed: AtomicBool,

    /// Completes submissions during `execute` when set; otherwise they stay
    /// pending until `complete_gpu_work`/`wait_queue_idle`.
    immediate: AtomicBool,
    pending: Mutex<Vec<PendingSignal>>,

    next_handle: AtomicU64,
    heaps: Mutex<HashMap<u64, u64>>,
    descriptor_heaps: Mutex<HashMap<u64, (DescriptorHeapType, u32)>>,
    pipelines: Mutex<HashMap<u64, PipelineDesc>>,
    root_signatures: Mutex<HashMap<u64, RootSignatureDesc>>,
    marker_depth: Mutex<[i32; 3]>,
}

impl DummyDevice {
    fn new(
        adapter: AdapterInfo,
        feature_level: FeatureLevel,
        debug_layer: bool,
        immediate: bool,
    ) -> Self {
        if debug_layer {
            log::debug!("DummyDevice: debug layer enabled");
        }
        Self {
            adapter,
            feature_level,
            debug_layer,
            valid: AtomicBool::new(true),
            removal_reason: Mutex::new(None),
            interface_version: AtomicU32::new(8),
            option_heap_not_resident: AtomicBool::new(true),
            budget: AtomicU64::new(DEFAULT_BUDGET),
            heap_bytes: AtomicU64::new(0),
            has_budget_event: AtomicBool::new(true),
            budget_changed: AtomicBool::new(false),
            immediate: AtomicBool::new(immediate),
            pending: Mutex::new(Vec::new()),
            next_handle: AtomicU64::new(1),
            heaps: Mutex::new(HashMap::new()),
            descriptor_heaps: Mutex::new(HashMap::new()),
            pipelines: Mutex::new(HashMap::new()),
            root_signatures: Mutex::new(HashMap::new()),
            marker_depth: Mutex::new([0; 3]),
        }
    }

    fn alloc_handle(&self) -> u64 {
        self.next_handle.fetch_add(1, Ordering::Relaxed)
    }

    fn ensure_valid(&self) -> Result<(), GpuError> {
        if self.is_valid() {
            Ok(())
        } else {
            let reason = self
                .removal_reason
                .lock()
                .clone()
                .unwrap_or_else(|| "unknown".to_string());
            Err(GpuError::DeviceLost(reason))
        }
    }

    /// Whether the debug layer was requested at creation.
    pub fn debug_layer_enabled(&self) -> bool {
        self.debug_layer
    }

    /// Simulate device removal by the driver/OS.
    pub fn invalidate(&self, reason: &str) {
        log::debug!("DummyDevice: simulating removal: {reason}");
        *self.removal_reason.lock() = Some(reason.to_string());
        self.valid.store(false, Ordering::Release);
    }

    /// Hold submissions in flight until [`complete_gpu_work`] when `false`.
    ///
    /// [`complete_gpu_work`]: DummyDevice::complete_gpu_work
    pub fn set_immediate(&self, immediate: bool) {
        self.immediate.store(immediate, Ordering::Release);
    }

    /// Complete every in-flight submission, signaling its fence.
    pub fn complete_gpu_work(&self) {
        let drained: Vec<PendingSignal> = self.pending.lock().drain(..).collect();
        for pending in drained {
            log::trace!(
                "DummyDevice: completing '{}' on {} queue, fence value {}",
                pending.label,
                pending.queue.name(),
                pending.value
            );
            pending.fence.set_completed(pending.value);
        }
    }

    /// Number of submissions still in flight.
    pub fn pending_submissions(&self) -> usize {
        self.pending.lock().len()
    }

    /// Override the reported device interface revision.
    pub fn set_interface_version(&self, version: u32) {
        self.interface_version.store(version, Ordering::Release);
    }

    /// Override the heap-residency-control capability probe.
    pub fn set_heap_not_resident_option(&self, supported: bool) {
        self.option_heap_not_resident
            .store(supported, Ordering::Release);
    }

    /// Pretend the adapter has no budget-change notification support.
    pub fn set_has_budget_event(&self, has_event: bool) {
        self.has_budget_event.store(has_event, Ordering::Release);
    }

    /// Change the simulated budget and raise the budget-change notification.
    pub fn signal_budget_change(&self, new_budget: u64) {
        self.budget.store(new_budget, Ordering::Release);
        self.budget_changed.store(true, Ordering::Release);
    }

    /// Number of live memory heaps.
    pub fn live_heap_count(&self) -> usize {
        self.heaps.lock().len()
    }

    /// Total bytes held by live memory heaps.
    pub fn live_heap_bytes(&self) -> u64 {
        self.heap_bytes.load(Ordering::Acquire)
    }

    /// Number of live descriptor heaps.
    pub fn live_descriptor_heap_count(&self) -> usize {
        self.descriptor_heaps.lock().len()
    }

    /// Number of live pipelines.
    pub fn live_pipeline_count(&self) -> usize {
        self.pipelines.lock().len()
    }
}

impl NativeDevice for DummyDevice {
    fn adapter(&self) -> AdapterInfo {
        self.adapter.clone()
    }

    fn feature_level(&self) -> FeatureLevel {
        self.feature_level
    }

    fn is_valid(&self) -> bool {
        self.valid.load(Ordering::Acquire)
    }

    fn removal_reason(&self) -> Option<String> {
        self.removal_reason.lock().clone()
    }

    fn interface_version(&self) -> u32 {
        self.interface_version.load(Ordering::Acquire)
    }

    fn supports_option(&self, option: DeviceOption) -> bool {
        match option {
            DeviceOption::CreateHeapNotResident => {
                self.option_heap_not_resident.load(Ordering::Acquire)
            }
        }
    }

    fn remove(&self, reason: &str) {
        self.invalidate(reason);
    }

    fn video_memory_info(&self) -> VideoMemoryInfo {
        let budget = self.budget.load(Ordering::Acquire);
        VideoMemoryInfo {
            budget,
            current_usage: self.heap_bytes.load(Ordering::Acquire),
            available_for_reservation: budget / 2,
            current_reservation: 0,
        }
    }

    fn has_budget_event(&self) -> bool {
        self.has_budget_event.load(Ordering::Acquire)
    }

    fn take_budget_change(&self) -> bool {
        self.budget_changed.swap(false, Ordering::AcqRel)
    }

    fn create_heap(
        &self,
        size: u64,
        usage: HeapUsage,
        flags: HeapFlags,
    ) -> Result<NativeHeap, GpuError> {
        self.ensure_valid()?;
        if size == 0 {
            return Err(GpuError::InvalidParameter(
                "heap size cannot be zero".to_string(),
            ));
        }

        let handle = self.alloc_handle();
        self.heaps.lock().insert(handle, size);
        self.heap_bytes.fetch_add(size, Ordering::AcqRel);
        log::trace!(
            "DummyDevice: created heap {handle} ({size} bytes, {usage:?}, flags {flags:?})"
        );
        Ok(NativeHeap(handle))
    }

    fn destroy_heap(&self, heap: NativeHeap) {
        match self.heaps.lock().remove(&heap.0) {
            Some(size) => {
                self.heap_bytes.fetch_sub(size, Ordering::AcqRel);
                log::trace!("DummyDevice: destroyed heap {} ({size} bytes)", heap.0);
            }
            None => log::warn!("DummyDevice: destroy of unknown heap {}", heap.0),
        }
    }

    fn create_descriptor_heap(
        &self,
        ty: DescriptorHeapType,
        capacity: u32,
        shader_visible: bool,
    ) -> Result<NativeDescriptorHeap, GpuError> {
        self.ensure_valid()?;
        if capacity == 0 {
            return Err(GpuError::InvalidParameter(
                "descriptor heap capacity cannot be zero".to_string(),
            ));
        }

        let handle = self.alloc_handle();
        self.descriptor_heaps.lock().insert(handle, (ty, capacity));
        log::trace!(
            "DummyDevice: created descriptor heap {handle} ({ty:?}, {capacity} slots, shader_visible={shader_visible})"
        );
        Ok(NativeDescriptorHeap(handle))
    }

    fn destroy_descriptor_heap(&self, heap: NativeDescriptorHeap) {
        if self.descriptor_heaps.lock().remove(&heap.0).is_none() {
            log::warn!("DummyDevice: destroy of unknown descriptor heap {}", heap.0);
        }
    }

    fn create_pipeline(&self, desc: &PipelineDesc) -> Result<NativePipeline, GpuError> {
        self.ensure_valid()?;
        let handle = self.alloc_handle();
        self.pipelines.lock().insert(handle, desc.clone());
        Ok(NativePipeline(handle))
    }

    fn destroy_pipeline(&self, pipeline: NativePipeline) {
        if self.pipelines.lock().remove(&pipeline.0).is_none() {
            log::warn!("DummyDevice: destroy of unknown pipeline {}", pipeline.0);
        }
    }

    fn create_root_signature(
        &self,
        desc: &RootSignatureDesc,
    ) -> Result<NativeRootSignature, GpuError> {
        self.ensure_valid()?;
        let handle = self.alloc_handle();
        self.root_signatures.lock().insert(handle, desc.clone());
        Ok(NativeRootSignature(handle))
    }

    fn destroy_root_signature(&self, signature: NativeRootSignature) {
        if self.root_signatures.lock().remove(&signature.0).is_none() {
            log::warn!(
                "DummyDevice: destroy of unknown root signature {}",
                signature.0
            );
        }
    }

    fn execute(&self, queue: QueueKind, commands: CommandList, fence: &Arc<Fence>, value: u64) {
        if !self.is_valid() {
            // a removed device drops the work but must not hang the CPU
            log::warn!(
                "DummyDevice: dropping '{}' submitted to a removed device",
                commands.label
            );
            fence.set_completed(value);
            return;
        }

        log::trace!(
            "DummyDevice: executing '{}' on {} queue ({} events), fence value {}",
            commands.label,
            queue.name(),
            commands.events.len(),
            value
        );

        if self.immediate.load(Ordering::Acquire) {
            fence.set_completed(value);
        } else {
            self.pending.lock().push(PendingSignal {
                queue,
                fence: fence.clone(),
                value,
                label: commands.label,
            });
        }
    }

    fn wait_queue_idle(&self, queue: QueueKind) {
        let mut drained = Vec::new();
        {
            let mut pending = self.pending.lock();
            let mut i = 0;
            while i < pending.len() {
                if pending[i].queue == queue {
                    drained.push(pending.remove(i));
                } else {
                    i += 1;
                }
            }
        }
        for pending in drained {
            pending.fence.set_completed(pending.value);
        }
    }

    fn push_marker(&self, queue: QueueKind, event: GpuEvent) {
        self.marker_depth.lock()[queue.index()] += 1;
        log::trace!("DummyDevice: [{}] begin {}", queue.name(), event.name());
    }

    fn pop_marker(&self, queue: QueueKind) {
        let mut depth = self.marker_depth.lock();
        debug_assert!(depth[queue.index()] > 0, "pop_marker without push_marker");
        depth[queue.index()] -= 1;
        log::trace!("DummyDevice: [{}] end", queue.name());
    }
}

impl std::fmt::Debug for DummyDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DummyDevice")
            .field("adapter", &self.adapter.name)
            .field("valid", &self.is_valid())
            .field("live_heaps", &self.live_heap_count())
            .field("pending", &self.pending_submissions())
            .finish()
    }
}

static_assertions::assert_impl_all!(DummyBackend: Send, Sync);
static_assertions::assert_impl_all!(DummyDevice: Send, Sync);

#[cfg(test)]
mod tests {
    use super::*;

    fn device(backend: &DummyBackend) -> Arc<dyn NativeDevice> {
        let adapter = backend.enumerate_adapters().remove(0);
        backend
            .create_device(&adapter, FeatureLevel::default(), false)
            .unwrap()
    }

    #[test]
    fn test_adapter_ordering_puts_software_last() {
        let backend = DummyBackend::new();
        let adapters = backend.enumerate_adapters();
        assert_eq!(adapters[0].device_type, AdapterType::Discrete);
        assert_eq!(
            adapters.last().unwrap().device_type,
            AdapterType::Software
        );
    }

    #[test]
    fn test_topology_change_invalidates_and_rehashes() {
        let backend = DummyBackend::new();
        let before = backend.adapters_hash();
        assert!(backend.is_current());

        backend.set_adapters(vec![AdapterInfo {
            name: "Replaced".to_string(),
            vendor: "Ember".to_string(),
            device_type: AdapterType::Integrated,
            outputs: 2,
        }]);
        assert!(!backend.is_current());
        backend.refresh().unwrap();
        assert_ne!(backend.adapters_hash(), before);
    }

    #[test]
    fn test_device_removal() {
        let backend = DummyBackend::new();
        let device = device(&backend);
        assert!(device.is_valid());
        assert!(device.removal_reason().is_none());

        device.remove("test corruption");
        assert!(!device.is_valid());
        assert_eq!(device.removal_reason().unwrap(), "test corruption");
        assert!(device
            .create_heap(1024, HeapUsage::Upload, HeapFlags::empty())
            .is_err());
    }

    #[test]
    fn test_heap_accounting() {
        let backend = DummyBackend::new();
        let device = device(&backend);

        let heap = device
            .create_heap(4096, HeapUsage::GpuTextures, HeapFlags::empty())
            .unwrap();
        assert_eq!(device.video_memory_info().current_usage, 4096);
        device.destroy_heap(heap);
        assert_eq!(device.video_memory_info().current_usage, 0);
    }

    #[test]
    fn test_manual_completion_mode() {
        let backend = DummyBackend::new();
        backend.set_manual_gpu(true);
        let device = device(&backend);
        let dummy = backend.current_device().unwrap();

        let fence = Fence::new("test", Some(QueueKind::Direct));
        let value = fence.issue();
        device.execute(
            QueueKind::Direct,
            CommandList {
                queue: QueueKind::Direct,
                label: "work".to_string(),
                events: Vec::new(),
            },
            &fence,
            value,
        );
        assert!(!fence.reached(value));
        assert_eq!(dummy.pending_submissions(), 1);

        dummy.complete_gpu_work();
        assert!(fence.reached(value));
    }

    #[test]
    fn test_budget_event_auto_reset() {
        let backend = DummyBackend::new();
        let device = device(&backend);
        let dummy = backend.current_device().unwrap();

        assert!(!device.take_budget_change());
        dummy.signal_budget_change(128 << 20);
        assert!(device.take_budget_change());
        assert!(!device.take_budget_change());
        assert_eq!(device.video_memory_info().budget, 128 << 20);
    }
}
