//! Native GPU backend abstraction.
//!
//! The graphics context talks to the platform through two trait seams:
//!
//! - [`GpuBackend`] is the display/enumeration layer (the factory): adapter
//!   enumeration ordered by GPU preference, topology hashing for detecting
//!   adapter/output changes, and device creation.
//! - [`NativeDevice`] is one logical device: validity and removed-reason
//!   queries, video memory budget, native heap and descriptor heap creation,
//!   and fenced command execution per queue kind.
//!
//! The [`dummy`] backend is a software implementation that is always compiled
//! and backs the test suite; native backends plug in behind the same traits.

pub mod dummy;

use std::sync::Arc;

use crate::descriptor::DescriptorHeapType;
use crate::error::GpuError;
use crate::fence::Fence;
use crate::memory::{HeapFlags, HeapUsage};
use crate::object_cache::{PipelineDesc, RootSignatureDesc};
use crate::queue::{CommandList, QueueKind};
use crate::types::{AdapterInfo, DeviceOption, FeatureLevel, GpuEvent, VideoMemoryInfo};

/// Handle to a native GPU memory heap.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NativeHeap(pub(crate) u64);

/// Handle to a native descriptor heap.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NativeDescriptorHeap(pub(crate) u64);

/// Handle to a native pipeline state object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NativePipeline(pub(crate) u64);

/// Handle to a native root signature.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NativeRootSignature(pub(crate) u64);

/// The display/enumeration layer (factory analogue).
pub trait GpuBackend: Send + Sync + 'static {
    /// Backend name for logs.
    fn name(&self) -> &'static str;

    /// Is the cached enumeration state still valid? Returns false after the
    /// display topology changed (adapters or outputs added/removed).
    fn is_current(&self) -> bool;

    /// Recreate enumeration state. Must be called when [`is_current`] returns
    /// false before trusting adapter/output hashes again.
    ///
    /// [`is_current`]: GpuBackend::is_current
    fn refresh(&self) -> Result<(), GpuError>;

    /// Enumerate adapters, high-performance hardware adapters first and
    /// software adapters last.
    fn enumerate_adapters(&self) -> Vec<AdapterInfo>;

    /// Hash of the current adapter list, for detecting topology changes.
    fn adapters_hash(&self) -> u64;

    /// Hash of the outputs attached to `adapter`.
    fn outputs_hash(&self, adapter: &AdapterInfo) -> u64;

    /// Create a logical device on `adapter`.
    fn create_device(
        &self,
        adapter: &AdapterInfo,
        feature_level: FeatureLevel,
        enable_debug_layer: bool,
    ) -> Result<Arc<dyn NativeDevice>, GpuError>;
}

/// One logical GPU device.
///
/// All methods must be callable from any thread. Execution is asynchronous:
/// `execute` queues work and the device signals `fence` with `value` once the
/// GPU reaches it.
pub trait NativeDevice: Send + Sync + 'static {
    /// The adapter this device was created on.
    fn adapter(&self) -> AdapterInfo;

    /// The feature level the device was created with.
    fn feature_level(&self) -> FeatureLevel;

    /// False once the device has been removed/reset by the driver or OS.
    fn is_valid(&self) -> bool;

    /// Why the device was removed, if it was.
    fn removal_reason(&self) -> Option<String>;

    /// Highest device interface revision available. Gates optional
    /// operations: explicit removal needs 5, heap residency control needs 8.
    fn interface_version(&self) -> u32;

    /// Probe an optional device capability.
    fn supports_option(&self, option: DeviceOption) -> bool;

    /// Forcibly remove the device so diagnostics surface a removal reason.
    /// Only meaningful when `interface_version() >= 5`.
    fn remove(&self, reason: &str);

    /// Current video memory budget/usage for the device's adapter.
    fn video_memory_info(&self) -> VideoMemoryInfo;

    /// Whether the adapter delivers budget-change notifications. When false,
    /// callers refresh the budget unconditionally.
    fn has_budget_event(&self) -> bool;

    /// Consume a pending budget-change notification (auto-reset semantics):
    /// returns true at most once per notification.
    fn take_budget_change(&self) -> bool;

    /// Create a memory heap of `size` bytes for `usage`.
    fn create_heap(
        &self,
        size: u64,
        usage: HeapUsage,
        flags: HeapFlags,
    ) -> Result<NativeHeap, GpuError>;

    /// Destroy a heap created by this device.
    fn destroy_heap(&self, heap: NativeHeap);

    /// Create a descriptor heap with `capacity` slots.
    fn create_descriptor_heap(
        &self,
        ty: DescriptorHeapType,
        capacity: u32,
        shader_visible: bool,
    ) -> Result<NativeDescriptorHeap, GpuError>;

    /// Destroy a descriptor heap created by this device.
    fn destroy_descriptor_heap(&self, heap: NativeDescriptorHeap);

    /// Create a pipeline state object.
    fn create_pipeline(&self, desc: &PipelineDesc) -> Result<NativePipeline, GpuError>;

    /// Destroy a pipeline created by this device.
    fn destroy_pipeline(&self, pipeline: NativePipeline);

    /// Create a root signature.
    fn create_root_signature(
        &self,
        desc: &RootSignatureDesc,
    ) -> Result<NativeRootSignature, GpuError>;

    /// Destroy a root signature created by this device.
    fn destroy_root_signature(&self, signature: NativeRootSignature);

    /// Execute recorded commands on `queue`, then signal `fence` with
    /// `value` once the GPU reaches them.
    fn execute(&self, queue: QueueKind, commands: CommandList, fence: &Arc<Fence>, value: u64);

    /// Block until all work queued on `queue` has signaled its fences.
    fn wait_queue_idle(&self, queue: QueueKind);

    /// Push a profiling marker on `queue`.
    fn push_marker(&self, queue: QueueKind, event: GpuEvent);

    /// Pop the innermost profiling marker on `queue`.
    fn pop_marker(&self, queue: QueueKind);
}

/// Select and create the backend for this platform.
pub fn create_backend() -> Result<Arc<dyn GpuBackend>, GpuError> {
    // Native backends slot in here ahead of the software fallback.
    let backend = dummy::DummyBackend::new();
    log::info!("Using GPU backend: {}", GpuBackend::name(&backend));
    Ok(Arc::new(backend))
}
