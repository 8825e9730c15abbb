//! # Ember GPU
//!
//! GPU device and resource lifecycle management for the Ember engine.
//!
//! ## Overview
//!
//! This crate provides:
//! - [`GraphicsContext`] - Owner of the device, queues, allocators, and caches
//! - [`backend`] - Trait seam for native GPU backends, plus a Dummy backend
//!   for testing
//! - [`DeviceChild`] - Reset protocol for resources that must survive device
//!   removal and display topology changes
//! - Fence-based lifetime tracking: ring allocators, keep-alive deferred
//!   destruction, and per-queue fences
//!
//! ## Example
//!
//! ```ignore
//! use ember_gpu::{GraphicsContext, NullHost};
//! use std::sync::Arc;
//!
//! let context = GraphicsContext::new(Arc::new(NullHost))?;
//! let mut frame = context.frame_started()?;
//! // record frame commands...
//! drop(frame);
//! context.frame_complete()?;
//! ```

pub mod backend;
pub mod context;
pub mod descriptor;
pub mod device_child;
pub mod error;
pub mod fence;
pub mod host;
pub mod keep_alive;
pub mod memory;
pub mod object_cache;
pub mod queue;
pub mod types;

// Re-export main types for convenience
pub use backend::{GpuBackend, NativeDevice};
pub use context::GraphicsContext;
pub use descriptor::{DescriptorAllocator, DescriptorHeapType, DescriptorRange};
pub use device_child::{DeviceChild, DeviceChildHandle, DeviceChildRegistry, ResetPriority};
pub use error::GpuError;
pub use fence::{Fence, FenceValue, FenceValues};
pub use host::{HostCallbacks, NullHost};
pub use keep_alive::KeepAlive;
pub use memory::{HeapFlags, HeapUsage, MemAllocator, RingAllocator};
pub use object_cache::{ObjectCache, Pipeline, PipelineDesc, RootSignature, RootSignatureDesc};
pub use queue::{CommandContext, Queue, QueueKind, Queues};
pub use types::{AdapterInfo, AdapterType, FeatureLevel, GpuEvent, VideoMemoryInfo};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Initialize the graphics subsystem.
///
/// This should be called before creating a [`GraphicsContext`].
pub fn init() {
    log::info!("Ember GPU v{VERSION} initialized");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert!(!VERSION.is_empty());
    }

    #[test]
    fn test_dummy_backend() {
        let backend = backend::dummy::DummyBackend::new();
        assert_eq!(GpuBackend::name(&backend), "Dummy");
    }
}
