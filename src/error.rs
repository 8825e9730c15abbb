//! GPU lifecycle error types.

use thiserror::Error;

use crate::descriptor::DescriptorHeapType;
use crate::memory::HeapUsage;

/// Errors that can occur in the GPU lifecycle layer.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GpuError {
    /// Failed to initialize the graphics system.
    #[error("initialization failed: {0}")]
    InitializationFailed(String),
    /// No adapter was able to create a device.
    #[error("no compatible graphics adapter found")]
    NoAdapter,
    /// The GPU device was removed or reset.
    #[error("device lost: {0}")]
    DeviceLost(String),
    /// `frame_started` was called while a frame was already recording.
    #[error("a frame is already recording")]
    FrameAlreadyOpen,
    /// `frame_complete` was called without an open frame.
    #[error("no frame is recording")]
    FrameNotOpen,
    /// A descriptor heap ran out of free slots.
    #[error("descriptor heap {0:?} exhausted")]
    DescriptorsExhausted(DescriptorHeapType),
    /// A ring allocator could not satisfy a request without overwriting
    /// memory still referenced by in-flight GPU work.
    #[error("ring allocator full: needed {needed} bytes of {capacity}")]
    RingFull { needed: u64, capacity: u64 },
    /// A heap pool reached its configured maximum size.
    #[error("memory pool for {usage:?} exhausted: requested {requested} bytes")]
    PoolExhausted { usage: HeapUsage, requested: u64 },
    /// Failed to create a native resource.
    #[error("resource creation failed: {0}")]
    ResourceCreationFailed(String),
    /// An invalid parameter was provided.
    #[error("invalid parameter: {0}")]
    InvalidParameter(String),
}
