//! Common types shared between the graphics context and its backends.

/// Information about a graphics adapter.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct AdapterInfo {
    /// Adapter name.
    pub name: String,
    /// Adapter vendor.
    pub vendor: String,
    /// Device type (discrete, integrated, etc.).
    pub device_type: AdapterType,
    /// Number of display outputs attached to this adapter.
    pub outputs: u32,
}

/// Type of graphics adapter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AdapterType {
    /// Discrete GPU (dedicated graphics card).
    Discrete,
    /// Integrated GPU (shared with CPU).
    Integrated,
    /// Software renderer.
    Software,
    /// Unknown adapter type.
    Unknown,
}

/// Minimum GPU feature level requested at device creation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub enum FeatureLevel {
    /// Baseline feature level.
    #[default]
    Level11_0,
    Level11_1,
    Level12_0,
    Level12_1,
    Level12_2,
}

/// Snapshot of the adapter's video memory budget and usage.
///
/// Refreshed opportunistically when the adapter signals a budget change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct VideoMemoryInfo {
    /// How many bytes the OS currently budgets for this process.
    pub budget: u64,
    /// How many bytes this process currently has resident.
    pub current_usage: u64,
    /// How many bytes could still be reserved.
    pub available_for_reservation: u64,
    /// How many bytes are currently reserved.
    pub current_reservation: u64,
}

/// Profiling markers recorded around GPU work.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GpuEvent {
    /// One rendered frame on the direct queue.
    RenderFrame,
    /// Upload of CPU data to GPU memory.
    CopyUpload,
    /// Readback of GPU data to CPU memory.
    CopyReadback,
    /// A compute dispatch.
    ComputePass,
    /// A batched draw submission.
    DrawBatch,
}

impl GpuEvent {
    /// Marker name as shown in capture tools.
    pub fn name(self) -> &'static str {
        match self {
            Self::RenderFrame => "render_frame",
            Self::CopyUpload => "copy_upload",
            Self::CopyReadback => "copy_readback",
            Self::ComputePass => "compute_pass",
            Self::DrawBatch => "draw_batch",
        }
    }
}

/// Optional device capabilities probed after device creation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeviceOption {
    /// Heaps can be created without being made resident up front.
    CreateHeapNotResident,
}
