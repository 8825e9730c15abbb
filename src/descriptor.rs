//! Descriptor heap management.
//!
//! The context owns one [`DescriptorAllocator`] per CPU-visible heap type plus
//! two shader-visible (GPU) allocators for views and samplers. Allocations are
//! slot ranges inside a fixed-capacity native heap.
//!
//! Slot bookkeeping is independent of the native heap: when the device is
//! lost, only the native heap is destroyed and recreated, and every
//! outstanding [`DescriptorRange`] keeps its slot positions. Resources re-fill
//! their descriptors in place during device reset.

use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

use crate::backend::{NativeDescriptorHeap, NativeDevice};
use crate::error::GpuError;

/// Descriptor heap types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DescriptorHeapType {
    /// Constant buffer, shader resource, and unordered access views.
    CbvSrvUav,
    /// Samplers.
    Sampler,
    /// Render target views. Never shader visible.
    RenderTarget,
    /// Depth stencil views. Never shader visible.
    DepthStencil,
}

impl DescriptorHeapType {
    pub const ALL: [Self; 4] = [
        Self::CbvSrvUav,
        Self::Sampler,
        Self::RenderTarget,
        Self::DepthStencil,
    ];

    pub fn index(self) -> usize {
        match self {
            Self::CbvSrvUav => 0,
            Self::Sampler => 1,
            Self::RenderTarget => 2,
            Self::DepthStencil => 3,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::CbvSrvUav => "cbv_srv_uav",
            Self::Sampler => "sampler",
            Self::RenderTarget => "render_target",
            Self::DepthStencil => "depth_stencil",
        }
    }

    /// Default capacity for the CPU-visible staging heap of this type.
    pub fn default_cpu_capacity(self) -> u32 {
        match self {
            Self::CbvSrvUav => 256,
            Self::Sampler => 32,
            Self::RenderTarget => 32,
            Self::DepthStencil => 32,
        }
    }
}

/// Default capacity of the shader-visible view heap.
pub const GPU_VIEW_CAPACITY: u32 = 7936;
/// Default capacity of the shader-visible sampler heap.
pub const GPU_SAMPLER_CAPACITY: u32 = 1920;

/// A contiguous range of descriptor slots.
///
/// Ranges stay valid across device reset; only the descriptors written into
/// them must be re-filled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DescriptorRange {
    pub ty: DescriptorHeapType,
    pub first: u32,
    pub count: u32,
    pub shader_visible: bool,
}

/// Sorted free-range list over `0..capacity`.
struct FreeRanges {
    capacity: u32,
    /// Disjoint `(first, count)` ranges sorted by `first`.
    free: Vec<(u32, u32)>,
}

impl FreeRanges {
    fn new(capacity: u32) -> Self {
        Self {
            capacity,
            free: vec![(0, capacity)],
        }
    }

    fn allocate(&mut self, count: u32) -> Option<u32> {
        // first fit
        let i = self.free.iter().position(|&(_, len)| len >= count)?;
        let (first, len) = self.free[i];
        if len == count {
            self.free.remove(i);
        } else {
            self.free[i] = (first + count, len - count);
        }
        Some(first)
    }

    fn free(&mut self, first: u32, count: u32) {
        debug_assert!(first + count <= self.capacity);
        let i = self
            .free
            .partition_point(|&(start, _)| start < first);
        debug_assert!(
            i == 0 || {
                let (prev, len) = self.free[i - 1];
                prev + len <= first
            },
            "double free of descriptor range at {first}"
        );

        self.free.insert(i, (first, count));

        // coalesce with the right neighbor, then the left
        if i + 1 < self.free.len() && self.free[i].0 + self.free[i].1 == self.free[i + 1].0 {
            self.free[i].1 += self.free[i + 1].1;
            self.free.remove(i + 1);
        }
        if i > 0 && self.free[i - 1].0 + self.free[i - 1].1 == self.free[i].0 {
            self.free[i - 1].1 += self.free[i].1;
            self.free.remove(i);
        }
    }

    fn free_slots(&self) -> u32 {
        self.free.iter().map(|&(_, len)| len).sum()
    }
}

/// Slot allocator over one native descriptor heap.
pub struct DescriptorAllocator {
    ty: DescriptorHeapType,
    capacity: u32,
    shader_visible: bool,
    device: RwLock<Arc<dyn NativeDevice>>,
    heap: Mutex<Option<NativeDescriptorHeap>>,
    ranges: Mutex<FreeRanges>,
}

impl DescriptorAllocator {
    pub(crate) fn new(
        ty: DescriptorHeapType,
        capacity: u32,
        shader_visible: bool,
        device: Arc<dyn NativeDevice>,
    ) -> Result<Self, GpuError> {
        let heap = device.create_descriptor_heap(ty, capacity, shader_visible)?;
        Ok(Self {
            ty,
            capacity,
            shader_visible,
            device: RwLock::new(device),
            heap: Mutex::new(Some(heap)),
            ranges: Mutex::new(FreeRanges::new(capacity)),
        })
    }

    pub fn heap_type(&self) -> DescriptorHeapType {
        self.ty
    }

    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    pub fn shader_visible(&self) -> bool {
        self.shader_visible
    }

    /// Slots currently free.
    pub fn free_slots(&self) -> u32 {
        self.ranges.lock().free_slots()
    }

    /// Allocate a contiguous range of `count` slots.
    ///
    /// # Errors
    ///
    /// [`GpuError::DescriptorsExhausted`] when no contiguous run of `count`
    /// free slots exists.
    pub fn allocate_range(&self, count: u32) -> Result<DescriptorRange, GpuError> {
        if count == 0 {
            return Err(GpuError::InvalidParameter(
                "descriptor range count cannot be zero".to_string(),
            ));
        }
        let first = self
            .ranges
            .lock()
            .allocate(count)
            .ok_or(GpuError::DescriptorsExhausted(self.ty))?;
        Ok(DescriptorRange {
            ty: self.ty,
            first,
            count,
            shader_visible: self.shader_visible,
        })
    }

    /// Allocate a single slot.
    pub fn allocate(&self) -> Result<DescriptorRange, GpuError> {
        self.allocate_range(1)
    }

    /// Return a range to the free list.
    pub fn free_range(&self, range: DescriptorRange) {
        debug_assert_eq!(range.ty, self.ty, "range freed to the wrong allocator");
        debug_assert_eq!(range.shader_visible, self.shader_visible);
        self.ranges.lock().free(range.first, range.count);
    }

    /// Drop the native heap ahead of device teardown. Slot bookkeeping is
    /// untouched so outstanding ranges survive the reset.
    pub(crate) fn on_device_lost(&self) {
        if let Some(heap) = self.heap.lock().take() {
            self.device.read().destroy_descriptor_heap(heap);
        }
    }

    /// Recreate the native heap on a fresh device.
    pub(crate) fn on_device_restored(
        &self,
        device: Arc<dyn NativeDevice>,
    ) -> Result<(), GpuError> {
        let heap = device.create_descriptor_heap(self.ty, self.capacity, self.shader_visible)?;
        let old = self.heap.lock().replace(heap);
        debug_assert!(old.is_none(), "device restored without a matching loss");
        *self.device.write() = device;
        Ok(())
    }
}

impl Drop for DescriptorAllocator {
    fn drop(&mut self) {
        let used = self.capacity - self.ranges.get_mut().free_slots();
        if used > 0 {
            log::warn!(
                "descriptor allocator {} dropped with {used} slots still allocated",
                self.ty.name()
            );
        }
        if let Some(heap) = self.heap.get_mut().take() {
            self.device.get_mut().destroy_descriptor_heap(heap);
        }
    }
}

impl std::fmt::Debug for DescriptorAllocator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DescriptorAllocator")
            .field("type", &self.ty)
            .field("capacity", &self.capacity)
            .field("shader_visible", &self.shader_visible)
            .field("free_slots", &self.free_slots())
            .finish()
    }
}

static_assertions::assert_impl_all!(DescriptorAllocator: Send, Sync);

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::dummy::DummyBackend;
    use crate::backend::GpuBackend;
    use crate::types::FeatureLevel;

    fn test_device() -> Arc<dyn NativeDevice> {
        let backend = DummyBackend::new();
        let adapter = backend.enumerate_adapters().remove(0);
        backend
            .create_device(&adapter, FeatureLevel::default(), false)
            .unwrap()
    }

    fn allocator(capacity: u32) -> DescriptorAllocator {
        DescriptorAllocator::new(
            DescriptorHeapType::CbvSrvUav,
            capacity,
            false,
            test_device(),
        )
        .unwrap()
    }

    #[test]
    fn test_allocate_and_free_roundtrip() {
        let alloc = allocator(8);
        let a = alloc.allocate_range(3).unwrap();
        let b = alloc.allocate_range(5).unwrap();
        assert_eq!(a.first, 0);
        assert_eq!(b.first, 3);
        assert_eq!(alloc.free_slots(), 0);

        alloc.free_range(a);
        alloc.free_range(b);
        assert_eq!(alloc.free_slots(), 8);

        // coalesced back into one range
        let c = alloc.allocate_range(8).unwrap();
        assert_eq!(c.first, 0);
        alloc.free_range(c);
    }

    #[test]
    fn test_exhaustion() {
        let alloc = allocator(4);
        let a = alloc.allocate_range(4).unwrap();
        assert_eq!(
            alloc.allocate(),
            Err(GpuError::DescriptorsExhausted(DescriptorHeapType::CbvSrvUav))
        );
        alloc.free_range(a);
    }

    #[test]
    fn test_fragmentation_blocks_large_ranges() {
        let alloc = allocator(8);
        let a = alloc.allocate_range(2).unwrap();
        let b = alloc.allocate_range(2).unwrap();
        let c = alloc.allocate_range(2).unwrap();
        alloc.free_range(a);
        alloc.free_range(c);

        // 6 slots free but no contiguous run of 5
        assert_eq!(alloc.free_slots(), 6);
        assert!(alloc.allocate_range(5).is_err());
        alloc.free_range(b);
        assert!(alloc.allocate_range(5).is_ok());
    }

    #[test]
    fn test_ranges_survive_device_reset() {
        let backend = DummyBackend::new();
        let adapter = backend.enumerate_adapters().remove(0);
        let device = backend
            .create_device(&adapter, FeatureLevel::default(), false)
            .unwrap();
        let alloc =
            DescriptorAllocator::new(DescriptorHeapType::Sampler, 16, false, device).unwrap();

        let range = alloc.allocate_range(4).unwrap();
        alloc.on_device_lost();

        let fresh = backend
            .create_device(&adapter, FeatureLevel::default(), false)
            .unwrap();
        alloc.on_device_restored(fresh).unwrap();

        // the old range's slots are still reserved on the new heap
        assert_eq!(alloc.free_slots(), 12);
        alloc.free_range(range);
        assert_eq!(alloc.free_slots(), 16);
    }
}
