//! GPU memory allocators.
//!
//! Two allocation strategies sit on top of native heaps:
//!
//! - [`RingAllocator`] serves transient per-frame data (uploads, readbacks,
//!   dynamic buffers) from one fixed-size heap. Space is reclaimed lazily as
//!   the fence values attached to allocations complete.
//! - [`MemAllocator`] serves long-lived placed resources (static buffers,
//!   textures, render targets) from a growable pool of heaps with per-heap
//!   free lists.
//!
//! Both reset with the device: ring and pool heaps are destroyed on device
//! loss and recreated (rings eagerly, pools on demand) on the new device.

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

use crate::backend::{NativeDevice, NativeHeap};
use crate::error::GpuError;
use crate::fence::FenceValue;

/// Default capacity of each transient ring (upload, readback, dynamic).
pub const RING_CAPACITY: u64 = 1 << 20;

/// Static buffer pool: minimum heap size / maximum total size.
pub const BUFFER_POOL_MIN: u64 = 1 << 20;
pub const BUFFER_POOL_MAX: u64 = 8 << 20;

/// Texture pool: minimum heap size / maximum total size.
pub const TEXTURE_POOL_MIN: u64 = 4 << 20;
pub const TEXTURE_POOL_MAX: u64 = 32 << 20;

/// Render target pool: minimum heap size / maximum total size.
pub const TARGET_POOL_MIN: u64 = 16 << 20;
pub const TARGET_POOL_MAX: u64 = 128 << 20;

/// What a heap is used for. Determines the native memory type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HeapUsage {
    /// CPU-write, GPU-read staging memory.
    Upload,
    /// GPU-write, CPU-read staging memory.
    Readback,
    /// Device-local memory for buffers.
    GpuBuffers,
    /// Device-local memory for textures.
    GpuTextures,
    /// Device-local memory for render/depth targets.
    GpuTargets,
}

impl HeapUsage {
    pub fn name(self) -> &'static str {
        match self {
            Self::Upload => "upload",
            Self::Readback => "readback",
            Self::GpuBuffers => "gpu_buffers",
            Self::GpuTextures => "gpu_textures",
            Self::GpuTargets => "gpu_targets",
        }
    }
}

bitflags::bitflags! {
    /// Native heap creation flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct HeapFlags: u32 {
        /// The heap will never hold buffers.
        const DENY_BUFFERS = 1 << 0;
        /// The heap will never hold textures.
        const DENY_TEXTURES = 1 << 1;
        /// Create the heap without making it resident up front. Only valid
        /// when the device supports heap residency control.
        const CREATE_NOT_RESIDENT = 1 << 2;
    }
}

pub(crate) fn align_up(value: u64, align: u64) -> u64 {
    debug_assert!(align.is_power_of_two());
    (value + align - 1) & !(align - 1)
}

/// A native heap with RAII destruction.
pub struct GpuHeap {
    device: Arc<dyn NativeDevice>,
    heap: NativeHeap,
    size: u64,
    usage: HeapUsage,
}

impl GpuHeap {
    pub(crate) fn new(
        device: Arc<dyn NativeDevice>,
        size: u64,
        usage: HeapUsage,
        flags: HeapFlags,
    ) -> Result<Arc<Self>, GpuError> {
        let heap = device.create_heap(size, usage, flags)?;
        Ok(Arc::new(Self {
            device,
            heap,
            size,
            usage,
        }))
    }

    pub fn native(&self) -> NativeHeap {
        self.heap
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn usage(&self) -> HeapUsage {
        self.usage
    }
}

impl Drop for GpuHeap {
    fn drop(&mut self) {
        self.device.destroy_heap(self.heap);
    }
}

impl std::fmt::Debug for GpuHeap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GpuHeap")
            .field("heap", &self.heap)
            .field("size", &self.size)
            .field("usage", &self.usage)
            .finish()
    }
}

/// A transient allocation inside a ring heap.
#[derive(Debug, Clone)]
pub struct RingAllocation {
    pub heap: Arc<GpuHeap>,
    pub offset: u64,
    pub size: u64,
}

struct RingState {
    /// Monotonic byte offset of the oldest in-flight allocation.
    head: u64,
    /// Monotonic byte offset where the next allocation starts.
    tail: u64,
    /// `(end, fence)` per allocation, in submission order. An entry retires
    /// once its fence completes, advancing `head` to `end`.
    pending: VecDeque<(u64, FenceValue)>,
}

/// Fixed-capacity ring over one heap, reclaimed by fence completion.
pub struct RingAllocator {
    usage: HeapUsage,
    capacity: u64,
    flags: HeapFlags,
    device: RwLock<Arc<dyn NativeDevice>>,
    heap: Mutex<Option<Arc<GpuHeap>>>,
    state: Mutex<RingState>,
}

impl RingAllocator {
    pub(crate) fn new(
        usage: HeapUsage,
        capacity: u64,
        flags: HeapFlags,
        device: Arc<dyn NativeDevice>,
    ) -> Result<Self, GpuError> {
        debug_assert!(capacity.is_power_of_two());
        let heap = GpuHeap::new(device.clone(), capacity, usage, flags)?;
        Ok(Self {
            usage,
            capacity,
            flags,
            device: RwLock::new(device),
            heap: Mutex::new(Some(heap)),
            state: Mutex::new(RingState {
                head: 0,
                tail: 0,
                pending: VecDeque::new(),
            }),
        })
    }

    pub fn usage(&self) -> HeapUsage {
        self.usage
    }

    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    /// Bytes currently held by in-flight allocations.
    pub fn bytes_in_flight(&self) -> u64 {
        let mut state = self.state.lock();
        Self::retire(&mut state);
        state.tail - state.head
    }

    fn retire(state: &mut RingState) {
        while let Some((end, fence)) = state.pending.front() {
            if !fence.is_complete() {
                break;
            }
            state.head = *end;
            state.pending.pop_front();
        }
    }

    /// Allocate `size` bytes aligned to `align`, consumed by work that will
    /// complete at `fence`. The space is reused once `fence` completes.
    ///
    /// # Errors
    ///
    /// [`GpuError::RingFull`] when in-flight allocations leave no room, and
    /// [`GpuError::InvalidParameter`] when `size` exceeds the ring capacity.
    pub fn allocate(
        &self,
        size: u64,
        align: u64,
        fence: FenceValue,
    ) -> Result<RingAllocation, GpuError> {
        if size == 0 || size > self.capacity {
            return Err(GpuError::InvalidParameter(format!(
                "ring allocation of {size} bytes (capacity {})",
                self.capacity
            )));
        }

        let heap = self
            .heap
            .lock()
            .clone()
            .ok_or_else(|| GpuError::DeviceLost("ring heap not restored".to_string()))?;

        let mut state = self.state.lock();
        Self::retire(&mut state);

        let mut start = align_up(state.tail, align);
        if (start % self.capacity) + size > self.capacity {
            // the allocation would straddle the wrap point; skip to the next
            // ring boundary (boundaries satisfy any power-of-two alignment)
            start = align_up(state.tail, self.capacity);
        }
        let end = start + size;
        if end - state.head > self.capacity {
            log::warn!(
                "{} ring full: {} bytes requested, {} in flight of {}",
                self.usage.name(),
                size,
                state.tail - state.head,
                self.capacity
            );
            return Err(GpuError::RingFull {
                needed: size,
                capacity: self.capacity,
            });
        }

        state.tail = end;
        state.pending.push_back((end, fence));
        Ok(RingAllocation {
            heap,
            offset: start % self.capacity,
            size,
        })
    }

    /// Drop the heap ahead of device teardown. The caller must have drained
    /// the queues first.
    pub(crate) fn on_device_lost(&self) {
        let mut state = self.state.lock();
        Self::retire(&mut state);
        debug_assert!(
            state.pending.is_empty(),
            "{} ring torn down with work in flight",
            self.usage.name()
        );
        state.head = 0;
        state.tail = 0;
        state.pending.clear();
        drop(state);
        *self.heap.lock() = None;
    }

    /// Recreate the heap on a fresh device.
    pub(crate) fn on_device_restored(
        &self,
        device: Arc<dyn NativeDevice>,
    ) -> Result<(), GpuError> {
        let heap = GpuHeap::new(device.clone(), self.capacity, self.usage, self.flags)?;
        *self.heap.lock() = Some(heap);
        *self.device.write() = device;
        Ok(())
    }
}

impl std::fmt::Debug for RingAllocator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RingAllocator")
            .field("usage", &self.usage)
            .field("capacity", &self.capacity)
            .field("in_flight", &self.bytes_in_flight())
            .finish()
    }
}

/// A long-lived allocation inside a pool heap.
#[derive(Debug, Clone)]
pub struct MemAllocation {
    pub heap: Arc<GpuHeap>,
    pub offset: u64,
    pub size: u64,
}

struct Page {
    heap: Arc<GpuHeap>,
    /// Disjoint `(offset, size)` free ranges sorted by offset.
    free: Vec<(u64, u64)>,
}

impl Page {
    fn allocate(&mut self, size: u64, align: u64) -> Option<u64> {
        for i in 0..self.free.len() {
            let (start, len) = self.free[i];
            let aligned = align_up(start, align);
            let pad = aligned - start;
            if pad + size > len {
                continue;
            }

            self.free.remove(i);
            // give back the alignment padding and the tail remainder
            if pad > 0 {
                self.free.insert(i, (start, pad));
            }
            let rest = len - pad - size;
            if rest > 0 {
                let at = if pad > 0 { i + 1 } else { i };
                self.free.insert(at, (aligned + size, rest));
            }
            return Some(aligned);
        }
        None
    }

    fn free(&mut self, offset: u64, size: u64) {
        let i = self.free.partition_point(|&(start, _)| start < offset);
        debug_assert!(
            i == 0 || {
                let (prev, len) = self.free[i - 1];
                prev + len <= offset
            },
            "double free at offset {offset}"
        );

        self.free.insert(i, (offset, size));
        if i + 1 < self.free.len() && self.free[i].0 + self.free[i].1 == self.free[i + 1].0 {
            self.free[i].1 += self.free[i + 1].1;
            self.free.remove(i + 1);
        }
        if i > 0 && self.free[i - 1].0 + self.free[i - 1].1 == self.free[i].0 {
            self.free[i - 1].1 += self.free[i].1;
            self.free.remove(i);
        }
    }

    fn free_bytes(&self) -> u64 {
        self.free.iter().map(|&(_, len)| len).sum()
    }
}

/// Growable pool of heaps with per-heap free lists, for placed resources.
pub struct MemAllocator {
    usage: HeapUsage,
    min_heap_size: u64,
    max_total_size: u64,
    flags: HeapFlags,
    device: RwLock<Arc<dyn NativeDevice>>,
    pages: Mutex<Vec<Page>>,
}

impl MemAllocator {
    pub(crate) fn new(
        usage: HeapUsage,
        min_heap_size: u64,
        max_total_size: u64,
        flags: HeapFlags,
        device: Arc<dyn NativeDevice>,
    ) -> Self {
        debug_assert!(min_heap_size <= max_total_size);
        Self {
            usage,
            min_heap_size,
            max_total_size,
            flags,
            device: RwLock::new(device),
            pages: Mutex::new(Vec::new()),
        }
    }

    pub fn usage(&self) -> HeapUsage {
        self.usage
    }

    /// Total bytes of heap memory currently allocated from the device.
    pub fn total_size(&self) -> u64 {
        self.pages.lock().iter().map(|p| p.heap.size()).sum()
    }

    pub fn page_count(&self) -> usize {
        self.pages.lock().len()
    }

    /// Allocate `size` bytes aligned to `align`, growing the pool with a new
    /// heap when no page has room.
    ///
    /// # Errors
    ///
    /// [`GpuError::PoolExhausted`] when growing would exceed the pool's
    /// maximum total size, or the native heap creation error.
    pub fn allocate(&self, size: u64, align: u64) -> Result<MemAllocation, GpuError> {
        if size == 0 {
            return Err(GpuError::InvalidParameter(
                "pool allocation of zero bytes".to_string(),
            ));
        }

        let mut pages = self.pages.lock();
        for page in pages.iter_mut() {
            if let Some(offset) = page.allocate(size, align) {
                return Ok(MemAllocation {
                    heap: page.heap.clone(),
                    offset,
                    size,
                });
            }
        }

        let page_size = size.max(self.min_heap_size);
        let total: u64 = pages.iter().map(|p| p.heap.size()).sum();
        if total + page_size > self.max_total_size {
            log::warn!(
                "{} pool exhausted: {} bytes requested, {total} of {} in use",
                self.usage.name(),
                size,
                self.max_total_size
            );
            return Err(GpuError::PoolExhausted {
                usage: self.usage,
                requested: size,
            });
        }

        let device = self.device.read().clone();
        let heap = GpuHeap::new(device, page_size, self.usage, self.flags)?;
        log::debug!(
            "{} pool grew by {page_size} bytes ({} pages)",
            self.usage.name(),
            pages.len() + 1
        );

        let mut page = Page {
            heap: heap.clone(),
            free: vec![(0, page_size)],
        };
        let offset = page.allocate(size, align);
        debug_assert_eq!(offset, Some(0));
        pages.push(page);
        Ok(MemAllocation {
            heap,
            offset: 0,
            size,
        })
    }

    /// Return an allocation to its page's free list. A no-op when the page
    /// was already discarded by a device reset.
    pub fn free(&self, allocation: &MemAllocation) {
        let mut pages = self.pages.lock();
        match pages
            .iter_mut()
            .find(|p| Arc::ptr_eq(&p.heap, &allocation.heap))
        {
            Some(page) => page.free(allocation.offset, allocation.size),
            None => log::debug!(
                "{} pool: free of {} bytes into a retired heap",
                self.usage.name(),
                allocation.size
            ),
        }
    }

    /// Discard every page. Placed resources are recreated during device
    /// reset, so nothing in the pool survives the old device.
    pub(crate) fn on_device_lost(&self) {
        let pages = std::mem::take(&mut *self.pages.lock());
        for page in &pages {
            let used = page.heap.size() - page.free_bytes();
            if used > 0 {
                log::debug!(
                    "{} pool: discarding page with {used} bytes still allocated",
                    self.usage.name()
                );
            }
        }
    }

    pub(crate) fn on_device_restored(&self, device: Arc<dyn NativeDevice>) {
        debug_assert!(self.pages.lock().is_empty());
        *self.device.write() = device;
    }
}

impl std::fmt::Debug for MemAllocator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemAllocator")
            .field("usage", &self.usage)
            .field("pages", &self.page_count())
            .field("total_size", &self.total_size())
            .finish()
    }
}

static_assertions::assert_impl_all!(RingAllocator: Send, Sync);
static_assertions::assert_impl_all!(MemAllocator: Send, Sync);
