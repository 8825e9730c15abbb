//! GPU fences and fence-value snapshots.
//!
//! A [`Fence`] is a monotonically increasing counter associated with at most
//! one GPU queue. The submitting side issues values with [`Fence::issue`]; the
//! backend advances the completion counter as the GPU reaches each value.
//! Completion queries are cheap, lock-free atomic reads.
//!
//! A [`FenceValues`] snapshot records one value per fence and represents "the
//! GPU has finished all work submitted before this point". It is attached to
//! resources for deferred-release tracking (see [`crate::keep_alive`]).

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::queue::QueueKind;

/// A monotonic GPU completion counter.
///
/// Values start at 1; a completed value of 0 means no work has finished yet.
pub struct Fence {
    name: String,
    /// Queue that signals this fence, if any. Standalone fences (such as the
    /// residency fence) have no owning queue.
    queue: Option<QueueKind>,
    /// Next value to hand out to a submission.
    next: AtomicU64,
    /// Highest value the GPU has reached.
    completed: AtomicU64,
}

impl Fence {
    /// Create a fence. `queue` is the owning queue, or `None` for a
    /// standalone fence.
    pub fn new(name: impl Into<String>, queue: Option<QueueKind>) -> Arc<Self> {
        Arc::new(Self {
            name: name.into(),
            queue,
            next: AtomicU64::new(1),
            completed: AtomicU64::new(0),
        })
    }

    /// Fence name, for diagnostics.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The queue that owns this fence, if any.
    pub fn queue(&self) -> Option<QueueKind> {
        self.queue
    }

    /// Reserve and return the next value to signal.
    pub(crate) fn issue(&self) -> u64 {
        self.next.fetch_add(1, Ordering::SeqCst)
    }

    /// The value that the next submission will signal.
    pub fn next_value(&self) -> u64 {
        self.next.load(Ordering::SeqCst)
    }

    /// The last value handed out to a submission (0 if none yet).
    pub fn last_issued(&self) -> u64 {
        self.next_value() - 1
    }

    /// Advance the completion counter. Monotonic; lower values are ignored.
    pub fn set_completed(&self, value: u64) {
        self.completed.fetch_max(value, Ordering::AcqRel);
    }

    /// Highest value the GPU has reached.
    pub fn completed_value(&self) -> u64 {
        self.completed.load(Ordering::Acquire)
    }

    /// Has `value` been reached?
    pub fn reached(&self, value: u64) -> bool {
        self.completed_value() >= value
    }
}

impl std::fmt::Debug for Fence {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Fence")
            .field("name", &self.name)
            .field("queue", &self.queue)
            .field("completed", &self.completed_value())
            .field("last_issued", &self.last_issued())
            .finish()
    }
}

/// One point on one fence's timeline.
#[derive(Clone)]
pub struct FenceValue {
    fence: Arc<Fence>,
    value: u64,
}

impl FenceValue {
    pub fn new(fence: Arc<Fence>, value: u64) -> Self {
        Self { fence, value }
    }

    pub fn fence(&self) -> &Arc<Fence> {
        &self.fence
    }

    pub fn value(&self) -> u64 {
        self.value
    }

    /// Has the GPU reached this point?
    pub fn is_complete(&self) -> bool {
        self.fence.reached(self.value)
    }
}

impl std::fmt::Debug for FenceValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FenceValue")
            .field("fence", &self.fence.name())
            .field("value", &self.value)
            .field("complete", &self.is_complete())
            .finish()
    }
}

/// A snapshot of points across multiple fences, at most one per fence.
///
/// Adding a value for a fence that is already recorded keeps the larger
/// value, since fence values are monotonic.
#[derive(Debug, Clone, Default)]
pub struct FenceValues {
    values: Vec<FenceValue>,
}

impl FenceValues {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `value`, merging with any existing entry for the same fence.
    pub fn add(&mut self, value: FenceValue) {
        for existing in &mut self.values {
            if Arc::ptr_eq(existing.fence(), value.fence()) {
                existing.value = existing.value.max(value.value);
                return;
            }
        }
        self.values.push(value);
    }

    /// Complete iff every recorded value has been reached. An empty snapshot
    /// is complete.
    pub fn complete(&self) -> bool {
        self.values.iter().all(FenceValue::is_complete)
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &FenceValue> {
        self.values.iter()
    }
}

impl From<FenceValue> for FenceValues {
    fn from(value: FenceValue) -> Self {
        let mut values = Self::new();
        values.add(value);
        values
    }
}

static_assertions::assert_impl_all!(Fence: Send, Sync);
static_assertions::assert_impl_all!(FenceValues: Send, Sync);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fence_monotonic_issue() {
        let fence = Fence::new("test", None);
        assert_eq!(fence.issue(), 1);
        assert_eq!(fence.issue(), 2);
        assert_eq!(fence.last_issued(), 2);
        assert_eq!(fence.next_value(), 3);
    }

    #[test]
    fn test_fence_completion() {
        let fence = Fence::new("test", None);
        let v = fence.issue();
        assert!(!fence.reached(v));
        fence.set_completed(v);
        assert!(fence.reached(v));
        // lower values never regress the counter
        fence.set_completed(0);
        assert_eq!(fence.completed_value(), v);
    }

    #[test]
    fn test_fence_value_complete() {
        let fence = Fence::new("test", None);
        let fv = FenceValue::new(fence.clone(), fence.issue());
        assert!(!fv.is_complete());
        fence.set_completed(fv.value());
        assert!(fv.is_complete());
    }

    #[test]
    fn test_fence_values_merge_keeps_max() {
        let fence = Fence::new("test", None);
        let v1 = fence.issue();
        let v2 = fence.issue();

        let mut values = FenceValues::new();
        values.add(FenceValue::new(fence.clone(), v2));
        values.add(FenceValue::new(fence.clone(), v1));
        assert_eq!(values.len(), 1);

        fence.set_completed(v1);
        assert!(!values.complete());
        fence.set_completed(v2);
        assert!(values.complete());
    }

    #[test]
    fn test_fence_values_multiple_fences() {
        let a = Fence::new("a", None);
        let b = Fence::new("b", None);
        let mut values = FenceValues::new();
        values.add(FenceValue::new(a.clone(), a.issue()));
        values.add(FenceValue::new(b.clone(), b.issue()));
        assert_eq!(values.len(), 2);

        a.set_completed(1);
        assert!(!values.complete());
        b.set_completed(1);
        assert!(values.complete());
    }

    #[test]
    fn test_empty_fence_values_complete() {
        assert!(FenceValues::new().complete());
    }
}
