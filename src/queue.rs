//! GPU command queues.
//!
//! Each [`Queue`] wraps one logical GPU queue (direct, copy, or compute) and
//! owns exactly one [`Fence`]. Submitting recorded commands issues the next
//! fence value and returns it as the point that marks the submission's
//! completion. Queues on different kinds may have independently in-flight
//! work; they synchronize only through explicit fence waits.

use std::sync::Arc;

use parking_lot::RwLock;

use crate::backend::NativeDevice;
use crate::fence::{Fence, FenceValue};
use crate::types::GpuEvent;

/// Logical GPU queue kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueueKind {
    /// Graphics + everything else.
    Direct,
    /// Copy/transfer work.
    Copy,
    /// Async compute.
    Compute,
}

impl QueueKind {
    pub const ALL: [Self; 3] = [Self::Direct, Self::Copy, Self::Compute];

    pub fn index(self) -> usize {
        match self {
            Self::Direct => 0,
            Self::Copy => 1,
            Self::Compute => 2,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Direct => "direct",
            Self::Copy => "copy",
            Self::Compute => "compute",
        }
    }
}

/// A lightweight recording shell for GPU commands.
///
/// The lifecycle layer only cares about when recorded work is submitted and
/// which fence value marks its completion; the recorded payload itself is a
/// collaborator boundary.
#[derive(Debug)]
pub struct CommandContext {
    queue: QueueKind,
    label: String,
    events: Vec<GpuEvent>,
    open_events: u32,
}

impl CommandContext {
    pub(crate) fn new(queue: QueueKind, label: impl Into<String>) -> Self {
        Self {
            queue,
            label: label.into(),
            events: Vec::new(),
            open_events: 0,
        }
    }

    pub fn queue_kind(&self) -> QueueKind {
        self.queue
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    /// Record the start of a profiling event.
    pub fn begin_event(&mut self, event: GpuEvent) {
        self.events.push(event);
        self.open_events += 1;
    }

    /// Record the end of the innermost open profiling event.
    pub fn end_event(&mut self) {
        debug_assert!(self.open_events > 0, "end_event without begin_event");
        self.open_events = self.open_events.saturating_sub(1);
    }

    /// Events recorded so far.
    pub fn events(&self) -> &[GpuEvent] {
        &self.events
    }

    pub(crate) fn into_list(self) -> CommandList {
        debug_assert_eq!(self.open_events, 0, "submitted with open events");
        CommandList {
            queue: self.queue,
            label: self.label,
            events: self.events,
        }
    }
}

/// Finished recording handed to the backend for execution.
#[derive(Debug)]
pub struct CommandList {
    pub queue: QueueKind,
    pub label: String,
    pub events: Vec<GpuEvent>,
}

/// One logical GPU queue.
pub struct Queue {
    kind: QueueKind,
    fence: Arc<Fence>,
    device: RwLock<Arc<dyn NativeDevice>>,
}

impl Queue {
    pub(crate) fn new(kind: QueueKind, device: Arc<dyn NativeDevice>) -> Self {
        Self {
            kind,
            fence: Fence::new(format!("{} queue fence", kind.name()), Some(kind)),
            device: RwLock::new(device),
        }
    }

    /// Point the queue at a freshly created device after a reset. The fence
    /// and its counters survive; the old device only needed to be idle.
    pub(crate) fn attach_device(&self, device: Arc<dyn NativeDevice>) {
        *self.device.write() = device;
    }

    pub fn kind(&self) -> QueueKind {
        self.kind
    }

    pub fn fence(&self) -> &Arc<Fence> {
        &self.fence
    }

    /// Begin recording a new command context for this queue.
    pub fn new_commands(&self, label: impl Into<String>) -> CommandContext {
        CommandContext::new(self.kind, label)
    }

    /// Submit recorded commands. Returns the fence value that marks the point
    /// the GPU will have reached once this submission completes.
    pub fn submit(&self, commands: CommandContext) -> FenceValue {
        debug_assert_eq!(commands.queue_kind(), self.kind);

        let value = self.fence.issue();
        let device = self.device.read().clone();
        log::trace!(
            "queue {}: submitting '{}', fence value {}",
            self.kind.name(),
            commands.label(),
            value
        );
        device.execute(self.kind, commands.into_list(), &self.fence, value);
        FenceValue::new(self.fence.clone(), value)
    }

    /// The fence value that the next submission to this queue will signal.
    ///
    /// Used to tag transient allocations consumed by work that has not been
    /// submitted yet (see [`crate::memory::RingAllocator`]).
    pub fn next_signal(&self) -> FenceValue {
        FenceValue::new(self.fence.clone(), self.fence.next_value())
    }

    /// Begin a queue-scoped profiling marker.
    pub fn begin_event(&self, event: GpuEvent) {
        self.device.read().push_marker(self.kind, event);
    }

    /// End the innermost queue-scoped profiling marker.
    pub fn end_event(&self) {
        self.device.read().pop_marker(self.kind);
    }

    /// Block the calling thread until the queue's fence reaches the last
    /// issued value.
    pub fn wait_for_idle(&self) {
        let last = self.fence.last_issued();
        if self.fence.reached(last) {
            return;
        }

        let device = self.device.read().clone();
        device.wait_queue_idle(self.kind);
        debug_assert!(
            self.fence.reached(last),
            "queue {} fence did not reach {} after idle wait",
            self.kind.name(),
            last
        );
    }
}

impl std::fmt::Debug for Queue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Queue")
            .field("kind", &self.kind)
            .field("fence", &self.fence)
            .finish()
    }
}

/// The fixed set of queues owned by the graphics context.
#[derive(Debug)]
pub struct Queues {
    direct: Queue,
    copy: Queue,
    compute: Queue,
}

impl Queues {
    pub(crate) fn new(device: Arc<dyn NativeDevice>) -> Self {
        Self {
            direct: Queue::new(QueueKind::Direct, device.clone()),
            copy: Queue::new(QueueKind::Copy, device.clone()),
            compute: Queue::new(QueueKind::Compute, device),
        }
    }

    pub(crate) fn attach_device(&self, device: Arc<dyn NativeDevice>) {
        self.direct.attach_device(device.clone());
        self.copy.attach_device(device.clone());
        self.compute.attach_device(device);
    }

    pub fn direct(&self) -> &Queue {
        &self.direct
    }

    pub fn copy(&self) -> &Queue {
        &self.copy
    }

    pub fn compute(&self) -> &Queue {
        &self.compute
    }

    pub fn for_kind(&self, kind: QueueKind) -> &Queue {
        match kind {
            QueueKind::Direct => &self.direct,
            QueueKind::Copy => &self.copy,
            QueueKind::Compute => &self.compute,
        }
    }

    /// Block until every queue drains.
    pub fn wait_for_idle(&self) {
        self.direct.wait_for_idle();
        self.compute.wait_for_idle();
        self.copy.wait_for_idle();
    }
}

static_assertions::assert_impl_all!(Queues: Send, Sync);

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

    #[test]
    fn test_submit_returns_increasing_fence_values() {
        let queues = Queues::new(test_device());
        let q = queues.direct();

        let a = q.submit(q.new_commands("a"));
        let b = q.submit(q.new_commands("b"));
        assert!(b.value() > a.value());
        // dummy device completes work immediately
        assert!(a.is_complete());
        assert!(b.is_complete());
    }

    #[test]
    fn test_next_signal_matches_following_submit() {
        let queues = Queues::new(test_device());
        let q = queues.copy();

        let upcoming = q.next_signal();
        let submitted = q.submit(q.new_commands("upload"));
        assert_eq!(upcoming.value(), submitted.value());
    }

    #[test]
    fn test_queues_have_independent_fences() {
        let queues = Queues::new(test_device());
        let a = queues.direct().submit(queues.direct().new_commands("a"));
        let b = queues.compute().submit(queues.compute().new_commands("b"));
        assert!(!Arc::ptr_eq(a.fence(), b.fence()));
        assert_eq!(a.value(), 1);
        assert_eq!(b.value(), 1);
    }

    #[test]
    fn test_wait_for_idle_on_idle_queue() {
        let queues = Queues::new(test_device());
        // no submissions yet; must return without blocking
        queues.wait_for_idle();
    }
}
