//! Deferred resource destruction.
//!
//! A resource the GPU may still be reading cannot be dropped the moment the
//! CPU is done with it. [`KeepAlive`] parks such resources together with the
//! fence values of the work that references them, and drops them in FIFO
//! order once those fences complete. The queue is flushed lazily at frame
//! start and on idle waits; nothing is dropped while the queue lock is held.

use std::any::Any;
use std::collections::VecDeque;

use parking_lot::Mutex;

use crate::fence::FenceValues;

struct Retired {
    resource: Box<dyn Any + Send>,
    fences: FenceValues,
}

/// FIFO of resources awaiting GPU completion before destruction.
#[derive(Default)]
pub struct KeepAlive {
    retired: Mutex<VecDeque<Retired>>,
}

impl KeepAlive {
    pub fn new() -> Self {
        Self::default()
    }

    /// Park `resource` until every value in `fences` completes. A resource
    /// whose fences are already complete is dropped immediately.
    pub fn keep<T: Send + 'static>(&self, resource: T, fences: FenceValues) {
        if fences.complete() {
            return;
        }
        self.retired.lock().push_back(Retired {
            resource: Box::new(resource),
            fences,
        });
    }

    /// Drop retired resources from the front of the queue while their fences
    /// have completed. Returns how many were dropped.
    ///
    /// Stops at the first incomplete entry, preserving FIFO destruction
    /// order even when later entries happen to be complete already.
    pub fn flush(&self) -> usize {
        let mut dropped = Vec::new();
        {
            let mut retired = self.retired.lock();
            while retired.front().is_some_and(|front| front.fences.complete()) {
                if let Some(entry) = retired.pop_front() {
                    dropped.push(entry.resource);
                }
            }
        }

        // destructors run after the lock is released; they may re-enter keep()
        let count = dropped.len();
        if count > 0 {
            log::trace!("keep-alive: dropping {count} retired resources");
        }
        drop(dropped);
        count
    }

    /// Resources still waiting on the GPU.
    pub fn pending(&self) -> usize {
        self.retired.lock().len()
    }
}

impl std::fmt::Debug for KeepAlive {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeepAlive")
            .field("pending", &self.pending())
            .finish()
    }
}

static_assertions::assert_impl_all!(KeepAlive: Send, Sync);

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fence::{Fence, FenceValue};
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    struct DropFlag(Arc<AtomicBool>);

    impl Drop for DropFlag {
        fn drop(&mut self) {
            self.0.store(true, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_complete_fences_drop_immediately() {
        let keep_alive = KeepAlive::new();
        let dropped = Arc::new(AtomicBool::new(false));
        keep_alive.keep(DropFlag(dropped.clone()), FenceValues::new());
        assert!(dropped.load(Ordering::SeqCst));
        assert_eq!(keep_alive.pending(), 0);
    }

    #[test]
    fn test_resource_held_until_fence_completes() {
        let keep_alive = KeepAlive::new();
        let fence = Fence::new("test", None);
        let v = fence.issue();

        let dropped = Arc::new(AtomicBool::new(false));
        keep_alive.keep(
            DropFlag(dropped.clone()),
            FenceValue::new(fence.clone(), v).into(),
        );
        assert_eq!(keep_alive.pending(), 1);

        assert_eq!(keep_alive.flush(), 0);
        assert!(!dropped.load(Ordering::SeqCst));

        fence.set_completed(v);
        assert_eq!(keep_alive.flush(), 1);
        assert!(dropped.load(Ordering::SeqCst));
        assert_eq!(keep_alive.pending(), 0);
    }

    #[test]
    fn test_flush_stops_at_first_incomplete_entry() {
        let keep_alive = KeepAlive::new();
        let a = Fence::new("a", None);
        let b = Fence::new("b", None);
        let va = a.issue();
        let vb = b.issue();

        let first = Arc::new(AtomicBool::new(false));
        let second = Arc::new(AtomicBool::new(false));
        keep_alive.keep(DropFlag(first.clone()), FenceValue::new(a.clone(), va).into());
        keep_alive.keep(DropFlag(second.clone()), FenceValue::new(b.clone(), vb).into());

        // the second entry is complete but queued behind the first
        b.set_completed(vb);
        assert_eq!(keep_alive.flush(), 0);
        assert!(!second.load(Ordering::SeqCst));

        a.set_completed(va);
        assert_eq!(keep_alive.flush(), 2);
        assert!(first.load(Ordering::SeqCst));
        assert!(second.load(Ordering::SeqCst));
    }
}
