//! Device-dependent resource registry.
//!
//! Every resource that owns device objects (buffers, textures, targets,
//! queries) registers with the [`DeviceChildRegistry`] so the context can walk
//! it during device reset. Registration hands out a generational
//! [`DeviceChildHandle`]; unregistering (or dropping the resource) invalidates
//! the handle, which is how in-progress resets notice that a child went away
//! between phases.
//!
//! Reset order is controlled by [`ResetPriority`]: state is saved highest
//! priority first and restored lowest priority first, so dependencies are
//! rebuilt before their dependents.

use std::any::Any;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use crate::context::GraphicsContext;

/// A resource that owns objects tied to the lifetime of one device.
pub trait DeviceChild: Send + Sync {
    /// Capture whatever CPU-side state is needed to rebuild this resource.
    /// Runs once the replacement device exists, before any child rebuilds.
    /// Returns `None` when nothing needs saving.
    fn before_reset(&self) -> Option<Box<dyn Any + Send>> {
        None
    }

    /// Recreate device objects on the new device, consuming the state saved
    /// by [`before_reset`]. Returns false when the resource could not be
    /// rebuilt; it is then unregistered and skipped for the rest of the
    /// reset.
    ///
    /// [`before_reset`]: DeviceChild::before_reset
    fn reset(&self, context: &GraphicsContext, saved: Option<Box<dyn Any + Send>>) -> bool;

    /// Final fixup after every child has been reset. Runs in the same order
    /// as [`reset`].
    ///
    /// [`reset`]: DeviceChild::reset
    fn after_reset(&self, context: &GraphicsContext) -> bool {
        let _ = context;
        true
    }
}

/// Reset ordering. Children with higher priority save state earlier and
/// restore later.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct ResetPriority(pub i32);

impl ResetPriority {
    /// Plain resources with no reset dependencies.
    pub const NORMAL: Self = Self(0);
    /// Resources that other normal-priority resources rebuild from.
    pub const EARLY: Self = Self(-100);
    /// Resources rebuilt from other resources.
    pub const LATE: Self = Self(100);
}

/// Generational handle to a registered device child.
///
/// Stays invalid forever once the child unregisters; a reused slot gets a new
/// generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DeviceChildHandle {
    index: u32,
    generation: u32,
}

struct Slot {
    generation: u32,
    entry: Option<Entry>,
}

struct Entry {
    child: Weak<dyn DeviceChild>,
    priority: ResetPriority,
}

/// A snapshot row handed to the reset walk.
pub(crate) struct RegisteredChild {
    pub handle: DeviceChildHandle,
    pub priority: ResetPriority,
    pub child: Weak<dyn DeviceChild>,
}

/// Arena of registered device children.
pub struct DeviceChildRegistry {
    slots: Mutex<Slots>,
}

struct Slots {
    slots: Vec<Slot>,
    free: Vec<u32>,
}

impl DeviceChildRegistry {
    pub(crate) fn new() -> Self {
        Self {
            slots: Mutex::new(Slots {
                slots: Vec::new(),
                free: Vec::new(),
            }),
        }
    }

    /// Register a child for reset notifications. The registry holds only a
    /// weak reference; a dropped child is skipped and reaped lazily.
    pub fn register(
        &self,
        child: &Arc<dyn DeviceChild>,
        priority: ResetPriority,
    ) -> DeviceChildHandle {
        let entry = Entry {
            child: Arc::downgrade(child),
            priority,
        };

        let mut slots = self.slots.lock();
        match slots.free.pop() {
            Some(index) => {
                let slot = &mut slots.slots[index as usize];
                debug_assert!(slot.entry.is_none());
                slot.entry = Some(entry);
                DeviceChildHandle {
                    index,
                    generation: slot.generation,
                }
            }
            None => {
                let index = slots.slots.len() as u32;
                slots.slots.push(Slot {
                    generation: 0,
                    entry: Some(entry),
                });
                DeviceChildHandle {
                    index,
                    generation: 0,
                }
            }
        }
    }

    /// Unregister a child. Returns false when the handle was already invalid.
    /// Safe to call from any phase of a reset; the walk revalidates handles
    /// before every callback.
    pub fn unregister(&self, handle: DeviceChildHandle) -> bool {
        let mut slots = self.slots.lock();
        let Some(slot) = slots.slots.get_mut(handle.index as usize) else {
            return false;
        };
        if slot.generation != handle.generation || slot.entry.is_none() {
            return false;
        }

        slot.entry = None;
        slot.generation = slot.generation.wrapping_add(1);
        slots.free.push(handle.index);
        true
    }

    /// Is the handle still registered?
    pub fn contains(&self, handle: DeviceChildHandle) -> bool {
        let slots = self.slots.lock();
        slots
            .slots
            .get(handle.index as usize)
            .is_some_and(|slot| slot.generation == handle.generation && slot.entry.is_some())
    }

    /// Number of live registrations.
    pub fn len(&self) -> usize {
        self.slots
            .lock()
            .slots
            .iter()
            .filter(|slot| slot.entry.is_some())
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Snapshot the live children sorted by ascending priority. Children
    /// registered or unregistered after the snapshot do not take part in the
    /// walk; unregistered ones are filtered out by handle revalidation.
    pub(crate) fn snapshot(&self) -> Vec<RegisteredChild> {
        let slots = self.slots.lock();
        let mut children: Vec<RegisteredChild> = slots
            .slots
            .iter()
            .enumerate()
            .filter_map(|(index, slot)| {
                let entry = slot.entry.as_ref()?;
                Some(RegisteredChild {
                    handle: DeviceChildHandle {
                        index: index as u32,
                        generation: slot.generation,
                    },
                    priority: entry.priority,
                    child: entry.child.clone(),
                })
            })
            .collect();
        // stable, so same-priority children keep registration order
        children.sort_by_key(|c| c.priority);
        children
    }
}

impl std::fmt::Debug for DeviceChildRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceChildRegistry")
            .field("len", &self.len())
            .finish()
    }
}

static_assertions::assert_impl_all!(DeviceChildRegistry: Send, Sync);

#[cfg(test)]
mod tests {
    use super::*;

    struct Nop;

    impl DeviceChild for Nop {
        fn reset(&self, _context: &GraphicsContext, _saved: Option<Box<dyn Any + Send>>) -> bool {
            true
        }
    }

    fn child() -> Arc<dyn DeviceChild> {
        Arc::new(Nop)
    }

    #[test]
    fn test_register_unregister() {
        let registry = DeviceChildRegistry::new();
        let a = child();
        let handle = registry.register(&a, ResetPriority::NORMAL);
        assert!(registry.contains(handle));
        assert_eq!(registry.len(), 1);

        assert!(registry.unregister(handle));
        assert!(!registry.contains(handle));
        assert!(!registry.unregister(handle));
        assert!(registry.is_empty());
    }

    #[test]
    fn test_stale_handle_after_slot_reuse() {
        let registry = DeviceChildRegistry::new();
        let a = child();
        let stale = registry.register(&a, ResetPriority::NORMAL);
        registry.unregister(stale);

        let b = child();
        let fresh = registry.register(&b, ResetPriority::NORMAL);
        assert_eq!(stale.index, fresh.index);
        assert_ne!(stale.generation, fresh.generation);
        assert!(!registry.contains(stale));
        assert!(registry.contains(fresh));
    }

    #[test]
    fn test_snapshot_sorted_by_priority() {
        let registry = DeviceChildRegistry::new();
        let children: Vec<_> = (0..3).map(|_| child()).collect();
        registry.register(&children[0], ResetPriority(10));
        registry.register(&children[1], ResetPriority::EARLY);
        registry.register(&children[2], ResetPriority(5));

        let snapshot = registry.snapshot();
        let priorities: Vec<i32> = snapshot.iter().map(|c| c.priority.0).collect();
        assert_eq!(priorities, vec![-100, 5, 10]);
    }

    #[test]
    fn test_dropped_child_fails_upgrade() {
        let registry = DeviceChildRegistry::new();
        let a = child();
        let handle = registry.register(&a, ResetPriority::NORMAL);
        drop(a);

        // still registered, but the weak reference is dead
        assert!(registry.contains(handle));
        let snapshot = registry.snapshot();
        assert!(snapshot[0].child.upgrade().is_none());
    }
}
