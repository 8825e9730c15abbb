//! Host application contract.
//!
//! The host (the engine's application layer) drives the frame loop and is
//! notified once per frame, in fixed order: [`HostCallbacks::on_frame_started`]
//! with the frame's command context, then [`HostCallbacks::on_frame_complete`]
//! after the frame's commands were submitted.

use crate::queue::CommandContext;

/// Callbacks supplied by the host once at context creation and referenced for
/// the context's lifetime.
///
/// Callbacks must not call back into `frame_started`/`frame_complete`; they
/// run while the frame slot is held.
pub trait HostCallbacks: Send + Sync + 'static {
    /// A new frame began recording. Invoked exactly once per frame, before
    /// any frame commands are submitted.
    fn on_frame_started(&self, commands: &mut CommandContext);

    /// The frame's commands were submitted. Invoked exactly once per frame.
    fn on_frame_complete(&self);
}

/// A host that ignores all notifications. Useful for tools and tests.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullHost;

impl HostCallbacks for NullHost {
    fn on_frame_started(&self, _commands: &mut CommandContext) {}

    fn on_frame_complete(&self) {}
}
