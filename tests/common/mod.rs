//! Common utilities for device lifecycle integration tests.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use ember_gpu::backend::dummy::{DummyBackend, DummyDevice};
use ember_gpu::{
    DeviceChild, FeatureLevel, GraphicsContext, HostCallbacks, ResetPriority,
};

/// Build a context over a fresh dummy backend with default adapters.
#[allow(dead_code)]
pub fn test_context() -> (Arc<DummyBackend>, GraphicsContext) {
    let backend = Arc::new(DummyBackend::new());
    let context = context_over(backend.clone());
    (backend, context)
}

/// Route crate logs to the test harness. Safe to call repeatedly.
pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Build a context over a preconfigured backend.
pub fn context_over(backend: Arc<DummyBackend>) -> GraphicsContext {
    init_logging();
    GraphicsContext::with_backend(backend, Arc::new(ember_gpu::NullHost), FeatureLevel::default())
        .expect("context creation")
}

/// Build a context that reports frame callbacks to `host`.
#[allow(dead_code)]
pub fn context_with_host(backend: Arc<DummyBackend>, host: Arc<CountingHost>) -> GraphicsContext {
    init_logging();
    GraphicsContext::with_backend(backend, host, FeatureLevel::default())
        .expect("context creation")
}

/// The dummy device currently backing `backend`.
#[allow(dead_code)]
pub fn current_device(backend: &DummyBackend) -> Arc<DummyDevice> {
    backend.current_device().expect("a device was created")
}

/// Host that counts its callbacks.
#[derive(Default)]
pub struct CountingHost {
    pub started: AtomicU64,
    pub completed: AtomicU64,
}

impl HostCallbacks for CountingHost {
    fn on_frame_started(&self, _commands: &mut ember_gpu::CommandContext) {
        self.started.fetch_add(1, Ordering::SeqCst);
    }

    fn on_frame_complete(&self) {
        self.completed.fetch_add(1, Ordering::SeqCst);
    }
}

/// One recorded reset callback: `(phase, priority)`.
pub type PhaseLog = Arc<Mutex<Vec<(&'static str, i32)>>>;

/// Device child that appends every reset callback to a shared log.
pub struct RecordingChild {
    pub priority: ResetPriority,
    pub log: PhaseLog,
    /// When set, `reset` reports failure.
    pub fail_reset: AtomicBool,
}

impl RecordingChild {
    pub fn new(priority: i32, log: PhaseLog) -> Arc<Self> {
        Arc::new(Self {
            priority: ResetPriority(priority),
            log,
            fail_reset: AtomicBool::new(false),
        })
    }

    /// Register `self` with `context` under its own priority.
    pub fn register(self: &Arc<Self>, context: &GraphicsContext) -> ember_gpu::DeviceChildHandle {
        let child: Arc<dyn DeviceChild> = self.clone();
        context.register_child(&child, self.priority)
    }
}

impl DeviceChild for RecordingChild {
    fn before_reset(&self) -> Option<Box<dyn std::any::Any + Send>> {
        self.log.lock().push(("before", self.priority.0));
        Some(Box::new(self.priority.0))
    }

    fn reset(
        &self,
        _context: &GraphicsContext,
        saved: Option<Box<dyn std::any::Any + Send>>,
    ) -> bool {
        let saved = saved
            .and_then(|s| s.downcast::<i32>().ok())
            .map(|s| *s);
        assert_eq!(saved, Some(self.priority.0), "saved state was routed to the wrong child");
        self.log.lock().push(("reset", self.priority.0));
        !self.fail_reset.load(Ordering::SeqCst)
    }

    fn after_reset(&self, _context: &GraphicsContext) -> bool {
        self.log.lock().push(("after", self.priority.0));
        true
    }
}
