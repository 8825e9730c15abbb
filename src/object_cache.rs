//! Pipeline and root signature cache.
//!
//! Pipelines and root signatures are deduplicated by description: asking for
//! the same description twice returns the same cached object. Cached objects
//! belong to one device; the whole cache is discarded on device loss and
//! refills on demand against the new device.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

use crate::backend::{NativeDevice, NativePipeline, NativeRootSignature};
use crate::error::GpuError;

/// Root signature layout description. The cache key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct RootSignatureDesc {
    /// Number of 32-bit root constants.
    pub root_constants: u32,
    /// Number of view descriptor tables.
    pub view_tables: u32,
    /// Number of sampler descriptor tables.
    pub sampler_tables: u32,
}

/// Pipeline state description. The cache key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct PipelineDesc {
    pub root_signature: RootSignatureDesc,
    /// Hash of the compiled vertex shader bytecode.
    pub vertex_shader: u64,
    /// Hash of the compiled pixel shader bytecode, 0 for depth-only.
    pub pixel_shader: u64,
    /// Render target format identifier.
    pub target_format: u32,
    pub sample_count: u32,
}

/// A cached root signature, destroyed with its last reference.
pub struct RootSignature {
    device: Arc<dyn NativeDevice>,
    native: NativeRootSignature,
    desc: RootSignatureDesc,
}

impl RootSignature {
    pub fn native(&self) -> NativeRootSignature {
        self.native
    }

    pub fn desc(&self) -> &RootSignatureDesc {
        &self.desc
    }
}

impl Drop for RootSignature {
    fn drop(&mut self) {
        self.device.destroy_root_signature(self.native);
    }
}

impl std::fmt::Debug for RootSignature {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RootSignature")
            .field("native", &self.native)
            .field("desc", &self.desc)
            .finish()
    }
}

/// A cached pipeline, destroyed with its last reference.
pub struct Pipeline {
    device: Arc<dyn NativeDevice>,
    native: NativePipeline,
    desc: PipelineDesc,
    root_signature: Arc<RootSignature>,
}

impl Pipeline {
    pub fn native(&self) -> NativePipeline {
        self.native
    }

    pub fn desc(&self) -> &PipelineDesc {
        &self.desc
    }

    pub fn root_signature(&self) -> &Arc<RootSignature> {
        &self.root_signature
    }
}

impl Drop for Pipeline {
    fn drop(&mut self) {
        self.device.destroy_pipeline(self.native);
    }
}

impl std::fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipeline")
            .field("native", &self.native)
            .field("desc", &self.desc)
            .finish()
    }
}

/// Deduplicating cache of pipelines and root signatures.
pub struct ObjectCache {
    device: RwLock<Arc<dyn NativeDevice>>,
    pipelines: Mutex<HashMap<PipelineDesc, Arc<Pipeline>>>,
    root_signatures: Mutex<HashMap<RootSignatureDesc, Arc<RootSignature>>>,
}

impl ObjectCache {
    pub(crate) fn new(device: Arc<dyn NativeDevice>) -> Self {
        Self {
            device: RwLock::new(device),
            pipelines: Mutex::new(HashMap::new()),
            root_signatures: Mutex::new(HashMap::new()),
        }
    }

    /// Get or create the root signature for `desc`.
    pub fn root_signature(&self, desc: &RootSignatureDesc) -> Result<Arc<RootSignature>, GpuError> {
        if let Some(cached) = self.root_signatures.lock().get(desc) {
            return Ok(cached.clone());
        }

        let device = self.device.read().clone();
        let native = device.create_root_signature(desc)?;
        let signature = Arc::new(RootSignature {
            device,
            native,
            desc: desc.clone(),
        });

        // another thread may have raced the creation; keep the first one
        Ok(self
            .root_signatures
            .lock()
            .entry(desc.clone())
            .or_insert(signature)
            .clone())
    }

    /// Get or create the pipeline for `desc`, resolving its root signature
    /// through the cache.
    pub fn pipeline(&self, desc: &PipelineDesc) -> Result<Arc<Pipeline>, GpuError> {
        if let Some(cached) = self.pipelines.lock().get(desc) {
            return Ok(cached.clone());
        }

        let root_signature = self.root_signature(&desc.root_signature)?;
        let device = self.device.read().clone();
        let native = device.create_pipeline(desc)?;
        let pipeline = Arc::new(Pipeline {
            device,
            native,
            desc: desc.clone(),
            root_signature,
        });

        Ok(self
            .pipelines
            .lock()
            .entry(desc.clone())
            .or_insert(pipeline)
            .clone())
    }

    pub fn pipeline_count(&self) -> usize {
        self.pipelines.lock().len()
    }

    pub fn root_signature_count(&self) -> usize {
        self.root_signatures.lock().len()
    }

    /// Discard every cached object. Outstanding references keep individual
    /// objects alive until dropped; the cache itself starts empty on the new
    /// device.
    pub(crate) fn on_device_lost(&self) {
        let pipelines = std::mem::take(&mut *self.pipelines.lock());
        let signatures = std::mem::take(&mut *self.root_signatures.lock());
        log::debug!(
            "object cache: discarding {} pipelines, {} root signatures",
            pipelines.len(),
            signatures.len()
        );
    }

    pub(crate) fn on_device_restored(&self, device: Arc<dyn NativeDevice>) {
        debug_assert!(self.pipelines.lock().is_empty());
        *self.device.write() = device;
    }
}

impl std::fmt::Debug for ObjectCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObjectCache")
            .field("pipelines", &self.pipeline_count())
            .field("root_signatures", &self.root_signature_count())
            .finish()
    }
}

static_assertions::assert_impl_all!(ObjectCache: Send, Sync);

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::dummy::DummyBackend;
    use crate::backend::GpuBackend;
    use crate::types::FeatureLevel;

    fn cache() -> ObjectCache {
        let backend = DummyBackend::new();
        let adapter = backend.enumerate_adapters().remove(0);
        let device = backend
            .create_device(&adapter, FeatureLevel::default(), false)
            .unwrap();
        ObjectCache::new(device)
    }

    fn desc(vertex_shader: u64) -> PipelineDesc {
        PipelineDesc {
            vertex_shader,
            sample_count: 1,
            ..Default::default()
        }
    }

    #[test]
    fn test_pipeline_dedup() {
        let cache = cache();
        let a = cache.pipeline(&desc(1)).unwrap();
        let b = cache.pipeline(&desc(1)).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(cache.pipeline_count(), 1);

        let c = cache.pipeline(&desc(2)).unwrap();
        assert!(!Arc::ptr_eq(&a, &c));
        assert_eq!(cache.pipeline_count(), 2);
    }

    #[test]
    fn test_pipelines_share_root_signature() {
        let cache = cache();
        let a = cache.pipeline(&desc(1)).unwrap();
        let b = cache.pipeline(&desc(2)).unwrap();
        assert!(Arc::ptr_eq(a.root_signature(), b.root_signature()));
        assert_eq!(cache.root_signature_count(), 1);
    }

    #[test]
    fn test_device_loss_clears_cache() {
        let backend = DummyBackend::new();
        let adapter = backend.enumerate_adapters().remove(0);
        let device = backend
            .create_device(&adapter, FeatureLevel::default(), false)
            .unwrap();
        let dummy = backend.current_device().unwrap();
        let cache = ObjectCache::new(device);

        let held = cache.pipeline(&desc(1)).unwrap();
        cache.pipeline(&desc(2)).unwrap();
        assert_eq!(dummy.live_pipeline_count(), 2);

        cache.on_device_lost();
        assert_eq!(cache.pipeline_count(), 0);
        // the held pipeline survives the cache purge
        assert_eq!(dummy.live_pipeline_count(), 1);
        drop(held);
        assert_eq!(dummy.live_pipeline_count(), 0);

        let fresh = backend
            .create_device(&adapter, FeatureLevel::default(), false)
            .unwrap();
        cache.on_device_restored(fresh);
        assert!(cache.pipeline(&desc(1)).is_ok());
        assert_eq!(cache.pipeline_count(), 1);
    }
}
