/*!
 * Handle Registry
 *
 * Maps opaque `u64` handles to live pipelines for callers that cannot hold a
 * Rust value. Handle 0 is never issued.
 */

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, OnceLock};
use tracing::debug;

use crate::pipeline::Pipeline;

/// Opaque pipeline handle
pub type PipelineHandle = u64;

pub struct HandleRegistry {
    next: AtomicU64,
    pipelines: Mutex<HashMap<PipelineHandle, Pipeline>>,
}

impl Default for HandleRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl HandleRegistry {
    pub fn new() -> Self {
        Self {
            next: AtomicU64::new(1),
            pipelines: Mutex::new(HashMap::new()),
        }
    }

    /// Process-wide registry
    pub fn global() -> &'static HandleRegistry {
        static REGISTRY: OnceLock<HandleRegistry> = OnceLock::new();
        REGISTRY.get_or_init(HandleRegistry::new)
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<PipelineHandle, Pipeline>> {
        match self.pipelines.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Take ownership of a pipeline and issue its handle
    pub fn insert(&self, pipeline: Pipeline) -> PipelineHandle {
        let handle = self.next.fetch_add(1, Ordering::Relaxed);
        debug!("Registered pipeline {} as handle {}", pipeline.id(), handle);
        self.lock().insert(handle, pipeline);
        handle
    }

    /// Run `f` against a registered pipeline
    pub fn with<R>(&self, handle: PipelineHandle, f: impl FnOnce(&mut Pipeline) -> R) -> Option<R> {
        self.lock().get_mut(&handle).map(f)
    }

    /// Unregister a pipeline; each handle is removed at most once
    pub fn remove(&self, handle: PipelineHandle) -> Option<Pipeline> {
        self.lock().remove(&handle)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
