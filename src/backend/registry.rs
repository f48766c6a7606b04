use crate::backend::adapter::BackendAdapter;
use dashmap::DashMap;
use std::sync::Arc;
use tracing::info;

/// Explicit map of participating backends keyed by backend id.
#[derive(Default)]
pub struct BackendRegistry {
    adapters: DashMap<String, Arc<dyn BackendAdapter>>,
}

impl BackendRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an adapter, replacing any previous one with the same id.
    pub fn register(&self, adapter: Arc<dyn BackendAdapter>) -> Option<Arc<dyn BackendAdapter>> {
        let backend_id = adapter.backend_id().to_string();
        info!(backend = %backend_id, "Registering backend adapter");
        self.adapters.insert(backend_id, adapter)
    }

    pub fn unregister(&self, backend_id: &str) -> Option<Arc<dyn BackendAdapter>> {
        self.adapters.remove(backend_id).map(|(_, adapter)| adapter)
    }

    pub fn get(&self, backend_id: &str) -> Option<Arc<dyn BackendAdapter>> {
        self.adapters.get(backend_id).map(|entry| Arc::clone(entry.value()))
    }

    /// Registered ids in sorted order.
    pub fn backend_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.adapters.iter().map(|entry| entry.key().clone()).collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        self.adapters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.adapters.is_empty()
    }
}

impl std::fmt::Debug for BackendRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackendRegistry")
            .field("backends", &self.backend_ids())
            .finish()
    }
}
