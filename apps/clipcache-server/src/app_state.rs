use std::sync::Arc;

use clipcache_core::{ClipCoordinator, MetricsObserver};

#[derive(Clone)]
pub(crate) struct AppState {
    coordinator: Arc<ClipCoordinator>,
    metrics: Arc<MetricsObserver>,
}

impl AppState {
    pub fn new(coordinator: Arc<ClipCoordinator>, metrics: Arc<MetricsObserver>) -> Self {
        Self {
            coordinator,
            metrics,
        }
    }

    pub fn coordinator(&self) -> &Arc<ClipCoordinator> {
        &self.coordinator
    }

    pub fn metrics(&self) -> &MetricsObserver {
        &self.metrics
    }
}
