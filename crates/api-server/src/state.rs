//! Application state

use std::sync::Arc;

use agent_runner::{
    CancellationSignal, CollaboratorFactory, HttpCollaboratorFactory, RunController, RunStore,
};

use crate::config::ServerConfig;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    inner: Arc<AppStateInner>,
}

struct AppStateInner {
    config: ServerConfig,
    controller: RunController,
}

impl AppState {
    /// Create state backed by HTTP collaborators
    pub fn new(config: ServerConfig, signal: Arc<CancellationSignal>) -> Self {
        let factory = Arc::new(HttpCollaboratorFactory::new(config.endpoints()));
        Self::with_factory(config, signal, factory)
    }

    pub fn with_factory(
        config: ServerConfig,
        signal: Arc<CancellationSignal>,
        factory: Arc<dyn CollaboratorFactory>,
    ) -> Self {
        let store = RunStore::new(&config.data_dir);
        let controller = RunController::new(store, factory, signal, config.runner_config());
        Self {
            inner: Arc::new(AppStateInner { config, controller }),
        }
    }

    pub fn config(&self) -> &ServerConfig {
        &self.inner.config
    }

    pub fn controller(&self) -> &RunController {
        &self.inner.controller
    }

    /// Get reference to the run store
    pub fn run_store(&self) -> &RunStore {
        self.inner.controller.store()
    }
}
