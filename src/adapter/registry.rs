//! # Handler Registry
//!
//! Compiled registry mapping module paths to handler factories. The
//! process-global registry backs worker startup in both spawned worker
//! processes and worker threads; explicit instances are available for
//! tests.

use std::sync::{Arc, OnceLock};

use dashmap::DashMap;
use tracing::debug;

use super::{AdapterConfig, Handler, HandlerFactory};
use crate::error::{OffloadError, Result};

static GLOBAL_REGISTRY: OnceLock<Arc<HandlerRegistry>> = OnceLock::new();

/// Thread-safe module-path → factory map.
#[derive(Default)]
pub struct HandlerRegistry {
    factories: DashMap<String, Arc<dyn HandlerFactory>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// The process-wide registry. Host binaries register their handlers
    /// here before building pools; spawned worker processes resolve
    /// against it. Worker threads hold a clone of the returned `Arc`.
    pub fn global() -> Arc<HandlerRegistry> {
        Arc::clone(GLOBAL_REGISTRY.get_or_init(|| Arc::new(HandlerRegistry::new())))
    }

    /// Register a factory under a module path. Re-registering a path
    /// replaces the previous factory.
    pub fn register(&self, module_path: impl Into<String>, factory: Arc<dyn HandlerFactory>) {
        let module_path = module_path.into();
        let replaced = self.factories.insert(module_path.clone(), factory);
        debug!(
            module_path = %module_path,
            replaced = replaced.is_some(),
            "📚 REGISTRY: handler factory registered"
        );
    }

    pub fn contains(&self, module_path: &str) -> bool {
        self.factories.contains_key(module_path)
    }

    pub fn registered_paths(&self) -> Vec<String> {
        self.factories
            .iter()
            .map(|entry| entry.key().clone())
            .collect()
    }

    /// Resolve and load the handler for an adapter configuration. Called
    /// exactly once per worker lifetime, at startup.
    pub async fn load(&self, config: &AdapterConfig) -> Result<Arc<dyn Handler>> {
        let factory = self
            .factories
            .get(&config.module_path)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| OffloadError::HandlerNotFound {
                module_path: config.module_path.clone(),
            })?;

        let handler = factory.load(&config.options).await?;
        debug!(module_path = %config.module_path, "📚 REGISTRY: handler loaded");
        Ok(handler)
    }
}
