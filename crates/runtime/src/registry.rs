//! Want-type factory registry.
//!
//! Concrete want types plug in by `metadata.type`; the reconciler constructs
//! one progressable instance per want through the registered factory.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::debug;

use wunsch_core::WantConfig;

use crate::error::ProgressError;
use crate::want::{Progressable, Want};

/// Builds a progressable instance for one want.
pub trait WantFactory: Send + Sync {
    fn create(&self, config: &WantConfig) -> Arc<dyn Progressable>;
}

/// Closures work as factories directly.
impl<F> WantFactory for F
where
    F: Fn(&WantConfig) -> Arc<dyn Progressable> + Send + Sync,
{
    fn create(&self, config: &WantConfig) -> Arc<dyn Progressable> {
        self(config)
    }
}

#[derive(Default)]
pub struct TypeRegistry {
    factories: RwLock<HashMap<String, Arc<dyn WantFactory>>>,
}

impl TypeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, type_name: impl Into<String>, factory: Arc<dyn WantFactory>) {
        let type_name = type_name.into();
        debug!(type_name = %type_name, "registered want type");
        self.factories.write().insert(type_name, factory);
    }

    pub fn create(&self, config: &WantConfig) -> Option<Arc<dyn Progressable>> {
        self.factories
            .read()
            .get(&config.metadata.type_name)
            .map(|f| f.create(config))
    }

    pub fn contains(&self, type_name: &str) -> bool {
        self.factories.read().contains_key(type_name)
    }
}

/// Placeholder for wants whose type is unknown at add time. The want sits in
/// `configError` until a config update registers the type or fixes the name.
pub struct NoopProgressable;

#[async_trait::async_trait]
impl Progressable for NoopProgressable {
    fn is_achieved(&self, _want: &Arc<Want>) -> bool {
        false
    }

    async fn progress(&self, _want: &Arc<Want>) -> Result<(), ProgressError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wunsch_core::{Metadata, WantSpec};

    #[test]
    fn closure_factories_resolve_by_type() {
        let registry = TypeRegistry::new();
        registry.register(
            "noop",
            Arc::new(|_config: &WantConfig| Arc::new(NoopProgressable) as Arc<dyn Progressable>),
        );

        let known = WantConfig::new(Metadata::new("a", "noop"), WantSpec::default());
        assert!(registry.create(&known).is_some());

        let unknown = WantConfig::new(Metadata::new("b", "mystery"), WantSpec::default());
        assert!(registry.create(&unknown).is_none());
        assert!(registry.contains("noop"));
    }
}
