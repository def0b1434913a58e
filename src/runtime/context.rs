//! Runtime context: engine, configuration and the live component table

use std::sync::Arc;
use std::sync::atomic::AtomicBool;

use tracing::{debug, warn};

use super::component::{Component, ComponentInner, ComponentSpec};
use super::config::RuntimeConfig;
use super::errors::ComponentError;
use super::native::{ComponentId, NativeEngine};
use super::port::PortEnv;
use super::registry::Registry;
use super::watchdog::Watchdog;

/// Entry point for building components against one engine
#[derive(Clone)]
pub struct Context {
    engine: Arc<dyn NativeEngine>,
    config: RuntimeConfig,
    watchdog: Watchdog,
    components: Arc<Registry<ComponentInner>>,
}

impl Context {
    pub fn new(engine: Arc<dyn NativeEngine>) -> Self {
        Self::with_config(engine, RuntimeConfig::default())
    }

    pub fn with_config(engine: Arc<dyn NativeEngine>, config: RuntimeConfig) -> Self {
        let watchdog = Watchdog::new(config.watchdog_threshold);
        Self {
            engine,
            config,
            watchdog,
            components: Arc::new(Registry::new()),
        }
    }

    pub fn engine(&self) -> &Arc<dyn NativeEngine> {
        &self.engine
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    pub fn watchdog(&self) -> &Watchdog {
        &self.watchdog
    }

    /// Build a component and announce it to the engine
    pub fn create_component(&self, spec: ComponentSpec) -> Result<Component, ComponentError> {
        let env = PortEnv {
            engine: Arc::clone(&self.engine),
            drain_timeout: self.config.drain_timeout,
            watchdog: self.watchdog.clone(),
            force_stop: Arc::new(AtomicBool::new(false)),
        };
        let registry = Arc::downgrade(&self.components);
        let inner = self
            .components
            .insert_with(|id| ComponentInner::build(id, spec, env, registry));
        let component = Component::from_inner(inner);

        if let Err(source) = self.engine.create_component(component.id(), component.name()) {
            warn!("[{}] Native creation failed: {}", component.name(), source);
            self.components.remove(component.id());
            return Err(ComponentError::Native {
                component: component.name().to_string(),
                source,
            });
        }
        debug!(
            "[{}] Created as {} with {} inputs and {} outputs",
            component.name(),
            component.id(),
            component.inputs().len(),
            component.outputs().len()
        );
        Ok(component)
    }

    /// Components that have not been destroyed or dropped
    pub fn live_components(&self) -> Vec<Component> {
        self.components
            .live()
            .into_iter()
            .map(Component::from_inner)
            .collect()
    }

    pub fn component(&self, id: ComponentId) -> Option<Component> {
        self.components.get(id).map(Component::from_inner)
    }
}

impl std::fmt::Debug for Context {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("Context")
            .field("config", &self.config)
            .field("components", &self.components.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::component::PortSpec;
    use crate::runtime::mock::ManualEngine;

    #[test]
    fn test_components_are_tracked_until_dropped() {
        let engine = ManualEngine::new();
        let context = Context::new(engine);
        let camera = context
            .create_component(ComponentSpec::new("camera").with_output(PortSpec::new(2, 64)))
            .unwrap();
        let id = camera.id();
        assert_eq!(context.component(id).unwrap().name(), "camera");
        assert_eq!(context.live_components().len(), 1);

        drop(camera);
        assert!(context.component(id).is_none());
        assert!(context.live_components().is_empty());
    }

    #[test]
    fn test_handles_are_not_reused() {
        let engine = ManualEngine::new();
        let context = Context::new(engine);
        let first = context.create_component(ComponentSpec::new("a")).unwrap();
        let first_id = first.id();
        first.destroy().unwrap();

        let second = context.create_component(ComponentSpec::new("b")).unwrap();
        assert_ne!(first_id, second.id());
        assert!(context.component(first_id).is_none());
    }
}
