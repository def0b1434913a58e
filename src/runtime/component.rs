//! Components: named groups of ports
//!
//! A component has one control port, N input ports and M output ports.
//! Destroying it cascades to every port and to every connection touching them.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};

use tracing::{debug, info, warn};

use super::connection::Connection;
use super::errors::{ComponentError, NativeError, PortDisableError};
use super::format::{BufferRequirements, Format};
use super::lock;
use super::native::{ComponentId, NativeEngine, PortId, PortKind};
use super::port::{Port, PortEnv};
use super::registry::Registry;
use crate::params::{ParamId, ParamValue, ParameterStore};

/// Creation-time description of one port
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortSpec {
    format: Format,
    requirements: BufferRequirements,
}

impl PortSpec {
    /// A port needing at least `min_count` buffers of `min_size` bytes
    pub fn new(min_count: u32, min_size: u32) -> Self {
        Self {
            format: Format::default(),
            requirements: BufferRequirements::new(min_count, min_size),
        }
    }

    pub fn with_format(mut self, format: Format) -> Self {
        self.format = format;
        self
    }

    pub fn with_requirements(mut self, requirements: BufferRequirements) -> Self {
        self.requirements = requirements;
        self
    }
}

impl Default for PortSpec {
    fn default() -> Self {
        Self::new(1, 128)
    }
}

/// Creation-time description of a component
pub struct ComponentSpec {
    name: String,
    control: PortSpec,
    inputs: Vec<PortSpec>,
    outputs: Vec<PortSpec>,
    capture: Vec<u32>,
    parameters: Option<Box<dyn ParameterStore>>,
}

impl ComponentSpec {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            control: PortSpec::default(),
            inputs: Vec::new(),
            outputs: Vec::new(),
            capture: Vec::new(),
            parameters: None,
        }
    }

    pub fn with_control(mut self, control: PortSpec) -> Self {
        self.control = control;
        self
    }

    pub fn with_input(mut self, input: PortSpec) -> Self {
        self.inputs.push(input);
        self
    }

    pub fn with_output(mut self, output: PortSpec) -> Self {
        self.outputs.push(output);
        self
    }

    /// Designate output `index` as a capture port, switched by start/stop capture
    pub fn capture_port(mut self, index: u32) -> Self {
        if !self.capture.contains(&index) {
            self.capture.push(index);
        }
        self
    }

    pub fn with_parameters(mut self, store: impl ParameterStore + 'static) -> Self {
        self.parameters = Some(Box::new(store));
        self
    }
}

pub(crate) struct ComponentInner {
    id: ComponentId,
    name: String,
    engine: Arc<dyn NativeEngine>,
    control: Port,
    inputs: Vec<Port>,
    outputs: Vec<Port>,
    capture: Vec<u32>,
    enabled: AtomicBool,
    force_stop: Arc<AtomicBool>,
    destroyed: AtomicBool,
    connections: Mutex<Vec<Connection>>,
    parameters: Option<Mutex<Box<dyn ParameterStore>>>,
    registry: Weak<Registry<ComponentInner>>,
}

impl ComponentInner {
    pub(crate) fn build(
        id: ComponentId,
        spec: ComponentSpec,
        env: PortEnv,
        registry: Weak<Registry<ComponentInner>>,
    ) -> Arc<Self> {
        let ComponentSpec {
            name,
            control,
            inputs,
            outputs,
            capture,
            parameters,
        } = spec;
        Arc::new_cyclic(|me: &Weak<ComponentInner>| {
            let port = |kind: PortKind, index: usize, spec: PortSpec| {
                let id = PortId::new(id, kind, index as u32);
                let label = format!("{}:{}{}", name, kind.prefix(), index);
                Port::new(id, label, me.clone(), env.clone(), spec.format, spec.requirements)
            };
            let control = port(PortKind::Control, 0, control);
            let inputs = inputs
                .into_iter()
                .enumerate()
                .map(|(i, spec)| port(PortKind::Input, i, spec))
                .collect();
            let outputs = outputs
                .into_iter()
                .enumerate()
                .map(|(i, spec)| port(PortKind::Output, i, spec))
                .collect();
            ComponentInner {
                id,
                name: name.clone(),
                engine: Arc::clone(&env.engine),
                control,
                inputs,
                outputs,
                capture,
                enabled: AtomicBool::new(false),
                force_stop: Arc::clone(&env.force_stop),
                destroyed: AtomicBool::new(false),
                connections: Mutex::new(Vec::new()),
                parameters: parameters.map(Mutex::new),
                registry,
            }
        })
    }

    pub(crate) fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    pub(crate) fn name(&self) -> &str {
        &self.name
    }
}

/// Handle to a component (cheap to clone)
#[derive(Clone)]
pub struct Component {
    inner: Arc<ComponentInner>,
}

impl Component {
    pub(crate) fn from_inner(inner: Arc<ComponentInner>) -> Self {
        Self { inner }
    }

    pub fn id(&self) -> ComponentId {
        self.inner.id
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn control(&self) -> &Port {
        &self.inner.control
    }

    pub fn inputs(&self) -> &[Port] {
        &self.inner.inputs
    }

    pub fn outputs(&self) -> &[Port] {
        &self.inner.outputs
    }

    pub fn input(&self, index: usize) -> Option<&Port> {
        self.inner.inputs.get(index)
    }

    pub fn output(&self, index: usize) -> Option<&Port> {
        self.inner.outputs.get(index)
    }

    /// Control port first, then inputs, then outputs
    pub fn ports(&self) -> impl Iterator<Item = &Port> {
        std::iter::once(&self.inner.control)
            .chain(self.inner.inputs.iter())
            .chain(self.inner.outputs.iter())
    }

    /// Output ports switched by [`start_capture`](Component::start_capture)
    pub fn capture_ports(&self) -> Vec<&Port> {
        self.inner
            .capture
            .iter()
            .filter_map(|index| self.inner.outputs.get(*index as usize))
            .collect()
    }

    /// Connections created from this component's outputs
    pub fn connections(&self) -> Vec<Connection> {
        lock(&self.inner.connections).clone()
    }

    pub fn is_enabled(&self) -> bool {
        self.inner.is_enabled()
    }

    pub fn is_destroyed(&self) -> bool {
        self.inner.destroyed.load(Ordering::Acquire)
    }

    /// Enable the component; also clears a pending force-stop
    pub fn enable(&self) -> Result<(), ComponentError> {
        if self.is_destroyed() {
            return Err(ComponentError::Destroyed(self.inner.name.clone()));
        }
        self.clear_force_stop();
        if self.is_enabled() {
            return Ok(());
        }
        self.inner
            .engine
            .enable_component(self.inner.id)
            .map_err(|source| self.native_error(source))?;
        self.inner.enabled.store(true, Ordering::Release);
        info!("[{}] Component enabled", self.inner.name);
        Ok(())
    }

    /// Disable the component, first disabling any port enabled with a callback
    pub fn disable(&self) -> Result<(), ComponentError> {
        if !self.is_enabled() {
            return Ok(());
        }
        for port in self.ports() {
            if port.is_enabled() && !port.is_tunnelled() {
                port.disable()?;
            }
        }
        self.inner
            .engine
            .disable_component(self.inner.id)
            .map_err(|source| self.native_error(source))?;
        self.inner.enabled.store(false, Ordering::Release);
        info!("[{}] Component disabled", self.inner.name);
        Ok(())
    }

    /// Ask in-flight callbacks to finish: every later delivery counts as terminal
    pub fn force_stop(&self) {
        if !self.inner.force_stop.swap(true, Ordering::AcqRel) {
            debug!("[{}] Force stop requested", self.inner.name);
        }
    }

    pub fn clear_force_stop(&self) {
        self.inner.force_stop.store(false, Ordering::Release);
    }

    pub fn is_force_stopped(&self) -> bool {
        self.inner.force_stop.load(Ordering::Acquire)
    }

    /// Turn capture on for every capture port
    pub fn start_capture(&self) -> Result<(), NativeError> {
        for port in self.capture_ports() {
            self.inner.engine.set_capture(port.id(), true)?;
            debug!("[{}] Capture started", port.label());
        }
        Ok(())
    }

    /// Turn capture off for every capture port
    pub fn stop_capture(&self) -> Result<(), NativeError> {
        let mut result = Ok(());
        for port in self.capture_ports() {
            if let Err(e) = self.inner.engine.set_capture(port.id(), false) {
                warn!("[{}] Stopping capture failed: {}", port.label(), e);
                result = Err(e);
            }
        }
        result
    }

    pub fn get_parameter(&self, id: ParamId) -> Result<ParamValue, ComponentError> {
        let store = self.parameters()?;
        let value = lock(store)
            .get_parameter(id)
            .map_err(|source| self.param_error(source))?;
        Ok(value)
    }

    pub fn set_parameter(&self, id: ParamId, value: ParamValue) -> Result<(), ComponentError> {
        let store = self.parameters()?;
        lock(store)
            .set_parameter(id, value)
            .map_err(|source| self.param_error(source))
    }

    /// Tear down the component: connections touching its ports, then the
    /// ports and their pools, then the component itself.
    ///
    /// The cascade always runs to the end; the first error is returned.
    pub fn destroy(&self) -> Result<(), ComponentError> {
        if self.inner.destroyed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let name = &self.inner.name;
        let mut first_error: Option<ComponentError> = None;
        let mut record = |e: ComponentError| {
            warn!("[{}] {}", name, e);
            first_error.get_or_insert(e);
        };

        for port in self.ports() {
            if let Some(connection) = port.connection() {
                if let Err(e) = connection.disable() {
                    record(e.into());
                }
                if let Err(e) = connection.destroy() {
                    record(e.into());
                }
            }
        }

        for port in self.ports() {
            if port.is_enabled()
                && let Err(e) = port.disable()
            {
                record(e.into());
            }
            match port.destroy_pool() {
                Ok(()) => {}
                Err(PortDisableError::Outstanding { .. }) => port.abandon_pool(),
                Err(e) => record(e.into()),
            }
        }

        if self.is_enabled() {
            if let Err(source) = self.inner.engine.disable_component(self.inner.id) {
                record(self.native_error(source));
            }
            self.inner.enabled.store(false, Ordering::Release);
        }
        if let Err(source) = self.inner.engine.destroy_component(self.inner.id) {
            record(self.native_error(source));
        }
        if let Some(registry) = self.inner.registry.upgrade() {
            registry.remove(self.inner.id);
        }
        info!("[{}] Component destroyed", name);

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    pub(crate) fn adopt(&self, connection: Connection) {
        lock(&self.inner.connections).push(connection);
    }

    pub(crate) fn forget(&self, connection: &Connection) {
        lock(&self.inner.connections).retain(|c| !c.same_as(connection));
    }

    pub(crate) fn same_as(&self, other: &Component) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    fn parameters(&self) -> Result<&Mutex<Box<dyn ParameterStore>>, ComponentError> {
        self.inner
            .parameters
            .as_ref()
            .ok_or_else(|| ComponentError::NoParameters {
                component: self.inner.name.clone(),
            })
    }

    fn native_error(&self, source: NativeError) -> ComponentError {
        ComponentError::Native {
            component: self.inner.name.clone(),
            source,
        }
    }

    fn param_error(&self, source: crate::params::ParamError) -> ComponentError {
        ComponentError::Parameter {
            component: self.inner.name.clone(),
            source,
        }
    }
}

impl std::fmt::Debug for Component {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("Component")
            .field("id", &self.inner.id)
            .field("name", &self.inner.name)
            .field("enabled", &self.is_enabled())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handlers::MemoryCapture;
    use crate::params::{MemoryParameters, ParamError};
    use crate::runtime::mock::ManualEngine;
    use crate::runtime::{Context, PortCallback, PortState, RuntimeConfig};
    use std::time::Duration;

    fn context(engine: &Arc<ManualEngine>) -> Context {
        let config = RuntimeConfig::default().with_drain_timeout(Duration::from_millis(50));
        Context::with_config(engine.clone(), config)
    }

    #[test]
    fn test_ports_are_laid_out_from_spec() {
        let engine = ManualEngine::new();
        let context = context(&engine);
        let camera = context
            .create_component(
                ComponentSpec::new("camera")
                    .with_output(PortSpec::new(3, 1024))
                    .with_output(PortSpec::new(2, 512))
                    .with_output(PortSpec::new(2, 512))
                    .capture_port(2),
            )
            .unwrap();

        assert_eq!(camera.control().label(), "camera:ctl0");
        assert_eq!(camera.outputs().len(), 3);
        assert!(camera.inputs().is_empty());
        assert_eq!(camera.output(1).unwrap().label(), "camera:out1");
        assert_eq!(camera.ports().count(), 4);
        let capture: Vec<_> = camera.capture_ports().iter().map(|p| p.index()).collect();
        assert_eq!(capture, vec![2]);
        assert!(camera.output(0).unwrap().component().unwrap().same_as(&camera));
    }

    #[test]
    fn test_enable_clears_force_stop() {
        let engine = ManualEngine::new();
        let context = context(&engine);
        let camera = context.create_component(ComponentSpec::new("camera")).unwrap();
        camera.force_stop();
        assert!(camera.is_force_stopped());
        camera.enable().unwrap();
        assert!(camera.is_enabled());
        assert!(!camera.is_force_stopped());
    }

    #[test]
    fn test_disable_stops_enabled_ports() {
        let engine = ManualEngine::new();
        let context = context(&engine);
        let camera = context
            .create_component(ComponentSpec::new("camera").with_output(PortSpec::new(2, 64)))
            .unwrap();
        camera.enable().unwrap();
        let output = camera.output(0).unwrap();
        output.enable(PortCallback::capture(MemoryCapture::new())).unwrap();

        camera.disable().unwrap();
        assert!(!camera.is_enabled());
        assert_eq!(output.state(), PortState::Disabled);
        assert!(!engine.is_registered(output.id()));
    }

    #[test]
    fn test_capture_switches_capture_ports() {
        let engine = ManualEngine::new();
        let context = context(&engine);
        let camera = context
            .create_component(
                ComponentSpec::new("camera")
                    .with_output(PortSpec::new(2, 64))
                    .with_output(PortSpec::new(2, 64))
                    .capture_port(1),
            )
            .unwrap();
        camera.start_capture().unwrap();
        assert!(engine.is_capturing(camera.output(1).unwrap().id()));
        assert!(!engine.is_capturing(camera.output(0).unwrap().id()));
        camera.stop_capture().unwrap();
        assert!(!engine.is_capturing(camera.output(1).unwrap().id()));
    }

    #[test]
    fn test_parameters_delegate_to_store() {
        let engine = ManualEngine::new();
        let context = context(&engine);
        let camera = context
            .create_component(ComponentSpec::new("camera").with_parameters(MemoryParameters::new()))
            .unwrap();
        camera.set_parameter(ParamId::Iso, ParamValue::UInt32(800)).unwrap();
        assert_eq!(camera.get_parameter(ParamId::Iso).unwrap(), ParamValue::UInt32(800));
        assert!(matches!(
            camera.set_parameter(ParamId::Iso, ParamValue::Int32(800)),
            Err(ComponentError::Parameter {
                source: ParamError::TypeMismatch { .. },
                ..
            })
        ));

        let bare = context.create_component(ComponentSpec::new("bare")).unwrap();
        assert!(matches!(
            bare.get_parameter(ParamId::Iso),
            Err(ComponentError::NoParameters { .. })
        ));
    }

    #[test]
    fn test_destroy_cascades() {
        let engine = ManualEngine::new();
        let context = context(&engine);
        let camera = context
            .create_component(ComponentSpec::new("camera").with_output(PortSpec::new(2, 64)))
            .unwrap();
        let encoder = context
            .create_component(
                ComponentSpec::new("encoder")
                    .with_input(PortSpec::new(2, 64))
                    .with_output(PortSpec::new(2, 64)),
            )
            .unwrap();
        camera.enable().unwrap();
        encoder.enable().unwrap();
        let connection =
            Connection::create(camera.output(0).unwrap(), encoder.input(0).unwrap()).unwrap();
        let tunnel_pool = connection.pool().unwrap();
        let output = encoder.output(0).unwrap();
        output.enable(PortCallback::capture(MemoryCapture::new())).unwrap();
        let port_pool = output.pool().unwrap();
        assert_eq!(context.live_components().len(), 2);

        encoder.destroy().unwrap();
        assert!(encoder.is_destroyed());
        assert!(connection.is_destroyed());
        assert!(!tunnel_pool.is_alive());
        assert!(!port_pool.is_alive());
        assert!(camera.output(0).unwrap().connection().is_none());
        assert!(camera.connections().is_empty());
        assert_eq!(context.live_components().len(), 1);
        assert!(context.component(encoder.id()).is_none());
        assert!(matches!(encoder.enable(), Err(ComponentError::Destroyed(_))));
    }
}
