//! Tunnels between an output port and an input port
//!
//! Buffers of a tunnel travel from the source to the sink inside the engine
//! and never pass through application code. The connection owns the shared
//! pool, sized from the allocating side's requirements merged with the other
//! side's minimums.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tracing::{debug, info, warn};

use super::errors::{ConnectError, PoolError, TunnelError};
use super::lock;
use super::native::{NativeEngine, PortKind};
use super::pool::Pool;
use super::port::{Port, PortState};
use super::watchdog::{OperationGuard, Watchdog};

/// Which port's buffer requirements govern the shared pool
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AllocatingSide {
    #[default]
    Source,
    Sink,
}

struct TunnelState {
    enabled: bool,
    destroyed: bool,
    pool: Option<Pool>,
}

pub(crate) struct ConnectionInner {
    label: String,
    source: Port,
    sink: Port,
    allocating: AllocatingSide,
    engine: Arc<dyn NativeEngine>,
    drain_timeout: Duration,
    watchdog: Watchdog,
    state: Mutex<TunnelState>,
}

/// Handle to a tunnel (cheap to clone)
#[derive(Clone)]
pub struct Connection {
    inner: Arc<ConnectionInner>,
}

impl Connection {
    /// Tunnel `source` into `sink` with the source allocating, then enable it
    pub fn create(source: &Port, sink: &Port) -> Result<Connection, ConnectError> {
        Self::create_with_allocator(source, sink, AllocatingSide::default())
    }

    /// Tunnel `source` into `sink`, committing the source format on the sink,
    /// then enable the tunnel.
    pub fn create_with_allocator(
        source: &Port,
        sink: &Port,
        allocating: AllocatingSide,
    ) -> Result<Connection, ConnectError> {
        if source.kind() != PortKind::Output || sink.kind() != PortKind::Input {
            return Err(ConnectError::Direction {
                source_port: source.label().to_string(),
                sink_port: sink.label().to_string(),
            });
        }

        // Lock both back-references in a fixed order so concurrent connects cannot deadlock
        let (mut source_slot, mut sink_slot) = if source.id() <= sink.id() {
            let a = lock(source.connection_slot());
            let b = lock(sink.connection_slot());
            (a, b)
        } else {
            let b = lock(sink.connection_slot());
            let a = lock(source.connection_slot());
            (a, b)
        };
        for (port, slot) in [(source, &source_slot), (sink, &sink_slot)] {
            if slot.as_ref().is_some_and(|weak| weak.strong_count() > 0) {
                return Err(ConnectError::AlreadyConnected {
                    port: port.label().to_string(),
                });
            }
        }
        for port in [source, sink] {
            if port.state() != PortState::Disabled {
                return Err(ConnectError::PortActive {
                    port: port.label().to_string(),
                });
            }
        }

        let format = source.format();
        let previous = sink.format();
        if let Some(reason) = format.incompatibility(&previous) {
            return Err(ConnectError::FormatMismatch {
                source_port: source.label().to_string(),
                sink_port: sink.label().to_string(),
                reason,
            });
        }
        sink.set_format(format);
        if let Err(e) = sink.commit_format() {
            sink.set_format(previous);
            return Err(ConnectError::FormatMismatch {
                source_port: source.label().to_string(),
                sink_port: sink.label().to_string(),
                reason: e.to_string(),
            });
        }

        let env = source.env();
        if let Err(e) = env.engine.create_tunnel(source.id(), sink.id()) {
            sink.set_format(previous);
            return Err(ConnectError::Native(e));
        }

        let connection = Connection {
            inner: Arc::new(ConnectionInner {
                label: format!("{} -> {}", source.label(), sink.label()),
                source: source.clone(),
                sink: sink.clone(),
                allocating,
                engine: Arc::clone(&env.engine),
                drain_timeout: env.drain_timeout,
                watchdog: env.watchdog.clone(),
                state: Mutex::new(TunnelState {
                    enabled: false,
                    destroyed: false,
                    pool: None,
                }),
            }),
        };
        *source_slot = Some(Arc::downgrade(&connection.inner));
        *sink_slot = Some(Arc::downgrade(&connection.inner));
        drop(source_slot);
        drop(sink_slot);

        if let Some(component) = source.component() {
            component.adopt(connection.clone());
        }

        if let Err(e) = connection.enable() {
            warn!("[{}] Enable failed, removing tunnel: {}", connection.label(), e);
            connection.release();
            sink.set_format(previous);
            return Err(ConnectError::Enable(e));
        }
        info!("Connected {}", connection.label());
        Ok(connection)
    }

    pub(crate) fn from_inner(inner: Arc<ConnectionInner>) -> Self {
        Self { inner }
    }

    /// `source -> sink`
    pub fn label(&self) -> &str {
        &self.inner.label
    }

    pub fn source(&self) -> &Port {
        &self.inner.source
    }

    pub fn sink(&self) -> &Port {
        &self.inner.sink
    }

    pub fn allocating_side(&self) -> AllocatingSide {
        self.inner.allocating
    }

    pub fn is_enabled(&self) -> bool {
        self.state().enabled
    }

    pub fn is_destroyed(&self) -> bool {
        self.state().destroyed
    }

    /// The shared pool, present once the tunnel has been enabled
    pub fn pool(&self) -> Option<Pool> {
        self.state().pool.clone()
    }

    /// Start moving buffers through the tunnel; enabling twice is a no-op
    pub fn enable(&self) -> Result<(), TunnelError> {
        let label = self.inner.label.clone();
        let mut state = self.state();
        if state.destroyed {
            return Err(TunnelError::Destroyed(label));
        }
        if state.enabled {
            return Ok(());
        }

        let (allocator, other) = match self.inner.allocating {
            AllocatingSide::Source => (&self.inner.source, &self.inner.sink),
            AllocatingSide::Sink => (&self.inner.sink, &self.inner.source),
        };
        let (count, size) = allocator
            .requirements()
            .merged_with(&other.requirements())
            .negotiated();

        let pool = match state.pool.take() {
            Some(pool) if pool.header_count() == count as usize && pool.payload_size() == size => pool,
            Some(pool) => match pool.resize(count, size) {
                Ok(()) => pool,
                Err(e) => {
                    debug!("[{}] Replacing pool: {}", label, e);
                    pool.close();
                    self.allocate(count, size)?
                }
            },
            None => self.allocate(count, size)?,
        };

        if let Err(source) = self
            .inner
            .engine
            .enable_tunnel(self.inner.source.id(), pool.clone())
        {
            state.pool = Some(pool);
            return Err(TunnelError::Native {
                connection: label,
                source,
            });
        }
        state.pool = Some(pool);
        state.enabled = true;
        self.inner.source.set_tunnel_enabled(true);
        self.inner.sink.set_tunnel_enabled(true);
        info!("[{}] Tunnel enabled with {} x {} bytes", label, count, size);
        Ok(())
    }

    /// Stop the tunnel and wait for every buffer in transit to return; disabling twice is a no-op
    pub fn disable(&self) -> Result<(), TunnelError> {
        let label = self.inner.label.clone();
        let mut state = self.state();
        if state.destroyed {
            return Err(TunnelError::Destroyed(label));
        }
        if !state.enabled {
            return Ok(());
        }

        let result = self.inner.engine.disable_tunnel(self.inner.source.id());
        if let Some(pool) = &state.pool {
            let handle = self.inner.watchdog.register(&label, "drain", pool.name());
            let _guard = OperationGuard::new(&handle);
            if let Err(PoolError::Busy { in_flight, .. }) = pool.drain(self.inner.drain_timeout) {
                warn!(
                    "[{}] {} tunnel buffers still in flight after {:?}",
                    label, in_flight, self.inner.drain_timeout
                );
            }
        }
        state.enabled = false;
        self.inner.source.set_tunnel_enabled(false);
        self.inner.sink.set_tunnel_enabled(false);
        info!("[{}] Tunnel disabled", label);

        result.map_err(|source| TunnelError::Native {
            connection: label,
            source,
        })
    }

    /// Remove the tunnel: frees the shared pool and clears both ports' back-references.
    ///
    /// The connection must be disabled first.
    pub fn destroy(&self) -> Result<(), TunnelError> {
        {
            let state = self.state();
            if state.destroyed {
                return Ok(());
            }
            if state.enabled {
                return Err(TunnelError::StillEnabled(self.inner.label.clone()));
            }
        }
        self.release();
        info!("[{}] Destroyed", self.inner.label);
        Ok(())
    }

    pub(crate) fn same_as(&self, other: &Connection) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Tear down the native tunnel and every reference to it
    fn release(&self) {
        let pool = {
            let mut state = self.state();
            state.destroyed = true;
            state.enabled = false;
            state.pool.take()
        };
        if let Err(e) = self.inner.engine.destroy_tunnel(self.inner.source.id()) {
            warn!("[{}] Native tunnel removal failed: {}", self.inner.label, e);
        }
        if let Some(pool) = pool
            && let Err(e) = pool.destroy(self.inner.drain_timeout)
        {
            warn!("[{}] {}; closing pool anyway", self.inner.label, e);
            pool.close();
        }

        let me = Arc::as_ptr(&self.inner);
        for port in [&self.inner.source, &self.inner.sink] {
            let mut slot = lock(port.connection_slot());
            if slot.as_ref().is_some_and(|weak| weak.as_ptr() == me) {
                *slot = None;
            }
        }
        if let Some(component) = self.inner.source.component() {
            component.forget(self);
        }
    }

    fn allocate(&self, count: u32, size: u32) -> Result<Pool, TunnelError> {
        Pool::named(self.inner.label.clone(), count, size).map_err(|source| TunnelError::Allocation {
            connection: self.inner.label.clone(),
            source,
        })
    }

    fn state(&self) -> MutexGuard<'_, TunnelState> {
        lock(&self.inner.state)
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("label", &self.inner.label)
            .field("enabled", &self.is_enabled())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handlers::MemoryCapture;
    use crate::runtime::mock::ManualEngine;
    use crate::runtime::{
        BufferRequirements, Component, ComponentSpec, Context, Encoding, Format, PortCallback,
        PortEnableError, PortSpec, RuntimeConfig,
    };

    fn stages(engine: &Arc<ManualEngine>) -> (Context, Component, Component) {
        let config = RuntimeConfig::default().with_drain_timeout(Duration::from_millis(50));
        let context = Context::with_config(engine.clone(), config);
        let camera = context
            .create_component(
                ComponentSpec::new("camera").with_output(
                    PortSpec::new(3, 4096)
                        .with_format(Format::new(Encoding::I420).with_size(64, 48)),
                ),
            )
            .unwrap();
        let encoder = context
            .create_component(
                ComponentSpec::new("encoder")
                    .with_input(PortSpec::new(2, 1024))
                    .with_output(PortSpec::new(2, 1024)),
            )
            .unwrap();
        (context, camera, encoder)
    }

    #[test]
    fn test_create_commits_format_and_enables() {
        let engine = ManualEngine::new();
        let (_context, camera, encoder) = stages(&engine);
        let source = camera.output(0).unwrap();
        let sink = encoder.input(0).unwrap();

        let connection = Connection::create(source, sink).unwrap();
        assert!(connection.is_enabled());
        assert_eq!(connection.label(), "camera:out0 -> encoder:in0");
        assert_eq!(sink.format(), source.format());
        assert_eq!(source.state(), PortState::Enabled);
        assert_eq!(sink.state(), PortState::Enabled);
        assert!(source.connection().unwrap().same_as(&connection));

        let pool = engine.tunnel_pool(source.id()).unwrap();
        assert_eq!((pool.header_count(), pool.payload_size()), (3, 4096));
        assert_eq!(camera.connections().len(), 1);
    }

    #[test]
    fn test_duplicate_connection_rejected() {
        let engine = ManualEngine::new();
        let (_context, camera, encoder) = stages(&engine);
        let source = camera.output(0).unwrap();
        let sink = encoder.input(0).unwrap();

        let first = Connection::create(source, sink).unwrap();
        let err = Connection::create(source, sink).unwrap_err();
        assert!(matches!(err, ConnectError::AlreadyConnected { .. }));
        assert!(first.is_enabled());
        assert!(!first.is_destroyed());
        assert!(sink.connection().unwrap().same_as(&first));
    }

    #[test]
    fn test_direction_checked() {
        let engine = ManualEngine::new();
        let (_context, camera, encoder) = stages(&engine);
        let err = Connection::create(encoder.input(0).unwrap(), camera.output(0).unwrap()).unwrap_err();
        assert!(matches!(err, ConnectError::Direction { .. }));
    }

    #[test]
    fn test_incompatible_formats_rejected() {
        let engine = ManualEngine::new();
        let (_context, camera, encoder) = stages(&engine);
        let sink = encoder.input(0).unwrap();
        sink.set_format(Format::new(Encoding::H264));

        let err = Connection::create(camera.output(0).unwrap(), sink).unwrap_err();
        assert!(matches!(err, ConnectError::FormatMismatch { .. }));
        assert!(sink.connection().is_none());
    }

    #[test]
    fn test_engine_rejecting_format_restores_sink() {
        let engine = ManualEngine::new();
        let (_context, camera, encoder) = stages(&engine);
        let sink = encoder.input(0).unwrap();
        engine.reject_formats(true);

        let err = Connection::create(camera.output(0).unwrap(), sink).unwrap_err();
        assert!(matches!(err, ConnectError::FormatMismatch { .. }));
        assert_eq!(sink.format(), Format::default());
    }

    #[test]
    fn test_tunnel_creation_failure_restores_sink() {
        let engine = ManualEngine::new();
        let (_context, camera, encoder) = stages(&engine);
        let source = camera.output(0).unwrap();
        let sink = encoder.input(0).unwrap();
        engine.fail_tunnels(true);

        let err = Connection::create(source, sink).unwrap_err();
        assert!(matches!(err, ConnectError::Native(_)));
        assert_eq!(sink.format(), Format::default());
        assert!(sink.connection().is_none());
        assert!(source.connection().is_none());
        assert!(camera.connections().is_empty());

        engine.fail_tunnels(false);
        let connection = Connection::create(source, sink).unwrap();
        assert!(connection.is_enabled());
        assert_eq!(sink.format(), source.format());
    }

    #[test]
    fn test_active_port_cannot_be_connected() {
        let engine = ManualEngine::new();
        let (_context, camera, encoder) = stages(&engine);
        camera.enable().unwrap();
        let source = camera.output(0).unwrap();
        source.enable(PortCallback::capture(MemoryCapture::new())).unwrap();

        let err = Connection::create(source, encoder.input(0).unwrap()).unwrap_err();
        assert!(matches!(err, ConnectError::PortActive { .. }));
    }

    #[test]
    fn test_tunnelled_port_refuses_callback() {
        let engine = ManualEngine::new();
        let (_context, camera, encoder) = stages(&engine);
        camera.enable().unwrap();
        let source = camera.output(0).unwrap();
        let connection = Connection::create(source, encoder.input(0).unwrap()).unwrap();
        connection.disable().unwrap();

        let err = source
            .enable(PortCallback::capture(MemoryCapture::new()))
            .unwrap_err();
        assert!(matches!(err, PortEnableError::Tunnelled { .. }));
    }

    #[test]
    fn test_destroy_requires_disable() {
        let engine = ManualEngine::new();
        let (_context, camera, encoder) = stages(&engine);
        let source = camera.output(0).unwrap();
        let sink = encoder.input(0).unwrap();
        let connection = Connection::create(source, sink).unwrap();

        assert!(matches!(
            connection.destroy(),
            Err(TunnelError::StillEnabled(_))
        ));

        connection.disable().unwrap();
        assert_eq!(source.state(), PortState::Disabled);
        let pool = connection.pool().unwrap();
        connection.destroy().unwrap();
        assert!(connection.is_destroyed());
        assert!(!pool.is_alive());
        assert!(source.connection().is_none());
        assert!(sink.connection().is_none());
        assert!(camera.connections().is_empty());
        assert!(matches!(connection.enable(), Err(TunnelError::Destroyed(_))));

        // the ports are free for a new tunnel
        Connection::create(source, sink).unwrap();
    }

    #[test]
    fn test_disable_waits_for_tunnel_buffers() {
        let engine = ManualEngine::new();
        let (_context, camera, encoder) = stages(&engine);
        let connection =
            Connection::create(camera.output(0).unwrap(), encoder.input(0).unwrap()).unwrap();
        let pool = connection.pool().unwrap();
        let in_transit = pool.get().unwrap();
        let releaser = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(10));
            drop(in_transit);
        });

        connection.disable().unwrap();
        releaser.join().unwrap();
        assert_eq!(pool.available(), pool.header_count());
    }

    #[test]
    fn test_sink_allocates() {
        let engine = ManualEngine::new();
        let (_context, camera, encoder) = stages(&engine);
        let sink = encoder.input(0).unwrap();
        sink.set_requirements(BufferRequirements::new(2, 1024).with_recommended(5, 2048));

        let connection = Connection::create_with_allocator(
            camera.output(0).unwrap(),
            sink,
            AllocatingSide::Sink,
        )
        .unwrap();
        let pool = connection.pool().unwrap();
        // sink's request, raised to the source's minimum size
        assert_eq!((pool.header_count(), pool.payload_size()), (5, 4096));
    }
}
