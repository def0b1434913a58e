//! Ports: data endpoints of a component
//!
//! A port runs the `Disabled -> Enabling -> Enabled -> Disabling -> Disabled`
//! state machine. Enabling creates (or reuses) the port's pool, registers a
//! [`CallbackContext`] with the engine and primes the engine with buffers;
//! disabling takes every buffer back before the callback is unregistered.

use std::sync::atomic::AtomicBool;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use tracing::{debug, info, warn};

use super::callback::{CallbackContext, PortCallback};
use super::component::{Component, ComponentInner};
use super::connection::{Connection, ConnectionInner};
use super::errors::{NativeError, PoolError, PortDisableError, PortEnableError};
use super::format::{BufferRequirements, Format};
use super::lock;
use super::native::{NativeEngine, PortId, PortKind};
use super::pool::Pool;
use super::trigger::{Completion, Trigger};
use super::watchdog::{OperationGuard, Watchdog};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortState {
    Disabled,
    Enabling,
    Enabled,
    Disabling,
}

/// Everything a port borrows from its component and context
#[derive(Clone)]
pub(crate) struct PortEnv {
    pub(crate) engine: Arc<dyn NativeEngine>,
    pub(crate) drain_timeout: Duration,
    pub(crate) watchdog: Watchdog,
    pub(crate) force_stop: Arc<AtomicBool>,
}

struct PortSlot {
    state: PortState,
    format: Format,
    requirements: BufferRequirements,
    pool: Option<Pool>,
    context: Option<Arc<CallbackContext>>,
    trigger: Option<Trigger>,
}

pub(crate) struct PortInner {
    id: PortId,
    label: String,
    component: Weak<ComponentInner>,
    env: PortEnv,
    slot: Mutex<PortSlot>,
    connection: Mutex<Option<Weak<ConnectionInner>>>,
}

/// Handle to a port (cheap to clone)
#[derive(Clone)]
pub struct Port {
    inner: Arc<PortInner>,
}

impl Port {
    pub(crate) fn new(
        id: PortId,
        label: String,
        component: Weak<ComponentInner>,
        env: PortEnv,
        format: Format,
        requirements: BufferRequirements,
    ) -> Self {
        Self {
            inner: Arc::new(PortInner {
                id,
                label,
                component,
                env,
                slot: Mutex::new(PortSlot {
                    state: PortState::Disabled,
                    format,
                    requirements,
                    pool: None,
                    context: None,
                    trigger: None,
                }),
                connection: Mutex::new(None),
            }),
        }
    }

    pub fn id(&self) -> PortId {
        self.inner.id
    }

    pub fn kind(&self) -> PortKind {
        self.inner.id.kind
    }

    pub fn index(&self) -> u32 {
        self.inner.id.index
    }

    /// `component:kindN`, used in logs and errors
    pub fn label(&self) -> &str {
        &self.inner.label
    }

    pub fn state(&self) -> PortState {
        self.slot().state
    }

    pub fn is_enabled(&self) -> bool {
        self.state() == PortState::Enabled
    }

    pub fn component(&self) -> Option<Component> {
        self.inner.component.upgrade().map(Component::from_inner)
    }

    pub fn format(&self) -> Format {
        self.slot().format.clone()
    }

    /// Replace the port's format; takes effect on the next [`commit_format`](Port::commit_format)
    pub fn set_format(&self, format: Format) {
        self.slot().format = format;
    }

    /// Pass the current format to the engine
    pub fn commit_format(&self) -> Result<(), NativeError> {
        let format = self.format();
        self.inner.env.engine.commit_format(self.inner.id, &format)
    }

    pub fn requirements(&self) -> BufferRequirements {
        self.slot().requirements
    }

    pub fn set_requirements(&self, requirements: BufferRequirements) {
        self.slot().requirements = requirements;
    }

    /// Request `count` buffers of `size` bytes for the next enable
    pub fn set_buffers(&self, count: u32, size: u32) {
        let mut slot = self.slot();
        slot.requirements = slot.requirements.with_current(count, size);
    }

    /// The port's own pool; tunnelled ports use their connection's pool instead
    pub fn pool(&self) -> Option<Pool> {
        self.slot().pool.clone()
    }

    /// Completion signal of the current (or last) activation
    pub fn trigger(&self) -> Option<Trigger> {
        self.slot().trigger.clone()
    }

    pub fn connection(&self) -> Option<Connection> {
        lock(&self.inner.connection)
            .as_ref()
            .and_then(Weak::upgrade)
            .map(Connection::from_inner)
    }

    pub fn is_tunnelled(&self) -> bool {
        self.connection().is_some()
    }

    /// Start the port with `callback` as its delivery path.
    ///
    /// Output ports are primed with every free buffer; input ports are primed
    /// with buffers filled by the feed handler. On failure the pool is torn
    /// down and the port stays disabled.
    pub fn enable(&self, callback: PortCallback) -> Result<(), PortEnableError> {
        let label = self.inner.label.clone();
        if self.is_tunnelled() {
            return Err(PortEnableError::Tunnelled { port: label });
        }
        let (requirements, existing) = {
            let mut slot = self.slot();
            if slot.state != PortState::Disabled {
                return Err(PortEnableError::InvalidState {
                    port: label,
                    state: slot.state,
                });
            }
            if !callback.accepts(self.kind()) {
                return Err(PortEnableError::CallbackMismatch { port: label });
            }
            match self.inner.component.upgrade() {
                Some(component) if component.is_enabled() => {}
                Some(component) => {
                    return Err(PortEnableError::ComponentDisabled {
                        port: label,
                        component: component.name().to_string(),
                    });
                }
                // the component was dropped; its name is the label's prefix
                None => {
                    let component = label.rsplit_once(':').map_or(label.as_str(), |(name, _)| name);
                    return Err(PortEnableError::ComponentDisabled {
                        component: component.to_string(),
                        port: label,
                    });
                }
            }
            slot.state = PortState::Enabling;
            (slot.requirements, slot.pool.take())
        };

        let pool = match self.prepare_pool(requirements, existing) {
            Ok(pool) => pool,
            Err(source) => {
                self.slot().state = PortState::Disabled;
                return Err(PortEnableError::Allocation { port: label, source });
            }
        };

        let engine = Arc::downgrade(&self.inner.env.engine);
        let context = Arc::new(CallbackContext::new(
            self.inner.id,
            label.clone(),
            pool.clone(),
            callback,
            Arc::clone(&self.inner.env.force_stop),
            engine,
        ));
        if let Err(source) = self
            .inner
            .env
            .engine
            .register_port(self.inner.id, Arc::clone(&context))
        {
            pool.close();
            self.slot().state = PortState::Disabled;
            warn!("[{}] Native registration failed: {}", label, source);
            return Err(PortEnableError::Native { port: label, source });
        }

        context.prime();

        let mut slot = self.slot();
        slot.trigger = Some(context.trigger().clone());
        slot.context = Some(context);
        slot.pool = Some(pool);
        slot.state = PortState::Enabled;
        info!("[{}] Enabled", label);
        Ok(())
    }

    /// Stop the port, taking back every buffer before unregistering the callback.
    ///
    /// Waits at most the configured drain timeout; buffers still out after
    /// that are reported and left to be freed when they come back. An unfired
    /// trigger fires with [`Completion::Cancelled`].
    pub fn disable(&self) -> Result<(), PortDisableError> {
        let label = self.inner.label.clone();
        let (context, pool) = {
            let mut slot = self.slot();
            if slot.state != PortState::Enabled {
                return Err(PortDisableError::InvalidState {
                    port: label,
                    state: slot.state,
                });
            }
            let Some(context) = slot.context.take() else {
                return Err(PortDisableError::Tunnelled { port: label });
            };
            slot.state = PortState::Disabling;
            (context, slot.pool.clone())
        };

        context.shutdown();
        let engine = &self.inner.env.engine;
        if let Err(e) = engine.flush_port(self.inner.id) {
            warn!("[{}] Flush failed: {}", label, e);
        }

        if let Some(pool) = &pool {
            let handle = self.inner.env.watchdog.register(&label, "drain", pool.name());
            let _guard = OperationGuard::new(&handle);
            if let Err(PoolError::Busy { in_flight, .. }) = pool.drain(self.inner.env.drain_timeout) {
                warn!(
                    "[{}] {} buffers still in flight after {:?}; continuing teardown",
                    label, in_flight, self.inner.env.drain_timeout
                );
            }
        }

        let unregistered = engine.unregister_port(self.inner.id);
        context.trigger().fire(Completion::Cancelled);
        self.slot().state = PortState::Disabled;

        match unregistered {
            Ok(()) => {
                info!(
                    "[{}] Disabled after {} deliveries",
                    label,
                    context.delivered()
                );
                Ok(())
            }
            Err(source) => Err(PortDisableError::Native { port: label, source }),
        }
    }

    /// Free the port's pool. Only valid while disabled; fails if buffers are still out.
    pub fn destroy_pool(&self) -> Result<(), PortDisableError> {
        let label = self.inner.label.clone();
        let pool = {
            let mut slot = self.slot();
            if slot.state != PortState::Disabled {
                return Err(PortDisableError::InvalidState {
                    port: label,
                    state: slot.state,
                });
            }
            match slot.pool.take() {
                Some(pool) => pool,
                None => return Ok(()),
            }
        };

        match pool.destroy(self.inner.env.drain_timeout) {
            Ok(()) => {
                debug!("[{}] Pool destroyed", label);
                Ok(())
            }
            Err(PoolError::Busy { in_flight, .. }) => {
                self.slot().pool = Some(pool);
                Err(PortDisableError::Outstanding {
                    port: label,
                    outstanding: in_flight,
                })
            }
            Err(e) => {
                debug!("[{}] Pool already gone: {}", label, e);
                Ok(())
            }
        }
    }

    /// Best-effort teardown: close the pool now, leaving stragglers to be freed on release
    pub(crate) fn abandon_pool(&self) {
        if let Some(pool) = self.slot().pool.take() {
            warn!(
                "[{}] Abandoning pool with {} buffers in flight",
                self.inner.label,
                pool.in_flight()
            );
            pool.close();
        }
    }

    fn prepare_pool(
        &self,
        requirements: BufferRequirements,
        existing: Option<Pool>,
    ) -> Result<Pool, super::errors::AllocationError> {
        let (count, size) = requirements.negotiated();
        if let Some(pool) = existing {
            if pool.header_count() == count as usize && pool.payload_size() == size {
                return Ok(pool);
            }
            match pool.resize(count, size) {
                Ok(()) => return Ok(pool),
                Err(PoolError::Allocation(e)) => return Err(e),
                Err(e) => {
                    debug!("[{}] Replacing pool: {}", self.inner.label, e);
                    pool.close();
                }
            }
        }
        Pool::named(self.inner.label.clone(), count, size)
    }

    fn slot(&self) -> MutexGuard<'_, PortSlot> {
        lock(&self.inner.slot)
    }

    pub(crate) fn env(&self) -> &PortEnv {
        &self.inner.env
    }

    pub(crate) fn connection_slot(&self) -> &Mutex<Option<Weak<ConnectionInner>>> {
        &self.inner.connection
    }

    /// Reflect the state of the tunnel this port belongs to
    pub(crate) fn set_tunnel_enabled(&self, enabled: bool) {
        self.slot().state = if enabled {
            PortState::Enabled
        } else {
            PortState::Disabled
        };
    }

    pub(crate) fn same_as(&self, other: &Port) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl std::fmt::Debug for Port {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("Port")
            .field("label", &self.inner.label)
            .field("state", &self.state())
            .finish()
    }
}
