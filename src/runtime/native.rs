//! Boundary to the native media engine
//!
//! The engine owns the threads that complete buffers. It hands every
//! completed buffer back through [`CallbackContext::deliver`], which is the
//! only way data re-enters application code.

use std::fmt;
use std::sync::Arc;

use super::buffer::Buffer;
use super::callback::CallbackContext;
use super::errors::NativeError;
use super::format::Format;
use super::pool::Pool;
use super::registry::Handle;

/// Identity of a component inside its [`Context`](super::Context)
pub type ComponentId = Handle;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum PortKind {
    Control,
    Input,
    Output,
}

impl PortKind {
    pub(crate) fn prefix(self) -> &'static str {
        match self {
            PortKind::Control => "ctl",
            PortKind::Input => "in",
            PortKind::Output => "out",
        }
    }
}

/// Address of a port as seen by the engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PortId {
    pub component: ComponentId,
    pub kind: PortKind,
    pub index: u32,
}

impl PortId {
    pub fn new(component: ComponentId, kind: PortKind, index: u32) -> Self {
        Self {
            component,
            kind,
            index,
        }
    }
}

impl fmt::Display for PortId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}:{}{}", self.component, self.kind.prefix(), self.index)
    }
}

/// Operations the runtime needs from a media engine.
///
/// Callbacks for a registered port must be delivered from engine-owned
/// threads, one at a time per port, and never re-entrantly from inside
/// [`submit`](NativeEngine::submit): the port holds its dispatch lock while
/// it submits replacement buffers.
pub trait NativeEngine: Send + Sync {
    fn create_component(&self, _id: ComponentId, _name: &str) -> Result<(), NativeError> {
        Ok(())
    }

    fn destroy_component(&self, _id: ComponentId) -> Result<(), NativeError> {
        Ok(())
    }

    fn enable_component(&self, _id: ComponentId) -> Result<(), NativeError> {
        Ok(())
    }

    fn disable_component(&self, _id: ComponentId) -> Result<(), NativeError> {
        Ok(())
    }

    /// Apply a port's format before it is enabled or tunnelled
    fn commit_format(&self, _port: PortId, _format: &Format) -> Result<(), NativeError> {
        Ok(())
    }

    /// Start delivering completed buffers of `port` to `context`
    fn register_port(&self, port: PortId, context: Arc<CallbackContext>) -> Result<(), NativeError>;

    fn unregister_port(&self, port: PortId) -> Result<(), NativeError>;

    /// Hand back (drop) every buffer the engine still holds for `port`
    fn flush_port(&self, port: PortId) -> Result<(), NativeError>;

    /// Pass a buffer to the engine: empty for output ports, filled for input ports.
    ///
    /// On error the buffer is dropped, which returns it to its pool.
    fn submit(&self, port: PortId, buffer: Buffer) -> Result<(), NativeError>;

    /// Turn capture on or off for an output port
    fn set_capture(&self, port: PortId, enabled: bool) -> Result<(), NativeError>;

    fn create_tunnel(&self, source: PortId, sink: PortId) -> Result<(), NativeError>;

    /// Start moving data from `source` to its sink using buffers from `pool`
    fn enable_tunnel(&self, source: PortId, pool: Pool) -> Result<(), NativeError>;

    /// Stop the tunnel and return every buffer in transit to its pool
    fn disable_tunnel(&self, source: PortId) -> Result<(), NativeError>;

    fn destroy_tunnel(&self, source: PortId) -> Result<(), NativeError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::Registry;

    #[test]
    fn test_port_id_display() {
        let registry = Registry::new();
        let owner = registry.insert_with(|handle| Arc::new(handle));
        let port = PortId::new(*owner, PortKind::Output, 1);
        assert_eq!(port.to_string(), "#0.0:out1");
        assert!(PortId::new(*owner, PortKind::Input, 0) < port);
    }
}
