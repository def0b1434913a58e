//! Hand-driven engine for unit tests
//!
//! Submitted buffers are parked per port; a test takes them, fills them and
//! completes them, which delivers them back on a separate thread the way a
//! real engine would.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};
use std::thread;

use super::buffer::Buffer;
use super::callback::CallbackContext;
use super::errors::NativeError;
use super::format::Format;
use super::lock;
use super::native::{NativeEngine, PortId, PortKind};
use super::pool::Pool;
use super::registry::{Handle, Registry};

#[derive(Default)]
pub(crate) struct ManualEngine {
    owners: Registry<Handle>,
    owner_handles: Mutex<Vec<Arc<Handle>>>,
    registered: Mutex<HashMap<PortId, Arc<CallbackContext>>>,
    held: Mutex<HashMap<PortId, VecDeque<Buffer>>>,
    tunnels: Mutex<HashMap<PortId, (PortId, Option<Pool>)>>,
    capturing: Mutex<HashSet<PortId>>,
    fail_register: Mutex<HashSet<PortId>>,
    reject_formats: Mutex<bool>,
    fail_tunnels: Mutex<bool>,
}

impl ManualEngine {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// A port id on a fresh component
    pub(crate) fn port(&self, kind: PortKind, index: u32) -> PortId {
        let owner = self.owners.insert_with(|handle| Arc::new(handle));
        let id = *owner;
        lock(&self.owner_handles).push(owner);
        PortId::new(id, kind, index)
    }

    /// Buffers submitted for `port` and not yet completed
    pub(crate) fn held(&self, port: PortId) -> usize {
        lock(&self.held).get(&port).map_or(0, VecDeque::len)
    }

    pub(crate) fn take(&self, port: PortId) -> Option<Buffer> {
        lock(&self.held).get_mut(&port)?.pop_front()
    }

    /// Deliver `buffer` back through `context` from another thread
    pub(crate) fn complete(&self, context: &Arc<CallbackContext>, buffer: Buffer) {
        let context = Arc::clone(context);
        thread::spawn(move || context.deliver(buffer))
            .join()
            .expect("delivery thread");
    }

    /// Complete the oldest held buffer of a registered port
    pub(crate) fn complete_next(&self, port: PortId) -> bool {
        let Some(context) = self.context(port) else {
            return false;
        };
        match self.take(port) {
            Some(buffer) => {
                self.complete(&context, buffer);
                true
            }
            None => false,
        }
    }

    pub(crate) fn context(&self, port: PortId) -> Option<Arc<CallbackContext>> {
        lock(&self.registered).get(&port).cloned()
    }

    pub(crate) fn is_registered(&self, port: PortId) -> bool {
        lock(&self.registered).contains_key(&port)
    }

    pub(crate) fn is_capturing(&self, port: PortId) -> bool {
        lock(&self.capturing).contains(&port)
    }

    pub(crate) fn tunnel_pool(&self, source: PortId) -> Option<Pool> {
        lock(&self.tunnels).get(&source)?.1.clone()
    }

    pub(crate) fn fail_registration(&self, port: PortId) {
        lock(&self.fail_register).insert(port);
    }

    pub(crate) fn reject_formats(&self, reject: bool) {
        *lock(&self.reject_formats) = reject;
    }

    pub(crate) fn fail_tunnels(&self, fail: bool) {
        *lock(&self.fail_tunnels) = fail;
    }
}

impl NativeEngine for ManualEngine {
    fn commit_format(&self, port: PortId, _format: &Format) -> Result<(), NativeError> {
        if *lock(&self.reject_formats) {
            return Err(NativeError::Rejected(format!("format on {}", port)));
        }
        Ok(())
    }

    fn register_port(&self, port: PortId, context: Arc<CallbackContext>) -> Result<(), NativeError> {
        if lock(&self.fail_register).contains(&port) {
            return Err(NativeError::Rejected(format!("registration of {}", port)));
        }
        let mut registered = lock(&self.registered);
        if registered.contains_key(&port) {
            return Err(NativeError::AlreadyRegistered(port.to_string()));
        }
        registered.insert(port, context);
        Ok(())
    }

    fn unregister_port(&self, port: PortId) -> Result<(), NativeError> {
        lock(&self.registered)
            .remove(&port)
            .map(|_| ())
            .ok_or_else(|| NativeError::UnknownPort(port.to_string()))
    }

    fn flush_port(&self, port: PortId) -> Result<(), NativeError> {
        let flushed = lock(&self.held).remove(&port);
        drop(flushed);
        Ok(())
    }

    fn submit(&self, port: PortId, buffer: Buffer) -> Result<(), NativeError> {
        lock(&self.held).entry(port).or_default().push_back(buffer);
        Ok(())
    }

    fn set_capture(&self, port: PortId, enabled: bool) -> Result<(), NativeError> {
        let mut capturing = lock(&self.capturing);
        if enabled {
            capturing.insert(port);
        } else {
            capturing.remove(&port);
        }
        Ok(())
    }

    fn create_tunnel(&self, source: PortId, sink: PortId) -> Result<(), NativeError> {
        if *lock(&self.fail_tunnels) {
            return Err(NativeError::Rejected(format!("tunnel {} -> {}", source, sink)));
        }
        lock(&self.tunnels).insert(source, (sink, None));
        Ok(())
    }

    fn enable_tunnel(&self, source: PortId, pool: Pool) -> Result<(), NativeError> {
        match lock(&self.tunnels).get_mut(&source) {
            Some(tunnel) => {
                tunnel.1 = Some(pool);
                Ok(())
            }
            None => Err(NativeError::UnknownTunnel(source.to_string())),
        }
    }

    fn disable_tunnel(&self, source: PortId) -> Result<(), NativeError> {
        match lock(&self.tunnels).get_mut(&source) {
            Some(tunnel) => {
                tunnel.1 = None;
                Ok(())
            }
            None => Err(NativeError::UnknownTunnel(source.to_string())),
        }
    }

    fn destroy_tunnel(&self, source: PortId) -> Result<(), NativeError> {
        lock(&self.tunnels)
            .remove(&source)
            .map(|_| ())
            .ok_or_else(|| NativeError::UnknownTunnel(source.to_string()))
    }
}
