//! Runtime support for buffer-pool pipelines

use std::sync::{Mutex, MutexGuard, PoisonError};

pub mod buffer;
pub mod callback;
pub mod component;
pub mod config;
pub mod connection;
pub mod context;
pub mod errors;
pub mod format;
pub mod graph;
pub mod loopback;
pub mod native;
pub mod pipeline;
pub mod pool;
pub mod port;
pub mod queue;
pub mod registry;
pub mod trigger;
pub mod watchdog;

#[cfg(test)]
pub(crate) mod mock;

pub use buffer::{Buffer, BufferFlags};
pub use callback::{CallbackContext, CompletionPolicy, PortCallback, SharedCapture, SharedFeed};
pub use component::{Component, ComponentSpec, PortSpec};
pub use config::RuntimeConfig;
pub use connection::{AllocatingSide, Connection};
pub use context::Context;
pub use errors::{
    AllocationError, BufferError, ComponentError, ConnectError, NativeError, PipelineError,
    PoolError, PortDisableError, PortEnableError, TunnelError,
};
pub use format::{BufferRequirements, Encoding, Format, Rational, Rect};
pub use graph::PipelineGraph;
pub use loopback::{Consumed, Frame, FrameSource, LoopbackEngine, PatternSource, ScriptedSource};
pub use native::{ComponentId, NativeEngine, PortId, PortKind};
pub use pipeline::Orchestrator;
pub use pool::{Pool, PoolStats};
pub use port::{Port, PortState};
pub use queue::Queue;
pub use registry::{Handle, Registry};
pub use trigger::{CancellationToken, Completion, Trigger};
pub use watchdog::Watchdog;

/// Lock a mutex, recovering the guard if a callback panicked while holding it
pub(crate) fn lock<T: ?Sized>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
