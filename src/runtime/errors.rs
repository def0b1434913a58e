//! Error types for the runtime system

use super::port::PortState;

/// Error type for pool creation and resizing
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AllocationError {
    #[error("Pool must hold at least one buffer")]
    EmptyPool,

    #[error("Buffer payload size must be non-zero")]
    ZeroSize,

    #[error("Pool of {count} x {size} bytes does not fit in memory")]
    Overflow { count: u32, size: u32 },

    #[error("Allocator could not provide {size} bytes for buffer {index}")]
    OutOfMemory { index: u32, size: u32 },
}

/// Error type for operations on an existing pool
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PoolError {
    #[error(transparent)]
    Allocation(#[from] AllocationError),

    #[error("Pool '{pool}' is busy: {in_flight} of {header_count} buffers in flight")]
    Busy {
        pool: String,
        in_flight: usize,
        header_count: usize,
    },

    #[error("Pool '{0}' has been destroyed")]
    Destroyed(String),
}

/// Error type for buffer metadata updates
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BufferError {
    #[error("Range {offset}+{length} exceeds allocated size {allocated}")]
    OutOfRange {
        offset: u32,
        length: u32,
        allocated: u32,
    },
}

/// Error reported by the native engine
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum NativeError {
    #[error("Port {0} is not known to the engine")]
    UnknownPort(String),

    #[error("Port {0} is already registered")]
    AlreadyRegistered(String),

    #[error("No tunnel from {0}")]
    UnknownTunnel(String),

    #[error("Engine rejected the request: {0}")]
    Rejected(String),

    #[error("Engine has shut down")]
    ShutDown,
}

/// Error type for `Port::enable`
#[derive(Debug, thiserror::Error)]
pub enum PortEnableError {
    #[error("Port '{port}' cannot be enabled from state {state:?}")]
    InvalidState { port: String, state: PortState },

    #[error("Port '{port}' belongs to disabled component '{component}'")]
    ComponentDisabled { port: String, component: String },

    #[error("Port '{port}' is tunnelled and cannot take a callback")]
    Tunnelled { port: String },

    #[error("Callback kind does not match port '{port}'")]
    CallbackMismatch { port: String },

    #[error("Pool allocation for port '{port}' failed: {source}")]
    Allocation {
        port: String,
        #[source]
        source: AllocationError,
    },

    #[error("Native registration of port '{port}' failed: {source}")]
    Native {
        port: String,
        #[source]
        source: NativeError,
    },
}

/// Error type for `Port::disable` and `Port::destroy_pool`
#[derive(Debug, thiserror::Error)]
pub enum PortDisableError {
    #[error("Port '{port}' cannot be disabled from state {state:?}")]
    InvalidState { port: String, state: PortState },

    #[error("Port '{port}' is tunnelled; disable its connection instead")]
    Tunnelled { port: String },

    #[error("Port '{port}' still has {outstanding} buffers outstanding")]
    Outstanding { port: String, outstanding: usize },

    #[error("Native deregistration of port '{port}' failed: {source}")]
    Native {
        port: String,
        #[source]
        source: NativeError,
    },
}

/// Error type for `Connection::create`
#[derive(Debug, thiserror::Error)]
pub enum ConnectError {
    #[error("Port '{port}' is already connected")]
    AlreadyConnected { port: String },

    #[error("Cannot connect '{source_port}' -> '{sink_port}': source must be an output and sink an input")]
    Direction {
        source_port: String,
        sink_port: String,
    },

    #[error("Port '{port}' is enabled; disable it before connecting")]
    PortActive { port: String },

    #[error("Format of '{source_port}' rejected by '{sink_port}': {reason}")]
    FormatMismatch {
        source_port: String,
        sink_port: String,
        reason: String,
    },

    #[error("Native tunnel creation failed: {0}")]
    Native(#[source] NativeError),

    #[error("Connection created but could not be enabled: {0}")]
    Enable(#[source] TunnelError),
}

/// Error type for connection lifecycle operations
#[derive(Debug, thiserror::Error)]
pub enum TunnelError {
    #[error("Connection '{0}' has been destroyed")]
    Destroyed(String),

    #[error("Connection '{0}' must be disabled before it is destroyed")]
    StillEnabled(String),

    #[error("Pool allocation for connection '{connection}' failed: {source}")]
    Allocation {
        connection: String,
        #[source]
        source: AllocationError,
    },

    #[error("Native tunnel operation on '{connection}' failed: {source}")]
    Native {
        connection: String,
        #[source]
        source: NativeError,
    },
}

/// Error type for component lifecycle operations
#[derive(Debug, thiserror::Error)]
pub enum ComponentError {
    #[error("Component '{0}' has been destroyed")]
    Destroyed(String),

    #[error("Component '{component}' has no parameter store")]
    NoParameters { component: String },

    #[error("Native operation on component '{component}' failed: {source}")]
    Native {
        component: String,
        #[source]
        source: NativeError,
    },

    #[error("Parameter error on component '{component}': {source}")]
    Parameter {
        component: String,
        #[source]
        source: crate::params::ParamError,
    },

    #[error(transparent)]
    Disable(#[from] PortDisableError),

    #[error(transparent)]
    Tunnel(#[from] TunnelError),
}

/// Error type for orchestrated pipeline runs
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("No root components given")]
    NoRoots,

    #[error("Nothing to await: no handler is attached to any port reachable from {roots:?}")]
    NothingToAwait { roots: Vec<String> },

    #[error("Handler cannot be attached to port '{port}'")]
    HandlerMismatch { port: String },

    #[error("Capture could not be started on component '{component}': {source}")]
    Capture {
        component: String,
        #[source]
        source: NativeError,
    },

    #[error("Timed out waiting for ports {pending:?}")]
    Timeout { pending: Vec<String> },

    #[error("{} port(s) completed with errors: {failures:?}", failures.len())]
    StreamFailed { failures: Vec<(String, String)> },

    #[error(transparent)]
    Component(#[from] ComponentError),

    #[error(transparent)]
    Enable(#[from] PortEnableError),

    #[error(transparent)]
    Disable(#[from] PortDisableError),

    #[error(transparent)]
    Connect(#[from] ConnectError),

    #[error(transparent)]
    Tunnel(#[from] TunnelError),
}
