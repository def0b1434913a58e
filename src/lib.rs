//! Buffer-pool pipeline runtime for hardware media engines
//!
//! Components expose ports that exchange fixed-size buffers with a native
//! engine. Buffers come from per-port pools and return to them automatically
//! when dropped; ports may be wired into engine-side tunnels, or left open
//! and attached to application handlers.
//!
//! # Architecture
//!
//! - **Pool / Buffer / Queue**: fixed sets of payload buffers with RAII recycling
//! - **Port**: enable/disable state machine driving the native callback contract
//! - **Connection**: a tunnel between an output and an input sharing one pool
//! - **Component**: a native processing unit owning its ports and tunnels
//! - **Orchestrator**: discovers a chain, runs it to completion and tears it down
//! - **LoopbackEngine**: an in-process engine for demos and tests
//!
//! # Example
//!
//! ```no_run
//! use hwpipe::handlers::MemoryCapture;
//! use hwpipe::runtime::{
//!     CancellationToken, ComponentSpec, Context, Frame, LoopbackEngine, Orchestrator, PortSpec,
//!     ScriptedSource,
//! };
//!
//! let engine = LoopbackEngine::new();
//! let context = Context::new(engine.clone());
//! let camera = context.create_component(
//!     ComponentSpec::new("camera")
//!         .with_output(PortSpec::new(3, 4096))
//!         .capture_port(0),
//! )?;
//! let still = camera.output(0).expect("camera has an output");
//! engine.install_source(still.id(), ScriptedSource::new([Frame::new(vec![0u8; 10_000])]));
//!
//! let mut orchestrator = Orchestrator::new(&context);
//! orchestrator.attach_capture(still, MemoryCapture::new())?;
//! orchestrator.run(&camera, CancellationToken::new())?;
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

pub mod handlers;
pub mod params;
pub mod runtime;

pub use handlers::{CaptureHandler, FeedChunk, FeedHandler, HandlerError, MemoryCapture, MemoryFeed};
pub use params::{ParamError, ParamId, ParamValue, ParameterStore};

pub use runtime::{
    Buffer, BufferFlags, CancellationToken, Completion, CompletionPolicy, Component, ComponentSpec,
    Connection, Context, NativeEngine, Orchestrator, PipelineError, Pool, Port, PortSpec,
    RuntimeConfig,
};
