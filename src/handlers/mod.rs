//! Application-side collaborators attached to unconnected ports
//!
//! Capture handlers consume payload delivered on output ports; feed handlers
//! produce payload for input ports.

pub mod capture;
pub mod feed;

pub use capture::{CaptureHandler, FnCapture, MemoryCapture};
pub use feed::{ChunkFeed, FeedChunk, FeedHandler, MemoryFeed};

/// Error raised by a capture or feed handler
#[derive(Debug, thiserror::Error)]
pub enum HandlerError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Handler rejected payload: {0}")]
    Rejected(String),
}
