//! Capture handlers

use super::HandlerError;

/// Consumer of payload delivered on an output port
pub trait CaptureHandler: Send {
    /// Called once per buffer carrying payload. `is_eof` is set when the
    /// buffer ends a frame or the stream.
    fn handle(&mut self, payload: &[u8], is_eof: bool) -> Result<(), HandlerError>;

    /// Called once after the port's trigger has fired
    fn post_process(&mut self) -> Result<(), HandlerError> {
        Ok(())
    }
}

/// Assembles delivered payload into whole frames in memory
#[derive(Debug, Default)]
pub struct MemoryCapture {
    frames: Vec<Vec<u8>>,
    current: Vec<u8>,
    calls: usize,
    limit: Option<usize>,
    post_processed: bool,
}

impl MemoryCapture {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reject payload once more than `limit` bytes are pending in one frame
    pub fn with_limit(limit: usize) -> Self {
        Self {
            limit: Some(limit),
            ..Self::default()
        }
    }

    /// Completed frames, in delivery order
    pub fn frames(&self) -> &[Vec<u8>] {
        &self.frames
    }

    /// Bytes received after the last frame boundary
    pub fn partial(&self) -> &[u8] {
        &self.current
    }

    /// Number of `handle` invocations
    pub fn calls(&self) -> usize {
        self.calls
    }

    pub fn total_bytes(&self) -> usize {
        self.frames.iter().map(Vec::len).sum::<usize>() + self.current.len()
    }

    pub fn is_post_processed(&self) -> bool {
        self.post_processed
    }

    pub fn take_frames(&mut self) -> Vec<Vec<u8>> {
        std::mem::take(&mut self.frames)
    }
}

impl CaptureHandler for MemoryCapture {
    fn handle(&mut self, payload: &[u8], is_eof: bool) -> Result<(), HandlerError> {
        self.calls += 1;
        if let Some(limit) = self.limit
            && self.current.len() + payload.len() > limit
        {
            return Err(HandlerError::Rejected(format!(
                "frame exceeds {} bytes",
                limit
            )));
        }
        self.current.extend_from_slice(payload);
        if is_eof {
            self.frames.push(std::mem::take(&mut self.current));
        }
        Ok(())
    }

    fn post_process(&mut self) -> Result<(), HandlerError> {
        if !self.current.is_empty() {
            self.frames.push(std::mem::take(&mut self.current));
        }
        self.post_processed = true;
        Ok(())
    }
}

/// Adapts a closure into a [`CaptureHandler`]
pub struct FnCapture<F> {
    handle: F,
}

impl<F> FnCapture<F>
where
    F: FnMut(&[u8], bool) -> Result<(), HandlerError> + Send,
{
    pub fn new(handle: F) -> Self {
        Self { handle }
    }
}

impl<F> CaptureHandler for FnCapture<F>
where
    F: FnMut(&[u8], bool) -> Result<(), HandlerError> + Send,
{
    fn handle(&mut self, payload: &[u8], is_eof: bool) -> Result<(), HandlerError> {
        (self.handle)(payload, is_eof)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_capture_assembles_frames() {
        let mut capture = MemoryCapture::new();
        capture.handle(b"ab", false).unwrap();
        capture.handle(b"cd", true).unwrap();
        capture.handle(b"ef", false).unwrap();
        assert_eq!(capture.frames(), &[b"abcd".to_vec()]);
        assert_eq!(capture.partial(), b"ef");
        assert_eq!(capture.calls(), 3);

        capture.post_process().unwrap();
        assert_eq!(capture.frames().len(), 2);
        assert!(capture.is_post_processed());
        assert_eq!(capture.total_bytes(), 6);
    }

    #[test]
    fn test_memory_capture_limit() {
        let mut capture = MemoryCapture::with_limit(3);
        capture.handle(b"ab", false).unwrap();
        assert!(matches!(
            capture.handle(b"cd", true),
            Err(HandlerError::Rejected(_))
        ));
    }

    #[test]
    fn test_fn_capture() {
        let mut seen = Vec::new();
        {
            let mut capture = FnCapture::new(|payload: &[u8], eof| {
                seen.push((payload.len(), eof));
                Ok(())
            });
            capture.handle(&[0; 5], false).unwrap();
            capture.handle(&[0; 7], true).unwrap();
        }
        assert_eq!(seen, vec![(5, false), (7, true)]);
    }
}
