//! Per-activation callback context handed to the native engine
//!
//! A [`CallbackContext`] lives exactly as long as one enable/disable cycle of
//! a port. The engine holds it while the port is registered and calls
//! [`CallbackContext::deliver`] from its own threads; nothing raised inside a
//! delivery escapes to the engine.

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};

use tracing::{debug, error, trace, warn};

use super::buffer::{Buffer, BufferFlags};
use super::lock;
use super::native::{NativeEngine, PortId, PortKind};
use super::pool::Pool;
use super::trigger::{Completion, Trigger};
use crate::handlers::{CaptureHandler, FeedChunk, FeedHandler, HandlerError};

pub type SharedCapture = Arc<Mutex<dyn CaptureHandler>>;
pub type SharedFeed = Arc<Mutex<dyn FeedHandler>>;

/// Flags that end a frame or the stream
const BOUNDARY: BufferFlags = BufferFlags::from_bits(
    BufferFlags::END_OF_STREAM.bits()
        | BufferFlags::FRAME_END.bits()
        | BufferFlags::TRANSMISSION_FAILED.bits(),
);

/// When an output port's trigger fires
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CompletionPolicy {
    /// First buffer flagged EndOfStream, FrameEnd or TransmissionFailed
    #[default]
    FirstTerminal,
    /// EndOfStream or TransmissionFailed only; frame ends are not terminal
    EndOfStream,
    /// After `n` frame ends, or earlier on EndOfStream or TransmissionFailed
    Frames(u32),
}

/// What a port does with delivered buffers
#[derive(Clone)]
pub enum PortCallback {
    /// Output port: hand payload to a capture handler
    Capture {
        handler: SharedCapture,
        policy: CompletionPolicy,
    },
    /// Input port: refill returned buffers from a feed handler
    Feed { handler: SharedFeed },
}

impl PortCallback {
    pub fn capture(handler: impl CaptureHandler + 'static) -> Self {
        Self::capture_with_policy(handler, CompletionPolicy::default())
    }

    pub fn capture_with_policy(
        handler: impl CaptureHandler + 'static,
        policy: CompletionPolicy,
    ) -> Self {
        Self::Capture {
            handler: Arc::new(Mutex::new(handler)),
            policy,
        }
    }

    pub fn shared_capture(handler: SharedCapture, policy: CompletionPolicy) -> Self {
        Self::Capture { handler, policy }
    }

    pub fn feed(handler: impl FeedHandler + 'static) -> Self {
        Self::Feed {
            handler: Arc::new(Mutex::new(handler)),
        }
    }

    pub fn shared_feed(handler: SharedFeed) -> Self {
        Self::Feed { handler }
    }

    /// Whether this callback can serve a port of `kind`
    pub fn accepts(&self, kind: PortKind) -> bool {
        match self {
            PortCallback::Capture { .. } => matches!(kind, PortKind::Output | PortKind::Control),
            PortCallback::Feed { .. } => kind == PortKind::Input,
        }
    }
}

#[derive(Default)]
struct Dispatch {
    frames: u32,
    feed_done: bool,
    delivered: u64,
    submitted: u64,
}

/// State shared between a port and the engine for one activation
pub struct CallbackContext {
    port: PortId,
    label: String,
    pool: Pool,
    callback: PortCallback,
    trigger: Trigger,
    enabled: AtomicBool,
    force_stop: Arc<AtomicBool>,
    engine: Weak<dyn NativeEngine>,
    dispatch: Mutex<Dispatch>,
}

impl CallbackContext {
    pub(crate) fn new(
        port: PortId,
        label: String,
        pool: Pool,
        callback: PortCallback,
        force_stop: Arc<AtomicBool>,
        engine: Weak<dyn NativeEngine>,
    ) -> Self {
        let trigger = Trigger::new(label.clone());
        Self {
            port,
            label,
            pool,
            callback,
            trigger,
            enabled: AtomicBool::new(false),
            force_stop,
            engine,
            dispatch: Mutex::new(Dispatch::default()),
        }
    }

    pub fn port(&self) -> PortId {
        self.port
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn pool(&self) -> &Pool {
        &self.pool
    }

    pub fn trigger(&self) -> &Trigger {
        &self.trigger
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    /// Buffers handed back by the engine so far
    pub fn delivered(&self) -> u64 {
        lock(&self.dispatch).delivered
    }

    /// Buffers passed to the engine so far
    pub fn submitted(&self) -> u64 {
        lock(&self.dispatch).submitted
    }

    /// Handle one buffer returned by the engine.
    ///
    /// Panics and handler errors are contained here and turn into a
    /// [`Completion::Failed`] trigger.
    pub fn deliver(&self, buffer: Buffer) {
        let result = panic::catch_unwind(AssertUnwindSafe(|| match &self.callback {
            PortCallback::Capture { handler, policy } => self.deliver_output(buffer, handler, *policy),
            PortCallback::Feed { handler } => self.deliver_input(buffer, handler),
        }));
        if let Err(panic) = result {
            let reason = panic_message(panic.as_ref());
            error!("[{}] Callback panicked: {}", self.label, reason);
            self.trigger.fire(Completion::Failed(format!("callback panicked: {}", reason)));
        }
    }

    /// Mark enabled and pass the pool's buffers to the engine
    pub(crate) fn prime(&self) {
        let mut dispatch = lock(&self.dispatch);
        self.enabled.store(true, Ordering::Release);
        let headers = self.pool.header_count();
        let mut primed = 0;
        match &self.callback {
            PortCallback::Capture { .. } => {
                for _ in 0..headers {
                    let Some(buffer) = self.pool.get() else {
                        break;
                    };
                    if !self.submit(&mut dispatch, buffer) {
                        break;
                    }
                    primed += 1;
                }
            }
            PortCallback::Feed { handler } => {
                for _ in 0..headers {
                    if dispatch.feed_done {
                        break;
                    }
                    let Some(buffer) = self.pool.get() else {
                        break;
                    };
                    self.feed_one(&mut dispatch, handler, buffer);
                    primed += 1;
                }
            }
        }
        debug!("[{}] Primed {} of {} buffers", self.label, primed, headers);
    }

    /// Stop replenishing; callbacks already running finish first
    pub(crate) fn shutdown(&self) {
        let _dispatch = lock(&self.dispatch);
        self.enabled.store(false, Ordering::Release);
    }

    fn deliver_output(&self, buffer: Buffer, handler: &SharedCapture, policy: CompletionPolicy) {
        let mut dispatch = lock(&self.dispatch);
        dispatch.delivered += 1;

        let flags = buffer.flags();
        let forced = self.force_stop.load(Ordering::Acquire);
        let transmission_failed = flags.contains(BufferFlags::TRANSMISSION_FAILED);
        let boundary = flags.intersects(BOUNDARY);
        let ends_stream = flags.contains(BufferFlags::END_OF_STREAM);
        let terminal = forced
            || transmission_failed
            || match policy {
                CompletionPolicy::FirstTerminal => boundary,
                CompletionPolicy::EndOfStream => ends_stream,
                CompletionPolicy::Frames(n) => {
                    if flags.contains(BufferFlags::FRAME_END) {
                        dispatch.frames += 1;
                    }
                    ends_stream || dispatch.frames >= n
                }
            };
        trace!(
            "[{}] Buffer {} returned: {} bytes, {:?}",
            self.label,
            buffer.index(),
            buffer.length(),
            flags
        );

        let mut failure = None;
        if buffer.length() > 0 && !self.trigger.is_fired() {
            let result = lock(handler).handle(buffer.data(), boundary);
            if let Err(e) = result {
                error!("[{}] Capture handler failed: {}", self.label, e);
                failure = Some(e.to_string());
            }
        }
        drop(buffer);

        if self.enabled.load(Ordering::Acquire)
            && let Some(fresh) = self.pool.get()
        {
            self.submit(&mut dispatch, fresh);
        }

        let outcome = if let Some(reason) = failure {
            Some(Completion::Failed(reason))
        } else if transmission_failed {
            Some(Completion::Failed("transmission failed".to_string()))
        } else if terminal {
            Some(if forced && !boundary {
                Completion::Cancelled
            } else {
                Completion::Finished
            })
        } else {
            None
        };
        if let Some(outcome) = outcome
            && self.trigger.fire(outcome)
        {
            debug!("[{}] Completed after {} buffers", self.label, dispatch.delivered);
        }
    }

    fn deliver_input(&self, buffer: Buffer, handler: &SharedFeed) {
        let mut dispatch = lock(&self.dispatch);
        dispatch.delivered += 1;
        trace!("[{}] Buffer {} consumed", self.label, buffer.index());
        drop(buffer);

        if dispatch.feed_done || !self.enabled.load(Ordering::Acquire) {
            return;
        }
        match self.pool.get() {
            Some(fresh) => self.feed_one(&mut dispatch, handler, fresh),
            None => trace!("[{}] No free buffer to refill", self.label),
        }
    }

    /// Fill one buffer from the feed handler and submit it
    fn feed_one(&self, dispatch: &mut Dispatch, handler: &SharedFeed, mut buffer: Buffer) {
        let max_len = buffer.allocated_size() as usize;
        let forced = self.force_stop.load(Ordering::Acquire);
        let chunk: Result<FeedChunk, HandlerError> = if forced {
            Ok(FeedChunk::eof())
        } else {
            lock(handler).next_chunk(max_len)
        };

        let outcome = match chunk {
            Ok(chunk) => {
                if buffer.write(&chunk.bytes) < chunk.bytes.len() {
                    warn!(
                        "[{}] Feed chunk of {} bytes truncated to {}",
                        self.label,
                        chunk.bytes.len(),
                        max_len
                    );
                }
                match (chunk.is_eof, forced) {
                    (_, true) => Some(Completion::Cancelled),
                    (true, false) => Some(Completion::Finished),
                    (false, false) => None,
                }
            }
            Err(e) => {
                error!("[{}] Feed handler failed: {}", self.label, e);
                Some(Completion::Failed(e.to_string()))
            }
        };

        if outcome.is_some() {
            buffer.insert_flags(BufferFlags::END_OF_STREAM);
            dispatch.feed_done = true;
        }
        self.submit(dispatch, buffer);
        if let Some(outcome) = outcome {
            self.trigger.fire(outcome);
        }
    }

    fn submit(&self, dispatch: &mut Dispatch, buffer: Buffer) -> bool {
        let Some(engine) = self.engine.upgrade() else {
            warn!("[{}] Engine is gone; dropping buffer", self.label);
            return false;
        };
        match engine.submit(self.port, buffer) {
            Ok(()) => {
                dispatch.submitted += 1;
                true
            }
            Err(e) => {
                warn!("[{}] Submit failed: {}", self.label, e);
                false
            }
        }
    }
}

impl std::fmt::Debug for CallbackContext {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("CallbackContext")
            .field("port", &self.port)
            .field("label", &self.label)
            .field("enabled", &self.is_enabled())
            .field("trigger", &self.trigger)
            .finish()
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handlers::{ChunkFeed, FnCapture, MemoryCapture};
    use crate::runtime::mock::ManualEngine;
    use std::sync::atomic::AtomicUsize;

    fn context(engine: &Arc<ManualEngine>, callback: PortCallback) -> (Arc<CallbackContext>, Arc<AtomicBool>) {
        let kind = match callback {
            PortCallback::Capture { .. } => PortKind::Output,
            PortCallback::Feed { .. } => PortKind::Input,
        };
        let port = engine.port(kind, 0);
        let pool = Pool::create(4, 1024).unwrap();
        let force_stop = Arc::new(AtomicBool::new(false));
        let weak: Weak<dyn NativeEngine> = Arc::downgrade(engine) as Weak<dyn NativeEngine>;
        let context = Arc::new(CallbackContext::new(
            port,
            "test:port".to_string(),
            pool,
            callback,
            Arc::clone(&force_stop),
            weak,
        ));
        (context, force_stop)
    }

    fn payload(buffer: &mut Buffer, len: usize, flags: BufferFlags) {
        buffer.write(&vec![7u8; len]);
        buffer.set_flags(flags);
    }

    #[test]
    fn test_output_invokes_consumer_for_payload_only() {
        let engine = ManualEngine::new();
        let capture = Arc::new(Mutex::new(MemoryCapture::new()));
        let (ctx, _) = context(&engine, PortCallback::shared_capture(capture.clone(), CompletionPolicy::FirstTerminal));
        ctx.prime();
        assert_eq!(engine.held(ctx.port()), 4);

        for (len, flags) in [(500, BufferFlags::EMPTY), (0, BufferFlags::EMPTY), (700, BufferFlags::FRAME_END)] {
            let mut buffer = engine.take(ctx.port()).unwrap();
            payload(&mut buffer, len, flags);
            assert!(!ctx.trigger().is_fired());
            engine.complete(&ctx, buffer);
        }

        let capture = capture.lock().unwrap();
        assert_eq!(capture.calls(), 2);
        assert_eq!(capture.frames(), &[vec![7u8; 1200]]);
        assert_eq!(ctx.trigger().outcome(), Some(Completion::Finished));
        // every returned buffer was replaced
        assert_eq!(engine.held(ctx.port()), 4);
        assert_eq!(ctx.pool().in_flight(), 4);
    }

    #[test]
    fn test_transmission_failure_then_force_stop_fires_once() {
        let engine = ManualEngine::new();
        let (ctx, force_stop) = context(&engine, PortCallback::capture(MemoryCapture::new()));
        ctx.prime();

        let mut failed = engine.take(ctx.port()).unwrap();
        failed.set_flags(BufferFlags::TRANSMISSION_FAILED);
        let plain = engine.take(ctx.port()).unwrap();
        force_stop.store(true, Ordering::Release);

        let a = {
            let ctx = Arc::clone(&ctx);
            std::thread::spawn(move || ctx.deliver(failed))
        };
        let b = {
            let ctx = Arc::clone(&ctx);
            std::thread::spawn(move || ctx.deliver(plain))
        };
        a.join().unwrap();
        b.join().unwrap();

        assert!(ctx.trigger().is_fired());
        assert!(!ctx.trigger().fire(Completion::Finished));
        let stats = ctx.pool().stats();
        assert_eq!(stats.available + stats.in_flight, stats.header_count);
    }

    #[test]
    fn test_frames_policy_counts_down() {
        let engine = ManualEngine::new();
        let (ctx, _) = context(
            &engine,
            PortCallback::capture_with_policy(MemoryCapture::new(), CompletionPolicy::Frames(2)),
        );
        ctx.prime();

        let mut first = engine.take(ctx.port()).unwrap();
        payload(&mut first, 10, BufferFlags::COMPLETE_FRAME);
        engine.complete(&ctx, first);
        assert!(!ctx.trigger().is_fired());

        let mut second = engine.take(ctx.port()).unwrap();
        payload(&mut second, 10, BufferFlags::COMPLETE_FRAME);
        engine.complete(&ctx, second);
        assert_eq!(ctx.trigger().outcome(), Some(Completion::Finished));
    }

    #[test]
    fn test_end_of_stream_policy_ignores_frame_end() {
        let engine = ManualEngine::new();
        let (ctx, _) = context(
            &engine,
            PortCallback::capture_with_policy(MemoryCapture::new(), CompletionPolicy::EndOfStream),
        );
        ctx.prime();

        let mut frame = engine.take(ctx.port()).unwrap();
        payload(&mut frame, 10, BufferFlags::FRAME_END);
        engine.complete(&ctx, frame);
        assert!(!ctx.trigger().is_fired());

        let mut last = engine.take(ctx.port()).unwrap();
        last.set_flags(BufferFlags::END_OF_STREAM);
        engine.complete(&ctx, last);
        assert_eq!(ctx.trigger().outcome(), Some(Completion::Finished));
    }

    #[test]
    fn test_consumer_not_called_after_trigger() {
        let engine = ManualEngine::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let (ctx, _) = context(
            &engine,
            PortCallback::capture(FnCapture::new(move |_: &[u8], _| {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })),
        );
        ctx.prime();

        let mut end = engine.take(ctx.port()).unwrap();
        payload(&mut end, 4, BufferFlags::END_OF_STREAM);
        engine.complete(&ctx, end);
        let mut late = engine.take(ctx.port()).unwrap();
        payload(&mut late, 4, BufferFlags::EMPTY);
        engine.complete(&ctx, late);

        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_handler_panic_is_contained() {
        let engine = ManualEngine::new();
        let (ctx, _) = context(
            &engine,
            PortCallback::capture(FnCapture::new(|_: &[u8], _| panic!("decoder exploded"))),
        );
        ctx.prime();

        let mut buffer = engine.take(ctx.port()).unwrap();
        payload(&mut buffer, 8, BufferFlags::EMPTY);
        engine.complete(&ctx, buffer);

        match ctx.trigger().outcome() {
            Some(Completion::Failed(reason)) => assert!(reason.contains("decoder exploded")),
            other => panic!("unexpected outcome {:?}", other),
        }
        assert_eq!(ctx.pool().stats().in_flight + ctx.pool().available(), 4);
    }

    #[test]
    fn test_handler_error_fails_trigger() {
        let engine = ManualEngine::new();
        let (ctx, _) = context(&engine, PortCallback::capture(MemoryCapture::with_limit(4)));
        ctx.prime();

        let mut buffer = engine.take(ctx.port()).unwrap();
        payload(&mut buffer, 8, BufferFlags::EMPTY);
        engine.complete(&ctx, buffer);
        assert!(ctx.trigger().outcome().is_some_and(|c| c.is_failure()));
    }

    #[test]
    fn test_feed_submits_chunks_then_end_of_stream() {
        let engine = ManualEngine::new();
        let chunks: Vec<Vec<u8>> = (1..=5u8).map(|i| vec![i; 100]).collect();
        let (ctx, _) = context(&engine, PortCallback::feed(ChunkFeed::new(chunks)));
        ctx.prime();
        assert_eq!(engine.held(ctx.port()), 4);

        let mut seen = Vec::new();
        while let Some(buffer) = engine.take(ctx.port()) {
            seen.push((buffer.length(), buffer.flags()));
            engine.complete(&ctx, buffer);
        }

        assert_eq!(seen.len(), 6);
        assert!(seen[..5].iter().all(|(len, flags)| *len == 100 && flags.is_empty()));
        assert_eq!(seen[5], (0, BufferFlags::END_OF_STREAM));
        assert_eq!(ctx.trigger().outcome(), Some(Completion::Finished));
        assert_eq!(ctx.submitted(), 6);
        assert_eq!(ctx.pool().available(), 4);
    }

    #[test]
    fn test_feed_force_stop_ends_with_end_of_stream() {
        let engine = ManualEngine::new();
        let (ctx, force_stop) = context(&engine, PortCallback::feed(ChunkFeed::new(vec![vec![1u8; 10]; 100])));
        ctx.prime();

        force_stop.store(true, Ordering::Release);
        let buffer = engine.take(ctx.port()).unwrap();
        engine.complete(&ctx, buffer);

        assert_eq!(ctx.trigger().outcome(), Some(Completion::Cancelled));
        let mut last = None;
        while let Some(buffer) = engine.take(ctx.port()) {
            last = Some(buffer.flags());
            engine.complete(&ctx, buffer);
        }
        assert_eq!(last, Some(BufferFlags::END_OF_STREAM));
    }

    #[test]
    fn test_shutdown_stops_replenishing() {
        let engine = ManualEngine::new();
        let (ctx, _) = context(&engine, PortCallback::capture(MemoryCapture::new()));
        ctx.prime();
        ctx.shutdown();

        while let Some(buffer) = engine.take(ctx.port()) {
            engine.complete(&ctx, buffer);
        }
        assert_eq!(ctx.pool().available(), 4);
        assert_eq!(ctx.pool().in_flight(), 0);
    }
}
