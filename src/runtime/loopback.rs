//! Software engine running every port on its own worker thread
//!
//! Each port the engine touches gets a worker with a FIFO event queue, so
//! deliveries on one port keep their order while different ports run
//! concurrently. Output ports produce frames from an installed
//! [`FrameSource`] while capture is on; input ports consume what they are
//! given and can hand it on to an output of the same component
//! (passthrough). Tunnels copy frames into buffers of the connection's pool
//! and move them straight to the sink's worker.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use tracing::{debug, info, trace, warn};

use super::buffer::{Buffer, BufferFlags};
use super::callback::CallbackContext;
use super::config::RuntimeConfig;
use super::errors::NativeError;
use super::format::Format;
use super::lock;
use super::native::{ComponentId, NativeEngine, PortId, PortKind};
use super::pool::Pool;

/// How long flush and untunnel requests wait for the worker to acknowledge
const ACK_TIMEOUT: Duration = Duration::from_secs(1);

/// One produced frame, split over as many buffers as it needs
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub data: Vec<u8>,
    pub flags: BufferFlags,
    pub pts: Option<i64>,
}

impl Frame {
    /// A whole frame
    pub fn new(data: impl Into<Vec<u8>>) -> Self {
        Self {
            data: data.into(),
            flags: BufferFlags::COMPLETE_FRAME,
            pts: None,
        }
    }

    /// Data with no frame boundary
    pub fn partial(data: impl Into<Vec<u8>>) -> Self {
        Self {
            data: data.into(),
            flags: BufferFlags::EMPTY,
            pts: None,
        }
    }

    /// Empty marker ending the stream
    pub fn end_of_stream() -> Self {
        Self {
            data: Vec::new(),
            flags: BufferFlags::END_OF_STREAM,
            pts: None,
        }
    }

    pub fn with_flags(mut self, flags: BufferFlags) -> Self {
        self.flags.insert(flags);
        self
    }

    pub fn with_pts(mut self, pts: i64) -> Self {
        self.pts = Some(pts);
        self
    }
}

/// Producer of frames for an output port
pub trait FrameSource: Send {
    /// Next frame, or `None` once the source is exhausted
    fn next_frame(&mut self) -> Option<Frame>;

    /// Pause before each frame
    fn interval(&self) -> Duration {
        Duration::ZERO
    }
}

/// Plays back a fixed list of frames
#[derive(Debug, Clone, Default)]
pub struct ScriptedSource {
    frames: VecDeque<Frame>,
    interval: Duration,
}

impl ScriptedSource {
    pub fn new(frames: impl IntoIterator<Item = Frame>) -> Self {
        Self {
            frames: frames.into_iter().collect(),
            interval: Duration::ZERO,
        }
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn remaining(&self) -> usize {
        self.frames.len()
    }
}

impl FrameSource for ScriptedSource {
    fn next_frame(&mut self) -> Option<Frame> {
        self.frames.pop_front()
    }

    fn interval(&self) -> Duration {
        self.interval
    }
}

/// Synthetic frames of a fixed size, each filled with its sequence number
#[derive(Debug, Clone)]
pub struct PatternSource {
    frame_size: usize,
    count: Option<u64>,
    produced: u64,
    interval: Duration,
    end_of_stream: bool,
    finished: bool,
}

impl PatternSource {
    /// Endless source; see [`with_count`](PatternSource::with_count)
    pub fn new(frame_size: usize) -> Self {
        Self {
            frame_size,
            count: None,
            produced: 0,
            interval: Duration::from_millis(1),
            end_of_stream: false,
            finished: false,
        }
    }

    pub fn with_count(mut self, count: u64) -> Self {
        self.count = Some(count);
        self
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Follow the last frame with an empty end-of-stream frame
    pub fn with_end_of_stream(mut self) -> Self {
        self.end_of_stream = true;
        self
    }

    pub fn produced(&self) -> u64 {
        self.produced
    }
}

impl FrameSource for PatternSource {
    fn next_frame(&mut self) -> Option<Frame> {
        if self.finished {
            return None;
        }
        if self.count.is_some_and(|count| self.produced >= count) {
            self.finished = true;
            return self.end_of_stream.then(Frame::end_of_stream);
        }
        let mut frame = Frame::new(vec![(self.produced % 251) as u8; self.frame_size])
            .with_pts((self.produced as i64) * (self.interval.as_micros() as i64));
        if self.produced == 0 {
            frame = frame.with_flags(BufferFlags::KEYFRAME);
        }
        self.produced += 1;
        Some(frame)
    }

    fn interval(&self) -> Duration {
        self.interval
    }
}

/// What an input port has consumed so far
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Consumed {
    pub bytes: usize,
    pub buffers: usize,
    /// Union of every flag seen
    pub flags: BufferFlags,
}

enum Event {
    Attach(Arc<CallbackContext>),
    Detach,
    Submit(Buffer),
    Frame(Frame),
    Tunnel { pool: Pool, sink: PortId },
    Untunnel(Sender<()>),
    Tunnelled { source: PortId, buffer: Buffer },
    Kick,
    Flush(Sender<()>),
    Stop,
}

struct Worker {
    events: Sender<Event>,
    handle: Option<JoinHandle<()>>,
}

struct Producer {
    stop: Sender<()>,
    handle: JoinHandle<Box<dyn FrameSource>>,
}

struct Shared {
    backlog_limit: usize,
    stopped: AtomicBool,
    workers: Mutex<HashMap<PortId, Worker>>,
    registered: Mutex<HashSet<PortId>>,
    sources: Mutex<HashMap<PortId, Box<dyn FrameSource>>>,
    producers: Mutex<HashMap<PortId, Producer>>,
    capturing: Mutex<HashSet<PortId>>,
    passthrough: Mutex<HashMap<PortId, PortId>>,
    tunnels: Mutex<HashMap<PortId, PortId>>,
    consumed: Mutex<HashMap<PortId, Consumed>>,
    fail_register: Mutex<HashSet<PortId>>,
    reject_formats: AtomicBool,
}

impl Shared {
    /// Event queue of `port`, starting its worker on first use
    fn events(self: &Arc<Self>, port: PortId) -> Result<Sender<Event>, NativeError> {
        if self.stopped.load(Ordering::Acquire) {
            return Err(NativeError::ShutDown);
        }
        let mut workers = lock(&self.workers);
        if let Some(worker) = workers.get(&port) {
            return Ok(worker.events.clone());
        }

        let (events, inbox) = crossbeam_channel::unbounded();
        let worker = PortWorker {
            port,
            shared: Arc::downgrade(self),
            backlog_limit: self.backlog_limit,
            context: None,
            pending: VecDeque::new(),
            backlog: VecDeque::new(),
            tunnel: None,
        };
        let handle = thread::Builder::new()
            .name(format!("loopback {}", port))
            .spawn(move || worker.run(inbox))
            .map_err(|e| NativeError::Rejected(format!("worker for {}: {}", port, e)))?;
        debug!("[{}] Loopback worker started", port);
        workers.insert(
            port,
            Worker {
                events: events.clone(),
                handle: Some(handle),
            },
        );
        Ok(events)
    }

    fn send(self: &Arc<Self>, port: PortId, event: Event) -> Result<(), NativeError> {
        self.events(port)?
            .send(event)
            .map_err(|_| NativeError::ShutDown)
    }

    /// Send `event` and wait for the worker to acknowledge it
    fn request(
        self: &Arc<Self>,
        port: PortId,
        event: impl FnOnce(Sender<()>) -> Event,
    ) -> Result<(), NativeError> {
        let (ack, acked) = crossbeam_channel::bounded(1);
        self.send(port, event(ack))?;
        if acked.recv_timeout(ACK_TIMEOUT).is_err() {
            warn!("[{}] Loopback worker did not acknowledge within {:?}", port, ACK_TIMEOUT);
        }
        Ok(())
    }
}

/// A frame waiting for buffers, with how much of it has been sent
struct Backlogged {
    frame: Frame,
    offset: usize,
}

struct PortWorker {
    port: PortId,
    shared: Weak<Shared>,
    backlog_limit: usize,
    context: Option<Arc<CallbackContext>>,
    /// Empty buffers submitted on an output port
    pending: VecDeque<Buffer>,
    backlog: VecDeque<Backlogged>,
    /// Pool and sink of a tunnel this output feeds
    tunnel: Option<(Pool, PortId)>,
}

impl PortWorker {
    fn run(mut self, inbox: Receiver<Event>) {
        while let Ok(event) = inbox.recv() {
            match event {
                Event::Attach(context) => {
                    self.context = Some(context);
                }
                Event::Detach => {
                    self.context = None;
                    self.pending.clear();
                }
                Event::Submit(buffer) => match self.port.kind {
                    PortKind::Input => {
                        self.consume(&buffer);
                        match &self.context {
                            Some(context) => context.deliver(buffer),
                            None => drop(buffer),
                        }
                    }
                    PortKind::Output | PortKind::Control => {
                        self.pending.push_back(buffer);
                        self.pump();
                    }
                },
                Event::Frame(frame) => {
                    if self.context.is_none() && self.tunnel.is_none() {
                        trace!("[{}] No consumer, frame dropped", self.port);
                        continue;
                    }
                    self.enqueue(frame);
                    self.pump();
                }
                Event::Tunnel { pool, sink } => {
                    debug!("[{}] Tunnel to {} enabled", self.port, sink);
                    self.tunnel = Some((pool, sink));
                    self.pump();
                }
                Event::Untunnel(ack) => {
                    self.tunnel = None;
                    self.backlog.clear();
                    let _ = ack.send(());
                }
                Event::Tunnelled { source, buffer } => {
                    self.consume(&buffer);
                    drop(buffer);
                    if let Some(shared) = self.shared.upgrade() {
                        let _ = shared.send(source, Event::Kick);
                    }
                }
                Event::Kick => self.pump(),
                Event::Flush(ack) => {
                    let flushed = self.pending.len();
                    self.pending.clear();
                    self.backlog.clear();
                    trace!("[{}] Flushed {} buffers", self.port, flushed);
                    let _ = ack.send(());
                }
                Event::Stop => break,
            }
        }
        debug!("[{}] Loopback worker stopped", self.port);
    }

    fn enqueue(&mut self, frame: Frame) {
        if self.backlog.len() >= self.backlog_limit {
            self.backlog.pop_front();
            warn!("[{}] Backlog full, dropping oldest frame", self.port);
        }
        self.backlog.push_back(Backlogged { frame, offset: 0 });
    }

    /// Move backlogged data into whatever buffers are available
    fn pump(&mut self) {
        loop {
            let Some(waiting) = self.backlog.front_mut() else {
                break;
            };
            let buffer = match &self.tunnel {
                Some((pool, _)) => pool.get(),
                None if self.context.is_some() => self.pending.pop_front(),
                None => None,
            };
            let Some(mut buffer) = buffer else {
                break;
            };
            if fill(&mut buffer, waiting) {
                self.backlog.pop_front();
            }
            self.dispatch(buffer);
        }
    }

    fn dispatch(&self, buffer: Buffer) {
        if let Some((_, sink)) = &self.tunnel {
            let Some(shared) = self.shared.upgrade() else {
                return;
            };
            let event = Event::Tunnelled {
                source: self.port,
                buffer,
            };
            if let Err(e) = shared.send(*sink, event) {
                trace!("[{}] Tunnel buffer dropped: {}", self.port, e);
            }
        } else if let Some(context) = &self.context {
            trace!("[{}] Delivering {} bytes", self.port, buffer.length());
            context.deliver(buffer);
        }
    }

    /// Record what reached an input port and hand it to its passthrough output
    fn consume(&self, buffer: &Buffer) {
        let Some(shared) = self.shared.upgrade() else {
            return;
        };
        {
            let mut consumed = lock(&shared.consumed);
            let entry = consumed.entry(self.port).or_default();
            entry.bytes += buffer.length() as usize;
            entry.buffers += 1;
            entry.flags.insert(buffer.flags());
        }
        if buffer.length() == 0 && buffer.flags().is_empty() {
            return;
        }
        let output = lock(&shared.passthrough).get(&self.port).copied();
        if let Some(output) = output {
            let frame = Frame {
                data: buffer.data().to_vec(),
                flags: buffer.flags(),
                pts: buffer.pts(),
            };
            if let Err(e) = shared.send(output, Event::Frame(frame)) {
                trace!("[{}] Passthrough to {} failed: {}", self.port, output, e);
            }
        }
    }
}

/// Copy the next piece of `waiting` into `buffer`; true once the frame is fully sent.
///
/// FrameStart goes on the first piece, every other flag on the last.
fn fill(buffer: &mut Buffer, waiting: &mut Backlogged) -> bool {
    let data = &waiting.frame.data;
    let start = waiting.offset;
    let end = (start + buffer.allocated_size() as usize).min(data.len());
    buffer.write(&data[start..end]);

    let mut flags = BufferFlags::EMPTY;
    if start == 0 {
        flags.insert(waiting.frame.flags & BufferFlags::FRAME_START);
    }
    let last = end == data.len();
    if last {
        let mut tail = waiting.frame.flags;
        tail.remove(BufferFlags::FRAME_START);
        flags.insert(tail);
    }
    buffer.set_flags(flags);
    buffer.set_pts(waiting.frame.pts);
    waiting.offset = end;
    last
}

fn join_unless_current<T>(handle: JoinHandle<T>) -> Option<T> {
    if handle.thread().id() == thread::current().id() {
        return None;
    }
    handle.join().ok()
}

/// In-process [`NativeEngine`] for tests and demos
pub struct LoopbackEngine {
    shared: Arc<Shared>,
}

impl LoopbackEngine {
    pub fn new() -> Arc<Self> {
        Self::with_backlog_limit(RuntimeConfig::default().backlog_limit)
    }

    pub fn from_config(config: &RuntimeConfig) -> Arc<Self> {
        Self::with_backlog_limit(config.backlog_limit)
    }

    /// At most `limit` frames wait per port for a free buffer; older ones are dropped
    pub fn with_backlog_limit(limit: usize) -> Arc<Self> {
        Arc::new(Self {
            shared: Arc::new(Shared {
                backlog_limit: limit.max(1),
                stopped: AtomicBool::new(false),
                workers: Mutex::new(HashMap::new()),
                registered: Mutex::new(HashSet::new()),
                sources: Mutex::new(HashMap::new()),
                producers: Mutex::new(HashMap::new()),
                capturing: Mutex::new(HashSet::new()),
                passthrough: Mutex::new(HashMap::new()),
                tunnels: Mutex::new(HashMap::new()),
                consumed: Mutex::new(HashMap::new()),
                fail_register: Mutex::new(HashSet::new()),
                reject_formats: AtomicBool::new(false),
            }),
        })
    }

    /// Produce frames from `source` on `port` while capture is on
    pub fn install_source(&self, port: PortId, source: impl FrameSource + 'static) {
        lock(&self.shared.sources).insert(port, Box::new(source));
    }

    /// Re-emit everything consumed on `input` from `output`
    pub fn install_passthrough(&self, input: PortId, output: PortId) {
        lock(&self.shared.passthrough).insert(input, output);
    }

    pub fn consumed(&self, port: PortId) -> Consumed {
        lock(&self.shared.consumed)
            .get(&port)
            .copied()
            .unwrap_or_default()
    }

    pub fn is_capturing(&self, port: PortId) -> bool {
        lock(&self.shared.capturing).contains(&port)
    }

    /// Make the next registrations of `port` fail
    pub fn fail_registration(&self, port: PortId) {
        lock(&self.shared.fail_register).insert(port);
    }

    pub fn reject_formats(&self, reject: bool) {
        self.shared.reject_formats.store(reject, Ordering::Release);
    }

    /// Stop every producer and worker; later requests fail with [`NativeError::ShutDown`]
    pub fn shutdown(&self) {
        if self.shared.stopped.swap(true, Ordering::AcqRel) {
            return;
        }
        let producers: Vec<_> = lock(&self.shared.producers).drain().collect();
        for (_, producer) in producers {
            drop(producer.stop);
            join_unless_current(producer.handle);
        }
        let workers: Vec<_> = lock(&self.shared.workers).drain().collect();
        for (_, worker) in &workers {
            let _ = worker.events.send(Event::Stop);
        }
        let count = workers.len();
        for (_, mut worker) in workers {
            if let Some(handle) = worker.handle.take() {
                join_unless_current(handle);
            }
        }
        info!("Loopback engine shut down ({} workers)", count);
    }

    fn start_producer(&self, port: PortId) -> Result<(), NativeError> {
        let mut producers = lock(&self.shared.producers);
        if producers.contains_key(&port) {
            return Ok(());
        }
        let Some(mut source) = lock(&self.shared.sources).remove(&port) else {
            debug!("[{}] No frame source installed", port);
            return Ok(());
        };
        let (stop, stopped) = crossbeam_channel::bounded::<()>(0);
        let shared = Arc::downgrade(&self.shared);
        let handle = thread::Builder::new()
            .name(format!("capture {}", port))
            .spawn(move || {
                loop {
                    match stopped.recv_timeout(source.interval()) {
                        Err(RecvTimeoutError::Timeout) => {}
                        _ => break,
                    }
                    let Some(frame) = source.next_frame() else {
                        debug!("[{}] Frame source exhausted", port);
                        break;
                    };
                    let Some(shared) = shared.upgrade() else {
                        break;
                    };
                    if shared.send(port, Event::Frame(frame)).is_err() {
                        break;
                    }
                }
                source
            })
            .map_err(|e| NativeError::Rejected(format!("producer for {}: {}", port, e)))?;
        producers.insert(port, Producer { stop, handle });
        Ok(())
    }

    fn stop_producer(&self, port: PortId) {
        let Some(producer) = lock(&self.shared.producers).remove(&port) else {
            return;
        };
        drop(producer.stop);
        if let Some(source) = join_unless_current(producer.handle) {
            lock(&self.shared.sources).insert(port, source);
        }
    }
}

impl NativeEngine for LoopbackEngine {
    fn destroy_component(&self, id: ComponentId) -> Result<(), NativeError> {
        let ports: Vec<PortId> = lock(&self.shared.producers)
            .keys()
            .filter(|port| port.component == id)
            .copied()
            .collect();
        for port in ports {
            self.stop_producer(port);
        }
        let workers: Vec<(PortId, Worker)> = {
            let mut all = lock(&self.shared.workers);
            let ports: Vec<PortId> = all.keys().filter(|port| port.component == id).copied().collect();
            ports
                .into_iter()
                .filter_map(|port| all.remove(&port).map(|worker| (port, worker)))
                .collect()
        };
        for (port, mut worker) in workers {
            let _ = worker.events.send(Event::Stop);
            if let Some(handle) = worker.handle.take() {
                join_unless_current(handle);
            }
            lock(&self.shared.registered).remove(&port);
        }
        Ok(())
    }

    fn commit_format(&self, port: PortId, format: &Format) -> Result<(), NativeError> {
        if self.shared.reject_formats.load(Ordering::Acquire) {
            return Err(NativeError::Rejected(format!(
                "format {} on {}",
                format.encoding, port
            )));
        }
        Ok(())
    }

    fn register_port(&self, port: PortId, context: Arc<CallbackContext>) -> Result<(), NativeError> {
        if lock(&self.shared.fail_register).contains(&port) {
            return Err(NativeError::Rejected(format!("registration of {}", port)));
        }
        if !lock(&self.shared.registered).insert(port) {
            return Err(NativeError::AlreadyRegistered(port.to_string()));
        }
        if let Err(e) = self.shared.send(port, Event::Attach(context)) {
            lock(&self.shared.registered).remove(&port);
            return Err(e);
        }
        Ok(())
    }

    fn unregister_port(&self, port: PortId) -> Result<(), NativeError> {
        if !lock(&self.shared.registered).remove(&port) {
            return Err(NativeError::UnknownPort(port.to_string()));
        }
        self.shared.send(port, Event::Detach)
    }

    fn flush_port(&self, port: PortId) -> Result<(), NativeError> {
        if !lock(&self.shared.workers).contains_key(&port) {
            return Ok(());
        }
        self.shared.request(port, Event::Flush)
    }

    fn submit(&self, port: PortId, buffer: Buffer) -> Result<(), NativeError> {
        if !lock(&self.shared.registered).contains(&port) {
            return Err(NativeError::UnknownPort(port.to_string()));
        }
        self.shared.send(port, Event::Submit(buffer))
    }

    fn set_capture(&self, port: PortId, enabled: bool) -> Result<(), NativeError> {
        if self.shared.stopped.load(Ordering::Acquire) {
            return Err(NativeError::ShutDown);
        }
        if enabled {
            self.start_producer(port)?;
            lock(&self.shared.capturing).insert(port);
        } else {
            lock(&self.shared.capturing).remove(&port);
            self.stop_producer(port);
        }
        Ok(())
    }

    fn create_tunnel(&self, source: PortId, sink: PortId) -> Result<(), NativeError> {
        let mut tunnels = lock(&self.shared.tunnels);
        if tunnels.contains_key(&source) {
            return Err(NativeError::Rejected(format!("{} is already tunnelled", source)));
        }
        tunnels.insert(source, sink);
        Ok(())
    }

    fn enable_tunnel(&self, source: PortId, pool: Pool) -> Result<(), NativeError> {
        let sink = lock(&self.shared.tunnels)
            .get(&source)
            .copied()
            .ok_or_else(|| NativeError::UnknownTunnel(source.to_string()))?;
        self.shared.events(sink)?;
        self.shared.send(source, Event::Tunnel { pool, sink })
    }

    fn disable_tunnel(&self, source: PortId) -> Result<(), NativeError> {
        if !lock(&self.shared.tunnels).contains_key(&source) {
            return Err(NativeError::UnknownTunnel(source.to_string()));
        }
        self.shared.request(source, Event::Untunnel)
    }

    fn destroy_tunnel(&self, source: PortId) -> Result<(), NativeError> {
        lock(&self.shared.tunnels)
            .remove(&source)
            .map(|_| ())
            .ok_or_else(|| NativeError::UnknownTunnel(source.to_string()))
    }
}

impl Drop for LoopbackEngine {
    fn drop(&mut self) {
        self.shutdown();
    }
}
