//! Example: Capture a stream through an optional encoder stage
//!
//! Runs a camera -> encoder -> capture chain on the in-process loopback
//! engine. The encoder is connected with a tunnel, so its input never
//! surfaces to application code; only the last open output is captured.
//!
//! Usage:
//!   cargo run --example capture -- --frames 30 --frame-size 4096
//!
//! Through an encoder, writing the stream to disk:
//!   cargo run --example capture -- --frames 30 --encoder --output stream.raw
//!
//! Endless stream, cancelled after two seconds, with a renderer fed alongside:
//!   cargo run --example capture -- --frames 0 --cancel-after-ms 2000 --render-bytes 65536

use clap::Parser;
use hwpipe::handlers::{CaptureHandler, HandlerError, MemoryFeed};
use hwpipe::runtime::{
    CancellationToken, CompletionPolicy, ComponentSpec, Connection, Context, LoopbackEngine,
    Orchestrator, PatternSource, PortSpec, RuntimeConfig,
};
use std::fs::File;
use std::io::{BufWriter, Write};
use std::thread;
use std::time::{Duration, Instant};
use tracing::info;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Number of frames the camera produces (0 = endless)
    #[arg(short, long, default_value = "30")]
    frames: u64,

    /// Size of each frame in bytes
    #[arg(long, default_value = "4096")]
    frame_size: usize,

    /// Milliseconds between frames
    #[arg(long, default_value = "10")]
    interval_ms: u64,

    /// Buffers per port
    #[arg(long, default_value = "3")]
    buffers: u32,

    /// Payload size of each buffer
    #[arg(long, default_value = "1024")]
    buffer_size: u32,

    /// Route the camera through a tunnelled encoder stage
    #[arg(long)]
    encoder: bool,

    /// Feed this many bytes into a renderer while capturing
    #[arg(long)]
    render_bytes: Option<usize>,

    /// Cancel the run after this many milliseconds
    #[arg(long)]
    cancel_after_ms: Option<u64>,

    /// Give up after this many milliseconds
    #[arg(long)]
    deadline_ms: Option<u64>,

    /// Write captured payload to this file
    #[arg(long)]
    output: Option<String>,
}

/// Capture handler counting frames and optionally writing payload to disk
struct StreamWriter {
    writer: Option<BufWriter<File>>,
    frames: usize,
    bytes: usize,
}

impl StreamWriter {
    fn new(path: Option<&str>) -> std::io::Result<Self> {
        let writer = match path {
            Some(path) => Some(BufWriter::new(File::create(path)?)),
            None => None,
        };
        Ok(Self {
            writer,
            frames: 0,
            bytes: 0,
        })
    }
}

impl CaptureHandler for StreamWriter {
    fn handle(&mut self, payload: &[u8], is_eof: bool) -> Result<(), HandlerError> {
        if let Some(writer) = &mut self.writer {
            writer.write_all(payload)?;
        }
        self.bytes += payload.len();
        if is_eof {
            self.frames += 1;
        }
        Ok(())
    }

    fn post_process(&mut self) -> Result<(), HandlerError> {
        if let Some(writer) = &mut self.writer {
            writer.flush()?;
        }
        info!("[StreamWriter] {} frames, {} bytes", self.frames, self.bytes);
        Ok(())
    }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing subscriber
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    info!("=== Capture Example ===");
    info!(
        "Camera: {} frames of {} bytes every {} ms",
        args.frames, args.frame_size, args.interval_ms
    );

    let mut config = RuntimeConfig::default();
    if let Some(ms) = args.deadline_ms {
        config = config.with_completion_deadline(Duration::from_millis(ms));
    }
    let engine = LoopbackEngine::from_config(&config);
    let context = Context::with_config(engine.clone(), config);
    let port = PortSpec::new(args.buffers, args.buffer_size);

    let camera = context.create_component(
        ComponentSpec::new("camera")
            .with_output(port.clone())
            .capture_port(0),
    )?;
    let camera_out = camera.output(0).ok_or("camera has no output")?;

    let mut source = PatternSource::new(args.frame_size)
        .with_interval(Duration::from_millis(args.interval_ms));
    if args.frames > 0 {
        source = source.with_count(args.frames).with_end_of_stream();
    }
    engine.install_source(camera_out.id(), source);

    // The stage whose output is captured
    let (encoder, _tunnel) = if args.encoder {
        let encoder = context.create_component(
            ComponentSpec::new("encoder")
                .with_input(port.clone())
                .with_output(port.clone()),
        )?;
        let input = encoder.input(0).ok_or("encoder has no input")?;
        let output = encoder.output(0).ok_or("encoder has no output")?;
        let tunnel = Connection::create(camera_out, input)?;
        engine.install_passthrough(input.id(), output.id());
        info!("Tunnel: {}", tunnel.label());
        (Some(encoder), Some(tunnel))
    } else {
        (None, None)
    };
    let captured = match &encoder {
        Some(encoder) => encoder.output(0).ok_or("encoder has no output")?,
        None => camera_out,
    };

    let mut orchestrator = Orchestrator::new(&context);
    // An endless stream only completes through cancellation or the deadline
    orchestrator.attach_capture_with_policy(
        captured,
        StreamWriter::new(args.output.as_deref())?,
        CompletionPolicy::EndOfStream,
    )?;

    let mut roots = vec![camera.clone()];
    if let Some(bytes) = args.render_bytes {
        let renderer = context.create_component(ComponentSpec::new("renderer").with_input(port))?;
        let input = renderer.input(0).ok_or("renderer has no input")?;
        orchestrator.attach_feed(input, MemoryFeed::new(vec![0x80u8; bytes]))?;
        roots.push(renderer);
    }

    let token = CancellationToken::new();
    if let Some(ms) = args.cancel_after_ms {
        let token = token.clone();
        thread::spawn(move || {
            thread::sleep(Duration::from_millis(ms));
            info!("Cancelling after {} ms", ms);
            token.cancel();
        });
    }

    let start = Instant::now();
    orchestrator.run_all(&roots, token)?;
    info!("Pipeline completed in {:.2?}", start.elapsed());

    for component in roots.iter().chain(encoder.iter()) {
        component.destroy()?;
    }
    Ok(())
}
