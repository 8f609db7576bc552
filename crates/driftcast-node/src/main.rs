//! Driftcast Node
//!
//! Streams a synthetic screen to one client over UDP.
//!
//! - Starts a stream from a synthetic capture source and simulated encoder
//! - Begins encoding once the client is considered registered
//! - Relays client quality feedback from the stream's socket
//! - Prints periodic stream metrics as JSON lines on stdout

mod synthetic;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use clap::Parser;
use crossbeam_channel::{bounded, never, select, tick, unbounded, Receiver};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use driftcast_stream::capture::CaptureTarget;
use driftcast_stream::pipeline::Reconfiguration;
use driftcast_stream::registry::StreamRegistry;
use driftcast_stream::transport::{FeedbackListener, UdpTransport};
use driftcast_stream::wire::QualityFeedback;
use driftcast_stream::StreamConfig;

use synthetic::{EncoderModel, SimulatedEncoder, SyntheticCapture};

/// Driftcast streaming node.
#[derive(Parser, Debug)]
#[command(name = "driftcast-node", about = "Stream a synthetic screen over UDP")]
struct Cli {
    /// Stream configuration (TOML). Defaults apply when omitted.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Client address packets are sent to.
    #[arg(long, default_value = "127.0.0.1:5600")]
    dest: SocketAddr,

    /// Local address to send from.
    #[arg(long, default_value = "0.0.0.0:0")]
    bind: SocketAddr,

    /// Synthetic display width.
    #[arg(long, default_value_t = 1920)]
    width: u32,

    /// Synthetic display height.
    #[arg(long, default_value_t = 1080)]
    height: u32,

    /// Override the configured target frame rate.
    #[arg(long)]
    fps: Option<u32>,

    /// Native refresh rate of the synthetic display. Omit for a source paced
    /// to the target rate.
    #[arg(long)]
    refresh_hz: Option<u32>,

    /// Capture a window instead of the display.
    #[arg(long)]
    window: Option<u64>,

    /// Delay before the client counts as registered.
    #[arg(long, default_value_t = 0)]
    register_delay_ms: u64,

    /// Stop after this many seconds. Runs until Ctrl+C when omitted.
    #[arg(long)]
    duration_secs: Option<u64>,

    /// Rescale the stream to this factor after `--scale-after-secs`.
    #[arg(long)]
    scale: Option<f64>,

    #[arg(long, default_value_t = 10)]
    scale_after_secs: u64,

    /// Inject a client loss report every this many seconds.
    #[arg(long)]
    loss_feedback_every: Option<u64>,

    /// Chance per frame that the simulated encoder stalls.
    #[arg(long, default_value_t = 0.0)]
    stall_chance: f64,

    /// Seed for the synthetic motion and encoder models.
    #[arg(long, default_value_t = 0x5eed)]
    seed: u64,
}

fn load_config(cli: &Cli) -> Result<StreamConfig> {
    let mut config = match &cli.config {
        Some(path) => {
            let text = std::fs::read_to_string(path)
                .with_context(|| format!("reading {}", path.display()))?;
            StreamConfig::from_toml_str(&text)
                .with_context(|| format!("parsing {}", path.display()))?
        }
        None => StreamConfig::default(),
    };
    if let Some(fps) = cli.fps {
        anyhow::ensure!((1..=240).contains(&fps), "--fps must be within 1..=240");
        config.stream.target_fps = fps;
    }
    Ok(config)
}

/// Forward client feedback from the socket until `stop` is set.
fn spawn_feedback_relay(
    listener: FeedbackListener,
    stop: Arc<AtomicBool>,
) -> Result<(Receiver<QualityFeedback>, thread::JoinHandle<()>)> {
    let (tx, rx) = unbounded();
    let handle = thread::Builder::new()
        .name("feedback-relay".into())
        .spawn(move || {
            while !stop.load(Ordering::Acquire) {
                match listener.poll() {
                    Ok(Some(feedback)) => {
                        if tx.send(feedback).is_err() {
                            break;
                        }
                    }
                    Ok(None) => {}
                    Err(e) => {
                        warn!(error = %e, "feedback socket failed");
                        break;
                    }
                }
            }
        })?;
    Ok((rx, handle))
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = load_config(&cli)?;
    let target = match cli.window {
        Some(id) => CaptureTarget::Window(id),
        None => CaptureTarget::Display(0),
    };

    let transport = UdpTransport::connect(cli.bind, cli.dest)
        .with_context(|| format!("connecting to {}", cli.dest))?;
    let listener = transport.feedback_listener(Duration::from_millis(100))?;
    info!(
        local = %transport.local_addr()?,
        dest = %cli.dest,
        fps = config.stream.target_fps,
        preset = ?config.stream.latency_preset,
        "driftcast-node starting"
    );

    let encoder = SimulatedEncoder::new(
        EncoderModel {
            stall_chance: cli.stall_chance,
            ..EncoderModel::default()
        },
        cli.seed,
    );
    let capture = SyntheticCapture::new((cli.width, cli.height), cli.refresh_hz, cli.seed);

    let mut registry = StreamRegistry::new();
    let id = registry
        .start(config, target, Box::new(encoder), Box::new(capture), transport)
        .context("starting stream")?;

    let stop = Arc::new(AtomicBool::new(false));
    let (feedback_rx, relay) = spawn_feedback_relay(listener, stop.clone())?;

    let (shutdown_tx, shutdown_rx) = bounded(1);
    ctrlc::set_handler(move || {
        let _ = shutdown_tx.try_send(());
    })
    .context("installing signal handler")?;

    let started = Instant::now();
    let register_at = tick(Duration::from_millis(cli.register_delay_ms.max(1)));
    let mut registered = false;
    let mut scaled = cli.scale.is_none();
    let deadline = cli.duration_secs.map(Duration::from_secs);
    let housekeeping = tick(Duration::from_millis(250));
    let injected_loss = match cli.loss_feedback_every {
        Some(secs) => tick(Duration::from_secs(secs.max(1))),
        None => never(),
    };
    let metrics = match registry.get(id) {
        Some(runtime) => runtime.metrics_feed().clone(),
        None => never(),
    };

    loop {
        let register = if registered { never() } else { register_at.clone() };
        select! {
            recv(shutdown_rx) -> _ => {
                info!("received SIGINT, shutting down");
                break;
            }
            recv(register) -> _ => {
                if let Some(runtime) = registry.get(id) {
                    runtime.client_registered().context("registering client")?;
                    registered = true;
                    info!(stream_id = id, "client registered");
                }
            }
            recv(feedback_rx) -> feedback => {
                if let (Ok(feedback), Some(runtime)) = (feedback, registry.get(id)) {
                    runtime.quality_feedback(feedback)?;
                }
            }
            recv(injected_loss) -> _ => {
                if let Some(runtime) = registry.get(id) {
                    info!(stream_id = id, "injecting client loss report");
                    runtime.quality_feedback(QualityFeedback {
                        dropped_frames: 1,
                        buffer_health: 0.4,
                    })?;
                }
            }
            recv(metrics) -> snapshot => {
                if let Ok(snapshot) = snapshot {
                    println!("{}", serde_json::to_string(&snapshot)?);
                }
            }
            recv(housekeeping) -> _ => {
                let elapsed = started.elapsed();
                if deadline.is_some_and(|d| elapsed >= d) {
                    info!(?elapsed, "duration reached");
                    break;
                }
                if !scaled && elapsed >= Duration::from_secs(cli.scale_after_secs) {
                    scaled = true;
                    if let (Some(factor), Some(runtime)) = (cli.scale, registry.get(id)) {
                        if let Err(e) = runtime.reconfigure(Reconfiguration::Scale(factor)) {
                            warn!(error = %e, factor, "rescale failed");
                        }
                    }
                }
                if registry.get(id).is_some_and(|r| !r.is_running()) {
                    warn!(stream_id = id, "stream stopped unexpectedly");
                    break;
                }
            }
        }
    }

    if let Some(runtime) = registry.get(id) {
        if let Ok(snapshot) = runtime.metrics() {
            println!("{}", serde_json::to_string(&snapshot)?);
        }
    }
    registry.stop_all();
    stop.store(true, Ordering::Release);
    let _ = relay.join();
    info!("driftcast-node stopped");
    Ok(())
}
