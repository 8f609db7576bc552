use crossbeam_channel::{bounded, select, tick, unbounded, Receiver, Sender};
use quanta::Clock;
use std::thread;
use std::time::Duration;
use tracing::{debug, warn};

use crate::capture::{CaptureSource, CaptureTarget};
use crate::config::StreamConfig;
use crate::encoder::VideoEncoder;
use crate::error::{StreamError, StreamResult};
use crate::pipeline::controller::{Reconfiguration, StreamController};
use crate::sender::{PacketSender, PacketTransport, SenderHandle};
use crate::stats::StreamMetrics;
use crate::wire::QualityFeedback;

type BoxedController = StreamController<Box<dyn VideoEncoder>, Box<dyn CaptureSource>>;

/// Timer resolution for stall detection and keyframe cadence.
const TICK_INTERVAL: Duration = Duration::from_millis(25);

/// Control messages sent to the stream worker (infrequent).
enum Command {
    ClientRegistered(Sender<StreamResult<()>>),
    ClientUnregistered,
    Reconfigure(Reconfiguration, Sender<StreamResult<()>>),
    Feedback(QualityFeedback),
    RequestKeyframe(&'static str),
    Metrics(Sender<StreamMetrics>),
    Stop(Sender<()>),
}

/// Thread-safe handle to one running stream.
///
/// Owns two threads: the stream worker, which runs the
/// [`StreamController`] loop over capture wake-ups, encoder events, control
/// messages and a timer, and the stream's [`PacketSender`].
///
/// Dropping the runtime stops the stream and joins both threads.
pub struct StreamRuntime {
    id: u16,
    control_tx: Sender<Command>,
    metrics_rx: Receiver<StreamMetrics>,
    sender: PacketSender,
    handle: Option<thread::JoinHandle<()>>,
}

impl StreamRuntime {
    /// Start capturing `target` and spawn the stream's threads. Encoding
    /// begins once [`client_registered`](Self::client_registered) is called.
    pub fn start<T: PacketTransport + 'static>(
        id: u16,
        config: StreamConfig,
        target: CaptureTarget,
        encoder: Box<dyn VideoEncoder>,
        capture: Box<dyn CaptureSource>,
        transport: T,
    ) -> StreamResult<Self> {
        let sender = PacketSender::spawn(id, &config.sender, transport)?;
        let (wake_tx, wake_rx) = bounded(1);
        let (metrics_tx, metrics_rx) = bounded(16);
        let mut controller: BoxedController = StreamController::new(
            id,
            config,
            encoder,
            capture,
            sender.handle(),
            Clock::new(),
            wake_tx,
        );
        controller.set_metrics_observer(metrics_tx);
        controller.start(target)?;

        let (control_tx, control_rx) = unbounded();
        let handle = thread::Builder::new()
            .name(format!("driftcast-stream-{id}"))
            .spawn(move || stream_worker(controller, wake_rx, control_rx))?;

        Ok(StreamRuntime {
            id,
            control_tx,
            metrics_rx,
            sender,
            handle: Some(handle),
        })
    }

    pub fn id(&self) -> u16 {
        self.id
    }

    /// Handle to the stream's packet sender.
    pub fn sender(&self) -> SenderHandle {
        self.sender.handle()
    }

    /// Periodic metric snapshots. Snapshots are dropped when nobody reads.
    pub fn metrics_feed(&self) -> &Receiver<StreamMetrics> {
        &self.metrics_rx
    }

    pub fn client_registered(&self) -> StreamResult<()> {
        let (tx, rx) = bounded(1);
        self.send(Command::ClientRegistered(tx))?;
        rx.recv().map_err(|_| StreamError::Disconnected)?
    }

    pub fn client_unregistered(&self) -> StreamResult<()> {
        self.send(Command::ClientUnregistered)
    }

    /// Apply a reconfiguration and wait for it. A failed reconfiguration
    /// leaves the stream stopped.
    pub fn reconfigure(&self, change: Reconfiguration) -> StreamResult<()> {
        let (tx, rx) = bounded(1);
        self.send(Command::Reconfigure(change, tx))?;
        rx.recv().map_err(|_| StreamError::Disconnected)?
    }

    pub fn quality_feedback(&self, feedback: QualityFeedback) -> StreamResult<()> {
        self.send(Command::Feedback(feedback))
    }

    pub fn request_keyframe(&self, reason: &'static str) -> StreamResult<()> {
        self.send(Command::RequestKeyframe(reason))
    }

    /// Current metrics snapshot.
    pub fn metrics(&self) -> StreamResult<StreamMetrics> {
        let (tx, rx) = bounded(1);
        self.send(Command::Metrics(tx))?;
        rx.recv().map_err(|_| StreamError::Disconnected)
    }

    /// Stop the stream and join its threads. Nothing is sent afterwards.
    /// Idempotent.
    pub fn stop(&mut self) {
        if let Some(handle) = self.handle.take() {
            let (tx, rx) = bounded(1);
            if self.control_tx.send(Command::Stop(tx)).is_ok() {
                let _ = rx.recv();
            }
            let _ = handle.join();
            self.sender.shutdown();
        }
    }

    pub fn is_running(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }

    fn send(&self, cmd: Command) -> StreamResult<()> {
        self.control_tx
            .send(cmd)
            .map_err(|_| StreamError::Disconnected)
    }
}

impl Drop for StreamRuntime {
    fn drop(&mut self) {
        self.stop();
    }
}

fn stream_worker(
    mut controller: BoxedController,
    wake_rx: Receiver<()>,
    control_rx: Receiver<Command>,
) {
    let events = controller.events().clone();
    let ticker = tick(TICK_INTERVAL);

    loop {
        select! {
            recv(wake_rx) -> _ => {}
            recv(events) -> event => {
                if let Ok(event) = event {
                    controller.handle_event(event);
                }
            }
            recv(control_rx) -> cmd => match cmd {
                Ok(Command::Stop(reply)) => {
                    controller.stop();
                    let _ = reply.send(());
                    break;
                }
                Ok(cmd) => apply_command(&mut controller, cmd),
                Err(_) => {
                    controller.stop();
                    break;
                }
            },
            recv(ticker) -> _ => {
                controller.tick();
            }
        }
        controller.drain_events();
        if controller.pump() > 0 {
            // Synchronous encoders complete inside `encode`.
            controller.drain_events();
        }
    }
    debug!(stream_id = controller.id(), "stream worker exiting");
}

fn apply_command(controller: &mut BoxedController, cmd: Command) {
    match cmd {
        Command::ClientRegistered(reply) => {
            let _ = reply.send(controller.client_registered());
        }
        Command::ClientUnregistered => controller.client_unregistered(),
        Command::Reconfigure(change, reply) => {
            let result = controller.reconfigure(change);
            if let Err(e) = &result {
                warn!(stream_id = controller.id(), error = %e, "reconfiguration rejected");
            }
            let _ = reply.send(result);
        }
        Command::Feedback(feedback) => controller.quality_feedback(&feedback),
        Command::RequestKeyframe(reason) => {
            let outcome = controller.request_keyframe(reason, false);
            debug!(stream_id = controller.id(), reason, ?outcome, "keyframe requested");
        }
        Command::Metrics(reply) => {
            let _ = reply.send(controller.metrics());
        }
        // Handled by the worker loop.
        Command::Stop(reply) => {
            let _ = reply.send(());
        }
    }
}
