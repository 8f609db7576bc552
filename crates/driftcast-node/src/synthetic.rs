//! Synthetic capture source and simulated encoder.
//!
//! Stand-ins for the platform capture and hardware encoder so a node can
//! stream without either. Both run their own threads, like the real things,
//! and drive the pipeline only through its public seams.

use bytes::Bytes;
use crossbeam_channel::{bounded, Receiver, Sender};
use quanta::Clock;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;
use tracing::{debug, warn};

use driftcast_stream::capture::{CaptureConfig, CaptureSource, CaptureTarget, FrameSink};
use driftcast_stream::encoder::{
    EncodeOptions, EncodedFrame, EncodedFrameSink, FrameTag, PixelFormat, VideoEncoder,
};
use driftcast_stream::error::{CaptureError, EncodeRejection, EncoderError};
use driftcast_stream::frame::{CapturedFrame, FrameMetadata, PixelBuffer, Rect};

/// Idle keepalive interval while the scene is static.
const IDLE_KEEPALIVE: Duration = Duration::from_secs(1);

// ─── Capture ────────────────────────────────────────────────────────────────

/// What the synthetic screen is doing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Scene {
    Static,
    Typing,
    Scrolling,
    Video,
}

impl Scene {
    fn pick(rng: &mut StdRng) -> Scene {
        match rng.random_range(0..10) {
            0..=2 => Scene::Static,
            3..=5 => Scene::Typing,
            6 => Scene::Scrolling,
            _ => Scene::Video,
        }
    }

    fn dirty_percentage(self, rng: &mut StdRng) -> f32 {
        match self {
            Scene::Static => 0.0,
            Scene::Typing => rng.random_range(0.5..4.0),
            Scene::Scrolling => rng.random_range(30.0..80.0),
            Scene::Video => rng.random_range(20.0..60.0),
        }
    }
}

/// Capture source producing frames with a random-walk motion profile.
///
/// With `refresh_hz` set the source runs at that rate regardless of the
/// stream's target, leaving rate control to the pipeline's throttle.
pub struct SyntheticCapture {
    base_size: (u32, u32),
    refresh_hz: Option<u32>,
    seed: u64,
    frame_rate: Arc<AtomicU32>,
    output: Arc<Mutex<(u32, u32)>>,
    stop: Arc<AtomicBool>,
    thread: Option<thread::JoinHandle<()>>,
}

impl SyntheticCapture {
    pub fn new(base_size: (u32, u32), refresh_hz: Option<u32>, seed: u64) -> Self {
        SyntheticCapture {
            base_size,
            refresh_hz,
            seed,
            frame_rate: Arc::new(AtomicU32::new(60)),
            output: Arc::new(Mutex::new(base_size)),
            stop: Arc::new(AtomicBool::new(false)),
            thread: None,
        }
    }

    fn size_of(&self, target: &CaptureTarget) -> Result<(u32, u32), CaptureError> {
        match target {
            CaptureTarget::Display(0) => Ok(self.base_size),
            CaptureTarget::Display(id) => Err(CaptureError::TargetUnavailable(format!(
                "display {id}"
            ))),
            // Windows are a quarter of the display.
            CaptureTarget::Window(_) => Ok((self.base_size.0 / 2, self.base_size.1 / 2)),
        }
    }
}

impl CaptureSource for SyntheticCapture {
    fn base_size(&self, target: &CaptureTarget) -> Result<(u32, u32), CaptureError> {
        self.size_of(target)
    }

    fn start(&mut self, config: &CaptureConfig, sink: FrameSink) -> Result<(), CaptureError> {
        self.size_of(&config.target)?;
        self.stop();
        self.frame_rate.store(config.frame_rate, Ordering::Release);
        *self.output.lock().unwrap_or_else(|e| e.into_inner()) =
            (config.output_width, config.output_height);
        self.stop.store(false, Ordering::Release);

        let producer = FrameProducer {
            sink,
            refresh_hz: self.refresh_hz,
            frame_rate: self.frame_rate.clone(),
            output: self.output.clone(),
            stop: self.stop.clone(),
            rng: StdRng::seed_from_u64(self.seed),
        };
        let handle = thread::Builder::new()
            .name("synthetic-capture".into())
            .spawn(move || producer.run())
            .map_err(|e| CaptureError::Start(e.to_string()))?;
        self.thread = Some(handle);
        debug!(
            capture = ?config.target,
            width = config.output_width,
            height = config.output_height,
            "synthetic capture started"
        );
        Ok(())
    }

    fn stop(&mut self) {
        if let Some(handle) = self.thread.take() {
            self.stop.store(true, Ordering::Release);
            let _ = handle.join();
        }
    }

    fn update_frame_rate(&mut self, frame_rate: u32) -> Result<(), CaptureError> {
        self.frame_rate.store(frame_rate.max(1), Ordering::Release);
        Ok(())
    }

    fn update_output_size(&mut self, width: u32, height: u32) -> Result<(), CaptureError> {
        if width == 0 || height == 0 {
            return Err(CaptureError::Reconfigure(format!("{width}x{height}")));
        }
        *self.output.lock().unwrap_or_else(|e| e.into_inner()) = (width, height);
        Ok(())
    }

    fn switch_target(&mut self, target: &CaptureTarget) -> Result<(), CaptureError> {
        self.size_of(target).map(|_| ())
    }

    fn is_paced(&self) -> bool {
        self.refresh_hz.is_none()
    }
}

impl Drop for SyntheticCapture {
    fn drop(&mut self) {
        self.stop();
    }
}

struct FrameProducer {
    sink: FrameSink,
    refresh_hz: Option<u32>,
    frame_rate: Arc<AtomicU32>,
    output: Arc<Mutex<(u32, u32)>>,
    stop: Arc<AtomicBool>,
    rng: StdRng,
}

impl FrameProducer {
    fn run(mut self) {
        let clock = Clock::new();
        let started = clock.now();
        let mut scene = Scene::Typing;
        let mut scene_until = started + Duration::from_secs(2);
        let mut last_keepalive = started;

        while !self.stop.load(Ordering::Acquire) {
            let hz = self
                .refresh_hz
                .unwrap_or_else(|| self.frame_rate.load(Ordering::Acquire))
                .max(1);
            let interval = Duration::from_secs_f64(1.0 / hz as f64);
            thread::sleep(interval);

            let now = clock.now();
            if now >= scene_until {
                scene = Scene::pick(&mut self.rng);
                scene_until = now + Duration::from_millis(self.rng.random_range(1_000..5_000));
                debug!(?scene, "synthetic scene change");
            }

            let idle = scene == Scene::Static;
            if idle {
                if now.duration_since(last_keepalive) < IDLE_KEEPALIVE {
                    continue;
                }
                last_keepalive = now;
            }

            let (width, height) = *self.output.lock().unwrap_or_else(|e| e.into_inner());
            let content = Rect::new(
                0,
                0,
                width.min(u16::MAX as u32) as u16,
                height.min(u16::MAX as u32) as u16,
            );
            let metadata = FrameMetadata {
                content_rect: content,
                dirty_rects: if idle { Vec::new() } else { vec![content] },
                dirty_percentage: scene.dirty_percentage(&mut self.rng),
                is_idle: idle,
                wants_keyframe: false,
            };
            let frame = CapturedFrame::new(
                PixelBuffer::new(width, height, Bytes::new()),
                now.duration_since(started),
                interval,
                metadata,
            );
            self.sink.push(frame);
        }
    }
}

// ─── Encoder ────────────────────────────────────────────────────────────────

/// Tunables of the simulated encoder.
#[derive(Debug, Clone, Copy)]
pub struct EncoderModel {
    /// Compressed bytes per pixel for a keyframe at quality 1.0.
    pub keyframe_bytes_per_pixel: f64,
    /// Compressed bytes per changed pixel for a delta frame at quality 1.0.
    pub delta_bytes_per_pixel: f64,
    /// Encode latency per megapixel.
    pub latency_per_megapixel: Duration,
    /// Chance that a frame hangs the encoder for `stall`.
    pub stall_chance: f64,
    pub stall: Duration,
}

impl Default for EncoderModel {
    fn default() -> Self {
        EncoderModel {
            keyframe_bytes_per_pixel: 0.08,
            delta_bytes_per_pixel: 0.05,
            latency_per_megapixel: Duration::from_micros(1_500),
            stall_chance: 0.0,
            stall: Duration::from_millis(600),
        }
    }
}

struct Job {
    width: u32,
    height: u32,
    pts: Duration,
    keyframe: bool,
    dirty: f64,
    idle: bool,
    quality: f32,
    tag: FrameTag,
    flush_epoch: u64,
}

#[derive(Default)]
struct EncoderState {
    pending: AtomicUsize,
    flush_epoch: AtomicU64,
    average_us: AtomicU64,
}

struct Session {
    width: u32,
    height: u32,
    output: Arc<dyn EncodedFrameSink>,
    jobs: Option<Sender<Job>>,
    thread: Option<thread::JoinHandle<()>>,
}

impl Session {
    fn close(&mut self) {
        self.jobs.take();
        if let Some(handle) = self.thread.take() {
            let _ = handle.join();
        }
    }
}

/// Encoder that sleeps for a plausible encode time and emits random-sized
/// access units.
pub struct SimulatedEncoder {
    model: EncoderModel,
    seed: u64,
    session: Option<Session>,
    state: Arc<EncoderState>,
    quality: f32,
    in_flight_limit: usize,
    force_next: bool,
    sessions_created: u64,
}

impl SimulatedEncoder {
    pub fn new(model: EncoderModel, seed: u64) -> Self {
        SimulatedEncoder {
            model,
            seed,
            session: None,
            state: Arc::new(EncoderState::default()),
            quality: 0.8,
            in_flight_limit: 1,
            force_next: true,
            sessions_created: 0,
        }
    }

    fn open(&mut self, width: u32, height: u32, output: Arc<dyn EncodedFrameSink>) -> Result<(), EncoderError> {
        if width == 0 || height == 0 || width > 8192 || height > 8192 {
            return Err(EncoderError::UnsupportedDimensions { width, height });
        }
        let (tx, rx) = bounded(16);
        let worker = EncodeWorker {
            rx,
            output: output.clone(),
            state: self.state.clone(),
            model: self.model,
            rng: StdRng::seed_from_u64(self.seed.wrapping_add(self.sessions_created)),
        };
        let thread = thread::Builder::new()
            .name("simulated-encoder".into())
            .spawn(move || worker.run())
            .map_err(|e| EncoderError::SessionCreate(e.to_string()))?;
        self.sessions_created += 1;
        self.state.pending.store(0, Ordering::Release);
        self.force_next = true;
        self.session = Some(Session {
            width,
            height,
            output,
            jobs: Some(tx),
            thread: Some(thread),
        });
        Ok(())
    }

    fn close(&mut self) {
        if let Some(mut session) = self.session.take() {
            self.state.flush_epoch.fetch_add(1, Ordering::AcqRel);
            session.close();
        }
    }
}

impl VideoEncoder for SimulatedEncoder {
    fn create_session(
        &mut self,
        width: u32,
        height: u32,
        output: Arc<dyn EncodedFrameSink>,
    ) -> Result<(), EncoderError> {
        self.close();
        self.open(width, height, output)
    }

    fn update_dimensions(&mut self, width: u32, height: u32) -> Result<(), EncoderError> {
        let output = self
            .session
            .as_ref()
            .map(|s| s.output.clone())
            .ok_or(EncoderError::NoSession)?;
        self.close();
        self.open(width, height, output)
    }

    fn update_quality(&mut self, quality: f32) {
        self.quality = quality.clamp(0.05, 1.0);
    }

    fn update_in_flight_limit(&mut self, limit: usize) {
        self.in_flight_limit = limit.max(1);
    }

    fn flush(&mut self) {
        self.state.flush_epoch.fetch_add(1, Ordering::AcqRel);
    }

    fn reset(&mut self) -> Result<(), EncoderError> {
        let (width, height, output) = self
            .session
            .as_ref()
            .map(|s| (s.width, s.height, s.output.clone()))
            .ok_or(EncoderError::NoSession)?;
        warn!(width, height, "simulated encoder reset");
        self.close();
        self.open(width, height, output)
            .map_err(|e| EncoderError::Reset(e.to_string()))
    }

    fn force_keyframe(&mut self) {
        self.force_next = true;
    }

    fn active_pixel_format(&self) -> PixelFormat {
        PixelFormat::Nv12
    }

    fn average_encode_time(&self) -> Option<Duration> {
        match self.state.average_us.load(Ordering::Acquire) {
            0 => None,
            us => Some(Duration::from_micros(us)),
        }
    }

    fn encode(&mut self, frame: &CapturedFrame, options: EncodeOptions) -> Result<(), EncodeRejection> {
        let session = self.session.as_ref().ok_or(EncodeRejection::NoSession)?;
        if frame.buffer.width != session.width || frame.buffer.height != session.height {
            return Err(EncodeRejection::DimensionMismatch);
        }
        if self.state.pending.load(Ordering::Acquire) >= self.in_flight_limit {
            return Err(EncodeRejection::QueueFull);
        }
        let jobs = session.jobs.as_ref().ok_or(EncodeRejection::Inactive)?;
        let job = Job {
            width: session.width,
            height: session.height,
            pts: frame.pts,
            keyframe: options.force_keyframe || self.force_next,
            dirty: frame.metadata.dirty_fraction(),
            idle: frame.is_idle(),
            quality: if options.quality > 0.0 { options.quality } else { self.quality },
            tag: options.tag,
            flush_epoch: self.state.flush_epoch.load(Ordering::Acquire),
        };
        self.state.pending.fetch_add(1, Ordering::AcqRel);
        if jobs.try_send(job).is_err() {
            self.state.pending.fetch_sub(1, Ordering::AcqRel);
            return Err(EncodeRejection::QueueFull);
        }
        self.force_next = false;
        Ok(())
    }

    fn teardown(&mut self) {
        self.close();
    }
}

impl Drop for SimulatedEncoder {
    fn drop(&mut self) {
        self.close();
    }
}

struct EncodeWorker {
    rx: Receiver<Job>,
    output: Arc<dyn EncodedFrameSink>,
    state: Arc<EncoderState>,
    model: EncoderModel,
    rng: StdRng,
}

impl EncodeWorker {
    fn run(mut self) {
        while let Ok(job) = self.rx.recv() {
            let started = std::time::Instant::now();
            let megapixels = (job.width as f64 * job.height as f64) / 1e6;
            let mut latency = self.model.latency_per_megapixel.mul_f64(megapixels);
            if job.keyframe {
                latency *= 2;
            }
            latency = latency.mul_f64(self.rng.random_range(0.8..1.3));
            if self.rng.random_bool(self.model.stall_chance.clamp(0.0, 1.0)) {
                debug!(stall = ?self.model.stall, "simulated encoder stall");
                latency += self.model.stall;
            }
            thread::sleep(latency);

            if job.flush_epoch == self.state.flush_epoch.load(Ordering::Acquire) {
                let bytes = self.frame_bytes(&job);
                self.output.frame_encoded(EncodedFrame {
                    data: Bytes::from(vec![(bytes & 0xFF) as u8; bytes]),
                    is_keyframe: job.keyframe,
                    pts: job.pts,
                    has_parameter_sets: job.keyframe,
                    tag: job.tag,
                });
            }
            self.record(started.elapsed());
            self.state.pending.fetch_sub(1, Ordering::AcqRel);
            self.output.frame_drained(job.tag);
        }
    }

    fn frame_bytes(&mut self, job: &Job) -> usize {
        let pixels = job.width as f64 * job.height as f64;
        let quality = (job.quality as f64).clamp(0.05, 1.0);
        let noise = self.rng.random_range(0.85..1.15);
        let bytes = if job.keyframe {
            pixels * self.model.keyframe_bytes_per_pixel * quality * quality
        } else if job.idle {
            120.0
        } else {
            pixels * self.model.delta_bytes_per_pixel * job.dirty.max(0.002) * quality
        };
        (bytes * noise).max(64.0) as usize
    }

    fn record(&self, sample: Duration) {
        let sample = sample.as_micros() as u64;
        let _ = self
            .state
            .average_us
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |avg| {
                Some(if avg == 0 { sample } else { (avg * 7 + sample) / 8 })
            });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quanta::Instant;

    #[derive(Default)]
    struct Collect {
        frames: Mutex<Vec<EncodedFrame>>,
        drained: AtomicUsize,
    }

    impl EncodedFrameSink for Collect {
        fn frame_encoded(&self, frame: EncodedFrame) {
            self.frames.lock().unwrap().push(frame);
        }

        fn frame_drained(&self, _tag: FrameTag) {
            self.drained.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn options(force: bool) -> EncodeOptions {
        EncodeOptions {
            force_keyframe: force,
            quality: 0.8,
            tag: FrameTag {
                generation: 0,
                epoch: 0,
                submitted_at: Instant::now(),
                forced_keyframe: force,
                idle: false,
            },
        }
    }

    fn frame(width: u32, height: u32, dirty: f32) -> CapturedFrame {
        CapturedFrame::new(
            PixelBuffer::new(width, height, Bytes::new()),
            Duration::ZERO,
            Duration::from_millis(16),
            FrameMetadata {
                dirty_percentage: dirty,
                ..FrameMetadata::default()
            },
        )
    }

    fn wait_for(collect: &Collect, drained: usize) {
        for _ in 0..200 {
            if collect.drained.load(Ordering::SeqCst) >= drained {
                return;
            }
            thread::sleep(Duration::from_millis(5));
        }
        panic!("encoder did not drain {drained} frames");
    }

    #[test]
    fn first_frame_is_a_keyframe_and_larger() {
        let collect = Arc::new(Collect::default());
        let mut enc = SimulatedEncoder::new(EncoderModel::default(), 1);
        enc.create_session(640, 360, collect.clone()).unwrap();
        enc.encode(&frame(640, 360, 5.0), options(false)).unwrap();
        wait_for(&collect, 1);
        enc.encode(&frame(640, 360, 5.0), options(false)).unwrap();
        wait_for(&collect, 2);

        let frames = collect.frames.lock().unwrap();
        assert!(frames[0].is_keyframe && frames[0].has_parameter_sets);
        assert!(!frames[1].is_keyframe);
        assert!(frames[0].data.len() > frames[1].data.len());
        assert!(enc.average_encode_time().is_some());
    }

    #[test]
    fn in_flight_limit_and_dimensions_are_enforced() {
        let collect = Arc::new(Collect::default());
        let mut enc = SimulatedEncoder::new(
            EncoderModel {
                latency_per_megapixel: Duration::from_millis(200),
                ..EncoderModel::default()
            },
            2,
        );
        assert_eq!(
            enc.encode(&frame(640, 360, 5.0), options(false)).unwrap_err(),
            EncodeRejection::NoSession
        );
        enc.create_session(640, 360, collect.clone()).unwrap();
        assert_eq!(
            enc.encode(&frame(320, 180, 5.0), options(false)).unwrap_err(),
            EncodeRejection::DimensionMismatch
        );
        enc.encode(&frame(640, 360, 5.0), options(false)).unwrap();
        assert_eq!(
            enc.encode(&frame(640, 360, 5.0), options(false)).unwrap_err(),
            EncodeRejection::QueueFull
        );
        wait_for(&collect, 1);
    }

    #[test]
    fn flushed_frames_drain_without_output() {
        let collect = Arc::new(Collect::default());
        let mut enc = SimulatedEncoder::new(
            EncoderModel {
                latency_per_megapixel: Duration::from_millis(100),
                ..EncoderModel::default()
            },
            3,
        );
        enc.create_session(640, 360, collect.clone()).unwrap();
        enc.encode(&frame(640, 360, 5.0), options(true)).unwrap();
        enc.flush();
        wait_for(&collect, 1);
        assert!(collect.frames.lock().unwrap().is_empty());
    }

    #[test]
    fn unknown_display_is_unavailable() {
        let capture = SyntheticCapture::new((1920, 1080), None, 0);
        assert_eq!(capture.base_size(&CaptureTarget::Display(0)).unwrap(), (1920, 1080));
        assert_eq!(capture.base_size(&CaptureTarget::Window(9)).unwrap(), (960, 540));
        assert!(capture.base_size(&CaptureTarget::Display(3)).is_err());
        assert!(capture.is_paced());
    }
}
