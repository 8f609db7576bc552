//! Stream configuration.
//!
//! TOML is deserialized into `*Input` structs whose fields are all optional,
//! then [`StreamConfigInput::resolve`] validates ranges and fills defaults.
//! Every empirically tuned threshold (stall timeout, backpressure bytes,
//! pacing bursts) lives here rather than in the components.

use std::time::Duration;

use serde::Deserialize;

use crate::error::ConfigError;

pub const CONFIG_VERSION: u32 = 1;

/// Latency/smoothness trade-off selected for the stream.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum LatencyPreset {
    /// Single-slot inbox, in-flight depth pinned to 1 (2 at ≥120 fps).
    LowLatency,
    #[default]
    Balanced,
    /// Deeper inbox, tolerates encoder jitter at the cost of latency.
    Smooth,
}

// ─── Input (TOML) ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct StreamConfigInput {
    pub version: u32,
    pub stream: StreamSectionInput,
    pub encoder: EncoderSectionInput,
    pub keyframe: KeyframeSectionInput,
    pub quality: QualitySectionInput,
    pub backpressure: BackpressureSectionInput,
    pub sender: SenderSectionInput,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct StreamSectionInput {
    pub target_fps: Option<u32>,
    pub keyframe_interval_frames: Option<u32>,
    pub quality: Option<f32>,
    pub keyframe_quality: Option<f32>,
    pub latency_preset: Option<LatencyPreset>,
    pub maintain_idle_cadence: Option<bool>,
    pub max_encoded_dimension: Option<u32>,
    pub scale: Option<f64>,
    pub metrics_interval_ms: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct EncoderSectionInput {
    pub stall_timeout_ms: Option<u64>,
    pub reset_cooldown_ms: Option<u64>,
    pub max_in_flight: Option<usize>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct KeyframeSectionInput {
    pub cooldown_ms: Option<u64>,
    pub urgent_cooldown_ms: Option<u64>,
    pub in_flight_window_ms: Option<u64>,
    pub settle_fraction: Option<f64>,
    pub deadline_ms: Option<u64>,
    pub motion_threshold: Option<f64>,
    pub keyframe_quality_floor: Option<f32>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct QualitySectionInput {
    pub floor_ratio: Option<f32>,
    pub over_budget_samples: Option<u32>,
    pub under_budget_samples: Option<u32>,
    pub step_down: Option<f32>,
    pub step_down_high_pressure: Option<f32>,
    pub step_up: Option<f32>,
    pub cooldown_ms: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct BackpressureSectionInput {
    pub pressure_bytes: Option<usize>,
    pub hard_cap_bytes: Option<usize>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct SenderSectionInput {
    pub max_payload_size: Option<usize>,
    pub loss_mode_ms: Option<u64>,
    pub pool_max_cached: Option<usize>,
    pub pacing: Vec<PacingTierInput>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct PacingTierInput {
    pub min_bytes: usize,
    pub burst: usize,
    pub delay_us: u64,
}

// ─── Resolved ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct StreamSettings {
    pub target_fps: u32,
    pub keyframe_interval_frames: u32,
    pub quality: f32,
    pub keyframe_quality: f32,
    pub latency_preset: LatencyPreset,
    pub maintain_idle_cadence: bool,
    pub max_encoded_dimension: u32,
    pub scale: f64,
    pub metrics_interval: Duration,
}

impl Default for StreamSettings {
    fn default() -> Self {
        Self {
            target_fps: 60,
            keyframe_interval_frames: 120,
            quality: 0.8,
            keyframe_quality: 0.7,
            latency_preset: LatencyPreset::Balanced,
            maintain_idle_cadence: false,
            max_encoded_dimension: 5120,
            scale: 1.0,
            metrics_interval: Duration::from_secs(2),
        }
    }
}

#[derive(Debug, Clone)]
pub struct EncoderSettings {
    /// Explicit stall timeout. `None` derives one from the frame rate.
    pub stall_timeout: Option<Duration>,
    pub reset_cooldown: Duration,
    pub max_in_flight: usize,
}

impl Default for EncoderSettings {
    fn default() -> Self {
        Self {
            stall_timeout: None,
            reset_cooldown: Duration::from_secs(1),
            max_in_flight: 3,
        }
    }
}

#[derive(Debug, Clone)]
pub struct KeyframeSettings {
    /// Minimum spacing between non-urgent requests.
    pub cooldown: Duration,
    /// Minimum spacing between urgent requests.
    pub urgent_cooldown: Duration,
    /// Window after a keyframe was queued/forced during which in-flight
    /// checked requests are ignored.
    pub in_flight_window: Duration,
    /// Fraction of the backpressure threshold the queue must fall under
    /// before a non-urgent keyframe is emitted.
    pub settle_fraction: f64,
    /// Longest a non-urgent request may wait for the queue to settle.
    pub deadline: Duration,
    /// Smoothed dirty fraction above which motion counts as high.
    pub motion_threshold: f64,
    pub keyframe_quality_floor: f32,
}

impl Default for KeyframeSettings {
    fn default() -> Self {
        Self {
            cooldown: Duration::from_secs(1),
            urgent_cooldown: Duration::from_millis(250),
            in_flight_window: Duration::from_millis(500),
            settle_fraction: 0.25,
            deadline: Duration::from_millis(750),
            motion_threshold: 0.25,
            keyframe_quality_floor: 0.3,
        }
    }
}

#[derive(Debug, Clone)]
pub struct QualitySettings {
    pub floor_ratio: f32,
    pub over_budget_samples: u32,
    pub under_budget_samples: u32,
    pub step_down: f32,
    pub step_down_high_pressure: f32,
    pub step_up: f32,
    pub cooldown: Duration,
}

impl Default for QualitySettings {
    fn default() -> Self {
        Self {
            floor_ratio: 0.6,
            over_budget_samples: 2,
            under_budget_samples: 3,
            step_down: 0.04,
            step_down_high_pressure: 0.10,
            step_up: 0.02,
            cooldown: Duration::from_millis(250),
        }
    }
}

#[derive(Debug, Clone)]
pub struct BackpressureSettings {
    /// Queue bytes below which an active backpressure episode clears.
    pub pressure_bytes: usize,
    /// Queue bytes above which frames start being dropped.
    pub hard_cap_bytes: usize,
}

impl Default for BackpressureSettings {
    fn default() -> Self {
        Self {
            pressure_bytes: 1024 * 1024,
            hard_cap_bytes: 4 * 1024 * 1024,
        }
    }
}

/// One row of the pacing table: frames of at least `min_bytes` wire bytes
/// are sent `burst` fragments at a time with `delay` between bursts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacingTier {
    pub min_bytes: usize,
    pub burst: usize,
    pub delay: Duration,
}

#[derive(Debug, Clone)]
pub struct SenderSettings {
    pub max_payload_size: usize,
    pub loss_mode: Duration,
    pub pool_max_cached: usize,
    /// Sorted by `min_bytes`, largest first. The last tier is the fallback.
    pub pacing: Vec<PacingTier>,
}

impl SenderSettings {
    pub fn default_pacing() -> Vec<PacingTier> {
        vec![
            PacingTier {
                min_bytes: 1024 * 1024,
                burst: 8,
                delay: Duration::from_micros(1000),
            },
            PacingTier {
                min_bytes: 256 * 1024,
                burst: 16,
                delay: Duration::from_micros(500),
            },
            PacingTier {
                min_bytes: 64 * 1024,
                burst: 24,
                delay: Duration::from_micros(250),
            },
            PacingTier {
                min_bytes: 0,
                burst: 32,
                delay: Duration::from_micros(250),
            },
        ]
    }
}

impl Default for SenderSettings {
    fn default() -> Self {
        Self {
            max_payload_size: 1200,
            loss_mode: Duration::from_secs(3),
            pool_max_cached: 512,
            pacing: Self::default_pacing(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct StreamConfig {
    pub version: u32,
    pub stream: StreamSettings,
    pub encoder: EncoderSettings,
    pub keyframe: KeyframeSettings,
    pub quality: QualitySettings,
    pub backpressure: BackpressureSettings,
    pub sender: SenderSettings,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            version: CONFIG_VERSION,
            stream: StreamSettings::default(),
            encoder: EncoderSettings::default(),
            keyframe: KeyframeSettings::default(),
            quality: QualitySettings::default(),
            backpressure: BackpressureSettings::default(),
            sender: SenderSettings::default(),
        }
    }
}

impl StreamConfig {
    pub fn from_toml_str(input: &str) -> Result<Self, ConfigError> {
        if input.trim().is_empty() {
            return Ok(StreamConfig::default());
        }
        let parsed: StreamConfigInput = toml::from_str(input)?;
        parsed.resolve()
    }

    /// Time budget for one frame at the target rate.
    pub fn frame_budget(&self) -> Duration {
        frame_interval(self.stream.target_fps)
    }

    /// Encoder stall timeout: explicit, or twelve frame intervals clamped to
    /// 200–900 ms.
    pub fn stall_timeout(&self) -> Duration {
        self.encoder.stall_timeout.unwrap_or_else(|| {
            (self.frame_budget() * 12).clamp(Duration::from_millis(200), Duration::from_millis(900))
        })
    }

    /// Number of real frames the inbox may hold. Only `smooth` queues more
    /// than one; every other preset coalesces into a single slot.
    pub fn inbox_capacity(&self) -> usize {
        match self.stream.latency_preset {
            LatencyPreset::LowLatency | LatencyPreset::Balanced => 1,
            // Above 60 fps a third slot buys nothing but latency.
            LatencyPreset::Smooth if self.stream.target_fps > 60 => 2,
            LatencyPreset::Smooth => 3,
        }
    }
}

/// Nominal interval between frames at `fps` (minimum 1 fps).
pub fn frame_interval(fps: u32) -> Duration {
    Duration::from_nanos(NANOS_PER_SEC / u64::from(fps.max(1)))
}

const NANOS_PER_SEC: u64 = 1_000_000_000;

fn ms(value: Option<u64>, default: Duration) -> Duration {
    value.map(Duration::from_millis).unwrap_or(default)
}

fn check_unit(field: &'static str, value: f32) -> Result<f32, ConfigError> {
    if value > 0.0 && value <= 1.0 {
        Ok(value)
    } else {
        Err(ConfigError::OutOfRange {
            field,
            detail: format!("{value} not in (0, 1]"),
        })
    }
}

impl StreamConfigInput {
    pub fn resolve(self) -> Result<StreamConfig, ConfigError> {
        let version = if self.version == 0 {
            CONFIG_VERSION
        } else {
            self.version
        };
        if version != CONFIG_VERSION {
            return Err(ConfigError::Version(version));
        }

        let d = StreamSettings::default();
        let s = self.stream;
        let target_fps = s.target_fps.unwrap_or(d.target_fps);
        if !(1..=240).contains(&target_fps) {
            return Err(ConfigError::OutOfRange {
                field: "stream.target_fps",
                detail: format!("{target_fps} not in 1..=240"),
            });
        }
        let scale = s.scale.unwrap_or(d.scale);
        if !(scale > 0.0 && scale <= 4.0) {
            return Err(ConfigError::OutOfRange {
                field: "stream.scale",
                detail: format!("{scale} not in (0, 4]"),
            });
        }
        let stream = StreamSettings {
            target_fps,
            keyframe_interval_frames: s
                .keyframe_interval_frames
                .unwrap_or(d.keyframe_interval_frames)
                .max(1),
            quality: check_unit("stream.quality", s.quality.unwrap_or(d.quality))?,
            keyframe_quality: check_unit(
                "stream.keyframe_quality",
                s.keyframe_quality.unwrap_or(d.keyframe_quality),
            )?,
            latency_preset: s.latency_preset.unwrap_or(d.latency_preset),
            maintain_idle_cadence: s.maintain_idle_cadence.unwrap_or(d.maintain_idle_cadence),
            max_encoded_dimension: s
                .max_encoded_dimension
                .unwrap_or(d.max_encoded_dimension)
                .max(16),
            scale,
            metrics_interval: ms(s.metrics_interval_ms, d.metrics_interval),
        };

        let d = EncoderSettings::default();
        let encoder = EncoderSettings {
            stall_timeout: self.encoder.stall_timeout_ms.map(Duration::from_millis),
            reset_cooldown: ms(self.encoder.reset_cooldown_ms, d.reset_cooldown),
            max_in_flight: self.encoder.max_in_flight.unwrap_or(d.max_in_flight).clamp(1, 8),
        };

        let d = KeyframeSettings::default();
        let k = self.keyframe;
        let keyframe = KeyframeSettings {
            cooldown: ms(k.cooldown_ms, d.cooldown),
            urgent_cooldown: ms(k.urgent_cooldown_ms, d.urgent_cooldown),
            in_flight_window: ms(k.in_flight_window_ms, d.in_flight_window),
            settle_fraction: k.settle_fraction.unwrap_or(d.settle_fraction).clamp(0.0, 1.0),
            deadline: ms(k.deadline_ms, d.deadline),
            motion_threshold: k.motion_threshold.unwrap_or(d.motion_threshold).clamp(0.0, 1.0),
            keyframe_quality_floor: check_unit(
                "keyframe.keyframe_quality_floor",
                k.keyframe_quality_floor.unwrap_or(d.keyframe_quality_floor),
            )?,
        };

        let d = QualitySettings::default();
        let q = self.quality;
        let quality = QualitySettings {
            floor_ratio: check_unit("quality.floor_ratio", q.floor_ratio.unwrap_or(d.floor_ratio))?,
            over_budget_samples: q.over_budget_samples.unwrap_or(d.over_budget_samples).max(1),
            under_budget_samples: q.under_budget_samples.unwrap_or(d.under_budget_samples).max(1),
            step_down: q.step_down.unwrap_or(d.step_down).abs(),
            step_down_high_pressure: q
                .step_down_high_pressure
                .unwrap_or(d.step_down_high_pressure)
                .abs(),
            step_up: q.step_up.unwrap_or(d.step_up).abs(),
            cooldown: ms(q.cooldown_ms, d.cooldown),
        };

        let d = BackpressureSettings::default();
        let backpressure = BackpressureSettings {
            pressure_bytes: self.backpressure.pressure_bytes.unwrap_or(d.pressure_bytes),
            hard_cap_bytes: self.backpressure.hard_cap_bytes.unwrap_or(d.hard_cap_bytes),
        };
        if backpressure.hard_cap_bytes <= backpressure.pressure_bytes {
            return Err(ConfigError::OutOfRange {
                field: "backpressure.hard_cap_bytes",
                detail: format!(
                    "{} must exceed pressure_bytes {}",
                    backpressure.hard_cap_bytes, backpressure.pressure_bytes
                ),
            });
        }

        let d = SenderSettings::default();
        let max_payload_size = self.sender.max_payload_size.unwrap_or(d.max_payload_size);
        if !(64..=crate::wire::MAX_FRAGMENT_PAYLOAD).contains(&max_payload_size) {
            return Err(ConfigError::OutOfRange {
                field: "sender.max_payload_size",
                detail: format!(
                    "{max_payload_size} not in 64..={}",
                    crate::wire::MAX_FRAGMENT_PAYLOAD
                ),
            });
        }
        let mut pacing: Vec<PacingTier> = self
            .sender
            .pacing
            .into_iter()
            .map(|t| PacingTier {
                min_bytes: t.min_bytes,
                burst: t.burst.max(1),
                delay: Duration::from_micros(t.delay_us),
            })
            .collect();
        if pacing.is_empty() {
            pacing = SenderSettings::default_pacing();
        }
        pacing.sort_by(|a, b| b.min_bytes.cmp(&a.min_bytes));
        let sender = SenderSettings {
            max_payload_size,
            loss_mode: ms(self.sender.loss_mode_ms, d.loss_mode),
            pool_max_cached: self.sender.pool_max_cached.unwrap_or(d.pool_max_cached),
            pacing,
        };

        Ok(StreamConfig {
            version,
            stream,
            encoder,
            keyframe,
            quality,
            backpressure,
            sender,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_input_yields_defaults() {
        let cfg = StreamConfig::from_toml_str("   ").unwrap();
        assert_eq!(cfg.stream.target_fps, 60);
        assert_eq!(cfg.stream.keyframe_interval_frames, 120);
        assert_eq!(cfg.sender.max_payload_size, 1200);
        assert_eq!(cfg.sender.pacing.len(), 4);
    }

    #[test]
    fn parse_toml_config_basic() {
        let toml = r#"
            version = 1

            [stream]
            target_fps = 30
            latency_preset = "low-latency"
            maintain_idle_cadence = true

            [encoder]
            stall_timeout_ms = 350

            [backpressure]
            pressure_bytes = 100000
            hard_cap_bytes = 400000

            [[sender.pacing]]
            min_bytes = 0
            burst = 4
            delay_us = 100

            [[sender.pacing]]
            min_bytes = 50000
            burst = 2
            delay_us = 900
        "#;

        let cfg = StreamConfig::from_toml_str(toml).unwrap();
        assert_eq!(cfg.stream.target_fps, 30);
        assert_eq!(cfg.stream.latency_preset, LatencyPreset::LowLatency);
        assert!(cfg.stream.maintain_idle_cadence);
        assert_eq!(cfg.stall_timeout(), Duration::from_millis(350));
        assert_eq!(cfg.inbox_capacity(), 1);
        assert_eq!(cfg.backpressure.hard_cap_bytes, 400_000);
        // Sorted largest tier first.
        assert_eq!(cfg.sender.pacing[0].min_bytes, 50_000);
        assert_eq!(cfg.sender.pacing[1].burst, 4);
    }

    #[test]
    fn derived_stall_timeout_tracks_frame_rate() {
        let mut cfg = StreamConfig::default();
        cfg.stream.target_fps = 60;
        assert_eq!(cfg.stall_timeout(), Duration::from_millis(200));
        cfg.stream.target_fps = 30;
        let t = cfg.stall_timeout();
        assert!(t > Duration::from_millis(399) && t < Duration::from_millis(401));
        cfg.stream.target_fps = 5;
        assert_eq!(cfg.stall_timeout(), Duration::from_millis(900));
    }

    #[test]
    fn frame_interval_is_whole_nanoseconds() {
        assert_eq!(frame_interval(60), Duration::from_nanos(16_666_666));
        assert_eq!(frame_interval(0), Duration::from_secs(1));
        let mut cfg = StreamConfig::default();
        cfg.stream.target_fps = 60;
        assert!(cfg.frame_budget() * 12 <= Duration::from_millis(200));
    }

    #[test]
    fn rejects_inverted_backpressure_thresholds() {
        let toml = r#"
            [backpressure]
            pressure_bytes = 500
            hard_cap_bytes = 400
        "#;
        assert!(matches!(
            StreamConfig::from_toml_str(toml),
            Err(ConfigError::OutOfRange { .. })
        ));
    }

    #[test]
    fn rejects_unknown_version() {
        assert!(matches!(
            StreamConfig::from_toml_str("version = 7"),
            Err(ConfigError::Version(7))
        ));
    }

    #[test]
    fn inbox_capacity_by_preset() {
        let mut cfg = StreamConfig::default();
        assert_eq!(cfg.stream.latency_preset, LatencyPreset::Balanced);
        assert_eq!(cfg.inbox_capacity(), 1);
        cfg.stream.latency_preset = LatencyPreset::Smooth;
        assert_eq!(cfg.inbox_capacity(), 3);
        cfg.stream.target_fps = 120;
        assert_eq!(cfg.inbox_capacity(), 2);
    }
}
