//! The relay's configuration file.
//!
//! Configuration is a [ron] document with one section per concern. Every
//! field has a default, so a file only needs to name what it changes:
//!
//! ```text
//! (
//!     output: (strategy: buffered, filter_ms: 800),
//!     stream: (connection_key: "abc123"),
//! )
//! ```

use ron::ser::PrettyConfig;
use serde::{Deserialize, Serialize};

use std::{
    fmt,
    fs,
    path::{Path, PathBuf},
    time::Duration,
};

use crate::{
    actuator::DirectSettings,
    calibration::CalibrationOptions,
    device_session::DeviceSettings,
    output_processor::{OutputSettings, OutputStrategy},
    pipeline::PipelineSettings,
    position_estimator::EstimatorSettings,
    recorder::RecorderSettings,
    stream_sync::StreamSettings,
};

/// Reading or writing the configuration failed.
#[derive(Debug)]
pub enum ConfigError {
    /// The file could not be read or written.
    Io(std::io::Error),
    /// The file is not valid configuration.
    Parse(ron::de::SpannedError),
    /// The configuration could not be encoded.
    Encode(ron::Error),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ConfigError::Io(e) => write!(f, "config io error: {e}"),
            ConfigError::Parse(e) => write!(f, "bad config: {e}"),
            ConfigError::Encode(e) => write!(f, "could not encode config: {e}"),
        }
    }
}

impl std::error::Error for ConfigError {}

fn ms(millis: u64) -> Duration {
    Duration::from_millis(millis)
}

fn as_ms(duration: Duration) -> u64 {
    duration.as_millis() as u64
}

/// Sensor device, estimator and polling.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
#[allow(missing_docs)]
pub struct DeviceConfig {
    pub poll_interval_ms: u64,
    pub drain_interval_ms: u64,
    pub bounded_wait_ms: u64,
    pub response_timeout_ms: u64,
    pub keep_position_at_release: bool,
    pub neighbor_smoothing: bool,
    pub release_threshold: f64,
    pub release_predicted_max: f64,
    pub bad_calibration_threshold: u32,
    pub calibration_seconds: u64,
    pub calibration_sample_interval_ms: u64,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        let device = DeviceSettings::default();
        let pipeline = PipelineSettings::default();
        let calibration = CalibrationOptions::default();
        Self {
            poll_interval_ms: as_ms(pipeline.poll_interval),
            drain_interval_ms: as_ms(pipeline.drain_interval),
            bounded_wait_ms: as_ms(device.bounded_wait),
            response_timeout_ms: as_ms(device.response_timeout),
            keep_position_at_release: device.estimator.keep_position_at_release,
            neighbor_smoothing: device.estimator.neighbor_smoothing,
            release_threshold: device.estimator.release_threshold,
            release_predicted_max: device.estimator.release_predicted_max,
            bad_calibration_threshold: device.estimator.bad_calibration_threshold,
            calibration_seconds: calibration.duration.as_secs(),
            calibration_sample_interval_ms: as_ms(calibration.sample_interval),
        }
    }
}

/// Output shaping.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
#[allow(missing_docs)]
pub struct OutputConfig {
    pub strategy: OutputStrategy,
    pub filter_ms: u64,
    pub epsilon: f64,
    pub duration_floor_ms: u64,
    pub duration_ceiling_ms: u64,
    pub max_gap_ms: u64,
    pub latency_margin_ms: u64,
    pub peak_noise_floor: f64,
    pub peak_debounce_ms: u64,
    pub peak_debounce_distance: f64,
    pub peak_watchdog_ms: u64,
}

impl Default for OutputConfig {
    fn default() -> Self {
        let s = OutputSettings::default();
        Self {
            strategy: s.strategy,
            filter_ms: as_ms(s.filter_time),
            epsilon: s.epsilon,
            duration_floor_ms: as_ms(s.duration_floor),
            duration_ceiling_ms: as_ms(s.duration_ceiling),
            max_gap_ms: as_ms(s.max_gap),
            latency_margin_ms: as_ms(s.latency_margin),
            peak_noise_floor: s.peak_noise_floor,
            peak_debounce_ms: as_ms(s.peak_debounce_time),
            peak_debounce_distance: s.peak_debounce_distance,
            peak_watchdog_ms: as_ms(s.peak_watchdog),
        }
    }
}

/// Remote streaming player.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
#[allow(missing_docs)]
pub struct StreamConfig {
    pub base_url: String,
    pub connection_key: String,
    pub bearer_token: Option<String>,
    pub stream_id: u32,
    pub clock_sync_samples: usize,
    pub batch_divisor_ms: u64,
    pub capacity_margin: i64,
    pub lookahead_ms: u64,
    pub stall_window: usize,
    pub request_timeout_ms: u64,
}

impl Default for StreamConfig {
    fn default() -> Self {
        let s = StreamSettings::default();
        Self {
            base_url: s.base_url,
            connection_key: s.connection_key,
            bearer_token: s.bearer_token,
            stream_id: s.stream_id,
            clock_sync_samples: s.clock_sync_samples,
            batch_divisor_ms: as_ms(s.batch_divisor),
            capacity_margin: s.capacity_margin,
            lookahead_ms: as_ms(s.lookahead),
            stall_window: s.stall_window,
            request_timeout_ms: as_ms(s.request_timeout),
        }
    }
}

/// Local script recorder.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
#[allow(missing_docs)]
pub struct RecorderConfig {
    pub output_path: PathBuf,
    pub time_shift_ms: u64,
    pub min_range: f64,
    pub max_range: f64,
    pub title: String,
}

impl Default for RecorderConfig {
    fn default() -> Self {
        let s = RecorderSettings::default();
        Self {
            output_path: s.output_path,
            time_shift_ms: as_ms(s.time_shift),
            min_range: s.min_range,
            max_range: s.max_range,
            title: s.title,
        }
    }
}

/// Direct-move client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
#[allow(missing_docs)]
pub struct DirectConfig {
    pub base_url: String,
    pub connection_key: String,
    pub request_timeout_ms: u64,
    pub min_move_ms: u64,
    pub hint_factor: u32,
}

impl Default for DirectConfig {
    fn default() -> Self {
        let s = DirectSettings::default();
        Self {
            base_url: s.base_url,
            connection_key: s.connection_key,
            request_timeout_ms: as_ms(s.request_timeout),
            min_move_ms: as_ms(s.min_move),
            hint_factor: s.hint_factor,
        }
    }
}

/// The whole configuration file.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
#[allow(missing_docs)]
pub struct RelayConfig {
    pub device: DeviceConfig,
    pub output: OutputConfig,
    pub stream: StreamConfig,
    pub recorder: RecorderConfig,
    pub direct: DirectConfig,
}

impl RelayConfig {
    /// Read a configuration file.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path).map_err(ConfigError::Io)?;
        ron::from_str(&text).map_err(ConfigError::Parse)
    }

    /// Write this configuration out, replacing whatever is at `path`.
    pub fn to_path(&self, path: impl AsRef<Path>) -> Result<(), ConfigError> {
        let text =
            ron::ser::to_string_pretty(self, PrettyConfig::default()).map_err(ConfigError::Encode)?;
        fs::write(path, text).map_err(ConfigError::Io)
    }

    #[allow(missing_docs)]
    pub fn estimator_settings(&self) -> EstimatorSettings {
        let d = &self.device;
        EstimatorSettings {
            keep_position_at_release: d.keep_position_at_release,
            neighbor_smoothing: d.neighbor_smoothing,
            release_threshold: d.release_threshold,
            release_predicted_max: d.release_predicted_max,
            bad_calibration_threshold: d.bad_calibration_threshold,
            ..EstimatorSettings::default()
        }
    }

    #[allow(missing_docs)]
    pub fn device_settings(&self) -> DeviceSettings {
        DeviceSettings {
            bounded_wait: ms(self.device.bounded_wait_ms),
            response_timeout: ms(self.device.response_timeout_ms),
            estimator: self.estimator_settings(),
        }
    }

    #[allow(missing_docs)]
    pub fn pipeline_settings(&self) -> PipelineSettings {
        PipelineSettings {
            poll_interval: ms(self.device.poll_interval_ms),
            drain_interval: ms(self.device.drain_interval_ms),
        }
    }

    #[allow(missing_docs)]
    pub fn calibration_options(&self) -> CalibrationOptions {
        CalibrationOptions {
            duration: Duration::from_secs(self.device.calibration_seconds),
            sample_interval: ms(self.device.calibration_sample_interval_ms),
            ..CalibrationOptions::default()
        }
    }

    #[allow(missing_docs)]
    pub fn output_settings(&self) -> OutputSettings {
        let o = &self.output;
        OutputSettings {
            strategy: o.strategy,
            filter_time: ms(o.filter_ms),
            epsilon: o.epsilon,
            duration_floor: ms(o.duration_floor_ms),
            duration_ceiling: ms(o.duration_ceiling_ms),
            max_gap: ms(o.max_gap_ms),
            latency_margin: ms(o.latency_margin_ms),
            peak_noise_floor: o.peak_noise_floor,
            peak_debounce_time: ms(o.peak_debounce_ms),
            peak_debounce_distance: o.peak_debounce_distance,
            peak_watchdog: ms(o.peak_watchdog_ms),
        }
    }

    /// Stream settings. The batch size follows the output filter window.
    pub fn stream_settings(&self) -> StreamSettings {
        let s = &self.stream;
        StreamSettings {
            base_url: s.base_url.clone(),
            connection_key: s.connection_key.clone(),
            bearer_token: s.bearer_token.clone(),
            stream_id: s.stream_id,
            clock_sync_samples: s.clock_sync_samples,
            filter_window: ms(self.output.filter_ms),
            batch_divisor: ms(s.batch_divisor_ms),
            capacity_margin: s.capacity_margin,
            lookahead: ms(s.lookahead_ms),
            stall_window: s.stall_window,
            request_timeout: ms(s.request_timeout_ms),
        }
    }

    #[allow(missing_docs)]
    pub fn recorder_settings(&self) -> RecorderSettings {
        let r = &self.recorder;
        RecorderSettings {
            output_path: r.output_path.clone(),
            time_shift: ms(r.time_shift_ms),
            min_range: r.min_range,
            max_range: r.max_range,
            title: r.title.clone(),
        }
    }

    #[allow(missing_docs)]
    pub fn direct_settings(&self) -> DirectSettings {
        let d = &self.direct;
        DirectSettings {
            base_url: d.base_url.clone(),
            connection_key: d.connection_key.clone(),
            request_timeout: ms(d.request_timeout_ms),
            min_move: ms(d.min_move_ms),
            hint_factor: d.hint_factor,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_component_defaults() {
        let config = RelayConfig::default();
        assert_eq!(config.output_settings(), OutputSettings::default());
        assert_eq!(config.device_settings(), DeviceSettings::default());
        assert_eq!(config.pipeline_settings(), PipelineSettings::default());
        assert_eq!(config.recorder_settings(), RecorderSettings::default());
        assert_eq!(config.direct_settings(), DirectSettings::default());
        assert_eq!(
            config.calibration_options(),
            CalibrationOptions::default()
        );
    }

    #[test]
    fn written_config_reads_back() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("relay.ron");

        let mut config = RelayConfig::default();
        config.output.strategy = OutputStrategy::Peak;
        config.stream.bearer_token = Some("token".into());
        config.to_path(&path).unwrap();

        assert_eq!(RelayConfig::from_path(&path).unwrap(), config);
    }

    #[test]
    fn partial_file_keeps_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("relay.ron");
        fs::write(
            &path,
            "(output: (strategy: buffered, filter_ms: 800), stream: (connection_key: \"abc\"))",
        )
        .unwrap();

        let config = RelayConfig::from_path(&path).unwrap();
        assert_eq!(config.output.strategy, OutputStrategy::Buffered);
        assert_eq!(config.output.epsilon, OutputConfig::default().epsilon);
        assert_eq!(config.stream.connection_key, "abc");
        assert_eq!(config.stream_settings().filter_window, Duration::from_millis(800));
        assert_eq!(config.stream_settings().batch_size(), 2);
        assert_eq!(config.device, DeviceConfig::default());
    }

    #[test]
    fn bad_file_is_a_parse_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("relay.ron");
        fs::write(&path, "(output: (strategy: sideways))").unwrap();
        assert!(matches!(RelayConfig::from_path(&path), Err(ConfigError::Parse(_))));
        assert!(matches!(
            RelayConfig::from_path(dir.path().join("missing.ron")),
            Err(ConfigError::Io(_))
        ));
    }
}
