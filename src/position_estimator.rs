//! Turns a frame of raw sensor readings into one scalar position.
//!
//! Readings are normalized against the [`CalibrationProfile`], optionally
//! cleaned up by a neighbor vote, and then scanned from the insertion end:
//! everything up to the last clearly obscured sensor counts as covered,
//! stray readings two or more sensors past it are ignored. The result is
//! inverted so that 1.0 means nothing is inserted.

use log::{debug, warn};

use std::{fmt::Display, time::Instant};

use crate::calibration::CalibrationProfile;
use crate::hardware_message_decoder::SensorFrame;

/// One estimated position.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PositionSample {
    /// 1.0 is fully withdrawn, 0.0 fully inserted.
    pub value: f64,
    /// When the frame it came from was read.
    pub timestamp: Instant,
}

/// Why a frame could not be turned into a position.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EstimateError {
    /// The frame carried no readings at all.
    EmptyFrame,
}

impl Display for EstimateError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EstimateError::EmptyFrame => write!(f, "empty sensor frame"),
        }
    }
}

impl std::error::Error for EstimateError {}

/// Tunables for [`PositionEstimator`].
#[derive(Debug, Clone, PartialEq)]
pub struct EstimatorSettings {
    /// Hold the last position when the reading suddenly jumps to "released"
    /// in the middle of a stroke.
    pub keep_position_at_release: bool,
    /// Replace readings that disagree with their neighbors' majority.
    pub neighbor_smoothing: bool,
    /// A normalized reading above this counts as obscured.
    pub obscured_threshold: f64,
    /// Readings above this are candidates for the release hold.
    pub release_threshold: f64,
    /// The hold only applies while the predicted position is below this.
    pub release_predicted_max: f64,
    /// Accepted range for an unclamped normalized reading.
    pub sane_range: (f64, f64),
    /// Counter value past which the recalibrate warning is raised.
    pub bad_calibration_threshold: u32,
}

impl Default for EstimatorSettings {
    fn default() -> Self {
        Self {
            keep_position_at_release: false,
            neighbor_smoothing: false,
            obscured_threshold: 0.5,
            release_threshold: 0.95,
            release_predicted_max: 0.9,
            sane_range: (-0.3, 1.3),
            bad_calibration_threshold: 200,
        }
    }
}

/// Stateful estimator. Owns the calibration it normalizes against.
#[derive(Debug, Clone)]
pub struct PositionEstimator {
    settings: EstimatorSettings,
    profile: CalibrationProfile,
    bad_calibration_count: u32,
    bad_calibration_warning: bool,
    previous: Option<[f64; 4]>,
}

impl PositionEstimator {
    /// An estimator with an explicit profile.
    pub fn new(settings: EstimatorSettings, profile: CalibrationProfile) -> Self {
        Self {
            settings,
            profile,
            bad_calibration_count: 0,
            bad_calibration_warning: false,
            previous: None,
        }
    }

    /// An estimator running on the padding profile.
    pub fn uncalibrated(settings: EstimatorSettings) -> Self {
        Self::new(settings, CalibrationProfile::default())
    }

    #[allow(missing_docs)]
    pub fn profile(&self) -> &CalibrationProfile {
        &self.profile
    }

    #[allow(missing_docs)]
    pub fn settings(&self) -> &EstimatorSettings {
        &self.settings
    }

    /// Replace the calibration wholesale. Clears the recalibrate warning.
    pub fn set_profile(&mut self, profile: CalibrationProfile) {
        self.profile = profile;
        self.clear_warning();
    }

    /// Switch the lighting mode of the calibration in use. The bounds and
    /// the recalibrate warning stay as they are.
    pub fn set_ambient_light_mode(&mut self, enabled: bool) {
        self.profile = self.profile.clone().with_ambient_light_mode(enabled);
    }

    /// Drop the recalibrate warning and start counting afresh.
    pub fn clear_warning(&mut self) {
        self.bad_calibration_count = 0;
        self.bad_calibration_warning = false;
    }

    /// True once readings have been out of bounds for long enough.
    pub fn bad_calibration_warning(&self) -> bool {
        self.bad_calibration_warning
    }

    /// Estimate a position from one frame.
    pub fn estimate(&mut self, frame: &SensorFrame) -> Result<PositionSample, EstimateError> {
        let timestamp = Instant::now();
        if frame.is_empty() {
            return Err(EstimateError::EmptyFrame);
        }

        let raw: Vec<f64> = frame
            .values()
            .iter()
            .enumerate()
            .map(|(i, &v)| self.profile.normalize(i, v))
            .collect();
        self.track_calibration(&raw);

        let ambient = self.profile.ambient_light_mode();
        let normalized: Vec<f64> = raw
            .into_iter()
            .map(|v| {
                let v = v.clamp(0.0, 1.0);
                if ambient {
                    1.0 - v
                } else {
                    v
                }
            })
            .collect();

        let values = if self.settings.neighbor_smoothing {
            smooth(&normalized, self.settings.obscured_threshold)
        } else {
            normalized
        };

        let mut value = 1.0 - first_pass(&values, self.settings.obscured_threshold);
        if self.settings.keep_position_at_release {
            value = self.hold_at_release(value);
        }
        Ok(PositionSample { value, timestamp })
    }

    fn track_calibration(&mut self, raw: &[f64]) {
        let (min, max) = self.settings.sane_range;
        if raw.iter().any(|&v| v < min || v > max) {
            self.bad_calibration_count = self.bad_calibration_count.saturating_add(1);
            if !self.bad_calibration_warning
                && self.bad_calibration_count > self.settings.bad_calibration_threshold
            {
                warn!("sensor readings keep falling outside calibration, recalibrate");
                self.bad_calibration_warning = true;
            }
        } else {
            self.bad_calibration_count = self.bad_calibration_count.saturating_sub(1);
        }
    }

    fn hold_at_release(&mut self, position: f64) -> f64 {
        let previous = self.previous.get_or_insert([position; 4]);
        let predicted = previous[0] + (previous[0] - previous[1]);
        if position > self.settings.release_threshold
            && predicted < self.settings.release_predicted_max
        {
            debug!("release jump to {position:.2} held, predicted {predicted:.2}");
            return (previous[0] + previous[1]) / 2.0;
        }
        previous.rotate_right(1);
        previous[0] = position;
        (previous[0] + previous[1]) / 2.0
    }
}

/// Insertion depth as a fraction of the array.
fn first_pass(values: &[f64], threshold: f64) -> f64 {
    let mut total = 0.0;
    let mut last_obscured = 0;
    for (i, &v) in values.iter().enumerate() {
        let mut v = v;
        if v > threshold {
            total = i as f64;
            last_obscured = i;
        } else if i - last_obscured >= 2 {
            v = 0.0;
        }
        total += v.clamp(0.0, 1.0);
    }
    total / values.len() as f64
}

/// Neighbor vote. Every reading is compared with the un-smoothed readings
/// around it and replaced by their mean when it disagrees with the majority.
fn smooth(values: &[f64], threshold: f64) -> Vec<f64> {
    let n = values.len();
    (0..n)
        .map(|i| {
            let neighbors: Vec<usize> = if i == 0 {
                return values[0];
            } else if i == n - 1 {
                (i.saturating_sub(3)..i).collect()
            } else if i == 1 {
                vec![0, 2]
            } else {
                vec![i - 2, i - 1, i + 1]
            };

            let obscured = values[i] > threshold;
            let votes = neighbors.len() + 1;
            let agreeing = neighbors.iter().filter(|&&j| values[j] > threshold).count()
                + obscured as usize;
            let majority = votes / 2 + 1;

            if (obscured && agreeing < majority) || (!obscured && agreeing >= majority) {
                let sum: f64 = neighbors.iter().map(|&j| values[j]).sum::<f64>() + values[i];
                sum / votes as f64
            } else {
                values[i]
            }
        })
        .collect()
}
