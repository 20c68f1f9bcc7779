//! Per-channel calibration bounds, and the timed routine that discovers them.
//!
//! The routine samples the sensor array twice, once with the device's
//! ambient-light mode off and once with it on, and keeps whichever half
//! showed the larger signal spread. Absolute brightness varies from unit to
//! unit, so the two halves are only ever compared with each other.

use log::{debug, info, warn};
use serde::{Deserialize, Serialize};

use std::{
    fmt::Display,
    thread,
    time::{Duration, Instant},
};

use crate::hardware_message_decoder::SensorFrame;
use crate::sensor_link::{ExclusiveLink, LinkError};

/// The number of channels a profile always carries. Unused channels are
/// padded so they read as fully obscured and drop out of the estimate.
pub const MAX_CHANNELS: usize = 30;

const PAD_LOW: u8 = 0;
const PAD_HIGH: u8 = 255;

/// How much bigger the ambient-on spread has to be before it wins.
pub const AMBIENT_SPREAD_RATIO: f64 = 1.3;

/// Low/high raw bounds for every channel, plus the lighting mode they were
/// recorded in.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CalibrationProfile {
    low: [u8; MAX_CHANNELS],
    high: [u8; MAX_CHANNELS],
    ambient_light_mode: bool,
}

impl Default for CalibrationProfile {
    fn default() -> Self {
        Self {
            low: [PAD_LOW; MAX_CHANNELS],
            high: [PAD_HIGH; MAX_CHANNELS],
            ambient_light_mode: false,
        }
    }
}

impl CalibrationProfile {
    /// Build a profile from however many channels were measured. Missing
    /// channels, and channels whose low bound ended up above the high bound
    /// (never sampled), get the padding bounds.
    pub fn from_bounds(low: &[u8], high: &[u8], ambient_light_mode: bool) -> Self {
        let mut profile = Self {
            ambient_light_mode,
            ..Self::default()
        };
        for (i, (&l, &h)) in low.iter().zip(high).take(MAX_CHANNELS).enumerate() {
            if l <= h {
                profile.low[i] = l;
                profile.high[i] = h;
            }
        }
        profile
    }

    /// Lower bounds, one per channel.
    pub fn low(&self) -> &[u8; MAX_CHANNELS] {
        &self.low
    }

    /// Upper bounds, one per channel.
    pub fn high(&self) -> &[u8; MAX_CHANNELS] {
        &self.high
    }

    /// Whether a channel counts as obscured when it sees light.
    pub fn ambient_light_mode(&self) -> bool {
        self.ambient_light_mode
    }

    /// The same bounds under a different lighting mode.
    pub fn with_ambient_light_mode(mut self, enabled: bool) -> Self {
        self.ambient_light_mode = enabled;
        self
    }

    /// Map a raw reading on `channel` onto the profile's bounds. The result
    /// is not clamped, values far outside `[0, 1]` mean the bounds are off.
    pub fn normalize(&self, channel: usize, raw: u8) -> f64 {
        let (low, high) = if channel < MAX_CHANNELS {
            (self.low[channel], self.high[channel])
        } else {
            (PAD_LOW, PAD_HIGH)
        };
        let span = (high as f64 - low as f64).max(1.0);
        (raw as f64 - low as f64) / span
    }
}

/// Pick ambient-light mode only when its spread beats the normal-mode spread
/// by more than [`AMBIENT_SPREAD_RATIO`].
pub fn choose_ambient_mode(off_spread: u32, on_spread: u32) -> bool {
    on_spread as f64 > off_spread as f64 * AMBIENT_SPREAD_RATIO
}

/// Running per-channel minimum and maximum.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelBounds {
    low: Vec<u8>,
    high: Vec<u8>,
}

impl ChannelBounds {
    /// Start every channel at the sentinel extremes.
    pub fn new(channels: usize) -> Self {
        Self {
            low: vec![u8::MAX; channels],
            high: vec![u8::MIN; channels],
        }
    }

    /// Widen the bounds with one frame. Extra readings beyond the discovered
    /// channel count are ignored.
    pub fn observe(&mut self, frame: &SensorFrame) {
        for (i, &v) in frame.values().iter().enumerate().take(self.low.len()) {
            self.low[i] = self.low[i].min(v);
            self.high[i] = self.high[i].max(v);
        }
    }

    /// `Σ(high - low)` over the channels that were sampled at all.
    pub fn spread(&self) -> u32 {
        self.low
            .iter()
            .zip(&self.high)
            .map(|(&l, &h)| h.saturating_sub(l) as u32)
            .sum()
    }

    #[allow(missing_docs)]
    pub fn low(&self) -> &[u8] {
        &self.low
    }

    #[allow(missing_docs)]
    pub fn high(&self) -> &[u8] {
        &self.high
    }
}

/// Knobs for a calibration run.
#[derive(Debug, Clone, PartialEq)]
pub struct CalibrationOptions {
    /// Total sampling time, split evenly between the two lighting modes.
    pub duration: Duration,
    /// Pause between frames.
    pub sample_interval: Duration,
    /// Persist the result on the device.
    pub save: bool,
    /// How long to wait for exclusive access to the link.
    pub lock_wait: Duration,
    /// A phase ends early after this many failed frames in a row.
    pub max_consecutive_failures: u32,
}

impl Default for CalibrationOptions {
    fn default() -> Self {
        Self {
            duration: Duration::from_secs(10),
            sample_interval: Duration::from_millis(20),
            save: true,
            lock_wait: Duration::from_secs(1),
            max_consecutive_failures: 50,
        }
    }
}

/// Where a routine currently is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CalibrationPhase {
    #[allow(missing_docs)]
    Idle,
    #[allow(missing_docs)]
    DiscoverChannelCount,
    #[allow(missing_docs)]
    SampleAmbientOff,
    #[allow(missing_docs)]
    SampleAmbientOn,
    #[allow(missing_docs)]
    Commit,
}

impl Display for CalibrationPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            CalibrationPhase::Idle => "idle",
            CalibrationPhase::DiscoverChannelCount => "discovering channels",
            CalibrationPhase::SampleAmbientOff => "sampling, ambient mode off",
            CalibrationPhase::SampleAmbientOn => "sampling, ambient mode on",
            CalibrationPhase::Commit => "committing",
        };
        write!(f, "{name}")
    }
}

/// What a finished run found.
#[derive(Debug, Clone, PartialEq)]
pub struct CalibrationReport {
    /// Active channels reported by the device.
    pub sensor_count: usize,
    /// Signal spread with ambient mode off.
    pub off_spread: u32,
    /// Signal spread with ambient mode on.
    pub on_spread: u32,
    /// The mode that won.
    pub ambient_light_mode: bool,
    /// The committed profile.
    pub profile: CalibrationProfile,
}

/// Why a run could not produce a profile.
#[derive(Debug)]
pub enum CalibrationError {
    /// A command the routine cannot do without failed.
    Link(LinkError),
    /// The device reported zero channels.
    NoSensors,
}

impl Display for CalibrationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CalibrationError::Link(e) => write!(f, "calibration failed: {e}"),
            CalibrationError::NoSensors => write!(f, "calibration failed: no sensors reported"),
        }
    }
}

impl std::error::Error for CalibrationError {}

impl From<LinkError> for CalibrationError {
    fn from(value: LinkError) -> Self {
        Self::Link(value)
    }
}

/// The two-phase calibration procedure.
#[derive(Debug)]
pub struct CalibrationRoutine {
    options: CalibrationOptions,
    phase: CalibrationPhase,
}

impl CalibrationRoutine {
    #[allow(missing_docs)]
    pub fn new(options: CalibrationOptions) -> Self {
        Self {
            options,
            phase: CalibrationPhase::Idle,
        }
    }

    #[allow(missing_docs)]
    pub fn phase(&self) -> CalibrationPhase {
        self.phase
    }

    fn enter(&mut self, phase: CalibrationPhase) {
        debug!("calibration: {phase}");
        self.phase = phase;
    }

    /// Run the whole procedure on a link the caller already holds
    /// exclusively. Always ends back in [`CalibrationPhase::Idle`].
    pub fn run(
        &mut self,
        link: &mut ExclusiveLink<'_>,
    ) -> Result<CalibrationReport, CalibrationError> {
        let result = self.run_phases(link);
        self.enter(CalibrationPhase::Idle);
        result
    }

    fn run_phases(
        &mut self,
        link: &mut ExclusiveLink<'_>,
    ) -> Result<CalibrationReport, CalibrationError> {
        info!("calibration started for {:?}", self.options.duration);

        self.enter(CalibrationPhase::DiscoverChannelCount);
        let sensor_count = link.request_frame()?.len().min(MAX_CHANNELS);
        if sensor_count == 0 {
            return Err(CalibrationError::NoSensors);
        }
        debug!("calibration: {sensor_count} channels");

        let half = self.options.duration / 2;

        self.enter(CalibrationPhase::SampleAmbientOff);
        let mut off = ChannelBounds::new(sensor_count);
        self.sample(link, false, half, &mut off)?;

        self.enter(CalibrationPhase::SampleAmbientOn);
        let mut on = ChannelBounds::new(sensor_count);
        self.sample(link, true, half, &mut on)?;

        self.enter(CalibrationPhase::Commit);
        let (off_spread, on_spread) = (off.spread(), on.spread());
        let ambient_light_mode = choose_ambient_mode(off_spread, on_spread);
        let chosen = if ambient_light_mode { &on } else { &off };
        let profile = CalibrationProfile::from_bounds(chosen.low(), chosen.high(), ambient_light_mode);

        link.set_ambient_mode(ambient_light_mode)?;
        if self.options.save {
            link.save_calibration(&profile, sensor_count)?;
        }
        info!(
            "calibration committed: spread off {off_spread}, on {on_spread}, ambient mode {ambient_light_mode}"
        );

        Ok(CalibrationReport {
            sensor_count,
            off_spread,
            on_spread,
            ambient_light_mode,
            profile,
        })
    }

    /// Collect frames for `duration`. Individual bad frames are skipped, a
    /// long run of them ends the phase with whatever was gathered so far.
    fn sample(
        &self,
        link: &mut ExclusiveLink<'_>,
        ambient: bool,
        duration: Duration,
        bounds: &mut ChannelBounds,
    ) -> Result<(), CalibrationError> {
        link.set_ambient_mode(ambient)?;
        let deadline = Instant::now() + duration;
        let mut failures = 0;
        while Instant::now() < deadline {
            match link.request_frame() {
                Ok(frame) => {
                    failures = 0;
                    bounds.observe(&frame);
                }
                Err(e) => {
                    failures += 1;
                    debug!("calibration frame skipped: {e}");
                    if failures >= self.options.max_consecutive_failures {
                        warn!("calibration phase cut short after {failures} failed frames");
                        break;
                    }
                }
            }
            thread::sleep(self.options.sample_interval);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dummy_sensor::DummySensor;
    use crate::sensor_link::SensorLink;

    fn quick() -> CalibrationOptions {
        CalibrationOptions {
            duration: Duration::from_millis(600),
            sample_interval: Duration::from_millis(2),
            ..CalibrationOptions::default()
        }
    }

    #[test]
    fn ambient_mode_needs_thirty_percent_more_spread() {
        assert!(choose_ambient_mode(50, 80));
        assert!(!choose_ambient_mode(50, 55));
        assert!(!choose_ambient_mode(50, 65));
        assert!(!choose_ambient_mode(0, 0));
    }

    #[test]
    fn default_profile_is_padded() {
        let profile = CalibrationProfile::default();
        assert!(profile.low().iter().all(|&v| v == 0));
        assert!(profile.high().iter().all(|&v| v == 255));
        assert!(!profile.ambient_light_mode());
    }

    #[test]
    fn unsampled_channels_fall_back_to_padding() {
        let profile = CalibrationProfile::from_bounds(&[10, 255, 30], &[200, 0, 220], false);
        assert_eq!(&profile.low()[..4], &[10, 0, 30, 0]);
        assert_eq!(&profile.high()[..4], &[200, 255, 220, 255]);
    }

    #[test]
    fn normalize_uses_bounds_and_guards_zero_span() {
        let profile = CalibrationProfile::from_bounds(&[50, 80], &[150, 80], false);
        assert!((profile.normalize(0, 100) - 0.5).abs() < 1e-9);
        assert!((profile.normalize(0, 0) + 0.5).abs() < 1e-9);
        assert!((profile.normalize(1, 81) - 1.0).abs() < 1e-9);
        assert!((profile.normalize(40, 255) - 1.0).abs() < 1e-9);
    }

    #[test]
    fn bounds_track_extremes_and_spread() {
        let mut bounds = ChannelBounds::new(2);
        assert_eq!(bounds.spread(), 0);
        bounds.observe(&SensorFrame::new(vec![10, 20, 99]));
        bounds.observe(&SensorFrame::new(vec![30, 5]));
        assert_eq!(bounds.low(), &[10, 5]);
        assert_eq!(bounds.high(), &[30, 20]);
        assert_eq!(bounds.spread(), 35);
    }

    #[test]
    fn dark_room_keeps_ambient_mode_off() {
        let sensor = DummySensor::builder()
            .sensors(8)
            .stroke_period(Duration::from_millis(200))
            .build();
        let link = SensorLink::new(Box::new(sensor));
        let mut held = link.exclusive(Duration::from_millis(10)).unwrap();

        let mut routine = CalibrationRoutine::new(quick());
        let report = routine.run(&mut held).unwrap();
        assert_eq!(routine.phase(), CalibrationPhase::Idle);
        assert_eq!(report.sensor_count, 8);
        assert!(!report.ambient_light_mode);
        assert!(report.off_spread > report.on_spread);
        assert!(report.profile.low()[0] < report.profile.high()[0]);
        assert_eq!(report.profile.high()[8], 255);

        let stored = held.load_calibration().unwrap();
        assert_eq!(stored, report.profile);
    }

    #[test]
    fn bright_room_picks_ambient_mode() {
        let sensor = DummySensor::builder()
            .sensors(8)
            .stroke_period(Duration::from_millis(200))
            .bright_ambient(true)
            .build();
        let link = SensorLink::new(Box::new(sensor));
        let mut held = link.exclusive(Duration::from_millis(10)).unwrap();

        let report = CalibrationRoutine::new(quick()).run(&mut held).unwrap();
        assert!(report.ambient_light_mode);
        assert!(report.profile.ambient_light_mode());
    }

    #[test]
    fn garbled_device_fails_discovery() {
        let sensor = DummySensor::builder().sensors(8).garbled(true).build();
        let link = SensorLink::new(Box::new(sensor));
        let mut held = link.exclusive(Duration::from_millis(10)).unwrap();
        let mut routine = CalibrationRoutine::new(quick());
        assert!(matches!(
            routine.run(&mut held),
            Err(CalibrationError::Link(LinkError::ProtocolMismatch(_)))
        ));
        assert_eq!(routine.phase(), CalibrationPhase::Idle);
    }
}
