//! One connected sensor array and everything we know about it.
//!
//! A [`DeviceSession`] is shared by reference between the poll loop, the
//! calibration command and whatever user interface is watching. It owns the
//! link, the estimator with its calibration, the cached firmware version and
//! the device state, and tells subscribers about every state change.

use log::{debug, info, warn};

use std::{
    fmt::Display,
    sync::{
        atomic::{AtomicUsize, Ordering},
        mpsc::{self, Receiver, Sender},
        Mutex, MutexGuard, PoisonError,
    },
    time::{Duration, Instant},
};

use crate::calibration::{
    CalibrationOptions, CalibrationProfile, CalibrationReport, CalibrationRoutine,
};
use crate::error::RelayError;
use crate::position_estimator::{EstimatorSettings, PositionEstimator, PositionSample};
use crate::sensor_link::{SensorLink, Transport};

/// Coarse device health.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceState {
    #[allow(missing_docs)]
    NotConnected,
    #[allow(missing_docs)]
    Ok,
    #[allow(missing_docs)]
    Calibrating,
    /// The last transaction failed in a way that was not just contention.
    Error,
}

impl Display for DeviceState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            DeviceState::NotConnected => "not connected",
            DeviceState::Ok => "ok",
            DeviceState::Calibrating => "calibrating",
            DeviceState::Error => "error",
        };
        write!(f, "{name}")
    }
}

/// What subscribers are told.
#[derive(Debug, Clone, PartialEq)]
pub enum StatusEvent {
    /// The device moved to a new state.
    State(DeviceState),
    /// The recalibrate warning was raised (`true`) or cleared (`false`).
    CalibrationWarning(bool),
}

/// Link timing and estimator tunables for a session.
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceSettings {
    /// How long a poll waits for the link before skipping.
    pub bounded_wait: Duration,
    /// How long a transaction waits for its response.
    pub response_timeout: Duration,
    #[allow(missing_docs)]
    pub estimator: EstimatorSettings,
}

impl Default for DeviceSettings {
    fn default() -> Self {
        Self {
            bounded_wait: crate::sensor_link::DEFAULT_BOUNDED_WAIT,
            response_timeout: crate::sensor_link::DEFAULT_RESPONSE_TIMEOUT,
            estimator: EstimatorSettings::default(),
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// A connected device.
pub struct DeviceSession {
    link: SensorLink,
    estimator: Mutex<PositionEstimator>,
    firmware_version: Mutex<Option<u8>>,
    sensor_count: AtomicUsize,
    state: Mutex<DeviceState>,
    observers: Mutex<Vec<Sender<StatusEvent>>>,
    reference: Instant,
}

impl DeviceSession {
    /// Wrap a freshly opened transport. The session starts out uncalibrated;
    /// call [`load_calibration`](Self::load_calibration) or
    /// [`calibrate`](Self::calibrate) before trusting positions.
    pub fn connect(transport: Box<dyn Transport>, settings: DeviceSettings) -> Self {
        let link = SensorLink::new(transport)
            .with_bounded_wait(settings.bounded_wait)
            .with_response_timeout(settings.response_timeout);
        let session = Self {
            link,
            estimator: Mutex::new(PositionEstimator::uncalibrated(settings.estimator)),
            firmware_version: Mutex::new(None),
            sensor_count: AtomicUsize::new(0),
            state: Mutex::new(DeviceState::NotConnected),
            observers: Mutex::new(Vec::new()),
            reference: Instant::now(),
        };
        session.set_state(DeviceState::Ok);
        session
    }

    /// Receive every state transition and warning edge from now on.
    pub fn subscribe(&self) -> Receiver<StatusEvent> {
        let (tx, rx) = mpsc::channel();
        lock(&self.observers).push(tx);
        rx
    }

    fn publish(&self, event: StatusEvent) {
        lock(&self.observers).retain(|tx| tx.send(event.clone()).is_ok());
    }

    fn set_state(&self, new_state: DeviceState) {
        let mut state = lock(&self.state);
        if *state != new_state {
            debug!("device state {} -> {}", *state, new_state);
            *state = new_state;
            drop(state);
            self.publish(StatusEvent::State(new_state));
        }
    }

    #[allow(missing_docs)]
    pub fn state(&self) -> DeviceState {
        *lock(&self.state)
    }

    /// The instant every pipeline timestamp is measured from.
    pub fn reference(&self) -> Instant {
        self.reference
    }

    /// Time from the session reference to `at`.
    pub fn since_reference(&self, at: Instant) -> Duration {
        at.saturating_duration_since(self.reference)
    }

    /// Active channel count seen on the last frame, if any frame was read.
    pub fn sensor_count(&self) -> Option<usize> {
        match self.sensor_count.load(Ordering::Relaxed) {
            0 => None,
            n => Some(n),
        }
    }

    /// Whether the recalibrate warning is up.
    pub fn bad_calibration_warning(&self) -> bool {
        lock(&self.estimator).bad_calibration_warning()
    }

    /// [`RelayError::CalibrationInvalid`] while the recalibrate warning is up.
    pub fn check_calibration(&self) -> Result<(), RelayError> {
        if self.bad_calibration_warning() {
            Err(RelayError::CalibrationInvalid)
        } else {
            Ok(())
        }
    }

    /// The calibration currently in use.
    pub fn profile(&self) -> CalibrationProfile {
        lock(&self.estimator).profile().clone()
    }

    fn fail(&self, error: RelayError) -> RelayError {
        match error {
            RelayError::DeviceBusy => {}
            _ => self.set_state(DeviceState::Error),
        }
        error
    }

    fn succeed(&self) {
        if self.state() == DeviceState::Error {
            self.set_state(DeviceState::Ok);
        }
    }

    /// Poll one frame and estimate a position from it. Contention comes back
    /// as [`RelayError::DeviceBusy`] without touching the device state.
    pub fn read_position(&self) -> Result<PositionSample, RelayError> {
        let frame = self
            .link
            .request_frame()
            .map_err(|e| self.fail(e.into()))?;
        self.sensor_count.store(frame.len(), Ordering::Relaxed);

        let mut estimator = lock(&self.estimator);
        let warned = estimator.bad_calibration_warning();
        let sample = estimator
            .estimate(&frame)
            .map_err(|e| self.fail(e.into()))?;
        let warning = estimator.bad_calibration_warning();
        drop(estimator);

        if warning != warned {
            self.publish(StatusEvent::CalibrationWarning(warning));
        }
        self.succeed();
        Ok(sample)
    }

    /// Replace the calibration with the one stored on the device, and put
    /// the device in the lighting mode that calibration was taken in.
    pub fn load_calibration(&self) -> Result<(), RelayError> {
        let profile = self
            .link
            .load_calibration()
            .map_err(|e| self.fail(e.into()))?;
        self.link
            .set_ambient_mode(profile.ambient_light_mode())
            .map_err(|e| self.fail(e.into()))?;
        info!(
            "loaded device calibration, ambient mode {}",
            profile.ambient_light_mode()
        );
        self.install_profile(profile);
        self.succeed();
        Ok(())
    }

    /// Store the calibration in use on the device.
    pub fn save_calibration(&self) -> Result<(), RelayError> {
        let sensor_count = match self.sensor_count() {
            Some(n) => n,
            None => self
                .link
                .request_frame()
                .map_err(|e| self.fail(e.into()))?
                .len(),
        };
        let profile = self.profile();
        self.link
            .save_calibration(&profile, sensor_count)
            .map_err(|e| self.fail(e.into()))?;
        self.succeed();
        Ok(())
    }

    /// Switch ambient-light mode on the device and in the calibration. The
    /// recalibrate warning is left alone.
    pub fn set_ambient_mode(&self, enabled: bool) -> Result<(), RelayError> {
        self.link
            .set_ambient_mode(enabled)
            .map_err(|e| self.fail(e.into()))?;
        lock(&self.estimator).set_ambient_light_mode(enabled);
        self.succeed();
        Ok(())
    }

    /// Firmware version, read from the device once and cached.
    pub fn firmware_version(&self) -> Result<u8, RelayError> {
        let mut cached = lock(&self.firmware_version);
        if let Some(version) = *cached {
            return Ok(version);
        }
        let version = self
            .link
            .firmware_version()
            .map_err(|e| self.fail(e.into()))?;
        *cached = Some(version);
        Ok(version)
    }

    /// Run the calibration routine while holding the link exclusively. The
    /// session is back in [`DeviceState::Ok`] with the warning cleared
    /// afterwards, whether the run succeeded or not.
    pub fn calibrate(&self, options: CalibrationOptions) -> Result<CalibrationReport, RelayError> {
        self.set_state(DeviceState::Calibrating);
        let result = self.run_calibration(options);

        let mut estimator = lock(&self.estimator);
        let was_warning = estimator.bad_calibration_warning();
        match &result {
            Ok(report) => estimator.set_profile(report.profile.clone()),
            Err(e) => {
                warn!("calibration failed: {e}");
                estimator.clear_warning();
            }
        }
        drop(estimator);

        if was_warning {
            self.publish(StatusEvent::CalibrationWarning(false));
        }
        self.set_state(DeviceState::Ok);
        result
    }

    fn run_calibration(&self, options: CalibrationOptions) -> Result<CalibrationReport, RelayError> {
        let mut link = self.link.exclusive(options.lock_wait)?;
        let report = CalibrationRoutine::new(options).run(&mut link)?;
        self.sensor_count.store(report.sensor_count, Ordering::Relaxed);
        Ok(report)
    }

    fn install_profile(&self, profile: CalibrationProfile) {
        let mut estimator = lock(&self.estimator);
        let was_warning = estimator.bad_calibration_warning();
        estimator.set_profile(profile);
        drop(estimator);
        if was_warning {
            self.publish(StatusEvent::CalibrationWarning(false));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dummy_sensor::DummySensor;
    use std::sync::Arc;
    use std::thread;

    fn session(sensor: DummySensor) -> DeviceSession {
        DeviceSession::connect(Box::new(sensor), DeviceSettings::default())
    }

    fn drain(rx: &Receiver<StatusEvent>) -> Vec<StatusEvent> {
        rx.try_iter().collect()
    }

    /// A session whose calibration is far too narrow for what the sensor
    /// reads, polled until the warning goes up.
    fn miscalibrated(sensor: DummySensor) -> DeviceSession {
        let mut settings = DeviceSettings::default();
        settings.estimator.bad_calibration_threshold = 2;
        let session = DeviceSession::connect(Box::new(sensor), settings);
        lock(&session.estimator)
            .set_profile(CalibrationProfile::from_bounds(&[100; 6], &[110; 6], false));
        for _ in 0..3 {
            session.read_position().unwrap();
        }
        assert!(session.bad_calibration_warning());
        session
    }

    #[test]
    fn reads_position_and_counts_sensors() {
        let session = session(DummySensor::builder().sensors(10).depth(0.3).build());
        assert_eq!(session.state(), DeviceState::Ok);
        let sample = session.read_position().unwrap();
        assert!((sample.value - 0.7).abs() < 0.15);
        assert_eq!(session.sensor_count(), Some(10));
    }

    #[test]
    fn protocol_errors_mark_the_device_and_recover() {
        let sensor = DummySensor::builder().sensors(4).build();
        let controller = sensor.controller();
        let session = session(sensor);
        let events = session.subscribe();

        controller.set_garbled(true);
        assert!(matches!(
            session.read_position(),
            Err(RelayError::ProtocolMismatch(_))
        ));
        assert_eq!(session.state(), DeviceState::Error);

        controller.set_garbled(false);
        session.read_position().unwrap();
        assert_eq!(
            drain(&events),
            vec![
                StatusEvent::State(DeviceState::Error),
                StatusEvent::State(DeviceState::Ok),
            ]
        );
    }

    #[test]
    fn firmware_version_is_cached() {
        let sensor = DummySensor::builder().sensors(4).build();
        let controller = sensor.controller();
        let session = session(sensor);
        let version = session.firmware_version().unwrap();
        controller.set_garbled(true);
        assert_eq!(session.firmware_version().unwrap(), version);
    }

    #[test]
    fn fresh_session_has_no_warning() {
        let session = session(DummySensor::builder().sensors(6).build());
        assert!(!session.bad_calibration_warning());
        assert!(session.check_calibration().is_ok());
    }

    #[test]
    fn calibration_installs_profile_and_clears_warning() {
        let session = miscalibrated(
            DummySensor::builder()
                .sensors(6)
                .stroke_period(Duration::from_millis(150))
                .build(),
        );
        let events = session.subscribe();
        assert!(matches!(
            session.check_calibration(),
            Err(RelayError::CalibrationInvalid)
        ));

        let report = session
            .calibrate(CalibrationOptions {
                duration: Duration::from_millis(400),
                sample_interval: Duration::from_millis(2),
                ..CalibrationOptions::default()
            })
            .unwrap();

        assert_eq!(session.profile(), report.profile);
        assert!(!session.bad_calibration_warning());
        assert_eq!(session.state(), DeviceState::Ok);
        assert_eq!(
            drain(&events),
            vec![
                StatusEvent::State(DeviceState::Calibrating),
                StatusEvent::CalibrationWarning(false),
                StatusEvent::State(DeviceState::Ok),
            ]
        );
    }

    #[test]
    fn ambient_mode_switch_keeps_the_warning() {
        let session = miscalibrated(DummySensor::builder().sensors(6).build());
        let events = session.subscribe();

        session.set_ambient_mode(true).unwrap();

        assert!(session.profile().ambient_light_mode());
        assert_eq!(session.profile().low()[0], 100);
        assert!(session.bad_calibration_warning());
        assert!(drain(&events).is_empty());
    }

    #[test]
    fn polling_during_calibration_is_busy_not_an_error() {
        let session = Arc::new(session(
            DummySensor::builder()
                .sensors(6)
                .stroke_period(Duration::from_millis(150))
                .build(),
        ));
        let calibrating = Arc::clone(&session);
        let handle = thread::spawn(move || {
            calibrating.calibrate(CalibrationOptions {
                duration: Duration::from_millis(500),
                sample_interval: Duration::from_millis(2),
                save: false,
                ..CalibrationOptions::default()
            })
        });

        thread::sleep(Duration::from_millis(100));
        assert!(matches!(
            session.read_position(),
            Err(RelayError::DeviceBusy)
        ));
        assert_eq!(session.state(), DeviceState::Calibrating);
        assert!(handle.join().unwrap().is_ok());
        assert!(session.read_position().is_ok());
    }

    #[test]
    fn load_calibration_round_trips_through_device() {
        let session = session(DummySensor::builder().sensors(3).build());
        session.set_ambient_mode(true).unwrap();
        session.read_position().unwrap();
        session.save_calibration().unwrap();
        session.load_calibration().unwrap();
        assert!(session.profile().ambient_light_mode());
        assert!(!session.bad_calibration_warning());
    }
}
