//! The crate-level error taxonomy. Each concern keeps its own error type
//! close to the code that raises it; [`RelayError`] is what they all
//! collapse into once they cross a module boundary, e.g. in the binaries.

use std::{error::Error, fmt::Display};

use crate::calibration::CalibrationError;
use crate::config::ConfigError;
use crate::gui::GuiError;
use crate::position_estimator::EstimateError;
use crate::recorder::RecorderError;
use crate::sensor_link::LinkError;
use crate::stream_sync::StreamError;

/// Everything that can go wrong between the sensor and an actuator.
#[derive(Debug)]
pub enum RelayError {
    /// The sensor link could not be acquired in time. Retry next cycle.
    DeviceBusy,
    /// The device answered with something that was not a valid response.
    ProtocolMismatch(String),
    /// Calibration bounds are clearly wrong for the current readings.
    CalibrationInvalid,
    /// A single network request failed, the session is still usable.
    NetworkTransient(String),
    /// The remote side rejected our credentials. Terminal for the session.
    NetworkAuth(String),
    /// Remote playback stopped advancing.
    RemoteStalled,
    /// The device reported zero sensors.
    EmptyFrame,
    /// The device did not answer before the deadline.
    Timeout,
    #[allow(missing_docs)]
    Io(std::io::Error),
    #[allow(missing_docs)]
    Config(ConfigError),
    #[allow(missing_docs)]
    Recorder(RecorderError),
    #[allow(missing_docs)]
    Gui(GuiError),
}

impl Display for RelayError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RelayError::DeviceBusy => write!(f, "device busy"),
            RelayError::ProtocolMismatch(why) => write!(f, "protocol mismatch: {why}"),
            RelayError::CalibrationInvalid => {
                write!(f, "calibration looks invalid, please recalibrate")
            }
            RelayError::NetworkTransient(why) => write!(f, "network error: {why}"),
            RelayError::NetworkAuth(why) => write!(f, "authentication failed: {why}"),
            RelayError::RemoteStalled => write!(f, "remote playback stalled"),
            RelayError::EmptyFrame => write!(f, "device reported no sensors"),
            RelayError::Timeout => write!(f, "device timed out"),
            RelayError::Io(e) => write!(f, "i/o error: {e}"),
            RelayError::Config(e) => write!(f, "{e}"),
            RelayError::Recorder(e) => write!(f, "{e}"),
            RelayError::Gui(e) => write!(f, "{e}"),
        }
    }
}

impl Error for RelayError {}

impl From<std::io::Error> for RelayError {
    fn from(value: std::io::Error) -> Self {
        Self::Io(value)
    }
}

impl From<LinkError> for RelayError {
    fn from(value: LinkError) -> Self {
        match value {
            LinkError::Busy => Self::DeviceBusy,
            LinkError::Timeout => Self::Timeout,
            LinkError::ProtocolMismatch(why) => Self::ProtocolMismatch(why),
            LinkError::Io(e) => Self::Io(e),
        }
    }
}

impl From<CalibrationError> for RelayError {
    fn from(value: CalibrationError) -> Self {
        match value {
            CalibrationError::Link(e) => e.into(),
            CalibrationError::NoSensors => Self::EmptyFrame,
        }
    }
}

impl From<EstimateError> for RelayError {
    fn from(value: EstimateError) -> Self {
        match value {
            EstimateError::EmptyFrame => Self::EmptyFrame,
        }
    }
}

impl From<StreamError> for RelayError {
    fn from(value: StreamError) -> Self {
        match value {
            StreamError::Transient(why) => Self::NetworkTransient(why),
            StreamError::Auth(why) => Self::NetworkAuth(why),
            StreamError::Stalled => Self::RemoteStalled,
            StreamError::Remote { code, message } => {
                Self::NetworkTransient(format!("remote error {code}: {message}"))
            }
        }
    }
}

impl From<ConfigError> for RelayError {
    fn from(value: ConfigError) -> Self {
        Self::Config(value)
    }
}

impl From<RecorderError> for RelayError {
    fn from(value: RecorderError) -> Self {
        Self::Recorder(value)
    }
}

impl From<GuiError> for RelayError {
    fn from(value: GuiError) -> Self {
        Self::Gui(value)
    }
}
