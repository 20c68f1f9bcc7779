//! The half-duplex request/response channel to the sensor array.
//!
//! A [`SensorLink`] owns a [`Transport`] behind a mutex and only ever lets
//! one transaction be outstanding. There are two ways in:
//!
//! - the per-call methods ([`SensorLink::request_frame`] and friends) try to
//!   acquire the transport for a short, bounded time and fail with
//!   [`LinkError::Busy`] instead of queuing behind someone else, so a poll
//!   loop can skip a tick and carry on;
//! - [`SensorLink::exclusive`] hands out an [`ExclusiveLink`] that holds the
//!   transport until it is dropped. Its transactions do no locking of their
//!   own. This is what the calibration routine runs on.

use log::{debug, trace};
use serial2::SerialPort;

use std::{
    fmt::Display,
    io,
    sync::{Mutex, MutexGuard, TryLockError},
    thread,
    time::{Duration, Instant},
};

use crate::calibration::CalibrationProfile;
use crate::hardware_message_decoder::{
    decode_ack, decode_calibration, decode_firmware_version, decode_sensor_values,
    encode_calibration_payload, encode_request, Command, DecodeError, SensorFrame,
};

/// Default bound on how long a per-call transaction waits for the link.
pub const DEFAULT_BOUNDED_WAIT: Duration = Duration::from_millis(100);

/// Default bound on how long we wait for a complete response.
pub const DEFAULT_RESPONSE_TIMEOUT: Duration = Duration::from_millis(500);

/// Size of a single read from the transport. The device answers in USB
/// packets of this size.
const READ_CHUNK: usize = 64;

/// A byte pipe to the device. Both calls are expected to be bounded by the
/// transport's own timeouts.
pub trait Transport: Send {
    /// Write a request packet, returning how many bytes were accepted.
    fn write(&mut self, buf: &[u8]) -> io::Result<usize>;

    /// Read whatever part of the response is available. `Ok(0)` means the
    /// device has nothing more to say.
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize>;
}

impl Transport for SerialPort {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        SerialPort::write(self, buf)
    }

    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        SerialPort::read(self, buf)
    }
}

/// Why a transaction on the link failed.
#[derive(Debug)]
pub enum LinkError {
    /// Somebody else holds the link and did not let go in time.
    Busy,
    /// The device did not produce a complete response before the deadline.
    Timeout,
    /// The device answered with something that does not match the request.
    ProtocolMismatch(String),
    /// The transport itself failed.
    Io(io::Error),
}

impl Display for LinkError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LinkError::Busy => write!(f, "sensor link busy"),
            LinkError::Timeout => write!(f, "sensor link timed out"),
            LinkError::ProtocolMismatch(why) => write!(f, "protocol mismatch: {why}"),
            LinkError::Io(e) => write!(f, "sensor link i/o error: {e}"),
        }
    }
}

impl std::error::Error for LinkError {}

impl From<io::Error> for LinkError {
    fn from(value: io::Error) -> Self {
        match value.kind() {
            io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock => Self::Timeout,
            _ => Self::Io(value),
        }
    }
}

type Guard<'a> = MutexGuard<'a, Box<dyn Transport>>;

/// Mutually exclusive access to the sensor array.
pub struct SensorLink {
    transport: Mutex<Box<dyn Transport>>,
    bounded_wait: Duration,
    response_timeout: Duration,
}

impl SensorLink {
    /// Wrap a transport with the default timeouts.
    pub fn new(transport: Box<dyn Transport>) -> Self {
        Self {
            transport: Mutex::new(transport),
            bounded_wait: DEFAULT_BOUNDED_WAIT,
            response_timeout: DEFAULT_RESPONSE_TIMEOUT,
        }
    }

    /// Change how long per-call transactions wait for the link.
    pub fn with_bounded_wait(mut self, wait: Duration) -> Self {
        self.bounded_wait = wait;
        self
    }

    /// Change how long a transaction waits for its response.
    pub fn with_response_timeout(mut self, timeout: Duration) -> Self {
        self.response_timeout = timeout;
        self
    }

    /// Try to take the transport for up to `wait`. A poisoned lock still
    /// hands out the transport, the protocol state lives on the device.
    fn try_lock_for(&self, wait: Duration) -> Result<Guard<'_>, LinkError> {
        let deadline = Instant::now() + wait;
        loop {
            match self.transport.try_lock() {
                Ok(guard) => return Ok(guard),
                Err(TryLockError::Poisoned(poisoned)) => return Ok(poisoned.into_inner()),
                Err(TryLockError::WouldBlock) => {}
            }
            if Instant::now() >= deadline {
                trace!("sensor link still held after {wait:?}");
                return Err(LinkError::Busy);
            }
            thread::sleep(Duration::from_millis(1));
        }
    }

    /// Read one frame of raw sensor values.
    pub fn request_frame(&self) -> Result<SensorFrame, LinkError> {
        let mut guard = self.try_lock_for(self.bounded_wait)?;
        request_frame(&mut **guard, self.response_timeout)
    }

    /// Ask the device for its firmware version.
    pub fn firmware_version(&self) -> Result<u8, LinkError> {
        let mut guard = self.try_lock_for(self.bounded_wait)?;
        transact(
            &mut **guard,
            Command::GetFirmwareVersion,
            &[],
            self.response_timeout,
            decode_firmware_version,
        )
    }

    /// Read the calibration stored on the device.
    pub fn load_calibration(&self) -> Result<CalibrationProfile, LinkError> {
        let mut guard = self.try_lock_for(self.bounded_wait)?;
        load_calibration(&mut **guard, self.response_timeout)
    }

    /// Store a calibration on the device for its first `sensor_count` channels.
    pub fn save_calibration(
        &self,
        profile: &CalibrationProfile,
        sensor_count: usize,
    ) -> Result<(), LinkError> {
        let mut guard = self.try_lock_for(self.bounded_wait)?;
        save_calibration(&mut **guard, profile, sensor_count, self.response_timeout)
    }

    /// Switch the device's ambient-light (sunlight) mode.
    pub fn set_ambient_mode(&self, enabled: bool) -> Result<(), LinkError> {
        let mut guard = self.try_lock_for(self.bounded_wait)?;
        set_ambient_mode(&mut **guard, enabled, self.response_timeout)
    }

    /// Hold the link until the returned guard is dropped. Fails with
    /// [`LinkError::Busy`] if it cannot be taken within `wait`.
    pub fn exclusive(&self, wait: Duration) -> Result<ExclusiveLink<'_>, LinkError> {
        let guard = self.try_lock_for(wait)?;
        debug!("sensor link held exclusively");
        Ok(ExclusiveLink {
            guard,
            response_timeout: self.response_timeout,
        })
    }
}

/// Long-held ownership of a [`SensorLink`]. Transactions through here do not
/// lock again; every other caller sees [`LinkError::Busy`] until this is
/// dropped.
pub struct ExclusiveLink<'a> {
    guard: Guard<'a>,
    response_timeout: Duration,
}

impl ExclusiveLink<'_> {
    /// Read one frame of raw sensor values.
    pub fn request_frame(&mut self) -> Result<SensorFrame, LinkError> {
        request_frame(&mut **self.guard, self.response_timeout)
    }

    /// Read the calibration stored on the device.
    pub fn load_calibration(&mut self) -> Result<CalibrationProfile, LinkError> {
        load_calibration(&mut **self.guard, self.response_timeout)
    }

    /// Store a calibration on the device.
    pub fn save_calibration(
        &mut self,
        profile: &CalibrationProfile,
        sensor_count: usize,
    ) -> Result<(), LinkError> {
        save_calibration(
            &mut **self.guard,
            profile,
            sensor_count,
            self.response_timeout,
        )
    }

    /// Switch the device's ambient-light mode.
    pub fn set_ambient_mode(&mut self, enabled: bool) -> Result<(), LinkError> {
        set_ambient_mode(&mut **self.guard, enabled, self.response_timeout)
    }
}

impl Drop for ExclusiveLink<'_> {
    fn drop(&mut self) {
        debug!("sensor link released");
    }
}

fn request_frame(
    transport: &mut dyn Transport,
    timeout: Duration,
) -> Result<SensorFrame, LinkError> {
    transact(
        transport,
        Command::GetSensorValues,
        &[],
        timeout,
        decode_sensor_values,
    )
}

fn load_calibration(
    transport: &mut dyn Transport,
    timeout: Duration,
) -> Result<CalibrationProfile, LinkError> {
    transact(
        transport,
        Command::LoadCalibrationValues,
        &[],
        timeout,
        decode_calibration,
    )
}

fn save_calibration(
    transport: &mut dyn Transport,
    profile: &CalibrationProfile,
    sensor_count: usize,
    timeout: Duration,
) -> Result<(), LinkError> {
    let payload = encode_calibration_payload(profile, sensor_count);
    transact(
        transport,
        Command::SaveCalibrationValues,
        &payload,
        timeout,
        |bytes| decode_ack(Command::SaveCalibrationValues, bytes),
    )
}

fn set_ambient_mode(
    transport: &mut dyn Transport,
    enabled: bool,
    timeout: Duration,
) -> Result<(), LinkError> {
    transact(
        transport,
        Command::SetAmbientMode,
        &[enabled as u8],
        timeout,
        |bytes| decode_ack(Command::SetAmbientMode, bytes),
    )
}

/// Send one request and keep reading until the response decodes, turns out
/// to be garbage, or the deadline passes.
fn transact<T>(
    transport: &mut dyn Transport,
    command: Command,
    payload: &[u8],
    timeout: Duration,
    decode: impl Fn(&[u8]) -> Result<T, DecodeError>,
) -> Result<T, LinkError> {
    let request = encode_request(command, payload);
    let written = transport.write(&request)?;
    if written != request.len() {
        return Err(LinkError::Io(io::Error::new(
            io::ErrorKind::WriteZero,
            format!("wrote {written} of {} request bytes", request.len()),
        )));
    }

    let deadline = Instant::now() + timeout;
    let mut response = Vec::with_capacity(READ_CHUNK);
    let mut chunk = [0u8; READ_CHUNK];
    loop {
        let read = transport.read(&mut chunk)?;
        response.extend_from_slice(&chunk[..read]);
        match decode(&response) {
            Ok(value) => return Ok(value),
            Err(DecodeError::Mismatch(why)) => return Err(LinkError::ProtocolMismatch(why)),
            Err(DecodeError::Incomplete) => {
                if read == 0 || Instant::now() >= deadline {
                    return Err(LinkError::Timeout);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dummy_sensor::DummySensor;
    use std::collections::VecDeque;
    use std::sync::Arc;

    /// Hands its canned response out a few bytes at a time.
    struct Trickle {
        pending: VecDeque<u8>,
        response: Vec<u8>,
        step: usize,
    }

    impl Transport for Trickle {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.pending = self.response.iter().copied().collect();
            Ok(buf.len())
        }

        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            let n = self.step.min(self.pending.len()).min(buf.len());
            for slot in buf.iter_mut().take(n) {
                *slot = self.pending.pop_front().unwrap();
            }
            Ok(n)
        }
    }

    #[test]
    fn response_split_across_reads_is_reassembled() {
        let link = SensorLink::new(Box::new(Trickle {
            pending: VecDeque::new(),
            response: vec![b'T', b'R', 0x01, 3, 11, 21, 31],
            step: 2,
        }));
        let frame = link.request_frame().unwrap();
        assert_eq!(frame.values(), &[10, 20, 30]);
    }

    #[test]
    fn truncated_response_times_out() {
        let link = SensorLink::new(Box::new(Trickle {
            pending: VecDeque::new(),
            response: vec![b'T', b'R', 0x01, 3, 11],
            step: 64,
        }));
        assert!(matches!(link.request_frame(), Err(LinkError::Timeout)));
    }

    #[test]
    fn garbled_response_is_a_mismatch() {
        let sensor = DummySensor::builder().sensors(4).garbled(true).build();
        let link = SensorLink::new(Box::new(sensor));
        assert!(matches!(
            link.request_frame(),
            Err(LinkError::ProtocolMismatch(_))
        ));
    }

    #[test]
    fn exclusive_holder_makes_others_busy() {
        let sensor = DummySensor::builder().sensors(4).build();
        let link = SensorLink::new(Box::new(sensor));
        {
            let mut held = link.exclusive(Duration::from_millis(10)).unwrap();
            assert_eq!(held.request_frame().unwrap().len(), 4);
            assert!(matches!(link.request_frame(), Err(LinkError::Busy)));
        }
        assert_eq!(link.request_frame().unwrap().len(), 4);
    }

    #[test]
    fn slow_transaction_makes_pollers_skip() {
        let sensor = DummySensor::builder()
            .sensors(4)
            .transaction_delay(Duration::from_millis(400))
            .build();
        let link = Arc::new(SensorLink::new(Box::new(sensor)));

        let slow = Arc::clone(&link);
        let handle = thread::spawn(move || slow.request_frame().map(|f| f.len()));
        thread::sleep(Duration::from_millis(50));

        let started = Instant::now();
        assert!(matches!(link.request_frame(), Err(LinkError::Busy)));
        assert!(started.elapsed() < Duration::from_millis(350));
        assert_eq!(handle.join().unwrap().unwrap(), 4);
    }

    #[test]
    fn ambient_mode_and_calibration_round_trip_through_device() {
        let sensor = DummySensor::builder().sensors(3).build();
        let link = SensorLink::new(Box::new(sensor));
        let profile = CalibrationProfile::from_bounds(&[5, 6, 7], &[200, 201, 202], true);
        link.save_calibration(&profile, 3).unwrap();
        link.set_ambient_mode(true).unwrap();
        assert_eq!(link.load_calibration().unwrap(), profile);
        assert!(link.firmware_version().is_ok());
    }
}
