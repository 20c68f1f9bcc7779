//! Framing for the sensor array's request/response protocol.
//!
//! Every request is `['T', 'C', command, ...payload]` and every response is
//! `['T', 'R', command, ...payload]`. A response is only trusted once the
//! magic prefix and the echoed command byte both match the request, anything
//! else is a [`DecodeError::Mismatch`]. The parsers are written against
//! [nom]'s streaming combinators so that a transport which hands us a packet
//! in pieces can keep reading until [`DecodeError::Incomplete`] goes away.

use nom::{
    bytes::streaming::tag,
    multi::count,
    number::streaming::u8 as byte,
    sequence::pair,
    Err as NomErr, IResult,
};

use std::fmt;

use crate::calibration::{CalibrationProfile, MAX_CHANNELS};

/// Prefix of every request sent to the device.
pub const REQUEST_MAGIC: [u8; 2] = *b"TC";

/// Prefix of every response read back from the device.
pub const RESPONSE_MAGIC: [u8; 2] = *b"TR";

/// The commands this host speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Command {
    /// Payload back: `[sensorCount, value0..valueN]`, values one high.
    GetSensorValues = 0x01,
    /// Payload back: `[version]`.
    GetFirmwareVersion = 0x02,
    /// Payload out: `[sensorCount, ambientFlag, low0, high0, ...]`.
    SaveCalibrationValues = 0x03,
    /// Payload back: `[sensorCount, ambientFlag, low0, high0, ...]`.
    LoadCalibrationValues = 0x04,
    /// Payload out: `[flag]`.
    SetAmbientMode = 0x07,
}

impl Command {
    /// Look up a command from its wire byte.
    pub fn from_byte(b: u8) -> Option<Self> {
        match b {
            0x01 => Some(Self::GetSensorValues),
            0x02 => Some(Self::GetFirmwareVersion),
            0x03 => Some(Self::SaveCalibrationValues),
            0x04 => Some(Self::LoadCalibrationValues),
            0x07 => Some(Self::SetAmbientMode),
            _ => None,
        }
    }
}

/// Encode a request packet.
pub fn encode_request(command: Command, payload: &[u8]) -> Vec<u8> {
    let mut packet = Vec::with_capacity(3 + payload.len());
    packet.extend_from_slice(&REQUEST_MAGIC);
    packet.push(command as u8);
    packet.extend_from_slice(payload);
    packet
}

/// An ordered set of raw sensor readings, index 0 being the sensor at the
/// insertion end of the array. Values are already corrected for the
/// firmware's one-high encoding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SensorFrame {
    values: Vec<u8>,
}

impl SensorFrame {
    /// Build a frame from already-decoded readings.
    pub fn new(values: Vec<u8>) -> Self {
        Self { values }
    }

    /// The readings, insertion end first.
    pub fn values(&self) -> &[u8] {
        &self.values
    }

    /// Number of active sensors.
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// True when the device reported no sensors at all.
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

/// Why a response could not be decoded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    /// More bytes are needed before a decision can be made.
    Incomplete,
    /// The bytes are not a valid response to the request that was sent.
    Mismatch(String),
}

impl fmt::Display for DecodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DecodeError::Incomplete => write!(f, "incomplete response"),
            DecodeError::Mismatch(why) => write!(f, "protocol mismatch: {why}"),
        }
    }
}

impl std::error::Error for DecodeError {}

fn response_header(command: Command, input: &[u8]) -> IResult<&[u8], ()> {
    let echoed = [command as u8];
    let (rest, _) = pair(tag(&RESPONSE_MAGIC[..]), tag(&echoed[..]))(input)?;
    Ok((rest, ()))
}

fn sensor_values(input: &[u8]) -> IResult<&[u8], Vec<u8>> {
    let (rest, n) = byte(input)?;
    if n as usize > MAX_CHANNELS {
        return Err(NomErr::Failure(nom::error::Error::new(
            input,
            nom::error::ErrorKind::TooLarge,
        )));
    }
    count(byte, n as usize)(rest)
}

fn calibration_values(input: &[u8]) -> IResult<&[u8], (u8, Vec<(u8, u8)>)> {
    let (rest, n) = byte(input)?;
    if n as usize > MAX_CHANNELS {
        return Err(NomErr::Failure(nom::error::Error::new(
            input,
            nom::error::ErrorKind::TooLarge,
        )));
    }
    pair(byte, count(pair(byte, byte), n as usize))(rest)
}

fn finish<T>(command: Command, res: IResult<&[u8], T>) -> Result<T, DecodeError> {
    match res {
        Ok((_rest, value)) => Ok(value),
        Err(NomErr::Incomplete(_)) => Err(DecodeError::Incomplete),
        Err(NomErr::Error(e)) | Err(NomErr::Failure(e)) => Err(DecodeError::Mismatch(format!(
            "{:?} response rejected at byte {} ({:?})",
            command,
            e.input.first().copied().unwrap_or_default(),
            e.code
        ))),
    }
}

/// Decode the bare acknowledgment every command answers with. Any payload
/// after the echoed command byte is ignored.
pub fn decode_ack(command: Command, input: &[u8]) -> Result<(), DecodeError> {
    finish(command, response_header(command, input))
}

/// Decode a `GetSensorValues` response into a [SensorFrame].
pub fn decode_sensor_values(input: &[u8]) -> Result<SensorFrame, DecodeError> {
    let command = Command::GetSensorValues;
    let raw = finish(
        command,
        response_header(command, input).and_then(|(rest, _)| sensor_values(rest)),
    )?;
    Ok(SensorFrame::new(
        raw.into_iter().map(|v| v.saturating_sub(1)).collect(),
    ))
}

/// Decode a `GetFirmwareVersion` response.
pub fn decode_firmware_version(input: &[u8]) -> Result<u8, DecodeError> {
    let command = Command::GetFirmwareVersion;
    finish(
        command,
        response_header(command, input).and_then(|(rest, _)| byte(rest)),
    )
}

/// Decode a `LoadCalibrationValues` response into a padded profile.
pub fn decode_calibration(input: &[u8]) -> Result<CalibrationProfile, DecodeError> {
    let command = Command::LoadCalibrationValues;
    let (flag, bounds) = finish(
        command,
        response_header(command, input).and_then(|(rest, _)| calibration_values(rest)),
    )?;
    let (low, high): (Vec<u8>, Vec<u8>) = bounds.into_iter().unzip();
    Ok(CalibrationProfile::from_bounds(&low, &high, flag == 1))
}

/// Encode the payload shared by `SaveCalibrationValues` and the
/// `LoadCalibrationValues` response, for the first `sensor_count` channels.
pub fn encode_calibration_payload(profile: &CalibrationProfile, sensor_count: usize) -> Vec<u8> {
    let n = sensor_count.min(MAX_CHANNELS);
    let mut payload = Vec::with_capacity(2 + n * 2);
    payload.push(n as u8);
    payload.push(profile.ambient_light_mode() as u8);
    for i in 0..n {
        payload.push(profile.low()[i]);
        payload.push(profile.high()[i]);
    }
    payload
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_has_magic_and_command() {
        assert_eq!(
            encode_request(Command::SetAmbientMode, &[1]),
            vec![b'T', b'C', 0x07, 1]
        );
        assert_eq!(
            encode_request(Command::GetSensorValues, &[]),
            vec![b'T', b'C', 0x01]
        );
    }

    #[test]
    fn sensor_values_are_decremented() {
        let packet = [b'T', b'R', 0x01, 3, 1, 129, 255];
        let frame = decode_sensor_values(&packet).unwrap();
        assert_eq!(frame.values(), &[0, 128, 254]);
    }

    #[test]
    fn trailing_padding_is_ignored() {
        let mut packet = vec![b'T', b'R', 0x01, 2, 11, 21];
        packet.resize(64, 0);
        let frame = decode_sensor_values(&packet).unwrap();
        assert_eq!(frame.values(), &[10, 20]);
    }

    #[test]
    fn bad_prefix_is_a_mismatch() {
        let packet = [b'X', b'R', 0x01, 1, 5];
        assert!(matches!(
            decode_sensor_values(&packet),
            Err(DecodeError::Mismatch(_))
        ));
    }

    #[test]
    fn wrong_echoed_command_is_a_mismatch() {
        let packet = [b'T', b'R', 0x04, 1, 5];
        assert!(matches!(
            decode_sensor_values(&packet),
            Err(DecodeError::Mismatch(_))
        ));
    }

    #[test]
    fn short_payload_waits_for_more() {
        let packet = [b'T', b'R', 0x01, 4, 5, 6];
        assert_eq!(decode_sensor_values(&packet), Err(DecodeError::Incomplete));
        assert_eq!(decode_sensor_values(&packet[..2]), Err(DecodeError::Incomplete));
    }

    #[test]
    fn too_many_sensors_is_a_mismatch() {
        let mut packet = vec![b'T', b'R', 0x01, 31];
        packet.extend(std::iter::repeat(100).take(31));
        assert!(matches!(
            decode_sensor_values(&packet),
            Err(DecodeError::Mismatch(_))
        ));
    }

    #[test]
    fn calibration_payload_decodes_and_pads() {
        let packet = [b'T', b'R', 0x04, 2, 1, 10, 200, 20, 210];
        let profile = decode_calibration(&packet).unwrap();
        assert!(profile.ambient_light_mode());
        assert_eq!(&profile.low()[..3], &[10, 20, 0]);
        assert_eq!(&profile.high()[..3], &[200, 210, 255]);
        assert_eq!(profile.low().len(), MAX_CHANNELS);
    }

    #[test]
    fn calibration_payload_encodes_requested_channels() {
        let profile = CalibrationProfile::from_bounds(&[1, 2, 3], &[101, 102, 103], false);
        assert_eq!(
            encode_calibration_payload(&profile, 2),
            vec![2, 0, 1, 101, 2, 102]
        );
    }

    #[test]
    fn ack_and_firmware_version() {
        assert_eq!(decode_ack(Command::SetAmbientMode, b"TR\x07"), Ok(()));
        assert!(decode_ack(Command::SetAmbientMode, b"TR\x03").is_err());
        assert_eq!(decode_firmware_version(b"TR\x02\x05"), Ok(5));
    }
}
