//! A simulated sensor array that speaks the device's wire protocol, for
//! tests and for running the pipeline without hardware.
//!
//! The simulated probe is pushed into the array from sensor 0 onwards,
//! either to a fixed depth or following a slow sine stroke. What each sensor
//! reads back depends on whether it is covered, on the room's lighting and on
//! the device's ambient-light mode, roughly the way the real optics behave.

use crate::calibration::CalibrationProfile;
use crate::hardware_message_decoder::{
    encode_calibration_payload, Command, REQUEST_MAGIC, RESPONSE_MAGIC,
};
use crate::sensor_link::Transport;

use log::warn;
use rand::prelude::*;
use std::collections::VecDeque;
use std::f64::consts::PI;
use std::io;
use std::sync::mpsc;
use std::thread;
use std::time::{Duration, Instant};

/// Firmware version the simulated device reports.
pub const DUMMY_FIRMWARE_VERSION: u8 = 3;

enum Signal {
    Depth(f64),
    StrokePeriod(Duration),
    Noise(u8),
    Bright(bool),
    Garbled(bool),
}

/// How far the probe is pushed in.
#[derive(Debug, Clone, Copy, PartialEq)]
enum Motion {
    Fixed(f64),
    Stroke(Duration),
}

/// The simulated device. Hand it to a [`SensorLink`](crate::sensor_link::SensorLink)
/// as its transport.
pub struct DummySensor {
    sensors: usize,
    motion: Motion,
    noise: u8,
    bright: bool,
    garbled: bool,
    delay: Option<Duration>,
    ambient_mode: bool,
    stored: Option<(usize, CalibrationProfile)>,
    started: Instant,
    pending: VecDeque<u8>,
    rx: mpsc::Receiver<Signal>,
    tx: mpsc::Sender<Signal>,
}

/// Changes a [`DummySensor`]'s behavior after it has been moved into a link.
#[derive(Clone)]
pub struct DummyController {
    tx: mpsc::Sender<Signal>,
}

impl DummyController {
    fn send(&self, signal: Signal) {
        if self.tx.send(signal).is_err() {
            warn!("dummy sensor is gone, control signal dropped");
        }
    }

    /// Hold the probe at a fixed depth, 0.0 out to 1.0 fully in.
    pub fn set_depth(&self, depth: f64) {
        self.send(Signal::Depth(depth));
    }

    /// Stroke the probe in and out with the given period.
    pub fn set_stroke_period(&self, period: Duration) {
        self.send(Signal::StrokePeriod(period));
    }

    /// Add up to `noise` counts of jitter to every reading.
    pub fn set_noise(&self, noise: u8) {
        self.send(Signal::Noise(noise));
    }

    /// Flood the room with light, or not.
    pub fn set_bright_ambient(&self, bright: bool) {
        self.send(Signal::Bright(bright));
    }

    /// Make the device answer with a corrupt magic prefix.
    pub fn set_garbled(&self, garbled: bool) {
        self.send(Signal::Garbled(garbled));
    }
}

/// Builds a [`DummySensor`].
#[derive(Debug, Clone)]
pub struct DummySensorBuilder {
    sensors: usize,
    motion: Motion,
    noise: u8,
    bright: bool,
    garbled: bool,
    delay: Option<Duration>,
}

impl Default for DummySensorBuilder {
    fn default() -> Self {
        Self {
            sensors: 10,
            motion: Motion::Fixed(0.0),
            noise: 0,
            bright: false,
            garbled: false,
            delay: None,
        }
    }
}

impl DummySensorBuilder {
    /// Number of sensors on the array.
    pub fn sensors(mut self, sensors: usize) -> Self {
        self.sensors = sensors;
        self
    }

    /// Hold the probe at a fixed depth.
    pub fn depth(mut self, depth: f64) -> Self {
        self.motion = Motion::Fixed(depth.clamp(0.0, 1.0));
        self
    }

    /// Stroke the probe with the given period.
    pub fn stroke_period(mut self, period: Duration) -> Self {
        self.motion = Motion::Stroke(period);
        self
    }

    /// Reading jitter, in raw counts.
    pub fn noise(mut self, noise: u8) -> Self {
        self.noise = noise;
        self
    }

    /// Bright room lighting.
    pub fn bright_ambient(mut self, bright: bool) -> Self {
        self.bright = bright;
        self
    }

    /// Answer every request with a corrupt prefix.
    pub fn garbled(mut self, garbled: bool) -> Self {
        self.garbled = garbled;
        self
    }

    /// Block inside every transaction for this long.
    pub fn transaction_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    #[allow(missing_docs)]
    pub fn build(self) -> DummySensor {
        let (tx, rx) = mpsc::channel();
        DummySensor {
            sensors: self.sensors,
            motion: self.motion,
            noise: self.noise,
            bright: self.bright,
            garbled: self.garbled,
            delay: self.delay,
            ambient_mode: false,
            stored: None,
            started: Instant::now(),
            pending: VecDeque::new(),
            rx,
            tx,
        }
    }
}

impl DummySensor {
    #[allow(missing_docs)]
    pub fn builder() -> DummySensorBuilder {
        DummySensorBuilder::default()
    }

    /// A handle that keeps working after the sensor is boxed into a link.
    pub fn controller(&self) -> DummyController {
        DummyController {
            tx: self.tx.clone(),
        }
    }

    /// Where the probe currently is, 0.0 out to 1.0 fully in.
    pub fn depth(&self) -> f64 {
        match self.motion {
            Motion::Fixed(depth) => depth,
            Motion::Stroke(period) => {
                let phase = self.started.elapsed().as_secs_f64() / period.as_secs_f64().max(1e-3);
                0.5 - 0.5 * (2.0 * PI * phase).cos()
            }
        }
    }

    fn apply_signals(&mut self) {
        while let Ok(signal) = self.rx.try_recv() {
            match signal {
                Signal::Depth(depth) => self.motion = Motion::Fixed(depth.clamp(0.0, 1.0)),
                Signal::StrokePeriod(period) => self.motion = Motion::Stroke(period),
                Signal::Noise(noise) => self.noise = noise,
                Signal::Bright(bright) => self.bright = bright,
                Signal::Garbled(garbled) => self.garbled = garbled,
            }
        }
    }

    /// Raw reading of one sensor, before the firmware's one-high encoding.
    fn reading(&self, covered: bool) -> u8 {
        let (covered_level, clear_level) = match (self.bright, self.ambient_mode) {
            (false, false) => (210, 25),
            (false, true) => (60, 45),
            (true, false) => (120, 100),
            (true, true) => (40, 200),
        };
        let level: i32 = if covered { covered_level } else { clear_level };
        let jitter = if self.noise > 0 {
            let n = self.noise as i32;
            thread_rng().gen_range(-n..=n)
        } else {
            0
        };
        (level + jitter).clamp(0, 254) as u8
    }

    fn sensor_values(&self) -> Vec<u8> {
        let depth = self.depth();
        let n = self.sensors;
        (0..n)
            .map(|i| {
                let covered = (i as f64 + 0.5) / n as f64 <= depth;
                self.reading(covered) + 1
            })
            .collect()
    }

    fn respond(&mut self, request: &[u8]) -> Vec<u8> {
        let magic = if self.garbled { *b"XR" } else { RESPONSE_MAGIC };
        if request.len() < 3 || request[..2] != REQUEST_MAGIC {
            return Vec::new();
        }
        let command_byte = request[2];
        let payload = &request[3..];

        let mut response = magic.to_vec();
        response.push(command_byte);
        match Command::from_byte(command_byte) {
            Some(Command::GetSensorValues) => {
                let values = self.sensor_values();
                response.push(values.len() as u8);
                response.extend(values);
            }
            Some(Command::GetFirmwareVersion) => response.push(DUMMY_FIRMWARE_VERSION),
            Some(Command::SaveCalibrationValues) => {
                if payload.len() >= 2 {
                    let n = payload[0] as usize;
                    let bounds = &payload[2..];
                    let low: Vec<u8> = bounds.iter().step_by(2).copied().take(n).collect();
                    let high: Vec<u8> = bounds.iter().skip(1).step_by(2).copied().take(n).collect();
                    let profile = CalibrationProfile::from_bounds(&low, &high, payload[1] == 1);
                    self.stored = Some((n, profile));
                }
            }
            Some(Command::LoadCalibrationValues) => {
                let (n, profile) = self
                    .stored
                    .clone()
                    .unwrap_or_else(|| (self.sensors, CalibrationProfile::default()));
                response.extend(encode_calibration_payload(&profile, n));
            }
            Some(Command::SetAmbientMode) => {
                self.ambient_mode = payload.first() == Some(&1);
            }
            None => {}
        }
        response
    }
}

impl Transport for DummySensor {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.apply_signals();
        if let Some(delay) = self.delay {
            thread::sleep(delay);
        }
        let response = self.respond(buf);
        self.pending = response.into();
        Ok(buf.len())
    }

    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = buf.len().min(self.pending.len());
        for (slot, byte) in buf.iter_mut().zip(self.pending.drain(..n)) {
            *slot = byte;
        }
        Ok(n)
    }
}
