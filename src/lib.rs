//! Stroke relay reads a linear array of light sensors over a serial link,
//! turns each frame of readings into a single insertion position, shapes
//! the resulting position stream, and hands it to an output device: a
//! local script recorder, a remote streaming player, or a remote device
//! driven one direct move at a time.
//!
//! The pieces, from the device outwards:
//!
//! - [sensor_link] and [hardware_message_decoder] speak the device's wire
//!   protocol, with a bounded-wait lock for polling and a long-held
//!   exclusive lock for calibration.
//! - [calibration] measures per-sensor bounds and picks a lighting mode.
//! - [position_estimator] turns a frame into a position.
//! - [device_session] owns all of the above for one connected device.
//! - [output_processor] and [curve_reducer] shape the position stream.
//! - [pipeline] runs polling and shaping on their own threads.
//! - [actuator], [recorder] and [stream_sync] deliver the result.

#![warn(missing_docs)]
pub mod actuator;
pub mod args;
pub mod calibration;
pub mod component;
pub mod config;
pub mod curve_reducer;
pub mod device_session;
pub mod dummy_sensor;
pub mod error;
pub mod gui;
pub mod hardware_message_decoder;
pub mod output_processor;
pub mod pipeline;
pub mod position_estimator;
pub mod recorder;
pub mod sensor_link;
pub mod stream_sync;
