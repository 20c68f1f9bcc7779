//! Runs a simulated sensor array through the estimator and output
//! processor, and charts raw against processed positions.

mod gui;

use std::{sync::Arc, time::Duration};

use clap::Parser;
use log::warn;
use stroke_relay::{
    calibration::CalibrationOptions,
    device_session::{DeviceSession, DeviceSettings},
    dummy_sensor::DummySensor,
    output_processor::{OutputProcessor, OutputSettings, OutputStrategy},
    pipeline::{Pipeline, PipelineSettings},
};

use gui::engage_gui;

#[derive(Debug, Parser)]
#[clap(version, about)]
struct MonitorArgs {
    /// Output shaping strategy to watch
    #[arg(short, long, value_enum, default_value_t = OutputStrategy::Buffered)]
    strategy: OutputStrategy,

    /// Length of one simulated stroke, in milliseconds
    #[arg(short, long, default_value_t = 1200)]
    period_ms: u64,

    /// Random jitter added to every simulated sensor reading
    #[arg(short, long, default_value_t = 6)]
    noise: u8,
}

fn main() {
    env_logger::init();
    let args = MonitorArgs::parse();

    let sensor = DummySensor::builder()
        .sensors(10)
        .stroke_period(Duration::from_millis(args.period_ms))
        .noise(args.noise)
        .build();
    let session = Arc::new(DeviceSession::connect(
        Box::new(sensor),
        DeviceSettings::default(),
    ));

    let quick = CalibrationOptions {
        duration: Duration::from_secs(2),
        save: false,
        ..CalibrationOptions::default()
    };
    if let Err(e) = session.calibrate(quick) {
        warn!("calibration failed, running uncalibrated: {e}");
    }

    let processor = OutputProcessor::new(OutputSettings {
        strategy: args.strategy,
        ..OutputSettings::default()
    });
    let (pipeline, output) = Pipeline::spawn(session, processor, PipelineSettings::default());

    if let Err(e) = engage_gui(output, args.strategy) {
        eprintln!("{e}");
    }

    pipeline.stop();
}
