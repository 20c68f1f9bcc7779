//! Command line arguments for `strokerelay`.

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

use crate::{config::RelayConfig, output_processor::OutputStrategy};

/// Relay strokes measured by a sensor array to an output device.
#[derive(Debug, Parser, Clone)]
#[clap(version, about)]
pub struct RelayArgs {
    #[command(subcommand)]
    /// What to do with the measured strokes
    pub command: CommandTask,

    /// Serial port of the sensor device. Without it, a list of ports is shown
    #[arg(short, long, global = true)]
    pub port: Option<PathBuf>,

    /// Configuration file to read
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Output shaping strategy
    #[arg(short, long, value_enum, global = true)]
    pub strategy: Option<OutputStrategy>,

    /// Window of the buffered strategy, in milliseconds
    #[arg(long, global = true)]
    pub filter_ms: Option<u64>,

    /// Simplification tolerance of the buffered strategy
    #[arg(long, global = true)]
    pub epsilon: Option<f64>,

    /// Use a simulated sensor device instead of real hardware
    #[arg(long, global = true)]
    pub simulate: bool,
}

#[allow(missing_docs)]
#[derive(Debug, Subcommand, Clone)]
pub enum CommandTask {
    /// Calibrate the sensor device for the current lighting
    #[command(about)]
    Calibrate(CalibrateCommand),

    /// Show live positions without sending them anywhere
    #[command(about)]
    Monitor,

    /// Record strokes into a motion script file
    #[command(about)]
    Record(RecordCommand),

    /// Stream strokes to a remote player
    #[command(about)]
    Stream(StreamCommand),

    /// Send every stroke to a remote device as a direct move
    #[command(about)]
    Direct(DirectCommand),
}

#[allow(missing_docs)]
#[derive(Debug, Args, Clone)]
pub struct CalibrateCommand {
    /// Total calibration time, in seconds
    #[arg(long)]
    pub seconds: Option<u64>,

    /// Keep the result for this run only, without saving it on the device
    #[arg(long)]
    pub no_save: bool,
}

#[allow(missing_docs)]
#[derive(Debug, Args, Clone)]
pub struct RecordCommand {
    /// Script file to write. Existing files are never replaced
    #[arg(short = 'o', long = "out")]
    pub outfile: Option<PathBuf>,
}

#[allow(missing_docs)]
#[derive(Debug, Args, Clone)]
pub struct StreamCommand {
    /// Connection key of the remote device
    #[arg(short, long)]
    pub key: Option<String>,
}

#[allow(missing_docs)]
#[derive(Debug, Args, Clone)]
pub struct DirectCommand {
    /// Connection key of the remote device
    #[arg(short, long)]
    pub key: Option<String>,
}

impl RelayArgs {
    /// Fold the command line overrides into `config`.
    pub fn apply(&self, config: &mut RelayConfig) {
        if let Some(strategy) = self.strategy {
            config.output.strategy = strategy;
        }
        if let Some(filter_ms) = self.filter_ms {
            config.output.filter_ms = filter_ms;
        }
        if let Some(epsilon) = self.epsilon {
            config.output.epsilon = epsilon;
        }
        match &self.command {
            CommandTask::Calibrate(cmd) => {
                if let Some(seconds) = cmd.seconds {
                    config.device.calibration_seconds = seconds;
                }
            }
            CommandTask::Record(cmd) => {
                if let Some(outfile) = &cmd.outfile {
                    config.recorder.output_path = outfile.clone();
                }
            }
            CommandTask::Stream(cmd) => {
                if let Some(key) = &cmd.key {
                    config.stream.connection_key = key.clone();
                }
            }
            CommandTask::Direct(cmd) => {
                if let Some(key) = &cmd.key {
                    config.direct.connection_key = key.clone();
                }
            }
            CommandTask::Monitor => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn global_flags_after_the_subcommand() {
        let args = RelayArgs::try_parse_from([
            "strokerelay",
            "stream",
            "--key",
            "abc",
            "--strategy",
            "buffered",
            "--filter-ms",
            "750",
            "--simulate",
        ])
        .unwrap();
        assert!(args.simulate);

        let mut config = RelayConfig::default();
        args.apply(&mut config);
        assert_eq!(config.stream.connection_key, "abc");
        assert_eq!(config.output.strategy, OutputStrategy::Buffered);
        assert_eq!(config.output.filter_ms, 750);
        assert_eq!(config.direct.connection_key, "");
    }

    #[test]
    fn calibrate_options() {
        let args =
            RelayArgs::try_parse_from(["strokerelay", "calibrate", "--seconds", "4", "--no-save"])
                .unwrap();
        let CommandTask::Calibrate(cmd) = &args.command else {
            panic!("expected calibrate, got {:?}", args.command);
        };
        assert!(cmd.no_save);

        let mut config = RelayConfig::default();
        args.apply(&mut config);
        assert_eq!(config.device.calibration_seconds, 4);
    }

    #[test]
    fn record_output_path() {
        let args = RelayArgs::try_parse_from(["strokerelay", "-p", "/dev/ttyACM0", "record", "-o", "take.funscript"])
            .unwrap();
        assert_eq!(args.port, Some(PathBuf::from("/dev/ttyACM0")));
        let mut config = RelayConfig::default();
        args.apply(&mut config);
        assert_eq!(config.recorder.output_path, PathBuf::from("take.funscript"));
    }

    #[test]
    fn unknown_strategy_is_rejected() {
        assert!(RelayArgs::try_parse_from(["strokerelay", "monitor", "--strategy", "sideways"]).is_err());
    }
}
