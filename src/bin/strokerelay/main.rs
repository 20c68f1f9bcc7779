//! The command line relay: read strokes from a sensor device and send them
//! on to a recorder, a remote streaming player or a direct-move device.

use clap::Parser;
use log::{error, info, warn};
use serial2::SerialPort;
use stroke_relay::{
    actuator::DirectMoveClient,
    args::{CalibrateCommand, CommandTask, RelayArgs},
    calibration::CalibrationOptions,
    config::RelayConfig,
    curve_reducer::StrokerPoint,
    device_session::DeviceSession,
    dummy_sensor::DummySensor,
    error::RelayError,
    gui,
    output_processor::{OutputEvent, OutputProcessor},
    pipeline::{bridge_to_async, forward_to_actuator, Pipeline},
    recorder::Recorder,
    sensor_link::Transport,
    stream_sync::{HttpStreamApi, StreamApi, StreamSynchronizer},
};
use tokio::runtime::Runtime;

use std::{
    fmt::{self, Display},
    future::Future,
    io,
    process::ExitCode,
    sync::{mpsc::Receiver, Arc},
    thread,
    time::Duration,
};

const BAUD_RATE: u32 = 115200;
const EVENT_BUFFER: usize = 64;
const REFRESH: Duration = Duration::from_millis(100);

fn main() -> ExitCode {
    env_logger::init();
    let args = RelayArgs::parse();

    match run(&args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e}");
            eprintln!("strokerelay: {e}");
            ExitCode::FAILURE
        }
    }
}

fn run(args: &RelayArgs) -> Result<(), RelayError> {
    let mut config = match &args.config {
        Some(path) => RelayConfig::from_path(path)?,
        None => RelayConfig::default(),
    };
    args.apply(&mut config);

    let Some(session) = open_session(args, &config)? else {
        info!("no device selected");
        return Ok(());
    };
    let session = Arc::new(session);
    match session.firmware_version() {
        Ok(version) => info!("sensor firmware version {version}"),
        Err(e) => warn!("could not read firmware version: {e}"),
    }

    match &args.command {
        CommandTask::Calibrate(cmd) => calibrate(&session, &config, cmd),
        CommandTask::Monitor => monitor(session, &config),
        CommandTask::Record(_) => record(session, &config),
        CommandTask::Stream(_) => stream(session, &config),
        CommandTask::Direct(_) => direct(session, &config),
    }
}

fn open_session(args: &RelayArgs, config: &RelayConfig) -> Result<Option<DeviceSession>, RelayError> {
    let settings = config.device_settings();
    let transport: Box<dyn Transport> = if args.simulate {
        info!("using a simulated sensor device");
        Box::new(
            DummySensor::builder()
                .stroke_period(Duration::from_millis(1500))
                .noise(4)
                .build(),
        )
    } else {
        let port = match &args.port {
            Some(port) => port.clone(),
            None => match gui::device_selector(SerialPort::available_ports()?)? {
                Some(port) => port,
                None => return Ok(None),
            },
        };
        let mut serial = SerialPort::open(&port, BAUD_RATE)?;
        serial.set_read_timeout(settings.response_timeout)?;
        serial.set_write_timeout(settings.response_timeout)?;
        info!("opened {}", port.display());
        Box::new(serial)
    };

    let session = DeviceSession::connect(transport, settings);
    if let Err(e) = session.load_calibration() {
        warn!("could not load calibration from the device: {e}");
    }
    Ok(Some(session))
}

fn calibrate(
    session: &DeviceSession,
    config: &RelayConfig,
    cmd: &CalibrateCommand,
) -> Result<(), RelayError> {
    let options = CalibrationOptions {
        save: !cmd.no_save,
        ..config.calibration_options()
    };
    println!(
        "Calibrating for {} s. Move through a few full strokes until it finishes.",
        options.duration.as_secs()
    );
    let report = session.calibrate(options)?;
    println!(
        "{} sensors. Signal spread {} with ambient light mode off, {} with it on.",
        report.sensor_count, report.off_spread, report.on_spread
    );
    println!(
        "Ambient light mode {}.{}",
        if report.ambient_light_mode { "on" } else { "off" },
        if cmd.no_save { " Not saved to the device." } else { "" }
    );
    Ok(())
}

type Notes = Box<dyn FnMut() -> Option<String> + Send>;

/// What the status screen shows while strokes are relayed.
struct LiveStatus {
    session: Arc<DeviceSession>,
    samples: Receiver<StrokerPoint>,
    events: Option<Receiver<OutputEvent>>,
    notes: Option<Notes>,
    position: Option<f64>,
    sample_count: u64,
    event_count: u64,
    note: String,
}

impl LiveStatus {
    fn new(session: Arc<DeviceSession>, samples: Receiver<StrokerPoint>) -> Self {
        Self {
            session,
            samples,
            events: None,
            notes: None,
            position: None,
            sample_count: 0,
            event_count: 0,
            note: String::new(),
        }
    }

    fn refresh(&mut self) {
        thread::sleep(REFRESH);
        for point in self.samples.try_iter() {
            self.position = Some(point.position);
            self.sample_count += 1;
        }
        if let Some(events) = &self.events {
            self.event_count += events.try_iter().count() as u64;
        }
        if let Some(note) = self.notes.as_mut().and_then(|notes| notes()) {
            self.note = note;
        }
    }
}

impl Display for LiveStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Device: {}", self.session.state())?;
        match self.position {
            Some(position) => {
                let filled = (position.clamp(0.0, 1.0) * 40.0).round() as usize;
                writeln!(
                    f,
                    "Position: {position:.2} [{}{}]",
                    "#".repeat(filled),
                    ".".repeat(40 - filled)
                )?;
            }
            None => writeln!(f, "Position: -")?,
        }
        writeln!(f, "Samples: {}", self.sample_count)?;
        if self.events.is_some() {
            writeln!(f, "Output events: {}", self.event_count)?;
        }
        if let Err(e) = self.session.check_calibration() {
            writeln!(f, "{e}")?;
        }
        if !self.note.is_empty() {
            writeln!(f, "{}", self.note)?;
        }
        Ok(())
    }
}

fn monitor(session: Arc<DeviceSession>, config: &RelayConfig) -> Result<(), RelayError> {
    let processor = OutputProcessor::new(config.output_settings());
    let (pipeline, output) =
        Pipeline::spawn(Arc::clone(&session), processor, config.pipeline_settings());

    let mut status = LiveStatus::new(session, output.samples);
    status.events = Some(output.events);
    let shown = gui::run_until_keypress("Monitoring", status, LiveStatus::refresh);

    pipeline.stop();
    shown?;
    Ok(())
}

/// Run the pipeline into `sink` on the runtime until the user presses a key.
fn relay<F, Fut>(
    session: Arc<DeviceSession>,
    config: &RelayConfig,
    runtime: &Runtime,
    title: &str,
    sink: F,
    notes: Option<Notes>,
) -> Result<(), RelayError>
where
    F: FnOnce(tokio::sync::mpsc::Receiver<OutputEvent>) -> Fut,
    Fut: Future<Output = Result<(), RelayError>> + Send + 'static,
{
    let processor = OutputProcessor::new(config.output_settings());
    let (pipeline, output) =
        Pipeline::spawn(Arc::clone(&session), processor, config.pipeline_settings());
    let (bridge, events) = bridge_to_async(output.events, EVENT_BUFFER);
    let task = runtime.spawn(sink(events));

    let mut status = LiveStatus::new(session, output.samples);
    status.notes = notes;
    let shown = gui::run_until_keypress(title, status, LiveStatus::refresh);

    pipeline.stop();
    if bridge.join().is_err() {
        warn!("event bridge panicked");
    }
    let forwarded = runtime
        .block_on(task)
        .map_err(|e| RelayError::Io(io::Error::other(e.to_string())))?;
    shown?;
    forwarded
}

fn record(session: Arc<DeviceSession>, config: &RelayConfig) -> Result<(), RelayError> {
    let runtime = Runtime::new()?;
    let recorder = Arc::new(Recorder::new(config.recorder_settings()));
    recorder.start_session();

    let sink = Arc::clone(&recorder);
    relay(
        session,
        config,
        &runtime,
        "Recording",
        move |events| async move { forward_to_actuator(events, sink.as_ref()).await },
        None,
    )?;

    match recorder.stop_and_save()? {
        Some(path) => println!("Saved {}", path.display()),
        None => println!("Nothing was recorded."),
    }
    Ok(())
}

fn direct(session: Arc<DeviceSession>, config: &RelayConfig) -> Result<(), RelayError> {
    let runtime = Runtime::new()?;
    let client = Arc::new(DirectMoveClient::new(config.direct_settings())?);
    runtime.block_on(client.start())?;

    let sink = Arc::clone(&client);
    let relayed = relay(
        session,
        config,
        &runtime,
        "Direct moves",
        move |events| async move { forward_to_actuator(events, sink.as_ref()).await },
        None,
    );
    client.stop();
    relayed
}

fn stream(session: Arc<DeviceSession>, config: &RelayConfig) -> Result<(), RelayError> {
    let runtime = Runtime::new()?;
    let settings = config.stream_settings();
    let api: Arc<dyn StreamApi> = Arc::new(HttpStreamApi::new(&settings)?);
    let mut sync = StreamSynchronizer::new(api, settings, session.reference());
    let mut statuses = sync.subscribe();
    runtime.block_on(sync.connect())?;

    let notes: Notes = Box::new(move || {
        let mut latest = None;
        while let Ok(status) = statuses.try_recv() {
            latest = Some(format!("Stream: {status}"));
        }
        latest
    });
    relay(
        session,
        config,
        &runtime,
        "Streaming",
        move |events| async move {
            let mut sync = sync;
            sync.run(events).await.map_err(RelayError::from)
        },
        Some(notes),
    )
}
