//! Wires a [`DeviceSession`] to an [`OutputProcessor`].
//!
//! Three threads make up a running pipeline: the poll driver reads a
//! position every `poll_interval`, the drain driver (buffered and peak
//! strategies) ticks the processor every `drain_interval`, and the processor
//! stage is the single consumer of both through one channel.

use log::{debug, error, info, warn};

use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        mpsc::{self, Receiver, Sender},
        Arc,
    },
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};

use crate::{
    actuator::Actuator,
    component::run_component,
    curve_reducer::StrokerPoint,
    device_session::DeviceSession,
    error::RelayError,
    output_processor::{OutputEvent, OutputProcessor, OutputStrategy, ProcessorInput},
};

/// Pacing of the two drivers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PipelineSettings {
    #[allow(missing_docs)]
    pub poll_interval: Duration,
    #[allow(missing_docs)]
    pub drain_interval: Duration,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(50),
            drain_interval: Duration::from_millis(20),
        }
    }
}

/// What comes out of a running pipeline.
pub struct PipelineOutput {
    /// Processed moves, in order.
    pub events: Receiver<OutputEvent>,
    /// Every estimated position, before processing. Drop this receiver if
    /// nobody wants it.
    pub samples: Receiver<StrokerPoint>,
}

/// Runs `tick` every `interval` until `running` clears or `tick` returns
/// false. Late ticks are not made up for.
fn paced(running: &AtomicBool, interval: Duration, mut tick: impl FnMut() -> bool) {
    let mut next = Instant::now();
    while running.load(Ordering::Relaxed) {
        if !tick() {
            break;
        }
        next += interval;
        let now = Instant::now();
        if next > now {
            spin_sleep::sleep(next - now);
        } else {
            next = now;
        }
    }
}

/// A running pipeline. Stops when dropped.
pub struct Pipeline {
    running: Arc<AtomicBool>,
    drivers: Vec<JoinHandle<()>>,
    stage: Option<JoinHandle<()>>,
}

impl Pipeline {
    /// Start polling `session` and feeding `processor`.
    pub fn spawn(
        session: Arc<DeviceSession>,
        processor: OutputProcessor,
        settings: PipelineSettings,
    ) -> (Self, PipelineOutput) {
        let running = Arc::new(AtomicBool::new(true));
        let (input_tx, input_rx) = mpsc::channel::<ProcessorInput>();
        let (events_tx, events_rx) = mpsc::channel::<OutputEvent>();
        let (samples_tx, samples_rx) = mpsc::channel::<StrokerPoint>();

        let strategy = processor.settings().strategy;
        info!("starting {strategy} pipeline, polling every {:?}", settings.poll_interval);

        let mut drivers = vec![spawn_poll_driver(
            Arc::clone(&session),
            Arc::clone(&running),
            settings.poll_interval,
            input_tx.clone(),
            samples_tx,
        )];
        if strategy != OutputStrategy::Raw {
            drivers.push(spawn_drain_driver(
                Arc::clone(&session),
                Arc::clone(&running),
                settings.drain_interval,
                input_tx.clone(),
            ));
        }
        drop(input_tx);

        let stage = run_component(processor, input_rx, events_tx);

        (
            Self {
                running,
                drivers,
                stage: Some(stage),
            },
            PipelineOutput {
                events: events_rx,
                samples: samples_rx,
            },
        )
    }

    #[allow(missing_docs)]
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Relaxed)
    }

    /// Stop both drivers and wait for every thread to finish.
    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        self.running.store(false, Ordering::Relaxed);
        for driver in self.drivers.drain(..) {
            if driver.join().is_err() {
                error!("pipeline driver panicked");
            }
        }
        // The drivers held the last input senders, so the stage winds down.
        if let Some(stage) = self.stage.take() {
            if stage.join().is_err() {
                error!("output processor panicked");
            }
        }
    }
}

impl Drop for Pipeline {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn spawn_poll_driver(
    session: Arc<DeviceSession>,
    running: Arc<AtomicBool>,
    interval: Duration,
    input: Sender<ProcessorInput>,
    samples: Sender<StrokerPoint>,
) -> JoinHandle<()> {
    thread::spawn(move || {
        let mut skipped = 0u64;
        paced(&running, interval, || {
            match session.read_position() {
                Ok(sample) => {
                    let at = session.since_reference(sample.timestamp);
                    let _ = samples.send(StrokerPoint::new(sample.value, at));
                    let position = sample.value;
                    return input.send(ProcessorInput::Sample { position, at }).is_ok();
                }
                Err(RelayError::DeviceBusy) => debug!("poll skipped: device busy"),
                Err(e) => warn!("poll skipped: {e}"),
            }
            skipped += 1;
            true
        });
        info!("poll driver stopped, {skipped} polls skipped");
    })
}

fn spawn_drain_driver(
    session: Arc<DeviceSession>,
    running: Arc<AtomicBool>,
    interval: Duration,
    input: Sender<ProcessorInput>,
) -> JoinHandle<()> {
    thread::spawn(move || {
        paced(&running, interval, || {
            let now = session.since_reference(Instant::now());
            input.send(ProcessorInput::Drain(now)).is_ok()
        });
        debug!("drain driver stopped");
    })
}

/// Carry pipeline events over to the async side. The bridge thread ends
/// once either end goes away.
pub fn bridge_to_async(
    events: Receiver<OutputEvent>,
    capacity: usize,
) -> (JoinHandle<()>, tokio::sync::mpsc::Receiver<OutputEvent>) {
    let (tx, rx) = tokio::sync::mpsc::channel(capacity.max(1));
    let handle = thread::spawn(move || {
        while let Ok(event) = events.recv() {
            if tx.blocking_send(event).is_err() {
                break;
            }
        }
    });
    (handle, rx)
}

/// Send every event to `actuator`. Failed moves are dropped, except for an
/// authentication failure, which ends forwarding.
pub async fn forward_to_actuator(
    mut events: tokio::sync::mpsc::Receiver<OutputEvent>,
    actuator: &dyn Actuator,
) -> Result<(), RelayError> {
    while let Some(event) = events.recv().await {
        match actuator.send_event(event).await {
            Ok(()) => {}
            Err(e @ RelayError::NetworkAuth(_)) => {
                error!("{}: {e}", actuator.name());
                return Err(e);
            }
            Err(e) => warn!("{}: move dropped: {e}", actuator.name()),
        }
    }
    Ok(())
}
