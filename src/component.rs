//! Defines the Component trait, shared by the stages of the relay pipeline.
//! Each stage consumes values from the preceding stage over a channel,
//! processes them on its own thread, and passes whatever it produced on to
//! the next stage.

use log::{info, warn};
use std::fmt::Display;
use std::sync::mpsc::{Receiver, Sender};
use std::thread::{self, JoinHandle};

/// Raised by a stage that could not shut down cleanly.
#[derive(Debug)]
pub enum ComponentError {
    /// The stage had work left that could not be completed.
    Unfinished(String),
}

impl Display for ComponentError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ComponentError::Unfinished(why) => write!(f, "unfinished: {why}"),
        }
    }
}

impl std::error::Error for ComponentError {}

///
/// A stage in the relay pipeline. One input may produce any number of
/// outputs, including none at all.
///
pub trait Component: Display {
    #[allow(missing_docs)]
    type InData;
    #[allow(missing_docs)]
    type OutData;

    /// Converts one input into zero or more outputs
    fn convert(&mut self, input: Self::InData) -> Vec<Self::OutData>;

    /// Cleans up at termination of pipeline
    fn finalize(&mut self) -> Result<(), ComponentError>;
}

/// Runs the given Component on its own thread. Every input received on the
/// input channel is converted and each resulting output is sent on the
/// output channel. The thread ends once every input sender is gone.
pub fn run_component<C: Component + Send + 'static>(
    mut component: C,
    input: Receiver<C::InData>,
    output: Sender<C::OutData>,
) -> JoinHandle<()>
where
    C::InData: Send + 'static,
    C::OutData: Send + 'static,
{
    thread::spawn(move || {
        let mut downstream_gone = false;
        while let Ok(data) = input.recv() {
            for out_data in component.convert(data) {
                if output.send(out_data).is_err() && !downstream_gone {
                    warn!("{component} : downstream receiver dropped.");
                    downstream_gone = true;
                }
            }
        }

        if let Err(component_error) = component.finalize() {
            warn!("{component} : error during terminating : {component_error}.");
        }
        info!("{component} : terminated.");
    })
}
