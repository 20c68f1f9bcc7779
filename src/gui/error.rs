use std::{error::Error, fmt::Display, sync::mpsc};

/// Things that go wrong while driving a terminal screen.
#[derive(Debug)]
pub enum GuiError {
    /// Writing to the terminal failed.
    Io(std::io::Error),
    /// The worker went away before handing back its state.
    WorkerGone,
    /// The worker thread panicked.
    WorkerPanicked,
}

impl Display for GuiError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            GuiError::Io(e) => write!(f, "terminal error: {e}"),
            GuiError::WorkerGone => write!(f, "worker stopped unexpectedly"),
            GuiError::WorkerPanicked => write!(f, "worker panicked"),
        }
    }
}

impl Error for GuiError {}

impl From<std::io::Error> for GuiError {
    fn from(value: std::io::Error) -> Self {
        Self::Io(value)
    }
}

impl<T> From<mpsc::SendError<T>> for GuiError {
    fn from(_: mpsc::SendError<T>) -> Self {
        Self::WorkerGone
    }
}

impl From<mpsc::RecvError> for GuiError {
    fn from(_: mpsc::RecvError) -> Self {
        Self::WorkerGone
    }
}
