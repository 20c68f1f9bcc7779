//! A local output device that records every move it is sent, and writes
//! the recording out as a JSON motion script.

use async_trait::async_trait;
use log::{info, warn};
use serde::{Deserialize, Serialize};

use std::{
    fmt::Display,
    fs::OpenOptions,
    io::{BufWriter, ErrorKind, Write},
    path::{Path, PathBuf},
    sync::{Mutex, PoisonError},
    time::{Duration, Instant},
};

use crate::{actuator::Actuator, error::RelayError, output_processor::OutputEvent};

/// Things that go wrong while writing a script.
#[derive(Debug)]
pub enum RecorderError {
    /// The script file could not be created or written.
    Io(std::io::Error),
    /// The script could not be encoded.
    Encode(serde_json::Error),
    /// `stop_session` was called without a running session.
    NotRecording,
}

impl Display for RecorderError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RecorderError::Io(e) => write!(f, "could not write script: {e}"),
            RecorderError::Encode(e) => write!(f, "could not encode script: {e}"),
            RecorderError::NotRecording => write!(f, "no recording in progress"),
        }
    }
}

impl std::error::Error for RecorderError {}

impl From<std::io::Error> for RecorderError {
    fn from(e: std::io::Error) -> Self {
        RecorderError::Io(e)
    }
}

impl From<serde_json::Error> for RecorderError {
    fn from(e: serde_json::Error) -> Self {
        RecorderError::Encode(e)
    }
}

/// How recordings are mapped and where they are written.
#[derive(Debug, Clone, PartialEq)]
pub struct RecorderSettings {
    /// Preferred output file. A numeric suffix is added if it exists.
    pub output_path: PathBuf,
    /// Added to every recorded timestamp.
    pub time_shift: Duration,
    /// Position written for an input of 0.0.
    pub min_range: f64,
    /// Position written for an input of 1.0.
    pub max_range: f64,
    #[allow(missing_docs)]
    pub title: String,
}

impl Default for RecorderSettings {
    fn default() -> Self {
        Self {
            output_path: PathBuf::from("strokerelay.funscript"),
            time_shift: Duration::ZERO,
            min_range: 0.0,
            max_range: 1.0,
            title: "Stroke relay script".to_string(),
        }
    }
}

/// One recorded move.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RecordedPoint {
    /// 0.0 to 1.0, as sent.
    pub position: f64,
    /// Since the start of the session, time shift included.
    pub at: Duration,
}

#[derive(Debug, Serialize, Deserialize, PartialEq)]
struct ScriptAction {
    pos: i64,
    at: u64,
}

#[derive(Debug, Serialize, Deserialize, PartialEq)]
struct ScriptMetadata {
    title: String,
    duration: u64,
    range: u32,
}

#[derive(Debug, Serialize, Deserialize, PartialEq)]
struct Script {
    version: String,
    metadata: ScriptMetadata,
    actions: Vec<ScriptAction>,
}

fn script_position(position: f64, settings: &RecorderSettings) -> i64 {
    let mapped = settings.min_range + position * (settings.max_range - settings.min_range);
    (mapped * 99.0).round() as i64
}

/// `path` itself if it is free, otherwise `stem-2.ext`, `stem-3.ext`, ...
fn free_path(path: &Path) -> PathBuf {
    if !path.exists() {
        return path.to_path_buf();
    }
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    let extension = path.extension().map(|e| e.to_string_lossy().into_owned());
    (2..)
        .map(|suffix| {
            let name = match &extension {
                Some(ext) => format!("{stem}-{suffix}.{ext}"),
                None => format!("{stem}-{suffix}"),
            };
            path.with_file_name(name)
        })
        .find(|candidate| !candidate.exists())
        .unwrap_or_else(|| path.to_path_buf())
}

/// Write `points` as a motion script near `path`, never replacing an
/// existing file. Returns the path actually written, or `None` if there
/// was nothing to write.
pub fn write_script(
    path: &Path,
    points: &[RecordedPoint],
    settings: &RecorderSettings,
) -> Result<Option<PathBuf>, RecorderError> {
    let Some(last) = points.last() else {
        return Ok(None);
    };

    let script = Script {
        version: "1.0".to_string(),
        metadata: ScriptMetadata {
            title: settings.title.clone(),
            duration: last.at.as_millis() as u64,
            range: 100,
        },
        actions: points
            .iter()
            .map(|p| ScriptAction {
                pos: script_position(p.position, settings),
                at: p.at.as_millis() as u64,
            })
            .collect(),
    };

    let mut target = free_path(path);
    let file = loop {
        match OpenOptions::new().write(true).create_new(true).open(&target) {
            Ok(file) => break file,
            Err(e) if e.kind() == ErrorKind::AlreadyExists => target = free_path(&target),
            Err(e) => return Err(e.into()),
        }
    };

    let mut writer = BufWriter::new(file);
    serde_json::to_writer(&mut writer, &script)?;
    writer.flush()?;

    info!("wrote {} actions to {}", script.actions.len(), target.display());
    Ok(Some(target))
}

struct Session {
    started: Instant,
    event_origin: Option<Duration>,
    points: Vec<RecordedPoint>,
}

/// Records moves while a session is running. Moves outside a session are
/// ignored.
pub struct Recorder {
    settings: RecorderSettings,
    session: Mutex<Option<Session>>,
}

impl Recorder {
    #[allow(missing_docs)]
    pub fn new(settings: RecorderSettings) -> Self {
        Self {
            settings,
            session: Mutex::new(None),
        }
    }

    #[allow(missing_docs)]
    pub fn settings(&self) -> &RecorderSettings {
        &self.settings
    }

    /// True while a session is running.
    pub fn is_recording(&self) -> bool {
        self.session
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    /// Start a fresh session, discarding any unfinished one.
    pub fn start_session(&self) {
        let previous = self
            .session
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .replace(Session {
                started: Instant::now(),
                event_origin: None,
                points: Vec::new(),
            });
        if previous.is_some() {
            warn!("discarding unfinished recording");
        }
    }

    /// End the session and hand back what it recorded.
    pub fn stop_session(&self) -> Result<Vec<RecordedPoint>, RecorderError> {
        self.session
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .map(|session| session.points)
            .ok_or(RecorderError::NotRecording)
    }

    /// End the session and write it to the configured output path.
    pub fn stop_and_save(&self) -> Result<Option<PathBuf>, RecorderError> {
        let points = self.stop_session()?;
        write_script(&self.settings.output_path, &points, &self.settings)
    }
}

#[async_trait]
impl Actuator for Recorder {
    fn name(&self) -> &str {
        "recorder"
    }

    async fn send_move(&self, position: f64, _duration: Duration) -> Result<(), RelayError> {
        let mut guard = self.session.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(session) = guard.as_mut() {
            let at = session.started.elapsed() + self.settings.time_shift;
            session.points.push(RecordedPoint { position, at });
        }
        Ok(())
    }

    /// Records the event at the time it was sampled. The first event of a
    /// session lands at its arrival time, later ones keep their spacing
    /// from it.
    async fn send_event(&self, event: OutputEvent) -> Result<(), RelayError> {
        let mut guard = self.session.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(session) = guard.as_mut() {
            let elapsed = session.started.elapsed();
            let origin = *session
                .event_origin
                .get_or_insert_with(|| event.at.saturating_sub(elapsed));
            let at = event.at.saturating_sub(origin) + self.settings.time_shift;
            session.points.push(RecordedPoint {
                position: event.position,
                at,
            });
        }
        Ok(())
    }
}
