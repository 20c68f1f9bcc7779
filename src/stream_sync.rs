//! Delivers output events to a remote streaming player.
//!
//! The remote player runs on its own clock and holds a bounded buffer of
//! timed points. Points are batched, uploaded one request at a time, and
//! played back after a one-off clock offset estimate. Every upload
//! acknowledgment is checked for a stuck playback cursor and for a buffer
//! that is close to full; either one triggers a flush and a fresh start of
//! playback from the current local playhead.
//!
//! The decisions live in [`SyncState`], which never touches the network.
//! [`StreamSynchronizer`] drives it against a [`StreamApi`].

use async_trait::async_trait;
use log::{debug, info, warn};
use reqwest::{Method, StatusCode};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use tokio::{
    sync::mpsc::{self, Receiver, UnboundedReceiver, UnboundedSender},
    task::{JoinError, JoinHandle},
};

use std::{
    collections::VecDeque,
    fmt::Display,
    sync::Arc,
    time::{Duration, Instant, SystemTime, UNIX_EPOCH},
};

use crate::output_processor::OutputEvent;

/// What can go wrong talking to the remote player.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamError {
    /// A single request failed. The session carries on.
    Transient(String),
    /// The remote refused our credentials. The session is over.
    Auth(String),
    /// Remote playback stopped advancing.
    Stalled,
    /// The remote answered with an error body.
    Remote {
        #[allow(missing_docs)]
        code: i64,
        #[allow(missing_docs)]
        message: String,
    },
}

impl Display for StreamError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StreamError::Transient(why) => write!(f, "request failed: {why}"),
            StreamError::Auth(why) => write!(f, "not authorized: {why}"),
            StreamError::Stalled => write!(f, "remote playback stalled"),
            StreamError::Remote { code, message } => write!(f, "remote error {code}: {message}"),
        }
    }
}

impl std::error::Error for StreamError {}

impl From<reqwest::Error> for StreamError {
    fn from(e: reqwest::Error) -> Self {
        StreamError::Transient(e.to_string())
    }
}

/// One timed point in the remote stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HspPoint {
    /// Milliseconds from stream start, lookahead included.
    pub t: i64,
    /// Position percentage, 0 to 100.
    pub x: u8,
}

/// Body of an `hsp/add` request.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AddPointsRequest {
    #[allow(missing_docs)]
    pub points: Vec<HspPoint>,
    /// Discard everything the remote holds before appending.
    pub flush: bool,
    /// Stream index of the last point in this batch.
    pub tail_point_stream_index: u64,
}

/// The remote's view of its buffer after an upload.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct AddPointsResult {
    /// Points currently held.
    pub points: i64,
    /// Capacity.
    pub max_points: i64,
    /// Playback cursor.
    pub current_point: i64,
    #[allow(missing_docs)]
    pub current_time: i64,
    #[allow(missing_docs)]
    pub last_point_time: i64,
}

/// Body of an `hsp/play` request.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PlayRequest {
    /// Stream time to start from, in milliseconds.
    pub start_time: i64,
    /// Estimated server clock, in unix milliseconds.
    pub server_time: i64,
    #[allow(missing_docs)]
    pub playback_rate: f64,
    #[serde(rename = "loop")]
    #[allow(missing_docs)]
    pub looping: bool,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct SetupRequest {
    stream_id: u32,
}

#[derive(Debug, Deserialize)]
struct RemoteErrorBody {
    code: i64,
    message: String,
}

#[derive(Debug, Deserialize)]
struct Envelope<T> {
    result: Option<T>,
    error: Option<RemoteErrorBody>,
}

#[derive(Debug, Deserialize)]
struct ServerTimeResponse {
    server_time: i64,
}

/// The remote player's API.
#[async_trait]
pub trait StreamApi: Send + Sync {
    /// The server clock, in unix milliseconds.
    async fn server_time(&self) -> Result<i64, StreamError>;
    #[allow(missing_docs)]
    async fn setup(&self, stream_id: u32) -> Result<(), StreamError>;
    #[allow(missing_docs)]
    async fn add_points(&self, request: &AddPointsRequest) -> Result<AddPointsResult, StreamError>;
    #[allow(missing_docs)]
    async fn play(&self, request: &PlayRequest) -> Result<(), StreamError>;
    #[allow(missing_docs)]
    async fn stop(&self) -> Result<(), StreamError>;
    #[allow(missing_docs)]
    async fn flush(&self) -> Result<(), StreamError>;
}

/// Everything the synchronizer needs to know.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamSettings {
    /// API root, with a trailing slash.
    pub base_url: String,
    /// The device's connection key.
    pub connection_key: String,
    /// Sent as `Authorization: Bearer ...` when present.
    pub bearer_token: Option<String>,
    #[allow(missing_docs)]
    pub stream_id: u32,
    /// Round trips used to estimate the clock offset.
    pub clock_sync_samples: usize,
    /// Window of the output processor feeding the stream.
    pub filter_window: Duration,
    /// One point is batched per this much filter window.
    pub batch_divisor: Duration,
    /// Recover once the remote has fewer free slots than this.
    pub capacity_margin: i64,
    /// Added to every point's stream time.
    pub lookahead: Duration,
    /// Acknowledgments without cursor movement before playback counts as stalled.
    pub stall_window: usize,
    #[allow(missing_docs)]
    pub request_timeout: Duration,
}

impl Default for StreamSettings {
    fn default() -> Self {
        Self {
            base_url: "https://www.handyfeeling.com/api/handy-rest/v3/".to_string(),
            connection_key: String::new(),
            bearer_token: None,
            stream_id: 100,
            clock_sync_samples: 20,
            filter_window: Duration::from_millis(1000),
            batch_divisor: Duration::from_millis(500),
            capacity_margin: 100,
            lookahead: Duration::from_millis(500),
            stall_window: 5,
            request_timeout: Duration::from_secs(10),
        }
    }
}

impl StreamSettings {
    /// Points per upload: `ceil(filter_window / batch_divisor)`, at least one.
    pub fn batch_size(&self) -> usize {
        let divisor = self.batch_divisor.as_millis().max(1);
        let size = self.filter_window.as_millis().div_ceil(divisor);
        (size as usize).max(1)
    }
}

/// [`StreamApi`] over HTTP.
pub struct HttpStreamApi {
    client: reqwest::Client,
    base_url: String,
    connection_key: String,
    bearer_token: Option<String>,
}

impl HttpStreamApi {
    #[allow(missing_docs)]
    pub fn new(settings: &StreamSettings) -> Result<Self, StreamError> {
        let client = reqwest::Client::builder()
            .timeout(settings.request_timeout)
            .build()?;
        Ok(Self {
            client,
            base_url: settings.base_url.clone(),
            connection_key: settings.connection_key.clone(),
            bearer_token: settings.bearer_token.clone(),
        })
    }

    fn request(&self, method: Method, path: &str) -> reqwest::RequestBuilder {
        let builder = self
            .client
            .request(method, format!("{}{}", self.base_url, path))
            .header("accept", "application/json")
            .header("X-Connection-Key", &self.connection_key);
        match &self.bearer_token {
            Some(token) => builder.bearer_auth(token),
            None => builder,
        }
    }

    /// Send and return the body, turning auth failures, error bodies and
    /// failed statuses into errors.
    async fn send(&self, builder: reqwest::RequestBuilder) -> Result<String, StreamError> {
        let response = builder.send().await?;
        let status = response.status();
        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            return Err(StreamError::Auth(status.to_string()));
        }
        let body = response.text().await?;
        let envelope: Result<Envelope<serde_json::Value>, _> = serde_json::from_str(&body);
        if let Ok(Envelope {
            error: Some(error), ..
        }) = envelope
        {
            return Err(StreamError::Remote {
                code: error.code,
                message: error.message,
            });
        }
        if !status.is_success() {
            return Err(StreamError::Transient(status.to_string()));
        }
        Ok(body)
    }

    async fn call<T: DeserializeOwned>(
        &self,
        builder: reqwest::RequestBuilder,
    ) -> Result<T, StreamError> {
        let body = self.send(builder).await?;
        let envelope: Envelope<T> =
            serde_json::from_str(&body).map_err(|e| StreamError::Transient(e.to_string()))?;
        envelope
            .result
            .ok_or_else(|| StreamError::Transient("response carried no result".to_string()))
    }
}

#[async_trait]
impl StreamApi for HttpStreamApi {
    async fn server_time(&self) -> Result<i64, StreamError> {
        let body = self.send(self.request(Method::GET, "servertime")).await?;
        let time: ServerTimeResponse =
            serde_json::from_str(&body).map_err(|e| StreamError::Transient(e.to_string()))?;
        Ok(time.server_time)
    }

    async fn setup(&self, stream_id: u32) -> Result<(), StreamError> {
        self.send(self.request(Method::PUT, "hsp/setup").json(&SetupRequest { stream_id }))
            .await
            .map(drop)
    }

    async fn add_points(&self, request: &AddPointsRequest) -> Result<AddPointsResult, StreamError> {
        self.call(self.request(Method::PUT, "hsp/add").json(request))
            .await
    }

    async fn play(&self, request: &PlayRequest) -> Result<(), StreamError> {
        self.send(self.request(Method::PUT, "hsp/play").json(request))
            .await
            .map(drop)
    }

    async fn stop(&self) -> Result<(), StreamError> {
        self.send(self.request(Method::PUT, "hsp/stop")).await.map(drop)
    }

    async fn flush(&self) -> Result<(), StreamError> {
        self.send(self.request(Method::PUT, "hsp/flush")).await.map(drop)
    }
}

/// One clock probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RoundTrip {
    /// Local unix milliseconds when the request left.
    pub local_send: i64,
    /// What the server reported.
    pub server_time: i64,
    /// Milliseconds until the answer arrived.
    pub latency: i64,
}

/// Average of `server_time + latency / 2 - local_send` over every probe.
pub fn estimate_offset(samples: &[RoundTrip]) -> Option<i64> {
    if samples.is_empty() {
        return None;
    }
    let total: f64 = samples
        .iter()
        .map(|s| (s.server_time as f64 + s.latency as f64 / 2.0) - s.local_send as f64)
        .sum();
    Some((total / samples.len() as f64).round() as i64)
}

fn unix_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

/// Probe the server clock `samples` times and estimate how far ahead of
/// the local clock it runs, in milliseconds. Failed probes are skipped;
/// an auth failure ends the measurement.
pub async fn measure_clock_offset(api: &dyn StreamApi, samples: usize) -> Result<i64, StreamError> {
    let mut trips = Vec::with_capacity(samples);
    let mut last_error = None;
    for _ in 0..samples {
        let local_send = unix_millis();
        let sent = Instant::now();
        match api.server_time().await {
            Ok(server_time) => trips.push(RoundTrip {
                local_send,
                server_time,
                latency: sent.elapsed().as_millis() as i64,
            }),
            Err(e @ StreamError::Auth(_)) => return Err(e),
            Err(e) => {
                debug!("clock probe failed: {e}");
                last_error = Some(e);
            }
        }
    }
    estimate_offset(&trips).ok_or_else(|| {
        last_error.unwrap_or_else(|| StreamError::Transient("no clock samples".to_string()))
    })
}

/// Why the stream has to start over.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryReason {
    /// The playback cursor stopped moving.
    Stalled,
    /// The remote buffer is nearly full.
    Capacity,
}

impl Display for RecoveryReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RecoveryReason::Stalled => write!(f, "playback stalled"),
            RecoveryReason::Capacity => write!(f, "remote buffer nearly full"),
        }
    }
}

/// What to do after an upload was acknowledged.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckAction {
    #[allow(missing_docs)]
    None,
    /// Issue a play command from the current playhead.
    StartPlayback,
    /// Flush the remote with the next batch.
    Recover(RecoveryReason),
}

/// Where the stream starts, on the arrival clock and on the sample clock.
#[derive(Debug, Clone, Copy)]
struct StreamOrigin {
    arrived: Duration,
    sampled: Duration,
}

/// The stream bookkeeping, with no I/O.
#[derive(Debug)]
pub struct SyncState {
    batch_size: usize,
    capacity_margin: i64,
    stall_window: usize,
    lookahead: Duration,
    stream_start: Option<StreamOrigin>,
    queue: Vec<HspPoint>,
    tail_index: u64,
    flush_next: bool,
    awaiting_flush_ack: bool,
    playing: bool,
    cursors: VecDeque<i64>,
}

impl SyncState {
    #[allow(missing_docs)]
    pub fn new(settings: &StreamSettings) -> Self {
        Self {
            batch_size: settings.batch_size(),
            capacity_margin: settings.capacity_margin,
            stall_window: settings.stall_window.max(1),
            lookahead: settings.lookahead,
            stream_start: None,
            queue: Vec::new(),
            tail_index: 0,
            flush_next: false,
            awaiting_flush_ack: false,
            playing: false,
            cursors: VecDeque::new(),
        }
    }

    /// Queue an event that reached us at `arrived`, on the same clock that
    /// [`play_request`](Self::play_request) is given. The first event ever
    /// queued fixes the stream start. Later points keep the spacing they
    /// were sampled with.
    pub fn enqueue(&mut self, event: &OutputEvent, arrived: Duration) {
        let origin = *self.stream_start.get_or_insert(StreamOrigin {
            arrived,
            sampled: event.at,
        });
        let since_start = event.at.saturating_sub(origin.sampled) + self.lookahead;
        let x = (event.position * 100.0).round().clamp(0.0, 100.0) as u8;
        self.queue.push(HspPoint {
            t: since_start.as_millis() as i64,
            x,
        });
    }

    #[allow(missing_docs)]
    pub fn batch_ready(&self) -> bool {
        self.queue.len() >= self.batch_size
    }

    #[allow(missing_docs)]
    pub fn is_playing(&self) -> bool {
        self.playing
    }

    #[allow(missing_docs)]
    pub fn tail_index(&self) -> u64 {
        self.tail_index
    }

    /// Empty the queue into an upload, once a full batch is waiting.
    pub fn take_batch(&mut self) -> Option<AddPointsRequest> {
        if !self.batch_ready() {
            return None;
        }
        let points: Vec<HspPoint> = self.queue.drain(..).collect();
        let flush = std::mem::take(&mut self.flush_next);
        if flush {
            self.tail_index = points.len() as u64;
            self.awaiting_flush_ack = true;
        } else {
            self.tail_index += points.len() as u64;
        }
        Some(AddPointsRequest {
            points,
            flush,
            tail_point_stream_index: self.tail_index,
        })
    }

    /// The last upload never arrived. A pending flush moves on to the next
    /// batch.
    pub fn upload_failed(&mut self) {
        if std::mem::take(&mut self.awaiting_flush_ack) {
            self.flush_next = true;
        }
    }

    /// Inspect an acknowledgment.
    pub fn on_ack(&mut self, result: &AddPointsResult) -> AckAction {
        if std::mem::take(&mut self.awaiting_flush_ack) {
            self.cursors.clear();
            return AckAction::StartPlayback;
        }
        if !self.playing {
            return AckAction::StartPlayback;
        }
        if self.flush_next {
            return AckAction::None;
        }

        self.cursors.push_back(result.current_point);
        while self.cursors.len() > self.stall_window {
            self.cursors.pop_front();
        }
        if self.cursors.len() == self.stall_window {
            let first = self.cursors[0];
            if first != 0 && self.cursors.iter().all(|&c| c == first) {
                return AckAction::Recover(RecoveryReason::Stalled);
            }
        }

        if result.max_points > 0 && result.max_points - result.points < self.capacity_margin {
            return AckAction::Recover(RecoveryReason::Capacity);
        }
        AckAction::None
    }

    /// Make the next batch flush the remote and restart playback.
    pub fn begin_recovery(&mut self) {
        self.flush_next = true;
        self.cursors.clear();
    }

    /// A play command for the playhead at `now`, given the server clock
    /// estimate `server_now`.
    pub fn play_request(&self, now: Duration, server_now: i64) -> PlayRequest {
        let playhead = self
            .stream_start
            .map(|origin| now.saturating_sub(origin.arrived))
            .unwrap_or_default();
        PlayRequest {
            start_time: playhead.as_millis() as i64,
            server_time: server_now,
            playback_rate: 1.0,
            looping: false,
        }
    }

    #[allow(missing_docs)]
    pub fn mark_playing(&mut self) {
        self.playing = true;
    }

    /// Forget the stream entirely.
    pub fn reset(&mut self) {
        self.stream_start = None;
        self.queue.clear();
        self.tail_index = 0;
        self.flush_next = false;
        self.awaiting_flush_ack = false;
        self.playing = false;
        self.cursors.clear();
    }
}

/// Published on every stream transition.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamStatus {
    #[allow(missing_docs)]
    Connecting,
    /// Playback is running.
    Streaming,
    /// Something went wrong that the session rides out.
    Degraded(StreamError),
    /// The next batch flushes the remote.
    Recovering(RecoveryReason),
    #[allow(missing_docs)]
    Stopped,
    /// The session ended on an error.
    Failed(String),
}

impl Display for StreamStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StreamStatus::Connecting => write!(f, "connecting"),
            StreamStatus::Streaming => write!(f, "streaming"),
            StreamStatus::Degraded(e) => write!(f, "{e}, carrying on"),
            StreamStatus::Recovering(reason) => write!(f, "recovering, {reason}"),
            StreamStatus::Stopped => write!(f, "stopped"),
            StreamStatus::Failed(why) => write!(f, "failed: {why}"),
        }
    }
}

type Upload = JoinHandle<Result<AddPointsResult, StreamError>>;

async fn wait_upload(slot: &mut Option<Upload>) -> Result<Result<AddPointsResult, StreamError>, JoinError> {
    match slot {
        Some(handle) => handle.await,
        None => std::future::pending().await,
    }
}

/// Drives a [`SyncState`] against a [`StreamApi`].
pub struct StreamSynchronizer {
    api: Arc<dyn StreamApi>,
    settings: StreamSettings,
    reference: Instant,
    offset: i64,
    state: SyncState,
    observers: Vec<UnboundedSender<StreamStatus>>,
}

impl StreamSynchronizer {
    /// `reference` is the instant output event times are measured from.
    pub fn new(api: Arc<dyn StreamApi>, settings: StreamSettings, reference: Instant) -> Self {
        let state = SyncState::new(&settings);
        Self {
            api,
            settings,
            reference,
            offset: 0,
            state,
            observers: Vec::new(),
        }
    }

    /// Receive every status transition from now on.
    pub fn subscribe(&mut self) -> UnboundedReceiver<StreamStatus> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.observers.push(tx);
        rx
    }

    fn publish(&mut self, status: StreamStatus) {
        self.observers.retain(|tx| tx.send(status.clone()).is_ok());
    }

    /// Estimated server clock offset, in milliseconds.
    pub fn clock_offset(&self) -> i64 {
        self.offset
    }

    /// Measure the clock offset and set up the remote stream.
    pub async fn connect(&mut self) -> Result<(), StreamError> {
        self.publish(StreamStatus::Connecting);
        let connected = async {
            self.offset =
                measure_clock_offset(self.api.as_ref(), self.settings.clock_sync_samples).await?;
            self.api.setup(self.settings.stream_id).await
        }
        .await;
        match connected {
            Ok(()) => {
                info!(
                    "stream {} set up, server clock offset {} ms",
                    self.settings.stream_id, self.offset
                );
                self.state.reset();
                Ok(())
            }
            Err(e) => {
                self.publish(StreamStatus::Failed(e.to_string()));
                Err(e)
            }
        }
    }

    /// Upload events until the channel closes, then stop the remote.
    /// Returns early only on an authentication failure.
    pub async fn run(&mut self, mut events: Receiver<OutputEvent>) -> Result<(), StreamError> {
        let mut in_flight: Option<Upload> = None;
        let outcome = loop {
            tokio::select! {
                biased;
                joined = wait_upload(&mut in_flight), if in_flight.is_some() => {
                    in_flight = None;
                    if let Err(e) = self.handle_upload(joined).await {
                        break Err(e);
                    }
                }
                event = events.recv() => {
                    let Some(event) = event else { break Ok(()) };
                    self.state.enqueue(&event, self.reference.elapsed());
                    if let Some(batch) = self.state.take_batch() {
                        if let Some(previous) = in_flight.take() {
                            debug!("superseding in-flight upload");
                            previous.abort();
                            self.state.upload_failed();
                        }
                        let api = Arc::clone(&self.api);
                        in_flight = Some(tokio::spawn(async move { api.add_points(&batch).await }));
                    }
                }
            }
        };

        if let Some(handle) = in_flight.take() {
            handle.abort();
        }
        match outcome {
            Ok(()) => {
                self.stop().await;
                Ok(())
            }
            Err(e) => {
                self.publish(StreamStatus::Failed(e.to_string()));
                Err(e)
            }
        }
    }

    async fn handle_upload(
        &mut self,
        joined: Result<Result<AddPointsResult, StreamError>, JoinError>,
    ) -> Result<(), StreamError> {
        let result = match joined {
            Ok(Ok(result)) => result,
            Ok(Err(e @ StreamError::Auth(_))) => return Err(e),
            Ok(Err(e)) => {
                warn!("dropping batch: {e}");
                self.state.upload_failed();
                self.publish(StreamStatus::Degraded(e));
                return Ok(());
            }
            Err(e) if e.is_cancelled() => return Ok(()),
            Err(e) => {
                warn!("upload task failed: {e}");
                self.state.upload_failed();
                return Ok(());
            }
        };

        match self.state.on_ack(&result) {
            AckAction::None => Ok(()),
            AckAction::StartPlayback => self.start_playback().await,
            AckAction::Recover(reason) => {
                info!("recovering stream: {reason}");
                if reason == RecoveryReason::Stalled {
                    warn!("{}", StreamError::Stalled);
                    self.publish(StreamStatus::Degraded(StreamError::Stalled));
                }
                self.publish(StreamStatus::Recovering(reason));
                self.state.begin_recovery();
                Ok(())
            }
        }
    }

    async fn start_playback(&mut self) -> Result<(), StreamError> {
        let request = self
            .state
            .play_request(self.reference.elapsed(), unix_millis() + self.offset);
        match self.api.play(&request).await {
            Ok(()) => {
                info!("playback started at {} ms", request.start_time);
                self.state.mark_playing();
                self.publish(StreamStatus::Streaming);
                Ok(())
            }
            Err(e @ StreamError::Auth(_)) => Err(e),
            Err(e) => {
                warn!("could not start playback: {e}");
                self.publish(StreamStatus::Degraded(e));
                Ok(())
            }
        }
    }

    /// Stop and flush the remote, and forget the stream.
    pub async fn stop(&mut self) {
        if let Err(e) = self.api.stop().await {
            warn!("could not stop remote playback: {e}");
        }
        if let Err(e) = self.api.flush().await {
            warn!("could not flush remote buffer: {e}");
        }
        self.state.reset();
        self.publish(StreamStatus::Stopped);
        info!("stream stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    fn event(position: f64, at_ms: u64) -> OutputEvent {
        OutputEvent {
            position,
            duration: Duration::from_millis(50),
            at: Duration::from_millis(at_ms),
        }
    }

    /// Queue an event that arrives the moment it was taken.
    fn queue(state: &mut SyncState, position: f64, at_ms: u64) {
        state.enqueue(&event(position, at_ms), Duration::from_millis(at_ms));
    }

    fn ack(points: i64, max_points: i64, current_point: i64) -> AddPointsResult {
        AddPointsResult {
            points,
            max_points,
            current_point,
            ..Default::default()
        }
    }

    #[derive(Default)]
    struct MockApi {
        clock_ahead: i64,
        reject_uploads: bool,
        stuck_cursor: Option<i64>,
        uploads: Mutex<Vec<AddPointsRequest>>,
        plays: Mutex<Vec<PlayRequest>>,
        stops: Mutex<u32>,
        flushes: Mutex<u32>,
    }

    #[async_trait]
    impl StreamApi for MockApi {
        async fn server_time(&self) -> Result<i64, StreamError> {
            Ok(unix_millis() + self.clock_ahead)
        }

        async fn setup(&self, _stream_id: u32) -> Result<(), StreamError> {
            Ok(())
        }

        async fn add_points(&self, request: &AddPointsRequest) -> Result<AddPointsResult, StreamError> {
            if self.reject_uploads {
                return Err(StreamError::Auth("401 Unauthorized".into()));
            }
            let mut uploads = self.uploads.lock().unwrap();
            uploads.push(request.clone());
            let cursor = self.stuck_cursor.unwrap_or(uploads.len() as i64);
            Ok(ack(uploads.len() as i64, 4000, cursor))
        }

        async fn play(&self, request: &PlayRequest) -> Result<(), StreamError> {
            self.plays.lock().unwrap().push(request.clone());
            Ok(())
        }

        async fn stop(&self) -> Result<(), StreamError> {
            *self.stops.lock().unwrap() += 1;
            Ok(())
        }

        async fn flush(&self) -> Result<(), StreamError> {
            *self.flushes.lock().unwrap() += 1;
            Ok(())
        }
    }

    #[test]
    fn offset_from_round_trips() {
        let trips = [
            RoundTrip {
                local_send: 1_000,
                server_time: 6_000,
                latency: 40,
            },
            RoundTrip {
                local_send: 2_000,
                server_time: 7_010,
                latency: 60,
            },
        ];
        // (6000 + 20 - 1000) and (7010 + 30 - 2000), averaged
        assert_eq!(estimate_offset(&trips), Some(5030));
        assert_eq!(estimate_offset(&[]), None);
    }

    #[tokio::test]
    async fn measured_offset_tracks_server_clock() {
        let api = MockApi {
            clock_ahead: 5_000,
            ..Default::default()
        };
        let offset = measure_clock_offset(&api, 20).await.unwrap();
        assert!((offset - 5_000).abs() <= 50, "offset {offset}");
    }

    #[test]
    fn batch_size_follows_filter_window() {
        let mut settings = StreamSettings::default();
        assert_eq!(settings.batch_size(), 2);
        settings.filter_window = Duration::from_millis(1200);
        assert_eq!(settings.batch_size(), 3);
        settings.filter_window = Duration::ZERO;
        assert_eq!(settings.batch_size(), 1);
    }

    #[test]
    fn batches_carry_stream_time_and_tail_index() {
        let mut state = SyncState::new(&StreamSettings::default());
        queue(&mut state, 0.5, 2_000);
        assert!(state.take_batch().is_none());
        queue(&mut state, 1.2, 2_100);

        let batch = state.take_batch().unwrap();
        assert_eq!(
            batch.points,
            vec![HspPoint { t: 500, x: 50 }, HspPoint { t: 600, x: 100 }]
        );
        assert!(!batch.flush);
        assert_eq!(batch.tail_point_stream_index, 2);

        queue(&mut state, 0.0, 2_200);
        queue(&mut state, 0.25, 2_300);
        assert_eq!(state.take_batch().unwrap().tail_point_stream_index, 4);
    }

    #[test]
    fn first_ack_starts_playback() {
        let mut state = SyncState::new(&StreamSettings::default());
        assert_eq!(state.on_ack(&ack(2, 4000, 0)), AckAction::StartPlayback);
        state.mark_playing();
        assert_eq!(state.on_ack(&ack(4, 4000, 1)), AckAction::None);
    }

    #[test]
    fn stuck_cursor_is_a_stall() {
        let mut state = SyncState::new(&StreamSettings::default());
        state.mark_playing();
        for _ in 0..4 {
            assert_eq!(state.on_ack(&ack(10, 4000, 7)), AckAction::None);
        }
        assert_eq!(
            state.on_ack(&ack(10, 4000, 7)),
            AckAction::Recover(RecoveryReason::Stalled)
        );
    }

    #[test]
    fn cursor_that_never_left_the_start_is_not_a_stall() {
        let mut state = SyncState::new(&StreamSettings::default());
        state.mark_playing();
        for _ in 0..10 {
            assert_eq!(state.on_ack(&ack(10, 4000, 0)), AckAction::None);
        }
    }

    #[test]
    fn low_headroom_recovers_with_a_flush() {
        let mut state = SyncState::new(&StreamSettings::default());
        state.mark_playing();
        queue(&mut state, 0.1, 0);
        queue(&mut state, 0.2, 100);
        state.take_batch().unwrap();
        queue(&mut state, 0.3, 200);
        queue(&mut state, 0.4, 300);
        assert_eq!(state.take_batch().unwrap().tail_point_stream_index, 4);

        assert_eq!(
            state.on_ack(&ack(3950, 4000, 12)),
            AckAction::Recover(RecoveryReason::Capacity)
        );
        state.begin_recovery();

        queue(&mut state, 0.5, 400);
        queue(&mut state, 0.6, 500);
        let flushed = state.take_batch().unwrap();
        assert!(flushed.flush);
        assert_eq!(flushed.tail_point_stream_index, 2);
        assert_eq!(state.on_ack(&ack(2, 4000, 0)), AckAction::StartPlayback);
    }

    #[test]
    fn failed_flush_moves_to_next_batch() {
        let mut state = SyncState::new(&StreamSettings::default());
        state.mark_playing();
        state.begin_recovery();
        queue(&mut state, 0.5, 0);
        queue(&mut state, 0.6, 100);
        assert!(state.take_batch().unwrap().flush);
        state.upload_failed();

        queue(&mut state, 0.5, 200);
        queue(&mut state, 0.6, 300);
        assert!(state.take_batch().unwrap().flush);
    }

    #[test]
    fn play_starts_at_the_local_playhead() {
        let mut state = SyncState::new(&StreamSettings::default());
        queue(&mut state, 0.5, 1_000);
        let play = state.play_request(Duration::from_millis(1_750), 99_000);
        assert_eq!(play.start_time, 750);
        assert_eq!(play.server_time, 99_000);
        let json = serde_json::to_value(&play).unwrap();
        assert_eq!(json["loop"], serde_json::json!(false));
        assert_eq!(json["playbackRate"], serde_json::json!(1.0));
    }

    #[test]
    fn delayed_events_stay_ahead_of_the_playhead() {
        let settings = StreamSettings {
            filter_window: Duration::from_millis(800),
            ..StreamSettings::default()
        };
        let delay = Duration::from_millis(800);
        let mut state = SyncState::new(&settings);
        for (position, at_ms) in [(0.2, 0), (0.4, 50)] {
            let sampled = event(position, at_ms);
            state.enqueue(&sampled, sampled.at + delay);
        }
        let batch = state.take_batch().unwrap();
        let times: Vec<i64> = batch.points.iter().map(|p| p.t).collect();
        assert_eq!(times, vec![500, 550]);

        let play = state.play_request(Duration::from_millis(850), 0);
        assert_eq!(play.start_time, 50);
        assert!(batch.points.iter().all(|p| p.t > play.start_time));
    }

    #[tokio::test]
    async fn synchronizer_uploads_in_order_and_plays_once() {
        let api = Arc::new(MockApi::default());
        let mut sync = StreamSynchronizer::new(
            Arc::clone(&api) as Arc<dyn StreamApi>,
            StreamSettings {
                clock_sync_samples: 3,
                ..Default::default()
            },
            Instant::now(),
        );
        let mut status = sync.subscribe();
        sync.connect().await.unwrap();

        let (tx, rx) = mpsc::channel(16);
        let feeder = tokio::spawn(async move {
            for i in 0..6u64 {
                tx.send(event(i as f64 / 10.0, i * 100)).await.unwrap();
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        });
        sync.run(rx).await.unwrap();
        feeder.await.unwrap();

        let uploads = api.uploads.lock().unwrap();
        let tails: Vec<u64> = uploads.iter().map(|u| u.tail_point_stream_index).collect();
        assert_eq!(tails, vec![2, 4, 6]);
        assert_eq!(api.plays.lock().unwrap().len(), 1);
        assert_eq!(*api.stops.lock().unwrap(), 1);
        assert_eq!(*api.flushes.lock().unwrap(), 1);

        assert_eq!(status.recv().await, Some(StreamStatus::Connecting));
        assert_eq!(status.recv().await, Some(StreamStatus::Streaming));
        assert_eq!(status.recv().await, Some(StreamStatus::Stopped));
    }

    #[tokio::test]
    async fn stalled_playback_is_flushed_and_restarted() {
        let api = Arc::new(MockApi {
            stuck_cursor: Some(7),
            ..Default::default()
        });
        let mut sync = StreamSynchronizer::new(
            Arc::clone(&api) as Arc<dyn StreamApi>,
            StreamSettings {
                clock_sync_samples: 1,
                ..Default::default()
            },
            Instant::now(),
        );
        let mut status = sync.subscribe();
        sync.connect().await.unwrap();

        let (tx, rx) = mpsc::channel(16);
        let feeder = tokio::spawn(async move {
            for i in 0..14u64 {
                tx.send(event(0.5, i * 100)).await.unwrap();
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        });
        sync.run(rx).await.unwrap();
        feeder.await.unwrap();

        let uploads = api.uploads.lock().unwrap();
        assert_eq!(uploads.len(), 7);
        assert!(uploads[..6].iter().all(|u| !u.flush));
        assert!(uploads[6].flush);
        assert_eq!(uploads[6].tail_point_stream_index, 2);
        assert_eq!(api.plays.lock().unwrap().len(), 2);

        let mut seen = Vec::new();
        while let Ok(s) = status.try_recv() {
            seen.push(s);
        }
        assert_eq!(
            seen,
            vec![
                StreamStatus::Connecting,
                StreamStatus::Streaming,
                StreamStatus::Degraded(StreamError::Stalled),
                StreamStatus::Recovering(RecoveryReason::Stalled),
                StreamStatus::Streaming,
                StreamStatus::Stopped,
            ]
        );
    }

    #[tokio::test]
    async fn auth_failure_ends_the_session() {
        let api = Arc::new(MockApi {
            reject_uploads: true,
            ..Default::default()
        });
        let mut sync = StreamSynchronizer::new(
            Arc::clone(&api) as Arc<dyn StreamApi>,
            StreamSettings {
                clock_sync_samples: 1,
                ..Default::default()
            },
            Instant::now(),
        );
        sync.connect().await.unwrap();

        let (tx, rx) = mpsc::channel(16);
        tx.send(event(0.1, 0)).await.unwrap();
        tx.send(event(0.2, 100)).await.unwrap();

        assert!(matches!(sync.run(rx).await, Err(StreamError::Auth(_))));
        assert_eq!(*api.stops.lock().unwrap(), 0);
        drop(tx);
    }
}
