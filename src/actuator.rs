//! The "send a linear move" capability every output device offers, and the
//! direct-move HTTP client that drives a networked stroker position by
//! position.

use async_trait::async_trait;
use log::{debug, info, warn};
use reqwest::StatusCode;
use serde::Serialize;
use tokio::task::JoinHandle;

use std::{
    sync::{Arc, Mutex, PoisonError},
    time::{Duration, Instant},
};

use crate::{error::RelayError, output_processor::OutputEvent};

/// Something that can be told to move to a position.
#[async_trait]
pub trait Actuator: Send + Sync {
    /// Short human readable name, for logs and status lines.
    fn name(&self) -> &str;

    /// Move to `position` (0.0 to 1.0), taking roughly `duration`.
    async fn send_move(&self, position: f64, duration: Duration) -> Result<(), RelayError>;

    /// Deliver one processed move. Only devices that care when the point
    /// was taken need more than [`send_move`](Self::send_move).
    async fn send_event(&self, event: OutputEvent) -> Result<(), RelayError> {
        self.send_move(event.position, event.duration).await
    }
}

/// Where and how the direct-move client talks to the device API.
#[derive(Debug, Clone, PartialEq)]
pub struct DirectSettings {
    /// API root, with a trailing slash.
    pub base_url: String,
    /// The device's connection key.
    pub connection_key: String,
    #[allow(missing_docs)]
    pub request_timeout: Duration,
    /// Shortest move ever requested, and the time taken off each gap.
    pub min_move: Duration,
    /// A move may take at most this many times the processor's hint.
    pub hint_factor: u32,
}

impl Default for DirectSettings {
    fn default() -> Self {
        Self {
            base_url: "https://www.handyfeeling.com/api/handy/v2/".to_string(),
            connection_key: String::new(),
            request_timeout: Duration::from_secs(2),
            min_move: Duration::from_millis(100),
            hint_factor: 3,
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct MoveRequest {
    stop_on_target: bool,
    immediate_response: bool,
    duration: u64,
    position: f64,
}

#[derive(Debug, Serialize)]
struct ModeRequest {
    mode: u8,
}

const DIRECT_MOVE_MODE: u8 = 2;

/// Duration for a move issued `gap` after the previous one.
fn move_time(gap: Duration, hint: Duration, settings: &DirectSettings) -> Duration {
    let ceiling = (hint * settings.hint_factor).max(settings.min_move);
    gap.saturating_sub(settings.min_move)
        .max(settings.min_move)
        .min(ceiling)
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Sends every move as its own HTTP request. A newer move cancels whatever
/// request is still in flight.
pub struct DirectMoveClient {
    client: reqwest::Client,
    settings: DirectSettings,
    in_flight: Mutex<Option<JoinHandle<()>>>,
    last_command: Mutex<Option<Instant>>,
    auth_failure: Arc<Mutex<Option<String>>>,
}

impl DirectMoveClient {
    #[allow(missing_docs)]
    pub fn new(settings: DirectSettings) -> Result<Self, RelayError> {
        let client = reqwest::Client::builder()
            .timeout(settings.request_timeout)
            .build()
            .map_err(|e| RelayError::NetworkTransient(e.to_string()))?;
        Ok(Self {
            client,
            settings,
            in_flight: Mutex::new(None),
            last_command: Mutex::new(None),
            auth_failure: Arc::new(Mutex::new(None)),
        })
    }

    fn request(&self, path: &str) -> reqwest::RequestBuilder {
        self.client
            .put(format!("{}{}", self.settings.base_url, path))
            .header("accept", "application/json")
            .header("X-Connection-Key", &self.settings.connection_key)
    }

    /// Put the device into direct-move mode.
    pub async fn start(&self) -> Result<(), RelayError> {
        let response = self
            .request("mode")
            .json(&ModeRequest {
                mode: DIRECT_MOVE_MODE,
            })
            .send()
            .await
            .map_err(|e| RelayError::NetworkTransient(e.to_string()))?;
        match response.status() {
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                Err(RelayError::NetworkAuth(response.status().to_string()))
            }
            status if status.is_success() => {
                info!("direct move client connected to [{}]", self.settings.connection_key);
                Ok(())
            }
            status => Err(RelayError::NetworkTransient(status.to_string())),
        }
    }

    /// Cancel whatever is still in flight.
    pub fn stop(&self) {
        if let Some(handle) = lock(&self.in_flight).take() {
            handle.abort();
        }
    }
}

#[async_trait]
impl Actuator for DirectMoveClient {
    fn name(&self) -> &str {
        "direct"
    }

    async fn send_move(&self, position: f64, duration: Duration) -> Result<(), RelayError> {
        if let Some(why) = lock(&self.auth_failure).clone() {
            return Err(RelayError::NetworkAuth(why));
        }

        let now = Instant::now();
        let gap = lock(&self.last_command)
            .replace(now)
            .map(|last| now.saturating_duration_since(last))
            .unwrap_or(duration);
        let move_duration = move_time(gap, duration, &self.settings);

        let body = MoveRequest {
            stop_on_target: true,
            immediate_response: true,
            duration: move_duration.as_millis() as u64,
            position: position.clamp(0.0, 1.0) * 100.0,
        };
        let request = self.request("hdsp/xpt").json(&body);
        let auth_failure = Arc::clone(&self.auth_failure);

        let handle = tokio::spawn(async move {
            match request.send().await {
                Ok(response) => match response.status() {
                    StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                        warn!("direct move rejected: {}", response.status());
                        *lock(&auth_failure) = Some(response.status().to_string());
                    }
                    status if !status.is_success() => warn!("direct move failed: {status}"),
                    _ => {}
                },
                Err(e) => warn!("direct move failed: {e}"),
            }
        });

        if let Some(previous) = lock(&self.in_flight).replace(handle) {
            if !previous.is_finished() {
                debug!("superseding in-flight move");
                previous.abort();
            }
        }
        debug!(
            "move to {:.2} over {} ms",
            body.position, body.duration
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ms(v: u64) -> Duration {
        Duration::from_millis(v)
    }

    #[test]
    fn move_time_is_clamped() {
        let s = DirectSettings::default();
        assert_eq!(move_time(ms(300), ms(200), &s), ms(200));
        assert_eq!(move_time(ms(150), ms(200), &s), ms(100));
        assert_eq!(move_time(ms(5000), ms(200), &s), ms(600));
        assert_eq!(move_time(ms(5000), ms(0), &s), ms(100));
    }

    #[test]
    fn move_request_body_shape() {
        let body = MoveRequest {
            stop_on_target: true,
            immediate_response: true,
            duration: 250,
            position: 42.0,
        };
        let json = serde_json::to_value(&body).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "stopOnTarget": true,
                "immediateResponse": true,
                "duration": 250,
                "position": 42.0,
            })
        );
    }

    #[tokio::test]
    async fn stored_auth_failure_is_returned() {
        let client = DirectMoveClient::new(DirectSettings::default()).unwrap();
        *lock(&client.auth_failure) = Some("401 Unauthorized".into());
        assert!(matches!(
            client.send_move(0.5, ms(100)).await,
            Err(RelayError::NetworkAuth(_))
        ));
    }
}
