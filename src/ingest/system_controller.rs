//! System Controller: HTTP client and status poller
//!
//! The system controller owns power (UPS), services, network and audio. Its
//! `GET /status` document is polled on a fixed interval and fanned out into
//! the matching state sections; failures are recorded and retried on the
//! next tick.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{BackgroundTask, HealthTracker, IngestError, Ingestor, IngestorHealth};
use crate::bus::EventBus;
use crate::clock::Clock;
use crate::config::SystemControllerConfig;
use crate::state::{Section, StateStore};
use crate::types::{event_types, json_timestamp, EventEnvelope, JsonMap};

pub const SYSTEM_SOURCE: &str = "system_controller";

/// Status document keys and the sections they land in.
const STATUS_SECTIONS: [(&str, Section); 5] = [
    ("system", Section::System),
    ("ups", Section::Power),
    ("services", Section::Services),
    ("network", Section::Network),
    ("audio", Section::Audio),
];

/// System controller client errors
#[derive(Debug, Error)]
pub enum SystemControllerError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("System controller returned status {0}")]
    Status(reqwest::StatusCode),
    #[error("Unexpected status payload: {0}")]
    Payload(String),
}

/// HTTP client for the system controller API
#[derive(Clone)]
pub struct SystemControllerClient {
    http: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
}

impl SystemControllerClient {
    pub fn new(config: &SystemControllerConfig) -> Result<Self, SystemControllerError> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;

        Ok(Self {
            http,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone().filter(|k| !k.is_empty()),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, endpoint: &str) -> String {
        format!("{}/{}", self.base_url, endpoint.trim_start_matches('/'))
    }

    fn with_key(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.api_key {
            Some(key) => req.header("X-API-Key", key),
            None => req,
        }
    }

    /// Fetch the aggregate status document.
    pub async fn status(&self) -> Result<JsonMap, SystemControllerError> {
        let resp = self.with_key(self.http.get(self.url("/status"))).send().await?;
        if !resp.status().is_success() {
            return Err(SystemControllerError::Status(resp.status()));
        }
        match resp.json::<Value>().await? {
            Value::Object(map) => Ok(map),
            other => Err(SystemControllerError::Payload(format!(
                "expected object, got {}",
                json_kind(&other)
            ))),
        }
    }

    /// POST a JSON body; any non-2xx status is an error.
    pub async fn post(&self, endpoint: &str, body: &Value) -> Result<(), SystemControllerError> {
        let resp = self
            .with_key(self.http.post(self.url(endpoint)))
            .json(body)
            .send()
            .await?;
        if resp.status().is_success() {
            Ok(())
        } else {
            Err(SystemControllerError::Status(resp.status()))
        }
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

struct PollerShared {
    client: SystemControllerClient,
    interval: Duration,
    state: Arc<StateStore>,
    bus: Arc<EventBus>,
    clock: Arc<dyn Clock>,
    health: HealthTracker,
}

impl PollerShared {
    async fn poll_once(&self) -> Result<(), SystemControllerError> {
        let status = self.client.status().await?;

        // Sections absent from the document keep their last known value.
        for (key, section) in STATUS_SECTIONS {
            if let Some(value) = status.get(key) {
                self.state.update(section, value.clone()).await;
            }
        }

        let timestamp_ms = json_timestamp(status.get("timestamp_ms")).unwrap_or_else(|| self.clock.now_ms());
        self.bus.publish(EventEnvelope::new(
            event_types::SYSTEM_UPDATE,
            timestamp_ms,
            SYSTEM_SOURCE,
            status,
        ));
        Ok(())
    }

    async fn run(self: Arc<Self>, cancel: CancellationToken) {
        info!(
            base_url = %self.client.base_url(),
            interval_ms = self.interval.as_millis() as u64,
            "System controller poller started"
        );
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }
            let outcome = tokio::select! {
                () = cancel.cancelled() => break,
                outcome = self.poll_once() => outcome,
            };
            match outcome {
                Ok(()) => {
                    debug!("System controller status updated");
                    self.health.record_success();
                }
                Err(e) => {
                    warn!(error = %e, "System controller poll failed, will retry");
                    self.health.record_error(e);
                }
            }
        }
    }
}

/// Polls the system controller's status endpoint.
pub struct SystemControllerIngestor {
    shared: Arc<PollerShared>,
    task: BackgroundTask,
}

impl SystemControllerIngestor {
    pub fn new(
        client: SystemControllerClient,
        interval_ms: u64,
        state: Arc<StateStore>,
        bus: Arc<EventBus>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            task: BackgroundTask::new("system-controller"),
            shared: Arc::new(PollerShared {
                client,
                interval: Duration::from_millis(interval_ms.max(1)),
                state,
                bus,
                health: HealthTracker::new(Arc::clone(&clock)),
                clock,
            }),
        }
    }

    /// Run a single poll cycle, recording the outcome.
    pub async fn poll_once(&self) -> Result<(), SystemControllerError> {
        let outcome = self.shared.poll_once().await;
        match &outcome {
            Ok(()) => self.shared.health.record_success(),
            Err(e) => self.shared.health.record_error(e),
        }
        outcome
    }
}

#[async_trait]
impl Ingestor for SystemControllerIngestor {
    fn name(&self) -> &str {
        "system-controller"
    }

    async fn start(&self) -> Result<(), IngestError> {
        let shared = Arc::clone(&self.shared);
        self.task.start(move |cancel| shared.run(cancel)).await;
        Ok(())
    }

    async fn stop(&self) -> Result<(), IngestError> {
        self.task.stop().await
    }

    async fn health(&self) -> IngestorHealth {
        self.shared.health.report(self.task.is_running().await)
    }
}
