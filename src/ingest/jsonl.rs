//! JSONL-tailing ingestor shared by the RF and remote-ID pipelines
//!
//! Each line is parsed into a [`JsonlRecord`] (`type`, timestamp, `data`)
//! and handed to a source-specific [`RecordSink`]. Malformed lines are
//! recorded as the last error and skipped; the loop never stops on input.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::tail::{LogTailer, TailStats};
use super::{BackgroundTask, HealthTracker, IngestError, Ingestor, IngestorHealth};
use crate::clock::Clock;
use crate::types::{json_timestamp, JsonMap};

/// One decoded line: `{type?, timestamp|timestamp_ms?, data?}`.
#[derive(Debug, Clone, PartialEq)]
pub struct JsonlRecord {
    pub event_type: Option<String>,
    pub timestamp_ms: u64,
    pub data: JsonMap,
}

impl JsonlRecord {
    /// Decode a line. Non-object payloads yield `Ok(None)`.
    ///
    /// A missing timestamp falls back to `clock`'s now.
    pub fn parse(line: &str, clock: &dyn Clock) -> Result<Option<Self>, serde_json::Error> {
        let Value::Object(payload) = serde_json::from_str::<Value>(line)? else {
            return Ok(None);
        };
        let event_type = match payload.get("type") {
            Some(Value::String(s)) if !s.is_empty() => Some(s.clone()),
            Some(Value::String(_) | Value::Null) | None => None,
            Some(other) => Some(other.to_string()),
        };
        let timestamp_ms = json_timestamp(payload.get("timestamp"))
            .or_else(|| json_timestamp(payload.get("timestamp_ms")))
            .unwrap_or_else(|| {
                let now = clock.now_ms();
                debug!(now, "Record without timestamp, stamping with local clock");
                now
            });
        let data = match payload.get("data") {
            Some(Value::Object(data)) => data.clone(),
            _ => JsonMap::new(),
        };
        Ok(Some(Self {
            event_type,
            timestamp_ms,
            data,
        }))
    }
}

/// Source-specific handling of decoded records.
#[async_trait]
pub trait RecordSink: Send + Sync + 'static {
    async fn apply(&self, record: JsonlRecord);
}

/// Tail location for a JSONL source.
#[derive(Debug, Clone)]
pub struct TailSettings {
    pub path: PathBuf,
    pub poll_interval_ms: u64,
}

struct JsonlShared<S> {
    name: String,
    sink: S,
    tailer: Mutex<LogTailer>,
    health: HealthTracker,
    clock: Arc<dyn Clock>,
}

impl<S: RecordSink> JsonlShared<S> {
    async fn handle_line(&self, line: &str) -> Result<(), serde_json::Error> {
        if let Some(record) = JsonlRecord::parse(line, self.clock.as_ref())? {
            self.sink.apply(record).await;
            self.health.record_success();
        }
        Ok(())
    }

    async fn run(self: Arc<Self>, cancel: CancellationToken) {
        // The tailer outlives restarts so a stop/start does not replay the file.
        let mut tailer = self.tailer.lock().await;
        info!(ingestor = %self.name, path = %tailer.path().display(), "Tailing JSONL");
        loop {
            let line = tokio::select! {
                () = cancel.cancelled() => break,
                line = tailer.next_line() => line,
            };
            if let Err(e) = self.handle_line(&line).await {
                warn!(ingestor = %self.name, error = %e, "Discarding malformed line");
                self.health.record_error(e);
            }
        }
    }
}

/// Ingestor that tails a JSONL file into a [`RecordSink`].
pub struct JsonlIngestor<S> {
    shared: Arc<JsonlShared<S>>,
    task: BackgroundTask,
}

impl<S: RecordSink> JsonlIngestor<S> {
    pub fn new(name: impl Into<String>, settings: &TailSettings, sink: S, clock: Arc<dyn Clock>) -> Self {
        let name = name.into();
        Self {
            task: BackgroundTask::new(name.clone()),
            shared: Arc::new(JsonlShared {
                name,
                sink,
                tailer: Mutex::new(LogTailer::new(
                    settings.path.clone(),
                    settings.poll_interval_ms,
                )),
                health: HealthTracker::new(Arc::clone(&clock)),
                clock,
            }),
        }
    }

    /// Process one raw line as the background loop would.
    pub async fn handle_line(&self, line: &str) -> Result<(), serde_json::Error> {
        self.shared.handle_line(line).await
    }

    pub fn sink(&self) -> &S {
        &self.shared.sink
    }

    /// Tailer counters; `None` while the loop holds the tailer.
    pub fn tail_stats(&self) -> Option<TailStats> {
        self.shared.tailer.try_lock().ok().map(|t| t.stats())
    }
}

#[async_trait]
impl<S: RecordSink> Ingestor for JsonlIngestor<S> {
    fn name(&self) -> &str {
        &self.shared.name
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
