//! Ingestion pipelines
//!
//! Every source (RF detector log, remote-ID log, VRX microcontroller serial
//! link, system-controller HTTP API) is an [`Ingestor`]: a passive event
//! source with an idempotent start/stop lifecycle around one background loop.

pub mod jsonl;
pub mod remote_id;
pub mod rf;
pub mod serial;
pub mod system_controller;
pub mod tail;

pub use jsonl::{JsonlIngestor, JsonlRecord, RecordSink, TailSettings};
pub use remote_id::{remote_id_ingestor, RemoteIdIngestor, RemoteIdSink};
pub use rf::{rf_ingestor, RfIngestor, RfSink};
pub use serial::{
    LineFramer, SerialConnector, SerialError, SerialIngestor, SerialReader, SerialSettings, SerialStream,
    SerialWriter, TtyConnector,
};
pub use system_controller::{SystemControllerClient, SystemControllerError, SystemControllerIngestor};
pub use tail::{LogTailer, TailError, TailStats};

use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::clock::Clock;
use crate::types::JsonMap;

/// Lifecycle errors surfaced to the orchestrator.
#[derive(Debug, Error)]
pub enum IngestError {
    #[error("{name} background task failed: {message}")]
    TaskFailed { name: String, message: String },
}

/// Common ingestor interface.
#[async_trait]
pub trait Ingestor: Send + Sync {
    /// Stable name used as the health-map key.
    fn name(&self) -> &str;

    /// Launch the background loop. Calling twice is a no-op.
    async fn start(&self) -> Result<(), IngestError>;

    /// Cancel the background loop and wait for it to finish. Calling twice is a no-op.
    async fn stop(&self) -> Result<(), IngestError>;

    async fn health(&self) -> IngestorHealth;
}

// ============================================================================
// Health
// ============================================================================

/// Coarse ingestor status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    /// Running, last cycle succeeded (or nothing has failed yet)
    Ok,
    /// Running, but the most recent outcome was an error
    Degraded,
    /// Background loop not running
    Stopped,
}

impl std::fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HealthStatus::Ok => write!(f, "ok"),
            HealthStatus::Degraded => write!(f, "degraded"),
            HealthStatus::Stopped => write!(f, "stopped"),
        }
    }
}

/// Health report for one ingestor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IngestorHealth {
    pub status: HealthStatus,
    pub running: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_success_ms: Option<u64>,
    /// Source-specific extras (e.g. serial connection state)
    #[serde(default, skip_serializing_if = "JsonMap::is_empty")]
    pub details: JsonMap,
}

#[derive(Debug, Default)]
struct HealthRecord {
    last_error: Option<String>,
    last_error_ms: Option<u64>,
    last_success_ms: Option<u64>,
}

/// Last-error / last-success bookkeeping shared by an ingestor and its loop.
pub struct HealthTracker {
    clock: Arc<dyn Clock>,
    record: Mutex<HealthRecord>,
}

impl HealthTracker {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            record: Mutex::new(HealthRecord::default()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HealthRecord> {
        self.record
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    pub fn record_error(&self, error: impl ToString) {
        let now = self.clock.now_ms();
        let mut record = self.lock();
        record.last_error = Some(error.to_string());
        record.last_error_ms = Some(now);
    }

    pub fn record_success(&self) {
        let now = self.clock.now_ms();
        self.lock().last_success_ms = Some(now);
    }

    pub fn last_error(&self) -> Option<String> {
        self.lock().last_error.clone()
    }

    /// Build a report for the current lifecycle state.
    pub fn report(&self, running: bool) -> IngestorHealth {
        let record = self.lock();
        let status = if !running {
            HealthStatus::Stopped
        } else {
            match (record.last_error_ms, record.last_success_ms) {
                (Some(err), Some(ok)) if err > ok => HealthStatus::Degraded,
                (Some(_), None) => HealthStatus::Degraded,
                _ => HealthStatus::Ok,
            }
        };
        IngestorHealth {
            status,
            running,
            last_error: record.last_error.clone(),
            last_error_ms: record.last_error_ms,
            last_success_ms: record.last_success_ms,
            details: JsonMap::new(),
        }
    }
}

// ============================================================================
// Background task slot
// ============================================================================

struct RunningTask {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

/// Owns at most one cancellable background loop.
pub struct BackgroundTask {
    name: String,
    slot: tokio::sync::Mutex<Option<RunningTask>>,
}

impl BackgroundTask {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            slot: tokio::sync::Mutex::new(None),
        }
    }

    /// Spawn the loop built by `make` unless one is already running.
    pub async fn start<F, Fut>(&self, make: F)
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let mut slot = self.slot.lock().await;
        if slot.is_some() {
            debug!(ingestor = %self.name, "Already running");
            return;
        }
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(make(cancel.clone()));
        *slot = Some(RunningTask { cancel, handle });
        info!(ingestor = %self.name, "Ingestor started");
    }

    /// Cancel the loop and await its termination.
    pub async fn stop(&self) -> Result<(), IngestError> {
        let Some(task) = self.slot.lock().await.take() else {
            return Ok(());
        };
        task.cancel.cancel();
        match task.handle.await {
            Ok(()) => {
                info!(ingestor = %self.name, "Ingestor stopped");
                Ok(())
            }
            Err(e) if e.is_cancelled() => Ok(()),
            Err(e) => {
                warn!(ingestor = %self.name, error = %e, "Ingestor task ended abnormally");
                Err(IngestError::TaskFailed {
                    name: self.name.clone(),
                    message: e.to_string(),
                })
            }
        }
    }

    pub async fn is_running(&self) -> bool {
        self.slot
            .lock()
            .await
            .as_ref()
            .is_some_and(|task| !task.handle.is_finished())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[test]
    fn test_health_status_transitions() {
        let clock = Arc::new(ManualClock::new(100));
        let tracker = HealthTracker::new(clock.clone());
        assert_eq!(tracker.report(false).status, HealthStatus::Stopped);
        assert_eq!(tracker.report(true).status, HealthStatus::Ok);

        tracker.record_error("boom");
        let report = tracker.report(true);
        assert_eq!(report.status, HealthStatus::Degraded);
        assert_eq!(report.last_error.as_deref(), Some("boom"));
        assert_eq!(report.last_error_ms, Some(100));

        clock.advance(50);
        tracker.record_success();
        let report = tracker.report(true);
        assert_eq!(report.status, HealthStatus::Ok);
        assert_eq!(report.last_success_ms, Some(150));
        assert_eq!(report.last_error.as_deref(), Some("boom"));
    }

    #[tokio::test]
    async fn test_background_task_start_is_idempotent_and_stop_awaits() {
        let task = BackgroundTask::new("test");
        let starts = Arc::new(AtomicUsize::new(0));

        for _ in 0..2 {
            let starts = Arc::clone(&starts);
            task.start(|cancel| async move {
                starts.fetch_add(1, Ordering::SeqCst);
                cancel.cancelled().await;
            })
            .await;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(task.is_running().await);
        assert_eq!(starts.load(Ordering::SeqCst), 1);

        task.stop().await.unwrap();
        assert!(!task.is_running().await);
        task.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_background_task_reports_panic() {
        let task = BackgroundTask::new("panicky");
        task.start(|_| async move { panic!("loop failed") }).await;
        let err = task.stop().await.unwrap_err();
        assert!(err.to_string().contains("panicky"));
    }
}
