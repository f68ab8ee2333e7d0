//! Runtime orchestration
//!
//! The [`Orchestrator`] owns the configured ingestors and drives their
//! lifecycle together. Start and stop fan out concurrently and wait for
//! every ingestor, so one failure never hides another.

use std::collections::BTreeMap;
use std::sync::Arc;

use futures::future::join_all;
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::bus::EventBus;
use crate::clock::Clock;
use crate::commands::{CommandRouter, SerialCommandHandler, SystemCommandHandler};
use crate::config::AggregatorConfig;
use crate::contacts::ContactFusion;
use crate::ingest::{
    remote_id_ingestor, rf_ingestor, IngestError, Ingestor, IngestorHealth, SerialIngestor, SerialSettings,
    SystemControllerClient, SystemControllerError, SystemControllerIngestor, TailSettings, TtyConnector,
};
use crate::state::StateStore;

/// Every ingestor failure from one lifecycle transition.
#[derive(Debug)]
pub struct OrchestratorError(pub Vec<IngestError>);

impl std::fmt::Display for OrchestratorError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ingestor(s) failed", self.0.len())?;
        for (i, error) in self.0.iter().enumerate() {
            write!(f, "{} {}", if i == 0 { ":" } else { ";" }, error)?;
        }
        Ok(())
    }
}

impl std::error::Error for OrchestratorError {}

/// Starts, stops and health-checks a fixed set of ingestors.
pub struct Orchestrator {
    ingestors: Vec<Arc<dyn Ingestor>>,
    running: Mutex<bool>,
}

impl Orchestrator {
    pub fn new(ingestors: Vec<Arc<dyn Ingestor>>) -> Self {
        Self {
            ingestors,
            running: Mutex::new(false),
        }
    }

    pub fn ingestors(&self) -> &[Arc<dyn Ingestor>] {
        &self.ingestors
    }

    pub async fn is_running(&self) -> bool {
        *self.running.lock().await
    }

    /// Start every ingestor concurrently. No-op when already started.
    pub async fn start(&self) -> Result<(), OrchestratorError> {
        let mut running = self.running.lock().await;
        if *running {
            return Ok(());
        }
        let results = join_all(self.ingestors.iter().map(|i| i.start())).await;
        *running = true;
        info!(count = self.ingestors.len(), "Ingestors started");
        collect(results)
    }

    /// Stop every ingestor concurrently, awaiting all of them.
    pub async fn stop(&self) -> Result<(), OrchestratorError> {
        let mut running = self.running.lock().await;
        if !*running {
            return Ok(());
        }
        let results = join_all(self.ingestors.iter().map(|i| i.stop())).await;
        *running = false;
        info!(count = self.ingestors.len(), "Ingestors stopped");
        collect(results)
    }

    /// Health of every ingestor keyed by name.
    pub async fn health(&self) -> BTreeMap<String, IngestorHealth> {
        let reports = join_all(self.ingestors.iter().map(|i| async move {
            (i.name().to_string(), i.health().await)
        }))
        .await;
        reports.into_iter().collect()
    }
}

fn collect(results: Vec<Result<(), IngestError>>) -> Result<(), OrchestratorError> {
    let failures: Vec<IngestError> = results.into_iter().filter_map(Result::err).collect();
    if failures.is_empty() {
        Ok(())
    } else {
        for failure in &failures {
            warn!(error = %failure, "Ingestor lifecycle failure");
        }
        Err(OrchestratorError(failures))
    }
}

/// Ingestors built from configuration, plus the handles commands need.
pub struct Runtime {
    pub orchestrator: Orchestrator,
    pub serial: Option<Arc<SerialIngestor>>,
    pub client: SystemControllerClient,
}

/// Build the ingestors enabled in `config`.
///
/// The system-controller poller is always present; RF, remote-ID and serial
/// follow the feature flags.
pub fn build_default_orchestrator(
    config: &AggregatorConfig,
    state: Arc<StateStore>,
    bus: Arc<EventBus>,
    fusion: Arc<ContactFusion>,
    clock: Arc<dyn Clock>,
) -> Result<Runtime, SystemControllerError> {
    let client = SystemControllerClient::new(&config.system_controller)?;
    let mut ingestors: Vec<Arc<dyn Ingestor>> = vec![Arc::new(SystemControllerIngestor::new(
        client.clone(),
        config.polling.system_controller_interval_ms,
        Arc::clone(&state),
        Arc::clone(&bus),
        Arc::clone(&clock),
    ))];

    let serial = config.features.enable_serial.then(|| {
        Arc::new(SerialIngestor::new(
            SerialSettings::from(&config.serial),
            Arc::new(TtyConnector::new(config.serial.baud_rate)),
            Arc::clone(&state),
            Arc::clone(&bus),
            Some(Arc::clone(&fusion)),
            Arc::clone(&clock),
        ))
    });
    if let Some(serial) = &serial {
        ingestors.push(Arc::clone(serial) as Arc<dyn Ingestor>);
    }

    if config.features.enable_rf {
        let settings = TailSettings {
            path: config.rf.jsonl_path.clone().into(),
            poll_interval_ms: config.rf.tail_poll_interval_ms,
        };
        ingestors.push(Arc::new(rf_ingestor(
            &settings,
            Arc::clone(&state),
            Arc::clone(&bus),
            Some(Arc::clone(&fusion)),
            Arc::clone(&clock),
        )));
    }

    if config.features.enable_remote_id {
        let settings = TailSettings {
            path: config.remote_id.jsonl_path.clone().into(),
            poll_interval_ms: config.remote_id.tail_poll_interval_ms,
        };
        ingestors.push(Arc::new(remote_id_ingestor(
            &settings,
            state,
            bus,
            Some(fusion),
            clock,
        )));
    }

    Ok(Runtime {
        orchestrator: Orchestrator::new(ingestors),
        serial,
        client,
    })
}

/// Router with the serial handler (when the link is enabled) ahead of the
/// system-controller proxy.
pub fn build_command_router(config: &AggregatorConfig, runtime: &Runtime, clock: Arc<dyn Clock>) -> CommandRouter {
    let mut router = CommandRouter::new(Arc::clone(&clock));
    if let Some(serial) = &runtime.serial {
        router.register(Arc::new(SerialCommandHandler::new(Arc::clone(serial), Arc::clone(&clock))));
    }
    router.register(Arc::new(SystemCommandHandler::new(
        runtime.client.clone(),
        config.safety.allow_unsafe_operations,
        clock,
    )));
    router
}
