//! Remote-ID receiver ingestion
//!
//! Tails the receiver's JSONL log. Contact events feed the fusion engine,
//! REPLAY_STATE toggles the replay indicator, and every record is
//! republished on the bus under its own type.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};

use super::jsonl::{JsonlIngestor, JsonlRecord, RecordSink, TailSettings};
use crate::bus::EventBus;
use crate::clock::Clock;
use crate::contacts::ContactFusion;
use crate::state::{Section, StateStore};
use crate::types::{event_types, EventEnvelope};

pub const REMOTE_ID_SOURCE: &str = "remoteid";

/// Remote-ID ingestor: a JSONL tailer feeding [`RemoteIdSink`].
pub type RemoteIdIngestor = JsonlIngestor<RemoteIdSink>;

pub struct RemoteIdSink {
    state: Arc<StateStore>,
    bus: Arc<EventBus>,
    fusion: Option<Arc<ContactFusion>>,
}

impl RemoteIdSink {
    pub fn new(state: Arc<StateStore>, bus: Arc<EventBus>, fusion: Option<Arc<ContactFusion>>) -> Self {
        Self { state, bus, fusion }
    }
}

#[async_trait]
impl RecordSink for RemoteIdSink {
    async fn apply(&self, record: JsonlRecord) {
        self.state
            .update(
                Section::RemoteId,
                json!({
                    "last_event_type": record.event_type,
                    "last_event": Value::Object(record.data.clone()),
                    "last_timestamp_ms": record.timestamp_ms,
                }),
            )
            .await;

        if let (Some(fusion), Some(event_type)) = (&self.fusion, record.event_type.as_deref()) {
            match event_type {
                event_types::CONTACT_NEW | event_types::CONTACT_UPDATE | event_types::CONTACT_LOST => {
                    fusion
                        .update_remote_id(event_type, &record.data, record.timestamp_ms)
                        .await;
                }
                event_types::REPLAY_STATE => fusion.update_replay(&record.data).await,
                _ => {}
            }
        }

        let event_type = record
            .event_type
            .unwrap_or_else(|| event_types::TELEMETRY_UPDATE.to_string());
        self.bus.publish(EventEnvelope::new(
            event_type,
            record.timestamp_ms,
            REMOTE_ID_SOURCE,
            record.data,
        ));
    }
}

/// Build the remote-ID ingestor.
pub fn remote_id_ingestor(
    settings: &TailSettings,
    state: Arc<StateStore>,
    bus: Arc<EventBus>,
    fusion: Option<Arc<ContactFusion>>,
    clock: Arc<dyn Clock>,
) -> RemoteIdIngestor {
    JsonlIngestor::new("remote_id", settings, RemoteIdSink::new(state, bus, fusion), clock)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    fn setup() -> (Arc<StateStore>, Arc<EventBus>, RemoteIdIngestor) {
        let clock: Arc<dyn Clock> = Arc::new(ManualClock::new(42));
        let state = Arc::new(StateStore::new(Arc::clone(&clock)));
        let bus = Arc::new(EventBus::new(16).unwrap());
        let fusion = Arc::new(ContactFusion::new(Arc::clone(&state)));
        let settings = TailSettings {
            path: "/nonexistent/remoteid.jsonl".into(),
            poll_interval_ms: 10,
        };
        let ingestor = remote_id_ingestor(&settings, Arc::clone(&state), Arc::clone(&bus), Some(fusion), clock);
        (state, bus, ingestor)
    }

    #[tokio::test]
    async fn test_contact_event_fused_and_published() {
        let (state, bus, ingestor) = setup();
        let sub = bus.subscribe();
        ingestor
            .handle_line(r#"{"type":"CONTACT_NEW","timestamp_ms":10,"data":{"id":"drone-1","distance_m":120.5}}"#)
            .await
            .unwrap();

        let event = sub.try_recv().unwrap();
        assert_eq!(event.event_type, "CONTACT_NEW");
        assert_eq!(event.source, "remoteid");

        let snapshot = state.snapshot().await;
        assert_eq!(snapshot.remote_id["last_event_type"], "CONTACT_NEW");
        assert_eq!(snapshot.contacts[0]["id"], "drone-1");
        assert_eq!(snapshot.contacts[0]["type"], "REMOTE_ID");
        assert_eq!(snapshot.contacts[0]["distance_m"], 120.5);
        assert_eq!(snapshot.contacts[0]["last_seen_ts"], 10);
    }

    #[tokio::test]
    async fn test_replay_state_event() {
        let (state, bus, ingestor) = setup();
        let sub = bus.subscribe();
        ingestor
            .handle_line(r#"{"type":"REPLAY_STATE","data":{"state":"running"}}"#)
            .await
            .unwrap();
        assert_eq!(
            state.section(Section::Replay).await,
            json!({"active": true, "source": "remoteid"})
        );
        let event = sub.try_recv().unwrap();
        assert_eq!(event.event_type, "REPLAY_STATE");
        assert_eq!(event.timestamp_ms, 42);
    }

    #[tokio::test]
    async fn test_untyped_record_published_as_telemetry() {
        let (_, bus, ingestor) = setup();
        let sub = bus.subscribe();
        ingestor
            .handle_line(r#"{"timestamp":3,"data":{"rssi":-70}}"#)
            .await
            .unwrap();
        assert_eq!(sub.try_recv().unwrap().event_type, "TELEMETRY_UPDATE");
    }
}
