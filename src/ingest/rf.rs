//! RF detector ingestion
//!
//! Tails the detector's JSONL output. The detector reports contacts as
//! CONTACT_NEW/UPDATE/LOST; they are renamed into the RF_CONTACT_* namespace
//! so consumers can tell them apart from remote-ID contacts.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};

use super::jsonl::{JsonlIngestor, JsonlRecord, RecordSink, TailSettings};
use crate::bus::EventBus;
use crate::clock::Clock;
use crate::contacts::ContactFusion;
use crate::state::{Section, StateStore};
use crate::types::{event_types, EventEnvelope};

pub const RF_SOURCE: &str = "antsdr";

/// RF ingestor: a JSONL tailer feeding [`RfSink`].
pub type RfIngestor = JsonlIngestor<RfSink>;

/// Map detector event names onto the bus namespace.
pub fn normalize_rf_type(event_type: Option<&str>) -> String {
    match event_type {
        None => event_types::RF_CONTACT_UPDATE.to_string(),
        Some("CONTACT_NEW") => event_types::RF_CONTACT_NEW.to_string(),
        Some("CONTACT_UPDATE") => event_types::RF_CONTACT_UPDATE.to_string(),
        Some("CONTACT_LOST") => event_types::RF_CONTACT_LOST.to_string(),
        Some(other) => other.to_string(),
    }
}

pub struct RfSink {
    state: Arc<StateStore>,
    bus: Arc<EventBus>,
    fusion: Option<Arc<ContactFusion>>,
}

impl RfSink {
    pub fn new(state: Arc<StateStore>, bus: Arc<EventBus>, fusion: Option<Arc<ContactFusion>>) -> Self {
        Self { state, bus, fusion }
    }
}

#[async_trait]
impl RecordSink for RfSink {
    async fn apply(&self, record: JsonlRecord) {
        self.state
            .update(
                Section::Rf,
                json!({
                    "last_event_type": record.event_type,
                    "last_event": Value::Object(record.data.clone()),
                    "last_timestamp_ms": record.timestamp_ms,
                }),
            )
            .await;

        let event_type = normalize_rf_type(record.event_type.as_deref());
        if let Some(fusion) = &self.fusion {
            if event_type.starts_with("RF_CONTACT_") {
                fusion
                    .update_rf(&event_type, &record.data, record.timestamp_ms)
                    .await;
            }
        }

        self.bus.publish(EventEnvelope::new(
            event_type,
            record.timestamp_ms,
            RF_SOURCE,
            record.data,
        ));
    }
}

/// Build the RF ingestor.
pub fn rf_ingestor(
    settings: &TailSettings,
    state: Arc<StateStore>,
    bus: Arc<EventBus>,
    fusion: Option<Arc<ContactFusion>>,
    clock: Arc<dyn Clock>,
) -> RfIngestor {
    JsonlIngestor::new("rf", settings, RfSink::new(state, bus, fusion), clock)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    fn setup(with_fusion: bool) -> (Arc<StateStore>, Arc<EventBus>, RfIngestor) {
        let clock: Arc<dyn Clock> = Arc::new(ManualClock::new(5_000));
        let state = Arc::new(StateStore::new(Arc::clone(&clock)));
        let bus = Arc::new(EventBus::new(16).unwrap());
        let fusion = with_fusion.then(|| Arc::new(ContactFusion::new(Arc::clone(&state))));
        let settings = TailSettings {
            path: "/nonexistent/rf.jsonl".into(),
            poll_interval_ms: 10,
        };
        let ingestor = rf_ingestor(&settings, Arc::clone(&state), Arc::clone(&bus), fusion, clock);
        (state, bus, ingestor)
    }

    #[test]
    fn test_normalize_rf_type() {
        assert_eq!(normalize_rf_type(Some("CONTACT_NEW")), "RF_CONTACT_NEW");
        assert_eq!(normalize_rf_type(Some("CONTACT_UPDATE")), "RF_CONTACT_UPDATE");
        assert_eq!(normalize_rf_type(Some("CONTACT_LOST")), "RF_CONTACT_LOST");
        assert_eq!(normalize_rf_type(None), "RF_CONTACT_UPDATE");
        assert_eq!(normalize_rf_type(Some("HEARTBEAT")), "HEARTBEAT");
    }

    #[tokio::test]
    async fn test_line_updates_state_and_publishes() {
        let (state, bus, ingestor) = setup(false);
        let sub = bus.subscribe();
        ingestor
            .handle_line(r#"{"type":"CONTACT_NEW","timestamp":1,"data":{"id":"x"}}"#)
            .await
            .unwrap();

        let event = sub.try_recv().unwrap();
        assert_eq!(event.event_type, "RF_CONTACT_NEW");
        assert_eq!(event.timestamp_ms, 1);
        assert_eq!(event.source, "antsdr");
        assert_eq!(Value::Object(event.data.clone()), json!({"id": "x"}));

        assert_eq!(
            state.section(Section::Rf).await,
            json!({"last_event_type": "CONTACT_NEW", "last_event": {"id": "x"}, "last_timestamp_ms": 1})
        );
    }

    #[tokio::test]
    async fn test_contacts_forwarded_to_fusion() {
        let (state, _bus, ingestor) = setup(true);
        ingestor
            .handle_line(r#"{"type":"CONTACT_NEW","timestamp":7,"data":{"id":"rf1","confidence":0.55}}"#)
            .await
            .unwrap();
        let contacts = state.section(Section::Contacts).await;
        assert_eq!(contacts[0]["id"], "rf1");
        assert_eq!(contacts[0]["severity"], "medium");

        ingestor
            .handle_line(r#"{"type":"CONTACT_LOST","timestamp":8,"data":{"id":"rf1"}}"#)
            .await
            .unwrap();
        assert_eq!(state.section(Section::Contacts).await, json!([]));
    }

    #[tokio::test]
    async fn test_malformed_line_is_error_without_side_effects() {
        let (state, bus, ingestor) = setup(false);
        let sub = bus.subscribe();
        assert!(ingestor.handle_line("{garbage").await.is_err());
        assert!(ingestor.handle_line("[1,2]").await.is_ok());
        assert!(sub.is_empty());
        assert_eq!(state.section(Section::Rf).await, json!({}));
    }
}
