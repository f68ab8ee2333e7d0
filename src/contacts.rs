//! Contact Fusion Engine
//!
//! Keeps one id→Contact map per source category (remote-ID, RF, FPV) and the
//! replay state. Every mutation recomputes the merged, ranked list and pushes
//! it together with the replay state into the State Store.
//!
//! ## Ranking
//!
//! Ascending by `(-severity_rank, distance_m or +inf, -last_seen_ts)`:
//! most severe first, then nearest, then most recently seen.

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::sync::Arc;

use serde_json::{json, Value};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::state::{Section, StateStore};
use crate::types::{
    event_types, json_f64, json_timestamp, Contact, ContactKind, JsonMap, ReplayState, Severity,
};

/// Fields owned by the fused contact itself; never copied from source payloads.
const RESERVED_FIELDS: [&str; 5] = ["id", "type", "source", "last_seen_ts", "severity"];

#[derive(Debug, Default)]
struct FusionState {
    remote_id: BTreeMap<String, Contact>,
    rf: BTreeMap<String, Contact>,
    fpv: BTreeMap<String, Contact>,
    replay: ReplayState,
}

impl FusionState {
    fn merged(&self) -> Vec<Contact> {
        let mut merged: Vec<Contact> = self
            .remote_id
            .values()
            .chain(self.rf.values())
            .chain(self.fpv.values())
            .cloned()
            .collect();
        merged.sort_by(compare_contacts);
        merged
    }
}

/// Ranking order for the merged contact list.
pub fn compare_contacts(a: &Contact, b: &Contact) -> Ordering {
    let distance = |c: &Contact| c.distance_m.unwrap_or(f64::INFINITY);
    b.severity
        .rank()
        .cmp(&a.severity.rank())
        .then_with(|| distance(a).total_cmp(&distance(b)))
        .then_with(|| b.last_seen_ts.cmp(&a.last_seen_ts))
}

/// Render a JSON id value as a map key (strings unquoted).
fn id_string(value: Option<&Value>) -> Option<String> {
    match value? {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

fn build_contact(
    data: &JsonMap,
    id: String,
    kind: ContactKind,
    source: &str,
    last_seen_ts: u64,
    severity: Severity,
) -> Contact {
    let mut extra: JsonMap = data
        .iter()
        .filter(|(key, _)| !RESERVED_FIELDS.contains(&key.as_str()))
        .map(|(key, value)| (key.clone(), value.clone()))
        .collect();
    let distance_m = json_f64(extra.get("distance_m"));
    if distance_m.is_some() {
        extra.remove("distance_m");
    }
    Contact {
        id,
        kind,
        source: source.to_string(),
        last_seen_ts,
        severity,
        distance_m,
        extra,
    }
}

/// Merges per-source contact sets into one ranked view.
pub struct ContactFusion {
    state_store: Arc<StateStore>,
    inner: Mutex<FusionState>,
}

impl ContactFusion {
    pub fn new(state_store: Arc<StateStore>) -> Self {
        Self {
            state_store,
            inner: Mutex::new(FusionState::default()),
        }
    }

    /// Apply a remote-ID CONTACT_NEW/UPDATE/LOST event.
    ///
    /// Payloads without an `id` are ignored.
    pub async fn update_remote_id(&self, event_type: &str, data: &JsonMap, timestamp_ms: u64) {
        let Some(id) = id_string(data.get("id")) else {
            debug!(event_type, "Remote-ID contact without id ignored");
            return;
        };
        let mut inner = self.inner.lock().await;
        if event_type == event_types::CONTACT_LOST {
            inner.remote_id.remove(&id);
        } else {
            let last_seen_ts = json_timestamp(data.get("last_seen_ts")).unwrap_or(timestamp_ms);
            let contact = build_contact(
                data,
                id.clone(),
                ContactKind::RemoteId,
                "remoteid",
                last_seen_ts,
                Severity::Unknown,
            );
            inner.remote_id.insert(id, contact);
        }
        self.publish(&inner).await;
    }

    /// Apply an RF_CONTACT_NEW/UPDATE/LOST event.
    ///
    /// The id defaults to `rf:<freq_hz>` when the detector omits it.
    pub async fn update_rf(&self, event_type: &str, data: &JsonMap, timestamp_ms: u64) {
        let id = id_string(data.get("id")).unwrap_or_else(|| {
            let freq = match data.get("freq_hz") {
                Some(Value::String(s)) => s.clone(),
                Some(Value::Null) | None => "unknown".to_string(),
                Some(other) => other.to_string(),
            };
            format!("rf:{freq}")
        });
        let mut inner = self.inner.lock().await;
        if event_type == event_types::RF_CONTACT_LOST {
            inner.rf.remove(&id);
        } else {
            let severity = Severity::from_confidence(data.get("confidence"));
            let contact = build_contact(data, id.clone(), ContactKind::Rf, "antsdr", timestamp_ms, severity);
            inner.rf.insert(id, contact);
        }
        self.publish(&inner).await;
    }

    /// Replace the FPV set from microcontroller telemetry.
    ///
    /// Only the strongest receiver channel (highest `rssi_raw`) becomes a
    /// contact; an empty channel list clears the set.
    pub async fn update_fpv(&self, telemetry: &JsonMap, timestamp_ms: u64) {
        let channels: Vec<&JsonMap> = telemetry
            .get("vrx")
            .and_then(Value::as_array)
            .map(|list| list.iter().filter_map(Value::as_object).collect())
            .unwrap_or_default();

        let mut strongest: Option<(&JsonMap, f64)> = None;
        for channel in channels {
            let rssi = json_f64(channel.get("rssi_raw")).unwrap_or(0.0);
            if strongest.map_or(true, |(_, best)| rssi > best) {
                strongest = Some((channel, rssi));
            }
        }

        let mut inner = self.inner.lock().await;
        inner.fpv.clear();
        if let Some((channel, _)) = strongest {
            let vrx_id = channel.get("id").cloned().unwrap_or_else(|| json!("unknown"));
            let id = format!(
                "fpv:{}",
                id_string(Some(&vrx_id)).unwrap_or_else(|| "unknown".to_string())
            );
            let mut extra = JsonMap::new();
            extra.insert("vrx_id".into(), vrx_id);
            extra.insert("freq_hz".into(), channel.get("freq_hz").cloned().unwrap_or(Value::Null));
            extra.insert("rssi_raw".into(), channel.get("rssi_raw").cloned().unwrap_or(Value::Null));
            extra.insert("selected".into(), telemetry.get("sel").cloned().unwrap_or(Value::Null));
            let contact = Contact {
                id: id.clone(),
                kind: ContactKind::Fpv,
                source: "esp32".to_string(),
                last_seen_ts: timestamp_ms,
                severity: Severity::Unknown,
                distance_m: None,
                extra,
            };
            inner.fpv.insert(id, contact);
        }
        self.publish(&inner).await;
    }

    /// Apply a remote-ID REPLAY_STATE event.
    pub async fn update_replay(&self, data: &JsonMap) {
        let mut inner = self.inner.lock().await;
        inner.replay = ReplayState::from_event(data);
        debug!(active = inner.replay.active, "Replay state updated");
        self.publish(&inner).await;
    }

    /// Current merged, ranked contact list.
    pub async fn contacts(&self) -> Vec<Contact> {
        self.inner.lock().await.merged()
    }

    pub async fn replay(&self) -> ReplayState {
        self.inner.lock().await.replay.clone()
    }

    /// Push contacts and replay together; either may be stale otherwise.
    ///
    /// Runs while the fusion lock is held so concurrent mutations reach the
    /// store in the order they were applied.
    async fn publish(&self, inner: &FusionState) {
        let contacts = match serde_json::to_value(inner.merged()) {
            Ok(value) => value,
            Err(e) => {
                warn!(error = %e, "Failed to serialize contacts");
                return;
            }
        };
        let replay = serde_json::to_value(&inner.replay).unwrap_or_else(|_| json!({"active": false, "source": "none"}));
        self.state_store.update(Section::Contacts, contacts).await;
        self.state_store.update(Section::Replay, replay).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    fn map(value: Value) -> JsonMap {
        value.as_object().cloned().unwrap_or_default()
    }

    fn fusion() -> (Arc<StateStore>, ContactFusion) {
        let store = Arc::new(StateStore::new(Arc::new(ManualClock::new(0))));
        let fusion = ContactFusion::new(Arc::clone(&store));
        (store, fusion)
    }

    #[tokio::test]
    async fn test_rf_high_confidence_sorts_before_remote_id() {
        let (store, fusion) = fusion();
        fusion
            .update_remote_id("CONTACT_NEW", &map(json!({"id": "r1", "type": "REMOTE_ID", "last_seen_ts": 10})), 10)
            .await;
        fusion
            .update_rf("RF_CONTACT_NEW", &map(json!({"id": "rf1", "confidence": 0.9})), 20)
            .await;

        let snapshot = store.snapshot().await;
        let contacts = snapshot.contacts.as_array().unwrap();
        assert_eq!(contacts.len(), 2);
        assert_eq!(contacts[0]["id"], "rf1");
        assert_eq!(contacts[0]["severity"], "high");
        assert_eq!(contacts[1]["severity"], "unknown");
        assert_eq!(contacts[1]["type"], "REMOTE_ID");
        assert_eq!(snapshot.replay, json!({"active": false, "source": "none"}));
    }

    #[tokio::test]
    async fn test_equal_severity_sorts_by_distance_then_recency() {
        let (_, fusion) = fusion();
        fusion
            .update_remote_id("CONTACT_NEW", &map(json!({"id": "far", "distance_m": 500.0})), 100)
            .await;
        fusion
            .update_remote_id("CONTACT_NEW", &map(json!({"id": "near", "distance_m": 50})), 50)
            .await;
        fusion
            .update_remote_id("CONTACT_NEW", &map(json!({"id": "near-newer", "distance_m": 50})), 60)
            .await;
        fusion
            .update_remote_id("CONTACT_NEW", &map(json!({"id": "nowhere"})), 900)
            .await;

        let ids: Vec<String> = fusion.contacts().await.into_iter().map(|c| c.id).collect();
        assert_eq!(ids, vec!["near-newer", "near", "far", "nowhere"]);
    }

    #[tokio::test]
    async fn test_lost_removes_contact() {
        let (_, fusion) = fusion();
        fusion.update_remote_id("CONTACT_NEW", &map(json!({"id": "r1"})), 1).await;
        fusion.update_rf("RF_CONTACT_NEW", &map(json!({"freq_hz": 5800})), 1).await;
        assert_eq!(fusion.contacts().await.len(), 2);

        fusion.update_remote_id("CONTACT_LOST", &map(json!({"id": "r1"})), 2).await;
        fusion.update_rf("RF_CONTACT_LOST", &map(json!({"freq_hz": 5800})), 2).await;
        assert!(fusion.contacts().await.is_empty());
    }

    #[tokio::test]
    async fn test_remote_id_without_id_ignored() {
        let (_, fusion) = fusion();
        fusion.update_remote_id("CONTACT_NEW", &map(json!({"lat": 1.0})), 1).await;
        assert!(fusion.contacts().await.is_empty());
    }

    #[tokio::test]
    async fn test_remote_id_copies_source_fields_and_overrides_reserved() {
        let (_, fusion) = fusion();
        fusion
            .update_remote_id(
                "CONTACT_UPDATE",
                &map(json!({"id": "r1", "type": "X", "severity": "critical", "lat": 51.5, "serial": "ABC"})),
                33,
            )
            .await;
        let contact = &fusion.contacts().await[0];
        assert_eq!(contact.kind, ContactKind::RemoteId);
        assert_eq!(contact.severity, Severity::Unknown);
        assert_eq!(contact.source, "remoteid");
        assert_eq!(contact.last_seen_ts, 33);
        assert_eq!(contact.extra["lat"], 51.5);
        assert_eq!(contact.extra["serial"], "ABC");
        assert!(!contact.extra.contains_key("type"));
    }

    #[tokio::test]
    async fn test_fpv_keeps_strongest_channel_only() {
        let (_, fusion) = fusion();
        let telemetry = map(json!({
            "sel": 2,
            "vrx": [
                {"id": 1, "freq_hz": 5_740_000_000_u64, "rssi_raw": 120},
                {"id": 2, "freq_hz": 5_800_000_000_u64, "rssi_raw": 300},
                {"id": 3, "freq_hz": 5_860_000_000_u64, "rssi_raw": 90}
            ]
        }));
        fusion.update_fpv(&telemetry, 1000).await;
        let contacts = fusion.contacts().await;
        assert_eq!(contacts.len(), 1);
        assert_eq!(contacts[0].id, "fpv:2");
        assert_eq!(contacts[0].kind, ContactKind::Fpv);
        assert_eq!(contacts[0].extra["rssi_raw"], 300);
        assert_eq!(contacts[0].extra["selected"], 2);

        fusion.update_fpv(&map(json!({"vrx": []})), 2000).await;
        assert!(fusion.contacts().await.is_empty());
    }

    #[tokio::test]
    async fn test_replay_pushed_to_state() {
        let (store, fusion) = fusion();
        fusion.update_replay(&map(json!({"state": "PLAYING"}))).await;
        assert_eq!(
            store.section(Section::Replay).await,
            json!({"active": true, "source": "remoteid"})
        );
        fusion.update_replay(&map(json!({"state": "stopped"}))).await;
        assert!(!fusion.replay().await.active);
    }
}
