//! Shared data structures for the sensor aggregation core
//!
//! - Event Envelope: the unit of bus transport
//! - Status Snapshot: point-in-time copy of every state section
//! - Contact / Severity / ReplayState: fused contact view
//! - CommandRequest / CommandResult: the command boundary

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Untyped key/value payload carried by events and commands.
pub type JsonMap = Map<String, Value>;

// ============================================================================
// Event Envelope
// ============================================================================

/// Event type tags published on the bus.
pub mod event_types {
    pub const RF_CONTACT_NEW: &str = "RF_CONTACT_NEW";
    pub const RF_CONTACT_UPDATE: &str = "RF_CONTACT_UPDATE";
    pub const RF_CONTACT_LOST: &str = "RF_CONTACT_LOST";
    pub const CONTACT_NEW: &str = "CONTACT_NEW";
    pub const CONTACT_UPDATE: &str = "CONTACT_UPDATE";
    pub const CONTACT_LOST: &str = "CONTACT_LOST";
    pub const REPLAY_STATE: &str = "REPLAY_STATE";
    pub const TELEMETRY_UPDATE: &str = "TELEMETRY_UPDATE";
    pub const SYSTEM_UPDATE: &str = "SYSTEM_UPDATE";
    pub const ESP32_TELEMETRY: &str = "ESP32_TELEMETRY";
    pub const COMMAND_ACK: &str = "COMMAND_ACK";
    pub const LOG_EVENT: &str = "LOG_EVENT";
}

/// Canonical bus event: `{type, timestamp_ms, source, data}`.
///
/// Envelopes are shared between subscribers behind an `Arc` and never
/// mutated after construction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventEnvelope {
    #[serde(rename = "type")]
    pub event_type: String,
    pub timestamp_ms: u64,
    pub source: String,
    pub data: JsonMap,
}

impl EventEnvelope {
    pub fn new(
        event_type: impl Into<String>,
        timestamp_ms: u64,
        source: impl Into<String>,
        data: JsonMap,
    ) -> Self {
        Self {
            event_type: event_type.into(),
            timestamp_ms,
            source: source.into(),
            data,
        }
    }
}

// ============================================================================
// Status Snapshot
// ============================================================================

/// Point-in-time deep copy of every state section.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusSnapshot {
    pub timestamp_ms: u64,
    pub system: Value,
    pub power: Value,
    pub rf: Value,
    pub remote_id: Value,
    pub vrx: Value,
    pub video: Value,
    pub services: Value,
    pub network: Value,
    pub audio: Value,
    pub contacts: Value,
    pub replay: Value,
}

// ============================================================================
// Contacts
// ============================================================================

/// Contact severity, ordered by rank for sorting.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Critical,
    High,
    Medium,
    Low,
    #[default]
    Unknown,
}

impl Severity {
    /// critical:3, high:2, medium:1, low:0, unknown:-1
    pub fn rank(self) -> i8 {
        match self {
            Severity::Critical => 3,
            Severity::High => 2,
            Severity::Medium => 1,
            Severity::Low => 0,
            Severity::Unknown => -1,
        }
    }

    /// Map an RF detector confidence to a severity.
    ///
    /// Numbers and numeric strings are accepted; anything else is `Unknown`.
    pub fn from_confidence(confidence: Option<&Value>) -> Self {
        let value = match confidence {
            Some(Value::Number(n)) => n.as_f64(),
            Some(Value::String(s)) => s.trim().parse::<f64>().ok(),
            _ => None,
        };
        match value {
            Some(v) if v.is_nan() => Severity::Unknown,
            Some(v) if v >= 0.8 => Severity::High,
            Some(v) if v >= 0.5 => Severity::Medium,
            Some(_) => Severity::Low,
            None => Severity::Unknown,
        }
    }
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Severity::Critical => write!(f, "critical"),
            Severity::High => write!(f, "high"),
            Severity::Medium => write!(f, "medium"),
            Severity::Low => write!(f, "low"),
            Severity::Unknown => write!(f, "unknown"),
        }
    }
}

/// Source category of a fused contact.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum ContactKind {
    #[serde(rename = "REMOTE_ID")]
    RemoteId,
    #[serde(rename = "RF")]
    Rf,
    #[serde(rename = "FPV")]
    Fpv,
}

/// Fused contact entity.
///
/// Source-specific fields (freq_hz, rssi_raw, lat/lon, ...) ride along in
/// `extra` and are flattened back into the JSON object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Contact {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: ContactKind,
    pub source: String,
    pub last_seen_ts: u64,
    pub severity: Severity,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub distance_m: Option<f64>,
    #[serde(flatten)]
    pub extra: JsonMap,
}

/// Whether a recorded feed is substituting for live remote-ID data.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplayState {
    pub active: bool,
    pub source: String,
}

impl Default for ReplayState {
    fn default() -> Self {
        Self {
            active: false,
            source: "none".to_string(),
        }
    }
}

impl ReplayState {
    const INACTIVE_STATES: [&'static str; 5] = ["", "stopped", "idle", "disabled", "off"];

    /// Derive replay state from a remote-ID `REPLAY_STATE` payload.
    pub fn from_event(data: &JsonMap) -> Self {
        let state = match data.get("state") {
            Some(Value::String(s)) => s.to_lowercase(),
            Some(Value::Null) | None => String::new(),
            Some(other) => other.to_string().to_lowercase(),
        };
        let active = !Self::INACTIVE_STATES.contains(&state.as_str());
        Self {
            active,
            source: if active { "remoteid" } else { "none" }.to_string(),
        }
    }
}

// ============================================================================
// Command boundary
// ============================================================================

/// Inbound command from the transport layer.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CommandRequest {
    pub command: String,
    #[serde(default)]
    pub payload: JsonMap,
    #[serde(default)]
    pub confirm: bool,
    #[serde(default)]
    pub issued_by: Option<String>,
}

impl CommandRequest {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            ..Default::default()
        }
    }

    pub fn with_payload(mut self, payload: JsonMap) -> Self {
        self.payload = payload;
        self
    }

    pub fn with_confirm(mut self, confirm: bool) -> Self {
        self.confirm = confirm;
        self
    }

    pub fn issued_by(mut self, role: impl Into<String>) -> Self {
        self.issued_by = Some(role.into());
        self
    }
}

/// Outcome of a dispatched command. Never mutated once produced.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandResult {
    pub command: String,
    pub command_id: String,
    pub accepted: bool,
    pub detail: Option<String>,
    pub timestamp_ms: u64,
}

impl CommandResult {
    pub fn new(
        command: impl Into<String>,
        command_id: impl Into<String>,
        accepted: bool,
        detail: Option<String>,
        timestamp_ms: u64,
    ) -> Self {
        Self {
            command: command.into(),
            command_id: command_id.into(),
            accepted,
            detail,
            timestamp_ms,
        }
    }

    /// Non-accepted result with a fresh correlation id.
    pub fn rejected(command: impl Into<String>, detail: impl Into<String>, timestamp_ms: u64) -> Self {
        Self::new(
            command,
            new_command_id(),
            false,
            Some(detail.into()),
            timestamp_ms,
        )
    }
}

/// Fresh correlation / command id.
pub fn new_command_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

// ============================================================================
// JSON helpers
// ============================================================================

/// Read a non-negative integer timestamp from loosely typed JSON.
///
/// Zero is treated as absent, matching producers that emit `0` for "unset".
pub(crate) fn json_timestamp(value: Option<&Value>) -> Option<u64> {
    let ts = match value? {
        Value::Number(n) => n
            .as_u64()
            .or_else(|| n.as_f64().filter(|f| *f >= 0.0).map(|f| f as u64)),
        Value::String(s) => s.trim().parse::<f64>().ok().filter(|f| *f >= 0.0).map(|f| f as u64),
        _ => None,
    }?;
    (ts > 0).then_some(ts)
}

/// Read a float from a number or numeric string.
pub(crate) fn json_f64(value: Option<&Value>) -> Option<f64> {
    match value? {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    }
}
