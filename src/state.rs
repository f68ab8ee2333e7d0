//! State Store: latest-known payload per subsystem
//!
//! The set of sections is fixed at construction. Updates replace a whole
//! section; snapshots deep-copy every section under the same lock so readers
//! never observe a half-applied update.

use std::collections::BTreeMap;
use std::str::FromStr;
use std::sync::Arc;

use serde_json::{json, Value};
use thiserror::Error;
use tokio::sync::RwLock;

use crate::clock::Clock;
use crate::types::StatusSnapshot;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum StateError {
    #[error("Unknown state section: {0}")]
    UnknownSection(String),
}

/// Named state slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Section {
    System,
    Power,
    Rf,
    RemoteId,
    Vrx,
    Video,
    Services,
    Network,
    Audio,
    Contacts,
    Replay,
}

impl Section {
    pub const ALL: [Section; 11] = [
        Section::System,
        Section::Power,
        Section::Rf,
        Section::RemoteId,
        Section::Vrx,
        Section::Video,
        Section::Services,
        Section::Network,
        Section::Audio,
        Section::Contacts,
        Section::Replay,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Section::System => "system",
            Section::Power => "power",
            Section::Rf => "rf",
            Section::RemoteId => "remote_id",
            Section::Vrx => "vrx",
            Section::Video => "video",
            Section::Services => "services",
            Section::Network => "network",
            Section::Audio => "audio",
            Section::Contacts => "contacts",
            Section::Replay => "replay",
        }
    }

    /// Payload a section holds before any subsystem reports.
    fn initial(self) -> Value {
        match self {
            Section::Services | Section::Contacts => json!([]),
            Section::Replay => json!({"active": false, "source": "none"}),
            _ => json!({}),
        }
    }
}

impl FromStr for Section {
    type Err = StateError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Section::ALL
            .into_iter()
            .find(|section| section.as_str() == s)
            .ok_or_else(|| StateError::UnknownSection(s.to_string()))
    }
}

impl std::fmt::Display for Section {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Shared container of every state section.
pub struct StateStore {
    sections: RwLock<BTreeMap<Section, Value>>,
    clock: Arc<dyn Clock>,
}

impl StateStore {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        let sections = Section::ALL
            .into_iter()
            .map(|section| (section, section.initial()))
            .collect();
        Self {
            sections: RwLock::new(sections),
            clock,
        }
    }

    /// Replace a section by name.
    pub async fn update_section(&self, name: &str, payload: Value) -> Result<(), StateError> {
        let section = name.parse::<Section>()?;
        self.update(section, payload).await;
        Ok(())
    }

    /// Replace a section.
    pub async fn update(&self, section: Section, payload: Value) {
        self.sections.write().await.insert(section, payload);
    }

    /// Deep copy of a single section.
    pub async fn section(&self, section: Section) -> Value {
        self.sections
            .read()
            .await
            .get(&section)
            .cloned()
            .unwrap_or_else(|| section.initial())
    }

    /// Deep copy of every section, stamped with the current time.
    pub async fn snapshot(&self) -> StatusSnapshot {
        let (timestamp_ms, mut sections) = {
            let guard = self.sections.read().await;
            (self.clock.now_ms(), guard.clone())
        };
        let mut take = |section: Section| {
            sections
                .remove(&section)
                .unwrap_or_else(|| section.initial())
        };
        StatusSnapshot {
            timestamp_ms,
            system: take(Section::System),
            power: take(Section::Power),
            rf: take(Section::Rf),
            remote_id: take(Section::RemoteId),
            vrx: take(Section::Vrx),
            video: take(Section::Video),
            services: take(Section::Services),
            network: take(Section::Network),
            audio: take(Section::Audio),
            contacts: take(Section::Contacts),
            replay: take(Section::Replay),
        }
    }
}
