use std::sync::{Arc, PoisonError, RwLock};
use std::time::SystemTime;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum TimelineKind {
    HeartRate,
    Spo2,
    Battery,
    Connection,
    Raw,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimelineEvent {
    pub id: Uuid,
    pub timestamp: SystemTime,
    pub kind: TimelineKind,
    pub metadata: IndexMap<String, String>,
}

impl TimelineEvent {
    pub fn new<const N: usize>(kind: TimelineKind, metadata: [(&str, String); N]) -> Self {
        TimelineEvent {
            id: Uuid::new_v4(),
            timestamp: SystemTime::now(),
            kind,
            metadata: metadata.into_iter().map(|(key, value)| (key.to_string(), value)).collect(),
        }
    }

    pub fn heart_rate(bpm: u8) -> Self {
        Self::new(TimelineKind::HeartRate, [("bpm", bpm.to_string()), ("source", "ring".to_string())])
    }

    pub fn spo2(percent: u8) -> Self {
        Self::new(TimelineKind::Spo2, [("spo2", percent.to_string())])
    }

    pub fn battery(level: u8, charging: bool) -> Self {
        Self::new(TimelineKind::Battery, [("level", level.to_string()), ("charging", charging.to_string())])
    }

    pub fn connection(state: &str) -> Self {
        Self::new(TimelineKind::Connection, [("state", state.to_string())])
    }

    pub fn raw_packet(bytes: &[u8]) -> Self {
        let packet = bytes.iter().map(|b| format!("{:02x}", b)).collect::<Vec<_>>().join(" ");
        Self::new(TimelineKind::Raw, [("packet", packet)])
    }

    pub fn raw_reading(reading: &str, value: u8) -> Self {
        Self::new(TimelineKind::Raw, [("reading", reading.to_string()), ("value", value.to_string())])
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.metadata.get(key).map(String::as_str)
    }
}

/// Append-only, insertion ordered log of everything observed from the ring.
///
/// Cloning shares the same log. It is never trimmed.
#[derive(Debug, Clone, Default)]
pub struct Timeline {
    events: Arc<RwLock<Vec<TimelineEvent>>>,
}

impl Timeline {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn append(&self, event: TimelineEvent) {
        let mut events = self.events.write().unwrap_or_else(PoisonError::into_inner);
        events.push(event);
    }

    pub fn snapshot(&self) -> Vec<TimelineEvent> {
        self.events.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn len(&self) -> usize {
        self.events.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn count(&self, kind: TimelineKind) -> usize {
        self.events
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|event| event.kind == kind)
            .count()
    }
}
