use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::tracker::TrackId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Dwell,
    ZoneEntry,
    ZoneExit,
    Proximity,
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            EventKind::Dwell => "dwell",
            EventKind::ZoneEntry => "zone_entry",
            EventKind::ZoneExit => "zone_exit",
            EventKind::Proximity => "proximity",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Info,
    Warning,
    Critical,
}

/// Discrete, immutable event emitted by the state machine.
///
/// Field names are part of the telemetry contract.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub frame: u64,
    #[serde(rename = "type")]
    pub kind: EventKind,
    pub object_id: TrackId,
    pub details: BTreeMap<String, Value>,
    pub severity: Severity,
}

impl Event {
    pub(crate) fn new(frame: u64, kind: EventKind, object_id: TrackId, severity: Severity) -> Self {
        Self {
            frame,
            kind,
            object_id,
            details: BTreeMap::new(),
            severity,
        }
    }

    pub(crate) fn detail(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.details.insert(key.to_string(), value.into());
        self
    }

    /// Zone name carried in the details, for zone-scoped events.
    pub fn zone(&self) -> Option<&str> {
        self.details.get("zone").and_then(Value::as_str)
    }
}
