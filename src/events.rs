//! Wire events of the real-time channel.
//!
//! The channel pushes five event kinds: `incidents:new`, `incidents:update`,
//! `incident:update`, `units:update` and `geo:update`. Payloads are normalized
//! here into one tagged union; nothing past this boundary handles a raw or
//! historical shape. Malformed events (no id) are dropped with a log line, as
//! the views treat the next snapshot as authoritative anyway.

use chrono::{DateTime, Utc};
use log::{debug, warn};
use serde::{Deserialize, Serialize};

use crate::types::{IncidentStatus, Location, UnitStatus};

pub const INCIDENTS_NEW: &str = "incidents:new";
pub const INCIDENTS_UPDATE: &str = "incidents:update";
pub const INCIDENT_UPDATE: &str = "incident:update";
pub const UNITS_UPDATE: &str = "units:update";
pub const GEO_UPDATE: &str = "geo:update";

/// A normalized server-pushed event
#[derive(Clone, Debug, PartialEq)]
pub enum OpsEvent {
    IncidentNew(IncidentCreated),
    IncidentPatched(IncidentPatched),
    UnitPatched(UnitPatched),
    /// Raw geo telemetry; untyped upstream, surfaced as-is
    Geo(serde_json::Value),
}

/// Payload of `incidents:new`
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct IncidentCreated {
    pub id: String,
    pub lat: f64,
    pub lng: f64,
    pub created_at: DateTime<Utc>,
    #[serde(default = "default_new_status")]
    pub status: IncidentStatus,
    #[serde(default)]
    pub priority: Option<u8>,
    #[serde(default)]
    pub seq: Option<u64>,
}

fn default_new_status() -> IncidentStatus {
    IncidentStatus::New
}

/// Payload of `incidents:update` / `incident:update`
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct IncidentPatched {
    pub id: String,
    pub patch: IncidentPatch,
    #[serde(default)]
    pub seq: Option<u64>,
}

/// Partial update: only the present fields overwrite
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
pub struct IncidentPatch {
    #[serde(default)]
    pub status: Option<IncidentStatus>,
    #[serde(default)]
    pub location: Option<Location>,
    #[serde(default)]
    pub assignment: Option<serde_json::Value>,
    #[serde(default)]
    pub event: Option<serde_json::Value>,
}

/// Payload of `units:update`, already flat on the wire
#[derive(Clone, Debug, PartialEq)]
pub struct UnitPatched {
    pub id: i64,
    pub status: Option<UnitStatus>,
    pub lat: Option<f64>,
    pub lng: Option<f64>,
    pub last_seen: Option<DateTime<Utc>>,
    pub seq: Option<u64>,
}

// Raw wire shape of units:update; status arrives in whichever historical
// casing the emitting code path still uses
#[derive(Deserialize)]
struct UnitPatchedWire {
    id: i64,
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    lat: Option<f64>,
    #[serde(default)]
    lng: Option<f64>,
    #[serde(default)]
    last_seen: Option<DateTime<Utc>>,
    #[serde(default)]
    seq: Option<u64>,
}

impl OpsEvent {
    /// Parse a named event payload into the canonical union.
    ///
    /// Returns `None` for unknown event names and for malformed payloads;
    /// both are dropped, never an error.
    pub fn parse(name: &str, payload: serde_json::Value) -> Option<Self> {
        match name {
            INCIDENTS_NEW => match serde_json::from_value::<IncidentCreated>(payload) {
                Ok(created) => Some(Self::IncidentNew(created)),
                Err(e) => {
                    warn!("dropping malformed {INCIDENTS_NEW} event: {e}");
                    None
                }
            },
            INCIDENTS_UPDATE | INCIDENT_UPDATE => {
                match serde_json::from_value::<IncidentPatched>(payload) {
                    Ok(patched) => Some(Self::IncidentPatched(patched)),
                    Err(e) => {
                        warn!("dropping malformed {name} event: {e}");
                        None
                    }
                }
            }
            UNITS_UPDATE => match serde_json::from_value::<UnitPatchedWire>(payload) {
                Ok(wire) => {
                    let status = wire.status.as_deref().and_then(|raw| {
                        let normalized = UnitStatus::normalize(raw);
                        if normalized.is_none() {
                            warn!("ignoring unknown unit status in {UNITS_UPDATE} event: {raw}");
                        }
                        normalized
                    });
                    Some(Self::UnitPatched(UnitPatched {
                        id: wire.id,
                        status,
                        lat: wire.lat,
                        lng: wire.lng,
                        last_seen: wire.last_seen,
                        seq: wire.seq,
                    }))
                }
                Err(e) => {
                    warn!("dropping malformed {UNITS_UPDATE} event: {e}");
                    None
                }
            },
            GEO_UPDATE => Some(Self::Geo(payload)),
            other => {
                debug!("ignoring unknown event: {other}");
                None
            }
        }
    }
}

/// Acknowledgement of a subscribe request
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct SubscribeAck {
    pub ok: bool,
    #[serde(default)]
    pub error: Option<String>,
}
