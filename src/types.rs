//! Canonical domain model of the ops console.
//!
//! The backend's wire shapes drifted over time (uppercase vs lowercase unit
//! status tokens, bare arrays vs paginated envelopes, several field spellings
//! for coordinates). Everything entering the crate is normalized here into
//! exactly one shape; the rest of the code never sees a historical variant.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use std::fmt;

/// Incident lifecycle status, canonical SCREAMING_SNAKE representation
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum IncidentStatus {
    New,
    // Historical feeds used RECOGNIZED (and a Spanish spelling) for ACK
    #[serde(alias = "RECOGNIZED", alias = "RECONOCIDO")]
    Ack,
    Dispatched,
    InProgress,
    Closed,
    Canceled,
}

impl IncidentStatus {
    /// Statuses shown on the live map and in the active queue
    pub fn is_active(self) -> bool {
        matches!(
            self,
            Self::New | Self::Ack | Self::Dispatched | Self::InProgress
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::New => "NEW",
            Self::Ack => "ACK",
            Self::Dispatched => "DISPATCHED",
            Self::InProgress => "IN_PROGRESS",
            Self::Closed => "CLOSED",
            Self::Canceled => "CANCELED",
        }
    }
}

impl fmt::Display for IncidentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Unit availability status, canonical lowercase tokens
///
/// These are the tokens the backend accepts for writes. Reads must also
/// tolerate the legacy uppercase enum (`AVAILABLE`, `BUSY`, `OFFLINE`,
/// `MAINTENANCE`) and human labels that older feeds emitted.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum UnitStatus {
    Available,
    EnRoute,
    OnSite,
    OutOfService,
}

impl UnitStatus {
    /// Normalize a historical or human-entered status variant to a canonical
    /// token. Returns `None` for values that are not a unit status at all.
    pub fn normalize(input: &str) -> Option<Self> {
        match input.trim().to_lowercase().as_str() {
            "available" | "disponible" => Some(Self::Available),
            "en_route" | "en ruta" | "en-ruta" | "ruta" | "busy" => Some(Self::EnRoute),
            "on_site" | "en sitio" | "en-sitio" | "sitio" => Some(Self::OnSite),
            "out_of_service" | "fuera de servicio" | "fuera-servicio" | "fuera" | "offline"
            | "maintenance" => Some(Self::OutOfService),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Available => "available",
            Self::EnRoute => "en_route",
            Self::OnSite => "on_site",
            Self::OutOfService => "out_of_service",
        }
    }
}

impl<'de> Deserialize<'de> for UnitStatus {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;
        Self::normalize(&raw)
            .ok_or_else(|| serde::de::Error::custom(format!("unknown unit status: {raw}")))
    }
}

impl fmt::Display for UnitStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum UnitType {
    Patrol,
    Moto,
    Ambulance,
}

/// A last-known position with optional GPS accuracy in meters
#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Serialize)]
pub struct Location {
    pub lat: f64,
    pub lng: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub accuracy: Option<f64>,
}

/// Incident as held by the queue and map views
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct Incident {
    pub id: String,
    pub status: IncidentStatus,
    pub created_at: DateTime<Utc>,
    pub lat: f64,
    pub lng: f64,
    #[serde(default)]
    pub accuracy: Option<f64>,
    #[serde(default)]
    pub priority: Option<u8>,
    #[serde(default)]
    pub battery: Option<u8>,
}

/// A unit-to-incident assignment as reported in the incident detail
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct Assignment {
    pub id: i64,
    pub unit_id: i64,
    #[serde(default)]
    pub unit_name: Option<String>,
    pub by: String,
    pub at: DateTime<Utc>,
    #[serde(default)]
    pub cleared_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub note: Option<String>,
}

impl Assignment {
    pub fn is_active(&self) -> bool {
        self.cleared_at.is_none()
    }
}

/// One entry of the incident timeline (ack, dispatch, note, ...)
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct TimelineEvent {
    pub id: i64,
    #[serde(rename = "type")]
    pub kind: String,
    pub at: DateTime<Utc>,
    #[serde(default)]
    pub by: Option<String>,
    #[serde(default)]
    pub notes: Option<String>,
}

/// Full incident detail as returned by the detail endpoint
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct IncidentDetail {
    pub id: String,
    pub status: IncidentStatus,
    #[serde(default)]
    pub priority: Option<u8>,
    #[serde(default)]
    pub locations: Vec<TrackPoint>,
    #[serde(default, rename = "currentLocation")]
    pub current_location: Option<TrackPoint>,
    #[serde(default)]
    pub assignments: Vec<Assignment>,
    #[serde(default)]
    pub events: Vec<TimelineEvent>,
    pub started_at: DateTime<Utc>,
    #[serde(default)]
    pub ended_at: Option<DateTime<Utc>>,
}

/// A point of the incident's location history
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct TrackPoint {
    pub lat: f64,
    pub lng: f64,
    #[serde(default)]
    pub accuracy: Option<f64>,
    #[serde(default, alias = "created_at")]
    pub at: Option<DateTime<Utc>>,
}

#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct Unit {
    pub id: i64,
    pub name: String,
    #[serde(rename = "type")]
    pub unit_type: UnitType,
    pub status: UnitStatus,
    #[serde(default)]
    pub plate: Option<String>,
    #[serde(default)]
    pub lat: Option<f64>,
    #[serde(default)]
    pub lng: Option<f64>,
    #[serde(default)]
    pub last_seen: Option<DateTime<Utc>>,
}

/// Percentile triple for a response-time metric, seconds
#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Serialize)]
pub struct Percentiles {
    pub p50: f64,
    pub p90: f64,
    pub p95: f64,
}

/// Report KPIs: time-to-respond, time-to-ack, SLA and cancellation rates
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct Kpis {
    pub ttr: Percentiles,
    pub tta: Percentiles,
    pub sla_pct: f64,
    pub cancellations_pct: f64,
}

#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct AuditEntry {
    pub id: i64,
    pub who: String,
    pub action: String,
    pub entity: String,
    pub entity_id: serde_json::Value,
    pub at: DateTime<Utc>,
    #[serde(default)]
    pub ip: Option<String>,
}

#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AccountStatus {
    Active,
    Inactive,
}

#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct AdminUser {
    pub id: i64,
    pub name: String,
    pub email: String,
    pub role: crate::auth::UserRole,
    pub status: AccountStatus,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub last_login: Option<DateTime<Utc>>,
    #[serde(default)]
    pub phone: Option<String>,
}

/// Platform tuning knobs exposed on the settings page
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
pub struct Settings {
    #[serde(default)]
    pub countdown_seconds: Option<u32>,
    #[serde(default)]
    pub ping_interval_seconds: Option<u32>,
    #[serde(default)]
    pub data_retention_days: Option<u32>,
    #[serde(default)]
    pub sla_ack_seconds: Option<u32>,
}

#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SimulationStatus {
    Running,
    Paused,
    Closed,
}

#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct Simulation {
    pub id: String,
    pub status: SimulationStatus,
}
