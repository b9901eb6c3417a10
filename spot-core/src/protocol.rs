//! SpotMe wire protocol: operation tags, request/response envelopes, status vocabularies.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

/// Parking space identifier. Unique across the server's lots.
pub type SpotId = u32;

/// Parking lot identifier (e.g. "P6").
pub type LotId = String;

/// Operation tag carried in every envelope. Known tags are interpreted by the core;
/// anything else is passed through untouched for UI collaborators (accounts, permits, schedules).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum OpTag {
    QuerySpot,
    ReserveSpot,
    ReleaseSpot,
    RefreshData,
    UpdateSpot,
    Other(String),
}

impl OpTag {
    pub fn as_str(&self) -> &str {
        match self {
            OpTag::QuerySpot => "QuerySpot",
            OpTag::ReserveSpot => "ReserveSpot",
            OpTag::ReleaseSpot => "ReleaseSpot",
            OpTag::RefreshData => "RefreshData",
            OpTag::UpdateSpot => "UpdateSpot",
            OpTag::Other(s) => s,
        }
    }
}

impl From<String> for OpTag {
    fn from(s: String) -> Self {
        match s.as_str() {
            "QuerySpot" => OpTag::QuerySpot,
            "ReserveSpot" => OpTag::ReserveSpot,
            "ReleaseSpot" => OpTag::ReleaseSpot,
            "RefreshData" => OpTag::RefreshData,
            "UpdateSpot" => OpTag::UpdateSpot,
            _ => OpTag::Other(s),
        }
    }
}

impl From<&str> for OpTag {
    fn from(s: &str) -> Self {
        OpTag::from(s.to_string())
    }
}

impl From<OpTag> for String {
    fn from(op: OpTag) -> Self {
        match op {
            OpTag::Other(s) => s,
            known => known.as_str().to_string(),
        }
    }
}

impl fmt::Display for OpTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outbound envelope: `{"id": n, "op": tag, ...fields}`.
/// `id` is the correlation key; `op` only routes the payload on the server.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Request {
    pub id: u64,
    pub op: OpTag,
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

impl Request {
    /// Build a request from an arbitrary body. Object bodies are flattened into the envelope
    /// (their own `id`/`op` keys are dropped); scalars and arrays travel under `body`.
    pub fn new(id: u64, op: OpTag, body: Value) -> Self {
        let fields = match body {
            Value::Object(mut map) => {
                map.remove("id");
                map.remove("op");
                map
            }
            Value::Null => Map::new(),
            other => {
                let mut map = Map::new();
                map.insert("body".to_string(), other);
                map
            }
        };
        Self { id, op, fields }
    }
}

/// Inbound envelope. `id` and `op` are optional so that responses from older servers
/// (which only echo a status) can still be routed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Response {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub op: Option<OpTag>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

impl Response {
    /// Convenience constructor used by hosts and simulators.
    pub fn new(id: Option<u64>, op: OpTag, status: Option<&str>) -> Self {
        Self {
            id,
            op: Some(op),
            status: status.map(str::to_string),
            fields: Map::new(),
        }
    }

    pub fn with_field(mut self, key: &str, value: Value) -> Self {
        self.fields.insert(key.to_string(), value);
        self
    }

    fn status_str(&self, op: OpTag) -> Result<&str, ProtocolError> {
        self.status
            .as_deref()
            .ok_or(ProtocolError::MissingStatus { op })
    }

    pub fn query_outcome(&self) -> Result<QueryOutcome, ProtocolError> {
        self.status_str(OpTag::QuerySpot).map(QueryOutcome::parse)
    }

    pub fn reserve_outcome(&self) -> Result<ReserveOutcome, ProtocolError> {
        self.status_str(OpTag::ReserveSpot).map(ReserveOutcome::parse)
    }

    /// Extract the lot snapshot list of a RefreshData response.
    /// `data` may be the nested structure itself or a JSON-encoded string of it.
    pub fn refresh_payload(&self) -> Result<Vec<LotSnapshot>, ProtocolError> {
        let data = self.fields.get("data").ok_or(ProtocolError::MissingData)?;
        let lots = match data {
            Value::String(encoded) => serde_json::from_str(encoded)?,
            other => serde_json::from_value(other.clone())?,
        };
        Ok(lots)
    }
}

/// Occupancy status of a single space.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SpotStatus {
    Available,
    Occupied,
    Reserved,
}

impl SpotStatus {
    /// Numeric code used in snapshots: 0 = free, 1 = occupied, 2 = reserved.
    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(SpotStatus::Available),
            1 => Some(SpotStatus::Occupied),
            2 => Some(SpotStatus::Reserved),
            _ => None,
        }
    }

    pub fn code(self) -> u8 {
        match self {
            SpotStatus::Available => 0,
            SpotStatus::Occupied => 1,
            SpotStatus::Reserved => 2,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            SpotStatus::Available => "available",
            SpotStatus::Occupied => "occupied",
            SpotStatus::Reserved => "reserved",
        }
    }
}

/// Answer to QuerySpot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueryOutcome {
    Available,
    Occupied,
    Reserved,
    Unrecognized(String),
}

impl QueryOutcome {
    pub fn parse(status: &str) -> Self {
        match status {
            "available" => QueryOutcome::Available,
            "occupied" => QueryOutcome::Occupied,
            "reserved" => QueryOutcome::Reserved,
            other => QueryOutcome::Unrecognized(other.to_string()),
        }
    }
}

/// Answer to ReserveSpot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReserveOutcome {
    Reserved,
    Prereserved,
    Preoccupied,
    Taken,
    TimeLimitReached,
    Unrecognized(String),
}

impl ReserveOutcome {
    pub fn parse(status: &str) -> Self {
        match status {
            "reserved" => ReserveOutcome::Reserved,
            "prereserved" => ReserveOutcome::Prereserved,
            "preoccupied" => ReserveOutcome::Preoccupied,
            "taken" => ReserveOutcome::Taken,
            "time_limit_reached" => ReserveOutcome::TimeLimitReached,
            other => ReserveOutcome::Unrecognized(other.to_string()),
        }
    }
}

/// Map vertex as sent by the server.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Coordinate {
    pub latitude: f64,
    pub longitude: f64,
}

/// One space inside a RefreshData lot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpotSnapshot {
    #[serde(alias = "space_id")]
    pub id: SpotId,
    #[serde(default)]
    pub block: Option<u32>,
    #[serde(default)]
    pub status: u8,
    #[serde(default)]
    pub coordinates: Vec<Coordinate>,
}

/// One lot inside a RefreshData payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LotSnapshot {
    pub lot_id: LotId,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub congestion_percent: Option<f64>,
    #[serde(default)]
    pub spaces: Vec<SpotSnapshot>,
}

pub fn query_spot_body(spot_id: SpotId) -> Value {
    json!({ "spot_id": spot_id })
}

pub fn reserve_spot_body(spot_id: SpotId, window_secs: u64) -> Value {
    json!({ "spot_id": spot_id, "window_secs": window_secs })
}

pub fn release_spot_body(spot_id: SpotId) -> Value {
    json!({ "spot_id": spot_id })
}

pub fn update_spot_body(spot_id: SpotId, status: SpotStatus) -> Value {
    json!({ "spot_id": spot_id, "status": status.code() })
}

/// Response is well-formed JSON but does not carry what its operation needs.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("{op} response has no status")]
    MissingStatus { op: OpTag },
    #[error("RefreshData response has no data")]
    MissingData,
    #[error("invalid payload: {0}")]
    InvalidData(#[from] serde_json::Error),
}
