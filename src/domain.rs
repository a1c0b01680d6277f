//! ==============================================================================
//! domain.rs - canonical telemetry types
//! ==============================================================================
//!
//! purpose:
//!     the vocabulary every other module speaks: measurement kinds, profile ids,
//!     the raw device item, the normalized reading and the per-reading outcome
//!     of a batch.
//!
//! relationships:
//!     - built by: normalize.rs (RawItem -> Reading)
//!     - stored by: store.rs
//!     - forwarded by: forward.rs
//!     - aggregated by: pipeline.rs (ForwardOutcome, BatchResult)
//!
//! ==============================================================================

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{ForwardError, NormalizeError};
use crate::forward::Delivery;
use crate::profile::SensorProfile;

/// a physical quantity a field sensor can report
///
/// declaration order is the canonical ordering of measurements inside a
/// reading and therefore inside outbound envelopes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MeasurementKind {
    Temperature,
    Pressure,
    Humidity,
    Sound,
    AirQuality,
}

impl MeasurementKind {
    pub const ALL: [MeasurementKind; 5] = [
        MeasurementKind::Temperature,
        MeasurementKind::Pressure,
        MeasurementKind::Humidity,
        MeasurementKind::Sound,
        MeasurementKind::AirQuality,
    ];

    /// canonical name used for storage, config keys and api output
    pub fn name(self) -> &'static str {
        match self {
            MeasurementKind::Temperature => "temperature",
            MeasurementKind::Pressure => "pressure",
            MeasurementKind::Humidity => "humidity",
            MeasurementKind::Sound => "sound",
            MeasurementKind::AirQuality => "airquality",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|k| k.name() == name)
    }
}

impl fmt::Display for MeasurementKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// identifies one physical sensor type (and its wire encoding)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProfileId {
    /// sph0645 microphone
    Sound,
    /// bmp280/bme280 temperature, pressure, humidity
    Environmental,
    /// particulate matter sensor
    Dust,
}

impl ProfileId {
    pub const ALL: [ProfileId; 3] = [ProfileId::Sound, ProfileId::Environmental, ProfileId::Dust];

    pub fn as_str(self) -> &'static str {
        match self {
            ProfileId::Sound => "sound",
            ProfileId::Environmental => "environmental",
            ProfileId::Dust => "dust",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|p| p.as_str() == name)
    }
}

impl fmt::Display for ProfileId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ==============================================================================
// raw device input
// ==============================================================================

/// one untyped measurement object exactly as a device submitted it
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RawItem {
    fields: Map<String, Value>,
}

impl RawItem {
    pub fn new(fields: Map<String, Value>) -> Self {
        Self { fields }
    }

    /// returns `None` when the value is not a json object
    pub fn from_value(value: Value) -> Option<Self> {
        match value {
            Value::Object(fields) => Some(Self { fields }),
            _ => None,
        }
    }

    pub fn get(&self, field: &str) -> Option<&Value> {
        self.fields.get(field)
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }
}

// ==============================================================================
// canonical reading
// ==============================================================================

/// a normalized set of measurements from one sensor profile
///
/// fields are private: a reading is checked against its profile once, in
/// [`Reading::new`], and never changes afterwards.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Reading {
    sensor_id: String,
    profile: ProfileId,
    measurements: BTreeMap<MeasurementKind, f64>,
    captured_at: DateTime<Utc>,
}

impl Reading {
    /// build a reading, rejecting empty measurement sets and kinds the
    /// profile does not accept
    pub fn new(
        sensor_id: impl Into<String>,
        profile: &SensorProfile,
        measurements: BTreeMap<MeasurementKind, f64>,
        captured_at: DateTime<Utc>,
    ) -> Result<Self, NormalizeError> {
        if measurements.is_empty() {
            return Err(NormalizeError::EmptyReading(profile.id));
        }
        if let Some(kind) = measurements.keys().find(|k| !profile.accepts(**k)) {
            return Err(NormalizeError::OutsideProfile {
                kind: *kind,
                profile: profile.id,
            });
        }
        Ok(Self {
            sensor_id: sensor_id.into(),
            profile: profile.id,
            measurements,
            captured_at,
        })
    }

    pub fn sensor_id(&self) -> &str {
        &self.sensor_id
    }

    pub fn profile(&self) -> ProfileId {
        self.profile
    }

    /// measurements in canonical kind order
    pub fn measurements(&self) -> impl Iterator<Item = (MeasurementKind, f64)> + '_ {
        self.measurements.iter().map(|(k, v)| (*k, *v))
    }

    pub fn get(&self, kind: MeasurementKind) -> Option<f64> {
        self.measurements.get(&kind).copied()
    }

    pub fn len(&self) -> usize {
        self.measurements.len()
    }

    pub fn captured_at(&self) -> DateTime<Utc> {
        self.captured_at
    }
}

/// row id handed back by the store
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PersistedId(pub i64);

impl fmt::Display for PersistedId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// a reading as read back from the store
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StoredReading {
    pub id: PersistedId,
    #[serde(flatten)]
    pub reading: Reading,
}

// ==============================================================================
// outcomes
// ==============================================================================

/// what happened to a reading after normalization
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ForwardStatus {
    /// persisted and accepted by the aggregation service
    Delivered,
    /// persisted, forwarding disabled
    Skipped,
    /// persisted, aggregation service answered with a non-success status
    Rejected,
    /// persisted, aggregation service could not be reached
    Unreachable,
    /// persisted, the push failed locally before any upstream contact
    Failed,
    /// the store refused the reading; it was never forwarded
    NotPersisted,
}

/// per-reading result of a batch
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ForwardOutcome {
    pub reading: Reading,
    pub persisted_id: Option<PersistedId>,
    pub status: ForwardStatus,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub http_status: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_detail: Option<String>,
}

impl ForwardOutcome {
    /// fold the forwarder's answer for an already persisted reading
    pub fn forwarded(
        reading: Reading,
        id: PersistedId,
        result: Result<Delivery, ForwardError>,
    ) -> Self {
        let (status, http_status, error_detail) = match result {
            Ok(Delivery::Accepted { status }) => (ForwardStatus::Delivered, Some(status), None),
            Ok(Delivery::Skipped) => (ForwardStatus::Skipped, None, None),
            Err(ForwardError::Rejected { status, body }) => {
                (ForwardStatus::Rejected, Some(status), Some(body))
            }
            Err(ForwardError::Unreachable { detail }) => (ForwardStatus::Unreachable, None, Some(detail)),
            Err(e @ ForwardError::Request { .. }) | Err(e @ ForwardError::UnknownProfile(_)) => {
                (ForwardStatus::Failed, None, Some(e.to_string()))
            }
        };
        Self {
            reading,
            persisted_id: Some(id),
            success: matches!(status, ForwardStatus::Delivered | ForwardStatus::Skipped),
            status,
            http_status,
            error_detail,
        }
    }

    pub fn not_persisted(reading: Reading, detail: String) -> Self {
        Self {
            reading,
            persisted_id: None,
            status: ForwardStatus::NotPersisted,
            success: false,
            http_status: None,
            error_detail: Some(detail),
        }
    }

    pub fn is_persisted(&self) -> bool {
        self.persisted_id.is_some()
    }
}

/// aggregate result of one ingest request
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BatchResult {
    /// readings persisted
    pub processed_count: usize,
    pub outcomes: Vec<ForwardOutcome>,
    /// the request was dropped before every reading ran
    pub cancelled: bool,
}

impl BatchResult {
    pub fn forward_failures(&self) -> usize {
        self.outcomes.iter().filter(|o| !o.success).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::profile::ProfileRegistry;

    fn env_reading() -> Reading {
        let registry = ProfileRegistry::builtin();
        let profile = registry.get(ProfileId::Environmental).unwrap();
        let measurements = BTreeMap::from([
            (MeasurementKind::Humidity, 40.0),
            (MeasurementKind::Temperature, 21.5),
        ]);
        Reading::new("022222", profile, measurements, Utc::now()).unwrap()
    }

    #[test]
    fn measurement_names_round_trip() {
        for kind in MeasurementKind::ALL {
            assert_eq!(MeasurementKind::from_name(kind.name()), Some(kind));
        }
        assert_eq!(MeasurementKind::from_name("noise"), None);
    }

    #[test]
    fn measurements_iterate_in_kind_order() {
        let kinds: Vec<_> = env_reading().measurements().map(|(k, _)| k).collect();
        assert_eq!(kinds, vec![MeasurementKind::Temperature, MeasurementKind::Humidity]);
    }

    #[test]
    fn reading_rejects_foreign_kind() {
        let registry = ProfileRegistry::builtin();
        let dust = registry.get(ProfileId::Dust).unwrap();
        let err = Reading::new(
            "033333",
            dust,
            BTreeMap::from([(MeasurementKind::Sound, 50.0)]),
            Utc::now(),
        )
        .unwrap_err();
        assert!(matches!(
            err,
            NormalizeError::OutsideProfile { kind: MeasurementKind::Sound, profile: ProfileId::Dust }
        ));
    }

    #[test]
    fn reading_rejects_empty_measurements() {
        let registry = ProfileRegistry::builtin();
        let sound = registry.get(ProfileId::Sound).unwrap();
        let err = Reading::new("011111", sound, BTreeMap::new(), Utc::now()).unwrap_err();
        assert!(matches!(err, NormalizeError::EmptyReading(ProfileId::Sound)));
    }

    #[test]
    fn outcome_classification() {
        let ok = ForwardOutcome::forwarded(
            env_reading(),
            PersistedId(1),
            Ok(Delivery::Accepted { status: 201 }),
        );
        assert!(ok.success);
        assert_eq!(ok.status, ForwardStatus::Delivered);
        assert_eq!(ok.http_status, Some(201));

        let rejected = ForwardOutcome::forwarded(
            env_reading(),
            PersistedId(2),
            Err(ForwardError::Rejected { status: 400, body: "bad sensor".into() }),
        );
        assert!(!rejected.success);
        assert!(rejected.is_persisted());
        assert_eq!(rejected.status, ForwardStatus::Rejected);
        assert_eq!(rejected.error_detail.as_deref(), Some("bad sensor"));

        let down = ForwardOutcome::forwarded(
            env_reading(),
            PersistedId(3),
            Err(ForwardError::Unreachable { detail: "connection refused".into() }),
        );
        assert_eq!(down.status, ForwardStatus::Unreachable);
        assert_eq!(down.http_status, None);
        assert!(!down.success);

        let unregistered = ForwardOutcome::forwarded(
            env_reading(),
            PersistedId(4),
            Err(ForwardError::UnknownProfile(ProfileId::Dust)),
        );
        assert_eq!(unregistered.status, ForwardStatus::Failed);
        assert!(unregistered.error_detail.unwrap().contains("dust"));

        let unbuildable = ForwardOutcome::forwarded(
            env_reading(),
            PersistedId(5),
            Err(ForwardError::Request { detail: "failed to parse header value".into() }),
        );
        assert_eq!(unbuildable.status, ForwardStatus::Failed);
        assert!(!unbuildable.success);
    }

    #[test]
    fn stored_reading_serializes_flat() {
        let stored = StoredReading { id: PersistedId(7), reading: env_reading() };
        let json = serde_json::to_value(&stored).unwrap();
        assert_eq!(json["id"], 7);
        assert_eq!(json["profile"], "environmental");
        assert_eq!(json["measurements"]["temperature"], 21.5);
    }
}
