//! ==============================================================================
//! normalize.rs - raw device item -> canonical readings
//! ==============================================================================
//!
//! purpose:
//!     devices from different firmware generations name the same quantity
//!     differently (`temp` vs `temperature`, `sound` vs `soundLevel`). this
//!     module owns the single alias table and fans one raw item out into one
//!     reading per sensor profile present in it.
//!
//! alias precedence:
//!     when several aliases of one kind are present the longest name wins,
//!     ties broken by table order. `null` counts as absent, so a null long
//!     alias falls through to a shorter one.
//!
//! sensor ids:
//!     `SensorIdMode::Fixed`  - every reading gets its profile's default id
//!     `SensorIdMode::Caller` - the item's `sensor_id` is required and shared
//!                              by every reading built from that item
//!
//! ==============================================================================

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::Value;

use crate::domain::{MeasurementKind, RawItem, Reading};
use crate::error::{NormalizeError, UnknownSensorProfile};
use crate::profile::ProfileRegistry;

/// recognized field names per kind, longest (preferred) first
const ALIASES: &[(MeasurementKind, &[&str])] = &[
    (MeasurementKind::Temperature, &["temperature", "temp"]),
    (MeasurementKind::Pressure, &["pressure", "press"]),
    (MeasurementKind::Humidity, &["humidity", "hum"]),
    (MeasurementKind::Sound, &["sound_level", "soundLevel", "sound"]),
    (MeasurementKind::AirQuality, &["air_quality", "airquality", "airQuality"]),
];

const SENSOR_ID_FIELDS: &[&str] = &["sensor_id", "sensorId"];

/// where reading sensor ids come from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SensorIdMode {
    /// fixed id per sensor type
    #[default]
    Fixed,
    /// one caller-supplied id shared across profiles
    Caller,
}

#[derive(Debug, Clone)]
pub struct Normalizer {
    registry: Arc<ProfileRegistry>,
    mode: SensorIdMode,
}

impl Normalizer {
    pub fn new(registry: Arc<ProfileRegistry>, mode: SensorIdMode) -> Self {
        Self { registry, mode }
    }

    pub fn registry(&self) -> &ProfileRegistry {
        &self.registry
    }

    pub fn mode(&self) -> SensorIdMode {
        self.mode
    }

    pub fn normalize(&self, item: &RawItem) -> Result<Vec<Reading>, NormalizeError> {
        self.normalize_at(item, Utc::now())
    }

    /// normalize with an explicit capture time
    pub fn normalize_at(
        &self,
        item: &RawItem,
        captured_at: DateTime<Utc>,
    ) -> Result<Vec<Reading>, NormalizeError> {
        let resolved = resolve_aliases(item)?;
        if resolved.is_empty() {
            return Ok(Vec::new());
        }

        if let Some(orphan) = resolved
            .keys()
            .find(|k| self.registry.profile_for_kind(**k).is_none())
        {
            return Err(UnknownSensorProfile { kinds: vec![*orphan] }.into());
        }

        let caller_id = match self.mode {
            SensorIdMode::Fixed => None,
            SensorIdMode::Caller => Some(sensor_id(item)?.ok_or(NormalizeError::MissingSensorId)?),
        };

        let mut readings = Vec::new();
        for candidate in self.registry.iter() {
            let partition: BTreeMap<MeasurementKind, f64> = resolved
                .iter()
                .filter(|(kind, _)| candidate.accepts(**kind))
                .map(|(kind, value)| (*kind, *value))
                .collect();
            if partition.is_empty() {
                continue;
            }

            let kinds: BTreeSet<MeasurementKind> = partition.keys().copied().collect();
            let profile = self.registry.resolve_profile(&kinds)?;
            let id = caller_id
                .clone()
                .unwrap_or_else(|| profile.default_sensor_id.clone());
            readings.push(Reading::new(id, profile, partition, captured_at)?);
        }

        Ok(readings)
    }
}

/// pick one value per kind according to the alias precedence
pub fn resolve_aliases(item: &RawItem) -> Result<BTreeMap<MeasurementKind, f64>, NormalizeError> {
    let mut resolved = BTreeMap::new();
    for (kind, aliases) in ALIASES {
        for alias in *aliases {
            let Some(raw) = item.get(alias) else { continue };
            if let Some(value) = numeric(alias, raw)? {
                resolved.insert(*kind, value);
                break;
            }
        }
    }
    Ok(resolved)
}

/// the alias a field name maps to, if any
pub fn kind_for_field(field: &str) -> Option<MeasurementKind> {
    ALIASES
        .iter()
        .find(|(_, aliases)| aliases.contains(&field))
        .map(|(kind, _)| *kind)
}

fn numeric(field: &str, raw: &Value) -> Result<Option<f64>, NormalizeError> {
    let parsed = match raw {
        Value::Null => return Ok(None),
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    };
    match parsed {
        Some(v) if v.is_finite() => Ok(Some(v)),
        _ => Err(NormalizeError::InvalidValue {
            field: field.to_string(),
            value: raw.to_string(),
        }),
    }
}

fn sensor_id(item: &RawItem) -> Result<Option<String>, NormalizeError> {
    for field in SENSOR_ID_FIELDS {
        match item.get(field) {
            None | Some(Value::Null) => continue,
            Some(Value::String(s)) if s.trim().is_empty() => continue,
            Some(Value::String(s)) => return header_safe(s.trim()).map(Some),
            Some(Value::Number(n)) => return Ok(Some(n.to_string())),
            Some(other) => {
                return Err(NormalizeError::InvalidValue {
                    field: field.to_string(),
                    value: other.to_string(),
                })
            }
        }
    }
    Ok(None)
}

/// ids travel as header values, so only visible ascii and inner spaces pass
fn header_safe(id: &str) -> Result<String, NormalizeError> {
    if id.chars().all(|c| c == ' ' || c.is_ascii_graphic()) {
        Ok(id.to_string())
    } else {
        Err(NormalizeError::InvalidSensorId { value: id.to_string() })
    }
}
