//! ==============================================================================
//! profile.rs - sensor profile registry
//! ==============================================================================
//!
//! purpose:
//!     static table describing each physical sensor type: which measurements
//!     it carries, what the aggregation service calls them, and how it is
//!     identified upstream (default sensor id, external id, pin code).
//!
//! relationships:
//!     - built by: config.rs (builtin table + relay.toml overrides)
//!     - used by: normalize.rs (partitioning, resolve_profile)
//!     - used by: forward.rs (value type names, headers, endpoint)
//!
//! a new sensor type is a new row in `builtin()`; callers never branch on
//! profile ids.
//!
//! ==============================================================================

use std::collections::{BTreeMap, BTreeSet};

use crate::domain::{MeasurementKind, ProfileId};
use crate::error::{RegistryError, UnknownSensorProfile};

#[derive(Debug, Clone, PartialEq)]
pub struct SensorProfile {
    pub id: ProfileId,
    pub accepted: BTreeSet<MeasurementKind>,
    /// canonical kind -> protocol `value_type`
    pub value_types: BTreeMap<MeasurementKind, String>,
    /// sensor id used when devices do not supply their own
    pub default_sensor_id: String,
    /// id the aggregation service knows this sensor under
    pub external_id: String,
    /// sensor.community pin code (X-Pin header)
    pub pin: u16,
    /// per-profile endpoint template, falls back to the forwarding default
    pub endpoint: Option<String>,
}

impl SensorProfile {
    fn new(id: ProfileId, sensor_id: &str, pin: u16, value_types: &[(MeasurementKind, &str)]) -> Self {
        Self {
            id,
            accepted: value_types.iter().map(|(k, _)| *k).collect(),
            value_types: value_types
                .iter()
                .map(|(k, name)| (*k, name.to_string()))
                .collect(),
            default_sensor_id: sensor_id.to_string(),
            external_id: sensor_id.to_string(),
            pin,
            endpoint: None,
        }
    }

    pub fn accepts(&self, kind: MeasurementKind) -> bool {
        self.accepted.contains(&kind)
    }

    pub fn value_type(&self, kind: MeasurementKind) -> Option<&str> {
        self.value_types.get(&kind).map(String::as_str)
    }
}

/// immutable, process-wide profile table
#[derive(Debug, Clone)]
pub struct ProfileRegistry {
    profiles: Vec<SensorProfile>,
}

impl ProfileRegistry {
    /// validate a table: no duplicate profiles, every kind owned by at most
    /// one profile, every accepted kind has a protocol name
    pub fn new(profiles: Vec<SensorProfile>) -> Result<Self, RegistryError> {
        let mut owners: BTreeMap<MeasurementKind, ProfileId> = BTreeMap::new();
        let mut seen = BTreeSet::new();

        for profile in &profiles {
            if !seen.insert(profile.id) {
                return Err(RegistryError::DuplicateProfile(profile.id));
            }
            for kind in &profile.accepted {
                if let Some(first) = owners.insert(*kind, profile.id) {
                    return Err(RegistryError::OverlappingKind {
                        kind: *kind,
                        first,
                        second: profile.id,
                    });
                }
                if profile.value_type(*kind).is_none() {
                    return Err(RegistryError::MissingValueType {
                        profile: profile.id,
                        kind: *kind,
                    });
                }
            }
        }

        Ok(Self { profiles })
    }

    /// the three sensors of the field deployment
    pub fn builtin() -> Self {
        Self {
            profiles: Self::builtin_profiles(),
        }
    }

    pub fn builtin_profiles() -> Vec<SensorProfile> {
        use MeasurementKind::*;

        vec![
            SensorProfile::new(ProfileId::Sound, "011111", 15, &[(Sound, "sound")]),
            SensorProfile::new(
                ProfileId::Environmental,
                "022222",
                11,
                &[
                    (Temperature, "temperature"),
                    (Pressure, "pressure"),
                    (Humidity, "humidity"),
                ],
            ),
            SensorProfile::new(ProfileId::Dust, "033333", 1, &[(AirQuality, "P1")]),
        ]
    }

    /// the single profile accepting every presented kind
    pub fn resolve_profile(
        &self,
        kinds: &BTreeSet<MeasurementKind>,
    ) -> Result<&SensorProfile, UnknownSensorProfile> {
        if kinds.is_empty() {
            return Err(UnknownSensorProfile { kinds: Vec::new() });
        }
        self.profiles
            .iter()
            .find(|p| kinds.is_subset(&p.accepted))
            .ok_or_else(|| UnknownSensorProfile {
                kinds: kinds.iter().copied().collect(),
            })
    }

    pub fn profile_for_kind(&self, kind: MeasurementKind) -> Option<&SensorProfile> {
        self.profiles.iter().find(|p| p.accepts(kind))
    }

    pub fn get(&self, id: ProfileId) -> Option<&SensorProfile> {
        self.profiles.iter().find(|p| p.id == id)
    }

    /// profiles in table order
    pub fn iter(&self) -> impl Iterator<Item = &SensorProfile> {
        self.profiles.iter()
    }
}

impl Default for ProfileRegistry {
    fn default() -> Self {
        Self::builtin()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use MeasurementKind::*;

    fn set(kinds: &[MeasurementKind]) -> BTreeSet<MeasurementKind> {
        kinds.iter().copied().collect()
    }

    #[test]
    fn builtin_table_is_valid() {
        let registry = ProfileRegistry::new(ProfileRegistry::builtin_profiles()).unwrap();
        assert_eq!(registry.iter().count(), 3);
    }

    #[test]
    fn single_kinds_resolve_to_their_owner() {
        let registry = ProfileRegistry::builtin();
        assert_eq!(registry.resolve_profile(&set(&[AirQuality])).unwrap().id, ProfileId::Dust);
        assert_eq!(registry.resolve_profile(&set(&[Sound])).unwrap().id, ProfileId::Sound);
        for kind in [Temperature, Pressure, Humidity] {
            assert_eq!(
                registry.resolve_profile(&set(&[kind])).unwrap().id,
                ProfileId::Environmental
            );
        }
    }

    #[test]
    fn resolve_is_total_over_every_kind_subset() {
        let registry = ProfileRegistry::builtin();
        let env = set(&[Temperature, Pressure, Humidity]);

        for mask in 0u32..(1 << MeasurementKind::ALL.len()) {
            let kinds: BTreeSet<_> = MeasurementKind::ALL
                .iter()
                .enumerate()
                .filter(|(i, _)| mask & (1 << i) != 0)
                .map(|(_, k)| *k)
                .collect();

            let expected = if kinds.is_empty() {
                None
            } else if kinds.is_subset(&env) {
                Some(ProfileId::Environmental)
            } else if kinds == set(&[Sound]) {
                Some(ProfileId::Sound)
            } else if kinds == set(&[AirQuality]) {
                Some(ProfileId::Dust)
            } else {
                None
            };

            let got = registry.resolve_profile(&kinds).ok().map(|p| p.id);
            assert_eq!(got, expected, "kinds {:?}", kinds);
        }
    }

    #[test]
    fn empty_set_is_unknown() {
        let err = ProfileRegistry::builtin().resolve_profile(&BTreeSet::new()).unwrap_err();
        assert!(err.kinds.is_empty());
    }

    #[test]
    fn overlapping_kind_is_rejected() {
        let mut profiles = ProfileRegistry::builtin_profiles();
        profiles[0].accepted.insert(Temperature);
        profiles[0].value_types.insert(Temperature, "temperature".into());
        let err = ProfileRegistry::new(profiles).unwrap_err();
        assert_eq!(
            err,
            RegistryError::OverlappingKind {
                kind: Temperature,
                first: ProfileId::Sound,
                second: ProfileId::Environmental,
            }
        );
    }

    #[test]
    fn missing_value_type_is_rejected() {
        let mut profiles = ProfileRegistry::builtin_profiles();
        profiles[2].value_types.clear();
        assert!(matches!(
            ProfileRegistry::new(profiles),
            Err(RegistryError::MissingValueType { profile: ProfileId::Dust, kind: AirQuality })
        ));
    }

    #[test]
    fn default_protocol_names() {
        let registry = ProfileRegistry::builtin();
        assert_eq!(registry.get(ProfileId::Dust).unwrap().value_type(AirQuality), Some("P1"));
        assert_eq!(registry.get(ProfileId::Sound).unwrap().value_type(Sound), Some("sound"));
        assert_eq!(registry.profile_for_kind(Humidity).unwrap().default_sensor_id, "022222");
    }
}
