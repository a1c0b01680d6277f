//! ==============================================================================
//! config.rs - Runtime Configuration Loader
//! ==============================================================================
//!
//! purpose:
//!     defines the schema for `relay.toml`.
//!     loads configuration from file or falls back to defaults.
//!
//! structure:
//!     - ServerConfig: where the ingest api listens.
//!     - LoggingConfig: default log filter, inbound payload logging.
//!     - StorageConfig: memory or postgres backend.
//!     - IngestConfig: fixed vs caller-supplied sensor ids.
//!     - ForwardingConfig: protocol variant for the aggregation service.
//!     - ProfilesConfig: per-sensor-type overrides of the builtin table.
//!
//! ==============================================================================

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use serde::Deserialize;

use crate::domain::{MeasurementKind, ProfileId};
use crate::forward::{BodyShape, HeaderStyle, ProtocolVariant, DEFAULT_ENDPOINT};
use crate::normalize::SensorIdMode;
use crate::profile::ProfileRegistry;
use crate::store::DEFAULT_MEMORY_CAPACITY;

/// environment variable naming an explicit config file
pub const CONFIG_ENV: &str = "RELAY_CONFIG";

/// Root configuration structure
#[derive(Debug, Deserialize, Clone, Default)]
#[serde(deny_unknown_fields)]
pub struct RelayConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub ingest: IngestConfig,
    #[serde(default)]
    pub forwarding: ForwardingConfig,
    /// keyed by profile name: sound, environmental, dust
    #[serde(default)]
    pub profiles: BTreeMap<String, ProfileOverride>,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default, deny_unknown_fields)]
pub struct ServerConfig {
    pub bind: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self { bind: "0.0.0.0:3000".to_string() }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default, deny_unknown_fields)]
pub struct LoggingConfig {
    /// used when RUST_LOG is not set
    pub level: String,
    /// log every inbound body at debug level
    pub log_payloads: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self { level: "info".to_string(), log_payloads: false }
    }
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    #[default]
    Memory,
    Postgres,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default, deny_unknown_fields)]
pub struct StorageConfig {
    pub backend: StorageBackend,
    pub url: Option<String>,
    pub max_connections: u32,
    /// rows retained by the memory backend before the oldest are evicted
    pub memory_capacity: usize,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: StorageBackend::Memory,
            url: None,
            max_connections: 5,
            memory_capacity: DEFAULT_MEMORY_CAPACITY,
        }
    }
}

#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default, deny_unknown_fields)]
pub struct IngestConfig {
    pub sensor_id_mode: SensorIdMode,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default, deny_unknown_fields)]
pub struct ForwardingConfig {
    pub enabled: bool,
    pub software_version: String,
    pub timeout_ms: u64,
    pub body_shape: BodyShape,
    pub header_style: HeaderStyle,
    /// template, `{sensor_id}` and `{external_id}` are expanded per reading
    pub endpoint: String,
}

impl Default for ForwardingConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            software_version: concat!("telemetry-relay-", env!("CARGO_PKG_VERSION")).to_string(),
            timeout_ms: 5_000,
            body_shape: BodyShape::Wrapped,
            header_style: HeaderStyle::Pin,
            endpoint: DEFAULT_ENDPOINT.to_string(),
        }
    }
}

/// optional per-profile overrides; unset fields keep the builtin value
#[derive(Debug, Deserialize, Clone, Default)]
#[serde(deny_unknown_fields)]
pub struct ProfileOverride {
    pub default_sensor_id: Option<String>,
    pub external_id: Option<String>,
    pub pin: Option<u16>,
    pub endpoint: Option<String>,
    /// canonical measurement name -> protocol value type, e.g. sound = "noise"
    #[serde(default)]
    pub value_types: BTreeMap<String, String>,
}

impl RelayConfig {
    /// Load configuration from file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())
            .with_context(|| format!("failed to read config file {}", path.as_ref().display()))?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        toml::from_str(content).context("failed to parse config")
    }

    /// first existing config file: $RELAY_CONFIG, then the usual locations
    pub fn locate() -> Option<PathBuf> {
        if let Ok(explicit) = std::env::var(CONFIG_ENV) {
            if !explicit.trim().is_empty() {
                return Some(PathBuf::from(explicit.trim()));
            }
        }
        [
            PathBuf::from("config").join("relay.toml"),
            PathBuf::from("..").join("config").join("relay.toml"),
        ]
        .into_iter()
        .find(|p| p.exists())
    }

    /// Load from the located file, or defaults when there is none
    pub fn load_or_default() -> Result<(Self, Option<PathBuf>)> {
        match Self::locate() {
            Some(path) => Ok((Self::load(&path)?, Some(path))),
            None => Ok((Self::default(), None)),
        }
    }

    /// builtin profile table with this config's overrides applied
    pub fn build_registry(&self) -> Result<ProfileRegistry> {
        let mut profiles = ProfileRegistry::builtin_profiles();

        for (name, overrides) in &self.profiles {
            let id = ProfileId::from_name(name)
                .ok_or_else(|| anyhow!("unknown profile '{name}' in [profiles]"))?;
            let profile = profiles
                .iter_mut()
                .find(|p| p.id == id)
                .ok_or_else(|| anyhow!("profile '{name}' is not builtin"))?;

            if let Some(v) = &overrides.default_sensor_id {
                profile.default_sensor_id = v.clone();
            }
            if let Some(v) = &overrides.external_id {
                profile.external_id = v.clone();
            }
            if let Some(v) = overrides.pin {
                profile.pin = v;
            }
            if let Some(v) = &overrides.endpoint {
                profile.endpoint = Some(v.clone());
            }
            for (kind_name, value_type) in &overrides.value_types {
                let kind = MeasurementKind::from_name(kind_name)
                    .ok_or_else(|| anyhow!("unknown measurement '{kind_name}' in [profiles.{name}.value_types]"))?;
                if !profile.accepts(kind) {
                    return Err(anyhow!("profile '{name}' does not carry measurement '{kind_name}'"));
                }
                profile.value_types.insert(kind, value_type.clone());
            }
        }

        ProfileRegistry::new(profiles).context("invalid sensor profile table")
    }

    pub fn protocol_variant(&self) -> ProtocolVariant {
        let f = &self.forwarding;
        ProtocolVariant::new(f.software_version.clone(), f.body_shape, f.header_style)
            .with_endpoint(f.endpoint.clone())
    }

    pub fn forward_timeout(&self) -> Duration {
        Duration::from_millis(self.forwarding.timeout_ms)
    }

    /// Log configuration summary
    pub fn print_summary(&self) {
        tracing::info!("┌─────────────────────────────────────────┐");
        tracing::info!("│          RELAY CONFIGURATION            │");
        tracing::info!("├─────────────────────────────────────────┤");
        tracing::info!("│ Bind: {}", self.server.bind);
        tracing::info!("│ Storage: {:?}", self.storage.backend);
        tracing::info!("│ Sensor ids: {:?}", self.ingest.sensor_id_mode);
        tracing::info!("│ Forwarding: {}", if self.forwarding.enabled { "on" } else { "off" });
        tracing::info!("│ Protocol: {:?} body, {:?} headers", self.forwarding.body_shape, self.forwarding.header_style);
        tracing::info!("│ Log Level: {}", self.logging.level);
        tracing::info!("└─────────────────────────────────────────┘");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
        [server]
        bind = "127.0.0.1:8080"

        [storage]
        backend = "postgres"
        url = "postgres://relay@localhost/telemetry"

        [ingest]
        sensor_id_mode = "caller"

        [forwarding]
        enabled = true
        software_version = "relay-test"
        body_shape = "bare"
        header_style = "sensor_id"

        [profiles.sound]
        external_id = "esp32-noise"
        pin = 15
        value_types = { sound = "noise" }

        [profiles.dust]
        endpoint = "http://mirror.local/dust"
    "#;

    #[test]
    fn empty_file_gives_defaults() {
        let config = RelayConfig::from_toml("").unwrap();
        assert_eq!(config.server.bind, "0.0.0.0:3000");
        assert_eq!(config.storage.backend, StorageBackend::Memory);
        assert_eq!(config.storage.memory_capacity, DEFAULT_MEMORY_CAPACITY);
        assert_eq!(config.ingest.sensor_id_mode, SensorIdMode::Fixed);
        assert!(config.forwarding.enabled);
        assert_eq!(config.forwarding.body_shape, BodyShape::Wrapped);
        assert_eq!(config.forwarding.header_style, HeaderStyle::Pin);
    }

    #[test]
    fn sample_parses() {
        let config = RelayConfig::from_toml(SAMPLE).unwrap();
        assert_eq!(config.server.bind, "127.0.0.1:8080");
        assert_eq!(config.storage.backend, StorageBackend::Postgres);
        assert_eq!(config.storage.max_connections, 5);
        assert_eq!(config.ingest.sensor_id_mode, SensorIdMode::Caller);
        assert_eq!(config.forwarding.body_shape, BodyShape::Bare);
        assert_eq!(config.forwarding.header_style, HeaderStyle::SensorId);
        assert_eq!(config.forwarding.timeout_ms, 5_000);

        let variant = config.protocol_variant();
        assert_eq!(variant.software_version, "relay-test");
        assert_eq!(variant.endpoint, DEFAULT_ENDPOINT);
    }

    #[test]
    fn overrides_reach_the_registry() {
        let registry = RelayConfig::from_toml(SAMPLE).unwrap().build_registry().unwrap();
        let sound = registry.get(ProfileId::Sound).unwrap();
        assert_eq!(sound.external_id, "esp32-noise");
        assert_eq!(sound.default_sensor_id, "011111");
        assert_eq!(sound.value_type(MeasurementKind::Sound), Some("noise"));
        let dust = registry.get(ProfileId::Dust).unwrap();
        assert_eq!(dust.endpoint.as_deref(), Some("http://mirror.local/dust"));
        assert_eq!(dust.value_type(MeasurementKind::AirQuality), Some("P1"));
    }

    #[test]
    fn unknown_profile_is_an_error() {
        let config = RelayConfig::from_toml("[profiles.radiation]\npin = 3").unwrap();
        let err = config.build_registry().unwrap_err();
        assert!(err.to_string().contains("radiation"));
    }

    #[test]
    fn foreign_measurement_override_is_an_error() {
        let config = RelayConfig::from_toml("[profiles.dust]\nvalue_types = { sound = \"noise\" }").unwrap();
        assert!(config.build_registry().is_err());
        let config = RelayConfig::from_toml("[profiles.dust]\nvalue_types = { pm25 = \"P2\" }").unwrap();
        assert!(config.build_registry().is_err());
    }

    #[test]
    fn unknown_keys_are_rejected() {
        assert!(RelayConfig::from_toml("[polling]\ninterval_seconds = 5").is_err());
        assert!(RelayConfig::from_toml("[profiles.sound]\ncolour = \"red\"").is_err());
    }

    #[test]
    fn misspelled_section_keys_are_rejected() {
        for toml in [
            "[server]\nbnid = \"127.0.0.1:1\"",
            "[logging]\nlog_payload = true",
            "[storage]\nbackend = \"postgres\"\nulr = \"postgres://x\"",
            "[ingest]\nsensor_id_mod = \"caller\"",
            "[forwarding]\nheader_stlye = \"sensor_id\"",
        ] {
            let err = RelayConfig::from_toml(toml).unwrap_err();
            assert!(format!("{err:#}").contains("unknown field"), "{toml}: {err:#}");
        }
    }

    #[test]
    fn shipped_config_parses() {
        let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("config").join("relay.toml");
        let config = RelayConfig::load(path).unwrap();
        config.build_registry().unwrap();
    }
}
