//! ==============================================================================
//! forward.rs - relay readings to the open-data aggregation service
//! ==============================================================================
//!
//! purpose:
//!     turns a reading into the sensor.community push protocol and posts it.
//!
//! ```text
//!     POST <endpoint>
//!     X-Pin: 11            (or X-Sensor-Id, see HeaderBuilder)
//!     X-Sensor: 022222
//!
//!     {"software_version": "...",
//!      "sensordatavalues": [{"value_type": "temperature", "value": "21.5"}, ...]}
//! ```
//!
//! variants:
//!     deployments disagree on header names, endpoint paths, body shape and
//!     some value type names. all of that lives in `ProtocolVariant` (built
//!     from config) and the profile table, never in branches on sensor ids.
//!
//! relationships:
//!     - used by: pipeline.rs (Forwarder trait object)
//!     - uses: profile.rs (value type names, external id, pin, endpoint)
//!     - the reqwest::Client is built once in main.rs and injected here
//!
//! ==============================================================================

use std::sync::Arc;

use async_trait::async_trait;
use percent_encoding::{utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use serde::ser::SerializeStruct;
use serde::{Deserialize, Serialize, Serializer};

use crate::domain::Reading;
use crate::error::ForwardError;
use crate::profile::{ProfileRegistry, SensorProfile};

pub const DEFAULT_ENDPOINT: &str =
    "https://api.sensor.community/v1/push-sensor-data/?sensor={external_id}";

/// everything except rfc 3986 unreserved characters
const URL_ID: &AsciiSet = &NON_ALPHANUMERIC.remove(b'-').remove(b'.').remove(b'_').remove(b'~');

/// successful result of a push
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Accepted { status: u16 },
    /// forwarding is switched off for this deployment
    Skipped,
}

#[async_trait]
pub trait Forwarder: Send + Sync {
    async fn push(&self, reading: &Reading) -> Result<Delivery, ForwardError>;
}

// ==============================================================================
// envelope
// ==============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BodyShape {
    /// `{"software_version": .., "sensordatavalues": [..]}`
    #[default]
    Wrapped,
    /// `[..]` as the whole body
    Bare,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SensorDataValue {
    pub value_type: String,
    pub value: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    pub software_version: String,
    pub values: Vec<SensorDataValue>,
    pub shape: BodyShape,
}

impl Envelope {
    pub fn value_types(&self) -> impl Iterator<Item = &str> {
        self.values.iter().map(|v| v.value_type.as_str())
    }

    pub fn to_bytes(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec(self)
    }
}

impl Serialize for Envelope {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self.shape {
            BodyShape::Wrapped => {
                let mut body = serializer.serialize_struct("Envelope", 2)?;
                body.serialize_field("software_version", &self.software_version)?;
                body.serialize_field("sensordatavalues", &self.values)?;
                body.end()
            }
            BodyShape::Bare => self.values.serialize(serializer),
        }
    }
}

/// pure: the same reading always renders the same envelope
///
/// kinds without a protocol name are skipped; the registry refuses such
/// profiles at startup so this does not happen with a validated table.
pub fn build_envelope(
    reading: &Reading,
    profile: &SensorProfile,
    software_version: &str,
    shape: BodyShape,
) -> Envelope {
    let values = reading
        .measurements()
        .filter_map(|(kind, value)| {
            profile.value_type(kind).map(|name| SensorDataValue {
                value_type: name.to_string(),
                value: format_value(value),
            })
        })
        .collect();
    Envelope {
        software_version: software_version.to_string(),
        values,
        shape,
    }
}

/// shortest decimal form: 40.0 -> "40", 21.5 -> "21.5"
pub fn format_value(value: f64) -> String {
    value.to_string()
}

// ==============================================================================
// headers
// ==============================================================================

pub trait HeaderBuilder: Send + Sync {
    fn headers(&self, reading: &Reading, profile: &SensorProfile) -> Vec<(&'static str, String)>;
}

/// `X-Pin` + `X-Sensor`, the sensor.community convention
#[derive(Debug, Clone, Copy, Default)]
pub struct PinHeaders;

impl HeaderBuilder for PinHeaders {
    fn headers(&self, _reading: &Reading, profile: &SensorProfile) -> Vec<(&'static str, String)> {
        vec![
            ("X-Pin", profile.pin.to_string()),
            ("X-Sensor", profile.external_id.clone()),
        ]
    }
}

/// `X-Sensor` + `X-Sensor-Id` carrying the reading's own sensor id
#[derive(Debug, Clone, Copy, Default)]
pub struct SensorIdHeaders;

impl HeaderBuilder for SensorIdHeaders {
    fn headers(&self, reading: &Reading, profile: &SensorProfile) -> Vec<(&'static str, String)> {
        vec![
            ("X-Sensor", profile.external_id.clone()),
            ("X-Sensor-Id", reading.sensor_id().to_string()),
        ]
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HeaderStyle {
    #[default]
    Pin,
    SensorId,
}

impl HeaderStyle {
    pub fn builder(self) -> Arc<dyn HeaderBuilder> {
        match self {
            HeaderStyle::Pin => Arc::new(PinHeaders),
            HeaderStyle::SensorId => Arc::new(SensorIdHeaders),
        }
    }
}

// ==============================================================================
// protocol variant
// ==============================================================================

/// everything that differs between deployments of the push protocol
#[derive(Clone)]
pub struct ProtocolVariant {
    pub software_version: String,
    pub body_shape: BodyShape,
    pub headers: Arc<dyn HeaderBuilder>,
    /// endpoint template used when a profile has none of its own
    pub endpoint: String,
}

impl ProtocolVariant {
    pub fn new(software_version: impl Into<String>, body_shape: BodyShape, style: HeaderStyle) -> Self {
        Self {
            software_version: software_version.into(),
            body_shape,
            headers: style.builder(),
            endpoint: DEFAULT_ENDPOINT.to_string(),
        }
    }

    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = endpoint.into();
        self
    }

    pub fn envelope(&self, reading: &Reading, profile: &SensorProfile) -> Envelope {
        build_envelope(reading, profile, &self.software_version, self.body_shape)
    }

    /// expand `{sensor_id}` and `{external_id}` in the endpoint template,
    /// percent-encoding both so an id can never add a query or fragment
    pub fn url(&self, reading: &Reading, profile: &SensorProfile) -> String {
        let sensor_id = utf8_percent_encode(reading.sensor_id(), URL_ID).to_string();
        let external_id = utf8_percent_encode(&profile.external_id, URL_ID).to_string();
        profile
            .endpoint
            .as_deref()
            .unwrap_or(&self.endpoint)
            .replace("{sensor_id}", &sensor_id)
            .replace("{external_id}", &external_id)
    }
}

impl std::fmt::Debug for ProtocolVariant {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProtocolVariant")
            .field("software_version", &self.software_version)
            .field("body_shape", &self.body_shape)
            .field("endpoint", &self.endpoint)
            .finish_non_exhaustive()
    }
}

// ==============================================================================
// forwarders
// ==============================================================================

pub struct HttpForwarder {
    client: reqwest::Client,
    registry: Arc<ProfileRegistry>,
    variant: ProtocolVariant,
}

impl HttpForwarder {
    pub fn new(client: reqwest::Client, registry: Arc<ProfileRegistry>, variant: ProtocolVariant) -> Self {
        Self {
            client,
            registry,
            variant,
        }
    }

    pub fn variant(&self) -> &ProtocolVariant {
        &self.variant
    }
}

#[async_trait]
impl Forwarder for HttpForwarder {
    async fn push(&self, reading: &Reading) -> Result<Delivery, ForwardError> {
        let profile = self
            .registry
            .get(reading.profile())
            .ok_or(ForwardError::UnknownProfile(reading.profile()))?;

        let url = self.variant.url(reading, profile);
        let envelope = self.variant.envelope(reading, profile);

        let mut request = self.client.post(&url).json(&envelope);
        for (name, value) in self.variant.headers.headers(reading, profile) {
            request = request.header(name, value);
        }

        tracing::debug!(
            sensor_id = %reading.sensor_id(),
            profile = %profile.id,
            url = %url,
            values = envelope.values.len(),
            "pushing reading"
        );

        let response = request.send().await?;
        let status = response.status();
        if status.is_success() {
            return Ok(Delivery::Accepted {
                status: status.as_u16(),
            });
        }

        let body = response.text().await.unwrap_or_default();
        Err(ForwardError::Rejected {
            status: status.as_u16(),
            body,
        })
    }
}

/// used when `[forwarding] enabled = false`
#[derive(Debug, Clone, Copy, Default)]
pub struct DisabledForwarder;

#[async_trait]
impl Forwarder for DisabledForwarder {
    async fn push(&self, _reading: &Reading) -> Result<Delivery, ForwardError> {
        Ok(Delivery::Skipped)
    }
}
