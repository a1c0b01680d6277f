//! ==============================================================================
//! error.rs - typed errors for every layer of the relay
//! ==============================================================================
//!
//! purpose:
//!     one thiserror enum per layer. validation problems (bad body, bad
//!     values, bad or missing ids) are the caller's fault and map to 400.
//!     storage errors abort the batch and map to 500. forwarding errors are
//!     recorded per reading and never abort anything.
//!
//! relationships:
//!     - raised by: profile.rs, normalize.rs, store.rs, forward.rs, pipeline.rs
//!     - mapped to http status codes in api.rs
//!     - startup and config loading use anyhow instead
//!
//! ==============================================================================

use crate::domain::{ForwardOutcome, MeasurementKind, ProfileId};

/// The presented measurement kinds match no registered profile.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("no sensor profile accepts measurements [{}]", kinds_list(.kinds))]
pub struct UnknownSensorProfile {
    pub kinds: Vec<MeasurementKind>,
}

fn kinds_list(kinds: &[MeasurementKind]) -> String {
    kinds.iter().map(|k| k.name()).collect::<Vec<_>>().join(", ")
}

/// Profile table construction errors, raised once at startup.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    #[error("measurement {kind} is claimed by both {first} and {second}")]
    OverlappingKind {
        kind: MeasurementKind,
        first: ProfileId,
        second: ProfileId,
    },
    #[error("profile {profile} has no protocol value type for {kind}")]
    MissingValueType {
        profile: ProfileId,
        kind: MeasurementKind,
    },
    #[error("profile {0} is registered twice")]
    DuplicateProfile(ProfileId),
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum NormalizeError {
    #[error("field '{field}' is not a finite number: {value}")]
    InvalidValue { field: String, value: String },

    #[error("sensor_id is required in caller-supplied id mode")]
    MissingSensorId,

    #[error("sensor_id {value:?} must be printable ascii")]
    InvalidSensorId { value: String },

    #[error(transparent)]
    UnknownSensorProfile(#[from] UnknownSensorProfile),

    #[error("reading for profile {0} has no measurements")]
    EmptyReading(ProfileId),

    #[error("measurement {kind} does not belong to profile {profile}")]
    OutsideProfile {
        kind: MeasurementKind,
        profile: ProfileId,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    #[error("storage unavailable: {0}")]
    StorageUnavailable(String),

    #[error("constraint violation: {0}")]
    ConstraintViolation(String),

    #[error("stored row could not be decoded: {0}")]
    Decode(String),
}

impl From<sqlx::Error> for StoreError {
    fn from(e: sqlx::Error) -> Self {
        use sqlx::error::ErrorKind;

        match &e {
            sqlx::Error::Database(db) => match db.kind() {
                ErrorKind::UniqueViolation
                | ErrorKind::ForeignKeyViolation
                | ErrorKind::NotNullViolation
                | ErrorKind::CheckViolation => StoreError::ConstraintViolation(db.message().to_string()),
                _ => StoreError::StorageUnavailable(db.message().to_string()),
            },
            sqlx::Error::ColumnDecode { .. }
            | sqlx::Error::ColumnNotFound(_)
            | sqlx::Error::Decode(_)
            | sqlx::Error::TypeNotFound { .. } => StoreError::Decode(e.to_string()),
            _ => StoreError::StorageUnavailable(e.to_string()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ForwardError {
    #[error("aggregation service rejected the reading with status {status}: {body}")]
    Rejected { status: u16, body: String },

    #[error("aggregation service unreachable: {detail}")]
    Unreachable { detail: String },

    /// the request could not be built; the aggregation service was never contacted
    #[error("push request could not be built: {detail}")]
    Request { detail: String },

    #[error("no profile {0} registered for forwarding")]
    UnknownProfile(ProfileId),
}

impl From<reqwest::Error> for ForwardError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_builder() {
            return ForwardError::Request { detail: e.to_string() };
        }
        let detail = if e.is_timeout() {
            format!("timed out: {e}")
        } else {
            e.to_string()
        };
        ForwardError::Unreachable { detail }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("body must be a non-empty JSON array or object: {0}")]
    MalformedBody(String),

    #[error("body must be a non-empty JSON array or object")]
    EmptyBatch,

    #[error("batch item {index} is not a JSON object")]
    MalformedItem { index: usize },

    #[error("batch item {index}: {source}")]
    Normalize {
        index: usize,
        #[source]
        source: NormalizeError,
    },

    #[error("no recognized measurements in request")]
    NoMeasurements,

    #[error("{source}")]
    Storage {
        #[source]
        source: StoreError,
        /// outcomes recorded before the failing reading, plus the failure itself
        completed: Vec<ForwardOutcome>,
    },
}

impl PipelineError {
    /// caller errors, surfaced as 4xx
    pub fn is_validation(&self) -> bool {
        !matches!(self, PipelineError::Storage { .. })
    }
}
