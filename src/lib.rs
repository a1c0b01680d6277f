//! ==============================================================================
//! lib.rs - telemetry relay library
//! ==============================================================================
//!
//! purpose:
//!     field devices post loosely structured measurement objects. the relay
//!     maps them onto canonical readings per sensor profile, persists each
//!     reading and pushes it to the sensor.community open-data service.
//!
//! relationships:
//!     - main.rs wires config, store and forwarder into the router built here
//!     - tests/api_test.rs drives the same router in process
//!
//! ```text
//! POST /espdata ─► Pipeline ─► Normalizer ─► ReadingStore::persist ─► Forwarder::push
//! ```
//!
//! ==============================================================================

pub mod api;
pub mod config;
pub mod domain;
pub mod error;
pub mod forward;
pub mod normalize;
pub mod pipeline;
pub mod profile;
pub mod store;

pub use api::{build_router, AppState};
pub use config::RelayConfig;
pub use domain::{BatchResult, ForwardOutcome, ForwardStatus, MeasurementKind, ProfileId, RawItem, Reading};
pub use error::{ForwardError, NormalizeError, PipelineError, StoreError, UnknownSensorProfile};
pub use forward::{Forwarder, HttpForwarder, ProtocolVariant};
pub use normalize::{Normalizer, SensorIdMode};
pub use pipeline::{CancelFlag, Pipeline};
pub use profile::{ProfileRegistry, SensorProfile};
pub use store::{MemoryStore, PgStore, ReadingStore};
