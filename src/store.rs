//! ==============================================================================
//! store.rs - persistence of readings
//! ==============================================================================
//!
//! purpose:
//!     the narrow write contract the pipeline needs (`persist`) plus the
//!     latest-reading lookup behind `GET /data`.
//!
//! implementations:
//!     - MemoryStore: bounded in-process ring, for development and tests
//!     - PgStore:     postgresql `sensors` table via sqlx
//!
//! the table is owned externally; nothing here creates or migrates it.
//! expected shape:
//!
//! ```text
//!     sensors(id SERIAL, sensor_id TEXT, profile TEXT, temperature REAL,
//!             pressure REAL, humidity REAL, sound REAL, air_quality REAL,
//!             captured_at TIMESTAMPTZ)
//! ```
//!
//! ==============================================================================

use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::Row;
use tokio::sync::RwLock;

use crate::domain::{MeasurementKind, PersistedId, ProfileId, Reading, StoredReading};
use crate::error::StoreError;
use crate::profile::ProfileRegistry;

#[async_trait]
pub trait ReadingStore: Send + Sync {
    /// store one reading, returning its row id
    async fn persist(&self, reading: &Reading) -> Result<PersistedId, StoreError>;

    /// most recently persisted reading
    async fn latest(&self) -> Result<Option<StoredReading>, StoreError>;

    /// short backend name for logs
    fn backend(&self) -> &'static str;
}

// ==============================================================================
// in-memory store
// ==============================================================================

/// rows kept by `MemoryStore::new`
pub const DEFAULT_MEMORY_CAPACITY: usize = 1024;

/// bounded in-process store; the oldest rows are evicted once `capacity`
/// is reached, ids keep increasing across evictions
pub struct MemoryStore {
    capacity: usize,
    inner: RwLock<MemoryRows>,
}

#[derive(Default)]
struct MemoryRows {
    last_id: i64,
    rows: VecDeque<StoredReading>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_MEMORY_CAPACITY)
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// a capacity of zero is treated as one; `latest` always has a row to show
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            inner: RwLock::new(MemoryRows::default()),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// snapshot of the retained rows, oldest first
    pub async fn all(&self) -> Vec<StoredReading> {
        self.inner.read().await.rows.iter().cloned().collect()
    }

    pub async fn len(&self) -> usize {
        self.inner.read().await.rows.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.read().await.rows.is_empty()
    }
}

#[async_trait]
impl ReadingStore for MemoryStore {
    async fn persist(&self, reading: &Reading) -> Result<PersistedId, StoreError> {
        let mut inner = self.inner.write().await;
        inner.last_id += 1;
        let id = PersistedId(inner.last_id);
        if inner.rows.len() == self.capacity {
            inner.rows.pop_front();
        }
        inner.rows.push_back(StoredReading {
            id,
            reading: reading.clone(),
        });
        Ok(id)
    }

    async fn latest(&self) -> Result<Option<StoredReading>, StoreError> {
        Ok(self.inner.read().await.rows.back().cloned())
    }

    fn backend(&self) -> &'static str {
        "memory"
    }
}

// ==============================================================================
// postgresql store
// ==============================================================================

const INSERT_READING: &str = r#"
    INSERT INTO sensors
        (sensor_id, profile, temperature, pressure, humidity, sound, air_quality, captured_at)
    VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
    RETURNING id::BIGINT
"#;

const SELECT_LATEST: &str = r#"
    SELECT id::BIGINT AS id, sensor_id, profile,
           temperature::FLOAT8 AS temperature, pressure::FLOAT8 AS pressure,
           humidity::FLOAT8 AS humidity, sound::FLOAT8 AS sound,
           air_quality::FLOAT8 AS air_quality, captured_at
    FROM sensors
    ORDER BY captured_at DESC, id DESC
    LIMIT 1
"#;

/// column holding each measurement kind
fn column(kind: MeasurementKind) -> &'static str {
    match kind {
        MeasurementKind::Temperature => "temperature",
        MeasurementKind::Pressure => "pressure",
        MeasurementKind::Humidity => "humidity",
        MeasurementKind::Sound => "sound",
        MeasurementKind::AirQuality => "air_quality",
    }
}

pub struct PgStore {
    pool: PgPool,
    registry: Arc<ProfileRegistry>,
}

impl PgStore {
    pub async fn connect(
        url: &str,
        max_connections: u32,
        registry: Arc<ProfileRegistry>,
    ) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(url)
            .await?;
        Ok(Self::with_pool(pool, registry))
    }

    pub fn with_pool(pool: PgPool, registry: Arc<ProfileRegistry>) -> Self {
        Self { pool, registry }
    }

    fn decode(&self, row: &PgRow) -> Result<StoredReading, StoreError> {
        let id: i64 = row.try_get("id")?;
        let sensor_id: String = row.try_get("sensor_id")?;
        let profile_name: String = row.try_get("profile")?;
        let captured_at: DateTime<Utc> = row.try_get("captured_at")?;

        let profile_id = ProfileId::from_name(&profile_name)
            .ok_or_else(|| StoreError::Decode(format!("unknown profile '{profile_name}'")))?;
        let profile = self
            .registry
            .get(profile_id)
            .ok_or_else(|| StoreError::Decode(format!("profile '{profile_name}' not registered")))?;

        let mut measurements = BTreeMap::new();
        for kind in &profile.accepted {
            let value: Option<f64> = row.try_get(column(*kind))?;
            if let Some(v) = value {
                measurements.insert(*kind, v);
            }
        }

        let reading = Reading::new(sensor_id, profile, measurements, captured_at)
            .map_err(|e| StoreError::Decode(e.to_string()))?;
        Ok(StoredReading {
            id: PersistedId(id),
            reading,
        })
    }
}

#[async_trait]
impl ReadingStore for PgStore {
    async fn persist(&self, reading: &Reading) -> Result<PersistedId, StoreError> {
        let id: i64 = sqlx::query_scalar(INSERT_READING)
            .bind(reading.sensor_id())
            .bind(reading.profile().as_str())
            .bind(reading.get(MeasurementKind::Temperature))
            .bind(reading.get(MeasurementKind::Pressure))
            .bind(reading.get(MeasurementKind::Humidity))
            .bind(reading.get(MeasurementKind::Sound))
            .bind(reading.get(MeasurementKind::AirQuality))
            .bind(reading.captured_at())
            .fetch_one(&self.pool)
            .await?;
        Ok(PersistedId(id))
    }

    async fn latest(&self) -> Result<Option<StoredReading>, StoreError> {
        let row = sqlx::query(SELECT_LATEST).fetch_optional(&self.pool).await?;
        row.as_ref().map(|r| self.decode(r)).transpose()
    }

    fn backend(&self) -> &'static str {
        "postgres"
    }
}
