//! ==============================================================================
//! pipeline.rs - batch ingest orchestration
//! ==============================================================================
//!
//! purpose:
//!     raw request body -> normalized readings -> persist -> forward, one
//!     reading at a time, in normalization order.
//!
//! failure policy:
//!     - validation errors are found before any i/o (whole batch normalized
//!       first), so they never leave partial writes
//!     - a storage failure aborts the rest of the batch (server error)
//!     - a forwarding failure is recorded on its outcome and logged; the
//!       batch continues and the request still succeeds
//!
//! cancellation:
//!     the flag is checked between readings only. a persist or push that has
//!     started always runs to completion.
//!
//! ==============================================================================

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde_json::Value;

use crate::domain::{BatchResult, ForwardOutcome, RawItem, Reading};
use crate::error::PipelineError;
use crate::forward::Forwarder;
use crate::normalize::Normalizer;
use crate::store::ReadingStore;

/// request-scoped cancellation signal
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// cancels on drop unless disarmed
    pub fn drop_guard(&self) -> CancelOnDrop {
        CancelOnDrop {
            flag: Some(self.clone()),
        }
    }
}

pub struct CancelOnDrop {
    flag: Option<CancelFlag>,
}

impl CancelOnDrop {
    pub fn disarm(mut self) {
        self.flag = None;
    }
}

impl Drop for CancelOnDrop {
    fn drop(&mut self) {
        if let Some(flag) = self.flag.take() {
            flag.cancel();
        }
    }
}

pub struct Pipeline {
    normalizer: Normalizer,
    store: Arc<dyn ReadingStore>,
    forwarder: Arc<dyn Forwarder>,
}

impl Pipeline {
    pub fn new(normalizer: Normalizer, store: Arc<dyn ReadingStore>, forwarder: Arc<dyn Forwarder>) -> Self {
        Self {
            normalizer,
            store,
            forwarder,
        }
    }

    pub fn store(&self) -> &Arc<dyn ReadingStore> {
        &self.store
    }

    /// accept a single object or an array of objects
    pub fn split_batch(body: Value) -> Result<Vec<RawItem>, PipelineError> {
        let values = match body {
            Value::Array(values) => values,
            other => vec![other],
        };
        if values.is_empty() {
            return Err(PipelineError::EmptyBatch);
        }
        values
            .into_iter()
            .enumerate()
            .map(|(index, value)| RawItem::from_value(value).ok_or(PipelineError::MalformedItem { index }))
            .collect()
    }

    /// normalize every item, in order
    pub fn normalize_batch(&self, items: &[RawItem]) -> Result<Vec<Reading>, PipelineError> {
        let mut readings = Vec::new();
        for (index, item) in items.iter().enumerate() {
            let produced = self
                .normalizer
                .normalize(item)
                .map_err(|source| PipelineError::Normalize { index, source })?;
            if produced.is_empty() {
                tracing::debug!(index, "batch item has no recognized measurements, skipping");
            }
            readings.extend(produced);
        }
        if readings.is_empty() {
            return Err(PipelineError::NoMeasurements);
        }
        Ok(readings)
    }

    pub async fn ingest(&self, body: Value, cancel: &CancelFlag) -> Result<BatchResult, PipelineError> {
        let items = Self::split_batch(body)?;
        let readings = self.normalize_batch(&items)?;
        tracing::debug!(items = items.len(), readings = readings.len(), "batch normalized");

        let mut outcomes: Vec<ForwardOutcome> = Vec::with_capacity(readings.len());
        let mut cancelled = false;

        for reading in readings {
            if cancel.is_cancelled() {
                tracing::warn!(
                    completed = outcomes.len(),
                    "request cancelled, skipping remaining readings"
                );
                cancelled = true;
                break;
            }

            let id = match self.store.persist(&reading).await {
                Ok(id) => id,
                Err(source) => {
                    tracing::error!(
                        sensor_id = %reading.sensor_id(),
                        profile = %reading.profile(),
                        backend = self.store.backend(),
                        error = %source,
                        "persist failed, aborting batch"
                    );
                    outcomes.push(ForwardOutcome::not_persisted(reading, source.to_string()));
                    return Err(PipelineError::Storage {
                        source,
                        completed: outcomes,
                    });
                }
            };

            let pushed = self.forwarder.push(&reading).await;
            if let Err(e) = &pushed {
                tracing::warn!(
                    sensor_id = %reading.sensor_id(),
                    profile = %reading.profile(),
                    persisted_id = %id,
                    error = %e,
                    "forwarding failed, reading kept"
                );
            }
            outcomes.push(ForwardOutcome::forwarded(reading, id, pushed));
        }

        let processed_count = outcomes.iter().filter(|o| o.is_persisted()).count();
        Ok(BatchResult {
            processed_count,
            outcomes,
            cancelled,
        })
    }
}
