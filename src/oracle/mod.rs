//! Oracle module - multi-source price ingestion
//!
//! Pulls prices from the substreams process, Pyth Hermes and CoinGecko,
//! normalizes them into raw observations and commits each one through an
//! [`IngestSink`].

pub mod chain;
pub mod feeds;
pub mod orchestrator;
pub mod sources;

pub use chain::{CycleOutcome, FallbackChain};
pub use orchestrator::{IngestOrchestrator, IngestState, OrchestratorTiming};

use chrono::{DateTime, TimeZone, Utc};
use rust_decimal::Decimal;
use std::str::FromStr;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use crate::persistence::{PriceStore, StoreError};
use crate::types::{NewObservation, PriceObservation};

const NEVER: i64 = i64::MIN;

/// Pipeline-wide write health, shared by every adapter and the staleness
/// monitor.
#[derive(Debug)]
pub struct IngestHealth {
    started_at: DateTime<Utc>,
    last_write_ms: AtomicI64,
}

impl IngestHealth {
    pub fn new() -> Self {
        Self::with_start(Utc::now())
    }

    pub fn with_start(started_at: DateTime<Utc>) -> Self {
        Self {
            started_at,
            last_write_ms: AtomicI64::new(NEVER),
        }
    }

    /// Stamp a successful persist. Never moves backwards.
    pub fn record_write(&self, at: DateTime<Utc>) {
        self.last_write_ms
            .fetch_max(at.timestamp_millis(), Ordering::AcqRel);
    }

    pub fn last_successful_write(&self) -> Option<DateTime<Utc>> {
        match self.last_write_ms.load(Ordering::Acquire) {
            NEVER => None,
            ms => Utc.timestamp_millis_opt(ms).single(),
        }
    }

    /// Last write, or pipeline start when nothing was written yet
    pub fn last_progress(&self) -> DateTime<Utc> {
        self.last_successful_write().unwrap_or(self.started_at)
    }
}

impl Default for IngestHealth {
    fn default() -> Self {
        Self::new()
    }
}

/// Write path shared by all adapters: persist, then stamp health.
#[derive(Clone)]
pub struct IngestSink {
    store: Arc<dyn PriceStore>,
    health: Arc<IngestHealth>,
}

impl IngestSink {
    pub fn new(store: Arc<dyn PriceStore>, health: Arc<IngestHealth>) -> Self {
        Self { store, health }
    }

    pub async fn record(&self, observation: NewObservation) -> Result<PriceObservation, StoreError> {
        let row = self.store.insert_observation(observation).await?;
        self.health.record_write(Utc::now());
        Ok(row)
    }

    pub fn health(&self) -> &Arc<IngestHealth> {
        &self.health
    }

    pub fn store(&self) -> &Arc<dyn PriceStore> {
        &self.store
    }
}

/// Decimal from a JSON number or numeric string ("123", "1.5", "1e8")
pub(crate) fn decimal_from_json(value: &serde_json::Value) -> Option<Decimal> {
    let text = match value {
        serde_json::Value::Number(n) => n.to_string(),
        serde_json::Value::String(s) => s.trim().to_string(),
        _ => return None,
    };
    Decimal::from_str(&text)
        .or_else(|_| Decimal::from_scientific(&text))
        .ok()
}

/// Integer from a JSON number or numeric string
pub(crate) fn i64_from_json(value: &serde_json::Value) -> Option<i64> {
    match value {
        serde_json::Value::Number(n) => n.as_i64(),
        serde_json::Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// Epoch timestamp to UTC. Values that look like milliseconds are accepted.
pub(crate) fn epoch_to_utc(ts: i64) -> Option<DateTime<Utc>> {
    if ts.abs() >= 1_000_000_000_000 {
        Utc.timestamp_millis_opt(ts).single()
    } else {
        Utc.timestamp_opt(ts, 0).single()
    }
}
