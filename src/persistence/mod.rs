//! Price record store
//!
//! The store is the single writer surface for raw observations, tokens and
//! derived snapshots. Every other component talks to it through the
//! [`PriceStore`] trait.

mod csv_store;

pub use csv_store::CsvPriceStore;

use async_trait::async_trait;
use rust_decimal::Decimal;
use thiserror::Error;
use tracing::info;

use crate::types::{NewObservation, NewToken, PriceObservation, PriceSnapshot, SnapshotSource, Token};

/// Persistence-layer fault. Never retried by the store itself.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("storage I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("CSV encoding failed: {0}")]
    Csv(#[from] csv::Error),

    #[error("unknown token id {0}")]
    UnknownToken(u64),
}

/// Semantic operations over raw observations, tokens and snapshots.
///
/// Inserts are single-row appends with no cross-row transactions; an
/// implementation must be safe for concurrent callers.
#[async_trait]
pub trait PriceStore: Send + Sync {
    /// Append one raw observation. Duplicates are accepted.
    async fn insert_observation(
        &self,
        observation: NewObservation,
    ) -> Result<PriceObservation, StoreError>;

    /// Newest observation (max publish time) for every feed key ever seen,
    /// ordered by feed key. Ties go to the earliest inserted row.
    async fn latest_per_feed(&self) -> Result<Vec<PriceObservation>, StoreError>;

    /// Newest observation for one feed key, `None` if never observed
    async fn latest_for_feed(&self, feed_key: &str)
        -> Result<Option<PriceObservation>, StoreError>;

    /// Append one snapshot row with a store-assigned timestamp
    async fn insert_snapshot(
        &self,
        token_id: u64,
        price: Decimal,
        source: SnapshotSource,
    ) -> Result<PriceSnapshot, StoreError>;

    /// Newest snapshot for a token
    async fn latest_snapshot(&self, token_id: u64) -> Result<Option<PriceSnapshot>, StoreError>;

    /// All tracked tokens ordered by id
    async fn tokens(&self) -> Result<Vec<Token>, StoreError>;

    /// Insert a token or refresh its metadata, keyed by contract address
    async fn upsert_token(&self, token: NewToken) -> Result<Token, StoreError>;
}

/// Seed the token table when it is empty. Returns the number of tokens added.
pub async fn seed_tokens_if_empty(
    store: &dyn PriceStore,
    seeds: &[NewToken],
) -> Result<usize, StoreError> {
    if !store.tokens().await?.is_empty() {
        return Ok(0);
    }

    for token in seeds {
        store.upsert_token(token.clone()).await?;
    }

    info!(count = seeds.len(), "Sample tokens created");
    Ok(seeds.len())
}
