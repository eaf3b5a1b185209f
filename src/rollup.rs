//! Snapshot rollup
//!
//! Every cycle writes exactly one snapshot per token: the newest observation
//! for `"<SYMBOL>/USD"` when one exists, otherwise a random placeholder
//! tagged `mock`.

use rand::Rng;
use rust_decimal::Decimal;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info};

use crate::persistence::{PriceStore, StoreError};
use crate::shutdown::ShutdownListener;
use crate::types::{PriceSnapshot, SnapshotSource, Token};

/// Placeholder prices are drawn from [0, 1000) at 8 decimal places
const MOCK_PRICE_SCALE: u32 = 8;
const MOCK_PRICE_UNITS: i64 = 1000 * 100_000_000;

fn mock_price() -> Decimal {
    let units = rand::thread_rng().gen_range(0..MOCK_PRICE_UNITS);
    Decimal::new(units, MOCK_PRICE_SCALE)
}

pub struct SnapshotRollup {
    store: Arc<dyn PriceStore>,
    interval: Duration,
}

impl SnapshotRollup {
    pub fn new(store: Arc<dyn PriceStore>, interval: Duration) -> Self {
        Self { store, interval }
    }

    /// Price and tag for one token
    async fn price_for(&self, token: &Token) -> (Decimal, SnapshotSource) {
        let feed_key = token.feed_key();
        match self.store.latest_for_feed(&feed_key).await {
            Ok(Some(row)) => match row.decoded_price() {
                Some(price) => (price, row.source.snapshot_source()),
                None => {
                    error!(
                        token = %token.symbol,
                        feed = %feed_key,
                        mantissa = %row.mantissa,
                        expo = row.expo,
                        "Latest price not decodable, using mock price"
                    );
                    (mock_price(), SnapshotSource::Mock)
                }
            },
            Ok(None) => (mock_price(), SnapshotSource::Mock),
            Err(e) => {
                error!(token = %token.symbol, feed = %feed_key, error = %e, "Latest price lookup failed, using mock price");
                (mock_price(), SnapshotSource::Mock)
            }
        }
    }

    /// Write one snapshot per token. Fails only when the token list is
    /// unreadable; per-token insert failures are logged and skipped.
    pub async fn run_cycle(&self) -> Result<Vec<PriceSnapshot>, StoreError> {
        let tokens = self.store.tokens().await?;
        let mut written = Vec::with_capacity(tokens.len());

        for token in &tokens {
            let (price, source) = self.price_for(token).await;
            match self.store.insert_snapshot(token.id, price, source).await {
                Ok(snapshot) => {
                    debug!(token = %token.symbol, price = %price, source = %source.as_str(), "Snapshot stored");
                    written.push(snapshot);
                }
                Err(e) => {
                    error!(token = %token.symbol, error = %e, "Failed to store snapshot");
                }
            }
        }

        let mocked = written
            .iter()
            .filter(|s| s.source == SnapshotSource::Mock)
            .count();
        info!(
            tokens = tokens.len(),
            written = written.len(),
            mocked,
            "📊 Price snapshot rollup complete"
        );
        Ok(written)
    }

    /// Run once immediately, then on every interval until shutdown
    pub async fn run(&self, mut shutdown: ShutdownListener) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = shutdown.wait() => break,
                _ = ticker.tick() => {
                    if let Err(e) = self.run_cycle().await {
                        error!(error = %e, "Snapshot rollup failed");
                    }
                }
            }
        }
        debug!("Snapshot rollup stopped");
    }
}
