//! Staleness monitor
//!
//! Periodically compares every feed's newest publish time, and the pipeline's
//! last successful write, against a staleness threshold. Purely
//! observational: alerts are logged and returned, nothing is retried.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error};

use crate::oracle::IngestHealth;
use crate::persistence::PriceStore;
use crate::shutdown::ShutdownListener;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StalenessAlert {
    FeedStale {
        feed_key: String,
        publish_time: DateTime<Utc>,
        age: ChronoDuration,
    },
    NoRecentWrites {
        /// Last successful write, or pipeline start if nothing was written
        since: DateTime<Utc>,
        age: ChronoDuration,
    },
}

pub struct StalenessMonitor {
    store: Arc<dyn PriceStore>,
    health: Arc<IngestHealth>,
    threshold: ChronoDuration,
    interval: Duration,
}

impl StalenessMonitor {
    pub fn new(
        store: Arc<dyn PriceStore>,
        health: Arc<IngestHealth>,
        threshold: ChronoDuration,
        interval: Duration,
    ) -> Self {
        Self {
            store,
            health,
            threshold,
            interval,
        }
    }

    /// Run one check against `now` and log every alert raised
    pub async fn check(&self, now: DateTime<Utc>) -> Vec<StalenessAlert> {
        let latest = match self.store.latest_per_feed().await {
            Ok(rows) => rows,
            Err(e) => {
                error!(error = %e, "Staleness check failed to read latest prices");
                return Vec::new();
            }
        };

        let mut alerts = Vec::new();
        for row in latest {
            let age = now - row.publish_time;
            if age > self.threshold {
                error!(
                    feed = %row.feed_key,
                    age_secs = age.num_seconds(),
                    "🚨 PRICE ALERT: {} is stale, last update {}",
                    row.feed_key,
                    row.publish_time
                );
                alerts.push(StalenessAlert::FeedStale {
                    feed_key: row.feed_key,
                    publish_time: row.publish_time,
                    age,
                });
            }
        }

        let since = self.health.last_progress();
        let age = now - since;
        if age > self.threshold {
            error!(
                age_secs = age.num_seconds(),
                written_ever = self.health.last_successful_write().is_some(),
                "🚨 SYSTEM ALERT: no successful price writes since {}",
                since
            );
            alerts.push(StalenessAlert::NoRecentWrites { since, age });
        }

        if alerts.is_empty() {
            debug!("Staleness check passed");
        }
        alerts
    }

    pub async fn run(&self, mut shutdown: ShutdownListener) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        // First tick fires immediately; the pipeline has not had time to write yet
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = shutdown.wait() => break,
                _ = ticker.tick() => {
                    self.check(Utc::now()).await;
                }
            }
        }
        debug!("Staleness monitor stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::StoreError;
    use crate::types::{
        NewObservation, NewToken, ObservationSource, PriceObservation, PriceSnapshot,
        SnapshotSource, Token,
    };
    use async_trait::async_trait;
    use chrono::TimeZone;
    use mockall::mock;
    use rust_decimal::Decimal;
    use rust_decimal_macros::dec;

    mock! {
        Store {}

        #[async_trait]
        impl PriceStore for Store {
            async fn insert_observation(&self, observation: NewObservation) -> Result<PriceObservation, StoreError>;
            async fn latest_per_feed(&self) -> Result<Vec<PriceObservation>, StoreError>;
            async fn latest_for_feed(&self, feed_key: &str) -> Result<Option<PriceObservation>, StoreError>;
            async fn insert_snapshot(&self, token_id: u64, price: Decimal, source: SnapshotSource) -> Result<PriceSnapshot, StoreError>;
            async fn latest_snapshot(&self, token_id: u64) -> Result<Option<PriceSnapshot>, StoreError>;
            async fn tokens(&self) -> Result<Vec<Token>, StoreError>;
            async fn upsert_token(&self, token: NewToken) -> Result<Token, StoreError>;
        }
    }

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).unwrap()
    }

    fn row(feed: &str, publish_secs: i64) -> PriceObservation {
        PriceObservation {
            id: 1,
            feed_key: feed.to_string(),
            mantissa: dec!(100),
            conf: dec!(1),
            expo: 0,
            publish_time: at(publish_secs),
            created_at: at(publish_secs),
            source: ObservationSource::Pyth,
        }
    }

    fn monitor(store: MockStore, health: IngestHealth) -> StalenessMonitor {
        StalenessMonitor::new(
            Arc::new(store),
            Arc::new(health),
            ChronoDuration::minutes(5),
            Duration::from_secs(60),
        )
    }

    const NOW: i64 = 1_700_000_000;

    #[tokio::test]
    async fn stale_feed_raises_one_alert() {
        let mut store = MockStore::new();
        store
            .expect_latest_per_feed()
            .returning(|| Ok(vec![row("BTC/USD", NOW - 360), row("ETH/USD", NOW - 30)]));
        let health = IngestHealth::with_start(at(NOW - 600));
        health.record_write(at(NOW - 10));

        let alerts = monitor(store, health).check(at(NOW)).await;
        assert_eq!(
            alerts,
            vec![StalenessAlert::FeedStale {
                feed_key: "BTC/USD".to_string(),
                publish_time: at(NOW - 360),
                age: ChronoDuration::seconds(360),
            }]
        );
    }

    #[tokio::test]
    async fn threshold_is_exclusive() {
        let mut store = MockStore::new();
        store
            .expect_latest_per_feed()
            .returning(|| Ok(vec![row("SOL/USD", NOW - 300)]));
        let health = IngestHealth::with_start(at(NOW - 300));

        assert!(monitor(store, health).check(at(NOW)).await.is_empty());
    }

    #[tokio::test]
    async fn no_writes_since_start_raises_system_alert() {
        let mut store = MockStore::new();
        store.expect_latest_per_feed().returning(|| Ok(Vec::new()));
        let health = IngestHealth::with_start(at(NOW - 400));

        let alerts = monitor(store, health).check(at(NOW)).await;
        assert_eq!(
            alerts,
            vec![StalenessAlert::NoRecentWrites {
                since: at(NOW - 400),
                age: ChronoDuration::seconds(400),
            }]
        );
    }

    #[tokio::test]
    async fn old_last_write_raises_system_alert() {
        let mut store = MockStore::new();
        store.expect_latest_per_feed().returning(|| Ok(Vec::new()));
        let health = IngestHealth::with_start(at(NOW - 3600));
        health.record_write(at(NOW - 301));

        let alerts = monitor(store, health).check(at(NOW)).await;
        assert!(matches!(
            alerts.as_slice(),
            [StalenessAlert::NoRecentWrites { .. }]
        ));
    }

    #[tokio::test]
    async fn store_failure_skips_the_tick() {
        let mut store = MockStore::new();
        store.expect_latest_per_feed().returning(|| {
            Err(StoreError::Io(std::io::Error::new(
                std::io::ErrorKind::Other,
                "unreadable",
            )))
        });
        let health = IngestHealth::with_start(at(NOW - 3600));

        assert!(monitor(store, health).check(at(NOW)).await.is_empty());
    }

    #[tokio::test]
    async fn run_exits_on_shutdown() {
        let mut store = MockStore::new();
        store.expect_latest_per_feed().returning(|| Ok(Vec::new()));
        let monitor = monitor(store, IngestHealth::new());
        let shutdown = crate::shutdown::Shutdown::new();
        let listener = shutdown.listener();

        shutdown.trigger();
        tokio::time::timeout(Duration::from_secs(1), monitor.run(listener))
            .await
            .expect("monitor should stop");
    }
}
