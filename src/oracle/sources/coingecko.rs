//! CoinGecko REST client
//!
//! Secondary polled source. Only USD quotes are used; prices are stored as
//! fixed-point mantissas at exponent -8 so they line up with Pyth rows.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::prelude::FromPrimitive;
use rust_decimal::Decimal;
use std::collections::BTreeMap;
use tracing::{debug, info, warn};

use crate::oracle::feeds::{coingecko_ids, feed_key_for_coingecko_id, TRACKED_FEEDS};
use crate::oracle::sources::{PriceAdapter, SourceError};
use crate::oracle::{epoch_to_utc, i64_from_json, IngestSink};
use crate::types::{NewObservation, ObservationSource};

const NAME: &str = "CoinGecko";
pub const COINGECKO_EXPO: i32 = -8;
const MANTISSA_SCALE: i64 = 100_000_000;
/// Confidence is reported as 1% of price
const CONF_DIVISOR: i64 = 100;

#[derive(Debug, Clone)]
pub struct CoinGeckoSource {
    client: reqwest::Client,
    base_url: String,
}

impl CoinGeckoSource {
    pub fn new(client: reqwest::Client, base_url: impl Into<String>) -> Self {
        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    pub fn endpoint(&self) -> String {
        let mut ids: Vec<&str> = coingecko_ids().collect();
        ids.sort_unstable();
        format!(
            "{}/simple/price?ids={}&vs_currencies=usd&include_last_updated_at=true",
            self.base_url,
            ids.join(",")
        )
    }

    fn to_observation(
        id: &str,
        entry: &serde_json::Value,
        fetched_at: DateTime<Utc>,
    ) -> Result<Option<NewObservation>, String> {
        let feed_key = match feed_key_for_coingecko_id(id) {
            Some(k) => k,
            None => return Ok(None),
        };

        let usd = entry["usd"]
            .as_f64()
            .ok_or_else(|| format!("missing usd quote for {}", id))?;
        if !usd.is_finite() || usd < 0.0 {
            return Err(format!("invalid usd quote {} for {}", usd, id));
        }

        let mantissa = Decimal::from_f64(usd)
            .and_then(|p| p.checked_mul(Decimal::from(MANTISSA_SCALE)))
            .map(|m| m.round())
            .ok_or_else(|| format!("usd quote out of range for {}", id))?;
        let conf = (mantissa / Decimal::from(CONF_DIVISOR)).round();
        let publish_time = i64_from_json(&entry["last_updated_at"])
            .and_then(epoch_to_utc)
            .unwrap_or(fetched_at);

        Ok(Some(NewObservation {
            feed_key: feed_key.to_string(),
            mantissa,
            conf,
            expo: COINGECKO_EXPO,
            publish_time,
            source: ObservationSource::CoinGecko,
        }))
    }

    /// Write every tracked asset present in the payload, in symbol-table order
    pub async fn ingest_prices(
        payload: &BTreeMap<String, serde_json::Value>,
        sink: &IngestSink,
        fetched_at: DateTime<Utc>,
    ) -> Result<usize, SourceError> {
        let mut written = 0;

        for feed in TRACKED_FEEDS {
            let entry = match payload.get(feed.coingecko_id) {
                Some(e) => e,
                None => continue,
            };

            let observation = match Self::to_observation(feed.coingecko_id, entry, fetched_at) {
                Ok(Some(o)) => o,
                Ok(None) => continue,
                Err(reason) => {
                    warn!(source = %NAME, reason = %reason, "Skipping malformed quote");
                    continue;
                }
            };

            sink.record(observation)
                .await
                .map_err(|error| SourceError::Persistence {
                    adapter: NAME,
                    written,
                    error,
                })?;
            written += 1;
            info!(source = %NAME, "Received CoinGecko price for {}: ${}", feed.feed_key, entry["usd"]);
        }

        let unknown = payload
            .keys()
            .filter(|id| feed_key_for_coingecko_id(id).is_none())
            .count();
        if unknown > 0 {
            debug!(source = %NAME, unknown, "Ignored untracked assets");
        }

        Ok(written)
    }
}

#[async_trait]
impl PriceAdapter for CoinGeckoSource {
    fn name(&self) -> &'static str {
        NAME
    }

    async fn poll(&self, sink: &IngestSink) -> Result<usize, SourceError> {
        let response = self
            .client
            .get(self.endpoint())
            .send()
            .await
            .map_err(|e| SourceError::from_reqwest(NAME, e))?;

        let status = response.status();
        if !status.is_success() {
            return Err(SourceError::Status {
                adapter: NAME,
                status: status.as_u16(),
            });
        }

        let body = response
            .text()
            .await
            .map_err(|e| SourceError::from_reqwest(NAME, e))?;
        let payload: BTreeMap<String, serde_json::Value> =
            serde_json::from_str(&body).map_err(|e| SourceError::Payload {
                adapter: NAME,
                message: e.to_string(),
            })?;

        Self::ingest_prices(&payload, sink, Utc::now()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::oracle::IngestHealth;
    use crate::persistence::{CsvPriceStore, PriceStore};
    use rust_decimal_macros::dec;
    use serde_json::json;
    use std::path::PathBuf;
    use std::sync::Arc;

    fn temp_data_dir(test_name: &str) -> PathBuf {
        std::env::temp_dir().join(format!(
            "price_ingest_coingecko_{}_{}",
            test_name,
            uuid::Uuid::new_v4()
        ))
    }

    fn sink_for(test_name: &str) -> (IngestSink, Arc<CsvPriceStore>) {
        let store = Arc::new(CsvPriceStore::open(temp_data_dir(test_name)).unwrap());
        let sink = IngestSink::new(store.clone(), Arc::new(IngestHealth::new()));
        (sink, store)
    }

    fn payload(value: serde_json::Value) -> BTreeMap<String, serde_json::Value> {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn endpoint_lists_every_tracked_asset() {
        let source = CoinGeckoSource::new(reqwest::Client::new(), "https://api.coingecko.com/api/v3");
        assert_eq!(
            source.endpoint(),
            "https://api.coingecko.com/api/v3/simple/price?ids=bitcoin,ethereum,sei-network,solana,tether&vs_currencies=usd&include_last_updated_at=true"
        );
    }

    #[tokio::test]
    async fn bitcoin_quote_becomes_fixed_point_row() {
        let (sink, store) = sink_for("btc");
        let body = payload(json!({ "bitcoin": { "usd": 50000, "last_updated_at": 1700000000 } }));

        let written = CoinGeckoSource::ingest_prices(&body, &sink, Utc::now()).await.unwrap();
        assert_eq!(written, 1);

        let row = store.latest_for_feed("BTC/USD").await.unwrap().unwrap();
        assert_eq!(row.mantissa, dec!(5000000000000));
        assert_eq!(row.conf, dec!(50000000000));
        assert_eq!(row.expo, -8);
        assert_eq!(row.publish_time.timestamp(), 1_700_000_000);
        assert_eq!(row.source, ObservationSource::CoinGecko);
        assert_eq!(row.decoded_price(), Some(dec!(50000)));
    }

    #[tokio::test]
    async fn fractional_quotes_round_to_mantissa() {
        let (sink, store) = sink_for("fraction");
        let body = payload(json!({ "tether": { "usd": 0.99987 }, "sei-network": { "usd": 0.4123 } }));

        let written = CoinGeckoSource::ingest_prices(&body, &sink, Utc::now()).await.unwrap();
        assert_eq!(written, 2);

        let usdt = store.latest_for_feed("USDT/USD").await.unwrap().unwrap();
        assert_eq!(usdt.mantissa, dec!(99987000));
        let sei = store.latest_for_feed("SEI/USD").await.unwrap().unwrap();
        assert_eq!(sei.mantissa, dec!(41230000));
    }

    #[tokio::test]
    async fn unknown_and_malformed_assets_are_skipped() {
        let (sink, store) = sink_for("skip");
        let body = payload(json!({
            "dogecoin": { "usd": 0.1 },
            "ethereum": { "eur": 2900 },
            "solana": { "usd": -4 },
            "bitcoin": { "usd": 64000.5 }
        }));

        let written = CoinGeckoSource::ingest_prices(&body, &sink, Utc::now()).await.unwrap();
        assert_eq!(written, 1);
        let feeds: Vec<String> = store
            .latest_per_feed()
            .await
            .unwrap()
            .into_iter()
            .map(|o| o.feed_key)
            .collect();
        assert_eq!(feeds, vec!["BTC/USD".to_string()]);
    }

    #[tokio::test]
    async fn missing_timestamp_uses_fetch_time() {
        let (sink, store) = sink_for("fetch_time");
        let fetched_at = Utc::now();
        let body = payload(json!({ "ethereum": { "usd": 3100 } }));

        CoinGeckoSource::ingest_prices(&body, &sink, fetched_at).await.unwrap();
        let row = store.latest_for_feed("ETH/USD").await.unwrap().unwrap();
        assert_eq!(row.publish_time.timestamp(), fetched_at.timestamp());
    }
}
