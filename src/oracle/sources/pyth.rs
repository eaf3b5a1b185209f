//! Pyth Hermes REST client
//!
//! Primary polled source. Fetches `latest_price_feeds` for every tracked
//! feed id and writes one observation per returned item.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Deserialize;
use tracing::{debug, info, warn};

use crate::oracle::feeds::{feed_key_for_pyth_id, pyth_ids};
use crate::oracle::sources::{PriceAdapter, SourceError};
use crate::oracle::{decimal_from_json, epoch_to_utc, i64_from_json, IngestSink};
use crate::types::{decode_price, NewObservation, ObservationSource};

const NAME: &str = "Pyth";

#[derive(Debug, Clone, Deserialize)]
struct HermesFeed {
    id: String,
    #[serde(default)]
    price: Option<HermesPrice>,
}

#[derive(Debug, Clone, Deserialize)]
struct HermesPrice {
    price: serde_json::Value,
    #[serde(default)]
    conf: serde_json::Value,
    expo: serde_json::Value,
    #[serde(default)]
    publish_time: serde_json::Value,
}

#[derive(Debug, Clone)]
pub struct PythHermesSource {
    client: reqwest::Client,
    base_url: String,
}

impl PythHermesSource {
    pub fn new(client: reqwest::Client, base_url: impl Into<String>) -> Self {
        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    pub fn endpoint(&self) -> String {
        format!("{}/api/latest_price_feeds", self.base_url)
    }

    /// Normalize one Hermes item. `Ok(None)` means the item carried no price.
    fn parse_item(
        item: serde_json::Value,
        fetched_at: DateTime<Utc>,
    ) -> Result<Option<NewObservation>, String> {
        let feed: HermesFeed =
            serde_json::from_value(item).map_err(|e| format!("unexpected shape: {}", e))?;
        let price = match feed.price {
            Some(p) => p,
            None => return Ok(None),
        };

        let mantissa = decimal_from_json(&price.price)
            .ok_or_else(|| format!("non-numeric price for {}", feed.id))?;
        let expo = i64_from_json(&price.expo)
            .and_then(|e| i32::try_from(e).ok())
            .ok_or_else(|| format!("non-numeric expo for {}", feed.id))?;
        let conf = decimal_from_json(&price.conf).unwrap_or(Decimal::ZERO);
        let publish_time = i64_from_json(&price.publish_time)
            .and_then(epoch_to_utc)
            .unwrap_or(fetched_at);

        Ok(Some(NewObservation {
            feed_key: feed_key_for_pyth_id(&feed.id),
            mantissa,
            conf,
            expo,
            publish_time,
            source: ObservationSource::Pyth,
        }))
    }

    /// Write every usable item in payload order
    pub async fn ingest_feeds(
        items: Vec<serde_json::Value>,
        sink: &IngestSink,
        fetched_at: DateTime<Utc>,
    ) -> Result<usize, SourceError> {
        let mut written = 0;

        for item in items {
            let observation = match Self::parse_item(item, fetched_at) {
                Ok(Some(o)) => o,
                Ok(None) => continue,
                Err(reason) => {
                    warn!(source = %NAME, reason = %reason, "Skipping malformed feed item");
                    continue;
                }
            };

            let feed = observation.feed_key.clone();
            let display = decode_price(observation.mantissa, observation.expo);
            sink.record(observation)
                .await
                .map_err(|error| SourceError::Persistence {
                    adapter: NAME,
                    written,
                    error,
                })?;
            written += 1;

            match display {
                Some(price) => info!(source = %NAME, "Received Pyth price for {}: ${}", feed, price),
                None => debug!(source = %NAME, feed = %feed, "Received Pyth price (undecodable)"),
            }
        }

        Ok(written)
    }
}

#[async_trait]
impl PriceAdapter for PythHermesSource {
    fn name(&self) -> &'static str {
        NAME
    }

    async fn poll(&self, sink: &IngestSink) -> Result<usize, SourceError> {
        let query: Vec<(&str, &str)> = pyth_ids().map(|id| ("ids[]", id)).collect();

        let response = self
            .client
            .get(self.endpoint())
            .query(&query)
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
        let items: Vec<serde_json::Value> =
            serde_json::from_str(&body).map_err(|e| SourceError::Payload {
                adapter: NAME,
                message: e.to_string(),
            })?;

        debug!(source = %NAME, items = items.len(), "Fetched latest price feeds");
        Self::ingest_feeds(items, sink, Utc::now()).await
    }
}
