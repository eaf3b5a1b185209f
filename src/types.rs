//! Core types used throughout the ingestion pipeline
//!
//! Defines raw price observations, tracked tokens and derived snapshots.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Largest scale `rust_decimal` can represent
const MAX_DECIMAL_SCALE: u32 = 28;

/// Adapter that produced an observation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ObservationSource {
    /// Long-lived substreams process (on-chain Pyth updates)
    Substreams,
    /// Pyth Hermes REST API
    Pyth,
    /// CoinGecko simple price API
    CoinGecko,
}

impl ObservationSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            ObservationSource::Substreams => "substreams",
            ObservationSource::Pyth => "pyth",
            ObservationSource::CoinGecko => "coingecko",
        }
    }

    /// Tag written on snapshots resolved from this source
    pub fn snapshot_source(&self) -> SnapshotSource {
        match self {
            ObservationSource::Substreams | ObservationSource::Pyth => SnapshotSource::Pyth,
            ObservationSource::CoinGecko => SnapshotSource::CoinGecko,
        }
    }

    /// Parse from string
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "substreams" => Some(ObservationSource::Substreams),
            "pyth" => Some(ObservationSource::Pyth),
            "coingecko" => Some(ObservationSource::CoinGecko),
            _ => None,
        }
    }
}

impl fmt::Display for ObservationSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Source tag carried by a snapshot row
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SnapshotSource {
    Pyth,
    CoinGecko,
    /// Synthetic placeholder, no observation existed
    Mock,
}

impl SnapshotSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            SnapshotSource::Pyth => "pyth",
            SnapshotSource::CoinGecko => "coingecko",
            SnapshotSource::Mock => "mock",
        }
    }
}

impl fmt::Display for SnapshotSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Raw observation as produced by an adapter, before the store assigns
/// an id and creation time.
#[derive(Debug, Clone, PartialEq)]
pub struct NewObservation {
    pub feed_key: String,
    pub mantissa: Decimal,
    pub conf: Decimal,
    pub expo: i32,
    pub publish_time: DateTime<Utc>,
    pub source: ObservationSource,
}

impl NewObservation {
    /// Actual price: mantissa × 10^expo
    pub fn decoded_price(&self) -> Option<Decimal> {
        decode_price(self.mantissa, self.expo)
    }
}

/// Persisted raw observation (append-only)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PriceObservation {
    pub id: u64,
    pub feed_key: String,
    pub mantissa: Decimal,
    pub conf: Decimal,
    pub expo: i32,
    pub publish_time: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub source: ObservationSource,
}

impl PriceObservation {
    /// Actual price: mantissa × 10^expo
    pub fn decoded_price(&self) -> Option<Decimal> {
        decode_price(self.mantissa, self.expo)
    }

    /// Confidence interval in price units
    pub fn decoded_conf(&self) -> Option<Decimal> {
        decode_price(self.conf, self.expo)
    }
}

/// Tracked asset
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Token {
    pub id: u64,
    pub name: String,
    pub symbol: String,
    pub decimals: u8,
    pub logo: Option<String>,
    pub contract_address: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Token {
    /// Feed key the rollup looks up for this token
    pub fn feed_key(&self) -> String {
        feed_key_for_symbol(&self.symbol)
    }
}

/// Token metadata for insert/update keyed by contract address
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct NewToken {
    pub name: String,
    pub symbol: String,
    pub decimals: u8,
    #[serde(default)]
    pub logo: Option<String>,
    pub contract_address: String,
}

impl NewToken {
    pub fn new(name: &str, symbol: &str, decimals: u8, contract_address: &str) -> Self {
        Self {
            name: name.to_string(),
            symbol: symbol.to_string(),
            decimals,
            logo: None,
            contract_address: contract_address.to_string(),
        }
    }
}

/// Derived per-token price row (append-only)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PriceSnapshot {
    pub id: u64,
    pub token_id: u64,
    pub price: Decimal,
    pub source: SnapshotSource,
    pub timestamp: DateTime<Utc>,
}

/// Tokens seeded into an empty store at bootstrap
pub fn default_tokens() -> Vec<NewToken> {
    vec![
        NewToken::new("Sei", "SEI", 18, "0x0000000000000000000000000000000000000000"),
        NewToken::new("Ethereum", "ETH", 18, "0x0000000000000000000000000000000000000001"),
        NewToken::new("Bitcoin", "BTC", 8, "0x0000000000000000000000000000000000000002"),
    ]
}

/// Best-effort mapping from a token symbol to its USD feed key.
///
/// The symbol is trimmed and uppercased first, so `" btc"` and `"BTC"` both
/// map to `"BTC/USD"`. Different tokens sharing a symbol share a feed.
pub fn feed_key_for_symbol(symbol: &str) -> String {
    format!("{}/USD", symbol.trim().to_uppercase())
}

/// mantissa × 10^expo, `None` on overflow or unrepresentable scale
pub fn decode_price(mantissa: Decimal, expo: i32) -> Option<Decimal> {
    if mantissa.is_zero() {
        return Some(Decimal::ZERO);
    }
    if expo >= 0 {
        let mut value = mantissa;
        for _ in 0..expo {
            value = value.checked_mul(Decimal::TEN)?;
        }
        Some(value)
    } else {
        let shift = expo.unsigned_abs();
        let scale = mantissa.scale().checked_add(shift)?;
        if scale <= MAX_DECIMAL_SCALE {
            let mut value = mantissa;
            value.set_scale(scale).ok()?;
            Some(value)
        } else {
            // Falls back to lossy division for extreme exponents
            let mut value = mantissa;
            for _ in 0..shift {
                if value.is_zero() {
                    break;
                }
                value = value.checked_div(Decimal::TEN)?;
            }
            Some(value)
        }
    }
}
