//! Fixed symbol table of tracked feeds
//!
//! Maps upstream identifiers (Pyth price feed ids, CoinGecko asset ids) to
//! the stable `"<BASE>/<QUOTE>"` feed keys stored with every observation.

/// One tracked feed and its identifiers on each upstream
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FeedSpec {
    pub feed_key: &'static str,
    /// Pyth price feed id, lowercase hex without `0x`
    pub pyth_id: &'static str,
    pub coingecko_id: &'static str,
}

pub const TRACKED_FEEDS: &[FeedSpec] = &[
    FeedSpec {
        feed_key: "BTC/USD",
        pyth_id: "e62df6c8b4a85fe1a67db44dc12de5db330f7ac66b72dc658afedf0f4a415b43",
        coingecko_id: "bitcoin",
    },
    FeedSpec {
        feed_key: "ETH/USD",
        pyth_id: "ff61491a931112ddf1bd8147cd1b641375f79f5825126d665480874634fd0ace",
        coingecko_id: "ethereum",
    },
    FeedSpec {
        feed_key: "SOL/USD",
        pyth_id: "cf64512283d61c8d5fce267db286c1f43fbf07abe5709a7e100c1b6ad801e5b8",
        coingecko_id: "solana",
    },
    FeedSpec {
        feed_key: "USDT/USD",
        pyth_id: "2b89b9dc8fdf9f34709a5b106b472f0f39bb6ca9ce04b0fd7f2e971688e2e53b",
        coingecko_id: "tether",
    },
    FeedSpec {
        feed_key: "SEI/USD",
        pyth_id: "a0cd63e975ef8c038755022616439c8fc15cb9d6c20ba2e8d9cafdefba7d1def",
        coingecko_id: "sei-network",
    },
];

/// Prefix for feeds missing from the symbol table
pub const PYTH_FALLBACK_PREFIX: &str = "PYTH:";

/// Lowercase 32-byte hex id without `0x`, `None` if not a valid feed id
pub fn normalize_pyth_id(raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    let stripped = trimmed
        .strip_prefix("0x")
        .or_else(|| trimmed.strip_prefix("0X"))
        .unwrap_or(trimmed);
    let bytes = hex::decode(stripped).ok()?;
    if bytes.len() != 32 {
        return None;
    }
    Some(hex::encode(bytes))
}

/// Feed key for a Pyth price id.
///
/// Already-readable keys (`"BTC/USD"`) pass through uppercased; known ids map
/// through the symbol table; anything else gets `PYTH:<first 8 chars>`.
pub fn feed_key_for_pyth_id(raw: &str) -> String {
    let trimmed = raw.trim();
    if trimmed.contains('/') {
        return trimmed.to_uppercase();
    }

    let id = normalize_pyth_id(trimmed).unwrap_or_else(|| trimmed.to_lowercase());
    match TRACKED_FEEDS.iter().find(|f| f.pyth_id == id) {
        Some(feed) => feed.feed_key.to_string(),
        None => {
            let short: String = id.chars().take(8).collect();
            format!("{}{}", PYTH_FALLBACK_PREFIX, short)
        }
    }
}

pub fn feed_key_for_coingecko_id(id: &str) -> Option<&'static str> {
    TRACKED_FEEDS
        .iter()
        .find(|f| f.coingecko_id.eq_ignore_ascii_case(id.trim()))
        .map(|f| f.feed_key)
}

pub fn pyth_ids() -> impl Iterator<Item = &'static str> {
    TRACKED_FEEDS.iter().map(|f| f.pyth_id)
}

pub fn coingecko_ids() -> impl Iterator<Item = &'static str> {
    TRACKED_FEEDS.iter().map(|f| f.coingecko_id)
}
