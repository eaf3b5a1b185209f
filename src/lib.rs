//! price-ingest library
//!
//! Multi-source oracle price ingestion: substreams streaming with Pyth Hermes
//! and CoinGecko REST fallback, a CSV-backed price store, staleness alerts
//! and periodic per-token snapshots.

pub mod config;
pub mod monitor;
pub mod oracle;
pub mod persistence;
pub mod rollup;
pub mod shutdown;
pub mod types;
