//! Price source implementations (substreams, Pyth Hermes, CoinGecko)

mod coingecko;
mod pyth;
mod substreams;

pub use coingecko::CoinGeckoSource;
pub use pyth::PythHermesSource;
pub use substreams::{LineOutcome, SubstreamsSource};

use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;

use crate::oracle::IngestSink;
use crate::persistence::StoreError;
use crate::shutdown::ShutdownListener;

/// Why a source invocation failed
#[derive(Debug, Error)]
pub enum SourceError {
    #[error("{adapter} request failed: {message}")]
    Http {
        adapter: &'static str,
        message: String,
    },

    #[error("{adapter} request timed out")]
    Timeout { adapter: &'static str },

    #[error("{adapter} returned HTTP {status}")]
    Status { adapter: &'static str, status: u16 },

    #[error("{adapter} payload rejected: {message}")]
    Payload {
        adapter: &'static str,
        message: String,
    },

    #[error("failed to launch {adapter}: {message}")]
    Spawn {
        adapter: &'static str,
        message: String,
    },

    #[error("{adapter} persistence fault after {written} rows: {error}")]
    Persistence {
        adapter: &'static str,
        written: usize,
        #[source]
        error: StoreError,
    },
}

impl SourceError {
    pub(crate) fn from_reqwest(adapter: &'static str, error: reqwest::Error) -> Self {
        if error.is_timeout() {
            SourceError::Timeout { adapter }
        } else {
            SourceError::Http {
                adapter,
                message: error.to_string(),
            }
        }
    }
}

/// A REST-style source polled on the ingestion schedule
#[async_trait]
pub trait PriceAdapter: Send + Sync {
    /// Get the source name
    fn name(&self) -> &'static str;

    /// Fetch the current batch and commit each observation through `sink`
    /// in parse order. Returns the number of rows written; zero means the
    /// upstream had nothing for us.
    async fn poll(&self, sink: &IngestSink) -> Result<usize, SourceError>;
}

/// A long-lived streaming source backed by an external process
#[async_trait]
pub trait StreamingSource: Send + Sync {
    /// Get the source name
    fn name(&self) -> &'static str;

    /// Whether the source is installed and its credential is configured
    async fn probe(&self) -> bool;

    /// Launch a fresh session
    async fn launch(&self) -> Result<Box<dyn StreamSession>, SourceError>;
}

/// One running streaming process
#[async_trait]
pub trait StreamSession: Send {
    /// Consume output until the process exits or shutdown fires
    async fn consume(self: Box<Self>, sink: &IngestSink, shutdown: ShutdownListener) -> StreamExit;
}

/// How a streaming session ended
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StreamExit {
    /// Process exit code, `None` when killed by a signal or not collected
    pub code: Option<i32>,
    pub written: usize,
    pub skipped: usize,
    /// Ended because shutdown was requested
    pub cancelled: bool,
}

/// Shared HTTP client with a bounded request timeout
pub fn http_client(timeout: Duration) -> reqwest::Result<reqwest::Client> {
    reqwest::Client::builder()
        .timeout(timeout)
        .connect_timeout(timeout)
        .user_agent(concat!("price-ingest/", env!("CARGO_PKG_VERSION")))
        .build()
}
